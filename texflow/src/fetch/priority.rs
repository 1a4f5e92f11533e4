//! Work-priority arithmetic.
//!
//! The UI hands each asset a float priority; the engine's run queue
//! orders workers by an integer derived from it. The float scales into
//! the low bits; the high bit marks workers that need immediate
//! attention (a completion just landed, or the caller re-requested).

/// Mask of the scaled-priority bits.
pub const PRIORITY_LOW_BITS: u32 = 0x0FFF_FFFF;

/// Flag bit for workers needing immediate attention.
pub const PRIORITY_IMMEDIATE: u32 = 0x1000_0000;

/// Fraction of the current priority a change must exceed to trigger a
/// re-sort. Suppresses flapping from noisy priority sources.
pub const PRIORITY_HYSTERESIS: f32 = 0.05;

/// Scales an image priority into the work queue's integer range.
pub fn work_priority(image_priority: f32, max_image_priority: f32) -> u32 {
    let scale = PRIORITY_LOW_BITS as f32 / max_image_priority.max(1.0);
    let scaled = image_priority.max(0.0) * scale;
    (scaled as u32).min(PRIORITY_LOW_BITS)
}

/// True when a proposed priority differs enough from the current one to
/// be worth acting on.
pub fn exceeds_hysteresis(current: f32, proposed: f32) -> bool {
    (proposed - current).abs() > current * PRIORITY_HYSTERESIS
}
