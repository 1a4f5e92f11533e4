//! Image codec collaborator interface.
//!
//! The codec itself lives outside this crate; the pipeline only needs to
//! submit compressed bytes and receive raw pixels back. The [`Codec`]
//! trait mirrors that seam: an async `decode` (the collaborator runs its
//! own decode pool) plus a synchronous size estimator used to convert a
//! desired discard level into a byte-prefix length.

use crate::asset::MAX_DISCARD_LEVEL;
use bytes::Bytes;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// Compression format of an asset stream.
///
/// The wire protocol identifies codecs by a one-byte tag; URLs identify
/// them by file extension. Progressive (partial-prefix) decoding is only
/// supported for JPEG-2000; everything else must be fetched whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecKind {
    /// JPEG-2000 codestream, the native progressive format.
    J2c,
    /// Baseline JPEG.
    Jpeg,
    /// PNG.
    Png,
    /// Truevision TGA.
    Tga,
    /// Windows BMP.
    Bmp,
}

impl CodecKind {
    /// Maps a lowercase file extension to a codec, if recognized.
    pub fn from_extension(ext: &str) -> Option<CodecKind> {
        match ext {
            "j2c" | "j2k" | "jp2" => Some(CodecKind::J2c),
            "jpg" | "jpeg" => Some(CodecKind::Jpeg),
            "png" => Some(CodecKind::Png),
            "tga" => Some(CodecKind::Tga),
            "bmp" => Some(CodecKind::Bmp),
            _ => None,
        }
    }

    /// Extracts the codec from a URL's path extension, if any.
    pub fn from_url(url: &str) -> Option<CodecKind> {
        let path = url.split(['?', '#']).next().unwrap_or(url);
        let ext = path.rsplit('/').next()?.rsplit_once('.')?.1;
        Self::from_extension(&ext.to_ascii_lowercase())
    }

    /// Maps the protocol's one-byte codec tag.
    pub fn from_tag(tag: u8) -> Option<CodecKind> {
        match tag {
            1 => Some(CodecKind::Bmp),
            2 => Some(CodecKind::Tga),
            3 => Some(CodecKind::Jpeg),
            4 => Some(CodecKind::Png),
            5 => Some(CodecKind::J2c),
            _ => None,
        }
    }

    /// Returns the protocol tag for this codec.
    pub fn tag(self) -> u8 {
        match self {
            CodecKind::Bmp => 1,
            CodecKind::Tga => 2,
            CodecKind::Jpeg => 3,
            CodecKind::Png => 4,
            CodecKind::J2c => 5,
        }
    }

    /// True if a prefix of the stream can be decoded at a coarser discard.
    pub fn is_progressive(self) -> bool {
        matches!(self, CodecKind::J2c)
    }
}

/// Decoded pixel data handed to the rendering side.
///
/// The buffer is shared and immutable; the pipeline keeps its own `Arc`
/// until the worker is deleted, so callers may hold the image as long as
/// they like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawImage {
    /// Width in pixels at the decoded discard level.
    pub width: u32,
    /// Height in pixels at the decoded discard level.
    pub height: u32,
    /// Color components per pixel (1, 3 or 4).
    pub components: u8,
    /// Tightly packed pixel rows, `width * height * components` bytes.
    pub data: Bytes,
}

impl RawImage {
    /// Creates a raw image, asserting the buffer matches the dimensions.
    pub fn new(width: u32, height: u32, components: u8, data: Bytes) -> Self {
        debug_assert_eq!(
            data.len(),
            width as usize * height as usize * components as usize
        );
        Self {
            width,
            height,
            components,
            data,
        }
    }

    /// Size of the pixel buffer in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True when the image holds no pixels.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Successful decode output.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    /// The color image.
    pub raw: Arc<RawImage>,
    /// Optional auxiliary (alpha/mask) channel, when requested and present.
    pub aux: Option<Arc<RawImage>>,
    /// The discard level actually achieved from the supplied bytes.
    pub discard: u8,
}

/// Errors reported by the codec collaborator.
#[derive(Debug, Clone, Error)]
pub enum DecodeError {
    /// The stream is damaged or not of the claimed format.
    #[error("corrupt {kind:?} stream: {detail}")]
    Corrupt {
        /// Claimed codec of the stream.
        kind: CodecKind,
        /// Codec-specific diagnostic.
        detail: String,
    },

    /// Not enough bytes to reach the requested discard level.
    #[error("truncated stream: {have} bytes cannot reach discard {want}")]
    Truncated {
        /// Bytes available.
        have: usize,
        /// Discard level requested.
        want: u8,
    },

    /// The codec does not handle this format.
    #[error("unsupported codec {0:?}")]
    Unsupported(CodecKind),
}

/// Interface to the external image codec.
///
/// Implementations run decoding on their own pool; `decode` completes when
/// pixels are ready. `encoded_size` is the pure arithmetic used to turn a
/// `(dimensions, discard)` pair into a compressed-prefix byte count and
/// must not block.
pub trait Codec: Send + Sync + 'static {
    /// Decodes `data` (a prefix of the compressed stream) targeting
    /// `discard`. The codec may achieve a coarser level than asked for if
    /// the prefix is short; the achieved level comes back in the result.
    fn decode(
        &self,
        data: Bytes,
        kind: CodecKind,
        discard: u8,
        need_aux: bool,
    ) -> impl Future<Output = Result<DecodedImage, DecodeError>> + Send;

    /// Number of compressed bytes needed to decode a `width` x `height` x
    /// `components` image at `discard`.
    fn encoded_size(&self, width: u32, height: u32, components: u8, discard: u8) -> usize;
}

/// Clamps a discard level to the valid range.
#[inline]
pub fn clamp_discard(discard: u8) -> u8 {
    discard.min(MAX_DISCARD_LEVEL)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_extension() {
        assert_eq!(CodecKind::from_extension("j2c"), Some(CodecKind::J2c));
        assert_eq!(CodecKind::from_extension("jp2"), Some(CodecKind::J2c));
        assert_eq!(CodecKind::from_extension("jpeg"), Some(CodecKind::Jpeg));
        assert_eq!(CodecKind::from_extension("png"), Some(CodecKind::Png));
        assert_eq!(CodecKind::from_extension("gif"), None);
        assert_eq!(CodecKind::from_extension(""), None);
    }

    #[test]
    fn test_kind_from_url() {
        assert_eq!(
            CodecKind::from_url("http://assets.example.com/textures/grass.j2c"),
            Some(CodecKind::J2c)
        );
        assert_eq!(
            CodecKind::from_url("http://assets.example.com/map.PNG?v=2"),
            Some(CodecKind::Png)
        );
        assert_eq!(CodecKind::from_url("http://assets.example.com/?asset_id=abc"), None);
        assert_eq!(CodecKind::from_url("http://assets.example.com/no-extension"), None);
    }

    #[test]
    fn test_tag_roundtrip() {
        for kind in [
            CodecKind::J2c,
            CodecKind::Jpeg,
            CodecKind::Png,
            CodecKind::Tga,
            CodecKind::Bmp,
        ] {
            assert_eq!(CodecKind::from_tag(kind.tag()), Some(kind));
        }
        assert_eq!(CodecKind::from_tag(0), None);
        assert_eq!(CodecKind::from_tag(200), None);
    }

    #[test]
    fn test_only_j2c_is_progressive() {
        assert!(CodecKind::J2c.is_progressive());
        assert!(!CodecKind::Png.is_progressive());
        assert!(!CodecKind::Jpeg.is_progressive());
    }

    #[test]
    fn test_raw_image_len() {
        let img = RawImage::new(4, 2, 3, Bytes::from(vec![0u8; 24]));
        assert_eq!(img.len(), 24);
        assert!(!img.is_empty());
    }

    #[test]
    fn test_clamp_discard() {
        assert_eq!(clamp_discard(0), 0);
        assert_eq!(clamp_discard(MAX_DISCARD_LEVEL), MAX_DISCARD_LEVEL);
        assert_eq!(clamp_discard(MAX_DISCARD_LEVEL + 3), MAX_DISCARD_LEVEL);
    }
}
