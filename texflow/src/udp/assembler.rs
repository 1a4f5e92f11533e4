//! Reassembly of out-of-order UDP packets into a contiguous prefix.
//!
//! Packet 0 is the header; it announces the total packet count and file
//! size and carries the first payload bytes. Data packets may arrive in
//! any order and are buffered sparsely; `last_packet` tracks the end of
//! the contiguous run from `first_packet`, and only that run is ever
//! delivered. The deliverable prefix never shrinks.
//!
//! A worker that already holds a cached prefix seeds the assembler from
//! it so the server is asked only for the remaining packets.

use super::protocol::{FIRST_PACKET_SIZE, MAX_IMG_PACKET_SIZE};
use bytes::Bytes;
use thiserror::Error;

/// Rejected inbound packets.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    /// Packet index is at or past the announced total.
    #[error("packet index {index} out of range (total {total})")]
    OutOfRange {
        /// Offending index.
        index: usize,
        /// Announced total packet count.
        total: usize,
    },

    /// A non-terminal data packet with the wrong payload size.
    #[error("packet {index} has payload size {size}, expected {MAX_IMG_PACKET_SIZE}")]
    WrongSize {
        /// Offending index.
        index: usize,
        /// Actual payload size.
        size: usize,
    },

    /// A payload already exists for this index.
    #[error("duplicate packet {index}")]
    Duplicate {
        /// Offending index.
        index: usize,
    },

    /// A second header arrived.
    #[error("duplicate header")]
    DuplicateHeader,
}

/// Outcome of seeding the assembler from a cached prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedOutcome {
    /// The cached prefix lies on a packet boundary; resume after it.
    Seeded,
    /// The cached prefix does not tile into packets. The cache entry is
    /// damaged and must be dropped.
    CorruptCache,
    /// The cached prefix has no known total (it was fetched over HTTP),
    /// so the header must be refetched from scratch.
    UnknownTotal,
}

/// Per-worker packet reassembly state.
#[derive(Debug, Default)]
pub struct PacketAssembler {
    packets: Vec<Option<Bytes>>,
    first_packet: usize,
    last_packet: Option<usize>,
    total_packets: usize,
}

impl PacketAssembler {
    /// Creates an empty assembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops all buffered packets and header knowledge.
    pub fn clear(&mut self) {
        self.packets.clear();
        self.first_packet = 0;
        self.last_packet = None;
        self.total_packets = 0;
    }

    /// True once the header (or a cached seed) has established position.
    #[inline]
    pub fn has_header(&self) -> bool {
        self.last_packet.is_some()
    }

    /// Announced total packet count; zero until the header arrives.
    #[inline]
    pub fn total_packets(&self) -> usize {
        self.total_packets
    }

    /// Index of the first packet still wanted from the network.
    #[inline]
    pub fn next_packet(&self) -> u32 {
        self.last_packet.map_or(0, |l| l as u32 + 1)
    }

    /// End of the contiguous run, if any packet has landed.
    #[inline]
    pub fn last_packet(&self) -> Option<usize> {
        self.last_packet
    }

    /// True once every announced packet is buffered.
    #[inline]
    pub fn have_all(&self) -> bool {
        self.total_packets > 0
            && self.last_packet.is_some_and(|l| l + 1 >= self.total_packets)
    }

    /// Accepts the header packet: the total count and the first payload.
    pub fn insert_header(&mut self, total_packets: u16, payload: Bytes) -> Result<(), PacketError> {
        if self.has_header() {
            return Err(PacketError::DuplicateHeader);
        }
        self.total_packets = total_packets as usize;
        self.insert(0, payload)
    }

    /// Accepts a data packet. Non-terminal packets must carry exactly
    /// [`MAX_IMG_PACKET_SIZE`] bytes; duplicates and out-of-range indices
    /// are rejected.
    pub fn insert(&mut self, index: usize, payload: Bytes) -> Result<(), PacketError> {
        if index >= self.total_packets {
            return Err(PacketError::OutOfRange {
                index,
                total: self.total_packets,
            });
        }
        if index > 0 && index + 1 < self.total_packets && payload.len() != MAX_IMG_PACKET_SIZE {
            return Err(PacketError::WrongSize {
                index,
                size: payload.len(),
            });
        }
        if index >= self.packets.len() {
            self.packets.resize(index + 1, None);
        } else if self.packets[index].is_some() {
            return Err(PacketError::Duplicate { index });
        }
        self.packets[index] = Some(payload);

        let mut next = self.last_packet.map_or(0, |l| l + 1);
        while next < self.packets.len() && self.packets[next].is_some() {
            self.last_packet = Some(next);
            next += 1;
        }
        Ok(())
    }

    /// Positions the assembler after a cached prefix of `cached_len`
    /// bytes, so only the missing tail is requested.
    pub fn seed_from_cached(
        &mut self,
        cached_len: usize,
        known_file_size: Option<usize>,
    ) -> SeedOutcome {
        if cached_len == 0 {
            return SeedOutcome::Seeded;
        }
        // C-style truncating division: a short prefix yields first = 1
        // and fails the boundary check below.
        let first = ((cached_len as i64 - FIRST_PACKET_SIZE as i64) / MAX_IMG_PACKET_SIZE as i64
            + 1) as i64;
        let expected = FIRST_PACKET_SIZE as i64 + (first - 1) * MAX_IMG_PACKET_SIZE as i64;
        if first < 1 || expected != cached_len as i64 {
            return SeedOutcome::CorruptCache;
        }
        let Some(file_size) = known_file_size.filter(|&fs| fs > 0) else {
            return SeedOutcome::UnknownTotal;
        };
        let first = first as usize;
        self.first_packet = first;
        self.last_packet = Some(first - 1);
        self.total_packets = (file_size - FIRST_PACKET_SIZE + MAX_IMG_PACKET_SIZE - 1)
            / MAX_IMG_PACKET_SIZE
            + 1;
        SeedOutcome::Seeded
    }

    /// Returns `prefix ++ packets[first..=last]` once enough contiguous
    /// data exists to satisfy `requested_size` (or everything arrived),
    /// together with the have-all flag. The returned length never
    /// decreases across calls.
    pub fn deliverable_prefix(
        &self,
        prefix: &[u8],
        requested_size: usize,
    ) -> Option<(Vec<u8>, bool)> {
        let last = self.last_packet?;
        if last < self.first_packet && self.first_packet > 0 {
            return None;
        }
        let run = &self.packets[self.first_packet..=last];
        let buffer_size: usize = prefix.len()
            + run
                .iter()
                .map(|p| p.as_ref().map_or(0, |b| b.len()))
                .sum::<usize>();
        let have_all = self.have_all();
        if buffer_size < requested_size && !have_all {
            return None;
        }
        let mut out = Vec::with_capacity(buffer_size);
        out.extend_from_slice(prefix);
        for packet in run {
            // The contiguous run has no holes.
            out.extend_from_slice(packet.as_ref().expect("hole in contiguous packet run"));
        }
        Some((out, have_all))
    }
}
