//! Fixed-layout frame header.
//!
//! ```text
//! ┌───────────────┬───────────────┬───────────────┬──────────────┐
//! │ sequence u64  │ pts u64 (ns)  │ duration u64  │ length u32   │
//! │ little-endian │ little-endian │ little-endian │ little-endian│
//! └───────────────┴───────────────┴───────────────┴──────────────┘
//! ```
//!
//! Every header with a non-zero length travels together with exactly one
//! file descriptor in `SCM_RIGHTS` ancillary data. A zero length is the
//! end-of-stream marker and carries no descriptor.

/// Size of an encoded header in bytes.
pub const HEADER_LEN: usize = 28;

/// Header of one frame message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub sequence: u64,
    pub pts: u64,
    pub duration: u64,
    pub length: u32,
}

impl FrameHeader {
    /// The end-of-stream marker.
    pub fn eos() -> Self {
        Self {
            sequence: 0,
            pts: 0,
            duration: 0,
            length: 0,
        }
    }

    pub fn is_eos(&self) -> bool {
        self.length == 0
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..8].copy_from_slice(&self.sequence.to_le_bytes());
        buf[8..16].copy_from_slice(&self.pts.to_le_bytes());
        buf[16..24].copy_from_slice(&self.duration.to_le_bytes());
        buf[24..28].copy_from_slice(&self.length.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; HEADER_LEN]) -> Self {
        let u64_at = |offset: usize| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&buf[offset..offset + 8]);
            u64::from_le_bytes(bytes)
        };
        let mut length = [0u8; 4];
        length.copy_from_slice(&buf[24..28]);
        Self {
            sequence: u64_at(0),
            pts: u64_at(8),
            duration: u64_at(16),
            length: u32::from_le_bytes(length),
        }
    }
}
