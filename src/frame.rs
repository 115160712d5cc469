//! The frame-type contract and a bundled synthetic frame.
//!
//! Every component of the pipeline is generic over a [`FrameType`]: the
//! fixed-layout element a detector link produces. A frame may aggregate
//! several sub-frames, each carrying its own timestamp at a nominal constant
//! tick gap; the request handler slices an element into sub-frames when a
//! readout window covers it only partially.

use crate::types::{FragmentType, Subsystem, Timestamp};

/// Capability set required of a raw detector frame.
///
/// Implementations are plain-old-data: `ELEMENT_SIZE` bytes reproduce the
/// wire layout, and the ordering is total with the timestamp as the primary
/// key (ties broken by any secondary key the type carries).
pub trait FrameType: Clone + Ord + Send + Sync + 'static {
    /// Subsystem of source identifiers produced by this frame type.
    const SUBSYSTEM: Subsystem;
    /// Fragment-type tag stamped into fragment headers.
    const FRAGMENT_TYPE: FragmentType;
    /// Nominal DTS-tick gap between two adjacent sub-frames.
    const EXPECTED_TICK_DIFFERENCE: u64;
    /// Number of sub-frames aggregated into one element.
    const FRAMES_PER_ELEMENT: usize;
    /// Size of one sub-frame in bytes.
    const FRAME_SIZE: usize;
    /// Size of one whole element in bytes (the replay chunk size).
    const ELEMENT_SIZE: usize;

    /// Timestamp of the first sub-frame. Strictly monotonic across
    /// successive elements on a healthy link.
    fn timestamp(&self) -> Timestamp;

    /// Rewrites the element's timestamps starting at `ts`. Used only during
    /// synthetic construction and for lookup keys.
    fn set_timestamp(&mut self, ts: Timestamp);

    /// Number of sub-frames actually aggregated (≥ 1).
    fn num_frames(&self) -> usize {
        Self::FRAMES_PER_ELEMENT
    }

    /// Bytes of this element that participate in a fragment.
    fn payload(&self) -> &[u8];

    /// Size of [`FrameType::payload`] in bytes.
    fn payload_size(&self) -> usize {
        self.payload().len()
    }

    /// Timestamp of the sub-frame at `index`.
    fn subframe_timestamp(&self, index: usize) -> Timestamp {
        self.timestamp() + index as u64 * Self::EXPECTED_TICK_DIFFERENCE
    }

    /// Payload bytes of the sub-frame at `index`.
    fn subframe_payload(&self, index: usize) -> &[u8];

    /// Reconstructs an element from one `ELEMENT_SIZE` chunk of a raw dump.
    /// Returns `None` when the chunk is the wrong size.
    fn from_bytes(bytes: &[u8]) -> Option<Self>;

    /// A synthetic element usable as an ordered-lookup key: all fields
    /// zeroed except the timestamp, so it orders before any real element
    /// with the same timestamp.
    fn lookup_key(ts: Timestamp) -> Self;

    /// Nominal timestamp gap between adjacent elements.
    fn stride() -> u64 {
        Self::EXPECTED_TICK_DIFFERENCE * Self::FRAMES_PER_ELEMENT as u64
    }

    /// Ticks covered by this element.
    fn span(&self) -> u64 {
        self.num_frames() as u64 * Self::EXPECTED_TICK_DIFFERENCE
    }
}

/// Byte size of a [`DummyFrame`] data section.
pub const DUMMY_FRAME_DATA_SIZE: usize = 1024;
/// Byte size of a whole [`DummyFrame`] element: 16-byte key header + data.
pub const DUMMY_FRAME_ELEMENT_SIZE: usize = 16 + DUMMY_FRAME_DATA_SIZE;

/// Synthetic frame bundled for emulation and tests: a little-endian
/// `(timestamp, sequence)` key header followed by 1 KiB of data, one
/// sub-frame per element, 1000 ticks between elements.
///
/// The in-memory representation is exactly the wire layout, so the latency
/// buffer region doubles as the recording source.
#[derive(Clone)]
pub struct DummyFrame {
    bytes: [u8; DUMMY_FRAME_ELEMENT_SIZE],
}

impl DummyFrame {
    pub fn new(timestamp: Timestamp, sequence: u64) -> Self {
        let mut frame = Self {
            bytes: [0u8; DUMMY_FRAME_ELEMENT_SIZE],
        };
        frame.set_timestamp(timestamp);
        frame.set_sequence(sequence);
        frame
    }

    pub fn sequence(&self) -> u64 {
        u64::from_le_bytes(self.bytes[8..16].try_into().expect("fixed-size slice"))
    }

    pub fn set_sequence(&mut self, sequence: u64) {
        self.bytes[8..16].copy_from_slice(&sequence.to_le_bytes());
    }

    /// Mutable access to the data section (after the key header).
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.bytes[16..]
    }
}

impl PartialEq for DummyFrame {
    fn eq(&self, other: &Self) -> bool {
        (self.timestamp(), self.sequence()) == (other.timestamp(), other.sequence())
    }
}

impl Eq for DummyFrame {}

impl PartialOrd for DummyFrame {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DummyFrame {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.timestamp(), self.sequence()).cmp(&(other.timestamp(), other.sequence()))
    }
}

impl std::fmt::Debug for DummyFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DummyFrame")
            .field("timestamp", &self.timestamp())
            .field("sequence", &self.sequence())
            .finish()
    }
}

impl FrameType for DummyFrame {
    const SUBSYSTEM: Subsystem = Subsystem::DetectorReadout;
    const FRAGMENT_TYPE: FragmentType = FragmentType::DetectorData;
    const EXPECTED_TICK_DIFFERENCE: u64 = 1_000;
    const FRAMES_PER_ELEMENT: usize = 1;
    const FRAME_SIZE: usize = DUMMY_FRAME_ELEMENT_SIZE;
    const ELEMENT_SIZE: usize = DUMMY_FRAME_ELEMENT_SIZE;

    fn timestamp(&self) -> Timestamp {
        u64::from_le_bytes(self.bytes[0..8].try_into().expect("fixed-size slice"))
    }

    fn set_timestamp(&mut self, ts: Timestamp) {
        self.bytes[0..8].copy_from_slice(&ts.to_le_bytes());
    }

    fn payload(&self) -> &[u8] {
        &self.bytes
    }

    fn subframe_payload(&self, _index: usize) -> &[u8] {
        &self.bytes
    }

    fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::ELEMENT_SIZE {
            return None;
        }
        let mut frame = Self {
            bytes: [0u8; DUMMY_FRAME_ELEMENT_SIZE],
        };
        frame.bytes.copy_from_slice(bytes);
        Some(frame)
    }

    fn lookup_key(ts: Timestamp) -> Self {
        Self::new(ts, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dummy_frame_round_trip() {
        let mut frame = DummyFrame::new(123_000, 7);
        frame.data_mut()[0] = 0xAB;
        let parsed = DummyFrame::from_bytes(frame.payload()).unwrap();
        assert_eq!(parsed.timestamp(), 123_000);
        assert_eq!(parsed.sequence(), 7);
        assert_eq!(parsed.payload()[16], 0xAB);
    }

    #[test]
    fn test_from_bytes_rejects_short_chunk() {
        assert!(DummyFrame::from_bytes(&[0u8; 8]).is_none());
    }

    #[test]
    fn test_ordering_is_timestamp_then_sequence() {
        let a = DummyFrame::new(1_000, 5);
        let b = DummyFrame::new(2_000, 0);
        let c = DummyFrame::new(2_000, 1);
        assert!(a < b);
        assert!(b < c);
        assert!(DummyFrame::lookup_key(2_000) <= b);
    }

    #[test]
    fn test_stride_and_span() {
        let frame = DummyFrame::new(0, 0);
        assert_eq!(DummyFrame::stride(), 1_000);
        assert_eq!(frame.span(), 1_000);
        assert_eq!(frame.subframe_timestamp(0), 0);
    }

    #[test]
    fn test_element_size_matches_memory_layout() {
        assert_eq!(
            std::mem::size_of::<DummyFrame>(),
            DummyFrame::ELEMENT_SIZE,
            "recording assumes the element bytes are the in-memory layout"
        );
    }
}
