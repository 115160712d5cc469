//! Common message and identifier types exchanged with the trigger/dataflow
//! plane: source identifiers, data requests, fragments and time-sync beacons.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Detector-timing-system timestamp, in DTS ticks.
pub type Timestamp = u64;

/// Run number handed down by run control at `start`.
pub type RunNumber = u32;

/// Trigger number assigned by the trigger plane.
pub type TriggerNumber = u64;

/// Sequence number of a request within one trigger.
pub type SequenceNumber = u16;

/// DTS ticks per millisecond (62.5 MHz timing clock).
pub const DTS_TICKS_PER_MS: u64 = 62_500;

/// Subsystem tag of a source identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Subsystem {
    Unknown,
    DetectorReadout,
    HwSignalsInterface,
    Trigger,
}

impl Default for Subsystem {
    fn default() -> Self {
        Self::Unknown
    }
}

/// Identifies one data-handling link: `(subsystem, id)`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SourceId {
    pub subsystem: Subsystem,
    pub id: u32,
}

impl SourceId {
    pub fn new(subsystem: Subsystem, id: u32) -> Self {
        Self { subsystem, id }
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}_{}", self.subsystem, self.id)
    }
}

/// Fragment type tag carried in the fragment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FragmentType {
    Unknown,
    DetectorData,
    TriggerPrimitive,
}

impl Default for FragmentType {
    fn default() -> Self {
        Self::Unknown
    }
}

/// The readout window of a data request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestInfo {
    /// The link the request targets.
    pub component: SourceId,
    /// Inclusive start of the requested window.
    pub window_begin: Timestamp,
    /// Exclusive end of the requested window.
    pub window_end: Timestamp,
}

/// A time-windowed data request issued by the trigger/dataflow plane.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRequest {
    pub trigger_number: TriggerNumber,
    pub sequence_number: SequenceNumber,
    pub run_number: RunNumber,
    pub trigger_timestamp: Timestamp,
    pub request_information: RequestInfo,
    /// Name of the connection the resulting fragment must be sent to.
    pub data_destination: String,
}

/// Fragment-header error bits emitted by this subsystem. Other bits are the
/// province of upstream producers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FragmentErrorBit {
    /// No data was found in the requested window.
    DataNotFound = 0,
    /// The window extends past the data held in the buffer.
    Incomplete = 1,
}

/// Header of a [`Fragment`], fields copied from the originating request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentHeader {
    pub trigger_number: TriggerNumber,
    pub trigger_timestamp: Timestamp,
    pub window_begin: Timestamp,
    pub window_end: Timestamp,
    pub run_number: RunNumber,
    pub sequence_number: SequenceNumber,
    pub fragment_type: FragmentType,
    pub detector_id: u16,
    pub element_id: SourceId,
    pub error_bits: u32,
}

impl FragmentHeader {
    /// Builds a header from a request, stamping the link identity.
    pub fn from_request(
        request: &DataRequest,
        fragment_type: FragmentType,
        detector_id: u16,
        element_id: SourceId,
    ) -> Self {
        Self {
            trigger_number: request.trigger_number,
            trigger_timestamp: request.trigger_timestamp,
            window_begin: request.request_information.window_begin,
            window_end: request.request_information.window_end,
            run_number: request.run_number,
            sequence_number: request.sequence_number,
            fragment_type,
            detector_id,
            element_id,
            error_bits: 0,
        }
    }

    pub fn set_error_bit(&mut self, bit: FragmentErrorBit) {
        self.error_bits |= 1 << (bit as u32);
    }

    pub fn has_error_bit(&self, bit: FragmentErrorBit) -> bool {
        self.error_bits & (1 << (bit as u32)) != 0
    }
}

/// One scatter-gather piece of a fragment payload, referencing memory still
/// owned by the latency buffer.
///
/// Construction is safe; dereferencing is not. A piece stays valid only while
/// the cleanup gate excludes buffer cleanups, which is exactly the window the
/// request handler linearises fragments in.
#[derive(Debug, Clone, Copy)]
pub struct FragmentPiece {
    ptr: *const u8,
    len: usize,
    timestamp: Timestamp,
}

impl FragmentPiece {
    /// Captures a piece from a payload slice of a buffered element.
    pub fn from_slice(timestamp: Timestamp, payload: &[u8]) -> Self {
        Self {
            ptr: payload.as_ptr(),
            len: payload.len(),
            timestamp,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Timestamp of the first sub-frame this piece covers.
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Reborrows the referenced payload bytes.
    ///
    /// # Safety
    ///
    /// The caller must guarantee the latency buffer has neither popped nor
    /// recycled the element this piece points into: in the request path that
    /// is guaranteed by holding the cleanup gate from lookup to
    /// linearisation.
    pub unsafe fn as_slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.ptr, self.len)
    }
}

/// The reply to a [`DataRequest`]: a header plus the linearised payload bytes
/// gathered from the latency buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fragment {
    header: FragmentHeader,
    payload: Bytes,
}

impl Fragment {
    /// An empty fragment flagged `DataNotFound`.
    pub fn empty(mut header: FragmentHeader) -> Self {
        header.set_error_bit(FragmentErrorBit::DataNotFound);
        Self {
            header,
            payload: Bytes::new(),
        }
    }

    /// Linearises scatter-gather pieces into one contiguous payload.
    ///
    /// # Safety
    ///
    /// Every piece must still reference live latency-buffer memory; see
    /// [`FragmentPiece::as_slice`]. The request handler calls this while the
    /// cleanup gate is held.
    pub unsafe fn from_pieces(header: FragmentHeader, pieces: &[FragmentPiece]) -> Self {
        let total: usize = pieces.iter().map(|p| p.len()).sum();
        let mut payload = BytesMut::with_capacity(total);
        for piece in pieces {
            payload.extend_from_slice(piece.as_slice());
        }
        Self {
            header,
            payload: payload.freeze(),
        }
    }

    pub fn header(&self) -> &FragmentHeader {
        &self.header
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Total size: header plus payload bytes.
    pub fn size(&self) -> usize {
        std::mem::size_of::<FragmentHeader>() + self.payload.len()
    }

    pub fn has_error_bit(&self, bit: FragmentErrorBit) -> bool {
        self.header.has_error_bit(bit)
    }
}

/// A broadcast advertising the freshest DAQ timestamp observed on a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSync {
    /// Freshest post-processed DAQ timestamp, in DTS ticks.
    pub daq_time: Timestamp,
    /// Wall-clock time at creation, microseconds since the Unix epoch.
    pub system_time: u64,
    pub run_number: RunNumber,
    pub sequence_number: u64,
    pub source_pid: u32,
}

impl TimeSync {
    /// Stamps a beacon with the current wall clock and this process's pid.
    pub fn new(daq_time: Timestamp) -> Self {
        let system_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        Self {
            daq_time,
            system_time,
            run_number: 0,
            sequence_number: 0,
            source_pid: std::process::id(),
        }
    }
}
