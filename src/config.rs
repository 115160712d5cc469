//! Configuration structures for the per-link pipeline.
//!
//! Each option group from the control plane maps to one serde-ready struct
//! with sensible defaults; `validate()` is applied during `conf` and any
//! violation is fatal for that transition. The loader that produces these
//! structs (file, database, command payload) lives outside this crate.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{ReadoutError, Result};
use crate::types::SourceId;

/// Latency-buffer sizing and lookup strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LatencyBufferConfig {
    /// Fixed capacity in elements; never grows after `conf`.
    pub size: usize,
    /// Use the analytic constant-stride index estimate before falling back
    /// to binary search. Only correct for fixed-rate producers.
    pub fixed_rate_lookup: bool,
}

impl Default for LatencyBufferConfig {
    fn default() -> Self {
        Self {
            size: 100_000,
            fixed_rate_lookup: false,
        }
    }
}

impl LatencyBufferConfig {
    pub fn validate(&self, sourceid: SourceId) -> Result<()> {
        if self.size == 0 {
            return Err(ReadoutError::configuration(
                sourceid,
                "latency buffer size must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Compression applied by the buffered recording writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    #[default]
    None,
    Lz4,
}

/// Raw-data recording parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataRecorderConfig {
    /// Output file path. The zero-copy engine appends `_<source_id>.bin`.
    pub output_file: PathBuf,
    /// Streaming buffer size in bytes. Must be a 4096-multiple for the
    /// zero-copy engine.
    pub streaming_buffer_size: usize,
    pub compression_algorithm: CompressionAlgorithm,
    /// Record by dumping aligned blocks straight from the buffer memory
    /// instead of element-by-element through the buffered writer.
    pub zero_copy: bool,
    /// Open the output with `O_DIRECT` (zero-copy engine only).
    pub use_o_direct: bool,
}

impl Default for DataRecorderConfig {
    fn default() -> Self {
        Self {
            output_file: PathBuf::new(),
            streaming_buffer_size: 8 * 1024 * 1024,
            compression_algorithm: CompressionAlgorithm::None,
            zero_copy: false,
            use_o_direct: false,
        }
    }
}

/// Request-handler thresholds and policies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestHandlerConfig {
    /// Occupancy fraction above which cleanups start popping, in `[0, 1]`.
    pub pop_limit_pct: f32,
    /// Fraction of the occupancy popped per cleanup, in `[0, 1]`.
    pub pop_size_pct: f32,
    /// Size of the request-servicing thread pool.
    pub handler_threads: usize,
    /// Deferral deadline in milliseconds; 0 disables deferral entirely.
    pub request_timeout_ms: u64,
    /// Send timeout towards the fragment connection.
    pub fragment_send_timeout_ms: u64,
    pub warn_on_timeout: bool,
    pub warn_on_empty_buffer: bool,
    /// Period of the push-mode transmission hook; 0 disables the thread.
    pub periodic_data_transmission_ms: u64,
    pub data_recorder: Option<DataRecorderConfig>,
}

impl Default for RequestHandlerConfig {
    fn default() -> Self {
        Self {
            pop_limit_pct: 0.8,
            pop_size_pct: 0.1,
            handler_threads: 2,
            request_timeout_ms: 1_000,
            fragment_send_timeout_ms: 100,
            warn_on_timeout: true,
            warn_on_empty_buffer: true,
            periodic_data_transmission_ms: 0,
            data_recorder: None,
        }
    }
}

impl RequestHandlerConfig {
    pub fn validate(&self, sourceid: SourceId) -> Result<()> {
        if !(0.0..=1.0).contains(&self.pop_limit_pct) || !(0.0..=1.0).contains(&self.pop_size_pct)
        {
            return Err(ReadoutError::configuration(
                sourceid,
                "auto-pop percentage out of range",
            ));
        }
        if self.handler_threads == 0 {
            return Err(ReadoutError::configuration(
                sourceid,
                "handler_threads must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Top-level configuration of one data-handling link.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataHandlerConfig {
    /// Numeric id of this link; the subsystem comes from the frame type.
    pub source_id: u32,
    pub detector_id: u16,
    pub latency_buffer: LatencyBufferConfig,
    pub request_handler: RequestHandlerConfig,
    /// Run the parallel post-processing stage.
    pub post_processing_enabled: bool,
    /// Post-process only data older than this many ticks, letting an
    /// out-of-order producer settle first. 0 post-processes inline.
    pub post_processing_delay_ticks: u64,
    /// Capacity of each post-processing hand-off queue.
    pub postprocess_queue_size: usize,
    /// Receive timeout of the pull-mode consumer.
    pub raw_receiver_timeout_ms: u64,
    /// Sleep applied after a receive timeout so a zero timeout cannot
    /// degenerate into a busy yield.
    pub raw_receiver_sleep_us: u64,
    pub generate_timesync: bool,
    /// Diagnostics only: synthesise a data request per time-sync beacon.
    pub fake_trigger: bool,
}

impl Default for DataHandlerConfig {
    fn default() -> Self {
        Self {
            source_id: 0,
            detector_id: 0,
            latency_buffer: LatencyBufferConfig::default(),
            request_handler: RequestHandlerConfig::default(),
            post_processing_enabled: true,
            post_processing_delay_ticks: 0,
            postprocess_queue_size: 10_000,
            raw_receiver_timeout_ms: 100,
            raw_receiver_sleep_us: 0,
            generate_timesync: true,
            fake_trigger: false,
        }
    }
}

impl DataHandlerConfig {
    pub fn validate(&self, sourceid: SourceId) -> Result<()> {
        self.latency_buffer.validate(sourceid)?;
        self.request_handler.validate(sourceid)?;
        if self.postprocess_queue_size == 0 {
            return Err(ReadoutError::configuration(
                sourceid,
                "postprocess_queue_size must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// File-replay emulation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmulatorConfig {
    pub input_file: PathBuf,
    /// Warn when the input file exceeds this many bytes.
    pub input_limit_bytes: usize,
    /// Replay rate in kHz.
    pub rate_khz: f64,
    pub source_id: u32,
    /// Reject input files that are not a whole number of elements.
    pub check_chunk_multiple: bool,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            input_file: PathBuf::new(),
            input_limit_bytes: 10 * 1024 * 1024 * 1024,
            rate_khz: 100.0,
            source_id: 0,
            check_chunk_multiple: true,
        }
    }
}

impl EmulatorConfig {
    pub fn validate(&self, sourceid: SourceId) -> Result<()> {
        if self.rate_khz <= 0.0 {
            return Err(ReadoutError::configuration(
                sourceid,
                format!("invalid emulation rate: {} kHz", self.rate_khz),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Subsystem;

    fn sid() -> SourceId {
        SourceId::new(Subsystem::DetectorReadout, 1)
    }

    #[test]
    fn test_defaults_validate() {
        assert!(DataHandlerConfig::default().validate(sid()).is_ok());
        assert!(EmulatorConfig::default().validate(sid()).is_ok());
    }

    #[test]
    fn test_pop_percentages_out_of_range_rejected() {
        let mut cfg = RequestHandlerConfig {
            pop_limit_pct: 1.2,
            ..Default::default()
        };
        assert!(cfg.validate(sid()).is_err());
        cfg.pop_limit_pct = 0.5;
        cfg.pop_size_pct = -0.1;
        assert!(cfg.validate(sid()).is_err());
    }

    #[test]
    fn test_zero_sizes_rejected() {
        let cfg = LatencyBufferConfig {
            size: 0,
            ..Default::default()
        };
        assert!(cfg.validate(sid()).is_err());
        let cfg = RequestHandlerConfig {
            handler_threads: 0,
            ..Default::default()
        };
        assert!(cfg.validate(sid()).is_err());
    }

    #[test]
    fn test_emulator_rate_must_be_positive() {
        let cfg = EmulatorConfig {
            rate_khz: 0.0,
            ..Default::default()
        };
        assert!(cfg.validate(sid()).is_err());
    }
}
