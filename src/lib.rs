//! # Per-link detector readout data handling
//!
//! This crate implements the data-handling engine that sits behind one
//! detector data link in a high-rate readout pipeline. For each link it
//! continuously ingests fixed-layout hardware frames, buffers them in a
//! large timestamp-ordered *latency buffer*, runs per-frame pre-processing
//! and parallel post-processing, answers time-windowed *data requests* from
//! the trigger/dataflow plane with scatter-gathered *fragments*, and
//! periodically publishes *time-sync* beacons advertising the freshest DAQ
//! timestamp it has observed.
//!
//! ## Crate structure
//!
//! - **`frame`**: the frame-type contract every component is generic over,
//!   plus a bundled synthetic frame for emulation and tests.
//! - **`buffer`**: the latency-buffer contract and its two variants: an
//!   aligned array ring for in-order producers and a lock-free skip list
//!   for out-of-order ones.
//! - **`processor`**: the pre-process pipeline and the parallel
//!   post-processing fanout.
//! - **`handler`**: request servicing: window classification, zero-copy
//!   fragment assembly, deferral/retry, buffer cleanup and raw-data
//!   recording (buffered and zero-copy O_DIRECT engines).
//! - **`model`**: the per-link orchestrator owning the consumer, time-sync
//!   and request-dispatcher threads.
//! - **`emulator`**: rate-limited file replay standing in for real hardware.
//! - **`io`**: minimal sender/receiver seams towards the surrounding IO
//!   plumbing, with bounded-channel implementations.
//! - **`registry`**, **`rate_limiter`**, **`recording`**, **`callback`**,
//!   **`config`**, **`error`**, **`types`**: supporting pieces.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::atomic::AtomicBool;
//! use std::sync::Arc;
//!
//! use daq_readout::buffer::ring::RingLatencyBuffer;
//! use daq_readout::config::DataHandlerConfig;
//! use daq_readout::frame::DummyFrame;
//! use daq_readout::handler::RequestHandler;
//! use daq_readout::io::{frame_channel, request_channel, ChannelFragmentSender};
//! use daq_readout::model::{DataHandlingModel, ModelEndpoints};
//!
//! # fn main() -> daq_readout::error::Result<()> {
//! let (frame_tx, frame_rx) = frame_channel::<DummyFrame>(4096);
//! let (request_tx, request_rx) = request_channel(256);
//! let fragment_sender = ChannelFragmentSender::new();
//! let fragments = fragment_sender.add_destination("data_fragments_q", 256);
//!
//! let mut model: DataHandlingModel<
//!     DummyFrame,
//!     RingLatencyBuffer<DummyFrame>,
//!     RequestHandler<DummyFrame, RingLatencyBuffer<DummyFrame>>,
//! > = DataHandlingModel::new(Arc::new(AtomicBool::new(false)));
//!
//! model.conf(
//!     DataHandlerConfig::default(),
//!     ModelEndpoints {
//!         raw_input_name: "raw_link_0".into(),
//!         raw_receiver: Some(Box::new(frame_rx)),
//!         request_receiver: Box::new(request_rx),
//!         fragment_sender,
//!         timesync_sender: None,
//!     },
//! )?;
//! model.start(1)?;
//! // ... frames flow in through frame_tx, requests through request_tx,
//! // fragments come out on `fragments` ...
//! model.stop()?;
//! model.scrap()?;
//! # let _ = (frame_tx, request_tx, fragments);
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod callback;
pub mod config;
pub mod emulator;
pub mod error;
pub mod frame;
pub mod handler;
pub mod io;
pub mod model;
pub mod processor;
pub mod rate_limiter;
pub mod recording;
pub mod registry;
pub mod types;

pub use buffer::{ring::RingLatencyBuffer, skiplist::SkipListLatencyBuffer, LatencyBuffer};
pub use error::{ReadoutError, Result};
pub use frame::{DummyFrame, FrameType};
pub use handler::{EmptyFragmentRequestHandler, RequestHandler, RequestHandling, ResultCode};
pub use model::{DataHandlingModel, ModelEndpoints};
pub use registry::{ErrorInterval, FrameErrorRegistry};
pub use types::{DataRequest, Fragment, SourceId, TimeSync, Timestamp};

/// The default pipeline for an in-order fixed-rate link.
pub type DefaultDataHandlingModel<F> =
    DataHandlingModel<F, RingLatencyBuffer<F>, RequestHandler<F, RingLatencyBuffer<F>>>;
