//! File-backed source emulation: replay a raw binary dump onto a link at a
//! configured rate.
//!
//! The dump is read fully at `conf`. On `start` a producer thread loops over
//! the file's elements, rewrites each outgoing frame's timestamp to a
//! monotonic fake value seeded at run start, paces itself with the
//! [`RateLimiter`] and delivers downstream with a non-blocking send: drops
//! on a congested link are counted, never retried. The shared run marker is
//! owned by the enclosing card-reader module: set it before `start`, clear
//! it before `stop`.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, info, warn};

use crate::callback::{DataMoveCallbackRegistry, FrameCallback};
use crate::config::EmulatorConfig;
use crate::error::{ReadoutError, Result};
use crate::frame::FrameType;
use crate::io::FrameSender;
use crate::rate_limiter::RateLimiter;
use crate::types::SourceId;

/// An in-memory copy of a raw binary dump, sliced into fixed-size elements.
pub struct FileSourceBuffer {
    input_limit: usize,
    chunk_size: usize,
    element_count: usize,
    path: PathBuf,
    buffer: Vec<u8>,
}

impl FileSourceBuffer {
    pub fn new(input_limit: usize, chunk_size: usize) -> Self {
        Self {
            input_limit,
            chunk_size,
            element_count: 0,
            path: PathBuf::new(),
            buffer: Vec::new(),
        }
    }

    /// Reads `path` fully. Oversized files and trailing partial elements
    /// are warned about, not rejected.
    pub fn read(&mut self, path: &Path) -> Result<()> {
        self.path = path.to_owned();
        let mut file = std::fs::File::open(path).map_err(|source| ReadoutError::CannotOpenFile {
            path: path.to_owned(),
            source,
        })?;
        let file_size = file
            .metadata()
            .map_err(|source| ReadoutError::CannotReadFile {
                path: path.to_owned(),
                source,
            })?
            .len() as usize;

        if file_size > self.input_limit {
            warn!(
                file_size,
                input_limit = self.input_limit,
                path = %path.display(),
                "file size limit exceeded"
            );
        }
        if self.chunk_size > 0 {
            let remainder = file_size % self.chunk_size;
            if remainder > 0 {
                warn!(
                    file_size,
                    chunk_size = self.chunk_size,
                    remainder,
                    path = %path.display(),
                    "binary file contains more data than expected"
                );
            }
            self.element_count = file_size / self.chunk_size;
            debug!(elements = self.element_count, "usable elements in source file");
        }

        self.buffer.reserve(file_size);
        file.read_to_end(&mut self.buffer)
            .map_err(|source| ReadoutError::CannotReadFile {
                path: path.to_owned(),
                source,
            })?;
        debug!(bytes = self.buffer.len(), "source file loaded");
        Ok(())
    }

    pub fn num_elements(&self) -> usize {
        self.element_count
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn data(&self) -> &[u8] {
        &self.buffer
    }

    /// The bytes of element `index`.
    pub fn element(&self, index: usize) -> &[u8] {
        let offset = index * self.chunk_size;
        &self.buffer[offset..offset + self.chunk_size]
    }
}

/// Counter snapshot of one emulator.
#[derive(Debug, Clone, Default)]
pub struct EmulatorStats {
    pub num_frames_sent: u64,
    pub num_frames_dropped: u64,
}

enum Downstream<F: FrameType> {
    Channel(Arc<dyn FrameSender<F>>),
    Callback(FrameCallback<F>),
}

/// Rate-limited file-replay source for one link.
pub struct SourceEmulator<F: FrameType> {
    cfg: EmulatorConfig,
    sourceid: SourceId,
    file_buffer: Option<Arc<FileSourceBuffer>>,
    sender_name: String,
    sender: Option<Arc<dyn FrameSender<F>>>,
    run_marker: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    num_frames_sent: Arc<AtomicU64>,
    num_frames_dropped: Arc<AtomicU64>,
    configured: bool,
}

impl<F: FrameType> SourceEmulator<F> {
    /// The run marker is shared with the owning card-reader module.
    pub fn new(run_marker: Arc<AtomicBool>) -> Self {
        Self {
            cfg: EmulatorConfig::default(),
            sourceid: SourceId::default(),
            file_buffer: None,
            sender_name: String::new(),
            sender: None,
            run_marker,
            worker: None,
            num_frames_sent: Arc::new(AtomicU64::new(0)),
            num_frames_dropped: Arc::new(AtomicU64::new(0)),
            configured: false,
        }
    }

    /// Binds the downstream connection. A `cb`-prefixed name is resolved
    /// through the data-move callback registry at `start` instead of using
    /// a channel sender.
    pub fn set_sender(&mut self, name: &str, sender: Option<Arc<dyn FrameSender<F>>>) {
        self.sender_name = name.to_owned();
        self.sender = sender;
    }

    pub fn is_configured(&self) -> bool {
        self.configured
    }

    /// Loads the input file and validates the replay parameters.
    pub fn conf(&mut self, cfg: EmulatorConfig) -> Result<()> {
        let sourceid = SourceId::new(F::SUBSYSTEM, cfg.source_id);
        if self.configured {
            return Err(ReadoutError::configuration(
                sourceid,
                "emulator configured twice",
            ));
        }
        cfg.validate(sourceid)?;

        let chunk_size = if cfg.check_chunk_multiple {
            F::ELEMENT_SIZE
        } else {
            0
        };
        let mut file_buffer = FileSourceBuffer::new(cfg.input_limit_bytes, chunk_size);
        file_buffer.read(&cfg.input_file)?;

        self.sourceid = sourceid;
        self.file_buffer = Some(Arc::new(file_buffer));
        self.cfg = cfg;
        self.configured = true;
        Ok(())
    }

    /// Spins up the producer thread.
    pub fn start(&mut self) -> Result<()> {
        let file_buffer = match &self.file_buffer {
            Some(buffer) if buffer.num_elements() > 0 => Arc::clone(buffer),
            _ => {
                return Err(ReadoutError::EmptySourceBuffer {
                    sourceid: self.sourceid,
                    path: self.cfg.input_file.clone(),
                })
            }
        };

        let downstream = if self.sender_name.split('_').next() == Some("cb") {
            match DataMoveCallbackRegistry::instance().get_callback::<F>(&self.sender_name) {
                Some(callback) => Downstream::Callback(callback),
                None => {
                    return Err(ReadoutError::configuration(
                        self.sourceid,
                        format!("no consume callback registered for {}", self.sender_name),
                    ))
                }
            }
        } else {
            match &self.sender {
                Some(sender) => Downstream::Channel(Arc::clone(sender)),
                None => {
                    return Err(ReadoutError::configuration(
                        self.sourceid,
                        "emulator has no sender bound",
                    ))
                }
            }
        };

        self.num_frames_sent.store(0, Ordering::Relaxed);
        self.num_frames_dropped.store(0, Ordering::Relaxed);

        let run_marker = Arc::clone(&self.run_marker);
        let sent = Arc::clone(&self.num_frames_sent);
        let dropped = Arc::clone(&self.num_frames_dropped);
        let rate_khz = self.cfg.rate_khz;
        let sourceid = self.sourceid;

        let handle = thread::Builder::new()
            .name(format!("emulator-{}", sourceid.id))
            .spawn(move || {
                info!(sourceid = %sourceid, rate_khz, "source emulation started");
                let mut limiter = RateLimiter::new(rate_khz);
                limiter.init();
                // Fake timestamps are seeded at run start and advance by one
                // stride per element, looping over the file content.
                let mut fake_timestamp: u64 = 0;
                let mut element_index = 0usize;
                let element_count = file_buffer.num_elements();

                while run_marker.load(Ordering::SeqCst) {
                    if let Some(mut frame) = F::from_bytes(file_buffer.element(element_index)) {
                        frame.set_timestamp(fake_timestamp);
                        match &downstream {
                            Downstream::Channel(sender) => {
                                if sender.try_send(frame).is_err() {
                                    dropped.fetch_add(1, Ordering::Relaxed);
                                } else {
                                    sent.fetch_add(1, Ordering::Relaxed);
                                }
                            }
                            Downstream::Callback(callback) => {
                                callback(frame);
                                sent.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    }
                    fake_timestamp += F::stride();
                    element_index += 1;
                    if element_index == element_count {
                        element_index = 0;
                    }
                    limiter.limit();
                }
                info!(sourceid = %sourceid, "source emulation stopped");
            })
            .expect("spawn emulator thread");
        self.worker = Some(handle);
        Ok(())
    }

    /// Joins the producer thread; the caller has cleared the run marker.
    pub fn stop(&mut self) {
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                warn!("emulator thread panicked");
            }
        }
    }

    /// Releases the file buffer.
    pub fn scrap(&mut self) {
        self.file_buffer = None;
        self.configured = false;
    }

    pub fn stats(&self) -> EmulatorStats {
        EmulatorStats {
            num_frames_sent: self.num_frames_sent.load(Ordering::Relaxed),
            num_frames_dropped: self.num_frames_dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::DummyFrame;
    use crate::io::{frame_channel, FrameReceiver};
    use std::time::{Duration, Instant};

    fn dump_file(dir: &tempfile::TempDir, elements: usize) -> PathBuf {
        let path = dir.path().join("frames.bin");
        let mut bytes = Vec::new();
        for i in 0..elements {
            let mut frame = DummyFrame::new(999_999, i as u64);
            frame.data_mut()[0] = i as u8;
            bytes.extend_from_slice(frame.payload());
        }
        std::fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn test_missing_file_fails_conf() {
        let run_marker = Arc::new(AtomicBool::new(false));
        let mut emulator = SourceEmulator::<DummyFrame>::new(run_marker);
        let cfg = EmulatorConfig {
            input_file: "/nonexistent/frames.bin".into(),
            ..Default::default()
        };
        assert!(matches!(
            emulator.conf(cfg),
            Err(ReadoutError::CannotOpenFile { .. })
        ));
    }

    #[test]
    fn test_empty_file_fails_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dump_file(&dir, 0);
        let run_marker = Arc::new(AtomicBool::new(true));
        let mut emulator = SourceEmulator::<DummyFrame>::new(run_marker);
        emulator
            .conf(EmulatorConfig {
                input_file: path,
                ..Default::default()
            })
            .unwrap();
        let (tx, _rx) = frame_channel::<DummyFrame>(8);
        emulator.set_sender("raw_link_0", Some(Arc::new(tx)));
        assert!(matches!(
            emulator.start(),
            Err(ReadoutError::EmptySourceBuffer { .. })
        ));
    }

    #[test]
    fn test_replay_rewrites_monotonic_timestamps_and_loops() {
        let dir = tempfile::tempdir().unwrap();
        let path = dump_file(&dir, 4);
        let run_marker = Arc::new(AtomicBool::new(true));
        let mut emulator = SourceEmulator::<DummyFrame>::new(Arc::clone(&run_marker));
        emulator
            .conf(EmulatorConfig {
                input_file: path,
                rate_khz: 10.0, // 100 µs between frames
                ..Default::default()
            })
            .unwrap();
        let (tx, rx) = frame_channel::<DummyFrame>(64);
        emulator.set_sender("raw_link_0", Some(Arc::new(tx)));
        emulator.start().unwrap();

        let mut frames = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(2);
        while frames.len() < 10 && Instant::now() < deadline {
            if let Some(frame) = rx.try_receive(Duration::from_millis(50)) {
                frames.push(frame);
            }
        }
        run_marker.store(false, Ordering::SeqCst);
        emulator.stop();

        assert!(frames.len() >= 10, "emulator too slow");
        // Timestamps are rewritten to the fake clock, one stride apart.
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame.timestamp(), i as u64 * DummyFrame::stride());
        }
        // The file has 4 elements, so replay loops: frame 4 carries element
        // 0's payload again.
        assert_eq!(frames[4].payload()[16], frames[0].payload()[16]);
        assert!(emulator.stats().num_frames_sent >= 10);
    }

    #[test]
    fn test_congested_downstream_counts_drops() {
        let dir = tempfile::tempdir().unwrap();
        let path = dump_file(&dir, 4);
        let run_marker = Arc::new(AtomicBool::new(true));
        let mut emulator = SourceEmulator::<DummyFrame>::new(Arc::clone(&run_marker));
        emulator
            .conf(EmulatorConfig {
                input_file: path,
                rate_khz: 100.0,
                ..Default::default()
            })
            .unwrap();
        // Capacity 2 and nobody draining: everything after the first two
        // frames is dropped.
        let (tx, _rx) = frame_channel::<DummyFrame>(2);
        emulator.set_sender("raw_link_0", Some(Arc::new(tx)));
        emulator.start().unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while emulator.stats().num_frames_dropped < 10 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        run_marker.store(false, Ordering::SeqCst);
        emulator.stop();

        let stats = emulator.stats();
        assert_eq!(stats.num_frames_sent, 2);
        assert!(stats.num_frames_dropped >= 10);
    }

    #[test]
    fn test_callback_destination_delivers_through_registry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dump_file(&dir, 2);
        let run_marker = Arc::new(AtomicBool::new(true));
        let mut emulator = SourceEmulator::<DummyFrame>::new(Arc::clone(&run_marker));
        emulator
            .conf(EmulatorConfig {
                input_file: path,
                rate_khz: 10.0,
                ..Default::default()
            })
            .unwrap();

        // No callback registered yet: start refuses.
        emulator.set_sender("cb_emulated_link_9", None);
        assert!(emulator.start().is_err());

        let received = Arc::new(AtomicU64::new(0));
        let sink = Arc::clone(&received);
        DataMoveCallbackRegistry::instance().register_callback::<DummyFrame>(
            "cb_emulated_link_9",
            Arc::new(move |_frame| {
                sink.fetch_add(1, Ordering::Relaxed);
            }),
        );
        emulator.start().unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while received.load(Ordering::Relaxed) < 5 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        run_marker.store(false, Ordering::SeqCst);
        emulator.stop();
        DataMoveCallbackRegistry::instance().deregister("cb_emulated_link_9");

        assert!(received.load(Ordering::Relaxed) >= 5);
        assert_eq!(emulator.stats().num_frames_dropped, 0);
    }

    #[test]
    fn test_double_conf_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dump_file(&dir, 2);
        let mut emulator =
            SourceEmulator::<DummyFrame>::new(Arc::new(AtomicBool::new(false)));
        let cfg = EmulatorConfig {
            input_file: path,
            ..Default::default()
        };
        emulator.conf(cfg.clone()).unwrap();
        assert!(emulator.conf(cfg).is_err());
        emulator.scrap();
        assert!(!emulator.is_configured());
    }
}
