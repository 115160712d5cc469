//! Per-frame pre-processing pipeline and parallel post-processing fanout.
//!
//! Pre-processors run synchronously on the consumer thread for every frame
//! *before* it enters the latency buffer: their combined cost must stay
//! below the inter-frame interval, since blocking here directly drops
//! frames. Post-processors each get their own bounded SPSC queue and worker
//! thread; after a successful buffer write the consumer pushes a pointer to
//! the stored element into every queue. A full queue drops the pointer and
//! counts it: post-processing lag never backpressures ingest.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_queue::ArrayQueue;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::DataHandlerConfig;
use crate::frame::FrameType;
use crate::types::{SourceId, Timestamp};

/// A pointer to an element stored in the latency buffer, queued for a
/// post-processing worker.
///
/// The pointee outlives the queue entry under the pipeline's discipline:
/// cleanups trail post-processing by the buffer's latency margin, and
/// workers tolerate stale payloads when a wrapped producer or a cleanup
/// overtakes them (the frame types are plain old data).
struct FramePtr<F>(*const F);

// SAFETY: the raw pointer targets latency-buffer memory whose validity is
// governed by the pipeline contract above, independent of which thread
// dereferences it.
unsafe impl<F: Send> Send for FramePtr<F> {}

struct PostprocessTask<F> {
    function: Arc<dyn Fn(&F) + Send + Sync>,
    queue: Arc<ArrayQueue<FramePtr<F>>>,
    dropped: Arc<AtomicU64>,
}

/// Counter snapshot of one processor.
#[derive(Debug, Clone, Default)]
pub struct ProcessorStats {
    pub last_daq_time: Timestamp,
    pub num_postprocess_dropped: u64,
}

/// Pre-process pipeline plus post-process fanout for one link.
pub struct RawDataProcessor<F: FrameType> {
    sourceid: SourceId,
    preprocess_functions: Vec<Box<dyn Fn(&mut F) + Send + Sync>>,
    tasks: Vec<PostprocessTask<F>>,
    post_processing_enabled: bool,
    queue_size: usize,
    run_marker: Arc<AtomicBool>,
    last_daq_time: AtomicU64,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<F: FrameType> RawDataProcessor<F> {
    pub fn new() -> Self {
        Self {
            sourceid: SourceId::default(),
            preprocess_functions: Vec::new(),
            tasks: Vec::new(),
            post_processing_enabled: true,
            queue_size: 10_000,
            run_marker: Arc::new(AtomicBool::new(false)),
            last_daq_time: AtomicU64::new(0),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn conf(&mut self, cfg: &DataHandlerConfig, sourceid: SourceId) {
        self.sourceid = sourceid;
        self.post_processing_enabled = cfg.post_processing_enabled;
        self.queue_size = cfg.postprocess_queue_size;
    }

    /// Releases pipeline functions, queues and their backlog.
    pub fn scrap(&mut self) {
        self.preprocess_functions.clear();
        self.tasks.clear();
    }

    /// Appends a pre-processing stage. Registration is `conf`-time only;
    /// the pipeline is immutable once workers run.
    pub fn add_preprocess_task(&mut self, task: impl Fn(&mut F) + Send + Sync + 'static) {
        self.preprocess_functions.push(Box::new(task));
    }

    /// Appends a post-processing stage with its own queue and worker.
    pub fn add_postprocess_task(&mut self, task: impl Fn(&F) + Send + Sync + 'static) {
        self.tasks.push(PostprocessTask {
            function: Arc::new(task),
            queue: Arc::new(ArrayQueue::new(self.queue_size)),
            dropped: Arc::new(AtomicU64::new(0)),
        });
    }

    /// Runs the pre-process pipeline on `item`, in registration order.
    pub fn preprocess_item(&self, item: &mut F) {
        for function in &self.preprocess_functions {
            function(item);
        }
    }

    /// Fans `item` out to every post-process queue and records it as the
    /// freshest DAQ time. `item` must point into the latency buffer.
    pub fn postprocess_item(&self, item: &F) {
        self.last_daq_time.store(item.timestamp(), Ordering::Release);
        if !self.post_processing_enabled {
            return;
        }
        for (index, task) in self.tasks.iter().enumerate() {
            if task.queue.push(FramePtr(item as *const F)).is_err() {
                task.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    sourceid = %self.sourceid,
                    thread = index,
                    "postprocessing has too much backlog, dropped item"
                );
            }
        }
    }

    /// Timestamp of the most recently post-processed frame; read by the
    /// time-sync generator.
    pub fn get_last_daq_time(&self) -> Timestamp {
        self.last_daq_time.load(Ordering::Acquire)
    }

    pub fn reset_last_daq_time(&self) {
        self.last_daq_time.store(0, Ordering::Release);
    }

    /// Spins up one worker per post-process stage.
    pub fn start(&self) {
        self.run_marker.store(true, Ordering::SeqCst);
        if !self.post_processing_enabled {
            return;
        }
        let mut workers = self.workers.lock();
        for (index, task) in self.tasks.iter().enumerate() {
            let run_marker = Arc::clone(&self.run_marker);
            let queue = Arc::clone(&task.queue);
            let function = Arc::clone(&task.function);
            let handle = thread::spawn(move || {
                loop {
                    match queue.pop() {
                        Some(ptr) => {
                            // SAFETY: see FramePtr.
                            let frame = unsafe { &*ptr.0 };
                            function(frame);
                        }
                        None => {
                            if !run_marker.load(Ordering::SeqCst) {
                                break;
                            }
                            thread::sleep(Duration::from_micros(50));
                        }
                    }
                }
                debug!(worker = index, "post-processing worker drained and exiting");
            });
            workers.push(handle);
        }
        debug!(workers = self.tasks.len(), "started post-processing");
    }

    /// Clears the run marker and joins the workers; queues are drained
    /// before the workers exit.
    pub fn stop(&self) {
        self.run_marker.store(false, Ordering::SeqCst);
        for handle in self.workers.lock().drain(..) {
            if handle.join().is_err() {
                warn!("post-processing worker panicked");
            }
        }
    }

    pub fn stats(&self) -> ProcessorStats {
        ProcessorStats {
            last_daq_time: self.get_last_daq_time(),
            num_postprocess_dropped: self
                .tasks
                .iter()
                .map(|t| t.dropped.load(Ordering::Relaxed))
                .sum(),
        }
    }
}

impl<F: FrameType> Default for RawDataProcessor<F> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::DummyFrame;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_preprocess_pipeline_runs_in_order() {
        let mut processor = RawDataProcessor::<DummyFrame>::new();
        processor.add_preprocess_task(|frame| frame.data_mut()[0] = 1);
        processor.add_preprocess_task(|frame| frame.data_mut()[0] *= 3);
        let mut frame = DummyFrame::new(0, 0);
        processor.preprocess_item(&mut frame);
        assert_eq!(frame.payload()[16], 3);
    }

    #[test]
    fn test_postprocess_fanout_and_last_daq_time() {
        let mut processor = RawDataProcessor::<DummyFrame>::new();
        let seen_a = Arc::new(AtomicUsize::new(0));
        let seen_b = Arc::new(AtomicUsize::new(0));
        let (a, b) = (Arc::clone(&seen_a), Arc::clone(&seen_b));
        processor.add_postprocess_task(move |_| {
            a.fetch_add(1, Ordering::SeqCst);
        });
        processor.add_postprocess_task(move |_| {
            b.fetch_add(1, Ordering::SeqCst);
        });
        processor.start();

        let frames: Vec<DummyFrame> = (0..32).map(|i| DummyFrame::new(i * 1000, i)).collect();
        for frame in &frames {
            processor.postprocess_item(frame);
        }
        assert_eq!(processor.get_last_daq_time(), 31_000);

        processor.stop();
        assert_eq!(seen_a.load(Ordering::SeqCst), 32);
        assert_eq!(seen_b.load(Ordering::SeqCst), 32);
        assert_eq!(processor.stats().num_postprocess_dropped, 0);
    }

    #[test]
    fn test_full_queue_drops_and_counts() {
        let mut processor = RawDataProcessor::<DummyFrame>::new();
        let cfg = DataHandlerConfig {
            postprocess_queue_size: 2,
            ..Default::default()
        };
        processor.conf(&cfg, SourceId::default());
        processor.add_postprocess_task(|_| {});
        // Workers not started: the queue fills at 2 and further pushes drop.
        let frames: Vec<DummyFrame> = (0..5).map(|i| DummyFrame::new(i * 1000, i)).collect();
        for frame in &frames {
            processor.postprocess_item(frame);
        }
        assert_eq!(processor.stats().num_postprocess_dropped, 3);
    }

    #[test]
    fn test_disabled_postprocessing_still_tracks_daq_time() {
        let mut processor = RawDataProcessor::<DummyFrame>::new();
        let cfg = DataHandlerConfig {
            post_processing_enabled: false,
            ..Default::default()
        };
        processor.conf(&cfg, SourceId::default());
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        processor.add_postprocess_task(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        processor.start();
        let frame = DummyFrame::new(7_000, 1);
        processor.postprocess_item(&frame);
        processor.stop();
        assert_eq!(processor.get_last_daq_time(), 7_000);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        processor.reset_last_daq_time();
        assert_eq!(processor.get_last_daq_time(), 0);
    }
}
