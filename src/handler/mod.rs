//! Request handling: windowed lookups, zero-copy fragment assembly,
//! deferral/retry, buffer cleanup and raw-data recording.
//!
//! Incoming data requests are serviced on a fixed thread pool. Each request
//! classifies its window against the buffer contents, gathers scatter-gather
//! pieces referencing buffer memory, and linearises them into a fragment,
//! all while holding the *cleanup gate*, the reader-preferring critical
//! section that keeps the cleanup thread from retiring elements under a
//! request's pointers:
//!
//! ```text
//! cleanup: lock; mark cleanup_requested; wait requests_running == 0;
//!          pop front; unmark; notify_all
//! request: lock; wait while cleanup_requested; requests_running += 1;
//!          unlock; lookup + gather + linearise; lock; -= 1; notify_all
//! ```
//!
//! Cleanups starve while requests are in flight, which is bounded because
//! requests are bounded in work. Windows that reach past the newest data
//! are parked on a waiting list and retried exactly once, either when the
//! data arrives or when the request timeout expires.

pub mod empty;
mod zero_copy;

pub use empty::EmptyFragmentRequestHandler;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Sender};
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::buffer::{LatencyBuffer, LookupStart};
use crate::config::DataHandlerConfig;
use crate::error::{ReadoutError, Result};
use crate::frame::FrameType;
use crate::io::FragmentSender;
use crate::recording::BufferedFileWriter;
use crate::registry::{FrameErrorRegistry, MISSING_FRAMES};
use crate::types::{
    DataRequest, Fragment, FragmentErrorBit, FragmentHeader, FragmentPiece, RunNumber, SourceId,
    Timestamp,
};

use zero_copy::ZeroCopyRecorder;

/// Classification of a serviced request, ordered by finality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    /// The whole window lies within the buffered data.
    Found,
    /// The window starts beyond the newest element; eligible for retry.
    NotYet,
    /// The window extends past the newest element; eligible for retry.
    Partial,
    /// The window starts before the oldest element but overlaps the buffer.
    PartiallyOld,
    /// The window ends before the oldest element.
    TooOld,
    /// The buffer was empty or the lookup failed.
    NotFound,
    Unknown,
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Outcome of one request: classification, the originating request and the
/// assembled fragment.
#[derive(Debug)]
pub struct RequestResult {
    pub result_code: ResultCode,
    pub request: DataRequest,
    pub fragment: Fragment,
}

/// Common surface of request-handler implementations; the data-handling
/// model drives it and detector packages may substitute variants.
pub trait RequestHandling<F: FrameType, B: LatencyBuffer<F>>:
    Send + Sync + Sized + 'static
{
    fn build(buffer: Arc<B>, error_registry: Arc<FrameErrorRegistry>) -> Self;

    fn conf(
        &mut self,
        cfg: &DataHandlerConfig,
        fragment_sender: Arc<dyn FragmentSender>,
    ) -> Result<()>;

    fn scrap(&mut self);

    fn start(&self, run_number: RunNumber);

    fn stop(&self);

    /// Records raw data for `duration`; errors are command errors
    /// (recording already active, recorder not configured).
    fn record(&self, duration: Duration) -> Result<()>;

    /// Submits a request to the servicing pool. `is_retry` suppresses
    /// re-deferral so a request is retried at most once.
    fn issue_request(&self, request: DataRequest, is_retry: bool);

    /// Timestamp below which arriving frames are too late to be requestable.
    fn cutoff_timestamp(&self) -> Timestamp {
        0
    }

    fn supports_cutoff_timestamp(&self) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// Cleanup gate
// ---------------------------------------------------------------------------

#[derive(Default)]
struct GateState {
    cleanup_requested: bool,
    requests_running: u32,
}

/// Reader-preferring mutual exclusion between request servicing and buffer
/// cleanup. See the module docs for the protocol.
#[derive(Default)]
pub(crate) struct CleanupGate {
    state: Mutex<GateState>,
    cv: Condvar,
}

impl CleanupGate {
    /// Enters the request-side critical section, waiting out any cleanup in
    /// progress.
    pub(crate) fn begin_request(&self) -> RequestGuard<'_> {
        let mut state = self.state.lock();
        while state.cleanup_requested {
            self.cv.wait(&mut state);
        }
        state.requests_running += 1;
        drop(state);
        self.cv.notify_all();
        RequestGuard { gate: self }
    }

    /// Runs `cleanup` once `should` holds and all requests have drained.
    /// Returns whether a cleanup ran.
    fn try_cleanup(&self, should: impl FnOnce() -> bool, cleanup: impl FnOnce()) -> bool {
        let mut state = self.state.lock();
        if state.cleanup_requested || !should() {
            return false;
        }
        state.cleanup_requested = true;
        while state.requests_running > 0 {
            self.cv.wait(&mut state);
        }
        cleanup();
        state.cleanup_requested = false;
        drop(state);
        self.cv.notify_all();
        true
    }
}

pub(crate) struct RequestGuard<'a> {
    gate: &'a CleanupGate,
}

impl Drop for RequestGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.gate.state.lock();
        state.requests_running -= 1;
        drop(state);
        self.gate.cv.notify_all();
    }
}

// ---------------------------------------------------------------------------
// Handler internals
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct Settings {
    sourceid: SourceId,
    detector_id: u16,
    pop_limit_size: usize,
    pop_size_pct: f32,
    /// Elements a request can still see after a cleanup pass; bookkeeping.
    #[allow(dead_code)]
    max_requested_elements: usize,
    request_timeout_ms: u64,
    fragment_send_timeout_ms: u64,
    warn_on_timeout: bool,
    warn_on_empty_buffer: bool,
    periodic_data_transmission_ms: u64,
    recording_configured: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            sourceid: SourceId::default(),
            detector_id: 0,
            pop_limit_size: 0,
            pop_size_pct: 0.0,
            max_requested_elements: 0,
            request_timeout_ms: 0,
            fragment_send_timeout_ms: 100,
            warn_on_timeout: true,
            warn_on_empty_buffer: true,
            periodic_data_transmission_ms: 0,
            recording_configured: false,
        }
    }
}

#[derive(Default)]
pub(crate) struct Counters {
    num_requests_found: AtomicU64,
    num_requests_bad: AtomicU64,
    num_requests_old_window: AtomicU64,
    num_requests_delayed: AtomicU64,
    num_requests_uncategorized: AtomicU64,
    num_requests_timed_out: AtomicU64,
    num_requests_handled: AtomicU64,
    num_buffer_cleanups: AtomicU64,
    pop_reqs: AtomicU64,
    pops_count: AtomicU64,
    occupancy: AtomicU64,
    response_time_acc_us: AtomicU64,
    response_time_min_us: AtomicU64,
    response_time_max_us: AtomicU64,
    pub(crate) payloads_recorded: AtomicU64,
    pub(crate) bytes_recorded: AtomicU64,
    pub(crate) failed_record_writes: AtomicU64,
    num_periodic_sent: AtomicU64,
    num_periodic_send_failed: AtomicU64,
}

impl Counters {
    fn reset(&self) {
        self.num_requests_found.store(0, Ordering::Relaxed);
        self.num_requests_bad.store(0, Ordering::Relaxed);
        self.num_requests_old_window.store(0, Ordering::Relaxed);
        self.num_requests_delayed.store(0, Ordering::Relaxed);
        self.num_requests_uncategorized.store(0, Ordering::Relaxed);
        self.num_requests_timed_out.store(0, Ordering::Relaxed);
        self.num_requests_handled.store(0, Ordering::Relaxed);
        self.num_buffer_cleanups.store(0, Ordering::Relaxed);
        self.pop_reqs.store(0, Ordering::Relaxed);
        self.pops_count.store(0, Ordering::Relaxed);
        self.response_time_acc_us.store(0, Ordering::Relaxed);
        self.response_time_min_us.store(u64::MAX, Ordering::Relaxed);
        self.response_time_max_us.store(0, Ordering::Relaxed);
        self.payloads_recorded.store(0, Ordering::Relaxed);
        self.bytes_recorded.store(0, Ordering::Relaxed);
        self.failed_record_writes.store(0, Ordering::Relaxed);
        self.num_periodic_sent.store(0, Ordering::Relaxed);
        self.num_periodic_send_failed.store(0, Ordering::Relaxed);
    }
}

/// Counter snapshot of one request handler.
#[derive(Debug, Clone, Default)]
pub struct HandlerStats {
    pub num_requests_found: u64,
    pub num_requests_bad: u64,
    pub num_requests_old_window: u64,
    pub num_requests_delayed: u64,
    pub num_requests_uncategorized: u64,
    pub num_requests_timed_out: u64,
    pub num_requests_handled: u64,
    pub num_requests_waiting: u64,
    pub num_buffer_cleanups: u64,
    pub pop_reqs: u64,
    pub pops_count: u64,
    pub occupancy: u64,
    pub response_time_acc_us: u64,
    pub response_time_min_us: u64,
    pub response_time_max_us: u64,
    pub payloads_recorded: u64,
    pub bytes_recorded: u64,
    pub failed_record_writes: u64,
    pub num_periodic_sent: u64,
    pub num_periodic_send_failed: u64,
    pub recording_active: bool,
}

struct PendingRequest {
    request: DataRequest,
    start_time: Instant,
}

type Job = Box<dyn FnOnce() + Send>;

/// Periodic push-mode transmission hook; returns whether the send
/// succeeded.
pub type PeriodicTransmission = Box<dyn Fn() -> bool + Send + Sync>;

struct Shared<F: FrameType, B: LatencyBuffer<F>> {
    buffer: Arc<B>,
    error_registry: Arc<FrameErrorRegistry>,
    gate: CleanupGate,
    waiting: Mutex<Vec<PendingRequest>>,
    fragment_sender: RwLock<Option<Arc<dyn FragmentSender>>>,
    settings: RwLock<Settings>,
    job_tx: Mutex<Option<Sender<Job>>>,
    run_marker: AtomicBool,
    recording: AtomicBool,
    next_timestamp_to_record: AtomicU64,
    writer: Mutex<Option<BufferedFileWriter>>,
    zero_copy: Mutex<Option<ZeroCopyRecorder>>,
    periodic_hook: RwLock<Option<PeriodicTransmission>>,
    counters: Counters,
    _frame: std::marker::PhantomData<fn() -> F>,
}

impl<F: FrameType, B: LatencyBuffer<F>> Shared<F, B> {
    fn submit(this: &Arc<Self>, request: DataRequest, is_retry: bool) {
        let shared = Arc::clone(this);
        let job: Job = Box::new(move || Self::service_request(&shared, request, is_retry));
        let tx = this.job_tx.lock();
        match tx.as_ref() {
            Some(tx) => {
                if tx.send(job).is_err() {
                    warn!("request pool is gone, dropping request");
                }
            }
            None => warn!("request received while handler is not started"),
        }
    }

    fn service_request(this: &Arc<Self>, request: DataRequest, is_retry: bool) {
        let t_begin = Instant::now();
        let result = {
            let _guard = this.gate.begin_request();
            Self::data_request(this, request)
        };
        let (timeout_ms, send_timeout, sourceid) = {
            let settings = this.settings.read();
            (
                settings.request_timeout_ms,
                Duration::from_millis(settings.fragment_send_timeout_ms),
                settings.sourceid,
            )
        };

        if matches!(result.result_code, ResultCode::NotYet | ResultCode::Partial)
            && timeout_ms > 0
            && !is_retry
        {
            debug!(
                trigger_timestamp = result.request.trigger_timestamp,
                code = %result.result_code,
                "re-queueing request"
            );
            this.waiting.lock().push(PendingRequest {
                request: result.request,
                start_time: Instant::now(),
            });
        } else {
            let sender = this.fragment_sender.read().clone();
            if let Some(sender) = sender {
                debug!(
                    trigger = result.request.trigger_number,
                    sequence = result.request.sequence_number,
                    run = result.request.run_number,
                    size = result.fragment.size(),
                    code = %result.result_code,
                    "sending fragment"
                );
                if let Err(err) = sender.send(
                    &result.request.data_destination,
                    result.fragment,
                    send_timeout,
                ) {
                    warn!(
                        sourceid = %sourceid,
                        destination = %result.request.data_destination,
                        %err,
                        "failed attempt to write to the fragment queue, data will be lost"
                    );
                }
            }
        }

        let took_us = t_begin.elapsed().as_micros() as u64;
        this.counters
            .response_time_acc_us
            .fetch_add(took_us, Ordering::Relaxed);
        this.counters
            .response_time_max_us
            .fetch_max(took_us, Ordering::Relaxed);
        this.counters
            .response_time_min_us
            .fetch_min(took_us, Ordering::Relaxed);
        this.counters
            .num_requests_handled
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Classifies the request window and assembles the fragment. The caller
    /// holds the cleanup gate.
    fn data_request(this: &Arc<Self>, request: DataRequest) -> RequestResult {
        let (sourceid, detector_id, warn_on_empty_buffer) = {
            let settings = this.settings.read();
            (
                settings.sourceid,
                settings.detector_id,
                settings.warn_on_empty_buffer,
            )
        };
        let mut header =
            FragmentHeader::from_request(&request, F::FRAGMENT_TYPE, detector_id, sourceid);
        let mut pieces: Vec<FragmentPiece> = Vec::new();
        let result_code;

        if this.buffer.occupancy() == 0 {
            if warn_on_empty_buffer {
                warn!(sourceid = %sourceid, "request on empty buffer, data not found");
            }
            header.set_error_bit(FragmentErrorBit::DataNotFound);
            result_code = ResultCode::NotFound;
            this.counters.num_requests_bad.fetch_add(1, Ordering::Relaxed);
        } else {
            result_code = Self::gather_pieces(
                this,
                request.request_information.window_begin,
                request.request_information.window_end,
                &mut pieces,
            );
            debug!(
                trigger = request.trigger_number,
                sequence = request.sequence_number,
                window_begin = request.request_information.window_begin,
                window_end = request.request_information.window_end,
                occupancy = this.buffer.occupancy(),
                code = %result_code,
                pieces = pieces.len(),
                "classified data request"
            );
            let counters = &this.counters;
            match result_code {
                ResultCode::TooOld => {
                    counters.num_requests_old_window.fetch_add(1, Ordering::Relaxed);
                    counters.num_requests_bad.fetch_add(1, Ordering::Relaxed);
                    header.set_error_bit(FragmentErrorBit::DataNotFound);
                }
                ResultCode::PartiallyOld => {
                    counters.num_requests_old_window.fetch_add(1, Ordering::Relaxed);
                    counters.num_requests_found.fetch_add(1, Ordering::Relaxed);
                    header.set_error_bit(FragmentErrorBit::Incomplete);
                    header.set_error_bit(FragmentErrorBit::DataNotFound);
                }
                ResultCode::Found => {
                    counters.num_requests_found.fetch_add(1, Ordering::Relaxed);
                }
                ResultCode::Partial => {
                    header.set_error_bit(FragmentErrorBit::Incomplete);
                    counters.num_requests_delayed.fetch_add(1, Ordering::Relaxed);
                }
                ResultCode::NotYet => {
                    header.set_error_bit(FragmentErrorBit::DataNotFound);
                    counters.num_requests_delayed.fetch_add(1, Ordering::Relaxed);
                }
                ResultCode::NotFound => {
                    counters.num_requests_bad.fetch_add(1, Ordering::Relaxed);
                    header.set_error_bit(FragmentErrorBit::DataNotFound);
                }
                ResultCode::Unknown => {
                    counters.num_requests_bad.fetch_add(1, Ordering::Relaxed);
                    counters
                        .num_requests_uncategorized
                        .fetch_add(1, Ordering::Relaxed);
                    header.set_error_bit(FragmentErrorBit::DataNotFound);
                }
            }
        }

        // SAFETY: the pieces reference latency-buffer memory and the caller
        // holds the cleanup gate, so linearising here is the contract.
        let fragment = unsafe { Fragment::from_pieces(header, &pieces) };
        RequestResult {
            result_code,
            request,
            fragment,
        }
    }

    /// Walks the buffer for `[start_win, end_win)` and emits pieces in
    /// timestamp order covering a superset of the window's buffered data.
    fn gather_pieces(
        this: &Arc<Self>,
        start_win: Timestamp,
        end_win: Timestamp,
        pieces: &mut Vec<FragmentPiece>,
    ) -> ResultCode {
        let front_ts = match this.buffer.front_timestamp() {
            Some(ts) => ts,
            None => return ResultCode::NotFound,
        };
        let newest_ts = this.buffer.back_timestamp().unwrap_or(front_ts);

        if start_win > newest_ts {
            // Request is ahead of the data: give it another chance.
            return ResultCode::NotYet;
        }
        if end_win < front_ts {
            return ResultCode::TooOld;
        }

        // Starting one stride early picks up an element whose span covers
        // the window start.
        let key = start_win.saturating_sub(F::stride());
        let with_errors = this.error_registry.has_error(MISSING_FRAMES);
        let tick = F::EXPECTED_TICK_DIFFERENCE;

        let found = this
            .buffer
            .for_each_from(LookupStart::Key(key), with_errors, &mut |element| {
                let ts = element.timestamp();
                if ts >= end_win {
                    return std::ops::ControlFlow::Break(());
                }
                let span_end = ts + element.span();
                if span_end <= start_win {
                    // Entirely before the window: skip.
                } else if element.num_frames() > 1
                    && ((ts < start_win && span_end > start_win) || span_end > end_win)
                {
                    // The element straddles a boundary: emit sub-frames.
                    for index in 0..element.num_frames() {
                        let sub_ts = element.subframe_timestamp(index);
                        if sub_ts + tick > start_win && sub_ts < end_win {
                            pieces.push(FragmentPiece::from_slice(
                                sub_ts,
                                element.subframe_payload(index),
                            ));
                        }
                    }
                } else {
                    pieces.push(FragmentPiece::from_slice(ts, element.payload()));
                }
                std::ops::ControlFlow::Continue(())
            });

        if !found {
            return ResultCode::NotFound;
        }
        if end_win > newest_ts {
            ResultCode::Partial
        } else if start_win < front_ts {
            ResultCode::PartiallyOld
        } else {
            ResultCode::Found
        }
    }

    /// One cleanup pass: pop a configured fraction of the occupancy, never
    /// past the recording cursor, then retire stale error intervals.
    fn cleanup(this: &Arc<Self>) {
        let occupancy = this.buffer.occupancy();
        let (pop_limit_size, pop_size_pct) = {
            let settings = this.settings.read();
            (settings.pop_limit_size, settings.pop_size_pct)
        };
        if occupancy > pop_limit_size {
            this.counters.pop_reqs.fetch_add(1, Ordering::Relaxed);
            let to_pop = (pop_size_pct * occupancy as f32) as usize;
            let recording_cursor = this.next_timestamp_to_record.load(Ordering::Acquire);
            let mut popped = 0u64;
            for _ in 0..to_pop {
                match this.buffer.front_timestamp() {
                    Some(ts) if ts < recording_cursor => {
                        this.buffer.pop(1);
                        popped += 1;
                    }
                    _ => break,
                }
            }
            this.counters.pops_count.fetch_add(popped, Ordering::Relaxed);
            this.counters
                .occupancy
                .store(this.buffer.occupancy() as u64, Ordering::Relaxed);
            if let Some(front) = this.buffer.front_timestamp() {
                this.error_registry.remove_errors_until(front);
            }
        }
        this.counters.num_buffer_cleanups.fetch_add(1, Ordering::Relaxed);
    }

    /// Cleanup thread body: poll the watermark every 50 ms.
    fn periodic_cleanups(this: Arc<Self>) {
        while this.run_marker.load(Ordering::SeqCst) {
            let pop_limit_size = this.settings.read().pop_limit_size;
            this.gate.try_cleanup(
                || this.buffer.occupancy() > pop_limit_size,
                || Self::cleanup(&this),
            );
            thread::sleep(Duration::from_millis(50));
        }
    }

    /// Waiting-queue thread body: scan deferred requests every millisecond,
    /// retrying each at most once when its data arrived or its deadline
    /// passed. Remaining entries are retried terminally at stop.
    fn check_waiting_requests(this: Arc<Self>) {
        loop {
            if !this.run_marker.load(Ordering::SeqCst) {
                let drained: Vec<PendingRequest> = this.waiting.lock().drain(..).collect();
                for pending in drained {
                    Self::submit(&this, pending.request, true);
                }
                break;
            }
            {
                let mut waiting = this.waiting.lock();
                if !waiting.is_empty() {
                    let newest_ts = this.buffer.back_timestamp().unwrap_or(u64::MIN);
                    let (timeout_ms, warn_on_timeout, sourceid) = {
                        let settings = this.settings.read();
                        (
                            settings.request_timeout_ms,
                            settings.warn_on_timeout,
                            settings.sourceid,
                        )
                    };
                    let timeout = Duration::from_millis(timeout_ms);
                    waiting.retain(|pending| {
                        if pending.request.request_information.window_end < newest_ts {
                            Self::submit(&this, pending.request.clone(), true);
                            false
                        } else if pending.start_time.elapsed() >= timeout {
                            Self::submit(&this, pending.request.clone(), true);
                            if warn_on_timeout {
                                warn!(
                                    sourceid = %sourceid,
                                    trigger = pending.request.trigger_number,
                                    sequence = pending.request.sequence_number,
                                    run = pending.request.run_number,
                                    window_begin = pending.request.request_information.window_begin,
                                    window_end = pending.request.request_information.window_end,
                                    destination = %pending.request.data_destination,
                                    "request timed out"
                                );
                            }
                            this.counters.num_requests_bad.fetch_add(1, Ordering::Relaxed);
                            this.counters
                                .num_requests_timed_out
                                .fetch_add(1, Ordering::Relaxed);
                            false
                        } else {
                            true
                        }
                    });
                }
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Periodic-transmission thread body.
    fn periodic_data_transmissions(this: Arc<Self>) {
        let period = Duration::from_millis(
            this.settings.read().periodic_data_transmission_ms.max(1),
        );
        while this.run_marker.load(Ordering::SeqCst) {
            {
                let hook = this.periodic_hook.read();
                if let Some(hook) = hook.as_ref() {
                    if hook() {
                        this.counters.num_periodic_sent.fetch_add(1, Ordering::Relaxed);
                    } else {
                        this.counters
                            .num_periodic_send_failed
                            .fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            sleep_responsive(&this.run_marker, period);
        }
    }

    /// Buffered recording loop: advance a timestamp cursor through the
    /// buffer and copy payloads through the streaming writer.
    fn record_buffered(this: Arc<Self>, duration: Duration) {
        info!(seconds = duration.as_secs(), "start recording");
        this.next_timestamp_to_record.store(0, Ordering::Release);
        let started = Instant::now();

        while started.elapsed() < duration {
            let mut processed_chunks = 0usize;
            {
                let _guard = this.gate.begin_request();
                let mut cursor = this.next_timestamp_to_record.load(Ordering::Acquire);
                if cursor == 0 {
                    match this.buffer.front_timestamp() {
                        Some(front) => cursor = front,
                        None => {
                            drop(_guard);
                            thread::sleep(Duration::from_millis(1));
                            continue;
                        }
                    }
                }
                let mut writer_slot = this.writer.lock();
                if let Some(writer) = writer_slot.as_mut() {
                    let counters = &this.counters;
                    this.buffer
                        .for_each_from(LookupStart::Key(cursor), true, &mut |element| {
                            if processed_chunks >= 1000 {
                                return std::ops::ControlFlow::Break(());
                            }
                            let ts = element.timestamp();
                            if ts >= cursor {
                                if !writer.write(element.payload()) {
                                    counters.failed_record_writes.fetch_add(1, Ordering::Relaxed);
                                    warn!(path = %writer.path().display(), "could not write to file");
                                }
                                counters.payloads_recorded.fetch_add(1, Ordering::Relaxed);
                                counters
                                    .bytes_recorded
                                    .fetch_add(element.payload_size() as u64, Ordering::Relaxed);
                                processed_chunks += 1;
                                cursor = ts + element.span();
                            }
                            std::ops::ControlFlow::Continue(())
                        });
                }
                this.next_timestamp_to_record.store(cursor, Ordering::Release);
            }
            if processed_chunks == 0 {
                thread::sleep(Duration::from_millis(1));
            }
        }

        this.next_timestamp_to_record.store(u64::MAX, Ordering::Release);
        if let Some(writer) = this.writer.lock().as_mut() {
            writer.flush();
        }
        info!("stop recording");
        this.recording.store(false, Ordering::SeqCst);
    }
}

/// Sleeps `total` in small slices, returning early when the run marker
/// clears, so shutdown latency stays bounded.
fn sleep_responsive(run_marker: &AtomicBool, total: Duration) {
    let slice = Duration::from_millis(10);
    let started = Instant::now();
    while started.elapsed() < total {
        thread::sleep(slice.min(total - started.elapsed()));
        if !run_marker.load(Ordering::SeqCst) {
            break;
        }
    }
}

// ---------------------------------------------------------------------------
// Default request handler
// ---------------------------------------------------------------------------

/// The default per-link request handler.
pub struct RequestHandler<F: FrameType, B: LatencyBuffer<F>> {
    shared: Arc<Shared<F, B>>,
    handler_threads: usize,
    pool_workers: Mutex<Vec<JoinHandle<()>>>,
    service_threads: Mutex<Vec<JoinHandle<()>>>,
    recording_thread: Mutex<Option<JoinHandle<()>>>,
}

impl<F: FrameType, B: LatencyBuffer<F>> RequestHandler<F, B> {
    /// Installs the hook invoked by the periodic-transmission thread.
    pub fn set_periodic_transmission(&self, hook: PeriodicTransmission) {
        *self.shared.periodic_hook.write() = Some(hook);
    }

    /// Counter snapshot.
    pub fn stats(&self) -> HandlerStats {
        let c = &self.shared.counters;
        HandlerStats {
            num_requests_found: c.num_requests_found.load(Ordering::Relaxed),
            num_requests_bad: c.num_requests_bad.load(Ordering::Relaxed),
            num_requests_old_window: c.num_requests_old_window.load(Ordering::Relaxed),
            num_requests_delayed: c.num_requests_delayed.load(Ordering::Relaxed),
            num_requests_uncategorized: c.num_requests_uncategorized.load(Ordering::Relaxed),
            num_requests_timed_out: c.num_requests_timed_out.load(Ordering::Relaxed),
            num_requests_handled: c.num_requests_handled.load(Ordering::Relaxed),
            num_requests_waiting: self.shared.waiting.lock().len() as u64,
            num_buffer_cleanups: c.num_buffer_cleanups.load(Ordering::Relaxed),
            pop_reqs: c.pop_reqs.load(Ordering::Relaxed),
            pops_count: c.pops_count.load(Ordering::Relaxed),
            occupancy: c.occupancy.load(Ordering::Relaxed),
            response_time_acc_us: c.response_time_acc_us.load(Ordering::Relaxed),
            response_time_min_us: c.response_time_min_us.load(Ordering::Relaxed),
            response_time_max_us: c.response_time_max_us.load(Ordering::Relaxed),
            payloads_recorded: c.payloads_recorded.load(Ordering::Relaxed),
            bytes_recorded: c.bytes_recorded.load(Ordering::Relaxed),
            failed_record_writes: c.failed_record_writes.load(Ordering::Relaxed),
            num_periodic_sent: c.num_periodic_sent.load(Ordering::Relaxed),
            num_periodic_send_failed: c.num_periodic_send_failed.load(Ordering::Relaxed),
            recording_active: self.shared.recording.load(Ordering::SeqCst),
        }
    }

    /// Services a request synchronously and returns the classified result.
    /// Used by tests and diagnostic tooling; production requests go through
    /// [`RequestHandling::issue_request`].
    pub fn execute(&self, request: DataRequest) -> RequestResult {
        let _guard = self.shared.gate.begin_request();
        Shared::data_request(&self.shared, request)
    }
}

impl<F: FrameType, B: LatencyBuffer<F>> RequestHandling<F, B> for RequestHandler<F, B> {
    fn build(buffer: Arc<B>, error_registry: Arc<FrameErrorRegistry>) -> Self {
        debug!("default request handler created");
        Self {
            shared: Arc::new(Shared {
                buffer,
                error_registry,
                gate: CleanupGate::default(),
                waiting: Mutex::new(Vec::new()),
                fragment_sender: RwLock::new(None),
                settings: RwLock::new(Settings::default()),
                job_tx: Mutex::new(None),
                run_marker: AtomicBool::new(false),
                recording: AtomicBool::new(false),
                next_timestamp_to_record: AtomicU64::new(u64::MAX),
                writer: Mutex::new(None),
                zero_copy: Mutex::new(None),
                periodic_hook: RwLock::new(None),
                counters: Counters::default(),
                _frame: std::marker::PhantomData,
            }),
            handler_threads: 1,
            pool_workers: Mutex::new(Vec::new()),
            service_threads: Mutex::new(Vec::new()),
            recording_thread: Mutex::new(None),
        }
    }

    fn conf(
        &mut self,
        cfg: &DataHandlerConfig,
        fragment_sender: Arc<dyn FragmentSender>,
    ) -> Result<()> {
        let sourceid = SourceId::new(F::SUBSYSTEM, cfg.source_id);
        let rh = &cfg.request_handler;
        rh.validate(sourceid)?;

        let capacity = self.shared.buffer.capacity();
        let pop_limit_size = (rh.pop_limit_pct * capacity as f32) as usize;
        let max_requested_elements =
            pop_limit_size - (pop_limit_size as f32 * rh.pop_size_pct) as usize;
        self.handler_threads = rh.handler_threads;

        {
            let mut settings = self.shared.settings.write();
            let recording_configured = settings.recording_configured;
            *settings = Settings {
                sourceid,
                detector_id: cfg.detector_id,
                pop_limit_size,
                pop_size_pct: rh.pop_size_pct,
                max_requested_elements,
                request_timeout_ms: rh.request_timeout_ms,
                fragment_send_timeout_ms: rh.fragment_send_timeout_ms,
                warn_on_timeout: rh.warn_on_timeout,
                warn_on_empty_buffer: rh.warn_on_empty_buffer,
                periodic_data_transmission_ms: rh.periodic_data_transmission_ms,
                recording_configured,
            };
        }
        *self.shared.fragment_sender.write() = Some(fragment_sender);

        // Recording files are opened once; a re-conf mid-session must not
        // reopen them under an active cursor.
        if !self.shared.settings.read().recording_configured {
            if let Some(recorder_cfg) = &rh.data_recorder {
                if !recorder_cfg.output_file.as_os_str().is_empty() {
                    if recorder_cfg.zero_copy {
                        let recorder = ZeroCopyRecorder::configure::<F, B>(
                            recorder_cfg,
                            &self.shared.buffer,
                            sourceid,
                        )?;
                        *self.shared.zero_copy.lock() = Some(recorder);
                    } else {
                        if std::fs::remove_file(&recorder_cfg.output_file).is_ok() {
                            debug!(
                                path = %recorder_cfg.output_file.display(),
                                "removed existing output file from previous run"
                            );
                        }
                        let writer = BufferedFileWriter::open(
                            &recorder_cfg.output_file,
                            recorder_cfg.streaming_buffer_size,
                            recorder_cfg.compression_algorithm,
                            recorder_cfg.use_o_direct,
                        )?;
                        *self.shared.writer.lock() = Some(writer);
                    }
                    self.shared.settings.write().recording_configured = true;
                }
            }
        }

        debug!(
            sourceid = %sourceid,
            pop_limit_pct = rh.pop_limit_pct,
            pop_size_pct = rh.pop_size_pct,
            max_requested_elements,
            "request handler configured"
        );
        Ok(())
    }

    fn scrap(&mut self) {
        if let Some(mut writer) = self.shared.writer.lock().take() {
            if writer.is_open() {
                let _ = writer.close();
            }
        }
        *self.shared.zero_copy.lock() = None;
        self.shared.waiting.lock().clear();
        self.shared.settings.write().recording_configured = false;
    }

    fn start(&self, _run_number: RunNumber) {
        self.shared.counters.reset();
        self.shared.run_marker.store(true, Ordering::SeqCst);

        let (tx, rx) = unbounded::<Job>();
        *self.shared.job_tx.lock() = Some(tx);
        let mut pool = self.pool_workers.lock();
        for index in 0..self.handler_threads {
            let rx = rx.clone();
            pool.push(
                thread::Builder::new()
                    .name(format!("request-{index}"))
                    .spawn(move || {
                        while let Ok(job) = rx.recv() {
                            job();
                        }
                    })
                    .expect("spawn request worker"),
            );
        }

        let mut threads = self.service_threads.lock();
        let shared = Arc::clone(&self.shared);
        threads.push(
            thread::Builder::new()
                .name("cleanup".into())
                .spawn(move || Shared::periodic_cleanups(shared))
                .expect("spawn cleanup thread"),
        );
        let shared = Arc::clone(&self.shared);
        threads.push(
            thread::Builder::new()
                .name("waiting-queue".into())
                .spawn(move || Shared::check_waiting_requests(shared))
                .expect("spawn waiting-queue thread"),
        );
        if self.shared.settings.read().periodic_data_transmission_ms > 0 {
            let shared = Arc::clone(&self.shared);
            threads.push(
                thread::Builder::new()
                    .name("periodic-tx".into())
                    .spawn(move || Shared::periodic_data_transmissions(shared))
                    .expect("spawn periodic-tx thread"),
            );
        }
    }

    fn stop(&self) {
        self.shared.run_marker.store(false, Ordering::SeqCst);

        // A pending recording completes on its own bounded schedule.
        if let Some(handle) = self.recording_thread.lock().take() {
            if handle.join().is_err() {
                error!("recording thread panicked");
            }
        }
        for handle in self.service_threads.lock().drain(..) {
            if handle.join().is_err() {
                error!("request-handler service thread panicked");
            }
        }
        // Closing the job channel lets the pool drain outstanding requests
        // (including terminal retries queued by the waiting-list drain).
        *self.shared.job_tx.lock() = None;
        for handle in self.pool_workers.lock().drain(..) {
            if handle.join().is_err() {
                error!("request worker panicked");
            }
        }
    }

    fn record(&self, duration: Duration) -> Result<()> {
        let sourceid = self.shared.settings.read().sourceid;
        if duration.is_zero() {
            return Err(ReadoutError::command(
                sourceid,
                "recording for 0 seconds requested, command ignored",
            ));
        }
        if self.shared.recording.swap(true, Ordering::SeqCst) {
            return Err(ReadoutError::command(
                sourceid,
                "a recording is still running, no new recording was started",
            ));
        }

        let zero_copy = self.shared.zero_copy.lock().is_some();
        let buffered = self.shared.writer.lock().as_ref().map_or(false, |w| w.is_open());
        if !zero_copy && !buffered {
            self.shared.recording.store(false, Ordering::SeqCst);
            return Err(ReadoutError::command(
                sourceid,
                "not configured for recording",
            ));
        }

        // Reap a previously finished recording before storing the new one.
        if let Some(handle) = self.recording_thread.lock().take() {
            let _ = handle.join();
        }

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("recording".into())
            .spawn(move || {
                if zero_copy {
                    ZeroCopyRecorder::record::<F, B>(
                        &shared.zero_copy,
                        &shared.buffer,
                        &shared.gate,
                        &shared.next_timestamp_to_record,
                        &shared.counters,
                        duration,
                    );
                    shared.recording.store(false, Ordering::SeqCst);
                } else {
                    Shared::record_buffered(shared, duration);
                }
            })
            .expect("spawn recording thread");
        *self.recording_thread.lock() = Some(handle);
        Ok(())
    }

    fn issue_request(&self, request: DataRequest, is_retry: bool) {
        Shared::submit(&self.shared, request, is_retry);
    }
}

impl<F: FrameType, B: LatencyBuffer<F>> Drop for RequestHandler<F, B> {
    fn drop(&mut self) {
        if self.shared.run_marker.load(Ordering::SeqCst) {
            self.stop();
        }
    }
}
