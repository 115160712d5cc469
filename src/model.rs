//! The per-link data-handling model: owns the latency buffer, the raw
//! processor and the request handler, and runs the consumer, time-sync and
//! request-dispatcher threads.
//!
//! Lifecycle: `new` → `conf` → `start` → `stop` (→ `start` …) → `scrap`.
//! Configuration is applied bottom-up (processor, then buffer, then request
//! handler, so the handler can inspect buffer alignment). Teardown reverses
//! bring-up: the dispatcher detaches first so no new requests arrive, then
//! the request handler drains, then time-sync and the consumer join, the
//! buffer is flushed and the processor is torn down.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::buffer::{LatencyBuffer, LookupStart};
use crate::callback::DataMoveCallbackRegistry;
use crate::config::DataHandlerConfig;
use crate::error::{ReadoutError, Result};
use crate::frame::FrameType;
use crate::handler::RequestHandling;
use crate::io::{FragmentSender, FrameReceiver, RequestReceiver, TimeSyncSender};
use crate::processor::RawDataProcessor;
use crate::registry::FrameErrorRegistry;
use crate::types::{
    DataRequest, RequestInfo, RunNumber, SourceId, TimeSync, Timestamp, DTS_TICKS_PER_MS,
};

/// IO endpoints of one link, bound at `conf`.
///
/// The raw-input connection name selects the consumer flavour: a `cb`-prefixed
/// name means push mode (an external IO thread delivers frames through the
/// process-wide callback registry), anything else means pull mode and
/// requires `raw_receiver`.
pub struct ModelEndpoints<F: FrameType> {
    pub raw_input_name: String,
    pub raw_receiver: Option<Box<dyn FrameReceiver<F>>>,
    pub request_receiver: Box<dyn RequestReceiver>,
    pub fragment_sender: Arc<dyn FragmentSender>,
    pub timesync_sender: Option<Arc<dyn TimeSyncSender>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Fresh,
    Configured,
    Running,
}

#[derive(Default)]
struct ModelCounters {
    num_payloads: AtomicU64,
    sum_payloads: AtomicU64,
    num_requests: AtomicU64,
    sum_requests: AtomicU64,
    num_payloads_overwritten: AtomicU64,
    rawq_timeout_count: AtomicU64,
    stats_packet_count: AtomicU64,
    num_late_packets: AtomicU64,
}

/// Counter snapshot of one model.
#[derive(Debug, Clone, Default)]
pub struct ModelStats {
    pub num_payloads: u64,
    pub sum_payloads: u64,
    pub num_requests: u64,
    pub sum_requests: u64,
    pub num_payloads_overwritten: u64,
    pub rawq_timeout_count: u64,
    pub num_late_packets: u64,
    pub last_daq_time: Timestamp,
    pub occupancy: usize,
}

struct Parts<F: FrameType, B: LatencyBuffer<F>, H: RequestHandling<F, B>> {
    error_registry: Arc<FrameErrorRegistry>,
    buffer: Arc<B>,
    processor: Arc<RawDataProcessor<F>>,
    handler: Arc<H>,
    raw_receiver: Option<Arc<dyn FrameReceiver<F>>>,
    request_receiver: Arc<dyn RequestReceiver>,
    timesync_sender: Option<Arc<dyn TimeSyncSender>>,
}

/// Everything the consume path needs, shared with the consumer thread and
/// the push-mode callback.
struct ConsumeCtx<F: FrameType, B: LatencyBuffer<F>, H: RequestHandling<F, B>> {
    buffer: Arc<B>,
    processor: Arc<RawDataProcessor<F>>,
    handler: Arc<H>,
    counters: Arc<ModelCounters>,
    run_number: RunNumber,
    processing_delay_ticks: u64,
}

impl<F: FrameType, B: LatencyBuffer<F>, H: RequestHandling<F, B>> Clone for ConsumeCtx<F, B, H> {
    fn clone(&self) -> Self {
        Self {
            buffer: Arc::clone(&self.buffer),
            processor: Arc::clone(&self.processor),
            handler: Arc::clone(&self.handler),
            counters: Arc::clone(&self.counters),
            run_number: self.run_number,
            processing_delay_ticks: self.processing_delay_ticks,
        }
    }
}

/// One link's data-handling pipeline.
pub struct DataHandlingModel<F: FrameType, B: LatencyBuffer<F>, H: RequestHandling<F, B>> {
    run_marker: Arc<AtomicBool>,
    dispatcher_stop: Arc<AtomicBool>,
    state: State,
    sourceid: SourceId,
    cfg: DataHandlerConfig,
    callback_mode: bool,
    raw_input_name: String,
    run_number: RunNumber,
    counters: Arc<ModelCounters>,
    parts: Option<Parts<F, B, H>>,
    consumer_thread: Option<JoinHandle<()>>,
    timesync_thread: Option<JoinHandle<()>>,
    dispatcher_thread: Option<JoinHandle<()>>,
}

impl<F: FrameType, B: LatencyBuffer<F>, H: RequestHandling<F, B>> DataHandlingModel<F, B, H> {
    /// A pipeline instance sharing the process's run marker.
    pub fn new(run_marker: Arc<AtomicBool>) -> Self {
        Self {
            run_marker,
            dispatcher_stop: Arc::new(AtomicBool::new(false)),
            state: State::Fresh,
            sourceid: SourceId::default(),
            cfg: DataHandlerConfig::default(),
            callback_mode: false,
            raw_input_name: String::new(),
            run_number: 0,
            counters: Arc::new(ModelCounters::default()),
            parts: None,
            consumer_thread: None,
            timesync_thread: None,
            dispatcher_thread: None,
        }
    }

    /// Configures the pipeline and binds its endpoints.
    pub fn conf(&mut self, cfg: DataHandlerConfig, endpoints: ModelEndpoints<F>) -> Result<()> {
        self.conf_with_processor(cfg, endpoints, |_| {})
    }

    /// Like [`DataHandlingModel::conf`], additionally letting the caller
    /// register detector-specific pre/post-processing tasks.
    pub fn conf_with_processor(
        &mut self,
        cfg: DataHandlerConfig,
        endpoints: ModelEndpoints<F>,
        processor_setup: impl FnOnce(&mut RawDataProcessor<F>),
    ) -> Result<()> {
        let sourceid = SourceId::new(F::SUBSYSTEM, cfg.source_id);
        if self.state != State::Fresh {
            return Err(ReadoutError::command(sourceid, "module is already configured"));
        }
        cfg.validate(sourceid)?;

        self.callback_mode = endpoints
            .raw_input_name
            .split('_')
            .next()
            .is_some_and(|prefix| prefix == "cb");
        debug!(
            name = %endpoints.raw_input_name,
            callback_mode = self.callback_mode,
            "initializing raw-input connection"
        );
        if !self.callback_mode && endpoints.raw_receiver.is_none() {
            return Err(ReadoutError::configuration(
                sourceid,
                "non-callback mode, and receiver is unset",
            ));
        }

        let error_registry = Arc::new(FrameErrorRegistry::new());
        let buffer = Arc::new(B::new(&cfg.latency_buffer, sourceid)?);

        let mut processor = RawDataProcessor::new();
        processor.conf(&cfg, sourceid);
        processor_setup(&mut processor);
        let processor = Arc::new(processor);

        // The buffer is configured before the request handler so the handler
        // can check alignment restrictions.
        let mut handler = H::build(Arc::clone(&buffer), Arc::clone(&error_registry));
        handler.conf(&cfg, Arc::clone(&endpoints.fragment_sender))?;
        let handler = Arc::new(handler);

        if self.callback_mode {
            let ctx = ConsumeCtx {
                buffer: Arc::clone(&buffer),
                processor: Arc::clone(&processor),
                handler: Arc::clone(&handler),
                counters: Arc::clone(&self.counters),
                run_number: 0,
                // Delayed post-processing applies to the pull consumer only.
                processing_delay_ticks: 0,
            };
            DataMoveCallbackRegistry::instance().register_callback::<F>(
                &endpoints.raw_input_name,
                Arc::new(move |payload: F| consume_payload(&ctx, payload)),
            );
        }

        self.parts = Some(Parts {
            error_registry,
            buffer,
            processor,
            handler,
            raw_receiver: endpoints.raw_receiver.map(Arc::from),
            request_receiver: Arc::from(endpoints.request_receiver),
            timesync_sender: endpoints.timesync_sender,
        });
        self.sourceid = sourceid;
        self.raw_input_name = endpoints.raw_input_name;
        self.cfg = cfg;
        self.state = State::Configured;
        info!(sourceid = %sourceid, "data-handling model configured");
        Ok(())
    }

    /// Starts the run: resets counters, brings up the handler and processor,
    /// then the consumer, time-sync and dispatcher threads.
    pub fn start(&mut self, run_number: RunNumber) -> Result<()> {
        if self.state != State::Configured {
            return Err(ReadoutError::command(
                self.sourceid,
                "start received in wrong state",
            ));
        }
        let (buffer, processor, handler, raw_receiver, request_receiver, timesync_sender) = {
            let parts = self.parts.as_ref().expect("configured");
            (
                Arc::clone(&parts.buffer),
                Arc::clone(&parts.processor),
                Arc::clone(&parts.handler),
                parts.raw_receiver.clone(),
                Arc::clone(&parts.request_receiver),
                parts.timesync_sender.clone(),
            )
        };

        self.counters.num_payloads.store(0, Ordering::Relaxed);
        self.counters.sum_payloads.store(0, Ordering::Relaxed);
        self.counters.num_requests.store(0, Ordering::Relaxed);
        self.counters.sum_requests.store(0, Ordering::Relaxed);
        self.counters
            .num_payloads_overwritten
            .store(0, Ordering::Relaxed);
        self.counters.rawq_timeout_count.store(0, Ordering::Relaxed);
        self.counters.stats_packet_count.store(0, Ordering::Relaxed);
        self.counters.num_late_packets.store(0, Ordering::Relaxed);

        self.run_number = run_number;
        self.run_marker.store(true, Ordering::SeqCst);
        self.dispatcher_stop.store(false, Ordering::SeqCst);

        debug!("starting threads");
        processor.start();
        handler.start(run_number);

        if !self.callback_mode {
            let ctx = ConsumeCtx {
                buffer: Arc::clone(&buffer),
                processor: Arc::clone(&processor),
                handler: Arc::clone(&handler),
                counters: Arc::clone(&self.counters),
                run_number,
                processing_delay_ticks: self.cfg.post_processing_delay_ticks,
            };
            let receiver = Arc::clone(raw_receiver.as_ref().expect("checked at conf"));
            let run_marker = Arc::clone(&self.run_marker);
            let timeout = Duration::from_millis(self.cfg.raw_receiver_timeout_ms);
            let idle_sleep = Duration::from_micros(self.cfg.raw_receiver_sleep_us);
            self.consumer_thread = Some(
                thread::Builder::new()
                    .name(format!("consumer-{}", self.sourceid.id))
                    .spawn(move || run_consume(ctx, receiver, run_marker, timeout, idle_sleep))
                    .expect("spawn consumer thread"),
            );
        }

        if self.cfg.generate_timesync {
            if let Some(sender) = timesync_sender {
                let processor = Arc::clone(&processor);
                let handler = Arc::clone(&handler);
                let counters = Arc::clone(&self.counters);
                let run_marker = Arc::clone(&self.run_marker);
                let sourceid = self.sourceid;
                let fake_trigger = self.cfg.fake_trigger;
                self.timesync_thread = Some(
                    thread::Builder::new()
                        .name(format!("timesync-{}", self.sourceid.id))
                        .spawn(move || {
                            run_timesync::<F, B, H>(
                                processor,
                                handler,
                                sender,
                                counters,
                                run_marker,
                                run_number,
                                sourceid,
                                fake_trigger,
                            )
                        })
                        .expect("spawn timesync thread"),
                );
            }
        }

        let counters = Arc::clone(&self.counters);
        let dispatcher_stop = Arc::clone(&self.dispatcher_stop);
        let sourceid = self.sourceid;
        self.dispatcher_thread = Some(
            thread::Builder::new()
                .name(format!("dispatch-{}", self.sourceid.id))
                .spawn(move || {
                    run_dispatcher::<F, B, H>(
                        request_receiver,
                        handler,
                        counters,
                        dispatcher_stop,
                        sourceid,
                    )
                })
                .expect("spawn dispatcher thread"),
        );

        self.state = State::Running;
        info!(sourceid = %self.sourceid, run_number, "data-handling model started");
        Ok(())
    }

    /// Stops the run, joining every thread in reverse bring-up order.
    pub fn stop(&mut self) -> Result<()> {
        if self.state != State::Running {
            return Err(ReadoutError::command(
                self.sourceid,
                "stop received in wrong state",
            ));
        }
        let (buffer, processor, handler) = {
            let parts = self.parts.as_ref().expect("configured");
            (
                Arc::clone(&parts.buffer),
                Arc::clone(&parts.processor),
                Arc::clone(&parts.handler),
            )
        };
        debug!("stopping threads");

        // Detach the dispatcher first so no new requests arrive while the
        // handler drains.
        self.dispatcher_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.dispatcher_thread.take() {
            if handle.join().is_err() {
                error!("dispatcher thread panicked");
            }
        }

        handler.stop();

        self.run_marker.store(false, Ordering::SeqCst);
        if let Some(handle) = self.timesync_thread.take() {
            if handle.join().is_err() {
                error!("timesync thread panicked");
            }
        }
        if let Some(handle) = self.consumer_thread.take() {
            if handle.join().is_err() {
                error!("consumer thread panicked");
            }
        }

        debug!(occupancy = buffer.occupancy(), "flushing latency buffer");
        buffer.flush();
        processor.stop();
        processor.reset_last_daq_time();

        self.state = State::Configured;
        info!(sourceid = %self.sourceid, "data-handling model stopped");
        Ok(())
    }

    /// Records raw data for `duration`; forwarded to the request handler.
    pub fn record(&self, duration: Duration) -> Result<()> {
        match &self.parts {
            Some(parts) => parts.handler.record(duration),
            None => Err(ReadoutError::command(
                self.sourceid,
                "record received before conf",
            )),
        }
    }

    /// Releases all pipeline memory. Requires a stopped pipeline.
    pub fn scrap(&mut self) -> Result<()> {
        if self.state == State::Running {
            return Err(ReadoutError::command(
                self.sourceid,
                "scrap received while running",
            ));
        }
        if self.callback_mode {
            DataMoveCallbackRegistry::instance().deregister(&self.raw_input_name);
        }
        if let Some(mut parts) = self.parts.take() {
            if let Some(handler) = Arc::get_mut(&mut parts.handler) {
                handler.scrap();
            }
        }
        self.state = State::Fresh;
        Ok(())
    }

    /// The error registry of this link, for pre-processors that flag frame
    /// errors.
    pub fn error_registry(&self) -> Option<Arc<FrameErrorRegistry>> {
        self.parts.as_ref().map(|p| Arc::clone(&p.error_registry))
    }

    /// The underlying request handler.
    pub fn handler(&self) -> Option<Arc<H>> {
        self.parts.as_ref().map(|p| Arc::clone(&p.handler))
    }

    /// Counter snapshot.
    pub fn stats(&self) -> ModelStats {
        let c = &self.counters;
        ModelStats {
            num_payloads: c.num_payloads.load(Ordering::Relaxed),
            sum_payloads: c.sum_payloads.load(Ordering::Relaxed),
            num_requests: c.num_requests.load(Ordering::Relaxed),
            sum_requests: c.sum_requests.load(Ordering::Relaxed),
            num_payloads_overwritten: c.num_payloads_overwritten.load(Ordering::Relaxed),
            rawq_timeout_count: c.rawq_timeout_count.load(Ordering::Relaxed),
            num_late_packets: c.num_late_packets.load(Ordering::Relaxed),
            last_daq_time: self
                .parts
                .as_ref()
                .map(|p| p.processor.get_last_daq_time())
                .unwrap_or(0),
            occupancy: self.parts.as_ref().map(|p| p.buffer.occupancy()).unwrap_or(0),
        }
    }
}

/// The inner consume function, shared by the pull consumer and the push-mode
/// callback: pre-process, late check, buffer write, inline post-process.
fn consume_payload<F: FrameType, B: LatencyBuffer<F>, H: RequestHandling<F, B>>(
    ctx: &ConsumeCtx<F, B, H>,
    mut payload: F,
) {
    ctx.processor.preprocess_item(&mut payload);
    if ctx.handler.supports_cutoff_timestamp() {
        let cutoff = ctx.handler.cutoff_timestamp();
        let tick_diff = payload.timestamp() as i64 - cutoff as i64;
        if tick_diff <= 0 {
            warn!(
                run = ctx.run_number,
                payload_timestamp = payload.timestamp(),
                cutoff,
                tick_diff,
                msec_diff = tick_diff as f64 / DTS_TICKS_PER_MS as f64,
                "received a late data packet"
            );
            ctx.counters.num_late_packets.fetch_add(1, Ordering::Relaxed);
        }
    }
    if !ctx.buffer.write(payload) {
        ctx.counters
            .num_payloads_overwritten
            .fetch_add(1, Ordering::Relaxed);
    }
    if ctx.processing_delay_ticks == 0 {
        if let Some(ptr) = ctx.buffer.back_frame_ptr() {
            // SAFETY: the pointer targets the element just written by this
            // thread; post-processing tolerates later overwrites.
            ctx.processor.postprocess_item(unsafe { &*ptr });
        }
        ctx.counters.num_payloads.fetch_add(1, Ordering::Relaxed);
        ctx.counters.sum_payloads.fetch_add(1, Ordering::Relaxed);
        ctx.counters.stats_packet_count.fetch_add(1, Ordering::Relaxed);
    }
}

/// Pull-mode consumer loop with the optional delayed post-processing pass.
fn run_consume<F: FrameType, B: LatencyBuffer<F>, H: RequestHandling<F, B>>(
    ctx: ConsumeCtx<F, B, H>,
    receiver: Arc<dyn FrameReceiver<F>>,
    run_marker: Arc<AtomicBool>,
    timeout: Duration,
    idle_sleep: Duration,
) {
    debug!("consumer thread started");
    let delay_ticks = ctx.processing_delay_ticks;
    let mut postprocess_cursor: Timestamp = 0;
    let mut first_cycle = true;
    let mut last_post_proc_time = Instant::now();

    while run_marker.load(Ordering::SeqCst) {
        match receiver.try_receive(timeout) {
            Some(payload) => consume_payload(&ctx, payload),
            None => {
                ctx.counters.rawq_timeout_count.fetch_add(1, Ordering::Relaxed);
                // Protection against a zero sleep becoming a yield.
                if !idle_sleep.is_zero() {
                    thread::sleep(idle_sleep);
                }
            }
        }

        // Deferred post-processing: hand over only data old enough for
        // out-of-order elements to have settled.
        if delay_ticks != 0 && ctx.buffer.occupancy() > 0 {
            if last_post_proc_time.elapsed() > Duration::from_millis(1) {
                last_post_proc_time = Instant::now();
                let newest_ts = match ctx.buffer.back_timestamp() {
                    Some(ts) => ts,
                    None => continue,
                };
                if first_cycle {
                    if let Some(front) = ctx.buffer.front_timestamp() {
                        postprocess_cursor = front;
                        first_cycle = false;
                        info!("first pass of delayed post-processing");
                    }
                }
                if newest_ts.saturating_sub(postprocess_cursor) > delay_ticks {
                    let end_win_ts = newest_ts - delay_ticks;
                    ctx.buffer.for_each_from(
                        LookupStart::Key(postprocess_cursor),
                        false,
                        &mut |element| {
                            if element.timestamp() >= end_win_ts {
                                return std::ops::ControlFlow::Break(());
                            }
                            ctx.processor.postprocess_item(element);
                            ctx.counters.num_payloads.fetch_add(1, Ordering::Relaxed);
                            ctx.counters.sum_payloads.fetch_add(1, Ordering::Relaxed);
                            ctx.counters
                                .stats_packet_count
                                .fetch_add(1, Ordering::Relaxed);
                            std::ops::ControlFlow::Continue(())
                        },
                    );
                    postprocess_cursor = end_win_ts;
                }
            }
        }
    }
    debug!("consumer thread joins");
}

/// Time-sync loop: every ~100 ms, advertise a fresh DAQ timestamp.
#[allow(clippy::too_many_arguments)]
fn run_timesync<F: FrameType, B: LatencyBuffer<F>, H: RequestHandling<F, B>>(
    processor: Arc<RawDataProcessor<F>>,
    handler: Arc<H>,
    sender: Arc<dyn TimeSyncSender>,
    counters: Arc<ModelCounters>,
    run_marker: Arc<AtomicBool>,
    run_number: RunNumber,
    sourceid: SourceId,
    fake_trigger: bool,
) {
    debug!("timesync thread started");
    let mut sequence_number = 0u64;
    let mut prev_timestamp: Timestamp = 0;
    let mut once_per_run = true;
    let mut fake_trigger_id = 0u64;
    let mut zero_timestamp_count = 0u64;
    let mut duplicate_timestamp_count = 0u64;
    let mut total_timestamp_count = 0u64;

    while run_marker.load(Ordering::SeqCst) {
        let daq_time = processor.get_last_daq_time();
        total_timestamp_count += 1;
        // daq_time is zero before the first frame, and unchanged when data
        // stopped flowing; neither is worth a beacon.
        if daq_time != 0 && daq_time != prev_timestamp {
            prev_timestamp = daq_time;
            sequence_number += 1;
            let mut message = TimeSync::new(daq_time);
            message.run_number = run_number;
            message.sequence_number = sequence_number;
            debug!(
                daq = message.daq_time,
                wall = message.system_time,
                run = message.run_number,
                seqno = message.sequence_number,
                pid = message.source_pid,
                "new timesync"
            );
            if let Err(err) = sender.send(message, Duration::from_millis(500)) {
                warn!(sourceid = %sourceid, %err, "failed to send TimeSync message");
            }

            if fake_trigger {
                fake_trigger_id += 1;
                let trigger_timestamp = daq_time.saturating_sub(500 * DTS_TICKS_PER_MS / 1_000);
                let window_begin = trigger_timestamp.saturating_sub(100);
                let request = DataRequest {
                    trigger_number: fake_trigger_id,
                    sequence_number: 0,
                    run_number,
                    trigger_timestamp,
                    request_information: RequestInfo {
                        component: sourceid,
                        window_begin,
                        window_end: window_begin + 300_000,
                    },
                    data_destination: "data_fragments_q".into(),
                };
                debug!(
                    ts = trigger_timestamp,
                    window_begin,
                    window_end = window_begin + 300_000,
                    "issuing fake trigger based on timesync"
                );
                handler.issue_request(request, false);
                counters.num_requests.fetch_add(1, Ordering::Relaxed);
                counters.sum_requests.fetch_add(1, Ordering::Relaxed);
            }
        } else {
            if daq_time == 0 {
                zero_timestamp_count += 1;
                if once_per_run {
                    info!("timesync with DAQ time 0 won't be sent out as it's an invalid sync");
                    once_per_run = false;
                }
            } else {
                duplicate_timestamp_count += 1;
            }
        }
        // Split the 100 ms sleep into slices so stop is answered quickly.
        for _ in 0..10 {
            thread::sleep(Duration::from_millis(10));
            if !run_marker.load(Ordering::SeqCst) {
                break;
            }
        }
    }
    debug!(
        zero = zero_timestamp_count,
        duplicate = duplicate_timestamp_count,
        total = total_timestamp_count,
        "timesync thread joins"
    );
}

/// Request-dispatcher loop: validate the source id and forward to the
/// handler.
fn run_dispatcher<F: FrameType, B: LatencyBuffer<F>, H: RequestHandling<F, B>>(
    receiver: Arc<dyn RequestReceiver>,
    handler: Arc<H>,
    counters: Arc<ModelCounters>,
    dispatcher_stop: Arc<AtomicBool>,
    sourceid: SourceId,
) {
    while !dispatcher_stop.load(Ordering::SeqCst) {
        let Some(request) = receiver.try_receive(Duration::from_millis(100)) else {
            continue;
        };
        if request.request_information.component != sourceid {
            error!(
                sourceid = %sourceid,
                requested = %request.request_information.component,
                "got request for a different source id, dropping"
            );
            continue;
        }
        debug!(
            trigger = request.trigger_number,
            sequence = request.sequence_number,
            run = request.run_number,
            window_begin = request.request_information.window_begin,
            window_end = request.request_information.window_end,
            destination = %request.data_destination,
            "received data request"
        );
        handler.issue_request(request, false);
        counters.num_requests.fetch_add(1, Ordering::Relaxed);
        counters.sum_requests.fetch_add(1, Ordering::Relaxed);
    }
}
