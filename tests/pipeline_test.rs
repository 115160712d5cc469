//! End-to-end pipeline tests: frames in through a channel (or the
//! emulator), requests in through the dispatcher, fragments and time-sync
//! beacons out.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use daq_readout::config::{
    DataHandlerConfig, DataRecorderConfig, EmulatorConfig, LatencyBufferConfig,
    RequestHandlerConfig,
};
use daq_readout::emulator::SourceEmulator;
use daq_readout::frame::{DummyFrame, FrameType};
use daq_readout::io::{
    frame_channel, request_channel, ChannelFragmentSender, ChannelFrameSender, FrameSender,
};
use daq_readout::model::ModelEndpoints;
use daq_readout::types::{
    DataRequest, FragmentErrorBit, RequestInfo, SourceId, Subsystem, TimeSync,
};
use daq_readout::DefaultDataHandlingModel;

const SOURCE: u32 = 3;
const DESTINATION: &str = "data_fragments_q";

/// Wire the crate's tracing output into the test harness; run with
/// `RUST_LOG=daq_readout=debug` to watch the pipeline work.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct Harness {
    model: DefaultDataHandlingModel<DummyFrame>,
    frame_tx: ChannelFrameSender<DummyFrame>,
    request_tx: crossbeam_channel::Sender<DataRequest>,
    fragments: crossbeam_channel::Receiver<daq_readout::Fragment>,
    timesyncs: crossbeam_channel::Receiver<TimeSync>,
}

fn harness(cfg: DataHandlerConfig) -> Harness {
    harness_with_processor(cfg, |_| {})
}

fn harness_with_processor(
    cfg: DataHandlerConfig,
    setup: impl FnOnce(&mut daq_readout::processor::RawDataProcessor<DummyFrame>),
) -> Harness {
    init_tracing();
    let (frame_tx, frame_rx) = frame_channel::<DummyFrame>(4096);
    let (request_tx, request_rx) = request_channel(256);
    let fragment_sender = ChannelFragmentSender::new();
    let fragments = fragment_sender.add_destination(DESTINATION, 256);
    let (timesync_tx, timesyncs) = daq_readout::io::timesync_channel(256);

    let mut model = DefaultDataHandlingModel::new(Arc::new(AtomicBool::new(false)));
    model
        .conf_with_processor(
            cfg,
            ModelEndpoints {
                raw_input_name: "raw_link_3".into(),
                raw_receiver: Some(Box::new(frame_rx)),
                request_receiver: Box::new(request_rx),
                fragment_sender,
                timesync_sender: Some(Arc::new(timesync_tx)),
            },
            setup,
        )
        .expect("conf");
    Harness {
        model,
        frame_tx,
        request_tx,
        fragments,
        timesyncs,
    }
}

fn base_cfg() -> DataHandlerConfig {
    DataHandlerConfig {
        source_id: SOURCE,
        latency_buffer: LatencyBufferConfig {
            size: 256,
            ..Default::default()
        },
        raw_receiver_timeout_ms: 20,
        ..Default::default()
    }
}

fn send_frames(tx: &ChannelFrameSender<DummyFrame>, timestamps: impl IntoIterator<Item = u64>) {
    for (i, ts) in timestamps.into_iter().enumerate() {
        tx.try_send(DummyFrame::new(ts, i as u64)).expect("channel has room");
    }
}

fn request_for(window_begin: u64, window_end: u64) -> DataRequest {
    DataRequest {
        trigger_number: window_begin / 1000,
        sequence_number: 0,
        run_number: 7,
        trigger_timestamp: window_begin,
        request_information: RequestInfo {
            component: SourceId::new(Subsystem::DetectorReadout, SOURCE),
            window_begin,
            window_end,
        },
        data_destination: DESTINATION.into(),
    }
}

fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

fn piece_timestamps(fragment: &daq_readout::Fragment) -> Vec<u64> {
    fragment
        .payload()
        .chunks(DummyFrame::ELEMENT_SIZE)
        .map(|chunk| DummyFrame::from_bytes(chunk).unwrap().timestamp())
        .collect()
}

#[test]
fn test_full_pipeline_serves_fragment_and_timesync() {
    let mut h = harness(base_cfg());
    h.model.start(7).unwrap();

    send_frames(&h.frame_tx, (0..20).map(|i| i * 1000));
    assert!(wait_until(Duration::from_secs(2), || h
        .model
        .stats()
        .num_payloads
        >= 20));

    h.request_tx.send(request_for(5_000, 8_000)).unwrap();
    let fragment = h
        .fragments
        .recv_timeout(Duration::from_secs(2))
        .expect("fragment");
    assert_eq!(fragment.header().error_bits, 0);
    assert_eq!(fragment.header().run_number, 7);
    assert_eq!(
        fragment.header().element_id,
        SourceId::new(Subsystem::DetectorReadout, SOURCE)
    );
    assert_eq!(piece_timestamps(&fragment), vec![5_000, 6_000, 7_000]);

    // Beacons advance strictly until they advertise the freshest timestamp.
    let mut last_beacon = TimeSync::new(0);
    let deadline = Instant::now() + Duration::from_secs(3);
    while last_beacon.daq_time != 19_000 && Instant::now() < deadline {
        if let Ok(beacon) = h.timesyncs.recv_timeout(Duration::from_millis(200)) {
            assert!(beacon.daq_time > last_beacon.daq_time, "beacons advance strictly");
            assert!(beacon.sequence_number > last_beacon.sequence_number);
            assert_eq!(beacon.run_number, 7);
            last_beacon = beacon;
        }
    }
    assert_eq!(last_beacon.daq_time, 19_000);

    // More data: the next beacon must advance past it.
    send_frames(&h.frame_tx, (20..25).map(|i| i * 1000));
    let next = h
        .timesyncs
        .recv_timeout(Duration::from_secs(2))
        .expect("beacon after new data");
    assert!(next.daq_time > last_beacon.daq_time);

    let stats = h.model.stats();
    assert_eq!(stats.num_requests, 1);
    assert_eq!(stats.num_payloads_overwritten, 0);

    h.model.stop().unwrap();
    // The dispatcher detached: no fragment for a late request.
    h.request_tx.send(request_for(0, 1_000)).unwrap();
    assert!(h.fragments.recv_timeout(Duration::from_millis(200)).is_err());
    h.model.scrap().unwrap();
}

#[test]
fn test_request_for_wrong_source_id_is_dropped() {
    let mut h = harness(base_cfg());
    h.model.start(1).unwrap();
    send_frames(&h.frame_tx, (0..5).map(|i| i * 1000));
    assert!(wait_until(Duration::from_secs(2), || h
        .model
        .stats()
        .num_payloads
        >= 5));

    let mut request = request_for(0, 2_000);
    request.request_information.component = SourceId::new(Subsystem::DetectorReadout, 99);
    h.request_tx.send(request).unwrap();
    assert!(h.fragments.recv_timeout(Duration::from_millis(300)).is_err());
    assert_eq!(h.model.stats().num_requests, 0);
    h.model.stop().unwrap();
}

#[test]
fn test_every_request_produces_exactly_one_fragment() {
    let mut cfg = base_cfg();
    cfg.request_handler = RequestHandlerConfig {
        request_timeout_ms: 300,
        ..Default::default()
    };
    let mut h = harness(cfg);
    h.model.start(1).unwrap();
    send_frames(&h.frame_tx, (0..10).map(|i| i * 1000));
    assert!(wait_until(Duration::from_secs(2), || h
        .model
        .stats()
        .num_payloads
        >= 10));

    // Fully served, partially served (deferred then timed out), and far
    // future (deferred then timed out).
    h.request_tx.send(request_for(0, 2_000)).unwrap();
    h.request_tx.send(request_for(8_000, 12_000)).unwrap();
    h.request_tx.send(request_for(50_000, 51_000)).unwrap();

    let mut received = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(3);
    while received.len() < 3 && Instant::now() < deadline {
        if let Ok(fragment) = h.fragments.recv_timeout(Duration::from_millis(100)) {
            received.push(fragment);
        }
    }
    assert_eq!(received.len(), 3, "every request answers exactly once");
    // And no extras.
    assert!(h.fragments.recv_timeout(Duration::from_millis(200)).is_err());
    h.model.stop().unwrap();
}

#[test]
fn test_delayed_post_processing_waits_for_settling() {
    let mut cfg = base_cfg();
    cfg.post_processing_delay_ticks = 5_000;
    let processed = Arc::new(AtomicU64::new(0));
    let newest_seen = Arc::new(AtomicU64::new(0));
    let (p, n) = (Arc::clone(&processed), Arc::clone(&newest_seen));
    let mut h = harness_with_processor(cfg, move |processor| {
        processor.add_postprocess_task(move |frame: &DummyFrame| {
            p.fetch_add(1, Ordering::SeqCst);
            n.fetch_max(frame.timestamp(), Ordering::SeqCst);
        });
    });
    h.model.start(1).unwrap();

    send_frames(&h.frame_tx, (0..10).map(|i| i * 1000));
    // Only data older than newest - delay is handed over: 0..=3000.
    assert!(wait_until(Duration::from_secs(2), || processed
        .load(Ordering::SeqCst)
        >= 4));
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(processed.load(Ordering::SeqCst), 4);
    assert_eq!(newest_seen.load(Ordering::SeqCst), 3_000);
    assert_eq!(h.model.stats().last_daq_time, 3_000);

    h.model.stop().unwrap();
}

#[test]
fn test_fake_trigger_issues_requests_from_timesync() {
    let mut cfg = base_cfg();
    cfg.fake_trigger = true;
    cfg.request_handler = RequestHandlerConfig {
        request_timeout_ms: 200,
        warn_on_timeout: false,
        ..Default::default()
    };
    let mut h = harness(cfg);
    h.model.start(2).unwrap();

    send_frames(&h.frame_tx, (0..10).map(|i| i * 1000));
    // Each fresh beacon synthesises a diagnostic request; with this little
    // data the window reaches past the buffer, so the answer arrives after
    // the deferral deadline.
    let fragment = h
        .fragments
        .recv_timeout(Duration::from_secs(3))
        .expect("fake-trigger fragment");
    assert!(fragment.has_error_bit(FragmentErrorBit::Incomplete));
    assert!(h.model.stats().num_requests >= 1);
    h.model.stop().unwrap();
}

#[test]
fn test_emulator_drives_full_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dump.bin");
    let mut bytes = Vec::new();
    for i in 0..8u64 {
        bytes.extend_from_slice(DummyFrame::new(0, i).payload());
    }
    std::fs::write(&path, bytes).unwrap();

    let (frame_tx, frame_rx) = frame_channel::<DummyFrame>(4096);
    let (request_tx, request_rx) = request_channel(64);
    let fragment_sender = ChannelFragmentSender::new();
    let fragments = fragment_sender.add_destination(DESTINATION, 64);

    let mut model = DefaultDataHandlingModel::<DummyFrame>::new(Arc::new(AtomicBool::new(false)));
    model
        .conf(
            base_cfg(),
            ModelEndpoints {
                raw_input_name: "raw_link_3".into(),
                raw_receiver: Some(Box::new(frame_rx)),
                request_receiver: Box::new(request_rx),
                fragment_sender,
                timesync_sender: None,
            },
        )
        .unwrap();
    model.start(1).unwrap();

    let emulator_marker = Arc::new(AtomicBool::new(true));
    let mut emulator = SourceEmulator::<DummyFrame>::new(Arc::clone(&emulator_marker));
    emulator
        .conf(EmulatorConfig {
            input_file: path,
            rate_khz: 10.0,
            source_id: SOURCE,
            ..Default::default()
        })
        .unwrap();
    emulator.set_sender("raw_link_3", Some(Arc::new(frame_tx)));
    emulator.start().unwrap();

    assert!(wait_until(Duration::from_secs(5), || model
        .stats()
        .num_payloads
        >= 30));

    request_tx.send(request_for(10_000, 15_000)).unwrap();
    let fragment = fragments
        .recv_timeout(Duration::from_secs(2))
        .expect("fragment from emulated stream");
    assert_eq!(fragment.header().error_bits, 0);
    assert_eq!(
        piece_timestamps(&fragment),
        vec![10_000, 11_000, 12_000, 13_000, 14_000]
    );

    emulator_marker.store(false, Ordering::SeqCst);
    emulator.stop();
    model.stop().unwrap();
    assert!(emulator.stats().num_frames_sent >= 30);
}

#[test]
fn test_model_recording_persists_consumed_frames() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let output = dir.path().join("raw.bin");
    let mut cfg = base_cfg();
    cfg.request_handler.data_recorder = Some(DataRecorderConfig {
        output_file: output.clone(),
        streaming_buffer_size: 8192,
        ..Default::default()
    });
    let mut h = harness(cfg);
    h.model.start(1)?;

    send_frames(&h.frame_tx, (0..32).map(|i| i * 1000));
    assert!(wait_until(Duration::from_secs(2), || h
        .model
        .stats()
        .num_payloads
        >= 32));

    h.model.record(Duration::from_secs(1))?;
    // A second record while one is active is a command error.
    assert!(h.model.record(Duration::from_secs(1)).is_err());

    let handler = h.model.handler().expect("configured");
    assert!(wait_until(Duration::from_secs(3), || !handler
        .stats()
        .recording_active));
    h.model.stop()?;

    let data = std::fs::read(&output)?;
    let recorded: Vec<u64> = data
        .chunks(DummyFrame::ELEMENT_SIZE)
        .map(|chunk| DummyFrame::from_bytes(chunk).unwrap().timestamp())
        .collect();
    assert_eq!(recorded, (0..32).map(|i| i * 1000).collect::<Vec<_>>());
    h.model.scrap()?;
    Ok(())
}
