//! The skip-list buffer variant behind the same model and request handler:
//! out-of-order producers must yield the same observable behaviour.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use daq_readout::buffer::skiplist::SkipListLatencyBuffer;
use daq_readout::config::{DataHandlerConfig, LatencyBufferConfig};
use daq_readout::frame::{DummyFrame, FrameType};
use daq_readout::handler::RequestHandler;
use daq_readout::io::{frame_channel, request_channel, ChannelFragmentSender, FrameSender};
use daq_readout::model::{DataHandlingModel, ModelEndpoints};
use daq_readout::types::{DataRequest, RequestInfo, SourceId, Subsystem};

type SkipModel = DataHandlingModel<
    DummyFrame,
    SkipListLatencyBuffer<DummyFrame>,
    RequestHandler<DummyFrame, SkipListLatencyBuffer<DummyFrame>>,
>;

const DESTINATION: &str = "frags";

/// Timestamps 0..n*1000 in a deterministic scrambled order. The first
/// element stays in place so the oldest timestamp is in the buffer before
/// the first delayed post-processing pass fixes its cursor.
fn scrambled(n: u64) -> Vec<u64> {
    let mut timestamps: Vec<u64> = (0..n).map(|i| i * 1000).collect();
    for i in (1..timestamps.len().saturating_sub(3)).step_by(3) {
        timestamps.swap(i, i + 2);
    }
    timestamps
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

#[test]
fn test_out_of_order_frames_serve_ordered_fragments() {
    let (frame_tx, frame_rx) = frame_channel::<DummyFrame>(1024);
    let (request_tx, request_rx) = request_channel(16);
    let fragment_sender = ChannelFragmentSender::new();
    let fragments = fragment_sender.add_destination(DESTINATION, 16);

    let mut model = SkipModel::new(Arc::new(AtomicBool::new(false)));
    model
        .conf(
            DataHandlerConfig {
                source_id: 4,
                latency_buffer: LatencyBufferConfig {
                    size: 512,
                    ..Default::default()
                },
                raw_receiver_timeout_ms: 20,
                ..Default::default()
            },
            ModelEndpoints {
                raw_input_name: "raw_tp_4".into(),
                raw_receiver: Some(Box::new(frame_rx)),
                request_receiver: Box::new(request_rx),
                fragment_sender,
                timesync_sender: None,
            },
        )
        .unwrap();
    model.start(1).unwrap();

    for (i, ts) in scrambled(20).into_iter().enumerate() {
        frame_tx.try_send(DummyFrame::new(ts, i as u64)).unwrap();
    }
    assert!(wait_until(Duration::from_secs(2), || model
        .stats()
        .num_payloads
        >= 20));

    request_tx
        .send(DataRequest {
            trigger_number: 1,
            sequence_number: 0,
            run_number: 1,
            trigger_timestamp: 6_000,
            request_information: RequestInfo {
                component: SourceId::new(Subsystem::DetectorReadout, 4),
                window_begin: 5_000,
                window_end: 9_000,
            },
            data_destination: DESTINATION.into(),
        })
        .unwrap();

    let fragment = fragments
        .recv_timeout(Duration::from_secs(2))
        .expect("fragment");
    assert_eq!(fragment.header().error_bits, 0);
    let timestamps: Vec<u64> = fragment
        .payload()
        .chunks(DummyFrame::ELEMENT_SIZE)
        .map(|chunk| DummyFrame::from_bytes(chunk).unwrap().timestamp())
        .collect();
    // Despite scrambled arrival, pieces come out in timestamp order.
    assert_eq!(timestamps, vec![5_000, 6_000, 7_000, 8_000]);

    model.stop().unwrap();
}

#[test]
fn test_delayed_post_processing_sees_settled_order() {
    let (frame_tx, frame_rx) = frame_channel::<DummyFrame>(1024);
    let (request_tx, request_rx) = request_channel(16);
    let _ = request_tx;
    let fragment_sender = ChannelFragmentSender::new();
    let _frags = fragment_sender.add_destination(DESTINATION, 16);

    let seen = Arc::new(Mutex::new(Vec::<u64>::new()));
    let sink = Arc::clone(&seen);

    let mut model = SkipModel::new(Arc::new(AtomicBool::new(false)));
    model
        .conf_with_processor(
            DataHandlerConfig {
                source_id: 4,
                latency_buffer: LatencyBufferConfig {
                    size: 512,
                    ..Default::default()
                },
                post_processing_delay_ticks: 4_000,
                raw_receiver_timeout_ms: 10,
                ..Default::default()
            },
            ModelEndpoints {
                raw_input_name: "raw_tp_4".into(),
                raw_receiver: Some(Box::new(frame_rx)),
                request_receiver: Box::new(request_rx),
                fragment_sender,
                timesync_sender: None,
            },
            |processor| {
                processor.add_postprocess_task(move |frame: &DummyFrame| {
                    sink.lock().unwrap().push(frame.timestamp());
                });
            },
        )
        .unwrap();
    model.start(1).unwrap();

    for (i, ts) in scrambled(16).into_iter().enumerate() {
        frame_tx.try_send(DummyFrame::new(ts, i as u64)).unwrap();
    }

    // Newest is 15000; everything below 11000 gets handed over once the
    // delay elapses, in buffer (timestamp) order despite scrambled arrival.
    assert!(wait_until(Duration::from_secs(2), || seen
        .lock()
        .unwrap()
        .len()
        >= 11));
    std::thread::sleep(Duration::from_millis(100));
    let order = seen.lock().unwrap().clone();
    assert_eq!(order, (0..11).map(|i| i * 1000).collect::<Vec<_>>());

    model.stop().unwrap();
}
