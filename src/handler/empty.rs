//! Degenerate request handler that always answers with an empty fragment.
//!
//! Some data types are request-servable only through a downstream system;
//! their links still have to acknowledge every data request so the dataflow
//! plane is never left waiting. This handler shares the default handler's
//! error-path contract (an empty fragment with `DataNotFound` set) and
//! nothing else.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, warn};

use super::RequestHandling;
use crate::buffer::LatencyBuffer;
use crate::config::DataHandlerConfig;
use crate::error::{ReadoutError, Result};
use crate::frame::FrameType;
use crate::io::FragmentSender;
use crate::registry::FrameErrorRegistry;
use crate::types::{DataRequest, Fragment, FragmentHeader, RunNumber, SourceId};

pub struct EmptyFragmentRequestHandler<F: FrameType, B: LatencyBuffer<F>> {
    sourceid: RwLock<SourceId>,
    detector_id: RwLock<u16>,
    fragment_sender: RwLock<Option<Arc<dyn FragmentSender>>>,
    send_timeout: RwLock<Duration>,
    num_empty_fragments_sent: AtomicU64,
    _types: PhantomData<fn() -> (F, B)>,
}

impl<F: FrameType, B: LatencyBuffer<F>> EmptyFragmentRequestHandler<F, B> {
    pub fn num_empty_fragments_sent(&self) -> u64 {
        self.num_empty_fragments_sent.load(Ordering::Relaxed)
    }
}

impl<F: FrameType, B: LatencyBuffer<F>> RequestHandling<F, B>
    for EmptyFragmentRequestHandler<F, B>
{
    fn build(_buffer: Arc<B>, _error_registry: Arc<FrameErrorRegistry>) -> Self {
        Self {
            sourceid: RwLock::new(SourceId::default()),
            detector_id: RwLock::new(0),
            fragment_sender: RwLock::new(None),
            send_timeout: RwLock::new(Duration::from_millis(100)),
            num_empty_fragments_sent: AtomicU64::new(0),
            _types: PhantomData,
        }
    }

    fn conf(
        &mut self,
        cfg: &DataHandlerConfig,
        fragment_sender: Arc<dyn FragmentSender>,
    ) -> Result<()> {
        *self.sourceid.write() = SourceId::new(F::SUBSYSTEM, cfg.source_id);
        *self.detector_id.write() = cfg.detector_id;
        *self.send_timeout.write() =
            Duration::from_millis(cfg.request_handler.fragment_send_timeout_ms);
        *self.fragment_sender.write() = Some(fragment_sender);
        Ok(())
    }

    fn scrap(&mut self) {
        *self.fragment_sender.write() = None;
    }

    fn start(&self, _run_number: RunNumber) {
        self.num_empty_fragments_sent.store(0, Ordering::Relaxed);
    }

    fn stop(&self) {}

    fn record(&self, _duration: Duration) -> Result<()> {
        Err(ReadoutError::command(
            *self.sourceid.read(),
            "empty-fragment handler cannot record",
        ))
    }

    fn issue_request(&self, request: DataRequest, _is_retry: bool) {
        let header = FragmentHeader::from_request(
            &request,
            F::FRAGMENT_TYPE,
            *self.detector_id.read(),
            *self.sourceid.read(),
        );
        let fragment = Fragment::empty(header);
        debug!(
            trigger = request.trigger_number,
            sequence = request.sequence_number,
            "sending empty fragment"
        );
        let sender = self.fragment_sender.read().clone();
        match sender {
            Some(sender) => {
                if let Err(err) = sender.send(
                    &request.data_destination,
                    fragment,
                    *self.send_timeout.read(),
                ) {
                    warn!(
                        sourceid = %*self.sourceid.read(),
                        destination = %request.data_destination,
                        %err,
                        "failed attempt to write to the fragment queue, data will be lost"
                    );
                } else {
                    self.num_empty_fragments_sent.fetch_add(1, Ordering::Relaxed);
                }
            }
            None => warn!("empty-fragment handler has no fragment sender"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ring::RingLatencyBuffer;
    use crate::config::LatencyBufferConfig;
    use crate::frame::DummyFrame;
    use crate::io::ChannelFragmentSender;
    use crate::types::{FragmentErrorBit, RequestInfo, Subsystem};

    #[test]
    fn test_every_request_yields_empty_data_not_found() {
        let buffer = Arc::new(
            RingLatencyBuffer::<DummyFrame>::new(
                &LatencyBufferConfig::default(),
                SourceId::default(),
            )
            .unwrap(),
        );
        let registry = Arc::new(FrameErrorRegistry::new());
        let mut handler =
            EmptyFragmentRequestHandler::<DummyFrame, RingLatencyBuffer<DummyFrame>>::build(
                buffer, registry,
            );

        let sender = ChannelFragmentSender::new();
        let rx = sender.add_destination("frags", 4);
        let cfg = DataHandlerConfig {
            source_id: 11,
            ..Default::default()
        };
        handler.conf(&cfg, sender).unwrap();
        handler.start(1);

        let request = DataRequest {
            trigger_number: 9,
            request_information: RequestInfo {
                component: SourceId::new(Subsystem::DetectorReadout, 11),
                window_begin: 0,
                window_end: 1_000,
            },
            data_destination: "frags".into(),
            ..Default::default()
        };
        handler.issue_request(request, false);

        let fragment = rx.recv_timeout(Duration::from_millis(200)).unwrap();
        assert!(fragment.payload().is_empty());
        assert!(fragment.has_error_bit(FragmentErrorBit::DataNotFound));
        assert_eq!(fragment.header().trigger_number, 9);
        assert_eq!(handler.num_empty_fragments_sent(), 1);
    }
}
