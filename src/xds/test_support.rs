//! An in-memory control plane for tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use xds_api::pb::envoy::service::discovery::v3::{DiscoveryRequest, DiscoveryResponse};
use xds_api::pb::google::protobuf;

use crate::xds::transport::{Connect, RequestStream, ResponseStream};
use crate::xds::{ResourceType, SessionError};

/// A [Connect] that hands every stream it opens to the test.
pub(crate) struct MockConnector {
    streams: mpsc::UnboundedSender<MockStream>,
    failures: AtomicUsize,
    connects: AtomicUsize,
}

impl MockConnector {
    pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MockStream>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            streams: tx,
            failures: AtomicUsize::new(0),
            connects: AtomicUsize::new(0),
        });
        (connector, rx)
    }

    /// Fail the next `n` calls to connect.
    pub(crate) fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// The number of connect attempts so far, failed or not.
    pub(crate) fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[tonic::async_trait]
impl Connect for MockConnector {
    async fn connect(&self, requests: RequestStream) -> Result<ResponseStream, SessionError> {
        self.connects.fetch_add(1, Ordering::SeqCst);

        let fail = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(tonic::Status::unavailable("connection refused").into());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = self.streams.send(MockStream {
            requests,
            responses: tx,
        });
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}

/// The control plane's end of one ADS stream.
pub(crate) struct MockStream {
    requests: RequestStream,
    responses: mpsc::UnboundedSender<Result<DiscoveryResponse, tonic::Status>>,
}

impl MockStream {
    pub(crate) async fn next_request(&mut self) -> DiscoveryRequest {
        self.requests
            .next()
            .await
            .expect("request stream closed unexpectedly")
    }

    /// Every request that's already been sent, without waiting.
    pub(crate) fn drain_requests(&mut self) -> Vec<DiscoveryRequest> {
        let mut requests = Vec::new();
        while let Ok(r) = self.requests.as_mut().try_recv() {
            requests.push(r);
        }
        requests
    }

    pub(crate) fn respond(&self, response: DiscoveryResponse) {
        let _ = self.responses.send(Ok(response));
    }

    pub(crate) fn fail(&self, status: tonic::Status) {
        let _ = self.responses.send(Err(status));
    }

    /// End the stream cleanly from the server side.
    pub(crate) fn complete(self) {}
}

pub(crate) fn discovery_response(
    rtype: ResourceType,
    version: &str,
    nonce: &str,
    resources: Vec<protobuf::Any>,
) -> DiscoveryResponse {
    DiscoveryResponse {
        version_info: version.to_string(),
        nonce: nonce.to_string(),
        type_url: rtype.type_url().to_string(),
        resources,
        ..Default::default()
    }
}
