//! The ADS session: one logical discovery stream that survives reconnects.
//!
//! The session owns the transport, hands every response to the handler
//! registered for its type, ACKs it, and replays the last request for every
//! type after the stream is re-established. All handler work for a response
//! runs inline on the task reading the stream, in order.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_skiplist::SkipMap;
use enum_map::EnumMap;
use futures::StreamExt;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};
use xds_api::pb::envoy::{
    config::core::v3 as xds_core,
    service::discovery::v3::{DiscoveryRequest, DiscoveryResponse},
};

use crate::xds::transport::{io_source, Connect};
use crate::xds::ResourceType;

/// The fixed delay between losing a stream and trying to open a new one.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(3);

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("no tokio runtime available")]
    NoRuntime,

    #[error("failed to connect: {0}")]
    Connect(#[from] tonic::transport::Error),

    #[error("stream failed: {0}")]
    Stream(#[from] tonic::Status),

    #[error("a handler for {0} resources is already registered")]
    DuplicateHandler(ResourceType),

    #[error("no handler registered for type url {0:?}")]
    UnhandledType(String),
}

/// Handles every response for one resource type. Called on the task that
/// reads the ADS stream, so it must not block.
pub trait ResponseHandler: Send + Sync + 'static {
    fn resource_type(&self) -> ResourceType;

    fn handle_response(&self, response: &DiscoveryResponse);
}

/// The externally visible state of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing has been requested yet.
    Idle,
    /// A stream is being opened. Requests are queued on it.
    Connecting,
    Connected,
    /// The last stream failed and a reconnect is scheduled. Requests are
    /// recorded but not sent until the stream is back.
    Recovering,
    Closed,
}

enum StreamState {
    Idle,
    Active {
        generation: u64,
        requests: mpsc::UnboundedSender<DiscoveryRequest>,
        connected: bool,
    },
    Recovering {
        generation: u64,
    },
    Closed,
}

macro_rules! debug_xds_discovery_request {
    ($request:expr) => {
        tracing::debug!(
            v = $request.version_info,
            n = $request.response_nonce,
            ty = $request.type_url,
            r = ?$request.resource_names,
            "DiscoveryRequest",
        );
    };
}

macro_rules! debug_xds_discovery_response {
    ($response:expr) => {
        tracing::debug!(
            v = $response.version_info,
            n = $response.nonce,
            ty = $response.type_url,
            r_count = $response.resources.len(),
            "DiscoveryResponse",
        );
    };
}

pub struct AdsSession {
    node: xds_core::Node,
    connector: Arc<dyn Connect>,
    runtime: tokio::runtime::Handle,
    handlers: EnumMap<ResourceType, OnceCell<Arc<dyn ResponseHandler>>>,
    // the last request sent for each type. this is what gets replayed on
    // reconnect and what every ACK restates.
    observed: SkipMap<ResourceType, DiscoveryRequest>,
    state: Mutex<StreamState>,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for AdsSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdsSession")
            .field("node", &self.node.id)
            .field("state", &self.state())
            .finish()
    }
}

impl AdsSession {
    /// Create a new session. Must be called from inside a tokio runtime; the
    /// session spawns its stream and reconnect tasks onto it.
    ///
    /// No stream is opened until the first request.
    pub fn new(node: xds_core::Node, connector: Arc<dyn Connect>) -> Result<Self, SessionError> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| SessionError::NoRuntime)?;
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            node,
            connector,
            runtime,
            handlers: EnumMap::default(),
            observed: SkipMap::new(),
            state: Mutex::new(StreamState::Idle),
            shutdown,
        })
    }

    pub fn node(&self) -> &xds_core::Node {
        &self.node
    }

    /// Register the handler for a resource type. Every type gets exactly one
    /// handler, registered before anything is requested for it.
    pub fn register(&self, handler: Arc<dyn ResponseHandler>) -> Result<(), SessionError> {
        let rtype = handler.resource_type();
        self.handlers[rtype]
            .set(handler)
            .map_err(|_| SessionError::DuplicateHandler(rtype))
    }

    pub fn state(&self) -> SessionState {
        match &*self.state.lock() {
            StreamState::Idle => SessionState::Idle,
            StreamState::Active {
                connected: false, ..
            } => SessionState::Connecting,
            StreamState::Active { connected: true, .. } => SessionState::Connected,
            StreamState::Recovering { .. } => SessionState::Recovering,
            StreamState::Closed => SessionState::Closed,
        }
    }

    /// The last request sent for a resource type, if any.
    pub fn last_request(&self, resource_type: ResourceType) -> Option<DiscoveryRequest> {
        self.observed
            .get(&resource_type)
            .map(|e| e.value().clone())
    }

    /// Send a request and remember it as the current subscription for its
    /// type, replacing whatever was there.
    ///
    /// Never blocks. The first request opens the stream. While the session is
    /// recovering the request is only recorded, and goes out when the stream
    /// is replayed.
    pub fn request(self: &Arc<Self>, mut request: DiscoveryRequest) {
        let Some(rtype) = ResourceType::from_type_url(&request.type_url) else {
            error!(ty = request.type_url, "refusing to request an unknown resource type");
            return;
        };
        if self.handlers[rtype].get().is_none() {
            error!(ty = request.type_url, "requesting a resource type with no handler");
        }
        request.node = Some(self.node.clone());

        let mut state = self.state.lock();
        self.observed.insert(rtype, request.clone());

        match &*state {
            StreamState::Idle => self.open_stream(&mut state, 0, [request]),
            StreamState::Active { requests, .. } => send(requests, request),
            StreamState::Recovering { .. } => {
                debug!(ty = request.type_url, "ADS stream is recovering, deferring request")
            }
            StreamState::Closed => debug!(ty = request.type_url, "ADS session is closed"),
        }
    }

    /// Close the stream and stop reconnecting. Safe to call more than once.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if matches!(*state, StreamState::Closed) {
                return;
            }
            // dropping the request sender half-closes the stream
            *state = StreamState::Closed;
        }

        self.shutdown.send_replace(true);
        info!(node = self.node.id, "ADS session closed");
    }

    fn open_stream(
        self: &Arc<Self>,
        state: &mut StreamState,
        generation: u64,
        initial: impl IntoIterator<Item = DiscoveryRequest>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        for request in initial {
            send(&tx, request);
        }

        *state = StreamState::Active {
            generation,
            requests: tx,
            connected: false,
        };
        self.runtime.spawn(self.clone().run_stream(generation, rx));
    }

    async fn run_stream(
        self: Arc<Self>,
        generation: u64,
        requests: mpsc::UnboundedReceiver<DiscoveryRequest>,
    ) {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow_and_update() {
            return;
        }

        let connect = tokio::select! {
            res = self.connector.connect(UnboundedReceiverStream::new(requests)) => res,
            _ = shutdown.changed() => return,
        };
        let mut responses = match connect {
            Ok(responses) => responses,
            Err(e) => {
                warn!(generation, err = %e, "failed to open ADS stream");
                self.schedule_recovery(generation);
                return;
            }
        };

        if !self.mark_connected(generation) {
            return;
        }
        info!(generation, "ADS stream opened");

        {
            let _connected = crate::metrics::scoped_gauge!("xds.connected");
            loop {
                let next = tokio::select! {
                    next = responses.next() => next,
                    _ = shutdown.changed() => {
                        debug!(generation, "closing ADS stream");
                        return;
                    },
                };

                match next {
                    Some(Ok(response)) => {
                        if let Err(e) = self.handle_response(generation, response) {
                            error!(generation, err = %e, "dropping response");
                        }
                    }
                    Some(Err(status)) => {
                        match io_source(&status) {
                            Some(e) => info!(generation, err = %e, "ADS stream disconnected"),
                            None => warn!(generation, err = %status, "ADS stream failed"),
                        }
                        break;
                    }
                    None => {
                        info!(generation, "ADS stream completed by control plane");
                        break;
                    }
                }
            }
        }

        self.schedule_recovery(generation);
    }

    fn mark_connected(&self, generation: u64) -> bool {
        let mut state = self.state.lock();
        match &mut *state {
            StreamState::Active {
                generation: g,
                connected,
                ..
            } if *g == generation => {
                *connected = true;
                true
            }
            _ => false,
        }
    }

    /// Dispatch a response to its handler and ACK it.
    ///
    /// The ACK echoes the response's type, version and nonce, and restates
    /// the names from the last request for the type rather than whatever the
    /// response happened to contain. Responses for a route or endpoint type
    /// that was never requested are dropped without an ACK.
    fn handle_response(
        &self,
        generation: u64,
        response: DiscoveryResponse,
    ) -> Result<(), SessionError> {
        debug_xds_discovery_response!(&response);

        let handler = ResourceType::from_type_url(&response.type_url)
            .and_then(|rtype| self.handlers[rtype].get().map(|h| (rtype, h)));
        let Some((rtype, handler)) = handler else {
            return Err(SessionError::UnhandledType(response.type_url));
        };
        metrics::counter!("xds.rx", "type" => rtype.short_name()).increment(1);

        // ACKing restates the current subscription. with nothing requested
        // for a named type that would be an empty list, which the server
        // reads as a wildcard.
        let resource_names = match self.observed.get(&rtype) {
            Some(e) => e.value().resource_names.clone(),
            None if rtype.is_wildcard_root() => Vec::new(),
            None => {
                warn!(
                    v = response.version_info,
                    n = response.nonce,
                    ty = response.type_url,
                    "ignoring response for a type that was never requested",
                );
                return Ok(());
            }
        };

        {
            let _timer = crate::metrics::scoped_timer!("xds.dispatch_time", "type" => rtype.short_name());
            handler.handle_response(&response);
        }

        let ack = DiscoveryRequest {
            node: Some(self.node.clone()),
            type_url: response.type_url,
            version_info: response.version_info,
            response_nonce: response.nonce,
            resource_names,
            ..Default::default()
        };

        match &*self.state.lock() {
            StreamState::Active {
                generation: g,
                requests,
                ..
            } if *g == generation => send(requests, ack),
            _ => debug!(generation, "stream replaced while handling response, dropping ACK"),
        }

        Ok(())
    }

    /// Move a failed stream into recovery and schedule the reconnect. Only
    /// the current stream can do this, so there's at most one pending
    /// reconnect at a time.
    fn schedule_recovery(self: &Arc<Self>, generation: u64) {
        {
            let mut state = self.state.lock();
            match &*state {
                StreamState::Active { generation: g, .. } if *g == generation => (),
                _ => return,
            }
            *state = StreamState::Recovering { generation };
        }

        metrics::counter!("xds.reconnects").increment(1);
        info!(generation, delay = ?RECONNECT_DELAY, "scheduling ADS stream recovery");

        let session = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        self.runtime.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(RECONNECT_DELAY) => session.recover(generation),
                _ = shutdown.changed() => (),
            }
        });
    }

    /// Open a fresh stream and replay the last request for every type.
    ///
    /// Replayed requests carry no version or nonce: a new stream is a new
    /// handshake.
    fn recover(self: &Arc<Self>, generation: u64) {
        let mut state = self.state.lock();
        match &*state {
            StreamState::Recovering { generation: g } if *g == generation => (),
            _ => return,
        }

        let replay: Vec<_> = self
            .observed
            .iter()
            .map(|e| DiscoveryRequest {
                version_info: String::new(),
                response_nonce: String::new(),
                ..e.value().clone()
            })
            .collect();

        info!(
            generation = generation + 1,
            replayed = replay.len(),
            "recovering ADS stream"
        );
        self.open_stream(&mut state, generation + 1, replay);
    }
}

fn send(requests: &mpsc::UnboundedSender<DiscoveryRequest>, request: DiscoveryRequest) {
    debug_xds_discovery_request!(&request);

    let ty = ResourceType::from_type_url(&request.type_url).map_or("unknown", |r| r.short_name());
    if requests.send(request).is_err() {
        debug!(ty, "ADS stream closed, dropping request");
        return;
    }
    metrics::counter!("xds.tx", "type" => ty).increment(1);
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::xds::test_support::{discovery_response, MockConnector};

    #[derive(Default)]
    struct CountingHandler {
        rtype: Option<ResourceType>,
        calls: AtomicUsize,
    }

    impl CountingHandler {
        fn new(rtype: ResourceType) -> Arc<Self> {
            Arc::new(Self {
                rtype: Some(rtype),
                ..Default::default()
            })
        }
    }

    impl ResponseHandler for CountingHandler {
        fn resource_type(&self) -> ResourceType {
            self.rtype.unwrap_or(ResourceType::Listener)
        }

        fn handle_response(&self, _: &DiscoveryResponse) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn request(rtype: ResourceType, names: &[&str]) -> DiscoveryRequest {
        DiscoveryRequest {
            type_url: rtype.type_url().to_string(),
            resource_names: names.iter().map(|n| n.to_string()).collect(),
            ..Default::default()
        }
    }

    fn new_session(connector: Arc<MockConnector>) -> Arc<AdsSession> {
        let node = xds_core::Node {
            id: "test-node".to_string(),
            ..Default::default()
        };
        let session = Arc::new(AdsSession::new(node, connector).unwrap());
        for rtype in ResourceType::all() {
            session.register(CountingHandler::new(*rtype)).unwrap();
        }
        session
    }

    #[test]
    fn test_new_requires_runtime() {
        let (connector, _streams) = MockConnector::new();
        assert!(matches!(
            AdsSession::new(Default::default(), connector),
            Err(SessionError::NoRuntime)
        ));
    }

    #[tokio::test]
    async fn test_duplicate_handler() {
        let (connector, _streams) = MockConnector::new();
        let session = AdsSession::new(Default::default(), connector).unwrap();

        session
            .register(CountingHandler::new(ResourceType::Cluster))
            .unwrap();
        assert!(matches!(
            session.register(CountingHandler::new(ResourceType::Cluster)),
            Err(SessionError::DuplicateHandler(ResourceType::Cluster)),
        ));
    }

    #[tokio::test]
    async fn test_lazy_open() {
        let (connector, mut streams) = MockConnector::new();
        let session = new_session(connector.clone());
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(connector.connects(), 0);

        session.request(request(ResourceType::Listener, &[]));
        let mut stream = streams.recv().await.unwrap();
        assert_eq!(connector.connects(), 1);

        let sent = stream.next_request().await;
        assert_eq!(sent.type_url, ResourceType::Listener.type_url());
        assert_eq!(sent.node.map(|n| n.id), Some("test-node".to_string()));

        // later requests go out on the same stream
        session.request(request(ResourceType::Cluster, &[]));
        let sent = stream.next_request().await;
        assert_eq!(sent.type_url, ResourceType::Cluster.type_url());
        assert_eq!(connector.connects(), 1);
    }

    #[tokio::test]
    async fn test_ack_restates_subscription() {
        let (connector, mut streams) = MockConnector::new();
        let session = new_session(connector);

        session.request(request(ResourceType::ClusterLoadAssignment, &["a"]));
        session.request(request(ResourceType::ClusterLoadAssignment, &["a", "b"]));
        let mut stream = streams.recv().await.unwrap();
        stream.next_request().await;
        stream.next_request().await;

        // the response only carries "a", the ack should still list both names
        stream.respond(discovery_response(
            ResourceType::ClusterLoadAssignment,
            "v1",
            "n1",
            vec![],
        ));

        let ack = stream.next_request().await;
        assert_eq!(ack.type_url, ResourceType::ClusterLoadAssignment.type_url());
        assert_eq!(ack.version_info, "v1");
        assert_eq!(ack.response_nonce, "n1");
        assert_eq!(ack.resource_names, ["a", "b"]);
        assert_eq!(ack.node.map(|n| n.id), Some("test-node".to_string()));
        assert_eq!(session.state(), SessionState::Connected);

        // acks aren't recorded as the latest request
        let last = session
            .last_request(ResourceType::ClusterLoadAssignment)
            .unwrap();
        assert!(last.response_nonce.is_empty());
    }

    #[tokio::test]
    async fn test_handler_called_before_ack() {
        let (connector, mut streams) = MockConnector::new();
        let node = xds_core::Node::default();
        let session = Arc::new(AdsSession::new(node, connector).unwrap());
        let handler = CountingHandler::new(ResourceType::Cluster);
        session.register(handler.clone()).unwrap();

        session.request(request(ResourceType::Cluster, &[]));
        let mut stream = streams.recv().await.unwrap();
        stream.next_request().await;

        stream.respond(discovery_response(ResourceType::Cluster, "1", "1", vec![]));
        stream.next_request().await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unrequested_named_type_is_not_acked() {
        let (connector, mut streams) = MockConnector::new();
        let session = Arc::new(AdsSession::new(Default::default(), connector).unwrap());
        let lds = CountingHandler::new(ResourceType::Listener);
        let rds = CountingHandler::new(ResourceType::RouteConfiguration);
        let cds = CountingHandler::new(ResourceType::Cluster);
        session.register(lds.clone()).unwrap();
        session.register(rds.clone()).unwrap();
        session.register(cds.clone()).unwrap();

        session.request(request(ResourceType::Listener, &[]));
        let mut stream = streams.recv().await.unwrap();
        stream.next_request().await;

        // nothing has asked for routes, so an ACK would be a wildcard
        stream.respond(discovery_response(
            ResourceType::RouteConfiguration,
            "1",
            "r1",
            vec![],
        ));
        stream.respond(discovery_response(ResourceType::Listener, "1", "l1", vec![]));

        let ack = stream.next_request().await;
        assert_eq!(ack.type_url, ResourceType::Listener.type_url());
        assert_eq!(ack.response_nonce, "l1");
        assert!(stream.drain_requests().is_empty());
        assert_eq!(rds.calls.load(Ordering::SeqCst), 0);
        assert_eq!(lds.calls.load(Ordering::SeqCst), 1);
        assert!(session
            .last_request(ResourceType::RouteConfiguration)
            .is_none());

        // clusters are fetched by wildcard anyway, so they still get an ACK
        stream.respond(discovery_response(ResourceType::Cluster, "1", "c1", vec![]));
        let ack = stream.next_request().await;
        assert_eq!(ack.type_url, ResourceType::Cluster.type_url());
        assert_eq!(ack.response_nonce, "c1");
        assert!(ack.resource_names.is_empty());
        assert_eq!(cds.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unhandled_type_is_not_acked() {
        let (connector, _streams) = MockConnector::new();
        let node = xds_core::Node::default();
        let session = Arc::new(AdsSession::new(node, connector).unwrap());
        session
            .register(CountingHandler::new(ResourceType::Listener))
            .unwrap();

        let err = session
            .handle_response(
                0,
                discovery_response(ResourceType::Cluster, "1", "1", vec![]),
            )
            .unwrap_err();
        assert!(matches!(err, SessionError::UnhandledType(url) if url == ResourceType::Cluster.type_url()));

        let unknown = DiscoveryResponse {
            type_url: "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.Secret"
                .to_string(),
            ..Default::default()
        };
        assert!(matches!(
            session.handle_response(0, unknown),
            Err(SessionError::UnhandledType(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_replays_subscriptions() {
        let (connector, mut streams) = MockConnector::new();
        let session = new_session(connector.clone());

        session.request(request(ResourceType::Listener, &[]));
        session.request(request(ResourceType::RouteConfiguration, &["svc-a", "svc-b"]));
        session.request(request(ResourceType::Cluster, &[]));

        let mut stream = streams.recv().await.unwrap();
        for _ in 0..3 {
            stream.next_request().await;
        }
        stream.respond(discovery_response(ResourceType::Listener, "1", "1", vec![]));
        stream.next_request().await;

        let failed_at = tokio::time::Instant::now();
        stream.fail(tonic::Status::unavailable("control plane went away"));

        let mut stream = streams.recv().await.unwrap();
        assert!(failed_at.elapsed() >= RECONNECT_DELAY);
        assert_eq!(connector.connects(), 2);

        let mut replayed = Vec::new();
        for _ in 0..3 {
            replayed.push(stream.next_request().await);
        }
        replayed.sort_by_key(|r| ResourceType::from_type_url(&r.type_url));

        let summary: Vec<_> = replayed
            .iter()
            .map(|r| {
                (
                    ResourceType::from_type_url(&r.type_url).unwrap(),
                    r.resource_names.clone(),
                    r.version_info.as_str(),
                    r.response_nonce.as_str(),
                )
            })
            .collect();
        assert_eq!(
            summary,
            vec![
                (ResourceType::Listener, vec![], "", ""),
                (
                    ResourceType::RouteConfiguration,
                    vec!["svc-a".to_string(), "svc-b".to_string()],
                    "",
                    ""
                ),
                (ResourceType::Cluster, vec![], "", ""),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_while_recovering_are_replayed() {
        let (connector, mut streams) = MockConnector::new();
        let session = new_session(connector);

        session.request(request(ResourceType::Cluster, &[]));
        let mut stream = streams.recv().await.unwrap();
        stream.next_request().await;

        stream.complete();
        // let the stream task notice
        tokio::task::yield_now().await;
        while session.state() != SessionState::Recovering {
            tokio::task::yield_now().await;
        }

        session.request(request(ResourceType::ClusterLoadAssignment, &["c1"]));

        let mut stream = streams.recv().await.unwrap();
        let mut types = vec![
            stream.next_request().await.type_url,
            stream.next_request().await.type_url,
        ];
        types.sort();
        let mut expected = vec![
            ResourceType::Cluster.type_url().to_string(),
            ResourceType::ClusterLoadAssignment.type_url().to_string(),
        ];
        expected.sort();
        assert_eq!(types, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_is_retried() {
        let (connector, mut streams) = MockConnector::new();
        let session = new_session(connector.clone());
        connector.fail_next(2);

        let started = tokio::time::Instant::now();
        session.request(request(ResourceType::Listener, &[]));

        let mut stream = streams.recv().await.unwrap();
        assert_eq!(connector.connects(), 3);
        assert!(started.elapsed() >= RECONNECT_DELAY * 2);

        let sent = stream.next_request().await;
        assert_eq!(sent.type_url, ResourceType::Listener.type_url());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_stops_recovery() {
        let (connector, mut streams) = MockConnector::new();
        let session = new_session(connector.clone());

        session.request(request(ResourceType::Listener, &[]));
        let stream = streams.recv().await.unwrap();
        stream.fail(tonic::Status::internal("boom"));

        while session.state() != SessionState::Recovering {
            tokio::task::yield_now().await;
        }
        session.close();
        session.close();
        assert_eq!(session.state(), SessionState::Closed);

        tokio::time::sleep(RECONNECT_DELAY * 10).await;
        assert_eq!(connector.connects(), 1);
        assert!(streams.try_recv().is_err());

        // requests after close go nowhere
        session.request(request(ResourceType::Cluster, &[]));
        tokio::time::sleep(RECONNECT_DELAY).await;
        assert_eq!(connector.connects(), 1);
    }
}
