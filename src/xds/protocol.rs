//! Per-type subscription protocols.
//!
//! A [Protocol] owns the subscription for one resource type: the set of names
//! it has asked for, the requests that go with it, and turning responses back
//! into model types. The four kinds differ only in their wire message and the
//! model type they produce.

use std::marker::PhantomData;
use std::sync::{Arc, Weak};
use std::time::Duration;

use crossbeam_skiplist::SkipSet;
use parking_lot::{Mutex, RwLock};
use prost::{Message, Name};
use smol_str::SmolStr;
use tracing::{debug, warn};
use xds_api::pb::envoy::{
    config::{
        cluster::v3 as xds_cluster, endpoint::v3 as xds_endpoint, listener::v3 as xds_listener,
        route::v3 as xds_route,
    },
    service::discovery::v3::{DiscoveryRequest, DiscoveryResponse},
};

use crate::xds::model::{XdsCluster, XdsClusterConfig, XdsListener, XdsRouteConfiguration};
use crate::xds::{AdsSession, ResourceType, ResponseHandler};

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("expected a {expected} response, got {actual:?}")]
    TypeMismatch {
        expected: ResourceType,
        actual: String,
    },

    #[error("invalid resource: {0}")]
    Message(#[from] prost::DecodeError),
}

/// A kind of discovery resource: the wire message and what it decodes to.
pub trait Discovery: Send + Sync + 'static {
    type Message: Message + Name + Default;
    type Resource: Send + Sync + 'static;

    const RESOURCE_TYPE: ResourceType;

    fn convert(message: Self::Message) -> Self::Resource;
}

/// Listener discovery.
pub struct Lds;

/// Route discovery.
pub struct Rds;

/// Cluster discovery.
pub struct Cds;

/// Endpoint discovery.
pub struct Eds;

impl Discovery for Lds {
    type Message = xds_listener::Listener;
    type Resource = XdsListener;
    const RESOURCE_TYPE: ResourceType = ResourceType::Listener;

    fn convert(message: Self::Message) -> Self::Resource {
        message.into()
    }
}

impl Discovery for Rds {
    type Message = xds_route::RouteConfiguration;
    type Resource = XdsRouteConfiguration;
    const RESOURCE_TYPE: ResourceType = ResourceType::RouteConfiguration;

    fn convert(message: Self::Message) -> Self::Resource {
        message.into()
    }
}

impl Discovery for Cds {
    type Message = xds_cluster::Cluster;
    type Resource = XdsClusterConfig;
    const RESOURCE_TYPE: ResourceType = ResourceType::Cluster;

    fn convert(message: Self::Message) -> Self::Resource {
        message.into()
    }
}

impl Discovery for Eds {
    type Message = xds_endpoint::ClusterLoadAssignment;
    type Resource = XdsCluster;
    const RESOURCE_TYPE: ResourceType = ResourceType::ClusterLoadAssignment;

    fn convert(message: Self::Message) -> Self::Resource {
        message.into()
    }
}

type UpdateCallback<R> = Arc<dyn Fn(&[R]) + Send + Sync>;

/// The subscription state and request/response handling for one resource
/// type.
///
/// Subscribed names only ever grow. Every call to [Protocol::subscribe_resource]
/// sends the full set, so the control plane always sees the complete
/// subscription and not a delta.
pub struct Protocol<K: Discovery> {
    session: Weak<AdsSession>,
    check_interval: Duration,
    names: SkipSet<String>,
    subscribing: Mutex<()>,
    // the (version, nonce) of the last response this protocol handled
    acked: Mutex<Option<(SmolStr, SmolStr)>>,
    callback: RwLock<Option<UpdateCallback<K::Resource>>>,
    _kind: PhantomData<K>,
}

impl<K: Discovery> std::fmt::Debug for Protocol<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Protocol")
            .field("type", &K::RESOURCE_TYPE)
            .field("names", &self.subscribed_names())
            .field("acked", &*self.acked.lock())
            .finish()
    }
}

impl<K: Discovery> Protocol<K> {
    /// Create a protocol and register it as the session's handler for its
    /// type.
    pub fn register(
        session: &Arc<AdsSession>,
        check_interval: Duration,
    ) -> Result<Arc<Self>, crate::xds::SessionError> {
        let protocol = Arc::new(Self {
            session: Arc::downgrade(session),
            check_interval,
            names: SkipSet::new(),
            subscribing: Mutex::new(()),
            acked: Mutex::new(None),
            callback: RwLock::new(None),
            _kind: PhantomData,
        });
        session.register(protocol.clone())?;
        Ok(protocol)
    }

    pub fn type_url(&self) -> &'static str {
        K::RESOURCE_TYPE.type_url()
    }

    pub fn resource_type(&self) -> ResourceType {
        K::RESOURCE_TYPE
    }

    /// The re-check interval this protocol was configured with. Subscriptions
    /// are kept current by server push, so nothing polls on it.
    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    /// Every name ever subscribed, in sorted order.
    pub fn subscribed_names(&self) -> Vec<String> {
        self.names.iter().map(|e| e.value().clone()).collect()
    }

    /// The version and nonce of the last response handled.
    pub fn last_ack(&self) -> Option<(SmolStr, SmolStr)> {
        self.acked.lock().clone()
    }

    /// Add names to the subscription and send a request for the whole set.
    ///
    /// Subscribing with no names and nothing already subscribed asks for every
    /// resource of this type, which only Listeners and Clusters do. For the
    /// other types an empty subscription sends nothing. Names that are already
    /// subscribed are no-ops, but the request is still sent.
    pub fn subscribe_resource<I, S>(&self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        // the last request the session records has to be the full set
        let _subscribing = self.subscribing.lock();
        for name in names {
            self.names.insert(name.into());
        }

        let resource_names = self.subscribed_names();
        if resource_names.is_empty() && !K::RESOURCE_TYPE.is_wildcard_root() {
            debug!(ty = self.type_url(), "nothing to subscribe to");
            return;
        }

        let request = DiscoveryRequest {
            type_url: self.type_url().to_string(),
            resource_names,
            ..Default::default()
        };

        match self.session.upgrade() {
            Some(session) => session.request(request),
            None => debug!(ty = self.type_url(), "session dropped, not subscribing"),
        }
    }

    /// Set the callback run with every batch of decoded resources. Replaces
    /// any existing callback.
    ///
    /// The callback runs inline on the task reading the ADS stream and must
    /// not block.
    pub fn set_update_callback<F>(&self, callback: F)
    where
        F: Fn(&[K::Resource]) + Send + Sync + 'static,
    {
        *self.callback.write() = Some(Arc::new(callback));
    }

    /// Decode every resource in a response and run the update callback with
    /// the result.
    ///
    /// Resources that fail to decode are logged and skipped. A response for
    /// any other resource type is rejected without running the callback.
    pub fn decode(&self, response: &DiscoveryResponse) -> Result<Vec<K::Resource>, DecodeError> {
        if response.type_url != self.type_url() {
            return Err(DecodeError::TypeMismatch {
                expected: K::RESOURCE_TYPE,
                actual: response.type_url.clone(),
            });
        }

        let mut resources = Vec::with_capacity(response.resources.len());
        for (i, any) in response.resources.iter().enumerate() {
            match decode_any::<K>(&any.type_url, &any.value) {
                Ok(message) => resources.push(K::convert(message)),
                Err(e) => {
                    warn!(
                        ty = self.type_url(),
                        v = response.version_info,
                        idx = i,
                        err = %e,
                        "skipping invalid resource",
                    );
                    metrics::counter!("xds.decode_errors", "type" => K::RESOURCE_TYPE.short_name())
                        .increment(1);
                }
            }
        }

        // clone the callback out so it can replace itself
        let callback = self.callback.read().clone();
        if let Some(callback) = callback {
            callback(&resources[..]);
        }

        Ok(resources)
    }
}

fn decode_any<K: Discovery>(type_url: &str, value: &[u8]) -> Result<K::Message, DecodeError> {
    if type_url != K::RESOURCE_TYPE.type_url() {
        return Err(DecodeError::TypeMismatch {
            expected: K::RESOURCE_TYPE,
            actual: type_url.to_string(),
        });
    }

    Ok(K::Message::decode(value)?)
}

impl<K: Discovery> ResponseHandler for Protocol<K> {
    fn resource_type(&self) -> ResourceType {
        K::RESOURCE_TYPE
    }

    fn handle_response(&self, response: &DiscoveryResponse) {
        match self.decode(response) {
            Ok(resources) => {
                debug!(
                    ty = self.type_url(),
                    v = response.version_info,
                    n = response.nonce,
                    r_count = resources.len(),
                    "decoded response",
                );
                *self.acked.lock() = Some((
                    SmolStr::new(&response.version_info),
                    SmolStr::new(&response.nonce),
                ));
            }
            Err(e) => warn!(ty = self.type_url(), err = %e, "rejected response"),
        }
    }
}
