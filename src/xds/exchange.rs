//! The resource exchange: the one place the rest of a process gets mesh
//! configuration from.
//!
//! A [ResourceExchange] owns the ADS session and the four protocols, wires
//! Listener discovery into Route discovery and Cluster discovery into
//! Endpoint discovery, and keeps the decoded routes and endpoints in a cache
//! that consumers can read directly or watch by name.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_skiplist::SkipMap;
use once_cell::sync::OnceCell;
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use tracing::{debug, info};

use crate::config::ClientConfig;
use crate::xds::model::{XdsCluster, XdsClusterConfig, XdsListener, XdsRouteConfiguration, XdsVirtualHost};
use crate::xds::protocol::{Cds, Eds, Lds, Protocol, Rds};
use crate::xds::transport::{Connect, TonicConnector};
use crate::xds::{AdsSession, SessionError, SessionState};

static GLOBAL: OnceCell<Arc<ResourceExchange>> = OnceCell::new();

/// Notified when the virtual host for a service changes.
pub trait RouteListener: Send + Sync + 'static {
    fn on_route_change(&self, service_name: &str, virtual_host: &Arc<XdsVirtualHost>);
}

/// Notified when the endpoints for a cluster change.
pub trait ClusterListener: Send + Sync + 'static {
    fn on_cluster_change(&self, cluster_name: &str, cluster: &Arc<XdsCluster>);
}

impl<F> RouteListener for F
where
    F: Fn(&str, &Arc<XdsVirtualHost>) + Send + Sync + 'static,
{
    fn on_route_change(&self, service_name: &str, virtual_host: &Arc<XdsVirtualHost>) {
        self(service_name, virtual_host)
    }
}

impl<F> ClusterListener for F
where
    F: Fn(&str, &Arc<XdsCluster>) + Send + Sync + 'static,
{
    fn on_cluster_change(&self, cluster_name: &str, cluster: &Arc<XdsCluster>) {
        self(cluster_name, cluster)
    }
}

/// Identifies a registered listener so it can be removed later.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Listeners keyed by resource name.
struct Registry<L: ?Sized> {
    listeners: SkipMap<String, SkipMap<ListenerId, Arc<L>>>,
    // held while a value is published to listeners and while a new listener
    // reads the current value, so a new listener can never be handed an
    // older value after a newer one. reentrant so listeners can subscribe
    // from inside a callback.
    order: ReentrantMutex<()>,
}

impl<L: ?Sized + Send + Sync + 'static> Registry<L> {
    fn new() -> Self {
        Self {
            listeners: SkipMap::new(),
            order: ReentrantMutex::new(()),
        }
    }

    fn order(&self) -> ReentrantMutexGuard<'_, ()> {
        self.order.lock()
    }

    fn add(&self, key: &str, listener: Arc<L>) -> ListenerId {
        let _order = self.order();
        let id = ListenerId::next();
        let entry = self
            .listeners
            .get_or_insert_with(key.to_string(), SkipMap::new);
        entry.value().insert(id, listener);
        id
    }

    /// Remove a listener, dropping the key once nothing is listening on it.
    fn remove(&self, key: &str, id: ListenerId) -> bool {
        let _order = self.order();
        let Some(entry) = self.listeners.get(key) else {
            return false;
        };

        let removed = entry.value().remove(&id).is_some();
        if entry.value().is_empty() {
            entry.remove();
        }
        removed
    }

    #[cfg(test)]
    fn len(&self, key: &str) -> usize {
        self.listeners
            .get(key)
            .map_or(0, |e| e.value().len())
    }

    fn for_each(&self, key: &str, mut f: impl FnMut(&L)) {
        if let Some(entry) = self.listeners.get(key) {
            for listener in entry.value().iter() {
                f(&**listener.value());
            }
        }
    }
}

/// Decoded resources and the listeners watching them. Written from the ADS
/// stream task, read from anywhere.
struct ResourceCache {
    clusters: SkipMap<String, Arc<XdsCluster>>,
    virtual_hosts: SkipMap<String, Arc<XdsVirtualHost>>,
    route_listeners: Registry<dyn RouteListener>,
    cluster_listeners: Registry<dyn ClusterListener>,
}

impl ResourceCache {
    fn new() -> Self {
        Self {
            clusters: SkipMap::new(),
            virtual_hosts: SkipMap::new(),
            route_listeners: Registry::new(),
            cluster_listeners: Registry::new(),
        }
    }

    fn update_routes(&self, route_configs: &[XdsRouteConfiguration]) {
        for route_config in route_configs {
            for (service_name, virtual_host) in route_config.virtual_hosts_by_service() {
                let virtual_host = Arc::new(virtual_host.clone());

                let _order = self.route_listeners.order();
                self.virtual_hosts
                    .insert(service_name.to_string(), virtual_host.clone());

                debug!(
                    route_config = route_config.name,
                    service = service_name,
                    "updated virtual host"
                );
                self.route_listeners.for_each(service_name, |l| {
                    l.on_route_change(service_name, &virtual_host)
                });
            }
        }
    }

    fn update_clusters(&self, clusters: &[XdsCluster]) {
        for cluster in clusters {
            let cluster = Arc::new(cluster.clone());

            let _order = self.cluster_listeners.order();
            self.clusters.insert(cluster.name.clone(), cluster.clone());

            debug!(
                cluster = cluster.name,
                endpoints = cluster.endpoints.len(),
                "updated cluster endpoints"
            );
            self.cluster_listeners
                .for_each(&cluster.name, |l| l.on_cluster_change(&cluster.name, &cluster));
        }
    }

    fn watch_route(&self, service_name: &str, listener: Arc<dyn RouteListener>) -> ListenerId {
        let _order = self.route_listeners.order();
        let id = self.route_listeners.add(service_name, listener.clone());

        if let Some(entry) = self.virtual_hosts.get(service_name) {
            listener.on_route_change(service_name, entry.value());
        }
        id
    }

    fn watch_cluster(&self, cluster_name: &str, listener: Arc<dyn ClusterListener>) -> ListenerId {
        let _order = self.cluster_listeners.order();
        let id = self.cluster_listeners.add(cluster_name, listener.clone());

        if let Some(entry) = self.clusters.get(cluster_name) {
            listener.on_cluster_change(cluster_name, entry.value());
        }
        id
    }
}

/// The process-facing side of the discovery client.
///
/// Either build one explicitly with [ResourceExchange::new] and pass it
/// around, or use [ResourceExchange::initialize] to get the single
/// process-wide instance.
pub struct ResourceExchange {
    session: Arc<AdsSession>,
    lds: Arc<Protocol<Lds>>,
    rds: Arc<Protocol<Rds>>,
    cds: Arc<Protocol<Cds>>,
    eds: Arc<Protocol<Eds>>,
    cache: Arc<ResourceCache>,
}

impl std::fmt::Debug for ResourceExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceExchange")
            .field("session", &self.session)
            .field("clusters", &self.cache.clusters.len())
            .field("virtual_hosts", &self.cache.virtual_hosts.len())
            .finish()
    }
}

impl ResourceExchange {
    /// Connect to the control plane in `config` and start discovering
    /// listeners and clusters.
    ///
    /// Must be called from inside a tokio runtime.
    pub fn new(config: &ClientConfig) -> Result<Arc<Self>, SessionError> {
        Self::with_connector(config, Arc::new(TonicConnector::new(config)))
    }

    /// Like [ResourceExchange::new], but opening streams with `connector`.
    pub fn with_connector(
        config: &ClientConfig,
        connector: Arc<dyn Connect>,
    ) -> Result<Arc<Self>, SessionError> {
        let session = Arc::new(AdsSession::new(config.node().clone(), connector)?);
        let check_interval = config.check_interval();

        let lds = Protocol::<Lds>::register(&session, check_interval)?;
        let rds = Protocol::<Rds>::register(&session, check_interval)?;
        let cds = Protocol::<Cds>::register(&session, check_interval)?;
        let eds = Protocol::<Eds>::register(&session, check_interval)?;
        let cache = Arc::new(ResourceCache::new());

        lds.set_update_callback({
            let rds = rds.clone();
            move |listeners: &[XdsListener]| {
                let names: Vec<_> = listeners
                    .iter()
                    .flat_map(|l| l.route_config_names.iter().cloned())
                    .collect();

                // an empty subscription would turn into a wildcard
                if !names.is_empty() {
                    rds.subscribe_resource(names);
                }
            }
        });
        cds.set_update_callback({
            let eds = eds.clone();
            move |clusters: &[XdsClusterConfig]| {
                let names: Vec<_> = clusters
                    .iter()
                    .map(|c| c.endpoint_resource_name().to_string())
                    .collect();

                if !names.is_empty() {
                    eds.subscribe_resource(names);
                }
            }
        });
        rds.set_update_callback({
            let cache = cache.clone();
            move |route_configs: &[XdsRouteConfiguration]| cache.update_routes(route_configs)
        });
        eds.set_update_callback({
            let cache = cache.clone();
            move |clusters: &[XdsCluster]| cache.update_clusters(clusters)
        });

        // routes and endpoints are only ever subscribed by name, derived from
        // listeners and clusters. those two start as wildcards.
        lds.subscribe_resource(Vec::<String>::new());
        cds.subscribe_resource(Vec::<String>::new());

        info!(
            node = config.node().id,
            server = %config.uri(),
            "started resource exchange"
        );

        Ok(Arc::new(Self {
            session,
            lds,
            rds,
            cds,
            eds,
            cache,
        }))
    }

    /// Get the process-wide exchange, creating it from `config` on the first
    /// call. Later calls ignore their config and return the same instance.
    /// Concurrent first calls create exactly one.
    pub fn initialize(config: &ClientConfig) -> Result<Arc<Self>, SessionError> {
        initialize_in(&GLOBAL, || Self::new(config))
    }

    /// The process-wide exchange, if [ResourceExchange::initialize] has
    /// succeeded.
    pub fn global() -> Option<Arc<Self>> {
        GLOBAL.get().cloned()
    }

    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    /// Watch the virtual host for a service.
    ///
    /// If the virtual host is already known, `listener` is called once with it
    /// before this returns.
    pub fn subscribe_route(
        &self,
        service_name: &str,
        listener: Arc<dyn RouteListener>,
    ) -> ListenerId {
        self.cache.watch_route(service_name, listener)
    }

    /// Stop watching a service. Returns false if nothing was registered with
    /// that id.
    pub fn unsubscribe_route(&self, service_name: &str, id: ListenerId) -> bool {
        self.cache.route_listeners.remove(service_name, id)
    }

    /// Watch the endpoints for a cluster.
    ///
    /// If the cluster is already known, `listener` is called once with it
    /// before this returns.
    pub fn subscribe_cluster(
        &self,
        cluster_name: &str,
        listener: Arc<dyn ClusterListener>,
    ) -> ListenerId {
        self.cache.watch_cluster(cluster_name, listener)
    }

    pub fn unsubscribe_cluster(&self, cluster_name: &str, id: ListenerId) -> bool {
        self.cache.cluster_listeners.remove(cluster_name, id)
    }

    pub fn cluster(&self, cluster_name: &str) -> Option<Arc<XdsCluster>> {
        self.cache
            .clusters
            .get(cluster_name)
            .map(|e| e.value().clone())
    }

    pub fn virtual_host(&self, service_name: &str) -> Option<Arc<XdsVirtualHost>> {
        self.cache
            .virtual_hosts
            .get(service_name)
            .map(|e| e.value().clone())
    }

    /// A snapshot of every known cluster.
    pub fn cluster_map(&self) -> BTreeMap<String, Arc<XdsCluster>> {
        self.cache
            .clusters
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// A snapshot of every known virtual host, by service name.
    pub fn virtual_host_map(&self) -> BTreeMap<String, Arc<XdsVirtualHost>> {
        self.cache
            .virtual_hosts
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// The route configuration names currently subscribed, derived from
    /// listeners.
    pub fn subscribed_routes(&self) -> Vec<String> {
        self.rds.subscribed_names()
    }

    /// The endpoint names currently subscribed, derived from clusters.
    pub fn subscribed_endpoints(&self) -> Vec<String> {
        self.eds.subscribed_names()
    }

    /// Close the ADS stream for good. Cached resources stay readable; nothing
    /// updates them again.
    pub fn destroy(&self) {
        debug!(
            listeners = self.lds.subscribed_names().len(),
            clusters = self.cds.subscribed_names().len(),
            "destroying resource exchange"
        );
        self.session.close();
    }
}

fn initialize_in<F>(
    cell: &OnceCell<Arc<ResourceExchange>>,
    init: F,
) -> Result<Arc<ResourceExchange>, SessionError>
where
    F: FnOnce() -> Result<Arc<ResourceExchange>, SessionError>,
{
    cell.get_or_try_init(init).cloned()
}
