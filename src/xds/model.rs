//! The decoded resource model.
//!
//! Everything here is plain data built from the Envoy wire types. Protocols
//! decode responses into these types and the exchange caches and hands them
//! to listeners behind an `Arc`.

use std::collections::BTreeSet;

use prost::{Message, Name};
use tracing::trace;
use xds_api::pb::envoy::{
    config::{
        cluster::v3 as xds_cluster,
        core::v3::{self as xds_core, address, socket_address},
        endpoint::v3::{self as xds_endpoint, lb_endpoint},
        listener::v3::{self as xds_listener, filter},
        route::v3::{self as xds_route, route, route_action, route_match},
    },
    extensions::filters::network::http_connection_manager::v3::{
        self as xds_http, http_connection_manager::RouteSpecifier,
    },
};
use xds_api::pb::google::protobuf;

/// A Listener, reduced to the route configurations it references.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct XdsListener {
    pub name: String,
    pub route_config_names: BTreeSet<String>,
}

/// A Cluster, reduced to the name its endpoints are published under.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct XdsClusterConfig {
    pub name: String,
    pub eds_service_name: Option<String>,
}

impl XdsClusterConfig {
    /// The ClusterLoadAssignment name to subscribe to for this cluster.
    pub fn endpoint_resource_name(&self) -> &str {
        self.eds_service_name.as_deref().unwrap_or(&self.name)
    }
}

/// A set of endpoints for a cluster, built from a ClusterLoadAssignment.
///
/// Clusters are replaced wholesale on every update.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct XdsCluster {
    pub name: String,
    pub endpoints: Vec<XdsEndpoint>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct XdsEndpoint {
    pub address: String,
    pub port: u32,
    pub healthy: bool,
}

/// A RouteConfiguration as delivered on the wire. Flattened into the
/// virtual host cache by service name.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct XdsRouteConfiguration {
    pub name: String,
    pub virtual_hosts: Vec<XdsVirtualHost>,
}

impl XdsRouteConfiguration {
    /// Iterate over `(service_name, virtual_host)` pairs.
    pub fn virtual_hosts_by_service(&self) -> impl Iterator<Item = (&str, &XdsVirtualHost)> {
        self.virtual_hosts.iter().map(|vh| (vh.service_name(), vh))
    }
}

/// Routing rules for one logical service.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct XdsVirtualHost {
    pub name: String,
    pub domains: Vec<String>,
    pub routes: Vec<XdsRoute>,
}

impl XdsVirtualHost {
    /// The service this virtual host routes for: its name without any
    /// trailing `:port`.
    pub fn service_name(&self) -> &str {
        match self.name.rsplit_once(':') {
            Some((service, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
                service
            }
            _ => &self.name,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct XdsRoute {
    pub name: String,
    pub route_match: XdsRouteMatch,
    pub action: XdsRouteAction,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum XdsRouteMatch {
    Prefix(String),
    Path(String),
    SafeRegex(String),
    /// A match this client does not model. Consumers should treat it as
    /// never matching.
    Unsupported,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum XdsRouteAction {
    Cluster(String),
    WeightedClusters(Vec<String>),
    Unsupported,
}

impl From<xds_listener::Listener> for XdsListener {
    fn from(listener: xds_listener::Listener) -> Self {
        let mut route_config_names = BTreeSet::new();

        let chain_filters = listener
            .filter_chains
            .iter()
            .flat_map(|chain| chain.filters.iter())
            .filter_map(|f| match &f.config_type {
                Some(filter::ConfigType::TypedConfig(any)) => Some(any),
                _ => None,
            });
        let api_listener = listener
            .api_listener
            .as_ref()
            .and_then(|api| api.api_listener.as_ref());

        for any in chain_filters.chain(api_listener) {
            if let Some(name) = rds_route_name(any) {
                route_config_names.insert(name);
            }
        }

        Self {
            name: listener.name,
            route_config_names,
        }
    }
}

/// Pull an RDS route config name out of an HttpConnectionManager. Anything
/// else, including inline route configs, is ignored.
fn rds_route_name(any: &protobuf::Any) -> Option<String> {
    if any.type_url != xds_http::HttpConnectionManager::type_url() {
        return None;
    }

    let hcm = match xds_http::HttpConnectionManager::decode(&any.value[..]) {
        Ok(hcm) => hcm,
        Err(e) => {
            trace!(err = %e, "skipping undecodable HttpConnectionManager");
            return None;
        }
    };

    match hcm.route_specifier {
        Some(RouteSpecifier::Rds(rds)) if !rds.route_config_name.is_empty() => {
            Some(rds.route_config_name)
        }
        _ => None,
    }
}

impl From<xds_cluster::Cluster> for XdsClusterConfig {
    fn from(cluster: xds_cluster::Cluster) -> Self {
        let eds_service_name = cluster
            .eds_cluster_config
            .map(|eds| eds.service_name)
            .filter(|name| !name.is_empty());

        Self {
            name: cluster.name,
            eds_service_name,
        }
    }
}

impl From<xds_endpoint::ClusterLoadAssignment> for XdsCluster {
    fn from(cla: xds_endpoint::ClusterLoadAssignment) -> Self {
        let endpoints = cla
            .endpoints
            .into_iter()
            .flat_map(|locality| locality.lb_endpoints)
            .filter_map(XdsEndpoint::from_lb_endpoint)
            .collect();

        Self {
            name: cla.cluster_name,
            endpoints,
        }
    }
}

impl XdsEndpoint {
    fn from_lb_endpoint(lb: xds_endpoint::LbEndpoint) -> Option<Self> {
        let healthy = !matches!(
            xds_core::HealthStatus::try_from(lb.health_status),
            Ok(xds_core::HealthStatus::Unhealthy
                | xds_core::HealthStatus::Draining
                | xds_core::HealthStatus::Timeout)
        );

        let endpoint = match lb.host_identifier? {
            lb_endpoint::HostIdentifier::Endpoint(endpoint) => endpoint,
            _ => return None,
        };

        let socket_addr = match endpoint.address?.address? {
            address::Address::SocketAddress(socket_addr) => socket_addr,
            _ => return None,
        };

        let port = match socket_addr.port_specifier {
            Some(socket_address::PortSpecifier::PortValue(port)) => port,
            _ => 0,
        };

        Some(Self {
            address: socket_addr.address,
            port,
            healthy,
        })
    }
}

impl From<xds_route::RouteConfiguration> for XdsRouteConfiguration {
    fn from(route_config: xds_route::RouteConfiguration) -> Self {
        let virtual_hosts = route_config
            .virtual_hosts
            .into_iter()
            .map(XdsVirtualHost::from)
            .collect();

        Self {
            name: route_config.name,
            virtual_hosts,
        }
    }
}

impl From<xds_route::VirtualHost> for XdsVirtualHost {
    fn from(vh: xds_route::VirtualHost) -> Self {
        Self {
            name: vh.name,
            domains: vh.domains,
            routes: vh.routes.into_iter().map(XdsRoute::from).collect(),
        }
    }
}

impl From<xds_route::Route> for XdsRoute {
    fn from(r: xds_route::Route) -> Self {
        let route_match = match r.r#match.and_then(|m| m.path_specifier) {
            Some(route_match::PathSpecifier::Prefix(prefix)) => XdsRouteMatch::Prefix(prefix),
            Some(route_match::PathSpecifier::Path(path)) => XdsRouteMatch::Path(path),
            Some(route_match::PathSpecifier::SafeRegex(regex)) => {
                XdsRouteMatch::SafeRegex(regex.regex)
            }
            _ => XdsRouteMatch::Unsupported,
        };

        let action = match r.action {
            Some(route::Action::Route(action)) => match action.cluster_specifier {
                Some(route_action::ClusterSpecifier::Cluster(name)) => XdsRouteAction::Cluster(name),
                Some(route_action::ClusterSpecifier::WeightedClusters(weighted)) => {
                    XdsRouteAction::WeightedClusters(
                        weighted.clusters.into_iter().map(|c| c.name).collect(),
                    )
                }
                _ => XdsRouteAction::Unsupported,
            },
            _ => XdsRouteAction::Unsupported,
        };

        Self {
            name: r.name,
            route_match,
            action,
        }
    }
}
