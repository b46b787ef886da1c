use xds_api::pb::envoy::config::core::v3 as xds_core;

const DEFAULT_CLUSTER_DOMAIN: &str = "cluster.local";
const DEFAULT_CLUSTER_ID: &str = "Kubernetes";
const USER_AGENT_NAME: &str = "pilot";

/// Builds the [xds_core::Node] attached to every discovery request.
///
/// By default the node id follows the sidecar convention mesh control planes
/// expect, `sidecar~{ip}~{pod}.{namespace}~{namespace}.svc.{domain}`, with
/// each part taken from the pod environment (`INSTANCE_IP`, `POD_NAME`,
/// `POD_NAMESPACE`) unless set explicitly. An explicit id replaces the whole
/// thing.
#[derive(Clone, Debug, Default)]
pub struct NodeBuilder {
    id: Option<String>,
    cluster: Option<String>,
    pod_ip: Option<String>,
    pod_name: Option<String>,
    namespace: Option<String>,
    cluster_domain: Option<String>,
}

impl NodeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read unset fields from the standard pod environment variables.
    pub fn from_env() -> Self {
        Self {
            pod_ip: std::env::var("INSTANCE_IP").ok(),
            pod_name: std::env::var("POD_NAME").ok(),
            namespace: std::env::var("POD_NAMESPACE").ok(),
            cluster: std::env::var("ISTIO_META_CLUSTER_ID").ok(),
            ..Default::default()
        }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn cluster(mut self, cluster: impl Into<String>) -> Self {
        self.cluster = Some(cluster.into());
        self
    }

    pub fn pod_ip(mut self, pod_ip: impl Into<String>) -> Self {
        self.pod_ip = Some(pod_ip.into());
        self
    }

    pub fn pod_name(mut self, pod_name: impl Into<String>) -> Self {
        self.pod_name = Some(pod_name.into());
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn cluster_domain(mut self, domain: impl Into<String>) -> Self {
        self.cluster_domain = Some(domain.into());
        self
    }

    pub fn build(self) -> xds_core::Node {
        let id = self.id.unwrap_or_else(|| {
            let ip = self.pod_ip.as_deref().unwrap_or("127.0.0.1");
            let pod = self.pod_name.as_deref().unwrap_or("localhost");
            let ns = self.namespace.as_deref().unwrap_or("default");
            let domain = self
                .cluster_domain
                .as_deref()
                .unwrap_or(DEFAULT_CLUSTER_DOMAIN);

            format!("sidecar~{ip}~{pod}.{ns}~{ns}.svc.{domain}")
        });

        xds_core::Node {
            id,
            cluster: self.cluster.unwrap_or_else(|| DEFAULT_CLUSTER_ID.to_string()),
            user_agent_name: USER_AGENT_NAME.to_string(),
            user_agent_version_type: Some(xds_core::node::UserAgentVersionType::UserAgentVersion(
                env!("CARGO_PKG_VERSION").to_string(),
            )),
            ..Default::default()
        }
    }
}
