use std::{str::FromStr, time::Duration};

use tonic::{
    metadata::{AsciiMetadataKey, AsciiMetadataValue},
    transport::{Endpoint, Uri},
};
use xds_api::pb::envoy::config::core::v3 as xds_core;

use crate::xds::NodeBuilder;

/// How often protocols are allowed to re-check their subscriptions. Kept for
/// parity with control planes that document a polling timeout; the client
/// relies on server push.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid server uri: {0}")]
    InvalidUri(String),

    #[error("invalid metadata {key:?}: {reason}")]
    InvalidMetadata { key: String, reason: String },
}

/// Everything needed to start talking to a control plane.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub(crate) endpoint: Endpoint,
    pub(crate) node: xds_core::Node,
    pub(crate) check_interval: Duration,
    pub(crate) metadata: Vec<(AsciiMetadataKey, AsciiMetadataValue)>,
}

impl ClientConfig {
    /// Create a config for the control plane at `uri`, with a node identity
    /// taken from the pod environment.
    pub fn new(uri: &str) -> Result<Self, ConfigError> {
        let uri = Uri::from_str(uri).map_err(|e| ConfigError::InvalidUri(e.to_string()))?;
        if uri.host().is_none() {
            return Err(ConfigError::InvalidUri(format!("{uri}: missing host")));
        }

        Ok(Self::from_endpoint(Endpoint::from(uri)))
    }

    /// Create a config from an already configured endpoint. Use this to set
    /// up TLS or timeouts.
    pub fn from_endpoint(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            node: NodeBuilder::from_env().build(),
            check_interval: DEFAULT_CHECK_INTERVAL,
            metadata: Vec::new(),
        }
    }

    pub fn with_node(mut self, node: xds_core::Node) -> Self {
        self.node = node;
        self
    }

    pub fn with_check_interval(mut self, check_interval: Duration) -> Self {
        self.check_interval = check_interval;
        self
    }

    /// Attach a metadata header (e.g. `authorization`) to the ADS stream.
    pub fn with_metadata(mut self, key: &str, value: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidMetadata {
            key: key.to_string(),
            reason,
        };

        let k = AsciiMetadataKey::from_str(key).map_err(|e| invalid(e.to_string()))?;
        let v = AsciiMetadataValue::from_str(value).map_err(|e| invalid(e.to_string()))?;
        self.metadata.push((k, v));
        Ok(self)
    }

    pub fn node(&self) -> &xds_core::Node {
        &self.node
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    pub fn uri(&self) -> &Uri {
        self.endpoint.uri()
    }
}
