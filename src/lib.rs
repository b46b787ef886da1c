//! A client for mesh control planes that speak the Aggregated Discovery
//! Service.
//!
//! [ResourceExchange] is the entry point: it holds one ADS stream open,
//! follows Listeners into Routes and Clusters into Endpoints, and keeps the
//! result in a cache that can be read or watched by service and cluster
//! name.
//!
//! ```no_run
//! # async fn example() -> anyhow::Result<()> {
//! use std::sync::Arc;
//! use pilot::{ClientConfig, ResourceExchange};
//! use pilot::xds::model::XdsCluster;
//!
//! let config = ClientConfig::new("http://istiod.istio-system.svc:15010")?;
//! let exchange = ResourceExchange::initialize(&config)?;
//!
//! exchange.subscribe_cluster(
//!     "outbound|9080||reviews.default.svc.cluster.local",
//!     Arc::new(|name: &str, cluster: &Arc<XdsCluster>| {
//!         println!("{name}: {} endpoints", cluster.endpoints.len());
//!     }),
//! );
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod metrics;
pub mod xds;

pub use config::{ClientConfig, ConfigError};
pub use xds::{ResourceExchange, SessionError};
