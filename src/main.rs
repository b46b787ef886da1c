use std::{sync::Arc, time::Duration};

use anyhow::Context;
use clap::Parser;
use pilot::{
    xds::{
        model::{XdsCluster, XdsVirtualHost},
        NodeBuilder, ResourceExchange,
    },
    ClientConfig,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// watch a mesh control plane over ADS and log what it sends
#[derive(Parser, Debug)]
#[command(version)]
struct CliArgs {
    /// Log in a pretty, human-readable format.
    #[arg(long)]
    log_pretty: bool,

    /// The control plane to connect to.
    #[arg(long, short, default_value = "http://127.0.0.1:15010")]
    server: String,

    /// The node id to send. Defaults to a sidecar id built from INSTANCE_IP,
    /// POD_NAME and POD_NAMESPACE.
    #[arg(long)]
    node_id: Option<String>,

    /// The node cluster to send. Defaults to ISTIO_META_CLUSTER_ID, or
    /// `Kubernetes`.
    #[arg(long)]
    node_cluster: Option<String>,

    /// Extra metadata to send on the ADS stream, as KEY=VALUE. May be repeated.
    #[arg(long = "metadata", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    metadata: Vec<(String, String)>,

    /// Log every change to the virtual host for a service. May be repeated.
    #[arg(long = "watch-route", value_name = "SERVICE")]
    watch_routes: Vec<String>,

    /// Log every change to the endpoints of a cluster. May be repeated.
    #[arg(long = "watch-cluster", value_name = "CLUSTER")]
    watch_clusters: Vec<String>,

    /// Serve Prometheus metrics on this address.
    #[arg(long)]
    metrics_addr: Option<String>,

    /// How often to log a summary of everything discovered, in seconds.
    #[arg(long, default_value_t = 30)]
    summary_interval: u64,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {s:?}")),
    }
}

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();
    setup_tracing(args.log_pretty);

    if let Err(e) = run(args).await {
        tracing::error!(err = ?e, "exiting: {e}");
        std::process::exit(1);
    }
}

fn setup_tracing(log_pretty: bool) {
    let default_log_filter = "pilot=info"
        .parse()
        .expect("default log filter must be valid");
    let builder = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(default_log_filter)
                .from_env_lossy(),
        )
        .with_target(true);

    if log_pretty {
        builder.init();
    } else {
        builder
            .json()
            .flatten_event(true)
            .with_span_list(false)
            .init();
    }
}

async fn run(args: CliArgs) -> anyhow::Result<()> {
    if let Some(addr) = &args.metrics_addr {
        pilot::metrics::install_prom(addr).context("failed to start metrics exporter")?;
    }

    let mut node = NodeBuilder::from_env();
    if let Some(id) = args.node_id {
        node = node.id(id);
    }
    if let Some(cluster) = args.node_cluster {
        node = node.cluster(cluster);
    }

    let mut config = ClientConfig::new(&args.server)?.with_node(node.build());
    for (key, value) in &args.metadata {
        config = config.with_metadata(key, value)?;
    }

    let exchange = ResourceExchange::initialize(&config)?;

    for service in &args.watch_routes {
        exchange.subscribe_route(
            service,
            Arc::new(|service: &str, vh: &Arc<XdsVirtualHost>| {
                info!(
                    service,
                    domains = ?vh.domains,
                    routes = vh.routes.len(),
                    "route changed"
                );
            }),
        );
    }
    for cluster in &args.watch_clusters {
        exchange.subscribe_cluster(
            cluster,
            Arc::new(|cluster: &str, c: &Arc<XdsCluster>| {
                let endpoints: Vec<_> = c
                    .endpoints
                    .iter()
                    .map(|e| format!("{}:{}", e.address, e.port))
                    .collect();
                info!(cluster, ?endpoints, "cluster changed");
            }),
        );
    }

    let mut summary = tokio::time::interval(Duration::from_secs(args.summary_interval.max(1)));
    loop {
        tokio::select! {
            _ = summary.tick() => {
                info!(
                    state = ?exchange.session_state(),
                    routes = exchange.subscribed_routes().len(),
                    virtual_hosts = exchange.virtual_host_map().len(),
                    clusters = exchange.cluster_map().len(),
                    "discovery summary"
                );
            },
            res = tokio::signal::ctrl_c() => {
                res?;
                break;
            },
        }
    }

    info!("shutting down");
    exchange.destroy();
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_key_value() {
        assert_eq!(
            parse_key_value("authorization=Bearer a=b"),
            Ok(("authorization".to_string(), "Bearer a=b".to_string()))
        );
        assert!(parse_key_value("novalue").is_err());
        assert!(parse_key_value("=v").is_err());
    }

    #[test]
    fn test_cli_args() {
        let args = CliArgs::try_parse_from([
            "pilot",
            "--server",
            "http://istiod:15010",
            "--metadata",
            "ClusterID=Kubernetes",
            "--watch-cluster",
            "a",
            "--watch-cluster",
            "b",
        ])
        .unwrap();

        assert_eq!(args.server, "http://istiod:15010");
        assert_eq!(
            args.metadata,
            vec![("ClusterID".to_string(), "Kubernetes".to_string())]
        );
        assert_eq!(args.watch_clusters, ["a", "b"]);
        assert!(args.watch_routes.is_empty());
    }
}
