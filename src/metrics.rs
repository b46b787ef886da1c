use std::{net::SocketAddr, time::Instant};

use metrics::{describe_counter, describe_gauge, Gauge, Histogram, IntoF64};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install and start a prometheus http exporter listening on `metrics_addr` and
/// describe every metric the client records.
///
/// Metrics are recorded whether or not an exporter is installed. Without one
/// they go nowhere.
pub fn install_prom(metrics_addr: &str) -> anyhow::Result<()> {
    let metrics_addr: SocketAddr = metrics_addr.parse()?;

    // dispatch is in-process work on a single task, so start the buckets at
    // 10 micros and go up exponentially from there.
    const US_PER_SEC: f64 = 1000000.0;
    let buckets: Vec<f64> = (0..16)
        .map(|i| (2u32.pow(i) as f64) * 10.0 / US_PER_SEC)
        .collect();

    let builder = PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .set_buckets(&buckets)?;
    builder.install()?;

    describe_metrics();

    Ok(())
}

fn describe_metrics() {
    describe_timer!(
        "xds.dispatch_time",
        "Time spent handling a single DiscoveryResponse, by type (seconds)",
    );
    describe_gauge!(
        "xds.connected",
        "1 while an ADS stream to the control plane is open",
    );
    describe_counter!("xds.tx", "The total number of DiscoveryRequests sent");
    describe_counter!("xds.rx", "The total number of DiscoveryResponses handled");
    describe_counter!(
        "xds.reconnects",
        "The number of times the ADS stream was lost and scheduled for recovery"
    );
    describe_counter!(
        "xds.decode_errors",
        "The number of resources skipped because they failed to decode"
    );
}

/// Increments a gauge by the given amount, then decrements it when the returned
/// guard goes out of scope.
///
/// ```ignore
/// {
///   // the gauge is 1 for the duration of this block
///   let _gauge = scoped_gauge!("xds.connected");
///   read_the_stream().await;
/// }
/// ```
macro_rules! scoped_gauge {
    ($name:expr) => {
        crate::metrics::scoped_gauge!($name, 1.0)
    };
    ($name:expr, $inc:expr) => {{
        let g = ::metrics::gauge!($name);
        g.increment($inc);
        crate::metrics::IncGuard::new(g, -$inc)
    }};
}
pub(crate) use scoped_gauge;

/// Describe a timer. Shorthand for `describe_histogram!(name, Unit::Seconds,
/// description)`.
macro_rules! describe_timer {
    ($name:expr, $description:expr $(,)?) => {{
        ::metrics::describe_histogram!($name, ::metrics::Unit::Seconds, $description)
    }};
}
pub(crate) use describe_timer;

/// Creates a timer that runs until it goes out of scope. Durations are
/// recorded in a histogram as an f64 number of seconds.
macro_rules! scoped_timer {
    ($name:expr $(, $label_key:expr $(=> $label_value:expr)?)* $(,)?) => {{
        let hist = ::metrics::histogram!($name $(, $label_key $(=> $label_value)?)*);
        crate::metrics::TimerGuard::new_at(hist, std::time::Instant::now())
    }};
}
pub(crate) use scoped_timer;

/// An RAII guard that undoes a gauge increment on drop.
///
/// Created with [scoped_gauge].
pub(crate) struct IncGuard {
    gauge: Gauge,
    value: f64,
}

impl IncGuard {
    pub(crate) fn new<T: IntoF64>(gauge: Gauge, value: T) -> Self {
        let value = value.into_f64();
        Self { gauge, value }
    }
}

impl Drop for IncGuard {
    fn drop(&mut self) {
        self.gauge.increment(self.value);
    }
}

/// An RAII timer guard that records its duration on drop.
///
/// Created with [scoped_timer].
pub(crate) struct TimerGuard {
    hist: Histogram,
    started_at: Instant,
}

impl TimerGuard {
    pub(crate) fn new_at(hist: Histogram, started_at: Instant) -> Self {
        Self { hist, started_at }
    }
}

impl Drop for TimerGuard {
    fn drop(&mut self) {
        self.hist.record(self.started_at.elapsed().as_secs_f64());
    }
}
