// Process-wide request and realtime counters, rendered in the Prometheus
// text exposition format at `GET /metrics`.

use std::{
    collections::BTreeMap,
    fmt::Write as _,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, OnceLock, PoisonError,
    },
};

static GLOBAL_METRICS: OnceLock<Arc<RelayMetrics>> = OnceLock::new();

/// First call wins; later calls are ignored.
pub fn set_global_metrics(metrics: Arc<RelayMetrics>) {
    let _ = GLOBAL_METRICS.set(metrics);
}

pub fn global_metrics() -> Option<&'static Arc<RelayMetrics>> {
    GLOBAL_METRICS.get()
}

pub fn record_http_request(method: &str, path: &str, status_code: u16, latency_ms: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.record_http_request(method, path, status_code, latency_ms);
    }
}

pub fn record_realtime_event(kind: &str, is_error: bool, latency_ms: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.record_realtime_event(kind, is_error, latency_ms);
    }
}

pub fn set_realtime_gauges(connections: usize, cached_canvases: usize) {
    if let Some(metrics) = global_metrics() {
        metrics.set_realtime_gauges(connections, cached_canvases);
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Sample {
    total: u64,
    errors: u64,
    duration_ms_sum: u64,
}

/// Counters sharing one label set, kept sorted for stable output.
struct Family<K> {
    prefix: &'static str,
    subject: &'static str,
    samples: Mutex<BTreeMap<K, Sample>>,
}

impl<K: Ord + Labels> Family<K> {
    fn new(prefix: &'static str, subject: &'static str) -> Self {
        Self { prefix, subject, samples: Mutex::new(BTreeMap::new()) }
    }

    fn observe(&self, key: K, is_error: bool, latency_ms: u64) {
        let mut samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
        let sample = samples.entry(key).or_default();
        sample.total = sample.total.saturating_add(1);
        sample.duration_ms_sum = sample.duration_ms_sum.saturating_add(latency_ms);
        if is_error {
            sample.errors = sample.errors.saturating_add(1);
        }
    }

    fn render(&self, out: &mut String) {
        let samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
        let series: [(&str, &str, fn(&Sample) -> u64); 4] = [
            ("rate_total", "Total", |sample| sample.total),
            ("errors_total", "Error responses among", |sample| sample.errors),
            ("duration_ms_sum", "Summed latency in milliseconds of", |sample| {
                sample.duration_ms_sum
            }),
            ("duration_ms_count", "Latency samples for", |sample| sample.total),
        ];

        for (suffix, help, value_of) in series {
            let name = format!("{}_{suffix}", self.prefix);
            let _ = writeln!(out, "# HELP {name} {help} {}.", self.subject);
            let _ = writeln!(out, "# TYPE {name} counter");
            for (key, sample) in samples.iter() {
                let _ = writeln!(out, "{name}{{{}}} {}", key.labels(), value_of(sample));
            }
        }
    }
}

trait Labels {
    fn labels(&self) -> String;
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct HttpKey {
    method: String,
    endpoint: String,
}

impl Labels for HttpKey {
    fn labels(&self) -> String {
        format!(
            "method=\"{}\",endpoint=\"{}\"",
            escape_label_value(&self.method),
            escape_label_value(&self.endpoint)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct EventKey(String);

impl Labels for EventKey {
    fn labels(&self) -> String {
        format!("event=\"{}\"", escape_label_value(&self.0))
    }
}

pub struct RelayMetrics {
    http: Family<HttpKey>,
    realtime: Family<EventKey>,
    realtime_connections: AtomicU64,
    realtime_cached_canvases: AtomicU64,
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self {
            http: Family::new("relay_request", "HTTP requests by endpoint"),
            realtime: Family::new("relay_realtime", "realtime events by kind"),
            realtime_connections: AtomicU64::new(0),
            realtime_cached_canvases: AtomicU64::new(0),
        }
    }
}

impl RelayMetrics {
    pub fn record_http_request(&self, method: &str, path: &str, status_code: u16, latency_ms: u64) {
        let key =
            HttpKey { method: method.to_ascii_uppercase(), endpoint: endpoint_template(path) };
        self.http.observe(key, status_code >= 400, latency_ms);
    }

    pub fn record_realtime_event(&self, kind: &str, is_error: bool, latency_ms: u64) {
        let kind = match kind.trim() {
            "" => "unknown",
            trimmed => trimmed,
        };
        self.realtime.observe(EventKey(kind.to_owned()), is_error, latency_ms);
    }

    pub fn set_realtime_gauges(&self, connections: usize, cached_canvases: usize) {
        self.realtime_connections.store(connections as u64, Ordering::Relaxed);
        self.realtime_cached_canvases.store(cached_canvases as u64, Ordering::Relaxed);
    }

    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();
        self.http.render(&mut out);
        self.realtime.render(&mut out);

        let gauges = [
            ("relay_realtime_connections", "Open realtime connections.", &self.realtime_connections),
            (
                "relay_realtime_cached_canvases",
                "Canvas snapshots held by the session registry.",
                &self.realtime_cached_canvases,
            ),
        ];
        for (name, help, gauge) in gauges {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} gauge");
            let _ = writeln!(out, "{name} {}", gauge.load(Ordering::Relaxed));
        }
        out
    }
}

/// Collapses ids in unmatched paths so label cardinality stays bounded.
fn endpoint_template(path: &str) -> String {
    let segments: Vec<&str> = path
        .split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            if uuid::Uuid::parse_str(segment).is_ok() {
                "{uuid}"
            } else if segment.bytes().all(|byte| byte.is_ascii_digit()) {
                "{number}"
            } else {
                segment
            }
        })
        .collect();
    format!("/{}", segments.join("/"))
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n").replace('"', "\\\"")
}
