//! Metric collectors and the scrape registry.
//!
//! Every source implements the [`Collector`] trait: one `update` call per
//! scrape, writing gauge samples into a shared sink. The [`Registry`] owns
//! the enabled collectors and runs them concurrently, so a slow or failing
//! source never blocks the others.

pub mod iptables;
pub mod mock;
pub mod v2ray;

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::warn;

pub use self::iptables::IptablesCollector;
pub use self::v2ray::V2rayCollector;

/// Prefix shared by every exposed metric name.
pub const NAMESPACE: &str = "traffic";

/// Static metadata for one exposed metric kind.
///
/// Built once at collector construction and shared by every sample the
/// collector emits for it.
#[derive(Debug)]
pub struct Descriptor {
    fq_name: String,
    help: String,
    label_names: &'static [&'static str],
}

impl Descriptor {
    /// Creates a descriptor named `NAMESPACE_subsystem_name`.
    pub fn new(
        subsystem: &str,
        name: &str,
        help: &str,
        label_names: &'static [&'static str],
    ) -> Arc<Self> {
        Arc::new(Self {
            fq_name: format!("{NAMESPACE}_{subsystem}_{name}"),
            help: help.to_string(),
            label_names,
        })
    }

    pub fn fq_name(&self) -> &str {
        &self.fq_name
    }

    pub fn help(&self) -> &str {
        &self.help
    }

    pub fn label_names(&self) -> &'static [&'static str] {
        self.label_names
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Gauge,
    Counter,
}

/// One concrete value emitted for a descriptor during a scrape.
///
/// Label values are positional and must match the descriptor's label names.
#[derive(Debug, Clone)]
pub struct Sample {
    pub desc: Arc<Descriptor>,
    pub kind: MetricKind,
    pub value: f64,
    pub label_values: Vec<String>,
}

impl Sample {
    pub fn new(
        desc: &Arc<Descriptor>,
        kind: MetricKind,
        value: f64,
        label_values: Vec<String>,
    ) -> Self {
        debug_assert_eq!(label_values.len(), desc.label_names.len());
        Self {
            desc: Arc::clone(desc),
            kind,
            value,
            label_values,
        }
    }

    pub fn gauge(desc: &Arc<Descriptor>, value: f64, label_values: Vec<String>) -> Self {
        Self::new(desc, MetricKind::Gauge, value, label_values)
    }
}

/// Write-only sink collectors emit samples into during a scrape.
pub type SampleSink = mpsc::UnboundedSender<Sample>;

/// Error type for collector construction and scraping.
#[derive(Debug)]
pub enum CollectError {
    /// The external source could not be reached at all this scrape.
    Unavailable(String),
    /// The source answered but a later query failed; samples already
    /// emitted this scrape stand.
    Partial(String),
    /// Rejected configuration; the collector must not be registered.
    InvalidConfig(String),
}

impl std::fmt::Display for CollectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollectError::Unavailable(msg) => write!(f, "source unavailable: {}", msg),
            CollectError::Partial(msg) => write!(f, "partial collection: {}", msg),
            CollectError::InvalidConfig(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for CollectError {}

/// A metric source invoked once per scrape.
///
/// `update` writes zero or more samples into the sink and returns an error
/// when the source's data for this scrape is unavailable or partial.
/// Malformed records in otherwise healthy source output are skipped, never
/// escalated.
#[async_trait]
pub trait Collector: Send + Sync {
    async fn update(&self, sink: &SampleSink) -> Result<(), CollectError>;
}

/// Configuration passed into collector constructors. No global state.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub v2ray: V2rayConfig,
}

/// Settings for the V2Ray stats collector.
#[derive(Debug, Clone)]
pub struct V2rayConfig {
    /// Stats API endpoint, `host:port`.
    pub endpoint: String,
    /// Dial and per-query timeout in seconds. Zero is rejected.
    pub timeout: u8,
}

impl Default for V2rayConfig {
    fn default() -> Self {
        Self {
            endpoint: "127.0.0.1:10085".to_string(),
            timeout: 3,
        }
    }
}

type Constructor = fn(&Config) -> Result<Box<dyn Collector>, CollectError>;

/// A collector known to the registry.
pub struct CollectorEntry {
    pub name: &'static str,
    pub enabled_by_default: bool,
    constructor: Constructor,
}

fn new_iptables(_config: &Config) -> Result<Box<dyn Collector>, CollectError> {
    Ok(Box::new(IptablesCollector::new()?))
}

fn new_v2ray(config: &Config) -> Result<Box<dyn Collector>, CollectError> {
    Ok(Box::new(V2rayCollector::new(&config.v2ray)?))
}

/// All collectors this exporter knows how to run.
pub const COLLECTORS: &[CollectorEntry] = &[
    CollectorEntry {
        name: "iptables",
        enabled_by_default: true,
        constructor: new_iptables,
    },
    CollectorEntry {
        name: "v2ray",
        enabled_by_default: true,
        constructor: new_v2ray,
    },
];

/// The set of enabled collectors plus the scrape driver.
pub struct Registry {
    collectors: Vec<(&'static str, Arc<dyn Collector>)>,
    success_desc: Arc<Descriptor>,
    duration_desc: Arc<Descriptor>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("collectors", &self.collector_names().collect::<Vec<_>>())
            .field("success_desc", &self.success_desc)
            .field("duration_desc", &self.duration_desc)
            .finish()
    }
}

impl Registry {
    /// Builds the registry from the collector table, applying
    /// enable/disable overrides on top of the per-entry defaults.
    ///
    /// Unknown collector names and failed constructors are startup errors.
    pub fn from_config(
        config: &Config,
        enable: &[String],
        disable: &[String],
    ) -> Result<Self, CollectError> {
        for name in enable.iter().chain(disable) {
            if !COLLECTORS.iter().any(|entry| entry.name == name) {
                return Err(CollectError::InvalidConfig(format!(
                    "unknown collector {:?}",
                    name
                )));
            }
        }

        let mut collectors = Vec::new();
        for entry in COLLECTORS {
            let enabled = if disable.iter().any(|name| name == entry.name) {
                false
            } else if enable.iter().any(|name| name == entry.name) {
                true
            } else {
                entry.enabled_by_default
            };
            if enabled {
                collectors.push((entry.name, Arc::from((entry.constructor)(config)?)));
            }
        }

        Ok(Self::with_collectors(collectors))
    }

    fn with_collectors(collectors: Vec<(&'static str, Arc<dyn Collector>)>) -> Self {
        Self {
            collectors,
            success_desc: Descriptor::new(
                "scrape",
                "collector_success",
                "Whether the collector succeeded this scrape.",
                &["collector"],
            ),
            duration_desc: Descriptor::new(
                "scrape",
                "collector_duration_seconds",
                "Duration of the collector's update this scrape.",
                &["collector"],
            ),
        }
    }

    /// Names of the enabled collectors, in table order.
    pub fn collector_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.collectors.iter().map(|(name, _)| *name)
    }

    /// Runs every enabled collector concurrently and gathers the emitted
    /// samples, appending per-collector success and duration gauges.
    ///
    /// A failed collector is logged and flagged through the success gauge;
    /// it never aborts the scrape.
    pub async fn scrape(&self) -> Vec<Sample> {
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut tasks = Vec::with_capacity(self.collectors.len());
        for (name, collector) in &self.collectors {
            let name = *name;
            let collector = Arc::clone(collector);
            let tx = tx.clone();
            tasks.push(tokio::spawn(async move {
                let started = Instant::now();
                let result = collector.update(&tx).await;
                (name, started.elapsed(), result)
            }));
        }
        drop(tx);

        let mut meta = Vec::with_capacity(self.collectors.len() * 2);
        for task in tasks {
            let Ok((name, elapsed, result)) = task.await else {
                continue;
            };
            let success = match result {
                Ok(()) => 1.0,
                Err(e) => {
                    warn!(collector = name, error = %e, "collector failed");
                    0.0
                }
            };
            meta.push(Sample::gauge(
                &self.success_desc,
                success,
                vec![name.to_string()],
            ));
            meta.push(Sample::gauge(
                &self.duration_desc,
                elapsed.as_secs_f64(),
                vec![name.to_string()],
            ));
        }

        let mut samples = Vec::new();
        while let Some(sample) = rx.recv().await {
            samples.push(sample);
        }
        samples.extend(meta);
        samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticCollector {
        desc: Arc<Descriptor>,
    }

    impl StaticCollector {
        fn new() -> Self {
            Self {
                desc: Descriptor::new("test", "value", "Test gauge.", &["side"]),
            }
        }
    }

    #[async_trait]
    impl Collector for StaticCollector {
        async fn update(&self, sink: &SampleSink) -> Result<(), CollectError> {
            let _ = sink.send(Sample::gauge(&self.desc, 1.0, vec!["left".to_string()]));
            let _ = sink.send(Sample::gauge(&self.desc, 2.0, vec!["right".to_string()]));
            Ok(())
        }
    }

    struct FailingCollector;

    #[async_trait]
    impl Collector for FailingCollector {
        async fn update(&self, _sink: &SampleSink) -> Result<(), CollectError> {
            Err(CollectError::Unavailable("boom".to_string()))
        }
    }

    fn find_meta(samples: &[Sample], desc_name: &str, collector: &str) -> f64 {
        samples
            .iter()
            .find(|s| s.desc.fq_name() == desc_name && s.label_values == [collector])
            .map(|s| s.value)
            .unwrap()
    }

    #[test]
    fn test_descriptor_fq_name() {
        let desc = Descriptor::new("iptables", "download_bytes", "help", &["chain", "rule"]);
        assert_eq!(desc.fq_name(), "traffic_iptables_download_bytes");
        assert_eq!(desc.label_names(), &["chain", "rule"]);
    }

    #[test]
    fn test_from_config_defaults() {
        let registry = Registry::from_config(&Config::default(), &[], &[]).unwrap();
        let names: Vec<_> = registry.collector_names().collect();
        assert_eq!(names, ["iptables", "v2ray"]);
    }

    #[test]
    fn test_from_config_disable_override() {
        let disable = vec!["v2ray".to_string()];
        let registry = Registry::from_config(&Config::default(), &[], &disable).unwrap();
        let names: Vec<_> = registry.collector_names().collect();
        assert_eq!(names, ["iptables"]);
    }

    #[test]
    fn test_from_config_unknown_collector() {
        let enable = vec!["nftables".to_string()];
        let err = Registry::from_config(&Config::default(), &enable, &[]).unwrap_err();
        assert!(matches!(err, CollectError::InvalidConfig(_)));
    }

    #[test]
    fn test_from_config_invalid_timeout() {
        let config = Config {
            v2ray: V2rayConfig {
                timeout: 0,
                ..V2rayConfig::default()
            },
        };
        let err = Registry::from_config(&config, &[], &[]).unwrap_err();
        assert!(matches!(err, CollectError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_scrape_gathers_and_flags_failures() {
        let registry = Registry::with_collectors(vec![
            ("static", Arc::new(StaticCollector::new()) as Arc<dyn Collector>),
            ("failing", Arc::new(FailingCollector) as Arc<dyn Collector>),
        ]);

        let samples = registry.scrape().await;

        let values: Vec<f64> = samples
            .iter()
            .filter(|s| s.desc.fq_name() == "traffic_test_value")
            .map(|s| s.value)
            .collect();
        assert_eq!(values.len(), 2);
        assert!(values.contains(&1.0) && values.contains(&2.0));

        assert_eq!(
            find_meta(&samples, "traffic_scrape_collector_success", "static"),
            1.0
        );
        assert_eq!(
            find_meta(&samples, "traffic_scrape_collector_success", "failing"),
            0.0
        );
        assert!(find_meta(&samples, "traffic_scrape_collector_duration_seconds", "static") >= 0.0);
    }

    #[tokio::test]
    async fn test_scrape_label_arity() {
        let registry = Registry::with_collectors(vec![(
            "static",
            Arc::new(StaticCollector::new()) as Arc<dyn Collector>,
        )]);

        for sample in registry.scrape().await {
            assert_eq!(sample.label_values.len(), sample.desc.label_names().len());
        }
    }
}
