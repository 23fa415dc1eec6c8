//! V2Ray stats collector.
//!
//! Dials the V2Ray stats gRPC API once per scrape: system stats first for
//! liveness and uptime, then the full counter table. Counter names follow
//! the `dimension>>>target>>>category>>>direction` convention; anything
//! shorter is skipped.

pub mod rpc;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tonic::transport::{Channel, Endpoint};

use self::rpc::stats_service_client::StatsServiceClient;
use self::rpc::{QueryStatsRequest, SysStatsRequest};
use super::{CollectError, Collector, Descriptor, Sample, SampleSink, V2rayConfig};

const V2RAY_LABELS: &[&str] = &["dimension", "target"];

/// Segment separator in hierarchical counter names.
const STAT_SEPARATOR: &str = ">>>";

/// Direction segment marking outbound traffic; every other value counts
/// as downlink.
const UPLINK: &str = "uplink";

/// Collector exposing V2Ray liveness, uptime, and per-counter traffic.
#[derive(Debug)]
pub struct V2rayCollector {
    endpoint: Endpoint,
    addr: String,
    up_desc: Arc<Descriptor>,
    uptime_desc: Arc<Descriptor>,
    download_desc: Arc<Descriptor>,
    upload_desc: Arc<Descriptor>,
}

impl V2rayCollector {
    /// Builds the collector, validating the endpoint and timeout up front
    /// so a misconfigured collector is never registered.
    pub fn new(config: &V2rayConfig) -> Result<Self, CollectError> {
        if config.timeout == 0 {
            return Err(CollectError::InvalidConfig(
                "v2ray timeout must be at least one second".to_string(),
            ));
        }
        let timeout = Duration::from_secs(u64::from(config.timeout));
        let endpoint = Endpoint::from_shared(format!("http://{}", config.endpoint))
            .map_err(|e| {
                CollectError::InvalidConfig(format!(
                    "v2ray endpoint {:?}: {}",
                    config.endpoint, e
                ))
            })?
            .connect_timeout(timeout)
            .timeout(timeout);

        Ok(Self {
            endpoint,
            addr: config.endpoint.clone(),
            up_desc: Descriptor::new(
                "v2ray",
                "up",
                "Whether the V2Ray stats endpoint answered the scrape.",
                &[],
            ),
            uptime_desc: Descriptor::new("v2ray", "uptime", "V2Ray uptime in seconds.", &[]),
            download_desc: Descriptor::new(
                "v2ray",
                "download_bytes_total",
                "Number of downloaded bytes.",
                V2RAY_LABELS,
            ),
            upload_desc: Descriptor::new(
                "v2ray",
                "upload_bytes_total",
                "Number of uploaded bytes.",
                V2RAY_LABELS,
            ),
        })
    }

    /// Queries system stats and the counter table over an established
    /// channel. The channel is dropped on every exit path.
    async fn collect_stats(
        &self,
        channel: Channel,
        sink: &SampleSink,
    ) -> Result<(), CollectError> {
        let mut client = StatsServiceClient::new(channel);

        let sys = client
            .get_sys_stats(SysStatsRequest {})
            .await
            .map_err(|e| CollectError::Partial(format!("querying system stats: {}", e)))?
            .into_inner();
        let _ = sink.send(Sample::gauge(&self.up_desc, 1.0, Vec::new()));
        let _ = sink.send(Sample::gauge(
            &self.uptime_desc,
            f64::from(sys.uptime),
            Vec::new(),
        ));

        let counters = client
            .query_stats(QueryStatsRequest {
                pattern: String::new(),
                reset: false,
            })
            .await
            .map_err(|e| CollectError::Partial(format!("querying traffic counters: {}", e)))?
            .into_inner();
        for stat in counters.stat {
            if let Some(sample) = self.stat_sample(&stat.name, stat.value) {
                let _ = sink.send(sample);
            }
        }
        Ok(())
    }

    /// Maps one hierarchical counter to a traffic sample.
    ///
    /// The name must carry exactly four segments; malformed names yield
    /// `None` and are skipped by the caller.
    fn stat_sample(&self, name: &str, value: i64) -> Option<Sample> {
        let segments: Vec<&str> = name.split(STAT_SEPARATOR).collect();
        let [dimension, target, _category, direction] = segments[..] else {
            return None;
        };
        let desc = if direction == UPLINK {
            &self.upload_desc
        } else {
            &self.download_desc
        };
        Some(Sample::gauge(
            desc,
            value as f64,
            vec![dimension.to_string(), target.to_string()],
        ))
    }
}

#[async_trait]
impl Collector for V2rayCollector {
    async fn update(&self, sink: &SampleSink) -> Result<(), CollectError> {
        let channel = match self.endpoint.connect().await {
            Ok(channel) => channel,
            Err(e) => {
                let _ = sink.send(Sample::gauge(&self.up_desc, 0.0, Vec::new()));
                return Err(CollectError::Unavailable(format!(
                    "dialing stats endpoint {}: {}",
                    self.addr, e
                )));
            }
        };
        self.collect_stats(channel, sink).await
    }
}
