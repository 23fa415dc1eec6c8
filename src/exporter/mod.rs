//! Prometheus text exposition over HTTP.
//!
//! Each request on the telemetry path triggers one scrape of the registry;
//! the gathered samples are grouped into metric families and rendered with
//! the prometheus text encoder. Nothing is retained between requests.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use prometheus::{CounterVec, Encoder, GaugeVec, Opts, TextEncoder};
use tracing::{info, warn};

use crate::collector::{MetricKind, Registry, Sample};

/// Renders samples as Prometheus text format.
///
/// Samples are grouped by descriptor into one family per metric name. A
/// sample whose label values do not match its descriptor's arity is
/// dropped with a warning rather than failing the scrape.
pub fn encode(samples: &[Sample]) -> Result<String, prometheus::Error> {
    let registry = prometheus::Registry::new();

    let mut families: BTreeMap<&str, Vec<&Sample>> = BTreeMap::new();
    for sample in samples {
        families.entry(sample.desc.fq_name()).or_default().push(sample);
    }

    for group in families.values() {
        let desc = &group[0].desc;
        let opts = Opts::new(desc.fq_name(), desc.help());
        match group[0].kind {
            MetricKind::Gauge => {
                let vec = GaugeVec::new(opts, desc.label_names())?;
                registry.register(Box::new(vec.clone()))?;
                for sample in group {
                    let labels: Vec<&str> =
                        sample.label_values.iter().map(String::as_str).collect();
                    match vec.get_metric_with_label_values(&labels) {
                        Ok(gauge) => gauge.set(sample.value),
                        Err(e) => warn!(
                            metric = desc.fq_name(),
                            error = %e,
                            "dropping sample with mismatched labels"
                        ),
                    }
                }
            }
            MetricKind::Counter => {
                let vec = CounterVec::new(opts, desc.label_names())?;
                registry.register(Box::new(vec.clone()))?;
                for sample in group {
                    let labels: Vec<&str> =
                        sample.label_values.iter().map(String::as_str).collect();
                    match vec.get_metric_with_label_values(&labels) {
                        Ok(counter) => counter.inc_by(sample.value),
                        Err(e) => warn!(
                            metric = desc.fq_name(),
                            error = %e,
                            "dropping sample with mismatched labels"
                        ),
                    }
                }
            }
        }
    }

    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

#[derive(Clone)]
struct AppState {
    registry: Arc<Registry>,
    telemetry_path: String,
}

/// Builds the exposition router: a landing page on `/` and the metrics
/// handler on the telemetry path.
pub fn router(registry: Arc<Registry>, telemetry_path: &str) -> Router {
    let state = AppState {
        registry,
        telemetry_path: telemetry_path.to_string(),
    };
    Router::new()
        .route("/", get(landing))
        .route(telemetry_path, get(metrics))
        .with_state(state)
}

/// Binds the listener and serves until ctrl-c.
pub async fn serve(
    registry: Arc<Registry>,
    listen: SocketAddr,
    telemetry_path: &str,
) -> std::io::Result<()> {
    let app = router(registry, telemetry_path);
    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!(address = %listen, path = telemetry_path, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutting down");
}

async fn metrics(State(state): State<AppState>) -> Response {
    let samples = state.registry.scrape().await;
    match encode(&samples) {
        Ok(body) => ([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body).into_response(),
        Err(e) => {
            warn!(error = %e, "failed to encode samples");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("encoding metrics: {}", e),
            )
                .into_response()
        }
    }
}

async fn landing(State(state): State<AppState>) -> Html<String> {
    Html(format!(
        "<html>\n\
         <head><title>Traffic Exporter</title></head>\n\
         <body>\n\
         <h1>Traffic Exporter</h1>\n\
         <p><a href=\"{}\">Metrics</a></p>\n\
         </body>\n\
         </html>\n",
        state.telemetry_path
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::Descriptor;

    #[test]
    fn test_encode_gauge_family() {
        let desc = Descriptor::new("iptables", "download_bytes", "Download bytes.", &[
            "chain", "rule",
        ]);
        let samples = vec![
            Sample::gauge(&desc, 1000.0, vec!["FORWARD".to_string(), "web".to_string()]),
            Sample::gauge(&desc, 250.0, vec!["INPUT".to_string(), "dns".to_string()]),
        ];

        let text = encode(&samples).unwrap();
        assert!(text.contains("# HELP traffic_iptables_download_bytes Download bytes."));
        assert!(text.contains("# TYPE traffic_iptables_download_bytes gauge"));
        assert!(
            text.contains("traffic_iptables_download_bytes{chain=\"FORWARD\",rule=\"web\"} 1000")
        );
        assert!(text.contains("traffic_iptables_download_bytes{chain=\"INPUT\",rule=\"dns\"} 250"));
    }

    #[test]
    fn test_encode_unlabeled_gauge() {
        let desc = Descriptor::new("v2ray", "up", "Liveness.", &[]);
        let text = encode(&[Sample::gauge(&desc, 1.0, Vec::new())]).unwrap();
        assert!(text.contains("traffic_v2ray_up 1"));
    }

    #[test]
    fn test_encode_drops_mismatched_arity() {
        let desc = Descriptor::new("v2ray", "download_bytes_total", "Bytes.", &[
            "dimension",
            "target",
        ]);
        let good = Sample::gauge(&desc, 5.0, vec!["inbound".to_string(), "socks".to_string()]);
        // Built directly to bypass the constructor's arity check.
        let bad = Sample {
            desc: good.desc.clone(),
            kind: MetricKind::Gauge,
            value: 9.0,
            label_values: vec!["inbound".to_string()],
        };

        let text = encode(&[good, bad]).unwrap();
        assert!(text.contains("{dimension=\"inbound\",target=\"socks\"} 5"));
        assert!(!text.contains(" 9"));
    }

    #[test]
    fn test_encode_empty() {
        assert_eq!(encode(&[]).unwrap(), "");
    }
}
