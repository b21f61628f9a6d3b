//! Status HTTP server
//!
//! Exposes the metrics snapshot as JSON for monitoring tools.

use axum::{extract::State, routing::get, Json, Router};
use std::net::SocketAddr;
use thiserror::Error;
use tracing::info;

use crate::metrics::{MetricsSnapshot, SharedMetrics};

/// Errors that can occur when running the metrics server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid bind address '{0}'")]
    InvalidAddress(String),

    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),
}

/// Handler for GET /metrics
async fn get_metrics(State(metrics): State<SharedMetrics>) -> Json<MetricsSnapshot> {
    let snapshot = metrics.read().await.clone();
    Json(snapshot)
}

/// Creates the axum Router with metrics endpoint
pub fn create_metrics_router(metrics: SharedMetrics) -> Router {
    Router::new()
        .route("/metrics", get(get_metrics))
        .with_state(metrics)
}

/// Runs the metrics HTTP server on `bind` (e.g. `127.0.0.1:7878`)
pub async fn run_metrics_server(metrics: SharedMetrics, bind: &str) -> Result<(), ServerError> {
    let addr: SocketAddr = bind
        .parse()
        .map_err(|_| ServerError::InvalidAddress(bind.to_string()))?;
    let app = create_metrics_router(metrics);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Serving metrics on http://{}/metrics", addr);
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{new_shared_metrics, JobMetrics, SystemMetrics};
    use crate::rate_control::RateControlMode;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    async fn fetch(metrics: SharedMetrics) -> (StatusCode, Option<String>, Vec<u8>) {
        let app = create_metrics_router(metrics);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let status = response.status();
        let content_type = response
            .headers()
            .get("content-type")
            .map(|v| v.to_str().unwrap().to_string());
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, content_type, body.to_vec())
    }

    #[tokio::test]
    async fn test_get_metrics_returns_json() {
        let metrics = new_shared_metrics();
        {
            let mut snapshot = metrics.write().await;
            snapshot.timestamp_unix_ms = 1701388800000;
            snapshot.queue_len = 5;
            snapshot.running_jobs = 1;
            snapshot.completed_jobs = 42;
            snapshot.failed_jobs = 2;
            snapshot.total_bytes_written = 2147483648;
            snapshot.system = SystemMetrics {
                cpu_usage_percent: 85.2,
                mem_usage_percent: 42.1,
                load_avg_1: 7.5,
                load_avg_5: 6.8,
                load_avg_15: 5.2,
            };
            snapshot.jobs.push(JobMetrics {
                id: "job-001".to_string(),
                input_path: "/media/video.mkv".to_string(),
                status: "processing".to_string(),
                attempts: 1,
                size_in_bytes_before: 5368709120,
                file_percent: 45,
                total_duration_secs: 7200.0,
                duration_is_estimated: true,
                rate_control_mode: Some(RateControlMode::Quality),
                current_chunk: 1,
                total_chunks: 2,
                chunk_percent: 90,
                est_remaining_secs: Some(3600),
                output_bytes_written: 2147483648,
                ..Default::default()
            });
        }

        let (status, content_type, body) = fetch(metrics).await;
        assert_eq!(status, StatusCode::OK);
        assert!(content_type.unwrap().contains("application/json"));

        let snapshot: MetricsSnapshot =
            serde_json::from_slice(&body).expect("should deserialize to MetricsSnapshot");
        assert_eq!(snapshot.timestamp_unix_ms, 1701388800000);
        assert_eq!(snapshot.queue_len, 5);
        assert_eq!(snapshot.completed_jobs, 42);
        assert_eq!(snapshot.jobs.len(), 1);
        assert_eq!(snapshot.jobs[0].id, "job-001");
        assert_eq!(snapshot.jobs[0].rate_control_mode, Some(RateControlMode::Quality));
        assert!(snapshot.jobs[0].duration_is_estimated);
    }

    #[tokio::test]
    async fn test_get_metrics_empty_snapshot() {
        let (status, _, body) = fetch(new_shared_metrics()).await;
        assert_eq!(status, StatusCode::OK);

        let snapshot: MetricsSnapshot = serde_json::from_slice(&body).unwrap();
        assert_eq!(snapshot.timestamp_unix_ms, 0);
        assert!(snapshot.jobs.is_empty());
        assert_eq!(snapshot.running_jobs, 0);
    }

    #[tokio::test]
    async fn test_metrics_json_field_names() {
        let (_, _, body) = fetch(new_shared_metrics()).await;
        let json_str = String::from_utf8(body).unwrap();

        for field in [
            "timestamp_unix_ms",
            "jobs",
            "system",
            "cpu_usage_percent",
            "mem_usage_percent",
            "load_avg_1",
            "queue_len",
            "running_jobs",
            "completed_jobs",
            "failed_jobs",
            "cancelled_jobs",
            "total_bytes_written",
        ] {
            assert!(json_str.contains(field), "missing {}", field);
        }
    }

    #[tokio::test]
    async fn test_invalid_bind_address() {
        let err = run_metrics_server(new_shared_metrics(), "not-an-address")
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::InvalidAddress(_)));
    }
}
