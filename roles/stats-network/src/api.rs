use bytes::Bytes;
use chrono::Utc;
use http_body_util::Full;
use hyper::{
    body::Incoming,
    header::{HeaderValue, CONTENT_TYPE},
    server::conn::http1,
    service::service_fn,
    Method, Request, Response, StatusCode,
};
use hyper_util::rt::TokioIo;
use serde_json::{json, Value};
use std::{convert::Infallible, sync::Arc};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

use crate::engine::AggregationEngine;

const DEFAULT_LOG_LIMIT: usize = 100;
const MAX_LOG_LIMIT: usize = 1000;

pub async fn run_http_server(
    address: String,
    engine: Arc<AggregationEngine>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(&address).await?;
    info!("HTTP API listening on http://{}", address);

    loop {
        let (stream, _) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("HTTP API shutting down");
                    return Ok(());
                }
                continue;
            }
        };
        let io = TokioIo::new(stream);
        let engine = engine.clone();

        tokio::task::spawn(async move {
            let service = service_fn(move |req| {
                let engine = engine.clone();
                async move { handle_request(req, engine).await }
            });

            if let Err(err) = http1::Builder::new()
                .keep_alive(true)
                .serve_connection(io, service)
                .await
            {
                error!("Error serving connection: {:?}", err);
            }
        });
    }
}

async fn handle_request(
    req: Request<Incoming>,
    engine: Arc<AggregationEngine>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    Ok(route(req.method(), req.uri().path(), req.uri().query(), &engine).await)
}

/// Dispatch one request to its handler.
pub async fn route(
    method: &Method,
    path: &str,
    query: Option<&str>,
    engine: &Arc<AggregationEngine>,
) -> Response<Full<Bytes>> {
    match (method, path) {
        (&Method::GET, "/health") => serve_health(engine).await,
        (&Method::GET, "/api/network-stats") => serve_network_stats(engine).await,
        (&Method::GET, "/api/network-stats/logs") => {
            serve_logs(engine, parse_limit(query.unwrap_or(""))).await
        }
        (&Method::POST, "/api/network-stats/update") => trigger_update(engine.clone()).await,
        _ => json_response(
            StatusCode::NOT_FOUND,
            json!({ "status": "error", "message": "Not Found" }),
        ),
    }
}

fn json_response(status: StatusCode, body: Value) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn error_response(status: StatusCode, message: impl std::fmt::Display) -> Response<Full<Bytes>> {
    json_response(
        status,
        json!({ "status": "error", "message": message.to_string() }),
    )
}

async fn serve_health(engine: &AggregationEngine) -> Response<Full<Bytes>> {
    match engine.repository().ping().await {
        Ok(()) => json_response(StatusCode::OK, json!({ "status": "ok" })),
        Err(e) => {
            error!("Health check failed: {}", e);
            error_response(StatusCode::SERVICE_UNAVAILABLE, e)
        }
    }
}

async fn serve_network_stats(engine: &AggregationEngine) -> Response<Full<Bytes>> {
    match engine.get_current_and_average().await {
        Ok(stats) => json_response(
            StatusCode::OK,
            json!({
                "status": "success",
                "data": stats,
                "timestamp": Utc::now().to_rfc3339(),
            }),
        ),
        Err(e) => {
            error!("Error reading network stats: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
    }
}

async fn serve_logs(engine: &AggregationEngine, limit: usize) -> Response<Full<Bytes>> {
    match engine.get_recent_logs(limit).await {
        Ok(logs) => json_response(StatusCode::OK, json!({ "status": "success", "logs": logs })),
        Err(e) => {
            error!("Error reading stats logs: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
    }
}

/// The cycle runs on its own task so a dropped connection cannot cancel it mid-persist.
async fn trigger_update(engine: Arc<AggregationEngine>) -> Response<Full<Bytes>> {
    info!("Manual stats update requested");
    let cycle = tokio::spawn(async move { engine.run_cycle().await });
    match cycle.await {
        Ok(Ok(result)) => json_response(
            StatusCode::OK,
            json!({ "status": "success", "data": result }),
        ),
        Ok(Err(e)) => {
            error!("Manual stats update failed: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
        Err(e) => {
            error!("Manual stats update task failed: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
    }
}

/// Read `limit` from the query string, falling back to the default on absent or bad input.
fn parse_limit(query: &str) -> usize {
    query
        .split('&')
        .filter_map(|param| param.split_once('='))
        .find(|(key, _)| *key == "limit")
        .and_then(|(_, value)| value.parse::<usize>().ok())
        .map(|limit| limit.min(MAX_LOG_LIMIT))
        .unwrap_or(DEFAULT_LOG_LIMIT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineSettings;
    use crate::sources::{FetchError, HashrateSource};
    use hashrate_stats::{RawReading, SourceId, SqliteStorage};
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tempfile::TempDir;

    struct FixedPool;

    #[async_trait::async_trait]
    impl HashrateSource for FixedPool {
        fn source_id(&self) -> SourceId {
            SourceId::Apool
        }

        async fn fetch(&self) -> Result<RawReading, FetchError> {
            Ok(RawReading {
                source_id: SourceId::Apool,
                raw_value: Some(300.0),
                accepted_units: Some(6.0),
                total_units: None,
                share_units: Some(1200.0),
            })
        }
    }

    async fn engine_with(
        temp_dir: &TempDir,
        sources: Vec<Arc<dyn HashrateSource>>,
    ) -> Arc<AggregationEngine> {
        let storage = SqliteStorage::new(temp_dir.path().join("api.db")).await.unwrap();
        Arc::new(AggregationEngine::new(
            sources,
            Arc::new(storage),
            EngineSettings {
                min_record_interval: Duration::ZERO,
                ..EngineSettings::default()
            },
        ))
    }

    async fn engine(temp_dir: &TempDir) -> Arc<AggregationEngine> {
        engine_with(temp_dir, Vec::new()).await
    }

    async fn body_json(response: Response<Full<Bytes>>) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_parse_limit() {
        assert_eq!(parse_limit(""), DEFAULT_LOG_LIMIT);
        assert_eq!(parse_limit("limit=5"), 5);
        assert_eq!(parse_limit("foo=bar&limit=7"), 7);
        assert_eq!(parse_limit("limit=abc"), DEFAULT_LOG_LIMIT);
        assert_eq!(parse_limit("limit=999999"), MAX_LOG_LIMIT);
    }

    #[tokio::test]
    async fn test_health() {
        let temp_dir = TempDir::new().unwrap();
        let engine = engine(&temp_dir).await;

        let response = route(&Method::GET, "/health", None, &engine).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({ "status": "ok" }));
    }

    #[tokio::test]
    async fn test_network_stats_before_any_cycle() {
        let temp_dir = TempDir::new().unwrap();
        let engine = engine(&temp_dir).await;

        let response = route(&Method::GET, "/api/network-stats", None, &engine).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[CONTENT_TYPE],
            HeaderValue::from_static("application/json")
        );

        let body = body_json(response).await;
        assert_eq!(body["status"], "success");
        assert_eq!(body["data"]["current"]["network"], 0.0);
        assert_eq!(body["data"]["average"]["average_apool"], 0.0);
        assert_eq!(body["data"]["average"]["record_count"], 0);
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_update_then_logs() {
        let temp_dir = TempDir::new().unwrap();
        let engine = engine(&temp_dir).await;

        let response = route(&Method::POST, "/api/network-stats/update", None, &engine).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "success");
        assert!(body["data"]["outcome"]["recorded"].is_object());

        let response =
            route(&Method::GET, "/api/network-stats/logs", Some("limit=1"), &engine).await;
        let body = body_json(response).await;
        assert_eq!(body["status"], "success");
        let logs = body["logs"].as_array().unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0]["event_type"], "success");
    }

    #[tokio::test]
    async fn test_update_reports_pool_detail() {
        let temp_dir = TempDir::new().unwrap();
        let pool: Arc<dyn HashrateSource> = Arc::new(FixedPool);
        let engine = engine_with(&temp_dir, vec![pool]).await;

        let response = route(&Method::POST, "/api/network-stats/update", None, &engine).await;
        assert_eq!(response.status(), StatusCode::OK);

        // Without a network total the pool cannot be corrected
        let body = body_json(response).await;
        let detail = &body["data"]["readings"]["apool"];
        assert_eq!(detail["raw_value"], 300.0);
        assert_eq!(detail["accepted_units"], 6.0);
        assert_eq!(detail["share_units"], 1200.0);
        assert_eq!(detail["shares_per_solution"], 200.0);
        assert_eq!(detail["corrected_hashrate"], 0.0);
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let temp_dir = TempDir::new().unwrap();
        let engine = engine(&temp_dir).await;

        let response = route(&Method::GET, "/api/unknown", None, &engine).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = route(&Method::GET, "/api/network-stats/update", None, &engine).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
