//! The admin HTTP server: liveness and readiness checks for the orchestrator
//! and the prometheus scrape endpoint.

use std::time::Instant;

use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::IntoResponse,
    routing::get, Router,
};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

use crate::health::HealthRegistry;
use crate::metrics_consts::{
    ADMIN_HTTP_REQUESTS, ADMIN_HTTP_REQUEST_DURATION, SINK_FLUSH_BATCH_SIZE,
    SINK_FLUSH_DURATION_MS,
};

const FLUSH_DURATION_MS_BUCKETS: &[f64] = &[
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0, 30000.0,
];

const FLUSH_BATCH_SIZE_BUCKETS: &[f64] = &[
    1.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0,
];

const SECONDS_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
];

pub async fn index() -> &'static str {
    "meter sink"
}

/// Health check routes, without the metrics endpoint. `/_liveness` fails once the
/// ingestion loop stopped polling; `/_readiness` additionally fails before it
/// polled for the first time.
pub fn admin_routes(liveness: HealthRegistry) -> Router {
    let readiness = liveness.clone();
    Router::new()
        .route("/", get(index))
        .route(
            "/_liveness",
            get(move || std::future::ready(liveness.get_status())),
        )
        .route(
            "/_readiness",
            get(move || std::future::ready(readiness.get_status())),
        )
}

/// Install the prometheus recorder, expose it on `/metrics` and record
/// request metrics for every route. Call it after every other route was added.
pub fn with_metrics(router: Router) -> Result<Router, BuildError> {
    let recorder_handle = setup_metrics_recorder()?;

    Ok(router
        .route(
            "/metrics",
            get(move || std::future::ready(recorder_handle.render())),
        )
        .layer(axum::middleware::from_fn(track_requests)))
}

/// Flush histograms are in milliseconds and messages, everything else in seconds.
pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new()
        .set_buckets(SECONDS_BUCKETS)?
        .set_buckets_for_metric(
            Matcher::Full(SINK_FLUSH_DURATION_MS.to_string()),
            FLUSH_DURATION_MS_BUCKETS,
        )?
        .set_buckets_for_metric(
            Matcher::Full(SINK_FLUSH_BATCH_SIZE.to_string()),
            FLUSH_BATCH_SIZE_BUCKETS,
        )?
        .install_recorder()
}

/// Bind `bind` and serve `router` until the server fails.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

async fn track_requests(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = match req.extensions().get::<MatchedPath>() {
        Some(matched) => matched.as_str().to_owned(),
        None => req.uri().path().to_owned(),
    };
    let method = req.method().to_string();

    let response = next.run(req).await;

    let labels = [
        ("method", method),
        ("path", path),
        ("status", response.status().as_u16().to_string()),
    ];
    metrics::counter!(ADMIN_HTTP_REQUESTS, &labels).increment(1);
    metrics::histogram!(ADMIN_HTTP_REQUEST_DURATION, &labels)
        .record(start.elapsed().as_secs_f64());

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::http::StatusCode;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn get_status(router: Router, uri: &str) -> (StatusCode, String) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_index() {
        let router = admin_routes(HealthRegistry::new("liveness"));
        let (status, body) = get_status(router, "/").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "meter sink");
    }

    #[tokio::test]
    async fn test_health_checks_follow_the_ingestion_loop() {
        let liveness = HealthRegistry::new("liveness");
        let router = admin_routes(liveness.clone());
        let sink = liveness.register("sink", Duration::from_secs(30));

        let (status, _) = get_status(router.clone(), "/_readiness").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

        sink.report_healthy();
        let (status, _) = get_status(router.clone(), "/_readiness").await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = get_status(router.clone(), "/_liveness").await;
        assert_eq!(status, StatusCode::OK);

        sink.report_status(crate::health::ComponentStatus::Unhealthy);
        let (status, body) = get_status(router, "/_liveness").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.contains("Unhealthy"), "{body}");
    }
}
