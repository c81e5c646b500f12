use actix_web::{web, App, HttpResponse, HttpServer, Responder};
use prometheus::{Encoder, Registry, TextEncoder};
use std::sync::Arc;

use crate::runtime::{HealthRegistry, HealthStatus};

/// Serve `/metrics` and `/health` until the process exits.
/// Runs on its own thread with its own actix system.
pub async fn start_metrics_server(
    registry: Registry,
    health: Arc<HealthRegistry>,
    port: u16,
) -> std::io::Result<()> {
    tracing::info!(port, "Starting metrics server on http://0.0.0.0:{}/metrics", port);

    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(registry.clone()))
            .app_data(web::Data::new(health.clone()))
            .route("/metrics", web::get().to(metrics_handler))
            .route("/health", web::get().to(health_handler))
    })
    .workers(1)
    .bind(("0.0.0.0", port))?
    .run()
    .await
}

async fn metrics_handler(registry: web::Data<Registry>) -> impl Responder {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return HttpResponse::InternalServerError().finish();
    }

    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(buffer)
}

async fn health_handler(health: web::Data<Arc<HealthRegistry>>) -> impl Responder {
    let snapshot = health.snapshot();

    match snapshot.overall_status {
        HealthStatus::Unhealthy(_) => HttpResponse::ServiceUnavailable().json(snapshot),
        HealthStatus::Healthy | HealthStatus::Degraded(_) => HttpResponse::Ok().json(snapshot),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{http::StatusCode, test};

    #[actix_web::test]
    async fn test_health_reports_unhealthy_as_503() {
        let health = Arc::new(HealthRegistry::new());
        health.update(
            "event_channel",
            HealthStatus::Unhealthy("circuit breaker open".to_string()),
            None,
        );

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(health.clone()))
                .route("/health", web::get().to(health_handler)),
        )
        .await;
        let response = test::call_service(&app, test::TestRequest::get().uri("/health").to_request()).await;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[actix_web::test]
    async fn test_metrics_endpoint_serves_text_format() {
        let metrics = crate::metrics::LifecycleMetrics::new().unwrap();
        metrics.record_sweep(true, 2);

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(metrics.registry().clone()))
                .route("/metrics", web::get().to(metrics_handler)),
        )
        .await;
        let body = test::call_and_read_body(&app, test::TestRequest::get().uri("/metrics").to_request()).await;

        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("orders_expired_total 2"));
    }
}
