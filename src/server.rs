//! Per-tenant router construction.
//!
//! [`build_tenant`] turns one config entry into a routed handler: the
//! service-specific routes, the configured middlewares (resolved by name
//! from the registry, applied in declared order), and a terminal
//! catch-all that logs and returns 404.

use axum::extract::{DefaultBodyLimit, Request};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::Router;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tower_http::timeout::TimeoutLayer;
use tracing::{error, info};

use crate::config::TenantConfig;
use crate::handlers::{gcs, kinesis, s3, sqs, ServiceHandler};

/// Request timeout applied by the `"timeout"` registry middleware.
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(15);

/// The output of one factory invocation.
pub struct BuiltTenant {
    /// The tenant's service handler, when one was constructed.
    pub handler: Option<Arc<dyn ServiceHandler>>,
    /// Fully routed, middleware-wrapped router.
    pub router: Router,
    /// False when the tenant should not be bound (empty service type, or
    /// an out-of-tree extension claimed it).
    pub should_listen: bool,
}

/// A named router wrapper resolvable from tenant config.
pub type Middleware = fn(Router) -> Router;

/// The middlewares tenants can request by name.
pub fn middleware_registry() -> HashMap<&'static str, Middleware> {
    let mut registry: HashMap<&'static str, Middleware> = HashMap::new();
    registry.insert("logging", |router| {
        router.layer(middleware::from_fn(logging_middleware))
    });
    registry.insert("metrics", |router| {
        router.layer(middleware::from_fn(crate::metrics::metrics_middleware))
    });
    registry.insert("timeout", |router| {
        router.layer(TimeoutLayer::new(REQUEST_TIMEOUT))
    });
    registry
}

/// Build a fresh handler and router for one tenant entry.
pub async fn build_tenant(key: &str, config: &TenantConfig) -> anyhow::Result<BuiltTenant> {
    let mut should_listen = true;

    let (handler, router): (Option<Arc<dyn ServiceHandler>>, Router) =
        match config.service_type.as_str() {
            "s3" => {
                let tenant = s3::S3Tenant::new(key, config).await?;
                (Some(tenant.clone()), s3::router(tenant))
            }
            "kinesis" => {
                let tenant = kinesis::KinesisTenant::new(key, config).await?;
                (Some(tenant.clone()), kinesis::router(tenant))
            }
            "sqs" => {
                let tenant = sqs::SqsTenant::new(key, config).await?;
                (Some(tenant.clone()), sqs::router(tenant))
            }
            "gcs" => {
                let tenant = gcs::GcsTenant::new(key, config).await?;
                (Some(tenant.clone()), gcs::router(tenant))
            }
            "" => {
                error!("no service type configured for port {}", config.port);
                should_listen = false;
                (None, Router::new())
            }
            other => {
                // Out-of-tree service types are the plugin loader's and
                // the enterprise hook's business; the core only refuses
                // to bind for them.
                error!(
                    "no built-in handler for service type {other:?} on port {}",
                    config.port
                );
                should_listen = false;
                (None, Router::new())
            }
        };

    let registry = middleware_registry();
    let mut router = router;
    for name in &config.middleware {
        match registry.get(name.as_str()) {
            Some(wrap) => router = wrap(router),
            None => error!("could not find middleware {name}"),
        }
    }

    let router = router
        .fallback(catch_all)
        .layer(DefaultBodyLimit::disable());

    Ok(BuiltTenant {
        handler,
        router,
        should_listen,
    })
}

/// Terminal route: log the request, answer 404.
async fn catch_all(req: Request) -> Response {
    info!(
        "catch all {} {} {:?}",
        req.method(),
        req.uri(),
        req.headers()
    );
    StatusCode::NOT_FOUND.into_response()
}

/// Registry middleware: one info line per request.
async fn logging_middleware(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let start = Instant::now();
    let response = next.run(req).await;
    info!(
        "{} {} -> {} ({:?})",
        method,
        uri,
        response.status(),
        start.elapsed()
    );
    response
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tower::ServiceExt;

    fn tenant_yaml(service_type: &str) -> TenantConfig {
        let yaml = format!(
            r#"
port: 1
service_type: {service_type}
dest_gcp:
  from_instance_metadata: true
  project: demo
middleware: [logging, nonexistent]
"#
        );
        serde_yaml::from_str(&yaml).unwrap()
    }

    #[test]
    fn test_registry_contents() {
        let registry = middleware_registry();
        assert!(registry.contains_key("logging"));
        assert!(registry.contains_key("metrics"));
        assert!(registry.contains_key("timeout"));
    }

    #[tokio::test]
    async fn test_empty_service_type_does_not_listen() {
        let built = build_tenant("t", &tenant_yaml("")).await.unwrap();
        assert!(!built.should_listen);
        assert!(built.handler.is_none());
    }

    #[tokio::test]
    async fn test_unknown_service_type_does_not_listen() {
        let built = build_tenant("t", &tenant_yaml("mystery")).await.unwrap();
        assert!(!built.should_listen);
    }

    #[tokio::test]
    async fn test_s3_tenant_builds_and_404s_unknown_routes() {
        let built = build_tenant("t", &tenant_yaml("s3")).await.unwrap();
        assert!(built.should_listen);
        assert!(built.handler.is_some());

        let response = built
            .router
            .oneshot(
                axum::http::Request::builder()
                    .method("PATCH")
                    .uri("/")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_kinesis_tenant_rejects_missing_target() {
        let built = build_tenant("t", &tenant_yaml("kinesis")).await.unwrap();
        let response = built
            .router
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/")
                    .body(axum::body::Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
