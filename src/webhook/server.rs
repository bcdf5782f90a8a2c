//! Conversion Webhook Server
//!
//! Serves `POST /convert` for the VCDCluster and VCDMachine CRDs. The API
//! server requires HTTPS for webhooks, so TLS is used whenever a
//! certificate and key are configured; plain HTTP is for local testing.

use std::net::SocketAddr;

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use axum::{
    extract::Request,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use axum_server::tls_rustls::RustlsConfig;
use kube::core::conversion::{ConversionRequest, ConversionResponse, ConversionReview};
use kube::core::Status;
use opentelemetry::{global, propagation::Extractor};
use serde_json::Value;
use tracing::{error, info, instrument, warn};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::crd::convert_object;
use crate::error::{Error, Result};

struct HeaderExtractor<'a>(&'a HeaderMap);

impl<'a> Extractor for HeaderExtractor<'a> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v: &HeaderValue| v.to_str().ok())
    }
    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(|k: &HeaderName| k.as_str()).collect()
    }
}

async fn extract_trace_context(request: Request, next: Next) -> Response {
    let parent_cx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderExtractor(request.headers()))
    });
    tracing::Span::current().set_parent(parent_cx);
    next.run(request).await
}

/// TLS configuration for the webhook server
#[derive(Clone, Debug)]
pub struct TlsConfig {
    pub cert_path: String,
    pub key_path: String,
}

pub struct WebhookServer {
    tls_config: Option<TlsConfig>,
}

impl Default for WebhookServer {
    fn default() -> Self {
        Self::new()
    }
}

impl WebhookServer {
    pub fn new() -> Self {
        Self { tls_config: None }
    }

    /// Configure TLS for the webhook server
    pub fn with_tls(mut self, cert_path: String, key_path: String) -> Self {
        self.tls_config = Some(TlsConfig {
            cert_path,
            key_path,
        });
        self
    }

    /// Start the webhook server
    pub async fn start(self, addr: SocketAddr) -> Result<()> {
        let app = router();

        match self.tls_config {
            Some(tls) => {
                info!("Starting conversion webhook on {} (TLS)", addr);
                // Both rustls backends can end up linked; pick one explicitly
                let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
                let config = RustlsConfig::from_pem_file(&tls.cert_path, &tls.key_path)
                    .await
                    .map_err(|e| {
                        Error::ConfigError(format!(
                            "Failed to load webhook certificate {}: {e}",
                            tls.cert_path
                        ))
                    })?;
                axum_server::bind_rustls(addr, config)
                    .serve(app.into_make_service())
                    .await
                    .map_err(|e| Error::ConfigError(format!("Webhook server error: {e}")))?;
            }
            None => {
                warn!(
                    "Starting conversion webhook on {} without TLS; the API server will not call it",
                    addr
                );
                let listener = tokio::net::TcpListener::bind(addr)
                    .await
                    .map_err(|e| Error::ConfigError(format!("Failed to bind to {addr}: {e}")))?;
                axum::serve(listener, app)
                    .await
                    .map_err(|e| Error::ConfigError(format!("Webhook server error: {e}")))?;
            }
        }

        Ok(())
    }
}

pub fn router() -> Router {
    Router::new()
        .route("/convert", post(convert_handler))
        .route("/healthz", get(|| async { "ok" }))
        .layer(middleware::from_fn(extract_trace_context))
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

#[instrument(skip(review))]
async fn convert_handler(Json(review): Json<ConversionReview>) -> Json<ConversionReview> {
    Json(convert_review(review))
}

fn describe(object: &Value) -> String {
    let field = |path: &str| {
        object
            .pointer(path)
            .and_then(Value::as_str)
            .unwrap_or("<unknown>")
            .to_string()
    };
    format!(
        "{} {}/{}",
        field("/kind"),
        field("/metadata/namespace"),
        field("/metadata/name")
    )
}

/// Convert every object in the review, or fail the whole review
///
/// The API server treats a conversion response as all-or-nothing, so the
/// first object that cannot be converted fails the request and is named
/// in the status message.
pub fn convert_review(review: ConversionReview) -> ConversionReview {
    let request = match ConversionRequest::from_review(review) {
        Ok(request) => request,
        Err(e) => {
            error!("Invalid conversion review: {}", e);
            return ConversionResponse::invalid(Status::failure(
                &format!("invalid ConversionReview: {e}"),
                "InvalidRequest",
            ))
            .into_review();
        }
    };

    let desired = request.desired_api_version.clone();
    let mut converted = Vec::with_capacity(request.objects.len());
    for object in &request.objects {
        match convert_object(object.clone(), &desired) {
            Ok(value) => converted.push(value),
            Err(e) => {
                let target = describe(object);
                warn!(object = %target, desired = %desired, "Conversion failed: {}", e);
                return ConversionResponse::for_request(request)
                    .failure(Status::failure(
                        &format!("failed to convert {target} to {desired}: {e}"),
                        "ConversionFailed",
                    ))
                    .into_review();
            }
        }
    }

    info!(count = converted.len(), desired = %desired, "Converted objects");
    ConversionResponse::for_request(request)
        .success(converted)
        .into_review()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn review(desired: &str, objects: Vec<Value>) -> ConversionReview {
        serde_json::from_value(json!({
            "apiVersion": "apiextensions.k8s.io/v1",
            "kind": "ConversionReview",
            "request": {
                "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
                "desiredAPIVersion": desired,
                "objects": objects,
            }
        }))
        .unwrap()
    }

    fn alpha_cluster(name: &str) -> Value {
        json!({
            "apiVersion": "infrastructure.cluster.x-k8s.io/v1alpha1",
            "kind": "VCDCluster",
            "metadata": { "name": name, "namespace": "tenant-a" },
            "spec": {
                "org": "acme",
                "ovdc": "acme-vdc",
                "edgeGateway": "edge-01",
                "networkCidr": "10.10.0.0/24",
                "useAsManagementCluster": true
            }
        })
    }

    fn response_of(review: ConversionReview) -> Value {
        serde_json::to_value(review).unwrap()["response"].clone()
    }

    #[test]
    fn test_converts_to_hub() {
        let response = response_of(convert_review(review(
            "infrastructure.cluster.x-k8s.io/v1beta1",
            vec![alpha_cluster("c1")],
        )));

        assert_eq!(response["uid"], "705ab4f5-6393-11e8-b7cc-42010a800002");
        assert_eq!(response["result"]["status"], "Success");
        let converted = &response["convertedObjects"][0];
        assert_eq!(converted["apiVersion"], "infrastructure.cluster.x-k8s.io/v1beta1");
        assert_eq!(converted["spec"]["network"]["cidr"], "10.10.0.0/24");
    }

    #[test]
    fn test_failure_names_the_object() {
        let mut broken = alpha_cluster("c2");
        broken["kind"] = json!("VCDWidget");
        let response = response_of(convert_review(review(
            "infrastructure.cluster.x-k8s.io/v1beta1",
            vec![alpha_cluster("c1"), broken],
        )));

        assert_eq!(response["result"]["status"], "Failure");
        let message = response["result"]["message"].as_str().unwrap();
        assert!(message.contains("tenant-a/c2"));
        assert!(response["convertedObjects"]
            .as_array()
            .map(|a| a.is_empty())
            .unwrap_or(true));
    }

    #[test]
    fn test_review_without_request_is_invalid() {
        let review: ConversionReview = serde_json::from_value(json!({
            "apiVersion": "apiextensions.k8s.io/v1",
            "kind": "ConversionReview"
        }))
        .unwrap();
        let response = response_of(convert_review(review));
        assert_eq!(response["result"]["status"], "Failure");
    }
}
