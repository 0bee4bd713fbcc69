//! HTTP surface of the proxy: `POST /api/{eventos,ingressos,cliente,emissao,webhook}`.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header, HeaderName, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde_json::Value;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use super::{forwarder::TRANSACTION_HEADER, ProxyError, ProxyRoute, Upstream};
use crate::api::metrics::record_proxy_request;

type SharedUpstream = Arc<dyn Upstream>;

pub fn router<S>(upstream: SharedUpstream) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static(TRANSACTION_HEADER),
        ]);

    Router::new()
        .route(ProxyRoute::Events.path(), post(events).options(preflight))
        .route(ProxyRoute::Tickets.path(), post(tickets).options(preflight))
        .route(ProxyRoute::Customer.path(), post(customer).options(preflight))
        .route(ProxyRoute::Issuance.path(), post(issuance).options(preflight))
        .route(ProxyRoute::Webhook.path(), post(webhook).options(preflight))
        .layer(cors)
        .with_state(upstream)
}

async fn preflight() -> StatusCode {
    StatusCode::OK
}

async fn events(
    State(upstream): State<SharedUpstream>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Response {
    forward(upstream.as_ref(), ProxyRoute::Events, payload).await
}

async fn tickets(
    State(upstream): State<SharedUpstream>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Response {
    forward(upstream.as_ref(), ProxyRoute::Tickets, payload).await
}

async fn customer(
    State(upstream): State<SharedUpstream>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Response {
    forward(upstream.as_ref(), ProxyRoute::Customer, payload).await
}

async fn issuance(
    State(upstream): State<SharedUpstream>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Response {
    forward(upstream.as_ref(), ProxyRoute::Issuance, payload).await
}

async fn webhook(
    State(upstream): State<SharedUpstream>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Response {
    forward(upstream.as_ref(), ProxyRoute::Webhook, payload).await
}

async fn forward(
    upstream: &dyn Upstream,
    route: ProxyRoute,
    payload: Result<Json<Value>, JsonRejection>,
) -> Response {
    let result = match payload {
        Ok(Json(body)) => upstream.call(route, body).await,
        Err(rejection) => Err(ProxyError::InvalidBody(rejection.body_text())),
    };

    let response = match result {
        Ok(value) => (StatusCode::OK, Json(value)).into_response(),
        Err(err) => err.into_response(),
    };

    record_proxy_request(route.name(), response.status().as_u16());

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::json;
    use std::sync::Mutex;
    use tower::ServiceExt;

    #[derive(Default)]
    struct RecordingUpstream {
        calls: Mutex<Vec<(ProxyRoute, Value)>>,
        fail_with: Option<ProxyError>,
    }

    #[async_trait]
    impl Upstream for RecordingUpstream {
        async fn call(&self, route: ProxyRoute, body: Value) -> Result<Value, ProxyError> {
            let missing = route.missing_fields(&body);
            if !missing.is_empty() {
                return Err(ProxyError::MissingFields {
                    route,
                    fields: missing,
                });
            }
            self.calls.lock().unwrap().push((route, body));
            match &self.fail_with {
                Some(err) => Err(err.clone()),
                None => Ok(json!({"ok": true})),
            }
        }
    }

    fn app(upstream: Arc<RecordingUpstream>) -> Router {
        router(upstream)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn read_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_proxy_passes_body_through() {
        let upstream = Arc::new(RecordingUpstream::default());
        let response = app(upstream.clone())
            .oneshot(post_json("/api/eventos", json!({"companyId": 3})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(read_json(response).await["ok"], true);
        let calls = upstream.calls.lock().unwrap();
        assert_eq!(calls[0].0, ProxyRoute::Events);
        assert_eq!(calls[0].1["companyId"], 3);
    }

    #[tokio::test]
    async fn test_missing_fields_envelope() {
        let upstream = Arc::new(RecordingUpstream::default());
        let response = app(upstream.clone())
            .oneshot(post_json("/api/emissao", json!({"eventId": "rock-fest"})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = read_json(response).await;
        assert_eq!(
            body["missingFields"],
            json!(["ticketId", "clientName", "clientDocument"])
        );
        assert!(upstream.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upstream_status_relayed_with_details() {
        let upstream = Arc::new(RecordingUpstream {
            fail_with: Some(ProxyError::Status {
                route: ProxyRoute::Customer,
                status: 422,
                details: "bad cpf".to_string(),
            }),
            ..Default::default()
        });
        let response = app(upstream)
            .oneshot(post_json("/api/cliente", json!({"cpf": "12345678901"})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(read_json(response).await["details"], "bad cpf");
    }

    #[tokio::test]
    async fn test_malformed_json_is_rejected() {
        let upstream = Arc::new(RecordingUpstream::default());
        let request = Request::builder()
            .method("POST")
            .uri("/api/ingressos")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let response = app(upstream).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(read_json(response).await["error"].is_string());
    }

    #[tokio::test]
    async fn test_cors_preflight() {
        let upstream = Arc::new(RecordingUpstream::default());
        let request = Request::builder()
            .method("OPTIONS")
            .uri("/api/emissao")
            .header("origin", "http://pos.local")
            .header("access-control-request-method", "POST")
            .header("access-control-request-headers", "x-transaction-id")
            .body(Body::empty())
            .unwrap();
        let response = app(upstream).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["access-control-allow-origin"],
            "*"
        );
        let allowed = response.headers()["access-control-allow-headers"]
            .to_str()
            .unwrap()
            .to_ascii_lowercase();
        assert!(allowed.contains("x-transaction-id"));
    }
}
