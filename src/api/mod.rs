pub mod auth;
pub mod error;
pub mod metrics;
mod pdv;
pub mod validation;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::proxy;
use crate::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    // Session management (public)
    let auth_routes = Router::new()
        .route("/login", post(auth::login))
        .route("/refresh", post(auth::refresh))
        .route("/logout", post(auth::logout));

    // Point of sale, requires a session cookie
    let pdv_routes = Router::new()
        .route("/tenant", get(pdv::get_tenant))
        .route("/tenant/refresh", post(pdv::refresh_tenant))
        .route("/events", get(pdv::list_events))
        .route("/events/:event_id/tickets", get(pdv::list_ticket_types))
        .route("/customers/:document", get(pdv::lookup_customer))
        .route("/sales", post(pdv::create_sale))
        .route("/sales/current", get(pdv::current_sale))
        .route("/sales/new", post(pdv::new_sale))
        .route("/sales/current/pdf", post(pdv::open_pdf))
        .layer(middleware::from_fn(auth::require_session));

    // Both scoped to the calling terminal
    let operator_routes = Router::new()
        .nest("/api/auth", auth_routes)
        .nest("/api/pdv", pdv_routes)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::terminal_middleware,
        ));

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics::metrics_endpoint))
        .merge(operator_routes)
        // Same-origin proxy to the ticketing platform
        .merge(proxy::router(state.upstream.clone()))
        .layer(middleware::from_fn(metrics::metrics_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}
