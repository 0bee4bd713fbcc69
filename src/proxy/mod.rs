//! Same-origin proxy to the ticketing platform.
//!
//! Each route validates its required fields, forwards the JSON body to the
//! configured upstream URL and relays failures in a small `{error, details}`
//! envelope. The catalog and issuance modules go through the same
//! [`Upstream`] seam as the HTTP routes, so both paths share validation and
//! the issuance remap.

mod forwarder;
mod routes;

pub use forwarder::Forwarder;
pub use routes::router;

use async_trait::async_trait;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};

use crate::config::UpstreamConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyRoute {
    Events,
    Tickets,
    Customer,
    Issuance,
    Webhook,
}

impl ProxyRoute {
    pub const ALL: [ProxyRoute; 5] = [
        ProxyRoute::Events,
        ProxyRoute::Tickets,
        ProxyRoute::Customer,
        ProxyRoute::Issuance,
        ProxyRoute::Webhook,
    ];

    pub fn path(&self) -> &'static str {
        match self {
            ProxyRoute::Events => "/api/eventos",
            ProxyRoute::Tickets => "/api/ingressos",
            ProxyRoute::Customer => "/api/cliente",
            ProxyRoute::Issuance => "/api/emissao",
            ProxyRoute::Webhook => "/api/webhook",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ProxyRoute::Events => "events",
            ProxyRoute::Tickets => "tickets",
            ProxyRoute::Customer => "customer",
            ProxyRoute::Issuance => "issuance",
            ProxyRoute::Webhook => "webhook",
        }
    }

    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            ProxyRoute::Events => &["companyId"],
            ProxyRoute::Tickets => &["eventId", "companyId"],
            ProxyRoute::Customer => &["cpf"],
            ProxyRoute::Issuance => &["eventId", "ticketId", "clientName", "clientDocument"],
            ProxyRoute::Webhook => &["companyId"],
        }
    }

    pub fn upstream_url<'a>(&self, config: &'a UpstreamConfig) -> Option<&'a str> {
        let url = match self {
            ProxyRoute::Events => &config.events_url,
            ProxyRoute::Tickets => &config.tickets_url,
            ProxyRoute::Customer => &config.customer_url,
            ProxyRoute::Issuance => &config.issuance_url,
            ProxyRoute::Webhook => &config.webhook_url,
        };
        url.as_deref().filter(|u| !u.trim().is_empty())
    }

    /// Required fields that are absent or falsy (`null`, `false`, `0`, `""`).
    pub fn missing_fields(&self, body: &Value) -> Vec<&'static str> {
        self.required_fields()
            .iter()
            .copied()
            .filter(|field| is_blank(body.get(*field)))
            .collect()
    }

    fn invalid_message(&self) -> &'static str {
        match self {
            ProxyRoute::Events => "Invalid parameters: companyId is required",
            ProxyRoute::Tickets => "Invalid parameters: eventId and companyId are required",
            ProxyRoute::Customer => "Invalid parameter: cpf is required",
            ProxyRoute::Issuance => "Invalid parameters for ticket issuance",
            ProxyRoute::Webhook => "Invalid parameters: companyId is required",
        }
    }

    fn failure_message(&self) -> &'static str {
        match self {
            ProxyRoute::Issuance => "Ticket issuance failed",
            ProxyRoute::Webhook => "Ticket webhook failed",
            _ => "External service request failed",
        }
    }
}

impl std::fmt::Display for ProxyRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) | Some(Value::Bool(false)) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Number(n)) => n.as_f64() == Some(0.0),
        Some(_) => false,
    }
}

/// Failure of a proxied call.
///
/// `Display` renders `"<status> - <envelope json>"`, the same text a browser
/// client would build from the HTTP response, so callers can recover the
/// structured envelope from the message.
#[derive(Debug, Clone)]
pub enum ProxyError {
    MissingFields {
        route: ProxyRoute,
        fields: Vec<&'static str>,
    },
    NotConfigured(ProxyRoute),
    Status {
        route: ProxyRoute,
        status: u16,
        details: String,
    },
    Transport {
        route: ProxyRoute,
        details: String,
    },
    InvalidBody(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::MissingFields { .. } | ProxyError::InvalidBody(_) => {
                StatusCode::BAD_REQUEST
            }
            ProxyError::NotConfigured(_) | ProxyError::Transport { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ProxyError::Status { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
        }
    }

    pub fn envelope(&self) -> Value {
        match self {
            ProxyError::MissingFields { route, fields } => json!({
                "error": route.invalid_message(),
                "missingFields": fields,
            }),
            ProxyError::NotConfigured(_) => json!({
                "error": "Server configuration incomplete: upstream URL is not set",
            }),
            ProxyError::Status {
                route,
                status,
                details,
            } => json!({
                "error": format!("{}: {}", route.failure_message(), status),
                "details": details,
            }),
            ProxyError::Transport { route, details } => json!({
                "error": format!("Internal error while forwarding the {} request", route),
                "details": details,
            }),
            ProxyError::InvalidBody(details) => json!({
                "error": "Request body must be a JSON object",
                "details": details,
            }),
        }
    }
}

impl std::fmt::Display for ProxyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} - {}", self.status().as_u16(), self.envelope())
    }
}

impl std::error::Error for ProxyError {}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.envelope())).into_response()
    }
}

/// The ticketing platform as seen through the proxy.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn call(&self, route: ProxyRoute, body: Value) -> Result<Value, ProxyError>;
}
