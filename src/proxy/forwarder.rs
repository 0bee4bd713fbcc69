use async_trait::async_trait;
use reqwest::header::ACCEPT;
use serde_json::{Map, Value};
use tracing::{debug, error, info};
use uuid::Uuid;

use super::{ProxyError, ProxyRoute, Upstream};
use crate::config::UpstreamConfig;

pub const TRANSACTION_HEADER: &str = "x-transaction-id";

/// Forwards proxied calls to the configured upstream URLs over HTTP.
pub struct Forwarder {
    config: UpstreamConfig,
    client: reqwest::Client,
}

impl Forwarder {
    pub fn new(config: UpstreamConfig, client: reqwest::Client) -> Self {
        Self { config, client }
    }

    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }
}

/// Adapts the point-of-sale issuance body to the field names the issuance
/// backend expects.
pub fn remap_issuance(body: &Value, transaction_id: &str) -> Value {
    let mut out = Map::new();
    let mut copy = |to: &str, from: &str| {
        if let Some(v) = body.get(from).filter(|v| !v.is_null()) {
            out.insert(to.to_string(), v.clone());
        }
    };
    copy("companyId", "companyId");
    copy("eventId", "eventId");
    copy("product_id", "ticketId");
    copy("qtd", "quantity");
    copy("name", "clientName");
    copy("cpf", "clientDocument");
    copy("birthday", "clientBirthDate");
    copy("phone", "clientPhone");
    copy("email", "clientEmail");
    copy("unitPrice", "unitPrice");
    copy("totalPrice", "totalPrice");

    let quantity_missing = match out.get("qtd") {
        None => true,
        Some(v) => v.as_f64() == Some(0.0),
    };
    if quantity_missing {
        out.insert("qtd".to_string(), Value::from(1));
    }

    let channel = match body.get("saleType").and_then(Value::as_str) {
        Some("local") => "pdv",
        _ => "web",
    };
    out.insert("sales_channel".to_string(), Value::from(channel));
    out.insert(
        "transactionId".to_string(),
        Value::from(transaction_id.to_string()),
    );
    Value::Object(out)
}

#[async_trait]
impl Upstream for Forwarder {
    async fn call(&self, route: ProxyRoute, body: Value) -> Result<Value, ProxyError> {
        if !body.is_object() {
            return Err(ProxyError::InvalidBody(format!(
                "expected an object, got {}",
                body
            )));
        }

        let missing = route.missing_fields(&body);
        if !missing.is_empty() {
            error!(route = %route, missing = ?missing, "Proxy request rejected");
            return Err(ProxyError::MissingFields {
                route,
                fields: missing,
            });
        }

        let url = route.upstream_url(&self.config).ok_or_else(|| {
            error!(route = %route, "Upstream URL not configured");
            ProxyError::NotConfigured(route)
        })?;

        let mut request = self
            .client
            .post(url)
            .header(ACCEPT, "application/json");

        if route == ProxyRoute::Issuance {
            let transaction_id = Uuid::new_v4().to_string();
            info!(route = %route, transaction_id = %transaction_id, "Forwarding issuance");
            request = request
                .header(TRANSACTION_HEADER, &transaction_id)
                .json(&remap_issuance(&body, &transaction_id));
        } else {
            debug!(route = %route, url = %url, "Forwarding request");
            request = request.json(&body);
        }

        let response = request.send().await.map_err(|e| {
            error!(route = %route, error = %e, "Upstream request failed");
            ProxyError::Transport {
                route,
                details: e.to_string(),
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let details = response
                .text()
                .await
                .unwrap_or_else(|_| "failed to read response".to_string());
            error!(route = %route, status = status.as_u16(), body = %details, "Upstream responded with an error");
            return Err(ProxyError::Status {
                route,
                status: status.as_u16(),
                details,
            });
        }

        response.json::<Value>().await.map_err(|e| ProxyError::Transport {
            route,
            details: format!("invalid upstream response: {}", e),
        })
    }
}
