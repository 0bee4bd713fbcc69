//! Catalog client: events, ticket types and customer lookup.
//!
//! Every call re-reads the company id from the terminal's persisted state
//! right before going upstream, so a tenant switch made in another tab is
//! picked up without a reload.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::proxy::{ProxyError, ProxyRoute, Upstream};
use crate::state::{ClientState, StoreError};
use crate::tenant::SaleMode;

const CPF_DIGITS: usize = 11;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub id: String,
    pub name: String,
    pub starts_at: String,
    pub ends_at: Option<String>,
    pub currency: String,
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Bundle {
    pub quantity: u32,
    pub designated_price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TicketType {
    pub id: i64,
    pub name: String,
    pub price: f64,
    pub description: Option<String>,
    pub position: i64,
    pub checkin_attention: bool,
    pub bundle: Option<Bundle>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Customer {
    pub nome: String,
    pub nascimento: String,
    pub encontrado: bool,
}

impl Customer {
    pub fn not_found() -> Self {
        Self::default()
    }
}

// Upstream wire shapes

#[derive(Debug, Default, Deserialize)]
struct Localized {
    #[serde(default)]
    en: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EventItem {
    slug: String,
    #[serde(default)]
    name: Localized,
    #[serde(default)]
    date_from: Option<String>,
    #[serde(default)]
    date_to: Option<String>,
    #[serde(default)]
    currency: Option<String>,
    #[serde(default)]
    public_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EventPage {
    #[serde(default)]
    count: u64,
    #[serde(default)]
    results: Option<Vec<EventItem>>,
}

#[derive(Debug, Deserialize)]
struct BundleItem {
    #[serde(default)]
    count: u32,
    #[serde(default)]
    designated_price: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TicketItem {
    id: i64,
    #[serde(default)]
    name: Localized,
    #[serde(default)]
    default_price: Option<String>,
    #[serde(default)]
    description: Option<Localized>,
    #[serde(default)]
    active: bool,
    #[serde(default)]
    position: i64,
    #[serde(default)]
    checkin_attention: bool,
    #[serde(default)]
    bundles: Vec<BundleItem>,
}

#[derive(Debug, Deserialize)]
struct TicketPage {
    #[serde(default)]
    results: Vec<TicketItem>,
}

#[derive(Debug, Deserialize)]
struct TicketEnvelope {
    #[serde(default)]
    active: bool,
    #[serde(default)]
    tickets: Option<TicketPage>,
}

#[derive(Debug, Deserialize)]
struct CustomerReply {
    #[serde(default)]
    nome: Option<String>,
    #[serde(default)]
    nascimento: Option<String>,
    #[serde(default)]
    error: Option<Value>,
}

impl From<EventItem> for Event {
    fn from(item: EventItem) -> Self {
        Self {
            name: item.name.en.unwrap_or_else(|| item.slug.clone()),
            id: item.slug,
            starts_at: item.date_from.unwrap_or_default(),
            ends_at: item.date_to,
            currency: item.currency.unwrap_or_default(),
            url: item.public_url,
        }
    }
}

impl From<TicketItem> for TicketType {
    fn from(item: TicketItem) -> Self {
        Self {
            id: item.id,
            name: item.name.en.unwrap_or_default(),
            price: parse_price(item.default_price.as_deref()),
            description: item.description.and_then(|d| d.en),
            position: item.position,
            checkin_attention: item.checkin_attention,
            bundle: item.bundles.into_iter().next().map(|b| Bundle {
                quantity: b.count,
                designated_price: parse_price(b.designated_price.as_deref()),
            }),
        }
    }
}

fn parse_price(raw: Option<&str>) -> f64 {
    raw.and_then(|p| p.trim().parse::<f64>().ok()).unwrap_or(0.0)
}

/// Strips everything but ASCII digits.
pub fn digits_only(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("no company bound to this terminal")]
    NoTenant,
    #[error("no events available right now")]
    NoEventsAvailable,
    #[error("no tickets available for this event")]
    NoTicketsAvailable,
    #[error("catalog request failed: {0}")]
    Upstream(#[from] ProxyError),
    #[error("unexpected catalog response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct CatalogClient {
    upstream: Arc<dyn Upstream>,
}

impl CatalogClient {
    pub fn new(upstream: Arc<dyn Upstream>) -> Self {
        Self { upstream }
    }

    async fn company_id(&self, state: &ClientState) -> Result<i64, CatalogError> {
        state.company_id().await?.ok_or(CatalogError::NoTenant)
    }

    pub async fn list_events(&self, state: &ClientState) -> Result<Vec<Event>, CatalogError> {
        let company_id = self.company_id(state).await?;
        let reply = self
            .upstream
            .call(ProxyRoute::Events, json!({ "companyId": company_id }))
            .await?;

        let page: EventPage = serde_json::from_value(reply)?;
        let results = match page.results {
            Some(results) if page.count > 0 && !results.is_empty() => results,
            _ => return Err(CatalogError::NoEventsAvailable),
        };

        debug!(company_id, count = results.len(), "Events loaded");
        Ok(results.into_iter().map(Event::from).collect())
    }

    /// Active ticket types of an event ordered by position. Promoter terminals
    /// only see zero-priced types. Remembers the event as the last selected one.
    pub async fn list_ticket_types(
        &self,
        state: &ClientState,
        event_id: &str,
    ) -> Result<Vec<TicketType>, CatalogError> {
        let binding = state.tenant_binding().await?.ok_or(CatalogError::NoTenant)?;
        let reply = self
            .upstream
            .call(
                ProxyRoute::Tickets,
                json!({ "eventId": event_id, "companyId": binding.company_id }),
            )
            .await?;

        let envelope: TicketEnvelope = serde_json::from_value(reply)?;
        let page = match envelope.tickets {
            Some(page) if envelope.active && !page.results.is_empty() => page,
            _ => return Err(CatalogError::NoTicketsAvailable),
        };

        let mut types: Vec<TicketType> = page
            .results
            .into_iter()
            .filter(|t| t.active)
            .map(TicketType::from)
            .collect();
        types.sort_by_key(|t| t.position);

        if binding.mode == SaleMode::Promoter {
            types.retain(|t| t.price == 0.0);
        }

        state.set_last_event(event_id).await?;
        Ok(types)
    }

    /// Looks a customer up by CPF. Not-found is a normal answer, not an error,
    /// and so is any upstream failure: the operator just types the data in.
    pub async fn lookup_customer(
        &self,
        state: &ClientState,
        document: &str,
    ) -> Result<Customer, CatalogError> {
        let cpf = digits_only(document);
        if cpf.len() < CPF_DIGITS {
            return Ok(Customer::not_found());
        }

        let company_id = self.company_id(state).await?;
        let reply = match self
            .upstream
            .call(
                ProxyRoute::Customer,
                json!({ "cpf": cpf, "companyId": company_id }),
            )
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                warn!(company_id, error = %e, "Customer lookup failed, treating as not found");
                return Ok(Customer::not_found());
            }
        };

        let reply: CustomerReply = match serde_json::from_value(reply) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, "Unrecognized customer lookup reply");
                return Ok(Customer::not_found());
            }
        };

        let found = match &reply.error {
            Some(Value::String(code)) => code == "0",
            Some(Value::Number(code)) => code.as_i64() == Some(0),
            _ => false,
        };
        if !found {
            return Ok(Customer::not_found());
        }

        info!(company_id, "Customer found");
        Ok(Customer {
            nome: reply.nome.unwrap_or_default(),
            nascimento: reply.nascimento.unwrap_or_default(),
            encontrado: true,
        })
    }
}
