//! Point-of-sale endpoints: tenant, catalog, sale submission and the result
//! screen. Every handler resolves the tenant first; nothing reaches the
//! ticketing platform for a terminal without a binding.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use super::auth::{OperatorSession, Terminal};
use super::error::{ApiError, ValidationErrorBuilder};
use super::validation::{
    validate_birth_date, validate_cpf, validate_email, validate_name, validate_phone,
    validate_quantity,
};
use crate::catalog::{CatalogError, Customer, Event, TicketType};
use crate::issuance::{IssuanceAttempt, SaleChannel, SaleRequest};
use crate::pdf::PdfOutcome;
use crate::tenant::{SaleMode, TenantBinding};
use crate::AppState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsResponse {
    pub events: Vec<Event>,
    /// Event to preselect in the sale form
    pub last_event: Option<String>,
}

#[derive(Serialize)]
pub struct TenantRefreshResponse {
    pub tenant: TenantBinding,
    pub events: Vec<Event>,
}

/// Sale form as posted by the terminal. Birth date is DD/MM/YYYY.
///
/// `company_id` is the tenant the form was filled for, as shown by
/// `GET /api/pdv/tenant`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleForm {
    pub company_id: Option<i64>,
    #[serde(default)]
    pub event_id: String,
    pub ticket_type_id: Option<i64>,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
    #[serde(default)]
    pub client_name: String,
    #[serde(default)]
    pub client_document: String,
    #[serde(default)]
    pub client_birth_date: Option<String>,
    #[serde(default)]
    pub client_phone: Option<String>,
    #[serde(default)]
    pub client_email: Option<String>,
    #[serde(default)]
    pub sale_type: SaleChannel,
}

fn default_quantity() -> u32 {
    1
}

#[derive(Debug, Default, Deserialize)]
pub struct PdfRequest {
    /// Explicit document URL; defaults to the PDF of the issued ticket
    pub url: Option<String>,
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Checks the form against the rules of `mode` and normalizes it. Promoter
/// sales only need a name and a CPF.
pub fn validate_sale(form: SaleForm, mode: SaleMode) -> Result<SaleRequest, ApiError> {
    let mut errors = ValidationErrorBuilder::new();

    if form.company_id.is_none() {
        errors.add("companyId", "Sale form is not bound to a company");
    }
    if form.event_id.trim().is_empty() {
        errors.add("eventId", "Select an event");
    }
    if form.ticket_type_id.is_none() {
        errors.add("ticketTypeId", "Select a ticket type");
    }
    let quantity = errors.check("quantity", validate_quantity(form.quantity));
    let name = errors.check("clientName", validate_name(&form.client_name));
    let document = errors.check("clientDocument", validate_cpf(&form.client_document));

    let collect_all = !mode.is_promoter();

    let birth_date = match non_blank(&form.client_birth_date) {
        Some(raw) => errors.check("clientBirthDate", validate_birth_date(raw)),
        None => {
            if collect_all {
                errors.add("clientBirthDate", "Birth date is required");
            }
            None
        }
    };
    let phone = match non_blank(&form.client_phone) {
        Some(raw) => errors.check("clientPhone", validate_phone(raw)),
        None => {
            if collect_all {
                errors.add("clientPhone", "Phone is required");
            }
            None
        }
    };
    let email = match non_blank(&form.client_email) {
        Some(raw) => errors.check("clientEmail", validate_email(raw)),
        None => {
            if form.sale_type == SaleChannel::Online {
                errors.add("clientEmail", "Email is required for online sales");
            }
            None
        }
    };

    if let Some(err) = errors.build() {
        return Err(err);
    }

    match (form.company_id, form.ticket_type_id, quantity, name, document) {
        (
            Some(company_id),
            Some(ticket_type_id),
            Some(quantity),
            Some(client_name),
            Some(client_document),
        ) => {
            Ok(SaleRequest {
                company_id,
                event_id: form.event_id.trim().to_string(),
                ticket_type_id,
                quantity,
                client_name,
                client_document,
                client_birth_date: birth_date,
                client_phone: phone,
                client_email: email,
                sale_channel: form.sale_type,
            })
        }
        _ => Err(ApiError::bad_request("Incomplete sale form")),
    }
}

fn attempt_response(attempt: IssuanceAttempt) -> Response {
    let status = match attempt {
        IssuanceAttempt::Processing { .. } => StatusCode::ACCEPTED,
        _ => StatusCode::OK,
    };
    (status, Json(attempt)).into_response()
}

/// GET /api/pdv/tenant
pub async fn get_tenant(
    State(state): State<Arc<AppState>>,
    session: OperatorSession,
    Terminal(terminal): Terminal,
) -> Result<Json<TenantBinding>, ApiError> {
    let binding = state.resolver.resolve(session.get(), &terminal).await?;
    Ok(Json(binding))
}

/// POST /api/pdv/tenant/refresh
///
/// Re-derives the binding and reloads the events of the (possibly new) company.
pub async fn refresh_tenant(
    State(state): State<Arc<AppState>>,
    session: OperatorSession,
    Terminal(terminal): Terminal,
) -> Result<Json<TenantRefreshResponse>, ApiError> {
    let tenant = state.resolver.force_refresh(session.get(), &terminal).await?;

    let events = match state.catalog.list_events(&terminal).await {
        Ok(events) => events,
        Err(CatalogError::NoEventsAvailable) => Vec::new(),
        Err(e) => return Err(e.into()),
    };
    Ok(Json(TenantRefreshResponse { tenant, events }))
}

/// GET /api/pdv/events
pub async fn list_events(
    State(state): State<Arc<AppState>>,
    session: OperatorSession,
    Terminal(terminal): Terminal,
) -> Result<Json<EventsResponse>, ApiError> {
    state.resolver.resolve(session.get(), &terminal).await?;

    let events = state.catalog.list_events(&terminal).await?;
    let last_event = terminal
        .last_event()
        .await?
        .filter(|id| events.iter().any(|e| &e.id == id));
    Ok(Json(EventsResponse { events, last_event }))
}

/// GET /api/pdv/events/:event_id/tickets
pub async fn list_ticket_types(
    State(state): State<Arc<AppState>>,
    session: OperatorSession,
    Terminal(terminal): Terminal,
    Path(event_id): Path<String>,
) -> Result<Json<Vec<TicketType>>, ApiError> {
    state.resolver.resolve(session.get(), &terminal).await?;
    let types = state.catalog.list_ticket_types(&terminal, &event_id).await?;
    Ok(Json(types))
}

/// GET /api/pdv/customers/:document
pub async fn lookup_customer(
    State(state): State<Arc<AppState>>,
    session: OperatorSession,
    Terminal(terminal): Terminal,
    Path(document): Path<String>,
) -> Result<Json<Customer>, ApiError> {
    state.resolver.resolve(session.get(), &terminal).await?;
    let customer = state.catalog.lookup_customer(&terminal, &document).await?;
    Ok(Json(customer))
}

/// POST /api/pdv/sales
///
/// Answers 202 while a previous attempt of this terminal is still in flight,
/// 409 when the terminal was rebound to another company since the form was
/// filled and 200 with the final state otherwise.
pub async fn create_sale(
    State(state): State<Arc<AppState>>,
    session: OperatorSession,
    Terminal(terminal): Terminal,
    Json(form): Json<SaleForm>,
) -> Result<Response, ApiError> {
    let binding = state.resolver.resolve(session.get(), &terminal).await?;
    let request = validate_sale(form, binding.mode)?;

    let attempt = state.submitter.submit(&terminal, &binding, request).await?;
    info!(terminal = %terminal.terminal(), outcome = attempt.label(), "Sale submitted");
    Ok(attempt_response(attempt))
}

/// GET /api/pdv/sales/current
pub async fn current_sale(
    State(state): State<Arc<AppState>>,
    session: OperatorSession,
    Terminal(terminal): Terminal,
) -> Result<Response, ApiError> {
    state.resolver.resolve(session.get(), &terminal).await?;
    let attempt = state.workflow.resume(&terminal).await?;
    Ok(attempt_response(attempt))
}

/// POST /api/pdv/sales/new
pub async fn new_sale(
    State(state): State<Arc<AppState>>,
    session: OperatorSession,
    Terminal(terminal): Terminal,
) -> Result<Json<IssuanceAttempt>, ApiError> {
    state.resolver.resolve(session.get(), &terminal).await?;
    state.workflow.new_sale(&terminal).await?;
    Ok(Json(IssuanceAttempt::NotStarted))
}

/// POST /api/pdv/sales/current/pdf
pub async fn open_pdf(
    State(state): State<Arc<AppState>>,
    session: OperatorSession,
    Terminal(terminal): Terminal,
    body: Option<Json<PdfRequest>>,
) -> Result<Json<PdfOutcome>, ApiError> {
    state.resolver.resolve(session.get(), &terminal).await?;
    let explicit = body.and_then(|Json(r)| r.url).filter(|u| !u.trim().is_empty());

    let url = match explicit {
        Some(url) => Some(url),
        None => match state.workflow.resume(&terminal).await? {
            IssuanceAttempt::Completed { ticket } => ticket.pdf_url().map(str::to_string),
            other => {
                warn!(terminal = %terminal.terminal(), status = other.label(), "PDF requested without an issued ticket");
                None
            }
        },
    };

    let outcome = state.pdf.open(&terminal, url.as_deref()).await?;
    Ok(Json(outcome))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::error::ErrorCode;

    fn form() -> SaleForm {
        SaleForm {
            company_id: Some(3),
            event_id: "rock-fest".to_string(),
            ticket_type_id: Some(7),
            quantity: 2,
            client_name: "Ana Souza".to_string(),
            client_document: "123.456.789-01".to_string(),
            client_birth_date: Some("02/01/1990".to_string()),
            client_phone: Some("(11) 99999-9999".to_string()),
            client_email: None,
            sale_type: SaleChannel::Local,
        }
    }

    #[test]
    fn test_validate_sale_normalizes() {
        let request = validate_sale(form(), SaleMode::Standard).unwrap();
        assert_eq!(request.client_document, "12345678901");
        assert_eq!(request.client_birth_date.as_deref(), Some("1990-01-02"));
        assert_eq!(request.client_phone.as_deref(), Some("11999999999"));
        assert_eq!(request.client_email, None);
        assert_eq!(request.company_id, 3);
    }

    #[test]
    fn test_sale_form_requires_company() {
        let err = validate_sale(
            SaleForm {
                company_id: None,
                ..form()
            },
            SaleMode::Standard,
        )
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);
        assert_eq!(err.message(), "Sale form is not bound to a company");
    }

    #[test]
    fn test_standard_sale_requires_phone_and_birth_date() {
        let err = validate_sale(
            SaleForm {
                client_birth_date: None,
                client_phone: Some("  ".to_string()),
                ..form()
            },
            SaleMode::Standard,
        )
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);
        assert!(err.message().contains("2 fields"));
    }

    #[test]
    fn test_promoter_sale_needs_name_and_cpf_only() {
        let request = validate_sale(
            SaleForm {
                client_birth_date: None,
                client_phone: None,
                ..form()
            },
            SaleMode::Promoter,
        )
        .unwrap();
        assert_eq!(request.client_phone, None);
    }

    #[test]
    fn test_online_sale_requires_email() {
        let err = validate_sale(
            SaleForm {
                sale_type: SaleChannel::Online,
                ..form()
            },
            SaleMode::Standard,
        )
        .unwrap_err();
        assert_eq!(err.message(), "Email is required for online sales");
    }

    #[test]
    fn test_invalid_cpf_is_rejected() {
        let err = validate_sale(
            SaleForm {
                client_document: "123".to_string(),
                ..form()
            },
            SaleMode::Standard,
        )
        .unwrap_err();
        assert_eq!(err.message(), "Invalid CPF");
    }
}
