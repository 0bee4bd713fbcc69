//! Packages operator input into a [`SaleDraft`] and hands it to the workflow.

use std::sync::Arc;
use tracing::info;

use super::{IssuanceAttempt, IssuanceError, IssuanceWorkflow, SaleChannel, SaleDraft};
use crate::catalog::{CatalogClient, CatalogError};
use crate::state::ClientState;
use crate::tenant::{SaleMode, TenantBinding};

const DOCUMENT_TYPE_CPF: &str = "CPF";

/// Customer and ticket choice as entered at the counter, already validated
/// and normalized (digits-only document and phone, ISO birth date).
#[derive(Debug, Clone, PartialEq)]
pub struct SaleRequest {
    /// Company the form was filled for; must still be the terminal's binding
    /// when the sale goes out.
    pub company_id: i64,
    pub event_id: String,
    pub ticket_type_id: i64,
    pub quantity: u32,
    pub client_name: String,
    pub client_document: String,
    pub client_birth_date: Option<String>,
    pub client_phone: Option<String>,
    pub client_email: Option<String>,
    pub sale_channel: SaleChannel,
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("ticket type {0} is not on sale for this event")]
    UnknownTicketType(i64),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Issuance(#[from] IssuanceError),
}

pub struct IssuanceSubmitter {
    catalog: Arc<CatalogClient>,
    workflow: Arc<IssuanceWorkflow>,
}

impl IssuanceSubmitter {
    pub fn new(catalog: Arc<CatalogClient>, workflow: Arc<IssuanceWorkflow>) -> Self {
        Self { catalog, workflow }
    }

    /// Builds the draft for the company captured in `request`, priced for the
    /// sale mode of `binding`. Promoter sales are always free.
    pub fn assemble(
        &self,
        binding: &TenantBinding,
        request: SaleRequest,
        unit_price: f64,
    ) -> SaleDraft {
        let unit_price = match binding.mode {
            SaleMode::Promoter => 0.0,
            SaleMode::Standard => unit_price,
        };
        let quantity = request.quantity.max(1);

        SaleDraft {
            company_id: request.company_id,
            event_id: request.event_id,
            ticket_type_id: request.ticket_type_id,
            quantity,
            client_name: request.client_name.trim().to_string(),
            client_document: request.client_document,
            client_document_type: DOCUMENT_TYPE_CPF.to_string(),
            client_birth_date: request.client_birth_date.unwrap_or_default(),
            client_phone: request.client_phone.unwrap_or_default(),
            client_email: request.client_email.filter(|e| !e.trim().is_empty()),
            sale_channel: request.sale_channel,
            unit_price,
            total_price: unit_price * f64::from(quantity),
            mode: binding.mode,
        }
    }

    /// Prices come from the catalog, never from the operator.
    ///
    /// An existing attempt or a tenant switch stops the sale before the
    /// catalog is asked for prices.
    pub async fn submit(
        &self,
        state: &ClientState,
        binding: &TenantBinding,
        request: SaleRequest,
    ) -> Result<IssuanceAttempt, SubmitError> {
        let current = self.workflow.resume(state).await.map_err(IssuanceError::from)?;
        if current != IssuanceAttempt::NotStarted {
            info!(terminal = %state.terminal(), status = current.label(), "Submit ignored, attempt already exists");
            return Ok(current);
        }
        self.workflow.check_tenant(state, request.company_id).await?;

        let types = self
            .catalog
            .list_ticket_types(state, &request.event_id)
            .await?;
        let ticket_type = types
            .iter()
            .find(|t| t.id == request.ticket_type_id)
            .ok_or(SubmitError::UnknownTicketType(request.ticket_type_id))?;

        let draft = self.assemble(binding, request, ticket_type.price);
        info!(
            terminal = %state.terminal(),
            event_id = %draft.event_id,
            ticket_type_id = draft.ticket_type_id,
            quantity = draft.quantity,
            total = draft.total_price,
            "Submitting sale"
        );
        Ok(self.workflow.submit(state, draft).await?)
    }
}
