//! Persisted client state.
//!
//! Survives reloads of the operator terminal. Every read is defensive: a value
//! that no longer parses is treated as absent rather than as an error, so a
//! format change never wedges a terminal.

mod keys;
mod store;

pub use keys::StateKey;
pub use store::{MemoryBackend, SqliteBackend, StateBackend, StoreError};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::issuance::{IssuedTicket, SaleDraft};
use crate::tenant::{SaleMode, TenantBinding};

const STATUS_PROCESSING: &str = "processing";
const STATUS_COMPLETED: &str = "completed";

/// Issuance marker as persisted under `issuance_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssuanceMarker {
    Processing,
    Completed,
}

/// Typed view over one terminal's keys.
#[derive(Clone)]
pub struct ClientState {
    backend: Arc<dyn StateBackend>,
    terminal: String,
}

impl ClientState {
    pub fn new(backend: Arc<dyn StateBackend>, terminal: impl Into<String>) -> Self {
        Self {
            backend,
            terminal: terminal.into(),
        }
    }

    pub fn terminal(&self) -> &str {
        &self.terminal
    }

    async fn read(&self, key: StateKey) -> Result<Option<String>, StoreError> {
        self.backend.get(&self.terminal, key).await
    }

    async fn write(&self, key: StateKey, value: &str) -> Result<(), StoreError> {
        debug!(terminal = %self.terminal, key = %key, "client state write");
        self.backend.set(&self.terminal, key, value).await
    }

    async fn remove(&self, key: StateKey) -> Result<(), StoreError> {
        debug!(terminal = %self.terminal, key = %key, "client state remove");
        self.backend.remove(&self.terminal, key).await
    }

    async fn read_json<T: DeserializeOwned>(&self, key: StateKey) -> Result<Option<T>, StoreError> {
        let Some(raw) = self.read(key).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(terminal = %self.terminal, key = %key, error = %e, "Ignoring unparsable client state value");
                Ok(None)
            }
        }
    }

    async fn write_json<T: Serialize>(&self, key: StateKey, value: &T) -> Result<(), StoreError> {
        let raw = serde_json::to_string(value)?;
        self.write(key, &raw).await
    }

    // -------------------------------------------------------------------------
    // Tenant binding
    // -------------------------------------------------------------------------

    pub async fn tenant_binding(&self) -> Result<Option<TenantBinding>, StoreError> {
        let Some(company_id) = self
            .read(StateKey::TenantCompanyId)
            .await?
            .and_then(|raw| raw.trim().parse::<i64>().ok())
        else {
            return Ok(None);
        };
        let mode = self
            .read(StateKey::TenantMode)
            .await?
            .and_then(|raw| SaleMode::parse(&raw))
            .unwrap_or_default();
        Ok(Some(TenantBinding { company_id, mode }))
    }

    /// Latest persisted company id, read fresh on every call.
    pub async fn company_id(&self) -> Result<Option<i64>, StoreError> {
        Ok(self.tenant_binding().await?.map(|b| b.company_id))
    }

    pub async fn set_tenant_binding(&self, binding: &TenantBinding) -> Result<(), StoreError> {
        self.write(StateKey::TenantCompanyId, &binding.company_id.to_string())
            .await?;
        self.write(StateKey::TenantMode, binding.mode.as_str()).await
    }

    pub async fn clear_tenant_binding(&self) -> Result<(), StoreError> {
        self.remove(StateKey::TenantCompanyId).await?;
        self.remove(StateKey::TenantMode).await
    }

    // -------------------------------------------------------------------------
    // Sale form
    // -------------------------------------------------------------------------

    pub async fn last_event(&self) -> Result<Option<String>, StoreError> {
        Ok(self
            .read(StateKey::LastEvent)
            .await?
            .filter(|v| !v.is_empty()))
    }

    pub async fn set_last_event(&self, event_id: &str) -> Result<(), StoreError> {
        self.write(StateKey::LastEvent, event_id).await
    }

    // -------------------------------------------------------------------------
    // Issuance
    // -------------------------------------------------------------------------

    pub async fn draft(&self) -> Result<Option<SaleDraft>, StoreError> {
        self.read_json(StateKey::IssuanceDraft).await
    }

    pub async fn set_draft(&self, draft: &SaleDraft) -> Result<(), StoreError> {
        self.write_json(StateKey::IssuanceDraft, draft).await
    }

    pub async fn issuance_marker(&self) -> Result<Option<IssuanceMarker>, StoreError> {
        Ok(match self.read(StateKey::IssuanceStatus).await?.as_deref() {
            Some(STATUS_PROCESSING) => Some(IssuanceMarker::Processing),
            Some(STATUS_COMPLETED) => Some(IssuanceMarker::Completed),
            _ => None,
        })
    }

    /// Atomically moves the terminal into `processing`. Returns `false` when a
    /// marker is already present (another tab got there first).
    pub async fn claim_processing(&self, started_at: DateTime<Utc>) -> Result<bool, StoreError> {
        let claimed = self
            .backend
            .set_if_absent(&self.terminal, StateKey::IssuanceStatus, STATUS_PROCESSING)
            .await?;
        if claimed {
            self.set_started_at(started_at).await?;
        }
        Ok(claimed)
    }

    pub async fn started_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .read(StateKey::IssuanceStartedAt)
            .await?
            .and_then(|raw| raw.trim().parse::<i64>().ok())
            .and_then(DateTime::from_timestamp_millis))
    }

    pub async fn set_started_at(&self, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.write(StateKey::IssuanceStartedAt, &at.timestamp_millis().to_string())
            .await
    }

    pub async fn mark_completed(&self, ticket: &IssuedTicket) -> Result<(), StoreError> {
        self.write_json(StateKey::IssuedTicket, ticket).await?;
        self.write(StateKey::IssuanceCompleted, "true").await?;
        self.write(StateKey::IssuanceStatus, STATUS_COMPLETED).await?;
        self.remove(StateKey::IssuanceStartedAt).await
    }

    /// Drops the processing marker and its timestamp.
    pub async fn clear_processing(&self) -> Result<(), StoreError> {
        self.remove(StateKey::IssuanceStatus).await?;
        self.remove(StateKey::IssuanceStartedAt).await
    }

    pub async fn completed_flag(&self) -> Result<bool, StoreError> {
        Ok(self.read(StateKey::IssuanceCompleted).await?.as_deref() == Some("true"))
    }

    pub async fn issued_ticket(&self) -> Result<Option<IssuedTicket>, StoreError> {
        self.read_json(StateKey::IssuedTicket).await
    }

    pub async fn failure(&self) -> Result<Option<String>, StoreError> {
        self.read(StateKey::IssuanceError).await
    }

    pub async fn set_failure(&self, message: &str) -> Result<(), StoreError> {
        self.write(StateKey::IssuanceError, message).await
    }

    pub async fn clear_failure(&self) -> Result<(), StoreError> {
        self.remove(StateKey::IssuanceError).await
    }

    /// Forget everything about the current sale; tenant and last event stay.
    pub async fn clear_issuance(&self) -> Result<(), StoreError> {
        for key in StateKey::ISSUANCE {
            self.remove(key).await?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // PDF
    // -------------------------------------------------------------------------

    pub async fn last_pdf_url(&self) -> Result<Option<String>, StoreError> {
        self.read(StateKey::PdfLastUrl).await
    }

    pub async fn set_last_pdf_url(&self, url: &str) -> Result<(), StoreError> {
        self.write(StateKey::PdfLastUrl, url).await
    }

    /// Wipes the terminal entirely (sign-out).
    pub async fn clear_all(&self) -> Result<(), StoreError> {
        self.backend.clear(&self.terminal, &[]).await
    }
}
