//! Keys of the per-terminal client state.
//!
//! Each key has a single writer role:
//! - `Tenant*`: tenant resolver
//! - `LastEvent`: sale form (catalog)
//! - `Issuance*`, `IssuedTicket`: issuance workflow
//! - `PdfLastUrl`: PDF poller

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateKey {
    TenantCompanyId,
    TenantMode,
    LastEvent,
    IssuanceDraft,
    IssuanceStatus,
    IssuanceStartedAt,
    IssuanceCompleted,
    IssuedTicket,
    IssuanceError,
    PdfLastUrl,
}

impl StateKey {
    pub const ALL: [StateKey; 10] = [
        StateKey::TenantCompanyId,
        StateKey::TenantMode,
        StateKey::LastEvent,
        StateKey::IssuanceDraft,
        StateKey::IssuanceStatus,
        StateKey::IssuanceStartedAt,
        StateKey::IssuanceCompleted,
        StateKey::IssuedTicket,
        StateKey::IssuanceError,
        StateKey::PdfLastUrl,
    ];

    /// Keys owned by a single sale; dropped when the operator starts a new one.
    pub const ISSUANCE: [StateKey; 7] = [
        StateKey::IssuanceDraft,
        StateKey::IssuanceStatus,
        StateKey::IssuanceStartedAt,
        StateKey::IssuanceCompleted,
        StateKey::IssuedTicket,
        StateKey::IssuanceError,
        StateKey::PdfLastUrl,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StateKey::TenantCompanyId => "tenant_company_id",
            StateKey::TenantMode => "tenant_mode",
            StateKey::LastEvent => "last_event",
            StateKey::IssuanceDraft => "issuance_draft",
            StateKey::IssuanceStatus => "issuance_status",
            StateKey::IssuanceStartedAt => "issuance_started_at",
            StateKey::IssuanceCompleted => "issuance_completed",
            StateKey::IssuedTicket => "issued_ticket",
            StateKey::IssuanceError => "issuance_error",
            StateKey::PdfLastUrl => "pdf_last_url",
        }
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
