//! Tenant resolution.
//!
//! Establishes which company the signed-in operator sells for and keeps that
//! binding in the terminal's persisted state, so reloads and other tabs of the
//! same terminal see the same tenant without asking the identity backend again.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::api::metrics::record_tenant_resolution;
use crate::identity::{IdentityError, IdentityProvider, Session};
use crate::state::{ClientState, StoreError};

/// How the terminal sells. Promoters issue courtesy (zero-priced) tickets
/// with a reduced customer form.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaleMode {
    #[default]
    Standard,
    Promoter,
}

impl SaleMode {
    pub fn from_promoter_flag(is_promoter: bool) -> Self {
        if is_promoter {
            SaleMode::Promoter
        } else {
            SaleMode::Standard
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SaleMode::Standard => "standard",
            SaleMode::Promoter => "promoter",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "standard" => Some(SaleMode::Standard),
            "promoter" => Some(SaleMode::Promoter),
            _ => None,
        }
    }

    pub fn is_promoter(&self) -> bool {
        matches!(self, SaleMode::Promoter)
    }
}

impl std::fmt::Display for SaleMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantBinding {
    pub company_id: i64,
    pub mode: SaleMode,
}

#[derive(Debug, thiserror::Error)]
pub enum TenantError {
    #[error("not signed in")]
    NoSession,
    #[error("session expired, sign in again")]
    SessionExpired,
    #[error("user is not linked to any company")]
    Unprovisioned,
    #[error("failed to look up the operator's company: {0}")]
    Lookup(#[from] IdentityError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TenantError {
    /// Whether the operator has to go back to the login screen.
    pub fn requires_login(&self) -> bool {
        matches!(
            self,
            TenantError::NoSession | TenantError::SessionExpired | TenantError::Unprovisioned
        )
    }
}

pub struct TenantResolver {
    identity: Arc<dyn IdentityProvider>,
}

impl TenantResolver {
    pub fn new(identity: Arc<dyn IdentityProvider>) -> Self {
        Self { identity }
    }

    /// Returns the terminal's binding, deriving it from the identity backend
    /// only when nothing is persisted yet.
    pub async fn resolve(
        &self,
        session: Option<&Session>,
        state: &ClientState,
    ) -> Result<TenantBinding, TenantError> {
        let session = session.ok_or(TenantError::NoSession)?;

        if let Some(binding) = state.tenant_binding().await? {
            debug!(terminal = %state.terminal(), company_id = binding.company_id, "Tenant from persisted state");
            record_tenant_resolution("cache");
            return Ok(binding);
        }

        self.derive(session, state).await
    }

    /// Drops the persisted binding and derives it again unconditionally.
    pub async fn force_refresh(
        &self,
        session: Option<&Session>,
        state: &ClientState,
    ) -> Result<TenantBinding, TenantError> {
        let session = session.ok_or(TenantError::NoSession)?;

        let previous = state.tenant_binding().await?;
        state.clear_tenant_binding().await?;

        let binding = self.derive(session, state).await?;
        if let Some(previous) = previous {
            if previous.company_id != binding.company_id {
                error!(
                    terminal = %state.terminal(),
                    cached = previous.company_id,
                    actual = binding.company_id,
                    "Persisted company id was stale"
                );
            }
        }
        Ok(binding)
    }

    /// Ends the session at the identity backend and wipes the terminal.
    pub async fn sign_out(
        &self,
        session: Option<&Session>,
        state: &ClientState,
    ) -> Result<(), TenantError> {
        if let Some(session) = session {
            if let Err(e) = self.identity.sign_out(session).await {
                warn!(error = %e, "Identity sign-out failed, clearing local state anyway");
            }
        }
        state.clear_all().await?;
        info!(terminal = %state.terminal(), "Terminal signed out");
        Ok(())
    }

    async fn derive(
        &self,
        session: &Session,
        state: &ClientState,
    ) -> Result<TenantBinding, TenantError> {
        let user = self
            .identity
            .current_user(session)
            .await?
            .ok_or(TenantError::SessionExpired)?;

        let profile = self.identity.user_profile(session, &user.id).await?;
        let Some(company_id) = profile.as_ref().and_then(|p| p.company_id) else {
            warn!(user_id = %user.id, "User has no company, signing out");
            record_tenant_resolution("unprovisioned");
            self.sign_out(Some(session), state).await?;
            return Err(TenantError::Unprovisioned);
        };

        let mode = SaleMode::from_promoter_flag(
            profile.and_then(|p| p.is_promoter).unwrap_or(false),
        );
        let binding = TenantBinding { company_id, mode };
        state.set_tenant_binding(&binding).await?;

        info!(
            terminal = %state.terminal(),
            user_id = %user.id,
            company_id,
            mode = %mode,
            "Tenant resolved"
        );
        record_tenant_resolution("backend");
        Ok(binding)
    }
}
