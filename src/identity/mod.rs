//! Identity backend boundary.
//!
//! Sign-in, session renewal and the per-user profile row that carries the
//! operator's company live in an external service. Only its response shapes
//! matter here.

mod supabase;

pub use supabase::SupabaseIdentity;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Credentials of an authenticated operator, carried in cookies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthUser {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// Profile row of the operator as stored by the identity backend.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UserProfile {
    #[serde(rename = "companyId", default)]
    pub company_id: Option<i64>,
    #[serde(default)]
    pub is_promoter: Option<bool>,
    #[serde(rename = "nome", default)]
    pub name: Option<String>,
}

/// Result of a password sign-in or refresh.
#[derive(Debug, Clone)]
pub struct SignedIn {
    pub session: Session,
    pub expires_in: Option<i64>,
    pub user: AuthUser,
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("identity backend is not configured")]
    NotConfigured,
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("identity backend request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("identity backend responded {status}: {body}")]
    Backend { status: u16, body: String },
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn sign_in(&self, email: &str, password: &str) -> Result<SignedIn, IdentityError>;

    async fn refresh(&self, refresh_token: &str) -> Result<SignedIn, IdentityError>;

    /// The user behind the session, or `None` when the session is no longer valid.
    async fn current_user(&self, session: &Session) -> Result<Option<AuthUser>, IdentityError>;

    /// Profile row for `user_id`, or `None` when the row does not exist.
    async fn user_profile(
        &self,
        session: &Session,
        user_id: &str,
    ) -> Result<Option<UserProfile>, IdentityError>;

    async fn sign_out(&self, session: &Session) -> Result<(), IdentityError>;
}
