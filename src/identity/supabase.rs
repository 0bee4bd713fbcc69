//! Supabase-compatible identity client (`/auth/v1` + PostgREST `/rest/v1`).

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{AuthUser, IdentityError, IdentityProvider, Session, SignedIn, UserProfile};
use crate::config::IdentityConfig;

pub struct SupabaseIdentity {
    base_url: Option<String>,
    anon_key: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    user: AuthUser,
}

impl From<TokenResponse> for SignedIn {
    fn from(token: TokenResponse) -> Self {
        Self {
            session: Session {
                access_token: token.access_token,
                refresh_token: token.refresh_token,
            },
            expires_in: token.expires_in,
            user: token.user,
        }
    }
}

impl SupabaseIdentity {
    pub fn new(config: &IdentityConfig, client: reqwest::Client) -> Self {
        Self {
            base_url: config
                .url
                .as_ref()
                .map(|u| u.trim_end_matches('/').to_string()),
            anon_key: config.anon_key.clone().unwrap_or_default(),
            client,
        }
    }

    fn endpoint(&self, path: &str) -> Result<String, IdentityError> {
        let base = self.base_url.as_ref().ok_or(IdentityError::NotConfigured)?;
        Ok(format!("{}{}", base, path))
    }

    async fn backend_error(response: reqwest::Response) -> IdentityError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        IdentityError::Backend { status, body }
    }

    async fn token(&self, grant_type: &str, body: serde_json::Value) -> Result<SignedIn, IdentityError> {
        let url = self.endpoint(&format!("/auth/v1/token?grant_type={}", grant_type))?;
        let response = self
            .client
            .post(&url)
            .header("apikey", &self.anon_key)
            .json(&body)
            .send()
            .await?;

        match response.status() {
            s if s.is_success() => {
                let token: TokenResponse = response.json().await?;
                Ok(token.into())
            }
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED => {
                Err(IdentityError::InvalidCredentials)
            }
            _ => Err(Self::backend_error(response).await),
        }
    }
}

#[async_trait]
impl IdentityProvider for SupabaseIdentity {
    async fn sign_in(&self, email: &str, password: &str) -> Result<SignedIn, IdentityError> {
        debug!(email = %email, "Signing in operator");
        self.token(
            "password",
            serde_json::json!({ "email": email, "password": password }),
        )
        .await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<SignedIn, IdentityError> {
        self.token(
            "refresh_token",
            serde_json::json!({ "refresh_token": refresh_token }),
        )
        .await
    }

    async fn current_user(&self, session: &Session) -> Result<Option<AuthUser>, IdentityError> {
        let url = self.endpoint("/auth/v1/user")?;
        let response = self
            .client
            .get(&url)
            .header("apikey", &self.anon_key)
            .bearer_auth(&session.access_token)
            .send()
            .await?;

        match response.status() {
            s if s.is_success() => Ok(Some(response.json().await?)),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Ok(None),
            _ => Err(Self::backend_error(response).await),
        }
    }

    async fn user_profile(
        &self,
        session: &Session,
        user_id: &str,
    ) -> Result<Option<UserProfile>, IdentityError> {
        let url = self.endpoint("/rest/v1/users")?;
        let id_filter = format!("eq.{}", user_id);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("id", id_filter.as_str()),
                ("select", "companyId,is_promoter,nome"),
            ])
            .header("apikey", &self.anon_key)
            .bearer_auth(&session.access_token)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::backend_error(response).await);
        }

        let rows: Vec<UserProfile> = response.json().await?;
        Ok(rows.into_iter().next())
    }

    async fn sign_out(&self, session: &Session) -> Result<(), IdentityError> {
        let url = self.endpoint("/auth/v1/logout")?;
        let response = self
            .client
            .post(&url)
            .header("apikey", &self.anon_key)
            .bearer_auth(&session.access_token)
            .send()
            .await?;

        match response.status() {
            s if s.is_success() => Ok(()),
            // Already invalid on the backend side; nothing left to revoke
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                warn!("Sign-out with an already invalid session");
                Ok(())
            }
            _ => Err(Self::backend_error(response).await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    fn identity(url: &str) -> SupabaseIdentity {
        SupabaseIdentity::new(
            &IdentityConfig {
                url: Some(format!("{}/", url)),
                anon_key: Some("anon".to_string()),
            },
            reqwest::Client::new(),
        )
    }

    fn session() -> Session {
        Session {
            access_token: "access".to_string(),
            refresh_token: Some("refresh".to_string()),
        }
    }

    #[tokio::test]
    async fn test_sign_in_maps_token_response() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/auth/v1/token")
            .match_query(Matcher::UrlEncoded("grant_type".into(), "password".into()))
            .match_header("apikey", "anon")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"access_token":"a1","refresh_token":"r1","expires_in":3600,
                    "user":{"id":"u-1","email":"op@example.com"}}"#,
            )
            .create_async()
            .await;

        let signed_in = identity(&server.url())
            .sign_in("op@example.com", "secret")
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(signed_in.session.access_token, "a1");
        assert_eq!(signed_in.session.refresh_token.as_deref(), Some("r1"));
        assert_eq!(signed_in.user.id, "u-1");
    }

    #[tokio::test]
    async fn test_sign_in_rejects_bad_credentials() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/auth/v1/token")
            .match_query(Matcher::Any)
            .with_status(400)
            .with_body(r#"{"error":"invalid_grant"}"#)
            .create_async()
            .await;

        let err = identity(&server.url())
            .sign_in("op@example.com", "wrong")
            .await
            .unwrap_err();
        assert!(matches!(err, IdentityError::InvalidCredentials));
    }

    #[tokio::test]
    async fn test_current_user_treats_401_as_no_session() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/auth/v1/user")
            .match_header("authorization", "Bearer access")
            .with_status(401)
            .create_async()
            .await;

        let user = identity(&server.url()).current_user(&session()).await.unwrap();
        assert!(user.is_none());
    }

    #[tokio::test]
    async fn test_user_profile_reads_first_row() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/rest/v1/users")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("id".into(), "eq.u-1".into()),
                Matcher::UrlEncoded("select".into(), "companyId,is_promoter,nome".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"[{"companyId":3,"is_promoter":true,"nome":"Daniel"}]"#)
            .create_async()
            .await;

        let profile = identity(&server.url())
            .user_profile(&session(), "u-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(profile.company_id, Some(3));
        assert_eq!(profile.is_promoter, Some(true));
    }

    #[tokio::test]
    async fn test_user_profile_missing_row() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/rest/v1/users")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body("[]")
            .create_async()
            .await;

        let profile = identity(&server.url())
            .user_profile(&session(), "u-2")
            .await
            .unwrap();
        assert!(profile.is_none());
    }

    #[tokio::test]
    async fn test_unconfigured_backend() {
        let identity = SupabaseIdentity::new(&IdentityConfig::default(), reqwest::Client::new());
        let err = identity.current_user(&session()).await.unwrap_err();
        assert!(matches!(err, IdentityError::NotConfigured));
    }
}
