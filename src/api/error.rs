//! Unified error envelope for the operator API.
//!
//! Every operator endpoint answers failures as
//! `{ "error": { "code", "message", "details"? } }`. The proxy routes keep
//! their own flatter envelope (see `proxy::ProxyError`).

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::catalog::CatalogError;
use crate::identity::IdentityError;
use crate::issuance::{IssuanceError, SubmitError};
use crate::proxy::ProxyError;
use crate::state::StoreError;
use crate::tenant::TenantError;

/// Where the terminal should send the operator when the session is unusable.
pub const LOGIN_PATH: &str = "/login";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    // Client errors (4xx)
    BadRequest,
    Unauthorized,
    NotFound,
    Conflict,
    ValidationError,

    // Server errors (5xx)
    InternalError,
    ServiceUnavailable,
    DatabaseError,
    ExternalServiceError,
}

impl ErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::Conflict => StatusCode::CONFLICT,
            ErrorCode::ValidationError => StatusCode::BAD_REQUEST,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::DatabaseError => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::ExternalServiceError => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::BadRequest => "bad_request",
            ErrorCode::Unauthorized => "unauthorized",
            ErrorCode::NotFound => "not_found",
            ErrorCode::Conflict => "conflict",
            ErrorCode::ValidationError => "validation_error",
            ErrorCode::InternalError => "internal_error",
            ErrorCode::ServiceUnavailable => "service_unavailable",
            ErrorCode::DatabaseError => "database_error",
            ErrorCode::ExternalServiceError => "external_service_error",
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Machine-readable error code
    pub code: String,
    /// Human-readable message, shown to the operator as-is
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<ErrorDetails>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ErrorDetails {
    /// Field-level validation errors
    ValidationErrors(HashMap<String, Vec<String>>),
    /// Generic key-value details
    Generic(HashMap<String, serde_json::Value>),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Debug)]
pub struct ApiError {
    code: ErrorCode,
    status: StatusCode,
    message: String,
    details: Option<ErrorDetails>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code(),
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_validation_errors(mut self, errors: HashMap<String, Vec<String>>) -> Self {
        self.details = Some(ErrorDetails::ValidationErrors(errors));
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    /// 401 carrying a `redirect` hint to the login screen.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        let mut details = HashMap::new();
        details.insert("redirect".to_string(), serde_json::Value::from(LOGIN_PATH));
        Self::new(ErrorCode::Unauthorized, message).with_details(ErrorDetails::Generic(details))
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Conflict, message)
    }

    /// Validation error (400) with field-level details
    pub fn validation(errors: HashMap<String, Vec<String>>) -> Self {
        let message = if errors.len() == 1 {
            errors
                .values()
                .next()
                .and_then(|v| v.first())
                .cloned()
                .unwrap_or_else(|| "Validation failed".to_string())
        } else {
            format!("Validation failed for {} fields", errors.len())
        };

        Self::new(ErrorCode::ValidationError, message).with_validation_errors(errors)
    }

    pub fn validation_field(field: &str, message: impl Into<String>) -> Self {
        let mut errors = HashMap::new();
        errors.insert(field.to_string(), vec![message.into()]);
        Self::validation(errors)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    pub fn database(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::DatabaseError, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ServiceUnavailable, message)
    }

    pub fn external(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ExternalServiceError, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let response = ErrorResponse {
            error: ErrorBody {
                code: self.code.as_str().to_string(),
                message: self.message,
                details: self.details,
            },
        };

        (self.status, Json(response)).into_response()
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for ApiError {}

// -------------------------------------------------------------------------
// Conversions from the domain errors
// -------------------------------------------------------------------------

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        tracing::error!("Client state error: {}", err);
        ApiError::database("Failed to access the terminal state")
    }
}

impl From<ProxyError> for ApiError {
    fn from(err: ProxyError) -> Self {
        let envelope = err.envelope();
        let message = envelope
            .get("error")
            .and_then(|e| e.as_str())
            .unwrap_or("Upstream request failed")
            .to_string();
        let details = envelope
            .as_object()
            .map(|map| {
                map.iter()
                    .filter(|(k, _)| k.as_str() != "error")
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect::<HashMap<_, _>>()
            })
            .unwrap_or_default();

        let status = match &err {
            ProxyError::Status { .. } => err.status(),
            _ => StatusCode::BAD_GATEWAY,
        };
        let api = ApiError::external(message).with_status(status);
        if details.is_empty() {
            api
        } else {
            api.with_details(ErrorDetails::Generic(details))
        }
    }
}

impl From<IdentityError> for ApiError {
    fn from(err: IdentityError) -> Self {
        match err {
            IdentityError::InvalidCredentials => ApiError::unauthorized("Invalid email or password"),
            IdentityError::NotConfigured => {
                ApiError::service_unavailable("Sign-in is not configured on this server")
            }
            other => {
                tracing::error!("Identity backend error: {}", other);
                ApiError::external("The sign-in service is unavailable, try again")
            }
        }
    }
}

impl From<TenantError> for ApiError {
    fn from(err: TenantError) -> Self {
        match err {
            e if e.requires_login() => ApiError::unauthorized(e.to_string()),
            TenantError::Lookup(e) => e.into(),
            TenantError::Store(e) => e.into(),
            e => ApiError::internal(e.to_string()),
        }
    }
}

impl From<CatalogError> for ApiError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::NoTenant => ApiError::unauthorized(err.to_string()),
            CatalogError::NoEventsAvailable | CatalogError::NoTicketsAvailable => {
                ApiError::not_found(err.to_string())
            }
            CatalogError::Upstream(e) => e.into(),
            CatalogError::Decode(e) => {
                tracing::error!("Unexpected catalog payload: {}", e);
                ApiError::external("The ticketing platform sent an unexpected response")
            }
            CatalogError::Store(e) => e.into(),
        }
    }
}

impl From<IssuanceError> for ApiError {
    fn from(err: IssuanceError) -> Self {
        match err {
            IssuanceError::TenantChanged { .. } => ApiError::conflict(err.to_string()),
            IssuanceError::Store(e) => e.into(),
        }
    }
}

impl From<SubmitError> for ApiError {
    fn from(err: SubmitError) -> Self {
        match err {
            SubmitError::UnknownTicketType(_) => {
                ApiError::validation_field("ticketTypeId", err.to_string())
            }
            SubmitError::Catalog(e) => e.into(),
            SubmitError::Issuance(e) => e.into(),
        }
    }
}

/// Collects field-level validation errors before answering 400.
#[derive(Debug, Default)]
pub struct ValidationErrorBuilder {
    errors: HashMap<String, Vec<String>>,
}

impl ValidationErrorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) -> &mut Self {
        self.errors
            .entry(field.into())
            .or_default()
            .push(message.into());
        self
    }

    /// Records the error of a `validate_*` result, passing the value through.
    pub fn check<T>(&mut self, field: &str, result: Result<T, String>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(message) => {
                self.add(field, message);
                None
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn build(self) -> Option<ApiError> {
        if self.errors.is_empty() {
            None
        } else {
            Some(ApiError::validation(self.errors))
        }
    }

    pub fn finish(self) -> Result<(), ApiError> {
        match self.build() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::ProxyRoute;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(ErrorCode::BadRequest.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorCode::Unauthorized.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(ErrorCode::Conflict.status_code(), StatusCode::CONFLICT);
        assert_eq!(
            ErrorCode::ExternalServiceError.status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_unauthorized_carries_login_redirect() {
        let err = ApiError::from(TenantError::SessionExpired);
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
        match err.details {
            Some(ErrorDetails::Generic(details)) => {
                assert_eq!(details["redirect"], LOGIN_PATH);
            }
            other => panic!("expected redirect details, got {:?}", other),
        }
    }

    #[test]
    fn test_tenant_change_is_conflict() {
        let err = ApiError::from(IssuanceError::TenantChanged {
            draft: 3,
            bound: Some(4),
        });
        assert_eq!(err.code, ErrorCode::Conflict);
        assert!(err.message.contains("start the sale again"));
    }

    #[test]
    fn test_upstream_status_is_relayed() {
        let err = ApiError::from(CatalogError::Upstream(ProxyError::Status {
            route: ProxyRoute::Tickets,
            status: 404,
            details: "not found".to_string(),
        }));
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert_eq!(err.code, ErrorCode::ExternalServiceError);

        let err = ApiError::from(ProxyError::NotConfigured(ProxyRoute::Events));
        assert_eq!(err.status, StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_empty_catalog_is_not_found() {
        let err = ApiError::from(CatalogError::NoTicketsAvailable);
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_validation_error_builder() {
        let mut builder = ValidationErrorBuilder::new();
        builder.add("clientName", "Name is required");
        assert_eq!(builder.check("quantity", Ok::<u32, String>(2)), Some(2));
        assert_eq!(
            builder.check::<u32>("clientDocument", Err("Invalid CPF".to_string())),
            None
        );
        assert!(!builder.is_empty());

        let err = builder.build().unwrap();
        assert_eq!(err.code, ErrorCode::ValidationError);
        assert!(err.message.contains("2 fields"));
        if let Some(ErrorDetails::ValidationErrors(errors)) = &err.details {
            assert_eq!(errors["clientDocument"], vec!["Invalid CPF".to_string()]);
        } else {
            panic!("Expected ValidationErrors details");
        }
    }
}
