//! PDF availability poller.
//!
//! Ticket documents are rendered asynchronously after issuance. The poller
//! checks readiness a bounded number of times with a fixed delay, surfaces a
//! few progress notices along the way and then tells the terminal to open the
//! document. Ambiguous answers count as ready so the operator is never stuck
//! waiting on a probe.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::PdfConfig;
use crate::retry::{Fallback, RetryPolicy};
use crate::state::{ClientState, StoreError};

const NOTICE_UNAVAILABLE: &str = "No PDF available for download";
const NOTICE_EXHAUSTED: &str = "The PDF is taking longer than expected, opening it anyway";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentStatus {
    Ready,
    Processing,
    Unknown,
}

#[async_trait]
pub trait DocumentProbe: Send + Sync {
    /// Never fails: anything the probe cannot interpret is `Unknown`.
    async fn check(&self, url: &str) -> DocumentStatus;
}

/// Document identifier: last path segment of the URL without a `.pdf` suffix.
pub fn pdf_id(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let segment = parsed.path_segments()?.filter(|s| !s.is_empty()).last()?;
    let id = segment.strip_suffix(".pdf").unwrap_or(segment);
    (!id.is_empty()).then(|| id.to_string())
}

#[derive(Debug, Deserialize)]
struct StatusReply {
    status: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Asks a status endpoint when one is configured, otherwise issues a `HEAD`
/// against the document itself.
pub struct HttpProbe {
    client: reqwest::Client,
    status_url: Option<String>,
}

impl HttpProbe {
    pub fn new(client: reqwest::Client, status_url: Option<String>) -> Self {
        Self { client, status_url }
    }

    async fn ask_status_endpoint(&self, status_url: &str, url: &str) -> DocumentStatus {
        let Some(id) = pdf_id(url) else {
            warn!(url = %url, "Cannot derive a PDF id from the document URL");
            return DocumentStatus::Unknown;
        };

        let response = match self
            .client
            .post(status_url)
            .json(&serde_json::json!({ "pdfId": id, "url": url }))
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                debug!(status = response.status().as_u16(), "PDF status endpoint error");
                return DocumentStatus::Unknown;
            }
            Err(e) => {
                debug!(error = %e, "PDF status endpoint unreachable");
                return DocumentStatus::Unknown;
            }
        };

        match response.json::<StatusReply>().await {
            Ok(reply) => match reply.status.as_deref() {
                Some("ready") => DocumentStatus::Ready,
                Some("processing") => DocumentStatus::Processing,
                _ => {
                    debug!(message = ?reply.message, "Unexpected PDF status");
                    DocumentStatus::Unknown
                }
            },
            Err(_) => DocumentStatus::Unknown,
        }
    }

    async fn head_document(&self, url: &str) -> DocumentStatus {
        match self.client.head(url).send().await {
            Ok(response) => match response.status().as_u16() {
                // Accepted, Not Found, Conflict, Too Early
                202 | 404 | 409 | 425 => DocumentStatus::Processing,
                200..=299 => DocumentStatus::Ready,
                _ => DocumentStatus::Unknown,
            },
            Err(e) => {
                debug!(error = %e, "PDF HEAD failed");
                DocumentStatus::Unknown
            }
        }
    }
}

#[async_trait]
impl DocumentProbe for HttpProbe {
    async fn check(&self, url: &str) -> DocumentStatus {
        match &self.status_url {
            Some(status_url) => self.ask_status_endpoint(status_url, url).await,
            None => self.head_document(url).await,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenAction {
    /// Show the document in a new tab.
    Open,
    /// Save the file; used when the same document is requested again.
    Download,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PdfOutcome {
    pub opened: bool,
    pub url: Option<String>,
    pub action: Option<OpenAction>,
    pub attempts: u32,
    /// False when the document was opened on a guess (unknown status or
    /// exhausted retries).
    pub confirmed_ready: bool,
    pub notices: Vec<String>,
}

impl PdfOutcome {
    fn unavailable() -> Self {
        Self {
            opened: false,
            url: None,
            action: None,
            attempts: 0,
            confirmed_ready: false,
            notices: vec![NOTICE_UNAVAILABLE.to_string()],
        }
    }
}

fn milestone_notice(attempt: u32, policy: &RetryPolicy) -> &'static str {
    if attempt == 0 {
        "Please wait, the PDF is being generated..."
    } else if attempt == policy.max_attempts / 3 {
        "Still generating your PDF, please wait..."
    } else {
        "The PDF is almost ready..."
    }
}

pub struct PdfPoller {
    probe: Arc<dyn DocumentProbe>,
    policy: RetryPolicy,
}

impl PdfPoller {
    pub fn new(probe: Arc<dyn DocumentProbe>, config: &PdfConfig) -> Self {
        Self {
            probe,
            policy: RetryPolicy::pdf(config.max_attempts, config.retry_delay()),
        }
    }

    pub async fn open(
        &self,
        state: &ClientState,
        url: Option<&str>,
    ) -> Result<PdfOutcome, StoreError> {
        let Some(url) = url.filter(|u| !u.trim().is_empty()) else {
            info!(terminal = %state.terminal(), "No PDF to open");
            return Ok(PdfOutcome::unavailable());
        };

        let action = if state.last_pdf_url().await?.as_deref() == Some(url) {
            OpenAction::Download
        } else {
            OpenAction::Open
        };
        state.set_last_pdf_url(url).await?;

        let mut notices = Vec::new();
        for attempt in 0..self.policy.max_attempts {
            let status = self.probe.check(url).await;
            debug!(attempt, status = ?status, "PDF readiness check");

            if status != DocumentStatus::Processing {
                return Ok(PdfOutcome {
                    opened: true,
                    url: Some(url.to_string()),
                    action: Some(action),
                    attempts: attempt + 1,
                    confirmed_ready: status == DocumentStatus::Ready,
                    notices,
                });
            }

            if self.policy.is_milestone(attempt) {
                let notice = milestone_notice(attempt, &self.policy);
                info!(terminal = %state.terminal(), attempt, "{}", notice);
                notices.push(notice.to_string());
            }
            if !self.policy.is_last_attempt(attempt) {
                tokio::time::sleep(self.policy.delay_for_attempt(attempt)).await;
            }
        }

        warn!(terminal = %state.terminal(), url = %url, "PDF still processing after all attempts");
        let opened = self.policy.fallback == Fallback::Proceed;
        notices.push(NOTICE_EXHAUSTED.to_string());
        Ok(PdfOutcome {
            opened,
            url: Some(url.to_string()),
            action: opened.then_some(action),
            attempts: self.policy.max_attempts,
            confirmed_ready: false,
            notices,
        })
    }
}
