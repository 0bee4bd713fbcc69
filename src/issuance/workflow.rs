//! Issuance state machine.
//!
//! ```text
//!   NotStarted --submit--> Processing --reply with code--> Completed
//!                              |
//!                              +--timeout / error / bad reply--> Failed
//!   Completed | Failed --new_sale--> NotStarted
//! ```
//!
//! Everything the machine knows lives in the terminal's persisted state, so
//! a reload (or a second tab) resumes from the stored markers instead of
//! submitting again.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, warn};

use super::{IssuedTicket, SaleDraft};
use crate::api::metrics::record_sale;
use crate::config::IssuanceConfig;
use crate::proxy::{ProxyRoute, Upstream};
use crate::retry::RetryPolicy;
use crate::state::{ClientState, IssuanceMarker, StoreError};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        if let (Ok(mut now), Ok(by)) = (self.now.lock(), chrono::Duration::from_std(by)) {
            *now += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.lock() {
            Ok(now) => *now,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IssuanceAttempt {
    NotStarted,
    Processing { started_at: DateTime<Utc> },
    Completed { ticket: IssuedTicket },
    Failed { message: String },
}

impl IssuanceAttempt {
    pub fn label(&self) -> &'static str {
        match self {
            IssuanceAttempt::NotStarted => "not_started",
            IssuanceAttempt::Processing { .. } => "processing",
            IssuanceAttempt::Completed { .. } => "completed",
            IssuanceAttempt::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IssuanceError {
    #[error(
        "The company of this terminal changed since the sale was prepared. Go back and start the sale again."
    )]
    TenantChanged { draft: i64, bound: Option<i64> },
    #[error(transparent)]
    Store(#[from] StoreError),
}

const MISSING_TICKET: &str = "Issuance status indicates success but no ticket was found";
const STALE_PROCESSING: &str = "Issuance processing timed out";
const BAD_REPLY: &str = "Issuance failed: invalid or incomplete issuance response";

/// Turns a raw failure text into an operator message. When the text embeds a
/// JSON error envelope, its `error`, `missingFields` and `details` win.
pub fn describe_failure(raw: &str) -> String {
    let embedded = match (raw.find('{'), raw.rfind('}')) {
        (Some(start), Some(end)) if start < end => &raw[start..=end],
        _ => return raw.to_string(),
    };
    let Ok(envelope) = serde_json::from_str::<serde_json::Value>(embedded) else {
        return raw.to_string();
    };

    let Some(error) = envelope
        .get("error")
        .and_then(|e| e.as_str())
        .filter(|e| !e.is_empty())
    else {
        return raw.to_string();
    };

    let mut message = error.to_string();
    if let Some(fields) = envelope.get("missingFields").and_then(|f| f.as_array()) {
        let names: Vec<String> = fields
            .iter()
            .map(|f| match f.as_str() {
                Some(s) => s.to_string(),
                None => f.to_string(),
            })
            .collect();
        message.push_str(&format!(": missing fields: {}", names.join(", ")));
    }
    match envelope.get("details") {
        Some(serde_json::Value::String(d)) if !d.is_empty() => {
            message.push_str(&format!(" ({})", d));
        }
        Some(serde_json::Value::Null) | Some(serde_json::Value::String(_)) | None => {}
        Some(other) => message.push_str(&format!(" ({})", other)),
    }
    message
}

pub struct IssuanceWorkflow {
    upstream: Arc<dyn Upstream>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    staleness: Duration,
}

impl IssuanceWorkflow {
    pub fn new(upstream: Arc<dyn Upstream>, clock: Arc<dyn Clock>, config: &IssuanceConfig) -> Self {
        Self {
            upstream,
            clock,
            policy: RetryPolicy::issuance(config.timeout()),
            staleness: config.staleness(),
        }
    }

    /// Refuses a sale prepared for a company other than the terminal's
    /// current binding.
    pub async fn check_tenant(&self, state: &ClientState, company_id: i64) -> Result<(), IssuanceError> {
        let bound = state.company_id().await?;
        if bound == Some(company_id) {
            return Ok(());
        }
        warn!(
            terminal = %state.terminal(),
            draft = company_id,
            bound = ?bound,
            "Refusing sale prepared for another company"
        );
        record_sale("tenant_changed");
        Err(IssuanceError::TenantChanged {
            draft: company_id,
            bound,
        })
    }

    /// Issues `draft` once. Only runs from `NotStarted`; in any other state
    /// it changes nothing and reports the current attempt.
    ///
    /// The upstream call runs on its own task. Missing the deadline or the
    /// caller going away stops the wait, not the call: a reply that arrives
    /// later is still persisted.
    pub async fn submit(
        &self,
        state: &ClientState,
        draft: SaleDraft,
    ) -> Result<IssuanceAttempt, IssuanceError> {
        let current = self.resume(state).await?;
        if current != IssuanceAttempt::NotStarted {
            info!(terminal = %state.terminal(), status = current.label(), "Submit ignored, attempt already exists");
            return Ok(current);
        }
        self.check_tenant(state, draft.company_id).await?;

        let started_at = self.clock.now();
        if !state.claim_processing(started_at).await? {
            info!(terminal = %state.terminal(), "Another tab claimed this issuance");
            return Ok(self.resume(state).await?);
        }
        state.set_draft(&draft).await?;

        let task = tokio::spawn(issue(
            self.upstream.clone(),
            state.clone(),
            draft,
            started_at,
        ));

        match self.policy.race(task).await {
            Ok(Ok(attempt)) => Ok(attempt?),
            Ok(Err(e)) => {
                let message = format!("Issuance failed: {}", e);
                error!(terminal = %state.terminal(), message = %message, "Issuance task died");
                Ok(fail(state, message).await?)
            }
            Err(e) => {
                let message = format!("Issuance failed: {}", e);
                if owns_attempt(state, started_at).await? {
                    error!(terminal = %state.terminal(), message = %message, "Issuance failed");
                    Ok(fail(state, message).await?)
                } else {
                    // The reply landed between the deadline and this check
                    Ok(self.resume(state).await?)
                }
            }
        }
    }

    /// Reconstructs the attempt from persisted state. Never calls upstream.
    pub async fn resume(&self, state: &ClientState) -> Result<IssuanceAttempt, StoreError> {
        match state.issuance_marker().await? {
            Some(IssuanceMarker::Completed) => match state.issued_ticket().await? {
                Some(ticket) => Ok(IssuanceAttempt::Completed { ticket }),
                None => fail(state, MISSING_TICKET.to_string()).await,
            },
            Some(IssuanceMarker::Processing) => {
                let now = self.clock.now();
                let Some(started_at) = state.started_at().await? else {
                    state.set_started_at(now).await?;
                    return Ok(IssuanceAttempt::Processing { started_at: now });
                };

                let elapsed = (now - started_at).to_std().unwrap_or_default();
                if elapsed >= self.staleness {
                    warn!(terminal = %state.terminal(), elapsed_secs = elapsed.as_secs(), "Issuance stuck in processing");
                    fail(state, STALE_PROCESSING.to_string()).await
                } else {
                    Ok(IssuanceAttempt::Processing { started_at })
                }
            }
            None => {
                if let Some(message) = state.failure().await? {
                    return Ok(IssuanceAttempt::Failed { message });
                }
                match state.issued_ticket().await? {
                    Some(ticket) if state.completed_flag().await? => {
                        Ok(IssuanceAttempt::Completed { ticket })
                    }
                    _ => Ok(IssuanceAttempt::NotStarted),
                }
            }
        }
    }

    /// Forgets the current sale. Tenant and last selected event are kept.
    pub async fn new_sale(&self, state: &ClientState) -> Result<(), StoreError> {
        state.clear_issuance().await?;
        info!(terminal = %state.terminal(), "New sale started");
        Ok(())
    }
}

/// Whether the processing marker still belongs to the attempt started at
/// `started_at`.
async fn owns_attempt(state: &ClientState, started_at: DateTime<Utc>) -> Result<bool, StoreError> {
    Ok(state.issuance_marker().await? == Some(IssuanceMarker::Processing)
        && state.started_at().await?.map(|at| at.timestamp_millis())
            == Some(started_at.timestamp_millis()))
}

/// Runs one issuance call and persists what it produced.
///
/// An outcome is only written while the attempt is still the terminal's
/// own: a success may replace a failure that was reported meanwhile (the
/// ticket exists upstream either way), but never a newer sale.
async fn issue(
    upstream: Arc<dyn Upstream>,
    state: ClientState,
    draft: SaleDraft,
    started_at: DateTime<Utc>,
) -> Result<IssuanceAttempt, StoreError> {
    let reply = upstream.call(ProxyRoute::Issuance, draft.to_request()).await;

    let failure = match reply {
        Ok(reply) => match IssuedTicket::from_reply(reply) {
            Some(ticket) => {
                if owns_attempt(&state, started_at).await? || reported_failed(&state).await? {
                    return complete(&state, ticket).await;
                }
                warn!(terminal = %state.terminal(), code = %ticket.code, "Late ticket dropped, a newer sale is in progress");
                return Ok(IssuanceAttempt::Completed { ticket });
            }
            None => BAD_REPLY.to_string(),
        },
        Err(e) => describe_failure(&format!("Issuance failed: {}", e)),
    };

    if !owns_attempt(&state, started_at).await? {
        warn!(terminal = %state.terminal(), message = %failure, "Late issuance failure ignored");
        return Ok(IssuanceAttempt::Failed { message: failure });
    }
    error!(terminal = %state.terminal(), message = %failure, "Issuance failed");
    fail(&state, failure).await
}

async fn reported_failed(state: &ClientState) -> Result<bool, StoreError> {
    Ok(state.issuance_marker().await?.is_none() && state.failure().await?.is_some())
}

async fn complete(state: &ClientState, ticket: IssuedTicket) -> Result<IssuanceAttempt, StoreError> {
    state.mark_completed(&ticket).await?;
    if state.failure().await?.is_some() {
        // The attempt was given up on while the call was still running
        warn!(terminal = %state.terminal(), code = %ticket.code, "Issuance completed after it was reported failed");
        state.clear_failure().await?;
    }
    info!(terminal = %state.terminal(), code = %ticket.code, "Ticket issued");
    record_sale("completed");
    Ok(IssuanceAttempt::Completed { ticket })
}

async fn fail(state: &ClientState, message: String) -> Result<IssuanceAttempt, StoreError> {
    state.clear_processing().await?;
    state.set_failure(&message).await?;
    record_sale("failed");
    Ok(IssuanceAttempt::Failed { message })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issuance::SaleChannel;
    use crate::proxy::ProxyError;
    use crate::state::{MemoryBackend, StateBackend, StateKey};
    use crate::tenant::{SaleMode, TenantBinding};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    enum Reply {
        Ticket(Value),
        Error(ProxyError),
        Hang,
        After(Duration, Value),
    }

    struct FakeIssuance {
        reply: Reply,
        calls: AtomicUsize,
    }

    impl FakeIssuance {
        fn new(reply: Reply) -> Arc<Self> {
            Arc::new(Self {
                reply,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Upstream for FakeIssuance {
        async fn call(&self, route: ProxyRoute, _body: Value) -> Result<Value, ProxyError> {
            assert_eq!(route, ProxyRoute::Issuance);
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.reply {
                Reply::Ticket(v) => Ok(v.clone()),
                Reply::Error(e) => Err(e.clone()),
                Reply::Hang => std::future::pending().await,
                Reply::After(delay, v) => {
                    tokio::time::sleep(*delay).await;
                    Ok(v.clone())
                }
            }
        }
    }

    fn ticket_reply() -> Value {
        json!({
            "code": "ABC12",
            "status": "p",
            "total": "50.00",
            "positions": [],
            "downloads": [{"output": "pdf", "url": "https://t.example.com/ABC12.pdf"}],
        })
    }

    fn draft(company_id: i64) -> SaleDraft {
        SaleDraft {
            company_id,
            event_id: "rock-fest".to_string(),
            ticket_type_id: 7,
            quantity: 1,
            client_name: "Ana".to_string(),
            client_document: "12345678901".to_string(),
            client_document_type: "CPF".to_string(),
            client_birth_date: "1990-01-02".to_string(),
            client_phone: "11999999999".to_string(),
            client_email: None,
            sale_channel: SaleChannel::Local,
            unit_price: 50.0,
            total_price: 50.0,
            mode: SaleMode::Standard,
        }
    }

    struct Harness {
        backend: Arc<MemoryBackend>,
        upstream: Arc<FakeIssuance>,
        clock: Arc<ManualClock>,
        workflow: IssuanceWorkflow,
        state: ClientState,
    }

    async fn harness(reply: Reply) -> Harness {
        let upstream = FakeIssuance::new(reply);
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let workflow =
            IssuanceWorkflow::new(upstream.clone(), clock.clone(), &IssuanceConfig::default());
        let backend = Arc::new(MemoryBackend::new());
        let state = ClientState::new(backend.clone(), "terminal-a");
        state
            .set_tenant_binding(&TenantBinding {
                company_id: 1,
                mode: SaleMode::Standard,
            })
            .await
            .unwrap();
        Harness {
            backend,
            upstream,
            clock,
            workflow,
            state,
        }
    }

    #[tokio::test]
    async fn test_success_persists_ticket_and_resume_is_offline() {
        let h = harness(Reply::Ticket(ticket_reply())).await;

        let attempt = h.workflow.submit(&h.state, draft(1)).await.unwrap();
        let IssuanceAttempt::Completed { ticket } = attempt else {
            panic!("expected completion, got {:?}", attempt);
        };
        assert_eq!(ticket.code, "ABC12");
        assert_eq!(
            h.state.issuance_marker().await.unwrap(),
            Some(IssuanceMarker::Completed)
        );
        assert!(h.state.completed_flag().await.unwrap());
        assert!(h.state.started_at().await.unwrap().is_none());

        // Reload: same ticket, no second network call
        let resumed = h.workflow.resume(&h.state).await.unwrap();
        assert_eq!(resumed, IssuanceAttempt::Completed { ticket });
        assert_eq!(h.upstream.calls(), 1);
    }

    #[tokio::test]
    async fn test_second_submit_is_a_no_op() {
        let h = harness(Reply::Ticket(ticket_reply())).await;
        h.workflow.submit(&h.state, draft(1)).await.unwrap();

        let again = h.workflow.submit(&h.state, draft(1)).await.unwrap();
        assert!(matches!(again, IssuanceAttempt::Completed { .. }));
        assert_eq!(h.upstream.calls(), 1);
    }

    #[tokio::test]
    async fn test_submit_while_processing_does_not_call_upstream() {
        let h = harness(Reply::Ticket(ticket_reply())).await;
        h.state.claim_processing(h.clock.now()).await.unwrap();

        let attempt = h.workflow.submit(&h.state, draft(1)).await.unwrap();
        assert!(matches!(attempt, IssuanceAttempt::Processing { .. }));
        assert_eq!(h.upstream.calls(), 0);
    }

    #[tokio::test]
    async fn test_tenant_change_is_refused_without_network() {
        let h = harness(Reply::Ticket(ticket_reply())).await;
        let prepared = draft(1);
        h.state
            .set_tenant_binding(&TenantBinding {
                company_id: 2,
                mode: SaleMode::Standard,
            })
            .await
            .unwrap();

        let err = h.workflow.submit(&h.state, prepared).await.unwrap_err();
        assert!(matches!(
            err,
            IssuanceError::TenantChanged {
                draft: 1,
                bound: Some(2)
            }
        ));
        assert!(err.to_string().contains("Go back"));
        assert_eq!(h.upstream.calls(), 0);
        assert!(h.state.issuance_marker().await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fails_and_clears_marker() {
        let h = harness(Reply::Hang).await;

        let attempt = h.workflow.submit(&h.state, draft(1)).await.unwrap();
        let IssuanceAttempt::Failed { message } = attempt else {
            panic!("expected failure, got {:?}", attempt);
        };
        assert!(message.contains("60s"));
        assert!(h.state.issuance_marker().await.unwrap().is_none());
        assert!(h.state.started_at().await.unwrap().is_none());

        // Failed survives a reload until a new sale
        assert!(matches!(
            h.workflow.resume(&h.state).await.unwrap(),
            IssuanceAttempt::Failed { .. }
        ));
        h.workflow.new_sale(&h.state).await.unwrap();
        assert_eq!(
            h.workflow.resume(&h.state).await.unwrap(),
            IssuanceAttempt::NotStarted
        );
    }

    #[tokio::test]
    async fn test_reply_without_code_fails() {
        let h = harness(Reply::Ticket(json!({"code": "", "status": "p"}))).await;
        let attempt = h.workflow.submit(&h.state, draft(1)).await.unwrap();
        assert!(matches!(attempt, IssuanceAttempt::Failed { .. }));
        assert!(h.state.issued_ticket().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upstream_error_envelope_becomes_message() {
        let h = harness(Reply::Error(ProxyError::MissingFields {
            route: ProxyRoute::Issuance,
            fields: vec!["clientName", "clientDocument"],
        }))
        .await;

        let attempt = h.workflow.submit(&h.state, draft(1)).await.unwrap();
        assert_eq!(
            attempt,
            IssuanceAttempt::Failed {
                message: "Invalid parameters for ticket issuance: missing fields: clientName, clientDocument"
                    .to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_resume_processing_staleness() {
        let h = harness(Reply::Ticket(ticket_reply())).await;
        h.state.claim_processing(h.clock.now()).await.unwrap();

        h.clock.advance(Duration::from_secs(10));
        assert!(matches!(
            h.workflow.resume(&h.state).await.unwrap(),
            IssuanceAttempt::Processing { .. }
        ));

        h.clock.advance(Duration::from_secs(25));
        assert_eq!(
            h.workflow.resume(&h.state).await.unwrap(),
            IssuanceAttempt::Failed {
                message: STALE_PROCESSING.to_string()
            }
        );
        assert!(h.state.issuance_marker().await.unwrap().is_none());
        assert_eq!(h.upstream.calls(), 0);
    }

    #[tokio::test]
    async fn test_resume_processing_without_timestamp_stamps_now() {
        let h = harness(Reply::Ticket(ticket_reply())).await;
        h.backend
            .set("terminal-a", StateKey::IssuanceStatus, "processing")
            .await
            .unwrap();

        let attempt = h.workflow.resume(&h.state).await.unwrap();
        assert_eq!(
            attempt,
            IssuanceAttempt::Processing {
                started_at: h.clock.now()
            }
        );
        assert!(h.state.started_at().await.unwrap().is_some());
        assert_eq!(h.upstream.calls(), 0);
    }

    #[tokio::test]
    async fn test_completed_marker_without_ticket_fails() {
        let h = harness(Reply::Ticket(ticket_reply())).await;
        h.backend
            .set("terminal-a", StateKey::IssuanceStatus, "completed")
            .await
            .unwrap();

        assert_eq!(
            h.workflow.resume(&h.state).await.unwrap(),
            IssuanceAttempt::Failed {
                message: MISSING_TICKET.to_string()
            }
        );
        assert!(h.state.issuance_marker().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_late_success_overrides_stale_failure() {
        let h = harness(Reply::Ticket(ticket_reply())).await;
        let ticket = IssuedTicket::from_reply(ticket_reply()).unwrap();
        h.state.set_failure(STALE_PROCESSING).await.unwrap();

        let attempt = complete(&h.state, ticket.clone()).await.unwrap();
        assert_eq!(attempt, IssuanceAttempt::Completed { ticket });
        assert!(h.state.failure().await.unwrap().is_none());
        assert!(matches!(
            h.workflow.resume(&h.state).await.unwrap(),
            IssuanceAttempt::Completed { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_after_deadline_is_still_persisted() {
        let h = harness(Reply::After(Duration::from_secs(90), ticket_reply())).await;

        let attempt = h.workflow.submit(&h.state, draft(1)).await.unwrap();
        assert!(matches!(attempt, IssuanceAttempt::Failed { .. }));

        tokio::time::sleep(Duration::from_secs(40)).await;
        let IssuanceAttempt::Completed { ticket } = h.workflow.resume(&h.state).await.unwrap() else {
            panic!("late ticket was not persisted");
        };
        assert_eq!(ticket.code, "ABC12");
        assert!(h.state.failure().await.unwrap().is_none());
        assert_eq!(h.upstream.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_reply_does_not_replace_newer_sale() {
        let h = harness(Reply::After(Duration::from_secs(90), ticket_reply())).await;

        h.workflow.submit(&h.state, draft(1)).await.unwrap();
        h.workflow.new_sale(&h.state).await.unwrap();

        tokio::time::sleep(Duration::from_secs(40)).await;
        assert_eq!(
            h.workflow.resume(&h.state).await.unwrap(),
            IssuanceAttempt::NotStarted
        );
        assert!(h.state.issued_ticket().await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_caller_does_not_cancel_issuance() {
        let h = harness(Reply::After(Duration::from_secs(5), ticket_reply())).await;

        // The request goes away after a second, well before the reply
        let waited =
            tokio::time::timeout(Duration::from_secs(1), h.workflow.submit(&h.state, draft(1))).await;
        assert!(waited.is_err());
        assert!(matches!(
            h.workflow.resume(&h.state).await.unwrap(),
            IssuanceAttempt::Processing { .. }
        ));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(matches!(
            h.workflow.resume(&h.state).await.unwrap(),
            IssuanceAttempt::Completed { .. }
        ));
        assert_eq!(h.upstream.calls(), 1);
    }

    #[test]
    fn test_describe_failure() {
        assert_eq!(describe_failure("plain failure"), "plain failure");
        assert_eq!(
            describe_failure(r#"Issuance failed: 502 - {"error":"Ticket issuance failed: 502","details":"gateway down"}"#),
            "Ticket issuance failed: 502 (gateway down)"
        );
        assert_eq!(
            describe_failure(r#"x {"error":"Bad","missingFields":["cpf"]} y"#),
            "Bad: missing fields: cpf"
        );
        // Embedded JSON without an error field keeps the raw text
        assert_eq!(describe_failure(r#"oops {"details":"d"}"#), r#"oops {"details":"d"}"#);
        assert_eq!(describe_failure("broken {json"), "broken {json");
    }
}
