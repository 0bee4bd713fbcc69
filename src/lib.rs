pub mod api;
pub mod catalog;
pub mod config;
pub mod db;
pub mod identity;
pub mod issuance;
pub mod pdf;
pub mod proxy;
pub mod retry;
pub mod startup;
pub mod state;
pub mod tenant;

pub use db::DbPool;

use config::Config;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::Duration;

use crate::catalog::CatalogClient;
use crate::identity::{IdentityProvider, SupabaseIdentity};
use crate::issuance::{Clock, IssuanceSubmitter, IssuanceWorkflow, SystemClock};
use crate::pdf::{DocumentProbe, HttpProbe, PdfPoller};
use crate::proxy::{Forwarder, Upstream};
use crate::state::{ClientState, SqliteBackend, StateBackend};
use crate::tenant::TenantResolver;

pub struct AppState {
    pub config: Config,
    pub db: DbPool,
    pub backend: Arc<dyn StateBackend>,
    pub identity: Arc<dyn IdentityProvider>,
    pub upstream: Arc<dyn Upstream>,
    pub resolver: TenantResolver,
    pub catalog: Arc<CatalogClient>,
    pub workflow: Arc<IssuanceWorkflow>,
    pub submitter: IssuanceSubmitter,
    pub pdf: PdfPoller,
    pub metrics_handle: Option<PrometheusHandle>,
}

/// Outbound collaborators, swappable in tests.
pub struct Services {
    pub backend: Arc<dyn StateBackend>,
    pub identity: Arc<dyn IdentityProvider>,
    pub upstream: Arc<dyn Upstream>,
    pub probe: Arc<dyn DocumentProbe>,
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    /// Wires the production services: SQLite-backed client state and HTTP
    /// clients for the identity backend, the ticketing platform and PDF probes.
    pub fn new(config: Config, db: DbPool) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.upstream.request_timeout_secs))
            .user_agent(concat!("boxoffice/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let services = Services {
            backend: Arc::new(SqliteBackend::new(db.clone())),
            identity: Arc::new(SupabaseIdentity::new(&config.identity, client.clone())),
            upstream: Arc::new(Forwarder::new(config.upstream.clone(), client.clone())),
            probe: Arc::new(HttpProbe::new(client, config.pdf.status_url.clone())),
            clock: Arc::new(SystemClock),
        };
        Ok(Self::with_services(config, db, services))
    }

    pub fn with_services(config: Config, db: DbPool, services: Services) -> Self {
        let Services {
            backend,
            identity,
            upstream,
            probe,
            clock,
        } = services;

        let catalog = Arc::new(CatalogClient::new(upstream.clone()));
        let workflow = Arc::new(IssuanceWorkflow::new(
            upstream.clone(),
            clock,
            &config.issuance,
        ));
        let submitter = IssuanceSubmitter::new(catalog.clone(), workflow.clone());
        let pdf = PdfPoller::new(probe, &config.pdf);

        Self {
            resolver: TenantResolver::new(identity.clone()),
            config,
            db,
            backend,
            identity,
            upstream,
            catalog,
            workflow,
            submitter,
            pdf,
            metrics_handle: None,
        }
    }

    /// Set the Prometheus metrics handle
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }

    /// State facade of one operator terminal.
    pub fn terminal(&self, terminal_id: &str) -> ClientState {
        ClientState::new(self.backend.clone(), terminal_id)
    }
}
