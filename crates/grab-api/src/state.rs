use std::sync::Arc;

use grab_core::{AdmissionControl, Orchestrator};

use crate::metrics::Metrics;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub admission: AdmissionControl,
    pub metrics: Arc<Metrics>,
    /// Bearer token for `/admin` routes. Admin routes refuse every request when unset.
    pub admin_token: Option<String>,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
            admission: AdmissionControl::default(),
            metrics: Arc::new(Metrics::new()),
            admin_token: None,
        }
    }

    pub fn with_admission(mut self, admission: AdmissionControl) -> Self {
        self.admission = admission;
        self
    }

    pub fn with_admin_token(mut self, token: impl Into<String>) -> Self {
        self.admin_token = Some(token.into());
        self
    }
}
