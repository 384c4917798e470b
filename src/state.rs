//! Shared application state.

use crate::modal::FormOpener;
use crate::pipeline::Stages;
use crate::registry::LanguageRegistry;
use std::sync::Arc;

/// Everything the HTTP handlers need. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub registry: LanguageRegistry,
    pub signing_secret: Arc<str>,
    pub stages: Arc<Stages>,
    pub forms: Arc<dyn FormOpener>,
    /// Enables the stage entry points when set.
    pub stage_token: Option<Arc<str>>,
}
