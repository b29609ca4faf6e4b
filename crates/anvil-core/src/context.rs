use crate::config::EngineConfig;
use crate::events::EventBus;
use crate::types::BuildId;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// The explicitly-threaded singleton state of one engine instance: the
/// configuration and the event bus. Constructed once at startup and passed
/// down; there are no ambient globals.
#[derive(Clone)]
pub struct CoreContext {
    pub config: Arc<EngineConfig>,
    pub bus: Arc<EventBus>,
    pub build_id: BuildId,
    pub started_at: DateTime<Utc>,
}

impl CoreContext {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config: Arc::new(config),
            bus: Arc::new(EventBus::new()),
            build_id: Uuid::new_v4(),
            started_at: Utc::now(),
        }
    }

    /// A fresh build id for the next invocation; the config and bus carry
    /// over, per-build state does not.
    pub fn next_build(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            bus: Arc::clone(&self.bus),
            build_id: Uuid::new_v4(),
            started_at: Utc::now(),
        }
    }
}
