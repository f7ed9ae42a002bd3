use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::trigger::AppliedPatch;

const CHANNEL_CAPACITY: usize = 256;

/// Per-project broadcast of patches written by the validator.
pub struct NotifyHub {
    channels: DashMap<String, broadcast::Sender<AppliedPatch>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a project's patches. Creates the channel if needed.
    pub fn subscribe(&self, project_id: &str) -> broadcast::Receiver<AppliedPatch> {
        self.channels
            .entry(project_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// No-op if nobody is listening.
    pub fn send(&self, applied: &AppliedPatch) {
        if let Some(sender) = self.channels.get(&applied.project_id) {
            let _ = sender.send(applied.clone());
        }
    }

    /// Drop a project's channel, e.g. once its last item is gone.
    /// Existing receivers see the channel close.
    pub fn remove(&self, project_id: &str) {
        self.channels.remove(project_id);
    }
}
