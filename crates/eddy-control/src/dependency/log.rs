//! Per-application resolution log with replay for late subscribers.

use std::sync::Arc;

use dashmap::DashMap;

use crate::hooks::Notifier;
use crate::types::ApplicationId;

/// Buffers resolution output per application and forwards it to a [`Notifier`].
///
/// Lines are only published for applications someone is tailing. A tail
/// registered mid-resolution receives the buffered history once, on the next
/// emitted line, and live lines after that.
pub struct ResolutionLog {
    notifier: Arc<dyn Notifier>,
    topic: String,
    buffers: DashMap<ApplicationId, Vec<String>>,
    // `true` while a tail is waiting for the buffered history.
    tails: DashMap<ApplicationId, bool>,
}

impl ResolutionLog {
    /// Create a log publishing to `{topic}/{application id}`.
    pub fn new(notifier: Arc<dyn Notifier>, topic: impl Into<String>) -> Self {
        Self {
            notifier,
            topic: topic.into(),
            buffers: DashMap::new(),
            tails: DashMap::new(),
        }
    }

    /// Register interest in an application's output, replaying from the beginning.
    pub fn tail(&self, app_id: &ApplicationId) {
        self.tails.insert(app_id.clone(), true);
    }

    /// Record a line for an application.
    pub fn emit(&self, app_id: &ApplicationId, line: &str) {
        let mut buffer = self.buffers.entry(app_id.clone()).or_default();
        buffer.push(line.to_owned());

        let Some(mut replay) = self.tails.get_mut(app_id) else {
            return;
        };
        let topic = format!("{}/{}", self.topic, app_id);
        if *replay {
            *replay = false;
            for buffered in buffer.iter() {
                self.notifier.publish(&topic, buffered);
            }
        } else {
            self.notifier.publish(&topic, line);
        }
    }

    /// Drop the buffer and any tail for an application.
    pub fn finish(&self, app_id: &ApplicationId) {
        self.buffers.remove(app_id);
        self.tails.remove(app_id);
    }

    /// Number of applications with buffered output.
    #[must_use]
    pub fn active(&self) -> usize {
        self.buffers.len()
    }
}
