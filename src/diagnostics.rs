//! Diagnostics sink.
//!
//! Subscribers registered on a [`Diagnostics`] receive every event of the
//! operations it is handed to, in registration order. Clones share one
//! subscriber list, so a sink can be registered once and passed to any number
//! of transfers.

use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Events broadcast to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DfuEvent {
    /// Milestone or informational message.
    Message(String),
    /// Firmware bytes written so far.
    Progress { sent: usize, total: usize },
    /// Failure that ended the current operation.
    Error(String),
}

impl fmt::Display for DfuEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DfuEvent::Message(message) => write!(f, "{}", message),
            DfuEvent::Progress { sent, total } => write!(f, "transferred: {}/{}", sent, total),
            DfuEvent::Error(message) => write!(f, "{}", message),
        }
    }
}

/// Handle returned by [`Diagnostics::add_logger`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

type Logger = Arc<dyn Fn(&DfuEvent) + Send + Sync>;

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    loggers: Vec<(SubscriberId, Logger)>,
}

#[derive(Clone, Default)]
pub struct Diagnostics {
    subscribers: Arc<RwLock<Subscribers>>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_logger<F>(&self, logger: F) -> SubscriberId
    where
        F: Fn(&DfuEvent) + Send + Sync + 'static,
    {
        let mut subscribers = self.write();
        let id = SubscriberId(subscribers.next_id);
        subscribers.next_id += 1;
        subscribers.loggers.push((id, Arc::new(logger)));
        id
    }

    /// Returns false if `id` was not registered.
    pub fn remove_logger(&self, id: SubscriberId) -> bool {
        let mut subscribers = self.write();
        let before = subscribers.loggers.len();
        subscribers.loggers.retain(|(existing, _)| *existing != id);
        subscribers.loggers.len() != before
    }

    pub fn clear(&self) {
        self.write().loggers.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.read().loggers.len()
    }

    pub fn emit(&self, event: DfuEvent) {
        match &event {
            DfuEvent::Message(message) => tracing::debug!("{}", message),
            DfuEvent::Progress { sent, total } => tracing::trace!(sent, total, "Progress"),
            DfuEvent::Error(message) => tracing::error!("{}", message),
        }
        // Snapshot so loggers may (un)register while being called.
        let loggers: Vec<Logger> = self.read().loggers.iter().map(|(_, l)| Arc::clone(l)).collect();
        for logger in loggers {
            logger(&event);
        }
    }

    pub fn log(&self, message: impl Into<String>) {
        self.emit(DfuEvent::Message(message.into()));
    }

    pub fn error(&self, message: impl Into<String>) {
        self.emit(DfuEvent::Error(message.into()));
    }

    fn read(&self) -> RwLockReadGuard<'_, Subscribers> {
        self.subscribers.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Subscribers> {
        self.subscribers.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Diagnostics")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
