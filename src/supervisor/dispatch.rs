//! Event delivery to subscribers.
//!
//! Producers (the reader thread, the caller thread) only ever post into an
//! unbounded channel. Subscriber callbacks run exclusively inside
//! [`EventPump`], on whichever single context the owner drives it from, so
//! callbacks are never invoked concurrently.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;

use crate::protocol::{ClassifiedEvent, ProgressUpdate};

/// Notification delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorEvent {
    /// Overall progress changed.
    Progress(ProgressUpdate),
    /// The generator reported a phase.
    Status { message: String },
    /// The generator finished and wrote its assets.
    Complete {
        primary_output: Option<String>,
        secondary_output: Option<String>,
        raw_line: String,
    },
    /// The generator or the supervisor reported a failure.
    Error {
        message: String,
        error_kind: String,
        raw_line: String,
    },
    /// Informational or debug message from the generator.
    Info { message: String },
    /// The session ended. Fired exactly once per session, whatever the cause.
    ProcessFinished,
}

impl SupervisorEvent {
    /// Build an error notification that did not come from the child's output.
    #[must_use]
    pub fn error(message: impl Into<String>, error_kind: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            error_kind: error_kind.into(),
            raw_line: String::new(),
        }
    }

    /// Convert a classified line into a notification. Unrecognized lines have none.
    #[must_use]
    pub fn from_classified(event: ClassifiedEvent) -> Option<Self> {
        match event {
            ClassifiedEvent::Status { message } => Some(Self::Status { message }),
            ClassifiedEvent::Progress(update) => Some(Self::Progress(update)),
            ClassifiedEvent::Complete {
                primary_output,
                secondary_output,
                raw_line,
            } => Some(Self::Complete {
                primary_output,
                secondary_output,
                raw_line,
            }),
            ClassifiedEvent::Error {
                message,
                error_kind,
                raw_line,
            } => Some(Self::Error {
                message,
                error_kind,
                raw_line,
            }),
            ClassifiedEvent::Info { message } | ClassifiedEvent::Debug { message } => {
                Some(Self::Info { message })
            }
            ClassifiedEvent::Unrecognized { .. } => None,
        }
    }

    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Progress(_) => EventKind::Progress,
            Self::Status { .. } => EventKind::Status,
            Self::Complete { .. } => EventKind::Complete,
            Self::Error { .. } => EventKind::Error,
            Self::Info { .. } => EventKind::Info,
            Self::ProcessFinished => EventKind::ProcessFinished,
        }
    }
}

/// Event category used for subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Progress,
    Status,
    Complete,
    Error,
    Info,
    ProcessFinished,
}

/// Identifies a subscription for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback = Arc<dyn Fn(&SupervisorEvent) + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    kind: Option<EventKind>,
    callback: Callback,
}

/// Registry of subscriber callbacks, shared by the dispatcher and the pump.
#[derive(Default)]
pub struct Subscribers {
    next_id: AtomicU64,
    entries: Mutex<Vec<Subscription>>,
}

impl std::fmt::Debug for Subscribers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscribers")
            .field("count", &self.len())
            .finish()
    }
}

impl Subscribers {
    fn insert(&self, kind: Option<EventKind>, callback: Callback) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscription { id, kind, callback });
        id
    }

    /// Subscribe to one category of events.
    pub fn subscribe<F>(&self, kind: EventKind, callback: F) -> SubscriptionId
    where
        F: Fn(&SupervisorEvent) + Send + Sync + 'static,
    {
        self.insert(Some(kind), Arc::new(callback))
    }

    /// Subscribe to every event.
    pub fn subscribe_all<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&SupervisorEvent) + Send + Sync + 'static,
    {
        self.insert(None, Arc::new(callback))
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|s| s.id != id);
        entries.len() != before
    }

    /// Number of registered subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn on_progress<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&ProgressUpdate) + Send + Sync + 'static,
    {
        self.subscribe(EventKind::Progress, move |event| {
            if let SupervisorEvent::Progress(update) = event {
                callback(update);
            }
        })
    }

    pub fn on_status<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.subscribe(EventKind::Status, move |event| {
            if let SupervisorEvent::Status { message } = event {
                callback(message);
            }
        })
    }

    /// Callback receives the primary path, the secondary path and the raw line.
    pub fn on_complete<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(Option<&str>, Option<&str>, &str) + Send + Sync + 'static,
    {
        self.subscribe(EventKind::Complete, move |event| {
            if let SupervisorEvent::Complete {
                primary_output,
                secondary_output,
                raw_line,
            } = event
            {
                callback(
                    primary_output.as_deref(),
                    secondary_output.as_deref(),
                    raw_line,
                );
            }
        })
    }

    /// Callback receives the message, the error kind and the raw line.
    pub fn on_error<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&str, &str, &str) + Send + Sync + 'static,
    {
        self.subscribe(EventKind::Error, move |event| {
            if let SupervisorEvent::Error {
                message,
                error_kind,
                raw_line,
            } = event
            {
                callback(message, error_kind, raw_line);
            }
        })
    }

    pub fn on_info<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.subscribe(EventKind::Info, move |event| {
            if let SupervisorEvent::Info { message } = event {
                callback(message);
            }
        })
    }

    pub fn on_process_finished<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.subscribe(EventKind::ProcessFinished, move |_| callback())
    }

    /// Invoke every matching callback. The registry lock is not held while
    /// callbacks run, so callbacks may subscribe, unsubscribe or stop the manager.
    fn deliver(&self, event: &SupervisorEvent) {
        let kind = event.kind();
        let callbacks: Vec<Callback> = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| s.kind.map_or(true, |k| k == kind))
            .map(|s| Arc::clone(&s.callback))
            .collect();
        for callback in callbacks {
            callback(event);
        }
    }
}

/// Producer side: posts events toward the pump from any thread.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    tx: mpsc::UnboundedSender<SupervisorEvent>,
    subscribers: Arc<Subscribers>,
}

impl EventDispatcher {
    /// Create a dispatcher and the pump that delivers its events.
    #[must_use]
    pub fn channel() -> (Self, EventPump) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscribers = Arc::new(Subscribers::default());
        (
            Self {
                tx,
                subscribers: Arc::clone(&subscribers),
            },
            EventPump { rx, subscribers },
        )
    }

    /// Queue an event for delivery on the consumer context.
    pub fn post(&self, event: SupervisorEvent) {
        tracing::trace!(?event, "Posting event");
        if self.tx.send(event).is_err() {
            tracing::debug!("Event pump dropped, discarding event");
        }
    }

    /// The subscriber registry.
    #[must_use]
    pub fn subscribers(&self) -> &Arc<Subscribers> {
        &self.subscribers
    }
}

/// Consumer side: delivers queued events to subscribers on the context that
/// drives it, either by calling [`EventPump::drain`] from a UI tick or by
/// spawning [`EventPump::run`] as a task.
#[derive(Debug)]
pub struct EventPump {
    rx: mpsc::UnboundedReceiver<SupervisorEvent>,
    subscribers: Arc<Subscribers>,
}

impl EventPump {
    /// Deliver every event queued so far. Returns how many were delivered.
    pub fn drain(&mut self) -> usize {
        let mut delivered = 0;
        while let Ok(event) = self.rx.try_recv() {
            self.subscribers.deliver(&event);
            delivered += 1;
        }
        delivered
    }

    /// Wait for the next event and deliver it. Returns `None` once every
    /// dispatcher has been dropped and the queue is empty.
    pub async fn next(&mut self) -> Option<SupervisorEvent> {
        let event = self.rx.recv().await?;
        self.subscribers.deliver(&event);
        Some(event)
    }

    /// Deliver events until every dispatcher has been dropped.
    pub async fn run(mut self) {
        while self.next().await.is_some() {}
        tracing::debug!("Event pump finished");
    }

    /// The subscriber registry.
    #[must_use]
    pub fn subscribers(&self) -> &Arc<Subscribers> {
        &self.subscribers
    }
}
