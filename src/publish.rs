//! Boundaries through which the device hands data and failures to the rest of the system.

use crate::records::Record;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Receives every decoded record. Must return promptly: the poll loop calls it inline.
pub trait Publisher: Send + Sync {
    fn publish(&self, record: Record);
}

/// Receives failures that the owning system has to react to.
pub trait Lifecycle: Send + Sync {
    /// A failure that should move the owning system into its fault state.
    fn report_fault(&self, message: &str);
    /// A transient failure that is surfaced but does not change the lifecycle state.
    fn report_recoverable_error(&self, message: &str);
}

impl<P: Publisher + ?Sized> Publisher for Arc<P> {
    fn publish(&self, record: Record) {
        (**self).publish(record)
    }
}

impl<L: Lifecycle + ?Sized> Lifecycle for Arc<L> {
    fn report_fault(&self, message: &str) {
        (**self).report_fault(message)
    }

    fn report_recoverable_error(&self, message: &str) {
        (**self).report_recoverable_error(message)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    pub at: jiff::Timestamp,
    pub kind: EventKind,
}

#[derive(Clone, Debug, PartialEq, strum::IntoStaticStr)]
#[strum(serialize_all = "camelCase")]
pub enum EventKind {
    Record(Record),
    RecoverableError(String),
    Fault(String),
}

impl Event {
    fn now(kind: EventKind) -> Self {
        Self { at: jiff::Timestamp::now(), kind }
    }

    /// Name of the record, or `recoverableError`/`fault`.
    pub fn name(&self) -> &'static str {
        match &self.kind {
            EventKind::Record(record) => record.name(),
            other => other.into(),
        }
    }

    /// The record's fields, or `{"message": ...}` for failures.
    pub fn payload(&self) -> Result<serde_json::Value, serde_json::Error> {
        match &self.kind {
            EventKind::Record(record) => serde_json::to_value(record),
            EventKind::RecoverableError(message) | EventKind::Fault(message) => {
                Ok(serde_json::json!({ "message": message }))
            }
        }
    }

    pub fn record(&self) -> Option<&Record> {
        match &self.kind {
            EventKind::Record(record) => Some(record),
            _ => None,
        }
    }
}

/// Forwards everything into an unbounded channel. Sending never blocks, and events are dropped
/// silently once the receiver is gone.
#[derive(Clone)]
pub struct EventSender(mpsc::UnboundedSender<Event>);

pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

pub fn channel() -> (EventSender, EventReceiver) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (EventSender(sender), receiver)
}

impl EventSender {
    fn send(&self, kind: EventKind) {
        let _ignore_no_receivers = self.0.send(Event::now(kind));
    }
}

impl Publisher for EventSender {
    fn publish(&self, record: Record) {
        self.send(EventKind::Record(record));
    }
}

impl Lifecycle for EventSender {
    fn report_fault(&self, message: &str) {
        self.send(EventKind::Fault(message.to_string()));
    }

    fn report_recoverable_error(&self, message: &str) {
        self.send(EventKind::RecoverableError(message.to_string()));
    }
}

/// Reports failures through `tracing` only.
#[derive(Clone, Copy, Default)]
pub struct TracingLifecycle;

impl Lifecycle for TracingLifecycle {
    fn report_fault(&self, message: &str) {
        tracing::error!("fault: {message}");
    }

    fn report_recoverable_error(&self, message: &str) {
        tracing::warn!("recoverable error: {message}");
    }
}
