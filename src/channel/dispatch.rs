//! Inbound event demultiplexing.
//!
//! Frames are routed by their `type` tag to every handler registered for that
//! tag, then to every [`Topic::AnyMessage`] handler. Connection lifecycle
//! events use the reserved topics and are emitted by the channel worker.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{error, warn};

use crate::channel::proto::{Frame, FrameError, Topic};

/// Error type handlers may return.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
/// Return type of every subscriber callback.
pub type HandlerResult = Result<(), HandlerError>;

type Handler = Arc<dyn Fn(&ChannelEvent) -> HandlerResult + Send + Sync>;

/// Event delivered to subscribers.
#[derive(Clone, Debug, PartialEq)]
pub enum ChannelEvent {
    /// The channel became live on `path`.
    Connected { path: String },
    /// The live connection on `path` went away.
    Disconnected { path: String },
    /// Automatic reconnection to `path` stopped after `attempts` reattempts.
    ReconnectExhausted { path: String, attempts: u32 },
    /// An inbound frame.
    Message(Frame),
}

impl ChannelEvent {
    /// Returns the frame for [`ChannelEvent::Message`].
    pub fn frame(&self) -> Option<&Frame> {
        match self {
            Self::Message(frame) => Some(frame),
            _ => None,
        }
    }

    fn topic(&self) -> Topic {
        match self {
            Self::Connected { .. } => Topic::Connected,
            Self::Disconnected { .. } => Topic::Disconnected,
            Self::ReconnectExhausted { .. } => Topic::ReconnectExhausted,
            Self::Message(frame) => Topic::Tag(frame.tag().to_string()),
        }
    }
}

/// Handle identifying one registration.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct SubscriptionId(u64);

/// Outcome of delivering one event.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DispatchReport {
    /// Handlers that were called.
    pub invoked: usize,
    /// Handlers that returned an error or panicked.
    pub failed: usize,
}

struct Subscription {
    id: SubscriptionId,
    handler: Handler,
}

/// Topic to handler registry shared by the client handle and the worker.
#[derive(Default)]
pub struct Dispatcher {
    registry: RwLock<HashMap<Topic, Vec<Subscription>>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        let counts: HashMap<&Topic, usize> = registry
            .iter()
            .map(|(topic, subscriptions)| (topic, subscriptions.len()))
            .collect();
        f.debug_struct("Dispatcher").field("handlers", &counts).finish()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `topic`. Handlers for one topic run in
    /// registration order.
    pub fn subscribe<F>(&self, topic: impl Into<Topic>, handler: F) -> SubscriptionId
    where
        F: Fn(&ChannelEvent) -> HandlerResult + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        registry
            .entry(topic.into())
            .or_default()
            .push(Subscription {
                id,
                handler: Arc::new(handler),
            });
        id
    }

    /// Removes one registration, or every registration of `topic` when `id`
    /// is `None`. Returns how many handlers were removed.
    pub fn unsubscribe(&self, topic: &Topic, id: Option<SubscriptionId>) -> usize {
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        let Some(id) = id else {
            return registry.remove(topic).map_or(0, |removed| removed.len());
        };

        let Some(subscriptions) = registry.get_mut(topic) else {
            return 0;
        };
        let before = subscriptions.len();
        subscriptions.retain(|subscription| subscription.id != id);
        let removed = before - subscriptions.len();
        if subscriptions.is_empty() {
            registry.remove(topic);
        }
        removed
    }

    /// Number of handlers currently registered for `topic`.
    pub fn handler_count(&self, topic: &Topic) -> usize {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .map_or(0, Vec::len)
    }

    /// Parses and delivers one raw inbound frame.
    ///
    /// Malformed frames never reach subscribers; the parse error is returned
    /// to the caller for reporting.
    pub fn dispatch(&self, raw: &str) -> Result<DispatchReport, FrameError> {
        let frame = Frame::parse(raw)?;
        Ok(self.dispatch_frame(frame))
    }

    /// Delivers a parsed frame: tag handlers first, then wildcard handlers.
    pub fn dispatch_frame(&self, frame: Frame) -> DispatchReport {
        let event = ChannelEvent::Message(frame);
        let mut report = DispatchReport::default();
        self.invoke(&event.topic(), &event, &mut report);
        self.invoke(&Topic::AnyMessage, &event, &mut report);
        report
    }

    /// Delivers a lifecycle event to its reserved topic.
    pub fn emit(&self, event: &ChannelEvent) -> DispatchReport {
        let mut report = DispatchReport::default();
        self.invoke(&event.topic(), event, &mut report);
        report
    }

    fn invoke(&self, topic: &Topic, event: &ChannelEvent, report: &mut DispatchReport) {
        // Handlers may (un)subscribe while running; iterate a snapshot taken
        // with the lock released.
        let handlers: Vec<(SubscriptionId, Handler)> = {
            let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
            match registry.get(topic) {
                Some(subscriptions) => subscriptions
                    .iter()
                    .map(|subscription| (subscription.id, Arc::clone(&subscription.handler)))
                    .collect(),
                None => return,
            }
        };

        for (id, handler) in handlers {
            report.invoked += 1;
            match panic::catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    report.failed += 1;
                    warn!(
                        event = "channel_handler_failed",
                        topic = ?topic,
                        subscription = id.0,
                        error = %err
                    );
                }
                Err(payload) => {
                    report.failed += 1;
                    error!(
                        event = "channel_handler_panicked",
                        topic = ?topic,
                        subscription = id.0,
                        panic = panic_message(payload.as_ref())
                    );
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn recorder() -> Arc<Mutex<Vec<String>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn record(
        log: &Arc<Mutex<Vec<String>>>,
        label: &'static str,
    ) -> impl Fn(&ChannelEvent) -> HandlerResult + Send + Sync + 'static {
        let log = Arc::clone(log);
        move |_| {
            log.lock().expect("log lock").push(label.to_string());
            Ok(())
        }
    }

    #[test]
    fn tag_handlers_run_in_order_before_wildcard() {
        let dispatcher = Dispatcher::new();
        let log = recorder();
        dispatcher.subscribe(Topic::AnyMessage, record(&log, "any-1"));
        dispatcher.subscribe("progress", record(&log, "progress-1"));
        dispatcher.subscribe("progress", record(&log, "progress-2"));
        dispatcher.subscribe(Topic::AnyMessage, record(&log, "any-2"));
        dispatcher.subscribe("billing", record(&log, "billing"));

        let report = dispatcher
            .dispatch(r#"{"type":"progress","pct":10}"#)
            .expect("dispatch");

        assert_eq!(report, DispatchReport { invoked: 4, failed: 0 });
        assert_eq!(
            *log.lock().expect("log lock"),
            vec!["progress-1", "progress-2", "any-1", "any-2"]
        );
    }

    #[test]
    fn malformed_and_untyped_frames_reach_no_handler() {
        let dispatcher = Dispatcher::new();
        let log = recorder();
        dispatcher.subscribe(Topic::AnyMessage, record(&log, "any"));

        assert!(matches!(dispatcher.dispatch("not json"), Err(FrameError::Json(_))));
        assert!(matches!(
            dispatcher.dispatch(r#"{"pct":10}"#),
            Err(FrameError::MissingType)
        ));
        dispatcher.subscribe("", record(&log, "empty-tag"));
        assert!(matches!(
            dispatcher.dispatch(r#"{"type":"","pct":10}"#),
            Err(FrameError::MissingType)
        ));
        assert!(log.lock().expect("log lock").is_empty());
    }

    #[test]
    fn failing_and_panicking_handlers_are_isolated() {
        let dispatcher = Dispatcher::new();
        let log = recorder();
        dispatcher.subscribe("progress", |_| Err("boom".into()));
        dispatcher.subscribe("progress", |_| panic!("handler panic"));
        dispatcher.subscribe("progress", record(&log, "progress-ok"));
        dispatcher.subscribe(Topic::AnyMessage, record(&log, "any"));

        let report = dispatcher
            .dispatch(r#"{"type":"progress"}"#)
            .expect("dispatch");

        assert_eq!(report, DispatchReport { invoked: 4, failed: 2 });
        assert_eq!(*log.lock().expect("log lock"), vec!["progress-ok", "any"]);
    }

    #[test]
    fn unsubscribe_by_id_removes_only_that_handler() {
        let dispatcher = Dispatcher::new();
        let log = recorder();
        let first = dispatcher.subscribe("progress", record(&log, "first"));
        dispatcher.subscribe("progress", record(&log, "second"));

        let topic = Topic::from("progress");
        assert_eq!(dispatcher.unsubscribe(&topic, Some(first)), 1);
        assert_eq!(dispatcher.unsubscribe(&topic, Some(first)), 0);
        assert_eq!(dispatcher.handler_count(&topic), 1);

        dispatcher.dispatch(r#"{"type":"progress"}"#).expect("dispatch");
        assert_eq!(*log.lock().expect("log lock"), vec!["second"]);
    }

    #[test]
    fn unsubscribe_by_topic_clears_all_handlers() {
        let dispatcher = Dispatcher::new();
        let log = recorder();
        dispatcher.subscribe("progress", record(&log, "a"));
        dispatcher.subscribe("progress", record(&log, "b"));
        dispatcher.subscribe(Topic::AnyMessage, record(&log, "any"));

        assert_eq!(dispatcher.unsubscribe(&Topic::from("progress"), None), 2);
        dispatcher.dispatch(r#"{"type":"progress"}"#).expect("dispatch");
        assert_eq!(*log.lock().expect("log lock"), vec!["any"]);
    }

    #[test]
    fn handler_can_unsubscribe_itself_mid_dispatch() {
        let dispatcher = Arc::new(Dispatcher::new());
        let log = recorder();
        let own_id = Arc::new(Mutex::new(None::<SubscriptionId>));

        let id = dispatcher.subscribe("progress", {
            let dispatcher = Arc::clone(&dispatcher);
            let own_id = Arc::clone(&own_id);
            let log = Arc::clone(&log);
            move |_| {
                log.lock().expect("log lock").push("once".to_string());
                let id = *own_id.lock().expect("id lock");
                dispatcher.unsubscribe(&Topic::from("progress"), id);
                Ok(())
            }
        });
        *own_id.lock().expect("id lock") = Some(id);
        dispatcher.subscribe("progress", record(&log, "after"));

        dispatcher.dispatch(r#"{"type":"progress"}"#).expect("first");
        dispatcher.dispatch(r#"{"type":"progress"}"#).expect("second");

        assert_eq!(
            *log.lock().expect("log lock"),
            vec!["once", "after", "after"]
        );
    }

    #[test]
    fn wire_tag_named_like_reserved_topic_does_not_fire_lifecycle_handlers() {
        let dispatcher = Dispatcher::new();
        let log = recorder();
        dispatcher.subscribe(Topic::Connected, record(&log, "lifecycle"));
        dispatcher.subscribe("connected", record(&log, "wire"));

        dispatcher.dispatch(r#"{"type":"connected"}"#).expect("dispatch");
        dispatcher.emit(&ChannelEvent::Connected {
            path: "/ws/admin/client_x".to_string(),
        });

        assert_eq!(*log.lock().expect("log lock"), vec!["wire", "lifecycle"]);
    }

    #[test]
    fn message_handlers_receive_payload_verbatim() {
        let dispatcher = Dispatcher::new();
        let seen = Arc::new(Mutex::new(None));
        dispatcher.subscribe("progress", {
            let seen = Arc::clone(&seen);
            move |event| {
                *seen.lock().expect("seen lock") = event.frame().cloned();
                Ok(())
            }
        });

        dispatcher
            .dispatch(r#"{"type":"progress","pct":55,"kwh":1.5}"#)
            .expect("dispatch");

        let frame = seen.lock().expect("seen lock").clone().expect("frame seen");
        assert_eq!(frame.get("pct"), Some(&serde_json::json!(55)));
        assert_eq!(frame.get("kwh"), Some(&serde_json::json!(1.5)));
    }
}
