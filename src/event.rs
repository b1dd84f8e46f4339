use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{error, trace};

use crate::error::PusherError;
use crate::message::PusherMessage;

/// An inbound event as delivered to bound callbacks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub name: String,
    pub channel: Option<String>,
    pub data: String,
}

impl Event {
    pub(crate) fn from_message(message: &PusherMessage) -> Self {
        Self {
            name: message.event.clone(),
            channel: message.channel.clone(),
            data: message.data_as_string(),
        }
    }

    /// Parse the payload as JSON
    pub fn json(&self) -> Result<serde_json::Value, PusherError> {
        Ok(serde_json::from_str(&self.data)?)
    }
}

/// Callback invoked with every matching event
pub type Callback = Arc<dyn Fn(&Event) + Send + Sync>;

/// Callback invoked when a channel fails to subscribe
pub type ErrorCallback = Arc<dyn Fn(&PusherError) + Send + Sync>;

/// Identifies exactly one registration made with `bind` or `bind_error`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackHandle(u64);

/// Ordered callback storage. Ids grow monotonically, so each list stays in
/// registration order and removal never disturbs the remaining entries.
#[derive(Default)]
pub(crate) struct Bindings {
    next_id: u64,
    events: HashMap<String, Vec<(CallbackHandle, Callback)>>,
    errors: Vec<(CallbackHandle, ErrorCallback)>,
}

impl Bindings {
    fn next_handle(&mut self) -> CallbackHandle {
        self.next_id += 1;
        CallbackHandle(self.next_id)
    }

    pub fn bind(&mut self, event: &str, callback: Callback) -> CallbackHandle {
        let handle = self.next_handle();
        self.events
            .entry(event.to_string())
            .or_default()
            .push((handle, callback));
        handle
    }

    pub fn bind_error(&mut self, callback: ErrorCallback) -> CallbackHandle {
        let handle = self.next_handle();
        self.errors.push((handle, callback));
        handle
    }

    /// Returns false when the handle was not registered here
    pub fn unbind(&mut self, handle: CallbackHandle) -> bool {
        if let Some(pos) = self.errors.iter().position(|(h, _)| *h == handle) {
            self.errors.remove(pos);
            return true;
        }

        let mut emptied = None;
        let mut found = false;
        for (event, callbacks) in self.events.iter_mut() {
            if let Some(pos) = callbacks.iter().position(|(h, _)| *h == handle) {
                callbacks.remove(pos);
                found = true;
                if callbacks.is_empty() {
                    emptied = Some(event.clone());
                }
                break;
            }
        }
        if let Some(event) = emptied {
            self.events.remove(&event);
        }
        found
    }

    pub fn callbacks_for(&self, event: &str) -> Vec<Callback> {
        self.events
            .get(event)
            .map(|callbacks| callbacks.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default()
    }

    pub fn error_callbacks(&self) -> Vec<ErrorCallback> {
        self.errors.iter().map(|(_, cb)| Arc::clone(cb)).collect()
    }

    #[cfg(test)]
    pub fn is_bound(&self, event: &str) -> bool {
        self.events.contains_key(event)
    }
}

pub(crate) type SharedBindings = Arc<Mutex<Bindings>>;

/// Callbacks never run while the lock is held, so a poisoned lock only means a
/// panic happened during a plain list mutation; the data is still consistent.
pub(crate) fn lock(bindings: &Mutex<Bindings>) -> MutexGuard<'_, Bindings> {
    bindings.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Invoke every callback bound to the event, in registration order.
/// Returns the number of callbacks run.
pub(crate) fn dispatch(bindings: &Mutex<Bindings>, event: &Event) -> usize {
    let callbacks = lock(bindings).callbacks_for(&event.name);
    if callbacks.is_empty() {
        trace!("No callback bound for {}", event.name);
    }
    for callback in &callbacks {
        if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
            error!("Callback for {} panicked", event.name);
        }
    }
    callbacks.len()
}

pub(crate) fn dispatch_error(bindings: &Mutex<Bindings>, err: &PusherError) -> usize {
    let callbacks = lock(bindings).error_callbacks();
    for callback in &callbacks {
        if catch_unwind(AssertUnwindSafe(|| callback(err))).is_err() {
            error!("Error callback panicked");
        }
    }
    callbacks.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(name: &str, data: &str) -> Event {
        Event {
            name: name.to_string(),
            channel: Some("room".to_string()),
            data: data.to_string(),
        }
    }

    fn recorder(log: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> Callback {
        let log = Arc::clone(log);
        Arc::new(move |e: &Event| log.lock().unwrap().push(format!("{}:{}", tag, e.data)))
    }

    #[test]
    fn callbacks_run_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let bindings = Mutex::new(Bindings::default());
        lock(&bindings).bind("msg", recorder(&log, "first"));
        lock(&bindings).bind("msg", recorder(&log, "second"));
        lock(&bindings).bind("other", recorder(&log, "other"));

        assert_eq!(dispatch(&bindings, &event("msg", "x")), 2);
        assert_eq!(*log.lock().unwrap(), vec!["first:x", "second:x"]);
    }

    #[test]
    fn unbind_removes_exactly_one_registration() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let bindings = Mutex::new(Bindings::default());
        let first = lock(&bindings).bind("msg", recorder(&log, "first"));
        lock(&bindings).bind("msg", recorder(&log, "second"));

        assert!(lock(&bindings).unbind(first));
        assert!(!lock(&bindings).unbind(first));
        dispatch(&bindings, &event("msg", "y"));
        assert_eq!(*log.lock().unwrap(), vec!["second:y"]);
    }

    #[test]
    fn unmatched_events_are_dropped() {
        let bindings = Mutex::new(Bindings::default());
        assert_eq!(dispatch(&bindings, &event("nobody-listens", "")), 0);
        assert!(!lock(&bindings).is_bound("nobody-listens"));
    }

    #[test]
    fn callbacks_may_unbind_themselves_during_dispatch() {
        let bindings: SharedBindings = Arc::new(Mutex::new(Bindings::default()));
        let calls = Arc::new(Mutex::new(0));
        let handle_slot: Arc<Mutex<Option<CallbackHandle>>> = Arc::new(Mutex::new(None));

        let cb: Callback = {
            let bindings = Arc::clone(&bindings);
            let calls = Arc::clone(&calls);
            let handle_slot = Arc::clone(&handle_slot);
            Arc::new(move |_e: &Event| {
                *calls.lock().unwrap() += 1;
                if let Some(handle) = *handle_slot.lock().unwrap() {
                    lock(&bindings).unbind(handle);
                }
            })
        };
        let handle = lock(&bindings).bind("once", cb);
        *handle_slot.lock().unwrap() = Some(handle);

        dispatch(&bindings, &event("once", ""));
        dispatch(&bindings, &event("once", ""));
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[test]
    fn a_panicking_callback_does_not_stop_the_others() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let bindings = Mutex::new(Bindings::default());
        lock(&bindings).bind("msg", Arc::new(|_e: &Event| panic!("boom")));
        lock(&bindings).bind("msg", recorder(&log, "after"));

        assert_eq!(dispatch(&bindings, &event("msg", "z")), 2);
        assert_eq!(*log.lock().unwrap(), vec!["after:z"]);
    }

    #[test]
    fn error_callbacks_are_separate_from_event_callbacks() {
        let bindings = Mutex::new(Bindings::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handle = {
            let seen = Arc::clone(&seen);
            lock(&bindings).bind_error(Arc::new(move |err: &PusherError| {
                seen.lock().unwrap().push(err.to_string())
            }))
        };

        assert_eq!(dispatch_error(&bindings, &PusherError::NotConnected), 1);
        assert_eq!(*seen.lock().unwrap(), vec!["Not connected"]);
        assert!(lock(&bindings).unbind(handle));
        assert_eq!(dispatch_error(&bindings, &PusherError::NotConnected), 0);
    }

    #[test]
    fn event_payload_parses_as_json() {
        let e = event("msg", r#"{"n":3}"#);
        assert_eq!(e.json().unwrap()["n"], 3);
        assert!(event("msg", "plain").json().is_err());
    }
}
