//! Data and exit event subscriptions
//!
//! Listeners are kept in registration order and every event goes to a
//! snapshot of the current listeners, so a listener may dispose itself (or
//! others) while being called.
//!
//! Data produced before the first data listener is attached is kept and
//! replayed to that listener. The exit result is delivered once; listeners
//! attached after it receive it immediately. No data is delivered after exit.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde::{Deserialize, Serialize};

/// How the child process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitResult {
    pub exit_code: i32,
    /// Terminating signal number (fork platform only)
    pub signal: Option<i32>,
}

impl ExitResult {
    pub fn code(exit_code: i32) -> Self {
        Self {
            exit_code,
            signal: None,
        }
    }

    pub fn signaled(signal: i32) -> Self {
        Self {
            exit_code: 0,
            signal: Some(signal),
        }
    }
}

/// One batch of output from the child
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyData {
    /// Decoded with the configured encoding
    Text(String),
    /// Raw bytes (no encoding configured)
    Binary(Vec<u8>),
}

impl PtyData {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            PtyData::Text(s) => s.as_bytes(),
            PtyData::Binary(b) => b,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            PtyData::Text(s) => Some(s),
            PtyData::Binary(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Token returned by a subscription; [`Disposable::dispose`] stops delivery.
///
/// Dropping the token without disposing keeps the listener registered.
pub struct Disposable {
    hub: Weak<EventHub>,
    id: u64,
}

impl Disposable {
    pub fn dispose(self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.remove(self.id);
        }
    }
}

impl std::fmt::Debug for Disposable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Disposable").field("id", &self.id).finish()
    }
}

#[derive(Default)]
struct HubState {
    data: Vec<(u64, Listener<PtyData>)>,
    exit: Vec<(u64, Listener<ExitResult>)>,
    backlog: VecDeque<PtyData>,
    exit_result: Option<ExitResult>,
    exit_delivered: bool,
}

impl HubState {
    /// Exit has happened but is held back behind unclaimed data
    fn exit_pending(&self) -> bool {
        self.exit_result.is_some() && !self.exit_delivered
    }

    /// Mark exit delivered and return who should hear about it
    fn take_exit(&mut self) -> Option<(ExitResult, Vec<Listener<ExitResult>>)> {
        let result = self.exit_result?;
        self.exit_delivered = true;
        self.backlog.clear();
        Some((result, self.exit.iter().map(|(_, l)| l.clone()).collect()))
    }
}

/// Ordered listener registry for one PTY
#[derive(Default)]
pub struct EventHub {
    state: Mutex<HubState>,
    /// Held while events are handed to listeners so batches never interleave
    delivery: Mutex<()>,
    next_id: AtomicU64,
}

impl EventHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn delivery(&self) -> MutexGuard<'_, ()> {
        self.delivery.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn on_data<F>(self: &Arc<Self>, listener: F) -> Disposable
    where
        F: Fn(&PtyData) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let listener: Listener<PtyData> = Arc::new(listener);

        {
            let mut state = self.state();
            if state.backlog.is_empty() && !state.exit_pending() {
                state.data.push((id, listener));
                return self.token(id);
            }
        }

        // Replay the backlog before anything newer can reach the listener
        let _delivery = self.delivery();
        let (backlog, exit) = {
            let mut state = self.state();
            state.data.push((id, listener.clone()));
            let backlog: Vec<PtyData> = state.backlog.drain(..).collect();
            let exit = if state.exit_pending() {
                state.take_exit()
            } else {
                None
            };
            (backlog, exit)
        };
        for data in &backlog {
            listener(data);
        }
        if let Some((result, listeners)) = exit {
            for l in listeners {
                l(&result);
            }
        }
        self.token(id)
    }

    pub fn on_exit<F>(self: &Arc<Self>, listener: F) -> Disposable
    where
        F: Fn(&ExitResult) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let listener: Listener<ExitResult> = Arc::new(listener);

        let replay = {
            let mut state = self.state();
            if state.exit_delivered {
                state.exit_result
            } else if !state.exit_pending() {
                state.exit.push((id, listener));
                return self.token(id);
            } else {
                None
            }
        };
        if let Some(result) = replay {
            listener(&result);
            return self.token(id);
        }

        // Exit was held for unclaimed data; an exit listener claims it
        let _delivery = self.delivery();
        let exit = {
            let mut state = self.state();
            state.exit.push((id, listener.clone()));
            state.take_exit()
        };
        if let Some((result, listeners)) = exit {
            for l in listeners {
                l(&result);
            }
        }
        self.token(id)
    }

    pub(crate) fn emit_data(&self, data: PtyData) {
        if data.is_empty() {
            return;
        }
        let _delivery = self.delivery();
        let listeners: Vec<Listener<PtyData>> = {
            let mut state = self.state();
            if state.exit_result.is_some() {
                return;
            }
            if state.data.is_empty() {
                state.backlog.push_back(data);
                return;
            }
            state.data.iter().map(|(_, l)| l.clone()).collect()
        };
        for l in listeners {
            l(&data);
        }
    }

    /// Record the exit; only the first call has any effect
    pub(crate) fn emit_exit(&self, result: ExitResult) {
        let _delivery = self.delivery();
        let exit = {
            let mut state = self.state();
            if state.exit_result.is_some() {
                return;
            }
            state.exit_result = Some(result);
            if !state.backlog.is_empty() && state.data.is_empty() {
                return;
            }
            state.take_exit()
        };
        if let Some((result, listeners)) = exit {
            for l in listeners {
                l(&result);
            }
        }
    }

    pub fn exit_result(&self) -> Option<ExitResult> {
        self.state().exit_result
    }

    fn remove(&self, id: u64) {
        let mut state = self.state();
        state.data.retain(|(i, _)| *i != id);
        state.exit.retain(|(i, _)| *i != id);
    }

    fn token(self: &Arc<Self>, id: u64) -> Disposable {
        Disposable {
            hub: Arc::downgrade(self),
            id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn text(s: &str) -> PtyData {
        PtyData::Text(s.to_string())
    }

    fn recorder(hub: &Arc<EventHub>, tag: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Disposable {
        let log = log.clone();
        hub.on_data(move |d| log.lock().unwrap().push(format!("{}:{}", tag, d.as_text().unwrap())))
    }

    #[test]
    fn test_delivery_in_registration_order() {
        let hub = EventHub::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let _a = recorder(&hub, "a", &log);
        let _b = recorder(&hub, "b", &log);

        hub.emit_data(text("1"));
        hub.emit_data(text("2"));

        assert_eq!(*log.lock().unwrap(), vec!["a:1", "b:1", "a:2", "b:2"]);
    }

    #[test]
    fn test_dispose_stops_delivery() {
        let hub = EventHub::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = recorder(&hub, "a", &log);
        let _b = recorder(&hub, "b", &log);

        hub.emit_data(text("1"));
        a.dispose();
        hub.emit_data(text("2"));

        assert_eq!(*log.lock().unwrap(), vec!["a:1", "b:1", "b:2"]);
    }

    #[test]
    fn test_listener_can_dispose_itself() {
        let hub = EventHub::new();
        let slot: Arc<Mutex<Option<Disposable>>> = Arc::new(Mutex::new(None));
        let count = Arc::new(AtomicUsize::new(0));

        let (slot2, count2) = (slot.clone(), count.clone());
        let token = hub.on_data(move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
            if let Some(token) = slot2.lock().unwrap().take() {
                token.dispose();
            }
        });
        *slot.lock().unwrap() = Some(token);

        hub.emit_data(text("x"));
        hub.emit_data(text("y"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backlog_replayed_to_first_listener() {
        let hub = EventHub::new();
        hub.emit_data(text("early"));
        hub.emit_data(text("er"));

        let log = Arc::new(Mutex::new(Vec::new()));
        let _a = recorder(&hub, "a", &log);
        let _b = recorder(&hub, "b", &log);
        hub.emit_data(text("late"));

        assert_eq!(*log.lock().unwrap(), vec!["a:early", "a:er", "a:late", "b:late"]);
    }

    #[test]
    fn test_exit_fires_once_and_stops_data() {
        let hub = EventHub::new();
        let exits = Arc::new(AtomicUsize::new(0));
        let log = Arc::new(Mutex::new(Vec::new()));
        let _d = recorder(&hub, "a", &log);
        let e = exits.clone();
        let _x = hub.on_exit(move |r| {
            assert_eq!(*r, ExitResult::code(3));
            e.fetch_add(1, Ordering::SeqCst);
        });

        hub.emit_data(text("before"));
        hub.emit_exit(ExitResult::code(3));
        hub.emit_exit(ExitResult::code(4));
        hub.emit_data(text("after"));

        assert_eq!(exits.load(Ordering::SeqCst), 1);
        assert_eq!(*log.lock().unwrap(), vec!["a:before"]);
        assert_eq!(hub.exit_result(), Some(ExitResult::code(3)));
    }

    #[test]
    fn test_late_exit_listener_gets_replay() {
        let hub = EventHub::new();
        hub.emit_exit(ExitResult::signaled(9));

        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        let _x = hub.on_exit(move |r| *s.lock().unwrap() = Some(*r));
        assert_eq!(*seen.lock().unwrap(), Some(ExitResult::signaled(9)));
    }

    #[test]
    fn test_exit_held_behind_backlog_until_data_listener() {
        let hub = EventHub::new();
        hub.emit_data(text("hello"));
        hub.emit_exit(ExitResult::code(0));

        let order = Arc::new(Mutex::new(Vec::new()));
        let o = order.clone();
        let _d = hub.on_data(move |d| o.lock().unwrap().push(d.as_text().unwrap().to_string()));
        let o = order.clone();
        let _x = hub.on_exit(move |r| o.lock().unwrap().push(format!("exit {}", r.exit_code)));

        assert_eq!(*order.lock().unwrap(), vec!["hello", "exit 0"]);
    }

    #[test]
    fn test_exit_listener_claims_held_exit() {
        let hub = EventHub::new();
        hub.emit_data(text("ignored"));
        hub.emit_exit(ExitResult::code(1));

        let exits = Arc::new(AtomicUsize::new(0));
        let e = exits.clone();
        let _x = hub.on_exit(move |_| {
            e.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(exits.load(Ordering::SeqCst), 1);

        // The backlog was discarded along with the exit delivery
        let got = Arc::new(AtomicUsize::new(0));
        let g = got.clone();
        let _d = hub.on_data(move |_| {
            g.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(got.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_empty_batches_are_skipped() {
        let hub = EventHub::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let _d = hub.on_data(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        hub.emit_data(PtyData::Text(String::new()));
        hub.emit_data(PtyData::Binary(vec![0]));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
