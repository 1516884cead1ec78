//! The three per-connection state machines behind the WebSocket endpoints,
//! plus the small pieces they share. Each engine owns one client queue and
//! one backend transport; the connection pump in `serve` feeds client frames
//! in and drains queued frames out.

pub mod file;
pub mod guac;
pub mod terminal;

use std::collections::HashMap;
use std::sync::Mutex;

/// Engine verdict after handling an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// 会话结束，pump 负责关闭 WebSocket 并调用 `on_close`
    Closed,
}

/// Contract between the connection pump and a session engine. Engines never
/// block in these calls; backend waits live on their own threads.
pub trait SessionEngine {
    fn on_client_text(&mut self, payload: &str) -> Flow;
    fn on_client_binary(&mut self, payload: &[u8]) -> Flow;
    /// Drain pending backend events; called once per pump iteration.
    fn poll_backend(&mut self) -> Flow;
    /// Idempotent teardown; runs on every exit path.
    fn on_close(&mut self);
}

/// 在线会话计数器名称
pub const ONLINE_CONNECTION_COUNT: &str = "online_connection_count";

/// Process-wide gauge collaborator: incremented on every accepted session,
/// decremented on close.
pub trait OnlineCounter: Send + Sync {
    fn incr(&self, name: &str);
    fn decr(&self, name: &str);
    fn get(&self, name: &str) -> i64;
}

/// In-memory counter implementation.
#[derive(Default)]
pub struct GaugeCounter {
    values: Mutex<HashMap<String, i64>>,
}

impl OnlineCounter for GaugeCounter {
    fn incr(&self, name: &str) {
        let mut values = self.values.lock().expect("counter poisoned");
        *values.entry(name.to_string()).or_insert(0) += 1;
    }

    fn decr(&self, name: &str) {
        let mut values = self.values.lock().expect("counter poisoned");
        *values.entry(name.to_string()).or_insert(0) -= 1;
    }

    fn get(&self, name: &str) -> i64 {
        self.values.lock().expect("counter poisoned").get(name).copied().unwrap_or(0)
    }
}

/// RAII decrement: holds the increment for the session lifetime and returns
/// it on every exit path, panics included.
pub struct CounterGuard<'a> {
    counter: &'a dyn OnlineCounter,
    name: &'static str,
}

impl<'a> CounterGuard<'a> {
    pub fn acquire(counter: &'a dyn OnlineCounter, name: &'static str) -> Self {
        counter.incr(name);
        Self { counter, name }
    }
}

impl Drop for CounterGuard<'_> {
    fn drop(&mut self) {
        self.counter.decr(self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_guard_balances_on_drop() {
        let counter = GaugeCounter::default();
        {
            let _a = CounterGuard::acquire(&counter, ONLINE_CONNECTION_COUNT);
            let _b = CounterGuard::acquire(&counter, ONLINE_CONNECTION_COUNT);
            assert_eq!(counter.get(ONLINE_CONNECTION_COUNT), 2);
        }
        assert_eq!(counter.get(ONLINE_CONNECTION_COUNT), 0);
    }
}
