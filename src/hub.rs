//! Per-run event fan-out with bounded backlog replay.
//!
//! Subscribers arriving after a run started receive the backlog first, then
//! live events, all in publish order. The per-run lock is the ordering
//! boundary; the outer map lock is only held long enough to fetch the run's
//! channel state, so runs never contend with each other.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::events::BridgeEvent;

/// Events retained per run for late subscribers; oldest evicted first.
const BACKLOG_CAP: usize = 2000;

#[derive(Default)]
struct ChannelState {
    backlog: VecDeque<BridgeEvent>,
    subscribers: Vec<mpsc::UnboundedSender<BridgeEvent>>,
    input: Option<mpsc::UnboundedSender<String>>,
}

#[derive(Default)]
pub struct BroadcastHub {
    runs: Mutex<HashMap<String, Arc<Mutex<ChannelState>>>>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, run_id: &str) -> Arc<Mutex<ChannelState>> {
        let mut runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        runs.entry(run_id.to_string()).or_default().clone()
    }

    /// Append to the backlog and fan out to live subscribers, pruning any
    /// whose receiving side has gone away.
    pub fn publish(&self, run_id: &str, event: BridgeEvent) {
        let state = self.entry(run_id);
        let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
        if state.backlog.len() == BACKLOG_CAP {
            state.backlog.pop_front();
        }
        state.backlog.push_back(event.clone());
        state
            .subscribers
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Subscribe to a run's events. The backlog is queued into the channel
    /// before any event published after this call.
    pub fn subscribe(&self, run_id: &str) -> mpsc::UnboundedReceiver<BridgeEvent> {
        let state = self.entry(run_id);
        let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
        let (tx, rx) = mpsc::unbounded_channel();
        for event in &state.backlog {
            let _ = tx.send(event.clone());
        }
        state.subscribers.push(tx);
        rx
    }

    /// Attach the reply channel for a run. The session owns the receiving
    /// side for its whole lifetime.
    pub fn register_input(&self, run_id: &str, tx: mpsc::UnboundedSender<String>) {
        let state = self.entry(run_id);
        let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
        state.input = Some(tx);
    }

    /// Forward a client reply to the run's session. False when no session is
    /// accepting input.
    pub fn send_input(&self, run_id: &str, data: String) -> bool {
        let state = self.entry(run_id);
        let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
        match &state.input {
            Some(tx) => {
                if tx.send(data).is_ok() {
                    true
                } else {
                    state.input = None;
                    false
                }
            }
            None => false,
        }
    }

    /// Detach the reply channel when the session ends. The backlog stays so
    /// late subscribers still see the full history.
    pub fn clear_input(&self, run_id: &str) {
        let state = self.entry(run_id);
        let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
        state.input = None;
    }

    #[cfg(test)]
    fn subscriber_count(&self, run_id: &str) -> usize {
        let state = self.entry(run_id);
        let state = state.lock().unwrap_or_else(|e| e.into_inner());
        state.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(n: usize) -> BridgeEvent {
        BridgeEvent::Output {
            text: format!("line {n}\n"),
        }
    }

    #[test]
    fn late_subscriber_replays_backlog_in_order() {
        let hub = BroadcastHub::new();
        for n in 0..5 {
            hub.publish("run-1", output(n));
        }

        let mut rx = hub.subscribe("run-1");
        for n in 0..5 {
            assert_eq!(rx.try_recv().unwrap(), output(n));
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn live_events_follow_replay() {
        let hub = BroadcastHub::new();
        hub.publish("run-1", output(0));
        let mut rx = hub.subscribe("run-1");
        hub.publish("run-1", output(1));
        hub.publish("run-1", output(2));

        assert_eq!(rx.try_recv().unwrap(), output(0));
        assert_eq!(rx.try_recv().unwrap(), output(1));
        assert_eq!(rx.try_recv().unwrap(), output(2));
    }

    #[test]
    fn backlog_evicts_oldest_at_cap() {
        let hub = BroadcastHub::new();
        for n in 0..BACKLOG_CAP + 5 {
            hub.publish("run-1", output(n));
        }

        let mut rx = hub.subscribe("run-1");
        assert_eq!(rx.try_recv().unwrap(), output(5));
    }

    #[test]
    fn runs_are_isolated() {
        let hub = BroadcastHub::new();
        hub.publish("run-1", output(1));
        let mut rx = hub.subscribe("run-2");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn every_subscriber_receives_each_event() {
        let hub = BroadcastHub::new();
        let mut a = hub.subscribe("run-1");
        let mut b = hub.subscribe("run-1");
        hub.publish("run-1", output(7));

        assert_eq!(a.try_recv().unwrap(), output(7));
        assert_eq!(b.try_recv().unwrap(), output(7));
    }

    #[test]
    fn departed_subscriber_is_pruned() {
        let hub = BroadcastHub::new();
        let rx = hub.subscribe("run-1");
        drop(rx);
        assert_eq!(hub.subscriber_count("run-1"), 1);

        hub.publish("run-1", output(0));
        assert_eq!(hub.subscriber_count("run-1"), 0);
    }

    #[test]
    fn input_routing_requires_registration() {
        let hub = BroadcastHub::new();
        assert!(!hub.send_input("run-1", "y".to_string()));

        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.register_input("run-1", tx);
        assert!(hub.send_input("run-1", "y".to_string()));
        assert_eq!(rx.try_recv().unwrap(), "y");

        hub.clear_input("run-1");
        assert!(!hub.send_input("run-1", "n".to_string()));
    }

    #[test]
    fn send_input_prunes_dead_channel() {
        let hub = BroadcastHub::new();
        let (tx, rx) = mpsc::unbounded_channel();
        hub.register_input("run-1", tx);
        drop(rx);

        assert!(!hub.send_input("run-1", "y".to_string()));
        assert!(!hub.send_input("run-1", "y".to_string()));
    }
}
