use tokio::sync::broadcast;
use tracing::trace;

use tracker_core::wire::ChangeSignal;

/// Best-effort "state changed" channel. Delivery is not guaranteed, ordered
/// or deduplicated; listeners use it only to pull sooner.
pub trait NotificationFanout: Send + Sync {
    fn send(&self, signal: &ChangeSignal);
}

/// Drops every signal.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullFanout;

impl NotificationFanout for NullFanout {
    fn send(&self, _signal: &ChangeSignal) {}
}

/// In-process fan-out over a tokio broadcast channel. Slow subscribers lag
/// and lose signals, which is acceptable for a hint.
#[derive(Debug, Clone)]
pub struct BroadcastFanout {
    tx: broadcast::Sender<ChangeSignal>,
}

impl BroadcastFanout {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeSignal> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl NotificationFanout for BroadcastFanout {
    fn send(&self, signal: &ChangeSignal) {
        match self.tx.send(signal.clone()) {
            Ok(listeners) => trace!(listeners, epoch = %signal.epoch, "change signal sent"),
            Err(_) => trace!(epoch = %signal.epoch, "change signal dropped, no listeners"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracker_core::{Epoch, IncidentId, NodeId};

    #[test]
    fn send_without_listeners_is_harmless() {
        let fanout = BroadcastFanout::new(4);
        fanout.send(&ChangeSignal::new(NodeId::new(), IncidentId::new(), Epoch::from_millis(1)));
        assert_eq!(fanout.subscriber_count(), 0);
    }

    #[test]
    fn every_subscriber_sees_the_signal() {
        let fanout = BroadcastFanout::new(4);
        let mut a = fanout.subscribe();
        let mut b = fanout.subscribe();
        let signal = ChangeSignal::new(NodeId::new(), IncidentId::new(), Epoch::from_millis(5));
        fanout.send(&signal);
        assert_eq!(a.try_recv().unwrap(), signal);
        assert_eq!(b.try_recv().unwrap(), signal);
    }

    #[test]
    fn lagging_subscriber_loses_old_signals() {
        let fanout = BroadcastFanout::new(1);
        let mut rx = fanout.subscribe();
        for ms in 1..=3 {
            fanout.send(&ChangeSignal::new(NodeId::new(), IncidentId::new(), Epoch::from_millis(ms)));
        }
        assert!(matches!(rx.try_recv(), Err(broadcast::error::TryRecvError::Lagged(_))));
        assert_eq!(rx.try_recv().unwrap().epoch, Epoch::from_millis(3));
    }
}
