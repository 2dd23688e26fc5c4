use std::collections::VecDeque;

use super::event::GatewayEvent;

/// Bounded ring of broadcast events kept for gap recovery.
#[derive(Debug)]
pub(crate) struct EventHistory {
    events: VecDeque<GatewayEvent>,
    capacity: usize,
}

impl EventHistory {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Append, dropping the oldest entry once full.
    pub(crate) fn push(&mut self, event: GatewayEvent) {
        if self.events.len() == self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    /// Entries with a sequence number strictly greater than `seq`, oldest
    /// first.
    pub(crate) fn since(&self, seq: u64) -> Vec<GatewayEvent> {
        self.events
            .iter()
            .filter(|event| event.seq.is_some_and(|s| s > seq))
            .cloned()
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.events.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::event::GatewayEventType;
    use serde_json::Map;

    fn event(seq: u64) -> GatewayEvent {
        GatewayEvent::new(GatewayEventType::System, Map::new()).with_seq(seq)
    }

    #[test]
    fn test_oldest_entries_are_dropped_first() {
        let mut history = EventHistory::new(3);
        for seq in 1..=5 {
            history.push(event(seq));
        }
        assert_eq!(history.len(), 3);
        let seqs: Vec<u64> = history.since(0).iter().filter_map(|e| e.seq).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
    }

    #[test]
    fn test_since_is_strictly_greater() {
        let mut history = EventHistory::new(10);
        for seq in [2, 4, 6] {
            history.push(event(seq));
        }
        let seqs: Vec<u64> = history.since(4).iter().filter_map(|e| e.seq).collect();
        assert_eq!(seqs, vec![6]);
        assert!(history.since(6).is_empty());
    }
}
