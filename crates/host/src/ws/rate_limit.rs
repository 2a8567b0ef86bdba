//! Per-session message budget
//!
//! A token bucket charged per inbound frame, with the charge scaled to
//! what the message costs the relay. Diff submissions pay for the durable
//! append plus fan-out to every subscriber; subscribes and full-document
//! fetches pay for catch-up or log folding; unsubscribes are nearly free.

use std::time::Instant;

use pagesync_protocol::ClientMessage;

/// Tokens available immediately after connect.
const BURST_BUDGET: f64 = 200.0;
/// Tokens restored per second of quiet.
const REFILL_PER_SEC: f64 = 50.0;

/// Charge for a frame that does not parse as any known message.
pub const UNPARSED_COST: f64 = 1.0;

pub struct MessageBudget {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    replenished_at: Instant,
}

impl MessageBudget {
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            tokens: capacity,
            capacity,
            refill_per_sec,
            replenished_at: Instant::now(),
        }
    }

    /// Budget for one sync session (200 burst, 50/sec sustained).
    pub fn for_session() -> Self {
        Self::new(BURST_BUDGET, REFILL_PER_SEC)
    }

    /// Relay-side cost of handling this message.
    pub fn cost_of(msg: &ClientMessage) -> f64 {
        match msg {
            ClientMessage::Unsubscribe { .. } => 1.0,
            ClientMessage::Diff { envelope, .. } => {
                // Large step batches amplify both the write and the
                // broadcast payload.
                2.0 + envelope.steps.len() as f64 * 0.25
            }
            ClientMessage::Subscribe { .. } | ClientMessage::GetDocument { .. } => 4.0,
        }
    }

    /// Charge `cost` against the budget. Returns `false` when exhausted,
    /// in which case the message should be dropped.
    pub fn charge(&mut self, cost: f64) -> bool {
        let now = Instant::now();
        let idle = now.duration_since(self.replenished_at).as_secs_f64();
        self.tokens = (self.tokens + idle * self.refill_per_sec).min(self.capacity);
        self.replenished_at = now;
        if self.tokens < cost {
            return false;
        }
        self.tokens -= cost;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagesync_protocol::{DiffEnvelope, Step};
    use serde_json::json;
    use std::thread::sleep;
    use std::time::Duration;

    #[test]
    fn burst_is_bounded() {
        let mut budget = MessageBudget::new(10.0, 1.0);
        for _ in 0..10 {
            assert!(budget.charge(1.0));
        }
        assert!(!budget.charge(1.0));
    }

    #[test]
    fn quiet_time_refills() {
        let mut budget = MessageBudget::new(10.0, 10.0);
        while budget.charge(1.0) {}

        // 200ms at 10/sec restores two tokens.
        sleep(Duration::from_millis(200));
        assert!(budget.charge(1.0));
        assert!(budget.charge(1.0));
        assert!(!budget.charge(1.0));
    }

    #[test]
    fn diff_costs_scale_with_step_count() {
        let step = Step::new(json!({ "from": 0, "to": 0, "insert": "x" }));
        let diff = |steps: usize| ClientMessage::Diff {
            document_id: "doc".to_string(),
            envelope: DiffEnvelope {
                request_id: 1,
                client_id: "c1".to_string(),
                base_version: 0,
                steps: vec![step.clone(); steps],
            },
        };
        let unsubscribe = ClientMessage::Unsubscribe {
            document_id: "doc".to_string(),
        };

        assert!(MessageBudget::cost_of(&diff(1)) > MessageBudget::cost_of(&unsubscribe));
        assert!(MessageBudget::cost_of(&diff(40)) > MessageBudget::cost_of(&diff(1)));
    }

    #[test]
    fn exhausted_budget_rejects_expensive_before_cheap() {
        let mut budget = MessageBudget::new(5.0, 0.001);
        assert!(!budget.charge(6.0));
        assert!(budget.charge(4.0));
    }
}
