use serde::{Deserialize, Serialize};

/// Running totals kept by the in-memory bus.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusCounts {
    pub published: usize,
    /// Published with no queue bound to the routing key.
    pub unroutable: usize,
    pub delivered: usize,
    pub acknowledged: usize,
    pub rejected: usize,
    pub requeued: usize,
}

impl BusCounts {
    /// Deliveries not yet acknowledged or rejected.
    pub fn in_flight(&self) -> usize {
        self.delivered
            .saturating_sub(self.acknowledged + self.rejected + self.requeued)
    }
}
