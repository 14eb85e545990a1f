//! Flow-control admission (spec §4.7).

/// Per-subscription in-flight bounds. `None` means unbounded.
#[derive(Clone, Debug, Default)]
pub struct FlowControl {
    pub max_messages: Option<u64>,
    pub max_bytes: Option<u64>,
    /// Admit one oversized message when the in-flight set is empty, so a
    /// single very large message can't starve the subscription forever.
    pub allow_excess_messages: bool,
}

impl FlowControl {
    /// Coarse up-front gate (spec §4.3 step 2): if already at/over either
    /// bound, the whole pull returns empty without touching the queue.
    pub fn admits_pull(&self, in_flight_count: u64, in_flight_bytes: u64) -> bool {
        if let Some(max_messages) = self.max_messages {
            if in_flight_count >= max_messages {
                return false;
            }
        }
        if let Some(max_bytes) = self.max_bytes {
            if in_flight_bytes >= max_bytes {
                return false;
            }
        }
        true
    }

    /// Precise per-message gate while assembling a batch (spec §4.3 step 4).
    /// `in_flight_is_empty` gates `allow_excess_messages`: a single oversized
    /// message is only ever admitted when nothing else is outstanding.
    pub fn admits_message(
        &self,
        in_flight_count: u64,
        in_flight_bytes: u64,
        candidate_len: u64,
        in_flight_is_empty: bool,
    ) -> bool {
        if let Some(max_messages) = self.max_messages {
            if in_flight_count + 1 > max_messages {
                return false;
            }
        }
        if let Some(max_bytes) = self.max_bytes {
            if in_flight_bytes + candidate_len > max_bytes {
                if self.allow_excess_messages && in_flight_is_empty {
                    return true;
                }
                return false;
            }
        }
        true
    }
}
