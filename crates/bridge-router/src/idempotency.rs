use bridge_protocol::Envelope;

/// An idempotency cache entry's lifecycle is distinct from a pending
/// command's: it outlives the command (`spec.md` §4.4, "Idempotency cache").
#[derive(Debug, Clone)]
pub enum IdempotencyRecord {
    InFlight { recorded_at: u64 },
    Terminal { ack: Envelope, recorded_at: u64 },
}

impl IdempotencyRecord {
    #[must_use]
    pub fn recorded_at(&self) -> u64 {
        match self {
            IdempotencyRecord::InFlight { recorded_at } | IdempotencyRecord::Terminal { recorded_at, .. } => {
                *recorded_at
            }
        }
    }
}
