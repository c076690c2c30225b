//! IdGenerator port - worker identity generation.
//!
//! Worker ids must be unique across the whole fleet without any coordination,
//! which is exactly what ULIDs give us: a millisecond timestamp plus 80 random
//! bits. The clock is injected so tests can pin the timestamp part.

use ulid::Ulid;

use crate::domain::WorkerId;
use crate::ports::Clock;

pub trait IdGenerator: Send + Sync {
    fn generate_worker_id(&self) -> WorkerId;
}

/// ULID-based generator: `worker-<ULID>`.
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_worker_id(&self) -> WorkerId {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        let ulid = Ulid::from_parts(timestamp_ms, rand::random());
        // "worker-" + 26 Crockford base32 chars always passes name validation.
        WorkerId::new_unchecked(format!("worker-{ulid}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{ManualClock, SystemClock};
    use chrono::{TimeZone, Utc};

    #[test]
    fn generates_unique_prefixed_ids() {
        let id_gen = UlidGenerator::new(SystemClock);

        let id1 = id_gen.generate_worker_id();
        let id2 = id_gen.generate_worker_id();

        assert_ne!(id1, id2);
        assert!(id1.as_str().starts_with("worker-"));
    }

    #[test]
    fn fixed_clock_pins_timestamp_part() {
        let fixed_time = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let id_gen = UlidGenerator::new(ManualClock::new(fixed_time));

        let id1 = id_gen.generate_worker_id();
        let id2 = id_gen.generate_worker_id();
        assert_ne!(id1, id2);

        let parse = |id: &WorkerId| Ulid::from_string(&id.as_str()["worker-".len()..]).unwrap();
        assert_eq!(parse(&id1).timestamp_ms(), fixed_time.timestamp_millis() as u64);
        assert_eq!(parse(&id2).timestamp_ms(), fixed_time.timestamp_millis() as u64);
    }
}
