//! Snowflake-style unique id generation
//!
//! Ids are laid out as
//!
//! ```text
//! | 41 bits: ms since EPOCH_MS | 5 bits: data-center shard | 5 bits: worker shard | 12 bits: sequence |
//! ```
//!
//! The shard pair is derived once per process from the hostname and the
//! first non-loopback IPv4 address. Every lock session mints its fencing
//! secret from the process-wide generator returned by [`global`].

use std::sync::{Arc, LazyLock};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, warn};

use crate::error::LockError;
use crate::utils::{host_name, local_ip, shard_of};

/// Custom epoch (2019-10-31T12:33:38.655Z)
pub const EPOCH_MS: u64 = 1_572_525_218_655;

pub const WORKER_ID_BITS: u64 = 5;
pub const DATA_CENTER_ID_BITS: u64 = 5;
pub const SEQUENCE_BITS: u64 = 12;

pub const MAX_WORKER_ID: u64 = (1 << WORKER_ID_BITS) - 1;
pub const MAX_DATA_CENTER_ID: u64 = (1 << DATA_CENTER_ID_BITS) - 1;
pub const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

const WORKER_ID_SHIFT: u64 = SEQUENCE_BITS;
const DATA_CENTER_ID_SHIFT: u64 = SEQUENCE_BITS + WORKER_ID_BITS;
const TIMESTAMP_SHIFT: u64 = SEQUENCE_BITS + WORKER_ID_BITS + DATA_CENTER_ID_BITS;

/// Millisecond time source
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

/// Wall clock backed by `SystemTime`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

struct GeneratorState {
    last_timestamp: Option<u64>,
    sequence: u64,
}

/// Thread-safe snowflake id generator
pub struct UniqueIdGenerator {
    data_center_id: u64,
    worker_id: u64,
    clock: Arc<dyn Clock>,
    state: Mutex<GeneratorState>,
}

impl UniqueIdGenerator {
    /// Create a generator with explicit shard ids
    pub fn new(data_center_id: u64, worker_id: u64) -> Result<Self, LockError> {
        Self::with_clock(data_center_id, worker_id, Arc::new(SystemClock))
    }

    /// Create a generator driven by the given clock
    pub fn with_clock(
        data_center_id: u64,
        worker_id: u64,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, LockError> {
        if data_center_id > MAX_DATA_CENTER_ID {
            return Err(LockError::invalid_argument(format!(
                "data center id can't be greater than {}",
                MAX_DATA_CENTER_ID
            )));
        }
        if worker_id > MAX_WORKER_ID {
            return Err(LockError::invalid_argument(format!(
                "worker id can't be greater than {}",
                MAX_WORKER_ID
            )));
        }

        Ok(Self {
            data_center_id,
            worker_id,
            clock,
            state: Mutex::new(GeneratorState {
                last_timestamp: None,
                sequence: 0,
            }),
        })
    }

    /// Create a generator whose shards are derived from this host
    pub fn from_host() -> Self {
        let data_center_id = derive_shard("hostname", host_name());
        let worker_id = derive_shard("ip address", local_ip());
        debug!(data_center_id, worker_id, "Derived id generator shards");

        Self {
            data_center_id,
            worker_id,
            clock: Arc::new(SystemClock),
            state: Mutex::new(GeneratorState {
                last_timestamp: None,
                sequence: 0,
            }),
        }
    }

    pub fn data_center_id(&self) -> u64 {
        self.data_center_id
    }

    pub fn worker_id(&self) -> u64 {
        self.worker_id
    }

    /// Produce the next id
    ///
    /// Fails with `ClockRegression` if the clock reads earlier than the last
    /// issued timestamp. When the sequence wraps within one millisecond the
    /// call spins until the clock advances.
    pub fn next(&self) -> Result<u64, LockError> {
        let mut state = self.state.lock();
        let mut timestamp = self.clock.now_millis();

        match state.last_timestamp {
            Some(last) if timestamp < last => {
                warn!(
                    last_ms = last,
                    now_ms = timestamp,
                    "Clock moved backwards, refusing to generate id"
                );
                return Err(LockError::ClockRegression {
                    last_ms: last,
                    now_ms: timestamp,
                });
            }
            Some(last) if timestamp == last => {
                state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
                if state.sequence == 0 {
                    timestamp = self.wait_next_millis(last);
                }
            }
            _ => state.sequence = 0,
        }

        state.last_timestamp = Some(timestamp);

        Ok((timestamp.saturating_sub(EPOCH_MS) << TIMESTAMP_SHIFT)
            | (self.data_center_id << DATA_CENTER_ID_SHIFT)
            | (self.worker_id << WORKER_ID_SHIFT)
            | state.sequence)
    }

    /// Produce the next id rendered as a decimal string
    pub fn next_string(&self) -> Result<String, LockError> {
        self.next().map(|id| id.to_string())
    }

    fn wait_next_millis(&self, last: u64) -> u64 {
        let mut timestamp = self.clock.now_millis();
        while timestamp <= last {
            std::hint::spin_loop();
            timestamp = self.clock.now_millis();
        }
        timestamp
    }
}

fn derive_shard(signal: &str, value: Option<String>) -> u64 {
    match value {
        Some(v) => shard_of(&v),
        None => {
            let shard = rand::rng().random_range(0..=MAX_WORKER_ID);
            debug!(signal, shard, "Host signal unavailable, using random shard");
            shard
        }
    }
}

static GENERATOR: LazyLock<UniqueIdGenerator> = LazyLock::new(UniqueIdGenerator::from_host);

/// The process-wide generator, initialized on first use
pub fn global() -> &'static UniqueIdGenerator {
    &GENERATOR
}

/// Next id from the process-wide generator
pub fn next_id() -> Result<u64, LockError> {
    GENERATOR.next()
}

/// Next id from the process-wide generator, as a decimal string
pub fn next_string_id() -> Result<String, LockError> {
    GENERATOR.next_string()
}

/// The fields packed into an id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdParts {
    /// Milliseconds since the Unix epoch
    pub timestamp_ms: u64,
    pub data_center_id: u64,
    pub worker_id: u64,
    pub sequence: u64,
}

impl IdParts {
    pub fn decompose(id: u64) -> Self {
        Self {
            timestamp_ms: (id >> TIMESTAMP_SHIFT) + EPOCH_MS,
            data_center_id: (id >> DATA_CENTER_ID_SHIFT) & MAX_DATA_CENTER_ID,
            worker_id: (id >> WORKER_ID_SHIFT) & MAX_WORKER_ID,
            sequence: id & SEQUENCE_MASK,
        }
    }
}
