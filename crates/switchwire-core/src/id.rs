//! Snowflake connection IDs.
//!
//! Layout: 41 bits of milliseconds since the Twitter epoch, 10 bits of
//! machine id, 12 bits of per-millisecond sequence.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

const EPOCH_MS: i64 = 1_288_834_974_657;
const MACHINE_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
const MAX_MACHINE: i64 = (1 << MACHINE_BITS) - 1;
const SEQUENCE_MASK: i64 = (1 << SEQUENCE_BITS) - 1;

/// Error building or driving an [`IdGenerator`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    #[error("machine id must be between 0 and 1023, got {0}")]
    MachineOutOfRange(i64),
    #[error("clock moved backwards by {0}ms")]
    ClockBackwards(i64),
}

#[derive(Debug, Default)]
struct State {
    last_ms: i64,
    sequence: i64,
}

/// Generates unique, time-ordered IDs with an optional string prefix.
#[derive(Debug)]
pub struct IdGenerator {
    machine: i64,
    prefix: String,
    state: Mutex<State>,
}

impl IdGenerator {
    pub fn new(machine: i64, prefix: impl Into<String>) -> Result<Self, IdError> {
        if !(0..=MAX_MACHINE).contains(&machine) {
            return Err(IdError::MachineOutOfRange(machine));
        }
        Ok(Self {
            machine,
            prefix: prefix.into(),
            state: Mutex::new(State::default()),
        })
    }

    /// Generator used for client connection IDs.
    pub fn connections() -> Self {
        Self {
            machine: 1,
            prefix: "CONNECTION_ID:".to_string(),
            state: Mutex::new(State::default()),
        }
    }

    pub fn next_id(&self) -> Result<i64, IdError> {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut now = now_ms();
        if now < state.last_ms {
            return Err(IdError::ClockBackwards(state.last_ms - now));
        }
        if now == state.last_ms {
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                while now <= state.last_ms {
                    std::hint::spin_loop();
                    now = now_ms();
                }
            }
        } else {
            state.sequence = 0;
        }
        state.last_ms = now;
        Ok(((now - EPOCH_MS) << (MACHINE_BITS + SEQUENCE_BITS))
            | (self.machine << SEQUENCE_BITS)
            | state.sequence)
    }

    /// Next ID rendered with this generator's prefix.
    pub fn next_prefixed(&self) -> Result<String, IdError> {
        Ok(format!("{}{}", self.prefix, self.next_id()?))
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(EPOCH_MS)
}
