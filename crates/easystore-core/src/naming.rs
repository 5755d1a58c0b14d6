//! File name validation and minting
//!
//! ## Validation
//!
//! Container file names are UTF-8, at most 65535 bytes, NUL-free, carry no
//! path-traversal sequences, and no leading or trailing whitespace.
//! [`validate_name`] is the single gate the writer applies on every `add`.
//!
//! ## Generation
//!
//! [`NameGenerator`] mints names of the shape
//!
//! ```text
//! <PREFIX>_YYYYMMDD_<12hex>_<2hex>
//! ```
//!
//! where the 12-hex block encodes
//! `((epoch_ms & ((1 << wrap_bits) - 1)) << 8) | node_id` and the 2-hex
//! suffix is a same-day in-process counter. Two calls on the same
//! `(node_id, millisecond)` can never mint the same name: the counter
//! advances on every call and the generator waits out the millisecond if a
//! single one would otherwise see more than 256 names.
//!
//! The generator is deterministic given `(prefix, node_id, wrap_bits,
//! clock)`; tests inject a fixed [`Clock`].

use std::sync::{Arc, Mutex};

use chrono::{DateTime, NaiveDate};

use crate::error::{CoreError, Result};

/// Validate a container file name.
pub fn validate_name(name: &str) -> Result<()> {
    let fail = |reason| {
        Err(CoreError::InvalidName {
            name: name.to_string(),
            reason,
        })
    };

    if name.is_empty() {
        return fail("name is empty");
    }
    if name.len() > u16::MAX as usize {
        return fail("name exceeds 65535 bytes");
    }
    if name.contains('\0') {
        return fail("name contains NUL");
    }
    if name.contains("..") {
        return fail("name contains a path-traversal sequence");
    }
    if name.contains('/') || name.contains('\\') {
        return fail("name contains a path separator");
    }
    if name != name.trim() {
        return fail("name has leading or trailing whitespace");
    }
    Ok(())
}

/// Millisecond clock, injectable for deterministic tests.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// Wall clock (milliseconds since the Unix epoch).
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Name generator configuration.
#[derive(Debug, Clone)]
pub struct NameGeneratorConfig {
    /// ASCII letters and digits only, non-empty.
    pub prefix: String,
    /// Worker identity embedded in the low 8 bits of the hex block.
    pub node_id: u8,
    /// How many low bits of `epoch_ms` enter the hex block (1..=32).
    pub wrap_bits: u8,
}

impl Default for NameGeneratorConfig {
    fn default() -> Self {
        Self {
            prefix: "DES".to_string(),
            node_id: 0,
            wrap_bits: 32,
        }
    }
}

struct GeneratorState {
    last_ms: i64,
    calls_this_ms: u32,
    day: Option<NaiveDate>,
    seq: u8,
}

/// Mints collision-free container file names.
pub struct NameGenerator {
    config: NameGeneratorConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<GeneratorState>,
}

impl NameGenerator {
    pub fn new(config: NameGeneratorConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: NameGeneratorConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        if config.prefix.is_empty() {
            return Err(CoreError::Config("name prefix must be non-empty".into()));
        }
        if !config.prefix.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(CoreError::Config(
                "name prefix may only use ASCII letters and digits".into(),
            ));
        }
        if !(1..=32).contains(&config.wrap_bits) {
            return Err(CoreError::Config("wrap_bits must be in [1, 32]".into()));
        }
        Ok(Self {
            config,
            clock,
            state: Mutex::new(GeneratorState {
                last_ms: -1,
                calls_this_ms: 0,
                day: None,
                seq: 0,
            }),
        })
    }

    /// Mint the next name.
    pub fn next(&self) -> String {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        let mut now = self.clock.now_ms();
        if now < state.last_ms {
            // Clock went backwards; stick to the last observed millisecond.
            now = state.last_ms;
        }

        if now == state.last_ms {
            state.calls_this_ms += 1;
            if state.calls_this_ms > u8::MAX as u32 + 1 {
                // 256 names already minted this millisecond; wait it out so
                // the (node_id, ms, counter) triple stays unique.
                while now <= state.last_ms {
                    now = self.clock.now_ms();
                }
                state.calls_this_ms = 1;
            }
        } else {
            state.calls_this_ms = 1;
        }
        state.last_ms = now;

        let day = DateTime::from_timestamp_millis(now)
            .map(|dt| dt.date_naive())
            .unwrap_or_default();
        match state.day {
            Some(current) if current == day => state.seq = state.seq.wrapping_add(1),
            _ => {
                state.day = Some(day);
                state.seq = 0;
            }
        }

        let mask = (1u64 << self.config.wrap_bits) - 1;
        let block = ((now as u64 & mask) << 8) | u64::from(self.config.node_id);

        format!(
            "{}_{}_{:012X}_{:02X}",
            self.config.prefix,
            day.format("%Y%m%d"),
            block,
            state.seq
        )
    }
}
