//! Run budget
//!
//! Step and cost counters are only ever incremented, so readers see
//! non-decreasing values. Launches reserve budget first: a step that could
//! push the run past a ceiling is never started.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Ceilings for one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetLimits {
    pub max_steps: u64,
    pub max_cost: u64,
    pub max_duration: Duration,
}

/// Which ceiling was hit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Exhaustion {
    Steps,
    Cost,
    Time,
}

impl fmt::Display for Exhaustion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exhaustion::Steps => write!(f, "step budget exhausted"),
            Exhaustion::Cost => write!(f, "cost budget exhausted"),
            Exhaustion::Time => write!(f, "wall-clock budget exhausted"),
        }
    }
}

/// Point-in-time view of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub steps_used: u64,
    pub cost_used: u64,
    pub tokens_used: u64,
    pub elapsed_ms: u64,
}

#[derive(Debug, Default)]
struct Ledger {
    launched: u64,
    cost_in_flight: u64,
}

#[derive(Debug)]
pub struct Budget {
    limits: BudgetLimits,
    started: Instant,
    steps_used: AtomicU64,
    cost_used: AtomicU64,
    tokens_used: AtomicU64,
    ledger: Mutex<Ledger>,
}

impl Budget {
    pub fn new(limits: BudgetLimits) -> Self {
        Self {
            limits,
            started: Instant::now(),
            steps_used: AtomicU64::new(0),
            cost_used: AtomicU64::new(0),
            tokens_used: AtomicU64::new(0),
            ledger: Mutex::new(Ledger::default()),
        }
    }

    pub fn limits(&self) -> &BudgetLimits {
        &self.limits
    }

    /// Instant at which the wall-clock budget runs out
    pub fn deadline(&self) -> Instant {
        self.started + self.limits.max_duration
    }

    /// Reserve one step costing up to `cost` units.
    ///
    /// Counts launched steps against `max_steps` and completed plus in-flight
    /// cost against `max_cost`.
    pub fn try_reserve(&self, cost: u64) -> Result<(), Exhaustion> {
        if Instant::now() >= self.deadline() {
            return Err(Exhaustion::Time);
        }

        let mut ledger = self.ledger.lock().unwrap_or_else(|p| p.into_inner());
        if ledger.launched >= self.limits.max_steps {
            return Err(Exhaustion::Steps);
        }
        let committed = self.cost_used.load(Ordering::SeqCst) + ledger.cost_in_flight;
        if committed.saturating_add(cost) > self.limits.max_cost {
            return Err(Exhaustion::Cost);
        }

        ledger.launched += 1;
        ledger.cost_in_flight += cost;
        Ok(())
    }

    /// Close a reservation of `reserved` units, charging `charged` of them
    pub fn settle(&self, reserved: u64, charged: u64) {
        let mut ledger = self.ledger.lock().unwrap_or_else(|p| p.into_inner());
        ledger.cost_in_flight = ledger.cost_in_flight.saturating_sub(reserved);
        self.steps_used.fetch_add(1, Ordering::SeqCst);
        self.cost_used.fetch_add(charged.min(reserved), Ordering::SeqCst);
    }

    pub fn add_tokens(&self, tokens: u64) {
        self.tokens_used.fetch_add(tokens, Ordering::SeqCst);
    }

    /// First ceiling that has been reached, if any
    pub fn exhausted(&self) -> Option<Exhaustion> {
        if self.steps_used.load(Ordering::SeqCst) >= self.limits.max_steps {
            Some(Exhaustion::Steps)
        } else if self.cost_used.load(Ordering::SeqCst) >= self.limits.max_cost {
            Some(Exhaustion::Cost)
        } else if Instant::now() >= self.deadline() {
            Some(Exhaustion::Time)
        } else {
            None
        }
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        BudgetSnapshot {
            steps_used: self.steps_used.load(Ordering::SeqCst),
            cost_used: self.cost_used.load(Ordering::SeqCst),
            tokens_used: self.tokens_used.load(Ordering::SeqCst),
            elapsed_ms: self.started.elapsed().as_millis() as u64,
        }
    }
}
