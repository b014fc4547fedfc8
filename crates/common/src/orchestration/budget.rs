//! Budget governor
//!
//! Pure functions over a [`BudgetLedger`]: nothing here reads a clock or
//! keeps hidden state. The executor feeds in the run clock and the cost of
//! each step, and applies the returned ledger.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::RunConfig;

/// Ceiling that stopped the run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BudgetDenial {
    RunWallClock,
    Steps,
    Tokens,
}

impl BudgetDenial {
    pub fn as_str(&self) -> &'static str {
        match self {
            BudgetDenial::RunWallClock => "run_wall_clock",
            BudgetDenial::Steps => "steps",
            BudgetDenial::Tokens => "tokens",
        }
    }
}

impl std::fmt::Display for BudgetDenial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            BudgetDenial::RunWallClock => "run wall-clock ceiling reached",
            BudgetDenial::Steps => "step ceiling reached",
            BudgetDenial::Tokens => "token ceiling reached",
        };
        f.write_str(text)
    }
}

/// Spend against the ceilings of one run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BudgetLedger {
    pub max_wall_clock_ms: u64,
    pub max_step_wall_clock_ms: u64,
    pub max_steps: u32,
    pub max_tokens: u64,
    pub spent_wall_clock_ms: u64,
    pub spent_steps: u32,
    pub spent_tokens: u64,
    /// Set once a ceiling is crossed; terminal for the run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exhausted: Option<BudgetDenial>,
}

impl BudgetLedger {
    pub fn new(config: &RunConfig) -> Self {
        Self {
            max_wall_clock_ms: config.max_wall_clock_per_run_ms,
            max_step_wall_clock_ms: config.max_wall_clock_per_step_ms,
            max_steps: config.max_steps,
            max_tokens: config.max_tokens_per_run,
            spent_wall_clock_ms: 0,
            spent_steps: 0,
            spent_tokens: 0,
            exhausted: None,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted.is_some()
    }

    pub fn remaining_wall_clock(&self) -> Duration {
        Duration::from_millis(self.max_wall_clock_ms.saturating_sub(self.spent_wall_clock_ms))
    }

    /// Mark the ledger exhausted, keeping the first reason
    pub fn exhaust(mut self, reason: BudgetDenial) -> Self {
        self.exhausted.get_or_insert(reason);
        self
    }
}

/// Cost of a step: proposed before it runs, actual once it settles
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepCost {
    pub steps: u32,
    pub tokens: u64,
    /// Run clock reading at the time of the decision or settlement
    pub wall_clock_ms: u64,
}

impl StepCost {
    /// Zero-cost probe used to check the clock at a state transition
    pub fn probe(wall_clock_ms: u64) -> Self {
        Self { steps: 0, tokens: 0, wall_clock_ms }
    }

    pub fn step(tokens: u64, wall_clock_ms: u64) -> Self {
        Self { steps: 1, tokens, wall_clock_ms }
    }
}

/// Outcome of asking the governor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Step may run for at most `timeout`
    Authorized { timeout: Duration },
    Denied(BudgetDenial),
}

/// Decide whether a step of the proposed cost may run.
///
/// The run clock is checked before the step and token ceilings, so a run
/// that is out of time aborts even when it is also out of steps. A step whose
/// expected duration only exceeds the per-step ceiling is authorized with its
/// timeout clamped.
pub fn decide(ledger: &BudgetLedger, proposed: &StepCost) -> Decision {
    if let Some(reason) = ledger.exhausted {
        return Decision::Denied(reason);
    }

    let clock = proposed.wall_clock_ms.max(ledger.spent_wall_clock_ms);
    if clock >= ledger.max_wall_clock_ms {
        return Decision::Denied(BudgetDenial::RunWallClock);
    }

    if ledger.spent_steps.saturating_add(proposed.steps) > ledger.max_steps {
        return Decision::Denied(BudgetDenial::Steps);
    }

    if proposed.tokens > 0 && ledger.spent_tokens.saturating_add(proposed.tokens) > ledger.max_tokens {
        return Decision::Denied(BudgetDenial::Tokens);
    }

    let remaining = ledger.max_wall_clock_ms - clock;
    Decision::Authorized {
        timeout: Duration::from_millis(ledger.max_step_wall_clock_ms.min(remaining)),
    }
}

pub fn authorize(ledger: &BudgetLedger, proposed: &StepCost) -> bool {
    matches!(decide(ledger, proposed), Decision::Authorized { .. })
}

/// Apply the actual cost of a step, marking the ledger exhausted when a
/// ceiling is crossed.
pub fn record(ledger: &BudgetLedger, actual: &StepCost) -> BudgetLedger {
    let mut next = ledger.clone();
    next.spent_steps = next.spent_steps.saturating_add(actual.steps);
    next.spent_tokens = next.spent_tokens.saturating_add(actual.tokens);
    next.spent_wall_clock_ms = next.spent_wall_clock_ms.max(actual.wall_clock_ms);

    if next.spent_wall_clock_ms >= next.max_wall_clock_ms {
        next = next.exhaust(BudgetDenial::RunWallClock);
    } else if next.spent_steps > next.max_steps {
        next = next.exhaust(BudgetDenial::Steps);
    } else if next.spent_tokens > next.max_tokens {
        next = next.exhaust(BudgetDenial::Tokens);
    }
    next
}
