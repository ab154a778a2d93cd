//! Cost governance for metered calls.
//!
//! Every metered call is recorded against the run's State as soon as it
//! returns. The hard ceiling is checked after each call, so a step issuing
//! several calls can be halted part-way through; the call that tips the
//! budget over is still counted.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::domain::{BudgetLimits, State};

/// Usage reported by one metered call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Price table key (usually a model name)
    pub kind: String,

    #[serde(default)]
    pub input_units: u64,

    #[serde(default)]
    pub output_units: u64,
}

impl Usage {
    pub fn new(kind: impl Into<String>, input_units: u64, output_units: u64) -> Self {
        Self {
            kind: kind.into(),
            input_units,
            output_units,
        }
    }

    pub fn total_units(&self) -> u64 {
        self.input_units.saturating_add(self.output_units)
    }
}

/// USD price per 1,000 units
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UnitPrice {
    #[serde(default)]
    pub input_per_1k: f64,

    #[serde(default)]
    pub output_per_1k: f64,
}

impl UnitPrice {
    pub fn new(input_per_1k: f64, output_per_1k: f64) -> Self {
        Self {
            input_per_1k,
            output_per_1k,
        }
    }

    /// Same price for input and output units
    pub fn flat(per_1k: f64) -> Self {
        Self::new(per_1k, per_1k)
    }

    /// Finite and non-negative on both sides
    pub fn is_valid(&self) -> bool {
        [self.input_per_1k, self.output_per_1k]
            .iter()
            .all(|p| p.is_finite() && *p >= 0.0)
    }
}

/// Per-kind unit prices
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PriceTable {
    prices: HashMap<String, UnitPrice>,
}

impl PriceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Common hosted-model prices
    pub fn standard() -> Self {
        Self::new()
            .with_price("claude-3-5-sonnet", UnitPrice::new(0.003, 0.015))
            .with_price("claude-3-haiku", UnitPrice::new(0.00025, 0.00125))
            .with_price("gpt-4o", UnitPrice::new(0.0025, 0.01))
            .with_price("gpt-4o-mini", UnitPrice::new(0.00015, 0.0006))
    }

    pub fn with_price(mut self, kind: impl Into<String>, price: UnitPrice) -> Self {
        self.prices.insert(kind.into(), price);
        self
    }

    /// Add or replace entries from another table
    pub fn merge(&mut self, other: PriceTable) {
        self.prices.extend(other.prices);
    }

    pub fn get(&self, kind: &str) -> Option<&UnitPrice> {
        self.prices.get(kind)
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }

    /// Kinds whose prices are negative or not finite, sorted
    pub fn invalid_kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self
            .prices
            .iter()
            .filter(|(_, price)| !price.is_valid())
            .map(|(kind, _)| kind.as_str())
            .collect();
        kinds.sort_unstable();
        kinds
    }

    /// Cost of a call; unknown kinds cost nothing
    pub fn cost(&self, usage: &Usage) -> f64 {
        match self.prices.get(&usage.kind) {
            Some(price) => {
                usage.input_units as f64 / 1000.0 * price.input_per_1k
                    + usage.output_units as f64 / 1000.0 * price.output_per_1k
            }
            None => 0.0,
        }
    }
}

/// Raised when accrued cost passes the hard ceiling
#[derive(Debug, Clone, Copy, PartialEq, Error)]
#[error("Budget exceeded: ${total_cost:.4} > ${limit:.4}")]
pub struct BudgetExceeded {
    pub total_cost: f64,
    pub limit: f64,
}

/// Accumulates usage for a run and enforces its budget
#[derive(Debug, Clone, Default)]
pub struct CallGovernor {
    prices: PriceTable,
}

impl CallGovernor {
    pub fn new(prices: PriceTable) -> Self {
        Self { prices }
    }

    pub fn prices(&self) -> &PriceTable {
        &self.prices
    }

    /// Record a call against the run's own budget
    pub fn record(&self, usage: &Usage, state: &mut State) -> Result<f64, BudgetExceeded> {
        let limits = state.config.budget;
        self.record_with_limits(usage, state, limits)
    }

    /// Record a call and check it against explicit limits.
    ///
    /// Returns the cost of this call.
    pub fn record_with_limits(
        &self,
        usage: &Usage,
        state: &mut State,
        limits: BudgetLimits,
    ) -> Result<f64, BudgetExceeded> {
        let cost = self.prices.cost(usage);
        if self.prices.get(&usage.kind).is_none() {
            tracing::debug!(kind = %usage.kind, "No price for usage kind; counting units only");
        }

        state.total_units = state.total_units.saturating_add(usage.total_units());
        state.total_cost += cost;

        if state.total_cost > limits.hard_limit_usd {
            warn!(
                run_id = %state.run_id(),
                total_cost = state.total_cost,
                limit = limits.hard_limit_usd,
                "Budget ceiling exceeded"
            );
            return Err(BudgetExceeded {
                total_cost: state.total_cost,
                limit: limits.hard_limit_usd,
            });
        }

        if state.total_cost > limits.warn_limit_usd && !state.budget_warned {
            state.budget_warned = true;
            warn!(
                run_id = %state.run_id(),
                total_cost = state.total_cost,
                warn_limit = limits.warn_limit_usd,
                hard_limit = limits.hard_limit_usd,
                "Budget warning threshold passed"
            );
        }

        Ok(cost)
    }
}

/// Log accumulated usage for a run
pub fn log_usage_summary(state: &State) {
    info!(
        run_id = %state.run_id(),
        total_units = state.total_units,
        total_cost = format!("${:.4}", state.total_cost),
        budget = format!("${:.2}", state.config.budget.hard_limit_usd),
        units_attempted = state.units_attempted,
        units_succeeded = state.units_succeeded,
        failures = state.failures.len(),
        "Usage summary"
    );
}
