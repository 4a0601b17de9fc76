//! Absolute-or-percentage budgets (`3` or `"25%"`).

use serde::{Deserialize, Serialize};

use crate::ReconcileError;

/// A budget given either as an absolute count or a percentage of replicas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IntOrPercent {
    Int(i32),
    Percent(String),
}

impl IntOrPercent {
    /// Convenience constructor for a percentage budget.
    pub fn percent(pct: u32) -> Self {
        Self::Percent(format!("{pct}%"))
    }

    /// Resolves the budget against `total`.
    ///
    /// Percentages round up when `round_up` is set and down otherwise.
    pub fn scaled_value(&self, total: i32, round_up: bool) -> Result<i32, ReconcileError> {
        match self {
            IntOrPercent::Int(v) if *v < 0 => Err(ReconcileError::Negative {
                field: "int-or-percent",
                value: i64::from(*v),
            }),
            IntOrPercent::Int(v) => Ok(*v),
            IntOrPercent::Percent(s) => {
                let pct: i64 = s
                    .strip_suffix('%')
                    .and_then(|n| n.trim().parse().ok())
                    .filter(|n: &i64| *n >= 0)
                    .ok_or_else(|| ReconcileError::InvalidIntOrPercent(s.clone()))?;
                let overflow = || ReconcileError::InvalidIntOrPercent(s.clone());
                let scaled = i64::from(total.max(0)).checked_mul(pct).ok_or_else(overflow)?;
                let value = if round_up {
                    scaled.checked_add(99).ok_or_else(overflow)? / 100
                } else {
                    scaled / 100
                };
                i32::try_from(value).map_err(|_| overflow())
            }
        }
    }
}

impl std::fmt::Display for IntOrPercent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IntOrPercent::Int(v) => write!(f, "{v}"),
            IntOrPercent::Percent(s) => f.write_str(s),
        }
    }
}
