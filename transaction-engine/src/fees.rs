//! Transfer fees

use crate::error::{Result, TransactionError};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Percentage plus fixed fee, in minor units
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeeSchedule {
    /// Percent of the principal (0.5 = 0.5%)
    pub percentage: Decimal,

    /// Flat amount added to every transfer
    pub fixed: i64,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            percentage: Decimal::new(5, 1),
            fixed: 50,
        }
    }
}

impl FeeSchedule {
    /// `floor(amount * percentage / 100) + fixed`
    pub fn fee(&self, amount: i64) -> Result<i64> {
        if amount <= 0 {
            return Err(TransactionError::Validation("amount must be positive".to_string()));
        }
        let variable = Decimal::from(amount)
            .checked_mul(self.percentage)
            .and_then(|v| v.checked_div(Decimal::ONE_HUNDRED))
            .and_then(|v| v.floor().to_i64())
            .ok_or_else(|| TransactionError::Validation("fee overflow".to_string()))?;
        variable
            .checked_add(self.fixed)
            .ok_or_else(|| TransactionError::Validation("fee overflow".to_string()))
    }

    /// Principal plus fee
    pub fn total(&self, amount: i64) -> Result<(i64, i64)> {
        let fee = self.fee(amount)?;
        let total = amount
            .checked_add(fee)
            .ok_or_else(|| TransactionError::Validation("total overflow".to_string()))?;
        Ok((fee, total))
    }
}
