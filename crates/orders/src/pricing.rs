//! Order totals.
//!
//! `total = subtotal - discount + tax`, where
//! `tax = round_half_up((subtotal - discount) * tax_rate_bps / 10_000)`.

use serde::{Deserialize, Serialize};

use atelier_core::{DomainError, DomainResult, Money};

/// 100 %.
pub const MAX_TAX_RATE_BPS: u32 = 10_000;

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderTotals {
    pub subtotal: Money,
    pub discount: Money,
    pub tax_rate_bps: u32,
    pub tax_amount: Money,
    pub total: Money,
}

pub fn line_total(unit_price: Money, quantity: u64) -> DomainResult<Money> {
    unit_price
        .checked_mul(quantity)
        .ok_or_else(|| DomainError::validation("line total overflows"))
}

impl OrderTotals {
    /// Totals for `(unit_price, quantity)` lines.
    pub fn compute<I>(lines: I, discount: Money, tax_rate_bps: u32) -> DomainResult<Self>
    where
        I: IntoIterator<Item = (Money, u64)>,
    {
        if tax_rate_bps > MAX_TAX_RATE_BPS {
            return Err(DomainError::validation(format!(
                "tax rate {tax_rate_bps} bps exceeds 100%"
            )));
        }

        let mut subtotal = Money::ZERO;
        for (unit_price, quantity) in lines {
            subtotal = subtotal
                .checked_add(line_total(unit_price, quantity)?)
                .ok_or_else(|| DomainError::validation("subtotal overflows"))?;
        }

        let taxable = subtotal.checked_sub(discount).ok_or_else(|| {
            DomainError::validation(format!("discount {discount} exceeds subtotal {subtotal}"))
        })?;
        let tax_amount = taxable
            .basis_points(tax_rate_bps)
            .ok_or_else(|| DomainError::validation("tax overflows"))?;
        let total = taxable
            .checked_add(tax_amount)
            .ok_or_else(|| DomainError::validation("total overflows"))?;

        Ok(Self {
            subtotal,
            discount,
            tax_rate_bps,
            tax_amount,
            total,
        })
    }
}
