// Copyright 2023 Xayn AG
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Monetary values.
//!
//! Exactly two fractional digits, half-up rounding, decimal all the
//! way down. Percentages go through the full decimal precision and are
//! only cast to two digits at the end.

use std::{fmt::Display, iter::Sum, ops::{Add, Sub}};

use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;

// deliberately no Deserialize: inputs arrive as plain `Decimal` and
// must pass through `Money::new` so the 2-digit normalization holds
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub(crate) struct Money(Decimal);

impl Money {
    pub(crate) const ZERO: Money = Money(Decimal::ZERO);

    /// Normalizes to 2 fractional digits, half-up.
    pub(crate) fn new(amount: Decimal) -> Self {
        Self(amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero))
    }

    pub(crate) fn from_major_minor(major: i64, minor: u32) -> Self {
        Self::new(Decimal::new(major * 100 + i64::from(minor), 2))
    }

    pub(crate) fn amount(&self) -> Decimal {
        self.0
    }

    pub(crate) fn is_positive(&self) -> bool {
        self.0 > Decimal::ZERO
    }

    pub(crate) fn is_negative(&self) -> bool {
        self.0 < Decimal::ZERO
    }

    /// `self × percent / 100` at full precision, cast to 2 digits last.
    pub(crate) fn percentage(&self, percent: Decimal) -> Money {
        Money::new(self.0 * percent / Decimal::ONE_HUNDRED)
    }

    /// Scales by a day count (late fee accrual).
    pub(crate) fn times(&self, factor: i64) -> Money {
        Money::new(self.0 * Decimal::from(factor))
    }
}

impl From<Decimal> for Money {
    fn from(amount: Decimal) -> Self {
        Self::new(amount)
    }
}

impl Add for Money {
    type Output = Money;

    fn add(self, other: Money) -> Money {
        Money::new(self.0 + other.0)
    }
}

impl Sub for Money {
    type Output = Money;

    fn sub(self, other: Money) -> Money {
        Money::new(self.0 - other.0)
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money {
        Money::new(iter.map(|money| money.0).sum())
    }
}

impl Display for Money {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    fn decimal(value: &str) -> Decimal {
        Decimal::from_str(value).unwrap()
    }

    #[test]
    fn test_half_up_rounding() {
        assert_eq!(Money::new(decimal("1.005")).to_string(), "1.01");
        assert_eq!(Money::new(decimal("1.004")).to_string(), "1.00");
        assert_eq!(Money::new(decimal("-1.005")).to_string(), "-1.01");
        assert_eq!(Money::new(decimal("2.675")).to_string(), "2.68");
    }

    #[test]
    fn test_no_binary_float_dust_in_sums() {
        // 0.1 + 0.2 style sums stay exact in decimal
        let total: Money = (0..10).map(|_| Money::new(decimal("0.10"))).sum();
        assert_eq!(total, Money::new(decimal("1.00")));

        let total: Money = [decimal("0.10"), decimal("0.20")]
            .into_iter()
            .map(Money::new)
            .sum();
        assert_eq!(total.to_string(), "0.30");
    }

    #[test]
    fn test_percentage_uses_full_precision_intermediate() {
        let base = Money::new(decimal("3333.33"));
        // intermediate 1111.10999.. would truncate to 1111.10 at low
        // precision, full precision rounds half-up to 1111.11
        let third = base.percentage(decimal("33.333333333333333333"));
        assert_eq!(third.to_string(), "1111.11");
    }

    #[test]
    fn test_late_fee_accrual() {
        let per_day = Money::new(decimal("12.50"));
        assert_eq!(per_day.times(0), Money::ZERO);
        assert_eq!(per_day.times(3).to_string(), "37.50");
    }

    #[test]
    fn test_ordering_and_arithmetic() {
        let a = Money::from_major_minor(100, 50);
        let b = Money::from_major_minor(99, 99);
        assert!(a > b);
        assert_eq!((a - b).to_string(), "0.51");
        assert_eq!((a + b).to_string(), "200.49");
        assert!((b - a).is_negative());
    }
}
