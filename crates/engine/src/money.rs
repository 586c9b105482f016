use std::{
    fmt,
    iter::Sum,
    ops::{Add, Neg, Sub},
};

use serde::{Deserialize, Serialize};

/// Signed money amount represented as **integer cents** (minor units).
///
/// The source platform reports amounts as floating point numbers; they are
/// rounded to 2 decimals once, at ingestion, and every amount the engine sums,
/// compares or splits afterwards is a `Money`.
///
/// The value is signed:
/// - positive = spend / charge
/// - negative = refund / credit
///
/// # Examples
///
/// ```rust
/// use engine::Money;
///
/// let amount = Money::from_major(12.346);
/// assert_eq!(amount.cents(), 1235);
/// assert_eq!(amount.to_string(), "12.35");
/// ```
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
#[repr(transparent)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    /// Creates a new amount from integer cents.
    #[must_use]
    pub const fn new(cents: i64) -> Self {
        Self(cents)
    }

    /// Rounds a major-unit amount to 2 decimals (half away from zero).
    #[must_use]
    pub fn from_major(value: f64) -> Self {
        Self((value * 100.0).round() as i64)
    }

    /// Returns the raw value in cents.
    #[must_use]
    pub const fn cents(self) -> i64 {
        self.0
    }

    /// Returns the amount in major units.
    #[must_use]
    pub fn to_major(self) -> f64 {
        self.0 as f64 / 100.0
    }

    /// Returns `true` if the amount is 0.
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Returns `true` if the amount is negative.
    #[must_use]
    pub const fn is_negative(self) -> bool {
        self.0 < 0
    }

    /// Multiplies by a rate and rounds back to cents.
    #[must_use]
    pub fn scale(self, factor: f64) -> Self {
        Self((self.0 as f64 * factor).round() as i64)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let units = abs / 100;
        let cents = abs % 100;
        write!(f, "{sign}{units}.{cents:02}")
    }
}

impl Add for Money {
    type Output = Money;

    fn add(self, rhs: Money) -> Self::Output {
        Money(self.0 + rhs.0)
    }
}

impl Sub for Money {
    type Output = Money;

    fn sub(self, rhs: Money) -> Self::Output {
        Money(self.0 - rhs.0)
    }
}

impl Neg for Money {
    type Output = Money;

    fn neg(self) -> Self::Output {
        Money(-self.0)
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Self {
        iter.fold(Money::ZERO, Add::add)
    }
}

impl<'a> Sum<&'a Money> for Money {
    fn sum<I: Iterator<Item = &'a Money>>(iter: I) -> Self {
        iter.copied().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_major_rounds_to_two_decimals() {
        assert_eq!(Money::from_major(10.0).cents(), 1000);
        assert_eq!(Money::from_major(0.006).cents(), 1);
        assert_eq!(Money::from_major(-20.004).cents(), -2000);
        assert_eq!(Money::from_major(99.999).cents(), 10000);
    }

    #[test]
    fn display_formats_two_decimals() {
        assert_eq!(Money::new(0).to_string(), "0.00");
        assert_eq!(Money::new(1).to_string(), "0.01");
        assert_eq!(Money::new(1050).to_string(), "10.50");
        assert_eq!(Money::new(-1050).to_string(), "-10.50");
    }

    #[test]
    fn sum_of_signed_amounts() {
        let total: Money = [Money::new(1000), Money::new(500), Money::new(-2000)]
            .iter()
            .sum();
        assert_eq!(total, Money::new(-500));
        assert!(total.is_negative());
    }

    #[test]
    fn scale_rounds_back_to_cents() {
        assert_eq!(Money::new(1000).scale(0.2 / 1.2), Money::new(167));
        assert_eq!(-Money::new(1050) - Money::new(50), Money::new(-1100));
    }
}
