//! Value objects shared by orders, stock and balances.

use serde::{Deserialize, Serialize};

/// Money amount in minor units (cents) to avoid floating point issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money {
    cents: i64,
}

impl Money {
    /// Creates a new Money amount from cents.
    pub fn from_cents(cents: i64) -> Self {
        Self { cents }
    }

    /// Returns zero money.
    pub fn zero() -> Self {
        Self { cents: 0 }
    }

    /// Returns the amount in cents.
    pub fn cents(&self) -> i64 {
        self.cents
    }

    pub fn is_negative(&self) -> bool {
        self.cents < 0
    }

    /// Subtracts `other`, returning `None` if the result would go negative.
    pub fn checked_debit(&self, other: Money) -> Option<Money> {
        let rest = self.cents.checked_sub(other.cents)?;
        (rest >= 0).then_some(Money { cents: rest })
    }
}

impl Default for Money {
    fn default() -> Self {
        Self::zero()
    }
}

impl std::fmt::Display for Money {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sign = if self.cents < 0 { "-" } else { "" };
        let abs = self.cents.unsigned_abs();
        write!(f, "{sign}${}.{:02}", abs / 100, abs % 100)
    }
}

impl std::ops::Add for Money {
    type Output = Money;

    fn add(self, rhs: Self) -> Self::Output {
        Money {
            cents: self.cents + rhs.cents,
        }
    }
}

impl std::ops::Sub for Money {
    type Output = Money;

    fn sub(self, rhs: Self) -> Self::Output {
        Money {
            cents: self.cents - rhs.cents,
        }
    }
}

impl std::ops::AddAssign for Money {
    fn add_assign(&mut self, rhs: Self) {
        self.cents += rhs.cents;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_money_display() {
        assert_eq!(Money::from_cents(1234).to_string(), "$12.34");
        assert_eq!(Money::from_cents(5).to_string(), "$0.05");
        assert_eq!(Money::from_cents(-1234).to_string(), "-$12.34");
    }

    #[test]
    fn test_checked_debit() {
        let balance = Money::from_cents(100);
        assert_eq!(
            balance.checked_debit(Money::from_cents(25)),
            Some(Money::from_cents(75))
        );
        assert_eq!(
            balance.checked_debit(Money::from_cents(100)),
            Some(Money::zero())
        );
        assert_eq!(balance.checked_debit(Money::from_cents(101)), None);
    }

    #[test]
    fn test_money_arithmetic() {
        let mut a = Money::from_cents(1000);
        a += Money::from_cents(500);
        assert_eq!(a.cents(), 1500);
        assert_eq!((a - Money::from_cents(1500)).cents(), 0);
    }
}
