//! Monetary units and money range rules.

pub type Amount = i64;

pub const COIN: Amount = 100_000_000;
pub const CENT: Amount = 1_000_000;

/// No amount larger than this (in base units) is valid, colored or not.
pub const MAX_MONEY: Amount = 21_000_000 * COIN;

pub fn money_range(value: Amount) -> bool {
    (0..=MAX_MONEY).contains(&value)
}

/// Adds two amounts, failing if either the operands or the sum leave the money range.
pub fn checked_money_add(a: Amount, b: Amount) -> Option<Amount> {
    if !money_range(a) || !money_range(b) {
        return None;
    }
    let sum = a.checked_add(b)?;
    money_range(sum).then_some(sum)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn money_add_rejects_overflow() {
        assert_eq!(checked_money_add(COIN, COIN), Some(2 * COIN));
        assert_eq!(checked_money_add(MAX_MONEY, 1), None);
        assert_eq!(checked_money_add(-1, 1), None);
    }
}
