//! Token rules: which colored outputs a transaction may create, and value
//! conservation per color.

use std::collections::BTreeMap;

use tapd_consensus::money::{checked_money_add, Amount};
use tapd_primitives::color::{color_of_script, ColorIdentifier, TokenType};
use tapd_primitives::transaction::Transaction;

use crate::coins::Coin;
use crate::script_check::ColorAmounts;
use crate::validation::{RejectCode, Rejection};

fn reject(reason: &'static str) -> Rejection {
    Rejection::consensus(100, RejectCode::Invalid, reason)
}

/// Every colored output must be a first issuance derivable from the inputs
/// or a transfer of a color an input already carries. NFT outputs hold exactly 1.
pub fn check_colored_outputs(tx: &Transaction, coins: &[Coin]) -> Result<(), Rejection> {
    let input_colors: Vec<ColorIdentifier> =
        coins.iter().map(|coin| coin.color().matching_key()).collect();
    for output in &tx.vout {
        let color = color_of_script(&output.script_pubkey).matching_key();
        if !color.is_colored() {
            continue;
        }
        if matches!(color, ColorIdentifier::Nft(_)) && output.value != 1 {
            return Err(reject("bad-txns-nft-output-value"));
        }
        if input_colors.contains(&color) {
            continue;
        }
        let issued = match color.token_type() {
            Some(TokenType::Reissuable) => coins
                .iter()
                .zip(&input_colors)
                .filter(|(_, input_color)| **input_color == ColorIdentifier::None)
                .any(|(coin, _)| ColorIdentifier::reissuable(&coin.script_pubkey) == color),
            Some(kind) => tx
                .vin
                .iter()
                .any(|input| ColorIdentifier::from_outpoint(kind, &input.prevout) == color),
            None => false,
        };
        if !issued {
            return Err(reject("bad-txns-token-invalid-colorid"));
        }
    }
    Ok(())
}

pub fn output_color_sums(tx: &Transaction) -> Result<ColorAmounts, Rejection> {
    let mut sums = BTreeMap::new();
    for output in &tx.vout {
        let entry = sums
            .entry(color_of_script(&output.script_pubkey).matching_key())
            .or_insert(0);
        *entry = checked_money_add(*entry, output.value)
            .ok_or_else(|| reject("bad-txns-txouttotal-toolarge"))?;
    }
    Ok(sums)
}

/// Token conservation. Colored outputs without a matching colored input are
/// an issuance and need the uncolored surplus to cover `min_fee`; otherwise
/// they may not exceed the matching input. Leftover colored input is change.
pub fn verify_balances(
    tx: &Transaction,
    input_sums: &ColorAmounts,
    min_fee: Amount,
) -> Result<(), Rejection> {
    let output_sums = output_color_sums(tx)?;
    let uncolored_in = input_sums.get(&ColorIdentifier::None).copied().unwrap_or(0);
    if uncolored_in <= 0 {
        return Err(reject("bad-txns-token-without-fee"));
    }
    let uncolored_out = output_sums.get(&ColorIdentifier::None).copied().unwrap_or(0);
    let surplus = uncolored_in - uncolored_out - min_fee;
    for (color, out_value) in &output_sums {
        if *color == ColorIdentifier::None {
            continue;
        }
        match input_sums.get(color) {
            None if surplus < 0 => return Err(reject("bad-txns-token-without-fee")),
            None => {}
            Some(in_value) if out_value > in_value => {
                return Err(reject("bad-txns-token-balance").with_debug(format!(
                    "{color}: out {out_value} > in {in_value}"
                )))
            }
            Some(_) => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tapd_primitives::color::colored_script;
    use tapd_primitives::outpoint::OutPoint;
    use tapd_primitives::transaction::{TxIn, TxOut};

    const BASE: [u8; 2] = [0x51, 0x87];

    fn tx(prevouts: &[OutPoint], outputs: Vec<(ColorIdentifier, Amount)>) -> Transaction {
        Transaction {
            features: 1,
            vin: prevouts
                .iter()
                .map(|prevout| TxIn {
                    prevout: *prevout,
                    script_sig: Vec::new(),
                    sequence: u32::MAX,
                })
                .collect(),
            vout: outputs
                .into_iter()
                .map(|(color, value)| TxOut {
                    value,
                    script_pubkey: colored_script(&color, &BASE),
                })
                .collect(),
            lock_time: 0,
        }
    }

    fn sums(entries: &[(ColorIdentifier, Amount)]) -> ColorAmounts {
        entries.iter().copied().collect()
    }

    #[test]
    fn non_reissuable_issue_then_overspend() {
        let funding = OutPoint::new([4u8; 32], 1);
        let color = ColorIdentifier::from_outpoint(TokenType::NonReissuable, &funding);
        let coin = Coin::new(1_000, vec![0x51], 1, false);

        let issue = tx(&[funding], vec![(color, 100), (ColorIdentifier::None, 900)]);
        check_colored_outputs(&issue, &[coin]).expect("issuance");
        verify_balances(&issue, &sums(&[(ColorIdentifier::None, 1_000)]), 10).expect("balanced");

        let token_coin = Coin::new(100, colored_script(&color, &BASE), 2, false);
        let fee_coin = Coin::new(50, vec![0x51], 2, false);
        let spend_points = [OutPoint::new([5u8; 32], 0), OutPoint::new([6u8; 32], 0)];
        let overspend = tx(&spend_points, vec![(color, 101), (ColorIdentifier::None, 40)]);
        check_colored_outputs(&overspend, &[token_coin, fee_coin]).expect("transfer");
        let rejection = verify_balances(
            &overspend,
            &sums(&[(ColorIdentifier::None, 50), (color, 100)]),
            10,
        )
        .expect_err("overspend");
        assert_eq!(rejection.reason, "bad-txns-token-balance");
    }

    #[test]
    fn nft_value_must_be_one() {
        let funding = OutPoint::new([7u8; 32], 0);
        let color = ColorIdentifier::from_outpoint(TokenType::Nft, &funding);
        let coin = Coin::new(500, vec![0x51], 1, false);
        let two = tx(&[funding], vec![(color, 2)]);
        assert_eq!(
            check_colored_outputs(&two, &[coin.clone()]).expect_err("nft").reason,
            "bad-txns-nft-output-value"
        );
        let one = tx(&[funding], vec![(color, 1)]);
        check_colored_outputs(&one, &[coin]).expect("nft issue");
    }

    #[test]
    fn reissuable_color_comes_from_an_uncolored_input_script() {
        let issuer_script = vec![0x76, 0xa9, 0x01];
        let color = ColorIdentifier::reissuable(&issuer_script);
        let coin = Coin::new(10, issuer_script, 1, false);
        let prevout = OutPoint::new([1u8; 32], 0);
        check_colored_outputs(&tx(&[prevout], vec![(color, 5_000)]), &[coin.clone()])
            .expect("reissue");

        let stranger = ColorIdentifier::reissuable(&[0x00]);
        assert_eq!(
            check_colored_outputs(&tx(&[prevout], vec![(stranger, 1)]), &[coin])
                .expect_err("unknown")
                .reason,
            "bad-txns-token-invalid-colorid"
        );
    }

    #[test]
    fn issuance_needs_uncolored_value() {
        let color = ColorIdentifier::reissuable(&[0x51]);
        let issue = tx(&[OutPoint::new([1u8; 32], 0)], vec![(color, 10)]);
        assert_eq!(
            verify_balances(&issue, &ColorAmounts::new(), 0)
                .expect_err("no fee input")
                .reason,
            "bad-txns-token-without-fee"
        );
        let spends_all = tx(
            &[OutPoint::new([1u8; 32], 0)],
            vec![(color, 10), (ColorIdentifier::None, 100)],
        );
        assert!(verify_balances(&spends_all, &sums(&[(ColorIdentifier::None, 100)]), 1).is_err());
        assert!(verify_balances(&spends_all, &sums(&[(ColorIdentifier::None, 101)]), 1).is_ok());
    }

    #[test]
    fn random_transfers_never_create_value() {
        let color = ColorIdentifier::reissuable(&[0x52]);
        let mut state = 0x2545_f491_4f6c_dd1du64;
        let mut next = || {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
            (state >> 33) as Amount % 1_000
        };
        for _ in 0..200 {
            let colored_in = next();
            let colored_out = next();
            let transfer = tx(
                &[OutPoint::new([2u8; 32], 0)],
                vec![(color, colored_out), (ColorIdentifier::None, 1)],
            );
            let input = sums(&[(ColorIdentifier::None, 5), (color, colored_in)]);
            let accepted = verify_balances(&transfer, &input, 1).is_ok();
            assert_eq!(accepted, colored_out <= colored_in);
        }
    }
}
