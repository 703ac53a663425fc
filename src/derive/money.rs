//! Exact decimal arithmetic for balances and charges.

use std::str::FromStr;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::tree::GenericNode;

const SCALE: u32 = 5;

pub fn to_decimal(raw: &str) -> Option<Decimal> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    Decimal::from_str(raw)
        .or_else(|_| Decimal::from_scientific(raw))
        .ok()
}

/// Decimal attribute; `None` when absent, empty, or not a number.
pub fn decimal_attr(node: &GenericNode, keys: &[&str]) -> Option<Decimal> {
    node.first_text(keys).as_deref().and_then(to_decimal)
}

/// Fixed five-place rendering, e.g. `60.12345` or `30.00000`.
pub fn format_amount(value: Decimal) -> String {
    let mut v = value.round_dp(SCALE);
    v.rescale(SCALE);
    v.to_string()
}

/// Shortest plain rendering, used inside comma-joined lists.
pub fn format_plain(value: Decimal) -> String {
    value.normalize().to_string()
}

pub fn to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

pub fn balance_change(before: &str, after: &str) -> Option<Decimal> {
    Some(to_decimal(before)? - to_decimal(after)?)
}

fn difference(node: &GenericNode, before: &[&str], after: &[&str]) -> Option<Decimal> {
    Some(decimal_attr(node, before)? - decimal_attr(node, after)?)
}

const COMMITTED: [&str; 2] = ["accountBalanceCommittedBR", "accountBalanceCommitted"];
const BEFORE: [&str; 1] = ["accountBalanceBefore"];
const AFTER: [&str; 1] = ["accountBalanceAfter"];

pub fn account_committed(account: &GenericNode) -> Option<Decimal> {
    decimal_attr(account, &COMMITTED)
}

/// Amount debited by one account: committed value when present, otherwise
/// before minus after.
pub fn debit(account: &GenericNode) -> Option<Decimal> {
    account_committed(account).or_else(|| difference(account, &BEFORE, &AFTER))
}

/// Per-slot charged balance. A negative before/after difference means the
/// balances were refreshed mid-session; committed plus secondary cost is
/// reported instead.
pub fn account_charge(account: &GenericNode) -> Option<Decimal> {
    let diff = difference(account, &BEFORE, &AFTER)?;
    if diff < Decimal::ZERO {
        let committed = account_committed(account).unwrap_or_default();
        let secondary = decimal_attr(account, &["secondaryCostCommitted"]).unwrap_or_default();
        return Some(committed + secondary);
    }
    Some(diff)
}

/// Per-bucket charged units: the balance drop, or the committed units when
/// the drop is negative. Missing balances also fall back to committed units
/// (zero when absent), so a bucket never leaves an empty charged entry.
pub fn bucket_charge(bucket: &GenericNode) -> Decimal {
    let committed = || {
        decimal_attr(bucket, &["bucketCommitedUnits", "bucketCommittedUnits"]).unwrap_or_default()
    };
    match difference(bucket, &["bucketBalanceBefore"], &["bucketBalanceAfter"]) {
        Some(diff) if diff < Decimal::ZERO => committed(),
        Some(diff) => diff,
        None => committed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::normalize;
    use serde_json::json;

    fn account(elements: serde_json::Value) -> GenericNode {
        normalize(&json!({"recordProperty": "accountInfo", "recordElements": elements}))
    }

    #[test]
    fn exact_decimal_difference() {
        let change = balance_change("100.12345", "40.00000").unwrap();
        assert_eq!(format_amount(change), "60.12345");
        assert_eq!(format_amount(balance_change("0.3", "0.1").unwrap()), "0.20000");
        assert!(balance_change("", "1").is_none());
        assert!(balance_change("abc", "1").is_none());
    }

    #[test]
    fn debit_prefers_committed() {
        let acc = account(json!({
            "accountBalanceBefore": "100",
            "accountBalanceAfter": "70",
            "accountBalanceCommitted": "12.5"
        }));
        assert_eq!(debit(&acc), Some(Decimal::new(125, 1)));

        let acc = account(json!({"accountBalanceBefore": "100", "accountBalanceAfter": "70"}));
        assert_eq!(to_f64(debit(&acc).unwrap()), 30.0);

        let acc = account(json!({"accountBalanceCommitted": ""}));
        assert_eq!(debit(&acc), None);
    }

    #[test]
    fn negative_difference_substitutes_committed() {
        let acc = account(json!({
            "accountBalanceBefore": "10",
            "accountBalanceAfter": "50",
            "accountBalanceCommitted": "3",
            "secondaryCostCommitted": "0.25"
        }));
        assert_eq!(format_amount(account_charge(&acc).unwrap()), "3.25000");

        let acc = account(json!({"accountBalanceBefore": "50", "accountBalanceAfter": "10"}));
        assert_eq!(format_amount(account_charge(&acc).unwrap()), "40.00000");
    }

    #[test]
    fn bucket_charge_rules() {
        let bucket = |e: serde_json::Value| normalize(&json!({"recordProperty": "bucketInfo", "recordElements": e}));
        assert_eq!(
            format_plain(bucket_charge(&bucket(json!({"bucketBalanceBefore": "500", "bucketBalanceAfter": "200"})))),
            "300"
        );
        assert_eq!(
            format_plain(bucket_charge(&bucket(json!({
                "bucketBalanceBefore": "0",
                "bucketBalanceAfter": "1000",
                "bucketCommitedUnits": "64"
            })))),
            "64"
        );
        assert_eq!(format_plain(bucket_charge(&bucket(json!({})))), "0");
        assert_eq!(
            format_plain(bucket_charge(&bucket(json!({"bucketBalanceBefore": "9", "bucketCommitedUnits": "4"})))),
            "4"
        );
    }

    #[test]
    fn scientific_and_numbers() {
        assert_eq!(to_decimal("1e3"), Some(Decimal::new(1000, 0)));
        let acc = normalize(&json!({"recordProperty": "accountInfo",
            "recordElements": {"accountBalanceBefore": 100, "accountBalanceAfter": 70}}));
        assert_eq!(format_amount(debit(&acc).unwrap()), "30.00000");
    }
}
