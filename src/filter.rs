//! Pre-derivation gate: decides whether a record tree is worth deriving.

use rust_decimal::Decimal;
use tracing::debug;

use crate::config::MediationConfig;
use crate::derive::money::decimal_attr;
use crate::tree::{find_all, find_first, GenericNode};

const RECORD_TYPE: &str = "OCSChargingRecord";
const USAGE_BLOCKS: [&str; 5] = [
    "accountInfo",
    "bucketInfo",
    "additionalBalanceInfo",
    "groupInfo",
    "groupState",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject(String),
}

impl Verdict {
    pub fn is_accept(&self) -> bool {
        matches!(self, Verdict::Accept)
    }
}

/// Service family of a raw record, from its own attributes rather than the
/// derived record type. `UNKNOWN` when nothing matches.
pub fn service_type(tree: &GenericNode) -> &'static str {
    let lower = |k: &str| tree.text(k).unwrap_or_default().to_ascii_lowercase();
    let svc = lower("serviceContextId");
    let evt = tree.text("recordEventType").unwrap_or_default().to_ascii_uppercase();
    let sub_evt = tree.text("subRecordEventType").unwrap_or_default().to_ascii_uppercase();
    let rat = tree.text("rATType").unwrap_or_default();
    let charging = find_all(tree, "chargingServiceInfo")
        .into_iter()
        .filter_map(|c| c.text("chargingServiceName"))
        .last()
        .unwrap_or_default()
        .to_ascii_lowercase();

    if evt == "PS"
        || svc.contains("data")
        || tree.text("accessPointName").is_some()
        || matches!(rat.trim(), "6" | "7" | "8")
        || charging.contains("tp_base_data")
    {
        "DATA"
    } else if svc.contains("mms") || evt == "MMS" || charging.contains("mms") {
        "MMS"
    } else if evt == "VOICE" || lower("mediaName") == "speech" {
        "VOICE"
    } else if svc.contains("ussd") || sub_evt == "USSD" || charging.contains("ussd") {
        "USSD"
    } else if svc.contains("sms") || evt == "SMS" || charging.contains("sms") {
        "SMS"
    } else if svc.contains("ecommerce") || charging.contains("payment") || charging.contains("ecom") {
        "ECOMMERCE"
    } else {
        "UNKNOWN"
    }
}

#[derive(Debug, Default)]
struct UsageTotals {
    volume: Decimal,
    units: Decimal,
    time: Decimal,
    bucket_units: Decimal,
    account_committed: Decimal,
}

impl UsageTotals {
    fn collect(msccs: &[&GenericNode]) -> Self {
        let mut totals = Self::default();
        let attr = |n: &GenericNode, k: &str| decimal_attr(n, &[k]).unwrap_or_default();
        for &mscc in msccs {
            totals.volume += attr(mscc, "totalVolumeConsumed");
            totals.units += attr(mscc, "totalUnitsConsumed");
            totals.time += attr(mscc, "totalTimeConsumed");
            for service in find_all(mscc, "chargingServiceInfo") {
                for block in service.blocks() {
                    match block.tag.as_deref() {
                        Some("bucketInfo") => totals.bucket_units += attr(block, "bucketCommitedUnits"),
                        Some("noCharge") => totals.bucket_units += attr(block, "noChargeCommittedUnits"),
                        Some("accountInfo") => {
                            totals.account_committed += attr(block, "accountBalanceCommitted")
                        }
                        _ => {}
                    }
                }
            }
        }
        totals
    }

    fn all_zero(&self, service: &str) -> Option<&'static str> {
        let rest = self.bucket_units.is_zero() && self.account_committed.is_zero();
        match service {
            "DATA" if self.volume.is_zero() && rest => Some("no volume"),
            "VOICE" if self.time.is_zero() && rest => Some("no time"),
            "SMS" | "USSD" | "MMS" if self.units.is_zero() && rest => Some("no units"),
            _ => None,
        }
    }
}

fn reject(reason: impl Into<String>) -> Verdict {
    let reason = reason.into();
    debug!("record rejected: {}", reason);
    Verdict::Reject(reason)
}

/// Structural and usage checks, plus the stricter billing checks when
/// `billing_filter` is set.
pub fn filter(tree: &GenericNode, config: &MediationConfig) -> Verdict {
    if tree.text("recordType").as_deref() != Some(RECORD_TYPE) {
        return reject(format!("recordType != {}", RECORD_TYPE));
    }

    let msccs = find_all(tree, "mscc");
    if msccs.is_empty() {
        return reject("no listOfMscc block");
    }

    let has_usage_block = msccs
        .iter()
        .any(|m| USAGE_BLOCKS.iter().any(|tag| find_first(m, tag).is_some()));
    if !has_usage_block {
        return reject("missing accountInfo/bucketInfo/additionalBalanceInfo/groupInfo/groupState");
    }

    let service = service_type(tree);
    if let Some(what) = UsageTotals::collect(&msccs).all_zero(service) {
        return reject(format!("{}: {}, bucket units or account balance", service, what));
    }

    if config.billing_filter {
        if let Some(verdict) = billing_checks(tree, &msccs, service, config) {
            return verdict;
        }
    }
    Verdict::Accept
}

fn billing_checks(
    tree: &GenericNode,
    msccs: &[&GenericNode],
    service: &str,
    config: &MediationConfig,
) -> Option<Verdict> {
    let filters = &config.rating_group_filters;
    let listed = match service {
        "DATA" => &filters.data,
        "VOICE" => &filters.voice,
        "SMS" | "USSD" | "MMS" => &filters.sms,
        _ => return secondary_balance(msccs),
    };
    let rating_groups: Vec<String> = msccs.iter().filter_map(|m| m.text("ratingGroup")).collect();
    if let Some(rg) = rating_groups.iter().find(|rg| listed.contains(rg)) {
        return Some(reject(format!("{} ratingGroup {} is filtered", service, rg)));
    }

    let success = tree.first_text(&["EL_SUCCESS", "elSuccess", "resultCode"]);
    let pre_post = tree.first_text(&["EL_PRE_POST", "el_pre_post", "prePost"]);
    let passes = |s: &str, p: &str| s.trim() == "1" && p.trim().eq_ignore_ascii_case("POSTPAID");
    match (success.as_deref(), pre_post.as_deref()) {
        (Some(s), Some(p)) if !passes(s, p) => {
            return Some(reject("EL_SUCCESS/EL_PRE_POST check failed"));
        }
        (None, _) | (_, None) if config.strict_el => {
            return Some(reject("EL_SUCCESS/EL_PRE_POST check failed (strict)"));
        }
        _ => {}
    }

    secondary_balance(msccs)
}

fn secondary_balance(msccs: &[&GenericNode]) -> Option<Verdict> {
    let marked = msccs
        .iter()
        .flat_map(|m| find_all(m, "additionalBalanceInfo"))
        .any(|abi| {
            abi.text("usageType")
                .is_some_and(|u| u.eq_ignore_ascii_case("SECONDARY_BALANCE"))
        });
    marked.then(|| reject("additionalBalanceInfo.usageType == SECONDARY_BALANCE"))
}
