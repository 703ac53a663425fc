//! Extraction rules. Each rule reads a [`RecordView`] and yields the raw text
//! of one output field, or `None` when the source is absent. Defaults are
//! applied later, at shaping.

use std::sync::OnceLock;

use regex::Regex;
use rust_decimal::Decimal;

use super::decode;
use super::money;
use super::view::RecordView;
use crate::tree::{find_all, GenericNode};

pub type Keys = &'static [&'static str];

/// Where an attribute rule looks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Root,
    /// First `mscc` block.
    Mscc,
    /// First `chargingServiceInfo` carrying the attribute.
    Service,
    FirstAccount,
    /// First bucket, across bucket-holding subscriptions, carrying the attribute.
    FirstBucket,
    /// First block with this tag anywhere in the tree carrying the attribute.
    Block(&'static str),
    /// First subscription carrying the attribute.
    Subscription,
    /// The main offering's subscription.
    MainSubscription,
    /// First account of the main offering.
    MainAccount,
    /// First `bucketInfo` under an `additionalBalanceInfo` carrying the attribute.
    BalanceBucket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountCol {
    Id,
    Type,
    Current,
    Charged,
    Rate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketCol {
    Name,
    UnitType,
    Current,
    Charged,
    Rate,
}

/// Usage dimension of a service family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Usage {
    Volume,
    Time,
    Units,
}

impl Usage {
    pub fn label(self) -> &'static str {
        match self {
            Usage::Volume => "VOLUME",
            Usage::Time => "TIME",
            Usage::Units => "UNITS",
        }
    }

    pub fn consumed_keys(self) -> Keys {
        match self {
            Usage::Volume => &["totalVolumeConsumed"],
            Usage::Time => &["totalTimeConsumed"],
            Usage::Units => &["totalUnitsConsumed"],
        }
    }

    fn charged_keys(self) -> Keys {
        match self {
            Usage::Volume => &["totalVolumeCharged"],
            Usage::Time => &["totalTimeCharged", "roundedTimeCharged"],
            Usage::Units => &["totalUnitsCharged", "roundedUnitsCharged"],
        }
    }

    fn rounded_keys(self) -> Keys {
        match self {
            Usage::Volume => &["roundedVolumeCharged"],
            Usage::Time => &["roundedTimeCharged"],
            Usage::Units => &["roundedUnitsCharged"],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlimitedCol {
    Bundle,
    Charged,
    Rounded,
    UnitType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Party {
    Calling,
    Called,
}

#[derive(Debug, Clone)]
pub enum Rule {
    Blank,
    Const(&'static str),
    Attr(Scope, Keys),
    /// First rule that yields a value.
    FirstOf(Vec<Rule>),
    /// Subscription attribute over every `subscriptionInfo`, joined.
    Joined(Keys, &'static str),
    PayType,
    Success,
    BillingFlag,
    RecordType,
    EventLabel,
    DateDay,
    MonthCircle,
    GroupUsage,
    Debit,
    /// Debit less the first account's committed tax.
    CallCost,
    Account(usize, AccountCol),
    Bucket(usize, BucketCol),
    /// Per-attribute join over every `additionalBalanceInfo`.
    BalanceInfo(Keys),
    SubscriptionId(&'static str),
    Number(Party),
    /// IMSI, optionally only when the event direction matches.
    Imsi(Option<Party>),
    Imei,
    Location(Keys),
    Timestamp(Keys),
    FreeUnits,
    MainOffering,
    Unlimited(Usage, UnlimitedCol),
    OnNet,
    RoamingFlag,
    EventResult,
    AppliedDiscounts,
    BucketUsages,
    SourceFile,
    /// First rule, in international form, when the call was forwarded or
    /// terminated while roaming; the second rule otherwise.
    Redirect(Box<Rule>, Box<Rule>),
    /// `1` when the roaming indicator starts with `ROAM`.
    Roaming,
    /// Main account debit.
    MainDebit,
    /// Committed units of the first additional-balance bucket, else the main
    /// account debit, else the first account that debited anything.
    UsageCost,
    /// Committed units of the first additional-balance bucket.
    BalanceCommitted,
    /// Last additional-balance bucket value, in hundredths.
    BalanceCents(Keys),
    /// Attribute of the n-th bucket across every bucket group.
    BucketAt(usize, Keys),
    /// Sum of committed units over all buckets.
    BucketCommitted,
    /// The inner value unless it is numerically zero.
    NonZero(Box<Rule>),
    /// `bundle-bucket` for every named bucket, pipe-joined.
    DiscountIds,
    /// Main offering and rating group as `bundle-ratingGroup`.
    TariffPlan,
    /// Last 13 characters split 5-4-4.
    ShortLocation(Keys),
    /// Last two digits of the (redirect-adjusted) account number.
    MdnSeries,
}

impl Rule {
    pub fn eval(&self, view: &RecordView) -> Option<String> {
        match self {
            Rule::Blank => None,
            Rule::Const(v) => Some(v.to_string()),
            Rule::Attr(scope, keys) => scoped_text(view, *scope, keys),
            Rule::FirstOf(rules) => rules.iter().find_map(|r| r.eval(view)),
            Rule::Joined(keys, sep) => join(
                view.subscriptions.iter().filter_map(|s| s.node.first_text(keys)),
                sep,
            ),
            Rule::PayType => Some(pay_type(view).to_string()),
            Rule::Success => Some(flag(is_success(view))),
            Rule::BillingFlag => Some(flag(pay_type(view) == "POSTPAID" && is_success(view))),
            Rule::RecordType => Some(record_type(view).to_string()),
            Rule::EventLabel => Some(event_label(view).to_string()),
            Rule::DateDay => Some(decode::date_key(&generation_timestamp(view))),
            Rule::MonthCircle => {
                let month = decode::month_key(&generation_timestamp(view));
                let circle = view
                    .config
                    .circle_for(&msisdn_for_circle(view).unwrap_or_default());
                Some(format!("{}_{}", month, circle))
            }
            Rule::GroupUsage => Some(flag(group_usage(view.root))),
            Rule::Debit => debit(view).map(money::format_amount),
            Rule::CallCost => {
                let tax = view
                    .accounts
                    .first()
                    .and_then(|a| money::decimal_attr(a, &["committedTaxAmount"]))
                    .unwrap_or_default();
                debit(view).map(|d| money::format_amount(d - tax))
            }
            Rule::Account(slot, col) => account_slot(view.accounts.get(*slot)?, *col),
            Rule::Bucket(slot, col) => {
                let group = view.bucket_groups().nth(*slot)?;
                bucket_slot(group.bundle_name(), &group.buckets, *col)
            }
            Rule::BalanceInfo(keys) => join(view.balance_infos.iter().filter_map(|b| b.text(keys)), ","),
            Rule::SubscriptionId(id_type) => view.subscription_id(id_type),
            Rule::Number(party) => party_number(view, *party),
            Rule::Imsi(side) => imsi(view, *side),
            Rule::Imei => view
                .root_text(&["userEquipmentValue"])
                .map(|v| decode::decode_device_id(&v)),
            Rule::Location(keys) => {
                let raw = view.root_text(keys)?;
                let rat = view.root_text(&["rATType", "ratType"]);
                Some(decode::location_for_rat(&raw, rat.as_deref())).filter(|s| !s.is_empty())
            }
            Rule::Timestamp(keys) => view
                .root_text(keys)
                .and_then(|ts| decode::format_generation_time(&ts)),
            Rule::FreeUnits => join(
                find_all(view.root, "noCharge")
                    .into_iter()
                    .filter_map(|n| n.text("noChargeCommittedUnits")),
                ",",
            ),
            Rule::MainOffering => view
                .subscriptions
                .iter()
                .filter(|s| !s.has_bucket())
                .find_map(|s| s.bundle_name()),
            Rule::Unlimited(usage, col) => unlimited(view, *usage, *col),
            Rule::OnNet => Some(flag(
                view.root_text(&["isOnNet"])
                    .is_some_and(|v| v.trim().eq_ignore_ascii_case("true")),
            )),
            Rule::RoamingFlag => view
                .root_text(&["roamingIndicator", "RoamingStatus"])
                .map(|v| flag(!v.trim().eq_ignore_ascii_case("HOME"))),
            Rule::EventResult => {
                let code = view.root_text(&["resultCode", "resultcode"])?;
                Some(if view.config.is_success_code(code.trim()) {
                    "1".to_string()
                } else {
                    code
                })
            }
            Rule::AppliedDiscounts => join(
                view.buckets().filter_map(|b| b.text("bucketName")).take(5),
                "|",
            ),
            Rule::BucketUsages => join(
                view.buckets().filter_map(|b| {
                    let before = b.text("bucketBalanceBefore")?;
                    let after = b.text("bucketBalanceAfter")?;
                    money::balance_change(&before, &after).map(money::format_plain)
                }),
                ",",
            ),
            Rule::SourceFile => Some(view.source.to_string()).filter(|s| !s.is_empty()),
            Rule::Redirect(redirected, normal) => {
                if is_redirected(view) {
                    let number = redirected.eval(view)?;
                    Some(decode::normalize_msisdn(number.trim(), &view.config.country_code))
                } else {
                    normal.eval(view)
                }
            }
            Rule::Roaming => Some(flag(is_roaming(view))),
            Rule::MainDebit => view.main_account().and_then(money::debit).map(money::format_amount),
            Rule::UsageCost => balance_committed(view)
                .or_else(|| view.main_account().and_then(money::debit))
                .or_else(|| view.accounts.iter().find_map(|a| money::debit(a)))
                .map(money::format_amount),
            Rule::BalanceCommitted => balance_committed(view).map(money::format_amount),
            Rule::BalanceCents(keys) => view
                .balance_infos
                .iter()
                .rev()
                .filter_map(|b| b.bucket)
                .find_map(|n| money::decimal_attr(n, keys))
                .map(|v| money::format_plain((v / Decimal::ONE_HUNDRED).round_dp(2))),
            Rule::BucketAt(n, keys) => view.buckets().nth(*n)?.first_text(keys),
            Rule::BucketCommitted => view
                .buckets()
                .filter_map(|b| money::decimal_attr(b, &COMMITTED_UNITS))
                .reduce(|a, b| a + b)
                .map(money::format_plain),
            Rule::NonZero(inner) => inner
                .eval(view)
                .filter(|v| money::to_decimal(v).is_some_and(|d| !d.is_zero())),
            Rule::DiscountIds => join(
                view.bucket_groups().flat_map(|group| {
                    let bundle = group.bundle_name();
                    group.buckets.iter().filter_map(move |b| {
                        let name = b.text("bucketName")?;
                        Some(match &bundle {
                            Some(bundle) => format!("{}-{}", bundle, name),
                            None => name,
                        })
                    })
                }),
                "|",
            ),
            Rule::TariffPlan => {
                let bundle = view.main_subscription().and_then(|s| s.bundle_name());
                let rating_group = view.mscc_text(&["ratingGroup"]);
                match (bundle, rating_group) {
                    (Some(b), Some(rg)) => Some(format!("{}-{}", b, rg)),
                    (b, rg) => b.or(rg),
                }
            }
            Rule::ShortLocation(keys) => view
                .root_text(keys)
                .map(|raw| decode::split_short_location(&raw)),
            Rule::MdnSeries => {
                let account = Rule::Redirect(
                    Box::new(Rule::SubscriptionId("0")),
                    Box::new(Rule::SubscriptionId("0")),
                )
                .eval(view)?;
                let chars: Vec<char> = account.chars().collect();
                Some(chars[chars.len().saturating_sub(2)..].iter().collect())
            }
        }
    }
}

const COMMITTED_UNITS: [&str; 2] = ["bucketCommitedUnits", "bucketCommittedUnits"];

fn balance_committed(view: &RecordView) -> Option<Decimal> {
    view.balance_infos
        .iter()
        .filter_map(|b| b.bucket)
        .find_map(|n| money::decimal_attr(n, &COMMITTED_UNITS))
}

fn is_roaming(view: &RecordView) -> bool {
    view.root_text(&["roamingIndicator", "RoamingStatus"])
        .is_some_and(|v| v.trim().to_ascii_uppercase().starts_with("ROAM"))
}

/// Call direction: `subRecordEventType`, else the mscc event type.
fn direction(view: &RecordView) -> String {
    view.root_text(&["subRecordEventType"])
        .or_else(|| view.mscc_text(&["subRecordEventType"]))
        .unwrap_or_else(|| record_event_type(view))
        .trim()
        .to_ascii_uppercase()
}

/// Forwarded calls, and calls terminated while roaming, report the other
/// party's number.
fn is_redirected(view: &RecordView) -> bool {
    match direction(view).as_str() {
        "FWD" => true,
        "MTC" => is_roaming(view),
        _ => false,
    }
}

fn flag(on: bool) -> String {
    (if on { "1" } else { "0" }).to_string()
}

fn join(values: impl Iterator<Item = String>, sep: &str) -> Option<String> {
    let joined = values.collect::<Vec<_>>().join(sep);
    (!joined.is_empty()).then_some(joined)
}

fn scoped_text(view: &RecordView, scope: Scope, keys: &[&str]) -> Option<String> {
    match scope {
        Scope::Root => view.root_text(keys),
        Scope::Mscc => view.mscc_text(keys),
        Scope::Service => view
            .subscriptions
            .iter()
            .flat_map(|s| s.services.iter())
            .find_map(|svc| svc.first_text(keys)),
        Scope::FirstAccount => view.accounts.first()?.first_text(keys),
        Scope::FirstBucket => view.buckets().find_map(|b| b.first_text(keys)),
        Scope::Block(tag) => find_all(view.root, tag)
            .into_iter()
            .find_map(|n| n.first_text(keys)),
        Scope::Subscription => view.subscriptions.iter().find_map(|s| s.node.first_text(keys)),
        Scope::MainSubscription => view.main_subscription()?.node.first_text(keys),
        Scope::MainAccount => view.main_account()?.first_text(keys),
        Scope::BalanceBucket => view
            .balance_infos
            .iter()
            .filter_map(|b| b.bucket)
            .find_map(|n| n.first_text(keys)),
    }
}

fn generation_timestamp(view: &RecordView) -> String {
    view.root_text(&["generationTimestamp"]).unwrap_or_default()
}

/// Payment type from the first account outside any bucket bundle, falling
/// back to the record's own account type.
pub fn pay_type(view: &RecordView) -> &'static str {
    let from_account = view
        .main_account()
        .and_then(|a| a.first_text(&["accountType", "accounttype", "AccountType"]));
    let raw = from_account.or_else(|| view.root_text(&["AccountType", "accountType"]));
    classify_pay_type(raw.as_deref())
}

pub fn classify_pay_type(raw: Option<&str>) -> &'static str {
    let Some(v) = raw.map(|s| s.trim().to_ascii_uppercase()) else {
        return "UNKNOWN";
    };
    match v.as_str() {
        "PRE_PAID" | "PREPAID" | "PRE-PAID" => "PREPAID",
        _ if v.contains("POST") => "POSTPAID",
        _ => "UNKNOWN",
    }
}

pub fn is_success(view: &RecordView) -> bool {
    view.root_text(&["resultCode", "resultcode"])
        .is_some_and(|c| view.config.is_success_code(c.trim()))
}

fn record_event_type(view: &RecordView) -> String {
    view.mscc_text(&["recordEventType", "recordeventtype"])
        .or_else(|| view.root_text(&["recordEventType"]))
        .unwrap_or_default()
}

pub fn record_type(view: &RecordView) -> &'static str {
    let event = record_event_type(view);
    let raw = if event.is_empty() {
        view.root_text(&["subRecordEventType"]).unwrap_or_default()
    } else {
        event
    };
    match raw.trim().to_ascii_uppercase().as_str() {
        "PS" => "DATA",
        "IMS" => "VOICE",
        "SMS" => "SMS",
        "MMS" => "MMS",
        "USSD" => "USSD",
        "ECOMMERCE" => "ECOMMERCE",
        _ => "UNKNOWN",
    }
}

pub fn event_label(view: &RecordView) -> i64 {
    if record_event_type(view).trim().eq_ignore_ascii_case("ECOMMERCE") {
        let service = view.root_text(&["ServiceType"]).unwrap_or_default();
        return match service.trim().to_ascii_uppercase().as_str() {
            "ACTIVATION" => 824,
            "RECURRING_CHARGING" => 825,
            "PAYMENT" => 826,
            "SENDSMS" => 827,
            "REQUESTSENDSMS" => 828,
            "INTERACTIVESMS" => 829,
            _ => 0,
        };
    }
    let sub = view.root_text(&["subRecordEventType"]).unwrap_or_default();
    match sub.trim().to_ascii_uppercase().as_str() {
        "PS" => 46,
        "MOC" | "FWD" => 1,
        "MTC" => 2,
        "SMS_MO" => 25,
        "SMS_MT" => 26,
        "USSD" => 823,
        "MMS_MO" => 143,
        _ => 0,
    }
}

pub fn group_usage(root: &GenericNode) -> bool {
    find_all(root, "groupInfo").into_iter().any(|g| {
        g.text("groupState")
            .is_some_and(|s| s.trim().eq_ignore_ascii_case("ACTIVE"))
    })
}

fn digit_run() -> Option<&'static Regex> {
    static DIGITS: OnceLock<Option<Regex>> = OnceLock::new();
    DIGITS.get_or_init(|| Regex::new(r"\d{6,}").ok()).as_ref()
}

/// Subscriber number used for the circle lookup: a subscription id of type
/// 1, 103 or 0 ending in six or more digits, else digits in `userName`.
fn msisdn_for_circle(view: &RecordView) -> Option<String> {
    let re = digit_run()?;
    let from_ids = view.subscription_ids.iter().find_map(|sid| {
        let id_type = sid.first_text(&super::view::SUBSCRIPTION_ID_TYPE)?;
        if !matches!(id_type.trim(), "1" | "103" | "0") {
            return None;
        }
        let data = sid.first_text(&super::view::SUBSCRIPTION_ID_DATA)?;
        let candidate = data.split_once('-').map_or(data.as_str(), |(_, rest)| rest);
        re.find_iter(candidate)
            .any(|m| m.end() == candidate.len())
            .then(|| candidate.to_string())
    });
    from_ids.or_else(|| {
        let user = view.root_text(&["userName"])?;
        re.find(&user).map(|m| m.as_str().to_string())
    })
}

fn debit(view: &RecordView) -> Option<Decimal> {
    money::debit(view.accounts.first()?)
}

fn account_slot(account: &GenericNode, col: AccountCol) -> Option<String> {
    match col {
        AccountCol::Id => account.text("accountID"),
        AccountCol::Type => account.text("accountType"),
        AccountCol::Current => money::decimal_attr(account, &["accountBalanceAfter"]).map(money::format_amount),
        AccountCol::Charged => money::account_charge(account).map(money::format_amount),
        AccountCol::Rate => account.text("rateId"),
    }
}

/// One entry per bucket in every column, so the n-th name, unit type, balance
/// and rate all describe the same bucket.
fn bucket_slot(bundle: Option<String>, buckets: &[&GenericNode], col: BucketCol) -> Option<String> {
    let text = |b: &GenericNode, key: &str| b.text(key).unwrap_or_default();
    let column: Vec<String> = match col {
        BucketCol::Name => buckets
            .iter()
            .map(|&b| match &bundle {
                Some(bundle) => format!("{}-{}", bundle, text(b, "bucketName")),
                None => text(b, "bucketName"),
            })
            .collect(),
        BucketCol::UnitType => buckets.iter().map(|&b| text(b, "bucketUnitType")).collect(),
        BucketCol::Current => buckets
            .iter()
            .map(|b| {
                money::decimal_attr(b, &["bucketBalanceAfter"])
                    .map(money::format_plain)
                    .unwrap_or_else(|| "0".to_string())
            })
            .collect(),
        BucketCol::Charged => buckets
            .iter()
            .map(|b| money::format_plain(money::bucket_charge(b)))
            .collect(),
        BucketCol::Rate => buckets.iter().map(|&b| text(b, "rateId")).collect(),
    };
    column
        .iter()
        .any(|v| !v.is_empty())
        .then(|| column.join(","))
}

fn party_number(view: &RecordView, party: Party) -> Option<String> {
    let raw = match party {
        Party::Calling => view
            .subscription_id("0")
            .or_else(|| view.any_subscription_id())
            .or_else(|| view.root_text(&["callingPartyAddress", "originatorAddress", "callingParty"])),
        Party::Called => view.root_text(&["calledPartyAddress", "recipientAddress", "calledParty"]),
    }?;
    Some(decode::normalize_msisdn(raw.trim(), &view.config.country_code))
}

fn imsi(view: &RecordView, side: Option<Party>) -> Option<String> {
    let raw = view.subscription_id("1")?;
    let terminating = event_label(view) == 2;
    let wanted = match side {
        None => true,
        Some(Party::Calling) => !terminating,
        Some(Party::Called) => terminating,
    };
    if !wanted {
        return None;
    }
    let raw = raw.trim();
    Some(raw.strip_prefix("imsi-").unwrap_or(raw).to_string())
}

/// Unlimited bundle: the first subscription without buckets whose account
/// committed nothing yet was charged usage.
fn unlimited(view: &RecordView, usage: Usage, col: UnlimitedCol) -> Option<String> {
    let (sub, account, charged) = view.subscriptions.iter().find_map(|s| {
        if s.has_bucket() {
            return None;
        }
        let account = *s.accounts.first()?;
        if money::account_committed(account)? != Decimal::ZERO {
            return None;
        }
        let charged = account.first_text(usage.charged_keys())?;
        (money::to_decimal(&charged)? > Decimal::ZERO).then_some((s, account, charged))
    })?;
    match col {
        UnlimitedCol::Bundle => sub.bundle_name(),
        UnlimitedCol::Charged => Some(charged),
        UnlimitedCol::Rounded => account.first_text(usage.rounded_keys()),
        UnlimitedCol::UnitType => Some(usage.label().to_string()),
    }
}
