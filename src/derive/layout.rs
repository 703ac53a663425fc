//! Declarative field tables, one per (category, projection).

use std::sync::OnceLock;

use super::record::FieldKind;
use super::rules::{AccountCol, BucketCol, Keys, Party, Rule, Scope, UnlimitedCol, Usage};
use super::{Category, Projection};

pub const SLOTS: usize = 5;

#[derive(Debug, Clone)]
pub struct FieldDef {
    pub name: String,
    pub kind: FieldKind,
    pub rule: Rule,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, kind: FieldKind, rule: Rule) -> Self {
        Self {
            name: name.into(),
            kind,
            rule,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Layout {
    pub name: String,
    pub fields: Vec<FieldDef>,
}

impl Layout {
    pub fn new(name: impl Into<String>, fields: Vec<FieldDef>) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }
}

/// Accumulates field definitions in output order.
#[derive(Default)]
struct Fields(Vec<FieldDef>);

impl Fields {
    fn text(&mut self, name: impl Into<String>, rule: Rule) -> &mut Self {
        self.0.push(FieldDef::new(name, FieldKind::Text, rule));
        self
    }

    fn numeric(&mut self, name: impl Into<String>, rule: Rule) -> &mut Self {
        self.0.push(FieldDef::new(name, FieldKind::Numeric, rule));
        self
    }

    fn integer(&mut self, name: impl Into<String>, rule: Rule) -> &mut Self {
        self.0.push(FieldDef::new(name, FieldKind::Integer, rule));
        self
    }

    fn blank(&mut self, names: &[&str]) -> &mut Self {
        for name in names {
            self.text(*name, Rule::Blank);
        }
        self
    }

    fn account_slots(&mut self) -> &mut Self {
        for i in 0..SLOTS {
            let n = i + 1;
            self.text(format!("EL_ACCT_BALANCE_ID{}", n), Rule::Account(i, AccountCol::Id))
                .text(format!("EL_BALANCE_TYPE{}", n), Rule::Account(i, AccountCol::Type))
                .numeric(format!("EL_CUR_BALANCE{}", n), Rule::Account(i, AccountCol::Current))
                .numeric(format!("EL_CHG_BALANCE{}", n), Rule::Account(i, AccountCol::Charged))
                .text(format!("EL_RATE_ID{}", n), Rule::Account(i, AccountCol::Rate));
        }
        self
    }

    fn bucket_slots(&mut self) -> &mut Self {
        for i in 0..SLOTS {
            let n = i + 1;
            self.text(format!("EL_BUCKET_BALANCE_ID{}", n), Rule::Bucket(i, BucketCol::Name))
                .text(format!("EL_BUCKET_BALANCE_TYPE{}", n), Rule::Bucket(i, BucketCol::UnitType))
                .numeric(format!("EL_BUCKET_CUR_BALANCE{}", n), Rule::Bucket(i, BucketCol::Current))
                .numeric(format!("EL_BUCKET_CHG_BALANCE{}", n), Rule::Bucket(i, BucketCol::Charged))
                .text(format!("EL_BUCKET_RATE_ID{}", n), Rule::Bucket(i, BucketCol::Rate));
        }
        self
    }

    fn balance_info(&mut self, columns: &[(&str, Keys)]) -> &mut Self {
        for (suffix, keys) in columns {
            self.text(
                format!("EL_ADDITIONALBALANCEINFO_{}", suffix),
                Rule::BalanceInfo(*keys),
            );
        }
        self
    }

    fn build(&mut self, name: impl Into<String>) -> Layout {
        Layout::new(name, std::mem::take(&mut self.0))
    }
}

const BALANCE_INFO: [(&str, Keys); 19] = [
    ("CHARGINGSERVICENAME", &["chargingServiceName", "chargingservicename"]),
    ("USAGETYPE", &["usageType"]),
    ("USEDAS", &["usedAs"]),
    ("BUCKETINFO_BUCKETNAME", &["bucketName"]),
    ("BUCKETINFO_BUCKETUNITTYPE", &["bucketUnitType"]),
    ("BUCKETINFO_BUCKETKINDOFUNIT", &["bucketKindOfUnit"]),
    ("BUCKETINFO_BUCKETBALANCEBEFORE", &["bucketBalanceBefore"]),
    ("BUCKETINFO_BUCKETBALANCEAFTER", &["bucketBalanceAfter"]),
    ("BUCKETINFO_CARRYOVERBUCKET", &["carryOverBucket"]),
    ("BUCKETINFO_BUCKETCOMMITEDUNITS", &["bucketCommitedUnits", "bucketCommittedUnits"]),
    ("BUCKETINFO_BUCKETRESERVEDUNITS", &["bucketReservedUnits"]),
    ("BUCKETINFO_RATEID", &["rateId"]),
    ("BUCKETINFO_PRIMARYCOSTCOMMITTED", &["primaryCostCommitted"]),
    ("BUCKETINFO_SECONDARYCOSTCOMMITTED", &["secondaryCostCommitted"]),
    ("BUCKETINFO_TAXATIONID", &["taxationID", "taxationId"]),
    ("BUCKETINFO_TAXRATEAPPLIED", &["taxRateApplied"]),
    ("BUCKETINFO_COMMITTEDTAXAMOUNT", &["committedTaxAmount"]),
    ("BUCKETINFO_TOTALTAXAMOUNT", &["totalTaxAmount"]),
    ("BUCKETINFO_TARIFFID", &["tariffID", "tariffId"]),
];

const BALANCE_INFO_VOLUME: [(&str, Keys); 3] = [
    ("BUCKETINFO_TOTALVOLUMECHARGED", &["totalVolumeCharged"]),
    ("BUCKETINFO_ROUNDEDVOLUMECHARGED", &["roundedVolumeCharged"]),
    ("BUCKETINFO_DELTAVOLUME", &["deltaVolume"]),
];

const BALANCE_INFO_TIME: [(&str, Keys); 4] = [
    ("BUCKETINFO_TOTALUNITSCHARGED", &["totalUnitsCharged"]),
    ("BUCKETINFO_TOTALTIMECHARGED", &["totalTimeCharged"]),
    ("BUCKETINFO_ROUNDEDTIMECHARGED", &["roundedTimeCharged"]),
    ("BUCKETINFO_DELTATIME", &["deltaTime"]),
];

const BALANCE_INFO_UNITS: [(&str, Keys); 1] = [("BUCKETINFO_TOTALUNITSCHARGED", &["totalUnitsCharged"])];

fn root(keys: Keys) -> Rule {
    Rule::Attr(Scope::Root, keys)
}

fn mscc(keys: Keys) -> Rule {
    Rule::Attr(Scope::Mscc, keys)
}

fn tax(scope: Scope) -> Rule {
    Rule::Attr(scope, &["committedTaxAmount"])
}

fn group_id() -> Rule {
    Rule::FirstOf(vec![
        Rule::Attr(Scope::Block("groupInfo"), &["groupID", "groupId"]),
        root(&["groupID", "groupId"]),
    ])
}

/// Routing enrichment, identical for every category.
fn tag() -> Layout {
    Fields::default()
        .text("EL_PRE_POST", Rule::PayType)
        .integer("EL_SUCCESS", Rule::Success)
        .integer("EL_CUST_CARE", Rule::Const("1"))
        .integer("EL_BILLING", Rule::BillingFlag)
        .text("EL_REC_TYPE", Rule::RecordType)
        .integer("EL_EVENT_LABEL_VAL", Rule::EventLabel)
        .text("EL_DATE_DAY", Rule::DateDay)
        .text("EL_MONTH_VAL_CIRCLE_ID", Rule::MonthCircle)
        .numeric("EL_DEBIT_AMOUNT", Rule::Debit)
        .integer("EL_GROUP_USAGE", Rule::GroupUsage)
        .build("TAG")
}

fn billing(category: Category) -> Layout {
    let (dialled, duration, volume, rounded_duration, rounded_volume) = match category {
        Category::Data | Category::Group => (
            Rule::Blank,
            root(&["duration"]),
            mscc(&["totalVolumeConsumed", "timeUsage"]),
            Rule::Blank,
            Rule::FirstOf(vec![
                Rule::Attr(Scope::FirstBucket, &["roundedVolumeCharged"]),
                Rule::Attr(Scope::FirstAccount, &["roundedVolumeCharged"]),
            ]),
        ),
        Category::Voice => (
            Rule::Number(Party::Called),
            mscc(&["totalTimeConsumed"]),
            Rule::Blank,
            Rule::FirstOf(vec![
                Rule::Attr(Scope::FirstBucket, &["roundedTimeCharged"]),
                Rule::Attr(Scope::FirstAccount, &["roundedTimeCharged"]),
            ]),
            Rule::Blank,
        ),
        Category::Sms | Category::Mms | Category::Ussd | Category::Ecommerce => (
            root(&["recipientAddress", "calledPartyAddress"]),
            root(&["duration"]),
            Rule::Blank,
            Rule::Blank,
            Rule::Blank,
        ),
    };

    Fields::default()
        .text("EL_ACCOUNT_ID", Rule::SubscriptionId("0"))
        .text("EL_DIALLED_DIGITS", dialled)
        .integer("EL_EVENT_LABEL", Rule::EventLabel)
        .text("EL_CALL_DURATION", duration)
        .numeric("EL_TAX_AMOUNT", tax(Scope::FirstAccount))
        .numeric("EL_GROSS_CALL_COST", Rule::Debit)
        .numeric("EL_CALL_COST", Rule::CallCost)
        .text("EL_ROAMING_INDICATOR", Rule::RoamingFlag)
        .text("EL_CALL_VOLUME", volume)
        .text("EL_BAND_LABEL_AMA_CODE", Rule::Const("onnet"))
        .text("EL_APPLIED_DISCOUNT_ID", Rule::AppliedDiscounts)
        .integer("EL_EVENT_LABEL_2", Rule::EventLabel)
        .text("EL_ORIGINATING_ZONE_CODE", Rule::Blank)
        .text("EL_PROCESSED_TIMESTAMP", Rule::Timestamp(&["generationTimestamp"]))
        .text("EL_PLAN_ID", Rule::Joined(&["bundleName"], ","))
        .blank(&["EL_PEAK", "EL_OFF_PEAK"])
        .text("EL_EVENT_RESULT", Rule::EventResult)
        .text("EL_GENERATION_TIMESTAMP", root(&["generationTimestamp"]))
        .text("EL_PROCESS_FILENAME", Rule::SourceFile)
        .text("EL_CUG_ENABLED", Rule::Const("false"))
        .text("EL_APPLIED_FAMILY_GROUP_DISCOUNT_IDS", Rule::Blank)
        .text("EL_POSTPAIDBUCKETID", Rule::Joined(&["bundleName"], ","))
        .text("EL_POSTPAIDBUCKETUSAGES", Rule::BucketUsages)
        .text("EL_CDR_REFERENCE_NUMBER", root(&["sessionId"]))
        .text("EL_ROUNDED_CALL_DURATION", rounded_duration)
        .text("EL_ROUNDED_CALL_VOLUME", rounded_volume)
        .text("EL_CHARGE_CODE", Rule::Blank)
        .text("EL_PLAN_NAME", Rule::MainOffering)
        .build(format!("{}/BILLING", category.label()))
}

/// Data-session warehouse record, shared by single and group usage.
fn data_warehouse(category: Category) -> Layout {
    let mut f = Fields::default();
    f.text("EL_CDR_ID", root(&["sessionId"]))
        .text("EL_CDR_SUB_ID", mscc(&["localSequenceNumber"]))
        .text("EL_SRC_CDR_ID", Rule::Blank)
        .text("EL_CUST_LOCAL_START_DATE", root(&["generationTimestamp"]))
        .text("EL_RATE_USAGE", mscc(&["totalVolumeConsumed", "timeUsage"]))
        .numeric("EL_DEBIT_AMOUNT", Rule::Debit)
        .text("EL_FREE_UNIT_AMOUNT_OF_DURATION", Rule::Blank)
        .text("EL_FREE_UNIT_AMOUNT_OF_FLUX", Rule::FreeUnits)
        .account_slots()
        .bucket_slots()
        .text("EL_CALLING_PARTY_NUMBER", Rule::SubscriptionId("0"))
        .text("EL_APN", root(&["accessPointName"]))
        .text("EL_URL", Rule::Blank)
        .text("EL_CALLING_PARTY_IMSI", Rule::Imsi(None))
        .text("EL_TOTAL_FLUX", mscc(&["totalVolumeConsumed"]))
        .text("EL_UP_FLUX", mscc(&["uplinkVolumeConsumed"]))
        .text("EL_DOWN_FLUX", mscc(&["downlinkVolumeConsumed"]))
        .text("EL_ELAPSE_DURATION", root(&["duration"]))
        .text("EL_IMEI", Rule::Imei)
        .text("EL_BEARER_PROTOCOL_TYPE", Rule::Blank)
        .text("EL_MAIN_OFFERING_ID", Rule::Joined(&["bundleName"], ","))
        .text("EL_PAY_TYPE", Rule::PayType)
        .text("EL_CHARGING_TYPE", Rule::Attr(Scope::Service, &["chargingServiceType"]))
        .text("EL_ROAM_STATE", root(&["roamingIndicator"]))
        .blank(&["EL_CALLING_VPN_TOP_GROUP_NUMBER", "EL_CALLING_VPN_GROUP_NUMBER"])
        .text("EL_START_TIME_OF_BILL_CYCLE", root(&["recordOpeningTime"]))
        .text("EL_LAST_EFFECT_OFFERING", Rule::Blank)
        .text("EL_RATING_GROUP", mscc(&["ratingGroup"]))
        .text("EL_USER_STATE", root(&["deviceState"]))
        .text("EL_RAT_TYPE", root(&["rATType", "ratType"]))
        .blank(&["EL_CHARGE_PARTY_INDICATOR", "EL_COUNTRY_NAME", "EL_PAY_DEFAULT_ACCT_ID"])
        .numeric("EL_TAX1", tax(Scope::FirstAccount))
        .numeric("EL_TAX2", tax(Scope::FirstBucket))
        .text("EL_LOCATION", Rule::Location(&["userLocationInformation"]))
        .text("EL_ALTERNATE_ID", Rule::Joined(&["alternateId"], "~"))
        .blank(&["EL_BUSINESS_TYPE", "EL_SUBSCRIBER_KEY", "EL_ACCOUNT_KEY"])
        .balance_info(&BALANCE_INFO)
        .balance_info(&BALANCE_INFO_VOLUME)
        .text("EL_UNLTD_BUNDLE_NAME", Rule::Unlimited(Usage::Volume, UnlimitedCol::Bundle))
        .text("EL_UNLTD_TOTAL_VOLUME_CHARGED", Rule::Unlimited(Usage::Volume, UnlimitedCol::Charged))
        .text("EL_UNLTD_BUNDLE_UNIT_TYPE", Rule::Unlimited(Usage::Volume, UnlimitedCol::UnitType))
        .text("EL_ORIG_LOCATION", Rule::Location(&["origUserLocationInfo"]));
    f.build(format!("{}/WAREHOUSE", category.label()))
}

/// Parties, network and offering fields common to event and e-commerce
/// warehouse records.
fn party_block(f: &mut Fields, default_flow: &'static str) {
    f.text("EL_CALLING_PARTY_NUMBER", Rule::Number(Party::Calling))
        .text("EL_CALLED_PARTY_NUMBER", Rule::Number(Party::Called))
        .text("EL_CALLING_PARTY_IMSI", Rule::Imsi(Some(Party::Calling)))
        .text("EL_CALLED_PARTY_IMSI", Rule::Imsi(Some(Party::Called)))
        .text(
            "EL_SERVICE_FLOW",
            Rule::FirstOf(vec![
                mscc(&["subRecordEventType"]),
                root(&["subRecordEventType"]),
                Rule::Const(default_flow),
            ]),
        )
        .text("EL_CALLING_LOCATION_INFO", Rule::Location(&["userLocationInformation"]))
        .text("EL_CALLED_LOCATION_INFO", Rule::Location(&["userLocationInformation"]))
        .text("EL_SEND_RESULT", root(&["resultCode", "resultcode"]))
        .text("EL_IMEI", Rule::Imei)
        .text("EL_REFUND_INDICATOR", root(&["refundIndicator"]))
        .text("EL_MAIN_OFFERING_ID", Rule::MainOffering)
        .text("EL_CHARGING_PARTY_NUMBER", Rule::Number(Party::Calling))
        .text("EL_CHARGE_PARTY_IND", root(&["chargePartyIndicator", "chargedParty"]))
        .text("EL_PAY_TYPE", Rule::PayType)
        .numeric("EL_ON_NET_INDICATOR", Rule::OnNet)
        .text("EL_ROAM_STATE", root(&["RoamingStatus", "roamingIndicator"]))
        .text("EL_OPPOSE_NETWORK_TYPE", root(&["rATType", "ratType"]))
        .text("EL_CALLING_VPN_TOP_GROUP_NUMBER", group_id())
        .blank(&[
            "EL_CALLING_VPN_GROUP_NUMBER",
            "EL_CALLING_VPN_SHORT_NUMBERs",
            "EL_CALLED_VPN_TOP_GROUP_NUMBER",
            "EL_CALLED_VPN_GROUP_NUMBER",
            "EL_CALLED_VPN_SHORT_NUMBER",
            "EL_LAST_EFFECT_OFFERING",
        ])
        .text("EL_ALTERNATE_ID", Rule::Joined(&["alternateId"], "~"))
        .text("EL_HOME_ZONE_ID", root(&["homeZoneId", "homeZoneID"]))
        .text("EL_USER_STATE", root(&["deviceState"]))
        .text("EL_PAY_DEFAULT_ACCT_ID", Rule::Blank)
        .numeric("EL_TAX1", tax(Scope::FirstAccount))
        .numeric("EL_TAX2", tax(Scope::FirstBucket))
        .text("EL_USER_GROUP_ID", group_id())
        .blank(&[
            "EL_BUSINESS_TYPE",
            "EL_SUBSCRIBER_KEY",
            "EL_ACCOUNT_KEY",
            "EL_DISCOUNT_OF_LAST_EFF_PROD",
        ]);
}

/// Voice, SMS, MMS and USSD warehouse record. Voice counts time, the
/// messaging families count units; the column names are shared.
fn event_warehouse(category: Category, usage: Usage) -> Layout {
    let consumed = Rule::Attr(Scope::Mscc, usage.consumed_keys());
    let mut f = Fields::default();
    f.text("EL_CDR_ID", root(&["sessionId", "recordId"]))
        .text("EL_SRC_CDR_ID", root(&["sessionSequenceNumber"]))
        .text(
            "EL_CUST_LOCAL_START_DATE",
            root(&["callAnswerTime", "recordOpeningTime", "generationTimestamp"]),
        )
        .text("EL_SESSION_ID", root(&["sessionId"]))
        .numeric("EL_ACTUAL_USAGE", consumed.clone())
        .numeric("EL_RATE_USAGE", consumed)
        .numeric("EL_DEBIT_AMOUNT", Rule::Debit)
        .text("EL_FREE_UNIT_AMOUNT_OF_DURATION", Rule::FreeUnits)
        .account_slots()
        .bucket_slots();
    party_block(&mut f, category.label());
    f.balance_info(&BALANCE_INFO)
        .balance_info(&BALANCE_INFO_TIME)
        .text("EL_UNLTD_BUNDLE_NAME", Rule::Unlimited(usage, UnlimitedCol::Bundle))
        .numeric("EL_UNLTD_TOTAL_TIME_CHARGED", Rule::Unlimited(usage, UnlimitedCol::Charged))
        .numeric("EL_UNLTD_ROUNDED_UNITS_CHARGED", Rule::Unlimited(usage, UnlimitedCol::Rounded))
        .text("EL_UNLTD_BUNDLE_UNIT_TYPE", Rule::Unlimited(usage, UnlimitedCol::UnitType))
        .text("EL_ORIG_LOCATION", Rule::Location(&["origUserLocationInfo"]));
    f.build(format!("{}/WAREHOUSE", category.label()))
}

fn ecommerce_warehouse() -> Layout {
    let mut f = Fields::default();
    f.text("EL_CDR_ID", root(&["sessionId", "recordId"]))
        .text("EL_SRC_CDR_ID", root(&["sessionSequenceNumber"]))
        .text(
            "EL_CUST_LOCAL_START_DATE",
            root(&["recordOpeningTime", "generationTimestamp"]),
        )
        .numeric("EL_DEBIT_AMOUNT", Rule::Debit)
        .text("EL_FREE_UNIT_AMOUNT_OF_DURATION", Rule::FreeUnits)
        .account_slots()
        .bucket_slots();
    party_block(&mut f, Category::Ecommerce.label());
    f.balance_info(&BALANCE_INFO)
        .balance_info(&BALANCE_INFO_UNITS)
        .text("EL_ORIG_LOCATION", Rule::Location(&["origUserLocationInfo"]));
    f.build(format!("{}/WAREHOUSE", Category::Ecommerce.label()))
}

const CALLING: Keys = &["callingPartyAddress", "originatorAddress", "Aparty"];
const CALLED: Keys = &["calledPartyAddress", "recipientAddress", "Bparty"];

fn redirect(redirected: Rule, normal: Rule) -> Rule {
    Rule::Redirect(Box::new(redirected), Box::new(normal))
}

fn account_number() -> Rule {
    redirect(Rule::SubscriptionId("0"), Rule::SubscriptionId("0"))
}

/// Loyalty usage line. Parties and the usage column depend on the service
/// family.
fn lms(category: Category) -> Layout {
    let (msisdn, dialled) = match category {
        Category::Voice => (account_number(), redirect(root(CALLING), root(CALLED))),
        Category::Sms | Category::Mms | Category::Ussd => (
            root(&["originatorAddress", "callingPartyAddress"]),
            root(&["recipientAddress", "calledPartyAddress"]),
        ),
        Category::Data | Category::Group | Category::Ecommerce => (Rule::SubscriptionId("0"), Rule::Blank),
    };
    let account_usage = match category {
        Category::Data | Category::Group => Rule::Attr(Scope::MainAccount, &["roundedVolumeCharged"]),
        Category::Voice => Rule::Attr(Scope::MainAccount, &["totalTimeCharged", "TotalTimeCharged"]),
        Category::Sms | Category::Ussd | Category::Ecommerce => {
            Rule::Attr(Scope::MainAccount, &["totalUnitsCharged", "TotalUnitsCharged"])
        }
        Category::Mms => Rule::Blank,
    };
    let usage_type = match category {
        Category::Mms => mscc(&["totalUnitsConsumed"]),
        _ => mscc(&["recordEventType", "subRecordEventType"]),
    };

    Fields::default()
        .integer("EL_LMS", Rule::Success)
        .text("EL_MSISDN", msisdn)
        .text("EL_DIALLED_DIGITS", dialled)
        .integer("EVENT_LABEL", Rule::EventLabel)
        .numeric("EL_CALL_COST", Rule::UsageCost)
        .integer("EL_ROAMING_INDICATOR", Rule::RoamingFlag)
        .text(
            "EL_USAGE_VOLUME",
            Rule::FirstOf(vec![
                Rule::BalanceCommitted,
                Rule::Attr(
                    Scope::BalanceBucket,
                    &["totalVolumeCharged", "totalTimeCharged", "totalUnitsCharged"],
                ),
                account_usage,
            ]),
        )
        .text("EL_PROCESS_FILENAME", Rule::SourceFile)
        .text("EL_USAGE_TYPE", usage_type)
        .text(
            "EL_EVENT_DATE",
            Rule::Timestamp(&["callAnswerTime", "recordOpeningTime", "generationTimestamp"]),
        )
        .text(
            "EL_PLAN_ID",
            Rule::FirstOf(vec![
                Rule::Attr(Scope::MainAccount, &["bundleName"]),
                Rule::Attr(Scope::Subscription, &["bundleName"]),
            ]),
        )
        .blank(&["EL_PLAN_NAME", "EL_PLAN_TYPE"])
        .text("EL_CDR_REFERENCE_NUMBER", root(&["sessionSequenceNumber"]))
        .build(format!("{}/LMS", category.label()))
}

/// Customer-care call view. The columns are the same for every category.
fn crm(category: Category) -> Layout {
    let main_bundle = || Rule::Attr(Scope::MainSubscription, &["bundleName", "bundle_name"]);
    let mut f = Fields::default();
    f.integer("EL_LMS", Rule::Success)
        .text(
            "EL_GENERATION_TIMESTAMP",
            Rule::Timestamp(&["callAnswerTime", "recordOpeningTime", "generationTimestamp"]),
        )
        .text("EL_EVENT_LABEL", mscc(&["recordEventType"]))
        .text("EL_ACCOUNT_ID", account_number())
        .text(
            "EL_DIALLED_DIGITS",
            redirect(
                Rule::FirstOf(vec![root(&["callingPartyAddress"]), root(&["calledPartyAddress"])]),
                root(&["calledPartyAddress"]),
            ),
        )
        .text("EL_CALL_DURATION", mscc(&["totalTimeConsumed"]))
        .numeric("EL_CALL_COST", Rule::MainDebit)
        .text("EL_LOCATION_INFORMATION", Rule::ShortLocation(&["userLocationInformation"]))
        .text("EL_TARIFF_PLAN", Rule::TariffPlan)
        .text("EL_CREDIT_EXPIRYDATE", Rule::Blank)
        .text("EL_SCP_NUMBER", root(&["meHostName"]))
        .text("EL_POST_EVENT_PRIMARY_BALANCE", Rule::Attr(Scope::MainAccount, &["accountBalanceAfter"]))
        .text("EL_CURRENCY_IDENTIFIER", Rule::Const("Cent"))
        .text("EL_EVENT_RESULT", Rule::EventResult)
        .text("EL_FIRSTCALL_FLAG", Rule::Const("false"))
        .text("EL_CALL_START_TIME", Rule::Timestamp(&["generationTimestamp"]))
        .integer("EL_ROAMING_INDICATOR", Rule::Roaming)
        .text("EL_EVENT_SIM_STATECODE", Rule::Const("Active"))
        .text("EL_CALL_DIRECTION", root(&["mediaName"]))
        .text("EL_SEQUENCE_NUMBER", root(&["sessionSequenceNumber"]))
        .blank(&[
            "EL_REDIRECTING_PARTY_ADDRESS",
            "EL_CIRCLE_ID",
            "EL_ORIGINATING_ZONE_CODE",
            "EL_DESTINATION_ZONE_CODE",
        ])
        .text("EL_DISCOUNT_ID", Rule::DiscountIds);
    for i in 0..SLOTS {
        let n = i + 1;
        f.text(format!("EL_BUCKET_VALUE{}_PRECALL", n), Rule::BucketAt(i, &["bucketBalanceBefore"]))
            .text(format!("EL_BUCKET_VALUE{}_POSTCALL", n), Rule::BucketAt(i, &["bucketBalanceAfter"]));
    }
    f.numeric("EL_BUCKET_VALUE10_PRECALL", Rule::BalanceCents(&["bucketBalanceBefore"]))
        .numeric("EL_BUCKET_VALUE10_POSTCALL", Rule::BalanceCents(&["bucketBalanceAfter"]))
        .blank(&["EL_MULTIPLE_SEQUENCE_NUMBER", "EL_QOS_RANGE_LABEL"])
        .numeric("EL_TOTAL_USED_FREE_SECONDS", Rule::BucketCommitted)
        .text("EL_CALL_VOLUME", Rule::Blank)
        .text("EL_GGSN_ADDRESS", root(&["gGSNAddress"]))
        .text("EL_BEARER_CAPABILITY", root(&["mediaName"]))
        .text("EL_CHARGING_ID", root(&["sessionId"]))
        .blank(&[
            "EL_RECHARGE_AMOUNT",
            "EL_NOMINAL_AMOUNT",
            "EL_VALIDITY",
            "EL_MERCHANT_ID",
            "EL_GRACE2_DATE",
            "EL_GRACE1_DATE",
            "EL_RECHARGE_CODE",
        ])
        .text("EL_APPLIED_DISCOUNTID", Rule::DiscountIds)
        .text("EL_PREEVENT_SUBSCRIBER_STATUS", Rule::Const("Active"))
        .blank(&["EL_SUBSCRIPTION_CHARGE", "EL_PROMOTIONAL_TARIFF_PLAN"])
        .text("EL_PRE_EVENT_PRIMARY_BALANCE", Rule::Attr(Scope::MainAccount, &["accountBalanceBefore"]))
        .text("EL_BAND_LABEL_AMA_CODE", Rule::Const("diameter"));
    for i in 0..SLOTS {
        f.text(format!("EL_BUCKETVALUE{}_USAGETYPE", i + 1), Rule::BucketAt(i, &["bucketUnitType"]));
    }
    f.numeric(
        "EL_VOICE_BUCKET_USAGE",
        Rule::FirstOf(vec![
            Rule::NonZero(Box::new(Rule::BucketCommitted)),
            Rule::BalanceCents(&["bucketCommitedUnits", "bucketCommittedUnits"]),
        ]),
    )
    .text("EL_IMSI", Rule::SubscriptionId("1"))
    .text("EL_OUTSTANDING_CHARGES", Rule::Blank)
    .text("EL_CDR_REFERENCE_NUMBER", root(&["sessionSequenceNumber"]))
    .text("EL_ALTERNATE_ID", Rule::Attr(Scope::Subscription, &["alternateId"]))
    .text("EL_DEFAULT_TARIFF_PLAN_AMA_COSP_CODE", main_bundle())
    .text("EL_PROTOCOL_TYPE", Rule::Const("diameter"))
    .text("EL_IMEI", Rule::Imei)
    .text("EL_PTP_COSP_AMA_CODE", main_bundle())
    .text("EL_PROCESS_FILENAME", Rule::SourceFile)
    .text("EL_PROCESSED_TIMESTAMP", Rule::Timestamp(&["callAnswerTime"]))
    .text("EL_ISCONTENTCDR", Rule::Const("false"))
    .text("EL_CLASS_OF_SERVICE_CODE", Rule::Const("0"))
    .text("EL_SERVING_SGSN_IP_ADDRESS", root(&["sGSNAddress"]))
    .text("EL_ENHANCED_ACCESS_TECHNOLOGY_TYPE", root(&["rATType", "ratType"]))
    .text("EL_TRANSACTION_ID", root(&["sessionId"]))
    .text("EL_MDN_SERIES", Rule::MdnSeries)
    .text("EL_CALLING_PARTY_ADDRESS", redirect(root(&["callingPartyAddress"]), root(&["callingPartyAddress"])));
    f.build(format!("{}/CRM", category.label()))
}

fn build(category: Category, projection: Projection) -> Layout {
    match projection {
        Projection::Tag => tag(),
        Projection::Billing => billing(category),
        Projection::Warehouse => match category {
            Category::Data | Category::Group => data_warehouse(category),
            Category::Voice => event_warehouse(category, Usage::Time),
            Category::Sms | Category::Mms | Category::Ussd => event_warehouse(category, Usage::Units),
            Category::Ecommerce => ecommerce_warehouse(),
        },
        Projection::Lms => lms(category),
        Projection::Crm => crm(category),
    }
}

/// Field table for a (category, projection) pair, built once per process.
pub fn layout_for(category: Category, projection: Projection) -> Option<&'static Layout> {
    static LAYOUTS: OnceLock<Vec<(Category, Projection, Layout)>> = OnceLock::new();
    LAYOUTS
        .get_or_init(|| {
            Category::ALL
                .iter()
                .flat_map(|c| Projection::ALL.iter().map(move |p| (*c, *p, build(*c, *p))))
                .collect()
        })
        .iter()
        .find(|(c, p, _)| *c == category && *p == projection)
        .map(|(_, _, layout)| layout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MediationConfig;
    use crate::derive::derive;
    use crate::tree::{normalize, GenericNode};
    use serde_json::json;
    use std::collections::HashSet;

    fn layout(category: Category, projection: Projection) -> &'static Layout {
        layout_for(category, projection).unwrap()
    }

    #[test]
    fn declared_sizes() {
        assert_eq!(layout(Category::Data, Projection::Tag).fields.len(), 10);
        assert_eq!(layout(Category::Voice, Projection::Billing).fields.len(), 29);
        assert_eq!(layout(Category::Data, Projection::Warehouse).fields.len(), 115);
        assert_eq!(layout(Category::Group, Projection::Warehouse).fields.len(), 115);
        assert_eq!(layout(Category::Sms, Projection::Lms).fields.len(), 14);
        assert_eq!(layout(Category::Voice, Projection::Crm).fields.len(), 80);
    }

    #[test]
    fn crm_bucket_columns_interleave() {
        let names: Vec<&str> = layout(Category::Voice, Projection::Crm).names().collect();
        let pre1 = names.iter().position(|n| *n == "EL_BUCKET_VALUE1_PRECALL").unwrap();
        assert_eq!(names[pre1 + 1], "EL_BUCKET_VALUE1_POSTCALL");
        assert_eq!(names[pre1 + 2], "EL_BUCKET_VALUE2_PRECALL");
        assert_eq!(names[pre1 + 10], "EL_BUCKET_VALUE10_PRECALL");
        assert_eq!(names.last(), Some(&"EL_CALLING_PARTY_ADDRESS"));
    }

    fn voice_call(roaming: &str) -> GenericNode {
        normalize(&json!({
            "recordType": "OCSChargingRecord",
            "recordElements": {
                "subRecordEventType": "MTC", "roamingIndicator": roaming, "resultCode": "2001",
                "callingPartyAddress": "911555666", "calledPartyAddress": "0911000001",
                "sessionSequenceNumber": "7", "generationTimestamp": "05/03/2024 10:11:12"
            },
            "recordExtensions": [
                {"recordProperty": "listOfSubscriptionID", "recordSubExtensions": [
                    {"recordProperty": "subscriptionId", "recordElements": {"subscriptionIdType": "0", "subscriptionIdData": "911223344"}}
                ]},
                {"recordProperty": "listOfMscc", "recordSubExtensions": [{
                    "recordProperty": "mscc",
                    "recordElements": {"recordEventType": "VOICE", "ratingGroup": "20", "totalTimeConsumed": "60"},
                    "recordSubExtensions": [
                        {"recordProperty": "subscriptionInfo", "recordElements": {"bundleName": "Basic"}, "recordSubExtensions": [{
                            "recordProperty": "chargingServiceInfo",
                            "recordSubExtensions": [{"recordProperty": "accountInfo", "recordElements": {
                                "accountType": "PREPAID", "accountBalanceBefore": "10", "accountBalanceAfter": "8.5"
                            }}]
                        }]},
                        {"recordProperty": "subscriptionInfo", "recordElements": {"bundleName": "Night"}, "recordSubExtensions": [{
                            "recordProperty": "chargingServiceInfo",
                            "recordSubExtensions": [{"recordProperty": "bucketInfo", "recordElements": {
                                "bucketName": "b1", "bucketUnitType": "SEC", "bucketBalanceBefore": "100",
                                "bucketBalanceAfter": "40", "bucketCommitedUnits": "60"
                            }}]
                        }]},
                        {"recordProperty": "additionalBalanceInfo", "recordSubExtensions": [{
                            "recordProperty": "bucketInfo",
                            "recordElements": {"bucketCommitedUnits": "30", "bucketBalanceBefore": "500", "bucketBalanceAfter": "470"}
                        }]}
                    ]
                }]}
            ]
        }))
    }

    #[test]
    fn roaming_terminated_call_reports_the_other_party() {
        let cfg = MediationConfig::default();
        let tree = voice_call("ROAMING");

        let lms = derive(&tree, &cfg, Category::Voice, Projection::Lms, "v.json").unwrap();
        assert_eq!(lms.len(), 14);
        assert_eq!(lms.text("EL_MSISDN"), "251911223344");
        assert_eq!(lms.text("EL_DIALLED_DIGITS"), "251911555666");
        assert_eq!(lms.text("EL_CALL_COST"), "30.0");
        assert_eq!(lms.text("EL_USAGE_VOLUME"), "30.00000");
        assert_eq!(lms.text("EL_ROAMING_INDICATOR"), "1");
        assert_eq!(lms.text("EL_PLAN_ID"), "Basic");
        assert_eq!(lms.text("EL_CDR_REFERENCE_NUMBER"), "7");

        let crm = derive(&tree, &cfg, Category::Voice, Projection::Crm, "v.json").unwrap();
        assert_eq!(crm.text("EL_ACCOUNT_ID"), "251911223344");
        assert_eq!(crm.text("EL_CALL_COST"), "1.5");
        assert_eq!(crm.text("EL_TARIFF_PLAN"), "Basic-20");
        assert_eq!(crm.text("EL_DISCOUNT_ID"), "Night-b1");
        assert_eq!(crm.text("EL_BUCKET_VALUE1_PRECALL"), "100");
        assert_eq!(crm.text("EL_BUCKET_VALUE1_POSTCALL"), "40");
        assert_eq!(crm.text("EL_BUCKET_VALUE2_PRECALL"), "");
        assert_eq!(crm.text("EL_BUCKET_VALUE10_PRECALL"), "5.0");
        assert_eq!(crm.text("EL_BUCKETVALUE1_USAGETYPE"), "SEC");
        assert_eq!(crm.text("EL_TOTAL_USED_FREE_SECONDS"), "60.0");
        assert_eq!(crm.text("EL_DEFAULT_TARIFF_PLAN_AMA_COSP_CODE"), "Basic");
        assert_eq!(crm.text("EL_MDN_SERIES"), "44");
    }

    #[test]
    fn home_call_keeps_its_own_numbers() {
        let cfg = MediationConfig::default();
        let tree = voice_call("HOME");
        let crm = derive(&tree, &cfg, Category::Voice, Projection::Crm, "v.json").unwrap();
        assert_eq!(crm.text("EL_ACCOUNT_ID"), "911223344");
        assert_eq!(crm.text("EL_DIALLED_DIGITS"), "0911000001");
        assert_eq!(crm.text("EL_ROAMING_INDICATOR"), "0");
        assert_eq!(crm.text("EL_MDN_SERIES"), "44");
    }

    #[test]
    fn names_are_unique_within_each_layout() {
        for c in Category::ALL {
            for p in Projection::ALL {
                let l = layout(c, p);
                let unique: HashSet<&str> = l.names().collect();
                assert_eq!(unique.len(), l.fields.len(), "{}", l.name);
            }
        }
    }

    #[test]
    fn warehouse_slot_groups_are_contiguous() {
        let l = layout(Category::Data, Projection::Warehouse);
        let names: Vec<&str> = l.names().collect();
        assert_eq!(names[8], "EL_ACCT_BALANCE_ID1");
        assert_eq!(names[32], "EL_RATE_ID5");
        assert_eq!(names[33], "EL_BUCKET_BALANCE_ID1");
        assert_eq!(names[57], "EL_BUCKET_RATE_ID5");
        assert_eq!(names[89], "EL_ADDITIONALBALANCEINFO_CHARGINGSERVICENAME");
        assert_eq!(names[114], "EL_ORIG_LOCATION");
    }

    #[test]
    fn event_layouts_share_columns() {
        let voice: Vec<&str> = layout(Category::Voice, Projection::Warehouse).names().collect();
        let sms: Vec<&str> = layout(Category::Sms, Projection::Warehouse).names().collect();
        assert_eq!(voice, sms);
        assert_eq!(voice.last(), Some(&"EL_ORIG_LOCATION"));
        let ecom = layout(Category::Ecommerce, Projection::Warehouse);
        assert!(ecom.names().all(|n| !n.starts_with("EL_UNLTD")));
    }
}
