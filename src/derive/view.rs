//! Pre-located blocks of one record tree, shared by every rule.

use crate::config::MediationConfig;
use crate::tree::{find_all, find_first, GenericNode};

pub const SUBSCRIPTION_ID_TYPE: [&str; 2] = ["subscriptionIdType", "subscriptionIDType"];
pub const SUBSCRIPTION_ID_DATA: [&str; 2] = ["subscriptionIdData", "subscriptionIDData"];

/// One `subscriptionInfo` with the blocks found directly under its
/// `chargingServiceInfo` children.
#[derive(Debug)]
pub struct Subscription<'a> {
    pub node: &'a GenericNode,
    pub services: Vec<&'a GenericNode>,
    pub accounts: Vec<&'a GenericNode>,
    pub buckets: Vec<&'a GenericNode>,
}

impl<'a> Subscription<'a> {
    fn new(node: &'a GenericNode) -> Self {
        let services: Vec<&GenericNode> = node.blocks_tagged("chargingServiceInfo").collect();
        let accounts = services
            .iter()
            .flat_map(|s| s.blocks_tagged("accountInfo"))
            .collect();
        let buckets = services
            .iter()
            .flat_map(|s| s.blocks_tagged("bucketInfo"))
            .collect();
        Self {
            node,
            services,
            accounts,
            buckets,
        }
    }

    pub fn bundle_name(&self) -> Option<String> {
        self.node.first_text(&["bundleName", "bundle_name"])
    }

    pub fn has_bucket(&self) -> bool {
        !self.buckets.is_empty()
    }
}

/// One `additionalBalanceInfo` occurrence. Attributes are read from the block
/// itself, then its `adjustBalanceInfo`, then the nearest `bucketInfo`.
#[derive(Debug)]
pub struct BalanceInfo<'a> {
    pub node: &'a GenericNode,
    pub adjust: Option<&'a GenericNode>,
    pub bucket: Option<&'a GenericNode>,
}

impl<'a> BalanceInfo<'a> {
    fn new(node: &'a GenericNode) -> Self {
        let adjust = node.first_block("adjustBalanceInfo");
        let bucket = adjust
            .and_then(|a| a.first_block("bucketInfo"))
            .or_else(|| node.first_block("bucketInfo"));
        Self {
            node,
            adjust,
            bucket,
        }
    }

    pub fn text(&self, keys: &[&str]) -> Option<String> {
        [Some(self.node), self.adjust, self.bucket]
            .into_iter()
            .flatten()
            .find_map(|n| n.first_text(keys))
    }
}

pub struct RecordView<'a> {
    pub root: &'a GenericNode,
    pub config: &'a MediationConfig,
    pub source: &'a str,
    pub msccs: Vec<&'a GenericNode>,
    pub subscriptions: Vec<Subscription<'a>>,
    /// Every `accountInfo` in tree order.
    pub accounts: Vec<&'a GenericNode>,
    pub balance_infos: Vec<BalanceInfo<'a>>,
    pub subscription_ids: Vec<&'a GenericNode>,
}

impl<'a> RecordView<'a> {
    pub fn new(root: &'a GenericNode, config: &'a MediationConfig, source: &'a str) -> Self {
        Self {
            root,
            config,
            source,
            msccs: find_all(root, "mscc"),
            subscriptions: find_all(root, "subscriptionInfo")
                .into_iter()
                .map(Subscription::new)
                .collect(),
            accounts: find_all(root, "accountInfo"),
            balance_infos: find_all(root, "additionalBalanceInfo")
                .into_iter()
                .map(BalanceInfo::new)
                .collect(),
            subscription_ids: find_all(root, "subscriptionId"),
        }
    }

    pub fn root_text(&self, keys: &[&str]) -> Option<String> {
        self.root.first_text(keys)
    }

    pub fn mscc(&self) -> Option<&'a GenericNode> {
        self.msccs.first().copied()
    }

    pub fn mscc_text(&self, keys: &[&str]) -> Option<String> {
        self.mscc()?.first_text(keys)
    }

    /// First subscription with an account and no bucket: the main offering.
    pub fn main_subscription(&self) -> Option<&Subscription<'a>> {
        self.subscriptions
            .iter()
            .find(|s| !s.has_bucket() && !s.accounts.is_empty())
    }

    pub fn main_account(&self) -> Option<&'a GenericNode> {
        self.main_subscription()?.accounts.first().copied()
    }

    /// Subscriptions holding at least one bucket, in tree order.
    pub fn bucket_groups(&self) -> impl Iterator<Item = &Subscription<'a>> {
        self.subscriptions.iter().filter(|s| s.has_bucket())
    }

    pub fn buckets(&self) -> impl Iterator<Item = &'a GenericNode> + '_ {
        self.bucket_groups().flat_map(|s| s.buckets.iter().copied())
    }

    /// Data of the first subscription id of `id_type`.
    pub fn subscription_id(&self, id_type: &str) -> Option<String> {
        self.subscription_ids.iter().find_map(|sid| {
            let t = sid.first_text(&SUBSCRIPTION_ID_TYPE)?;
            (t.trim() == id_type)
                .then(|| sid.first_text(&SUBSCRIPTION_ID_DATA))
                .flatten()
        })
    }

    pub fn any_subscription_id(&self) -> Option<String> {
        self.subscription_ids
            .iter()
            .find_map(|sid| sid.first_text(&SUBSCRIPTION_ID_DATA))
    }

    pub fn has_block(&self, tag: &str) -> bool {
        find_first(self.root, tag).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::normalize;
    use serde_json::json;

    #[test]
    fn locates_blocks_across_nesting() {
        let tree = normalize(&json!({
            "recordElements": {"sessionId": "s1"},
            "recordExtensions": [
                {"recordProperty": "listOfSubscriptionID", "recordSubExtensions": [
                    {"recordProperty": "subscriptionId", "recordElements": {"subscriptionIDType": "1", "subscriptionIdData": "imsi-6360"}},
                    {"recordProperty": "subscriptionId", "recordElements": {"subscriptionIdType": 0, "subscriptionIdData": "251911000001"}}
                ]},
                {"recordProperty": "listOfMscc", "recordSubExtensions": [
                    {"recordProperty": "mscc", "recordElements": {"ratingGroup": "10"}, "recordSubExtensions": [
                        {"recordProperty": "deviceInfo", "recordSubExtensions": [
                            {"recordProperty": "subscriptionInfo", "recordElements": {"bundleName": "B1"}, "recordSubExtensions": [
                                {"recordProperty": "chargingServiceInfo", "recordSubExtensions": [
                                    {"recordProperty": "bucketInfo", "recordElements": {"bucketName": "x"}},
                                    {"recordProperty": "accountInfo", "recordElements": {"accountID": "a1"}},
                                    {"recordProperty": "additionalBalanceInfo",
                                     "recordElements": {"chargingServiceName": "cs"},
                                     "recordSubExtensions": [
                                        {"recordProperty": "adjustBalanceInfo", "recordElements": {"usageType": "PRIMARY"},
                                         "recordSubExtensions": [{"recordProperty": "bucketInfo", "recordElements": {"rateId": "r9"}}]}
                                     ]}
                                ]}
                            ]},
                            {"recordProperty": "subscriptionInfo", "recordElements": {"bundleName": "B2"}}
                        ]}
                    ]}
                ]}
            ]
        }));
        let cfg = MediationConfig::default();
        let view = RecordView::new(&tree, &cfg, "f.json");

        assert_eq!(view.subscriptions.len(), 2);
        assert_eq!(view.bucket_groups().count(), 1);
        assert_eq!(view.accounts.len(), 1);
        assert!(view.main_subscription().is_none());
        assert_eq!(view.mscc_text(&["ratingGroup"]).as_deref(), Some("10"));
        assert_eq!(view.subscription_id("0").as_deref(), Some("251911000001"));
        assert_eq!(view.subscription_id("1").as_deref(), Some("imsi-6360"));

        let abi = &view.balance_infos[0];
        assert_eq!(abi.text(&["chargingServiceName"]).as_deref(), Some("cs"));
        assert_eq!(abi.text(&["usageType"]).as_deref(), Some("PRIMARY"));
        assert_eq!(abi.text(&["rateId"]).as_deref(), Some("r9"));
    }
}
