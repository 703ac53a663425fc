use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{PipelineError, Result};
use crate::routing::{Condition, RoutingRule};

/// Rating groups the billing filter rejects, per service family.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RatingGroupFilters {
    pub data: Vec<String>,
    pub voice: Vec<String>,
    pub sms: Vec<String>,
}

/// Runtime configuration. Every key is optional; a partial file overrides
/// only the keys it names.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MediationConfig {
    pub success_result_codes: Vec<String>,
    /// `"lo-hi"` (last two MSISDN digits) to circle id.
    pub circle_ranges: BTreeMap<String, u32>,
    pub routing_rules: Vec<RoutingRule>,
    pub output_dirs: BTreeMap<String, PathBuf>,
    /// Sub-path whitelist of the partitioned destination, keyed by usage kind.
    pub dwh_structure: BTreeMap<String, Vec<String>>,
    pub partitioned_destination: String,
    pub ecommerce_excluded_destination: String,
    pub rating_group_filters: RatingGroupFilters,
    pub billing_filter: bool,
    pub strict_el: bool,
    pub country_code: String,
    #[serde(alias = "pollInterval")]
    pub poll_interval_secs: u64,
    pub workers: usize,
    pub dedup_retry_max: u32,
    pub dedup_retry_wait_ms: u64,
    /// Keys the in-memory dedup store keeps before evicting the oldest.
    pub dedup_capacity: usize,
    pub input_dir: PathBuf,
    pub processed_dir: PathBuf,
    pub rejects_dir: PathBuf,
    pub quarantine_dir: PathBuf,
    pub archive_dir: Option<PathBuf>,
}

const SERVICES: [&str; 6] = ["DATA", "VOICE", "SMS", "MMS", "USSD", "ECOMMERCE"];

fn rule(name: &str, conditions: &[(&str, Condition)]) -> RoutingRule {
    RoutingRule {
        name: name.to_string(),
        conditions: conditions
            .iter()
            .map(|(k, c)| (k.to_string(), c.clone()))
            .collect(),
    }
}

impl Default for MediationConfig {
    fn default() -> Self {
        let circle_ranges = (0..10u32)
            .map(|i| (format!("{}-{}", i * 10, i * 10 + 9), i + 1))
            .collect();

        let output_dirs = [
            ("CRM", "./out/crm"),
            ("BILLING", "./out/billing"),
            ("LMS", "./out/lms"),
            ("RA", "./out/ra"),
            ("DWH", "./out/DWH"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), PathBuf::from(v)))
        .collect();

        let services: Vec<String> = SERVICES.iter().map(|s| s.to_string()).collect();
        let dwh_structure = [
            ("group_usage".to_string(), services.clone()),
            ("single_usage".to_string(), services),
        ]
        .into_iter()
        .collect();

        Self {
            success_result_codes: vec!["2001".into(), "4012".into()],
            circle_ranges,
            routing_rules: vec![
                rule("CRM", &[]),
                rule(
                    "BILLING",
                    &[
                        ("EL_PRE_POST", Condition::Text("POSTPAID".into())),
                        ("EL_SUCCESS", Condition::Number(1.0)),
                    ],
                ),
                rule(
                    "LMS",
                    &[
                        ("EL_SUCCESS", Condition::Number(1.0)),
                        ("EL_DEBIT_AMOUNT", Condition::Text(">0".into())),
                    ],
                ),
                rule("RA", &[]),
                rule("DWH", &[]),
            ],
            output_dirs,
            dwh_structure,
            partitioned_destination: "DWH".into(),
            ecommerce_excluded_destination: "LMS".into(),
            rating_group_filters: RatingGroupFilters {
                data: vec!["100".into(), "200".into()],
                voice: Vec::new(),
                sms: Vec::new(),
            },
            billing_filter: false,
            strict_el: false,
            country_code: "251".into(),
            poll_interval_secs: 5,
            workers: 4,
            dedup_retry_max: 5,
            dedup_retry_wait_ms: 100,
            dedup_capacity: 1_000_000,
            input_dir: PathBuf::from("./in"),
            processed_dir: PathBuf::from("./processed"),
            rejects_dir: PathBuf::from("./rejects"),
            quarantine_dir: PathBuf::from("./quarantine"),
            archive_dir: None,
        }
    }
}

impl MediationConfig {
    /// Reads a JSON config. A missing file means defaults; a file that does
    /// not parse is a startup error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!("Config {:?} not found, using defaults", path);
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)?;
        let cfg: Self = serde_json::from_str(&text)
            .map_err(|e| PipelineError::Configuration(format!("{}: {}", path.display(), e)))?;
        cfg.validate()?;
        info!("Loaded config from {:?}", path);
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(PipelineError::Configuration("workers must be at least 1".into()));
        }
        if self.dedup_capacity == 0 {
            return Err(PipelineError::Configuration("dedupCapacity must be at least 1".into()));
        }
        for range in self.circle_ranges.keys() {
            if parse_range(range).is_none() {
                return Err(PipelineError::Configuration(format!(
                    "circle range '{}' is not of the form lo-hi",
                    range
                )));
            }
        }
        Ok(())
    }

    pub fn is_success_code(&self, code: &str) -> bool {
        self.success_result_codes.iter().any(|c| c == code)
    }

    /// Circle id for the last two digits of `msisdn`; 0 when nothing matches.
    pub fn circle_for(&self, msisdn: &str) -> u32 {
        let tail: String = {
            let chars: Vec<char> = msisdn.chars().collect();
            chars[chars.len().saturating_sub(2)..].iter().collect()
        };
        let Ok(last_two) = tail.parse::<u32>() else {
            return 0;
        };
        self.circle_ranges
            .iter()
            .find_map(|(range, id)| {
                let (lo, hi) = parse_range(range)?;
                (lo..=hi).contains(&last_two).then_some(*id)
            })
            .unwrap_or(0)
    }

    pub fn output_dir(&self, destination: &str) -> PathBuf {
        self.output_dirs
            .get(destination)
            .cloned()
            .unwrap_or_else(|| PathBuf::from(format!("./out/{}", destination.to_lowercase())))
    }
}

fn parse_range(range: &str) -> Option<(u32, u32)> {
    let (lo, hi) = range.split_once('-')?;
    Some((lo.trim().parse().ok()?, hi.trim().parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_table() {
        let cfg = MediationConfig::default();
        assert_eq!(cfg.routing_rules.len(), 5);
        assert_eq!(cfg.routing_rules[2].name, "LMS");
        assert_eq!(cfg.output_dir("DWH"), PathBuf::from("./out/DWH"));
        assert_eq!(cfg.output_dir("AUDIT"), PathBuf::from("./out/audit"));
        assert!(cfg.is_success_code("4012"));
        assert!(!cfg.is_success_code("5030"));
    }

    #[test]
    fn circle_lookup_uses_last_two_digits() {
        let cfg = MediationConfig::default();
        assert_eq!(cfg.circle_for("251911223305"), 1);
        assert_eq!(cfg.circle_for("251911223347"), 5);
        assert_eq!(cfg.circle_for("251911223399"), 10);
        assert_eq!(cfg.circle_for(""), 0);
        assert_eq!(cfg.circle_for("abc"), 0);
    }

    #[test]
    fn partial_file_overrides_only_named_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"pollInterval": 9, "countryCode": "254", "routingRules": []}"#).unwrap();

        let cfg = MediationConfig::load(&path).unwrap();
        assert_eq!(cfg.poll_interval_secs, 9);
        assert_eq!(cfg.country_code, "254");
        assert!(cfg.routing_rules.is_empty());
        assert_eq!(cfg.success_result_codes, vec!["2001", "4012"]);
    }

    #[test]
    fn unreadable_config_is_fatal_and_missing_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("bad.json");
        fs::write(&bad, "{ not json").unwrap();
        assert!(matches!(MediationConfig::load(&bad), Err(PipelineError::Configuration(_))));

        let missing = dir.path().join("missing.json");
        assert_eq!(MediationConfig::load(&missing).unwrap().workers, 4);
    }

    #[test]
    fn bad_circle_range_is_rejected() {
        let mut cfg = MediationConfig::default();
        cfg.circle_ranges.insert("ten".into(), 3);
        assert!(cfg.validate().is_err());
    }
}
