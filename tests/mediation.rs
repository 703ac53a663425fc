use std::fs;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

use cdr_mediation::codec::{RecordDecoder, SchemaCodec};
use cdr_mediation::collab::{LocalTransport, MemoryDedupStore};
use cdr_mediation::config::MediationConfig;
use cdr_mediation::derive::{derive_document, Category, Projection};
use cdr_mediation::pipeline::Pipeline;
use cdr_mediation::schema::{Asn1Schema, DEFAULT_ROOT_TYPE};
use serde_json::{json, Value};

fn codec() -> SchemaCodec {
    SchemaCodec::new(Asn1Schema::bundled().unwrap(), DEFAULT_ROOT_TYPE)
}

fn vars(pairs: &[(&str, &str)]) -> Value {
    Value::Array(
        pairs
            .iter()
            .map(|(k, v)| json!({"varName": k, "varValue": v}))
            .collect(),
    )
}

fn data_record(session: &str) -> Value {
    json!(["genericRecord", {
        "recordType": "OCSChargingRecord",
        "recordElements": vars(&[
            ("sessionId", session),
            ("sessionSequenceNumber", "1"),
            ("resultCode", "2001"),
            ("recordEventType", "PS"),
            ("generationTimestamp", "05/03/2024 10:11:12")
        ]),
        "recordExtensions": [{
            "recordProperty": "listOfMscc",
            "recordSubExtensions": [{
                "recordProperty": "mscc",
                "recordElements": vars(&[("ratingGroup", "10"), ("totalVolumeConsumed", "2048")]),
                "recordSubExtensions": [{
                    "recordProperty": "subscriptionInfo",
                    "recordSubExtensions": [{
                        "recordProperty": "chargingServiceInfo",
                        "recordSubExtensions": [{
                            "recordProperty": "accountInfo",
                            "recordElements": vars(&[
                                ("accountID", "ACC-1"),
                                ("accountType", "PREPAID"),
                                ("accountBalanceCommitted", "0.75")
                            ])
                        }]
                    }]
                }]
            }]
        }]
    }])
}

fn config(root: &Path) -> MediationConfig {
    let mut cfg = MediationConfig::default();
    cfg.workers = 2;
    cfg.poll_interval_secs = 1;
    cfg.input_dir = root.join("in");
    cfg.rejects_dir = root.join("rejects");
    cfg.quarantine_dir = root.join("quarantine");
    cfg.processed_dir = root.join("processed");
    cfg.output_dirs = ["CRM", "BILLING", "LMS", "RA", "DWH"]
        .iter()
        .map(|d| (d.to_string(), root.join("out").join(d)))
        .collect();
    cfg
}

fn read_json(path: &Path) -> Value {
    serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
}

#[test]
fn binary_file_is_decoded_tagged_and_routed() {
    let dir = tempfile::tempdir().unwrap();
    let codec = codec();
    let mut bytes = vec![0x00, 0x00];
    bytes.extend(codec.encode(&data_record("s-1")).unwrap());
    bytes.extend([0xFF]);
    bytes.extend(codec.encode(&data_record("s-2")).unwrap());
    let input = dir.path().join("cdr.bin");
    fs::write(&input, &bytes).unwrap();

    let pipeline = Pipeline::new(config(dir.path()), codec).unwrap();
    let report = pipeline.process_file(&input).unwrap();
    assert_eq!(report.records, 2);
    assert_eq!(report.routed, 2);
    assert_eq!(report.rejected, 0);

    let dwh = read_json(&dir.path().join("out/DWH/single_usage/DATA/cdr.json"));
    let routed = dwh.as_array().unwrap();
    assert_eq!(routed.len(), 2);
    assert_eq!(routed[0]["CBL_TAG"]["EL_REC_TYPE"], "DATA");
    assert_eq!(routed[0]["CBL_TAG"]["EL_PRE_POST"], "PREPAID");
    assert_eq!(routed[0]["CBL_TAG"]["EL_DEBIT_AMOUNT"], 0.75);
    assert_eq!(routed[0]["CBL_TAG"]["EL_DATE_DAY"], "20240305");
    assert!(routed[1]["original"]["payload"]["genericRecord"].is_array());

    assert!(dir.path().join("out/LMS/cdr.json").exists());
    assert!(!dir.path().join("out/BILLING/cdr.json").exists());
    assert!(dir.path().join("processed/cdr.bin").exists());
    assert!(!input.exists());
}

#[test]
fn undecodable_binary_is_quarantined() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("noise.bin");
    fs::write(&input, [0x01, 0x02, 0x03, 0x04]).unwrap();

    let pipeline = Pipeline::new(config(dir.path()), codec()).unwrap();
    let report = pipeline.process_file(&input).unwrap();
    assert!(report.quarantined);
    assert!(dir.path().join("quarantine/noise.bin").exists());
}

#[test]
fn warehouse_projection_of_a_decoded_record() {
    let cfg = MediationConfig::default();
    let doc = json!({"payload": {"genericRecord": data_record("s-3")}});
    let (category, record) = derive_document(&doc, &cfg, None, Projection::Warehouse, "cdr.bin").unwrap();

    assert_eq!(category, Category::Data);
    assert_eq!(record.len(), 115);
    assert_eq!(record.text("EL_CDR_ID"), "s-3");
    assert_eq!(record.text("EL_RATING_GROUP"), "10");
    assert_eq!(record.text("EL_TOTAL_FLUX"), "2048");
    assert_eq!(record.text("EL_PAY_TYPE"), "PREPAID");
    assert_eq!(record.text("EL_ACCT_BALANCE_ID1"), "ACC-1");
    assert_eq!(record.text("EL_DEBIT_AMOUNT"), "0.75");
    assert_eq!(record.text("EL_BUCKET_BALANCE_ID1"), "");
}

#[test]
fn watch_loop_claims_routes_and_drops_duplicates() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    let transport = LocalTransport::new(&cfg.input_dir, dir.path().join("work")).unwrap();
    let pipeline = Pipeline::new(cfg, codec())
        .unwrap()
        .with_dedup(Box::new(MemoryDedupStore::new(3, Duration::from_millis(1))));

    let record = json!({"payload": {"genericRecord": data_record("s-4")}});
    fs::write(dir.path().join("in/a.json"), record.to_string()).unwrap();
    fs::write(dir.path().join("in/b.json"), record.to_string()).unwrap();

    let stop = pipeline.stop_handle();
    thread::scope(|s| {
        let worker = s.spawn(|| pipeline.run(&transport));
        let deadline = Instant::now() + Duration::from_secs(20);
        while Instant::now() < deadline
            && !(dir.path().join("processed/a.json").exists() && dir.path().join("processed/b.json").exists())
        {
            thread::sleep(Duration::from_millis(50));
        }
        stop.store(true, Ordering::SeqCst);
        worker.join().unwrap().unwrap();
    });

    assert!(dir.path().join("out/CRM/a.json").exists());
    assert!(!dir.path().join("out/CRM/b.json").exists());
    assert!(!dir.path().join("rejects/b.json").exists());
}
