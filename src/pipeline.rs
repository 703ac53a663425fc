//! File-level orchestration: load, filter, dedup, tag, route and write.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use memmap2::Mmap;
use rayon::prelude::*;
use rayon::ThreadPool;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::codec::SchemaCodec;
use crate::collab::{dedup_keys, Archiver, DedupOutcome, DedupStore, Transport};
use crate::config::MediationConfig;
use crate::derive::{derive_document, derive_tag, Category, Projection};
use crate::error::{PipelineError, Result};
use crate::filter::{filter, Verdict};
use crate::framer::{decoded_document, frame};
use crate::routing::{route, routed_document, Destination};
use crate::tree::{locate_generic_record, normalize, record_documents};

static STOP: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
extern "C" fn on_signal(_: libc::c_int) {
    STOP.store(true, Ordering::SeqCst);
}

/// Routes SIGINT and SIGTERM to the process-wide stop flag.
#[cfg(unix)]
pub fn install_signal_handlers() {
    let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }
}

#[cfg(not(unix))]
pub fn install_signal_handlers() {}

pub fn stop_requested() -> bool {
    STOP.load(Ordering::SeqCst)
}

/// Writes `value` next to `path` and renames it into place, so readers never
/// see a partial file.
pub fn write_atomic(path: &Path, value: &Value) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| PipelineError::Malformed {
            path: path.to_path_buf(),
            reason: "output path has no file name".into(),
        })?;
    let tmp = dir.join(format!(".{}.tmp", name));
    let bytes = serde_json::to_vec_pretty(value)?;
    if let Err(e) = fs::write(&tmp, bytes).and_then(|_| fs::rename(&tmp, path)) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

fn move_file(from: &Path, dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let name = from.file_name().ok_or_else(|| PipelineError::Malformed {
        path: from.to_path_buf(),
        reason: "input path has no file name".into(),
    })?;
    let target = dir.join(name);
    if fs::rename(from, &target).is_err() {
        // rename fails across filesystems
        fs::copy(from, &target)?;
        fs::remove_file(from)?;
    }
    Ok(target)
}

fn one_or_many(mut values: Vec<Value>) -> Value {
    if values.len() == 1 {
        values.remove(0)
    } else {
        Value::Array(values)
    }
}

fn output_name(path: &Path) -> String {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("input");
    format!("{}.json", stem)
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"))
}

/// What became of one record.
#[derive(Debug)]
pub enum RecordOutcome {
    Routed(Vec<(Destination, Value)>),
    Rejected { reason: String, record: Value },
    Duplicate,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FileReport {
    pub records: usize,
    pub routed: usize,
    pub rejected: usize,
    pub duplicates: usize,
    pub quarantined: bool,
}

pub struct Pipeline {
    config: MediationConfig,
    codec: SchemaCodec,
    pool: ThreadPool,
    dedup: Option<Box<dyn DedupStore>>,
    archiver: Option<Box<dyn Archiver>>,
    stop: Arc<AtomicBool>,
}

impl Pipeline {
    pub fn new(config: MediationConfig, codec: SchemaCodec) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.workers.max(1))
            .build()
            .map_err(|e| PipelineError::Configuration(format!("worker pool: {}", e)))?;
        Ok(Self {
            config,
            codec,
            pool,
            dedup: None,
            archiver: None,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn with_dedup(mut self, store: Box<dyn DedupStore>) -> Self {
        self.dedup = Some(store);
        self
    }

    pub fn with_archiver(mut self, archiver: Box<dyn Archiver>) -> Self {
        self.archiver = Some(archiver);
        self
    }

    pub fn config(&self) -> &MediationConfig {
        &self.config
    }

    /// Flag that stops [`Pipeline::run`] at the next file boundary.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst) || stop_requested()
    }

    /// Reads an input file: JSON as-is, anything else framed and decoded.
    pub fn load_input(&self, path: &Path) -> Result<Value> {
        let malformed = |reason: String| PipelineError::Malformed {
            path: path.to_path_buf(),
            reason,
        };
        if is_json(path) {
            let bytes = fs::read(path)?;
            return serde_json::from_slice(&bytes).map_err(|e| malformed(e.to_string()));
        }

        let file = File::open(path)?;
        if file.metadata()?.len() == 0 {
            return Err(malformed("empty file".into()));
        }
        let mmap = unsafe { Mmap::map(&file)? };
        let records = frame(&self.codec, &mmap);
        if records.is_empty() {
            return Err(malformed("no decodable records".into()));
        }
        Ok(decoded_document(mmap.len(), &records))
    }

    /// Filter, tag, dedup and route one record document.
    pub fn route_record(&self, doc: &Value, source: &str) -> RecordOutcome {
        let reject = |reason: String| RecordOutcome::Rejected {
            reason,
            record: doc.clone(),
        };
        let Some(raw) = locate_generic_record(doc) else {
            return reject("no genericRecord found in input".into());
        };
        let tree = normalize(raw);

        if let Verdict::Reject(reason) = filter(&tree, &self.config) {
            return reject(reason);
        }

        let tag = match derive_tag(&tree, &self.config, source) {
            Ok(tag) => tag,
            Err(e) => return reject(e.to_string()),
        };

        // keys are recorded only for records that made it through tagging
        if let Some(store) = &self.dedup {
            match store.check_and_insert(&dedup_keys(&tree)) {
                Ok(DedupOutcome::Accepted) => {}
                Ok(DedupOutcome::Duplicate) => return RecordOutcome::Duplicate,
                Ok(DedupOutcome::Failed) => {
                    return reject("dedup failed: missing sessionId or sessionSequenceNumber".into())
                }
                Err(e) => return reject(e.to_string()),
            }
        }

        let routed = route(&tag, &self.config)
            .into_iter()
            .map(|dest| {
                let out = routed_document(doc, &tag);
                (dest, out)
            })
            .collect();
        RecordOutcome::Routed(routed)
    }

    /// Routes every record of `doc` on the worker pool and writes one file
    /// per destination.
    pub fn route_document(&self, doc: &Value, source: &Path) -> Result<FileReport> {
        let source_name = source
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        let records = record_documents(doc);
        let outcomes: Vec<RecordOutcome> = self.pool.install(|| {
            records
                .par_iter()
                .map(|r| self.route_record(r, &source_name))
                .collect()
        });

        let mut report = FileReport {
            records: records.len(),
            ..FileReport::default()
        };
        let mut per_destination: Vec<(Destination, Vec<Value>)> = Vec::new();
        let mut rejects = Vec::new();
        for outcome in outcomes {
            match outcome {
                RecordOutcome::Routed(routed) => {
                    report.routed += 1;
                    for (dest, value) in routed {
                        match per_destination.iter_mut().find(|(d, _)| *d == dest) {
                            Some((_, values)) => values.push(value),
                            None => per_destination.push((dest, vec![value])),
                        }
                    }
                }
                RecordOutcome::Rejected { reason, record } => {
                    report.rejected += 1;
                    rejects.push(json!({ "reason": reason, "record": record }));
                }
                RecordOutcome::Duplicate => report.duplicates += 1,
            }
        }

        let name = output_name(source);
        for (dest, values) in per_destination {
            write_atomic(&dest.dir.join(&name), &one_or_many(values))?;
        }
        if !rejects.is_empty() {
            write_atomic(&self.config.rejects_dir.join(&name), &one_or_many(rejects))?;
        }
        Ok(report)
    }

    /// Derives one projection for every record of `doc`. Records that fail
    /// derivation go to the rejects directory.
    pub fn map_document(
        &self,
        doc: &Value,
        source: &Path,
        category: Option<Category>,
        projection: Projection,
        out_dir: &Path,
    ) -> Result<FileReport> {
        let source_name = source
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        let records = record_documents(doc);
        let derived: Vec<_> = self.pool.install(|| {
            records
                .par_iter()
                .map(|r| {
                    derive_document(r, &self.config, category, projection, &source_name)
                        .map_err(|e| json!({ "reason": e.to_string(), "record": r }))
                })
                .collect()
        });

        let mut report = FileReport {
            records: records.len(),
            ..FileReport::default()
        };
        let mut mapped = Vec::new();
        let mut rejects = Vec::new();
        for result in derived {
            match result {
                Ok((_, record)) => mapped.push(record.to_value()),
                Err(reject) => rejects.push(reject),
            }
        }
        report.routed = mapped.len();
        report.rejected = rejects.len();

        let name = output_name(source);
        if !mapped.is_empty() {
            write_atomic(&out_dir.join(&name), &Value::Array(mapped))?;
        }
        if !rejects.is_empty() {
            write_atomic(&self.config.rejects_dir.join(&name), &one_or_many(rejects))?;
        }
        Ok(report)
    }

    /// Full treatment of one claimed file. Malformed input is quarantined;
    /// anything else is archived and moved to the processed directory.
    pub fn process_file(&self, path: &Path) -> Result<FileReport> {
        let doc = match self.load_input(path) {
            Ok(doc) => doc,
            Err(PipelineError::Malformed { reason, .. }) => {
                warn!("Quarantining {:?}: {}", path, reason);
                move_file(path, &self.config.quarantine_dir)?;
                return Ok(FileReport {
                    quarantined: true,
                    ..FileReport::default()
                });
            }
            Err(e) => return Err(e),
        };

        let report = self.route_document(&doc, path)?;
        if let Some(archiver) = &self.archiver {
            if let Err(e) = archiver.archive(path) {
                error!("Archive of {:?} failed: {}", path, e);
            }
        }
        move_file(path, &self.config.processed_dir)?;
        Ok(report)
    }

    /// Poll-and-claim loop; returns once a stop is requested.
    pub fn run(&self, transport: &dyn Transport) -> Result<()> {
        let interval = Duration::from_secs(self.config.poll_interval_secs.max(1));
        info!("Watching for input every {:?}", interval);
        while !self.stopping() {
            let candidates = match transport.poll() {
                Ok(candidates) => candidates,
                Err(e) => {
                    warn!("Polling for input failed, retrying: {}", e);
                    self.idle(interval);
                    continue;
                }
            };
            for candidate in candidates {
                if self.stopping() {
                    break;
                }
                let claimed = match transport.claim(&candidate) {
                    Ok(Some(claimed)) => claimed,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!("Claiming {:?} failed: {}", candidate, e);
                        continue;
                    }
                };
                let start = Instant::now();
                match self.process_file(&claimed) {
                    Ok(r) => info!(
                        "{:?}: {} records, {} routed, {} rejected, {} duplicates in {:.3} s",
                        claimed,
                        r.records,
                        r.routed,
                        r.rejected,
                        r.duplicates,
                        start.elapsed().as_secs_f64()
                    ),
                    Err(e) => error!("Processing {:?} failed: {}", claimed, e),
                }
            }
            self.idle(interval);
        }
        info!("Stop requested, watch loop finished");
        Ok(())
    }

    fn idle(&self, interval: Duration) {
        let step = Duration::from_millis(100);
        let mut waited = Duration::ZERO;
        while waited < interval && !self.stopping() {
            thread::sleep(step);
            waited += step;
        }
        debug!("poll");
    }
}
