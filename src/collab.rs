//! Collaborator seams of the watch loop: file transport, deduplication and
//! archival, each with a local implementation.

use std::collections::{HashSet, VecDeque};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, TryLockError};
use std::thread;
use std::time::Duration;

use chrono::Local;
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};
use crate::tree::{find_all, GenericNode};

const NO_RATING_GROUP: &str = "__NO_RG__";

/// `sessionId|sessionSequenceNumber|ratingGroup`, one key per distinct rating
/// group in first-seen order. Empty when the record cannot be keyed.
pub fn dedup_keys(tree: &GenericNode) -> Vec<String> {
    let (Some(session), Some(sequence)) = (
        tree.text("sessionId"),
        tree.first_text(&["sessionSequenceNumber", "sessionSequenceNo"]),
    ) else {
        return Vec::new();
    };

    let mut groups: Vec<String> = Vec::new();
    for rg in find_all(tree, "mscc").into_iter().filter_map(|m| m.text("ratingGroup")) {
        if !groups.contains(&rg) {
            groups.push(rg);
        }
    }
    if groups.is_empty() {
        groups.push(NO_RATING_GROUP.to_string());
    }
    groups
        .into_iter()
        .map(|rg| format!("{}|{}|{}", session, sequence, rg))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupOutcome {
    Accepted,
    Duplicate,
    /// The record carried no usable key.
    Failed,
}

pub trait DedupStore: Send + Sync {
    /// Records `keys` unless any of them was seen before. All or nothing.
    fn check_and_insert(&self, keys: &[String]) -> Result<DedupOutcome>;
}

#[derive(Default)]
struct SeenKeys {
    keys: HashSet<String>,
    order: VecDeque<String>,
}

/// In-process store: one lock, bounded retry with linear backoff while it is
/// contended. Holds at most `capacity` keys; the oldest go first.
pub struct MemoryDedupStore {
    seen: Mutex<SeenKeys>,
    capacity: usize,
    retry_max: u32,
    retry_wait: Duration,
}

impl MemoryDedupStore {
    pub const DEFAULT_CAPACITY: usize = 1_000_000;

    pub fn new(retry_max: u32, retry_wait: Duration) -> Self {
        Self {
            seen: Mutex::new(SeenKeys::default()),
            capacity: Self::DEFAULT_CAPACITY,
            retry_max,
            retry_wait,
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn len(&self) -> usize {
        self.seen.lock().map(|s| s.keys.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DedupStore for MemoryDedupStore {
    fn check_and_insert(&self, keys: &[String]) -> Result<DedupOutcome> {
        if keys.is_empty() {
            return Ok(DedupOutcome::Failed);
        }
        let mut attempt = 0u32;
        let mut seen = loop {
            match self.seen.try_lock() {
                Ok(guard) => break guard,
                Err(TryLockError::WouldBlock) if attempt < self.retry_max => {
                    attempt += 1;
                    debug!("dedup store busy, retry {}/{}", attempt, self.retry_max);
                    thread::sleep(self.retry_wait * attempt);
                }
                Err(TryLockError::WouldBlock) => {
                    return Err(PipelineError::Dedup(format!(
                        "store still locked after {} retries",
                        self.retry_max
                    )));
                }
                Err(TryLockError::Poisoned(_)) => {
                    return Err(PipelineError::Dedup("store lock poisoned".into()));
                }
            }
        };
        if keys.iter().any(|k| seen.keys.contains(k)) {
            return Ok(DedupOutcome::Duplicate);
        }
        for key in keys {
            if seen.keys.insert(key.clone()) {
                seen.order.push_back(key.clone());
            }
        }
        while seen.order.len() > self.capacity {
            if let Some(oldest) = seen.order.pop_front() {
                seen.keys.remove(&oldest);
            }
        }
        Ok(DedupOutcome::Accepted)
    }
}

pub trait Transport: Send + Sync {
    /// Files waiting to be claimed, oldest name first.
    fn poll(&self) -> Result<Vec<PathBuf>>;

    /// Takes ownership of `path`. `None` when another worker got there first.
    fn claim(&self, path: &Path) -> Result<Option<PathBuf>>;
}

/// Directory inbox; a claim is a rename into the work directory.
pub struct LocalTransport {
    inbox: PathBuf,
    work_dir: PathBuf,
}

impl LocalTransport {
    pub fn new(inbox: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Result<Self> {
        let inbox = inbox.into();
        let work_dir = work_dir.into();
        fs::create_dir_all(&inbox)?;
        fs::create_dir_all(&work_dir)?;
        Ok(Self { inbox, work_dir })
    }
}

fn is_partial(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    name.starts_with('.') || name.ends_with(".tmp") || name.ends_with(".part")
}

impl Transport for LocalTransport {
    fn poll(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.inbox)? {
            let path = entry?.path();
            if path.is_file() && !is_partial(&path) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    fn claim(&self, path: &Path) -> Result<Option<PathBuf>> {
        let Some(name) = path.file_name() else {
            return Ok(None);
        };
        let target = self.work_dir.join(name);
        match fs::rename(path, &target) {
            Ok(()) => Ok(Some(target)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("{:?} already claimed", path);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

pub trait Archiver: Send + Sync {
    fn archive(&self, path: &Path) -> Result<PathBuf>;
}

/// Copies inputs into a directory with a timestamp suffix.
pub struct LocalArchiver {
    dir: PathBuf,
}

impl LocalArchiver {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl Archiver for LocalArchiver {
    fn archive(&self, path: &Path) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("input");
        let stamp = Local::now().format("%Y%m%d%H%M%S");
        let name = match path.extension().and_then(|e| e.to_str()) {
            Some(ext) => format!("{}_{}.{}", stem, stamp, ext),
            None => format!("{}_{}", stem, stamp),
        };
        let target = self.dir.join(name);
        if let Err(e) = fs::copy(path, &target) {
            warn!("Archiving {:?} failed: {}", path, e);
            return Err(e.into());
        }
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::normalize;
    use serde_json::json;
    use std::sync::Arc;

    fn keyed(root: serde_json::Value, groups: &[&str]) -> GenericNode {
        let msccs: Vec<_> = groups
            .iter()
            .map(|rg| json!({"recordProperty": "mscc", "recordElements": {"ratingGroup": rg}}))
            .collect();
        normalize(&json!({
            "recordElements": root,
            "recordExtensions": [{"recordProperty": "listOfMscc", "recordSubExtensions": msccs}]
        }))
    }

    #[test]
    fn keys_per_distinct_rating_group() {
        let tree = keyed(json!({"sessionId": "s", "sessionSequenceNumber": 3}), &["10", "20", "10"]);
        assert_eq!(dedup_keys(&tree), vec!["s|3|10", "s|3|20"]);

        let bare = keyed(json!({"sessionId": "s", "sessionSequenceNumber": "0"}), &[]);
        assert_eq!(dedup_keys(&bare), vec!["s|0|__NO_RG__"]);

        let unkeyed = keyed(json!({"sessionId": "s"}), &["10"]);
        assert!(dedup_keys(&unkeyed).is_empty());
    }

    #[test]
    fn store_flags_duplicates_atomically() {
        let store = MemoryDedupStore::new(3, Duration::from_millis(1));
        let keys = vec!["a|1|10".to_string(), "a|1|20".to_string()];
        assert_eq!(store.check_and_insert(&keys).unwrap(), DedupOutcome::Accepted);
        assert_eq!(store.check_and_insert(&keys).unwrap(), DedupOutcome::Duplicate);

        let overlap = vec!["a|1|20".to_string(), "a|1|30".to_string()];
        assert_eq!(store.check_and_insert(&overlap).unwrap(), DedupOutcome::Duplicate);
        assert_eq!(store.len(), 2);

        assert_eq!(store.check_and_insert(&[]).unwrap(), DedupOutcome::Failed);
    }

    #[test]
    fn full_store_forgets_oldest_keys() {
        let store = MemoryDedupStore::new(3, Duration::from_millis(1)).with_capacity(2);
        for key in ["k1", "k2", "k3"] {
            assert_eq!(store.check_and_insert(&[key.to_string()]).unwrap(), DedupOutcome::Accepted);
        }
        assert_eq!(store.len(), 2);
        assert_eq!(store.check_and_insert(&["k3".to_string()]).unwrap(), DedupOutcome::Duplicate);
        assert_eq!(store.check_and_insert(&["k1".to_string()]).unwrap(), DedupOutcome::Accepted);
    }

    #[test]
    fn concurrent_inserts_accept_each_key_once() {
        let store = Arc::new(MemoryDedupStore::new(1000, Duration::from_micros(50)));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    (0..50)
                        .filter(|i| {
                            store.check_and_insert(&[format!("k|{}|x", i)]).unwrap() == DedupOutcome::Accepted
                        })
                        .count()
                })
            })
            .collect();
        let accepted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(accepted, 50);
    }

    #[test]
    fn local_transport_claims_once() {
        let dir = tempfile::tempdir().unwrap();
        let transport = LocalTransport::new(dir.path().join("in"), dir.path().join("work")).unwrap();
        fs::write(dir.path().join("in/b.json"), "{}").unwrap();
        fs::write(dir.path().join("in/a.json"), "{}").unwrap();
        fs::write(dir.path().join("in/c.json.tmp"), "{}").unwrap();

        let ready = transport.poll().unwrap();
        assert_eq!(ready.len(), 2);
        assert!(ready[0].ends_with("a.json"));

        let claimed = transport.claim(&ready[0]).unwrap().unwrap();
        assert!(claimed.starts_with(dir.path().join("work")));
        assert!(transport.claim(&ready[0]).unwrap().is_none());
    }

    #[test]
    fn archiver_copies_with_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("cdr.bin");
        fs::write(&input, b"\x30\x00").unwrap();
        let archived = LocalArchiver::new(dir.path().join("archive")).archive(&input).unwrap();
        let name = archived.file_name().unwrap().to_str().unwrap().to_string();
        assert!(name.starts_with("cdr_") && name.ends_with(".bin"));
        assert!(input.exists());
        assert_eq!(fs::read(&archived).unwrap(), b"\x30\x00");
    }
}
