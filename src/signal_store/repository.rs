// =============================================================================
// Signal Repository — durable key-value backing for the signal store
// =============================================================================
//
// The store writes every transition through `upsert` before making it
// visible, and rebuilds itself from `load_all` on startup. Implementations
// must be safe to call from several threads.
//
// `JsonDirRepository` keeps one `<id>.json` file per signal. A write touches
// only its own record (tmp file + rename), so writers for different keys
// never wait on each other and a write costs the same with 10 or 10 000
// stored signals.
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::types::Signal;

pub trait SignalRepository: Send + Sync {
    /// Every stored signal, in any order.
    fn load_all(&self) -> Result<Vec<Signal>>;

    /// Insert or replace the record with `signal.id`.
    fn upsert(&self, signal: &Signal) -> Result<()>;
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[cfg(test)]
pub use memory::MemoryRepository;

#[cfg(test)]
mod memory {
    use std::collections::HashMap;

    use parking_lot::RwLock;

    use super::*;

    /// Volatile repository; contents are lost with the process.
    #[derive(Default)]
    pub struct MemoryRepository {
        records: RwLock<HashMap<String, Signal>>,
    }

    impl MemoryRepository {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn len(&self) -> usize {
            self.records.read().len()
        }
    }

    impl SignalRepository for MemoryRepository {
        fn load_all(&self) -> Result<Vec<Signal>> {
            Ok(self.records.read().values().cloned().collect())
        }

        fn upsert(&self, signal: &Signal) -> Result<()> {
            self.records.write().insert(signal.id.clone(), signal.clone());
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// JSON directory
// ---------------------------------------------------------------------------

const RECORD_EXT: &str = "json";

/// Repository persisted as one pretty-printed JSON file per signal inside
/// `dir`.
#[derive(Debug)]
pub struct JsonDirRepository {
    dir: PathBuf,
}

/// Ids become file names; only plain stems are accepted.
fn is_safe_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

impl JsonDirRepository {
    /// Open the directory at `dir`, creating it if missing.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        if dir.is_file() {
            anyhow::bail!(
                "signal store path {} is a file; expected a directory",
                dir.display()
            );
        }
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create signal directory {}", dir.display()))?;

        info!(dir = %dir.display(), "signal repository opened");
        Ok(Self { dir })
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.{RECORD_EXT}"))
    }
}

impl SignalRepository for JsonDirRepository {
    fn load_all(&self) -> Result<Vec<Signal>> {
        let entries = std::fs::read_dir(&self.dir)
            .with_context(|| format!("failed to list {}", self.dir.display()))?;

        let mut signals = Vec::new();
        for entry in entries {
            let path = entry
                .with_context(|| format!("failed to list {}", self.dir.display()))?
                .path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
                if path.extension().and_then(|e| e.to_str()) == Some("tmp") {
                    warn!(path = %path.display(), "ignoring interrupted signal write");
                }
                continue;
            }
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read signal record {}", path.display()))?;
            let signal: Signal = serde_json::from_str(&content)
                .with_context(|| format!("failed to parse signal record {}", path.display()))?;
            signals.push(signal);
        }

        info!(dir = %self.dir.display(), count = signals.len(), "signal records loaded");
        Ok(signals)
    }

    fn upsert(&self, signal: &Signal) -> Result<()> {
        if !is_safe_id(&signal.id) {
            anyhow::bail!("signal id {:?} is not usable as a record name", signal.id);
        }
        let content =
            serde_json::to_string_pretty(signal).context("failed to serialise signal")?;

        let path = self.record_path(&signal.id);
        let tmp_path = self
            .dir
            .join(format!("{}.{}.tmp", signal.id, uuid::Uuid::new_v4().simple()));
        std::fs::write(&tmp_path, content)
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        if let Err(e) = std::fs::rename(&tmp_path, &path) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(e)
                .with_context(|| format!("failed to rename {} into place", tmp_path.display()));
        }

        debug!(id = %signal.id, status = %signal.status, "signal persisted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Direction, SignalStatus};
    use chrono::Utc;
    use std::sync::Arc;

    fn sample(id: &str) -> Signal {
        Signal {
            id: id.to_string(),
            owner_key: "alice".into(),
            instrument_key: "BTCUSDT".into(),
            direction: Direction::Long,
            entry: 100.0,
            take_profit: 110.0,
            stop_loss: 95.0,
            timeframe: "5m".into(),
            rationale: String::new(),
            opened_at: Utc::now(),
            status: SignalStatus::Active,
            closed_at: None,
            close_price: None,
        }
    }

    fn file_names(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn memory_upsert_replaces_by_id() {
        let repo = MemoryRepository::new();
        let mut s = sample("a");
        repo.upsert(&s).unwrap();
        s.status = SignalStatus::ClosedTP;
        repo.upsert(&s).unwrap();
        assert_eq!(repo.len(), 1);
        assert_eq!(repo.load_all().unwrap()[0].status, SignalStatus::ClosedTP);
    }

    #[test]
    fn json_dir_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("signals");

        {
            let repo = JsonDirRepository::open(&root).unwrap();
            repo.upsert(&sample("a")).unwrap();
            repo.upsert(&sample("b")).unwrap();
            let mut closed = sample("a");
            closed.status = SignalStatus::ClosedSL;
            repo.upsert(&closed).unwrap();
        }

        let reopened = JsonDirRepository::open(&root).unwrap();
        let mut loaded = reopened.load_all().unwrap();
        loaded.sort_by(|x, y| x.id.cmp(&y.id));
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].status, SignalStatus::ClosedSL);
        assert_eq!(file_names(&root), vec!["a.json", "b.json"]);
    }

    #[test]
    fn each_write_touches_only_its_own_record() {
        let dir = tempfile::tempdir().unwrap();
        let repo = JsonDirRepository::open(dir.path()).unwrap();
        repo.upsert(&sample("a")).unwrap();
        let before = std::fs::read_to_string(dir.path().join("a.json")).unwrap();

        repo.upsert(&sample("b")).unwrap();
        let after = std::fs::read_to_string(dir.path().join("a.json")).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn concurrent_writers_on_distinct_keys() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Arc::new(JsonDirRepository::open(dir.path()).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let repo = repo.clone();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        repo.upsert(&sample(&format!("t{t}-{i}"))).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let reopened = JsonDirRepository::open(dir.path()).unwrap();
        assert_eq!(reopened.load_all().unwrap().len(), 200);
        assert!(file_names(dir.path()).iter().all(|n| n.ends_with(".json")));
    }

    #[test]
    fn json_dir_missing_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let repo = JsonDirRepository::open(dir.path().join("nope")).unwrap();
        assert!(repo.load_all().unwrap().is_empty());
    }

    #[test]
    fn leftover_tmp_files_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let repo = JsonDirRepository::open(dir.path()).unwrap();
        repo.upsert(&sample("a")).unwrap();
        std::fs::write(dir.path().join("b.0123.tmp"), "{half").unwrap();
        assert_eq!(repo.load_all().unwrap().len(), 1);
    }

    #[test]
    fn corrupt_record_is_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.json"), "{not json").unwrap();
        let repo = JsonDirRepository::open(dir.path()).unwrap();
        assert!(repo.load_all().is_err());
    }

    #[test]
    fn file_in_place_of_directory_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signals.json");
        std::fs::write(&path, "[]").unwrap();
        assert!(JsonDirRepository::open(&path).is_err());
    }

    #[test]
    fn failed_write_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("signals");
        let repo = JsonDirRepository::open(&root).unwrap();
        std::fs::remove_dir_all(&root).unwrap();
        assert!(repo.upsert(&sample("a")).is_err());
    }

    #[test]
    fn unsafe_ids_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let repo = JsonDirRepository::open(dir.path()).unwrap();
        assert!(repo.upsert(&sample("../escape")).is_err());
        assert!(repo.upsert(&sample("")).is_err());
        assert!(file_names(dir.path()).is_empty());
    }
}
