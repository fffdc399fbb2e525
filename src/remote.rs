//! Remote script cache. The transport is abstract ([`RemoteSource`]); this module
//! only reconciles what the source reports against `scripts/remote/cache.json`.

use bevy::prelude::*;
use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::archive::{entry_path, Archive};
use crate::cipher::{self, SessionKey};
use crate::scripting::catalog::ScriptKind;

pub const CACHE_FILE: &str = "cache.json";
const BUNDLE_MAIN: &str = "scripts/remote/script.lua";
const LIB_PREFIX: &str = "scripts/lib/";
/// Bundles may only install below the scripts tree.
const BUNDLE_ROOT: &str = "scripts/";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CacheRecord {
    pub filename: String,
    pub is_proprietary: bool,
    pub id: u32,
    pub last_update: u64,
    pub name: String,
    pub author: String,
    pub description: String,
    pub is_library: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RemoteEntry {
    #[serde(flatten)]
    pub record: CacheRecord,
    #[serde(default)]
    pub erase: bool,
}

pub trait RemoteSource {
    fn session_key(&self) -> Option<SessionKey>;
    /// Changes relative to `cached`. Unchanged entries may be included.
    fn fetch_delta(&self, cached: &[CacheRecord]) -> Result<Vec<RemoteEntry>, String>;
    fn fetch_payload(&self, record: &CacheRecord) -> Result<Vec<u8>, String>;
}

#[derive(Serialize, Default, Clone, Debug, PartialEq, Eq)]
pub struct ReconcileReport {
    pub written: usize,
    pub erased: usize,
    pub unchanged: usize,
    pub failed: Vec<String>,
    pub cache_written: bool,
}

pub fn read_cache(remote_dir: &Path) -> Vec<CacheRecord> {
    let path = remote_dir.join(CACHE_FILE);
    let Ok(contents) = std::fs::read_to_string(&path) else {
        return Vec::new();
    };
    match serde_json::from_str::<Vec<CacheRecord>>(&contents) {
        Ok(records) => records,
        Err(e) => {
            warn!("[Lantern remote] Ignoring corrupt {}: {e}", path.display());
            Vec::new()
        }
    }
}

fn write_cache(remote_dir: &Path, records: &[CacheRecord]) -> Result<(), String> {
    let json = serde_json::to_string_pretty(records).map_err(|e| e.to_string())?;
    std::fs::write(remote_dir.join(CACHE_FILE), json).map_err(|e| e.to_string())
}

fn plain_file_name(name: &str) -> Result<&str, String> {
    if name.is_empty()
        || name.contains("..")
        || name.contains(['/', '\\', ':'])
    {
        return Err(format!("invalid remote file name: {name}"));
    }
    Ok(name)
}

fn installed_path(data_dir: &Path, record: &CacheRecord) -> Result<PathBuf, String> {
    if record.is_library {
        Ok(ScriptKind::Library.dir(data_dir).join(plain_file_name(&record.filename)?))
    } else {
        Ok(ScriptKind::Remote.file_path(data_dir, &record.id.to_string()))
    }
}

fn is_bundle(record: &CacheRecord) -> bool {
    record.filename.to_ascii_lowercase().ends_with(".zip")
}

fn protect(
    record: &CacheRecord,
    key: Option<&SessionKey>,
    data: Vec<u8>,
) -> Result<Vec<u8>, String> {
    if !record.is_proprietary {
        return Ok(data);
    }
    let key = key.ok_or_else(|| format!("no session key to seal proprietary script {}", record.id))?;
    Ok(cipher::seal(key, &data))
}

fn install_single(
    data_dir: &Path,
    record: &CacheRecord,
    key: Option<&SessionKey>,
    payload: Vec<u8>,
) -> Result<usize, String> {
    let target = installed_path(data_dir, record)?;
    let data = if record.is_library {
        payload
    } else {
        protect(record, key, payload)?
    };
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
    }
    std::fs::write(&target, data).map_err(|e| format!("{}: {e}", target.display()))?;
    Ok(1)
}

fn install_bundle(
    data_dir: &Path,
    record: &CacheRecord,
    key: Option<&SessionKey>,
    payload: &[u8],
) -> Result<usize, String> {
    let archive = Archive::from_bytes(payload)?;
    if !archive.exists(BUNDLE_MAIN) {
        return Err(format!("bundle {} has no {BUNDLE_MAIN}", record.id));
    }
    let renamed_main = format!("scripts/remote/{}.lua", record.id);
    let mut written = 0;
    for (name, data) in archive.entries() {
        let dest_name = if name == BUNDLE_MAIN {
            renamed_main.as_str()
        } else {
            name
        };
        if !dest_name.starts_with(BUNDLE_ROOT) {
            warn!(
                "[Lantern remote] Skipping bundle {} entry outside scripts/: {name}",
                record.id
            );
            continue;
        }
        let dest = entry_path(data_dir, dest_name);
        let is_lib = dest_name.starts_with(LIB_PREFIX);
        // pinned dependencies are never clobbered
        if is_lib && dest.exists() {
            continue;
        }
        let data = if !is_lib && dest_name.ends_with(".lua") {
            protect(record, key, data.to_vec())?
        } else {
            data.to_vec()
        };
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }
        std::fs::write(&dest, data).map_err(|e| format!("{}: {e}", dest.display()))?;
        written += 1;
    }
    Ok(written)
}

fn needs_fetch(data_dir: &Path, cached: Option<&CacheRecord>, incoming: &CacheRecord) -> bool {
    let Some(cached) = cached else {
        return true;
    };
    if cached.last_update != incoming.last_update || cached.is_proprietary != incoming.is_proprietary {
        return true;
    }
    if is_bundle(incoming) {
        return false;
    }
    installed_path(data_dir, incoming).map_or(false, |path| !path.exists())
}

/// Applies the source's delta to the on-disk cache. With no remote changes this
/// performs no filesystem writes.
pub fn reconcile(data_dir: &Path, source: &dyn RemoteSource) -> Result<ReconcileReport, String> {
    let remote_dir = ScriptKind::Remote.dir(data_dir);
    std::fs::create_dir_all(&remote_dir).map_err(|e| e.to_string())?;
    let key = source.session_key();
    let mut cache = read_cache(&remote_dir);
    let delta = source.fetch_delta(&cache)?;
    let mut report = ReconcileReport::default();
    let mut dirty = false;

    for entry in delta {
        let position = cache.iter().position(|r| r.id == entry.record.id);
        if entry.erase {
            if let Some(index) = position {
                let removed = cache.remove(index);
                if let Ok(path) = installed_path(data_dir, &removed) {
                    match std::fs::remove_file(&path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => warn!("[Lantern remote] Failed to erase {}: {e}", path.display()),
                    }
                }
                report.erased += 1;
                dirty = true;
            }
            continue;
        }

        let record = entry.record;
        if !needs_fetch(data_dir, position.map(|i| &cache[i]), &record) {
            if let Some(index) = position {
                if cache[index] != record {
                    cache[index] = record;
                    dirty = true;
                }
            }
            report.unchanged += 1;
            continue;
        }

        let installed = source.fetch_payload(&record).and_then(|payload| {
            if is_bundle(&record) {
                install_bundle(data_dir, &record, key.as_ref(), &payload)
            } else {
                install_single(data_dir, &record, key.as_ref(), payload)
            }
        });
        match installed {
            Ok(files) => {
                report.written += files;
                match position {
                    Some(index) => cache[index] = record,
                    None => cache.push(record),
                }
                dirty = true;
            }
            Err(e) => {
                warn!("[Lantern remote] Failed to install script {}: {e}", record.id);
                report.failed.push(format!("{}: {e}", record.id));
            }
        }
    }

    if dirty {
        write_cache(&remote_dir, &cache)?;
        report.cache_written = true;
    }
    Ok(report)
}

#[derive(Deserialize)]
struct FeedFile {
    #[serde(default)]
    session_key: Option<String>,
    #[serde(default)]
    scripts: Vec<FeedScript>,
}

#[derive(Deserialize)]
struct FeedScript {
    #[serde(flatten)]
    record: CacheRecord,
    payload: String,
}

/// Local JSON feed standing in for the remote catalog service. Payload paths
/// are relative to the feed file.
pub struct FeedSource {
    root: PathBuf,
    feed: FeedFile,
    key_override: Option<SessionKey>,
}

impl FeedSource {
    pub fn open(path: &Path, key_override: Option<SessionKey>) -> Result<Self, String> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| format!("{}: {e}", path.display()))?;
        let feed: FeedFile = serde_json::from_str(&contents)
            .map_err(|e| format!("Failed to parse {}: {e}", path.display()))?;
        Ok(Self {
            root: path.parent().map(Path::to_path_buf).unwrap_or_default(),
            feed,
            key_override,
        })
    }
}

impl RemoteSource for FeedSource {
    fn session_key(&self) -> Option<SessionKey> {
        self.key_override.or_else(|| {
            self.feed
                .session_key
                .as_deref()
                .and_then(|hex| SessionKey::from_hex(hex).ok())
        })
    }

    fn fetch_delta(&self, cached: &[CacheRecord]) -> Result<Vec<RemoteEntry>, String> {
        let mut delta: Vec<RemoteEntry> = self
            .feed
            .scripts
            .iter()
            .map(|s| RemoteEntry {
                record: s.record.clone(),
                erase: false,
            })
            .collect();
        for record in cached {
            if !self.feed.scripts.iter().any(|s| s.record.id == record.id) {
                delta.push(RemoteEntry {
                    record: record.clone(),
                    erase: true,
                });
            }
        }
        Ok(delta)
    }

    fn fetch_payload(&self, record: &CacheRecord) -> Result<Vec<u8>, String> {
        let script = self
            .feed
            .scripts
            .iter()
            .find(|s| s.record.id == record.id)
            .ok_or_else(|| format!("feed has no script {}", record.id))?;
        let path = entry_path(&self.root, &script.payload);
        std::fs::read(&path).map_err(|e| format!("{}: {e}", path.display()))
    }
}

pub enum RemoteSyncEvent {
    Finished {
        report: ReconcileReport,
        session_key: Option<SessionKey>,
    },
    Failed(String),
}

/// Runs one reconciliation off the frame thread.
pub fn spawn_sync(
    data_dir: PathBuf,
    feed: PathBuf,
    key_override: Option<SessionKey>,
    tx: Sender<RemoteSyncEvent>,
) {
    std::thread::spawn(move || {
        let event = match FeedSource::open(&feed, key_override) {
            Ok(source) => match reconcile(&data_dir, &source) {
                Ok(report) => {
                    println!(
                        "[Lantern remote] Synced: {} written, {} erased, {} unchanged",
                        report.written, report.erased, report.unchanged
                    );
                    RemoteSyncEvent::Finished {
                        report,
                        session_key: source.session_key(),
                    }
                }
                Err(e) => RemoteSyncEvent::Failed(e),
            },
            Err(e) => RemoteSyncEvent::Failed(e),
        };
        let _ = tx.send(event);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct StubSource {
        key: Option<SessionKey>,
        entries: Vec<RemoteEntry>,
        payloads: std::collections::HashMap<u32, Vec<u8>>,
        fetches: RefCell<u32>,
    }

    impl RemoteSource for StubSource {
        fn session_key(&self) -> Option<SessionKey> {
            self.key
        }

        fn fetch_delta(&self, _cached: &[CacheRecord]) -> Result<Vec<RemoteEntry>, String> {
            Ok(self.entries.clone())
        }

        fn fetch_payload(&self, record: &CacheRecord) -> Result<Vec<u8>, String> {
            *self.fetches.borrow_mut() += 1;
            self.payloads
                .get(&record.id)
                .cloned()
                .ok_or_else(|| "missing".to_string())
        }
    }

    fn record(id: u32, filename: &str, last_update: u64) -> CacheRecord {
        CacheRecord {
            filename: filename.to_string(),
            is_proprietary: false,
            id,
            last_update,
            name: format!("Script {id}"),
            author: "tester".to_string(),
            description: String::new(),
            is_library: false,
        }
    }

    fn source(entries: Vec<RemoteEntry>, payloads: Vec<(u32, Vec<u8>)>) -> StubSource {
        StubSource {
            key: Some(SessionKey::derive("remote-test")),
            entries,
            payloads: payloads.into_iter().collect(),
            fetches: RefCell::new(0),
        }
    }

    #[test]
    fn second_reconcile_with_same_state_writes_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let stub = source(
            vec![RemoteEntry {
                record: record(5, "esp.lua", 100),
                erase: false,
            }],
            vec![(5, b"print('esp')".to_vec())],
        );
        let first = reconcile(dir.path(), &stub).expect("first");
        assert_eq!(first.written, 1);
        assert!(first.cache_written);
        let script = ScriptKind::Remote.file_path(dir.path(), "5");
        assert_eq!(std::fs::read(&script).expect("installed"), b"print('esp')");

        let cache_path = ScriptKind::Remote.dir(dir.path()).join(CACHE_FILE);
        let before = std::fs::metadata(&cache_path).and_then(|m| m.modified()).expect("mtime");
        let second = reconcile(dir.path(), &stub).expect("second");
        assert_eq!(second.written, 0);
        assert_eq!(second.unchanged, 1);
        assert!(!second.cache_written);
        assert_eq!(*stub.fetches.borrow(), 1);
        let after = std::fs::metadata(&cache_path).and_then(|m| m.modified()).expect("mtime");
        assert_eq!(before, after);
    }

    #[test]
    fn erase_removes_file_and_record() {
        let dir = tempfile::tempdir().expect("tempdir");
        let install = source(
            vec![RemoteEntry {
                record: record(8, "x.lua", 1),
                erase: false,
            }],
            vec![(8, b"x".to_vec())],
        );
        reconcile(dir.path(), &install).expect("install");
        let erase = source(
            vec![RemoteEntry {
                record: record(8, "x.lua", 1),
                erase: true,
            }],
            vec![],
        );
        let report = reconcile(dir.path(), &erase).expect("erase");
        assert_eq!(report.erased, 1);
        assert!(!ScriptKind::Remote.file_path(dir.path(), "8").exists());
        assert!(read_cache(&ScriptKind::Remote.dir(dir.path())).is_empty());
    }

    #[test]
    fn proprietary_scripts_are_sealed_at_rest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut rec = record(11, "paid.lua", 3);
        rec.is_proprietary = true;
        let stub = source(
            vec![RemoteEntry { record: rec, erase: false }],
            vec![(11, b"return 42".to_vec())],
        );
        reconcile(dir.path(), &stub).expect("reconcile");
        let stored = std::fs::read(ScriptKind::Remote.file_path(dir.path(), "11")).expect("read");
        assert!(cipher::is_sealed(&stored));
        let key = stub.key.expect("key");
        assert_eq!(cipher::open(&key, &stored).expect("open"), b"return 42");
    }

    #[test]
    fn bundles_rename_main_and_keep_existing_libraries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lib_dir = ScriptKind::Library.dir(dir.path());
        std::fs::create_dir_all(&lib_dir).expect("mkdir");
        std::fs::write(lib_dir.join("shared.lua"), "pinned").expect("write");

        let mut bundle = Archive::new();
        bundle.write(BUNDLE_MAIN, b"main".to_vec()).expect("write");
        bundle.write("scripts/lib/shared.lua", b"upstream".to_vec()).expect("write");
        bundle.write("scripts/lib/fresh.lua", b"fresh".to_vec()).expect("write");
        let stub = source(
            vec![RemoteEntry {
                record: record(21, "bundle.zip", 9),
                erase: false,
            }],
            vec![(21, bundle.to_bytes().expect("zip"))],
        );
        let report = reconcile(dir.path(), &stub).expect("reconcile");
        assert_eq!(report.written, 2);
        assert_eq!(
            std::fs::read(ScriptKind::Remote.file_path(dir.path(), "21")).expect("main"),
            b"main"
        );
        assert_eq!(std::fs::read(lib_dir.join("shared.lua")).expect("lib"), b"pinned");
        assert_eq!(std::fs::read(lib_dir.join("fresh.lua")).expect("lib"), b"fresh");
    }

    #[test]
    fn bundle_entries_outside_scripts_are_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("config.json"), "{}").expect("config");
        let mut bundle = Archive::new();
        bundle.write(BUNDLE_MAIN, b"main".to_vec()).expect("write");
        bundle.write("config.json", b"{\"allow_insecure\":true}".to_vec()).expect("write");
        bundle.write("storage/dropped.txt", b"x".to_vec()).expect("write");
        let stub = source(
            vec![RemoteEntry {
                record: record(40, "bundle.zip", 2),
                erase: false,
            }],
            vec![(40, bundle.to_bytes().expect("zip"))],
        );
        let report = reconcile(dir.path(), &stub).expect("reconcile");
        assert_eq!(report.written, 1);
        assert_eq!(std::fs::read(dir.path().join("config.json")).expect("config"), b"{}");
        assert!(!dir.path().join("storage").exists());
        assert!(ScriptKind::Remote.file_path(dir.path(), "40").is_file());
    }

    #[test]
    fn erase_of_missing_file_still_drops_record() {
        let dir = tempfile::tempdir().expect("tempdir");
        let install = source(
            vec![RemoteEntry {
                record: record(9, "y.lua", 1),
                erase: false,
            }],
            vec![(9, b"y".to_vec())],
        );
        reconcile(dir.path(), &install).expect("install");
        std::fs::remove_file(ScriptKind::Remote.file_path(dir.path(), "9")).expect("manual delete");
        let erase = source(
            vec![RemoteEntry {
                record: record(9, "y.lua", 1),
                erase: true,
            }],
            vec![],
        );
        let report = reconcile(dir.path(), &erase).expect("erase");
        assert_eq!(report.erased, 1);
        assert!(report.cache_written);
        assert!(read_cache(&ScriptKind::Remote.dir(dir.path())).is_empty());
    }

    #[test]
    fn bundle_without_main_script_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut bundle = Archive::new();
        bundle.write("other.lua", b"x".to_vec()).expect("write");
        let stub = source(
            vec![RemoteEntry {
                record: record(30, "bad.zip", 1),
                erase: false,
            }],
            vec![(30, bundle.to_bytes().expect("zip"))],
        );
        let report = reconcile(dir.path(), &stub).expect("reconcile");
        assert_eq!(report.failed.len(), 1);
        assert!(!report.cache_written);
    }

    #[test]
    fn feed_source_erases_scripts_missing_from_feed() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("a.lua"), "print('a')").expect("payload");
        let feed_path = dir.path().join("feed.json");
        let feed = serde_json::json!({
            "scripts": [{
                "filename": "a.lua", "is_proprietary": false, "id": 1, "last_update": 1,
                "name": "A", "author": "", "description": "", "is_library": false,
                "payload": "a.lua"
            }]
        });
        std::fs::write(&feed_path, feed.to_string()).expect("feed");
        let source = FeedSource::open(&feed_path, None).expect("open feed");
        let stale = record(2, "b.lua", 1);
        let delta = source.fetch_delta(&[stale]).expect("delta");
        assert_eq!(delta.len(), 2);
        assert!(delta.iter().any(|e| e.record.id == 2 && e.erase));
        assert_eq!(source.fetch_payload(&delta[0].record).expect("payload"), b"print('a')");
    }
}
