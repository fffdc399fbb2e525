use serde::Serialize;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use crate::hash::fnv1a32;
use crate::remote::{read_cache, CacheRecord};

/// Only this many leading lines are inspected for `--.` metadata tags.
const METADATA_LINES: usize = 4;
const SCRIPT_EXTENSION: &str = "lua";

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ScriptKind {
    Script = 0,
    Library = 1,
    Remote = 2,
}

impl ScriptKind {
    pub fn dir(self, data_dir: &Path) -> PathBuf {
        let scripts = data_dir.join("scripts");
        match self {
            ScriptKind::Script => scripts,
            ScriptKind::Library => scripts.join("lib"),
            ScriptKind::Remote => scripts.join("remote"),
        }
    }

    pub fn file_path(self, data_dir: &Path, name: &str) -> PathBuf {
        self.dir(data_dir).join(format!("{name}.{SCRIPT_EXTENSION}"))
    }
}

pub fn make_id(name: &str, kind: ScriptKind) -> u32 {
    fnv1a32(name) ^ kind as u32
}

#[derive(Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ScriptMetadata {
    pub name: Option<String>,
    pub author: Option<String>,
    pub description: Option<String>,
}

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct RemoteInfo {
    pub is_proprietary: bool,
    pub remote_id: u32,
    pub last_update: u64,
}

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct ScriptDescriptor {
    pub id: u32,
    pub kind: ScriptKind,
    /// File stem; identity is derived from it.
    pub name: String,
    pub path: PathBuf,
    pub metadata: ScriptMetadata,
    pub remote: Option<RemoteInfo>,
}

impl ScriptDescriptor {
    pub fn new(kind: ScriptKind, name: &str, path: PathBuf) -> Self {
        Self {
            id: make_id(name, kind),
            kind,
            name: name.to_string(),
            path,
            metadata: ScriptMetadata::default(),
            remote: None,
        }
    }

    pub fn display_name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or(&self.name)
    }

    pub fn is_proprietary(&self) -> bool {
        self.remote.as_ref().is_some_and(|r| r.is_proprietary)
    }
}

/// Parses `--.name X`, `--.author X` and `--.description X` from the head of a file.
pub fn parse_metadata<R: BufRead>(reader: R) -> ScriptMetadata {
    let mut metadata = ScriptMetadata::default();
    for line in reader.lines().take(METADATA_LINES) {
        let Ok(line) = line else { break };
        let Some(rest) = line.trim_end().strip_prefix("--.") else {
            continue;
        };
        let Some((tag, value)) = rest.split_once(' ') else {
            continue;
        };
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        match tag {
            "name" => metadata.name = Some(value.to_string()),
            "author" => metadata.author = Some(value.to_string()),
            "description" => metadata.description = Some(value.to_string()),
            _ => {}
        }
    }
    metadata
}

fn read_metadata(path: &Path) -> ScriptMetadata {
    match std::fs::File::open(path) {
        Ok(file) => parse_metadata(BufReader::new(file)),
        Err(_) => ScriptMetadata::default(),
    }
}

fn lua_files(dir: &Path) -> Vec<(String, PathBuf)> {
    let Ok(read_dir) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<(String, PathBuf)> = read_dir
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| path.extension().and_then(|e| e.to_str()) == Some(SCRIPT_EXTENSION))
        .filter_map(|path| {
            let stem = path.file_stem()?.to_str()?.to_string();
            Some((stem, path))
        })
        .collect();
    // read_dir order is platform dependent
    files.sort_by(|a, b| a.0.cmp(&b.0));
    files
}

fn remote_descriptor(record: &CacheRecord, path: PathBuf) -> ScriptDescriptor {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(record.filename.as_str())
        .to_string();
    let mut descriptor = ScriptDescriptor::new(ScriptKind::Remote, &stem, path);
    descriptor.metadata = ScriptMetadata {
        name: Some(record.name.clone()).filter(|n| !n.is_empty()),
        author: Some(record.author.clone()).filter(|a| !a.is_empty()),
        description: Some(record.description.clone()).filter(|d| !d.is_empty()),
    };
    descriptor.remote = Some(RemoteInfo {
        is_proprietary: record.is_proprietary,
        remote_id: record.id,
        last_update: record.last_update,
    });
    descriptor
}

/// Builds the full descriptor list: local scripts, libraries, then cached remote scripts.
pub fn scan(data_dir: &Path) -> Vec<ScriptDescriptor> {
    let mut catalog = Vec::new();
    for kind in [ScriptKind::Script, ScriptKind::Library] {
        for (stem, path) in lua_files(&kind.dir(data_dir)) {
            let mut descriptor = ScriptDescriptor::new(kind, &stem, path);
            descriptor.metadata = read_metadata(&descriptor.path);
            catalog.push(descriptor);
        }
    }

    let remote_dir = ScriptKind::Remote.dir(data_dir);
    for record in read_cache(&remote_dir).iter().filter(|r| !r.is_library) {
        let path = ScriptKind::Remote.file_path(data_dir, &record.id.to_string());
        if path.is_file() {
            catalog.push(remote_descriptor(record, path));
        }
    }
    catalog
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_tags_are_read_from_header_only() {
        let source = "--.name Radar\n--.author someone\n-- plain comment\n--.description draws dots\n--.name Late\n";
        let metadata = parse_metadata(source.as_bytes());
        assert_eq!(metadata.name.as_deref(), Some("Radar"));
        assert_eq!(metadata.author.as_deref(), Some("someone"));
        assert_eq!(metadata.description.as_deref(), Some("draws dots"));
    }

    #[test]
    fn malformed_metadata_is_ignored() {
        let metadata = parse_metadata("--.name\n--.unknown tag\nlocal x = 1\n".as_bytes());
        assert_eq!(metadata, ScriptMetadata::default());
    }

    #[test]
    fn identity_depends_on_name_and_kind() {
        assert_eq!(make_id("radar", ScriptKind::Script), fnv1a32("radar"));
        assert_eq!(make_id("radar", ScriptKind::Library), fnv1a32("radar") ^ 1);
        assert_ne!(
            make_id("radar", ScriptKind::Script),
            make_id("radar", ScriptKind::Remote)
        );
    }

    #[test]
    fn scan_is_stable_without_changes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let scripts = ScriptKind::Script.dir(dir.path());
        let lib = ScriptKind::Library.dir(dir.path());
        std::fs::create_dir_all(&lib).expect("mkdir");
        std::fs::write(scripts.join("b.lua"), "--.name Bravo\n").expect("write");
        std::fs::write(scripts.join("a.lua"), "print(1)\n").expect("write");
        std::fs::write(scripts.join("notes.txt"), "ignored").expect("write");
        std::fs::write(lib.join("util.lua"), "return {}\n").expect("write");

        let first = scan(dir.path());
        let second = scan(dir.path());
        assert_eq!(first, second);
        let names: Vec<_> = first.iter().map(|d| (d.kind, d.display_name().to_string())).collect();
        assert_eq!(
            names,
            vec![
                (ScriptKind::Script, "a".to_string()),
                (ScriptKind::Script, "Bravo".to_string()),
                (ScriptKind::Library, "util".to_string()),
            ]
        );
    }
}
