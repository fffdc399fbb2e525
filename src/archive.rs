//! In-memory zip archive used for remote bundles and the `zip` script namespace.

use std::collections::BTreeMap;
use std::io::{Cursor, Read, Write};
use std::path::{Component, Path, PathBuf};

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

#[derive(Default, Clone, Debug)]
pub struct Archive {
    entries: BTreeMap<String, Vec<u8>>,
}

/// Entry names are always relative, `/`-separated and free of `..`.
pub fn normalize_entry_name(name: &str) -> Option<String> {
    let unified = name.replace('\\', "/");
    if unified.starts_with('/') || unified.contains(':') {
        return None;
    }
    let mut parts = Vec::new();
    for part in unified.split('/') {
        match part {
            "" | "." => continue,
            ".." => return None,
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

impl Archive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, String> {
        let mut zip = ZipArchive::new(Cursor::new(bytes)).map_err(|e| format!("invalid archive: {e}"))?;
        let mut entries = BTreeMap::new();
        for index in 0..zip.len() {
            let mut file = zip.by_index(index).map_err(|e| e.to_string())?;
            if file.is_dir() {
                continue;
            }
            let Some(name) = file
                .enclosed_name()
                .and_then(|path| normalize_entry_name(&path.to_string_lossy()))
            else {
                return Err(format!("archive entry escapes its root: {}", file.name()));
            };
            let mut data = Vec::with_capacity(file.size() as usize);
            file.read_to_end(&mut data).map_err(|e| e.to_string())?;
            entries.insert(name, data);
        }
        Ok(Self { entries })
    }

    pub fn open(path: &Path) -> Result<Self, String> {
        let bytes = std::fs::read(path).map_err(|e| format!("{}: {e}", path.display()))?;
        Self::from_bytes(&bytes)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, String> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, data) in &self.entries {
            let options =
                SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
            writer
                .start_file(name.as_str(), options)
                .map_err(|e| e.to_string())?;
            writer.write_all(data).map_err(|e| e.to_string())?;
        }
        let cursor = writer.finish().map_err(|e| e.to_string())?;
        Ok(cursor.into_inner())
    }

    pub fn save(&self, path: &Path) -> Result<(), String> {
        let bytes = self.to_bytes()?;
        std::fs::write(path, bytes).map_err(|e| format!("{}: {e}", path.display()))
    }

    pub fn files(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn exists(&self, name: &str) -> bool {
        normalize_entry_name(name).is_some_and(|n| self.entries.contains_key(&n))
    }

    pub fn read(&self, name: &str) -> Option<&[u8]> {
        let name = normalize_entry_name(name)?;
        self.entries.get(&name).map(Vec::as_slice)
    }

    pub fn write(&mut self, name: &str, data: Vec<u8>) -> Result<(), String> {
        let name = normalize_entry_name(name).ok_or_else(|| format!("invalid entry name: {name}"))?;
        self.entries.insert(name, data);
        Ok(())
    }

    /// Writes one entry to `dest`. The caller has already sandboxed `dest`.
    pub fn extract(&self, name: &str, dest: &Path) -> Result<(), String> {
        let data = self
            .read(name)
            .ok_or_else(|| format!("entry not found: {name}"))?;
        write_file(dest, data)
    }

    /// Expands every entry under `root`, keeping each entry's relative path.
    pub fn extract_all(&self, root: &Path) -> Result<usize, String> {
        for (name, data) in &self.entries {
            write_file(&entry_path(root, name), data)?;
        }
        Ok(self.entries.len())
    }
}

/// Joins a normalized entry name onto `root` one component at a time.
pub fn entry_path(root: &Path, name: &str) -> PathBuf {
    let mut path = root.to_path_buf();
    for component in Path::new(name).components() {
        if let Component::Normal(part) = component {
            path.push(part);
        }
    }
    path
}

fn write_file(dest: &Path, data: &[u8]) -> Result<(), String> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
    }
    std::fs::write(dest, data).map_err(|e| format!("{}: {e}", dest.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn survives_zip_encoding() {
        let mut archive = Archive::new();
        archive
            .write("scripts/remote/script.lua", b"print('hi')".to_vec())
            .expect("write");
        archive.write("readme.txt", b"bundle".to_vec()).expect("write");
        let bytes = archive.to_bytes().expect("encode");

        let decoded = Archive::from_bytes(&bytes).expect("decode");
        assert_eq!(
            decoded.files().collect::<Vec<_>>(),
            vec!["readme.txt", "scripts/remote/script.lua"]
        );
        assert_eq!(decoded.read("scripts\\remote\\script.lua"), Some(&b"print('hi')"[..]));
    }

    #[test]
    fn entry_names_cannot_escape() {
        assert_eq!(normalize_entry_name("a/./b"), Some("a/b".to_string()));
        assert_eq!(normalize_entry_name("../evil"), None);
        assert_eq!(normalize_entry_name("/abs"), None);
        assert_eq!(normalize_entry_name("C:\\x"), None);
        let mut archive = Archive::new();
        assert!(archive.write("a/../../b", Vec::new()).is_err());
    }

    #[test]
    fn extract_all_writes_under_root() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut archive = Archive::new();
        archive.write("nested/file.txt", b"data".to_vec()).expect("write");
        assert_eq!(archive.extract_all(dir.path()).expect("extract"), 1);
        let written = std::fs::read(dir.path().join("nested").join("file.txt")).expect("read back");
        assert_eq!(written, b"data");
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(Archive::from_bytes(b"definitely not a zip").is_err());
    }
}
