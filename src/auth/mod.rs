// Identity registry: authenticated session snapshots discovered on disk

use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

pub mod rotation;

static IDENTITY_FILE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^auth-(\d+)\.[A-Za-z0-9]+$").expect("identity filename regex"));

/// One cookie captured from an authenticated session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub path: String,
}

/// On-disk snapshot of an authenticated session: cookies plus origin storage,
/// written by the identity-capture flow and read-only here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityFile {
    #[serde(default)]
    pub cookies: Vec<Cookie>,
    #[serde(default)]
    pub origins: Vec<Value>,
    #[serde(default, rename = "accountName")]
    pub account_name: Option<String>,
}

impl IdentityFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Cookie header value for upstream requests issued under this identity.
    pub fn cookie_header(&self) -> String {
        self.cookies
            .iter()
            .map(|c| format!("{}={}", c.name, c.value))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[derive(Debug, Clone)]
pub struct Identity {
    pub index: usize,
    pub path: PathBuf,
    pub account_name: Option<String>,
}

impl Identity {
    pub fn display_name(&self) -> String {
        self.account_name
            .clone()
            .unwrap_or_else(|| format!("auth-{}", self.index))
    }
}

/// Read-with-reload view of the identity directory. Indices are sparse; the
/// valid set is kept in ascending order. Files that match the naming scheme
/// but fail to parse stay in `initial_indices` for reporting only.
#[derive(Debug, Default)]
pub struct IdentityRegistry {
    dir: PathBuf,
    valid: Vec<Identity>,
    initial_indices: Vec<usize>,
}

impl IdentityRegistry {
    pub fn scan(dir: PathBuf) -> Self {
        let mut registry = Self { dir, valid: Vec::new(), initial_indices: Vec::new() };
        registry.reload();
        registry
    }

    pub fn reload(&mut self) {
        let mut valid = Vec::new();
        let mut initial = Vec::new();

        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("identity dir {:?} unreadable: {}", self.dir, e);
                self.valid = valid;
                self.initial_indices = initial;
                return;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(caps) = IDENTITY_FILE_RE.captures(name) else {
                continue;
            };
            let Ok(index) = caps[1].parse::<usize>() else {
                continue;
            };
            initial.push(index);

            match IdentityFile::load(&path) {
                Ok(file) => valid.push(Identity {
                    index,
                    path: path.clone(),
                    account_name: file.account_name,
                }),
                Err(e) => {
                    tracing::warn!("identity file {:?} excluded: {}", path, e);
                }
            }
        }

        valid.sort_by_key(|identity| identity.index);
        initial.sort_unstable();
        self.valid = valid;
        self.initial_indices = initial;
        tracing::info!(
            "identity registry: {} valid of {} discovered",
            self.valid.len(),
            self.initial_indices.len()
        );
    }

    pub fn is_empty(&self) -> bool {
        self.valid.is_empty()
    }

    pub fn len(&self) -> usize {
        self.valid.len()
    }

    pub fn valid(&self) -> &[Identity] {
        &self.valid
    }

    pub fn initial_indices(&self) -> &[usize] {
        &self.initial_indices
    }

    pub fn get(&self, index: usize) -> Option<&Identity> {
        self.valid.iter().find(|identity| identity.index == index)
    }

    pub fn first_index(&self) -> Option<usize> {
        self.valid.first().map(|identity| identity.index)
    }

    /// Successor of `index` in sorted order, wrapping. If `index` is no
    /// longer valid (the set changed), snaps to the first valid index ≥ it.
    pub fn next_after(&self, index: usize) -> Option<usize> {
        if self.valid.is_empty() {
            return None;
        }
        if self.get(index).is_some() {
            let pos = self.valid.iter().position(|i| i.index == index).unwrap_or(0);
            return Some(self.valid[(pos + 1) % self.valid.len()].index);
        }
        self.valid
            .iter()
            .find(|identity| identity.index >= index)
            .or_else(|| self.valid.first())
            .map(|identity| identity.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_identity(dir: &Path, index: usize, account: &str) {
        let body = serde_json::json!({
            "cookies": [{"name": "SID", "value": format!("tok-{index}"), "domain": ".google.com", "path": "/"}],
            "origins": [],
            "accountName": account
        });
        std::fs::write(dir.join(format!("auth-{index}.json")), body.to_string()).unwrap();
    }

    #[test]
    fn test_scan_sparse_sorted() {
        let dir = tempfile::tempdir().unwrap();
        write_identity(dir.path(), 7, "seven");
        write_identity(dir.path(), 2, "two");
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let registry = IdentityRegistry::scan(dir.path().to_path_buf());
        let indices: Vec<usize> = registry.valid().iter().map(|i| i.index).collect();
        assert_eq!(indices, vec![2, 7]);
        assert_eq!(registry.first_index(), Some(2));
    }

    #[test]
    fn test_invalid_file_excluded_but_reported() {
        let dir = tempfile::tempdir().unwrap();
        write_identity(dir.path(), 0, "ok");
        std::fs::write(dir.path().join("auth-1.json"), "{not json").unwrap();

        let registry = IdentityRegistry::scan(dir.path().to_path_buf());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.initial_indices(), &[0, 1]);
    }

    #[test]
    fn test_next_after_wraps_and_snaps() {
        let dir = tempfile::tempdir().unwrap();
        write_identity(dir.path(), 1, "a");
        write_identity(dir.path(), 4, "b");
        write_identity(dir.path(), 9, "c");

        let registry = IdentityRegistry::scan(dir.path().to_path_buf());
        assert_eq!(registry.next_after(1), Some(4));
        assert_eq!(registry.next_after(9), Some(1));
        // 4 removed from the set: cursor snaps to first valid ≥ 5
        assert_eq!(registry.next_after(5), Some(9));
        assert_eq!(registry.next_after(10), Some(1));
    }

    #[test]
    fn test_cookie_header() {
        let file = IdentityFile {
            cookies: vec![
                Cookie { name: "A".into(), value: "1".into(), domain: String::new(), path: String::new() },
                Cookie { name: "B".into(), value: "2".into(), domain: String::new(), path: String::new() },
            ],
            origins: Vec::new(),
            account_name: None,
        };
        assert_eq!(file.cookie_header(), "A=1; B=2");
    }
}
