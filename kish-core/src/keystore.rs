//! Signing secrets, looked up by key ID.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;
use tracing::{info, warn};

/// Source of per-key signing secrets.
pub trait KeyStore: Send + Sync {
    /// Secret bound to `key_id`, or `None` if the key is unknown or empty.
    fn secret(&self, key_id: &str) -> Option<Vec<u8>>;
}

impl KeyStore for HashMap<String, String> {
    fn secret(&self, key_id: &str) -> Option<Vec<u8>> {
        self.get(key_id)
            .filter(|secret| !secret.is_empty())
            .map(|secret| secret.as_bytes().to_vec())
    }
}

impl<T: KeyStore + ?Sized> KeyStore for std::sync::Arc<T> {
    fn secret(&self, key_id: &str) -> Option<Vec<u8>> {
        (**self).secret(key_id)
    }
}

struct Loaded {
    modified: Option<SystemTime>,
    keys: Option<HashMap<String, String>>,
}

/// Key store backed by a YAML file of `keyID: secret` pairs.
///
/// The file is re-read on lookup whenever its modification time changes. A
/// file that fails to load makes every lookup miss until it is fixed.
pub struct FileKeyStore {
    path: PathBuf,
    state: Mutex<Loaded>,
}

impl FileKeyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(Loaded {
                modified: None,
                keys: None,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<HashMap<String, String>, String> {
        let content = std::fs::read_to_string(&self.path).map_err(|e| e.to_string())?;
        let keys: Option<HashMap<String, String>> =
            serde_yaml::from_str(&content).map_err(|e| e.to_string())?;
        Ok(keys.unwrap_or_default())
    }

    fn refresh(&self, loaded: &mut Loaded) {
        let modified = match std::fs::metadata(&self.path).and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(e) => {
                if loaded.keys.is_some() || loaded.modified.is_none() {
                    warn!("Failed to stat key store {}: {}", self.path.display(), e);
                }
                loaded.keys = None;
                loaded.modified = None;
                return;
            }
        };

        if loaded.modified == Some(modified) {
            return;
        }
        loaded.modified = Some(modified);

        match self.load() {
            Ok(keys) => {
                info!("Loaded {} keys from {}", keys.len(), self.path.display());
                loaded.keys = Some(keys);
            }
            Err(e) => {
                warn!("Failed to load key store {}: {}", self.path.display(), e);
                loaded.keys = None;
            }
        }
    }
}

impl KeyStore for FileKeyStore {
    fn secret(&self, key_id: &str) -> Option<Vec<u8>> {
        let mut loaded = self.state.lock().unwrap_or_else(|e| e.into_inner());
        self.refresh(&mut loaded);
        loaded.keys.as_ref()?.secret(key_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn test_map_store() {
        let mut keys = HashMap::new();
        keys.insert("k1".to_string(), "secret".to_string());
        keys.insert("empty".to_string(), String::new());

        assert_eq!(keys.secret("k1"), Some(b"secret".to_vec()));
        assert_eq!(keys.secret("empty"), None);
        assert_eq!(keys.secret("missing"), None);
    }

    #[test]
    fn test_file_store_reloads_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.yaml");
        std::fs::write(&path, "k1: first\n").unwrap();

        let store = FileKeyStore::new(&path);
        assert_eq!(store.secret("k1"), Some(b"first".to_vec()));
        assert_eq!(store.secret("k2"), None);

        let mut file = File::options().write(true).truncate(true).open(&path).unwrap();
        file.write_all(b"k1: first\nk2: second\n").unwrap();
        // Make sure the new content is seen as a different version.
        file.set_modified(SystemTime::now() + Duration::from_secs(5))
            .unwrap();
        drop(file);

        assert_eq!(store.secret("k2"), Some(b"second".to_vec()));
    }

    #[test]
    fn test_file_store_missing_or_broken() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.yaml");

        let store = FileKeyStore::new(&path);
        assert_eq!(store.secret("k1"), None);

        std::fs::write(&path, "k1: [not, a, string]\n").unwrap();
        assert_eq!(store.secret("k1"), None);
    }
}
