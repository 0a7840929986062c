//! Last-known attach target persistence.
//!
//! The file holds a single decimal endpoint index. It is read once when the
//! arbiter is built and rewritten on every confirmed attach.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;

use crate::collab::AttachTargetStore;
use crate::types::EndpointId;

#[derive(Debug, Clone)]
pub struct FileAttachTargetStore {
    path: PathBuf,
}

impl FileAttachTargetStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AttachTargetStore for FileAttachTargetStore {
    fn load(&self) -> anyhow::Result<Option<EndpointId>> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", self.path.display()));
            }
        };
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        let idx = trimmed.parse::<usize>().with_context(|| {
            format!("invalid attach target '{}' in {}", trimmed, self.path.display())
        })?;
        Ok(Some(EndpointId(idx)))
    }

    fn store(&mut self, endpoint: EndpointId) -> anyhow::Result<()> {
        // Readers never observe a partially written file.
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, format!("{}\n", endpoint.0))
            .with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("renaming to {}", self.path.display()))?;
        Ok(())
    }
}

/// In-process store. Clones share the same slot.
#[derive(Debug, Clone, Default)]
pub struct MemoryAttachTargetStore {
    slot: Arc<Mutex<Option<EndpointId>>>,
}

impl MemoryAttachTargetStore {
    pub fn new(initial: Option<EndpointId>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(initial)),
        }
    }

    pub fn get(&self) -> Option<EndpointId> {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl AttachTargetStore for MemoryAttachTargetStore {
    fn load(&self) -> anyhow::Result<Option<EndpointId>> {
        Ok(self.get())
    }

    fn store(&mut self, endpoint: EndpointId) -> anyhow::Result<()> {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(endpoint);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "phoneswitch-persist-{}-{}",
            name,
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir.join("attach_target")
    }

    #[test]
    fn missing_file_loads_none() {
        let store = FileAttachTargetStore::new(scratch("missing"));
        let _ = std::fs::remove_file(store.path());
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn store_then_load() {
        let mut store = FileAttachTargetStore::new(scratch("roundtrip"));
        store.store(EndpointId(1)).unwrap();
        assert_eq!(store.load().unwrap(), Some(EndpointId(1)));
        let text = std::fs::read_to_string(store.path()).unwrap();
        assert_eq!(text.trim(), "1");
    }

    #[test]
    fn garbage_is_an_error() {
        let store = FileAttachTargetStore::new(scratch("garbage"));
        std::fs::write(store.path(), "phone-one").unwrap();
        assert!(store.load().is_err());
    }

    #[test]
    fn memory_store_clones_share_slot() {
        let a = MemoryAttachTargetStore::new(None);
        let mut b = a.clone();
        b.store(EndpointId(3)).unwrap();
        assert_eq!(a.get(), Some(EndpointId(3)));
    }
}
