use std::collections::HashMap;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing::debug;

/// Raw file-content persistence, addressed by account-scoped path. One
/// production implementation ([`DiskContentStore`]) and one in-memory double
/// ([`MemContentStore`]).
///
/// `delete` of an already-absent object is success; any other failure is a
/// real error the caller must handle.
pub trait FileContentStore: Send + Sync {
    fn save(&self, filename: &str, filepath: &str, data: &[u8]) -> Result<()>;
    fn load(&self, filename: &str, filepath: &str) -> Result<Box<dyn Read + Send>>;
    fn rename(&self, old_name: &str, new_name: &str, filepath: &str) -> Result<()>;
    fn delete(&self, filename: &str, filepath: &str) -> Result<()>;
}

/// Content-store path for `filepath` inside `username`'s namespace. Every
/// write goes through this, so two accounts never share a path.
pub fn account_path(username: &str, filepath: &str) -> String {
    if filepath.is_empty() {
        username.to_owned()
    } else {
        format!("{username}/{filepath}")
    }
}

/// Content store over a single root directory on local disk.
pub struct DiskContentStore {
    root: PathBuf,
}

impl DiskContentStore {
    /// Create the store, making `root` if it does not exist yet.
    pub fn new(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root)
            .with_context(|| format!("create content root: {}", root.display()))?;
        Ok(Self { root })
    }

    /// Resolve `filepath/filename` under the root. Rejects absolute paths and
    /// parent-directory components so a crafted name cannot escape the root.
    fn resolve(&self, filename: &str, filepath: &str) -> Result<PathBuf> {
        let relative = Path::new(filepath).join(filename);
        for component in relative.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => anyhow::bail!("invalid content path: {}", relative.display()),
            }
        }
        Ok(self.root.join(relative))
    }
}

impl FileContentStore for DiskContentStore {
    fn save(&self, filename: &str, filepath: &str, data: &[u8]) -> Result<()> {
        let target = self.resolve(filename, filepath)?;
        if let Some(dir) = target.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create directory: {}", dir.display()))?;
        }
        debug!(path = %target.display(), bytes = data.len(), "writing content");
        std::fs::write(&target, data)
            .with_context(|| format!("write content: {}", target.display()))
    }

    fn load(&self, filename: &str, filepath: &str) -> Result<Box<dyn Read + Send>> {
        let target = self.resolve(filename, filepath)?;
        let file = std::fs::File::open(&target)
            .with_context(|| format!("open content: {}", target.display()))?;
        Ok(Box::new(file))
    }

    fn rename(&self, old_name: &str, new_name: &str, filepath: &str) -> Result<()> {
        let from = self.resolve(old_name, filepath)?;
        let to = self.resolve(new_name, filepath)?;
        debug!(from = %from.display(), to = %to.display(), "renaming content");
        std::fs::rename(&from, &to)
            .with_context(|| format!("rename content: {}", from.display()))
    }

    fn delete(&self, filename: &str, filepath: &str) -> Result<()> {
        let target = self.resolve(filename, filepath)?;
        match std::fs::remove_file(&target) {
            Ok(()) => Ok(()),
            // Already gone: the reclamation goal is met.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("remove content: {}", target.display())),
        }
    }
}

/// In-memory double keyed by `(filepath, filename)`. The failure switches
/// exercise the error paths the disk store can hit.
#[derive(Default)]
pub struct MemContentStore {
    objects: Mutex<HashMap<(String, String), Vec<u8>>>,
    fail_saves: bool,
    fail_deletes: bool,
}

impl MemContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `save` fails, as a full or read-only backing volume would.
    pub fn with_failing_saves() -> Self {
        Self {
            fail_saves: true,
            ..Self::default()
        }
    }

    /// Every `delete` of an existing object fails.
    pub fn with_failing_deletes() -> Self {
        Self {
            fail_deletes: true,
            ..Self::default()
        }
    }

    pub fn contains(&self, filename: &str, filepath: &str) -> bool {
        self.objects
            .lock()
            .expect("content lock poisoned")
            .contains_key(&(filepath.to_owned(), filename.to_owned()))
    }

    pub fn len(&self) -> usize {
        self.objects.lock().expect("content lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FileContentStore for MemContentStore {
    fn save(&self, filename: &str, filepath: &str, data: &[u8]) -> Result<()> {
        if self.fail_saves {
            anyhow::bail!("content backend unavailable");
        }
        self.objects
            .lock()
            .expect("content lock poisoned")
            .insert((filepath.to_owned(), filename.to_owned()), data.to_vec());
        Ok(())
    }

    fn load(&self, filename: &str, filepath: &str) -> Result<Box<dyn Read + Send>> {
        let objects = self.objects.lock().expect("content lock poisoned");
        let data = objects
            .get(&(filepath.to_owned(), filename.to_owned()))
            .cloned()
            .with_context(|| format!("no content at {filepath}/{filename}"))?;
        Ok(Box::new(std::io::Cursor::new(data)))
    }

    fn rename(&self, old_name: &str, new_name: &str, filepath: &str) -> Result<()> {
        let mut objects = self.objects.lock().expect("content lock poisoned");
        let data = objects
            .remove(&(filepath.to_owned(), old_name.to_owned()))
            .with_context(|| format!("no content at {filepath}/{old_name}"))?;
        objects.insert((filepath.to_owned(), new_name.to_owned()), data);
        Ok(())
    }

    fn delete(&self, filename: &str, filepath: &str) -> Result<()> {
        let mut objects = self.objects.lock().expect("content lock poisoned");
        let slot = (filepath.to_owned(), filename.to_owned());
        if objects.contains_key(&slot) && self.fail_deletes {
            anyhow::bail!("content backend unavailable");
        }
        objects.remove(&slot);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn disk_save_load_round_trip() {
        let dir = tempdir().unwrap();
        let store = DiskContentStore::new(dir.path().join("content")).unwrap();

        store.save("notes.txt", "alice/docs", b"hello").unwrap();
        let mut reader = store.load("notes.txt", "alice/docs").unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"hello");
    }

    #[test]
    fn disk_rename_moves_content() {
        let dir = tempdir().unwrap();
        let store = DiskContentStore::new(dir.path().join("content")).unwrap();
        store.save("old.txt", "alice", b"data").unwrap();

        store.rename("old.txt", "new.txt", "alice").unwrap();
        assert!(store.load("old.txt", "alice").is_err());
        let mut buf = Vec::new();
        store
            .load("new.txt", "alice")
            .unwrap()
            .read_to_end(&mut buf)
            .unwrap();
        assert_eq!(buf, b"data");
    }

    #[test]
    fn disk_delete_of_absent_object_is_success() {
        let dir = tempdir().unwrap();
        let store = DiskContentStore::new(dir.path().join("content")).unwrap();
        store.delete("never-existed.txt", "alice").unwrap();

        store.save("real.txt", "alice", b"x").unwrap();
        store.delete("real.txt", "alice").unwrap();
        assert!(store.load("real.txt", "alice").is_err());
    }

    #[test]
    fn disk_rejects_path_escapes() {
        let dir = tempdir().unwrap();
        let store = DiskContentStore::new(dir.path().join("content")).unwrap();
        assert!(store.save("../escape.txt", "alice", b"x").is_err());
        assert!(store.save("escape.txt", "../alice", b"x").is_err());
        assert!(store.save("escape.txt", "/etc", b"x").is_err());
    }

    #[test]
    fn mem_double_mirrors_disk_semantics() {
        let store = MemContentStore::new();
        store.save("a.txt", "alice", b"1").unwrap();
        store.rename("a.txt", "b.txt", "alice").unwrap();
        assert!(store.contains("b.txt", "alice"));
        assert!(!store.contains("a.txt", "alice"));
        store.delete("missing.txt", "alice").unwrap();
        store.delete("b.txt", "alice").unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn mem_failure_switches() {
        let failing = MemContentStore::with_failing_saves();
        assert!(failing.save("a", "p", b"x").is_err());

        let failing = MemContentStore::with_failing_deletes();
        failing.save("a", "p", b"x").unwrap();
        assert!(failing.delete("a", "p").is_err());
        // Absent objects still delete cleanly.
        failing.delete("ghost", "p").unwrap();
    }
}
