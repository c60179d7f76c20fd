//! Engine-owned output paths.
//!
//! An artifact is a file the engine allocated on behalf of a memoized
//! computation.  Its path embeds a monotonically allocated id plus a
//! sanitized human-readable suffix, so artifacts never collide and never
//! need to be re-derived from their producer.  Refcounts track how many
//! live success nodes name each artifact; the file is deleted when the
//! count drops to zero.

use rustc_hash::FxHashMap;
use std::cell::{Cell, RefCell};
use std::fs;
use std::path::{Path, PathBuf};

struct Entry {
    suffix: String,
    refs: u32,
}

pub struct ArtStore {
    dir: PathBuf,
    tmp_dir: PathBuf,
    next_id: Cell<u64>,
    entries: RefCell<FxHashMap<u64, Entry>>,
    temps: RefCell<Vec<PathBuf>>,
    /// RETRACE_DEBUG keeps temp files around for postmortems.
    keep_temps: bool,
}

/// Only filename-safe bytes survive into the on-disk suffix; everything
/// else becomes '_'.  The id prefix guarantees uniqueness regardless.
fn sanitize(suffix: &str) -> String {
    let base = suffix.rsplit('/').next().unwrap_or(suffix);
    let mut out: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    out.truncate(64);
    out
}

impl ArtStore {
    pub fn new(root: &Path, keep_temps: bool) -> anyhow::Result<ArtStore> {
        let dir = root.join("art");
        let tmp_dir = root.join("tmp");
        fs::create_dir_all(&dir)?;
        fs::create_dir_all(&tmp_dir)?;
        Ok(ArtStore {
            dir,
            tmp_dir,
            next_id: Cell::new(0),
            entries: RefCell::new(FxHashMap::default()),
            temps: RefCell::new(Vec::new()),
            keep_temps,
        })
    }

    /// Artifact paths live under this directory; file dependencies inside
    /// it are skipped since artifacts never change once written.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Restore the table from a loaded snapshot.
    pub fn restore(&self, artifacts: &[(u64, String, u32)], next_id: u64) {
        let mut entries = self.entries.borrow_mut();
        for (id, suffix, refs) in artifacts {
            entries.insert(
                *id,
                Entry {
                    suffix: suffix.clone(),
                    refs: *refs,
                },
            );
        }
        self.next_id.set(next_id);
    }

    /// Apply an incremental allocation record.
    pub fn restore_alloc(&self, id: u64, suffix: &str) {
        self.entries.borrow_mut().insert(
            id,
            Entry {
                suffix: suffix.to_string(),
                refs: 0,
            },
        );
        if id >= self.next_id.get() {
            self.next_id.set(id + 1);
        }
    }

    /// Allocate a fresh artifact path at refcount zero.  The caller is
    /// responsible for persisting the allocation.
    pub fn alloc(&self, suffix: &str) -> (u64, PathBuf) {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        let suffix = sanitize(suffix);
        let path = self.path_for(id, &suffix);
        self.entries.borrow_mut().insert(
            id,
            Entry {
                suffix,
                refs: 0,
            },
        );
        (id, path)
    }

    fn path_for(&self, id: u64, suffix: &str) -> PathBuf {
        self.dir.join(format!("{:x}%{}", id, suffix))
    }

    pub fn incref(&self, id: u64) {
        let mut entries = self.entries.borrow_mut();
        let e = entries.get_mut(&id).expect("incref of unknown artifact");
        e.refs += 1;
    }

    /// Drop one reference; at zero the entry and its file go away.
    pub fn decref(&self, id: u64) {
        let path = {
            let mut entries = self.entries.borrow_mut();
            let e = entries.get_mut(&id).expect("decref of unknown artifact");
            if e.refs == 0 {
                panic!("artifact {:x} refcount underflow", id);
            }
            e.refs -= 1;
            if e.refs > 0 {
                return;
            }
            let path = self.path_for(id, &e.suffix);
            entries.remove(&id);
            path
        };
        remove_path(&path);
    }

    /// A scratch file path, cleaned up at shutdown.
    pub fn mktemp(&self, suffix: &str) -> anyhow::Result<PathBuf> {
        let file = tempfile::Builder::new()
            .suffix(&format!("%{}", sanitize(suffix)))
            .tempfile_in(&self.tmp_dir)?;
        let path = file.into_temp_path().keep()?;
        self.temps.borrow_mut().push(path.clone());
        Ok(path)
    }

    /// A scratch directory, cleaned up at shutdown.
    pub fn mkdtemp(&self) -> anyhow::Result<PathBuf> {
        let dir = tempfile::tempdir_in(&self.tmp_dir)?;
        let path = dir.into_path();
        self.temps.borrow_mut().push(path.clone());
        Ok(path)
    }

    /// Remove scratch files (unless debugging keeps them).
    pub fn cleanup_temps(&self) {
        if self.keep_temps {
            return;
        }
        for path in self.temps.borrow_mut().drain(..) {
            remove_path(&path);
        }
    }

    /// The table as persisted in a snapshot.  Uncommitted (zero-ref)
    /// allocations are dropped; their files are already gone or orphaned.
    pub fn snapshot(&self) -> (Vec<(u64, String, u32)>, u64) {
        let entries = self.entries.borrow();
        let mut list: Vec<_> = entries
            .iter()
            .filter(|(_, e)| e.refs > 0)
            .map(|(id, e)| (*id, e.suffix.clone(), e.refs))
            .collect();
        list.sort_by_key(|(id, _, _)| *id);
        (list, self.next_id.get())
    }
}

fn remove_path(path: &Path) {
    let res = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    if let Err(e) = res {
        if e.kind() != std::io::ErrorKind::NotFound {
            // Deletion is advisory; a locked file just lingers.
            eprintln!("retrace: could not remove {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, ArtStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtStore::new(dir.path(), false).unwrap();
        (dir, store)
    }

    #[test]
    fn suffixes_are_sanitized() {
        assert_eq!(sanitize("lib/out.o"), "out.o");
        assert_eq!(sanitize("we?ird name"), "we_ird_name");
    }

    #[test]
    fn alloc_paths_are_unique() {
        let (_d, store) = store();
        let (a, pa) = store.alloc("out.txt");
        let (b, pb) = store.alloc("out.txt");
        assert_ne!(a, b);
        assert_ne!(pa, pb);
    }

    #[test]
    fn refcount_zero_deletes_file() {
        let (_d, store) = store();
        let (id, path) = store.alloc("out.txt");
        fs::write(&path, b"data").unwrap();
        store.incref(id);
        store.incref(id);
        store.decref(id);
        assert!(path.exists());
        store.decref(id);
        assert!(!path.exists());
        assert!(store.snapshot().0.is_empty());
    }

    #[test]
    #[should_panic(expected = "underflow")]
    fn decref_underflow_panics() {
        let (_d, store) = store();
        let (id, _) = store.alloc("x");
        store.decref(id);
    }

    #[test]
    fn temps_are_cleaned_up() {
        let (_d, store) = store();
        let tmp = store.mktemp("scratch").unwrap();
        let dtmp = store.mkdtemp().unwrap();
        fs::write(&tmp, b"x").unwrap();
        fs::write(dtmp.join("inner"), b"y").unwrap();
        store.cleanup_temps();
        assert!(!tmp.exists());
        assert!(!dtmp.exists());
    }

    #[test]
    fn snapshot_keeps_only_live_entries() {
        let (_d, store) = store();
        let (a, _) = store.alloc("kept");
        let (_b, _) = store.alloc("dropped");
        store.incref(a);
        let (list, next) = store.snapshot();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].0, a);
        assert_eq!(next, 2);
    }
}
