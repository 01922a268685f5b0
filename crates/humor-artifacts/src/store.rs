//! On-disk artifact store with `active` and `backup` slots.
//!
//! Layout:
//!
//! ```text
//! <root>/versions/<id>/   immutable artifact directories
//! <root>/slots.json       { "active": id?, "backup": id?, "updated_at": ts? }
//! ```
//!
//! Readers resolve slots through `slots.json`, which is only ever replaced
//! atomically and only ever names fully written directories. A promote
//! therefore swaps the active artifact with a single rename.
//!
//! Writers (promote, rollback, the open-time sweep) serialise on an advisory
//! lock on `<root>/.lock`, across threads and processes alike.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::artifact::{ArtifactManifest, ArtifactStatus, ModelArtifact, CONFIG_FILE, WEIGHTS_FILE};
use crate::digest::Digest;
use crate::error::{ArtifactError, Result};
use crate::fsutil::{copy_dir, write_atomic};
use crate::lock::StoreLock;

const VERSIONS_DIR: &str = "versions";
const SLOTS_FILE: &str = "slots.json";
const STAGING_PREFIX: &str = ".staging-";

/// Which version directory each slot points at.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Slots {
    pub active: Option<String>,
    pub backup: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Slots {
    /// Slots after promoting `id`. With `backup`, the current active (if
    /// any) replaces the backup; otherwise the backup is left alone.
    fn promoted(&self, id: String, backup: bool) -> Self {
        let backup_slot = match (&self.active, backup) {
            (Some(active), true) => Some(active.clone()),
            _ => self.backup.clone(),
        };
        Self {
            active: Some(id),
            backup: backup_slot,
            updated_at: Some(Utc::now()),
        }
    }

    fn swapped(&self) -> Self {
        Self {
            active: self.backup.clone(),
            backup: self.active.clone(),
            updated_at: Some(Utc::now()),
        }
    }

    fn ids(&self) -> impl Iterator<Item = &String> {
        self.active.iter().chain(self.backup.iter())
    }

    /// Ids referenced by `self` but no longer by `next`.
    fn displaced_by(&self, next: &Slots) -> Vec<String> {
        let kept: HashSet<&String> = next.ids().collect();
        self.ids().filter(|id| !kept.contains(id)).cloned().collect()
    }
}

/// Both slots resolved at once.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreStatus {
    pub active: Option<ModelArtifact>,
    pub backup: Option<ModelArtifact>,
}

/// How a candidate reached the staging directory.
enum Staged {
    Moved,
    Copied,
}

/// Filesystem-backed artifact store. Writers hold the store lock; reads are
/// lock-free.
#[derive(Debug)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Open (creating if needed) the store at `root` and sweep leftovers of
    /// interrupted promotions. The sweep is skipped while another writer
    /// holds the store lock, since its staging directory is still in use.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join(VERSIONS_DIR))?;
        let store = Self { root };
        match StoreLock::try_acquire(&store.root)? {
            Some(_lock) => store.sweep()?,
            None => debug!(root = %store.root.display(), "store busy, skipping sweep"),
        }
        Ok(store)
    }

    fn lock(&self) -> Result<StoreLock> {
        StoreLock::acquire(&self.root)
            .map_err(|e| ArtifactError::Promote(format!("cannot lock store: {e}")))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn versions_dir(&self) -> PathBuf {
        self.root.join(VERSIONS_DIR)
    }

    fn slots_path(&self) -> PathBuf {
        self.root.join(SLOTS_FILE)
    }

    pub fn slots(&self) -> Result<Slots> {
        match fs::read_to_string(self.slots_path()) {
            Ok(raw) => serde_json::from_str(&raw).map_err(|e| {
                ArtifactError::InvalidManifest(format!("{}: {e}", self.slots_path().display()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Slots::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_slots(&self, slots: &Slots) -> Result<()> {
        let json = serde_json::to_vec_pretty(slots)?;
        write_atomic(&self.slots_path(), &json)?;
        Ok(())
    }

    fn resolve(&self, id: &str, status: ArtifactStatus) -> Result<ModelArtifact> {
        let path = self.versions_dir().join(id);
        let manifest = ArtifactManifest::read(&path)?;
        Ok(ModelArtifact {
            id: Some(id.to_string()),
            path,
            status,
            manifest,
        })
    }

    /// The artifact currently in service, if any.
    pub fn active(&self) -> Result<Option<ModelArtifact>> {
        self.slots()?
            .active
            .map(|id| self.resolve(&id, ArtifactStatus::Active))
            .transpose()
    }

    /// Like [`active`](Self::active) but absence is an error.
    pub fn require_active(&self) -> Result<ModelArtifact> {
        self.active()?.ok_or_else(|| ArtifactError::NoActiveArtifact {
            root: self.root.clone(),
        })
    }

    pub fn backup(&self) -> Result<Option<ModelArtifact>> {
        self.slots()?
            .backup
            .map(|id| self.resolve(&id, ArtifactStatus::Backup))
            .transpose()
    }

    pub fn status(&self) -> Result<StoreStatus> {
        let slots = self.slots()?;
        Ok(StoreStatus {
            active: slots
                .active
                .as_deref()
                .map(|id| self.resolve(id, ArtifactStatus::Active))
                .transpose()?,
            backup: slots
                .backup
                .as_deref()
                .map(|id| self.resolve(id, ArtifactStatus::Backup))
                .transpose()?,
        })
    }

    /// Register a bare model directory (weights + config, no manifest) as a
    /// candidate, e.g. one populated from a remote registry.
    pub fn import(&self, path: impl AsRef<Path>) -> Result<ModelArtifact> {
        let path = path.as_ref();
        if let Ok(existing) = ModelArtifact::open_candidate(path) {
            return Ok(existing);
        }
        for file in [CONFIG_FILE, WEIGHTS_FILE] {
            if !path.join(file).is_file() {
                return Err(ArtifactError::missing(path.join(file)));
            }
        }
        let digest = Digest::of_file(path.join(WEIGHTS_FILE))?;
        ArtifactManifest::new(digest).write(path)?;
        info!(path = %path.display(), digest = %digest.short(), "imported model directory as candidate");
        ModelArtifact::open_candidate(path)
    }

    /// Make `candidate` the active artifact.
    ///
    /// With `backup`, the previously active artifact becomes the backup
    /// (replacing any earlier backup); otherwise it is discarded. On failure
    /// the candidate is returned to its original path and the slots are
    /// unchanged.
    pub fn promote(&self, candidate: &ModelArtifact, backup: bool) -> Result<ModelArtifact> {
        if candidate.status != ArtifactStatus::Candidate {
            return Err(ArtifactError::Promote(format!(
                "artifact at {} is {}, only candidates can be promoted",
                candidate.path.display(),
                candidate.status
            )));
        }
        let _lock = self.lock()?;

        let previous = self.slots()?;
        let id = new_artifact_id();
        let staging = self.versions_dir().join(format!("{STAGING_PREFIX}{id}"));
        let target = self.versions_dir().join(&id);

        let staged = stage_candidate(&candidate.path, &staging).map_err(|e| {
            ArtifactError::Promote(format!(
                "staging {} failed: {e}",
                candidate.path.display()
            ))
        })?;

        let swap = || -> Result<Slots> {
            candidate.manifest.verify(&staging)?;
            fs::rename(&staging, &target)?;
            let next = previous.promoted(id.clone(), backup);
            self.write_slots(&next)?;
            Ok(next)
        };

        let next = match swap() {
            Ok(next) => next,
            Err(e) => {
                restore_candidate(&staged, &candidate.path, &staging, &target);
                return Err(ArtifactError::Promote(format!(
                    "swap to {} aborted, active artifact unchanged: {e}",
                    candidate.path.display()
                )));
            }
        };

        if let Staged::Copied = staged {
            if let Err(e) = fs::remove_dir_all(&candidate.path) {
                warn!(path = %candidate.path.display(), error = %e, "failed to remove promoted candidate copy source");
            }
        }
        for displaced in previous.displaced_by(&next) {
            self.remove_version(&displaced);
        }

        info!(
            event = "artifact.promoted",
            id = %id,
            digest = %candidate.weights_digest(),
            backup = ?next.backup,
        );
        self.resolve(&id, ArtifactStatus::Active)
    }

    /// Swap the active and backup slots.
    pub fn rollback(&self) -> Result<ModelArtifact> {
        let _lock = self.lock()?;

        let slots = self.slots()?;
        let Some(backup_id) = slots.backup.clone() else {
            return Err(ArtifactError::Promote(
                "no backup artifact to roll back to".to_string(),
            ));
        };
        // Make sure the backup is intact before it goes live.
        let backup = self.resolve(&backup_id, ArtifactStatus::Backup)?;
        backup
            .manifest
            .verify(&backup.path)
            .map_err(|e| ArtifactError::Promote(format!("backup {backup_id} is corrupt: {e}")))?;

        self.write_slots(&slots.swapped())?;
        info!(event = "artifact.rolled_back", id = %backup_id, previous = ?slots.active);
        self.resolve(&backup_id, ArtifactStatus::Active)
    }

    fn remove_version(&self, id: &str) {
        let path = self.versions_dir().join(id);
        match fs::remove_dir_all(&path) {
            Ok(()) => debug!(id = %id, "removed displaced artifact"),
            Err(e) => warn!(id = %id, error = %e, "failed to remove displaced artifact"),
        }
    }

    /// Remove staging directories and versions no slot references. Callers
    /// hold the store lock.
    fn sweep(&self) -> Result<()> {
        let slots = self.slots()?;
        let live: HashSet<&String> = slots.ids().collect();
        for entry in fs::read_dir(self.versions_dir())? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if live.contains(&name) {
                continue;
            }
            warn!(entry = %name, "sweeping unreferenced artifact directory");
            let path = entry.path();
            let removed = if entry.file_type()?.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            if let Err(e) = removed {
                warn!(entry = %name, error = %e, "sweep failed");
            }
        }
        Ok(())
    }
}

fn new_artifact_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", Utc::now().format("%Y%m%dT%H%M%S"), &suffix[..8])
}

/// Move the candidate into staging, copying when a rename is impossible
/// (e.g. across filesystems). A copied candidate stays in place until the
/// swap has succeeded.
fn stage_candidate(candidate: &Path, staging: &Path) -> std::io::Result<Staged> {
    match fs::rename(candidate, staging) {
        Ok(()) => Ok(Staged::Moved),
        Err(rename_err) => {
            debug!(error = %rename_err, "rename into staging failed, copying instead");
            if let Err(e) = copy_dir(candidate, staging, &[]) {
                let _ = fs::remove_dir_all(staging);
                return Err(e);
            }
            Ok(Staged::Copied)
        }
    }
}

fn restore_candidate(staged: &Staged, candidate: &Path, staging: &Path, target: &Path) {
    let current = if target.exists() { target } else { staging };
    let restored = match staged {
        Staged::Moved => fs::rename(current, candidate),
        Staged::Copied => fs::remove_dir_all(current),
    };
    if let Err(e) = restored {
        warn!(candidate = %candidate.display(), error = %e, "failed to restore candidate after aborted promote");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_candidate(dir: &Path, weights: &[u8]) -> ModelArtifact {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join(WEIGHTS_FILE), weights).unwrap();
        fs::write(dir.join(CONFIG_FILE), b"{}").unwrap();
        ArtifactManifest::new(Digest::compute(weights))
            .write(dir)
            .unwrap();
        ModelArtifact::open_candidate(dir).unwrap()
    }

    #[test]
    fn slots_promote_with_and_without_backup() {
        let slots = Slots {
            active: Some("a".to_string()),
            backup: Some("old".to_string()),
            updated_at: None,
        };
        let with_backup = slots.promoted("b".to_string(), true);
        assert_eq!(with_backup.active.as_deref(), Some("b"));
        assert_eq!(with_backup.backup.as_deref(), Some("a"));
        assert_eq!(slots.displaced_by(&with_backup), vec!["old".to_string()]);

        let without = slots.promoted("b".to_string(), false);
        assert_eq!(without.backup.as_deref(), Some("old"));
        assert_eq!(slots.displaced_by(&without), vec!["a".to_string()]);
    }

    #[test]
    fn backup_request_without_active_keeps_prior_backup() {
        let slots = Slots {
            active: None,
            backup: Some("old".to_string()),
            updated_at: None,
        };
        let next = slots.promoted("new".to_string(), true);
        assert_eq!(next.backup.as_deref(), Some("old"));
    }

    #[test]
    fn empty_store_has_no_active() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(dir.path().join("store")).unwrap();
        assert!(store.active().unwrap().is_none());
        assert!(matches!(
            store.require_active(),
            Err(ArtifactError::NoActiveArtifact { .. })
        ));
    }

    #[test]
    fn promote_moves_candidate_into_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(dir.path().join("store")).unwrap();
        let candidate = write_candidate(&dir.path().join("cand"), b"v1");

        let active = store.promote(&candidate, false).unwrap();
        assert_eq!(active.status, ArtifactStatus::Active);
        assert!(active.path.starts_with(store.root()));
        assert!(!candidate.path.exists());
        assert_eq!(active.weights_digest(), candidate.weights_digest());
    }

    #[test]
    fn promoting_an_active_artifact_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(dir.path().join("store")).unwrap();
        let candidate = write_candidate(&dir.path().join("cand"), b"v1");
        let active = store.promote(&candidate, false).unwrap();

        assert!(matches!(
            store.promote(&active, true),
            Err(ArtifactError::Promote(_))
        ));
    }

    #[test]
    fn rollback_without_backup_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(dir.path().join("store")).unwrap();
        let candidate = write_candidate(&dir.path().join("cand"), b"v1");
        store.promote(&candidate, false).unwrap();

        assert!(matches!(store.rollback(), Err(ArtifactError::Promote(_))));
    }

    #[test]
    fn open_sweeps_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("store");
        {
            let store = ArtifactStore::open(&root).unwrap();
            let candidate = write_candidate(&dir.path().join("cand"), b"v1");
            store.promote(&candidate, false).unwrap();
        }
        let orphan = root.join(VERSIONS_DIR).join(".staging-crashed");
        fs::create_dir_all(&orphan).unwrap();

        let store = ArtifactStore::open(&root).unwrap();
        assert!(!orphan.exists());
        assert!(store.active().unwrap().is_some());
    }

    #[test]
    fn open_leaves_staging_alone_while_a_writer_holds_the_lock() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("store");
        let store = ArtifactStore::open(&root).unwrap();
        let in_flight = root.join(VERSIONS_DIR).join(".staging-in-flight");
        fs::create_dir_all(&in_flight).unwrap();

        let held = store.lock().unwrap();
        ArtifactStore::open(&root).unwrap();
        assert!(in_flight.exists());

        drop(held);
        ArtifactStore::open(&root).unwrap();
        assert!(!in_flight.exists());
    }

    #[test]
    fn import_writes_manifest_for_bare_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(dir.path().join("store")).unwrap();
        let bare = dir.path().join("downloaded");
        fs::create_dir_all(&bare).unwrap();
        fs::write(bare.join(WEIGHTS_FILE), b"weights").unwrap();
        fs::write(bare.join(CONFIG_FILE), b"{}").unwrap();

        let candidate = store.import(&bare).unwrap();
        assert_eq!(candidate.status, ArtifactStatus::Candidate);
        assert_eq!(
            candidate.weights_digest(),
            Digest::compute(b"weights").to_hex()
        );
    }

    #[test]
    fn import_requires_weights() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(dir.path().join("store")).unwrap();
        let bare = dir.path().join("downloaded");
        fs::create_dir_all(&bare).unwrap();
        fs::write(bare.join(CONFIG_FILE), b"{}").unwrap();

        assert!(matches!(
            store.import(&bare),
            Err(ArtifactError::MissingArtifact { .. })
        ));
    }
}
