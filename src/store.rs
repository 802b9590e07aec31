//! Versioned file-backed object store with watch support.
//!
//! One JSON file per object under the store directory, written via temp file
//! and atomic rename. The in-memory map is the read path; the files exist so
//! a restarted daemon sees the same objects. Writes are optimistic: an update
//! whose `resource_version` is not the latest fails with `VersionConflict`.
//!
//! Deletion is finalizer-gated: objects with finalizers only get their
//! `deleted_at` set, and are physically removed the moment an update leaves
//! them with a deletion timestamp and no finalizers.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use snafu::ResultExt;
use snafu::Snafu;
use tokio::sync::broadcast;
use tokio::sync::RwLock;
use tracing::warn;

use crate::machine::Metadata;

/// Objects that can live in a [`HostStore`].
pub trait StoreObject:
    Clone + Send + Sync + Serialize + DeserializeOwned + 'static
{
    fn metadata(&self) -> &Metadata;
    fn metadata_mut(&mut self) -> &mut Metadata;
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StoreError {
    #[snafu(display("object {id} not found"))]
    NotFound { id: String },

    #[snafu(display("object {id} already exists"))]
    AlreadyExists { id: String },

    #[snafu(display("object {id}: resource version {given} is not latest (current {current})"))]
    VersionConflict { id: String, given: u64, current: u64 },

    #[snafu(display("invalid object id {id:?}"))]
    InvalidId { id: String },

    #[snafu(display("store io on {}: {source}", path.display()))]
    Io { path: PathBuf, source: std::io::Error },

    #[snafu(display("failed to encode object {id}: {source}"))]
    Encode { id: String, source: serde_json::Error },
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

/// A change observed through [`HostStore::watch`].
#[derive(Debug, Clone)]
pub enum WatchEvent<T> {
    Created(T),
    Updated(T),
    Deleted(T),
}

impl<T: StoreObject> WatchEvent<T> {
    pub fn object(&self) -> &T {
        match self {
            WatchEvent::Created(o) | WatchEvent::Updated(o) | WatchEvent::Deleted(o) => o,
        }
    }
}

pub struct HostStore<T> {
    dir: PathBuf,
    objects: RwLock<HashMap<String, T>>,
    next_version: AtomicU64,
    watch_tx: broadcast::Sender<WatchEvent<T>>,
}

const WATCH_CAPACITY: usize = 256;

impl<T: StoreObject> HostStore<T> {
    /// Open (or create) a store at `dir`, loading any persisted objects.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await.context(IoSnafu { path: dir.clone() })?;

        let mut objects = HashMap::new();
        let mut max_version = 0u64;

        let mut entries =
            tokio::fs::read_dir(&dir).await.context(IoSnafu { path: dir.clone() })?;
        while let Some(entry) =
            entries.next_entry().await.context(IoSnafu { path: dir.clone() })?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = tokio::fs::read(&path).await.context(IoSnafu { path: path.clone() })?;
            let object: T = match serde_json::from_slice(&raw) {
                Ok(object) => object,
                Err(source) => {
                    // A half-written file cannot happen (rename is atomic), so
                    // a decode failure means foreign data. Skip it.
                    warn!(path = %path.display(), error = %source, "skipping undecodable store file");
                    continue;
                }
            };
            max_version = max_version.max(object.metadata().resource_version);
            objects.insert(object.metadata().id.clone(), object);
        }

        let (watch_tx, _) = broadcast::channel(WATCH_CAPACITY);
        Ok(Self {
            dir,
            objects: RwLock::new(objects),
            next_version: AtomicU64::new(max_version + 1),
            watch_tx,
        })
    }

    pub fn watch(&self) -> broadcast::Receiver<WatchEvent<T>> {
        self.watch_tx.subscribe()
    }

    pub async fn get(&self, id: &str) -> Result<T> {
        self.objects
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })
    }

    pub async fn list(&self) -> Vec<T> {
        self.objects.read().await.values().cloned().collect()
    }

    pub async fn create(&self, mut object: T) -> Result<T> {
        let id = object.metadata().id.clone();
        validate_id(&id)?;

        let mut objects = self.objects.write().await;
        if objects.contains_key(&id) {
            return AlreadyExistsSnafu { id }.fail();
        }

        let meta = object.metadata_mut();
        meta.resource_version = self.next_version.fetch_add(1, Ordering::SeqCst);
        meta.created_at = Utc::now();

        self.persist(&object).await?;
        objects.insert(id, object.clone());
        let _ = self.watch_tx.send(WatchEvent::Created(object.clone()));
        Ok(object)
    }

    /// Update an object, enforcing the optimistic resource-version check.
    ///
    /// Performs finalizer GC: if the updated object has a deletion timestamp
    /// and no remaining finalizers, it is physically removed instead.
    pub async fn update(&self, mut object: T) -> Result<T> {
        let id = object.metadata().id.clone();

        let mut objects = self.objects.write().await;
        let current = objects
            .get(&id)
            .ok_or_else(|| StoreError::NotFound { id: id.clone() })?;

        let given = object.metadata().resource_version;
        let latest = current.metadata().resource_version;
        if given != latest {
            return VersionConflictSnafu { id, given, current: latest }.fail();
        }

        let meta = object.metadata();
        if meta.deleted_at.is_some() && meta.finalizers.is_empty() {
            self.unlink(&id).await?;
            objects.remove(&id);
            let _ = self.watch_tx.send(WatchEvent::Deleted(object.clone()));
            return Ok(object);
        }

        object.metadata_mut().resource_version = self.next_version.fetch_add(1, Ordering::SeqCst);
        self.persist(&object).await?;
        objects.insert(id, object.clone());
        let _ = self.watch_tx.send(WatchEvent::Updated(object.clone()));
        Ok(object)
    }

    /// Delete an object. With finalizers present this only stamps
    /// `deleted_at`; without, the object is removed immediately.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let mut objects = self.objects.write().await;
        let Some(current) = objects.get(id) else {
            return NotFoundSnafu { id }.fail();
        };

        if current.metadata().finalizers.is_empty() {
            if let Some(object) = objects.remove(id) {
                self.unlink(id).await?;
                let _ = self.watch_tx.send(WatchEvent::Deleted(object));
            }
            return Ok(());
        }

        if current.metadata().deleted_at.is_some() {
            return Ok(());
        }

        let mut object = current.clone();
        let meta = object.metadata_mut();
        meta.deleted_at = Some(Utc::now());
        meta.resource_version = self.next_version.fetch_add(1, Ordering::SeqCst);
        self.persist(&object).await?;
        objects.insert(id.to_string(), object.clone());
        let _ = self.watch_tx.send(WatchEvent::Updated(object));
        Ok(())
    }

    fn object_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    async fn persist(&self, object: &T) -> Result<()> {
        let id = &object.metadata().id;
        let raw = serde_json::to_vec_pretty(object).context(EncodeSnafu { id: id.clone() })?;
        let path = self.object_path(id);
        let tmp = self.dir.join(format!(".{id}.tmp"));
        tokio::fs::write(&tmp, raw).await.context(IoSnafu { path: tmp.clone() })?;
        tokio::fs::rename(&tmp, &path).await.context(IoSnafu { path })?;
        Ok(())
    }

    async fn unlink(&self, id: &str) -> Result<()> {
        let path = self.object_path(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }
}

fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() || id.contains('/') || id.contains("..") {
        return InvalidIdSnafu { id }.fail();
    }
    Ok(())
}

/// `Ok(())` when `result` is `Ok` or `NotFound`, the error otherwise.
pub fn ignore_not_found<T>(result: Result<T>) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::Machine;
    use crate::machine::MachineSpec;
    use crate::machine::MACHINE_FINALIZER;

    fn new_machine(id: &str) -> Machine {
        Machine {
            metadata: Metadata::new(id),
            spec: MachineSpec::default(),
            status: Default::default(),
        }
    }

    #[tokio::test]
    async fn create_get_update() {
        let dir = tempfile::tempdir().unwrap();
        let store: HostStore<Machine> = HostStore::open(dir.path()).await.unwrap();

        let created = store.create(new_machine("m-1")).await.unwrap();
        assert!(created.metadata.resource_version > 0);

        let mut fetched = store.get("m-1").await.unwrap();
        fetched.spec.cpu_millis = 2000;
        let updated = store.update(fetched).await.unwrap();
        assert!(updated.metadata.resource_version > created.metadata.resource_version);
        assert_eq!(store.get("m-1").await.unwrap().spec.cpu_millis, 2000);
    }

    #[tokio::test]
    async fn stale_update_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store: HostStore<Machine> = HostStore::open(dir.path()).await.unwrap();

        let stale = store.create(new_machine("m-1")).await.unwrap();
        let mut fresh = stale.clone();
        fresh.spec.cpu_millis = 1000;
        store.update(fresh).await.unwrap();

        let mut conflicting = stale;
        conflicting.spec.cpu_millis = 9000;
        let err = store.update(conflicting).await.unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { .. }));
    }

    #[tokio::test]
    async fn delete_is_gated_on_finalizers() {
        let dir = tempfile::tempdir().unwrap();
        let store: HostStore<Machine> = HostStore::open(dir.path()).await.unwrap();

        let mut machine = new_machine("m-1");
        machine.metadata.add_finalizer(MACHINE_FINALIZER);
        store.create(machine).await.unwrap();

        store.delete("m-1").await.unwrap();
        let pending = store.get("m-1").await.unwrap();
        assert!(pending.metadata.deleted_at.is_some());

        // Stripping the last finalizer lets the update GC the object.
        let mut pending = pending;
        pending.metadata.remove_finalizer(MACHINE_FINALIZER);
        store.update(pending).await.unwrap();
        assert!(store.get("m-1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn delete_without_finalizers_is_immediate() {
        let dir = tempfile::tempdir().unwrap();
        let store: HostStore<Machine> = HostStore::open(dir.path()).await.unwrap();

        store.create(new_machine("m-1")).await.unwrap();
        store.delete("m-1").await.unwrap();
        assert!(store.get("m-1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn objects_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store: HostStore<Machine> = HostStore::open(dir.path()).await.unwrap();
            store.create(new_machine("m-1")).await.unwrap();
        }
        let reopened: HostStore<Machine> = HostStore::open(dir.path()).await.unwrap();
        let survivor = reopened.get("m-1").await.unwrap();

        // New writes must not reuse old versions.
        let next = reopened.create(new_machine("m-2")).await.unwrap();
        assert!(next.metadata.resource_version > survivor.metadata.resource_version);
    }

    #[tokio::test]
    async fn watch_sees_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let store: HostStore<Machine> = HostStore::open(dir.path()).await.unwrap();
        let mut rx = store.watch();

        store.create(new_machine("m-1")).await.unwrap();
        store.delete("m-1").await.unwrap();

        assert!(matches!(rx.recv().await.unwrap(), WatchEvent::Created(_)));
        assert!(matches!(rx.recv().await.unwrap(), WatchEvent::Deleted(_)));
    }
}
