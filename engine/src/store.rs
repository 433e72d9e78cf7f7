//! Where specs are read from and statuses written to.

use std::{
    collections::BTreeMap,
    future::Future,
    io,
    path::{Path, PathBuf},
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use bootcache_manifest::{ArtifactSpec, ArtifactStatus};
use tracing::warn;

use crate::{Error, layout::validate_name};

const SPEC_SUFFIX: &str = ".json";
const STATUS_SUFFIX: &str = ".status.json";

pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, Error>> + Send + 'a>>;

/// A named spec and the status last written for it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Artifact {
    pub name: String,
    pub spec: ArtifactSpec,
    pub status: Option<ArtifactStatus>,
}

/// The engine's view of the control plane. Specs are read-only; only status is written.
pub trait SpecStore: Send + Sync {
    fn list<'a>(&'a self, kind: &'a str) -> StoreFuture<'a, Vec<Artifact>>;

    fn get<'a>(&'a self, kind: &'a str, name: &'a str) -> StoreFuture<'a, Option<Artifact>>;

    /// Replaces the status of `name`. Writing the same status twice is harmless, and writing
    /// for an artifact that no longer exists is not an error.
    fn update_status<'a>(
        &'a self,
        kind: &'a str,
        name: &'a str,
        status: ArtifactStatus,
    ) -> StoreFuture<'a, ()>;
}

#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    artifacts: BTreeMap<(String, String), Artifact>,
    status_writes: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates or replaces the spec of `name`, keeping any status it already has.
    pub fn put(&self, kind: &str, name: &str, spec: ArtifactSpec) {
        let mut inner = self.lock();
        let key = (kind.to_string(), name.to_string());
        let status = inner.artifacts.remove(&key).and_then(|prev| prev.status);
        inner.artifacts.insert(
            key,
            Artifact {
                name: name.to_string(),
                spec,
                status,
            },
        );
    }

    pub fn remove(&self, kind: &str, name: &str) -> Option<Artifact> {
        self.lock()
            .artifacts
            .remove(&(kind.to_string(), name.to_string()))
    }

    pub fn status(&self, kind: &str, name: &str) -> Option<ArtifactStatus> {
        self.lock()
            .artifacts
            .get(&(kind.to_string(), name.to_string()))
            .and_then(|artifact| artifact.status.clone())
    }

    /// Total number of status writes accepted so far.
    pub fn status_writes(&self) -> usize {
        self.lock().status_writes
    }
}

impl SpecStore for MemoryStore {
    fn list<'a>(&'a self, kind: &'a str) -> StoreFuture<'a, Vec<Artifact>> {
        Box::pin(async move {
            Ok(self
                .lock()
                .artifacts
                .iter()
                .filter(|((k, _), _)| k == kind)
                .map(|(_, artifact)| artifact.clone())
                .collect())
        })
    }

    fn get<'a>(&'a self, kind: &'a str, name: &'a str) -> StoreFuture<'a, Option<Artifact>> {
        Box::pin(async move {
            Ok(self
                .lock()
                .artifacts
                .get(&(kind.to_string(), name.to_string()))
                .cloned())
        })
    }

    fn update_status<'a>(
        &'a self,
        kind: &'a str,
        name: &'a str,
        status: ArtifactStatus,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut inner = self.lock();
            if let Some(artifact) = inner
                .artifacts
                .get_mut(&(kind.to_string(), name.to_string()))
            {
                artifact.status = Some(status);
                inner.status_writes += 1;
            }
            Ok(())
        })
    }
}

/// Specs as JSON files: `<root>/<kind>/<name>.json`, with status next to each spec in
/// `<name>.status.json`.
#[derive(Clone, Debug)]
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn spec_path(&self, kind: &str, name: &str) -> PathBuf {
        self.root.join(kind).join(format!("{name}{SPEC_SUFFIX}"))
    }

    fn status_path(&self, kind: &str, name: &str) -> PathBuf {
        self.root.join(kind).join(format!("{name}{STATUS_SUFFIX}"))
    }

    async fn read_artifact(&self, kind: &str, name: &str) -> Result<Option<Artifact>, Error> {
        validate_name(kind)?;
        validate_name(name)?;
        let bytes = match tokio::fs::read(self.spec_path(kind, name)).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let spec = serde_json::from_slice(&bytes)?;
        Ok(Some(Artifact {
            name: name.to_string(),
            spec,
            status: self.read_status(kind, name).await,
        }))
    }

    /// A missing or unreadable status reads as no status, so the artifact starts over.
    async fn read_status(&self, kind: &str, name: &str) -> Option<ArtifactStatus> {
        let path = self.status_path(kind, name);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(path = %path.display(), %err, "failed to read status");
                return None;
            }
        };
        serde_json::from_slice(&bytes)
            .inspect_err(|err| warn!(path = %path.display(), %err, "ignoring malformed status"))
            .ok()
    }

    async fn names(&self, kind: &str) -> Result<Vec<String>, Error> {
        let mut entries = match tokio::fs::read_dir(self.root.join(kind)).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if file_name.ends_with(STATUS_SUFFIX) {
                continue;
            }
            if let Some(name) = file_name.strip_suffix(SPEC_SUFFIX)
                && validate_name(name).is_ok()
            {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}

impl SpecStore for DirStore {
    fn list<'a>(&'a self, kind: &'a str) -> StoreFuture<'a, Vec<Artifact>> {
        Box::pin(async move {
            validate_name(kind)?;
            let mut artifacts = Vec::new();
            for name in self.names(kind).await? {
                match self.read_artifact(kind, &name).await {
                    Ok(Some(artifact)) => artifacts.push(artifact),
                    Ok(None) => {}
                    Err(err) => warn!(kind, name, %err, "skipping unreadable spec"),
                }
            }
            Ok(artifacts)
        })
    }

    fn get<'a>(&'a self, kind: &'a str, name: &'a str) -> StoreFuture<'a, Option<Artifact>> {
        Box::pin(self.read_artifact(kind, name))
    }

    fn update_status<'a>(
        &'a self,
        kind: &'a str,
        name: &'a str,
        status: ArtifactStatus,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            validate_name(kind)?;
            validate_name(name)?;
            if !tokio::fs::try_exists(self.spec_path(kind, name)).await? {
                return Ok(());
            }
            let path = self.status_path(kind, name);
            let tmp = path.with_extension("json.tmp");
            let mut bytes = serde_json::to_vec_pretty(&status)?;
            bytes.push(b'\n');
            tokio::fs::write(&tmp, &bytes).await?;
            tokio::fs::rename(&tmp, &path).await?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use bootcache_manifest::{Digest, DigestAlg, Phase, ResourceRef};
    use url::Url;

    use super::*;

    fn spec() -> ArtifactSpec {
        let url = |s: &str| ResourceRef::new(Url::parse(s).unwrap());
        ArtifactSpec::builder()
            .kernel(url("https://m.example/vmlinuz"))
            .initrd(url("https://m.example/initrd.img"))
            .build()
    }

    #[tokio::test]
    async fn memory_store_keeps_status_across_spec_updates() {
        let store = MemoryStore::new();
        store.put("bootsource", "fedora", spec());
        store.put("other", "fedora", spec());

        let status = ArtifactStatus::pending(Digest::of(DigestAlg::Sha256, b"spec"));
        store
            .update_status("bootsource", "fedora", status.clone())
            .await
            .unwrap();
        store.put("bootsource", "fedora", spec());

        assert_eq!(store.status("bootsource", "fedora"), Some(status));
        assert_eq!(store.status("other", "fedora"), None);
        assert_eq!(store.list("bootsource").await.unwrap().len(), 1);

        store.remove("bootsource", "fedora");
        store
            .update_status("bootsource", "fedora", ArtifactStatus::default())
            .await
            .unwrap();
        assert_eq!(store.status_writes(), 1);
        assert!(store.get("bootsource", "fedora").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dir_store_round_trips_specs_and_status() {
        let root = tempfile::tempdir().unwrap();
        let kind_dir = root.path().join("bootsource");
        std::fs::create_dir_all(&kind_dir).unwrap();
        std::fs::write(
            kind_dir.join("fedora.json"),
            serde_json::to_vec(&spec()).unwrap(),
        )
        .unwrap();
        std::fs::write(kind_dir.join("broken.json"), b"{ not json").unwrap();
        std::fs::write(kind_dir.join("notes.txt"), b"ignored").unwrap();

        let store = DirStore::new(root.path());
        let listed = store.list("bootsource").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "fedora");
        assert_eq!(listed[0].spec, spec());
        assert_eq!(listed[0].status, None);

        let mut status = ArtifactStatus::pending(spec().digest().unwrap());
        status.phase = Phase::Ready;
        store
            .update_status("bootsource", "fedora", status.clone())
            .await
            .unwrap();
        assert!(kind_dir.join("fedora.status.json").exists());
        assert!(!kind_dir.join("fedora.status.json.tmp").exists());

        let artifact = store.get("bootsource", "fedora").await.unwrap().unwrap();
        assert_eq!(artifact.status, Some(status));

        // Status for a spec that is gone is dropped, not resurrected.
        store
            .update_status("bootsource", "deleted", ArtifactStatus::default())
            .await
            .unwrap();
        assert!(!kind_dir.join("deleted.status.json").exists());
        assert!(store.list("missing-kind").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn dir_store_ignores_malformed_status() {
        let root = tempfile::tempdir().unwrap();
        let kind_dir = root.path().join("bootsource");
        std::fs::create_dir_all(&kind_dir).unwrap();
        std::fs::write(
            kind_dir.join("fedora.json"),
            serde_json::to_vec(&spec()).unwrap(),
        )
        .unwrap();
        std::fs::write(kind_dir.join("fedora.status.json"), b"[]").unwrap();

        let store = DirStore::new(root.path());
        let artifact = store.get("bootsource", "fedora").await.unwrap().unwrap();
        assert_eq!(artifact.status, None);
        assert!(store.get("bootsource", "../fedora").await.is_err());
    }
}
