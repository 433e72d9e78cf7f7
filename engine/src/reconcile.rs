//! The fixed-interval loop that keeps every declared artifact resolved.

use std::{
    collections::{BTreeMap, BTreeSet},
    future::Future,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use tokio::{
    task::{JoinError, JoinSet},
    time::MissedTickBehavior,
};
use tracing::{debug, info, warn};

use crate::{Error, Orchestrator, Outcome};

type Finished = (String, Result<Outcome, Error>);

#[derive(Clone, Debug)]
pub struct ReconcilerOptions {
    /// Spec kind passed to the store.
    pub kind: String,
    pub interval: Duration,
}

impl Default for ReconcilerOptions {
    fn default() -> Self {
        Self {
            kind: "bootsource".to_string(),
            interval: Duration::from_secs(60),
        }
    }
}

pub struct Reconciler {
    orchestrator: Orchestrator,
    options: ReconcilerOptions,
    /// Names seen in earlier passes, to notice deletions.
    known: Mutex<BTreeSet<String>>,
}

impl Reconciler {
    pub fn new(orchestrator: Orchestrator, options: ReconcilerOptions) -> Self {
        Self {
            orchestrator,
            options,
            known: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// One complete pass over every artifact of the configured kind, waiting for all of them.
    pub async fn reconcile_once(&self) -> Result<BTreeMap<String, Outcome>, Error> {
        let mut tasks = JoinSet::new();
        self.dispatch(&mut tasks).await?;
        let mut outcomes = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            if let Some((name, outcome)) = finished(joined) {
                outcomes.insert(name, outcome);
            }
        }
        Ok(outcomes)
    }

    /// Reconciles a single artifact, e.g. right after its spec changed. An artifact the store
    /// no longer has gets its directory removed.
    pub async fn reconcile(&self, name: &str) -> Result<Outcome, Error> {
        let kind = self.options.kind.as_str();
        match self.orchestrator.store().get(kind, name).await? {
            Some(artifact) => self.orchestrator.reconcile(kind, artifact).await,
            None => {
                self.orchestrator.layout().remove(name).await?;
                self.known_names().remove(name);
                Ok(Outcome::Unchanged)
            }
        }
    }

    /// Runs passes every `interval` until `shutdown` resolves, then waits for in-flight
    /// resolutions to finish. Each in-flight resolution is still bounded by its own deadline.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) {
        let mut interval = tokio::time::interval(self.options.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tasks = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => break,
                _ = interval.tick() => {
                    while let Some(joined) = tasks.try_join_next() {
                        finished(joined);
                    }
                    if let Err(err) = self.dispatch(&mut tasks).await {
                        warn!(kind = %self.options.kind, %err, "reconcile pass failed");
                    }
                }
            }
        }

        info!(in_flight = tasks.len(), "stopping, waiting for in-flight resolutions");
        while let Some(joined) = tasks.join_next().await {
            finished(joined);
        }
    }

    async fn dispatch(&self, tasks: &mut JoinSet<Finished>) -> Result<(), Error> {
        let kind = &self.options.kind;
        let artifacts = self.orchestrator.store().list(kind).await?;
        let listed: BTreeSet<String> = artifacts.iter().map(|a| a.name.clone()).collect();
        self.remove_deleted(&listed).await;

        for artifact in artifacts {
            if self.orchestrator.registry().is_claimed(&artifact.name) {
                debug!(name = %artifact.name, "still resolving from an earlier pass");
                continue;
            }
            let orchestrator = self.orchestrator.clone();
            let kind = kind.clone();
            tasks.spawn(async move {
                let name = artifact.name.clone();
                let result = orchestrator.reconcile(&kind, artifact).await;
                (name, result)
            });
        }
        Ok(())
    }

    async fn remove_deleted(&self, listed: &BTreeSet<String>) {
        let deleted: Vec<String> = self.known_names().difference(listed).cloned().collect();
        let mut removed = Vec::new();
        for name in deleted {
            if self.orchestrator.registry().is_claimed(&name) {
                continue;
            }
            match self.orchestrator.layout().remove(&name).await {
                Ok(()) => removed.push(name),
                Err(err) => warn!(name, %err, "failed to remove deleted artifact"),
            }
        }

        let mut known = self.known_names();
        for name in removed {
            known.remove(&name);
        }
        known.extend(listed.iter().cloned());
    }

    fn known_names(&self) -> std::sync::MutexGuard<'_, BTreeSet<String>> {
        self.known.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn finished(joined: Result<Finished, JoinError>) -> Option<(String, Outcome)> {
    match joined {
        Ok((name, Ok(outcome))) => {
            debug!(name, ?outcome, "reconciled");
            Some((name, outcome))
        }
        Ok((name, Err(err))) => {
            warn!(name, %err, "reconcile failed");
            None
        }
        Err(err) => {
            warn!(%err, "reconcile task failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bootcache_manifest::{ArtifactSpec, Digest, DigestAlg, Phase, ResourceRef};
    use bootcache_resolver::{Resolver, testing::TestServer};

    use super::*;
    use crate::{EngineOptions, MemoryStore};

    const KIND: &str = "bootsource";

    fn spec(server: &TestServer) -> ArtifactSpec {
        let resource = |path: &str, body: &[u8]| {
            let mut resource = ResourceRef::new(server.url(path));
            resource.checksum = Some(Digest::of(DigestAlg::Sha256, body));
            resource
        };
        ArtifactSpec::builder()
            .kernel(resource("/vmlinuz", b"kernel"))
            .initrd(resource("/initrd.img", b"initrd"))
            .build()
    }

    fn reconciler(store: &MemoryStore, base: &std::path::Path, interval: Duration) -> Reconciler {
        let orchestrator = Orchestrator::new(
            Arc::new(store.clone()),
            Resolver::new(),
            EngineOptions {
                base_dir: base.to_path_buf(),
                ..Default::default()
            },
        );
        Reconciler::new(
            orchestrator,
            ReconcilerOptions {
                kind: KIND.to_string(),
                interval,
            },
        )
    }

    #[tokio::test]
    async fn deleted_specs_lose_their_directory() {
        let server = TestServer::start();
        server.serve("/vmlinuz", b"kernel".to_vec());
        server.serve("/initrd.img", b"initrd".to_vec());
        let base = tempfile::tempdir().unwrap();
        let store = MemoryStore::new();
        store.put(KIND, "fedora", spec(&server));
        let reconciler = reconciler(&store, base.path(), Duration::from_secs(60));

        reconciler.reconcile_once().await.unwrap();
        reconciler.reconcile_once().await.unwrap();
        assert!(base.path().join("fedora/vmlinuz").exists());

        store.remove(KIND, "fedora");
        let outcomes = reconciler.reconcile_once().await.unwrap();
        assert!(outcomes.is_empty());
        assert!(!base.path().join("fedora").exists());

        // Removing again is a no-op.
        assert_eq!(
            reconciler.reconcile("fedora").await.unwrap(),
            Outcome::Unchanged
        );
    }

    #[tokio::test]
    async fn run_resolves_until_shutdown() {
        let server = TestServer::start();
        server.serve("/vmlinuz", b"kernel".to_vec());
        server.serve("/initrd.img", b"initrd".to_vec());
        let base = tempfile::tempdir().unwrap();
        let store = MemoryStore::new();
        store.put(KIND, "fedora", spec(&server));
        let reconciler = reconciler(&store, base.path(), Duration::from_millis(20));

        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
        let watcher = async {
            for _ in 0..250 {
                if store.status(KIND, "fedora").map(|s| s.phase) == Some(Phase::Ready) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            let _ = stop.send(());
        };
        let shutdown = async {
            let _ = stopped.await;
        };
        tokio::join!(reconciler.run(shutdown), watcher);

        assert_eq!(
            store.status(KIND, "fedora").map(|s| s.phase),
            Some(Phase::Ready)
        );
        assert!(reconciler.orchestrator().registry().is_empty());
    }
}
