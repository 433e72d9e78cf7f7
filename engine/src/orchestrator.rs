//! Drives one artifact from its spec to verified files on disk.
//!
//! Each pass decides from the recorded status what, if anything, needs doing. A run walks the
//! plan's stages strictly in order and writes status after every phase change, so an observer
//! always sees which file is being worked on. The first failing stage ends the run; stages
//! after it stay `Pending` and stages before it keep their results.

use std::{
    collections::BTreeMap,
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use bootcache_manifest::{
    ArtifactSpec, ArtifactStatus, Digest, Digests, Phase, ResourceRef, ResourceStatus,
};
use bootcache_resolver::{Resolver, atomic::hash_file};
use chrono::{DateTime, Utc};
use tracing::{Instrument as _, debug, info, info_span, warn};

use crate::{
    Error, ErrorKind,
    builder::concat,
    extract::extract,
    layout::Layout,
    plan::{COMBINED_INITRD, FIRMWARE, INITRD, ISO, Plan, Source, Stage},
    registry::Registry,
    store::{Artifact, SpecStore},
};

#[derive(Clone, Debug)]
pub struct EngineOptions {
    /// Directory holding one subdirectory per artifact.
    pub base_dir: PathBuf,
    /// Deadline for resolving all stages of one artifact.
    pub resolution_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("/var/lib/bootcache"),
            resolution_timeout: Duration::from_secs(30 * 60),
        }
    }
}

/// What a call to [`Orchestrator::reconcile`] did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// First sighting: status was initialized, nothing resolved yet.
    Initialized,
    /// A resolution ran and ended in this phase.
    Resolved(Phase),
    /// Nothing to do.
    Unchanged,
    /// Another resolution of the same artifact is in flight.
    Busy,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Action {
    Initialize,
    Resolve,
    Audit,
    Skip,
}

fn decide(spec_digest: &Digest, status: Option<&ArtifactStatus>) -> Action {
    let Some(status) = status else {
        return Action::Initialize;
    };
    if status.spec_digest.as_ref() != Some(spec_digest) {
        return Action::Resolve;
    }
    match status.phase {
        Phase::Ready => Action::Audit,
        Phase::Failed => Action::Skip,
        _ => Action::Resolve,
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<dyn SpecStore>,
    resolver: Resolver,
    registry: Registry,
    layout: Layout,
    options: EngineOptions,
}

/// What a finished stage hands to the stages after it.
#[derive(Clone, Copy, Debug)]
struct Produced {
    digest: Digest,
    /// New bytes were written this run, so anything derived from it must be rebuilt.
    changed: bool,
}

struct StatusWriter<'a> {
    store: &'a dyn SpecStore,
    kind: &'a str,
    name: &'a str,
}

impl StatusWriter<'_> {
    /// Progress updates are best-effort; the final write of a pass is not.
    async fn progress(&self, status: &mut ArtifactStatus) {
        if let Err(err) = self.commit(status).await {
            warn!(name = self.name, %err, "failed to record progress");
        }
    }

    async fn commit(&self, status: &mut ArtifactStatus) -> Result<(), Error> {
        status.refresh();
        self.store
            .update_status(self.kind, self.name, status.clone())
            .await
    }
}

impl Orchestrator {
    pub fn new(store: Arc<dyn SpecStore>, resolver: Resolver, options: EngineOptions) -> Self {
        Self {
            store,
            resolver,
            registry: Registry::new(),
            layout: Layout::new(&options.base_dir),
            options,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn store(&self) -> &Arc<dyn SpecStore> {
        &self.store
    }

    /// Runs one reconciliation pass for `artifact`.
    ///
    /// `artifact` only names the work: once the claim is held, spec and status are read again
    /// from the store, since a listing may predate a run that finished in the meantime. An
    /// artifact deleted since is left alone.
    pub async fn reconcile(&self, kind: &str, artifact: Artifact) -> Result<Outcome, Error> {
        let name = artifact.name;
        let Some(_claim) = self.registry.try_claim(&name) else {
            debug!(%name, "resolution already in flight");
            return Ok(Outcome::Busy);
        };
        let Some(current) = self.store.get(kind, &name).await? else {
            debug!(%name, "artifact removed before its pass started");
            return Ok(Outcome::Unchanged);
        };
        let span = info_span!("reconcile", kind, %name);
        self.reconcile_claimed(kind, current).instrument(span).await
    }

    async fn reconcile_claimed(&self, kind: &str, artifact: Artifact) -> Result<Outcome, Error> {
        let Artifact { name, spec, status } = artifact;
        let writer = StatusWriter {
            store: self.store.as_ref(),
            kind,
            name: &name,
        };
        let spec_digest = spec.digest()?;

        match decide(&spec_digest, status.as_ref()) {
            Action::Skip => Ok(Outcome::Unchanged),
            Action::Initialize => {
                let mut status = initial_status(&name, &spec, spec_digest);
                writer.commit(&mut status).await?;
                info!(phase = %status.phase, "initialized status");
                Ok(Outcome::Initialized)
            }
            Action::Audit => {
                let mut status = status.unwrap_or_default();
                if self.audit(&name, &mut status).await? {
                    return Ok(Outcome::Unchanged);
                }
                writer.commit(&mut status).await?;
                self.resolve(&writer, &spec, spec_digest, status).await
            }
            Action::Resolve => {
                let status = status.unwrap_or_default();
                self.resolve(&writer, &spec, spec_digest, status).await
            }
        }
    }

    /// Cheap, network-free check of a `Ready` artifact: every recorded file still exists with
    /// its recorded size and modification time. Drifted resources are marked `Corrupted`.
    async fn audit(&self, name: &str, status: &mut ArtifactStatus) -> Result<bool, Error> {
        let dir = self.layout.artifact_dir(name)?;
        let mut healthy = true;
        for resource in &mut status.resources {
            let path = dir.join(&resource.file);
            let problem = match tokio::fs::metadata(&path).await {
                Ok(meta) if Some(meta.len()) != resource.size => {
                    format!("size changed to {} bytes", meta.len())
                }
                Ok(meta)
                    if resource.modified.is_some()
                        && meta.modified().ok().map(DateTime::<Utc>::from) != resource.modified =>
                {
                    "file was modified".to_string()
                }
                Ok(_) => continue,
                Err(err) if err.kind() == io::ErrorKind::NotFound => "file is missing".to_string(),
                Err(err) => return Err(err.into()),
            };
            warn!(
                resource = %resource.name,
                path = %path.display(),
                %problem,
                "cached file drifted"
            );
            resource.phase = Phase::Corrupted;
            resource.message = Some(problem);
            healthy = false;
        }
        Ok(healthy)
    }

    async fn resolve(
        &self,
        writer: &StatusWriter<'_>,
        spec: &ArtifactSpec,
        spec_digest: Digest,
        previous: ArtifactStatus,
    ) -> Result<Outcome, Error> {
        let plan = match Plan::new(writer.name, spec) {
            Ok(plan) => plan,
            Err(err) => {
                let mut status = config_error_status(spec_digest, &err);
                writer.commit(&mut status).await?;
                warn!(%err, "invalid spec");
                return Ok(Outcome::Resolved(status.phase));
            }
        };

        let mut status = ArtifactStatus {
            spec_digest: Some(spec_digest),
            resources: plan
                .stages
                .iter()
                .map(|stage| carry_over(&previous, stage))
                .collect(),
            boot_params: plan.boot_params(writer.name),
            ..previous
        };
        status.config_error = None;
        writer.progress(&mut status).await;

        let dir = self.layout.artifact_dir(writer.name)?;
        let run = self.run_stages(writer, &plan, &dir, &mut status);
        let timed = tokio::time::timeout(self.options.resolution_timeout, run).await;
        let result = match timed {
            Ok(result) => result,
            Err(_) => {
                for resource in &mut status.resources {
                    if resource.phase.is_in_progress() {
                        resource.phase = Phase::Failed;
                        resource.message = Some(Error::TimedOut.to_string());
                    }
                }
                Err(Error::TimedOut)
            }
        };

        if result.is_ok() {
            match self.layout.prune(writer.name, &plan.files()).await {
                Ok(0) => {}
                Ok(removed) => info!(removed, "pruned unreferenced files"),
                Err(err) => warn!(%err, "failed to prune artifact directory"),
            }
        }

        writer.commit(&mut status).await?;
        match &result {
            Ok(()) => info!(phase = %status.phase, "resolution finished"),
            Err(err) => warn!(phase = %status.phase, %err, "resolution stopped"),
        }
        Ok(Outcome::Resolved(status.phase))
    }

    async fn run_stages(
        &self,
        writer: &StatusWriter<'_>,
        plan: &Plan,
        dir: &Path,
        status: &mut ArtifactStatus,
    ) -> Result<(), Error> {
        let mut produced: BTreeMap<&'static str, Produced> = BTreeMap::new();
        for stage in &plan.stages {
            let result = self
                .run_stage(writer, plan, stage, dir, status, &produced)
                .await;
            let Some(resource) = status.resource_mut(stage.name) else {
                continue;
            };
            match result {
                Ok((output, changed)) => {
                    resource.phase = Phase::Ready;
                    resource.message = None;
                    resource.digest = Some(output.digest);
                    resource.size = Some(output.size);
                    resource.modified = modified_at(&dir.join(&stage.file)).await;
                    resource.inputs = output.inputs;
                    produced.insert(
                        stage.name,
                        Produced {
                            digest: output.digest,
                            changed,
                        },
                    );
                    writer.progress(status).await;
                }
                Err(err) => {
                    resource.phase = match err.kind() {
                        ErrorKind::Corruption => Phase::Corrupted,
                        _ => Phase::Failed,
                    };
                    resource.message = Some(err.to_string());
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Brings one stage's file up to date. Returns its record and whether it was rewritten.
    async fn run_stage(
        &self,
        writer: &StatusWriter<'_>,
        plan: &Plan,
        stage: &Stage,
        dir: &Path,
        status: &mut ArtifactStatus,
        produced: &BTreeMap<&'static str, Produced>,
    ) -> Result<(Output, bool), Error> {
        let dest = dir.join(&stage.file);
        match &stage.source {
            Source::Fetch(resource) => {
                let phase = if tokio::fs::try_exists(&dest).await? {
                    Phase::Verifying
                } else {
                    Phase::Downloading
                };
                let recorded = status.resource(stage.name).and_then(|record| record.digest);
                set_phase(writer, status, stage.name, phase).await;
                self.fetch(resource, recorded.as_ref(), &dest).await
            }
            Source::Extract { path_in_image } => {
                let iso = input(plan, produced, ISO)?;
                let inputs = BTreeMap::from([(ISO.to_string(), iso.1.digest)]);
                let record = status.resource(stage.name).cloned();
                set_phase(writer, status, stage.name, Phase::Extracting).await;
                let current = up_to_date(&dest, record.as_ref(), &inputs, iso.1.changed).await?;
                if let Some(output) = current {
                    debug!(stage = stage.name, "extracted file is current");
                    return Ok((output, false));
                }
                let (digests, size) = extract(&dir.join(iso.0), path_in_image, &dest).await?;
                Ok((Output::new(&digests, size, inputs), true))
            }
            Source::Combine => {
                let initrd = input(plan, produced, INITRD)?;
                let firmware = input(plan, produced, FIRMWARE)?;
                let inputs = BTreeMap::from([
                    (INITRD.to_string(), initrd.1.digest),
                    (FIRMWARE.to_string(), firmware.1.digest),
                ]);
                let changed = initrd.1.changed || firmware.1.changed;
                let record = status.resource(COMBINED_INITRD).cloned();
                set_phase(writer, status, stage.name, Phase::Building).await;
                let current = up_to_date(&dest, record.as_ref(), &inputs, changed).await?;
                if let Some(output) = current {
                    debug!("combined initrd is current");
                    return Ok((output, false));
                }
                let sources = [dir.join(initrd.0), dir.join(firmware.0)];
                let (digests, size) =
                    concat(&[sources[0].as_path(), sources[1].as_path()], &dest).await?;
                Ok((Output::new(&digests, size, inputs), true))
            }
        }
    }

    async fn fetch(
        &self,
        resource: &ResourceRef,
        recorded: Option<&Digest>,
        dest: &Path,
    ) -> Result<(Output, bool), Error> {
        let expected = self.resolver.expected_digests(resource).await?;
        if expected.is_empty() {
            debug!(url = %resource.url, "no checksum available, trusting transport");
        }
        let fetched = self
            .resolver
            .fetch_verified(&resource.url, &expected, recorded, dest)
            .await?;
        let output = Output {
            digest: fetched.digest(),
            size: fetched.size,
            inputs: BTreeMap::new(),
        };
        Ok((output, fetched.transferred))
    }
}

/// Verified result of one stage, as recorded in its [`ResourceStatus`].
struct Output {
    digest: Digest,
    size: u64,
    inputs: BTreeMap<String, Digest>,
}

impl Output {
    fn new(digests: &Digests, size: u64, inputs: BTreeMap<String, Digest>) -> Self {
        Self {
            digest: *digests.primary(),
            size,
            inputs,
        }
    }
}

/// File and result of the stage `name`, which must have finished earlier in this run.
fn input<'p>(
    plan: &'p Plan,
    produced: &BTreeMap<&'static str, Produced>,
    name: &str,
) -> Result<(&'p str, Produced), Error> {
    let stage = plan.stage(name);
    match (stage, produced.get(name)) {
        (Some(stage), Some(produced)) => Ok((&stage.file, *produced)),
        _ => Err(Error::Io(io::Error::other(format!(
            "stage `{name}` has not produced its file"
        )))),
    }
}

/// The existing output, if nothing it was made from changed and it still matches its record.
async fn up_to_date(
    dest: &Path,
    record: Option<&ResourceStatus>,
    inputs: &BTreeMap<String, Digest>,
    inputs_changed: bool,
) -> Result<Option<Output>, Error> {
    let Some(record) = record else {
        return Ok(None);
    };
    let Some(recorded) = record.digest else {
        return Ok(None);
    };
    if inputs_changed || record.inputs != *inputs {
        return Ok(None);
    }
    let Some((digests, size)) = hash_file(dest, [recorded.alg()]).await? else {
        return Ok(None);
    };
    if !digests.satisfies(&[recorded]) {
        warn!(path = %dest.display(), "derived file no longer matches its record");
        return Ok(None);
    }
    Ok(Some(Output {
        digest: recorded,
        size,
        inputs: inputs.clone(),
    }))
}

/// Modification time of `path`, where the filesystem reports one.
async fn modified_at(path: &Path) -> Option<DateTime<Utc>> {
    let meta = tokio::fs::metadata(path).await.ok()?;
    meta.modified().ok().map(DateTime::from)
}

async fn set_phase(
    writer: &StatusWriter<'_>,
    status: &mut ArtifactStatus,
    name: &str,
    phase: Phase,
) {
    if let Some(resource) = status.resource_mut(name) {
        resource.phase = phase;
        resource.message = None;
    }
    writer.progress(status).await;
}

/// The record for `stage` at the start of a run: pending, but keeping what was last verified
/// when it still describes the same file.
fn carry_over(previous: &ArtifactStatus, stage: &Stage) -> ResourceStatus {
    let mut resource = ResourceStatus::pending(stage.name, &stage.file);
    if let Some(prev) = previous.resource(stage.name)
        && prev.file == stage.file
    {
        resource.digest = prev.digest;
        resource.size = prev.size;
        resource.inputs = prev.inputs.clone();
    }
    resource
}

fn initial_status(name: &str, spec: &ArtifactSpec, spec_digest: Digest) -> ArtifactStatus {
    match Plan::new(name, spec) {
        Ok(plan) => ArtifactStatus {
            resources: plan
                .stages
                .iter()
                .map(|stage| ResourceStatus::pending(stage.name, &stage.file))
                .collect(),
            boot_params: plan.boot_params(name),
            ..ArtifactStatus::pending(spec_digest)
        },
        Err(err) => config_error_status(spec_digest, &err),
    }
}

fn config_error_status(spec_digest: Digest, err: &Error) -> ArtifactStatus {
    ArtifactStatus {
        config_error: Some(err.to_string()),
        ..ArtifactStatus::pending(spec_digest)
    }
}
