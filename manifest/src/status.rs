use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Digest;

/// Resolution phase of one resource, and (aggregated) of a whole artifact.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    #[default]
    Pending,
    Downloading,
    Extracting,
    Building,
    Verifying,
    Ready,
    Corrupted,
    Failed,
}

impl Phase {
    pub const ALL: [Phase; 8] = [
        Phase::Pending,
        Phase::Downloading,
        Phase::Extracting,
        Phase::Building,
        Phase::Verifying,
        Phase::Ready,
        Phase::Corrupted,
        Phase::Failed,
    ];

    /// Rank used for worst-phase aggregation; higher is worse.
    pub fn severity(self) -> u8 {
        match self {
            Phase::Ready => 0,
            Phase::Pending => 1,
            Phase::Verifying => 2,
            Phase::Building => 3,
            Phase::Extracting => 4,
            Phase::Downloading => 5,
            Phase::Corrupted => 6,
            Phase::Failed => 7,
        }
    }

    /// The least favourable phase among `phases`, or `None` if there are none.
    pub fn worst(phases: impl IntoIterator<Item = Phase>) -> Option<Phase> {
        phases.into_iter().max_by_key(|phase| phase.severity())
    }

    pub fn is_in_progress(self) -> bool {
        matches!(
            self,
            Phase::Downloading | Phase::Extracting | Phase::Building | Phase::Verifying
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Pending => "Pending",
            Phase::Downloading => "Downloading",
            Phase::Extracting => "Extracting",
            Phase::Building => "Building",
            Phase::Verifying => "Verifying",
            Phase::Ready => "Ready",
            Phase::Corrupted => "Corrupted",
            Phase::Failed => "Failed",
        })
    }
}

/// Status of one concrete file managed for an artifact.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    /// Logical name (`kernel`, `initrd`, `firmware`, `iso`, `combined-initrd`).
    pub name: String,
    /// Path relative to the artifact directory.
    pub file: String,
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<Digest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Modification time of the file when it was last verified.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Digests of the inputs a derived or extracted file was produced from.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, Digest>,
}

impl ResourceStatus {
    pub fn pending(name: impl Into<String>, file: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            file: file.into(),
            phase: Phase::Pending,
            digest: None,
            size: None,
            modified: None,
            message: None,
            inputs: BTreeMap::new(),
        }
    }
}

/// Aggregate status over an [`ArtifactSpec`](crate::ArtifactSpec).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactStatus {
    pub phase: Phase,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_digest: Option<Digest>,
    /// Set when the spec itself is invalid; forces the aggregate to `Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_error: Option<String>,
    /// Per-file records in resolution order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceStatus>,
    /// Render-time inputs for boot serving, paths relative to the cache base directory.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub boot_params: BTreeMap<String, String>,
}

impl ArtifactStatus {
    pub fn pending(spec_digest: Digest) -> Self {
        let mut status = Self {
            spec_digest: Some(spec_digest),
            ..Default::default()
        };
        status.refresh();
        status
    }

    pub fn resource(&self, name: &str) -> Option<&ResourceStatus> {
        self.resources.iter().find(|resource| resource.name == name)
    }

    pub fn resource_mut(&mut self, name: &str) -> Option<&mut ResourceStatus> {
        self.resources
            .iter_mut()
            .find(|resource| resource.name == name)
    }

    /// Worst phase over all resources; a config error always wins.
    pub fn aggregate_phase(&self) -> Phase {
        if self.config_error.is_some() {
            return Phase::Failed;
        }
        Phase::worst(self.resources.iter().map(|resource| resource.phase)).unwrap_or_default()
    }

    /// Recomputes phase and message from the resource records.
    pub fn refresh(&mut self) {
        self.refresh_at(Utc::now());
    }

    pub fn refresh_at(&mut self, now: DateTime<Utc>) {
        let phase = self.aggregate_phase();
        if phase != self.phase || self.last_transition_time.is_none() {
            self.last_transition_time = Some(now);
        }
        self.phase = phase;
        self.message = self.describe();
    }

    fn describe(&self) -> String {
        if let Some(error) = &self.config_error {
            return format!("invalid spec: {error}");
        }
        let Some(resource) = self
            .resources
            .iter()
            .find(|resource| resource.phase == self.phase)
        else {
            return "waiting for resolution".to_string();
        };
        match (self.phase, &resource.message) {
            (Phase::Ready, _) => "all resources ready".to_string(),
            (Phase::Failed | Phase::Corrupted, Some(message)) => {
                format!("{}: {message}", resource.name)
            }
            (phase, _) => format!("{}: {}", resource.name, phase.to_string().to_lowercase()),
        }
    }
}
