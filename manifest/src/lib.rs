//! Data model shared by the resolution engine: artifact specs, status records and digests.

mod digest;
mod error;
mod spec;
mod status;

pub use digest::{Digest, DigestAlg, Digests, Hasher, MultiHasher};
pub use error::Error;
pub use spec::{ArtifactSpec, BootMode, ChecksumSource, ResourceRef};
pub use status::{ArtifactStatus, Phase, ResourceStatus};
