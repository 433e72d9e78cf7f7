//! Resolves declared boot artifacts into verified files under a cache directory and keeps
//! them that way across repeated reconciliation passes.

pub mod builder;
pub mod extract;
pub mod layout;
pub mod orchestrator;
mod plan;
pub mod reconcile;
pub mod registry;
pub mod store;

use std::io;

use miette::Diagnostic;

pub use crate::{
    layout::Layout,
    orchestrator::{EngineOptions, Orchestrator, Outcome},
    reconcile::{Reconciler, ReconcilerOptions},
    registry::{Claim, Registry},
    store::{Artifact, DirStore, MemoryStore, SpecStore},
};

#[derive(Debug, thiserror::Error, Diagnostic)]
pub enum Error {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Manifest(#[from] bootcache_manifest::Error),
    #[error(transparent)]
    #[diagnostic(transparent)]
    Resolver(#[from] bootcache_resolver::Error),
    #[error(transparent)]
    #[diagnostic(transparent)]
    Iso(#[from] bootcache_iso::Error),
    #[error("invalid artifact name `{0}`")]
    #[diagnostic(
        code(engine::invalid_name),
        help("Artifact names become directory names and must be a single path component.")
    )]
    InvalidName(String),
    #[error("`{first}` and `{second}` resolve to the same file `{file}`")]
    #[diagnostic(code(engine::file_collision))]
    FileCollision {
        first: &'static str,
        second: &'static str,
        file: String,
    },
    #[error("resolution timed out")]
    #[diagnostic(code(engine::timed_out))]
    TimedOut,
    #[error("malformed store record: {0}")]
    #[diagnostic(code(engine::store_json))]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    #[diagnostic(code(engine::io_error))]
    Io(#[from] io::Error),
}

/// How an error affects the resource and artifact it occurred for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The spec cannot be satisfied as written.
    Config,
    Transport,
    /// Content did not match its expected digest.
    Corruption,
    Extraction,
    Io,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Manifest(_) | Error::InvalidName(_) | Error::FileCollision { .. } => {
                ErrorKind::Config
            }
            Error::Resolver(err) if err.is_config() => ErrorKind::Config,
            Error::Resolver(err) if err.is_corruption() => ErrorKind::Corruption,
            Error::Resolver(err) if err.is_local_io() => ErrorKind::Io,
            Error::Resolver(_) | Error::TimedOut => ErrorKind::Transport,
            Error::Iso(bootcache_iso::Error::Io(_)) => ErrorKind::Io,
            Error::Iso(_) => ErrorKind::Extraction,
            Error::Json(_) | Error::Io(_) => ErrorKind::Io,
        }
    }
}

#[cfg(test)]
mod tests {
    use bootcache_manifest::{Digest, DigestAlg};
    use url::Url;

    use super::*;

    #[test]
    fn classifies_errors() {
        let url = Url::parse("https://mirror.example/vmlinuz").unwrap();
        let mismatch = bootcache_resolver::Error::MismatchedDigest {
            url: url.clone(),
            expected: Digest::of(DigestAlg::Sha256, b"a"),
            actual: Digest::of(DigestAlg::Sha256, b"b").to_string(),
        };
        let status = bootcache_resolver::Error::Status { url, status: 500 };

        assert_eq!(Error::from(mismatch).kind(), ErrorKind::Corruption);
        assert_eq!(Error::from(status).kind(), ErrorKind::Transport);
        assert_eq!(
            Error::from(bootcache_manifest::Error::invalid_spec("x")).kind(),
            ErrorKind::Config
        );
        assert_eq!(
            Error::from(bootcache_iso::Error::NotFound {
                path: "vmlinuz".to_string()
            })
            .kind(),
            ErrorKind::Extraction
        );
        assert_eq!(Error::TimedOut.kind(), ErrorKind::Transport);
        assert_eq!(Error::from(io::Error::other("disk")).kind(), ErrorKind::Io);
    }
}
