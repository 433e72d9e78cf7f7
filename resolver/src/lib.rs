//! Checksum resolution and verified, atomic downloads of boot artifacts.

pub mod atomic;
pub mod checksum;
mod discovery;
mod fetch;
pub mod file;
pub mod http;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

use std::time::Duration;

use bootcache_manifest::Digest;
pub use checksum::{ChecksumList, Lookup};
pub use fetch::Fetched;
pub use file::FileSource;
pub use http::{HttpOptions, HttpSource};
use miette::Diagnostic;
use url::Url;

use crate::atomic::AtomicFile;

#[derive(Debug, thiserror::Error, Diagnostic)]
pub enum Error {
    #[error("unsupported URL scheme `{scheme}`")]
    #[diagnostic(code(resolver::unsupported_scheme))]
    UnsupportedScheme { scheme: String },
    #[error("`{url}` returned http status {status}")]
    #[diagnostic(code(resolver::http_status))]
    Status { url: Url, status: u16 },
    #[error("response body from `{url}` exceeds max size {max_bytes} bytes (got {size} bytes)")]
    #[diagnostic(code(resolver::response_too_large))]
    ResponseTooLarge {
        url: Url,
        size: u64,
        max_bytes: usize,
    },
    #[error("mismatched digest for `{url}`: expected {expected}, got {actual}")]
    #[diagnostic(code(resolver::mismatched_digest))]
    MismatchedDigest {
        url: Url,
        expected: Digest,
        actual: String,
    },
    #[error("checksum list `{list}` has no unambiguous entry for `{url}`")]
    #[diagnostic(
        code(resolver::no_checksum_entry),
        help("Entries are matched by path relative to the list, then by unique file name.")
    )]
    NoChecksumEntry { list: Url, url: Url },
    #[error("http error: {0}")]
    #[diagnostic(code(resolver::http_error))]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    #[diagnostic(code(resolver::io_error))]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Content did not match its expected digest. Retrying may help.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::MismatchedDigest { .. })
    }

    /// The declared configuration cannot be satisfied as written.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Error::NoChecksumEntry { .. } | Error::UnsupportedScheme { .. }
        )
    }

    /// Local filesystem failure, as opposed to a transfer problem.
    pub fn is_local_io(&self) -> bool {
        matches!(self, Error::Io(_))
    }
}

#[derive(Clone, Debug)]
pub struct ResolverOptions {
    pub http: HttpOptions,
    /// Deadline for fetching one checksum list.
    pub checksum_timeout: Duration,
    pub max_checksum_bytes: usize,
    /// Compare an existing file's size with a `HEAD` before hashing it.
    pub preflight_size: bool,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            http: HttpOptions::default(),
            checksum_timeout: Duration::from_secs(30),
            max_checksum_bytes: 4 * 1024 * 1024,
            preflight_size: true,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Resolver {
    pub file: FileSource,
    pub http: HttpSource,
    options: ResolverOptions,
}

impl Resolver {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn with_options(options: ResolverOptions) -> Self {
        Self {
            file: FileSource::new(),
            http: HttpSource::with_options(options.http.clone()),
            options,
        }
    }

    pub fn options(&self) -> &ResolverOptions {
        &self.options
    }

    async fn read_text(&self, url: &Url) -> Result<String, Error> {
        let max = self.options.max_checksum_bytes;
        match url.scheme() {
            "file" => self.file.read_text(url, max).await,
            "http" | "https" => {
                self.http
                    .get_text(url, self.options.checksum_timeout, max)
                    .await
            }
            scheme => Err(Error::UnsupportedScheme {
                scheme: scheme.to_string(),
            }),
        }
    }

    async fn remote_size(&self, url: &Url) -> Option<u64> {
        match url.scheme() {
            "file" => self.file.content_length(url).await,
            "http" | "https" => self.http.content_length(url).await,
            _ => None,
        }
    }

    async fn download(&self, url: &Url, out: &mut AtomicFile) -> Result<u64, Error> {
        match url.scheme() {
            "file" => self.file.download(url, out).await,
            "http" | "https" => self.http.download(url, out).await,
            scheme => Err(Error::UnsupportedScheme {
                scheme: scheme.to_string(),
            }),
        }
    }
}
