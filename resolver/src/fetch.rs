use std::{io, path::Path};

use bootcache_manifest::{Digest, Digests};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    Error, Resolver,
    atomic::{AtomicFile, hash_file},
};

/// Outcome of [`Resolver::fetch_verified`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fetched {
    pub digests: Digests,
    pub size: u64,
    /// Whether bytes were transferred, as opposed to reusing the file already on disk.
    pub transferred: bool,
}

impl Fetched {
    /// Digest recorded in status: the strongest algorithm that was computed.
    pub fn digest(&self) -> Digest {
        *self.digests.primary()
    }
}

impl Resolver {
    /// Makes `dest` hold the content of `url`, verified against every digest in `expected`.
    ///
    /// An existing file that already matches is kept without any transfer. With nothing
    /// expected, an existing file must match `recorded`, the digest noted when it was last
    /// verified; without that either it is kept as is. Otherwise the content is streamed to
    /// `<dest>.tmp`, checked, and renamed into place; a mismatch removes the temp file and
    /// reports [`Error::MismatchedDigest`].
    pub async fn fetch_verified(
        &self,
        url: &Url,
        expected: &[Digest],
        recorded: Option<&Digest>,
        dest: &Path,
    ) -> Result<Fetched, Error> {
        if let Some(existing) = self.reuse_existing(url, expected, recorded, dest).await? {
            return Ok(existing);
        }
        self.download_verified(url, expected, dest).await
    }

    /// Whether a file already on disk at `dest` can stand in for `url`.
    pub async fn reuse_existing(
        &self,
        url: &Url,
        expected: &[Digest],
        recorded: Option<&Digest>,
        dest: &Path,
    ) -> Result<Option<Fetched>, Error> {
        let wanted = match recorded {
            Some(recorded) if expected.is_empty() => std::slice::from_ref(recorded),
            _ => expected,
        };

        let local_size = match tokio::fs::metadata(dest).await {
            Ok(meta) if meta.is_file() => meta.len(),
            Ok(_) => return Ok(None),
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        if self.options.preflight_size
            && let Some(remote_size) = self.remote_size(url).await
            && remote_size != local_size
        {
            debug!(
                path = %dest.display(),
                local_size,
                remote_size,
                "size differs from remote, skipping hash"
            );
            return Ok(None);
        }

        let algs = wanted.iter().map(Digest::alg);
        let Some((digests, size)) = hash_file(dest, algs).await? else {
            return Ok(None);
        };
        if !digests.satisfies(wanted) {
            warn!(
                path = %dest.display(),
                %url,
                "existing file does not match expected digest"
            );
            return Ok(None);
        }

        debug!(path = %dest.display(), "cache hit");
        Ok(Some(Fetched {
            digests,
            size,
            transferred: false,
        }))
    }

    async fn download_verified(
        &self,
        url: &Url,
        expected: &[Digest],
        dest: &Path,
    ) -> Result<Fetched, Error> {
        let mut out = AtomicFile::create(dest, expected.iter().map(Digest::alg)).await?;
        self.download(url, &mut out).await?;
        let staged = out.finish().await?;

        if let Some((want, have)) = staged.digests().first_mismatch(expected) {
            staged.discard().await;
            return Err(Error::MismatchedDigest {
                url: url.clone(),
                expected: want,
                actual: have.map_or_else(|| "nothing".to_string(), |digest| digest.to_string()),
            });
        }

        let (digests, size) = staged.commit().await?;
        info!(%url, path = %dest.display(), size, "downloaded");
        Ok(Fetched {
            digests,
            size,
            transferred: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use bootcache_manifest::{Digest, DigestAlg};

    use crate::{Error, Resolver, ResolverOptions, atomic::tmp_path, testing::TestServer};

    fn sha256(data: &[u8]) -> Digest {
        Digest::of(DigestAlg::Sha256, data)
    }

    #[tokio::test]
    async fn downloads_and_verifies() {
        let server = TestServer::start();
        server.serve("/vmlinuz", b"kernel".to_vec());
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("vmlinuz");

        let fetched = Resolver::new()
            .fetch_verified(&server.url("/vmlinuz"), &[sha256(b"kernel")], None, &dest)
            .await
            .unwrap();

        assert!(fetched.transferred);
        assert_eq!(fetched.digest(), sha256(b"kernel"));
        assert_eq!(fetched.size, 6);
        assert_eq!(std::fs::read(&dest).unwrap(), b"kernel");
    }

    #[tokio::test]
    async fn matching_file_is_a_cache_hit() {
        let server = TestServer::start();
        server.serve("/vmlinuz", b"kernel".to_vec());
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("vmlinuz");
        std::fs::write(&dest, b"kernel").unwrap();

        let fetched = Resolver::new()
            .fetch_verified(&server.url("/vmlinuz"), &[sha256(b"kernel")], None, &dest)
            .await
            .unwrap();

        assert!(!fetched.transferred);
        assert_eq!(server.count("GET", "/vmlinuz"), 0);
    }

    #[tokio::test]
    async fn existing_file_without_digest_is_kept() {
        let server = TestServer::start();
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("firmware.cpio");
        std::fs::write(&dest, b"fw").unwrap();

        let resolver = Resolver::with_options(ResolverOptions {
            preflight_size: false,
            ..Default::default()
        });
        let fetched = resolver
            .fetch_verified(&server.url("/firmware.cpio"), &[], None, &dest)
            .await
            .unwrap();

        assert!(!fetched.transferred);
        assert_eq!(fetched.digest(), sha256(b"fw"));
        assert!(server.requests().is_empty());
    }

    #[tokio::test]
    async fn recorded_digest_guards_reuse_without_checksum() {
        let server = TestServer::start();
        server.serve("/vmlinuz", b"kernel".to_vec());
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("vmlinuz");
        let url = server.url("/vmlinuz");
        let resolver = Resolver::new();

        std::fs::write(&dest, b"kernel").unwrap();
        let fetched = resolver
            .fetch_verified(&url, &[], Some(&sha256(b"kernel")), &dest)
            .await
            .unwrap();
        assert!(!fetched.transferred);
        assert_eq!(server.count("GET", "/vmlinuz"), 0);

        // Same size, different bytes: only the recorded digest can tell.
        std::fs::write(&dest, b"KERNEL").unwrap();
        let fetched = resolver
            .fetch_verified(&url, &[], Some(&sha256(b"kernel")), &dest)
            .await
            .unwrap();
        assert!(fetched.transferred);
        assert_eq!(fetched.digest(), sha256(b"kernel"));
        assert_eq!(server.count("GET", "/vmlinuz"), 1);
        assert_eq!(std::fs::read(&dest).unwrap(), b"kernel");
    }

    #[tokio::test]
    async fn expected_digest_outranks_recorded_one() {
        let server = TestServer::start();
        server.serve("/vmlinuz", b"kernel v2".to_vec());
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("vmlinuz");
        std::fs::write(&dest, b"kernel v2").unwrap();

        let fetched = Resolver::new()
            .fetch_verified(
                &server.url("/vmlinuz"),
                &[sha256(b"kernel v2")],
                Some(&sha256(b"kernel v1")),
                &dest,
            )
            .await
            .unwrap();

        assert!(!fetched.transferred);
        assert_eq!(fetched.digest(), sha256(b"kernel v2"));
        assert_eq!(server.count("GET", "/vmlinuz"), 0);
    }

    #[tokio::test]
    async fn size_preflight_skips_hashing_and_redownloads() {
        let server = TestServer::start();
        server.serve("/initrd", b"fresh initrd".to_vec());
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("initrd");
        std::fs::write(&dest, b"stale").unwrap();

        let fetched = Resolver::new()
            .fetch_verified(&server.url("/initrd"), &[], None, &dest)
            .await
            .unwrap();

        assert!(fetched.transferred);
        assert_eq!(server.count("HEAD", "/initrd"), 1);
        assert_eq!(server.count("GET", "/initrd"), 1);
        assert_eq!(std::fs::read(&dest).unwrap(), b"fresh initrd");
    }

    #[tokio::test]
    async fn corrupt_existing_file_is_replaced() {
        let server = TestServer::start();
        server.serve("/vmlinuz", b"kernel".to_vec());
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("vmlinuz");
        std::fs::write(&dest, b"KERNEL").unwrap();

        let fetched = Resolver::new()
            .fetch_verified(&server.url("/vmlinuz"), &[sha256(b"kernel")], None, &dest)
            .await
            .unwrap();

        assert!(fetched.transferred);
        assert_eq!(server.count("GET", "/vmlinuz"), 1);
        assert_eq!(std::fs::read(&dest).unwrap(), b"kernel");
    }

    #[tokio::test]
    async fn mismatch_is_corruption_and_never_promoted() {
        let server = TestServer::start();
        server.serve("/vmlinuz", b"tampered".to_vec());
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("vmlinuz");

        let err = Resolver::new()
            .fetch_verified(&server.url("/vmlinuz"), &[sha256(b"kernel")], None, &dest)
            .await
            .unwrap_err();

        assert!(err.is_corruption(), "{err}");
        assert!(!dest.exists());
        assert!(!tmp_path(&dest).exists());
    }

    #[tokio::test]
    async fn transport_failure_keeps_previous_file() {
        let server = TestServer::start();
        server.fail("/vmlinuz", 500);
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("vmlinuz");
        std::fs::write(&dest, b"old kernel").unwrap();

        let err = Resolver::new()
            .fetch_verified(&server.url("/vmlinuz"), &[sha256(b"new kernel")], None, &dest)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Status { status: 500, .. }), "{err}");
        assert!(!err.is_corruption());
        assert_eq!(std::fs::read(&dest).unwrap(), b"old kernel");
        assert!(!tmp_path(&dest).exists());
    }
}
