use bootcache_manifest::{ChecksumSource, Digest, DigestAlg, ResourceRef};
use tracing::debug;
use url::Url;

use crate::{
    Error, Resolver,
    checksum::{ChecksumList, relative_path},
};

/// How many directories above the artifact's own are searched for checksum lists.
const PARENT_LEVELS: usize = 2;

impl Resolver {
    /// Expected digests for `resource`. Empty when nothing could be discovered.
    pub async fn expected_digests(&self, resource: &ResourceRef) -> Result<Vec<Digest>, Error> {
        match resource.checksum_source() {
            ChecksumSource::Inline(digest) => Ok(vec![*digest]),
            ChecksumSource::List(list_url) => {
                let list = ChecksumList::parse(&self.read_text(list_url).await?);
                let relative = relative_path(list_url, &resource.url);
                match list.lookup(&relative).found() {
                    Some(digest) => Ok(vec![digest]),
                    None => Err(Error::NoChecksumEntry {
                        list: list_url.clone(),
                        url: resource.url.clone(),
                    }),
                }
            }
            ChecksumSource::Discover => Ok(self.discover(&resource.url).await),
        }
    }

    /// Looks for `SHA256SUMS`/`SHA512SUMS` in the artifact's directory and its parents.
    ///
    /// For each algorithm the first directory with a non-empty list decides; a miss or an
    /// ambiguous match there means no digest for that algorithm.
    pub async fn discover(&self, artifact: &Url) -> Vec<Digest> {
        let dirs = candidate_dirs(artifact);
        let mut found = Vec::new();
        for alg in DigestAlg::all() {
            for dir in &dirs {
                let Ok(list_url) = dir.join(alg.checksum_filename()) else {
                    continue;
                };
                let text = match self.read_text(&list_url).await {
                    Ok(text) => text,
                    Err(err) => {
                        debug!(%list_url, %err, "no checksum list");
                        continue;
                    }
                };
                let list = ChecksumList::parse(&text);
                if list.is_empty() {
                    debug!(%list_url, "checksum list empty or unparseable");
                    continue;
                }
                let relative = relative_path(&list_url, artifact);
                match list.lookup(&relative).found() {
                    Some(digest) if digest.alg() == alg => {
                        debug!(%list_url, %relative, %digest, "discovered checksum");
                        found.push(digest);
                    }
                    _ => debug!(%list_url, %relative, "artifact not listed unambiguously"),
                }
                break;
            }
        }
        found
    }
}

fn candidate_dirs(artifact: &Url) -> Vec<Url> {
    let mut dirs = Vec::new();
    let Ok(mut dir) = artifact.join("./") else {
        return dirs;
    };
    for _ in 0..=PARENT_LEVELS {
        dirs.push(dir.clone());
        if dir.path() == "/" {
            break;
        }
        match dir.join("../") {
            Ok(parent) => dir = parent,
            Err(_) => break,
        }
    }
    dirs
}

#[cfg(test)]
mod tests {
    use bootcache_manifest::{Digest, DigestAlg, ResourceRef};
    use url::Url;

    use super::candidate_dirs;
    use crate::{Error, Resolver, testing::TestServer};

    fn sha256(data: &[u8]) -> Digest {
        Digest::of(DigestAlg::Sha256, data)
    }

    #[test]
    fn searches_two_parent_directories() {
        let url = Url::parse("https://mirror.example/a/b/c/vmlinuz").unwrap();
        let dirs: Vec<String> = candidate_dirs(&url).iter().map(Url::to_string).collect();
        assert_eq!(
            dirs,
            [
                "https://mirror.example/a/b/c/",
                "https://mirror.example/a/b/",
                "https://mirror.example/a/",
            ]
        );

        let shallow = Url::parse("https://mirror.example/vmlinuz").unwrap();
        assert_eq!(candidate_dirs(&shallow).len(), 1);
    }

    #[tokio::test]
    async fn explicit_list_matches_relative_path() {
        let server = TestServer::start();
        server.serve(
            "/releases/SHA256SUMS",
            format!(
                "{}  ./x86_64/vmlinuz\n{}  ./aarch64/vmlinuz\n",
                sha256(b"x86").to_hex(),
                sha256(b"arm").to_hex()
            ),
        );
        let mut resource = ResourceRef::new(server.url("/releases/aarch64/vmlinuz"));
        resource.checksum_url = Some(server.url("/releases/SHA256SUMS"));

        let digests = Resolver::new().expected_digests(&resource).await.unwrap();
        assert_eq!(digests, [sha256(b"arm")]);
    }

    #[tokio::test]
    async fn explicit_list_without_unambiguous_entry_is_an_error() {
        let server = TestServer::start();
        server.serve(
            "/SHA256SUMS",
            format!(
                "{}  x86_64/vmlinuz\n{}  aarch64/vmlinuz\n",
                sha256(b"x86").to_hex(),
                sha256(b"arm").to_hex()
            ),
        );
        let mut resource = ResourceRef::new(server.url("/mirror/vmlinuz"));
        resource.checksum_url = Some(server.url("/SHA256SUMS"));

        let err = Resolver::new().expected_digests(&resource).await.unwrap_err();
        assert!(matches!(err, Error::NoChecksumEntry { .. }), "{err}");
        assert!(err.is_config());
    }

    #[tokio::test]
    async fn explicit_list_transport_failure_propagates() {
        let server = TestServer::start();
        server.fail("/SHA256SUMS", 500);
        let mut resource = ResourceRef::new(server.url("/vmlinuz"));
        resource.checksum_url = Some(server.url("/SHA256SUMS"));

        let err = Resolver::new().expected_digests(&resource).await.unwrap_err();
        assert!(matches!(err, Error::Status { status: 500, .. }), "{err}");
    }

    #[tokio::test]
    async fn discovery_merges_algorithms_and_walks_up() {
        let server = TestServer::start();
        let sha512 = Digest::of(DigestAlg::Sha512, b"kernel");
        server.serve(
            "/os/images/SHA512SUMS",
            format!("{} *pxeboot/vmlinuz\n", sha512.to_hex()),
        );
        server.serve(
            "/os/SHA256SUMS",
            format!("{}  images/pxeboot/vmlinuz\n", sha256(b"kernel").to_hex()),
        );

        let artifact = server.url("/os/images/pxeboot/vmlinuz");
        let digests = Resolver::new().discover(&artifact).await;
        assert_eq!(digests, [sha256(b"kernel"), sha512]);

        // SHA256SUMS: pxeboot/ and images/ miss before os/ hits.
        assert_eq!(server.count("GET", "/os/images/pxeboot/SHA256SUMS"), 1);
        assert_eq!(server.count("GET", "/os/images/SHA256SUMS"), 1);
        assert_eq!(server.count("GET", "/os/SHA256SUMS"), 1);
        // SHA512SUMS: images/ hits, so os/ is never requested.
        assert_eq!(server.count("GET", "/os/SHA512SUMS"), 0);
    }

    #[tokio::test]
    async fn discovery_stops_at_first_parseable_list() {
        let server = TestServer::start();
        server.serve(
            "/a/b/SHA256SUMS",
            format!("{}  unrelated.img\n", sha256(b"other").to_hex()),
        );
        server.serve(
            "/a/SHA256SUMS",
            format!("{}  b/vmlinuz\n", sha256(b"kernel").to_hex()),
        );
        server.serve("/a/b/SHA512SUMS", "garbage that does not parse\n");

        let digests = Resolver::new().discover(&server.url("/a/b/vmlinuz")).await;
        assert!(digests.is_empty(), "{digests:?}");
        assert_eq!(server.count("GET", "/a/SHA256SUMS"), 0);
        assert_eq!(server.count("GET", "/a/SHA512SUMS"), 1);
    }

    #[tokio::test]
    async fn inline_checksum_needs_no_network() {
        let server = TestServer::start();
        let mut resource = ResourceRef::new(server.url("/vmlinuz"));
        resource.checksum = Some(sha256(b"kernel"));

        let digests = Resolver::new().expected_digests(&resource).await.unwrap();
        assert_eq!(digests, [sha256(b"kernel")]);
        assert!(server.requests().is_empty());
    }
}
