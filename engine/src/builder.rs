//! Derived files built from other resolved files.

use std::path::Path;

use bootcache_manifest::{DigestAlg, Digests};
use bootcache_resolver::atomic::AtomicFile;
use tracing::info;

use crate::Error;

/// Writes the concatenation of `inputs`, in order, to `dest`.
///
/// Nothing reaches `dest` unless every input was read completely.
pub async fn concat(inputs: &[&Path], dest: &Path) -> Result<(Digests, u64), Error> {
    let mut out = AtomicFile::create(dest, [DigestAlg::default()]).await?;
    for input in inputs {
        let mut file = tokio::fs::File::open(input).await?;
        out.copy_from(&mut file).await?;
    }
    let (digests, size) = out.finish().await?.commit().await?;
    info!(path = %dest.display(), size, "built derived file");
    Ok((digests, size))
}
