//! Copies single files out of a cached ISO image.

use std::{
    io::{self, SeekFrom},
    path::{Path, PathBuf},
};

use bootcache_iso::{IsoEntry, IsoImage};
use bootcache_manifest::{DigestAlg, Digests};
use bootcache_resolver::atomic::AtomicFile;
use tokio::io::{AsyncReadExt as _, AsyncSeekExt as _};
use tracing::info;

use crate::Error;

/// Extracts `path_in_image` from the image at `iso` into `dest`.
pub async fn extract(
    iso: &Path,
    path_in_image: &str,
    dest: &Path,
) -> Result<(Digests, u64), Error> {
    let entry = locate(iso.to_path_buf(), path_in_image.to_string()).await?;

    let mut image = tokio::fs::File::open(iso).await?;
    image.seek(SeekFrom::Start(entry.offset)).await?;
    let mut out = AtomicFile::create(dest, [DigestAlg::default()]).await?;
    let copied = out.copy_from(&mut image.take(entry.len)).await?;
    if copied != entry.len {
        return Err(bootcache_iso::Error::InvalidImage(format!(
            "`{path_in_image}` is truncated ({copied} of {} bytes)",
            entry.len
        ))
        .into());
    }

    let (digests, size) = out.finish().await?.commit().await?;
    info!(path_in_image, path = %dest.display(), size, "extracted");
    Ok((digests, size))
}

/// Directory walking is synchronous, small and seek-heavy, so it runs on the blocking pool.
async fn locate(iso: PathBuf, path_in_image: String) -> Result<IsoEntry, Error> {
    let entry = tokio::task::spawn_blocking(move || {
        let file = std::fs::File::open(&iso)?;
        IsoImage::open(io::BufReader::new(file))?.find(&path_in_image)
    })
    .await
    .map_err(io::Error::other)??;
    Ok(entry)
}
