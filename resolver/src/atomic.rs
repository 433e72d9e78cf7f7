//! Temp-file-then-rename writes with incremental hashing.
//!
//! Every managed file is produced through [`AtomicFile`]: bytes go to `<final>.tmp`, are
//! hashed as they are written, and only an explicit [`Staged::commit`] renames the temp file
//! over the destination. Dropping a writer or a staged file without committing removes the
//! temp file, so a failed or abandoned write never leaves a partial final file behind.

use std::{
    ffi::OsString,
    io,
    path::{Path, PathBuf},
};

use bootcache_manifest::{DigestAlg, Digests, MultiHasher};
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt as _, AsyncWriteExt as _},
};

const READ_CHUNK: usize = 64 * 1024;

/// `<dest>.tmp`, next to the destination so the final rename stays on one filesystem.
pub fn tmp_path(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("artifact"));
    name.push(".tmp");
    dest.with_file_name(name)
}

pub struct AtomicFile {
    dest: PathBuf,
    tmp: PathBuf,
    file: Option<File>,
    hasher: MultiHasher,
    size: u64,
}

impl AtomicFile {
    /// Creates (or truncates) the temp file for `dest`, creating parent directories as needed.
    pub async fn create(
        dest: &Path,
        algs: impl IntoIterator<Item = DigestAlg>,
    ) -> io::Result<Self> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = tmp_path(dest);
        let file = File::create(&tmp).await?;
        Ok(Self {
            dest: dest.to_path_buf(),
            tmp,
            file: Some(file),
            hasher: MultiHasher::new(algs),
            size: 0,
        })
    }

    pub async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::other("write after close"))?;
        file.write_all(data).await?;
        self.hasher.update(data);
        self.size += data.len() as u64;
        Ok(())
    }

    /// Streams `reader` to the end into this file.
    pub async fn copy_from<R>(&mut self, reader: &mut R) -> io::Result<u64>
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; READ_CHUNK];
        let mut copied = 0u64;
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Ok(copied);
            }
            self.write(&buf[..n]).await?;
            copied += n as u64;
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Flushes and closes the temp file. Nothing is visible at the destination yet.
    pub async fn finish(mut self) -> io::Result<Staged> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        let staged = Staged {
            dest: std::mem::take(&mut self.dest),
            tmp: std::mem::take(&mut self.tmp),
            digests: self.hasher.clone().finalize(),
            size: self.size,
            committed: false,
        };
        Ok(staged)
    }
}

impl Drop for AtomicFile {
    fn drop(&mut self) {
        if !self.tmp.as_os_str().is_empty() {
            let _ = std::fs::remove_file(&self.tmp);
        }
    }
}

/// A fully written and hashed temp file awaiting promotion.
#[derive(Debug)]
pub struct Staged {
    dest: PathBuf,
    tmp: PathBuf,
    digests: Digests,
    size: u64,
    committed: bool,
}

impl Staged {
    pub fn digests(&self) -> &Digests {
        &self.digests
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Atomically renames the temp file over the destination.
    pub async fn commit(mut self) -> io::Result<(Digests, u64)> {
        fs::rename(&self.tmp, &self.dest).await?;
        self.committed = true;
        Ok((self.digests.clone(), self.size))
    }

    pub async fn discard(mut self) {
        let _ = fs::remove_file(&self.tmp).await;
        self.committed = true;
    }
}

impl Drop for Staged {
    fn drop(&mut self) {
        if !self.committed {
            let _ = std::fs::remove_file(&self.tmp);
        }
    }
}

/// Hashes an existing file. Returns `None` when it does not exist.
pub async fn hash_file(
    path: &Path,
    algs: impl IntoIterator<Item = DigestAlg>,
) -> io::Result<Option<(Digests, u64)>> {
    let mut file = match File::open(path).await {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };
    let mut hasher = MultiHasher::new(algs);
    let mut buf = vec![0u8; READ_CHUNK];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok(Some((hasher.finalize(), size)))
}

#[cfg(test)]
mod tests {
    use bootcache_manifest::Digest;

    use super::*;

    #[tokio::test]
    async fn commit_renames_and_reports_digest() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("nested/vmlinuz");

        let mut file = AtomicFile::create(&dest, [DigestAlg::Sha256]).await.unwrap();
        file.write(b"kernel ").await.unwrap();
        file.write(b"bytes").await.unwrap();
        assert!(tmp_path(&dest).exists());
        assert!(!dest.exists());

        let staged = file.finish().await.unwrap();
        let (digests, size) = staged.commit().await.unwrap();

        assert_eq!(size, 12);
        assert_eq!(
            digests.primary(),
            &Digest::of(DigestAlg::Sha256, b"kernel bytes")
        );
        assert_eq!(std::fs::read(&dest).unwrap(), b"kernel bytes");
        assert!(!tmp_path(&dest).exists());
    }

    #[tokio::test]
    async fn dropping_without_commit_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("initrd");
        std::fs::write(&dest, b"old").unwrap();

        let mut file = AtomicFile::create(&dest, []).await.unwrap();
        file.write(b"half written").await.unwrap();
        drop(file);
        assert!(!tmp_path(&dest).exists());

        let mut file = AtomicFile::create(&dest, []).await.unwrap();
        file.write(b"staged").await.unwrap();
        let staged = file.finish().await.unwrap();
        staged.discard().await;

        assert!(!tmp_path(&dest).exists());
        assert_eq!(std::fs::read(&dest).unwrap(), b"old");
    }

    #[tokio::test]
    async fn hash_file_reports_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("firmware.cpio");
        assert!(hash_file(&path, []).await.unwrap().is_none());

        std::fs::write(&path, b"fw").unwrap();
        let (digests, size) = hash_file(&path, [DigestAlg::Sha512]).await.unwrap().unwrap();
        assert_eq!(size, 2);
        assert_eq!(digests.primary(), &Digest::of(DigestAlg::Sha512, b"fw"));
    }
}
