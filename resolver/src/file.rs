use std::{io, path::PathBuf};

use url::Url;

use super::{Error, atomic::AtomicFile};

/// Serves `file://` URLs, e.g. a local mirror mounted next to the cache.
#[derive(Clone, Copy, Debug, Default)]
pub struct FileSource;

impl FileSource {
    pub fn new() -> Self {
        Default::default()
    }

    fn path(url: &Url) -> Result<PathBuf, Error> {
        url.to_file_path().map_err(|()| {
            Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid file URL: {url}"),
            ))
        })
    }

    pub(super) async fn read_text(&self, url: &Url, max_body_bytes: usize) -> Result<String, Error> {
        let path = Self::path(url)?;
        let size = tokio::fs::metadata(&path).await?.len();
        if size > max_body_bytes as u64 {
            return Err(Error::ResponseTooLarge {
                url: url.clone(),
                size,
                max_bytes: max_body_bytes,
            });
        }
        Ok(tokio::fs::read_to_string(&path).await?)
    }

    pub(super) async fn content_length(&self, url: &Url) -> Option<u64> {
        let path = Self::path(url).ok()?;
        let meta = tokio::fs::metadata(&path).await.ok()?;
        meta.is_file().then(|| meta.len())
    }

    pub(super) async fn download(&self, url: &Url, out: &mut AtomicFile) -> Result<u64, Error> {
        let path = Self::path(url)?;
        let mut file = tokio::fs::File::open(&path).await?;
        Ok(out.copy_from(&mut file).await?)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::NamedTempFile;
    use url::Url;

    use super::FileSource;
    use crate::{Error, atomic::AtomicFile};

    #[tokio::test]
    async fn copies_local_files() {
        let src = NamedTempFile::new().unwrap();
        std::fs::write(src.path(), b"local initrd").unwrap();
        let url = Url::from_file_path(src.path()).unwrap();
        let dir = tempfile::tempdir().unwrap();

        let source = FileSource::new();
        assert_eq!(source.content_length(&url).await, Some(12));

        let dest = dir.path().join("initrd");
        let mut out = AtomicFile::create(&dest, []).await.unwrap();
        assert_eq!(source.download(&url, &mut out).await.unwrap(), 12);
        out.finish().await.unwrap().commit().await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"local initrd");
    }

    #[tokio::test]
    async fn read_text_enforces_size_limit() {
        let src = NamedTempFile::new().unwrap();
        std::fs::write(src.path(), "a".repeat(100)).unwrap();
        let url = Url::from_file_path(src.path()).unwrap();

        let err = FileSource::new().read_text(&url, 10).await.unwrap_err();
        assert!(matches!(err, Error::ResponseTooLarge { size: 100, .. }), "{err}");
    }
}
