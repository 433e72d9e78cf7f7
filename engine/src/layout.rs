//! Where each artifact's files live under the cache base directory.

use std::{
    collections::BTreeSet,
    io,
    path::{Path, PathBuf},
};

use tracing::{debug, info};
use url::Url;

use crate::Error;

/// Plain initrd when a firmware-combined one is built next to it.
pub const NO_FIRMWARE_DIR: &str = "no-firmware";
pub const WITH_FIRMWARE_DIR: &str = "with-firmware";
pub const FIRMWARE_DIR: &str = "firmware";
pub const ISO_DIR: &str = "iso";
pub const KERNEL_DIR: &str = "kernel";
pub const INITRD_DIR: &str = "initrd";

#[derive(Clone, Debug)]
pub struct Layout {
    base: PathBuf,
}

impl Layout {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn artifact_dir(&self, name: &str) -> Result<PathBuf, Error> {
        validate_name(name)?;
        Ok(self.base.join(name))
    }

    /// Removes an artifact's directory. Missing directories are fine.
    pub async fn remove(&self, name: &str) -> Result<(), Error> {
        let dir = self.artifact_dir(name)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                info!(path = %dir.display(), "removed artifact directory");
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Deletes every file under the artifact directory that is not in `keep` (paths relative
    /// to that directory), then any directories left empty.
    pub async fn prune(&self, name: &str, keep: &BTreeSet<String>) -> Result<usize, Error> {
        let root = self.artifact_dir(name)?;
        let mut removed = 0;
        let mut dirs = Vec::new();
        let mut pending = vec![root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                    continue;
                }
                let relative = relative_file(&root, &path);
                if !keep.contains(&relative) {
                    debug!(path = %path.display(), "pruning unreferenced file");
                    tokio::fs::remove_file(&path).await?;
                    removed += 1;
                }
            }
            if dir != root {
                dirs.push(dir);
            }
        }

        // Deepest first; a non-empty directory simply stays.
        dirs.sort_by_key(|dir| std::cmp::Reverse(dir.components().count()));
        for dir in dirs {
            let _ = tokio::fs::remove_dir(&dir).await;
        }
        Ok(removed)
    }
}

/// `/`-joined path of `path` below `root`.
fn relative_file(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

pub fn validate_name(name: &str) -> Result<(), Error> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
        && !name.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidName(name.to_string()))
    }
}

/// File name a download is stored under: the URL's last path segment.
pub fn url_file_name(url: &Url, fallback: &str) -> String {
    let segment = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .unwrap_or_default();
    sanitize(segment, fallback)
}

/// File name an extracted file is stored under: the last component of its in-image path.
pub fn image_file_name(path_in_image: &str, fallback: &str) -> String {
    let component = path_in_image.rsplit('/').find(|c| !c.is_empty());
    sanitize(component.unwrap_or_default(), fallback)
}

fn sanitize(name: &str, fallback: &str) -> String {
    if name.is_empty() || name == "." || name == ".." || name.contains('\\') {
        fallback.to_string()
    } else {
        name.to_string()
    }
}
