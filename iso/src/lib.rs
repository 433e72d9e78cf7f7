//! Read-only ISO 9660 access: enough to locate a file by path inside an installer image, as
//! the byte range it occupies in the image.
//!
//! The primary volume descriptor's tree is searched first, honouring Rock Ridge `NM` names
//! when the image carries them. If the path is not there and the image has a Joliet
//! supplementary descriptor, the Joliet tree is searched as well.

mod record;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

use std::io::{self, Read, Seek, SeekFrom};

use miette::Diagnostic;
use tracing::debug;

use crate::record::{DirRecord, Tree, le_u32, records};

pub const SECTOR_SIZE: usize = 2048;

const FIRST_DESCRIPTOR: u64 = 16;
const MAX_DESCRIPTORS: u64 = 64;
const ROOT_RECORD_OFFSET: usize = 156;
const ROOT_RECORD_LEN: usize = 34;
const MAX_DIRECTORY_BYTES: u32 = 16 * 1024 * 1024;

const TYPE_PRIMARY: u8 = 1;
const TYPE_SUPPLEMENTARY: u8 = 2;
const TYPE_TERMINATOR: u8 = 255;

#[derive(Debug, thiserror::Error, Diagnostic)]
pub enum Error {
    #[error("not a valid ISO 9660 image: {0}")]
    #[diagnostic(code(iso::invalid_image))]
    InvalidImage(String),
    #[error("`{path}` not found in image")]
    #[diagnostic(
        code(iso::not_found),
        help("Paths are matched per component; ISO names ignore case and `;1` suffixes.")
    )]
    NotFound { path: String },
    #[error("`{path}` spans multiple extents, which is not supported")]
    #[diagnostic(code(iso::multi_extent))]
    MultiExtent { path: String },
    #[error("io error: {0}")]
    #[diagnostic(code(iso::io_error))]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidImage(msg.into())
    }
}

/// Location of a regular file's bytes within the image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IsoEntry {
    pub offset: u64,
    pub len: u64,
}

#[derive(Clone, Copy, Debug)]
struct Extent {
    lba: u32,
    len: u32,
}

impl From<&DirRecord> for Extent {
    fn from(rec: &DirRecord) -> Self {
        Self {
            lba: rec.extent,
            len: rec.len,
        }
    }
}

pub struct IsoImage<R> {
    reader: R,
    image_len: u64,
    primary: Extent,
    joliet: Option<Extent>,
}

impl<R: Read + Seek> IsoImage<R> {
    /// Reads the volume descriptor set. Fails unless a primary volume descriptor is present.
    pub fn open(mut reader: R) -> Result<Self, Error> {
        let image_len = reader.seek(SeekFrom::End(0))?;
        let mut primary = None;
        let mut joliet = None;
        let mut terminated = false;

        for sector in FIRST_DESCRIPTOR..FIRST_DESCRIPTOR + MAX_DESCRIPTORS {
            let mut buf = [0u8; SECTOR_SIZE];
            read_at(&mut reader, image_len, sector * SECTOR_SIZE as u64, &mut buf)?;
            if &buf[1..6] != b"CD001" {
                return Err(Error::invalid(format!(
                    "no volume descriptor at sector {sector}"
                )));
            }
            match buf[0] {
                TYPE_PRIMARY if primary.is_none() => primary = Some(root_extent(&buf)?),
                TYPE_SUPPLEMENTARY if joliet.is_none() && is_joliet(&buf) => {
                    joliet = Some(root_extent(&buf)?)
                }
                TYPE_TERMINATOR => {
                    terminated = true;
                    break;
                }
                _ => {}
            }
        }

        if !terminated {
            return Err(Error::invalid("volume descriptor set is not terminated"));
        }
        let primary = primary.ok_or_else(|| Error::invalid("no primary volume descriptor"))?;
        Ok(Self {
            reader,
            image_len,
            primary,
            joliet,
        })
    }

    pub fn has_joliet(&self) -> bool {
        self.joliet.is_some()
    }

    /// Finds the regular file at `path` (`/`-separated, leading slash optional).
    pub fn find(&mut self, path: &str) -> Result<IsoEntry, Error> {
        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        if !components.is_empty() {
            if let Some(entry) = self.walk(self.primary, &components, Tree::Primary, path)? {
                return Ok(entry);
            }
            if let Some(root) = self.joliet {
                debug!(path, "not in primary tree, trying Joliet");
                if let Some(entry) = self.walk(root, &components, Tree::Joliet, path)? {
                    return Ok(entry);
                }
            }
        }
        Err(Error::NotFound {
            path: path.to_string(),
        })
    }

    fn walk(
        &mut self,
        root: Extent,
        components: &[&str],
        tree: Tree,
        path: &str,
    ) -> Result<Option<IsoEntry>, Error> {
        let Some((last, parents)) = components.split_last() else {
            return Ok(None);
        };

        let mut dir = root;
        for component in parents {
            match self.lookup(dir, component, tree)? {
                Some(rec) if rec.is_dir() => dir = Extent::from(&rec),
                _ => return Ok(None),
            }
        }

        let Some(rec) = self.lookup(dir, last, tree)? else {
            return Ok(None);
        };
        if rec.is_dir() {
            return Ok(None);
        }
        if rec.is_multi_extent() {
            return Err(Error::MultiExtent {
                path: path.to_string(),
            });
        }

        let entry = IsoEntry {
            offset: u64::from(rec.extent) * SECTOR_SIZE as u64,
            len: u64::from(rec.len),
        };
        if entry.offset + entry.len > self.image_len {
            return Err(Error::invalid(format!(
                "`{path}` extends past the end of the image"
            )));
        }
        Ok(Some(entry))
    }

    fn lookup(
        &mut self,
        dir: Extent,
        component: &str,
        tree: Tree,
    ) -> Result<Option<DirRecord>, Error> {
        if dir.len > MAX_DIRECTORY_BYTES {
            return Err(Error::invalid("directory extent is implausibly large"));
        }
        let mut data = vec![0u8; dir.len as usize];
        read_at(
            &mut self.reader,
            self.image_len,
            u64::from(dir.lba) * SECTOR_SIZE as u64,
            &mut data,
        )?;
        Ok(records(&data)?
            .into_iter()
            .find(|rec| rec.matches(component, tree)))
    }
}

fn read_at(
    reader: &mut (impl Read + Seek),
    image_len: u64,
    offset: u64,
    buf: &mut [u8],
) -> Result<(), Error> {
    if offset + buf.len() as u64 > image_len {
        return Err(Error::invalid("image is truncated"));
    }
    reader.seek(SeekFrom::Start(offset))?;
    reader.read_exact(buf)?;
    Ok(())
}

fn root_extent(descriptor: &[u8]) -> Result<Extent, Error> {
    let rec = DirRecord::parse(
        &descriptor[ROOT_RECORD_OFFSET..ROOT_RECORD_OFFSET + ROOT_RECORD_LEN],
    )?;
    if !rec.is_dir() {
        return Err(Error::invalid("root record is not a directory"));
    }
    let extent = Extent::from(&rec);
    if extent.len == 0 || le_u32(&descriptor[80..84]) == 0 {
        return Err(Error::invalid("empty root directory or volume"));
    }
    Ok(extent)
}

/// Joliet is a supplementary descriptor whose escape sequences select UCS-2 level 1-3.
fn is_joliet(descriptor: &[u8]) -> bool {
    let escapes = &descriptor[88..120];
    [b"%/@", b"%/C", b"%/E"]
        .iter()
        .any(|seq| escapes.windows(3).any(|w| w == *seq))
}
