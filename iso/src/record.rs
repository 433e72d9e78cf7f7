//! Directory records and the name rules used to match them.

use crate::{Error, SECTOR_SIZE};

const MIN_RECORD_LEN: usize = 34;
const FLAG_DIRECTORY: u8 = 0x02;
const FLAG_MULTI_EXTENT: u8 = 0x80;

// Rock Ridge NM flags that mark "." / ".." aliases rather than a name.
const NM_CURRENT: u8 = 0x02;
const NM_PARENT: u8 = 0x04;

/// Which directory tree a record came from; decides how its name is decoded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Tree {
    Primary,
    Joliet,
}

#[derive(Clone, Debug)]
pub(crate) struct DirRecord {
    pub extent: u32,
    pub len: u32,
    flags: u8,
    name: Vec<u8>,
    rock_ridge_name: Option<String>,
}

impl DirRecord {
    pub(crate) fn parse(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < MIN_RECORD_LEN {
            return Err(Error::invalid("truncated directory record"));
        }
        let name_len = buf[32] as usize;
        let name_end = 33 + name_len;
        if name_end > buf.len() {
            return Err(Error::invalid("directory record name overruns record"));
        }
        // An even-length name is followed by one padding byte.
        let system_use = buf.get(name_end + usize::from(name_len % 2 == 0)..).unwrap_or(&[]);

        Ok(Self {
            extent: le_u32(&buf[2..6]),
            len: le_u32(&buf[10..14]),
            flags: buf[25],
            name: buf[33..name_end].to_vec(),
            rock_ridge_name: rock_ridge_name(system_use),
        })
    }

    pub(crate) fn is_dir(&self) -> bool {
        self.flags & FLAG_DIRECTORY != 0
    }

    pub(crate) fn is_multi_extent(&self) -> bool {
        self.flags & FLAG_MULTI_EXTENT != 0
    }

    /// The `.` and `..` entries, stored as the single bytes 0 and 1.
    fn is_self_or_parent(&self) -> bool {
        matches!(self.name.as_slice(), [0] | [1])
    }

    pub(crate) fn matches(&self, component: &str, tree: Tree) -> bool {
        if self.is_self_or_parent() {
            return false;
        }
        match tree {
            Tree::Primary => match &self.rock_ridge_name {
                Some(name) => name == component,
                None => {
                    normalize(&String::from_utf8_lossy(&self.name)).eq_ignore_ascii_case(component)
                }
            },
            Tree::Joliet => normalize(&decode_ucs2(&self.name)).eq_ignore_ascii_case(component),
        }
    }
}

/// Splits a directory extent into its records. Records never straddle a sector; a zero length
/// byte means the rest of the sector is padding.
pub(crate) fn records(data: &[u8]) -> Result<Vec<DirRecord>, Error> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        let len = data[pos] as usize;
        if len == 0 {
            pos = (pos / SECTOR_SIZE + 1) * SECTOR_SIZE;
            continue;
        }
        let Some(buf) = data.get(pos..pos + len) else {
            return Err(Error::invalid("directory record overruns its extent"));
        };
        out.push(DirRecord::parse(buf)?);
        pos += len;
    }
    Ok(out)
}

/// Strips the `;version` suffix and a trailing dot from an ISO 9660 file identifier.
fn normalize(name: &str) -> &str {
    let name = name.split(';').next().unwrap_or(name);
    name.trim_end_matches('.')
}

fn decode_ucs2(name: &[u8]) -> String {
    let units = name
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]));
    char::decode_utf16(units)
        .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect()
}

/// Concatenated `NM` entries from a SUSP system use area, if any.
fn rock_ridge_name(mut area: &[u8]) -> Option<String> {
    let mut name: Option<Vec<u8>> = None;
    while area.len() >= 4 {
        let len = area[2] as usize;
        if len < 4 || len > area.len() {
            break;
        }
        let (entry, rest) = area.split_at(len);
        match &entry[..2] {
            b"NM" if len >= 5 => {
                if entry[4] & (NM_CURRENT | NM_PARENT) == 0 {
                    name.get_or_insert_with(Vec::new)
                        .extend_from_slice(&entry[5..]);
                }
            }
            b"ST" => break,
            _ => {}
        }
        area = rest;
    }
    name.map(|name| String::from_utf8_lossy(&name).into_owned())
}

pub(crate) fn le_u32(buf: &[u8]) -> u32 {
    u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])
}
