//! In-memory ISO 9660 image builder for tests.
//!
//! Produces a minimal but well-formed image: a primary volume descriptor, an optional Joliet
//! supplementary descriptor, one directory tree per descriptor and shared file extents.
//! Primary names are mangled to upper-case 8.3 the way mastering tools do, so long or mixed-case
//! names are only reachable through Rock Ridge or Joliet.

use std::collections::BTreeMap;

use crate::SECTOR_SIZE;

const FIRST_DESCRIPTOR: usize = 16;

#[derive(Clone, Debug, Default)]
pub struct ImageBuilder {
    files: Vec<(String, Vec<u8>)>,
    rock_ridge: bool,
    joliet: bool,
    multi_extent: Vec<String>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Tree {
    Primary,
    Joliet,
}

#[derive(Clone, Copy)]
enum Node {
    Dir(usize),
    File(usize),
}

struct Dir {
    parent: usize,
    entries: BTreeMap<String, Node>,
}

/// Extent (lba, byte length) per directory.
type Layout = Vec<(u32, u32)>;

impl ImageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file(mut self, path: &str, data: impl Into<Vec<u8>>) -> Self {
        self.files.push((path.trim_start_matches('/').to_string(), data.into()));
        self
    }

    /// Adds Rock Ridge `NM` entries carrying the original names to the primary tree.
    pub fn rock_ridge(mut self) -> Self {
        self.rock_ridge = true;
        self
    }

    /// Adds a Joliet tree carrying the original names.
    pub fn joliet(mut self) -> Self {
        self.joliet = true;
        self
    }

    /// Flags `path`'s record as the first of several extents.
    pub fn multi_extent(mut self, path: &str) -> Self {
        self.multi_extent.push(path.trim_start_matches('/').to_string());
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let dirs = self.tree();
        let mut trees = vec![Tree::Primary];
        if self.joliet {
            trees.push(Tree::Joliet);
        }

        // Descriptors, then terminator, then directories per tree, then file data.
        let mut next_lba = (FIRST_DESCRIPTOR + trees.len() + 1) as u32;
        let mut layouts: Vec<(Tree, Layout)> = Vec::new();
        for &tree in &trees {
            let placeholder = vec![(0, 0); dirs.len()];
            let mut layout = Layout::new();
            for index in 0..dirs.len() {
                let records = self.records(&dirs, index, tree, &placeholder, &[]);
                let sectors = packed_sectors(&records);
                layout.push((next_lba, (sectors * SECTOR_SIZE) as u32));
                next_lba += sectors as u32;
            }
            layouts.push((tree, layout));
        }

        let mut file_lbas = Vec::new();
        for (_, data) in &self.files {
            file_lbas.push(next_lba);
            next_lba += data.len().div_ceil(SECTOR_SIZE).max(1) as u32;
        }

        let mut image = vec![0u8; next_lba as usize * SECTOR_SIZE];
        for (i, (tree, layout)) in layouts.iter().enumerate() {
            let sector = &mut image[(FIRST_DESCRIPTOR + i) * SECTOR_SIZE..][..SECTOR_SIZE];
            sector[0] = match tree {
                Tree::Primary => 1,
                Tree::Joliet => 2,
            };
            sector[1..6].copy_from_slice(b"CD001");
            sector[6] = 1;
            sector[80..88].copy_from_slice(&both_endian(next_lba));
            if *tree == Tree::Joliet {
                sector[88..91].copy_from_slice(b"%/E");
            }
            let (lba, len) = layout[0];
            let root = record(&[0], lba, len, FLAG_DIRECTORY, &[]);
            sector[156..156 + root.len()].copy_from_slice(&root);
        }
        let terminator = &mut image[(FIRST_DESCRIPTOR + layouts.len()) * SECTOR_SIZE..];
        terminator[0] = 255;
        terminator[1..6].copy_from_slice(b"CD001");
        terminator[6] = 1;

        for (tree, layout) in &layouts {
            for index in 0..dirs.len() {
                let records = self.records(&dirs, index, *tree, layout, &file_lbas);
                let start = layout[index].0 as usize * SECTOR_SIZE;
                let mut pos = 0;
                for rec in records {
                    if pos % SECTOR_SIZE + rec.len() > SECTOR_SIZE {
                        pos = (pos / SECTOR_SIZE + 1) * SECTOR_SIZE;
                    }
                    image[start + pos..start + pos + rec.len()].copy_from_slice(&rec);
                    pos += rec.len();
                }
            }
        }

        for ((_, data), lba) in self.files.iter().zip(&file_lbas) {
            let start = *lba as usize * SECTOR_SIZE;
            image[start..start + data.len()].copy_from_slice(data);
        }
        image
    }

    fn tree(&self) -> Vec<Dir> {
        let mut dirs = vec![Dir {
            parent: 0,
            entries: BTreeMap::new(),
        }];
        for (index, (path, _)) in self.files.iter().enumerate() {
            let mut parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
            let Some(file) = parts.pop() else {
                continue;
            };
            let mut current = 0;
            for part in parts {
                current = match dirs[current].entries.get(part) {
                    Some(Node::Dir(child)) => *child,
                    _ => {
                        let child = dirs.len();
                        dirs.push(Dir {
                            parent: current,
                            entries: BTreeMap::new(),
                        });
                        dirs[current].entries.insert(part.to_string(), Node::Dir(child));
                        child
                    }
                };
            }
            dirs[current].entries.insert(file.to_string(), Node::File(index));
        }
        dirs
    }

    fn records(
        &self,
        dirs: &[Dir],
        index: usize,
        tree: Tree,
        layout: &Layout,
        file_lbas: &[u32],
    ) -> Vec<Vec<u8>> {
        let dir = &dirs[index];
        let (own_lba, own_len) = layout[index];
        let (parent_lba, parent_len) = layout[dir.parent];
        let mut out = vec![
            record(&[0], own_lba, own_len, FLAG_DIRECTORY, &[]),
            record(&[1], parent_lba, parent_len, FLAG_DIRECTORY, &[]),
        ];

        for (name, node) in &dir.entries {
            let (lba, len, flags, is_dir) = match *node {
                Node::Dir(child) => (layout[child].0, layout[child].1, FLAG_DIRECTORY, true),
                Node::File(file) => {
                    let (path, data) = &self.files[file];
                    let flags = if self.multi_extent.contains(path) {
                        FLAG_MULTI_EXTENT
                    } else {
                        0
                    };
                    let lba = file_lbas.get(file).copied().unwrap_or(0);
                    (lba, data.len() as u32, flags, false)
                }
            };
            let (identifier, system_use) = match tree {
                Tree::Primary => {
                    let rock_ridge = if self.rock_ridge {
                        nm_entry(name)
                    } else {
                        Vec::new()
                    };
                    (iso_name(name, is_dir).into_bytes(), rock_ridge)
                }
                Tree::Joliet => {
                    let name = if is_dir {
                        name.clone()
                    } else {
                        format!("{name};1")
                    };
                    let ucs2 = name.encode_utf16().flat_map(u16::to_be_bytes).collect();
                    (ucs2, Vec::new())
                }
            };
            out.push(record(&identifier, lba, len, flags, &system_use));
        }
        out
    }
}

const FLAG_DIRECTORY: u8 = 0x02;
const FLAG_MULTI_EXTENT: u8 = 0x80;

fn record(identifier: &[u8], lba: u32, len: u32, flags: u8, system_use: &[u8]) -> Vec<u8> {
    let pad = usize::from(identifier.len() % 2 == 0);
    let mut buf = vec![0u8; 33 + identifier.len() + pad];
    buf[2..10].copy_from_slice(&both_endian(lba));
    buf[10..18].copy_from_slice(&both_endian(len));
    buf[25] = flags;
    buf[28..32].copy_from_slice(&[1, 0, 0, 1]);
    buf[32] = identifier.len() as u8;
    buf[33..33 + identifier.len()].copy_from_slice(identifier);
    buf.extend_from_slice(system_use);
    if buf.len() % 2 == 1 {
        buf.push(0);
    }
    buf[0] = buf.len() as u8;
    buf
}

fn nm_entry(name: &str) -> Vec<u8> {
    let mut entry = vec![b'N', b'M', (5 + name.len()) as u8, 1, 0];
    entry.extend_from_slice(name.as_bytes());
    entry
}

fn both_endian(value: u32) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[..4].copy_from_slice(&value.to_le_bytes());
    out[4..].copy_from_slice(&value.to_be_bytes());
    out
}

fn packed_sectors(records: &[Vec<u8>]) -> usize {
    let mut sectors = 1;
    let mut used = 0;
    for rec in records {
        if used + rec.len() > SECTOR_SIZE {
            sectors += 1;
            used = 0;
        }
        used += rec.len();
    }
    sectors
}

/// Upper-case 8.3 identifier with a `;1` version on files.
fn iso_name(name: &str, is_dir: bool) -> String {
    let mangle = |part: &str, max: usize| -> String {
        part.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .take(max)
            .collect()
    };
    if is_dir {
        return mangle(name, 8);
    }
    let (stem, ext) = name.rsplit_once('.').unwrap_or((name, ""));
    format!("{}.{};1", mangle(stem, 8), mangle(ext, 3))
}
