//! Parsing and matching of `SHA256SUMS`-style checksum lists.

use bootcache_manifest::Digest;
use url::Url;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChecksumEntry {
    pub digest: Digest,
    pub name: String,
}

/// Result of looking an artifact up in a [`ChecksumList`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lookup {
    Found(Digest),
    NotFound,
    /// More than one distinct entry matched at the deciding step.
    Ambiguous,
}

impl Lookup {
    pub fn found(self) -> Option<Digest> {
        match self {
            Lookup::Found(digest) => Some(digest),
            Lookup::NotFound | Lookup::Ambiguous => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChecksumList {
    entries: Vec<ChecksumEntry>,
}

impl ChecksumList {
    /// Parses `<hex>  <name>` / `<hex> *<name>` lines, skipping blanks and `#` comments.
    ///
    /// A single malformed line makes the whole document parse to an empty list.
    pub fn parse(text: &str) -> Self {
        let mut entries = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match parse_line(line) {
                Some(entry) => entries.push(entry),
                None => return Self::default(),
            }
        }
        Self { entries }
    }

    pub fn entries(&self) -> &[ChecksumEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Looks up `relative` (see [`relative_path`]): verbatim, then ignoring a leading `./` on
    /// list entries, then by basename against entries that name a bare file. Each step that
    /// matches decides the outcome; several distinct matches make it ambiguous rather than
    /// picking one.
    ///
    /// An entry with a directory component only ever matches its full path, so
    /// `x86_64/vmlinuz` never vouches for `aarch64/vmlinuz`.
    pub fn lookup(&self, relative: &str) -> Lookup {
        let relative = relative.trim_start_matches("./");

        let verbatim = self.matching(|name| name == relative);
        if verbatim != Lookup::NotFound {
            return verbatim;
        }

        let dotted = self.matching(|name| name.strip_prefix("./") == Some(relative));
        if dotted != Lookup::NotFound {
            return dotted;
        }

        let file_name = basename(relative);
        if file_name.is_empty() {
            return Lookup::NotFound;
        }
        self.matching(|name| name.trim_start_matches("./") == file_name)
    }

    fn matching(&self, mut pred: impl FnMut(&str) -> bool) -> Lookup {
        let mut found: Option<&ChecksumEntry> = None;
        for entry in self.entries.iter().filter(|entry| pred(&entry.name)) {
            match found {
                None => found = Some(entry),
                Some(prev) if prev == entry => {}
                Some(_) => return Lookup::Ambiguous,
            }
        }
        found.map_or(Lookup::NotFound, |entry| Lookup::Found(entry.digest))
    }
}

fn parse_line(line: &str) -> Option<ChecksumEntry> {
    let (hex, rest) = line.split_once(|c: char| c.is_ascii_whitespace())?;
    let digest = Digest::from_hex(hex).ok()?;
    let rest = rest.trim_start();
    let name = rest.strip_prefix('*').unwrap_or(rest);
    if name.is_empty() {
        return None;
    }
    Some(ChecksumEntry {
        digest,
        name: name.to_string(),
    })
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Path of `artifact` as a checksum list at `list` would name it.
///
/// When both share scheme, host and port and the artifact lives under the list's directory,
/// this is the path below that directory; otherwise it is the artifact's file name.
pub fn relative_path(list: &Url, artifact: &Url) -> String {
    let file_name = basename(artifact.path()).to_string();

    let same_origin = list.scheme() == artifact.scheme()
        && list.host_str() == artifact.host_str()
        && list.port_or_known_default() == artifact.port_or_known_default();
    if !same_origin {
        return file_name;
    }

    let list_path = list.path();
    let dir = &list_path[..list_path.rfind('/').map_or(0, |i| i + 1)];
    match artifact.path().strip_prefix(dir) {
        Some(suffix) if !suffix.is_empty() && !dir.is_empty() => suffix.to_string(),
        _ => file_name,
    }
}
