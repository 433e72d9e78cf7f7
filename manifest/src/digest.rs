use std::{
    fmt,
    io::{self, Write},
    str::FromStr,
};

use serde_with::{DeserializeFromStr, SerializeDisplay};
use sha2::Digest as _;

use crate::Error;

macro_rules! count {
    ($ident:ident) => { 1 };
    ($head:ident, $($rest:ident),+) => { 1 + count!($($rest),+) }
}

macro_rules! first {
    ($head:expr $(, $($rest:expr),+)?) => {
        $head
    };
}

macro_rules! digest {
    ($( ($name:ident, $size:literal, $tag:literal, $sums:literal) ),+ $(,)? ) => {
        #[derive(
            Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, DeserializeFromStr,
            SerializeDisplay,
        )]
        #[non_exhaustive]
        pub enum DigestAlg {
            $($name),+
        }

        impl DigestAlg {
            pub fn all() -> [Self; count!($($name),+)] {
                [$(Self::$name),+]
            }

            /// Conventional name of a checksum list for this algorithm (`SHA256SUMS`, ...).
            pub fn checksum_filename(self) -> &'static str {
                match self {
                    $( Self::$name => $sums ),+
                }
            }

            /// Size of a digest in bytes.
            pub fn digest_len(self) -> usize {
                match self {
                    $( Self::$name => $size ),+
                }
            }

            /// Infers the algorithm from the length of a hex-encoded digest.
            pub fn from_hex_len(len: usize) -> Option<Self> {
                match len {
                    $( n if n == 2 * $size => Some(Self::$name), )+
                    _ => None,
                }
            }

            pub fn hasher(self) -> Hasher {
                match self {
                    $( Self::$name => Hasher::$name(sha2::$name::new()) ),+
                }
            }
        }

        impl Default for DigestAlg {
            fn default() -> Self {
                first!($(Self::$name),+)
            }
        }

        impl fmt::Display for DigestAlg {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(match self {
                    $( Self::$name => $tag ),+
                })
            }
        }

        impl FromStr for DigestAlg {
            type Err = Error;

            fn from_str(input: &str) -> Result<Self, Self::Err> {
                match input.to_ascii_lowercase().as_str() {
                    $( $tag => Ok(Self::$name), )+
                    _ => Err(Error::UnknownDigestAlg(input.to_string())),
                }
            }
        }

        /// A content digest tagged with its algorithm.
        ///
        /// Displayed as `<alg>:<lowercase hex>`. Parsing also accepts a bare hex string, in which
        /// case the algorithm is inferred from its length.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, DeserializeFromStr, SerializeDisplay)]
        #[non_exhaustive]
        pub enum Digest {
            $( $name([u8; $size]) ),+
        }

        impl Digest {
            pub fn alg(&self) -> DigestAlg {
                match self {
                    $( Self::$name(_) => DigestAlg::$name ),+
                }
            }
        }

        impl TryFrom<(DigestAlg, &[u8])> for Digest {
            type Error = Error;

            fn try_from((alg, hash): (DigestAlg, &[u8])) -> Result<Self, Self::Error> {
                match alg {
                    $(
                    DigestAlg::$name => {
                        let Ok(bytes) = hash.try_into() else {
                            return Err(Error::InvalidDigest(format!(
                                "expected {} bytes but got {}",
                                $size,
                                hash.len()
                            )));
                        };
                        Ok(Self::$name(bytes))
                    }
                    )+
                }
            }
        }

        impl AsRef<[u8]> for Digest {
            fn as_ref(&self) -> &[u8] {
                match self {
                    $( Self::$name(bytes) => &*bytes ),+
                }
            }
        }

        /// Incremental hasher for one [`DigestAlg`].
        #[derive(Clone)]
        pub enum Hasher {
            $( $name(sha2::$name) ),+
        }

        impl Hasher {
            pub fn alg(&self) -> DigestAlg {
                match self {
                    $( Self::$name(_) => DigestAlg::$name ),+
                }
            }

            pub fn update(&mut self, data: &[u8]) {
                match self {
                    $( Self::$name(hasher) => hasher.update(data) ),+
                }
            }

            pub fn finalize(self) -> Digest {
                match self {
                    $(
                    Self::$name(hasher) => {
                        let mut bytes = [0u8; $size];
                        bytes.copy_from_slice(&hasher.finalize());
                        Digest::$name(bytes)
                    }
                    )+
                }
            }
        }
    }
}

digest!(
    (Sha256, 32, "sha256", "SHA256SUMS"),
    (Sha512, 64, "sha512", "SHA512SUMS"),
);

impl Digest {
    pub fn of(alg: DigestAlg, data: &[u8]) -> Self {
        let mut hasher = alg.hasher();
        hasher.update(data);
        hasher.finalize()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self)
    }

    /// Parses a bare hex digest, inferring the algorithm from its length.
    pub fn from_hex(input: &str) -> Result<Self, Error> {
        let alg = DigestAlg::from_hex_len(input.len())
            .ok_or_else(|| Error::InvalidDigest(input.to_string()))?;
        Self::from_hex_with(alg, input)
    }

    fn from_hex_with(alg: DigestAlg, input: &str) -> Result<Self, Error> {
        let bytes = hex::decode(input).map_err(|_| Error::InvalidDigest(input.to_string()))?;
        (alg, bytes.as_slice()).try_into()
    }
}

impl FromStr for Digest {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();
        match trimmed.split_once(':') {
            Some((alg, hash)) => Self::from_hex_with(alg.trim().parse()?, hash.trim()),
            None => Self::from_hex(trimmed),
        }
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.alg(), self.to_hex())
    }
}

/// Runs several [`Hasher`]s over the same byte stream.
#[derive(Clone)]
pub struct MultiHasher {
    /// The strongest requested algorithm.
    primary: Hasher,
    others: Vec<Hasher>,
}

impl MultiHasher {
    /// Hashers for every algorithm in `algs`, deduplicated. An empty input still computes the
    /// default algorithm so that every written file ends up with a recorded digest.
    pub fn new(algs: impl IntoIterator<Item = DigestAlg>) -> Self {
        let mut algs: Vec<DigestAlg> = algs.into_iter().collect();
        algs.sort();
        algs.dedup();
        let primary = algs.pop().unwrap_or_default();
        Self {
            primary: primary.hasher(),
            others: algs.into_iter().map(DigestAlg::hasher).collect(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.primary.update(data);
        for hasher in &mut self.others {
            hasher.update(data);
        }
    }

    pub fn finalize(self) -> Digests {
        Digests {
            primary: self.primary.finalize(),
            others: self.others.into_iter().map(Hasher::finalize).collect(),
        }
    }
}

impl Write for MultiHasher {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Digests of one piece of content, at most one per algorithm. Only [`MultiHasher`] builds
/// these, so there is always at least one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Digests {
    primary: Digest,
    others: Vec<Digest>,
}

impl Digests {
    pub fn get(&self, alg: DigestAlg) -> Option<&Digest> {
        self.iter().find(|digest| digest.alg() == alg)
    }

    /// The digest of the strongest algorithm computed; this is what status records carry.
    pub fn primary(&self) -> &Digest {
        &self.primary
    }

    /// Whether every expected digest has a computed counterpart with identical bytes.
    pub fn satisfies(&self, expected: &[Digest]) -> bool {
        expected
            .iter()
            .all(|want| self.get(want.alg()).is_some_and(|have| have == want))
    }

    /// The first expected digest that this set contradicts, paired with the computed one.
    pub fn first_mismatch(&self, expected: &[Digest]) -> Option<(Digest, Option<Digest>)> {
        expected.iter().find_map(|want| match self.get(want.alg()) {
            Some(have) if have == want => None,
            have => Some((*want, have.copied())),
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Digest> {
        std::iter::once(&self.primary).chain(&self.others)
    }
}
