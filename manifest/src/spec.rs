use serde::{Deserialize, Serialize};
use url::Url;

use crate::{Digest, DigestAlg, Error, MultiHasher};

const SUPPORTED_SCHEMES: &[&str] = &["http", "https", "file"];

/// Declared intent for one named boot artifact.
///
/// Exactly one boot mode must be set: direct (`kernel` + `initrd`) or ISO (`iso` plus the
/// in-image paths). `firmware` is orthogonal to the boot mode.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
#[non_exhaustive]
pub struct ArtifactSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel: Option<ResourceRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initrd: Option<ResourceRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iso: Option<ResourceRef>,
    #[serde(
        default,
        rename = "kernelPathInISO",
        skip_serializing_if = "Option::is_none"
    )]
    pub kernel_path_in_iso: Option<String>,
    #[serde(
        default,
        rename = "initrdPathInISO",
        skip_serializing_if = "Option::is_none"
    )]
    pub initrd_path_in_iso: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware: Option<ResourceRef>,
}

/// A remote file plus where its expected digest comes from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
#[non_exhaustive]
pub struct ResourceRef {
    pub url: Url,
    /// Inline expected digest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<Digest>,
    /// URL of a `SHA256SUMS`-style checksum list containing this resource.
    #[serde(
        default,
        rename = "checksumURL",
        skip_serializing_if = "Option::is_none"
    )]
    pub checksum_url: Option<Url>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChecksumSource<'a> {
    Inline(&'a Digest),
    List(&'a Url),
    /// Nothing declared: look for conventional checksum lists next to the resource.
    Discover,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootMode<'a> {
    Direct {
        kernel: &'a ResourceRef,
        initrd: &'a ResourceRef,
    },
    Iso {
        iso: &'a ResourceRef,
        kernel_path: &'a str,
        initrd_path: &'a str,
    },
}

impl ResourceRef {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            checksum: None,
            checksum_url: None,
        }
    }

    pub fn checksum_source(&self) -> ChecksumSource<'_> {
        match (&self.checksum, &self.checksum_url) {
            (Some(digest), _) => ChecksumSource::Inline(digest),
            (None, Some(url)) => ChecksumSource::List(url),
            (None, None) => ChecksumSource::Discover,
        }
    }

    fn validate(&self, field: &str) -> Result<(), Error> {
        if self.checksum.is_some() && self.checksum_url.is_some() {
            return Err(Error::invalid_spec(format!(
                "`{field}` sets both `checksum` and `checksumURL`"
            )));
        }
        ensure_supported_scheme(&self.url)?;
        if let Some(url) = &self.checksum_url {
            ensure_supported_scheme(url)?;
        }
        Ok(())
    }
}

impl ArtifactSpec {
    /// The boot mode this spec selects, or why it is not a valid spec.
    pub fn boot_mode(&self) -> Result<BootMode<'_>, Error> {
        let direct = self.kernel.is_some() || self.initrd.is_some();
        let iso = self.iso.is_some()
            || self.kernel_path_in_iso.is_some()
            || self.initrd_path_in_iso.is_some();

        match (direct, iso) {
            (true, true) => Err(Error::invalid_spec(
                "`kernel`/`initrd` and `iso` boot modes are mutually exclusive",
            )),
            (false, false) => Err(Error::invalid_spec(
                "one of `kernel`/`initrd` or `iso` must be set",
            )),
            (true, false) => match (&self.kernel, &self.initrd) {
                (Some(kernel), Some(initrd)) => Ok(BootMode::Direct { kernel, initrd }),
                (None, _) => Err(Error::invalid_spec("`initrd` is set without `kernel`")),
                (_, None) => Err(Error::invalid_spec("`kernel` is set without `initrd`")),
            },
            (false, true) => {
                let Some(iso) = &self.iso else {
                    return Err(Error::invalid_spec(
                        "`kernelPathInISO`/`initrdPathInISO` require `iso`",
                    ));
                };
                let kernel_path = in_image_path(&self.kernel_path_in_iso, "kernelPathInISO")?;
                let initrd_path = in_image_path(&self.initrd_path_in_iso, "initrdPathInISO")?;
                Ok(BootMode::Iso {
                    iso,
                    kernel_path,
                    initrd_path,
                })
            }
        }
    }

    /// Checks the whole spec. Every error reported here is a configuration error: nothing is
    /// fetched for a spec that fails validation.
    pub fn validate(&self) -> Result<BootMode<'_>, Error> {
        let mode = self.boot_mode()?;
        match mode {
            BootMode::Direct { kernel, initrd } => {
                kernel.validate("kernel")?;
                initrd.validate("initrd")?;
            }
            BootMode::Iso { iso, .. } => iso.validate("iso")?,
        }
        if let Some(firmware) = &self.firmware {
            firmware.validate("firmware")?;
        }
        Ok(mode)
    }

    /// Fingerprint of this spec, recorded in status to notice edits.
    pub fn digest(&self) -> Result<Digest, Error> {
        let mut hasher = MultiHasher::new([DigestAlg::Sha256]);
        serde_json::to_writer(&mut hasher, self)?;
        Ok(*hasher.finalize().primary())
    }
}

fn in_image_path<'a>(path: &'a Option<String>, field: &str) -> Result<&'a str, Error> {
    match path.as_deref().map(str::trim) {
        Some(path) if !path.trim_matches('/').is_empty() => Ok(path),
        _ => Err(Error::invalid_spec(format!(
            "`{field}` is required in ISO mode"
        ))),
    }
}

fn ensure_supported_scheme(url: &Url) -> Result<(), Error> {
    if SUPPORTED_SCHEMES.contains(&url.scheme()) {
        Ok(())
    } else {
        Err(Error::UnsupportedScheme {
            url: url.to_string(),
            scheme: url.scheme().to_string(),
        })
    }
}
