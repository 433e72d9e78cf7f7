use std::collections::{BTreeMap, BTreeSet};

use bootcache_manifest::{ArtifactSpec, BootMode, ResourceRef};

use crate::{
    Error,
    layout::{
        FIRMWARE_DIR, INITRD_DIR, ISO_DIR, KERNEL_DIR, NO_FIRMWARE_DIR, WITH_FIRMWARE_DIR,
        image_file_name, url_file_name, validate_name,
    },
};

pub(crate) const KERNEL: &str = "kernel";
pub(crate) const INITRD: &str = "initrd";
pub(crate) const ISO: &str = "iso";
pub(crate) const FIRMWARE: &str = "firmware";
pub(crate) const COMBINED_INITRD: &str = "combined-initrd";

#[derive(Clone, Debug)]
pub(crate) enum Source {
    Fetch(ResourceRef),
    /// A file inside the image produced by the `iso` stage.
    Extract { path_in_image: String },
    /// Concatenation of the `initrd` and `firmware` stages, in that order.
    Combine,
}

#[derive(Clone, Debug)]
pub(crate) struct Stage {
    pub name: &'static str,
    /// Path relative to the artifact directory.
    pub file: String,
    pub source: Source,
}

/// The ordered stages that resolve one spec, plus where boot serving finds the result.
#[derive(Clone, Debug)]
pub(crate) struct Plan {
    pub stages: Vec<Stage>,
    boot: Vec<(&'static str, &'static str)>,
}

impl Plan {
    pub(crate) fn new(name: &str, spec: &ArtifactSpec) -> Result<Self, Error> {
        validate_name(name)?;
        let mode = spec.validate()?;
        let firmware = spec.firmware.as_ref();
        let mut stages = Vec::new();
        let mut boot = vec![(KERNEL, KERNEL)];

        let initrd_file = match mode {
            BootMode::Direct { kernel, initrd } => {
                stages.push(Stage {
                    name: KERNEL,
                    file: url_file_name(&kernel.url, KERNEL),
                    source: Source::Fetch(kernel.clone()),
                });
                let file = url_file_name(&initrd.url, INITRD);
                stages.push(Stage {
                    name: INITRD,
                    file: match firmware {
                        Some(_) => format!("{NO_FIRMWARE_DIR}/{file}"),
                        None => file.clone(),
                    },
                    source: Source::Fetch(initrd.clone()),
                });
                file
            }
            BootMode::Iso {
                iso,
                kernel_path,
                initrd_path,
            } => {
                stages.push(Stage {
                    name: ISO,
                    file: format!("{ISO_DIR}/{}", url_file_name(&iso.url, ISO)),
                    source: Source::Fetch(iso.clone()),
                });
                stages.push(Stage {
                    name: KERNEL,
                    file: format!("{KERNEL_DIR}/{}", image_file_name(kernel_path, KERNEL)),
                    source: Source::Extract {
                        path_in_image: kernel_path.to_string(),
                    },
                });
                let file = image_file_name(initrd_path, INITRD);
                stages.push(Stage {
                    name: INITRD,
                    file: format!("{INITRD_DIR}/{file}"),
                    source: Source::Extract {
                        path_in_image: initrd_path.to_string(),
                    },
                });
                boot.push((ISO, ISO));
                file
            }
        };

        match firmware {
            Some(firmware) => {
                stages.push(Stage {
                    name: FIRMWARE,
                    file: format!("{FIRMWARE_DIR}/{}", url_file_name(&firmware.url, FIRMWARE)),
                    source: Source::Fetch(firmware.clone()),
                });
                stages.push(Stage {
                    name: COMBINED_INITRD,
                    file: format!("{WITH_FIRMWARE_DIR}/{initrd_file}"),
                    source: Source::Combine,
                });
                boot.push((INITRD, COMBINED_INITRD));
            }
            None => boot.push((INITRD, INITRD)),
        }

        let plan = Self { stages, boot };
        plan.check_collisions()?;
        Ok(plan)
    }

    pub(crate) fn stage(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|stage| stage.name == name)
    }

    /// Files the plan produces, relative to the artifact directory.
    pub(crate) fn files(&self) -> BTreeSet<String> {
        self.stages.iter().map(|stage| stage.file.clone()).collect()
    }

    /// `kernel`, `initrd` and (ISO mode) `iso` paths relative to the cache base directory.
    pub(crate) fn boot_params(&self, artifact: &str) -> BTreeMap<String, String> {
        self.boot
            .iter()
            .filter_map(|(param, stage)| {
                let stage = self.stage(stage)?;
                Some((param.to_string(), format!("{artifact}/{}", stage.file)))
            })
            .collect()
    }

    fn check_collisions(&self) -> Result<(), Error> {
        let mut seen: BTreeMap<&str, &'static str> = BTreeMap::new();
        for stage in &self.stages {
            if let Some(first) = seen.insert(&stage.file, stage.name) {
                return Err(Error::FileCollision {
                    first,
                    second: stage.name,
                    file: stage.file.clone(),
                });
            }
        }
        Ok(())
    }
}
