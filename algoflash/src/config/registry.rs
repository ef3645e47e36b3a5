//! Internal target registry

use super::{Chip, ChipFamily, Target, TargetDescriptionSource};
use std::fs::File;
use std::path::Path;
use thiserror::Error;

/// Error type for all errors which occur when working
/// with the internal registry of targets.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The requested chip was not found in the registry.
    #[error("The requested chip '{0}' was not found in the list of known targets.")]
    ChipNotFound(String),
    /// Multiple chips found which match the given string, unable to return a single chip.
    #[error("Found multiple chips matching '{0}', unable to select a single chip. ({1})")]
    ChipNotUnique(String, String),
    /// An IO error which occurred when trying to read a target description file.
    #[error("An IO error was encountered")]
    Io(#[from] std::io::Error),
    /// An error occurred while deserializing a YAML target description file.
    #[error("Deserializing the yaml encountered an error")]
    Yaml(#[from] serde_yaml::Error),
    /// Unable to lookup chip family due to an invalid description.
    #[error("Invalid chip family definition ({0}): {1}")]
    InvalidChipFamilyDefinition(String, String),
}

#[cfg(feature = "builtin-targets")]
const BUILTIN_TARGETS: &[&str] = &[include_str!("../../targets/PIC32CM_JH01.yaml")];

#[cfg(not(feature = "builtin-targets"))]
const BUILTIN_TARGETS: &[&str] = &[];

/// The registry of all known chip families.
#[derive(Debug, Default)]
pub struct Registry {
    /// All the available chips.
    families: Vec<ChipFamily>,
}

impl Registry {
    /// Create a registry holding the targets compiled into the crate.
    pub fn from_builtin_families() -> Result<Self, RegistryError> {
        let mut families = Vec::with_capacity(BUILTIN_TARGETS.len());
        for yaml in BUILTIN_TARGETS {
            families.push(parse_family(yaml, TargetDescriptionSource::BuiltIn)?);
        }
        Ok(Self { families })
    }

    /// All chip families in the registry.
    pub fn families(&self) -> &[ChipFamily] {
        &self.families
    }

    /// Look up a chip variant by name.
    ///
    /// The comparison ignores case. A unique prefix of a variant name is
    /// accepted too, with a warning.
    pub fn get_target_by_name(&self, name: impl AsRef<str>) -> Result<Target, RegistryError> {
        let name = name.as_ref();
        tracing::debug!("Searching registry for chip with name {}", name);

        let lowercase = name.to_ascii_lowercase();
        let variants = self
            .families
            .iter()
            .flat_map(|family| family.variants().iter().map(move |chip| (family, chip)));

        let mut partial_matches: Vec<(&ChipFamily, &Chip)> = Vec::new();
        for (family, chip) in variants {
            let chip_name = chip.name.to_ascii_lowercase();
            if chip_name == lowercase {
                tracing::debug!("Exact match for chip name: {}", chip.name);
                return Ok(Target::new(family, chip));
            }
            if chip_name.starts_with(&lowercase) {
                partial_matches.push((family, chip));
            }
        }

        match partial_matches.as_slice() {
            [] => Err(RegistryError::ChipNotFound(name.to_string())),
            [(family, chip)] => {
                tracing::warn!(
                    "Found chip {} which matches given partial name {}. Consider specifying its full name.",
                    chip.name,
                    name,
                );
                Ok(Target::new(family, chip))
            }
            matches => {
                let names = matches
                    .iter()
                    .map(|(_, chip)| chip.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                Err(RegistryError::ChipNotUnique(name.to_string(), names))
            }
        }
    }

    /// Add a chip family from a YAML file.
    ///
    /// A family with the same name replaces the existing one. Returns the name of the family.
    pub fn add_target_from_yaml(&mut self, path_to_yaml: &Path) -> Result<String, RegistryError> {
        let yaml = std::io::read_to_string(File::open(path_to_yaml)?)?;
        self.add_target_family_from_yaml(&yaml)
    }

    /// Add a chip family from a YAML string. See [`Registry::add_target_from_yaml`].
    pub fn add_target_family_from_yaml(&mut self, yaml: &str) -> Result<String, RegistryError> {
        let family = parse_family(yaml, TargetDescriptionSource::External)?;
        let name = family.name.clone();

        if let Some(index) = self.families.iter().position(|old| old.name == family.name) {
            tracing::debug!("Replacing chip family {}", name);
            self.families.remove(index);
        }
        self.families.push(family);

        Ok(name)
    }
}

fn parse_family(yaml: &str, source: TargetDescriptionSource) -> Result<ChipFamily, RegistryError> {
    let mut family: ChipFamily = serde_yaml::from_str(yaml)?;
    family.source = source;

    family
        .validate()
        .map_err(|error| RegistryError::InvalidChipFamilyDefinition(family.name.clone(), error))?;

    Ok(family)
}
