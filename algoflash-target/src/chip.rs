use crate::flash_algorithm::RawFlashAlgorithm;
use crate::memory::{MemoryRange, MemoryRegion};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Source of a target description, used for diagnostics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TargetDescriptionSource {
    /// Compiled into the crate.
    BuiltIn,
    /// Loaded from a file at runtime.
    External,
}

/// Type of a supported core.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoreType {
    /// ARMv6-M: Cortex M0, M0+, M1
    Armv6m,
    /// ARMv7-M: Cortex M3
    Armv7m,
    /// ARMv7e-M: Cortex M4, M7
    Armv7em,
    /// ARMv8-M: Cortex M23, M33
    Armv8m,
    /// RISC-V
    Riscv,
}

impl CoreType {
    /// Returns true if the core type is an ARM Cortex-M.
    pub fn is_cortex_m(&self) -> bool {
        !matches!(self, CoreType::Riscv)
    }
}

/// A single chip variant, e.g. `PIC32CM5164JH01100`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Chip {
    /// The full name of the variant.
    pub name: String,
    /// The core flash algorithms execute on.
    pub core: CoreType,
    /// The memory regions available on the chip.
    pub memory_map: Vec<MemoryRegion>,
    /// Names of the flash algorithms available for this chip.
    ///
    /// These refer to [`ChipFamily::flash_algorithms`].
    #[serde(default)]
    pub flash_algorithms: Vec<String>,
}

/// A family of chips sharing flash algorithms.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChipFamily {
    /// Name of the family, e.g. `PIC32CM_JH01`.
    pub name: String,
    /// Vendor of the family.
    #[serde(default)]
    pub manufacturer: Option<String>,
    /// All variants of the family.
    pub variants: Vec<Chip>,
    /// All algorithms the variants may refer to.
    #[serde(default)]
    pub flash_algorithms: Vec<RawFlashAlgorithm>,
    /// Source of the description, set by whoever loaded it.
    #[serde(skip, default = "default_source")]
    pub source: TargetDescriptionSource,
}

fn default_source() -> TargetDescriptionSource {
    TargetDescriptionSource::External
}

impl ChipFamily {
    /// Checks the consistency of the description.
    ///
    /// Algorithm descriptors themselves are not checked here; the flashing
    /// engine validates them before any target access.
    pub fn validate(&self) -> Result<(), String> {
        self.reject_duplicate_target_names()?;
        self.ensure_algorithms_exist()?;
        self.reject_overlapping_regions()?;

        Ok(())
    }

    fn reject_duplicate_target_names(&self) -> Result<(), String> {
        let mut seen = HashSet::new();

        for chip in &self.variants {
            if !seen.insert(chip.name.to_ascii_lowercase()) {
                return Err(format!(
                    "target {} appears multiple times in {}",
                    chip.name, self.name,
                ));
            }
        }

        Ok(())
    }

    fn ensure_algorithms_exist(&self) -> Result<(), String> {
        for variant in &self.variants {
            let referenced = variant.flash_algorithms.iter().chain(
                variant
                    .memory_map
                    .iter()
                    .filter_map(MemoryRegion::as_nvm_region)
                    .filter_map(|region| region.algorithm.as_ref()),
            );

            for algorithm_name in referenced {
                if self.get_algorithm(algorithm_name).is_none() {
                    return Err(format!(
                        "unknown flash algorithm `{}` for variant `{}`",
                        algorithm_name, variant.name
                    ));
                }
            }
        }

        Ok(())
    }

    fn reject_overlapping_regions(&self) -> Result<(), String> {
        for variant in &self.variants {
            for (index, region) in variant.memory_map.iter().enumerate() {
                let range = region.address_range();
                if let Some(other) = variant.memory_map[index + 1..]
                    .iter()
                    .find(|other| other.address_range().intersects_range(&range))
                {
                    return Err(format!(
                        "variant `{}`: memory regions {:#x?} and {:#x?} overlap",
                        variant.name,
                        range,
                        other.address_range()
                    ));
                }
            }
        }

        Ok(())
    }

    /// Get the different [Chip]s which are part of this family.
    pub fn variants(&self) -> &[Chip] {
        &self.variants
    }

    /// Get all flash algorithms for this family of chips.
    pub fn algorithms(&self) -> &[RawFlashAlgorithm] {
        &self.flash_algorithms
    }

    /// Try to find a [RawFlashAlgorithm] with a given name.
    pub fn get_algorithm(&self, name: impl AsRef<str>) -> Option<&RawFlashAlgorithm> {
        let name = name.as_ref();
        self.flash_algorithms.iter().find(|elem| elem.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{NvmRegion, RamRegion};

    fn family() -> ChipFamily {
        ChipFamily {
            name: "family".to_string(),
            manufacturer: None,
            variants: vec![Chip {
                name: "chip".to_string(),
                core: CoreType::Armv6m,
                memory_map: vec![
                    MemoryRegion::Nvm(NvmRegion {
                        name: None,
                        range: 0..0x1000,
                        algorithm: Some("algo".to_string()),
                        access: None,
                    }),
                    MemoryRegion::Ram(RamRegion {
                        name: None,
                        range: 0x2000_0000..0x2000_1000,
                        access: None,
                    }),
                ],
                flash_algorithms: vec!["algo".to_string()],
            }],
            flash_algorithms: vec![RawFlashAlgorithm {
                name: "algo".to_string(),
                ..Default::default()
            }],
            source: TargetDescriptionSource::BuiltIn,
        }
    }

    #[test]
    fn valid_family() {
        assert_eq!(family().validate(), Ok(()));
    }

    #[test]
    fn unknown_algorithm_is_rejected() {
        let mut family = family();
        family.flash_algorithms[0].name = "other".to_string();

        let error = family.validate().unwrap_err();
        assert!(error.contains("unknown flash algorithm `algo`"));
    }

    #[test]
    fn overlapping_regions_are_rejected() {
        let mut family = family();
        family.variants[0]
            .memory_map
            .push(MemoryRegion::Ram(RamRegion {
                name: None,
                range: 0x800..0x1800,
                access: None,
            }));

        assert!(family.validate().is_err());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut family = family();
        let mut duplicate = family.variants[0].clone();
        duplicate.name = "CHIP".to_string();
        family.variants.push(duplicate);

        assert!(family.validate().is_err());
    }
}
