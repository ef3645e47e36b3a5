use super::{
    Chip, ChipFamily, CoreType, MemoryRegion, NvmRegion, RawFlashAlgorithm,
    TargetDescriptionSource,
};
use crate::core::CoreRegisters;
use crate::flashing::FlashLoader;
use std::ops::Range;

/// This describes a complete target with a fixed chip model and variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// The name of the target.
    pub name: String,
    /// The core that runs the flash algorithms.
    pub core_type: CoreType,
    /// The available flash algorithms.
    pub flash_algorithms: Vec<RawFlashAlgorithm>,
    /// The memory map of the target.
    pub memory_map: Vec<MemoryRegion>,
    /// Source of the target description. Used for diagnostics.
    pub source: TargetDescriptionSource,
}

impl Target {
    /// Create a new target for the given details.
    ///
    /// The family must have been validated, so every algorithm the chip refers to exists.
    pub fn new(family: &ChipFamily, chip: &Chip) -> Target {
        let flash_algorithms = if chip.flash_algorithms.is_empty() {
            family.algorithms().to_vec()
        } else {
            chip.flash_algorithms
                .iter()
                .filter_map(|name| family.get_algorithm(name))
                .cloned()
                .collect()
        };

        Target {
            name: chip.name.clone(),
            core_type: chip.core,
            flash_algorithms,
            memory_map: chip.memory_map.clone(),
            source: family.source.clone(),
        }
    }

    /// Create a [FlashLoader] for this target, which can be used
    /// to program its non-volatile memory.
    pub fn flash_loader(&self) -> FlashLoader {
        FlashLoader::new(self.memory_map.clone(), self.source.clone())
    }

    /// The registers used to call flash algorithm routines on this target.
    pub fn core_registers(&self) -> &'static CoreRegisters {
        CoreRegisters::for_core(self.core_type)
    }

    /// Gets a [RawFlashAlgorithm] by name.
    pub fn flash_algorithm_by_name(&self, name: &str) -> Option<&RawFlashAlgorithm> {
        self.flash_algorithms.iter().find(|a| a.name == name)
    }

    /// All flash regions, ordered by address.
    pub fn nvm_regions(&self) -> Vec<&NvmRegion> {
        let mut regions = self
            .memory_map
            .iter()
            .filter_map(MemoryRegion::as_nvm_region)
            .collect::<Vec<_>>();
        regions.sort_by_key(|region| region.range.start);
        regions
    }

    /// The address ranges of all RAM regions.
    pub fn ram_ranges(&self) -> Vec<Range<u64>> {
        self.memory_map
            .iter()
            .filter_map(MemoryRegion::as_ram_region)
            .map(|region| region.range.clone())
            .collect()
    }
}
