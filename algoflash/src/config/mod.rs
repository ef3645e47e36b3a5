//! Target descriptions.
//!
//! A target is a single chip variant: the memory map of the chip and the
//! flash algorithms servicing its flash arrays. Descriptions are YAML files
//! following the schema of the [`algoflash_target`] crate. Some of them are
//! compiled into the crate, more can be added at runtime through the [`Registry`].

mod registry;
mod target;

pub use algoflash_target::{
    Chip, ChipFamily, CoreType, FlashProperties, GenericRegion, MemoryAccess, MemoryRange,
    MemoryRegion, NvmRegion, PageInfo, RamRegion, RawFlashAlgorithm, Region, SectorDescription,
    SectorInfo, TargetDescriptionSource,
};
pub use registry::{Registry, RegistryError};
pub use target::Target;
