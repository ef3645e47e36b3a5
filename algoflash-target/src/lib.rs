//! Target description schema
//!
//! Programming the flash of a chip requires a description of the chip: its
//! memory map, and for every flash array the flash algorithm which knows how
//! to erase and program it.
//!
//! This crate contains the schema structs for the YAML target description files.
//! The structs are plain data; validation of flash algorithms happens in the
//! flashing engine before any target access.
#![warn(missing_docs)]

mod chip;
mod flash_algorithm;
mod memory;
pub(crate) mod serialize;

pub use chip::{Chip, ChipFamily, CoreType, TargetDescriptionSource};
pub use flash_algorithm::{FlashProperties, RawFlashAlgorithm};
pub use memory::{
    GenericRegion, MemoryAccess, MemoryRange, MemoryRegion, NvmRegion, PageInfo, RamRegion,
    Region, SectorDescription, SectorInfo,
};
