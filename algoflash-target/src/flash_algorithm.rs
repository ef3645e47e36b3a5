use crate::memory::SectorDescription;
use crate::serialize::{hex_option, hex_range, hex_u_int, hex_words};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// The raw flash algorithm is the description of a flash algorithm,
/// as it is read from a target description file.
///
/// All entry points are absolute target addresses. Before it can be used for
/// flashing, it has to be validated by the flashing engine, which also
/// canonicalizes out-of-range entry points to "not supported".
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawFlashAlgorithm {
    /// The name of the flash algorithm.
    pub name: String,
    /// The description of the algorithm.
    #[serde(default)]
    pub description: String,
    /// Whether this flash algorithm is the default one or not.
    #[serde(default)]
    pub default: bool,
    /// Memory address where the flash algorithm instructions will be loaded to.
    #[serde(serialize_with = "hex_u_int")]
    pub load_address: u64,
    /// List of 32-bit words containing the code for the algorithm.
    ///
    /// The code is position dependent on `load_address`. The first word is
    /// expected to be the return trap (`bkpt`) the routines return into.
    #[serde(serialize_with = "hex_words")]
    pub instructions: Vec<u32>,
    /// Address of the `Init()` entry point. Optional.
    #[serde(default, serialize_with = "hex_option")]
    pub pc_init: Option<u64>,
    /// Address of the `UnInit()` entry point. Optional.
    #[serde(default, serialize_with = "hex_option")]
    pub pc_uninit: Option<u64>,
    /// Address of the `ProgramPage()` entry point.
    #[serde(serialize_with = "hex_u_int")]
    pub pc_program_page: u64,
    /// Address of the `EraseSector()` entry point.
    #[serde(serialize_with = "hex_u_int")]
    pub pc_erase_sector: u64,
    /// Address of the `EraseAll()` entry point. Optional.
    ///
    /// Vendor data frequently encodes "not supported" as `0xFFFF_FFFF` or as a
    /// value outside of the 32-bit address space.
    #[serde(default, serialize_with = "hex_option")]
    pub pc_erase_all: Option<u64>,
    /// Initial value of the static base register when calling the algorithm.
    #[serde(serialize_with = "hex_u_int")]
    pub static_base: u64,
    /// Initial value of the stack pointer. The stack grows down towards `end_stack`.
    #[serde(serialize_with = "hex_u_int")]
    pub begin_stack: u64,
    /// Lowest address the algorithm stack may reach.
    #[serde(serialize_with = "hex_u_int")]
    pub end_stack: u64,
    /// Base address of the single page buffer, used when `page_buffers` is empty.
    #[serde(default, serialize_with = "hex_option")]
    pub begin_data: Option<u64>,
    /// Base addresses of the page buffers. With two buffers, double buffered
    /// programming is used.
    #[serde(default)]
    pub page_buffers: Vec<u64>,
    /// Whether the CRC32 analyzer can be used with this algorithm.
    #[serde(default)]
    pub analyzer_supported: bool,
    /// RAM address the CRC32 analyzer is loaded to.
    #[serde(default, serialize_with = "hex_option")]
    pub analyzer_address: Option<u64>,
    /// The properties of the flash serviced by this algorithm.
    pub flash_properties: FlashProperties,
}

/// Properties of the flash serviced by a flash algorithm.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FlashProperties {
    /// The address range of the flash (`flash_start..flash_start + flash_size`).
    #[serde(serialize_with = "hex_range")]
    pub address_range: Range<u64>,
    /// The page size of the flash.
    #[serde(serialize_with = "hex_u_int")]
    pub page_size: u32,
    /// The smallest number of bytes `ProgramPage()` accepts. Defaults to the page size.
    #[serde(default, serialize_with = "hex_option")]
    pub min_program_length: Option<u32>,
    /// The value of a byte in flash that was just erased.
    #[serde(default = "default_erased_byte_value", serialize_with = "hex_u_int")]
    pub erased_byte_value: u8,
    /// Time in milliseconds after which a page program call is considered hung.
    #[serde(default = "default_program_page_timeout")]
    pub program_page_timeout: u32,
    /// Time in milliseconds after which a sector erase call is considered hung.
    #[serde(default = "default_erase_sector_timeout")]
    pub erase_sector_timeout: u32,
    /// The erase granularity of the flash, by offset from the start of the flash.
    #[serde(default)]
    pub sectors: Vec<SectorDescription>,
}

fn default_erased_byte_value() -> u8 {
    0xFF
}

fn default_program_page_timeout() -> u32 {
    1000
}

fn default_erase_sector_timeout() -> u32 {
    2000
}

impl Default for FlashProperties {
    fn default() -> Self {
        FlashProperties {
            address_range: 0..0,
            page_size: 0,
            min_program_length: None,
            erased_byte_value: default_erased_byte_value(),
            program_page_timeout: default_program_page_timeout(),
            erase_sector_timeout: default_erase_sector_timeout(),
            sectors: vec![],
        }
    }
}
