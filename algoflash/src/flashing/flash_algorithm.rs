use super::{DescriptorError, FlashError};
use crate::config::{FlashProperties, MemoryRange, PageInfo, RawFlashAlgorithm, SectorInfo};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::ops::Range;

/// Bytes of RAM reserved for the CRC32 analyzer.
pub const ANALYZER_SIZE: u64 = 0x600;

/// A validated flash algorithm.
///
/// Built from a [`RawFlashAlgorithm`] by [`FlashAlgorithm::assemble_from_raw`].
/// Every value in here has been checked to be consistent, so the flashing
/// code can rely on the geometry without checking it again.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FlashAlgorithm {
    /// The name of the flash algorithm.
    pub name: String,
    /// Memory address where the flash algorithm instructions will be loaded to.
    pub load_address: u64,
    /// List of 32-bit words containing the code for the algorithm.
    pub instructions: Vec<u32>,
    /// Address of the `Init()` entry point, if supported.
    pub pc_init: Option<u64>,
    /// Address of the `UnInit()` entry point, if supported.
    pub pc_uninit: Option<u64>,
    /// Address of the `ProgramPage()` entry point.
    pub pc_program_page: u64,
    /// Address of the `EraseSector()` entry point.
    pub pc_erase_sector: u64,
    /// Address of the `EraseAll()` entry point, if supported.
    pub pc_erase_all: Option<u64>,
    /// Initial value of the static base register.
    pub static_base: u64,
    /// Initial value of the stack pointer.
    pub begin_stack: u64,
    /// Lowest address of the stack.
    pub end_stack: u64,
    /// One or two page buffers. Each holds `page_size` bytes.
    pub page_buffers: Vec<u64>,
    /// Location of the CRC32 analyzer, if the algorithm supports it.
    pub analyzer_address: Option<u64>,
    /// The properties of the flash on the device.
    pub flash_properties: FlashProperties,
}

/// Entry points above the 32 bit address space or at `0xFFFF_FFFF` mean "not implemented".
fn canonical_entry_point(address: Option<u64>) -> Option<u64> {
    address.filter(|&address| address < u64::from(u32::MAX))
}

impl FlashAlgorithm {
    /// Validates a raw algorithm description.
    ///
    /// This does not touch the target.
    pub fn assemble_from_raw(raw: &RawFlashAlgorithm) -> Result<Self, FlashError> {
        Self::validate(raw).map_err(|reason| FlashError::InvalidDescriptor {
            name: raw.name.clone(),
            reason,
        })
    }

    fn validate(raw: &RawFlashAlgorithm) -> Result<Self, DescriptorError> {
        if raw.instructions.is_empty() {
            return Err(DescriptorError::EmptyInstructions);
        }

        if raw.begin_stack <= raw.end_stack {
            return Err(DescriptorError::InvertedStack {
                begin: raw.begin_stack,
                end: raw.end_stack,
            });
        }

        let mut flash_properties = raw.flash_properties.clone();
        let page_size = flash_properties.page_size;
        if page_size == 0 || page_size % 4 != 0 {
            return Err(DescriptorError::InvalidPageSize(page_size));
        }

        let min_program_length = flash_properties.min_program_length.unwrap_or(page_size);
        if min_program_length == 0 || page_size % min_program_length != 0 {
            return Err(DescriptorError::InvalidMinProgramLength {
                page_size,
                min_program_length,
            });
        }
        flash_properties.min_program_length = Some(min_program_length);

        let flash_range = flash_properties.address_range.clone();
        if flash_range.is_empty() || flash_range.end > 1 << 32 {
            return Err(DescriptorError::InvalidFlashRange(flash_range));
        }
        if flash_range.start % u64::from(page_size) != 0 {
            return Err(DescriptorError::UnalignedFlashStart(flash_range.start));
        }

        Self::validate_sectors(&flash_properties)?;

        let load_address = raw.load_address;
        let ram_addresses = [
            ("load address", Some(load_address)),
            ("static base", Some(raw.static_base)),
            ("stack", Some(raw.begin_stack)),
            ("data", raw.begin_data),
            ("analyzer", raw.analyzer_address),
        ]
        .into_iter()
        .chain(raw.page_buffers.iter().map(|&buffer| ("page buffer", Some(buffer))));
        for (area, address) in ram_addresses {
            if let Some(address) = address.filter(|&address| address > u64::from(u32::MAX)) {
                return Err(DescriptorError::AddressOutOfRange { area, address });
            }
        }

        let image = load_address..load_address + raw.instructions.len() as u64 * 4;

        let required = |routine: &'static str, address: u64| {
            canonical_entry_point(Some(address)).ok_or(DescriptorError::MissingEntryPoint(routine))
        };
        let pc_program_page = required("program_page", raw.pc_program_page)?;
        let pc_erase_sector = required("erase_sector", raw.pc_erase_sector)?;
        let pc_init = canonical_entry_point(raw.pc_init);
        let pc_uninit = canonical_entry_point(raw.pc_uninit);
        let pc_erase_all = canonical_entry_point(raw.pc_erase_all);

        for (routine, address) in [
            ("init", pc_init),
            ("uninit", pc_uninit),
            ("program_page", Some(pc_program_page)),
            ("erase_sector", Some(pc_erase_sector)),
            ("erase_all", pc_erase_all),
        ] {
            if let Some(address) = address {
                // Bit 0 only selects the Thumb state.
                if !image.contains(&(address & !1)) {
                    return Err(DescriptorError::EntryPointOutsideImage { routine, address });
                }
            }
        }

        let page_buffers = if !raw.page_buffers.is_empty() {
            raw.page_buffers.clone()
        } else if let Some(begin_data) = raw.begin_data {
            vec![begin_data]
        } else {
            return Err(DescriptorError::NoPageBuffer);
        };
        if page_buffers.len() > 2 {
            return Err(DescriptorError::TooManyPageBuffers(page_buffers.len()));
        }

        let analyzer_address = match (raw.analyzer_supported, raw.analyzer_address) {
            (false, _) => None,
            (true, Some(address)) => Some(address),
            (true, None) => return Err(DescriptorError::MissingAnalyzerAddress),
        };

        let algorithm = FlashAlgorithm {
            name: raw.name.clone(),
            load_address,
            instructions: raw.instructions.clone(),
            pc_init,
            pc_uninit,
            pc_program_page,
            pc_erase_sector,
            pc_erase_all,
            static_base: raw.static_base,
            begin_stack: raw.begin_stack,
            end_stack: raw.end_stack,
            page_buffers,
            analyzer_address,
            flash_properties,
        };

        let areas = algorithm.ram_areas();
        for (index, (first, first_range)) in areas.iter().enumerate() {
            for (second, second_range) in &areas[index + 1..] {
                if first_range.intersects_range(second_range) {
                    return Err(DescriptorError::OverlappingRam {
                        first: *first,
                        first_range: first_range.clone(),
                        second: *second,
                        second_range: second_range.clone(),
                    });
                }
            }
        }

        Ok(algorithm)
    }

    fn validate_sectors(properties: &FlashProperties) -> Result<(), DescriptorError> {
        let flash_size = properties.address_range.end - properties.address_range.start;
        let page_size = u64::from(properties.page_size);
        let sectors = &properties.sectors;

        let first = sectors.first().ok_or(DescriptorError::NoSectors)?;
        if first.address != 0 {
            return Err(DescriptorError::FirstSectorNotAtStart(first.address));
        }

        for (index, group) in sectors.iter().enumerate() {
            if group.size == 0 || group.size % page_size != 0 {
                return Err(DescriptorError::InvalidSectorSize {
                    offset: group.address,
                    size: group.size,
                });
            }

            let end = match sectors.get(index + 1) {
                Some(next) if next.address > group.address && next.address < flash_size => {
                    next.address
                }
                Some(next) => return Err(DescriptorError::UnorderedSectors(next.address)),
                None => flash_size,
            };

            if (end - group.address) % group.size != 0 {
                return Err(DescriptorError::PartialSectorGroup {
                    offset: group.address,
                    size: group.size,
                });
            }
        }

        Ok(())
    }

    /// Checks that every RAM area the algorithm uses lies inside one of the given RAM ranges.
    pub fn ensure_in_ram(&self, ram: &[Range<u64>]) -> Result<(), FlashError> {
        for (area, range) in self.ram_areas() {
            if !ram.iter().any(|ram| ram.contains_range(&range)) {
                return Err(FlashError::InvalidDescriptor {
                    name: self.name.clone(),
                    reason: DescriptorError::OutsideRam { area, range },
                });
            }
        }
        Ok(())
    }

    /// All RAM areas used while the algorithm runs.
    pub fn ram_areas(&self) -> Vec<(&'static str, Range<u64>)> {
        let page_size = u64::from(self.flash_properties.page_size);
        let mut areas = vec![
            ("algorithm image", self.image_range()),
            ("stack", self.end_stack..self.begin_stack),
        ];
        areas.extend(
            self.page_buffers
                .iter()
                .map(|&buffer| ("page buffer", buffer..buffer + page_size)),
        );
        if let Some(analyzer) = self.analyzer_address {
            areas.push(("analyzer", analyzer..analyzer + ANALYZER_SIZE));
        }
        areas
    }

    /// The RAM occupied by the algorithm code.
    pub fn image_range(&self) -> Range<u64> {
        self.load_address..self.load_address + self.instructions.len() as u64 * 4
    }

    /// Identifies the code loaded into RAM. Equal fingerprints mean equal RAM contents after loading.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.load_address.hash(&mut hasher);
        self.instructions.hash(&mut hasher);
        self.analyzer_address.hash(&mut hasher);
        hasher.finish()
    }

    /// The flash range this algorithm services.
    pub fn flash_range(&self) -> Range<u64> {
        self.flash_properties.address_range.clone()
    }

    /// The program unit of the flash.
    pub fn page_size(&self) -> u32 {
        self.flash_properties.page_size
    }

    /// The smallest write `ProgramPage()` accepts.
    pub fn min_program_length(&self) -> u32 {
        self.flash_properties
            .min_program_length
            .unwrap_or(self.flash_properties.page_size)
    }

    /// The value of erased flash bytes.
    pub fn erased_byte_value(&self) -> u8 {
        self.flash_properties.erased_byte_value
    }

    /// Returns `true` if the algorithm declares two page buffers.
    pub fn double_buffering_supported(&self) -> bool {
        self.page_buffers.len() > 1
    }

    /// Try to retrieve the information about the flash sector
    /// which contains `address`.
    ///
    /// If the `address` is not part of the flash, None will
    /// be returned.
    pub fn sector_info(&self, address: u64) -> Option<SectorInfo> {
        let range = &self.flash_properties.address_range;
        if !range.contains(&address) {
            tracing::trace!("Address {:#010x} not contained in this flash device", address);
            return None;
        }

        let offset = address - range.start;
        let group = self
            .flash_properties
            .sectors
            .iter()
            .rev()
            .find(|group| group.address <= offset)?;

        let index = (offset - group.address) / group.size;
        Some(SectorInfo {
            base_address: range.start + group.address + index * group.size,
            size: group.size,
        })
    }

    /// Returns the necessary information about the page which `address` resides in
    /// if the address is inside the flash region.
    pub fn page_info(&self, address: u64) -> Option<PageInfo> {
        let range = &self.flash_properties.address_range;
        if !range.contains(&address) {
            return None;
        }

        let page_size = u64::from(self.flash_properties.page_size);
        Some(PageInfo {
            base_address: range.start + (address - range.start) / page_size * page_size,
            size: self.flash_properties.page_size,
        })
    }

    /// Iterate over all the sectors of the flash.
    pub fn iter_sectors(&self) -> impl Iterator<Item = SectorInfo> + '_ {
        let mut address = self.flash_properties.address_range.start;
        std::iter::from_fn(move || {
            let sector = self.sector_info(address)?;
            address = sector.base_address + sector.size;
            Some(sector)
        })
    }

    /// Returns true if the entire contents of the argument array equal the erased byte value.
    pub fn is_erased(&self, data: &[u8]) -> bool {
        let erased = self.erased_byte_value();
        data.iter().all(|&byte| byte == erased)
    }
}
