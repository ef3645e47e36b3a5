use std::fmt::{Debug, Formatter};
use std::ops::Range;

use super::{FlashAlgorithm, FlashError};
use crate::config::{MemoryRange, SectorInfo};

/// The description of a page in flash.
#[derive(Clone, PartialEq, Eq)]
pub struct FlashPage {
    address: u64,
    data: Vec<u8>,
}

impl Debug for FlashPage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlashPage")
            .field("address", &format_args!("{:#010x}", self.address))
            .field("size", &format_args!("{:#x}", self.size()))
            .finish()
    }
}

impl FlashPage {
    /// Creates a page write of `data` at `address`.
    pub fn new(address: u64, data: Vec<u8>) -> Self {
        Self { address, data }
    }

    /// Returns the start address of the page.
    pub fn address(&self) -> u64 {
        self.address
    }

    /// Returns the size of the page in bytes.
    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }

    /// Returns the data slice of the page.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Returns the mut data slice of the page.
    pub(super) fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// The address range covered by the page.
    pub fn address_range(&self) -> Range<u64> {
        self.address..self.address + self.data.len() as u64
    }
}

/// The description of a sector in flash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashSector {
    address: u64,
    size: u64,
}

impl FlashSector {
    /// Returns the start address of the sector.
    pub fn address(&self) -> u64 {
        self.address
    }

    /// Returns the size of the sector in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The address range covered by the sector.
    pub fn address_range(&self) -> Range<u64> {
        self.address..self.address + self.size
    }
}

impl From<SectorInfo> for FlashSector {
    fn from(info: SectorInfo) -> Self {
        Self {
            address: info.base_address,
            size: info.size,
        }
    }
}

/// A struct to hold all the information about one region
/// in the flash that is erased during flashing and has to be restored to its original value afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashFill {
    address: u64,
    size: u64,
    page_index: usize,
}

impl FlashFill {
    /// Returns the start address of the fill.
    pub fn address(&self) -> u64 {
        self.address
    }

    /// Returns the size of the fill in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns the corresponding page index of the fill.
    pub fn page_index(&self) -> usize {
        self.page_index
    }
}

/// The built layout of the data in flash.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FlashLayout {
    pub(crate) sectors: Vec<FlashSector>,
    pub(crate) pages: Vec<FlashPage>,
    pub(crate) fills: Vec<FlashFill>,
}

impl FlashLayout {
    /// Get the sectors of the flash layout.
    pub fn sectors(&self) -> &[FlashSector] {
        &self.sectors
    }

    /// Get the pages of the flash layout.
    pub fn pages(&self) -> &[FlashPage] {
        &self.pages
    }

    /// Get the fills of the flash layout.
    pub fn fills(&self) -> &[FlashFill] {
        &self.fills
    }
}

/// A block of data that is to be written to flash.
#[derive(Clone, PartialEq, Eq)]
pub(super) struct FlashDataBlock {
    address: u64,
    data: Vec<u8>,
}

impl FlashDataBlock {
    fn range(&self) -> Range<u64> {
        self.address..self.address + self.data.len() as u64
    }
}

/// A helper structure to build a flash layout from a set of data blocks.
#[derive(Default)]
pub(super) struct FlashBuilder {
    data_blocks: Vec<FlashDataBlock>,
}

impl FlashBuilder {
    /// Creates a new `FlashBuilder` with empty data.
    pub(super) fn new() -> Self {
        Self::default()
    }

    /// Add a block of data to be programmed.
    ///
    /// Programming does not start until the `program` method is called.
    pub(super) fn add_data(&mut self, address: u64, data: &[u8]) -> Result<(), FlashError> {
        if data.is_empty() {
            return Ok(());
        }

        let Some(end) = address.checked_add(data.len() as u64) else {
            return Err(FlashError::invalid_argument(format!(
                "data at {address:#010x} runs past the end of the address space"
            )));
        };
        let range = address..end;
        let position = match self
            .data_blocks
            .binary_search_by_key(&address, |block| block.address)
        {
            Ok(_) => return Err(FlashError::DataOverlap(address)),
            Err(position) => position,
        };

        // Blocks are sorted, so only the direct neighbours can overlap.
        let previous = position.checked_sub(1).and_then(|p| self.data_blocks.get(p));
        let next = self.data_blocks.get(position);
        if [previous, next]
            .into_iter()
            .flatten()
            .any(|block| block.range().intersects_range(&range))
        {
            return Err(FlashError::DataOverlap(address));
        }

        self.data_blocks.insert(
            position,
            FlashDataBlock {
                address,
                data: data.to_vec(),
            },
        );

        Ok(())
    }

    /// Iterate over all data chunks which intersect `range`, clipped to it.
    pub(super) fn data_in_range<'s>(
        &'s self,
        range: &'s Range<u64>,
    ) -> impl Iterator<Item = (u64, &'s [u8])> + 's {
        self.data_blocks
            .iter()
            .filter(move |block| block.range().intersects_range(range))
            .map(move |block| {
                let start = block.address.max(range.start);
                let end = block.range().end.min(range.end);
                let offset = (start - block.address) as usize;
                (start, &block.data[offset..offset + (end - start) as usize])
            })
    }

    /// Returns true if any data lies in `range`.
    pub(super) fn has_data_in_range(&self, range: &Range<u64>) -> bool {
        self.data_in_range(range).next().is_some()
    }

    /// Layouts the data in `range` onto the flash.
    ///
    /// Every sector touched by the data is erased. Pages carrying data are
    /// padded with the erased byte value. If `restore_unwritten_bytes` is
    /// `true`, every page of a touched sector is programmed and all bytes not
    /// covered by the data are listed as fills, to be read from the flash
    /// before erasing.
    pub(super) fn build_sectors_and_pages(
        &self,
        range: &Range<u64>,
        flash_algorithm: &FlashAlgorithm,
        restore_unwritten_bytes: bool,
    ) -> Result<FlashLayout, FlashError> {
        let mut layout = FlashLayout::default();
        let chunks = self.data_in_range(range).collect::<Vec<_>>();

        for &(address, data) in &chunks {
            let end = address + data.len() as u64;
            let mut current = address;
            while current < end {
                let sector = flash_algorithm.sector_info(current).ok_or_else(|| {
                    FlashError::invalid_argument(format!(
                        "address {current:#010x} is outside of the flash of '{}'",
                        flash_algorithm.name
                    ))
                })?;
                if layout.sectors.last().map(FlashSector::address) != Some(sector.base_address) {
                    tracing::trace!(
                        "Added Sector ({:#010x}..{:#010x})",
                        sector.base_address,
                        sector.base_address + sector.size
                    );
                    layout.sectors.push(sector.into());
                }
                current = sector.base_address + sector.size;
            }
        }

        let page_size = u64::from(flash_algorithm.page_size());
        for sector in &layout.sectors {
            for page_address in sector.address_range().step_by(page_size as usize) {
                let page_range = page_address..page_address + page_size;
                let mut page = FlashPage::new(
                    page_address,
                    vec![flash_algorithm.erased_byte_value(); page_size as usize],
                );

                // Offsets into the page which are covered by data.
                let mut covered = Vec::new();
                for &(address, data) in &chunks {
                    let chunk = address..address + data.len() as u64;
                    if !chunk.intersects_range(&page_range) {
                        continue;
                    }
                    let start = chunk.start.max(page_range.start);
                    let end = chunk.end.min(page_range.end);
                    let source = (start - address) as usize..(end - address) as usize;
                    let target = (start - page_address) as usize..(end - page_address) as usize;
                    page.data[target.clone()].copy_from_slice(&data[source]);
                    covered.push(target);
                }

                if covered.is_empty() && !restore_unwritten_bytes {
                    continue;
                }

                if restore_unwritten_bytes {
                    let page_index = layout.pages.len();
                    let mut offset = 0;
                    for gap_end in covered
                        .iter()
                        .map(|range| range.start)
                        .chain([page_size as usize])
                    {
                        if gap_end > offset {
                            layout.fills.push(FlashFill {
                                address: page_address + offset as u64,
                                size: (gap_end - offset) as u64,
                                page_index,
                            });
                        }
                        if let Some(range) = covered.iter().find(|range| range.start == gap_end) {
                            offset = range.end;
                        }
                    }
                }

                tracing::trace!(
                    "Added Page ({:#010x}..{:#010x})",
                    page_range.start,
                    page_range.end
                );
                layout.pages.push(page);
            }
        }

        Ok(layout)
    }
}
