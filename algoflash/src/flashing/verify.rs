use super::flasher::{ActiveFlasher, Verify};
use super::loader::{covering_nvm_regions, data_range, execute, plan_algorithm, RegionPlan};
use super::{
    DownloadOptions, FlashError, FlashFailure, FlashPage, FlashReport, Flasher, RegionFailure,
    RegionReport,
};
use crate::session::Session;
use std::time::Duration;

/// CRC32 analyzer. Computes the IEEE CRC32 of a list of flash ranges on the target.
///
/// Called with a pointer to a table of `log2(size) | (address / size) << 16`
/// words and the number of entries. Each entry is replaced by the CRC of its range.
pub(crate) const ANALYZER: [u32; 49] = [
    0x2780_b5f0,
    0x2500_4684,
    0x4e2b_2401,
    0x447e_4a2b,
    0x0023_007f,
    0x425b_402b,
    0x4013_0868,
    0x0858_4043,
    0x425b_4023,
    0x4058_4013,
    0x4020_0843,
    0x4010_4240,
    0x0843_4058,
    0x4240_4020,
    0x4058_4010,
    0x4020_0843,
    0x4010_4240,
    0x0843_4058,
    0x4240_4020,
    0x4058_4010,
    0x4020_0843,
    0x4010_4240,
    0x0858_4043,
    0x425b_4023,
    0x4043_4013,
    0xc608_3501,
    0xd1d2_42bd,
    0xd01f_2900,
    0x4660_2301,
    0x469c_25ff,
    0x0089_4e11,
    0x447e_1841,
    0x8803_4667,
    0x409f_8844,
    0x2f00_409c,
    0x2201_d012,
    0x4252_193f,
    0x3401_7823,
    0x402b_4053,
    0x599b_009b,
    0x405a_0a12,
    0xd1f5_42bc,
    0xc004_43d2,
    0xd1e7_4281,
    0xbdf0_2000,
    0xe7f8_2200,
    0x0000_00b2,
    0xedb8_8320,
    0x0000_0042,
];

const ANALYZER_TIMEOUT: Duration = Duration::from_secs(5);

/// Returns the analyzer table entry for `size` bytes at `address`, if the analyzer can process the range.
///
/// The analyzer only handles power of two sizes at size aligned addresses,
/// with a block index below `0x10000`.
pub(super) fn analyzer_entry(address: u64, size: u32) -> Option<u32> {
    if !size.is_power_of_two() {
        return None;
    }
    let size = u64::from(size);
    if address % size != 0 {
        return None;
    }
    let index = address / size;
    if index >= 0x1_0000 {
        return None;
    }
    Some(size.trailing_zeros() | (index as u32) << 16)
}

impl ActiveFlasher<'_, Verify> {
    /// Compute the CRC32 of every `(address, size)` range on the target.
    ///
    /// All ranges must be accepted by [`analyzer_entry`] and the table must fit into the first page buffer.
    fn compute_crcs(
        &mut self,
        analyzer_address: u64,
        ranges: &[(u64, u32)],
    ) -> Result<Vec<u32>, FlashError> {
        let Some(&table_address) = self.flash_algorithm().page_buffers.first() else {
            return Err(FlashError::invalid_argument("no page buffer for the analyzer table"));
        };

        let table = ranges
            .iter()
            .map(|&(address, size)| {
                analyzer_entry(address, size).ok_or_else(|| {
                    FlashError::invalid_argument(format!(
                        "range {address:#010x}+{size:#x} can not be checked by the analyzer"
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        self.session()
            .with_core(|core| core.write_32(table_address, &table))?;
        self.run_analyzer(analyzer_address, table_address, table.len(), ANALYZER_TIMEOUT)?;

        let mut crcs = vec![0; table.len()];
        self.session()
            .with_core(|core| core.read_32(table_address, &mut crcs))?;
        Ok(crcs)
    }
}

impl Flasher<'_> {
    /// Compare `pages` against the current flash contents.
    ///
    /// Returns one entry per page, `true` if the flash holds exactly the page
    /// data. Pages the analyzer can handle are compared by CRC32, all others by reading them back.
    pub(super) fn compare_pages(&mut self, pages: &[FlashPage]) -> Result<Vec<bool>, FlashError> {
        let algo = self.flash_algorithm();
        let analyzer_address = algo.analyzer_address;
        let batch_size = (algo.page_size() / 4).max(1) as usize;

        if let Some(first) = pages.first() {
            self.set_position(first.address());
        }
        self.run_verify(|active| {
            let mut unchanged = vec![false; pages.len()];
            let mut by_crc = Vec::new();

            for (index, page) in pages.iter().enumerate() {
                if analyzer_address.is_some()
                    && analyzer_entry(page.address(), page.size()).is_some()
                {
                    by_crc.push(index);
                    continue;
                }

                active.at(page.address());
                let mut actual = vec![0; page.data().len()];
                active.read(page.address(), &mut actual)?;
                unchanged[index] = actual == page.data();
            }

            if let Some(analyzer_address) = analyzer_address {
                if by_crc.len() < pages.len() {
                    tracing::warn!(
                        "{} pages can not be checked by the analyzer, reading them back instead.",
                        pages.len() - by_crc.len()
                    );
                }

                for batch in by_crc.chunks(batch_size) {
                    let ranges = batch
                        .iter()
                        .map(|&index| (pages[index].address(), pages[index].size()))
                        .collect::<Vec<_>>();
                    active.at(ranges[0].0);
                    let crcs = active.compute_crcs(analyzer_address, &ranges)?;

                    for (&index, crc) in batch.iter().zip(crcs) {
                        unchanged[index] = crc == crc::crc32::checksum_ieee(pages[index].data());
                    }
                }
            }

            Ok(unchanged)
        })
    }

    /// Check that the flash holds `pages`.
    ///
    /// Fails with [`FlashError::VerifyMismatch`] at the first differing byte.
    /// The flash is never modified.
    pub fn verify(&mut self, pages: &[FlashPage]) -> Result<(), FlashError> {
        let unchanged = self.compare_pages(pages)?;

        let Some(index) = unchanged.iter().position(|equal| !equal) else {
            return Ok(());
        };

        let page = &pages[index];
        self.set_position(page.address());
        let mut actual = vec![0; page.data().len()];
        self.run_verify(|active| active.read(page.address(), &mut actual))?;

        let offset = page
            .data()
            .iter()
            .zip(&actual)
            .position(|(expected, actual)| expected != actual)
            .unwrap_or_default();
        let address = page.address() + offset as u64;

        tracing::warn!("Verification failed at {:#010x}", address);
        Err(FlashError::VerifyMismatch { address })
    }

    pub(super) fn verify_into(
        &mut self,
        pages: &[FlashPage],
        report: &mut RegionReport,
    ) -> Result<(), FlashError> {
        self.progress().started_verifying();
        let result = self.verify(pages);
        self.progress().finished_verifying(result.is_ok());

        if result.is_ok() {
            report.bytes_verified += pages
                .iter()
                .map(|page| page.data().len() as u64)
                .sum::<u64>();
        }
        result
    }
}

/// Split `data` at `address` into chunks which do not cross a page boundary.
fn split_into_pages(
    page_size: u32,
    flash_start: u64,
    address: u64,
    data: &[u8],
) -> Vec<FlashPage> {
    let page_size = u64::from(page_size);
    let mut pages = Vec::new();
    let mut offset = 0;

    while offset < data.len() {
        let current = address + offset as u64;
        let page_end = flash_start + ((current - flash_start) / page_size + 1) * page_size;
        let length = ((page_end - current) as usize).min(data.len() - offset);
        pages.push(FlashPage::new(current, data[offset..offset + length].to_vec()));
        offset += length;
    }

    pages
}

/// Compare the flash contents at `address` with `expected`.
///
/// Only the given bytes are compared, the rest of their pages is ignored.
/// The range may span several contiguous flash regions.
pub fn verify(
    session: &mut Session,
    address: u64,
    expected: &[u8],
    options: &DownloadOptions,
) -> Result<FlashReport, FlashFailure> {
    let target = session.target().clone();
    let range = data_range(address, expected.len(), &target.source).map_err(|error| {
        FlashFailure::new(
            FlashReport::default(),
            RegionFailure::outside_regions(address..u64::MAX, error),
        )
    })?;

    let regions = covering_nvm_regions(&target.memory_map, &range, &target.source).map_err(
        |error| {
            FlashFailure::new(
                FlashReport::default(),
                RegionFailure::outside_regions(range.clone(), error),
            )
        },
    )?;

    let mut plans = Vec::new();
    for region in regions {
        let algorithm = plan_algorithm(&target, region).map_err(|error| {
            FlashFailure::new(FlashReport::default(), RegionFailure::new(region, error))
        })?;

        let start = range.start.max(region.range.start);
        let end = range.end.min(region.range.end);
        let data = &expected[(start - address) as usize..(end - address) as usize];
        let pages = split_into_pages(
            algorithm.page_size(),
            algorithm.flash_range().start,
            start,
            data,
        );

        plans.push(RegionPlan {
            region: region.clone(),
            algorithm,
            work: pages,
        });
    }

    execute(session, options, plans, |flasher, pages: Vec<FlashPage>, report| {
        flasher.verify_into(&pages, report)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(0x0, 0x400 => Some(10); "first page")]
    #[test_case(0x800, 0x400 => Some(10 | 2 << 16); "third page")]
    #[test_case(0x7_FC00, 0x400 => Some(10 | 0x1FF << 16); "last main flash page")]
    #[test_case(0x40_0000, 0x40 => None; "index too large")]
    #[test_case(0x810, 0x400 => None; "unaligned")]
    #[test_case(0x0, 0x300 => None; "not a power of two")]
    fn analyzer_entries(address: u64, size: u32) -> Option<u32> {
        analyzer_entry(address, size)
    }

    #[test]
    fn data_is_split_at_page_boundaries() {
        let pages = split_into_pages(0x40, 0x40_0000, 0x40_0030, &[7; 0x60]);

        let layout = pages
            .iter()
            .map(|page| (page.address(), page.size()))
            .collect::<Vec<_>>();
        assert_eq!(
            layout,
            vec![(0x40_0030, 0x10), (0x40_0040, 0x40), (0x40_0080, 0x10)]
        );
    }
}
