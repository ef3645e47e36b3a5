use super::loader::{covering_nvm_regions, execute, plan_algorithm, RegionPlan};
use super::{
    DownloadOptions, FlashAlgorithm, FlashError, FlashFailure, FlashReport, FlashSector, Flasher,
    RegionFailure, RegionReport,
};
use crate::config::SectorInfo;
use crate::session::Session;
use std::ops::Range;

impl FlashAlgorithm {
    /// The sectors which have to be erased to erase `range`.
    ///
    /// Every sector intersecting the range is returned once, in ascending
    /// order. Sectors are never split or merged, so the erased area is the
    /// range rounded out to sector boundaries. An empty range needs no sectors.
    pub fn plan_erase(&self, range: Range<u64>) -> Result<Vec<SectorInfo>, FlashError> {
        if range.is_empty() {
            return Ok(Vec::new());
        }

        let flash = self.flash_range();
        if range.start < flash.start || range.end > flash.end {
            return Err(FlashError::invalid_argument(format!(
                "erase range {:#010x}..{:#010x} is outside of the flash {:#010x}..{:#010x}",
                range.start, range.end, flash.start, flash.end
            )));
        }

        let mut sectors = Vec::new();
        let mut address = range.start;
        while address < range.end {
            let Some(sector) = self.sector_info(address) else {
                return Err(FlashError::invalid_argument(format!(
                    "no sector contains {address:#010x}"
                )));
            };
            address = sector.base_address + sector.size;
            sectors.push(sector);
        }

        Ok(sectors)
    }
}

impl Flasher<'_> {
    /// Erase all sectors intersecting `range`.
    pub fn erase_range(&mut self, range: Range<u64>) -> Result<(), FlashError> {
        self.erase_range_into(range, &mut RegionReport::default())
    }

    pub(super) fn erase_range_into(
        &mut self,
        range: Range<u64>,
        report: &mut RegionReport,
    ) -> Result<(), FlashError> {
        let sectors = self
            .flash_algorithm()
            .plan_erase(range)?
            .into_iter()
            .map(FlashSector::from)
            .collect::<Vec<_>>();

        self.sector_erase(&sectors, report)
    }

    /// Erase the whole flash with the algorithm's `EraseAll()`.
    ///
    /// Fails with [`FlashError::UnsupportedOperation`] without touching the
    /// target if the algorithm has no chip erase.
    pub fn erase_all(&mut self) -> Result<(), FlashError> {
        self.run_erase_all(&mut RegionReport::default())
    }
}

/// Erase the flash sectors intersecting `range`.
///
/// The range may span several contiguous flash regions, but every address
/// in it must be flash. Sector boundaries are rounded out, so more than
/// `range` may be erased.
pub fn erase(
    session: &mut Session,
    range: Range<u64>,
    options: &DownloadOptions,
) -> Result<FlashReport, FlashFailure> {
    let target = session.target().clone();

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
        let subrange = range.start.max(region.range.start)..range.end.min(region.range.end);
        let planned = plan_algorithm(&target, region).and_then(|algorithm| {
            // Catch geometry errors before the first region is touched.
            algorithm.plan_erase(subrange.clone())?;
            Ok(algorithm)
        });

        match planned {
            Ok(algorithm) => plans.push(RegionPlan {
                region: region.clone(),
                algorithm,
                work: subrange,
            }),
            Err(error) => {
                return Err(FlashFailure::new(
                    FlashReport::default(),
                    RegionFailure::new(region, error),
                ))
            }
        }
    }

    execute(session, options, plans, |flasher, subrange, report| {
        flasher.erase_range_into(subrange, report)
    })
}

/// Erase every flash region of the target.
///
/// Regions whose algorithm implements `EraseAll()` are chip erased, all others
/// are erased sector by sector.
pub fn erase_all(
    session: &mut Session,
    options: &DownloadOptions,
) -> Result<FlashReport, FlashFailure> {
    let target = session.target().clone();

    let mut plans = Vec::new();
    for region in target.nvm_regions() {
        let algorithm = plan_algorithm(&target, region).map_err(|error| {
            FlashFailure::new(FlashReport::default(), RegionFailure::new(region, error))
        })?;
        plans.push(RegionPlan {
            region: region.clone(),
            algorithm,
            work: region.range.clone(),
        });
    }

    execute(session, options, plans, |flasher, range, report| {
        if flasher.is_chip_erase_supported() {
            flasher.run_erase_all(report)
        } else {
            tracing::debug!(
                "'{}' has no chip erase, erasing sector by sector.",
                flasher.flash_algorithm().name
            );
            flasher.erase_range_into(range, report)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FlashProperties, RawFlashAlgorithm, SectorDescription};
    use test_case::test_case;

    fn flash() -> FlashAlgorithm {
        FlashAlgorithm::assemble_from_raw(&RawFlashAlgorithm {
            name: "mixed".to_string(),
            load_address: 0x2000_0000,
            instructions: vec![0xe7fdbe00; 0x20],
            pc_program_page: 0x2000_0011,
            pc_erase_sector: 0x2000_0021,
            static_base: 0x2000_0080,
            begin_stack: 0x2000_1800,
            end_stack: 0x2000_0800,
            page_buffers: vec![0x2000_2000],
            flash_properties: FlashProperties {
                address_range: 0x800_0000..0x802_0000,
                page_size: 0x400,
                sectors: vec![
                    SectorDescription {
                        address: 0x0,
                        size: 0x4000,
                    },
                    SectorDescription {
                        address: 0x1_0000,
                        size: 0x1_0000,
                    },
                ],
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap()
    }

    fn bases(range: Range<u64>) -> Vec<u64> {
        flash()
            .plan_erase(range)
            .unwrap()
            .into_iter()
            .map(|sector| sector.base_address)
            .collect()
    }

    #[test_case(0x800_0000..0x800_0001 => vec![0x800_0000]; "single byte")]
    #[test_case(0x800_3FFF..0x800_4001 => vec![0x800_0000, 0x800_4000]; "crossing a boundary")]
    #[test_case(0x800_4000..0x800_8000 => vec![0x800_4000]; "exactly one sector")]
    #[test_case(0x800_F000..0x801_0800 => vec![0x800_C000, 0x801_0000]; "into the large sector")]
    #[test_case(0x800_0000..0x800_0000 => Vec::<u64>::new(); "empty")]
    fn planned_sectors(range: Range<u64>) -> Vec<u64> {
        bases(range)
    }

    #[test]
    fn plan_covers_range_rounded_to_sectors() {
        let sectors = flash().plan_erase(0x800_1000..0x801_8000).unwrap();

        let first = sectors.first().unwrap();
        let last = sectors.last().unwrap();
        assert_eq!(first.base_address, 0x800_0000);
        assert_eq!(last.base_address + last.size, 0x802_0000);
        // Contiguous, no gaps and no overlaps.
        for pair in sectors.windows(2) {
            assert_eq!(pair[0].base_address + pair[0].size, pair[1].base_address);
        }
        assert!(sectors.iter().all(|sector| sector.size >= 0x4000));
    }

    #[test]
    fn plan_outside_flash_is_rejected() {
        assert!(matches!(
            flash().plan_erase(0x801_F000..0x802_1000),
            Err(FlashError::InvalidArgument { .. })
        ));
        assert!(matches!(
            flash().plan_erase(0x7FF_FFFF..0x800_0010),
            Err(FlashError::InvalidArgument { .. })
        ));
    }
}
