use super::builder::FlashBuilder;
use super::flasher::check_ram;
use super::{
    DownloadOptions, FailurePolicy, FlashAlgorithm, FlashError, FlashFailure, FlashLayout,
    FlashReport, Flasher, RegionFailure, RegionReport,
};
use crate::config::{
    MemoryRange, MemoryRegion, NvmRegion, RawFlashAlgorithm, Target, TargetDescriptionSource,
};
use crate::session::Session;
use std::ops::Range;

/// `FlashLoader` is a struct which manages the flashing of any chunks of data onto any sections of flash.
///
/// Use [add_data()](FlashLoader::add_data) to add a chunk of data.
/// Once you are done adding all your data, use `commit()` to flash the data.
/// The flash loader will make sure to select the appropriate flash region for the right data chunks.
/// Region crossing data chunks are allowed as long as the regions are contiguous.
pub struct FlashLoader {
    memory_map: Vec<MemoryRegion>,
    builder: FlashBuilder,

    /// Source of the flash description,
    /// used for diagnostics.
    source: TargetDescriptionSource,
}

impl FlashLoader {
    /// Create a new flash loader.
    pub fn new(memory_map: Vec<MemoryRegion>, source: TargetDescriptionSource) -> Self {
        Self {
            memory_map,
            builder: FlashBuilder::new(),
            source,
        }
    }

    /// Stages a chunk of data to be programmed.
    ///
    /// The chunk can cross flash boundaries as long as one flash region connects to another flash region.
    /// Data for RAM, generic memory or unmapped addresses is rejected.
    pub fn add_data(&mut self, address: u64, data: &[u8]) -> Result<(), FlashError> {
        tracing::trace!(
            "Adding data at address {:#010x} with size {} bytes",
            address,
            data.len()
        );

        if data.is_empty() {
            return Ok(());
        }

        let range = data_range(address, data.len(), &self.source)?;
        covering_nvm_regions(&self.memory_map, &range, &self.source)?;

        self.builder.add_data(address, data)
    }

    /// Returns the flash regions which hold staged data, ordered by address.
    pub fn regions_with_data(&self) -> Vec<&NvmRegion> {
        let mut regions = self
            .memory_map
            .iter()
            .filter_map(MemoryRegion::as_nvm_region)
            .filter(|region| self.builder.has_data_in_range(&region.range))
            .collect::<Vec<_>>();
        regions.sort_by_key(|region| region.range.start);
        regions
    }

    /// Returns the flash algorithm which services `region`.
    ///
    /// The algorithm named by the region is used if there is one. Otherwise
    /// the algorithm whose flash range contains the region is chosen,
    /// preferring the default algorithm if several qualify.
    pub fn get_flash_algorithm_for_region<'a>(
        region: &NvmRegion,
        target: &'a Target,
    ) -> Result<&'a RawFlashAlgorithm, FlashError> {
        let not_attached = || FlashError::NoFlashLoaderAlgorithmAttached {
            range: region.range.clone(),
            description_source: target.source.clone(),
        };

        if let Some(name) = &region.algorithm {
            return target.flash_algorithm_by_name(name).ok_or_else(not_attached);
        }

        let algorithms = target
            .flash_algorithms
            .iter()
            .filter(|algorithm| {
                algorithm
                    .flash_properties
                    .address_range
                    .contains_range(&region.range)
            })
            .collect::<Vec<_>>();

        tracing::debug!("Algorithms: {:?}", algorithms.len());

        match algorithms.as_slice() {
            [] => Err(not_attached()),
            [algorithm] => Ok(algorithm),
            _ => algorithms
                .iter()
                .find(|algorithm| algorithm.default)
                .copied()
                .ok_or_else(not_attached),
        }
    }

    /// Writes all the stored data chunks to flash.
    ///
    /// Regions are processed by ascending address. All regions are planned,
    /// and their algorithms validated, before the target is touched.
    pub fn commit(
        &self,
        session: &mut Session,
        options: &DownloadOptions,
    ) -> Result<FlashReport, FlashFailure> {
        tracing::debug!("Committing FlashLoader!");
        let target = session.target().clone();

        let mut plans = Vec::new();
        for region in self.regions_with_data() {
            let plan = plan_algorithm(&target, region).and_then(|algorithm| {
                let layout = self.builder.build_sectors_and_pages(
                    &region.range,
                    &algorithm,
                    options.keep_unwritten_bytes,
                )?;
                Ok((algorithm, layout))
            });

            match plan {
                Ok((algorithm, layout)) => plans.push(RegionPlan {
                    region: region.clone(),
                    algorithm,
                    work: layout,
                }),
                Err(error) => {
                    return Err(FlashFailure::new(
                        FlashReport::default(),
                        RegionFailure::new(region, error),
                    ))
                }
            }
        }

        execute(
            session,
            options,
            plans,
            |flasher, layout: FlashLayout, report| flasher.program(layout, options, report),
        )
    }
}

/// Work on one flash region, ready for execution.
pub(super) struct RegionPlan<W> {
    pub(super) region: NvmRegion,
    pub(super) algorithm: FlashAlgorithm,
    pub(super) work: W,
}

/// The addresses of `len` bytes at `address`.
///
/// Data running past the end of the address space lies in no flash region.
pub(super) fn data_range(
    address: u64,
    len: usize,
    source: &TargetDescriptionSource,
) -> Result<Range<u64>, FlashError> {
    address
        .checked_add(len as u64)
        .map(|end| address..end)
        .ok_or_else(|| FlashError::NoSuitableNvm {
            range: address..u64::MAX,
            description_source: source.clone(),
        })
}

/// The flash regions which together cover `range`, ordered by address.
///
/// Fails unless every address of `range` lies in a flash region.
pub(super) fn covering_nvm_regions<'a>(
    memory_map: &'a [MemoryRegion],
    range: &Range<u64>,
    source: &TargetDescriptionSource,
) -> Result<Vec<&'a NvmRegion>, FlashError> {
    let mut regions = memory_map
        .iter()
        .filter_map(MemoryRegion::as_nvm_region)
        .filter(|region| region.range.intersects_range(range))
        .collect::<Vec<_>>();
    regions.sort_by_key(|region| region.range.start);

    let mut covered_until = range.start;
    for region in &regions {
        if region.range.start > covered_until {
            break;
        }
        covered_until = covered_until.max(region.range.end);
    }

    if range.is_empty() || covered_until < range.end {
        return Err(FlashError::NoSuitableNvm {
            range: range.clone(),
            description_source: source.clone(),
        });
    }

    Ok(regions)
}

/// Select, validate and check the flash algorithm for `region`. Does not touch the target.
pub(super) fn plan_algorithm(
    target: &Target,
    region: &NvmRegion,
) -> Result<FlashAlgorithm, FlashError> {
    let raw = FlashLoader::get_flash_algorithm_for_region(region, target)?;
    let algorithm = FlashAlgorithm::assemble_from_raw(raw)?;

    if !algorithm.flash_range().contains_range(&region.range) {
        tracing::warn!(
            "Flash algorithm '{}' does not cover the region {:#010x?}",
            algorithm.name,
            region.range
        );
        return Err(FlashError::NoFlashLoaderAlgorithmAttached {
            range: region.range.clone(),
            description_source: target.source.clone(),
        });
    }

    check_ram(target, &algorithm)?;
    Ok(algorithm)
}

/// Run `work` on every planned region in order, honoring the failure policy.
///
/// A dry run returns an empty report per region without touching the target.
pub(super) fn execute<W>(
    session: &mut Session,
    options: &DownloadOptions,
    plans: Vec<RegionPlan<W>>,
    mut work: impl FnMut(&mut Flasher<'_>, W, &mut RegionReport) -> Result<(), FlashError>,
) -> Result<FlashReport, FlashFailure> {
    let mut report = FlashReport::default();

    if options.dry_run {
        for plan in &plans {
            tracing::info!(
                "Dry run: region {:#010x?} would be handled by '{}'",
                plan.region.range,
                plan.algorithm.name
            );
            report
                .regions
                .push(RegionReport::new(&plan.region, &plan.algorithm.name));
        }
        return Ok(report);
    }

    let mut failures = Vec::new();
    for plan in plans {
        let mut region_report = RegionReport::new(&plan.region, &plan.algorithm.name);
        let mut position = None;

        let result = Flasher::new(session, plan.algorithm).and_then(|flasher| {
            let mut flasher = flasher
                .with_progress(options.progress.clone().unwrap_or_default())
                .with_abort(options.abort.clone())
                .with_double_buffering(!options.disable_double_buffering);
            let result = work(&mut flasher, plan.work, &mut region_report);
            position = flasher.position();
            result
        });
        report.regions.push(region_report);

        if let Err(error) = result {
            tracing::error!(
                "Flashing region {:#010x?} failed: {}",
                plan.region.range,
                error
            );
            let stop = matches!(error, FlashError::Aborted)
                || options.failure_policy == FailurePolicy::AbortAll;
            failures.push(RegionFailure::new(&plan.region, error).stopped_at(position));
            if stop {
                break;
            }
        }
    }

    let mut failures = failures.into_iter();
    match failures.next() {
        None => Ok(report),
        Some(failure) => {
            let mut failure = FlashFailure::new(report, failure);
            failure.other_failures.extend(failures);
            Err(failure)
        }
    }
}

/// Program `blocks` of `(address, data)` into the flash of the session's target.
///
/// This is the same as adding the blocks to a [`FlashLoader`] and committing it.
pub fn program(
    session: &mut Session,
    blocks: &[(u64, &[u8])],
    options: &DownloadOptions,
) -> Result<FlashReport, FlashFailure> {
    let mut loader = session.target().flash_loader();

    for &(address, data) in blocks {
        loader.add_data(address, data).map_err(|error| {
            FlashFailure::new(
                FlashReport::default(),
                RegionFailure::outside_regions(
                    address..address.saturating_add(data.len() as u64),
                    error,
                ),
            )
        })?;
    }

    loader.commit(session, options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Registry;
    use crate::fake::FakeCore;
    use pretty_assertions::assert_eq;

    fn target() -> Target {
        Registry::from_builtin_families()
            .unwrap()
            .get_target_by_name("PIC32CM5164JH01100")
            .unwrap()
    }

    #[test]
    fn data_outside_flash_is_rejected() {
        let target = target();
        let mut loader = target.flash_loader();

        // RAM
        assert!(matches!(
            loader.add_data(0x2000_0000, &[1, 2, 3]),
            Err(FlashError::NoSuitableNvm { .. })
        ));
        // user row
        assert!(matches!(
            loader.add_data(0x80_4000, &[1]),
            Err(FlashError::NoSuitableNvm { .. })
        ));
        // runs off the end of the main flash
        assert!(matches!(
            loader.add_data(0x7_FFFE, &[1, 2, 3, 4]),
            Err(FlashError::NoSuitableNvm { .. })
        ));
        // runs off the end of the address space
        assert!(matches!(
            loader.add_data(u64::MAX - 1, &[1, 2, 3]),
            Err(FlashError::NoSuitableNvm { .. })
        ));
        assert!(loader.regions_with_data().is_empty());
    }

    #[test]
    fn regions_with_data_are_ordered() {
        let target = target();
        let mut loader = target.flash_loader();
        loader.add_data(0x40_0000, &[1; 4]).unwrap();
        loader.add_data(0x100, &[1; 4]).unwrap();

        let names = loader
            .regions_with_data()
            .into_iter()
            .map(|region| region.name.clone().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["main_flash", "data_flash"]);
    }

    #[test]
    fn algorithm_by_name_and_by_range() {
        let mut target = target();
        let region = target.nvm_regions()[1].clone();
        assert_eq!(
            FlashLoader::get_flash_algorithm_for_region(&region, &target)
                .unwrap()
                .name,
            "pic32cm_jh01_data"
        );

        let unnamed = NvmRegion {
            algorithm: None,
            ..region.clone()
        };
        assert_eq!(
            FlashLoader::get_flash_algorithm_for_region(&unnamed, &target)
                .unwrap()
                .name,
            "pic32cm_jh01_data"
        );

        target.flash_algorithms.clear();
        assert!(matches!(
            FlashLoader::get_flash_algorithm_for_region(&region, &target),
            Err(FlashError::NoFlashLoaderAlgorithmAttached { .. })
        ));
    }

    #[test]
    fn dry_run_does_not_touch_the_target() {
        let target = target();
        let core = FakeCore::new(&target);
        let mut session = Session::new(target, core.clone());

        let report = program(
            &mut session,
            &[(0x0, &[0x55; 0x10][..]), (0x40_0000, &[0xAA; 0x10][..])],
            &DownloadOptions {
                dry_run: true,
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(report.regions.len(), 2);
        assert_eq!(report.bytes_written(), 0);
        assert!(core.log().is_empty());
    }

    #[test]
    fn covering_regions_must_be_contiguous() {
        let target = target();
        let source = TargetDescriptionSource::BuiltIn;

        let regions = covering_nvm_regions(&target.memory_map, &(0x100..0x200), &source).unwrap();
        assert_eq!(regions.len(), 1);

        assert!(covering_nvm_regions(&target.memory_map, &(0x7_0000..0x40_0010), &source).is_err());
        assert!(covering_nvm_regions(&target.memory_map, &(0x100..0x100), &source).is_err());
    }
}
