use super::FlashError;
use crate::config::NvmRegion;
use std::ops::Range;
use thiserror::Error;

/// What happened to a single flash region.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RegionReport {
    /// Name of the region, if it has one.
    pub name: Option<String>,
    /// Address range of the region.
    pub range: Range<u64>,
    /// Name of the flash algorithm used for the region.
    pub algorithm: String,
    /// Ranges erased, in the order they were erased. A chip erase adds the whole flash range.
    pub sectors_erased: Vec<Range<u64>>,
    /// The region was erased with the algorithm's chip erase.
    pub chip_erased: bool,
    /// Number of `ProgramPage()` calls which completed successfully.
    pub pages_programmed: usize,
    /// Bytes handed to successful `ProgramPage()` calls, including padding.
    pub bytes_written: u64,
    /// Pages left alone because they already held the requested data.
    pub pages_skipped: usize,
    /// Bytes compared against the flash contents.
    pub bytes_verified: u64,
}

impl RegionReport {
    pub(super) fn new(region: &NvmRegion, algorithm: &str) -> Self {
        Self {
            name: region.name.clone(),
            range: region.range.clone(),
            algorithm: algorithm.to_string(),
            ..Default::default()
        }
    }
}

/// The outcome of a flash operation over all regions it touched.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FlashReport {
    /// One entry per region the operation worked on, in the order of execution.
    pub regions: Vec<RegionReport>,
}

impl FlashReport {
    /// Total number of bytes programmed.
    pub fn bytes_written(&self) -> u64 {
        self.regions.iter().map(|region| region.bytes_written).sum()
    }

    /// Total number of erase calls which completed.
    pub fn sectors_erased(&self) -> usize {
        self.regions
            .iter()
            .map(|region| region.sectors_erased.len())
            .sum()
    }

    /// Total number of pages programmed.
    pub fn pages_programmed(&self) -> usize {
        self.regions
            .iter()
            .map(|region| region.pages_programmed)
            .sum()
    }

    /// Total number of pages skipped as unchanged.
    pub fn pages_skipped(&self) -> usize {
        self.regions.iter().map(|region| region.pages_skipped).sum()
    }
}

/// Where and why work on a region stopped.
#[derive(Debug, Error)]
#[error("Flashing {} failed at address {address:#010x}", describe_region(.region, .range))]
pub struct RegionFailure {
    /// Name of the region, if known.
    pub region: Option<String>,
    /// Address range of the region, or of the rejected data if no region applies.
    pub range: Range<u64>,
    /// The address at which work stopped.
    pub address: u64,
    /// The error kind.
    #[source]
    pub error: FlashError,
}

fn describe_region(name: &Option<String>, range: &Range<u64>) -> String {
    match name {
        Some(name) => format!("region '{name}'"),
        None => format!("range {:#010x}..{:#010x}", range.start, range.end),
    }
}

impl RegionFailure {
    /// A failure while working on `region`.
    ///
    /// Errors without an address of their own are reported at the start of the region.
    pub fn new(region: &NvmRegion, error: FlashError) -> Self {
        Self {
            region: region.name.clone(),
            range: region.range.clone(),
            address: error.address().unwrap_or(region.range.start),
            error,
        }
    }

    /// Report errors without an address of their own at `position`, the
    /// flash address at which work stopped.
    pub(super) fn stopped_at(mut self, position: Option<u64>) -> Self {
        if let (None, Some(position)) = (self.error.address(), position) {
            self.address = position;
        }
        self
    }

    /// A failure not tied to a flash region, e.g. data outside of any flash.
    pub fn outside_regions(range: Range<u64>, error: FlashError) -> Self {
        Self {
            region: None,
            address: error.address().unwrap_or(range.start),
            range,
            error,
        }
    }
}

/// A failed flash operation.
///
/// Carries the work that completed before the failure. Completed pages are
/// never rolled back.
#[derive(Debug, Error)]
#[error("{failure}")]
pub struct FlashFailure {
    /// Everything done before the operation stopped.
    pub report: FlashReport,
    /// The first failure.
    #[source]
    pub failure: RegionFailure,
    /// Failures of further regions, if the failure policy continued after the first one.
    pub other_failures: Vec<RegionFailure>,
}

impl FlashFailure {
    pub(super) fn new(report: FlashReport, failure: RegionFailure) -> Self {
        Self {
            report,
            failure,
            other_failures: Vec::new(),
        }
    }

    /// The error kind of the first failure.
    pub fn error(&self) -> &FlashError {
        &self.failure.error
    }

    /// The address at which the first failure happened.
    pub fn address(&self) -> u64 {
        self.failure.address
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn region() -> NvmRegion {
        NvmRegion {
            name: Some("main_flash".to_string()),
            range: 0..0x8_0000,
            algorithm: None,
            access: None,
        }
    }

    #[test]
    fn failure_uses_error_address() {
        let failure = RegionFailure::new(
            &region(),
            FlashError::AlgorithmError {
                routine: "program_page",
                address: Some(0x400),
                code: 1,
            },
        );

        assert_eq!(failure.address, 0x400);
        assert_eq!(
            failure.to_string(),
            "Flashing region 'main_flash' failed at address 0x00000400"
        );
    }

    #[test]
    fn failure_without_address_points_at_region_start() {
        let failure = RegionFailure::new(&region(), FlashError::Aborted);
        assert_eq!(failure.address, 0);
    }

    #[test]
    fn failure_without_address_points_at_position() {
        let failure = RegionFailure::new(&region(), FlashError::Aborted).stopped_at(Some(0x400));
        assert_eq!(failure.address, 0x400);

        let failure = RegionFailure::new(
            &region(),
            FlashError::VerifyMismatch { address: 0x123 },
        )
        .stopped_at(Some(0x400));
        assert_eq!(failure.address, 0x123);
    }

    #[test]
    fn totals() {
        let report = FlashReport {
            regions: vec![
                RegionReport {
                    bytes_written: 0x800,
                    pages_programmed: 2,
                    sectors_erased: vec![0..0x8000],
                    ..Default::default()
                },
                RegionReport {
                    bytes_written: 0x40,
                    pages_programmed: 1,
                    pages_skipped: 3,
                    ..Default::default()
                },
            ],
        };

        assert_eq!(report.bytes_written(), 0x840);
        assert_eq!(report.pages_programmed(), 3);
        assert_eq!(report.sectors_erased(), 1);
        assert_eq!(report.pages_skipped(), 3);
    }
}
