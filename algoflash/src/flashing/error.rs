use std::ops::Range;
use std::time::Duration;
use thiserror::Error;

use crate::config::TargetDescriptionSource;
use crate::error;

/// Describes any error that happened during the or in preparation for the flashing procedure.
#[derive(Error, Debug)]
pub enum FlashError {
    /// The flash algorithm description is inconsistent.
    #[error("The flash algorithm '{name}' is invalid")]
    InvalidDescriptor {
        /// Name of the flash algorithm.
        name: String,
        /// What is wrong with it.
        #[source]
        reason: DescriptorError,
    },

    /// A memory access or run control request failed.
    #[error("Something during the interaction with the target went wrong")]
    Transport(#[source] error::Error),

    /// The algorithm image in RAM does not match what was written.
    #[error(
        "The RAM contents did not match the flash algorithm after loading it. Mismatch at {address:#010x}: expected {expected:#010x}, read {actual:#010x}"
    )]
    LoadVerifyMismatch {
        /// Address of the first differing word.
        address: u64,
        /// Word that was written.
        expected: u32,
        /// Word that was read back.
        actual: u32,
    },

    /// A routine of the flash algorithm returned a non-zero status.
    #[error("The execution of '{routine}' failed with code {code}{}", fmt_address(.address))]
    AlgorithmError {
        /// The routine that failed.
        routine: &'static str,
        /// The flash address the routine was working on, if any.
        address: Option<u64>,
        /// The status returned by the routine.
        code: u32,
    },

    /// A routine did not return within its timeout.
    ///
    /// The algorithm has to be reloaded before the next call.
    #[error("The execution of '{routine}' did not finish within {timeout:?}{}", fmt_address(.address))]
    ExecutionTimeout {
        /// The routine that hung.
        routine: &'static str,
        /// The flash address the routine was working on, if any.
        address: Option<u64>,
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// The flash contents differ from the expected data.
    #[error("Verification failed: flash contents differ at {address:#010x}")]
    VerifyMismatch {
        /// Address of the first differing byte.
        address: u64,
    },

    /// The operation was cancelled.
    #[error("The flashing procedure was aborted")]
    Aborted,

    /// A request violates the flash geometry or ordering rules. Nothing was sent to the target.
    #[error("Invalid request: {reason}")]
    InvalidArgument {
        /// Why the request was rejected.
        reason: String,
    },

    /// The flash algorithm does not implement the requested operation.
    #[error("The '{operation}' routine is not supported by the flash algorithm")]
    UnsupportedOperation {
        /// The requested operation.
        operation: &'static str,
    },

    /// The algorithm handle refers to an algorithm which is no longer resident in RAM.
    #[error("The flash algorithm is no longer loaded on the target")]
    StaleAlgorithm,

    /// No flash region covers the requested range.
    #[error(
        "No flash memory contains the entire requested memory range {:#010x}..{:#010x}.",
        .range.start, .range.end
    )]
    NoSuitableNvm {
        /// The requested range.
        range: Range<u64>,
        /// Source of the target description.
        description_source: TargetDescriptionSource,
    },

    /// Two data chunks overlap.
    #[error("Adding data for address {0:#010x} overlaps previously added data.")]
    DataOverlap(u64),

    /// No algorithm was found for a flash region.
    #[error("Trying to access flash at {:#010x}..{:#010x}, but no suitable flash loader algorithm is linked to the given target information.", .range.start, .range.end)]
    NoFlashLoaderAlgorithmAttached {
        /// The flash region without algorithm.
        range: Range<u64>,
        /// Source of the target description.
        description_source: TargetDescriptionSource,
    },

    /// The target has no RAM to run algorithms from.
    #[error("No RAM defined for target: {name}.")]
    NoRamDefined {
        /// The name of the target.
        name: String,
    },
}

fn fmt_address(address: &Option<u64>) -> String {
    address
        .map(|address| format!(" at {address:#010x}"))
        .unwrap_or_default()
}

impl FlashError {
    /// The flash address the error relates to, if it relates to one.
    pub fn address(&self) -> Option<u64> {
        match self {
            FlashError::AlgorithmError { address, .. }
            | FlashError::ExecutionTimeout { address, .. } => *address,
            FlashError::VerifyMismatch { address } => Some(*address),
            FlashError::DataOverlap(address) => Some(*address),
            FlashError::NoSuitableNvm { range, .. }
            | FlashError::NoFlashLoaderAlgorithmAttached { range, .. } => Some(range.start),
            _ => None,
        }
    }

    /// Returns `true` if the target state is unknown after this error and the
    /// flash algorithm must be reloaded before further use.
    pub fn requires_reload(&self) -> bool {
        matches!(
            self,
            FlashError::Transport(_)
                | FlashError::ExecutionTimeout { .. }
                | FlashError::LoadVerifyMismatch { .. }
        )
    }

    pub(crate) fn invalid_argument(reason: impl Into<String>) -> Self {
        FlashError::InvalidArgument {
            reason: reason.into(),
        }
    }
}

impl From<error::Error> for FlashError {
    fn from(error: error::Error) -> Self {
        FlashError::Transport(error)
    }
}

/// Why a flash algorithm description was rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DescriptorError {
    /// A RAM address does not fit into a 32 bit register.
    #[error("{area} address {address:#x} is outside the 32 bit address space")]
    AddressOutOfRange {
        /// The area.
        area: &'static str,
        /// The declared address.
        address: u64,
    },
    /// The algorithm has no code.
    #[error("the algorithm contains no instructions")]
    EmptyInstructions,
    /// The stack must grow down from `begin_stack` to `end_stack`.
    #[error("begin_stack {begin:#010x} must be above end_stack {end:#010x}")]
    InvertedStack {
        /// Top of the stack.
        begin: u64,
        /// Bottom of the stack.
        end: u64,
    },
    /// Page sizes must be a non-zero multiple of 4.
    #[error("page size {0:#x} must be a non-zero multiple of 4")]
    InvalidPageSize(u32),
    /// The minimum program length must evenly divide the page size.
    #[error("page size {page_size:#x} is not a multiple of the minimum program length {min_program_length:#x}")]
    InvalidMinProgramLength {
        /// Page size.
        page_size: u32,
        /// Minimum program length.
        min_program_length: u32,
    },
    /// The flash range is empty or not reachable with 32 bit addresses.
    #[error("flash range {:#x}..{:#x} is empty or outside the 32 bit address space", .0.start, .0.end)]
    InvalidFlashRange(Range<u64>),
    /// The flash start must be page aligned.
    #[error("flash start {0:#010x} is not aligned to the page size")]
    UnalignedFlashStart(u64),
    /// No erase units were declared.
    #[error("the sector table is empty")]
    NoSectors,
    /// The first sector group must start at offset 0.
    #[error("the first sector group starts at offset {0:#x} instead of 0")]
    FirstSectorNotAtStart(u64),
    /// Sector group offsets must be strictly increasing and inside the flash.
    #[error("sector group at offset {0:#x} is out of order or outside the flash")]
    UnorderedSectors(u64),
    /// A sector size is zero or not a multiple of the page size.
    #[error("sector size {size:#x} at offset {offset:#x} is not a non-zero multiple of the page size")]
    InvalidSectorSize {
        /// Offset of the sector group.
        offset: u64,
        /// Declared size.
        size: u64,
    },
    /// A sector group does not consist of a whole number of sectors.
    #[error("sector group at offset {offset:#x} does not span a whole number of {size:#x} byte sectors")]
    PartialSectorGroup {
        /// Offset of the sector group.
        offset: u64,
        /// Declared size.
        size: u64,
    },
    /// A required entry point is absent or encoded as unsupported.
    #[error("the required entry point '{0}' is missing")]
    MissingEntryPoint(&'static str),
    /// An entry point lies outside of the loaded code image.
    #[error("entry point '{routine}' at {address:#010x} lies outside of the algorithm image")]
    EntryPointOutsideImage {
        /// The routine.
        routine: &'static str,
        /// The declared address.
        address: u64,
    },
    /// Neither `page_buffers` nor `begin_data` were given.
    #[error("no page buffer is defined")]
    NoPageBuffer,
    /// More page buffers than the pipeline can use.
    #[error("{0} page buffers are defined, at most 2 are supported")]
    TooManyPageBuffers(usize),
    /// The analyzer is enabled without an address for it.
    #[error("the analyzer is supported but no analyzer address is given")]
    MissingAnalyzerAddress,
    /// Two RAM areas used by the algorithm overlap.
    #[error("{first} {:#010x}..{:#010x} overlaps {second} {:#010x}..{:#010x}", .first_range.start, .first_range.end, .second_range.start, .second_range.end)]
    OverlappingRam {
        /// First area.
        first: &'static str,
        /// Range of the first area.
        first_range: Range<u64>,
        /// Second area.
        second: &'static str,
        /// Range of the second area.
        second_range: Range<u64>,
    },
    /// A RAM area used by the algorithm is not inside the target's RAM.
    #[error("{area} {:#010x}..{:#010x} is not inside a RAM region of the target", .range.start, .range.end)]
    OutsideRam {
        /// The area.
        area: &'static str,
        /// Its range.
        range: Range<u64>,
    },
}
