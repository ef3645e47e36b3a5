use super::FlashLayout;
use std::sync::Arc;
use std::time::Duration;

/// Receives [`ProgressEvent`]s while a flash operation runs.
///
/// The handler is called synchronously from the flashing code, between
/// routine calls. Keep it short; the target sits idle while it runs.
///
/// # Example
///
/// ```
/// use algoflash::flashing::{FlashProgress, ProgressEvent};
///
/// let progress = FlashProgress::new(|event| {
///     if let ProgressEvent::PageProgrammed { size, time } = event {
///         println!("{size} bytes in {time:?}");
///     }
/// });
/// ```
#[derive(Clone)]
pub struct FlashProgress {
    handler: Arc<dyn Fn(ProgressEvent) + Send + Sync>,
}

impl Default for FlashProgress {
    fn default() -> Self {
        Self::new(|_| {})
    }
}

impl std::fmt::Debug for FlashProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlashProgress").finish_non_exhaustive()
    }
}

impl FlashProgress {
    /// Wrap `handler`. Clones share it.
    pub fn new(handler: impl Fn(ProgressEvent) + Send + Sync + 'static) -> Self {
        Self {
            handler: Arc::new(handler),
        }
    }

    fn emit(&self, event: ProgressEvent) {
        (self.handler)(event);
    }

    pub(super) fn initialized(&self, flash_layout: FlashLayout) {
        self.emit(ProgressEvent::Initialized { flash_layout });
    }

    pub(super) fn started_erasing(&self) {
        self.emit(ProgressEvent::StartedErasing);
    }

    pub(super) fn sector_erased(&self, size: u64, time: Duration) {
        self.emit(ProgressEvent::SectorErased { size, time });
    }

    pub(super) fn failed_erasing(&self) {
        self.emit(ProgressEvent::FailedErasing);
    }

    pub(super) fn finished_erasing(&self) {
        self.emit(ProgressEvent::FinishedErasing);
    }

    pub(super) fn started_programming(&self) {
        self.emit(ProgressEvent::StartedProgramming);
    }

    pub(super) fn page_programmed(&self, size: u32, time: Duration) {
        self.emit(ProgressEvent::PageProgrammed { size, time });
    }

    pub(super) fn page_skipped(&self, address: u64, size: u32) {
        self.emit(ProgressEvent::PageSkipped { address, size });
    }

    pub(super) fn failed_programming(&self) {
        self.emit(ProgressEvent::FailedProgramming);
    }

    pub(super) fn finished_programming(&self) {
        self.emit(ProgressEvent::FinishedProgramming);
    }

    pub(super) fn started_verifying(&self) {
        self.emit(ProgressEvent::StartedVerifying);
    }

    pub(super) fn finished_verifying(&self, success: bool) {
        self.emit(ProgressEvent::FinishedVerifying { success });
    }
}

/// Milestones of a flash operation.
///
/// For a region that is programmed without trouble the order is:
///
/// * `Initialized` with the planned layout
/// * `PageSkipped` per unchanged page, with `skip_unchanged`
/// * `StartedErasing`, one `SectorErased` per erase call, `FinishedErasing`
/// * `StartedProgramming`, one `PageProgrammed` per page, `FinishedProgramming`
/// * `StartedVerifying` and `FinishedVerifying`, with `verify`
///
/// Phases with nothing to do emit no events. A phase that fails ends with
/// its `Failed*` event and the region emits nothing after it.
#[derive(Debug)]
pub enum ProgressEvent {
    /// The region was planned. Nothing has been sent to the target yet.
    Initialized {
        /// Sectors, pages and fills of the region.
        flash_layout: FlashLayout,
    },
    /// The first erase call of the region is about to be made.
    StartedErasing,
    /// One erase call returned successfully.
    SectorErased {
        /// Bytes erased by the call.
        size: u64,
        /// Duration of the call.
        time: Duration,
    },
    /// An erase call failed.
    FailedErasing,
    /// All erase calls of the region succeeded.
    FinishedErasing,
    /// The first page of the region is about to be staged.
    StartedProgramming,
    /// `ProgramPage()` returned successfully for one page.
    PageProgrammed {
        /// Bytes handed to the call, including padding.
        size: u32,
        /// Duration from the start of the call to its return.
        time: Duration,
    },
    /// A page already held its data and was left alone.
    PageSkipped {
        /// Address of the page.
        address: u64,
        /// Size of the page in bytes.
        size: u32,
    },
    /// A page could not be programmed.
    FailedProgramming,
    /// Every page of the region was programmed.
    FinishedProgramming,
    /// Comparison against the flash contents has started.
    StartedVerifying,
    /// Comparison has ended.
    FinishedVerifying {
        /// `true` if the flash held the expected data.
        success: bool,
    },
}
