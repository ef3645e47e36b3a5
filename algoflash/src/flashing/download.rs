use super::{FlashError, FlashProgress};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// What to do with the remaining regions after one region failed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop at the first failing region.
    #[default]
    AbortAll,
    /// Keep working on the other regions and report all failures at the end.
    ///
    /// Cancellation always stops all work.
    ContinueIndependent,
}

/// Cancels a running flash operation.
///
/// The flag is checked before each new call into the flash algorithm. A
/// routine which is already running on the target always completes first.
/// Pages which were programmed before the cancellation are not rolled back.
#[derive(Debug, Default, Clone)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    /// Create a new, untriggered handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns `true` once [`AbortHandle::abort`] was called.
    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(super) fn check(&self) -> Result<(), FlashError> {
        if self.is_aborted() {
            tracing::info!("Flash operation aborted.");
            Err(FlashError::Aborted)
        } else {
            Ok(())
        }
    }
}

/// Options for programming data onto a target chip.
#[derive(Debug, Default, Clone)]
pub struct DownloadOptions {
    /// An optional progress reporter which is used if this argument is set to `Some(...)`.
    pub progress: Option<FlashProgress>,
    /// If `keep_unwritten_bytes` is `true`, erased portions of the flash that are not overwritten by the data
    /// are restored afterwards, such that the old contents are untouched.
    ///
    /// This is necessary because the flash can only be erased in sectors. If only parts of the erased sector are written thereafter,
    /// instead of the full sector, the excessively erased bytes wont match the contents before the erase which might not be intuitive
    /// to the user or even worse, result in unexpected behavior if those contents contain important data.
    pub keep_unwritten_bytes: bool,
    /// If this flag is set to true, the flash algorithm's chip erase is used instead of erasing sector by sector.
    /// Regions whose algorithm has no chip erase fall back to sector erase.
    pub do_chip_erase: bool,
    /// Compare against the current flash contents first and leave sectors which
    /// already hold the requested data alone.
    pub skip_unchanged: bool,
    /// After programming, read back the flash and compare it against the data.
    pub verify: bool,
    /// Use a single page buffer even if the algorithm declares two.
    pub disable_double_buffering: bool,
    /// Build and validate the plan, but do not touch the target.
    pub dry_run: bool,
    /// Behaviour after a region failed.
    pub failure_policy: FailurePolicy,
    /// Cancellation handle.
    pub abort: AbortHandle,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_is_shared_between_clones() {
        let handle = AbortHandle::new();
        let options = DownloadOptions {
            abort: handle.clone(),
            ..Default::default()
        };

        assert!(options.abort.check().is_ok());
        handle.abort();
        assert!(matches!(options.abort.check(), Err(FlashError::Aborted)));
    }

    #[test]
    fn failure_policy_from_yaml() {
        let policy: FailurePolicy = serde_yaml::from_str("continue_independent").unwrap();
        assert_eq!(policy, FailurePolicy::ContinueIndependent);
        assert_eq!(FailurePolicy::default(), FailurePolicy::AbortAll);
    }
}
