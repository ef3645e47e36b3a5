//! Flash programming operations.
//!
//! This module runs flash algorithms on the target to erase, program and
//! verify its flash. A flash algorithm is a small blob of position dependent
//! code with the entry points `Init()`, `UnInit()`, `EraseSector()`,
//! `ProgramPage()` and optionally `EraseAll()`. It is loaded into target RAM
//! and called by setting up the registers and running the core until it
//! returns into a breakpoint.
//!
//! ## Examples
//!
//! ### Programming a block of data
//!
//! ```no_run
//! use algoflash::config::Registry;
//! use algoflash::flashing::DownloadOptions;
//! # use algoflash::Session;
//! # fn open(target: algoflash::Target) -> Session { unimplemented!() }
//!
//! let registry = Registry::from_builtin_families()?;
//! let target = registry.get_target_by_name("PIC32CM5164JH01100")?;
//! let mut session = open(target);
//!
//! let mut loader = session.target().flash_loader();
//! loader.add_data(0x0000_0000, &[0x1, 0x2, 0x3])?;
//!
//! // Finally, the data can be programmed:
//! let report = loader.commit(&mut session, &DownloadOptions::default())?;
//! println!("{} bytes written", report.bytes_written());
//!
//! # Ok::<(), anyhow::Error>(())
//! ```
//!
//! ### Erasing
//!
//! ```no_run
//! use algoflash::flashing::{self, DownloadOptions};
//! # fn session() -> algoflash::Session { unimplemented!() }
//! # let mut session = session();
//!
//! flashing::erase(&mut session, 0x0..0x1_0000, &DownloadOptions::default())?;
//!
//! # Ok::<(), anyhow::Error>(())
//! ```

mod builder;
mod download;
mod erase;
mod error;
mod flash_algorithm;
mod flasher;
mod loader;
mod progress;
mod report;
mod verify;

pub use builder::{FlashFill, FlashLayout, FlashPage, FlashSector};
pub use download::{AbortHandle, DownloadOptions, FailurePolicy};
pub use erase::{erase, erase_all};
pub use error::{DescriptorError, FlashError};
pub use flash_algorithm::{FlashAlgorithm, ANALYZER_SIZE};
pub use flasher::Flasher;
pub use loader::{program, FlashLoader};
pub use progress::{FlashProgress, ProgressEvent};
pub use report::{FlashFailure, FlashReport, RegionFailure, RegionReport};
pub use verify::verify;

pub(crate) use verify::ANALYZER;
