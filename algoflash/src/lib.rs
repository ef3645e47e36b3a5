//! # Flash algorithm execution engine
//!
//! Programs the flash of embedded targets by running CMSIS-style flash
//! algorithms on the target core. The engine loads the algorithm into target
//! RAM, calls its routines through a debug probe and reports exactly what was
//! erased, programmed and verified.
//!
//! The probe itself is abstracted behind [`CoreInterface`]; anything able to
//! access memory, write registers, set a breakpoint and run the core can drive
//! the engine.
//!
//! ## Programming a target
//!
//! ```no_run
//! use algoflash::config::Registry;
//! use algoflash::flashing::{self, DownloadOptions};
//! use algoflash::Session;
//! # fn attach(target: algoflash::Target) -> Session { unimplemented!() }
//!
//! let registry = Registry::from_builtin_families()?;
//! let target = registry.get_target_by_name("PIC32CM5164JH01100")?;
//! // `Session::new` takes the target and the probe's core.
//! let mut session = attach(target);
//!
//! let firmware = [0u8; 0x800];
//! let options = DownloadOptions {
//!     verify: true,
//!     ..Default::default()
//! };
//! let report = flashing::program(&mut session, &[(0x0, &firmware[..])], &options)?;
//! println!("{} pages programmed", report.pages_programmed());
//! # Ok::<(), anyhow::Error>(())
//! ```
//!
//! algoflash is built around three interfaces: the [`Target`] description,
//! the [`Session`] owning the core, and the [`flashing`] operations.
#![warn(missing_docs)]

pub mod config;
pub mod core;
mod error;
pub mod flashing;
mod session;

#[cfg(any(test, feature = "test"))]
pub mod fake;

pub use crate::config::{CoreType, Target};
pub use crate::core::{CoreInterface, CoreRegister, CoreRegisters, MemoryInterface, RegisterId};
pub use crate::error::Error;
pub use crate::session::{AlgorithmHandle, Session};
