use tracing::Level;

use super::{
    AbortHandle, DownloadOptions, FlashAlgorithm, FlashError, FlashLayout, FlashPage,
    FlashProgress, FlashSector, RegionReport,
};
use crate::config::Target;
use crate::session::{register_value, AlgorithmHandle, Session};
use std::marker::PhantomData;
use std::time::{Duration, Instant};
use std::{fmt::Debug, ops::Range};

/// Timeout of `Init()` and `UnInit()`.
const INIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Timeout of `EraseAll()`. Descriptors carry no value for it.
const ERASE_ALL_TIMEOUT: Duration = Duration::from_secs(30);

pub(super) trait Operation {
    fn operation() -> u32;
    fn operation_name() -> &'static str {
        match Self::operation() {
            1 => "Erase",
            2 => "Program",
            3 => "Verify",
            _ => "Unknown Operation",
        }
    }
}

pub(super) struct Erase;

impl Operation for Erase {
    fn operation() -> u32 {
        1
    }
}

pub(super) struct Program;

impl Operation for Program {
    fn operation() -> u32 {
        2
    }
}

pub(super) struct Verify;

impl Operation for Verify {
    fn operation() -> u32 {
        3
    }
}

/// Checks that the target has RAM and that the algorithm fits into it.
pub(super) fn check_ram(target: &Target, flash_algorithm: &FlashAlgorithm) -> Result<(), FlashError> {
    let ram = target.ram_ranges();
    if ram.is_empty() {
        return Err(FlashError::NoRamDefined {
            name: target.name.clone(),
        });
    }
    flash_algorithm.ensure_in_ram(&ram)
}

/// A structure to control the flash of an attached microchip.
///
/// The flash algorithm is loaded into RAM lazily, before the first routine
/// call. Each operation (erase, program, verify) is bracketed by a call to
/// `Init()` and `UnInit()`.
pub struct Flasher<'session> {
    session: &'session mut Session,
    flash_algorithm: FlashAlgorithm,
    handle: Option<AlgorithmHandle>,
    progress: FlashProgress,
    abort: AbortHandle,
    double_buffering: bool,
    /// Flash address of the unit of work in progress, or the next one to start.
    position: Option<u64>,
}

impl<'session> Flasher<'session> {
    /// Create a flasher for `flash_algorithm`.
    ///
    /// Fails if the algorithm's RAM areas do not lie inside the target's RAM.
    pub fn new(
        session: &'session mut Session,
        flash_algorithm: FlashAlgorithm,
    ) -> Result<Self, FlashError> {
        check_ram(session.target(), &flash_algorithm)?;

        Ok(Self {
            session,
            flash_algorithm,
            handle: None,
            progress: FlashProgress::default(),
            abort: AbortHandle::default(),
            double_buffering: true,
            position: None,
        })
    }

    /// Report progress to `progress`.
    pub fn with_progress(mut self, progress: FlashProgress) -> Self {
        self.progress = progress;
        self
    }

    /// Stop before the next routine call once `abort` is triggered.
    pub fn with_abort(mut self, abort: AbortHandle) -> Self {
        self.abort = abort;
        self
    }

    /// Allow or forbid the use of a second page buffer.
    pub fn with_double_buffering(mut self, enabled: bool) -> Self {
        self.double_buffering = enabled;
        self
    }

    /// The validated flash algorithm.
    pub fn flash_algorithm(&self) -> &FlashAlgorithm {
        &self.flash_algorithm
    }

    /// Returns `true` if the algorithm declares two page buffers.
    pub fn double_buffering_supported(&self) -> bool {
        self.flash_algorithm.double_buffering_supported()
    }

    pub(super) fn progress(&self) -> &FlashProgress {
        &self.progress
    }

    /// The flash address at which work stopped, if any work was started.
    pub(super) fn position(&self) -> Option<u64> {
        self.position
    }

    pub(super) fn set_position(&mut self, address: u64) {
        self.position = Some(address);
    }

    /// Returns `true` if the algorithm implements `EraseAll()`.
    pub fn is_chip_erase_supported(&self) -> bool {
        self.flash_algorithm.pc_erase_all.is_some()
    }

    /// Load the flash algorithm into RAM, unless it is resident already.
    pub fn load(&mut self) -> Result<&AlgorithmHandle, FlashError> {
        let handle = match self.handle.take() {
            Some(handle) if self.session.is_current(&handle) => handle,
            _ => self.session.load_algorithm(&self.flash_algorithm)?,
        };
        Ok(self.handle.insert(handle))
    }

    fn init<O: Operation>(&mut self) -> Result<ActiveFlasher<'_, O>, FlashError> {
        self.load()?;
        let Some(handle) = self.handle.as_ref() else {
            return Err(FlashError::StaleAlgorithm);
        };

        tracing::debug!("Preparing Flasher for operation {}", O::operation_name());
        let mut flasher = ActiveFlasher::<O> {
            session: &mut *self.session,
            flash_algorithm: &self.flash_algorithm,
            handle,
            progress: &self.progress,
            abort: &self.abort,
            position: &mut self.position,
            initialized: false,
            _operation: PhantomData,
        };

        flasher.init()?;

        Ok(flasher)
    }

    /// Run `f` between `Init()` and `UnInit()` of operation `O`.
    ///
    /// `UnInit()` is attempted after a failure too, as long as the algorithm is still resident.
    fn run_phase<O: Operation, T>(
        &mut self,
        f: impl FnOnce(&mut ActiveFlasher<'_, O>) -> Result<T, FlashError>,
    ) -> Result<T, FlashError> {
        let mut active = self.init::<O>()?;
        match f(&mut active) {
            Ok(value) => {
                active.uninit()?;
                Ok(value)
            }
            Err(error) => {
                if active.is_resident() {
                    if let Err(uninit_error) = active.uninit() {
                        tracing::warn!("UnInit after a failed operation failed: {uninit_error}");
                    }
                }
                Err(error)
            }
        }
    }

    pub(super) fn run_erase<T>(
        &mut self,
        f: impl FnOnce(&mut ActiveFlasher<'_, Erase>) -> Result<T, FlashError>,
    ) -> Result<T, FlashError> {
        self.run_phase(f)
    }

    pub(super) fn run_program<T>(
        &mut self,
        f: impl FnOnce(&mut ActiveFlasher<'_, Program>) -> Result<T, FlashError>,
    ) -> Result<T, FlashError> {
        self.run_phase(f)
    }

    pub(super) fn run_verify<T>(
        &mut self,
        f: impl FnOnce(&mut ActiveFlasher<'_, Verify>) -> Result<T, FlashError>,
    ) -> Result<T, FlashError> {
        self.run_phase(f)
    }

    /// Program the pages of a flash region, as described by `flash_layout`.
    ///
    /// The sequence is: read fills, compare with the current contents if
    /// unchanged sectors should be skipped, erase, program, verify.
    pub(super) fn program(
        &mut self,
        mut flash_layout: FlashLayout,
        options: &DownloadOptions,
        report: &mut RegionReport,
    ) -> Result<(), FlashError> {
        tracing::debug!("Starting program procedure.");
        self.progress.initialized(flash_layout.clone());

        tracing::debug!(
            "Double Buffering enabled: {:?}",
            self.double_buffering && self.double_buffering_supported()
        );
        tracing::debug!(
            "Restoring unwritten bytes enabled: {:?}",
            options.keep_unwritten_bytes
        );

        if !flash_layout.fills.is_empty() {
            self.fill_pages(&mut flash_layout)?;
        }

        let chip_erase = if options.do_chip_erase && !self.is_chip_erase_supported() {
            tracing::warn!(
                "Chip erase is not supported by '{}', erasing sector by sector.",
                self.flash_algorithm.name
            );
            false
        } else {
            options.do_chip_erase
        };

        if options.skip_unchanged && !chip_erase {
            self.skip_unchanged(&mut flash_layout, report)?;
        }

        if chip_erase {
            self.run_erase_all(report)?;
        } else {
            self.sector_erase(&flash_layout.sectors, report)?;
        }

        // Erased pages already hold their final contents.
        let algo = &self.flash_algorithm;
        let pages = flash_layout
            .pages
            .iter()
            .filter(|page| !algo.is_erased(page.data()))
            .cloned()
            .collect::<Vec<_>>();
        self.program_pages_into(&pages, report)?;

        if options.verify {
            self.verify_into(&flash_layout.pages, report)?;
        }

        Ok(())
    }

    /// Read the bytes of every fill from the flash into its page.
    fn fill_pages(&mut self, flash_layout: &mut FlashLayout) -> Result<(), FlashError> {
        let FlashLayout { pages, fills, .. } = flash_layout;
        if let Some(first) = fills.first() {
            self.set_position(first.address());
        }
        self.run_verify(|active| {
            for fill in fills.iter() {
                active.at(fill.address());
                let page = &mut pages[fill.page_index()];
                let offset = (fill.address() - page.address()) as usize;
                let slice = &mut page.data_mut()[offset..offset + fill.size() as usize];
                active.read(fill.address(), slice)?;
            }
            Ok(())
        })
    }

    /// Drop every sector whose pages all hold the requested data already.
    fn skip_unchanged(
        &mut self,
        flash_layout: &mut FlashLayout,
        report: &mut RegionReport,
    ) -> Result<(), FlashError> {
        let unchanged = self.compare_pages(&flash_layout.pages)?;

        let sectors = std::mem::take(&mut flash_layout.sectors);
        let mut pages = std::mem::take(&mut flash_layout.pages)
            .into_iter()
            .zip(unchanged)
            .peekable();

        for sector in sectors {
            let range = sector.address_range();
            let mut sector_pages = Vec::new();
            while let Some(page) = pages.next_if(|(page, _)| range.contains(&page.address())) {
                sector_pages.push(page);
            }

            if sector_pages.iter().all(|(_, unchanged)| *unchanged) {
                tracing::debug!(
                    "Sector {:#010x} already holds the requested data, skipping it.",
                    sector.address()
                );
                for (page, _) in &sector_pages {
                    self.progress.page_skipped(page.address(), page.size());
                    report.pages_skipped += 1;
                }
            } else {
                flash_layout.sectors.push(sector);
                flash_layout
                    .pages
                    .extend(sector_pages.into_iter().map(|(page, _)| page));
            }
        }

        Ok(())
    }

    /// Validate and pad page writes. Nothing is sent to the target.
    ///
    /// Writes must be non-empty, start on a multiple of the minimum program
    /// length, stay inside one page after padding, and be strictly ascending.
    fn prepare_writes(&self, pages: &[FlashPage]) -> Result<Vec<FlashPage>, FlashError> {
        let algo = &self.flash_algorithm;
        let min_program_length = u64::from(algo.min_program_length());
        let mut previous_end: Option<u64> = None;
        let mut prepared = Vec::with_capacity(pages.len());

        for page in pages {
            let address = page.address();
            if page.data().is_empty() {
                return Err(FlashError::invalid_argument(format!(
                    "empty write at {address:#010x}"
                )));
            }

            let page_info = algo.page_info(address).ok_or_else(|| {
                FlashError::invalid_argument(format!(
                    "write at {address:#010x} is outside of the flash {:#010x?}",
                    algo.flash_range()
                ))
            })?;

            if address % min_program_length != 0 {
                return Err(FlashError::invalid_argument(format!(
                    "write at {address:#010x} is not aligned to the minimum program length {min_program_length:#x}"
                )));
            }

            let length = (page.data().len() as u64).div_ceil(min_program_length) * min_program_length;
            if address + length > page_info.base_address + u64::from(page_info.size) {
                return Err(FlashError::invalid_argument(format!(
                    "write at {address:#010x} with {length:#x} bytes crosses a page boundary"
                )));
            }

            if let Some(previous_end) = previous_end {
                if address < previous_end {
                    return Err(FlashError::invalid_argument(format!(
                        "write at {address:#010x} is not above the previous write ending at {previous_end:#010x}"
                    )));
                }
            }
            previous_end = Some(address + length);

            let mut data = page.data().to_vec();
            data.resize(length as usize, algo.erased_byte_value());
            prepared.push(FlashPage::new(address, data));
        }

        Ok(prepared)
    }

    /// Program `pages` into flash which has been erased before.
    ///
    /// The writes are validated before any target access. See
    /// [`Flasher::prepare_writes`] for the rules. Writes shorter than a
    /// multiple of the minimum program length are padded with the erased byte value.
    pub fn program_pages(&mut self, pages: &[FlashPage]) -> Result<(), FlashError> {
        self.program_pages_into(pages, &mut RegionReport::default())
    }

    pub(super) fn program_pages_into(
        &mut self,
        pages: &[FlashPage],
        report: &mut RegionReport,
    ) -> Result<(), FlashError> {
        let pages = self.prepare_writes(pages)?;
        if pages.is_empty() {
            return Ok(());
        }

        self.progress.started_programming();
        self.set_position(pages[0].address());

        let result = if self.double_buffering && self.double_buffering_supported() {
            self.program_double_buffer(&pages, report)
        } else {
            self.program_simple(&pages, report)
        };

        if result.is_ok() {
            self.progress.finished_programming();
        } else {
            self.progress.failed_programming();
        }

        result
    }

    /// Programs the pages one after another through the first page buffer.
    fn program_simple(
        &mut self,
        pages: &[FlashPage],
        report: &mut RegionReport,
    ) -> Result<(), FlashError> {
        self.run_program(|active| {
            for page in pages {
                active.at(page.address());
                let t = Instant::now();
                active.program_page(page.address(), page.data())?;
                active.page_done(page, t, report);
            }
            Ok(())
        })
    }

    /// Flash a program using double buffering.
    ///
    /// This uses two buffers to increase the flash speed.
    /// While the data from one buffer is programmed, the
    /// data for the next page is already downloaded
    /// into the next buffer.
    ///
    /// A buffer is only written again after the call reading it has returned.
    fn program_double_buffer(
        &mut self,
        pages: &[FlashPage],
        report: &mut RegionReport,
    ) -> Result<(), FlashError> {
        self.run_program(|active| {
            let mut pending: Option<(&FlashPage, Instant)> = None;

            for (index, page) in pages.iter().enumerate() {
                // At the start of each loop cycle load the next page buffer into RAM.
                active.at(page.address());
                active.load_page_buffer(page.data(), index)?;

                // Then wait for the active RAM -> Flash copy process to finish.
                if let Some((previous, started)) = pending.take() {
                    active.at(previous.address());
                    active.wait_for_program_page(previous.address())?;
                    active.page_done(previous, started, report);
                }

                // Start the next copy process.
                active.at(page.address());
                let started = Instant::now();
                active.start_program_page_with_buffer(page.address(), page.size(), index)?;
                pending = Some((page, started));
            }

            if let Some((previous, started)) = pending {
                active.wait_for_program_page(previous.address())?;
                active.page_done(previous, started, report);
            }

            Ok(())
        })
    }

    /// Perform an erase of all `sectors`.
    pub(super) fn sector_erase(
        &mut self,
        sectors: &[FlashSector],
        report: &mut RegionReport,
    ) -> Result<(), FlashError> {
        if sectors.is_empty() {
            return Ok(());
        }

        self.progress.started_erasing();
        self.set_position(sectors[0].address());

        let result = self.run_erase(|active| {
            for sector in sectors {
                active.at(sector.address());
                let t = Instant::now();
                active.erase_sector(sector)?;
                report.sectors_erased.push(sector.address_range());
                active.progress.sector_erased(sector.size(), t.elapsed());
            }
            Ok(())
        });

        if result.is_ok() {
            self.progress.finished_erasing();
        } else {
            self.progress.failed_erasing();
        }

        result
    }

    /// Erase the whole flash serviced by the algorithm with `EraseAll()`.
    pub(super) fn run_erase_all(&mut self, report: &mut RegionReport) -> Result<(), FlashError> {
        if !self.is_chip_erase_supported() {
            return Err(FlashError::UnsupportedOperation {
                operation: "erase_all",
            });
        }

        self.progress.started_erasing();
        self.set_position(self.flash_range().start);

        let result = self.run_erase(|active| active.erase_all());

        if result.is_ok() {
            report.chip_erased = true;
            report.sectors_erased.push(self.flash_range());
            self.progress.finished_erasing();
        } else {
            self.progress.failed_erasing();
        }

        result
    }
}

struct Registers {
    pc: u32,
    r0: Option<u32>,
    r1: Option<u32>,
    r2: Option<u32>,
    r3: Option<u32>,
}

impl Debug for Registers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:08x}({:?}, {:?}, {:?}, {:?})",
            self.pc, self.r0, self.r1, self.r2, self.r3
        )
    }
}

fn routine_result(routine: &'static str, address: Option<u64>, code: u32) -> Result<(), FlashError> {
    if code == 0 {
        Ok(())
    } else {
        Err(FlashError::AlgorithmError {
            routine,
            address,
            code,
        })
    }
}

/// A flasher between `Init()` and `UnInit()` of operation `O`.
pub(super) struct ActiveFlasher<'flasher, O: Operation> {
    session: &'flasher mut Session,
    flash_algorithm: &'flasher FlashAlgorithm,
    handle: &'flasher AlgorithmHandle,
    pub(super) progress: &'flasher FlashProgress,
    abort: &'flasher AbortHandle,
    position: &'flasher mut Option<u64>,
    /// Stack pointer and static base are set up by the first call of the phase.
    initialized: bool,
    _operation: PhantomData<O>,
}

impl<'flasher, O: Operation> ActiveFlasher<'flasher, O> {
    #[tracing::instrument(name = "Call to flash algorithm init", skip(self))]
    fn init(&mut self) -> Result<(), FlashError> {
        let algo = self.flash_algorithm;
        let address = algo.flash_properties.address_range.start;

        // Execute init routine if one is present.
        if let Some(pc_init) = algo.pc_init {
            self.call_function_and_wait(
                &Registers {
                    pc: register_value(pc_init)?,
                    r0: Some(register_value(address)?),
                    // A clock of 0 lets the algorithm keep the current clock.
                    r1: Some(0),
                    r2: Some(O::operation()),
                    r3: None,
                },
                "init",
                None,
                INIT_TIMEOUT,
            )?;
        }

        Ok(())
    }

    fn uninit(&mut self) -> Result<(), FlashError> {
        tracing::debug!("Running uninit routine.");

        if let Some(pc_uninit) = self.flash_algorithm.pc_uninit {
            // UnInit closes the phase even after an abort request.
            self.start_routine(&Registers {
                pc: register_value(pc_uninit)?,
                r0: Some(O::operation()),
                r1: None,
                r2: None,
                r3: None,
            })?;
            let code = self.wait_for_completion("uninit", None, INIT_TIMEOUT)?;
            routine_result("uninit", None, code)?;
        }

        Ok(())
    }

    /// Record that work on the unit at `address` starts.
    pub(super) fn at(&mut self, address: u64) {
        *self.position = Some(address);
    }

    pub(super) fn is_resident(&self) -> bool {
        self.session.is_current(self.handle)
    }

    pub(super) fn flash_algorithm(&self) -> &FlashAlgorithm {
        self.flash_algorithm
    }

    pub(super) fn session(&mut self) -> &mut Session {
        self.session
    }

    fn call_function_and_wait(
        &mut self,
        registers: &Registers,
        routine: &'static str,
        address: Option<u64>,
        timeout: Duration,
    ) -> Result<(), FlashError> {
        self.call_function(registers)?;
        let code = self.wait_for_completion(routine, address, timeout)?;
        routine_result(routine, address, code)
    }

    /// Start a routine, unless the operation was aborted.
    fn call_function(&mut self, registers: &Registers) -> Result<(), FlashError> {
        self.abort.check()?;
        self.start_routine(registers)
    }

    fn start_routine(&mut self, registers: &Registers) -> Result<(), FlashError> {
        self.session.ensure_current(self.handle)?;
        tracing::debug!(
            "Calling routine {:?}, init={})",
            &registers,
            !self.initialized
        );

        let algo = self.flash_algorithm;
        let regs = self.session.core().registers();
        let setup = !self.initialized;

        let values = [
            (regs.program_counter(), Some(registers.pc)),
            (regs.argument_register(0), registers.r0),
            (regs.argument_register(1), registers.r1),
            (regs.argument_register(2), registers.r2),
            (regs.argument_register(3), registers.r3),
            (
                regs.static_base(),
                setup.then(|| register_value(algo.static_base)).transpose()?,
            ),
            (
                regs.stack_pointer(),
                setup.then(|| register_value(algo.begin_stack)).transpose()?,
            ),
            (
                regs.return_address(),
                // Routines return to the breakpoint at the load address.
                Some(regs.code_address(register_value(algo.load_address)?)),
            ),
        ];
        let breakpoint = algo.load_address;

        self.session.with_core(|core| {
            for (description, value) in &values {
                if let Some(v) = value {
                    core.write_core_reg(description.id, *v)?;

                    if tracing::enabled!(Level::DEBUG) {
                        let value = core.read_core_reg(description.id)?;

                        tracing::debug!(
                            "content of {} {:#x}: 0x{:08x} should be: 0x{:08x}",
                            description.name,
                            description.id.0,
                            value,
                            *v
                        );
                    }
                }
            }

            core.set_hw_breakpoint(breakpoint)?;

            // Resume target operation.
            core.run()
        })?;

        self.initialized = true;
        Ok(())
    }

    /// Wait for the running routine to return and read its result.
    ///
    /// A routine which does not return in time leaves the target in an unknown
    /// state. The core is halted and the algorithm has to be loaded again.
    #[tracing::instrument(skip(self))]
    fn wait_for_completion(
        &mut self,
        routine: &'static str,
        address: Option<u64>,
        timeout: Duration,
    ) -> Result<u32, FlashError> {
        tracing::debug!("Waiting for routine call completion.");
        let regs = self.session.core().registers();
        let breakpoint = self.flash_algorithm.load_address;

        let halted = self
            .session
            .with_core(|core| core.wait_for_core_halted(timeout))?;

        if !halted {
            tracing::warn!("Routine '{}' did not return within {:?}", routine, timeout);
            let core = self.session.core();
            if let Err(error) = core
                .halt(Duration::from_millis(100))
                .and_then(|_| core.clear_hw_breakpoint(breakpoint))
            {
                tracing::warn!("Failed to halt the core after the timeout: {error}");
            }
            self.session.invalidate_algorithm();
            return Err(FlashError::ExecutionTimeout {
                routine,
                address,
                timeout,
            });
        }

        self.session.with_core(|core| {
            core.clear_hw_breakpoint(breakpoint)?;
            core.read_core_reg(regs.result_register().id)
        })
    }
}

impl<'flasher> ActiveFlasher<'flasher, Erase> {
    pub(super) fn erase_all(&mut self) -> Result<(), FlashError> {
        tracing::debug!("Erasing entire chip.");

        let Some(pc_erase_all) = self.flash_algorithm.pc_erase_all else {
            return Err(FlashError::UnsupportedOperation {
                operation: "erase_all",
            });
        };

        self.call_function_and_wait(
            &Registers {
                pc: register_value(pc_erase_all)?,
                r0: None,
                r1: None,
                r2: None,
                r3: None,
            },
            "erase_all",
            None,
            ERASE_ALL_TIMEOUT,
        )
    }

    pub(super) fn erase_sector(&mut self, sector: &FlashSector) -> Result<(), FlashError> {
        let address = sector.address();
        tracing::info!("Erasing sector at address {:#010x}", address);
        let t1 = Instant::now();

        self.call_function_and_wait(
            &Registers {
                pc: register_value(self.flash_algorithm.pc_erase_sector)?,
                r0: Some(register_value(address)?),
                r1: None,
                r2: None,
                r3: None,
            },
            "erase_sector",
            Some(address),
            Duration::from_millis(
                self.flash_algorithm.flash_properties.erase_sector_timeout as u64,
            ),
        )?;

        tracing::info!("Done erasing sector. This took {:?}", t1.elapsed());
        Ok(())
    }
}

impl<'flasher> ActiveFlasher<'flasher, Program> {
    fn program_page_timeout(&self) -> Duration {
        Duration::from_millis(self.flash_algorithm.flash_properties.program_page_timeout as u64)
    }

    fn page_buffer(&self, index: usize) -> u64 {
        let buffers = &self.flash_algorithm.page_buffers;
        buffers[index % buffers.len()]
    }

    fn page_done(&self, page: &FlashPage, started: Instant, report: &mut RegionReport) {
        report.pages_programmed += 1;
        report.bytes_written += u64::from(page.size());
        self.progress.page_programmed(page.size(), started.elapsed());
    }

    /// Program a single page through the first page buffer and wait for it.
    pub(super) fn program_page(&mut self, address: u64, bytes: &[u8]) -> Result<(), FlashError> {
        let t1 = Instant::now();

        tracing::info!(
            "Flashing page at address {:#010x} with size: {}",
            address,
            bytes.len()
        );

        self.load_page_buffer(bytes, 0)?;

        self.call_function_and_wait(
            &Registers {
                pc: register_value(self.flash_algorithm.pc_program_page)?,
                r0: Some(register_value(address)?),
                r1: Some(bytes.len() as u32),
                r2: Some(register_value(self.page_buffer(0))?),
                r3: None,
            },
            "program_page",
            Some(address),
            self.program_page_timeout(),
        )?;

        tracing::info!("Flashing took: {:?}", t1.elapsed());
        Ok(())
    }

    /// Start programming the page staged in buffer `index` without waiting for it.
    pub(super) fn start_program_page_with_buffer(
        &mut self,
        address: u64,
        size: u32,
        index: usize,
    ) -> Result<(), FlashError> {
        self.call_function(&Registers {
            pc: register_value(self.flash_algorithm.pc_program_page)?,
            r0: Some(register_value(address)?),
            r1: Some(size),
            r2: Some(register_value(self.page_buffer(index))?),
            r3: None,
        })
    }

    /// Wait for the page started by [`ActiveFlasher::start_program_page_with_buffer`].
    pub(super) fn wait_for_program_page(&mut self, address: u64) -> Result<(), FlashError> {
        let timeout = self.program_page_timeout();
        let code = self.wait_for_completion("program_page", Some(address), timeout)?;
        routine_result("program_page", Some(address), code)
    }

    /// Transfer `bytes` into page buffer `index`.
    pub(super) fn load_page_buffer(&mut self, bytes: &[u8], index: usize) -> Result<(), FlashError> {
        let buffer = self.page_buffer(index);

        let t1 = Instant::now();
        self.session.with_core(|core| core.write_8(buffer, bytes))?;

        tracing::info!(
            "Took {:?} to download {} byte page into ram",
            t1.elapsed(),
            bytes.len()
        );

        Ok(())
    }
}

impl<'flasher> ActiveFlasher<'flasher, Verify> {
    /// Read flash contents through the memory interface.
    pub(super) fn read(&mut self, address: u64, data: &mut [u8]) -> Result<(), FlashError> {
        self.session.with_core(|core| core.read_8(address, data))
    }

    /// Run the analyzer over the table staged in the first page buffer.
    pub(super) fn run_analyzer(
        &mut self,
        analyzer_address: u64,
        table_address: u64,
        entries: usize,
        timeout: Duration,
    ) -> Result<(), FlashError> {
        self.call_function_and_wait(
            &Registers {
                pc: register_value(analyzer_address)?,
                r0: Some(register_value(table_address)?),
                r1: Some(entries as u32),
                r2: None,
                r3: None,
            },
            "analyzer",
            None,
            timeout,
        )
    }
}

impl Flasher<'_> {
    pub(super) fn flash_range(&self) -> Range<u64> {
        self.flash_algorithm.flash_range()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Registry, Target};
    use crate::fake::{FakeCore, Routine};
    use pretty_assertions::assert_eq;

    fn setup() -> (Session, FakeCore, FlashAlgorithm) {
        let registry = Registry::from_builtin_families().unwrap();
        let target: Target = registry.get_target_by_name("PIC32CM5164JH01100").unwrap();
        let main = FlashAlgorithm::assemble_from_raw(&target.flash_algorithms[0]).unwrap();
        let core = FakeCore::new(&target);
        (Session::new(target, core.clone()), core, main)
    }

    fn page(address: u64, value: u8, size: usize) -> FlashPage {
        FlashPage::new(address, vec![value; size])
    }

    #[test]
    fn unordered_writes_are_rejected_without_target_access() {
        let (mut session, core, main) = setup();
        let mut flasher = Flasher::new(&mut session, main).unwrap();

        let result = flasher.program_pages(&[page(0x400, 1, 0x400), page(0x0, 2, 0x400)]);

        assert!(matches!(result, Err(FlashError::InvalidArgument { .. })));
        assert!(core.log().is_empty());
    }

    #[test]
    fn write_crossing_page_is_rejected() {
        let (mut session, core, main) = setup();
        let mut flasher = Flasher::new(&mut session, main).unwrap();

        let result = flasher.program_pages(&[page(0x0, 1, 0x401)]);

        assert!(matches!(result, Err(FlashError::InvalidArgument { .. })));
        assert!(core.log().is_empty());
    }

    #[test]
    fn write_outside_flash_is_rejected() {
        let (mut session, _core, main) = setup();
        let mut flasher = Flasher::new(&mut session, main).unwrap();

        assert!(matches!(
            flasher.program_pages(&[page(0x8_0000, 1, 0x400)]),
            Err(FlashError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn phases_are_bracketed_by_init_and_uninit() {
        let (mut session, core, main) = setup();
        let mut flasher = Flasher::new(&mut session, main).unwrap();

        flasher
            .program_pages(&[page(0x0, 0x12, 0x400), page(0x400, 0x34, 0x400)])
            .unwrap();

        let routines = core
            .calls()
            .into_iter()
            .map(|call| call.routine)
            .collect::<Vec<_>>();
        assert_eq!(
            routines,
            vec![
                Routine::Init,
                Routine::ProgramPage,
                Routine::ProgramPage,
                Routine::UnInit
            ]
        );
        let init = &core.calls()[0];
        assert_eq!(init.args[0], 0);
        assert_eq!(init.args[2], 2);
    }

    #[test]
    fn single_and_double_buffering_give_same_content() {
        let pages = (0..4u8)
            .map(|index| page(u64::from(index) * 0x400, index + 1, 0x400))
            .collect::<Vec<_>>();

        let mut contents = Vec::new();
        for double_buffering in [false, true] {
            let (mut session, core, main) = setup();
            let mut flasher = Flasher::new(&mut session, main)
                .unwrap()
                .with_double_buffering(double_buffering);
            flasher.program_pages(&pages).unwrap();
            contents.push(core.read_memory(0, 0x1000));
        }

        assert_eq!(contents[0], contents[1]);
        assert_eq!(contents[0][0x400], 2);
    }

    #[test]
    fn short_write_is_padded_to_min_program_length() {
        let (mut session, core, main) = setup();
        let mut flasher = Flasher::new(&mut session, main).unwrap();

        flasher.program_pages(&[page(0x800, 0, 0x10)]).unwrap();

        let call = core
            .calls()
            .into_iter()
            .find(|call| call.routine == Routine::ProgramPage)
            .unwrap();
        assert_eq!(call.args[..2], [0x800, 0x400]);
        assert_eq!(core.read_memory(0x80F, 2), vec![0, 0xFF]);
    }

    #[test]
    fn timeout_invalidates_and_next_phase_reloads() {
        let (mut session, core, main) = setup();
        core.hang_call(Routine::ProgramPage, 1);
        let mut flasher = Flasher::new(&mut session, main).unwrap();

        let error = flasher
            .program_pages(&[page(0x0, 1, 0x400)])
            .unwrap_err();
        assert!(matches!(
            error,
            FlashError::ExecutionTimeout {
                routine: "program_page",
                address: Some(0),
                ..
            }
        ));

        core.clear_log();
        flasher.program_pages(&[page(0x400, 1, 0x400)]).unwrap();
        assert!(core.ram_was_written(0x2000_0000));
    }

    #[test]
    fn algorithm_error_is_reported_with_address() {
        let (mut session, core, main) = setup();
        core.fail_call(Routine::ProgramPage, 2, 7);
        let mut flasher = Flasher::new(&mut session, main).unwrap();

        let error = flasher
            .program_pages(&[
                page(0x0, 1, 0x400),
                page(0x400, 2, 0x400),
                page(0x800, 3, 0x400),
            ])
            .unwrap_err();

        assert!(matches!(
            error,
            FlashError::AlgorithmError {
                routine: "program_page",
                address: Some(0x400),
                code: 7
            }
        ));
        let programmed = core
            .calls()
            .into_iter()
            .filter(|call| call.routine == Routine::ProgramPage)
            .map(|call| call.args[0])
            .collect::<Vec<_>>();
        assert_eq!(programmed, vec![0x0, 0x400]);
        assert_eq!(core.read_memory(0x0, 1), vec![1]);
        // UnInit still closes the phase.
        assert_eq!(core.calls().last().map(|call| call.routine), Some(Routine::UnInit));
    }

    #[test]
    fn abort_stops_before_the_next_call() {
        let (mut session, core, main) = setup();
        let abort = AbortHandle::new();
        let trigger = abort.clone();
        let progress = FlashProgress::new(move |event| {
            if let super::super::ProgressEvent::PageProgrammed { .. } = event {
                trigger.abort();
            }
        });
        let mut flasher = Flasher::new(&mut session, main)
            .unwrap()
            .with_abort(abort)
            .with_progress(progress)
            .with_double_buffering(false);

        let result = flasher.program_pages(&[page(0x0, 1, 0x400), page(0x400, 2, 0x400)]);

        assert!(matches!(result, Err(FlashError::Aborted)));
        let programmed = core
            .calls()
            .into_iter()
            .filter(|call| call.routine == Routine::ProgramPage)
            .count();
        assert_eq!(programmed, 1);
    }

    #[test]
    fn missing_ram_is_reported() {
        let (session, core, main) = setup();
        let mut target = session.target().clone();
        target.memory_map.retain(|region| !region.is_ram());
        let mut session = Session::new(target, core);

        assert!(matches!(
            Flasher::new(&mut session, main),
            Err(FlashError::NoRamDefined { .. })
        ));
    }
}
