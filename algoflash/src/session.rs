use crate::config::Target;
use crate::core::CoreInterface;
use crate::flashing::{FlashAlgorithm, FlashError, ANALYZER};
use std::time::Duration;

/// The `Session` struct represents an active flashing session with a target.
///
/// It owns the connection to the core that executes flash algorithms and
/// tracks which flash algorithm is currently resident in target RAM. At most
/// one algorithm is resident at any time.
pub struct Session {
    target: Target,
    core: Box<dyn CoreInterface>,
    resident: Option<Resident>,
    generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Resident {
    fingerprint: u64,
    generation: u64,
}

/// Proof that a flash algorithm was loaded into target RAM.
///
/// A handle becomes stale as soon as another algorithm is loaded or the
/// session invalidates the resident algorithm after a failed call.
#[derive(Debug, PartialEq, Eq)]
pub struct AlgorithmHandle {
    fingerprint: u64,
    generation: u64,
}

impl AlgorithmHandle {
    /// The fingerprint of the loaded code image.
    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }
}

impl Session {
    /// Open a session on `target`, using `core` to execute the flash algorithms.
    pub fn new(target: Target, core: impl CoreInterface + 'static) -> Self {
        Self {
            target,
            core: Box::new(core),
            resident: None,
            generation: 0,
        }
    }

    /// Get the target description of the session.
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Access the core of the session.
    pub fn core(&mut self) -> &mut dyn CoreInterface {
        self.core.as_mut()
    }

    /// Run `f` against the core. Any failure leaves the target in an unknown
    /// state, so the resident algorithm is dropped.
    pub(crate) fn with_core<T>(
        &mut self,
        f: impl FnOnce(&mut dyn CoreInterface) -> Result<T, crate::Error>,
    ) -> Result<T, FlashError> {
        f(self.core.as_mut()).map_err(|error| {
            tracing::debug!("Core access failed, dropping the resident algorithm: {error}");
            self.invalidate_algorithm();
            FlashError::Transport(error)
        })
    }

    /// Load `algorithm` into target RAM and return a handle to it.
    ///
    /// Loading the algorithm which is already resident does not touch the target.
    /// Loading a different algorithm evicts the resident one and makes all
    /// handles to it stale.
    pub fn load_algorithm(
        &mut self,
        algorithm: &FlashAlgorithm,
    ) -> Result<AlgorithmHandle, FlashError> {
        let fingerprint = algorithm.fingerprint();

        if let Some(resident) = self.resident {
            if resident.fingerprint == fingerprint {
                tracing::debug!("Flash algorithm '{}' is already loaded.", algorithm.name);
                return Ok(AlgorithmHandle {
                    fingerprint,
                    generation: resident.generation,
                });
            }
        }

        tracing::debug!("Initializing the flash algorithm '{}'.", algorithm.name);
        self.invalidate_algorithm();

        self.with_core(|core| {
            tracing::debug!("Halting core");
            core.halt(Duration::from_millis(100))
        })?;

        let span = tracing::debug_span!(
            "Loading algorithm into RAM",
            address = algorithm.load_address
        )
        .entered();
        self.write_and_verify(algorithm.load_address, &algorithm.instructions)?;
        if let Some(analyzer_address) = algorithm.analyzer_address {
            self.write_and_verify(analyzer_address, &ANALYZER)?;
        }
        drop(span);

        tracing::debug!("RAM contents match flashing algo blob.");

        let registers = self.core.registers();
        let stack_pointer = register_value(algorithm.begin_stack)?;
        let static_base = register_value(algorithm.static_base)?;
        self.with_core(|core| {
            core.write_core_reg(registers.stack_pointer().id, stack_pointer)?;
            core.write_core_reg(registers.static_base().id, static_base)
        })?;

        self.generation += 1;
        self.resident = Some(Resident {
            fingerprint,
            generation: self.generation,
        });

        Ok(AlgorithmHandle {
            fingerprint,
            generation: self.generation,
        })
    }

    fn write_and_verify(&mut self, address: u64, words: &[u32]) -> Result<(), FlashError> {
        let mut data = vec![0; words.len()];
        self.with_core(|core| {
            core.write_32(address, words)?;
            core.read_32(address, &mut data)
        })?;

        for (offset, (original, read_back)) in words.iter().zip(data.iter()).enumerate() {
            if original != read_back {
                let mismatch = address + (4 * offset) as u64;
                tracing::error!(
                    "Failed to verify flash algorithm. Data mismatch at address {:#010x}",
                    mismatch
                );
                tracing::error!("Original instruction: {:#010x}", original);
                tracing::error!("Readback instruction: {:#010x}", read_back);

                self.invalidate_algorithm();
                return Err(FlashError::LoadVerifyMismatch {
                    address: mismatch,
                    expected: *original,
                    actual: *read_back,
                });
            }
        }

        Ok(())
    }

    /// Returns `true` if `handle` still refers to the resident algorithm.
    pub fn is_current(&self, handle: &AlgorithmHandle) -> bool {
        self.resident
            == Some(Resident {
                fingerprint: handle.fingerprint,
                generation: handle.generation,
            })
    }

    /// Fails with [`FlashError::StaleAlgorithm`] unless `handle` refers to the resident algorithm.
    pub fn ensure_current(&self, handle: &AlgorithmHandle) -> Result<(), FlashError> {
        if self.is_current(handle) {
            Ok(())
        } else {
            Err(FlashError::StaleAlgorithm)
        }
    }

    /// Forget about the resident algorithm.
    ///
    /// Call this after resetting the target by other means. The next flash
    /// operation loads its algorithm again.
    pub fn invalidate_algorithm(&mut self) {
        if self.resident.take().is_some() {
            tracing::debug!("Resident flash algorithm invalidated.");
        }
    }
}

pub(crate) fn register_value(value: u64) -> Result<u32, FlashError> {
    value
        .try_into()
        .map_err(|_| FlashError::invalid_argument(format!("{value:#x} does not fit a register")))
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("target", &self.target.name)
            .field("resident", &self.resident)
            .finish_non_exhaustive()
    }
}
