//! A simulated core for testing the flashing engine without hardware.
//!
//! [`FakeCore`] models the memory map of a [`Target`] and executes its flash
//! algorithms by interpreting the entry points instead of the machine code.
#![allow(missing_docs)] // Don't require docs for test code

use crate::config::{MemoryRange, MemoryRegion, Target};
use crate::core::{CoreInterface, CoreRegisters, MemoryInterface, RegisterId};
use crate::flashing::{FlashAlgorithm, ANALYZER};
use crate::Error;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Range;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// The routine a call was made to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Routine {
    Init,
    UnInit,
    EraseSector,
    ProgramPage,
    EraseAll,
    Analyzer,
    /// The program counter did not point at a known entry point.
    Unknown(u64),
}

/// A routine call, with the argument registers at the time the core was started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeCall {
    pub routine: Routine,
    pub args: [u32; 4],
}

/// Everything the host did to the fake core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Write { address: u64, len: usize },
    Read { address: u64, len: usize },
    Breakpoint(u64),
    Call(FakeCall),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MemoryKind {
    Ram,
    Flash,
    ReadOnly,
}

#[derive(Debug)]
struct Memory {
    range: Range<u64>,
    kind: MemoryKind,
    data: Vec<u8>,
}

#[derive(Debug, Default)]
struct Faults {
    failing_calls: Vec<(Routine, usize, u32)>,
    hanging_calls: Vec<(Routine, usize)>,
    failing_memory: Vec<Range<u64>>,
    corrupt_reads: BTreeSet<u64>,
}

#[derive(Debug)]
struct PendingCall {
    call: FakeCall,
    algorithm: Option<usize>,
    /// Number of calls to this routine so far, including this one.
    count: usize,
    returns: bool,
}

#[derive(Debug)]
struct FakeState {
    registers: BTreeMap<u16, u32>,
    memories: Vec<Memory>,
    algorithms: Vec<FlashAlgorithm>,
    breakpoints: BTreeSet<u64>,
    pending: Option<PendingCall>,
    call_counts: HashMap<Routine, usize>,
    log: Vec<Event>,
    faults: Faults,
}

/// A simulated core with the memory map of a target.
///
/// RAM starts zeroed and flash starts erased. Flash can only be changed by
/// calling the flash algorithm routines. Clones share the same state, so a
/// test can keep a clone to inspect the core after handing it to a [`crate::Session`].
#[derive(Debug, Clone)]
pub struct FakeCore {
    core_registers: &'static CoreRegisters,
    state: Arc<Mutex<FakeState>>,
}

impl FakeCore {
    pub fn new(target: &Target) -> Self {
        let algorithms = target
            .flash_algorithms
            .iter()
            .filter_map(|raw| FlashAlgorithm::assemble_from_raw(raw).ok())
            .collect::<Vec<_>>();

        let memories = target
            .memory_map
            .iter()
            .map(|region| {
                let range = region.address_range();
                let (kind, fill) = match region {
                    MemoryRegion::Ram(_) => (MemoryKind::Ram, 0),
                    MemoryRegion::Nvm(_) => {
                        let erased = algorithms
                            .iter()
                            .find(|algorithm| algorithm.flash_range().contains_range(&range))
                            .map_or(0xFF, FlashAlgorithm::erased_byte_value);
                        (MemoryKind::Flash, erased)
                    }
                    MemoryRegion::Generic(_) => (MemoryKind::ReadOnly, 0xFF),
                };
                Memory {
                    data: vec![fill; (range.end - range.start) as usize],
                    range,
                    kind,
                }
            })
            .collect();

        Self {
            core_registers: target.core_registers(),
            state: Arc::new(Mutex::new(FakeState {
                registers: BTreeMap::new(),
                memories,
                algorithms,
                breakpoints: BTreeSet::new(),
                pending: None,
                call_counts: HashMap::new(),
                log: Vec::new(),
                faults: Faults::default(),
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// Read memory without going through the logged interface.
    pub fn read_memory(&self, address: u64, len: usize) -> Vec<u8> {
        self.state().read(address, len).unwrap()
    }

    /// Place `data` anywhere, including flash.
    pub fn preload(&self, address: u64, data: &[u8]) {
        self.state().write(address, data).unwrap();
    }

    pub fn read_ram_words(&self, address: u64, count: usize) -> Vec<u32> {
        self.read_memory(address, count * 4)
            .chunks_exact(4)
            .map(|chunk| u32::from_le_bytes(chunk.try_into().unwrap()))
            .collect()
    }

    pub fn register(&self, id: u16) -> u32 {
        self.state().registers.get(&id).copied().unwrap_or_default()
    }

    pub fn log(&self) -> Vec<Event> {
        self.state().log.clone()
    }

    pub fn clear_log(&self) {
        self.state().log.clear();
    }

    /// All routine calls in the log.
    pub fn calls(&self) -> Vec<FakeCall> {
        self.state()
            .log
            .iter()
            .filter_map(|event| match event {
                Event::Call(call) => Some(call.clone()),
                _ => None,
            })
            .collect()
    }

    /// Returns `true` if a logged write covered `address`.
    pub fn ram_was_written(&self, address: u64) -> bool {
        self.state().log.iter().any(|event| {
            matches!(event, Event::Write { address: start, len }
                if (*start..*start + *len as u64).contains(&address))
        })
    }

    /// The `nth` call (counting from 1) of `routine` returns `code` without any effect.
    pub fn fail_call(&self, routine: Routine, nth: usize, code: u32) {
        self.state().faults.failing_calls.push((routine, nth, code));
    }

    /// The `nth` call (counting from 1) of `routine` never returns.
    pub fn hang_call(&self, routine: Routine, nth: usize) {
        self.state().faults.hanging_calls.push((routine, nth));
    }

    /// Memory accesses touching `range` fail with a transport error.
    pub fn fail_memory_access(&self, range: Range<u64>) {
        self.state().faults.failing_memory.push(range);
    }

    /// Reads of the byte at `address` return it inverted.
    pub fn corrupt_ram_readback(&self, address: u64) {
        self.state().faults.corrupt_reads.insert(address);
    }

    pub fn clear_faults(&self) {
        self.state().faults = Faults::default();
    }
}

impl FakeState {
    fn memory(&mut self, address: u64, len: usize) -> Result<(&mut Memory, usize), Error> {
        // Zero sized accesses only need a valid address.
        let range = address..address + len.max(1) as u64;
        let memory = self
            .memories
            .iter_mut()
            .find(|memory| memory.range.contains_range(&range))
            .ok_or(Error::InvalidAddress(address))?;
        let offset = (address - memory.range.start) as usize;
        Ok((memory, offset))
    }

    fn read(&mut self, address: u64, len: usize) -> Result<Vec<u8>, Error> {
        let (memory, offset) = self.memory(address, len)?;
        Ok(memory.data[offset..offset + len].to_vec())
    }

    fn write(&mut self, address: u64, data: &[u8]) -> Result<(), Error> {
        let (memory, offset) = self.memory(address, data.len())?;
        memory.data[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn check_access(&self, address: u64, len: usize) -> Result<(), Error> {
        let range = address..address + len as u64;
        if self
            .faults
            .failing_memory
            .iter()
            .any(|failing| failing.intersects_range(&range))
        {
            return Err(Error::transport(format!(
                "injected failure accessing {address:#010x}"
            )));
        }
        Ok(())
    }

    fn register(&self, register: RegisterId) -> u32 {
        self.registers.get(&register.0).copied().unwrap_or_default()
    }

    fn holds(&mut self, address: u64, words: &[u32]) -> bool {
        let bytes = words
            .iter()
            .flat_map(|word| word.to_le_bytes())
            .collect::<Vec<_>>();
        self.read(address, bytes.len())
            .is_ok_and(|contents| contents == bytes)
    }

    /// The algorithm whose code is currently in RAM.
    fn resident_algorithm(&mut self) -> Option<usize> {
        let algorithms = self.algorithms.clone();
        algorithms
            .iter()
            .position(|algorithm| self.holds(algorithm.load_address, &algorithm.instructions))
    }

    fn routine_at(&mut self, pc: u64, algorithm: Option<usize>) -> Routine {
        let Some(algorithm) = algorithm.map(|index| self.algorithms[index].clone()) else {
            return Routine::Unknown(pc);
        };

        if algorithm.analyzer_address == Some(pc) && self.holds(pc, &ANALYZER) {
            return Routine::Analyzer;
        }

        let entry = |address: Option<u64>| address.map(|address| address & !1) == Some(pc);
        if entry(algorithm.pc_init) {
            Routine::Init
        } else if entry(algorithm.pc_uninit) {
            Routine::UnInit
        } else if entry(Some(algorithm.pc_erase_sector)) {
            Routine::EraseSector
        } else if entry(Some(algorithm.pc_program_page)) {
            Routine::ProgramPage
        } else if entry(algorithm.pc_erase_all) {
            Routine::EraseAll
        } else {
            Routine::Unknown(pc)
        }
    }

    /// Apply the effect of a routine. Returns the value of the result register.
    fn execute(&mut self, routine: Routine, args: [u32; 4], algorithm: &FlashAlgorithm) -> u32 {
        let erased = algorithm.erased_byte_value();
        match routine {
            Routine::Init | Routine::UnInit => 0,
            Routine::EraseSector => {
                let address = u64::from(args[0]);
                match algorithm.sector_info(address) {
                    Some(sector) if sector.base_address == address => {
                        let fill = vec![erased; sector.size as usize];
                        self.write(address, &fill).map_or(1, |_| 0)
                    }
                    _ => 1,
                }
            }
            Routine::ProgramPage => {
                let address = u64::from(args[0]);
                let len = args[1] as usize;
                let end = address + len as u64;
                if !algorithm.flash_range().contains_range(&(address..end)) {
                    return 1;
                }
                let Ok(buffer) = self.read(u64::from(args[2]), len) else {
                    return 1;
                };
                let Ok(current) = self.read(address, len) else {
                    return 1;
                };
                // Programming can only clear bits.
                let programmed = current
                    .iter()
                    .zip(&buffer)
                    .map(|(old, new)| old & new)
                    .collect::<Vec<_>>();
                self.write(address, &programmed).map_or(1, |_| 0)
            }
            Routine::EraseAll => {
                let range = algorithm.flash_range();
                let fill = vec![erased; (range.end - range.start) as usize];
                self.write(range.start, &fill).map_or(1, |_| 0)
            }
            Routine::Analyzer => {
                let table = u64::from(args[0]);
                let count = args[1] as usize;
                let Ok(entries) = self.read(table, count * 4) else {
                    return 1;
                };
                let mut crcs = Vec::with_capacity(count * 4);
                for entry in entries.chunks_exact(4) {
                    let entry = u32::from_le_bytes([entry[0], entry[1], entry[2], entry[3]]);
                    let size = 1u64 << (entry & 0xFFFF);
                    let address = u64::from(entry >> 16) * size;
                    let Ok(contents) = self.read(address, size as usize) else {
                        return 1;
                    };
                    crcs.extend(crc::crc32::checksum_ieee(&contents).to_le_bytes());
                }
                self.write(table, &crcs).map_or(1, |_| 0)
            }
            Routine::Unknown(_) => 1,
        }
    }
}

impl MemoryInterface for FakeCore {
    fn read_8(&mut self, address: u64, data: &mut [u8]) -> Result<(), Error> {
        let mut state = self.state();
        state.check_access(address, data.len())?;
        let contents = state.read(address, data.len())?;
        data.copy_from_slice(&contents);

        for &corrupt in &state.faults.corrupt_reads {
            if (address..address + data.len() as u64).contains(&corrupt) {
                data[(corrupt - address) as usize] ^= 0xFF;
            }
        }

        state.log.push(Event::Read {
            address,
            len: data.len(),
        });
        Ok(())
    }

    fn write_8(&mut self, address: u64, data: &[u8]) -> Result<(), Error> {
        let mut state = self.state();
        state.check_access(address, data.len())?;

        let (memory, _) = state.memory(address, data.len())?;
        if memory.kind != MemoryKind::Ram {
            return Err(Error::InvalidAddress(address));
        }
        state.write(address, data)?;

        state.log.push(Event::Write {
            address,
            len: data.len(),
        });
        Ok(())
    }
}

impl CoreInterface for FakeCore {
    fn registers(&self) -> &'static CoreRegisters {
        self.core_registers
    }

    fn write_core_reg(&mut self, id: RegisterId, value: u32) -> Result<(), Error> {
        self.state().registers.insert(id.0, value);
        Ok(())
    }

    fn read_core_reg(&mut self, id: RegisterId) -> Result<u32, Error> {
        Ok(self.state().register(id))
    }

    fn set_hw_breakpoint(&mut self, address: u64) -> Result<(), Error> {
        let mut state = self.state();
        state.breakpoints.insert(address);
        state.log.push(Event::Breakpoint(address));
        Ok(())
    }

    fn clear_hw_breakpoint(&mut self, address: u64) -> Result<(), Error> {
        self.state().breakpoints.remove(&address);
        Ok(())
    }

    fn run(&mut self) -> Result<(), Error> {
        let registers = self.core_registers;
        let mut state = self.state();

        let pc = u64::from(state.register(registers.program_counter().id) & !1);
        let args = [0, 1, 2, 3].map(|index| state.register(registers.argument_register(index).id));
        let return_address = u64::from(state.register(registers.return_address().id) & !1);

        let algorithm = state.resident_algorithm();
        let routine = state.routine_at(pc, algorithm);
        let count = {
            let count = state.call_counts.entry(routine).or_default();
            *count += 1;
            *count
        };

        let call = FakeCall { routine, args };
        state.log.push(Event::Call(call.clone()));
        let returns = state.breakpoints.contains(&return_address);
        state.pending = Some(PendingCall {
            call,
            algorithm,
            count,
            returns,
        });
        Ok(())
    }

    fn wait_for_core_halted(&mut self, _timeout: Duration) -> Result<bool, Error> {
        let registers = self.core_registers;
        let mut state = self.state();

        let Some(pending) = state.pending.take() else {
            return Ok(true);
        };
        let routine = pending.call.routine;

        let hangs = state
            .faults
            .hanging_calls
            .contains(&(routine, pending.count));
        if hangs || !pending.returns {
            state.pending = Some(pending);
            return Ok(false);
        }

        let failure = state
            .faults
            .failing_calls
            .iter()
            .find(|(failing, nth, _)| *failing == routine && *nth == pending.count)
            .map(|(_, _, code)| *code);

        let result = match (failure, pending.algorithm) {
            (Some(code), _) => code,
            (None, Some(index)) => {
                let algorithm = state.algorithms[index].clone();
                state.execute(routine, pending.call.args, &algorithm)
            }
            (None, None) => 1,
        };

        state
            .registers
            .insert(registers.result_register().id.0, result);
        Ok(true)
    }

    fn halt(&mut self, _timeout: Duration) -> Result<(), Error> {
        self.state().pending = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Registry;

    #[test]
    fn flash_is_not_writable_through_memory_access() {
        let target = Registry::from_builtin_families()
            .unwrap()
            .get_target_by_name("PIC32CM5164JH01100")
            .unwrap();
        let mut core = FakeCore::new(&target);

        assert!(matches!(
            core.write_8(0x0, &[0]),
            Err(Error::InvalidAddress(0))
        ));
        assert!(core.write_8(0x2000_0000, &[0]).is_ok());
        assert_eq!(core.read_memory(0x0, 2), vec![0xFF, 0xFF]);
        assert!(matches!(
            core.read_8(0x1000_0000, &mut [0]),
            Err(Error::InvalidAddress(_))
        ));
    }
}
