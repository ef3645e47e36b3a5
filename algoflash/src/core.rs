//! Primitives the flashing engine needs from a debug probe.
//!
//! The engine only ever talks to the target through [`MemoryInterface`] and
//! [`CoreInterface`]. Transport, wire protocol and connection setup live
//! behind these traits.

use crate::Error;
use algoflash_target::CoreType;
use std::time::Duration;

/// The location of a CPU register, as understood by the probe.
#[derive(Debug, Copy, Clone, PartialEq, PartialOrd, Ord, Eq, Hash)]
pub struct RegisterId(pub u16);

impl From<u16> for RegisterId {
    fn from(value: u16) -> Self {
        RegisterId(value)
    }
}

/// Describes a single core register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreRegister {
    /// Display name of the register.
    pub name: &'static str,
    /// Probe specific location of the register.
    pub id: RegisterId,
}

impl From<&CoreRegister> for RegisterId {
    fn from(register: &CoreRegister) -> RegisterId {
        register.id
    }
}

const fn reg(name: &'static str, id: u16) -> CoreRegister {
    CoreRegister {
        name,
        id: RegisterId(id),
    }
}

/// The registers involved in calling a flash algorithm routine.
#[derive(Debug, PartialEq, Eq)]
pub struct CoreRegisters {
    argument_registers: [CoreRegister; 4],
    result_register: CoreRegister,
    static_base: CoreRegister,
    stack_pointer: CoreRegister,
    return_address: CoreRegister,
    program_counter: CoreRegister,
    thumb: bool,
}

/// ARM Cortex-M: arguments in r0-r3, result in r0, static base in r9.
pub static CORTEX_M_REGISTERS: CoreRegisters = CoreRegisters {
    argument_registers: [reg("R0", 0), reg("R1", 1), reg("R2", 2), reg("R3", 3)],
    result_register: reg("R0", 0),
    static_base: reg("R9", 9),
    stack_pointer: reg("SP", 13),
    return_address: reg("LR", 14),
    program_counter: reg("PC", 15),
    thumb: true,
};

/// RISC-V: arguments in a0-a3, result in a0, static base in s1.
pub static RISCV_REGISTERS: CoreRegisters = CoreRegisters {
    argument_registers: [
        reg("a0", 0x100a),
        reg("a1", 0x100b),
        reg("a2", 0x100c),
        reg("a3", 0x100d),
    ],
    result_register: reg("a0", 0x100a),
    static_base: reg("s1", 0x1009),
    stack_pointer: reg("sp", 0x1002),
    return_address: reg("ra", 0x1001),
    program_counter: reg("pc", 0x7b1),
    thumb: false,
};

impl CoreRegisters {
    /// The register set used to call routines on the given core type.
    pub fn for_core(core_type: CoreType) -> &'static CoreRegisters {
        if core_type.is_cortex_m() {
            &CORTEX_M_REGISTERS
        } else {
            &RISCV_REGISTERS
        }
    }

    /// Returns the nth argument register.
    ///
    /// # Panics
    ///
    /// Panics if `index` is larger than 3.
    pub fn argument_register(&self, index: usize) -> &CoreRegister {
        &self.argument_registers[index]
    }

    /// The register holding the return value of a routine.
    pub fn result_register(&self) -> &CoreRegister {
        &self.result_register
    }

    /// The register holding the base address of the routine's static data.
    pub fn static_base(&self) -> &CoreRegister {
        &self.static_base
    }

    /// The stack pointer.
    pub fn stack_pointer(&self) -> &CoreRegister {
        &self.stack_pointer
    }

    /// The register a routine returns through (LR / ra).
    pub fn return_address(&self) -> &CoreRegister {
        &self.return_address
    }

    /// The program counter.
    pub fn program_counter(&self) -> &CoreRegister {
        &self.program_counter
    }

    /// Encodes a code address for a jump. Thumb cores need bit 0 set to stay in Thumb state.
    pub fn code_address(&self, address: u32) -> u32 {
        if self.thumb {
            address | 1
        } else {
            address
        }
    }
}

/// Access to target memory.
pub trait MemoryInterface {
    /// Read bytes from `address` into `data`.
    fn read_8(&mut self, address: u64, data: &mut [u8]) -> Result<(), Error>;

    /// Write `data` to `address`.
    fn write_8(&mut self, address: u64, data: &[u8]) -> Result<(), Error>;

    /// Read little endian 32 bit words from `address` into `data`.
    fn read_32(&mut self, address: u64, data: &mut [u32]) -> Result<(), Error> {
        let mut bytes = vec![0; data.len() * 4];
        self.read_8(address, &mut bytes)?;
        for (word, chunk) in data.iter_mut().zip(bytes.chunks_exact(4)) {
            *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Ok(())
    }

    /// Write 32 bit words to `address`, little endian.
    fn write_32(&mut self, address: u64, data: &[u32]) -> Result<(), Error> {
        let bytes = data
            .iter()
            .flat_map(|word| word.to_le_bytes())
            .collect::<Vec<_>>();
        self.write_8(address, &bytes)
    }
}

/// Register and run control of the core that executes flash algorithms.
pub trait CoreInterface: MemoryInterface {
    /// The register layout of this core.
    fn registers(&self) -> &'static CoreRegisters;

    /// Write a core register. The core must be halted.
    fn write_core_reg(&mut self, id: RegisterId, value: u32) -> Result<(), Error>;

    /// Read a core register. The core must be halted.
    fn read_core_reg(&mut self, id: RegisterId) -> Result<u32, Error>;

    /// Set a hardware breakpoint at `address`.
    fn set_hw_breakpoint(&mut self, address: u64) -> Result<(), Error>;

    /// Remove the hardware breakpoint at `address`.
    fn clear_hw_breakpoint(&mut self, address: u64) -> Result<(), Error>;

    /// Resume execution.
    fn run(&mut self) -> Result<(), Error>;

    /// Block until the core halts or `timeout` elapses.
    ///
    /// Returns `false` if the core is still running after the timeout.
    fn wait_for_core_halted(&mut self, timeout: Duration) -> Result<bool, Error>;

    /// Request the core to halt.
    fn halt(&mut self, timeout: Duration) -> Result<(), Error>;
}
