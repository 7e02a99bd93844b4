//! Guest trap and host error taxonomy.
//!
//! `Trap` is everything the guest can observe: it converts into an interrupt
//! at the next instruction boundary. `VmError` terminates the machine and
//! never enters the guest interrupt path.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Access kind recorded in fault codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Access {
    Read,
    Write,
    Execute,
}

impl Access {
    /// Numeric fault-code encoding pushed for the page-fault handler.
    pub fn code(self) -> u32 {
        match self {
            Access::Read => 0,
            Access::Write => 1,
            Access::Execute => 2,
        }
    }
}

/// Reason carried by a coprocessor fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CopFault {
    TypeMismatch,
    StackUnderflow,
    StackOverflow,
}

/// A CPU-raised condition, delivered through the IVT.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum Trap {
    #[error("invalid opcode {0:#010x}")]
    InvalidOpcode(u32),
    #[error("page fault at {addr:#010x} ({access:?}, user={user})")]
    PageFault { addr: u32, access: Access, user: bool },
    #[error("division by zero")]
    DivisionByZero,
    #[error("access violation at {addr:#010x} ({access:?})")]
    AccessViolation { addr: u32, access: Access },
    #[error("unaligned access at {addr:#010x}")]
    UnalignedAccess { addr: u32 },
    #[error("double fault")]
    DoubleFault,
    #[error("privilege violation")]
    PrivilegeFault,
    #[error("invalid irq {0}")]
    InvalidIrq(u32),
    #[error("coprocessor fault: {0:?}")]
    CoprocessorFault(CopFault),
}

pub const VECTOR_INVALID_OPCODE: u32 = 0;
pub const VECTOR_PAGE_FAULT: u32 = 1;
pub const VECTOR_DIVISION_BY_ZERO: u32 = 2;
pub const VECTOR_ACCESS_VIOLATION: u32 = 3;
pub const VECTOR_UNALIGNED_ACCESS: u32 = 4;
pub const VECTOR_DOUBLE_FAULT: u32 = 5;
pub const VECTOR_PRIVILEGE_FAULT: u32 = 6;
pub const VECTOR_INVALID_IRQ: u32 = 7;

impl Trap {
    /// IVT vector the trap is delivered on. Coprocessor faults share the
    /// invalid-opcode vector, the IVT reserves 0..7 for CPU faults.
    pub fn vector(&self) -> u32 {
        match self {
            Trap::InvalidOpcode(_) | Trap::CoprocessorFault(_) => VECTOR_INVALID_OPCODE,
            Trap::PageFault { .. } => VECTOR_PAGE_FAULT,
            Trap::DivisionByZero => VECTOR_DIVISION_BY_ZERO,
            Trap::AccessViolation { .. } => VECTOR_ACCESS_VIOLATION,
            Trap::UnalignedAccess { .. } => VECTOR_UNALIGNED_ACCESS,
            Trap::DoubleFault => VECTOR_DOUBLE_FAULT,
            Trap::PrivilegeFault => VECTOR_PRIVILEGE_FAULT,
            Trap::InvalidIrq(_) => VECTOR_INVALID_IRQ,
        }
    }

    /// Fault-code words pushed on top of the interrupt frame, as
    /// `(kind, address)`. Only memory faults carry one.
    pub fn fault_args(&self) -> Option<(u32, u32)> {
        match *self {
            Trap::PageFault { addr, access, user } => {
                Some((access.code() | if user { 0x8 } else { 0 }, addr))
            }
            Trap::AccessViolation { addr, access } => Some((access.code(), addr)),
            Trap::UnalignedAccess { addr } => Some((0, addr)),
            _ => None,
        }
    }
}

/// Host-side failure. Aborts the run loop, bypassing the guest.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("binary format error: {0}")]
    BinaryFormat(String),
    #[error("device init error: {0}")]
    DeviceInit(String),
    #[error("address conflict: region {0:#010x}+{1:#x} already routed")]
    AddressConflict(u32, u32),
    #[error("invalid page {0:#010x}")]
    InvalidPage(u32),
    #[error("invalid address {0:#010x}")]
    InvalidAddress(u32),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("invariant violation: {0}")]
    Invariant(String),
}
