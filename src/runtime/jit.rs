//! JIT code managers.

use crate::dac::JitManagerInfo;

/// Kind of code a JIT manager produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum CodeKind {
    /// Jitted or ahead-of-time compiled IL
    Managed,
    /// Native code called through interop
    Native,
    /// IL compiled by the optimizing JIT
    OptimizedIl,
    /// Runtime generated stubs
    Runtime,
}

impl From<u32> for CodeKind {
    fn from(value: u32) -> Self {
        // Low two bits of the manager's code type
        match value & 0x3 {
            0 => CodeKind::Managed,
            1 => CodeKind::Native,
            2 => CodeKind::OptimizedIl,
            _ => CodeKind::Runtime,
        }
    }
}

/// A code manager owning one or more code heaps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClrJitManager {
    /// Address of the manager
    pub address: u64,
    /// What kind of code it manages
    pub kind: CodeKind,
    /// Head of the manager's code heap list
    pub heap_list: u64,
}

impl From<JitManagerInfo> for ClrJitManager {
    fn from(info: JitManagerInfo) -> Self {
        ClrJitManager {
            address: info.address,
            kind: CodeKind::from(info.code_type),
            heap_list: info.heap_list,
        }
    }
}
