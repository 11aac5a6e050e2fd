//! Shared fixtures for unit tests: an in-memory target and a programmable query gateway.


pub use dac::*;
pub use reader::*;

use crate::dac::{MethodTableData, SegmentData};

// Helper function to create method table data for a plain reference type
pub fn method_table(parent: u64, base_size: u32, component_size: u32) -> MethodTableData {
    MethodTableData {
        module: 0x7000,
        parent_method_table: parent,
        base_size,
        component_size,
        ..Default::default()
    }
}

// Helper function to create a segment whose committed and reserved ends follow its allocated end
pub fn segment(address: u64, start: u64, allocated: u64, next: u64) -> SegmentData {
    SegmentData {
        address,
        start,
        allocated,
        committed: allocated + 0x1000,
        reserved: allocated + 0x10000,
        used: allocated,
        next,
        background_allocated: allocated,
        flags: 0,
        heap: 0,
    }
}
