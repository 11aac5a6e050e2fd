//! GC handles.

use tracing::{debug, trace};

use crate::{
    dac::{HandleData, SosDac},
    target::DataReader,
    utils::CancellationToken,
};

/// Kind of a GC handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumIter)]
pub enum ClrHandleKind {
    /// Weak, cleared before finalization
    WeakShort,
    /// Weak, tracks the object through finalization
    WeakLong,
    /// Keeps the object alive
    Strong,
    /// Keeps the object alive and fixed in place
    Pinned,
    /// Strength decided at runtime
    Variable,
    /// Strong while the reference count is non-zero
    RefCounted,
    /// Keeps a secondary object alive as long as the primary one lives
    Dependent,
    /// Pinned for the duration of an async operation
    AsyncPinned,
    /// Strong, with the size of the retained graph tracked
    SizedRef,
    /// Weak reference from a WinRT object
    WeakWinRT,
    /// A kind the crate does not know
    Unknown(u32),
}

impl From<u32> for ClrHandleKind {
    fn from(value: u32) -> Self {
        match value {
            0 => ClrHandleKind::WeakShort,
            1 => ClrHandleKind::WeakLong,
            2 => ClrHandleKind::Strong,
            3 => ClrHandleKind::Pinned,
            4 => ClrHandleKind::Variable,
            5 => ClrHandleKind::RefCounted,
            6 => ClrHandleKind::Dependent,
            7 => ClrHandleKind::AsyncPinned,
            8 => ClrHandleKind::SizedRef,
            9 => ClrHandleKind::WeakWinRT,
            other => ClrHandleKind::Unknown(other),
        }
    }
}

/// A GC handle and the object it refers to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClrHandle {
    /// Address of the handle
    pub address: u64,
    /// Object the handle refers to
    pub object: u64,
    /// Kind of the handle
    pub kind: ClrHandleKind,
    /// App domain the handle belongs to
    pub app_domain: u64,
    /// Target kept alive by a dependent handle, `0` for other kinds
    pub dependent_target: u64,
    /// Reference count of a ref-counted handle, `0` for other kinds
    pub ref_count: u32,
}

impl ClrHandle {
    /// Whether the handle keeps its object alive
    #[must_use]
    pub fn is_strong(&self) -> bool {
        match self.kind {
            ClrHandleKind::Strong
            | ClrHandleKind::Pinned
            | ClrHandleKind::AsyncPinned
            | ClrHandleKind::SizedRef => true,
            ClrHandleKind::RefCounted => self.ref_count > 0,
            _ => false,
        }
    }

    /// Whether the handle fixes its object in place
    #[must_use]
    pub fn is_pinned(&self) -> bool {
        matches!(self.kind, ClrHandleKind::Pinned | ClrHandleKind::AsyncPinned)
    }
}

/// Reference count of a ref-counted handle.
///
/// The handle itself, the COM callable wrapper and the runtime callable wrapper each keep a
/// count of their own, and any of them may be stale. The largest one wins.
fn ref_count(dac: &dyn SosDac, handle: &HandleData, object: u64) -> u32 {
    let mut count = if handle.is_pegged {
        handle.jupiter_ref_count
    } else {
        0
    };
    count = count.max(handle.ref_count);

    if let Some(ccw) = dac.ccw_data(object) {
        count = count.max(ccw.ref_count);
    }
    if let Some(rcw) = dac.rcw_data(object) {
        count = count.max(rcw.ref_count);
    }
    count
}

/// Reads every handle whose object is non-null.
///
/// `fallback_domain` is used for handles that do not report a domain.
pub(crate) fn enumerate_handles(
    dac: &dyn SosDac,
    reader: &dyn DataReader,
    fallback_domain: u64,
    cancel: &CancellationToken,
) -> Vec<ClrHandle> {
    let raw = dac.handles().unwrap_or_default();
    let mut handles = Vec::with_capacity(raw.len());

    for data in &raw {
        break_if_cancelled!(cancel, "handle table");
        let object = reader.read_pointer(data.handle).unwrap_or(0);
        if object == 0 {
            continue;
        }

        let kind = ClrHandleKind::from(data.handle_type);
        let (dependent_target, ref_count) = match kind {
            ClrHandleKind::Dependent => (data.secondary, 0),
            ClrHandleKind::RefCounted => (0, ref_count(dac, data, object)),
            _ => (0, 0),
        };

        trace!(handle = data.handle, object, %kind, "handle");
        handles.push(ClrHandle {
            address: data.handle,
            object,
            kind,
            app_domain: if data.app_domain != 0 {
                data.app_domain
            } else {
                fallback_domain
            },
            dependent_target,
            ref_count,
        });
    }

    debug!(reported = raw.len(), live = handles.len(), "handles");
    handles
}
