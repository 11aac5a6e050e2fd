//! Parse-time type name nodes and their rendering.

use std::ops::Range;

/// Upper bound on rendering recursion, deeper trees are treated as malformed
const MAX_RENDER_DEPTH: usize = 512;

/// One dotted name component seen during a parse.
///
/// Segments live in an arena owned by a single parse. Generic arguments and the unified
/// nested class refer to other segments of the same arena by index.
#[derive(Debug, Clone)]
pub(super) struct TypeNameSegment {
    pub(super) extent: Range<usize>,
    pub(super) is_nested: bool,
    /// Generic argument list nesting level the segment was parsed at, `0` for top level
    pub(super) depth: usize,
    expected_args: usize,
    args: Vec<usize>,
    array_dimensions: usize,
    array_of_arrays: usize,
    non_closed: bool,
    nested: Option<usize>,
}

impl TypeNameSegment {
    pub(super) fn new(extent: Range<usize>, is_nested: bool, depth: usize) -> Self {
        TypeNameSegment {
            extent,
            is_nested,
            depth,
            expected_args: 0,
            args: Vec::new(),
            array_dimensions: 0,
            array_of_arrays: 0,
            non_closed: false,
            nested: None,
        }
    }

    pub(super) fn is_generic(&self) -> bool {
        self.expected_args != 0
    }

    pub(super) fn has_unfulfilled_args(&self) -> bool {
        self.is_generic() && !self.non_closed && self.args.len() < self.expected_args
    }

    pub(super) fn expected_args(&self) -> usize {
        self.expected_args
    }

    pub(super) fn remaining_args(&self) -> usize {
        if self.non_closed {
            0
        } else {
            self.expected_args.saturating_sub(self.args.len())
        }
    }

    pub(super) fn set_expected_args(&mut self, count: usize) {
        self.expected_args = count;
    }

    pub(super) fn mark_non_closed(&mut self) {
        self.non_closed = true;
    }

    /// `T[,]` sets the rank once, every further `[]` makes it an array of arrays.
    pub(super) fn set_array_dimensions(&mut self, dimensions: usize) {
        if self.array_dimensions == 0 {
            self.array_dimensions = dimensions;
        } else {
            self.array_of_arrays += 1;
        }
    }

    /// Fill the next argument slot. Returns `false` if every slot is already taken.
    pub(super) fn add_arg(&mut self, arg: usize) -> bool {
        if self.expected_args == 0 {
            return true;
        }
        if self.args.len() >= self.expected_args {
            return false;
        }
        self.args.push(arg);
        true
    }

    pub(super) fn unify_nested(&mut self, nested: usize) {
        self.nested = Some(nested);
    }
}

/// Render the segment at `index` into `out`. Returns `None` on a malformed tree.
pub(super) fn render(
    name: &str,
    arena: &[TypeNameSegment],
    index: usize,
    out: &mut String,
    depth: usize,
) -> Option<()> {
    if depth > MAX_RENDER_DEPTH {
        return None;
    }

    let segment = arena.get(index)?;
    if segment.is_nested {
        out.push('+');
    }
    out.push_str(name.get(segment.extent.clone())?);

    if segment.is_generic() {
        out.push('<');
        if segment.args.is_empty() || segment.non_closed {
            push_missing_args(out, segment.args.len(), segment.expected_args);
        } else {
            for (position, arg) in segment.args.iter().enumerate() {
                if position != 0 {
                    out.push_str(", ");
                }
                render(name, arena, *arg, out, depth + 1)?;
            }
            if segment.args.len() < segment.expected_args {
                push_missing_args(out, segment.args.len(), segment.expected_args);
            }
        }
        out.push('>');
    }

    if let Some(nested) = segment.nested {
        render(name, arena, nested, out, depth + 1)?;
    }

    if segment.array_of_arrays != 0 {
        out.push_str("[]");
        for _ in 0..segment.array_of_arrays {
            out.push_str("[]");
        }
    } else if segment.array_dimensions != 0 {
        out.push('[');
        for _ in 1..segment.array_dimensions {
            out.push(',');
        }
        out.push(']');
    }

    Some(())
}

/// Placeholders `T<n>` for slots the name did not fill
fn push_missing_args(out: &mut String, first_missing: usize, expected: usize) {
    for slot in first_missing..expected {
        if slot != 0 {
            out.push_str(", ");
        }
        out.push('T');
        out.push_str(&(slot + 1).to_string());
    }
}
