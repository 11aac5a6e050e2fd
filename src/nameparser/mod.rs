//! Conversion of runtime-mangled type names into display names.
//!
//! The runtime reports generic instantiations in its reflection format, with arity
//! markers and assembly-qualified argument lists. This module rewrites them into the
//! familiar angle-bracket form:
//!
//! ```text
//! System.Collections.Generic.List`1[[System.Int32, mscorlib]]
//!     => System.Collections.Generic.List<System.Int32>
//! System.Collections.Generic.HashSet`1+Slot[[Roslyn.Utilities.ReferenceHolder`1[[Microsoft.CodeAnalysis.ISymbol, Microsoft.CodeAnalysis]], Microsoft.CodeAnalysis.Workspaces]][]
//!     => System.Collections.Generic.HashSet<Roslyn.Utilities.ReferenceHolder<Microsoft.CodeAnalysis.ISymbol>>+Slot[]
//! ```
//!
//! # Grammar
//!
//! - `` ` `` followed by digits is an arity marker
//! - `+` separates a nested class from its parent
//! - `[` opens an argument list, an assembly-qualified argument or an array specifier
//! - `,` separates arguments, or an argument from its assembly name
//!
//! Arguments of a nested generic type are listed after those of its parents in one flat
//! list, and an argument can itself be generic, nested and an array. Argument lists
//! without an arity marker, as some compilers emit, are counted by hand.
//!
//! # Failure Behavior
//!
//! [`parse_name`] is total: any input it cannot make sense of is returned unchanged.
//! Inputs that already are display names (plain names, nested names, arrays of either)
//! are returned borrowed without allocating.

mod machine;
mod segment;

use std::borrow::Cow;

use tracing::trace;

use machine::{NameParser, Parsed};

/// Rewrite a runtime type name into its display form.
///
/// Returns the input itself when no rewriting is needed or the input is malformed.
///
/// # Examples
///
/// ```rust
/// use std::borrow::Cow;
/// use clrscope::parse_name;
///
/// assert_eq!(
///     parse_name("System.Collections.Generic.Dictionary`2[[System.String, mscorlib],[System.Int32, mscorlib]]"),
///     "System.Collections.Generic.Dictionary<System.String, System.Int32>"
/// );
/// assert!(matches!(parse_name("System.Int32[][]"), Cow::Borrowed(_)));
/// ```
#[must_use]
pub fn parse_name(name: &str) -> Cow<'_, str> {
    if name.is_empty() {
        return Cow::Borrowed(name);
    }

    match NameParser::new(name).run() {
        Some(Parsed::Original) => Cow::Borrowed(name),
        Some(Parsed::Rendered(rendered)) => Cow::Owned(rendered),
        None => {
            trace!(name, "could not parse type name");
            Cow::Borrowed(name)
        }
    }
}
