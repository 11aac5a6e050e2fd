//! The single pass state machine behind [`super::parse_name`].
//!
//! The parser walks the input once, left to right. Type names are recorded as extents into
//! the input rather than copied. Top-level names go to one list and generic arguments to
//! another; when an argument list closes, its entries are folded back into the generic
//! types still waiting for arguments, outer lists last. The machine never recurses, so
//! nesting depth only costs list space.

use super::segment::{render, TypeNameSegment};

const ARITY: u8 = b'`';
const SEPARATOR: u8 = b',';
const NESTED: u8 = b'+';
const OPEN: u8 = b'[';
const CLOSE: u8 = b']';

/// Generic argument lists nested deeper than this are rejected
const MAX_LIST_DEPTH: usize = 256;
/// Arity values beyond this cannot come from a real type
const MAX_ARITY: usize = 0xFFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    TypeName,
    QualifiedArgName,
    PlainArgName,
    ArraySpecifier,
    NestedClass,
    GenericArgCount,
    GenericArgs,
    ArgAssemblySpecifier,
    ResolveGenericList,
    Error,
    Done,
}

/// Result of a successful parse
pub(super) enum Parsed {
    /// The input already is the display name
    Original,
    /// The rewritten display name
    Rendered(String),
}

pub(super) struct NameParser<'a> {
    name: &'a str,
    bytes: &'a [u8],
    pos: usize,
    state: State,
    arena: Vec<TypeNameSegment>,
    names: Option<Vec<usize>>,
    args: Vec<usize>,
    nested_depth: usize,
    list_depth: usize,
    /// One entry per generic argument being parsed: is it wrapped as `[name, assembly]`
    qualified: Vec<bool>,
}

impl<'a> NameParser<'a> {
    pub(super) fn new(name: &'a str) -> Self {
        NameParser {
            name,
            bytes: name.as_bytes(),
            pos: 0,
            state: State::TypeName,
            arena: Vec::new(),
            names: None,
            args: Vec::new(),
            nested_depth: 0,
            list_depth: 0,
            qualified: Vec::new(),
        }
    }

    /// Run the machine to completion. `None` means the input could not be parsed.
    pub(super) fn run(mut self) -> Option<Parsed> {
        // Every state either consumes input or moves to a state that does
        let mut budget = self.bytes.len().saturating_mul(8).saturating_add(64);

        while !matches!(self.state, State::Done | State::Error) {
            budget = budget.checked_sub(1)?;
            if let Some(parsed) = self.step()? {
                return Some(parsed);
            }
        }

        if self.state == State::Error {
            return None;
        }

        let names = self.names.as_ref()?;
        let mut out = String::with_capacity(self.bytes.len());
        for index in names {
            render(self.name, &self.arena, *index, &mut out, 0)?;
        }
        Some(Parsed::Rendered(out))
    }

    fn at(&self, pos: usize) -> Option<u8> {
        self.bytes.get(pos).copied()
    }

    fn is_qualified_arg(&self) -> bool {
        self.qualified.last().copied().unwrap_or(false)
    }

    /// The most recent argument if any are pending, else the most recent top-level name
    fn current_target(&self) -> Option<usize> {
        match self.args.last() {
            Some(last) => Some(*last),
            None => self.names.as_ref().and_then(|names| names.last().copied()),
        }
    }

    fn advance_to(&mut self, (state, pos): (State, usize)) {
        self.state = state;
        self.pos = pos;
    }

    /// Execute one state. `Some(Some(_))` finishes early, `None` aborts the parse.
    fn step(&mut self) -> Option<Option<Parsed>> {
        match self.state {
            State::TypeName => {
                if self.parse_type_name() {
                    return Some(Some(Parsed::Original));
                }

                let current = self.at(self.pos)?;
                if current == SEPARATOR {
                    if self.is_qualified_arg() {
                        self.state = State::ArgAssemblySpecifier;
                        return Some(None);
                    }
                } else if current == OPEN && !self.any_unfulfilled() {
                    // A list without a preceding arity, as some compilers and obfuscators
                    // emit. `[]` and `[,` are array specifiers instead.
                    if let Some(next) = self.at(self.pos + 1) {
                        if next != CLOSE && next != SEPARATOR {
                            let arity = manual_arity(self.bytes, self.pos + 1);
                            if let Some(target) = self.current_target() {
                                self.arena[target].set_expected_args(arity);
                            }
                            self.state = State::GenericArgs;
                            return Some(None);
                        }
                    }
                }

                let next = self.next_state(self.pos);
                self.advance_to(next);
            }
            State::QualifiedArgName | State::PlainArgName => {
                let qualified = self.state == State::QualifiedArgName;
                self.parse_type_name();
                self.qualified.push(qualified);

                let Some(current) = self.at(self.pos) else {
                    self.state = State::Error;
                    return Some(None);
                };

                match current {
                    ARITY => {
                        self.state = State::GenericArgCount;
                        self.pos += 1;
                        return Some(None);
                    }
                    OPEN => {
                        self.state = State::ArraySpecifier;
                        return Some(None);
                    }
                    SEPARATOR | CLOSE => {}
                    _ => {
                        self.state = State::Error;
                        return Some(None);
                    }
                }

                if qualified {
                    self.skip_assembly_name();
                }

                match self.at(self.pos) {
                    None => {
                        self.qualified.pop();
                        self.state = State::Error;
                    }
                    // The qualified entry stays until the list is resolved
                    Some(CLOSE) => {
                        let next = self.next_state(self.pos);
                        self.advance_to(next);
                    }
                    Some(SEPARATOR) => {
                        self.qualified.pop();
                        let next = self.next_state(self.pos);
                        self.advance_to(next);
                    }
                    Some(_) => {
                        self.qualified.pop();
                        self.state = State::Error;
                    }
                }
            }
            State::NestedClass => {
                self.nested_depth += 1;
                self.state = State::TypeName;
            }
            State::GenericArgCount => {
                let arity = self.parse_arity()?;
                let Some(target) = self.current_target() else {
                    self.state = State::Error;
                    return Some(None);
                };
                self.arena[target].set_expected_args(arity);

                // An open generic such as `List`1` inside an argument list
                if let Some(current) = self.at(self.pos) {
                    if current != OPEN && current != NESTED {
                        self.arena[target].mark_non_closed();

                        if self.is_qualified_arg() {
                            self.state = if current == SEPARATOR {
                                State::ArgAssemblySpecifier
                            } else {
                                State::Error
                            };
                            return Some(None);
                        }
                    }
                }

                let next = self.next_state(self.pos);
                self.advance_to(next);
            }
            State::ArgAssemblySpecifier => {
                self.skip_assembly_name();
                self.qualified.pop()?;
                let next = self.next_state(self.pos);
                self.advance_to(next);
            }
            State::GenericArgs => {
                self.list_depth += 1;
                if self.list_depth > MAX_LIST_DEPTH {
                    return None;
                }

                if self.at(self.pos + 1)? == OPEN {
                    self.state = State::QualifiedArgName;
                    self.pos += 2;
                } else {
                    self.state = State::PlainArgName;
                    self.pos += 1;
                }
            }
            State::ArraySpecifier => return Some(self.parse_array_specifier()),
            State::ResolveGenericList => self.resolve_generic_list()?,
            State::Error | State::Done => {}
        }

        Some(None)
    }

    /// Record the type name at the cursor. Returns `true` when the input needs no rewriting.
    fn parse_type_name(&mut self) -> bool {
        let start = self.pos;
        self.pos = name_extent(self.bytes, start, self.list_depth != 0);

        if self.is_original(self.pos) {
            return true;
        }

        let segment = TypeNameSegment::new(start..self.pos, self.nested_depth != 0, self.list_depth);
        let index = self.arena.len();
        self.arena.push(segment);

        if self.list_depth == 0 {
            self.names.get_or_insert_with(Vec::new).push(index);
        } else {
            self.args.push(index);
        }

        self.nested_depth = self.nested_depth.saturating_sub(1);
        false
    }

    fn parse_array_specifier(&mut self) -> Option<Parsed> {
        let mut dimensions = 1;
        while let Some(current) = self.at(self.pos) {
            if current == CLOSE {
                break;
            }
            if current == SEPARATOR {
                dimensions += 1;
            }
            self.pos += 1;
        }
        if self.pos != self.bytes.len() {
            self.pos += 1;
        }

        if self.list_depth == 0 && self.names.is_none() {
            self.state = State::Error;
            return None;
        }

        let target = if self.list_depth != 0 {
            self.args.last().copied()
        } else {
            self.names.as_ref().and_then(|names| names.last().copied())
        };
        let Some(target) = target else {
            self.state = State::Error;
            return None;
        };
        self.arena[target].set_array_dimensions(dimensions);

        let (next_state, next_pos) = self.next_state(self.pos);
        if next_state != State::ArraySpecifier && next_state != State::Done {
            if self.is_qualified_arg() {
                // `, assembly]` after the array would read as another argument
                self.skip_assembly_name();
                let next = self.next_state(self.pos);
                self.advance_to(next);
            } else {
                self.advance_to((next_state, next_pos));
            }
            self.qualified.pop();
        } else {
            self.advance_to((next_state, next_pos));
        }

        // `System.String[,,]` or `System.Int32[][]`
        if self.args.is_empty() && self.is_original(self.pos) {
            return Some(Parsed::Original);
        }
        None
    }

    fn resolve_generic_list(&mut self) -> Option<()> {
        self.list_depth = self.list_depth.checked_sub(1)?;
        let qualified = self.is_qualified_arg();

        if self.args.is_empty() {
            // Already propagated while unwinding an inner list
            self.qualified.pop()?;
            let next = self.next_state(self.pos);
            self.advance_to(next);
            return Some(());
        }

        if !self.resolve_parsed_args() {
            self.qualified.pop()?;
            self.state = State::Error;
            return Some(());
        }

        let Some(current) = self.at(self.pos) else {
            self.qualified.pop();
            self.state = State::Done;
            return Some(());
        };

        if current == SEPARATOR {
            if qualified {
                self.state = State::ArgAssemblySpecifier;
                return Some(());
            }

            self.qualified.pop()?;
            self.pos += 1;
            let Some(pos) = skip_spaces(self.bytes, self.pos) else {
                self.state = State::Error;
                return Some(());
            };
            self.pos = pos;

            // The assembly name of an enclosing qualified argument
            if self.is_qualified_arg() {
                self.state = State::ArgAssemblySpecifier;
                return Some(());
            }

            if self.at(self.pos)? == OPEN {
                self.state = State::QualifiedArgName;
                self.pos += 1;
            } else {
                self.state = State::PlainArgName;
            }
            return Some(());
        }

        self.qualified.pop();
        let next = self.next_state(self.pos);
        self.advance_to(next);
        Some(())
    }

    /// Fold the arguments of the list that just closed into the types waiting for them.
    fn resolve_parsed_args(&mut self) -> bool {
        let depth = self.list_depth;
        let mut propagated = false;

        let mut target = self.last_unfulfilled_arg(self.args.len(), depth);
        while let Some(index) = target {
            propagated = true;
            if !self.patch_arg(index) {
                return false;
            }
            target = self.last_unfulfilled_arg(index, depth);
        }

        self.unify_nested_args(depth);

        if propagated && depth != 0 {
            return true;
        }

        let Some(names) = self.names.as_ref() else {
            return false;
        };
        let Some(mut target) = names
            .iter()
            .position(|index| self.arena[*index].has_unfulfilled_args())
        else {
            return false;
        };

        while !self.args.is_empty() {
            let arg = self.args.remove(0);
            let segment = names[target];
            if !self.arena[segment].add_arg(arg) {
                return false;
            }

            if !self.arena[segment].has_unfulfilled_args() && !self.args.is_empty() {
                let Some(offset) = names[target..]
                    .iter()
                    .position(|index| self.arena[*index].has_unfulfilled_args())
                else {
                    return false;
                };
                target += offset;
            }
        }

        true
    }

    fn last_unfulfilled_arg(&self, before: usize, depth: usize) -> Option<usize> {
        (0..before).rev().find(|position| {
            let segment = &self.arena[self.args[*position]];
            segment.has_unfulfilled_args() && segment.depth == depth
        })
    }

    /// Fill every missing argument of the generic at `position` from the entries after it.
    ///
    /// A nested generic inside a generic parent receives its arguments after those of its
    /// parents: `Foo`2+Bar`1[[A],[B],[C]]` gives `C` to `Bar`.
    fn patch_arg(&mut self, position: usize) -> bool {
        let target = self.args[position];
        let mut next: Option<usize> = None;

        while self.arena[target].has_unfulfilled_args() {
            if position + 1 >= self.args.len() {
                return false;
            }

            let segment = &self.arena[target];
            if segment.is_nested && segment.is_generic() && next.is_none() {
                let mut skip = position + 1;
                for earlier in (0..position).rev() {
                    let parent = &self.arena[self.args[earlier]];
                    if parent.depth != segment.depth {
                        break;
                    }
                    if parent.is_generic() {
                        skip += parent.remaining_args();
                    }
                    if !parent.is_nested {
                        break;
                    }
                }
                next = Some(skip);
            }

            let start = next.unwrap_or(position + 1);
            if let Some(found) =
                (start..self.args.len()).find(|candidate| !self.arena[self.args[*candidate]].is_nested)
            {
                next = Some(found);
            }

            let Some(source) = next else {
                return false;
            };
            if source == position {
                return false;
            }
            let Some(&arg) = self.args.get(source) else {
                return false;
            };

            if !self.arena[target].add_arg(arg) {
                return false;
            }
            self.args.remove(source);
        }

        true
    }

    /// Attach resolved nested classes of this list level to the entry before them.
    fn unify_nested_args(&mut self, depth: usize) {
        let mut position = self.args.len();
        while position > 1 {
            position -= 1;
            let candidate = self.args[position];
            if self.arena[candidate].depth < depth {
                break;
            }

            if self.arena[candidate].is_nested && !self.arena[candidate].has_unfulfilled_args() {
                let parent = self.args[position - 1];
                self.arena[parent].unify_nested(candidate);
                self.args.remove(position);
            }
        }
    }

    fn any_unfulfilled(&self) -> bool {
        let unfulfilled = |index: &usize| {
            let segment = &self.arena[*index];
            segment.is_generic() && segment.has_unfulfilled_args()
        };

        self.names
            .as_ref()
            .is_some_and(|names| names.iter().any(unfulfilled))
            || self.args.iter().any(unfulfilled)
    }

    /// Whether parsing ended on a name that needs no rewriting: plain, nested without
    /// generics, or generic without any arguments supplied.
    fn is_original(&self, pos: usize) -> bool {
        if pos != self.bytes.len() {
            return false;
        }

        self.names.as_ref().map_or(true, |names| {
            names.iter().all(|index| {
                let segment = &self.arena[*index];
                !segment.is_generic() || segment.expected_args() == segment.remaining_args()
            })
        })
    }

    fn skip_assembly_name(&mut self) {
        while let Some(current) = self.at(self.pos) {
            if current == CLOSE {
                break;
            }
            self.pos += 1;
        }
        if self.pos != self.bytes.len() {
            self.pos += 1;
        }
    }

    fn parse_arity(&mut self) -> Option<usize> {
        let mut arity: usize = 0;
        while let Some(digit) = self.at(self.pos).filter(u8::is_ascii_digit) {
            arity = arity
                .checked_mul(10)?
                .checked_add(usize::from(digit - b'0'))?;
            if arity > MAX_ARITY {
                return None;
            }
            self.pos += 1;
        }
        Some(arity)
    }

    fn next_state(&self, pos: usize) -> (State, usize) {
        let Some(current) = self.at(pos) else {
            return (State::Done, pos);
        };

        match current {
            SEPARATOR => {
                let Some(pos) = skip_spaces(self.bytes, pos + 1) else {
                    return (State::Error, pos + 1);
                };
                if self.bytes[pos] == OPEN {
                    (State::QualifiedArgName, pos + 1)
                } else {
                    (State::PlainArgName, pos)
                }
            }
            ARITY => (State::GenericArgCount, pos + 1),
            NESTED => (State::NestedClass, pos + 1),
            OPEN => match self.at(pos + 1) {
                Some(CLOSE | SEPARATOR) => (State::ArraySpecifier, pos),
                Some(_) => (State::GenericArgs, pos),
                None => (State::Error, pos),
            },
            CLOSE => (State::ResolveGenericList, pos + 1),
            _ => (State::Error, pos),
        }
    }
}

/// End of the type name starting at `pos`.
///
/// A backtick only ends a name when digits follow; names such as `` `vcall' `` contain one.
/// Inside argument lists `,` ends a name and `+` does not, since arguments may be nested
/// types.
fn name_extent(bytes: &[u8], mut pos: usize, in_list: bool) -> usize {
    while let Some(&current) = bytes.get(pos) {
        let ends = match current {
            OPEN | CLOSE => true,
            SEPARATOR => in_list,
            NESTED => !in_list,
            ARITY => bytes.get(pos + 1).map_or(true, u8::is_ascii_digit),
            _ => false,
        };
        if ends {
            break;
        }
        pos += 1;
    }
    pos
}

/// Count the top-level entries of the argument list starting at `start`.
fn manual_arity(bytes: &[u8], start: usize) -> usize {
    let mut arity = 1;
    let mut nesting = 0_usize;
    for current in bytes.iter().skip(start) {
        match *current {
            SEPARATOR if nesting == 0 => arity += 1,
            CLOSE => {
                if nesting == 0 {
                    break;
                }
                nesting -= 1;
            }
            OPEN => nesting += 1,
            _ => {}
        }
    }
    arity
}

/// Skip spaces; `None` if the input ends.
fn skip_spaces(bytes: &[u8], mut pos: usize) -> Option<usize> {
    while bytes.get(pos) == Some(&b' ') {
        pos += 1;
    }
    (pos < bytes.len()).then_some(pos)
}
