// Chunk: docs/chunks/chunk_search - Incremental regex search over chunked text

//! Regex matching over UTF-16 code units with partial-match results.
//!
//! Patterns are parsed by `regex-syntax` and compiled to a small NFA
//! program executed in lockstep over the input. The engine exists because
//! chunked search needs *hard partial* results ("the input ended while a
//! match attempt could still succeed"), which the mainstream byte-oriented
//! engines do not report, and because the haystack is UTF-16.
//!
//! Matching is leftmost-first: attempts are tried in start order, and
//! within an attempt, alternation order and greediness decide priority.
//! When the end of a non-final slice is reached, a live attempt that
//! outranks every completed match yields [`MatchResult::Partial`]; the
//! caller buffers from the partial's start and retries with more input.

use regex_syntax::hir::{Class, Hir, HirKind, Look};

/// Upper bound on compiled program size; generous for hand-written search
/// patterns while bounding pathological counted repetitions.
const MAX_PROGRAM_SIZE: usize = 1 << 16;

/// A pattern rejected at construction time.
#[derive(Debug, thiserror::Error)]
pub enum RegexError {
    #[error("invalid pattern: {0}")]
    Parse(#[from] Box<regex_syntax::Error>),
    #[error("unsupported pattern construct: {0}")]
    Unsupported(&'static str),
    #[error("compiled pattern is too large")]
    TooLarge,
}

/// The outcome of matching one slice of input.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchResult {
    /// The engine failed. This VM never produces it, but consumers of the
    /// contract must treat it as "stop scanning, report nothing".
    Error,
    /// No match, and no attempt can be revived by more input.
    None,
    /// The input ended while the attempt starting at `start_offset` could
    /// still match given more input.
    Partial { start_offset: u32 },
    /// A complete match over `[start_offset, end_offset)` code units.
    Full { start_offset: u32, end_offset: u32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LookKind {
    TextStart,
    TextEnd,
    LineStart,
    LineEnd,
    WordBoundary,
    NotWordBoundary,
}

#[derive(Debug)]
enum Inst {
    /// Consume one scalar contained in `ranges` (sorted, inclusive).
    Ranges {
        ranges: Box<[(u32, u32)]>,
        next: usize,
    },
    Jump {
        next: usize,
    },
    /// Try `preferred` first; `alternate` is the lower-priority branch.
    Split {
        preferred: usize,
        alternate: usize,
    },
    /// Zero-width assertion.
    Look {
        kind: LookKind,
        next: usize,
    },
    Match,
}

/// A compiled search pattern.
#[derive(Debug)]
pub struct Regex {
    pattern: String,
    program: Vec<Inst>,
    start: usize,
}

/// Reusable per-scan scratch space: thread lists and visit stamps.
///
/// Construct one per scan and pass it to every `match_units` call.
#[derive(Debug, Default)]
pub struct MatchData {
    current: ThreadList,
    next: ThreadList,
}

impl MatchData {
    pub fn new(_regex: &Regex) -> Self {
        Self::default()
    }
}

#[derive(Clone, Copy, Debug)]
struct Thread {
    pc: usize,
    start: u32,
}

#[derive(Debug, Default)]
struct ThreadList {
    threads: Vec<Thread>,
    seen: Vec<u64>,
    generation: u64,
}

impl ThreadList {
    fn clear(&mut self, program_size: usize) {
        self.threads.clear();
        self.seen.resize(program_size, 0);
        self.generation += 1;
    }
}

/// What surrounds the current input position; drives zero-width assertions.
#[derive(Clone, Copy, Debug)]
struct LookContext {
    previous: Option<char>,
    next: Option<char>,
    at_start: bool,
    at_end: bool,
}

impl LookKind {
    fn is_satisfied(self, context: &LookContext) -> bool {
        match self {
            LookKind::TextStart => context.at_start,
            LookKind::TextEnd => context.at_end,
            LookKind::LineStart => context.at_start || context.previous == Some('\n'),
            LookKind::LineEnd => {
                context.at_end || context.next == Some('\n') || context.next == Some('\r')
            }
            LookKind::WordBoundary => is_word(context.previous) != is_word(context.next),
            LookKind::NotWordBoundary => is_word(context.previous) == is_word(context.next),
        }
    }
}

fn is_word(character: Option<char>) -> bool {
    match character {
        Some(c) => c.is_alphanumeric() || c == '_',
        None => false,
    }
}

impl Regex {
    pub fn new(pattern: &str) -> Result<Self, RegexError> {
        let mut parser = regex_syntax::Parser::new();
        let hir = parser.parse(pattern).map_err(Box::new)?;
        let mut compiler = Compiler {
            program: Vec::new(),
        };
        let fragment = compiler.compile(&hir)?;
        let match_index = compiler.emit(Inst::Match)?;
        compiler.patch(&fragment.outs, match_index);
        Ok(Self {
            pattern: pattern.to_string(),
            program: compiler.program,
            start: fragment.start,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Matches one slice of the logical input.
    ///
    /// `is_final` tells the engine that no further input follows, which
    /// suppresses partial results. Offsets are UTF-16 code units into
    /// `data`; a surrogate pair is decoded as one scalar spanning two
    /// units.
    pub fn match_units(
        &self,
        data: &[u16],
        match_data: &mut MatchData,
        is_final: bool,
    ) -> MatchResult {
        let MatchData { current, next } = match_data;
        current.clear(self.program.len());
        next.clear(self.program.len());

        // Zero-length matches are only reported for empty input (the
        // caller's end-of-scan probe); on ordinary input they would pin
        // the scan in place instead of advancing it.
        let allow_empty = data.is_empty();

        let mut matched: Option<(u32, u32)> = None;
        let mut position: u32 = 0;
        let mut previous_char: Option<char> = None;

        loop {
            let decoded = decode_scalar(data, position);
            let context = LookContext {
                previous: previous_char,
                next: decoded.map(|(c, _)| c),
                at_start: position == 0,
                at_end: decoded.is_none(),
            };
            // New attempts stop once a match exists: a later start can
            // never outrank it.
            if matched.is_none() {
                add_thread(&self.program, current, self.start, position, &context);
            }

            let Some((current_char, width)) = decoded else {
                break;
            };
            let after = decode_scalar(data, position + width);
            let step_context = LookContext {
                previous: Some(current_char),
                next: after.map(|(c, _)| c),
                at_start: false,
                at_end: after.is_none(),
            };

            let mut index = 0;
            while index < current.threads.len() {
                let thread = current.threads[index];
                match &self.program[thread.pc] {
                    Inst::Ranges { ranges, next: then } => {
                        if ranges_contain(ranges, current_char as u32) {
                            add_thread(&self.program, next, *then, thread.start, &step_context);
                        }
                    }
                    Inst::Match => {
                        if position > thread.start || allow_empty {
                            // Lower-priority threads cannot beat this match.
                            matched = Some((thread.start, position));
                            current.threads.truncate(index + 1);
                            break;
                        }
                    }
                    _ => unreachable!("thread lists hold only consuming instructions"),
                }
                index += 1;
            }

            std::mem::swap(current, next);
            next.clear(self.program.len());
            previous_char = Some(current_char);
            position += width;
            if current.threads.is_empty() && matched.is_some() {
                break;
            }
        }

        // Resolve the surviving threads at the end of input, in priority
        // order. A live consuming path that outranks every completed match
        // is a hard partial unless this slice is final.
        for thread in &current.threads {
            match &self.program[thread.pc] {
                Inst::Ranges { .. } => {
                    if !is_final {
                        return MatchResult::Partial {
                            start_offset: thread.start,
                        };
                    }
                }
                Inst::Match => {
                    if position > thread.start || allow_empty {
                        matched = Some((thread.start, position));
                        break;
                    }
                }
                _ => unreachable!("thread lists hold only consuming instructions"),
            }
        }

        match matched {
            Some((start_offset, end_offset)) => MatchResult::Full {
                start_offset,
                end_offset,
            },
            None => MatchResult::None,
        }
    }
}

fn ranges_contain(ranges: &[(u32, u32)], scalar: u32) -> bool {
    let index = ranges.partition_point(|&(start, _)| start <= scalar);
    index > 0 && scalar <= ranges[index - 1].1
}

fn decode_scalar(data: &[u16], position: u32) -> Option<(char, u32)> {
    let index = position as usize;
    let unit = *data.get(index)?;
    if (0xD800..=0xDBFF).contains(&unit) {
        if let Some(&low) = data.get(index + 1) {
            if (0xDC00..=0xDFFF).contains(&low) {
                let scalar = 0x10000 + (((unit as u32 - 0xD800) << 10) | (low as u32 - 0xDC00));
                if let Some(character) = char::from_u32(scalar) {
                    return Some((character, 2));
                }
            }
        }
    }
    // Lone surrogates decode as the replacement character, one unit wide.
    Some((
        char::from_u32(unit as u32).unwrap_or(char::REPLACEMENT_CHARACTER),
        1,
    ))
}

fn add_thread(
    program: &[Inst],
    list: &mut ThreadList,
    pc: usize,
    start: u32,
    context: &LookContext,
) {
    if list.seen[pc] == list.generation {
        return;
    }
    list.seen[pc] = list.generation;
    match &program[pc] {
        Inst::Jump { next } => add_thread(program, list, *next, start, context),
        Inst::Split {
            preferred,
            alternate,
        } => {
            add_thread(program, list, *preferred, start, context);
            add_thread(program, list, *alternate, start, context);
        }
        Inst::Look { kind, next } => {
            if kind.is_satisfied(context) {
                add_thread(program, list, *next, start, context);
            }
        }
        Inst::Ranges { .. } | Inst::Match => list.threads.push(Thread { pc, start }),
    }
}

/// Which target field of an instruction is still unresolved.
#[derive(Clone, Copy)]
enum HoleSlot {
    Next,
    Preferred,
    Alternate,
}

type Hole = (usize, HoleSlot);

/// A compiled sub-expression: its entry point and the dangling exits that
/// the caller patches to whatever follows.
struct Fragment {
    start: usize,
    outs: Vec<Hole>,
}

struct Compiler {
    program: Vec<Inst>,
}

impl Compiler {
    fn emit(&mut self, inst: Inst) -> Result<usize, RegexError> {
        if self.program.len() >= MAX_PROGRAM_SIZE {
            return Err(RegexError::TooLarge);
        }
        self.program.push(inst);
        Ok(self.program.len() - 1)
    }

    fn patch(&mut self, holes: &[Hole], target: usize) {
        for &(index, slot) in holes {
            match (&mut self.program[index], slot) {
                (Inst::Ranges { next, .. }, HoleSlot::Next)
                | (Inst::Jump { next }, HoleSlot::Next)
                | (Inst::Look { next, .. }, HoleSlot::Next) => *next = target,
                (Inst::Split { preferred, .. }, HoleSlot::Preferred) => *preferred = target,
                (Inst::Split { alternate, .. }, HoleSlot::Alternate) => *alternate = target,
                _ => unreachable!("hole does not match instruction shape"),
            }
        }
    }

    fn compile(&mut self, hir: &Hir) -> Result<Fragment, RegexError> {
        match hir.kind() {
            HirKind::Empty => {
                let index = self.emit(Inst::Jump { next: usize::MAX })?;
                Ok(Fragment {
                    start: index,
                    outs: vec![(index, HoleSlot::Next)],
                })
            }
            HirKind::Literal(literal) => {
                let decoded = std::str::from_utf8(&literal.0)
                    .map_err(|_| RegexError::Unsupported("non-UTF-8 literal"))?;
                let mut fragment: Option<Fragment> = None;
                for character in decoded.chars() {
                    let index = self.emit(Inst::Ranges {
                        ranges: Box::new([(character as u32, character as u32)]),
                        next: usize::MAX,
                    })?;
                    let unit = Fragment {
                        start: index,
                        outs: vec![(index, HoleSlot::Next)],
                    };
                    fragment = Some(self.chain(fragment, unit));
                }
                match fragment {
                    Some(fragment) => Ok(fragment),
                    None => self.compile(&Hir::empty()),
                }
            }
            HirKind::Class(class) => {
                let ranges: Box<[(u32, u32)]> = match class {
                    Class::Unicode(unicode) => unicode
                        .ranges()
                        .iter()
                        .map(|range| (range.start() as u32, range.end() as u32))
                        .collect(),
                    Class::Bytes(bytes) => bytes
                        .ranges()
                        .iter()
                        .map(|range| (range.start() as u32, range.end() as u32))
                        .collect(),
                };
                let index = self.emit(Inst::Ranges {
                    ranges,
                    next: usize::MAX,
                })?;
                Ok(Fragment {
                    start: index,
                    outs: vec![(index, HoleSlot::Next)],
                })
            }
            HirKind::Look(look) => {
                let kind = match look {
                    Look::Start => LookKind::TextStart,
                    Look::End => LookKind::TextEnd,
                    Look::StartLF | Look::StartCRLF => LookKind::LineStart,
                    Look::EndLF | Look::EndCRLF => LookKind::LineEnd,
                    Look::WordAscii | Look::WordUnicode => LookKind::WordBoundary,
                    Look::WordAsciiNegate | Look::WordUnicodeNegate => LookKind::NotWordBoundary,
                    _ => return Err(RegexError::Unsupported("lookaround")),
                };
                let index = self.emit(Inst::Look {
                    kind,
                    next: usize::MAX,
                })?;
                Ok(Fragment {
                    start: index,
                    outs: vec![(index, HoleSlot::Next)],
                })
            }
            HirKind::Repetition(repetition) => {
                self.compile_repetition(
                    &repetition.sub,
                    repetition.min,
                    repetition.max,
                    repetition.greedy,
                )
            }
            HirKind::Capture(capture) => self.compile(&capture.sub),
            HirKind::Concat(parts) => {
                let mut fragment: Option<Fragment> = None;
                for part in parts {
                    let next = self.compile(part)?;
                    fragment = Some(self.chain(fragment, next));
                }
                match fragment {
                    Some(fragment) => Ok(fragment),
                    None => self.compile(&Hir::empty()),
                }
            }
            HirKind::Alternation(branches) => {
                let mut outs = Vec::new();
                let mut start = None;
                let mut previous_split: Option<usize> = None;
                for (index, branch) in branches.iter().enumerate() {
                    // Every branch but the last gets a split that prefers
                    // it and falls through to the rest of the alternation.
                    let split = if index + 1 < branches.len() {
                        Some(self.emit(Inst::Split {
                            preferred: usize::MAX,
                            alternate: usize::MAX,
                        })?)
                    } else {
                        None
                    };
                    let fragment = self.compile(branch)?;
                    if let Some(split) = split {
                        self.patch(&[(split, HoleSlot::Preferred)], fragment.start);
                    }
                    let branch_start = split.unwrap_or(fragment.start);
                    match previous_split {
                        None => start = Some(branch_start),
                        Some(previous) => {
                            self.patch(&[(previous, HoleSlot::Alternate)], branch_start)
                        }
                    }
                    previous_split = split;
                    outs.extend(fragment.outs);
                }
                Ok(Fragment {
                    start: start.expect("alternation has at least one branch"),
                    outs,
                })
            }
        }
    }

    /// Joins two fragments in sequence, patching the first one's exits to
    /// the second one's entry.
    fn chain(&mut self, previous: Option<Fragment>, next: Fragment) -> Fragment {
        match previous {
            None => next,
            Some(previous) => {
                self.patch(&previous.outs, next.start);
                Fragment {
                    start: previous.start,
                    outs: next.outs,
                }
            }
        }
    }

    fn compile_repetition(
        &mut self,
        sub: &Hir,
        min: u32,
        max: Option<u32>,
        greedy: bool,
    ) -> Result<Fragment, RegexError> {
        let mut fragment: Option<Fragment> = None;

        for _ in 0..min {
            let copy = self.compile(sub)?;
            fragment = Some(self.chain(fragment, copy));
        }

        let (body_slot, exit_slot) = if greedy {
            (HoleSlot::Preferred, HoleSlot::Alternate)
        } else {
            (HoleSlot::Alternate, HoleSlot::Preferred)
        };

        match max {
            None => {
                // Loop: prefer the body when greedy, the exit when lazy.
                let split = self.emit(Inst::Split {
                    preferred: usize::MAX,
                    alternate: usize::MAX,
                })?;
                let body = self.compile(sub)?;
                self.patch(&body.outs, split);
                self.patch(&[(split, body_slot)], body.start);
                fragment = Some(self.chain(
                    fragment,
                    Fragment {
                        start: split,
                        outs: vec![(split, exit_slot)],
                    },
                ));
            }
            Some(max) => {
                // Bounded tail: a chain of optional copies whose exits all
                // skip to the end of the repetition.
                let mut exits = Vec::new();
                for _ in min..max {
                    let split = self.emit(Inst::Split {
                        preferred: usize::MAX,
                        alternate: usize::MAX,
                    })?;
                    let body = self.compile(sub)?;
                    self.patch(&[(split, body_slot)], body.start);
                    exits.push((split, exit_slot));
                    fragment = Some(self.chain(
                        fragment,
                        Fragment {
                            start: split,
                            outs: body.outs,
                        },
                    ));
                }
                if let Some(fragment) = &mut fragment {
                    fragment.outs.extend(exits);
                }
            }
        }

        match fragment {
            Some(fragment) => Ok(fragment),
            None => self.compile(&Hir::empty()),
        }
    }
}
