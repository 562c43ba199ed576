//! Locates structural anchors in instruction streams, capturing the symbols and labels
//! seen along the way for reuse when building spliced code.
//!
//! Matching works by escalating specificity: an outer scan finds a coarse seed (say, the
//! first call to some method), then the anchor walk narrows within a bounded window. That
//! keeps repeated opcodes from producing false positives while staying robust to
//! non-structural recompilations of the host method.

use crate::stream::{self, Direction, InstrId, Instruction, LabelId, Opcode, Operand, Stream};
use crate::symbols::Symbol;
use std::collections::HashMap;
use std::fmt::Display;

/// A value remembered during a match attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Captured {
    Sym(Symbol),
    Label(LabelId),
    Int(i64),
    Pos(InstrId),
}

/// Named captures populated during a single matcher run and read-only during splicing.
///
/// A name, once written, is never overwritten within the same attempt: the *first*
/// occurrence of a field reference is the one the surrounding code already proved safe.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CaptureTable {
    entries: HashMap<&'static str, Captured>,
}

impl CaptureTable {
    /// Records a capture. Returns false (and keeps the old value) if `name` was already
    /// written during this attempt.
    pub fn record(&mut self, name: &'static str, value: Captured) -> bool {
        if self.entries.contains_key(name) {
            return false;
        }

        self.entries.insert(name, value);
        true
    }

    pub fn get(&self, name: &str) -> Option<&Captured> {
        self.entries.get(name)
    }

    pub fn symbol(&self, name: &str) -> eyre::Result<Symbol> {
        match self.get(name) {
            Some(Captured::Sym(symbol)) => Ok(symbol.clone()),
            Some(other) => eyre::bail!("capture '{name}' holds {other:?}, not a symbol"),
            None => eyre::bail!("no capture named '{name}'"),
        }
    }

    pub fn label(&self, name: &str) -> eyre::Result<LabelId> {
        match self.get(name) {
            Some(Captured::Label(label)) => Ok(*label),
            Some(other) => eyre::bail!("capture '{name}' holds {other:?}, not a label"),
            None => eyre::bail!("no capture named '{name}'"),
        }
    }

    pub fn position(&self, name: &str) -> eyre::Result<InstrId> {
        match self.get(name) {
            Some(Captured::Pos(id)) => Ok(*id),
            Some(other) => eyre::bail!("capture '{name}' holds {other:?}, not a position"),
            None => eyre::bail!("no capture named '{name}'"),
        }
    }
}

/// How strictly a predicate is applied while walking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepMode {
    /// Must match the instruction the walk is currently at, else the whole anchor fails.
    Immediate,

    /// Keep walking until it matches, bounded by the spec's window.
    UntilSeen,
}

type Test = Box<dyn Fn(&Instruction, &mut CaptureTable) -> bool + Send + Sync>;

/// One step of an anchor signature: a test over the instruction (and the captures so
/// far), plus optional recording of what matched.
pub struct Predicate {
    mode: StepMode,
    test: Test,
    mark: Option<&'static str>,
}

impl Predicate {
    pub fn new(
        mode: StepMode,
        test: impl Fn(&Instruction, &mut CaptureTable) -> bool + Send + Sync + 'static,
    ) -> Predicate {
        Predicate {
            mode,
            test: Box::new(test),
            mark: None,
        }
    }

    /// Matches any instruction with the given opcode.
    pub fn opcode(mode: StepMode, opcode: Opcode) -> Predicate {
        Predicate::new(mode, move |instr, _| instr.opcode == opcode)
    }

    /// Matches an instruction with the given opcode whose symbol operand has the given
    /// signature string.
    pub fn opcode_with_symbol(
        mode: StepMode,
        opcode: Opcode,
        signature: impl Into<String>,
    ) -> Predicate {
        let signature = signature.into();

        Predicate::new(mode, move |instr, _| {
            instr.opcode == opcode
                && instr
                    .symbol()
                    .map(|symbol| symbol.signature() == signature)
                    .unwrap_or(false)
        })
    }

    pub fn store_to(mode: StepMode, field_signature: impl Into<String>) -> Predicate {
        Predicate::opcode_with_symbol(mode, Opcode::StoreField, field_signature)
    }

    pub fn call_to(mode: StepMode, method_signature: impl Into<String>) -> Predicate {
        Predicate::opcode_with_symbol(mode, Opcode::Call, method_signature)
    }

    /// On match, also records the instruction's symbol operand under `name`.
    pub fn capture_symbol(self, name: &'static str) -> Predicate {
        let Predicate { mode, test, mark } = self;

        Predicate {
            mode,
            mark,
            test: Box::new(move |instr, captures| {
                if !test(instr, captures) {
                    return false;
                }

                if let Some(symbol) = instr.symbol() {
                    captures.record(name, Captured::Sym(symbol.clone()));
                }

                true
            }),
        }
    }

    /// On match, also records the instruction's label operand under `name`.
    pub fn capture_label(self, name: &'static str) -> Predicate {
        let Predicate { mode, test, mark } = self;

        Predicate {
            mode,
            mark,
            test: Box::new(move |instr, captures| {
                if !test(instr, captures) {
                    return false;
                }

                if let Operand::Label(label) = &instr.operand {
                    captures.record(name, Captured::Label(*label));
                }

                true
            }),
        }
    }

    /// On match, also records the instruction's immediate operand under `name`.
    pub fn capture_immediate(self, name: &'static str) -> Predicate {
        let Predicate { mode, test, mark } = self;

        Predicate {
            mode,
            mark,
            test: Box::new(move |instr, captures| {
                if !test(instr, captures) {
                    return false;
                }

                if let Operand::Immediate(value) = &instr.operand {
                    captures.record(name, Captured::Int(*value));
                }

                true
            }),
        }
    }

    /// On match, records the matched instruction's identity under `name`, for use as a
    /// replace-range bound.
    pub fn mark(mut self, name: &'static str) -> Predicate {
        self.mark = Some(name);
        self
    }
}

/// An ordered anchor signature: predicates applied while walking `direction` from the
/// seed, giving up after `window` instructions have been visited.
pub struct AnchorSpec {
    direction: Direction,
    window: usize,
    steps: Vec<Predicate>,
}

impl AnchorSpec {
    pub fn new(direction: Direction, window: usize) -> AnchorSpec {
        AnchorSpec {
            direction,
            window,
            steps: vec![],
        }
    }

    pub fn then(mut self, predicate: Predicate) -> AnchorSpec {
        self.steps.push(predicate);
        self
    }
}

/// A confirmed anchor: the final matched instruction and the finalised captures.
#[derive(Debug)]
pub struct Anchor {
    pub point: usize,
    pub point_id: InstrId,
    pub captures: CaptureTable,
}

#[derive(Debug)]
pub enum MatchError {
    SeedOutOfBounds { seed: usize, len: usize },

    /// An immediate predicate did not match the instruction the walk was at.
    ImmediateMismatch { step: usize, offset: usize },

    /// A predicate never matched within the window (or the walk ran off the stream).
    WindowExhausted { step: usize, window: usize },
}

impl Display for MatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MatchError::SeedOutOfBounds { seed, len } => {
                write!(f, "seed offset {seed} is outside the stream (length {len})")
            }
            MatchError::ImmediateMismatch { step, offset } => {
                write!(f, "predicate {step} required a match at offset {offset}")
            }
            MatchError::WindowExhausted { step, window } => {
                write!(f, "predicate {step} found no match within {window} instructions")
            }
        }
    }
}

impl std::error::Error for MatchError {}

/// Walks the stream from `seed` per `spec`, applying predicates in order. The first
/// predicate is applied to the seed instruction itself.
///
/// A failed match is not a skip condition: it means the host's layout no longer fits the
/// patch's assumption, and the caller treats it as a hard load-time error.
pub fn find_anchor(stream: &Stream, seed: usize, spec: &AnchorSpec) -> Result<Anchor, MatchError> {
    if seed >= stream.len() {
        return Err(MatchError::SeedOutOfBounds {
            seed,
            len: stream.len(),
        });
    }

    let mut captures = CaptureTable::default();
    let mut pos = Some(seed);
    let mut visited = 0usize;
    let mut last_matched = seed;

    for (step_index, predicate) in spec.steps.iter().enumerate() {
        loop {
            let index = match pos {
                Some(index) if index < stream.len() => index,
                _ => {
                    // Running off either end of the stream is the same failure as never
                    // matching within the window.
                    return Err(MatchError::WindowExhausted {
                        step: step_index,
                        window: spec.window,
                    });
                }
            };

            if visited >= spec.window {
                return Err(MatchError::WindowExhausted {
                    step: step_index,
                    window: spec.window,
                });
            }

            visited += 1;
            let instr = &stream[index];

            if (predicate.test)(instr, &mut captures) {
                if let Some(name) = predicate.mark {
                    captures.record(name, Captured::Pos(stream.id_at(index).unwrap()));
                }

                last_matched = index;
                pos = stream::step(index, spec.direction);
                break;
            }

            match predicate.mode {
                StepMode::Immediate => {
                    return Err(MatchError::ImmediateMismatch {
                        step: step_index,
                        offset: index,
                    });
                }
                StepMode::UntilSeen => pos = stream::step(index, spec.direction),
            }
        }
    }

    Ok(Anchor {
        point: last_matched,
        point_id: stream.id_at(last_matched).unwrap(),
        captures,
    })
}
