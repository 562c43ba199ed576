//! Splices built instruction sequences into a stream at a confirmed anchor, preserving
//! branch targets and the operand-stack contract of the surrounding code.

use crate::matcher::{Anchor, AnchorSpec, CaptureTable, MatchError};
use crate::stream::{self, Instruction, Opcode, Operand, Stream, StreamError};
use crate::symbols::MethodIdentity;
use std::fmt::Display;

/// Where a patch's code lands relative to its anchor.
pub enum Insertion {
    /// Immediately before the anchor point.
    Before,

    /// Immediately after the anchor point.
    After,

    /// Replace the captured range, bounds inclusive. Both names must have been recorded
    /// with [`crate::matcher::Predicate::mark`] during the anchor walk.
    Replace {
        start: &'static str,
        end: &'static str,
    },
}

/// Builds the instruction sequence to splice in, from the finalised captures.
///
/// Builders may reference captured symbols (so inserted code can re-load a field the
/// original code already loaded) and may only branch to labels that already exist in the
/// stream — the captured-label guarded-branch idiom. They never mint labels of their own.
pub type Builder = Box<dyn Fn(&CaptureTable) -> eyre::Result<Vec<Instruction>> + Send + Sync>;

/// The outer, cheaper scan that locates a coarse starting point for the anchor walk.
pub struct Seed {
    /// Human-readable description, used when reporting a failed patch.
    pub desc: String,
    pub find: Box<dyn Fn(&Instruction) -> bool + Send + Sync>,
}

impl Seed {
    pub fn new(
        desc: impl Into<String>,
        find: impl Fn(&Instruction) -> bool + Send + Sync + 'static,
    ) -> Seed {
        Seed {
            desc: desc.into(),
            find: Box::new(find),
        }
    }

    /// Seed on the first call to the method with the given signature.
    pub fn call_to(signature: impl Into<String>) -> Seed {
        let signature = signature.into();
        let desc = format!("first call to '{signature}'");

        Seed::new(desc, move |instr: &Instruction| {
            instr.opcode == Opcode::Call
                && instr
                    .symbol()
                    .map(|symbol| symbol.signature() == signature)
                    .unwrap_or(false)
        })
    }

    /// Seed on the first store to the field with the given signature.
    pub fn store_to(signature: impl Into<String>) -> Seed {
        let signature = signature.into();
        let desc = format!("first store to '{signature}'");

        Seed::new(desc, move |instr: &Instruction| {
            instr.opcode == Opcode::StoreField
                && instr
                    .symbol()
                    .map(|symbol| symbol.signature() == signature)
                    .unwrap_or(false)
        })
    }
}

/// Everything needed to patch one method: constructed at registration time, applied
/// exactly once during the load-time pass, then discarded.
pub struct PatchDescriptor {
    pub target: MethodIdentity,
    pub seed: Seed,
    pub anchor: AnchorSpec,
    pub insertion: Insertion,
    pub builder: Builder,
}

/// Why a patch could not be applied. Every variant is fatal for its descriptor at load
/// time; the target method is left unmodified rather than partially patched.
#[derive(Debug)]
pub enum PatchError {
    /// The image has no body for the target method.
    NoSuchMethod,

    /// The seed scan found nothing to anchor from.
    SeedNotFound,

    /// The anchor walk failed: the host's layout no longer matches this patch.
    Anchor(MatchError),

    /// The builder itself failed.
    Builder(eyre::Report),

    /// A replace-range bound is missing, of the wrong kind, or inverted.
    Range(eyre::Report),

    /// Label or call-operand corruption detected while splicing.
    Stream(StreamError),

    /// The built sequence does not reproduce the stack effect of what it displaced.
    /// This indicates a builder bug, never a runtime condition.
    StackImbalance { built: i32, displaced: i32 },
}

impl Display for PatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PatchError::NoSuchMethod => f.write_str("target method is not present in the image"),
            PatchError::SeedNotFound => f.write_str("seed instruction was not found"),
            PatchError::Anchor(err) => write!(f, "anchor not found: {err}"),
            PatchError::Builder(err) => write!(f, "builder failed: {err}"),
            PatchError::Range(err) => write!(f, "replace range is invalid: {err}"),
            PatchError::Stream(err) => write!(f, "stream corruption: {err}"),
            PatchError::StackImbalance { built, displaced } => write!(
                f,
                "spliced code changes the stack by {built} where {displaced} is required"
            ),
        }
    }
}

impl std::error::Error for PatchError {}

impl From<MatchError> for PatchError {
    fn from(err: MatchError) -> PatchError {
        PatchError::Anchor(err)
    }
}

impl From<StreamError> for PatchError {
    fn from(err: StreamError) -> PatchError {
        PatchError::Stream(err)
    }
}

/// Splices the descriptor's code into the stream at the confirmed anchor.
///
/// The stack contract is checked before the stream is touched, so a failed apply leaves
/// the stream exactly as it was: an inserted block must be operand-stack-neutral from the
/// perspective of the code that follows it, which for a replacement means reproducing the
/// net effect of the displaced range.
pub fn apply(
    stream: &mut Stream,
    anchor: &Anchor,
    descriptor: &PatchDescriptor,
) -> Result<(), PatchError> {
    // Resolve the insertion point as a half-open range of displaced instructions.
    let (start, end) = match &descriptor.insertion {
        Insertion::Before => (anchor.point, anchor.point),
        Insertion::After => (anchor.point + 1, anchor.point + 1),
        Insertion::Replace { start, end } => {
            let start_id = anchor.captures.position(start).map_err(PatchError::Range)?;
            let end_id = anchor.captures.position(end).map_err(PatchError::Range)?;

            let start = stream
                .index_of(start_id)
                .ok_or_else(|| PatchError::Range(eyre::eyre!("start bound is gone")))?;
            let end = stream
                .index_of(end_id)
                .ok_or_else(|| PatchError::Range(eyre::eyre!("end bound is gone")))?;

            if end < start {
                return Err(PatchError::Range(eyre::eyre!(
                    "range is inverted ({start}..{end})"
                )));
            }

            (start, end + 1)
        }
    };

    let block = (descriptor.builder)(&anchor.captures).map_err(PatchError::Builder)?;

    // A label that is not already bound in this stream would dangle after splicing.
    for instr in &block {
        if let Operand::Label(label) = &instr.operand {
            if stream.label_target(*label).is_none() {
                return Err(PatchError::Stream(StreamError::DanglingLabel(*label)));
            }
        }
    }

    let displaced = stream::net_effect((start..end).map(|index| &stream[index]))?;
    let built = stream::net_effect(&block)?;

    if built != displaced {
        return Err(PatchError::StackImbalance { built, displaced });
    }

    stream.remove_range(start, end)?;
    stream.insert_at(start, block);

    stream.verify_labels()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::{find_anchor, Predicate, StepMode};
    use crate::stream::Direction;
    use crate::symbols::Symbol;
    use pretty_assertions::assert_eq;

    fn card() -> Symbol {
        Symbol::field("Host.Card card")
    }

    fn descriptor(insertion: Insertion, builder: Builder) -> PatchDescriptor {
        PatchDescriptor {
            target: MethodIdentity::new("Host.Combat", "void AttackPhase()"),
            seed: Seed::store_to(card().signature()),
            anchor: AnchorSpec::new(Direction::Forward, 16).then(
                Predicate::store_to(StepMode::UntilSeen, card().signature())
                    .capture_symbol("card"),
            ),
            insertion,
            builder,
        }
    }

    /// `[store_field card; branch_if_false skip; ret]`, with the branch label captured
    /// separately by the caller.
    fn guarded_body() -> (Stream, crate::stream::LabelId) {
        let mut stream = Stream::from_instrs(vec![
            Instruction::store_field(card()),
            Instruction::new(Opcode::BranchIfFalse, Operand::None),
            Instruction::new(Opcode::Ret, Operand::None),
        ]);

        let skip = stream.bind_label(2);

        // Rewrite the placeholder branch to carry the real label.
        let branch = Instruction::branch_if_false(skip);
        stream.remove_range(1, 2).unwrap();
        stream.insert_at(1, vec![branch]);

        (stream, skip)
    }

    #[test]
    fn guarded_insert_leaves_the_original_branch_alone() {
        let (mut stream, skip) = guarded_body();

        let descriptor = descriptor(
            Insertion::After,
            Box::new(move |captures: &CaptureTable| {
                let card = captures.symbol("card")?;

                Ok(vec![
                    Instruction::load_field(card),
                    Instruction::load_null(),
                    Instruction::cmp_ne(),
                    Instruction::branch_if_false(skip),
                ])
            }),
        );

        let anchor = find_anchor(&stream, 0, &descriptor.anchor).unwrap();
        apply(&mut stream, &anchor, &descriptor).unwrap();

        let opcodes: Vec<Opcode> = stream.iter().map(|instr| instr.opcode).collect();
        assert_eq!(
            opcodes,
            vec![
                Opcode::StoreField,
                Opcode::LoadField,
                Opcode::LoadNull,
                Opcode::CmpNe,
                Opcode::BranchIfFalse,
                Opcode::BranchIfFalse,
                Opcode::Ret,
            ]
        );

        // Both branches short-circuit to the same instruction, by identity.
        assert_eq!(stream.label_target(skip), Some(6));
        stream.verify_labels().unwrap();
    }

    #[test]
    fn imbalanced_builders_are_rejected_without_mutating() {
        let (mut stream, _skip) = guarded_body();

        let descriptor = descriptor(
            Insertion::After,
            Box::new(|_: &CaptureTable| Ok(vec![Instruction::load_null()])),
        );

        let anchor = find_anchor(&stream, 0, &descriptor.anchor).unwrap();
        let err = apply(&mut stream, &anchor, &descriptor).unwrap_err();

        assert!(matches!(
            err,
            PatchError::StackImbalance {
                built: 1,
                displaced: 0
            }
        ));
        assert_eq!(stream.len(), 3);
    }

    #[test]
    fn foreign_labels_cannot_escape_the_builder() {
        let (mut stream, _skip) = guarded_body();
        let foreign = {
            let (mut other, _) = guarded_body();
            other.bind_label(0)
        };

        let descriptor = descriptor(
            Insertion::After,
            Box::new(move |_: &CaptureTable| {
                Ok(vec![
                    Instruction::load_null(),
                    Instruction::branch_if_false(foreign),
                ])
            }),
        );

        let anchor = find_anchor(&stream, 0, &descriptor.anchor).unwrap();
        let err = apply(&mut stream, &anchor, &descriptor).unwrap_err();

        assert!(matches!(
            err,
            PatchError::Stream(StreamError::DanglingLabel(_))
        ));
    }

    #[test]
    fn call_substitution_must_reproduce_the_displaced_stack_effect() {
        // `[load_field a; load_field b; load_const 7; call OriginalTrigger; ret]`, where
        // the original trigger consumes both loads plus the constant.
        let original = Symbol::method("void OriginalTrigger(Slot, Slot, Int32)", 3, false);
        let replacement = Symbol::method("void DispatchTrigger(Slot, Slot)", 2, false);

        let build_body = || {
            Stream::from_instrs(vec![
                Instruction::load_field(Symbol::field("Host.Slot attacking")),
                Instruction::load_field(Symbol::field("Host.Slot opposing")),
                Instruction::load_const(7),
                Instruction::call(original.clone()),
                Instruction::new(Opcode::Ret, Operand::None),
            ])
        };

        let make_descriptor = |replacement: Symbol| PatchDescriptor {
            target: MethodIdentity::new("Host.Combat", "void AttackPhase()"),
            seed: Seed::call_to(original.signature()),
            anchor: AnchorSpec::new(Direction::Backward, 8)
                .then(
                    Predicate::opcode(StepMode::Immediate, Opcode::Call).mark("end"),
                )
                .then(
                    Predicate::opcode(StepMode::Immediate, Opcode::LoadConst).mark("start"),
                ),
            insertion: Insertion::Replace {
                start: "start",
                end: "end",
            },
            builder: Box::new(move |_: &CaptureTable| {
                Ok(vec![Instruction::call(replacement.clone())])
            }),
        };

        // The replacement call takes the two already-pushed arguments: same net effect
        // as `push 7; call original`, so the splice goes through.
        let mut stream = build_body();
        let descriptor = make_descriptor(replacement);
        let seed = stream
            .find(0, Direction::Forward, &descriptor.seed.find)
            .unwrap();
        let anchor = find_anchor(&stream, seed, &descriptor.anchor).unwrap();
        apply(&mut stream, &anchor, &descriptor).unwrap();

        let opcodes: Vec<Opcode> = stream.iter().map(|instr| instr.opcode).collect();
        assert_eq!(
            opcodes,
            vec![
                Opcode::LoadField,
                Opcode::LoadField,
                Opcode::Call,
                Opcode::Ret,
            ]
        );

        // A replacement with the wrong arity upsets the stack contract and is rejected.
        let mut stream = build_body();
        let bad = make_descriptor(Symbol::method("void DispatchTrigger(Slot)", 1, false));
        let seed = stream.find(0, Direction::Forward, &bad.seed.find).unwrap();
        let anchor = find_anchor(&stream, seed, &bad.anchor).unwrap();

        assert!(matches!(
            apply(&mut stream, &anchor, &bad),
            Err(PatchError::StackImbalance { .. })
        ));
    }
}
