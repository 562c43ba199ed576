//! The mutable instruction sequences that patches are matched against and spliced into.
//!
//! Labels bind to instruction *identity*, never to numeric position. Offsets are derived
//! on demand, so inserting or removing instructions can never silently retarget a branch.

use crate::symbols::Symbol;
use std::collections::HashMap;
use std::fmt::Display;

/// The operations the engine needs to recognise and emit. This is not a full machine ISA;
/// it is the closed set sufficient to express the patterns patches anchor on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum Opcode {
    LoadLocal,
    StoreLocal,
    LoadField,
    StoreField,
    LoadConst,
    LoadNull,
    CmpEq,
    CmpNe,
    Branch,
    BranchIfFalse,
    Call,
    Dup,
    Pop,
    Ret,
}

impl Opcode {
    /// Net operand-stack effect of this opcode, or `None` if the effect depends on the
    /// operand (calls, which pop their arguments and may push a result).
    fn fixed_stack_delta(self) -> Option<i32> {
        Some(match self {
            Opcode::LoadLocal | Opcode::LoadField | Opcode::LoadConst | Opcode::LoadNull => 1,
            Opcode::Dup => 1,
            Opcode::StoreLocal | Opcode::StoreField | Opcode::Pop => -1,
            // Comparisons pop two values and push the result.
            Opcode::CmpEq | Opcode::CmpNe => -1,
            Opcode::BranchIfFalse => -1,
            Opcode::Branch | Opcode::Ret => 0,
            Opcode::Call => return None,
        })
    }
}

/// Identity of a single instruction within one stream. Stable across mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstrId(u32);

/// A branch target. The stream maps each label to the identity of the instruction it
/// points at; a label with no mapping is a corruption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LabelId(u32);

impl Display for LabelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// An opcode's argument.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    None,
    Immediate(i64),
    SymbolRef(Symbol),
    Label(LabelId),
}

impl Display for Operand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operand::None => Ok(()),
            Operand::Immediate(value) => value.fmt(f),
            Operand::SymbolRef(symbol) => symbol.fmt(f),
            Operand::Label(label) => label.fmt(f),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub opcode: Opcode,
    pub operand: Operand,

    /// Where this instruction sat in the unpatched method body, or `None` for
    /// instructions a patch inserted.
    pub original_offset: Option<usize>,
}

impl Instruction {
    pub fn new(opcode: Opcode, operand: Operand) -> Instruction {
        Instruction {
            opcode,
            operand,
            original_offset: None,
        }
    }

    pub fn load_field(symbol: Symbol) -> Instruction {
        Instruction::new(Opcode::LoadField, Operand::SymbolRef(symbol))
    }

    pub fn store_field(symbol: Symbol) -> Instruction {
        Instruction::new(Opcode::StoreField, Operand::SymbolRef(symbol))
    }

    pub fn load_local(symbol: Symbol) -> Instruction {
        Instruction::new(Opcode::LoadLocal, Operand::SymbolRef(symbol))
    }

    pub fn load_const(value: i64) -> Instruction {
        Instruction::new(Opcode::LoadConst, Operand::Immediate(value))
    }

    pub fn load_null() -> Instruction {
        Instruction::new(Opcode::LoadNull, Operand::None)
    }

    pub fn cmp_ne() -> Instruction {
        Instruction::new(Opcode::CmpNe, Operand::None)
    }

    pub fn call(symbol: Symbol) -> Instruction {
        Instruction::new(Opcode::Call, Operand::SymbolRef(symbol))
    }

    pub fn branch_if_false(label: LabelId) -> Instruction {
        Instruction::new(Opcode::BranchIfFalse, Operand::Label(label))
    }

    /// Net operand-stack effect of executing this instruction.
    pub fn stack_delta(&self) -> Result<i32, StreamError> {
        if let Some(delta) = self.opcode.fixed_stack_delta() {
            return Ok(delta);
        }

        // Calls resolve their effect from the method symbol's signature.
        match &self.operand {
            Operand::SymbolRef(Symbol::Method { args, returns, .. }) => {
                Ok(-(*args as i32) + *returns as i32)
            }
            other => Err(StreamError::BadCallOperand {
                found: other.to_string(),
            }),
        }
    }

    /// The symbol this instruction references, if any.
    pub fn symbol(&self) -> Option<&Symbol> {
        match &self.operand {
            Operand::SymbolRef(symbol) => Some(symbol),
            _ => None,
        }
    }
}

impl Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.original_offset {
            Some(offset) => write!(f, "{:04} {} {}", offset, self.opcode, self.operand),
            None => write!(f, "  +  {} {}", self.opcode, self.operand),
        }
    }
}

/// Ways a stream mutation or query can report corruption.
#[derive(Debug)]
pub enum StreamError {
    /// An instruction references a label with no binding in this stream.
    DanglingLabel(LabelId),

    /// `remove_range` would orphan a label bound to an instruction inside the range.
    LabelIntoRemoved { label: LabelId, offset: usize },

    /// A call instruction whose operand is not a method symbol, so its stack effect
    /// cannot be computed.
    BadCallOperand { found: String },
}

impl Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamError::DanglingLabel(label) => {
                write!(f, "label {label} is not bound in this stream")
            }
            StreamError::LabelIntoRemoved { label, offset } => write!(
                f,
                "label {label} is bound to the instruction at offset {offset}, inside the removed range"
            ),
            StreamError::BadCallOperand { found } => {
                write!(f, "call operand '{found}' is not a method symbol")
            }
        }
    }
}

impl std::error::Error for StreamError {}

/// Which way to walk a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

struct Entry {
    id: InstrId,
    instr: Instruction,
}

/// An ordered, mutable sequence of instructions: one method body.
pub struct Stream {
    entries: Vec<Entry>,
    labels: HashMap<LabelId, InstrId>,
    next_instr: u32,
    next_label: u32,
}

impl Stream {
    /// Builds a stream from the instructions of an unpatched method body, recording each
    /// instruction's original offset.
    pub fn from_instrs(instrs: Vec<Instruction>) -> Stream {
        let mut stream = Stream {
            entries: Vec::with_capacity(instrs.len()),
            labels: HashMap::new(),
            next_instr: 0,
            next_label: 0,
        };

        for (offset, mut instr) in instrs.into_iter().enumerate() {
            instr.original_offset = Some(offset);
            let id = stream.fresh_id();
            stream.entries.push(Entry { id, instr });
        }

        stream
    }

    fn fresh_id(&mut self) -> InstrId {
        let id = InstrId(self.next_instr);
        self.next_instr += 1;
        id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Instruction> {
        self.entries.get(index).map(|entry| &entry.instr)
    }

    pub fn id_at(&self, index: usize) -> Option<InstrId> {
        self.entries.get(index).map(|entry| entry.id)
    }

    /// Derives the current offset of an instruction from its identity.
    pub fn index_of(&self, id: InstrId) -> Option<usize> {
        self.entries.iter().position(|entry| entry.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Instruction> {
        self.entries.iter().map(|entry| &entry.instr)
    }

    /// Creates a label bound to the identity of the instruction at `index`.
    pub fn bind_label(&mut self, index: usize) -> LabelId {
        let target = self.entries[index].id;
        let label = LabelId(self.next_label);
        self.next_label += 1;
        self.labels.insert(label, target);
        label
    }

    pub fn label_instr(&self, label: LabelId) -> Option<InstrId> {
        self.labels.get(&label).copied()
    }

    /// The current offset a label resolves to.
    pub fn label_target(&self, label: LabelId) -> Option<usize> {
        self.label_instr(label).and_then(|id| self.index_of(id))
    }

    /// Inserts `instrs` so that the first of them lands at `index`. Labels are untouched:
    /// they follow the instructions they are bound to.
    pub fn insert_at(&mut self, index: usize, instrs: Vec<Instruction>) {
        assert!(index <= self.entries.len(), "insert_at out of bounds");

        let entries: Vec<Entry> = instrs
            .into_iter()
            .map(|instr| Entry {
                id: self.fresh_id(),
                instr,
            })
            .collect();

        self.entries.splice(index..index, entries);
    }

    /// Removes the instructions in `[start, end)`. Fails without mutating if any label is
    /// bound into the range, since removing its target would leave the label dangling.
    pub fn remove_range(&mut self, start: usize, end: usize) -> Result<(), StreamError> {
        assert!(
            start <= end && end <= self.entries.len(),
            "remove_range out of bounds"
        );

        for offset in start..end {
            let id = self.entries[offset].id;

            if let Some((label, _)) = self.labels.iter().find(|(_, target)| **target == id) {
                return Err(StreamError::LabelIntoRemoved {
                    label: *label,
                    offset,
                });
            }
        }

        self.entries.drain(start..end);
        Ok(())
    }

    /// Finds the first instruction matching `pred`, walking from `from` in `direction`.
    pub fn find(
        &self,
        from: usize,
        direction: Direction,
        pred: impl Fn(&Instruction) -> bool,
    ) -> Option<usize> {
        let mut index = from;

        loop {
            let instr = self.get(index)?;

            if pred(instr) {
                return Some(index);
            }

            index = step(index, direction)?;
        }
    }

    /// Checks that every label operand in the stream resolves to a live instruction.
    pub fn verify_labels(&self) -> Result<(), StreamError> {
        for entry in &self.entries {
            if let Operand::Label(label) = &entry.instr.operand {
                if self.label_target(*label).is_none() {
                    return Err(StreamError::DanglingLabel(*label));
                }
            }
        }

        Ok(())
    }
}

impl Clone for Stream {
    fn clone(&self) -> Stream {
        Stream {
            entries: self
                .entries
                .iter()
                .map(|entry| Entry {
                    id: entry.id,
                    instr: entry.instr.clone(),
                })
                .collect(),
            labels: self.labels.clone(),
            next_instr: self.next_instr,
            next_label: self.next_label,
        }
    }
}

impl std::ops::Index<usize> for Stream {
    type Output = Instruction;

    fn index(&self, index: usize) -> &Instruction {
        &self.entries[index].instr
    }
}

pub(crate) fn step(index: usize, direction: Direction) -> Option<usize> {
    match direction {
        Direction::Forward => index.checked_add(1),
        Direction::Backward => index.checked_sub(1),
    }
}

/// Sums the stack deltas of a built instruction sequence.
pub fn net_effect<'a>(
    instrs: impl IntoIterator<Item = &'a Instruction>,
) -> Result<i32, StreamError> {
    let mut total = 0;

    for instr in instrs {
        total += instr.stack_delta()?;
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn field() -> Symbol {
        Symbol::field("Host.Slot card")
    }

    fn body() -> Stream {
        Stream::from_instrs(vec![
            Instruction::load_field(field()),
            Instruction::load_null(),
            Instruction::cmp_ne(),
            Instruction::store_field(field()),
            Instruction::new(Opcode::Ret, Operand::None),
        ])
    }

    #[test]
    fn labels_track_identity_across_insertion() {
        let mut stream = body();

        let label = stream.bind_label(3);
        let bound_id = stream.label_instr(label).unwrap();

        stream.insert_at(1, vec![Instruction::load_null(), Instruction::load_null()]);

        // Same instruction by identity, shifted by exactly the two inserted instructions.
        assert_eq!(stream.label_instr(label), Some(bound_id));
        assert_eq!(stream.label_target(label), Some(5));
        assert_eq!(stream[5].opcode, Opcode::StoreField);
    }

    #[test]
    fn insertion_after_label_leaves_target_alone() {
        let mut stream = body();
        let label = stream.bind_label(1);

        stream.insert_at(4, vec![Instruction::load_null()]);

        assert_eq!(stream.label_target(label), Some(1));
    }

    #[test]
    fn remove_range_refuses_to_orphan_labels() {
        let mut stream = body();
        let label = stream.bind_label(2);

        let err = stream.remove_range(1, 4).unwrap_err();
        assert!(matches!(err, StreamError::LabelIntoRemoved { .. }));

        // Refusal must not have mutated anything.
        assert_eq!(stream.len(), 5);
        assert_eq!(stream.label_target(label), Some(2));

        stream.remove_range(0, 2).unwrap();
        assert_eq!(stream.label_target(label), Some(0));
    }

    #[test]
    fn find_walks_both_directions() {
        let stream = body();

        let forward = stream.find(0, Direction::Forward, |i| i.opcode == Opcode::StoreField);
        assert_eq!(forward, Some(3));

        let backward = stream.find(4, Direction::Backward, |i| i.opcode == Opcode::LoadField);
        assert_eq!(backward, Some(0));

        let missing = stream.find(0, Direction::Forward, |i| i.opcode == Opcode::Dup);
        assert_eq!(missing, None);
    }

    #[test]
    fn call_deltas_come_from_the_method_symbol() {
        let call = Instruction::call(Symbol::method("Int32 Damage(Slot, Slot)", 2, true));
        assert_eq!(call.stack_delta().unwrap(), -1);

        let bad = Instruction::call(field());
        assert!(matches!(
            bad.stack_delta(),
            Err(StreamError::BadCallOperand { .. })
        ));
    }

    #[test]
    fn guard_block_is_stack_neutral() {
        let mut stream = body();
        let label = stream.bind_label(4);

        let block = vec![
            Instruction::load_field(field()),
            Instruction::load_null(),
            Instruction::cmp_ne(),
            Instruction::branch_if_false(label),
        ];

        assert_eq!(net_effect(&block).unwrap(), 0);
    }

    #[test]
    fn dangling_label_is_detected() {
        let mut stream = body();
        let label = stream.bind_label(0);

        stream.insert_at(2, vec![Instruction::branch_if_false(label)]);
        stream.verify_labels().unwrap();

        // A label minted elsewhere has no binding in this stream.
        let unbound = LabelId(99);
        stream.insert_at(2, vec![Instruction::branch_if_false(unbound)]);
        assert!(matches!(
            stream.verify_labels(),
            Err(StreamError::DanglingLabel(_))
        ));
    }
}
