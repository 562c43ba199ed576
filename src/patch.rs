//! Registration of patch descriptors and the one-shot rewriting pass that runs them
//! against the host's method bodies at load time.

use crate::matcher;
use crate::splicer::{self, PatchDescriptor, PatchError};
use crate::stream::{Direction, Stream};
use crate::symbols::MethodIdentity;
use itertools::Itertools;
use std::collections::HashMap;
use std::fmt::Display;

/// The host's loaded method bodies. Rewriting happens strictly before any of these
/// methods runs; it is not safe to rewrite a method that is on the call stack.
#[derive(Default)]
pub struct Image {
    bodies: HashMap<MethodIdentity, Stream>,
}

impl Image {
    pub fn new() -> Image {
        Image::default()
    }

    pub fn insert_body(&mut self, target: MethodIdentity, body: Stream) {
        self.bodies.insert(target, body);
    }

    pub fn body(&self, target: &MethodIdentity) -> Option<&Stream> {
        self.bodies.get(target)
    }

    pub fn body_mut(&mut self, target: &MethodIdentity) -> Option<&mut Stream> {
        self.bodies.get_mut(target)
    }
}

/// One patch that could not be applied, with enough context to report it usefully.
pub struct Failure {
    pub target: MethodIdentity,
    pub seed_desc: String,
    pub error: PatchError,
}

impl Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "patch for {} (seed: {}) failed: {}",
            self.target, self.seed_desc, self.error
        )
    }
}

/// Outcome of one rewriting pass.
#[derive(Default)]
pub struct Summary {
    pub applied: usize,
    pub failures: Vec<Failure>,
}

impl Summary {
    pub fn all_applied(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Collects descriptors during registration, then applies each exactly once.
#[derive(Default)]
pub struct Patcher {
    descriptors: Vec<PatchDescriptor>,
}

impl Patcher {
    pub fn new() -> Patcher {
        Patcher::default()
    }

    pub fn register(&mut self, descriptor: PatchDescriptor) {
        self.descriptors.push(descriptor);
    }

    /// Runs every registered descriptor against the image. Descriptors are consumed:
    /// they are not retained as mutable state once the pass is over.
    ///
    /// Each failure is logged with the target method and seed description, and that
    /// method's body is left unmodified; unrelated patches still go through.
    pub fn run(self, image: &mut Image) -> Summary {
        let mut summary = Summary::default();

        for descriptor in self.descriptors {
            match apply_one(image, &descriptor) {
                Ok(()) => {
                    log::info!("patched {}", descriptor.target);
                    summary.applied += 1;
                }
                Err(error) => {
                    let failure = Failure {
                        target: descriptor.target,
                        seed_desc: descriptor.seed.desc,
                        error,
                    };

                    log::error!("{failure}");
                    summary.failures.push(failure);
                }
            }
        }

        if !summary.all_applied() {
            log::warn!(
                "{} patch(es) left their targets unmodified: {}",
                summary.failures.len(),
                summary
                    .failures
                    .iter()
                    .map(|failure| failure.target.to_string())
                    .join(", ")
            );
        }

        summary
    }
}

fn apply_one(image: &mut Image, descriptor: &PatchDescriptor) -> Result<(), PatchError> {
    let body = image
        .body_mut(&descriptor.target)
        .ok_or(PatchError::NoSuchMethod)?;

    // Splicing is all-or-nothing per descriptor: work on a scratch copy and commit only
    // a fully successful splice.
    let mut scratch = body.clone();

    let seed = scratch
        .find(0, Direction::Forward, &descriptor.seed.find)
        .ok_or(PatchError::SeedNotFound)?;

    let anchor = matcher::find_anchor(&scratch, seed, &descriptor.anchor)?;
    splicer::apply(&mut scratch, &anchor, descriptor)?;

    *body = scratch;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::{AnchorSpec, CaptureTable, Predicate, StepMode};
    use crate::splicer::{Insertion, Seed};
    use crate::stream::{Instruction, Opcode, Operand};
    use crate::symbols::Symbol;
    use pretty_assertions::assert_eq;

    fn target() -> MethodIdentity {
        MethodIdentity::new("Host.Combat", "void AttackPhase()")
    }

    fn image() -> Image {
        let mut image = Image::new();

        image.insert_body(
            target(),
            Stream::from_instrs(vec![
                Instruction::store_field(Symbol::field("Host.Card card")),
                Instruction::new(Opcode::Ret, Operand::None),
            ]),
        );

        image
    }

    fn pop_push_descriptor(seed: Seed) -> PatchDescriptor {
        PatchDescriptor {
            target: target(),
            seed,
            anchor: AnchorSpec::new(Direction::Forward, 8)
                .then(Predicate::opcode(StepMode::UntilSeen, Opcode::StoreField)),
            insertion: Insertion::After,
            builder: Box::new(|_: &CaptureTable| {
                Ok(vec![Instruction::load_null(), Instruction::new(Opcode::Pop, Operand::None)])
            }),
        }
    }

    #[test]
    fn successful_patches_commit() {
        let mut image = image();
        let mut patcher = Patcher::new();

        patcher.register(pop_push_descriptor(Seed::store_to("Host.Card card")));

        let summary = patcher.run(&mut image);
        assert!(summary.all_applied());
        assert_eq!(summary.applied, 1);
        assert_eq!(image.body(&target()).unwrap().len(), 4);
    }

    #[test]
    fn missing_seed_is_fatal_and_leaves_the_body_alone() {
        let mut image = image();
        let mut patcher = Patcher::new();

        patcher.register(pop_push_descriptor(Seed::call_to("nowhere")));

        let summary = patcher.run(&mut image);
        assert_eq!(summary.applied, 0);
        assert!(matches!(
            summary.failures[0].error,
            PatchError::SeedNotFound
        ));
        assert_eq!(summary.failures[0].seed_desc, "first call to 'nowhere'");

        // The target body was not partially patched.
        assert_eq!(image.body(&target()).unwrap().len(), 2);
    }

    #[test]
    fn one_bad_patch_does_not_block_the_rest() {
        let mut image = image();
        let mut patcher = Patcher::new();

        patcher.register(pop_push_descriptor(Seed::call_to("nowhere")));
        patcher.register(pop_push_descriptor(Seed::store_to("Host.Card card")));

        let summary = patcher.run(&mut image);
        assert_eq!(summary.applied, 1);
        assert_eq!(summary.failures.len(), 1);
    }

    #[test]
    fn unknown_targets_are_reported() {
        let mut image = Image::new();
        let mut patcher = Patcher::new();

        patcher.register(pop_push_descriptor(Seed::store_to("Host.Card card")));

        let summary = patcher.run(&mut image);
        assert!(matches!(
            summary.failures[0].error,
            PatchError::NoSuchMethod
        ));
    }
}
