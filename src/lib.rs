//! Extends a closed, pre-compiled host program by rewriting selected method bodies at
//! load time and by dispatching the host's fixed trigger points to an extensible set of
//! handlers.
//!
//! The load-time half ([`stream`], [`matcher`], [`splicer`], [`patch`]) locates a
//! structural anchor in a method's instruction stream, captures the symbols seen along
//! the way, and splices new instructions in without upsetting branch targets or the
//! operand stack. The spliced call sites land in the runtime half ([`triggers`],
//! [`extensions`]): a priority-ordered dispatch bus over handler objects whose lifetimes
//! belong to the host things they are attached to.

pub mod extensions;
pub mod ids;
pub mod logging;
pub mod matcher;
pub mod patch;
pub mod splicer;
pub mod storage;
pub mod stream;
pub mod symbols;
pub mod triggers;
