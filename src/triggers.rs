//! Priority-ordered dispatch of host trigger events to registered extension handlers.
//!
//! Spliced call sites land here: a patched method body re-enters the engine through the
//! bus, which finds every live handler for the requested capability, orders them, and
//! invokes each in turn. Everything runs on the host's main execution context; the only
//! suspension points are the gaps between handler invocations.

use crate::symbols::Symbol;
use itertools::Itertools;
use std::collections::HashMap;
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// The identifier handlers register under and dispatch requests are issued against.
/// External subsystems define the tags; the engine only requires that a tag maps to a
/// fixed argument/return shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CapabilityTag(pub &'static str);

impl Display for CapabilityTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

/// One argument in a dispatch context.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Int(i64),
    Flag(bool),
    Sym(Symbol),
    Null,
}

/// The arguments of one dispatch, plus an advisory cancellation flag.
///
/// Cancellation is cooperative: the bus checks the flag between handler invocations and
/// stops yielding further handlers, but a handler already running is never unwound.
pub struct Context {
    args: Vec<Arg>,
    cancel: AtomicBool,
}

impl Context {
    pub fn new(args: Vec<Arg>) -> Context {
        Context {
            args,
            cancel: AtomicBool::new(false),
        }
    }

    pub fn empty() -> Context {
        Context::new(vec![])
    }

    pub fn arg(&self, index: usize) -> Option<&Arg> {
        self.args.get(index)
    }

    pub fn int(&self, index: usize) -> Option<i64> {
        match self.arg(index) {
            Some(Arg::Int(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

/// A polymorphic trigger receiver. The bus never owns one of these: lifetime belongs to
/// whichever host object the handler is attached to.
pub trait Handler: Send + Sync {
    /// Identity used when reporting a misbehaving handler.
    fn name(&self) -> &str;

    /// Whether this handler wants the given dispatch at all.
    fn responds_to(&self, tag: CapabilityTag, ctx: &Context) -> bool;

    /// Higher runs earlier. Equal priorities run in registration order.
    fn priority(&self, _tag: CapabilityTag, _ctx: &Context) -> i32 {
        0
    }

    /// Broadcast entry point: invoked for side effects, return value discarded.
    fn fire(&self, _tag: CapabilityTag, _ctx: &Context) -> eyre::Result<()> {
        Ok(())
    }

    /// Pipeline entry point: folds `value` into the value handed to the next handler.
    fn fold(&self, _tag: CapabilityTag, _ctx: &Context, value: i64) -> eyre::Result<i64> {
        Ok(value)
    }
}

struct Registration {
    tag: CapabilityTag,
    seq: u64,
    handler: Weak<dyn Handler>,
}

#[derive(Default)]
struct Registry {
    registrations: Vec<Registration>,
    next_seq: u64,
    in_flight: HashMap<CapabilityTag, u32>,
}

/// The dispatch bus. Registration and dispatch happen on the host's main execution
/// context, so the interior lock is never contended; it exists so the bus can live in a
/// process-wide static.
#[derive(Default)]
pub struct Bus {
    registry: Mutex<Registry>,
}

impl Bus {
    pub fn new() -> Bus {
        Bus::default()
    }

    /// Registers a handler for a capability. The bus keeps only a weak reference; the
    /// caller stays the owner and must unregister (or drop) the handler when the host
    /// object it belongs to is destroyed.
    pub fn register(&self, tag: CapabilityTag, handler: &Arc<dyn Handler>) {
        let mut registry = self.registry.lock().unwrap();

        if registry.in_flight.get(&tag).copied().unwrap_or(0) > 0 {
            // Not a crash, but the new handler's place in the in-flight dispatch is
            // undefined.
            log::warn!(
                "handler '{}' registered for {tag} while a dispatch is in flight",
                handler.name()
            );
        }

        let seq = registry.next_seq;
        registry.next_seq += 1;

        registry.registrations.push(Registration {
            tag,
            seq,
            handler: Arc::downgrade(handler),
        });
    }

    /// Drops every registration of `handler`, for any capability. Called when the host
    /// object owning the handler is destroyed, so the bus never calls into a dead one.
    pub fn unregister(&self, handler: &Arc<dyn Handler>) {
        let weak = Arc::downgrade(handler);
        let mut registry = self.registry.lock().unwrap();

        if !registry.in_flight.is_empty() {
            log::warn!(
                "handler '{}' unregistered while a dispatch is in flight",
                handler.name()
            );
        }

        registry
            .registrations
            .retain(|reg| !Weak::ptr_eq(&reg.handler, &weak));
    }

    /// Collecting and Sorting: snapshot the live handlers for `tag` that respond to this
    /// context, stably sorted descending by priority. The snapshot is what makes
    /// registry mutation during dispatch survivable.
    fn collect(&self, tag: CapabilityTag, ctx: &Context) -> Vec<Arc<dyn Handler>> {
        let candidates: Vec<(u64, Arc<dyn Handler>)> = {
            let mut registry = self.registry.lock().unwrap();

            // Prune registrations whose handlers have been dropped.
            registry
                .registrations
                .retain(|reg| reg.handler.strong_count() > 0);

            registry
                .registrations
                .iter()
                .filter(|reg| reg.tag == tag)
                .filter_map(|reg| reg.handler.upgrade().map(|handler| (reg.seq, handler)))
                .collect()
        };

        // The lock is released before any handler code runs.
        candidates
            .into_iter()
            .filter(|(_, handler)| handler.responds_to(tag, ctx))
            .sorted_by_key(|(seq, handler)| (std::cmp::Reverse(handler.priority(tag, ctx)), *seq))
            .map(|(_, handler)| handler)
            .collect()
    }

    fn begin_dispatch(&self, tag: CapabilityTag) {
        *self
            .registry
            .lock()
            .unwrap()
            .in_flight
            .entry(tag)
            .or_insert(0) += 1;
    }

    fn end_dispatch(&self, tag: CapabilityTag) {
        let mut registry = self.registry.lock().unwrap();

        if let Some(count) = registry.in_flight.get_mut(&tag) {
            *count -= 1;

            if *count == 0 {
                registry.in_flight.remove(&tag);
            }
        }
    }

    /// Starts a dispatch: Collecting and Sorting happen here, and the returned driver is
    /// ready to step through the Dispatching phase.
    pub fn begin(&self, tag: CapabilityTag, ctx: &Context) -> Dispatch<'_> {
        let queue = self.collect(tag, ctx);
        self.begin_dispatch(tag);

        Dispatch {
            bus: self,
            tag,
            queue,
            next: 0,
        }
    }

    /// Broadcast semantics: every handler runs for side effects, in order. A failing
    /// handler is logged and skipped — one misbehaving extension must not block
    /// unrelated extensions.
    pub fn broadcast(&self, tag: CapabilityTag, ctx: &Context) {
        let mut dispatch = self.begin(tag, ctx);
        while dispatch.step_fire(ctx) {}
    }

    /// Pipeline semantics: each handler's output feeds the next handler's input. A
    /// failing handler aborts the fold; the last good value is returned.
    pub fn pipeline(&self, tag: CapabilityTag, ctx: &Context, mut value: i64) -> i64 {
        let mut dispatch = self.begin(tag, ctx);

        while let Some(folded) = dispatch.step_fold(ctx, value) {
            value = folded;
        }

        value
    }
}

/// One in-flight dispatch, driven a single handler invocation at a time. The gaps
/// between steps are the suspension points a host's cooperative scheduler may use;
/// nothing here is reentrant-safe across them for the same capability.
pub struct Dispatch<'bus> {
    bus: &'bus Bus,
    tag: CapabilityTag,
    queue: Vec<Arc<dyn Handler>>,
    next: usize,
}

impl Dispatch<'_> {
    pub fn done(&self) -> bool {
        self.next >= self.queue.len()
    }

    /// Runs the next handler for side effects. Returns false once the dispatch is done
    /// (all handlers ran, or cancellation was requested between steps).
    pub fn step_fire(&mut self, ctx: &Context) -> bool {
        let handler = match self.take_next(ctx) {
            Some(handler) => handler,
            None => return false,
        };

        if let Err(err) = handler.fire(self.tag, ctx) {
            log::error!(
                "handler '{}' failed during {}: {err:?}",
                handler.name(),
                self.tag
            );
        }

        true
    }

    /// Folds `value` through the next handler. Returns the new value, or `None` once the
    /// dispatch is done or a handler has aborted the fold.
    pub fn step_fold(&mut self, ctx: &Context, value: i64) -> Option<i64> {
        let handler = self.take_next(ctx)?;

        match handler.fold(self.tag, ctx, value) {
            Ok(folded) => Some(folded),
            Err(err) => {
                log::error!(
                    "handler '{}' aborted the {} fold: {err:?}",
                    handler.name(),
                    self.tag
                );

                self.next = self.queue.len();
                None
            }
        }
    }

    fn take_next(&mut self, ctx: &Context) -> Option<Arc<dyn Handler>> {
        if self.done() {
            return None;
        }

        // Cancellation is advisory: checked between invocations, never unwinding one.
        if ctx.cancel_requested() {
            log::info!(
                "dispatch of {} cancelled before '{}'",
                self.tag,
                self.queue[self.next].name()
            );

            self.next = self.queue.len();
            return None;
        }

        let handler = self.queue[self.next].clone();
        self.next += 1;
        Some(handler)
    }
}

impl Drop for Dispatch<'_> {
    fn drop(&mut self) {
        self.bus.end_dispatch(self.tag);
    }
}

lazy_static::lazy_static! {
    static ref SHARED: Bus = Bus::new();
}

/// The process-wide bus that spliced call sites dispatch into.
pub fn shared() -> &'static Bus {
    &SHARED
}

/// The method symbol a spliced call site uses to re-enter the bus for `tag`. `args` is
/// the number of context arguments the surrounding code has already pushed.
pub fn dispatch_symbol(tag: CapabilityTag, args: u8, returns: bool) -> Symbol {
    Symbol::method(format!("graft::dispatch({tag})"), args, returns)
}
