//! The embedding surface.
//!
//! [`Runtime`] bundles everything a host needs: the heap, the string table,
//! a pluggable [`loader::ModuleLocator`] for resolving imports, and the
//! entry points for loading modules, walking the root namespace, calling
//! functions and driving coroutines. Building a standard library on top of
//! this (native function registration is the only hook provided) is host
//! business, not the runtime's.

use crate::bytecode::vm;
use crate::error::{LoaderError, RunResult, RuntimeError};
use crate::format::LoadFlags;
use crate::heap::{Heap, HeapStats};
use crate::intern::{Interner, StringId};
use crate::loader::{self, ModuleLocator};
use crate::reference::Reference;
use crate::resolver::{self, NotFound, ResolveContext};
use crate::types::Type;
use crate::value::{NativeCallback, NativeFnData, Param, ValueData, ValueId};

/// Default allocation-byte watermark between mark-sweep passes.
pub const DEFAULT_SWEEP_THRESHOLD: usize = 1024 * 1024;

/// A locator that never finds anything, used until the host installs a real
/// one. Loading a module with unresolved imports against this locator
/// always fails with [`LoaderError::ImportNotFound`].
struct NullLocator;

impl ModuleLocator for NullLocator {
    fn locate(&mut self, _reference: &Reference, _interns: &Interner) -> Option<Vec<u8>> {
        None
    }
}

/// A managed Slake runtime: one heap, one string table, one root namespace.
///
/// Every [`ValueId`] returned by a `Runtime` method is only valid for that
/// same `Runtime` — there is no cross-runtime sharing of values.
pub struct Runtime {
    pub heap: Heap,
    pub interns: Interner,
    locator: Box<dyn ModuleLocator>,
    this_name: StringId,
    base_name: StringId,
    /// Errors raised by a `delete` member that itself faulted; per the
    /// destructor-dispatch contract these are reported rather than aborting
    /// the release that triggered them, so they accumulate here for the host
    /// to drain instead of being dropped on the floor.
    destructor_failures: Vec<RuntimeError>,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    #[must_use]
    pub fn new() -> Self {
        let mut heap = Heap::new(DEFAULT_SWEEP_THRESHOLD);
        let mut interns = Interner::new();
        let this_name = interns.intern("this");
        let base_name = interns.intern("base");
        heap.tracker = crate::resource::ResourceTracker::default();
        Self { heap, interns, locator: Box::new(NullLocator), this_name, base_name, destructor_failures: Vec::new() }
    }

    /// Installs the host's import locator, replacing whatever was set
    /// before (the no-op [`NullLocator`] by default).
    pub fn set_locator(&mut self, locator: impl ModuleLocator + 'static) {
        self.locator = Box::new(locator);
    }

    #[must_use]
    pub fn root(&self) -> ValueId {
        self.heap.root()
    }

    #[must_use]
    pub fn heap_stats(&self) -> HeapStats {
        self.heap.stats()
    }

    /// Loads one SLX image, transitively loading any import not
    /// already installed through the configured locator.
    pub fn load_module(&mut self, data: &[u8], flags: LoadFlags) -> Result<ValueId, LoaderError> {
        loader::load_module(&mut self.heap, &mut self.interns, self.locator.as_mut(), data, flags)
    }

    /// Resolves a dotted path against the root namespace, forcing
    /// generic instantiation and deferred-type resolution along the way.
    pub fn resolve(&mut self, reference: &Reference) -> Result<ValueId, NotFound> {
        let ctx = ResolveContext {
            starting_scope: None,
            enclosing_scope_chain: &[self.heap.root()],
            current_class: None,
            this_value: None,
            this_name: self.this_name,
            base_name: self.base_name,
        };
        resolver::resolve(&mut self.heap, reference, &ctx).map(|(value, _owner)| value)
    }

    /// Registers a native function under `owner`'s scope, callable
    /// from bytecode exactly like a Slake-defined function.
    pub fn register_native(
        &mut self,
        owner: ValueId,
        name: &str,
        return_type: Type,
        params: Vec<Param>,
        callback: NativeCallback,
    ) -> ValueId {
        let interned = self.interns.intern(name);
        let id = self.heap.alloc(ValueData::NativeFn(NativeFnData { name: interned, return_type, params, callback }));
        if let Some(scope) = self.heap.get_mut(owner).and_then(|v| v.data.scope_mut()) {
            scope.insert(interned, id);
        }
        self.heap.inc_ref(id);
        id
    }

    /// Calls a function to completion on a fresh fiber. The function
    /// must not suspend (`YIELD`/`AWAIT`) at its top level — use
    /// [`Runtime::spawn`] for an async entry point.
    pub fn call(&mut self, func: ValueId, this: ValueId, args: &[ValueId]) -> RunResult<ValueId> {
        vm::call_sync(self, func, this, args)
    }

    /// Starts a coroutine without running it, returning a `context` value
    /// the host (or bytecode, via `AWAIT`) can drive with [`Runtime::resume`].
    pub fn spawn(&mut self, func: ValueId, this: ValueId, args: &[ValueId]) -> RunResult<ValueId> {
        vm::spawn(self, func, this, args)
    }

    /// Advances a suspended fiber until its next `YIELD` or completion,
    /// returning the produced value either way — distinguish the two with
    /// [`Runtime::is_done`].
    pub fn resume(&mut self, context: ValueId) -> RunResult<ValueId> {
        vm::resume_context(self, context)
    }

    #[must_use]
    pub fn is_done(&self, context: ValueId) -> bool {
        match self.heap.get(context).map(|v| &v.data) {
            Some(ValueData::Context(fiber)) => fiber.is_done(),
            _ => true,
        }
    }

    #[must_use]
    pub fn fiber_result(&self, context: ValueId) -> Option<ValueId> {
        match self.heap.get(context).map(|v| &v.data) {
            Some(ValueData::Context(fiber)) => Some(fiber.result),
            _ => None,
        }
    }

    /// Runs a mark-and-sweep pass over the whole heap now, regardless of
    /// whether the allocation watermark has been crossed.
    pub fn collect_garbage(&mut self) {
        self.heap.collect_cycles(std::iter::empty());
    }

    /// Runs a sweep only if [`Heap::should_sweep`] says it's due; the
    /// interpreter calls this after every instruction that allocates.
    pub fn maybe_collect_garbage(&mut self) {
        if self.heap.should_sweep() {
            self.collect_garbage();
        }
    }

    pub(crate) fn record_destructor_failure(&mut self, err: RuntimeError) {
        self.destructor_failures.push(err);
    }

    /// Drains the destructor failures collected since the last call. A
    /// failing `delete` member never blocks the release that triggered it,
    /// so this is the only way a host observes one.
    pub fn take_destructor_failures(&mut self) -> Vec<RuntimeError> {
        std::mem::take(&mut self.destructor_failures)
    }

    /// Runs every still-live object's `delete` member once, then consumes
    /// the runtime. Call this instead of letting `Runtime` simply drop when
    /// an embedding needs destructors to observably run before shutdown;
    /// ordinary `drop` does not run them, matching the error-surface
    /// philosophy of this crate (diagnostics are returned data, never a
    /// side effect hidden inside `Drop`).
    #[must_use]
    pub fn shutdown(mut self) -> Vec<RuntimeError> {
        vm::run_shutdown_destructors(&mut self);
        self.destructor_failures
    }

    #[must_use]
    pub fn this_name(&self) -> StringId {
        self.this_name
    }

    #[must_use]
    pub fn base_name(&self) -> StringId {
        self.base_name
    }
}
