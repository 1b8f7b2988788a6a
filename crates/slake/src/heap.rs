//! The memory manager: a refcounting slab allocator for prompt
//! release, plus a mark-and-sweep pass that reclaims the cycles refcounting
//! alone cannot (classes↔methods, objects↔class, modules↔aliases).

use ahash::AHashSet;

use crate::fiber::Fiber;
use crate::generics::GenericCache;
use crate::intern::StringId;
use crate::reference::Reference;
use crate::resource::ResourceTracker;
use crate::types::TypeRef;
use crate::value::{Value, ValueData, ValueId};

/// Snapshot of heap occupancy, analogous to a GC's "before/after" stats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub live_objects: usize,
    pub free_slots: usize,
    pub total_slots: usize,
}

/// Reference-counted, cycle-collected value storage.
///
/// Every live value is reachable from the root value, a host reference, or
/// a live fiber's stacks/registers, or it is unreferenced and eligible for
/// release. The common acyclic case is handled inline by
/// [`Heap::release`] the instant both counters hit zero; cycles survive
/// until [`Heap::collect_cycles`] runs.
pub struct Heap {
    slots: Vec<Option<Value>>,
    free_list: Vec<u32>,
    root: ValueId,
    /// Values kept alive across a suspension point that aren't otherwise
    /// reachable yet (temporaries mid-expression when a fiber yields).
    extra_gc_targets: AHashSet<ValueId>,
    /// While a tracing sweep is in progress, release defers to the sweep's
    /// post-pass instead of freeing inline.
    in_gc: bool,
    /// While a destructor (`delete` member) is running, reentrant sweeps are
    /// suppressed.
    destructing: bool,
    bytes_allocated_since_sweep: usize,
    sweep_threshold: usize,
    pub tracker: ResourceTracker,
    generic_cache: GenericCache,
    /// The well-known `none` value every unset `var` slot points at.
    none: ValueId,
}

impl Heap {
    #[must_use]
    pub fn new(sweep_threshold: usize) -> Self {
        let mut slots = vec![
            Some(Value::new(ValueData::Root(Default::default()))),
            Some(Value::new(ValueData::None)),
        ];
        slots[0].as_mut().unwrap().host_refcount = 1;
        slots[1].as_mut().unwrap().host_refcount = 1;
        Self {
            slots,
            free_list: Vec::new(),
            root: ValueId(0),
            extra_gc_targets: AHashSet::default(),
            in_gc: false,
            destructing: false,
            bytes_allocated_since_sweep: 0,
            sweep_threshold,
            tracker: ResourceTracker::default(),
            generic_cache: GenericCache::default(),
            none: ValueId(1),
        }
    }

    #[must_use]
    pub fn root(&self) -> ValueId {
        self.root
    }

    /// The well-known `none` singleton, held alive for the runtime's lifetime
    /// by its own host reference rather than by ordinary scope edges.
    #[must_use]
    pub fn none(&self) -> ValueId {
        self.none
    }

    pub fn generic_cache(&mut self) -> &mut GenericCache {
        &mut self.generic_cache
    }

    /// Allocates `data` with zero references, reusing a freed slot if one is
    /// available.
    pub fn alloc(&mut self, data: ValueData) -> ValueId {
        self.bytes_allocated_since_sweep += approx_size(&data);
        let value = Value::new(data);
        if let Some(slot) = self.free_list.pop() {
            self.slots[slot as usize] = Some(value);
            ValueId(slot)
        } else {
            self.slots.push(Some(value));
            ValueId((self.slots.len() - 1) as u32)
        }
    }

    #[must_use]
    pub fn get(&self, id: ValueId) -> Option<&Value> {
        self.slots.get(id.index()).and_then(|s| s.as_ref())
    }

    #[must_use]
    pub fn get_mut(&mut self, id: ValueId) -> Option<&mut Value> {
        self.slots.get_mut(id.index()).and_then(|s| s.as_mut())
    }

    /// Registers `id` as reachable until explicitly dropped, keeping
    /// mid-expression temporaries alive across a coroutine suspension point.
    pub fn pin(&mut self, id: ValueId) {
        self.extra_gc_targets.insert(id);
    }

    pub fn unpin(&mut self, id: ValueId) {
        self.extra_gc_targets.remove(&id);
    }

    pub fn inc_ref(&mut self, id: ValueId) {
        if let Some(v) = self.get_mut(id) {
            v.refcount += 1;
        }
    }

    /// Drops a runtime edge to `id`, releasing it immediately once both
    /// counters reach zero (unless a sweep is in progress).
    pub fn dec_ref(&mut self, id: ValueId) {
        let Some(v) = self.get_mut(id) else { return };
        debug_assert!(v.refcount > 0, "refcount underflow on release");
        v.refcount = v.refcount.saturating_sub(1);
        self.maybe_release(id);
    }

    pub fn inc_host_ref(&mut self, id: ValueId) {
        if let Some(v) = self.get_mut(id) {
            v.host_refcount += 1;
        }
    }

    pub fn dec_host_ref(&mut self, id: ValueId) {
        let Some(v) = self.get_mut(id) else { return };
        v.host_refcount = v.host_refcount.saturating_sub(1);
        self.maybe_release(id);
    }

    fn maybe_release(&mut self, id: ValueId) {
        if self.in_gc {
            return;
        }
        let Some(v) = self.get(id) else { return };
        if v.refcount == 0 && v.host_refcount == 0 {
            self.release(id);
        }
    }

    /// Frees `id` immediately. If it exposes a `delete` member, that
    /// destructor must already have been invoked by the caller (the
    /// interpreter does this before the final `dec_ref`); `release`
    /// itself only tears down the slot and drops the edges it owned.
    fn release(&mut self, id: ValueId) {
        let Some(slot) = self.slots.get_mut(id.index()) else { return };
        let Some(value) = slot.take() else { return };
        if value.flags.alias_shared_scope {
            // An alias's pointee had its scope flagged shared; the owning
            // alias does not free it a second time.
            return;
        }
        self.free_list.push(id.0);
        self.generic_cache.evict(id);
        for child in owned_children(&value.data) {
            self.dec_ref(child);
        }
    }

    /// Looks up a member named `delete` for the interpreter to invoke before
    /// the final release. For an object this walks its class's ancestor
    /// chain the same way method dispatch does — `delete` is a method, not
    /// an instance field, so it never lives in the object's own scope.
    #[must_use]
    pub fn destructor_of(&mut self, id: ValueId, delete_name: StringId) -> Option<ValueId> {
        let class = match self.get(id).map(|v| &v.data) {
            Some(ValueData::Object(o)) => o.class,
            _ => return None,
        };
        let mut cur = Some(class);
        while let Some(cls_id) = cur {
            let Some(ValueData::Class(c)) = self.get(cls_id).map(|v| v.data.clone()) else { break };
            if let Some(&member) = c.scope.get(&delete_name) {
                return Some(member);
            }
            cur = match c.parent {
                Some(TypeRef::Resolved(p)) => Some(p),
                Some(r @ TypeRef::Deferred(_)) => self.force_deferred_type(&r),
                None => None,
            };
        }
        None
    }

    /// Every live `Object` value, for the runtime's shutdown destructor sweep.
    #[must_use]
    pub(crate) fn live_object_ids(&self) -> Vec<ValueId> {
        (0..self.slots.len())
            .filter_map(|i| match &self.slots[i] {
                Some(v) if matches!(v.data, ValueData::Object(_)) => Some(ValueId(i as u32)),
                _ => None,
            })
            .collect()
    }

    pub fn begin_destructing(&mut self) {
        self.destructing = true;
    }

    pub fn end_destructing(&mut self) {
        self.destructing = false;
    }

    #[must_use]
    pub fn is_destructing(&self) -> bool {
        self.destructing
    }

    /// Forces a deferred type reference to a live value, used by
    /// [`crate::types::Type::defining_value`]. Resolution against the root
    /// scope only — callers holding a more specific scope should resolve
    /// through [`crate::resolver::resolve`] instead and only fall back here
    /// for context-free deferred class/interface references.
    pub fn force_deferred_type(&mut self, type_ref: &TypeRef) -> Option<ValueId> {
        match type_ref {
            TypeRef::Resolved(id) => Some(*id),
            TypeRef::Deferred(reference) => self.resolve_from_root(reference),
        }
    }

    fn resolve_from_root(&self, reference: &Reference) -> Option<ValueId> {
        let mut scope_owner = self.root;
        let mut result = None;
        for entry in &reference.entries {
            let scope = self.get(scope_owner)?.data.scope()?;
            let next = *scope.get(&entry.name)?;
            result = Some(next);
            scope_owner = next;
        }
        result
    }

    #[must_use]
    pub fn stats(&self) -> HeapStats {
        HeapStats {
            live_objects: self.slots.iter().filter(|s| s.is_some()).count(),
            free_slots: self.free_list.len(),
            total_slots: self.slots.len(),
        }
    }

    /// Runs a tracing mark-and-sweep over the whole heap.
    ///
    /// Roots are: the root value, every value with nonzero host refcount,
    /// everything reachable from `fiber_roots` (a live fiber's call stack,
    /// registers, argument/data stacks, `this`, return slot), and the
    /// explicit extra-GC-target set. Anything left unmarked with zero host
    /// refcount is freed.
    pub fn collect_cycles(&mut self, fiber_roots: impl IntoIterator<Item = ValueId>) {
        self.in_gc = true;
        for slot in &mut self.slots {
            if let Some(v) = slot {
                v.flags.walked = false;
            }
        }

        let mut stack = vec![self.root];
        stack.extend(fiber_roots);
        stack.extend(self.extra_gc_targets.iter().copied());
        for id in 0..self.slots.len() {
            if let Some(v) = &self.slots[id] {
                if v.host_refcount > 0 {
                    stack.push(ValueId(id as u32));
                }
            }
        }

        while let Some(id) = stack.pop() {
            let Some(v) = self.get_mut(id) else { continue };
            if v.flags.walked {
                continue;
            }
            v.flags.walked = true;
            stack.extend(owned_children(&v.data));
        }

        let to_free: Vec<ValueId> = (0..self.slots.len())
            .filter_map(|i| {
                let id = ValueId(i as u32);
                let v = self.slots[i].as_ref()?;
                (!v.flags.walked && v.host_refcount == 0).then_some(id)
            })
            .collect();
        for id in to_free {
            // Bypass refcount bookkeeping: these values are, by
            // construction, unreachable from every root including each
            // other's still-live edges, so we free the slot directly
            // without chasing `dec_ref` on values the sweep will also free.
            self.slots[id.index()] = None;
            self.free_list.push(id.0);
            self.generic_cache.evict(id);
        }

        self.in_gc = false;
        self.bytes_allocated_since_sweep = 0;
    }

    /// Whether an allocation-watermark sweep should run.
    #[must_use]
    pub fn should_sweep(&self) -> bool {
        self.bytes_allocated_since_sweep >= self.sweep_threshold
    }

    /// Detaches the fiber stored at `id`, leaving an inert placeholder in its
    /// place until [`Heap::put_fiber`] restores it.
    ///
    /// The interpreter needs `&mut Runtime` (heap, interner and the locator
    /// together) while driving a fiber, which rules out borrowing the fiber
    /// through a `&mut` into the heap that also needs to be mutated. Taking
    /// it out by value for the duration of one dispatch loop sidesteps that
    /// without giving the fiber its own allocator.
    pub fn take_fiber(&mut self, id: ValueId) -> Option<Fiber> {
        let none = self.none;
        let value = self.slots.get_mut(id.index())?.as_mut()?;
        match &mut value.data {
            ValueData::Context(fiber) => {
                let placeholder = Fiber::new(crate::fiber::MajorFrame::new(none, None, none, none), none);
                Some(std::mem::replace(fiber, placeholder))
            }
            _ => None,
        }
    }

    pub fn put_fiber(&mut self, id: ValueId, fiber: Fiber) {
        if let Some(Some(value)) = self.slots.get_mut(id.index()).map(|s| s.as_mut()) {
            if let ValueData::Context(slot) = &mut value.data {
                *slot = fiber;
            }
        }
    }
}

/// Every value a given payload owns an edge to, for the tracer to walk and
/// for `release` to drop.
fn owned_children(data: &ValueData) -> Vec<ValueId> {
    let mut out = Vec::new();
    match data {
        ValueData::Array(_, items) => out.extend(items.iter().copied()),
        ValueData::Map(_, _, pairs) => {
            for (k, v) in pairs {
                out.push(*k);
                out.push(*v);
            }
        }
        ValueData::Module(m) => {
            out.extend(m.scope.values().copied());
            out.extend(m.imports.values().copied());
        }
        ValueData::Class(c) => {
            out.extend(c.scope.values().copied());
            if let Some(TypeRef::Resolved(p)) = &c.parent {
                out.push(*p);
            }
            for i in &c.interfaces {
                if let TypeRef::Resolved(id) = i {
                    out.push(*id);
                }
            }
        }
        ValueData::Interface(i) => {
            out.extend(i.scope.values().copied());
            for p in &i.parents {
                if let TypeRef::Resolved(id) = p {
                    out.push(*id);
                }
            }
        }
        ValueData::Trait(t) => {
            out.extend(t.scope.values().copied());
            for p in &t.parents {
                if let TypeRef::Resolved(id) = p {
                    out.push(*id);
                }
            }
        }
        ValueData::Object(o) => {
            out.push(o.class);
            out.extend(o.members.values().copied());
        }
        ValueData::Var(v) => out.push(v.value),
        ValueData::Alias(target) => out.push(*target),
        ValueData::Root(scope) => out.extend(scope.values().copied()),
        ValueData::Context(fiber) => out.extend(fiber.gc_roots()),
        ValueData::Fn(_)
        | ValueData::NativeFn(_)
        | ValueData::None
        | ValueData::I8(_)
        | ValueData::I16(_)
        | ValueData::I32(_)
        | ValueData::I64(_)
        | ValueData::U8(_)
        | ValueData::U16(_)
        | ValueData::U32(_)
        | ValueData::U64(_)
        | ValueData::F32(_)
        | ValueData::F64(_)
        | ValueData::Bool(_)
        | ValueData::Str(_)
        | ValueData::WStr(_)
        | ValueData::Char(_)
        | ValueData::WChar(_)
        | ValueData::Ref(_) => {}
    }
    out
}

fn approx_size(data: &ValueData) -> usize {
    match data {
        ValueData::Str(s) => 32 + s.len(),
        ValueData::WStr(s) => 32 + s.len() * 2,
        ValueData::Array(_, items) => 24 + items.len() * 4,
        ValueData::Map(_, _, pairs) => 24 + pairs.len() * 8,
        ValueData::Object(o) => 32 + o.members.len() * 16,
        _ => 32,
    }
}
