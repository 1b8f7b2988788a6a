//! The reference resolver: turns a symbolic [`Reference`] into a
//! live value, honoring scope chains, imports, aliases, `this` and `base`.

use crate::generics::instantiate;
use crate::heap::Heap;
use crate::intern::StringId;
use crate::reference::Reference;
use crate::types::TypeRef;
use crate::value::{ValueData, ValueId};

/// Everything resolution needs besides the reference itself: where to start
/// looking, and the `this`/`base` bindings of the calling frame (if any).
pub struct ResolveContext<'a> {
    /// When set, resolution searches only this scope for the reference's
    /// first entry.
    pub starting_scope: Option<ValueId>,
    /// Scopes to try for the first entry, innermost first, when no
    /// `starting_scope` is given: the
    /// current function's enclosing scope, then outward to the root.
    pub enclosing_scope_chain: &'a [ValueId],
    /// The class enclosing the current method frame, for resolving `base`.
    pub current_class: Option<ValueId>,
    /// The current frame's `this` slot, for resolving `this`.
    pub this_value: Option<ValueId>,
    pub this_name: StringId,
    pub base_name: StringId,
}

/// A reference that could not be fully resolved, naming the deepest prefix
/// that *did* resolve.
#[derive(Debug, Clone)]
pub struct NotFound {
    pub reference: Reference,
    pub resolved_entries: usize,
}

/// Walks a reference's entries against scope, imports and aliases in order.
/// Never returns a `ref` value
/// itself — resolution is transitive. Alongside the resolved value, returns
/// the scope-bearing value the *last* entry was found on (`None` for a bare
/// `this`/`base`, which aren't member lookups) — callers that enforce member
/// visibility need to know which class/module actually defines what they found.
pub fn resolve(heap: &mut Heap, reference: &Reference, ctx: &ResolveContext<'_>) -> Result<(ValueId, Option<ValueId>), NotFound> {
    let not_found = |resolved_entries: usize| NotFound { reference: reference.clone(), resolved_entries };

    let mut entries = reference.entries.iter();
    let Some(first) = entries.next() else {
        return Err(not_found(0));
    };

    let mut owner = None;
    let mut current = if first.name == ctx.this_name {
        ctx.this_value.ok_or_else(|| not_found(0))?
    } else if first.name == ctx.base_name {
        let class = ctx.current_class.ok_or_else(|| not_found(0))?;
        parent_class_of(heap, class).ok_or_else(|| not_found(0))?
    } else if let Some(scope) = ctx.starting_scope {
        owner = Some(scope);
        lookup(heap, scope, first.name).ok_or_else(|| not_found(0))?
    } else {
        let (scope, value) = ctx
            .enclosing_scope_chain
            .iter()
            .find_map(|&scope| lookup(heap, scope, first.name).map(|v| (scope, v)))
            .ok_or_else(|| not_found(0))?;
        owner = Some(scope);
        value
    };

    current = unwrap_alias(heap, current);
    current = instantiate(heap, current, &first.generic_args).map_err(|_| not_found(0))?;

    let mut resolved_entries = 1;
    for entry in entries {
        let Some(scope) = heap.get(current).and_then(|v| v.data.scope()) else {
            return Err(not_found(resolved_entries));
        };
        let Some(next) = scope.get(&entry.name).copied() else {
            return Err(not_found(resolved_entries));
        };
        owner = Some(current);
        current = unwrap_alias(heap, next);
        current = instantiate(heap, current, &entry.generic_args).map_err(|_| not_found(resolved_entries))?;
        resolved_entries += 1;
    }

    Ok((current, owner))
}

fn lookup(heap: &Heap, scope_owner: ValueId, name: StringId) -> Option<ValueId> {
    heap.get(scope_owner)?.data.scope()?.get(&name).copied()
}

fn parent_class_of(heap: &mut Heap, class: ValueId) -> Option<ValueId> {
    match heap.get_mut(class).map(|v| &mut v.data) {
        Some(ValueData::Class(c)) => {
            let parent = c.parent.clone()?;
            match parent {
                TypeRef::Resolved(id) => Some(id),
                TypeRef::Deferred(_) => heap.force_deferred_type(&parent),
            }
        }
        _ => None,
    }
}

/// Unwraps a chain of aliases to their ultimate target. An alias never
/// points to another alias after unwrap, but the loop is
/// defensive rather than assuming it.
pub fn unwrap_alias(heap: &Heap, mut id: ValueId) -> ValueId {
    while let Some(ValueData::Alias(target)) = heap.get(id).map(|v| &v.data) {
        id = *target;
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;
    use crate::intern::Interner;
    use crate::reference::RefEntry;
    use crate::types::TypeRef;
    use crate::value::{AccessFlags, ClassData, ModuleData, Scope};

    fn ctx<'a>(this_name: StringId, base_name: StringId) -> ResolveContext<'a> {
        ResolveContext {
            starting_scope: None,
            enclosing_scope_chain: &[],
            current_class: None,
            this_value: None,
            this_name,
            base_name,
        }
    }

    #[test]
    fn resolve_walks_the_enclosing_scope_chain_outward() {
        let mut heap = Heap::new(1024 * 1024);
        let mut interns = Interner::new();
        let this_name = interns.intern("this");
        let base_name = interns.intern("base");

        let outer_name = interns.intern("Outer");
        let outer = heap.alloc(ValueData::Module(ModuleData {
            name: outer_name,
            parent: None,
            imports: ahash::AHashMap::default(),
            scope: Scope::default(),
        }));
        let target_name = interns.intern("target");
        let target = heap.alloc(ValueData::I32(7));
        if let ValueData::Module(m) = &mut heap.get_mut(outer).unwrap().data {
            m.scope.insert(target_name, target);
        }

        let inner = heap.alloc(ValueData::Module(ModuleData {
            name: interns.intern("Inner"),
            parent: Some(outer),
            imports: ahash::AHashMap::default(),
            scope: Scope::default(),
        }));

        let reference = Reference::single(target_name);
        let mut c = ctx(this_name, base_name);
        let scope_chain = [inner, outer];
        c.enclosing_scope_chain = &scope_chain;
        let (resolved, owner) = resolve(&mut heap, &reference, &c).expect("target is reachable through the outer scope");
        assert_eq!(resolved, target);
        assert_eq!(owner, Some(outer), "the first entry's owner is the scope it was found on");
    }

    #[test]
    fn resolve_reports_the_deepest_prefix_it_found() {
        let mut heap = Heap::new(1024 * 1024);
        let mut interns = Interner::new();
        let this_name = interns.intern("this");
        let base_name = interns.intern("base");

        let module_name = interns.intern("M");
        let module = heap.alloc(ValueData::Module(ModuleData {
            name: module_name,
            parent: None,
            imports: ahash::AHashMap::default(),
            scope: Scope::default(),
        }));

        let reference = Reference::new(vec![RefEntry::simple(module_name), RefEntry::simple(interns.intern("missing"))]);
        let mut c = ctx(this_name, base_name);
        let scope_chain = [heap.root()];
        c.enclosing_scope_chain = &scope_chain;
        if let ValueData::Root(scope) = &mut heap.get_mut(heap.root()).unwrap().data {
            scope.insert(module_name, module);
        }
        let err = resolve(&mut heap, &reference, &c).expect_err("`M.missing` does not exist");
        assert_eq!(err.resolved_entries, 1, "`M` itself resolved before the walk failed on `missing`");
    }

    #[test]
    fn resolve_follows_this_and_base_through_the_class_chain() {
        let mut heap = Heap::new(1024 * 1024);
        let mut interns = Interner::new();
        let this_name = interns.intern("this");
        let base_name = interns.intern("base");

        let parent_class = heap.alloc(ValueData::Class(ClassData {
            name: interns.intern("Parent"),
            access: AccessFlags::PUBLIC,
            parent: None,
            interfaces: Vec::new(),
            generic_params: Vec::new(),
            scope: Scope::default(),
            instantiated_from: None,
        }));
        let child_class = heap.alloc(ValueData::Class(ClassData {
            name: interns.intern("Child"),
            access: AccessFlags::PUBLIC,
            parent: Some(TypeRef::Resolved(parent_class)),
            interfaces: Vec::new(),
            generic_params: Vec::new(),
            scope: Scope::default(),
            instantiated_from: None,
        }));

        let object = heap.alloc(ValueData::I32(0)); // stand-in `this` value, identity is all that matters here

        let mut c = ctx(this_name, base_name);
        c.this_value = Some(object);
        c.current_class = Some(child_class);

        let this_ref = Reference::single(this_name);
        let (resolved, owner) = resolve(&mut heap, &this_ref, &c).unwrap();
        assert_eq!(resolved, object);
        assert_eq!(owner, None, "`this` is a binding, not a member lookup");

        let base_ref = Reference::single(base_name);
        let (resolved, owner) = resolve(&mut heap, &base_ref, &c).unwrap();
        assert_eq!(resolved, parent_class);
        assert_eq!(owner, None, "`base` is a binding, not a member lookup");
    }

    #[test]
    fn resolve_transparently_unwraps_an_alias() {
        let mut heap = Heap::new(1024 * 1024);
        let mut interns = Interner::new();
        let this_name = interns.intern("this");
        let base_name = interns.intern("base");

        let real = heap.alloc(ValueData::I32(99));
        let alias_name = interns.intern("renamed");
        let alias = heap.alloc(ValueData::Alias(real));

        let scope_owner = heap.root();
        if let ValueData::Root(scope) = &mut heap.get_mut(scope_owner).unwrap().data {
            scope.insert(alias_name, alias);
        }

        let mut c = ctx(this_name, base_name);
        let scope_chain = [scope_owner];
        c.enclosing_scope_chain = &scope_chain;
        let (resolved, _) = resolve(&mut heap, &Reference::single(alias_name), &c).unwrap();
        assert_eq!(resolved, real, "resolving an alias must land on its pointee, never the alias value itself");
    }
}
