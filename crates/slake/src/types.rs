//! The tagged type descriptor and the five relations defined over it.

use crate::heap::Heap;
use crate::reference::Reference;
use crate::value::{ValueData, ValueId};

/// The closed tag set. Composite tags (`array`, `map`,
/// `class`/`interface`/`trait`/`object`, `generic_arg`, `ref`) carry a
/// payload in [`Type`]; the rest are self-describing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::FromRepr)]
#[strum(serialize_all = "snake_case")]
#[repr(u8)]
pub enum TypeTag {
    None,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    Bool,
    String,
    WString,
    Char,
    WChar,
    Fn,
    Module,
    Var,
    Array,
    Map,
    Class,
    Interface,
    Trait,
    Object,
    Any,
    Alias,
    Ref,
    GenericArg,
    Root,
    Typename,
    Context,
    LvarRef,
    RegRef,
    ArgRef,
}

impl TypeTag {
    #[must_use]
    pub fn is_integer(self) -> bool {
        matches!(
            self,
            Self::I8 | Self::I16 | Self::I32 | Self::I64 | Self::U8 | Self::U16 | Self::U32 | Self::U64
        )
    }

    #[must_use]
    pub fn is_numeric(self) -> bool {
        self.is_integer() || matches!(self, Self::F32 | Self::F64)
    }

    #[must_use]
    pub fn is_defining(self) -> bool {
        matches!(self, Self::Class | Self::Interface | Self::Trait | Self::Object)
    }
}

/// Either a live pointer to the value that defines a type, or a path that
/// has not been resolved yet.
///
/// Class parents and implemented-interface lists are stored `Deferred` by
/// the loader and forced to `Resolved` the first time a query needs
/// identity (an `Implements`/`HasTrait` check, a `CAST`, assignability).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeRef {
    Resolved(ValueId),
    Deferred(Reference),
}

/// A type descriptor: a tag plus whatever payload that tag requires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Type {
    pub tag: TypeTag,
    pub payload: TypePayload,
    /// Marks an assignability restriction on object types.
    pub is_const: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TypePayload {
    #[default]
    None,
    Array(Box<Type>),
    Map(Box<Type>, Box<Type>),
    Defining(TypeRef),
    GenericArg(u8),
}

impl Type {
    #[must_use]
    pub fn simple(tag: TypeTag) -> Self {
        Self { tag, payload: TypePayload::None, is_const: false }
    }

    #[must_use]
    pub fn any() -> Self {
        Self::simple(TypeTag::Any)
    }

    #[must_use]
    pub fn none() -> Self {
        Self::simple(TypeTag::None)
    }

    #[must_use]
    pub fn array(element: Type) -> Self {
        Self { tag: TypeTag::Array, payload: TypePayload::Array(Box::new(element)), is_const: false }
    }

    #[must_use]
    pub fn map(key: Type, value: Type) -> Self {
        Self { tag: TypeTag::Map, payload: TypePayload::Map(Box::new(key), Box::new(value)), is_const: false }
    }

    #[must_use]
    pub fn defining(tag: TypeTag, target: TypeRef) -> Self {
        debug_assert!(tag.is_defining());
        Self { tag, payload: TypePayload::Defining(target), is_const: false }
    }

    #[must_use]
    pub fn generic_arg(index: u8) -> Self {
        Self { tag: TypeTag::GenericArg, payload: TypePayload::GenericArg(index), is_const: false }
    }

    /// The value this type's payload points at, forcing resolution of a
    /// deferred reference first. Only meaningful for defining tags.
    pub fn defining_value(&mut self, heap: &mut Heap) -> Option<ValueId> {
        match &mut self.payload {
            TypePayload::Defining(TypeRef::Resolved(id)) => Some(*id),
            TypePayload::Defining(r @ TypeRef::Deferred(_)) => {
                let resolved = heap.force_deferred_type(r)?;
                *r = TypeRef::Resolved(resolved);
                Some(resolved)
            }
            _ => None,
        }
    }
}

/// Structural equality used as the generic-instantiation cache key:
/// "Generic-argument lists used as cache keys compare by structural equality
/// on their element types." Resolved defining types compare by pointer
/// identity of the defining value.
#[must_use]
pub fn type_eq(a: &Type, b: &Type) -> bool {
    if a.tag != b.tag || a.is_const != b.is_const {
        return false;
    }
    match (&a.payload, &b.payload) {
        (TypePayload::None, TypePayload::None) => true,
        (TypePayload::GenericArg(x), TypePayload::GenericArg(y)) => x == y,
        (TypePayload::Array(x), TypePayload::Array(y)) => type_eq(x, y),
        (TypePayload::Map(xk, xv), TypePayload::Map(yk, yv)) => type_eq(xk, yk) && type_eq(xv, yv),
        (TypePayload::Defining(TypeRef::Resolved(x)), TypePayload::Defining(TypeRef::Resolved(y))) => x == y,
        // Two still-deferred types are never asserted equal: forcing
        // resolution first is the caller's job (see `Type::defining_value`).
        _ => false,
    }
}

/// `Implements(C, I)`: `I` appears in `C`'s implemented-interface list,
/// transitively through any interface `C` implements, or in any ancestor.
#[must_use]
pub fn implements(heap: &mut Heap, class: ValueId, interface: ValueId) -> bool {
    let mut frontier = vec![class];
    let mut seen = ahash::AHashSet::default();
    while let Some(cur) = frontier.pop() {
        if !seen.insert(cur) {
            continue;
        }
        if cur == interface {
            return true;
        }
        let (iface_refs, parent_ref) = match heap.get(cur).map(|v| &v.data) {
            Some(ValueData::Class(c)) => (c.interfaces.clone(), c.parent.clone()),
            Some(ValueData::Interface(i)) => (i.parents.clone(), None),
            _ => (Vec::new(), None),
        };
        let next_ifaces: Vec<ValueId> = iface_refs.into_iter().filter_map(|mut r| resolve_type_ref(heap, &mut r)).collect();
        let parent = parent_ref.and_then(|mut r| resolve_type_ref(heap, &mut r));
        frontier.extend(next_ifaces);
        if let Some(p) = parent {
            frontier.push(p);
        }
    }
    false
}

fn resolve_type_ref(heap: &mut Heap, r: &mut TypeRef) -> Option<ValueId> {
    match r {
        TypeRef::Resolved(id) => Some(*id),
        TypeRef::Deferred(_) => {
            let resolved = heap.force_deferred_type(r)?;
            *r = TypeRef::Resolved(resolved);
            Some(resolved)
        }
    }
}

/// `HasTrait(C, T)`: `C` has every member named in `T`'s scope, with
/// matching member kind, matching variable type or function signature
/// (return + parameters in order), and the member is public. `T`'s parent
/// traits must also be satisfied transitively.
#[must_use]
pub fn has_trait(heap: &mut Heap, class: ValueId, trait_: ValueId) -> bool {
    let Some(ValueData::Trait(t)) = heap.get(trait_).map(|v| &v.data) else { return false };
    let member_names: Vec<_> = t.scope.keys().copied().collect();
    let parents = t.parents.clone();
    for name in member_names {
        let Some(ValueData::Trait(t)) = heap.get(trait_).map(|v| &v.data) else { return false };
        let Some(&trait_member) = t.scope.get(&name) else { return false };
        let Some(ValueData::Class(c)) = heap.get(class).map(|v| &v.data) else { return false };
        let Some(&class_member) = c.scope.get(&name) else { return false };
        if !member_signature_matches(heap, trait_member, class_member) {
            return false;
        }
    }
    for mut parent in parents {
        let Some(parent_id) = resolve_type_ref(heap, &mut parent) else { return false };
        if !has_trait(heap, class, parent_id) {
            return false;
        }
    }
    true
}

fn member_signature_matches(heap: &Heap, trait_member: ValueId, class_member: ValueId) -> bool {
    let (Some(tm), Some(cm)) = (heap.get(trait_member), heap.get(class_member)) else { return false };
    if !cm.is_public() {
        return false;
    }
    match (&tm.data, &cm.data) {
        (ValueData::Var(a), ValueData::Var(b)) => type_eq(&a.declared_type, &b.declared_type),
        (ValueData::Fn(a), ValueData::Fn(b)) => {
            type_eq(&a.return_type, &b.return_type)
                && a.params.len() == b.params.len()
                && a.params.iter().zip(&b.params).all(|(p, q)| type_eq(&p.ty, &q.ty))
        }
        _ => false,
    }
}

/// `Convertible(A, B)`: `B == A`, or numeric→numeric, or `A` implements `B`,
/// or `A` satisfies trait `B`, or either side is `any`, or `A` is `none`.
/// Implicit conversions never occur; this relation only governs `CAST`.
#[must_use]
pub fn convertible(heap: &mut Heap, a: &Type, b: &Type) -> bool {
    if type_eq(a, b) {
        return true;
    }
    if matches!(a.tag, TypeTag::Any) || matches!(b.tag, TypeTag::Any) || matches!(a.tag, TypeTag::None) {
        return true;
    }
    if a.tag.is_numeric() && b.tag.is_numeric() {
        return true;
    }
    if a.tag == TypeTag::Class && b.tag == TypeTag::Class {
        let (Some(ca), Some(cb)) = (class_of(a), class_of(b)) else { return false };
        return implements(heap, ca, cb);
    }
    if a.tag == TypeTag::Class && b.tag == TypeTag::Trait {
        let (Some(ca), Some(cb)) = (class_of(a), class_of(b)) else { return false };
        return has_trait(heap, ca, cb);
    }
    false
}

fn class_of(t: &Type) -> Option<ValueId> {
    match &t.payload {
        TypePayload::Defining(TypeRef::Resolved(id)) => Some(*id),
        _ => None,
    }
}

/// `Compatible(slot-type, value-type)`: the assignability check used for
/// `var` stores and parameter binding.
#[must_use]
pub fn compatible(heap: &mut Heap, slot: &Type, value: &Type) -> bool {
    if slot.tag == TypeTag::Any || value.tag == TypeTag::None {
        return true;
    }
    if type_eq(slot, value) {
        return true;
    }
    if slot.tag == TypeTag::Class && value.tag == TypeTag::Class {
        let (Some(cs), Some(cv)) = (class_of(slot), class_of(value)) else { return false };
        return cs == cv || implements_class(heap, cv, cs);
    }
    if slot.tag == TypeTag::Interface && value.tag == TypeTag::Class {
        let (Some(is), Some(cv)) = (class_of(slot), class_of(value)) else { return false };
        return implements(heap, cv, is);
    }
    false
}

/// True when `sub` is `base` itself or a (possibly indirect) subclass.
#[must_use]
pub fn implements_class(heap: &mut Heap, sub: ValueId, base: ValueId) -> bool {
    if sub == base {
        return true;
    }
    let mut cur = sub;
    loop {
        let parent = match heap.get_mut(cur).map(|v| &mut v.data) {
            Some(ValueData::Class(c)) => c.parent.clone().and_then(|mut r| resolve_type_ref(heap, &mut r)),
            _ => None,
        };
        match parent {
            Some(p) if p == base => return true,
            Some(p) => cur = p,
            None => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intern::Interner;
    use crate::value::{AccessFlags, ClassData, InterfaceData, Scope, TraitData, VarData};

    fn new_heap() -> Heap {
        Heap::new(1024 * 1024)
    }

    fn class(heap: &mut Heap, parent: Option<ValueId>, interfaces: Vec<ValueId>, interns: &mut Interner, name: &str) -> ValueId {
        heap.alloc(ValueData::Class(ClassData {
            name: interns.intern(name),
            access: AccessFlags::PUBLIC,
            parent: parent.map(TypeRef::Resolved),
            interfaces: interfaces.into_iter().map(TypeRef::Resolved).collect(),
            generic_params: Vec::new(),
            scope: Scope::default(),
            instantiated_from: None,
        }))
    }

    #[test]
    fn type_eq_compares_resolved_defining_types_by_pointee_identity() {
        let mut heap = new_heap();
        let mut interns = Interner::new();
        let a = class(&mut heap, None, Vec::new(), &mut interns, "A");
        let b = class(&mut heap, None, Vec::new(), &mut interns, "B");

        let ty_a = Type::defining(TypeTag::Class, TypeRef::Resolved(a));
        let ty_a_again = Type::defining(TypeTag::Class, TypeRef::Resolved(a));
        let ty_b = Type::defining(TypeTag::Class, TypeRef::Resolved(b));

        assert!(type_eq(&ty_a, &ty_a_again));
        assert!(!type_eq(&ty_a, &ty_b));
    }

    #[test]
    fn implements_walks_the_parent_chain_to_a_grandparents_interface() {
        let mut heap = new_heap();
        let mut interns = Interner::new();
        let iface = heap.alloc(ValueData::Interface(InterfaceData {
            name: interns.intern("Drawable"),
            access: AccessFlags::PUBLIC,
            parents: Vec::new(),
            generic_params: Vec::new(),
            scope: Scope::default(),
            instantiated_from: None,
        }));
        let grandparent = class(&mut heap, None, vec![iface], &mut interns, "Shape");
        let parent = class(&mut heap, Some(grandparent), Vec::new(), &mut interns, "Polygon");
        let child = class(&mut heap, Some(parent), Vec::new(), &mut interns, "Square");

        assert!(implements(&mut heap, child, iface), "interface satisfied two levels up must still count");
        assert!(!implements(&mut heap, child, parent), "a parent class is not itself an interface relation");
    }

    #[test]
    fn has_trait_requires_a_matching_public_member() {
        let mut heap = new_heap();
        let mut interns = Interner::new();
        let x_name = interns.intern("x");

        let trait_x = heap.alloc(ValueData::Trait(TraitData {
            name: interns.intern("HasX"),
            access: AccessFlags::PUBLIC,
            parents: Vec::new(),
            generic_params: Vec::new(),
            scope: Scope::default(),
            instantiated_from: None,
        }));
        let none = heap.none();
        let trait_member = heap.alloc(ValueData::Var(VarData {
            name: x_name,
            access: AccessFlags::PUBLIC,
            declared_type: Type::simple(TypeTag::I32),
            value: none,
        }));
        if let ValueData::Trait(t) = &mut heap.get_mut(trait_x).unwrap().data {
            t.scope.insert(x_name, trait_member);
        }

        let public_class = class(&mut heap, None, Vec::new(), &mut interns, "Public");
        let public_member = heap.alloc(ValueData::Var(VarData {
            name: x_name,
            access: AccessFlags::PUBLIC,
            declared_type: Type::simple(TypeTag::I32),
            value: none,
        }));
        if let ValueData::Class(c) = &mut heap.get_mut(public_class).unwrap().data {
            c.scope.insert(x_name, public_member);
        }
        assert!(has_trait(&mut heap, public_class, trait_x));

        let private_class = class(&mut heap, None, Vec::new(), &mut interns, "Private");
        let private_member = heap.alloc(ValueData::Var(VarData {
            name: x_name,
            access: AccessFlags::default(),
            declared_type: Type::simple(TypeTag::I32),
            value: none,
        }));
        if let ValueData::Class(c) = &mut heap.get_mut(private_class).unwrap().data {
            c.scope.insert(x_name, private_member);
        }
        assert!(!has_trait(&mut heap, private_class, trait_x), "a private member never satisfies a trait");
    }

    #[test]
    fn convertible_allows_numeric_widening_and_any_on_either_side() {
        let mut heap = new_heap();
        assert!(convertible(&mut heap, &Type::simple(TypeTag::I32), &Type::simple(TypeTag::I64)));
        assert!(convertible(&mut heap, &Type::any(), &Type::simple(TypeTag::Bool)));
        assert!(convertible(&mut heap, &Type::simple(TypeTag::Bool), &Type::any()));
        assert!(!convertible(&mut heap, &Type::simple(TypeTag::Bool), &Type::simple(TypeTag::I32)));
    }

    #[test]
    fn compatible_allows_assigning_a_subclass_value_to_a_base_slot() {
        let mut heap = new_heap();
        let mut interns = Interner::new();
        let base = class(&mut heap, None, Vec::new(), &mut interns, "Base");
        let derived = class(&mut heap, Some(base), Vec::new(), &mut interns, "Derived");

        let slot = Type::defining(TypeTag::Class, TypeRef::Resolved(base));
        let value = Type::defining(TypeTag::Class, TypeRef::Resolved(derived));
        assert!(compatible(&mut heap, &slot, &value));

        let reversed_slot = Type::defining(TypeTag::Class, TypeRef::Resolved(derived));
        let reversed_value = Type::defining(TypeTag::Class, TypeRef::Resolved(base));
        assert!(!compatible(&mut heap, &reversed_slot, &reversed_value), "a base value cannot satisfy a derived slot");
    }
}
