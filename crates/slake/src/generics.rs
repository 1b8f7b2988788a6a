//! The generic instantiator: produces and caches concrete values
//! from generic templates given an argument list.

use crate::bytecode::{Instruction, Operand};
use crate::error::{Fault, RuntimeError};
use crate::heap::Heap;
use crate::types::{self, Type, TypePayload, TypeRef, type_eq};
use crate::value::{FnBody, GenericParam, GenericQualifier, ValueData, ValueId};

/// Cache of (template, argument list) → instantiation, plus the reverse
/// lookup needed to evict an entry once its instantiation becomes
/// unreachable.
#[derive(Debug, Default)]
pub struct GenericCache {
    entries: Vec<(ValueId, Vec<Type>, ValueId)>,
}

impl GenericCache {
    fn lookup(&self, template: ValueId, args: &[Type]) -> Option<ValueId> {
        self.entries
            .iter()
            .find(|(t, a, _)| *t == template && a.len() == args.len() && a.iter().zip(args).all(|(x, y)| type_eq(x, y)))
            .map(|(_, _, inst)| *inst)
    }

    fn insert(&mut self, template: ValueId, args: Vec<Type>, instantiation: ValueId) {
        self.entries.push((template, args, instantiation));
    }

    /// Drops the cache entry for `instantiation` once it has been released,
    /// so a future identical instantiation request re-substitutes instead of
    /// returning a stale id.
    pub fn evict(&mut self, instantiation: ValueId) {
        self.entries.retain(|(_, _, inst)| *inst != instantiation);
    }
}

fn generic_params_of(heap: &Heap, template: ValueId) -> Option<Vec<GenericParam>> {
    match heap.get(template).map(|v| &v.data) {
        Some(ValueData::Class(c)) => Some(c.generic_params.clone()),
        Some(ValueData::Interface(i)) => Some(i.generic_params.clone()),
        Some(ValueData::Trait(t)) => Some(t.generic_params.clone()),
        Some(ValueData::Fn(f)) => Some(f.generic_params.clone()),
        _ => None,
    }
}

/// Instantiates `template` with `args`, or returns `template` unchanged when
/// no arguments are supplied.
pub fn instantiate(heap: &mut Heap, template: ValueId, args: &[Type]) -> Result<ValueId, RuntimeError> {
    if args.is_empty() {
        return Ok(template);
    }
    let Some(params) = generic_params_of(heap, template) else {
        return Ok(template);
    };
    if params.len() != args.len() {
        return Err(RuntimeError::new(
            Fault::InvalidArguments,
            format!("generic template expects {} argument(s), got {}", params.len(), args.len()),
        ));
    }
    for (param, arg) in params.iter().zip(args) {
        for qualifier in &param.qualifiers {
            check_qualifier(heap, arg, qualifier)?;
        }
    }

    if let Some(existing) = heap.generic_cache().lookup(template, args) {
        return Ok(existing);
    }

    let instantiation = deep_copy_substitute(heap, template, args)?;
    heap.generic_cache().insert(template, args.to_vec(), instantiation);
    Ok(instantiation)
}

fn check_qualifier(heap: &mut Heap, arg: &Type, qualifier: &GenericQualifier) -> Result<(), RuntimeError> {
    let arg_class = match &arg.payload {
        TypePayload::Defining(TypeRef::Resolved(id)) => Some(*id),
        TypePayload::Defining(r @ TypeRef::Deferred(_)) => heap.force_deferred_type(r),
        _ => None,
    };
    let ok = match qualifier {
        GenericQualifier::Extends(base) => {
            let Some(base_id) = heap.force_deferred_type(base) else { return Ok(()) };
            arg_class.is_some_and(|c| c == base_id || types::implements_class(heap, c, base_id))
        }
        GenericQualifier::Implements(iface) => {
            let Some(iface_id) = heap.force_deferred_type(iface) else { return Ok(()) };
            arg_class.is_some_and(|c| types::implements(heap, c, iface_id))
        }
        GenericQualifier::HasTrait(trait_) => {
            let Some(trait_id) = heap.force_deferred_type(trait_) else { return Ok(()) };
            arg_class.is_some_and(|c| types::has_trait(heap, c, trait_id))
        }
    };
    if ok {
        Ok(())
    } else {
        Err(RuntimeError::new(Fault::IncompatibleType, "generic argument does not satisfy parameter qualifier"))
    }
}

/// Substitutes every `generic_arg(i)` occurrence in `ty` with `args[i]`.
fn substitute_type(ty: &Type, args: &[Type]) -> Type {
    let payload = match &ty.payload {
        TypePayload::GenericArg(i) => return args[*i as usize].clone(),
        TypePayload::Array(elem) => TypePayload::Array(Box::new(substitute_type(elem, args))),
        TypePayload::Map(k, v) => TypePayload::Map(Box::new(substitute_type(k, args)), Box::new(substitute_type(v, args))),
        other => other.clone(),
    };
    Type { tag: ty.tag, payload, is_const: ty.is_const }
}

fn substitute_instruction(instr: &Instruction, args: &[Type]) -> Instruction {
    let operands = instr
        .operands
        .iter()
        .map(|op| match op {
            Operand::TypeName(ty) => Operand::TypeName(substitute_type(ty, args)),
            Operand::Reference(r) => {
                let mut r = r.clone();
                for entry in &mut r.entries {
                    for ga in &mut entry.generic_args {
                        *ga = substitute_type(ga, args);
                    }
                }
                Operand::Reference(r)
            }
            other => other.clone(),
        })
        .collect();
    Instruction { opcode: instr.opcode, operands }
}

fn substitute_body(body: &FnBody, args: &[Type]) -> FnBody {
    FnBody {
        instructions: body.instructions.iter().map(|i| substitute_instruction(i, args)).collect(),
        source_locations: body.source_locations.clone(),
    }
}

/// Deep-copies `template`'s scope into a fresh value, substituting
/// `generic_arg(i)` throughout. Substitution happens once, at
/// instantiation time, rather than lazily per the cycle note — self
/// referential generics (`class Node<T> { Node<T> next; }`) stay sound
/// because a field's declared type only ever names a bare `generic_arg`
/// or a concrete class, never a nested unresolved generic application.
fn deep_copy_substitute(heap: &mut Heap, template: ValueId, args: &[Type]) -> Result<ValueId, RuntimeError> {
    let data = heap.get(template).map(|v| v.data.clone()).ok_or_else(|| {
        RuntimeError::new(Fault::NotFound, "generic template vanished before instantiation")
    })?;

    let new_data = match data {
        ValueData::Class(mut c) => {
            c.scope = substitute_scope(heap, &c.scope, args);
            c.generic_params = Vec::new();
            c.instantiated_from = Some((template, args.to_vec()));
            ValueData::Class(c)
        }
        ValueData::Interface(mut i) => {
            i.scope = substitute_scope(heap, &i.scope, args);
            i.generic_params = Vec::new();
            i.instantiated_from = Some((template, args.to_vec()));
            ValueData::Interface(i)
        }
        ValueData::Trait(mut t) => {
            t.scope = substitute_scope(heap, &t.scope, args);
            t.generic_params = Vec::new();
            t.instantiated_from = Some((template, args.to_vec()));
            ValueData::Trait(t)
        }
        ValueData::Fn(mut f) => {
            f.return_type = substitute_type(&f.return_type, args);
            for p in &mut f.params {
                p.ty = substitute_type(&p.ty, args);
            }
            f.body = f.body.as_ref().map(|b| substitute_body(b, args));
            f.generic_params = Vec::new();
            f.instantiated_from = Some((template, args.to_vec()));
            ValueData::Fn(f)
        }
        other => other,
    };
    Ok(heap.alloc(new_data))
}

fn substitute_scope(heap: &mut Heap, scope: &crate::value::Scope, args: &[Type]) -> crate::value::Scope {
    let mut out = crate::value::Scope::default();
    for (&name, &member) in scope {
        let Some(member_data) = heap.get(member).map(|v| v.data.clone()) else { continue };
        let substituted = match member_data {
            ValueData::Var(mut v) => {
                v.declared_type = substitute_type(&v.declared_type, args);
                ValueData::Var(v)
            }
            ValueData::Fn(mut f) => {
                f.return_type = substitute_type(&f.return_type, args);
                for p in &mut f.params {
                    p.ty = substitute_type(&p.ty, args);
                }
                f.body = f.body.as_ref().map(|b| substitute_body(b, args));
                ValueData::Fn(f)
            }
            other => other,
        };
        let new_id = heap.alloc(substituted);
        heap.inc_ref(new_id);
        out.insert(name, new_id);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intern::Interner;
    use crate::types::TypeTag;
    use crate::value::{AccessFlags, Scope, VarData};

    #[test]
    fn substitute_type_replaces_a_bare_generic_arg() {
        let args = vec![Type::simple(TypeTag::I32)];
        let substituted = substitute_type(&Type::generic_arg(0), &args);
        assert_eq!(substituted, Type::simple(TypeTag::I32));
    }

    #[test]
    fn substitute_type_recurses_into_array_element_types() {
        let args = vec![Type::simple(TypeTag::Bool)];
        let substituted = substitute_type(&Type::array(Type::generic_arg(0)), &args);
        assert_eq!(substituted, Type::array(Type::simple(TypeTag::Bool)));
    }

    #[test]
    fn instantiate_returns_the_template_unchanged_with_no_arguments() {
        let mut heap = Heap::new(1024 * 1024);
        let template = heap.alloc(ValueData::None);
        let result = instantiate(&mut heap, template, &[]).unwrap();
        assert_eq!(result, template);
    }

    fn generic_box(heap: &mut Heap, interns: &mut Interner) -> ValueId {
        let t_name = interns.intern("T");
        let value_name = interns.intern("value");
        let none = heap.none();
        let field = heap.alloc(ValueData::Var(VarData {
            name: value_name,
            access: AccessFlags::PUBLIC,
            declared_type: Type::generic_arg(0),
            value: none,
        }));
        let mut scope = Scope::default();
        scope.insert(value_name, field);
        heap.alloc(ValueData::Class(crate::value::ClassData {
            name: interns.intern("Box"),
            access: AccessFlags::PUBLIC,
            parent: None,
            interfaces: Vec::new(),
            generic_params: vec![GenericParam { name: t_name, qualifiers: Vec::new() }],
            scope,
            instantiated_from: None,
        }))
    }

    #[test]
    fn instantiate_caches_repeat_calls_with_structurally_equal_arguments() {
        let mut heap = Heap::new(1024 * 1024);
        let mut interns = Interner::new();
        let template = generic_box(&mut heap, &mut interns);

        let i32_args = vec![Type::simple(TypeTag::I32)];
        let first = instantiate(&mut heap, template, &i32_args).unwrap();
        let second = instantiate(&mut heap, template, &i32_args).unwrap();
        assert_eq!(first, second, "identical argument lists must hit the cache, not re-substitute");
        assert_ne!(first, template);

        let bool_args = vec![Type::simple(TypeTag::Bool)];
        let third = instantiate(&mut heap, template, &bool_args).unwrap();
        assert_ne!(first, third, "a different argument list must produce a distinct instantiation");
    }

    #[test]
    fn instantiate_substitutes_the_generic_arg_in_the_copied_field() {
        let mut heap = Heap::new(1024 * 1024);
        let mut interns = Interner::new();
        let template = generic_box(&mut heap, &mut interns);
        let value_name = interns.intern("value");

        let instantiation = instantiate(&mut heap, template, &[Type::simple(TypeTag::I32)]).unwrap();
        let ValueData::Class(c) = &heap.get(instantiation).unwrap().data else { panic!("expected a class") };
        let field_id = *c.scope.get(&value_name).unwrap();
        let ValueData::Var(field) = &heap.get(field_id).unwrap().data else { panic!("expected a var") };
        assert_eq!(field.declared_type, Type::simple(TypeTag::I32));
    }

    #[test]
    fn instantiate_rejects_a_mismatched_argument_count() {
        let mut heap = Heap::new(1024 * 1024);
        let mut interns = Interner::new();
        let template = generic_box(&mut heap, &mut interns);
        let err = instantiate(&mut heap, template, &[Type::simple(TypeTag::I32), Type::simple(TypeTag::Bool)]).unwrap_err();
        assert_eq!(err.fault, Fault::InvalidArguments);
    }
}
