//! The module loader: turns an SLX image into live values installed
//! in the heap's root namespace.
//!
//! Loading never executes bytecode — it only allocates values and wires up
//! scopes, imports and (deferred) type references. A class's parent and
//! implemented interfaces are stored as [`TypeRef::Deferred`] and only
//! forced to a live value the first time a relation query needs identity
//!, so import order within a single image never
//! matters.

mod decode;

use ahash::AHashMap;

use crate::error::LoaderError;
use crate::format::{self, LoadFlags};
use crate::heap::Heap;
use crate::intern::Interner;
use crate::reference::Reference;
use crate::types::TypeRef;
use crate::value::{
    AccessFlags, ClassData, FnBody, FnData, GenericParam, GenericQualifier, InterfaceData, ModuleData, Param, Scope,
    TraitData, ValueData, ValueId, VarData,
};

pub use decode::Reader;

/// Supplies the bytes of an imported module by its dotted path.
///
/// Implemented by the host embedding the runtime; the loader never touches
/// a filesystem or network directly.
pub trait ModuleLocator {
    fn locate(&mut self, reference: &Reference, interns: &Interner) -> Option<Vec<u8>>;
}

/// Loads one SLX image, installing it (and, transitively, any import not
/// already present) into `heap`'s root namespace, and returns the new
/// module's value.
pub fn load_module(
    heap: &mut Heap,
    interns: &mut Interner,
    locator: &mut dyn ModuleLocator,
    data: &[u8],
    flags: LoadFlags,
) -> Result<ValueId, LoaderError> {
    let mut r = Reader::new(data);

    let mut magic = [0u8; 4];
    magic.copy_from_slice(r.bytes(4)?);
    if magic != format::MAGIC {
        return Err(LoaderError::BadMagic);
    }
    let version = r.u8()?;
    if version != format::FORMAT_VERSION {
        return Err(LoaderError::UnsupportedVersion(version));
    }
    let img_flags = r.u8()?;
    let import_count = r.u32()? as usize;

    let name_ref =
        if img_flags & format::IMH_MODULE_NAME_PRESENT != 0 { decode::read_reference(&mut r, interns)? } else { Reference::default() };

    let install = if name_ref.is_empty() { None } else { Some(ensure_path(heap, interns, flags, &name_ref)?) };
    let (leaf_name, parent) = match install {
        Some((owner, name)) => (name, Some(owner)),
        None => (interns.intern(""), None),
    };

    let module_id = heap.alloc(ValueData::Module(ModuleData {
        name: leaf_name,
        parent,
        imports: AHashMap::default(),
        scope: Scope::default(),
    }));
    if let Some(owner) = parent {
        if let Some(scope) = heap.get_mut(owner).and_then(|v| v.data.scope_mut()) {
            scope.insert(leaf_name, module_id);
        }
        heap.inc_ref(module_id);
    }

    for _ in 0..import_count {
        let alias = interns.intern(&r.string()?);
        let import_ref = decode::read_reference(&mut r, interns)?;
        let target = resolve_import(heap, interns, locator, flags, &import_ref)?;
        if let Some(ValueData::Module(m)) = heap.get_mut(module_id).map(|v| &mut v.data) {
            m.imports.insert(alias, target);
        }
        heap.inc_ref(target);
    }

    read_scope(&mut r, heap, interns, module_id)?;
    Ok(module_id)
}

/// Resolves an import target against the already-installed namespace first,
/// loading the dependency through the locator only when it is missing.
fn resolve_import(
    heap: &mut Heap,
    interns: &mut Interner,
    locator: &mut dyn ModuleLocator,
    flags: LoadFlags,
    reference: &Reference,
) -> Result<ValueId, LoaderError> {
    if let Some(id) = heap.force_deferred_type(&TypeRef::Deferred(reference.clone())) {
        return Ok(id);
    }
    if flags.contains(LoadFlags::NO_IMPORT) {
        return Err(LoaderError::ImportNotFound(reference.clone()));
    }
    let bytes = locator.locate(reference, interns).ok_or_else(|| LoaderError::ImportNotFound(reference.clone()))?;
    load_module(heap, interns, locator, &bytes, flags)
}

/// Walks (creating intermediate namespace modules as needed) to the scope
/// that should own `reference`'s last segment, honoring `no-reload` and
/// `no-conflict` against whatever already sits there.
fn ensure_path(
    heap: &mut Heap,
    interns: &Interner,
    flags: LoadFlags,
    reference: &Reference,
) -> Result<(ValueId, crate::intern::StringId), LoaderError> {
    let mut owner = heap.root();
    let last = reference.entries.len() - 1;
    for (i, entry) in reference.entries.iter().enumerate() {
        if i == last {
            let existing = heap.get(owner).and_then(|v| v.data.scope()).and_then(|s| s.get(&entry.name).copied());
            if let Some(existing_id) = existing {
                if flags.contains(LoadFlags::NO_RELOAD) {
                    return Err(LoaderError::AlreadyLoaded(interns.resolve(entry.name).to_owned()));
                }
                if flags.contains(LoadFlags::NO_CONFLICT) {
                    return Err(LoaderError::Conflict(interns.resolve(entry.name).to_owned()));
                }
                if let Some(scope) = heap.get_mut(owner).and_then(|v| v.data.scope_mut()) {
                    scope.remove(&entry.name);
                }
                heap.dec_ref(existing_id);
            }
            return Ok((owner, entry.name));
        }
        let next = heap.get(owner).and_then(|v| v.data.scope()).and_then(|s| s.get(&entry.name).copied());
        owner = match next {
            Some(id) => id,
            None => {
                let id = heap.alloc(ValueData::Module(ModuleData {
                    name: entry.name,
                    parent: Some(owner),
                    imports: AHashMap::default(),
                    scope: Scope::default(),
                }));
                if let Some(scope) = heap.get_mut(owner).and_then(|v| v.data.scope_mut()) {
                    scope.insert(entry.name, id);
                }
                heap.inc_ref(id);
                id
            }
        };
    }
    unreachable!("reference is non-empty, guaranteed by caller")
}

fn insert_member(heap: &mut Heap, owner: ValueId, name: crate::intern::StringId, id: ValueId) {
    if let Some(scope) = heap.get_mut(owner).and_then(|v| v.data.scope_mut()) {
        scope.insert(name, id);
    }
    heap.inc_ref(id);
}

fn decode_access(byte: u8) -> AccessFlags {
    let mut flags = AccessFlags::default();
    if byte & format::ACC_PUB != 0 {
        flags = flags | AccessFlags::PUBLIC;
    }
    if byte & format::ACC_STATIC != 0 {
        flags = flags | AccessFlags::STATIC;
    }
    if byte & format::ACC_NATIVE != 0 {
        flags = flags | AccessFlags::NATIVE;
    }
    if byte & format::ACC_OVERRIDE != 0 {
        flags = flags | AccessFlags::OVERRIDE;
    }
    if byte & format::ACC_FINAL != 0 {
        flags = flags | AccessFlags::FINAL;
    }
    if byte & format::ACC_CONST != 0 {
        flags = flags | AccessFlags::CONST;
    }
    flags
}

fn read_generic_params(r: &mut Reader<'_>, interns: &mut Interner) -> Result<Vec<GenericParam>, LoaderError> {
    let count = r.u8()? as usize;
    let mut params = Vec::with_capacity(count);
    for _ in 0..count {
        let name = interns.intern(&r.string()?);
        let qualifier_count = r.u8()? as usize;
        let mut qualifiers = Vec::with_capacity(qualifier_count);
        for _ in 0..qualifier_count {
            let kind = r.u8()?;
            let target = TypeRef::Deferred(decode::read_reference(r, interns)?);
            qualifiers.push(match kind {
                0 => GenericQualifier::Extends(target),
                1 => GenericQualifier::Implements(target),
                2 => GenericQualifier::HasTrait(target),
                other => return Err(LoaderError::UnknownTag(u32::from(other))),
            });
        }
        params.push(GenericParam { name, qualifiers });
    }
    Ok(params)
}

/// Reads one of the five member-kind sections making up a scope block
///, in fixed order: vars, fns, classes, interfaces,
/// traits. Recurses into each class/interface/trait's own nested scope.
fn read_scope(r: &mut Reader<'_>, heap: &mut Heap, interns: &mut Interner, owner: ValueId) -> Result<(), LoaderError> {
    let var_count = r.u32()? as usize;
    for _ in 0..var_count {
        let name = interns.intern(&r.string()?);
        let access = decode_access(r.u8()?);
        let declared_type = decode::read_type(r, interns)?;
        let value = heap.none();
        heap.inc_ref(value);
        let id = heap.alloc(ValueData::Var(VarData { name, access, declared_type, value }));
        insert_member(heap, owner, name, id);
    }

    let fn_count = r.u32()? as usize;
    for _ in 0..fn_count {
        let fn_data = read_fn(r, interns)?;
        let name = fn_data.name;
        let id = heap.alloc(ValueData::Fn(fn_data));
        insert_member(heap, owner, name, id);
    }

    let class_count = r.u32()? as usize;
    for _ in 0..class_count {
        let name = interns.intern(&r.string()?);
        let access_byte = r.u8()?;
        let access = decode_access(access_byte);
        let generic_params = read_generic_params(r, interns)?;
        let parent =
            if access_byte & format::ACC_DERIVED != 0 { Some(TypeRef::Deferred(decode::read_reference(r, interns)?)) } else { None };
        let interface_count = r.u8()? as usize;
        let mut interfaces = Vec::with_capacity(interface_count);
        for _ in 0..interface_count {
            interfaces.push(TypeRef::Deferred(decode::read_reference(r, interns)?));
        }
        let class_id = heap.alloc(ValueData::Class(ClassData {
            name,
            access,
            parent,
            interfaces,
            generic_params,
            scope: Scope::default(),
            instantiated_from: None,
        }));
        insert_member(heap, owner, name, class_id);
        read_scope(r, heap, interns, class_id)?;
    }

    let interface_count = r.u32()? as usize;
    for _ in 0..interface_count {
        let name = interns.intern(&r.string()?);
        let access = decode_access(r.u8()?);
        let generic_params = read_generic_params(r, interns)?;
        let parent_count = r.u8()? as usize;
        let mut parents = Vec::with_capacity(parent_count);
        for _ in 0..parent_count {
            parents.push(TypeRef::Deferred(decode::read_reference(r, interns)?));
        }
        let id = heap.alloc(ValueData::Interface(InterfaceData {
            name,
            access,
            parents,
            generic_params,
            scope: Scope::default(),
            instantiated_from: None,
        }));
        insert_member(heap, owner, name, id);
        read_scope(r, heap, interns, id)?;
    }

    let trait_count = r.u32()? as usize;
    for _ in 0..trait_count {
        let name = interns.intern(&r.string()?);
        let access = decode_access(r.u8()?);
        let generic_params = read_generic_params(r, interns)?;
        let parent_count = r.u8()? as usize;
        let mut parents = Vec::with_capacity(parent_count);
        for _ in 0..parent_count {
            parents.push(TypeRef::Deferred(decode::read_reference(r, interns)?));
        }
        let id = heap.alloc(ValueData::Trait(TraitData {
            name,
            access,
            parents,
            generic_params,
            scope: Scope::default(),
            instantiated_from: None,
        }));
        insert_member(heap, owner, name, id);
        read_scope(r, heap, interns, id)?;
    }

    Ok(())
}

fn read_fn(r: &mut Reader<'_>, interns: &mut Interner) -> Result<FnData, LoaderError> {
    let name = interns.intern(&r.string()?);
    let access = decode_access(r.u8()?);
    let return_type = decode::read_type(r, interns)?;
    let param_count = r.u8()? as usize;
    let mut params = Vec::with_capacity(param_count);
    for _ in 0..param_count {
        let pname = interns.intern(&r.string()?);
        let ty = decode::read_type(r, interns)?;
        params.push(Param { name: pname, ty });
    }
    let has_varargs = r.u8()? != 0;
    let is_async = r.u8()? != 0;
    let generic_params = read_generic_params(r, interns)?;
    let has_body = r.u8()? != 0;
    let body = if has_body { Some(read_fn_body(r, interns)?) } else { None };
    Ok(FnData { name, access, return_type, params, has_varargs, generic_params, is_async, body, instantiated_from: None })
}

fn read_fn_body(r: &mut Reader<'_>, interns: &mut Interner) -> Result<FnBody, LoaderError> {
    let instr_count = r.u32()? as usize;
    let mut instructions = Vec::with_capacity(instr_count);
    for _ in 0..instr_count {
        instructions.push(decode::read_instruction(r, interns)?);
    }
    let loc_count = r.u32()? as usize;
    let mut source_locations = Vec::with_capacity(loc_count);
    for _ in 0..loc_count {
        let offset = r.u32()?;
        let start = (r.u32()?, r.u32()?);
        let end = (r.u32()?, r.u32()?);
        source_locations.push((offset, start, end));
    }
    Ok(FnBody { instructions, source_locations })
}
