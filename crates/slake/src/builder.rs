//! In-memory module/function builder, for tests that need live values
//! installed in a [`Heap`] without going through [`crate::loader`] and an
//! encoded SLX image.
//!
//! Mirrors the loader's own installation shape (`insert_member`'s
//! scope-insert-plus-refcount pattern, the vars/fns/classes/interfaces/traits
//! install order) but builds straight from a fluent API instead of decoding
//! bytes, standing in for an assembler that is out of scope for this crate.

use ahash::AHashMap;

use crate::bytecode::{Instruction, Opcode, Operand};
use crate::heap::Heap;
use crate::intern::{Interner, StringId};
use crate::types::{Type, TypeRef};
use crate::value::{
    AccessFlags, ClassData, FnBody, FnData, GenericParam, InterfaceData, ModuleData, Param, Scope, SourceLocRange,
    TraitData, ValueData, ValueId, VarData,
};

/// Builds one function body, instruction by instruction.
#[derive(Debug, Clone)]
pub struct FnBuilder {
    name: String,
    access: AccessFlags,
    return_type: Type,
    params: Vec<(String, Type)>,
    has_varargs: bool,
    generic_params: Vec<GenericParam>,
    is_async: bool,
    instructions: Vec<Instruction>,
    source_locations: Vec<SourceLocRange>,
}

impl FnBuilder {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            access: AccessFlags::PUBLIC,
            return_type: Type::any(),
            params: Vec::new(),
            has_varargs: false,
            generic_params: Vec::new(),
            is_async: false,
            instructions: Vec::new(),
            source_locations: Vec::new(),
        }
    }

    #[must_use]
    pub fn access(mut self, access: AccessFlags) -> Self {
        self.access = access;
        self
    }

    #[must_use]
    pub fn returns(mut self, ty: Type) -> Self {
        self.return_type = ty;
        self
    }

    #[must_use]
    pub fn param(mut self, name: &str, ty: Type) -> Self {
        self.params.push((name.to_owned(), ty));
        self
    }

    #[must_use]
    pub fn varargs(mut self) -> Self {
        self.has_varargs = true;
        self
    }

    #[must_use]
    pub fn generic_params(mut self, params: Vec<GenericParam>) -> Self {
        self.generic_params = params;
        self
    }

    #[must_use]
    pub fn async_fn(mut self) -> Self {
        self.is_async = true;
        self
    }

    /// Appends one instruction, returning its offset within the body.
    pub fn instr(mut self, opcode: Opcode, operands: Vec<Operand>) -> Self {
        self.instructions.push(Instruction::new(opcode, operands));
        self
    }

    /// The offset the next `instr` call will land at — for backpatching a
    /// `Jmp`/`Jt`/`Jf`/`Pushxh` target computed from a later point in the
    /// body.
    #[must_use]
    pub fn next_offset(&self) -> u32 {
        self.instructions.len() as u32
    }

    fn into_fn_data(self, interns: &mut Interner) -> FnData {
        let name = interns.intern(&self.name);
        let params = self.params.into_iter().map(|(n, ty)| Param { name: interns.intern(&n), ty }).collect();
        let body = FnBody { instructions: self.instructions, source_locations: self.source_locations };
        FnData {
            name,
            access: self.access,
            return_type: self.return_type,
            params,
            has_varargs: self.has_varargs,
            generic_params: self.generic_params,
            is_async: self.is_async,
            body: Some(body),
            instantiated_from: None,
        }
    }

    /// Allocates this function and installs it into `owner`'s scope.
    pub fn install(self, heap: &mut Heap, interns: &mut Interner, owner: ValueId) -> ValueId {
        let data = self.into_fn_data(interns);
        let name = data.name;
        let id = heap.alloc(ValueData::Fn(data));
        insert_member(heap, owner, name, id);
        id
    }
}

/// Builds a class: its own member vars/fns, plus any nested
/// class/interface/trait (mirroring the loader's nested-scope recursion).
#[derive(Debug, Clone, Default)]
pub struct ClassBuilder {
    name: String,
    access: AccessFlags,
    parent: Option<TypeRef>,
    interfaces: Vec<TypeRef>,
    generic_params: Vec<GenericParam>,
    vars: Vec<(String, AccessFlags, Type)>,
    fns: Vec<FnBuilder>,
}

impl ClassBuilder {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self { name: name.to_owned(), access: AccessFlags::PUBLIC, ..Self::default() }
    }

    #[must_use]
    pub fn access(mut self, access: AccessFlags) -> Self {
        self.access = access;
        self
    }

    #[must_use]
    pub fn extends(mut self, parent: ValueId) -> Self {
        self.parent = Some(TypeRef::Resolved(parent));
        self
    }

    #[must_use]
    pub fn implements(mut self, interface: ValueId) -> Self {
        self.interfaces.push(TypeRef::Resolved(interface));
        self
    }

    #[must_use]
    pub fn generic_params(mut self, params: Vec<GenericParam>) -> Self {
        self.generic_params = params;
        self
    }

    #[must_use]
    pub fn var(mut self, name: &str, access: AccessFlags, ty: Type) -> Self {
        self.vars.push((name.to_owned(), access, ty));
        self
    }

    #[must_use]
    pub fn method(mut self, f: FnBuilder) -> Self {
        self.fns.push(f);
        self
    }

    /// Allocates this class (with an empty scope) and installs it into
    /// `owner`'s scope, then fills in its members — matching the loader's
    /// own order, so a member that looks itself up via `base`/`this` inside
    /// another method sees a fully-wired class.
    pub fn install(self, heap: &mut Heap, interns: &mut Interner, owner: ValueId) -> ValueId {
        let name = interns.intern(&self.name);
        let class_id = heap.alloc(ValueData::Class(ClassData {
            name,
            access: self.access,
            parent: self.parent,
            interfaces: self.interfaces,
            generic_params: self.generic_params,
            scope: Scope::default(),
            instantiated_from: None,
        }));
        insert_member(heap, owner, name, class_id);

        for (var_name, access, declared_type) in self.vars {
            let value = heap.none();
            heap.inc_ref(value);
            let vname = interns.intern(&var_name);
            let id = heap.alloc(ValueData::Var(VarData { name: vname, access, declared_type, value }));
            insert_member(heap, class_id, vname, id);
        }
        for f in self.fns {
            f.install(heap, interns, class_id);
        }
        class_id
    }
}

/// Builds an interface or trait: a name, an access mask and a parent list,
/// sharing one shape since both are pure member contracts with no bodies.
#[derive(Debug, Clone, Default)]
pub struct ProtocolBuilder {
    name: String,
    access: AccessFlags,
    parents: Vec<TypeRef>,
    generic_params: Vec<GenericParam>,
    vars: Vec<(String, AccessFlags, Type)>,
    fns: Vec<FnBuilder>,
}

impl ProtocolBuilder {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self { name: name.to_owned(), access: AccessFlags::PUBLIC, ..Self::default() }
    }

    #[must_use]
    pub fn access(mut self, access: AccessFlags) -> Self {
        self.access = access;
        self
    }

    #[must_use]
    pub fn extends(mut self, parent: ValueId) -> Self {
        self.parents.push(TypeRef::Resolved(parent));
        self
    }

    #[must_use]
    pub fn var(mut self, name: &str, access: AccessFlags, ty: Type) -> Self {
        self.vars.push((name.to_owned(), access, ty));
        self
    }

    #[must_use]
    pub fn method(mut self, f: FnBuilder) -> Self {
        self.fns.push(f);
        self
    }

    pub fn install_interface(self, heap: &mut Heap, interns: &mut Interner, owner: ValueId) -> ValueId {
        let name = interns.intern(&self.name);
        let id = heap.alloc(ValueData::Interface(InterfaceData {
            name,
            access: self.access,
            parents: self.parents.clone(),
            generic_params: self.generic_params.clone(),
            scope: Scope::default(),
            instantiated_from: None,
        }));
        insert_member(heap, owner, name, id);
        self.install_members(heap, interns, id);
        id
    }

    pub fn install_trait(self, heap: &mut Heap, interns: &mut Interner, owner: ValueId) -> ValueId {
        let name = interns.intern(&self.name);
        let id = heap.alloc(ValueData::Trait(TraitData {
            name,
            access: self.access,
            parents: self.parents.clone(),
            generic_params: self.generic_params.clone(),
            scope: Scope::default(),
            instantiated_from: None,
        }));
        insert_member(heap, owner, name, id);
        self.install_members(heap, interns, id);
        id
    }

    fn install_members(self, heap: &mut Heap, interns: &mut Interner, owner: ValueId) {
        for (var_name, access, declared_type) in self.vars {
            let value = heap.none();
            heap.inc_ref(value);
            let vname = interns.intern(&var_name);
            let id = heap.alloc(ValueData::Var(VarData { name: vname, access, declared_type, value }));
            insert_member(heap, owner, vname, id);
        }
        for f in self.fns {
            f.install(heap, interns, owner);
        }
    }
}

/// Builds a module: a flat list of vars/fns/classes/nested modules, matching
/// the five-section scope layout the loader reads off the wire.
#[derive(Debug, Clone, Default)]
pub struct ModuleBuilder {
    name: String,
    vars: Vec<(String, AccessFlags, Type)>,
    fns: Vec<FnBuilder>,
    classes: Vec<ClassBuilder>,
}

impl ModuleBuilder {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self { name: name.to_owned(), ..Self::default() }
    }

    #[must_use]
    pub fn var(mut self, name: &str, access: AccessFlags, ty: Type) -> Self {
        self.vars.push((name.to_owned(), access, ty));
        self
    }

    #[must_use]
    pub fn function(mut self, f: FnBuilder) -> Self {
        self.fns.push(f);
        self
    }

    #[must_use]
    pub fn class(mut self, c: ClassBuilder) -> Self {
        self.classes.push(c);
        self
    }

    /// Allocates this module and installs it under `owner` (typically
    /// [`Heap::root`]), then fills in its members.
    pub fn install(self, heap: &mut Heap, interns: &mut Interner, owner: ValueId) -> ValueId {
        let name = interns.intern(&self.name);
        let module_id = heap.alloc(ValueData::Module(ModuleData {
            name,
            parent: Some(owner),
            imports: AHashMap::default(),
            scope: Scope::default(),
        }));
        insert_member(heap, owner, name, module_id);

        for (var_name, access, declared_type) in self.vars {
            let value = heap.none();
            heap.inc_ref(value);
            let vname = interns.intern(&var_name);
            let id = heap.alloc(ValueData::Var(VarData { name: vname, access, declared_type, value }));
            insert_member(heap, module_id, vname, id);
        }
        for f in self.fns {
            f.install(heap, interns, module_id);
        }
        for c in self.classes {
            c.install(heap, interns, module_id);
        }
        module_id
    }
}

/// Interns `name` and wraps it as a single-entry [`crate::reference::Reference`],
/// the form `LOAD`/`CALL`/`MCALL` operands expect for a bare name lookup.
#[must_use]
pub fn reference(interns: &mut Interner, name: &str) -> crate::reference::Reference {
    crate::reference::Reference::single(interns.intern(name))
}

#[must_use]
pub fn string_id(interns: &mut Interner, name: &str) -> StringId {
    interns.intern(name)
}

fn insert_member(heap: &mut Heap, owner: ValueId, name: StringId, id: ValueId) {
    if let Some(scope) = heap.get_mut(owner).and_then(|v| v.data.scope_mut()) {
        scope.insert(name, id);
    }
    heap.inc_ref(id);
}
