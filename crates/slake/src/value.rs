//! The value graph: every runtime-visible entity and its per-kind payload.
//! Per-kind behavior dispatches on a tag rather than on a virtual-method
//! hierarchy — [`ValueData`] is a tagged union and
//! the handful of well-typed operations (`get_member`, `call`, scope access)
//! live on [`Value`] and in [`crate::heap`], [`crate::resolver`].

use ahash::AHashMap;
use indexmap::IndexMap;

use crate::bytecode::Instruction;
use crate::intern::StringId;
use crate::reference::Reference;
use crate::types::{Type, TypeRef};

/// Handle into [`crate::heap::Heap`]'s slab. Stable for the value's lifetime;
/// never reused while the value is live (the allocator reuses the slot only
/// after release, and every reference to a released value is either an
/// upheld invariant violation or a deliberately weak back-reference such as
/// an alias's non-owning pointer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub(crate) u32);

impl ValueId {
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Name → member mapping owned by a container value (module, class,
/// interface, trait, object).
pub type Scope = IndexMap<StringId, ValueId, ahash::RandomState>;

/// A minimal bitflags-style macro, avoiding a dependency pull-in for a
/// half-dozen boolean flags.
macro_rules! bitflags_like_access {
    ($(#[$meta:meta])* pub struct $name:ident: $repr:ty { $(const $flag:ident = $value:expr;)* }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct $name(pub $repr);

        impl $name {
            $(pub const $flag: $name = $name($value);)*

            #[must_use]
            pub fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;
            fn bitor(self, rhs: Self) -> Self { Self(self.0 | rhs.0) }
        }
    };
}

bitflags_like_access! {
    /// Access flags, shared by every member-bearing value.
    pub struct AccessFlags: u16 {
        const PUBLIC = 0x01;
        const STATIC = 0x02;
        const NATIVE = 0x04;
        const OVERRIDE = 0x08;
        const FINAL = 0x10;
        const CONST = 0x20;
    }
}

impl AccessFlags {
    #[must_use]
    pub fn is_public(self) -> bool {
        self.contains(Self::PUBLIC)
    }
}

/// One entry of a generic parameter list.
#[derive(Debug, Clone)]
pub struct GenericParam {
    pub name: StringId,
    pub qualifiers: Vec<GenericQualifier>,
}

#[derive(Debug, Clone)]
pub enum GenericQualifier {
    Extends(TypeRef),
    Implements(TypeRef),
    HasTrait(TypeRef),
}

#[derive(Debug, Clone)]
pub struct ModuleData {
    pub name: StringId,
    pub parent: Option<ValueId>,
    pub imports: AHashMap<StringId, ValueId>,
    pub scope: Scope,
}

#[derive(Debug, Clone)]
pub struct ClassData {
    pub name: StringId,
    pub access: AccessFlags,
    pub parent: Option<TypeRef>,
    pub interfaces: Vec<TypeRef>,
    pub generic_params: Vec<GenericParam>,
    pub scope: Scope,
    /// Set on instantiations produced by the generic instantiator; `None`
    /// for the template itself and for non-generic classes.
    pub instantiated_from: Option<(ValueId, Vec<Type>)>,
}

#[derive(Debug, Clone)]
pub struct InterfaceData {
    pub name: StringId,
    pub access: AccessFlags,
    pub parents: Vec<TypeRef>,
    pub generic_params: Vec<GenericParam>,
    pub scope: Scope,
    pub instantiated_from: Option<(ValueId, Vec<Type>)>,
}

#[derive(Debug, Clone)]
pub struct TraitData {
    pub name: StringId,
    pub access: AccessFlags,
    pub parents: Vec<TypeRef>,
    pub generic_params: Vec<GenericParam>,
    pub scope: Scope,
    pub instantiated_from: Option<(ValueId, Vec<Type>)>,
}

#[derive(Debug, Clone)]
pub struct ObjectData {
    pub class: ValueId,
    /// Copied from the class scope at `NEW` time: each instance owns its own
    /// variable slots while methods are shared (looked up through `class`).
    pub members: Scope,
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: StringId,
    pub ty: Type,
}

pub type SourceLocRange = (u32, (u32, u32), (u32, u32));

#[derive(Debug, Clone, Default)]
pub struct FnBody {
    pub instructions: Vec<Instruction>,
    /// Instruction offset → ((start line, start col), (end line, end col)).
    pub source_locations: Vec<SourceLocRange>,
}

#[derive(Debug, Clone)]
pub struct FnData {
    pub name: StringId,
    pub access: AccessFlags,
    pub return_type: Type,
    pub params: Vec<Param>,
    pub has_varargs: bool,
    pub generic_params: Vec<GenericParam>,
    pub is_async: bool,
    pub body: Option<FnBody>,
    pub instantiated_from: Option<(ValueId, Vec<Type>)>,
}

pub type NativeCallback = std::rc::Rc<dyn Fn(&mut crate::host::Runtime, &[ValueId]) -> Result<Option<ValueId>, crate::error::RuntimeError>>;

#[derive(Clone)]
pub struct NativeFnData {
    pub name: StringId,
    pub return_type: Type,
    pub params: Vec<Param>,
    pub callback: NativeCallback,
}

impl std::fmt::Debug for NativeFnData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeFnData").field("name", &self.name).finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct VarData {
    pub name: StringId,
    pub access: AccessFlags,
    pub declared_type: Type,
    /// `None`/unset is represented as `ValueId` of the well-known none
    /// singleton held by the heap, never as `Option::None`, so a `var` slot
    /// is always a valid operand to dereference.
    pub value: ValueId,
}

/// Per-kind payload of a value.
#[derive(Debug, Clone)]
pub enum ValueData {
    None,
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Bool(bool),
    Str(String),
    WStr(Vec<u16>),
    Char(char),
    WChar(u16),
    Ref(Reference),
    Array(Type, Vec<ValueId>),
    Map(Type, Type, Vec<(ValueId, ValueId)>),
    Module(ModuleData),
    Class(ClassData),
    Interface(InterfaceData),
    Trait(TraitData),
    Object(ObjectData),
    Fn(FnData),
    NativeFn(NativeFnData),
    Var(VarData),
    /// A non-owning pointer to the value it aliases — the alias flags the
    /// pointee's `alias_shared_scope` bit so its scope isn't double-owned.
    Alias(ValueId),
    Context(crate::fiber::Fiber),
    Root(Scope),
}

impl ValueData {
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::I8(_) => "i8",
            Self::I16(_) => "i16",
            Self::I32(_) => "i32",
            Self::I64(_) => "i64",
            Self::U8(_) => "u8",
            Self::U16(_) => "u16",
            Self::U32(_) => "u32",
            Self::U64(_) => "u64",
            Self::F32(_) => "f32",
            Self::F64(_) => "f64",
            Self::Bool(_) => "bool",
            Self::Str(_) => "string",
            Self::WStr(_) => "wstring",
            Self::Char(_) => "char",
            Self::WChar(_) => "wchar",
            Self::Ref(_) => "ref",
            Self::Array(..) => "array",
            Self::Map(..) => "map",
            Self::Module(_) => "module",
            Self::Class(_) => "class",
            Self::Interface(_) => "interface",
            Self::Trait(_) => "trait",
            Self::Object(_) => "object",
            Self::Fn(_) => "fn",
            Self::NativeFn(_) => "fn",
            Self::Var(_) => "var",
            Self::Alias(_) => "alias",
            Self::Context(_) => "context",
            Self::Root(_) => "root",
        }
    }

    /// The scope of a container value, if it has one.
    #[must_use]
    pub fn scope(&self) -> Option<&Scope> {
        match self {
            Self::Module(m) => Some(&m.scope),
            Self::Class(c) => Some(&c.scope),
            Self::Interface(i) => Some(&i.scope),
            Self::Trait(t) => Some(&t.scope),
            Self::Object(o) => Some(&o.members),
            Self::Root(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn scope_mut(&mut self) -> Option<&mut Scope> {
        match self {
            Self::Module(m) => Some(&mut m.scope),
            Self::Class(c) => Some(&mut c.scope),
            Self::Interface(i) => Some(&mut i.scope),
            Self::Trait(t) => Some(&mut t.scope),
            Self::Object(o) => Some(&mut o.members),
            Self::Root(s) => Some(s),
            _ => None,
        }
    }
}

/// Bits owned by the value envelope itself rather than its payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValueFlags {
    /// Set by the tracing sweep while walking; cleared before each sweep.
    pub walked: bool,
    /// Set on an alias's pointee so the pointee's scope is not freed twice.
    pub alias_shared_scope: bool,
}

/// A value envelope: identity (implicit in its [`ValueId`]), payload, and
/// the counters that govern its lifetime.
#[derive(Debug, Clone)]
pub struct Value {
    pub data: ValueData,
    pub flags: ValueFlags,
    pub refcount: u32,
    pub host_refcount: u32,
    /// Set for members: most container values decide this from their
    /// payload's `AccessFlags`; literals and temporaries are always public.
    access: AccessFlags,
}

impl Value {
    #[must_use]
    pub fn new(data: ValueData) -> Self {
        let access = match &data {
            ValueData::Class(c) => c.access,
            ValueData::Interface(i) => i.access,
            ValueData::Trait(t) => t.access,
            ValueData::Fn(f) => f.access,
            ValueData::Var(v) => v.access,
            _ => AccessFlags::PUBLIC,
        };
        Self { data, flags: ValueFlags::default(), refcount: 0, host_refcount: 0, access }
    }

    #[must_use]
    pub fn is_public(&self) -> bool {
        self.access.is_public()
    }

    #[must_use]
    pub fn access(&self) -> AccessFlags {
        self.access
    }
}
