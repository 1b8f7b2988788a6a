#![doc = include_str!("../../../README.md")]
#![expect(clippy::cast_possible_truncation, reason = "wire format narrowing is bounds-checked by the reader")]
#![expect(clippy::cast_sign_loss, reason = "sign-changing casts are intentional in the decoder")]
#![expect(clippy::cast_possible_wrap, reason = "register/slot indices are small and checked")]
#![expect(clippy::too_many_arguments, reason = "resolver/loader context stays as plain parameters")]
#![expect(clippy::type_complexity, reason = "value graph payloads are intentionally rich")]

mod intern;
mod reference;
mod types;
mod value;
mod heap;
mod resource;
mod fiber;
mod resolver;
mod generics;
pub mod format;
mod bytecode;
pub mod error;
pub mod loader;
pub mod host;

#[cfg(feature = "test-support")]
pub mod builder;

pub use crate::bytecode::{Instruction, Literal, Opcode, Operand, RegId};
pub use crate::error::{Fault, LoaderError, RunResult, RuntimeError};
pub use crate::fiber::{Fiber, FiberFailure, MajorFrame, MinorFrame};
pub use crate::format::LoadFlags;
pub use crate::heap::{Heap, HeapStats};
pub use crate::host::Runtime;
pub use crate::intern::{Interner, StringId};
pub use crate::loader::ModuleLocator;
pub use crate::reference::{RefEntry, Reference};
pub use crate::resource::ResourceTracker;
pub use crate::types::{Type, TypeRef, TypeTag};
pub use crate::value::{
    AccessFlags, ClassData, FnBody, FnData, GenericParam, GenericQualifier, InterfaceData, ModuleData, NativeCallback,
    NativeFnData, ObjectData, Param, Scope, TraitData, Value, ValueData, ValueFlags, ValueId, VarData,
};
