//! `CALL`/`MCALL`/`ACALL`/`AMCALL`/`AWAIT` dispatch and exception unwinding.
//!
//! Split out of the parent module because call setup (arg binding, method
//! resolution, native short-circuiting) and unwind search are each a fair
//! amount of bookkeeping that has nothing to do with the rest of the opcode
//! table.

use crate::error::{Fault, RuntimeError, RunResult};
use crate::fiber::{Fiber, MajorFrame};
use crate::host::Runtime;
use crate::reference::Reference;
use crate::resolver;
use crate::types::Type;
use crate::value::{AccessFlags, ClassData, ValueData, ValueId, VarData};

use super::{eval_operand, reference_operand, resolve_in_frame, store_slot, StepResult};

/// Calls `func` immediately if it is a native function, returning its result
/// without touching the fiber's frame stack.
pub(super) fn invoke_native(rt: &mut Runtime, func: ValueId, args: &[ValueId]) -> RunResult<Option<ValueId>> {
    let Some(ValueData::NativeFn(nf)) = rt.heap.get(func).map(|v| v.data.clone()) else {
        return Ok(None);
    };
    (nf.callback)(rt, args)
}

/// Drains the current frame's `PUSHARG` accumulator.
fn take_args(fiber: &mut Fiber) -> Vec<ValueId> {
    std::mem::take(&mut fiber.current_frame_mut().expect("dispatch only runs with a current frame").next_arg_stack)
}

/// Walks `class`'s ancestor chain for a member named `name`, returning it
/// alongside the class that actually defines it. Shared by method dispatch
/// and constructor lookup — both need "closest-ancestor-wins" semantics.
pub(super) fn find_in_class_chain(rt: &mut Runtime, class: ValueId, name: crate::intern::StringId) -> Option<(ValueId, ValueId)> {
    let mut cur = Some(class);
    while let Some(id) = cur {
        let Some(ValueData::Class(ClassData { scope, parent, .. })) = rt.heap.get(id).map(|v| v.data.clone()) else { break };
        if let Some(&member) = scope.get(&name) {
            return Some((resolver::unwrap_alias(&rt.heap, member), id));
        }
        cur = match parent {
            Some(crate::types::TypeRef::Resolved(p)) => Some(p),
            Some(r @ crate::types::TypeRef::Deferred(_)) => rt.heap.force_deferred_type(&r),
            None => None,
        };
    }
    None
}

/// Walks a receiver's class chain looking for a member named by `name_ref`'s
/// sole entry. Instance fields live on the object itself; methods are never
/// copied into it, so a method lookup always has to go through the class.
/// Returns the method alongside the class that defines it, for the caller
/// to run an access check against.
fn resolve_method(rt: &mut Runtime, receiver: ValueId, name_ref: &Reference) -> RunResult<(ValueId, ValueId)> {
    let entry = name_ref.entries.first().ok_or_else(|| RuntimeError::new(Fault::InvalidOperands, "MCALL target is empty"))?;
    let class = match rt.heap.get(receiver).map(|v| &v.data) {
        Some(ValueData::Object(o)) => o.class,
        _ => return Err(RuntimeError::new(Fault::MismatchedType, "MCALL receiver is not an object")),
    };
    find_in_class_chain(rt, class, entry.name).ok_or_else(|| RuntimeError::new(Fault::NotFound, "method not found on receiver's class"))
}

/// Resolves a `CALL`/`MCALL` target and its `this` binding.
fn resolve_target(rt: &mut Runtime, fiber: &Fiber, instr: &crate::bytecode::Instruction, is_method: bool) -> RunResult<(ValueId, ValueId)> {
    if is_method {
        let receiver = eval_operand(rt, fiber, &instr.operands[1])?;
        let name_ref = reference_operand(&instr.operands[2])?;
        let (func, owner) = resolve_method(rt, receiver, name_ref)?;
        super::check_access(rt, fiber, func, owner)?;
        Ok((func, receiver))
    } else {
        let name_ref = reference_operand(&instr.operands[1])?;
        let func = resolve_in_frame(rt, fiber, name_ref)?;
        let this = fiber.current_frame().expect("dispatch only runs with a current frame").this_value;
        Ok((func, this))
    }
}

/// Builds a fresh major frame invoking `func` with `args`, bound to `this`,
/// whose return value is written into `return_into` when it eventually pops.
fn push_call_frame(rt: &mut Runtime, fiber: &mut Fiber, func: ValueId, this: ValueId, args: &[ValueId], return_into: crate::bytecode::Operand) -> RunResult<()> {
    let Some(ValueData::Fn(f)) = rt.heap.get(func).map(|v| v.data.clone()) else {
        return Err(RuntimeError::new(Fault::MismatchedType, "call target is not a Slake function"));
    };
    let Some(body) = f.body else {
        return Err(RuntimeError::new(Fault::InvalidOperands, "function has no body to call into"));
    };
    if fiber.frames.len() + 1 > rt.heap.tracker.max_frame_depth {
        return Err(RuntimeError::new(Fault::StackOverflow, "call stack depth exceeded"));
    }
    let none = rt.heap.none();
    let mut frame = MajorFrame::new(func, None, this, none);
    frame.return_into = Some(return_into);
    let anon = rt.interns.intern("");
    for &arg in args {
        rt.heap.inc_ref(arg);
        let slot = rt.heap.alloc(ValueData::Var(VarData { name: anon, access: AccessFlags::PUBLIC, declared_type: Type::any(), value: arg }));
        rt.heap.inc_host_ref(slot);
        frame.args.push(slot);
    }
    frame.body = std::rc::Rc::new(body);
    fiber.frames.push(frame);
    Ok(())
}

/// `CALL`/`MCALL`: invoke a function in the current fiber, synchronously.
pub(super) fn call(rt: &mut Runtime, fiber: &mut Fiber, instr: &crate::bytecode::Instruction, is_method: bool) -> RunResult<StepResult> {
    let args = take_args(fiber);
    let (func, this) = resolve_target(rt, fiber, instr, is_method)?;
    for &a in &args {
        rt.heap.dec_host_ref(a);
    }
    if let Some(result) = invoke_native(rt, func, &args)? {
        store_slot(rt, fiber, &instr.operands[0], result)?;
        return Ok(StepResult::Continue);
    }
    push_call_frame(rt, fiber, func, this, &args, instr.operands[0].clone())?;
    Ok(StepResult::Pushed)
}

/// `ACALL`/`AMCALL`: spawn a function as an independent suspended context
/// rather than calling into it on the current fiber.
pub(super) fn async_call(rt: &mut Runtime, fiber: &mut Fiber, instr: &crate::bytecode::Instruction, is_method: bool) -> RunResult<StepResult> {
    let args = take_args(fiber);
    let (func, this) = resolve_target(rt, fiber, instr, is_method)?;
    for &a in &args {
        rt.heap.dec_host_ref(a);
    }
    let context = super::spawn(rt, func, this, &args)?;
    store_slot(rt, fiber, &instr.operands[0], context)?;
    Ok(StepResult::Continue)
}

/// `AWAIT`: drives another context's fiber to completion and reads its
/// result, without suspending the awaiting fiber itself.
pub(super) fn await_context(rt: &mut Runtime, fiber: &mut Fiber, instr: &crate::bytecode::Instruction) -> RunResult<StepResult> {
    let context = eval_operand(rt, fiber, &instr.operands[1])?;
    let result = loop {
        let value = super::resume_context(rt, context)?;
        let done = matches!(rt.heap.get(context).map(|v| &v.data), Some(ValueData::Context(f)) if f.is_done());
        if done {
            break value;
        }
    };
    store_slot(rt, fiber, &instr.operands[0], result)?;
    Ok(StepResult::Continue)
}

/// Searches for a `PUSHXH` handler to resume at, starting at the current
/// frame's innermost minor frame and working outward. Pops exhausted major
/// frames along the way; returns `None` once the whole fiber is exhausted,
/// meaning `err` is fatal.
pub(super) fn unwind(rt: &mut Runtime, fiber: &mut Fiber, err: &RuntimeError) -> Option<u32> {
    let exception = err.payload.unwrap_or_else(|| rt.heap.alloc(ValueData::Str(err.message.clone())));
    loop {
        let frame = fiber.frames.last_mut()?;
        while let Some(minor) = frame.minor_frames.last_mut() {
            if let Some(target) = minor.handlers.pop() {
                frame.operand_stack.truncate(minor.data_stack_base);
                frame.in_flight_exception = Some(exception);
                fiber.registers.set(crate::bytecode::RegId::Rxcpt, exception);
                return Some(target);
            }
            frame.minor_frames.pop();
        }
        fiber.frames.pop();
        if fiber.frames.is_empty() {
            return None;
        }
    }
}
