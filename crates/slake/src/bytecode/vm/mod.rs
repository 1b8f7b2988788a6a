//! The interpreter: a stack machine that executes one
//! [`crate::bytecode::Instruction`] at a time against a [`Fiber`]'s call
//! frames, registers and stacks.
//!
//! Driving a fiber needs `&mut Runtime` (heap, interner, the whole world a
//! `CALL` to a native function can touch) at the same time as `&mut Fiber`
//! (the thing being driven), and the fiber normally lives inside the heap
//! it also needs to allocate from. [`Heap::take_fiber`]/[`Heap::put_fiber`]
//! resolve that by detaching the fiber for the duration of one dispatch
//! loop; every entry point in this module (`call_sync`, `spawn`,
//! `resume_context`) goes through that detach/run/reattach cycle exactly
//! once.

mod call;

use crate::bytecode::{Instruction, Literal, Opcode, Operand, RegId};
use crate::error::{Fault, RuntimeError, RunResult};
use crate::fiber::{Fiber, MajorFrame, MinorFrame};
use crate::host::Runtime;
use crate::reference::Reference;
use crate::resolver::{self, ResolveContext};
use crate::types::{self, Type, TypeTag};
use crate::value::{AccessFlags, ObjectData, ValueData, ValueId, VarData};

/// What one dispatch loop ended on.
enum Outcome {
    Completed(ValueId),
    Yielded(ValueId),
    Faulted(RuntimeError),
}

/// Calls a function to completion on a fresh, unshared fiber. The function
/// must not suspend at its top level — use [`spawn`] for a coroutine entry
/// point.
pub fn call_sync(rt: &mut Runtime, func: ValueId, this: ValueId, args: &[ValueId]) -> RunResult<ValueId> {
    if let Some(result) = call::invoke_native(rt, func, args)? {
        return Ok(result);
    }
    let mut fiber = build_fiber(rt, func, this, args)?;
    match run_until_suspend(rt, &mut fiber) {
        Outcome::Completed(v) => Ok(v),
        Outcome::Yielded(_) => {
            Err(RuntimeError::new(Fault::InvalidOpcode, "function suspended outside of a coroutine context"))
        }
        Outcome::Faulted(e) => Err(e),
    }
}

/// Starts a coroutine without running it, returning a `context` value the
/// caller drives with [`resume_context`].
pub fn spawn(rt: &mut Runtime, func: ValueId, this: ValueId, args: &[ValueId]) -> RunResult<ValueId> {
    let fiber = build_fiber(rt, func, this, args)?;
    let id = rt.heap.alloc(ValueData::Context(fiber));
    Ok(id)
}

/// Advances a suspended fiber until its next `YIELD` or completion.
pub fn resume_context(rt: &mut Runtime, context: ValueId) -> RunResult<ValueId> {
    let mut fiber =
        rt.heap.take_fiber(context).ok_or_else(|| RuntimeError::new(Fault::MismatchedType, "value is not a context"))?;
    if fiber.is_done() {
        let result = fiber.result;
        rt.heap.put_fiber(context, fiber);
        return Ok(result);
    }
    let outcome = run_until_suspend(rt, &mut fiber);
    let result = match &outcome {
        Outcome::Completed(v) | Outcome::Yielded(v) => Ok(*v),
        Outcome::Faulted(e) => Err(e.clone()),
    };
    rt.heap.put_fiber(context, fiber);
    result
}

fn build_fiber(rt: &mut Runtime, func: ValueId, this: ValueId, args: &[ValueId]) -> RunResult<Fiber> {
    let none = rt.heap.none();
    let enclosing_scope = None;
    let body = match rt.heap.get(func).map(|v| &v.data) {
        Some(ValueData::Fn(f)) => f.body.clone(),
        _ => return Err(RuntimeError::new(Fault::MismatchedType, "value is not a callable function")),
    };
    let Some(body) = body else {
        return Err(RuntimeError::new(Fault::InvalidOperands, "function declared native but has no registered callback"));
    };
    let mut frame = MajorFrame::new(func, enclosing_scope, this, none);
    let anon = rt.interns.intern("");
    for &arg in args {
        rt.heap.inc_ref(arg);
        let slot = rt.heap.alloc(ValueData::Var(VarData { name: anon, access: AccessFlags::PUBLIC, declared_type: Type::any(), value: arg }));
        rt.heap.inc_host_ref(slot);
        frame.args.push(slot);
    }
    frame.body = std::rc::Rc::new(body);
    Ok(Fiber::new(frame, none))
}

/// Runs `fiber` until it completes, yields, or faults.
fn run_until_suspend(rt: &mut Runtime, fiber: &mut Fiber) -> Outcome {
    loop {
        let Some(frame) = fiber.current_frame() else {
            return Outcome::Completed(fiber.result);
        };
        let Some(instr) = frame.body.instructions.get(frame.ip).cloned() else {
            return Outcome::Faulted(RuntimeError::new(Fault::FrameBoundary, "instruction pointer ran past function body"));
        };
        if fiber.abort_requested {
            return Outcome::Faulted(RuntimeError::new(Fault::Aborted, "fiber abort requested"));
        }
        match step(rt, fiber, &instr) {
            Ok(StepResult::Continue) => {
                if let Some(frame) = fiber.current_frame_mut() {
                    frame.ip += 1;
                }
            }
            Ok(StepResult::Jump(target)) => {
                if let Some(frame) = fiber.current_frame_mut() {
                    frame.ip = target as usize;
                }
            }
            Ok(StepResult::Pushed) => {}
            Ok(StepResult::Returned(value)) => {
                let popped = fiber.frames.pop().expect("dispatch only runs with a current frame");
                if fiber.frames.is_empty() {
                    fiber.done = true;
                    fiber.result = value;
                    return Outcome::Completed(value);
                }
                set_rr(fiber, value);
                if let Some(ret_into) = popped.return_into.clone() {
                    if let Err(e) = store_slot(rt, fiber, &ret_into, value) {
                        return Outcome::Faulted(e);
                    }
                }
                if let Some(frame) = fiber.current_frame_mut() {
                    frame.ip += 1;
                }
            }
            Ok(StepResult::Yielded(value)) => {
                fiber.result = value;
                return Outcome::Yielded(value);
            }
            Err(err) => match call::unwind(rt, fiber, &err) {
                Some(resume_at) => {
                    if let Some(frame) = fiber.current_frame_mut() {
                        frame.ip = resume_at as usize;
                    }
                }
                None => {
                    fiber.done = true;
                    fiber.failure = Some(crate::fiber::FiberFailure { fault: err.fault });
                    return Outcome::Faulted(err);
                }
            },
        }
        // The fiber driving this loop is detached from the heap (it was
        // taken out by `take_fiber`/never put in for a fresh `call_sync`),
        // so `Runtime::maybe_collect_garbage` can't see its roots on its
        // own; feed them in directly whenever a sweep is due.
        if rt.heap.should_sweep() {
            rt.heap.collect_cycles(fiber.gc_roots());
        }
    }
}

enum StepResult {
    Continue,
    Jump(u32),
    /// A new major frame was pushed (`CALL`/`MCALL` to a Slake-defined
    /// function); leave its `ip` at 0 rather than advancing it.
    Pushed,
    Returned(ValueId),
    Yielded(ValueId),
}

fn set_rr(fiber: &mut Fiber, value: ValueId) {
    fiber.registers.set(RegId::Rr, value);
}

/// Executes one instruction against the current frame of `fiber`.
fn step(rt: &mut Runtime, fiber: &mut Fiber, instr: &Instruction) -> RunResult<StepResult> {
    use Opcode::*;
    match instr.opcode {
        Nop => Ok(StepResult::Continue),

        Load => {
            let reference = reference_operand(&instr.operands[1])?;
            let (resolved, owner) = resolve_in_frame_with_owner(rt, fiber, reference)?;
            if let Some(owner) = owner {
                check_access(rt, fiber, resolved, owner)?;
            }
            let value = deref_if_var(rt, resolved);
            store_slot(rt, fiber, &instr.operands[0], value)?;
            Ok(StepResult::Continue)
        }
        Rload => {
            let base = eval_operand(rt, fiber, &instr.operands[1])?;
            let reference = reference_operand(&instr.operands[2])?;
            let ctx = ResolveContext {
                starting_scope: Some(base),
                enclosing_scope_chain: &[],
                current_class: None,
                this_value: None,
                this_name: rt.this_name(),
                base_name: rt.base_name(),
            };
            let (resolved, owner) = resolver::resolve(&mut rt.heap, reference, &ctx)
                .map_err(|_| RuntimeError::new(Fault::NotFound, "member not found"))?;
            if let Some(owner) = owner {
                check_access(rt, fiber, resolved, owner)?;
            }
            let value = deref_if_var(rt, resolved);
            store_slot(rt, fiber, &instr.operands[0], value)?;
            Ok(StepResult::Continue)
        }
        Store => {
            let value = eval_operand(rt, fiber, &instr.operands[1])?;
            store_slot(rt, fiber, &instr.operands[0], value)?;
            Ok(StepResult::Continue)
        }
        Lvar => {
            let Operand::TypeName(ty) = &instr.operands[0] else {
                return Err(RuntimeError::new(Fault::InvalidOperands, "LVAR expects a type name operand"));
            };
            let none = rt.heap.none();
            rt.heap.inc_ref(none);
            let anon = rt.interns.intern("");
            let slot = rt.heap.alloc(ValueData::Var(VarData { name: anon, access: AccessFlags::PUBLIC, declared_type: ty.clone(), value: none }));
            rt.heap.inc_host_ref(slot);
            fiber.current_frame_mut().unwrap().locals.push(slot);
            Ok(StepResult::Continue)
        }
        Lvalue => {
            let value = eval_operand(rt, fiber, &instr.operands[1])?;
            store_slot(rt, fiber, &instr.operands[0], value)?;
            Ok(StepResult::Continue)
        }
        Swap => {
            let a = eval_operand(rt, fiber, &instr.operands[0])?;
            let b = eval_operand(rt, fiber, &instr.operands[1])?;
            store_slot(rt, fiber, &instr.operands[0], b)?;
            store_slot(rt, fiber, &instr.operands[1], a)?;
            Ok(StepResult::Continue)
        }

        Jmp => Ok(StepResult::Jump(label_operand(&instr.operands[0])?)),
        Jt => {
            let value = eval_operand(rt, fiber, &instr.operands[0])?;
            let cond = truthy(rt, value);
            if cond { Ok(StepResult::Jump(label_operand(&instr.operands[1])?)) } else { Ok(StepResult::Continue) }
        }
        Jf => {
            let value = eval_operand(rt, fiber, &instr.operands[0])?;
            let cond = truthy(rt, value);
            if !cond { Ok(StepResult::Jump(label_operand(&instr.operands[1])?)) } else { Ok(StepResult::Continue) }
        }

        Enter => {
            let base = fiber.current_frame().map(|f| f.operand_stack.len()).unwrap_or(0);
            fiber.current_frame_mut().unwrap().minor_frames.push(MinorFrame { handlers: Vec::new(), unwind_exit: None, data_stack_base: base });
            Ok(StepResult::Continue)
        }
        Leave => {
            let frame = fiber.current_frame_mut().unwrap();
            if let Some(minor) = frame.minor_frames.pop() {
                frame.operand_stack.truncate(minor.data_stack_base);
            }
            Ok(StepResult::Continue)
        }

        Add | Sub | Mul | Div | Mod | And | Or | Xor | Land | Lor | Lsh | Rsh => {
            let lhs = eval_operand(rt, fiber, &instr.operands[1])?;
            let rhs = eval_operand(rt, fiber, &instr.operands[2])?;
            let result = arithmetic(rt, instr.opcode, lhs, rhs)?;
            store_slot(rt, fiber, &instr.operands[0], result)?;
            Ok(StepResult::Continue)
        }

        Neg | Not | Rev => {
            let src = eval_operand(rt, fiber, &instr.operands[1])?;
            let result = unary(rt, instr.opcode, src)?;
            store_slot(rt, fiber, &instr.operands[0], result)?;
            Ok(StepResult::Continue)
        }
        Incf | Decf | Incb | Decb => {
            let current = eval_operand(rt, fiber, &instr.operands[1])?;
            let delta = if matches!(instr.opcode, Incf | Incb) { 1 } else { -1 };
            let updated = numeric_step(rt, current, delta)?;
            store_slot(rt, fiber, &instr.operands[1], updated)?;
            let observed = if matches!(instr.opcode, Incf | Decf) { updated } else { current };
            store_slot(rt, fiber, &instr.operands[0], observed)?;
            Ok(StepResult::Continue)
        }

        Eq | Neq | Lt | Gt | Lteq | Gteq | Seq | Sneq => {
            let lhs = eval_operand(rt, fiber, &instr.operands[1])?;
            let rhs = eval_operand(rt, fiber, &instr.operands[2])?;
            let result = compare(rt, instr.opcode, lhs, rhs);
            let out = rt.heap.alloc(ValueData::Bool(result));
            store_slot(rt, fiber, &instr.operands[0], out)?;
            Ok(StepResult::Continue)
        }

        At => {
            let container = eval_operand(rt, fiber, &instr.operands[1])?;
            let index = eval_operand(rt, fiber, &instr.operands[2])?;
            let result = index_into(rt, container, index)?;
            store_slot(rt, fiber, &instr.operands[0], result)?;
            Ok(StepResult::Continue)
        }

        Pusharg => {
            let value = eval_operand(rt, fiber, &instr.operands[0])?;
            rt.heap.inc_host_ref(value);
            fiber.current_frame_mut().unwrap().next_arg_stack.push(value);
            Ok(StepResult::Continue)
        }
        Call => call::call(rt, fiber, instr, false),
        Mcall => call::call(rt, fiber, instr, true),
        Ret => {
            let value = if instr.operands.is_empty() { rt.heap.none() } else { eval_operand(rt, fiber, &instr.operands[0])? };
            Ok(StepResult::Returned(value))
        }
        Lret => {
            let value = fiber.registers.get(RegId::Rr);
            Ok(StepResult::Returned(value))
        }

        Acall => call::async_call(rt, fiber, instr, false),
        Amcall => call::async_call(rt, fiber, instr, true),
        Yield => {
            let value = eval_operand(rt, fiber, &instr.operands[0])?;
            Ok(StepResult::Yielded(value))
        }
        Await => call::await_context(rt, fiber, instr),

        New => {
            let Operand::TypeName(ty) = &instr.operands[1] else {
                return Err(RuntimeError::new(Fault::InvalidOperands, "NEW expects a type name operand"));
            };
            let mut ty = ty.clone();
            let class_id =
                ty.defining_value(&mut rt.heap).ok_or_else(|| RuntimeError::new(Fault::NotFound, "class could not be resolved"))?;
            let obj = new_object(rt, fiber, class_id)?;
            store_slot(rt, fiber, &instr.operands[0], obj)?;
            Ok(StepResult::Continue)
        }
        Cast => {
            let Operand::TypeName(target) = &instr.operands[1] else {
                return Err(RuntimeError::new(Fault::InvalidOperands, "CAST expects a type name operand"));
            };
            let src = eval_operand(rt, fiber, &instr.operands[2])?;
            let src_ty = value_type(rt, src);
            if !types::convertible(&mut rt.heap, &src_ty, target) {
                return Err(RuntimeError::new(Fault::IncompatibleType, "value is not convertible to the requested type"));
            }
            store_slot(rt, fiber, &instr.operands[0], src)?;
            Ok(StepResult::Continue)
        }
        Typeof => {
            let src = eval_operand(rt, fiber, &instr.operands[1])?;
            let name = rt.heap.get(src).map(|v| v.data.type_name()).unwrap_or("none");
            let out = rt.heap.alloc(ValueData::Str(name.to_string()));
            store_slot(rt, fiber, &instr.operands[0], out)?;
            Ok(StepResult::Continue)
        }

        Pushxh => {
            let target = label_operand(&instr.operands[0])?;
            let frame = fiber.current_frame_mut().unwrap();
            if frame.minor_frames.is_empty() {
                let base = frame.operand_stack.len();
                frame.minor_frames.push(MinorFrame { handlers: Vec::new(), unwind_exit: None, data_stack_base: base });
            }
            frame.minor_frames.last_mut().unwrap().handlers.push(target);
            Ok(StepResult::Continue)
        }
        Throw => {
            let value = eval_operand(rt, fiber, &instr.operands[0])?;
            let type_name = rt.heap.get(value).map(|v| v.data.type_name()).unwrap_or("none");
            Err(RuntimeError::new(Fault::UncaughtException, format!("thrown value of type `{type_name}`")).with_payload(value))
        }
        Lexcept => {
            let value = fiber.registers.get(RegId::Rxcpt);
            store_slot(rt, fiber, &instr.operands[0], value)?;
            Ok(StepResult::Continue)
        }

        Abort => Err(RuntimeError::new(Fault::Aborted, "ABORT executed")),
        Constsw => {
            let src = eval_operand(rt, fiber, &instr.operands[0])?;
            let Operand::SwitchTable(arms) = &instr.operands[1] else {
                return Err(RuntimeError::new(Fault::InvalidOperands, "CONSTSW expects a switch table operand"));
            };
            for (literal, target) in arms {
                if literal_eq(rt, literal, src) {
                    return Ok(StepResult::Jump(*target));
                }
            }
            Ok(StepResult::Continue)
        }
    }
}

fn reference_operand(operand: &Operand) -> RunResult<&Reference> {
    match operand {
        Operand::Reference(r) => Ok(r),
        _ => Err(RuntimeError::new(Fault::InvalidOperands, "expected a reference operand")),
    }
}

fn label_operand(operand: &Operand) -> RunResult<u32> {
    match operand {
        Operand::Label(l) => Ok(*l),
        _ => Err(RuntimeError::new(Fault::InvalidOperands, "expected a label operand")),
    }
}

/// Resolves `reference` starting from the current frame's scope chain
///, with `this`/`base` bound from the frame. Returns the scope the
/// resolved value's last entry was found on, alongside the value itself.
fn resolve_in_frame_with_owner(rt: &mut Runtime, fiber: &Fiber, reference: &Reference) -> RunResult<(ValueId, Option<ValueId>)> {
    let frame = fiber.current_frame().expect("dispatch only runs with a current frame");
    let mut chain = Vec::new();
    if let Some(s) = frame.enclosing_scope {
        chain.push(s);
    }
    chain.push(rt.heap.root());
    let this_value = Some(frame.this_value);
    let ctx = ResolveContext {
        starting_scope: None,
        enclosing_scope_chain: &chain,
        current_class: None,
        this_value,
        this_name: rt.this_name(),
        base_name: rt.base_name(),
    };
    resolver::resolve(&mut rt.heap, reference, &ctx).map_err(|_| RuntimeError::new(Fault::NotFound, "reference could not be resolved"))
}

fn resolve_in_frame(rt: &mut Runtime, fiber: &Fiber, reference: &Reference) -> RunResult<ValueId> {
    resolve_in_frame_with_owner(rt, fiber, reference).map(|(value, _owner)| value)
}

/// Raises `AccessViolation` when `member`, defined on `owner`, is not public
/// and the calling frame's `this` is not an instance of `owner` or one of
/// its subclasses. Only class-defined members carry meaningful visibility —
/// module- and interface-scoped lookups are left alone.
fn check_access(rt: &mut Runtime, fiber: &Fiber, member: ValueId, owner: ValueId) -> RunResult<()> {
    let owner_is_class = matches!(rt.heap.get(owner).map(|v| &v.data), Some(ValueData::Class(_)));
    if !owner_is_class || rt.heap.get(member).is_some_and(|v| v.is_public()) {
        return Ok(());
    }
    let this_value = fiber.current_frame().expect("dispatch only runs with a current frame").this_value;
    let caller_class = match rt.heap.get(this_value).map(|v| &v.data) {
        Some(ValueData::Object(o)) => Some(o.class),
        _ => None,
    };
    if let Some(class) = caller_class {
        if types::implements_class(&mut rt.heap, class, owner) {
            return Ok(());
        }
    }
    Err(RuntimeError::new(Fault::AccessViolation, "member is not accessible from this context"))
}

/// Reads the current value of an operand: a literal allocates
/// itself, a `Reg`/`Local`/`Arg` reads the slot (dereferencing through its
/// `Var` box for locals/args), a bare reference/type name resolves.
fn eval_operand(rt: &mut Runtime, fiber: &Fiber, operand: &Operand) -> RunResult<ValueId> {
    match operand {
        Operand::Literal(lit) => Ok(alloc_literal(rt, lit)),
        Operand::Reg { id, .. } => Ok(fiber.registers.get(*id)),
        Operand::Local { index, deref } => read_boxed_slot(rt, fiber.current_frame().unwrap().locals.get(*index as usize).copied(), *deref),
        Operand::Arg { index, deref } => read_boxed_slot(rt, fiber.current_frame().unwrap().args.get(*index as usize).copied(), *deref),
        Operand::Reference(r) => resolve_in_frame(rt, fiber, r),
        Operand::TypeName(_) | Operand::Label(_) | Operand::SwitchTable(_) => {
            Err(RuntimeError::new(Fault::InvalidOperands, "operand is not value-evaluable"))
        }
    }
}

/// `LOAD`/`RLOAD` resolve named references, which for a var member land on
/// the `Var` box rather than its held value (the resolver walks scopes, it
/// doesn't know which targets are boxed); unbox it here so a register never
/// ends up holding a `Var` the way `Local`/`Arg` slots always do before use.
fn deref_if_var(rt: &Runtime, id: ValueId) -> ValueId {
    match rt.heap.get(id).map(|v| &v.data) {
        Some(ValueData::Var(v)) => v.value,
        _ => id,
    }
}

fn read_boxed_slot(rt: &Runtime, slot: Option<ValueId>, deref: bool) -> RunResult<ValueId> {
    let Some(slot) = slot else { return Err(RuntimeError::new(Fault::InvalidOperands, "slot index out of range")) };
    if !deref {
        return Ok(slot);
    }
    match rt.heap.get(slot).map(|v| &v.data) {
        Some(ValueData::Var(v)) => Ok(v.value),
        _ => Ok(slot),
    }
}

/// Writes `value` into a destination operand, which must be `Reg`/`Local`/
/// `Arg` in its undereferenced form.
fn store_slot(rt: &mut Runtime, fiber: &mut Fiber, operand: &Operand, value: ValueId) -> RunResult<()> {
    match operand {
        Operand::Reg { id, .. } => {
            fiber.registers.set(*id, value);
            Ok(())
        }
        Operand::Local { index, .. } => write_boxed_slot(rt, fiber.current_frame().unwrap().locals.get(*index as usize).copied(), value),
        Operand::Arg { index, .. } => write_boxed_slot(rt, fiber.current_frame().unwrap().args.get(*index as usize).copied(), value),
        _ => Err(RuntimeError::new(Fault::InvalidOperands, "destination operand must be a slot reference")),
    }
}

fn write_boxed_slot(rt: &mut Runtime, slot: Option<ValueId>, value: ValueId) -> RunResult<()> {
    let Some(slot) = slot else { return Err(RuntimeError::new(Fault::InvalidOperands, "slot index out of range")) };
    match rt.heap.get_mut(slot).map(|v| &mut v.data) {
        Some(ValueData::Var(v)) => {
            let old = v.value;
            v.value = value;
            rt.heap.inc_ref(value);
            drop_ref(rt, old);
            Ok(())
        }
        _ => Err(RuntimeError::new(Fault::MismatchedType, "slot does not hold a variable box")),
    }
}

/// Drops a reference to `id`, running its `delete` member first if this is
/// its last reference and it declares one. The destructor's own failure is
/// recorded rather than propagated — it never blocks the release that
/// triggered it.
fn drop_ref(rt: &mut Runtime, id: ValueId) {
    let is_last_ref = matches!(rt.heap.get(id), Some(v) if v.refcount == 1 && v.host_refcount == 0);
    if is_last_ref && !rt.heap.is_destructing() {
        let delete_name = rt.interns.intern("delete");
        if let Some(dtor) = rt.heap.destructor_of(id, delete_name) {
            rt.heap.begin_destructing();
            if let Err(e) = call_sync(rt, dtor, id, &[]) {
                rt.record_destructor_failure(e);
            }
            rt.heap.end_destructing();
        }
    }
    rt.heap.dec_ref(id);
}

/// Runs every still-live object's `delete` member once, for a host's
/// explicit shutdown sweep. Unlike [`drop_ref`] this doesn't gate on
/// refcount — everything still around at shutdown gets one final call.
pub fn run_shutdown_destructors(rt: &mut Runtime) {
    let delete_name = rt.interns.intern("delete");
    for id in rt.heap.live_object_ids() {
        if let Some(dtor) = rt.heap.destructor_of(id, delete_name) {
            rt.heap.begin_destructing();
            if let Err(e) = call_sync(rt, dtor, id, &[]) {
                rt.record_destructor_failure(e);
            }
            rt.heap.end_destructing();
        }
    }
}

fn alloc_literal(rt: &mut Runtime, lit: &Literal) -> ValueId {
    let data = match lit.clone() {
        Literal::None => ValueData::None,
        Literal::I8(v) => ValueData::I8(v),
        Literal::I16(v) => ValueData::I16(v),
        Literal::I32(v) => ValueData::I32(v),
        Literal::I64(v) => ValueData::I64(v),
        Literal::U8(v) => ValueData::U8(v),
        Literal::U16(v) => ValueData::U16(v),
        Literal::U32(v) => ValueData::U32(v),
        Literal::U64(v) => ValueData::U64(v),
        Literal::F32(v) => ValueData::F32(v),
        Literal::F64(v) => ValueData::F64(v),
        Literal::Bool(v) => ValueData::Bool(v),
        Literal::Str(v) => ValueData::Str(v),
        Literal::WStr(v) => ValueData::WStr(v),
        Literal::Char(v) => ValueData::Char(v),
        Literal::WChar(v) => ValueData::WChar(v),
    };
    rt.heap.alloc(data)
}

fn truthy(rt: &Runtime, value: ValueId) -> bool {
    match rt.heap.get(value).map(|v| &v.data) {
        Some(ValueData::Bool(b)) => *b,
        Some(ValueData::None) => false,
        Some(ValueData::I8(n)) => *n != 0,
        Some(ValueData::I32(n)) => *n != 0,
        Some(ValueData::I64(n)) => *n != 0,
        _ => true,
    }
}

macro_rules! numeric_binop {
    ($heap:expr, $lhs:expr, $rhs:expr, $op:tt) => {
        match ($heap.get($lhs).map(|v| &v.data).cloned(), $heap.get($rhs).map(|v| &v.data).cloned()) {
            (Some(ValueData::I32(a)), Some(ValueData::I32(b))) => Some(ValueData::I32(a $op b)),
            (Some(ValueData::I64(a)), Some(ValueData::I64(b))) => Some(ValueData::I64(a $op b)),
            (Some(ValueData::F32(a)), Some(ValueData::F32(b))) => Some(ValueData::F32(a $op b)),
            (Some(ValueData::F64(a)), Some(ValueData::F64(b))) => Some(ValueData::F64(a $op b)),
            (Some(ValueData::U32(a)), Some(ValueData::U32(b))) => Some(ValueData::U32(a $op b)),
            (Some(ValueData::U64(a)), Some(ValueData::U64(b))) => Some(ValueData::U64(a $op b)),
            _ => None,
        }
    };
}

macro_rules! integer_binop {
    ($heap:expr, $lhs:expr, $rhs:expr, $op:tt) => {
        match ($heap.get($lhs).map(|v| &v.data).cloned(), $heap.get($rhs).map(|v| &v.data).cloned()) {
            (Some(ValueData::I32(a)), Some(ValueData::I32(b))) => Some(ValueData::I32(a $op b)),
            (Some(ValueData::I64(a)), Some(ValueData::I64(b))) => Some(ValueData::I64(a $op b)),
            (Some(ValueData::U32(a)), Some(ValueData::U32(b))) => Some(ValueData::U32(a $op b)),
            (Some(ValueData::U64(a)), Some(ValueData::U64(b))) => Some(ValueData::U64(a $op b)),
            _ => None,
        }
    };
}

fn arithmetic(rt: &mut Runtime, opcode: Opcode, lhs: ValueId, rhs: ValueId) -> RunResult<ValueId> {
    use Opcode::*;
    if opcode == Add {
        if let (Some(ValueData::Str(a)), Some(ValueData::Str(b))) = (rt.heap.get(lhs).map(|v| &v.data), rt.heap.get(rhs).map(|v| &v.data)) {
            let mut out = a.clone();
            out.push_str(b);
            return Ok(rt.heap.alloc(ValueData::Str(out)));
        }
    }
    let data = match opcode {
        Add => numeric_binop!(rt.heap, lhs, rhs, +),
        Sub => numeric_binop!(rt.heap, lhs, rhs, -),
        Mul => numeric_binop!(rt.heap, lhs, rhs, *),
        Div => numeric_binop!(rt.heap, lhs, rhs, /),
        Mod => numeric_binop!(rt.heap, lhs, rhs, %),
        And | Land => integer_binop!(rt.heap, lhs, rhs, &),
        Or | Lor => integer_binop!(rt.heap, lhs, rhs, |),
        Xor => integer_binop!(rt.heap, lhs, rhs, ^),
        Lsh => integer_shift(rt, lhs, rhs, true),
        Rsh => integer_shift(rt, lhs, rhs, false),
        _ => unreachable!("arithmetic only dispatched for numeric opcodes"),
    };
    data.map(|d| rt.heap.alloc(d)).ok_or_else(|| RuntimeError::new(Fault::MismatchedType, "operand types do not support this operation"))
}

fn integer_shift(rt: &Runtime, lhs: ValueId, rhs: ValueId, left: bool) -> Option<ValueData> {
    let shift = match rt.heap.get(rhs).map(|v| &v.data) {
        Some(ValueData::I32(n)) => *n as u32,
        Some(ValueData::I64(n)) => *n as u32,
        Some(ValueData::U32(n)) => *n,
        _ => return None,
    };
    match rt.heap.get(lhs).map(|v| &v.data) {
        Some(ValueData::I32(a)) => Some(ValueData::I32(if left { a.wrapping_shl(shift) } else { a.wrapping_shr(shift) })),
        Some(ValueData::I64(a)) => Some(ValueData::I64(if left { a.wrapping_shl(shift) } else { a.wrapping_shr(shift) })),
        Some(ValueData::U32(a)) => Some(ValueData::U32(if left { a.wrapping_shl(shift) } else { a.wrapping_shr(shift) })),
        Some(ValueData::U64(a)) => Some(ValueData::U64(if left { a.wrapping_shl(shift) } else { a.wrapping_shr(shift) })),
        _ => None,
    }
}

fn unary(rt: &mut Runtime, opcode: Opcode, src: ValueId) -> RunResult<ValueId> {
    use Opcode::*;
    let data = match (opcode, rt.heap.get(src).map(|v| &v.data)) {
        (Neg, Some(ValueData::I32(a))) => Some(ValueData::I32(-a)),
        (Neg, Some(ValueData::I64(a))) => Some(ValueData::I64(-a)),
        (Neg, Some(ValueData::F32(a))) => Some(ValueData::F32(-a)),
        (Neg, Some(ValueData::F64(a))) => Some(ValueData::F64(-a)),
        (Not, Some(ValueData::Bool(a))) => Some(ValueData::Bool(!a)),
        (Rev, Some(ValueData::I32(a))) => Some(ValueData::I32(!a)),
        (Rev, Some(ValueData::I64(a))) => Some(ValueData::I64(!a)),
        (Rev, Some(ValueData::U32(a))) => Some(ValueData::U32(!a)),
        (Rev, Some(ValueData::U64(a))) => Some(ValueData::U64(!a)),
        _ => None,
    };
    data.map(|d| rt.heap.alloc(d)).ok_or_else(|| RuntimeError::new(Fault::MismatchedType, "operand type does not support this operation"))
}

fn numeric_step(rt: &mut Runtime, value: ValueId, delta: i64) -> RunResult<ValueId> {
    let data = match rt.heap.get(value).map(|v| &v.data) {
        Some(ValueData::I32(a)) => Some(ValueData::I32(a + delta as i32)),
        Some(ValueData::I64(a)) => Some(ValueData::I64(a + delta)),
        Some(ValueData::U32(a)) => Some(ValueData::U32((*a as i64 + delta) as u32)),
        Some(ValueData::U64(a)) => Some(ValueData::U64((*a as i64 + delta) as u64)),
        Some(ValueData::F32(a)) => Some(ValueData::F32(a + delta as f32)),
        Some(ValueData::F64(a)) => Some(ValueData::F64(a + delta as f64)),
        _ => None,
    };
    data.map(|d| rt.heap.alloc(d)).ok_or_else(|| RuntimeError::new(Fault::MismatchedType, "value is not numeric"))
}

fn compare(rt: &mut Runtime, opcode: Opcode, lhs: ValueId, rhs: ValueId) -> bool {
    use Opcode::*;
    if matches!(opcode, Seq | Sneq) {
        let eq = lhs == rhs;
        return if opcode == Seq { eq } else { !eq };
    }
    let ordering = numeric_cmp(rt, lhs, rhs);
    match (opcode, ordering) {
        (Eq, Some(std::cmp::Ordering::Equal)) => true,
        (Eq, _) => false,
        (Neq, Some(std::cmp::Ordering::Equal)) => false,
        (Neq, _) => true,
        (Lt, Some(std::cmp::Ordering::Less)) => true,
        (Lt, _) => false,
        (Gt, Some(std::cmp::Ordering::Greater)) => true,
        (Gt, _) => false,
        (Lteq, Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal)) => true,
        (Lteq, _) => false,
        (Gteq, Some(std::cmp::Ordering::Greater | std::cmp::Ordering::Equal)) => true,
        (Gteq, _) => false,
        _ => false,
    }
}

fn numeric_cmp(rt: &Runtime, lhs: ValueId, rhs: ValueId) -> Option<std::cmp::Ordering> {
    let a = as_f64(rt, lhs)?;
    let b = as_f64(rt, rhs)?;
    a.partial_cmp(&b)
}

fn as_f64(rt: &Runtime, id: ValueId) -> Option<f64> {
    match rt.heap.get(id).map(|v| &v.data) {
        Some(ValueData::I8(n)) => Some(*n as f64),
        Some(ValueData::I16(n)) => Some(*n as f64),
        Some(ValueData::I32(n)) => Some(*n as f64),
        Some(ValueData::I64(n)) => Some(*n as f64),
        Some(ValueData::U8(n)) => Some(*n as f64),
        Some(ValueData::U16(n)) => Some(*n as f64),
        Some(ValueData::U32(n)) => Some(*n as f64),
        Some(ValueData::U64(n)) => Some(*n as f64),
        Some(ValueData::F32(n)) => Some(*n as f64),
        Some(ValueData::F64(n)) => Some(*n),
        _ => None,
    }
}

fn literal_eq(rt: &Runtime, literal: &Literal, value: ValueId) -> bool {
    match (literal, rt.heap.get(value).map(|v| &v.data)) {
        (Literal::I32(a), Some(ValueData::I32(b))) => a == b,
        (Literal::I64(a), Some(ValueData::I64(b))) => a == b,
        (Literal::U32(a), Some(ValueData::U32(b))) => a == b,
        (Literal::Str(a), Some(ValueData::Str(b))) => a == b,
        (Literal::Bool(a), Some(ValueData::Bool(b))) => a == b,
        (Literal::None, Some(ValueData::None)) => true,
        _ => false,
    }
}

fn index_into(rt: &mut Runtime, container: ValueId, index: ValueId) -> RunResult<ValueId> {
    match rt.heap.get(container).map(|v| v.data.clone()) {
        Some(ValueData::Array(_, items)) => {
            let i = as_f64(rt, index).ok_or_else(|| RuntimeError::new(Fault::MismatchedType, "array index must be numeric"))? as usize;
            items.get(i).copied().ok_or_else(|| RuntimeError::new(Fault::InvalidSubscript, "array index out of bounds"))
        }
        Some(ValueData::Map(_, _, pairs)) => pairs
            .iter()
            .find(|(k, _)| *k == index || key_eq(rt, *k, index))
            .map(|(_, v)| *v)
            .ok_or_else(|| RuntimeError::new(Fault::NotFound, "map key not found")),
        _ => Err(RuntimeError::new(Fault::MismatchedType, "value does not support indexing")),
    }
}

fn key_eq(rt: &Runtime, a: ValueId, b: ValueId) -> bool {
    match (rt.heap.get(a).map(|v| &v.data), rt.heap.get(b).map(|v| &v.data)) {
        (Some(ValueData::Str(x)), Some(ValueData::Str(y))) => x == y,
        _ => numeric_cmp(rt, a, b) == Some(std::cmp::Ordering::Equal),
    }
}

fn value_type(rt: &Runtime, id: ValueId) -> Type {
    match rt.heap.get(id).map(|v| &v.data) {
        Some(ValueData::I8(_)) => Type::simple(TypeTag::I8),
        Some(ValueData::I16(_)) => Type::simple(TypeTag::I16),
        Some(ValueData::I32(_)) => Type::simple(TypeTag::I32),
        Some(ValueData::I64(_)) => Type::simple(TypeTag::I64),
        Some(ValueData::U8(_)) => Type::simple(TypeTag::U8),
        Some(ValueData::U16(_)) => Type::simple(TypeTag::U16),
        Some(ValueData::U32(_)) => Type::simple(TypeTag::U32),
        Some(ValueData::U64(_)) => Type::simple(TypeTag::U64),
        Some(ValueData::F32(_)) => Type::simple(TypeTag::F32),
        Some(ValueData::F64(_)) => Type::simple(TypeTag::F64),
        Some(ValueData::Bool(_)) => Type::simple(TypeTag::Bool),
        Some(ValueData::Str(_)) => Type::simple(TypeTag::String),
        Some(ValueData::Object(o)) => Type::defining(TypeTag::Class, crate::types::TypeRef::Resolved(o.class)),
        _ => Type::any(),
    }
}

/// Allocates a fresh object of `class_id`, instantiating an independent
/// `Var` box for every instance field declared by the class or any ancestor
/// — methods are never copied; they stay shared through the class chain.
/// Drains the frame's `PUSHARG` accumulator and, if the class or an ancestor
/// declares a `new` method, calls it with `this` bound to the new object
/// before handing the object back to `NEW`'s destination.
fn new_object(rt: &mut Runtime, fiber: &mut Fiber, class_id: ValueId) -> RunResult<ValueId> {
    let mut members = crate::value::Scope::default();
    let mut cur = Some(class_id);
    while let Some(id) = cur {
        let Some(ValueData::Class(c)) = rt.heap.get(id).map(|v| v.data.clone()) else { break };
        for (&name, &member) in &c.scope {
            if members.contains_key(&name) {
                continue;
            }
            if let Some(ValueData::Var(v)) = rt.heap.get(member).map(|v| v.data.clone()) {
                if v.access.contains(AccessFlags::STATIC) {
                    continue;
                }
                let none = rt.heap.none();
                rt.heap.inc_ref(none);
                let slot = rt.heap.alloc(ValueData::Var(VarData { name, access: v.access, declared_type: v.declared_type, value: none }));
                members.insert(name, slot);
            }
        }
        cur = match c.parent {
            Some(crate::types::TypeRef::Resolved(p)) => Some(p),
            Some(r @ crate::types::TypeRef::Deferred(_)) => rt.heap.force_deferred_type(&r),
            None => None,
        };
    }
    for &slot in members.values() {
        rt.heap.inc_ref(slot);
    }
    rt.heap.inc_ref(class_id);
    let obj = rt.heap.alloc(ValueData::Object(ObjectData { class: class_id, members }));

    let args = std::mem::take(&mut fiber.current_frame_mut().expect("dispatch only runs with a current frame").next_arg_stack);
    for &a in &args {
        rt.heap.dec_host_ref(a);
    }
    let new_name = rt.interns.intern("new");
    if let Some((ctor, _)) = call::find_in_class_chain(rt, class_id, new_name) {
        call_sync(rt, ctor, obj, &args)?;
    }
    Ok(obj)
}
