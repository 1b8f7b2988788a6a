//! Whole-program scenarios driven entirely through the in-memory builder:
//! no SLX image is encoded or decoded here, only live values wired up the
//! way the loader would wire them, then run on a real [`Runtime`].
//!
//! Run with `cargo test --features test-support` — the builder this file
//! depends on only exists behind that feature.

use slake::builder::{reference, ClassBuilder, FnBuilder};
use slake::{
    AccessFlags, Literal, Opcode, Operand, RefEntry, Reference, RegId, Runtime, StringId, Type, TypeRef, TypeTag,
    ValueData, ValueId,
};

/// Builds a two-entry `this.<member>` reference, for a method body reading
/// one of its own instance fields.
fn this_member_ref(rt: &mut Runtime, member: &str) -> Reference {
    let this = rt.this_name();
    let name = rt.interns.intern(member);
    Reference::new(vec![RefEntry::simple(this), RefEntry::simple(name)])
}

/// Overwrites an object's field in place, the way a host embedder would
/// initialize state after `NEW` returns (there is no bytecode opcode that
/// stores through a named reference, only through a `Reg`/`Local`/`Arg`
/// slot — member writes are host or constructor-method business).
fn set_field(rt: &mut Runtime, obj: ValueId, name: StringId, value: ValueId) {
    let var_id = match &rt.heap.get(obj).expect("object is live").data {
        ValueData::Object(o) => *o.members.get(&name).expect("field exists on object"),
        other => panic!("expected an object, got {other:?}"),
    };
    let Some(v) = rt.heap.get_mut(var_id) else { panic!("field var is live") };
    let ValueData::Var(vd) = &mut v.data else { panic!("field slot is a Var") };
    let old = vd.value;
    vd.value = value;
    rt.heap.inc_ref(value);
    rt.heap.dec_ref(old);
}

fn as_i32(rt: &Runtime, id: ValueId) -> i32 {
    match &rt.heap.get(id).expect("value is live").data {
        ValueData::I32(n) => *n,
        other => panic!("expected i32, got {other:?}"),
    }
}

// =============================================================================
// Arithmetic
// =============================================================================

/// A plain function reading one argument through a deref'd `Arg` operand and
/// returning the result of an `ADD` against a literal.
#[test]
fn arithmetic_function_returns_computed_value() {
    let mut rt = Runtime::new();
    let root = rt.root();

    let func = FnBuilder::new("add_one")
        .param("x", Type::simple(TypeTag::I32))
        .returns(Type::simple(TypeTag::I32))
        .instr(
            Opcode::Add,
            vec![
                Operand::Reg { id: RegId::Tmp0, deref: false },
                Operand::Arg { index: 0, deref: true },
                Operand::Literal(Literal::I32(1)),
            ],
        )
        .instr(Opcode::Ret, vec![Operand::Reg { id: RegId::Tmp0, deref: false }])
        .install(&mut rt.heap, &mut rt.interns, root);

    let arg = rt.heap.alloc(ValueData::I32(41));
    let none = rt.heap.none();
    let result = rt.call(func, none, &[arg]).expect("add_one should not fault");
    assert_eq!(as_i32(&rt, result), 42);
}

// =============================================================================
// Object construction and method call
// =============================================================================

/// `NEW` allocates an object with independent field slots; `MCALL` resolves
/// a method through the receiver's class and runs it with `this` bound, and
/// a `LOAD` of `this.<field>` reads the field's value rather than its `Var`
/// box.
#[test]
fn method_call_reads_fields_through_this() {
    let mut rt = Runtime::new();
    let root = rt.root();

    let x_ref = this_member_ref(&mut rt, "x");
    let y_ref = this_member_ref(&mut rt, "y");
    let sum_ref = reference(&mut rt.interns, "sum");

    let sum_method = FnBuilder::new("sum")
        .returns(Type::simple(TypeTag::I32))
        .instr(Opcode::Load, vec![Operand::Reg { id: RegId::Tmp0, deref: false }, Operand::Reference(x_ref)])
        .instr(Opcode::Load, vec![Operand::Reg { id: RegId::Tmp1, deref: false }, Operand::Reference(y_ref)])
        .instr(
            Opcode::Add,
            vec![
                Operand::Reg { id: RegId::R0, deref: false },
                Operand::Reg { id: RegId::Tmp0, deref: false },
                Operand::Reg { id: RegId::Tmp1, deref: false },
            ],
        )
        .instr(Opcode::Ret, vec![Operand::Reg { id: RegId::R0, deref: false }]);

    let point_class = ClassBuilder::new("Point")
        .var("x", AccessFlags::PUBLIC, Type::simple(TypeTag::I32))
        .var("y", AccessFlags::PUBLIC, Type::simple(TypeTag::I32))
        .method(sum_method)
        .install(&mut rt.heap, &mut rt.interns, root);
    let point_type = Type::defining(TypeTag::Class, TypeRef::Resolved(point_class));

    let ctor = FnBuilder::new("make_point")
        .returns(point_type.clone())
        .instr(Opcode::New, vec![Operand::Reg { id: RegId::Tmp0, deref: false }, Operand::TypeName(point_type.clone())])
        .instr(Opcode::Ret, vec![Operand::Reg { id: RegId::Tmp0, deref: false }])
        .install(&mut rt.heap, &mut rt.interns, root);

    let driver = FnBuilder::new("call_sum")
        .param("obj", point_type)
        .returns(Type::simple(TypeTag::I32))
        .instr(
            Opcode::Mcall,
            vec![
                Operand::Reg { id: RegId::Tmp0, deref: false },
                Operand::Arg { index: 0, deref: true },
                Operand::Reference(sum_ref),
            ],
        )
        .instr(Opcode::Ret, vec![Operand::Reg { id: RegId::Tmp0, deref: false }])
        .install(&mut rt.heap, &mut rt.interns, root);

    let none = rt.heap.none();
    let obj = rt.call(ctor, none, &[]).expect("construction should not fault");

    let x_name = rt.interns.intern("x");
    let y_name = rt.interns.intern("y");
    let x_val = rt.heap.alloc(ValueData::I32(3));
    let y_val = rt.heap.alloc(ValueData::I32(4));
    set_field(&mut rt, obj, x_name, x_val);
    set_field(&mut rt, obj, y_name, y_val);

    let none = rt.heap.none();
    let result = rt.call(driver, none, &[obj]).expect("call_sum should not fault");
    assert_eq!(as_i32(&rt, result), 7);
}

// =============================================================================
// Exceptions
// =============================================================================

/// `THROW` inside a `PUSHXH`-guarded region unwinds to the registered
/// handler label rather than propagating out of the function, and
/// `LEXCEPT` recovers the thrown payload from the exception register.
#[test]
fn thrown_value_is_caught_by_its_handler() {
    let mut rt = Runtime::new();
    let root = rt.root();

    let mut fb = FnBuilder::new("risky").returns(Type::simple(TypeTag::I32));
    fb = fb.instr(Opcode::Enter, vec![]);
    let pushxh_offset = fb.next_offset();
    let handler_target = pushxh_offset + 2; // PUSHXH, THROW, then the handler starts
    fb = fb.instr(Opcode::Pushxh, vec![Operand::Label(handler_target)]);
    fb = fb.instr(Opcode::Throw, vec![Operand::Literal(Literal::I32(99))]);
    fb = fb.instr(Opcode::Lexcept, vec![Operand::Reg { id: RegId::Tmp0, deref: false }]);
    fb = fb.instr(Opcode::Leave, vec![]);
    fb = fb.instr(Opcode::Ret, vec![Operand::Reg { id: RegId::Tmp0, deref: false }]);
    let risky = fb.install(&mut rt.heap, &mut rt.interns, root);

    let none = rt.heap.none();
    let result = rt.call(risky, none, &[]).expect("the throw should be caught, not propagate");
    assert_eq!(as_i32(&rt, result), 99);
}

/// An uncaught throw (no `PUSHXH` in scope) surfaces as an `Err` carrying
/// the thrown payload, rather than panicking the host.
#[test]
fn uncaught_throw_surfaces_as_a_fault_with_payload() {
    let mut rt = Runtime::new();
    let root = rt.root();

    let risky =
        FnBuilder::new("risky").instr(Opcode::Throw, vec![Operand::Literal(Literal::I32(7))]).install(&mut rt.heap, &mut rt.interns, root);

    let none = rt.heap.none();
    let err = rt.call(risky, none, &[]).expect_err("nothing catches this throw");
    assert_eq!(err.fault, slake::Fault::UncaughtException);
    let payload = err.payload.expect("THROW always attaches its value as the payload");
    assert_eq!(as_i32(&rt, payload), 7);
}

// =============================================================================
// Coroutines
// =============================================================================

/// `spawn` starts a function as a suspended context; each `resume` advances
/// it to the next `YIELD` (or completion), without running the rest of the
/// body eagerly.
#[test]
fn coroutine_yields_then_completes() {
    let mut rt = Runtime::new();
    let root = rt.root();

    let counter = FnBuilder::new("counter")
        .instr(Opcode::Yield, vec![Operand::Literal(Literal::I32(1))])
        .instr(Opcode::Yield, vec![Operand::Literal(Literal::I32(2))])
        .instr(Opcode::Ret, vec![Operand::Literal(Literal::I32(3))])
        .install(&mut rt.heap, &mut rt.interns, root);

    let none = rt.heap.none();
    let ctx = rt.spawn(counter, none, &[]).expect("spawn should not fault");

    let first = rt.resume(ctx).expect("first resume");
    assert_eq!(as_i32(&rt, first), 1);
    assert!(!rt.is_done(ctx));

    let second = rt.resume(ctx).expect("second resume");
    assert_eq!(as_i32(&rt, second), 2);
    assert!(!rt.is_done(ctx));

    let third = rt.resume(ctx).expect("third resume");
    assert_eq!(as_i32(&rt, third), 3);
    assert!(rt.is_done(ctx));
    assert_eq!(rt.fiber_result(ctx), Some(third));
}

// =============================================================================
// Generic instantiation
// =============================================================================

/// Resolving the same generic template against the same argument list twice
/// returns the identical instantiation (the cache hits); a different
/// argument list produces a distinct instantiation.
#[test]
fn generic_instantiation_is_cached_by_argument_list() {
    use slake::GenericParam;

    let mut rt = Runtime::new();
    let root = rt.root();

    let t_name = rt.interns.intern("T");
    let box_template = ClassBuilder::new("Box")
        .generic_params(vec![GenericParam { name: t_name, qualifiers: Vec::new() }])
        .var("value", AccessFlags::PUBLIC, Type::generic_arg(0))
        .install(&mut rt.heap, &mut rt.interns, root);
    let box_name = rt.interns.intern("Box");

    let i32_ref = Reference::new(vec![RefEntry { name: box_name, generic_args: vec![Type::simple(TypeTag::I32)] }]);
    let inst_a = rt.resolve(&i32_ref).expect("Box<i32> resolves");
    let inst_a_again = rt.resolve(&i32_ref).expect("Box<i32> resolves again");
    assert_eq!(inst_a, inst_a_again, "same template + same args must hit the cache");
    assert_ne!(inst_a, box_template, "an instantiation is never the template itself");

    let bool_ref = Reference::new(vec![RefEntry { name: box_name, generic_args: vec![Type::simple(TypeTag::Bool)] }]);
    let inst_b = rt.resolve(&bool_ref).expect("Box<bool> resolves");
    assert_ne!(inst_a, inst_b, "different argument lists must not share an instantiation");
}

// =============================================================================
// Cycle collection
// =============================================================================

/// Two objects holding a reference cycle through their own fields have
/// nonzero refcounts forever (each keeps the other's count above zero), so
/// only the tracing sweep — not ordinary refcounting — can reclaim them once
/// neither is reachable from any root.
#[test]
fn mutual_reference_cycle_is_reclaimed_by_sweep() {
    use slake::{ObjectData, Scope, VarData};

    let mut rt = Runtime::new();
    let root = rt.root();

    let node_class = ClassBuilder::new("Node").install(&mut rt.heap, &mut rt.interns, root);
    let partner_name = rt.interns.intern("partner");

    let obj_a = rt.heap.alloc(ValueData::Object(ObjectData { class: node_class, members: Scope::default() }));
    let obj_b = rt.heap.alloc(ValueData::Object(ObjectData { class: node_class, members: Scope::default() }));
    rt.heap.inc_ref(node_class);
    rt.heap.inc_ref(node_class);

    let var_a = rt.heap.alloc(ValueData::Var(VarData {
        name: partner_name,
        access: AccessFlags::PUBLIC,
        declared_type: Type::any(),
        value: obj_b,
    }));
    rt.heap.inc_ref(obj_b);
    let var_b = rt.heap.alloc(ValueData::Var(VarData {
        name: partner_name,
        access: AccessFlags::PUBLIC,
        declared_type: Type::any(),
        value: obj_a,
    }));
    rt.heap.inc_ref(obj_a);

    if let Some(v) = rt.heap.get_mut(obj_a) {
        if let ValueData::Object(o) = &mut v.data {
            o.members.insert(partner_name, var_a);
        }
    }
    rt.heap.inc_ref(var_a);
    if let Some(v) = rt.heap.get_mut(obj_b) {
        if let ValueData::Object(o) = &mut v.data {
            o.members.insert(partner_name, var_b);
        }
    }
    rt.heap.inc_ref(var_b);

    let before = rt.heap_stats();
    rt.collect_garbage();
    let after = rt.heap_stats();

    assert!(rt.heap.get(obj_a).is_none(), "obj_a's mutual edge from obj_b kept its refcount above zero forever");
    assert!(rt.heap.get(obj_b).is_none(), "obj_b's mutual edge from obj_a kept its refcount above zero forever");
    assert!(rt.heap.get(var_a).is_none());
    assert!(rt.heap.get(var_b).is_none());
    assert!(after.live_objects < before.live_objects);
}
