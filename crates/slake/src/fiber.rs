//! The fiber value: a first-class suspended computation.
//!
//! `Fiber` only holds data — the call stack, the register bank, the done
//! flag and result slot. Scheduling behavior (`resume`, the dispatch loop
//! that advances it) lives in [`crate::vm`], which is the only thing that
//! needs to borrow a [`crate::host::Runtime`] while doing so.

use std::rc::Rc;

use smallvec::SmallVec;

use crate::bytecode::{Operand, RegId};
use crate::error::Fault;
use crate::value::{FnBody, ValueId};

/// A try/except scope nested within a major frame.
#[derive(Debug, Clone, Default)]
pub struct MinorFrame {
    /// Handler entry points registered by `PUSHXH`, most recent last.
    pub handlers: Vec<u32>,
    /// Instruction offset to resume at after this frame finishes unwinding,
    /// run whether or not an exception is in flight.
    pub unwind_exit: Option<u32>,
    /// Operand-stack depth when this minor frame was entered, restored on
    /// `LEAVE` and on unwind.
    pub data_stack_base: usize,
}

/// A function-call activation.
#[derive(Debug, Clone)]
pub struct MajorFrame {
    /// The function being executed.
    pub function: ValueId,
    /// Its decoded body, kept alongside the frame so the dispatch loop
    /// doesn't need to re-borrow the heap for every instruction fetch.
    pub body: Rc<FnBody>,
    /// The scope the function was resolved in — used by `LOAD` when no
    /// reference-local starting scope is given.
    pub enclosing_scope: Option<ValueId>,
    pub ip: usize,
    pub operand_stack: Vec<ValueId>,
    pub locals: Vec<ValueId>,
    pub args: Vec<ValueId>,
    /// Arguments accumulated by `PUSHARG`, consumed by the next `CALL`.
    pub next_arg_stack: Vec<ValueId>,
    pub this_value: ValueId,
    pub return_slot: ValueId,
    pub minor_frames: Vec<MinorFrame>,
    /// The exception currently being propagated through this frame's minor
    /// frames, if any (backs `LEXCEPT`/`RXCPT`).
    pub in_flight_exception: Option<ValueId>,
    /// Where the caller's `CALL`/`MCALL` wants this frame's return value
    /// written, besides the `RR` register. `None` for the fiber's entry
    /// frame, which has no caller frame to write back into.
    pub return_into: Option<Operand>,
}

impl MajorFrame {
    #[must_use]
    pub fn new(function: ValueId, enclosing_scope: Option<ValueId>, this_value: ValueId, none: ValueId) -> Self {
        Self {
            function,
            body: Rc::new(FnBody::default()),
            enclosing_scope,
            ip: 0,
            operand_stack: Vec::new(),
            locals: Vec::new(),
            args: Vec::new(),
            next_arg_stack: Vec::new(),
            this_value,
            return_slot: none,
            minor_frames: Vec::new(),
            in_flight_exception: None,
            return_into: None,
        }
    }
}

/// Fixed-size register bank; never grows.
#[derive(Debug, Clone)]
pub struct RegisterBank([ValueId; RegId::COUNT]);

impl RegisterBank {
    #[must_use]
    pub fn new(none: ValueId) -> Self {
        Self([none; RegId::COUNT])
    }

    #[must_use]
    pub fn get(&self, id: RegId) -> ValueId {
        self.0[id.index()]
    }

    pub fn set(&mut self, id: RegId, value: ValueId) {
        self.0[id.index()] = value;
    }

    pub fn iter(&self) -> impl Iterator<Item = ValueId> + '_ {
        self.0.iter().copied()
    }
}

/// Terminal state of a fiber that ended other than by a normal `RET`.
#[derive(Debug, Clone, Copy)]
pub struct FiberFailure {
    pub fault: Fault,
}

/// A suspended computation.
///
/// `resume` semantics live in [`crate::vm::resume`]; this struct is the data
/// a fiber carries between suspension points (`YIELD`, a dependency
/// `AWAIT`, or completion).
#[derive(Debug, Clone)]
pub struct Fiber {
    pub frames: SmallVec<[MajorFrame; 4]>,
    pub registers: RegisterBank,
    pub done: bool,
    pub result: ValueId,
    pub failure: Option<FiberFailure>,
    /// Set by the host or by `ABORT`; checked once per dispatch cycle.
    pub abort_requested: bool,
}

impl Fiber {
    #[must_use]
    pub fn new(entry: MajorFrame, none: ValueId) -> Self {
        Self {
            frames: smallvec::smallvec![entry],
            registers: RegisterBank::new(none),
            done: false,
            result: none,
            failure: None,
            abort_requested: false,
        }
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done
    }

    #[must_use]
    pub fn current_frame(&self) -> Option<&MajorFrame> {
        self.frames.last()
    }

    pub fn current_frame_mut(&mut self) -> Option<&mut MajorFrame> {
        self.frames.last_mut()
    }

    /// Every value reachable from this fiber's stacks and registers, for
    /// the tracing sweep's roots and for cross-fiber quiescence.
    #[must_use]
    pub fn gc_roots(&self) -> Vec<ValueId> {
        let mut out: Vec<ValueId> = self.registers.iter().collect();
        out.push(self.result);
        for frame in &self.frames {
            out.push(frame.function);
            if let Some(s) = frame.enclosing_scope {
                out.push(s);
            }
            out.push(frame.this_value);
            out.push(frame.return_slot);
            out.extend(frame.operand_stack.iter().copied());
            out.extend(frame.locals.iter().copied());
            out.extend(frame.args.iter().copied());
            out.extend(frame.next_arg_stack.iter().copied());
            out.extend(frame.in_flight_exception);
        }
        out
    }
}
