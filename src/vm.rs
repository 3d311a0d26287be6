/// Virtual Machine — Flat Dispatch Loop
///
/// One contiguous operand stack and an explicit frame vector per context;
/// scripted calls push frames inside the loop instead of recursing through
/// Rust, so call depth is bounded by `VM_STACK_LIMIT`, not the native stack.
/// Native handlers and built-in routines re-enter through `call_function`,
/// which nests a fresh dispatch entry.
///
/// The exception state machine: any handler that fails produces a thrown
/// value; the unwinder walks try records of each frame (innermost first),
/// truncating the operand stack and environment chain to the record's entry
/// depth. Aborts skip every handler. Finally blocks run with a pending
/// completion (normal / throw / return) resolved by `FinallyEnd`.
///
/// Generators and async functions execute as coroutine frames: `yield` and
/// `await` copy the live frame into a heap snapshot; resumption copies it
/// back and continues at the saved instruction pointer.
use crate::builtins::{self, BuiltinId};
use crate::bytecode::{ByteCode, ExtOp, Op, IP_NONE};
use crate::config::VM_EXEC_STOP_INTERVAL;
use crate::context::Context;
use crate::env::{self, EnvKind};
use crate::errors::ErrorKind;
use crate::heap::{self, CellData, Idx, OptIdx};
use crate::module;
use crate::object::{self, CoroutineKind, ObjectExtra, PropName, PropValue};
use crate::strings::{self, Magic};
use crate::value::{HeapKind, Value};
use std::rc::Rc;

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Completion {
    Normal,
    Throw(Value),
    Return(Value),
}

pub struct Frame {
    pub bytecode: Rc<ByteCode>,
    pub bc_idx: Idx,
    pub ip: usize,
    /// First operand slot of this frame in the shared VM stack.
    pub stack_base: usize,
    pub env: OptIdx,
    pub env_depth: u16,
    pub this_value: Value,
    /// Completion value of script/module bodies (`SetCompletion`).
    pub completion_value: Value,
    /// Pending completion while a finally block runs.
    pub pending: Completion,
    pub module_record: Option<u32>,
    /// Set when this frame executes a coroutine body.
    pub coroutine: OptIdx,
    /// Function object for backtraces; undefined for scripts.
    pub function: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoroutineState {
    SuspendedStart,
    Suspended,
    Running,
    Done,
}

/// Heap snapshot of a suspended generator/async frame.
#[derive(Debug)]
pub struct CoroutineCell {
    pub bytecode: Idx,
    pub ip: usize,
    pub stack: Vec<Value>,
    pub env: OptIdx,
    pub env_depth: u16,
    pub this_value: Value,
    pub function: Value,
    pub state: CoroutineState,
}

impl CoroutineCell {
    pub fn booked_extra(&self) -> usize {
        self.stack.capacity() * std::mem::size_of::<Value>()
    }
}

// ---------------------------------------------------------------------------
// VM state
// ---------------------------------------------------------------------------

pub type HaltCallback = dyn Fn(&mut Context) -> Value;
pub type ThrowCallback = dyn Fn(&mut Context, Value);

pub struct VmState {
    pub stack: Vec<Value>,
    pub frames: Vec<Frame>,
    pub stack_limit: usize,
    pub halt_cb: Option<Rc<HaltCallback>>,
    pub halt_interval: u32,
    halt_counter: u32,
    pub throw_cb: Option<Rc<ThrowCallback>>,
    /// Last value the throw callback fired for; re-throws do not re-trigger.
    pub last_hook_value: Value,
    /// Whether the throw callback has observed the current in-flight
    /// exception (queried by the embedder).
    pub exception_captured: bool,
    pub abort_in_flight: bool,
}

impl VmState {
    pub fn new(stack_limit: usize) -> VmState {
        VmState {
            stack: Vec::new(),
            frames: Vec::new(),
            stack_limit,
            halt_cb: None,
            halt_interval: VM_EXEC_STOP_INTERVAL,
            halt_counter: 0,
            throw_cb: None,
            last_hook_value: Value::EMPTY,
            exception_captured: false,
            abort_in_flight: false,
        }
    }

    pub fn collect_roots(&self, out: &mut Vec<Idx>) {
        fn push(out: &mut Vec<Idx>, v: Value) {
            if v.is_heap() {
                out.push(Idx(v.heap_cp()));
            } else if v.is_exception() {
                out.push(Idx(v.error_cp()));
            }
        }
        for v in &self.stack {
            push(out, *v);
        }
        push(out, self.last_hook_value);
        for f in &self.frames {
            out.push(f.bc_idx);
            if let Some(e) = f.env.get() {
                out.push(e);
            }
            push(out, f.this_value);
            push(out, f.completion_value);
            push(out, f.function);
            if let Some(c) = f.coroutine.get() {
                out.push(c);
            }
            match f.pending {
                Completion::Throw(v) | Completion::Return(v) => push(out, v),
                Completion::Normal => {}
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Frame setup
// ---------------------------------------------------------------------------

fn stack_overflow(ctx: &mut Context) -> Value {
    builtins::make_error(ctx, ErrorKind::RangeError, "maximum call stack size exceeded")
}

/// Create the environment for invoking `bc` and bind parameters, hoisted
/// vars and hoisted function declarations.
fn make_call_env(
    ctx: &mut Context,
    bc: &Rc<ByteCode>,
    parent: OptIdx,
    args: &[Value],
) -> Result<Idx, Value> {
    let env = env::alloc_declarative(ctx, parent);
    // Bind while the env is temp-rooted: closures for hoisted declarations
    // may allocate.
    let mark = ctx.roots_mark();
    ctx.root(env.value(HeapKind::Object)); // rooted by index via temp root
    for (i, name) in bc.arg_names.iter().enumerate() {
        env::declare(ctx, env, *name, true, true);
        let (e, pos) = env::resolve(ctx, env.some(), *name).expect("fresh binding");
        env::write_binding(ctx, e, pos, args.get(i).copied().unwrap_or(Value::UNDEFINED));
    }
    for name in bc.var_names.iter() {
        if !env::has_own_binding(ctx, env, *name) {
            env::declare(ctx, env, *name, true, true);
        }
    }
    for (name, lit) in bc.func_decls.iter() {
        let template = bc.literals[*lit as usize];
        let func = object::alloc_function(
            ctx,
            Idx(template.heap_cp()),
            env.some(),
            Value::UNDEFINED,
        );
        if !env::has_own_binding(ctx, env, *name) {
            env::declare(ctx, env, *name, true, true);
        }
        let (e, pos) = env::resolve(ctx, env.some(), *name).expect("fresh binding");
        env::write_binding(ctx, e, pos, func);
    }
    ctx.roots_release(mark);
    Ok(env)
}

/// Script/module prologue: vars and function declarations land on the
/// global object (scripts) or the module environment (modules).
fn make_program_env(
    ctx: &mut Context,
    bc: &Rc<ByteCode>,
    module_record: Option<u32>,
) -> Result<Idx, Value> {
    let global_env = ctx.realm.global_env.get().expect("realm initialized");
    let env = env::alloc_declarative(ctx, global_env.some());
    if bc.is_module() {
        for name in bc.var_names.iter() {
            env::declare(ctx, env, *name, true, true);
        }
        for (name, lit) in bc.func_decls.iter() {
            let template = bc.literals[*lit as usize];
            let func =
                object::alloc_function(ctx, Idx(template.heap_cp()), env.some(), Value::UNDEFINED);
            env::declare(ctx, env, *name, true, true);
            let (e, pos) = env::resolve(ctx, env.some(), *name).expect("fresh binding");
            env::write_binding(ctx, e, pos, func);
        }
        if let Some(record) = module_record {
            module::set_module_env(ctx, record, env);
        }
    } else {
        let global = ctx.realm.global_object.get().expect("realm initialized");
        for name in bc.var_names.iter() {
            let bytes = strings::bytes_of(ctx, *name);
            let pname = object::prop_name_from_bytes(ctx, &bytes);
            if object::own_slot(ctx, global, pname).is_none() {
                object::add_own(
                    ctx,
                    global,
                    pname,
                    object::PROP_WRITABLE | object::PROP_ENUMERABLE,
                    PropValue::Data(Value::UNDEFINED),
                );
            }
        }
        for (name, lit) in bc.func_decls.iter() {
            let template = bc.literals[*lit as usize];
            let func =
                object::alloc_function(ctx, Idx(template.heap_cp()), env.some(), Value::UNDEFINED);
            let bytes = strings::bytes_of(ctx, *name);
            let pname = object::prop_name_from_bytes(ctx, &bytes);
            match object::find_own(ctx, global, pname) {
                Some((pair, slot)) => object::write_slot_value(ctx, pair, slot, func),
                None => object::add_own(
                    ctx,
                    global,
                    pname,
                    object::PROP_WRITABLE | object::PROP_ENUMERABLE,
                    PropValue::Data(func),
                ),
            }
        }
    }
    Ok(env)
}

fn push_frame(ctx: &mut Context, frame: Frame) -> Result<(), Value> {
    let projected = ctx.vm.stack.len() + frame.bytecode.stack_limit as usize;
    if ctx.vm.frames.len() >= 1024 || projected >= ctx.vm.stack_limit {
        return Err(stack_overflow(ctx));
    }
    ctx.vm.frames.push(frame);
    Ok(())
}

// ---------------------------------------------------------------------------
// Public entry points
// ---------------------------------------------------------------------------

/// Run a compiled script or module body.
pub fn run_program(
    ctx: &mut Context,
    bc_idx: Idx,
    this_value: Value,
    module_record: Option<u32>,
) -> Result<Value, Value> {
    let bc = ctx.heap.bytecode(bc_idx);
    // The bytecode cell may have no other owner yet (fresh parse).
    let mark = ctx.roots_mark();
    ctx.root(bc_idx.value(HeapKind::ByteCode));
    let env = match make_program_env(ctx, &bc, module_record) {
        Ok(e) => e,
        Err(err) => {
            ctx.roots_release(mark);
            return Err(err);
        }
    };
    let frame = Frame {
        bytecode: bc,
        bc_idx,
        ip: 0,
        stack_base: ctx.vm.stack.len(),
        env: env.some(),
        env_depth: 0,
        this_value,
        completion_value: Value::UNDEFINED,
        pending: Completion::Normal,
        module_record,
        coroutine: OptIdx::NONE,
        function: Value::UNDEFINED,
    };
    let pushed = push_frame(ctx, frame);
    ctx.roots_release(mark);
    pushed?;
    execute(ctx, None)
}

/// Invoke any callable value.
pub fn call_function(
    ctx: &mut Context,
    func: Value,
    this_value: Value,
    args: &[Value],
) -> Result<Value, Value> {
    if !object::is_callable(ctx, func) {
        return Err(builtins::make_error(
            ctx,
            ErrorKind::TypeError,
            "value is not callable",
        ));
    }
    let obj = Idx(func.heap_cp());
    // Copy out dispatch info to end the heap borrow.
    enum Target {
        Scripted { bytecode: Idx, env: OptIdx, arrow_this: Value },
        Native(u32),
        Routine(BuiltinId, u16),
        Bound { target: Value, this_value: Value, args_head: Vec<Value> },
    }
    let target = match &ctx.heap.object(obj).extra {
        ObjectExtra::Function {
            bytecode,
            env,
            arrow_this,
        } => Target::Scripted {
            bytecode: *bytecode,
            env: *env,
            arrow_this: *arrow_this,
        },
        ObjectExtra::Native { handler } => Target::Native(*handler),
        ObjectExtra::Routine { builtin, routine } => Target::Routine(*builtin, *routine),
        ObjectExtra::Bound {
            target,
            this_value,
            args,
        } => Target::Bound {
            target: *target,
            this_value: *this_value,
            args_head: args.to_vec(),
        },
        _ => unreachable!("checked callable above"),
    };

    match target {
        Target::Scripted {
            bytecode,
            env,
            arrow_this,
        } => {
            let bc = ctx.heap.bytecode(bytecode);
            if bc.is_generator() {
                return make_generator_object(ctx, func, this_value, args, CoroutineKind::Generator);
            }
            if bc.is_async() {
                return crate::jobs::async_function_call(ctx, func, this_value, args);
            }
            let effective_this = if bc.flags & crate::bytecode::BC_ARROW != 0 {
                arrow_this
            } else {
                this_value
            };
            // Arguments live only in the caller's slice here; keep them
            // rooted while the environment is built.
            let mark = ctx.roots_mark();
            ctx.root(func);
            ctx.root(effective_this);
            for a in args {
                ctx.root(*a);
            }
            let call_env = make_call_env(ctx, &bc, env, args);
            ctx.roots_release(mark);
            let call_env = call_env?;
            let frame = Frame {
                bytecode: bc,
                bc_idx: bytecode,
                ip: 0,
                stack_base: ctx.vm.stack.len(),
                env: call_env.some(),
                env_depth: 0,
                this_value: effective_this,
                completion_value: Value::UNDEFINED,
                pending: Completion::Normal,
                module_record: None,
                coroutine: OptIdx::NONE,
                function: func,
            };
            push_frame(ctx, frame)?;
            execute(ctx, None)
        }
        Target::Native(handler_idx) => {
            let handler = Rc::clone(&ctx.native_fns[handler_idx as usize]);
            let mark = ctx.roots_mark();
            ctx.root(this_value);
            for a in args {
                ctx.root(*a);
            }
            let result = handler(ctx, this_value, args);
            ctx.roots_release(mark);
            // Handlers may report failure either as Err(thrown) or as an
            // error-marked value (the throw_sz convention); normalize.
            match result {
                Ok(v) if v.is_exception() => {
                    let cell = Idx(v.error_cp());
                    let inner = ctx.heap.error_ref(cell).value;
                    if ctx.heap.error_ref(cell).abort {
                        ctx.vm.abort_in_flight = true;
                    }
                    ctx.heap.ref_dec(cell);
                    Err(inner)
                }
                other => other,
            }
        }
        Target::Routine(builtin, routine) => {
            let mark = ctx.roots_mark();
            ctx.root(this_value);
            for a in args {
                ctx.root(*a);
            }
            let result = builtins::dispatch_routine(ctx, builtin, routine, func, this_value, args, false);
            ctx.roots_release(mark);
            result
        }
        Target::Bound {
            target,
            this_value: bound_this,
            mut args_head,
        } => {
            args_head.extend_from_slice(args);
            call_function(ctx, target, bound_this, &args_head)
        }
    }
}

/// `new` on any constructor value.
pub fn construct(ctx: &mut Context, ctor: Value, args: &[Value]) -> Result<Value, Value> {
    if !object::is_callable(ctx, ctor) {
        return Err(builtins::make_error(
            ctx,
            ErrorKind::TypeError,
            "value is not a constructor",
        ));
    }
    let obj = Idx(ctor.heap_cp());
    match &ctx.heap.object(obj).extra {
        ObjectExtra::Routine { builtin, routine } => {
            let (b, r) = (*builtin, *routine);
            let mark = ctx.roots_mark();
            for a in args {
                ctx.root(*a);
            }
            let result = builtins::dispatch_routine(ctx, b, r, ctor, Value::UNDEFINED, args, true);
            ctx.roots_release(mark);
            result
        }
        ObjectExtra::Function { bytecode, .. } => {
            let bc = ctx.heap.bytecode(*bytecode);
            if bc.is_generator() || bc.is_async() || bc.flags & crate::bytecode::BC_ARROW != 0 {
                return Err(builtins::make_error(
                    ctx,
                    ErrorKind::TypeError,
                    "value is not a constructor",
                ));
            }
            // prototype of the new instance comes from ctor.prototype
            let proto_prop =
                builtins::op_get_property_name(ctx, ctor, PropName::Magic(Magic::Prototype as u16))?;
            let proto = if proto_prop.is_object_ref() {
                Idx(proto_prop.heap_cp()).some()
            } else {
                ctx.realm.object_prototype
            };
            let instance = object::alloc_object_value(ctx, proto, ObjectExtra::None);
            let mark = ctx.roots_mark();
            ctx.root(instance);
            let result = call_function(ctx, ctor, instance, args);
            ctx.roots_release(mark);
            let result = result?;
            Ok(if result.is_object_ref() { result } else { instance })
        }
        ObjectExtra::Bound { target, args: head, .. } => {
            let target = *target;
            let mut all = head.to_vec();
            all.extend_from_slice(args);
            construct(ctx, target, &all)
        }
        _ => Err(builtins::make_error(
            ctx,
            ErrorKind::TypeError,
            "value is not a constructor",
        )),
    }
}

// ---------------------------------------------------------------------------
// Coroutines
// ---------------------------------------------------------------------------

/// Calling a generator function: build the suspended-at-start coroutine and
/// its generator object without running the body.
pub fn make_generator_object(
    ctx: &mut Context,
    func: Value,
    this_value: Value,
    args: &[Value],
    kind: CoroutineKind,
) -> Result<Value, Value> {
    let (bytecode, env) = match &ctx.heap.object(Idx(func.heap_cp())).extra {
        ObjectExtra::Function { bytecode, env, .. } => (*bytecode, *env),
        _ => unreachable!("generator target is scripted"),
    };
    let bc = ctx.heap.bytecode(bytecode);
    let mark = ctx.roots_mark();
    ctx.root(func);
    ctx.root(this_value);
    for a in args {
        ctx.root(*a);
    }
    let call_env = match make_call_env(ctx, &bc, env, args) {
        Ok(e) => e,
        Err(err) => {
            ctx.roots_release(mark);
            return Err(err);
        }
    };
    ctx.root(call_env.value(HeapKind::Object)); // keep the env across the next allocation
    let coroutine = heap::alloc(
        ctx,
        CellData::Coroutine(Box::new(CoroutineCell {
            bytecode,
            ip: 0,
            stack: Vec::new(),
            env: call_env.some(),
            env_depth: 0,
            this_value,
            function: func,
            state: CoroutineState::SuspendedStart,
        })),
    );
    ctx.root(coroutine.value(HeapKind::Object));
    let proto = if kind == CoroutineKind::Generator {
        ctx.realm.generator_prototype
    } else {
        ctx.realm.object_prototype
    };
    let gen = object::alloc_object_value(
        ctx,
        proto,
        ObjectExtra::Generator {
            coroutine: coroutine.some(),
            kind,
            done: false,
            promise: Value::UNDEFINED,
        },
    );
    ctx.roots_release(mark);
    Ok(gen)
}

pub enum ResumeOutcome {
    /// `yield`/`await` suspended the coroutine with this value.
    Yielded(Value),
    /// The body returned.
    Done(Value),
    /// The body threw.
    Thrown(Value),
}

/// Swap a coroutine snapshot back onto the VM stack and continue it.
pub fn resume_coroutine(
    ctx: &mut Context,
    gen_obj: Value,
    input: Value,
    is_throw: bool,
) -> ResumeOutcome {
    let gen_idx = Idx(gen_obj.heap_cp());
    let coroutine = match &ctx.heap.object(gen_idx).extra {
        ObjectExtra::Generator { coroutine, .. } => match coroutine.get() {
            Some(c) => c,
            None => return ResumeOutcome::Done(Value::UNDEFINED),
        },
        _ => {
            let e = builtins::make_error(ctx, ErrorKind::TypeError, "not a generator");
            return ResumeOutcome::Thrown(e);
        }
    };

    let (state, bytecode) = {
        let c = ctx.heap.coroutine(coroutine);
        (c.state, c.bytecode)
    };
    match state {
        CoroutineState::Running => {
            let e = builtins::make_error(ctx, ErrorKind::TypeError, "generator is already running");
            return ResumeOutcome::Thrown(e);
        }
        CoroutineState::Done => {
            return if is_throw {
                ResumeOutcome::Thrown(input)
            } else {
                ResumeOutcome::Done(Value::UNDEFINED)
            };
        }
        CoroutineState::SuspendedStart | CoroutineState::Suspended => {}
    }

    let bc = ctx.heap.bytecode(bytecode);
    let stack_base = ctx.vm.stack.len();
    let (ip, env, env_depth, this_value, function, saved_stack) = {
        let c = ctx.heap.coroutine_mut(coroutine);
        c.state = CoroutineState::Running;
        (
            c.ip,
            c.env,
            c.env_depth,
            c.this_value,
            c.function,
            std::mem::take(&mut c.stack),
        )
    };
    ctx.vm.stack.extend(saved_stack);
    if state == CoroutineState::Suspended && !is_throw {
        // The value yield/await evaluates to on resumption.
        ctx.vm.stack.push(input);
    }
    let frame = Frame {
        bytecode: bc,
        bc_idx: bytecode,
        ip,
        stack_base,
        env,
        env_depth,
        this_value,
        completion_value: Value::UNDEFINED,
        pending: Completion::Normal,
        module_record: None,
        coroutine: coroutine.some(),
        function,
    };
    if let Err(e) = push_frame(ctx, frame) {
        ctx.heap.coroutine_mut(coroutine).state = CoroutineState::Done;
        return ResumeOutcome::Thrown(e);
    }
    let initial_throw = if is_throw { Some(input) } else { None };
    let result = execute(ctx, initial_throw);

    let end_state = ctx.heap.coroutine(coroutine).state;
    match result {
        Ok(v) => {
            if end_state == CoroutineState::Suspended {
                ResumeOutcome::Yielded(v)
            } else {
                set_generator_done(ctx, gen_idx);
                ResumeOutcome::Done(v)
            }
        }
        Err(e) => {
            ctx.heap.coroutine_mut(coroutine).state = CoroutineState::Done;
            set_generator_done(ctx, gen_idx);
            ResumeOutcome::Thrown(e)
        }
    }
}

fn set_generator_done(ctx: &mut Context, gen_idx: Idx) {
    if let ObjectExtra::Generator { done, .. } = &mut ctx.heap.object_mut(gen_idx).extra {
        *done = true;
    }
}

// ---------------------------------------------------------------------------
// The dispatch loop
// ---------------------------------------------------------------------------

fn execute(ctx: &mut Context, initial_throw: Option<Value>) -> Result<Value, Value> {
    let entry_depth = ctx.vm.frames.len();
    debug_assert!(entry_depth > 0);

    if let Some(v) = initial_throw {
        match unwind(ctx, v, entry_depth) {
            Ok(()) => {}
            Err(e) => return Err(e),
        }
    }

    loop {
        let step = dispatch_one(ctx, entry_depth);
        match step {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {}
            Err(thrown) => {
                fire_throw_hook(ctx, thrown);
                match unwind(ctx, thrown, entry_depth) {
                    Ok(()) => {}
                    Err(e) => return Err(e),
                }
            }
        }
    }
}

fn fire_throw_hook(ctx: &mut Context, thrown: Value) {
    if ctx.vm.abort_in_flight {
        return;
    }
    if ctx.vm.last_hook_value == thrown {
        return;
    }
    ctx.vm.last_hook_value = thrown;
    if let Some(cb) = ctx.vm.throw_cb.clone() {
        ctx.vm.exception_captured = true;
        cb(ctx, thrown);
    }
}

/// Walk frames from the innermost looking for a handler; pops frames that
/// have none. `Err` means the exception leaves this dispatch entry.
fn unwind(ctx: &mut Context, thrown: Value, entry_depth: usize) -> Result<(), Value> {
    loop {
        if ctx.vm.frames.len() < entry_depth {
            return Err(thrown);
        }
        let (handler, stack_base) = {
            let frame = ctx.vm.frames.last().expect("unwind with no frame");
            let h = if ctx.vm.abort_in_flight {
                None
            } else {
                frame.bytecode.handler_for(frame.ip as u32).copied()
            };
            (h, frame.stack_base)
        };
        if let Some(rec) = handler {
            // Reset the operand stack and environment chain to the record.
            let frame = ctx.vm.frames.last_mut().expect("frame");
            let target_len = stack_base + rec.depth as usize;
            let mut env = frame.env;
            let mut env_depth = frame.env_depth;
            while env_depth > rec.env_depth {
                if let Some(e) = env.get() {
                    env = ctx.heap.env(e).parent;
                }
                env_depth -= 1;
            }
            let frame = ctx.vm.frames.last_mut().expect("frame");
            frame.env = env;
            frame.env_depth = env_depth;
            ctx.vm.stack.truncate(target_len.max(stack_base));
            if rec.catch_ip != IP_NONE {
                ctx.vm.stack.push(thrown);
                let frame = ctx.vm.frames.last_mut().expect("frame");
                frame.ip = rec.catch_ip as usize;
                frame.pending = Completion::Normal;
            } else {
                let frame = ctx.vm.frames.last_mut().expect("frame");
                frame.pending = Completion::Throw(thrown);
                frame.ip = rec.finally_ip as usize;
            }
            return Ok(());
        }
        // No handler here: drop the frame.
        let frame = ctx.vm.frames.pop().expect("frame");
        ctx.vm.stack.truncate(frame.stack_base);
        if let Some(coroutine) = frame.coroutine.get() {
            ctx.heap.coroutine_mut(coroutine).state = CoroutineState::Done;
        }
        if ctx.vm.frames.len() < entry_depth {
            return Err(thrown);
        }
    }
}

/// Return from the current frame, honoring enclosing finally blocks.
/// `Ok(Some(v))` ends this dispatch entry.
fn perform_return(
    ctx: &mut Context,
    value: Value,
    entry_depth: usize,
) -> Result<Option<Value>, Value> {
    let (record, stack_base) = {
        let frame = ctx.vm.frames.last().expect("frame");
        let rec = frame
            .bytecode
            .try_records
            .iter()
            .filter(|r| {
                r.finally_ip != IP_NONE
                    && r.start <= frame.ip as u32
                    && (frame.ip as u32) < r.end
            })
            .max_by_key(|r| r.start)
            .copied();
        (rec, frame.stack_base)
    };
    if let Some(rec) = record {
        let frame = ctx.vm.frames.last_mut().expect("frame");
        let mut env = frame.env;
        let mut env_depth = frame.env_depth;
        while env_depth > rec.env_depth {
            if let Some(e) = env.get() {
                env = ctx.heap.env(e).parent;
            }
            env_depth -= 1;
        }
        let frame = ctx.vm.frames.last_mut().expect("frame");
        frame.env = env;
        frame.env_depth = env_depth;
        frame.pending = Completion::Return(value);
        frame.ip = rec.finally_ip as usize;
        ctx.vm.stack.truncate(stack_base + rec.depth as usize);
        return Ok(None);
    }

    // Actually pop the frame.
    let frame = ctx.vm.frames.pop().expect("frame");
    ctx.vm.stack.truncate(frame.stack_base);
    if let Some(coroutine) = frame.coroutine.get() {
        ctx.heap.coroutine_mut(coroutine).state = CoroutineState::Done;
    }
    if ctx.vm.frames.len() < entry_depth {
        return Ok(Some(value));
    }
    ctx.vm.stack.push(value);
    Ok(None)
}

/// Suspend the current (coroutine) frame with a yielded value.
fn perform_suspend(
    ctx: &mut Context,
    yielded: Value,
    entry_depth: usize,
) -> Result<Option<Value>, Value> {
    let frame = ctx.vm.frames.pop().expect("frame");
    let Some(coroutine) = frame.coroutine.get() else {
        ctx.vm.stack.truncate(frame.stack_base);
        return Err(builtins::make_error(
            ctx,
            ErrorKind::TypeError,
            "yield outside of a generator frame",
        ));
    };
    let saved: Vec<Value> = ctx.vm.stack.split_off(frame.stack_base);
    {
        let c = ctx.heap.coroutine_mut(coroutine);
        c.ip = frame.ip;
        c.stack = saved;
        c.env = frame.env;
        c.env_depth = frame.env_depth;
        c.state = CoroutineState::Suspended;
    }
    if ctx.vm.frames.len() < entry_depth {
        return Ok(Some(yielded));
    }
    // A coroutine frame is always the entry frame of its dispatch entry.
    ctx.vm.stack.push(yielded);
    Ok(None)
}

// ---------------------------------------------------------------------------
// Single instruction
// ---------------------------------------------------------------------------

/// Execute one instruction of the top frame. `Ok(Some(v))` ends the dispatch
/// entry with `v`.
fn dispatch_one(ctx: &mut Context, entry_depth: usize) -> Result<Option<Value>, Value> {
    // Halt hook, once per interval.
    ctx.vm.halt_counter += 1;
    if ctx.vm.halt_counter >= ctx.vm.halt_interval {
        ctx.vm.halt_counter = 0;
        if let Some(cb) = ctx.vm.halt_cb.clone() {
            let verdict = cb(ctx);
            if !verdict.is_undefined() {
                ctx.vm.abort_in_flight = true;
                return Err(verdict);
            }
        }
    }

    let (bc, ip, stack_base, env, this_value, module_record) = {
        let frame = ctx.vm.frames.last().expect("dispatch with no frame");
        (
            Rc::clone(&frame.bytecode),
            frame.ip,
            frame.stack_base,
            frame.env,
            frame.this_value,
            frame.module_record,
        )
    };
    let code = &bc.code;
    let op = Op::from_byte(code[ip]);
    let mut next_ip = ip + 1;

    macro_rules! rd_u8 {
        () => {{
            let v = code[next_ip];
            next_ip += 1;
            v
        }};
    }
    macro_rules! rd_i8 {
        () => {{
            let v = code[next_ip] as i8;
            next_ip += 1;
            v
        }};
    }
    macro_rules! rd_u16 {
        () => {{
            let v = u16::from_le_bytes([code[next_ip], code[next_ip + 1]]);
            next_ip += 2;
            v
        }};
    }
    macro_rules! rd_i16 {
        () => {{
            let v = i16::from_le_bytes([code[next_ip], code[next_ip + 1]]);
            next_ip += 2;
            v
        }};
    }
    macro_rules! set_ip {
        ($ip:expr) => {
            ctx.vm.frames.last_mut().expect("frame").ip = $ip
        };
    }
    macro_rules! push {
        ($v:expr) => {
            ctx.vm.stack.push($v)
        };
    }
    macro_rules! pop {
        () => {
            ctx.vm.stack.pop().expect("operand stack underflow")
        };
    }

    match op {
        Op::Nop => {}
        Op::PushUndefined => push!(Value::UNDEFINED),
        Op::PushNull => push!(Value::NULL),
        Op::PushTrue => push!(Value::TRUE),
        Op::PushFalse => push!(Value::FALSE),
        Op::PushInt8 => {
            let v = rd_i8!();
            push!(Value::from_i30(v as i32));
        }
        Op::PushLit8 => {
            let i = rd_u8!();
            push!(bc.literals[i as usize]);
        }
        Op::PushLit16 => {
            let i = rd_u16!();
            push!(bc.literals[i as usize]);
        }
        Op::PushThis => push!(this_value),
        Op::Dup => {
            let v = *ctx.vm.stack.last().expect("dup on empty stack");
            push!(v);
        }
        Op::Dup2 => {
            let n = ctx.vm.stack.len();
            let a = ctx.vm.stack[n - 2];
            let b = ctx.vm.stack[n - 1];
            push!(a);
            push!(b);
        }
        Op::Pop => {
            pop!();
        }
        Op::Swap => {
            let n = ctx.vm.stack.len();
            ctx.vm.stack.swap(n - 1, n - 2);
        }
        Op::Rot3 => {
            let c = pop!();
            let b = pop!();
            let a = pop!();
            push!(c);
            push!(a);
            push!(b);
        }

        // -- bindings ------------------------------------------------------
        Op::DeclVar8 | Op::DeclVar16 | Op::DeclLet8 | Op::DeclLet16 | Op::DeclConst8
        | Op::DeclConst16 => {
            let lit = if matches!(op, Op::DeclVar8 | Op::DeclLet8 | Op::DeclConst8) {
                rd_u8!() as u16
            } else {
                rd_u16!()
            };
            let name = bc.literals[lit as usize];
            let cur_env = env.get().expect("declaration outside environment");
            let mutable = !matches!(op, Op::DeclConst8 | Op::DeclConst16);
            let initialized = matches!(op, Op::DeclVar8 | Op::DeclVar16);
            if !initialized && env::has_own_binding(ctx, cur_env, name) {
                set_ip!(next_ip);
                return Err(builtins::make_error(
                    ctx,
                    ErrorKind::SyntaxError,
                    "identifier has already been declared",
                ));
            }
            env::declare(ctx, cur_env, name, mutable, initialized);
        }
        Op::LoadIdent8 | Op::LoadIdent16 => {
            let lit = if matches!(op, Op::LoadIdent8) {
                rd_u8!() as u16
            } else {
                rd_u16!()
            };
            let name = bc.literals[lit as usize];
            let v = load_ident(ctx, env, name)?;
            push!(v);
        }
        Op::StoreIdent8 | Op::StoreIdent16 => {
            let lit = if matches!(op, Op::StoreIdent8) {
                rd_u8!() as u16
            } else {
                rd_u16!()
            };
            let name = bc.literals[lit as usize];
            let value = pop!();
            store_ident(ctx, env, name, value, bc.is_strict(), false)?;
        }
        Op::InitBinding8 | Op::InitBinding16 => {
            let lit = if matches!(op, Op::InitBinding8) {
                rd_u8!() as u16
            } else {
                rd_u16!()
            };
            let name = bc.literals[lit as usize];
            let value = pop!();
            store_ident(ctx, env, name, value, bc.is_strict(), true)?;
        }
        Op::TypeofIdent8 | Op::TypeofIdent16 => {
            let lit = if matches!(op, Op::TypeofIdent8) {
                rd_u8!() as u16
            } else {
                rd_u16!()
            };
            let name = bc.literals[lit as usize];
            let v = match env::resolve(ctx, env, name) {
                None => strings::magic_value(Magic::Undefined),
                Some((e, pos)) => {
                    let value = if pos == usize::MAX {
                        let obj = match &ctx.heap.env(e).kind {
                            EnvKind::Object { object } => *object,
                            _ => unreachable!(),
                        };
                        let bytes = strings::bytes_of(ctx, name);
                        let pname = object::prop_name_from_bytes(ctx, &bytes);
                        match object::own_slot(ctx, obj, pname) {
                            Some(slot) => match slot.value {
                                PropValue::Data(v) => v,
                                PropValue::Accessor { .. } => Value::UNDEFINED,
                            },
                            None => {
                                push!(strings::magic_value(Magic::Undefined));
                                set_ip!(next_ip);
                                return Ok(None);
                            }
                        }
                    } else {
                        let b = env::read_binding(ctx, e, pos);
                        if !b.initialized {
                            Value::UNDEFINED
                        } else {
                            b.value
                        }
                    };
                    builtins::typeof_value(ctx, value)
                }
            };
            push!(v);
        }
        Op::DeleteIdent8 | Op::DeleteIdent16 => {
            let lit = if matches!(op, Op::DeleteIdent8) {
                rd_u8!() as u16
            } else {
                rd_u16!()
            };
            let name = bc.literals[lit as usize];
            let v = match env::resolve(ctx, env, name) {
                None => Value::TRUE,
                Some((e, pos)) => {
                    if pos == usize::MAX {
                        let obj = match &ctx.heap.env(e).kind {
                            EnvKind::Object { object } => *object,
                            _ => unreachable!(),
                        };
                        let bytes = strings::bytes_of(ctx, name);
                        let pname = object::prop_name_from_bytes(ctx, &bytes);
                        match object::own_slot(ctx, obj, pname) {
                            Some(slot) if slot.flags & object::PROP_CONFIGURABLE != 0 => {
                                object::delete_own(ctx, obj, pname);
                                Value::TRUE
                            }
                            Some(_) => Value::FALSE,
                            None => Value::TRUE,
                        }
                    } else {
                        Value::FALSE
                    }
                }
            };
            push!(v);
        }

        // -- environments --------------------------------------------------
        Op::EnvPush => {
            let new_env = env::alloc_declarative(ctx, env);
            let frame = ctx.vm.frames.last_mut().expect("frame");
            frame.env = new_env.some();
            frame.env_depth += 1;
        }
        Op::EnvPop => {
            let frame = ctx.vm.frames.last_mut().expect("frame");
            let cur = frame.env.get().expect("env pop without env");
            let parent = ctx.heap.env(cur).parent;
            let frame = ctx.vm.frames.last_mut().expect("frame");
            frame.env = parent;
            frame.env_depth -= 1;
        }
        Op::EnvPushCatch8 | Op::EnvPushCatch16 => {
            let lit = if matches!(op, Op::EnvPushCatch8) {
                rd_u8!() as u16
            } else {
                rd_u16!()
            };
            let name = bc.literals[lit as usize];
            let thrown = pop!();
            let mark = ctx.roots_mark();
            ctx.root(thrown);
            let new_env = env::alloc_declarative(ctx, env);
            env::declare(ctx, new_env, name, true, true);
            let (e, pos) = env::resolve(ctx, new_env.some(), name).expect("fresh binding");
            env::write_binding(ctx, e, pos, thrown);
            ctx.roots_release(mark);
            let frame = ctx.vm.frames.last_mut().expect("frame");
            frame.env = new_env.some();
            frame.env_depth += 1;
        }

        // -- properties ----------------------------------------------------
        Op::GetProp => {
            let key = pop!();
            let base = pop!();
            let v = builtins::op_get_property(ctx, base, key)?;
            push!(v);
        }
        Op::GetPropLit8 | Op::GetPropLit16 => {
            let lit = if matches!(op, Op::GetPropLit8) {
                rd_u8!() as u16
            } else {
                rd_u16!()
            };
            let key = bc.literals[lit as usize];
            let base = pop!();
            let v = builtins::op_get_property(ctx, base, key)?;
            push!(v);
        }
        Op::SetProp => {
            let value = pop!();
            let key = pop!();
            let base = pop!();
            builtins::op_set_property(ctx, base, key, value, bc.is_strict())?;
            push!(value);
        }
        Op::SetPropLit8 | Op::SetPropLit16 => {
            let lit = if matches!(op, Op::SetPropLit8) {
                rd_u8!() as u16
            } else {
                rd_u16!()
            };
            let key = bc.literals[lit as usize];
            let value = pop!();
            let base = pop!();
            builtins::op_set_property(ctx, base, key, value, bc.is_strict())?;
            push!(value);
        }
        Op::DefineOwnLit8 => {
            let lit = rd_u8!();
            let key = bc.literals[lit as usize];
            let value = pop!();
            let obj = *ctx.vm.stack.last().expect("object literal base");
            builtins::op_define_own(ctx, obj, key, value)?;
        }
        Op::DefineOwn => {
            let value = pop!();
            let key = pop!();
            let obj = *ctx.vm.stack.last().expect("object literal base");
            builtins::op_define_own(ctx, obj, key, value)?;
        }
        Op::DeleteProp => {
            let key = pop!();
            let base = pop!();
            let v = builtins::op_delete_property(ctx, base, key, bc.is_strict())?;
            push!(v);
        }

        // -- creation ------------------------------------------------------
        Op::NewArray16 => {
            let count = rd_u16!() as usize;
            let start = ctx.vm.stack.len() - count;
            let elements: Vec<Value> = ctx.vm.stack.split_off(start);
            let mut holes = 0u32;
            for v in &elements {
                if v.is_hole() {
                    holes += 1;
                }
            }
            let arr = object::alloc_array(ctx, elements);
            if holes > 0 {
                object::array_data_mut(ctx, Idx(arr.heap_cp())).hole_count = holes;
            }
            push!(arr);
        }
        Op::NewObject => {
            let proto = ctx.realm.object_prototype;
            let obj = object::alloc_object_value(ctx, proto, ObjectExtra::None);
            push!(obj);
        }
        Op::PushFunc8 | Op::PushFunc16 => {
            let lit = if matches!(op, Op::PushFunc8) {
                rd_u8!() as u16
            } else {
                rd_u16!()
            };
            let template = bc.literals[lit as usize];
            let template_idx = Idx(template.heap_cp());
            let template_bc = ctx.heap.bytecode(template_idx);
            let arrow_this = if template_bc.flags & crate::bytecode::BC_ARROW != 0 {
                this_value
            } else {
                Value::UNDEFINED
            };
            let func = object::alloc_function(ctx, template_idx, env, arrow_this);
            push!(func);
        }

        // -- arithmetic / unary --------------------------------------------
        Op::Add => {
            let b = pop!();
            let a = pop!();
            let v = builtins::op_add(ctx, a, b)?;
            push!(v);
        }
        Op::Sub | Op::Mul | Op::Div | Op::Mod | Op::Exp => {
            let b = pop!();
            let a = pop!();
            let x = builtins::to_number(ctx, a)?;
            let y = builtins::to_number(ctx, b)?;
            let r = match op {
                Op::Sub => x - y,
                Op::Mul => x * y,
                Op::Div => x / y,
                Op::Mod => {
                    if y == 0.0 {
                        f64::NAN
                    } else {
                        x % y
                    }
                }
                _ => x.powf(y),
            };
            let v = builtins::make_number(ctx, r);
            push!(v);
        }
        Op::Neg => {
            let a = pop!();
            let x = builtins::to_number(ctx, a)?;
            let v = builtins::make_number(ctx, -x);
            push!(v);
        }
        Op::ToNumber => {
            let a = pop!();
            let x = builtins::to_number(ctx, a)?;
            let v = builtins::make_number(ctx, x);
            push!(v);
        }
        Op::BitAnd | Op::BitOr | Op::BitXor | Op::Shl | Op::Shr | Op::Ushr => {
            let b = pop!();
            let a = pop!();
            let x = builtins::to_int32(ctx, a)?;
            let y = builtins::to_int32(ctx, b)?;
            let r: f64 = match op {
                Op::BitAnd => (x & y) as f64,
                Op::BitOr => (x | y) as f64,
                Op::BitXor => (x ^ y) as f64,
                Op::Shl => (x << (y & 31)) as f64,
                Op::Shr => (x >> (y & 31)) as f64,
                _ => ((x as u32) >> (y & 31)) as f64,
            };
            let v = builtins::make_number(ctx, r);
            push!(v);
        }
        Op::BitNot => {
            let a = pop!();
            let x = builtins::to_int32(ctx, a)?;
            let v = builtins::make_number(ctx, !x as f64);
            push!(v);
        }
        Op::Not => {
            let a = pop!();
            let b = builtins::to_boolean(ctx, a);
            push!(Value::bool_val(!b));
        }
        Op::TypeofVal => {
            let a = pop!();
            let v = builtins::typeof_value(ctx, a);
            push!(v);
        }

        // -- comparison ----------------------------------------------------
        Op::Eq | Op::Ne => {
            let b = pop!();
            let a = pop!();
            let eq = builtins::loose_eq(ctx, a, b)?;
            push!(Value::bool_val(if matches!(op, Op::Eq) { eq } else { !eq }));
        }
        Op::StrictEq | Op::StrictNe => {
            let b = pop!();
            let a = pop!();
            let eq = builtins::strict_eq(ctx, a, b);
            push!(Value::bool_val(if matches!(op, Op::StrictEq) {
                eq
            } else {
                !eq
            }));
        }
        Op::Lt | Op::Le | Op::Gt | Op::Ge => {
            let b = pop!();
            let a = pop!();
            let v = builtins::op_relational(ctx, a, b, op)?;
            push!(v);
        }
        Op::InstanceOf => {
            let b = pop!();
            let a = pop!();
            let v = builtins::op_instanceof(ctx, a, b)?;
            push!(Value::bool_val(v));
        }
        Op::In => {
            let b = pop!();
            let a = pop!();
            let v = builtins::op_in(ctx, a, b)?;
            push!(Value::bool_val(v));
        }
        Op::IsNullish => {
            let v = *ctx.vm.stack.last().expect("operand");
            push!(Value::bool_val(v.is_nullish()));
        }

        // -- control flow --------------------------------------------------
        Op::Jump8 => {
            let d = rd_i8!();
            set_ip!((next_ip as i64 + d as i64) as usize);
            return Ok(None);
        }
        Op::Jump16 => {
            let d = rd_i16!();
            set_ip!((next_ip as i64 + d as i64) as usize);
            return Ok(None);
        }
        Op::JumpTrue8 | Op::JumpTrue16 | Op::JumpFalse8 | Op::JumpFalse16 => {
            let d: i64 = if matches!(op, Op::JumpTrue8 | Op::JumpFalse8) {
                rd_i8!() as i64
            } else {
                rd_i16!() as i64
            };
            let cond = pop!();
            let truthy = builtins::to_boolean(ctx, cond);
            let want = matches!(op, Op::JumpTrue8 | Op::JumpTrue16);
            if truthy == want {
                set_ip!((next_ip as i64 + d) as usize);
            } else {
                set_ip!(next_ip);
            }
            return Ok(None);
        }

        // -- calls ---------------------------------------------------------
        Op::Call => {
            let argc = rd_u8!() as usize;
            let args_start = ctx.vm.stack.len() - argc;
            let func = ctx.vm.stack[args_start - 2];
            let callee_this = ctx.vm.stack[args_start - 1];

            // Scripted plain functions continue in this loop; everything
            // else goes through the generic path.
            if let Some((bytecode, fenv, arrow_this)) = scripted_plain_target(ctx, func) {
                let fbc = ctx.heap.bytecode(bytecode);
                let call_env = {
                    let args: Vec<Value> = ctx.vm.stack[args_start..].to_vec();
                    make_call_env(ctx, &fbc, fenv, &args)?
                };
                ctx.vm.stack.truncate(args_start - 2);
                let effective_this = if fbc.flags & crate::bytecode::BC_ARROW != 0 {
                    arrow_this
                } else {
                    callee_this
                };
                // The callee resumes the caller here.
                set_ip!(next_ip);
                let frame = Frame {
                    bytecode: fbc,
                    bc_idx: bytecode,
                    ip: 0,
                    stack_base: ctx.vm.stack.len(),
                    env: call_env.some(),
                    env_depth: 0,
                    this_value: effective_this,
                    completion_value: Value::UNDEFINED,
                    pending: Completion::Normal,
                    module_record: None,
                    coroutine: OptIdx::NONE,
                    function: func,
                };
                push_frame(ctx, frame)?;
                return Ok(None);
            }

            let args: Vec<Value> = ctx.vm.stack.split_off(args_start);
            ctx.vm.stack.truncate(ctx.vm.stack.len() - 2);
            // The popped callee/arguments have no stack slot anymore.
            let mark = ctx.roots_mark();
            ctx.root(func);
            ctx.root(callee_this);
            for a in &args {
                ctx.root(*a);
            }
            let result = call_function(ctx, func, callee_this, &args);
            ctx.roots_release(mark);
            push!(result?);
        }
        Op::New => {
            let argc = rd_u8!() as usize;
            let args_start = ctx.vm.stack.len() - argc;
            let args: Vec<Value> = ctx.vm.stack.split_off(args_start);
            let ctor = pop!();
            let mark = ctx.roots_mark();
            ctx.root(ctor);
            for a in &args {
                ctx.root(*a);
            }
            let result = construct(ctx, ctor, &args);
            ctx.roots_release(mark);
            push!(result?);
        }
        Op::Return => {
            let value = pop!();
            return perform_return(ctx, value, entry_depth);
        }
        Op::ReturnUndefined => {
            return perform_return(ctx, Value::UNDEFINED, entry_depth);
        }
        Op::ReturnCompletion => {
            let value = ctx.vm.frames.last().expect("frame").completion_value;
            return perform_return(ctx, value, entry_depth);
        }
        Op::SetCompletion => {
            let v = pop!();
            ctx.vm.frames.last_mut().expect("frame").completion_value = v;
        }
        Op::Throw => {
            let v = pop!();
            return Err(v);
        }
        Op::PendingNormal => {
            ctx.vm.frames.last_mut().expect("frame").pending = Completion::Normal;
        }
        Op::FinallyEnd => {
            set_ip!(next_ip);
            let pending = ctx.vm.frames.last().expect("frame").pending;
            match pending {
                Completion::Normal => {}
                Completion::Throw(v) => {
                    ctx.vm.frames.last_mut().expect("frame").pending = Completion::Normal;
                    return Err(v);
                }
                Completion::Return(v) => {
                    ctx.vm.frames.last_mut().expect("frame").pending = Completion::Normal;
                    return perform_return(ctx, v, entry_depth);
                }
            }
        }

        // -- coroutines ----------------------------------------------------
        Op::Yield | Op::Await => {
            let value = pop!();
            set_ip!(next_ip);
            return perform_suspend(ctx, value, entry_depth);
        }

        // -- secondary table -----------------------------------------------
        Op::Ext => {
            let ext = ExtOp::from_byte(rd_u8!());
            match ext {
                ExtOp::ImportBinding => {
                    let request = rd_u8!();
                    let export_lit = rd_u16!();
                    let local_lit = rd_u16!();
                    let export_name = bc.literals[export_lit as usize];
                    let local_name = bc.literals[local_lit as usize];
                    let record = module_record.expect("import outside module frame");
                    let value = module::get_import_value(ctx, record, request, export_name)?;
                    let cur_env = env.get().expect("module env");
                    env::declare(ctx, cur_env, local_name, false, true);
                    let (e, pos) =
                        env::resolve(ctx, cur_env.some(), local_name).expect("fresh binding");
                    env::write_binding(ctx, e, pos, value);
                    set_ip!(next_ip);
                    return Ok(None);
                }
                ExtOp::ImportNamespace => {
                    let request = rd_u8!();
                    let local_lit = rd_u16!();
                    let local_name = bc.literals[local_lit as usize];
                    let record = module_record.expect("import outside module frame");
                    let value = module::get_namespace_value(ctx, record, request)?;
                    let cur_env = env.get().expect("module env");
                    env::declare(ctx, cur_env, local_name, false, true);
                    let (e, pos) =
                        env::resolve(ctx, cur_env.some(), local_name).expect("fresh binding");
                    env::write_binding(ctx, e, pos, value);
                    set_ip!(next_ip);
                    return Ok(None);
                }
                ExtOp::NewRegExp => {
                    let p_lit = rd_u16!();
                    let f_lit = rd_u16!();
                    let pattern = bc.literals[p_lit as usize];
                    let flags = bc.literals[f_lit as usize];
                    let v = builtins::make_regexp_object(ctx, pattern, flags);
                    push!(v);
                    set_ip!(next_ip);
                    return Ok(None);
                }
            }
        }
    }

    set_ip!(next_ip);
    Ok(None)
}

/// Dispatch info for a plain scripted function (not generator/async), the
/// in-loop fast path.
fn scripted_plain_target(ctx: &Context, func: Value) -> Option<(Idx, OptIdx, Value)> {
    if !func.is_object_ref() {
        return None;
    }
    match &ctx.heap.object(Idx(func.heap_cp())).extra {
        ObjectExtra::Function {
            bytecode,
            env,
            arrow_this,
        } => {
            let bc = ctx.heap.bytecode(*bytecode);
            if bc.is_generator() || bc.is_async() {
                None
            } else {
                Some((*bytecode, *env, *arrow_this))
            }
        }
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Identifier access
// ---------------------------------------------------------------------------

fn load_ident(ctx: &mut Context, env: OptIdx, name: Value) -> Result<Value, Value> {
    match env::resolve(ctx, env, name) {
        None => Err(reference_error(ctx, name)),
        Some((e, pos)) => {
            if pos == usize::MAX {
                let obj = match &ctx.heap.env(e).kind {
                    EnvKind::Object { object } => *object,
                    _ => unreachable!(),
                };
                let bytes = strings::bytes_of(ctx, name);
                let pname = object::prop_name_from_bytes(ctx, &bytes);
                let v = builtins::op_get_property_name(
                    ctx,
                    obj.value(HeapKind::Object),
                    pname,
                )?;
                if v.is_not_found() {
                    return Err(reference_error(ctx, name));
                }
                Ok(v)
            } else {
                let b = env::read_binding(ctx, e, pos);
                if !b.initialized {
                    return Err(tdz_error(ctx, name));
                }
                Ok(b.value)
            }
        }
    }
}

fn store_ident(
    ctx: &mut Context,
    env: OptIdx,
    name: Value,
    value: Value,
    strict: bool,
    initializing: bool,
) -> Result<(), Value> {
    match env::resolve(ctx, env, name) {
        None => {
            if strict {
                return Err(reference_error(ctx, name));
            }
            // Sloppy mode: create a global property.
            let global = ctx.realm.global_object.get().expect("realm");
            let bytes = strings::bytes_of(ctx, name);
            let pname = object::prop_name_from_bytes(ctx, &bytes);
            object::add_own(
                ctx,
                global,
                pname,
                object::PROP_FLAGS_DEFAULT,
                PropValue::Data(value),
            );
            Ok(())
        }
        Some((e, pos)) => {
            if pos == usize::MAX {
                let obj = match &ctx.heap.env(e).kind {
                    EnvKind::Object { object } => *object,
                    _ => unreachable!(),
                };
                if strict {
                    let bytes = strings::bytes_of(ctx, name);
                    let pname = object::prop_name_from_bytes(ctx, &bytes);
                    if object::own_slot(ctx, obj, pname).is_none() {
                        return Err(reference_error(ctx, name));
                    }
                }
                builtins::op_set_property(
                    ctx,
                    obj.value(HeapKind::Object),
                    name,
                    value,
                    strict,
                )?;
                Ok(())
            } else {
                let b = env::read_binding(ctx, e, pos);
                if !b.initialized && !initializing {
                    return Err(tdz_error(ctx, name));
                }
                if !b.mutable && b.initialized && !initializing {
                    return Err(builtins::make_error(
                        ctx,
                        ErrorKind::TypeError,
                        "assignment to constant variable",
                    ));
                }
                env::write_binding(ctx, e, pos, value);
                Ok(())
            }
        }
    }
}

fn reference_error(ctx: &mut Context, name: Value) -> Value {
    let text = strings::to_rust_string(ctx, name);
    builtins::make_error(
        ctx,
        ErrorKind::ReferenceError,
        &format!("{} is not defined", text),
    )
}

fn tdz_error(ctx: &mut Context, name: Value) -> Value {
    let text = strings::to_rust_string(ctx, name);
    builtins::make_error(
        ctx,
        ErrorKind::ReferenceError,
        &format!("cannot access '{}' before initialization", text),
    )
}

/// Build a backtrace string from the live frame chain, newest first.
pub fn capture_backtrace(ctx: &Context) -> String {
    let mut out = String::new();
    for frame in ctx.vm.frames.iter().rev() {
        let bc = &frame.bytecode;
        let name = if bc.name.is_string() {
            strings::to_rust_string(ctx, bc.name)
        } else {
            "<anonymous>".to_string()
        };
        let source = if bc.source_name.is_string() {
            strings::to_rust_string(ctx, bc.source_name)
        } else {
            "<anonymous>".to_string()
        };
        let line = bc.line_at(frame.ip as u32);
        out.push_str(&format!("    at {} ({}:{})\n", name, source, line));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coroutine_cell_size_tracks_stack() {
        let c = CoroutineCell {
            bytecode: Idx(0),
            ip: 0,
            stack: Vec::with_capacity(8),
            env: OptIdx::NONE,
            env_depth: 0,
            this_value: Value::UNDEFINED,
            function: Value::UNDEFINED,
            state: CoroutineState::SuspendedStart,
        };
        assert_eq!(c.booked_extra(), 8 * std::mem::size_of::<Value>());
    }

    #[test]
    fn vm_state_roots_cover_stack() {
        let mut vm = VmState::new(1024);
        vm.stack.push(Value::heap(HeapKind::Object, 7));
        vm.stack.push(Value::from_i30(1));
        let mut roots = Vec::new();
        vm.collect_roots(&mut roots);
        assert!(roots.contains(&Idx(7)));
        assert_eq!(roots.len(), 1);
    }
}
