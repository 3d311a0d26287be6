/// Microtask Queue & Promises
///
/// A FIFO of jobs drained by `run_jobs` until it is empty or a job raises an
/// uncaught exception. Promise resolution follows the promise-then algorithm
/// including thenable assimilation; async functions are generator coroutines
/// whose driver threads results through `Promise.resolve`, enqueuing a
/// resume job on every settled await.
use crate::builtins::{self, routine_ids, BuiltinId};
use crate::context::Context;
use crate::errors::ErrorKind;
use crate::heap::Idx;
use crate::object::{
    self, ObjectExtra, PromiseData, PromiseState, PropName, Reaction, ReactionHandler,
};
use crate::strings::Magic;
use crate::value::Value;
use crate::vm;
use std::collections::VecDeque;

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

pub enum Job {
    /// Plain callback job (queueMicrotask).
    Call {
        func: Value,
        this: Value,
        args: Vec<Value>,
    },
    /// A settled promise firing one reaction.
    Reaction { reaction: Reaction, argument: Value },
    /// Thenable assimilation step.
    ResolveThenable {
        promise: Value,
        thenable: Value,
        then: Value,
    },
}

#[derive(Default)]
pub struct JobQueue {
    queue: VecDeque<Job>,
}

impl JobQueue {
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn collect_roots(&self, out: &mut Vec<Idx>) {
        let mut push = |v: Value| {
            if v.is_heap() {
                out.push(Idx(v.heap_cp()));
            } else if v.is_exception() {
                out.push(Idx(v.error_cp()));
            }
        };
        for job in &self.queue {
            match job {
                Job::Call { func, this, args } => {
                    push(*func);
                    push(*this);
                    for a in args {
                        push(*a);
                    }
                }
                Job::Reaction { reaction, argument } => {
                    push(*argument);
                    if let Some(cap) = reaction.capability {
                        push(cap);
                    }
                    match &reaction.handler {
                        ReactionHandler::Fulfill(v) | ReactionHandler::Reject(v) => push(*v),
                        ReactionHandler::AsyncResume { generator }
                        | ReactionHandler::AsyncThrow { generator } => push(*generator),
                    }
                }
                Job::ResolveThenable {
                    promise,
                    thenable,
                    then,
                } => {
                    push(*promise);
                    push(*thenable);
                    push(*then);
                }
            }
        }
    }
}

pub fn enqueue_call(ctx: &mut Context, func: Value, this: Value, args: &[Value]) {
    ctx.jobs.queue.push_back(Job::Call {
        func,
        this,
        args: args.to_vec(),
    });
}

/// Drain the queue in enqueue order. Stops at the first uncaught exception
/// and returns it; remaining jobs stay queued.
pub fn run_jobs(ctx: &mut Context) -> Result<Value, Value> {
    while let Some(job) = ctx.jobs.queue.pop_front() {
        match job {
            Job::Call { func, this, args } => {
                let mark = ctx.roots_mark();
                ctx.root(func);
                ctx.root(this);
                for a in &args {
                    ctx.root(*a);
                }
                let r = vm::call_function(ctx, func, this, &args);
                ctx.roots_release(mark);
                r?;
            }
            Job::Reaction { reaction, argument } => {
                run_reaction(ctx, reaction, argument)?;
            }
            Job::ResolveThenable {
                promise,
                thenable,
                then,
            } => {
                let mark = ctx.roots_mark();
                ctx.root(promise);
                ctx.root(thenable);
                ctx.root(then);
                let resolve = make_settle_fn(ctx, promise, routine_ids::promise::RESOLVE_FN);
                ctx.root(resolve);
                let reject = make_settle_fn(ctx, promise, routine_ids::promise::REJECT_FN);
                ctx.root(reject);
                let r = vm::call_function(ctx, then, thenable, &[resolve, reject]);
                if let Err(e) = r {
                    promise_reject(ctx, promise, e);
                }
                ctx.roots_release(mark);
            }
        }
    }
    Ok(Value::UNDEFINED)
}

fn run_reaction(ctx: &mut Context, reaction: Reaction, argument: Value) -> Result<(), Value> {
    let mark = ctx.roots_mark();
    ctx.root(argument);
    if let Some(cap) = reaction.capability {
        ctx.root(cap);
    }
    let result: Result<(), Value> = (|| {
        match reaction.handler {
            ReactionHandler::Fulfill(handler) => {
                let outcome = if object::is_callable(ctx, handler) {
                    vm::call_function(ctx, handler, Value::UNDEFINED, &[argument])
                } else {
                    Ok(argument) // identity
                };
                settle_capability(ctx, reaction.capability, outcome);
            }
            ReactionHandler::Reject(handler) => {
                let outcome = if object::is_callable(ctx, handler) {
                    vm::call_function(ctx, handler, Value::UNDEFINED, &[argument])
                } else {
                    Err(argument) // thrower
                };
                settle_capability(ctx, reaction.capability, outcome);
            }
            ReactionHandler::AsyncResume { generator } => {
                async_step(ctx, generator, argument, false);
            }
            ReactionHandler::AsyncThrow { generator } => {
                async_step(ctx, generator, argument, true);
            }
        }
        Ok(())
    })();
    ctx.roots_release(mark);
    result
}

fn settle_capability(ctx: &mut Context, capability: Option<Value>, outcome: Result<Value, Value>) {
    let Some(promise) = capability else {
        return;
    };
    match outcome {
        Ok(v) => promise_resolve(ctx, promise, v),
        Err(e) => promise_reject(ctx, promise, e),
    }
}

// ---------------------------------------------------------------------------
// Promise state machine
// ---------------------------------------------------------------------------

pub fn promise_new(ctx: &mut Context) -> Value {
    let proto = ctx.realm.promise_prototype;
    object::alloc_object_value(ctx, proto, ObjectExtra::Promise(Box::new(PromiseData::new())))
}

pub fn is_promise(ctx: &Context, v: Value) -> bool {
    v.is_object_ref()
        && matches!(
            ctx.heap.object(Idx(v.heap_cp())).extra,
            ObjectExtra::Promise(_)
        )
}

pub fn promise_state(ctx: &Context, v: Value) -> Option<(PromiseState, Value)> {
    if !is_promise(ctx, v) {
        return None;
    }
    match &ctx.heap.object(Idx(v.heap_cp())).extra {
        ObjectExtra::Promise(p) => Some((p.state, p.result)),
        _ => None,
    }
}

fn promise_data_mut(ctx: &mut Context, promise: Value) -> &mut PromiseData {
    match &mut ctx.heap.object_mut(Idx(promise.heap_cp())).extra {
        ObjectExtra::Promise(p) => p,
        _ => unreachable!("expected a promise object"),
    }
}

/// ResolvePromise: thenables assimilate through a queued job.
pub fn promise_resolve(ctx: &mut Context, promise: Value, value: Value) {
    if promise_state(ctx, promise).map(|(s, _)| s) != Some(PromiseState::Pending) {
        return;
    }
    if value == promise {
        let e = builtins::make_error(ctx, ErrorKind::TypeError, "promise cannot resolve itself");
        promise_reject(ctx, promise, e);
        return;
    }
    let mark = ctx.roots_mark();
    ctx.root(value);
    if value.is_object_ref() {
        let then = match builtins::op_get_property_name(
            ctx,
            value,
            PropName::Magic(Magic::Then as u16),
        ) {
            Ok(v) => v,
            Err(e) => {
                promise_reject(ctx, promise, e);
                ctx.roots_release(mark);
                return;
            }
        };
        if object::is_callable(ctx, then) {
            ctx.jobs.queue.push_back(Job::ResolveThenable {
                promise,
                thenable: value,
                then,
            });
            ctx.roots_release(mark);
            return;
        }
    }
    promise_fulfill(ctx, promise, value);
    ctx.roots_release(mark);
}

pub fn promise_fulfill(ctx: &mut Context, promise: Value, value: Value) {
    let reactions = {
        let p = promise_data_mut(ctx, promise);
        if p.state != PromiseState::Pending {
            return;
        }
        p.state = PromiseState::Fulfilled;
        p.result = value;
        p.reject_reactions.clear();
        std::mem::take(&mut p.fulfill_reactions)
    };
    for reaction in reactions {
        ctx.jobs.queue.push_back(Job::Reaction {
            reaction,
            argument: value,
        });
    }
}

pub fn promise_reject(ctx: &mut Context, promise: Value, reason: Value) {
    let reactions = {
        let p = promise_data_mut(ctx, promise);
        if p.state != PromiseState::Pending {
            return;
        }
        p.state = PromiseState::Rejected;
        p.result = reason;
        p.fulfill_reactions.clear();
        std::mem::take(&mut p.reject_reactions)
    };
    for reaction in reactions {
        ctx.jobs.queue.push_back(Job::Reaction {
            reaction,
            argument: reason,
        });
    }
}

/// PerformPromiseThen: register both reactions, firing immediately when the
/// promise is already settled.
pub fn promise_add_reactions(
    ctx: &mut Context,
    promise: Value,
    on_fulfill: Reaction,
    on_reject: Reaction,
) {
    let (state, result) = promise_state(ctx, promise).expect("promise expected");
    match state {
        PromiseState::Pending => {
            let p = promise_data_mut(ctx, promise);
            p.fulfill_reactions.push(on_fulfill);
            p.reject_reactions.push(on_reject);
        }
        PromiseState::Fulfilled => {
            ctx.jobs.queue.push_back(Job::Reaction {
                reaction: on_fulfill,
                argument: result,
            });
        }
        PromiseState::Rejected => {
            ctx.jobs.queue.push_back(Job::Reaction {
                reaction: on_reject,
                argument: result,
            });
        }
    }
}

/// `then` with callable-or-identity handlers; returns the derived promise.
pub fn promise_then(
    ctx: &mut Context,
    promise: Value,
    on_fulfill: Value,
    on_reject: Value,
) -> Value {
    let derived = promise_new(ctx);
    let mark = ctx.roots_mark();
    ctx.root(derived);
    promise_add_reactions(
        ctx,
        promise,
        Reaction {
            capability: Some(derived),
            handler: ReactionHandler::Fulfill(on_fulfill),
        },
        Reaction {
            capability: Some(derived),
            handler: ReactionHandler::Reject(on_reject),
        },
    );
    ctx.roots_release(mark);
    derived
}

/// Promise.resolve semantics: pass promises through, wrap everything else.
pub fn promise_resolve_static(ctx: &mut Context, value: Value) -> Value {
    if is_promise(ctx, value) {
        return value;
    }
    let p = promise_new(ctx);
    let mark = ctx.roots_mark();
    ctx.root(p);
    promise_resolve(ctx, p, value);
    ctx.roots_release(mark);
    p
}

/// Routine object bound to its promise: the resolve/reject functions handed
/// to executors and thenables.
fn make_settle_fn(ctx: &mut Context, promise: Value, routine: u16) -> Value {
    let routine_obj = object::alloc_routine(ctx, BuiltinId::PromiseCtor, routine);
    let mark = ctx.roots_mark();
    ctx.root(routine_obj);
    let proto = ctx.realm.function_prototype;
    let bound = object::alloc_object_value(
        ctx,
        proto,
        ObjectExtra::Bound {
            target: routine_obj,
            this_value: Value::UNDEFINED,
            args: vec![promise].into_boxed_slice(),
        },
    );
    ctx.roots_release(mark);
    bound
}

// ---------------------------------------------------------------------------
// Async function driver
// ---------------------------------------------------------------------------

/// Calling an async function: create the coroutine, create its promise, and
/// take the first step synchronously.
pub fn async_function_call(
    ctx: &mut Context,
    func: Value,
    this_value: Value,
    args: &[Value],
) -> Result<Value, Value> {
    let gen = vm::make_generator_object(ctx, func, this_value, args, object::CoroutineKind::Async)?;
    let mark = ctx.roots_mark();
    ctx.root(gen);
    let promise = promise_new(ctx);
    ctx.root(promise);
    if let ObjectExtra::Generator { promise: slot, .. } =
        &mut ctx.heap.object_mut(Idx(gen.heap_cp())).extra
    {
        *slot = promise;
    }
    async_step(ctx, gen, Value::UNDEFINED, false);
    ctx.roots_release(mark);
    Ok(promise)
}

/// One turn of an async function: resume, then either settle its promise or
/// chain the awaited value.
pub fn async_step(ctx: &mut Context, gen: Value, input: Value, is_throw: bool) {
    let promise = match &ctx.heap.object(Idx(gen.heap_cp())).extra {
        ObjectExtra::Generator { promise, .. } => *promise,
        _ => return,
    };
    match vm::resume_coroutine(ctx, gen, input, is_throw) {
        vm::ResumeOutcome::Done(v) => promise_resolve(ctx, promise, v),
        vm::ResumeOutcome::Thrown(e) => promise_reject(ctx, promise, e),
        vm::ResumeOutcome::Yielded(awaited) => {
            let mark = ctx.roots_mark();
            ctx.root(awaited);
            let inner = promise_resolve_static(ctx, awaited);
            ctx.root(inner);
            promise_add_reactions(
                ctx,
                inner,
                Reaction {
                    capability: None,
                    handler: ReactionHandler::AsyncResume { generator: gen },
                },
                Reaction {
                    capability: None,
                    handler: ReactionHandler::AsyncThrow { generator: gen },
                },
            );
            ctx.roots_release(mark);
        }
    }
}

// ---------------------------------------------------------------------------
// Promise routines
// ---------------------------------------------------------------------------

pub fn promise_ctor_routine(
    ctx: &mut Context,
    routine: u16,
    args: &[Value],
    is_construct: bool,
) -> Result<Value, Value> {
    use routine_ids::promise::*;
    match routine {
        CONSTRUCT => {
            if !is_construct {
                return Err(builtins::make_error(
                    ctx,
                    ErrorKind::TypeError,
                    "Promise constructor requires 'new'",
                ));
            }
            let executor = args.first().copied().unwrap_or(Value::UNDEFINED);
            if !object::is_callable(ctx, executor) {
                return Err(builtins::make_error(
                    ctx,
                    ErrorKind::TypeError,
                    "Promise executor is not callable",
                ));
            }
            let promise = promise_new(ctx);
            let mark = ctx.roots_mark();
            ctx.root(promise);
            let resolve = make_settle_fn(ctx, promise, RESOLVE_FN);
            ctx.root(resolve);
            let reject = make_settle_fn(ctx, promise, REJECT_FN);
            ctx.root(reject);
            let r = vm::call_function(ctx, executor, Value::UNDEFINED, &[resolve, reject]);
            if let Err(e) = r {
                promise_reject(ctx, promise, e);
            }
            ctx.roots_release(mark);
            Ok(promise)
        }
        RESOLVE => {
            let v = args.first().copied().unwrap_or(Value::UNDEFINED);
            Ok(promise_resolve_static(ctx, v))
        }
        REJECT => {
            let v = args.first().copied().unwrap_or(Value::UNDEFINED);
            let p = promise_new(ctx);
            let mark = ctx.roots_mark();
            ctx.root(p);
            promise_reject(ctx, p, v);
            ctx.roots_release(mark);
            Ok(p)
        }
        ALL => promise_all(ctx, args),
        RESOLVE_FN => {
            // bound: [promise], call: [value]
            let promise = args.first().copied().unwrap_or(Value::UNDEFINED);
            let value = args.get(1).copied().unwrap_or(Value::UNDEFINED);
            if is_promise(ctx, promise) {
                promise_resolve(ctx, promise, value);
            }
            Ok(Value::UNDEFINED)
        }
        REJECT_FN => {
            let promise = args.first().copied().unwrap_or(Value::UNDEFINED);
            let reason = args.get(1).copied().unwrap_or(Value::UNDEFINED);
            if is_promise(ctx, promise) {
                promise_reject(ctx, promise, reason);
            }
            Ok(Value::UNDEFINED)
        }
        ALL_FULFILL => {
            // bound: [state, index, result_promise], call: [value]
            let state = args.first().copied().unwrap_or(Value::UNDEFINED);
            let index = args.get(1).copied().unwrap_or(Value::UNDEFINED);
            let result_promise = args.get(2).copied().unwrap_or(Value::UNDEFINED);
            let value = args.get(3).copied().unwrap_or(Value::UNDEFINED);
            let values =
                builtins::op_get_property_name(ctx, state, PropName::Magic(Magic::Value as u16))?;
            builtins::op_set_property(ctx, values, index, value, false)?;
            let remaining_name = object::prop_name_from_bytes(ctx, b"remaining");
            let remaining_v = builtins::op_get_property_name(ctx, state, remaining_name)?;
            let remaining = builtins::to_number(ctx, remaining_v)? - 1.0;
            let remaining_value = builtins::make_number(ctx, remaining);
            let key = object::prop_name_to_value(ctx, remaining_name);
            builtins::op_set_property(ctx, state, key, remaining_value, false)?;
            if remaining <= 0.0 {
                promise_resolve(ctx, result_promise, values);
            }
            Ok(Value::UNDEFINED)
        }
        ALL_REJECT => {
            let result_promise = args.first().copied().unwrap_or(Value::UNDEFINED);
            let reason = args.get(1).copied().unwrap_or(Value::UNDEFINED);
            if is_promise(ctx, result_promise) {
                promise_reject(ctx, result_promise, reason);
            }
            Ok(Value::UNDEFINED)
        }
        FINALLY_PASS => {
            let callback = args.first().copied().unwrap_or(Value::UNDEFINED);
            let value = args.get(1).copied().unwrap_or(Value::UNDEFINED);
            if object::is_callable(ctx, callback) {
                vm::call_function(ctx, callback, Value::UNDEFINED, &[])?;
            }
            Ok(value)
        }
        FINALLY_RETHROW => {
            let callback = args.first().copied().unwrap_or(Value::UNDEFINED);
            let reason = args.get(1).copied().unwrap_or(Value::UNDEFINED);
            if object::is_callable(ctx, callback) {
                vm::call_function(ctx, callback, Value::UNDEFINED, &[])?;
            }
            Err(reason)
        }
        _ => Err(builtins::make_error(
            ctx,
            ErrorKind::TypeError,
            "unknown built-in routine",
        )),
    }
}

fn promise_all(ctx: &mut Context, args: &[Value]) -> Result<Value, Value> {
    use routine_ids::promise::*;
    let iterable = args.first().copied().unwrap_or(Value::UNDEFINED);
    if !iterable.is_object_ref() {
        return Err(builtins::make_error(
            ctx,
            ErrorKind::TypeError,
            "Promise.all expects an array",
        ));
    }
    let len_v =
        builtins::op_get_property_name(ctx, iterable, PropName::Magic(Magic::Length as u16))?;
    let len = builtins::to_number(ctx, len_v)? as u32;

    let result_promise = promise_new(ctx);
    let mark = ctx.roots_mark();
    ctx.root(result_promise);

    // state: { value: [results], remaining: n }
    let values = object::alloc_array(ctx, vec![Value::UNDEFINED; len as usize]);
    ctx.root(values);
    let state_proto = ctx.realm.object_prototype;
    let state = object::alloc_object_value(ctx, state_proto, ObjectExtra::None);
    ctx.root(state);
    let state_idx = Idx(state.heap_cp());
    object::add_own(
        ctx,
        state_idx,
        PropName::Magic(Magic::Value as u16),
        object::PROP_FLAGS_DEFAULT,
        object::PropValue::Data(values),
    );
    let remaining_name = object::prop_name_from_bytes(ctx, b"remaining");
    let remaining = builtins::make_number(ctx, len as f64);
    object::add_own(
        ctx,
        state_idx,
        remaining_name,
        object::PROP_FLAGS_DEFAULT,
        object::PropValue::Data(remaining),
    );

    if len == 0 {
        promise_resolve(ctx, result_promise, values);
        ctx.roots_release(mark);
        return Ok(result_promise);
    }

    for i in 0..len {
        let v = builtins::op_get_property_name(ctx, iterable, PropName::Index(i))?;
        let v = if v.is_not_found() { Value::UNDEFINED } else { v };
        let inner = promise_resolve_static(ctx, v);
        ctx.root(inner);
        let index_value = builtins::make_number(ctx, i as f64);

        // on-fulfill: bound ALL_FULFILL(state, index, result_promise)
        let fulfill_routine = object::alloc_routine(ctx, BuiltinId::PromiseCtor, ALL_FULFILL);
        ctx.root(fulfill_routine);
        let fn_proto = ctx.realm.function_prototype;
        let on_fulfill = object::alloc_object_value(
            ctx,
            fn_proto,
            ObjectExtra::Bound {
                target: fulfill_routine,
                this_value: Value::UNDEFINED,
                args: vec![state, index_value, result_promise].into_boxed_slice(),
            },
        );
        ctx.root(on_fulfill);
        let reject_routine = object::alloc_routine(ctx, BuiltinId::PromiseCtor, ALL_REJECT);
        ctx.root(reject_routine);
        let on_reject = object::alloc_object_value(
            ctx,
            fn_proto,
            ObjectExtra::Bound {
                target: reject_routine,
                this_value: Value::UNDEFINED,
                args: vec![result_promise].into_boxed_slice(),
            },
        );
        ctx.root(on_reject);
        promise_then(ctx, inner, on_fulfill, on_reject);
    }
    ctx.roots_release(mark);
    Ok(result_promise)
}

pub fn promise_proto_routine(
    ctx: &mut Context,
    routine: u16,
    this: Value,
    args: &[Value],
) -> Result<Value, Value> {
    use routine_ids::promise::*;
    if !is_promise(ctx, this) {
        return Err(builtins::make_error(
            ctx,
            ErrorKind::TypeError,
            "receiver is not a promise",
        ));
    }
    match routine {
        THEN => {
            let on_f = args.first().copied().unwrap_or(Value::UNDEFINED);
            let on_r = args.get(1).copied().unwrap_or(Value::UNDEFINED);
            Ok(promise_then(ctx, this, on_f, on_r))
        }
        CATCH => {
            let on_r = args.first().copied().unwrap_or(Value::UNDEFINED);
            Ok(promise_then(ctx, this, Value::UNDEFINED, on_r))
        }
        FINALLY => {
            let callback = args.first().copied().unwrap_or(Value::UNDEFINED);
            let mark = ctx.roots_mark();
            let pass_routine = object::alloc_routine(ctx, BuiltinId::PromiseCtor, FINALLY_PASS);
            ctx.root(pass_routine);
            let fn_proto = ctx.realm.function_prototype;
            let on_f = object::alloc_object_value(
                ctx,
                fn_proto,
                ObjectExtra::Bound {
                    target: pass_routine,
                    this_value: Value::UNDEFINED,
                    args: vec![callback].into_boxed_slice(),
                },
            );
            ctx.root(on_f);
            let rethrow_routine =
                object::alloc_routine(ctx, BuiltinId::PromiseCtor, FINALLY_RETHROW);
            ctx.root(rethrow_routine);
            let on_r = object::alloc_object_value(
                ctx,
                fn_proto,
                ObjectExtra::Bound {
                    target: rethrow_routine,
                    this_value: Value::UNDEFINED,
                    args: vec![callback].into_boxed_slice(),
                },
            );
            ctx.root(on_r);
            let derived = promise_then(ctx, this, on_f, on_r);
            ctx.roots_release(mark);
            Ok(derived)
        }
        _ => Err(builtins::make_error(
            ctx,
            ErrorKind::TypeError,
            "unknown built-in routine",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn microtasks_run_in_enqueue_order() {
        let mut ctx = Context::new(Default::default()).unwrap();
        // Two native callbacks appending to a shared log.
        use std::cell::RefCell;
        use std::rc::Rc;
        let log: Rc<RefCell<Vec<u32>>> = Rc::new(RefCell::new(Vec::new()));
        let mut fns = Vec::new();
        for tag in [1u32, 2, 3] {
            let log2 = Rc::clone(&log);
            let idx = ctx.register_native(Rc::new(move |_ctx, _this, _args| {
                log2.borrow_mut().push(tag);
                Ok(Value::UNDEFINED)
            }));
            let proto = ctx.realm.function_prototype;
            let f = object::alloc_object_value(&mut ctx, proto, ObjectExtra::Native {
                handler: idx,
            });
            fns.push(f);
        }
        for f in &fns {
            enqueue_call(&mut ctx, *f, Value::UNDEFINED, &[]);
        }
        run_jobs(&mut ctx).unwrap();
        assert_eq!(*log.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn promise_settles_once() {
        let mut ctx = Context::new(Default::default()).unwrap();
        let p = promise_new(&mut ctx);
        promise_fulfill(&mut ctx, p, Value::from_i30(1));
        promise_reject(&mut ctx, p, Value::from_i30(2));
        let (state, result) = promise_state(&ctx, p).unwrap();
        assert_eq!(state, PromiseState::Fulfilled);
        assert_eq!(result, Value::from_i30(1));
    }

    #[test]
    fn then_on_settled_promise_fires_via_queue() {
        let mut ctx = Context::new(Default::default()).unwrap();
        let p = promise_new(&mut ctx);
        promise_fulfill(&mut ctx, p, Value::from_i30(7));
        let derived = promise_then(&mut ctx, p, Value::UNDEFINED, Value::UNDEFINED);
        // identity handler: derived resolves with the same value, but only
        // after the queue drains
        assert_eq!(
            promise_state(&ctx, derived).unwrap().0,
            PromiseState::Pending
        );
        run_jobs(&mut ctx).unwrap();
        let (state, result) = promise_state(&ctx, derived).unwrap();
        assert_eq!(state, PromiseState::Fulfilled);
        assert_eq!(result, Value::from_i30(7));
    }

    #[test]
    fn reject_propagates_through_identity_chain() {
        let mut ctx = Context::new(Default::default()).unwrap();
        let p = promise_new(&mut ctx);
        let derived = promise_then(&mut ctx, p, Value::UNDEFINED, Value::UNDEFINED);
        promise_reject(&mut ctx, p, Value::from_i30(-1));
        run_jobs(&mut ctx).unwrap();
        let (state, result) = promise_state(&ctx, derived).unwrap();
        assert_eq!(state, PromiseState::Rejected);
        assert_eq!(result, Value::from_i30(-1));
    }
}
