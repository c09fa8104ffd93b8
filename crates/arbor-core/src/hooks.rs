//! Hooks: per-instance state for function components.
//!
//! Every function component instance owns an ordered list of hook slots.
//! Each render walks the list with a cursor that starts at zero, and every
//! hook call consumes the next slot. The reconciler installs a render frame
//! for the instance before calling its render function and takes it down
//! afterwards, so hooks simply look up "the current frame".
//!
//! # Quick Start
//!
//! ```ignore
//! use arbor::prelude::*;
//!
//! fn counter(_props: &Props) -> Rendered {
//!     let (count, set_count) = use_state(|| 0);
//!     let clicks = use_ref(|| 0);
//!
//!     use_effect(move || println!("count is now {count}"), count);
//!
//!     let on_click = Callback::new(move |_| {
//!         *clicks.borrow_mut() += 1;
//!         set_count.update(|n| n + 1);
//!     });
//!     Ok(Some(Element::host(
//!         "TextButton",
//!         props! { "Text" => format!("Count: {count}"), "Activated" => on_click },
//!     )))
//! }
//! ```
//!
//! # Available Hooks
//!
//! | Hook | Purpose |
//! |------|---------|
//! | [`use_state`] | State with a `(value, setter)` pair; setting schedules a re-render |
//! | [`use_reducer`] | State driven by a reducer and dispatched actions |
//! | [`use_ref`] | Mutable cell that never triggers re-renders |
//! | [`use_effect`] | Side effect run after commit when dependencies change |
//! | [`use_effect_cleanup`] | Same, returning a cleanup |
//! | [`use_layout_effect`] | Effect run right after host mutations, before passive effects |
//! | [`use_mount`] | One-time effect with cleanup on unmount |
//! | [`use_memo`] | Memoized computation |
//! | [`use_callback`] | Memoized callback |
//! | [`use_context`] | Value of the nearest provider of a context |
//! | [`use_binding`] | A binding owned by the instance |
//! | [`use_imperative_handle`] | Value exposed through a parent's ref |
//!
//! # Rules of Hooks
//!
//! Hooks must be called in the **exact same order** on every render of an
//! instance. Calling a hook conditionally, in a loop with a varying number
//! of iterations, or after an early return breaks that rule. The
//! reconciler detects it and fails the render with
//! [`Error::HookCountMismatch`] or [`Error::HookOrderMismatch`].
//!
//! Calling a hook outside of a function component render (in an event
//! handler, an effect, a static initializer) panics.
//!
//! # Dependencies
//!
//! Effects and memos take a dependency value compared with `PartialEq`
//! against the value from the previous render. Use a tuple for several
//! dependencies, `()` to run once, and [`EveryRender`] to run after every
//! render.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};

use crate::binding::{Binding, BindingSetter, create_binding};
use crate::context::{Context, ContextId, ContextStack};
use crate::error::Error;
use crate::instance::InstanceId;
use crate::scheduler::{Cleanup, EffectCell, EffectFn, PendingEffect, Phase, ScheduleHandle};

// ============================================================================
// Hook storage
// ============================================================================

/// Metadata about a hook for debugging purposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookMeta {
    /// The hook function name (e.g., "use_state", "use_effect")
    pub hook_type: &'static str,
    /// The type of value stored (from std::any::type_name)
    pub value_type: &'static str,
}

struct HookEntry {
    value: Box<dyn Any>,
    meta: HookMeta,
}

/// Hook slots of one function component instance.
#[derive(Default)]
pub(crate) struct HookState {
    hooks: Vec<HookEntry>,
    /// Hook count of the previous render.
    expected_count: Option<usize>,
    render_count: usize,
    /// Effect cells created by this instance, in creation order.
    effects: Vec<Rc<EffectCell>>,
}

impl HookState {
    pub fn debug_info(&self) -> Vec<HookMeta> {
        self.hooks.iter().map(|entry| entry.meta.clone()).collect()
    }

    pub fn render_count(&self) -> usize {
        self.render_count
    }

    /// Cancel pending effects and run stored cleanups, in creation order.
    ///
    /// Every cleanup runs even if an earlier one fails; the first failure
    /// is returned.
    pub fn dispose(&mut self) -> Result<(), String> {
        let mut first = Ok(());
        for cell in self.effects.drain(..) {
            if let Err(message) = cell.dispose()
                && first.is_ok()
            {
                first = Err(message);
            }
        }
        first
    }
}

// ============================================================================
// Render frames
// ============================================================================

/// Everything a render frame needs from the reconciler.
pub(crate) struct FrameInput {
    pub instance: InstanceId,
    pub component: Rc<str>,
    pub state: HookState,
    pub schedule: ScheduleHandle,
    pub contexts: ContextStack,
}

/// What a render left behind.
pub(crate) struct RenderOutcome {
    pub state: HookState,
    pub effects: Vec<PendingEffect>,
    /// Provider instances read through `use_context`.
    pub reads: Vec<InstanceId>,
    pub violation: Option<Error>,
}

struct RenderFrame {
    component: Rc<str>,
    state: HookState,
    index: usize,
    violation: Option<Error>,
    schedule: ScheduleHandle,
    contexts: ContextStack,
    effects: Vec<PendingEffect>,
    reads: Vec<InstanceId>,
}

enum Lookup<T> {
    Found(T),
    Missing(usize),
}

impl RenderFrame {
    fn lookup<T: Clone + 'static>(&mut self, hook_type: &'static str) -> Lookup<T> {
        let index = self.index;
        self.index += 1;

        let Some(entry) = self.state.hooks.get(index) else {
            return Lookup::Missing(index);
        };
        if entry.meta.hook_type == hook_type
            && let Some(value) = entry.value.downcast_ref::<T>()
        {
            return Lookup::Found(value.clone());
        }

        if self.violation.is_none() {
            let (previous, current) = if entry.meta.hook_type == hook_type {
                (entry.meta.value_type, std::any::type_name::<T>())
            } else {
                (entry.meta.hook_type, hook_type)
            };
            self.violation = Some(Error::HookOrderMismatch {
                component: self.component.to_string(),
                index,
                previous: previous.to_string(),
                current: current.to_string(),
            });
        }
        Lookup::Missing(index)
    }

    fn store<T: 'static>(&mut self, index: usize, hook_type: &'static str, value: T) {
        let entry = HookEntry {
            value: Box::new(value),
            meta: HookMeta {
                hook_type,
                value_type: std::any::type_name::<T>(),
            },
        };
        match self.state.hooks.get_mut(index) {
            Some(slot) => *slot = entry,
            None => self.state.hooks.push(entry),
        }
    }

    fn finish(mut self) -> RenderOutcome {
        if let Some(expected) = self.state.expected_count
            && self.index != expected
            && self.violation.is_none()
        {
            self.violation = Some(Error::HookCountMismatch {
                component: self.component.to_string(),
                previous: expected,
                current: self.index,
            });
        }
        self.state.expected_count = Some(self.index);
        self.state.render_count += 1;
        RenderOutcome {
            state: self.state,
            effects: self.effects,
            reads: self.reads,
            violation: self.violation,
        }
    }
}

thread_local! {
    static CURRENT_FRAME: RefCell<Vec<RenderFrame>> = const { RefCell::new(Vec::new()) };
}

/// A render that panicked, with the hook state it was handed.
pub(crate) struct Unwound {
    pub state: HookState,
    pub payload: Box<dyn Any + Send>,
}

/// Run `render` with a hook frame for one instance installed.
///
/// A panicking render gives its hook state back instead of losing it; the
/// caller restores the state and resumes the unwind.
pub(crate) fn render_with_hooks<R>(
    input: FrameInput,
    render: impl FnOnce() -> R,
) -> Result<(R, RenderOutcome), Unwound> {
    let frame = RenderFrame {
        component: input.component,
        state: input.state,
        index: 0,
        violation: None,
        schedule: input.schedule,
        contexts: input.contexts,
        effects: Vec::new(),
        reads: Vec::new(),
    };
    tracing::trace!(instance = %input.instance, "begin render");
    CURRENT_FRAME.with(|stack| stack.borrow_mut().push(frame));

    let result = panic::catch_unwind(AssertUnwindSafe(render));

    let frame = CURRENT_FRAME.with(|stack| stack.borrow_mut().pop());
    match result {
        Ok(value) => {
            let outcome = match frame {
                Some(frame) => frame.finish(),
                None => RenderOutcome {
                    state: HookState::default(),
                    effects: Vec::new(),
                    reads: Vec::new(),
                    violation: Some(Error::Internal("render frame vanished".to_string())),
                },
            };
            Ok((value, outcome))
        }
        Err(payload) => {
            tracing::trace!(instance = %input.instance, "render panicked");
            Err(Unwound {
                state: frame.map(|frame| frame.state).unwrap_or_default(),
                payload,
            })
        }
    }
}

fn with_frame<R>(hook_type: &'static str, f: impl FnOnce(&mut RenderFrame) -> R) -> R {
    CURRENT_FRAME.with(|stack| {
        let mut stack = stack.borrow_mut();
        match stack.last_mut() {
            Some(frame) => f(frame),
            None => panic!("{}", Error::HookOutsideRender { hook: hook_type }),
        }
    })
}

/// Core hook implementation: get the value at the cursor or create it.
///
/// `init` runs without the frame borrowed.
fn use_hook<T: Clone + 'static>(hook_type: &'static str, init: impl FnOnce() -> T) -> T {
    match with_frame(hook_type, |frame| frame.lookup::<T>(hook_type)) {
        Lookup::Found(value) => value,
        Lookup::Missing(index) => {
            let value = init();
            let stored = value.clone();
            with_frame(hook_type, |frame| frame.store(index, hook_type, stored));
            value
        }
    }
}

fn current_schedule(hook_type: &'static str) -> ScheduleHandle {
    with_frame(hook_type, |frame| frame.schedule.clone())
}

// ============================================================================
// State
// ============================================================================

/// Schedules state changes for one component instance.
///
/// Updates are applied in call order at the next flush, and the instance
/// re-renders once no matter how many updates were queued.
pub struct StateSetter<T> {
    value: Weak<RefCell<T>>,
    schedule: ScheduleHandle,
}

impl<T> Clone for StateSetter<T> {
    fn clone(&self) -> Self {
        Self {
            value: Weak::clone(&self.value),
            schedule: self.schedule.clone(),
        }
    }
}

impl<T> fmt::Debug for StateSetter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StateSetter(...)")
    }
}

impl<T: 'static> StateSetter<T> {
    pub(crate) fn new(value: &Rc<RefCell<T>>, schedule: ScheduleHandle) -> Self {
        Self {
            value: Rc::downgrade(value),
            schedule,
        }
    }

    /// Replace the state.
    pub fn set(&self, value: T) {
        let target = Weak::clone(&self.value);
        self.schedule.schedule(Box::new(move || {
            if let Some(cell) = target.upgrade() {
                *cell.borrow_mut() = value;
            }
        }));
    }

    /// Replace the state with `f(state)`, computed at flush time.
    pub fn update(&self, f: impl FnOnce(&T) -> T + 'static) {
        let target = Weak::clone(&self.value);
        self.schedule.schedule(Box::new(move || {
            if let Some(cell) = target.upgrade() {
                let next = f(&cell.borrow());
                *cell.borrow_mut() = next;
            }
        }));
    }
}

struct StateSlot<T> {
    value: Rc<RefCell<T>>,
    setter: StateSetter<T>,
}

impl<T> Clone for StateSlot<T> {
    fn clone(&self) -> Self {
        Self {
            value: Rc::clone(&self.value),
            setter: self.setter.clone(),
        }
    }
}

/// State with a React-style `(value, setter)` pair.
///
/// The initializer only runs on the first render. The setter is the same
/// handle on every render.
///
/// # Example
///
/// ```ignore
/// let (count, set_count) = use_state(|| 0);
/// let on_click = Callback::new(move |_| set_count.set(count + 1));
/// ```
pub fn use_state<T: Clone + 'static>(init: impl FnOnce() -> T) -> (T, StateSetter<T>) {
    let schedule = current_schedule("use_state");
    let slot = use_hook("use_state", move || {
        let value = Rc::new(RefCell::new(init()));
        StateSlot {
            setter: StateSetter::new(&value, schedule),
            value,
        }
    });
    let current = slot.value.borrow().clone();
    (current, slot.setter)
}

trait Reduce<A> {
    fn reduce(&self, action: A);
}

struct ReducerCell<S, A> {
    state: RefCell<S>,
    reducer: RefCell<Rc<dyn Fn(&S, A) -> S>>,
}

impl<S: 'static, A: 'static> Reduce<A> for ReducerCell<S, A> {
    fn reduce(&self, action: A) {
        let reducer = Rc::clone(&self.reducer.borrow());
        let next = reducer(&self.state.borrow(), action);
        *self.state.borrow_mut() = next;
    }
}

/// Sends actions to a [`use_reducer`] hook.
pub struct Dispatch<A> {
    target: Weak<dyn Reduce<A>>,
    schedule: ScheduleHandle,
}

impl<A> Clone for Dispatch<A> {
    fn clone(&self) -> Self {
        Self {
            target: Weak::clone(&self.target),
            schedule: self.schedule.clone(),
        }
    }
}

impl<A> fmt::Debug for Dispatch<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Dispatch(...)")
    }
}

impl<A: 'static> Dispatch<A> {
    /// Queue an action. Actions are reduced in dispatch order at the next
    /// flush.
    pub fn dispatch(&self, action: A) {
        let target = Weak::clone(&self.target);
        self.schedule.schedule(Box::new(move || {
            if let Some(target) = target.upgrade() {
                target.reduce(action);
            }
        }));
    }
}

struct ReducerSlot<S, A> {
    cell: Rc<ReducerCell<S, A>>,
    dispatch: Dispatch<A>,
}

impl<S, A> Clone for ReducerSlot<S, A> {
    fn clone(&self) -> Self {
        Self {
            cell: Rc::clone(&self.cell),
            dispatch: self.dispatch.clone(),
        }
    }
}

/// State driven by a reducer.
///
/// The most recent `reducer` is used when queued actions are applied.
pub fn use_reducer<S, A, R>(reducer: R, init: impl FnOnce() -> S) -> (S, Dispatch<A>)
where
    S: Clone + 'static,
    A: 'static,
    R: Fn(&S, A) -> S + 'static,
{
    let schedule = current_schedule("use_reducer");
    let reducer: Rc<dyn Fn(&S, A) -> S> = Rc::new(reducer);
    let initial_reducer = Rc::clone(&reducer);
    let slot = use_hook("use_reducer", move || {
        let cell = Rc::new(ReducerCell {
            state: RefCell::new(init()),
            reducer: RefCell::new(initial_reducer),
        });
        let weak = Rc::downgrade(&cell);
        let target: Weak<dyn Reduce<A>> = weak;
        ReducerSlot {
            cell,
            dispatch: Dispatch { target, schedule },
        }
    });
    *slot.cell.reducer.borrow_mut() = reducer;
    let current = slot.cell.state.borrow().clone();
    (current, slot.dispatch)
}

// ============================================================================
// Refs
// ============================================================================

/// Handle to a ref value created by `use_ref`.
pub struct RefHandle<T> {
    inner: Rc<RefCell<T>>,
}

impl<T> Clone for RefHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T> RefHandle<T> {
    /// Get a reference to the current value.
    pub fn borrow(&self) -> std::cell::Ref<'_, T> {
        self.inner.borrow()
    }

    /// Get a mutable reference to the current value.
    pub fn borrow_mut(&self) -> std::cell::RefMut<'_, T> {
        self.inner.borrow_mut()
    }

    /// Set the value directly.
    pub fn set(&self, value: T) {
        *self.inner.borrow_mut() = value;
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T: Clone> RefHandle<T> {
    /// Get a clone of the current value.
    pub fn get(&self) -> T {
        self.inner.borrow().clone()
    }
}

impl<T: fmt::Debug> fmt::Debug for RefHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RefHandle").field(&*self.inner.borrow()).finish()
    }
}

/// A mutable cell that persists across renders.
///
/// Writes never trigger a re-render.
pub fn use_ref<T: 'static>(init: impl FnOnce() -> T) -> RefHandle<T> {
    let inner = use_hook("use_ref", || Rc::new(RefCell::new(init())));
    RefHandle { inner }
}

/// A binding owned by the instance.
///
/// The binding is created on the first render and returned unchanged
/// afterwards. Updating it notifies subscribers (including host properties
/// bound to it) without re-rendering the component.
pub fn use_binding<T: Clone + 'static>(init: impl FnOnce() -> T) -> (Binding<T>, BindingSetter<T>) {
    use_hook("use_binding", || create_binding(init()))
}

// ============================================================================
// Effects
// ============================================================================

/// Dependency marker that never compares equal, so the effect or memo
/// runs after every render.
#[derive(Debug, Clone, Copy, Default)]
pub struct EveryRender;

impl PartialEq for EveryRender {
    fn eq(&self, _other: &Self) -> bool {
        false
    }
}

struct EffectSlot<D> {
    deps: RefCell<Option<D>>,
    cell: Rc<EffectCell>,
}

fn effect_hook<D: PartialEq + 'static>(hook_type: &'static str, phase: Phase, deps: D, run: EffectFn) {
    let slot: Rc<EffectSlot<D>> = use_hook(hook_type, || {
        let cell = EffectCell::new();
        with_frame(hook_type, |frame| frame.state.effects.push(Rc::clone(&cell)));
        Rc::new(EffectSlot {
            deps: RefCell::new(None),
            cell,
        })
    });

    let changed = slot.deps.borrow().as_ref().is_none_or(|old| *old != deps);
    if changed {
        // Deps are stored once the effect is queued, so a failed render
        // leaves the last committed deps in place.
        let target = Rc::clone(&slot);
        with_frame(hook_type, |frame| {
            frame.effects.push(PendingEffect {
                phase,
                cell: Rc::clone(&slot.cell),
                run,
                record_deps: Box::new(move || *target.deps.borrow_mut() = Some(deps)),
            })
        });
    }
}

/// Run a side effect after commit when dependencies change.
///
/// # Example
///
/// ```ignore
/// let (count, _) = use_state(|| 0);
/// use_effect(move || println!("count changed to {count}"), count);
/// ```
pub fn use_effect<F, D>(effect_fn: F, deps: D)
where
    F: FnOnce() + 'static,
    D: PartialEq + 'static,
{
    effect_hook(
        "use_effect",
        Phase::Passive,
        deps,
        Box::new(move || {
            effect_fn();
            None
        }),
    );
}

/// Run a side effect with a cleanup function when dependencies change.
///
/// The cleanup runs before the next run of the effect and when the
/// instance unmounts.
///
/// # Example
///
/// ```ignore
/// use_effect_cleanup(move || {
///     let subscription = status.subscribe(on_status);
///     move || drop(subscription)
/// }, ());
/// ```
pub fn use_effect_cleanup<F, C, D>(effect_fn: F, deps: D)
where
    F: FnOnce() -> C + 'static,
    C: FnOnce() + 'static,
    D: PartialEq + 'static,
{
    effect_hook(
        "use_effect_cleanup",
        Phase::Passive,
        deps,
        Box::new(move || Some(Box::new(effect_fn()) as Cleanup)),
    );
}

/// Like [`use_effect`], but runs synchronously right after host mutations
/// of the flush, before any passive effect.
pub fn use_layout_effect<F, D>(effect_fn: F, deps: D)
where
    F: FnOnce() + 'static,
    D: PartialEq + 'static,
{
    effect_hook(
        "use_layout_effect",
        Phase::Layout,
        deps,
        Box::new(move || {
            effect_fn();
            None
        }),
    );
}

/// Layout effect with a cleanup.
pub fn use_layout_effect_cleanup<F, C, D>(effect_fn: F, deps: D)
where
    F: FnOnce() -> C + 'static,
    C: FnOnce() + 'static,
    D: PartialEq + 'static,
{
    effect_hook(
        "use_layout_effect_cleanup",
        Phase::Layout,
        deps,
        Box::new(move || Some(Box::new(effect_fn()) as Cleanup)),
    );
}

/// Run a side effect only once, after the first commit.
///
/// The returned cleanup runs on unmount.
pub fn use_mount<F, C>(effect_fn: F)
where
    F: FnOnce() -> C + 'static,
    C: FnOnce() + 'static,
{
    effect_hook(
        "use_mount",
        Phase::Passive,
        (),
        Box::new(move || Some(Box::new(effect_fn()) as Cleanup)),
    );
}

/// Expose a value through a ref handed down by a parent.
///
/// `init` runs after commit, in the layout phase, and its result is stored
/// in `handle`. The handle is cleared before the next run and on unmount.
/// It re-runs when `deps` change or a different handle is passed.
///
/// # Example
///
/// ```ignore
/// let handle = props.get("api").and_then(|v| v.downcast::<RefHandle<Option<Callback>>>());
/// if let Some(handle) = handle {
///     use_imperative_handle(handle, move || Callback::new(move |_| set_open.set(true)), ());
/// }
/// ```
pub fn use_imperative_handle<T, F, D>(handle: &RefHandle<Option<T>>, init: F, deps: D)
where
    T: 'static,
    F: FnOnce() -> T + 'static,
    D: PartialEq + 'static,
{
    let target = handle.clone();
    let identity = Rc::as_ptr(&handle.inner) as usize;
    effect_hook(
        "use_imperative_handle",
        Phase::Layout,
        (identity, deps),
        Box::new(move || {
            target.set(Some(init()));
            Some(Box::new(move || target.set(None)) as Cleanup)
        }),
    );
}

// ============================================================================
// Memoization
// ============================================================================

struct MemoState<T, D> {
    value: Option<T>,
    deps: Option<D>,
}

/// Memoize a computation based on dependencies.
///
/// The compute function only runs when dependencies change; otherwise the
/// cached value (the same value, clone of the same `Rc` if `T` is one) is
/// returned.
pub fn use_memo<T, F, D>(compute: F, deps: D) -> T
where
    T: Clone + 'static,
    F: FnOnce() -> T,
    D: PartialEq + 'static,
{
    let state = use_hook("use_memo", || {
        Rc::new(RefCell::new(MemoState::<T, D> {
            value: None,
            deps: None,
        }))
    });

    {
        let cached = state.borrow();
        if let (Some(value), Some(old)) = (&cached.value, &cached.deps)
            && *old == deps
        {
            return value.clone();
        }
    }

    let value = compute();
    let mut cached = state.borrow_mut();
    cached.value = Some(value.clone());
    cached.deps = Some(deps);
    value
}

/// Create a memoized callback that only changes when dependencies change.
pub fn use_callback<F, D>(callback: F, deps: D) -> F
where
    F: Clone + 'static,
    D: PartialEq + 'static,
{
    use_memo(|| callback, deps)
}

// ============================================================================
// Context
// ============================================================================

/// Read the nearest provided value of `context`.
///
/// The instance is subscribed to that provider: when the provider's value
/// changes the instance re-renders, even if everything between them bails
/// out.
pub fn use_context<T: Clone + PartialEq + 'static>(context: &Context<T>) -> T {
    let id = context.id();
    let _: ContextId = use_hook("use_context", || id);
    with_frame("use_context", |frame| {
        let provided = frame.contexts.resolve(id).cloned();
        if let Some(provided) = &provided
            && !frame.reads.contains(&provided.provider)
        {
            frame.reads.push(provided.provider);
        }
        context.read(provided.as_ref())
    })
}
