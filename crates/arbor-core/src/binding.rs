//! Bindings: mutable cells that live outside the instance tree.
//!
//! A binding can be read and subscribed to without causing any
//! reconciliation. When a binding is passed as a host property the
//! reconciler subscribes to it and forwards every update straight to the
//! host object.
//!
//! # Example
//!
//! ```ignore
//! use arbor_core::binding::*;
//!
//! let (progress, set_progress) = create_binding(0.25);
//! let width = progress.map(|p| format!("{}%", p * 100.0));
//!
//! let _sub = width.subscribe(|w| println!("width is now {w}"));
//! set_progress.set(0.5); // Prints: "width is now 50%"
//! ```
//!
//! Derived bindings (`map`, [`join_bindings`]) do not cache: each read
//! recomputes from the source cells, so transforms should be cheap and pure.

use std::any::TypeId;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::rc::{Rc, Weak};

// ============================================================================
// Subscriptions
// ============================================================================

/// Handle to a binding subscription. Dropping it disconnects.
#[must_use = "dropping a Subscription disconnects it immediately"]
pub struct Subscription {
    disconnect: Vec<Box<dyn FnOnce()>>,
}

impl Subscription {
    fn new(disconnect: impl FnOnce() + 'static) -> Self {
        Self {
            disconnect: vec![Box::new(disconnect)],
        }
    }

    fn group(subscriptions: Vec<Subscription>) -> Self {
        Self {
            disconnect: subscriptions
                .into_iter()
                .flat_map(|mut s| std::mem::take(&mut s.disconnect))
                .collect(),
        }
    }

    /// Disconnect now.
    pub fn disconnect(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        for disconnect in self.disconnect.drain(..) {
            disconnect();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("sources", &self.disconnect.len())
            .finish()
    }
}

// ============================================================================
// Source cell
// ============================================================================

struct Subscriber<T> {
    id: u64,
    callback: Box<dyn Fn(&T)>,
    connected: Cell<bool>,
}

struct CellInner<T> {
    value: RefCell<T>,
    subscribers: RefCell<Vec<Rc<Subscriber<T>>>>,
    next_subscriber: Cell<u64>,
}

/// Notification round shared by every binding on the thread.
///
/// Updates issued while subscribers are being notified, to any binding,
/// wait until the current round has finished and then run in issue order.
#[derive(Default)]
struct NotifyRound {
    active: Cell<bool>,
    deferred: RefCell<VecDeque<Box<dyn FnOnce()>>>,
}

thread_local! {
    static ROUND: NotifyRound = NotifyRound::default();
}

/// Ends the round, dropping whatever a panicking subscriber left queued.
struct EndRound;

impl Drop for EndRound {
    fn drop(&mut self) {
        let _ = ROUND.try_with(|round| {
            round.active.set(false);
            round.deferred.borrow_mut().clear();
        });
    }
}

impl<T: Clone + 'static> CellInner<T> {
    fn subscribe(self: &Rc<Self>, callback: Box<dyn Fn(&T)>) -> Subscription {
        let id = self.next_subscriber.get();
        self.next_subscriber.set(id + 1);
        self.subscribers.borrow_mut().push(Rc::new(Subscriber {
            id,
            callback,
            connected: Cell::new(true),
        }));

        let weak: Weak<Self> = Rc::downgrade(self);
        Subscription::new(move || {
            if let Some(cell) = weak.upgrade() {
                let mut subscribers = cell.subscribers.borrow_mut();
                if let Some(pos) = subscribers.iter().position(|s| s.id == id) {
                    subscribers.remove(pos).connected.set(false);
                }
            }
        })
    }

    fn update(self: &Rc<Self>, value: T) {
        let nested = ROUND.with(|round| round.active.replace(true));
        if nested {
            let cell = Rc::clone(self);
            ROUND.with(|round| {
                round
                    .deferred
                    .borrow_mut()
                    .push_back(Box::new(move || cell.notify(value)))
            });
            return;
        }

        let _end = EndRound;
        self.notify(value);
        while let Some(next) = ROUND.with(|round| round.deferred.borrow_mut().pop_front()) {
            next();
        }
    }

    fn notify(&self, value: T) {
        *self.value.borrow_mut() = value;
        let current = self.value.borrow().clone();
        let subscribers: Vec<_> = self.subscribers.borrow().clone();
        for subscriber in subscribers {
            if subscriber.connected.get() {
                (subscriber.callback)(&current);
            }
        }
    }
}

// ============================================================================
// Binding
// ============================================================================

/// Identity of a binding, used when diffing props.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Identity {
    Source(usize),
    Converted(Box<Identity>, TypeId),
}

trait Derived<T> {
    fn get(&self) -> T;
    fn subscribe(&self, callback: Rc<dyn Fn(&T)>) -> Subscription;
    fn identity(&self) -> Option<Identity> {
        None
    }
}

enum Inner<T> {
    Cell(Rc<CellInner<T>>),
    Derived(Rc<dyn Derived<T>>),
}

/// Read handle of a binding.
pub struct Binding<T> {
    inner: Inner<T>,
}

impl<T> Clone for Binding<T> {
    fn clone(&self) -> Self {
        let inner = match &self.inner {
            Inner::Cell(cell) => Inner::Cell(Rc::clone(cell)),
            Inner::Derived(derived) => Inner::Derived(Rc::clone(derived)),
        };
        Self { inner }
    }
}

impl<T: Clone + 'static> Binding<T> {
    /// Current value. Derived bindings recompute on every call.
    pub fn get(&self) -> T {
        match &self.inner {
            Inner::Cell(cell) => cell.value.borrow().clone(),
            Inner::Derived(derived) => derived.get(),
        }
    }

    /// Call `callback` with the new value after every update.
    pub fn subscribe(&self, callback: impl Fn(&T) + 'static) -> Subscription {
        match &self.inner {
            Inner::Cell(cell) => cell.subscribe(Box::new(callback)),
            Inner::Derived(derived) => derived.subscribe(Rc::new(callback)),
        }
    }

    /// Derived read-only binding computing `transform(value)` on each read.
    pub fn map<U, F>(&self, transform: F) -> Binding<U>
    where
        U: Clone + 'static,
        F: Fn(&T) -> U + 'static,
    {
        Binding {
            inner: Inner::Derived(Rc::new(Mapped {
                base: self.clone(),
                transform: Rc::new(transform),
                identity: None,
            })),
        }
    }

    /// Like `map(|v| v.clone().into())`, but two conversions of the same
    /// binding to the same type are considered identical.
    pub fn convert<U>(&self) -> Binding<U>
    where
        T: Into<U>,
        U: Clone + 'static,
    {
        Binding {
            inner: Inner::Derived(Rc::new(Mapped {
                base: self.clone(),
                transform: Rc::new(|value: &T| value.clone().into()),
                identity: Some(Identity::Converted(
                    Box::new(self.identity()),
                    TypeId::of::<U>(),
                )),
            })),
        }
    }

    fn identity(&self) -> Identity {
        match &self.inner {
            Inner::Cell(cell) => Identity::Source(Rc::as_ptr(cell) as *const () as usize),
            Inner::Derived(derived) => derived
                .identity()
                .unwrap_or(Identity::Source(Rc::as_ptr(derived) as *const () as usize)),
        }
    }

    /// Whether both handles denote the same binding.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl<T: Clone + fmt::Debug + 'static> fmt::Debug for Binding<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding").field("value", &self.get()).finish()
    }
}

/// Write handle of a binding created by [`create_binding`].
pub struct BindingSetter<T> {
    cell: Rc<CellInner<T>>,
}

impl<T> Clone for BindingSetter<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Rc::clone(&self.cell),
        }
    }
}

impl<T: Clone + 'static> BindingSetter<T> {
    /// Replace the value and notify subscribers synchronously.
    ///
    /// Calling this from inside a notification of any binding queues the
    /// update until the current round of notifications has finished.
    pub fn set(&self, value: T) {
        self.cell.update(value);
    }

    /// Replace the value with `f(current)`.
    pub fn update(&self, f: impl FnOnce(&T) -> T) {
        let next = f(&self.cell.value.borrow());
        self.cell.update(next);
    }
}

impl<T> fmt::Debug for BindingSetter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BindingSetter(...)")
    }
}

/// Create a binding and the function that updates it.
pub fn create_binding<T: Clone + 'static>(initial: T) -> (Binding<T>, BindingSetter<T>) {
    let cell = Rc::new(CellInner {
        value: RefCell::new(initial),
        subscribers: RefCell::new(Vec::new()),
        next_subscriber: Cell::new(0),
    });
    (
        Binding {
            inner: Inner::Cell(Rc::clone(&cell)),
        },
        BindingSetter { cell },
    )
}

struct Mapped<T, U> {
    base: Binding<T>,
    transform: Rc<dyn Fn(&T) -> U>,
    identity: Option<Identity>,
}

impl<T: Clone + 'static, U: 'static> Derived<U> for Mapped<T, U> {
    fn get(&self) -> U {
        (self.transform)(&self.base.get())
    }

    fn subscribe(&self, callback: Rc<dyn Fn(&U)>) -> Subscription {
        let transform = Rc::clone(&self.transform);
        self.base.subscribe(move |value| callback(&transform(value)))
    }

    fn identity(&self) -> Option<Identity> {
        self.identity.clone()
    }
}

// ============================================================================
// Joining
// ============================================================================

/// Containers of bindings that can be joined into one binding.
pub trait JoinBindings: Clone + 'static {
    /// The container shape with every binding resolved.
    type Output: Clone + 'static;

    fn resolve(&self) -> Self::Output;

    fn subscribe_each(&self, on_change: Rc<dyn Fn()>) -> Vec<Subscription>;
}

impl<T: Clone + 'static> JoinBindings for Vec<Binding<T>> {
    type Output = Vec<T>;

    fn resolve(&self) -> Self::Output {
        self.iter().map(Binding::get).collect()
    }

    fn subscribe_each(&self, on_change: Rc<dyn Fn()>) -> Vec<Subscription> {
        self.iter()
            .map(|binding| {
                let on_change = Rc::clone(&on_change);
                binding.subscribe(move |_| on_change())
            })
            .collect()
    }
}

impl<K, T> JoinBindings for BTreeMap<K, Binding<T>>
where
    K: Ord + Clone + 'static,
    T: Clone + 'static,
{
    type Output = BTreeMap<K, T>;

    fn resolve(&self) -> Self::Output {
        self.iter().map(|(k, b)| (k.clone(), b.get())).collect()
    }

    fn subscribe_each(&self, on_change: Rc<dyn Fn()>) -> Vec<Subscription> {
        self.values()
            .map(|binding| {
                let on_change = Rc::clone(&on_change);
                binding.subscribe(move |_| on_change())
            })
            .collect()
    }
}

impl<K, T> JoinBindings for HashMap<K, Binding<T>>
where
    K: Eq + Hash + Clone + 'static,
    T: Clone + 'static,
{
    type Output = HashMap<K, T>;

    fn resolve(&self) -> Self::Output {
        self.iter().map(|(k, b)| (k.clone(), b.get())).collect()
    }

    fn subscribe_each(&self, on_change: Rc<dyn Fn()>) -> Vec<Subscription> {
        self.values()
            .map(|binding| {
                let on_change = Rc::clone(&on_change);
                binding.subscribe(move |_| on_change())
            })
            .collect()
    }
}

struct Joined<C> {
    bindings: C,
}

impl<C: JoinBindings> Derived<C::Output> for Joined<C> {
    fn get(&self) -> C::Output {
        self.bindings.resolve()
    }

    fn subscribe(&self, callback: Rc<dyn Fn(&C::Output)>) -> Subscription {
        let bindings = self.bindings.clone();
        let on_change: Rc<dyn Fn()> = Rc::new(move || callback(&bindings.resolve()));
        Subscription::group(self.bindings.subscribe_each(on_change))
    }
}

/// Combine a container of bindings into one binding of the same shape.
///
/// Reading the result re-reads every constituent. Subscribers are notified
/// whenever any constituent updates.
pub fn join_bindings<C: JoinBindings>(bindings: C) -> Binding<C::Output> {
    Binding {
        inner: Inner::Derived(Rc::new(Joined { bindings })),
    }
}
