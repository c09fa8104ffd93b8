//! Context: values broadcast down the tree.
//!
//! A provider element makes a value visible to its whole subtree. Consumers
//! (the [`use_context`](crate::hooks::use_context) hook or
//! [`Context::consumer`] elements) read the value of the nearest enclosing
//! provider, found on the provider stack the reconciler maintains while it
//! walks the tree top-down. Nested providers of the same context shadow
//! outer ones.
//!
//! # Example
//!
//! ```ignore
//! let theme = create_context(String::from("light"));
//!
//! let toolbar = {
//!     let theme = theme.clone();
//!     move |_: &Props| {
//!         let current = use_context(&theme);
//!         Ok(Some(Element::host("TextLabel", props! { "Text" => current })))
//!     }
//! };
//! let app = theme.provider("dark".into(), [Element::function(toolbar, Props::new())]);
//! ```

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::element::{ComponentRef, ConsumerRef, Element, Rendered};
use crate::instance::InstanceId;
use crate::props::{PropValue, Props, VALUE_KEY};

/// Unique identifier of a context.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct ContextId(u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(0);

struct ContextShared {
    id: ContextId,
    name: &'static str,
    default: Rc<dyn Any>,
    same_value: fn(&dyn Any, &dyn Any) -> bool,
    accepts: fn(&dyn Any) -> bool,
}

/// Type-erased context identity carried by provider and consumer elements.
#[derive(Clone)]
pub struct ContextRef(Rc<ContextShared>);

impl ContextRef {
    pub fn id(&self) -> ContextId {
        self.0.id
    }

    pub fn name(&self) -> &'static str {
        self.0.name
    }

    pub(crate) fn default_value(&self) -> Rc<dyn Any> {
        Rc::clone(&self.0.default)
    }

    /// Whether two provided values are equal.
    pub(crate) fn same_value(&self, a: &dyn Any, b: &dyn Any) -> bool {
        (self.0.same_value)(a, b)
    }

    /// Whether `value` has this context's value type.
    pub(crate) fn accepts(&self, value: &dyn Any) -> bool {
        (self.0.accepts)(value)
    }
}

impl fmt::Debug for ContextRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextRef")
            .field("id", &self.0.id)
            .field("name", &self.0.name)
            .finish()
    }
}

fn same_value<T: PartialEq + 'static>(a: &dyn Any, b: &dyn Any) -> bool {
    match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn accepts<T: 'static>(value: &dyn Any) -> bool {
    value.is::<T>()
}

/// A typed context.
pub struct Context<T> {
    shared: ContextRef,
    default: Rc<T>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Context<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            default: Rc::clone(&self.default),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Context<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Context").field(&self.shared).finish()
    }
}

/// Create a new context with a default value used when no provider is
/// found above a consumer.
pub fn create_context<T: Clone + PartialEq + 'static>(default: T) -> Context<T> {
    let default = Rc::new(default);
    let erased: Rc<dyn Any> = default.clone();
    Context {
        shared: ContextRef(Rc::new(ContextShared {
            id: ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::SeqCst)),
            name: crate::element::short_type_name(std::any::type_name::<T>()),
            default: erased,
            same_value: same_value::<T>,
            accepts: accepts::<T>,
        })),
        default,
        _marker: PhantomData,
    }
}

impl<T: Clone + PartialEq + 'static> Context<T> {
    pub fn id(&self) -> ContextId {
        self.shared.id()
    }

    pub fn default_value(&self) -> T {
        (*self.default).clone()
    }

    /// Provide `value` to every consumer in `children`.
    #[track_caller]
    pub fn provider(&self, value: T, children: impl IntoIterator<Item = Element>) -> Element {
        let value: Rc<dyn Any> = Rc::new(value);
        Element::new(
            ComponentRef::Provider(self.shared.clone()),
            Props::new()
                .with(VALUE_KEY, PropValue::Any(value))
                .with_children(children),
        )
    }

    /// An element that renders from the current value of this context.
    #[track_caller]
    pub fn consumer<F>(&self, render: F) -> Element
    where
        F: Fn(&T) -> Rendered + 'static,
    {
        let default = Rc::clone(&self.default);
        let render = move |value: &dyn Any| match value.downcast_ref::<T>() {
            Some(value) => render(value),
            None => render(&default),
        };
        Element::new(
            ComponentRef::Consumer(ConsumerRef {
                context: self.shared.clone(),
                render: Rc::new(render),
            }),
            Props::new(),
        )
    }

    /// Read a provided value, falling back to the default.
    pub(crate) fn read(&self, provided: Option<&ProvidedValue>) -> T {
        provided
            .and_then(|p| p.value.downcast_ref::<T>())
            .cloned()
            .unwrap_or_else(|| self.default_value())
    }
}

/// A value made visible by a provider instance.
#[derive(Clone)]
pub(crate) struct ProvidedValue {
    pub context: ContextId,
    pub provider: InstanceId,
    pub value: Rc<dyn Any>,
}

/// Active providers along the path currently being rendered, outermost
/// first.
#[derive(Clone, Default)]
pub(crate) struct ContextStack {
    frames: Vec<ProvidedValue>,
}

impl ContextStack {
    pub fn push(&mut self, frame: ProvidedValue) {
        self.frames.push(frame);
    }

    pub fn pop(&mut self) {
        self.frames.pop();
    }

    /// Nearest provided value for `context`.
    pub fn resolve(&self, context: ContextId) -> Option<&ProvidedValue> {
        self.frames.iter().rev().find(|f| f.context == context)
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}
