//! Property values, property maps, callbacks and host refs.

use std::any::Any;
use std::cell::Cell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use crate::binding::Binding;
use crate::element::Element;
use crate::host::HostId;

/// Ordered map of property names to values.
pub type PropMap = BTreeMap<Rc<str>, PropValue>;

/// Key of the host ref property.
pub const REF_KEY: &str = "ref";
/// Key of the portal target property.
pub const TARGET_KEY: &str = "target";
/// Key of the context provider value property.
pub const VALUE_KEY: &str = "value";

/// A single property value.
///
/// Scalars compare by value. Bindings, refs, callbacks and opaque values
/// compare by identity, so replacing one with a fresh but equivalent value
/// counts as a change.
#[derive(Clone, Default)]
pub enum PropValue {
    #[default]
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    Host(HostId),
    Binding(Binding<PropValue>),
    Ref(HostRef),
    Callback(Callback),
    Any(Rc<dyn Any>),
}

impl PropValue {
    pub fn is_nil(&self) -> bool {
        matches!(self, PropValue::Nil)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropValue::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            PropValue::Int(value) => Some(*value),
            _ => None,
        }
    }

    /// Floats, or integers widened to floats.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            PropValue::Float(value) => Some(*value),
            PropValue::Int(value) => Some(*value as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropValue::Str(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_host(&self) -> Option<HostId> {
        match self {
            PropValue::Host(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_binding(&self) -> Option<&Binding<PropValue>> {
        match self {
            PropValue::Binding(binding) => Some(binding),
            _ => None,
        }
    }

    pub fn as_ref_handle(&self) -> Option<&HostRef> {
        match self {
            PropValue::Ref(handle) => Some(handle),
            _ => None,
        }
    }

    pub fn as_callback(&self) -> Option<&Callback> {
        match self {
            PropValue::Callback(callback) => Some(callback),
            _ => None,
        }
    }

    /// Downcast an opaque value.
    pub fn downcast<T: 'static>(&self) -> Option<&T> {
        match self {
            PropValue::Any(value) => value.downcast_ref::<T>(),
            _ => None,
        }
    }

    /// The value a host should see: bindings are read, everything else is
    /// passed through.
    pub fn resolve(&self) -> PropValue {
        match self {
            PropValue::Binding(binding) => binding.get(),
            other => other.clone(),
        }
    }
}

impl PartialEq for PropValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (PropValue::Nil, PropValue::Nil) => true,
            (PropValue::Bool(a), PropValue::Bool(b)) => a == b,
            (PropValue::Int(a), PropValue::Int(b)) => a == b,
            (PropValue::Float(a), PropValue::Float(b)) => a == b,
            (PropValue::Str(a), PropValue::Str(b)) => a == b,
            (PropValue::Host(a), PropValue::Host(b)) => a == b,
            (PropValue::Binding(a), PropValue::Binding(b)) => a.ptr_eq(b),
            (PropValue::Ref(a), PropValue::Ref(b)) => a.ptr_eq(b),
            (PropValue::Callback(a), PropValue::Callback(b)) => a.ptr_eq(b),
            (PropValue::Any(a), PropValue::Any(b)) => {
                std::ptr::addr_eq(Rc::as_ptr(a), Rc::as_ptr(b))
            }
            _ => false,
        }
    }
}

impl fmt::Debug for PropValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropValue::Nil => f.write_str("Nil"),
            PropValue::Bool(value) => write!(f, "Bool({value})"),
            PropValue::Int(value) => write!(f, "Int({value})"),
            PropValue::Float(value) => write!(f, "Float({value})"),
            PropValue::Str(value) => write!(f, "Str({value:?})"),
            PropValue::Host(id) => write!(f, "Host({id})"),
            PropValue::Binding(binding) => f.debug_tuple("Binding").field(binding).finish(),
            PropValue::Ref(handle) => f.debug_tuple("Ref").field(handle).finish(),
            PropValue::Callback(_) => f.write_str("Callback(...)"),
            PropValue::Any(_) => f.write_str("Any(...)"),
        }
    }
}

impl From<bool> for PropValue {
    fn from(value: bool) -> Self {
        PropValue::Bool(value)
    }
}

impl From<i32> for PropValue {
    fn from(value: i32) -> Self {
        PropValue::Int(value.into())
    }
}

impl From<i64> for PropValue {
    fn from(value: i64) -> Self {
        PropValue::Int(value)
    }
}

impl From<u32> for PropValue {
    fn from(value: u32) -> Self {
        PropValue::Int(value.into())
    }
}

impl From<f32> for PropValue {
    fn from(value: f32) -> Self {
        PropValue::Float(value.into())
    }
}

impl From<f64> for PropValue {
    fn from(value: f64) -> Self {
        PropValue::Float(value)
    }
}

impl From<&str> for PropValue {
    fn from(value: &str) -> Self {
        PropValue::Str(value.into())
    }
}

impl From<String> for PropValue {
    fn from(value: String) -> Self {
        PropValue::Str(value.into())
    }
}

impl From<Rc<str>> for PropValue {
    fn from(value: Rc<str>) -> Self {
        PropValue::Str(value)
    }
}

impl From<HostId> for PropValue {
    fn from(value: HostId) -> Self {
        PropValue::Host(value)
    }
}

impl From<HostRef> for PropValue {
    fn from(value: HostRef) -> Self {
        PropValue::Ref(value)
    }
}

impl From<Callback> for PropValue {
    fn from(value: Callback) -> Self {
        PropValue::Callback(value)
    }
}

impl<T> From<Binding<T>> for PropValue
where
    T: Into<PropValue> + Clone + 'static,
{
    fn from(binding: Binding<T>) -> Self {
        PropValue::Binding(binding.convert())
    }
}

impl<T: Into<PropValue>> From<Option<T>> for PropValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(PropValue::Nil, Into::into)
    }
}

/// Callback passed through props, typically an event handler for the host.
///
/// Uses `Rc` for `Clone` support; equality is identity.
#[derive(Clone)]
pub struct Callback(pub Rc<dyn Fn(&[PropValue])>);

impl Callback {
    pub fn new<F: Fn(&[PropValue]) + 'static>(f: F) -> Self {
        Self(Rc::new(f))
    }

    pub fn invoke(&self, args: &[PropValue]) {
        (self.0)(args)
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        std::ptr::addr_eq(Rc::as_ptr(&self.0), Rc::as_ptr(&other.0))
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Callback(...)")
    }
}

/// Shared slot that receives the host object of the element it is
/// attached to through the `ref` prop.
#[derive(Clone, Default)]
pub struct HostRef {
    current: Rc<Cell<Option<HostId>>>,
}

impl HostRef {
    /// The host object currently bound to this ref.
    pub fn get(&self) -> Option<HostId> {
        self.current.get()
    }

    pub(crate) fn set(&self, id: Option<HostId>) {
        self.current.set(id);
    }

    /// Clear the ref if it still points at `id`.
    pub(crate) fn release(&self, id: HostId) {
        if self.current.get() == Some(id) {
            self.current.set(None);
        }
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.current, &other.current)
    }
}

impl fmt::Debug for HostRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostRef")
            .field("current", &self.current.get())
            .finish()
    }
}

/// Create an empty host ref.
pub fn create_ref() -> HostRef {
    HostRef::default()
}

/// Properties of an element: named values plus ordered children.
#[derive(Clone, Default, PartialEq)]
pub struct Props {
    values: PropMap,
    children: Vec<Element>,
}

impl Props {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<Rc<str>>, value: impl Into<PropValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn with_children(mut self, children: impl IntoIterator<Item = Element>) -> Self {
        self.children = children.into_iter().collect();
        self
    }

    pub fn insert(&mut self, key: impl Into<Rc<str>>, value: impl Into<PropValue>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<PropValue> {
        self.values.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&PropValue> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn values(&self) -> &PropMap {
        &self.values
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Rc<str>, &PropValue)> {
        self.values.iter()
    }

    pub fn children(&self) -> &[Element] {
        &self.children
    }

    pub fn set_children(&mut self, children: Vec<Element>) {
        self.children = children;
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.children.is_empty()
    }

    /// Fill in keys missing from `self` with values from `defaults`.
    pub fn with_defaults(&self, defaults: &Props) -> Props {
        let mut merged = self.clone();
        for (key, value) in &defaults.values {
            merged
                .values
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        if merged.children.is_empty() {
            merged.children = defaults.children.clone();
        }
        merged
    }
}

impl fmt::Debug for Props {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Props")
            .field("values", &self.values)
            .field("children", &self.children.len())
            .finish()
    }
}

/// Build [`Props`] from `key => value` pairs.
///
/// ```ignore
/// let props = props! { "Text" => "hello", "Size" => 12 };
/// ```
#[macro_export]
macro_rules! props {
    () => {
        $crate::Props::new()
    };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut props = $crate::Props::new();
        $( props.insert($key, $value); )+
        props
    }};
}
