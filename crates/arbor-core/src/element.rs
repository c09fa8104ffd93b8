//! Element types and component references.
//!
//! An [`Element`] is an immutable description of what should exist: a
//! component reference, its props and an optional key. Elements are cheap
//! to clone and compare by identity.

use std::any::{Any, TypeId};
use std::fmt;
use std::panic::Location;
use std::rc::Rc;

use crate::class::{ClassComponent, ClassRef};
use crate::context::ContextRef;
use crate::error::{Error, RenderError, Result};
use crate::host::HostId;
use crate::props::{PropValue, Props, TARGET_KEY};

/// What a render function returns.
pub type Rendered = std::result::Result<Option<Element>, RenderError>;

type RenderFn = dyn Fn(&Props) -> Rendered;

/// What makes two function components the same component.
#[derive(Clone, Copy)]
enum Identity {
    /// Every value of the render function's type.
    Type(TypeId),
    /// A plain function pointer, by address.
    Pointer(usize),
    /// A type-erased render function, by data and vtable pointer.
    Erased(*const RenderFn),
}

impl Identity {
    fn of<F: Fn(&Props) -> Rendered + 'static>(render: &F) -> Self {
        let any: &dyn Any = render;
        if let Some(pointer) = any.downcast_ref::<fn(&Props) -> Rendered>() {
            Identity::Pointer(*pointer as usize)
        } else if let Some(boxed) = any.downcast_ref::<Box<RenderFn>>() {
            Identity::Erased(&**boxed as *const RenderFn)
        } else if let Some(borrowed) = any.downcast_ref::<&'static RenderFn>() {
            Identity::Erased(*borrowed as *const RenderFn)
        } else {
            Identity::Type(TypeId::of::<F>())
        }
    }
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Identity::Type(a), Identity::Type(b)) => a == b,
            (Identity::Pointer(a), Identity::Pointer(b)) => a == b,
            (Identity::Erased(a), Identity::Erased(b)) => std::ptr::eq(*a, *b),
            _ => false,
        }
    }
}

/// A function component: a render function from props to an element.
///
/// Two function components are the same component when their render
/// functions have the same type. Re-creating the same closure on every
/// render therefore keeps the instance; the latest closure is used.
/// Function pointers and boxed or borrowed `dyn Fn` render functions share
/// a type, so they are told apart by pointer instead.
#[derive(Clone)]
pub struct FunctionComponent {
    id: Identity,
    name: &'static str,
    render: Rc<RenderFn>,
    props_equal: Option<Rc<dyn Fn(&Props, &Props) -> bool>>,
}

impl FunctionComponent {
    pub fn new<F>(render: F) -> Self
    where
        F: Fn(&Props) -> Rendered + 'static,
    {
        let id = Identity::of(&render);
        let name = match id {
            Identity::Type(_) => short_type_name(std::any::type_name::<F>()),
            Identity::Pointer(_) | Identity::Erased(_) => "Function",
        };
        Self {
            id,
            name,
            render: Rc::new(render),
            props_equal: None,
        }
    }

    /// Override the name used in errors and traces.
    pub fn named(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    /// Skip re-rendering when the new props equal the previous ones.
    ///
    /// Props are compared shallowly: values with `PropValue` equality,
    /// children by element identity. State updates and context changes
    /// still re-render.
    pub fn memo(self) -> Self {
        self.memo_with(|previous, next| previous == next)
    }

    /// Like [`memo`](Self::memo), with `props_equal(previous, next)`
    /// deciding whether the render can be skipped.
    pub fn memo_with(mut self, props_equal: impl Fn(&Props, &Props) -> bool + 'static) -> Self {
        self.props_equal = Some(Rc::new(props_equal));
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_memo(&self) -> bool {
        self.props_equal.is_some()
    }

    /// An element rendering this component.
    #[track_caller]
    pub fn element(&self, props: Props) -> Element {
        Element::new(ComponentRef::Function(self.clone()), props)
    }

    pub(crate) fn render(&self, props: &Props) -> Rendered {
        (self.render)(props)
    }

    /// Whether a memoized component may keep its last render.
    pub(crate) fn can_skip(&self, previous: &Props, next: &Props) -> bool {
        self.props_equal
            .as_ref()
            .is_some_and(|props_equal| props_equal(previous, next))
    }
}

/// A memoized function component. See [`FunctionComponent::memo`].
pub fn memo<F>(render: F) -> FunctionComponent
where
    F: Fn(&Props) -> Rendered + 'static,
{
    FunctionComponent::new(render).memo()
}

/// A context consumer: renders from the nearest provided value.
#[derive(Clone)]
pub struct ConsumerRef {
    pub(crate) context: ContextRef,
    pub(crate) render: Rc<dyn Fn(&dyn Any) -> Rendered>,
}

/// The component half of an element.
#[derive(Clone)]
pub enum ComponentRef {
    /// A leaf object created by the host, named by its class.
    Host(Rc<str>),
    Function(FunctionComponent),
    Class(ClassRef),
    /// Children spliced into the parent's child list.
    Fragment,
    /// Children rendered under the host object in the `target` prop.
    Portal,
    Provider(ContextRef),
    Consumer(ConsumerRef),
}

impl ComponentRef {
    pub fn name(&self) -> &str {
        match self {
            ComponentRef::Host(class) => class,
            ComponentRef::Function(function) => function.name,
            ComponentRef::Class(class) => class.name(),
            ComponentRef::Fragment => "Fragment",
            ComponentRef::Portal => "Portal",
            ComponentRef::Provider(_) => "Provider",
            ComponentRef::Consumer(_) => "Consumer",
        }
    }

    /// Component identity used by the reconciler.
    pub fn same_component(&self, other: &ComponentRef) -> bool {
        match (self, other) {
            (ComponentRef::Host(a), ComponentRef::Host(b)) => a == b,
            (ComponentRef::Function(a), ComponentRef::Function(b)) => a.id == b.id,
            (ComponentRef::Class(a), ComponentRef::Class(b)) => a.id() == b.id(),
            (ComponentRef::Fragment, ComponentRef::Fragment) => true,
            (ComponentRef::Portal, ComponentRef::Portal) => true,
            (ComponentRef::Provider(a), ComponentRef::Provider(b)) => a.id() == b.id(),
            (ComponentRef::Consumer(a), ComponentRef::Consumer(b)) => {
                a.context.id() == b.context.id()
            }
            _ => false,
        }
    }
}

impl fmt::Debug for ComponentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComponentRef::Host(class) => write!(f, "Host({class})"),
            other => f.write_str(other.name()),
        }
    }
}

#[derive(Clone)]
struct ElementInner {
    component: ComponentRef,
    props: Props,
    key: Option<Rc<str>>,
    source: &'static Location<'static>,
}

/// A node in the element tree.
#[derive(Clone)]
pub struct Element {
    inner: Rc<ElementInner>,
}

impl Element {
    #[track_caller]
    pub fn new(component: ComponentRef, props: Props) -> Self {
        Self {
            inner: Rc::new(ElementInner {
                component,
                props,
                key: None,
                source: Location::caller(),
            }),
        }
    }

    /// A host leaf of the given class.
    #[track_caller]
    pub fn host(class: impl Into<Rc<str>>, props: Props) -> Self {
        Self::new(ComponentRef::Host(class.into()), props)
    }

    /// A function component.
    #[track_caller]
    pub fn function<F>(render: F, props: Props) -> Self
    where
        F: Fn(&Props) -> Rendered + 'static,
    {
        Self::new(ComponentRef::Function(FunctionComponent::new(render)), props)
    }

    /// A class component.
    #[track_caller]
    pub fn class<C: ClassComponent>(props: Props) -> Self {
        Self::new(ComponentRef::Class(ClassRef::of::<C>()), props)
    }

    #[track_caller]
    pub fn fragment(children: impl IntoIterator<Item = Element>) -> Self {
        Self::new(
            ComponentRef::Fragment,
            Props::new().with_children(children),
        )
    }

    /// Render `children` into `target`, a host object the tree does not own.
    #[track_caller]
    pub fn portal(target: HostId, children: impl IntoIterator<Item = Element>) -> Self {
        Self::new(
            ComponentRef::Portal,
            Props::new()
                .with(TARGET_KEY, target)
                .with_children(children),
        )
    }

    /// Return this element with an explicit key.
    pub fn keyed(mut self, key: impl Into<Rc<str>>) -> Self {
        Rc::make_mut(&mut self.inner).key = Some(key.into());
        self
    }

    /// Return this element with its children replaced.
    pub fn with_children(mut self, children: impl IntoIterator<Item = Element>) -> Self {
        Rc::make_mut(&mut self.inner)
            .props
            .set_children(children.into_iter().collect());
        self
    }

    pub fn component(&self) -> &ComponentRef {
        &self.inner.component
    }

    pub fn props(&self) -> &Props {
        &self.inner.props
    }

    pub fn key(&self) -> Option<&Rc<str>> {
        self.inner.key.as_ref()
    }

    pub fn children(&self) -> &[Element] {
        self.inner.props.children()
    }

    /// Where the element was created.
    pub fn source(&self) -> &'static Location<'static> {
        self.inner.source
    }

    pub fn is_fragment(&self) -> bool {
        matches!(self.inner.component, ComponentRef::Fragment)
    }

    pub(crate) fn portal_target(&self) -> Option<HostId> {
        self.props().get(TARGET_KEY).and_then(PropValue::as_host)
    }

    /// Whether both handles refer to the same element value.
    pub fn ptr_eq(&self, other: &Element) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PartialEq for Element {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl fmt::Debug for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Element")
            .field("component", &self.inner.component)
            .field("key", &self.inner.key)
            .field("props", &self.inner.props)
            .finish()
    }
}

/// The single child in `children`, if any.
///
/// More than one child is an error.
pub fn one_child(children: &[Element]) -> Result<Option<Element>> {
    match children {
        [] => Ok(None),
        [only] => Ok(Some(only.clone())),
        _ => Err(Error::MultipleChildren {
            count: children.len(),
        }),
    }
}

/// Last meaningful path segment of a type name.
pub(crate) fn short_type_name(full: &'static str) -> &'static str {
    full.rsplit("::")
        .find(|segment| !segment.starts_with("{{"))
        .unwrap_or(full)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::props;

    fn leaf(_props: &Props) -> Rendered {
        Ok(None)
    }

    #[test]
    fn same_function_type_is_same_component() {
        let a = Element::function(leaf, Props::new());
        let b = Element::function(leaf, props! { "x" => 1 });
        assert!(a.component().same_component(b.component()));

        let c = Element::function(|_: &Props| Ok(None), Props::new());
        assert!(!a.component().same_component(c.component()));
    }

    fn other_leaf(_props: &Props) -> Rendered {
        Ok(Some(Element::host("Frame", Props::new())))
    }

    #[test]
    fn function_pointers_are_told_apart() {
        let pointer = |render: fn(&Props) -> Rendered| FunctionComponent::new(render);
        let a = ComponentRef::Function(pointer(leaf));
        let b = ComponentRef::Function(pointer(other_leaf));
        assert!(!a.same_component(&b));
        assert!(a.same_component(&ComponentRef::Function(pointer(leaf))));
        assert_eq!(pointer(leaf).name(), "Function");
        assert_eq!(pointer(leaf).named("Leaf").name(), "Leaf");
    }

    #[test]
    fn boxed_render_functions_are_told_apart() {
        let boxed = |render: Box<dyn Fn(&Props) -> Rendered>| FunctionComponent::new(render);
        let a = boxed(Box::new(leaf));
        let b = boxed(Box::new(other_leaf));
        let a_ref = ComponentRef::Function(a.clone());
        assert!(!a_ref.same_component(&ComponentRef::Function(b)));
        assert!(a_ref.same_component(&ComponentRef::Function(a)));
    }

    #[test]
    fn memo_compares_props_shallowly() {
        let component = memo(leaf);
        assert!(component.is_memo());
        assert!(component.can_skip(&props! { "x" => 1 }, &props! { "x" => 1 }));
        assert!(!component.can_skip(&props! { "x" => 1 }, &props! { "x" => 2 }));

        let custom = FunctionComponent::new(leaf)
            .memo_with(|a, b| a.get("id") == b.get("id"));
        assert!(custom.can_skip(&props! { "id" => 1, "x" => 1 }, &props! { "id" => 1, "x" => 2 }));
        assert!(!FunctionComponent::new(leaf).can_skip(&Props::new(), &Props::new()));
    }

    #[test]
    fn host_identity_is_the_class() {
        let a = Element::host("Frame", Props::new());
        let b = Element::host("Frame", Props::new());
        let c = Element::host("TextLabel", Props::new());
        assert!(a.component().same_component(b.component()));
        assert!(!a.component().same_component(c.component()));
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn keyed_does_not_touch_other_clones() {
        let base = Element::host("Frame", Props::new());
        let keyed = base.clone().keyed("a");
        assert_eq!(keyed.key().map(|k| &**k), Some("a"));
        assert!(base.key().is_none());
    }

    #[test]
    fn one_child_rejects_many() {
        let a = Element::host("Frame", Props::new());
        assert!(one_child(&[]).unwrap().is_none());
        assert!(one_child(std::slice::from_ref(&a)).unwrap().is_some());
        assert!(matches!(
            one_child(&[a.clone(), a]),
            Err(Error::MultipleChildren { count: 2 })
        ));
    }

    #[test]
    fn function_names_are_short() {
        assert_eq!(FunctionComponent::new(leaf).name(), "leaf");
        assert_eq!(short_type_name("a::b::{{closure}}"), "b");
    }

    #[test]
    fn source_location_is_captured() {
        let element = Element::host("Frame", Props::new());
        assert!(element.source().file().ends_with("element.rs"));
    }
}
