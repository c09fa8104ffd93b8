//! Stateful class components.
//!
//! A class component is a type implementing [`ClassComponent`]. The
//! reconciler constructs it on mount, keeps it for the instance's whole
//! life, and drives the lifecycle methods:
//!
//! - mount: `init`, `derive_state`, `render`, then `did_mount` after commit
//! - update: `derive_state`, `should_update`, `will_update`, `render`, then
//!   `did_update` after commit
//! - unmount: `will_unmount`, before the subtree is torn down
//!
//! `did_mount` and `did_update` run in the layout phase, children before
//! parents.

use std::any::TypeId;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::element::{Rendered, short_type_name};
use crate::hooks::StateSetter;
use crate::props::Props;
use crate::scheduler::ScheduleHandle;

/// What lifecycle methods see of their instance.
pub struct ClassScope<'a, C: ClassComponent> {
    props: &'a Props,
    state: &'a C::State,
    setter: &'a StateSetter<C::State>,
}

impl<C: ClassComponent> ClassScope<'_, C> {
    pub fn props(&self) -> &Props {
        self.props
    }

    pub fn state(&self) -> &C::State {
        self.state
    }

    /// Queue a state replacement.
    pub fn set_state(&self, state: C::State) {
        self.setter.set(state);
    }

    /// Queue a state change computed from the state at flush time.
    pub fn update_state(&self, f: impl FnOnce(&C::State) -> C::State + 'static) {
        self.setter.update(f);
    }

    /// A setter that can be moved into callbacks.
    pub fn setter(&self) -> StateSetter<C::State> {
        self.setter.clone()
    }
}

/// A stateful component.
///
/// # Example
///
/// ```ignore
/// struct Toggle;
///
/// impl ClassComponent for Toggle {
///     type State = bool;
///
///     fn init(_props: &Props) -> (Self, bool) {
///         (Toggle, false)
///     }
///
///     fn render(&self, scope: &ClassScope<'_, Self>) -> Rendered {
///         let setter = scope.setter();
///         Ok(Some(Element::host("TextButton", props! {
///             "Text" => if *scope.state() { "on" } else { "off" },
///             "Activated" => Callback::new(move |_| setter.update(|on| !on)),
///         })))
///     }
/// }
/// ```
pub trait ClassComponent: Sized + 'static {
    type State: Clone + PartialEq + 'static;

    /// Shallow-compare props and state in the default `should_update`.
    const PURE: bool = false;

    fn name() -> &'static str {
        short_type_name(std::any::type_name::<Self>())
    }

    /// Props filled in when the element does not set them.
    fn default_props() -> Props {
        Props::new()
    }

    /// Checked on mount and on every props change when prop validation is
    /// enabled.
    fn validate_props(_props: &Props) -> Result<(), String> {
        Ok(())
    }

    fn init(props: &Props) -> (Self, Self::State);

    /// State derived from props, applied before every render.
    fn derive_state(&self, _props: &Props, _state: &Self::State) -> Option<Self::State> {
        None
    }

    fn render(&self, scope: &ClassScope<'_, Self>) -> Rendered;

    fn should_update(
        &self,
        scope: &ClassScope<'_, Self>,
        next_props: &Props,
        next_state: &Self::State,
    ) -> bool {
        !Self::PURE || scope.props() != next_props || scope.state() != next_state
    }

    fn will_update(
        &mut self,
        _scope: &ClassScope<'_, Self>,
        _next_props: &Props,
        _next_state: &Self::State,
    ) {
    }

    fn did_mount(&mut self, _scope: &ClassScope<'_, Self>) {}

    fn did_update(
        &mut self,
        _scope: &ClassScope<'_, Self>,
        _prev_props: &Props,
        _prev_state: &Self::State,
    ) {
    }

    fn will_unmount(&mut self, _scope: &ClassScope<'_, Self>) {}
}

/// Type-erased class identity stored in elements.
#[derive(Clone)]
pub struct ClassRef {
    id: TypeId,
    name: &'static str,
    construct: fn(&Props, ScheduleHandle, bool) -> Result<Box<dyn ErasedClass>, String>,
}

impl ClassRef {
    pub fn of<C: ClassComponent>() -> Self {
        Self {
            id: TypeId::of::<C>(),
            name: C::name(),
            construct: construct::<C>,
        }
    }

    pub fn id(&self) -> TypeId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn construct(
        &self,
        props: &Props,
        schedule: ScheduleHandle,
        validate: bool,
    ) -> Result<Box<dyn ErasedClass>, String> {
        (self.construct)(props, schedule, validate)
    }
}

impl fmt::Debug for ClassRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ClassRef").field(&self.name).finish()
    }
}

/// Lifecycle surface the reconciler drives.
pub(crate) trait ErasedClass {
    /// Take new props (or `None` for a state-only update) and pending
    /// state. Returns whether the component wants to render.
    fn receive(&mut self, next_props: Option<&Props>, validate: bool) -> Result<bool, String>;
    fn render(&self) -> Rendered;
    fn did_mount(&mut self);
    fn did_update(&mut self);
    fn will_unmount(&mut self);
}

struct ClassInstance<C: ClassComponent> {
    component: C,
    props: Props,
    /// Committed state.
    state: C::State,
    /// State setters write into.
    pending: Rc<RefCell<C::State>>,
    setter: StateSetter<C::State>,
    previous: Option<(Props, C::State)>,
}

fn construct<C: ClassComponent>(
    props: &Props,
    schedule: ScheduleHandle,
    validate: bool,
) -> Result<Box<dyn ErasedClass>, String> {
    let props = props.with_defaults(&C::default_props());
    if validate {
        C::validate_props(&props)?;
    }
    let (component, mut state) = C::init(&props);
    if let Some(derived) = component.derive_state(&props, &state) {
        state = derived;
    }
    let pending = Rc::new(RefCell::new(state.clone()));
    let setter = StateSetter::new(&pending, schedule);
    Ok(Box::new(ClassInstance {
        component,
        props,
        state,
        pending,
        setter,
        previous: None,
    }))
}

impl<C: ClassComponent> ErasedClass for ClassInstance<C> {
    fn receive(&mut self, next_props: Option<&Props>, validate: bool) -> Result<bool, String> {
        let next_props = match next_props {
            Some(props) => {
                let props = props.with_defaults(&C::default_props());
                if validate {
                    C::validate_props(&props)?;
                }
                props
            }
            None => self.props.clone(),
        };

        let mut next_state = self.pending.borrow().clone();
        if let Some(derived) = self.component.derive_state(&next_props, &next_state) {
            *self.pending.borrow_mut() = derived.clone();
            next_state = derived;
        }

        let scope = ClassScope {
            props: &self.props,
            state: &self.state,
            setter: &self.setter,
        };
        let render = self.component.should_update(&scope, &next_props, &next_state);
        if render {
            self.component.will_update(&scope, &next_props, &next_state);
        }

        let prev_props = std::mem::replace(&mut self.props, next_props);
        let prev_state = std::mem::replace(&mut self.state, next_state);
        self.previous = render.then_some((prev_props, prev_state));
        Ok(render)
    }

    fn render(&self) -> Rendered {
        self.component.render(&ClassScope {
            props: &self.props,
            state: &self.state,
            setter: &self.setter,
        })
    }

    fn did_mount(&mut self) {
        let scope = ClassScope {
            props: &self.props,
            state: &self.state,
            setter: &self.setter,
        };
        self.component.did_mount(&scope);
    }

    fn did_update(&mut self) {
        if let Some((prev_props, prev_state)) = self.previous.take() {
            let scope = ClassScope {
                props: &self.props,
                state: &self.state,
                setter: &self.setter,
            };
            self.component.did_update(&scope, &prev_props, &prev_state);
        }
    }

    fn will_unmount(&mut self) {
        let scope = ClassScope {
            props: &self.props,
            state: &self.state,
            setter: &self.setter,
        };
        self.component.will_unmount(&scope);
    }
}
