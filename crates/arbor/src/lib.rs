//! Arbor - declarative component trees for retained host object models.
//!
//! Arbor keeps an external object model (a scene graph, a widget toolkit, a
//! document) in sync with a tree of immutable element descriptions. The
//! engine lives in [`arbor_core`]; this crate adds a [`Runtime`] that tracks
//! when a flush is due, and logging setup.
//!
//! # Quick Start
//!
//! ```ignore
//! use arbor::prelude::*;
//!
//! fn counter(_props: &Props) -> Rendered {
//!     let (count, set_count) = use_state(|| 0);
//!     Ok(Some(Element::host("TextButton", props! {
//!         "Text" => format!("Clicked {count} times"),
//!         "Activated" => Callback::new(move |_| set_count.update(|n| n + 1)),
//!     })))
//! }
//!
//! fn main() -> arbor::Result<()> {
//!     arbor::init_tracing();
//!     let mut runtime = Runtime::new(MemoryHost::new());
//!     let root = runtime.host_mut().create_external("Folder", "Screen");
//!     runtime.mount(Element::function(counter, Props::new()), Some(root), None)?;
//!     // ... later, after host events:
//!     runtime.run_pending()?;
//!     Ok(())
//! }
//! ```
//!
//! # State Management with Hooks
//!
//! Function components keep state across renders through hooks. See the
//! [`arbor_core::hooks`] module for the full documentation.
//!
//! | Hook | Purpose |
//! |------|---------|
//! | [`use_state`] | State with a `(value, setter)` tuple |
//! | [`use_reducer`] | State changed through dispatched actions |
//! | [`use_ref`] | Mutable value that never triggers a re-render |
//! | [`use_binding`] | Binding owned by the instance |
//! | [`use_effect`] | Side effects when dependencies change |
//! | [`use_effect_cleanup`] | Effects with cleanup functions |
//! | [`use_layout_effect`] | Effects run before passive effects |
//! | [`use_mount`] | One-time effect after the first commit |
//! | [`use_memo`] | Memoized computations |
//! | [`use_callback`] | Memoized callbacks |
//! | [`use_context`] | Value of the nearest context provider |
//! | [`use_imperative_handle`] | Value exposed through a parent's ref |
//!
//! ## Rules of Hooks
//!
//! Hooks must be called in the **same order** on every render:
//!
//! - Call hooks at the top level of the component function
//! - Don't call hooks inside conditionals, loops or after early returns
//! - Don't call hooks in event handlers
//!
//! A render that breaks the order fails with
//! [`Error::HookOrderMismatch`] or [`Error::HookCountMismatch`].
//!
//! # Skipping Renders
//!
//! Wrap a render function in [`memo`](prelude::memo) to skip re-rendering
//! when its props have not changed.
//!
//! [`use_state`]: prelude::use_state
//! [`use_reducer`]: prelude::use_reducer
//! [`use_ref`]: prelude::use_ref
//! [`use_binding`]: prelude::use_binding
//! [`use_effect`]: prelude::use_effect
//! [`use_effect_cleanup`]: prelude::use_effect_cleanup
//! [`use_layout_effect`]: prelude::use_layout_effect
//! [`use_mount`]: prelude::use_mount
//! [`use_memo`]: prelude::use_memo
//! [`use_callback`]: prelude::use_callback
//! [`use_context`]: prelude::use_context
//! [`use_imperative_handle`]: prelude::use_imperative_handle

pub mod runtime;

pub mod prelude {
    //! Common imports for arbor applications.
    pub use crate::runtime::{FlushRequest, Runtime};
    pub use arbor_core::element::*;
    pub use arbor_core::host::{Host, HostId, MemoryHost};
    pub use arbor_core::props;
    pub use arbor_core::props::{Callback, HostRef, PropValue, Props, create_ref};
    pub use arbor_core::{Binding, BindingSetter, create_binding, join_bindings};
    pub use arbor_core::{ClassComponent, ClassScope, Context, create_context};
    // Hooks for ergonomic state management
    pub use arbor_core::{
        EveryRender, RefHandle, StateSetter, use_binding, use_callback, use_context, use_effect,
        use_effect_cleanup, use_imperative_handle, use_layout_effect, use_layout_effect_cleanup,
        use_memo, use_mount, use_reducer, use_ref, use_state,
    };
}

// Re-export core types at crate root
pub use arbor_core::{
    Config, Element, Error, ErrorKind, Host, HostError, HostId, Reconciler, RenderError, Result,
    TreeHandle,
};
pub use runtime::{FlushRequest, Runtime};

pub use arbor_core as core;

/// Install a `tracing-subscriber` formatter for the engine's events.
///
/// Safe to call more than once; later calls do nothing.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt::try_init();
}
