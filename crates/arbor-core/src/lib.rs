//! Core types and the reconciliation engine for arbor.
//!
//! Applications describe their UI as immutable [`Element`] trees. A
//! [`Reconciler`] turns those trees into a persistent instance tree and
//! drives an external object model through the [`Host`] trait, issuing only
//! the creations, property writes, reorders and destructions needed to move
//! from one description to the next.

pub mod binding;
pub mod class;
pub mod config;
pub mod context;
pub mod element;
pub mod error;
pub mod hooks;
pub mod host;
pub mod instance;
pub mod props;
pub mod reconciler;

mod scheduler;

// Re-export the element model
pub use element::{ComponentRef, Element, FunctionComponent, Rendered, memo, one_child};
pub use props::{
    Callback, HostRef, PropMap, PropValue, Props, REF_KEY, TARGET_KEY, VALUE_KEY, create_ref,
};

// Re-export bindings and contexts
pub use binding::{
    Binding, BindingSetter, JoinBindings, Subscription, create_binding, join_bindings,
};
pub use context::{Context, ContextId, create_context};

// Re-export hooks for ergonomic state management
pub use hooks::{
    Dispatch, EveryRender, HookMeta, RefHandle, StateSetter, use_binding, use_callback,
    use_context, use_effect, use_effect_cleanup, use_imperative_handle, use_layout_effect,
    use_layout_effect_cleanup, use_memo, use_mount, use_reducer, use_ref, use_state,
};

pub use class::{ClassComponent, ClassRef, ClassScope};
pub use config::Config;
pub use error::{Error, ErrorKind, RenderError, Result};
pub use host::{Host, HostError, HostId};
pub use instance::{ChildKey, InstanceId, InstanceKind, KeySegment, TreeId};
pub use reconciler::{DEFAULT_TREE_NAME, Reconciler, TreeHandle};
