//! The host object model contract.
//!
//! The reconciler never creates UI objects itself. It drives an
//! implementation of [`Host`], which owns the real objects and hands back
//! opaque [`HostId`]s. [`MemoryHost`] is an in-memory implementation that
//! records every call, used for testing and headless runs.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

use crate::props::{PropMap, PropValue};

/// Opaque handle to a host object.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct HostId(pub u64);

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Errors a host may report.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    #[error("unknown host class `{0}`")]
    UnknownClass(String),
    #[error("host object {0} does not exist")]
    MissingObject(HostId),
    #[error("host object {id} rejected property `{key}`: {reason}")]
    Property {
        id: HostId,
        key: String,
        reason: String,
    },
    #[error("{0}")]
    Other(String),
}

/// Capabilities the reconciler needs from the host object model.
pub trait Host {
    /// Create a detached object of the given class with its initial
    /// properties already resolved (bindings replaced by their values).
    fn create(&mut self, class: &str, name: &str, props: &PropMap) -> Result<HostId, HostError>;

    /// Set one property. `PropValue::Nil` resets it.
    fn set_property(&mut self, id: HostId, key: &str, value: &PropValue) -> Result<(), HostError>;

    /// Destroy an object. Its children have already been destroyed.
    fn destroy(&mut self, id: HostId);

    /// Attach `child` under `parent` so that it ends up at `position`
    /// among the parent's children. Attaching an already attached child
    /// moves it.
    fn attach_child(&mut self, parent: HostId, child: HostId, position: usize)
    -> Result<(), HostError>;

    /// Detach `child` from `parent`.
    fn detach_child(&mut self, parent: HostId, child: HostId);
}

/// One recorded call against a [`MemoryHost`].
#[derive(Debug, Clone, PartialEq)]
pub enum HostCall {
    Create {
        id: HostId,
        class: String,
        name: String,
        props: PropMap,
    },
    SetProperty {
        id: HostId,
        key: String,
        value: PropValue,
    },
    Destroy {
        id: HostId,
    },
    Attach {
        parent: HostId,
        child: HostId,
        position: usize,
    },
    Detach {
        parent: HostId,
        child: HostId,
    },
}

/// A live object inside a [`MemoryHost`].
#[derive(Debug, Clone)]
pub struct HostObject {
    pub class: String,
    pub name: String,
    pub props: PropMap,
    pub parent: Option<HostId>,
    pub children: Vec<HostId>,
}

/// Recording in-memory host.
#[derive(Debug, Default)]
pub struct MemoryHost {
    next_id: u64,
    objects: BTreeMap<HostId, HostObject>,
    calls: Vec<HostCall>,
}

impl MemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an object that the reconciler does not own, such as a mount
    /// parent or a portal target. Not recorded in the call log.
    pub fn create_external(&mut self, class: &str, name: &str) -> HostId {
        let id = self.allocate();
        self.objects.insert(
            id,
            HostObject {
                class: class.to_string(),
                name: name.to_string(),
                props: PropMap::new(),
                parent: None,
                children: Vec::new(),
            },
        );
        id
    }

    /// Calls recorded so far.
    pub fn calls(&self) -> &[HostCall] {
        &self.calls
    }

    /// Drain the call log.
    pub fn take_calls(&mut self) -> Vec<HostCall> {
        std::mem::take(&mut self.calls)
    }

    pub fn object(&self, id: HostId) -> Option<&HostObject> {
        self.objects.get(&id)
    }

    pub fn children(&self, id: HostId) -> Vec<HostId> {
        self.objects
            .get(&id)
            .map(|object| object.children.clone())
            .unwrap_or_default()
    }

    /// Names of the children of `id`, in order.
    pub fn child_names(&self, id: HostId) -> Vec<String> {
        self.children(id)
            .into_iter()
            .filter_map(|child| self.objects.get(&child).map(|o| o.name.clone()))
            .collect()
    }

    pub fn prop(&self, id: HostId, key: &str) -> Option<&PropValue> {
        self.objects.get(&id).and_then(|object| object.props.get(key))
    }

    pub fn is_live(&self, id: HostId) -> bool {
        self.objects.contains_key(&id)
    }

    /// Number of live objects, external ones included.
    pub fn live_count(&self) -> usize {
        self.objects.len()
    }

    fn allocate(&mut self) -> HostId {
        self.next_id += 1;
        HostId(self.next_id)
    }

    fn object_mut(&mut self, id: HostId) -> Result<&mut HostObject, HostError> {
        self.objects.get_mut(&id).ok_or(HostError::MissingObject(id))
    }

    fn unlink(&mut self, child: HostId) {
        let parent = self.objects.get_mut(&child).and_then(|o| o.parent.take());
        if let Some(parent) = parent.and_then(|p| self.objects.get_mut(&p)) {
            parent.children.retain(|c| *c != child);
        }
    }
}

impl Host for MemoryHost {
    fn create(&mut self, class: &str, name: &str, props: &PropMap) -> Result<HostId, HostError> {
        if class.is_empty() {
            return Err(HostError::UnknownClass(class.to_string()));
        }
        let id = self.allocate();
        self.objects.insert(
            id,
            HostObject {
                class: class.to_string(),
                name: name.to_string(),
                props: props.clone(),
                parent: None,
                children: Vec::new(),
            },
        );
        self.calls.push(HostCall::Create {
            id,
            class: class.to_string(),
            name: name.to_string(),
            props: props.clone(),
        });
        Ok(id)
    }

    fn set_property(&mut self, id: HostId, key: &str, value: &PropValue) -> Result<(), HostError> {
        let object = self.object_mut(id)?;
        if value.is_nil() {
            object.props.remove(key);
        } else {
            object.props.insert(key.into(), value.clone());
        }
        self.calls.push(HostCall::SetProperty {
            id,
            key: key.to_string(),
            value: value.clone(),
        });
        Ok(())
    }

    fn destroy(&mut self, id: HostId) {
        self.unlink(id);
        if let Some(object) = self.objects.remove(&id) {
            for child in object.children {
                if let Some(child) = self.objects.get_mut(&child) {
                    child.parent = None;
                }
            }
        }
        self.calls.push(HostCall::Destroy { id });
    }

    fn attach_child(
        &mut self,
        parent: HostId,
        child: HostId,
        position: usize,
    ) -> Result<(), HostError> {
        if !self.objects.contains_key(&child) {
            return Err(HostError::MissingObject(child));
        }
        self.object_mut(parent)?;
        self.unlink(child);
        let siblings = &mut self.object_mut(parent)?.children;
        let position = position.min(siblings.len());
        siblings.insert(position, child);
        self.object_mut(child)?.parent = Some(parent);
        self.calls.push(HostCall::Attach {
            parent,
            child,
            position,
        });
        Ok(())
    }

    fn detach_child(&mut self, parent: HostId, child: HostId) {
        if let Some(object) = self.objects.get_mut(&child)
            && object.parent == Some(parent)
        {
            self.unlink(child);
        }
        self.calls.push(HostCall::Detach { parent, child });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_moves_existing_child() {
        let mut host = MemoryHost::new();
        let root = host.create_external("Folder", "root");
        let a = host.create("Frame", "a", &PropMap::new()).unwrap();
        let b = host.create("Frame", "b", &PropMap::new()).unwrap();

        host.attach_child(root, a, 0).unwrap();
        host.attach_child(root, b, 1).unwrap();
        assert_eq!(host.children(root), vec![a, b]);

        host.attach_child(root, b, 0).unwrap();
        assert_eq!(host.children(root), vec![b, a]);
        assert_eq!(host.child_names(root), vec!["b", "a"]);
    }

    #[test]
    fn destroy_unlinks_from_parent() {
        let mut host = MemoryHost::new();
        let root = host.create_external("Folder", "root");
        let a = host.create("Frame", "a", &PropMap::new()).unwrap();
        host.attach_child(root, a, 0).unwrap();

        host.destroy(a);
        assert!(host.children(root).is_empty());
        assert!(!host.is_live(a));
        assert_eq!(host.live_count(), 1);
    }

    #[test]
    fn external_objects_are_not_logged() {
        let mut host = MemoryHost::new();
        host.create_external("Folder", "root");
        assert!(host.calls().is_empty());
    }

    #[test]
    fn nil_resets_property() {
        let mut host = MemoryHost::new();
        let a = host.create("Frame", "a", &PropMap::new()).unwrap();
        host.set_property(a, "Size", &PropValue::Int(3)).unwrap();
        assert_eq!(host.prop(a, "Size"), Some(&PropValue::Int(3)));
        host.set_property(a, "Size", &PropValue::Nil).unwrap();
        assert_eq!(host.prop(a, "Size"), None);
    }
}
