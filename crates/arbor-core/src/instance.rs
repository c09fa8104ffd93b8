//! The persistent instance tree.
//!
//! Instances live in a generational arena owned by the reconciler. Children
//! are owned through their parent's ordered `children` list; the `parent`
//! link is a plain id used for traversal only.

use std::any::Any;
use std::collections::BTreeSet;
use std::fmt;
use std::rc::Rc;

use crate::binding::Subscription;
use crate::class::ErasedClass;
use crate::context::ContextId;
use crate::element::Element;
use crate::hooks::HookState;
use crate::host::HostId;
use crate::props::HostRef;

/// Identifier of a mounted instance.
///
/// Ids are never reused for a different instance: a freed slot gets a new
/// generation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct InstanceId {
    index: u32,
    generation: u32,
}

impl InstanceId {
    pub(crate) fn from_raw(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

/// Identifier of a mounted tree.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct TreeId(pub(crate) u64);

impl fmt::Display for TreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tree-{}", self.0)
    }
}

/// One segment of a child key.
#[derive(Clone, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub enum KeySegment {
    Named(Rc<str>),
    Index(usize),
}

impl fmt::Display for KeySegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySegment::Named(name) => f.write_str(name),
            KeySegment::Index(index) => write!(f, "{index}"),
        }
    }
}

/// Key of an instance among its siblings.
///
/// Children of a fragment are keyed under the fragment's own key, so the
/// key is a path rather than a single segment.
#[derive(Clone, PartialEq, Eq, Hash, Debug, PartialOrd, Ord, Default)]
pub struct ChildKey(Vec<KeySegment>);

impl ChildKey {
    pub(crate) fn single(segment: KeySegment) -> Self {
        Self(vec![segment])
    }

    pub(crate) fn join(&self, segment: KeySegment) -> Self {
        let mut path = self.0.clone();
        path.push(segment);
        Self(path)
    }

    pub fn segments(&self) -> &[KeySegment] {
        &self.0
    }
}

impl fmt::Display for ChildKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            write!(f, "{segment}")?;
        }
        Ok(())
    }
}

/// Kind of a mounted instance, for introspection.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InstanceKind {
    Host,
    Function,
    Class,
    Fragment,
    Portal,
    Provider,
    Consumer,
}

pub(crate) struct HostNode {
    pub id: HostId,
    /// Live subscriptions for binding-valued props, by prop key.
    pub bindings: Vec<(Rc<str>, Subscription)>,
    pub host_ref: Option<HostRef>,
}

pub(crate) struct ProviderNode {
    pub context: ContextId,
    pub value: Rc<dyn Any>,
    /// Instances that read this provider during their last render.
    pub subscribers: BTreeSet<InstanceId>,
}

pub(crate) enum NodeKind {
    Host(HostNode),
    Function(HookState),
    Class(Box<dyn ErasedClass>),
    Fragment,
    /// Children go under this external object, if one was given.
    Portal(Option<HostId>),
    Provider(ProviderNode),
    Consumer,
}

impl NodeKind {
    pub fn tag(&self) -> InstanceKind {
        match self {
            NodeKind::Host(_) => InstanceKind::Host,
            NodeKind::Function(_) => InstanceKind::Function,
            NodeKind::Class(_) => InstanceKind::Class,
            NodeKind::Fragment => InstanceKind::Fragment,
            NodeKind::Portal(_) => InstanceKind::Portal,
            NodeKind::Provider(_) => InstanceKind::Provider,
            NodeKind::Consumer => InstanceKind::Consumer,
        }
    }
}

pub(crate) struct Node {
    pub element: Element,
    pub kind: NodeKind,
    pub tree: TreeId,
    pub parent: Option<InstanceId>,
    pub depth: usize,
    pub key: ChildKey,
    /// Name given to host objects created directly for this instance.
    pub name: Rc<str>,
    pub children: Vec<InstanceId>,
    /// Providers this instance read during its last render.
    pub reads: Vec<InstanceId>,
}

impl Node {
    pub fn host_id(&self) -> Option<HostId> {
        match &self.kind {
            NodeKind::Host(host) => Some(host.id),
            _ => None,
        }
    }

    pub fn component_name(&self) -> &str {
        self.element.component().name()
    }
}

struct Slot {
    generation: u32,
    node: Option<Node>,
}

/// Generational arena of instance nodes.
#[derive(Default)]
pub(crate) struct Arena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl Arena {
    /// The id the next `insert` will return.
    pub fn vacant_id(&self) -> InstanceId {
        match self.free.last() {
            Some(&index) => InstanceId::from_raw(index, self.slots[index as usize].generation),
            None => InstanceId::from_raw(self.slots.len() as u32, 0),
        }
    }

    pub fn insert(&mut self, node: Node) -> InstanceId {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.node = Some(node);
            return InstanceId::from_raw(index, slot.generation);
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            node: Some(node),
        });
        InstanceId::from_raw(index, 0)
    }

    pub fn get(&self, id: InstanceId) -> Option<&Node> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_ref())
    }

    pub fn get_mut(&mut self, id: InstanceId) -> Option<&mut Node> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_mut())
    }

    pub fn contains(&self, id: InstanceId) -> bool {
        self.get(id).is_some()
    }

    pub fn remove(&mut self, id: InstanceId) -> Option<Node> {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)?;
        let node = slot.node.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.live -= 1;
        Some(node)
    }

    pub fn len(&self) -> usize {
        self.live
    }

    /// Ids from `id` up to the root, nearest first, `id` excluded.
    pub fn ancestors(&self, id: InstanceId) -> Vec<InstanceId> {
        let mut chain = Vec::new();
        let mut cursor = self.get(id).and_then(|node| node.parent);
        while let Some(current) = cursor {
            chain.push(current);
            cursor = self.get(current).and_then(|node| node.parent);
        }
        chain
    }
}
