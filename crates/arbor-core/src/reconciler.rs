//! The reconciler: turns element trees into instance trees and host calls.
//!
//! A [`Reconciler`] owns every mounted tree. Each public entry point
//! (`mount`, `update`, `flush`) does one render pass followed by a commit:
//!
//! 1. Render: elements are diffed against instances top-down. Components
//!    render, host objects are created and their properties updated, stale
//!    instances are unmounted. Structural changes mark the affected host
//!    containers.
//! 2. Commit: every marked container's host children are brought into the
//!    order of the instance tree with `attach_child`, then layout jobs
//!    (layout effects, `did_mount`, `did_update`) run, then passive
//!    effects. Updates scheduled by those jobs start another pass.

use std::cell::{Ref, RefCell, RefMut};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::rc::{Rc, Weak};

use tracing::{debug, debug_span, trace, warn};

use crate::binding::{Binding, Subscription};
use crate::config::{self, Config};
use crate::context::{ContextRef, ContextStack, ProvidedValue};
use crate::element::{ComponentRef, Element};
use crate::error::{Error, RenderError, Result};
use crate::hooks::{FrameInput, HookMeta, HookState, render_with_hooks};
use crate::host::{Host, HostId};
use crate::instance::{
    Arena, ChildKey, HostNode, InstanceId, InstanceKind, KeySegment, Node, NodeKind, ProviderNode,
    TreeId,
};
use crate::props::{PropMap, PropValue, Props, REF_KEY, VALUE_KEY};
use crate::scheduler::{Job, JobQueues, Phase, ScheduleHandle, SchedulerShared, guarded};

/// Name of the root host object when `mount` is not given one.
pub const DEFAULT_TREE_NAME: &str = "ArborTree";

/// Handle to a mounted tree, returned by [`Reconciler::mount`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TreeHandle {
    id: TreeId,
}

impl TreeHandle {
    pub fn id(&self) -> TreeId {
        self.id
    }
}

struct TreeState {
    root: Option<InstanceId>,
    host_parent: Option<HostId>,
    name: Rc<str>,
}

/// A host object whose children the reconciler orders.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
enum Container {
    /// The host parent a tree was mounted under.
    Tree(TreeId),
    /// A host instance or a portal instance.
    Instance(InstanceId),
}

/// Where a new instance goes.
struct Slot {
    tree: TreeId,
    parent: Option<InstanceId>,
    depth: usize,
    key: ChildKey,
    name: Rc<str>,
}

/// A binding update that arrived while the host was borrowed.
struct DeferredWrite {
    id: HostId,
    key: Rc<str>,
    value: PropValue,
    /// Dead once the subscription that produced the write is dropped.
    bound: Weak<()>,
}

/// Remember the first error, keep going.
fn keep_first(first: &mut Option<Error>, result: Result<()>) {
    if let Err(err) = result {
        match first {
            Some(_) => warn!(%err, "additional error during the same pass"),
            None => *first = Some(err),
        }
    }
}

fn own_key(element: &Element) -> ChildKey {
    ChildKey::single(match element.key() {
        Some(key) => KeySegment::Named(Rc::clone(key)),
        None => KeySegment::Index(0),
    })
}

/// Flatten fragments into `(key path, element)` pairs.
fn flatten(elements: &[Element], prefix: &ChildKey, out: &mut Vec<(ChildKey, Element)>) {
    for (index, element) in elements.iter().enumerate() {
        let segment = match element.key() {
            Some(key) => KeySegment::Named(Rc::clone(key)),
            None => KeySegment::Index(index),
        };
        let key = prefix.join(segment);
        if element.is_fragment() {
            flatten(element.children(), &key, out);
        } else {
            out.push((key, element.clone()));
        }
    }
}

/// Properties sent to the host at creation, bindings resolved.
fn host_props(props: &Props) -> PropMap {
    props
        .iter()
        .filter(|(key, _)| &***key != REF_KEY)
        .map(|(key, value)| (Rc::clone(key), value.resolve()))
        .collect()
}

/// Drives a [`Host`] from element trees.
pub struct Reconciler<H: Host> {
    host: Rc<RefCell<H>>,
    config: Config,
    arena: Arena,
    trees: BTreeMap<TreeId, TreeState>,
    unmounted: BTreeSet<TreeId>,
    next_tree: u64,
    scheduler: Rc<SchedulerShared>,
    jobs: JobQueues,
    /// Host children currently attached per container, in order.
    attached: BTreeMap<Container, Vec<HostId>>,
    /// Containers whose host children may be out of order.
    touched: BTreeSet<Container>,
    /// Instances waiting to re-render, shallowest first.
    work: BTreeSet<(usize, InstanceId)>,
    /// Instances that must re-render even if their element is unchanged.
    forced: BTreeSet<InstanceId>,
    contexts: ContextStack,
    /// Binding updates waiting for the host to be free.
    deferred: Rc<RefCell<Vec<DeferredWrite>>>,
    pass: u64,
}

impl<H: Host> fmt::Debug for Reconciler<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reconciler")
            .field("trees", &self.trees.len())
            .field("instances", &self.arena.len())
            .field("pass", &self.pass)
            .finish()
    }
}

impl<H: Host + 'static> Reconciler<H> {
    /// Create a reconciler using the process-wide configuration.
    pub fn new(host: H) -> Self {
        Self::with_config(host, config::global())
    }

    pub fn with_config(host: H, config: Config) -> Self {
        Self {
            host: Rc::new(RefCell::new(host)),
            config,
            arena: Arena::default(),
            trees: BTreeMap::new(),
            unmounted: BTreeSet::new(),
            next_tree: 0,
            scheduler: Rc::new(SchedulerShared::default()),
            jobs: JobQueues::default(),
            attached: BTreeMap::new(),
            touched: BTreeSet::new(),
            work: BTreeSet::new(),
            forced: BTreeSet::new(),
            contexts: ContextStack::default(),
            deferred: Rc::new(RefCell::new(Vec::new())),
            pass: 0,
        }
    }

    pub fn host(&self) -> Ref<'_, H> {
        self.host.borrow()
    }

    pub fn host_mut(&self) -> RefMut<'_, H> {
        self.host.borrow_mut()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Call `wake` whenever a state update is scheduled or a binding update
    /// is deferred, so the owner knows a [`flush`](Self::flush) is due.
    pub fn on_schedule(&self, wake: impl Fn() + 'static) {
        self.scheduler.set_wake(Some(Rc::new(wake)));
    }

    /// Whether a flush would do anything.
    pub fn has_pending_work(&self) -> bool {
        !self.scheduler.is_empty()
            || !self.work.is_empty()
            || !self.jobs.is_empty()
            || !self.deferred.borrow().is_empty()
    }

    // ------------------------------------------------------------------------
    // Entry points
    // ------------------------------------------------------------------------

    /// Mount `element` as a new tree.
    ///
    /// The root host objects are attached under `host_parent` when one is
    /// given. The root host object is named `name`, or
    /// [`DEFAULT_TREE_NAME`].
    pub fn mount(
        &mut self,
        element: Element,
        host_parent: Option<HostId>,
        name: Option<&str>,
    ) -> Result<TreeHandle> {
        let tree = TreeId(self.next_tree);
        self.next_tree += 1;
        debug!(%tree, component = element.component().name(), "mount");

        self.trees.insert(
            tree,
            TreeState {
                root: None,
                host_parent,
                name: name.unwrap_or(DEFAULT_TREE_NAME).into(),
            },
        );
        self.pass += 1;
        let rendered = self
            .reconcile_root(tree, &element)
            .and_then(|()| self.process_work());
        if rendered.is_err() {
            self.discard_tree(tree);
        }
        let committed = self.commit();
        match rendered.and(committed) {
            Ok(()) => Ok(TreeHandle { id: tree }),
            Err(err) => {
                self.discard_tree(tree);
                Err(err)
            }
        }
    }

    /// Drop a tree whose mount failed. Its handle was never handed out.
    fn discard_tree(&mut self, tree: TreeId) {
        let Some(root) = self.trees.get(&tree).map(|state| state.root) else {
            return;
        };
        debug!(%tree, "discard tree after failed mount");
        if let Some(root) = root
            && let Err(err) = self.unmount_node(root, true)
        {
            warn!(%err, "teardown of a failed mount also failed");
        }
        self.trees.remove(&tree);
        self.attached.remove(&Container::Tree(tree));
        self.touched.remove(&Container::Tree(tree));
    }

    /// Reconcile a mounted tree against a new element.
    ///
    /// Mutations applied before a failure are kept.
    pub fn update(&mut self, handle: &TreeHandle, element: Element) -> Result<TreeHandle> {
        self.check_tree(handle)?;
        debug!(tree = %handle.id, component = element.component().name(), "update");
        self.pass += 1;
        let rendered = self
            .reconcile_root(handle.id, &element)
            .and_then(|()| self.process_work());
        let committed = self.commit();
        rendered.and(committed).map(|()| handle.clone())
    }

    /// Tear a tree down: unmount every instance, destroy every host object
    /// it created, run every pending cleanup.
    ///
    /// A second call for the same handle fails with
    /// [`Error::TreeAlreadyUnmounted`].
    pub fn unmount(&mut self, handle: &TreeHandle) -> Result<()> {
        self.check_tree(handle)?;
        debug!(tree = %handle.id, "unmount");
        let root = self.trees.get(&handle.id).and_then(|tree| tree.root);
        let result = match root {
            Some(root) => self.unmount_node(root, true),
            None => Ok(()),
        };
        self.trees.remove(&handle.id);
        self.attached.remove(&Container::Tree(handle.id));
        self.touched.remove(&Container::Tree(handle.id));
        self.unmounted.insert(handle.id);
        result
    }

    /// Apply scheduled state updates, re-render the affected instances and
    /// commit.
    pub fn flush(&mut self) -> Result<()> {
        if !self.has_pending_work() {
            return Ok(());
        }
        debug!(pass = self.pass + 1, "flush");
        let rendered = self.render_pass();
        let committed = self.commit();
        rendered.and(committed)
    }

    // ------------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------------

    /// Root instance of a tree.
    pub fn root(&self, handle: &TreeHandle) -> Option<InstanceId> {
        self.trees.get(&handle.id).and_then(|tree| tree.root)
    }

    pub fn children(&self, id: InstanceId) -> Vec<InstanceId> {
        self.arena
            .get(id)
            .map(|node| node.children.clone())
            .unwrap_or_default()
    }

    pub fn kind(&self, id: InstanceId) -> Option<InstanceKind> {
        self.arena.get(id).map(|node| node.kind.tag())
    }

    pub fn instance_key(&self, id: InstanceId) -> Option<ChildKey> {
        self.arena.get(id).map(|node| node.key.clone())
    }

    /// Host object created for a host instance.
    pub fn host_object(&self, id: InstanceId) -> Option<HostId> {
        self.arena.get(id).and_then(Node::host_id)
    }

    pub fn is_mounted(&self, id: InstanceId) -> bool {
        self.arena.contains(id)
    }

    /// Number of live instances across all trees.
    pub fn instance_count(&self) -> usize {
        self.arena.len()
    }

    /// Hook slots of a function component instance.
    pub fn hooks_debug_info(&self, id: InstanceId) -> Vec<HookMeta> {
        match self.arena.get(id).map(|node| &node.kind) {
            Some(NodeKind::Function(state)) => state.debug_info(),
            _ => Vec::new(),
        }
    }

    /// How many times a function component instance has rendered.
    pub fn render_count(&self, id: InstanceId) -> usize {
        match self.arena.get(id).map(|node| &node.kind) {
            Some(NodeKind::Function(state)) => state.render_count(),
            _ => 0,
        }
    }

    // ------------------------------------------------------------------------
    // Passes
    // ------------------------------------------------------------------------

    fn check_tree(&self, handle: &TreeHandle) -> Result<()> {
        if self.trees.contains_key(&handle.id) {
            Ok(())
        } else if self.unmounted.contains(&handle.id) {
            Err(Error::TreeAlreadyUnmounted)
        } else {
            Err(Error::UnknownTree)
        }
    }

    /// Apply queued updates and re-render the instances they touched.
    fn render_pass(&mut self) -> Result<()> {
        self.pass += 1;
        let mut first = None;
        for (instance, update) in self.scheduler.take() {
            let component = self
                .arena
                .get(instance)
                .map(|node| node.component_name().to_string());
            if let Err(message) = guarded(update) {
                keep_first(
                    &mut first,
                    Err(Error::Effect {
                        component: component.clone().unwrap_or_default(),
                        message,
                    }),
                );
            }
            match self.arena.get(instance) {
                Some(node) => {
                    self.work.insert((node.depth, instance));
                    self.forced.insert(instance);
                }
                None => warn!(%instance, "state update for an instance that no longer exists"),
            }
        }
        keep_first(&mut first, self.process_work());
        first.map_or(Ok(()), Err)
    }

    /// Re-render queued instances, parents before children.
    fn process_work(&mut self) -> Result<()> {
        let mut first = None;
        while let Some((_, id)) = self.work.pop_first() {
            let Some(element) = self.arena.get(id).map(|node| node.element.clone()) else {
                self.forced.remove(&id);
                continue;
            };
            trace!(instance = %id, "re-render");
            self.rebuild_contexts(id);
            keep_first(&mut first, self.update_node(id, &element));
        }
        self.contexts.clear();
        self.forced.clear();
        first.map_or(Ok(()), Err)
    }

    /// Order host children, run effects, and keep going while effects
    /// schedule more updates.
    fn commit(&mut self) -> Result<()> {
        let mut first = None;
        let mut passes = 0;
        loop {
            let span = debug_span!("flush", pass = self.pass);
            let _enter = span.enter();

            self.apply_deferred_writes();
            keep_first(&mut first, self.sync_containers());
            self.run_jobs(&mut first);

            if self.scheduler.is_empty() && self.work.is_empty() {
                break;
            }
            passes += 1;
            if passes >= self.config.max_update_passes {
                warn!(passes, "update loop cut off");
                drop(self.scheduler.take());
                self.work.clear();
                self.forced.clear();
                keep_first(&mut first, Err(Error::UpdateLoop { passes }));
                break;
            }
            keep_first(&mut first, self.render_pass());
        }
        first.map_or(Ok(()), Err)
    }

    fn run_jobs(&mut self, first: &mut Option<Error>) {
        while let Some(job) = self.jobs.pop_layout() {
            keep_first(first, self.run_job(job));
        }
        while let Some(job) = self.jobs.pop_passive() {
            keep_first(first, self.run_job(job));
        }
    }

    fn run_job(&mut self, job: Job) -> Result<()> {
        match job {
            Job::Effect {
                instance,
                component,
                cell,
                run,
            } => {
                if !cell.is_alive() {
                    trace!(%instance, "skip effect of unmounted instance");
                    return Ok(());
                }
                cell.run(run).map_err(|message| Error::Effect {
                    component: component.to_string(),
                    message,
                })
            }
            Job::DidMount(instance) => self.run_lifecycle(instance, true),
            Job::DidUpdate(instance) => self.run_lifecycle(instance, false),
        }
    }

    fn run_lifecycle(&mut self, instance: InstanceId, mounting: bool) -> Result<()> {
        let Some(node) = self.arena.get_mut(instance) else {
            return Ok(());
        };
        let component = node.component_name().to_string();
        let NodeKind::Class(object) = &mut node.kind else {
            return Ok(());
        };
        let result = if mounting {
            guarded(|| object.did_mount())
        } else {
            guarded(|| object.did_update())
        };
        result.map_err(|message| Error::Effect { component, message })
    }

    // ------------------------------------------------------------------------
    // Reconciliation
    // ------------------------------------------------------------------------

    fn reconcile_root(&mut self, tree: TreeId, element: &Element) -> Result<()> {
        let Some(state) = self.trees.get(&tree) else {
            return Err(Error::UnknownTree);
        };
        let root = state.root;
        let slot = Slot {
            tree,
            parent: None,
            depth: 0,
            key: own_key(element),
            name: Rc::clone(&state.name),
        };
        self.contexts.clear();
        self.touched.insert(Container::Tree(tree));

        if let Some(root) = root {
            if self.matches(root, element, &slot.key) {
                return self.update_node(root, element);
            }
            self.set_root(tree, None);
            self.unmount_node(root, true)?;
        }
        let root = self.mount_node(element, slot)?;
        self.set_root(tree, Some(root));
        Ok(())
    }

    fn set_root(&mut self, tree: TreeId, root: Option<InstanceId>) {
        if let Some(state) = self.trees.get_mut(&tree) {
            state.root = root;
        }
    }

    /// Whether instance `id` can be updated in place to `element`.
    fn matches(&self, id: InstanceId, element: &Element, key: &ChildKey) -> bool {
        let Some(node) = self.arena.get(id) else {
            return false;
        };
        node.key == *key
            && node.element.component().same_component(element.component())
            && match node.kind {
                NodeKind::Portal(target) => target == element.portal_target(),
                _ => true,
            }
    }

    fn node(&self, id: InstanceId) -> Result<&Node> {
        self.arena
            .get(id)
            .ok_or_else(|| Error::Internal(format!("dangling instance {id}")))
    }

    fn render_error(&self, element: &Element, error: RenderError) -> Error {
        Error::Render {
            component: element.component().name().to_string(),
            message: error.message().to_string(),
            location: self.config.element_tracing.then(|| element.source()),
        }
    }

    fn invalid_props(&self, element: &Element, message: String) -> Error {
        Error::InvalidProps {
            component: element.component().name().to_string(),
            message,
            location: self.config.element_tracing.then(|| element.source()),
        }
    }

    fn mount_node(&mut self, element: &Element, slot: Slot) -> Result<InstanceId> {
        trace!(component = element.component().name(), key = %slot.key, "mount instance");
        let kind = match element.component() {
            ComponentRef::Host(class) => {
                let props = host_props(element.props());
                let id = self.host.borrow_mut().create(class, &slot.name, &props)?;
                trace!(%id, class = &**class, name = &*slot.name, "host create");
                NodeKind::Host(HostNode {
                    id,
                    bindings: Vec::new(),
                    host_ref: None,
                })
            }
            ComponentRef::Function(_) => NodeKind::Function(HookState::default()),
            ComponentRef::Class(class) => {
                let schedule = ScheduleHandle::new(&self.scheduler, self.arena.vacant_id());
                let object = class
                    .construct(element.props(), schedule, self.config.prop_validation)
                    .map_err(|message| self.invalid_props(element, message))?;
                NodeKind::Class(object)
            }
            ComponentRef::Fragment => NodeKind::Fragment,
            ComponentRef::Portal => NodeKind::Portal(self.portal_target(element)?),
            ComponentRef::Provider(context) => NodeKind::Provider(ProviderNode {
                context: context.id(),
                value: self.provided_value(context, element)?,
                subscribers: BTreeSet::new(),
            }),
            ComponentRef::Consumer(_) => NodeKind::Consumer,
        };

        let id = self.arena.insert(Node {
            element: element.clone(),
            kind,
            tree: slot.tree,
            parent: slot.parent,
            depth: slot.depth,
            key: slot.key,
            name: slot.name,
            children: Vec::new(),
            reads: Vec::new(),
        });

        if let Err(err) = self.mount_contents(id, element) {
            if let Err(cleanup) = self.unmount_node(id, true) {
                warn!(%cleanup, "cleanup after a failed mount also failed");
            }
            return Err(err);
        }
        Ok(id)
    }

    fn mount_contents(&mut self, id: InstanceId, element: &Element) -> Result<()> {
        match element.component() {
            ComponentRef::Host(_) => {
                self.bind_host(id, element);
                self.reconcile_children(id, element.children())
            }
            ComponentRef::Function(_) => self.render_function(id, element),
            ComponentRef::Class(_) => self.render_class(id, element, true),
            ComponentRef::Fragment | ComponentRef::Portal => {
                self.reconcile_children(id, element.children())
            }
            ComponentRef::Provider(_) => self.provide(id, element),
            ComponentRef::Consumer(_) => self.render_consumer(id, element),
        }
    }

    fn update_node(&mut self, id: InstanceId, element: &Element) -> Result<()> {
        let node = self.node(id)?;
        if node.element.ptr_eq(element) && !self.forced.contains(&id) {
            trace!(instance = %id, "bail out");
            return Ok(());
        }
        let depth = node.depth;
        let previous = node.element.clone();
        let forced = self.forced.remove(&id);
        self.work.remove(&(depth, id));
        if let Some(node) = self.arena.get_mut(id) {
            node.element = element.clone();
        }

        match element.component() {
            ComponentRef::Host(_) => {
                self.update_host(id, &previous, element)?;
                self.reconcile_children(id, element.children())
            }
            ComponentRef::Function(function)
                if !forced && function.can_skip(previous.props(), element.props()) =>
            {
                trace!(instance = %id, "memo props unchanged");
                Ok(())
            }
            ComponentRef::Function(_) => self.render_function(id, element),
            ComponentRef::Class(_) => {
                let next_props = (!previous.ptr_eq(element)).then(|| element.props());
                let validate = self.config.prop_validation && next_props.is_some();
                let render = match self.arena.get_mut(id).map(|node| &mut node.kind) {
                    Some(NodeKind::Class(object)) => object.receive(next_props, validate),
                    _ => return Err(Error::Internal(format!("instance {id} is not a class"))),
                };
                match render {
                    Ok(true) => self.render_class(id, element, false),
                    Ok(false) => {
                        trace!(instance = %id, "should_update declined");
                        Ok(())
                    }
                    Err(message) => Err(self.invalid_props(element, message)),
                }
            }
            ComponentRef::Fragment | ComponentRef::Portal => {
                self.reconcile_children(id, element.children())
            }
            ComponentRef::Provider(context) => {
                let value = self.provided_value(context, element)?;
                self.update_provider(id, context, value);
                self.provide(id, element)
            }
            ComponentRef::Consumer(_) => self.render_consumer(id, element),
        }
    }

    /// Keyed diff of a child list.
    fn reconcile_children(&mut self, parent: InstanceId, elements: &[Element]) -> Result<()> {
        let mut flat = Vec::with_capacity(elements.len());
        flatten(elements, &ChildKey::default(), &mut flat);

        let mut seen = HashSet::with_capacity(flat.len());
        for (key, _) in &flat {
            if !seen.insert(key) {
                return Err(Error::DuplicateKey {
                    key: key.to_string(),
                });
            }
        }

        let (tree, depth, old_children) = {
            let node = self.node(parent)?;
            (node.tree, node.depth, node.children.clone())
        };
        let incoming: HashMap<&ChildKey, &Element> =
            flat.iter().map(|(key, element)| (key, element)).collect();

        let mut first = None;
        let mut reusable: HashMap<ChildKey, InstanceId> = HashMap::new();
        for &child in &old_children {
            let Some(key) = self.arena.get(child).map(|node| node.key.clone()) else {
                continue;
            };
            match incoming.get(&key) {
                Some(element) if self.matches(child, element, &key) => {
                    reusable.insert(key, child);
                }
                _ => {
                    trace!(instance = %child, %key, "unmount stale child");
                    keep_first(&mut first, self.unmount_node(child, true));
                }
            }
        }
        if let Some(err) = first {
            let survivors = old_children
                .iter()
                .copied()
                .filter(|id| self.arena.contains(*id))
                .collect();
            self.set_children(parent, survivors);
            return Err(err);
        }

        let mut next = Vec::with_capacity(flat.len());
        let mut result = Ok(());
        for (key, element) in &flat {
            match reusable.remove(key) {
                Some(child) => {
                    next.push(child);
                    result = self.update_node(child, element);
                }
                None => {
                    let slot = Slot {
                        tree,
                        parent: Some(parent),
                        depth: depth + 1,
                        key: key.clone(),
                        name: key.to_string().into(),
                    };
                    match self.mount_node(element, slot) {
                        Ok(child) => next.push(child),
                        Err(err) => result = Err(err),
                    }
                }
            }
            if result.is_err() {
                break;
            }
        }
        // Children not reached because of an error stay mounted.
        next.extend(old_children.iter().filter(|id| reusable.values().any(|r| r == *id)));

        self.set_children(parent, next);
        result?;
        if self.config.internal_type_checks {
            self.check_links(parent)?;
        }
        Ok(())
    }

    /// Reconcile the single child a component rendered.
    fn reconcile_rendered(&mut self, parent: InstanceId, rendered: Option<Element>) -> Result<()> {
        let (tree, depth, name, old) = {
            let node = self.node(parent)?;
            (
                node.tree,
                node.depth,
                Rc::clone(&node.name),
                node.children.first().copied(),
            )
        };
        let Some(element) = rendered else {
            if let Some(old) = old {
                let result = self.unmount_node(old, true);
                self.set_children(parent, Vec::new());
                return result;
            }
            return Ok(());
        };

        let key = own_key(&element);
        if let Some(old) = old {
            if self.matches(old, &element, &key) {
                return self.update_node(old, &element);
            }
            let result = self.unmount_node(old, true);
            self.set_children(parent, Vec::new());
            result?;
        }
        let slot = Slot {
            tree,
            parent: Some(parent),
            depth: depth + 1,
            key,
            name,
        };
        let child = self.mount_node(&element, slot)?;
        self.set_children(parent, vec![child]);
        Ok(())
    }

    fn set_children(&mut self, parent: InstanceId, children: Vec<InstanceId>) {
        let changed = match self.arena.get_mut(parent) {
            Some(node) if node.children != children => {
                node.children = children;
                true
            }
            _ => false,
        };
        if changed {
            let container = self.container_for_children(parent);
            self.touched.insert(container);
        }
    }

    fn check_links(&self, parent: InstanceId) -> Result<()> {
        for &child in &self.node(parent)?.children {
            match self.arena.get(child) {
                Some(node) if node.parent == Some(parent) => {}
                Some(_) => {
                    return Err(Error::Internal(format!(
                        "instance {child} is listed under {parent} but points elsewhere"
                    )));
                }
                None => {
                    return Err(Error::Internal(format!(
                        "instance {parent} lists unmounted child {child}"
                    )));
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Components
    // ------------------------------------------------------------------------

    fn render_function(&mut self, id: InstanceId, element: &Element) -> Result<()> {
        let ComponentRef::Function(function) = element.component() else {
            return Err(Error::Internal(format!("instance {id} is not a function")));
        };
        let state = match self.arena.get_mut(id).map(|node| &mut node.kind) {
            Some(NodeKind::Function(state)) => std::mem::take(state),
            _ => return Err(Error::Internal(format!("instance {id} has no hook state"))),
        };
        let component: Rc<str> = function.name().into();
        let input = FrameInput {
            instance: id,
            component: Rc::clone(&component),
            state,
            schedule: ScheduleHandle::new(&self.scheduler, id),
            contexts: self.contexts.clone(),
        };
        let (rendered, outcome) = match render_with_hooks(input, || function.render(element.props())) {
            Ok(done) => done,
            Err(unwound) => {
                if let Some(NodeKind::Function(state)) = self.arena.get_mut(id).map(|node| &mut node.kind) {
                    *state = unwound.state;
                }
                std::panic::resume_unwind(unwound.payload);
            }
        };

        if let Some(NodeKind::Function(state)) = self.arena.get_mut(id).map(|node| &mut node.kind) {
            *state = outcome.state;
        }
        self.set_reads(id, outcome.reads);
        if let Some(violation) = outcome.violation {
            return Err(violation);
        }
        let rendered = rendered.map_err(|err| self.render_error(element, err))?;
        self.reconcile_rendered(id, rendered)?;
        self.jobs.extend(id, &component, outcome.effects);
        Ok(())
    }

    fn render_class(&mut self, id: InstanceId, element: &Element, mounting: bool) -> Result<()> {
        let rendered = match self.arena.get(id).map(|node| &node.kind) {
            Some(NodeKind::Class(object)) => object.render(),
            _ => return Err(Error::Internal(format!("instance {id} is not a class"))),
        };
        let rendered = rendered.map_err(|err| self.render_error(element, err))?;
        self.reconcile_rendered(id, rendered)?;
        let job = if mounting {
            Job::DidMount(id)
        } else {
            Job::DidUpdate(id)
        };
        self.jobs.push(Phase::Layout, job);
        Ok(())
    }

    fn render_consumer(&mut self, id: InstanceId, element: &Element) -> Result<()> {
        let ComponentRef::Consumer(consumer) = element.component() else {
            return Err(Error::Internal(format!("instance {id} is not a consumer")));
        };
        let provided = self.contexts.resolve(consumer.context.id()).cloned();
        let value = match &provided {
            Some(provided) => Rc::clone(&provided.value),
            None => consumer.context.default_value(),
        };
        self.set_reads(id, provided.map(|p| p.provider).into_iter().collect());
        let rendered = (consumer.render)(&*value).map_err(|err| self.render_error(element, err))?;
        self.reconcile_rendered(id, rendered)
    }

    // ------------------------------------------------------------------------
    // Context
    // ------------------------------------------------------------------------

    fn provided_value(&self, context: &ContextRef, element: &Element) -> Result<Rc<dyn std::any::Any>> {
        match element.props().get(VALUE_KEY) {
            Some(PropValue::Any(value)) if context.accepts(&**value) => Ok(Rc::clone(value)),
            _ if self.config.type_checks => Err(Error::TypeCheck(format!(
                "provider of context `{}` was not given a value of the context's type",
                context.name()
            ))),
            _ => Ok(context.default_value()),
        }
    }

    fn update_provider(&mut self, id: InstanceId, context: &ContextRef, value: Rc<dyn std::any::Any>) {
        let Some(NodeKind::Provider(provider)) = self.arena.get_mut(id).map(|node| &mut node.kind)
        else {
            return;
        };
        let changed = !context.same_value(&*provider.value, &*value);
        provider.value = value;
        if !changed {
            return;
        }
        let subscribers: Vec<_> = provider.subscribers.iter().copied().collect();
        debug!(provider = %id, subscribers = subscribers.len(), "context value changed");
        for subscriber in subscribers {
            if let Some(node) = self.arena.get(subscriber) {
                self.work.insert((node.depth, subscriber));
                self.forced.insert(subscriber);
            }
        }
    }

    /// Reconcile a provider's children with its value on the stack.
    fn provide(&mut self, id: InstanceId, element: &Element) -> Result<()> {
        let frame = match self.arena.get(id).map(|node| &node.kind) {
            Some(NodeKind::Provider(provider)) => ProvidedValue {
                context: provider.context,
                provider: id,
                value: Rc::clone(&provider.value),
            },
            _ => return Err(Error::Internal(format!("instance {id} is not a provider"))),
        };
        self.contexts.push(frame);
        let result = self.reconcile_children(id, element.children());
        self.contexts.pop();
        result
    }

    /// Record the providers `id` read during its render.
    fn set_reads(&mut self, id: InstanceId, reads: Vec<InstanceId>) {
        let Some(node) = self.arena.get_mut(id) else {
            return;
        };
        let old = std::mem::replace(&mut node.reads, reads.clone());
        for provider in old {
            if let Some(NodeKind::Provider(p)) = self.arena.get_mut(provider).map(|n| &mut n.kind) {
                p.subscribers.remove(&id);
            }
        }
        for provider in reads {
            if let Some(NodeKind::Provider(p)) = self.arena.get_mut(provider).map(|n| &mut n.kind) {
                p.subscribers.insert(id);
            }
        }
    }

    /// Put the providers above `id` on the context stack.
    fn rebuild_contexts(&mut self, id: InstanceId) {
        self.contexts.clear();
        for ancestor in self.arena.ancestors(id).into_iter().rev() {
            if let Some(NodeKind::Provider(provider)) = self.arena.get(ancestor).map(|n| &n.kind) {
                self.contexts.push(ProvidedValue {
                    context: provider.context,
                    provider: ancestor,
                    value: Rc::clone(&provider.value),
                });
            }
        }
    }

    // ------------------------------------------------------------------------
    // Host objects
    // ------------------------------------------------------------------------

    fn portal_target(&self, element: &Element) -> Result<Option<HostId>> {
        match element.portal_target() {
            Some(target) => Ok(Some(target)),
            None if self.config.type_checks => Err(Error::TypeCheck(
                "portal requires a `target` host object".to_string(),
            )),
            None => {
                warn!("portal without a target, children stay detached");
                Ok(None)
            }
        }
    }

    fn subscribe_binding(&self, id: HostId, key: Rc<str>, binding: &Binding<PropValue>) -> Subscription {
        let host = Rc::downgrade(&self.host);
        let deferred = Rc::downgrade(&self.deferred);
        let scheduler = Rc::downgrade(&self.scheduler);
        let bound = Rc::new(());
        binding.subscribe(move |value| {
            let Some(host) = host.upgrade() else {
                return;
            };
            let Some(deferred) = deferred.upgrade() else {
                return;
            };
            let Ok(mut host) = host.try_borrow_mut() else {
                debug!(%id, key = &*key, "host busy, binding update deferred");
                deferred.borrow_mut().push(DeferredWrite {
                    id,
                    key: Rc::clone(&key),
                    value: value.clone(),
                    bound: Rc::downgrade(&bound),
                });
                if let Some(scheduler) = scheduler.upgrade() {
                    scheduler.wake();
                }
                return;
            };
            // Older deferred writes to this property are superseded.
            deferred
                .borrow_mut()
                .retain(|write| write.id != id || write.key != key);
            trace!(%id, key = &*key, "binding update");
            if let Err(err) = host.set_property(id, &key, value) {
                warn!(%id, key = &*key, %err, "host rejected binding update");
            }
        })
    }

    /// Apply binding updates that found the host busy.
    fn apply_deferred_writes(&self) {
        let writes = std::mem::take(&mut *self.deferred.borrow_mut());
        if writes.is_empty() {
            return;
        }
        trace!(count = writes.len(), "apply deferred binding updates");
        let mut host = self.host.borrow_mut();
        for write in writes {
            if write.bound.upgrade().is_none() {
                continue;
            }
            if let Err(err) = host.set_property(write.id, &write.key, &write.value) {
                warn!(id = %write.id, key = &*write.key, %err, "host rejected binding update");
            }
        }
    }

    /// Subscribe binding props and set the ref of a freshly created host
    /// instance.
    fn bind_host(&mut self, id: InstanceId, element: &Element) {
        let Some(host_id) = self.arena.get(id).and_then(Node::host_id) else {
            return;
        };
        let bindings: Vec<_> = element
            .props()
            .iter()
            .filter_map(|(key, value)| {
                value
                    .as_binding()
                    .map(|binding| (Rc::clone(key), self.subscribe_binding(host_id, Rc::clone(key), binding)))
            })
            .collect();
        let host_ref = element
            .props()
            .get(REF_KEY)
            .and_then(PropValue::as_ref_handle)
            .cloned();
        if let Some(host_ref) = &host_ref {
            host_ref.set(Some(host_id));
        }
        if let Some(NodeKind::Host(host)) = self.arena.get_mut(id).map(|node| &mut node.kind) {
            host.bindings = bindings;
            host.host_ref = host_ref;
        }
    }

    fn update_host(&mut self, id: InstanceId, previous: &Element, element: &Element) -> Result<()> {
        let Some(host_id) = self.arena.get(id).and_then(Node::host_id) else {
            return Err(Error::Internal(format!("instance {id} has no host object")));
        };
        let old = previous.props();
        let new = element.props();

        for (key, value) in new.iter() {
            if &**key == REF_KEY || old.get(key) == Some(value) {
                continue;
            }
            self.set_host_prop(id, host_id, key, value)?;
        }
        for (key, _) in old.iter() {
            if &**key == REF_KEY || new.contains(key) {
                continue;
            }
            self.set_host_prop(id, host_id, key, &PropValue::Nil)?;
        }

        let new_ref = new.get(REF_KEY).and_then(PropValue::as_ref_handle).cloned();
        if let Some(NodeKind::Host(host)) = self.arena.get_mut(id).map(|node| &mut node.kind) {
            let same = match (&host.host_ref, &new_ref) {
                (Some(a), Some(b)) => a.ptr_eq(b),
                (None, None) => true,
                _ => false,
            };
            if !same {
                if let Some(old_ref) = host.host_ref.take() {
                    old_ref.release(host_id);
                }
                if let Some(new_ref) = &new_ref {
                    new_ref.set(Some(host_id));
                }
                host.host_ref = new_ref;
            }
        }
        Ok(())
    }

    fn set_host_prop(&mut self, id: InstanceId, host_id: HostId, key: &Rc<str>, value: &PropValue) -> Result<()> {
        if let Some(NodeKind::Host(host)) = self.arena.get_mut(id).map(|node| &mut node.kind) {
            host.bindings.retain(|(bound, _)| bound != key);
        }
        trace!(%host_id, key = &**key, "set property");
        self.host
            .borrow_mut()
            .set_property(host_id, key, &value.resolve())?;
        if let PropValue::Binding(binding) = value {
            let subscription = self.subscribe_binding(host_id, Rc::clone(key), binding);
            if let Some(NodeKind::Host(host)) = self.arena.get_mut(id).map(|node| &mut node.kind) {
                host.bindings.push((Rc::clone(key), subscription));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Host child order
    // ------------------------------------------------------------------------

    /// Container that the host objects of `id`'s subtree belong to.
    fn container_of(&self, id: InstanceId) -> Container {
        for ancestor in self.arena.ancestors(id) {
            if let Some(NodeKind::Host(_) | NodeKind::Portal(_)) = self.arena.get(ancestor).map(|n| &n.kind) {
                return Container::Instance(ancestor);
            }
        }
        match self.arena.get(id) {
            Some(node) => Container::Tree(node.tree),
            None => Container::Instance(id),
        }
    }

    /// Container that `id`'s children belong to.
    fn container_for_children(&self, id: InstanceId) -> Container {
        match self.arena.get(id).map(|node| &node.kind) {
            Some(NodeKind::Host(_) | NodeKind::Portal(_)) => Container::Instance(id),
            _ => self.container_of(id),
        }
    }

    fn container_host(&self, container: Container) -> Option<HostId> {
        match container {
            Container::Tree(tree) => self.trees.get(&tree).and_then(|t| t.host_parent),
            Container::Instance(id) => match self.arena.get(id).map(|n| &n.kind) {
                Some(NodeKind::Host(host)) => Some(host.id),
                Some(NodeKind::Portal(target)) => *target,
                _ => None,
            },
        }
    }

    /// Topmost host objects under `ids`, in tree order. Portals are skipped.
    fn collect_hosts(&self, ids: &[InstanceId], out: &mut Vec<HostId>) {
        for &id in ids {
            let Some(node) = self.arena.get(id) else {
                continue;
            };
            match &node.kind {
                NodeKind::Host(host) => out.push(host.id),
                NodeKind::Portal(_) => {}
                _ => self.collect_hosts(&node.children, out),
            }
        }
    }

    fn sync_containers(&mut self) -> Result<()> {
        let mut first = None;
        for container in std::mem::take(&mut self.touched) {
            keep_first(&mut first, self.sync_container(container));
        }
        first.map_or(Ok(()), Err)
    }

    /// Attach the container's host children in instance order.
    ///
    /// Only out-of-place children are attached, so an unchanged container
    /// issues no calls and a swap issues one.
    fn sync_container(&mut self, container: Container) -> Result<()> {
        let start = match container {
            Container::Tree(tree) => match self.trees.get(&tree) {
                Some(state) => state.root.into_iter().collect(),
                None => Vec::new(),
            },
            Container::Instance(id) => match self.arena.get(id) {
                Some(node) => node.children.clone(),
                None => {
                    self.attached.remove(&container);
                    return Ok(());
                }
            },
        };
        let Some(parent) = self.container_host(container) else {
            return Ok(());
        };
        let mut desired = Vec::new();
        self.collect_hosts(&start, &mut desired);

        let current = self.attached.entry(container).or_default();
        current.retain(|id| desired.contains(id));
        let mut host = self.host.borrow_mut();
        for (position, &child) in desired.iter().enumerate() {
            if current.get(position) == Some(&child) {
                continue;
            }
            trace!(%parent, %child, position, "attach");
            host.attach_child(parent, child, position)?;
            if let Some(existing) = current.iter().position(|id| *id == child) {
                current.remove(existing);
            }
            current.insert(position.min(current.len()), child);
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Unmounting
    // ------------------------------------------------------------------------

    /// Detach the topmost host objects of `id`'s subtree from its container.
    fn detach_subtree(&mut self, id: InstanceId) {
        let container = self.container_of(id);
        let parent = self.container_host(container);
        let mut hosts = Vec::new();
        self.collect_hosts(&[id], &mut hosts);
        let Some(current) = self.attached.get_mut(&container) else {
            return;
        };
        let mut host = self.host.borrow_mut();
        for child in hosts {
            if let Some(position) = current.iter().position(|id| *id == child) {
                current.remove(position);
                if let Some(parent) = parent {
                    trace!(%parent, %child, "detach");
                    host.detach_child(parent, child);
                }
            }
        }
    }

    /// Unmount `id` and its subtree.
    ///
    /// A class's `will_unmount` runs before its subtree is torn down; hook
    /// cleanups and host destruction run children first. Teardown always
    /// completes; the first failure is returned.
    fn unmount_node(&mut self, id: InstanceId, top: bool) -> Result<()> {
        let mut first = None;
        let Some(node) = self.arena.get_mut(id) else {
            return Ok(());
        };
        trace!(instance = %id, component = node.component_name(), "unmount instance");
        let component = node.component_name().to_string();
        if let NodeKind::Class(object) = &mut node.kind
            && let Err(message) = guarded(|| object.will_unmount())
        {
            keep_first(&mut first, Err(Error::Effect { component: component.clone(), message }));
        }

        if top {
            self.detach_subtree(id);
        }
        if let Some(NodeKind::Portal(target)) = self.arena.get(id).map(|n| &n.kind) {
            let target = *target;
            let attached = self.attached.remove(&Container::Instance(id)).unwrap_or_default();
            if let Some(target) = target {
                let mut host = self.host.borrow_mut();
                for child in attached {
                    trace!(parent = %target, %child, "detach from portal target");
                    host.detach_child(target, child);
                }
            }
        }

        let children = match self.arena.get_mut(id) {
            Some(node) => std::mem::take(&mut node.children),
            None => Vec::new(),
        };
        for child in children {
            keep_first(&mut first, self.unmount_node(child, false));
        }

        let Some(node) = self.arena.remove(id) else {
            return first.map_or(Ok(()), Err);
        };
        match node.kind {
            NodeKind::Host(host) => {
                drop(host.bindings);
                if let Some(host_ref) = host.host_ref {
                    host_ref.release(host.id);
                }
                trace!(id = %host.id, "host destroy");
                self.host.borrow_mut().destroy(host.id);
                self.attached.remove(&Container::Instance(id));
                self.touched.remove(&Container::Instance(id));
            }
            NodeKind::Function(mut state) => {
                if let Err(message) = state.dispose() {
                    keep_first(&mut first, Err(Error::Effect { component, message }));
                }
            }
            NodeKind::Portal(_) => {
                self.touched.remove(&Container::Instance(id));
            }
            _ => {}
        }
        for provider in node.reads {
            if let Some(NodeKind::Provider(p)) = self.arena.get_mut(provider).map(|n| &mut n.kind) {
                p.subscribers.remove(&id);
            }
        }
        self.forced.remove(&id);
        self.work.remove(&(node.depth, id));
        first.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::create_binding;
    use crate::class::{ClassComponent, ClassScope};
    use crate::context::create_context;
    use crate::element::{Rendered, memo};
    use crate::hooks::{
        EveryRender, StateSetter, use_context, use_effect, use_effect_cleanup, use_layout_effect,
        use_ref, use_state,
    };
    use crate::host::{HostCall, MemoryHost};
    use crate::props::{Callback, create_ref};
    use crate::props;
    use std::cell::Cell;

    type Log = Rc<RefCell<Vec<String>>>;

    fn reconciler() -> Reconciler<MemoryHost> {
        Reconciler::with_config(MemoryHost::new(), Config::default())
    }

    fn mounted_under_root() -> (Reconciler<MemoryHost>, HostId) {
        let mut r = reconciler();
        let root = r.host_mut().create_external("Folder", "root");
        (r, root)
    }

    fn label(text: &str) -> Element {
        Element::host("TextLabel", props! { "Text" => text })
    }

    fn frame(children: impl IntoIterator<Item = Element>) -> Element {
        Element::host("Frame", Props::new()).with_children(children)
    }

    fn mutations(calls: &[HostCall]) -> usize {
        calls.len()
    }

    fn leaf(props: &Props) -> Rendered {
        let text = props.get("Text").cloned().unwrap_or_default();
        Ok(Some(Element::host("TextLabel", props! { "Text" => text })))
    }

    fn keyed_leaves(keys: &[&str]) -> Element {
        frame(keys.iter().map(|key| {
            Element::function(leaf, props! { "Text" => *key }).keyed(*key)
        }))
    }

    #[test]
    fn mount_creates_and_attaches_in_order() {
        let (mut r, root) = mounted_under_root();
        let tree = r
            .mount(frame([label("a").keyed("a"), label("b").keyed("b")]), Some(root), None)
            .unwrap();

        let host = r.host();
        assert_eq!(host.child_names(root), vec![DEFAULT_TREE_NAME]);
        let top = host.children(root)[0];
        assert_eq!(host.child_names(top), vec!["a", "b"]);
        drop(host);
        assert_eq!(r.instance_count(), 3);
        assert_eq!(r.kind(r.root(&tree).unwrap()), Some(InstanceKind::Host));
    }

    #[test]
    fn mount_uses_given_name() {
        let (mut r, root) = mounted_under_root();
        r.mount(label("x"), Some(root), Some("Hud")).unwrap();
        assert_eq!(r.host().child_names(root), vec!["Hud"]);
    }

    #[test]
    fn unmount_leaks_nothing() {
        let (mut r, root) = mounted_under_root();
        let cleanups = Rc::new(Cell::new(0));
        let counter = Rc::clone(&cleanups);
        let with_effect = move |_: &Props| {
            let counter = Rc::clone(&counter);
            use_effect_cleanup(move || move || counter.set(counter.get() + 1), ());
            Ok(Some(frame([label("inner")])))
        };
        let tree = r
            .mount(
                frame([
                    Element::function(with_effect, Props::new()),
                    Element::fragment([label("x"), label("y")]),
                ]),
                Some(root),
                None,
            )
            .unwrap();
        assert!(r.host().live_count() > 1);

        r.unmount(&tree).unwrap();
        assert_eq!(r.host().live_count(), 1);
        assert!(r.host().children(root).is_empty());
        assert_eq!(r.instance_count(), 0);
        assert_eq!(cleanups.get(), 1);
    }

    #[test]
    fn second_unmount_is_rejected() {
        let mut r = reconciler();
        let tree = r.mount(label("x"), None, None).unwrap();
        r.unmount(&tree).unwrap();
        assert!(matches!(r.unmount(&tree), Err(Error::TreeAlreadyUnmounted)));
        assert!(matches!(
            r.update(&tree, label("y")),
            Err(Error::TreeAlreadyUnmounted)
        ));
    }

    #[test]
    fn identical_update_issues_no_host_calls() {
        let (mut r, root) = mounted_under_root();
        let build = || {
            frame([
                label("a").keyed("a"),
                Element::function(leaf, props! { "Text" => "b" }).keyed("b"),
                Element::fragment([label("c"), label("d")]),
            ])
        };
        let tree = r.mount(build(), Some(root), None).unwrap();
        r.update(&tree, build()).unwrap();
        r.host_mut().take_calls();

        let same = r.update(&tree, build()).unwrap();
        assert_eq!(same, tree);
        assert_eq!(mutations(r.host().calls()), 0);
    }

    #[test]
    fn keyed_reorder_only_moves() {
        let (mut r, root) = mounted_under_root();
        let tree = r.mount(keyed_leaves(&["a", "b"]), Some(root), None).unwrap();
        let top = r.root(&tree).unwrap();
        let before = r.children(top);
        r.host_mut().take_calls();

        r.update(&tree, keyed_leaves(&["b", "a"])).unwrap();

        let after = r.children(top);
        assert_eq!(after, vec![before[1], before[0]]);
        let calls = r.host_mut().take_calls();
        assert!(!calls.is_empty());
        assert!(calls.iter().all(|call| matches!(call, HostCall::Attach { .. })));
        let frame_id = r.host_object(top).unwrap();
        assert_eq!(r.host().child_names(frame_id), vec!["b", "a"]);
    }

    #[test]
    fn changing_a_key_remounts() {
        let (mut r, root) = mounted_under_root();
        let tree = r.mount(keyed_leaves(&["1"]), Some(root), None).unwrap();
        let top = r.root(&tree).unwrap();
        let before = r.children(top)[0];

        r.host_mut().take_calls();
        r.update(&tree, keyed_leaves(&["2"])).unwrap();
        let after = r.children(top)[0];

        assert_ne!(before, after);
        assert!(!r.is_mounted(before));
        let calls = r.host_mut().take_calls();
        assert!(calls.iter().any(|c| matches!(c, HostCall::Destroy { .. })));
        assert!(calls.iter().any(|c| matches!(c, HostCall::Create { .. })));
    }

    #[test]
    fn changing_component_type_remounts() {
        let mut r = reconciler();
        let tree = r.mount(label("x"), None, None).unwrap();
        let before = r.root(&tree).unwrap();
        r.update(&tree, frame([])).unwrap();
        let after = r.root(&tree).unwrap();
        assert_ne!(before, after);
        assert_eq!(r.host().live_count(), 1);
    }

    #[test]
    fn distinct_function_pointers_remount() {
        fn counter(_: &Props) -> Rendered {
            let (n, _) = use_state(|| 1_i32);
            Ok(Some(label(&n.to_string())))
        }
        fn greeting(_: &Props) -> Rendered {
            let (text, _) = use_state(|| "hello".to_string());
            Ok(Some(label(&text)))
        }
        let pointer = |render: fn(&Props) -> Rendered| Element::function(render, Props::new());

        let mut r = reconciler();
        let tree = r.mount(pointer(counter), None, None).unwrap();
        let first = r.root(&tree).unwrap();
        r.update(&tree, pointer(counter)).unwrap();
        assert_eq!(r.root(&tree), Some(first));

        r.update(&tree, pointer(greeting)).unwrap();
        let second = r.root(&tree).unwrap();
        assert_ne!(first, second);
        assert!(!r.is_mounted(first));
        let text = r.host_object(r.children(second)[0]).unwrap();
        assert_eq!(r.host().prop(text, "Text"), Some(&PropValue::from("hello")));
    }

    #[test]
    fn memo_components_skip_equal_props() {
        let mut r = reconciler();
        let renders = Rc::new(Cell::new(0));
        let setter: Rc<RefCell<Option<StateSetter<i32>>>> = Rc::new(RefCell::new(None));

        let (count, slot) = (Rc::clone(&renders), Rc::clone(&setter));
        let badge = memo(move |props: &Props| {
            count.set(count.get() + 1);
            let (n, set) = use_state(|| 0);
            *slot.borrow_mut() = Some(set);
            let text = props.get("Text").and_then(PropValue::as_str).unwrap_or_default();
            Ok(Some(label(&format!("{text}{n}"))))
        });
        let tree = r
            .mount(frame([badge.element(props! { "Text" => "a" })]), None, None)
            .unwrap();
        r.update(&tree, frame([badge.element(props! { "Text" => "a" })])).unwrap();
        assert_eq!(renders.get(), 1);

        r.update(&tree, frame([badge.element(props! { "Text" => "b" })])).unwrap();
        assert_eq!(renders.get(), 2);

        setter.borrow().clone().unwrap().set(1);
        r.flush().unwrap();
        assert_eq!(renders.get(), 3);
        let instance = r.children(r.root(&tree).unwrap())[0];
        let text = r.host_object(r.children(instance)[0]).unwrap();
        assert_eq!(r.host().prop(text, "Text"), Some(&PropValue::from("b1")));
    }

    #[test]
    fn props_are_diffed() {
        let mut r = reconciler();
        let tree = r
            .mount(Element::host("Frame", props! { "A" => 1, "B" => 2 }), None, None)
            .unwrap();
        let id = r.host_object(r.root(&tree).unwrap()).unwrap();
        r.host_mut().take_calls();

        r.update(&tree, Element::host("Frame", props! { "A" => 1, "C" => 3 }))
            .unwrap();
        let calls = r.host_mut().take_calls();
        assert_eq!(calls.len(), 2);
        assert!(calls.contains(&HostCall::SetProperty {
            id,
            key: "C".into(),
            value: PropValue::Int(3),
        }));
        assert!(calls.contains(&HostCall::SetProperty {
            id,
            key: "B".into(),
            value: PropValue::Nil,
        }));
        assert_eq!(r.host().prop(id, "B"), None);
    }

    #[test]
    fn duplicate_keys_are_rejected() {
        let mut r = reconciler();
        let err = r
            .mount(frame([label("a").keyed("x"), label("b").keyed("x")]), None, None)
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateKey { ref key } if key == "x"));
        assert!(err.is_structural());
        assert_eq!(r.instance_count(), 0);
        assert_eq!(r.host().live_count(), 0);
    }

    #[test]
    fn fragments_namespace_their_children() {
        let (mut r, root) = mounted_under_root();
        let tree = r
            .mount(
                frame([
                    Element::fragment([label("a").keyed("x")]).keyed("left"),
                    Element::fragment([label("b").keyed("x")]).keyed("right"),
                    label("c"),
                ]),
                Some(root),
                None,
            )
            .unwrap();
        let top = r.root(&tree).unwrap();
        let keys: Vec<_> = r
            .children(top)
            .into_iter()
            .filter_map(|child| r.instance_key(child))
            .map(|key| key.to_string())
            .collect();
        assert_eq!(keys, vec!["left/x", "right/x", "2"]);
        let frame_id = r.host_object(top).unwrap();
        assert_eq!(r.host().children(frame_id).len(), 3);
    }

    #[test]
    fn portal_children_go_to_the_target() {
        let (mut r, root) = mounted_under_root();
        let overlay = r.host_mut().create_external("Folder", "overlay");
        let tree = r
            .mount(
                frame([
                    label("inline"),
                    Element::portal(overlay, [label("floating").keyed("f")]),
                ]),
                Some(root),
                None,
            )
            .unwrap();

        let top = r.host().children(root)[0];
        assert_eq!(r.host().child_names(top), vec!["0"]);
        assert_eq!(r.host().child_names(overlay), vec!["f"]);

        r.unmount(&tree).unwrap();
        assert!(r.host().children(overlay).is_empty());
        assert!(r.host().is_live(overlay));
        assert_eq!(r.host().live_count(), 2);
    }

    #[test]
    fn render_errors_carry_the_component() {
        let mut r = Reconciler::with_config(
            MemoryHost::new(),
            Config::default().with("elementTracing", true).unwrap(),
        );
        fn broken(_: &Props) -> Rendered {
            Err(RenderError::msg("no data"))
        }
        let err = r
            .mount(frame([label("ok"), Element::function(broken, Props::new())]), None, None)
            .unwrap_err();
        match err {
            Error::Render {
                component,
                message,
                location,
            } => {
                assert_eq!(component, "broken");
                assert_eq!(message, "no data");
                assert!(location.is_some());
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(r.host().live_count(), 0);
        assert_eq!(r.instance_count(), 0);
    }

    #[test]
    fn failed_update_keeps_the_tree() {
        let mut r = reconciler();
        let fails = Rc::new(Cell::new(false));
        let flag = Rc::clone(&fails);
        let flaky = move |_: &Props| {
            if flag.get() {
                Err(RenderError::msg("flaky"))
            } else {
                Ok(Some(label("fine")))
            }
        };
        let tree = r
            .mount(frame([Element::function(flaky.clone(), Props::new())]), None, None)
            .unwrap();
        fails.set(true);
        assert!(r
            .update(&tree, frame([Element::function(flaky, Props::new())]))
            .is_err());
        assert_eq!(r.instance_count(), 3);

        r.unmount(&tree).unwrap();
        assert_eq!(r.host().live_count(), 0);
    }

    #[test]
    fn failed_render_does_not_swallow_effects() {
        let mut r = reconciler();
        let runs = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::clone(&runs);
        let tracked = move |props: &Props| {
            let x = props.get("x").and_then(PropValue::as_int).unwrap_or_default();
            let log = Rc::clone(&log);
            use_effect(move || log.borrow_mut().push(x), x);
            if props.contains("fail") {
                return Err(RenderError::msg("failed"));
            }
            Ok(None)
        };
        let element = |props: Props| Element::function(tracked.clone(), props);

        let tree = r.mount(element(props! { "x" => 1 }), None, None).unwrap();
        assert!(r.update(&tree, element(props! { "x" => 2, "fail" => true })).is_err());
        r.update(&tree, element(props! { "x" => 2 })).unwrap();
        r.update(&tree, element(props! { "x" => 2 })).unwrap();
        assert_eq!(*runs.borrow(), vec![1, 2]);
    }

    #[test]
    fn panicking_render_keeps_the_instance_state() {
        let mut r = reconciler();
        let explode = Rc::new(Cell::new(false));
        let setter: Rc<RefCell<Option<StateSetter<i32>>>> = Rc::new(RefCell::new(None));

        let (flag, slot) = (Rc::clone(&explode), Rc::clone(&setter));
        let counter = move |_: &Props| {
            let (n, set) = use_state(|| 0);
            *slot.borrow_mut() = Some(set);
            if flag.get() {
                panic!("render exploded");
            }
            Ok(Some(label(&n.to_string())))
        };
        let tree = r.mount(Element::function(counter, Props::new()), None, None).unwrap();
        let set = setter.borrow().clone().unwrap();

        explode.set(true);
        set.set(5);
        let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| r.flush()));
        assert!(caught.is_err());

        explode.set(false);
        set.update(|n| n + 1);
        r.flush().unwrap();
        let text = r.host_object(r.children(r.root(&tree).unwrap())[0]).unwrap();
        assert_eq!(r.host().prop(text, "Text"), Some(&PropValue::from("6")));
    }

    #[test]
    fn state_updates_coalesce_into_one_render() {
        let mut r = reconciler();
        let renders = Rc::new(Cell::new(0));
        let setter: Rc<RefCell<Option<StateSetter<i32>>>> = Rc::new(RefCell::new(None));

        let (count, slot) = (Rc::clone(&renders), Rc::clone(&setter));
        let counter = move |_: &Props| {
            count.set(count.get() + 1);
            let (value, set) = use_state(|| 0);
            *slot.borrow_mut() = Some(set);
            Ok(Some(label(&value.to_string())))
        };
        let tree = r.mount(Element::function(counter, Props::new()), None, None).unwrap();
        assert_eq!(renders.get(), 1);

        let set = setter.borrow().clone().unwrap();
        set.set(1);
        set.set(2);
        assert!(r.has_pending_work());
        assert_eq!(renders.get(), 1);

        r.flush().unwrap();
        assert_eq!(renders.get(), 2);
        let leaf_host = r.host_object(r.children(r.root(&tree).unwrap())[0]).unwrap();
        assert_eq!(r.host().prop(leaf_host, "Text"), Some(&PropValue::from("2")));
        assert!(!r.has_pending_work());
    }

    #[test]
    fn effects_follow_their_dependencies() {
        let mut r = reconciler();
        let log: Log = Rc::new(RefCell::new(Vec::new()));
        let component = |log: Log| {
            move |props: &Props| {
                let x = props.get("x").and_then(PropValue::as_int).unwrap_or_default();
                let log = Rc::clone(&log);
                use_effect_cleanup(
                    move || {
                        log.borrow_mut().push(format!("run {x}"));
                        move || log.borrow_mut().push(format!("clean {x}"))
                    },
                    x,
                );
                Ok(None)
            }
        };
        let element = |x: i64| Element::function(component(Rc::clone(&log)), props! { "x" => x });

        let tree = r.mount(element(1), None, None).unwrap();
        r.update(&tree, element(1)).unwrap();
        assert_eq!(*log.borrow(), vec!["run 1"]);

        r.update(&tree, element(2)).unwrap();
        assert_eq!(*log.borrow(), vec!["run 1", "clean 1", "run 2"]);

        r.unmount(&tree).unwrap();
        assert_eq!(log.borrow().last().map(String::as_str), Some("clean 2"));
    }

    #[test]
    fn effects_run_children_first_and_layout_before_passive() {
        let mut r = reconciler();
        let log: Log = Rc::new(RefCell::new(Vec::new()));

        let child_log = Rc::clone(&log);
        let child = move |_: &Props| {
            let passive = Rc::clone(&child_log);
            let layout = Rc::clone(&child_log);
            use_effect(move || passive.borrow_mut().push("child passive".into()), ());
            use_layout_effect(move || layout.borrow_mut().push("child layout".into()), ());
            Ok(None)
        };
        let parent_log = Rc::clone(&log);
        let parent = move |_: &Props| {
            let passive = Rc::clone(&parent_log);
            let layout = Rc::clone(&parent_log);
            use_effect(move || passive.borrow_mut().push("parent passive".into()), ());
            use_layout_effect(move || layout.borrow_mut().push("parent layout".into()), ());
            Ok(Some(Element::function(child.clone(), Props::new())))
        };

        r.mount(Element::function(parent, Props::new()), None, None).unwrap();
        assert_eq!(
            *log.borrow(),
            vec!["child layout", "parent layout", "child passive", "parent passive"]
        );
    }

    #[test]
    fn effects_of_removed_instances_never_run() {
        let mut r = reconciler();
        let ran = Rc::new(Cell::new(false));
        let flag = Rc::clone(&ran);
        let watcher = move |_: &Props| {
            let flag = Rc::clone(&flag);
            use_effect(move || flag.set(true), EveryRender);
            Ok(None)
        };
        let tree = r.mount(frame([]), None, None).unwrap();
        let err = r.update(
            &tree,
            frame([
                Element::function(watcher, Props::new()),
                label("x").keyed("d"),
                label("y").keyed("d"),
            ]),
        );
        assert!(err.is_err());
        assert!(!ran.get());
    }

    #[test]
    fn context_changes_reach_only_subscribers() {
        let mut r = reconciler();
        let theme = create_context(String::from("light"));
        let reader_renders = Rc::new(Cell::new(0));
        let bystander_renders = Rc::new(Cell::new(0));

        let reader = {
            let theme = theme.clone();
            let renders = Rc::clone(&reader_renders);
            move |_: &Props| {
                renders.set(renders.get() + 1);
                let current = use_context(&theme);
                Ok(Some(label(&current)))
            }
        };
        let bystander = {
            let renders = Rc::clone(&bystander_renders);
            move |_: &Props| {
                renders.set(renders.get() + 1);
                Ok(Some(label("static")))
            }
        };
        // Stable children: the middle of the tree bails out on update.
        let children = frame([
            Element::function(reader, Props::new()).keyed("reader"),
            Element::function(bystander, Props::new()).keyed("bystander"),
        ]);
        let app = |value: &str| theme.provider(value.to_string(), [children.clone()]);

        let tree = r.mount(app("light"), None, None).unwrap();
        assert_eq!((reader_renders.get(), bystander_renders.get()), (1, 1));

        r.update(&tree, app("dark")).unwrap();
        assert_eq!((reader_renders.get(), bystander_renders.get()), (2, 1));

        r.update(&tree, app("dark")).unwrap();
        assert_eq!(reader_renders.get(), 2);

        let provider = r.root(&tree).unwrap();
        let frame_instance = r.children(provider)[0];
        let reader_instance = r.children(frame_instance)[0];
        let text_host = r.host_object(r.children(reader_instance)[0]).unwrap();
        assert_eq!(r.host().prop(text_host, "Text"), Some(&PropValue::from("dark")));
    }

    #[test]
    fn nested_providers_shadow_and_consumers_fall_back() {
        let mut r = reconciler();
        let depth = create_context(0_i64);
        let show = |depth: &crate::context::Context<i64>| {
            depth.consumer(|value| Ok(Some(Element::host("Value", props! { "n" => *value }))))
        };
        let tree = r
            .mount(
                frame([
                    show(&depth).keyed("outside"),
                    depth.provider(1, [show(&depth).keyed("one"), depth.provider(2, [show(&depth)]).keyed("inner")]).keyed("p"),
                ]),
                None,
                None,
            )
            .unwrap();

        let values: Vec<_> = r
            .host()
            .calls()
            .iter()
            .filter_map(|call| match call {
                HostCall::Create { class, props, .. } if class == "Value" => {
                    props.get("n").and_then(PropValue::as_int)
                }
                _ => None,
            })
            .collect();
        assert_eq!(values, vec![0, 1, 2]);
        r.unmount(&tree).unwrap();
    }

    #[test]
    fn hook_order_violation_fails_the_render() {
        let mut r = reconciler();
        let flip = Rc::new(Cell::new(false));
        let flag = Rc::clone(&flip);
        let unstable = move |_: &Props| {
            if flag.get() {
                let _ = use_ref(|| 0);
            }
            let _ = use_state(|| 0);
            Ok(None)
        };
        let element = || Element::function(unstable.clone(), Props::new());
        let tree = r.mount(element(), None, None).unwrap();
        assert_eq!(r.hooks_debug_info(r.root(&tree).unwrap()).len(), 1);

        flip.set(true);
        let err = r.update(&tree, element()).unwrap_err();
        assert!(matches!(err, Error::HookOrderMismatch { index: 0, .. }));
        assert!(err.is_structural());
    }

    #[test]
    fn host_refs_follow_the_object() {
        let mut r = reconciler();
        let handle = create_ref();
        let tree = r
            .mount(
                Element::host("Frame", props! { REF_KEY => handle.clone() }),
                None,
                None,
            )
            .unwrap();
        let id = r.host_object(r.root(&tree).unwrap());
        assert_eq!(handle.get(), id);
        assert!(r.host().prop(id.unwrap(), REF_KEY).is_none());

        r.unmount(&tree).unwrap();
        assert_eq!(handle.get(), None);
    }

    #[test]
    fn binding_props_update_the_host_directly() {
        let mut r = reconciler();
        let (width, set_width) = create_binding(10);
        let renders = Rc::new(Cell::new(0));
        let counter = Rc::clone(&renders);
        let bar = move |_: &Props| {
            counter.set(counter.get() + 1);
            Ok(Some(Element::host("Bar", props! { "Width" => width.clone() })))
        };
        let tree = r.mount(Element::function(bar, Props::new()), None, None).unwrap();
        let bar_host = r.host_object(r.children(r.root(&tree).unwrap())[0]).unwrap();
        assert_eq!(r.host().prop(bar_host, "Width"), Some(&PropValue::Int(10)));

        set_width.set(25);
        assert_eq!(r.host().prop(bar_host, "Width"), Some(&PropValue::Int(25)));
        assert_eq!(renders.get(), 1);
        assert!(!r.has_pending_work());

        r.unmount(&tree).unwrap();
        set_width.set(30);
        assert!(r.host().calls().iter().all(|call| !matches!(
            call,
            HostCall::SetProperty { value: PropValue::Int(30), .. }
        )));
    }

    #[test]
    fn binding_updates_wait_while_the_host_is_busy() {
        let mut r = reconciler();
        let woken = Rc::new(Cell::new(0));
        let counter = Rc::clone(&woken);
        r.on_schedule(move || counter.set(counter.get() + 1));
        let (width, set_width) = create_binding(10);
        let tree = r
            .mount(Element::host("Bar", props! { "Width" => width.clone() }), None, None)
            .unwrap();
        let bar = r.host_object(r.root(&tree).unwrap()).unwrap();

        {
            let _busy = r.host_mut();
            set_width.set(20);
        }
        assert_eq!(r.host().prop(bar, "Width"), Some(&PropValue::Int(10)));
        assert_eq!(woken.get(), 1);
        assert!(r.has_pending_work());
        r.flush().unwrap();
        assert_eq!(r.host().prop(bar, "Width"), Some(&PropValue::Int(20)));

        {
            let _busy = r.host_mut();
            set_width.set(30);
        }
        set_width.set(40);
        assert!(!r.has_pending_work());
        assert_eq!(r.host().prop(bar, "Width"), Some(&PropValue::Int(40)));
    }

    #[test]
    fn rebinding_the_same_binding_is_not_a_change() {
        let mut r = reconciler();
        let (width, _set_width) = create_binding(1);
        let element = || Element::host("Bar", props! { "Width" => width.clone() });
        let tree = r.mount(element(), None, None).unwrap();
        r.host_mut().take_calls();
        r.update(&tree, element()).unwrap();
        assert!(r.host().calls().is_empty());
    }

    #[test]
    fn effects_that_always_update_are_cut_off() {
        let mut r = Reconciler::with_config(
            MemoryHost::new(),
            Config::default().with_max_update_passes(5).unwrap(),
        );
        let looping = |_: &Props| {
            let (n, set) = use_state(|| 0);
            use_effect(move || set.set(n + 1), EveryRender);
            Ok(None)
        };
        let err = r.mount(Element::function(looping, Props::new()), None, None).unwrap_err();
        assert!(matches!(err, Error::UpdateLoop { passes: 5 }));
        assert!(!r.has_pending_work());
    }

    #[test]
    fn wake_callback_fires_on_schedule() {
        let mut r = reconciler();
        let woken = Rc::new(Cell::new(0));
        let counter = Rc::clone(&woken);
        r.on_schedule(move || counter.set(counter.get() + 1));

        let clicker = |_: &Props| {
            let (_, set) = use_state(|| 0);
            let click = Callback::new(move |_| set.update(|n| n + 1));
            Ok(Some(Element::host("Button", props! { "Activated" => click })))
        };
        let tree = r.mount(Element::function(clicker, Props::new()), None, None).unwrap();
        let button = r.host_object(r.children(r.root(&tree).unwrap())[0]).unwrap();
        let callback = r
            .host()
            .prop(button, "Activated")
            .and_then(PropValue::as_callback)
            .cloned()
            .unwrap();
        callback.invoke(&[]);
        assert_eq!(woken.get(), 1);
        r.flush().unwrap();
    }

    struct Counter {
        log: Log,
    }

    impl ClassComponent for Counter {
        type State = i64;

        fn init(props: &Props) -> (Self, i64) {
            let log = props
                .get("log")
                .and_then(|v| v.downcast::<Log>())
                .cloned()
                .unwrap_or_default();
            (Counter { log }, 0)
        }

        fn render(&self, scope: &ClassScope<'_, Self>) -> Rendered {
            self.log.borrow_mut().push(format!("render {}", scope.state()));
            Ok(Some(label(&scope.state().to_string())))
        }

        fn did_mount(&mut self, scope: &ClassScope<'_, Self>) {
            self.log.borrow_mut().push("did_mount".into());
            scope.set_state(5);
        }

        fn did_update(&mut self, _scope: &ClassScope<'_, Self>, _prev: &Props, prev_state: &i64) {
            self.log.borrow_mut().push(format!("did_update from {prev_state}"));
        }

        fn will_unmount(&mut self, _scope: &ClassScope<'_, Self>) {
            self.log.borrow_mut().push("will_unmount".into());
        }
    }

    #[test]
    fn class_lifecycle_runs_in_order() {
        let mut r = reconciler();
        let log: Log = Rc::new(RefCell::new(Vec::new()));
        let props = Props::new().with("log", PropValue::Any(Rc::new(Rc::clone(&log))));
        let tree = r.mount(Element::class::<Counter>(props), None, None).unwrap();
        assert_eq!(
            *log.borrow(),
            vec!["render 0", "did_mount", "render 5", "did_update from 0"]
        );
        assert_eq!(r.kind(r.root(&tree).unwrap()), Some(InstanceKind::Class));

        r.unmount(&tree).unwrap();
        assert_eq!(log.borrow().last().map(String::as_str), Some("will_unmount"));
        assert_eq!(r.host().live_count(), 0);
    }

    struct Strict;

    impl ClassComponent for Strict {
        type State = ();

        fn validate_props(props: &Props) -> std::result::Result<(), String> {
            if props.contains("Size") {
                Ok(())
            } else {
                Err("Size is required".into())
            }
        }

        fn init(_props: &Props) -> (Self, ()) {
            (Strict, ())
        }

        fn render(&self, _scope: &ClassScope<'_, Self>) -> Rendered {
            Ok(None)
        }
    }

    #[test]
    fn prop_validation_is_opt_in() {
        let mut lenient = reconciler();
        assert!(lenient.mount(Element::class::<Strict>(Props::new()), None, None).is_ok());

        let mut strict = Reconciler::with_config(
            MemoryHost::new(),
            Config::default().with("propValidation", true).unwrap(),
        );
        let err = strict
            .mount(Element::class::<Strict>(Props::new()), None, None)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidProps { ref component, .. } if component == "Strict"));
    }

    #[test]
    fn type_checks_reject_portals_without_target() {
        let mut r = Reconciler::with_config(
            MemoryHost::new(),
            Config::default().with("typeChecks", true).unwrap(),
        );
        let portal = Element::new(ComponentRef::Portal, Props::new().with_children([label("x")]));
        assert!(matches!(r.mount(portal, None, None), Err(Error::TypeCheck(_))));
    }
}
