//! Runtime - owns a reconciler and tracks when a flush is due.
//!
//! State setters never reconcile on their own. They queue work and raise
//! the runtime's [`FlushRequest`]; the owner of the runtime (an event loop,
//! a frame callback, a test) calls [`Runtime::run_pending`] when it gets
//! control back.

use std::cell::{Cell, Ref, RefMut};
use std::rc::Rc;

use arbor_core::{Config, Element, Host, HostId, Reconciler, Result, TreeHandle};

/// Shared flag raised whenever an update is scheduled.
///
/// Clones share the flag, so a clone can be handed to whatever drives the
/// runtime.
#[derive(Clone, Default, Debug)]
pub struct FlushRequest {
    pending: Rc<Cell<bool>>,
}

impl FlushRequest {
    /// Request a flush.
    pub fn request(&self) {
        if !self.pending.replace(true) {
            tracing::trace!("flush requested");
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.get()
    }

    fn clear(&self) {
        self.pending.set(false);
    }
}

/// A reconciler plus the bookkeeping needed to drive it from outside.
pub struct Runtime<H: Host> {
    reconciler: Reconciler<H>,
    flush: FlushRequest,
}

impl<H: Host + 'static> Runtime<H> {
    /// Create a runtime using the process-wide configuration.
    pub fn new(host: H) -> Self {
        Self::wrap(Reconciler::new(host))
    }

    pub fn with_config(host: H, config: Config) -> Self {
        Self::wrap(Reconciler::with_config(host, config))
    }

    fn wrap(reconciler: Reconciler<H>) -> Self {
        let flush = FlushRequest::default();
        let wake = flush.clone();
        reconciler.on_schedule(move || wake.request());
        Self { reconciler, flush }
    }

    /// Mount a new tree. See [`Reconciler::mount`].
    pub fn mount(
        &mut self,
        element: Element,
        host_parent: Option<HostId>,
        name: Option<&str>,
    ) -> Result<TreeHandle> {
        let result = self.reconciler.mount(element, host_parent, name);
        self.settle();
        result
    }

    pub fn update(&mut self, handle: &TreeHandle, element: Element) -> Result<TreeHandle> {
        let result = self.reconciler.update(handle, element);
        self.settle();
        result
    }

    pub fn unmount(&mut self, handle: &TreeHandle) -> Result<()> {
        let result = self.reconciler.unmount(handle);
        self.settle();
        result
    }

    /// Whether a setter scheduled work since the last flush.
    pub fn needs_flush(&self) -> bool {
        self.flush.is_pending()
    }

    /// Flush if anything is pending. Returns whether a flush ran.
    pub fn run_pending(&mut self) -> Result<bool> {
        if !self.flush.is_pending() && !self.reconciler.has_pending_work() {
            return Ok(false);
        }
        tracing::debug!("running pending updates");
        self.flush.clear();
        let result = self.reconciler.flush();
        self.settle();
        result.map(|()| true)
    }

    /// A handle on the flush flag for the code driving this runtime.
    pub fn flush_request(&self) -> FlushRequest {
        self.flush.clone()
    }

    pub fn reconciler(&self) -> &Reconciler<H> {
        &self.reconciler
    }

    pub fn reconciler_mut(&mut self) -> &mut Reconciler<H> {
        &mut self.reconciler
    }

    pub fn host(&self) -> Ref<'_, H> {
        self.reconciler.host()
    }

    pub fn host_mut(&self) -> RefMut<'_, H> {
        self.reconciler.host_mut()
    }

    /// Updates scheduled during a commit are already applied by the time
    /// the reconciler returns.
    fn settle(&self) {
        if !self.reconciler.has_pending_work() {
            self.flush.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_core::host::MemoryHost;
    use arbor_core::{Callback, PropValue, Props, props, use_effect, use_state};
    use std::cell::{Cell, RefCell};

    fn runtime() -> Runtime<MemoryHost> {
        Runtime::with_config(MemoryHost::new(), Config::default())
    }

    #[test]
    fn setter_raises_the_flag_until_flushed() {
        let mut rt = runtime();
        let renders = Rc::new(Cell::new(0));
        let clicks: Rc<RefCell<Option<Callback>>> = Rc::new(RefCell::new(None));

        let (count, slot) = (Rc::clone(&renders), Rc::clone(&clicks));
        let counter = move |_: &Props| {
            count.set(count.get() + 1);
            let (n, set) = use_state(|| 0);
            *slot.borrow_mut() = Some(Callback::new(move |_| set.update(|n| n + 1)));
            Ok(Some(arbor_core::Element::host("TextLabel", props! { "Text" => n })))
        };
        let tree = rt
            .mount(arbor_core::Element::function(counter, Props::new()), None, None)
            .unwrap();
        assert!(!rt.needs_flush());
        assert!(!rt.run_pending().unwrap());

        let click = clicks.borrow().clone().unwrap();
        click.invoke(&[]);
        click.invoke(&[]);
        assert!(rt.needs_flush());
        assert!(rt.flush_request().is_pending());
        assert_eq!(renders.get(), 1);

        assert!(rt.run_pending().unwrap());
        assert!(!rt.needs_flush());
        assert_eq!(renders.get(), 2);

        let label = rt.reconciler().children(rt.reconciler().root(&tree).unwrap())[0];
        let id = rt.reconciler().host_object(label).unwrap();
        assert_eq!(rt.host().prop(id, "Text"), Some(&PropValue::Int(2)));
    }

    #[test]
    fn updates_from_effects_settle_during_mount() {
        let mut rt = runtime();
        let settles = |_: &Props| {
            let (ready, set) = use_state(|| false);
            use_effect(move || set.set(true), ());
            Ok(Some(arbor_core::Element::host("Flag", props! { "Ready" => ready })))
        };
        let tree = rt
            .mount(arbor_core::Element::function(settles, Props::new()), None, None)
            .unwrap();
        assert!(!rt.needs_flush());

        let flag = rt.reconciler().children(rt.reconciler().root(&tree).unwrap())[0];
        let id = rt.reconciler().host_object(flag).unwrap();
        assert_eq!(rt.host().prop(id, "Ready"), Some(&PropValue::Bool(true)));

        rt.unmount(&tree).unwrap();
        assert_eq!(rt.host().live_count(), 0);
    }
}
