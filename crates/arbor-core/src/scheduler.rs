//! Update scheduling and effect queues.
//!
//! State setters never reconcile synchronously. They push an update closure
//! tagged with the owning instance; the reconciler applies every queued
//! update in call order at the next flush and then re-renders each touched
//! instance once.
//!
//! Effects are collected while rendering and drained from two ordered
//! queues after host mutations: layout jobs first, then passive jobs.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};

use tracing::{trace, warn};

use crate::instance::InstanceId;

/// A queued state change.
pub(crate) type Update = Box<dyn FnOnce()>;
/// Cleanup returned by an effect.
pub(crate) type Cleanup = Box<dyn FnOnce()>;
/// An effect body.
pub(crate) type EffectFn = Box<dyn FnOnce() -> Option<Cleanup>>;

/// Queue shared between the reconciler and every setter it hands out.
#[derive(Default)]
pub(crate) struct SchedulerShared {
    queue: RefCell<Vec<(InstanceId, Update)>>,
    wake: RefCell<Option<Rc<dyn Fn()>>>,
}

impl SchedulerShared {
    pub fn enqueue(&self, instance: InstanceId, update: Update) {
        self.queue.borrow_mut().push((instance, update));
        trace!(%instance, "update scheduled");
        self.wake();
    }

    /// Tell the owner a flush is due.
    pub fn wake(&self) {
        let wake = self.wake.borrow().clone();
        if let Some(wake) = wake {
            wake();
        }
    }

    pub fn take(&self) -> Vec<(InstanceId, Update)> {
        std::mem::take(&mut *self.queue.borrow_mut())
    }

    pub fn is_empty(&self) -> bool {
        self.queue.borrow().is_empty()
    }

    /// Register a callback invoked whenever an update is queued.
    pub fn set_wake(&self, wake: Option<Rc<dyn Fn()>>) {
        *self.wake.borrow_mut() = wake;
    }
}

/// Where setters for one instance send their updates.
#[derive(Clone)]
pub(crate) struct ScheduleHandle {
    scheduler: Weak<SchedulerShared>,
    instance: InstanceId,
}

impl ScheduleHandle {
    pub fn new(scheduler: &Rc<SchedulerShared>, instance: InstanceId) -> Self {
        Self {
            scheduler: Rc::downgrade(scheduler),
            instance,
        }
    }

    pub fn schedule(&self, update: Update) {
        match self.scheduler.upgrade() {
            Some(scheduler) => scheduler.enqueue(self.instance, update),
            None => warn!(instance = %self.instance, "state update after the reconciler was dropped"),
        }
    }
}

/// Which queue an effect belongs to.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Phase {
    Layout,
    Passive,
}

/// Per-hook effect record: the pending cleanup and whether the owning
/// instance is still mounted.
pub(crate) struct EffectCell {
    cleanup: RefCell<Option<Cleanup>>,
    alive: Cell<bool>,
}

impl EffectCell {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            cleanup: RefCell::new(None),
            alive: Cell::new(true),
        })
    }

    pub fn is_alive(&self) -> bool {
        self.alive.get()
    }

    /// Run the previous cleanup, then `effect`, storing its cleanup.
    pub fn run(&self, effect: EffectFn) -> Result<(), String> {
        if !self.alive.get() {
            return Ok(());
        }
        let previous = self.cleanup.borrow_mut().take();
        if let Some(cleanup) = previous {
            guarded(cleanup)?;
        }
        let cleanup = guarded(effect)?;
        if self.alive.get() {
            *self.cleanup.borrow_mut() = cleanup;
        } else if let Some(cleanup) = cleanup {
            // Unmounted from inside its own effect.
            guarded(cleanup)?;
        }
        Ok(())
    }

    /// Mark dead and run the stored cleanup. Pending runs become no-ops.
    pub fn dispose(&self) -> Result<(), String> {
        self.alive.set(false);
        let cleanup = self.cleanup.borrow_mut().take();
        match cleanup {
            Some(cleanup) => guarded(cleanup),
            None => Ok(()),
        }
    }

    #[cfg(test)]
    pub fn has_cleanup(&self) -> bool {
        self.cleanup.borrow().is_some()
    }
}

/// Run user code, turning a panic into an error message.
pub(crate) fn guarded<T>(f: impl FnOnce() -> T) -> Result<T, String> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
        payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "panicked".to_string())
    })
}

/// An effect collected during a render, not yet queued.
pub(crate) struct PendingEffect {
    pub phase: Phase,
    pub cell: Rc<EffectCell>,
    pub run: EffectFn,
    /// Stores the render's deps in the hook slot.
    pub record_deps: Box<dyn FnOnce()>,
}

/// Work for the commit phase.
pub(crate) enum Job {
    Effect {
        instance: InstanceId,
        component: Rc<str>,
        cell: Rc<EffectCell>,
        run: EffectFn,
    },
    DidMount(InstanceId),
    DidUpdate(InstanceId),
}

/// The two ordered effect queues.
#[derive(Default)]
pub(crate) struct JobQueues {
    layout: VecDeque<Job>,
    passive: VecDeque<Job>,
}

impl JobQueues {
    pub fn push(&mut self, phase: Phase, job: Job) {
        match phase {
            Phase::Layout => self.layout.push_back(job),
            Phase::Passive => self.passive.push_back(job),
        }
    }

    pub fn pop_layout(&mut self) -> Option<Job> {
        self.layout.pop_front()
    }

    pub fn pop_passive(&mut self) -> Option<Job> {
        self.passive.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.is_empty() && self.passive.is_empty()
    }

    /// Queue the effects a render produced for `instance`.
    pub fn extend(&mut self, instance: InstanceId, component: &Rc<str>, effects: Vec<PendingEffect>) {
        for effect in effects {
            (effect.record_deps)();
            self.push(
                effect.phase,
                Job::Effect {
                    instance,
                    component: Rc::clone(component),
                    cell: effect.cell,
                    run: effect.run,
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn updates_keep_call_order() {
        let scheduler = Rc::new(SchedulerShared::default());
        let log = Rc::new(RefCell::new(Vec::new()));
        let handle = ScheduleHandle::new(&scheduler, InstanceId::from_raw(0, 0));
        for n in 0..3 {
            let log = Rc::clone(&log);
            handle.schedule(Box::new(move || log.borrow_mut().push(n)));
        }
        for (_, update) in scheduler.take() {
            update();
        }
        assert_eq!(*log.borrow(), vec![0, 1, 2]);
        assert!(scheduler.is_empty());
    }

    #[test]
    fn wake_fires_on_every_enqueue() {
        let scheduler = Rc::new(SchedulerShared::default());
        let wakes = Rc::new(Cell::new(0));
        let counter = Rc::clone(&wakes);
        scheduler.set_wake(Some(Rc::new(move || counter.set(counter.get() + 1))));
        let handle = ScheduleHandle::new(&scheduler, InstanceId::from_raw(0, 0));
        handle.schedule(Box::new(|| {}));
        handle.schedule(Box::new(|| {}));
        assert_eq!(wakes.get(), 2);
    }

    #[test]
    fn cleanup_runs_before_next_effect() {
        let cell = EffectCell::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        for n in 0..2 {
            let log = Rc::clone(&log);
            cell.run(Box::new(move || -> Option<Cleanup> {
                log.borrow_mut().push(format!("run {n}"));
                let log = Rc::clone(&log);
                Some(Box::new(move || log.borrow_mut().push(format!("clean {n}"))) as Cleanup)
            }))
            .unwrap();
        }
        cell.dispose().unwrap();
        assert_eq!(*log.borrow(), vec!["run 0", "clean 0", "run 1", "clean 1"]);
    }

    #[test]
    fn disposed_cell_skips_pending_runs() {
        let cell = EffectCell::new();
        cell.dispose().unwrap();
        let ran = Rc::new(Cell::new(false));
        let flag = Rc::clone(&ran);
        cell.run(Box::new(move || -> Option<Cleanup> {
            flag.set(true);
            None
        }))
        .unwrap();
        assert!(!ran.get());
        assert!(!cell.has_cleanup());
    }

    #[test]
    fn panicking_effect_is_reported() {
        let cell = EffectCell::new();
        let err = cell
            .run(Box::new(|| -> Option<Cleanup> { panic!("effect blew up") })).unwrap_err();
        assert!(err.contains("effect blew up"));
    }
}
