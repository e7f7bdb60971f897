use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::cell::RefCell;

use anyhow::bail;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::disposable::Disposable;
use crate::event_loop::{ActiveHandle, LoopContext};


type Action = Box<dyn FnOnce() + Send>;

struct DispatchQueue {
    actions: Mutex<VecDeque<Action>>,
    wake: Notify,
    closed: AtomicBool,
}

/// The thread-safe side of a [Dispatcher]. This is the only sanctioned way for other threads to
///  get work done on the event loop.
#[derive(Clone)]
pub struct DispatchHandle {
    queue: Arc<DispatchQueue>,
}

impl DispatchHandle {
    /// Queues an action to run on the loop thread. Fails if the dispatcher was disposed.
    pub fn dispatch(&self, action: impl FnOnce() + Send + 'static) -> anyhow::Result<()> {
        if self.queue.closed.load(Ordering::Acquire) {
            bail!("dispatcher is disposed");
        }
        self.queue.actions.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(Box::new(action));
        self.queue.wake.notify_one();
        Ok(())
    }
}

impl Debug for DispatchHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "DispatchHandle{{closed:{}}}", self.queue.closed.load(Ordering::Acquire))
    }
}


/// The loop side of a cross-thread FIFO of actions.
///
/// Each wake-up runs exactly the front-most action. If more actions are queued, the dispatcher
///  wakes itself again, so other loop work gets a chance to run between actions.
pub struct Dispatcher {
    queue: Arc<DispatchQueue>,
    task: RefCell<Option<JoinHandle<()>>>,
    active: RefCell<Option<ActiveHandle>>,
}

impl Dispatcher {
    pub fn new(ctx: &Rc<LoopContext>) -> Dispatcher {
        let queue = Arc::new(DispatchQueue {
            actions: Default::default(),
            wake: Notify::new(),
            closed: AtomicBool::new(false),
        });

        let task_queue = queue.clone();
        let task = tokio::task::spawn_local(async move {
            loop {
                task_queue.wake.notified().await;

                let (action, more) = {
                    let mut actions = task_queue.actions.lock()
                        .unwrap_or_else(PoisonError::into_inner);
                    let action = actions.pop_front();
                    (action, !actions.is_empty())
                };
                if let Some(action) = action {
                    trace!("running dispatched action");
                    action();
                }
                if more {
                    task_queue.wake.notify_one();
                    tokio::task::yield_now().await;
                }
            }
        });

        Dispatcher {
            queue,
            task: RefCell::new(Some(task)),
            active: RefCell::new(Some(ActiveHandle::new(ctx))),
        }
    }

    pub fn handle(&self) -> DispatchHandle {
        DispatchHandle {
            queue: self.queue.clone(),
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.actions.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Disposable for Dispatcher {
    fn disposed(&self) -> bool {
        self.queue.closed.load(Ordering::Acquire)
    }

    fn dispose(&self, _graceful: bool) {
        if self.queue.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = self.task.borrow_mut().take() {
            task.abort();
        }
        self.active.borrow_mut().take();

        let dropped = std::mem::take(&mut *self.queue.actions.lock()
            .unwrap_or_else(PoisonError::into_inner));
        trace!("dispatcher disposed, dropping {} queued actions", dropped.len());
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.dispose(false);
    }
}

impl Debug for Dispatcher {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Dispatcher{{pending:{}}}", self.pending())
    }
}


#[cfg(test)]
mod test {
    use std::sync::mpsc;
    use super::*;
    use crate::config::RunMode;
    use crate::test_util::test_event_loop;

    #[test]
    fn test_dispatch_from_other_thread() {
        let ev = test_event_loop();
        let dispatcher = ev.enter(|ctx| Dispatcher::new(ctx));
        let handle = dispatcher.handle();

        let (tx, rx) = mpsc::channel::<u32>();
        let thread = std::thread::spawn(move || {
            for i in 0..10 {
                let tx = tx.clone();
                handle.dispatch(move || tx.send(i).unwrap()).unwrap();
            }
        });

        let received = Rc::new(RefCell::new(Vec::new()));
        let ctx = ev.context();
        let received2 = received.clone();
        let poll = ev.enter(|ctx2| {
            let timer = crate::timer::Timer::new(ctx2);
            timer.start(1, 1, move || {
                while let Ok(i) = rx.try_recv() {
                    received2.borrow_mut().push(i);
                }
                if received2.borrow().len() == 10 {
                    ctx.stop();
                }
            }).unwrap();
            timer
        });

        ev.run(RunMode::Default).unwrap();
        thread.join().unwrap();
        drop(poll);

        assert_eq!(*received.borrow(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_one_action_per_wake_runs_all_eventually() {
        let ev = test_event_loop();
        let dispatcher = ev.enter(|ctx| Dispatcher::new(ctx));
        let handle = dispatcher.handle();

        let done = Arc::new(AtomicBool::new(false));
        for _ in 0..3 {
            handle.dispatch(|| {}).unwrap();
        }
        let done2 = done.clone();
        handle.dispatch(move || done2.store(true, Ordering::Release)).unwrap();
        assert_eq!(dispatcher.pending(), 4);

        for _ in 0..100 {
            if done.load(Ordering::Acquire) {
                break;
            }
            ev.run(RunMode::NoWait).unwrap();
        }
        assert!(done.load(Ordering::Acquire));
        assert_eq!(dispatcher.pending(), 0);
    }

    #[test]
    fn test_dispatch_after_dispose_fails() {
        let ev = test_event_loop();
        let dispatcher = ev.enter(|ctx| Dispatcher::new(ctx));
        let handle = dispatcher.handle();

        dispatcher.dispose(true);
        assert!(dispatcher.disposed());
        assert!(handle.dispatch(|| {}).is_err());
        assert_eq!(ev.context().active_handles(), 0);
    }
}
