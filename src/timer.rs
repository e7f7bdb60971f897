use std::cell::RefCell;
use std::fmt::{Debug, Formatter};
use std::rc::{Rc, Weak};
use std::time::Duration;

use anyhow::bail;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::disposable::Disposable;
use crate::event_loop::{ActiveHandle, LoopContext};


type TimerCallback = Box<dyn FnMut()>;

/// A one-shot or repeating callback on the event loop, modelled after libuv timers.
///
/// The callback may stop, restart or dispose its own timer. Dropping the [Timer] stops it.
pub struct Timer {
    inner: Rc<TimerInner>,
}

struct TimerInner {
    ctx: Rc<LoopContext>,
    myself: Weak<TimerInner>,
    state: RefCell<TimerState>,
}

struct TimerState {
    timeout_ms: u64,
    repeat_ms: u64,
    on_fire: Option<TimerCallback>,
    task: Option<JoinHandle<()>>,
    /// incremented whenever the schedule changes, so a running task can detect it was superseded
    generation: u64,
    referenced: bool,
    active: Option<ActiveHandle>,
    disposed: bool,
}

impl Timer {
    pub fn new(ctx: &Rc<LoopContext>) -> Timer {
        Timer {
            inner: Rc::new_cyclic(|myself| TimerInner {
                ctx: ctx.clone(),
                myself: myself.clone(),
                state: RefCell::new(TimerState {
                    timeout_ms: 0,
                    repeat_ms: 0,
                    on_fire: None,
                    task: None,
                    generation: 0,
                    referenced: true,
                    active: None,
                    disposed: false,
                }),
            }),
        }
    }

    /// Schedules `on_fire` after `timeout_ms`, and then every `repeat_ms` if that is non-zero.
    ///  Starting an active timer replaces its previous schedule and callback.
    pub fn start(&self, timeout_ms: u64, repeat_ms: u64, on_fire: impl FnMut() + 'static) -> anyhow::Result<()> {
        {
            let mut state = self.inner.state.borrow_mut();
            if state.disposed {
                bail!("timer is disposed");
            }
            state.timeout_ms = timeout_ms;
            state.repeat_ms = repeat_ms;
            state.on_fire = Some(Box::new(on_fire));
        }
        self.inner.schedule(timeout_ms);
        Ok(())
    }

    /// Starts the timer again with its previous timeout, repeat interval and callback.
    pub fn restart(&self) -> anyhow::Result<()> {
        let timeout_ms = {
            let state = self.inner.state.borrow();
            if state.disposed {
                bail!("timer is disposed");
            }
            if state.on_fire.is_none() {
                bail!("timer was never started");
            }
            state.timeout_ms
        };
        self.inner.schedule(timeout_ms);
        Ok(())
    }

    /// Resets a repeating timer so it fires one repeat interval from now. This is the cheap way to
    ///  implement idle timeouts.
    pub fn again(&self) -> anyhow::Result<()> {
        let repeat_ms = {
            let state = self.inner.state.borrow();
            if state.disposed {
                bail!("timer is disposed");
            }
            if state.on_fire.is_none() {
                bail!("timer was never started");
            }
            state.repeat_ms
        };
        if repeat_ms > 0 {
            self.inner.schedule(repeat_ms);
        }
        Ok(())
    }

    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Takes effect at the next time the timer fires.
    pub fn set_repeat(&self, repeat_ms: u64) {
        self.inner.state.borrow_mut().repeat_ms = repeat_ms;
    }

    /// An unreferenced timer does not keep [crate::event_loop::EventLoop::run] from returning.
    pub fn unref(&self) {
        let mut state = self.inner.state.borrow_mut();
        state.referenced = false;
        state.active = None;
    }

    pub fn is_active(&self) -> bool {
        self.inner.state.borrow().task.is_some()
    }
}

impl Disposable for Timer {
    fn disposed(&self) -> bool {
        self.inner.state.borrow().disposed
    }

    fn dispose(&self, _graceful: bool) {
        self.inner.stop();
        let on_fire = {
            let mut state = self.inner.state.borrow_mut();
            state.disposed = true;
            state.on_fire.take()
        };
        drop(on_fire);
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.inner.stop();
    }
}

impl Debug for Timer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.borrow();
        write!(f, "Timer{{timeout:{}ms, repeat:{}ms, active:{}}}", state.timeout_ms, state.repeat_ms, state.task.is_some())
    }
}

impl TimerInner {
    fn schedule(&self, timeout_ms: u64) {
        let mut state = self.state.borrow_mut();
        if let Some(task) = state.task.take() {
            task.abort();
        }
        state.generation += 1;
        if state.referenced && state.active.is_none() {
            state.active = Some(ActiveHandle::new(&self.ctx));
        }

        let generation = state.generation;
        let myself = self.myself.clone();
        state.task = Some(tokio::task::spawn_local(async move {
            let mut deadline = Instant::now() + Duration::from_millis(timeout_ms);
            loop {
                tokio::time::sleep_until(deadline).await;

                let Some(inner) = myself.upgrade() else { return; };
                match inner.fire(generation) {
                    Some(repeat_ms) => deadline = Instant::now() + Duration::from_millis(repeat_ms),
                    None => return,
                }
            }
        }));
    }

    /// Returns the repeat interval if the task should keep going.
    fn fire(&self, generation: u64) -> Option<u64> {
        let on_fire = {
            let mut state = self.state.borrow_mut();
            if state.generation != generation || state.disposed {
                return None;
            }
            if state.repeat_ms == 0 {
                // one-shot: the task is about to finish
                state.task = None;
                state.active = None;
            }
            state.on_fire.take()
        };

        let mut on_fire = on_fire?;
        on_fire();

        let mut state = self.state.borrow_mut();
        if state.on_fire.is_none() && !state.disposed {
            state.on_fire = Some(on_fire);
        }
        if state.generation != generation || state.disposed || state.repeat_ms == 0 || state.task.is_none() {
            return None;
        }
        Some(state.repeat_ms)
    }

    fn stop(&self) {
        let mut state = self.state.borrow_mut();
        if let Some(task) = state.task.take() {
            task.abort();
        }
        state.generation += 1;
        state.active = None;
    }
}
