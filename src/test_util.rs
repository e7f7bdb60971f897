//! Utilities for testing code that runs on the event loop. They are used by this crate's own tests,
//!  and they are exported so applications can test their message handling the same way.

pub mod loopback;
pub mod message;

use std::cell::Cell;
use std::future::Future;
use std::rc::Rc;

use crate::config::{NetConfig, RunMode};
use crate::event_loop::{ActiveHandle, EventLoop};
use crate::test_util::message::TestCodec;
use crate::timer::Timer;


pub fn test_event_loop() -> EventLoop {
    EventLoop::new(NetConfig::new(), Rc::new(TestCodec))
        .expect("failed to create event loop")
}

/// An event loop on a paused clock: time only advances when the loop has nothing else to do, and
///  then it jumps to the next timer.
pub fn test_event_loop_paused() -> EventLoop {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .expect("failed to create runtime");
    EventLoop::with_runtime(NetConfig::new(), Rc::new(TestCodec), runtime)
        .expect("failed to create event loop")
}

/// Runs the loop until `fut` completed, regardless of other active handles.
pub fn run_future(ev: &EventLoop, fut: impl Future<Output = ()> + 'static) {
    ev.enter(|ctx| {
        let handle = ActiveHandle::new(ctx);
        let ctx = ctx.clone();
        tokio::task::spawn_local(async move {
            fut.await;
            ctx.stop();
            drop(handle);
        });
    });
    ev.run(RunMode::Default)
        .expect("event loop failed");
}

/// Runs the loop until `condition` holds, checking it every millisecond. Returns false if it did
///  not hold within `max_ms`.
pub fn run_until(ev: &EventLoop, max_ms: u64, condition: impl Fn() -> bool + 'static) -> bool {
    let satisfied = Rc::new(Cell::new(false));
    let timer = ev.enter(|ctx| {
        let timer = Timer::new(ctx);
        let ctx = ctx.clone();
        let satisfied = satisfied.clone();
        let deadline = ctx.now_ms() + max_ms;
        timer.start(0, 1, move || {
            if condition() {
                satisfied.set(true);
                ctx.stop();
            }
            else if ctx.now_ms() >= deadline {
                ctx.stop();
            }
        }).expect("failed to start timer");
        timer
    });
    ev.run(RunMode::Default)
        .expect("event loop failed");
    timer.stop();
    satisfied.get()
}
