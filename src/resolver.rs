use std::cell::RefCell;
use std::fmt::{Debug, Formatter};
use std::net::IpAddr;
use std::rc::{Rc, Weak};
use std::time::Duration;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::disposable::Disposable;
use crate::event_loop::{ActiveHandle, LoopContext};


/// The OS name lookup, abstracted so tests can control timing and results.
#[cfg_attr(test, mockall::automock)]
#[async_trait(?Send)]
pub trait NameLookup {
    async fn lookup(&self, host: &str) -> anyhow::Result<Vec<IpAddr>>;
}

/// Lookup through the system resolver (IPv4 and IPv6).
pub struct SystemLookup {}

#[async_trait(?Send)]
impl NameLookup for SystemLookup {
    async fn lookup(&self, host: &str) -> anyhow::Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, 0)).await?;
        Ok(addrs.map(|a| a.ip()).collect())
    }
}

type FinishCallback = Box<dyn FnOnce(anyhow::Result<Vec<String>>)>;

/// Asynchronous name resolution with an optional timeout.
///
/// Results are textual IP addresses in the order the OS returned them, with exact duplicates
///  removed (some platforms report the same address several times).
pub struct Resolver {
    inner: Rc<ResolverInner>,
}

struct ResolverInner {
    ctx: Rc<LoopContext>,
    lookup: Rc<dyn NameLookup>,
    myself: Weak<ResolverInner>,
    state: RefCell<ResolverState>,
}

#[derive(Default)]
struct ResolverState {
    request_id: u64,
    task: Option<JoinHandle<()>>,
    on_finish: Option<FinishCallback>,
    ips: Vec<String>,
    active: Option<ActiveHandle>,
    disposed: bool,
}

impl Resolver {
    pub fn new(ctx: &Rc<LoopContext>) -> Resolver {
        Self::with_lookup(ctx, Rc::new(SystemLookup {}))
    }

    pub fn with_lookup(ctx: &Rc<LoopContext>, lookup: Rc<dyn NameLookup>) -> Resolver {
        Resolver {
            inner: Rc::new_cyclic(|myself| ResolverInner {
                ctx: ctx.clone(),
                lookup,
                myself: myself.clone(),
                state: Default::default(),
            }),
        }
    }

    /// Starts resolving `host`, cancelling a previous resolution that is still in flight (its
    ///  callback is dropped without being called). `on_finish` is called exactly once, with the
    ///  deduplicated addresses or with an error if the lookup failed or `timeout_ms` (if
    ///  non-zero) elapsed first.
    pub fn resolve(&self, host: &str, timeout_ms: u64, on_finish: impl FnOnce(anyhow::Result<Vec<String>>) + 'static) -> anyhow::Result<()> {
        if self.inner.state.borrow().disposed {
            bail!("resolver is disposed");
        }
        self.cancel();

        let request_id = {
            let mut state = self.inner.state.borrow_mut();
            state.request_id += 1;
            state.on_finish = Some(Box::new(on_finish));
            state.ips.clear();
            state.active = Some(ActiveHandle::new(&self.inner.ctx));
            state.request_id
        };

        debug!("resolving {:?}, timeout {}ms", host, timeout_ms);

        let host = host.to_string();
        let lookup = self.inner.lookup.clone();
        let myself = self.inner.myself.clone();
        let task = tokio::task::spawn_local(async move {
            let result = if timeout_ms > 0 {
                tokio::select! {
                    r = lookup.lookup(&host) => r,
                    _ = tokio::time::sleep(Duration::from_millis(timeout_ms)) => Err(anyhow!("resolving {:?} timed out after {}ms", host, timeout_ms)),
                }
            }
            else {
                lookup.lookup(&host).await
            };

            if let Some(inner) = myself.upgrade() {
                inner.finish(request_id, result);
            }
        });

        self.inner.state.borrow_mut().task = Some(task);
        Ok(())
    }

    /// Cancels an in-flight resolution. Its callback is not called, and a late OS completion is
    ///  discarded.
    pub fn cancel(&self) {
        let mut state = self.inner.state.borrow_mut();
        if let Some(task) = state.task.take() {
            trace!("cancelling in-flight resolution");
            task.abort();
        }
        state.request_id += 1;
        state.on_finish = None;
        state.active = None;
    }

    pub fn busy(&self) -> bool {
        self.inner.state.borrow().task.is_some()
    }

    /// The addresses of the most recent successful resolution.
    pub fn ips(&self) -> Vec<String> {
        self.inner.state.borrow().ips.clone()
    }
}

impl ResolverInner {
    fn finish(&self, request_id: u64, result: anyhow::Result<Vec<IpAddr>>) {
        let on_finish = {
            let mut state = self.state.borrow_mut();
            if state.request_id != request_id || state.disposed {
                trace!("discarding stale resolution result");
                return;
            }
            state.task = None;
            state.active = None;

            if let Ok(addrs) = &result {
                state.ips = dedup_ips(addrs);
            }
            state.on_finish.take()
        };

        let result = result.map(|_| self.state.borrow().ips.clone());
        match &result {
            Ok(ips) => debug!("resolved {:?}", ips),
            Err(e) => debug!("resolution failed: {}", e),
        }
        if let Some(on_finish) = on_finish {
            on_finish(result);
        }
    }
}

fn dedup_ips(addrs: &[IpAddr]) -> Vec<String> {
    let mut result: Vec<String> = Vec::with_capacity(addrs.len());
    for addr in addrs {
        let s = addr.to_string();
        if !result.contains(&s) {
            result.push(s);
        }
    }
    result
}

impl Disposable for Resolver {
    fn disposed(&self) -> bool {
        self.inner.state.borrow().disposed
    }

    fn dispose(&self, graceful: bool) {
        let on_finish = {
            let mut state = self.inner.state.borrow_mut();
            if state.disposed {
                return;
            }
            state.disposed = true;
            if let Some(task) = state.task.take() {
                task.abort();
            }
            state.active = None;
            state.on_finish.take()
        };

        if graceful {
            if let Some(on_finish) = on_finish {
                on_finish(Err(anyhow!("resolver was disposed")));
            }
        }
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        self.dispose(false);
    }
}

impl Debug for Resolver {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.borrow();
        write!(f, "Resolver{{busy:{}, ips:{:?}}}", state.task.is_some(), state.ips)
    }
}


#[cfg(test)]
mod test {
    use std::cell::Cell;
    use std::net::{Ipv4Addr, Ipv6Addr};
    use mockall::predicate::eq;
    use rstest::rstest;
    use super::*;
    use crate::config::RunMode;
    use crate::test_util::{test_event_loop, test_event_loop_paused};

    struct SlowLookup {
        delay: Duration,
        result: Vec<IpAddr>,
    }

    #[async_trait(?Send)]
    impl NameLookup for SlowLookup {
        async fn lookup(&self, _host: &str) -> anyhow::Result<Vec<IpAddr>> {
            tokio::time::sleep(self.delay).await;
            Ok(self.result.clone())
        }
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[rstest]
    #[case::empty(vec![], vec![])]
    #[case::single(vec![ip("1.2.3.4")], vec!["1.2.3.4"])]
    #[case::duplicates(vec![ip("1.2.3.4"), ip("5.6.7.8"), ip("1.2.3.4")], vec!["1.2.3.4", "5.6.7.8"])]
    #[case::order_preserved(vec![ip("9.9.9.9"), ip("1.1.1.1")], vec!["9.9.9.9", "1.1.1.1"])]
    #[case::v6(vec![IpAddr::V6(Ipv6Addr::LOCALHOST), IpAddr::V4(Ipv4Addr::LOCALHOST), IpAddr::V6(Ipv6Addr::LOCALHOST)], vec!["::1", "127.0.0.1"])]
    fn test_dedup_ips(#[case] addrs: Vec<IpAddr>, #[case] expected: Vec<&str>) {
        assert_eq!(dedup_ips(&addrs), expected);
    }

    #[test]
    fn test_resolve_success() {
        let ev = test_event_loop();

        let mut lookup = MockNameLookup::new();
        lookup.expect_lookup()
            .with(eq("example.org"))
            .times(1)
            .returning(|_| Ok(vec![ip("10.0.0.1"), ip("10.0.0.1"), ip("10.0.0.2")]));

        let result = Rc::new(RefCell::new(None));
        let resolver = ev.enter(|ctx| {
            let resolver = Resolver::with_lookup(ctx, Rc::new(lookup));
            let result = result.clone();
            resolver.resolve("example.org", 0, move |r| *result.borrow_mut() = Some(r.unwrap())).unwrap();
            resolver
        });

        ev.run(RunMode::Default).unwrap();
        assert_eq!(result.borrow().clone(), Some(vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()]));
        assert_eq!(resolver.ips(), vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()]);
        assert!(!resolver.busy());
    }

    #[test]
    fn test_resolve_error_finishes_once() {
        let ev = test_event_loop();

        let mut lookup = MockNameLookup::new();
        lookup.expect_lookup()
            .returning(|_| Err(anyhow!("no such host")));

        let count = Rc::new(Cell::new(0));
        let _resolver = ev.enter(|ctx| {
            let resolver = Resolver::with_lookup(ctx, Rc::new(lookup));
            let count = count.clone();
            resolver.resolve("nowhere.invalid", 0, move |r| {
                assert!(r.is_err());
                count.set(count.get() + 1);
            }).unwrap();
            resolver
        });

        ev.run(RunMode::Default).unwrap();
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn test_timeout_wins() {
        let ev = test_event_loop_paused();
        let lookup = SlowLookup { delay: Duration::from_millis(500), result: vec![ip("1.2.3.4")] };

        let outcomes = Rc::new(RefCell::new(Vec::new()));
        let finished_at = Rc::new(Cell::new(0));
        let resolver = ev.enter(|ctx| {
            let resolver = Resolver::with_lookup(ctx, Rc::new(lookup));
            let outcomes = outcomes.clone();
            let finished_at = finished_at.clone();
            let ctx = ctx.clone();
            resolver.resolve("slow.example", 100, move |r| {
                finished_at.set(ctx.now_ms());
                outcomes.borrow_mut().push(r.is_ok());
            }).unwrap();
            resolver
        });

        ev.run(RunMode::Default).unwrap();
        assert_eq!(*outcomes.borrow(), vec![false]);
        assert!(finished_at.get() >= 100 && finished_at.get() < 500);
        assert!(resolver.ips().is_empty());
    }

    #[test]
    fn test_lookup_beats_timeout() {
        let ev = test_event_loop_paused();
        let lookup = SlowLookup { delay: Duration::from_millis(50), result: vec![ip("1.2.3.4")] };

        let outcomes = Rc::new(RefCell::new(Vec::new()));
        let _resolver = ev.enter(|ctx| {
            let resolver = Resolver::with_lookup(ctx, Rc::new(lookup));
            let outcomes = outcomes.clone();
            resolver.resolve("fast.example", 1000, move |r| outcomes.borrow_mut().push(r.unwrap())).unwrap();
            resolver
        });

        ev.run(RunMode::Default).unwrap();
        assert_eq!(*outcomes.borrow(), vec![vec!["1.2.3.4".to_string()]]);
    }

    #[test]
    fn test_resolve_cancels_previous() {
        let ev = test_event_loop_paused();
        let lookup = Rc::new(SlowLookup { delay: Duration::from_millis(50), result: vec![ip("1.2.3.4")] });

        let first = Rc::new(Cell::new(0));
        let second = Rc::new(Cell::new(0));
        let _resolver = ev.enter(|ctx| {
            let resolver = Resolver::with_lookup(ctx, lookup);
            let first = first.clone();
            resolver.resolve("a.example", 0, move |_| first.set(first.get() + 1)).unwrap();
            let second = second.clone();
            resolver.resolve("b.example", 0, move |_| second.set(second.get() + 1)).unwrap();
            resolver
        });

        ev.run(RunMode::Default).unwrap();
        assert_eq!(first.get(), 0);
        assert_eq!(second.get(), 1);
    }

    #[test]
    fn test_graceful_dispose_fires_pending_callback() {
        let ev = test_event_loop_paused();
        let lookup = SlowLookup { delay: Duration::from_millis(50), result: vec![] };

        let outcomes = Rc::new(RefCell::new(Vec::new()));
        let resolver = ev.enter(|ctx| {
            let resolver = Resolver::with_lookup(ctx, Rc::new(lookup));
            let outcomes = outcomes.clone();
            resolver.resolve("a.example", 0, move |r| outcomes.borrow_mut().push(r.is_ok())).unwrap();
            resolver
        });

        resolver.dispose(true);
        resolver.dispose(true);
        ev.run(RunMode::Default).unwrap();

        assert!(resolver.disposed());
        assert_eq!(*outcomes.borrow(), vec![false]);
        assert!(resolver.resolve("b.example", 0, |_| {}).is_err());
    }
}
