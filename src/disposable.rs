/// The two-phase lifecycle contract shared by every loop-owned object.
///
/// `dispose(true)` is the graceful path: the object keeps itself alive for the duration of the
///  call, fires pending user callbacks with their "no result" sentinel, and then releases its
///  sub-resources and callbacks. `dispose(false)` only releases OS resources and fires no user
///  callbacks. Dropping the last reference has the same effect as `dispose(false)`.
///
/// Both variants are idempotent: disposing an already disposed object is a no-op.
pub trait Disposable {
    fn disposed(&self) -> bool;

    fn dispose(&self, graceful: bool);
}
