//! The promise core: settlement, waiter registry and chaining.
//!
//! A [`Promise`] settles exactly once. Continuations registered through
//! [`Promise::then`] (and everything built on it) never run inside the call
//! that registered them or inside the call that settled the promise: each one
//! is handed to the promise's [`Scheduler`] as a separate task.
use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use crate::Scheduler;

type Waiter<T, E> = Box<dyn FnOnce(Result<T, E>)>;

/// Observable state of a promise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseState {
    Pending,
    Fulfilled,
    Rejected,
}

/// What a chained callback resolves its downstream promise with.
///
/// `Chain` makes the downstream promise adopt the state of another promise,
/// so a callback can return a promise without producing a promise of a
/// promise.
pub enum Resolution<T: 'static, E: 'static> {
    Value(T),
    Chain(Promise<T, E>),
}

impl<T: 'static, E: 'static> From<Promise<T, E>> for Resolution<T, E> {
    fn from(promise: Promise<T, E>) -> Self {
        Resolution::Chain(promise)
    }
}

impl<T: fmt::Debug + 'static, E: 'static> fmt::Debug for Resolution<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Resolution::Chain(promise) => f.debug_tuple("Chain").field(promise).finish(),
        }
    }
}

/// Return type of chained callbacks. `Err` rejects the downstream promise.
pub type Settlement<T, E> = Result<Resolution<T, E>, E>;

enum State<T, E> {
    Pending(Vec<Waiter<T, E>>),
    Fulfilled(T),
    Rejected(E),
}

struct Inner<T, E> {
    state: State<T, E>,
    wakers: Vec<Waker>,
    handled: bool,
}

struct Shared<T: 'static, E: 'static> {
    scheduler: Scheduler,
    inner: RefCell<Inner<T, E>>,
}

impl<T: 'static, E: 'static> Drop for Shared<T, E> {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        let unobserved = !inner.handled && matches!(inner.state, State::Rejected(_));
        if let State::Pending(waiters) = &mut inner.state {
            if !waiters.is_empty() {
                release(std::mem::take(waiters));
            }
        }
        if unobserved {
            self.scheduler.unhandled_rejection();
        }
    }
}

thread_local! {
    static RELEASING: RefCell<Option<Vec<Box<dyn Any>>>> = const { RefCell::new(None) };
}

/// Drop `value` from a loop instead of from inside the caller's `drop`.
///
/// Pending waiters own the resolvers of their downstream promises, which own
/// further waiters. Dropping a long pending chain would otherwise recurse
/// once per link.
fn release<V: 'static>(value: V) {
    let _ = RELEASING.try_with(move |releasing| {
        let item: Box<dyn Any> = Box::new(value);
        {
            let mut slot = releasing.borrow_mut();
            if let Some(pending) = slot.as_mut() {
                pending.push(item);
                return;
            }
            *slot = Some(vec![item]);
        }
        loop {
            let next = releasing.borrow_mut().as_mut().and_then(Vec::pop);
            match next {
                Some(item) => drop(item),
                None => break,
            }
        }
        *releasing.borrow_mut() = None;
    });
}

/// A value that becomes available later, or a reason it never will.
///
/// Cloning a `Promise` yields another handle to the same settlement.
pub struct Promise<T: 'static, E: 'static> {
    shared: Rc<Shared<T, E>>,
}

impl<T: 'static, E: 'static> Clone for Promise<T, E> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: 'static, E: 'static> fmt::Debug for Promise<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// The capability that settles one particular promise.
///
/// Every clone settles the same promise. Only the first effective call to
/// [`resolve`](Resolver::resolve), [`reject`](Resolver::reject),
/// [`settle`](Resolver::settle) or a completed [`adopt`](Resolver::adopt) has
/// any effect.
pub struct Resolver<T: 'static, E: 'static> {
    shared: Rc<Shared<T, E>>,
}

impl<T: 'static, E: 'static> Clone for Resolver<T, E> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: 'static, E: 'static> fmt::Debug for Resolver<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver").finish_non_exhaustive()
    }
}

impl<T: 'static, E: 'static> Resolver<T, E> {
    /// Whether the promise this resolver targets has left the pending state.
    pub fn is_settled(&self) -> bool {
        !matches!(self.shared.inner.borrow().state, State::Pending(_))
    }
}

impl<T: Clone + 'static, E: Clone + 'static> Resolver<T, E> {
    /// Fulfill the promise with `value`.
    pub fn resolve(&self, value: T) {
        self.settle(Ok(value))
    }

    /// Reject the promise with `reason`.
    pub fn reject(&self, reason: E) {
        self.settle(Err(reason))
    }

    /// Move the promise into the terminal state described by `outcome` and
    /// queue every registered waiter, in registration order.
    pub fn settle(&self, outcome: Result<T, E>) {
        let (waiters, wakers) = {
            let mut inner = self.shared.inner.borrow_mut();
            let waiters = match &mut inner.state {
                State::Pending(waiters) => std::mem::take(waiters),
                _ => {
                    log::trace!("ignoring settlement of an already settled promise");
                    return;
                }
            };
            inner.state = match &outcome {
                Ok(value) => State::Fulfilled(value.clone()),
                Err(reason) => State::Rejected(reason.clone()),
            };
            (waiters, std::mem::take(&mut inner.wakers))
        };
        log::trace!(
            "promise {} with {} waiters",
            if outcome.is_ok() { "fulfilled" } else { "rejected" },
            waiters.len()
        );
        for waiter in waiters {
            let outcome = outcome.clone();
            self.shared.scheduler.schedule(move || waiter(outcome));
        }
        for waker in wakers {
            waker.wake();
        }
    }

    /// Settle the promise the same way `promise` eventually settles.
    pub fn adopt(&self, promise: &Promise<T, E>) {
        let resolver = self.clone();
        promise.subscribe(move |outcome| resolver.settle(outcome));
    }

    /// Fulfill with a plain value or adopt a promise.
    pub fn resolve_with(&self, resolution: Resolution<T, E>) {
        match resolution {
            Resolution::Value(value) => self.resolve(value),
            Resolution::Chain(promise) => self.adopt(&promise),
        }
    }

    fn complete(&self, settlement: Settlement<T, E>) {
        match settlement {
            Ok(resolution) => self.resolve_with(resolution),
            Err(reason) => self.reject(reason),
        }
    }
}

impl<T: 'static, E: 'static> Promise<T, E> {
    /// Current state, without registering interest.
    pub fn state(&self) -> PromiseState {
        match self.shared.inner.borrow().state {
            State::Pending(_) => PromiseState::Pending,
            State::Fulfilled(_) => PromiseState::Fulfilled,
            State::Rejected(_) => PromiseState::Rejected,
        }
    }

    /// The scheduler continuations of this promise are queued on.
    pub fn scheduler(&self) -> &Scheduler {
        &self.shared.scheduler
    }

    /// Whether both handles refer to the same promise.
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        Rc::ptr_eq(&this.shared, &other.shared)
    }
}

impl<T: Clone + 'static, E: Clone + 'static> Promise<T, E> {
    /// Create a promise and run `executor` synchronously with its resolver.
    ///
    /// An `Err` returned by the executor rejects the promise, unless the
    /// executor already settled it.
    ///
    /// # Examples
    ///
    /// ```
    /// use promise_chain::{Promise, PromiseState, TaskQueue};
    ///
    /// let queue = TaskQueue::new();
    /// let promise = Promise::<u32, String>::new(&queue.scheduler(), |resolver| {
    ///     resolver.resolve(7);
    ///     resolver.reject("ignored".to_string());
    ///     Ok(())
    /// });
    /// assert_eq!(promise.state(), PromiseState::Fulfilled);
    /// assert_eq!(promise.peek(), Some(Ok(7)));
    /// ```
    pub fn new<F>(scheduler: &Scheduler, executor: F) -> Self
    where
        F: FnOnce(Resolver<T, E>) -> Result<(), E>,
    {
        let (promise, resolver) = Self::with_resolvers(scheduler);
        if let Err(reason) = executor(resolver.clone()) {
            resolver.reject(reason);
        }
        promise
    }

    /// A pending promise together with the resolver that settles it.
    ///
    /// # Examples
    ///
    /// ```
    /// use promise_chain::{Promise, TaskQueue};
    ///
    /// let queue = TaskQueue::new();
    /// let (promise, resolver) = Promise::<&str, ()>::with_resolvers(&queue.scheduler());
    /// let greeting = promise.map(|name| format!("hello {name}"));
    /// resolver.resolve("world");
    /// queue.run_until_stalled().unwrap();
    /// assert_eq!(greeting.peek(), Some(Ok("hello world".to_string())));
    /// ```
    pub fn with_resolvers(scheduler: &Scheduler) -> (Self, Resolver<T, E>) {
        let promise = Self::from_state(scheduler, State::Pending(Vec::new()));
        let resolver = Resolver {
            shared: promise.shared.clone(),
        };
        (promise, resolver)
    }

    /// An already fulfilled promise.
    pub fn resolve(scheduler: &Scheduler, value: T) -> Self {
        Self::from_state(scheduler, State::Fulfilled(value))
    }

    /// An already rejected promise. `reason` is stored as is.
    pub fn reject(scheduler: &Scheduler, reason: E) -> Self {
        Self::from_state(scheduler, State::Rejected(reason))
    }

    /// A fulfilled promise for `Value`, or the very same promise for `Chain`.
    pub fn resolve_with(scheduler: &Scheduler, resolution: Resolution<T, E>) -> Self {
        match resolution {
            Resolution::Value(value) => Self::resolve(scheduler, value),
            Resolution::Chain(promise) => promise,
        }
    }

    fn from_state(scheduler: &Scheduler, state: State<T, E>) -> Self {
        Self {
            shared: Rc::new(Shared {
                scheduler: scheduler.clone(),
                inner: RefCell::new(Inner {
                    state,
                    wakers: Vec::new(),
                    handled: false,
                }),
            }),
        }
    }

    /// The settled outcome, if any.
    pub fn peek(&self) -> Option<Result<T, E>> {
        match &self.shared.inner.borrow().state {
            State::Pending(_) => None,
            State::Fulfilled(value) => Some(Ok(value.clone())),
            State::Rejected(reason) => Some(Err(reason.clone())),
        }
    }

    /// Register `waiter` for the outcome. It always runs as a scheduled task.
    pub(crate) fn subscribe<F>(&self, waiter: F)
    where
        F: FnOnce(Result<T, E>) + 'static,
    {
        let mut inner = self.shared.inner.borrow_mut();
        inner.handled = true;
        let outcome = match &mut inner.state {
            State::Pending(waiters) => {
                waiters.push(Box::new(waiter));
                return;
            }
            State::Fulfilled(value) => Ok(value.clone()),
            State::Rejected(reason) => Err(reason.clone()),
        };
        drop(inner);
        self.shared.scheduler.schedule(move || waiter(outcome));
    }

    /// Chain a continuation for each outcome onto a new promise.
    ///
    /// The returned promise settles with whatever the selected callback
    /// produces: a value fulfills it, a [`Resolution::Chain`] makes it follow
    /// another promise, an `Err` rejects it.
    ///
    /// # Examples
    ///
    /// ```
    /// use promise_chain::{Promise, Resolution, TaskQueue};
    ///
    /// let queue = TaskQueue::new();
    /// let scheduler = queue.scheduler();
    /// let inner = scheduler.clone();
    /// let chained = Promise::<i32, String>::reject(&scheduler, "boom".into()).then(
    ///     |value| Ok(Resolution::Value(value)),
    ///     move |reason| Ok(Resolution::Chain(Promise::resolve(&inner, reason.len() as i32))),
    /// );
    /// queue.run_until_stalled().unwrap();
    /// assert_eq!(chained.peek(), Some(Ok(4)));
    /// ```
    pub fn then<U, F, R>(&self, on_fulfilled: F, on_rejected: R) -> Promise<U, E>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Settlement<U, E> + 'static,
        R: FnOnce(E) -> Settlement<U, E> + 'static,
    {
        let (downstream, resolver) = Promise::with_resolvers(&self.shared.scheduler);
        self.subscribe(move |outcome| {
            let settlement = match outcome {
                Ok(value) => on_fulfilled(value),
                Err(reason) => on_rejected(reason),
            };
            resolver.complete(settlement);
        });
        downstream
    }

    /// Transform the fulfilled value. Rejections pass through untouched.
    pub fn map<U, F>(&self, f: F) -> Promise<U, E>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> U + 'static,
    {
        self.then(move |value| Ok(Resolution::Value(f(value))), |reason| Err(reason))
    }

    /// Continue with another promise once this one fulfills.
    pub fn and_then<U, F>(&self, f: F) -> Promise<U, E>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Promise<U, E> + 'static,
    {
        self.then(move |value| Ok(Resolution::Chain(f(value))), |reason| Err(reason))
    }

    /// Handle a rejection. Fulfilled values pass through untouched.
    pub fn catch<R>(&self, on_rejected: R) -> Promise<T, E>
    where
        R: FnOnce(E) -> Settlement<T, E> + 'static,
    {
        self.then(|value| Ok(Resolution::Value(value)), on_rejected)
    }

    /// Recover from a rejection with another promise.
    pub fn or_else<R>(&self, f: R) -> Promise<T, E>
    where
        R: FnOnce(E) -> Promise<T, E> + 'static,
    {
        self.catch(move |reason| Ok(Resolution::Chain(f(reason))))
    }

    /// Run `callback` once this promise settles, either way.
    ///
    /// The returned promise settles exactly like this one, after the promise
    /// returned by `callback` (if any) fulfills. A rejection coming out of
    /// `callback` replaces the original outcome.
    ///
    /// # Examples
    ///
    /// ```
    /// use promise_chain::{Promise, Resolution, TaskQueue};
    ///
    /// let queue = TaskQueue::new();
    /// let cleaned = Promise::<i32, String>::resolve(&queue.scheduler(), 42)
    ///     .finally(|| Ok(Resolution::Value("cleanup")));
    /// queue.run_until_stalled().unwrap();
    /// assert_eq!(cleaned.peek(), Some(Ok(42)));
    /// ```
    pub fn finally<V, F>(&self, callback: F) -> Promise<T, E>
    where
        V: Clone + 'static,
        F: FnOnce() -> Settlement<V, E> + 'static,
    {
        let (downstream, resolver) = Promise::with_resolvers(&self.shared.scheduler);
        self.subscribe(move |outcome| match callback() {
            Err(reason) => resolver.reject(reason),
            Ok(Resolution::Value(_)) => resolver.settle(outcome),
            Ok(Resolution::Chain(side_effect)) => side_effect.subscribe(move |done| match done {
                Ok(_) => resolver.settle(outcome),
                Err(reason) => resolver.reject(reason),
            }),
        });
        downstream
    }
}

impl<T: Clone + 'static, E: Clone + 'static> IntoFuture for Promise<T, E> {
    type Output = Result<T, E>;
    type IntoFuture = Wait<T, E>;

    fn into_future(self) -> Self::IntoFuture {
        Wait { promise: self }
    }
}

/// Awaitable view of a [`Promise`], created by `.await` or
/// [`IntoFuture::into_future`].
///
/// It does not drive the task queue: whoever polls it must also run the
/// scheduler the promise is bound to. Polling it counts as attaching a
/// handler, so a rejection observed this way is never reported as unhandled.
#[derive(Debug)]
pub struct Wait<T: 'static, E: 'static> {
    promise: Promise<T, E>,
}

impl<T: Clone + 'static, E: Clone + 'static> Future for Wait<T, E> {
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.promise.shared.inner.borrow_mut();
        inner.handled = true;
        let ready = match &inner.state {
            State::Pending(_) => None,
            State::Fulfilled(value) => Some(Ok(value.clone())),
            State::Rejected(reason) => Some(Err(reason.clone())),
        };
        match ready {
            Some(outcome) => Poll::Ready(outcome),
            None => {
                if !inner.wakers.iter().any(|waker| waker.will_wake(cx.waker())) {
                    inner.wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}
