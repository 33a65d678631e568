//! Aggregate operations over many promises.
//!
//! Each input is first normalized with [`Promise::resolve_with`], so plain
//! values (as [`Resolution::Value`]) and promises can be mixed. Results are
//! always reported in input order, never in completion order.
use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::{AggregateError, Promise, PromiseState, Resolution, Scheduler};

/// Outcome of one input of [`Promise::all_settled`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settled<T, E> {
    Fulfilled(T),
    Rejected(E),
}

impl<T, E> Settled<T, E> {
    pub fn status(&self) -> PromiseState {
        match self {
            Settled::Fulfilled(_) => PromiseState::Fulfilled,
            Settled::Rejected(_) => PromiseState::Rejected,
        }
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Settled::Fulfilled(value) => Some(value),
            Settled::Rejected(_) => None,
        }
    }

    pub fn reason(&self) -> Option<&E> {
        match self {
            Settled::Fulfilled(_) => None,
            Settled::Rejected(reason) => Some(reason),
        }
    }
}

impl<T, E> From<Result<T, E>> for Settled<T, E> {
    fn from(outcome: Result<T, E>) -> Self {
        match outcome {
            Ok(value) => Settled::Fulfilled(value),
            Err(reason) => Settled::Rejected(reason),
        }
    }
}

fn normalize<T, E, I>(scheduler: &Scheduler, items: I) -> Vec<Promise<T, E>>
where
    T: Clone + 'static,
    E: Clone + 'static,
    I: IntoIterator,
    I::Item: Into<Resolution<T, E>>,
{
    items
        .into_iter()
        .map(|item| Promise::resolve_with(scheduler, item.into()))
        .collect()
}

/// Fixed-size, input-ordered result buffer with a countdown of empty slots.
struct Slots<V> {
    values: RefCell<Vec<Option<V>>>,
    remaining: Cell<usize>,
}

impl<V> Slots<V> {
    fn new(len: usize) -> Rc<Self> {
        Rc::new(Self {
            values: RefCell::new((0..len).map(|_| None).collect()),
            remaining: Cell::new(len),
        })
    }

    /// Fill slot `index`; returns every value once the last slot is filled.
    fn fill(&self, index: usize, value: V) -> Option<Vec<V>> {
        let mut values = self.values.borrow_mut();
        if values[index].is_some() {
            return None;
        }
        values[index] = Some(value);
        self.remaining.set(self.remaining.get() - 1);
        if self.remaining.get() > 0 {
            return None;
        }
        Some(std::mem::take(&mut *values).into_iter().flatten().collect())
    }
}

impl<T: Clone + 'static, E: Clone + 'static> Promise<T, E> {
    /// Fulfill with every value, in input order, once all inputs fulfill.
    /// Reject with the first rejection reason, without waiting for the rest.
    ///
    /// # Examples
    ///
    /// ```
    /// use promise_chain::{Promise, TaskQueue};
    ///
    /// let queue = TaskQueue::new();
    /// let scheduler = queue.scheduler();
    /// let (slow, resolve_slow) = Promise::<i32, String>::with_resolvers(&scheduler);
    /// let fast = Promise::resolve(&scheduler, 2);
    /// let both = Promise::<i32, String>::all(&scheduler, [slow, fast]);
    /// queue.run_until_stalled().unwrap();
    /// resolve_slow.resolve(1);
    /// queue.run_until_stalled().unwrap();
    /// assert_eq!(both.peek(), Some(Ok(vec![1, 2])));
    /// ```
    pub fn all<I>(scheduler: &Scheduler, items: I) -> Promise<Vec<T>, E>
    where
        I: IntoIterator,
        I::Item: Into<Resolution<T, E>>,
    {
        let inputs = normalize(scheduler, items);
        let (output, resolver) = Promise::with_resolvers(scheduler);
        if inputs.is_empty() {
            resolver.resolve(Vec::new());
            return output;
        }
        let slots = Slots::new(inputs.len());
        for (index, input) in inputs.into_iter().enumerate() {
            let slots = slots.clone();
            let resolver = resolver.clone();
            input.subscribe(move |outcome| {
                if resolver.is_settled() {
                    return;
                }
                match outcome {
                    Ok(value) => {
                        if let Some(values) = slots.fill(index, value) {
                            resolver.resolve(values);
                        }
                    }
                    Err(reason) => resolver.reject(reason),
                }
            });
        }
        output
    }

    /// Settle like whichever input settles first.
    ///
    /// An empty input never settles.
    pub fn race<I>(scheduler: &Scheduler, items: I) -> Promise<T, E>
    where
        I: IntoIterator,
        I::Item: Into<Resolution<T, E>>,
    {
        let (output, resolver) = Promise::with_resolvers(scheduler);
        for input in normalize(scheduler, items) {
            let resolver = resolver.clone();
            input.subscribe(move |outcome| resolver.settle(outcome));
        }
        output
    }

    /// Fulfill with the outcome of every input, in input order, once all of
    /// them have settled. Never rejects.
    pub fn all_settled<I>(scheduler: &Scheduler, items: I) -> Promise<Vec<Settled<T, E>>, E>
    where
        I: IntoIterator,
        I::Item: Into<Resolution<T, E>>,
    {
        let inputs = normalize(scheduler, items);
        let (output, resolver) = Promise::with_resolvers(scheduler);
        if inputs.is_empty() {
            resolver.resolve(Vec::new());
            return output;
        }
        let slots = Slots::new(inputs.len());
        for (index, input) in inputs.into_iter().enumerate() {
            let slots = slots.clone();
            let resolver = resolver.clone();
            input.subscribe(move |outcome| {
                if let Some(outcomes) = slots.fill(index, Settled::from(outcome)) {
                    resolver.resolve(outcomes);
                }
            });
        }
        output
    }

    /// Fulfill with the first value any input fulfills with.
    ///
    /// If every input rejects, reject with an [`AggregateError`] holding the
    /// reasons in input order. An empty input rejects immediately.
    pub fn any<I>(scheduler: &Scheduler, items: I) -> Promise<T, AggregateError<E>>
    where
        I: IntoIterator,
        I::Item: Into<Resolution<T, E>>,
    {
        let inputs = normalize(scheduler, items);
        let (output, resolver) = Promise::with_resolvers(scheduler);
        if inputs.is_empty() {
            resolver.reject(AggregateError { errors: Vec::new() });
            return output;
        }
        let slots = Slots::new(inputs.len());
        for (index, input) in inputs.into_iter().enumerate() {
            let slots = slots.clone();
            let resolver = resolver.clone();
            input.subscribe(move |outcome| {
                if resolver.is_settled() {
                    return;
                }
                match outcome {
                    Ok(value) => resolver.resolve(value),
                    Err(reason) => {
                        if let Some(errors) = slots.fill(index, reason) {
                            resolver.reject(AggregateError { errors });
                        }
                    }
                }
            });
        }
        output
    }
}

#[cfg(test)]
mod tests {
    use super::{Settled, Slots};
    use crate::{AggregateError, Promise, PromiseState, Resolution, TaskQueue};

    #[test]
    fn test_slots_complete_once() {
        let slots = Slots::new(2);
        assert_eq!(slots.fill(1, "b"), None);
        assert_eq!(slots.fill(1, "again"), None);
        assert_eq!(slots.fill(0, "a"), Some(vec!["a", "b"]));
    }

    #[test]
    fn test_all_mixes_values_and_promises() {
        let queue = TaskQueue::new();
        let scheduler = queue.scheduler();
        let items = vec![
            Resolution::Value(1),
            Resolution::Chain(Promise::resolve(&scheduler, 2)),
            Resolution::Value(3),
        ];
        let all = Promise::<i32, ()>::all(&scheduler, items);
        queue.run_until_stalled().unwrap();
        assert_eq!(all.peek(), Some(Ok(vec![1, 2, 3])));
    }

    #[test]
    fn test_all_empty_fulfills() {
        let queue = TaskQueue::new();
        let all = Promise::<i32, ()>::all(&queue.scheduler(), Vec::<Promise<i32, ()>>::new());
        assert_eq!(all.peek(), Some(Ok(vec![])));
    }

    #[test]
    fn test_all_reports_first_rejection_only() {
        let queue = TaskQueue::new();
        let scheduler = queue.scheduler();
        let (first, reject_first) = Promise::<i32, &str>::with_resolvers(&scheduler);
        let (second, reject_second) = Promise::<i32, &str>::with_resolvers(&scheduler);
        let all = Promise::<i32, &str>::all(&scheduler, [first, second]);
        reject_second.reject("second");
        queue.run_until_stalled().unwrap();
        reject_first.reject("first");
        queue.run_until_stalled().unwrap();
        assert_eq!(all.peek(), Some(Err("second")));
        let _ = all.catch(|_| Ok(Resolution::Value(Vec::new())));
    }

    #[test]
    fn test_race_takes_first_settled() {
        let queue = TaskQueue::new();
        let scheduler = queue.scheduler();
        let (slow, resolve_slow) = Promise::<i32, &str>::with_resolvers(&scheduler);
        let (fast, reject_fast) = Promise::<i32, &str>::with_resolvers(&scheduler);
        let race = Promise::<i32, &str>::race(&scheduler, [slow, fast]);
        reject_fast.reject("fast");
        resolve_slow.resolve(1);
        queue.run_until_stalled().unwrap();
        assert_eq!(race.peek(), Some(Err("fast")));
        let _ = race.catch(|_| Ok(Resolution::Value(0)));
    }

    #[test]
    fn test_race_fulfillment_wins_and_later_rejection_is_ignored() {
        let queue = TaskQueue::new();
        let scheduler = queue.scheduler();
        let (pending, reject_pending) = Promise::<i32, &str>::with_resolvers(&scheduler);
        let race = Promise::<i32, &str>::race(&scheduler, [pending, Promise::resolve(&scheduler, 1)]);
        queue.run_until_stalled().unwrap();
        assert_eq!(race.peek(), Some(Ok(1)));
        reject_pending.reject("late");
        queue.run_until_stalled().unwrap();
        assert_eq!(race.peek(), Some(Ok(1)));
    }

    #[test]
    fn test_race_empty_stays_pending() {
        let queue = TaskQueue::new();
        let race = Promise::<i32, ()>::race(&queue.scheduler(), Vec::<Promise<i32, ()>>::new());
        queue.run_until_stalled().unwrap();
        assert_eq!(race.state(), PromiseState::Pending);
    }

    #[test]
    fn test_all_settled_waits_for_every_input() {
        let queue = TaskQueue::new();
        let scheduler = queue.scheduler();
        let (late, resolve_late) = Promise::<i32, &str>::with_resolvers(&scheduler);
        let settled = Promise::<i32, &str>::all_settled(
            &scheduler,
            [Promise::reject(&scheduler, "early"), late],
        );
        queue.run_until_stalled().unwrap();
        assert_eq!(settled.state(), PromiseState::Pending);
        resolve_late.resolve(7);
        queue.run_until_stalled().unwrap();
        let outcomes = settled.peek().unwrap().unwrap();
        assert_eq!(
            outcomes,
            vec![Settled::Rejected("early"), Settled::Fulfilled(7)]
        );
        assert_eq!(outcomes[0].status(), PromiseState::Rejected);
        assert_eq!(outcomes[0].reason(), Some(&"early"));
        assert_eq!(outcomes[1].value(), Some(&7));
    }

    #[test]
    fn test_any_first_fulfillment_wins() {
        let queue = TaskQueue::new();
        let scheduler = queue.scheduler();
        let any = Promise::<i32, &str>::any(
            &scheduler,
            [
                Promise::<i32, &str>::reject(&scheduler, "a"),
                Promise::resolve(&scheduler, 2),
                Promise::resolve(&scheduler, 3),
            ],
        );
        queue.run_until_stalled().unwrap();
        assert_eq!(any.peek(), Some(Ok(2)));
    }

    #[test]
    fn test_any_empty_rejects() {
        let queue = TaskQueue::new();
        let any = Promise::<i32, ()>::any(&queue.scheduler(), Vec::<Promise<i32, ()>>::new());
        assert_eq!(any.peek(), Some(Err(AggregateError { errors: vec![] })));
        let _ = any.catch(|_| Ok(Resolution::Value(0)));
    }
}
