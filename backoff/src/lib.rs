//! Retries fallible async operations, sleeping between attempts as prescribed by a backoff
//! [strategy]. A strategy is any `Iterator<Item = Duration>`; each yielded duration is one
//! more retry, so `take(n)` bounds the number of retries (the first run is not a retry).

use std::future::Future;

pub mod retry;
pub mod strategy;

/// An [Operation] is a re-runnable unit of work producing a fresh future for every attempt.
pub trait Operation {
    type Item;
    type Error;
    type Future: Future<Output = Result<Self::Item, Self::Error>>;

    fn run(&mut self) -> Self::Future;
}

impl<I, E, T, F> Operation for F
where
    T: Future<Output = Result<I, E>>,
    F: FnMut() -> T,
{
    type Item = I;
    type Error = E;
    type Future = T;

    fn run(&mut self) -> Self::Future {
        self()
    }
}

/// Decides whether a failed attempt may be retried. `attempt` is the 1-based count of the
/// attempt that just failed.
pub trait Condition<E> {
    fn can_retry(&mut self, error: &E, attempt: usize) -> bool;
}

impl<E, F> Condition<E> for F
where
    F: FnMut(&E, usize) -> bool,
{
    fn can_retry(&mut self, error: &E, attempt: usize) -> bool {
        self(error, attempt)
    }
}
