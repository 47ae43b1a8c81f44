use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use pin_project::pin_project;
use tokio::time::{Instant, Sleep, sleep_until};

use crate::{Condition, Operation};

/// A retry flips between running the [`Operation`] and sleeping for the next backoff delay:
/// ```no_rust
///  [run] --Ok--> return Ok
///    |
///   Err --condition says no--> return Err
///    |
///  next delay --None (strategy exhausted)--> return Err
///    |
///  [sleep] --elapsed--> [run]
/// ```
#[pin_project(project = StateProj)]
enum State<O>
where
    O: Operation,
{
    Running(#[pin] O::Future),
    Sleeping(#[pin] Sleep),
}

/// Future returned by [`Retry::new`]; resolves to the first success or the last error.
#[pin_project]
pub struct Retry<I, O, C>
where
    O: Operation,
{
    #[pin]
    state: State<O>,
    backoff: I,
    operation: O,
    condition: C,
    attempt: usize,
}

impl<I, O, C> Retry<I, O, C>
where
    I: Iterator<Item = Duration>,
    O: Operation,
    C: Condition<O::Error>,
{
    pub fn new<II: IntoIterator<IntoIter = I, Item = I::Item>>(
        backoff: II,
        mut operation: O,
        condition: C,
    ) -> Self {
        Self {
            state: State::Running(operation.run()),
            backoff: backoff.into_iter(),
            operation,
            condition,
            attempt: 1,
        }
    }
}

impl<I, O, C> Future for Retry<I, O, C>
where
    I: Iterator<Item = Duration>,
    O: Operation,
    C: Condition<O::Error>,
{
    type Output = Result<O::Item, O::Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        loop {
            let this = self.as_mut().project();
            match this.state.project() {
                StateProj::Running(op) => {
                    let err = match op.poll(cx) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(Ok(item)) => return Poll::Ready(Ok(item)),
                        Poll::Ready(Err(err)) => err,
                    };
                    let this = self.as_mut().project();
                    if !this.condition.can_retry(&err, *this.attempt) {
                        return Poll::Ready(Err(err));
                    }
                    let Some(delay) = this.backoff.next() else {
                        return Poll::Ready(Err(err));
                    };
                    self.as_mut()
                        .project()
                        .state
                        .set(State::Sleeping(sleep_until(Instant::now() + delay)));
                }
                StateProj::Sleeping(sleep) => {
                    if sleep.poll(cx).is_pending() {
                        return Poll::Pending;
                    }
                    let this = self.as_mut().project();
                    *this.attempt += 1;
                    let next = this.operation.run();
                    self.as_mut().project().state.set(State::Running(next));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::future;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::strategy::{exponential, fixed};

    fn always<E>(_: &E, _: usize) -> bool {
        true
    }

    #[tokio::test]
    async fn first_attempt_succeeds() {
        let result = Retry::new(
            fixed::Interval::from_millis(1),
            || future::ready(Ok::<u64, ()>(42)),
            always,
        )
        .await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test]
    async fn condition_refuses_retry() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let result = Retry::new(
            fixed::Interval::from_millis(1),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                future::ready(Err::<(), &str>("poison"))
            },
            |_: &&str, _| false,
        )
        .await;
        assert_eq!(result, Err("poison"));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn condition_sees_attempt_number() {
        let result = Retry::new(
            fixed::Interval::from_millis(1),
            || future::ready(Err::<(), usize>(0)),
            |_: &usize, attempt| attempt < 3,
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn succeeds_after_failures() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let result = Retry::new(
            exponential::Exponential::from_millis(1).max_retries(5),
            move || {
                let run = counter.fetch_add(1, Ordering::SeqCst) + 1;
                future::ready(if run < 3 { Err(run) } else { Ok(run) })
            },
            always,
        )
        .await;
        assert_eq!(result, Ok(3));
    }

    #[tokio::test]
    async fn exhausts_strategy() {
        let retries = 4;
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let result = Retry::new(
            fixed::Interval::from_millis(1).take(retries),
            move || {
                let run = counter.fetch_add(1, Ordering::SeqCst) + 1;
                future::ready(Err::<(), usize>(run))
            },
            always,
        )
        .await;
        // the first run is not a retry
        assert_eq!(result, Err(retries + 1));
        assert_eq!(runs.load(Ordering::SeqCst), retries + 1);
    }
}
