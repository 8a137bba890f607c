//! Fan-out executor: one task per independent item, every task joined.
//!
//! A failing item never cancels its siblings. Results come back in input
//! order regardless of completion order so that aggregated errors read the
//! same way on every run.

use std::future::Future;

use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::task::JoinError;

use crate::error::{AggregateError, ItemError};

/// Spawn `op(item)` for every item and wait for all of them.
///
/// Output `i` belongs to input `i`.
pub async fn spawn_all<I, O, F, Fut>(items: impl IntoIterator<Item = I>, op: F) -> Vec<Result<O, JoinError>>
where
    F: Fn(I) -> Fut,
    Fut: Future<Output = O> + Send + 'static,
    O: Send + 'static,
{
    let mut futs = FuturesUnordered::new();
    for (idx, item) in items.into_iter().enumerate() {
        let handle = tokio::spawn(op(item));
        futs.push(async move { (idx, handle.await) });
    }

    let mut slots: Vec<(usize, Result<O, JoinError>)> = Vec::with_capacity(futs.len());
    while let Some(done) = futs.next().await {
        slots.push(done);
    }
    slots.sort_by_key(|(idx, _)| *idx);
    slots.into_iter().map(|(_, res)| res).collect()
}

/// Outputs of the items that succeeded plus every error from those that did not.
#[derive(Debug)]
pub struct FanOut<T> {
    pub outputs: Vec<T>,
    pub errors: AggregateError,
}

impl<T> FanOut<T> {
    pub fn into_result(self) -> Result<Vec<T>, AggregateError> {
        if self.errors.is_empty() {
            Ok(self.outputs)
        } else {
            Err(self.errors)
        }
    }
}

/// Run a fallible async operation per item and merge the failures.
pub async fn fan_out<I, T, F, Fut>(items: impl IntoIterator<Item = I>, op: F) -> FanOut<T>
where
    F: Fn(I) -> Fut,
    Fut: Future<Output = Result<T, AggregateError>> + Send + 'static,
    T: Send + 'static,
{
    collect(spawn_all(items, op).await)
}

/// Like [`fan_out`] for synchronous filesystem work, each item on the blocking pool.
pub async fn fan_out_blocking<I, T, F>(items: impl IntoIterator<Item = I>, op: F) -> FanOut<T>
where
    I: Send + 'static,
    T: Send + 'static,
    F: Fn(I) -> Result<T, AggregateError> + Clone + Send + 'static,
{
    let mut futs = FuturesUnordered::new();
    for (idx, item) in items.into_iter().enumerate() {
        let op = op.clone();
        let handle = tokio::task::spawn_blocking(move || op(item));
        futs.push(async move { (idx, handle.await) });
    }

    let mut slots = Vec::with_capacity(futs.len());
    while let Some(done) = futs.next().await {
        slots.push(done);
    }
    slots.sort_by_key(|(idx, _)| *idx);
    collect(slots.into_iter().map(|(_, res)| res).collect())
}

fn collect<T>(results: Vec<Result<Result<T, AggregateError>, JoinError>>) -> FanOut<T> {
    let mut outputs = Vec::with_capacity(results.len());
    let mut errors = AggregateError::new();
    for res in results {
        match res {
            Ok(Ok(out)) => outputs.push(out),
            Ok(Err(errs)) => errors.append(errs),
            Err(join_err) => errors.push(ItemError::Task {
                detail: join_err.to_string(),
            }),
        }
    }
    FanOut { outputs, errors }
}
