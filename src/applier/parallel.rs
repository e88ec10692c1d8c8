//! Bounded fan-out for independent sub-resource actions

use std::future::Future;

use futures::stream::{self, StreamExt};
use tracing::debug;

use crate::error::{aggregate, OperatorError, Result};

/// Run `f` over every item with at most `limit` calls in flight.
///
/// Every item runs to completion regardless of its siblings' outcome. Results
/// come back in input order, paired with the input index.
pub async fn run_bounded<T, R, F, Fut>(items: Vec<T>, limit: usize, f: F) -> Vec<(usize, R)>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = R>,
{
    if items.is_empty() {
        return Vec::new();
    }
    debug!(count = items.len(), limit, "running actions in parallel");
    stream::iter(items.into_iter().enumerate())
        .map(|(i, item)| {
            let fut = f(item);
            async move { (i, fut.await) }
        })
        .buffered(limit.max(1))
        .collect()
        .await
}

/// Split indexed results into successes and one aggregated error.
pub fn partition<T>(results: Vec<(usize, Result<T>)>) -> (Vec<(usize, T)>, Result<()>) {
    let mut ok = Vec::with_capacity(results.len());
    let mut errors: Vec<OperatorError> = Vec::new();
    for (i, result) in results {
        match result {
            Ok(value) => ok.push((i, value)),
            Err(e) => errors.push(e),
        }
    }
    (ok, aggregate(errors))
}
