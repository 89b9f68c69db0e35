//! Bounded-concurrency map.

use std::future::Future;

use futures::stream::{self, StreamExt};

/// Run `f` over every item with at most `concurrency` futures in flight.
///
/// Results come back in completion order, not input order.
pub async fn map_bounded<T, R, F, Fut>(items: Vec<T>, concurrency: usize, f: F) -> Vec<R>
where
    F: FnMut(T) -> Fut,
    Fut: Future<Output = R>,
{
    stream::iter(items)
        .map(f)
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await
}
