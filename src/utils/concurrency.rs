//! Bounded-concurrency mapping over async transforms
//!
//! A small worker pool where each worker claims the next unclaimed index
//! from a shared counter, so one slow or failing item never stalls the rest
//! of the batch.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use futures::future::join_all;

/// Apply an async transform to every item with at most `limit` in flight
///
/// The output is index-aligned with the input: `out[i]` is the transform of
/// `items[i]` regardless of completion order. An item whose transform fails
/// yields `None` at its index and the worker moves on to the next unclaimed
/// item. A `limit` of zero or an empty input returns an empty vec without
/// invoking the transform.
pub async fn map_bounded<T, R, E, F, Fut>(items: Vec<T>, limit: usize, f: F) -> Vec<Option<R>>
where
    F: Fn(T, usize) -> Fut,
    Fut: Future<Output = Result<R, E>>,
{
    if limit == 0 || items.is_empty() {
        return Vec::new();
    }

    let total = items.len();
    let slots: Vec<Mutex<Option<T>>> = items.into_iter().map(|item| Mutex::new(Some(item))).collect();
    let next_index = AtomicUsize::new(0);

    let workers: Vec<_> = (0..limit.min(total))
        .map(|_| {
            let slots = &slots;
            let next_index = &next_index;
            let f = &f;
            async move {
                let mut claimed: Vec<(usize, Option<R>)> = Vec::new();
                loop {
                    let i = next_index.fetch_add(1, Ordering::SeqCst);
                    if i >= total {
                        break;
                    }
                    let item = match slots[i].lock() {
                        Ok(mut slot) => slot.take(),
                        Err(_) => None,
                    };
                    let result = match item {
                        Some(item) => f(item, i).await.ok(),
                        None => None,
                    };
                    claimed.push((i, result));
                }
                claimed
            }
        })
        .collect();

    let mut results: Vec<Option<R>> = Vec::with_capacity(total);
    results.resize_with(total, || None);
    for claimed in join_all(workers).await {
        for (i, result) in claimed {
            results[i] = result;
        }
    }
    results
}
