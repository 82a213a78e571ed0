//! Bounded worker pools with ordered and dynamic completion disciplines.
//!
//! Two disciplines cover every pipeline in the system:
//!
//! - **ordered**: workers run concurrently but their results are consumed
//!   by a single caller in submission order (the snapshot saver appends
//!   trunk entries this way).
//! - **dynamic**: workers run concurrently and completions are
//!   independent (the snapshot loader restores objects this way).
//!
//! A shared [`ErrorFlag`] lets any worker abort the whole pipeline:
//! not-yet-started workers observe the flag and short-circuit.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;

/// Default pool width: machine parallelism.
#[must_use]
pub fn default_pool_width() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(4)
}

// ---------------------------------------------------------------------------
// ErrorFlag
// ---------------------------------------------------------------------------

/// Sticky error flag shared between pool workers.
#[derive(Debug, Clone, Default)]
pub struct ErrorFlag(Arc<AtomicBool>);

impl ErrorFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Ordered pool
// ---------------------------------------------------------------------------

/// Run `work` over `items` with at most `limit` in flight; feed each
/// produced value to `done` in submission order.
///
/// A worker signals failure by setting `flag` and returning `None`;
/// remaining workers are expected to short-circuit on the flag. Returns
/// `true` when the flag stayed clear.
pub async fn run_ordered<I, T, F, Fut>(
    items: Vec<I>,
    limit: usize,
    flag: &ErrorFlag,
    mut work: F,
    mut done: impl FnMut(T),
) -> bool
where
    F: FnMut(I) -> Fut,
    Fut: Future<Output = Option<T>> + Send + 'static,
    T: Send + 'static,
{
    let sem = Arc::new(Semaphore::new(limit.max(1)));
    let mut handles = Vec::with_capacity(items.len());

    for item in items {
        let Ok(permit) = Arc::clone(&sem).acquire_owned().await else {
            break;
        };
        let fut = work(item);
        handles.push(tokio::spawn(async move {
            let _permit = permit;
            fut.await
        }));
    }

    for handle in handles {
        if let Ok(Some(value)) = handle.await {
            done(value);
        }
    }

    !flag.is_set()
}

// ---------------------------------------------------------------------------
// Dynamic pool
// ---------------------------------------------------------------------------

/// Run `work` over `items` with at most `limit` in flight; completions
/// are independent. Returns `true` when `flag` stayed clear.
pub async fn run_dynamic<I, F, Fut>(items: Vec<I>, limit: usize, flag: &ErrorFlag, mut work: F) -> bool
where
    F: FnMut(I) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let sem = Arc::new(Semaphore::new(limit.max(1)));
    let mut handles = Vec::with_capacity(items.len());

    for item in items {
        let Ok(permit) = Arc::clone(&sem).acquire_owned().await else {
            break;
        };
        let fut = work(item);
        handles.push(tokio::spawn(async move {
            let _permit = permit;
            fut.await;
        }));
    }

    for handle in handles {
        let _ = handle.await;
    }

    !flag.is_set()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[tokio::test]
    async fn ordered_results_arrive_in_submission_order() {
        let flag = ErrorFlag::new();
        let mut out = Vec::new();
        let ok = run_ordered(
            (0..32u64).collect(),
            4,
            &flag,
            |i| async move {
                // Later items finish earlier; order must still hold.
                tokio::time::sleep(std::time::Duration::from_millis(32 - i)).await;
                Some(i)
            },
            |v| out.push(v),
        )
        .await;
        assert!(ok);
        assert_eq!(out, (0..32).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn ordered_error_flag_aborts() {
        let flag = ErrorFlag::new();
        let mut out = Vec::new();
        let ok = run_ordered(
            (0..16u64).collect(),
            2,
            &flag,
            |i| {
                let flag = flag.clone();
                async move {
                    if flag.is_set() {
                        return None;
                    }
                    if i == 3 {
                        flag.set();
                        return None;
                    }
                    Some(i)
                }
            },
            |v| out.push(v),
        )
        .await;
        assert!(!ok);
        assert!(!out.contains(&3));
    }

    #[tokio::test]
    async fn dynamic_runs_everything() {
        let flag = ErrorFlag::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let ok = run_dynamic((0..64u64).collect(), 8, &flag, |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
        .await;
        assert!(ok);
        assert_eq!(counter.load(Ordering::SeqCst), 64);
    }

    #[tokio::test]
    async fn dynamic_respects_concurrency_limit() {
        let flag = ErrorFlag::new();
        let live = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        run_dynamic((0..32u64).collect(), 3, &flag, |_| {
            let live = Arc::clone(&live);
            let peak = Arc::clone(&peak);
            async move {
                let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                live.fetch_sub(1, Ordering::SeqCst);
            }
        })
        .await;
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }
}
