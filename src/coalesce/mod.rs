//! Request coalescing (singleflight)
//!
//! The first caller for a key becomes the leader and runs the work; callers
//! arriving with the same key while it runs become followers and receive a
//! clone of the leader's result. The entry is removed as soon as the leader
//! has published, so the next caller starts a fresh cycle.
//!
//! Followers only hold a watch receiver: they can observe the outcome but
//! never touch the leader's state. A follower whose own context fires stops
//! waiting without affecting anyone else. If the leader panics, the panic is
//! published as an error; if the leader is dropped mid-flight, its guard
//! removes the entry and closing the channel releases every follower.

use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

use crate::context::{CallContext, CancelReason};

/// How a caller took part in a coalesced call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Ran the work; `followers` callers shared its result
    Leader { followers: usize },
    /// Received the leader's result
    Follower,
}

impl Role {
    pub fn is_leader(&self) -> bool {
        matches!(self, Role::Leader { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoalesceError {
    /// The follower's own context fired while waiting
    #[error("{0} while waiting for the in-flight call")]
    Cancelled(CancelReason),

    #[error("in-flight call panicked: {0}")]
    LeaderPanicked(String),

    #[error("in-flight call was dropped before it produced a result")]
    LeaderAbandoned,
}

type Slot<T> = Option<Result<T, String>>;

struct InFlight<T> {
    result: watch::Sender<Slot<T>>,
    followers: AtomicUsize,
}

enum Joined<T> {
    Lead(Arc<InFlight<T>>),
    Follow(watch::Receiver<Slot<T>>),
}

pub struct CoalescingGroup<K, T> {
    calls: Mutex<HashMap<K, Arc<InFlight<T>>>>,
}

impl<K, T> CoalescingGroup<K, T>
where
    K: Clone + Eq + Hash,
    T: Clone,
{
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Run `work` once per overlapping burst of calls for `key`
    ///
    /// `ctx` bounds how long a follower waits. The leader runs `work` to
    /// completion; `work` is expected to observe its own cancellation.
    pub async fn run<F, Fut>(&self, key: K, ctx: &CallContext, work: F) -> Result<(T, Role), CoalesceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        // Lookup and insert happen under one lock: at most one leader per key
        let joined = {
            let mut calls = self.calls.lock();
            match calls.get(&key) {
                Some(flight) => {
                    flight.followers.fetch_add(1, Ordering::Relaxed);
                    Joined::Follow(flight.result.subscribe())
                }
                None => {
                    let (result, _) = watch::channel(None);
                    let flight = Arc::new(InFlight {
                        result,
                        followers: AtomicUsize::new(0),
                    });
                    calls.insert(key.clone(), Arc::clone(&flight));
                    Joined::Lead(flight)
                }
            }
        };

        match joined {
            Joined::Follow(receiver) => Self::follow(receiver, ctx)
                .await
                .map(|value| (value, Role::Follower)),
            Joined::Lead(flight) => self.lead(key, flight, work).await,
        }
    }

    /// Number of keys with a call in flight
    pub fn in_flight(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn is_in_flight(&self, key: &K) -> bool {
        self.calls.lock().contains_key(key)
    }

    async fn lead<F, Fut>(&self, key: K, flight: Arc<InFlight<T>>, work: F) -> Result<(T, Role), CoalesceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = FlightGuard {
            group: self,
            key,
            flight: Arc::clone(&flight),
        };

        let outcome = AssertUnwindSafe(async move { work().await })
            .catch_unwind()
            .await
            .map_err(|payload| panic_message(payload.as_ref()));

        flight.result.send_replace(Some(outcome.clone()));
        // Unregister before reading the count: no follower can join afterwards
        drop(guard);
        let followers = flight.followers.load(Ordering::Relaxed);

        match outcome {
            Ok(value) => Ok((value, Role::Leader { followers })),
            Err(message) => Err(CoalesceError::LeaderPanicked(message)),
        }
    }

    async fn follow(mut receiver: watch::Receiver<Slot<T>>, ctx: &CallContext) -> Result<T, CoalesceError> {
        let published = async {
            match receiver.wait_for(Option::is_some).await {
                Ok(slot) => (*slot).clone(),
                // Sender gone without publishing: the leader was dropped
                Err(_) => None,
            }
        };

        let slot = tokio::select! {
            biased;
            reason = ctx.cancelled() => return Err(CoalesceError::Cancelled(reason)),
            slot = published => slot,
        };

        match slot {
            Some(Ok(value)) => Ok(value),
            Some(Err(message)) => Err(CoalesceError::LeaderPanicked(message)),
            None => Err(CoalesceError::LeaderAbandoned),
        }
    }
}

impl<K, T> Default for CoalescingGroup<K, T>
where
    K: Clone + Eq + Hash,
    T: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Removes the leader's entry on every exit path, including drop mid-flight
struct FlightGuard<'a, K, T>
where
    K: Clone + Eq + Hash,
{
    group: &'a CoalescingGroup<K, T>,
    key: K,
    flight: Arc<InFlight<T>>,
}

impl<K, T> Drop for FlightGuard<'_, K, T>
where
    K: Clone + Eq + Hash,
{
    fn drop(&mut self) {
        let mut calls = self.group.calls.lock();
        if calls
            .get(&self.key)
            .map(|current| Arc::ptr_eq(current, &self.flight))
            .unwrap_or(false)
        {
            calls.remove(&self.key);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_execution() {
        let group = CoalescingGroup::<String, u64>::new();
        let executions = AtomicU32::new(0);
        let ctx = CallContext::new();

        let (group, ctx, executions) = (&group, &ctx, &executions);

        let calls = (0..10).map(move |_| {
            group.run("merlion".to_string(), ctx, move || async move {
                executions.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                42
            })
        });
        let results = join_all(calls).await;

        assert_eq!(executions.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| matches!(r, Ok((42, _)))));
        let leaders: Vec<_> = results
            .iter()
            .filter_map(|r| match r {
                Ok((_, Role::Leader { followers })) => Some(*followers),
                _ => None,
            })
            .collect();
        assert_eq!(leaders, vec![9]);
        assert_eq!(group.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_coalescing_across_tasks() {
        let group = Arc::new(CoalescingGroup::<String, String>::new());
        let executions = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let group = Arc::clone(&group);
                let executions = Arc::clone(&executions);
                tokio::spawn(async move {
                    let ctx = CallContext::new();
                    group
                        .run("route:a-b".to_string(), &ctx, || async move {
                            executions.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_secs(1)).await;
                            "12.4km".to_string()
                        })
                        .await
                })
            })
            .collect();

        for handle in handles {
            let (value, _) = handle.await.unwrap().unwrap();
            assert_eq!(value, "12.4km");
        }
        assert_eq!(executions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_calls_start_fresh_cycles() {
        let group = CoalescingGroup::<&'static str, u32>::new();
        let executions = AtomicU32::new(0);
        let ctx = CallContext::new();
        let executions = &executions;

        for expected in 1..=3 {
            let (value, role) = group
                .run("k", &ctx, move || async move { executions.fetch_add(1, Ordering::SeqCst) + 1 })
                .await
                .unwrap();
            assert_eq!(value, expected);
            assert_eq!(role, Role::Leader { followers: 0 });
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_keys_run_independently() {
        let group = CoalescingGroup::<u32, u32>::new();
        let executions = AtomicU32::new(0);
        let ctx = CallContext::new();

        let (group_ref, ctx_ref, executions_ref) = (&group, &ctx, &executions);

        let calls = (0..4).map(move |key| {
            let executions = executions_ref;
            group_ref.run(key, ctx_ref, move || async move {
                executions.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                key * 2
            })
        });
        let results = join_all(calls).await;

        assert_eq!(executions.load(Ordering::SeqCst), 4);
        for (key, result) in results.into_iter().enumerate() {
            let (value, role) = result.unwrap();
            assert_eq!(value, key as u32 * 2);
            assert!(role.is_leader());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_leader_panic_reaches_everyone() {
        let group = CoalescingGroup::<&'static str, u32>::new();
        let ctx = CallContext::new();

        let (group_ref, ctx_ref) = (&group, &ctx);

        let calls = (0..3).map(move |_| {
            group_ref.run("boom", ctx_ref, move || async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                if ctx_ref.is_done() {
                    return 0;
                }
                panic!("adapter bug");
            })
        });
        let results = join_all(calls).await;

        for result in results {
            assert_eq!(result, Err(CoalesceError::LeaderPanicked("adapter bug".to_string())));
        }
        assert_eq!(group.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_follower_cancel_leaves_leader_running() {
        let group = CoalescingGroup::<&'static str, u32>::new();
        let leader_ctx = CallContext::new();
        let impatient = CallContext::with_timeout(Duration::from_millis(100));
        let patient = CallContext::new();

        let work = || async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            7
        };
        let (leader, quitter, stayer) = tokio::join!(
            group.run("slow", &leader_ctx, work),
            group.run("slow", &impatient, work),
            group.run("slow", &patient, work),
        );

        assert_eq!(leader, Ok((7, Role::Leader { followers: 2 })));
        assert_eq!(quitter, Err(CoalesceError::Cancelled(CancelReason::DeadlineExpired)));
        assert_eq!(stayer, Ok((7, Role::Follower)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_leader_releases_followers() {
        let group = Arc::new(CoalescingGroup::<&'static str, u32>::new());

        let leader = {
            let group = Arc::clone(&group);
            tokio::spawn(async move {
                group
                    .run("stuck", &CallContext::new(), || async {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        1
                    })
                    .await
            })
        };
        // Let the leader register
        tokio::task::yield_now().await;
        assert!(group.is_in_flight(&"stuck"));

        let follower = {
            let group = Arc::clone(&group);
            tokio::spawn(async move {
                group
                    .run("stuck", &CallContext::new(), || async { 2 })
                    .await
            })
        };
        tokio::task::yield_now().await;

        leader.abort();
        assert!(leader.await.unwrap_err().is_cancelled());

        assert_eq!(follower.await.unwrap(), Err(CoalesceError::LeaderAbandoned));
        assert_eq!(group.in_flight(), 0);
    }
}
