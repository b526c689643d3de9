//! Singleflight grouping of concurrent cache misses.
//!
//! The first caller to [`join`](DedupCoordinator::join) a key becomes the
//! [`Leader`] and runs the downstream work; everyone arriving while that group
//! is live becomes a [`Follower`] and waits for the leader's snapshot.
//!
//! Groups live in a table owned by the coordinator instance, so independent
//! layers never interfere. A group is removed when its leader is dropped
//! (published or not) or, when configured, when its forget timer fires first.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::debug;

use super::{DedupError, ResponseSnapshot};

type Slot = Option<Arc<ResponseSnapshot>>;

struct Group {
    id: u64,
    rx: watch::Receiver<Slot>,
    forget: Option<AbortHandle>,
}

struct Inner {
    groups: Mutex<HashMap<String, Group>>,
    forget_after: Option<Duration>,
    next_id: AtomicU64,
}

impl Inner {
    /// Removes the group for `key` if it is still generation `id`.
    ///
    /// Returns the removed group so the caller can cancel its timer.
    fn remove_if_current(&self, key: &str, id: u64) -> Option<Group> {
        let mut groups = self.groups.lock();
        match groups.get(key) {
            Some(group) if group.id == id => groups.remove(key),
            _ => None,
        }
    }
}

/// What a caller must do after joining a key.
#[derive(Debug)]
pub enum Role {
    Leader(Leader),
    Follower(Follower),
}

/// Owns the downstream execution for one group.
///
/// Dropping a leader without calling [`publish`](Self::publish) releases its
/// followers with [`DedupError::LeaderGone`], so a cancelled request can never
/// leave them waiting.
pub struct Leader {
    key: String,
    id: u64,
    tx: watch::Sender<Slot>,
    inner: Arc<Inner>,
}

impl Leader {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Hands `snapshot` to every follower of this group and dissolves it.
    pub fn publish(self, snapshot: ResponseSnapshot) {
        self.tx.send_replace(Some(Arc::new(snapshot)));
    }
}

impl Drop for Leader {
    fn drop(&mut self) {
        if let Some(group) = self.inner.remove_if_current(&self.key, self.id) {
            if let Some(timer) = group.forget {
                timer.abort();
            }
            debug!(key = %self.key, "dedup group released");
        }
    }
}

impl std::fmt::Debug for Leader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Leader")
            .field("key", &self.key)
            .field("id", &self.id)
            .finish()
    }
}

/// Waits for the leader of its group.
#[derive(Debug)]
pub struct Follower {
    rx: watch::Receiver<Slot>,
}

impl Follower {
    /// Resolves to the leader's snapshot once it is published.
    ///
    /// # Errors
    ///
    /// Returns [`DedupError::LeaderGone`] if the leader was dropped without
    /// publishing: its request was cancelled or its response could not be
    /// captured.
    pub async fn wait(mut self) -> Result<Arc<ResponseSnapshot>, DedupError> {
        let slot = self
            .rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| DedupError::LeaderGone)?;
        slot.as_ref().map(Arc::clone).ok_or(DedupError::LeaderGone)
    }
}

/// The per-layer table of in-flight groups.
///
/// Cloning is cheap and clones share the table.
///
/// # Examples
///
/// ```
/// use replay_cache::cache::{DedupCoordinator, ResponseSnapshot, Role};
/// use replay_cache::http::{Headers, StatusCode};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let dedup = DedupCoordinator::new(None);
///
/// let Role::Leader(leader) = dedup.join("/report") else { unreachable!() };
/// let Role::Follower(follower) = dedup.join("/report") else { unreachable!() };
///
/// leader.publish(ResponseSnapshot::new(StatusCode::OK, Headers::new(), "done"));
/// assert_eq!(follower.wait().await.unwrap().body().as_ref(), b"done");
/// assert_eq!(dedup.in_flight(), 0);
/// # }
/// ```
#[derive(Clone)]
pub struct DedupCoordinator {
    inner: Arc<Inner>,
}

impl DedupCoordinator {
    /// Creates an empty table.
    ///
    /// With `forget_after` set, each group is evicted that long after it was
    /// created even if its leader is still running; later arrivals then start a
    /// new group. The original leader still publishes to the followers it
    /// already has.
    pub fn new(forget_after: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(Inner {
                groups: Mutex::new(HashMap::new()),
                forget_after: forget_after.filter(|d| !d.is_zero()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Joins the group for `key`, creating it when none is live.
    ///
    /// Must be called from within a Tokio runtime when a forget delay is
    /// configured, since the timer is a spawned task.
    pub fn join(&self, key: &str) -> Role {
        let mut groups = self.inner.groups.lock();

        if let Some(group) = groups.get(key) {
            debug!(key, "joining in-flight dedup group");
            return Role::Follower(Follower {
                rx: group.rx.clone(),
            });
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(None);
        let forget = self
            .inner
            .forget_after
            .map(|after| spawn_forget(Arc::downgrade(&self.inner), key.to_owned(), id, after));

        groups.insert(key.to_owned(), Group { id, rx, forget });
        debug!(key, "leading new dedup group");

        Role::Leader(Leader {
            key: key.to_owned(),
            id,
            tx,
            inner: Arc::clone(&self.inner),
        })
    }

    /// Number of keys with a live group.
    pub fn in_flight(&self) -> usize {
        self.inner.groups.lock().len()
    }
}

impl std::fmt::Debug for DedupCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupCoordinator")
            .field("forget_after", &self.inner.forget_after)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

fn spawn_forget(inner: Weak<Inner>, key: String, id: u64, after: Duration) -> AbortHandle {
    let task = tokio::spawn(async move {
        tokio::time::sleep(after).await;
        // A group already torn down, or replaced by a newer generation, is left alone.
        if let Some(inner) = inner.upgrade() {
            if inner.remove_if_current(&key, id).is_some() {
                debug!(key = %key, "dedup group forgotten before its leader finished");
            }
        }
    });
    task.abort_handle()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{Headers, StatusCode};

    fn snapshot(body: &'static str) -> ResponseSnapshot {
        ResponseSnapshot::new(StatusCode::OK, Headers::new(), body)
    }

    fn leader(role: Role) -> Leader {
        match role {
            Role::Leader(leader) => leader,
            Role::Follower(_) => panic!("expected leader"),
        }
    }

    fn follower(role: Role) -> Follower {
        match role {
            Role::Follower(follower) => follower,
            Role::Leader(_) => panic!("expected follower"),
        }
    }

    #[tokio::test]
    async fn followers_receive_the_leaders_snapshot() {
        let dedup = DedupCoordinator::new(None);
        let lead = leader(dedup.join("k"));
        let waiters: Vec<_> = (0..3).map(|_| follower(dedup.join("k"))).collect();
        assert_eq!(dedup.in_flight(), 1);

        lead.publish(snapshot("shared"));
        for waiter in waiters {
            assert_eq!(waiter.wait().await.unwrap().body().as_ref(), b"shared");
        }
        assert_eq!(dedup.in_flight(), 0);
    }

    #[tokio::test]
    async fn distinct_keys_get_distinct_groups() {
        let dedup = DedupCoordinator::new(None);
        let _a = leader(dedup.join("a"));
        let _b = leader(dedup.join("b"));
        assert_eq!(dedup.in_flight(), 2);
    }

    #[tokio::test]
    async fn dropped_leader_releases_followers_with_an_error() {
        let dedup = DedupCoordinator::new(None);
        let lead = leader(dedup.join("k"));
        let waiter = follower(dedup.join("k"));

        drop(lead);
        assert!(matches!(waiter.wait().await, Err(DedupError::LeaderGone)));
        assert_eq!(dedup.in_flight(), 0);
        assert!(matches!(dedup.join("k"), Role::Leader(_)));
    }

    #[tokio::test]
    async fn waiting_follower_is_woken_by_publish() {
        let dedup = DedupCoordinator::new(None);
        let lead = leader(dedup.join("k"));
        let waiter = tokio::spawn(follower(dedup.join("k")).wait());

        tokio::task::yield_now().await;
        lead.publish(snapshot("late"));
        assert_eq!(waiter.await.unwrap().unwrap().body().as_ref(), b"late");
    }

    #[tokio::test(start_paused = true)]
    async fn forget_timeout_lets_a_second_leader_start() {
        let dedup = DedupCoordinator::new(Some(Duration::from_millis(100)));
        let first = leader(dedup.join("k"));
        let early = follower(dedup.join("k"));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(dedup.in_flight(), 0);
        let second = leader(dedup.join("k"));

        // The old leader finishing must not tear down the new group.
        first.publish(snapshot("first"));
        assert_eq!(early.wait().await.unwrap().body().as_ref(), b"first");
        assert_eq!(dedup.in_flight(), 1);

        drop(second);
        assert_eq!(dedup.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_after_normal_teardown_is_a_no_op() {
        let dedup = DedupCoordinator::new(Some(Duration::from_millis(100)));
        leader(dedup.join("k")).publish(snapshot("one"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let current = leader(dedup.join("k"));

        // Past the first group's deadline: the second group must survive it.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(dedup.in_flight(), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(dedup.in_flight(), 0);
        drop(current);
    }

    #[test]
    fn zero_forget_delay_is_disabled() {
        let dedup = DedupCoordinator::new(Some(Duration::ZERO));
        let _lead = leader(dedup.join("k"));
        assert_eq!(dedup.in_flight(), 1);
    }
}
