//! crates/plantgo_core/src/leaderboard.rs
//!
//! Live, ranked read-model of challenge members.
//!
//! Each watched challenge owns a `watch` channel holding the latest snapshot.
//! Writers call [`LeaderboardHub::notify`] after mutating a member; the hub
//! reloads the top-N from the store and pushes it to every subscriber.

use crate::domain::LeaderboardSnapshot;
use crate::ports::{DatabaseService, PortResult};
use futures::Stream;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

struct Channel {
    tx: watch::Sender<Arc<LeaderboardSnapshot>>,
    /// Serializes reloads so a slower, older read never overwrites a newer one.
    refresh: Mutex<()>,
}

pub struct LeaderboardHub {
    db: Arc<dyn DatabaseService>,
    limit: usize,
    channels: Mutex<HashMap<Uuid, Arc<Channel>>>,
}

impl LeaderboardHub {
    pub fn new(db: Arc<dyn DatabaseService>, limit: usize) -> Self {
        Self {
            db,
            limit,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// A one-off read of the current ranking.
    pub async fn snapshot(&self, challenge_id: Uuid) -> PortResult<LeaderboardSnapshot> {
        self.db.leaderboard(challenge_id, self.limit).await
    }

    /// Starts a live subscription. The first [`LeaderboardSubscription::next`]
    /// yields the current ranking, later calls yield each change.
    pub async fn subscribe(&self, challenge_id: Uuid) -> PortResult<LeaderboardSubscription> {
        let existing = self
            .channels
            .lock()
            .await
            .get(&challenge_id)
            .map(|channel| channel.tx.subscribe());
        let rx = match existing {
            Some(rx) => rx,
            None => {
                // Read without the map lock so other challenges keep flowing.
                let snapshot = self.db.leaderboard(challenge_id, self.limit).await?;
                let (rx, created) = match self.channels.lock().await.entry(challenge_id) {
                    Entry::Occupied(entry) => (entry.get().tx.subscribe(), false),
                    Entry::Vacant(entry) => {
                        let (tx, rx) = watch::channel(Arc::new(snapshot));
                        entry.insert(Arc::new(Channel {
                            tx,
                            refresh: Mutex::new(()),
                        }));
                        (rx, true)
                    }
                };
                if created {
                    // Catches changes committed between the read and the insert.
                    self.notify(challenge_id).await;
                }
                rx
            }
        };
        debug!(challenge_id = %challenge_id, "Leaderboard subscriber added.");
        Ok(LeaderboardSubscription {
            rx,
            cancel: CancellationToken::new(),
            delivered_initial: false,
        })
    }

    /// Pushes a fresh snapshot to subscribers of `challenge_id`, if any.
    /// Failures are logged; subscribers keep the previous snapshot.
    pub async fn notify(&self, challenge_id: Uuid) {
        let channel = self.channels.lock().await.get(&challenge_id).cloned();
        let Some(channel) = channel else {
            return;
        };

        let _serialized = channel.refresh.lock().await;
        if channel.tx.receiver_count() == 0 {
            // Subscribers attach under the map lock, so the count is re-checked there.
            let mut channels = self.channels.lock().await;
            let same_channel = channels
                .get(&challenge_id)
                .is_some_and(|current| Arc::ptr_eq(current, &channel));
            if !same_channel {
                return;
            }
            if channel.tx.receiver_count() == 0 {
                channels.remove(&challenge_id);
                debug!(challenge_id = %challenge_id, "Dropped idle leaderboard channel.");
                return;
            }
        }

        match self.db.leaderboard(challenge_id, self.limit).await {
            Ok(snapshot) => {
                let pushed = channel.tx.send_if_modified(|current| {
                    if **current == snapshot {
                        false
                    } else {
                        *current = Arc::new(snapshot);
                        true
                    }
                });
                if pushed {
                    debug!(challenge_id = %challenge_id, "Leaderboard update pushed.");
                }
            }
            Err(e) => warn!(
                challenge_id = %challenge_id,
                "Failed to refresh leaderboard: {}", e
            ),
        }
    }
}

/// Cancels a subscription. Cloneable and idempotent.
#[derive(Clone)]
pub struct UnsubscribeHandle(CancellationToken);

impl UnsubscribeHandle {
    pub fn unsubscribe(&self) {
        self.0.cancel();
    }
}

pub struct LeaderboardSubscription {
    rx: watch::Receiver<Arc<LeaderboardSnapshot>>,
    cancel: CancellationToken,
    delivered_initial: bool,
}

impl LeaderboardSubscription {
    pub fn handle(&self) -> UnsubscribeHandle {
        UnsubscribeHandle(self.cancel.clone())
    }

    pub fn unsubscribe(&self) {
        self.cancel.cancel();
    }

    /// The next snapshot, or `None` once unsubscribed or the hub is gone.
    pub async fn next(&mut self) -> Option<Arc<LeaderboardSnapshot>> {
        if self.cancel.is_cancelled() {
            return None;
        }
        if !self.delivered_initial {
            self.delivered_initial = true;
            return Some(self.rx.borrow_and_update().clone());
        }

        let changed = tokio::select! {
            _ = self.cancel.cancelled() => None,
            res = self.rx.changed() => Some(res),
        };
        match changed {
            Some(Ok(())) => Some(self.rx.borrow_and_update().clone()),
            _ => None,
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Arc<LeaderboardSnapshot>> {
        futures::stream::unfold(self, |mut sub| async move {
            sub.next().await.map(|snapshot| (snapshot, sub))
        })
    }
}
