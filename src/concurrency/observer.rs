//! Async change broadcast (component C3).
//!
//! The database actor's update hook turns raw SQLite row notifications into
//! `ChangeEvent`s and fans them out here. Any number of consumers subscribe
//! independently; a slow consumer that falls behind loses the oldest events
//! (`RecvError::Lagged`) rather than stalling everyone else, the same
//! trade-off `tokio::sync::broadcast` makes and the one the teacher's
//! `RealtimeManager` relies on for its websocket fan-out.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::id::AutoId;

/// What happened to the affected rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Created,
    Changed,
    Deleted,
}

/// One notification: a table name, what kind of change, and which rows.
/// `table` is owned rather than `&'static str` because it's sourced from
/// SQLite's update hook, which only ever hands back a borrowed `&str` tied
/// to the hook call, not a crate-wide constant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub table: String,
    pub kind: ChangeKind,
    pub ids: Vec<AutoId>,
}

/// A broadcast point consumers subscribe to. Backed by a
/// `tokio::sync::broadcast::Sender` behind a lock so [`Observer::cancel_all`]
/// can swap in a fresh channel, closing every outstanding receiver at once.
/// Cheap to clone — every clone shares the same underlying channel, which is
/// how the database actor hands a listener handle to the hook closure and
/// to `manager`/`relations` consumers alike.
#[derive(Clone)]
pub struct Observer {
    tx: Arc<RwLock<broadcast::Sender<ChangeEvent>>>,
    capacity: usize,
}

impl Observer {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Observer {
            tx: Arc::new(RwLock::new(tx)),
            capacity,
        }
    }

    /// Subscribe to future events. Events sent before this call are not
    /// replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.read().subscribe()
    }

    /// Publish an event to every current subscriber. Silently dropped if
    /// nobody's listening (the teacher's manager does the same: `let _ =
    /// self.tx.send(event)`).
    pub fn append(&self, event: ChangeEvent) {
        let _ = self.tx.read().send(event);
    }

    pub fn listener_count(&self) -> usize {
        self.tx.read().receiver_count()
    }

    /// Force every outstanding receiver's pending `next()` to resolve to
    /// `None` by replacing the channel outright. Used when a database is
    /// closed: relation queries and other long-lived listeners need to stop
    /// rather than wait forever for an event that will never come.
    pub fn cancel_all(&self) {
        let (tx, _) = broadcast::channel(self.capacity);
        *self.tx.write() = tx;
    }
}

/// Await the next event on `rx`, transparently skipping past any lag
/// (the receiver fell more than `capacity` events behind) rather than
/// surfacing it as an error — callers care about the latest state, not
/// about recovering every intermediate event.
pub async fn next(rx: &mut broadcast::Receiver<ChangeEvent>) -> Option<ChangeEvent> {
    loop {
        match rx.recv().await {
            Ok(event) => return Some(event),
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_appended_event() {
        let observer = Observer::new(16);
        let mut rx = observer.subscribe();
        observer.append(ChangeEvent {
            table: "widgets".to_string(),
            kind: ChangeKind::Created,
            ids: vec![1, 2],
        });
        let event = next(&mut rx).await.unwrap();
        assert_eq!(event.kind, ChangeKind::Created);
        assert_eq!(event.ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn cancel_all_unblocks_listeners() {
        let observer = Observer::new(16);
        let mut rx = observer.subscribe();
        observer.cancel_all();
        assert!(next(&mut rx).await.is_none());
    }

    #[tokio::test]
    async fn events_before_subscribe_are_not_replayed() {
        let observer = Observer::new(16);
        observer.append(ChangeEvent {
            table: "widgets".to_string(),
            kind: ChangeKind::Deleted,
            ids: vec![9],
        });
        let mut rx = observer.subscribe();
        observer.append(ChangeEvent {
            table: "widgets".to_string(),
            kind: ChangeKind::Changed,
            ids: vec![9],
        });
        let event = next(&mut rx).await.unwrap();
        assert_eq!(event.kind, ChangeKind::Changed);
    }
}
