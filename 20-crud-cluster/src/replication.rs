//! Best-effort state replication between sibling workers.
//!
//! The [`Replicator`] sits between a worker's [`UserStore`] and its link to
//! the supervisor:
//!
//! - **Outbound**: it is registered as a store observer. Every successful
//!   client mutation is published as the *effect* it had (the full resulting
//!   user, or just the id for a delete). The supervisor relays it to every
//!   other worker.
//! - **Inbound**: sibling effects are applied without validation, as an
//!   upsert or a tolerant remove.
//! - **Bootstrap**: on start the worker asks its siblings for a snapshot.
//!   Every sibling answers with its full user list and each answer replaces
//!   the local store wholesale when it arrives. With several siblings the
//!   last answer to arrive wins, and a write that lands between two answers
//!   can be overwritten.
//!
//! There is no ordering across senders, no versioning and no
//! acknowledgement. Bad frames are logged and dropped.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::link::{Inbox, Link};
use crate::message::ReplicationMessage;
use crate::store::{Mutation, StoreObserver, UserStore};

pub struct Replicator {
    worker_id: u16,
    store: Arc<UserStore>,
    link: Link,
}

impl Replicator {
    pub fn new(worker_id: u16, store: Arc<UserStore>, link: Link) -> Arc<Self> {
        Arc::new(Self {
            worker_id,
            store,
            link,
        })
    }

    /// Hooks into the store, starts applying inbound frames and asks the
    /// siblings for a snapshot.
    ///
    /// Does not wait for the snapshot. The returned task finishes when the
    /// link to the supervisor closes.
    pub fn start(self: &Arc<Self>, inbox: Inbox) -> JoinHandle<()> {
        self.store.subscribe(self);

        let this = Arc::clone(self);
        let inbound = inbox.subscribe(move |frame| this.handle_frame(&frame));

        self.publish(ReplicationMessage::SnapshotRequest);
        inbound
    }

    /// Decodes and applies one inbound frame. Undecodable frames are dropped.
    pub fn handle_frame(&self, frame: &str) {
        match ReplicationMessage::decode(frame) {
            Ok(message) => self.apply(message),
            Err(err) => warn!(
                worker_id = self.worker_id,
                error = %err,
                "dropping replication message"
            ),
        }
    }

    /// Applies a message from a sibling to the local store.
    pub fn apply(&self, message: ReplicationMessage) {
        match message {
            ReplicationMessage::Created(user) | ReplicationMessage::Updated(user) => {
                debug!(worker_id = self.worker_id, id = %user.id, "applying replicated upsert");
                self.store.upsert(user);
            }
            ReplicationMessage::Deleted(id) => {
                debug!(worker_id = self.worker_id, %id, "applying replicated delete");
                self.store.remove(&id);
            }
            ReplicationMessage::SnapshotRequest => {
                let users = self.store.list_all();
                debug!(
                    worker_id = self.worker_id,
                    count = users.len(),
                    "answering snapshot request"
                );
                self.publish(ReplicationMessage::SnapshotResponse(users));
            }
            ReplicationMessage::SnapshotResponse(users) => {
                info!(
                    worker_id = self.worker_id,
                    count = users.len(),
                    "replacing local state with snapshot"
                );
                self.store.replace_all(users);
            }
        }
    }

    fn publish(&self, message: ReplicationMessage) {
        let kind = message.kind();
        if let Err(err) = self.link.send(&message) {
            warn!(worker_id = self.worker_id, kind, error = %err, "failed to publish");
        }
    }
}

impl StoreObserver for Replicator {
    fn on_mutation(&self, mutation: &Mutation) {
        let message = match mutation {
            Mutation::Created(user) => ReplicationMessage::Created(user.clone()),
            Mutation::Updated(user) => ReplicationMessage::Updated(user.clone()),
            Mutation::Deleted(id) => ReplicationMessage::Deleted(*id),
        };
        self.publish(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::memory_pair;
    use crate::user::{User, UserChanges};
    use uuid::Uuid;

    fn user(name: &str) -> User {
        UserChanges {
            username: Some(name.into()),
            age: Some(40.into()),
            hobbies: Some(vec!["go".into()]),
        }
        .into_user()
        .unwrap()
    }

    fn replicator() -> (Arc<Replicator>, Arc<UserStore>, Inbox) {
        let ((link, _worker_inbox), (_sup_link, sup_inbox)) = memory_pair();
        let store = Arc::new(UserStore::new());
        let replicator = Replicator::new(1, store.clone(), link);
        store.subscribe(&replicator);
        (replicator, store, sup_inbox)
    }

    fn next_message(inbox: &mut Inbox) -> ReplicationMessage {
        let frame = inbox.try_recv().expect("a frame was published");
        ReplicationMessage::decode(&frame).expect("valid frame")
    }

    #[test]
    fn local_mutations_publish_their_effect() {
        let (_replicator, store, mut out) = replicator();

        let created = store
            .create(UserChanges {
                username: Some("ann".into()),
                age: Some(30.into()),
                hobbies: Some(vec![]),
            })
            .unwrap();
        assert_eq!(next_message(&mut out), ReplicationMessage::Created(created.clone()));

        store.delete(&created.id).unwrap();
        assert_eq!(next_message(&mut out), ReplicationMessage::Deleted(created.id));
    }

    #[test]
    fn failed_mutations_publish_nothing() {
        let (_replicator, store, mut out) = replicator();
        assert!(store.delete(&Uuid::new_v4()).is_err());
        assert!(store.create(UserChanges::default()).is_err());
        assert!(out.try_recv().is_none());
    }

    #[test]
    fn inbound_effects_are_applied_without_echo() {
        let (replicator, store, mut out) = replicator();
        let ann = user("ann");

        replicator.apply(ReplicationMessage::Created(ann.clone()));
        assert_eq!(store.get(&ann.id).unwrap(), ann);

        replicator.apply(ReplicationMessage::Deleted(ann.id));
        replicator.apply(ReplicationMessage::Deleted(ann.id));
        assert!(store.is_empty());

        assert!(out.try_recv().is_none());
    }

    #[test]
    fn snapshot_response_overwrites_instead_of_merging() {
        let (replicator, store, _out) = replicator();
        store.upsert(user("a"));
        store.upsert(user("b"));
        let c = user("c");

        replicator.apply(ReplicationMessage::SnapshotResponse(vec![c.clone()]));

        assert_eq!(store.list_all(), vec![c]);
    }

    #[test]
    fn snapshot_request_is_answered_with_full_state() {
        let (replicator, store, mut out) = replicator();
        let ann = user("ann");
        store.upsert(ann.clone());

        replicator.apply(ReplicationMessage::SnapshotRequest);

        assert_eq!(
            next_message(&mut out),
            ReplicationMessage::SnapshotResponse(vec![ann])
        );
    }

    #[test]
    fn malformed_frames_are_dropped() {
        let (replicator, store, _out) = replicator();
        replicator.handle_frame("{");
        replicator.handle_frame(r#"{"kind":"USER_EXPLODED","payload":{}}"#);
        assert!(store.is_empty());

        let ann = user("ann");
        let frame = ReplicationMessage::Updated(ann.clone()).encode().unwrap();
        replicator.handle_frame(&frame);
        assert_eq!(store.list_all(), vec![ann]);
    }

    #[test]
    fn store_does_not_keep_the_replicator_alive() {
        let (replicator, store, mut out) = replicator();
        let weak = Arc::downgrade(&replicator);
        drop(replicator);

        assert!(weak.upgrade().is_none());
        store.create(UserChanges {
            username: Some("eve".into()),
            age: Some(50.into()),
            hobbies: Some(vec![]),
        })
        .unwrap();
        assert!(out.try_recv().is_none());
    }
}
