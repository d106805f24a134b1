use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::channel::DeviceChannel;
use crate::protocol::{
    generate_connection_id, CommandError, DeviceCommand, HandshakeError, ObserverEvent,
};
use crate::storage::Storage;
use crate::target::{RunTarget, TargetInfo, TargetStatus, UNNAMED};

pub type SharedRegistry = Arc<Registry>;

/// Outcome of a successful identity handshake
#[derive(Debug, Clone, PartialEq)]
pub struct BindOutcome {
    pub identity: String,
    /// True on first-ever contact, false on a reconnect
    pub is_new: bool,
}

/// A connection that has not completed the identity handshake yet
struct PendingConnection {
    channel: DeviceChannel,
    seq: u64,
}

/// The single authoritative mapping of identity to run target.
///
/// Bound targets live in `targets`; connections that have not asserted an
/// identity yet live in `pending`, keyed by connection id. All mutation for
/// one identity happens under that identity's map-entry lock, so two
/// simultaneous handshakes for the same identity serialize against each other
/// without blocking unrelated devices.
pub struct Registry {
    targets: DashMap<String, RunTarget>,
    pending: DashMap<String, PendingConnection>,
    observers: DashMap<String, mpsc::UnboundedSender<ObserverEvent>>,
    storage: Option<Storage>,
    seq: AtomicU64,
}

impl Registry {
    pub fn new(storage: Option<Storage>) -> Self {
        Self {
            targets: DashMap::new(),
            pending: DashMap::new(),
            observers: DashMap::new(),
            storage,
            seq: AtomicU64::new(0),
        }
    }

    /// Pre-populate the registry from the persistence store so reconnect
    /// handshakes find their record across a server restart. Load failure is
    /// a degraded-but-functional state: the registry simply starts empty.
    pub async fn load_persisted(&self) {
        let Some(storage) = &self.storage else {
            return;
        };
        match storage.load_all().await {
            Ok(records) => {
                let count = records.len();
                for record in records {
                    let seq = self.next_seq();
                    self.targets
                        .insert(record.identity.clone(), RunTarget::from_record(record, seq));
                }
                info!("loaded {} persisted run targets", count);
            }
            Err(err) => {
                warn!("failed to load persisted run targets, starting empty: {err}");
            }
        }
    }

    /// Track a freshly accepted connection that has no identity yet.
    pub fn add_pending(&self, channel: DeviceChannel) {
        let seq = self.next_seq();
        let info = pending_info(TargetStatus::Available);
        self.pending
            .insert(channel.connection_id().to_string(), PendingConnection { channel, seq });
        self.publish(ObserverEvent::TargetUpdated {
            target: info,
            is_new: false,
        });
    }

    /// Drop a connection that went away before identifying itself.
    pub fn remove_pending(&self, connection_id: &str) {
        if let Some((_, pending)) = self.pending.remove(connection_id) {
            pending.channel.close();
            self.publish(ObserverEvent::TargetUpdated {
                target: pending_info(TargetStatus::Unavailable),
                is_new: false,
            });
        }
    }

    /// The identity handshake: `Unbound --clientInfo--> Bound | Error`.
    ///
    /// On a reconnect the existing target wins for durable fields and the
    /// live channel is transplanted onto it; the pending entry for this
    /// connection is discarded from memory only, it was never persisted. On a
    /// collision nothing mutates and the caller is expected to terminate the
    /// offending connection.
    pub fn bind(
        &self,
        channel: DeviceChannel,
        identity: Option<String>,
        display_name: Option<String>,
    ) -> Result<BindOutcome, HandshakeError> {
        let identity = match identity {
            Some(identity) if !identity.is_empty() => identity,
            _ => return Err(HandshakeError::MissingIdentity),
        };

        let connection_id = channel.connection_id().to_string();
        // Bound targets keep the listing slot their connection arrived in.
        let seq = self
            .pending
            .get(&connection_id)
            .map(|p| p.seq)
            .unwrap_or_else(|| self.next_seq());

        let (target_info, record, is_new) = match self.targets.entry(identity.clone()) {
            Entry::Occupied(mut entry) => {
                let target = entry.get_mut();
                if target.connection.is_some() {
                    // Two live connections claiming the same identity.
                    return Err(HandshakeError::IdentityCollision(identity));
                }
                // Legitimate reconnect: existing record wins unless the
                // handshake supplies a new display name.
                if let Some(name) = display_name {
                    target.display_name = name;
                }
                target.attach(channel);
                (target.info(), target.record(), false)
            }
            Entry::Vacant(entry) => {
                let target = RunTarget::new(identity.clone(), display_name, channel, seq);
                let info = target.info();
                let record = target.record();
                entry.insert(target);
                (info, record, true)
            }
        };

        self.pending.remove(&connection_id);
        self.persist_record(record);
        self.publish(ObserverEvent::TargetUpdated {
            target: target_info,
            is_new,
        });

        Ok(BindOutcome { identity, is_new })
    }

    /// `Bound --disconnect--> Detached`. Guarded by connection id so a stale
    /// disconnect from a superseded connection is a no-op, whichever side
    /// reported it first.
    pub fn mark_disconnected(&self, identity: &str, connection_id: &str) {
        let info = {
            let Some(mut target) = self.targets.get_mut(identity) else {
                return;
            };
            let owns_connection = target
                .connection
                .as_ref()
                .map(|c| c.connection_id() == connection_id)
                .unwrap_or(false);
            if !owns_connection {
                debug!(
                    identity,
                    connection = connection_id,
                    "ignoring disconnect for superseded connection"
                );
                return;
            }
            target.detach();
            target.info()
        };
        info!(identity, "run target disconnected");
        self.publish(ObserverEvent::TargetUpdated {
            target: info,
            is_new: false,
        });
    }

    /// Forward a `run` command; no effect on the target's own state.
    pub fn run(&self, identity: &str, app_path: String) -> Result<(), CommandError> {
        self.forward(identity, DeviceCommand::Run { app_path })
    }

    /// Forward a `stop` command; no effect on the target's own state.
    pub fn stop(&self, identity: &str) -> Result<(), CommandError> {
        self.forward(identity, DeviceCommand::Stop)
    }

    fn forward(&self, identity: &str, command: DeviceCommand) -> Result<(), CommandError> {
        let channel = {
            let target = self.targets.get(identity).ok_or(CommandError::NotFound)?;
            if target.status == TargetStatus::Unavailable {
                return Err(CommandError::NotAvailable);
            }
            target
                .connection
                .as_ref()
                .cloned()
                .ok_or(CommandError::NotAvailable)?
        };
        channel.send(command);
        Ok(())
    }

    /// Occupied/available toggling for the build/run orchestration. Never
    /// sets `unavailable`; that transition belongs to the disconnect path.
    pub fn set_status(
        &self,
        identity: &str,
        status: TargetStatus,
    ) -> Result<TargetInfo, CommandError> {
        let info = {
            let mut target = self
                .targets
                .get_mut(identity)
                .ok_or(CommandError::NotFound)?;
            if target.status == TargetStatus::Unavailable {
                return Err(CommandError::NotAvailable);
            }
            target.status = status;
            target.info()
        };
        self.publish(ObserverEvent::TargetUpdated {
            target: info.clone(),
            is_new: false,
        });
        Ok(info)
    }

    /// Remove a target. With `memory_only` the persisted record survives;
    /// otherwise it is deleted as well. A live connection is closed.
    pub fn remove(&self, identity: &str, memory_only: bool) -> Result<(), CommandError> {
        let (identity, target) = self
            .targets
            .remove(identity)
            .ok_or(CommandError::NotFound)?;
        if let Some(channel) = target.connection {
            channel.close();
        }
        if !memory_only {
            self.delete_record(&identity);
        }
        self.publish(ObserverEvent::TargetRemoved { identity });
        Ok(())
    }

    /// Pure lookup, no side effects.
    pub fn get(&self, identity: &str) -> Option<TargetInfo> {
        self.targets.get(identity).map(|t| t.info())
    }

    /// All targets, bound and pending, in the order they first appeared.
    pub fn list(&self) -> Vec<TargetInfo> {
        let mut entries: Vec<(u64, TargetInfo)> = self
            .targets
            .iter()
            .map(|t| (t.seq, t.info()))
            .chain(
                self.pending
                    .iter()
                    .map(|p| (p.seq, pending_info(TargetStatus::Available))),
            )
            .collect();
        entries.sort_by_key(|(seq, _)| *seq);
        entries.into_iter().map(|(_, info)| info).collect()
    }

    /// Register an observer; every status change is delivered to it until it
    /// is unsubscribed or its receiver goes away.
    pub fn subscribe(&self) -> (String, mpsc::UnboundedReceiver<ObserverEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let observer_id = generate_connection_id();
        self.observers.insert(observer_id.clone(), tx);
        (observer_id, rx)
    }

    pub fn unsubscribe(&self, observer_id: &str) {
        self.observers.remove(observer_id);
    }

    /// Fan-out to observers. A dead observer is pruned and logged; it never
    /// blocks the others or the caller.
    fn publish(&self, event: ObserverEvent) {
        let mut dead = Vec::new();
        for entry in self.observers.iter() {
            if entry.value().send(event.clone()).is_err() {
                dead.push(entry.key().clone());
            }
        }
        for observer_id in dead {
            self.observers.remove(&observer_id);
            warn!(observer = %observer_id, "dropping unresponsive observer");
        }
    }

    /// Fire-and-forget upsert. A storage failure is surfaced in the log but
    /// never blocks the handshake path; in-memory state stays authoritative.
    fn persist_record(&self, record: crate::storage::PersistedRecord) {
        let Some(storage) = self.storage.clone() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(err) = storage.upsert(&record).await {
                error!(identity = %record.identity, "failed to persist run target: {err}");
            }
        });
    }

    fn delete_record(&self, identity: &str) {
        let Some(storage) = self.storage.clone() else {
            return;
        };
        let identity = identity.to_string();
        tokio::spawn(async move {
            if let Err(err) = storage.delete(&identity).await {
                error!(identity = %identity, "failed to delete run target record: {err}");
            }
        });
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }
}

fn pending_info(status: TargetStatus) -> TargetInfo {
    TargetInfo {
        identity: None,
        display_name: UNNAMED.to_string(),
        status,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Outbound;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn registry() -> Registry {
        Registry::new(None)
    }

    fn channel(id: &str) -> (DeviceChannel, UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (DeviceChannel::new(id.to_string(), tx), rx)
    }

    fn bind(
        registry: &Registry,
        conn: &str,
        identity: &str,
        name: Option<&str>,
    ) -> (Result<BindOutcome, HandshakeError>, UnboundedReceiver<Outbound>) {
        let (ch, rx) = channel(conn);
        registry.add_pending(ch.clone());
        let outcome = registry.bind(
            ch,
            Some(identity.to_string()),
            name.map(|n| n.to_string()),
        );
        (outcome, rx)
    }

    #[test]
    fn first_contact_binds_and_persists_projection() {
        let registry = registry();
        let (outcome, _rx) = bind(&registry, "a", "X", Some("Phone1"));
        let outcome = outcome.unwrap();
        assert!(outcome.is_new);
        assert_eq!(outcome.identity, "X");

        let info = registry.get("X").unwrap();
        assert_eq!(info.identity.as_deref(), Some("X"));
        assert_eq!(info.display_name, "Phone1");
        assert_eq!(info.status, TargetStatus::Available);
    }

    #[test]
    fn missing_identity_is_fatal_and_mutates_nothing() {
        let registry = registry();
        let (ch, _rx) = channel("a");
        registry.add_pending(ch.clone());

        assert_eq!(
            registry.bind(ch, None, Some("Phone1".into())),
            Err(HandshakeError::MissingIdentity)
        );
        // The empty string counts as missing too.
        let (ch2, _rx2) = channel("b");
        assert_eq!(
            registry.bind(ch2, Some(String::new()), None),
            Err(HandshakeError::MissingIdentity)
        );
        assert!(registry.get("").is_none());
        // The pending entry stays until the connection actually closes.
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn reconnect_reuses_record_and_keeps_display_name() {
        let registry = registry();
        bind(&registry, "a", "X", Some("Phone1")).0.unwrap();
        registry.mark_disconnected("X", "a");
        assert_eq!(registry.get("X").unwrap().status, TargetStatus::Unavailable);

        let (outcome, _rx) = bind(&registry, "b", "X", None);
        let outcome = outcome.unwrap();
        assert!(!outcome.is_new);

        let info = registry.get("X").unwrap();
        assert_eq!(info.display_name, "Phone1");
        assert_eq!(info.status, TargetStatus::Available);
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn reconnect_with_new_name_wins() {
        let registry = registry();
        bind(&registry, "a", "X", Some("Phone1")).0.unwrap();
        registry.mark_disconnected("X", "a");

        bind(&registry, "b", "X", Some("Tablet")).0.unwrap();
        assert_eq!(registry.get("X").unwrap().display_name, "Tablet");
    }

    #[test]
    fn reconnect_is_idempotent_over_many_cycles() {
        let registry = registry();
        bind(&registry, "conn-0", "X", Some("Phone1")).0.unwrap();
        for i in 1..10 {
            let conn = format!("conn-{}", i);
            registry.mark_disconnected("X", &format!("conn-{}", i - 1));
            let (outcome, _rx) = bind(&registry, &conn, "X", None);
            assert!(!outcome.unwrap().is_new);
        }
        assert_eq!(registry.list().len(), 1);
        assert_eq!(registry.get("X").unwrap().display_name, "Phone1");
    }

    #[test]
    fn collision_rejects_new_connection_and_leaves_target_alone() {
        let registry = registry();
        let (_outcome, mut rx_a) = bind(&registry, "a", "X", Some("Phone1"));

        let (outcome, _rx_c) = bind(&registry, "c", "X", Some("Impostor"));
        assert_eq!(
            outcome,
            Err(HandshakeError::IdentityCollision("X".to_string()))
        );

        let info = registry.get("X").unwrap();
        assert_eq!(info.display_name, "Phone1");
        assert_eq!(info.status, TargetStatus::Available);
        // The original connection never saw a frame.
        assert!(rx_a.try_recv().is_err());

        // The loser's disconnect must not detach the winner.
        registry.mark_disconnected("X", "c");
        assert_eq!(registry.get("X").unwrap().status, TargetStatus::Available);
    }

    #[test]
    fn run_forwards_frame_when_available() {
        let registry = registry();
        let (_outcome, mut rx) = bind(&registry, "a", "X", None);

        registry.run("X", "/apps/demo".into()).unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            Outbound::Frame(DeviceCommand::Run {
                app_path: "/apps/demo".to_string()
            })
        );

        registry.stop("X").unwrap();
        assert_eq!(rx.try_recv().unwrap(), Outbound::Frame(DeviceCommand::Stop));
    }

    #[test]
    fn run_on_unavailable_target_sends_nothing() {
        let registry = registry();
        let (_outcome, mut rx) = bind(&registry, "a", "X", None);
        registry.mark_disconnected("X", "a");

        assert_eq!(
            registry.run("X", "/apps/demo".into()),
            Err(CommandError::NotAvailable)
        );
        assert_eq!(registry.stop("X"), Err(CommandError::NotAvailable));
        assert!(rx.try_recv().is_err());

        assert_eq!(
            registry.run("nope", "/apps/demo".into()),
            Err(CommandError::NotFound)
        );
    }

    #[test]
    fn run_on_occupied_target_still_forwards() {
        let registry = registry();
        let (_outcome, mut rx) = bind(&registry, "a", "X", None);
        registry.set_status("X", TargetStatus::Occupied).unwrap();

        registry.run("X", "/apps/demo".into()).unwrap();
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn set_status_rejected_while_disconnected() {
        let registry = registry();
        bind(&registry, "a", "X", None).0.unwrap();
        registry.mark_disconnected("X", "a");

        assert_eq!(
            registry.set_status("X", TargetStatus::Occupied),
            Err(CommandError::NotAvailable)
        );
    }

    #[test]
    fn stale_disconnect_is_ignored() {
        let registry = registry();
        bind(&registry, "a", "X", None).0.unwrap();
        registry.mark_disconnected("X", "some-old-connection");
        assert_eq!(registry.get("X").unwrap().status, TargetStatus::Available);
    }

    #[test]
    fn remove_closes_connection_and_forgets_target() {
        let registry = registry();
        let (_outcome, mut rx) = bind(&registry, "a", "X", None);

        registry.remove("X", false).unwrap();
        assert_eq!(rx.try_recv().unwrap(), Outbound::Close);
        assert!(registry.get("X").is_none());
        assert_eq!(registry.remove("X", false), Err(CommandError::NotFound));
    }

    #[test]
    fn listing_keeps_insertion_order() {
        let registry = registry();
        bind(&registry, "a", "X", Some("First")).0.unwrap();
        bind(&registry, "b", "Y", Some("Second")).0.unwrap();
        let (ch, _rx) = channel("c");
        registry.add_pending(ch);

        let listed = registry.list();
        assert_eq!(listed.len(), 3);
        assert_eq!(listed[0].identity.as_deref(), Some("X"));
        assert_eq!(listed[1].identity.as_deref(), Some("Y"));
        assert_eq!(listed[2].identity, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn simultaneous_handshakes_yield_one_bound_and_one_rejection() {
        let registry = Arc::new(Registry::new(None));
        for round in 0..50 {
            let identity = format!("X-{}", round);
            let (ch_a, _rx_a) = channel(&format!("a-{}", round));
            let (ch_b, _rx_b) = channel(&format!("b-{}", round));
            registry.add_pending(ch_a.clone());
            registry.add_pending(ch_b.clone());

            let task_a = {
                let registry = registry.clone();
                let identity = identity.clone();
                tokio::spawn(async move { registry.bind(ch_a, Some(identity), None) })
            };
            let task_b = {
                let registry = registry.clone();
                let identity = identity.clone();
                tokio::spawn(async move { registry.bind(ch_b, Some(identity), None) })
            };
            let (result_a, result_b) = (task_a.await.unwrap(), task_b.await.unwrap());

            assert!(
                result_a.is_ok() != result_b.is_ok(),
                "round {}: expected exactly one winner, got {:?} / {:?}",
                round,
                result_a,
                result_b
            );
            let loser = if result_a.is_err() { &result_a } else { &result_b };
            assert_eq!(
                loser.clone().unwrap_err(),
                HandshakeError::IdentityCollision(identity.clone())
            );
            assert_eq!(
                registry.get(&identity).unwrap().status,
                TargetStatus::Available
            );
        }
    }

    #[test]
    fn observers_see_lifecycle_events_and_dead_ones_are_pruned() {
        let registry = registry();
        let (observer_id, mut events) = registry.subscribe();
        let (dead_id, dead_events) = registry.subscribe();
        drop(dead_events);

        let (_outcome, _rx) = bind(&registry, "a", "X", Some("Phone1"));
        // add_pending published one update, bind another.
        let pending_event = events.try_recv().unwrap();
        assert!(matches!(
            pending_event,
            ObserverEvent::TargetUpdated { ref target, is_new: false } if target.identity.is_none()
        ));
        match events.try_recv().unwrap() {
            ObserverEvent::TargetUpdated { target, is_new } => {
                assert!(is_new);
                assert_eq!(target.identity.as_deref(), Some("X"));
                assert_eq!(target.status, TargetStatus::Available);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        registry.mark_disconnected("X", "a");
        match events.try_recv().unwrap() {
            ObserverEvent::TargetUpdated { target, is_new } => {
                assert!(!is_new);
                assert_eq!(target.status, TargetStatus::Unavailable);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        registry.remove("X", true).unwrap();
        assert_eq!(
            events.try_recv().unwrap(),
            ObserverEvent::TargetRemoved {
                identity: "X".to_string()
            }
        );

        // The dead observer was pruned on first publish without disturbing
        // the live one.
        assert!(registry.observers.get(&dead_id).is_none());
        registry.unsubscribe(&observer_id);
        assert!(registry.observers.is_empty());
    }
}
