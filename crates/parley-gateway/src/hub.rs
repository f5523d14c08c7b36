use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use parley_types::events::GatewayEvent;

/// Process-wide registry of live connections and their broadcast groups.
///
/// Rooms are either personal (room id = user id) or per-conversation
/// (room id = conversation id). Delivery is fire-and-forget over unbounded
/// per-connection channels: there is no queue, retry, or persistence here —
/// the message store is the durable record.
#[derive(Clone)]
pub struct RealtimeHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    /// conn_id -> outbound channel to that connection's send task
    connections: RwLock<HashMap<Uuid, mpsc::UnboundedSender<GatewayEvent>>>,

    /// room_id -> subscribed connections
    rooms: RwLock<HashMap<String, HashSet<Uuid>>>,

    /// user_id -> that user's active connections (multiple devices/tabs)
    user_conns: RwLock<HashMap<Uuid, HashSet<Uuid>>>,

    /// Online users: user_id -> username
    online: RwLock<HashMap<Uuid, String>>,
}

impl RealtimeHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                connections: RwLock::new(HashMap::new()),
                rooms: RwLock::new(HashMap::new()),
                user_conns: RwLock::new(HashMap::new()),
                online: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Admit an authenticated connection: allocate a conn id and its event
    /// channel, auto-join the personal room, and announce `userOnline` to
    /// everyone else if this is the user's first connection.
    pub async fn register(
        &self,
        user_id: Uuid,
        username: &str,
    ) -> (Uuid, mpsc::UnboundedReceiver<GatewayEvent>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();

        self.inner.connections.write().await.insert(conn_id, tx);
        self.inner
            .rooms
            .write()
            .await
            .entry(user_id.to_string())
            .or_default()
            .insert(conn_id);

        let first_conn = {
            let mut users = self.inner.user_conns.write().await;
            let conns = users.entry(user_id).or_default();
            conns.insert(conn_id);
            conns.len() == 1
        };

        if first_conn {
            self.inner
                .online
                .write()
                .await
                .insert(user_id, username.to_string());
            self.broadcast_all_except(
                conn_id,
                GatewayEvent::UserOnline {
                    user_id,
                    username: username.to_string(),
                },
            )
            .await;
        }

        (conn_id, rx)
    }

    /// Tear down a closed connection: drop it from every room and from the
    /// user's connection set. Announces `userOffline` when the user's last
    /// connection goes away.
    pub async fn unregister(&self, user_id: Uuid, conn_id: Uuid) {
        self.inner.connections.write().await.remove(&conn_id);

        {
            let mut rooms = self.inner.rooms.write().await;
            rooms.retain(|_, members| {
                members.remove(&conn_id);
                !members.is_empty()
            });
        }

        let last_conn = {
            let mut users = self.inner.user_conns.write().await;
            if let Some(conns) = users.get_mut(&user_id) {
                conns.remove(&conn_id);
                if conns.is_empty() {
                    users.remove(&user_id);
                    true
                } else {
                    false
                }
            } else {
                false
            }
        };

        if last_conn {
            let username = self
                .inner
                .online
                .write()
                .await
                .remove(&user_id)
                .unwrap_or_default();
            self.broadcast_all_except(
                conn_id,
                GatewayEvent::UserOffline { user_id, username },
            )
            .await;
        }
    }

    pub async fn join_room(&self, room_id: &str, conn_id: Uuid) {
        self.inner
            .rooms
            .write()
            .await
            .entry(room_id.to_string())
            .or_default()
            .insert(conn_id);
    }

    /// Remove one membership; other rooms are unaffected.
    pub async fn leave_room(&self, room_id: &str, conn_id: Uuid) {
        let mut rooms = self.inner.rooms.write().await;
        if let Some(members) = rooms.get_mut(room_id) {
            members.remove(&conn_id);
            if members.is_empty() {
                rooms.remove(room_id);
            }
        }
    }

    /// Deliver to every connection currently subscribed to the room.
    pub async fn broadcast_to_room(&self, room_id: &str, event: GatewayEvent) {
        self.room_send(room_id, None, event).await;
    }

    /// Room delivery that skips the originating connection — used for
    /// typing indicators and join/leave notices.
    pub async fn broadcast_to_room_except(
        &self,
        room_id: &str,
        skip: Uuid,
        event: GatewayEvent,
    ) {
        self.room_send(room_id, Some(skip), event).await;
    }

    /// Deliver to every active connection of one user.
    pub async fn broadcast_to_user(&self, user_id: Uuid, event: GatewayEvent) {
        let targets: Vec<Uuid> = {
            let users = self.inner.user_conns.read().await;
            users
                .get(&user_id)
                .map(|conns| conns.iter().copied().collect())
                .unwrap_or_default()
        };
        self.send_to_conns(&targets, &event).await;
    }

    pub async fn send_to_conn(&self, conn_id: Uuid, event: GatewayEvent) {
        let connections = self.inner.connections.read().await;
        if let Some(tx) = connections.get(&conn_id) {
            let _ = tx.send(event);
        }
    }

    /// Presence snapshot for clients that just connected. No historical
    /// backfill: events missed before connecting stay missed.
    pub async fn online_users(&self) -> Vec<(Uuid, String)> {
        self.inner
            .online
            .read()
            .await
            .iter()
            .map(|(id, name)| (*id, name.clone()))
            .collect()
    }

    async fn broadcast_all_except(&self, skip: Uuid, event: GatewayEvent) {
        let connections = self.inner.connections.read().await;
        for (conn_id, tx) in connections.iter() {
            if *conn_id != skip {
                let _ = tx.send(event.clone());
            }
        }
    }

    async fn room_send(&self, room_id: &str, skip: Option<Uuid>, event: GatewayEvent) {
        let targets: Vec<Uuid> = {
            let rooms = self.inner.rooms.read().await;
            rooms
                .get(room_id)
                .map(|members| {
                    members
                        .iter()
                        .copied()
                        .filter(|c| Some(*c) != skip)
                        .collect()
                })
                .unwrap_or_default()
        };
        self.send_to_conns(&targets, &event).await;
    }

    async fn send_to_conns(&self, targets: &[Uuid], event: &GatewayEvent) {
        let connections = self.inner.connections.read().await;
        for conn_id in targets {
            if let Some(tx) = connections.get(conn_id) {
                // Dead receivers are cleaned up on unregister
                let _ = tx.send(event.clone());
            }
        }
    }
}

impl Default for RealtimeHub {
    fn default() -> Self {
        Self::new()
    }
}
