//! Named groups of connections, indexed both ways.
//!
//! `{ns}::room::{room}` holds the members of a room and
//! `{ns}::id_room::{id}` the rooms of a connection, so a disconnect can leave
//! every room without scanning.

use futures_util::future::try_join_all;
use log::debug;
use std::sync::Arc;

use crate::ids::ConnectionId;
use crate::store::{Keyspace, Result, Store};

#[derive(Clone)]
pub struct RoomStore {
    store: Arc<dyn Store>,
    keys: Keyspace,
}

impl RoomStore {
    pub fn new(store: Arc<dyn Store>, keys: Keyspace) -> Self {
        Self { store, keys }
    }

    pub async fn join_room(&self, id: &ConnectionId, room: &str) -> Result<()> {
        self.store.sadd(&self.keys.room(room), id.as_str()).await?;
        self.store
            .sadd(&self.keys.rooms_of(id.as_str()), room)
            .await?;
        Ok(())
    }

    pub async fn leave_room(&self, id: &ConnectionId, room: &str) -> Result<()> {
        self.store.srem(&self.keys.room(room), id.as_str()).await?;
        self.store
            .srem(&self.keys.rooms_of(id.as_str()), room)
            .await?;
        Ok(())
    }

    /// Remove the connection from every room it joined.
    pub async fn leave_all_rooms(&self, id: &ConnectionId) -> Result<()> {
        let rooms = self.rooms_of(id).await?;
        try_join_all(rooms.iter().map(|room| async move {
            self.store.srem(&self.keys.room(room), id.as_str()).await
        }))
        .await?;
        self.store.del(&[self.keys.rooms_of(id.as_str())]).await?;
        if !rooms.is_empty() {
            debug!("{id} left {} room(s)", rooms.len());
        }
        Ok(())
    }

    /// Members of `room`; empty for a room nobody joined.
    pub async fn get_members(&self, room: &str) -> Result<Vec<ConnectionId>> {
        let members = self.store.smembers(&self.keys.room(room)).await?;
        Ok(members.into_iter().map(ConnectionId::from).collect())
    }

    pub async fn rooms_of(&self, id: &ConnectionId) -> Result<Vec<String>> {
        let mut rooms = self.store.smembers(&self.keys.rooms_of(id.as_str())).await?;
        rooms.sort();
        Ok(rooms)
    }

    /// Drop every room and reverse index in the namespace.
    pub async fn clear(&self) -> Result<()> {
        let mut keys = self.store.keys(&self.keys.room_prefix()).await?;
        keys.extend(self.store.keys(&self.keys.rooms_of_prefix()).await?);
        if !keys.is_empty() {
            self.store.del(&keys).await?;
        }
        Ok(())
    }
}
