//! Groups of clients that share clipboard traffic.
//!
//! Each group owns its clients and runs every operation on them from a
//! single executor thread, so nothing inside [`GroupState`] is locked.

pub mod client;
pub mod task_queue;

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, warn};

use crate::fatal::{self, FatalError};
use crate::net::codec::Frame;
use crate::net::connection::{ClientConnection, ConnectionDelegate, Dispatcher};
use crate::payload::{ClientData, ClientIdentity};
use client::{Client, ClientDelegate};
use task_queue::{DEFAULT_CAPACITY, DEFAULT_POST_TIMEOUT, TaskPoster, TaskQueue};

/// Everything a group owns. Only touched from tasks on the group's queue.
pub struct GroupState {
    name: String,
    // RefCell lets one client run a handler while the group reads or
    // notifies the others. Handlers never re-enter their own client.
    clients: BTreeMap<u64, RefCell<Client>>,
    tasks: TaskPoster<GroupState>,
}

impl GroupState {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn client_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.clients.keys().copied()
    }

    pub fn is_connected(&self, public_id: u64) -> bool {
        self.clients
            .get(&public_id)
            .is_some_and(|client| client.borrow().is_connected())
    }

    pub fn client_data(&self, public_id: u64) -> Option<ClientData> {
        self.clients.get(&public_id).map(|client| client.borrow().data())
    }

    fn handle_connection(&self, public_id: u64, connection: Arc<dyn ClientConnection>) {
        let Some(client) = self.clients.get(&public_id) else {
            fatal::abort(FatalError::UnknownClient {
                group: self.name.clone(),
                public_id,
            });
        };

        if client.borrow().is_connected() {
            warn!(
                group = %self.name,
                client = public_id,
                address = connection.address(),
                "Client is already connected, closing the new connection"
            );
            connection.disconnect_and_stop();
            return;
        }

        info!(
            group = %self.name,
            client = public_id,
            address = connection.address(),
            "Client connected"
        );
        let dispatcher = Dispatcher::new(Arc::new(ClientLink { public_id }), self.tasks.clone());
        client.borrow_mut().handle_connection(connection, dispatcher);
        self.notify_client_connected(public_id);
    }

    fn process_message(&self, public_id: u64, frame: Frame) {
        match self.clients.get(&public_id) {
            Some(client) => client.borrow_mut().process_message(frame, self),
            None => warn!(group = %self.name, client = public_id, "Message for unknown client"),
        }
    }

    fn on_connection_lost(&self, public_id: u64) {
        let Some(client) = self.clients.get(&public_id) else {
            return;
        };
        client.borrow_mut().on_disconnected();
        info!(group = %self.name, client = public_id, "Client disconnected");
        self.notify_client_disconnected(public_id);
    }

    fn others(&self, excluded: u64) -> impl Iterator<Item = &RefCell<Client>> + '_ {
        self.clients
            .iter()
            .filter(move |(id, _)| **id != excluded)
            .map(|(_, client)| client)
    }

    fn notify_client_connected(&self, origin: u64) {
        for client in self.others(origin) {
            client.borrow_mut().notify_client_connected(origin);
        }
    }

    fn notify_client_disconnected(&self, origin: u64) {
        for client in self.others(origin) {
            client.borrow_mut().notify_client_disconnected(origin);
        }
    }
}

impl ClientDelegate for GroupState {
    fn full_sync_data(&self, excluded: u64) -> Vec<ClientData> {
        self.others(excluded).map(|client| client.borrow().data()).collect()
    }

    fn client_sync_data(&self, public_id: u64) -> Option<ClientData> {
        self.client_data(public_id)
    }

    fn on_text_added(&self, origin: u64, text: &str) {
        debug!(group = %self.name, client = origin, "Broadcasting clipboard text");
        for client in self.others(origin) {
            client.borrow_mut().notify_text_added(origin, text);
        }
    }

    fn on_client_synced(&self, data: &ClientData) {
        for client in self.others(data.client_id) {
            client.borrow_mut().notify_client_synced(data);
        }
    }
}

/// Routes one connection's callbacks to the client it was bound to.
struct ClientLink {
    public_id: u64,
}

impl ConnectionDelegate for ClientLink {
    type State = GroupState;

    fn process_message(&self, state: &mut GroupState, frame: Frame) {
        state.process_message(self.public_id, frame);
    }

    fn on_disconnected(&self, state: &mut GroupState) {
        state.on_connection_lost(self.public_id);
    }
}

/// A group that has not started yet. Clients can only be added here;
/// [`Group::run_async`] consumes it.
pub struct Group {
    state: GroupState,
    queue: TaskQueue<GroupState>,
}

impl Group {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_capacity(name, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(name: impl Into<String>, capacity: usize) -> Self {
        let name = name.into();
        let queue = TaskQueue::with_capacity(&name, capacity, DEFAULT_POST_TIMEOUT);
        let state = GroupState {
            name,
            clients: BTreeMap::new(),
            tasks: queue.poster(),
        };
        Self { state, queue }
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    pub fn add_client(&mut self, identity: ClientIdentity) {
        let public_id = identity.public_id;
        if self.state.clients.contains_key(&public_id) {
            fatal::abort(FatalError::DuplicateClient {
                group: self.state.name.clone(),
                public_id,
            });
        }
        self.state
            .clients
            .insert(public_id, RefCell::new(Client::new(identity)));
    }

    pub fn handle(&self) -> GroupHandle {
        GroupHandle {
            tasks: self.queue.poster(),
        }
    }

    pub fn state(&self) -> &GroupState {
        &self.state
    }

    /// Runs queued tasks on the calling thread. Used by tests.
    pub fn run_until_idle(&mut self) -> usize {
        self.queue.run_until_idle(&mut self.state)
    }

    /// Moves the group onto its own executor thread.
    pub fn run_async(self) -> Result<RunningGroup> {
        let Group { mut state, queue } = self;
        let handle = GroupHandle {
            tasks: queue.poster(),
        };
        let name = state.name.clone();
        let thread = std::thread::Builder::new()
            .name(format!("group-{name}"))
            .spawn(move || {
                queue.run(&mut state);
                state
            })
            .with_context(|| format!("Failed to start executor for group '{name}'"))?;
        info!(group = %name, "Group started");
        Ok(RunningGroup { handle, thread })
    }
}

/// Cloneable way into a group from other threads.
#[derive(Clone)]
pub struct GroupHandle {
    tasks: TaskPoster<GroupState>,
}

impl GroupHandle {
    /// Hands an authenticated connection to the client `public_id`.
    pub async fn handle_connection(&self, public_id: u64, connection: Arc<dyn ClientConnection>) {
        self.tasks
            .post_task_async(move |state| state.handle_connection(public_id, connection))
            .await;
    }

    pub fn name(&self) -> &str {
        self.tasks.name()
    }
}

pub struct RunningGroup {
    handle: GroupHandle,
    thread: JoinHandle<GroupState>,
}

impl RunningGroup {
    pub fn handle(&self) -> GroupHandle {
        self.handle.clone()
    }

    /// Stops the executor after the task it is running and returns the final
    /// state. Tasks still queued are dropped.
    pub fn shutdown(self) -> Result<GroupState> {
        let name = self.handle.name().to_string();
        self.handle.tasks.quit();
        self.thread
            .join()
            .map_err(|_| anyhow!("Executor of {name} panicked"))
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::MockConnection;
    use super::*;
    use crate::payload::{self, ClientId, FullSync, TextUpdate};
    use crate::protocol::{ClientMessageType, ServerMessageType};

    fn group_of(ids: &[u64]) -> Group {
        let mut group = Group::new("test");
        for id in ids {
            group.add_client(ClientIdentity::new(*id, format!("host{id}")));
        }
        group
    }

    fn connect(group: &mut Group, public_id: u64) -> Arc<MockConnection> {
        let connection = Arc::new(MockConnection::default());
        let handle = group.handle();
        futures::executor::block_on(handle.handle_connection(public_id, connection.clone()));
        group.run_until_idle();
        connection
    }

    fn send(
        group: &mut Group,
        connection: &MockConnection,
        id: u64,
        kind: ClientMessageType,
        json: &str,
    ) {
        connection.deliver(Frame::new(id, kind, json.as_bytes().to_vec()));
        group.run_until_idle();
    }

    #[test]
    fn connecting_notifies_the_other_bound_clients() {
        let mut group = group_of(&[1, 2, 3]);
        let first = connect(&mut group, 1);
        let second = connect(&mut group, 2);

        assert!(first.is_started() && second.is_started());
        assert!(group.state().is_connected(1));
        assert!(group.state().is_connected(2));
        assert!(!group.state().is_connected(3));

        let connected = first.sent_of(ServerMessageType::HostConnected);
        assert_eq!(connected.len(), 1);
        assert_eq!(connected[0].id, 1);
        let id: ClientId = payload::deserialize(&connected[0].payload).unwrap();
        assert_eq!(id.client_id, 2);

        assert!(second.sent_of(ServerMessageType::HostConnected).is_empty());
        assert_eq!(second.sent_of(ServerMessageType::ServerIntroduction).len(), 1);
    }

    #[test]
    fn second_connection_for_a_bound_client_is_closed() {
        let mut group = group_of(&[1]);
        let first = connect(&mut group, 1);
        let second = connect(&mut group, 1);

        assert!(second.is_stopped());
        assert!(!second.is_set_up());
        assert!(second.sent().is_empty());

        assert!(!first.is_stopped());
        assert!(group.state().is_connected(1));
        send(&mut group, &first, 0, ClientMessageType::HostTextUpdate, r#"{"Text":"still here"}"#);
        assert_eq!(
            group.state().client_data(1).unwrap().text_data.get(0),
            Some("still here")
        );
    }

    #[test]
    fn text_updates_reach_every_other_client_once() {
        let mut group = group_of(&[1, 2, 3]);
        let a = connect(&mut group, 1);
        let b = connect(&mut group, 2);
        let c = connect(&mut group, 3);

        send(&mut group, &a, 0, ClientMessageType::HostTextUpdate, r#"{"Text":"hello"}"#);

        assert!(a.sent_of(ServerMessageType::TextUpdate).is_empty());
        for peer in [&b, &c] {
            let updates = peer.sent_of(ServerMessageType::TextUpdate);
            assert_eq!(updates.len(), 1);
            let update: TextUpdate = payload::deserialize(&updates[0].payload).unwrap();
            assert_eq!((update.client_id, update.text.as_str()), (1, "hello"));
        }
    }

    #[test]
    fn full_sync_data_excludes_the_requester() {
        let mut group = group_of(&[1, 2]);
        let a = connect(&mut group, 1);
        let b = connect(&mut group, 2);
        send(&mut group, &a, 0, ClientMessageType::HostTextUpdate, r#"{"Text":"x"}"#);
        send(&mut group, &b, 0, ClientMessageType::HostTextUpdate, r#"{"Text":"y"}"#);

        let others = group.state().full_sync_data(1);
        assert_eq!(others.len(), 1);
        assert_eq!(others[0].client_id, 2);
        assert_eq!(others[0].text_data.iter().collect::<Vec<_>>(), vec!["y"]);
    }

    #[test]
    fn full_sync_after_text_update_includes_the_new_text() {
        let mut group = group_of(&[1, 2]);
        let a = connect(&mut group, 1);
        let b = connect(&mut group, 2);

        send(&mut group, &a, 0, ClientMessageType::HostTextUpdate, r#"{"Text":"hello"}"#);
        send(&mut group, &b, 5, ClientMessageType::FullSyncRequest, "");

        let replies = b.sent_of(ServerMessageType::ServerResponse);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].id, 5);
        let sync: FullSync = payload::deserialize(&replies[0].payload).unwrap();
        assert_eq!(sync.this_host_data.client_id, 2);
        assert_eq!(sync.other_data.len(), 1);
        assert_eq!(sync.other_data[0].client_id, 1);
        assert_eq!(sync.other_data[0].text_data.get(0), Some("hello"));
    }

    #[test]
    fn host_synced_is_broadcast_to_peers() {
        let mut group = group_of(&[1, 2]);
        let a = connect(&mut group, 1);
        let b = connect(&mut group, 2);

        send(
            &mut group,
            &a,
            0,
            ClientMessageType::SyncThisHost,
            r#"{"ClientId":1,"ClientName":"host1","TextData":["p","q"]}"#,
        );

        assert!(a.sent_of(ServerMessageType::HostSynced).is_empty());
        let synced = b.sent_of(ServerMessageType::HostSynced);
        assert_eq!(synced.len(), 1);
        let data: ClientData = payload::deserialize(&synced[0].payload).unwrap();
        assert_eq!(data, group.state().client_data(1).unwrap());
        assert_eq!(data.text_data.len(), 2);
    }

    #[test]
    fn disconnect_is_broadcast_and_allows_rebinding() {
        let mut group = group_of(&[1, 2]);
        let a = connect(&mut group, 1);
        let b = connect(&mut group, 2);
        send(&mut group, &a, 0, ClientMessageType::HostTextUpdate, r#"{"Text":"kept"}"#);

        a.drop_peer();
        group.run_until_idle();

        assert!(!group.state().is_connected(1));
        let gone = b.sent_of(ServerMessageType::HostDisconnected);
        assert_eq!(gone.len(), 1);
        let id: ClientId = payload::deserialize(&gone[0].payload).unwrap();
        assert_eq!(id.client_id, 1);

        let again = connect(&mut group, 1);
        assert!(again.is_started());
        assert!(group.state().is_connected(1));
        // Ids restart with the new connection.
        assert_eq!(again.sent()[0].id, 0);
        assert_eq!(group.state().client_data(1).unwrap().text_data.get(0), Some("kept"));
        assert_eq!(b.sent_of(ServerMessageType::HostConnected).len(), 1);
    }

    #[test]
    fn runs_on_its_own_thread_and_returns_state_on_shutdown() {
        let group = group_of(&[1, 2]);
        let running = group.run_async().unwrap();
        let connection = Arc::new(MockConnection::default());
        let handle = running.handle();
        futures::executor::block_on(handle.handle_connection(1, connection.clone()));

        // Shutdown drops queued tasks, so wait for the bind to land.
        for _ in 0..200 {
            if connection.is_started() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        let state = running.shutdown().unwrap();
        assert_eq!(state.name(), "test");
        assert_eq!(state.client_ids().collect::<Vec<_>>(), vec![1, 2]);
        assert!(state.is_connected(1));
        assert!(connection.is_started());
    }

    #[test]
    fn idle_group_shuts_down() {
        let running = group_of(&[7]).run_async().unwrap();
        let handle = running.handle();

        let state = running.shutdown().unwrap();
        assert_eq!(state.client_ids().collect::<Vec<_>>(), vec![7]);
        assert!(!state.is_connected(7));

        // The executor is gone; late posts are dropped instead of blocking.
        let connection = Arc::new(MockConnection::default());
        futures::executor::block_on(handle.handle_connection(7, connection.clone()));
        assert!(!connection.is_set_up());
    }
}
