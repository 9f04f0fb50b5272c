use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use tracing::{debug, error, warn};

use crate::fatal::{self, FatalError};
use crate::net::codec::Frame;
use crate::net::connection::{ClientConnection, Dispatcher};
use crate::payload::{
    self, ClientData, ClientId, ClientIdentity, ClipboardHistory, FullSync, RequestError,
    TextUpdate, Version,
};
use crate::protocol::{ClientMessage, ClientMessageType, DecodeError, ServerMessageType};

/// What a client needs from the group it belongs to.
pub trait ClientDelegate {
    /// Data of every client in the group except `excluded`.
    fn full_sync_data(&self, excluded: u64) -> Vec<ClientData>;
    fn client_sync_data(&self, public_id: u64) -> Option<ClientData>;
    fn on_text_added(&self, origin: u64, text: &str);
    fn on_client_synced(&self, data: &ClientData);
}

/// One member of a group: its identity, clipboard history and, while a
/// device is connected, the live connection.
pub struct Client {
    identity: ClientIdentity,
    history: ClipboardHistory,
    connection: Option<Arc<dyn ClientConnection>>,
    next_message_id: u64,
}

impl Client {
    pub fn new(identity: ClientIdentity) -> Self {
        Self {
            identity,
            history: ClipboardHistory::default(),
            connection: None,
            next_message_id: 0,
        }
    }

    pub fn history(&self) -> &ClipboardHistory {
        &self.history
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    pub fn data(&self) -> ClientData {
        ClientData {
            client_id: self.identity.public_id,
            client_name: self.identity.name.clone(),
            text_data: self.history.clone(),
        }
    }

    /// Binds a freshly authenticated connection, introduces the server to it
    /// and starts its I/O. Binding while already bound aborts.
    pub fn handle_connection(
        &mut self,
        connection: Arc<dyn ClientConnection>,
        dispatcher: Dispatcher,
    ) {
        if self.is_connected() {
            fatal::abort(FatalError::DoubleBind {
                public_id: self.identity.public_id,
            });
        }
        connection.set_up(dispatcher);
        self.connection = Some(connection.clone());
        self.next_message_id = 0;

        self.notify(
            ServerMessageType::ServerIntroduction,
            payload::serialize(&Version::current()),
        );
        connection.start_handling();
    }

    pub fn on_disconnected(&mut self) {
        self.connection = None;
    }

    pub fn process_message(&mut self, frame: Frame, delegate: &dyn ClientDelegate) {
        if !self.is_connected() {
            warn!(
                client = self.identity.public_id,
                kind = frame.kind,
                "Dropping message for a client without a connection"
            );
            return;
        }

        let message = match ClientMessage::decode(frame.kind, &frame.payload) {
            Ok(message) => message,
            Err(DecodeError::Malformed {
                kind: ClientMessageType::HostSyncRequest,
                reason,
            }) => {
                warn!(client = self.identity.public_id, "Error parsing client ID: {:#}", reason);
                self.report_request_error(
                    frame.id,
                    "Wrong message sent. Server was unable to parse client ID.",
                );
                return;
            }
            Err(e) => {
                warn!(client = self.identity.public_id, "Ignoring message: {}", e);
                return;
            }
        };

        match message {
            // Reserved for correlating server-initiated requests.
            ClientMessage::Response => {}
            ClientMessage::Introduction { .. } => {
                debug!(client = self.identity.public_id, "Ignoring repeated introduction");
            }
            ClientMessage::FullSyncRequest => self.process_full_sync_request(frame.id, delegate),
            ClientMessage::HostSyncRequest { target } => {
                self.process_host_sync_request(frame.id, target, delegate)
            }
            ClientMessage::HostTextUpdate { text } => self.process_host_text_update(text, delegate),
            ClientMessage::SyncThisHost(data) => self.process_sync_this_host(data, delegate),
        }
    }

    pub fn notify_client_connected(&mut self, public_id: u64) {
        self.notify(
            ServerMessageType::HostConnected,
            payload::serialize(&ClientId {
                client_id: public_id,
            }),
        );
    }

    pub fn notify_client_disconnected(&mut self, public_id: u64) {
        self.notify(
            ServerMessageType::HostDisconnected,
            payload::serialize(&ClientId {
                client_id: public_id,
            }),
        );
    }

    pub fn notify_text_added(&mut self, public_id: u64, text: &str) {
        self.notify(
            ServerMessageType::TextUpdate,
            payload::serialize(&TextUpdate {
                client_id: public_id,
                text: text.to_string(),
            }),
        );
    }

    pub fn notify_client_synced(&mut self, data: &ClientData) {
        self.notify(ServerMessageType::HostSynced, payload::serialize(data));
    }

    fn process_full_sync_request(&self, request_id: u64, delegate: &dyn ClientDelegate) {
        let sync = FullSync {
            this_host_data: self.data(),
            other_data: delegate.full_sync_data(self.identity.public_id),
        };
        self.respond(request_id, payload::serialize(&sync));
    }

    fn process_host_sync_request(
        &self,
        request_id: u64,
        target: u64,
        delegate: &dyn ClientDelegate,
    ) {
        let data = if target == self.identity.public_id {
            Some(self.data())
        } else {
            delegate.client_sync_data(target)
        };
        match data {
            Some(data) => self.respond(request_id, payload::serialize(&data)),
            None => {
                warn!(
                    client = self.identity.public_id,
                    requested = target,
                    "Sync was requested for unknown client"
                );
                self.report_request_error(request_id, "Unknown host.");
            }
        }
    }

    fn process_host_text_update(&mut self, text: String, delegate: &dyn ClientDelegate) {
        self.history.push(text.as_str());
        delegate.on_text_added(self.identity.public_id, &text);
    }

    fn process_sync_this_host(&mut self, data: ClientData, delegate: &dyn ClientDelegate) {
        if data.client_id != self.identity.public_id {
            warn!(
                client = self.identity.public_id,
                claimed = data.client_id,
                "Host sync carried a different client id, keeping the configured identity"
            );
        }
        self.history = data.text_data;
        delegate.on_client_synced(&self.data());
    }

    fn report_request_error(&self, request_id: u64, error_text: &str) {
        self.respond(
            request_id,
            payload::serialize(&RequestError {
                error_text: error_text.to_string(),
            }),
        );
    }

    /// Replies to a client request, echoing its id.
    fn respond(&self, request_id: u64, payload: Result<Bytes>) {
        let Some(connection) = &self.connection else {
            return;
        };
        match payload {
            Ok(payload) => {
                connection.send_message(request_id, ServerMessageType::ServerResponse, payload)
            }
            Err(e) => error!("{:#}", e),
        }
    }

    /// Sends a server-initiated message under the next per-connection id.
    fn notify(&mut self, kind: ServerMessageType, payload: Result<Bytes>) {
        let Some(connection) = &self.connection else {
            return;
        };
        let id = self.next_message_id;
        self.next_message_id += 1;
        match payload {
            Ok(payload) => connection.send_message(id, kind, payload),
            Err(e) => error!("{:#}", e),
        }
    }
}
