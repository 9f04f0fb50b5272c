use bytes::Bytes;

use crate::payload::{self, ClientData, ClientId, ClientIntroduction, Text};

// Values are shared with the client applications and must not change.

/// Frame types a client may send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ClientMessageType {
    ClientResponse = 0,
    ClientIntroduction = 1,
    FullSyncRequest = 2,
    HostSyncRequest = 3,
    HostTextUpdate = 4,
    SyncThisHost = 5,
}

impl ClientMessageType {
    pub const ALL: [ClientMessageType; 6] = [
        ClientMessageType::ClientResponse,
        ClientMessageType::ClientIntroduction,
        ClientMessageType::FullSyncRequest,
        ClientMessageType::HostSyncRequest,
        ClientMessageType::HostTextUpdate,
        ClientMessageType::SyncThisHost,
    ];
}

impl TryFrom<u16> for ClientMessageType {
    type Error = u16;

    fn try_from(value: u16) -> Result<Self, u16> {
        Self::ALL
            .into_iter()
            .find(|kind| *kind as u16 == value)
            .ok_or(value)
    }
}

impl From<ClientMessageType> for u16 {
    fn from(kind: ClientMessageType) -> u16 {
        kind as u16
    }
}

/// Frame types the server sends. Numerically disjoint from
/// [`ClientMessageType`] so a type value alone tells the direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ServerMessageType {
    ServerResponse = 256,
    ServerIntroduction = 257,
    HostConnected = 258,
    HostDisconnected = 259,
    TextUpdate = 260,
    HostSynced = 261,
}

impl ServerMessageType {
    pub const ALL: [ServerMessageType; 6] = [
        ServerMessageType::ServerResponse,
        ServerMessageType::ServerIntroduction,
        ServerMessageType::HostConnected,
        ServerMessageType::HostDisconnected,
        ServerMessageType::TextUpdate,
        ServerMessageType::HostSynced,
    ];
}

impl TryFrom<u16> for ServerMessageType {
    type Error = u16;

    fn try_from(value: u16) -> Result<Self, u16> {
        Self::ALL
            .into_iter()
            .find(|kind| *kind as u16 == value)
            .ok_or(value)
    }
}

impl From<ServerMessageType> for u16 {
    fn from(kind: ServerMessageType) -> u16 {
        kind as u16
    }
}

/// A client frame with its payload decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Response,
    Introduction { secret: String },
    FullSyncRequest,
    HostSyncRequest { target: u64 },
    HostTextUpdate { text: String },
    SyncThisHost(ClientData),
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("unknown client message type {0}")]
    UnknownType(u16),
    #[error("malformed {kind:?} payload: {reason:#}")]
    Malformed {
        kind: ClientMessageType,
        reason: anyhow::Error,
    },
}

impl ClientMessage {
    pub fn decode(kind: u16, payload: &Bytes) -> Result<Self, DecodeError> {
        let kind = ClientMessageType::try_from(kind).map_err(DecodeError::UnknownType)?;
        let malformed = |reason| DecodeError::Malformed { kind, reason };
        Ok(match kind {
            ClientMessageType::ClientResponse => ClientMessage::Response,
            ClientMessageType::ClientIntroduction => ClientMessage::Introduction {
                secret: payload::deserialize::<ClientIntroduction>(payload)
                    .map_err(malformed)?
                    .secret,
            },
            ClientMessageType::FullSyncRequest => ClientMessage::FullSyncRequest,
            ClientMessageType::HostSyncRequest => ClientMessage::HostSyncRequest {
                target: payload::deserialize::<ClientId>(payload)
                    .map_err(malformed)?
                    .client_id,
            },
            ClientMessageType::HostTextUpdate => ClientMessage::HostTextUpdate {
                text: payload::deserialize::<Text>(payload).map_err(malformed)?.text,
            },
            ClientMessageType::SyncThisHost => {
                ClientMessage::SyncThisHost(payload::deserialize(payload).map_err(malformed)?)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_spaces_do_not_overlap() {
        for client in ClientMessageType::ALL {
            assert!(ServerMessageType::try_from(client as u16).is_err());
        }
        for server in ServerMessageType::ALL {
            assert!(ClientMessageType::try_from(server as u16).is_err());
        }
    }

    #[test]
    fn numeric_round_trip() {
        for kind in ClientMessageType::ALL {
            assert_eq!(ClientMessageType::try_from(u16::from(kind)), Ok(kind));
        }
        for kind in ServerMessageType::ALL {
            assert_eq!(ServerMessageType::try_from(u16::from(kind)), Ok(kind));
        }
        assert_eq!(ClientMessageType::try_from(6), Err(6));
        assert_eq!(ServerMessageType::try_from(262), Err(262));
    }

    #[test]
    fn decodes_each_client_message() {
        let decode = |kind: ClientMessageType, json: &'static str| {
            ClientMessage::decode(kind.into(), &Bytes::from_static(json.as_bytes()))
        };

        assert_eq!(
            decode(ClientMessageType::ClientResponse, "").unwrap(),
            ClientMessage::Response
        );
        assert_eq!(
            decode(ClientMessageType::ClientIntroduction, r#"{"Secret":"abc"}"#).unwrap(),
            ClientMessage::Introduction {
                secret: "abc".into()
            }
        );
        assert_eq!(
            decode(ClientMessageType::FullSyncRequest, "").unwrap(),
            ClientMessage::FullSyncRequest
        );
        assert_eq!(
            decode(ClientMessageType::HostSyncRequest, r#"{"ClientId":9}"#).unwrap(),
            ClientMessage::HostSyncRequest { target: 9 }
        );
        assert_eq!(
            decode(ClientMessageType::HostTextUpdate, r#"{"Text":"hello"}"#).unwrap(),
            ClientMessage::HostTextUpdate {
                text: "hello".into()
            }
        );
        let synced = decode(
            ClientMessageType::SyncThisHost,
            r#"{"ClientId":2,"ClientName":"b","TextData":["x"]}"#,
        )
        .unwrap();
        let ClientMessage::SyncThisHost(data) = synced else {
            panic!("expected SyncThisHost");
        };
        assert_eq!(data.client_id, 2);
        assert_eq!(data.text_data.get(0), Some("x"));
    }

    #[test]
    fn decode_errors_name_the_problem() {
        assert!(matches!(
            ClientMessage::decode(77, &Bytes::new()),
            Err(DecodeError::UnknownType(77))
        ));
        assert!(matches!(
            ClientMessage::decode(
                ClientMessageType::HostSyncRequest.into(),
                &Bytes::from_static(b"{}")
            ),
            Err(DecodeError::Malformed {
                kind: ClientMessageType::HostSyncRequest,
                ..
            })
        ));
    }
}
