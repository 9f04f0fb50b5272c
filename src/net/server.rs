use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::group::{Group, GroupHandle, GroupState, RunningGroup};
use crate::net::connection::{ClientConnection, Connection, INTRODUCTION_TIMEOUT};
use crate::payload::{self, ClientIdentity, ClientIntroduction};

/// Where an authenticated secret leads.
#[derive(Clone)]
pub struct SecretMapping {
    pub group: GroupHandle,
    pub public_id: u64,
}

/// Groups built from the configuration, not yet running.
pub struct Server {
    groups: Vec<Group>,
    secrets: HashMap<String, SecretMapping>,
    write_queue_capacity: usize,
    max_pending_handshakes: usize,
}

impl Server {
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;

        let mut groups = Vec::with_capacity(config.groups.len());
        let mut secrets = HashMap::new();
        for (index, group_config) in config.groups.iter().enumerate() {
            let mut group = Group::with_capacity(
                group_config.display_name(index),
                config.task_queue_capacity,
            );
            for client in &group_config.clients {
                let mapping = SecretMapping {
                    group: group.handle(),
                    public_id: client.public_id,
                };
                if secrets.insert(client.secret.clone(), mapping).is_some() {
                    anyhow::bail!("Secret of client {} is not unique", client.public_id);
                }
                group.add_client(ClientIdentity::new(client.public_id, client.name.clone()));
            }
            groups.push(group);
        }

        Ok(Self {
            groups,
            secrets,
            write_queue_capacity: config.write_queue_capacity,
            max_pending_handshakes: config.max_pending_handshakes,
        })
    }

    pub fn group_names(&self) -> impl Iterator<Item = &str> {
        self.groups.iter().map(Group::name)
    }

    /// Starts every group's executor. Connections can be accepted afterwards.
    pub fn start(self) -> Result<RunningServer> {
        let mut groups = Vec::with_capacity(self.groups.len());
        for group in self.groups {
            groups.push(group.run_async()?);
        }
        info!(
            groups = groups.len(),
            clients = self.secrets.len(),
            "Server started"
        );
        Ok(RunningServer {
            handshake: Arc::new(Handshake {
                secrets: self.secrets,
                write_queue_capacity: self.write_queue_capacity,
                pending: Arc::new(Semaphore::new(self.max_pending_handshakes)),
            }),
            groups,
        })
    }
}

pub struct RunningServer {
    handshake: Arc<Handshake>,
    groups: Vec<RunningGroup>,
}

impl RunningServer {
    /// Accept loop for one listener. Each socket gets its own task that runs
    /// the TLS and introduction handshake and hands the connection to its
    /// group.
    pub fn listen(
        &self,
        listener: TcpListener,
        tls: Option<TlsAcceptor>,
    ) -> impl Future<Output = Result<()>> + Send + use<> {
        let handshake = self.handshake.clone();
        async move {
            let local = listener.local_addr().context("Listener has no local address")?;
            info!(tls = tls.is_some(), "Listening on {}", local);

            loop {
                let (socket, peer) = listener
                    .accept()
                    .await
                    .context("Failed to accept connection")?;
                let handshake = handshake.clone();
                let tls = tls.clone();

                tokio::spawn(async move {
                    let _permit = match handshake.pending.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => {
                            warn!("Handshake semaphore closed");
                            return;
                        }
                    };
                    handshake.handle_socket(socket, peer, tls).await;
                });
            }
        }
    }

    /// Authenticates an already wrapped connection and routes it.
    pub async fn handle_new_connection(&self, connection: Connection) {
        self.handshake.handle_new_connection(connection).await;
    }

    /// Stops every group and returns their final state.
    pub fn shutdown(self) -> Result<Vec<GroupState>> {
        self.groups
            .into_iter()
            .map(RunningGroup::shutdown)
            .collect()
    }
}

struct Handshake {
    secrets: HashMap<String, SecretMapping>,
    write_queue_capacity: usize,
    pending: Arc<Semaphore>,
}

impl Handshake {
    async fn handle_socket(&self, socket: TcpStream, peer: SocketAddr, tls: Option<TlsAcceptor>) {
        let address = peer.to_string();
        debug!(%address, "Accepted connection");

        let connection = match tls {
            Some(acceptor) => {
                match tokio::time::timeout(INTRODUCTION_TIMEOUT, acceptor.accept(socket)).await {
                    Ok(Ok(stream)) => {
                        Connection::with_queue_capacity(stream, address, self.write_queue_capacity)
                    }
                    Ok(Err(e)) => {
                        debug!(%address, "TLS handshake failed: {}", e);
                        return;
                    }
                    Err(_) => {
                        debug!(%address, "TLS handshake timed out");
                        return;
                    }
                }
            }
            None => Connection::with_queue_capacity(socket, address, self.write_queue_capacity),
        };
        self.handle_new_connection(connection).await;
    }

    async fn handle_new_connection(&self, mut connection: Connection) {
        let introduction = match connection.read_introduction().await {
            Ok(payload) => payload,
            Err(e) => {
                info!(address = connection.address(), "Rejected connection: {}", e);
                connection.disconnect_and_stop();
                return;
            }
        };

        let secret = match payload::deserialize::<ClientIntroduction>(&introduction) {
            Ok(introduction) => introduction.secret,
            Err(e) => {
                info!(address = connection.address(), "Rejected connection: {:#}", e);
                connection.disconnect_and_stop();
                return;
            }
        };

        let Some(mapping) = self.secrets.get(&secret) else {
            info!(address = connection.address(), "Rejected connection with an unknown secret");
            connection.disconnect_and_stop();
            return;
        };

        debug!(
            address = connection.address(),
            group = mapping.group.name(),
            client = mapping.public_id,
            "Client authenticated"
        );
        mapping
            .group
            .handle_connection(mapping.public_id, Arc::new(connection))
            .await;
    }
}
