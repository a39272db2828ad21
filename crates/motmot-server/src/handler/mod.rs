pub mod auth;
pub mod friends;
pub mod presence;

#[cfg(test)]
mod tests;

use crate::connection::ConnectionHandle;
use crate::dispatch::Service;
use crate::error::RpcError;
use crate::federation::{FederationClient, Resolver};
use crate::registry::SessionRegistry;
use crate::store::Store;
use motmot::principal::{Principal, UserId};
use motmot::protocol::{Message, Request};
use std::sync::Arc;
use std::time::Duration;
use tokio_rustls::TlsConnector;

pub type HandlerResult = Result<Option<Message>, RpcError>;

/// Shared server state accessible by every connection.
pub struct ServerState {
    /// Domain this server is authoritative for.
    pub domain: String,
    pub registry: SessionRegistry,
    pub store: Store,
    pub federation: FederationClient,
    pub resolver: Arc<Resolver>,
}

impl ServerState {
    pub fn new(
        domain: &str,
        store: Store,
        resolver: Arc<Resolver>,
        federation_timeout: Duration,
        tls: Option<TlsConnector>,
    ) -> Arc<Self> {
        Arc::new(Self {
            domain: domain.to_string(),
            registry: SessionRegistry::new(),
            store,
            federation: FederationClient::new(domain, resolver.clone(), federation_timeout, tls),
            resolver,
        })
    }

    pub fn is_local(&self, user: &UserId) -> bool {
        user.is_hosted_by(&self.domain)
    }

    /// The user bound to this connection.
    fn require_user(&self, conn: &ConnectionHandle) -> Result<UserId, RpcError> {
        match self.registry.lookup(conn.addr()) {
            Some(session) => match session.principal {
                Principal::User(user) => Ok(user),
                Principal::Server(_) => Err(RpcError::PermissionDenied),
            },
            None => Err(missing_session(conn)),
        }
    }

    /// The peer domain bound to this connection.
    fn require_server(&self, conn: &ConnectionHandle) -> Result<String, RpcError> {
        match self.registry.lookup(conn.addr()) {
            Some(session) => match session.principal {
                Principal::Server(domain) => Ok(domain),
                Principal::User(_) => Err(RpcError::PermissionDenied),
            },
            None => Err(missing_session(conn)),
        }
    }
}

/// A request that lost its session to a disconnect is expired, not denied.
fn missing_session(conn: &ConnectionHandle) -> RpcError {
    if conn.is_closed() {
        RpcError::SessionExpired
    } else {
        RpcError::PermissionDenied
    }
}

fn parse_user(raw: &str) -> Result<UserId, RpcError> {
    Ok(raw.parse::<UserId>()?)
}

/// Handle a single request from a connection.
pub async fn handle_request(
    state: &ServerState,
    conn: &ConnectionHandle,
    req: Request,
) -> HandlerResult {
    match req {
        // Authentication
        Request::AuthenticateUser { username, password } => {
            auth::handle_authenticate_user(state, conn, &username, &password).await
        }
        Request::AuthenticateServer { domain } => {
            auth::handle_authenticate_server(state, conn, &domain).await
        }

        // Friends
        Request::RegisterFriend { friend } => {
            friends::handle_register_friend(state, conn, &friend).await
        }
        Request::UnregisterFriend { friend } => {
            friends::handle_unregister_friend(state, conn, &friend).await
        }
        Request::AcceptFriend { friend } => {
            friends::handle_accept_friend(state, conn, &friend).await
        }
        Request::GetFriendIp { friend } => friends::handle_get_friend_ip(state, conn, &friend),
        Request::ServerSendFriend { local, remote } => {
            friends::handle_server_send_friend(state, conn, &local, &remote).await
        }
        Request::ServerSendUnfriend { local, remote } => {
            friends::handle_server_send_unfriend(state, conn, &local, &remote).await
        }
        Request::ServerSendAccept {
            local,
            acceptor,
            status,
        } => friends::handle_server_send_accept(state, conn, &local, &acceptor, status).await,

        // Presence
        Request::RegisterStatus { status } => {
            presence::handle_register_status(state, conn, status).await
        }
        Request::GetAllStatuses => presence::handle_get_all_statuses(state, conn).await,
        Request::ServerSendStatusChanged { user, status } => {
            presence::handle_server_send_status_changed(state, conn, &user, status).await
        }
        Request::ServerGetStatus { requester, users } => {
            presence::handle_server_get_status(state, conn, &requester, &users).await
        }
    }
}

impl Service for ServerState {
    async fn handle(&self, conn: ConnectionHandle, req: Request) -> HandlerResult {
        handle_request(self, &conn, req).await
    }

    async fn disconnected(&self, conn: &ConnectionHandle) {
        presence::handle_disconnect(self, conn).await
    }
}
