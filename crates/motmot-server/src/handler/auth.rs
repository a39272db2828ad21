use super::{HandlerResult, ServerState};
use crate::connection::ConnectionHandle;
use crate::error::RpcError;
use motmot::principal::{Principal, UserId, normalize_domain};
use motmot::protocol::Message;

pub async fn handle_authenticate_user(
    state: &ServerState,
    conn: &ConnectionHandle,
    username: &str,
    password: &str,
) -> HandlerResult {
    let user = match username.parse::<UserId>() {
        Ok(user) if state.is_local(&user) => user,
        Ok(_) | Err(_) => return Err(reject(state, conn, username, "not a local user")),
    };

    let matches = state
        .store
        .count_user_credential(&user.to_string(), password)
        .await?;
    if matches != 1 {
        return Err(reject(state, conn, username, "bad credentials"));
    }

    state.registry.authenticate(conn, Principal::User(user.clone()))?;
    tracing::info!(peer = %conn.addr(), %user, "user authenticated");
    Ok(Some(Message::authenticated()))
}

/// Trust a peer server when its claimed domain resolves to the address the
/// connection actually came from.
pub async fn handle_authenticate_server(
    state: &ServerState,
    conn: &ConnectionHandle,
    domain: &str,
) -> HandlerResult {
    let domain = match normalize_domain(domain) {
        Ok(d) if d != state.domain => d,
        _ => return Err(reject(state, conn, domain, "invalid or own domain")),
    };

    match state.resolver.verify_peer(&domain, conn.addr().ip()).await {
        Ok(true) => {}
        Ok(false) => return Err(reject(state, conn, &domain, "address mismatch")),
        Err(e) => {
            tracing::warn!(peer = %conn.addr(), %domain, err = %e, "peer domain lookup failed");
            return Err(reject(state, conn, &domain, "lookup failed"));
        }
    }

    state
        .registry
        .authenticate(conn, Principal::Server(domain.clone()))?;
    tracing::info!(peer = %conn.addr(), %domain, "server authenticated");
    Ok(Some(Message::authenticated()))
}

/// A failed attempt leaves the connection untrusted, dropping any earlier session.
fn reject(state: &ServerState, conn: &ConnectionHandle, claimed: &str, reason: &str) -> RpcError {
    state.registry.deregister(conn.addr());
    tracing::info!(peer = %conn.addr(), %claimed, reason, "authentication failed");
    RpcError::AuthenticationFailed
}
