use super::{HandlerResult, ServerState, parse_user};
use crate::connection::ConnectionHandle;
use crate::error::RpcError;
use motmot::principal::UserId;
use motmot::protocol::{Message, Opcode, Request, Status};

/// Where a friend operation came from. Operations that arrived from a peer
/// domain are never mirrored back to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Federated,
}

pub async fn handle_register_friend(
    state: &ServerState,
    conn: &ConnectionHandle,
    friend: &str,
) -> HandlerResult {
    let user = state.require_user(conn)?;
    let target = parse_user(friend)?;
    if target == user {
        return Err(RpcError::MalformedRequest("cannot befriend yourself".into()));
    }

    link(state, &user, &target, Origin::Local).await?;
    tracing::info!(%user, friend = %target, "friend registered");
    Ok(Some(Message::success("Friend Registered", friend)))
}

/// Create the pending edge `owner -> friend`. A local friend gets the reverse
/// pending edge too; a remote friend's domain is told to create it.
pub async fn link(
    state: &ServerState,
    owner: &UserId,
    friend: &UserId,
    origin: Origin,
) -> Result<(), RpcError> {
    let (owner_key, friend_key) = (owner.to_string(), friend.to_string());
    let inserted = state.store.insert_friend_edge(&owner_key, &friend_key).await?;

    if state.is_local(friend) {
        state.store.insert_friend_edge(&friend_key, &owner_key).await?;
    } else if origin == Origin::Local {
        let req = Request::ServerSendFriend {
            local: friend_key.clone(),
            remote: owner_key.clone(),
        };
        if let Err(e) = state.federation.call(friend.domain(), req, Opcode::Success).await {
            // Only withdraw the edge this request created.
            if inserted {
                state.store.delete_friend_edge(&owner_key, &friend_key).await?;
            }
            return Err(e.into());
        }
    }
    Ok(())
}

pub async fn handle_unregister_friend(
    state: &ServerState,
    conn: &ConnectionHandle,
    friend: &str,
) -> HandlerResult {
    let user = state.require_user(conn)?;
    let target = parse_user(friend)?;

    unlink(state, &user, &target, Origin::Local).await?;
    tracing::info!(%user, friend = %target, "friend unregistered");
    Ok(Some(Message::success("Friend Unregistered", friend)))
}

/// Drop both directions of the relationship, mirroring to a remote domain.
pub async fn unlink(
    state: &ServerState,
    owner: &UserId,
    friend: &UserId,
    origin: Origin,
) -> Result<(), RpcError> {
    let (owner_key, friend_key) = (owner.to_string(), friend.to_string());
    state.store.delete_friend_pair(&owner_key, &friend_key).await?;

    if !state.is_local(friend) && origin == Origin::Local {
        let req = Request::ServerSendUnfriend {
            local: friend_key,
            remote: owner_key,
        };
        state
            .federation
            .call(friend.domain(), req, Opcode::Success)
            .await?;
    }
    Ok(())
}

pub async fn handle_accept_friend(
    state: &ServerState,
    conn: &ConnectionHandle,
    friend: &str,
) -> HandlerResult {
    let user = state.require_user(conn)?;
    let target = parse_user(friend)?;
    let (user_key, friend_key) = (user.to_string(), target.to_string());

    if state.store.count_friend_edge(&user_key, &friend_key).await? == 0 {
        return Err(RpcError::MalformedRequest(format!(
            "no friend request involving {target}"
        )));
    }

    let status = state.registry.status_of(&user_key).unwrap_or(Status::Online);
    if state.is_local(&target) {
        state.store.accept_pair(&user_key, &friend_key).await?;
        state
            .registry
            .push(&friend_key, Message::push_friend_accept(&user_key, status));
    } else {
        let was_accepted = state.store.is_accepted(&user_key, &friend_key).await?;
        state.store.set_accepted(&user_key, &friend_key).await?;
        let req = Request::ServerSendAccept {
            local: friend_key.clone(),
            acceptor: user_key.clone(),
            status,
        };
        if let Err(e) = state.federation.call(target.domain(), req, Opcode::Success).await {
            if !was_accepted {
                state.store.set_pending(&user_key, &friend_key).await?;
            }
            return Err(e.into());
        }
    }

    tracing::info!(%user, friend = %target, "friend accepted");
    Ok(Some(Message::success("Friend Accepted", friend)))
}

/// NAT brokering is not offered.
pub fn handle_get_friend_ip(
    state: &ServerState,
    conn: &ConnectionHandle,
    _friend: &str,
) -> HandlerResult {
    state.require_user(conn)?;
    Err(RpcError::NotImplemented)
}

/// Parse a `(local, remote)` pair named by a peer server and check the peer
/// is allowed to speak for `remote`.
fn federated_pair(
    state: &ServerState,
    peer: &str,
    local: &str,
    remote: &str,
) -> Result<(UserId, UserId), RpcError> {
    let local = parse_user(local)?;
    let remote = parse_user(remote)?;
    if !state.is_local(&local) || !remote.is_hosted_by(peer) {
        tracing::warn!(%peer, %local, %remote, "peer named users outside its authority");
        return Err(RpcError::PermissionDenied);
    }
    Ok((local, remote))
}

pub async fn handle_server_send_friend(
    state: &ServerState,
    conn: &ConnectionHandle,
    local: &str,
    remote: &str,
) -> HandlerResult {
    let peer = state.require_server(conn)?;
    let (local_user, remote_user) = federated_pair(state, &peer, local, remote)?;

    link(state, &local_user, &remote_user, Origin::Federated).await?;
    tracing::info!(%peer, local = %local_user, remote = %remote_user, "federated friend request");
    Ok(Some(Message::success("Friend Registered", local)))
}

pub async fn handle_server_send_unfriend(
    state: &ServerState,
    conn: &ConnectionHandle,
    local: &str,
    remote: &str,
) -> HandlerResult {
    let peer = state.require_server(conn)?;
    let (local_user, remote_user) = federated_pair(state, &peer, local, remote)?;

    unlink(state, &local_user, &remote_user, Origin::Federated).await?;
    Ok(Some(Message::success("Friend Unregistered", local)))
}

pub async fn handle_server_send_accept(
    state: &ServerState,
    conn: &ConnectionHandle,
    local: &str,
    acceptor: &str,
    status: Status,
) -> HandlerResult {
    let peer = state.require_server(conn)?;
    let (local_user, acceptor_user) = federated_pair(state, &peer, local, acceptor)?;
    let (local_key, acceptor_key) = (local_user.to_string(), acceptor_user.to_string());

    if !state.store.set_accepted(&local_key, &acceptor_key).await? {
        return Err(RpcError::MalformedRequest(format!(
            "{local_user} has no pending request for {acceptor_user}"
        )));
    }
    state
        .registry
        .push(&local_key, Message::push_friend_accept(&acceptor_key, status));

    tracing::info!(%peer, local = %local_user, acceptor = %acceptor_user, "federated accept");
    Ok(Some(Message::success("Friend Accepted", local)))
}
