use super::{HandlerResult, ServerState, parse_user};
use crate::connection::ConnectionHandle;
use crate::error::RpcError;
use crate::federation::FederationError;
use futures_util::future::join_all;
use motmot::principal::{Principal, UserId};
use motmot::protocol::{Message, Opcode, Request, Status, StatusEntry};
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Outcome of one status change fan-out.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct FanOut {
    /// Local friends that had a live connection to push to.
    pub pushed: usize,
    /// Remote domains notified, one call each.
    pub domains: Vec<String>,
}

pub async fn handle_register_status(
    state: &ServerState,
    conn: &ConnectionHandle,
    status: Status,
) -> HandlerResult {
    let user = state.require_user(conn)?;
    state.registry.set_status(conn.addr(), status)?;

    let fan_out = status_changed(state, &user, status).await?;
    tracing::info!(%user, %status, pushed = fan_out.pushed, domains = fan_out.domains.len(), "status registered");
    Ok(Some(Message::success("Status Registered", status.code())))
}

/// Tell everyone who accepted `user` about a new status: a push for each
/// connected local friend and a single call per remote domain.
///
/// Every remote domain is attempted; failures are reported together.
pub async fn status_changed(
    state: &ServerState,
    user: &UserId,
    status: Status,
) -> Result<FanOut, RpcError> {
    let user_key = user.to_string();
    let friends = state.store.list_accepted_friends(&user_key).await?;

    let mut fan_out = FanOut::default();
    let mut remote_domains = BTreeSet::new();
    for friend in friends {
        let Ok(friend_id) = friend.parse::<UserId>() else {
            tracing::warn!(%user, %friend, "skipping unparseable friend edge");
            continue;
        };
        if state.is_local(&friend_id) {
            if state
                .registry
                .push(&friend, Message::push_client_status(&user_key, status))
            {
                fan_out.pushed += 1;
            }
        } else {
            remote_domains.insert(friend_id.domain().to_string());
        }
    }

    let calls = remote_domains.iter().map(|domain| {
        let req = Request::ServerSendStatusChanged {
            user: user_key.clone(),
            status,
        };
        async move {
            let result = state.federation.call(domain, req, Opcode::Success).await;
            (domain.clone(), result)
        }
    });

    let mut failed = Vec::new();
    for (domain, result) in join_all(calls).await {
        match result {
            Ok(_) => fan_out.domains.push(domain),
            Err(_) => failed.push(domain),
        }
    }

    if failed.is_empty() {
        Ok(fan_out)
    } else {
        Err(FederationError::Domains(failed).into())
    }
}

pub async fn handle_get_all_statuses(state: &ServerState, conn: &ConnectionHandle) -> HandlerResult {
    let user = state.require_user(conn)?;
    let user_key = user.to_string();
    let friends = state.store.list_accepted_friends(&user_key).await?;

    let mut entries = Vec::new();
    let mut remote: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for friend in friends {
        let Ok(friend_id) = friend.parse::<UserId>() else {
            continue;
        };
        if state.is_local(&friend_id) {
            let status = state.registry.status_of(&friend).unwrap_or(Status::Offline);
            entries.push(StatusEntry::new(friend, status));
        } else {
            remote
                .entry(friend_id.domain().to_string())
                .or_default()
                .push(friend);
        }
    }

    let calls = remote.into_iter().map(|(domain, users)| {
        let asked: HashSet<String> = users.iter().cloned().collect();
        let req = Request::ServerGetStatus {
            requester: user_key.clone(),
            users,
        };
        async move {
            let reply = state
                .federation
                .call(&domain, req, Opcode::ServerGetStatusResp)
                .await;
            let entries = reply.and_then(|msg| {
                msg.status_entries()
                    .ok_or_else(|| FederationError::UnexpectedReply {
                        domain: domain.clone(),
                        reply: msg.to_string(),
                    })
            });
            (domain, asked, entries)
        }
    });

    let mut failed = Vec::new();
    for (domain, asked, result) in join_all(calls).await {
        match result {
            // Only keep answers for users we asked about.
            Ok(remote_entries) => entries.extend(
                remote_entries
                    .into_iter()
                    .filter(|entry| asked.contains(&entry.user)),
            ),
            Err(_) => failed.push(domain),
        }
    }
    if !failed.is_empty() {
        return Err(FederationError::Domains(failed).into());
    }

    Ok(Some(Message::status_list(Opcode::AllStatusResponse, &entries)))
}

pub async fn handle_server_send_status_changed(
    state: &ServerState,
    conn: &ConnectionHandle,
    user: &str,
    status: Status,
) -> HandlerResult {
    let peer = state.require_server(conn)?;
    let remote_user = parse_user(user)?;
    if !remote_user.is_hosted_by(&peer) {
        return Err(RpcError::PermissionDenied);
    }

    let remote_key = remote_user.to_string();
    let owners = state.store.list_accepted_owners(&remote_key).await?;
    let mut pushed = 0;
    for owner in owners {
        if owner.parse::<UserId>().is_ok_and(|o| state.is_local(&o))
            && state
                .registry
                .push(&owner, Message::push_client_status(&remote_key, status))
        {
            pushed += 1;
        }
    }

    tracing::debug!(%peer, user = %remote_user, %status, pushed, "federated status delivered");
    Ok(Some(Message::success("Status Delivered", user)))
}

/// Statuses of local `users` as visible to a remote `requester`. Users who
/// have not accepted the requester are left out.
pub async fn handle_server_get_status(
    state: &ServerState,
    conn: &ConnectionHandle,
    requester: &str,
    users: &[String],
) -> HandlerResult {
    let peer = state.require_server(conn)?;
    let requester_id = parse_user(requester)?;
    if !requester_id.is_hosted_by(&peer) {
        return Err(RpcError::PermissionDenied);
    }
    let requester_key = requester_id.to_string();

    let mut entries = Vec::with_capacity(users.len());
    for raw in users {
        let local = parse_user(raw)?;
        if !state.is_local(&local) {
            return Err(RpcError::PermissionDenied);
        }
        let local_key = local.to_string();
        if state.store.is_accepted(&local_key, &requester_key).await? {
            let status = state.registry.status_of(&local_key).unwrap_or(Status::Offline);
            entries.push(StatusEntry::new(raw.as_str(), status));
        }
    }

    Ok(Some(Message::status_list(Opcode::ServerGetStatusResp, &entries)))
}

/// Disconnect path: drop the session, then tell friends the user went
/// offline unless another connection is still logged in as them.
pub async fn handle_disconnect(state: &ServerState, conn: &ConnectionHandle) {
    let Some(session) = state.registry.deregister(conn.addr()) else {
        return;
    };
    let Principal::User(user) = session.principal else {
        tracing::debug!(peer = %conn.addr(), principal = %session.principal, "server session ended");
        return;
    };
    if state.registry.connection_for(&user.to_string()).is_some() {
        return;
    }

    tracing::info!(peer = %conn.addr(), %user, "user disconnected");
    if let Err(e) = status_changed(state, &user, Status::Offline).await {
        tracing::warn!(%user, err = %e, "offline propagation incomplete");
    }
}
