use super::friends;
use super::presence;
use super::*;
use crate::connection::Connection;
use motmot::codec::MessageCodec;
use motmot::protocol::{ErrorCode, Opcode, Status, StatusEntry};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

const DOMAIN: &str = "a.test";

static NEXT_PORT: AtomicU16 = AtomicU16::new(20_000);

/// Create a test ServerState over an in-memory store with no reachable peers.
fn make_test_state() -> Arc<ServerState> {
    let store = Store::open(None).unwrap();
    let resolver = Arc::new(Resolver::new(8888));
    ServerState::new(DOMAIN, store, resolver, Duration::from_millis(500), None)
}

/// A server-side connection plus the client end of its socket.
struct TestConn {
    conn: Connection,
    reader: ReadHalf<DuplexStream>,
    _writer: WriteHalf<DuplexStream>,
    codec: MessageCodec,
    queued: VecDeque<Message>,
}

impl TestConn {
    fn open() -> Self {
        let port = NEXT_PORT.fetch_add(1, Ordering::Relaxed);
        let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
        let (client, server) = tokio::io::duplex(16 * 1024);
        let (reader, writer) = tokio::io::split(client);
        Self {
            conn: Connection::open(server, addr),
            reader,
            _writer: writer,
            codec: MessageCodec::new(),
            queued: VecDeque::new(),
        }
    }

    fn handle(&self) -> &ConnectionHandle {
        self.conn.handle()
    }

    async fn try_next(&mut self, wait: Duration) -> Option<Message> {
        let deadline = tokio::time::Instant::now() + wait;
        let mut buf = [0u8; 1024];
        loop {
            if let Some(msg) = self.queued.pop_front() {
                return Some(msg);
            }
            let n = tokio::time::timeout_at(deadline, self.reader.read(&mut buf))
                .await
                .ok()?
                .unwrap();
            assert!(n > 0, "connection closed");
            self.codec.feed(&buf[..n]);
            for value in self.codec.drain().unwrap() {
                self.queued.push_back(Message::try_from(value).unwrap());
            }
        }
    }

    async fn next_push(&mut self) -> Message {
        self.try_next(Duration::from_secs(1))
            .await
            .expect("expected a push")
    }
}

async fn login(state: &ServerState, user: &str) -> TestConn {
    state.store.add_user(user, "pw").await.unwrap();
    let conn = TestConn::open();
    let reply = handle_request(
        state,
        conn.handle(),
        Request::AuthenticateUser {
            username: user.to_string(),
            password: "pw".to_string(),
        },
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(reply.opcode(), Some(Opcode::Authenticated));
    conn
}

async fn login_server(state: &ServerState, domain: &str) -> TestConn {
    state
        .resolver
        .add_override(domain, "127.0.0.1:1".parse().unwrap());
    let conn = TestConn::open();
    let reply = handle_request(
        state,
        conn.handle(),
        Request::AuthenticateServer {
            domain: domain.to_string(),
        },
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(reply.opcode(), Some(Opcode::Authenticated));
    conn
}

/// Make `a` and `b` (both local) accepted friends.
async fn befriend(state: &ServerState, a: &TestConn, b: &str) {
    call(state, a, Request::RegisterFriend { friend: b.to_string() }).await;
    call(state, a, Request::AcceptFriend { friend: b.to_string() }).await;
}

async fn call(state: &ServerState, conn: &TestConn, req: Request) -> Message {
    match handle_request(state, conn.handle(), req).await {
        Ok(Some(reply)) => reply,
        Ok(None) => panic!("expected a reply"),
        Err(e) => panic!("expected success, got: {e}"),
    }
}

fn assert_success(reply: &Message, text: &str) {
    assert_eq!(reply.opcode(), Some(Opcode::Success), "reply: {reply}");
    assert_eq!(reply.str_arg(0), Some(text));
}

// ---------------------------------------------------------------------------
// Authentication
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_authenticate_user_ok() {
    let state = make_test_state();
    let conn = login(&state, "alice@a.test").await;

    let session = state.registry.lookup(conn.handle().addr()).unwrap();
    assert_eq!(session.status, Some(Status::Online));
    assert!(state.registry.connection_for("alice@a.test").is_some());
}

#[tokio::test]
async fn test_wrong_password_then_privileged_call_is_denied() {
    let state = make_test_state();
    state.store.add_user("alice@a.test", "pw1").await.unwrap();
    let conn = TestConn::open();

    let err = handle_request(
        &state,
        conn.handle(),
        Request::AuthenticateUser {
            username: "alice@a.test".into(),
            password: "wrong".into(),
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, RpcError::AuthenticationFailed));
    assert_eq!(err.to_reply(), Message::auth_failed());

    let err = handle_request(
        &state,
        conn.handle(),
        Request::RegisterFriend {
            friend: "bob@a.test".into(),
        },
    )
    .await
    .unwrap_err();
    assert_eq!(err.to_reply(), Message::access_denied());
}

#[tokio::test]
async fn test_failed_reauth_drops_session() {
    let state = make_test_state();
    let conn = login(&state, "alice@a.test").await;

    let err = handle_request(
        &state,
        conn.handle(),
        Request::AuthenticateUser {
            username: "alice@a.test".into(),
            password: "nope".into(),
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, RpcError::AuthenticationFailed));
    assert!(state.registry.lookup(conn.handle().addr()).is_none());
}

#[tokio::test]
async fn test_foreign_domain_user_cannot_log_in() {
    let state = make_test_state();
    state.store.add_user("mallory@b.test", "pw").await.unwrap();
    let conn = TestConn::open();

    let err = handle_request(
        &state,
        conn.handle(),
        Request::AuthenticateUser {
            username: "mallory@b.test".into(),
            password: "pw".into(),
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, RpcError::AuthenticationFailed));
}

#[tokio::test]
async fn test_server_auth_checks_address() {
    let state = make_test_state();
    state
        .resolver
        .add_override("far.test", "10.9.8.7:8888".parse().unwrap());
    let conn = TestConn::open();

    let err = handle_request(
        &state,
        conn.handle(),
        Request::AuthenticateServer {
            domain: "far.test".into(),
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, RpcError::AuthenticationFailed));

    let err = handle_request(
        &state,
        conn.handle(),
        Request::ServerSendFriend {
            local: "alice@a.test".into(),
            remote: "bob@far.test".into(),
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, RpcError::PermissionDenied));
}

#[tokio::test]
async fn test_server_cannot_claim_our_domain() {
    let state = make_test_state();
    state
        .resolver
        .add_override(DOMAIN, "127.0.0.1:8888".parse().unwrap());
    let conn = TestConn::open();

    let err = handle_request(
        &state,
        conn.handle(),
        Request::AuthenticateServer {
            domain: DOMAIN.into(),
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, RpcError::AuthenticationFailed));
}

#[tokio::test]
async fn test_closed_connection_without_session_is_expired() {
    let state = make_test_state();
    let conn = login(&state, "alice@a.test").await;

    presence::handle_disconnect(&state, conn.handle()).await;
    conn.handle().mark_closed();

    let err = handle_request(&state, conn.handle(), Request::GetAllStatuses)
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::SessionExpired));
    assert_eq!(err.to_reply().error_code(), Some(ErrorCode::SessionExpired));
}

#[tokio::test]
async fn test_user_cannot_call_server_opcodes() {
    let state = make_test_state();
    let conn = login(&state, "alice@a.test").await;

    let err = handle_request(
        &state,
        conn.handle(),
        Request::ServerSendStatusChanged {
            user: "bob@b.test".into(),
            status: Status::Away,
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, RpcError::PermissionDenied));
}

// ---------------------------------------------------------------------------
// Friends
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_register_friend_is_idempotent() {
    let state = make_test_state();
    let alice = login(&state, "alice@a.test").await;

    for _ in 0..2 {
        let reply = call(&state, &alice, Request::RegisterFriend { friend: "bob@a.test".into() }).await;
        assert_success(&reply, "Friend Registered");
        assert_eq!(reply.str_arg(1), Some("bob@a.test"));
    }

    assert_eq!(state.store.count_friend_edge("alice@a.test", "bob@a.test").await.unwrap(), 1);
    assert_eq!(state.store.count_friend_edge("bob@a.test", "alice@a.test").await.unwrap(), 1);
    assert!(!state.store.is_accepted("alice@a.test", "bob@a.test").await.unwrap());
}

#[tokio::test]
async fn test_cannot_befriend_self() {
    let state = make_test_state();
    let alice = login(&state, "alice@a.test").await;

    let err = handle_request(
        &state,
        alice.handle(),
        Request::RegisterFriend {
            friend: "alice@a.test".into(),
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, RpcError::MalformedRequest(_)));
}

#[tokio::test]
async fn test_malformed_friend_name() {
    let state = make_test_state();
    let alice = login(&state, "alice@a.test").await;

    let err = handle_request(
        &state,
        alice.handle(),
        Request::RegisterFriend {
            friend: "bob".into(),
        },
    )
    .await
    .unwrap_err();
    assert_eq!(err.to_reply().error_code(), Some(ErrorCode::MalformedRequest));
}

#[tokio::test]
async fn test_accept_local_friend_is_symmetric_and_pushes() {
    let state = make_test_state();
    let mut alice = login(&state, "alice@a.test").await;
    let bob = login(&state, "bob@a.test").await;

    call(&state, &alice, Request::RegisterFriend { friend: "bob@a.test".into() }).await;
    let reply = call(&state, &bob, Request::AcceptFriend { friend: "alice@a.test".into() }).await;
    assert_success(&reply, "Friend Accepted");

    assert!(state.store.is_accepted("alice@a.test", "bob@a.test").await.unwrap());
    assert!(state.store.is_accepted("bob@a.test", "alice@a.test").await.unwrap());

    let push = alice.next_push().await;
    assert_eq!(push, Message::push_friend_accept("bob@a.test", Status::Online));
}

#[tokio::test]
async fn test_accept_without_request_is_rejected() {
    let state = make_test_state();
    let alice = login(&state, "alice@a.test").await;

    let err = handle_request(
        &state,
        alice.handle(),
        Request::AcceptFriend {
            friend: "bob@a.test".into(),
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, RpcError::MalformedRequest(_)));
}

#[tokio::test]
async fn test_unregister_then_register_starts_fresh() {
    let state = make_test_state();
    let alice = login(&state, "alice@a.test").await;
    befriend(&state, &alice, "bob@a.test").await;

    let reply = call(&state, &alice, Request::UnregisterFriend { friend: "bob@a.test".into() }).await;
    assert_success(&reply, "Friend Unregistered");
    assert_eq!(state.store.count_friend_edge("alice@a.test", "bob@a.test").await.unwrap(), 0);
    assert_eq!(state.store.count_friend_edge("bob@a.test", "alice@a.test").await.unwrap(), 0);

    call(&state, &alice, Request::RegisterFriend { friend: "bob@a.test".into() }).await;
    assert!(!state.store.is_accepted("alice@a.test", "bob@a.test").await.unwrap());
    assert!(!state.store.is_accepted("bob@a.test", "alice@a.test").await.unwrap());
}

#[tokio::test]
async fn test_remote_friend_with_unreachable_domain_fails_visibly() {
    let state = make_test_state();
    state
        .resolver
        .add_override("gone.test", "127.0.0.1:1".parse().unwrap());
    let alice = login(&state, "alice@a.test").await;

    let err = handle_request(
        &state,
        alice.handle(),
        Request::RegisterFriend {
            friend: "bob@gone.test".into(),
        },
    )
    .await
    .unwrap_err();
    assert_eq!(err.to_reply().error_code(), Some(ErrorCode::RemoteFederationError));
    assert!(err.to_string().contains("gone.test"));
    assert_eq!(state.store.count_friend_edge("alice@a.test", "bob@gone.test").await.unwrap(), 0);
}

#[tokio::test]
async fn test_failed_remote_request_keeps_existing_edge() {
    let state = make_test_state();
    state
        .resolver
        .add_override("gone.test", "127.0.0.1:1".parse().unwrap());
    state.store.insert_friend_edge("alice@a.test", "bob@gone.test").await.unwrap();
    let alice = login(&state, "alice@a.test").await;

    let err = handle_request(
        &state,
        alice.handle(),
        Request::RegisterFriend {
            friend: "bob@gone.test".into(),
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, RpcError::RemoteFederation(_)));
    assert_eq!(state.store.count_friend_edge("alice@a.test", "bob@gone.test").await.unwrap(), 1);
}

#[tokio::test]
async fn test_failed_remote_accept_stays_pending() {
    let state = make_test_state();
    state
        .resolver
        .add_override("gone.test", "127.0.0.1:1".parse().unwrap());
    state.store.insert_friend_edge("alice@a.test", "bob@gone.test").await.unwrap();
    let alice = login(&state, "alice@a.test").await;

    let err = handle_request(
        &state,
        alice.handle(),
        Request::AcceptFriend {
            friend: "bob@gone.test".into(),
        },
    )
    .await
    .unwrap_err();
    assert_eq!(err.to_reply().error_code(), Some(ErrorCode::RemoteFederationError));
    assert!(!state.store.is_accepted("alice@a.test", "bob@gone.test").await.unwrap());
    assert_eq!(state.store.count_friend_edge("alice@a.test", "bob@gone.test").await.unwrap(), 1);
}

#[tokio::test]
async fn test_get_friend_ip_is_not_implemented() {
    let state = make_test_state();
    let alice = login(&state, "alice@a.test").await;

    let err = handle_request(
        &state,
        alice.handle(),
        Request::GetFriendIp {
            friend: "bob@a.test".into(),
        },
    )
    .await
    .unwrap_err();
    assert_eq!(
        err.to_reply(),
        Message::error(ErrorCode::NotImplemented, "Not Implemented")
    );
}

#[tokio::test]
async fn test_server_send_friend_creates_mirrored_row() {
    let state = make_test_state();
    let peer = login_server(&state, "b.test").await;

    let reply = call(
        &state,
        &peer,
        Request::ServerSendFriend {
            local: "alice@a.test".into(),
            remote: "bob@b.test".into(),
        },
    )
    .await;
    assert_success(&reply, "Friend Registered");
    assert_eq!(reply.str_arg(1), Some("alice@a.test"));
    assert_eq!(state.store.count_friend_edge("alice@a.test", "bob@b.test").await.unwrap(), 1);
    assert_eq!(state.store.count_friend_edge("bob@b.test", "alice@a.test").await.unwrap(), 0);
}

#[tokio::test]
async fn test_server_cannot_speak_for_other_domains() {
    let state = make_test_state();
    let peer = login_server(&state, "b.test").await;

    let spoofed = handle_request(
        &state,
        peer.handle(),
        Request::ServerSendFriend {
            local: "alice@a.test".into(),
            remote: "carol@c.test".into(),
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(spoofed, RpcError::PermissionDenied));

    let not_ours = handle_request(
        &state,
        peer.handle(),
        Request::ServerSendFriend {
            local: "dave@d.test".into(),
            remote: "bob@b.test".into(),
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(not_ours, RpcError::PermissionDenied));
}

#[tokio::test]
async fn test_server_send_accept_pushes_to_local_user() {
    let state = make_test_state();
    let mut alice = login(&state, "alice@a.test").await;
    let peer = login_server(&state, "b.test").await;
    state.store.insert_friend_edge("alice@a.test", "bob@b.test").await.unwrap();

    let reply = call(
        &state,
        &peer,
        Request::ServerSendAccept {
            local: "alice@a.test".into(),
            acceptor: "bob@b.test".into(),
            status: Status::Busy,
        },
    )
    .await;
    assert_success(&reply, "Friend Accepted");
    assert!(state.store.is_accepted("alice@a.test", "bob@b.test").await.unwrap());
    assert_eq!(
        alice.next_push().await,
        Message::push_friend_accept("bob@b.test", Status::Busy)
    );
}

#[tokio::test]
async fn test_server_send_unfriend_removes_rows() {
    let state = make_test_state();
    let peer = login_server(&state, "b.test").await;
    state.store.insert_friend_edge("alice@a.test", "bob@b.test").await.unwrap();

    let reply = call(
        &state,
        &peer,
        Request::ServerSendUnfriend {
            local: "alice@a.test".into(),
            remote: "bob@b.test".into(),
        },
    )
    .await;
    assert_success(&reply, "Friend Unregistered");
    assert_eq!(state.store.count_friend_edge("alice@a.test", "bob@b.test").await.unwrap(), 0);
}

// ---------------------------------------------------------------------------
// Presence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_status_change_pushes_to_connected_local_friends() {
    let state = make_test_state();
    let alice = login(&state, "alice@a.test").await;
    let mut bob = login(&state, "bob@a.test").await;
    let mut carol = login(&state, "carol@a.test").await;
    befriend(&state, &alice, "bob@a.test").await;
    befriend(&state, &alice, "carol@a.test").await;
    // Pending only: dave must not hear about it.
    call(&state, &alice, Request::RegisterFriend { friend: "dave@a.test".into() }).await;

    let user: UserId = "alice@a.test".parse().unwrap();
    let fan_out = presence::status_changed(&state, &user, Status::Away).await.unwrap();
    assert_eq!(fan_out.pushed, 2);
    assert!(fan_out.domains.is_empty());

    let expected = Message::push_client_status("alice@a.test", Status::Away);
    assert_eq!(bob.next_push().await, expected);
    assert_eq!(carol.next_push().await, expected);
}

#[tokio::test]
async fn test_register_status_updates_session() {
    let state = make_test_state();
    let alice = login(&state, "alice@a.test").await;

    let reply = call(&state, &alice, Request::RegisterStatus { status: Status::Busy }).await;
    assert_success(&reply, "Status Registered");
    assert_eq!(reply.int_arg(1), Some(Status::Busy.code()));
    assert_eq!(state.registry.status_of("alice@a.test"), Some(Status::Busy));
}

#[tokio::test]
async fn test_register_status_reports_failed_domains() {
    let state = make_test_state();
    state
        .resolver
        .add_override("gone.test", "127.0.0.1:1".parse().unwrap());
    let alice = login(&state, "alice@a.test").await;
    state.store.insert_friend_edge("alice@a.test", "x@gone.test").await.unwrap();
    state.store.set_accepted("alice@a.test", "x@gone.test").await.unwrap();

    let err = handle_request(
        &state,
        alice.handle(),
        Request::RegisterStatus {
            status: Status::Away,
        },
    )
    .await
    .unwrap_err();
    let reply = err.to_reply();
    assert_eq!(reply.error_code(), Some(ErrorCode::RemoteFederationError));
    assert!(reply.str_arg(0).unwrap().contains("gone.test"));
    // The local status change still took effect.
    assert_eq!(state.registry.status_of("alice@a.test"), Some(Status::Away));
}

#[tokio::test]
async fn test_get_all_statuses_reports_offline_friends() {
    let state = make_test_state();
    let alice = login(&state, "alice@a.test").await;
    let bob = login(&state, "bob@a.test").await;
    befriend(&state, &alice, "bob@a.test").await;
    befriend(&state, &alice, "carol@a.test").await;
    call(&state, &bob, Request::RegisterStatus { status: Status::Away }).await;

    let reply = call(&state, &alice, Request::GetAllStatuses).await;
    assert_eq!(reply.opcode(), Some(Opcode::AllStatusResponse));
    assert_eq!(
        reply.status_entries().unwrap(),
        vec![
            StatusEntry::new("bob@a.test", Status::Away),
            StatusEntry::new("carol@a.test", Status::Offline),
        ]
    );
}

#[tokio::test]
async fn test_server_get_status_only_answers_for_accepted_edges() {
    let state = make_test_state();
    let _alice = login(&state, "alice@a.test").await;
    let peer = login_server(&state, "b.test").await;
    for user in ["alice@a.test", "carol@a.test"] {
        state.store.insert_friend_edge(user, "bob@b.test").await.unwrap();
    }
    state.store.set_accepted("alice@a.test", "bob@b.test").await.unwrap();

    let reply = call(
        &state,
        &peer,
        Request::ServerGetStatus {
            requester: "bob@b.test".into(),
            users: vec!["alice@a.test".into(), "carol@a.test".into()],
        },
    )
    .await;
    assert_eq!(reply.opcode(), Some(Opcode::ServerGetStatusResp));
    assert_eq!(
        reply.status_entries().unwrap(),
        vec![StatusEntry::new("alice@a.test", Status::Online)]
    );
}

#[tokio::test]
async fn test_server_status_changed_fans_out_to_owners() {
    let state = make_test_state();
    let mut alice = login(&state, "alice@a.test").await;
    let peer = login_server(&state, "b.test").await;
    state.store.insert_friend_edge("alice@a.test", "bob@b.test").await.unwrap();
    state.store.set_accepted("alice@a.test", "bob@b.test").await.unwrap();

    let reply = call(
        &state,
        &peer,
        Request::ServerSendStatusChanged {
            user: "bob@b.test".into(),
            status: Status::Busy,
        },
    )
    .await;
    assert_success(&reply, "Status Delivered");
    assert_eq!(
        alice.next_push().await,
        Message::push_client_status("bob@b.test", Status::Busy)
    );
}

#[tokio::test]
async fn test_server_status_changed_pushes_canonical_name() {
    let state = make_test_state();
    let mut alice = login(&state, "alice@a.test").await;
    let peer = login_server(&state, "b.test").await;
    state.store.insert_friend_edge("alice@a.test", "bob@b.test").await.unwrap();
    state.store.set_accepted("alice@a.test", "bob@b.test").await.unwrap();

    call(
        &state,
        &peer,
        Request::ServerSendStatusChanged {
            user: "bob@B.TEST".into(),
            status: Status::Away,
        },
    )
    .await;
    assert_eq!(
        alice.next_push().await,
        Message::push_client_status("bob@b.test", Status::Away)
    );
}

#[tokio::test]
async fn test_disconnect_propagates_offline() {
    let state = make_test_state();
    let alice = login(&state, "alice@a.test").await;
    let mut bob = login(&state, "bob@a.test").await;
    befriend(&state, &alice, "bob@a.test").await;
    // Drain the accept notice.
    let _ = bob.try_next(Duration::from_millis(50)).await;

    presence::handle_disconnect(&state, alice.handle()).await;

    assert!(state.registry.connection_for("alice@a.test").is_none());
    assert_eq!(
        bob.next_push().await,
        Message::push_client_status("alice@a.test", Status::Offline)
    );
}

#[tokio::test]
async fn test_disconnect_with_second_login_stays_quiet() {
    let state = make_test_state();
    let alice = login(&state, "alice@a.test").await;
    let mut bob = login(&state, "bob@a.test").await;
    befriend(&state, &alice, "bob@a.test").await;
    let _ = bob.try_next(Duration::from_millis(50)).await;
    let _second = login(&state, "alice@a.test").await;

    presence::handle_disconnect(&state, alice.handle()).await;

    assert!(state.registry.connection_for("alice@a.test").is_some());
    assert!(bob.try_next(Duration::from_millis(100)).await.is_none());
}

#[tokio::test]
async fn test_newest_login_disconnect_keeps_older_session() {
    let state = make_test_state();
    let mut alice = login(&state, "alice@a.test").await;
    let mut bob = login(&state, "bob@a.test").await;
    befriend(&state, &alice, "bob@a.test").await;
    let _ = bob.try_next(Duration::from_millis(50)).await;
    let second = login(&state, "alice@a.test").await;

    presence::handle_disconnect(&state, second.handle()).await;

    let live = state.registry.connection_for("alice@a.test").unwrap();
    assert_eq!(live.addr(), alice.handle().addr());
    assert_eq!(state.registry.status_of("alice@a.test"), Some(Status::Online));
    assert!(bob.try_next(Duration::from_millis(100)).await.is_none());

    // Pushes still reach the older login.
    call(&state, &bob, Request::RegisterStatus { status: Status::Away }).await;
    assert_eq!(
        alice.next_push().await,
        Message::push_client_status("bob@a.test", Status::Away)
    );
}

#[tokio::test]
async fn test_login_on_closing_connection_is_expired() {
    let state = make_test_state();
    state.store.add_user("alice@a.test", "pw").await.unwrap();
    let conn = TestConn::open();
    conn.handle().close();

    let err = handle_request(
        &state,
        conn.handle(),
        Request::AuthenticateUser {
            username: "alice@a.test".into(),
            password: "pw".into(),
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, RpcError::SessionExpired));
    assert!(state.registry.connection_for("alice@a.test").is_none());
}

#[tokio::test]
async fn test_login_racing_disconnect_leaves_no_session() {
    let state = make_test_state();
    state.store.add_user("alice@a.test", "pw").await.unwrap();
    let (client, server) = tokio::io::duplex(4096);
    let addr: SocketAddr = "127.0.0.1:45000".parse().unwrap();
    let task = tokio::spawn(crate::dispatch::run(
        Connection::open(server, addr),
        state.clone(),
    ));

    let (reader, mut writer) = tokio::io::split(client);
    let request = Request::AuthenticateUser {
        username: "alice@a.test".into(),
        password: "pw".into(),
    };
    writer
        .write_all(&MessageCodec::encode(&request.to_message()).unwrap())
        .await
        .unwrap();
    // Hang up while the password check is still running.
    drop(reader);
    drop(writer);

    task.await.unwrap();
    assert!(state.registry.lookup(addr).is_none());
    assert_eq!(state.registry.status_of("alice@a.test"), None);
    assert!(state.registry.is_empty());
}

#[tokio::test]
async fn test_friends_link_from_peer_is_not_mirrored_back() {
    let state = make_test_state();
    // No override for b.test: any outbound call would fail.
    let local: UserId = "alice@a.test".parse().unwrap();
    let remote: UserId = "bob@b.test".parse().unwrap();

    friends::link(&state, &local, &remote, friends::Origin::Federated)
        .await
        .unwrap();
    friends::unlink(&state, &local, &remote, friends::Origin::Federated)
        .await
        .unwrap();
}
