use crate::connection::ConnectionHandle;
use crate::error::RpcError;
use motmot::principal::Principal;
use motmot::protocol::{Message, Status};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    User,
    Server,
}

/// An authenticated connection.
#[derive(Debug, Clone)]
pub struct Session {
    pub addr: SocketAddr,
    pub principal: Principal,
    /// `None` for server principals.
    pub status: Option<Status>,
    pub kind: SessionKind,
}

#[derive(Default)]
struct Inner {
    by_session: HashMap<SocketAddr, Session>,
    /// Live connections of each local user keyed by canonical `name@domain`,
    /// oldest login first.
    by_username: HashMap<String, Vec<ConnectionHandle>>,
}

impl Inner {
    fn unindex(&mut self, username: &str, addr: SocketAddr) {
        if let Some(handles) = self.by_username.get_mut(username) {
            handles.retain(|h| h.addr() != addr);
            if handles.is_empty() {
                self.by_username.remove(username);
            }
        }
    }

    /// Newest live connection for `username`.
    fn newest(&self, username: &str) -> Option<&ConnectionHandle> {
        self.by_username.get(username)?.last()
    }
}

/// Process-wide table of authenticated connections.
///
/// Both maps sit under one lock so a session and its push index entry are
/// always created and removed together.
#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<Inner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // The maps stay consistent across a panicking holder; every mutation
        // completes before the guard is released.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind `principal` to the connection. Re-authenticating the same address
    /// replaces the previous principal. A connection that has already begun
    /// closing is refused with `SessionExpired`.
    pub fn authenticate(
        &self,
        conn: &ConnectionHandle,
        principal: Principal,
    ) -> Result<Session, RpcError> {
        let (kind, status) = match &principal {
            Principal::User(_) => (SessionKind::User, Some(Status::Online)),
            Principal::Server(_) => (SessionKind::Server, None),
        };
        let session = Session {
            addr: conn.addr(),
            principal,
            status,
            kind,
        };

        let mut inner = self.lock();
        if conn.is_closed() {
            return Err(RpcError::SessionExpired);
        }
        if let Some(previous) = inner.by_session.insert(conn.addr(), session.clone()) {
            if let Principal::User(old) = &previous.principal {
                inner.unindex(&old.to_string(), conn.addr());
            }
            tracing::debug!(peer = %conn.addr(), old = %previous.principal, new = %session.principal, "session replaced");
        }
        if let Principal::User(user) = &session.principal {
            inner
                .by_username
                .entry(user.to_string())
                .or_default()
                .push(conn.clone());
        }
        Ok(session)
    }

    pub fn lookup(&self, addr: SocketAddr) -> Option<Session> {
        self.lock().by_session.get(&addr).cloned()
    }

    pub fn set_status(&self, addr: SocketAddr, status: Status) -> Result<Session, RpcError> {
        let mut inner = self.lock();
        let session = inner
            .by_session
            .get_mut(&addr)
            .ok_or(RpcError::SessionExpired)?;
        session.status = Some(status);
        Ok(session.clone())
    }

    /// Remove the session for `addr` and its push index entry. Other live
    /// logins of the same user stay indexed.
    pub fn deregister(&self, addr: SocketAddr) -> Option<Session> {
        let mut inner = self.lock();
        let session = inner.by_session.remove(&addr)?;
        if let Principal::User(user) = &session.principal {
            inner.unindex(&user.to_string(), addr);
        }
        Some(session)
    }

    /// The connection pushes for `username` go to: its newest live login.
    pub fn connection_for(&self, username: &str) -> Option<ConnectionHandle> {
        self.lock().newest(username).cloned()
    }

    /// Current status of a local user; `None` if they have no live session.
    pub fn status_of(&self, username: &str) -> Option<Status> {
        let inner = self.lock();
        let handle = inner.newest(username)?;
        inner.by_session.get(&handle.addr())?.status
    }

    /// Deliver a push to a local user's live connection, if any.
    pub fn push(&self, username: &str, msg: Message) -> bool {
        match self.connection_for(username) {
            Some(conn) => conn.send(msg),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().by_session.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
