use anyhow::{Result, bail};
use motmot::client::Client;
use motmot::protocol::{Message, Opcode, Request, Status, StatusEntry};
use std::net::SocketAddr;
use std::time::Duration;

/// Convenience wrapper over `Client` for integration tests.
pub struct TestClient {
    inner: Client,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        Ok(Self {
            inner: Client::connect(addr).await?,
        })
    }

    /// Authenticate, failing unless the server answers AUTHENTICATED.
    pub async fn login(&mut self, user: &str, password: &str) -> Result<()> {
        let reply = self.try_login(user, password).await?;
        if reply.opcode() != Some(Opcode::Authenticated) {
            bail!("login as {user} failed: {reply}");
        }
        Ok(())
    }

    pub async fn try_login(&mut self, user: &str, password: &str) -> Result<Message> {
        self.call(Request::AuthenticateUser {
            username: user.to_string(),
            password: password.to_string(),
        })
        .await
    }

    pub async fn register_friend(&mut self, friend: &str) -> Result<()> {
        self.expect_success(Request::RegisterFriend {
            friend: friend.to_string(),
        })
        .await
    }

    pub async fn unregister_friend(&mut self, friend: &str) -> Result<()> {
        self.expect_success(Request::UnregisterFriend {
            friend: friend.to_string(),
        })
        .await
    }

    pub async fn accept_friend(&mut self, friend: &str) -> Result<()> {
        self.expect_success(Request::AcceptFriend {
            friend: friend.to_string(),
        })
        .await
    }

    pub async fn register_status(&mut self, status: Status) -> Result<()> {
        self.expect_success(Request::RegisterStatus { status }).await
    }

    pub async fn all_statuses(&mut self) -> Result<Vec<StatusEntry>> {
        let reply = self.call(Request::GetAllStatuses).await?;
        match reply.status_entries() {
            Some(entries) if reply.opcode() == Some(Opcode::AllStatusResponse) => Ok(entries),
            _ => bail!("unexpected status reply: {reply}"),
        }
    }

    /// Send a request and return whatever reply comes back, errors included.
    pub async fn call(&mut self, req: Request) -> Result<Message> {
        self.inner.call(&req).await
    }

    /// Send an arbitrary message, valid or not.
    pub async fn send_raw(&mut self, msg: Message) -> Result<()> {
        self.inner.send(msg).await
    }

    pub async fn next_reply(&mut self) -> Result<Message> {
        self.inner.next_reply().await
    }

    pub async fn next_push(&mut self, timeout: Duration) -> Result<Option<Message>> {
        self.inner.next_push(timeout).await
    }

    async fn expect_success(&mut self, req: Request) -> Result<()> {
        let opcode = req.opcode();
        let reply = self.call(req).await?;
        if reply.opcode() != Some(Opcode::Success) {
            bail!("{opcode} failed: {reply}");
        }
        Ok(())
    }
}
