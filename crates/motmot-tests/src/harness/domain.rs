use super::client::TestClient;
use anyhow::Result;
use motmot_server::config::ServerConfig;
use motmot_server::handler::ServerState;
use motmot_server::server;
use std::net::SocketAddr;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// An in-process domain server on a random loopback port with a temp data directory.
pub struct TestDomain {
    pub domain: String,
    pub addr: SocketAddr,
    pub state: Arc<ServerState>,
    shutdown: CancellationToken,
    _data_dir: TempDir,
}

impl TestDomain {
    pub async fn spawn(domain: &str) -> Result<Self> {
        super::init_tracing();
        let data_dir = TempDir::new()?;

        let mut config = ServerConfig::new(domain);
        config.data_dir = Some(data_dir.path().to_path_buf());
        config.federation.timeout_secs = 2;
        let config = config.validate()?;

        let state = server::build_state(&config)?;
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let shutdown = CancellationToken::new();
        tokio::spawn(server::serve(listener, state.clone(), None, shutdown.clone()));

        Ok(Self {
            domain: config.domain,
            addr,
            state,
            shutdown,
            _data_dir: data_dir,
        })
    }

    /// Two domains that can reach each other through static host overrides.
    pub async fn spawn_pair(a: &str, b: &str) -> Result<(Self, Self)> {
        let a = Self::spawn(a).await?;
        let b = Self::spawn(b).await?;
        a.add_peer(&b.domain, b.addr);
        b.add_peer(&a.domain, a.addr);
        Ok((a, b))
    }

    /// Route federation traffic for `domain` to `addr`.
    pub fn add_peer(&self, domain: &str, addr: SocketAddr) {
        self.state.resolver.add_override(domain, addr);
    }

    pub async fn add_user(&self, user: &str, password: &str) -> Result<()> {
        self.state.store.add_user(user, password).await?;
        Ok(())
    }

    pub async fn connect(&self) -> Result<TestClient> {
        TestClient::connect(self.addr).await
    }

    /// Create `user` with a throwaway password and return a logged-in client.
    pub async fn login(&self, user: &str) -> Result<TestClient> {
        self.add_user(user, "secret").await?;
        let mut client = self.connect().await?;
        client.login(user, "secret").await?;
        Ok(client)
    }
}

impl Drop for TestDomain {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
