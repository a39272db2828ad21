use crate::certs;
use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::dispatch;
use crate::federation::Resolver;
use crate::handler::ServerState;
use crate::store::Store;
use crate::tls;
use anyhow::Context;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Build shared state (store, resolver, federation client) from config.
pub fn build_state(config: &ServerConfig) -> anyhow::Result<Arc<ServerState>> {
    let store = Store::open(config.data_dir.as_deref()).context("failed to open store")?;

    let resolver = Arc::new(Resolver::new(config.federation.port));
    for (domain, addr) in &config.federation.hosts {
        resolver.add_override(domain, *addr);
    }

    let connector = match (&config.federation.ca_path, config.federation.tls) {
        (Some(ca), true) => Some(tls::load_connector(ca)?),
        _ => None,
    };

    Ok(ServerState::new(
        &config.domain,
        store,
        resolver,
        config.federation_timeout(),
        connector,
    ))
}

pub async fn run(config: ServerConfig, shutdown: CancellationToken) -> anyhow::Result<()> {
    let state = build_state(&config)?;
    let acceptor = match &config.tls {
        Some(t) => {
            certs::ensure_self_signed(&t.cert_path, &t.key_path, &config.domain)?;
            Some(tls::load_acceptor(&t.cert_path, &t.key_path)?)
        }
        None => None,
    };

    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    info!(
        domain = %config.domain,
        addr = %listener.local_addr()?,
        tls = acceptor.is_some(),
        "motmot server started"
    );

    serve(listener, state, acceptor, shutdown).await
}

/// Accept loop. Every accepted socket becomes a [`Connection`] on the
/// new-connections channel; a watcher task attaches a dispatcher to each.
pub async fn serve(
    listener: TcpListener,
    state: Arc<ServerState>,
    acceptor: Option<TlsAcceptor>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let (new_conns, rx) = mpsc::unbounded_channel::<Connection>();
    tokio::spawn(dispatch::watch_new_connections(rx, state));

    loop {
        let (stream, addr) = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("shutting down accept loop");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!("accept error: {e}");
                    continue;
                }
            },
        };
        stream.set_nodelay(true).ok();

        match &acceptor {
            None => {
                let _ = new_conns.send(Connection::open(stream, addr));
            }
            Some(acceptor) => {
                // The TLS handshake runs off the accept loop.
                let acceptor = acceptor.clone();
                let new_conns = new_conns.clone();
                tokio::spawn(async move {
                    match acceptor.accept(stream).await {
                        Ok(tls_stream) => {
                            let _ = new_conns.send(Connection::open(tls_stream, addr));
                        }
                        Err(e) => warn!(peer = %addr, err = %e, "tls handshake failed"),
                    }
                });
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TlsConfig;
    use tempfile::TempDir;

    #[tokio::test]
    async fn run_generates_missing_tls_pair() {
        let dir = TempDir::new().unwrap();
        let mut config = ServerConfig::new("a.test");
        config.listen = "127.0.0.1:0".parse().unwrap();
        config.tls = Some(TlsConfig {
            cert_path: dir.path().join("motmot.crt"),
            key_path: dir.path().join("motmot.key"),
        });

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        run(config, shutdown).await.unwrap();

        assert!(dir.path().join("motmot.crt").exists());
        assert!(dir.path().join("motmot.key").exists());
    }
}
