use crate::connection::Transport;
use futures_util::{SinkExt, StreamExt};
use motmot::codec::{CodecError, MessageCodec};
use motmot::protocol::{Message, Opcode, Request};
use rustls::pki_types::ServerName;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::codec::Framed;

#[derive(Error, Debug)]
pub enum FederationError {
    #[error("failed to resolve {domain}: {source}")]
    Resolve {
        domain: String,
        source: std::io::Error,
    },

    #[error("{0} did not resolve to any address")]
    NoAddress(String),

    #[error("failed to connect to {domain}: {source}")]
    Connect {
        domain: String,
        source: std::io::Error,
    },

    #[error("tls handshake with {domain} failed: {reason}")]
    Tls { domain: String, reason: String },

    #[error("{domain} rejected our server authentication")]
    Rejected { domain: String },

    #[error("unexpected reply from {domain}: {reply}")]
    UnexpectedReply { domain: String, reply: String },

    #[error("{0} closed the connection before replying")]
    Closed(String),

    #[error("federation call to {0} timed out")]
    Timeout(String),

    #[error("wire error talking to {domain}: {source}")]
    Codec { domain: String, source: CodecError },

    #[error("federation failed for: {}", .0.join(", "))]
    Domains(Vec<String>),
}

/// Maps a domain to the addresses its server listens on.
///
/// Static overrides are consulted before DNS.
pub struct Resolver {
    overrides: RwLock<HashMap<String, SocketAddr>>,
    port: u16,
}

impl Resolver {
    pub fn new(port: u16) -> Self {
        Self {
            overrides: RwLock::new(HashMap::new()),
            port,
        }
    }

    pub fn add_override(&self, domain: &str, addr: SocketAddr) {
        self.overrides
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(domain.to_ascii_lowercase(), addr);
    }

    pub async fn resolve(&self, domain: &str) -> Result<Vec<SocketAddr>, FederationError> {
        let pinned = self
            .overrides
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&domain.to_ascii_lowercase())
            .copied();
        if let Some(addr) = pinned {
            return Ok(vec![addr]);
        }

        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((domain, self.port))
            .await
            .map_err(|source| FederationError::Resolve {
                domain: domain.to_string(),
                source,
            })?
            .collect();
        if addrs.is_empty() {
            return Err(FederationError::NoAddress(domain.to_string()));
        }
        Ok(addrs)
    }

    /// True when `domain` resolves to `peer`. IPv4-mapped IPv6 addresses
    /// compare equal to their IPv4 form.
    pub async fn verify_peer(&self, domain: &str, peer: IpAddr) -> Result<bool, FederationError> {
        let peer = peer.to_canonical();
        let addrs = self.resolve(domain).await?;
        Ok(addrs.iter().any(|a| a.ip().to_canonical() == peer))
    }
}

/// One outbound server-to-server exchange: connect, authenticate, one
/// request, close.
pub struct FederationSession {
    domain: String,
    framed: Framed<Box<dyn Transport>, MessageCodec>,
}

impl FederationSession {
    pub async fn connect(
        domain: &str,
        resolver: &Resolver,
        tls: Option<&TlsConnector>,
    ) -> Result<Self, FederationError> {
        let addrs = resolver.resolve(domain).await?;
        let stream = TcpStream::connect(&addrs[..])
            .await
            .map_err(|source| FederationError::Connect {
                domain: domain.to_string(),
                source,
            })?;
        stream.set_nodelay(true).ok();

        let transport: Box<dyn Transport> = match tls {
            Some(connector) => {
                let name = ServerName::try_from(domain.to_string()).map_err(|e| {
                    FederationError::Tls {
                        domain: domain.to_string(),
                        reason: e.to_string(),
                    }
                })?;
                let stream = connector.connect(name, stream).await.map_err(|e| {
                    FederationError::Tls {
                        domain: domain.to_string(),
                        reason: e.to_string(),
                    }
                })?;
                Box::new(stream)
            }
            None => Box::new(stream),
        };

        Ok(Self {
            domain: domain.to_string(),
            framed: Framed::new(transport, MessageCodec::new()),
        })
    }

    /// Send `[AUTHENTICATE_SERVER, local_domain]` and require AUTHENTICATED.
    pub async fn handshake(&mut self, local_domain: &str) -> Result<(), FederationError> {
        let hello = Request::AuthenticateServer {
            domain: local_domain.to_string(),
        };
        let reply = self.round_trip(hello.to_message()).await?;
        match reply.opcode() {
            Some(Opcode::Authenticated) => Ok(()),
            Some(Opcode::AuthFailed) | Some(Opcode::AccessDenied) => Err(FederationError::Rejected {
                domain: self.domain.clone(),
            }),
            _ => Err(self.unexpected(&reply)),
        }
    }

    /// Send one request and require a reply carrying `expect`.
    pub async fn request(
        &mut self,
        req: &Request,
        expect: Opcode,
    ) -> Result<Message, FederationError> {
        let reply = self.round_trip(req.to_message()).await?;
        if reply.opcode() == Some(expect) {
            Ok(reply)
        } else {
            Err(self.unexpected(&reply))
        }
    }

    pub async fn close(mut self) {
        let _ = self.framed.close().await;
    }

    async fn round_trip(&mut self, msg: Message) -> Result<Message, FederationError> {
        self.framed.send(msg).await.map_err(|e| self.codec(e))?;
        loop {
            let value = match self.framed.next().await {
                Some(Ok(value)) => value,
                Some(Err(e)) => return Err(self.codec(e)),
                None => return Err(FederationError::Closed(self.domain.clone())),
            };
            let reply = Message::try_from(value).map_err(|e| FederationError::UnexpectedReply {
                domain: self.domain.clone(),
                reply: e.to_string(),
            })?;
            // Server sessions never receive pushes, but skip any rather than
            // mistaking one for the reply.
            if !reply.is_push() {
                return Ok(reply);
            }
        }
    }

    fn codec(&self, source: CodecError) -> FederationError {
        FederationError::Codec {
            domain: self.domain.clone(),
            source,
        }
    }

    fn unexpected(&self, reply: &Message) -> FederationError {
        FederationError::UnexpectedReply {
            domain: self.domain.clone(),
            reply: reply.to_string(),
        }
    }
}

/// Issues one-shot federation calls on behalf of the local domain.
pub struct FederationClient {
    local_domain: String,
    resolver: Arc<Resolver>,
    timeout: Duration,
    tls: Option<TlsConnector>,
}

impl FederationClient {
    pub fn new(
        local_domain: &str,
        resolver: Arc<Resolver>,
        timeout: Duration,
        tls: Option<TlsConnector>,
    ) -> Self {
        Self {
            local_domain: local_domain.to_string(),
            resolver,
            timeout,
            tls,
        }
    }

    /// Connect to `domain`, authenticate, send `req`, and return its reply.
    /// The session is closed on every path.
    pub async fn call(
        &self,
        domain: &str,
        req: Request,
        expect: Opcode,
    ) -> Result<Message, FederationError> {
        let exchange = async {
            let mut session =
                FederationSession::connect(domain, &self.resolver, self.tls.as_ref()).await?;
            let result = match session.handshake(&self.local_domain).await {
                Ok(()) => session.request(&req, expect).await,
                Err(e) => Err(e),
            };
            session.close().await;
            result
        };

        let result = match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(FederationError::Timeout(domain.to_string())),
        };
        match &result {
            Ok(_) => tracing::debug!(%domain, opcode = %req.opcode(), "federation call ok"),
            Err(e) => tracing::warn!(%domain, opcode = %req.opcode(), err = %e, "federation call failed"),
        }
        result
    }
}
