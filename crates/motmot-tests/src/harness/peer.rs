use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use motmot::codec::MessageCodec;
use motmot::protocol::{Message, Opcode, Request};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerMode {
    /// Accept server authentication and answer every request successfully.
    Cooperative,
    /// Accept connections and never reply.
    Silent,
}

/// A scripted stand-in for a remote domain that records what it was sent.
pub struct FakePeer {
    pub addr: SocketAddr,
    received: Arc<Mutex<Vec<Request>>>,
    task: tokio::task::JoinHandle<()>,
}

impl FakePeer {
    pub async fn spawn(mode: PeerMode) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let received = Arc::new(Mutex::new(Vec::new()));

        let log = received.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_one(stream, mode, log.clone()));
            }
        });

        Ok(Self {
            addr,
            received,
            task,
        })
    }

    /// Substantive requests received so far, handshakes excluded.
    pub fn requests(&self) -> Vec<Request> {
        self.received.lock().unwrap().clone()
    }

    pub fn count(&self, opcode: Opcode) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.opcode() == opcode)
            .count()
    }
}

impl Drop for FakePeer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_one(stream: TcpStream, mode: PeerMode, log: Arc<Mutex<Vec<Request>>>) {
    let mut framed = Framed::new(stream, MessageCodec::new());
    while let Some(Ok(value)) = framed.next().await {
        let Ok(req) = Request::parse(value) else {
            continue;
        };
        if !matches!(req, Request::AuthenticateServer { .. }) {
            log.lock().unwrap().push(req.clone());
        }
        if mode == PeerMode::Silent {
            // Hold the socket open without answering.
            continue;
        }
        let reply = match &req {
            Request::AuthenticateServer { .. } => Message::authenticated(),
            Request::ServerGetStatus { .. } => Message::status_list(Opcode::ServerGetStatusResp, &[]),
            Request::ServerSendFriend { local, .. }
            | Request::ServerSendUnfriend { local, .. }
            | Request::ServerSendAccept { local, .. } => Message::success("OK", local.as_str()),
            Request::ServerSendStatusChanged { user, .. } => {
                Message::success("Status Delivered", user.as_str())
            }
            _ => Message::access_denied(),
        };
        if framed.send(reply).await.is_err() {
            break;
        }
    }
}
