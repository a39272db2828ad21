use crate::codec::MessageCodec;
use crate::protocol::{Message, Request};
use anyhow::{Context, Result, bail};
use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

/// Plain-TCP client for a motmot domain server.
///
/// Replies and pushes share one stream. [`call`](Self::call) returns the
/// next non-push message and queues any pushes that arrive first so
/// [`next_push`](Self::next_push) can still observe them.
pub struct Client {
    framed: Framed<TcpStream, MessageCodec>,
    pushes: VecDeque<Message>,
}

impl Client {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to connect to {addr}"))?;
        Ok(Self {
            framed: Framed::new(stream, MessageCodec::new()),
            pushes: VecDeque::new(),
        })
    }

    pub async fn send(&mut self, msg: Message) -> Result<()> {
        self.framed.send(msg).await?;
        Ok(())
    }

    pub async fn send_request(&mut self, req: &Request) -> Result<()> {
        self.send(req.to_message()).await
    }

    /// Read the next message off the wire, push or reply.
    pub async fn next_message(&mut self) -> Result<Message> {
        let Some(value) = self.framed.next().await else {
            bail!("server disconnected");
        };
        Ok(Message::try_from(value?)?)
    }

    /// Next message that is not a push.
    pub async fn next_reply(&mut self) -> Result<Message> {
        loop {
            let msg = self.next_message().await?;
            if msg.is_push() {
                self.pushes.push_back(msg);
                continue;
            }
            return Ok(msg);
        }
    }

    /// Send a request and wait for its reply.
    ///
    /// Only correct when one request is outstanding; with several in flight
    /// replies may arrive in any order.
    pub async fn call(&mut self, req: &Request) -> Result<Message> {
        self.send_request(req).await?;
        self.next_reply().await
    }

    /// Next push, waiting at most `timeout`. Replies read while waiting are
    /// discarded.
    pub async fn next_push(&mut self, timeout: Duration) -> Result<Option<Message>> {
        if let Some(push) = self.pushes.pop_front() {
            return Ok(Some(push));
        }
        let wait = async {
            loop {
                let msg = self.next_message().await?;
                if msg.is_push() {
                    return Ok::<_, anyhow::Error>(msg);
                }
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(push) => Ok(Some(push?)),
            Err(_) => Ok(None),
        }
    }
}
