use crate::connection::{Connection, ConnectionHandle};
use crate::error::RpcError;
use motmot::protocol::{Message, Request};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;

/// Request handling behind the dispatcher.
pub trait Service: Send + Sync + 'static {
    /// Handle one request. `Ok(None)` sends nothing back.
    fn handle(
        &self,
        conn: ConnectionHandle,
        req: Request,
    ) -> impl Future<Output = Result<Option<Message>, RpcError>> + Send;

    /// Called exactly once, after the read side has ended and every request
    /// from the connection has finished.
    fn disconnected(&self, conn: &ConnectionHandle) -> impl Future<Output = ()> + Send;
}

/// Attach a dispatcher to every connection arriving on `rx`.
pub async fn watch_new_connections<S: Service>(
    mut rx: mpsc::UnboundedReceiver<Connection>,
    service: Arc<S>,
) {
    while let Some(conn) = rx.recv().await {
        tokio::spawn(run(conn, service.clone()));
    }
    tracing::debug!("new-connection channel closed");
}

/// Dispatch loop for one connection.
///
/// Each request runs in its own task, so replies can leave in a different
/// order than requests arrived. A codec error closes the connection; every
/// other failure becomes an error reply.
pub async fn run<S: Service>(mut conn: Connection, service: Arc<S>) {
    let handle = conn.handle().clone();
    let in_flight = TaskTracker::new();

    while let Some(incoming) = conn.receive().await {
        let value = match incoming {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(peer = %handle.addr(), err = %e, "codec error, closing connection");
                handle.close();
                break;
            }
        };

        let req = match Request::parse(value) {
            Ok(req) => req,
            Err(e) => {
                tracing::debug!(peer = %handle.addr(), err = %e, "rejected message");
                handle.send(RpcError::from(e).to_reply());
                continue;
            }
        };

        in_flight.spawn(execute(handle.clone(), req, service.clone()));
    }

    // Requests still running may touch the session; let them settle first.
    in_flight.close();
    in_flight.wait().await;
    service.disconnected(&handle).await;
    handle.mark_closed();
    tracing::debug!(peer = %handle.addr(), "connection closed");
}

async fn execute<S: Service>(conn: ConnectionHandle, req: Request, service: Arc<S>) {
    let opcode = req.opcode();
    let inner_conn = conn.clone();
    // The inner task turns a handler panic into a JoinError instead of
    // taking the reply path down with it.
    let task = tokio::spawn(async move { service.handle(inner_conn, req).await });

    let reply = match task.await {
        Ok(Ok(reply)) => reply,
        Ok(Err(e)) => {
            tracing::debug!(peer = %conn.addr(), %opcode, err = %e, "request failed");
            Some(e.to_reply())
        }
        Err(e) => {
            tracing::error!(peer = %conn.addr(), %opcode, err = %e, "handler task failed");
            Some(RpcError::Internal(e.to_string()).to_reply())
        }
    };

    if let Some(reply) = reply {
        conn.send(reply);
    }
}
