//! Server side of the stage protocol.
//!
//! Each accepted connection gets its own task. Requests on one connection
//! are handled strictly in order; connections run concurrently.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use layermesh_types::{Request, Response};

use crate::codec::{decode, read_frame, write_message};
use crate::error::{NetError, Result};

/// Node-side dispatch for every protocol operation.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, request: Request) -> Response;
}

/// Accept connections until `shutdown` resolves.
pub async fn serve<H, F>(
    listener: TcpListener,
    handler: Arc<H>,
    max_frame_bytes: usize,
    shutdown: F,
) -> Result<()>
where
    H: RequestHandler + ?Sized,
    F: Future<Output = ()> + Send,
{
    let local = listener.local_addr()?;
    info!(addr = %local, "stage server listening");
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    handle_connection(stream, peer, handler, max_frame_bytes).await;
                });
            }
            _ = &mut shutdown => {
                info!(addr = %local, "stage server shutting down");
                return Ok(());
            }
        }
    }
}

async fn handle_connection<H>(mut stream: TcpStream, peer: SocketAddr, handler: Arc<H>, max_frame_bytes: usize)
where
    H: RequestHandler + ?Sized,
{
    let _ = stream.set_nodelay(true);
    loop {
        let frame = match read_frame(&mut stream, max_frame_bytes).await {
            Ok(frame) => frame,
            Err(NetError::Closed) => break,
            Err(e @ NetError::FrameTooLarge { .. }) => {
                // The stream can no longer be resynchronised.
                warn!(%peer, error = %e, "dropping connection");
                let _ = write_message(&mut stream, &Response::error(e.to_string())).await;
                break;
            }
            Err(e) => {
                debug!(%peer, error = %e, "connection read failed");
                break;
            }
        };

        let response = match decode::<Request>(&frame) {
            Ok(request) => {
                debug!(%peer, op = request.name(), "request");
                handler.handle(request).await
            }
            Err(e) => {
                warn!(%peer, error = %e, "malformed request");
                Response::error(format!("malformed request: {e}"))
            }
        };

        if let Err(e) = write_message(&mut stream, &response).await {
            debug!(%peer, error = %e, "connection write failed");
            break;
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::StageClient;
    use crate::codec::{read_message, write_frame};
    use layermesh_types::config::NetConfig;
    use layermesh_types::protocol::PingResponse;

    struct Echo;

    #[async_trait]
    impl RequestHandler for Echo {
        async fn handle(&self, request: Request) -> Response {
            match request {
                Request::Ping(p) => Response::Ping(PingResponse {
                    message: format!("echo: {}", p.message),
                    timestamp: "now".into(),
                    node_version: "test".into(),
                }),
                other => Response::error(format!("unsupported: {}", other.name())),
            }
        }
    }

    async fn start() -> (String, tokio::sync::oneshot::Sender<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(serve(listener, Arc::new(Echo), 1 << 20, async move {
            let _ = rx.await;
        }));
        (addr, tx)
    }

    #[tokio::test]
    async fn ping_round_trip() {
        let (addr, _stop) = start().await;
        let client = StageClient::new(addr, NetConfig::default());
        let pong = client.ping("hello").await.unwrap();
        assert_eq!(pong.message, "echo: hello");
    }

    #[tokio::test]
    async fn unsupported_request_is_remote_error() {
        let (addr, _stop) = start().await;
        let client = StageClient::new(addr, NetConfig::default());
        let err = client.health().await.unwrap_err();
        assert!(matches!(err, NetError::Remote(m) if m.contains("health")));
    }

    #[tokio::test]
    async fn malformed_frame_gets_error_and_connection_survives() {
        let (addr, _stop) = start().await;
        let mut stream = TcpStream::connect(&addr).await.unwrap();

        write_frame(&mut stream, &[0xFF, 0xFF, 0xFF]).await.unwrap();
        let resp: Response = read_message(&mut stream, 1 << 20).await.unwrap();
        assert!(matches!(resp, Response::Error { .. }));

        let ping = Request::Ping(layermesh_types::protocol::PingRequest { message: "again".into() });
        write_message(&mut stream, &ping).await.unwrap();
        let resp: Response = read_message(&mut stream, 1 << 20).await.unwrap();
        assert!(matches!(resp, Response::Ping(_)));
    }

    #[tokio::test]
    async fn shutdown_stops_accepting() {
        let (addr, stop) = start().await;
        stop.send(()).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let client = StageClient::new(
            addr,
            NetConfig {
                max_retries: 0,
                ..NetConfig::default()
            },
        );
        assert!(client.ping("x").await.is_err());
    }
}
