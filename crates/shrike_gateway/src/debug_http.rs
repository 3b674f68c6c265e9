//! Debug HTTP endpoint.
//!
//! Serves lightweight JSON on:
//! - `GET /debug/balancer` — current balancer allocations, or the plain
//!   text `not enabled` when the balancer is off
//! - `GET /debug/gateway`  — status-aggregator snapshot
//!
//! Uses raw TCP + tokio to avoid adding an HTTP framework dependency.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use crate::gateway::TabletGateway;

/// Run the debug server on `addr` until the `shutdown` future resolves.
pub async fn run_debug_server(
    addr: &str,
    gateway: Arc<TabletGateway>,
    shutdown: impl std::future::Future<Output = ()>,
) {
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => {
            tracing::info!("gateway debug server listening on {}", addr);
            l
        }
        Err(e) => {
            tracing::error!("failed to bind gateway debug server on {}: {}", addr, e);
            return;
        }
    };

    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let gateway = gateway.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_debug_request(stream, &gateway).await {
                                tracing::debug!("debug request error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::debug!("debug server accept error: {}", e);
                    }
                }
            }
            _ = &mut shutdown => {
                tracing::info!("gateway debug server shutting down");
                break;
            }
        }
    }
}

async fn handle_debug_request(
    mut stream: tokio::net::TcpStream,
    gateway: &TabletGateway,
) -> std::io::Result<()> {
    let mut buf = [0u8; 1024];
    let n = stream.read(&mut buf).await?;
    if n == 0 {
        return Ok(());
    }

    let request = String::from_utf8_lossy(&buf[..n]);
    let path = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/");

    let (status, content_type, body) = route(gateway, path);
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        content_type,
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await
}

fn route(gateway: &TabletGateway, path: &str) -> (&'static str, &'static str, String) {
    match path {
        "/debug/balancer" => match gateway.balancer_snapshot() {
            Some(snapshot) => match serde_json::to_string_pretty(&snapshot) {
                Ok(body) => ("200 OK", "application/json", body),
                Err(e) => (
                    "500 Internal Server Error",
                    "text/plain",
                    format!("serialization error: {}", e),
                ),
            },
            None => ("200 OK", "text/plain", "not enabled".to_string()),
        },
        "/debug/gateway" => match serde_json::to_string_pretty(&gateway.cache_status()) {
            Ok(body) => ("200 OK", "application/json", body),
            Err(e) => (
                "500 Internal Server Error",
                "text/plain",
                format!("serialization error: {}", e),
            ),
        },
        _ => ("404 Not Found", "text/plain", "not found".to_string()),
    }
}
