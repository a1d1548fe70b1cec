// ────────────────────────────────
// src/server/listener.rs
// Low-level TCP bind so TLS can be swapped in later without touching the
// accept loop.
// ────────────────────────────────
use anyhow::{Context, Result};
use std::net::SocketAddr;
use tokio::net::TcpListener;

/// Bind the listen socket. A failure here is a startup configuration error
/// and aborts the process.
pub async fn bind_tcp(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind listen address {}", addr))
}
