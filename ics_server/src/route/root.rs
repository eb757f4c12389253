use std::net::SocketAddr;

use axum::extract::ConnectInfo;
use tracing::info;

pub async fn handler(peer: Option<ConnectInfo<SocketAddr>>) -> &'static str {
    info!(ip = ?peer.map(|ConnectInfo(addr)| addr.ip()), "welcome");
    "Welcome to the Tidbyt ICS Server!"
}
