//! The request listener: accepts client and peer connections and feeds
//! the dispatcher.

use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use super::wire;
use crate::dispatch::{self, MainHandle};
use crate::system::System;

/// Serve requests on `listener` until it fails.
pub async fn serve(
    sys: Arc<System>,
    main: MainHandle,
    listener: TcpListener,
) -> anyhow::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        debug!(%peer, "connection accepted");
        let sys = Arc::clone(&sys);
        let main = main.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_conn(sys, main, stream).await {
                if e.kind() != std::io::ErrorKind::UnexpectedEof {
                    warn!(%peer, %e, "connection error");
                }
            }
        });
    }
}

async fn handle_conn(
    sys: Arc<System>,
    main: MainHandle,
    mut stream: TcpStream,
) -> std::io::Result<()> {
    let (mut reader, mut writer) = stream.split();
    loop {
        let (req, data) = wire::read_req(&mut reader).await?;
        let (rsp, body) = dispatch::handle_request(&sys, &main, req, data).await;
        wire::write_rsp(&mut writer, &rsp, &body).await?;
    }
}
