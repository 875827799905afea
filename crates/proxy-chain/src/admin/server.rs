//! Admin endpoint server.

use crate::admin::router::{route_request, AdminState};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

pub struct AdminServer {
    listener: TcpListener,
    state: AdminState,
}

impl AdminServer {
    pub async fn bind(addr: SocketAddr, state: AdminState) -> Result<Self, anyhow::Error> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind admin endpoint on {addr}: {e}"))?;
        Ok(Self { listener, state })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until the task is dropped.
    pub async fn run(self) -> Result<(), anyhow::Error> {
        if let Ok(addr) = self.listener.local_addr() {
            info!("Admin endpoint listening on http://{}", addr);
        }

        loop {
            let (stream, _) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Admin accept error: {}", e);
                    continue;
                }
            };
            let io = TokioIo::new(stream);
            let state = self.state.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req| route_request(req, state.clone()));

                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    debug!("Admin connection error: {}", e);
                }
            });
        }
    }
}
