//! Health and metrics endpoints for Kubernetes probes and Prometheus

use prometheus::{Encoder, TextEncoder};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

/// Health status for the agent
#[derive(Clone)]
pub struct HealthStatus {
    /// Is the agent ready to serve traffic?
    ready: Arc<AtomicBool>,
    /// Is the agent alive?
    alive: Arc<AtomicBool>,
}

impl HealthStatus {
    /// Create a new health status
    pub fn new() -> Self {
        Self {
            ready: Arc::new(AtomicBool::new(false)),
            alive: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Mark the agent as ready
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Check if the agent is ready
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Check if the agent is alive
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Serves `/metrics`, `/healthz`, and `/readyz` over plain HTTP.
pub struct MetricsServer {
    addr: SocketAddr,
    status: HealthStatus,
}

impl MetricsServer {
    pub fn new(addr: SocketAddr, status: HealthStatus) -> Self {
        Self { addr, status }
    }

    /// Run the server
    pub async fn run(&self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.addr).await?;

        info!("Metrics server listening on http://{}", self.addr);

        loop {
            let (socket, peer) = listener.accept().await?;
            let status = self.status.clone();

            tokio::spawn(async move {
                if let Err(e) = serve_connection(socket, status).await {
                    debug!("Request from {} failed: {}", peer, e);
                }
            });
        }
    }
}

/// One plain-text HTTP reply.
struct Reply {
    code: u16,
    reason: &'static str,
    body: String,
}

impl Reply {
    fn ok(body: impl Into<String>) -> Self {
        Self {
            code: 200,
            reason: "OK",
            body: body.into(),
        }
    }

    fn unavailable(body: impl Into<String>) -> Self {
        Self {
            code: 503,
            reason: "Service Unavailable",
            body: body.into(),
        }
    }

    fn not_found() -> Self {
        Self {
            code: 404,
            reason: "Not Found",
            body: "no such endpoint\n".to_string(),
        }
    }

    fn into_http(self) -> String {
        format!(
            "HTTP/1.1 {} {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            self.code,
            self.reason,
            self.body.len(),
            self.body
        )
    }
}

async fn serve_connection(socket: TcpStream, status: HealthStatus) -> anyhow::Result<()> {
    let mut buf = [0u8; 1024];

    socket.readable().await?;
    let read = socket.try_read(&mut buf)?;
    if read == 0 {
        return Ok(());
    }

    let request = String::from_utf8_lossy(&buf[..read]);
    let path = request_path(&request);
    debug!(path, "serving metrics endpoint request");

    let reply = match path {
        "/metrics" => match render_metrics() {
            Ok(exposition) => Reply::ok(exposition),
            Err(e) => Reply::unavailable(format!("metrics encoding failed: {e}\n")),
        },
        "/healthz" | "/livez" => probe("alive", status.is_alive()),
        "/readyz" => probe("ready", status.is_ready()),
        _ => Reply::not_found(),
    };

    socket.try_write(reply.into_http().as_bytes())?;
    Ok(())
}

/// The path component of the request line; anything unreadable maps to "/".
fn request_path(request: &str) -> &str {
    request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/")
}

/// Render every registered metric in the Prometheus text exposition format.
fn render_metrics() -> prometheus::Result<String> {
    let mut exposition = Vec::new();
    TextEncoder::new().encode(&prometheus::gather(), &mut exposition)?;
    Ok(String::from_utf8_lossy(&exposition).into_owned())
}

fn probe(what: &str, healthy: bool) -> Reply {
    if healthy {
        Reply::ok(format!("{what}\n"))
    } else {
        Reply::unavailable(format!("not {what}\n"))
    }
}
