//! Listener acquisition and the per-connection serve loop.
//!
//! Each `listen` bundle gets one [`Server`]: a TCP listener with
//! keep-alive configuration, an optional TLS layer, and the HTTP engine
//! wired to the bundle's [`VirtualHandler`].

pub mod tls;

use hyper::header::{HeaderValue, SERVER};
use hyper::server::conn::Http;
use hyper::service::service_fn;
use hyper::{Body, Request, Response};
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::context::RequestCtx;
use crate::error::{FasthttpdError, FasthttpdResult};
use crate::handler::{EngineError, VirtualHandler};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Returns `tcp6` when the listen string holds two or more colons,
/// `tcp4` otherwise.
pub fn network(listen: &str) -> &'static str {
    if listen.matches(':').count() >= 2 {
        "tcp6"
    } else {
        "tcp4"
    }
}

/// Parses a `[host]:port` listen string into a socket address. An empty
/// host binds the wildcard address of the selected network.
pub fn parse_listen(listen: &str) -> FasthttpdResult<SocketAddr> {
    let (host, port) = listen
        .rsplit_once(':')
        .ok_or_else(|| FasthttpdError::listener(format!("invalid listen address: {}", listen)))?;
    let port: u16 = port
        .parse()
        .map_err(|_| FasthttpdError::listener(format!("invalid listen port: {}", listen)))?;
    if host.is_empty() {
        let ip: IpAddr = if network(listen) == "tcp6" {
            "::".parse().expect("static address")
        } else {
            "0.0.0.0".parse().expect("static address")
        };
        return Ok(SocketAddr::new(ip, port));
    }
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Ok(SocketAddr::new(host.parse()?, port))
}

/// One listener and the virtual-host cores behind it.
pub struct Server {
    listen: String,
    handler: Arc<VirtualHandler>,
    tls: Option<TlsAcceptor>,
    server_name: String,
    tcp_keepalive: bool,
    tcp_keepalive_period: Option<Duration>,
    read_timeout: Option<Duration>,
    read_buffer_size: Option<usize>,
    active: Arc<AtomicUsize>,
}

impl Server {
    pub fn new(listen: &str, cfgs: Vec<Config>) -> FasthttpdResult<Self> {
        let tls = tls::multi_tls_config(&cfgs)?.map(TlsAcceptor::from);
        let handler = Arc::new(VirtualHandler::new(cfgs)?);
        let server = handler.server_config();
        let nanos_duration = |name: &str| {
            server
                .server_nanos(name)
                .filter(|&n| n > 0)
                .map(|n| Duration::from_nanos(n as u64))
        };
        Ok(Self {
            listen: listen.to_string(),
            server_name: server.server_str("name").unwrap_or("").to_string(),
            tcp_keepalive: server.server_bool("tcpKeepalive").unwrap_or(false),
            tcp_keepalive_period: nanos_duration("tcpKeepalivePeriod"),
            read_timeout: nanos_duration("readTimeout"),
            read_buffer_size: server
                .server_int("readBufferSize")
                .filter(|&n| n > 0)
                .map(|n| n as usize),
            handler,
            tls,
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn handler(&self) -> &Arc<VirtualHandler> {
        &self.handler
    }

    /// Acquires the TCP listener for this server's listen address.
    pub async fn bind(&self) -> FasthttpdResult<TcpListener> {
        let addr = parse_listen(&self.listen)?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| FasthttpdError::listener(format!("failed to bind {}: {}", self.listen, e)))?;
        info!(listen = %self.listen, network = network(&self.listen), "listening");
        Ok(listener)
    }

    /// Accepts connections until `shutdown` fires, then drains in-flight
    /// connections.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> FasthttpdResult<()> {
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                accepted = listener.accept() => {
                    let (stream, remote_addr) = match accepted {
                        Ok(conn) => conn,
                        Err(err) => {
                            warn!("failed to accept connection: {}", err);
                            continue;
                        }
                    };
                    self.configure_keepalive(&stream);
                    let local_addr = stream.local_addr().unwrap_or_else(|_| remote_addr);
                    let server = Arc::clone(&self);
                    server.active.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(async move {
                        server.serve_connection(stream, remote_addr, local_addr).await;
                        server.active.fetch_sub(1, Ordering::SeqCst);
                    });
                }
            }
        }
        self.drain().await;
        Ok(())
    }

    /// Sets `SO_KEEPALIVE` (and the configured probe period) on an
    /// accepted connection.
    fn configure_keepalive(&self, stream: &TcpStream) {
        if !self.tcp_keepalive {
            return;
        }
        let sock = socket2::SockRef::from(stream);
        let mut keepalive = socket2::TcpKeepalive::new();
        if let Some(period) = self.tcp_keepalive_period {
            keepalive = keepalive.with_time(period);
        }
        if let Err(err) = sock.set_tcp_keepalive(&keepalive) {
            warn!("failed to set TCP keepalive: {}", err);
        }
    }

    async fn serve_connection(
        &self,
        stream: TcpStream,
        remote_addr: SocketAddr,
        local_addr: SocketAddr,
    ) {
        let request_num = Arc::new(AtomicU64::new(0));
        let handler = Arc::clone(&self.handler);
        let server_name = self.server_name.clone();
        let read_timeout = self.read_timeout;
        let service = service_fn(move |req: Request<Body>| {
            let handler = Arc::clone(&handler);
            let server_name = server_name.clone();
            let conn_request_num = request_num.fetch_add(1, Ordering::Relaxed) + 1;
            async move {
                let mut ctx = RequestCtx::new(req, remote_addr, local_addr, conn_request_num);
                match read_timeout {
                    Some(timeout) => {
                        if tokio::time::timeout(timeout, handler.handle(&mut ctx))
                            .await
                            .is_err()
                        {
                            handler.handle_error(&mut ctx, EngineError::Timeout).await;
                        }
                    }
                    None => handler.handle(&mut ctx).await,
                }
                if !server_name.is_empty() && !ctx.response.headers().contains_key(SERVER) {
                    if let Ok(value) = HeaderValue::from_str(&server_name) {
                        ctx.response.headers_mut().insert(SERVER, value);
                    }
                }
                let response =
                    std::mem::replace(&mut ctx.response, Response::new(Body::empty()));
                Ok::<_, Infallible>(response)
            }
        });

        let mut http = Http::new();
        http.http1_keep_alive(true);
        if let Some(size) = self.read_buffer_size {
            http.max_buf_size(size);
        }

        let served = match &self.tls {
            Some(acceptor) => match acceptor.accept(stream).await {
                Ok(tls_stream) => http.serve_connection(tls_stream, service).await,
                Err(err) => {
                    debug!("TLS handshake failed from {}: {}", remote_addr, err);
                    return;
                }
            },
            None => http.serve_connection(stream, service).await,
        };
        if let Err(err) = served {
            debug!("error serving connection from {}: {}", remote_addr, err);
        }
    }

    /// Waits for in-flight connections to finish, bounded by the drain
    /// timeout.
    async fn drain(&self) {
        let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
        while self.active.load(Ordering::SeqCst) > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    remaining = self.active.load(Ordering::SeqCst),
                    "drain timeout reached, closing"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}
