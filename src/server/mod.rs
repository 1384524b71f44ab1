use crate::correlator::{CallCorrelator, CorrelatorOutcome};
use crate::hep;
use crate::identity::IdentityResolver;
use crate::metrics;
use anyhow::{anyhow, Result};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};


/// Largest HEP packet accepted in a single datagram or read.
pub const MAX_PACKET_SIZE: usize = 65535;

/// Decodes one captured packet and feeds it through identity resolution and
/// call correlation.
pub struct PacketHandler {
    resolver: IdentityResolver,
    correlator: CallCorrelator,
}

pub type PacketHandlerRef = Arc<PacketHandler>;

impl PacketHandler {
    pub fn new(resolver: IdentityResolver, correlator: CallCorrelator) -> Self {
        Self {
            resolver,
            correlator,
        }
    }

    /// Returns `None` when the packet was dropped.
    pub async fn handle(&self, peer: SocketAddr, data: Bytes) -> Option<CorrelatorOutcome> {
        debug!(%peer, len = data.len(), "received packet");
        let msg = match hep::decode_message(&data) {
            Ok(msg) => msg,
            Err(e) => {
                metrics::ingest::decode_error();
                warn!(%peer, "unable to decode the HEP packet: {}", e);
                return None;
            }
        };
        let method = msg
            .method
            .as_ref()
            .map(|m| m.to_string())
            .unwrap_or_default();
        debug!(call_id = %msg.call_id, %method, cseq = %msg.cseq, "sip message");

        let identity = self.resolver.resolve(&msg);
        match self.correlator.process(&msg, &identity).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                error!(call_id = %msg.call_id, %method, "{}", e);
                None
            }
        }
    }
}

pub struct ServerBuilder {
    udp_addr: Option<String>,
    tcp_addr: Option<String>,
    handler: Option<PacketHandlerRef>,
    cancel_token: Option<CancellationToken>,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self {
            udp_addr: None,
            tcp_addr: None,
            handler: None,
            cancel_token: None,
        }
    }

    pub fn with_udp_addr(mut self, addr: Option<&str>) -> Self {
        self.udp_addr = addr.map(str::to_string);
        self
    }

    pub fn with_tcp_addr(mut self, addr: Option<&str>) -> Self {
        self.tcp_addr = addr.map(str::to_string);
        self
    }

    pub fn with_handler(mut self, handler: PacketHandlerRef) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }

    /// Binds the configured listeners. At least one of UDP and TCP is
    /// required.
    pub async fn build(self) -> Result<Server> {
        let handler = self
            .handler
            .ok_or_else(|| anyhow!("packet handler is required"))?;
        if self.udp_addr.is_none() && self.tcp_addr.is_none() {
            return Err(anyhow!("no listener configured, set listen_udp or listen_tcp"));
        }

        let udp = match self.udp_addr {
            Some(addr) => Some(
                UdpSocket::bind(&addr)
                    .await
                    .map_err(|e| anyhow!("failed to bind UDP {}: {}", addr, e))?,
            ),
            None => None,
        };
        let tcp = match self.tcp_addr {
            Some(addr) => Some(
                TcpListener::bind(&addr)
                    .await
                    .map_err(|e| anyhow!("failed to bind TCP {}: {}", addr, e))?,
            ),
            None => None,
        };

        Ok(Server {
            udp,
            tcp,
            handler,
            cancel_token: self.cancel_token.unwrap_or_default(),
        })
    }
}

pub struct Server {
    udp: Option<UdpSocket>,
    tcp: Option<TcpListener>,
    handler: PacketHandlerRef,
    cancel_token: CancellationToken,
}

impl Server {
    pub fn udp_local_addr(&self) -> Option<SocketAddr> {
        self.udp.as_ref().and_then(|s| s.local_addr().ok())
    }

    pub fn tcp_local_addr(&self) -> Option<SocketAddr> {
        self.tcp.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Runs the receive loops until the token is cancelled. Packet tasks
    /// already spawned are left to finish on their own.
    pub async fn serve(self) -> Result<()> {
        let Server {
            udp,
            tcp,
            handler,
            cancel_token,
        } = self;

        let udp_loop = {
            let handler = handler.clone();
            async move {
                match udp {
                    Some(socket) => serve_udp(socket, handler).await,
                    None => std::future::pending().await,
                }
            }
        };
        let tcp_loop = {
            let token = cancel_token.clone();
            async move {
                match tcp {
                    Some(listener) => serve_tcp(listener, handler, token).await,
                    None => std::future::pending().await,
                }
            }
        };

        select! {
            r = udp_loop => r,
            r = tcp_loop => r,
            _ = cancel_token.cancelled() => {
                info!("server: shutting down listeners");
                Ok(())
            }
        }
    }
}

async fn serve_udp(socket: UdpSocket, handler: PacketHandlerRef) -> Result<()> {
    if let Ok(addr) = socket.local_addr() {
        info!("listening on udp://{}", addr);
    }
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                warn!("udp receive error: {}", e);
                continue;
            }
        };
        metrics::ingest::packet_received("udp");
        let data = Bytes::copy_from_slice(&buf[..len]);
        let handler = handler.clone();
        tokio::spawn(async move {
            handler.handle(peer, data).await;
        });
    }
}

async fn serve_tcp(
    listener: TcpListener,
    handler: PacketHandlerRef,
    token: CancellationToken,
) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("listening on tcp://{}", addr);
    }
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(r) => r,
            Err(e) => {
                warn!("tcp accept error: {}", e);
                continue;
            }
        };
        debug!(%peer, "tcp connection accepted");
        let handler = handler.clone();
        let token = token.child_token();
        tokio::spawn(async move {
            select! {
                r = serve_connection(stream, peer, handler) => {
                    if let Err(e) = r {
                        warn!(%peer, "tcp connection error: {}", e);
                    }
                }
                _ = token.cancelled() => {}
            }
            debug!(%peer, "tcp connection closed");
        });
    }
}

/// Every read is treated as one HEP packet.
async fn serve_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    handler: PacketHandlerRef,
) -> Result<()> {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    loop {
        let len = stream.read(&mut buf).await?;
        if len == 0 {
            return Ok(());
        }
        metrics::ingest::packet_received("tcp");
        let data = Bytes::copy_from_slice(&buf[..len]);
        let handler = handler.clone();
        tokio::spawn(async move {
            handler.handle(peer, data).await;
        });
    }
}
