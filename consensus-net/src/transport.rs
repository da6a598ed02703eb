//! TCP transport for consensus envelopes.
//!
//! ## Wire format
//!
//! ```text
//! [4 bytes: payload length (u32-le)] [N bytes: bincode SignedEnvelope]
//! ```
//!
//! The listener reads the header, checks the length against
//! `max_message_size`, reads exactly that many bytes and hands the decoded
//! envelope to the router. Signatures are checked by the router, not here.

use {
    crate::{
        cache::Cache,
        config::ConsensusNetConfig,
        error::{ConsensusNetError, Result},
        message::SignedEnvelope,
    },
    log::{debug, error, info, warn},
    std::{net::SocketAddr, sync::Arc},
    tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
        sync::mpsc,
    },
};

/// A received envelope together with the address it came from.
#[derive(Debug)]
pub struct InboundEnvelope {
    pub envelope: SignedEnvelope,
    pub from: SocketAddr,
}

/// Returned by [`TransportListener::start`].
pub struct TransportHandle {
    /// Every decoded inbound envelope.
    pub inbound_rx: mpsc::Receiver<InboundEnvelope>,
    /// The bound address (useful when port = 0).
    pub local_addr: SocketAddr,
}

/// Accepts inbound TCP connections and decodes envelopes.
pub struct TransportListener {
    config: ConsensusNetConfig,
    cache: Arc<Cache>,
}

impl TransportListener {
    pub fn new(config: ConsensusNetConfig, cache: Arc<Cache>) -> Self {
        Self { config, cache }
    }

    /// Bind and start accepting connections. Spawns a task per connection.
    pub async fn start(self) -> Result<TransportHandle> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        info!("consensus transport listening on {}", local_addr);

        let (tx, rx) = mpsc::channel::<InboundEnvelope>(self.config.channel_buffer_size);
        let max_msg = self.config.max_message_size;
        let window = self.config.rate_limit_interval_secs;
        let max_connections = self.config.max_events_per_interval;
        let cache = self.cache;

        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        let hits = cache.insert_inbound_connection(addr.ip(), window);
                        if hits > max_connections {
                            warn!("too many connections from {} ({hits}), refusing", addr.ip());
                            continue;
                        }
                        debug!("accepted consensus connection from {}", addr);
                        tokio::spawn(Self::handle_connection(stream, addr, tx.clone(), max_msg));
                    }
                    Err(e) => {
                        error!("accept error: {}", e);
                    }
                }
            }
        });

        Ok(TransportHandle {
            inbound_rx: rx,
            local_addr,
        })
    }

    /// Read length-prefixed envelopes from `stream` until EOF or error.
    async fn handle_connection(
        mut stream: TcpStream,
        addr: SocketAddr,
        tx: mpsc::Sender<InboundEnvelope>,
        max_message_size: usize,
    ) {
        let mut header_buf = [0u8; 4];

        loop {
            if let Err(e) = stream.read_exact(&mut header_buf).await {
                if e.kind() != std::io::ErrorKind::UnexpectedEof {
                    warn!("header read error from {}: {}", addr, e);
                }
                break;
            }

            let len = SignedEnvelope::read_frame_len(&header_buf);
            if len > max_message_size {
                warn!(
                    "peer {} sent oversized frame ({} > {}), dropping connection",
                    addr, len, max_message_size
                );
                break;
            }

            let mut payload = vec![0u8; len];
            if let Err(e) = stream.read_exact(&mut payload).await {
                warn!("payload read error from {}: {}", addr, e);
                break;
            }

            match SignedEnvelope::deserialize(&payload) {
                Ok(envelope) => {
                    debug!(
                        "received {} from {} ({})",
                        envelope.message.kind(),
                        envelope.sender,
                        addr
                    );
                    if tx.send(InboundEnvelope { envelope, from: addr }).await.is_err() {
                        info!("inbound channel closed, stopping reader for {}", addr);
                        break;
                    }
                }
                Err(e) => {
                    // Framing is intact, so the stream can continue.
                    warn!("undecodable envelope from {}: {}", addr, e);
                }
            }
        }

        debug!("connection to {} closed", addr);
    }
}

/// Send one framed envelope to `addr` over a new connection.
pub async fn send_envelope(
    addr: SocketAddr,
    envelope: &SignedEnvelope,
    max_message_size: usize,
) -> Result<()> {
    let frame = envelope.serialize_framed(max_message_size)?;
    write_frame(addr, &frame).await?;
    Ok(())
}

async fn write_frame(addr: SocketAddr, frame: &[u8]) -> std::io::Result<()> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(frame).await?;
    stream.flush().await
}

/// Send an envelope to every address concurrently. Returns the failures.
pub async fn broadcast_envelope(
    addrs: &[SocketAddr],
    envelope: &SignedEnvelope,
    max_message_size: usize,
) -> Vec<(SocketAddr, ConsensusNetError)> {
    let frame = match envelope.serialize_framed(max_message_size) {
        Ok(frame) => Arc::new(frame),
        Err(e) => {
            error!("cannot frame {}: {e}", envelope.message.kind());
            return addrs
                .iter()
                .map(|addr| {
                    let reason = std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string());
                    (*addr, ConsensusNetError::Transport(reason))
                })
                .collect();
        }
    };

    let mut handles = Vec::with_capacity(addrs.len());
    for &addr in addrs {
        let frame = frame.clone();
        handles.push(tokio::spawn(async move {
            (addr, write_frame(addr, &frame).await)
        }));
    }

    let mut failures = Vec::new();
    for handle in handles {
        if let Ok((addr, Err(e))) = handle.await {
            failures.push((addr, ConsensusNetError::Transport(e)));
        }
    }
    failures
}
