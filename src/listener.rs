// ABOUTME: TCP listener — binds the configured port, accepts connections, spawns one task each
// ABOUTME: Owns the process-wide, read-mostly services and clones them (via Arc) into each task

use crate::auth::CredentialChecker;
use crate::config::DialtoneConfig;
use crate::connection::{ConnectionDriver, Transport};
use crate::dispatcher::{TokenDispatcher, TokenHandlerRegistry};
use crate::keyword::KeywordRegistry;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// The server listener (§2 component 10, §4.11). Owns the bound socket and
/// the process-wide services every connection task needs a clone of.
pub struct Listener {
    tcp: TcpListener,
    config: DialtoneConfig,
    keywords: Arc<KeywordRegistry>,
    credentials: Arc<dyn CredentialChecker>,
    delegated: Arc<TokenHandlerRegistry>,
    allow_guests: bool,
    next_session_id: AtomicU64,
}

impl Listener {
    pub async fn bind(
        config: DialtoneConfig,
        keywords: Arc<KeywordRegistry>,
        credentials: Arc<dyn CredentialChecker>,
        delegated: Arc<TokenHandlerRegistry>,
        allow_guests: bool,
    ) -> std::io::Result<Self> {
        let addr = SocketAddr::new(config.bind_address, config.server_port);
        let tcp = TcpListener::bind(addr).await?;
        info!(%addr, "dialtone listening");
        Ok(Listener {
            tcp,
            config,
            keywords,
            credentials,
            delegated,
            allow_guests,
            next_session_id: AtomicU64::new(1),
        })
    }

    /// Accepts connections until `shutdown` resolves, draining in-flight
    /// connections on their own as each completes (they are independent
    /// tokio tasks, not tracked here — matches §5: the listener and timers
    /// are separate workers from per-connection state).
    pub async fn run(self, shutdown: impl std::future::Future<Output = ()>) {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = self.tcp.accept() => {
                    match accepted {
                        Ok((socket, peer)) => self.spawn_connection(socket, peer),
                        Err(err) => {
                            warn!(error = %err, "failed to accept connection");
                        }
                    }
                }
                _ = &mut shutdown => {
                    info!("shutdown signal received; no longer accepting connections");
                    break;
                }
            }
        }
    }

    fn spawn_connection(&self, socket: tokio::net::TcpStream, peer: SocketAddr) {
        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let burst_cap = 4;
        let dispatcher = TokenDispatcher::new(
            Arc::clone(&self.keywords),
            Arc::clone(&self.credentials),
            Arc::clone(&self.delegated),
            self.allow_guests,
        );
        let transport = Transport::new(socket);
        let packet_delay = std::time::Duration::from_millis(self.config.packet_delay_ms);
        let driver = ConnectionDriver::with_packet_delay(transport, session_id, burst_cap, dispatcher, packet_delay);

        tokio::spawn(async move {
            info!(%peer, session_id, "connection accepted");
            driver.run().await;
            info!(%peer, session_id, "connection closed");
        });
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.tcp.local_addr()
    }

    pub fn config(&self) -> &DialtoneConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticCredentialChecker;
    use crate::frame;
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn accepts_a_connection_and_completes_the_init_handshake() {
        let mut config = DialtoneConfig::default();
        config.server_port = 0;
        config.bind_address = "127.0.0.1".parse().unwrap();

        let listener = Listener::bind(
            config,
            Arc::new(KeywordRegistry::new()),
            Arc::new(StaticCredentialChecker::new()),
            Arc::new(TokenHandlerRegistry::new()),
            false,
        )
        .await
        .unwrap();
        let addr = listener.local_addr().unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(listener.run(async {
            let _ = rx.await;
        }));

        let mut client = TcpStream::connect(addr).await.unwrap();
        let init = frame::build_control_frame(0x10, 0x10, crate::connection::state::control_type::INIT);
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        client.write_all(&init).await.unwrap();

        let mut buf = [0u8; 64];
        let n = client.read(&mut buf).await.unwrap();
        let ack = frame::parse(&buf[..n]).unwrap();
        assert_eq!(ack.frame_type(), crate::connection::state::control_type::INIT_ACK);

        let _ = tx.send(());
        server.abort();
    }
}
