//! SSH chain construction.
//!
//! The first hop is a plain TCP dial plus SSH handshake; every later hop
//! runs its SSH handshake over a direct-tcpip channel opened through the
//! previous hop. Host-key verification is intentionally skipped: chains
//! are expected to run inside trusted networks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::keys::PrivateKeyWithHashAlg;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::error::{CoreError, Result};
use crate::store::Bastion;

use super::chain_key;

/// Unified byte stream for tunneled and direct upstream connections.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub connect_timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub keepalive_interval: Duration,
}

impl Default for ChainConfig {
    fn default() -> Self {
        ChainConfig {
            connect_timeout: Duration::from_secs(15),
            max_retries: 3,
            retry_delay: Duration::from_secs(2),
            keepalive_interval: Duration::from_secs(30),
        }
    }
}

/// Accepts any host key.
struct ClientHandler;

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

/// One fully built chain: every hop's client handle, first to last.
/// Tunnels are opened through the last hop; the earlier handles must stay
/// alive because they carry the later hops' transports.
pub struct ChainClient {
    key: String,
    hops: Vec<client::Handle<ClientHandler>>,
}

/// Tunnel-capable view of a chain client. The pool talks to chains
/// through this trait so its bookkeeping can be exercised without a
/// live SSH server.
#[async_trait]
pub trait ChainTransport: Send + Sync {
    async fn open_tunnel(&self, host: &str, port: u16) -> Result<BoxedStream>;

    /// Round-trip the last hop to prove the transport is alive.
    async fn probe(&self, timeout: Duration) -> Result<()>;

    async fn close(&self);
}

/// Chain factory seam, implemented for real SSH by [`RusshConnector`].
#[async_trait]
pub trait ChainConnector: Send + Sync {
    async fn connect(&self, bastions: &[Bastion]) -> Result<Box<dyn ChainTransport>>;
}

pub struct RusshConnector {
    cfg: ChainConfig,
    client_config: Arc<client::Config>,
}

impl RusshConnector {
    pub fn new(cfg: ChainConfig) -> Self {
        let client_config = Arc::new(client::Config {
            keepalive_interval: Some(cfg.keepalive_interval),
            ..Default::default()
        });
        RusshConnector { cfg, client_config }
    }

    /// Handshake + authenticate one hop over an arbitrary transport.
    async fn connect_hop<S>(
        &self,
        stream: S,
        bastion: &Bastion,
    ) -> Result<client::Handle<ClientHandler>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut handle = tokio::time::timeout(
            self.cfg.connect_timeout,
            client::connect_stream(self.client_config.clone(), stream, ClientHandler),
        )
        .await
        .map_err(|_| {
            CoreError::Timeout(format!("ssh handshake with {} timed out", bastion.addr()))
        })??;

        self.authenticate(&mut handle, bastion).await?;
        Ok(handle)
    }

    /// Public key first when configured, then password. At least one
    /// method must be present.
    async fn authenticate(
        &self,
        handle: &mut client::Handle<ClientHandler>,
        bastion: &Bastion,
    ) -> Result<()> {
        if let Some(pem) = &bastion.auth.private_key {
            let key = russh::keys::decode_secret_key(pem, bastion.auth.passphrase.as_deref())
                .map_err(|e| {
                    CoreError::UpstreamFailure(format!(
                        "bad private key for bastion '{}': {}",
                        bastion.name, e
                    ))
                })?;
            let hash = handle.best_supported_rsa_hash().await?.flatten();
            let result = handle
                .authenticate_publickey(
                    bastion.username.as_str(),
                    PrivateKeyWithHashAlg::new(Arc::new(key), hash),
                )
                .await?;
            if result.success() {
                return Ok(());
            }
            log::debug!(
                "Public key auth rejected for {}@{}, trying password",
                bastion.username,
                bastion.addr()
            );
        }

        if let Some(password) = &bastion.auth.password {
            let result = handle
                .authenticate_password(bastion.username.as_str(), password.as_str())
                .await?;
            if result.success() {
                return Ok(());
            }
            return Err(CoreError::UpstreamFailure(format!(
                "authentication failed for {}@{}",
                bastion.username,
                bastion.addr()
            )));
        }

        if bastion.auth.private_key.is_some() {
            Err(CoreError::UpstreamFailure(format!(
                "authentication failed for {}@{}",
                bastion.username,
                bastion.addr()
            )))
        } else {
            Err(CoreError::InvalidRequest(format!(
                "bastion '{}' has no credential material",
                bastion.name
            )))
        }
    }

    /// Dial one hop with the configured retry budget. The hop's transport
    /// is a TCP connect for the first hop and a channel through the
    /// previous hop otherwise.
    async fn connect_hop_with_retry(
        &self,
        chain: &ChainClient,
        bastion: &Bastion,
    ) -> Result<client::Handle<ClientHandler>> {
        let attempts = self.cfg.max_retries.max(1);
        let mut last_err = None;

        for attempt in 1..=attempts {
            let dial = async {
                if let Some(prev) = chain.hops.last() {
                    let channel = prev
                        .channel_open_direct_tcpip(
                            bastion.host.clone(),
                            bastion.port as u32,
                            "127.0.0.1",
                            0,
                        )
                        .await?;
                    self.connect_hop(channel.into_stream(), bastion).await
                } else {
                    let tcp = tokio::time::timeout(
                        self.cfg.connect_timeout,
                        TcpStream::connect((bastion.host.as_str(), bastion.port)),
                    )
                    .await
                    .map_err(|_| {
                        CoreError::Timeout(format!("tcp dial to {} timed out", bastion.addr()))
                    })??;
                    self.connect_hop(tcp, bastion).await
                }
            };

            match dial.await {
                Ok(handle) => return Ok(handle),
                Err(e) => {
                    log::warn!(
                        "SSH hop {} attempt {}/{} failed: {}",
                        bastion.addr(),
                        attempt,
                        attempts,
                        e
                    );
                    last_err = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(self.cfg.retry_delay).await;
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            CoreError::UpstreamFailure(format!("ssh hop {} failed", bastion.addr()))
        }))
    }
}

#[async_trait]
impl ChainConnector for RusshConnector {
    async fn connect(&self, bastions: &[Bastion]) -> Result<Box<dyn ChainTransport>> {
        if bastions.is_empty() {
            return Err(CoreError::InvalidRequest(
                "cannot build an empty chain".to_string(),
            ));
        }

        let mut chain = ChainClient {
            key: chain_key(bastions),
            hops: Vec::with_capacity(bastions.len()),
        };

        for bastion in bastions {
            match self.connect_hop_with_retry(&chain, bastion).await {
                Ok(handle) => chain.hops.push(handle),
                Err(e) => {
                    // tear down whatever was built before this hop
                    chain.close().await;
                    return Err(e);
                }
            }
        }

        log::info!("SSH chain '{}' established ({} hops)", chain.key, chain.hops.len());
        Ok(Box::new(chain))
    }
}

#[async_trait]
impl ChainTransport for ChainClient {
    async fn open_tunnel(&self, host: &str, port: u16) -> Result<BoxedStream> {
        let last = self
            .hops
            .last()
            .ok_or_else(|| CoreError::UpstreamFailure("chain has no hops".to_string()))?;
        let channel = last
            .channel_open_direct_tcpip(host.to_string(), port as u32, "127.0.0.1", 0)
            .await?;
        Ok(Box::new(channel.into_stream()))
    }

    async fn probe(&self, timeout: Duration) -> Result<()> {
        let last = self
            .hops
            .last()
            .ok_or_else(|| CoreError::UpstreamFailure("chain has no hops".to_string()))?;
        match tokio::time::timeout(timeout, last.channel_open_session()).await {
            Ok(Ok(channel)) => {
                drop(channel);
                Ok(())
            }
            // a rejected channel still proves the transport round-trips
            Ok(Err(russh::Error::ChannelOpenFailure(_))) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(CoreError::Timeout(format!(
                "keepalive probe of chain '{}' timed out",
                self.key
            ))),
        }
    }

    async fn close(&self) {
        // last to first, so inner transports outlive the channels they carry
        for handle in self.hops.iter().rev() {
            let _ = handle
                .disconnect(russh::Disconnect::ByApplication, "", "en")
                .await;
        }
    }
}
