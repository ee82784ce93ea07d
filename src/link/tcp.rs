//! Authenticated TCP mesh link, usable as client or server.
//!
//! Uses the same length-prefix framing as the modem link, with a link-local
//! handshake before any frames flow:
//!
//! ```text
//! client -> server: "QMESH1" + u16_be password length + password bytes
//! server -> client: one status byte (0x00 ok / 0x01 bad password /
//!                   0x02 bad handshake)
//! ```
//!
//! A rejected handshake is an authentication failure, not a transient fault:
//! the client link stops without retrying. The server accepts one peer at a
//! time and keeps listening after a peer drops.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{error, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

use super::{
    pump_stream, queue_send, sleep_while_running, FrameCallback, LinkCore, LinkError,
    LinkMetrics, LinkTransport, PumpExit, MAX_FRAME_LEN,
};

pub const HANDSHAKE_MAGIC: &[u8; 6] = b"QMESH1";

pub const HS_OK: u8 = 0x00;
pub const HS_BAD_PW: u8 = 0x01;
pub const HS_BAD_HANDSHAKE: u8 = 0x02;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// Pause after a rejected inbound handshake, so repeated bad attempts cannot
/// spin the accept loop.
const REJECT_PAUSE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct TcpClientConfig {
    pub host: String,
    pub port: u16,
    pub password: String,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    pub tx_queue_size: usize,
}

#[derive(Debug, Clone)]
pub struct TcpServerConfig {
    pub port: u16,
    pub password: String,
    pub tx_queue_size: usize,
}

#[derive(Clone)]
enum Mode {
    Client(TcpClientConfig),
    Server(TcpServerConfig),
}

/// TCP mesh link. Construct with [`TcpMeshLink::client`] or
/// [`TcpMeshLink::server`].
pub struct TcpMeshLink {
    core: Arc<LinkCore>,
    mode: Mode,
    txq: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
}

impl TcpMeshLink {
    pub fn client(cfg: TcpClientConfig, name: &str, rx_callback: FrameCallback) -> Self {
        let (tx, rx) = mpsc::channel(cfg.tx_queue_size.max(1));
        Self {
            core: Arc::new(LinkCore::new(name, "tcp-client", rx_callback, tx)),
            mode: Mode::Client(cfg),
            txq: Mutex::new(Some(rx)),
        }
    }

    pub fn server(cfg: TcpServerConfig, name: &str, rx_callback: FrameCallback) -> Self {
        let (tx, rx) = mpsc::channel(cfg.tx_queue_size.max(1));
        Self {
            core: Arc::new(LinkCore::new(name, "tcp-server", rx_callback, tx)),
            mode: Mode::Server(cfg),
            txq: Mutex::new(Some(rx)),
        }
    }

    async fn supervise_client(
        core: Arc<LinkCore>,
        cfg: TcpClientConfig,
        mut txq: mpsc::Receiver<Vec<u8>>,
    ) {
        let mut delay = cfg.reconnect_base;
        while core.is_running() {
            core.note_connect_attempt();
            info!("{}: connecting to {}:{}", core.name, cfg.host, cfg.port);
            let attempt = timeout(
                CONNECT_TIMEOUT,
                TcpStream::connect((cfg.host.as_str(), cfg.port)),
            )
            .await;
            let stream = match attempt {
                Ok(Ok(stream)) => stream,
                _ => {
                    core.set_last_error("connect_failed");
                    warn!(
                        "{}: connect failed, retrying in {:.1}s",
                        core.name,
                        delay.as_secs_f64()
                    );
                    sleep_while_running(&core, delay).await;
                    delay = (delay * 2).min(cfg.reconnect_max);
                    continue;
                }
            };

            let mut stream = stream;
            match client_handshake(&mut stream, &cfg.password).await {
                Ok(()) => {}
                Err(LinkError::Auth(reason)) => {
                    // Misconfigured or hostile peer; retrying would only
                    // re-send the wrong credentials forever.
                    error!("{}: handshake failed: {} (stopping)", core.name, reason);
                    core.set_last_error("handshake_rejected");
                    core.set_running(false);
                    break;
                }
                Err(err) => {
                    core.set_last_error("handshake_io_error");
                    warn!("{}: handshake i/o failed: {}", core.name, err);
                    sleep_while_running(&core, delay).await;
                    delay = (delay * 2).min(cfg.reconnect_max);
                    continue;
                }
            }

            info!("{}: connected to {}:{}", core.name, cfg.host, cfg.port);
            core.note_connected();
            delay = cfg.reconnect_base;
            let exit = pump_stream(&core, stream, &mut txq).await;
            core.note_disconnected();
            match exit {
                PumpExit::Stopped => break,
                PumpExit::Fatal => {
                    core.set_running(false);
                    break;
                }
                PumpExit::Disconnected => {
                    sleep_while_running(&core, Duration::from_secs(1)).await;
                }
            }
        }
        core.set_running(false);
        info!("{}: stopped", core.name);
    }

    async fn supervise_server(
        core: Arc<LinkCore>,
        cfg: TcpServerConfig,
        mut txq: mpsc::Receiver<Vec<u8>>,
    ) {
        let listener = loop {
            if !core.is_running() {
                return;
            }
            match TcpListener::bind(("0.0.0.0", cfg.port)).await {
                Ok(listener) => {
                    info!("{}: listening on 0.0.0.0:{}", core.name, cfg.port);
                    break listener;
                }
                Err(err) => {
                    core.set_last_error("bind_failed");
                    warn!("{}: bind failed: {}, retrying", core.name, err);
                    sleep_while_running(&core, Duration::from_secs(2)).await;
                }
            }
        };

        while core.is_running() {
            let accepted = match timeout(Duration::from_secs(2), listener.accept()).await {
                Ok(Ok(accepted)) => accepted,
                Ok(Err(err)) => {
                    warn!("{}: accept failed: {}", core.name, err);
                    sleep_while_running(&core, Duration::from_secs(1)).await;
                    continue;
                }
                Err(_) => continue, // accept timeout: re-check the shutdown flag
            };

            let (mut stream, addr) = accepted;
            match server_handshake(&mut stream, &cfg.password).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!("{}: rejected {} (bad password or handshake)", core.name, addr);
                    sleep_while_running(&core, REJECT_PAUSE).await;
                    continue;
                }
                Err(err) => {
                    warn!("{}: handshake with {} failed: {}", core.name, addr, err);
                    continue;
                }
            }

            info!("{}: accepted {}", core.name, addr);
            core.note_connected();
            let exit = pump_stream(&core, stream, &mut txq).await;
            core.note_disconnected();
            match exit {
                PumpExit::Stopped => break,
                PumpExit::Fatal => {
                    core.set_running(false);
                    break;
                }
                PumpExit::Disconnected => continue,
            }
        }
        core.set_running(false);
        info!("{}: stopped", core.name);
    }
}

impl LinkTransport for TcpMeshLink {
    fn start(&self) {
        if self.core.set_running(true) {
            warn!("{}: already running", self.core.name);
            return;
        }
        let Some(txq) = self.txq.lock().unwrap_or_else(|p| p.into_inner()).take() else {
            warn!("{}: restart is not supported", self.core.name);
            self.core.set_running(false);
            return;
        };
        match self.mode.clone() {
            Mode::Client(cfg) => {
                tokio::spawn(Self::supervise_client(self.core.clone(), cfg, txq));
            }
            Mode::Server(cfg) => {
                tokio::spawn(Self::supervise_server(self.core.clone(), cfg, txq));
            }
        }
    }

    fn stop(&self) {
        self.core.set_running(false);
    }

    fn send(&self, frame: &[u8]) {
        queue_send(&self.core, frame);
    }

    fn metrics(&self) -> LinkMetrics {
        self.core.snapshot()
    }
}

async fn client_handshake(stream: &mut TcpStream, password: &str) -> Result<(), LinkError> {
    let pw = password.as_bytes();
    if pw.len() > MAX_FRAME_LEN {
        return Err(LinkError::Auth("password too long".to_string()));
    }
    let mut hello = Vec::with_capacity(8 + pw.len());
    hello.extend_from_slice(HANDSHAKE_MAGIC);
    hello.extend_from_slice(&(pw.len() as u16).to_be_bytes());
    hello.extend_from_slice(pw);
    timeout(HANDSHAKE_TIMEOUT, stream.write_all(&hello))
        .await
        .map_err(|_| timeout_err())??;

    let mut status = [0u8; 1];
    timeout(HANDSHAKE_TIMEOUT, stream.read_exact(&mut status))
        .await
        .map_err(|_| timeout_err())??;
    match status[0] {
        HS_OK => Ok(()),
        HS_BAD_PW => Err(LinkError::Auth("server rejected password".to_string())),
        _ => Err(LinkError::Auth("server rejected handshake".to_string())),
    }
}

/// Validate one inbound handshake. `Ok(false)` means the peer was rejected
/// (a status byte was already sent where possible).
async fn server_handshake(stream: &mut TcpStream, expected: &str) -> Result<bool, LinkError> {
    let mut header = [0u8; 8];
    timeout(HANDSHAKE_TIMEOUT, stream.read_exact(&mut header))
        .await
        .map_err(|_| timeout_err())??;

    if &header[..6] != HANDSHAKE_MAGIC {
        let _ = stream.write_all(&[HS_BAD_HANDSHAKE]).await;
        return Ok(false);
    }
    let pw_len = u16::from_be_bytes([header[6], header[7]]) as usize;
    let mut pw = vec![0u8; pw_len];
    if pw_len > 0 {
        timeout(HANDSHAKE_TIMEOUT, stream.read_exact(&mut pw))
            .await
            .map_err(|_| timeout_err())??;
    }
    if pw != expected.as_bytes() {
        let _ = stream.write_all(&[HS_BAD_PW]).await;
        return Ok(false);
    }
    stream.write_all(&[HS_OK]).await?;
    Ok(true)
}

fn timeout_err() -> LinkError {
    LinkError::Io(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        "handshake timed out",
    ))
}
