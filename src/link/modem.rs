//! Reconnecting TCP client for a radio modem's data port.
//!
//! The modem (an ARDOP-style TNC or a test harness standing in for one)
//! exposes a reliable full-duplex byte stream; everything framed onto it is
//! broadcast over the air. The link is unauthenticated: the modem process is
//! local and trusted, so connect failures are always transient and retried
//! with exponential backoff.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{info, warn};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

use super::{
    pump_stream, queue_send, sleep_while_running, FrameCallback, LinkCore, LinkMetrics,
    LinkTransport, PumpExit,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection settings for the modem data port.
#[derive(Debug, Clone)]
pub struct ModemConfig {
    pub host: String,
    pub port: u16,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    pub tx_queue_size: usize,
}

impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8515,
            reconnect_base: Duration::from_secs(5),
            reconnect_max: Duration::from_secs(60),
            tx_queue_size: 1000,
        }
    }
}

/// Unauthenticated reconnecting link to the radio modem.
pub struct ModemLink {
    core: Arc<LinkCore>,
    cfg: ModemConfig,
    txq: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
}

impl ModemLink {
    pub fn new(cfg: ModemConfig, name: &str, rx_callback: FrameCallback) -> Self {
        let (tx, rx) = mpsc::channel(cfg.tx_queue_size.max(1));
        Self {
            core: Arc::new(LinkCore::new(name, "modem", rx_callback, tx)),
            cfg,
            txq: Mutex::new(Some(rx)),
        }
    }

    async fn supervise(core: Arc<LinkCore>, cfg: ModemConfig, mut txq: mpsc::Receiver<Vec<u8>>) {
        let mut delay = cfg.reconnect_base;
        while core.is_running() {
            core.note_connect_attempt();
            info!("{}: connecting to {}:{}", core.name, cfg.host, cfg.port);
            let attempt = timeout(
                CONNECT_TIMEOUT,
                TcpStream::connect((cfg.host.as_str(), cfg.port)),
            )
            .await;
            match attempt {
                Ok(Ok(stream)) => {
                    info!("{}: connected", core.name);
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
                _ => {
                    core.set_last_error("connect_failed");
                    warn!(
                        "{}: connect to {}:{} failed, retrying in {:.1}s",
                        core.name,
                        cfg.host,
                        cfg.port,
                        delay.as_secs_f64()
                    );
                    sleep_while_running(&core, delay).await;
                    delay = (delay * 2).min(cfg.reconnect_max);
                }
            }
        }
        core.set_running(false);
        info!("{}: stopped", core.name);
    }
}

impl LinkTransport for ModemLink {
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
        tokio::spawn(Self::supervise(self.core.clone(), self.cfg.clone(), txq));
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
