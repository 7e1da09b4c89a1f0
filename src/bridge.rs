//! Tunnel bridge: the two pump loops between the TUN descriptor and the
//! packet transport.
//!
//! ```text
//!   fd ──read──▶ outbound pump ──route──▶ transport ──▶ peers
//!   fd ◀─write── inbound pump ◀──queue── transport ◀── peers
//! ```

use std::os::unix::io::RawFd;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::device::TunDevice;
use crate::transport::PacketTransport;

/// Called once, from a pump task, when the descriptor fails.
pub type FatalHandler = Arc<dyn Fn(String) + Send + Sync>;

/// A running pair of pumps on one descriptor.
pub struct TunnelBridge {
    fd: RawFd,
    stop_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl TunnelBridge {
    /// Spawn both pumps on the current runtime.
    pub fn start(
        device: TunDevice,
        transport: Arc<PacketTransport>,
        on_fatal: FatalHandler,
    ) -> Self {
        let fd = device.fd();
        let device = Arc::new(device);
        let (stop_tx, stop_rx) = watch::channel(false);

        let outbound = tokio::spawn(run_outbound_pump(
            device.clone(),
            transport.clone(),
            stop_rx.clone(),
            on_fatal.clone(),
        ));
        let inbound = tokio::spawn(run_inbound_pump(device, transport, stop_rx, on_fatal));

        log::info!("Tunnel bridge started on descriptor {}", fd);
        Self {
            fd,
            stop_tx,
            tasks: vec![outbound, inbound],
        }
    }

    /// Signal both pumps and wait until they have released the descriptor.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
        log::info!("Tunnel bridge on descriptor {} stopped", self.fd);
    }
}

async fn run_outbound_pump(
    device: Arc<TunDevice>,
    transport: Arc<PacketTransport>,
    mut stop_rx: watch::Receiver<bool>,
    on_fatal: FatalHandler,
) {
    let stats = transport.stats();
    let mut buf = vec![0u8; device.buffer_size()];
    loop {
        tokio::select! {
            _ = stop_rx.changed() => break,
            result = device.read_packet(&mut buf) => {
                match result {
                    Ok(packet) if packet.is_empty() => continue,
                    Ok(packet) => {
                        stats.tun_packets_read.fetch_add(1, Ordering::Relaxed);
                        transport.send_packet(packet).await;
                    }
                    Err(e) => {
                        log::error!("TUN read error: {}", e);
                        on_fatal(format!("TUN read failed: {}", e));
                        break;
                    }
                }
            }
        }
    }
}

async fn run_inbound_pump(
    device: Arc<TunDevice>,
    transport: Arc<PacketTransport>,
    mut stop_rx: watch::Receiver<bool>,
    on_fatal: FatalHandler,
) {
    let stats = transport.stats();
    let inbound = transport.inbound();
    let mut inbound = inbound.lock().await;
    loop {
        tokio::select! {
            _ = stop_rx.changed() => break,
            packet = inbound.recv() => {
                let Some(packet) = packet else { break };
                match device.write_packet(&packet).await {
                    Ok(()) => {
                        stats.packets_written.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        log::error!("TUN write error: {}", e);
                        on_fatal(format!("TUN write failed: {}", e));
                        break;
                    }
                }
            }
        }
    }
}
