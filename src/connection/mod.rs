//! TCP connection lifecycle: one live socket per enabled device.
//!
//! The manager owns the map of device id to [`ConnectionHandle`]. Each handle
//! carries the write half behind a single-writer mutex (reader ACK/NAK replies
//! and sender command frames must never interleave on the wire), the
//! per-connection [`ResponseTable`], and the cancellation token of its read
//! loop. A periodic health check reconnects dead sockets and proactively
//! closes connections of devices that have been disabled.

pub mod reader;
pub mod registry;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ConnectionConfig;
use crate::error::{Result, SignalError};
use crate::services::{AuditSink, Device, DeviceDirectory};
use registry::ResponseTable;

pub(crate) type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One live connection to a controller.
pub struct ConnectionHandle {
    device_id: String,
    protocol_address: u16,
    writer: tokio::sync::Mutex<BoxWriter>,
    table: ResponseTable,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    pub(crate) fn new(
        device_id: String,
        protocol_address: u16,
        writer: BoxWriter,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            device_id,
            protocol_address,
            writer: tokio::sync::Mutex::new(writer),
            table: ResponseTable::new(),
            closed: AtomicBool::new(false),
            cancel,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn protocol_address(&self) -> u16 {
        self.protocol_address
    }

    pub(crate) fn table(&self) -> &ResponseTable {
        &self.table
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Tear the connection down: stop the read loop and drop any replies a
    /// reconnect must not see.
    pub(crate) fn mark_closed(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(device = %self.device_id, "connection closed");
        }
        self.cancel.cancel();
        self.table.clear();
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Write one frame. Holding the writer lock across `write_all` + `flush`
    /// is the single-writer discipline.
    pub(crate) async fn write_frame(&self, frame: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(SignalError::device_unreachable(&self.device_id));
        }
        let mut writer = self.writer.lock().await;
        let write = async {
            writer.write_all(frame).await?;
            writer.flush().await
        };
        if let Err(e) = write.await {
            // A failed write means the socket is gone.
            self.mark_closed();
            return Err(SignalError::io_error(&self.device_id, e));
        }
        Ok(())
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("device_id", &self.device_id)
            .field("protocol_address", &self.protocol_address)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Owns every live connection and the health-check loop.
pub struct ConnectionManager {
    connections: Mutex<HashMap<String, Arc<ConnectionHandle>>>,
    directory: Arc<dyn DeviceDirectory>,
    audit: Arc<dyn AuditSink>,
    config: ConnectionConfig,
    shutdown: CancellationToken,
}

impl ConnectionManager {
    pub fn new(
        directory: Arc<dyn DeviceDirectory>,
        audit: Arc<dyn AuditSink>,
        config: ConnectionConfig,
    ) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            directory,
            audit,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Open a socket to `device` and start its read loop. An existing
    /// connection for the same device is torn down first.
    pub async fn connect(&self, device: &Device) -> Result<Arc<ConnectionHandle>> {
        let addr = format!("{}:{}", device.ip, device.port);
        let stream = tokio::time::timeout(self.config.connect_timeout(), TcpStream::connect(&addr))
            .await
            .map_err(|_| {
                SignalError::connection_failed(&device.id, format!("connect to {addr} timed out"))
            })?
            .map_err(|e| {
                SignalError::connection_failed_with_source(
                    &device.id,
                    format!("connect to {addr} failed"),
                    Box::new(e),
                )
            })?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(device = %device.id, error = %e, "could not set TCP_NODELAY");
        }
        let (read_half, write_half) = stream.into_split();
        let handle = Arc::new(ConnectionHandle::new(
            device.id.clone(),
            device.protocol_address,
            Box::new(write_half),
            self.shutdown.child_token(),
        ));
        tokio::spawn(reader::run(Arc::clone(&handle), read_half, Arc::clone(&self.audit)));

        let previous = {
            let mut connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
            connections.insert(device.id.clone(), Arc::clone(&handle))
        };
        if let Some(previous) = previous {
            previous.mark_closed();
        }
        info!(device = %device.id, %addr, "connected");
        Ok(handle)
    }

    /// The live handle for `device_id`, if one exists.
    pub fn handle(&self, device_id: &str) -> Result<Arc<ConnectionHandle>> {
        let connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
        match connections.get(device_id) {
            Some(handle) if !handle.is_closed() => Ok(Arc::clone(handle)),
            _ => Err(SignalError::device_unreachable(device_id)),
        }
    }

    pub fn is_connected(&self, device_id: &str) -> bool {
        self.handle(device_id).is_ok()
    }

    /// Close and forget the connection for `device_id`.
    pub fn close(&self, device_id: &str) {
        let removed = {
            let mut connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
            connections.remove(device_id)
        };
        if let Some(handle) = removed {
            handle.mark_closed();
            info!(device = device_id, "connection dropped");
        }
    }

    /// One health-check sweep: connect missing or dead enabled devices, close
    /// devices that are no longer enabled.
    pub async fn check_once(&self) {
        let devices = match self.directory.enabled_devices().await {
            Ok(devices) => devices,
            Err(e) => {
                warn!(error = %e, "device directory unavailable, skipping health check");
                return;
            }
        };
        let enabled: HashSet<&str> = devices.iter().map(|d| d.id.as_str()).collect();
        let stale: Vec<String> = {
            let connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
            connections.keys().filter(|id| !enabled.contains(id.as_str())).cloned().collect()
        };
        for device_id in stale {
            info!(device = %device_id, "device disabled, closing connection");
            self.close(&device_id);
        }
        for device in &devices {
            if !self.is_connected(&device.id) {
                if let Err(e) = self.connect(device).await {
                    warn!(device = %device.id, error = %e, "reconnect failed");
                }
            }
        }
    }

    /// Health-check loop. Runs until [`ConnectionManager::stop`].
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(self.config.health_check_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => self.check_once().await,
            }
        }
    }

    /// Stop the health-check loop and every read loop.
    pub fn stop(&self) {
        self.shutdown.cancel();
        let connections = {
            let mut map = self.connections.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *map)
        };
        for handle in connections.into_values() {
            handle.mark_closed();
        }
    }
}
