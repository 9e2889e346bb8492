//! GPIB transport over VISA.
//!
//! `visa-rs` I/O is blocking, so every call runs on a blocking thread. Each
//! call first programs the VISA timeout from [`Transport::set_timeout`], which
//! the owning session sets per command, so an abandoned blocking call ends
//! when the command's deadline passes.

use super::{gpib_resource, Transport};
use crate::error::TransportError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::ffi::CString;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use visa_rs::attribute::{AttrTmoValue, HasAttribute};
use visa_rs::prelude::*;

// Field order matters: the instrument session closes before its manager.
struct Link {
    instr: Instrument,
    _rm: DefaultRM,
}

impl Link {
    fn apply_timeout(&self, timeout: Duration) -> Result<(), TransportError> {
        let millis = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
        let attr = AttrTmoValue::new_checked(millis)
            .ok_or_else(|| TransportError::Io(format!("invalid VISA timeout {:?}", timeout)))?;
        self.instr
            .set_attr(attr)
            .map_err(|e| TransportError::Io(format!("Failed to set VISA timeout: {}", e)))
    }
}

/// VISA-backed link to one GPIB instrument.
pub struct VisaTransport {
    resource: String,
    link: Option<Arc<Mutex<Link>>>,
    timeout: Duration,
}

impl VisaTransport {
    /// Open `GPIB{board}::{address}::INSTR`.
    pub async fn open(board: u8, address: u8, timeout: Duration) -> Result<Self, TransportError> {
        let resource = gpib_resource(board, address);
        let name = resource.clone();
        let link = tokio::task::spawn_blocking(move || {
            let rm = DefaultRM::new().map_err(|e| TransportError::Io(e.to_string()))?;
            let c_string = CString::new(name).map_err(|e| TransportError::Io(e.to_string()))?;
            let visa_string = VisaString::from(c_string);
            let instr = rm
                .open(&visa_string, AccessMode::NO_LOCK, TIMEOUT_IMMEDIATE)
                .map_err(|e| TransportError::Io(e.to_string()))?;
            Ok::<_, TransportError>(Link { instr, _rm: rm })
        })
        .await
        .map_err(|e| TransportError::Io(format!("VISA open task panicked: {}", e)))??;

        debug!("VISA resource '{}' opened", resource);
        Ok(Self {
            resource,
            link: Some(Arc::new(Mutex::new(link))),
            timeout,
        })
    }

    fn link(&self) -> Result<Arc<Mutex<Link>>, TransportError> {
        self.link.clone().ok_or(TransportError::Closed)
    }
}

#[async_trait]
impl Transport for VisaTransport {
    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let link = self.link()?;
        let bytes = bytes.to_vec();
        let timeout = self.timeout;
        tokio::task::spawn_blocking(move || {
            let mut guard = link.lock();
            guard.apply_timeout(timeout)?;
            guard
                .instr
                .write_all(&bytes)
                .map_err(|e| TransportError::Io(e.to_string()))
        })
        .await
        .map_err(|e| TransportError::Io(format!("VISA write task panicked: {}", e)))?
    }

    async fn read_line(&mut self) -> Result<Vec<u8>, TransportError> {
        let link = self.link()?;
        let timeout = self.timeout;
        tokio::task::spawn_blocking(move || {
            let mut guard = link.lock();
            guard.apply_timeout(timeout)?;
            let mut buf = [0u8; 1024];
            let n = guard.instr.read(&mut buf).map_err(|e| match e.kind() {
                std::io::ErrorKind::TimedOut => TransportError::Timeout,
                _ => TransportError::Io(e.to_string()),
            })?;
            let mut line = buf[..n].to_vec();
            while matches!(line.last(), Some(b'\n' | b'\r')) {
                line.pop();
            }
            Ok(line)
        })
        .await
        .map_err(|e| TransportError::Io(format!("VISA read task panicked: {}", e)))?
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.link.take().is_some() {
            debug!("VISA resource '{}' closed", self.resource);
        }
        Ok(())
    }

    fn resource_name(&self) -> String {
        self.resource.clone()
    }
}
