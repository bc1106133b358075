//! Streaming of analysis results and meshes to a remote viewer.
//!
//! Wire format, all integers unsigned 32-bit big-endian:
//!
//! ```text
//! [len][payload JSON, UTF-8]
//! [mesh count]
//! mesh count x [organ label][byte len][mesh file bytes]
//! ```
//!
//! There is no version or checksum field; the receiving viewer expects
//! exactly this layout.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::metrics::VolumeMetrics;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_PACING: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("endpoint {endpoint} unreachable: {source}")]
    Unreachable { endpoint: String, source: io::Error },

    #[error("cannot resolve endpoint {0}")]
    InvalidEndpoint(String),

    #[error("cannot read mesh {path}: {source}")]
    MeshRead { path: PathBuf, source: io::Error },

    #[error("frame of {0} bytes does not fit a 32-bit length prefix")]
    FrameTooLarge(usize),

    #[error("cannot encode payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Free-form patient metadata forwarded to the viewer as-is.
pub type PatientInfo = BTreeMap<String, serde_json::Value>;

/// JSON document sent ahead of the meshes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WirePayload {
    pub patient: PatientInfo,
    pub analysis: VolumeMetrics,
}

pub struct DeliveryClient {
    timeout: Duration,
    pacing: Duration,
}

impl Default for DeliveryClient {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT, DEFAULT_PACING)
    }
}

impl DeliveryClient {
    /// `timeout` bounds the connect and every subsequent write; `pacing` is
    /// the pause after each mesh frame.
    pub fn new(timeout: Duration, pacing: Duration) -> Self {
        Self { timeout, pacing }
    }

    /// Send `payload` and the meshes to `endpoint` (`host:port`).
    ///
    /// Returns `true` only if every frame was written. Failures are logged,
    /// never returned; use [`Self::try_deliver`] to get the cause.
    pub fn deliver(&self, endpoint: &str, mesh_assets: &[(u16, PathBuf)], payload: &WirePayload) -> bool {
        match self.try_deliver(endpoint, mesh_assets, payload) {
            Ok(()) => {
                info!(endpoint, meshes = mesh_assets.len(), "delivery complete");
                true
            }
            Err(err @ DeliveryError::Unreachable { .. }) => {
                error!(endpoint, error = %err, "viewer endpoint unreachable, is the receiver running?");
                false
            }
            Err(err) => {
                error!(endpoint, error = %err, "delivery failed");
                false
            }
        }
    }

    pub fn try_deliver(
        &self,
        endpoint: &str,
        mesh_assets: &[(u16, PathBuf)],
        payload: &WirePayload,
    ) -> Result<(), DeliveryError> {
        let mut stream = self.connect(endpoint)?;
        stream.set_write_timeout(Some(self.timeout))?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_nodelay(true)?;
        info!(endpoint, "connection established");

        FrameWriter::new(&mut stream, self.pacing).write_all(payload, mesh_assets)?;
        stream.shutdown(std::net::Shutdown::Write)?;
        Ok(())
    }

    fn connect(&self, endpoint: &str) -> Result<TcpStream, DeliveryError> {
        let addrs: Vec<SocketAddr> = endpoint
            .to_socket_addrs()
            .map_err(|_| DeliveryError::InvalidEndpoint(endpoint.to_string()))?
            .collect();
        if addrs.is_empty() {
            return Err(DeliveryError::InvalidEndpoint(endpoint.to_string()));
        }

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(stream) => return Ok(stream),
                Err(err) => last_err = Some(err),
            }
        }
        let source = last_err.unwrap_or_else(|| io::Error::from(io::ErrorKind::AddrNotAvailable));
        Err(DeliveryError::Unreachable {
            endpoint: endpoint.to_string(),
            source,
        })
    }
}

/// Encodes the delivery frames onto any writer.
pub struct FrameWriter<W: Write> {
    inner: W,
    pacing: Duration,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(inner: W, pacing: Duration) -> Self {
        Self { inner, pacing }
    }

    pub fn write_all(&mut self, payload: &WirePayload, mesh_assets: &[(u16, PathBuf)]) -> Result<(), DeliveryError> {
        self.write_payload(payload)?;
        self.write_count(mesh_assets.len())?;
        for (index, (label, path)) in mesh_assets.iter().enumerate() {
            self.write_mesh(*label, path)?;
            info!(label, path = %path.display(), "mesh {}/{} sent", index + 1, mesh_assets.len());
            if !self.pacing.is_zero() && index + 1 < mesh_assets.len() {
                thread::sleep(self.pacing);
            }
        }
        self.inner.flush()?;
        Ok(())
    }

    pub fn write_payload(&mut self, payload: &WirePayload) -> Result<(), DeliveryError> {
        let json = serde_json::to_vec(payload)?;
        let mut frame = Vec::with_capacity(4 + json.len());
        frame.extend_from_slice(&length_prefix(json.len())?);
        frame.extend_from_slice(&json);
        self.inner.write_all(&frame)?;
        Ok(())
    }

    pub fn write_count(&mut self, count: usize) -> Result<(), DeliveryError> {
        self.inner.write_all(&length_prefix(count)?)?;
        Ok(())
    }

    /// One mesh is encoded into a single buffer and written in one call so
    /// the label, length and bytes always go out together.
    pub fn write_mesh(&mut self, label: u16, path: &Path) -> Result<(), DeliveryError> {
        let bytes = fs::read(path).map_err(|source| DeliveryError::MeshRead {
            path: path.to_path_buf(),
            source,
        })?;
        if bytes.is_empty() {
            warn!(label, path = %path.display(), "sending empty mesh file");
        }
        let mut frame = Vec::with_capacity(8 + bytes.len());
        frame.extend_from_slice(&u32::from(label).to_be_bytes());
        frame.extend_from_slice(&length_prefix(bytes.len())?);
        frame.extend_from_slice(&bytes);
        self.inner.write_all(&frame)?;
        Ok(())
    }
}

fn length_prefix(len: usize) -> Result<[u8; 4], DeliveryError> {
    u32::try_from(len)
        .map(u32::to_be_bytes)
        .map_err(|_| DeliveryError::FrameTooLarge(len))
}
