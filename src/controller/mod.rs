//! Controller connections
//!
//! [`ControllerClient`] is the seam to the protocol library: connect,
//! disconnect and batch-read by tag set. [`ControllerConnection`] wraps one
//! client with its connection state and the tags it owns.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::DriverConfig;
use crate::registry::{ControllerSpec, TagSpec};

pub mod modbus;
pub mod simulated;

pub use modbus::ModbusClient;
pub use simulated::SimulatedClient;

/// A value exactly as the controller reported it
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    F32(f32),
    F64(f64),
    I16(i16),
    I32(i32),
    I64(i64),
    U16(u16),
    U32(u32),
    Bool(bool),
    /// Anything the client could read but not map onto a numeric type
    Unsupported(String),
}

/// Error type for controller operations
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("not connected")]
    NotConnected,
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("read failed: {0}")]
    Read(String),
    #[error("read timed out after {0:?}")]
    Timeout(Duration),
    #[error("Modbus exception: {0}")]
    Exception(String),
    #[error("Transport error: {0}")]
    Transport(#[from] tokio_modbus::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Protocol client for a single controller
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ControllerClient: Send {
    async fn connect(&mut self) -> Result<(), ClientError>;

    async fn disconnect(&mut self) -> Result<(), ClientError>;

    /// Read every requested tag in one round; keys are bare tag names
    async fn read_batch(
        &mut self,
        tags: &[TagSpec],
    ) -> Result<HashMap<String, RawValue>, ClientError>;
}

/// Build the client matching a controller's configured driver
pub fn client_for(spec: &ControllerSpec) -> Box<dyn ControllerClient> {
    match &spec.config.driver {
        DriverConfig::Simulated { fail_connect } => {
            Box::new(SimulatedClient::new(&spec.name).failing_connect(*fail_connect))
        }
        DriverConfig::Modbus { unit_id } => Box::new(ModbusClient::new(
            &spec.name,
            &spec.config.host,
            spec.config.port.unwrap_or(modbus::DEFAULT_PORT),
            *unit_id,
        )),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// Live session to one controller plus the tags it owns
pub struct ControllerConnection {
    name: String,
    tags: Vec<TagSpec>,
    client: Box<dyn ControllerClient>,
    state: ConnectionState,
    read_timeout: Option<Duration>,
}

impl ControllerConnection {
    pub fn new(
        name: impl Into<String>,
        tags: Vec<TagSpec>,
        client: Box<dyn ControllerClient>,
        read_timeout: Option<Duration>,
    ) -> Self {
        Self {
            name: name.into(),
            tags,
            client,
            state: ConnectionState::Disconnected,
            read_timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub async fn connect(&mut self) -> Result<(), ClientError> {
        if self.is_connected() {
            return Ok(());
        }

        self.client.connect().await?;
        self.state = ConnectionState::Connected;
        info!(controller = %self.name, tags = self.tags.len(), "Controller connected");
        Ok(())
    }

    /// Never fails: a disconnect error is logged and the session is dropped anyway
    pub async fn disconnect(&mut self) {
        if !self.is_connected() {
            return;
        }

        if let Err(e) = self.client.disconnect().await {
            warn!(controller = %self.name, error = %e, "Disconnect reported an error");
        }
        self.state = ConnectionState::Disconnected;
        info!(controller = %self.name, "Controller disconnected");
    }

    /// Batch-read the owned tags, keyed by fully-qualified name
    pub async fn read(&mut self) -> Result<Vec<(String, RawValue)>, ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        if self.tags.is_empty() {
            return Ok(Vec::new());
        }

        let read = self.client.read_batch(&self.tags);
        let mut values = match self.read_timeout {
            Some(limit) => tokio::time::timeout(limit, read)
                .await
                .map_err(|_| ClientError::Timeout(limit))??,
            None => read.await?,
        };

        let mut out = Vec::with_capacity(self.tags.len());
        for tag in &self.tags {
            match values.remove(&tag.name) {
                Some(value) => out.push((tag.qualified.clone(), value)),
                None => warn!(controller = %self.name, tag = %tag.name, "Tag missing from batch read"),
            }
        }
        if !values.is_empty() {
            debug!(
                controller = %self.name,
                extra = values.len(),
                "Ignoring values for tags that were not requested"
            );
        }

        debug!(controller = %self.name, values = out.len(), "Batch read complete");
        Ok(out)
    }
}
