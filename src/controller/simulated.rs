//! Simulated controller
//!
//! Generates deterministic values for every declared tag type without any
//! network traffic. Useful for commissioning a config before the real
//! controllers are reachable.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use super::{ClientError, ControllerClient, RawValue};
use crate::config::DataType;
use crate::registry::TagSpec;

pub struct SimulatedClient {
    controller: String,
    connected: bool,
    fail_connect: bool,
    latency: Option<Duration>,
    cycle: u64,
}

impl SimulatedClient {
    pub fn new(controller: impl Into<String>) -> Self {
        Self {
            controller: controller.into(),
            connected: false,
            fail_connect: false,
            latency: None,
            cycle: 0,
        }
    }

    /// Make every connect attempt fail
    pub fn failing_connect(mut self, fail: bool) -> Self {
        self.fail_connect = fail;
        self
    }

    /// Delay each batch read
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn value_for(&self, data_type: DataType, index: usize) -> RawValue {
        let step = self.cycle.wrapping_add(index as u64);
        match data_type {
            DataType::Float32 => RawValue::F32(20.0 + (step % 20) as f32 * 0.25),
            DataType::Float64 => RawValue::F64(100.0 + (step % 50) as f64 * 0.1),
            DataType::Int16 => RawValue::I16((step % 1000) as i16),
            DataType::Int32 => RawValue::I32((step % 100_000) as i32),
            DataType::Int64 => RawValue::I64(step as i64),
            DataType::Uint16 => RawValue::U16((step % 65_536) as u16),
            DataType::Uint32 => RawValue::U32(step as u32),
            DataType::Bool => RawValue::Bool(step % 2 == 0),
        }
    }
}

#[async_trait]
impl ControllerClient for SimulatedClient {
    async fn connect(&mut self) -> Result<(), ClientError> {
        if self.fail_connect {
            return Err(ClientError::Connect(format!(
                "simulated controller {} refused the connection",
                self.controller
            )));
        }
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), ClientError> {
        self.connected = false;
        Ok(())
    }

    async fn read_batch(
        &mut self,
        tags: &[TagSpec],
    ) -> Result<HashMap<String, RawValue>, ClientError> {
        if !self.connected {
            return Err(ClientError::NotConnected);
        }
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        self.cycle = self.cycle.wrapping_add(1);
        let values: HashMap<_, _> = tags
            .iter()
            .enumerate()
            .map(|(i, tag)| (tag.name.clone(), self.value_for(tag.data_type, i)))
            .collect();

        debug!(
            "Simulated controller {} produced {} values (cycle {})",
            self.controller,
            values.len(),
            self.cycle
        );
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegisterType;

    fn tag(name: &str, data_type: DataType) -> TagSpec {
        TagSpec {
            name: name.to_string(),
            controller: "sim".to_string(),
            qualified: format!("sim/{}", name),
            data_type,
            scale_factor: 1.0,
            unit: None,
            description: None,
            address: None,
            register: RegisterType::Holding,
        }
    }

    #[tokio::test]
    async fn test_values_match_declared_types() {
        let mut client = SimulatedClient::new("sim");
        client.connect().await.unwrap();

        let tags = vec![
            tag("t", DataType::Float32),
            tag("d", DataType::Float64),
            tag("c", DataType::Int64),
            tag("b", DataType::Bool),
        ];
        let values = client.read_batch(&tags).await.unwrap();

        assert!(matches!(values["t"], RawValue::F32(_)));
        assert!(matches!(values["d"], RawValue::F64(_)));
        assert!(matches!(values["c"], RawValue::I64(_)));
        assert!(matches!(values["b"], RawValue::Bool(_)));
    }

    #[tokio::test]
    async fn test_read_before_connect_fails() {
        let mut client = SimulatedClient::new("sim");
        let result = client.read_batch(&[tag("t", DataType::Float32)]).await;
        assert!(matches!(result, Err(ClientError::NotConnected)));
    }

    #[tokio::test]
    async fn test_failing_connect() {
        let mut client = SimulatedClient::new("sim").failing_connect(true);
        let err = client.connect().await.unwrap_err();
        assert!(err.to_string().contains("refused"));
    }
}
