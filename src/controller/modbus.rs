//! Modbus TCP controller client
//!
//! Each tag maps onto a register range sized by its declared type; multi-word
//! values use big-endian word order.

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;
use tracing::{debug, info};

use super::{ClientError, ControllerClient, RawValue};
use crate::config::{DataType, RegisterType};
use crate::registry::TagSpec;

pub const DEFAULT_PORT: u16 = 502;

pub struct ModbusClient {
    controller: String,
    host: String,
    port: u16,
    unit_id: u8,
    context: Option<Context>,
}

impl ModbusClient {
    pub fn new(controller: &str, host: &str, port: u16, unit_id: u8) -> Self {
        Self {
            controller: controller.to_string(),
            host: host.to_string(),
            port,
            unit_id,
            context: None,
        }
    }

    async fn resolve(host: String, port: u16) -> Result<SocketAddr, ClientError> {
        tokio::net::lookup_host((host.as_str(), port))
            .await?
            .next()
            .ok_or_else(|| ClientError::Connect(format!("{}:{} did not resolve", host, port)))
    }

    async fn read_words(
        ctx: &mut Context,
        register: RegisterType,
        addr: u16,
        cnt: u16,
    ) -> Result<Vec<u16>, ClientError> {
        let words = match register {
            RegisterType::Holding => ctx
                .read_holding_registers(addr, cnt)
                .await?
                .map_err(|e| ClientError::Exception(format!("{:?}", e)))?,
            RegisterType::Input => ctx
                .read_input_registers(addr, cnt)
                .await?
                .map_err(|e| ClientError::Exception(format!("{:?}", e)))?,
            RegisterType::Coil => ctx
                .read_coils(addr, cnt)
                .await?
                .map_err(|e| ClientError::Exception(format!("{:?}", e)))?
                .into_iter()
                .map(u16::from)
                .collect(),
            RegisterType::Discrete => ctx
                .read_discrete_inputs(addr, cnt)
                .await?
                .map_err(|e| ClientError::Exception(format!("{:?}", e)))?
                .into_iter()
                .map(u16::from)
                .collect(),
        };
        Ok(words)
    }
}

#[async_trait]
impl ControllerClient for ModbusClient {
    async fn connect(&mut self) -> Result<(), ClientError> {
        let addr = Self::resolve(self.host.clone(), self.port).await?;
        info!(
            "Connecting to Modbus TCP: {} (unit {}) for controller {}",
            addr, self.unit_id, self.controller
        );

        let ctx = tcp::connect_slave(addr, Slave(self.unit_id))
            .await
            .map_err(|e| ClientError::Connect(format!("{}: {}", addr, e)))?;

        self.context = Some(ctx);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), ClientError> {
        // dropping the context closes the socket
        self.context = None;
        Ok(())
    }

    async fn read_batch(
        &mut self,
        tags: &[TagSpec],
    ) -> Result<HashMap<String, RawValue>, ClientError> {
        let ctx = self.context.as_mut().ok_or(ClientError::NotConnected)?;

        let mut values = HashMap::with_capacity(tags.len());
        for tag in tags {
            let addr = tag
                .address
                .ok_or_else(|| ClientError::Read(format!("tag {} has no address", tag.name)))?;
            let cnt = tag.data_type.register_count();

            debug!(
                "Reading {} {:?} registers from address {} ({})",
                cnt, tag.register, addr, self.controller
            );
            let words = Self::read_words(ctx, tag.register, addr, cnt).await?;
            values.insert(tag.name.clone(), decode(tag.data_type, &words)?);
        }

        Ok(values)
    }
}

/// Convert raw register words to a typed value
pub fn decode(data_type: DataType, words: &[u16]) -> Result<RawValue, ClientError> {
    let need = data_type.register_count() as usize;
    if words.len() < need {
        return Err(ClientError::Read(format!(
            "expected {} registers for {:?}, got {}",
            need,
            data_type,
            words.len()
        )));
    }

    let u32_at = |i: usize| (words[i] as u32) << 16 | words[i + 1] as u32;
    let u64_be = || (u32_at(0) as u64) << 32 | u32_at(2) as u64;

    let value = match data_type {
        DataType::Bool => RawValue::Bool(words[0] != 0),
        DataType::Uint16 => RawValue::U16(words[0]),
        DataType::Int16 => RawValue::I16(words[0] as i16),
        DataType::Uint32 => RawValue::U32(u32_at(0)),
        DataType::Int32 => RawValue::I32(u32_at(0) as i32),
        DataType::Float32 => RawValue::F32(f32::from_bits(u32_at(0))),
        DataType::Int64 => RawValue::I64(u64_be() as i64),
        DataType::Float64 => RawValue::F64(f64::from_bits(u64_be())),
    };
    Ok(value)
}
