//! Modbus coil/register gateway (discrete I/O next to the PLC).

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

pub mod mock;
pub mod modbus_tcp;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("timeout")]
    Timeout,

    #[error("comm error: {message}")]
    Comm { message: String },

    #[error("modbus exception: {message}")]
    Exception { message: String },
}

pub type GatewayFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, GatewayError>> + Send + 'a>>;

/// Implementations reconnect on demand and retry a bounded number of times
/// before surfacing a failure.
pub trait ModbusGateway: Send + Sync {
    fn read_coils<'a>(&'a self, address: u16, count: u16) -> GatewayFuture<'a, Vec<bool>>;

    fn write_coil<'a>(&'a self, address: u16, value: bool) -> GatewayFuture<'a, ()>;

    fn read_discrete_inputs<'a>(&'a self, address: u16, count: u16) -> GatewayFuture<'a, Vec<bool>>;

    fn read_holding_registers<'a>(&'a self, address: u16, count: u16) -> GatewayFuture<'a, Vec<u16>>;

    fn write_register<'a>(&'a self, address: u16, value: u16) -> GatewayFuture<'a, ()>;
}
