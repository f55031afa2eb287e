//! PLC access over the MC protocol (3E binary frame).

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

use crate::dispatch::core::device::{DeviceAddress, DeviceError};
use crate::dispatch::core::frame::FrameError;

pub mod mc_client;
pub mod mock;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlcError {
    #[error("timeout")]
    Timeout,

    #[error("comm error: {message}")]
    Comm { message: String },

    #[error("protocol error: {0}")]
    Frame(#[from] FrameError),

    #[error("device error: {0}")]
    Device(#[from] DeviceError),
}

impl PlcError {
    /// Socket-level failures that a later attempt may not hit.
    pub fn is_transient(&self) -> bool {
        matches!(self, PlcError::Timeout | PlcError::Comm { .. })
    }
}

pub type PlcFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, PlcError>> + Send + 'a>>;

/// The per-call helper surface the sub-operation executor drives.
///
/// Implementations open a connection for each call and close it afterwards;
/// callers never hold a session through this trait.
pub trait PlcPort: Send + Sync {
    fn read_word<'a>(&'a self, address: DeviceAddress) -> PlcFuture<'a, u16>;

    fn write_word<'a>(&'a self, address: DeviceAddress, value: u16) -> PlcFuture<'a, ()>;

    fn read_string<'a>(&'a self, address: DeviceAddress, words: u16) -> PlcFuture<'a, String>;

    fn write_string<'a>(
        &'a self,
        address: DeviceAddress,
        words: u16,
        text: &'a str,
    ) -> PlcFuture<'a, ()>;

    fn read_int32<'a>(&'a self, address: DeviceAddress) -> PlcFuture<'a, i32>;

    fn write_int32<'a>(&'a self, address: DeviceAddress, value: i32) -> PlcFuture<'a, ()>;
}
