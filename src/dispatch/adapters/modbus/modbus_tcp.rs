//! Modbus TCP gateway.
//!
//! One lazily opened connection is reused across calls. A failed call
//! invalidates the connection and is retried up to `retry_count` more times
//! (reconnecting first); Modbus exception replies are returned immediately.

use std::net::SocketAddr;
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::Mutex;
use tokio_modbus::client::{tcp, Context};
use tokio_modbus::prelude::*;

use super::{GatewayError, GatewayFuture, ModbusGateway};
use crate::dispatch::core::config::ModbusConfig;

const RETRY_DELAY: Duration = Duration::from_millis(50);

#[derive(Clone, Copy, Debug)]
enum Request {
    ReadCoils(u16, u16),
    WriteCoil(u16, bool),
    ReadDiscrete(u16, u16),
    ReadHolding(u16, u16),
    WriteRegister(u16, u16),
}

enum Reply {
    Bits(Vec<bool>),
    Words(Vec<u16>),
    Done,
}

pub struct ModbusTcpGateway {
    config: ModbusConfig,
    conn: Mutex<Option<Context>>,
}

impl ModbusTcpGateway {
    pub fn new(config: ModbusConfig) -> Self {
        Self {
            config,
            conn: Mutex::new(None),
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms.max(1))
    }

    async fn connect(&self) -> Result<Context, GatewayError> {
        let socket_addr: SocketAddr = format!("{}:{}", self.config.ip, self.config.port)
            .parse()
            .map_err(|e| GatewayError::Comm {
                message: format!("invalid socket addr: {e}"),
            })?;
        debug!("[agv][modbus] connect {socket_addr}");

        match tokio::time::timeout(
            self.timeout(),
            tcp::connect_slave(socket_addr, Slave(self.config.unit_id)),
        )
        .await
        {
            Ok(Ok(ctx)) => Ok(ctx),
            Ok(Err(e)) => Err(GatewayError::Comm {
                message: e.to_string(),
            }),
            Err(_) => Err(GatewayError::Timeout),
        }
    }

    async fn call(&self, request: Request) -> Result<Reply, GatewayError> {
        let mut conn = self.conn.lock().await;
        let mut attempt: u32 = 0;

        loop {
            if conn.is_none() {
                match self.connect().await {
                    Ok(ctx) => *conn = Some(ctx),
                    Err(e) => {
                        if attempt >= self.config.retry_count {
                            return Err(e);
                        }
                        attempt += 1;
                        tokio::time::sleep(RETRY_DELAY).await;
                        continue;
                    }
                }
            }
            let Some(ctx) = conn.as_mut() else {
                continue;
            };

            let result = match tokio::time::timeout(self.timeout(), execute(ctx, request)).await {
                Ok(inner) => inner,
                Err(_) => Err(GatewayError::Timeout),
            };

            match result {
                Ok(reply) => return Ok(reply),
                Err(e @ GatewayError::Exception { .. }) => return Err(e),
                Err(e) => {
                    warn!(
                        "[agv][modbus] invalidate {}:{} request={:?} reason={}",
                        self.config.ip, self.config.port, request, e
                    );
                    *conn = None;
                    if attempt >= self.config.retry_count {
                        return Err(e);
                    }
                    attempt += 1;
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }
    }
}

fn comm(e: impl std::fmt::Display) -> GatewayError {
    GatewayError::Comm {
        message: e.to_string(),
    }
}

fn exception(e: impl std::fmt::Display) -> GatewayError {
    GatewayError::Exception {
        message: e.to_string(),
    }
}

async fn execute(ctx: &mut Context, request: Request) -> Result<Reply, GatewayError> {
    match request {
        Request::ReadCoils(address, count) => {
            let bits = ctx
                .read_coils(address, count)
                .await
                .map_err(comm)?
                .map_err(exception)?;
            Ok(Reply::Bits(bits))
        }
        Request::WriteCoil(address, value) => {
            ctx.write_single_coil(address, value)
                .await
                .map_err(comm)?
                .map_err(exception)?;
            Ok(Reply::Done)
        }
        Request::ReadDiscrete(address, count) => {
            let bits = ctx
                .read_discrete_inputs(address, count)
                .await
                .map_err(comm)?
                .map_err(exception)?;
            Ok(Reply::Bits(bits))
        }
        Request::ReadHolding(address, count) => {
            let words = ctx
                .read_holding_registers(address, count)
                .await
                .map_err(comm)?
                .map_err(exception)?;
            Ok(Reply::Words(words))
        }
        Request::WriteRegister(address, value) => {
            ctx.write_single_register(address, value)
                .await
                .map_err(comm)?
                .map_err(exception)?;
            Ok(Reply::Done)
        }
    }
}

fn unexpected_reply() -> GatewayError {
    GatewayError::Comm {
        message: "unexpected reply shape".to_string(),
    }
}

impl ModbusGateway for ModbusTcpGateway {
    fn read_coils<'a>(&'a self, address: u16, count: u16) -> GatewayFuture<'a, Vec<bool>> {
        Box::pin(async move {
            match self.call(Request::ReadCoils(address, count)).await? {
                Reply::Bits(bits) => Ok(bits),
                _ => Err(unexpected_reply()),
            }
        })
    }

    fn write_coil<'a>(&'a self, address: u16, value: bool) -> GatewayFuture<'a, ()> {
        Box::pin(async move {
            self.call(Request::WriteCoil(address, value)).await?;
            Ok(())
        })
    }

    fn read_discrete_inputs<'a>(&'a self, address: u16, count: u16) -> GatewayFuture<'a, Vec<bool>> {
        Box::pin(async move {
            match self.call(Request::ReadDiscrete(address, count)).await? {
                Reply::Bits(bits) => Ok(bits),
                _ => Err(unexpected_reply()),
            }
        })
    }

    fn read_holding_registers<'a>(&'a self, address: u16, count: u16) -> GatewayFuture<'a, Vec<u16>> {
        Box::pin(async move {
            match self.call(Request::ReadHolding(address, count)).await? {
                Reply::Words(words) => Ok(words),
                _ => Err(unexpected_reply()),
            }
        })
    }

    fn write_register<'a>(&'a self, address: u16, value: u16) -> GatewayFuture<'a, ()> {
        Box::pin(async move {
            self.call(Request::WriteRegister(address, value)).await?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::env;

    #[tokio::test]
    async fn refused_connection_surfaces_after_bounded_retries() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let gateway = ModbusTcpGateway::new(ModbusConfig {
            ip: "127.0.0.1".to_string(),
            port,
            unit_id: 1,
            timeout_ms: 500,
            retry_count: 2,
        });
        let err = gateway.read_coils(0, 1).await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Comm { .. } | GatewayError::Timeout
        ));
    }

    #[tokio::test]
    async fn it_can_read_discrete_inputs_when_enabled() {
        if env::var("AGV_IT_ENABLE").ok().as_deref() != Some("1") {
            return;
        }
        let ip = match env::var("AGV_IT_MODBUS_HOST") {
            Ok(v) => v,
            Err(_) => return,
        };
        let port: u16 = env::var("AGV_IT_MODBUS_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(502);

        let gateway = ModbusTcpGateway::new(ModbusConfig {
            ip,
            port,
            ..ModbusConfig::default()
        });
        let bits = gateway.read_discrete_inputs(0, 4).await.unwrap();
        assert_eq!(bits.len(), 4);
    }
}
