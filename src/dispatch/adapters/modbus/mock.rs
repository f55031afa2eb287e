use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{GatewayError, GatewayFuture, ModbusGateway};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GatewayWrite {
    Coil { address: u16, value: bool },
    Register { address: u16, value: u16 },
}

#[derive(Default)]
struct GatewayState {
    coils: HashMap<u16, bool>,
    inputs: HashMap<u16, bool>,
    registers: HashMap<u16, u16>,
    writes: Vec<GatewayWrite>,
    fail_next: u32,
}

/// In-memory Modbus image. Unset addresses read as `false` / `0`.
#[derive(Clone, Default)]
pub struct MemoryGateway {
    state: Arc<Mutex<GatewayState>>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_input(&self, address: u16, value: bool) {
        self.state.lock().inputs.insert(address, value);
    }

    pub fn set_register(&self, address: u16, value: u16) {
        self.state.lock().registers.insert(address, value);
    }

    pub fn coil(&self, address: u16) -> bool {
        self.state
            .lock()
            .coils
            .get(&address)
            .copied()
            .unwrap_or(false)
    }

    pub fn writes(&self) -> Vec<GatewayWrite> {
        self.state.lock().writes.clone()
    }

    /// The next `count` calls fail with a comm error.
    pub fn fail_next(&self, count: u32) {
        self.state.lock().fail_next = count;
    }

    fn check_fault(state: &mut GatewayState) -> Result<(), GatewayError> {
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(GatewayError::Comm {
                message: "injected fault".to_string(),
            });
        }
        Ok(())
    }

    fn read_bits(
        &self,
        pick: fn(&GatewayState) -> &HashMap<u16, bool>,
        address: u16,
        count: u16,
    ) -> Result<Vec<bool>, GatewayError> {
        let mut state = self.state.lock();
        Self::check_fault(&mut state)?;
        let map = pick(&state);
        Ok((0..count)
            .map(|i| {
                map.get(&address.wrapping_add(i))
                    .copied()
                    .unwrap_or(false)
            })
            .collect())
    }
}

impl ModbusGateway for MemoryGateway {
    fn read_coils<'a>(&'a self, address: u16, count: u16) -> GatewayFuture<'a, Vec<bool>> {
        Box::pin(async move { self.read_bits(|s| &s.coils, address, count) })
    }

    fn write_coil<'a>(&'a self, address: u16, value: bool) -> GatewayFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.lock();
            Self::check_fault(&mut state)?;
            state.coils.insert(address, value);
            state.writes.push(GatewayWrite::Coil { address, value });
            Ok(())
        })
    }

    fn read_discrete_inputs<'a>(&'a self, address: u16, count: u16) -> GatewayFuture<'a, Vec<bool>> {
        Box::pin(async move { self.read_bits(|s| &s.inputs, address, count) })
    }

    fn read_holding_registers<'a>(&'a self, address: u16, count: u16) -> GatewayFuture<'a, Vec<u16>> {
        Box::pin(async move {
            let mut state = self.state.lock();
            Self::check_fault(&mut state)?;
            Ok((0..count)
                .map(|i| {
                    state
                        .registers
                        .get(&address.wrapping_add(i))
                        .copied()
                        .unwrap_or(0)
                })
                .collect())
        })
    }

    fn write_register<'a>(&'a self, address: u16, value: u16) -> GatewayFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.lock();
            Self::check_fault(&mut state)?;
            state.registers.insert(address, value);
            state.writes.push(GatewayWrite::Register { address, value });
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn coils_and_inputs_are_separate_images() {
        let gateway = MemoryGateway::new();
        gateway.set_input(3, true);
        gateway.write_coil(3, true).await.unwrap();

        assert_eq!(
            gateway.read_discrete_inputs(2, 3).await.unwrap(),
            vec![false, true, false]
        );
        assert!(gateway.coil(3));
        assert_eq!(
            gateway.writes(),
            vec![GatewayWrite::Coil {
                address: 3,
                value: true
            }]
        );
    }

    #[tokio::test]
    async fn injected_faults_are_consumed() {
        let gateway = MemoryGateway::new();
        gateway.fail_next(1);
        assert!(gateway.read_coils(0, 1).await.is_err());
        assert_eq!(gateway.read_coils(0, 1).await.unwrap(), vec![false]);
    }
}
