pub mod fleet;
pub mod modbus;
pub mod plc;
pub mod storage;
pub mod store;
pub mod ui;
