pub mod error;

pub mod adapters;
pub mod core;
pub mod usecase;

// Short paths used by callers and integration tests.
pub use adapters::fleet;
pub use adapters::modbus;
pub use adapters::plc;
pub use adapters::storage;
pub use adapters::store;
pub use adapters::ui;
pub use core::config;
pub use core::device;
pub use core::frame;
pub use core::model;
pub use core::sub_op;
pub use usecase::bootstrap;
pub use usecase::executor;
pub use usecase::orchestrator;
pub use usecase::policy;
