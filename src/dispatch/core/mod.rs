//! Pure data and codecs: no sockets, no clocks beyond timestamps.

pub mod config;
pub mod device;
pub mod frame;
pub mod model;
pub mod sub_op;
