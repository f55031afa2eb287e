//! AGV/AMR transport dispatch: mission orchestration over a fleet API, with
//! MC-protocol PLC exchanges and rack bookkeeping around each robot move.

pub mod dispatch;
