//! Periodic "skip if busy" execution

mod gate;
mod live_loop;

pub use gate::{BusyGate, BusyGuard};
pub use live_loop::{
    invoke_once, Invocation, LiveInferenceLoop, LiveWork, LoopEvent, LoopPolicy, LoopStats,
};
