//! Breakpoints: rules that suspend matching traffic until an operator
//! decides to continue, step or drop it.

pub mod listener;
pub mod manager;
pub mod registry;
pub mod rule;

pub use listener::{BreakpointListener, BREAKPOINT_LISTENER_ORDER};
pub use manager::{BreakDecision, BreakHandler, BreakManager, HeldMessage};
pub use registry::{BreakpointRegistry, BreakpointSummary, HeldKind};
pub use rule::{BreakpointKind, BreakpointRule};
