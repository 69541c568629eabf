//! Call lifecycle orchestration: one streaming session and one audio pipeline
//! per call, driven by call state changes.

pub mod metrics;
pub mod orchestrator;
pub mod registry;
pub mod screening;
pub mod types;

pub use orchestrator::{CallHandle, CallOrchestrator, CallServices};
pub use registry::CallRegistry;
pub use screening::CallScreener;
pub use types::{CallCommand, CallEvent, CallInfo, CallState, DisconnectCause};
