//! Live streaming session: transport, framing, outbound workers, inbound dispatch.

pub mod memory;
pub mod session;
pub mod state;
pub mod transport;

pub use memory::{MemoryConnector, MemoryPeer};
pub use session::StreamingSession;
pub use state::SessionState;
pub use transport::{Connector, WebSocketConnector, WireFrame};
