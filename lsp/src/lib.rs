//! LSP session core: multiplexes requests over one ordered transport,
//! correlates responses, routes server-initiated traffic, and reconnects.

pub mod codec;
pub mod protocol;
pub mod types;

mod correlator;
mod dispatcher;
mod error;
mod framing;
mod memory;
mod session;
mod transport;
mod websocket;

pub use correlator::{CompletionHandle, Correlator, PendingCall};
pub use dispatcher::Dispatcher;
pub use error::{
    CallError, ConnectError, MalformedEnvelope, SendError, SessionError, TransportError,
    UnmatchedResponse,
};
pub use framing::{FrameReader, FrameWriter, MAX_FRAME_BYTES};
pub use memory::{MemoryPeer, MemoryServer, MemoryTransport};
pub use protocol::{Envelope, Notification, Request, RequestId, Response, RpcError};
pub use session::{PendingRequest, Session};
pub use transport::{Connection, FrameSink, FrameSource, TcpTransport, Transport};
pub use types::{SessionConfig, SessionState};
pub use websocket::WebSocketTransport;
