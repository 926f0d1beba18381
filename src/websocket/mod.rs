//! WebSocket Protocol Engine
//!
//! Hand-rolled RFC 6455 subset for pushing metrics to dashboards.
//!
//! ## Architecture
//!
//! - **frame**: Wire format encoding/decoding over a bounds-checked cursor
//! - **handshake**: Upgrade classification and `Sec-WebSocket-Accept` derivation
//! - **registry**: Bounded set of open connections eligible for broadcast
//!
//! Only unfragmented text and close frames are exchanged. Continuation,
//! ping and pong frames are rejected as protocol errors.
//!
//! ## Example
//!
//! ```javascript
//! // Browser
//! const ws = new WebSocket(`ws://${window.location.host}/ws`);
//!
//! ws.onmessage = (event) => {
//!   const metrics = JSON.parse(event.data); // {"cpu": 42, "memory": 123}
//!   console.log(metrics.cpu);
//! };
//! ```

mod error;
pub mod frame;
pub mod handshake;
mod registry;

pub use error::{ProtocolError, ProtocolResult};
pub use frame::{apply_mask, decode, encode, encode_masked, Frame, FrameCursor, Opcode};
pub use handshake::{derive_accept_key, is_upgrade_request, HandshakeRequest};
pub use registry::{
    outbound_queue, ClientHandle, ClientRegistry, ConnectionId, OutboundFrame, RegistryError,
    OUTBOUND_QUEUE_CAPACITY,
};
