//! Chat Backend Abstraction
//!
//! Trait-based seam between the streaming core and the network. The core only
//! ever sees [`ChatBackend`]; the HTTP implementation talks to the real
//! service, and tests substitute scripted backends.

pub mod http;
pub mod traits;

pub use http::HttpBackend;
pub use traits::{
    ChatBackend, ChatRequest, ChatTurn, ResponseMode, SingleResponse, StreamHandle, StreamUpdate,
    TransportError,
};
