//! WebSocket protocol layer: handshake dialects, frame codec, session
//! state machine, and the permessage-deflate extension.

pub mod deflate;
pub mod frame;
pub mod handshake;
pub mod mask;
pub mod session;

pub use deflate::{DeflateOptions, DeflateParams};
pub use frame::{FrameEvent, FrameHeader, FrameParser, OpCode};
pub use handshake::{select_dialect, Dialect};
pub use session::{Session, SessionEvent, SessionState};
