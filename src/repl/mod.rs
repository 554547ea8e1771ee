//! REPL transport: length-prefixed JSON frames over a pair of TCP
//! connections (input and output) to the in-container kernel runner.

pub mod channel;
pub mod codec;
pub mod loopback;

pub use channel::{socket_addr, ReplChannel, ReplTransport, TcpReplChannel, TcpReplTransport};
pub use codec::ReplOp;
pub use loopback::{canned_reply, LoopbackTransport, Responder};
