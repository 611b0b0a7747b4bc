//! IPC bridge between the controller and a helper process.
//!
//! # Architecture
//!
//! - **codec**: length-prefixed framing for AsyncRead/AsyncWrite
//! - **pool**: reusable frame buffers
//! - **protocol**: the closed command set and its argument/reply shapes
//! - **transport**: platform channel endpoints (sockets, named pipes)

pub mod codec;
pub mod pool;
pub mod protocol;
pub mod transport;
