//! Meshrpc Common Types and Wire Protocol
//!
//! This crate provides the shared protocol definitions for the meshrpc
//! cluster RPC runtime: the cluster data model, the length-prefixed wire
//! frame and its codec, and the error taxonomy used by every component.
//!
//! # Components
//!
//! - [`cluster`] - `Node` and `Endpoint` types describing cluster members
//! - [`protocol`] - `Frame` and the closed error taxonomy
//! - [`transport`] - the `FrameCodec` encoder/decoder for TCP streams
//!
//! # Wire Format
//!
//! Frames are length-delimited by a little-endian `u32` prefix. The payload
//! carries a 16-byte correlation identifier, an optional request-name string,
//! a priority integer and the opaque body bytes:
//!
//! ```text
//! [u32 length] [16-byte id] [u16 name len][name bytes] [i32 priority] [body]
//! ```

pub mod cluster;
pub mod protocol;
pub mod transport;

pub use cluster::{Endpoint, Node};
pub use protocol::error::{FailedRequest, Result, RpcError};
pub use protocol::frame::Frame;
pub use transport::codec::FrameCodec;
