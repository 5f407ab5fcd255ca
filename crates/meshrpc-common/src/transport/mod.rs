//! Wire framing for meshrpc TCP streams.
//!
//! The transport is opaque bytes below the frame level: no TLS, no
//! compression. [`FrameCodec`] turns a raw byte stream into [`Frame`]s and
//! back, enforcing a maximum frame size to bound allocations.
//!
//! [`Frame`]: crate::protocol::frame::Frame

pub mod codec;

pub use codec::FrameCodec;
