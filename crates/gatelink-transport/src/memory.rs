//! In-memory stream pairs
//!
//! Both ends speak the same framing as a socket-backed stream, so code under
//! test exercises the real codec.

use tokio::io::DuplexStream;

use crate::FramedStream;

/// Buffer size of each direction of the pair
pub const DEFAULT_CAPACITY: usize = 256 * 1024;

/// Create two connected packet streams
pub fn pair() -> (FramedStream<DuplexStream>, FramedStream<DuplexStream>) {
    pair_with_capacity(DEFAULT_CAPACITY)
}

pub fn pair_with_capacity(
    capacity: usize,
) -> (FramedStream<DuplexStream>, FramedStream<DuplexStream>) {
    let (a, b) = tokio::io::duplex(capacity);
    (FramedStream::new(a), FramedStream::new(b))
}
