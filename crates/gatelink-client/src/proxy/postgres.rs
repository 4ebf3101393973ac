//! Postgres front-end framing
//!
//! Only the simple query protocol is relayed. A simple query (`Q`) message is
//! held back until it is complete so that the gateway can inspect the whole
//! statement; the extended query protocol starts with a `Parse` (`P`) message
//! and is refused.

use super::framing::Framer;
use super::ProxyError;

/// Largest simple query accepted from a native client
pub const MAX_QUERY_SIZE: usize = 1024 * 1024;

const QUERY: u8 = b'Q';
const PARSE: u8 = b'P';

#[derive(Debug, Default)]
pub struct PgFramer {
    pending: Vec<u8>,
}

impl PgFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total size of the message starting at `buf[0]`, type byte included
    fn message_size(buf: &[u8]) -> Option<usize> {
        let len = buf.get(1..5)?;
        Some(1 + u32::from_be_bytes([len[0], len[1], len[2], len[3]]) as usize)
    }

    fn check_size(size: usize) -> Result<(), ProxyError> {
        if size > MAX_QUERY_SIZE {
            return Err(ProxyError::QueryTooBig { size });
        }
        Ok(())
    }
}

impl Framer for PgFramer {
    fn push(&mut self, data: &[u8]) -> Result<Vec<Vec<u8>>, ProxyError> {
        if !self.pending.is_empty() {
            self.pending.extend_from_slice(data);
            let Some(size) = Self::message_size(&self.pending) else {
                return Ok(Vec::new());
            };
            Self::check_size(size)?;
            if self.pending.len() < size {
                return Ok(Vec::new());
            }
            return Ok(vec![std::mem::take(&mut self.pending)]);
        }

        match data.first() {
            None => Ok(Vec::new()),
            Some(&PARSE) => Err(ProxyError::ExtendedQueryUnsupported),
            Some(&QUERY) => match Self::message_size(data) {
                Some(size) if size <= data.len() => Ok(vec![data.to_vec()]),
                Some(size) => {
                    Self::check_size(size)?;
                    self.pending = data.to_vec();
                    Ok(Vec::new())
                }
                None => {
                    self.pending = data.to_vec();
                    Ok(Vec::new())
                }
            },
            Some(_) => Ok(vec![data.to_vec()]),
        }
    }
}
