//! Stream codecs for the two wire protocols.
//!
//! - `JsonCodec`: 4-byte big-endian length prefix + JSON, used for event push.
//! - `NdJsonCodec`: one JSON document per line, used for the control protocol.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Serialize, de::DeserializeOwned};
use std::io;
use std::marker::PhantomData;
use tokio_util::codec::{Decoder, Encoder};

/// Default frame limit (16 MB)
pub const DEFAULT_MAX_FRAME: usize = 16 * 1024 * 1024;

fn invalid_data(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

fn check_length(length: usize, max_length: usize) -> io::Result<()> {
    if length > max_length {
        return Err(invalid_data(format!("Frame too large: {} > {}", length, max_length)));
    }
    Ok(())
}

fn to_json<T: Serialize>(item: &T, max_length: usize) -> io::Result<Vec<u8>> {
    let json = serde_json::to_vec(item).map_err(|e| invalid_data(format!("JSON encode: {}", e)))?;
    check_length(json.len(), max_length)?;
    Ok(json)
}

fn from_json<T: DeserializeOwned>(data: &[u8]) -> io::Result<T> {
    serde_json::from_slice(data).map_err(|e| invalid_data(format!("JSON decode: {}", e)))
}

/// Length-prefixed JSON codec.
#[derive(Debug)]
pub struct JsonCodec<T> {
    _phantom: PhantomData<T>,
    max_length: usize,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_FRAME)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            _phantom: PhantomData,
            max_length,
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonCodec<T> {
    fn clone(&self) -> Self {
        Self::with_max_length(self.max_length)
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<T>> {
        if src.len() < 4 {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        check_length(length, self.max_length)?;

        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        src.advance(4);
        let frame = src.split_to(length);
        from_json(&frame).map(Some)
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> io::Result<()> {
        let json = to_json(&item, self.max_length)?;
        dst.reserve(4 + json.len());
        dst.put_u32(json.len() as u32);
        dst.put_slice(&json);
        Ok(())
    }
}

/// Newline-delimited JSON codec.
#[derive(Debug)]
pub struct NdJsonCodec<T> {
    _phantom: PhantomData<T>,
    max_length: usize,
}

impl<T> NdJsonCodec<T> {
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_FRAME)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            _phantom: PhantomData,
            max_length,
        }
    }
}

impl<T> Default for NdJsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for NdJsonCodec<T> {
    fn clone(&self) -> Self {
        Self::with_max_length(self.max_length)
    }
}

impl<T: DeserializeOwned> Decoder for NdJsonCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<T>> {
        loop {
            let Some(pos) = src.iter().position(|&b| b == b'\n') else {
                check_length(src.len(), self.max_length)?;
                return Ok(None);
            };
            check_length(pos, self.max_length)?;

            let line = src.split_to(pos);
            src.advance(1);

            // Blank keep-alive lines are skipped
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return from_json(&line).map(Some);
        }
    }
}

impl<T: Serialize> Encoder<T> for NdJsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> io::Result<()> {
        let json = to_json(&item, self.max_length)?;
        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }
}
