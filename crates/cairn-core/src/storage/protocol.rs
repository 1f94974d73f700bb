//! Wire format for the network storage backend: length-prefixed msgpack
//! frames over a persistent connection. Requests carry a client-assigned
//! id; replies echo it so the client can match them out of order.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::error::{CairnError, Result};

/// Current protocol version, sent with every request.
pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound on a single frame. Comfortably above the largest packfile
/// the engine writes; anything bigger is a corrupt or hostile peer.
pub const MAX_FRAME_SIZE: u32 = 256 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: u64,
    pub version: u32,
    pub body: Request,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    Get { key: String },
    Put { key: String, data: Vec<u8> },
    Delete { key: String },
    Exists { key: String },
    List { prefix: String },
    GetRange { key: String, offset: u64, length: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    pub id: u64,
    pub body: Reply,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Reply {
    Data(Option<Vec<u8>>),
    Unit,
    Bool(bool),
    Keys(Vec<String>),
    Error(String),
}

/// Write one `length(u32 LE) || msgpack` frame.
pub fn write_frame<T: Serialize>(w: &mut impl Write, value: &T) -> Result<()> {
    let body = rmp_serde::to_vec(value)?;
    if body.len() as u64 > MAX_FRAME_SIZE as u64 {
        return Err(CairnError::InvalidFormat(format!(
            "frame too large: {} bytes",
            body.len()
        )));
    }
    w.write_all(&(body.len() as u32).to_le_bytes())?;
    w.write_all(&body)?;
    w.flush()?;
    Ok(())
}

/// Read one frame written by [`write_frame`].
pub fn read_frame<T: for<'de> Deserialize<'de>>(r: &mut impl Read) -> Result<T> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf)?;
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME_SIZE {
        return Err(CairnError::InvalidFormat(format!(
            "frame too large: {len} bytes"
        )));
    }
    let mut body = vec![0u8; len as usize];
    r.read_exact(&mut body)?;
    Ok(rmp_serde::from_slice(&body)?)
}
