//! Wire message schema and framing.
//!
//! Every message on the wire is a 4-byte big-endian length followed by that
//! many bytes of bincode-encoded [`RpcMessage`]. Frames above
//! [`MAX_FRAME_LEN`] are a protocol error that closes the connection.

use crate::clock::NodeId;
use crate::config::Neighborhood;
use crate::error::{Error, Result};
use crate::versioned::RawVersioned;
use serde::{Deserialize, Serialize};

/// Maximum serialized message length.
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// RPC method discriminator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Method {
    Hello,
    Get,
}

/// Reply status. Anything but `Ok` makes the reply an error reply even when
/// a method-specific body is absent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Ok,
    Unsupported,
    Protocol,
    Error,
}

/// Handshake request: the sender's node ID plus the neighborhoods it knows.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReqHello {
    pub id: NodeId,
    pub neighborhoods: Vec<Neighborhood>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RepHello {}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReqGet {
    pub store: String,
    pub key: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RepGet {
    pub values: Vec<RawVersioned>,
}

/// Request body, one-of by method.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Request {
    Hello(ReqHello),
    Get(ReqGet),
}

/// Method-specific reply body, one-of by method.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ReplyBody {
    Hello(RepHello),
    Get(RepGet),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Reply {
    pub status: Status,
    pub status_message: String,
    pub body: Option<ReplyBody>,
}

/// One framed message: a transaction ID for request/reply correlation, the
/// method, and at most one of request or reply.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcMessage {
    pub xid: u64,
    pub method: Method,
    pub req: Option<Request>,
    pub rep: Option<Reply>,
}

impl RpcMessage {
    pub fn request(xid: u64, req: Request) -> Self {
        let method = match &req {
            Request::Hello(_) => Method::Hello,
            Request::Get(_) => Method::Get,
        };
        RpcMessage {
            xid,
            method,
            req: Some(req),
            rep: None,
        }
    }

    pub fn reply(xid: u64, body: ReplyBody) -> Self {
        let method = match &body {
            ReplyBody::Hello(_) => Method::Hello,
            ReplyBody::Get(_) => Method::Get,
        };
        RpcMessage {
            xid,
            method,
            req: None,
            rep: Some(Reply {
                status: Status::Ok,
                status_message: String::new(),
                body: Some(body),
            }),
        }
    }

    pub fn error_reply(
        xid: u64,
        method: Method,
        status: Status,
        status_message: impl Into<String>,
    ) -> Self {
        RpcMessage {
            xid,
            method,
            req: None,
            rep: Some(Reply {
                status,
                status_message: status_message.into(),
                body: None,
            }),
        }
    }
}

/// Encode a message as a length-prefixed frame.
pub fn encode_frame(message: &RpcMessage) -> Result<Vec<u8>> {
    let body = bincode::serialize(message).map_err(|e| Error::Serialization(e.to_string()))?;
    if body.len() > MAX_FRAME_LEN as usize {
        return Err(Error::Serialization(format!(
            "message length {} exceeds frame limit",
            body.len()
        )));
    }
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode a frame body (the bytes after the length prefix).
pub fn decode_body(body: &[u8]) -> Result<RpcMessage> {
    bincode::deserialize(body).map_err(|e| Error::Serialization(e.to_string()))
}
