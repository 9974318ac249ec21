use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MAGIC_HELLO: &[u8; 4] = b"RTHI";
pub const MAGIC_CHALLENGE: &[u8; 4] = b"RTNC";
pub const MAGIC_AUTH: &[u8; 4] = b"RTAU";
pub const MAGIC_AUTH_RESULT: &[u8; 4] = b"RTAR";
const MAGIC_REQUEST: &[u8; 4] = b"RTGR"; // global request
const MAGIC_REPLY: &[u8; 4] = b"RTGA"; // global request ack
const MAGIC_CHANNEL: &[u8; 4] = b"RTFW"; // forwarded channel opened by the peer
const PROTOCOL_V1: u8 = 1;

pub const MAX_FRAME_BYTES: u32 = 1 << 20; // 1 MiB
const MAX_STRING_BYTES: i32 = 64 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("bad magic")]
    BadMagic,
    #[error("unsupported version")]
    BadVersion,
    #[error("payload too large: {0}")]
    PayloadTooLarge(u32),
    #[error("bad string length")]
    BadString,
    #[error("empty rendezvous key")]
    EmptyKey,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub user: String,
    #[serde(default)]
    pub client_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    /// Base64 encoded nonce chosen by the peer.
    pub nonce: String,
    #[serde(default)]
    pub host_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthAttempt {
    pub algorithm: String,
    /// Base64 encoded public key.
    pub public_key: String,
    /// Base64 encoded signature over [`auth_message`].
    pub signature: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResult {
    pub accepted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalRequest {
    pub name: String,
    pub want_reply: bool,
    pub payload: Vec<u8>,
}

/// Bytes a signer commits to: the peer's nonce followed by the user name.
pub fn auth_message(nonce: &[u8], user: &str) -> Vec<u8> {
    let mut m = Vec::with_capacity(nonce.len() + user.len());
    m.extend_from_slice(nonce);
    m.extend_from_slice(user.as_bytes());
    m
}

pub async fn write_json_frame<W: AsyncWrite + Unpin, T: Serialize>(
    w: &mut W,
    magic: &[u8; 4],
    msg: &T,
) -> Result<(), ProtocolError> {
    let b = serde_json::to_vec(msg)?;
    write_header(w, magic).await?;
    write_payload(w, &b).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_json_frame<R: AsyncRead + Unpin, T: DeserializeOwned>(
    r: &mut R,
    magic: &[u8; 4],
) -> Result<T, ProtocolError> {
    read_header(r, magic).await?;
    let buf = read_payload(r).await?;
    Ok(serde_json::from_slice(&buf)?)
}

pub async fn write_global_request<W: AsyncWrite + Unpin>(
    w: &mut W,
    req: &GlobalRequest,
) -> Result<(), ProtocolError> {
    write_header(w, MAGIC_REQUEST).await?;
    write_string(w, &req.name).await?;
    w.write_u8(u8::from(req.want_reply)).await?;
    write_payload(w, &req.payload).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_global_request<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<GlobalRequest, ProtocolError> {
    read_header(r, MAGIC_REQUEST).await?;
    let name = read_string(r).await?;
    let want_reply = r.read_u8().await? != 0;
    let payload = read_payload(r).await?;
    Ok(GlobalRequest {
        name,
        want_reply,
        payload,
    })
}

pub async fn write_global_reply<W: AsyncWrite + Unpin>(
    w: &mut W,
    ok: bool,
    payload: &[u8],
) -> Result<(), ProtocolError> {
    write_header(w, MAGIC_REPLY).await?;
    w.write_u8(u8::from(ok)).await?;
    write_payload(w, payload).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_global_reply<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<(bool, Vec<u8>), ProtocolError> {
    read_header(r, MAGIC_REPLY).await?;
    let ok = r.read_u8().await? != 0;
    let payload = read_payload(r).await?;
    Ok((ok, payload))
}

pub async fn write_channel_header<W: AsyncWrite + Unpin>(
    w: &mut W,
    key: &str,
) -> Result<(), ProtocolError> {
    if key.is_empty() {
        return Err(ProtocolError::EmptyKey);
    }
    write_header(w, MAGIC_CHANNEL).await?;
    write_string(w, key).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_channel_header<R: AsyncRead + Unpin>(r: &mut R) -> Result<String, ProtocolError> {
    read_header(r, MAGIC_CHANNEL).await?;
    let key = read_string(r).await?;
    if key.is_empty() {
        return Err(ProtocolError::EmptyKey);
    }
    Ok(key)
}

async fn write_header<W: AsyncWrite + Unpin>(
    w: &mut W,
    magic: &[u8; 4],
) -> Result<(), ProtocolError> {
    w.write_all(magic).await?;
    w.write_u8(PROTOCOL_V1).await?;
    Ok(())
}

async fn read_header<R: AsyncRead + Unpin>(
    r: &mut R,
    magic: &[u8; 4],
) -> Result<(), ProtocolError> {
    let mut got = [0u8; 4];
    r.read_exact(&mut got).await?;
    if &got != magic {
        return Err(ProtocolError::BadMagic);
    }
    let ver = r.read_u8().await?;
    if ver != PROTOCOL_V1 {
        return Err(ProtocolError::BadVersion);
    }
    Ok(())
}

async fn write_payload<W: AsyncWrite + Unpin>(w: &mut W, b: &[u8]) -> Result<(), ProtocolError> {
    let n: u32 = b.len().try_into().unwrap_or(u32::MAX);
    if n > MAX_FRAME_BYTES {
        return Err(ProtocolError::PayloadTooLarge(n));
    }
    w.write_u32(n).await?;
    w.write_all(b).await?;
    Ok(())
}

async fn read_payload<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<u8>, ProtocolError> {
    let n = r.read_u32().await?;
    if n > MAX_FRAME_BYTES {
        return Err(ProtocolError::PayloadTooLarge(n));
    }
    let mut buf = vec![0u8; n as usize];
    r.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn write_string<W: AsyncWrite + Unpin>(w: &mut W, s: &str) -> Result<(), ProtocolError> {
    let b = s.as_bytes();
    let len: i32 = b.len().try_into().map_err(|_| ProtocolError::BadString)?;
    if len > MAX_STRING_BYTES {
        return Err(ProtocolError::BadString);
    }
    write_varint(w, len).await?;
    w.write_all(b).await?;
    Ok(())
}

async fn read_string<R: AsyncRead + Unpin>(r: &mut R) -> Result<String, ProtocolError> {
    let len = read_varint(r).await?;
    if !(0..=MAX_STRING_BYTES).contains(&len) {
        return Err(ProtocolError::BadString);
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf).await?;
    String::from_utf8(buf).map_err(|_| ProtocolError::BadString)
}

async fn write_varint<W: AsyncWrite + Unpin>(w: &mut W, mut v: i32) -> Result<(), ProtocolError> {
    loop {
        let mut temp = (v & 0x7f) as u8;
        v = ((v as u32) >> 7) as i32;
        if v != 0 {
            temp |= 0x80;
        }
        w.write_u8(temp).await?;
        if v == 0 {
            break;
        }
    }
    Ok(())
}

async fn read_varint<R: AsyncRead + Unpin>(r: &mut R) -> Result<i32, ProtocolError> {
    let mut num_read = 0;
    let mut result: i32 = 0;
    loop {
        let read = r.read_u8().await?;
        let value = (read & 0x7F) as i32;
        result |= value << (7 * num_read);

        num_read += 1;
        if num_read > 5 {
            return Err(ProtocolError::BadString);
        }

        if (read & 0x80) == 0 {
            break;
        }
    }
    Ok(result)
}
