//! Wire framing: length-prefixed MsgPack headers plus raw bodies.
//!
//! Every frame is `u32-be length` followed by that many bytes. Requests
//! and responses are two frames each: the MsgPack header, then the body
//! (possibly empty). Membership transports reuse the single-frame helpers
//! for their own message enums.

use herd_core::proto::{SdReq, SdRsp};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on any single frame; a 4 MiB object plus headers fits
/// comfortably.
pub const MAX_FRAME: u32 = 64 << 20;

fn invalid(msg: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg.to_string())
}

// ---------------------------------------------------------------------------
// Single frames
// ---------------------------------------------------------------------------

/// Write one MsgPack-encoded message frame.
pub async fn write_msg<W, T>(w: &mut W, msg: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = rmp_serde::to_vec_named(msg).map_err(|e| invalid(&e.to_string()))?;
    if bytes.len() as u64 > u64::from(MAX_FRAME) {
        return Err(invalid("frame too large"));
    }
    w.write_u32(bytes.len() as u32).await?;
    w.write_all(&bytes).await?;
    w.flush().await
}

/// Read one MsgPack-encoded message frame.
pub async fn read_msg<R, T>(r: &mut R) -> std::io::Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = r.read_u32().await?;
    if len > MAX_FRAME {
        return Err(invalid("frame too large"));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf).await?;
    rmp_serde::from_slice(&buf).map_err(|e| invalid(&e.to_string()))
}

async fn write_body<W: AsyncWrite + Unpin>(w: &mut W, body: &[u8]) -> std::io::Result<()> {
    if body.len() as u64 > u64::from(MAX_FRAME) {
        return Err(invalid("body too large"));
    }
    w.write_u32(body.len() as u32).await?;
    w.write_all(body).await?;
    w.flush().await
}

async fn read_body<R: AsyncRead + Unpin>(r: &mut R) -> std::io::Result<Vec<u8>> {
    let len = r.read_u32().await?;
    if len > MAX_FRAME {
        return Err(invalid("body too large"));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf).await?;
    Ok(buf)
}

// ---------------------------------------------------------------------------
// Request / response pairs
// ---------------------------------------------------------------------------

/// Write a request header and its body.
///
/// `data_length` is opcode-dependent (the requested length for reads,
/// the payload length for writes) and is passed through untouched; the
/// body travels under its own length prefix. A write-class header that
/// never set the field is filled in from the body.
pub async fn write_req<W: AsyncWrite + Unpin>(
    w: &mut W,
    req: &SdReq,
    body: &[u8],
) -> std::io::Result<()> {
    let mut req = req.clone();
    if req.data_length == 0 && !body.is_empty() {
        req.data_length = body.len() as u32;
    }
    write_msg(w, &req).await?;
    write_body(w, body).await
}

/// Read a request header and its body.
pub async fn read_req<R: AsyncRead + Unpin>(r: &mut R) -> std::io::Result<(SdReq, Vec<u8>)> {
    let req: SdReq = read_msg(r).await?;
    let body = read_body(r).await?;
    Ok((req, body))
}

/// Write a response header and its body.
pub async fn write_rsp<W: AsyncWrite + Unpin>(
    w: &mut W,
    rsp: &SdRsp,
    body: &[u8],
) -> std::io::Result<()> {
    let mut rsp = rsp.clone();
    rsp.data_length = body.len() as u32;
    write_msg(w, &rsp).await?;
    write_body(w, body).await
}

/// Read a response header and its body.
pub async fn read_rsp<R: AsyncRead + Unpin>(r: &mut R) -> std::io::Result<(SdRsp, Vec<u8>)> {
    let rsp: SdRsp = read_msg(r).await?;
    let body = read_body(r).await?;
    Ok((rsp, body))
}

/// Execute one request over `stream`: send, then await the response.
pub async fn exec_req(
    stream: &mut tokio::net::TcpStream,
    req: &SdReq,
    body: &[u8],
) -> std::io::Result<(SdRsp, Vec<u8>)> {
    let (mut r, mut w) = stream.split();
    write_req(&mut w, req, body).await?;
    read_rsp(&mut r).await
}
