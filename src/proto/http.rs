//! HTTP bodies as synthetic packets.
//!
//! HTTP is request/response, so it skips the streaming decoder. A body is
//! one of:
//!
//! * a hex-encoded frame, `"55aa01000000fe"`, decoded with the one-shot
//!   codec (no result byte);
//! * a JSON object, `{"cmd": "2a", "data": "0105"}`, with optional
//!   `"result"` (hex byte) and `"length"` (checked against `data`).
//!
//! Replies are always JSON in the same shape with `result` filled in.

use serde::{Deserialize, Serialize};

use super::codec::{self, Packet};
use super::engine::ProtocolEngine;
use super::router::Outbound;
use super::transport::TransportId;
use crate::app::ports::Ports;
use crate::error::{DispatchError, Error};

#[derive(Debug, Deserialize)]
struct HttpCommand {
    cmd: String,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    length: Option<usize>,
    #[serde(default)]
    data: String,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
struct HttpReply {
    cmd: String,
    result: String,
    length: usize,
    data: String,
}

fn hex_byte(text: &str) -> Result<u8, Error> {
    let mut out = [0u8; 1];
    hex::decode_to_slice(text.trim(), &mut out)
        .map_err(|_| Error::Dispatch(DispatchError::InvalidPayload("expected one hex byte")))?;
    Ok(out[0])
}

/// Turn a request body into the packet it carries.
pub fn parse_body(body: &[u8]) -> Result<Packet, Error> {
    let text = core::str::from_utf8(body)
        .map_err(|_| Error::Dispatch(DispatchError::InvalidPayload("body is not UTF-8")))?
        .trim();

    if text.get(..4).is_some_and(|head| head.eq_ignore_ascii_case("55aa")) {
        let bytes = hex::decode(text)
            .map_err(|_| Error::Dispatch(DispatchError::InvalidPayload("frame is not hex")))?;
        return Ok(codec::decode(&bytes, false)?);
    }

    let req: HttpCommand = serde_json::from_str(text)
        .map_err(|_| Error::Dispatch(DispatchError::InvalidPayload("body is not a command")))?;
    let command = hex_byte(&req.cmd)?;
    let result = req.result.as_deref().map(hex_byte).transpose()?;
    let payload = hex::decode(req.data.trim())
        .map_err(|_| Error::Dispatch(DispatchError::InvalidPayload("data is not hex")))?;
    if req.length.is_some_and(|len| len != payload.len()) {
        return Err(Error::Dispatch(DispatchError::InvalidPayload(
            "length does not match data",
        )));
    }
    Ok(Packet::new(command, result, payload))
}

/// JSON body for a reply packet.
pub fn reply_body(reply: &Packet) -> String {
    let body = HttpReply {
        cmd: hex::encode([reply.command]),
        result: hex::encode([reply.result.unwrap_or(codec::RESULT_OK)]),
        length: reply.payload.len(),
        data: hex::encode(&reply.payload),
    };
    serde_json::to_string(&body).unwrap_or_default()
}

/// Run one HTTP body through the engine.
///
/// Returns the reply body (`None` when the command has no reply) and any
/// frames the command produced for other transports.
pub fn handle_body(
    engine: &mut ProtocolEngine,
    body: &[u8],
    now_ms: u64,
    ports: &mut Ports<'_>,
) -> Result<(Option<String>, Vec<Outbound>), Error> {
    let packet = parse_body(body)?;
    let (reply, outbound) = engine.exchange(TransportId::Http, &packet, now_ms, ports);
    Ok((reply.as_ref().map(reply_body), outbound))
}
