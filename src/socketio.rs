use serde_json::Value;
use url::Url;

pub const ENGINE_IO_VERSION: &str = "4";
pub const SOCKET_IO_PATH: &str = "/socket.io/";

pub const JOIN_ORDER_EVENT: &str = "joinOrder";
pub const SEND_LOCATION_EVENT: &str = "sendLocation";

/// Engine.IO v4 text packet.
#[derive(Clone, Debug, PartialEq)]
pub enum EnginePacket {
    Open(Value),
    Close,
    Ping,
    Pong,
    Message(SocketPacket),
    Upgrade,
    Noop,
}

/// Socket.IO v5 packet carried inside an Engine.IO message.
#[derive(Clone, Debug, PartialEq)]
pub enum SocketPacket {
    Connect(Option<Value>),
    Disconnect,
    Event {
        name: String,
        args: Vec<Value>,
    },
    Ack {
        id: u64,
        args: Vec<Value>,
    },
    ConnectError(Value),
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("empty packet")]
    Empty,
    #[error("unknown engine.io packet type {0:?}")]
    UnknownEngineType(char),
    #[error("unknown socket.io packet type {0:?}")]
    UnknownSocketType(char),
    #[error("binary socket.io packets are not supported")]
    Binary,
    #[error("malformed packet payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("socket.io {kind} packet is missing its payload")]
    MissingPayload { kind: &'static str },
    #[error("base url {url} cannot be mapped to a websocket endpoint")]
    Url { url: String },
}

/// Maps an `http(s)` base URL to the Socket.IO websocket-transport endpoint.
///
/// # Errors
///
/// Returns [`CodecError::Url`] when the URL does not use an http or ws scheme.
pub fn socket_url(base: &Url) -> Result<Url, CodecError> {
    let scheme = match base.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        _ => {
            return Err(CodecError::Url {
                url: base.to_string(),
            });
        }
    };

    let mut url = base.clone();
    url.set_scheme(scheme).map_err(|()| CodecError::Url {
        url: base.to_string(),
    })?;
    url.set_path(SOCKET_IO_PATH);
    url.query_pairs_mut()
        .clear()
        .append_pair("EIO", ENGINE_IO_VERSION)
        .append_pair("transport", "websocket");
    Ok(url)
}

#[must_use]
pub fn encode_connect() -> String {
    "40".to_owned()
}

#[must_use]
pub fn encode_disconnect() -> String {
    "41".to_owned()
}

#[must_use]
pub fn encode_pong() -> String {
    "3".to_owned()
}

/// Encodes an event as `42["name", ...args]`.
///
/// # Errors
///
/// Returns [`CodecError::Payload`] when the arguments cannot be serialized.
pub fn encode_event(name: &str, args: &[Value]) -> Result<String, CodecError> {
    let mut frame = Vec::with_capacity(args.len() + 1);
    frame.push(Value::String(name.to_owned()));
    frame.extend(args.iter().cloned());
    Ok(format!("42{}", serde_json::to_string(&frame)?))
}

/// Decodes one Engine.IO text frame.
///
/// # Errors
///
/// Returns [`CodecError`] on unknown packet types or malformed JSON payloads.
pub fn decode(frame: &str) -> Result<EnginePacket, CodecError> {
    let mut chars = frame.chars();
    let kind = chars.next().ok_or(CodecError::Empty)?;
    let rest = chars.as_str();

    match kind {
        '0' => Ok(EnginePacket::Open(parse_or_null(rest)?)),
        '1' => Ok(EnginePacket::Close),
        '2' => Ok(EnginePacket::Ping),
        '3' => Ok(EnginePacket::Pong),
        '4' => decode_socket(rest).map(EnginePacket::Message),
        '5' => Ok(EnginePacket::Upgrade),
        '6' => Ok(EnginePacket::Noop),
        other => Err(CodecError::UnknownEngineType(other)),
    }
}

fn decode_socket(packet: &str) -> Result<SocketPacket, CodecError> {
    let mut chars = packet.chars();
    let kind = chars.next().ok_or(CodecError::Empty)?;
    let body = strip_namespace(chars.as_str());
    let digits = body.chars().take_while(char::is_ascii_digit).count();
    let (ack_id, payload) = body.split_at(digits);
    let ack_id = ack_id.parse::<u64>().ok();

    match kind {
        '0' => {
            if payload.is_empty() {
                Ok(SocketPacket::Connect(None))
            } else {
                Ok(SocketPacket::Connect(Some(serde_json::from_str(payload)?)))
            }
        }
        '1' => Ok(SocketPacket::Disconnect),
        '2' => {
            let mut args = parse_array(payload, "event")?;
            if args.is_empty() {
                return Err(CodecError::MissingPayload { kind: "event" });
            }
            let name = match args.remove(0) {
                Value::String(name) => name,
                _ => return Err(CodecError::MissingPayload { kind: "event" }),
            };
            Ok(SocketPacket::Event { name, args })
        }
        '3' => Ok(SocketPacket::Ack {
            id: ack_id.ok_or(CodecError::MissingPayload { kind: "ack" })?,
            args: parse_array(payload, "ack")?,
        }),
        '4' => Ok(SocketPacket::ConnectError(parse_or_null(payload)?)),
        '5' | '6' => Err(CodecError::Binary),
        other => Err(CodecError::UnknownSocketType(other)),
    }
}

fn strip_namespace(body: &str) -> &str {
    if !body.starts_with('/') {
        return body;
    }
    body.split_once(',').map_or("", |(_, rest)| rest)
}

fn parse_array(payload: &str, kind: &'static str) -> Result<Vec<Value>, CodecError> {
    if payload.is_empty() {
        return Err(CodecError::MissingPayload { kind });
    }
    match serde_json::from_str(payload)? {
        Value::Array(items) => Ok(items),
        _ => Err(CodecError::MissingPayload { kind }),
    }
}

fn parse_or_null(payload: &str) -> Result<Value, CodecError> {
    if payload.is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_str(payload)?)
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use serde_json::json;
    use url::Url;

    use super::{
        CodecError, EnginePacket, SocketPacket, decode, encode_event, socket_url,
    };

    #[test]
    fn socket_url_switches_scheme_and_sets_transport() -> Result<(), Box<dyn Error>> {
        let plain = socket_url(&Url::parse("http://localhost:5000")?)?;
        assert_eq!(
            plain.as_str(),
            "ws://localhost:5000/socket.io/?EIO=4&transport=websocket"
        );

        let secure = socket_url(&Url::parse("https://api.example.com/base?x=1")?)?;
        assert_eq!(
            secure.as_str(),
            "wss://api.example.com/socket.io/?EIO=4&transport=websocket"
        );
        Ok(())
    }

    #[test]
    fn socket_url_rejects_unrelated_scheme() -> Result<(), Box<dyn Error>> {
        let result = socket_url(&Url::parse("ftp://localhost")?);
        assert!(matches!(result, Err(CodecError::Url { .. })));
        Ok(())
    }

    #[test]
    fn event_encoding_prefixes_name() -> Result<(), Box<dyn Error>> {
        let frame = encode_event("sendLocation", &[json!({"orderId": "o1", "lat": 1.5, "lng": 2.5})])?;
        assert_eq!(frame, r#"42["sendLocation",{"lat":1.5,"lng":2.5,"orderId":"o1"}]"#);

        let join = encode_event("joinOrder", &[json!("o1")])?;
        assert_eq!(join, r#"42["joinOrder","o1"]"#);
        Ok(())
    }

    #[test]
    fn decodes_engine_control_packets() -> Result<(), Box<dyn Error>> {
        assert!(matches!(
            decode(r#"0{"sid":"abc","pingInterval":25000}"#)?,
            EnginePacket::Open(value) if value["sid"] == "abc"
        ));
        assert_eq!(decode("1")?, EnginePacket::Close);
        assert_eq!(decode("2")?, EnginePacket::Ping);
        assert_eq!(decode("3")?, EnginePacket::Pong);
        assert_eq!(decode("6")?, EnginePacket::Noop);
        Ok(())
    }

    #[test]
    fn decodes_socket_connect_disconnect_and_errors() -> Result<(), Box<dyn Error>> {
        assert_eq!(
            decode(r#"40{"sid":"xyz"}"#)?,
            EnginePacket::Message(SocketPacket::Connect(Some(json!({"sid": "xyz"}))))
        );
        assert_eq!(decode("40")?, EnginePacket::Message(SocketPacket::Connect(None)));
        assert_eq!(decode("41")?, EnginePacket::Message(SocketPacket::Disconnect));
        assert_eq!(
            decode(r#"44{"message":"unauthorized"}"#)?,
            EnginePacket::Message(SocketPacket::ConnectError(json!({"message": "unauthorized"})))
        );
        Ok(())
    }

    #[test]
    fn decodes_events_with_namespace_and_ack_id() -> Result<(), Box<dyn Error>> {
        assert_eq!(
            decode(r#"42/tracking,7["locationUpdate",{"lat":1}]"#)?,
            EnginePacket::Message(SocketPacket::Event {
                name: "locationUpdate".to_owned(),
                args: vec![json!({"lat": 1})],
            })
        );
        assert_eq!(
            decode(r#"4312["ok"]"#)?,
            EnginePacket::Message(SocketPacket::Ack {
                id: 12,
                args: vec![json!("ok")],
            })
        );
        Ok(())
    }

    #[test]
    fn rejects_unknown_and_binary_packets() {
        assert!(matches!(decode(""), Err(CodecError::Empty)));
        assert!(matches!(decode("9"), Err(CodecError::UnknownEngineType('9'))));
        assert!(matches!(decode("451-[\"x\"]"), Err(CodecError::Binary)));
        assert!(matches!(decode("42{}"), Err(CodecError::MissingPayload { kind: "event" })));
    }
}
