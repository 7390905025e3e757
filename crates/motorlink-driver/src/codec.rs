//! Request encoding and frame decoding.

use bytes::{BufMut, Bytes, BytesMut};
use motorlink_core::Frame;
use thiserror::Error;

/// A request to the motor controller.
#[derive(Debug, Clone, PartialEq)]
pub enum Request<'a> {
    /// Read a set of parameters.
    Parameters(&'a [String]),
    /// A named command from the controller's command dictionary.
    Named(&'a str),
    /// Set the target velocity.
    SetVelocity(f64),
    /// Set the target current.
    SetCurrent(f64),
    /// Initialization packet sent once after the link opens.
    Init,
    /// Link-layer bring-up on the given adapter.
    BringUp(&'a str),
}

impl Request<'_> {
    /// Short name used in logs and acknowledgements.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Parameters(_) => "parameters",
            Self::Named(_) => "command",
            Self::SetVelocity(_) => "set_velocity",
            Self::SetCurrent(_) => "set_current",
            Self::Init => "init",
            Self::BringUp(_) => "boot",
        }
    }
}

/// A decoded response frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// Telemetry values in the order they appeared in the frame.
    Values(Vec<(String, i64)>),
    /// The controller acknowledged a request.
    Ack(String),
}

/// Codec error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Request cannot be encoded: {0}")]
    InvalidRequest(String),
    #[error("Malformed frame: {0}")]
    Malformed(String),
    #[error("Controller rejected request: {0}")]
    Rejected(String),
}

/// Encoding of requests and decoding of response frames for one controller family.
pub trait MotorCodec: Send + Sync {
    /// Encode a request into one frame.
    ///
    /// # Errors
    /// Returns [`CodecError::InvalidRequest`] if the request cannot be represented.
    fn encode(&self, request: &Request<'_>) -> Result<Bytes, CodecError>;

    /// Decode one received frame.
    ///
    /// # Errors
    /// Returns error if the frame is malformed or reports a rejection.
    fn decode(&self, frame: &Frame) -> Result<Decoded, CodecError>;
}

/// Newline-delimited text codec.
///
/// Requests: `GET k1,k2`, `CMD name`, `SET velocity v`, `SET current v`,
/// `INIT`, `BOOT adapter`. Responses: `k1=v1;k2=v2`, `ACK what`, `ERR reason`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LineCodec;

fn check_token(what: &str, token: &str) -> Result<(), CodecError> {
    if token.is_empty() {
        return Err(CodecError::InvalidRequest(format!("{what} is empty")));
    }
    if token.contains(['\n', '\r']) {
        return Err(CodecError::InvalidRequest(format!(
            "{what} contains a line break"
        )));
    }
    Ok(())
}

fn check_finite(what: &str, value: f64) -> Result<(), CodecError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(CodecError::InvalidRequest(format!("{what} is not finite")))
    }
}

impl MotorCodec for LineCodec {
    fn encode(&self, request: &Request<'_>) -> Result<Bytes, CodecError> {
        let line = match request {
            Request::Parameters(params) => {
                if params.is_empty() {
                    return Err(CodecError::InvalidRequest("no parameters".to_string()));
                }
                for param in *params {
                    check_token("parameter", param)?;
                    if param.contains(',') {
                        return Err(CodecError::InvalidRequest(format!(
                            "parameter `{param}` contains a comma"
                        )));
                    }
                }
                format!("GET {}", params.join(","))
            }
            Request::Named(name) => {
                check_token("command", name)?;
                format!("CMD {name}")
            }
            Request::SetVelocity(v) => {
                check_finite("velocity", *v)?;
                format!("SET velocity {v}")
            }
            Request::SetCurrent(c) => {
                check_finite("current", *c)?;
                format!("SET current {c}")
            }
            Request::Init => "INIT".to_string(),
            Request::BringUp(adapter) => {
                check_token("adapter", adapter)?;
                format!("BOOT {adapter}")
            }
        };

        let mut buf = BytesMut::with_capacity(line.len() + 1);
        buf.put_slice(line.as_bytes());
        buf.put_u8(b'\n');
        Ok(buf.freeze())
    }

    fn decode(&self, frame: &Frame) -> Result<Decoded, CodecError> {
        let text = std::str::from_utf8(frame.as_bytes())
            .map_err(|_| CodecError::Malformed("not utf-8".to_string()))?
            .trim();

        if text.is_empty() {
            return Err(CodecError::Malformed("empty frame".to_string()));
        }
        if let Some(what) = text.strip_prefix("ACK ") {
            return Ok(Decoded::Ack(what.trim().to_string()));
        }
        if let Some(reason) = text.strip_prefix("ERR ") {
            return Err(CodecError::Rejected(reason.trim().to_string()));
        }

        text.split(';')
            .map(|pair| {
                let (key, value) = pair
                    .split_once('=')
                    .ok_or_else(|| CodecError::Malformed(format!("`{pair}` is not key=value")))?;
                let key = key.trim();
                if key.is_empty() {
                    return Err(CodecError::Malformed(format!("`{pair}` has no key")));
                }
                let value = value
                    .trim()
                    .parse::<i64>()
                    .map_err(|e| CodecError::Malformed(format!("`{pair}`: {e}")))?;
                Ok((key.to_string(), value))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Decoded::Values)
    }
}
