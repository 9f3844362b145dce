//! Discrete message units exchanged over an upgraded connection.
//!
//! Kind values follow websocket opcode numbering so frames map one-to-one
//! onto whatever codec performs the upgrade.

use bytes::Bytes;
use std::fmt;

use crate::error::FrameError;

/// Kind of a [`Frame`], with its wire value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    Text = 1,
    Binary = 2,
    Close = 8,
    Ping = 9,
    Pong = 10,
}

impl FrameKind {
    /// Integer value used on the wire.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Control frames (close, ping, pong) as opposed to data frames.
    pub fn is_control(self) -> bool {
        matches!(self, FrameKind::Close | FrameKind::Ping | FrameKind::Pong)
    }
}

impl TryFrom<u8> for FrameKind {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(FrameKind::Text),
            2 => Ok(FrameKind::Binary),
            8 => Ok(FrameKind::Close),
            9 => Ok(FrameKind::Ping),
            10 => Ok(FrameKind::Pong),
            other => Err(FrameError::UnknownKind(other)),
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FrameKind::Text => "text",
            FrameKind::Binary => "binary",
            FrameKind::Close => "close",
            FrameKind::Ping => "ping",
            FrameKind::Pong => "pong",
        };
        f.write_str(name)
    }
}

/// One immutable message unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    kind: FrameKind,
    payload: Bytes,
}

impl Frame {
    pub fn new(kind: FrameKind, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    /// Build a frame from its raw wire kind.
    pub fn from_raw(kind: u8, payload: impl Into<Bytes>) -> Result<Self, FrameError> {
        Ok(Self::new(FrameKind::try_from(kind)?, payload))
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(FrameKind::Text, Bytes::from(text.into()))
    }

    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::new(FrameKind::Binary, payload)
    }

    pub fn close() -> Self {
        Self::new(FrameKind::Close, Bytes::new())
    }

    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self::new(FrameKind::Ping, payload)
    }

    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self::new(FrameKind::Pong, payload)
    }

    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// The payload as UTF-8, if it is valid.
    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}
