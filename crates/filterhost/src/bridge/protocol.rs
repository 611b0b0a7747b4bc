//! Command protocol carried over the helper channel.
//!
//! Every connection carries exactly one request frame from the helper and one
//! reply frame from the controller. The first request byte names the
//! [`Command`]; the remaining bytes are its arguments. The command set is
//! closed and versioned as a whole by [`PROTOCOL_VERSION`].

use std::fmt;

use serde::Serialize;
use tokio_util::bytes::{BufMut, Bytes, BytesMut};

use super::codec::FrameError;
use crate::postprocess::PostProcessingFlags;

/// Bumped whenever a command is added, removed, or changes shape.
pub const PROTOCOL_VERSION: u32 = 1;

/// Remote-callable operations. Wire values follow declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Command {
    AbortCheck = 0,
    ReportProgress = 1,
    GetPluginDescriptor = 2,
    GetSessionSettings = 3,
    SetErrorMessage = 4,
    SetPostProcessingOptions = 5,
    GetExifMetadata = 6,
    GetXmpMetadata = 7,
    GetIccProfile = 8,
}

/// What a successful reply to a command contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyShape {
    /// A single byte, 0 or 1.
    Flag,
    /// Zero-length payload.
    Empty,
    /// A UTF-8 JSON document.
    Json,
    /// Opaque bytes, possibly empty.
    Raw,
}

impl Command {
    pub const ALL: [Command; 9] = [
        Command::AbortCheck,
        Command::ReportProgress,
        Command::GetPluginDescriptor,
        Command::GetSessionSettings,
        Command::SetErrorMessage,
        Command::SetPostProcessingOptions,
        Command::GetExifMetadata,
        Command::GetXmpMetadata,
        Command::GetIccProfile,
    ];

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn reply_shape(self) -> ReplyShape {
        match self {
            Command::AbortCheck => ReplyShape::Flag,
            Command::ReportProgress
            | Command::SetErrorMessage
            | Command::SetPostProcessingOptions => ReplyShape::Empty,
            Command::GetPluginDescriptor | Command::GetSessionSettings => ReplyShape::Json,
            Command::GetExifMetadata | Command::GetXmpMetadata | Command::GetIccProfile => {
                ReplyShape::Raw
            }
        }
    }
}

impl TryFrom<u8> for Command {
    type Error = ProtocolError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Command::ALL
            .get(usize::from(byte))
            .copied()
            .ok_or(ProtocolError::UnknownCommand(byte))
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("empty request")]
    EmptyRequest,

    #[error("unknown command byte {0}")]
    UnknownCommand(u8),

    #[error("malformed {command} request: {reason}")]
    MalformedRequest {
        command: Command,
        reason: &'static str,
    },

    #[error("malformed {command} reply: {reason}")]
    MalformedReply {
        command: Command,
        reason: &'static str,
    },

    #[error("peer closed the channel before replying to {0}")]
    NoReply(Command),

    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// A decoded helper request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Request {
    AbortCheck,
    ReportProgress { percent: u8 },
    GetPluginDescriptor,
    GetSessionSettings,
    SetErrorMessage { message: String },
    SetPostProcessingOptions { flags: u32 },
    GetExifMetadata,
    GetXmpMetadata,
    GetIccProfile,
}

impl Request {
    pub fn command(&self) -> Command {
        match self {
            Request::AbortCheck => Command::AbortCheck,
            Request::ReportProgress { .. } => Command::ReportProgress,
            Request::GetPluginDescriptor => Command::GetPluginDescriptor,
            Request::GetSessionSettings => Command::GetSessionSettings,
            Request::SetErrorMessage { .. } => Command::SetErrorMessage,
            Request::SetPostProcessingOptions { .. } => Command::SetPostProcessingOptions,
            Request::GetExifMetadata => Command::GetExifMetadata,
            Request::GetXmpMetadata => Command::GetXmpMetadata,
            Request::GetIccProfile => Command::GetIccProfile,
        }
    }

    pub fn post_processing(flags: PostProcessingFlags) -> Self {
        Request::SetPostProcessingOptions { flags: flags.bits() }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(5);
        buf.put_u8(self.command().as_byte());
        match self {
            Request::ReportProgress { percent } => buf.put_u8(*percent),
            Request::SetErrorMessage { message } => buf.put_slice(message.as_bytes()),
            Request::SetPostProcessingOptions { flags } => buf.put_u32_le(*flags),
            _ => {}
        }
        buf.freeze()
    }

    /// Parse a request payload. Argument lengths are checked exactly; trailing
    /// bytes are a protocol violation.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let (&byte, args) = payload.split_first().ok_or(ProtocolError::EmptyRequest)?;
        let command = Command::try_from(byte)?;
        let malformed = |reason| ProtocolError::MalformedRequest { command, reason };

        let request = match command {
            Command::ReportProgress => match args {
                [percent] => Request::ReportProgress { percent: *percent },
                _ => return Err(malformed("expected exactly one percent byte")),
            },
            Command::SetErrorMessage => {
                let message = std::str::from_utf8(args)
                    .map_err(|_| malformed("message is not valid UTF-8"))?;
                Request::SetErrorMessage {
                    message: message.to_owned(),
                }
            }
            Command::SetPostProcessingOptions => {
                let word: [u8; 4] = args
                    .try_into()
                    .map_err(|_| malformed("expected a 4-byte flag word"))?;
                Request::SetPostProcessingOptions {
                    flags: u32::from_le_bytes(word),
                }
            }
            _ if !args.is_empty() => return Err(malformed("command takes no arguments")),
            Command::AbortCheck => Request::AbortCheck,
            Command::GetPluginDescriptor => Request::GetPluginDescriptor,
            Command::GetSessionSettings => Request::GetSessionSettings,
            Command::GetExifMetadata => Request::GetExifMetadata,
            Command::GetXmpMetadata => Request::GetXmpMetadata,
            Command::GetIccProfile => Request::GetIccProfile,
        };
        Ok(request)
    }
}

/// Encode the reply to `AbortCheck`.
pub fn abort_reply(aborted: bool) -> Bytes {
    Bytes::from_static(if aborted { &[1] } else { &[0] })
}

/// Decode the reply to `AbortCheck`.
pub fn decode_abort_reply(payload: &[u8]) -> Result<bool, ProtocolError> {
    match payload {
        [0] => Ok(false),
        [1] => Ok(true),
        _ => Err(ProtocolError::MalformedReply {
            command: Command::AbortCheck,
            reason: "expected a single 0 or 1 byte",
        }),
    }
}

/// Check that a reply to a command with no result is empty.
pub fn expect_empty_reply(command: Command, payload: &[u8]) -> Result<(), ProtocolError> {
    if payload.is_empty() {
        Ok(())
    } else {
        Err(ProtocolError::MalformedReply {
            command,
            reason: "expected an empty reply",
        })
    }
}
