//! Replication messages exchanged between workers via the supervisor.
//!
//! On the wire every message is one JSON object per line:
//!
//! ```text
//! {"kind":"CREATED","payload":{"id":"…","username":"ann","age":30,"hobbies":[]}}
//! {"kind":"DELETED","payload":"6f1c…"}
//! {"kind":"SNAPSHOT_REQUEST","payload":null}
//! {"kind":"SNAPSHOT_RESPONSE","payload":[…]}
//! ```
//!
//! The envelope is decoded in two steps (first `kind`, then `payload`) so an
//! unknown kind and a bad payload are reported as distinct errors.

use std::io;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;
use uuid::Uuid;

use crate::error::MessageError;
use crate::user::User;

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// The effect of a mutation, or one half of the snapshot exchange.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicationMessage {
    Created(User),
    Updated(User),
    Deleted(Uuid),
    SnapshotRequest,
    SnapshotResponse(Vec<User>),
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    kind: String,
    #[serde(default)]
    payload: Value,
}

impl ReplicationMessage {
    pub const CREATED: &'static str = "CREATED";
    pub const UPDATED: &'static str = "UPDATED";
    pub const DELETED: &'static str = "DELETED";
    pub const SNAPSHOT_REQUEST: &'static str = "SNAPSHOT_REQUEST";
    pub const SNAPSHOT_RESPONSE: &'static str = "SNAPSHOT_RESPONSE";

    pub fn kind(&self) -> &'static str {
        match self {
            ReplicationMessage::Created(_) => Self::CREATED,
            ReplicationMessage::Updated(_) => Self::UPDATED,
            ReplicationMessage::Deleted(_) => Self::DELETED,
            ReplicationMessage::SnapshotRequest => Self::SNAPSHOT_REQUEST,
            ReplicationMessage::SnapshotResponse(_) => Self::SNAPSHOT_RESPONSE,
        }
    }

    /// Encodes the message as a single line of JSON (without the newline).
    pub fn encode(&self) -> Result<String, MessageError> {
        let payload = match self {
            ReplicationMessage::Created(user) | ReplicationMessage::Updated(user) => {
                serde_json::to_value(user)?
            }
            ReplicationMessage::Deleted(id) => Value::String(id.to_string()),
            ReplicationMessage::SnapshotRequest => Value::Null,
            ReplicationMessage::SnapshotResponse(users) => serde_json::to_value(users)?,
        };
        let envelope = Envelope {
            kind: self.kind().to_string(),
            payload,
        };
        Ok(serde_json::to_string(&envelope)?)
    }

    /// Decodes one frame.
    pub fn decode(frame: &str) -> Result<Self, MessageError> {
        let Envelope { kind, payload } = serde_json::from_str(frame)?;
        match kind.as_str() {
            Self::CREATED => Ok(ReplicationMessage::Created(payload_as(Self::CREATED, payload)?)),
            Self::UPDATED => Ok(ReplicationMessage::Updated(payload_as(Self::UPDATED, payload)?)),
            Self::DELETED => Ok(ReplicationMessage::Deleted(payload_as(Self::DELETED, payload)?)),
            Self::SNAPSHOT_REQUEST => match payload {
                Value::Null => Ok(ReplicationMessage::SnapshotRequest),
                _ => Err(MessageError::InvalidPayload {
                    kind: Self::SNAPSHOT_REQUEST,
                    reason: "expected an empty payload".to_string(),
                }),
            },
            Self::SNAPSHOT_RESPONSE => Ok(ReplicationMessage::SnapshotResponse(payload_as(
                Self::SNAPSHOT_RESPONSE,
                payload,
            )?)),
            _ => Err(MessageError::UnknownKind(kind)),
        }
    }
}

fn payload_as<T: serde::de::DeserializeOwned>(
    kind: &'static str,
    payload: Value,
) -> Result<T, MessageError> {
    serde_json::from_value(payload).map_err(|err| MessageError::InvalidPayload {
        kind,
        reason: err.to_string(),
    })
}

/// Reads the next non-empty line. Returns `None` at end of stream.
///
/// Lines that are not valid UTF-8 are logged and skipped.
pub async fn read_frame<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let bytes = reader.read_until(b'\n', &mut buf).await?;
        if bytes == 0 {
            return Ok(None);
        }

        let line = match String::from_utf8(std::mem::take(&mut buf)) {
            Ok(line) => line,
            Err(err) => {
                warn!(error = %err, len = bytes, "dropping frame that is not UTF-8");
                continue;
            }
        };
        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if trimmed.is_empty() {
            continue;
        }
        return Ok(Some(trimmed.to_string()));
    }
}

/// Writes one frame followed by a newline and flushes it.
pub async fn write_frame<W>(writer: &mut W, frame: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut encoded = Vec::with_capacity(frame.len() + 1);
    encoded.extend_from_slice(frame.as_bytes());
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}
