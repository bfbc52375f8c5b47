use serde::{Deserialize, Serialize};
use serde_json::Number;

use crate::relay::SessionSummary;

/// `OK` / `ERROR` marker shared by the acceptance frame and the relay replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReplyStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CompletionStatus {
    Done,
    Error,
}

/// First frame on every connection, sent by the sender.
///
/// `filesize` stays a raw JSON number so that a negative, fractional or
/// oversized value reaches validation instead of failing as a framing error.
/// A missing size reads as `-1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub filename: String,
    #[serde(default = "unknown_size")]
    pub filesize: Number,
}

fn unknown_size() -> Number {
    Number::from(-1)
}

impl Header {
    pub fn new(filename: impl Into<String>, filesize: u64) -> Self {
        Self {
            filename: filename.into(),
            filesize: filesize.into(),
        }
    }

    /// The declared size in whole bytes. Integral floats such as `10.0` are
    /// accepted; sizes beyond `u64` saturate and fail the size limit later.
    pub fn declared_size(&self) -> Result<u64, &'static str> {
        if let Some(size) = self.filesize.as_u64() {
            return Ok(size);
        }
        match self.filesize.as_f64() {
            Some(f) if f < 0.0 => Err("Filesize must be non-negative."),
            Some(f) if f.fract() == 0.0 => Ok(f as u64),
            _ => Err("Filesize must be a whole number of bytes."),
        }
    }
}

/// Receiver's answer to a [`Header`]; decides whether payload bytes follow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acceptance {
    pub status: ReplyStatus,
    #[serde(default)]
    pub save_as: String,
    #[serde(default)]
    pub message: String,
}

impl Acceptance {
    pub fn ok(save_as: impl Into<String>) -> Self {
        Self {
            status: ReplyStatus::Ok,
            save_as: save_as.into(),
            message: "Ready to receive".to_string(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ReplyStatus::Error,
            save_as: String::new(),
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ReplyStatus::Ok
    }
}

/// Terminal frame of a transfer, one per connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    pub status: CompletionStatus,
    #[serde(default)]
    pub saved_as: String,
    #[serde(default)]
    pub bytes_received: u64,
    #[serde(default)]
    pub renamed: bool,
    #[serde(default)]
    pub message: String,
}

impl Completion {
    pub fn done(saved_as: impl Into<String>, bytes_received: u64, renamed: bool) -> Self {
        Self {
            status: CompletionStatus::Done,
            saved_as: saved_as.into(),
            bytes_received,
            renamed,
            message: "Received successfully".to_string(),
        }
    }

    pub fn error(
        saved_as: impl Into<String>,
        bytes_received: u64,
        message: impl Into<String>,
    ) -> Self {
        Self {
            status: CompletionStatus::Error,
            saved_as: saved_as.into(),
            bytes_received,
            renamed: false,
            message: message.into(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.status == CompletionStatus::Done
    }
}

//-************************************************************************
// relay replies
//-************************************************************************

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeginResponse {
    pub status: ReplyStatus,
    pub session_id: String,
    pub save_as: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkAck {
    pub status: ReplyStatus,
    pub received: u64,
    pub remaining: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponse {
    pub status: ReplyStatus,
    pub message: String,
}

impl MessageResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            status: ReplyStatus::Ok,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ReplyStatus::Error,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayStatus {
    pub status: ReplyStatus,
    pub active_sessions: usize,
    pub sessions: Vec<SessionSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_field_names_and_status_spelling() {
        let json = serde_json::to_value(Acceptance::ok("a (1).txt")).unwrap();
        assert_eq!(json["status"], "OK");
        assert_eq!(json["save_as"], "a (1).txt");

        let json = serde_json::to_value(Completion::done("a.txt", 3, false)).unwrap();
        assert_eq!(json["status"], "DONE");
        assert_eq!(json["saved_as"], "a.txt");
        assert_eq!(json["bytes_received"], 3);
        assert_eq!(json["renamed"], false);
    }

    #[test]
    fn error_acceptance_without_save_as_parses() {
        let a: Acceptance =
            serde_json::from_str(r#"{"status":"ERROR","message":"Invalid filename."}"#).unwrap();
        assert!(!a.is_ok());
        assert_eq!(a.save_as, "");
        assert_eq!(a.message, "Invalid filename.");
    }

    #[test]
    fn odd_filesizes_survive_decoding() {
        let size = |json: &str| serde_json::from_str::<Header>(json).unwrap().declared_size();

        assert_eq!(size(r#"{"filename":"x","filesize":4}"#), Ok(4));
        assert_eq!(size(r#"{"filename":"x","filesize":10.0}"#), Ok(10));
        assert_eq!(
            size(r#"{"filename":"x","filesize":-4}"#),
            Err("Filesize must be non-negative.")
        );
        assert_eq!(
            size(r#"{"filename":"x"}"#),
            Err("Filesize must be non-negative.")
        );
        assert_eq!(
            size(r#"{"filename":"x","filesize":2.5}"#),
            Err("Filesize must be a whole number of bytes.")
        );
        assert_eq!(
            size(r#"{"filename":"x","filesize":100000000000000000000000000000}"#),
            Ok(u64::MAX)
        );
    }

    #[test]
    fn header_size_is_written_as_a_plain_integer() {
        let json = serde_json::to_string(&Header::new("a.txt", 7)).unwrap();
        assert_eq!(json, r#"{"filename":"a.txt","filesize":7}"#);
    }
}
