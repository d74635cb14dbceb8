#![forbid(unsafe_code)]

use holler_domain::Identity;
use serde::{Deserialize, Serialize};

fn default_top_k() -> usize {
	10
}

/// A relayed message as it crosses the wire: the text, the server-side
/// timestamp, and the sender identity snapshotted at send time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
	pub text: String,
	pub unix_ms: i64,
	pub identity: Identity,
}

/// One row of a top-channels report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankEntry {
	pub channel: String,
	pub count: u64,
}

/// Frames a client sends to the relay.
///
/// `Send.text` is carried as a raw JSON value on purpose: the validator, not
/// the codec, decides whether a non-string payload is a `wrong_type`
/// rejection, so a malformed send does not tear down the whole frame stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
	Join {
		channel: String,
	},
	Send {
		channel: String,
		#[serde(default)]
		text: serde_json::Value,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		username: Option<String>,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		color: Option<String>,
	},
	TopChannels {
		#[serde(default = "default_top_k")]
		k: usize,
	},
}

/// Frames the relay sends to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
	/// Join acknowledgement carrying the backlog snapshot, oldest first.
	Joined {
		channel: String,
		backlog: Vec<WireMessage>,
	},
	/// A message accepted into `channel`, fanned out to every member.
	Message {
		channel: String,
		message: WireMessage,
	},
	TopChannels {
		channels: Vec<RankEntry>,
	},
	/// A send refused by validation. The session survives unless the server
	/// runs the disconnect policy.
	Rejected {
		reason: String,
		detail: String,
	},
	/// Operation-fatal error (e.g. malformed channel key).
	Error {
		detail: String,
	},
	/// The subscriber queue overflowed and `dropped` messages were skipped.
	Lagged {
		dropped: u64,
	},
}
