#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseKeyError {
	#[error("empty channel key")]
	Empty,
}

/// Caller-supplied channel name. Opaque apart from being non-empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelKey(String);

impl ChannelKey {
	/// Create a non-empty `ChannelKey`. The key is stored as given; only
	/// all-whitespace and empty inputs are rejected.
	pub fn new(key: impl Into<String>) -> Result<Self, ParseKeyError> {
		let key = key.into();
		if key.trim().is_empty() {
			return Err(ParseKeyError::Empty);
		}
		Ok(Self(key))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for ChannelKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for ChannelKey {
	type Err = ParseKeyError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		ChannelKey::new(s.to_string())
	}
}

/// Opaque per-session connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub uuid::Uuid);

impl ConnectionId {
	/// Create a new random connection id.
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4())
	}
}

impl fmt::Display for ConnectionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Display identity attributed to a message's sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
	pub username: String,
	pub color: String,
}

/// Per-session connection value owned by the transport layer.
///
/// The core never reaches into transport internals; it reads and writes
/// identity fields only through these accessors, scoped to the session's
/// lifetime. Dropped with the session; nothing else holds a reference.
#[derive(Debug, Clone)]
pub struct Connection {
	id: ConnectionId,
	default_identity: Identity,
	current_identity: Identity,
}

impl Connection {
	/// Create a connection with its default identity. `current` starts
	/// equal to `default`.
	pub fn new(id: ConnectionId, default_identity: Identity) -> Self {
		Self {
			id,
			current_identity: default_identity.clone(),
			default_identity,
		}
	}

	pub fn id(&self) -> ConnectionId {
		self.id
	}

	pub fn default_identity(&self) -> &Identity {
		&self.default_identity
	}

	pub fn current_identity(&self) -> &Identity {
		&self.current_identity
	}

	pub fn set_username(&mut self, username: String) {
		self.current_identity.username = username;
	}

	pub fn set_color(&mut self, color: String) {
		self.current_identity.color = color;
	}

	/// Restore the current identity to the default computed at connect time.
	pub fn reset_identity(&mut self) {
		self.current_identity = self.default_identity.clone();
	}
}
