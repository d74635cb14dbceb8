#![forbid(unsafe_code)]

use thiserror::Error;

/// Why a message was refused before any state was touched.
///
/// The transport layer decides what a rejection means for the sending
/// connection (drop the message or terminate the session); the reasons stay
/// distinct so that policy can be applied per reason.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
	#[error("message text is empty")]
	Empty,

	#[error("message text is not a string")]
	WrongType,

	#[error("message text exceeds {max} characters")]
	TooLong { max: usize },
}

impl RejectReason {
	/// Stable identifier for wire frames and metrics labels.
	pub const fn code(self) -> &'static str {
		match self {
			RejectReason::Empty => "empty",
			RejectReason::WrongType => "wrong_type",
			RejectReason::TooLong { .. } => "too_long",
		}
	}
}

/// Check a raw message payload against content constraints.
///
/// `max_len` is counted in characters, not bytes; it is configuration, not a
/// constant (observed deployments run 30 in strict mode and 300 relaxed).
/// Runs before any mutation so a rejected send leaves no trace.
pub fn validate(raw: &serde_json::Value, max_len: usize) -> Result<&str, RejectReason> {
	let text = match raw {
		serde_json::Value::String(s) => s.as_str(),
		serde_json::Value::Null => return Err(RejectReason::Empty),
		_ => return Err(RejectReason::WrongType),
	};

	if text.is_empty() {
		return Err(RejectReason::Empty);
	}

	if text.chars().count() > max_len {
		return Err(RejectReason::TooLong { max: max_len });
	}

	Ok(text)
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn accepts_text_within_limit() {
		assert_eq!(validate(&json!("hi there"), 30).unwrap(), "hi there");
	}

	#[test]
	fn accepts_text_exactly_at_limit() {
		let text = "a".repeat(30);
		assert_eq!(validate(&json!(text.clone()), 30).unwrap(), text);
	}

	#[test]
	fn rejects_text_over_limit() {
		let text = "a".repeat(31);
		assert_eq!(validate(&json!(text), 30).unwrap_err(), RejectReason::TooLong { max: 30 });
	}

	#[test]
	fn limit_counts_characters_not_bytes() {
		let text = "é".repeat(30);
		assert!(validate(&json!(text), 30).is_ok());
	}

	#[test]
	fn rejects_missing_and_empty_text() {
		assert_eq!(validate(&serde_json::Value::Null, 30).unwrap_err(), RejectReason::Empty);
		assert_eq!(validate(&json!(""), 30).unwrap_err(), RejectReason::Empty);
	}

	#[test]
	fn rejects_non_string_payloads() {
		for raw in [json!(42), json!(true), json!(["a"]), json!({"text": "hi"})] {
			assert_eq!(validate(&raw, 30).unwrap_err(), RejectReason::WrongType);
		}
	}

	#[test]
	fn reason_codes_are_stable() {
		assert_eq!(RejectReason::Empty.code(), "empty");
		assert_eq!(RejectReason::WrongType.code(), "wrong_type");
		assert_eq!(RejectReason::TooLong { max: 30 }.code(), "too_long");
	}
}
