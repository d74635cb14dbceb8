#![forbid(unsafe_code)]

use holler_domain::{Connection, ConnectionId, Identity};

/// Maximum username length in characters, for defaults and overrides alike.
pub const MAX_USERNAME_CHARS: usize = 12;

/// Fixed vocabulary for default usernames. Every word leaves room for the
/// two-digit suffix within `MAX_USERNAME_CHARS`.
const ANIMALS: &[&str] = &[
	"otter", "lynx", "heron", "badger", "wombat", "puffin", "gecko", "marmot", "osprey", "vole", "ibex", "stoat",
	"plover", "tapir", "quokka", "shrike", "dunlin", "civet", "serval", "magpie",
];

/// Polynomial hash over the id's bytes, wrapped to machine-integer range.
fn poly_hash(s: &str) -> i32 {
	s.bytes().fold(0i32, |h, b| h.wrapping_mul(31).wrapping_add(b as i32))
}

/// Second mix with a different multiplier so the username index does not
/// correlate with the hue.
fn name_hash(s: &str) -> u64 {
	s.bytes().fold(0u64, |h, b| h.wrapping_mul(131).wrapping_add(b as u64))
}

/// Derive the default identity for a connection. Pure function of the id:
/// the same id always yields the same identity within a process run.
pub fn default_identity(id: &ConnectionId) -> Identity {
	let s = id.to_string();

	let hue = poly_hash(&s).unsigned_abs() % 360;
	let color = format!("hsl({hue}, 70%, 55%)");

	let h = name_hash(&s);
	let word = ANIMALS[(h % ANIMALS.len() as u64) as usize];
	let number = (h / ANIMALS.len() as u64) % 100;

	Identity {
		username: format!("{word}{number:02}"),
		color,
	}
}

/// Apply a proposed identity override to the connection's current identity.
///
/// Each field is replaced only if its proposed value individually satisfies
/// its constraint; an invalid field leaves the current value unchanged, so a
/// partial override is valid.
pub fn apply_override(conn: &mut Connection, username: Option<&str>, color: Option<&str>) {
	if let Some(proposed) = username {
		let trimmed = proposed.trim();
		if !trimmed.is_empty() && trimmed.chars().count() <= MAX_USERNAME_CHARS {
			conn.set_username(trimmed.to_string());
		}
	}

	if let Some(proposed) = color {
		let trimmed = proposed.trim();
		if !trimmed.is_empty() {
			conn.set_color(trimmed.to_string());
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn conn() -> Connection {
		let id = ConnectionId::new_v4();
		Connection::new(id, default_identity(&id))
	}

	#[test]
	fn default_identity_is_deterministic_per_id() {
		let id = ConnectionId::new_v4();
		assert_eq!(default_identity(&id), default_identity(&id));
	}

	#[test]
	fn default_username_fits_constraints() {
		for _ in 0..64 {
			let ident = default_identity(&ConnectionId::new_v4());
			let chars = ident.username.chars().count();
			assert!((1..=MAX_USERNAME_CHARS).contains(&chars), "username: {}", ident.username);

			let suffix: String = ident.username.chars().rev().take(2).collect();
			assert!(suffix.chars().all(|c| c.is_ascii_digit()), "username: {}", ident.username);
		}
	}

	#[test]
	fn default_color_is_an_hsl_triple() {
		let ident = default_identity(&ConnectionId::new_v4());
		assert!(ident.color.starts_with("hsl("), "color: {}", ident.color);
		assert!(ident.color.ends_with(')'));
	}

	#[test]
	fn override_replaces_valid_username() {
		let mut c = conn();
		apply_override(&mut c, Some("bob"), None);
		assert_eq!(c.current_identity().username, "bob");
	}

	#[test]
	fn whitespace_only_username_leaves_current_unchanged() {
		let mut c = conn();
		let before = c.current_identity().clone();
		apply_override(&mut c, Some("  "), None);
		assert_eq!(c.current_identity(), &before);
	}

	#[test]
	fn too_long_username_leaves_current_unchanged() {
		let mut c = conn();
		let before = c.current_identity().clone();
		apply_override(&mut c, Some(&"a".repeat(13)), None);
		assert_eq!(c.current_identity(), &before);
	}

	#[test]
	fn twelve_char_username_is_accepted() {
		let mut c = conn();
		apply_override(&mut c, Some(&"a".repeat(12)), None);
		assert_eq!(c.current_identity().username, "a".repeat(12));
	}

	#[test]
	fn partial_override_touches_only_the_valid_field() {
		let mut c = conn();
		let default_color = c.current_identity().color.clone();

		apply_override(&mut c, Some("bob"), Some("   "));
		assert_eq!(c.current_identity().username, "bob");
		assert_eq!(c.current_identity().color, default_color);

		apply_override(&mut c, Some(&"x".repeat(20)), Some("tomato"));
		assert_eq!(c.current_identity().username, "bob");
		assert_eq!(c.current_identity().color, "tomato");
	}

	#[test]
	fn override_trims_surrounding_whitespace() {
		let mut c = conn();
		apply_override(&mut c, Some("  alice  "), Some(" teal "));
		assert_eq!(c.current_identity().username, "alice");
		assert_eq!(c.current_identity().color, "teal");
	}
}
