#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};

use holler_domain::ChannelKey;

/// Shared subscription bookkeeping across all live sessions.
///
/// Tracks which channels each connection joined and a per-channel refcount
/// so the hub entry can be pruned once the last member leaves. The relay
/// core holds no per-connection state; this is transport-side only.
#[derive(Debug, Default)]
pub struct GlobalState {
	subs_by_conn: HashMap<u64, HashSet<ChannelKey>>,

	channel_refcounts: HashMap<ChannelKey, u64>,
}

impl GlobalState {
	/// Returns a snapshot of joined channels for the given connection id.
	#[allow(dead_code)]
	pub fn channels_for_conn(&self, conn_id: u64) -> HashSet<ChannelKey> {
		self.subs_by_conn.get(&conn_id).cloned().unwrap_or_default()
	}

	/// Record a join. Returns `true` if the connection was not yet a member
	/// of the channel (i.e. a hub subscription should be created).
	pub fn handle_join(&mut self, conn_id: u64, channel: &ChannelKey) -> bool {
		let joined = self.subs_by_conn.entry(conn_id).or_default();
		if !joined.insert(channel.clone()) {
			return false;
		}

		*self.channel_refcounts.entry(channel.clone()).or_insert(0) += 1;
		true
	}

	/// Removes state for a connection and decrements refcounts. Returns the
	/// channels whose last member just left, for hub pruning.
	pub fn remove_conn(&mut self, conn_id: u64) -> Vec<ChannelKey> {
		let Some(prev) = self.subs_by_conn.remove(&conn_id) else {
			return Vec::new();
		};

		let mut channels_to_prune = Vec::new();

		for channel in prev {
			match self.channel_refcounts.get_mut(&channel) {
				Some(rc) => {
					if *rc <= 1 {
						self.channel_refcounts.remove(&channel);
						channels_to_prune.push(channel);
					} else {
						*rc -= 1;
					}
				}
				None => {}
			}
		}

		channels_to_prune
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn key(s: &str) -> ChannelKey {
		ChannelKey::new(s).expect("valid key")
	}

	#[test]
	fn first_join_subscribes_repeat_join_does_not() {
		let mut state = GlobalState::default();

		assert!(state.handle_join(1, &key("lobby")));
		assert!(!state.handle_join(1, &key("lobby")));
		assert!(state.handle_join(2, &key("lobby")));

		assert_eq!(state.channels_for_conn(1).len(), 1);
	}

	#[test]
	fn remove_conn_reports_channels_with_no_members_left() {
		let mut state = GlobalState::default();

		state.handle_join(1, &key("a"));
		state.handle_join(1, &key("b"));
		state.handle_join(2, &key("b"));

		let mut pruned = state.remove_conn(1);
		pruned.sort();
		assert_eq!(pruned, vec![key("a")]);

		assert_eq!(state.remove_conn(2), vec![key("b")]);
		assert!(state.remove_conn(2).is_empty());
	}
}
