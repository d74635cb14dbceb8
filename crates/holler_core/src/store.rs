#![forbid(unsafe_code)]

use std::collections::{HashMap, VecDeque};

use holler_domain::{ChannelKey, Identity};
use thiserror::Error;
use tracing::error;

use crate::ranking::RankBy;

/// Store limits and policy.
#[derive(Debug, Clone)]
pub struct StoreConfig {
	/// Maximum retained messages per channel backlog.
	pub per_channel_cap: usize,

	/// Budget for the summed UTF-8 byte length of every retained message
	/// across all channels.
	pub global_byte_budget: usize,

	/// Which counter drives `top_channels`.
	pub rank_by: RankBy,
}

impl Default for StoreConfig {
	fn default() -> Self {
		Self {
			per_channel_cap: 100,
			global_byte_budget: 1024 * 1024,
			rank_by: RankBy::AllTime,
		}
	}
}

#[derive(Debug, Error)]
pub enum StoreError {
	/// The eviction loop ran out of messages with the byte counter still over
	/// budget. Accounting is out of sync: a programming defect, never an
	/// operational condition.
	#[error("byte accounting out of sync: used={used} budget={budget} with no survivors to evict")]
	CapacityInternal { used: usize, budget: usize },
}

/// A message retained in a channel backlog. Immutable once accepted; owned by
/// exactly one backlog until evicted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
	/// Arrival sequence number, unique across all channels. The eviction
	/// tie-break: two messages may share a timestamp at textual precision,
	/// the sequence number never collides.
	pub seq: u64,
	pub text: String,
	pub unix_ms: i64,
	pub identity: Identity,
	pub size_bytes: usize,
}

#[derive(Debug, Default)]
pub struct Channel {
	backlog: VecDeque<StoredMessage>,
	all_time_count: u64,
}

impl Channel {
	pub fn backlog(&self) -> impl Iterator<Item = &StoredMessage> {
		self.backlog.iter()
	}

	pub fn backlog_len(&self) -> usize {
		self.backlog.len()
	}

	/// Total messages ever accepted for this channel. Monotone; eviction
	/// does not decrement it.
	pub fn all_time_count(&self) -> u64 {
		self.all_time_count
	}
}

/// Why a message left its backlog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictCause {
	/// The owning channel went over `per_channel_cap`.
	ChannelCap,
	/// The store went over `global_byte_budget`.
	GlobalBudget,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evicted {
	pub channel: ChannelKey,
	pub message: StoredMessage,
	pub cause: EvictCause,
}

/// What an `accept` call removed, for observability.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EvictionReport {
	pub evicted: Vec<Evicted>,
}

impl EvictionReport {
	pub fn is_empty(&self) -> bool {
		self.evicted.is_empty()
	}

	pub fn bytes_reclaimed(&self) -> usize {
		self.evicted.iter().map(|e| e.message.size_bytes).sum()
	}
}

/// Reference into a channel backlog, queued in global arrival order.
#[derive(Debug)]
struct ArrivalRef {
	seq: u64,
	key: ChannelKey,
}

/// In-memory channel state: registry, bounded per-channel history, global
/// byte budget, all-time counters.
///
/// One arrival-ordered queue of `(seq, key)` references serves global
/// eviction. Per-channel cap eviction leaves its queue entry behind; entries
/// whose message is already gone are skipped when popped, which keeps both
/// mechanisms consistent without an O(channels) scan per eviction.
#[derive(Debug)]
pub struct RelayStore {
	cfg: StoreConfig,
	channels: HashMap<ChannelKey, Channel>,
	arrival: VecDeque<ArrivalRef>,
	used_bytes: usize,
	next_seq: u64,
}

impl RelayStore {
	pub fn new(cfg: StoreConfig) -> Self {
		Self {
			cfg,
			channels: HashMap::new(),
			arrival: VecDeque::new(),
			used_bytes: 0,
			next_seq: 1,
		}
	}

	pub fn config(&self) -> &StoreConfig {
		&self.cfg
	}

	/// Summed byte length of every retained message.
	pub fn used_bytes(&self) -> usize {
		self.used_bytes
	}

	pub fn channel_count(&self) -> usize {
		self.channels.len()
	}

	pub fn channel(&self, key: &ChannelKey) -> Option<&Channel> {
		self.channels.get(key)
	}

	pub fn channels(&self) -> impl Iterator<Item = (&ChannelKey, &Channel)> {
		self.channels.iter()
	}

	/// Look up or lazily create a channel entry. Idempotent; a malformed key
	/// cannot reach this point because `ChannelKey` rejects it at parse time.
	pub fn get_or_create(&mut self, key: &ChannelKey) -> &mut Channel {
		self.channels.entry(key.clone()).or_default()
	}

	/// Copy of the current backlog, oldest first. Empty if the channel does
	/// not exist yet; the lookup itself never fails.
	pub fn snapshot_backlog(&self, key: &ChannelKey) -> Vec<StoredMessage> {
		self.channels.get(key).map(|ch| ch.backlog.iter().cloned().collect()).unwrap_or_default()
	}

	/// Join: ensure the channel exists, then hand back its backlog for the
	/// new member.
	pub fn join(&mut self, key: &ChannelKey) -> Vec<StoredMessage> {
		self.get_or_create(key);
		self.snapshot_backlog(key)
	}

	/// Append an already-validated message, then enforce the per-channel cap
	/// and the global byte budget, oldest-first by arrival order.
	///
	/// Returns the accepted message and everything evicted to make room.
	/// `Err` means the byte accounting broke mid-eviction; the caller should
	/// treat that as a defect, not retry.
	pub fn accept(
		&mut self,
		key: &ChannelKey,
		text: String,
		identity: Identity,
		now_unix_ms: i64,
	) -> Result<(StoredMessage, EvictionReport), StoreError> {
		let seq = self.next_seq;
		self.next_seq += 1;

		let message = StoredMessage {
			seq,
			size_bytes: text.len(),
			text,
			unix_ms: now_unix_ms,
			identity,
		};

		self.used_bytes += message.size_bytes;
		self.arrival.push_back(ArrivalRef { seq, key: key.clone() });

		let channel = self.channels.entry(key.clone()).or_default();
		channel.all_time_count += 1;
		channel.backlog.push_back(message.clone());

		let mut report = EvictionReport::default();
		self.enforce_channel_cap(key, &mut report);
		self.enforce_global_budget(&mut report)?;

		Ok((message, report))
	}

	fn enforce_channel_cap(&mut self, key: &ChannelKey, report: &mut EvictionReport) {
		let Some(channel) = self.channels.get_mut(key) else {
			return;
		};

		while channel.backlog.len() > self.cfg.per_channel_cap {
			let Some(oldest) = channel.backlog.pop_front() else {
				break;
			};
			// The arrival queue entry goes stale here; the global pass skips it.
			self.used_bytes = self.used_bytes.saturating_sub(oldest.size_bytes);
			report.evicted.push(Evicted {
				channel: key.clone(),
				message: oldest,
				cause: EvictCause::ChannelCap,
			});
		}
	}

	fn enforce_global_budget(&mut self, report: &mut EvictionReport) -> Result<(), StoreError> {
		while self.used_bytes > self.cfg.global_byte_budget {
			let Some(oldest_ref) = self.arrival.pop_front() else {
				error!(
					used = self.used_bytes,
					budget = self.cfg.global_byte_budget,
					"global eviction exhausted the arrival queue with bytes still over budget"
				);
				return Err(StoreError::CapacityInternal {
					used: self.used_bytes,
					budget: self.cfg.global_byte_budget,
				});
			};

			let Some(channel) = self.channels.get_mut(&oldest_ref.key) else {
				continue;
			};

			// Backlogs only ever shed from the front, so a live reference
			// always points at the owning channel's current front. Anything
			// else is a leftover from cap eviction.
			let live = channel.backlog.front().is_some_and(|m| m.seq == oldest_ref.seq);
			if !live {
				continue;
			}

			let Some(oldest) = channel.backlog.pop_front() else {
				continue;
			};
			self.used_bytes = self.used_bytes.saturating_sub(oldest.size_bytes);
			report.evicted.push(Evicted {
				channel: oldest_ref.key,
				message: oldest,
				cause: EvictCause::GlobalBudget,
			});
		}

		Ok(())
	}
}
