#![forbid(unsafe_code)]

use holler_domain::ChannelKey;

use crate::store::RelayStore;

/// Which counter `top_channels` ranks by.
///
/// Observed deployments disagree on whether ranking should reflect all
/// traffic ever accepted or only what currently survives in the backlog, so
/// the source is configuration rather than a fixed choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RankBy {
	/// All-time accepted count; unaffected by eviction.
	#[default]
	AllTime,
	/// Current backlog length.
	Resident,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRank {
	pub key: ChannelKey,
	pub count: u64,
}

impl RelayStore {
	/// Top `k` channels by the configured counter, descending, ties broken
	/// by key ascending for a deterministic order. Pure read.
	pub fn top_channels(&self, k: usize) -> Vec<ChannelRank> {
		let rank_by = self.config().rank_by;

		let mut ranks: Vec<ChannelRank> = self
			.channels()
			.map(|(key, ch)| {
				let count = match rank_by {
					RankBy::AllTime => ch.all_time_count(),
					RankBy::Resident => ch.backlog_len() as u64,
				};
				ChannelRank { key: key.clone(), count }
			})
			.collect();

		ranks.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));
		ranks.truncate(k);
		ranks
	}
}
