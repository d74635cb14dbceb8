#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, anyhow};
use holler_core::RankBy;
use serde::Deserialize;
use tracing::info;

/// Default config path: `~/.holler/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".holler").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
#[allow(dead_code)]
pub fn load_server_config() -> anyhow::Result<ServerConfig> {
	let path = default_config_path()?;
	load_server_config_from_path(&path)
}

/// Same as `load_server_config` but with an explicit config path.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

/// What happens to a sender whose message fails validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RejectPolicy {
	/// Report the rejection and keep the session.
	#[default]
	Drop,
	/// Report the rejection and terminate the session.
	Disconnect,
}

/// Server config (v1).
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub limits: LimitSettings,
	pub policy: PolicySettings,
}

/// Transport-side settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	/// Maximum queued items per hub subscriber before lag-dropping.
	pub subscriber_queue_capacity: usize,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			metrics_bind: None,
			health_bind: None,
			subscriber_queue_capacity: 1024,
		}
	}
}

/// Core store limits.
#[derive(Debug, Clone)]
pub struct LimitSettings {
	/// Retained messages per channel backlog.
	pub per_channel_cap: usize,
	/// Summed message bytes retained across all channels.
	pub global_byte_budget: usize,
	/// Maximum message length in characters (30 strict, 300 relaxed).
	pub max_message_len: usize,
}

impl Default for LimitSettings {
	fn default() -> Self {
		Self {
			per_channel_cap: 100,
			global_byte_budget: 1024 * 1024,
			max_message_len: 300,
		}
	}
}

/// Behavior choices left to deployment.
#[derive(Debug, Clone)]
pub struct PolicySettings {
	pub on_reject: RejectPolicy,
	pub rank_by: RankBy,
	/// Whether per-message identity overrides are honored at all.
	pub allow_identity_override: bool,
}

impl Default for PolicySettings {
	fn default() -> Self {
		Self {
			on_reject: RejectPolicy::Drop,
			rank_by: RankBy::AllTime,
			allow_identity_override: true,
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	limits: FileLimitSettings,

	#[serde(default)]
	policy: FilePolicySettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	subscriber_queue_capacity: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileLimitSettings {
	per_channel_cap: Option<usize>,
	global_byte_budget: Option<usize>,
	max_message_len: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePolicySettings {
	on_reject: Option<String>,
	rank_by: Option<String>,
	allow_identity_override: Option<bool>,
}

fn parse_reject_policy(v: &str) -> Option<RejectPolicy> {
	match v.trim().to_ascii_lowercase().as_str() {
		"drop" => Some(RejectPolicy::Drop),
		"disconnect" => Some(RejectPolicy::Disconnect),
		_ => None,
	}
}

fn parse_rank_by(v: &str) -> Option<RankBy> {
	match v.trim().to_ascii_lowercase().as_str() {
		"all_time" => Some(RankBy::AllTime),
		"resident" => Some(RankBy::Resident),
		_ => None,
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = ServerConfig::default();

		Self {
			server: ServerSettings {
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				health_bind: file.server.health_bind.filter(|s| !s.trim().is_empty()),
				subscriber_queue_capacity: file
					.server
					.subscriber_queue_capacity
					.filter(|v| *v > 0)
					.unwrap_or(defaults.server.subscriber_queue_capacity),
			},
			limits: LimitSettings {
				per_channel_cap: file
					.limits
					.per_channel_cap
					.filter(|v| *v > 0)
					.unwrap_or(defaults.limits.per_channel_cap),
				global_byte_budget: file
					.limits
					.global_byte_budget
					.filter(|v| *v > 0)
					.unwrap_or(defaults.limits.global_byte_budget),
				max_message_len: file
					.limits
					.max_message_len
					.filter(|v| *v > 0)
					.unwrap_or(defaults.limits.max_message_len),
			},
			policy: PolicySettings {
				on_reject: file
					.policy
					.on_reject
					.as_deref()
					.and_then(parse_reject_policy)
					.unwrap_or(defaults.policy.on_reject),
				rank_by: file
					.policy
					.rank_by
					.as_deref()
					.and_then(parse_rank_by)
					.unwrap_or(defaults.policy.rank_by),
				allow_identity_override: file
					.policy
					.allow_identity_override
					.unwrap_or(defaults.policy.allow_identity_override),
			},
		}
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Ok(v) = std::env::var("HOLLER_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("HOLLER_HEALTH_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.health_bind = Some(v);
			info!("server config: health_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("HOLLER_SUBSCRIBER_QUEUE_CAPACITY")
		&& let Ok(capacity) = v.trim().parse::<usize>()
		&& capacity > 0
	{
		cfg.server.subscriber_queue_capacity = capacity;
		info!(capacity, "server config: subscriber_queue_capacity overridden by env");
	}

	if let Ok(v) = std::env::var("HOLLER_PER_CHANNEL_CAP")
		&& let Ok(cap) = v.trim().parse::<usize>()
		&& cap > 0
	{
		cfg.limits.per_channel_cap = cap;
		info!(cap, "limits: per_channel_cap overridden by env");
	}

	if let Ok(v) = std::env::var("HOLLER_GLOBAL_BYTE_BUDGET")
		&& let Ok(budget) = v.trim().parse::<usize>()
		&& budget > 0
	{
		cfg.limits.global_byte_budget = budget;
		info!(budget, "limits: global_byte_budget overridden by env");
	}

	if let Ok(v) = std::env::var("HOLLER_MAX_MESSAGE_LEN")
		&& let Ok(len) = v.trim().parse::<usize>()
		&& len > 0
	{
		cfg.limits.max_message_len = len;
		info!(len, "limits: max_message_len overridden by env");
	}

	if let Ok(v) = std::env::var("HOLLER_ON_REJECT")
		&& let Some(policy) = parse_reject_policy(&v)
	{
		cfg.policy.on_reject = policy;
		info!(policy = ?cfg.policy.on_reject, "policy: on_reject overridden by env");
	}

	if let Ok(v) = std::env::var("HOLLER_RANK_BY")
		&& let Some(rank_by) = parse_rank_by(&v)
	{
		cfg.policy.rank_by = rank_by;
		info!(rank_by = ?cfg.policy.rank_by, "policy: rank_by overridden by env");
	}

	if let Ok(v) = std::env::var("HOLLER_ALLOW_IDENTITY_OVERRIDE")
		&& let Some(allow) = parse_env_bool(&v)
	{
		cfg.policy.allow_identity_override = allow;
		info!(allow, "policy: allow_identity_override overridden by env");
	}
}
