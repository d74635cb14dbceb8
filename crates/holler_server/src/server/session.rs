#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Context as _;
use bytes::BytesMut;
use holler_core::{RelayStore, StoredMessage, apply_override, default_identity, validate};
use holler_domain::{ChannelKey, Connection, ConnectionId};
use holler_protocol::framing::{DEFAULT_MAX_FRAME_SIZE, encode_frame, try_decode_frame_from_buffer};
use holler_protocol::wire::{ClientFrame, RankEntry, ServerFrame, WireMessage};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::RejectPolicy;
use crate::server::hub::{ChannelHub, HubItem};
use crate::server::state::GlobalState;
use crate::util::time::unix_ms_now;

/// The one store instance every session mutates through a single lock, so
/// each inbound event runs to completion before the next one touches state.
pub type SharedStore = Arc<Mutex<RelayStore>>;

/// Outbound queue depth per session before backpressure on the reader.
const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Per-session settings snapshot taken from the server config at accept time.
#[derive(Debug, Clone)]
pub struct SessionSettings {
	pub max_message_len: usize,
	pub on_reject: RejectPolicy,
	pub allow_identity_override: bool,
	/// Upper bound on `k` for top-channel queries.
	pub top_channels_max: usize,
}

impl Default for SessionSettings {
	fn default() -> Self {
		Self {
			max_message_len: 300,
			on_reject: RejectPolicy::Drop,
			allow_identity_override: true,
			top_channels_max: 100,
		}
	}
}

enum FrameOutcome {
	Continue,
	Disconnect,
}

fn wire_message(m: &StoredMessage) -> WireMessage {
	WireMessage {
		text: m.text.clone(),
		unix_ms: m.unix_ms,
		identity: m.identity.clone(),
	}
}

fn spawn_forward(mut rx: mpsc::Receiver<HubItem>, out_tx: mpsc::Sender<ServerFrame>) -> JoinHandle<()> {
	tokio::spawn(async move {
		while let Some(item) = rx.recv().await {
			let frame = match item {
				HubItem::Message { channel, message } => ServerFrame::Message {
					channel: channel.into_string(),
					message,
				},
				HubItem::Lagged { dropped } => ServerFrame::Lagged { dropped },
			};

			if out_tx.send(frame).await.is_err() {
				break;
			}
		}
	})
}

struct Session {
	conn_id: u64,
	conn: Connection,
	settings: SessionSettings,
	store: SharedStore,
	hub: ChannelHub,
	state: Arc<RwLock<GlobalState>>,
	out_tx: mpsc::Sender<ServerFrame>,
	forwards: Vec<JoinHandle<()>>,
}

impl Session {
	async fn send(&self, frame: ServerFrame) {
		let _ = self.out_tx.send(frame).await;
	}

	async fn handle_frame(&mut self, frame: ClientFrame) -> FrameOutcome {
		match frame {
			ClientFrame::Join { channel } => self.handle_join(channel).await,
			ClientFrame::Send {
				channel,
				text,
				username,
				color,
			} => self.handle_send(channel, text, username, color).await,
			ClientFrame::TopChannels { k } => self.handle_top_channels(k).await,
		}
	}

	async fn parse_key(&self, channel: String) -> Option<ChannelKey> {
		match channel.parse::<ChannelKey>() {
			Ok(key) => Some(key),
			Err(e) => {
				// Fatal to this operation only; the session stays up.
				self.send(ServerFrame::Error { detail: e.to_string() }).await;
				None
			}
		}
	}

	async fn handle_join(&mut self, channel: String) -> FrameOutcome {
		let Some(key) = self.parse_key(channel).await else {
			return FrameOutcome::Continue;
		};

		// Registry mutation, subscription, and the backlog snapshot all
		// happen behind the store lock; sends publish under the same lock,
		// so nothing can slip between the snapshot and the subscription.
		let (backlog, rx) = {
			let mut store = self.store.lock().await;
			let backlog = store.join(&key);

			let newly_joined = self.state.write().await.handle_join(self.conn_id, &key);
			let rx = if newly_joined {
				Some(self.hub.subscribe_channel(key.clone()).await)
			} else {
				None
			};

			(backlog, rx)
		};

		debug!(conn_id = self.conn_id, channel = %key, backlog = backlog.len(), "join");

		self.send(ServerFrame::Joined {
			channel: key.into_string(),
			backlog: backlog.iter().map(wire_message).collect(),
		})
		.await;

		// Spawned only after `Joined` is queued so the snapshot precedes
		// any live delivery on the wire.
		if let Some(rx) = rx {
			self.forwards.push(spawn_forward(rx, self.out_tx.clone()));
		}

		FrameOutcome::Continue
	}

	async fn handle_send(
		&mut self,
		channel: String,
		text: serde_json::Value,
		username: Option<String>,
		color: Option<String>,
	) -> FrameOutcome {
		let Some(key) = self.parse_key(channel).await else {
			return FrameOutcome::Continue;
		};

		let text = match validate(&text, self.settings.max_message_len) {
			Ok(text) => text.to_string(),
			Err(reason) => {
				metrics::counter!("holler_messages_rejected_total", "reason" => reason.code()).increment(1);

				self.send(ServerFrame::Rejected {
					reason: reason.code().to_string(),
					detail: reason.to_string(),
				})
				.await;

				return match self.settings.on_reject {
					RejectPolicy::Drop => FrameOutcome::Continue,
					RejectPolicy::Disconnect => {
						info!(conn_id = self.conn_id, reason = reason.code(), "disconnecting sender on rejected message");
						FrameOutcome::Disconnect
					}
				};
			}
		};

		// Identity override is per-message opt-in: a send without one falls
		// back to the default identity rather than keeping an earlier
		// override sticky.
		let wants_override = self.settings.allow_identity_override && (username.is_some() || color.is_some());
		if wants_override {
			apply_override(&mut self.conn, username.as_deref(), color.as_deref());
		} else {
			self.conn.reset_identity();
		}
		let identity = self.conn.current_identity().clone();

		let accept_result = {
			let mut store = self.store.lock().await;
			match store.accept(&key, text, identity, unix_ms_now()) {
				Ok((message, report)) => {
					metrics::counter!("holler_messages_accepted_total").increment(1);

					if !report.is_empty() {
						metrics::counter!("holler_messages_evicted_total").increment(report.evicted.len() as u64);
						debug!(
							conn_id = self.conn_id,
							channel = %key,
							evicted = report.evicted.len(),
							bytes_reclaimed = report.bytes_reclaimed(),
							"eviction on accept"
						);
					}
					metrics::gauge!("holler_backlog_bytes").set(store.used_bytes() as f64);

					// Fire-and-forget fan-out; the store is already consistent.
					self.hub.publish_message(key.clone(), wire_message(&message)).await;
					Ok(())
				}
				Err(e) => Err(e),
			}
		};

		if let Err(e) = accept_result {
			error!(conn_id = self.conn_id, channel = %key, error = %e, "history engine invariant violation");
			self.send(ServerFrame::Error {
				detail: "internal storage error".to_string(),
			})
			.await;
		}

		FrameOutcome::Continue
	}

	async fn handle_top_channels(&self, k: usize) -> FrameOutcome {
		let k = k.min(self.settings.top_channels_max);

		let ranks = self.store.lock().await.top_channels(k);
		let channels = ranks
			.into_iter()
			.map(|r| RankEntry {
				channel: r.key.into_string(),
				count: r.count,
			})
			.collect();

		self.send(ServerFrame::TopChannels { channels }).await;
		FrameOutcome::Continue
	}
}

/// Drive one client connection until it disconnects or violates the framing
/// protocol.
pub async fn run_session(
	conn_id: u64,
	stream: TcpStream,
	store: SharedStore,
	hub: ChannelHub,
	state: Arc<RwLock<GlobalState>>,
	settings: SessionSettings,
) -> anyhow::Result<()> {
	let (mut reader, mut writer) = stream.into_split();

	let (out_tx, mut out_rx) = mpsc::channel::<ServerFrame>(OUTBOUND_QUEUE_CAPACITY);
	let writer_task = tokio::spawn(async move {
		while let Some(frame) = out_rx.recv().await {
			let bytes = match encode_frame(&frame, DEFAULT_MAX_FRAME_SIZE) {
				Ok(bytes) => bytes,
				Err(e) => {
					warn!(error = %e, "failed to encode outbound frame");
					continue;
				}
			};

			if writer.write_all(&bytes).await.is_err() {
				break;
			}
		}
	});

	let id = ConnectionId::new_v4();
	let conn = Connection::new(id, default_identity(&id));
	info!(conn_id, connection = %id, username = %conn.default_identity().username, "session started");

	let mut session = Session {
		conn_id,
		conn,
		settings,
		store,
		hub,
		state,
		out_tx,
		forwards: Vec::new(),
	};

	let mut buf = BytesMut::with_capacity(4 * 1024);
	let result = drive_read_loop(&mut session, &mut reader, &mut buf).await;

	// Transport-side teardown only; the core keeps no per-connection state.
	for forward in session.forwards.drain(..) {
		forward.abort();
	}

	let channels_to_prune = session.state.write().await.remove_conn(conn_id);
	for channel in &channels_to_prune {
		session.hub.prune_channel(channel).await;
	}

	drop(session);
	let _ = writer_task.await;

	info!(conn_id, "session ended");
	result
}

async fn drive_read_loop(
	session: &mut Session,
	reader: &mut tokio::net::tcp::OwnedReadHalf,
	buf: &mut BytesMut,
) -> anyhow::Result<()> {
	loop {
		loop {
			match try_decode_frame_from_buffer::<ClientFrame>(buf, DEFAULT_MAX_FRAME_SIZE) {
				Ok(Some(frame)) => match session.handle_frame(frame).await {
					FrameOutcome::Continue => {}
					FrameOutcome::Disconnect => return Ok(()),
				},
				Ok(None) => break,
				Err(e) => {
					warn!(conn_id = session.conn_id, error = %e, "closing session on framing error");
					session.send(ServerFrame::Error { detail: e.to_string() }).await;
					return Ok(());
				}
			}
		}

		let n = reader.read_buf(buf).await.context("read from client")?;
		if n == 0 {
			return Ok(());
		}
	}
}
