#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use holler_core::{RankBy, RelayStore, StoreConfig};
use holler_protocol::framing::{DEFAULT_MAX_FRAME_SIZE, encode_frame, try_decode_frame_from_buffer};
use holler_protocol::wire::{ClientFrame, ServerFrame};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;

use crate::config::RejectPolicy;
use crate::server::hub::{ChannelHub, ChannelHubConfig};
use crate::server::session::{SessionSettings, SharedStore, run_session};
use crate::server::state::GlobalState;

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

async fn start_relay(settings: SessionSettings, store_cfg: StoreConfig) -> (SocketAddr, SharedStore) {
	let store: SharedStore = Arc::new(Mutex::new(RelayStore::new(store_cfg)));
	let hub = ChannelHub::new(ChannelHubConfig {
		subscriber_queue_capacity: 64,
		debug_logs: false,
	});
	let state = Arc::new(RwLock::new(GlobalState::default()));

	let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind test listener");
	let addr = listener.local_addr().expect("local addr");

	let accept_store = Arc::clone(&store);
	tokio::spawn(async move {
		let mut next_conn_id: u64 = 1;
		loop {
			let Ok((stream, _remote)) = listener.accept().await else {
				break;
			};

			let conn_id = next_conn_id;
			next_conn_id += 1;

			let store = Arc::clone(&accept_store);
			let hub = hub.clone();
			let state = Arc::clone(&state);
			let settings = settings.clone();
			tokio::spawn(async move {
				let _ = run_session(conn_id, stream, store, hub, state, settings).await;
			});
		}
	});

	(addr, store)
}

struct TestClient {
	stream: TcpStream,
	buf: BytesMut,
}

impl TestClient {
	async fn connect(addr: SocketAddr) -> Self {
		let stream = TcpStream::connect(addr).await.expect("connect to relay");
		Self {
			stream,
			buf: BytesMut::new(),
		}
	}

	async fn send(&mut self, frame: &ClientFrame) {
		let bytes = encode_frame(frame, DEFAULT_MAX_FRAME_SIZE).expect("encode frame");
		self.stream.write_all(&bytes).await.expect("write frame");
	}

	async fn join(&mut self, channel: &str) {
		self.send(&ClientFrame::Join {
			channel: channel.to_string(),
		})
		.await;
	}

	async fn send_text(&mut self, channel: &str, text: &str) {
		self.send(&ClientFrame::Send {
			channel: channel.to_string(),
			text: serde_json::Value::String(text.to_string()),
			username: None,
			color: None,
		})
		.await;
	}

	async fn recv(&mut self) -> ServerFrame {
		loop {
			if let Some(frame) = try_decode_frame_from_buffer::<ServerFrame>(&mut self.buf, DEFAULT_MAX_FRAME_SIZE)
				.expect("well-formed server frame")
			{
				return frame;
			}

			let n = timeout(RECV_TIMEOUT, self.stream.read_buf(&mut self.buf))
				.await
				.expect("timed out waiting for server frame")
				.expect("read from relay");
			assert!(n > 0, "relay closed the connection unexpectedly");
		}
	}

	/// Drain until the relay closes the socket; fails on timeout.
	async fn expect_closed(&mut self) {
		loop {
			let n = timeout(RECV_TIMEOUT, self.stream.read_buf(&mut self.buf))
				.await
				.expect("timed out waiting for close")
				.expect("read from relay");
			if n == 0 {
				return;
			}
		}
	}
}

fn relaxed_settings() -> SessionSettings {
	SessionSettings::default()
}

fn default_store_cfg() -> StoreConfig {
	StoreConfig::default()
}

#[tokio::test]
async fn join_returns_backlog_and_send_broadcasts_to_all_members() {
	let (addr, _store) = start_relay(relaxed_settings(), default_store_cfg()).await;

	let mut alice = TestClient::connect(addr).await;
	alice.join("lobby").await;
	match alice.recv().await {
		ServerFrame::Joined { channel, backlog } => {
			assert_eq!(channel, "lobby");
			assert!(backlog.is_empty());
		}
		other => panic!("expected Joined, got: {other:?}"),
	}

	alice.send_text("lobby", "hello").await;
	match alice.recv().await {
		ServerFrame::Message { channel, message } => {
			assert_eq!(channel, "lobby");
			assert_eq!(message.text, "hello");
		}
		other => panic!("expected sender to receive own broadcast, got: {other:?}"),
	}

	// A late joiner sees the backlog, then live traffic.
	let mut bob = TestClient::connect(addr).await;
	bob.join("lobby").await;
	match bob.recv().await {
		ServerFrame::Joined { backlog, .. } => {
			let texts: Vec<&str> = backlog.iter().map(|m| m.text.as_str()).collect();
			assert_eq!(texts, ["hello"]);
		}
		other => panic!("expected Joined, got: {other:?}"),
	}

	bob.send_text("lobby", "hi").await;
	match alice.recv().await {
		ServerFrame::Message { message, .. } => assert_eq!(message.text, "hi"),
		other => panic!("expected broadcast to alice, got: {other:?}"),
	}
	match bob.recv().await {
		ServerFrame::Message { message, .. } => assert_eq!(message.text, "hi"),
		other => panic!("expected broadcast to bob, got: {other:?}"),
	}
}

#[tokio::test]
async fn identity_override_is_per_message_opt_in() {
	let (addr, _store) = start_relay(relaxed_settings(), default_store_cfg()).await;

	let mut client = TestClient::connect(addr).await;
	client.join("lobby").await;
	let _joined = client.recv().await;

	client.send_text("lobby", "one").await;
	let default_identity = match client.recv().await {
		ServerFrame::Message { message, .. } => message.identity,
		other => panic!("expected Message, got: {other:?}"),
	};
	assert!(!default_identity.username.is_empty());
	assert!(default_identity.username.chars().count() <= 12);

	client
		.send(&ClientFrame::Send {
			channel: "lobby".to_string(),
			text: serde_json::Value::String("two".to_string()),
			username: Some("bob".to_string()),
			color: Some("tomato".to_string()),
		})
		.await;
	match client.recv().await {
		ServerFrame::Message { message, .. } => {
			assert_eq!(message.identity.username, "bob");
			assert_eq!(message.identity.color, "tomato");
		}
		other => panic!("expected Message, got: {other:?}"),
	}

	// No override on this send: the identity falls back to the default
	// instead of keeping "bob" sticky.
	client.send_text("lobby", "three").await;
	match client.recv().await {
		ServerFrame::Message { message, .. } => assert_eq!(message.identity, default_identity),
		other => panic!("expected Message, got: {other:?}"),
	}
}

#[tokio::test]
async fn rejected_send_reports_the_reason_and_keeps_the_session() {
	let settings = SessionSettings {
		max_message_len: 5,
		..SessionSettings::default()
	};
	let (addr, store) = start_relay(settings, default_store_cfg()).await;

	let mut client = TestClient::connect(addr).await;
	client.join("lobby").await;
	let _joined = client.recv().await;

	client.send_text("lobby", "this is too long").await;
	match client.recv().await {
		ServerFrame::Rejected { reason, .. } => assert_eq!(reason, "too_long"),
		other => panic!("expected Rejected, got: {other:?}"),
	}

	client
		.send(&ClientFrame::Send {
			channel: "lobby".to_string(),
			text: serde_json::json!(42),
			username: None,
			color: None,
		})
		.await;
	match client.recv().await {
		ServerFrame::Rejected { reason, .. } => assert_eq!(reason, "wrong_type"),
		other => panic!("expected Rejected, got: {other:?}"),
	}

	// Rejections leave no trace in the store and the session stays usable.
	client.send_text("lobby", "ok").await;
	match client.recv().await {
		ServerFrame::Message { message, .. } => assert_eq!(message.text, "ok"),
		other => panic!("expected Message, got: {other:?}"),
	}

	let store = store.lock().await;
	let key = "lobby".parse().expect("key");
	let ch = store.channel(&key).expect("channel exists");
	assert_eq!(ch.all_time_count(), 1);
	assert_eq!(ch.backlog_len(), 1);
}

#[tokio::test]
async fn disconnect_policy_terminates_the_offending_sender() {
	let settings = SessionSettings {
		max_message_len: 5,
		on_reject: RejectPolicy::Disconnect,
		..SessionSettings::default()
	};
	let (addr, _store) = start_relay(settings, default_store_cfg()).await;

	let mut client = TestClient::connect(addr).await;
	client.send_text("lobby", "this is too long").await;

	match client.recv().await {
		ServerFrame::Rejected { reason, .. } => assert_eq!(reason, "too_long"),
		other => panic!("expected Rejected, got: {other:?}"),
	}
	client.expect_closed().await;
}

#[tokio::test]
async fn malformed_channel_key_fails_the_operation_not_the_session() {
	let (addr, _store) = start_relay(relaxed_settings(), default_store_cfg()).await;

	let mut client = TestClient::connect(addr).await;
	client.join("   ").await;
	match client.recv().await {
		ServerFrame::Error { detail } => assert!(detail.contains("empty"), "detail: {detail}"),
		other => panic!("expected Error, got: {other:?}"),
	}

	client.join("lobby").await;
	match client.recv().await {
		ServerFrame::Joined { channel, .. } => assert_eq!(channel, "lobby"),
		other => panic!("expected Joined, got: {other:?}"),
	}
}

#[tokio::test]
async fn top_channels_query_ranks_by_traffic() {
	let (addr, _store) = start_relay(
		relaxed_settings(),
		StoreConfig {
			per_channel_cap: 100,
			global_byte_budget: 1024 * 1024,
			rank_by: RankBy::AllTime,
		},
	)
	.await;

	let mut client = TestClient::connect(addr).await;
	client.join("busy").await;
	let _joined = client.recv().await;

	for i in 0..3 {
		client.send_text("busy", &format!("m{i}")).await;
		let _echo = client.recv().await;
	}
	client.send_text("quiet", "m").await;

	client.send(&ClientFrame::TopChannels { k: 10 }).await;
	loop {
		match client.recv().await {
			ServerFrame::TopChannels { channels } => {
				let got: Vec<(&str, u64)> = channels.iter().map(|r| (r.channel.as_str(), r.count)).collect();
				assert_eq!(got, [("busy", 3), ("quiet", 1)]);
				break;
			}
			// The send to "quiet" is not echoed (the client never joined
			// it), but any stray broadcast frame is skipped here.
			ServerFrame::Message { .. } => continue,
			other => panic!("expected TopChannels, got: {other:?}"),
		}
	}
}
