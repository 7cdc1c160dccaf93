#![forbid(unsafe_code)]

//! QUIC client for the classchat real-time channel.
//!
//! One bidirectional stream carries everything. Requests get a fresh
//! `request_id` and resolve when the server echoes it back; pushed room
//! events arrive on the receiver returned by [`Session::connect`].

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context as _;
use classchat_protocol::framing::{DEFAULT_MAX_FRAME_SIZE, FrameDecoder, FramingError, encode_frame};
use classchat_protocol::version::ALPN;
use classchat_protocol::{envelope, event_kind, msg_kind, pb};
use quinn::{ClientConfig as QuinnClientConfig, Endpoint, TransportConfig, VarInt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<pb::envelope::Msg>>>>;

#[derive(Debug, Clone)]
pub struct ClientConfig {
	pub server_host: String,

	pub server_port: u16,

	/// Skips DNS when set.
	pub server_addr: Option<SocketAddr>,

	pub client_name: String,

	/// Session credential sent in `Hello`.
	pub session_token: String,

	pub max_frame_bytes: usize,

	/// Timeout for connect + handshake.
	pub connect_timeout: Duration,

	pub request_timeout: Duration,
}

impl ClientConfig {
	/// Parse `quic://host:port` (the scheme is optional).
	pub fn parse_endpoint(endpoint: &str) -> Result<(String, u16), ClientError> {
		let raw = endpoint.trim();
		let host_port = raw.strip_prefix("quic://").unwrap_or(raw);
		let (host, port) = host_port
			.rsplit_once(':')
			.ok_or_else(|| ClientError::Protocol(format!("invalid endpoint {raw:?} (expected quic://host:port)")))?;
		let host = host.trim_start_matches('[').trim_end_matches(']');
		if host.is_empty() {
			return Err(ClientError::Protocol(format!("invalid endpoint {raw:?}: empty host")));
		}
		let port = port
			.parse::<u16>()
			.map_err(|e| ClientError::Protocol(format!("invalid endpoint {raw:?}: bad port: {e}")))?;
		Ok((host.to_string(), port))
	}

	pub fn from_endpoint(endpoint: &str, session_token: impl Into<String>) -> Result<Self, ClientError> {
		let (host, port) = Self::parse_endpoint(endpoint)?;
		Ok(Self {
			server_host: host,
			server_port: port,
			server_addr: None,
			session_token: session_token.into(),
			..Self::default()
		})
	}
}

impl Default for ClientConfig {
	fn default() -> Self {
		Self {
			server_host: "localhost".to_string(),
			server_port: 18203,
			server_addr: None,
			client_name: format!("classchat-client/{}", env!("CARGO_PKG_VERSION")),
			session_token: String::new(),
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			connect_timeout: Duration::from_secs(15),
			request_timeout: Duration::from_secs(10),
		}
	}
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
	#[error("failed to create QUIC endpoint: {0}")]
	Endpoint(String),

	#[error("failed to connect: {0}")]
	Connect(String),

	#[error(transparent)]
	Framing(#[from] FramingError),

	/// Unexpected message ordering or payload.
	#[error("protocol error: {0}")]
	Protocol(String),

	/// The server answered with an `Error` frame.
	#[error("server rejected request ({}): {detail}", .code.as_str_name())]
	Rejected {
		code: pb::ErrorCode,
		detail: String,
		field: Option<String>,
		retry_after_secs: Option<u32>,
	},

	#[error("request timed out after {0:?}")]
	Timeout(Duration),

	#[error("connection closed")]
	Closed,

	#[error("io error: {0}")]
	Io(String),
}

impl ClientError {
	/// Wire code when the server rejected the request.
	pub fn code(&self) -> Option<pb::ErrorCode> {
		match self {
			ClientError::Rejected { code, .. } => Some(*code),
			_ => None,
		}
	}

	fn from_pb(err: pb::Error) -> Self {
		ClientError::Rejected {
			code: pb::ErrorCode::try_from(err.code).unwrap_or(pb::ErrorCode::Internal),
			detail: err.detail,
			field: Some(err.field).filter(|f| !f.is_empty()),
			retry_after_secs: Some(err.retry_after_secs).filter(|s| *s > 0),
		}
	}
}

/// A connected, authenticated client.
pub struct Session {
	conn: quinn::Connection,
	send: tokio::sync::Mutex<quinn::SendStream>,
	pending: Pending,
	next_request: AtomicU64,
	max_frame_bytes: usize,
	request_timeout: Duration,
	welcome: pb::Welcome,
	reader: JoinHandle<()>,
}

impl Session {
	/// Connect, send `Hello` and wait for `Welcome`.
	pub async fn connect(cfg: ClientConfig) -> Result<(Self, mpsc::UnboundedReceiver<pb::EventEnvelope>), ClientError> {
		let endpoint = make_client_endpoint().map_err(|e| ClientError::Endpoint(format!("{e:#}")))?;
		let quinn_cfg = make_insecure_client_config().map_err(|e| ClientError::Endpoint(format!("{e:#}")))?;
		let connect_timeout = cfg.connect_timeout;
		let server_name = cfg.server_host.clone();

		let candidates: Vec<SocketAddr> = match cfg.server_addr {
			Some(addr) => vec![addr],
			None => {
				let hostport = format!("{}:{}", cfg.server_host, cfg.server_port);
				let addrs: Vec<SocketAddr> = hostport
					.to_socket_addrs()
					.map_err(|e| ClientError::Connect(format!("failed to resolve {hostport}: {e}")))?
					.collect();
				if addrs.is_empty() {
					return Err(ClientError::Connect(format!("DNS resolution returned no addresses for {hostport}")));
				}
				addrs
			}
		};

		let mut last_err: Option<String> = None;
		let mut conn: Option<quinn::Connection> = None;
		for server_addr in candidates {
			let connecting = endpoint
				.connect_with(quinn_cfg.clone(), server_addr, &server_name)
				.map_err(|e| ClientError::Connect(format!("connect_with({server_addr}, sni={server_name}): {e}")))?;

			match tokio::time::timeout(connect_timeout, connecting).await {
				Ok(Ok(c)) => {
					conn = Some(c);
					break;
				}
				Ok(Err(e)) => last_err = Some(format!("connect failed (addr={server_addr}): {e}")),
				Err(_) => last_err = Some(format!("connect timeout after {connect_timeout:?} (addr={server_addr})")),
			}
		}
		let conn = conn.ok_or_else(|| ClientError::Connect(last_err.unwrap_or_else(|| "no addresses attempted".to_string())))?;
		info!(remote = %conn.remote_address(), "connected");

		let (mut send, mut recv) = tokio::time::timeout(connect_timeout, conn.open_bi())
			.await
			.map_err(|_| ClientError::Timeout(connect_timeout))?
			.map_err(|e| ClientError::Io(format!("open_bi failed: {e}")))?;

		let hello = envelope(
			"hello",
			pb::envelope::Msg::Hello(pb::Hello {
				client_name: cfg.client_name,
				session_token: cfg.session_token,
			}),
		);
		write_envelope(&mut send, &hello, cfg.max_frame_bytes).await?;

		let mut decoder = FrameDecoder::new(cfg.max_frame_bytes);
		let first = tokio::time::timeout(connect_timeout, read_envelope(&mut recv, &mut decoder))
			.await
			.map_err(|_| ClientError::Timeout(connect_timeout))??
			.ok_or(ClientError::Closed)?;

		let welcome = match first.msg {
			Some(pb::envelope::Msg::Welcome(w)) => w,
			Some(pb::envelope::Msg::Error(e)) => return Err(ClientError::from_pb(e)),
			other => return Err(ClientError::Protocol(format!("expected Welcome, got {other:?}"))),
		};
		debug!(
			server_name = %welcome.server_name,
			connection_id = welcome.connection_id,
			max_frame_bytes = welcome.max_frame_bytes,
			"received Welcome"
		);

		let max_frame_bytes = (welcome.max_frame_bytes as usize).min(cfg.max_frame_bytes).max(1);
		let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
		let (events_tx, events_rx) = mpsc::unbounded_channel();
		let reader = tokio::spawn(run_reader(recv, decoder, Arc::clone(&pending), events_tx));

		let session = Self {
			conn,
			send: tokio::sync::Mutex::new(send),
			pending,
			next_request: AtomicU64::new(1),
			max_frame_bytes,
			request_timeout: cfg.request_timeout,
			welcome,
			reader,
		};
		Ok((session, events_rx))
	}

	pub fn welcome(&self) -> &pb::Welcome {
		&self.welcome
	}

	pub fn connection_id(&self) -> u64 {
		self.welcome.connection_id
	}

	/// Send one request and wait for the reply carrying the same `request_id`.
	pub async fn request(&self, msg: pb::envelope::Msg) -> Result<pb::envelope::Msg, ClientError> {
		let request_id = format!("r{}", self.next_request.fetch_add(1, Ordering::Relaxed));
		let (tx, rx) = oneshot::channel();
		lock(&self.pending).insert(request_id.clone(), tx);

		let kind = msg_kind(&msg);
		let env = envelope(request_id.clone(), msg);
		let written = {
			let mut send = self.send.lock().await;
			write_envelope(&mut send, &env, self.max_frame_bytes).await
		};
		if let Err(e) = written {
			lock(&self.pending).remove(&request_id);
			return Err(e);
		}
		debug!(%request_id, kind, "request sent");

		match tokio::time::timeout(self.request_timeout, rx).await {
			Ok(Ok(pb::envelope::Msg::Error(e))) => Err(ClientError::from_pb(e)),
			Ok(Ok(reply)) => Ok(reply),
			Ok(Err(_)) => Err(ClientError::Closed),
			Err(_) => {
				lock(&self.pending).remove(&request_id);
				Err(ClientError::Timeout(self.request_timeout))
			}
		}
	}

	pub async fn join_room(&self, room_id: &str, access_token: &str) -> Result<pb::Joined, ClientError> {
		let msg = pb::envelope::Msg::JoinRoom(pb::JoinRoom {
			room_id: room_id.to_string(),
			access_token: access_token.to_string(),
		});
		match self.request(msg).await? {
			pb::envelope::Msg::Joined(j) => Ok(j),
			other => Err(unexpected("Joined", &other)),
		}
	}

	pub async fn send_message(&self, room_id: &str, content: &str) -> Result<pb::MessageAck, ClientError> {
		let msg = pb::envelope::Msg::SendMessage(pb::SendMessage {
			room_id: room_id.to_string(),
			content: content.to_string(),
		});
		match self.request(msg).await? {
			pb::envelope::Msg::MessageAck(a) => Ok(a),
			other => Err(unexpected("MessageAck", &other)),
		}
	}

	pub async fn send_typing(&self, room_id: &str) -> Result<(), ClientError> {
		let msg = pb::envelope::Msg::SendTyping(pb::SendTyping {
			room_id: room_id.to_string(),
		});
		self.expect_done(msg).await
	}

	pub async fn load_history(&self, room_id: &str, count: u32) -> Result<pb::History, ClientError> {
		let msg = pb::envelope::Msg::LoadHistory(pb::LoadHistory {
			room_id: room_id.to_string(),
			count,
		});
		match self.request(msg).await? {
			pb::envelope::Msg::History(h) => Ok(h),
			other => Err(unexpected("History", &other)),
		}
	}

	pub async fn leave_room(&self, room_id: &str) -> Result<(), ClientError> {
		let msg = pb::envelope::Msg::LeaveRoom(pb::LeaveRoom {
			room_id: room_id.to_string(),
		});
		self.expect_done(msg).await
	}

	pub async fn kick(&self, room_id: &str, target_connection_id: u64) -> Result<(), ClientError> {
		let msg = pb::envelope::Msg::KickParticipant(pb::KickParticipant {
			room_id: room_id.to_string(),
			target_connection_id,
		});
		self.expect_done(msg).await
	}

	pub async fn ping(&self, client_time_unix_ms: i64) -> Result<pb::Pong, ClientError> {
		match self.request(pb::envelope::Msg::Ping(pb::Ping { client_time_unix_ms })).await? {
			pb::envelope::Msg::Pong(p) => Ok(p),
			other => Err(unexpected("Pong", &other)),
		}
	}

	async fn expect_done(&self, msg: pb::envelope::Msg) -> Result<(), ClientError> {
		match self.request(msg).await? {
			pb::envelope::Msg::Done(_) => Ok(()),
			other => Err(unexpected("Done", &other)),
		}
	}

	pub fn close(&self, code: u32, reason: &str) {
		self.conn.close(VarInt::from_u32(code), reason.as_bytes());
	}
}

impl Drop for Session {
	fn drop(&mut self) {
		self.reader.abort();
	}
}

fn unexpected(expected: &str, got: &pb::envelope::Msg) -> ClientError {
	ClientError::Protocol(format!("expected {expected}, got {}", msg_kind(got)))
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
	m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn run_reader(
	mut recv: quinn::RecvStream,
	mut decoder: FrameDecoder,
	pending: Pending,
	events: mpsc::UnboundedSender<pb::EventEnvelope>,
) {
	loop {
		let env = match read_envelope(&mut recv, &mut decoder).await {
			Ok(Some(env)) => env,
			Ok(None) => {
				info!("stream closed by server");
				break;
			}
			Err(e) => {
				warn!(error = %e, "reader stopped");
				break;
			}
		};
		let Some(msg) = env.msg else { continue };

		if env.request_id.is_empty() {
			match msg {
				pb::envelope::Msg::Event(ev) => {
					debug!(room_id = %ev.room_id, event_kind = event_kind(&ev), "event");
					let _ = events.send(ev);
				}
				other => warn!(kind = msg_kind(&other), "unsolicited message without request id"),
			}
			continue;
		}

		match lock(&pending).remove(&env.request_id) {
			Some(tx) => {
				let _ = tx.send(msg);
			}
			None => debug!(request_id = %env.request_id, "reply for unknown or expired request"),
		}
	}
	// Dropping the senders fails every in-flight request with `Closed`.
	lock(&pending).clear();
}

async fn write_envelope(send: &mut quinn::SendStream, env: &pb::Envelope, max_frame_bytes: usize) -> Result<(), ClientError> {
	let frame = encode_frame(env, max_frame_bytes)?;
	send.write_all(&frame).await.map_err(|e| ClientError::Io(e.to_string()))?;
	Ok(())
}

/// Next envelope, or `None` on a clean end of stream.
async fn read_envelope(recv: &mut quinn::RecvStream, decoder: &mut FrameDecoder) -> Result<Option<pb::Envelope>, ClientError> {
	let mut tmp = [0u8; 8192];
	loop {
		if let Some(env) = decoder.next_frame::<pb::Envelope>()? {
			return Ok(Some(env));
		}
		match recv.read(&mut tmp).await {
			Ok(Some(n)) => decoder.push(&tmp[..n]),
			Ok(None) => return Ok(None),
			Err(e) => return Err(ClientError::Io(e.to_string())),
		}
	}
}

fn make_client_endpoint() -> anyhow::Result<Endpoint> {
	let addr = SocketAddr::from(([0, 0, 0, 0], 0));
	Endpoint::client(addr).context("create client endpoint")
}

/// Dev-only TLS config that skips server cert validation.
fn make_insecure_client_config() -> anyhow::Result<QuinnClientConfig> {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

	#[derive(Debug)]
	struct NoVerifier;

	impl rustls::client::danger::ServerCertVerifier for NoVerifier {
		fn verify_server_cert(
			&self,
			_end_entity: &rustls::pki_types::CertificateDer<'_>,
			_intermediates: &[rustls::pki_types::CertificateDer<'_>],
			_server_name: &rustls::pki_types::ServerName<'_>,
			_ocsp_response: &[u8],
			_now: rustls::pki_types::UnixTime,
		) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
			Ok(rustls::client::danger::ServerCertVerified::assertion())
		}

		fn verify_tls12_signature(
			&self,
			_message: &[u8],
			_cert: &rustls::pki_types::CertificateDer<'_>,
			_dss: &rustls::DigitallySignedStruct,
		) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
			Err(rustls::Error::General("TLS1.2 not supported".into()))
		}

		fn verify_tls13_signature(
			&self,
			_message: &[u8],
			_cert: &rustls::pki_types::CertificateDer<'_>,
			_dss: &rustls::DigitallySignedStruct,
		) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
			Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
		}

		fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
			vec![
				rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
				rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
				rustls::SignatureScheme::RSA_PSS_SHA256,
				rustls::SignatureScheme::RSA_PSS_SHA384,
				rustls::SignatureScheme::RSA_PSS_SHA512,
				rustls::SignatureScheme::ED25519,
			]
		}
	}

	let mut tls = rustls::ClientConfig::builder()
		.with_root_certificates(rustls::RootCertStore::empty())
		.with_no_client_auth();
	tls.dangerous().set_certificate_verifier(Arc::new(NoVerifier));
	tls.alpn_protocols = vec![ALPN.to_vec()];

	let quic_tls = quinn::crypto::rustls::QuicClientConfig::try_from(tls)?;
	let mut cfg = QuinnClientConfig::new(Arc::new(quic_tls));

	let mut transport = TransportConfig::default();
	transport.max_concurrent_bidi_streams(VarInt::from_u32(4));
	transport.max_concurrent_uni_streams(VarInt::from_u32(0));
	transport.keep_alive_interval(Some(Duration::from_secs(10)));
	cfg.transport_config(Arc::new(transport));

	Ok(cfg)
}
