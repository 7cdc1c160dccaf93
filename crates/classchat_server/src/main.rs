#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use classchat_domain::{Identity, Role, SubjectId};
use classchat_server::config::{ServerConfig, SecretString};
use classchat_server::quic::config::QuicServerConfig;
use classchat_server::server::access::RoomAccessService;
use classchat_server::server::access_token::RoomTokenIssuer;
use classchat_server::server::audit::AuditService;
use classchat_server::server::auth::{SessionValidator, issue_session_token};
use classchat_server::server::codec::MessageCodec;
use classchat_server::server::connection::{ConnectionSettings, run_accept_loop};
use classchat_server::server::health::{HealthState, spawn_health_server};
use classchat_server::server::http_api::{HttpApi, spawn_http_api};
use classchat_server::server::hub::{Hub, HubConfig, HubDeps};
use classchat_server::server::password::PasswordGate;
use classchat_server::server::rate_limiter::{RateLimiter, spawn_rate_limit_sweeper};
use classchat_server::server::revocation::{RevocationSet, spawn_revocation_sweeper};
use classchat_server::server::store::sqlite::SqliteStore;
use classchat_server::server::store::{InMemoryMessageStore, InMemoryRoomStore, MessageStore, RoomStore};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const DEFAULT_BIND: &str = "quic://127.0.0.1:18203";
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: classchat_server [--bind quic://host:port] [--config path]\n\
\x20      classchat_server --issue-token <subject> [--name text] [--role admin|teacher|student] [--ttl-secs n]\n\
\n\
Options:\n\
\t--bind         QUIC bind endpoint (default: quic://127.0.0.1:18203)\n\
\t--config       Config file (default: ~/.classchat/config.toml)\n\
\t--issue-token  Print a session token signed with the configured secret and exit\n\
\t--help         Show this help\n\
"
	);
	std::process::exit(2)
}

struct TokenRequest {
	subject: String,
	name: Option<String>,
	role: Role,
	ttl: Duration,
}

struct Args {
	bind: SocketAddr,
	config_path: Option<PathBuf>,
	issue_token: Option<TokenRequest>,
}

fn parse_bind(v: &str) -> Result<SocketAddr, String> {
	let raw = v.trim();
	let host_port = raw.strip_prefix("quic://").unwrap_or(raw);
	host_port
		.parse()
		.map_err(|e| format!("invalid bind endpoint {raw:?} (expected quic://ip:port): {e}"))
}

fn parse_args() -> Args {
	let mut bind_endpoint = DEFAULT_BIND.to_string();
	let mut config_path = None;
	let mut subject = None;
	let mut name = None;
	let mut role = Role::Student;
	let mut ttl = Duration::from_secs(3600);

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		let mut value = || it.next().filter(|v| !v.trim().is_empty()).unwrap_or_else(|| usage_and_exit());
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => bind_endpoint = value(),
			"--config" => config_path = Some(PathBuf::from(value())),
			"--issue-token" => subject = Some(value()),
			"--name" => name = Some(value()),
			"--role" => {
				role = value().parse().unwrap_or_else(|e| {
					eprintln!("--role: {e}");
					usage_and_exit();
				})
			}
			"--ttl-secs" => {
				ttl = value()
					.parse::<u64>()
					.ok()
					.filter(|s| *s > 0)
					.map(Duration::from_secs)
					.unwrap_or_else(|| usage_and_exit())
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let bind = parse_bind(&bind_endpoint).unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	Args {
		bind,
		config_path,
		issue_token: subject.map(|subject| TokenRequest { subject, name, role, ttl }),
	}
}

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,classchat_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("classchat_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

/// Configured secret, or a random one that only lives as long as this process.
fn secret_or_ephemeral(configured: Option<&SecretString>, what: &str) -> SecretString {
	match configured {
		Some(secret) => secret.clone(),
		None => {
			warn!(secret = what, "no secret configured; using an ephemeral one (tokens die with the process)");
			SecretString::new(MessageCodec::generate_key())
		}
	}
}

fn issue_token(cfg: &ServerConfig, req: TokenRequest) -> anyhow::Result<()> {
	let secret = cfg
		.server
		.session_hmac_secret
		.as_ref()
		.ok_or_else(|| anyhow!("session_hmac_secret is not configured; an issued token could never validate"))?;
	let subject = SubjectId::new(req.subject).context("invalid subject")?;
	let name = req.name.unwrap_or_else(|| subject.to_string());
	let identity = Identity::new(subject, name, req.role);
	let token = issue_session_token(&identity, req.ttl, secret).context("sign session token")?;
	println!("{token}");
	Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_rustls_crypto_provider();
	init_tracing();

	let args = parse_args();

	let config_path = match args.config_path {
		Some(path) => path,
		None => classchat_server::config::default_config_path()?,
	};
	let server_cfg = classchat_server::config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	if let Some(req) = args.issue_token {
		return issue_token(&server_cfg, req);
	}

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let health_state = HealthState::new();
	if let Some(bind) = server_cfg.server.health_bind.as_deref() {
		match bind.parse::<SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let session_secret = secret_or_ephemeral(server_cfg.server.session_hmac_secret.as_ref(), "session_hmac_secret");
	let room_secret = secret_or_ephemeral(server_cfg.server.room_token_secret.as_ref(), "room_token_secret");
	let codec = match server_cfg.crypto.message_key.as_ref() {
		Some(key) => MessageCodec::from_base64(key.expose()).context("crypto.message_key must be base64 of 32 bytes")?,
		None => {
			warn!("no message key configured; stored history becomes unreadable after restart");
			MessageCodec::from_base64(&MessageCodec::generate_key())?
		}
	};

	let (rooms, messages, audit): (Arc<dyn RoomStore>, Arc<dyn MessageStore>, AuditService) =
		if server_cfg.persistence.enabled {
			let Some(database_url) = server_cfg.persistence.database_url.as_deref() else {
				return Err(anyhow!("persistence enabled but no database_url configured"));
			};
			let store = Arc::new(
				SqliteStore::connect(database_url, server_cfg.persistence.history_capacity)
					.await
					.context("open sqlite store")?,
			);
			let audit = AuditService::sqlite(store.pool().clone());
			let rooms: Arc<dyn RoomStore> = store.clone();
			let messages: Arc<dyn MessageStore> = store;
			(rooms, messages, audit)
		} else {
			info!("persistence disabled; rooms and history are kept in memory");
			(
				Arc::new(InMemoryRoomStore::new()),
				Arc::new(InMemoryMessageStore::new(server_cfg.persistence.history_capacity)),
				AuditService::disabled(),
			)
		};

	let revocations = Arc::new(RevocationSet::new());
	let _revocation_sweeper = spawn_revocation_sweeper(Arc::clone(&revocations), SWEEP_INTERVAL);
	let sessions = SessionValidator::new(session_secret, revocations);

	let limiter = Arc::new(RateLimiter::new(server_cfg.rate_limits.clone()));
	let _limiter_sweeper = spawn_rate_limit_sweeper(Arc::clone(&limiter), SWEEP_INTERVAL);

	let room_tokens = RoomTokenIssuer::new(room_secret, server_cfg.server.room_token_ttl);

	let hub = Hub::new(
		HubConfig::from_settings(&server_cfg.server),
		HubDeps {
			sessions: sessions.clone(),
			room_tokens: room_tokens.clone(),
			rooms: Arc::clone(&rooms),
			messages: Arc::clone(&messages),
			codec,
			limiter: Arc::clone(&limiter),
			audit: audit.clone(),
		},
	);

	let access = Arc::new(
		RoomAccessService::new(
			rooms,
			messages,
			PasswordGate::new().context("init password hasher")?,
			room_tokens,
			Arc::new(hub.clone()),
			audit,
		)
		.allow_student_room_creation(server_cfg.server.allow_student_room_creation),
	);

	let http_listener = tokio::net::TcpListener::bind(&server_cfg.server.http_bind)
		.await
		.with_context(|| format!("bind http api on {}", server_cfg.server.http_bind))?;
	info!(addr = %server_cfg.server.http_bind, "http api listening");
	let api = Arc::new(HttpApi::new(access, sessions, limiter, hub.clone(), health_state.clone()));
	let _http = spawn_http_api(http_listener, api);

	let quic_cfg = QuicServerConfig::dev(args.bind);
	let endpoint = if let (Some(cert_path), Some(key_path)) = (
		server_cfg.server.tls_cert_path.as_deref(),
		server_cfg.server.tls_key_path.as_deref(),
	) {
		info!(cert = %cert_path.display(), key = %key_path.display(), "loading TLS cert/key");
		quic_cfg.bind_endpoint_with_tls(cert_path, key_path)?
	} else {
		let (endpoint, server_cert_der) = quic_cfg.bind_dev_endpoint()?;
		info!(
			bind = %args.bind,
			cert_der_len = server_cert_der.len(),
			"classchat_server: QUIC endpoint ready (dev self-signed cert)"
		);
		endpoint
	};

	health_state.mark_ready();

	run_accept_loop(endpoint, hub, ConnectionSettings::default()).await;

	Ok(())
}
