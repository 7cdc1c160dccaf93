#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::{info, warn};

use crate::server::rate_limiter::{RateLimitPolicy, RateLimitRule};

pub const DEFAULT_HTTP_BIND: &str = "127.0.0.1:18280";
pub const DEFAULT_ROOM_TOKEN_TTL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_MAX_MESSAGE_CHARS: usize = 2000;
pub const DEFAULT_HISTORY_MAX: usize = 200;
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;
pub const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Wrapper that redacts in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

/// Default config path: `~/.classchat/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".classchat").join("config.toml"))
}

/// Load the server config from TOML at `path` plus `CLASSCHAT_*` env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);
	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub crypto: CryptoSettings,
	pub rate_limits: RateLimitPolicy,
	pub persistence: PersistenceSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// REST surface bind address (host:port).
	pub http_bind: String,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	/// PEM-encoded certificate path for QUIC/TLS.
	pub tls_cert_path: Option<PathBuf>,
	/// PEM-encoded private key path for QUIC/TLS.
	pub tls_key_path: Option<PathBuf>,
	/// HMAC secret for session credentials.
	pub session_hmac_secret: Option<SecretString>,
	/// HMAC secret for room-access tokens. Must differ from the session secret.
	pub room_token_secret: Option<SecretString>,
	pub room_token_ttl: Duration,
	pub max_message_chars: usize,
	/// Upper bound for a single history load.
	pub history_max: usize,
	/// Per-connection outbound event queue.
	pub outbound_queue_capacity: usize,
	pub allow_student_room_creation: bool,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			http_bind: DEFAULT_HTTP_BIND.to_string(),
			metrics_bind: None,
			health_bind: None,
			tls_cert_path: None,
			tls_key_path: None,
			session_hmac_secret: None,
			room_token_secret: None,
			room_token_ttl: DEFAULT_ROOM_TOKEN_TTL,
			max_message_chars: DEFAULT_MAX_MESSAGE_CHARS,
			history_max: DEFAULT_HISTORY_MAX,
			outbound_queue_capacity: DEFAULT_OUTBOUND_QUEUE_CAPACITY,
			allow_student_room_creation: false,
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct CryptoSettings {
	/// Base64 encoded 32-byte message key.
	pub message_key: Option<SecretString>,
}

#[derive(Debug, Clone)]
pub struct PersistenceSettings {
	pub enabled: bool,
	/// Database URL (`sqlite:`).
	pub database_url: Option<String>,
	/// Messages retained per room.
	pub history_capacity: usize,
}

impl Default for PersistenceSettings {
	fn default() -> Self {
		Self {
			enabled: false,
			database_url: None,
			history_capacity: DEFAULT_HISTORY_CAPACITY,
		}
	}
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self::from_file(FileConfig::default())
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	crypto: FileCryptoSettings,

	#[serde(default)]
	rate_limits: FileRateLimits,

	#[serde(default)]
	persistence: FilePersistenceSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	http_bind: Option<String>,
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	tls_cert_path: Option<String>,
	tls_key_path: Option<String>,
	session_hmac_secret: Option<String>,
	room_token_secret: Option<String>,
	room_token_ttl_secs: Option<u64>,
	max_message_chars: Option<usize>,
	history_max: Option<usize>,
	outbound_queue_capacity: Option<usize>,
	allow_student_room_creation: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileCryptoSettings {
	message_key: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct FileRule {
	limit: u32,
	window_secs: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileRateLimits {
	default: Option<FileRule>,

	/// Endpoint pattern -> rule, e.g. `"message.send" = { limit = 30, window_secs = 60 }`.
	#[serde(default)]
	rules: BTreeMap<String, FileRule>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	enabled: Option<bool>,
	database_url: Option<String>,
	history_capacity: Option<usize>,
}

fn non_empty(v: Option<String>) -> Option<String> {
	v.filter(|s| !s.trim().is_empty())
}

impl ServerConfig {
	/// Parse a TOML document without touching the environment.
	pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
		let file: FileConfig = toml::from_str(s).context("parse TOML")?;
		Ok(Self::from_file(file))
	}

	fn from_file(file: FileConfig) -> Self {
		let mut rate_limits = RateLimitPolicy::defaults();
		if let Some(rule) = file.rate_limits.default
			&& let Some(rule) = to_rule(rule)
		{
			rate_limits = rate_limits.with_default(rule);
		}
		for (pattern, rule) in file.rate_limits.rules {
			match to_rule(rule) {
				Some(r) if !pattern.trim().is_empty() => rate_limits = rate_limits.with_rule(pattern.trim(), r),
				_ => warn!(%pattern, "rate limit rule ignored (empty pattern, zero limit or zero window)"),
			}
		}

		Self {
			server: ServerSettings {
				http_bind: non_empty(file.server.http_bind).unwrap_or_else(|| DEFAULT_HTTP_BIND.to_string()),
				metrics_bind: non_empty(file.server.metrics_bind),
				health_bind: non_empty(file.server.health_bind),
				tls_cert_path: non_empty(file.server.tls_cert_path).map(PathBuf::from),
				tls_key_path: non_empty(file.server.tls_key_path).map(PathBuf::from),
				session_hmac_secret: non_empty(file.server.session_hmac_secret).map(SecretString::new),
				room_token_secret: non_empty(file.server.room_token_secret).map(SecretString::new),
				room_token_ttl: file
					.server
					.room_token_ttl_secs
					.filter(|v| *v > 0)
					.map(Duration::from_secs)
					.unwrap_or(DEFAULT_ROOM_TOKEN_TTL),
				max_message_chars: file
					.server
					.max_message_chars
					.filter(|v| *v > 0)
					.unwrap_or(DEFAULT_MAX_MESSAGE_CHARS),
				history_max: file.server.history_max.filter(|v| *v > 0).unwrap_or(DEFAULT_HISTORY_MAX),
				outbound_queue_capacity: file
					.server
					.outbound_queue_capacity
					.filter(|v| *v > 0)
					.unwrap_or(DEFAULT_OUTBOUND_QUEUE_CAPACITY),
				allow_student_room_creation: file.server.allow_student_room_creation.unwrap_or(false),
			},
			crypto: CryptoSettings {
				message_key: non_empty(file.crypto.message_key).map(SecretString::new),
			},
			rate_limits,
			persistence: PersistenceSettings {
				enabled: file.persistence.enabled.unwrap_or(false),
				database_url: non_empty(file.persistence.database_url),
				history_capacity: file
					.persistence
					.history_capacity
					.filter(|v| *v > 0)
					.unwrap_or(DEFAULT_HISTORY_CAPACITY),
			},
		}
	}
}

fn to_rule(rule: FileRule) -> Option<RateLimitRule> {
	if rule.limit == 0 || rule.window_secs == 0 {
		return None;
	}
	Some(RateLimitRule::new(rule.limit, Duration::from_secs(rule.window_secs)))
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
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
	apply_overrides_from(cfg, |key| std::env::var(key).ok());
}

/// Apply `CLASSCHAT_*` overrides read through `lookup`.
pub fn apply_overrides_from(cfg: &mut ServerConfig, lookup: impl Fn(&str) -> Option<String>) {
	let text = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

	if let Some(v) = text("CLASSCHAT_HTTP_BIND") {
		cfg.server.http_bind = v;
		info!("server config: http_bind overridden by env");
	}

	if let Some(v) = text("CLASSCHAT_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = text("CLASSCHAT_HEALTH_BIND") {
		cfg.server.health_bind = Some(v);
		info!("server config: health_bind overridden by env");
	}

	if let Some(v) = text("CLASSCHAT_SERVER_TLS_CERT") {
		cfg.server.tls_cert_path = Some(PathBuf::from(v));
		info!("server config: tls_cert_path overridden by env");
	}

	if let Some(v) = text("CLASSCHAT_SERVER_TLS_KEY") {
		cfg.server.tls_key_path = Some(PathBuf::from(v));
		info!("server config: tls_key_path overridden by env");
	}

	if let Some(v) = text("CLASSCHAT_SESSION_HMAC_SECRET") {
		cfg.server.session_hmac_secret = Some(SecretString::new(v));
		info!("server auth: session_hmac_secret overridden by env");
	}

	if let Some(v) = text("CLASSCHAT_ROOM_TOKEN_SECRET") {
		cfg.server.room_token_secret = Some(SecretString::new(v));
		info!("server auth: room_token_secret overridden by env");
	}

	if let Some(v) = text("CLASSCHAT_ROOM_TOKEN_TTL_SECS")
		&& let Ok(secs) = v.parse::<u64>()
		&& secs > 0
	{
		cfg.server.room_token_ttl = Duration::from_secs(secs);
		info!(secs, "server auth: room_token_ttl overridden by env");
	}

	if let Some(v) = text("CLASSCHAT_MAX_MESSAGE_CHARS")
		&& let Ok(chars) = v.parse::<usize>()
		&& chars > 0
	{
		cfg.server.max_message_chars = chars;
		info!(chars, "server config: max_message_chars overridden by env");
	}

	if let Some(v) = text("CLASSCHAT_HISTORY_MAX")
		&& let Ok(max) = v.parse::<usize>()
		&& max > 0
	{
		cfg.server.history_max = max;
		info!(max, "server config: history_max overridden by env");
	}

	if let Some(v) = text("CLASSCHAT_OUTBOUND_QUEUE_CAPACITY")
		&& let Ok(capacity) = v.parse::<usize>()
		&& capacity > 0
	{
		cfg.server.outbound_queue_capacity = capacity;
		info!(capacity, "server config: outbound_queue_capacity overridden by env");
	}

	if let Some(v) = text("CLASSCHAT_ALLOW_STUDENT_ROOM_CREATION")
		&& let Some(allow) = parse_env_bool(&v)
	{
		cfg.server.allow_student_room_creation = allow;
		info!(allow, "server config: allow_student_room_creation overridden by env");
	}

	if let Some(v) = text("CLASSCHAT_MESSAGE_KEY") {
		cfg.crypto.message_key = Some(SecretString::new(v));
		info!("crypto: message_key overridden by env");
	}

	if let Some(v) = text("CLASSCHAT_PERSISTENCE_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.persistence.enabled = enabled;
		info!(enabled, "persistence: enabled overridden by env");
	}

	if let Some(v) = text("CLASSCHAT_PERSISTENCE_DATABASE_URL") {
		cfg.persistence.database_url = Some(v);
		info!("persistence: database_url overridden by env");
	}

	if let Some(v) = text("CLASSCHAT_HISTORY_CAPACITY")
		&& let Ok(capacity) = v.parse::<usize>()
		&& capacity > 0
	{
		cfg.persistence.history_capacity = capacity;
		info!(capacity, "persistence: history_capacity overridden by env");
	}

	if let (Some(a), Some(b)) = (&cfg.server.session_hmac_secret, &cfg.server.room_token_secret)
		&& a == b
	{
		warn!("server auth: session and room-token secrets are identical; room tokens could be replayed as sessions");
	}
}
