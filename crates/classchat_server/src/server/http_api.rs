#![forbid(unsafe_code)]

//! REST surface for room lifecycle and access.
//!
//! Every route except the probes and `/stats` needs
//! `Authorization: Bearer <session token>`. Errors are JSON
//! `{ "error": code, "field"?: name, "detail": text }`.

use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Body, Incoming};
use hyper::header::{AUTHORIZATION, CONTENT_TYPE, HeaderValue, RETRY_AFTER};
use hyper::http::request::Parts;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::server::access::{CreateRoomRequest, JoinRoomRequest, RoomAccessService, UpdateRoomRequest};
use crate::server::auth::{Session, SessionValidator};
use crate::server::error::AccessError;
use crate::server::health::{HealthState, plain, probe_response};
use crate::server::hub::Hub;
use crate::server::rate_limiter::RateLimiter;

pub const DEFAULT_MAX_BODY_BYTES: usize = 64 * 1024;

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type ApiResponse = Response<Full<Bytes>>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GrantModeratorRequest {
	subject_id: String,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
	error: &'a str,
	#[serde(skip_serializing_if = "Option::is_none")]
	field: Option<&'a str>,
	detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route<'a> {
	CreateRoom,
	ListRooms,
	JoinRoom,
	GetRoom(&'a str),
	UpdateRoom(&'a str),
	DeleteRoom(&'a str),
	GrantModerator(&'a str),
	ListMembers(&'a str),
	RevokeSession,
}

impl<'a> Route<'a> {
	fn parse(method: &Method, segments: &[&'a str]) -> Option<Self> {
		let route = match (method.as_str(), segments) {
			("POST", &["rooms"]) => Route::CreateRoom,
			("GET", &["rooms"]) => Route::ListRooms,
			("POST", &["rooms", "join"]) => Route::JoinRoom,
			("GET", &["rooms", id]) => Route::GetRoom(id),
			("PATCH", &["rooms", id]) => Route::UpdateRoom(id),
			("DELETE", &["rooms", id]) => Route::DeleteRoom(id),
			("POST", &["rooms", id, "moderators"]) => Route::GrantModerator(id),
			("GET", &["rooms", id, "members"]) => Route::ListMembers(id),
			("POST", &["sessions", "revoke"]) => Route::RevokeSession,
			_ => return None,
		};
		Some(route)
	}

	/// Rate-limit endpoint name, appended to the subject in limiter keys.
	fn endpoint(self) -> &'static str {
		match self {
			Route::CreateRoom => "rooms.create",
			Route::JoinRoom => "rooms.join",
			Route::ListRooms | Route::GetRoom(_) | Route::ListMembers(_) => "rooms.read",
			Route::UpdateRoom(_) => "rooms.update",
			Route::DeleteRoom(_) => "rooms.delete",
			Route::GrantModerator(_) => "rooms.moderators",
			Route::RevokeSession => "sessions.revoke",
		}
	}
}

pub struct HttpApi {
	access: Arc<RoomAccessService>,
	sessions: SessionValidator,
	limiter: Arc<RateLimiter>,
	hub: Hub,
	health: HealthState,
	max_body_bytes: usize,
}

impl HttpApi {
	pub fn new(
		access: Arc<RoomAccessService>,
		sessions: SessionValidator,
		limiter: Arc<RateLimiter>,
		hub: Hub,
		health: HealthState,
	) -> Self {
		Self {
			access,
			sessions,
			limiter,
			hub,
			health,
			max_body_bytes: DEFAULT_MAX_BODY_BYTES,
		}
	}

	pub fn with_max_body_bytes(mut self, max: usize) -> Self {
		self.max_body_bytes = max;
		self
	}

	pub async fn handle<B>(&self, req: Request<B>) -> ApiResponse
	where
		B: Body,
		B::Error: Into<BoxError>,
	{
		let (parts, body) = req.into_parts();
		let path = parts.uri.path().to_owned();

		if parts.method == Method::GET
			&& let Some(resp) = probe_response(&path, &self.health)
		{
			return resp;
		}

		let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
		if parts.method == Method::GET && segments == ["stats"] {
			return json(StatusCode::OK, &self.hub.stats());
		}

		let Some(route) = Route::parse(&parts.method, &segments) else {
			return plain(StatusCode::NOT_FOUND, b"");
		};
		metrics::counter!("classchat_http_requests_total", "endpoint" => route.endpoint()).increment(1);

		match self.dispatch(route, &parts, body).await {
			Ok(resp) => resp,
			Err(err) => {
				match &err {
					AccessError::Persistence(e) => warn!(endpoint = route.endpoint(), error = %e, "http: storage failure"),
					AccessError::Internal(e) => warn!(endpoint = route.endpoint(), error = %e, "http: internal error"),
					other => debug!(endpoint = route.endpoint(), error = %other, "http: request rejected"),
				}
				metrics::counter!("classchat_http_errors_total", "code" => err.code()).increment(1);
				error_response(&err)
			}
		}
	}

	async fn dispatch<B>(&self, route: Route<'_>, parts: &Parts, body: B) -> Result<ApiResponse, AccessError>
	where
		B: Body,
		B::Error: Into<BoxError>,
	{
		let session = self.authenticate(&parts.headers)?;
		let caller = &session.identity;

		let admission = self
			.limiter
			.try_admit(&format!("{}:{}", caller.subject_id, route.endpoint()));
		if !admission.allowed {
			return Err(AccessError::RateLimited {
				retry_after_secs: admission.retry_after_secs,
			});
		}

		match route {
			Route::CreateRoom => {
				let req: CreateRoomRequest = read_json(body, self.max_body_bytes).await?;
				let details = self.access.create_room(caller, req).await?;
				Ok(json(StatusCode::CREATED, &details))
			}
			Route::ListRooms => Ok(json(StatusCode::OK, &self.access.list_rooms().await?)),
			Route::JoinRoom => {
				let req: JoinRoomRequest = read_json(body, self.max_body_bytes).await?;
				Ok(json(StatusCode::OK, &self.access.join_room(caller, req).await?))
			}
			Route::GetRoom(id) => Ok(json(StatusCode::OK, &self.access.get_room(caller, id).await?)),
			Route::UpdateRoom(id) => {
				let req: UpdateRoomRequest = read_json(body, self.max_body_bytes).await?;
				Ok(json(StatusCode::OK, &self.access.update_room(caller, id, req).await?))
			}
			Route::DeleteRoom(id) => {
				self.access.delete_room(caller, id).await?;
				Ok(plain(StatusCode::NO_CONTENT, b""))
			}
			Route::GrantModerator(id) => {
				let req: GrantModeratorRequest = read_json(body, self.max_body_bytes).await?;
				self.access.grant_moderator(caller, id, &req.subject_id).await?;
				Ok(plain(StatusCode::NO_CONTENT, b""))
			}
			Route::ListMembers(id) => Ok(json(StatusCode::OK, &self.access.list_members(caller, id).await?)),
			Route::RevokeSession => {
				self.sessions.revoke(&session);
				debug!(subject = %caller.subject_id, "http: session revoked");
				metrics::counter!("classchat_sessions_revoked_total").increment(1);
				Ok(plain(StatusCode::NO_CONTENT, b""))
			}
		}
	}

	fn authenticate(&self, headers: &HeaderMap) -> Result<Session, AccessError> {
		let token = bearer(headers).ok_or(AccessError::Unauthenticated)?;
		self.sessions.validate(token).map_err(|e| {
			debug!(reason = %e, "http: session rejected");
			metrics::counter!("classchat_auth_failures_total", "stage" => "http").increment(1);
			AccessError::from(e)
		})
	}
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
	headers
		.get(AUTHORIZATION)?
		.to_str()
		.ok()?
		.strip_prefix("Bearer ")
		.map(str::trim)
		.filter(|t| !t.is_empty())
}

async fn read_json<B, T>(body: B, limit: usize) -> Result<T, AccessError>
where
	B: Body,
	B::Error: Into<BoxError>,
	T: DeserializeOwned,
{
	let bytes = Limited::new(body, limit)
		.collect()
		.await
		.map_err(|e| AccessError::validation("body", format!("unreadable body: {e}")))?
		.to_bytes();
	serde_json::from_slice(&bytes).map_err(|e| AccessError::validation("body", e.to_string()))
}

fn json<T: Serialize>(status: StatusCode, value: &T) -> ApiResponse {
	match serde_json::to_vec(value) {
		Ok(body) => {
			let mut resp = Response::new(Full::new(Bytes::from(body)));
			*resp.status_mut() = status;
			resp.headers_mut()
				.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
			resp
		}
		Err(err) => {
			warn!(error = %err, "http: failed to encode response");
			plain(StatusCode::INTERNAL_SERVER_ERROR, b"")
		}
	}
}

fn error_response(err: &AccessError) -> ApiResponse {
	let (field, detail) = match err {
		AccessError::Validation { field, reason } => (Some(*field), reason.clone()),
		AccessError::Persistence(_) => (None, "storage unavailable".to_string()),
		AccessError::Internal(_) => (None, "internal error".to_string()),
		other => (None, other.to_string()),
	};
	let mut resp = json(
		err.status(),
		&ErrorBody {
			error: err.code(),
			field,
			detail,
		},
	);
	if let AccessError::RateLimited { retry_after_secs } = err {
		resp.headers_mut().insert(RETRY_AFTER, HeaderValue::from(*retry_after_secs));
	}
	resp
}

pub fn spawn_http_api(listener: TcpListener, api: Arc<HttpApi>) -> JoinHandle<()> {
	tokio::spawn(async move {
		if let Err(err) = run_http_api(listener, api).await {
			warn!(error = %err, "http api stopped");
		}
	})
}

async fn run_http_api(listener: TcpListener, api: Arc<HttpApi>) -> anyhow::Result<()> {
	loop {
		let (stream, peer) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let api = Arc::clone(&api);
		tokio::spawn(async move {
			let service = service_fn(move |req: Request<Incoming>| {
				let api = Arc::clone(&api);
				async move { Ok::<_, Infallible>(api.handle(req).await) }
			});
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				debug!(%peer, error = %err, "http connection error");
			}
		});
	}
}

