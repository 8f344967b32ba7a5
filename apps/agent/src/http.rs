//! Homeserver client-server API.
//!
//! [`MatrixApi`] is the seam the rest of the agent talks to; [`MatrixClient`]
//! implements it over reqwest. Responses are mapped onto [`MxError`]: 401
//! and unknown-token errors become `AuthFailure`, connection problems and
//! 5xx/429 become retryable `NetworkFailure`/`Timeout`.

use std::time::Duration;

use async_trait::async_trait;
use mxagent_shared::api::auth::{LoginRequest, LoginResponse, MatrixErrorBody, WhoAmIResponse};
use mxagent_shared::api::devices::DevicesResponse;
use mxagent_shared::api::events::{JoinedMembersResponse, ResolveAliasResponse, SendEventResponse};
use mxagent_shared::api::keys::{
    KeysClaimRequest, KeysClaimResponse, KeysQueryRequest, KeysQueryResponse, KeysUploadRequest,
    KeysUploadResponse,
};
use mxagent_shared::api::room_keys::{BackupVersionResponse, RoomKeyBackup, RoomKeysResponse};
use mxagent_shared::api::sync::{MessagesResponse, SyncResponse};
use mxagent_shared::api::to_device::SendToDeviceRequest;
use mxagent_shared::error::MxError;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde_json::Value;

const CLIENT_PREFIX: [&str; 3] = ["_matrix", "client", "v3"];
const TIMELINE_LIMIT: u32 = 50;
/// Slack on top of the server-side long-poll timeout.
const SYNC_GRACE: Duration = Duration::from_secs(15);

#[async_trait]
pub trait MatrixApi: Send + Sync {
    async fn login(&self, request: &LoginRequest) -> Result<LoginResponse, MxError>;
    async fn whoami(&self) -> Result<WhoAmIResponse, MxError>;
    async fn logout(&self) -> Result<(), MxError>;
    async fn sync(&self, since: Option<&str>, timeout: Duration) -> Result<SyncResponse, MxError>;
    async fn upload_keys(&self, request: &KeysUploadRequest) -> Result<KeysUploadResponse, MxError>;
    async fn query_keys(&self, request: &KeysQueryRequest) -> Result<KeysQueryResponse, MxError>;
    async fn claim_keys(&self, request: &KeysClaimRequest) -> Result<KeysClaimResponse, MxError>;
    /// `txn_id` makes the PUT idempotent across retries.
    async fn send_to_device(
        &self,
        event_type: &str,
        txn_id: &str,
        request: &SendToDeviceRequest,
    ) -> Result<(), MxError>;
    async fn send_room_event(
        &self,
        room_id: &str,
        event_type: &str,
        txn_id: &str,
        content: &Value,
    ) -> Result<SendEventResponse, MxError>;
    async fn room_messages(&self, room_id: &str, limit: u32) -> Result<MessagesResponse, MxError>;
    async fn joined_members(&self, room_id: &str) -> Result<JoinedMembersResponse, MxError>;
    async fn resolve_alias(&self, alias: &str) -> Result<ResolveAliasResponse, MxError>;
    async fn devices(&self) -> Result<DevicesResponse, MxError>;
    /// Global account data of `event_type`, or `None` if unset.
    async fn account_data(&self, user_id: &str, event_type: &str) -> Result<Option<Value>, MxError>;
    /// Current key backup version, or `None` if no backup exists.
    async fn backup_version(&self) -> Result<Option<BackupVersionResponse>, MxError>;
    /// Backed-up keys of `version`, for one room or all rooms.
    async fn room_keys(&self, version: &str, room_id: Option<&str>) -> Result<RoomKeysResponse, MxError>;
}

/// reqwest-backed [`MatrixApi`].
pub struct MatrixClient {
    http: Client,
    base: Url,
    access_token: Option<String>,
}

impl std::fmt::Debug for MatrixClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatrixClient")
            .field("base", &self.base.as_str())
            .field("access_token", &self.access_token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

pub(crate) fn network_error(e: reqwest::Error) -> MxError {
    if e.is_timeout() {
        MxError::Timeout("homeserver request timed out".into())
    } else if e.is_connect() {
        MxError::NetworkFailure(format!("could not connect to homeserver: {e}"))
    } else if e.is_decode() {
        MxError::Protocol(format!("unexpected response body: {e}"))
    } else {
        MxError::NetworkFailure(e.to_string())
    }
}

async fn error_from_response(resp: Response, context: &str) -> MxError {
    let status = resp.status();
    let body = resp.json::<MatrixErrorBody>().await.ok();
    let detail = match &body {
        Some(b) if !b.errcode.is_empty() => format!("{context}: {} {} (HTTP {status})", b.errcode, b.error),
        _ => format!("{context} (HTTP {status})"),
    };
    let errcode = body.as_ref().map(|b| b.errcode.as_str()).unwrap_or("");

    match (status, errcode) {
        (StatusCode::UNAUTHORIZED, _) | (_, "M_UNKNOWN_TOKEN" | "M_MISSING_TOKEN") => {
            MxError::AuthFailure(detail)
        }
        (StatusCode::FORBIDDEN, "M_FORBIDDEN" | "M_USER_DEACTIVATED") if context == "login" => {
            MxError::AuthFailure(detail)
        }
        (StatusCode::TOO_MANY_REQUESTS, _) => MxError::NetworkFailure(detail),
        (s, _) if s.is_server_error() => MxError::NetworkFailure(detail),
        _ => MxError::Protocol(detail),
    }
}

impl MatrixClient {
    pub fn new(homeserver: &str, access_token: Option<String>) -> Result<Self, MxError> {
        let base = Url::parse(homeserver)
            .map_err(|e| MxError::Config(format!("invalid homeserver URL {homeserver:?}: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(MxError::Config(format!("invalid homeserver URL {homeserver:?}")));
        }
        let http = Client::builder()
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("mxagent/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| MxError::Config(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            http,
            base,
            access_token,
        })
    }

    pub fn set_access_token(&mut self, token: String) {
        self.access_token = Some(token);
    }

    fn url(&self, segments: &[&str]) -> Result<Url, MxError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| MxError::Config("homeserver URL cannot take a path".into()))?
            .pop_if_empty()
            .extend(CLIENT_PREFIX)
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, segments: &[&str]) -> Result<RequestBuilder, MxError> {
        let builder = self.http.request(method, self.url(segments)?);
        Ok(match &self.access_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        })
    }

    async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder, context: &str) -> Result<T, MxError> {
        let resp = builder.send().await.map_err(network_error)?;
        if !resp.status().is_success() {
            return Err(error_from_response(resp, context).await);
        }
        resp.json::<T>().await.map_err(network_error)
    }

    /// Like [`Self::send`] but maps 404 to `None`.
    async fn send_optional<T: DeserializeOwned>(
        &self,
        builder: RequestBuilder,
        context: &str,
    ) -> Result<Option<T>, MxError> {
        let resp = builder.send().await.map_err(network_error)?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(error_from_response(resp, context).await);
        }
        resp.json::<T>().await.map(Some).map_err(network_error)
    }
}

#[async_trait]
impl MatrixApi for MatrixClient {
    async fn login(&self, request: &LoginRequest) -> Result<LoginResponse, MxError> {
        let builder = self.http.post(self.url(&["login"])?).json(request);
        self.send(builder, "login").await
    }

    async fn whoami(&self) -> Result<WhoAmIResponse, MxError> {
        let builder = self.request(Method::GET, &["account", "whoami"])?;
        self.send(builder, "whoami").await
    }

    async fn logout(&self) -> Result<(), MxError> {
        let builder = self.request(Method::POST, &["logout"])?.json(&serde_json::json!({}));
        let _: Value = self.send(builder, "logout").await?;
        Ok(())
    }

    async fn sync(&self, since: Option<&str>, timeout: Duration) -> Result<SyncResponse, MxError> {
        let filter = serde_json::json!({
            "room": { "timeline": { "limit": TIMELINE_LIMIT } }
        })
        .to_string();
        let timeout_ms = timeout.as_millis().to_string();
        let mut query: Vec<(&str, &str)> = vec![
            ("timeout", timeout_ms.as_str()),
            ("full_state", "false"),
            ("filter", filter.as_str()),
        ];
        if let Some(since) = since {
            query.push(("since", since));
        }
        let builder = self
            .request(Method::GET, &["sync"])?
            .query(&query)
            .timeout(timeout + SYNC_GRACE);
        self.send(builder, "sync").await
    }

    async fn upload_keys(&self, request: &KeysUploadRequest) -> Result<KeysUploadResponse, MxError> {
        let builder = self.request(Method::POST, &["keys", "upload"])?.json(request);
        self.send(builder, "keys/upload").await
    }

    async fn query_keys(&self, request: &KeysQueryRequest) -> Result<KeysQueryResponse, MxError> {
        let builder = self.request(Method::POST, &["keys", "query"])?.json(request);
        self.send(builder, "keys/query").await
    }

    async fn claim_keys(&self, request: &KeysClaimRequest) -> Result<KeysClaimResponse, MxError> {
        let builder = self.request(Method::POST, &["keys", "claim"])?.json(request);
        self.send(builder, "keys/claim").await
    }

    async fn send_to_device(
        &self,
        event_type: &str,
        txn_id: &str,
        request: &SendToDeviceRequest,
    ) -> Result<(), MxError> {
        let builder = self
            .request(Method::PUT, &["sendToDevice", event_type, txn_id])?
            .json(request);
        let _: Value = self.send(builder, "sendToDevice").await?;
        Ok(())
    }

    async fn send_room_event(
        &self,
        room_id: &str,
        event_type: &str,
        txn_id: &str,
        content: &Value,
    ) -> Result<SendEventResponse, MxError> {
        let builder = self
            .request(Method::PUT, &["rooms", room_id, "send", event_type, txn_id])?
            .json(content);
        self.send(builder, "send event").await
    }

    async fn room_messages(&self, room_id: &str, limit: u32) -> Result<MessagesResponse, MxError> {
        let builder = self
            .request(Method::GET, &["rooms", room_id, "messages"])?
            .query(&[("dir", "b".to_string()), ("limit", limit.to_string())]);
        self.send(builder, "room messages").await
    }

    async fn joined_members(&self, room_id: &str) -> Result<JoinedMembersResponse, MxError> {
        let builder = self.request(Method::GET, &["rooms", room_id, "joined_members"])?;
        self.send(builder, "joined members").await
    }

    async fn resolve_alias(&self, alias: &str) -> Result<ResolveAliasResponse, MxError> {
        let builder = self.request(Method::GET, &["directory", "room", alias])?;
        self.send(builder, "resolve alias").await
    }

    async fn devices(&self) -> Result<DevicesResponse, MxError> {
        let builder = self.request(Method::GET, &["devices"])?;
        self.send(builder, "devices").await
    }

    async fn account_data(&self, user_id: &str, event_type: &str) -> Result<Option<Value>, MxError> {
        let builder = self.request(Method::GET, &["user", user_id, "account_data", event_type])?;
        self.send_optional(builder, "account data").await
    }

    async fn backup_version(&self) -> Result<Option<BackupVersionResponse>, MxError> {
        let builder = self.request(Method::GET, &["room_keys", "version"])?;
        self.send_optional(builder, "backup version").await
    }

    async fn room_keys(&self, version: &str, room_id: Option<&str>) -> Result<RoomKeysResponse, MxError> {
        let Some(room) = room_id else {
            let builder = self
                .request(Method::GET, &["room_keys", "keys"])?
                .query(&[("version", version)]);
            return Ok(self.send_optional(builder, "room keys").await?.unwrap_or_default());
        };
        // The per-room endpoint returns a bare `{sessions}` object.
        let builder = self
            .request(Method::GET, &["room_keys", "keys", room])?
            .query(&[("version", version)]);
        let mut response = RoomKeysResponse::default();
        if let Some(backup) = self.send_optional::<RoomKeyBackup>(builder, "room keys").await? {
            response.rooms.insert(room.into(), backup);
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client(server: &MockServer) -> MatrixClient {
        MatrixClient::new(&server.uri(), Some("tok".into())).unwrap()
    }

    #[tokio::test]
    async fn whoami_sends_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/_matrix/client/v3/account/whoami"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "user_id": "@bot:hs",
                "device_id": "DEV"
            })))
            .mount(&server)
            .await;

        let who = client(&server).await.whoami().await.unwrap();
        assert_eq!(who.user_id.as_str(), "@bot:hs");
    }

    #[tokio::test]
    async fn unknown_token_is_auth_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/_matrix/client/v3/sync"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
                "errcode": "M_UNKNOWN_TOKEN",
                "error": "Invalid access token"
            })))
            .mount(&server)
            .await;

        let err = client(&server)
            .await
            .sync(None, Duration::from_millis(0))
            .await
            .unwrap_err();
        assert!(matches!(err, MxError::AuthFailure(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn server_errors_are_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/_matrix/client/v3/devices"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let err = client(&server).await.devices().await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn missing_backup_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/_matrix/client/v3/room_keys/version"))
            .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({
                "errcode": "M_NOT_FOUND",
                "error": "No current backup version"
            })))
            .mount(&server)
            .await;

        assert!(client(&server).await.backup_version().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sync_passes_since_and_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/_matrix/client/v3/sync"))
            .and(query_param("since", "s42"))
            .and(query_param("timeout", "1000"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "next_batch": "s43"
            })))
            .mount(&server)
            .await;

        let resp = client(&server)
            .await
            .sync(Some("s42"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(resp.next_batch, "s43");
    }

    #[test]
    fn room_ids_are_kept_in_one_path_segment() {
        let c = MatrixClient::new("https://hs.example/", None).unwrap();
        let url = c.url(&["rooms", "!abc:hs.example", "send", "m.room.encrypted", "t1"]).unwrap();
        assert_eq!(
            url.as_str(),
            "https://hs.example/_matrix/client/v3/rooms/!abc:hs.example/send/m.room.encrypted/t1"
        );
        let alias = c.url(&["directory", "room", "#ops:hs.example"]).unwrap();
        assert!(alias.as_str().ends_with("/directory/room/%23ops:hs.example"));
    }

    #[test]
    fn invalid_homeserver_is_config_error() {
        assert!(matches!(MatrixClient::new("not a url", None), Err(MxError::Config(_))));
    }
}
