use crate::ids::{DeviceId, UserId};
use serde::{Deserialize, Serialize};

/// User identifier inside a password login.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserIdentifier {
    #[serde(rename = "type")]
    pub kind: String,
    pub user: String,
}

/// `POST /login` body for `m.login.password`.
#[derive(Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub identifier: UserIdentifier,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<DeviceId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_device_display_name: Option<String>,
}

impl LoginRequest {
    pub fn password(user: &str, password: &str, display_name: Option<String>) -> Self {
        Self {
            kind: "m.login.password".into(),
            identifier: UserIdentifier {
                kind: "m.id.user".into(),
                user: user.to_string(),
            },
            password: password.to_string(),
            device_id: None,
            initial_device_display_name: display_name,
        }
    }
}

impl std::fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginRequest")
            .field("identifier", &self.identifier)
            .field("password", &"[REDACTED]")
            .field("initial_device_display_name", &self.initial_device_display_name)
            .finish()
    }
}

/// `POST /login` response.
#[derive(Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub user_id: UserId,
    pub access_token: String,
    pub device_id: DeviceId,
}

impl std::fmt::Debug for LoginResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginResponse")
            .field("user_id", &self.user_id)
            .field("access_token", &"[REDACTED]")
            .field("device_id", &self.device_id)
            .finish()
    }
}

/// `GET /account/whoami` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhoAmIResponse {
    pub user_id: UserId,
    #[serde(default)]
    pub device_id: Option<DeviceId>,
}

/// Standard Matrix error body (`errcode` + `error`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatrixErrorBody {
    #[serde(default)]
    pub errcode: String,
    #[serde(default)]
    pub error: String,
}
