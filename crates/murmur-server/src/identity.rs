//! Identity verification at socket handshake time.
//!
//! A verifier sees the raw handshake (query string and `Authorization`
//! header) and yields the [`UserId`] the connection acts as. Nothing past the
//! handshake ever looks at credentials again.

use std::collections::HashMap;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;

use murmur_core::UserId;
use murmur_store::{Database, StoreError};

pub const USER_ID_PARAM: &str = "authenticated_user_id";
pub const AUTH_SCHEME: &str = "KULLO_V1";

static AUTH_PARAM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(\w+)= ?"([^"]+)""#).unwrap());

#[derive(Clone, Debug, Default)]
pub struct Handshake {
    pub query: HashMap<String, String>,
    pub authorization: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing credentials: {0}")]
    Missing(String),

    #[error("invalid credentials: {0}")]
    Invalid(String),

    #[error("unknown device {0}")]
    UnknownDevice(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, handshake: &Handshake) -> Result<UserId, AuthError>;
}

/// Trusts the `authenticated_user_id` query parameter as-is.
pub struct QueryParamVerifier;

#[async_trait]
impl IdentityVerifier for QueryParamVerifier {
    async fn verify(&self, handshake: &Handshake) -> Result<UserId, AuthError> {
        let raw = handshake
            .query
            .get(USER_ID_PARAM)
            .ok_or_else(|| AuthError::Missing(USER_ID_PARAM.into()))?;
        raw.parse()
            .map_err(|_| AuthError::Invalid(format!("{USER_ID_PARAM}={raw}")))
    }
}

/// Resolves the `deviceId` from a `KULLO_V1` authorization header to the
/// device's owner. Signatures are not checked.
pub struct DeviceOwnerVerifier {
    db: Database,
}

impl DeviceOwnerVerifier {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl IdentityVerifier for DeviceOwnerVerifier {
    async fn verify(&self, handshake: &Handshake) -> Result<UserId, AuthError> {
        let header = handshake
            .authorization
            .as_deref()
            .ok_or_else(|| AuthError::Missing("Authorization header".into()))?;
        let device_id = device_id_from_authorization(header)?;
        owner_of_device(&self.db, &device_id)
    }
}

/// Parse `KULLO_V1 key="value", key2="value2"` into its parameters.
pub fn parse_authorization(header: &str) -> Result<HashMap<String, String>, AuthError> {
    let rest = header
        .trim()
        .strip_prefix(AUTH_SCHEME)
        .ok_or_else(|| AuthError::Invalid(format!("expected {AUTH_SCHEME} scheme")))?;

    Ok(AUTH_PARAM
        .captures_iter(rest)
        .map(|c| (c[1].to_string(), c[2].to_string()))
        .collect())
}

pub fn device_id_from_authorization(header: &str) -> Result<String, AuthError> {
    parse_authorization(header)?
        .remove("deviceId")
        .ok_or_else(|| AuthError::Missing("deviceId".into()))
}

pub fn owner_of_device(db: &Database, device_id: &str) -> Result<UserId, AuthError> {
    let device = match db.devices().get(&Value::from(device_id)) {
        Ok(device) => device,
        Err(StoreError::NotFound(_)) => return Err(AuthError::UnknownDevice(device_id.into())),
        Err(e) => return Err(e.into()),
    };
    device
        .get("ownerId")
        .and_then(Value::as_i64)
        .map(UserId)
        .ok_or_else(|| AuthError::Invalid(format!("device {device_id} has no owner")))
}
