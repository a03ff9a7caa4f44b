//! Admin authentication: a pluggable user store, argon2 password checks and
//! HS256 session tokens carried in the `auth-token` cookie or a bearer header.

use crate::errors::{AppError, JsonBody};
use crate::state::AppState;
use argon2::password_hash::{
    rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString,
};
use argon2::Argon2;
use async_trait::async_trait;
use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;
use tracing::{info, warn};

pub const SESSION_COOKIE: &str = "auth-token";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Member,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub name: String,
    pub role: Role,
}

/// A user plus its argon2 PHC password hash, as stored in `users.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    #[serde(flatten)]
    pub user: User,
    pub password_hash: String,
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_email(&self, email: &str) -> Option<UserRecord>;
}

#[derive(Debug, Default)]
pub struct FileUserStore {
    records: Vec<UserRecord>,
}

impl FileUserStore {
    pub fn from_records(records: Vec<UserRecord>) -> Self {
        Self { records }
    }

    pub async fn load(path: &Path) -> Result<Self, AppError> {
        match fs::read(path).await {
            Ok(bytes) => {
                let records: Vec<UserRecord> = serde_json::from_slice(&bytes)
                    .map_err(|err| AppError::storage(format!("{}: {err}", path.display())))?;
                info!(users = records.len(), "loaded user store");
                Ok(Self::from_records(records))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                warn!(
                    "no user store at {}, every login will be refused",
                    path.display()
                );
                Ok(Self::default())
            }
            Err(err) => Err(AppError::storage(format!("{}: {err}", path.display()))),
        }
    }
}

#[async_trait]
impl UserStore for FileUserStore {
    async fn find_by_email(&self, email: &str) -> Option<UserRecord> {
        self.records
            .iter()
            .find(|record| record.user.email.eq_ignore_ascii_case(email.trim()))
            .cloned()
    }
}

pub fn hash_password(password: &str) -> Result<String, AppError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(AppError::internal)
}

pub async fn authenticate(store: &dyn UserStore, email: &str, password: &str) -> Option<User> {
    let record = store.find_by_email(email).await?;
    let parsed = PasswordHash::new(&record.password_hash).ok()?;
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .ok()?;
    Some(record.user)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Claims {
    sub: String,
    email: String,
    name: String,
    role: Role,
    iat: i64,
    exp: i64,
}

pub struct SessionKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl SessionKeys {
    pub fn new(secret: &str, ttl: Duration) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn create_session(&self, user: &User) -> Result<String, AppError> {
        let issued = Utc::now();
        let claims = Claims {
            sub: user.id.clone(),
            email: user.email.clone(),
            name: user.name.clone(),
            role: user.role,
            iat: issued.timestamp(),
            exp: (issued + self.ttl).timestamp(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding).map_err(AppError::internal)
    }

    pub fn verify_session(&self, token: &str) -> Option<User> {
        let validation = Validation::new(Algorithm::HS256);
        let data = decode::<Claims>(token, &self.decoding, &validation).ok()?;
        Some(User {
            id: data.claims.sub,
            email: data.claims.email,
            name: data.claims.name,
            role: data.claims.role,
        })
    }
}

/// Rejects requests without a valid session and exposes the [`User`] to handlers.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = session_token(req.headers())
        .ok_or_else(|| AppError::unauthorized("Authentication required"))?;
    let user = state
        .sessions
        .verify_session(&token)
        .ok_or_else(|| AppError::unauthorized("Invalid or expired session"))?;

    req.extensions_mut().insert(user);
    Ok(next.run(req).await)
}

fn session_token(headers: &HeaderMap) -> Option<String> {
    if let Some(bearer) = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
    {
        return Some(bearer.trim().to_string());
    }

    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .find_map(|pair| {
            pair.trim()
                .strip_prefix(SESSION_COOKIE)
                .and_then(|rest| rest.strip_prefix('='))
                .map(str::to_string)
        })
        .filter(|token| !token.is_empty())
}

fn session_cookie(token: &str, max_age: Duration) -> String {
    format!(
        "{SESSION_COOKIE}={token}; HttpOnly; SameSite=Lax; Path=/; Max-Age={}",
        max_age.num_seconds()
    )
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub success: bool,
    pub user: User,
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct CheckResponse {
    pub authenticated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
}

#[derive(Debug, Serialize)]
pub struct LogoutResponse {
    pub success: bool,
}

pub async fn login(
    State(state): State<AppState>,
    JsonBody(payload): JsonBody<LoginRequest>,
) -> Result<Response, AppError> {
    let (Some(email), Some(password)) = (payload.email, payload.password) else {
        return Err(AppError::validation("Email and password are required"));
    };

    let Some(user) = authenticate(state.users.as_ref(), &email, &password).await else {
        warn!(email = %email, "login refused");
        return Err(AppError::unauthorized("Invalid email or password"));
    };

    let token = state.sessions.create_session(&user)?;
    info!(email = %user.email, "login");

    let cookie = session_cookie(&token, state.sessions.ttl());
    Ok((
        [(header::SET_COOKIE, cookie)],
        Json(LoginResponse {
            success: true,
            user,
            token,
        }),
    )
        .into_response())
}

pub async fn logout() -> impl IntoResponse {
    (
        [(header::SET_COOKIE, session_cookie("", Duration::zero()))],
        Json(LogoutResponse { success: true }),
    )
}

pub async fn check(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    match session_token(&headers).and_then(|token| state.sessions.verify_session(&token)) {
        Some(user) => (
            StatusCode::OK,
            Json(CheckResponse {
                authenticated: true,
                user: Some(user),
            }),
        ),
        None => (
            StatusCode::UNAUTHORIZED,
            Json(CheckResponse {
                authenticated: false,
                user: None,
            }),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    const SECRET: &str = "test-secret-test-secret-test-secret";

    fn admin() -> User {
        User {
            id: "1".to_string(),
            email: "admin@stokvel.test".to_string(),
            name: "Admin User".to_string(),
            role: Role::Admin,
        }
    }

    fn store() -> FileUserStore {
        FileUserStore::from_records(vec![UserRecord {
            user: admin(),
            password_hash: hash_password("correct horse").unwrap(),
        }])
    }

    #[tokio::test]
    async fn authenticate_checks_password() {
        let store = store();
        assert_eq!(
            authenticate(&store, "ADMIN@stokvel.test", "correct horse").await,
            Some(admin())
        );
        assert_eq!(authenticate(&store, "admin@stokvel.test", "wrong").await, None);
        assert_eq!(authenticate(&store, "nobody@stokvel.test", "correct horse").await, None);
    }

    #[test]
    fn session_round_trip_and_tamper_rejection() {
        let keys = SessionKeys::new(SECRET, Duration::hours(1));
        let token = keys.create_session(&admin()).unwrap();
        assert_eq!(keys.verify_session(&token), Some(admin()));

        let other = SessionKeys::new("another-secret-another-secret-xx", Duration::hours(1));
        assert_eq!(other.verify_session(&token), None);
        assert_eq!(keys.verify_session("not.a.token"), None);
    }

    #[test]
    fn expired_session_is_rejected() {
        let keys = SessionKeys::new(SECRET, Duration::hours(-2));
        let token = keys.create_session(&admin()).unwrap();
        assert_eq!(keys.verify_session(&token), None);
    }

    #[test]
    fn token_is_read_from_bearer_or_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; auth-token=abc.def.ghi"),
        );
        assert_eq!(session_token(&headers).as_deref(), Some("abc.def.ghi"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer xyz"));
        assert_eq!(session_token(&headers).as_deref(), Some("xyz"));

        let mut cleared = HeaderMap::new();
        cleared.insert(header::COOKIE, HeaderValue::from_static("auth-token="));
        assert_eq!(session_token(&cleared), None);
    }

    #[tokio::test]
    async fn missing_user_file_means_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileUserStore::load(&dir.path().join("users.json")).await.unwrap();
        assert!(store.find_by_email("admin@stokvel.test").await.is_none());
    }

    #[tokio::test]
    async fn user_file_uses_camel_case_hash_field() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");
        let hash = hash_password("pw").unwrap();
        let raw = serde_json::json!([{
            "id": "7",
            "email": "treasurer@stokvel.test",
            "name": "Treasurer",
            "role": "member",
            "passwordHash": hash,
        }]);
        std::fs::write(&path, raw.to_string()).unwrap();

        let store = FileUserStore::load(&path).await.unwrap();
        let user = authenticate(&store, "treasurer@stokvel.test", "pw").await.unwrap();
        assert_eq!(user.role, Role::Member);
    }
}
