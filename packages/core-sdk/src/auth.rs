use std::convert::Infallible;

use anyhow::Result;
use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts, HeaderMap, HeaderValue},
};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{error::ApiError, server::AppState};

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /** \brief 用户 ID */
    pub id: i64,
    pub exp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthUser {
    pub id: i64,
}

/**
 * \brief 可选身份：令牌缺失或无效时为匿名。
 */
#[derive(Debug, Clone, Copy)]
pub struct OptionalUser(pub Option<AuthUser>);

impl OptionalUser {
    pub fn id(&self) -> Option<i64> {
        self.0.map(|u| u.id)
    }
}

/**
 * \brief 必需身份：令牌缺失或无效时返回 401。
 */
#[derive(Debug, Clone, Copy)]
pub struct RequiredUser(pub AuthUser);

impl FromRequestParts<AppState> for OptionalUser {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        Ok(Self(resolve_user(
            &parts.headers,
            state.config.jwt_secret.as_deref(),
        )))
    }
}

impl FromRequestParts<AppState> for RequiredUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        resolve_user(&parts.headers, state.config.jwt_secret.as_deref())
            .map(Self)
            .ok_or_else(|| ApiError::Unauthorized("没有访问权限".to_string()))
    }
}

/**
 * \brief 从 `Authorization: Bearer` 头解析用户。
 */
pub fn resolve_user(headers: &HeaderMap, secret: Option<&str>) -> Option<AuthUser> {
    let secret = secret.filter(|s| !s.is_empty())?;
    let token = extract_bearer(headers.get(AUTHORIZATION))?;
    let key = DecodingKey::from_secret(secret.as_bytes());
    let data = decode::<Claims>(&token, &key, &Validation::new(Algorithm::HS256)).ok()?;
    Some(AuthUser {
        id: data.claims.id,
    })
}

fn extract_bearer(header: Option<&HeaderValue>) -> Option<String> {
    let value = header?.to_str().ok()?;
    value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
}

/**
 * \brief 签发 HS256 令牌。
 */
pub fn issue_token(secret: &str, user_id: i64, ttl_secs: i64) -> Result<String> {
    let claims = Claims {
        id: user_id,
        exp: OffsetDateTime::now_utc().unix_timestamp() + ttl_secs,
    };
    Ok(encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?)
}
