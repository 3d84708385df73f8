// Copyright (C) 2026 StarHuntingGames
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use lok_common::CodecError;
use thiserror::Error;

pub const CODE_NO_AUTH: &str = "no_auth";
pub const CODE_NOT_ONLINE: &str = "not_online";
pub const CODE_NEED_CAPTCHA: &str = "need_captcha";
pub const CODE_DUPLICATED: &str = "duplicated";
pub const CODE_EXCEED_LIMIT_PACKET: &str = "exceed_limit_packet";
pub const CODE_CRYSTAL_QUOTA: &str = "exceed_crystal_daily_quota";
pub const CODE_FULL_TASK: &str = "full_task";
pub const CODE_INSUFFICIENT_ACTION_POINT: &str = "insufficient_actionpoint";
pub const CODE_NOT_ENOUGH_TROOP: &str = "not_enough_troop";
pub const CODE_NO_TROOPS: &str = "no_troops";
pub const CODE_YET_IN_COOLTIME: &str = "yet_in_cooltime";
pub const CODE_NOT_ENOUGH_MP: &str = "not_enough_mp";
pub const CODE_SAME_TARGET: &str = "same_target";
pub const CODE_CAPACITY: &str = "march_capacity";

/// Every failure a backend call can surface to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("session is not authenticated ({0})")]
    NotAuthenticated(String),
    #[error("backend rate limit reached")]
    RateLimited,
    #[error("backend requested a captcha")]
    Captcha,
    #[error("daily quota exceeded")]
    QuotaExceeded,
    #[error("duplicated request")]
    Duplicated,
    #[error("business error: {0}")]
    Business(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("handshake failed: {0}")]
    Handshake(String),
}

impl ApiError {
    pub fn from_code(code: &str) -> Self {
        match code {
            CODE_NO_AUTH | CODE_NOT_ONLINE => ApiError::NotAuthenticated(code.to_string()),
            CODE_NEED_CAPTCHA => ApiError::Captcha,
            CODE_DUPLICATED => ApiError::Duplicated,
            CODE_EXCEED_LIMIT_PACKET => ApiError::RateLimited,
            CODE_CRYSTAL_QUOTA => ApiError::QuotaExceeded,
            other => ApiError::Business(other.to_string()),
        }
    }

    pub fn business(code: &str) -> Self {
        ApiError::Business(code.to_string())
    }

    pub fn is_session_invalid(&self) -> bool {
        matches!(self, ApiError::NotAuthenticated(_))
    }

    /// Faults that must leave the engine instead of being retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ApiError::Auth(_) | ApiError::Handshake(_))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ApiError::Transport(_) | ApiError::Decode(_))
    }

    pub fn business_code(&self) -> Option<&str> {
        match self {
            ApiError::Business(code) => Some(code.as_str()),
            _ => None,
        }
    }
}

impl From<CodecError> for ApiError {
    fn from(error: CodecError) -> Self {
        ApiError::Decode(error.to_string())
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(error: reqwest::Error) -> Self {
        ApiError::Transport(error.to_string())
    }
}
