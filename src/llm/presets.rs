//! 后端预设：provider 名 -> 默认 base_url / 凭据环境变量
//!
//! - openai：官方端点，`OPENAI_API_KEY`
//! - deepseek：https://api.deepseek.com，`DEEPSEEK_API_KEY`
//! - gemini：Google 的 OpenAI 兼容层，`GEMINI_API_KEY`
//! - mock：无网络，测试与本地演示

use std::str::FromStr;

use crate::core::ConfigError;

pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";
pub const DEEPSEEK_CHAT: &str = "deepseek-chat";
pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/openai";
pub const GEMINI_FLASH: &str = "gemini-2.0-flash";

/// 后端类型
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Provider {
    OpenAi,
    DeepSeek,
    Gemini,
    Mock,
}

impl Provider {
    pub fn parse(endpoint: &str, name: &str) -> Result<Self, ConfigError> {
        name.parse().map_err(|_| ConfigError::UnknownProvider {
            endpoint: endpoint.to_string(),
            provider: name.to_string(),
        })
    }

    /// 默认 base_url；None 表示使用 async-openai 的官方地址
    pub fn default_base_url(self) -> Option<&'static str> {
        match self {
            Self::DeepSeek => Some(DEEPSEEK_BASE_URL),
            Self::Gemini => Some(GEMINI_BASE_URL),
            Self::OpenAi | Self::Mock => None,
        }
    }

    /// 未显式配置 api_key_env 时读取的环境变量
    pub fn default_key_env(self) -> Option<&'static str> {
        match self {
            Self::OpenAi => Some("OPENAI_API_KEY"),
            Self::DeepSeek => Some("DEEPSEEK_API_KEY"),
            Self::Gemini => Some("GEMINI_API_KEY"),
            Self::Mock => None,
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            Self::OpenAi => "gpt-4o-mini",
            Self::DeepSeek => DEEPSEEK_CHAT,
            Self::Gemini => GEMINI_FLASH,
            Self::Mock => "mock",
        }
    }
}

impl FromStr for Provider {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" | "openai_compatible" => Ok(Self::OpenAi),
            "deepseek" => Ok(Self::DeepSeek),
            "gemini" | "google" => Ok(Self::Gemini),
            "mock" => Ok(Self::Mock),
            _ => Err(()),
        }
    }
}
