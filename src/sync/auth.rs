//! 登录认证与 token 提供者
//!
//! 认证流程本身只是一次表单请求（OAuth2 password flow），没有状态；
//! 引擎各处通过 `TokenProvider` 取 token，凭据的安全存储由宿主应用负责。

use crate::sync::types::{ErrorDetail, Token};
use anyhow::{Context, Result};
use std::sync::RwLock;
use tracing::{debug, info};

/// token 提供者接口
///
/// 宿主应用的 Keychain / 凭据仓库实现此接口；返回 `None` 表示当前未登录，
/// 调用方应把这种情况当作 `SyncError::Unauthorized` 处理。
pub trait TokenProvider: Send + Sync {
    fn token(&self) -> Option<String>;
}

/// 内存 token 提供者
///
/// 登录成功后 `set` 一次，登出时 `clear`。CLI 和测试直接使用它。
#[derive(Default)]
pub struct StaticTokenProvider {
    token: RwLock<Option<String>>,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: RwLock::new(Some(token.into())),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn set(&self, token: impl Into<String>) {
        if let Ok(mut guard) = self.token.write() {
            *guard = Some(token.into());
        }
    }

    pub fn clear(&self) {
        if let Ok(mut guard) = self.token.write() {
            *guard = None;
        }
    }
}

impl TokenProvider for StaticTokenProvider {
    fn token(&self) -> Option<String> {
        self.token.read().ok().and_then(|guard| guard.clone())
    }
}

/// 邮箱 + 密码登录，成功返回访问 token
///
/// 对应服务端 `POST /token`，请求体是 `application/x-www-form-urlencoded`
/// 的 `username` / `password` 字段。
pub async fn login_async(api_base_url: &str, email: &str, password: &str) -> Result<Token> {
    let client = reqwest::Client::new();
    let url = format!("{}/token", api_base_url);

    info!("[Auth] 🔐 正在登录...");
    debug!("[Auth]   URL: {}", url);
    debug!("[Auth]   邮箱: {}", email);

    let response = client
        .post(&url)
        .form(&[("username", email), ("password", password)])
        .send()
        .await
        .context("登录请求失败")?;

    let status = response.status();
    let text = response.text().await.context("读取登录响应失败")?;

    if !status.is_success() {
        // 尽量透传服务端的 detail 信息
        if let Ok(err) = serde_json::from_str::<ErrorDetail>(&text) {
            return Err(anyhow::anyhow!("登录失败 {}: {}", status, err.detail));
        }
        return Err(anyhow::anyhow!("登录失败，HTTP 错误 {}: {}", status, text));
    }

    let token: Token = serde_json::from_str(&text)
        .with_context(|| format!("解析登录响应失败，原始响应: {}", text))?;

    info!("[Auth] ✅ 登录成功");
    Ok(token)
}
