//! 通用 HTTP 辅助类型

use anyhow::Context;
use tracing::{debug, error};

/// 远程接口的错误响应体（PostgREST / 边缘函数）
#[derive(Debug, serde::Deserialize)]
pub struct ApiErrorBody {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default, alias = "error")]
    pub message: Option<String>,
}

/// 通用 HTTP 响应处理函数：检查状态码并反序列化响应体
///
/// 所有 API 都可以共用此方法
pub async fn handle_http_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    operation_name: &str,
) -> anyhow::Result<T> {
    let status = response.status();

    // 读取 body bytes（只能读取一次）
    let body_bytes = response.bytes().await.context("读取响应 body 失败")?;
    let body_str = String::from_utf8_lossy(&body_bytes);
    debug!("[HTTP] {}响应 Body: {}", operation_name, body_str);

    if !status.is_success() {
        let detail = serde_json::from_slice::<ApiErrorBody>(&body_bytes)
            .ok()
            .and_then(|b| b.message)
            .unwrap_or_else(|| body_str.to_string());
        error!(
            "[HTTP] {}请求失败，HTTP状态: {}, 响应: {}",
            operation_name, status, body_str
        );
        return Err(anyhow::anyhow!("HTTP 错误 {}: {}", status, detail));
    }
    debug!("[HTTP] {}请求成功，HTTP状态: {}", operation_name, status);

    serde_json::from_slice::<T>(&body_bytes).map_err(|e| {
        error!(
            "[HTTP] {}反序列化失败: {:?}\n原始响应: {}",
            operation_name, e, body_str
        );
        anyhow::anyhow!("反序列化响应失败: {:?}", e)
    })
}

/// 只检查状态码，不关心响应体
pub async fn ensure_success(response: reqwest::Response, operation_name: &str) -> anyhow::Result<()> {
    let status = response.status();
    if status.is_success() {
        debug!("[HTTP] {}请求成功，HTTP状态: {}", operation_name, status);
        return Ok(());
    }
    let text = response.text().await.unwrap_or_default();
    error!(
        "[HTTP] {}请求失败，HTTP状态: {}, 响应: {}",
        operation_name, status, text
    );
    Err(anyhow::anyhow!("HTTP 错误 {}: {}", status, text))
}

/// 创建带认证头的 HTTP 客户端（apikey + Bearer token 通过 default_headers 自动添加）
pub fn build_authed_client(api_key: &str, access_token: &str) -> anyhow::Result<reqwest::Client> {
    let mut headers = reqwest::header::HeaderMap::new();
    headers.insert(
        reqwest::header::HeaderName::from_static("apikey"),
        reqwest::header::HeaderValue::from_str(api_key).context("无效的 apikey")?,
    );
    headers.insert(
        reqwest::header::AUTHORIZATION,
        reqwest::header::HeaderValue::from_str(&format!("Bearer {}", access_token))
            .context("无效的 access token")?,
    );
    reqwest::ClientBuilder::new()
        .default_headers(headers)
        .build()
        .context("创建 HTTP 客户端失败")
}
