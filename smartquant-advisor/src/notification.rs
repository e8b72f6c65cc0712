//! Signal notifications.
//!
//! [`NotificationDispatcher::publish`] fans a message out to every configured
//! sink. Delivery is best effort: a failing sink is logged and skipped.
//!
//! Sinks:
//! - desktop popup via `notify-send`
//! - daily signal log `<log_dir>/ai_signals_YYYY-MM-DD.txt`
//! - WeChat push via WxPusher

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Local;
use serde::{Deserialize, Serialize};
use smartquant_common::{Config, Error};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

const WXPUSHER_URL: &str = "https://wxpusher.zjiecode.com/api/send/message";
const WXPUSHER_OK: i64 = 1000;

/// Destination for human-readable signal messages.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, title: &str, message: &str) -> Result<()>;
}

/// Best-effort fan-out over all sinks.
pub struct NotificationDispatcher {
    sinks: Vec<Box<dyn NotificationSink>>,
}

impl NotificationDispatcher {
    pub fn new(sinks: Vec<Box<dyn NotificationSink>>) -> Self {
        Self { sinks }
    }

    /// Build the sinks enabled in the notification section.
    pub fn from_config(config: &Config) -> Self {
        let mut sinks: Vec<Box<dyn NotificationSink>> = Vec::new();

        if config.notification.desktop {
            sinks.push(Box::new(DesktopSink::new()));
        }
        if config.notification.signal_log {
            sinks.push(Box::new(SignalLogSink::new(config.signal_log_dir())));
        }
        if config.notification.push {
            let wx = &config.secrets.wxpusher;
            sinks.push(Box::new(WxPusherSink::new(wx.app_token.clone(), wx.uids.clone())));
        }

        info!(
            sinks = ?sinks.iter().map(|s| s.name()).collect::<Vec<_>>(),
            "Notification dispatcher configured"
        );

        Self { sinks }
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    /// Deliver to every sink. Returns how many accepted the message.
    pub async fn publish(&self, title: &str, message: &str) -> usize {
        let mut delivered = 0;
        for sink in &self.sinks {
            match sink.send(title, message).await {
                Ok(()) => {
                    debug!(sink = sink.name(), title = %title, "Notification delivered");
                    delivered += 1;
                }
                Err(e) => {
                    warn!(sink = sink.name(), title = %title, error = %e, "Notification sink failed");
                }
            }
        }
        delivered
    }
}

// ============================================================================
// Desktop
// ============================================================================

/// Desktop popup through the freedesktop `notify-send` command.
pub struct DesktopSink {
    program: String,
}

impl DesktopSink {
    pub fn new() -> Self {
        Self {
            program: "notify-send".to_string(),
        }
    }
}

impl Default for DesktopSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationSink for DesktopSink {
    fn name(&self) -> &str {
        "desktop"
    }

    async fn send(&self, title: &str, message: &str) -> Result<()> {
        let status = tokio::process::Command::new(&self.program)
            .arg("--app-name=SmartQuant")
            .arg(title)
            .arg(message)
            .status()
            .await
            .with_context(|| format!("Failed to run {}", self.program))?;

        if !status.success() {
            anyhow::bail!("{} exited with {}", self.program, status);
        }
        Ok(())
    }
}

// ============================================================================
// Signal log
// ============================================================================

/// Append-only daily signal log.
pub struct SignalLogSink {
    dir: PathBuf,
}

impl SignalLogSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Log file for the current local date.
    pub fn current_path(&self) -> PathBuf {
        log_path(&self.dir, &Local::now().format("%Y-%m-%d").to_string())
    }
}

fn log_path(dir: &Path, date: &str) -> PathBuf {
    dir.join(format!("ai_signals_{}.txt", date))
}

#[async_trait]
impl NotificationSink for SignalLogSink {
    fn name(&self) -> &str {
        "signal_log"
    }

    async fn send(&self, title: &str, message: &str) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;

        let path = self.current_path();
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("Failed to open {}", path.display()))?;

        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
        let entry = format!("{}: [{}] {}\n", timestamp, title, message);
        file.write_all(entry.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

// ============================================================================
// WxPusher
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WxPusherRequest<'a> {
    app_token: &'a str,
    content: &'a str,
    summary: &'a str,
    content_type: u8,
    uids: &'a [String],
}

#[derive(Debug, Deserialize)]
struct WxPusherResponse {
    code: i64,
    #[serde(default)]
    msg: Option<String>,
}

/// WeChat push through WxPusher.
pub struct WxPusherSink {
    app_token: Option<String>,
    uids: Vec<String>,
    endpoint: String,
    retry_count: u32,
    client: reqwest::Client,
}

impl WxPusherSink {
    pub fn new(app_token: Option<String>, uids: Vec<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            app_token: app_token.filter(|t| !t.trim().is_empty()),
            uids: uids.into_iter().filter(|u| !u.trim().is_empty()).collect(),
            endpoint: WXPUSHER_URL.to_string(),
            retry_count: 3,
            client,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    async fn try_send(&self, request: &WxPusherRequest<'_>) -> Result<()> {
        let response = self.client.post(&self.endpoint).json(request).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("HTTP {}: {}", status, error_text);
        }

        let result: WxPusherResponse = response.json().await?;
        if result.code != WXPUSHER_OK {
            anyhow::bail!(
                "WxPusher error {}: {}",
                result.code,
                result.msg.unwrap_or_default()
            );
        }
        Ok(())
    }
}

#[async_trait]
impl NotificationSink for WxPusherSink {
    fn name(&self) -> &str {
        "wxpusher"
    }

    async fn send(&self, title: &str, message: &str) -> Result<()> {
        let app_token = match self.app_token.as_deref() {
            Some(token) if !self.uids.is_empty() => token,
            _ => {
                return Err(
                    Error::Config("wxpusher app_token and uids must be configured".into()).into(),
                )
            }
        };

        let request = WxPusherRequest {
            app_token,
            content: message,
            summary: title,
            content_type: 1,
            uids: &self.uids,
        };

        let mut last_error = None;

        for attempt in 1..=self.retry_count {
            match self.try_send(&request).await {
                Ok(()) => {
                    info!(title = %title, recipients = self.uids.len(), "Push notification sent");
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        attempt,
                        max_attempts = self.retry_count,
                        error = %e,
                        "Failed to send push notification, retrying..."
                    );
                    last_error = Some(e);

                    if attempt < self.retry_count {
                        tokio::time::sleep(Duration::from_millis(500 * u64::from(attempt))).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("Unknown error")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Json, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    struct RecordingSink {
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        fn name(&self) -> &str {
            "recording"
        }

        async fn send(&self, title: &str, _message: &str) -> Result<()> {
            self.seen.lock().unwrap().push(title.to_string());
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl NotificationSink for FailingSink {
        fn name(&self) -> &str {
            "failing"
        }

        async fn send(&self, _title: &str, _message: &str) -> Result<()> {
            anyhow::bail!("transport down")
        }
    }

    #[tokio::test]
    async fn test_publish_swallows_sink_failures() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = NotificationDispatcher::new(vec![
            Box::new(FailingSink),
            Box::new(RecordingSink { seen: seen.clone() }),
        ]);

        assert_eq!(dispatcher.publish("AI 信号: BUY 600519", "body").await, 1);
        assert_eq!(seen.lock().unwrap().as_slice(), ["AI 信号: BUY 600519"]);
    }

    #[tokio::test]
    async fn test_signal_log_appends() {
        let dir = tempfile::tempdir().unwrap();
        let sink = SignalLogSink::new(dir.path().join("logs"));
        sink.send("t1", "first").await.unwrap();
        sink.send("t2", "second").await.unwrap();

        let content = std::fs::read_to_string(sink.current_path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("[t1] first"));
        assert!(lines[1].ends_with("[t2] second"));
    }

    #[tokio::test]
    async fn test_wxpusher_requires_credentials() {
        let sink = WxPusherSink::new(Some("AT_x".into()), vec![" ".into()]);
        let err: Error = sink.send("t", "m").await.unwrap_err().into();
        assert!(err.is_config());
    }

    #[tokio::test]
    async fn test_wxpusher_retries_until_accepted() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let app = Router::new().route(
            "/send",
            post(move |Json(body): Json<serde_json::Value>| {
                let counter = counter.clone();
                async move {
                    assert_eq!(body["appToken"], "AT_x");
                    assert_eq!(body["contentType"], 1);
                    assert_eq!(body["summary"], "title");
                    assert_eq!(body["uids"][0], "UID_1");
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    let code = if n == 0 { 1001 } else { 1000 };
                    Json(serde_json::json!({"code": code, "msg": "ok"}))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let sink = WxPusherSink::new(Some("AT_x".into()), vec!["UID_1".into()])
            .with_endpoint(format!("http://{}/send", addr));
        sink.send("title", "content").await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_from_config_respects_flags() {
        let mut config = Config::default();
        config.notification.desktop = false;
        config.notification.push = false;
        let dispatcher = NotificationDispatcher::from_config(&config);
        assert_eq!(dispatcher.sink_count(), 1);
    }
}
