//! WebDriver-backed remote session.
//!
//! Speaks the W3C WebDriver HTTP protocol to an already running driver
//! (chromedriver or compatible). Page URL and selectors come from
//! configuration so the page layout is not baked into the coordinator.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::SessionConfig;
use crate::session::{RemoteSession, SessionError, SessionFactory, SessionOptions};

/// W3C web element identifier key
const ELEMENT_KEY: &str = "element-6066-11e4-a52f-4a8e4f8f2f8c";

const READY_SCRIPT: &str = "return document.readyState === 'complete' \
     && document.querySelector(arguments[0]) !== null;";

const RESULT_SCRIPT: &str = "const selectors = arguments[0];\n\
     for (const sel of selectors) {\n\
       for (const el of document.querySelectorAll(sel)) {\n\
         const src = el.getAttribute('src') || el.src;\n\
         if (src && src.startsWith('http')) { return src; }\n\
       }\n\
     }\n\
     return null;";

/// Page-specific settings shared by every session of a factory
#[derive(Debug, Clone, PartialEq)]
pub struct WebDriverSettings {
    pub webdriver_url: String,
    pub page_url: String,
    pub upload_selector: String,
    pub result_selectors: Vec<String>,
}

impl From<&SessionConfig> for WebDriverSettings {
    fn from(cfg: &SessionConfig) -> Self {
        Self {
            webdriver_url: cfg.webdriver_url.trim_end_matches('/').to_string(),
            page_url: cfg.page_url.clone(),
            upload_selector: cfg.upload_selector.clone(),
            result_selectors: cfg.result_selectors.clone(),
        }
    }
}

/// Build the browser arguments for the given options.
///
/// Only flags forced to `Some(true)` produce an argument.
pub fn browser_args(options: &SessionOptions) -> Vec<String> {
    let mut args = Vec::new();
    if options.headless == Some(true) {
        args.push("--headless=new".to_string());
    }
    if options.private_mode == Some(true) {
        args.push("--incognito".to_string());
    }
    args
}

/// Build the new-session capabilities payload
pub fn build_capabilities(options: &SessionOptions) -> Value {
    json!({
        "capabilities": {
            "alwaysMatch": {
                "browserName": "chrome",
                "goog:chromeOptions": { "args": browser_args(options) }
            }
        }
    })
}

/// Splits a WebDriver response body into its value or its error.
///
/// Returns `Err((error_code, message))` when the body carries a W3C error.
fn unwrap_value(body: Value) -> Result<Value, (String, String)> {
    let value = body.get("value").cloned().unwrap_or(Value::Null);
    if let Some(code) = value.get("error").and_then(|e| e.as_str()) {
        let message = value
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or_default()
            .to_string();
        return Err((code.to_string(), message));
    }
    Ok(value)
}

async fn send_command(
    client: &Client,
    method: Method,
    url: &str,
    body: Option<Value>,
) -> Result<Result<Value, (String, String)>, SessionError> {
    let mut request = client.request(method, url);
    if let Some(body) = body {
        request = request.json(&body);
    }
    let response = request
        .send()
        .await
        .map_err(|e| SessionError::Transport(e.to_string()))?;
    let body: Value = response
        .json()
        .await
        .map_err(|e| SessionError::Protocol(format!("invalid JSON from driver: {}", e)))?;
    Ok(unwrap_value(body))
}

/// Opens WebDriver sessions navigated to the tool page
pub struct WebDriverFactory {
    client: Client,
    settings: Arc<WebDriverSettings>,
}

impl WebDriverFactory {
    pub fn new(settings: WebDriverSettings) -> Self {
        Self {
            client: Client::new(),
            settings: Arc::new(settings),
        }
    }
}

#[async_trait]
impl SessionFactory for WebDriverFactory {
    async fn open(&self, options: &SessionOptions) -> Result<Box<dyn RemoteSession>, SessionError> {
        let url = format!("{}/session", self.settings.webdriver_url);
        let capabilities = build_capabilities(options);
        let value = send_command(&self.client, Method::POST, &url, Some(capabilities))
            .await?
            .map_err(|(code, message)| SessionError::Open(format!("{}: {}", code, message)))?;

        let session_id = value
            .get("sessionId")
            .and_then(|id| id.as_str())
            .ok_or_else(|| {
                SessionError::Protocol("new session response lacks sessionId".to_string())
            })?
            .to_string();
        debug!(session_id = %session_id, "WebDriver session opened");

        let mut session = WebDriverSession {
            client: self.client.clone(),
            base: format!("{}/session/{}", self.settings.webdriver_url, session_id),
            settings: self.settings.clone(),
            closed: false,
        };

        if let Err(e) = session.navigate().await {
            session.close().await;
            return Err(e);
        }

        Ok(Box::new(session))
    }
}

/// One browser session on the tool page
pub struct WebDriverSession {
    client: Client,
    base: String,
    settings: Arc<WebDriverSettings>,
    closed: bool,
}

impl WebDriverSession {
    async fn navigate(&mut self) -> Result<(), SessionError> {
        let url = format!("{}/url", self.base);
        send_command(
            &self.client,
            Method::POST,
            &url,
            Some(json!({ "url": self.settings.page_url })),
        )
        .await?
        .map_err(|(code, message)| SessionError::Navigation(format!("{}: {}", code, message)))?;
        Ok(())
    }

    async fn execute(
        &self,
        script: &str,
        args: Value,
    ) -> Result<Result<Value, (String, String)>, SessionError> {
        let url = format!("{}/execute/sync", self.base);
        send_command(
            &self.client,
            Method::POST,
            &url,
            Some(json!({ "script": script, "args": args })),
        )
        .await
    }
}

#[async_trait]
impl RemoteSession for WebDriverSession {
    async fn is_ready(&mut self) -> Result<bool, SessionError> {
        let value = self
            .execute(READY_SCRIPT, json!([self.settings.upload_selector]))
            .await?
            .map_err(|(code, message)| SessionError::Protocol(format!("{}: {}", code, message)))?;
        Ok(value.as_bool().unwrap_or(false))
    }

    async fn submit(&mut self, file: &Path) -> Result<(), SessionError> {
        let absolute = file
            .canonicalize()
            .map_err(|e| SessionError::Submit(format!("{}: {}", file.display(), e)))?;

        let url = format!("{}/element", self.base);
        let element = send_command(
            &self.client,
            Method::POST,
            &url,
            Some(json!({ "using": "css selector", "value": self.settings.upload_selector })),
        )
        .await?
        .map_err(|(code, message)| {
            if code == "no such element" {
                SessionError::ElementNotFound(self.settings.upload_selector.clone())
            } else {
                SessionError::Protocol(format!("{}: {}", code, message))
            }
        })?;

        let element_id = element
            .get(ELEMENT_KEY)
            .and_then(|id| id.as_str())
            .ok_or_else(|| {
                SessionError::Protocol("element response lacks a reference".to_string())
            })?;

        let url = format!("{}/element/{}/value", self.base, element_id);
        send_command(
            &self.client,
            Method::POST,
            &url,
            Some(json!({ "text": absolute.to_string_lossy() })),
        )
        .await?
        .map_err(|(code, message)| SessionError::Submit(format!("{}: {}", code, message)))?;

        Ok(())
    }

    async fn poll_result(&mut self) -> Result<Option<String>, SessionError> {
        match self
            .execute(RESULT_SCRIPT, json!([self.settings.result_selectors]))
            .await?
        {
            Ok(Value::String(src)) if src.starts_with("http") => Ok(Some(src)),
            Ok(_) => Ok(None),
            Err((code, _)) if code == "no such element" => Ok(None),
            Err((code, message)) => Err(SessionError::Protocol(format!("{}: {}", code, message))),
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        match send_command(&self.client, Method::DELETE, &self.base, None).await {
            Ok(Ok(_)) => debug!(session = %self.base, "WebDriver session closed"),
            Ok(Err((code, message))) => {
                warn!(session = %self.base, "Failed to close session: {}: {}", code, message)
            }
            Err(e) => warn!(session = %self.base, "Failed to close session: {}", e),
        }
    }
}
