use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36";
const HIDE_WEBDRIVER_SCRIPT: &str =
    "Object.defineProperty(navigator, 'webdriver', { get: () => undefined });";

/// A live location-search session.
///
/// `resolve` navigates to a search target and reports the location the
/// session settled on. Faults are returned, never panicked.
#[async_trait]
pub trait Navigator: Send {
    async fn resolve(&mut self, target: &str) -> AppResult<String>;

    async fn close(&mut self) -> AppResult<()>;
}

/// Opens fresh navigation sessions; used at start-up and after cooldowns.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self) -> AppResult<Box<dyn Navigator>>;
}

#[derive(Clone)]
pub struct WebDriverSessionFactory {
    http: Client,
    base: Url,
    settle: Duration,
    headless: bool,
}

impl WebDriverSessionFactory {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let mut builder = Client::builder();
        if let Some(secs) = config.navigation_timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        let base = Url::parse(&config.webdriver_url).map_err(|err| {
            AppError::Config(format!(
                "invalid WebDriver URL '{}': {err}",
                config.webdriver_url
            ))
        })?;
        Ok(Self {
            http: builder.build()?,
            base,
            settle: Duration::from_millis(config.navigation_settle_ms),
            headless: config.headless,
        })
    }

    fn capabilities(&self) -> Value {
        let mut args = vec![
            "--window-size=1920,1080".to_string(),
            format!("--user-agent={USER_AGENT}"),
            "--disable-blink-features=AutomationControlled".to_string(),
        ];
        if self.headless {
            args.insert(0, "--headless=new".to_string());
        }
        json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "goog:chromeOptions": {
                        "args": args,
                        "excludeSwitches": ["enable-automation"],
                        "useAutomationExtension": false
                    }
                }
            }
        })
    }
}

#[async_trait]
impl SessionFactory for WebDriverSessionFactory {
    async fn open(&self) -> AppResult<Box<dyn Navigator>> {
        let response = self
            .http
            .post(endpoint(&self.base, &["session"])?)
            .json(&self.capabilities())
            .send()
            .await?;
        let created: WireValue<NewSession> = read_value(response).await?;
        let session_id = created.value.session_id;
        let session_url = endpoint(&self.base, &["session", session_id.as_str()])?;
        info!(target: "navigation", session = %session_id, "webdriver session opened");

        let session = WebDriverSession {
            http: self.http.clone(),
            session_url,
            session_id,
            settle: self.settle,
            closed: false,
        };
        session.hide_automation_flag().await;
        Ok(Box::new(session))
    }
}

pub struct WebDriverSession {
    http: Client,
    session_url: Url,
    session_id: String,
    settle: Duration,
    closed: bool,
}

impl WebDriverSession {
    fn command(&self, segments: &[&str]) -> AppResult<Url> {
        endpoint(&self.session_url, segments)
    }

    async fn hide_automation_flag(&self) {
        if let Err(err) = self.inject_script(HIDE_WEBDRIVER_SCRIPT).await {
            debug!(target: "navigation", error = %err, "cdp script injection unavailable");
        }
    }

    async fn inject_script(&self, source: &str) -> AppResult<()> {
        let response = self
            .http
            .post(self.command(&["goog", "cdp", "execute"])?)
            .json(&json!({
                "cmd": "Page.addScriptToEvaluateOnNewDocument",
                "params": { "source": source }
            }))
            .send()
            .await?;
        read_value::<Value>(response).await?;
        Ok(())
    }
}

#[async_trait]
impl Navigator for WebDriverSession {
    async fn resolve(&mut self, target: &str) -> AppResult<String> {
        if self.closed {
            return Err(AppError::Navigation("session already closed".into()));
        }
        let response = self
            .http
            .post(self.command(&["url"])?)
            .json(&json!({ "url": target }))
            .send()
            .await?;
        read_value::<Value>(response).await?;

        if !self.settle.is_zero() {
            sleep(self.settle).await;
        }

        let response = self.http.get(self.command(&["url"])?).send().await?;
        let current: WireValue<String> = read_value(response).await?;
        Ok(current.value)
    }

    async fn close(&mut self) -> AppResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let response = self.http.delete(self.session_url.clone()).send().await?;
        read_value::<Value>(response).await?;
        info!(target: "navigation", session = %self.session_id, "webdriver session closed");
        Ok(())
    }
}

impl Drop for WebDriverSession {
    fn drop(&mut self) {
        if !self.closed {
            warn!(
                target: "navigation",
                session = %self.session_id,
                "webdriver session dropped without close"
            );
        }
    }
}

#[derive(Deserialize)]
struct WireValue<T> {
    value: T,
}

#[derive(Deserialize)]
struct NewSession {
    #[serde(rename = "sessionId")]
    session_id: String,
}

#[derive(Deserialize)]
struct WireError {
    error: String,
    #[serde(default)]
    message: String,
}

fn endpoint(base: &Url, segments: &[&str]) -> AppResult<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| AppError::Config("WebDriver URL cannot carry path segments".into()))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

async fn read_value<T: serde::de::DeserializeOwned>(response: Response) -> AppResult<T> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json::<T>().await?);
    }
    let detail = match response.json::<WireValue<WireError>>().await {
        Ok(body) if body.value.message.is_empty() => body.value.error,
        Ok(body) => format!("{}: {}", body.value.error, first_line(&body.value.message)),
        Err(_) => "unreadable error body".to_string(),
    };
    Err(AppError::Navigation(format!("webdriver returned {status}: {detail}")))
}

fn first_line(message: &str) -> &str {
    message.lines().next().unwrap_or(message)
}
