//! Session cookies handed to the extraction tool.
//!
//! Harvesting is best effort: every failure is logged and turns into "no
//! cookies", never into a task failure.

use std::{
    io::{self, Write},
    net::TcpListener,
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result, anyhow, bail};
use rand_core::{OsRng, RngCore};
use serde::Deserialize;
use serde_json::{Value, json};
use tempfile::{NamedTempFile, TempDir, TempPath};
use tracing::{debug, info, warn};

use crate::config::Settings;

const SITE_ROOT: &str = "https://www.youtube.com/";
const PLAYER_SELECTOR: &str = "#movie_player";
const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(20);
const DRIVER_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(250);
const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) Chrome/114.0.0.0 Safari/537.36";
const NETSCAPE_HEADER: &str = "# Netscape HTTP Cookie File";

/// Cookie jar on disk in Netscape format; removed when dropped.
#[derive(Debug)]
pub struct CookieFile {
    path: TempPath,
}

impl CookieFile {
    pub fn write(content: &str) -> io::Result<Self> {
        let mut file = NamedTempFile::new()?;
        file.write_all(content.as_bytes())?;
        file.flush()?;
        Ok(Self {
            path: file.into_temp_path(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub trait CookieProvider: Send + Sync {
    /// Blocking; may take several seconds.
    fn acquire(&self, url: &str) -> Option<CookieFile>;
}

pub struct NoCookies;

impl CookieProvider for NoCookies {
    fn acquire(&self, _url: &str) -> Option<CookieFile> {
        None
    }
}

/// Operator-supplied cookie file content.
pub struct StaticCookies {
    content: String,
}

impl StaticCookies {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
        }
    }
}

impl CookieProvider for StaticCookies {
    fn acquire(&self, _url: &str) -> Option<CookieFile> {
        match CookieFile::write(&self.content) {
            Ok(file) => Some(file),
            Err(err) => {
                warn!(error = %err, "could not write configured cookies");
                None
            }
        }
    }
}

/// Drives a headless browser through a WebDriver server to pick up the
/// cookies a real visit would get.
pub struct BrowserCookies {
    chromedriver: PathBuf,
    chrome_binary: Option<PathBuf>,
    proxy: Option<String>,
    wait_timeout: Duration,
}

impl BrowserCookies {
    pub fn new(chromedriver: impl Into<PathBuf>) -> Self {
        Self {
            chromedriver: chromedriver.into(),
            chrome_binary: None,
            proxy: None,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }

    pub fn with_chrome_binary(mut self, binary: Option<PathBuf>) -> Self {
        self.chrome_binary = binary;
        self
    }

    pub fn with_proxy(mut self, proxy: Option<String>) -> Self {
        self.proxy = proxy;
        self
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    fn harvest(&self, url: &str) -> Result<Vec<BrowserCookie>> {
        let profile = TempDir::new().context("creating browser profile directory")?;
        let session = BrowserSession::start(self, profile)?;

        session.navigate(SITE_ROOT)?;
        pause(1000, 2000);
        let offset = 100 + OsRng.next_u64() % 101;
        session.execute(&format!("window.scrollTo(0, {offset});"))?;
        pause(500, 1000);

        session.navigate(url)?;
        if session.wait_for_element(PLAYER_SELECTOR, self.wait_timeout) {
            debug!("video player loaded");
        } else {
            warn!(
                timeout_secs = self.wait_timeout.as_secs(),
                "video player did not appear; continuing anyway"
            );
        }
        pause(1000, 2000);

        session.cookies()
    }

    fn chrome_args(&self, profile: &Path) -> Vec<String> {
        let mut args: Vec<String> = [
            "--headless",
            "--no-sandbox",
            "--disable-dev-shm-usage",
            "--disable-gpu",
            "--disable-extensions",
            "--disable-infobars",
            "--mute-audio",
            "--disable-notifications",
            "--disable-default-apps",
            "--disable-component-update",
            "--disable-blink-features=AutomationControlled",
            "--window-size=800,600",
        ]
        .iter()
        .map(|arg| arg.to_string())
        .collect();
        args.push(format!("--user-agent={USER_AGENT}"));
        args.push(format!("--user-data-dir={}", profile.display()));
        if let Some(proxy) = &self.proxy {
            args.push(format!("--proxy-server={proxy}"));
        }
        args
    }
}

impl CookieProvider for BrowserCookies {
    fn acquire(&self, url: &str) -> Option<CookieFile> {
        let started = Instant::now();
        let cookies = match self.harvest(url) {
            Ok(cookies) => cookies,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "browser cookie harvesting failed");
                return None;
            }
        };

        match CookieFile::write(&format_netscape_cookies(&cookies)) {
            Ok(file) => {
                info!(
                    count = cookies.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "harvested browser cookies"
                );
                Some(file)
            }
            Err(err) => {
                warn!(error = %err, "could not write harvested cookies");
                None
            }
        }
    }
}

/// Picks the provider the settings ask for.
pub fn provider_from_settings(settings: &Settings) -> Arc<dyn CookieProvider> {
    if let Some(content) = &settings.cookies_content {
        return Arc::new(StaticCookies::new(content.clone()));
    }
    if settings.disable_browser {
        info!("browser cookie harvesting disabled");
        return Arc::new(NoCookies);
    }
    Arc::new(
        BrowserCookies::new(&settings.chromedriver)
            .with_chrome_binary(settings.chrome_binary.clone())
            .with_proxy(settings.proxy_url.clone()),
    )
}

/// A cookie as reported by the WebDriver `GET /cookie` endpoint.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserCookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default = "default_cookie_path")]
    pub path: String,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub http_only: bool,
    pub expiry: Option<i64>,
}

fn default_cookie_path() -> String {
    "/".to_string()
}

/// Renders cookies in the tab-separated format the extraction tool loads.
pub fn format_netscape_cookies(cookies: &[BrowserCookie]) -> String {
    let mut out = String::from(NETSCAPE_HEADER);
    out.push('\n');
    for cookie in cookies {
        let domain = cookie.domain.strip_prefix('.').unwrap_or(&cookie.domain);
        let secure = if cookie.secure { "TRUE" } else { "FALSE" };
        out.push_str(&format!(
            "{domain}\tTRUE\t{}\t{secure}\t{}\t{}\t{}\n",
            cookie.path,
            cookie.expiry.unwrap_or(0),
            cookie.name,
            cookie.value
        ));
    }
    out
}

fn pause(min_ms: u64, max_ms: u64) {
    let span = max_ms.saturating_sub(min_ms) + 1;
    thread::sleep(Duration::from_millis(min_ms + OsRng.next_u64() % span));
}

fn free_local_port() -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").context("reserving a local port")?;
    Ok(listener.local_addr()?.port())
}

/// A running WebDriver server plus one browser session. Dropping it ends the
/// session, stops the server and removes the profile directory.
struct BrowserSession {
    agent: ureq::Agent,
    base: String,
    session_id: Option<String>,
    driver: Child,
    profile: TempDir,
}

impl BrowserSession {
    fn start(config: &BrowserCookies, profile: TempDir) -> Result<Self> {
        let port = free_local_port()?;
        let driver = Command::new(&config.chromedriver)
            .arg(format!("--port={port}"))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("launching {}", config.chromedriver.display()))?;

        let mut session = Self {
            agent: ureq::AgentBuilder::new()
                .timeout(Duration::from_secs(30))
                .build(),
            base: format!("http://127.0.0.1:{port}"),
            session_id: None,
            driver,
            profile,
        };
        session.wait_until_ready()?;

        let mut options = json!({
            "args": config.chrome_args(session.profile.path()),
            "excludeSwitches": ["enable-automation"],
            "useAutomationExtension": false,
        });
        if let Some(binary) = &config.chrome_binary {
            options["binary"] = json!(binary.display().to_string());
        }
        let response: Value = session
            .agent
            .post(&format!("{}/session", session.base))
            .send_json(json!({
                "capabilities": {
                    "alwaysMatch": {
                        "browserName": "chrome",
                        "goog:chromeOptions": options,
                    }
                }
            }))
            .context("creating browser session")?
            .into_json()
            .context("reading session response")?;
        let session_id = response["value"]["sessionId"]
            .as_str()
            .ok_or_else(|| anyhow!("session response carried no id"))?;
        session.session_id = Some(session_id.to_string());
        debug!(session_id, "browser session started");
        Ok(session)
    }

    fn wait_until_ready(&mut self) -> Result<()> {
        let deadline = Instant::now() + DRIVER_STARTUP_TIMEOUT;
        loop {
            if let Some(status) = self.driver.try_wait()? {
                bail!("webdriver exited early with {status}");
            }
            let ready = self
                .agent
                .get(&format!("{}/status", self.base))
                .call()
                .ok()
                .and_then(|response| response.into_json::<Value>().ok())
                .is_some_and(|body| body["value"]["ready"].as_bool().unwrap_or(false));
            if ready {
                return Ok(());
            }
            if Instant::now() >= deadline {
                bail!("webdriver did not become ready");
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn session_url(&self, suffix: &str) -> Result<String> {
        let id = self
            .session_id
            .as_deref()
            .ok_or_else(|| anyhow!("no browser session"))?;
        Ok(format!("{}/session/{id}/{suffix}", self.base))
    }

    fn navigate(&self, url: &str) -> Result<()> {
        self.agent
            .post(&self.session_url("url")?)
            .send_json(json!({ "url": url }))
            .with_context(|| format!("navigating to {url}"))?;
        Ok(())
    }

    fn execute(&self, script: &str) -> Result<()> {
        self.agent
            .post(&self.session_url("execute/sync")?)
            .send_json(json!({ "script": script, "args": [] }))
            .context("running page script")?;
        Ok(())
    }

    fn wait_for_element(&self, selector: &str, timeout: Duration) -> bool {
        let Ok(url) = self.session_url("element") else {
            return false;
        };
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            let found = self
                .agent
                .post(&url)
                .send_json(json!({ "using": "css selector", "value": selector }))
                .is_ok();
            if found {
                return true;
            }
            thread::sleep(POLL_INTERVAL);
        }
        false
    }

    fn cookies(&self) -> Result<Vec<BrowserCookie>> {
        #[derive(Deserialize)]
        struct CookieList {
            value: Vec<BrowserCookie>,
        }

        let list: CookieList = self
            .agent
            .get(&self.session_url("cookie")?)
            .call()
            .context("reading cookies")?
            .into_json()
            .context("parsing cookies")?;
        Ok(list.value)
    }
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        if let Ok(url) = self.session_url("") {
            let url = url.trim_end_matches('/').to_string();
            if let Err(err) = self.agent.delete(&url).call() {
                debug!(error = %err, "closing browser session failed");
            }
        }
        if let Err(err) = self.driver.kill() {
            debug!(error = %err, "webdriver already stopped");
        }
        let _ = self.driver.wait();
        debug!("browser session torn down");
    }
}
