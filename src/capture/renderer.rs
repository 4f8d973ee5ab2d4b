//! Browser-driven page rendering.
//!
//! [`PageRenderer`] launches a Chrome instance over the DevTools Protocol,
//! navigates to a URL, and hands back a [`RenderSession`] that owns the
//! browser for the rest of the capture. One session means one navigation,
//! one viewport, and one fingerprint surface; no session outlives a capture.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::{
    EventLoadingFailed, EventLoadingFinished, EventRequestWillBeSent,
};
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::page::Page;
use futures_util::StreamExt;
use rand::seq::SliceRandom;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::SettleMode;

use super::error::CaptureError;

/// Desktop user agents sampled when no custom agent is configured.
const USER_AGENTS: [&str; 4] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:124.0) Gecko/20100101 Firefox/124.0",
];

/// Viewport sized for comfortable reading; scale 1.5 keeps text crisp in the PDF.
const VIEWPORT_WIDTH: u32 = 1280;
const VIEWPORT_HEIGHT: u32 = 900;
const DEVICE_SCALE_FACTOR: f64 = 1.5;

/// Init script that hides the automation flag from fingerprinting checks.
const ANTI_FINGERPRINT_SCRIPT: &str = r"
    Object.defineProperty(navigator, 'webdriver', {
        get: () => false
    });
";

/// How long `goto` itself may take before we call the navigation dead.
const NAVIGATION_TIMEOUT: Duration = Duration::from_secs(45);

/// Options controlling a single render.
#[derive(Debug, Clone)]
pub struct RenderOptions {
    /// Settle wait budget after the load event.
    pub wait_budget: Duration,
    /// How the settle wait is performed.
    pub settle: SettleMode,
    /// Custom user agent; `None` picks one at random from the desktop pool.
    pub user_agent: Option<String>,
    /// Persistent profile directory. Forces headful mode when set.
    pub profile_dir: Option<PathBuf>,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            wait_budget: Duration::from_millis(crate::config::DEFAULT_WAIT_BUDGET_MS),
            settle: SettleMode::FixedDelay,
            user_agent: None,
            profile_dir: None,
        }
    }
}

/// A live browser session holding exactly one rendered page.
///
/// Owns the browser process, the CDP event handler task, and the page. The
/// browser child process is killed when the session is dropped, so teardown
/// also happens when the pipeline future is cancelled at an await point.
pub struct RenderSession {
    browser: Browser,
    handler_task: JoinHandle<()>,
    page: Page,
    user_agent: String,
    started: Instant,
}

impl std::fmt::Debug for RenderSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderSession")
            .field("user_agent", &self.user_agent)
            .field("elapsed", &self.started.elapsed())
            .finish_non_exhaustive()
    }
}

impl RenderSession {
    /// The rendered page.
    #[must_use]
    pub fn page(&self) -> &Page {
        &self.page
    }

    /// The user agent this session presents.
    #[must_use]
    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    /// Viewport height in CSS pixels.
    #[must_use]
    pub fn viewport_height(&self) -> u32 {
        VIEWPORT_HEIGHT
    }

    /// Time elapsed since the session was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Tears the session down: closes the browser and drains the handler.
    ///
    /// Close failures are logged, not returned; by this point the capture
    /// outcome is already decided.
    pub async fn close(mut self) {
        if let Err(error) = self.browser.close().await {
            warn!(error = %error, "Browser close failed, process will be killed on drop");
        }
        self.handler_task.abort();
        let _ = self.handler_task.await;
        debug!("Render session torn down");
    }
}

/// Launches a browser and renders one URL into a [`RenderSession`].
#[derive(Debug, Default)]
pub struct PageRenderer;

impl PageRenderer {
    /// Creates a renderer.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Renders `url` and returns the live session.
    ///
    /// # Errors
    ///
    /// - [`CaptureError::Browser`] if the browser cannot be launched.
    /// - [`CaptureError::Navigation`] on DNS/connection failure.
    /// - [`CaptureError::Timeout`] if the page does not reach a stable load
    ///   state within `options.wait_budget`.
    #[instrument(skip(self, options))]
    pub async fn render(
        &self,
        url: &str,
        options: &RenderOptions,
    ) -> Result<RenderSession, CaptureError> {
        let user_agent = options.user_agent.clone().unwrap_or_else(|| {
            let mut rng = rand::thread_rng();
            USER_AGENTS
                .choose(&mut rng)
                .copied()
                .unwrap_or(USER_AGENTS[0])
                .to_string()
        });

        let config = build_browser_config(options)?;
        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| CaptureError::browser(e.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        let started = Instant::now();
        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| CaptureError::browser(e.to_string()))?;

        page.set_user_agent(user_agent.as_str())
            .await
            .map_err(|e| CaptureError::browser(e.to_string()))?;

        let anti_fingerprint = AddScriptToEvaluateOnNewDocumentParams::builder()
            .source(ANTI_FINGERPRINT_SCRIPT)
            .build()
            .map_err(CaptureError::browser)?;
        page.execute(anti_fingerprint)
            .await
            .map_err(|e| CaptureError::browser(e.to_string()))?;

        // Small randomized pause before navigation; immediate navigation after
        // launch is a common automation tell.
        let pre_nav_delay = {
            let mut rng = rand::thread_rng();
            rand::Rng::gen_range(&mut rng, 100..=500)
        };
        tokio::time::sleep(Duration::from_millis(pre_nav_delay)).await;

        info!(url, user_agent = %user_agent, "Navigating");
        let navigation = async {
            page.goto(url).await?;
            page.wait_for_navigation().await?;
            Ok::<(), chromiumoxide::error::CdpError>(())
        };
        match tokio::time::timeout(NAVIGATION_TIMEOUT, navigation).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                let session = RenderSession {
                    browser,
                    handler_task,
                    page,
                    user_agent,
                    started,
                };
                session.close().await;
                return Err(CaptureError::navigation(url, error.to_string()));
            }
            Err(_) => {
                let session = RenderSession {
                    browser,
                    handler_task,
                    page,
                    user_agent,
                    started,
                };
                session.close().await;
                return Err(CaptureError::timeout(url, NAVIGATION_TIMEOUT));
            }
        }

        let session = RenderSession {
            browser,
            handler_task,
            page,
            user_agent,
            started,
        };

        if let Err(error) = settle(&session, options).await {
            session.close().await;
            return Err(error);
        }

        debug!(elapsed = ?session.elapsed(), "Page settled");
        Ok(session)
    }
}

fn build_browser_config(options: &RenderOptions) -> Result<BrowserConfig, CaptureError> {
    let viewport = Viewport {
        width: VIEWPORT_WIDTH,
        height: VIEWPORT_HEIGHT,
        device_scale_factor: Some(DEVICE_SCALE_FACTOR),
        emulating_mobile: false,
        is_landscape: false,
        has_touch: false,
    };

    let mut builder = BrowserConfig::builder()
        .viewport(viewport)
        .arg("--disable-blink-features=AutomationControlled")
        .arg("--no-sandbox")
        .arg("--disable-dev-shm-usage");

    if let Some(ref profile_dir) = options.profile_dir {
        // Persistent profiles imply a visible browser. The profile directory
        // has no internal locking; a second writer (another zotsave run or a
        // manually launched browser) corrupts it. Single-writer usage is a
        // documented precondition, not something we can enforce here.
        warn!(
            profile_dir = %profile_dir.display(),
            "Using persistent profile in headful mode; concurrent use of this profile is unsafe"
        );
        builder = builder.with_head().user_data_dir(profile_dir);
    }

    builder.build().map_err(CaptureError::browser)
}

/// A quiet window this long with no in-flight requests counts as idle.
const NETWORK_QUIET_WINDOW: Duration = Duration::from_millis(500);
/// How often the idle check re-evaluates when no network events arrive.
const NETWORK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Tracks in-flight network requests for the idle heuristic.
///
/// Pure bookkeeping over caller-supplied timestamps, so the quiet-window
/// rule is testable without a browser.
#[derive(Debug)]
struct NetworkQuiescence {
    inflight: u64,
    last_activity: Instant,
}

impl NetworkQuiescence {
    fn new(now: Instant) -> Self {
        Self {
            inflight: 0,
            last_activity: now,
        }
    }

    fn request_started(&mut self, now: Instant) {
        self.inflight += 1;
        self.last_activity = now;
    }

    /// Settled means finished or failed; counts can undershoot when a
    /// request predates the listener, hence the saturating decrement.
    fn request_settled(&mut self, now: Instant) {
        self.inflight = self.inflight.saturating_sub(1);
        self.last_activity = now;
    }

    fn is_quiet(&self, now: Instant, window: Duration) -> bool {
        self.inflight == 0 && now.duration_since(self.last_activity) >= window
    }
}

/// Settle wait after the load event: either a fixed delay, or a wait for the
/// network to go quiet within the budget.
async fn settle(session: &RenderSession, options: &RenderOptions) -> Result<(), CaptureError> {
    match options.settle {
        SettleMode::FixedDelay => {
            tokio::time::sleep(options.wait_budget).await;
            Ok(())
        }
        SettleMode::NetworkIdle => settle_network_idle(session, options.wait_budget).await,
    }
}

/// Waits for a quiet window with no in-flight requests, like the engines'
/// "network idle" load state. Lazy XHR content keeps the window open; a page
/// that never goes quiet exhausts the budget and times out.
async fn settle_network_idle(
    session: &RenderSession,
    budget: Duration,
) -> Result<(), CaptureError> {
    let page = session.page();
    let mut started = page
        .event_listener::<EventRequestWillBeSent>()
        .await
        .map_err(|e| CaptureError::browser(e.to_string()))?;
    let mut finished = page
        .event_listener::<EventLoadingFinished>()
        .await
        .map_err(|e| CaptureError::browser(e.to_string()))?;
    let mut failed = page
        .event_listener::<EventLoadingFailed>()
        .await
        .map_err(|e| CaptureError::browser(e.to_string()))?;

    let deadline = Instant::now() + budget;
    let mut quiescence = NetworkQuiescence::new(Instant::now());

    loop {
        let now = Instant::now();
        if quiescence.is_quiet(now, NETWORK_QUIET_WINDOW) {
            return Ok(());
        }
        if now >= deadline {
            return Err(CaptureError::timeout(
                session.page().url().await.ok().flatten().unwrap_or_default(),
                budget,
            ));
        }

        tokio::select! {
            event = started.next() => {
                if event.is_some() {
                    quiescence.request_started(Instant::now());
                }
            }
            event = finished.next() => {
                if event.is_some() {
                    quiescence.request_settled(Instant::now());
                }
            }
            event = failed.next() => {
                if event.is_some() {
                    quiescence.request_settled(Instant::now());
                }
            }
            () = tokio::time::sleep(NETWORK_POLL_INTERVAL) => {}
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_render_options_default_wait_budget() {
        let options = RenderOptions::default();
        assert_eq!(options.wait_budget, Duration::from_millis(5000));
        assert!(options.user_agent.is_none());
        assert!(options.profile_dir.is_none());
    }

    #[test]
    fn test_user_agent_pool_is_desktop_only() {
        for agent in USER_AGENTS {
            assert!(
                !agent.contains("Mobile"),
                "Unexpected mobile agent in pool: {agent}"
            );
        }
    }

    #[test]
    fn test_browser_config_headless_without_profile() {
        let options = RenderOptions::default();
        assert!(build_browser_config(&options).is_ok());
    }

    #[test]
    fn test_network_quiescence_quiet_after_window() {
        let start = Instant::now();
        let quiescence = NetworkQuiescence::new(start);
        assert!(!quiescence.is_quiet(start, NETWORK_QUIET_WINDOW));
        assert!(quiescence.is_quiet(start + NETWORK_QUIET_WINDOW, NETWORK_QUIET_WINDOW));
    }

    #[test]
    fn test_network_quiescence_inflight_request_blocks_idle() {
        let start = Instant::now();
        let mut quiescence = NetworkQuiescence::new(start);
        quiescence.request_started(start);
        // An open request keeps the page busy no matter how long it hangs.
        assert!(!quiescence.is_quiet(start + Duration::from_secs(60), NETWORK_QUIET_WINDOW));

        quiescence.request_settled(start + Duration::from_secs(60));
        let settled_at = start + Duration::from_secs(60);
        assert!(!quiescence.is_quiet(settled_at, NETWORK_QUIET_WINDOW));
        assert!(quiescence.is_quiet(settled_at + NETWORK_QUIET_WINDOW, NETWORK_QUIET_WINDOW));
    }

    #[test]
    fn test_network_quiescence_activity_reopens_window() {
        let start = Instant::now();
        let mut quiescence = NetworkQuiescence::new(start);
        let almost_quiet = start + NETWORK_QUIET_WINDOW - Duration::from_millis(1);
        quiescence.request_started(almost_quiet);
        quiescence.request_settled(almost_quiet);
        // The late request resets the window even though it settled at once.
        assert!(!quiescence.is_quiet(start + NETWORK_QUIET_WINDOW, NETWORK_QUIET_WINDOW));
        assert!(quiescence.is_quiet(almost_quiet + NETWORK_QUIET_WINDOW, NETWORK_QUIET_WINDOW));
    }

    #[test]
    fn test_network_quiescence_unmatched_settle_does_not_underflow() {
        let start = Instant::now();
        let mut quiescence = NetworkQuiescence::new(start);
        // A request that predates the listener settles without a start event.
        quiescence.request_settled(start);
        quiescence.request_started(start);
        quiescence.request_settled(start);
        assert!(quiescence.is_quiet(start + NETWORK_QUIET_WINDOW, NETWORK_QUIET_WINDOW));
    }
}
