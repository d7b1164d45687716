//! Fetch Scheduler (FS), §4.5.
//!
//! Bounded-concurrency lanes with a per-host pacer and a deterministic
//! fallback ladder, generalized from one endpoint's pacing/backoff
//! machinery to an arbitrary crawl target with four independent lanes
//! instead of one.

use crate::frontier::{FetchOutcome, UrlFrontier};
use crate::types::FetchMode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, Semaphore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    Search,
    Fetch,
    Parse,
    Llm,
}

#[derive(Debug, Clone)]
pub struct LaneConfig {
    pub concurrency: usize,
    pub token_budget: u64,
}

impl Default for LaneConfig {
    fn default() -> Self {
        LaneConfig { concurrency: 4, token_budget: u64::MAX }
    }
}

/// Per-host request pacing: minimum inter-request delay and an in-flight
/// cap, mirroring `scrapers::binance_session::BackoffCalculator`'s spacing
/// discipline.
pub struct HostPacer {
    min_interval: Duration,
    in_flight_cap: usize,
    in_flight: AsyncMutex<usize>,
    last_request: AsyncMutex<Option<tokio::time::Instant>>,
}

impl HostPacer {
    pub fn new(min_interval: Duration, in_flight_cap: usize) -> Self {
        HostPacer {
            min_interval,
            in_flight_cap,
            in_flight: AsyncMutex::new(0),
            last_request: AsyncMutex::new(None),
        }
    }

    /// Wait until this host's pacing window and in-flight cap both permit a
    /// request, then mark one request as started. Caller must call
    /// [`HostPacer::release`] when the request finishes.
    pub async fn acquire(&self) {
        loop {
            {
                let mut in_flight = self.in_flight.lock().await;
                if *in_flight < self.in_flight_cap {
                    *in_flight += 1;
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        let mut last = self.last_request.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(tokio::time::Instant::now());
    }

    pub async fn release(&self) {
        let mut in_flight = self.in_flight.lock().await;
        *in_flight = in_flight.saturating_sub(1);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchAttempt {
    pub attempt_index: u32,
    pub fetcher_kind: FetchMode,
    pub reason: String,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchResult {
    pub final_url: String,
    pub status_code: Option<u16>,
    pub body: Option<String>,
    pub fetch_mode: FetchMode,
    pub attempts: Vec<FetchAttempt>,
    /// Set when UF applied a dead-URL cooldown this call, so the caller can
    /// emit a repair intent for the owning domain (§4.5/§4.6 boundary).
    pub dead_url_cooldown_applied: bool,
}

/// How long a 404/410 keeps a URL out of the fetch rotation before a repair
/// query gets a chance to resurface a replacement.
const DEAD_URL_COOLDOWN_DAYS: i64 = 30;

/// Classifies why the fallback ladder should escalate past the current
/// fetcher (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationTrigger {
    HttpStatus(u16),
    Timeout,
    NetworkError,
    JsOnlyPage,
    EmptyBody,
    AccessDeniedTitle,
    DomainPolicy,
}

pub fn should_escalate(trigger: EscalationTrigger) -> bool {
    match trigger {
        EscalationTrigger::HttpStatus(code) => code == 403 || code == 429 || (500..600).contains(&code),
        EscalationTrigger::Timeout | EscalationTrigger::NetworkError => true,
        EscalationTrigger::JsOnlyPage | EscalationTrigger::EmptyBody | EscalationTrigger::AccessDeniedTitle => true,
        EscalationTrigger::DomainPolicy => true,
    }
}

/// The fallback ladder itself: `HTTP-first -> headless -> alt crawler ->
/// give up`. Returns the next mode to try, or `None` when exhausted.
pub fn next_fetch_mode(current: FetchMode) -> Option<FetchMode> {
    match current {
        FetchMode::Http => Some(FetchMode::Headless),
        FetchMode::Headless => Some(FetchMode::AltCrawler),
        FetchMode::AltCrawler => None,
    }
}

/// One page-fetcher per mode. A real crawl wires `Http` to `reqwest` and
/// leaves `Headless`/`AltCrawler` to external collaborators (browser
/// automation, a second crawling service) this crate doesn't own.
#[async_trait::async_trait]
pub trait PageFetcher: Send + Sync {
    fn mode(&self) -> FetchMode;
    async fn fetch(&self, url: &str) -> Result<(u16, String, String), crate::error::CoreError>;
}

pub struct ReqwestFetcher {
    client: reqwest::Client,
}

impl ReqwestFetcher {
    pub fn new(timeout: Duration) -> reqwest::Result<Self> {
        Ok(ReqwestFetcher { client: reqwest::Client::builder().timeout(timeout).build()? })
    }
}

#[async_trait::async_trait]
impl PageFetcher for ReqwestFetcher {
    fn mode(&self) -> FetchMode {
        FetchMode::Http
    }

    async fn fetch(&self, url: &str) -> Result<(u16, String, String), crate::error::CoreError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status().as_u16();
        let final_url = resp.url().to_string();
        let body = resp.text().await?;
        Ok((status, final_url, body))
    }
}

pub struct FetchScheduler {
    pub lanes: HashMap<Lane, (Arc<Semaphore>, LaneConfig)>,
    pub frontier: Arc<UrlFrontier>,
    pacers: AsyncMutex<HashMap<String, Arc<HostPacer>>>,
    fetchers: Vec<Arc<dyn PageFetcher>>,
}

impl FetchScheduler {
    pub fn new(frontier: Arc<UrlFrontier>, fetchers: Vec<Arc<dyn PageFetcher>>, lane_configs: HashMap<Lane, LaneConfig>) -> Self {
        let lanes = lane_configs
            .into_iter()
            .map(|(lane, cfg)| (lane, (Arc::new(Semaphore::new(cfg.concurrency)), cfg)))
            .collect();
        FetchScheduler { lanes, frontier, pacers: AsyncMutex::new(HashMap::new()), fetchers }
    }

    async fn pacer_for(&self, host: &str) -> Arc<HostPacer> {
        let mut pacers = self.pacers.lock().await;
        pacers
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(HostPacer::new(Duration::from_millis(250), 2)))
            .clone()
    }

    /// Execute one URL through the full fallback ladder, honoring UF's
    /// pre-fetch gate and lane concurrency. Returns `None` when UF says to
    /// skip outright.
    pub async fn fetch_with_ladder(&self, lane: Lane, url: &str) -> rusqlite::Result<Option<FetchResult>> {
        let now = chrono::Utc::now();
        if self.frontier.should_skip_url(url, now)?.is_some() {
            return Ok(None);
        }

        let Some((semaphore, _cfg)) = self.lanes.get(&lane) else {
            return Ok(None);
        };
        let _permit = semaphore.acquire().await.expect("lane semaphore closed");

        let host = crate::frontier::host_of(url);
        let pacer = self.pacer_for(&host).await;

        let mut attempts = Vec::new();
        let mut mode = Some(FetchMode::Http);
        let mut attempt_index = 0u32;

        while let Some(current_mode) = mode {
            let Some(fetcher) = self.fetchers.iter().find(|f| f.mode() == current_mode) else {
                mode = next_fetch_mode(current_mode);
                continue;
            };

            pacer.acquire().await;
            let start = tokio::time::Instant::now();
            let outcome = fetcher.fetch(url).await;
            pacer.release().await;
            let elapsed_ms = start.elapsed().as_millis() as u64;

            match outcome {
                Ok((status, final_url, body)) => {
                    attempts.push(FetchAttempt { attempt_index, fetcher_kind: current_mode, reason: format!("status_{status}"), elapsed_ms });
                    let trigger = EscalationTrigger::HttpStatus(status);
                    if !should_escalate(trigger) {
                        self.frontier.record_fetch(url, FetchOutcome::Success, None, now)?;
                        return Ok(Some(FetchResult {
                            final_url,
                            status_code: Some(status),
                            body: Some(body),
                            fetch_mode: current_mode,
                            attempts,
                            dead_url_cooldown_applied: false,
                        }));
                    }
                    if status == 404 || status == 410 {
                        let cooldown_until = now + chrono::Duration::days(DEAD_URL_COOLDOWN_DAYS);
                        self.frontier.record_fetch(url, FetchOutcome::DeadUrl, Some(cooldown_until), now)?;
                        return Ok(Some(FetchResult {
                            final_url,
                            status_code: Some(status),
                            body: None,
                            fetch_mode: current_mode,
                            attempts,
                            dead_url_cooldown_applied: true,
                        }));
                    }
                    if status == 403 || status == 429 {
                        self.frontier.record_fetch(url, FetchOutcome::Blocked, Some(now + chrono::Duration::minutes(15)), now)?;
                    } else {
                        self.frontier.record_fetch(url, FetchOutcome::Transient, None, now)?;
                    }
                }
                Err(_) => {
                    attempts.push(FetchAttempt { attempt_index, fetcher_kind: current_mode, reason: "network_error".into(), elapsed_ms });
                    self.frontier.record_fetch(url, FetchOutcome::Transient, None, now)?;
                }
            }

            attempt_index += 1;
            mode = next_fetch_mode(current_mode);
        }

        Ok(Some(FetchResult {
            final_url: url.to_string(),
            status_code: None,
            body: None,
            fetch_mode: FetchMode::AltCrawler,
            attempts,
            dead_url_cooldown_applied: false,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_ladder_terminates_after_alt_crawler() {
        assert_eq!(next_fetch_mode(FetchMode::Http), Some(FetchMode::Headless));
        assert_eq!(next_fetch_mode(FetchMode::Headless), Some(FetchMode::AltCrawler));
        assert_eq!(next_fetch_mode(FetchMode::AltCrawler), None);
    }

    #[test]
    fn escalation_triggers_on_blocking_status_codes() {
        assert!(should_escalate(EscalationTrigger::HttpStatus(403)));
        assert!(should_escalate(EscalationTrigger::HttpStatus(429)));
        assert!(should_escalate(EscalationTrigger::HttpStatus(503)));
        assert!(!should_escalate(EscalationTrigger::HttpStatus(200)));
    }

    #[tokio::test]
    async fn ladder_skips_when_frontier_says_skip() {
        let frontier = Arc::new(UrlFrontier::open_in_memory().unwrap());
        let now = chrono::Utc::now();
        frontier.record_fetch("https://example.com/a", FetchOutcome::Blocked, Some(now + chrono::Duration::hours(1)), now).unwrap();

        let mut lanes = HashMap::new();
        lanes.insert(Lane::Fetch, LaneConfig::default());
        let scheduler = FetchScheduler::new(frontier, vec![], lanes);
        let result = scheduler.fetch_with_ladder(Lane::Fetch, "https://example.com/a").await.unwrap();
        assert!(result.is_none());
    }
}
