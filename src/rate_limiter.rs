use chrono::{DateTime, NaiveTime, Utc};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::SauceError;

const MAX_ATTEMPTS: u32 = 3;

enum Verdict {
    Ready,
    /// The short window is full; a slot opens after this long.
    Wait(Duration),
    DailyExhausted(String),
}

/// A rate limiter that enforces a short sliding window and a per-UTC-day quota
pub struct RateLimiter {
    window: Duration,
    window_limit: u32,
    window_requests: Mutex<VecDeque<Instant>>,

    day_limit: u32,
    day_requests: Mutex<VecDeque<DateTime<Utc>>>,
}

fn today_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive().and_time(NaiveTime::MIN).and_utc()
}

impl RateLimiter {
    pub fn new(window_limit: u32, window: Duration, day_limit: u32) -> Self {
        Self {
            window,
            window_limit,
            window_requests: Mutex::new(VecDeque::new()),
            day_limit,
            day_requests: Mutex::new(VecDeque::new()),
        }
    }

    /// (used in window, window limit, used today, daily limit)
    pub async fn usage(&self) -> (u32, u32, u32, u32) {
        let now = Instant::now();
        let mut window_requests = self.window_requests.lock().await;
        while window_requests
            .front()
            .is_some_and(|t| now.duration_since(*t) >= self.window)
        {
            window_requests.pop_front();
        }
        let window_used = window_requests.len() as u32;
        drop(window_requests);

        let mut day_requests = self.day_requests.lock().await;
        let start = today_start(Utc::now());
        while day_requests.front().is_some_and(|t| *t < start) {
            day_requests.pop_front();
        }
        let day_used = day_requests.len() as u32;

        (window_used, self.window_limit, day_used, self.day_limit)
    }

    /// Check both windows and record the request if there is room.
    async fn try_record(&self) -> Verdict {
        let now_utc = Utc::now();
        let mut day_requests = self.day_requests.lock().await;
        let start = today_start(now_utc);
        while day_requests.front().is_some_and(|t| *t < start) {
            day_requests.pop_front();
        }
        if day_requests.len() >= self.day_limit as usize {
            let reset = start + chrono::Duration::days(1) - now_utc;
            return Verdict::DailyExhausted(format!(
                "daily limit of {} lookups reached, resets in {}h {}m",
                self.day_limit,
                reset.num_hours(),
                reset.num_minutes() % 60
            ));
        }

        let now = Instant::now();
        let mut window_requests = self.window_requests.lock().await;
        while window_requests
            .front()
            .is_some_and(|t| now.duration_since(*t) >= self.window)
        {
            window_requests.pop_front();
        }
        if window_requests.len() >= self.window_limit as usize {
            let wait = window_requests
                .front()
                .map(|oldest| self.window.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or(self.window);
            return Verdict::Wait(wait.max(Duration::from_millis(100)));
        }

        window_requests.push_back(now);
        day_requests.push_back(now_utc);
        Verdict::Ready
    }

    /// Wait for a free slot in the short window, giving up on the daily quota straight away.
    pub async fn acquire(&self) -> Result<(), SauceError> {
        for attempt in 1..=MAX_ATTEMPTS {
            match self.try_record().await {
                Verdict::Ready => return Ok(()),
                Verdict::DailyExhausted(msg) => {
                    warn!("⛔ {}", msg);
                    return Err(SauceError::RateLimited(msg));
                }
                Verdict::Wait(wait) => {
                    info!(
                        "🔄 Rate limit retry attempt {}/{}: waiting {:?}",
                        attempt, MAX_ATTEMPTS, wait
                    );
                    tokio::time::sleep(wait).await;
                }
            }
        }
        warn!("⛔ Giving up after {} attempts to acquire a rate limit slot", MAX_ATTEMPTS);
        Err(SauceError::RateLimited(format!(
            "no slot freed up after {} attempts",
            MAX_ATTEMPTS
        )))
    }
}
