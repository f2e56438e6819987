use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::error;

use crate::error::RegexTimeout;

/// What a successful search found.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchOutcome {
    /// Capture groups of the first match. Index 0 is the whole match.
    pub groups: Vec<Option<String>>,
    /// Every non-overlapping match in the text.
    pub fragments: Vec<String>,
}

/// Runs regex searches off the async executor with a hard deadline.
///
/// At most `workers` searches run at once. The deadline covers waiting for a
/// worker as well as the search itself. A search that overruns is abandoned:
/// its blocking thread keeps its worker slot until it finishes, so runaway
/// patterns cannot pile up more than `workers` threads.
pub struct RegexPool {
    permits: Arc<Semaphore>,
    timeout: Duration,
}

impl RegexPool {
    pub fn new(workers: usize, timeout: Duration) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers.max(1))),
            timeout,
        }
    }

    pub async fn search(&self, regex: &Regex, text: &str) -> Result<Option<MatchOutcome>, RegexTimeout> {
        let regex = regex.clone();
        let text = text.to_owned();
        let permits = Arc::clone(&self.permits);

        let job = async move {
            let Ok(permit) = permits.acquire_owned().await else {
                return None;
            };
            let worker = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                search_blocking(&regex, &text)
            });
            match worker.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("Regex worker failed: {:?}", e);
                    None
                }
            }
        };

        tokio::time::timeout(self.timeout, job)
            .await
            .map_err(|_| RegexTimeout(self.timeout))
    }
}

fn search_blocking(regex: &Regex, text: &str) -> Option<MatchOutcome> {
    let captures = regex.captures(text)?;
    let groups = captures
        .iter()
        .map(|group| group.map(|m| m.as_str().to_string()))
        .collect();
    let fragments = regex.find_iter(text).map(|m| m.as_str().to_string()).collect();
    Some(MatchOutcome { groups, fragments })
}
