//! Appraisal: tagging and scoring an image through the external oracles.
//!
//! Callers never see an appraisal failure. Timeouts and oracle errors resolve
//! to fallback values (empty tags with a marker, a random score in [2, 5]).

pub mod oracle;
pub mod parse;
pub mod queue;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub use oracle::{HttpOracle, JobKind, NullOracle, Oracle};
pub use parse::{TagPolicy, TagResult, ERROR_MARKER, TIMEOUT_MARKER};
pub use queue::{AppraisalError, AppraisalQueue, ResultHandle};

use crate::logging::log_appraisal;

#[derive(Debug, Clone, PartialEq)]
pub struct Appraisal {
    pub tags: TagResult,
    pub score: f64,
    /// True when the score was synthesized rather than returned by the scorer.
    pub score_fallback: bool,
}

pub struct Appraiser {
    queue: Arc<AppraisalQueue>,
    timeout: Duration,
    policy: TagPolicy,
}

impl Appraiser {
    pub fn new(queue: Arc<AppraisalQueue>, timeout: Duration, policy: TagPolicy) -> Self {
        Self { queue, timeout, policy }
    }

    pub fn queue(&self) -> &Arc<AppraisalQueue> {
        &self.queue
    }

    /// Tags then scores `image`. Both jobs are queued up front so they run
    /// back to back in the worker; each wait has its own timeout.
    pub async fn appraise(&self, image: &Path) -> Appraisal {
        let tag_handle = self.queue.submit(JobKind::Tag, image.to_path_buf());
        let score_handle = self.queue.submit(JobKind::Score, image.to_path_buf());
        let tags = self.collect_tags(tag_handle).await;
        let (score, score_fallback) = self.collect_score(score_handle).await;
        Appraisal { tags, score, score_fallback }
    }

    async fn collect_tags(&self, handle: ResultHandle) -> TagResult {
        let job_id = handle.job_id;
        match handle.wait(self.timeout).await {
            Ok(payload) => {
                let parsed = parse::parse_tags(&payload, &self.policy);
                let outcome = if parsed.is_fallback() { "unparsed" } else { "ok" };
                log_appraisal("tag", job_id, outcome, &parsed.summary);
                parsed
            }
            Err(AppraisalError::Timeout(_)) => {
                log_appraisal("tag", job_id, "timeout", TIMEOUT_MARKER);
                TagResult::fallback(TIMEOUT_MARKER)
            }
            Err(err) => {
                log_appraisal("tag", job_id, "error", &err.to_string());
                TagResult::fallback(ERROR_MARKER)
            }
        }
    }

    async fn collect_score(&self, handle: ResultHandle) -> (f64, bool) {
        let job_id = handle.job_id;
        let (outcome, detail) = match handle.wait(self.timeout).await {
            Ok(payload) => match parse::parse_score(&payload) {
                Some(score) => {
                    log_appraisal("score", job_id, "ok", &format!("{:.3}", score));
                    return (score, false);
                }
                None => ("unparsed", payload.to_string()),
            },
            Err(AppraisalError::Timeout(_)) => ("timeout", String::new()),
            Err(err) => ("error", err.to_string()),
        };
        let score = parse::fallback_score(&mut rand::thread_rng());
        log_appraisal("score", job_id, outcome, &format!("fallback {:.3} {}", score, detail));
        (score, true)
    }
}
