use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::oracle::{JobKind, Oracle};
use crate::logging::{log, obj, v_str, Domain, Level, ProfileScope};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AppraisalError {
    #[error("appraisal timed out after {0:?}")]
    Timeout(Duration),
    #[error("appraisal failed: {0}")]
    Failed(String),
    #[error("appraisal worker is not running")]
    WorkerGone,
}

struct Job {
    id: u64,
    kind: JobKind,
    input: PathBuf,
    reply: oneshot::Sender<Result<Value, AppraisalError>>,
}

/// Awaitable result of one submitted job.
pub struct ResultHandle {
    pub job_id: u64,
    pub kind: JobKind,
    rx: oneshot::Receiver<Result<Value, AppraisalError>>,
}

impl ResultHandle {
    /// Waits up to `timeout`. Timing out abandons only this wait; the job
    /// still runs to completion and its result is dropped.
    pub async fn wait(self, timeout: Duration) -> Result<Value, AppraisalError> {
        match tokio::time::timeout(timeout, self.rx).await {
            Err(_) => Err(AppraisalError::Timeout(timeout)),
            Ok(Err(_)) => Err(AppraisalError::WorkerGone),
            Ok(Ok(result)) => result,
        }
    }
}

/// Serializes calls to the external tagger and scorer. A single worker task
/// owns both oracle handles and drains jobs strictly in submission order, one
/// at a time.
pub struct AppraisalQueue {
    tx: mpsc::UnboundedSender<Job>,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl AppraisalQueue {
    pub fn start(tagger: Arc<dyn Oracle>, scorer: Arc<dyn Oracle>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn(run_worker(rx, shutdown_rx, tagger, scorer));
        log(Level::Info, Domain::Appraisal, "worker_started", obj(&[]));
        Self {
            tx,
            shutdown,
            worker: Mutex::new(Some(worker)),
            next_id: AtomicU64::new(1),
        }
    }

    /// Enqueues without blocking. After shutdown the handle resolves to
    /// `WorkerGone` immediately.
    pub fn submit(&self, kind: JobKind, input: PathBuf) -> ResultHandle {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (reply, rx) = oneshot::channel();
        let job = Job { id, kind, input, reply };
        if self.tx.send(job).is_err() {
            log(
                Level::Warn,
                Domain::Appraisal,
                "submit_rejected",
                obj(&[("job_id", json!(id)), ("kind", v_str(kind.as_str()))]),
            );
        }
        ResultHandle { job_id: id, kind, rx }
    }

    /// Stops the worker after its current job. Queued jobs are abandoned.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let handle = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        log(Level::Info, Domain::Appraisal, "worker_stopped", obj(&[]));
    }
}

async fn run_worker(
    mut rx: mpsc::UnboundedReceiver<Job>,
    mut shutdown: watch::Receiver<bool>,
    tagger: Arc<dyn Oracle>,
    scorer: Arc<dyn Oracle>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        let job = tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        let oracle = match job.kind {
            JobKind::Tag => tagger.clone(),
            JobKind::Score => scorer.clone(),
        };
        let input = job.input.clone();
        let _scope = ProfileScope::with_context(
            "oracle_call",
            &[("job_id", json!(job.id)), ("kind", v_str(job.kind.as_str()))],
        );
        // Run on its own task so a panicking client cannot take the loop down.
        let outcome = tokio::spawn(async move { oracle.predict(&input).await }).await;
        let result = match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(AppraisalError::Failed(err.to_string())),
            Err(join) => Err(AppraisalError::Failed(format!("oracle task aborted: {}", join))),
        };
        if let Err(err) = &result {
            log(
                Level::Warn,
                Domain::Appraisal,
                "job_failed",
                obj(&[("job_id", json!(job.id)), ("error", v_str(&err.to_string()))]),
            );
        }
        if job.reply.send(result).is_err() {
            log(
                Level::Debug,
                Domain::Appraisal,
                "result_discarded",
                obj(&[("job_id", json!(job.id)), ("kind", v_str(job.kind.as_str()))]),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;

    /// Records call order and concurrency; sleeps `delay` per call.
    struct Recorder {
        delay: Duration,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        calls: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Oracle for Recorder {
        async fn predict(&self, image: &Path) -> anyhow::Result<Value> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            let name = image.to_string_lossy().to_string();
            self.calls.lock().unwrap().push(name.clone());
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if name == "boom" {
                anyhow::bail!("oracle exploded");
            }
            if name == "panic" {
                panic!("client bug");
            }
            Ok(json!([name]))
        }
    }

    #[tokio::test]
    async fn test_fifo_and_serial() {
        let recorder = Recorder::new(Duration::from_millis(5));
        let queue = AppraisalQueue::start(recorder.clone(), recorder.clone());
        let handles: Vec<_> = (0..5)
            .map(|i| {
                let kind = if i % 2 == 0 { JobKind::Tag } else { JobKind::Score };
                queue.submit(kind, PathBuf::from(format!("img{}", i)))
            })
            .collect();
        for (i, h) in handles.into_iter().enumerate() {
            let v = h.wait(Duration::from_secs(5)).await.unwrap();
            assert_eq!(v, json!([format!("img{}", i)]));
        }
        assert_eq!(recorder.max_in_flight.load(Ordering::SeqCst), 1);
        let calls = recorder.calls.lock().unwrap().clone();
        assert_eq!(calls, vec!["img0", "img1", "img2", "img3", "img4"]);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_failures_do_not_kill_worker() {
        let recorder = Recorder::new(Duration::from_millis(1));
        let queue = AppraisalQueue::start(recorder.clone(), recorder.clone());
        let err = queue
            .submit(JobKind::Tag, PathBuf::from("boom"))
            .wait(Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, AppraisalError::Failed(_)));
        let err = queue
            .submit(JobKind::Score, PathBuf::from("panic"))
            .wait(Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, AppraisalError::Failed(_)));
        let ok = queue
            .submit(JobKind::Score, PathBuf::from("fine"))
            .wait(Duration::from_secs(5))
            .await;
        assert!(ok.is_ok());
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_timeout_does_not_block_next_job() {
        let recorder = Recorder::new(Duration::from_millis(200));
        let queue = AppraisalQueue::start(recorder.clone(), recorder.clone());
        let slow = queue.submit(JobKind::Tag, PathBuf::from("slow"));
        let next = queue.submit(JobKind::Score, PathBuf::from("next"));
        let err = slow.wait(Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, AppraisalError::Timeout(_)));
        let v = next.wait(Duration::from_secs(5)).await.unwrap();
        assert_eq!(v, json!(["next"]));
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_submit_after_shutdown() {
        let recorder = Recorder::new(Duration::from_millis(1));
        let queue = AppraisalQueue::start(recorder.clone(), recorder);
        queue.shutdown().await;
        let err = queue
            .submit(JobKind::Tag, PathBuf::from("late"))
            .wait(Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, AppraisalError::WorkerGone);
    }

    #[tokio::test]
    async fn test_shutdown_finishes_current_job() {
        let recorder = Recorder::new(Duration::from_millis(100));
        let queue = AppraisalQueue::start(recorder.clone(), recorder.clone());
        let first = queue.submit(JobKind::Tag, PathBuf::from("first"));
        let second = queue.submit(JobKind::Tag, PathBuf::from("second"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.shutdown().await;
        assert!(first.wait(Duration::from_secs(1)).await.is_ok());
        assert!(second.wait(Duration::from_secs(1)).await.is_err());
        assert_eq!(recorder.calls.lock().unwrap().len(), 1);
    }
}
