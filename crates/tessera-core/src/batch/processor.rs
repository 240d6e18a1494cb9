//! Core batch processor for concurrent, isolated item executions.

use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, error, warn};

use crate::batch::types::{BatchItemResult, BatchItemStatus, BatchSettings};
use crate::error::{EngineError, ErrorKind, ExecutionFailure};

/// Runs batch items concurrently.
///
/// At most `concurrency` items execute at once. Each item is bounded by the
/// per-item timeout and by the batch deadline; an item that exceeds either
/// becomes a failed item while its siblings continue. `process` returns once
/// every item has reached a terminal state.
#[derive(Debug, Clone)]
pub struct BatchProcessor {
    settings: BatchSettings,
}

impl BatchProcessor {
    pub fn new(settings: BatchSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &BatchSettings {
        &self.settings
    }

    /// Process a batch of items.
    ///
    /// `processor` receives the item index and the item, and must always
    /// produce a result; results are returned in item order.
    pub async fn process<T, F, Fut>(&self, items: Vec<T>, processor: F) -> Vec<BatchItemResult>
    where
        T: Send + 'static,
        F: Fn(usize, T) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = BatchItemResult> + Send + 'static,
    {
        let total = items.len();
        if total == 0 {
            return Vec::new();
        }

        let BatchSettings { concurrency, item_timeout, batch_timeout } = self.settings;
        let deadline = Instant::now() + batch_timeout;
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));

        debug!(
            total_items = total,
            concurrency,
            item_timeout_secs = item_timeout.as_secs(),
            batch_timeout_secs = batch_timeout.as_secs(),
            "Starting batch processing"
        );

        let mut handles = Vec::with_capacity(total);
        for (index, item) in items.into_iter().enumerate() {
            let processor = processor.clone();
            let semaphore = Arc::clone(&semaphore);

            handles.push(tokio::spawn(async move {
                let _permit = match timeout_at(deadline, semaphore.acquire_owned()).await {
                    Ok(Ok(permit)) => permit,
                    Ok(Err(e)) => {
                        error!(index, "Failed to acquire semaphore: {}", e);
                        return BatchItemResult::failed(
                            index,
                            None,
                            ExecutionFailure::new(ErrorKind::StepFailure, format!("Semaphore error: {e}")),
                        );
                    }
                    Err(_) => return timed_out(index, batch_timeout),
                };

                let item_deadline = (Instant::now() + item_timeout).min(deadline);
                match timeout_at(item_deadline, processor(index, item)).await {
                    Ok(result) => result,
                    Err(_) => {
                        let limit = if item_deadline == deadline { batch_timeout } else { item_timeout };
                        timed_out(index, limit)
                    }
                }
            }));
        }

        // Join barrier: every item reaches a terminal state before returning.
        let results: Vec<BatchItemResult> = join_all(handles)
            .await
            .into_iter()
            .enumerate()
            .map(|(index, joined)| {
                joined.unwrap_or_else(|e| {
                    error!(index, "Batch item task failed: {}", e);
                    BatchItemResult::failed(
                        index,
                        None,
                        ExecutionFailure::new(ErrorKind::StepFailure, format!("Item task failed: {e}")),
                    )
                })
            })
            .collect();

        debug!(
            total_items = total,
            successful = results.iter().filter(|r| r.status == BatchItemStatus::Success).count(),
            failed = results.iter().filter(|r| r.status == BatchItemStatus::Failed).count(),
            "Batch processing completed"
        );

        results
    }
}

fn timed_out(index: usize, limit: Duration) -> BatchItemResult {
    warn!(index, limit_secs = limit.as_secs(), "Batch item timed out");
    BatchItemResult::failed(index, None, EngineError::Timeout(limit).into_failure(None))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn settings(concurrency: usize, item_timeout: Duration, batch_timeout: Duration) -> BatchSettings {
        BatchSettings { concurrency, item_timeout, batch_timeout }
    }

    async fn mock_processor(index: usize, item: usize) -> BatchItemResult {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if item == 5 {
            BatchItemResult::failed(index, None, ExecutionFailure::new(ErrorKind::StepFailure, "Simulated error"))
        } else {
            BatchItemResult::success(index, format!("exec-{item}"), Map::new(), Some(item as f64))
        }
    }

    #[tokio::test]
    async fn test_failure_is_isolated() {
        let processor = BatchProcessor::new(BatchSettings::default());

        let results = processor.process((0..10).collect(), mock_processor).await;

        assert_eq!(results.len(), 10);
        assert_eq!(results.iter().filter(|r| r.status == BatchItemStatus::Failed).count(), 1);
        assert_eq!(results[5].status, BatchItemStatus::Failed);
        let indices: Vec<usize> = results.iter().map(|r| r.item_index).collect();
        assert_eq!(indices, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let processor = BatchProcessor::new(settings(3, Duration::from_secs(10), Duration::from_secs(60)));
        let results = processor
            .process((0..12).collect::<Vec<usize>>(), {
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                move |index, _item| {
                    let active = Arc::clone(&active);
                    let peak = Arc::clone(&peak);
                    async move {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                        BatchItemResult::skipped(index, "exec")
                    }
                }
            })
            .await;

        assert_eq!(results.len(), 12);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_item_timeout_fails_only_that_item() {
        let processor = BatchProcessor::new(settings(4, Duration::from_secs(120), Duration::from_secs(600)));

        let results = processor
            .process(vec![0u64, 500, 1], |index, secs| async move {
                tokio::time::sleep(Duration::from_secs(secs)).await;
                BatchItemResult::success(index, "exec", Map::new(), None)
            })
            .await;

        assert_eq!(results[0].status, BatchItemStatus::Success);
        assert_eq!(results[1].status, BatchItemStatus::Failed);
        assert_eq!(results[1].error.as_ref().unwrap().error_kind, ErrorKind::Retryable);
        assert_eq!(results[2].status, BatchItemStatus::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_timeout_fails_remaining_items() {
        // One slot, each item takes 100s, batch budget 250s: the third item
        // starts at 200s and is cut off, the fourth never starts.
        let processor = BatchProcessor::new(settings(1, Duration::from_secs(120), Duration::from_secs(250)));

        let results = processor
            .process(vec![100u64; 4], |index, secs| async move {
                tokio::time::sleep(Duration::from_secs(secs)).await;
                BatchItemResult::success(index, "exec", Map::new(), None)
            })
            .await;

        let statuses: Vec<BatchItemStatus> = results.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![
                BatchItemStatus::Success,
                BatchItemStatus::Success,
                BatchItemStatus::Failed,
                BatchItemStatus::Failed,
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let processor = BatchProcessor::new(BatchSettings::default());
        let results = processor.process(Vec::<usize>::new(), mock_processor).await;
        assert!(results.is_empty());
    }
}
