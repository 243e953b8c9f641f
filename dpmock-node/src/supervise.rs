//! Restart-forever supervision of background loops.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Run `f` until `cancel` fires, restarting it `backoff` after every return.
///
/// `f` receives the token and is expected to observe it itself. It is never
/// dropped mid-flight, so cleanup inside `f` always runs.
pub async fn supervise<F, Fut, E>(name: &str, backoff: Duration, cancel: CancellationToken, mut f: F)
where
    F: FnMut(CancellationToken) -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: Display,
{
    loop {
        match f(cancel.clone()).await {
            Ok(()) => debug!(task = name, "Task returned"),
            Err(e) => warn!(task = name, error = %e, "Task failed"),
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(backoff) => {}
        }
    }
    debug!(task = name, "Task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_restarts_until_cancelled() {
        let runs = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        let task = {
            let runs = Arc::clone(&runs);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                supervise("test", Duration::from_secs(5), cancel, |_| {
                    let runs = Arc::clone(&runs);
                    async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>("boom")
                    }
                })
                .await
            })
        };

        tokio::time::sleep(Duration::from_secs(12)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_sees_cancellation() {
        let cancel = CancellationToken::new();
        let cleaned_up = Arc::new(AtomicUsize::new(0));

        let task = {
            let cancel = cancel.clone();
            let cleaned_up = Arc::clone(&cleaned_up);
            tokio::spawn(async move {
                supervise("test", Duration::from_secs(1), cancel, |token| {
                    let cleaned_up = Arc::clone(&cleaned_up);
                    async move {
                        token.cancelled().await;
                        cleaned_up.fetch_add(1, Ordering::SeqCst);
                        Ok::<(), String>(())
                    }
                })
                .await
            })
        };

        tokio::task::yield_now().await;
        cancel.cancel();
        task.await.unwrap();
        assert_eq!(cleaned_up.load(Ordering::SeqCst), 1);
    }
}
