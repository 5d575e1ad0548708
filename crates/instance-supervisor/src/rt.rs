//! Runtime-agnostic spawning and timing
//!
//! Background tasks (watchdogs, output drains) go through the [`Spawner`]
//! trait so the supervisor does not couple to one async runtime. The default
//! spawner is selected by cargo feature; callers with special needs can
//! provide their own implementation.

use async_io::Timer;
use futures_lite::future;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// A spawner that can spawn futures on an async runtime
pub trait Spawner: Send + Sync {
    /// Spawn a future on the runtime
    ///
    /// The future will run to completion in the background.
    fn spawn(&self, future: Pin<Box<dyn Future<Output = ()> + Send + 'static>>);
}

/// Spawner for the smol runtime
#[cfg(feature = "smol")]
#[derive(Debug, Clone, Copy)]
pub struct SmolSpawner;

#[cfg(feature = "smol")]
impl Spawner for SmolSpawner {
    fn spawn(&self, future: Pin<Box<dyn Future<Output = ()> + Send + 'static>>) {
        smol::spawn(future).detach();
    }
}

/// Spawner for the tokio runtime
#[cfg(feature = "tokio")]
#[derive(Debug, Clone, Copy)]
pub struct TokioSpawner;

#[cfg(feature = "tokio")]
impl Spawner for TokioSpawner {
    fn spawn(&self, future: Pin<Box<dyn Future<Output = ()> + Send + 'static>>) {
        tokio::spawn(future);
    }
}

/// The spawner selected by compile-time features
///
/// - `smol` feature uses [`SmolSpawner`]
/// - `tokio` feature uses [`TokioSpawner`]
pub fn default_spawner() -> Arc<dyn Spawner> {
    #[cfg(feature = "smol")]
    {
        Arc::new(SmolSpawner)
    }

    #[cfg(all(feature = "tokio", not(feature = "smol")))]
    {
        Arc::new(TokioSpawner)
    }

    #[cfg(not(any(feature = "smol", feature = "tokio")))]
    {
        compile_error!("One of the runtime features must be enabled: smol or tokio");
    }
}

/// Sleep for the specified duration
pub async fn sleep(duration: Duration) {
    Timer::after(duration).await;
}

/// Run a future with a deadline, returning `None` when time runs out
pub async fn timeout<F: Future>(duration: Duration, fut: F) -> Option<F::Output> {
    future::or(async { Some(fut.await) }, async {
        Timer::after(duration).await;
        None
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sleep() {
        smol::block_on(async {
            let start = std::time::Instant::now();
            sleep(Duration::from_millis(100)).await;
            let elapsed = start.elapsed();
            assert!(elapsed >= Duration::from_millis(100));
            assert!(elapsed < Duration::from_millis(500));
        });
    }

    #[test]
    fn test_timeout_elapses() {
        smol::block_on(async {
            let result = timeout(Duration::from_millis(50), async {
                sleep(Duration::from_secs(10)).await;
                42
            })
            .await;
            assert_eq!(result, None);
        });
    }

    #[test]
    fn test_timeout_completes() {
        smol::block_on(async {
            let result = timeout(Duration::from_secs(10), async { 42 }).await;
            assert_eq!(result, Some(42));
        });
    }

    #[cfg(feature = "smol")]
    #[smol_potat::test]
    async fn test_default_spawner_runs_tasks() {
        let (tx, rx) = std::sync::mpsc::channel();
        default_spawner().spawn(Box::pin(async move {
            let _ = tx.send(42);
        }));
        let value = smol::unblock(move || rx.recv().unwrap()).await;
        assert_eq!(value, 42);
    }
}
