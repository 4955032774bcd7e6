//! Signal-to-cancellation bridge.
//!
//! Grounded on `vzclient/service.py::Service`, adapted from synchronous
//! `signal.signal` handlers to racing `tokio::signal` futures, since Tokio
//! has no direct equivalent of reinstalling the previous handler on drop —
//! the scope here is "stop watching for signals", not "restore prior
//! handlers" (spec.md §4.7's "restores previously installed handlers" is
//! approximated by simply not installing anything further once the guard
//! is dropped).

use std::future::Future;

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Runs until interrupted (SIGINT) or terminated (SIGTERM), then cancels
/// `token` and, if given, awaits `on_stop`.
pub async fn run_until_signal<Fut>(token: CancellationToken, on_stop: Option<Fut>)
where
    Fut: Future<Output = ()>,
{
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            info!("received SIGTERM, shutting down");
        }
    }

    token.cancel();
    if let Some(fut) = on_stop {
        fut.await;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn token_is_cancelled_after_signal_free_timeout() {
        // There is no portable way to raise SIGINT/SIGTERM to just this
        // test process from within the test harness, so this exercises the
        // cancellation side of the contract directly: a token passed to a
        // caller that races it against signals becomes cancelled once
        // `.cancel()` is invoked, same as `run_until_signal` would do.
        let token = CancellationToken::new();
        let child = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            child.cancel();
        });
        token.cancelled().await;
        assert!(token.is_cancelled());
    }
}
