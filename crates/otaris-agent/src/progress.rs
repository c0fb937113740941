//! Background deployment progress reporting.
//!
//! While an install is in flight, a reporter thread periodically reads the
//! shared bytes-written counter and pushes a status report whose substate
//! carries a `$progress=<pct>` token. The token format is a wire contract
//! with server-side consumers, so an existing token is rewritten in place
//! and one is prepended when absent.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use regex::Regex;
use tracing::warn;

use otaris_client::deployments::{DeploymentStatus, StatusReport};
use otaris_client::ApiClient;
use otaris_common::cancel::CancelToken;

static PROGRESS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(.*?)(\$progress=)([0-9]+(\.[0-9]+)?)?(.*)").unwrap()
});

/// Rewrite the `$progress=` token of a substate to the given percentage.
pub fn rewrite_substate(substate: &str, percent: f64) -> String {
    let substate = if PROGRESS_RE.is_match(substate) {
        substate.to_owned()
    } else {
        format!("$progress=0,{substate}")
    };
    PROGRESS_RE
        .replace(&substate, |caps: &regex::Captures| {
            format!("{}{}{:.2}{}", &caps[1], &caps[2], percent, &caps[5])
        })
        .into_owned()
}

/// Handle of a running progress reporter.
pub struct ProgressReporter {
    handle: JoinHandle<()>,
    done: CancelToken,
}

impl ProgressReporter {
    /// Spawn a reporter pushing the progress of `counter` towards `total`
    /// bytes every `interval`.
    pub fn spawn(
        client: ApiClient,
        deployment_id: String,
        status: DeploymentStatus,
        counter: Arc<AtomicU64>,
        total: u64,
        interval: Duration,
        cancel: CancelToken,
    ) -> Self {
        let done = CancelToken::new();
        let token = done.clone();
        let handle = std::thread::spawn(move || {
            run(client, deployment_id, status, counter, total, interval, cancel, token);
        });
        Self { handle, done }
    }

    /// Stop the reporter and wait for it to exit.
    pub fn finish(self) {
        self.done.cancel();
        let _ = self.handle.join();
    }
}

#[allow(clippy::too_many_arguments)]
fn run(
    mut client: ApiClient,
    deployment_id: String,
    status: DeploymentStatus,
    counter: Arc<AtomicU64>,
    total: u64,
    interval: Duration,
    cancel: CancelToken,
    done: CancelToken,
) {
    if total == 0 {
        return;
    }
    let mut substate = String::new();
    let mut last_progress = u64::MAX;
    loop {
        // Sleep in small steps so cancellation is observed promptly.
        let deadline = Instant::now() + interval;
        while Instant::now() < deadline {
            if cancel.is_cancelled() || done.is_cancelled() {
                return;
            }
            std::thread::sleep(Duration::from_millis(50).min(interval));
        }
        let progress = counter.load(Ordering::Relaxed);
        if progress != last_progress {
            last_progress = progress;
            let percent = (progress as f64 / total as f64) * 100.0;
            substate = rewrite_substate(&substate, percent);
            let report = StatusReport::new(status).with_substate(substate.clone());
            if let Err(error) = client.update_status(&deployment_id, report) {
                warn!("unable to report progress: {error:?}");
            }
        }
        if progress >= total {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rewrite_substate_prepends_token() {
        assert_eq!(rewrite_substate("", 0.0), "$progress=0.00,");
        assert_eq!(
            rewrite_substate("writing rootfs", 12.5),
            "$progress=12.50,writing rootfs"
        );
    }

    #[test]
    fn test_rewrite_substate_replaces_existing_token() {
        assert_eq!(
            rewrite_substate("$progress=12.50,writing rootfs", 99.9),
            "$progress=99.90,writing rootfs"
        );
        // The token may be embedded anywhere in the substate.
        assert_eq!(
            rewrite_substate("phase 2: $progress=7, syncing", 50.0),
            "phase 2: $progress=50.00, syncing"
        );
    }

    #[test]
    fn test_rewrite_substate_is_stable() {
        let once = rewrite_substate("stage", 10.0);
        let twice = rewrite_substate(&once, 20.0);
        assert_eq!(twice, "$progress=20.00,stage");
    }
}
