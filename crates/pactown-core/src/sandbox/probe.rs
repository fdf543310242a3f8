//! Health probing.
//!
//! After launch, a service's health endpoint is polled with an increasing
//! back-off until it answers, the startup timeout elapses, or the process
//! exits. The probe only gates readiness; once a service has been observed
//! healthy, later non-2xx responses do not demote it.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

/// Back-off schedule between probe attempts; the last entry is the cap.
const BACKOFF_MS: [u64; 4] = [50, 100, 250, 500];

/// Per-request cap so one hung request cannot eat the whole timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Outcome of a health probe loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// An HTTP response with status 200-399 was observed.
    Healthy,

    /// The startup timeout elapsed without a healthy response.
    TimedOut,

    /// The process exited before becoming healthy.
    Exited(i32),

    /// Shutdown was requested while probing.
    Cancelled,
}

/// Poll `url` until it is healthy, the deadline passes, the process exits,
/// or shutdown is requested.
pub async fn wait_healthy(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
    exit: &mut watch::Receiver<Option<i32>>,
    cancel: &mut watch::Receiver<bool>,
) -> ProbeOutcome {
    let deadline = Instant::now() + timeout;
    let mut attempt = 0usize;

    loop {
        if let Some(status) = *exit.borrow() {
            return ProbeOutcome::Exited(status);
        }
        if *cancel.borrow() {
            return ProbeOutcome::Cancelled;
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return ProbeOutcome::TimedOut;
        }

        let request_timeout = REQUEST_TIMEOUT.min(remaining);
        match client.get(url).timeout(request_timeout).send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                if (200..400).contains(&status) {
                    return ProbeOutcome::Healthy;
                }
                debug!(url, status, "health endpoint not ready");
            },
            Err(e) => {
                debug!(url, error = %e, "health probe attempt failed");
            },
        }

        let backoff = Duration::from_millis(BACKOFF_MS[attempt.min(BACKOFF_MS.len() - 1)]);
        attempt += 1;

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return ProbeOutcome::TimedOut;
        }

        tokio::select! {
            () = tokio::time::sleep(backoff.min(remaining)) => {},
            changed = exit.changed() => {
                if changed.is_ok() {
                    if let Some(status) = *exit.borrow() {
                        return ProbeOutcome::Exited(status);
                    }
                }
            },
            changed = cancel.changed() => {
                if changed.is_ok() && *cancel.borrow() {
                    return ProbeOutcome::Cancelled;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    use super::*;

    fn channels() -> (
        watch::Sender<Option<i32>>,
        watch::Receiver<Option<i32>>,
        watch::Sender<bool>,
        watch::Receiver<bool>,
    ) {
        let (exit_tx, exit_rx) = watch::channel(None);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        (exit_tx, exit_rx, cancel_tx, cancel_rx)
    }

    async fn serve_once(status_line: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let response =
                    format!("HTTP/1.1 {status_line}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        format!("http://{addr}/health")
    }

    #[tokio::test]
    async fn test_healthy_on_ok_response() {
        let url = serve_once("200 OK").await;
        let client = reqwest::Client::new();
        let (_exit_tx, mut exit_rx, _cancel_tx, mut cancel_rx) = channels();

        let outcome = wait_healthy(
            &client,
            &url,
            Duration::from_secs(5),
            &mut exit_rx,
            &mut cancel_rx,
        )
        .await;
        assert_eq!(outcome, ProbeOutcome::Healthy);
    }

    #[tokio::test]
    async fn test_redirect_counts_as_healthy() {
        let url = serve_once("302 Found").await;
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap();
        let (_exit_tx, mut exit_rx, _cancel_tx, mut cancel_rx) = channels();

        let outcome = wait_healthy(
            &client,
            &url,
            Duration::from_secs(5),
            &mut exit_rx,
            &mut cancel_rx,
        )
        .await;
        assert_eq!(outcome, ProbeOutcome::Healthy);
    }

    #[tokio::test]
    async fn test_timeout_when_nothing_listens() {
        let client = reqwest::Client::new();
        let (_exit_tx, mut exit_rx, _cancel_tx, mut cancel_rx) = channels();

        // Grab a port and close it again so nothing answers there.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let outcome = wait_healthy(
            &client,
            &format!("http://{addr}/health"),
            Duration::from_millis(400),
            &mut exit_rx,
            &mut cancel_rx,
        )
        .await;
        assert_eq!(outcome, ProbeOutcome::TimedOut);
    }

    #[tokio::test]
    async fn test_exit_interrupts_probe() {
        let client = reqwest::Client::new();
        let (exit_tx, mut exit_rx, _cancel_tx, mut cancel_rx) = channels();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = exit_tx.send(Some(-9));
        });

        let outcome = wait_healthy(
            &client,
            &format!("http://{addr}/health"),
            Duration::from_secs(10),
            &mut exit_rx,
            &mut cancel_rx,
        )
        .await;
        assert_eq!(outcome, ProbeOutcome::Exited(-9));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_probe() {
        let client = reqwest::Client::new();
        let (_exit_tx, mut exit_rx, cancel_tx, mut cancel_rx) = channels();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = cancel_tx.send(true);
        });

        let outcome = wait_healthy(
            &client,
            &format!("http://{addr}/health"),
            Duration::from_secs(10),
            &mut exit_rx,
            &mut cancel_rx,
        )
        .await;
        assert_eq!(outcome, ProbeOutcome::Cancelled);
    }
}
