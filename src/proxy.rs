use tokio::sync::mpsc::Sender;

use crate::pool::{key_preview, PoolError};
use crate::server::AppState;
use crate::upstream::UpstreamError;

/// Events forwarded to the client's SSE connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyEvent {
    /// A model text fragment, emitted as `data: {"text": …}`.
    Text(String),
    /// A terminal error, emitted as `event: error`.
    Error(String),
    /// End of stream, emitted as `event: end` / `[DONE]`.
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureAction {
    Suspend,
    Invalidate,
}

/// Key-state transition for an upstream HTTP status.
///
/// 400/403 mean the credential itself is rejected and the key is removed
/// for good. Everything else (429, 5xx, unexpected codes) is assumed to
/// pass, so the key only cools off.
fn failure_action(status: u16) -> FailureAction {
    match status {
        400 | 403 => FailureAction::Invalidate,
        _ => FailureAction::Suspend,
    }
}

/// Drive one client stream: acquire a key, proxy the upstream SSE response,
/// record the outcome, and retry with another key until the pool runs dry.
///
/// Once any model text has been forwarded, a failure terminates the stream
/// with an error event instead of retrying; a restart would replay content
/// the client has already rendered.
pub async fn run_stream(
    state: AppState,
    model: String,
    enable_search: bool,
    tx: Sender<ProxyEvent>,
) {
    let history = state.history.snapshot();

    let max_attempts = match state.pool.status() {
        Ok(status) => status.available_keys,
        Err(e) => {
            tracing::error!(error = %e, "key pool status unavailable");
            send(&tx, ProxyEvent::Error("key pool unavailable".into())).await;
            send(&tx, ProxyEvent::Done).await;
            return;
        }
    };
    if max_attempts == 0 {
        send(
            &tx,
            ProxyEvent::Error("no API keys available in the pool".into()),
        )
        .await;
        send(&tx, ProxyEvent::Done).await;
        return;
    }

    let mut succeeded = false;
    let mut terminal_error_sent = false;
    let mut last_error: Option<String> = None;

    'attempts: for attempt in 1..=max_attempts {
        let preferred = state.last_key();
        let key = match state.pool.acquire(preferred.as_deref(), false) {
            Ok(key) => key,
            Err(PoolError::NoAvailableKeys) => {
                tracing::warn!(attempt, "key pool exhausted");
                last_error = Some("all API keys are rate limited or suspended".into());
                break;
            }
            Err(PoolError::Store(e)) => {
                tracing::error!(error = %e, "key store failure during acquire");
                last_error = Some("key pool unavailable".into());
                break;
            }
        };

        let tier = state.pool.tier_of(&key).ok().flatten();
        tracing::info!(
            attempt,
            max_attempts,
            key = %key_preview(&key),
            tier = tier.map(|t| t.as_str()).unwrap_or("unknown"),
            free_failures = state.pool.free_failures(),
            "requesting upstream stream"
        );

        let mut fragments = match state
            .upstream
            .stream_generate(&model, &key, &history, enable_search)
            .await
        {
            Ok(fragments) => fragments,
            Err(err) => {
                last_error = Some(note_attempt_failure(&state, &key, &err));
                continue;
            }
        };

        let mut buffer = String::new();
        loop {
            match fragments.next_fragment().await {
                Some(Ok(text)) => {
                    buffer.push_str(&text);
                    if tx.send(ProxyEvent::Text(text)).await.is_err() {
                        // Client went away. The acquisition row ages out on
                        // its own; neither success nor failure is recorded.
                        tracing::debug!(key = %key_preview(&key), "client disconnected mid-stream");
                        return;
                    }
                }
                Some(Err(err)) => {
                    let msg = note_attempt_failure(&state, &key, &err);
                    if !buffer.is_empty() {
                        send(&tx, ProxyEvent::Error(msg)).await;
                        terminal_error_sent = true;
                        break 'attempts;
                    }
                    last_error = Some(msg);
                    continue 'attempts;
                }
                None => {
                    if let Err(e) = state.pool.record_success(&key) {
                        tracing::error!(error = %e, "failed to record key success");
                    }
                    state.set_last_key(Some(key.clone()));
                    if !buffer.is_empty() {
                        state.history.append_model(buffer);
                    }
                    tracing::info!(key = %key_preview(&key), "upstream stream completed");
                    succeeded = true;
                    break 'attempts;
                }
            }
        }
    }

    if !succeeded && !terminal_error_sent {
        let msg = last_error.unwrap_or_else(|| "all key attempts failed".into());
        send(&tx, ProxyEvent::Error(msg)).await;
    }

    if let Ok(status) = state.pool.status() {
        tracing::info!(
            available = status.available_keys,
            suspended = status.suspended_keys,
            free_failures = status.free_key_consecutive_failures,
            threshold = status.max_free_key_failures,
            "key pool after stream"
        );
    }

    send(&tx, ProxyEvent::Done).await;
}

/// Record a failed attempt against the key and apply the matching
/// key-state transition. Returns the client-facing error message.
fn note_attempt_failure(state: &AppState, key: &str, err: &UpstreamError) -> String {
    let code = match err {
        UpstreamError::Http(status) => i64::from(*status),
        UpstreamError::Protocol(_) | UpstreamError::Transport(_) => 0,
    };
    if let Err(e) = state.pool.record_failure(key, code) {
        tracing::error!(error = %e, "failed to record key failure");
    }

    match err {
        UpstreamError::Http(status) => {
            tracing::warn!(key = %key_preview(key), status, "upstream rejected request");
            match failure_action(*status) {
                FailureAction::Invalidate => {
                    if let Err(e) = state.pool.invalidate(key) {
                        tracing::error!(error = %e, "failed to invalidate key");
                    }
                }
                FailureAction::Suspend => {
                    if let Err(e) = state.pool.suspend(key) {
                        tracing::error!(error = %e, "failed to suspend key");
                    }
                }
            }
            format!("upstream request failed with HTTP {status}")
        }
        UpstreamError::Protocol(detail) | UpstreamError::Transport(detail) => {
            tracing::warn!(key = %key_preview(key), detail = %detail, "upstream stream broke");
            if let Err(e) = state.pool.suspend(key) {
                tracing::error!(error = %e, "failed to suspend key");
            }
            "upstream stream failed before completing".into()
        }
    }
}

async fn send(tx: &Sender<ProxyEvent>, event: ProxyEvent) {
    let _ = tx.send(event).await;
}
