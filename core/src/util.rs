use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Make a CancellationToken that is fulfilled when SIGINT occurs.
pub fn cancel_on_sigint() -> CancellationToken {
    let token = CancellationToken::new();

    tokio::spawn({
        let token = token.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                debug!("Keyboard interrupt");
                token.cancel();
            }
        }
    });

    token
}

/// Truncates `text` to at most `max_bytes`, cutting on a char boundary and
/// noting how much was dropped.
pub fn truncate_for_display(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!(
        "{}\n[... {} bytes truncated]",
        &text[..end],
        text.len() - end
    )
}
