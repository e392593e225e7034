//! Hands chunked replies to a channel's outbound adapter, one chunk at a
//! time, pacing successive sends so a burst of chunks doesn't trip a
//! channel's own rate limiting.

use std::time::Duration;

use moltis_channels::ChannelOutbound;

use crate::{Error, Result};

/// Default delay between successive chunk sends to the same chat.
pub const DEFAULT_PACING: Duration = Duration::from_millis(250);

/// Send `chunks` to `(account_id, chat_id)` in order via `outbound`, pacing
/// successive sends by `pacing`. Stops at the first error; chunks already
/// sent are not retried or rolled back.
pub async fn deliver_chunks(
    outbound: &dyn ChannelOutbound,
    account_id: &str,
    chat_id: &str,
    chunks: &[String],
    pacing: Duration,
) -> Result<()> {
    for (i, chunk) in chunks.iter().enumerate() {
        if i > 0 && !pacing.is_zero() {
            tokio::time::sleep(pacing).await;
        }
        outbound
            .send_text(account_id, chat_id, chunk)
            .await
            .map_err(|source| Error::Delivery {
                context: format!("chunk {} of {}", i + 1, chunks.len()),
                message: source.to_string(),
            })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use moltis_common::types::ReplyPayload;

    use super::*;

    struct RecordingOutbound {
        sent: Mutex<Vec<String>>,
        fail_at: Option<usize>,
    }

    #[async_trait]
    impl ChannelOutbound for RecordingOutbound {
        async fn send_text(&self, _account_id: &str, _to: &str, text: &str) -> anyhow::Result<()> {
            let mut sent = self.sent.lock().unwrap_or_else(|e| e.into_inner());
            if self.fail_at == Some(sent.len()) {
                anyhow::bail!("simulated send failure");
            }
            sent.push(text.to_string());
            Ok(())
        }

        async fn send_media(
            &self,
            _account_id: &str,
            _to: &str,
            _payload: &ReplyPayload,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn delivers_chunks_in_order() {
        let outbound = Arc::new(RecordingOutbound {
            sent: Mutex::new(Vec::new()),
            fail_at: None,
        });
        let chunks = vec!["a".to_string(), "b".to_string(), "c".to_string()];

        deliver_chunks(
            outbound.as_ref(),
            "acct",
            "chat",
            &chunks,
            Duration::ZERO,
        )
        .await
        .unwrap();

        assert_eq!(
            *outbound.sent.lock().unwrap_or_else(|e| e.into_inner()),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
    }

    #[tokio::test]
    async fn stops_at_first_error() {
        let outbound = Arc::new(RecordingOutbound {
            sent: Mutex::new(Vec::new()),
            fail_at: Some(1),
        });
        let chunks = vec!["a".to_string(), "b".to_string(), "c".to_string()];

        let err = deliver_chunks(outbound.as_ref(), "acct", "chat", &chunks, Duration::ZERO)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Delivery { .. }));
        assert_eq!(
            *outbound.sent.lock().unwrap_or_else(|e| e.into_inner()),
            vec!["a".to_string()]
        );
    }
}
