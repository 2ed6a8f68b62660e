use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::provider::{LLMError, LLMStream, Result};
use crate::types::LLMChunk;

/// Wraps a provider stream with the cancellation checkpoints every consumer
/// needs: before a chunk is requested and right after the wait for it
/// resumes. A chunk that arrives after cancellation is discarded.
pub struct CancellableStream {
    stream: LLMStream,
    cancel_token: CancellationToken,
    finished: bool,
}

impl CancellableStream {
    pub fn new(stream: LLMStream, cancel_token: CancellationToken) -> Self {
        Self {
            stream,
            cancel_token,
            finished: false,
        }
    }

    /// `None` once the stream is exhausted; `Some(Err(Cancelled))` once the
    /// token has fired.
    pub async fn next_chunk(&mut self) -> Option<Result<LLMChunk>> {
        if self.finished {
            return None;
        }
        if self.cancel_token.is_cancelled() {
            log::debug!("Stream cancelled before requesting the next chunk");
            self.finished = true;
            return Some(Err(LLMError::Cancelled));
        }

        let next = self.stream.next().await;

        if self.cancel_token.is_cancelled() {
            log::debug!(
                "Stream cancelled while waiting; discarding {}",
                match &next {
                    Some(Ok(_)) => "chunk",
                    Some(Err(_)) => "error",
                    None => "end of stream",
                }
            );
            self.finished = true;
            return Some(Err(LLMError::Cancelled));
        }
        match next {
            None => {
                self.finished = true;
                None
            }
            Some(Err(error)) => {
                log::debug!("Stream ended with error: {}", error);
                self.finished = true;
                Some(Err(error))
            }
            Some(Ok(chunk)) => Some(Ok(chunk)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures::stream;
    use tokio::sync::Notify;

    use super::*;

    fn build_stream(items: Vec<Result<LLMChunk>>) -> LLMStream {
        Box::pin(stream::iter(items))
    }

    #[tokio::test]
    async fn yields_chunks_until_exhausted() {
        let mut reader = CancellableStream::new(
            build_stream(vec![Ok(LLMChunk::Token("hi".to_string())), Ok(LLMChunk::Done)]),
            CancellationToken::new(),
        );

        assert!(matches!(reader.next_chunk().await, Some(Ok(LLMChunk::Token(_)))));
        assert!(matches!(reader.next_chunk().await, Some(Ok(LLMChunk::Done))));
        assert!(reader.next_chunk().await.is_none());
    }

    #[tokio::test]
    async fn stream_error_ends_the_stream() {
        let mut reader = CancellableStream::new(
            build_stream(vec![
                Err(LLMError::Stream("reset".to_string())),
                Ok(LLMChunk::Token("never".to_string())),
            ]),
            CancellationToken::new(),
        );

        assert!(matches!(reader.next_chunk().await, Some(Err(LLMError::Stream(_)))));
        assert!(reader.next_chunk().await.is_none());
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits_before_request() {
        let token = CancellationToken::new();
        token.cancel();
        let mut reader = CancellableStream::new(
            build_stream(vec![Ok(LLMChunk::Token("hi".to_string()))]),
            token,
        );

        assert!(matches!(reader.next_chunk().await, Some(Err(LLMError::Cancelled))));
        assert!(reader.next_chunk().await.is_none());
    }

    #[tokio::test]
    async fn cancellation_during_blocked_chunk_discards_it() {
        let gate = Arc::new(Notify::new());
        let token = CancellationToken::new();
        let wait = Arc::clone(&gate);
        let blocked: LLMStream = Box::pin(async_stream::stream! {
            wait.notified().await;
            yield Ok::<_, LLMError>(LLMChunk::Token("late".to_string()));
        });
        let mut reader = CancellableStream::new(blocked, token.clone());

        let pending = tokio::spawn(async move { reader.next_chunk().await });
        tokio::task::yield_now().await;
        token.cancel();
        gate.notify_one();

        let outcome = pending.await.unwrap();
        assert!(matches!(outcome, Some(Err(LLMError::Cancelled))));
    }
}
