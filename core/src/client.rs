use async_trait::async_trait;
use futures::StreamExt;

use crate::client_common::LlmResponse;
use crate::client_common::Prompt;
use crate::client_common::ResponseEvent;
use crate::client_common::ResponseStream;
use crate::error::LlmError;

/// The model seam. Provider wire formats live behind implementations of
/// this trait.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Starts one model call. The stream ends with `ResponseEvent::Completed`
    /// on success; ending without it is treated as a failure by the caller.
    async fn stream(&self, prompt: &Prompt) -> Result<ResponseStream, LlmError>;

    /// Non-streaming form: drains `stream` and returns the completed response.
    async fn complete(&self, prompt: &Prompt) -> Result<LlmResponse, LlmError> {
        let mut stream = self.stream(prompt).await?;
        while let Some(event) = stream.next().await {
            if let ResponseEvent::Completed(response) = event? {
                return Ok(response);
            }
        }
        Err(LlmError::network("stream closed before response.completed"))
    }
}
