pub mod line;

use async_trait::async_trait;

use crate::error::ChannelError;

pub use line::LineChannel;

/// Outbound side of the chat platform: replies and media downloads.
#[async_trait]
pub trait MessagingChannel: Send + Sync {
    /// Channel name (e.g., "line").
    fn name(&self) -> &str;

    /// Answer an inbound event through its reply handle.
    async fn reply(&self, reply_token: &str, text: &str) -> Result<(), ChannelError>;

    /// Download the binary content attached to a message.
    async fn fetch_content(&self, message_id: &str) -> Result<Vec<u8>, ChannelError>;
}
