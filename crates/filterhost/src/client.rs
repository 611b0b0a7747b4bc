//! Helper side of the command protocol.

use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use tokio_util::bytes::Bytes;

use crate::bridge::codec::{DEFAULT_MAX_FRAME_LENGTH, FrameCodec, FrameError};
use crate::bridge::pool::BufferPool;
use crate::bridge::protocol::{ProtocolError, Request, decode_abort_reply, expect_empty_reply};
use crate::bridge::transport::{self, ChannelId};
use crate::plugin::PluginDescriptor;
use crate::postprocess::PostProcessingFlags;
use crate::settings::SessionSettings;

/// Calls into the controller. Each call opens a fresh connection, sends one
/// request, reads one reply, and closes.
pub struct HelperClient {
    channel: ChannelId,
    max_frame_length: usize,
    pool: BufferPool,
}

impl HelperClient {
    pub fn new(channel: ChannelId) -> Self {
        Self {
            channel,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            pool: BufferPool::new(2, 256 * 1024),
        }
    }

    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.max_frame_length = max_frame_length;
        self
    }

    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    async fn call(&self, request: Request) -> Result<Bytes, ProtocolError> {
        let command = request.command();
        let stream = transport::connect(&self.channel)
            .await
            .map_err(FrameError::Io)?;
        let mut framed = self
            .pool
            .framed(stream, FrameCodec::with_max_frame_length(self.max_frame_length));

        let result: Result<Bytes, ProtocolError> = async {
            framed.send(request.encode()).await?;
            match framed.next().await {
                Some(reply) => Ok(reply?),
                None => Err(ProtocolError::NoReply(command)),
            }
        }
        .await;

        self.pool.recycle(framed);
        tracing::trace!(command = %command, ok = result.is_ok(), "Bridge call finished");
        result
    }

    async fn call_json<T: DeserializeOwned>(&self, request: Request) -> Result<T, ProtocolError> {
        let command = request.command();
        let reply = self.call(request).await?;
        serde_json::from_slice(&reply).map_err(|e| {
            tracing::debug!(command = %command, error = %e, "Reply is not valid JSON");
            ProtocolError::MalformedReply {
                command,
                reason: "invalid JSON document",
            }
        })
    }

    async fn call_void(&self, request: Request) -> Result<(), ProtocolError> {
        let command = request.command();
        let reply = self.call(request).await?;
        expect_empty_reply(command, &reply)
    }

    /// Poll the controller's abort flag.
    pub async fn abort_requested(&self) -> Result<bool, ProtocolError> {
        let reply = self.call(Request::AbortCheck).await?;
        decode_abort_reply(&reply)
    }

    pub async fn report_progress(&self, percent: u8) -> Result<(), ProtocolError> {
        self.call_void(Request::ReportProgress { percent }).await
    }

    pub async fn plugin_descriptor(&self) -> Result<PluginDescriptor, ProtocolError> {
        self.call_json(Request::GetPluginDescriptor).await
    }

    pub async fn session_settings(&self) -> Result<SessionSettings, ProtocolError> {
        self.call_json(Request::GetSessionSettings).await
    }

    pub async fn set_error_message(&self, message: &str) -> Result<(), ProtocolError> {
        self.call_void(Request::SetErrorMessage {
            message: message.to_owned(),
        })
        .await
    }

    pub async fn set_post_processing(
        &self,
        flags: PostProcessingFlags,
    ) -> Result<(), ProtocolError> {
        self.call_void(Request::post_processing(flags)).await
    }

    pub async fn exif_metadata(&self) -> Result<Bytes, ProtocolError> {
        self.call(Request::GetExifMetadata).await
    }

    pub async fn xmp_metadata(&self) -> Result<Bytes, ProtocolError> {
        self.call(Request::GetXmpMetadata).await
    }

    pub async fn icc_profile(&self) -> Result<Bytes, ProtocolError> {
        self.call(Request::GetIccProfile).await
    }
}
