//! Controller side of the command protocol.
//!
//! The server owns the channel listener for one invocation and walks an
//! explicit state machine:
//!
//! ```text
//! Listening --accept--> Dispatching --reply sent--> Listening
//!     |
//!     +--shutdown--> Closed
//! ```
//!
//! Each connection carries one request and one reply. All mutable session
//! state (progress, reported error, post-processing flags) lives in the
//! server task, so nothing here needs a lock.

use std::io;

use futures::{SinkExt, StreamExt};
use tokio_util::bytes::Bytes;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::{DEFAULT_MAX_FRAME_LENGTH, FrameCodec, FrameError};
use crate::bridge::pool::{BufferPool, PoolStats};
use crate::bridge::protocol::{ProtocolError, Request, abort_reply};
use crate::bridge::transport::{ChannelListener, ServerStream};
use crate::control::InvocationControl;
use crate::postprocess::PostProcessingFlags;

/// Read-only payloads served to the helper.
#[derive(Debug, Clone, Default)]
pub struct ServedData {
    pub descriptor: Bytes,
    pub settings: Bytes,
    pub exif: Bytes,
    pub xmp: Bytes,
    pub icc: Bytes,
}

/// What the helper told the controller during the session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionReport {
    pub error_message: Option<String>,
    pub post_processing: PostProcessingFlags,
    pub last_progress: Option<u8>,
    pub requests_served: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to accept helper connection: {0}")]
    Accept(#[source] io::Error),

    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),
}

impl ServerError {
    /// True when the helper went away mid-frame rather than sending
    /// something malformed. A dying helper leaves exactly this behind.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Self::Protocol(ProtocolError::Frame(
                FrameError::Truncated { .. } | FrameError::Io(_)
            ))
        )
    }
}

enum ServerState {
    Listening,
    Dispatching(ServerStream),
    Closed,
}

pub struct SessionServer {
    listener: ChannelListener,
    served: ServedData,
    control: InvocationControl,
    pool: BufferPool,
    max_frame_length: usize,
    report: SessionReport,
}

impl SessionServer {
    pub fn new(listener: ChannelListener, served: ServedData, control: InvocationControl) -> Self {
        Self {
            listener,
            served,
            control,
            pool: BufferPool::default(),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            report: SessionReport::default(),
        }
    }

    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.max_frame_length = max_frame_length;
        self
    }

    /// Serve requests until `shutdown` fires or the helper violates the
    /// protocol. A violation ends the session with an error; the caller is
    /// expected to terminate the helper.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<SessionReport, ServerError> {
        let channel = self.listener.id().clone();
        tracing::debug!(channel = %channel, "Session server listening");

        let mut state = ServerState::Listening;
        loop {
            state = match state {
                ServerState::Listening => tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => ServerState::Closed,
                    accepted = self.listener.accept() => {
                        ServerState::Dispatching(accepted.map_err(ServerError::Accept)?)
                    }
                },
                ServerState::Dispatching(stream) => {
                    self.serve_connection(stream, &shutdown).await?;
                    ServerState::Listening
                }
                ServerState::Closed => break,
            };
        }

        let PoolStats {
            acquisitions,
            reuses,
            ..
        } = self.pool.stats();
        tracing::debug!(
            channel = %channel,
            requests = self.report.requests_served,
            buffer_acquisitions = acquisitions,
            buffer_reuses = reuses,
            "Session server closed"
        );
        Ok(self.report)
    }

    async fn serve_connection(
        &mut self,
        stream: ServerStream,
        shutdown: &CancellationToken,
    ) -> Result<(), ServerError> {
        let mut framed = self.pool.framed(
            stream,
            FrameCodec::with_max_frame_length(self.max_frame_length),
        );
        let result = self.exchange(&mut framed, shutdown).await;
        self.pool.recycle(framed);
        result
    }

    async fn exchange(
        &mut self,
        framed: &mut Framed<ServerStream, FrameCodec>,
        shutdown: &CancellationToken,
    ) -> Result<(), ServerError> {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            frame = framed.next() => frame,
        };

        let payload = match frame {
            Some(frame) => frame.map_err(ProtocolError::from)?,
            None => {
                tracing::trace!("Helper closed connection without a request");
                return Ok(());
            }
        };

        let request = Request::decode(&payload)?;
        let command = request.command();
        let reply = self.dispatch(request);
        self.report.requests_served += 1;

        if let Err(e) = framed.send(reply).await {
            // The helper gave up on this call; it will notice on its side.
            tracing::warn!(command = %command, error = %e, "Failed to send reply");
        }
        Ok(())
    }

    fn dispatch(&mut self, request: Request) -> Bytes {
        tracing::debug!(command = %request.command(), "Dispatching request");
        match request {
            Request::AbortCheck => abort_reply(self.control.abort.is_aborted()),
            Request::ReportProgress { percent } => {
                self.report.last_progress = Some(percent);
                self.control.report_progress(percent);
                Bytes::new()
            }
            Request::GetPluginDescriptor => self.served.descriptor.clone(),
            Request::GetSessionSettings => self.served.settings.clone(),
            Request::SetErrorMessage { message } => {
                tracing::debug!(error_message = %message, "Helper reported an error");
                self.report.error_message = Some(message);
                Bytes::new()
            }
            Request::SetPostProcessingOptions { flags } => {
                self.report.post_processing = PostProcessingFlags::from_bits(flags);
                Bytes::new()
            }
            Request::GetExifMetadata => self.served.exif.clone(),
            Request::GetXmpMetadata => self.served.xmp.clone(),
            Request::GetIccProfile => self.served.icc.clone(),
        }
    }
}
