//! Duplex channel between the controller and a helper process.
//!
//! Platform-specific endpoints:
//! - **Linux**: abstract namespace socket `@filterhost-<uuid>` (no filesystem entry)
//! - **Other Unix**: filesystem socket under the temp root, removed on drop
//! - **Windows**: named pipe `\\.\pipe\filterhost-<uuid>`
//!
//! The controller binds a [`ChannelListener`] before the helper is spawned; the
//! helper calls [`connect`] once per request.

use std::fmt;
use std::io;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Prefix shared by every channel name.
pub const CHANNEL_PREFIX: &str = "filterhost-";

#[cfg(unix)]
pub type ServerStream = tokio::net::UnixStream;
#[cfg(unix)]
pub type ClientStream = tokio::net::UnixStream;

#[cfg(windows)]
pub type ServerStream = tokio::net::windows::named_pipe::NamedPipeServer;
#[cfg(windows)]
pub type ClientStream = tokio::net::windows::named_pipe::NamedPipeClient;

/// Identifier of one channel, passed to the helper as its first argument.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    /// A fresh identifier for one invocation.
    pub fn generate() -> Self {
        Self(platform_name(&uuid::Uuid::new_v4().simple().to_string()))
    }

    pub fn parse(s: &str) -> Result<Self, InvalidChannelId> {
        if s.is_empty() || s.contains('\0') {
            return Err(InvalidChannelId(s.to_owned()));
        }
        Ok(Self(s.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for Linux abstract-namespace names.
    pub fn is_abstract(&self) -> bool {
        self.0.starts_with('@')
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ChannelId {
    type Err = InvalidChannelId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid channel identifier {0:?}")]
pub struct InvalidChannelId(String);

#[cfg(target_os = "linux")]
fn platform_name(unique: &str) -> String {
    format!("@{CHANNEL_PREFIX}{unique}")
}

#[cfg(all(unix, not(target_os = "linux")))]
fn platform_name(unique: &str) -> String {
    std::env::temp_dir()
        .join(format!("{CHANNEL_PREFIX}{unique}.sock"))
        .to_string_lossy()
        .into_owned()
}

#[cfg(windows)]
fn platform_name(unique: &str) -> String {
    format!(r"\\.\pipe\{CHANNEL_PREFIX}{unique}")
}

// ---------------------------------------------------------------------------
// Unix sockets
// ---------------------------------------------------------------------------

#[cfg(unix)]
fn socket_addr(id: &ChannelId) -> io::Result<std::os::unix::net::SocketAddr> {
    match id.as_str().strip_prefix('@') {
        Some(name) => abstract_addr(name),
        None => std::os::unix::net::SocketAddr::from_pathname(id.as_str()),
    }
}

#[cfg(target_os = "linux")]
fn abstract_addr(name: &str) -> io::Result<std::os::unix::net::SocketAddr> {
    use std::os::linux::net::SocketAddrExt;
    std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())
}

#[cfg(all(unix, not(target_os = "linux")))]
fn abstract_addr(_name: &str) -> io::Result<std::os::unix::net::SocketAddr> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "abstract socket names require Linux",
    ))
}

/// Controller-side listener for one channel.
#[cfg(unix)]
pub struct ChannelListener {
    id: ChannelId,
    listener: tokio::net::UnixListener,
}

#[cfg(unix)]
impl ChannelListener {
    /// Bind the endpoint named by `id`. Must be called inside a tokio runtime.
    pub fn bind(id: &ChannelId) -> io::Result<Self> {
        use std::os::unix::net::UnixListener as StdUnixListener;

        let addr = socket_addr(id)?;
        if !id.is_abstract() {
            // Stale socket from a crashed run.
            match std::fs::remove_file(id.as_str()) {
                Ok(()) => tracing::debug!(channel = %id, "Removed stale socket"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }

        let std_listener = StdUnixListener::bind_addr(&addr)?;
        std_listener.set_nonblocking(true)?;
        let listener = tokio::net::UnixListener::from_std(std_listener)?;

        tracing::trace!(channel = %id, abstract_name = id.is_abstract(), "Bound channel");
        Ok(Self {
            id: id.clone(),
            listener,
        })
    }

    pub async fn accept(&mut self) -> io::Result<ServerStream> {
        let (stream, _) = self.listener.accept().await?;
        Ok(stream)
    }

    pub fn id(&self) -> &ChannelId {
        &self.id
    }
}

#[cfg(unix)]
impl Drop for ChannelListener {
    fn drop(&mut self) {
        if self.id.is_abstract() {
            return;
        }
        if let Err(e) = std::fs::remove_file(self.id.as_str())
            && e.kind() != io::ErrorKind::NotFound
        {
            tracing::warn!(channel = %self.id, error = %e, "Failed to remove socket file");
        }
    }
}

/// Helper-side connect.
#[cfg(unix)]
pub async fn connect(id: &ChannelId) -> io::Result<ClientStream> {
    use std::os::unix::net::UnixStream as StdUnixStream;

    let addr = socket_addr(id)?;
    let stream = StdUnixStream::connect_addr(&addr)?;
    stream.set_nonblocking(true)?;
    tokio::net::UnixStream::from_std(stream)
}

// ---------------------------------------------------------------------------
// Windows named pipes
// ---------------------------------------------------------------------------

#[cfg(windows)]
const ERROR_PIPE_BUSY: i32 = 231;

/// Controller-side listener for one channel.
///
/// A named pipe instance serves a single client, so a fresh instance is
/// created as soon as the previous one is handed out.
#[cfg(windows)]
pub struct ChannelListener {
    id: ChannelId,
    next: tokio::net::windows::named_pipe::NamedPipeServer,
}

#[cfg(windows)]
impl ChannelListener {
    pub fn bind(id: &ChannelId) -> io::Result<Self> {
        use tokio::net::windows::named_pipe::ServerOptions;

        let next = ServerOptions::new()
            .first_pipe_instance(true)
            .create(id.as_str())?;
        tracing::trace!(channel = %id, "Created named pipe");
        Ok(Self {
            id: id.clone(),
            next,
        })
    }

    pub async fn accept(&mut self) -> io::Result<ServerStream> {
        use tokio::net::windows::named_pipe::ServerOptions;

        self.next.connect().await?;
        let fresh = ServerOptions::new().create(self.id.as_str())?;
        Ok(std::mem::replace(&mut self.next, fresh))
    }

    pub fn id(&self) -> &ChannelId {
        &self.id
    }
}

/// Helper-side connect. Retries while every pipe instance is busy.
#[cfg(windows)]
pub async fn connect(id: &ChannelId) -> io::Result<ClientStream> {
    use std::time::Duration;
    use tokio::net::windows::named_pipe::ClientOptions;

    loop {
        match ClientOptions::new().open(id.as_str()) {
            Ok(client) => return Ok(client),
            Err(e) if e.raw_os_error() == Some(ERROR_PIPE_BUSY) => {}
            Err(e) => return Err(e),
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
