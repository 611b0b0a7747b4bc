//! Controller-side workflow for one filter invocation.
//!
//! ```text
//! Idle -> Staging -> Launched -> AwaitingExit -> Collecting -> Cleanup -> Idle
//! ```
//!
//! Inputs are staged into a private [`ScratchSession`], a fresh channel is
//! bound, and the helper is launched with the channel identifier and parent
//! window handle. While the helper runs, a [`SessionServer`] task answers its
//! requests. The scratch directory is removed on every path out.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::blob::{self, BlobError, DescriptorRegistry, FilterParameters, PseudoResourceCollection};
use crate::bridge::codec::DEFAULT_MAX_FRAME_LENGTH;
use crate::bridge::transport::{ChannelId, ChannelListener};
use crate::control::InvocationControl;
use crate::error::ErrorInfo;
use crate::plugin::PluginDescriptor;
use crate::postprocess::{self, PostProcessError, PostProcessingFlags};
use crate::raster::{self, PixelFormat, Raster, RasterError};
use crate::scratch::ScratchSession;
use crate::server::{ServedData, ServerError, SessionReport, SessionServer};
use crate::settings::{FilterCase, Rgb24, SessionSettings, UiScaling};
use crate::store::ParameterStore;

/// Time a helper gets to exit after SIGTERM before it is killed.
pub const DEFAULT_TERMINATION_GRACE: Duration = Duration::from_secs(2);

pub const ENV_TIMEOUT_SECS: &str = "FILTERHOST_TIMEOUT_SECS";
pub const ENV_SCRATCH_DIR: &str = "FILTERHOST_SCRATCH_DIR";
pub const ENV_MAX_FRAME_BYTES: &str = "FILTERHOST_MAX_FRAME_BYTES";

// ---------------------------------------------------------------------------
// Spawning
// ---------------------------------------------------------------------------

/// Everything needed to start one helper process.
#[derive(Debug, Clone)]
pub struct HelperLaunch {
    pub program: PathBuf,
    pub channel: ChannelId,
    pub parent_window: u64,
    pub env: Vec<(String, String)>,
}

impl HelperLaunch {
    /// Positional arguments: channel identifier, then parent window handle.
    pub fn args(&self) -> [String; 2] {
        [self.channel.to_string(), self.parent_window.to_string()]
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Extension point for different helper launch strategies.
pub trait HelperSpawner: Send + Sync {
    fn spawn(&self, launch: &HelperLaunch) -> Result<Child, SpawnError>;
}

/// Runs the helper as a plain child process. The child is killed if its
/// handle is dropped.
pub struct ProcessSpawner;

impl HelperSpawner for ProcessSpawner {
    fn spawn(&self, launch: &HelperLaunch) -> Result<Child, SpawnError> {
        let child = Command::new(&launch.program)
            .args(launch.args())
            .envs(launch.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
#[error("invalid value {value:?} for {var}")]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
}

pub struct OrchestratorConfig {
    pub helper_path: PathBuf,
    pub timeout: Option<Duration>,
    pub termination_grace: Duration,
    pub scratch_root: Option<PathBuf>,
    pub max_frame_length: usize,
    pub env: Vec<(String, String)>,
    pub spawner: Arc<dyn HelperSpawner>,
}

impl OrchestratorConfig {
    pub fn new(helper_path: impl Into<PathBuf>) -> Self {
        Self {
            helper_path: helper_path.into(),
            timeout: None,
            termination_grace: DEFAULT_TERMINATION_GRACE,
            scratch_root: None,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            env: Vec::new(),
            spawner: Arc::new(ProcessSpawner),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_termination_grace(mut self, grace: Duration) -> Self {
        self.termination_grace = grace;
        self
    }

    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scratch_root = Some(root.into());
        self
    }

    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.max_frame_length = max_frame_length;
        self
    }

    /// Add an environment variable for the helper process.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn HelperSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    /// Override settings from `FILTERHOST_*` environment variables.
    pub fn apply_env(self) -> Result<Self, ConfigError> {
        self.apply_env_from(|var| std::env::var(var).ok())
    }

    pub fn apply_env_from(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let invalid = |var: &'static str, value: &str| ConfigError {
            var,
            value: value.to_owned(),
        };

        if let Some(value) = lookup(ENV_TIMEOUT_SECS) {
            let secs: u64 = value
                .trim()
                .parse()
                .map_err(|_| invalid(ENV_TIMEOUT_SECS, &value))?;
            self.timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(value) = lookup(ENV_SCRATCH_DIR)
            && !value.is_empty()
        {
            self.scratch_root = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup(ENV_MAX_FRAME_BYTES) {
            let bytes: usize = value
                .trim()
                .parse()
                .map_err(|_| invalid(ENV_MAX_FRAME_BYTES, &value))?;
            if bytes == 0 {
                return Err(invalid(ENV_MAX_FRAME_BYTES, &value));
            }
            self.max_frame_length = bytes;
        }
        Ok(self)
    }
}

// ---------------------------------------------------------------------------
// Request / output
// ---------------------------------------------------------------------------

/// Document metadata served to the helper on request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentMetadata {
    pub exif: Vec<u8>,
    pub xmp: Vec<u8>,
    pub icc: Vec<u8>,
}

/// One filter invocation as the editor describes it.
#[derive(Debug, Clone)]
pub struct FilterRequest {
    pub descriptor: PluginDescriptor,
    pub source: Raster,
    pub mask: Option<Raster>,
    pub parent_window: u64,
    pub primary_color: Rgb24,
    pub secondary_color: Rgb24,
    pub repeat_without_prompting: bool,
    pub show_about_box: bool,
    pub parameters: Option<FilterParameters>,
    pub pseudo_resources: Option<PseudoResourceCollection>,
    pub registry: Option<DescriptorRegistry>,
    pub metadata: DocumentMetadata,
    pub ui: UiScaling,
    pub log_file: Option<PathBuf>,
}

impl FilterRequest {
    pub fn new(descriptor: PluginDescriptor, source: Raster) -> Self {
        Self {
            descriptor,
            source,
            mask: None,
            parent_window: 0,
            primary_color: Rgb24::BLACK,
            secondary_color: Rgb24::WHITE,
            repeat_without_prompting: false,
            show_about_box: false,
            parameters: None,
            pseudo_resources: None,
            registry: None,
            metadata: DocumentMetadata::default(),
            ui: UiScaling::default(),
            log_file: None,
        }
    }

    pub fn with_mask(mut self, mask: Raster) -> Self {
        self.mask = Some(mask);
        self
    }

    pub fn with_parent_window(mut self, handle: u64) -> Self {
        self.parent_window = handle;
        self
    }

    pub fn with_colors(mut self, primary: Rgb24, secondary: Rgb24) -> Self {
        self.primary_color = primary;
        self.secondary_color = secondary;
        self
    }

    pub fn with_repeat(mut self, repeat: bool) -> Self {
        self.repeat_without_prompting = repeat;
        self
    }

    pub fn with_about_box(mut self, show: bool) -> Self {
        self.show_about_box = show;
        self
    }

    pub fn with_parameters(mut self, parameters: FilterParameters) -> Self {
        self.parameters = Some(parameters);
        self
    }

    pub fn with_pseudo_resources(mut self, resources: PseudoResourceCollection) -> Self {
        self.pseudo_resources = Some(resources);
        self
    }

    pub fn with_registry(mut self, registry: DescriptorRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_metadata(mut self, metadata: DocumentMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_ui(mut self, ui: UiScaling) -> Self {
        self.ui = ui;
        self
    }

    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    /// Seed parameters and pseudo-resources from the plugin's last run.
    pub fn with_stored_state(mut self, store: &ParameterStore) -> Self {
        if let Some(state) = store.get(&self.descriptor.identity()) {
            if let Some(parameters) = &state.parameters {
                self.parameters = Some(parameters.clone());
            }
            if let Some(resources) = &state.pseudo_resources {
                self.pseudo_resources = Some(resources.clone());
            }
        }
        self
    }
}

/// A successful invocation.
#[derive(Debug, Clone)]
pub struct FilterOutput {
    pub image: Raster,
    pub parameters: Option<FilterParameters>,
    pub pseudo_resources: Option<PseudoResourceCollection>,
    pub registry: Option<DescriptorRegistry>,
    pub post_processing: PostProcessingFlags,
}

impl FilterOutput {
    /// Store what this run left behind for the next one.
    pub fn record_into(&self, store: &mut ParameterStore, descriptor: &PluginDescriptor) {
        store.record(
            descriptor.identity(),
            self.parameters.clone(),
            self.pseudo_resources.clone(),
        );
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum InvocationError {
    #[error("helper executable not found: {}", .0.display())]
    HelperNotFound(PathBuf),

    #[error("failed to create scratch directory: {0}")]
    Scratch(#[source] std::io::Error),

    #[error("selection mask must be an {expected:?} raster of {width}x{height}")]
    MaskMismatch {
        expected: PixelFormat,
        width: u32,
        height: u32,
    },

    #[error("failed to stage raster: {0}")]
    StageRaster(#[source] RasterError),

    #[error("failed to stage data: {0}")]
    StageBlob(#[source] BlobError),

    #[error("failed to serialize session settings: {0}")]
    Settings(#[from] serde_json::Error),

    #[error("failed to open helper channel: {0}")]
    Channel(#[source] std::io::Error),

    #[error("failed to launch helper: {0}")]
    Spawn(#[from] SpawnError),

    #[error("failed waiting for helper: {0}")]
    Wait(#[source] std::io::Error),

    #[error("helper timed out after {0:?}")]
    Timeout(Duration),

    #[error("bridge session failed: {0}")]
    Session(#[from] ServerError),

    #[error("{0}")]
    Reported(String),

    #[error("helper exited with code {0}")]
    ExitCode(i32),

    /// Killed by a signal, typically the operator or the timeout backstop.
    #[error("helper was terminated by signal {signal}")]
    Terminated { signal: i32 },

    #[error("helper exited abnormally ({0})")]
    AbnormalExit(ExitStatus),

    #[error("helper finished without producing a result")]
    NoResult,

    #[error("failed to read helper result: {0}")]
    Result(#[source] RasterError),

    #[error("failed to read back plugin data: {0}")]
    ReadBack(#[source] BlobError),

    #[error("failed to apply post-processing: {0}")]
    PostProcess(#[from] PostProcessError),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl From<InvocationError> for ErrorInfo {
    fn from(err: InvocationError) -> Self {
        match err {
            InvocationError::Reported(message) => ErrorInfo::new(message),
            InvocationError::HelperNotFound(path) => ErrorInfo::new("Filter helper not found")
                .with_details(format!("{} was not found", path.display())),
            exit @ (InvocationError::ExitCode(_) | InvocationError::AbnormalExit(_)) => {
                ErrorInfo::new(exit.to_string())
            }
            terminated @ InvocationError::Terminated { signal } => {
                ErrorInfo::new(terminated.to_string())
                    .with_details(format!("exit status {}", 128 + signal))
            }
            InvocationError::Timeout(limit) => {
                ErrorInfo::new("The filter took too long and was stopped")
                    .with_details(format!("time limit {}s", limit.as_secs_f64()))
            }
            session @ InvocationError::Session(_) => {
                ErrorInfo::new("The filter helper sent an invalid request")
                    .with_details(session.to_string())
            }
            other => ErrorInfo::new("The filter could not be run").with_details(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationState {
    Idle,
    Staging,
    Launched,
    AwaitingExit,
    Collecting,
    Cleanup,
}

struct StateTracker {
    state: InvocationState,
    started: Instant,
}

impl StateTracker {
    fn new() -> Self {
        Self {
            state: InvocationState::Idle,
            started: Instant::now(),
        }
    }

    fn advance(&mut self, next: InvocationState) {
        tracing::debug!(
            from = ?self.state,
            to = ?next,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "Invocation state change"
        );
        self.state = next;
    }
}

/// Staged file locations inside the scratch directory.
#[derive(Debug, Clone)]
struct StagedPaths {
    source: PathBuf,
    destination: PathBuf,
    mask: Option<PathBuf>,
    parameters: PathBuf,
    pseudo_resources: PathBuf,
    registry: PathBuf,
}

impl StagedPaths {
    fn allocate(scratch: &ScratchSession, has_mask: bool) -> Self {
        Self {
            source: scratch.unique_file("raster"),
            destination: scratch.unique_file("raster"),
            mask: has_mask.then(|| scratch.unique_file("raster")),
            parameters: scratch.unique_file("json"),
            pseudo_resources: scratch.unique_file("json"),
            registry: scratch.unique_file("json"),
        }
    }
}

type SessionResult = Result<SessionReport, ServerError>;

enum HelperOutcome {
    Exited(ExitStatus),
    TimedOut(Duration),
}

/// Run one filter invocation to completion.
///
/// Every failure, including a missing helper, staging I/O, protocol
/// violations, crashes, and timeouts, is reported as an [`ErrorInfo`].
pub async fn run_filter(
    config: &OrchestratorConfig,
    request: FilterRequest,
    control: InvocationControl,
) -> Result<FilterOutput, ErrorInfo> {
    let plugin = request.descriptor.identity();
    run_invocation(config, request, control).await.map_err(|e| {
        tracing::warn!(plugin = %plugin, error = %e, "Filter invocation failed");
        ErrorInfo::from(e)
    })
}

async fn run_invocation(
    config: &OrchestratorConfig,
    request: FilterRequest,
    control: InvocationControl,
) -> Result<FilterOutput, InvocationError> {
    if !config.helper_path.is_file() {
        return Err(InvocationError::HelperNotFound(config.helper_path.clone()));
    }

    let mut tracker = StateTracker::new();
    tracker.advance(InvocationState::Staging);
    let scratch =
        ScratchSession::create(config.scratch_root.as_deref()).map_err(InvocationError::Scratch)?;

    let outcome = drive(config, request, control, &scratch, &mut tracker).await;

    tracker.advance(InvocationState::Cleanup);
    if let Err(e) = scratch.close() {
        tracing::warn!(error = %e, "Failed to remove scratch directory");
    }
    tracker.advance(InvocationState::Idle);
    outcome
}

async fn drive(
    config: &OrchestratorConfig,
    request: FilterRequest,
    control: InvocationControl,
    scratch: &ScratchSession,
    tracker: &mut StateTracker,
) -> Result<FilterOutput, InvocationError> {
    let paths = StagedPaths::allocate(scratch, request.mask.is_some());
    let staging_paths = paths.clone();
    let (request, served) =
        tokio::task::spawn_blocking(move || stage(request, &staging_paths)).await??;

    let channel = ChannelId::generate();
    let listener = ChannelListener::bind(&channel).map_err(InvocationError::Channel)?;
    let shutdown = CancellationToken::new();
    // Stops the server on every early return below.
    let _stop_server = shutdown.clone().drop_guard();
    let server = SessionServer::new(listener, served, control)
        .with_max_frame_length(config.max_frame_length);
    let server_task = tokio::spawn(server.run(shutdown.clone()));

    let launch = HelperLaunch {
        program: config.helper_path.clone(),
        channel: channel.clone(),
        parent_window: request.parent_window,
        env: config.env.clone(),
    };
    let mut child = config.spawner.spawn(&launch)?;
    tracker.advance(InvocationState::Launched);
    tracing::info!(
        channel = %channel,
        pid = child.id(),
        plugin = %request.descriptor.identity(),
        "Helper launched"
    );

    tracker.advance(InvocationState::AwaitingExit);
    let (outcome, session) = await_exit(config, &mut child, server_task, &shutdown).await?;

    tracker.advance(InvocationState::Collecting);
    let status = match outcome {
        HelperOutcome::Exited(status) => status,
        HelperOutcome::TimedOut(limit) => {
            if let Err(e) = &session {
                tracing::debug!(error = %e, "Session ended abnormally after timeout");
            }
            return Err(InvocationError::Timeout(limit));
        }
    };
    let report = settle_session(session, &status)?;
    tracing::debug!(
        exit_code = status.code(),
        requests = report.requests_served,
        "Helper exited"
    );

    collect(status, report, request, paths).await
}

/// Write inputs to the scratch directory and build the payloads the server
/// will hand out.
fn stage(
    request: FilterRequest,
    paths: &StagedPaths,
) -> Result<(FilterRequest, ServedData), InvocationError> {
    if let (Some(mask), Some(mask_path)) = (&request.mask, &paths.mask) {
        if mask.format() != PixelFormat::Alpha8
            || mask.width() != request.source.width()
            || mask.height() != request.source.height()
        {
            return Err(InvocationError::MaskMismatch {
                expected: PixelFormat::Alpha8,
                width: request.source.width(),
                height: request.source.height(),
            });
        }
        raster::save(mask_path, mask).map_err(InvocationError::StageRaster)?;
    }
    raster::save(&paths.source, &request.source).map_err(InvocationError::StageRaster)?;

    if let Some(parameters) = &request.parameters {
        blob::write_json(&paths.parameters, parameters).map_err(InvocationError::StageBlob)?;
    }
    if let Some(resources) = &request.pseudo_resources {
        blob::write_json(&paths.pseudo_resources, resources).map_err(InvocationError::StageBlob)?;
    }
    if let Some(registry) = &request.registry {
        blob::write_json(&paths.registry, registry).map_err(InvocationError::StageBlob)?;
    }

    let dpi = request.source.dpi();
    let settings = SessionSettings {
        repeat_without_prompting: request.repeat_without_prompting,
        show_plugin_about_box: request.show_about_box,
        primary_color: request.primary_color,
        secondary_color: request.secondary_color,
        document_dpi_x: dpi.x,
        document_dpi_y: dpi.y,
        filter_case: FilterCase::for_selection(request.mask.is_some()),
        source_image_path: paths.source.clone(),
        destination_image_path: paths.destination.clone(),
        selection_mask_path: paths.mask.clone(),
        parameter_data_path: paths.parameters.clone(),
        pseudo_resources_path: paths.pseudo_resources.clone(),
        descriptor_registry_path: paths.registry.clone(),
        log_file_path: request.log_file.clone(),
        ui: request.ui,
    };

    let served = ServedData {
        descriptor: serde_json::to_vec(&request.descriptor)?.into(),
        settings: settings.to_json()?.into(),
        exif: Bytes::from(request.metadata.exif.clone()),
        xmp: Bytes::from(request.metadata.xmp.clone()),
        icc: Bytes::from(request.metadata.icc.clone()),
    };
    Ok((request, served))
}

/// Wait for the helper, enforcing the timeout and watching for a fatal
/// session error. Once the helper is gone the server is shut down and its
/// result returned alongside the exit outcome.
async fn await_exit(
    config: &OrchestratorConfig,
    child: &mut Child,
    mut server_task: JoinHandle<SessionResult>,
    shutdown: &CancellationToken,
) -> Result<(HelperOutcome, SessionResult), InvocationError> {
    let deadline = async {
        match config.timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    let outcome = tokio::select! {
        biased;
        status = child.wait() => HelperOutcome::Exited(status.map_err(InvocationError::Wait)?),
        _ = &mut deadline => {
            let limit = config.timeout.unwrap_or_default();
            tracing::warn!(timeout_secs = limit.as_secs_f64(), "Helper timed out, terminating");
            terminate(child, config.termination_grace).await;
            HelperOutcome::TimedOut(limit)
        }
        session = &mut server_task => {
            return session_ended_early(config, child, session?).await;
        }
    };

    shutdown.cancel();
    let session = server_task.await?;
    Ok((outcome, session))
}

/// The session server stopped while the helper was still running.
async fn session_ended_early(
    config: &OrchestratorConfig,
    child: &mut Child,
    session: SessionResult,
) -> Result<(HelperOutcome, SessionResult), InvocationError> {
    match session {
        // Dropped mid-frame: the helper is most likely exiting, so give its
        // status a chance to arrive.
        Err(e) if e.is_disconnect() => {
            if let Ok(status) = tokio::time::timeout(config.termination_grace, child.wait()).await {
                let status = status.map_err(InvocationError::Wait)?;
                return Ok((HelperOutcome::Exited(status), Err(e)));
            }
            kill_helper(child).await;
            Err(InvocationError::Session(e))
        }
        Err(e) => {
            kill_helper(child).await;
            Err(InvocationError::Session(e))
        }
        // Only ends cleanly when shut down, which has not happened yet.
        Ok(_) => {
            kill_helper(child).await;
            Err(InvocationError::Wait(std::io::Error::other(
                "session server stopped before the helper exited",
            )))
        }
    }
}

async fn kill_helper(child: &mut Child) {
    if let Err(e) = child.kill().await {
        tracing::warn!(error = %e, "Failed to kill helper");
    }
}

/// Ask the helper to exit, then kill it once the grace period runs out.
async fn terminate(child: &mut Child, grace: Duration) {
    if request_termination(child)
        && tokio::time::timeout(grace, child.wait()).await.is_ok()
    {
        return;
    }
    kill_helper(child).await;
}

#[cfg(unix)]
fn request_termination(child: &Child) -> bool {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return false;
    };
    match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!(pid, error = %e, "Failed to send SIGTERM");
            false
        }
    }
}

#[cfg(not(unix))]
fn request_termination(_child: &Child) -> bool {
    false
}

/// Describe an unsuccessful exit that came without a reported message.
fn exit_failure(status: ExitStatus) -> InvocationError {
    if let Some(code) = status.code() {
        return InvocationError::ExitCode(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return InvocationError::Terminated { signal };
        }
    }
    InvocationError::AbnormalExit(status)
}

/// Decide which session outcome survives once the helper's exit status is
/// known.
fn settle_session(
    session: Result<SessionReport, ServerError>,
    status: &ExitStatus,
) -> Result<SessionReport, InvocationError> {
    match session {
        Ok(report) => Ok(report),
        // A helper that died mid-request leaves a truncated frame behind;
        // its exit status is the more useful report.
        Err(e) if e.is_disconnect() && !status.success() => {
            tracing::debug!(error = %e, "Session ended abnormally after helper failure");
            Ok(SessionReport::default())
        }
        Err(e) => Err(e.into()),
    }
}

async fn collect(
    status: ExitStatus,
    report: SessionReport,
    request: FilterRequest,
    paths: StagedPaths,
) -> Result<FilterOutput, InvocationError> {
    let reported = report
        .error_message
        .filter(|message| !message.trim().is_empty());

    if !status.success() {
        return Err(match reported {
            Some(message) => InvocationError::Reported(message),
            None => exit_failure(status),
        });
    }
    if !paths.destination.exists() {
        return Err(match reported {
            Some(message) => InvocationError::Reported(message),
            None => InvocationError::NoResult,
        });
    }
    if let Some(message) = reported {
        tracing::warn!(error_message = %message, "Helper reported an error but produced a result");
    }

    let flags = report.post_processing;
    tokio::task::spawn_blocking(move || read_results(&request, &paths, flags)).await?
}

fn read_results(
    request: &FilterRequest,
    paths: &StagedPaths,
    flags: PostProcessingFlags,
) -> Result<FilterOutput, InvocationError> {
    let mut image = raster::load(&paths.destination).map_err(InvocationError::Result)?;
    postprocess::apply(flags, &mut image, &request.source, request.mask.as_ref())?;

    Ok(FilterOutput {
        image,
        parameters: read_back(&paths.parameters)?,
        pseudo_resources: read_back(&paths.pseudo_resources)?,
        registry: read_back(&paths.registry)?,
        post_processing: flags,
    })
}

fn read_back<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, InvocationError> {
    blob::read_optional_json(path).map_err(InvocationError::ReadBack)
}
