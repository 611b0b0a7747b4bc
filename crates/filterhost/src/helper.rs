//! Helper process runtime - runs inside the architecture-matched helper.
//!
//! The helper is started with two positional arguments (channel identifier,
//! parent window handle). It pulls its settings and plugin descriptor over the
//! channel, loads the staged inputs, hands them to a [`PluginRunner`], and
//! writes the result back to the scratch directory before exiting with a
//! [`HelperExit`] code.
//!
//! The parent side (staging, spawning, serving requests) is in
//! orchestrator.rs and server.rs.

use std::process::ExitCode;

use async_trait::async_trait;

use crate::blob::{
    self, BlobError, DescriptorRegistry, FilterParameters, PseudoResourceCollection,
};
use crate::bridge::protocol::ProtocolError;
use crate::bridge::transport::ChannelId;
use crate::client::HelperClient;
use crate::plugin::PluginDescriptor;
use crate::raster::{self, Raster, RasterError};
use crate::settings::SessionSettings;

pub const USAGE: &str = "usage: <helper> <channel-id> <parent-window-handle>";

/// Message reported when a filter stops because the controller asked it to.
pub const CANCELLED_MESSAGE: &str = "The filter was cancelled";

#[derive(Debug, thiserror::Error)]
pub enum HelperError {
    #[error("{0}")]
    Usage(String),

    #[error("bridge call failed: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("raster I/O failed: {0}")]
    Raster(#[from] RasterError),

    #[error(transparent)]
    Blob(#[from] BlobError),

    /// The filter itself failed; `message` is shown to the operator.
    #[error("{message}")]
    Filter { message: String },

    #[error("filter was cancelled")]
    Aborted,
}

impl HelperError {
    pub fn filter(message: impl Into<String>) -> Self {
        Self::Filter {
            message: message.into(),
        }
    }
}

/// Process exit codes. The controller treats every non-zero code as failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelperExit {
    Success,
    FilterError,
    Usage,
    BridgeFailure,
}

impl HelperExit {
    pub fn code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::FilterError => 1,
            Self::Usage => 2,
            Self::BridgeFailure => 3,
        }
    }
}

impl From<HelperExit> for ExitCode {
    fn from(exit: HelperExit) -> Self {
        ExitCode::from(exit.code())
    }
}

/// Parsed command line of a helper process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperArgs {
    pub channel: ChannelId,
    pub parent_window: u64,
}

impl HelperArgs {
    /// Parse the arguments after the program name. Both positionals are
    /// required and nothing else is accepted.
    pub fn parse<I, S>(args: I) -> Result<Self, HelperError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        let [channel, window] = args.as_slice() else {
            return Err(HelperError::Usage(format!(
                "expected 2 arguments, got {}\n{USAGE}",
                args.len()
            )));
        };

        let channel = ChannelId::parse(channel)
            .map_err(|e| HelperError::Usage(format!("{e}\n{USAGE}")))?;
        let parent_window = window.parse::<u64>().map_err(|_| {
            HelperError::Usage(format!(
                "parent window handle must be a decimal integer, got {window:?}\n{USAGE}"
            ))
        })?;
        Ok(Self {
            channel,
            parent_window,
        })
    }
}

/// Inputs and outputs of one filter run.
///
/// Runners may replace `parameters`, `pseudo_resources`, and `registry`; any
/// value left as `Some` is written back for the controller.
pub struct FilterContext {
    pub client: HelperClient,
    pub parent_window: u64,
    pub settings: SessionSettings,
    pub descriptor: PluginDescriptor,
    pub source: Raster,
    pub mask: Option<Raster>,
    pub parameters: Option<FilterParameters>,
    pub pseudo_resources: Option<PseudoResourceCollection>,
    pub registry: Option<DescriptorRegistry>,
}

impl FilterContext {
    /// Poll the controller and bail out if it asked us to stop.
    pub async fn check_abort(&self) -> Result<(), HelperError> {
        if self.client.abort_requested().await? {
            Err(HelperError::Aborted)
        } else {
            Ok(())
        }
    }

    pub async fn report_progress(&self, percent: u8) -> Result<(), HelperError> {
        Ok(self.client.report_progress(percent).await?)
    }
}

/// The plugin host proper. Given the staged inputs, produce a result raster
/// or fail with [`HelperError::Filter`].
#[async_trait]
pub trait PluginRunner: Send + Sync {
    async fn run(&self, ctx: &mut FilterContext) -> Result<Raster, HelperError>;
}

/// A connected helper that has fetched its settings and descriptor.
pub struct HelperSession {
    client: HelperClient,
    parent_window: u64,
    settings: SessionSettings,
    descriptor: PluginDescriptor,
}

impl HelperSession {
    pub async fn open(args: &HelperArgs) -> Result<Self, HelperError> {
        let client = HelperClient::new(args.channel.clone());
        let settings = client.session_settings().await?;
        let descriptor = client.plugin_descriptor().await?;
        tracing::debug!(
            channel = %args.channel,
            plugin = %descriptor.identity(),
            filter_case = ?settings.filter_case,
            "Helper session opened"
        );
        Ok(Self {
            client,
            parent_window: args.parent_window,
            settings,
            descriptor,
        })
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    /// Load inputs, run the filter, and store the outputs.
    pub async fn run(self, runner: &dyn PluginRunner) -> HelperExit {
        let mut ctx = match self.load_context() {
            Ok(ctx) => ctx,
            Err(e) => {
                tracing::error!(error = %e, "Failed to load staged inputs");
                return HelperExit::BridgeFailure;
            }
        };

        let outcome = runner.run(&mut ctx).await;
        let failure = match outcome {
            Ok(result) => match store_outputs(&ctx, &result) {
                Ok(()) => return HelperExit::Success,
                Err(e) => e,
            },
            Err(e) => e,
        };

        let message = match &failure {
            HelperError::Filter { message } if !message.trim().is_empty() => message.as_str(),
            HelperError::Filter { .. } => "The filter failed",
            HelperError::Aborted => CANCELLED_MESSAGE,
            other => {
                tracing::error!(error = %other, "Helper bridge failure");
                return HelperExit::BridgeFailure;
            }
        };

        tracing::debug!(error_message = message, "Reporting filter error");
        match ctx.client.set_error_message(message).await {
            Ok(()) => HelperExit::FilterError,
            Err(e) => {
                tracing::error!(error = %e, "Failed to report filter error");
                HelperExit::BridgeFailure
            }
        }
    }

    fn load_context(self) -> Result<FilterContext, HelperError> {
        let settings = self.settings;
        let source = raster::load(&settings.source_image_path)?;
        let mask = settings
            .selection_mask_path
            .as_deref()
            .map(raster::load)
            .transpose()?;
        let parameters = blob::read_optional_json(&settings.parameter_data_path)?;
        let pseudo_resources = blob::read_optional_json(&settings.pseudo_resources_path)?;
        let registry = blob::read_optional_json(&settings.descriptor_registry_path)?;

        Ok(FilterContext {
            client: self.client,
            parent_window: self.parent_window,
            settings,
            descriptor: self.descriptor,
            source,
            mask,
            parameters,
            pseudo_resources,
            registry,
        })
    }
}

fn store_outputs(ctx: &FilterContext, result: &Raster) -> Result<(), HelperError> {
    let settings = &ctx.settings;
    raster::save(&settings.destination_image_path, result)?;
    if let Some(parameters) = &ctx.parameters {
        blob::write_json(&settings.parameter_data_path, parameters)?;
    }
    if let Some(resources) = &ctx.pseudo_resources {
        blob::write_json(&settings.pseudo_resources_path, resources)?;
    }
    if let Some(registry) = &ctx.registry {
        blob::write_json(&settings.descriptor_registry_path, registry)?;
    }
    Ok(())
}

/// Open a session and run `runner` in it.
pub async fn run_helper(args: HelperArgs, runner: &dyn PluginRunner) -> HelperExit {
    match HelperSession::open(&args).await {
        Ok(session) => session.run(runner).await,
        Err(e) => {
            tracing::error!(channel = %args.channel, error = %e, "Failed to open helper session");
            HelperExit::BridgeFailure
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_two_positionals() {
        let args = HelperArgs::parse(["@filterhost-abc", "65538"]).unwrap();
        assert_eq!(args.channel.as_str(), "@filterhost-abc");
        assert_eq!(args.parent_window, 65538);
    }

    #[test]
    fn wrong_argument_count_is_usage_error() {
        for args in [vec![], vec!["@x"], vec!["@x", "1", "extra"]] {
            assert!(matches!(
                HelperArgs::parse(args),
                Err(HelperError::Usage(_))
            ));
        }
    }

    #[test]
    fn window_handle_must_be_decimal() {
        for window in ["0x10", "-1", "abc", ""] {
            let err = HelperArgs::parse(["@x", window]).unwrap_err();
            assert!(err.to_string().contains("decimal"), "{window}");
        }
    }

    #[test]
    fn exit_codes() {
        assert_eq!(HelperExit::Success.code(), 0);
        assert_eq!(HelperExit::FilterError.code(), 1);
        assert_eq!(HelperExit::Usage.code(), 2);
        assert_eq!(HelperExit::BridgeFailure.code(), 3);
    }
}
