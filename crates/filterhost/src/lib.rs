//! filterhost: out-of-process host bridge for legacy image filter plugins.
//!
//! The controller stages inputs into a scratch directory, launches an
//! architecture-matched helper process, and answers its requests over a
//! length-prefixed channel until it exits. The helper side of the same
//! protocol lives in [`helper`] and [`client`].

pub mod blob;
pub mod bridge;
pub mod client;
pub mod control;
pub mod error;
pub mod helper;
pub mod logging;
pub mod orchestrator;
pub mod plugin;
pub mod postprocess;
pub mod raster;
pub mod scratch;
pub mod server;
pub mod settings;
pub mod store;
mod version;

pub use control::{AbortSignal, InvocationControl, ProgressObserver};
pub use error::ErrorInfo;
pub use helper::{FilterContext, HelperArgs, HelperError, HelperExit, PluginRunner, run_helper};
pub use orchestrator::{FilterOutput, FilterRequest, OrchestratorConfig, run_filter};
pub use plugin::{PluginDescriptor, PluginIdentity};
pub use postprocess::PostProcessingFlags;
pub use raster::{Dpi, PixelFormat, Raster};
pub use settings::{Rgb24, SessionSettings};
pub use store::ParameterStore;
pub use version::{FILTERHOST_VERSION, VersionInfo};
