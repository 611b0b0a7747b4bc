//! Diagnostic helper with built-in filters instead of a real plugin.
//!
//! The descriptor's entry point picks the behaviour:
//!
//! - `identity`: copy the source
//! - `progress`: report 50 then 100, copy the source
//! - `invert`: invert colour channels, keep alpha
//! - `postprocess:<bits>`: invert, then request post-processing `<bits>`
//! - `fail:<message>`: report `<message>` and exit 1
//! - `exit:<code>`: exit with `<code>` without reporting anything
//! - `sleep:<ms>`: wait, polling for abort, then copy the source
//! - `remember:<text>`: store `<text>` as the parameter blob, copy the source
//!
//! When the session asks for the about box, every entry point logs it and
//! returns the source unchanged instead of filtering.

use std::process::ExitCode;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use filterhost::blob::{Blob, FilterParameters};
use filterhost::helper::HelperSession;
use filterhost::{
    FilterContext, HelperArgs, HelperError, HelperExit, PluginRunner, PostProcessingFlags, Raster,
    logging,
};

const ABORT_POLL_INTERVAL: Duration = Duration::from_millis(25);

struct BuiltinRunner;

#[async_trait]
impl PluginRunner for BuiltinRunner {
    async fn run(&self, ctx: &mut FilterContext) -> Result<Raster, HelperError> {
        let entry = ctx.descriptor.entry_point.clone();
        let (name, arg) = entry.split_once(':').unwrap_or((entry.as_str(), ""));
        if ctx.settings.show_plugin_about_box {
            tracing::info!(plugin = %ctx.descriptor.identity(), "About box requested, not filtering");
            return Ok(ctx.source.clone());
        }
        tracing::debug!(filter = name, arg, "Running built-in filter");

        match name {
            "identity" => Ok(ctx.source.clone()),
            "progress" => {
                ctx.report_progress(50).await?;
                ctx.report_progress(100).await?;
                Ok(ctx.source.clone())
            }
            "invert" => Ok(invert(&ctx.source)),
            "postprocess" => {
                let bits = arg
                    .parse::<u32>()
                    .map_err(|_| HelperError::filter(format!("bad flag word {arg:?}")))?;
                ctx.client
                    .set_post_processing(PostProcessingFlags::from_bits(bits))
                    .await?;
                Ok(invert(&ctx.source))
            }
            "fail" => Err(HelperError::filter(arg)),
            "exit" => {
                let code = arg
                    .parse::<i32>()
                    .map_err(|_| HelperError::filter(format!("bad exit code {arg:?}")))?;
                std::process::exit(code)
            }
            "sleep" => {
                let ms = arg
                    .parse::<u64>()
                    .map_err(|_| HelperError::filter(format!("bad duration {arg:?}")))?;
                let deadline = Instant::now() + Duration::from_millis(ms);
                while Instant::now() < deadline {
                    ctx.check_abort().await?;
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    tokio::time::sleep(remaining.min(ABORT_POLL_INTERVAL)).await;
                }
                Ok(ctx.source.clone())
            }
            "remember" => {
                ctx.parameters = Some(FilterParameters {
                    parameters: Some(Blob::from(arg.as_bytes())),
                    plugin_data: None,
                });
                Ok(ctx.source.clone())
            }
            other => Err(HelperError::filter(format!("unknown built-in filter {other:?}"))),
        }
    }
}

fn invert(source: &Raster) -> Raster {
    let mut result = source.clone();
    for pixel in result.data_mut().chunks_exact_mut(4) {
        for channel in &mut pixel[..3] {
            *channel = 255 - *channel;
        }
    }
    result
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = match HelperArgs::parse(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{e}");
            return HelperExit::Usage.into();
        }
    };

    let session = match HelperSession::open(&args).await {
        Ok(session) => session,
        Err(e) => {
            logging::init_tracing();
            tracing::error!(channel = %args.channel, error = %e, "Failed to open helper session");
            return HelperExit::BridgeFailure.into();
        }
    };

    match session.settings().log_file_path.clone() {
        Some(path) => {
            if let Err(e) = logging::init_tracing_to_file(&path) {
                tracing::warn!(path = %path.display(), error = %e, "Cannot open log file, using stderr");
            }
        }
        None => logging::init_tracing(),
    }

    session.run(&BuiltinRunner).await.into()
}
