//! `filterhost` - run one legacy filter plugin out of process.
//!
//! Reads rasters in the filterhost interchange format, runs the plugin through
//! an architecture-matched helper, and writes the result.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;

use filterhost::{
    AbortSignal, FilterRequest, InvocationControl, OrchestratorConfig, PluginDescriptor, Raster,
    Rgb24, VersionInfo, logging, raster, run_filter,
};

#[derive(Parser, Debug)]
#[command(name = "filterhost")]
#[command(about = "Run legacy image filter plugins in a helper process")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a plugin filter over a raster
    Run(RunArgs),
    /// Print a raster file's header as JSON
    Inspect {
        /// Raster file to inspect
        raster: PathBuf,
    },
    /// Print version information as JSON
    Version,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Helper executable matching the plugin's architecture
    #[arg(long)]
    helper: PathBuf,

    /// Plugin file name
    #[arg(long)]
    plugin: String,

    /// Filter entry point inside the plugin
    #[arg(long)]
    entry: String,

    /// Source raster
    #[arg(long)]
    source: PathBuf,

    /// Where to write the filtered raster
    #[arg(long)]
    output: PathBuf,

    /// Single-channel selection mask, same size as the source
    #[arg(long)]
    mask: Option<PathBuf>,

    /// Seconds before the helper is stopped (0 = no limit)
    #[arg(long)]
    timeout: Option<u64>,

    /// Native handle of the window plugin dialogs should attach to
    #[arg(long, default_value_t = 0)]
    parent_window: u64,

    /// Primary color as RRGGBB
    #[arg(long, default_value_t = Rgb24::BLACK)]
    primary: Rgb24,

    /// Secondary color as RRGGBB
    #[arg(long, default_value_t = Rgb24::WHITE)]
    secondary: Rgb24,

    /// Reuse the last parameters without showing the plugin's dialog
    #[arg(long)]
    repeat: bool,

    /// Show the plugin's about box instead of filtering
    #[arg(long)]
    about: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_tracing();

    match cli.command {
        Command::Run(args) => run(args).await,
        Command::Inspect { raster } => inspect(&raster),
        Command::Version => print_json(&VersionInfo::new()),
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let mut config = OrchestratorConfig::new(&args.helper)
        .apply_env()
        .context("invalid environment configuration")?;
    if let Some(secs) = args.timeout {
        config.timeout = (secs > 0).then(|| Duration::from_secs(secs));
    }

    let source = load(&args.source, "source")?;
    let descriptor = PluginDescriptor::new(&args.plugin, &args.entry);
    let mut request = FilterRequest::new(descriptor, source)
        .with_parent_window(args.parent_window)
        .with_colors(args.primary, args.secondary)
        .with_repeat(args.repeat)
        .with_about_box(args.about);
    if let Some(mask) = &args.mask {
        request = request.with_mask(load(mask, "mask")?);
    }

    let abort = AbortSignal::new();
    let control = InvocationControl::new()
        .with_abort(abort.clone())
        .with_progress(|percent: u8| tracing::info!(percent, "Filter progress"));

    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, asking the filter to stop");
            abort.abort();
        }
    });
    let result = run_filter(&config, request, control).await;
    ctrl_c.abort();

    let output = match result {
        Ok(output) => output,
        Err(info) if info.is_user_visible() => bail!("{info}"),
        Err(_) => bail!("filter failed"),
    };
    if !output.post_processing.is_empty() {
        tracing::info!(flags = output.post_processing.bits(), "Applied post-processing");
    }

    raster::save(&args.output, &output.image)
        .with_context(|| format!("failed to write {}", args.output.display()))?;
    tracing::info!(
        output = %args.output.display(),
        width = output.image.width(),
        height = output.image.height(),
        "Filter finished"
    );
    Ok(())
}

fn load(path: &Path, what: &str) -> Result<Raster> {
    raster::load(path).with_context(|| format!("failed to read {what} raster {}", path.display()))
}

fn inspect(path: &Path) -> Result<()> {
    let header =
        raster::inspect(path).with_context(|| format!("failed to inspect {}", path.display()))?;
    print_json(&header)
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_valid() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn run_args_parse_with_defaults() {
        let cli = Cli::try_parse_from([
            "filterhost",
            "run",
            "--helper",
            "helper",
            "--plugin",
            "Blur.8bf",
            "--entry",
            "GaussianBlur",
            "--source",
            "in.fhr",
            "--output",
            "out.fhr",
        ])
        .unwrap();
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.plugin, "Blur.8bf");
        assert_eq!(args.parent_window, 0);
        assert_eq!(args.primary, Rgb24::BLACK);
        assert_eq!(args.secondary, Rgb24::WHITE);
        assert!(args.mask.is_none());
        assert!(!args.repeat);
    }

    #[test]
    fn run_args_parse_colors() {
        let cli = Cli::try_parse_from([
            "filterhost",
            "run",
            "--helper=h",
            "--plugin=p",
            "--entry=e",
            "--source=s",
            "--output=o",
            "--primary=FF8000",
            "--timeout=5",
            "--repeat",
        ])
        .unwrap();
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.primary, "FF8000".parse::<Rgb24>().unwrap());
        assert_eq!(args.timeout, Some(5));
        assert!(args.repeat);
    }

    #[test]
    fn bad_color_is_rejected() {
        let err = Cli::try_parse_from([
            "filterhost",
            "run",
            "--helper=h",
            "--plugin=p",
            "--entry=e",
            "--source=s",
            "--output=o",
            "--primary=nope",
        ]);
        assert!(err.is_err());
    }
}
