//! End-to-end invocations against the built-in diagnostic helper.

use std::path::Path;
use std::time::Duration;

use filterhost::blob::{Blob, FilterParameters};
use filterhost::helper::CANCELLED_MESSAGE;
use filterhost::{
    AbortSignal, ErrorInfo, FilterOutput, FilterRequest, InvocationControl, OrchestratorConfig,
    ParameterStore, PixelFormat, PluginDescriptor, PostProcessingFlags, Raster, run_filter,
};
use tempfile::TempDir;
use tokio::sync::mpsc;

const HELPER: &str = env!("CARGO_BIN_EXE_filterhost-builtin-helper");
const RED: [u8; 4] = [0, 0, 255, 255];

struct Fixture {
    scratch_root: TempDir,
}

impl Fixture {
    fn new() -> Self {
        Self {
            scratch_root: tempfile::tempdir().unwrap(),
        }
    }

    fn config(&self) -> OrchestratorConfig {
        OrchestratorConfig::new(HELPER).with_scratch_root(self.scratch_root.path())
    }

    async fn run(&self, entry_point: &str, source: Raster) -> Result<FilterOutput, ErrorInfo> {
        let request = FilterRequest::new(descriptor(entry_point), source);
        run_filter(&self.config(), request, InvocationControl::new()).await
    }

    fn assert_scratch_removed(&self) {
        assert_scratch_empty(self.scratch_root.path());
    }
}

fn descriptor(entry_point: &str) -> PluginDescriptor {
    PluginDescriptor::new("Builtin.8bf", entry_point).with_category("Diagnostics")
}

fn red() -> Raster {
    Raster::solid_bgra(4, 4, RED).unwrap()
}

fn assert_scratch_empty(root: &Path) {
    let leftovers: Vec<_> = std::fs::read_dir(root)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    assert!(leftovers.is_empty(), "scratch not cleaned up: {leftovers:?}");
}

#[tokio::test]
async fn identity_returns_source_and_cleans_up() {
    let fixture = Fixture::new();
    let source = red();

    let output = fixture.run("identity", source.clone()).await.unwrap();

    assert_eq!(output.image, source);
    assert!(output.parameters.is_none());
    assert!(output.post_processing.is_empty());
    fixture.assert_scratch_removed();
}

#[tokio::test]
async fn missing_helper_fails_before_staging() {
    let fixture = Fixture::new();
    let config = OrchestratorConfig::new(fixture.scratch_root.path().join("no-such-helper"))
        .with_scratch_root(fixture.scratch_root.path());
    let request = FilterRequest::new(descriptor("identity"), red());

    let err = run_filter(&config, request, InvocationControl::new())
        .await
        .unwrap_err();

    assert!(
        err.message.contains("not found") || err.details.contains("not found"),
        "{err:?}"
    );
    fixture.assert_scratch_removed();
}

#[tokio::test]
async fn reported_error_is_surfaced() {
    let fixture = Fixture::new();
    let err = fixture.run("fail:boom", red()).await.unwrap_err();
    assert_eq!(err.message, "boom");
    fixture.assert_scratch_removed();
}

#[tokio::test]
async fn progress_is_observed_in_order() {
    let fixture = Fixture::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let control = InvocationControl::new().with_progress(tx);
    let request = FilterRequest::new(descriptor("progress"), red());

    run_filter(&fixture.config(), request, control).await.unwrap();

    let mut seen = Vec::new();
    while let Ok(percent) = rx.try_recv() {
        seen.push(percent);
    }
    assert_eq!(seen, vec![50, 100]);
    fixture.assert_scratch_removed();
}

#[tokio::test]
async fn crash_reports_exit_code() {
    let fixture = Fixture::new();
    let err = fixture.run("exit:3", red()).await.unwrap_err();
    assert_eq!(err.message, "helper exited with code 3");
    fixture.assert_scratch_removed();
}

#[tokio::test]
async fn clean_exit_without_result_is_an_error() {
    let fixture = Fixture::new();
    let err = fixture.run("exit:0", red()).await.unwrap_err();
    assert!(err.is_user_visible());
    assert!(err.details.contains("without producing a result"), "{err:?}");
    fixture.assert_scratch_removed();
}

#[tokio::test]
async fn timeout_terminates_helper() {
    let fixture = Fixture::new();
    let config = fixture
        .config()
        .with_timeout(Duration::from_millis(300))
        .with_termination_grace(Duration::from_secs(1));
    let request = FilterRequest::new(descriptor("sleep:30000"), red());

    let started = std::time::Instant::now();
    let err = run_filter(&config, request, InvocationControl::new())
        .await
        .unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(err.message.contains("too long"), "{err:?}");
    fixture.assert_scratch_removed();
}

#[tokio::test]
async fn abort_is_seen_when_polled() {
    let fixture = Fixture::new();
    let abort = AbortSignal::new();
    abort.abort();
    let control = InvocationControl::new().with_abort(abort);
    let request = FilterRequest::new(descriptor("sleep:30000"), red());

    let err = run_filter(&fixture.config(), request, control)
        .await
        .unwrap_err();

    assert_eq!(err.message, CANCELLED_MESSAGE);
    fixture.assert_scratch_removed();
}

#[tokio::test]
async fn staging_failure_still_cleans_up() {
    let fixture = Fixture::new();
    let mask = Raster::new(2, 2, PixelFormat::Alpha8).unwrap();
    let request = FilterRequest::new(descriptor("identity"), red()).with_mask(mask);

    let err = run_filter(&fixture.config(), request, InvocationControl::new())
        .await
        .unwrap_err();

    assert!(err.details.contains("selection mask"), "{err:?}");
    fixture.assert_scratch_removed();
}

#[tokio::test]
async fn parameters_round_trip_through_store() {
    let fixture = Fixture::new();
    let mut store = ParameterStore::new();
    let plugin = descriptor("remember:radius=4");

    let request = FilterRequest::new(plugin.clone(), red());
    let output = run_filter(&fixture.config(), request, InvocationControl::new())
        .await
        .unwrap();
    assert_eq!(
        output.parameters,
        Some(FilterParameters {
            parameters: Some(Blob::from(&b"radius=4"[..])),
            plugin_data: None,
        })
    );

    output.record_into(&mut store, &plugin);
    let replay = FilterRequest::new(descriptor("identity"), red()).with_stored_state(&store);
    assert!(replay.parameters.is_none(), "stored state is per entry point");

    let replay = FilterRequest::new(plugin.clone(), red()).with_stored_state(&store);
    assert_eq!(replay.parameters, output.parameters);
    fixture.assert_scratch_removed();
}

#[tokio::test]
async fn staged_parameters_are_read_back_unchanged() {
    let fixture = Fixture::new();
    let parameters = FilterParameters {
        parameters: Some(Blob::from(vec![1, 2, 3])),
        plugin_data: Some(Blob::from(vec![4])),
    };
    let request = FilterRequest::new(descriptor("identity"), red()).with_parameters(parameters.clone());

    let output = run_filter(&fixture.config(), request, InvocationControl::new())
        .await
        .unwrap();

    assert_eq!(output.parameters, Some(parameters));
    fixture.assert_scratch_removed();
}

#[tokio::test]
async fn post_processing_clips_to_mask_and_restores_alpha() {
    let fixture = Fixture::new();
    let source = Raster::solid_bgra(2, 1, [10, 20, 30, 128]).unwrap();
    let mask = Raster::from_pixels(2, 1, PixelFormat::Alpha8, vec![0, 255]).unwrap();
    let flags = PostProcessingFlags::CLIP_TO_MASK | PostProcessingFlags::RESTORE_ALPHA;
    let entry = format!("postprocess:{}", flags.bits());
    let request = FilterRequest::new(descriptor(&entry), source).with_mask(mask);

    let output = run_filter(&fixture.config(), request, InvocationControl::new())
        .await
        .unwrap();

    assert_eq!(output.post_processing, flags);
    // Unselected pixel keeps the source; selected pixel is inverted with the
    // source alpha.
    assert_eq!(output.image.data(), &[10, 20, 30, 128, 245, 235, 225, 128]);
    fixture.assert_scratch_removed();
}

#[cfg(unix)]
#[tokio::test]
async fn killed_helper_reports_signal_and_cleans_up() {
    use std::sync::{Arc, Mutex};

    use filterhost::orchestrator::{HelperLaunch, HelperSpawner, ProcessSpawner, SpawnError};
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;
    use tokio::process::Child;

    /// Launches helpers normally and remembers the last pid.
    #[derive(Default)]
    struct RecordingSpawner {
        pid: Mutex<Option<u32>>,
    }

    impl RecordingSpawner {
        fn pid(&self) -> Option<u32> {
            *self.pid.lock().unwrap()
        }
    }

    impl HelperSpawner for RecordingSpawner {
        fn spawn(&self, launch: &HelperLaunch) -> Result<Child, SpawnError> {
            let child = ProcessSpawner.spawn(launch)?;
            *self.pid.lock().unwrap() = child.id();
            Ok(child)
        }
    }

    let fixture = Fixture::new();
    let spawner = Arc::new(RecordingSpawner::default());
    let config = fixture.config().with_spawner(spawner.clone());
    let request = FilterRequest::new(descriptor("sleep:30000"), red());

    let terminate = async {
        let pid = loop {
            match spawner.pid() {
                Some(pid) => break pid,
                None => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        };
        tokio::time::sleep(Duration::from_millis(500)).await;
        kill(Pid::from_raw(pid as i32), Signal::SIGTERM).unwrap();
    };
    let (result, ()) = tokio::join!(
        run_filter(&config, request, InvocationControl::new()),
        terminate
    );

    let err = result.unwrap_err();
    assert_eq!(err.message, "helper was terminated by signal 15");
    assert_eq!(err.details, "exit status 143");
    fixture.assert_scratch_removed();
}

#[tokio::test]
async fn about_box_run_leaves_image_unchanged() {
    let fixture = Fixture::new();
    let source = Raster::solid_bgra(2, 2, [10, 20, 30, 255]).unwrap();
    let request = FilterRequest::new(descriptor("invert"), source.clone()).with_about_box(true);

    let output = run_filter(&fixture.config(), request, InvocationControl::new())
        .await
        .unwrap();

    assert_eq!(output.image, source);
    fixture.assert_scratch_removed();
}
