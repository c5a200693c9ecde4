use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use tempfile::NamedTempFile;

use frame_pipeline::config::PipelineConfig;
use frame_pipeline::convert::{ConversionEngine, DemosaicMethod};
use frame_pipeline::pixel::{Orientation, PixelEncoding};
use frame_pipeline::source::SourceKind;
use frame_pipeline::storage::{ImageFormat, WriteLevel};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "PIPELINE_STORAGE_ROOT",
        "PIPELINE_NUM_WORKERS",
        "PIPELINE_WRITE_LEVEL",
    ] {
        std::env::remove_var(key);
    }
}

fn write_config(toml: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp config");
    file.write_all(toml.as_bytes()).expect("write config");
    file
}

const FULL: &str = r#"
[source]
kind = "synthetic"
device_id = "line3"
output = "inproc://raw"
encoding = "BayerGR8"
width = 320
height = 240
row_padding = 8
fps = 25.0
max_frames = 100

[adapter]
input = "inproc://raw"
output = "tcp://127.0.0.1:0"
engine = "software"
bayer_engine = "software"
demosaic = "noise_aware"
orientation = "bottom_up"
recv_timeout_ms = 250

[adapter.sdk]
num_threads = 2

[writer]
root = "/srv/frames"
recycle_bin = "trash"
level = "only_dst"
format = "png"
max_rotations = 3
max_images = 500
max_disk_usage_gb = 0.5
rotation_interval_secs = 60
converted_input = "inproc://converted"

[processor]
input = "inproc://converted"
num_workers = 4
blur_iterations = 2
lower = [0, 0, 120]
upper = [60, 60, 255]
"#;

#[test]
fn loads_every_section_from_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(FULL);
    let cfg = PipelineConfig::load(file.path()).expect("load config");

    let source = cfg.source.expect("source");
    assert_eq!(source.kind, SourceKind::Synthetic);
    assert_eq!(source.device_id, "line3");
    assert_eq!(source.encoding, PixelEncoding::BayerGr8);
    assert_eq!((source.width, source.height, source.row_padding), (320, 240, 8));
    assert_eq!(source.max_frames, Some(100));

    let adapter = cfg.adapter.expect("adapter");
    assert_eq!(adapter.adapter.bayer_engine, Some(ConversionEngine::Software));
    assert_eq!(adapter.adapter.demosaic, DemosaicMethod::NoiseAware);
    assert_eq!(adapter.adapter.orientation, Orientation::BottomUp);
    assert_eq!(adapter.adapter.recv_timeout.as_millis(), 250);
    assert_eq!(adapter.sdk.expect("sdk").num_threads, 2);

    let writer = cfg.writer.expect("writer");
    assert_eq!(writer.root, PathBuf::from("/srv/frames"));
    assert_eq!(writer.recycle_bin, PathBuf::from("/srv/frames/trash"));
    assert_eq!(writer.format, ImageFormat::Png);
    assert_eq!(writer.limits.max_retained_rotations, 3);
    assert_eq!(writer.limits.max_item_count, 500);
    assert_eq!(writer.limits.max_total_bytes, 512 * 1024 * 1024);
    assert_eq!(writer.limits.rotation_interval_secs, 60);

    let processor = cfg.processor.expect("processor");
    assert_eq!(processor.pool.num_workers, 4);
    assert_eq!(processor.blur_iterations, 2);
    assert_eq!(processor.lower, [0, 0, 120]);

    clear_env();
}

#[test]
fn environment_overrides_file_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(FULL);
    std::env::set_var("PIPELINE_STORAGE_ROOT", "/mnt/archive");
    std::env::set_var("PIPELINE_NUM_WORKERS", "9");
    std::env::set_var("PIPELINE_WRITE_LEVEL", "off");

    let cfg = PipelineConfig::load(file.path()).expect("load config");
    let writer = cfg.writer.expect("writer");
    assert_eq!(writer.root, PathBuf::from("/mnt/archive"));
    assert_eq!(writer.recycle_bin, PathBuf::from("/mnt/archive/trash"));
    assert_eq!(writer.level, WriteLevel::Off);
    assert_eq!(cfg.processor.expect("processor").pool.num_workers, 9);

    clear_env();
}

#[test]
fn invalid_env_override_is_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(FULL);
    std::env::set_var("PIPELINE_NUM_WORKERS", "many");
    assert!(PipelineConfig::load(file.path()).is_err());
    clear_env();

    std::env::set_var("PIPELINE_WRITE_LEVEL", "sometimes");
    assert!(PipelineConfig::load(file.path()).is_err());
    clear_env();
}

#[test]
fn env_level_needing_a_missing_stream_fails_validation() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(FULL);
    std::env::set_var("PIPELINE_WRITE_LEVEL", "only_src");
    let err = PipelineConfig::load(file.path()).unwrap_err();
    assert!(format!("{:#}", err).contains("raw_input"));

    clear_env();
}

#[test]
fn missing_file_and_unknown_keys_fail() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    assert!(PipelineConfig::load(std::path::Path::new("/nonexistent/pipeline.toml")).is_err());
    let file = write_config("[writer]\nmax_pictures = 3\n");
    assert!(PipelineConfig::load(file.path()).is_err());
}
