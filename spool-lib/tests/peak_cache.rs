mod common;

use std::fs::{self, File};
use std::path::Path;
use std::time::{Duration, Instant, SystemTime};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use spool_lib::peaks::{peak_file_path, PeakOrigin, RetryBackoff};
use spool_lib::{PeakCache, PeakCacheConfig};

use common::{init_logger, write_wav};

fn step_source(path: &Path) {
    let samples: Vec<f32> = (0..1000).map(|i| if i < 500 { 1.0 } else { -1.0 }).collect();
    write_wav(path, 1, 48_000, &samples);
}

fn record_at(bytes: &[u8], index: usize) -> (f32, f32) {
    let at = 4 + index * 8;
    let min = f32::from_le_bytes(bytes[at..at + 4].try_into().expect("min"));
    let max = f32::from_le_bytes(bytes[at + 4..at + 8].try_into().expect("max"));
    (min, max)
}

fn set_mtime(path: &Path, time: SystemTime) {
    File::options()
        .write(true)
        .open(path)
        .expect("open for mtime")
        .set_modified(time)
        .expect("set mtime");
}

#[test]
fn step_signal_builds_four_records() {
    init_logger();
    let dir = tempfile::tempdir().expect("tempdir");
    let source = dir.path().join("step.wav");
    step_source(&source);

    let cache = PeakCache::new(PeakCacheConfig::default());
    cache.ensure_built(&source, 256).expect("build");

    let bytes = fs::read(peak_file_path(&source, 256)).expect("peak file");
    assert_eq!(bytes.len(), 4 + 4 * 8);
    assert_eq!(i32::from_le_bytes(bytes[0..4].try_into().expect("header")), 256);
    assert_eq!(record_at(&bytes, 0), (1.0, 1.0));
    // Frames 256..512 contain the step at frame 500.
    assert_eq!(record_at(&bytes, 1), (-1.0, 1.0));
    assert_eq!(record_at(&bytes, 2), (-1.0, -1.0));
    assert_eq!(record_at(&bytes, 3), (-1.0, -1.0));

    let read = cache.read(&source, 0, 1000, 256).expect("read");
    assert_eq!(read.origin, PeakOrigin::Cache(256));
    assert_eq!(read.len(), 4);
    assert!(!read.is_short());
    assert_eq!(read.get(1, 0).map(|p| (p.min, p.max)), Some((-1.0, 1.0)));
}

#[test]
fn every_level_contains_the_raw_samples() {
    init_logger();
    let dir = tempfile::tempdir().expect("tempdir");
    let source = dir.path().join("noise.wav");
    let frames = 5000;
    let mut rng = StdRng::seed_from_u64(7);
    let samples: Vec<f32> = (0..frames * 2).map(|_| rng.gen_range(-1.0_f32..1.0)).collect();
    write_wav(&source, 2, 44_100, &samples);

    let cache = PeakCache::new(PeakCacheConfig {
        cache_levels: 4,
        ..PeakCacheConfig::default()
    });
    cache.ensure_all_levels(&source).expect("levels");

    for target in [256_u32, 512, 700, 1000, 2048] {
        let read = cache.read(&source, 0, frames as u64, target).expect("read");
        assert!(matches!(read.origin, PeakOrigin::Cache(_)), "target {}", target);
        assert_eq!(read.channels, 2);
        assert_eq!(read.len(), (frames as usize).div_ceil(target as usize));

        for index in 0..read.len() {
            let from = index * target as usize;
            let to = (from + target as usize).min(frames);
            for channel in 0..2 {
                let peak = read.get(index, channel).expect("record");
                for frame in from..to {
                    let sample = samples[frame * 2 + channel];
                    assert!(
                        peak.min <= sample && sample <= peak.max,
                        "target {} record {} channel {}: {} outside [{}, {}]",
                        target,
                        index,
                        channel,
                        sample,
                        peak.min,
                        peak.max
                    );
                }
            }
        }
    }
}

#[test]
fn rebuilding_an_unchanged_source_is_byte_identical() {
    init_logger();
    let dir = tempfile::tempdir().expect("tempdir");
    let source = dir.path().join("step.wav");
    step_source(&source);
    let cache = PeakCache::new(PeakCacheConfig::default());
    let peak_path = peak_file_path(&source, 512);

    cache.ensure_built(&source, 512).expect("first build");
    let first = fs::read(&peak_path).expect("first");

    set_mtime(&peak_path, SystemTime::now() - Duration::from_secs(60));
    set_mtime(&source, SystemTime::now() - Duration::from_secs(30));
    assert!(!cache.current(&source, 512));
    cache.ensure_built(&source, 512).expect("second build");
    let second = fs::read(&peak_path).expect("second");

    assert_eq!(first, second);
}

#[test]
fn newer_source_makes_peaks_stale() {
    init_logger();
    let dir = tempfile::tempdir().expect("tempdir");
    let source = dir.path().join("step.wav");
    step_source(&source);
    let cache = PeakCache::new(PeakCacheConfig::default());
    let peak_path = peak_file_path(&source, 256);
    cache.ensure_built(&source, 256).expect("build");
    assert!(cache.current(&source, 256));

    let now = SystemTime::now();
    set_mtime(&peak_path, now - Duration::from_secs(20));
    set_mtime(&source, now - Duration::from_secs(10));
    assert!(!cache.current(&source, 256));

    cache.ensure_built(&source, 256).expect("rebuild");
    assert!(cache.current(&source, 256));
    let rebuilt = fs::metadata(&peak_path)
        .and_then(|meta| meta.modified())
        .expect("mtime");
    assert!(rebuilt >= now - Duration::from_secs(10));
}

#[test]
fn fine_requests_are_served_from_the_source() {
    init_logger();
    let dir = tempfile::tempdir().expect("tempdir");
    let source = dir.path().join("step.wav");
    step_source(&source);
    let cache = PeakCache::new(PeakCacheConfig::default());

    let read = cache.read(&source, 0, 1000, 64).expect("read");
    assert_eq!(read.origin, PeakOrigin::Source);
    assert_eq!(read.len(), 16);
    assert_eq!(read.get(7, 0).map(|p| (p.min, p.max)), Some((-1.0, 1.0)));
    assert!(!peak_file_path(&source, 64).exists());
}

#[test]
fn missing_level_falls_back_and_builds_in_background() {
    init_logger();
    let dir = tempfile::tempdir().expect("tempdir");
    let source = dir.path().join("step.wav");
    step_source(&source);
    let cache = PeakCache::new(PeakCacheConfig::default());

    let read = cache.read(&source, 0, 1000, 512).expect("read");
    assert_eq!(read.origin, PeakOrigin::Source);
    assert_eq!(read.len(), 2);

    let deadline = Instant::now() + Duration::from_secs(10);
    while !cache.current(&source, 256) {
        assert!(Instant::now() < deadline, "background build never finished");
        std::thread::sleep(Duration::from_millis(10));
    }
    let read = cache
        .read_with_retry(&source, 0, 1000, 512, &RetryBackoff::default())
        .expect("read");
    assert_eq!(read.origin, PeakOrigin::Cache(256));
    assert_eq!(read.len(), 2);
    assert_eq!(read.get(0, 0).map(|p| (p.min, p.max)), Some((-1.0, 1.0)));
}

#[test]
fn streamed_peaks_are_readable_but_not_current() {
    init_logger();
    let dir = tempfile::tempdir().expect("tempdir");
    let source = dir.path().join("take.wav");
    let samples: Vec<f32> = (0..600).map(|i| i as f32 / 600.0).collect();
    write_wav(&source, 1, 48_000, &samples);
    let cache = PeakCache::new(PeakCacheConfig::default());

    let mut streamer = cache.streamer(&source, 1).expect("streamer");
    streamer.write(&samples).expect("write");
    assert!(!cache.current(&source, 256));

    let partial = cache.read(&source, 0, 512, 256).expect("read");
    assert_eq!(partial.origin, PeakOrigin::Cache(256));
    assert_eq!(partial.len(), 2);
    assert_eq!(partial.get(1, 0).map(|p| p.min), Some(256.0 / 600.0));

    streamer.finish().expect("finish");
    assert!(cache.current(&source, 256));
    let full = cache.read(&source, 0, 600, 256).expect("read");
    assert_eq!(full.len(), 3);
    assert_eq!(full.get(2, 0).map(|p| p.max), Some(599.0 / 600.0));
}

#[test]
fn range_past_the_end_of_the_source_is_complete() {
    init_logger();
    let dir = tempfile::tempdir().expect("tempdir");
    let source = dir.path().join("step.wav");
    step_source(&source);
    let cache = PeakCache::new(PeakCacheConfig::default());
    cache.ensure_built(&source, 256).expect("build");

    let read = cache.read(&source, 0, 2000, 256).expect("read");
    assert_eq!(read.len(), 4);
    assert_eq!(read.requested, 4);
    assert!(!read.is_short());

    // A complete result is returned without waiting out the backoff.
    let backoff = RetryBackoff {
        initial: Duration::from_secs(5),
        max_delay: Duration::from_secs(5),
        max_attempts: 1,
        ..RetryBackoff::default()
    };
    let began = Instant::now();
    let read = cache
        .read_with_retry(&source, 0, 2000, 256, &backoff)
        .expect("read with retry");
    assert!(!read.is_short());
    assert!(began.elapsed() < Duration::from_secs(2));
}
