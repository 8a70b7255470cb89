use std::env;
use std::f32::consts::TAU;
use std::path::PathBuf;

use log::{error, info};
use spool_lib::{EngineConfig, PeakCache, PeakCacheConfig};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = env::args().skip(1);
    let Some(cmd) = args.next() else {
        print_help();
        return;
    };

    match cmd.as_str() {
        "tone" => tone_cmd(args.collect()),
        "peaks" => peaks_cmd(args.collect()),
        "-h" | "--help" => print_help(),
        _ => {
            eprintln!("Unknown command: {}", cmd);
            print_help();
        }
    }
}

fn parse_value<T: std::str::FromStr>(flag: &str, value: Option<String>) -> Option<T> {
    let Some(value) = value else {
        eprintln!("{} requires a value", flag);
        return None;
    };
    match value.parse::<T>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            eprintln!("Invalid {} value: {}", flag, value);
            None
        }
    }
}

fn tone_cmd(args: Vec<String>) {
    let mut out_path: Option<PathBuf> = None;
    let mut freq = 440.0_f32;
    let mut seconds = 2.0_f32;
    let mut sample_rate = 48_000_u32;
    let mut channels = 2_u16;
    let mut amplitude = 0.5_f32;

    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--out" => match iter.next() {
                Some(path) => out_path = Some(PathBuf::from(path)),
                None => {
                    eprintln!("--out requires a path");
                    return;
                }
            },
            "--freq" => match parse_value(&arg, iter.next()) {
                Some(value) => freq = value,
                None => return,
            },
            "--seconds" => match parse_value(&arg, iter.next()) {
                Some(value) => seconds = value,
                None => return,
            },
            "--rate" => match parse_value(&arg, iter.next()) {
                Some(value) => sample_rate = value,
                None => return,
            },
            "--channels" => match parse_value(&arg, iter.next()) {
                Some(value) => channels = value,
                None => return,
            },
            "--amp" => match parse_value(&arg, iter.next()) {
                Some(value) => amplitude = value,
                None => return,
            },
            "-h" | "--help" => {
                print_tone_help();
                return;
            }
            _ => {
                eprintln!("Unknown tone arg: {}", arg);
                print_tone_help();
                return;
            }
        }
    }

    let Some(path) = out_path else {
        eprintln!("--out is required");
        print_tone_help();
        return;
    };
    if channels == 0 || sample_rate == 0 {
        eprintln!("--channels and --rate must be greater than zero");
        return;
    }

    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = match hound::WavWriter::create(&path, spec) {
        Ok(writer) => writer,
        Err(err) => {
            error!("failed to create {}: {}", path.display(), err);
            return;
        }
    };

    let frames = (seconds.max(0.0) * sample_rate as f32) as u64;
    for frame in 0..frames {
        let phase = TAU * freq * frame as f32 / sample_rate as f32;
        let sample = amplitude * phase.sin();
        for _ in 0..channels {
            if let Err(err) = writer.write_sample(sample) {
                error!("failed to write {}: {}", path.display(), err);
                return;
            }
        }
    }
    match writer.finalize() {
        Ok(()) => info!("wrote {} ({} frames)", path.display(), frames),
        Err(err) => error!("failed to finalize {}: {}", path.display(), err),
    }
}

fn peaks_cmd(args: Vec<String>) {
    let mut sources: Vec<PathBuf> = Vec::new();
    let mut config_path: Option<PathBuf> = None;
    let mut chunksize: Option<u32> = None;

    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => match iter.next() {
                Some(path) => config_path = Some(PathBuf::from(path)),
                None => {
                    eprintln!("--config requires a path");
                    return;
                }
            },
            "--chunksize" => match parse_value(&arg, iter.next()) {
                Some(value) => chunksize = Some(value),
                None => return,
            },
            "-h" | "--help" => {
                print_peaks_help();
                return;
            }
            _ if arg.starts_with("--") => {
                eprintln!("Unknown peaks arg: {}", arg);
                print_peaks_help();
                return;
            }
            _ => sources.push(PathBuf::from(arg)),
        }
    }

    if sources.is_empty() {
        eprintln!("No source files given");
        print_peaks_help();
        return;
    }

    let peaks_config: PeakCacheConfig = match config_path {
        Some(path) => match EngineConfig::from_json_file(&path) {
            Ok(config) => config.peaks,
            Err(err) => {
                error!("failed to load {}: {}", path.display(), err);
                return;
            }
        },
        None => PeakCacheConfig::default(),
    };
    let cache = PeakCache::new(peaks_config);
    let failed = build_peaks(&cache, &sources, chunksize);
    if failed > 0 {
        error!("{} of {} sources failed", failed, sources.len());
    }
}

/// Build peaks for every source, one level or all of them. Returns the number
/// of sources that failed.
fn build_peaks(cache: &PeakCache, sources: &[PathBuf], chunksize: Option<u32>) -> usize {
    let mut failed = 0;
    for source in sources {
        let result = match chunksize {
            Some(chunksize) => cache.ensure_built(source, chunksize),
            None => cache.ensure_all_levels(source),
        };
        match result {
            Ok(()) => info!("built peaks for {}", source.display()),
            Err(err) => {
                error!("failed to build peaks for {}: {}", source.display(), err);
                failed += 1;
            }
        }
    }
    failed
}

fn print_help() {
    println!(
        "spool-scripts\n\nCommands:\n  tone     Write a sine test tone as a float WAV file\n  peaks    Build peak files for one or more sources\n\nRun 'spool-scripts <command> --help' for options."
    );
}

fn print_tone_help() {
    println!(
        "Usage: spool-scripts tone --out <path> [options]\n\nOptions:\n  --out <path>        Output WAV file (required)\n  --freq <hz>         Tone frequency (default 440)\n  --seconds <s>       Length (default 2)\n  --rate <hz>         Sample rate (default 48000)\n  --channels <n>      Channel count (default 2)\n  --amp <gain>        Peak amplitude (default 0.5)\n  -h, --help          Show this help"
    );
}

fn print_peaks_help() {
    println!(
        "Usage: spool-scripts peaks [options] <source>...\n\nOptions:\n  --config <path>     Engine JSON config to read peak levels from\n  --chunksize <n>     Build only this resolution instead of every level\n  -h, --help          Show this help"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peak_build_counts_failed_sources() {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = tempfile::tempdir().expect("tempdir");
        let good = dir.path().join("tone.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 48_000,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut writer = hound::WavWriter::create(&good, spec).expect("wav");
        for i in 0..2048 {
            writer.write_sample((i as f32 * 0.01).sin()).expect("sample");
        }
        writer.finalize().expect("finalize");

        let cache = PeakCache::new(PeakCacheConfig::default());
        let sources = vec![good.clone(), dir.path().join("missing.wav")];
        assert_eq!(build_peaks(&cache, &sources, Some(256)), 1);
        assert!(cache.current(&good, 256));
    }
}
