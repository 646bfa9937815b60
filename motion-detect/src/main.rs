//! Detect significant scene motion in a video and write the event timestamps as JSON.

use clap::*;
use frame_loader::SourceOptions;
use log::*;
use mdet::prelude::v1::{Result, *};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::PathBuf;

fn cli() -> Command<'static> {
    Command::new("motion-detect")
        .version(crate_version!())
        .author(crate_authors!())
        .about(crate_description!())
        .arg(
            Arg::new("input")
                .long("input")
                .short('i')
                .help("YUV4MPEG2 file, `-` for stdin, tcp://host:port or a directory of .pgm frames")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::new("output")
                .long("output")
                .short('o')
                .help("JSON output file, stdout if omitted")
                .takes_value(true),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .help("JSON detector configuration")
                .takes_value(true),
        )
        .arg(Arg::new("threshold").long("threshold").takes_value(true))
        .arg(Arg::new("learning-rate").long("learning-rate").takes_value(true))
        .arg(Arg::new("history").long("history").takes_value(true))
        .arg(Arg::new("components").long("components").takes_value(true))
        .arg(
            Arg::new("fps")
                .long("fps")
                .help("Override the framerate reported by the input")
                .takes_value(true),
        )
        .arg(
            Arg::new("fps-fallback")
                .long("fps-fallback")
                .help("Framerate to assume if the input does not report a valid one")
                .takes_value(true),
        )
        .arg(
            Arg::new("color")
                .long("color")
                .help("Model Y/Cb/Cr samples instead of luma only"),
        )
        .arg(Arg::new("skip-bad-frames").long("skip-bad-frames"))
        .arg(
            Arg::new("unique")
                .long("unique")
                .help("Never emit the same second twice, even when not consecutive"),
        )
        .arg(Arg::new("threads").long("threads").takes_value(true))
        .arg(Arg::new("max-frames").long("max-frames").takes_value(true))
        .arg(
            Arg::new("dump-masks")
                .long("dump-masks")
                .help("Write every foreground mask as a .pgm file into this directory")
                .takes_value(true),
        )
}

/// Build the detector configuration. Flags override the JSON file, which overrides defaults.
fn detector_config(matches: &ArgMatches) -> Result<DetectorConfig> {
    let mut config: DetectorConfig = match matches.value_of("config") {
        Some(path) => serde_json::from_reader(BufReader::new(File::open(path)?))?,
        None => Default::default(),
    };

    if let Some(threshold) = matches.value_of("threshold") {
        config = config.threshold(threshold.parse()?);
    }

    if let Some(rate) = matches.value_of("learning-rate") {
        config = config.learning_rate(Some(rate.parse()?));
    }

    if let Some(history) = matches.value_of("history") {
        config.model = config.model.history(history.parse()?);
    }

    if let Some(components) = matches.value_of("components") {
        config.model = config.model.components(components.parse()?);
    }

    if let Some(fps) = matches.value_of("fps-fallback") {
        config = config.fps_fallback(Some(fps.parse()?));
    }

    if let Some(threads) = matches.value_of("threads") {
        config = config.threads(threads.parse()?);
    }

    if matches.is_present("skip-bad-frames") {
        config = config.frame_errors(FrameErrorPolicy::Skip);
    }

    if matches.is_present("unique") {
        config = config.dedup(DedupPolicy::Unique);
    }

    Ok(config)
}

fn main() -> Result<()> {
    env_logger::init();

    let matches = cli().get_matches();

    let input = matches.value_of("input").unwrap();
    let config = detector_config(&matches)?;

    let max_frames = matches
        .value_of("max-frames")
        .map(str::parse::<u64>)
        .transpose()?;

    let options = SourceOptions {
        color: matches.is_present("color"),
        fps: matches.value_of("fps").map(str::parse).transpose()?,
    };

    let dump_masks = matches.value_of("dump-masks").map(PathBuf::from);

    if let Some(dir) = &dump_masks {
        std::fs::create_dir_all(dir)?;
    }

    let mut source = frame_loader::create_source(input, &options)?;
    let mut engine = MotionEngine::for_source(config, &*source)?;

    info!(
        "Detecting motion at {} fps with threshold {}",
        engine.fps(),
        engine.config().threshold
    );

    let mut dump_error = None;

    engine.run_with(&mut *source, max_frames, |engine| {
        if let (Some(dir), None) = (&dump_masks, &dump_error) {
            let path = dir.join(format!("{:06}.pgm", engine.frame_index() - 1));

            if let Err(e) = File::create(&path)
                .and_then(|f| engine.mask().write_pgm(BufWriter::new(f)))
            {
                dump_error = Some(anyhow!("could not write {}: {e}", path.display()));
            }
        }
    })?;

    if let Some(e) = dump_error {
        return Err(e);
    }

    let stats = engine.stats().clone();
    let events = engine.finish();

    debug!(
        "Segmentation took {:.2}s in total",
        stats.segment_time.as_secs_f64()
    );

    match matches.value_of("output") {
        Some(path) => {
            let mut out = BufWriter::new(File::create(path)?);
            serde_json::to_writer_pretty(&mut out, &events)?;
            writeln!(out)?;
            out.flush()?;
        }
        None => {
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            serde_json::to_writer_pretty(&mut out, &events)?;
            writeln!(out)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_from(args: &[&str]) -> Result<DetectorConfig> {
        let matches = cli().try_get_matches_from(["motion-detect", "-i", "-"].iter().chain(args))?;
        detector_config(&matches)
    }

    #[test]
    fn flags_override_defaults() {
        let config = config_from(&[
            "--threshold",
            "1200",
            "--learning-rate",
            "0.25",
            "--history",
            "100",
            "--fps-fallback",
            "30",
            "--skip-bad-frames",
            "--unique",
        ])
        .unwrap();

        assert_eq!(config.threshold, 1200);
        assert_eq!(config.learning_rate, Some(0.25));
        assert_eq!(config.model.history, 100);
        assert_eq!(config.fps_fallback, Some(30.0));
        assert_eq!(config.frame_errors, FrameErrorPolicy::Skip);
        assert_eq!(config.dedup, DedupPolicy::Unique);

        assert_eq!(config_from(&[]).unwrap(), DetectorConfig::default());
    }

    #[test]
    fn flags_override_config_file() {
        let path = std::env::temp_dir().join(format!("motion-detect-{}.json", std::process::id()));
        std::fs::write(&path, r#"{ "threshold": 10, "description": "movement" }"#).unwrap();

        let config = config_from(&["-c", path.to_str().unwrap(), "--threshold", "20"]).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.threshold, 20);
        assert_eq!(config.description, "movement");
    }

    #[test]
    fn bad_values_are_errors() {
        assert!(config_from(&["--threshold", "lots"]).is_err());
        assert!(config_from(&["--fps-fallback", "fast"]).is_err());
        assert!(config_from(&["-c", "/nonexistent/config.json"]).is_err());
    }
}
