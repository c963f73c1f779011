use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use ember_voiceprint::config::AppConfig;
use ember_voiceprint::paths::AppPaths;
use ember_voiceprint::voice::{
    NormRangeLiveness, QualityConfig, SnapshotStore, SpeakerBiometrics,
};

/// Emberleaf voiceprint store
#[derive(Parser, Debug)]
#[command(name = "ember-voiceprint")]
#[command(about = "Enroll and verify speaker voiceprints")]
#[command(version)]
struct Cli {
    /// Keep config and voiceprints under this directory instead of the OS defaults
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show store statistics
    Stats,
    /// Print the enrollment record of a user
    Lookup { user: String },
    /// List enrolled users
    List,
    /// Enroll a user from an embedding file (JSON array of numbers)
    Enroll {
        user: String,
        embedding: PathBuf,
        /// Quality metric attached to the enrollment, as key=value
        #[arg(long = "metric", value_parser = parse_metric)]
        metrics: Vec<(String, f64)>,
    },
    /// Verify a user against an embedding file (exit code 2 when rejected)
    Verify { user: String, embedding: PathBuf },
}

fn main() -> ExitCode {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            log::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let paths = match &cli.data_dir {
        Some(root) => AppPaths::with_data_dir(root),
        None => AppPaths::new()?,
    };
    paths.ensure_directories()?;

    let config = AppConfig::load_or_create(&paths.config_file())?;

    let store = SnapshotStore::open(config.store_dir(&paths))?;
    let engine = SpeakerBiometrics::open(config.biometrics.clone(), Box::new(store))?;

    match cli.command {
        Command::Stats => print_json(&engine.stats())?,
        Command::List => {
            for user in engine.list_profiles() {
                println!("{}", user);
            }
        }
        Command::Lookup { user } => match engine.lookup(&user) {
            Some(record) => print_json(&record)?,
            None => anyhow::bail!("User '{}' is not enrolled", user),
        },
        Command::Enroll {
            user,
            embedding,
            metrics,
        } => {
            let embedding = read_embedding(&embedding)?;
            let liveness = NormRangeLiveness::from_config(&config.liveness);
            let metrics = enrollment_metrics(metrics, &config.quality)?;
            let record = engine.enroll(&user, &embedding, &liveness, metrics)?;
            print_json(&record)?;
        }
        Command::Verify { user, embedding } => {
            let embedding = read_embedding(&embedding)?;
            let liveness = NormRangeLiveness::from_config(&config.liveness);
            let outcome = engine.verify(&user, &embedding, &liveness)?;
            print_json(&outcome)?;

            if !outcome.verified {
                return Ok(ExitCode::from(2));
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn read_embedding(path: &Path) -> Result<Vec<f32>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read embedding: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Embedding must be a JSON array of numbers: {}", path.display()))
}

/// Collect `--metric` pairs, holding a reported `duration` to the sample window
fn enrollment_metrics(
    pairs: Vec<(String, f64)>,
    quality: &QualityConfig,
) -> Result<BTreeMap<String, f64>> {
    let metrics: BTreeMap<String, f64> = pairs.into_iter().collect();
    if let Some(&duration) = metrics.get("duration") {
        quality
            .check_duration(duration)
            .context("Enrollment sample rejected")?;
    }
    Ok(metrics)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_metric(s: &str) -> Result<(String, f64), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", s))?;
    let value: f64 = value
        .trim()
        .parse()
        .map_err(|e| format!("invalid value for '{}': {}", key, e))?;
    Ok((key.trim().to_string(), value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_metric() {
        assert_eq!(
            parse_metric("duration=4.5").unwrap(),
            ("duration".to_string(), 4.5)
        );
        assert!(parse_metric("duration").is_err());
        assert!(parse_metric("duration=loud").is_err());
    }

    #[test]
    fn test_enrollment_metrics_duration_window() {
        let quality = QualityConfig::default();

        let ok = enrollment_metrics(
            vec![("duration".to_string(), 4.0), ("snr".to_string(), 12.0)],
            &quality,
        )
        .unwrap();
        assert_eq!(ok.len(), 2);

        assert!(enrollment_metrics(vec![("duration".to_string(), 1.5)], &quality).is_err());
        assert!(enrollment_metrics(vec![("snr".to_string(), 12.0)], &quality).is_ok());
    }

    #[test]
    fn test_cli_parses_enroll() {
        let cli = Cli::try_parse_from([
            "ember-voiceprint",
            "--data-dir",
            "/tmp/prints",
            "enroll",
            "alice",
            "alice.json",
            "--metric",
            "duration=4.0",
            "--metric",
            "snr=12.5",
        ])
        .unwrap();

        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/prints")));
        match cli.command {
            Command::Enroll { user, metrics, .. } => {
                assert_eq!(user, "alice");
                assert_eq!(metrics.len(), 2);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
