use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;

use hollowcast_contracts::facts::normalize::normalize_loose;
use hollowcast_contracts::session::{
    request_from_value, Background, ImageRef, OutputSize, PipelineOptions, PipelineRequest,
};
use hollowcast_engine::{EngineConfig, PipelineEngine, StageAdapters};

#[derive(Debug, Parser)]
#[command(name = "hollowcast", version, about = "Ghost-mannequin garment rendering pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the full pipeline for one garment and print the response.
    Run(RunArgs),
    /// Normalize a facts document and print the validated record.
    Normalize(NormalizeArgs),
}

#[derive(Debug, Parser)]
struct RunArgs {
    /// Flatlay image: http(s) URL, file:// URL, or local path.
    #[arg(long)]
    flatlay: Option<String>,
    /// Optional on-model reference image.
    #[arg(long)]
    on_model: Option<String>,
    /// Full request as a JSON file; overrides the individual flags.
    #[arg(long)]
    request: Option<PathBuf>,
    /// Run directory for events, cache, and offline artifacts.
    #[arg(long, default_value = "runs/latest")]
    out: PathBuf,
    /// Pin the session id (re-running with the same id reuses uploads).
    #[arg(long)]
    session: Option<String>,
    #[arg(long, default_value = "1024x1024")]
    size: String,
    #[arg(long, default_value = "white")]
    background: String,
    #[arg(long)]
    no_preserve_labels: bool,
    /// Offline adapters; no network and no credentials required.
    #[arg(long)]
    offline: bool,
}

#[derive(Debug, Parser)]
struct NormalizeArgs {
    /// Facts document as a JSON file, or `-` for stdin.
    input: PathBuf,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("hollowcast error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run_pipeline(args),
        Command::Normalize(args) => {
            run_normalize(args)?;
            Ok(0)
        }
    }
}

fn run_pipeline(args: RunArgs) -> Result<i32> {
    let request = build_request(&args)?;
    let config = EngineConfig::from_env();
    let adapters = if args.offline {
        StageAdapters::dryrun(&args.out)
    } else {
        StageAdapters::http(&config)
    };
    let mut engine = PipelineEngine::new(config, adapters, &args.out)?;
    let response = engine.run(&request);
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(if response.status == "completed" { 0 } else { 1 })
}

fn build_request(args: &RunArgs) -> Result<PipelineRequest> {
    if let Some(path) = &args.request {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading request file {}", path.display()))?;
        let value: Value = serde_json::from_str(&raw)
            .with_context(|| format!("parsing request file {}", path.display()))?;
        return request_from_value(&value).map_err(anyhow::Error::from);
    }

    let flatlay = args
        .flatlay
        .clone()
        .context("either --flatlay or --request is required")?;
    Ok(PipelineRequest {
        flatlay: ImageRef::new(flatlay),
        on_model: args.on_model.clone().map(ImageRef::new),
        options: PipelineOptions {
            preserve_labels: !args.no_preserve_labels,
            output_size: OutputSize::parse(&args.size),
            background: Background::parse(&args.background),
        },
        session_id: args.session.clone(),
    })
}

fn run_normalize(args: NormalizeArgs) -> Result<()> {
    let raw = if args.input.as_os_str() == "-" {
        let mut buffer = String::new();
        std::io::stdin().read_to_string(&mut buffer)?;
        buffer
    } else {
        std::fs::read_to_string(&args.input)
            .with_context(|| format!("reading {}", args.input.display()))?
    };
    let value: Value = serde_json::from_str(&raw).context("parsing facts document")?;
    let facts = normalize_loose(&value);
    println!("{}", serde_json::to_string_pretty(&facts)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_args() -> RunArgs {
        RunArgs {
            flatlay: None,
            on_model: None,
            request: None,
            out: PathBuf::from("runs/test"),
            session: None,
            size: "1024x1024".to_string(),
            background: "white".to_string(),
            no_preserve_labels: false,
            offline: true,
        }
    }

    #[test]
    fn flags_build_a_request() -> Result<()> {
        let mut args = run_args();
        args.flatlay = Some("shots/flat.png".to_string());
        args.on_model = Some("https://img.example/worn.png".to_string());
        args.size = "2048x2048".to_string();
        args.no_preserve_labels = true;

        let request = build_request(&args)?;
        assert_eq!(request.flatlay.as_str(), "shots/flat.png");
        assert!(request.on_model.is_some());
        assert_eq!(request.options.output_size, OutputSize::Square2048);
        assert!(!request.options.preserve_labels);
        Ok(())
    }

    #[test]
    fn missing_flatlay_is_an_error() {
        assert!(build_request(&run_args()).is_err());
    }

    #[test]
    fn request_file_overrides_flags() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("request.json");
        std::fs::write(
            &path,
            r#"{"flatlay": "flat.png", "options": {"backgroundColor": "transparent"}}"#,
        )?;

        let mut args = run_args();
        args.flatlay = Some("ignored.png".to_string());
        args.request = Some(path);

        let request = build_request(&args)?;
        assert_eq!(request.flatlay.as_str(), "flat.png");
        assert_eq!(request.options.background, Background::Transparent);
        Ok(())
    }
}
