use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context as _};
use clap::{ArgAction, Parser};
use log::{debug, error, info, warn};
use svgshot::cdp::ChromeFactory;
use svgshot::{Config, ConvertOptions, Converter, InstancePool, Rounding, Source};
use tokio::io::AsyncReadExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "svgshot", version, about = "Convert SVG documents to PNG")]
struct Cli {
    /// SVG files or URLs. `-` reads SVG markup from stdin.
    #[arg(required = true)]
    inputs: Vec<String>,

    /// Output PNG path (single input only).
    #[arg(short, long, conflicts_with = "out_dir")]
    output: Option<PathBuf>,

    /// Directory for output PNGs. Defaults to each input's directory.
    #[arg(long)]
    out_dir: Option<PathBuf>,

    /// Output width in pixels.
    #[arg(long)]
    width: Option<f64>,

    /// Output height in pixels.
    #[arg(long)]
    height: Option<f64>,

    /// Render the view box at 1/scale.
    #[arg(long)]
    scale: Option<f64>,

    /// CSS background colour. Output is transparent without it.
    #[arg(long)]
    background: Option<String>,

    /// How fractional sizes are rounded: round, ceil or floor.
    #[arg(long, default_value = "round")]
    rounding: Rounding,

    /// Whole-conversion deadline in milliseconds.
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Navigation timeout in milliseconds.
    #[arg(long)]
    navigation_timeout_ms: Option<u64>,

    /// JSON configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Chrome binary to launch.
    #[arg(long)]
    chrome: Option<PathBuf>,

    /// Launch Chrome without its sandbox.
    #[arg(long)]
    no_sandbox: bool,

    /// Log each request's history as it happens.
    #[arg(long)]
    debug: bool,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);
    run(cli).await
}

fn init_logging(cli: &Cli) {
    let level = match (cli.verbose, cli.debug) {
        (0, false) => "warn",
        (0, true) | (1, true) | (2, _) => "debug",
        (1, false) => "info",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("svgshot={}", level)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    check_inputs(&cli.inputs)?;
    if cli.output.is_some() && cli.inputs.len() > 1 {
        bail!("--output takes a single input; use --out-dir for several");
    }

    let mut config = match &cli.config {
        Some(path) => Config::from_json_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(chrome) = &cli.chrome {
        config.chrome.path = Some(chrome.clone());
    }
    if cli.no_sandbox {
        config.chrome.sandbox = false;
    }

    let markup = if cli.inputs.iter().any(|input| input == "-") {
        let mut markup = String::new();
        tokio::io::stdin()
            .read_to_string(&mut markup)
            .await
            .context("reading SVG markup from stdin")?;
        Some(markup)
    } else {
        None
    };

    let pool = InstancePool::new(Arc::new(ChromeFactory::new(config.chrome.clone())));
    let converter = Converter::from_config(pool, &config)?;

    let jobs = cli.inputs.iter().enumerate().map(|(index, input)| {
        let source = match (input.as_str(), &markup) {
            ("-", Some(markup)) => Source::Markup(markup.clone()),
            _ => Source::Locator(input.clone()),
        };
        let options = ConvertOptions {
            width: cli.width,
            height: cli.height,
            scale: cli.scale,
            background: cli.background.clone(),
            rounding: cli.rounding,
            navigation_timeout_ms: cli.navigation_timeout_ms,
            conversion_timeout_ms: cli.timeout_ms,
            debug: cli.debug,
            ..ConvertOptions::new(source)
        };
        let output = output_path(&cli, input, index);
        let converter = &converter;
        async move {
            let outcome = convert_one(converter, &options, &output).await;
            (input.as_str(), outcome)
        }
    });
    let results = futures::future::join_all(jobs).await;
    converter.shutdown().await;

    let close_failures = converter.take_close_failures();
    if !close_failures.is_empty() {
        warn!("Sessions failed to close for requests {:?}", close_failures);
    }

    let mut failed = 0;
    for (input, outcome) in &results {
        match outcome {
            Ok(path) => info!("{} -> {}", input, path.display()),
            Err(e) => {
                error!("{}: {:#}", input, e);
                failed += 1;
            }
        }
    }
    if failed > 0 {
        bail!("{} of {} conversions failed", failed, results.len());
    }
    Ok(())
}

fn check_inputs(inputs: &[String]) -> anyhow::Result<()> {
    if inputs.iter().filter(|input| *input == "-").count() > 1 {
        bail!("stdin (`-`) can only be given once");
    }
    Ok(())
}

async fn convert_one(
    converter: &Converter,
    options: &ConvertOptions,
    output: &Path,
) -> anyhow::Result<PathBuf> {
    let png = match converter.convert(options).await {
        Ok(png) => png,
        Err(e) => {
            debug!("Request {} history:\n{}", e.request_id, e.history);
            return Err(e.into());
        }
    };
    tokio::fs::write(output, &png)
        .await
        .with_context(|| format!("writing {}", output.display()))?;
    Ok(output.to_path_buf())
}

fn output_path(cli: &Cli, input: &str, index: usize) -> PathBuf {
    if let Some(output) = &cli.output {
        return output.clone();
    }

    let input_path = Path::new(input);
    let stem = match input {
        "-" => "stdin".to_string(),
        _ => input_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| format!("output-{}", index + 1)),
    };
    let dir = match &cli.out_dir {
        Some(dir) => dir.clone(),
        None if input_path.is_file() => input_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default(),
        None => PathBuf::from("."),
    };
    dir.join(format!("{}.png", stem))
}
