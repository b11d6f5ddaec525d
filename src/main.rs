use std::io::IsTerminal;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use taskgrind::cli::{Cli, OutputFormat};
use taskgrind::{detector, parser};

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let store = parser::parse_file(&cli.trace)
        .with_context(|| format!("failed to parse trace {}", cli.trace.display()))?;
    let report = detector::analyze(&store, &cli.detector_config())
        .context("analysis failed")?;

    let rendered = match cli.format {
        OutputFormat::Text => report.render_text(),
        OutputFormat::Json => {
            let mut json = report.to_json().context("failed to serialize report")?;
            json.push('\n');
            json
        }
    };
    match &cli.output {
        Some(path) => std::fs::write(path, rendered)
            .with_context(|| format!("failed to write report to {}", path.display()))?,
        None => print!("{rendered}"),
    }
    Ok(())
}
