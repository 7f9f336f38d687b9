use std::io::Read;

use anyhow::Context;
use clap::Parser;
use stylecheck::{normalize, NormalizeContext};

#[derive(Parser)]
#[command(
    name = "stylecheck",
    about = "Normalize raw style-critique model output into structured scores",
    version
)]
struct Cli {
    /// Style category the critique was requested for
    #[arg(long, default_value = "casual")]
    style: String,

    /// File paths with raw model output (reads stdin if none provided)
    files: Vec<String>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    let ctx = NormalizeContext {
        requested_style: cli.style.clone(),
    };

    if cli.files.is_empty() {
        let mut input = String::new();
        std::io::stdin()
            .read_to_string(&mut input)
            .context("failed to read stdin")?;
        let result = normalize(&input, &ctx);
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        for path in &cli.files {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {path}"))?;
            let result = normalize(&text, &ctx);
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }
    Ok(())
}
