use anyhow::{Context, Result};
use clap::Parser;
use monoform::{transform, TransformOptions};
use std::fs;
use std::path::PathBuf;

/// monoform — rewrites a multi-function IR document into one
/// self-contained function.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Input IR document
    input: PathBuf,

    /// Output file (stdout if omitted)
    #[arg(long, short)]
    output: Option<PathBuf>,

    /// Skip the entry/exit validation gates
    #[arg(long)]
    no_validate: bool,

    /// Keep merge dispatch switches instead of lowering them
    #[arg(long)]
    keep_switches: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    eprintln!("monoform: flattening {}", cli.input.display());

    let source = fs::read_to_string(&cli.input)
        .with_context(|| format!("failed to read {}", cli.input.display()))?;

    let options = TransformOptions {
        validate: !cli.no_validate,
        lower_switches: !cli.keep_switches,
    };

    let flattened = transform(&source, &options).context("transformation failed")?;

    if let Some(output_path) = cli.output {
        fs::write(&output_path, &flattened)
            .with_context(|| format!("failed to write {}", output_path.display()))?;
        eprintln!("monoform: wrote {}", output_path.display());
    } else {
        // Print to stdout if no output file specified
        print!("{}", flattened);
    }

    eprintln!("monoform: done");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_defaults() {
        let cli = Cli::parse_from(["monoform", "input.mir"]);
        assert_eq!(cli.input, PathBuf::from("input.mir"));
        assert!(cli.output.is_none());
        assert!(!cli.no_validate);
        assert!(!cli.keep_switches);
    }

    #[test]
    fn cli_parses_flags() {
        let cli = Cli::parse_from([
            "monoform",
            "input.mir",
            "-o",
            "out.mir",
            "--keep-switches",
            "--no-validate",
        ]);
        assert_eq!(cli.output, Some(PathBuf::from("out.mir")));
        assert!(cli.no_validate);
        assert!(cli.keep_switches);
    }
}
