use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use miette::{Context, IntoDiagnostic};
use tracing_subscriber::EnvFilter;

use lumen_ir::Severity;
use lumen_opt::{OptLevel, PassManager};

/// Lumen model optimizer
#[derive(Parser)]
#[command(name = "lumen", version, about)]
struct Cli {
    /// Input model file
    input: PathBuf,

    /// Where to write the optimized model (default: no output)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Pass pipeline: 0/validate, 1/cleanup or 2/full
    #[arg(long, default_value = "full", value_parser = parse_opt_level)]
    opt_level: OptLevel,

    /// Dump IR to stderr after optimization
    #[arg(long)]
    emit_ir: bool,

    /// Validate and optimize without writing output
    #[arg(long)]
    dry_run: bool,

    /// Check graph links after every pass that changes the model
    #[arg(long)]
    validate_each_pass: bool,
}

/// Accepts the level number, its `O` spelling, or the pipeline name.
fn parse_opt_level(s: &str) -> Result<OptLevel, String> {
    match s.to_ascii_lowercase().as_str() {
        "0" | "o0" | "validate" => Ok(OptLevel::O0),
        "1" | "o1" | "cleanup" => Ok(OptLevel::O1),
        "2" | "o2" | "full" => Ok(OptLevel::O2),
        _ => Err(format!(
            "unknown pipeline '{s}': use 0 (validate), 1 (cleanup) or 2 (full)"
        )),
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> miette::Result<()> {
    let cli = Cli::parse();

    // 1. Load the model.
    let mut model = lumen_format::load(&cli.input)
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to load {}", cli.input.display()))?;
    let layers_before = model.layers.len();

    // 2. Optimize.
    let warnings_before = model.warnings.len();
    PassManager::for_level(cli.opt_level)
        .with_validation(cli.validate_each_pass)
        .run(&mut model)
        .into_diagnostic()
        .wrap_err("optimization failed")?;

    // 3. Report diagnostics raised by the passes.
    for warning in model.warnings.iter().skip(warnings_before) {
        if warning.severity >= Severity::Warning {
            eprintln!("{:?}: {}: {}", warning.severity, warning.layer, warning.message);
        }
    }
    log::info!(
        "{} -> {} layers, {} on cpu",
        layers_before,
        model.layers.len(),
        model.cpu_fallback.len()
    );

    // 4. Optionally dump IR to stderr.
    if cli.emit_ir {
        eprintln!("{}", lumen_ir::dump_model(&model));
    }

    // 5. Dry-run: stop here.
    if cli.dry_run {
        return Ok(());
    }

    // 6. Write output.
    if let Some(path) = &cli.output {
        model
            .compact_weights()
            .into_diagnostic()
            .wrap_err("failed to compact weights")?;
        lumen_format::save(&model, path)
            .into_diagnostic()
            .wrap_err_with(|| format!("failed to write {}", path.display()))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opt_level_spellings() {
        for (text, level) in [
            ("0", OptLevel::O0),
            ("validate", OptLevel::O0),
            ("O1", OptLevel::O1),
            ("cleanup", OptLevel::O1),
            ("o2", OptLevel::O2),
            ("Full", OptLevel::O2),
        ] {
            assert_eq!(parse_opt_level(text).unwrap(), level, "{text}");
        }
        let err = parse_opt_level("3").unwrap_err();
        assert!(err.contains("unknown pipeline '3'"));
    }

    #[test]
    fn flags_parse() {
        let cli = Cli::try_parse_from([
            "lumen",
            "model.lmn",
            "-o",
            "out.lmn",
            "--opt-level",
            "cleanup",
            "--validate-each-pass",
        ])
        .unwrap();
        assert_eq!(cli.opt_level, OptLevel::O1);
        assert!(cli.validate_each_pass);
        assert!(!cli.dry_run);

        let cli = Cli::try_parse_from(["lumen", "model.lmn"]).unwrap();
        assert_eq!(cli.opt_level, OptLevel::O2);
        assert!(cli.output.is_none());
    }
}
