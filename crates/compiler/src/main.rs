//! Ember Compiler CLI
//!
//! `emberc [options] <file>`: compile an Ember program to its AST, IR or
//! EVM bytecode. Diagnostics print to stderr with a source excerpt and
//! caret; warnings never fail the build. Exit code is 0 on success and 1
//! on any error-severity diagnostic or I/O failure.

use clap::{Parser as ClapParser, ValueEnum};
use emberc::diagnostics::{has_errors, Diagnostic, Severity};
use emberc::format::{self, OutputFormat};
use emberc::ir::{stats, validate};
use emberc::{build_ir, compile, frontend, Artifact, CompileOptions, EmitTarget};
use std::io::Write;
use std::path::PathBuf;
use std::process;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StopAfter {
    Ast,
    Ir,
    Bytecode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
    Asm,
}

#[derive(ClapParser)]
#[command(name = "emberc")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Ember compiler - compile Ember contracts to EVM bytecode", long_about = None)]
struct Cli {
    /// Input source file
    input: PathBuf,

    /// Which artifact to produce
    #[arg(short = 's', long = "stop-after", value_enum, default_value = "bytecode")]
    stop_after: StopAfter,

    /// Optimization level (0-3)
    #[arg(short = 'O', long = "optimize", default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=3))]
    optimize: u8,

    /// Output format
    #[arg(short = 'f', long = "format", value_enum, default_value = "text")]
    format: Format,

    /// Output file (defaults to stdout)
    #[arg(short = 'o', long = "output")]
    output: Option<PathBuf>,

    /// Pretty-print JSON output
    #[arg(short = 'p', long = "pretty")]
    pretty: bool,

    /// Run the IR validator and report invariant violations
    #[arg(long)]
    validate: bool,

    /// Print IR statistics to stderr
    #[arg(long)]
    stats: bool,

    /// Print both unoptimized and optimized IR
    #[arg(long = "show-both")]
    show_both: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    process::exit(run(&cli));
}

fn run(cli: &Cli) -> i32 {
    let source = match std::fs::read_to_string(&cli.input) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("error: cannot read {}: {}", cli.input.display(), e);
            return 1;
        }
    };
    let source_path = cli.input.display().to_string();
    let format = match cli.format {
        Format::Text => OutputFormat::Text,
        Format::Json => OutputFormat::Json,
        Format::Asm => OutputFormat::Asm,
    };

    // --show-both and the IR inspection flags need the pipeline in two
    // halves; everything else goes through the single compile() entry.
    if cli.show_both || cli.validate || cli.stats {
        return run_ir_tools(cli, &source, &source_path, format);
    }

    let options = CompileOptions {
        to: match cli.stop_after {
            StopAfter::Ast => EmitTarget::Ast,
            StopAfter::Ir => EmitTarget::Ir,
            StopAfter::Bytecode => EmitTarget::Bytecode,
        },
        source,
        source_path: source_path.clone(),
        optimizer_level: cli.optimize,
    };

    match compile(&options) {
        Ok(output) => {
            report(&output.warnings, &options.source, &source_path);
            let rendered = match &output.artifact {
                Artifact::Ast(program) => format::render_ast(program, format, cli.pretty),
                Artifact::Ir(module) => format::render_ir(module, format, cli.pretty),
                Artifact::Bytecode(artifact) => {
                    format::render_bytecode(artifact, format, cli.pretty)
                }
            };
            if write_output(cli, &rendered).is_err() {
                return 1;
            }
            0
        }
        Err(diagnostics) => {
            report(&diagnostics, &options.source, &source_path);
            1
        }
    }
}

/// The IR inspection paths: `--validate`, `--stats`, `--show-both`.
fn run_ir_tools(cli: &Cli, source: &str, source_path: &str, format: OutputFormat) -> i32 {
    let (parsed, diagnostics) = frontend(source);
    let Some((program, symbols)) = parsed else {
        report(&diagnostics, source, source_path);
        return 1;
    };
    if has_errors(&diagnostics) {
        report(&diagnostics, source, source_path);
        return 1;
    }

    let (unoptimized, build_diags) = build_ir(&program, &symbols, 0);
    report(&build_diags, source, source_path);
    if has_errors(&build_diags) {
        return 1;
    }
    let (optimized, _) = build_ir(&program, &symbols, cli.optimize);

    if cli.validate {
        let violations = validate::validate(&optimized);
        if !violations.is_empty() {
            report(&violations, source, source_path);
            return 1;
        }
        eprintln!("IR validation passed");
    }

    if cli.stats {
        eprint!("{}", stats::collect(&optimized));
    }

    let mut rendered = String::new();
    if cli.show_both {
        rendered.push_str("; unoptimized\n");
        rendered.push_str(&format::render_ir(&unoptimized, format, cli.pretty));
        rendered.push_str("\n; optimized\n");
        rendered.push_str(&format::render_ir(&optimized, format, cli.pretty));
    } else {
        rendered.push_str(&format::render_ir(&optimized, format, cli.pretty));
    }
    if write_output(cli, &rendered).is_err() {
        return 1;
    }
    0
}

/// Print diagnostics to stderr with source excerpts. Warnings never fail
/// the build; the caller decides the exit code from error presence.
fn report(diagnostics: &[Diagnostic], source: &str, source_path: &str) {
    for diagnostic in diagnostics {
        eprintln!("{}", diagnostic.render(source, source_path));
        if diagnostic.severity == Severity::Error {
            eprintln!();
        }
    }
}

fn write_output(cli: &Cli, rendered: &str) -> std::io::Result<()> {
    match &cli.output {
        Some(path) => std::fs::write(path, rendered).map_err(|e| {
            eprintln!("error: cannot write {}: {}", path.display(), e);
            e
        }),
        None => {
            let stdout = std::io::stdout();
            let mut handle = stdout.lock();
            handle.write_all(rendered.as_bytes())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn write_temp(source: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(source.as_bytes()).unwrap();
        file
    }

    fn cli_for(input: &std::path::Path, extra: &[&str]) -> Cli {
        let mut args = vec!["emberc".to_string()];
        args.extend(extra.iter().map(|s| s.to_string()));
        args.push(input.display().to_string());
        Cli::parse_from(args)
    }

    #[test]
    fn compiles_to_output_file() {
        let input = write_temp("name X; code -> uint256 { return 1; }");
        let out = tempfile::NamedTempFile::new().unwrap();
        let cli = cli_for(
            input.path(),
            &["-o", &out.path().display().to_string()],
        );
        assert_eq!(run(&cli), 0);
        let written = std::fs::read_to_string(out.path()).unwrap();
        assert!(written.contains("runtime: 0x"));
    }

    #[test]
    fn error_exit_code() {
        let input = write_temp("name X; code { let x = nope; }");
        let out = tempfile::NamedTempFile::new().unwrap();
        let cli = cli_for(input.path(), &["-o", &out.path().display().to_string()]);
        assert_eq!(run(&cli), 1);
    }

    #[test]
    fn missing_file_exit_code() {
        let cli = cli_for(std::path::Path::new("/nonexistent/input.mb"), &[]);
        assert_eq!(run(&cli), 1);
    }

    #[test]
    fn validate_flag_passes_on_clean_input() {
        let input = write_temp("name X; code { let i = 0; while (i < 3) { i = i + 1; } }");
        let out = tempfile::NamedTempFile::new().unwrap();
        let cli = cli_for(
            input.path(),
            &["--validate", "-o", &out.path().display().to_string()],
        );
        assert_eq!(run(&cli), 0);
    }

    #[test]
    fn show_both_renders_two_modules() {
        let input = write_temp("name X; code -> uint256 { return 1 + 2; }");
        let out = tempfile::NamedTempFile::new().unwrap();
        let cli = cli_for(
            input.path(),
            &[
                "--show-both",
                "-O",
                "2",
                "-o",
                &out.path().display().to_string(),
            ],
        );
        assert_eq!(run(&cli), 0);
        let written = std::fs::read_to_string(out.path()).unwrap();
        assert!(written.contains("; unoptimized"));
        assert!(written.contains("; optimized"));
    }

    #[test]
    fn stop_after_ast_emits_json() {
        let input = write_temp("name X; code { }");
        let out = tempfile::NamedTempFile::new().unwrap();
        let cli = cli_for(
            input.path(),
            &["-s", "ast", "-o", &out.path().display().to_string()],
        );
        assert_eq!(run(&cli), 0);
        let written = std::fs::read_to_string(out.path()).unwrap();
        assert!(written.contains("\"name\": \"X\""));
    }
}
