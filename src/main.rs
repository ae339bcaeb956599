use anyhow::{Context, Result};
use clap::Parser;
use procprov::cli::{Cli, OutputFormat};
use procprov::config::TracerConfig;
use procprov::filter::ArgvMatcher;
use procprov::json_output::JsonProvenance;
use procprov::text_output::{render_text, summary_counts};
use procprov::tracer::{self, Provenance};
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber for debug output
fn init_tracing(debug: bool) {
    if debug {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into()),
            )
            .with_writer(std::io::stderr)
            .init();
    }
}

/// Configuration file values with command-line flags layered on top
fn load_config(cli: &Cli) -> Result<TracerConfig> {
    let mut config = match &cli.config {
        Some(path) => TracerConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => TracerConfig::default(),
    };

    if let Some(tracer) = &cli.tracer {
        config.tracer = tracer.clone();
    }
    if let Some(expr) = &cli.filter {
        config.syscalls = Some(expr.clone());
    }
    if let Some(secs) = cli.timeout {
        config.timeout_secs = Some(secs);
    }
    if cli.no_track_cwd {
        config.track_cwd = false;
    }
    if let Some(dir) = &cli.cwd {
        let dir = if dir.is_absolute() {
            dir.clone()
        } else {
            std::env::current_dir()
                .context("Failed to read current directory")?
                .join(dir)
        };
        config.root_dir = Some(dir);
    }
    if cli.match_argv.is_some() || cli.exclude_argv.is_some() {
        config.match_argv = None;
        config.exclude_argv = cli.exclude_argv.clone();
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Predicate from `--match-argv`, which accepts a `!` prefix, or the config
fn argv_matcher(cli: &Cli, config: &TracerConfig) -> Result<ArgvMatcher> {
    let matcher = match &cli.match_argv {
        Some(expr) => ArgvMatcher::from_expr(expr)?,
        None => config.argv_matcher()?,
    };
    Ok(matcher)
}

/// Trace the command or replay a captured trace
fn run(cli: &Cli, config: &TracerConfig) -> Result<Provenance> {
    let matcher = argv_matcher(cli, config)?;
    match (&cli.replay, &cli.command) {
        (Some(path), _) => {
            let root_dir = config.resolve_root_dir()?;
            tracer::replay_trace(path, &root_dir, &matcher, config.track_cwd)
                .with_context(|| format!("Failed to replay {}", path.display()))
        }
        (None, Some(command)) => {
            tracer::trace_command(command, &matcher, config).context("Tracing failed")
        }
        (None, None) => {
            anyhow::bail!("Must specify a command to trace (after --) or --replay FILE")
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let config = load_config(&cli)?;
    let provenance = run(&cli, &config)?;
    tracing::debug!(counts = ?summary_counts(&provenance.processes), "provenance summary");

    match cli.format {
        OutputFormat::Text => print!("{}", render_text(&provenance, cli.renumber)),
        OutputFormat::Json => {
            let json = JsonProvenance::from_provenance(&provenance, cli.renumber).to_json()?;
            println!("{}", json);
        }
    }

    std::process::exit(provenance.exit_code);
}
