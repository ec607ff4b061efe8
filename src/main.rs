use anyhow::{Context, Result};
use callprof::cli::{Cli, Command, ReplayArgs};
use callprof::{Entity, ProfileConfig, ProfileEvent, ProfileSession, ThreadFilter};
use clap::Parser;
use std::fs::File;
use std::io::{BufRead, BufReader};
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

/// Parse `Owner#member` into the entity and member to exclude
fn parse_method(spec: &str) -> Result<(Entity, &str)> {
    match spec.rsplit_once('#') {
        Some((owner, member)) if !owner.is_empty() && !member.is_empty() => {
            Ok((Entity::Plain(owner.to_string()), member))
        }
        _ => anyhow::bail!("Invalid method: {} (expected OWNER#MEMBER)", spec),
    }
}

fn build_session(args: &ReplayArgs) -> Result<ProfileSession> {
    let mut config = match &args.config {
        Some(path) => ProfileConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => ProfileConfig::default(),
    };
    if let Some(mode) = args.measure_mode {
        config.measure_mode = mode;
    }
    config.track_allocations |= args.track_allocations;
    config.merge_fibers |= args.merge_fibers;

    let mut session = ProfileSession::new(config)?;
    if let Some(expr) = &args.threads {
        session.set_thread_filter(ThreadFilter::from_expr(expr)?)?;
    }
    for spec in &args.exclude {
        let (entity, member) = parse_method(spec)?;
        session.exclude_method(&entity, member)?;
    }
    Ok(session)
}

fn run_replay(args: ReplayArgs) -> Result<()> {
    let mut session = build_session(&args)?;

    let file = File::open(&args.events)
        .with_context(|| format!("Failed to open events {}", args.events.display()))?;
    let mut last = None;
    let mut replayed = 0usize;
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let event: ProfileEvent = serde_json::from_str(&line)
            .with_context(|| format!("Invalid event on line {}", index + 1))?;
        if last.is_none() {
            session.start_at(event.measurement)?;
        }
        session.handle_event(&event)?;
        last = Some(event.measurement);
        replayed += 1;
    }

    match last {
        Some(measurement) => session.stop_at(measurement)?,
        None => {
            session.start_at(0.0)?;
            session.stop_at(0.0)?;
        }
    }
    tracing::debug!(replayed, "event stream replayed");

    let dump = session.dump();
    match &args.output {
        Some(path) => {
            dump.save(path, args.format)
                .with_context(|| format!("Failed to write dump {}", path.display()))?;
            eprintln!(
                "callprof: {} events, {} contexts -> {}",
                replayed,
                dump.threads.len(),
                path.display()
            );
        }
        None => dump.write_to(std::io::stdout().lock(), args.format)?,
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing if --debug flag is set
    init_tracing(cli.debug);

    match cli.command {
        Command::Replay(args) => run_replay(args),
    }
}
