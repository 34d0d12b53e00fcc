use std::path::PathBuf;
use std::process::exit;

use anyhow::Result;
use clap::Parser;
use libcapsule::factory::DEFAULT_RUNTIME_ROOT;

mod commands;
mod observability;

#[derive(Parser, Debug)]
#[command(version, about = "capsule is a simple Linux container runtime")]
struct Opts {
    /// Root directory for storage of container state
    #[arg(long, default_value = DEFAULT_RUNTIME_ROOT)]
    root: PathBuf,
    /// Turn on debug output
    #[arg(long)]
    debug: bool,
    /// Set the log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
    /// Write logs to this file instead of stderr
    #[arg(long)]
    log: Option<PathBuf>,
    /// Log format (text or json)
    #[arg(long)]
    log_format: Option<String>,
    #[command(subcommand)]
    subcmd: commands::SubCommand,
}

fn main() {
    // the re-exec'd child never sees the CLI parser; argv[1] decides
    if std::env::args().nth(1).as_deref() == Some("init") {
        run_init_mode();
    }

    let opts = Opts::parse();
    if let Err(err) = observability::init(&observability::ObservabilityConfig {
        log_debug_flag: opts.debug,
        log_level: opts.log_level.clone(),
        log_file: opts.log.clone(),
        log_format: opts.log_format.clone(),
    }) {
        eprintln!("capsule: failed to initialize logging: {err:?}");
        exit(1);
    }

    match run(opts) {
        Ok(exit_code) => exit(exit_code),
        Err(err) => {
            tracing::error!("{err:#}");
            eprintln!("capsule: {err:#}");
            exit(1);
        }
    }
}

// Child side of the bootstrap: finish the container environment and exec
// the user program. Reaching the end of this function at all means the
// initialization failed.
fn run_init_mode() -> ! {
    let _ = observability::init(&observability::ObservabilityConfig {
        log_format: Some("json".to_owned()),
        ..Default::default()
    });
    match libcapsule::factory::start_initialization() {
        Ok(()) => unreachable!("start_initialization returned after exec"),
        Err(err) => {
            tracing::error!("{err}");
            eprintln!("capsule: init failed: {err}");
            exit(-1);
        }
    }
}

fn run(opts: Opts) -> Result<i32> {
    use commands::SubCommand::*;

    match opts.subcmd {
        Create(args) => commands::create::create(args, opts.root).map(|_| 0),
        Start(args) => commands::start::start(args, opts.root).map(|_| 0),
        Run(args) => commands::run::run(args, opts.root),
        Exec(args) => commands::exec::exec(args, opts.root),
        Kill(args) => commands::kill::kill(args, opts.root).map(|_| 0),
        Delete(args) => commands::delete::delete(args, opts.root).map(|_| 0),
        Pause(args) => commands::pause::pause(args, opts.root).map(|_| 0),
        Resume(args) => commands::resume::resume(args, opts.root).map(|_| 0),
        State(args) => commands::state::state(args, opts.root).map(|_| 0),
        List(args) => commands::list::list(args, opts.root).map(|_| 0),
        Network(args) => commands::network::network(args, opts.root).map(|_| 0),
        Image(args) => commands::image::image(args, opts.root),
    }
}
