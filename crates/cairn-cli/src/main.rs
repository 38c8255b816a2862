mod commands;

use cairn_schema::StateConfig;
use clap::{Parser, Subcommand};
use commands::{CliError, Context, EXIT_FAILURE};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "cairn",
    version,
    about = "Inspect and change the topology of a Cairn environment"
)]
struct Cli {
    /// Path to the store directory (default: $CAIRN_STORE or ~/.local/share/cairn).
    #[arg(long, global = true)]
    store: Option<String>,

    /// Tunables for transactions, watchers and presence (TOML).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Bootstrap a new environment in the store.
    Init {
        /// Environment configuration (TOML) with name, type and admin-secret.
        environ: PathBuf,
    },
    /// Show machines, services, units and relations.
    Status,
    /// Add an empty machine.
    AddMachine,
    /// Store a charm and deploy it as a service.
    Deploy {
        /// Charm metadata file.
        metadata: PathBuf,
        /// Charm bundle archive.
        bundle: PathBuf,
        /// Service name (defaults to the charm name).
        #[arg(long)]
        name: Option<String>,
        /// Number of units to add.
        #[arg(short = 'n', long = "num-units", default_value_t = 1)]
        num_units: usize,
    },
    /// Add units to a service, each on an unused machine.
    AddUnit {
        service: String,
        #[arg(short = 'n', long = "num-units", default_value_t = 1)]
        num_units: usize,
    },
    /// Start destroying units.
    DestroyUnit {
        #[arg(required = true)]
        units: Vec<String>,
    },
    /// Mark a unit in error as resolved.
    Resolved {
        unit: String,
        /// Skip the failed hook instead of retrying it.
        #[arg(long, default_value_t = false)]
        no_hooks: bool,
    },
    /// Set a unit's workload status: <status> [message] [data].
    SetStatus {
        unit: String,
        #[arg(allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Relate two services, or name a single peer endpoint.
    AddRelation {
        #[arg(required = true, num_args = 1..=2)]
        endpoints: Vec<String>,
    },
    /// Print changes to a collection, or to one document of it.
    Watch {
        collection: String,
        id: Option<String>,
        /// Exit after this many changes.
        #[arg(long)]
        count: Option<usize>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("CAIRN_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .init();

    let store = cli
        .store
        .or_else(|| std::env::var("CAIRN_STORE").ok())
        .unwrap_or_else(|| "~/.local/share/cairn".to_owned());
    let config = match &cli.config {
        Some(path) => match StateConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("error: {e}");
                return ExitCode::from(EXIT_FAILURE);
            }
        },
        None => StateConfig::default(),
    };

    // Watchers and pingers run on this runtime while commands stay blocking.
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: cannot start runtime: {e}");
            return ExitCode::from(EXIT_FAILURE);
        }
    };
    let _guard = runtime.enter();

    let ctx = Context {
        store: expand_tilde(&store),
        config,
        json: cli.json,
    };

    let result = match cli.command {
        Commands::Init { environ } => commands::init::run(&ctx, &environ),
        command => ctx.connect().and_then(|conn| {
            let result = dispatch(&ctx, &conn, &runtime, command);
            if let Err(e) = conn.close() {
                tracing::debug!("closing state: {e}");
            }
            result
        }),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}

fn dispatch(
    ctx: &Context,
    conn: &cairn_core::Conn,
    runtime: &tokio::runtime::Runtime,
    command: Commands,
) -> Result<u8, CliError> {
    match command {
        Commands::Init { environ } => commands::init::run(ctx, &environ),
        Commands::Status => commands::status::run(conn, ctx.json),
        Commands::AddMachine => commands::add_machine::run(conn, ctx.json),
        Commands::Deploy {
            metadata,
            bundle,
            name,
            num_units,
        } => commands::deploy::run(
            conn,
            &metadata,
            &bundle,
            name.as_deref(),
            num_units,
            ctx.json,
        ),
        Commands::AddUnit { service, num_units } => {
            commands::add_unit::run(conn, &service, num_units, ctx.json)
        }
        Commands::DestroyUnit { units } => commands::destroy_unit::run(conn, &units),
        Commands::Resolved { unit, no_hooks } => commands::resolved::run(conn, &unit, no_hooks),
        Commands::SetStatus { unit, args } => commands::set_status::run(conn, &unit, &args),
        Commands::AddRelation { endpoints } => {
            commands::add_relation::run(conn, &endpoints, ctx.json)
        }
        Commands::Watch {
            collection,
            id,
            count,
        } => runtime.block_on(commands::watch::run(
            conn,
            &collection,
            id.as_deref(),
            count,
            ctx.json,
        )),
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    PathBuf::from(path)
}
