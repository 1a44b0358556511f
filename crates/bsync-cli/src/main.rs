#![forbid(unsafe_code)]

mod cmd;
mod output;

use clap::{Parser, Subcommand};
use output::{CliError, OutputMode, render_error, resolve_output_mode};
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "bsync: share reverse-engineering artifacts over git",
    long_about = None
)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Workspace directory. Defaults to the current directory.
    #[arg(long, global = true, value_name = "PATH")]
    workspace: Option<PathBuf>,

    /// Output format: pretty, text or json.
    #[arg(long, global = true, value_enum)]
    format: Option<OutputMode>,

    /// Shorthand for `--format json`.
    #[arg(long, global = true, hide = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    fn output_mode(&self) -> OutputMode {
        resolve_output_mode(self.format, self.json)
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        next_help_heading = "Setup",
        about = "Initialize a bsync workspace",
        long_about = "Create the workspace repository and write .bsync/config.toml.",
        after_help = "EXAMPLES:\n    # Join a shared repository as alice\n    bsync init --user alice --remote-url git@host:team/target.git\n\n    # Local-only workspace\n    bsync init --user alice"
    )]
    Init(cmd::init::InitArgs),

    #[command(
        next_help_heading = "Read",
        about = "List users publishing to the repository",
        after_help = "EXAMPLES:\n    bsync users\n    bsync users --json"
    )]
    Users,

    #[command(
        next_help_heading = "Sync",
        about = "Fetch and merge every user's branch",
        long_about = "Fetch all bsync branches and print a summary of the merged view.",
        after_help = "EXAMPLES:\n    # Merge everyone\n    bsync pull\n\n    # Merge only bob's work with your own\n    bsync pull --from bob"
    )]
    Pull(cmd::pull::PullArgs),

    #[command(
        next_help_heading = "Sync",
        about = "Publish local commits",
        long_about = "Publish commits that an earlier offline push left on the local branch."
    )]
    Push,

    #[command(
        next_help_heading = "Read",
        about = "Show branch state and other users' progress",
        after_help = "EXAMPLES:\n    bsync status\n    bsync status --offline"
    )]
    Status(cmd::status::StatusArgs),

    #[command(
        next_help_heading = "Read",
        about = "Show a user's sync history",
        after_help = "EXAMPLES:\n    # Your own branch\n    bsync log\n\n    # Last five pushes by bob\n    bsync log bob -n 5"
    )]
    Log(cmd::log::LogArgs),

    #[command(
        next_help_heading = "Read",
        about = "Show one merged artifact",
        long_about = "Show one artifact of the merged view and how conflicting edits were resolved.",
        after_help = "EXAMPLES:\n    bsync show function 0x401000\n    bsync show struct Packet --json"
    )]
    Show(cmd::show::ShowArgs),

    #[command(
        next_help_heading = "Edit",
        about = "Set a comment and push it",
        after_help = "EXAMPLES:\n    bsync comment 0x401020 \"checks the license key\""
    )]
    Comment(cmd::edit::CommentArgs),

    #[command(
        next_help_heading = "Edit",
        about = "Rename a function and push it",
        after_help = "EXAMPLES:\n    bsync rename 0x401000 parse_packet"
    )]
    Rename(cmd::edit::RenameArgs),

    #[command(
        next_help_heading = "Edit",
        about = "Delete an artifact and push the deletion",
        after_help = "EXAMPLES:\n    bsync delete comment 0x401020\n    bsync delete struct Packet"
    )]
    Delete(cmd::edit::DeleteArgs),

    #[command(
        next_help_heading = "Sync",
        about = "Sync periodically in the foreground",
        long_about = "Run the sync scheduler, printing a summary of each merged view.",
        after_help = "EXAMPLES:\n    # Pull and push every 5 seconds until interrupted\n    bsync watch --interval 5 --auto-push\n\n    # One cycle, line-delimited JSON\n    bsync watch --cycles 1 --json"
    )]
    Watch(cmd::watch::WatchArgs),
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_env("BSYNC_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if verbose || env::var("DEBUG").is_ok() {
            "bsync=debug,info"
        } else {
            "bsync=info,warn"
        })
    });

    let format = env::var("BSYNC_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
                .init();
        }
        _ => {
            registry
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .init();
        }
    }
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    let workspace = match &cli.workspace {
        Some(path) => path.clone(),
        None => env::current_dir()?,
    };
    let mode = cli.output_mode();
    debug!(workspace = %workspace.display(), ?mode, "starting");

    match &cli.command {
        Commands::Init(args) => cmd::init::run_init(args, &workspace, mode),
        Commands::Users => cmd::users::run_users(&workspace, mode),
        Commands::Pull(args) => cmd::pull::run_pull(args, &workspace, mode),
        Commands::Push => cmd::push::run_push(&workspace, mode),
        Commands::Status(args) => cmd::status::run_status(args, &workspace, mode),
        Commands::Log(args) => cmd::log::run_log(args, &workspace, mode),
        Commands::Show(args) => cmd::show::run_show(args, &workspace, mode),
        Commands::Comment(args) => cmd::edit::run_comment(args, &workspace, mode),
        Commands::Rename(args) => cmd::edit::run_rename(args, &workspace, mode),
        Commands::Delete(args) => cmd::edit::run_delete(args, &workspace, mode),
        Commands::Watch(args) => cmd::watch::run_watch(args, &workspace, mode),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let error = CliError::from_anyhow(&e);
            if render_error(cli.output_mode(), &error).is_err() {
                eprintln!("error: {e:#}");
            }
            ExitCode::FAILURE
        }
    }
}
