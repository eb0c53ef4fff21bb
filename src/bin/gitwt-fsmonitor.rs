//! Filesystem-monitor daemon CLI.
//!
//! `run` keeps the daemon in the foreground; `start` spawns it in the
//! background; the remaining sub-commands talk to a running daemon over its
//! socket.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use clap::Subcommand;
use log::error;

use gitwt::monitor::daemon;
use gitwt::monitor::daemon::MonitorSettings;
use gitwt::monitor::daemon::QueryReply;

#[derive(Parser)]
#[command(version, about = "filesystem monitor daemon")]
struct Args {
    /// Root of the working directory to watch.
    #[arg(long, default_value = ".", global = true)]
    worktree: PathBuf,

    /// IPC worker threads (fsmonitor.ipcThreads).
    #[arg(long, default_value_t = 8, global = true)]
    ipc_threads: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Spawn a background daemon unless one is already listening.
    Start,
    /// Run the daemon in the foreground.
    Run,
    /// Ask a running daemon to quit and wait for its socket to vanish.
    Stop,
    /// Send a token and print the paths changed since.
    Query {
        /// The token from a previous response.
        token: String,
    },
    /// Query with the token stored in the persisted state file.
    QueryIndex,
    /// Force a session resync; afterwards every client rescans once.
    Flush,
    /// Exit 0 iff a daemon is listening.
    IsRunning,
    /// Exit 0 iff this platform has a watcher backend.
    IsSupported,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    let settings = MonitorSettings {
        worktree: args.worktree,
        ipc_threads: args.ipc_threads,
    };

    let result = match args.command {
        Command::Start => daemon::start(&settings),
        Command::Run => daemon::run(&settings),
        Command::Stop => match daemon::stop(&settings) {
            Ok(true) => Ok(()),
            Ok(false) => {
                eprintln!("no daemon is running");
                Ok(())
            }
            Err(err) => Err(err),
        },
        Command::Query { token } => daemon::query(&settings, &token).map(print_reply),
        Command::QueryIndex => daemon::query_index(&settings).map(print_reply),
        Command::Flush => daemon::flush(&settings).map(print_reply),
        Command::IsRunning => {
            return if daemon::is_running(&settings) {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            };
        }
        Command::IsSupported => {
            return if daemon::is_supported() {
                ExitCode::SUCCESS
            } else {
                eprintln!("no watcher backend for this platform");
                ExitCode::FAILURE
            };
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn print_reply(reply: QueryReply) {
    println!("token: {}", reply.token);
    for path in &reply.paths {
        println!("{path}");
    }
    if reply.trivial {
        println!("/");
    }
}
