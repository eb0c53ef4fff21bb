//! Checkout helper: the subprocess half of parallel checkout.
//!
//! Speaks the packet-line protocol on stdin/stdout, reads blobs from the
//! `--odb` directory, and writes worktree files relative to its working
//! directory. Exit code 0 on a clean end of stream, 1 on a protocol error.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use log::LevelFilter;
use log::error;

use gitwt::DefaultConverter;
use gitwt::checkout::ServerConfig;
use gitwt::checkout::helper;
use gitwt::odb::BlobDir;

#[derive(Parser)]
#[command(version, about = "parallel checkout helper")]
struct Args {
    /// Identity of this helper within the pool, used only for tracing.
    #[arg(long, default_value_t = 0)]
    child: u32,

    /// How many blobs may be held in memory at once.
    #[arg(long, default_value_t = 16)]
    preload: usize,

    /// Writer thread pool size.
    #[arg(long, default_value_t = 2)]
    writers: usize,

    /// Start with an unbounded write watermark.
    #[arg(long)]
    automatic: bool,

    /// Blob directory to read objects from.
    #[arg(long)]
    odb: PathBuf,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let child = args.child;
    let mut logger = env_logger::Builder::from_default_env();
    if std::env::var_os("GIT_TEST_CHECKOUT_HELPER_VERBOSE").is_some() {
        logger.filter_level(LevelFilter::Debug);
    }
    // Replies own stdout; all tracing goes to stderr with the helper's
    // pool identity up front.
    logger
        .format(move |buf, record| {
            use std::io::Write;
            writeln!(buf, "[helper {child}] {}: {}", record.level(), record.args())
        })
        .init();

    let config = ServerConfig {
        preload_limit: args.preload.max(1),
        writers: args.writers.max(1),
        start_auto: args.automatic,
    };
    let store = Arc::new(BlobDir::new(&args.odb));

    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let mut input = stdin.lock();
    let mut output = stdout.lock();

    match helper::serve(&mut input, &mut output, config, store, Arc::new(DefaultConverter)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("protocol error: {err}");
            ExitCode::FAILURE
        }
    }
}
