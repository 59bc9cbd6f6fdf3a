//! Runs a single-replica key-value service with an interactive console.
//!
//! The replica sits on a [`LocalLog`], so every write commits as soon as it
//! is submitted. With `--data-dir` the log and snapshots are kept on disk
//! and a restarted node picks up where it left off.
//!
//! ```bash
//! cargo run --bin node -- --data-dir /tmp/kv --max-raft-state 4096
//! kv> put x 1
//! kv> append x 2
//! kv> get x
//! ```
//!
//! Logs go to stderr; set `RUST_LOG=raft_kv_service=debug` to watch the
//! apply loop.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use rand::Rng;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::timeout;
use tracing::{info, warn};

use raft_kv_service::config::ServerConfig;
use raft_kv_service::error::KvError;
use raft_kv_service::local_log::LocalLog;
use raft_kv_service::persister::{FilePersister, MemoryPersister, Persister};
use raft_kv_service::protocol::{ConsoleCommand, HELP};
use raft_kv_service::server::{GetArgs, KvServer, PutAppendArgs, PutAppendOp};

#[derive(Parser, Debug)]
#[command(author, version, about = "Run a key-value replica with an interactive console")]
struct Args {
    /// Directory for the persisted log and snapshots. Kept in memory when omitted.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Snapshot once the persisted log grows past this many bytes.
    #[arg(long)]
    max_raft_state: Option<usize>,

    /// How long a request waits for its entry to commit.
    #[arg(long, default_value_t = 500)]
    reply_timeout_ms: u64,

    /// Client identity used for deduplication. Random when omitted. Reusing
    /// an id across restarts continues its sequence from the restored state.
    #[arg(long)]
    client_id: Option<i64>,
}

/// How long startup waits for the log suffix to replay.
const REPLAY_TIMEOUT: Duration = Duration::from_secs(10);

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

struct Console {
    server: Arc<KvServer<LocalLog>>,
    log: Arc<LocalLog>,
    client_id: i64,
    last_seq: i64,
}

impl Console {
    fn next_seq(&mut self) -> i64 {
        self.last_seq += 1;
        self.last_seq
    }

    async fn execute(&mut self, command: ConsoleCommand) {
        match command {
            ConsoleCommand::Get { key } => {
                let args = GetArgs {
                    key: key.clone(),
                    client_id: self.client_id,
                    seq_id: self.next_seq(),
                };
                match self.server.get(args).await {
                    Ok(value) => println!("{key} = {value:?}"),
                    Err(KvError::NoKey) => println!("{key} not found"),
                    Err(err) => print_error(err),
                }
            }
            ConsoleCommand::Put { key, value } => self.write(key, value, PutAppendOp::Put).await,
            ConsoleCommand::Append { key, value } => {
                self.write(key, value, PutAppendOp::Append).await
            }
            ConsoleCommand::Status => self.print_status(),
            ConsoleCommand::Campaign => {
                self.log.set_leader(true);
                println!("leading term {}", self.server.status().term);
            }
            ConsoleCommand::StepDown => {
                self.log.set_leader(false);
                println!("stepped down; writes are refused until CAMPAIGN");
            }
            ConsoleCommand::Help => println!("{HELP}"),
            ConsoleCommand::Exit => {}
        }
    }

    async fn write(&mut self, key: String, value: String, op: PutAppendOp) {
        let args = PutAppendArgs {
            key,
            value,
            op,
            client_id: self.client_id,
            seq_id: self.next_seq(),
        };
        match self.server.put_append(args).await {
            Ok(()) => println!("OK"),
            Err(err) => print_error(err),
        }
    }

    fn print_status(&self) {
        let status = self.server.status();
        let role = if status.is_leader { "leader" } else { "follower" };
        println!(
            "client {} | term {} | {role} | applied {} | snapshot {} | log entries {} | pending {}",
            self.client_id,
            status.term,
            status.last_applied,
            self.log.snapshot_index(),
            self.log.retained_entries(),
            status.pending,
        );
        for (key, value) in &status.store {
            println!("  {key} = {value:?}");
        }
    }
}

fn print_error(err: KvError) {
    if err.is_retryable() {
        println!("error: {err} (safe to retry)");
    } else {
        println!("error: {err}");
    }
}

fn prompt() -> Result<()> {
    let mut stdout = std::io::stdout();
    write!(stdout, "kv> ")?;
    stdout.flush()?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let persister: Arc<dyn Persister> = match &args.data_dir {
        Some(dir) => Arc::new(
            FilePersister::open(dir)
                .with_context(|| format!("failed to open data dir {}", dir.display()))?,
        ),
        None => Arc::new(MemoryPersister::new()),
    };

    let mut config =
        ServerConfig::default().with_reply_timeout(Duration::from_millis(args.reply_timeout_ms));
    if let Some(bytes) = args.max_raft_state {
        config = config.with_max_raft_state(bytes);
    }

    let (log, apply_rx) = LocalLog::open(Arc::clone(&persister))?;
    let (server, apply_loop) =
        KvServer::start(Arc::clone(&log), apply_rx, persister.as_ref(), config)?;

    // Sequence numbers must continue past whatever this client already
    // wrote, so wait for the persisted suffix to be applied first.
    timeout(REPLAY_TIMEOUT, server.wait_applied(log.commit_index()))
        .await
        .map_err(|_| anyhow!("log replay did not finish within {REPLAY_TIMEOUT:?}"))?;

    let client_id = args
        .client_id
        .unwrap_or_else(|| rand::thread_rng().gen_range(1..i64::MAX));
    let last_seq = server.last_seq(client_id).unwrap_or(0);
    info!(client_id, last_seq, data_dir = ?args.data_dir, "node ready");
    println!("{HELP}");

    let mut console = Console {
        server: Arc::clone(&server),
        log,
        client_id,
        last_seq,
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    prompt()?;
    while let Some(line) = lines.next_line().await? {
        if !line.trim().is_empty() {
            match ConsoleCommand::parse(&line) {
                Ok(ConsoleCommand::Exit) => break,
                Ok(command) => console.execute(command).await,
                Err(err) => println!("error: {err}"),
            }
        }
        if server.is_killed() {
            warn!("replica stopped, leaving console");
            break;
        }
        prompt()?;
    }

    server.kill();
    apply_loop.await.context("apply loop panicked")??;
    Ok(())
}
