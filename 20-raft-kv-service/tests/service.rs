//! Integration tests for the request path: dispatcher, apply loop and dedup
//! table working together on top of a single-replica log.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use raft_kv_service::command::Op;
use raft_kv_service::config::ServerConfig;
use raft_kv_service::error::KvError;
use raft_kv_service::local_log::LocalLog;
use raft_kv_service::persister::MemoryPersister;
use raft_kv_service::server::{GetArgs, KvServer, PutAppendArgs, PutAppendOp};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};

/// One replica plus the handles tests poke at.
struct Replica {
    server: Arc<KvServer<LocalLog>>,
    log: Arc<LocalLog>,
    apply_loop: JoinHandle<Result<()>>,
}

impl Replica {
    fn start(config: ServerConfig) -> Result<Self> {
        let persister = MemoryPersister::new();
        let (log, apply_rx) = LocalLog::open(Arc::new(persister.clone()))?;
        let (server, apply_loop) = KvServer::start(Arc::clone(&log), apply_rx, &persister, config)?;
        Ok(Self {
            server,
            log,
            apply_loop,
        })
    }

    async fn get(&self, client_id: i64, seq_id: i64, key: &str) -> Result<String, KvError> {
        self.server
            .get(GetArgs {
                key: key.to_string(),
                client_id,
                seq_id,
            })
            .await
    }

    async fn put(&self, client_id: i64, seq_id: i64, key: &str, value: &str) -> Result<(), KvError> {
        self.write(client_id, seq_id, key, value, PutAppendOp::Put).await
    }

    async fn append(
        &self,
        client_id: i64,
        seq_id: i64,
        key: &str,
        value: &str,
    ) -> Result<(), KvError> {
        self.write(client_id, seq_id, key, value, PutAppendOp::Append)
            .await
    }

    async fn write(
        &self,
        client_id: i64,
        seq_id: i64,
        key: &str,
        value: &str,
        op: PutAppendOp,
    ) -> Result<(), KvError> {
        self.server
            .put_append(PutAppendArgs {
                key: key.to_string(),
                value: value.to_string(),
                op,
                client_id,
                seq_id,
            })
            .await
    }

    async fn wait_applied(&self, index: u64) -> Result<()> {
        timeout(Duration::from_secs(2), self.server.wait_applied(index))
            .await
            .map_err(|_| anyhow!("timeout waiting for index {index} to apply"))
    }
}

#[tokio::test]
async fn put_append_get_scenario() -> Result<()> {
    let replica = Replica::start(ServerConfig::default())?;

    replica.put(7, 1, "x", "1").await?;
    replica.append(7, 2, "x", "2").await?;
    assert_eq!(replica.get(7, 3, "x").await?, "12");

    // A late retry of seq 1 is acknowledged but must not reset the key.
    replica.put(7, 1, "x", "1").await?;
    assert_eq!(replica.get(7, 4, "x").await?, "12");
    Ok(())
}

#[tokio::test]
async fn retried_append_takes_effect_once() -> Result<()> {
    let replica = Replica::start(ServerConfig::default())?;

    replica.append(3, 1, "k", "a").await?;
    replica.append(3, 1, "k", "a").await?;
    replica.append(3, 2, "k", "b").await?;
    replica.append(3, 2, "k", "b").await?;

    assert_eq!(replica.get(3, 3, "k").await?, "ab");
    Ok(())
}

#[tokio::test]
async fn missing_key_and_empty_value_are_different() -> Result<()> {
    let replica = Replica::start(ServerConfig::default())?;

    assert_eq!(replica.get(1, 1, "blank").await, Err(KvError::NoKey));
    replica.put(1, 2, "blank", "").await?;
    assert_eq!(replica.get(1, 3, "blank").await?, "");
    Ok(())
}

#[tokio::test]
async fn follower_refuses_without_submitting() -> Result<()> {
    let replica = Replica::start(ServerConfig::default())?;
    replica.put(1, 1, "k", "v").await?;
    let before = replica.log.last_index();

    replica.log.set_leader(false);
    assert_eq!(replica.put(1, 2, "k", "w").await, Err(KvError::WrongLeader));
    assert_eq!(replica.get(1, 3, "k").await, Err(KvError::WrongLeader));
    assert_eq!(replica.log.last_index(), before);

    replica.log.set_leader(true);
    assert_eq!(replica.get(1, 4, "k").await?, "v");
    Ok(())
}

#[tokio::test]
async fn timeout_then_late_commit_is_harmless() -> Result<()> {
    let config = ServerConfig::default().with_reply_timeout(Duration::from_millis(50));
    let replica = Replica::start(config)?;

    replica.log.hold_commits();
    assert_eq!(replica.put(5, 1, "x", "late").await, Err(KvError::Timeout));
    assert_eq!(replica.server.status().pending, 0);

    // The entry still commits; nobody is waiting for it any more.
    replica.log.release_commits();
    replica.wait_applied(1).await?;
    assert_eq!(replica.server.status().pending, 0);

    // The client retries with the same seq: acknowledged, applied once.
    replica.put(5, 1, "x", "late").await?;
    assert_eq!(replica.get(5, 2, "x").await?, "late");
    Ok(())
}

#[tokio::test]
async fn different_op_at_our_index_is_not_success() -> Result<()> {
    let replica = Arc::new(Replica::start(ServerConfig::default())?);
    replica.log.hold_commits();

    let caller = {
        let replica = Arc::clone(&replica);
        tokio::spawn(async move { replica.put(1, 1, "x", "mine").await })
    };

    let deadline = Instant::now() + Duration::from_secs(2);
    while replica.log.last_index() < 1 {
        if Instant::now() > deadline {
            bail!("put was never submitted");
        }
        sleep(Duration::from_millis(5)).await;
    }

    // A new leader commits someone else's op at index 1.
    let usurper = Op::put(2, 1, "x", "theirs").encode()?;
    assert!(replica.log.replace_held(1, usurper));
    replica.log.release_commits();

    assert_eq!(caller.await?, Err(KvError::WrongLeader));
    assert_eq!(replica.get(2, 2, "x").await?, "theirs");
    assert_eq!(replica.server.status().pending, 0);
    Ok(())
}

#[tokio::test]
async fn killed_replica_refuses_work_and_stops_applying() -> Result<()> {
    let replica = Replica::start(ServerConfig::default())?;
    replica.put(1, 1, "k", "v").await?;

    replica.server.kill();
    assert!(replica.server.is_killed());
    assert_eq!(replica.get(1, 2, "k").await, Err(KvError::WrongLeader));
    assert_eq!(replica.put(1, 3, "k", "w").await, Err(KvError::WrongLeader));

    replica.apply_loop.await??;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_clients_each_apply_exactly_once() -> Result<()> {
    const CLIENTS: i64 = 10;
    const WRITES: i64 = 20;

    let replica = Arc::new(Replica::start(ServerConfig::default())?);
    let mut tasks = Vec::new();
    for client_id in 1..=CLIENTS {
        let replica = Arc::clone(&replica);
        tasks.push(tokio::spawn(async move {
            for seq_id in 1..=WRITES {
                let jitter = rand::random::<u64>() % 3;
                sleep(Duration::from_millis(jitter)).await;
                let token = format!("[{client_id}:{seq_id}]");
                // Retry like a client library would, reusing the seq.
                loop {
                    match replica.append(client_id, seq_id, "shared", &token).await {
                        Ok(()) => break,
                        Err(err) if err.is_retryable() => continue,
                        Err(err) => return Err(err),
                    }
                }
            }
            Ok(())
        }));
    }
    for task in tasks {
        task.await??;
    }

    let value = replica.get(0, 1, "shared").await?;
    for client_id in 1..=CLIENTS {
        let mut last_position = 0;
        for seq_id in 1..=WRITES {
            let token = format!("[{client_id}:{seq_id}]");
            assert_eq!(value.matches(&token).count(), 1, "{token} must appear once");
            // Each client's writes land in the order it issued them.
            let position = value.find(&token).unwrap_or_default();
            assert!(position >= last_position);
            last_position = position;
        }
    }
    assert_eq!(replica.server.status().pending, 0);
    Ok(())
}
