//! Integration tests for the admin command surfaces.

#[allow(dead_code)]
mod common;

use common::{addr, mon_addr, spawn_daemon};
use lattice::messenger::Envelope;
use lattice::msg::Message;
use lattice::osdc::OsdMapView;
use lattice::map::{FEATURE_BASE, FEATURE_OMAP};
use lattice::types::{DaemonState, EntityName};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[tokio::test]
async fn test_status_over_admin_socket() {
    let t = spawn_daemon("alpha").await;
    t.to_active().await;

    let path = t.daemon.config().with(|c| c.admin_socket_path.clone());
    let stream = tokio::net::UnixStream::connect(&path)
        .await
        .expect("connect admin socket");
    let (read_half, mut write_half) = stream.into_split();
    write_half
        .write_all(b"{\"prefix\": \"status\"}\n")
        .await
        .unwrap();

    let mut lines = BufReader::new(read_half).lines();
    let reply = lines.next_line().await.unwrap().expect("one reply line");
    let reply: Value = serde_json::from_str(&reply).unwrap();
    assert_eq!(reply["return_code"], 0);
    assert_eq!(reply["output"]["whoami"], 0);
    assert_eq!(reply["output"]["state"], "active");
    assert_eq!(reply["output"]["mdsmap_epoch"], 2);

    // Unknown commands are rejected at the socket.
    write_half
        .write_all(b"{\"prefix\": \"frobnicate\"}\n")
        .await
        .unwrap();
    let reply = lines.next_line().await.unwrap().unwrap();
    let reply: Value = serde_json::from_str(&reply).unwrap();
    assert_eq!(reply["return_code"], -libc::EINVAL as i64);
}

#[tokio::test]
async fn test_non_status_commands_require_a_rank() {
    let t = spawn_daemon("alpha").await;
    let out = t.daemon.asok_command("session ls", &json!({})).await;
    assert_eq!(out.code, -libc::EAGAIN);
    assert_eq!(out.message, "mds_not_active");

    let out = t.daemon.asok_command("status", &json!({})).await;
    assert_eq!(out.code, 0);
    assert_eq!(out.output["whoami"], -1);
}

#[tokio::test]
async fn test_flush_journal_twice_is_idempotent() {
    let t = spawn_daemon("alpha").await;
    t.to_active().await;

    t.daemon
        .with_core_mut(|core| {
            core.journal.submit_event(128);
        })
        .await;

    let (code, message) = t.daemon.command_flush_journal().await;
    assert_eq!(code, 0, "first flush failed: {}", message);
    let first_trim = t.daemon.inspect(|core| core.journal.trim_pos()).await;

    let (code, message) = t.daemon.command_flush_journal().await;
    assert_eq!(code, 0, "second flush failed: {}", message);
    let second_trim = t.daemon.inspect(|core| core.journal.trim_pos()).await;
    assert!(second_trim >= first_trim);
}

#[tokio::test]
async fn test_flush_journal_readonly_fs() {
    let t = spawn_daemon("alpha").await;
    t.to_active().await;

    let out = t.daemon.asok_command("force_readonly", &json!({})).await;
    assert_eq!(out.code, 0);

    let (code, _) = t.daemon.command_flush_journal().await;
    assert_eq!(code, -libc::EROFS);
}

#[tokio::test]
async fn test_flush_journal_noop_when_not_active() {
    let t = spawn_daemon("alpha").await;
    t.deliver_map(&t.solo_map(1, DaemonState::Replay)).await;
    let (code, _) = t.daemon.command_flush_journal().await;
    assert_eq!(code, 0);
}

#[tokio::test]
async fn test_session_evict_blocks_until_committed() {
    let t = spawn_daemon("alpha").await;
    t.to_active().await;
    t.client_conn(42, Some("allow rw")).await;

    let sessions_before = t.daemon.inspect(|core| core.sessions.len()).await;
    assert_eq!(sessions_before, 1);

    let out = t
        .daemon
        .asok_command("session evict", &json!({"client_id": "42"}))
        .await;
    assert_eq!(out.code, 0);

    t.daemon
        .inspect(|core| {
            assert!(core.sessions.get(&EntityName::client(42)).is_none());
            assert_eq!(core.sessions.evictions(), 1);
        })
        .await;

    // Evicting again reports the missing session.
    let out = t
        .daemon
        .asok_command("session evict", &json!({"client_id": "42"}))
        .await;
    assert_eq!(out.code, -libc::ENOENT);
}

#[tokio::test]
async fn test_session_evict_rejects_malformed_ids() {
    let t = spawn_daemon("alpha").await;
    t.to_active().await;
    t.client_conn(0, Some("allow rw")).await;

    // A non-numeric id must not silently evict session 0.
    let out = t
        .daemon
        .asok_command("session evict", &json!({"client_id": "bogus"}))
        .await;
    assert_eq!(out.code, -libc::EINVAL);
    assert_eq!(t.daemon.inspect(|core| core.sessions.len()).await, 1);
}

#[tokio::test]
async fn test_session_ls_lists_clients() {
    let t = spawn_daemon("alpha").await;
    t.to_active().await;
    t.client_conn(7, Some("allow rw")).await;
    t.client_conn(8, Some("allow rw")).await;

    let out = t.daemon.asok_command("session ls", &json!({})).await;
    assert_eq!(out.code, 0);
    let sessions = out.output["sessions"].as_array().unwrap();
    assert_eq!(sessions.len(), 2);
    let mut ids: Vec<u64> = sessions
        .iter()
        .map(|s| s["id"].as_u64().unwrap())
        .collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![7, 8]);
}

#[tokio::test]
async fn test_export_dir_rejects_own_rank() {
    let t = spawn_daemon("alpha").await;
    t.to_active().await;
    t.daemon
        .with_core_mut(|core| core.cache.add_dir("/a", 100, true))
        .await;

    // Exporting to ourselves is not a migration.
    let out = t
        .daemon
        .asok_command("export dir", &json!({"path": "/a", "rank": 0}))
        .await;
    assert_eq!(out.code, -libc::ENOENT);
    t.daemon
        .inspect(|core| assert!(core.migrator.exports().is_empty()))
        .await;

    // A down or unknown rank is rejected the same way.
    let out = t
        .daemon
        .asok_command("export dir", &json!({"path": "/a", "rank": 5}))
        .await;
    assert_eq!(out.code, -libc::ENOENT);
}

#[tokio::test]
async fn test_export_dir_to_live_peer() {
    let t = spawn_daemon("alpha").await;
    t.deliver_map(&t.solo_map(1, DaemonState::Creating)).await;
    t.deliver_map(&t.solo_map(2, DaemonState::Active)).await;

    let map = lattice::map::MdsMapBuilder::new(3, t.monitor.fsid())
        .compat(lattice::map::CompatSet::new(FEATURE_BASE | FEATURE_OMAP))
        .daemon(t.own_info(0, DaemonState::Active))
        .daemon(common::peer_info(9000, "beta", 1, DaemonState::Active, 6801))
        .build();
    t.deliver_map(&map).await;

    t.daemon
        .with_core_mut(|core| core.cache.add_dir("/a", 100, true))
        .await;

    let out = t
        .daemon
        .asok_command("export dir", &json!({"path": "/a", "rank": 1}))
        .await;
    assert_eq!(out.code, 0);
    t.daemon
        .inspect(|core| {
            assert_eq!(core.migrator.exports().len(), 1);
            assert_eq!(core.migrator.exports()[0].ino, 100);
        })
        .await;
}

#[tokio::test]
async fn test_dirfrag_split_ls_merge() {
    let t = spawn_daemon("alpha").await;
    t.to_active().await;
    t.daemon
        .with_core_mut(|core| core.cache.add_dir("/work", 100, true))
        .await;

    let out = t
        .daemon
        .asok_command(
            "dirfrag split",
            &json!({"path": "/work", "frag": "0/0", "bits": 2}),
        )
        .await;
    assert_eq!(out.code, 0, "{}", out.message);

    let out = t
        .daemon
        .asok_command("dirfrag ls", &json!({"path": "/work"}))
        .await;
    assert_eq!(out.code, 0);
    assert_eq!(out.output["frags"].as_array().unwrap().len(), 4);

    let out = t
        .daemon
        .asok_command("dirfrag merge", &json!({"path": "/work", "frag": "0/0"}))
        .await;
    assert_eq!(out.code, 0, "{}", out.message);

    let out = t
        .daemon
        .asok_command("dirfrag ls", &json!({"path": "/work"}))
        .await;
    assert_eq!(out.output["frags"].as_array().unwrap().len(), 1);

    // Splitting by zero bits is rejected.
    let out = t
        .daemon
        .asok_command(
            "dirfrag split",
            &json!({"path": "/work", "frag": "0/0", "bits": 0}),
        )
        .await;
    assert_eq!(out.code, -libc::EINVAL);
}

#[tokio::test]
async fn test_scrub_and_flush_path() {
    let t = spawn_daemon("alpha").await;
    t.to_active().await;
    t.daemon
        .with_core_mut(|core| core.cache.add_dir("/data", 100, true))
        .await;

    let out = t
        .daemon
        .asok_command("scrub_path", &json!({"path": "/data"}))
        .await;
    assert_eq!(out.code, 0);

    let out = t
        .daemon
        .asok_command("flush_path", &json!({"path": "/missing"}))
        .await;
    assert_eq!(out.code, -libc::ENOENT);
    assert_eq!(out.output["return_code"], -libc::ENOENT as i64);
}

#[tokio::test]
async fn test_dump_cache_to_file() {
    let t = spawn_daemon("alpha").await;
    t.to_active().await;

    let dir = tempfile::tempdir().unwrap();
    let dump_path = dir.path().join("cache.json");
    let out = t
        .daemon
        .asok_command(
            "dump cache",
            &json!({"path": dump_path.to_str().unwrap()}),
        )
        .await;
    assert_eq!(out.code, 0);
    let dumped: Value =
        serde_json::from_slice(&std::fs::read(&dump_path).unwrap()).unwrap();
    assert!(dumped["num_inodes"].as_u64().unwrap() >= 1);

    // Without a path the dump lands in the reply.
    let out = t.daemon.asok_command("dump cache", &json!({})).await;
    assert_eq!(out.code, 0);
    assert!(out.output["num_inodes"].as_u64().unwrap() >= 1);
}

#[tokio::test]
async fn test_osdmap_barrier_command() {
    let t = spawn_daemon("alpha").await;
    t.to_active().await;

    t.daemon.object_client().install_map(OsdMapView {
        epoch: 7,
        up_nodes: 3,
        features: FEATURE_BASE | FEATURE_OMAP,
    });

    let out = t
        .daemon
        .asok_command("osdmap barrier", &json!({"target_epoch": 7}))
        .await;
    assert_eq!(out.code, 0);
    assert_eq!(t.daemon.inspect(|c| c.osd_epoch_barrier()).await, 7);

    // An older target still succeeds but cannot lower the barrier.
    let out = t
        .daemon
        .asok_command("osdmap barrier", &json!({"target_epoch": 4}))
        .await;
    assert_eq!(out.code, 0);
    assert_eq!(t.daemon.inspect(|c| c.osd_epoch_barrier()).await, 7);

    let out = t.daemon.asok_command("osdmap barrier", &json!({})).await;
    assert_eq!(out.code, -libc::EINVAL);
}

#[tokio::test]
async fn test_ops_dumps() {
    let t = spawn_daemon("alpha").await;
    t.to_active().await;

    let id = t.daemon.op_tracker().start_op("client_request(mkdir)");
    let out = t.daemon.asok_command("ops", &json!({})).await;
    assert_eq!(out.code, 0);
    assert_eq!(out.output["num_ops"], 1);

    t.daemon.op_tracker().finish_op(id);
    let out = t.daemon.asok_command("dump_historic_ops", &json!({})).await;
    assert_eq!(out.output["num_ops"], 1);
}

async fn tell(t: &common::TestDaemon, conn: &std::sync::Arc<lattice::messenger::Connection>, tid: u64, cmdmap: Value) {
    t.daemon
        .dispatch(Envelope {
            from: EntityName::client(42),
            peer_addr: addr(50042),
            conn: Some(conn.clone()),
            msg: Message::Command { tid, cmdmap },
        })
        .await;
}

fn last_reply(conn: &lattice::messenger::Connection) -> (u64, i32, String, Vec<u8>) {
    let replies = conn.take_outbox();
    match replies.into_iter().last() {
        Some(Message::CommandReply {
            tid,
            code,
            message,
            data,
        }) => (tid, code, message, data),
        other => panic!("expected a command reply, got {:?}", other),
    }
}

#[tokio::test]
async fn test_tell_requires_tell_capability() {
    let t = spawn_daemon("alpha").await;
    t.to_active().await;

    // Legacy caps permit fs ops but deny `tell`.
    let conn = t.client_conn(42, None).await;
    tell(&t, &conn, 1, json!({"prefix": "session kill", "session_id": 42})).await;
    let (tid, code, message, _) = last_reply(&conn);
    assert_eq!(tid, 1);
    assert_eq!(code, -libc::EPERM);
    assert_eq!(message, "permission denied");
}

#[tokio::test]
async fn test_tell_session_kill() {
    let t = spawn_daemon("alpha").await;
    t.to_active().await;

    let admin = t.client_conn(42, Some("allow *")).await;
    t.client_conn(77, Some("allow rw")).await;

    tell(&t, &admin, 2, json!({"prefix": "session kill", "session_id": 77})).await;
    let (_, code, _, _) = last_reply(&admin);
    assert_eq!(code, 0);
    assert!(t
        .daemon
        .inspect(|core| core.sessions.get(&EntityName::client(77)).is_none())
        .await);

    // Unknown session.
    tell(&t, &admin, 3, json!({"prefix": "session kill", "session_id": 77})).await;
    let (_, code, message, _) = last_reply(&admin);
    assert_eq!(code, -libc::ENOENT);
    assert!(message.contains("77"));

    // Malformed id is rejected, not coerced to session 0.
    tell(&t, &admin, 4, json!({"prefix": "session kill", "session_id": "zero"})).await;
    let (_, code, _, _) = last_reply(&admin);
    assert_eq!(code, -libc::EINVAL);
}

#[tokio::test]
async fn test_tell_injectargs_updates_tracked_keys() {
    let t = spawn_daemon("alpha").await;
    t.to_active().await;
    let admin = t.client_conn(42, Some("allow *")).await;

    tell(
        &t,
        &admin,
        5,
        json!({"prefix": "injectargs", "injected_args": ["mds_op_log_threshold=11"]}),
    )
    .await;
    let (_, code, message, _) = last_reply(&admin);
    assert_eq!(code, 0, "{}", message);
    assert_eq!(t.daemon.config().with(|c| c.op.log_threshold), 11);

    // Untracked keys are refused.
    tell(
        &t,
        &admin,
        6,
        json!({"prefix": "injectargs", "injected_args": ["mds_cache_size=1"]}),
    )
    .await;
    let (_, code, _, _) = last_reply(&admin);
    assert_eq!(code, -libc::EINVAL);
}

#[tokio::test]
async fn test_tell_get_command_descriptions() {
    let t = spawn_daemon("alpha").await;
    t.to_active().await;
    let admin = t.client_conn(42, Some("allow *")).await;

    tell(&t, &admin, 7, json!({"prefix": "get_command_descriptions"})).await;
    let (_, code, _, data) = last_reply(&admin);
    assert_eq!(code, 0);
    let desc: Value = serde_json::from_slice(&data).unwrap();
    let cmds = desc["command_descriptions"].as_array().unwrap();
    assert!(cmds.iter().any(|c| c["cmd"] == "respawn"));
}

#[tokio::test]
async fn test_tell_exit_schedules_delayed_suicide() {
    let t = common::spawn_daemon_with("alpha", |c| {
        c.admin_grace = std::time::Duration::from_millis(150);
    })
    .await;
    t.to_active().await;
    let admin = t.client_conn(42, Some("allow *")).await;

    tell(&t, &admin, 8, json!({"prefix": "exit"})).await;
    // The reply is sent before the daemon goes away.
    let (_, code, message, _) = last_reply(&admin);
    assert_eq!(code, 0);
    assert_eq!(message, "Exiting...");
    assert!(!t.daemon.is_stopping());

    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    assert!(t.daemon.is_stopping());
    assert_eq!(t.daemon.lifecycle().suicides(), 1);
}

#[tokio::test]
async fn test_tell_heap_unsupported_without_profiler() {
    let t = spawn_daemon("alpha").await;
    t.to_active().await;
    let admin = t.client_conn(42, Some("allow *")).await;

    tell(&t, &admin, 9, json!({"prefix": "heap", "heapcmd": "stats"})).await;
    let (_, code, message, _) = last_reply(&admin);
    #[cfg(not(feature = "heap-profiler"))]
    {
        assert_eq!(code, -libc::EOPNOTSUPP);
        assert!(message.contains("profiling allocator"));
    }
    #[cfg(feature = "heap-profiler")]
    {
        assert_eq!(code, 0);
        let _ = message;
    }
}

#[tokio::test]
async fn test_legacy_command_bounds_checks() {
    let t = spawn_daemon("alpha").await;
    t.to_active().await;
    t.client_conn(42, Some("allow rw")).await;

    // Truncated `session kill` must not panic or evict anything.
    t.daemon
        .dispatch(Envelope::bare(
            EntityName::mon(0),
            mon_addr(),
            Message::MonCommand {
                args: vec!["session".to_string(), "kill".to_string()],
            },
        ))
        .await;
    assert_eq!(t.daemon.inspect(|core| core.sessions.len()).await, 1);

    // Well-formed legacy kill works.
    t.daemon
        .dispatch(Envelope::bare(
            EntityName::mon(0),
            mon_addr(),
            Message::MonCommand {
                args: vec![
                    "session".to_string(),
                    "kill".to_string(),
                    "42".to_string(),
                ],
            },
        ))
        .await;
    assert_eq!(t.daemon.inspect(|core| core.sessions.len()).await, 0);
}

#[tokio::test]
async fn test_tick_runs_maintenance_while_active() {
    let t = spawn_daemon("alpha").await;
    t.to_active().await;

    t.daemon.tick().await;
    t.daemon
        .inspect(|core| {
            assert_eq!(core.cache.counters().trims, 1);
            assert_eq!(core.cache.counters().lease_trims, 1);
            assert_eq!(core.locker.ticks(), 1);
            assert_eq!(core.balancer.ticks(), 1);
            assert_eq!(core.migrator.stale_scans(), 1);
        })
        .await;
}
