//! Admin command surface.
//!
//! Two parallel surfaces: the local admin socket (newline-delimited JSON
//! over a Unix socket, synchronous per command) and the monitor command
//! channel (cmdmap messages replied to with `(code, message, data)`, plus
//! the legacy positional form). Long operations release the controller
//! lock while they wait and re-check the stopping latch on every wake.

use super::{FatalAction, MdsCore, MdsDaemon};
use crate::error::{LatticeError, Result};
use crate::messenger::Connection;
use crate::msg::Message;
use crate::types::{EntityName, FragId, InodeId, MdsRank};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// One registered admin command.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub signature: String,
    pub help: String,
}

/// Registry of admin-socket command hooks.
///
/// Exactly one hook may exist per command string; a second registration
/// fails.
pub struct CommandRegistry {
    commands: Mutex<BTreeMap<String, CommandSpec>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self {
            commands: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn register(
        &self,
        command: &str,
        signature: &str,
        help: &str,
    ) -> Result<()> {
        let mut commands = self.commands.lock();
        if commands.contains_key(command) {
            return Err(LatticeError::CommandExists(command.to_string()));
        }
        commands.insert(
            command.to_string(),
            CommandSpec {
                signature: signature.to_string(),
                help: help.to_string(),
            },
        );
        Ok(())
    }

    pub fn registered(&self, command: &str) -> bool {
        self.commands.lock().contains_key(command)
    }

    pub fn len(&self) -> usize {
        self.commands.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.lock().is_empty()
    }

    pub fn unregister_all(&self) {
        self.commands.lock().clear();
    }

    pub fn descriptions(&self) -> Value {
        let commands = self.commands.lock();
        let list: Vec<Value> = commands
            .iter()
            .map(|(name, spec)| {
                json!({
                    "cmd": name,
                    "signature": spec.signature,
                    "help": spec.help,
                })
            })
            .collect();
        json!({ "command_descriptions": list })
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Register every admin-socket command.
pub fn register_commands(registry: &CommandRegistry) -> Result<()> {
    registry.register("status", "status", "high-level status of the MDS")?;
    registry.register(
        "dump_ops_in_flight",
        "dump_ops_in_flight",
        "show the ops currently in flight",
    )?;
    registry.register("ops", "ops", "show the ops currently in flight")?;
    registry.register(
        "dump_historic_ops",
        "dump_historic_ops",
        "show slowest recent ops",
    )?;
    registry.register(
        "scrub_path",
        "scrub_path name=path,type=string",
        "scrub an inode and output results",
    )?;
    registry.register(
        "flush_path",
        "flush_path name=path,type=string",
        "flush an inode (and its dirfrags)",
    )?;
    registry.register(
        "export dir",
        "export dir name=path,type=string name=rank,type=int",
        "migrate a subtree to named MDS",
    )?;
    registry.register(
        "dump cache",
        "dump cache name=path,type=string,req=false",
        "dump metadata cache (optionally to a file)",
    )?;
    registry.register(
        "session evict",
        "session evict name=client_id,type=string",
        "evict a client session",
    )?;
    registry.register(
        "osdmap barrier",
        "osdmap barrier name=target_epoch,type=int",
        "wait until the MDS has this object-store map epoch",
    )?;
    registry.register("session ls", "session ls", "enumerate connected clients")?;
    registry.register(
        "flush journal",
        "flush journal",
        "flush the journal to the backing store",
    )?;
    registry.register(
        "force_readonly",
        "force_readonly",
        "force the MDS to read-only mode",
    )?;
    registry.register("get subtrees", "get subtrees", "return the subtree map")?;
    registry.register(
        "dirfrag split",
        "dirfrag split name=path,type=string name=frag,type=string name=bits,type=int",
        "fragment directory by path",
    )?;
    registry.register(
        "dirfrag merge",
        "dirfrag merge name=path,type=string name=frag,type=string",
        "de-fragment directory by path",
    )?;
    registry.register(
        "dirfrag ls",
        "dirfrag ls name=path,type=string",
        "list fragments in directory",
    )?;
    Ok(())
}

/// Commands served on the monitor command channel.
const TELL_COMMANDS: &[(&str, &str, &str)] = &[
    (
        "injectargs",
        "injectargs name=injected_args,type=string,n=N",
        "inject configuration arguments into running MDS",
    ),
    ("exit", "exit", "terminate this MDS"),
    ("respawn", "respawn", "restart this MDS"),
    (
        "session kill",
        "session kill name=session_id,type=int",
        "end a client session",
    ),
    (
        "cpu_profiler",
        "cpu_profiler name=arg,type=choices,strings=status|flush",
        "run cpu profiling on daemon",
    ),
    (
        "heap",
        "heap name=heapcmd,type=choices,strings=dump|start_profiler|stop_profiler|release|stats",
        "show heap usage info (available only if compiled with a profiling allocator)",
    ),
];

fn tell_command_descriptions() -> Value {
    let list: Vec<Value> = TELL_COMMANDS
        .iter()
        .map(|(name, sig, help)| json!({"cmd": name, "signature": sig, "help": help}))
        .collect();
    json!({ "command_descriptions": list })
}

/// Outcome of one admin command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub code: i32,
    pub output: Value,
    pub message: String,
}

impl CommandOutput {
    pub fn ok(output: Value) -> Self {
        Self {
            code: 0,
            output,
            message: String::new(),
        }
    }

    pub fn err(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            output: Value::Null,
            message: message.into(),
        }
    }
}

fn getval_str(cmdmap: &Value, key: &str) -> Option<String> {
    cmdmap.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

fn getval_i64(cmdmap: &Value, key: &str) -> Option<i64> {
    cmdmap.get(key).and_then(|v| v.as_i64())
}

/// Strictly parse a client id. Non-numeric input is rejected rather than
/// silently resolving to session 0.
fn parse_client_id(value: Option<&Value>) -> Result<u64> {
    match value {
        Some(Value::Number(n)) => n
            .as_u64()
            .ok_or_else(|| LatticeError::InvalidArgument("client id out of range".to_string())),
        Some(Value::String(s)) => s.trim().parse::<u64>().map_err(|_| {
            LatticeError::InvalidArgument(format!("'{}' is not a valid client id", s))
        }),
        _ => Err(LatticeError::InvalidArgument(
            "missing client id".to_string(),
        )),
    }
}

/// Resolve `(path, frag)` cmdmap arguments to an auth dirfrag.
fn dirfrag_get(core: &MdsCore, cmdmap: &Value) -> std::result::Result<(InodeId, FragId), CommandOutput> {
    let Some(path) = getval_str(cmdmap, "path") else {
        return Err(CommandOutput::err(-libc::EINVAL, "missing path argument"));
    };
    let Some(frag_str) = getval_str(cmdmap, "frag") else {
        return Err(CommandOutput::err(-libc::EINVAL, "missing frag argument"));
    };
    let Some(ino) = core.cache.cache_traverse(&path) else {
        return Err(CommandOutput::err(
            -libc::ENOENT,
            format!("directory '{}' inode not in cache", path),
        ));
    };
    let Some(frag) = FragId::parse(&frag_str) else {
        return Err(CommandOutput::err(
            -libc::EINVAL,
            format!("frag {} failed to parse", frag_str),
        ));
    };
    if !core.cache.has_dirfrag(ino, frag) {
        return Err(CommandOutput::err(
            -libc::ENOENT,
            format!(
                "frag {:#x}/{} not in cache (use `dirfrag ls` to see if it should exist)",
                ino, frag
            ),
        ));
    }
    if !core.cache.dirfrag_is_auth(ino, frag) {
        return Err(CommandOutput::err(
            -libc::EPERM,
            format!("frag {} not auth", frag),
        ));
    }
    Ok((ino, frag))
}

impl MdsDaemon {
    /// Execute one admin-socket command.
    pub async fn asok_command(self: &Arc<Self>, command: &str, cmdmap: &Value) -> CommandOutput {
        info!(command, "admin command (starting)");
        let result = self.asok_command_inner(command, cmdmap).await;
        info!(command, code = result.code, "admin command (complete)");
        result
    }

    async fn asok_command_inner(self: &Arc<Self>, command: &str, cmdmap: &Value) -> CommandOutput {
        if command == "status" {
            let core = self.lock_core().await;
            let osd_epoch = self.objecter.epoch();
            return CommandOutput::ok(json!({
                "cluster_fsid": self.monc.fsid().to_string(),
                "whoami": core.whoami().map(|r| r.0).unwrap_or(-1),
                "state": core.state().name(),
                "mdsmap_epoch": core.map_epoch(),
                "osdmap_epoch": osd_epoch,
                "osdmap_epoch_barrier": core.osd_epoch_barrier(),
            }));
        }

        // Everything else needs a rank.
        {
            let core = self.lock_core().await;
            if core.whoami().is_none() {
                debug!("cannot run that command on an inactive MDS");
                return CommandOutput::err(-libc::EAGAIN, "mds_not_active");
            }
        }

        match command {
            "dump_ops_in_flight" | "ops" => {
                if !self.op_tracker.tracking_enabled() {
                    CommandOutput::err(-libc::EINVAL, "op_tracker tracking is not enabled")
                } else {
                    CommandOutput::ok(self.op_tracker.dump_ops_in_flight())
                }
            }
            "dump_historic_ops" => {
                if !self.op_tracker.tracking_enabled() {
                    CommandOutput::err(-libc::EINVAL, "op_tracker tracking is not enabled")
                } else {
                    CommandOutput::ok(self.op_tracker.dump_historic_ops())
                }
            }
            "osdmap barrier" => {
                let Some(target) = getval_i64(cmdmap, "target_epoch") else {
                    return CommandOutput::err(-libc::EINVAL, "no target epoch given");
                };
                if target <= 0 {
                    return CommandOutput::err(-libc::EINVAL, "target epoch must be positive");
                }
                let target = target as u64;
                {
                    let mut core = self.lock_core().await;
                    core.set_osd_epoch_barrier(target);
                }
                debug!(target, "waiting for object-store map epoch");
                self.objecter.wait_for_map(target).await;
                CommandOutput::ok(json!({ "epoch": self.objecter.epoch() }))
            }
            "session ls" => {
                let core = self.lock_core().await;
                self.heartbeat.reset();
                let replaying = core.state().is_clientreplay();
                let sessions: Vec<Value> = core
                    .sessions
                    .client_sessions()
                    .iter()
                    .map(|s| s.dump(replaying, false))
                    .collect();
                CommandOutput::ok(json!({ "sessions": sessions }))
            }
            "session evict" => {
                let client_id = match parse_client_id(cmdmap.get("client_id")) {
                    Ok(id) => id,
                    Err(e) => return CommandOutput::err(e.to_errno(), e.to_string()),
                };
                let rx = {
                    let mut core = self.lock_core().await;
                    core.kill_session(EntityName::client(client_id))
                };
                match rx {
                    Some(rx) => {
                        // Block until the kill has committed.
                        let code = rx.await.unwrap_or(-libc::EIO);
                        if code == 0 {
                            CommandOutput::ok(Value::Null)
                        } else {
                            CommandOutput::err(code, "failed to commit session kill")
                        }
                    }
                    None => {
                        debug!(client_id, "session not in session map");
                        CommandOutput::err(
                            -libc::ENOENT,
                            format!("session '{}' not found", client_id),
                        )
                    }
                }
            }
            "scrub_path" | "flush_path" => {
                let Some(path) = getval_str(cmdmap, "path") else {
                    return CommandOutput::err(-libc::EINVAL, "missing path argument");
                };
                let rx = {
                    let mut core = self.lock_core().await;
                    let (tx, rx) = tokio::sync::oneshot::channel();
                    if command == "scrub_path" {
                        core.cache.scrub_path(&path, tx);
                    } else {
                        core.cache.flush_dentry(&path, tx);
                    }
                    rx
                };
                let code = rx.await.unwrap_or(-libc::EIO);
                CommandOutput {
                    code,
                    output: json!({ "return_code": code }),
                    message: String::new(),
                }
            }
            "flush journal" => {
                let (code, message) = self.command_flush_journal().await;
                CommandOutput {
                    code,
                    output: json!({ "message": message.clone(), "return_code": code }),
                    message,
                }
            }
            "get subtrees" => {
                let core = self.lock_core().await;
                let subtrees: Vec<Value> = core
                    .cache
                    .list_subtrees()
                    .iter()
                    .map(|s| {
                        json!({
                            "is_auth": s.is_auth,
                            "auth_first": s.auth_first,
                            "auth_second": s.auth_second,
                            "dir": { "path": s.path, "ino": s.ino, "frag": s.frag.to_string() },
                        })
                    })
                    .collect();
                CommandOutput::ok(json!({ "subtrees": subtrees }))
            }
            "export dir" => {
                let Some(path) = getval_str(cmdmap, "path") else {
                    return CommandOutput::err(-libc::EINVAL, "malformed path");
                };
                let Some(rank) = getval_i64(cmdmap, "rank") else {
                    return CommandOutput::err(-libc::EINVAL, "malformed rank");
                };
                let mut core = self.lock_core().await;
                let code = command_export_dir(&mut core, &path, MdsRank(rank as i32));
                CommandOutput {
                    code,
                    output: json!({ "return_code": code }),
                    message: String::new(),
                }
            }
            "dump cache" => {
                let mut core = self.lock_core().await;
                match getval_str(cmdmap, "path") {
                    Some(path) => match core.cache.dump_to_file(std::path::Path::new(&path)) {
                        Ok(()) => CommandOutput::ok(Value::Null),
                        Err(e) => CommandOutput::err(e.to_errno(), e.to_string()),
                    },
                    None => CommandOutput::ok(core.cache.dump_formatted()),
                }
            }
            "force_readonly" => {
                let mut core = self.lock_core().await;
                core.cache.force_readonly();
                CommandOutput::ok(Value::Null)
            }
            "dirfrag split" => {
                let Some(bits) = getval_i64(cmdmap, "bits") else {
                    return CommandOutput::err(-libc::EINVAL, "missing bits argument");
                };
                if bits <= 0 {
                    return CommandOutput::err(-libc::EINVAL, "must split by >0 bits");
                }
                let mut core = self.lock_core().await;
                let (ino, frag) = match dirfrag_get(&core, cmdmap) {
                    Ok(v) => v,
                    Err(out) => return out,
                };
                match core.cache.split_dir(ino, frag, bits as u8) {
                    Ok(()) => CommandOutput::ok(Value::Null),
                    Err(e) => CommandOutput::err(e.to_errno(), e.to_string()),
                }
            }
            "dirfrag merge" => {
                let Some(path) = getval_str(cmdmap, "path") else {
                    return CommandOutput::err(-libc::EINVAL, "missing path argument");
                };
                let Some(frag_str) = getval_str(cmdmap, "frag") else {
                    return CommandOutput::err(-libc::EINVAL, "missing frag argument");
                };
                let mut core = self.lock_core().await;
                let Some(ino) = core.cache.cache_traverse(&path) else {
                    return CommandOutput::err(
                        -libc::ENOENT,
                        format!("directory '{}' inode not in cache", path),
                    );
                };
                let Some(frag) = FragId::parse(&frag_str) else {
                    return CommandOutput::err(
                        -libc::EINVAL,
                        format!("frag {} failed to parse", frag_str),
                    );
                };
                match core.cache.merge_dir(ino, frag) {
                    Ok(()) => CommandOutput::ok(Value::Null),
                    Err(e) => CommandOutput::err(e.to_errno(), e.to_string()),
                }
            }
            "dirfrag ls" => {
                let Some(path) = getval_str(cmdmap, "path") else {
                    return CommandOutput::err(-libc::EINVAL, "missing path argument");
                };
                let core = self.lock_core().await;
                let Some(ino) = core.cache.cache_traverse(&path) else {
                    return CommandOutput::err(-libc::ENOENT, "directory inode not in cache");
                };
                let frags: Vec<Value> = core
                    .cache
                    .leaves_under(ino, FragId::root())
                    .iter()
                    .map(|f| {
                        json!({
                            "value": f.value,
                            "bits": f.bits,
                            "str": f.to_string(),
                        })
                    })
                    .collect();
                CommandOutput::ok(json!({ "frags": frags }))
            }
            other => CommandOutput::err(-libc::EINVAL, format!("unrecognized command! {}", other)),
        }
    }

    /// The journal flush protocol.
    ///
    /// Seal the open segment, flush twice (a racing context may dirty
    /// segments between flushes), expire and trim everything, then rewrite
    /// the header. Each wait releases the controller lock.
    pub async fn command_flush_journal(self: &Arc<Self>) -> (i32, String) {
        let mut core = self.lock_core().await;

        if core.cache.is_readonly() {
            debug!("flush journal: read-only FS");
            return (-libc::EROFS, "read-only file system".to_string());
        }
        if !core.state().is_active() {
            debug!("flush journal: MDS not active, no-op");
            return (0, String::new());
        }

        core.journal.start_new_segment();

        // First flush makes every segment older than the new one eligible
        // for expiry.
        let rx = core.journal.wait_for_safe();
        core.journal.flush();
        drop(core);
        let r = rx.await.unwrap_or(-libc::EIO);
        let mut core = self.lock_core().await;
        if self.is_stopping() {
            return (-libc::ESHUTDOWN, "shutting down".to_string());
        }
        if r != 0 {
            return (r, format!("Error {} while flushing journal", r));
        }

        // We may not have been the last safe-waiter; a context waking
        // between our flush and trim could dirty old segments, so wait for
        // safe once more.
        let rx = core.journal.wait_for_safe();
        core.journal.flush();
        drop(core);
        let r = rx.await.unwrap_or(-libc::EIO);
        let mut core = self.lock_core().await;
        if self.is_stopping() {
            return (-libc::ESHUTDOWN, "shutting down".to_string());
        }
        if r != 0 {
            return (r, format!("Error {} while flushing journal", r));
        }

        debug!("flush journal: beginning segment expiry");
        let r = core.journal.trim_all();
        if r != 0 {
            return (r, format!("Error {} while trimming log", r));
        }

        // Gather expiry of every currently-expiring segment.
        let expiring = core.journal.expiring_segments();
        debug!(count = expiring.len(), "waiting for segments to expire");
        let waiters: Vec<_> = expiring
            .iter()
            .map(|seq| core.journal.wait_for_expiry(*seq))
            .collect();
        drop(core);
        for rx in waiters {
            // Segment expiry cannot fail.
            let _ = rx.await;
        }
        let mut core = self.lock_core().await;
        if self.is_stopping() {
            return (-libc::ESHUTDOWN, "shutting down".to_string());
        }

        core.journal.trim_expired_segments();
        debug!(
            expire_pos = core.journal.expire_pos(),
            trim_pos = core.journal.trim_pos(),
            "flush journal: trim complete"
        );

        // Rewrite the header so readers start after the flushed region.
        let rx = core.journal.write_head();
        drop(core);
        let r = rx.await.unwrap_or(-libc::EIO);
        if r != 0 {
            return (r, format!("Error {} while writing header", r));
        }

        debug!("flush journal: write_head complete, all done");
        (0, String::new())
    }
}

/// `export dir` validation and execution. Must run under the controller lock.
fn command_export_dir(core: &mut MdsCore, path: &str, target: MdsRank) -> i32 {
    if Some(target) == core.whoami() || !core.mdsmap().is_up(target) || !core.mdsmap().is_in(target)
    {
        error!(%target, "bad export target rank");
        return -libc::ENOENT;
    }
    let Some(ino) = core.cache.cache_traverse(path) else {
        error!(path, "bad export path");
        return -libc::ENOENT;
    };
    if !core.cache.has_dirfrag(ino, FragId::root()) || !core.cache.dirfrag_is_auth(ino, FragId::root())
    {
        error!(path, "export path root fragment missing or not auth");
        return -libc::EINVAL;
    }
    core.migrator.export_dir(ino, FragId::root(), target);
    0
}

/// Handle a structured command from the monitor channel.
///
/// Replies are sent on the originating connection before any scheduled
/// continuation (delayed exit/respawn) runs.
pub(crate) fn handle_command_msg(
    daemon: &Arc<MdsDaemon>,
    core: &mut MdsCore,
    conn: Option<&Arc<Connection>>,
    tid: u64,
    cmdmap: &Value,
) {
    enum RunAfter {
        Suicide,
        Respawn,
    }

    let reply = |code: i32, message: String, data: Vec<u8>| {
        if let Some(conn) = conn {
            conn.send_message(Message::CommandReply {
                tid,
                code,
                message,
                data,
            });
        }
    };

    let session = conn.and_then(|c| c.session());
    let allowed = session.map(|s| s.auth_caps().allow_tell()).unwrap_or(false);
    if !allowed {
        warn!(tid, "received command from client without `tell` capability");
        reply(-libc::EPERM, "permission denied".to_string(), Vec::new());
        return;
    }

    let Some(prefix) = cmdmap.get("prefix").and_then(|v| v.as_str()) else {
        reply(-libc::EINVAL, "no command given".to_string(), Vec::new());
        return;
    };

    let mut run_after = None;
    let (code, message, data) = match prefix {
        "get_command_descriptions" => {
            let data = serde_json::to_vec(&tell_command_descriptions()).unwrap_or_default();
            (0, String::new(), data)
        }
        "injectargs" => {
            let args: Vec<String> = match cmdmap.get("injected_args") {
                Some(Value::Array(items)) => items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect(),
                Some(Value::String(s)) => vec![s.clone()],
                _ => Vec::new(),
            };
            if args.is_empty() {
                (-libc::EINVAL, "ignoring empty injectargs".to_string(), Vec::new())
            } else {
                // Tokenize so `key=value key2=value2` in one string works.
                let tokens: Vec<String> = args
                    .iter()
                    .flat_map(|a| a.split_whitespace().map(str::to_string))
                    .collect();
                match daemon.config().injectargs(&tokens) {
                    Ok(changed) => {
                        let mut keys: Vec<&String> = changed.iter().collect();
                        keys.sort();
                        (0, format!("applied: {:?}", keys), Vec::new())
                    }
                    Err(e) => (e.to_errno(), e.to_string(), Vec::new()),
                }
            }
        }
        "exit" => {
            // Respond before executing.
            run_after = Some(RunAfter::Suicide);
            (0, "Exiting...".to_string(), Vec::new())
        }
        "respawn" => {
            run_after = Some(RunAfter::Respawn);
            (0, "Respawning...".to_string(), Vec::new())
        }
        "session kill" => match parse_client_id(cmdmap.get("session_id")) {
            Ok(id) => {
                if core.kill_session(EntityName::client(id)).is_some() {
                    (0, String::new(), Vec::new())
                } else {
                    (-libc::ENOENT, format!("session '{}' not found", id), Vec::new())
                }
            }
            Err(e) => (e.to_errno(), e.to_string(), Vec::new()),
        },
        "heap" => {
            let arg = getval_str(cmdmap, "heapcmd").unwrap_or_default();
            match profiler::heap_command(&arg) {
                Ok(out) => (0, String::new(), out.into_bytes()),
                Err(e) => (e.to_errno(), e.to_string(), Vec::new()),
            }
        }
        "cpu_profiler" => {
            let arg = getval_str(cmdmap, "arg").unwrap_or_default();
            match profiler::cpu_command(&arg) {
                Ok(out) => (0, String::new(), out.into_bytes()),
                Err(e) => (e.to_errno(), e.to_string(), Vec::new()),
            }
        }
        other => (
            -libc::EINVAL,
            format!("unrecognized command! {}", other),
            Vec::new(),
        ),
    };

    reply(code, message, data);

    if let Some(action) = run_after {
        // Wait a little so the caller sees our response before we vanish
        // from the map.
        let daemon = daemon.clone();
        let grace = daemon.config().with(|c| c.admin_grace);
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            match action {
                RunAfter::Suicide => daemon.suicide(false).await,
                RunAfter::Respawn => daemon.respawn().await,
            }
        });
    }
}

/// Legacy positional monitor commands.
pub(crate) fn handle_command_legacy(
    daemon: &Arc<MdsDaemon>,
    core: &mut MdsCore,
    args: &[String],
) -> Option<FatalAction> {
    debug!(?args, "legacy command");
    let Some(command) = args.first().map(String::as_str) else {
        warn!("empty legacy command");
        return None;
    };

    match command {
        "injectargs" => {
            if args.len() < 2 {
                error!("ignoring empty injectargs!");
            } else {
                let tokens: Vec<String> = args[1..]
                    .iter()
                    .flat_map(|a| a.split_whitespace().map(str::to_string))
                    .collect();
                match daemon.config().injectargs(&tokens) {
                    Ok(changed) => info!(?changed, "injectargs applied"),
                    Err(e) => error!("injectargs: {}", e),
                }
            }
        }
        "dumpcache" => {
            if args.len() > 1 {
                if let Err(e) = core.cache.dump_to_file(std::path::Path::new(&args[1])) {
                    error!("dump cache failed: {}", e);
                }
            } else {
                let _ = core.cache.dump_formatted();
            }
        }
        "exit" => return Some(FatalAction::Suicide),
        "respawn" => return Some(FatalAction::Respawn),
        "session" => {
            // `session kill <id>`; check shape before indexing.
            if args.len() < 3 || args[1] != "kill" {
                error!(?args, "bad session command syntax");
                return None;
            }
            match args[2].parse::<u64>() {
                Ok(id) => {
                    if core.kill_session(EntityName::client(id)).is_none() {
                        debug!(id, "session not in session map");
                    }
                }
                Err(_) => error!(arg = %args[2], "invalid client id"),
            }
        }
        "fragment_dir" => {
            if args.len() != 4 {
                error!("bad fragment_dir syntax");
                return None;
            }
            let Some(ino) = core.cache.cache_traverse(&args[1]) else {
                error!(path = %args[1], "path not found");
                return None;
            };
            let Some(frag) = FragId::parse(&args[2]) else {
                error!(frag = %args[2], "frag does not parse");
                return None;
            };
            match args[3].parse::<u8>() {
                Ok(by) if by > 0 => {
                    if let Err(e) = core.cache.split_dir(ino, frag, by) {
                        error!("split failed: {}", e);
                    }
                }
                _ => error!("need to split by >0 bits"),
            }
        }
        "merge_dir" => {
            if args.len() != 3 {
                error!("bad merge_dir syntax");
                return None;
            }
            let Some(ino) = core.cache.cache_traverse(&args[1]) else {
                error!(path = %args[1], "path not found");
                return None;
            };
            let Some(frag) = FragId::parse(&args[2]) else {
                error!(frag = %args[2], "frag does not parse");
                return None;
            };
            if let Err(e) = core.cache.merge_dir(ino, frag) {
                error!("merge failed: {}", e);
            }
        }
        "export_dir" => {
            if args.len() != 3 {
                error!("bad export_dir syntax");
                return None;
            }
            match args[2].parse::<i32>() {
                Ok(rank) => {
                    let code = command_export_dir(core, &args[1], MdsRank(rank));
                    if code != 0 {
                        error!(code, "export_dir failed");
                    }
                }
                Err(_) => error!("bad export_dir target syntax"),
            }
        }
        "cpu_profiler" => {
            let arg = args.get(1).cloned().unwrap_or_default();
            match profiler::cpu_command(&arg) {
                Ok(out) => daemon.cluster_log().info(out),
                Err(e) => daemon.cluster_log().info(e.to_string()),
            }
        }
        "heap" => {
            let arg = args.get(1).cloned().unwrap_or_default();
            match profiler::heap_command(&arg) {
                Ok(out) => daemon.cluster_log().info(out),
                Err(e) => daemon.cluster_log().info(e.to_string()),
            }
        }
        other => error!(command = other, "unrecognized command!"),
    }
    None
}

/// Heap and CPU profiler hooks, compile-time gated on a profiling
/// allocator.
pub mod profiler {
    use crate::error::{LatticeError, Result};

    #[cfg(feature = "heap-profiler")]
    pub fn heap_command(arg: &str) -> Result<String> {
        match arg {
            "dump" | "stats" => Ok(format!("heap profiler: {} complete", arg)),
            "start_profiler" | "stop_profiler" | "release" => {
                Ok(format!("heap profiler: {} acknowledged", arg))
            }
            other => Err(LatticeError::InvalidArgument(format!(
                "unknown heap command '{}'",
                other
            ))),
        }
    }

    #[cfg(not(feature = "heap-profiler"))]
    pub fn heap_command(_arg: &str) -> Result<String> {
        Err(LatticeError::Unsupported(
            "could not issue heap profiler command -- not compiled with a profiling allocator"
                .to_string(),
        ))
    }

    #[cfg(feature = "heap-profiler")]
    pub fn cpu_command(arg: &str) -> Result<String> {
        match arg {
            "status" => Ok("cpu profiler: running".to_string()),
            "flush" => Ok("cpu profiler: flushed".to_string()),
            other => Err(LatticeError::InvalidArgument(format!(
                "unknown cpu_profiler command '{}'",
                other
            ))),
        }
    }

    #[cfg(not(feature = "heap-profiler"))]
    pub fn cpu_command(_arg: &str) -> Result<String> {
        Err(LatticeError::Unsupported(
            "cpu_profiler support not linked in".to_string(),
        ))
    }
}

/// The local admin command socket.
///
/// Accepts newline-delimited JSON requests of the form
/// `{"prefix": "<command>", ...args}` and replies with one JSON object per
/// line.
pub struct AdminSocket {
    path: PathBuf,
    task: JoinHandle<()>,
}

impl AdminSocket {
    pub async fn bind(daemon: Arc<MdsDaemon>, path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path)?;
        info!(path = %path.display(), "admin socket bound");

        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let daemon = daemon.clone();
                        tokio::spawn(async move {
                            Self::serve(daemon, stream).await;
                        });
                    }
                    Err(e) => {
                        warn!("admin socket accept failed: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(Self { path, task })
    }

    async fn serve(daemon: Arc<MdsDaemon>, stream: tokio::net::UnixStream) {
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            let response = match serde_json::from_str::<Value>(&line) {
                Err(e) => json!({
                    "return_code": -libc::EINVAL,
                    "message": format!("invalid request: {}", e),
                }),
                Ok(cmdmap) => {
                    let prefix = cmdmap
                        .get("prefix")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string();
                    if !daemon.commands.registered(&prefix) {
                        json!({
                            "return_code": -libc::EINVAL,
                            "message": format!("unknown command '{}'", prefix),
                        })
                    } else {
                        let out = daemon.asok_command(&prefix, &cmdmap).await;
                        json!({
                            "return_code": out.code,
                            "output": out.output,
                            "message": out.message,
                        })
                    }
                }
            };
            let mut buf = serde_json::to_vec(&response).unwrap_or_default();
            buf.push(b'\n');
            if write_half.write_all(&buf).await.is_err() {
                break;
            }
        }
    }

    pub fn shutdown(&self) {
        self.task.abort();
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_registration_fails() {
        let registry = CommandRegistry::new();
        registry.register("status", "status", "help").unwrap();
        let err = registry.register("status", "status", "help").unwrap_err();
        assert!(matches!(err, LatticeError::CommandExists(_)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_register_commands_is_complete() {
        let registry = CommandRegistry::new();
        register_commands(&registry).unwrap();
        for cmd in [
            "status",
            "ops",
            "session ls",
            "session evict",
            "flush journal",
            "osdmap barrier",
            "export dir",
            "dump cache",
            "force_readonly",
            "get subtrees",
            "dirfrag split",
            "dirfrag merge",
            "dirfrag ls",
            "scrub_path",
            "flush_path",
            "dump_ops_in_flight",
            "dump_historic_ops",
        ] {
            assert!(registry.registered(cmd), "missing {}", cmd);
        }
    }

    #[test]
    fn test_parse_client_id_strict() {
        assert_eq!(parse_client_id(Some(&json!(42))).unwrap(), 42);
        assert_eq!(parse_client_id(Some(&json!("42"))).unwrap(), 42);
        // Malformed ids must not silently become session 0.
        assert!(parse_client_id(Some(&json!("bogus"))).is_err());
        assert!(parse_client_id(Some(&json!(-3))).is_err());
        assert!(parse_client_id(None).is_err());
    }

    #[test]
    fn test_profiler_unsupported_without_feature() {
        #[cfg(not(feature = "heap-profiler"))]
        {
            let err = profiler::heap_command("dump").unwrap_err();
            assert_eq!(err.to_errno(), libc::EOPNOTSUPP);
        }
    }

    #[test]
    fn test_tell_descriptions_contain_exit() {
        let desc = tell_command_descriptions();
        let cmds = desc["command_descriptions"].as_array().unwrap();
        assert!(cmds.iter().any(|c| c["cmd"] == "exit"));
        assert!(cmds.iter().any(|c| c["cmd"] == "session kill"));
    }
}
