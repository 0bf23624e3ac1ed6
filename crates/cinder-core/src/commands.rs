//! The type-agnostic command surface.
//!
//! Protocol-agnostic: an argument vector comes in (`argv[0]` is the
//! command name), a [`Reply`] goes out, and the ambient protocol layer
//! encodes it. Reply texts and branch order follow the wire-compatible
//! conventions of the command family.
//!
//! Everything here runs on the command loop under the exclusive engine
//! borrow. The one exception is KEYS, which — for a client that is
//! neither inside MULTI nor blocked — forks a snapshot and greps it on a
//! blocking worker, re-entering the loop only to post the reply and
//! release the snapshot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::db::LookupFlags;
use crate::engine::Engine;
use crate::error::CommandError;
use crate::extract::lookup_command;
use crate::keyspace::GlobPattern;
use crate::notify::{EventKind, PropagationTargets};
use crate::object::Object;
use crate::time;
use crate::types::Value;

/// A protocol-agnostic reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// `+OK`
    Ok,
    /// Any other simple-string status (TYPE).
    Simple(&'static str),
    Bulk(Bytes),
    Int(i64),
    Array(Vec<Reply>),
    Nil,
    Error(String),
}

impl From<CommandError> for Reply {
    fn from(err: CommandError) -> Self {
        Reply::Error(err.to_string())
    }
}

/// Per-client command context.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: u64,
    /// Currently SELECTed database.
    pub db: usize,
    /// MVCC stamp as of this command's dispatch; snapshot forks reuse an
    /// existing snapshot when it is at least this new.
    pub mvcc_checkpoint: u64,
    /// Inside a MULTI block; KEYS must not leave the command loop.
    pub in_multi: bool,
    /// Blocked on a blocking command.
    pub blocked: bool,
    /// Set when the connection is closing; workers abandon this
    /// client's scans mid-iteration.
    pub close_asap: Arc<AtomicBool>,
}

impl Session {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            db: 0,
            mvcc_checkpoint: 0,
            in_multi: false,
            blocked: false,
            close_asap: Arc::new(AtomicBool::new(false)),
        }
    }
}

fn parse_i64(arg: &[u8]) -> Option<i64> {
    let s = std::str::from_utf8(arg).ok()?;
    if s.is_empty() || s.starts_with(char::is_whitespace) {
        return None;
    }
    s.parse().ok()
}

fn parse_cursor(arg: &[u8]) -> Result<u64, CommandError> {
    let s = std::str::from_utf8(arg).map_err(|_| CommandError::InvalidCursor)?;
    if s.is_empty() || s.starts_with(char::is_whitespace) {
        return Err(CommandError::InvalidCursor);
    }
    s.parse().map_err(|_| CommandError::InvalidCursor)
}

fn arg_eq(arg: &[u8], word: &str) -> bool {
    arg.eq_ignore_ascii_case(word.as_bytes())
}

/// Dispatches one command. Arity is validated against the command
/// table; unknown commands error without touching the keyspace.
pub async fn dispatch(engine: &mut Engine, session: &mut Session, argv: &[Bytes]) -> Reply {
    let Some(name) = argv.first() else {
        return Reply::Error("empty command".into());
    };
    let Some(spec) = lookup_command(name) else {
        return Reply::Error(format!(
            "unknown command '{}'",
            String::from_utf8_lossy(name)
        ));
    };
    let argc = argv.len() as i32;
    let arity_ok = if spec.arity >= 0 {
        argc == spec.arity
    } else {
        argc >= -spec.arity
    };
    if !arity_ok {
        return CommandError::WrongArity(spec.name).into();
    }

    match spec.name {
        "del" => del_generic(engine, session, argv, false),
        "unlink" => del_generic(engine, session, argv, true),
        "exists" => exists_command(engine, session, argv),
        "touch" => touch_command(engine, session, argv),
        "type" => type_command(engine, session, argv),
        "select" => select_command(engine, session, argv),
        "rename" => rename_generic(engine, session, argv, false),
        "renamenx" => rename_generic(engine, session, argv, true),
        "move" => move_command(engine, session, argv),
        "dbsize" => Reply::Int(engine.db(session.db).size() as i64),
        "lastsave" => Reply::Int(engine.state.lastsave),
        "shutdown" => shutdown_command(engine, argv),
        "flushdb" => flushdb_command(engine, session, argv),
        "flushall" => flushall_command(engine, argv),
        "swapdb" => swapdb_command(engine, argv),
        "randomkey" => randomkey_command(engine, session),
        "scan" => scan_command(engine, session, argv),
        "keys" => keys_command(engine, session, argv[1].clone()).await,
        "get" => get_command(engine, session, argv),
        "set" => set_command(engine, session, argv),
        "mset" => mset_command(engine, session, argv),
        "expire" => expire_generic(engine, session, argv, 1000, ExpireBase::Now),
        "pexpire" => expire_generic(engine, session, argv, 1, ExpireBase::Now),
        "expireat" => expire_generic(engine, session, argv, 1000, ExpireBase::Epoch),
        "pexpireat" => expire_generic(engine, session, argv, 1, ExpireBase::Epoch),
        "ttl" => ttl_generic(engine, session, argv, true),
        "pttl" => ttl_generic(engine, session, argv, false),
        "persist" => persist_command(engine, session, argv),
        // commands present in the table only for key extraction (the
        // type command layers own their implementations)
        other => Reply::Error(format!("unsupported command '{other}'")),
    }
}

/// DEL and UNLINK: the expiration gate runs first so an already-dead
/// key counts as absent, then the delete goes sync or lazy.
fn del_generic(engine: &mut Engine, session: &Session, argv: &[Bytes], lazy: bool) -> Reply {
    let (db, state) = engine.db_and_state(session.db);
    let mut removed = 0;
    for key in &argv[1..] {
        db.expire_if_needed(state, key);
        let deleted = if lazy {
            db.delete_async(state, key)
        } else {
            db.delete_sync(state, key)
        };
        if deleted {
            db.signal_modified(state, key);
            state.sinks.notify(db.id(), EventKind::Del, key);
            state.stats.dirty += 1;
            removed += 1;
        }
    }
    Reply::Int(removed)
}

fn exists_command(engine: &mut Engine, session: &Session, argv: &[Bytes]) -> Reply {
    let (db, state) = engine.db_and_state(session.db);
    let count = argv[1..]
        .iter()
        .filter(|key| db.lookup_key_read(state, key).is_some())
        .count();
    Reply::Int(count as i64)
}

/// TOUCH: like EXISTS but the point is the access-clock refresh.
fn touch_command(engine: &mut Engine, session: &Session, argv: &[Bytes]) -> Reply {
    let (db, state) = engine.db_and_state(session.db);
    let count = argv[1..]
        .iter()
        .filter(|key| db.lookup_key_read(state, key).is_some())
        .count();
    Reply::Int(count as i64)
}

fn type_command(engine: &mut Engine, session: &Session, argv: &[Bytes]) -> Reply {
    let (db, state) = engine.db_and_state(session.db);
    match db.lookup_key_read_with_flags(state, &argv[1], LookupFlags::NO_TOUCH) {
        Some(obj) => Reply::Simple(obj.type_name()),
        None => Reply::Simple("none"),
    }
}

fn select_command(engine: &mut Engine, session: &mut Session, argv: &[Bytes]) -> Reply {
    let Some(id) = parse_i64(&argv[1]) else {
        return Reply::Error("invalid DB index".into());
    };
    if engine.state.config.cluster_enabled && id != 0 {
        return CommandError::ClusterForbidden("SELECT").into();
    }
    match engine.select(id) {
        Ok(db) => {
            session.db = db;
            Reply::Ok
        }
        Err(err) => err.into(),
    }
}

/// RENAME and RENAMENX.
///
/// Same-name rename is a no-op but still errors when the key is absent.
/// Any expiry on the source is captured whole and reinstalled at the
/// destination after the transfer.
fn rename_generic(engine: &mut Engine, session: &Session, argv: &[Bytes], nx: bool) -> Reply {
    let src = &argv[1];
    let dst = &argv[2];
    let samekey = src == dst;
    let (db, state) = engine.db_and_state(session.db);

    if db.lookup_key_write(state, src).is_none() {
        return CommandError::NoSuchKey.into();
    }
    if samekey {
        return if nx { Reply::Int(0) } else { Reply::Ok };
    }

    let carried_expire = db.get_expire(src).cloned();

    if db.lookup_key_write(state, dst).is_some() {
        if nx {
            return Reply::Int(0);
        }
        db.delete(state, dst);
    }
    let obj = db
        .take_for_transfer(state, src)
        .expect("source disappeared mid-rename");
    db.add(state, dst, obj);
    if let Some(entry) = carried_expire {
        db.set_expire_entry(state, dst, entry);
    }
    db.signal_modified(state, src);
    db.signal_modified(state, dst);
    state.sinks.notify(db.id(), EventKind::RenameFrom, src);
    state.sinks.notify(db.id(), EventKind::RenameTo, dst);
    state.stats.dirty += 1;
    if nx {
        Reply::Int(1)
    } else {
        Reply::Ok
    }
}

/// MOVE key db: transfer with preserved expiry; integer 0 when the
/// source is missing or the target database already holds the key.
fn move_command(engine: &mut Engine, session: &Session, argv: &[Bytes]) -> Reply {
    if engine.state.config.cluster_enabled {
        return CommandError::ClusterForbidden("MOVE").into();
    }
    let Some(dbid) = parse_i64(&argv[2]) else {
        return CommandError::DbIndexOutOfRange.into();
    };
    let dst = match engine.select(dbid) {
        Ok(dst) => dst,
        Err(err) => return err.into(),
    };
    if dst == session.db {
        return CommandError::SameObject.into();
    }
    let key = &argv[1];
    let (src_db, dst_db, state) = engine.two_dbs_and_state(session.db, dst);

    if src_db.lookup_key_write(state, key).is_none() {
        return Reply::Int(0);
    }
    if dst_db.lookup_key_write(state, key).is_some() {
        return Reply::Int(0);
    }

    let carried_expire = src_db.get_expire(key).cloned();
    let obj = src_db
        .take_for_transfer(state, key)
        .expect("source disappeared mid-move");
    dst_db.add(state, key, obj);
    if let Some(entry) = carried_expire {
        dst_db.set_expire_entry(state, key, entry);
    }
    state.stats.dirty += 1;
    Reply::Int(1)
}

fn shutdown_command(engine: &mut Engine, argv: &[Bytes]) -> Reply {
    let mut save = false;
    if argv.len() > 2 {
        return CommandError::Syntax.into();
    }
    if argv.len() == 2 {
        if arg_eq(&argv[1], "nosave") {
            save = false;
        } else if arg_eq(&argv[1], "save") {
            save = true;
        } else {
            return CommandError::Syntax.into();
        }
    }
    // never save over a half-loaded dataset
    if engine.state.loading {
        save = false;
    }
    if save {
        engine.state.schedule_save();
    }
    engine.state.shutdown_requested = true;
    Reply::Ok
}

/// Parses the optional ASYNC flag of FLUSHDB/FLUSHALL.
fn flush_lazy_flag(argv: &[Bytes]) -> Result<bool, CommandError> {
    match argv.len() {
        1 => Ok(false),
        2 if arg_eq(&argv[1], "async") => Ok(true),
        _ => Err(CommandError::Syntax),
    }
}

fn flushdb_command(engine: &mut Engine, session: &Session, argv: &[Bytes]) -> Reply {
    let lazy = match flush_lazy_flag(argv) {
        Ok(lazy) => lazy,
        Err(err) => return err.into(),
    };
    let removed = engine
        .empty_db(Some(session.db), lazy)
        .expect("session bound to a database outside the array");
    engine.state.stats.dirty += removed as u64;
    Reply::Ok
}

/// FLUSHALL additionally aborts any background save and forces a fresh
/// one so the flush itself is durable.
fn flushall_command(engine: &mut Engine, argv: &[Bytes]) -> Reply {
    let lazy = match flush_lazy_flag(argv) {
        Ok(lazy) => lazy,
        Err(err) => return err.into(),
    };
    let removed = engine.empty_db(None, lazy).expect("flushall cannot be out of range");
    engine.state.stats.dirty += removed as u64;
    engine.state.kill_background_save();
    engine.state.schedule_save();
    engine.state.stats.dirty += 1;
    Reply::Ok
}

fn swapdb_command(engine: &mut Engine, argv: &[Bytes]) -> Reply {
    if engine.state.config.cluster_enabled {
        return CommandError::ClusterForbidden("SWAPDB").into();
    }
    let Some(id1) = parse_i64(&argv[1]) else {
        return Reply::Error("invalid first DB index".into());
    };
    let Some(id2) = parse_i64(&argv[2]) else {
        return Reply::Error("invalid second DB index".into());
    };
    if id1 < 0 || id2 < 0 {
        return CommandError::DbIndexOutOfRange.into();
    }
    match engine.swap_databases(id1 as usize, id2 as usize) {
        Ok(()) => {
            engine.state.stats.dirty += 1;
            Reply::Ok
        }
        Err(err) => err.into(),
    }
}

fn randomkey_command(engine: &mut Engine, session: &Session) -> Reply {
    let (db, state) = engine.db_and_state(session.db);
    match db.random_key(state) {
        Some(key) => Reply::Bulk(key),
        None => Reply::Nil,
    }
}

/// SCAN cursor [MATCH pattern] [COUNT n] [TYPE t].
///
/// Keys are collected from the cursor walk first; the pattern, type and
/// expiry filters run afterwards, so a filtered-out key still advances
/// the cursor.
fn scan_command(engine: &mut Engine, session: &Session, argv: &[Bytes]) -> Reply {
    let cursor = match parse_cursor(&argv[1]) {
        Ok(cursor) => cursor,
        Err(err) => return err.into(),
    };

    let mut count = 10usize;
    let mut pattern: Option<GlobPattern> = None;
    let mut type_filter: Option<Bytes> = None;
    let mut i = 2;
    while i < argv.len() {
        let remaining = argv.len() - i;
        if arg_eq(&argv[i], "count") && remaining >= 2 {
            let Some(n) = parse_i64(&argv[i + 1]) else {
                return CommandError::NotAnInteger.into();
            };
            if n < 1 {
                return CommandError::Syntax.into();
            }
            count = n as usize;
            i += 2;
        } else if arg_eq(&argv[i], "match") && remaining >= 2 {
            // "*" matches everything, same as no pattern
            if argv[i + 1].as_ref() != b"*" {
                pattern = Some(GlobPattern::new(&argv[i + 1]));
            }
            i += 2;
        } else if arg_eq(&argv[i], "type") && remaining >= 2 {
            type_filter = Some(argv[i + 1].clone());
            i += 2;
        } else {
            return CommandError::Syntax.into();
        }
    }

    let (db, state) = engine.db_and_state(session.db);
    let (next_cursor, collected) = db.keyspace().scan(cursor, count);

    let mut keys = Vec::with_capacity(collected.len());
    for key in collected {
        if let Some(ref pat) = pattern {
            if !pat.matches(&key) {
                continue;
            }
        }
        if let Some(ref wanted) = type_filter {
            let type_name = match db.lookup_key_read_with_flags(state, &key, LookupFlags::NO_TOUCH) {
                Some(obj) => obj.type_name(),
                None => "none",
            };
            if !wanted.eq_ignore_ascii_case(type_name.as_bytes()) {
                continue;
            }
        }
        if db.expire_if_needed(state, &key) {
            continue;
        }
        keys.push(Reply::Bulk(key));
    }

    Reply::Array(vec![
        Reply::Bulk(Bytes::from(next_cursor.to_string())),
        Reply::Array(keys),
    ])
}

/// KEYS pattern.
///
/// A free client's scan is offloaded: fork a snapshot at the client's
/// MVCC checkpoint, grep it on a blocking worker (checking the client's
/// close flag per key), then release the snapshot back on the command
/// loop. A client inside MULTI or blocked scans inline instead.
pub async fn keys_command(engine: &mut Engine, session: &Session, pattern: Bytes) -> Reply {
    if session.in_multi || session.blocked {
        return keys_inline(engine, session, &pattern);
    }

    let snap = engine
        .db_mut(session.db)
        .keyspace_mut()
        .fork(session.mvcc_checkpoint);
    let worker_snap = Arc::clone(&snap);
    let cancel = Arc::clone(&session.close_asap);
    let now = time::now_ms();

    let result = tokio::task::spawn_blocking(move || {
        let compiled = GlobPattern::new(&pattern);
        let match_all = compiled.matches_all();
        let mut out = Vec::new();
        worker_snap.for_each(&mut |key, _| {
            if cancel.load(Ordering::Relaxed) {
                return false;
            }
            if match_all || compiled.matches(key) {
                let expired = worker_snap
                    .get_expire(key)
                    .and_then(|entry| entry.whole_when())
                    .is_some_and(|when| now > when);
                if !expired {
                    out.push(Reply::Bulk(key.clone()));
                }
            }
            true
        });
        out
    })
    .await
    .unwrap_or_default();

    engine.db_mut(session.db).keyspace_mut().end_snapshot(snap);
    Reply::Array(result)
}

fn keys_inline(engine: &mut Engine, session: &Session, pattern: &[u8]) -> Reply {
    let (db, state) = engine.db_and_state(session.db);
    let matched = db.keyspace().keys(pattern);
    let mut out = Vec::with_capacity(matched.len());
    for key in matched {
        if !db.key_is_expired(state, &key) {
            out.push(Reply::Bulk(key));
        }
    }
    Reply::Array(out)
}

// ---- strings (the minimal path the scenarios drive) -------------------

fn get_command(engine: &mut Engine, session: &Session, argv: &[Bytes]) -> Reply {
    let (db, state) = engine.db_and_state(session.db);
    match db.lookup_key_read(state, &argv[1]) {
        Some(obj) => match obj.value() {
            Value::String(data) => Reply::Bulk(data.clone()),
            _ => CommandError::WrongType.into(),
        },
        None => Reply::Nil,
    }
}

fn set_command(engine: &mut Engine, session: &Session, argv: &[Bytes]) -> Reply {
    let mut expire_ms: Option<i64> = None;
    let mut i = 3;
    while i < argv.len() {
        let remaining = argv.len() - i;
        if arg_eq(&argv[i], "ex") && remaining >= 2 {
            match parse_i64(&argv[i + 1]) {
                Some(secs) if secs > 0 => expire_ms = Some(secs * 1000),
                _ => return CommandError::NotAnInteger.into(),
            }
            i += 2;
        } else if arg_eq(&argv[i], "px") && remaining >= 2 {
            match parse_i64(&argv[i + 1]) {
                Some(ms) if ms > 0 => expire_ms = Some(ms),
                _ => return CommandError::NotAnInteger.into(),
            }
            i += 2;
        } else {
            return CommandError::Syntax.into();
        }
    }

    let (db, state) = engine.db_and_state(session.db);
    db.set_key(state, &argv[1], Object::string(argv[2].clone()));
    if let Some(ms) = expire_ms {
        db.set_expire(state, &argv[1], None, time::now_ms() + ms);
    }
    state.stats.dirty += 1;
    Reply::Ok
}

fn mset_command(engine: &mut Engine, session: &Session, argv: &[Bytes]) -> Reply {
    if argv.len() % 2 == 0 {
        return CommandError::WrongArity("mset").into();
    }
    let (db, state) = engine.db_and_state(session.db);
    for pair in argv[1..].chunks_exact(2) {
        db.set_key(state, &pair[0], Object::string(pair[1].clone()));
        state.stats.dirty += 1;
    }
    Reply::Ok
}

// ---- TTL family -------------------------------------------------------

enum ExpireBase {
    /// Deadline is relative to now (EXPIRE/PEXPIRE).
    Now,
    /// Deadline is absolute (EXPIREAT/PEXPIREAT).
    Epoch,
}

/// EXPIRE/PEXPIRE/EXPIREAT/PEXPIREAT.
///
/// On a master a deadline already in the past deletes the key right
/// here and propagates the delete, so replicas and the AOF never see a
/// negative TTL.
fn expire_generic(
    engine: &mut Engine,
    session: &Session,
    argv: &[Bytes],
    unit_ms: i64,
    base: ExpireBase,
) -> Reply {
    let key = &argv[1];
    let Some(raw) = parse_i64(&argv[2]) else {
        return CommandError::NotAnInteger.into();
    };
    let when_ms = match base {
        ExpireBase::Now => time::now_ms().saturating_add(raw.saturating_mul(unit_ms)),
        ExpireBase::Epoch => raw.saturating_mul(unit_ms),
    };

    let (db, state) = engine.db_and_state(session.db);
    if db.lookup_key_write(state, key).is_none() {
        return Reply::Int(0);
    }

    if when_ms <= time::now_ms() && !state.loading && state.masters == 0 {
        let verb = if state.config.lazyfree_lazy_server_del {
            Bytes::from_static(b"UNLINK")
        } else {
            Bytes::from_static(b"DEL")
        };
        db.delete(state, key);
        state.stats.dirty += 1;
        state.sinks.propagate(db.id(), vec![verb, key.clone()], PropagationTargets::BOTH);
        state.sinks.notify(db.id(), EventKind::Del, key);
        db.signal_modified(state, key);
        return Reply::Int(1);
    }

    db.set_expire(state, key, None, when_ms);
    db.signal_modified(state, key);
    state.stats.dirty += 1;
    Reply::Int(1)
}

/// TTL/PTTL: -2 when the key is missing, -1 when it has no expiry.
fn ttl_generic(engine: &mut Engine, session: &Session, argv: &[Bytes], seconds: bool) -> Reply {
    let (db, state) = engine.db_and_state(session.db);
    if db
        .lookup_key_read_with_flags(state, &argv[1], LookupFlags::NO_TOUCH)
        .is_none()
    {
        return Reply::Int(-2);
    }
    let when = db.get_expire(&argv[1]).and_then(|entry| entry.whole_when());
    match when {
        Some(when) => {
            let ttl = (when - time::now_ms()).max(0);
            if seconds {
                Reply::Int((ttl + 500) / 1000)
            } else {
                Reply::Int(ttl)
            }
        }
        None => Reply::Int(-1),
    }
}

fn persist_command(engine: &mut Engine, session: &Session, argv: &[Bytes]) -> Reply {
    let (db, state) = engine.db_and_state(session.db);
    if db.lookup_key_write(state, &argv[1]).is_none() {
        return Reply::Int(0);
    }
    if db.remove_expire(&argv[1]) {
        state.stats.dirty += 1;
        Reply::Int(1)
    } else {
        Reply::Int(0)
    }
}
