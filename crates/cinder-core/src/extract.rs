//! Per-command key extraction.
//!
//! Cluster routing, WATCH and tracking invalidation all need to know
//! which argument positions of a command are keys. Most commands
//! declare a static (firstkey, lastkey, step) triple; commands whose
//! key positions depend on their arguments use a specialized strategy.
//!
//! Extractors are deliberately forgiving: a malformed argument vector
//! yields no keys and the command's own arity/syntax check reports the
//! error.

use bytes::Bytes;

/// Strategy for locating key positions in an argument vector
/// (`argv[0]` is the command name).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySpec {
    /// The command takes no keys.
    None,
    /// Keys at `first..=last` stepping by `step`; negative `last`
    /// indexes from the end of the vector.
    Table { first: usize, last: isize, step: usize },
    /// `<dest> <numkeys> <key>...`: destination plus enumerated sources
    /// (ZUNIONSTORE/ZINTERSTORE).
    ZStore,
    /// `<script> <numkeys> <key>...` (EVAL/EVALSHA).
    Eval,
    /// `<key> [... STORE <dest>]` (SORT).
    Sort,
    /// `<host> <port> <key|""> ... [KEYS <key>...]` (MIGRATE).
    Migrate,
    /// `<key> ... [STORE <dest>] [STOREDIST <dest>]` (GEORADIUS).
    GeoRadius,
    /// `... STREAMS <key>... <id>...`: the first half of the
    /// post-STREAMS arguments (XREAD).
    XRead,
}

/// One command table entry.
#[derive(Debug, Clone, Copy)]
pub struct CommandSpec {
    pub name: &'static str,
    /// Exact argument count, or negative for "at least |arity|".
    pub arity: i32,
    pub keys: KeySpec,
}

macro_rules! table {
    ($first:expr, $last:expr, $step:expr) => {
        KeySpec::Table { first: $first, last: $last, step: $step }
    };
}

/// The static command table for the key-level command family plus the
/// commands that need custom extractors.
pub static COMMANDS: &[CommandSpec] = &[
    CommandSpec { name: "del", arity: -2, keys: table!(1, -1, 1) },
    CommandSpec { name: "unlink", arity: -2, keys: table!(1, -1, 1) },
    CommandSpec { name: "exists", arity: -2, keys: table!(1, -1, 1) },
    CommandSpec { name: "touch", arity: -2, keys: table!(1, -1, 1) },
    CommandSpec { name: "type", arity: 2, keys: table!(1, 1, 1) },
    CommandSpec { name: "rename", arity: 3, keys: table!(1, 2, 1) },
    CommandSpec { name: "renamenx", arity: 3, keys: table!(1, 2, 1) },
    CommandSpec { name: "move", arity: 3, keys: table!(1, 1, 1) },
    CommandSpec { name: "get", arity: 2, keys: table!(1, 1, 1) },
    CommandSpec { name: "set", arity: -3, keys: table!(1, 1, 1) },
    CommandSpec { name: "mset", arity: -3, keys: table!(1, -1, 2) },
    CommandSpec { name: "expire", arity: 3, keys: table!(1, 1, 1) },
    CommandSpec { name: "pexpire", arity: 3, keys: table!(1, 1, 1) },
    CommandSpec { name: "expireat", arity: 3, keys: table!(1, 1, 1) },
    CommandSpec { name: "pexpireat", arity: 3, keys: table!(1, 1, 1) },
    CommandSpec { name: "ttl", arity: 2, keys: table!(1, 1, 1) },
    CommandSpec { name: "pttl", arity: 2, keys: table!(1, 1, 1) },
    CommandSpec { name: "persist", arity: 2, keys: table!(1, 1, 1) },
    CommandSpec { name: "keys", arity: 2, keys: KeySpec::None },
    CommandSpec { name: "scan", arity: -2, keys: KeySpec::None },
    CommandSpec { name: "randomkey", arity: 1, keys: KeySpec::None },
    CommandSpec { name: "dbsize", arity: 1, keys: KeySpec::None },
    CommandSpec { name: "select", arity: 2, keys: KeySpec::None },
    CommandSpec { name: "swapdb", arity: 3, keys: KeySpec::None },
    CommandSpec { name: "flushdb", arity: -1, keys: KeySpec::None },
    CommandSpec { name: "flushall", arity: -1, keys: KeySpec::None },
    CommandSpec { name: "lastsave", arity: 1, keys: KeySpec::None },
    CommandSpec { name: "shutdown", arity: -1, keys: KeySpec::None },
    CommandSpec { name: "zunionstore", arity: -4, keys: KeySpec::ZStore },
    CommandSpec { name: "zinterstore", arity: -4, keys: KeySpec::ZStore },
    CommandSpec { name: "eval", arity: -3, keys: KeySpec::Eval },
    CommandSpec { name: "evalsha", arity: -3, keys: KeySpec::Eval },
    CommandSpec { name: "sort", arity: -2, keys: KeySpec::Sort },
    CommandSpec { name: "migrate", arity: -6, keys: KeySpec::Migrate },
    CommandSpec { name: "georadius", arity: -6, keys: KeySpec::GeoRadius },
    CommandSpec { name: "georadiusbymember", arity: -5, keys: KeySpec::GeoRadius },
    CommandSpec { name: "xread", arity: -4, keys: KeySpec::XRead },
];

/// Case-insensitive command table lookup.
pub fn lookup_command(name: &[u8]) -> Option<&'static CommandSpec> {
    COMMANDS
        .iter()
        .find(|spec| spec.name.as_bytes().eq_ignore_ascii_case(name))
}

/// Returns the key argument positions for a command invocation.
pub fn keys_from_command(spec: &CommandSpec, argv: &[Bytes]) -> Vec<usize> {
    match spec.keys {
        KeySpec::None => Vec::new(),
        KeySpec::Table { first, last, step } => table_keys(spec, argv, first, last, step),
        KeySpec::ZStore => zstore_keys(argv),
        KeySpec::Eval => eval_keys(argv),
        KeySpec::Sort => sort_keys(argv),
        KeySpec::Migrate => migrate_keys(argv),
        KeySpec::GeoRadius => georadius_keys(argv),
        KeySpec::XRead => xread_keys(argv),
    }
}

fn arg_eq(arg: &[u8], word: &str) -> bool {
    arg.eq_ignore_ascii_case(word.as_bytes())
}

fn parse_count(arg: &[u8]) -> Option<i64> {
    std::str::from_utf8(arg).ok()?.parse().ok()
}

fn table_keys(
    spec: &CommandSpec,
    argv: &[Bytes],
    first: usize,
    last: isize,
    step: usize,
) -> Vec<usize> {
    let argc = argv.len();
    let last = if last < 0 {
        argc as isize + last
    } else {
        last
    };
    let mut keys = Vec::new();
    let mut j = first;
    while (j as isize) <= last {
        if j >= argc {
            // commands with variable arity defer the error to their own
            // arity check; a fixed-arity command that lands here has a
            // broken table entry
            assert!(
                spec.arity < 0,
                "command table key positions do not match the arity of '{}'",
                spec.name
            );
            return Vec::new();
        }
        keys.push(j);
        j += step;
    }
    keys
}

/// ZUNIONSTORE/ZINTERSTORE: `<dest> <numkeys> <key>...` — the sources
/// come first, the destination last.
fn zstore_keys(argv: &[Bytes]) -> Vec<usize> {
    let argc = argv.len();
    let Some(num) = argv.get(2).and_then(|a| parse_count(a)) else {
        return Vec::new();
    };
    if num < 1 || num as usize > argc.saturating_sub(3) {
        return Vec::new();
    }
    let mut keys: Vec<usize> = (3..3 + num as usize).collect();
    keys.push(1);
    keys
}

/// EVAL/EVALSHA: `<script> <numkeys> <key>...`.
fn eval_keys(argv: &[Bytes]) -> Vec<usize> {
    let argc = argv.len();
    let Some(num) = argv.get(2).and_then(|a| parse_count(a)) else {
        return Vec::new();
    };
    if num <= 0 || num as usize > argc.saturating_sub(3) {
        return Vec::new();
    }
    (3..3 + num as usize).collect()
}

/// SORT: the sort key is always argv[1]; a trailing `STORE <dest>`
/// contributes the destination. Options with their own arguments are
/// skipped so an argument value spelled "store" is not misread.
fn sort_keys(argv: &[Bytes]) -> Vec<usize> {
    const SKIP: &[(&str, usize)] = &[("limit", 2), ("get", 1), ("by", 1)];
    let argc = argv.len();
    let mut store = None;
    let mut i = 2;
    while i < argc {
        let mut skipped = false;
        for (name, skip) in SKIP {
            if arg_eq(&argv[i], name) {
                i += skip;
                skipped = true;
                break;
            }
        }
        // the last STORE wins, same as the command itself
        if !skipped && arg_eq(&argv[i], "store") && i + 1 < argc {
            store = Some(i + 1);
        }
        i += 1;
    }
    let mut keys = vec![1];
    keys.extend(store);
    keys
}

/// MIGRATE: the single-key form holds the key at argv[3]; the multi-key
/// form has an empty argv[3] and a `KEYS <key>...` tail.
fn migrate_keys(argv: &[Bytes]) -> Vec<usize> {
    let argc = argv.len();
    let mut first = 3;
    let mut num = 1;
    if argc > 6 {
        for i in 6..argc {
            if arg_eq(&argv[i], "keys") && argv.get(3).is_some_and(|a| a.is_empty()) {
                first = i + 1;
                num = argc - first;
                break;
            }
        }
    }
    if first >= argc {
        return Vec::new();
    }
    (first..first + num).collect()
}

/// GEORADIUS[BYMEMBER]: the queried key plus an optional STORE or
/// STOREDIST destination; when both are given the later one wins.
fn georadius_keys(argv: &[Bytes]) -> Vec<usize> {
    let argc = argv.len();
    let mut stored = None;
    let mut i = 5;
    while i < argc {
        if (arg_eq(&argv[i], "store") || arg_eq(&argv[i], "storedist")) && i + 1 < argc {
            stored = Some(i + 1);
            i += 1;
        }
        i += 1;
    }
    let mut keys = vec![1];
    keys.extend(stored);
    keys
}

/// XREAD: everything after STREAMS splits evenly into keys then ids;
/// the keys are the first half.
fn xread_keys(argv: &[Bytes]) -> Vec<usize> {
    let argc = argv.len();
    let mut streams_pos = None;
    let mut i = 1;
    while i < argc {
        if arg_eq(&argv[i], "block") || arg_eq(&argv[i], "count") {
            i += 1;
        } else if arg_eq(&argv[i], "group") {
            i += 2;
        } else if arg_eq(&argv[i], "noack") {
            // nothing to skip
        } else if arg_eq(&argv[i], "streams") {
            streams_pos = Some(i);
            break;
        } else {
            break; // syntax error territory
        }
        i += 1;
    }
    let Some(pos) = streams_pos else {
        return Vec::new();
    };
    let num = argc - pos - 1;
    if num == 0 || num % 2 != 0 {
        return Vec::new();
    }
    let num = num / 2;
    (pos + 1..pos + 1 + num).collect()
}
