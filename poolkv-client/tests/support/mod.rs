//! In-process RESP2 store used by the integration tests.
//!
//! Thread per connection, one shared keyspace per database index, blocking
//! BLPOP on a condvar. Only the commands the client issues are understood.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use poolkv_client::PoolConfig;

#[derive(Debug, Clone, Default)]
pub struct MockOptions {
    /// Require AUTH with this password before any other command.
    pub password: Option<String>,
    /// Answer every SELECT with an error reply.
    pub reject_select: bool,
    /// Answer a successful BLPOP with only the list name.
    pub short_blpop_reply: bool,
}

#[derive(Default)]
struct Db {
    strings: HashMap<String, String>,
    lists: HashMap<String, VecDeque<String>>,
    ttls: HashMap<String, u64>,
}

impl Db {
    fn contains(&self, key: &str) -> bool {
        self.strings.contains_key(key) || self.lists.contains_key(key)
    }

    fn remove(&mut self, key: &str) -> bool {
        self.ttls.remove(key);
        let string = self.strings.remove(key).is_some();
        let list = self.lists.remove(key).is_some();
        string || list
    }
}

struct Shared {
    options: MockOptions,
    dbs: Mutex<HashMap<i64, Db>>,
    pushed: Condvar,
    log: Mutex<Vec<Vec<String>>>,
    accepted: AtomicUsize,
}

pub struct MockStore {
    port: u16,
    shared: Arc<Shared>,
}

enum Reply {
    Simple(&'static str),
    Error(String),
    Integer(i64),
    Bulk(Option<String>),
    Array(Option<Vec<String>>),
}

impl MockStore {
    pub fn start() -> Self {
        Self::with_options(MockOptions::default())
    }

    pub fn with_options(options: MockOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let shared = Arc::new(Shared {
            options,
            dbs: Mutex::new(HashMap::new()),
            pushed: Condvar::new(),
            log: Mutex::new(Vec::new()),
            accepted: AtomicUsize::new(0),
        });

        let accept_shared = shared.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { continue };
                accept_shared.accepted.fetch_add(1, Ordering::SeqCst);
                let shared = accept_shared.clone();
                thread::spawn(move || serve(stream, shared));
            }
        });

        MockStore { port, shared }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Pool config pointing at this store with a 1s timeout and no warm-up.
    pub fn config(&self) -> PoolConfig {
        PoolConfig {
            host: "127.0.0.1".to_string(),
            port: self.port,
            timeout_ms: 1_000,
            password: None,
            database: 0,
            min_idle: 0,
            max_size: 2,
        }
    }

    pub fn accepted(&self) -> usize {
        self.shared.accepted.load(Ordering::SeqCst)
    }

    /// Every command received so far, upper-cased name first.
    pub fn commands(&self) -> Vec<Vec<String>> {
        self.shared.log.lock().unwrap().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.commands().iter().filter(|cmd| cmd[0] == name).count()
    }

    pub fn string(&self, db: i64, key: &str) -> Option<String> {
        let dbs = self.shared.dbs.lock().unwrap();
        dbs.get(&db).and_then(|db| db.strings.get(key).cloned())
    }
}

/// Installs a test-friendly subscriber once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A port nothing listens on.
pub fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.local_addr().expect("addr").port()
}

fn serve(stream: TcpStream, shared: Arc<Shared>) {
    let mut writer = match stream.try_clone() {
        Ok(writer) => writer,
        Err(_) => return,
    };
    let mut reader = BufReader::new(stream);
    let mut db = 0i64;
    let mut authed = shared.options.password.is_none();

    loop {
        let args = match read_command(&mut reader) {
            Ok(Some(args)) => args,
            _ => return,
        };
        shared.log.lock().unwrap().push(args.clone());

        let reply = if !authed && args[0] != "AUTH" {
            Reply::Error("NOAUTH Authentication required.".into())
        } else {
            dispatch(&args, &shared, &mut db, &mut authed)
        };
        if write_reply(&mut writer, reply).is_err() {
            return;
        }
    }
}

fn dispatch(args: &[String], shared: &Shared, db: &mut i64, authed: &mut bool) -> Reply {
    let arity_error = || Reply::Error(format!("ERR wrong number of arguments for '{}'", args[0]));

    match args[0].as_str() {
        "PING" => Reply::Simple("PONG"),
        "AUTH" => {
            if args.len() != 2 {
                return arity_error();
            }
            if shared.options.password.as_deref() == Some(args[1].as_str()) {
                *authed = true;
                Reply::Simple("OK")
            } else {
                Reply::Error("WRONGPASS invalid password".into())
            }
        }
        "SELECT" => {
            if shared.options.reject_select {
                return Reply::Error("ERR DB index is out of range".into());
            }
            match args.get(1).and_then(|raw| raw.parse().ok()) {
                Some(index) => {
                    *db = index;
                    Reply::Simple("OK")
                }
                None => Reply::Error("ERR invalid DB index".into()),
            }
        }
        "BLPOP" => blpop(args, shared, *db),
        _ => {
            let mut dbs = shared.dbs.lock().unwrap();
            let store = dbs.entry(*db).or_default();
            let reply = keyspace_command(args, store);
            if args[0] == "RPUSH" {
                shared.pushed.notify_all();
            }
            reply
        }
    }
}

fn keyspace_command(args: &[String], db: &mut Db) -> Reply {
    let arg = |idx: usize| args.get(idx).cloned().unwrap_or_default();

    match args[0].as_str() {
        "SET" => {
            let key = arg(1);
            db.remove(&key);
            db.strings.insert(key.clone(), arg(2));
            if args.len() == 5 && args[3].eq_ignore_ascii_case("EX") {
                db.ttls.insert(key, args[4].parse().unwrap_or(0));
            }
            Reply::Simple("OK")
        }
        "GET" => Reply::Bulk(db.strings.get(&arg(1)).cloned()),
        "GETSET" => {
            let key = arg(1);
            db.ttls.remove(&key);
            Reply::Bulk(db.strings.insert(key, arg(2)))
        }
        "DEL" => Reply::Integer(args[1..].iter().filter(|key| db.remove(key)).count() as i64),
        "EXISTS" => Reply::Integer(args[1..].iter().filter(|key| db.contains(key)).count() as i64),
        "EXPIRE" => {
            let key = arg(1);
            if db.contains(&key) {
                db.ttls.insert(key, arg(2).parse().unwrap_or(0));
                Reply::Integer(1)
            } else {
                Reply::Integer(0)
            }
        }
        "TTL" => {
            let key = arg(1);
            if !db.contains(&key) {
                Reply::Integer(-2)
            } else {
                Reply::Integer(db.ttls.get(&key).map(|s| *s as i64).unwrap_or(-1))
            }
        }
        "KEYS" => {
            let pattern = arg(1);
            let keys = db
                .strings
                .keys()
                .chain(db.lists.keys())
                .filter(|key| glob_match::glob_match(&pattern, key))
                .cloned()
                .collect();
            Reply::Array(Some(keys))
        }
        "RPUSH" => {
            let list = db.lists.entry(arg(1)).or_default();
            list.extend(args[2..].iter().cloned());
            Reply::Integer(list.len() as i64)
        }
        "LPOP" => Reply::Bulk(pop_front(db, &arg(1))),
        "LLEN" => Reply::Integer(db.lists.get(&arg(1)).map(|l| l.len() as i64).unwrap_or(0)),
        "LRANGE" => {
            let list = db.lists.get(&arg(1));
            let len = list.map(|l| l.len() as i64).unwrap_or(0);
            let normalize = |raw: String| {
                let idx: i64 = raw.parse().unwrap_or(0);
                if idx < 0 { (len + idx).max(0) } else { idx }
            };
            let start = normalize(arg(2));
            let stop = normalize(arg(3)).min(len - 1);
            let items = match list {
                Some(list) if start <= stop => list
                    .iter()
                    .skip(start as usize)
                    .take((stop - start + 1) as usize)
                    .cloned()
                    .collect(),
                _ => Vec::new(),
            };
            Reply::Array(Some(items))
        }
        "FLUSHDB" => {
            *db = Db::default();
            Reply::Simple("OK")
        }
        other => Reply::Error(format!("ERR unknown command '{other}'")),
    }
}

fn pop_front(db: &mut Db, list: &str) -> Option<String> {
    let items = db.lists.get_mut(list)?;
    let value = items.pop_front();
    if items.is_empty() {
        db.lists.remove(list);
    }
    value
}

fn blpop(args: &[String], shared: &Shared, db: i64) -> Reply {
    if args.len() < 3 {
        return Reply::Error("ERR wrong number of arguments for 'BLPOP'".into());
    }
    let lists = &args[1..args.len() - 1];
    let timeout: u64 = args[args.len() - 1].parse().unwrap_or(0);
    let deadline = match timeout {
        0 => None,
        secs => Instant::now().checked_add(Duration::from_secs(secs)),
    };

    let mut dbs = shared.dbs.lock().unwrap();
    loop {
        let store = dbs.entry(db).or_default();
        for list in lists {
            if let Some(value) = pop_front(store, list) {
                if shared.options.short_blpop_reply {
                    return Reply::Array(Some(vec![list.clone()]));
                }
                return Reply::Array(Some(vec![list.clone(), value]));
            }
        }
        match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Reply::Array(None);
                }
                dbs = shared.pushed.wait_timeout(dbs, deadline - now).unwrap().0;
            }
            None => dbs = shared.pushed.wait(dbs).unwrap(),
        }
    }
}

fn read_command(reader: &mut BufReader<TcpStream>) -> std::io::Result<Option<Vec<String>>> {
    let mut line = Vec::new();
    if !read_line(reader, &mut line)? {
        return Ok(None);
    }
    if line.first() != Some(&b'*') {
        return Err(invalid("expected array"));
    }
    let count = parse_usize(&line[1..])?;
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        if !read_line(reader, &mut line)? {
            return Ok(None);
        }
        if line.first() != Some(&b'$') {
            return Err(invalid("expected bulk"));
        }
        let len = parse_usize(&line[1..])?;
        let mut data = vec![0u8; len + 2];
        reader.read_exact(&mut data)?;
        data.truncate(len);
        args.push(String::from_utf8_lossy(&data).into_owned());
    }
    if let Some(name) = args.first_mut() {
        *name = name.to_ascii_uppercase();
    }
    Ok(Some(args))
}

fn read_line(reader: &mut BufReader<TcpStream>, buf: &mut Vec<u8>) -> std::io::Result<bool> {
    buf.clear();
    if reader.read_until(b'\n', buf)? == 0 {
        return Ok(false);
    }
    if !buf.ends_with(b"\r\n") {
        return Err(invalid("invalid line"));
    }
    buf.truncate(buf.len() - 2);
    Ok(true)
}

fn parse_usize(data: &[u8]) -> std::io::Result<usize> {
    std::str::from_utf8(data)
        .ok()
        .and_then(|text| text.parse().ok())
        .ok_or_else(|| invalid("length"))
}

fn invalid(msg: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg.to_string())
}

fn write_reply(stream: &mut TcpStream, reply: Reply) -> std::io::Result<()> {
    let mut out = Vec::new();
    encode_reply(&mut out, reply);
    stream.write_all(&out)?;
    stream.flush()
}

fn encode_reply(out: &mut Vec<u8>, reply: Reply) {
    match reply {
        Reply::Simple(text) => out.extend_from_slice(format!("+{text}\r\n").as_bytes()),
        Reply::Error(text) => out.extend_from_slice(format!("-{text}\r\n").as_bytes()),
        Reply::Integer(value) => out.extend_from_slice(format!(":{value}\r\n").as_bytes()),
        Reply::Bulk(None) => out.extend_from_slice(b"$-1\r\n"),
        Reply::Bulk(Some(data)) => {
            out.extend_from_slice(format!("${}\r\n{data}\r\n", data.len()).as_bytes())
        }
        Reply::Array(None) => out.extend_from_slice(b"*-1\r\n"),
        Reply::Array(Some(items)) => {
            out.extend_from_slice(format!("*{}\r\n", items.len()).as_bytes());
            for item in items {
                encode_reply(out, Reply::Bulk(Some(item)));
            }
        }
    }
}
