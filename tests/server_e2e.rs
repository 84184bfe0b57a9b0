use anyhow::Result;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use sharebox::db::Direction;
use sharebox::logger::NoopLogger;
use sharebox::server::Server;
use sharebox::sqlite::SqliteStore;

struct Client {
    stream: TcpStream,
}

impl Client {
    fn connect(port: u16) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        Self { stream }
    }

    fn send(&mut self, line: &str) {
        self.stream.write_all(line.as_bytes()).unwrap();
        self.stream.write_all(b"\n").unwrap();
    }

    fn recv_line(&mut self) -> String {
        let mut out = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let n = self.stream.read(&mut byte).unwrap();
            assert!(n > 0, "connection closed while waiting for a line");
            match byte[0] {
                b'\n' => break,
                b'\r' => {}
                b => out.push(b),
            }
        }
        String::from_utf8(out).unwrap()
    }

    fn recv_exact(&mut self, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        self.stream.read_exact(&mut buf).unwrap();
        buf
    }

    fn send_bytes(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).unwrap();
    }

    fn expect(&mut self, line: &str) {
        assert_eq!(self.recv_line(), line);
    }

    /// Authenticate, retrying while a previous session of the same user is
    /// still being torn down.
    fn auth(&mut self, user: &str, pass: &str) {
        for _ in 0..100u32 {
            self.send(&format!("AUTH {user} {pass}"));
            let resp = self.recv_line();
            if resp == "OK 200 Authenticated" {
                return;
            }
            assert!(resp.starts_with("ERR 409"), "unexpected AUTH reply: {resp}");
            std::thread::sleep(Duration::from_millis(20));
        }
        panic!("AUTH {user} never succeeded");
    }
}

fn start_server() -> Result<(tempfile::TempDir, Arc<Server>, u16)> {
    let dir = tempfile::tempdir()?;
    let store = Arc::new(SqliteStore::open(dir.path().join("meta.db"))?);
    let server = Arc::new(Server::new(
        dir.path().join("data"),
        store,
        Box::new(NoopLogger),
    )?);

    let port = {
        let sock = TcpListener::bind("127.0.0.1:0")?;
        let p = sock.local_addr()?.port();
        drop(sock);
        p
    };
    let srv = Arc::clone(&server);
    std::thread::spawn(move || {
        let _ = srv.serve(&format!("127.0.0.1:{port}"));
    });

    // Wait for the listener to come up.
    for _ in 0..50u32 {
        if TcpStream::connect(("127.0.0.1", port)).is_ok() {
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    Ok((dir, server, port))
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn register_auth_and_stats() -> Result<()> {
    let (_dir, _server, port) = start_server()?;
    let mut c = Client::connect(port);

    // Gated verbs answer 401 and keep the session usable.
    c.send("LIST_DB");
    c.expect("ERR 401 Not authenticated");

    c.send("REGISTER alice pw");
    c.expect("OK 201 Registered");
    c.send("AUTH alice pw");
    c.expect("OK 200 Authenticated");
    c.send("STATS");
    c.expect("OK 200 online=1 bytes_in=0 bytes_out=0");
    c.send("WHO");
    c.expect("OK 200 Users online: alice");

    c.send("AUTH alice wrong");
    c.expect("ERR 403 Invalid credentials");

    // A second connection for the same user is refused while the first is
    // online.
    let mut c2 = Client::connect(port);
    c2.send("AUTH alice pw");
    c2.expect("ERR 409 User already logged in");

    c.send("LOGOUT");
    c.expect("OK 200 Logged out");
    c.send("LIST_DB");
    c.expect("ERR 401 Not authenticated");
    Ok(())
}

#[test]
fn text_round_trip_delete_restore() -> Result<()> {
    let (_dir, _server, port) = start_server()?;
    let mut c = Client::connect(port);
    c.send("REGISTER alice pw");
    c.expect("OK 201 Registered");
    c.auth("alice", "pw");

    c.send("PUT_TEXT notes.txt 5");
    c.expect("OK 100 Ready to receive");
    c.send_bytes(b"hello");
    c.expect("OK 200 Text file updated");

    c.send("GET_TEXT notes.txt");
    c.expect("OK 100 5");
    assert_eq!(c.recv_exact(5), b"hello");

    c.send("LIST_DB");
    c.expect("OK 200 1");
    assert_eq!(c.recv_line(), "notes.txt|5|0");

    c.send("DELETE notes.txt");
    c.expect("OK 200 Deleted");
    c.send("LIST_DB");
    c.expect("OK 200 0");
    c.send("LIST_DELETED");
    c.expect("OK 200 1");
    let tombstone = c.recv_line();
    assert!(tombstone.starts_with("notes.txt|5|"), "{tombstone}");

    c.send("RESTORE notes.txt");
    c.expect("OK 200 Restored");
    c.send("GET_TEXT notes.txt");
    c.expect("OK 100 5");
    assert_eq!(c.recv_exact(5), b"hello");

    // Idempotent rewrite leaves usage unchanged.
    c.send("PUT_TEXT notes.txt 5");
    c.expect("OK 100 Ready to receive");
    c.send_bytes(b"hello");
    c.expect("OK 200 Text file updated");
    Ok(())
}

#[test]
fn sharing_grants_and_denies() -> Result<()> {
    let (_dir, server, port) = start_server()?;
    let mut alice = Client::connect(port);
    alice.send("REGISTER alice pw");
    alice.expect("OK 201 Registered");
    alice.auth("alice", "pw");

    let mut bob = Client::connect(port);
    bob.send("REGISTER bob pw");
    bob.expect("OK 201 Registered");
    bob.auth("bob", "pw");

    alice.send("PUT_TEXT notes.txt 5");
    alice.expect("OK 100 Ready to receive");
    alice.send_bytes(b"hello");
    alice.expect("OK 200 Text file updated");

    // Unshared: bob sees nothing.
    bob.send("GET_TEXT notes.txt");
    bob.expect("ERR 403 Permission denied");

    alice.send("SET_PERMISSION notes.txt bob 1 1 0");
    alice.expect("OK 200 Permission set");

    bob.send("CHECK_PERMISSION notes.txt");
    bob.expect("OK 200 view=1 download=1 edit=0");
    bob.send("GET_TEXT notes.txt");
    bob.expect("OK 100 5");
    assert_eq!(bob.recv_exact(5), b"hello");
    bob.send("DOWNLOAD notes.txt");
    bob.expect("OK 100 5");
    assert_eq!(bob.recv_exact(5), b"hello");

    bob.send("PUT_TEXT notes.txt 3");
    bob.expect("ERR 403 Permission denied (edit required)");

    // Sharing never grants delete.
    bob.send("DELETE notes.txt");
    bob.expect("ERR 404 File not found");

    // With edit granted, bob writes into alice's tree and her quota pays.
    alice.send("SET_PERMISSION notes.txt bob 1 1 1");
    alice.expect("OK 200 Permission set");
    bob.send("PUT_TEXT notes.txt 3");
    bob.expect("OK 100 Ready to receive");
    bob.send_bytes(b"bye");
    bob.expect("OK 200 Text file updated");

    alice.send("GET_TEXT notes.txt");
    alice.expect("OK 100 3");
    assert_eq!(alice.recv_exact(3), b"bye");
    let rec = server.store().get_user_by_username("alice")?.unwrap();
    assert_eq!(rec.used_bytes, 3);
    Ok(())
}

#[test]
fn upload_download_and_resume() -> Result<()> {
    let (_dir, server, port) = start_server()?;
    let body = pattern(1000);

    let mut c = Client::connect(port);
    c.send("REGISTER alice pw");
    c.expect("OK 201 Registered");
    c.auth("alice", "pw");

    // Zero-byte upload makes an empty file and charges nothing.
    c.send("UPLOAD 0 empty.bin");
    c.expect("OK 100 Ready to receive");
    c.expect("OK 200 Upload completed");
    assert_eq!(server.quota().used("alice"), 0);

    // Stream 400 of 1000 bytes, then vanish.
    c.send("UPLOAD 1000 big.bin");
    c.expect("OK 100 Ready to receive");
    c.send_bytes(&body[..400]);
    drop(c);

    // The server checkpoints the bytes it safely received.
    let uid = server.store().get_user_by_username("alice")?.unwrap().id;
    let mut checkpoint = None;
    for _ in 0..100u32 {
        checkpoint = server
            .store()
            .get_transfer_session(uid, "big.bin", Direction::Upload)?;
        if checkpoint.is_some() {
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    let checkpoint = checkpoint.expect("no upload checkpoint recorded");
    assert_eq!(checkpoint.total_bytes, 1000);
    assert_eq!(checkpoint.offset_bytes, 400);

    let mut c = Client::connect(port);
    c.auth("alice", "pw");
    c.send("CONTINUE_UPLOAD big.bin");
    c.expect("OK 100 Continue from 400 size 600");
    c.send_bytes(&body[400..]);
    c.expect("OK 200 Upload completed");

    assert!(server
        .store()
        .get_transfer_session(uid, "big.bin", Direction::Upload)?
        .is_none());
    assert_eq!(server.quota().used("alice"), 1000);

    c.send("DOWNLOAD big.bin");
    c.expect("OK 100 1000");
    assert_eq!(c.recv_exact(1000), body);

    // Paused download resumes from the requested offset.
    c.send("PAUSE_DOWNLOAD big.bin 400");
    c.expect("OK 200 Download paused at offset 400");
    c.send("CONTINUE_DOWNLOAD big.bin");
    c.expect("OK 100 Continue from 400 size 600");
    assert_eq!(c.recv_exact(600), &body[400..]);
    assert!(server
        .store()
        .get_transfer_session(uid, "big.bin", Direction::Download)?
        .is_none());
    Ok(())
}

#[test]
fn quota_rejects_before_any_bytes() -> Result<()> {
    let (dir, server, port) = start_server()?;
    server.store().create_user("carol", "pw", 10)?;

    let mut c = Client::connect(port);
    c.auth("carol", "pw");
    c.send("UPLOAD 11 x");
    c.expect("ERR 403 Quota exceeded");

    assert!(!dir.path().join("data/carol/x").exists());
    assert!(!dir.path().join("data/carol/x.tmp").exists());
    assert_eq!(server.quota().used("carol"), 0);
    assert_eq!(server.store().get_user_by_username("carol")?.unwrap().used_bytes, 0);

    // The limit itself still fits.
    c.send("UPLOAD 10 x");
    c.expect("OK 100 Ready to receive");
    c.send_bytes(&[9u8; 10]);
    c.expect("OK 200 Upload completed");
    assert_eq!(server.quota().used("carol"), 10);
    Ok(())
}

#[test]
fn folders_rename_and_copy() -> Result<()> {
    let (dir, _server, port) = start_server()?;
    let mut c = Client::connect(port);
    c.send("REGISTER alice pw");
    c.expect("OK 201 Registered");
    c.auth("alice", "pw");

    c.send("CREATE_FOLDER docs");
    c.expect("OK 200 Folder created");
    assert!(dir.path().join("data/alice/docs").is_dir());

    c.send("UPLOAD 4 docs/a.bin");
    c.expect("OK 100 Ready to receive");
    c.send_bytes(b"abcd");
    c.expect("OK 200 Upload completed");

    c.send("RENAME docs/a.bin docs/b.bin");
    c.expect("OK 200 Renamed");
    c.send("DOWNLOAD docs/b.bin");
    c.expect("OK 100 4");
    assert_eq!(c.recv_exact(4), b"abcd");

    // Renaming onto an occupied path changes nothing.
    c.send("UPLOAD 2 docs/c.bin");
    c.expect("OK 100 Ready to receive");
    c.send_bytes(b"xy");
    c.expect("OK 200 Upload completed");
    c.send("RENAME docs/c.bin docs/b.bin");
    c.expect("ERR 500 Rename failed");
    c.send("DOWNLOAD docs/b.bin");
    c.expect("OK 100 4");
    assert_eq!(c.recv_exact(4), b"abcd");

    // Whole-directory copy duplicates the nested files.
    c.send("COPY docs backup");
    c.expect("OK 200 Copied");
    c.send("DOWNLOAD backup/b.bin");
    c.expect("OK 100 4");
    assert_eq!(c.recv_exact(4), b"abcd");
    c.send("DOWNLOAD backup/c.bin");
    c.expect("OK 100 2");
    assert_eq!(c.recv_exact(2), b"xy");

    // Traversal attempts are rejected outright.
    c.send("DELETE ../alice");
    let resp = c.recv_line();
    assert!(resp.starts_with("ERR 400"), "{resp}");
    Ok(())
}

#[test]
fn unzip_extracts_under_target() -> Result<()> {
    let (dir, server, port) = start_server()?;

    // Build a small archive to push through the wire.
    let zip_bytes = {
        let mut cursor = std::io::Cursor::new(Vec::new());
        let mut zw = zip::ZipWriter::new(&mut cursor);
        let opts = zip::write::FileOptions::default();
        zw.start_file("docs/a.txt", opts).unwrap();
        zw.write_all(b"alpha").unwrap();
        zw.start_file("b.bin", opts).unwrap();
        zw.write_all(&[7u8; 64]).unwrap();
        zw.finish().unwrap();
        drop(zw);
        cursor.into_inner()
    };

    let mut c = Client::connect(port);
    c.send("REGISTER alice pw");
    c.expect("OK 201 Registered");
    c.auth("alice", "pw");

    c.send(&format!("UPLOAD {} pack.zip", zip_bytes.len()));
    c.expect("OK 100 Ready to receive");
    c.send_bytes(&zip_bytes);
    c.expect("OK 200 Upload completed");

    c.send("UNZIP pack.zip unpacked");
    c.expect("OK 200 Unzipped 2 entries");
    assert_eq!(
        std::fs::read(dir.path().join("data/alice/unpacked/docs/a.txt"))?,
        b"alpha"
    );

    c.send("GET_TEXT unpacked/docs/a.txt");
    c.expect("OK 100 5");
    assert_eq!(c.recv_exact(5), b"alpha");

    // zip bytes + 5 + 64 extracted bytes
    assert_eq!(
        server.quota().used("alice"),
        zip_bytes.len() as u64 + 69
    );

    c.send("UNZIP pack.bin");
    c.expect("ERR 415 Not a zip file");
    c.send("UNZIP missing.zip");
    c.expect("ERR 404 Zip file not found");
    Ok(())
}
