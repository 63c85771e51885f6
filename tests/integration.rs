use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};

use aofdis::aof::{Aof, DEFAULT_FLUSH_INTERVAL};
use aofdis::codec::FrameCodec;
use aofdis::commands;
use aofdis::config::Config;
use aofdis::connection::Connection;
use aofdis::frame::Frame;
use aofdis::server;
use aofdis::store::Store;

struct TestServer {
    addr: SocketAddr,
    aof: Aof,
    store: Store,
    replayed: usize,
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<Result<(), aofdis::Error>>,
}

impl TestServer {
    async fn start(aof_path: &Path) -> TestServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let aof = Aof::open(aof_path, DEFAULT_FLUSH_INTERVAL).await.unwrap();
        let store = Store::new();
        let registry = commands::registry(store.clone());
        let replayed = server::replay(&aof, &registry).await.unwrap();

        let (shutdown, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(server::serve(
            listener,
            aof.clone(),
            registry,
            FrameCodec::default(),
            rx,
        ));

        TestServer {
            addr,
            aof,
            store,
            replayed,
            shutdown,
            handle,
        }
    }

    async fn connect(&self) -> Connection {
        Connection::new(TcpStream::connect(self.addr).await.unwrap())
    }

    async fn stop(self) {
        self.shutdown.send(()).unwrap();
        timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("server did not drain its connections")
            .unwrap()
            .unwrap();
        self.aof.close().await.unwrap();
    }
}

fn command(parts: &[&str]) -> Frame {
    Frame::Array(
        parts
            .iter()
            .map(|part| Frame::Bulk(Bytes::copy_from_slice(part.as_bytes())))
            .collect(),
    )
}

async fn request(conn: &mut Connection, parts: &[&str]) -> Frame {
    request_frame(conn, command(parts)).await
}

async fn request_frame(conn: &mut Connection, frame: Frame) -> Frame {
    conn.write_frame(frame).await.unwrap();
    conn.read_frame().await.unwrap().unwrap()
}

fn file_len(path: &Path) -> u64 {
    std::fs::metadata(path).unwrap().len()
}

#[tokio::test]
async fn test_unknown_command() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(&dir.path().join("test.aof")).await;

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    stream
        .write_all(b"*2\r\n$4\r\nNOPE\r\n$1\r\nX\r\n")
        .await
        .unwrap();

    let mut reply = [0u8; 3];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"+\r\n");

    // The connection is still usable.
    stream
        .write_all(b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n")
        .await
        .unwrap();

    let mut reply = [0u8; 5];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"+OK\r\n");

    drop(stream);
    server.stop().await;
}

#[tokio::test]
async fn test_nested_argument_error_keeps_replies_in_sync() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(&dir.path().join("test.aof")).await;
    let mut conn = server.connect().await;

    let res = request_frame(
        &mut conn,
        Frame::Array(vec![
            Frame::Bulk(Bytes::from("GET")),
            Frame::Array(vec![Frame::Bulk(Bytes::from("a\r\nb"))]),
        ]),
    )
    .await;
    assert_eq!(
        res,
        Frame::Error("ERR invalid argument, expected simple or bulk string, got array".to_string())
    );

    // The next reply lines up with the next request.
    assert_eq!(
        request(&mut conn, &["PING"]).await,
        Frame::Simple("PONG".to_string())
    );

    drop(conn);
    server.stop().await;
}

#[tokio::test]
async fn test_malformed_request_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(&dir.path().join("test.aof")).await;
    let mut conn = server.connect().await;

    // Neither of these get a reply.
    conn.write_frame(Frame::Bulk(Bytes::from("foo"))).await.unwrap();
    conn.write_frame(Frame::Array(vec![])).await.unwrap();
    conn.write_frame(Frame::Array(vec![Frame::Integer(1)]))
        .await
        .unwrap();

    // The first reply that comes back belongs to the next valid request.
    assert_eq!(
        request(&mut conn, &["PING"]).await,
        Frame::Simple("PONG".to_string())
    );
    assert_eq!(
        request(&mut conn, &["SET", "k", "v"]).await,
        Frame::Simple("OK".to_string())
    );

    drop(conn);
    server.stop().await;
}

#[tokio::test]
async fn test_invalid_frame_closes_connection() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(&dir.path().join("test.aof")).await;

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    stream.write_all(b"?what\r\n").await.unwrap();

    let mut buf = Vec::new();
    let read = timeout(Duration::from_secs(5), stream.read_to_end(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(read, 0);

    server.stop().await;
}

#[tokio::test]
async fn test_set_and_get() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(&dir.path().join("test.aof")).await;
    let mut conn = server.connect().await;

    assert_eq!(
        request(&mut conn, &["SET", "set_get_key_1", "1"]).await,
        Frame::Simple("OK".to_string())
    );
    assert_eq!(
        request(&mut conn, &["set", "set_get_key_2", "Argentina"]).await,
        Frame::Simple("OK".to_string())
    );

    assert_eq!(
        request(&mut conn, &["GET", "set_get_key_1"]).await,
        Frame::Bulk(Bytes::from("1"))
    );
    assert_eq!(
        request(&mut conn, &["get", "set_get_key_2"]).await,
        Frame::Bulk(Bytes::from("Argentina"))
    );
    assert_eq!(
        request(&mut conn, &["GET", "set_get_nonexistentkey"]).await,
        Frame::Null
    );
    assert_eq!(
        request(&mut conn, &["SET", "only_key"]).await,
        Frame::Error("ERR wrong number of arguments for 'set' command".to_string())
    );

    drop(conn);
    server.stop().await;
}

#[tokio::test]
async fn test_only_write_commands_are_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.aof");
    let server = TestServer::start(&path).await;
    let mut conn = server.connect().await;

    request(&mut conn, &["SET", "k", "v"]).await;
    let after_set = file_len(&path);
    assert_eq!(after_set, command(&["SET", "k", "v"]).serialize().len() as u64);

    request(&mut conn, &["GET", "k"]).await;
    request(&mut conn, &["HGET", "h", "f"]).await;
    request(&mut conn, &["HGETALL", "h"]).await;
    request(&mut conn, &["PING"]).await;
    request(&mut conn, &["NOPE"]).await;
    assert_eq!(file_len(&path), after_set);

    request(&mut conn, &["HSET", "h", "f", "v"]).await;
    assert_eq!(
        file_len(&path),
        after_set + command(&["HSET", "h", "f", "v"]).serialize().len() as u64
    );

    drop(conn);
    server.stop().await;
}

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.aof");

    let server = TestServer::start(&path).await;
    assert_eq!(server.replayed, 0);

    let mut conn = server.connect().await;
    request(&mut conn, &["SET", "a", "1"]).await;
    request(&mut conn, &["SET", "a", "2"]).await;
    request(&mut conn, &["SET", "binary", "line\r\nbreak"]).await;
    request(&mut conn, &["HSET", "h", "f1", "v1", "f2", "v2"]).await;
    drop(conn);

    let live_size = server.store.lock().size();
    server.stop().await;
    let len = file_len(&path);

    let server = TestServer::start(&path).await;
    assert_eq!(server.replayed, 4);
    // Replay does not write anything back.
    assert_eq!(file_len(&path), len);
    assert_eq!(server.store.lock().size(), live_size);

    let mut conn = server.connect().await;
    assert_eq!(
        request(&mut conn, &["GET", "a"]).await,
        Frame::Bulk(Bytes::from("2"))
    );
    assert_eq!(
        request(&mut conn, &["GET", "binary"]).await,
        Frame::Bulk(Bytes::from("line\r\nbreak"))
    );
    assert_eq!(
        request(&mut conn, &["HGET", "h", "f2"]).await,
        Frame::Bulk(Bytes::from("v2"))
    );

    drop(conn);
    server.stop().await;
}

#[tokio::test]
async fn test_concurrent_clients() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.aof");
    let server = TestServer::start(&path).await;

    let mut clients = Vec::new();
    for client in 0..10 {
        let mut conn = server.connect().await;
        clients.push(tokio::spawn(async move {
            for i in 0..10 {
                let key = format!("key-{}-{}", client, i);
                let res = request(&mut conn, &["SET", key.as_str(), "value"]).await;
                assert_eq!(res, Frame::Simple("OK".to_string()));
            }
        }));
    }
    for client in clients {
        client.await.unwrap();
    }

    server.stop().await;

    let server = TestServer::start(&path).await;
    assert_eq!(server.replayed, 100);
    assert_eq!(server.store.lock().size(), 100);
    server.stop().await;
}

#[tokio::test]
async fn test_shutdown_closes_idle_connections() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(&dir.path().join("test.aof")).await;

    let mut conn = server.connect().await;
    assert_eq!(
        request(&mut conn, &["PING"]).await,
        Frame::Simple("PONG".to_string())
    );

    // The client stays connected, the server must not wait for it.
    server.stop().await;

    assert_eq!(conn.read_frame().await.unwrap(), None);
}

#[tokio::test]
async fn test_redis_client() {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(&dir.path().join("test.aof")).await;

    let client = redis::Client::open(format!("redis://{}/", server.addr)).unwrap();
    let mut con = client.get_multiplexed_async_connection().await.unwrap();

    let _: () = redis::cmd("SET")
        .arg("greeting")
        .arg("hello")
        .query_async(&mut con)
        .await
        .unwrap();
    let greeting: Option<String> = redis::cmd("GET")
        .arg("greeting")
        .query_async(&mut con)
        .await
        .unwrap();
    let missing: Option<String> = redis::cmd("GET")
        .arg("missing")
        .query_async(&mut con)
        .await
        .unwrap();

    assert_eq!(greeting.as_deref(), Some("hello"));
    assert_eq!(missing, None);

    let added: i64 = redis::cmd("HSET")
        .arg("user")
        .arg("name")
        .arg("Ada")
        .arg("lang")
        .arg("Rust")
        .query_async(&mut con)
        .await
        .unwrap();
    let all: HashMap<String, String> = redis::cmd("HGETALL")
        .arg("user")
        .query_async(&mut con)
        .await
        .unwrap();

    assert_eq!(added, 2);
    assert_eq!(all.len(), 2);
    assert_eq!(all["name"], "Ada");
    assert_eq!(all["lang"], "Rust");

    drop(con);
    drop(client);
    server.stop().await;
}

#[tokio::test]
async fn test_run_fails_on_corrupt_log() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.aof");

    let mut contents = command(&["SET", "a", "1"]).serialize();
    contents.extend_from_slice(b"*3\r\n$3\r\nSET");
    std::fs::write(&path, &contents).unwrap();

    let config = Config {
        port: 0,
        aof_path: path.clone(),
        ..Config::default()
    };

    let res = server::run(config, std::future::pending::<()>()).await;

    assert!(res.is_err());
    // Nothing was appended or truncated.
    assert_eq!(std::fs::read(&path).unwrap(), contents);
}

#[tokio::test]
async fn test_run_replays_and_stops() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.aof");

    let contents = command(&["SET", "a", "1"]).serialize();
    std::fs::write(&path, &contents).unwrap();

    let config = Config {
        port: 0,
        aof_path: path.clone(),
        ..Config::default()
    };

    timeout(Duration::from_secs(5), server::run(config, async {}))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(std::fs::read(&path).unwrap(), contents);
}
