use std::io;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpListener;

use cachegw_client::{BackendConnection, ConnectionPool, Connector, RespConnector};
use cachegw_common::{BackendError, PoolConfig};

/// Scripted backend: answers the `idx`-th command with whatever `handler`
/// returns. An empty reply means "stay silent".
async fn spawn_server(handler: fn(usize, &[Vec<u8>]) -> Vec<u8>) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut idx = 0;
        while let Ok(Some(args)) = read_command(&mut reader).await {
            let reply = handler(idx, &args);
            idx += 1;
            if !reply.is_empty() && write_half.write_all(&reply).await.is_err() {
                break;
            }
        }
    });

    port
}

async fn read_command(reader: &mut BufReader<OwnedReadHalf>) -> io::Result<Option<Vec<Vec<u8>>>> {
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    let count = parse_header(&line, '*')?;
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        line.clear();
        reader.read_line(&mut line).await?;
        let len = parse_header(&line, '$')?;
        let mut data = vec![0u8; len + 2];
        reader.read_exact(&mut data).await?;
        data.truncate(len);
        args.push(data);
    }
    Ok(Some(args))
}

fn parse_header(line: &str, prefix: char) -> io::Result<usize> {
    line.trim_end()
        .strip_prefix(prefix)
        .and_then(|digits| digits.parse().ok())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "bad header"))
}

fn connector_for(port: u16) -> RespConnector {
    RespConnector::from_config(&PoolConfig {
        target_host: "127.0.0.1".to_string(),
        target_port: port,
        io_timeout: Some(Duration::from_millis(200)),
        ..PoolConfig::default()
    })
}

#[tokio::test]
async fn set_then_get_roundtrip() {
    let port = spawn_server(|idx, args| {
        if idx == 0 {
            assert_eq!(args[0], b"SET");
            assert_eq!(args[1], b"key");
            assert_eq!(args[2], b"value");
            b"+OK\r\n".to_vec()
        } else {
            assert_eq!(args[0], b"GET");
            assert_eq!(args[1], b"key");
            b"$5\r\nvalue\r\n".to_vec()
        }
    })
    .await;

    let mut conn = connector_for(port).connect().await.expect("connect");
    assert!(conn.set("key", b"value").await.expect("set"));
    let value = conn.get("key").await.expect("get");
    assert_eq!(value, Some(Bytes::from_static(b"value")));
}

#[tokio::test]
async fn missing_key_is_none() {
    let port = spawn_server(|_, _| b"$-1\r\n".to_vec()).await;

    let mut conn = connector_for(port).connect().await.expect("connect");
    assert_eq!(conn.get("test_key").await.expect("get"), None);
}

#[tokio::test]
async fn refused_set_is_not_acknowledged() {
    let port = spawn_server(|_, _| b"$-1\r\n".to_vec()).await;

    let mut conn = connector_for(port).connect().await.expect("connect");
    assert!(!conn.set("key", b"value").await.expect("set"));
}

#[tokio::test]
async fn server_error_reply_keeps_connection_usable() {
    let port = spawn_server(|idx, _| {
        if idx == 0 {
            b"-WRONGTYPE Operation against a key holding the wrong kind of value\r\n".to_vec()
        } else {
            b"+PONG\r\n".to_vec()
        }
    })
    .await;

    let mut conn = connector_for(port).connect().await.expect("connect");
    let err = conn.get("list").await.expect_err("server error");
    assert!(matches!(&err, BackendError::Server { message } if message.starts_with("WRONGTYPE")));
    assert!(!err.is_connection_fault());
    conn.ping().await.expect("ping after error reply");
}

#[tokio::test]
async fn reply_split_across_reads_is_reassembled() {
    let port = spawn_server(|_, _| {
        let mut reply = b"$11\r\nhello".to_vec();
        reply.extend_from_slice(b" world\r\n");
        reply
    })
    .await;

    let mut conn = connector_for(port).connect().await.expect("connect");
    let value = conn.get("greeting").await.expect("get");
    assert_eq!(value, Some(Bytes::from_static(b"hello world")));
}

#[tokio::test]
async fn silent_backend_times_out() {
    let port = spawn_server(|_, _| Vec::new()).await;

    let mut conn = connector_for(port).connect().await.expect("connect");
    let err = conn.get("key").await.expect_err("timeout");
    assert!(matches!(err, BackendError::Timeout(_)));
    assert!(err.is_connection_fault());
}

#[tokio::test]
async fn closed_backend_is_an_io_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        drop(stream);
    });

    let mut conn = connector_for(port).connect().await.expect("connect");
    let err = conn.get("key").await.expect_err("io error");
    assert!(matches!(err, BackendError::Io(_)));
}

#[tokio::test]
async fn unreachable_backend_fails_to_connect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    drop(listener);

    let result = connector_for(port).connect().await;
    assert!(result.is_err());
}

#[tokio::test]
async fn pool_runs_commands_over_resp() {
    let port = spawn_server(|_, args| {
        assert_eq!(args[0], b"GET");
        b"$3\r\nbar\r\n".to_vec()
    })
    .await;

    let config = PoolConfig {
        target_host: "127.0.0.1".to_string(),
        target_port: port,
        max_connections: 1,
        ..PoolConfig::default()
    };
    let pool = ConnectionPool::new(RespConnector::from_config(&config), config).expect("pool");

    for _ in 0..3 {
        let mut handle = pool.borrow().await.expect("borrow");
        let value = handle.get("foo").await.expect("get");
        assert_eq!(value, Some(Bytes::from_static(b"bar")));
        pool.release(handle);
    }
    assert_eq!(pool.stats().opened, 1);
    assert_eq!(pool.drain().await.closed, 1);
}
