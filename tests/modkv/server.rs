use std::time::Duration;

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    time::timeout,
};

use modkv::resp::RespValue;

use crate::test_utils::{TestEnv, TestUtils};

#[tokio::test]
async fn test_hset_hget_over_tcp() {
    let env = TestEnv::new();
    let (address, _shutdown) = env.start_server().await;
    let (mut reader, mut writer) = TestUtils::connect(address).await;

    let test_cases = vec![
        (TestUtils::hset_command("foo0", "bar", "baz"), RespValue::ok()),
        (TestUtils::hget_command("foo0", "bar"), RespValue::bulk("baz")),
        (TestUtils::hget_command("foo0", "nope"), RespValue::Null),
        (
            TestUtils::set_command("foo0", "x"),
            RespValue::Error(
                "WRONGTYPE Operation against a key holding the wrong kind of value".to_string(),
            ),
        ),
        (
            TestUtils::command("HGET", "foo0", &[]),
            RespValue::Error("ERR wrong number of arguments for 'HGET' command".to_string()),
        ),
        (
            TestUtils::command("FLY", "", &[]),
            RespValue::Error("ERR unknown command 'FLY'".to_string()),
        ),
    ];

    for (command, expected) in test_cases {
        assert_eq!(
            TestUtils::request(&mut reader, &mut writer, &command).await,
            expected,
            "running {:?}",
            command
        );
    }
}

#[tokio::test]
async fn test_pipelined_commands_reply_in_order() {
    let env = TestEnv::new();
    let (address, _shutdown) = env.start_server().await;
    let (mut reader, mut writer) = TestUtils::connect(address).await;

    let mut pipeline = Vec::new();
    for i in 1..=20 {
        let command = TestUtils::command("INCRBY", "counter", &["1"]);
        pipeline.extend_from_slice(&command.to_resp().encode());
        if i % 5 == 0 {
            pipeline.extend_from_slice(b"PING\r\n");
        }
    }
    writer.write_all(&pipeline).await.unwrap();

    for i in 1..=20 {
        assert_eq!(TestUtils::read_reply(&mut reader).await, RespValue::Integer(i));
        if i % 5 == 0 {
            assert_eq!(
                TestUtils::read_reply(&mut reader).await,
                RespValue::SimpleString("PONG".to_string())
            );
        }
    }
}

#[tokio::test]
async fn test_half_closed_client_gets_every_reply() {
    let env = TestEnv::new();
    let (address, _shutdown) = env.start_server().await;
    let (mut reader, mut writer) = TestUtils::connect(address).await;

    let mut pipeline = Vec::new();
    for i in 0..200 {
        let command = TestUtils::set_command(&format!("k{}", i), "v");
        pipeline.extend_from_slice(&command.to_resp().encode());
    }
    writer.write_all(&pipeline).await.unwrap();
    writer.shutdown().await.unwrap();

    for _ in 0..200 {
        assert_eq!(TestUtils::read_reply(&mut reader).await, RespValue::ok());
    }

    let mut buffer = [0u8; 64];
    let read = timeout(Duration::from_secs(1), reader.read(&mut buffer))
        .await
        .expect("server should close the connection once drained")
        .unwrap();
    assert_eq!(read, 0);
    assert_eq!(env.engine.keyspace_len().await, 200);
}

#[tokio::test]
async fn test_protocol_error_closes_connection() {
    let env = TestEnv::new();
    let (address, _shutdown) = env.start_server().await;
    let (mut reader, mut writer) = TestUtils::connect(address).await;

    assert_eq!(
        TestUtils::request(&mut reader, &mut writer, &TestUtils::command("PING", "", &[])).await,
        RespValue::SimpleString("PONG".to_string())
    );

    writer.write_all(b"*1\r\n$x\r\nPING\r\n").await.unwrap();

    let mut buffer = [0u8; 64];
    let read = timeout(Duration::from_secs(1), reader.read(&mut buffer))
        .await
        .expect("server should close the connection")
        .unwrap();
    assert_eq!(read, 0, "no reply is sent for a malformed frame");

    let engine = env.engine.clone();
    TestUtils::wait_until(|| {
        let engine = engine.clone();
        async move { engine.stats().active_sessions == 1 }
    })
    .await;
    assert_eq!(env.engine.stats().total_sessions, 2);
}

#[tokio::test]
async fn test_shutdown_stops_sessions() {
    let env = TestEnv::new();
    let (address, shutdown) = env.start_server().await;
    let (mut reader, mut writer) = TestUtils::connect(address).await;

    assert_eq!(
        TestUtils::request(&mut reader, &mut writer, &TestUtils::command("PING", "", &[])).await,
        RespValue::SimpleString("PONG".to_string())
    );

    shutdown.send(()).unwrap();

    let mut buffer = [0u8; 64];
    let read = timeout(Duration::from_secs(1), reader.read(&mut buffer))
        .await
        .expect("connection should be closed on shutdown")
        .unwrap();
    assert_eq!(read, 0);
    assert!(!env.session.is_running());
}
