use std::{sync::Arc, time::Duration};

use tokio::time::timeout;

use modkv::{
    engine::{Engine, EngineConfig},
    plugins::SystemPlugin,
    resp::RespValue,
    session::Session,
};

use crate::test_utils::{FaultyPlugin, TestEnv, TestUtils};

#[tokio::test]
async fn test_session_replies_in_order() {
    let env = TestEnv::new();
    let session = Session::new(&env.engine, "ordered");
    let runner = tokio::spawn(Arc::clone(&session).run());

    let commands = vec![
        TestUtils::hset_command("foo0", "bar", "1"),
        TestUtils::hget_command("foo0", "bar"),
        TestUtils::command("NOPE", "", &[]),
        TestUtils::hlen_command("foo0"),
    ];
    for command in commands {
        assert!(session.submit(command).await);
    }

    let expected = vec![
        RespValue::ok(),
        RespValue::bulk("1"),
        RespValue::Error("ERR unknown command 'NOPE'".to_string()),
        RespValue::Integer(1),
    ];
    for reply in expected {
        assert_eq!(session.receive().await, Some(reply));
    }

    session.stop();
    timeout(Duration::from_secs(1), runner)
        .await
        .expect("session loop should end once stopped")
        .unwrap();
}

#[tokio::test]
async fn test_session_survives_plugin_panic() {
    let mut engine = Engine::new(EngineConfig::default());
    engine.register_plugin(Arc::new(FaultyPlugin)).unwrap();
    engine
        .register_plugin(Arc::new(SystemPlugin::new("unused.mkv")))
        .unwrap();
    let engine = Arc::new(engine);

    let session = Session::new(&engine, "faulty");
    tokio::spawn(Arc::clone(&session).run());

    assert!(session.submit(TestUtils::command("BOOM", "", &[])).await);
    assert!(session.submit(TestUtils::command("PING", "", &[])).await);

    assert_eq!(
        session.receive().await,
        Some(RespValue::Error("ERR [FAULTY] runtime fault: boom".to_string()))
    );
    assert_eq!(
        session.receive().await,
        Some(RespValue::SimpleString("PONG".to_string()))
    );
    assert!(session.is_running());

    session.stop();
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let env = TestEnv::new();
    let session = Session::new(&env.engine, "stopping");

    assert_eq!(env.engine.stats().active_sessions, 2);
    assert_eq!(env.engine.stats().total_sessions, 2);

    session.stop();
    session.stop();

    assert!(!session.is_running());
    assert_eq!(env.engine.stats().active_sessions, 1);
    assert_eq!(env.engine.stats().total_sessions, 2);

    assert!(!session.submit(TestUtils::command("PING", "", &[])).await);
    assert!(!session.send(RespValue::ok()).await);
    assert_eq!(session.receive().await, None);
}

#[tokio::test]
async fn test_pseudo_session_never_replies() {
    let env = TestEnv::new();
    let session = Session::pseudo(&env.engine, "replication:test");

    assert!(!session.has_outbound());
    assert!(!session.send(RespValue::ok()).await);
    assert!(!session.submit(TestUtils::command("PING", "", &[])).await);
    assert_eq!(session.receive().await, None);

    session.stop();
}

#[tokio::test]
async fn test_full_outbound_queue_blocks_producer() {
    let env = TestEnv::with_config(EngineConfig {
        out_queue_capacity: 1,
        ..EngineConfig::default()
    });
    let session = Session::new(&env.engine, "slow-consumer");

    assert!(session.send(RespValue::Integer(1)).await);
    assert!(
        timeout(Duration::from_millis(100), session.send(RespValue::Integer(2)))
            .await
            .is_err(),
        "second send should wait for room"
    );

    assert_eq!(session.receive().await, Some(RespValue::Integer(1)));
    assert!(session.send(RespValue::Integer(3)).await);
    assert_eq!(session.receive().await, Some(RespValue::Integer(3)));

    // Stopping releases a producer blocked on the full queue.
    assert!(session.send(RespValue::Integer(4)).await);
    let blocked = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.send(RespValue::Integer(5)).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    session.stop();

    assert!(!blocked.await.unwrap());
}

#[tokio::test]
async fn test_closed_queues_drain_before_finishing() {
    let env = TestEnv::new();
    let session = Session::new(&env.engine, "draining");

    for i in 0..3 {
        assert!(
            session
                .submit(TestUtils::set_command(&format!("k{}", i), "v"))
                .await
        );
    }
    session.close_inbound();
    assert!(!session.submit(TestUtils::get_command("k0")).await);

    timeout(Duration::from_secs(1), Arc::clone(&session).run())
        .await
        .expect("session loop should end once its input is drained");
    assert_eq!(env.engine.keyspace_len().await, 3);

    session.close_outbound();
    for _ in 0..3 {
        assert_eq!(session.receive().await, Some(RespValue::ok()));
    }
    assert_eq!(session.receive().await, None);
    assert!(session.is_running());

    session.stop();
}
