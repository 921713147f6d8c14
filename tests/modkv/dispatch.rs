use std::sync::{Arc, atomic::Ordering};

use async_trait::async_trait;

use modkv::{
    command::Command,
    engine::{
        CommandError, CommandResult, CommandSpec, Engine, EngineConfig, Entry, Plugin,
        PluginManifest, RegistryError,
    },
    plugins::{HashTablePlugin, register_builtin},
    resp::RespValue,
    session::Session,
};

use crate::test_utils::{CountingPlugin, FaultyPlugin, TestEnv, TestUtils};

/// Declares a fresh command next to one the hash plugin already owns
struct ConflictingPlugin;

#[async_trait]
impl Plugin for ConflictingPlugin {
    fn manifest(&self) -> PluginManifest {
        PluginManifest {
            name: "CONFLICT",
            commands: vec![
                CommandSpec::reader("CFRESH", "", 0),
                CommandSpec::writer("hset", "", 2),
            ],
            types: vec!["CONFLICT"],
        }
    }

    async fn handle(
        &self,
        command: &Command,
        _entry: Option<Arc<Entry>>,
        _session: &Arc<Session>,
    ) -> Result<CommandResult, CommandError> {
        Err(CommandError::UnknownCommand(command.name().to_string()))
    }
}

#[tokio::test]
async fn test_hash_commands() {
    let env = TestEnv::new();

    env.exec_success(TestUtils::hset_command("foo0", "bar", "baz"), RespValue::ok())
        .await;
    env.exec_success(TestUtils::hset_command("foo0", "qux", "1"), RespValue::ok())
        .await;

    let test_cases = vec![
        (TestUtils::hget_command("foo0", "bar"), RespValue::bulk("baz")),
        (TestUtils::hget_command("foo0", "missing"), RespValue::Null),
        (TestUtils::hget_command("nokey", "bar"), RespValue::Null),
        (TestUtils::hlen_command("foo0"), RespValue::Integer(2)),
        (TestUtils::hlen_command("nokey"), RespValue::Integer(0)),
        (
            TestUtils::command("HGETALL", "foo0", &[]),
            RespValue::Array(vec![
                RespValue::bulk("bar"),
                RespValue::bulk("baz"),
                RespValue::bulk("qux"),
                RespValue::bulk("1"),
            ]),
        ),
        (
            TestUtils::command("HDEL", "foo0", &["qux"]),
            RespValue::Integer(1),
        ),
        (
            TestUtils::command("HDEL", "foo0", &["qux"]),
            RespValue::Integer(0),
        ),
        (TestUtils::hlen_command("foo0"), RespValue::Integer(1)),
    ];

    for (command, expected) in test_cases {
        env.exec_success(command, expected).await;
    }

    // Readers never create entries.
    assert_eq!(env.engine.keyspace_len().await, 1);
}

#[tokio::test]
async fn test_dispatch_errors() {
    let env = TestEnv::new();

    env.exec_success(TestUtils::set_command("greeting", "hello"), RespValue::ok())
        .await;

    let test_cases = vec![
        (
            TestUtils::command("NOPE", "foo0", &[]),
            CommandError::UnknownCommand("NOPE".to_string()),
        ),
        (
            TestUtils::command("HSET", "foo0", &["bar"]),
            CommandError::WrongArity("HSET".to_string()),
        ),
        (
            TestUtils::command("HSET", "", &["bar", "baz"]),
            CommandError::WrongArity("HSET".to_string()),
        ),
        (
            TestUtils::command("HGET", "foo0", &["bar", "baz"]),
            CommandError::WrongArity("HGET".to_string()),
        ),
        (
            TestUtils::hget_command("greeting", "bar"),
            CommandError::WrongType,
        ),
        (
            TestUtils::hset_command("greeting", "bar", "baz"),
            CommandError::WrongType,
        ),
        (
            TestUtils::command("INCRBY", "greeting", &["1"]),
            CommandError::plugin("STRING", "value is not an integer or out of range"),
        ),
        (
            TestUtils::command("INCRBY", "counter", &["one"]),
            CommandError::plugin("STRING", "delta is not an integer"),
        ),
    ];

    for (command, expected) in test_cases {
        env.exec_error(command, expected).await;
    }

    let result = env
        .exec(TestUtils::command("JSET", "doc", &[".", "{not json"]))
        .await;
    assert!(
        matches!(
            &result,
            Err(CommandError::Plugin { plugin, message })
                if plugin == "JSON" && message.starts_with("Invalid JSON")
        ),
        "{:?}",
        result
    );

    env.exec_success(TestUtils::get_command("greeting"), RespValue::bulk("hello"))
        .await;
}

#[tokio::test]
async fn test_command_names_are_case_insensitive() {
    let env = TestEnv::new();

    env.exec_success(TestUtils::command("hset", "foo0", &["bar", "baz"]), RespValue::ok())
        .await;
    env.exec_success(TestUtils::command("HgEt", "foo0", &["bar"]), RespValue::bulk("baz"))
        .await;
}

#[tokio::test]
async fn test_string_and_json_commands() {
    let env = TestEnv::new();

    let test_cases = vec![
        (TestUtils::get_command("name"), RespValue::Null),
        (TestUtils::set_command("name", "ada"), RespValue::ok()),
        (TestUtils::get_command("name"), RespValue::bulk("ada")),
        (
            TestUtils::command("INCRBY", "visits", &["5"]),
            RespValue::Integer(5),
        ),
        (
            TestUtils::command("INCRBY", "visits", &["-2"]),
            RespValue::Integer(3),
        ),
        (
            TestUtils::command("JSET", "user", &[".", r#"{"name":"ada","tags":[]}"#]),
            RespValue::ok(),
        ),
        (
            TestUtils::command("JSET", "user", &["tags[0]", r#""admin""#]),
            RespValue::ok(),
        ),
        (
            TestUtils::command("JSET", "user", &["address.city", r#""London""#]),
            RespValue::ok(),
        ),
        (
            TestUtils::command("JQUERY", "user", &["name"]),
            RespValue::bulk("ada"),
        ),
        (
            TestUtils::command("JQUERY", "user", &["tags"]),
            RespValue::bulk(r#"["admin"]"#),
        ),
        (
            TestUtils::command("JQUERY", "user", &["address.city"]),
            RespValue::bulk("London"),
        ),
        (
            TestUtils::command("JQUERY", "user", &["missing"]),
            RespValue::Null,
        ),
        (
            TestUtils::command("JGET", "user", &[]),
            RespValue::bulk(r#"{"address":{"city":"London"},"name":"ada","tags":["admin"]}"#),
        ),
        (TestUtils::command("JGET", "nobody", &[]), RespValue::Null),
    ];

    for (command, expected) in test_cases {
        env.exec_success(command, expected).await;
    }
}

#[tokio::test]
async fn test_deep_json_path_is_rejected() {
    let env = TestEnv::new();
    let path = vec!["a"; 300_000].join(".");

    env.exec_error(
        TestUtils::command("JSET", "doc", &[&path, "1"]),
        CommandError::plugin("JSON", "document would nest deeper than 100 levels"),
    )
    .await;
    env.exec_success(
        TestUtils::command("JQUERY", "doc", &[&path]),
        RespValue::Null,
    )
    .await;
    env.exec_success(
        TestUtils::command("PING", "", &[]),
        RespValue::SimpleString("PONG".to_string()),
    )
    .await;
}

#[tokio::test]
async fn test_system_commands() {
    let env = TestEnv::new();

    env.exec_success(
        TestUtils::command("PING", "", &[]),
        RespValue::SimpleString("PONG".to_string()),
    )
    .await;
    env.exec_success(TestUtils::command("PING", "hello", &[]), RespValue::bulk("hello"))
        .await;

    env.exec_success(TestUtils::hset_command("foo0", "bar", "baz"), RespValue::ok())
        .await;

    let Ok(CommandResult::Response(RespValue::BulkString(info))) =
        env.exec(TestUtils::command("INFO", "", &[])).await
    else {
        panic!("INFO should reply with a bulk string");
    };

    let info = String::from_utf8(info.to_vec()).unwrap();
    assert!(info.contains("keys:1"), "{}", info);
    assert!(info.contains("role:master"), "{}", info);
    assert!(info.contains("master_state:offline"), "{}", info);
    assert!(info.contains("active_sessions:1"), "{}", info);
    assert!(info.contains("plugins:SYSTEM,REPLICATION,HASH,STRING,JSON"), "{}", info);
}

#[tokio::test]
async fn test_concurrent_first_writes_create_one_entry() {
    let plugin = Arc::new(CountingPlugin::default());

    let mut engine = Engine::new(EngineConfig::default());
    engine.register_plugin(plugin.clone()).unwrap();
    let engine = Arc::new(engine);

    let mut handles = Vec::new();
    for i in 0..50 {
        let engine = Arc::clone(&engine);
        handles.push(tokio::spawn(async move {
            let session = Session::pseudo(&engine, format!("writer-{}", i));
            engine
                .dispatch(&TestUtils::command("CINC", "shared", &[]), &session)
                .await
        }));
    }

    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }

    assert_eq!(plugin.created.load(Ordering::SeqCst), 1);
    assert_eq!(engine.keyspace_len().await, 1);

    let session = Session::pseudo(&engine, "reader");
    assert_eq!(
        engine
            .dispatch(&TestUtils::command("CINC", "shared", &[]), &session)
            .await,
        Ok(CommandResult::Response(RespValue::Integer(51)))
    );
}

#[tokio::test]
async fn test_plugin_panic_is_reported_as_plugin_error() {
    let mut engine = Engine::new(EngineConfig::default());
    engine.register_plugin(Arc::new(FaultyPlugin)).unwrap();
    let engine = Arc::new(engine);
    let session = Session::pseudo(&engine, "client");

    assert_eq!(
        engine
            .dispatch(&TestUtils::command("BOOM", "", &[]), &session)
            .await,
        Err(CommandError::plugin("FAULTY", "runtime fault: boom"))
    );
}

#[tokio::test]
async fn test_register_plugin_conflicts() {
    let mut engine = Engine::new(EngineConfig::default());
    register_builtin(&mut engine, "unused.mkv").unwrap();

    assert_eq!(
        engine.register_plugin(Arc::new(HashTablePlugin)),
        Err(RegistryError::DuplicatePlugin("HASH".to_string()))
    );

    let counting = Arc::new(CountingPlugin::default());
    engine.register_plugin(counting.clone()).unwrap();
    assert_eq!(
        engine.register_plugin(counting),
        Err(RegistryError::DuplicatePlugin("COUNTER".to_string()))
    );

    assert_eq!(
        engine.register_plugin(Arc::new(ConflictingPlugin)),
        Err(RegistryError::DuplicateCommand {
            command: "HSET".to_string(),
            plugin: "CONFLICT".to_string(),
            owner: "HASH".to_string(),
        })
    );
    // Nothing of a rejected manifest is registered.
    assert!(engine.descriptor("CFRESH").is_none());
    assert!(!engine.plugins().contains(&"CONFLICT"));

    assert!(engine.descriptor("cinc").is_some());
    assert_eq!(engine.descriptor("HSET").map(|d| d.plugin_name), Some("HASH"));
}
