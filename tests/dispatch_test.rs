mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{test_bridge, test_bridge_with_config, EngineEvent, RecordingEngine, TestObject};
use hostbridge::error::{BridgeError, ScriptError};
use hostbridge::{BridgeConfig, TypeTag, Value};

#[test]
fn test_dispatched_calls_run_on_the_affinity_thread() {
    let engine = RecordingEngine::new();
    let bridge = test_bridge(Arc::clone(&engine));
    let main = bridge.init_main().unwrap();

    let obj = TestObject::arc("app.Widget");
    main.init_instance_from_any_thread(&obj).unwrap();

    // Call from the test thread and from a second caller thread.
    main.call_script(&obj, "refresh", TypeTag::Void, &[]).unwrap();
    let worker_main = Arc::clone(&main);
    let worker_obj = Arc::clone(&obj);
    std::thread::spawn(move || {
        worker_main
            .call_script(&worker_obj, "refresh", TypeTag::Void, &[])
            .unwrap();
    })
    .join()
    .unwrap();

    let threads: Vec<String> = engine
        .events()
        .iter()
        .filter_map(|event| match event {
            EngineEvent::Invoke { thread, .. } => Some(thread.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(threads.len(), 2);
    assert!(threads.iter().all(|name| name == "hostbridge-main"));

    bridge.shutdown();
}

#[test]
fn test_call_from_affinity_thread_runs_inline() {
    let engine = RecordingEngine::new();
    let bridge = test_bridge(Arc::clone(&engine));
    bridge.init_main().unwrap();

    let worker = bridge.spawn_worker("workers/nested.js").unwrap();

    // The handler dispatches back into script while it is the affinity
    // loop itself; a posted task could never drain and the nested call
    // would hang instead of completing.
    engine.nested_call_on_message();
    bridge.post_to_worker(worker, "go");

    assert!(engine.wait_for(Duration::from_secs(2), |event| matches!(
        event,
        EngineEvent::Invoke { method, thread, .. }
            if method == "status" && thread.starts_with('W')
    )));

    bridge.shutdown();
}

#[test]
fn test_calls_from_one_thread_complete_in_submission_order() {
    let engine = RecordingEngine::new();
    let bridge = test_bridge(Arc::clone(&engine));
    let main = bridge.init_main().unwrap();

    let obj = TestObject::arc("app.Widget");
    main.init_instance_from_any_thread(&obj).unwrap();

    let caller_main = Arc::clone(&main);
    let caller_obj = Arc::clone(&obj);
    std::thread::spawn(move || {
        for n in 0..8 {
            caller_main
                .call_script(&caller_obj, &format!("step-{}", n), TypeTag::Void, &[])
                .unwrap();
        }
    })
    .join()
    .unwrap();

    let methods: Vec<String> = engine
        .events()
        .iter()
        .filter_map(|event| match event {
            EngineEvent::Invoke { method, .. } if method.starts_with("step-") => {
                Some(method.clone())
            }
            _ => None,
        })
        .collect();
    let expected: Vec<String> = (0..8).map(|n| format!("step-{}", n)).collect();
    assert_eq!(methods, expected);

    bridge.shutdown();
}

#[test]
fn test_delayed_call_waits_before_dispatch() {
    let engine = RecordingEngine::new();
    let bridge = test_bridge(Arc::clone(&engine));
    let main = bridge.init_main().unwrap();

    let obj = TestObject::arc("app.Widget");
    main.init_instance_from_any_thread(&obj).unwrap();

    let delay = Duration::from_millis(100);
    let started = std::time::Instant::now();
    main.call_script_delayed(&obj, "tick", TypeTag::Void, delay, &[])
        .unwrap();
    assert!(started.elapsed() >= delay);

    assert_eq!(
        engine.count(|event| matches!(
            event,
            EngineEvent::Invoke { method, .. } if method == "tick"
        )),
        1
    );

    bridge.shutdown();
}

#[test]
fn test_call_returns_engine_result() {
    let engine = RecordingEngine::new();
    let bridge = test_bridge(Arc::clone(&engine));
    let main = bridge.init_main().unwrap();

    let obj = TestObject::arc("app.Widget");
    main.init_instance_from_any_thread(&obj).unwrap();

    engine.set_invoke_result(Ok(Value::Int(42)));
    let result = main
        .call_script(&obj, "count", TypeTag::Int, &[Value::Bool(true)])
        .unwrap();
    assert_eq!(result, Value::Int(42));

    bridge.shutdown();
}

#[test]
fn test_initializer_carries_constructor_flag() {
    let engine = RecordingEngine::new();
    let bridge = test_bridge(Arc::clone(&engine));
    let main = bridge.init_main().unwrap();

    let obj = TestObject::arc("app.Widget");
    main.init_instance_from_any_thread(&obj).unwrap();

    main.dispatch(&obj, "init", TypeTag::Void, true, None, &[Value::Int(1)])
        .unwrap();
    main.call_script(&obj, "update", TypeTag::Void, &[Value::Int(1)])
        .unwrap();

    let invokes: Vec<(String, bool, usize)> = engine
        .events()
        .iter()
        .filter_map(|event| match event {
            EngineEvent::Invoke {
                method,
                is_constructor,
                arg_count,
                ..
            } => Some((method.clone(), *is_constructor, *arg_count)),
            _ => None,
        })
        .collect();

    // The initializer gets one trailing boolean argument; other methods
    // do not.
    assert_eq!(invokes[0], ("init".to_string(), true, 2));
    assert_eq!(invokes[1], ("update".to_string(), false, 1));

    bridge.shutdown();
}

#[test]
fn test_engine_exception_propagates_to_caller() {
    let engine = RecordingEngine::new();
    let bridge = test_bridge(Arc::clone(&engine));
    let main = bridge.init_main().unwrap();

    let obj = TestObject::arc("app.Widget");
    main.init_instance_from_any_thread(&obj).unwrap();

    engine.set_invoke_result(Err(BridgeError::EngineException(ScriptError::new(
        "script threw",
        "at refresh",
    ))));
    let result = main.call_script(&obj, "refresh", TypeTag::Void, &[]);
    match result {
        Err(BridgeError::EngineException(error)) => assert_eq!(error.message, "script threw"),
        other => panic!("expected EngineException, got {:?}", other),
    }

    bridge.shutdown();
}

#[test]
fn test_discard_policy_swallows_engine_exceptions() {
    let engine = RecordingEngine::new();
    let config = BridgeConfig {
        discard_uncaught_exceptions: true,
        ..BridgeConfig::default()
    };
    let bridge = test_bridge_with_config(Arc::clone(&engine), config);
    let main = bridge.init_main().unwrap();

    let obj = TestObject::arc("app.Widget");
    main.init_instance_from_any_thread(&obj).unwrap();

    engine.set_invoke_result(Err(BridgeError::EngineException(ScriptError::new(
        "script threw",
        "",
    ))));
    let result = main.call_script(&obj, "refresh", TypeTag::Void, &[]).unwrap();
    assert_eq!(result, Value::Null);

    // The suppressed error still reaches the engine's discard hook.
    assert!(engine.wait_for(Duration::from_secs(1), |event| matches!(
        event,
        EngineEvent::Raised {
            discarded: true,
            message,
            ..
        } if message == "script threw"
    )));

    bridge.shutdown();
}

#[test]
fn test_dispatch_unregistered_target_fails() {
    let engine = RecordingEngine::new();
    let bridge = test_bridge(Arc::clone(&engine));
    let main = bridge.init_main().unwrap();

    let obj = TestObject::arc("app.Widget");
    let result = main.call_script(&obj, "refresh", TypeTag::Void, &[]);
    assert!(matches!(result, Err(BridgeError::InvalidArgument(_))));

    bridge.shutdown();
}

#[test]
fn test_init_instance_creates_shadow_once() {
    let engine = RecordingEngine::new();
    let bridge = test_bridge(Arc::clone(&engine));
    let main = bridge.init_main().unwrap();

    let obj = TestObject::arc("app.Widget");
    let first = main.init_instance_from_any_thread(&obj).unwrap();
    let second = main.init_instance_from_any_thread(&obj).unwrap();
    assert_eq!(first, second);

    let shadows = engine.count(|event| matches!(event, EngineEvent::Shadow { .. }));
    assert_eq!(shadows, 1);

    bridge.shutdown();
}

#[test]
#[should_panic(expected = "off the affinity thread")]
fn test_init_instance_rejects_foreign_thread() {
    let engine = RecordingEngine::new();
    let bridge = test_bridge(engine);
    let main = bridge.init_main().unwrap();

    let obj = TestObject::arc("app.Widget");
    // The test thread is not the instance's affinity thread.
    let _ = main.init_instance(&obj);
}

#[test]
fn test_init_main_is_single_shot() {
    let engine = RecordingEngine::new();
    let bridge = test_bridge(engine);
    bridge.init_main().unwrap();
    assert!(matches!(
        bridge.init_main(),
        Err(BridgeError::InvalidArgument(_))
    ));
    bridge.shutdown();
}

#[test]
fn test_shutdown_is_idempotent() {
    let engine = RecordingEngine::new();
    let bridge = test_bridge(engine);
    bridge.init_main().unwrap();
    bridge.shutdown();
    bridge.shutdown();
    assert_eq!(bridge.instance_count(), 0);
}
