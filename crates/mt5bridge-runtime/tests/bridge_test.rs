//! End-to-end tests for the bridge against the offline runtime.
//!
//! Each test drives a `Bridge` through its public surface only and checks
//! the outcome against the runtime's counters.

use mt5bridge_runtime::marshal::{marshal_in, marshal_out};
use mt5bridge_runtime::{
    Bridge, BridgeConfig, BridgeError, EmbeddedRuntime, ErrorKind, OfflineRuntime, SUPPORTED_METHODS,
};
use serde_json::{Value, json};
use std::time::Duration;

fn started(runtime: OfflineRuntime) -> Bridge<OfflineRuntime> {
    let bridge = Bridge::new(runtime);
    bridge
        .initialize(&BridgeConfig::default())
        .expect("offline bring-up should succeed");
    bridge
}

#[test]
fn repeated_initialize_performs_one_handshake() {
    let bridge = started(OfflineRuntime::new());
    for _ in 0..5 {
        bridge.initialize(&BridgeConfig::default()).unwrap();
        assert_eq!(bridge.last_error(), None);
    }
    assert_eq!(bridge.runtime().stats().handshakes, 1);
}

#[test]
fn home_override_reaches_the_runtime() {
    let bridge = Bridge::new(OfflineRuntime::new());
    let config = BridgeConfig::default().with_home(Some("/opt/py".into()));
    bridge.initialize(&config).unwrap();

    let seen = bridge.runtime().last_config().unwrap();
    assert_eq!(seen.home.as_deref(), Some(std::path::Path::new("/opt/py")));
}

#[test]
fn eval_before_initialize_makes_no_external_call() {
    let bridge = Bridge::new(OfflineRuntime::connected());

    let err = bridge.eval(&json!({"method": "terminal_info"})).unwrap_err();
    assert!(matches!(err, BridgeError::NotInitialized));
    assert_eq!(bridge.last_error().as_deref(), Some("bridge not initialized"));
    assert_eq!(bridge.runtime().stats().external_calls, 0);
}

#[test]
fn malformed_requests_make_no_external_call() {
    let bridge = started(OfflineRuntime::connected());

    let cases = [
        (Value::Null, "malformed request: request is null"),
        (json!([1, 2]), "malformed request: request must be a JSON object"),
        (json!({}), "malformed request: missing method"),
        (json!({"method": null}), "malformed request: missing method"),
        (json!({"method": 7}), "malformed request: `method` must be a string"),
        (json!({"method": "close_all"}), "unknown method: close_all"),
        (
            json!({"method": "get_m1_bars", "count": 5}),
            "missing field `symbol` for method `get_m1_bars`",
        ),
    ];
    for (request, message) in cases {
        assert!(bridge.eval(&request).is_err(), "{request} should fail");
        assert_eq!(bridge.last_error().as_deref(), Some(message));
    }

    assert_eq!(bridge.runtime().stats().external_calls, 0);
}

#[test]
fn invalid_fields_are_rejected_before_the_call() {
    let bridge = started(OfflineRuntime::connected());

    for request in [
        json!({"method": "get_m1_bars", "symbol": "EURUSD", "count": 0}),
        json!({"method": "get_m1_bars", "symbol": "EURUSD", "count": true}),
        json!({"method": "get_bars", "symbol": "EURUSD", "timeframe": "M2", "count": 1}),
        json!({"method": "open_market_buy", "symbol": "EURUSD", "volume": -1.0}),
    ] {
        let err = bridge.eval(&request).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidField { .. }), "{request}: {err}");
    }

    assert_eq!(bridge.runtime().stats().external_calls, 0);
}

#[test]
fn disconnected_terminal_answers_null_without_error() {
    let bridge = started(OfflineRuntime::new());

    let bars = bridge
        .eval(&json!({"method": "get_m1_bars", "symbol": "EURUSD", "count": 10}))
        .unwrap();
    assert_eq!(bars, Value::Null);
    assert_eq!(bridge.last_error(), None);
    assert_eq!(bridge.eval_json(r#"{"method":"terminal_info"}"#).unwrap(), "null");
}

#[test]
fn m1_bars_come_back_as_records() {
    let bridge = started(OfflineRuntime::connected());

    let bars = bridge
        .eval(&json!({"method": "get_m1_bars", "symbol": "EURUSD", "count": 10}))
        .unwrap();
    let bars = bars.as_array().unwrap();
    assert_eq!(bars.len(), 10);
    for pair in bars.windows(2) {
        assert_eq!(pair[1]["time"].as_i64().unwrap() - pair[0]["time"].as_i64().unwrap(), 60);
    }
    assert!(bars[0]["open"].is_f64());
}

#[test]
fn get_bars_honours_timeframe_and_start() {
    let bridge = started(OfflineRuntime::connected());

    let latest = bridge
        .eval(&json!({"method": "get_bars", "symbol": "EURUSD", "timeframe": "H1", "count": 1}))
        .unwrap();
    let earlier = bridge
        .eval(&json!({"method": "get_bars", "symbol": "EURUSD", "timeframe": "H1", "start": 2, "count": 1}))
        .unwrap();
    assert_eq!(
        latest[0]["time"].as_i64().unwrap() - earlier[0]["time"].as_i64().unwrap(),
        2 * 3_600
    );
}

#[test]
fn out_of_range_bar_windows_fail_without_disturbing_the_bridge() {
    let bridge = started(OfflineRuntime::connected());

    for request in [
        json!({"method": "get_bars", "symbol": "EURUSD", "timeframe": "H1", "start": 9_000_000_000_000_000_000i64, "count": 1}),
        json!({"method": "get_bars", "symbol": "EURUSD", "timeframe": "MN1", "start": i64::MAX, "count": 2}),
        json!({"method": "get_m1_bars", "symbol": "EURUSD", "count": 10_000_000_000i64}),
        json!({"method": "get_m1_bars", "symbol": "EURUSD", "count": i64::MAX}),
    ] {
        let err = bridge.eval(&request).unwrap_err();
        assert!(matches!(err, BridgeError::ExternalCall(_)), "{request}: {err}");
        assert_eq!(
            bridge.last_error().as_deref(),
            Some("copy_rates_from_pos: invalid arguments")
        );
    }

    let bars = bridge
        .eval(&json!({"method": "get_m1_bars", "symbol": "EURUSD", "count": 2}))
        .unwrap();
    assert_eq!(bars.as_array().map(Vec::len), Some(2));
    assert_eq!(bridge.runtime().stats().live_objects, 0);
}

#[test]
fn market_orders_open_positions() {
    let bridge = started(OfflineRuntime::connected());

    let fill = bridge
        .eval(&json!({"method": "open_market_buy", "symbol": "EURUSD", "volume": 0.1}))
        .unwrap();
    assert_eq!(fill["retcode"], 10009);
    assert_eq!(fill["request"], json!({"action": 1, "symbol": "EURUSD", "volume": 0.1, "type": 0}));

    bridge
        .eval(&json!({"method": "open_market_sell", "symbol": "GBPUSD", "volume": 0.2}))
        .unwrap();

    let all = bridge.eval(&json!({"method": "positions_get"})).unwrap();
    assert_eq!(all.as_array().map(Vec::len), Some(2));

    let gbp = bridge
        .eval(&json!({"method": "positions_get", "symbol": "GBPUSD"}))
        .unwrap();
    assert_eq!(gbp.as_array().map(Vec::len), Some(1));
    assert_eq!(gbp[0]["type"], 1);
}

#[test]
fn every_method_result_is_accepted_back_as_input() {
    let bridge = started(OfflineRuntime::connected());
    let codec = OfflineRuntime::new();

    for name in SUPPORTED_METHODS {
        let request = json!({
            "method": name,
            "symbol": "EURUSD",
            "timeframe": "M5",
            "count": 3,
            "volume": 0.5
        });
        let result = bridge.eval(&request).unwrap();
        assert!(!result.is_null(), "{name} answered null");

        let session = codec.enter();
        let native = marshal_in(&session, &result).unwrap();
        assert_eq!(marshal_out(&session, &native).unwrap(), result, "{name}");
    }
    assert_eq!(codec.stats().live_objects, 0);
}

#[test]
fn module_exceptions_are_recorded_verbatim() {
    let bridge = started(OfflineRuntime::connected().with_fault("account_info", "IPC timeout"));

    let err = bridge.eval(&json!({"method": "account_info"})).unwrap_err();
    assert!(matches!(err, BridgeError::ExternalCall(_)));
    assert_eq!(err.kind(), ErrorKind::ExternalCall);
    assert_eq!(bridge.last_error().as_deref(), Some("IPC timeout"));
}

#[test]
fn every_call_clears_the_previous_error() {
    let bridge = started(OfflineRuntime::connected());

    bridge.eval(&json!({"method": "nope"})).unwrap_err();
    assert!(bridge.last_error().is_some());

    bridge.eval(&json!({"method": "version"})).unwrap();
    assert_eq!(bridge.last_error(), None);

    bridge.eval(&json!({"method": "nope"})).unwrap_err();
    bridge.shutdown();
    assert_eq!(bridge.last_error(), None);
}

#[test]
fn failing_calls_release_every_native_object() {
    let bridge = started(OfflineRuntime::connected().with_fault("symbol_info", "boom"));

    for _ in 0..50 {
        bridge.eval(&json!({"method": "symbol_info", "symbol": "EURUSD"})).unwrap_err();
        bridge.eval(&json!({"method": "get_bars", "symbol": "EURUSD", "timeframe": "Y1", "count": 1})).unwrap_err();
        bridge.eval(&json!({"method": "unknown"})).unwrap_err();
        bridge.eval(&json!({"method": "version"})).unwrap();
    }

    assert_eq!(bridge.runtime().stats().live_objects, 0);
}

#[test]
fn concurrent_callers_are_serialized() {
    let bridge = started(OfflineRuntime::connected().with_call_delay(Duration::from_millis(5)));

    std::thread::scope(|s| {
        let workers: Vec<_> = ["EURUSD", "GBPUSD", "USDJPY", "XAUUSD"]
            .into_iter()
            .map(|symbol| {
                let bridge = &bridge;
                s.spawn(move || {
                    for _ in 0..5 {
                        let info = bridge
                            .eval(&json!({"method": "symbol_info", "symbol": symbol}))
                            .unwrap();
                        assert_eq!(info["name"], symbol);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
    });

    let stats = bridge.runtime().stats();
    assert_eq!(stats.peak_sessions, 1);
    assert_eq!(stats.external_calls, 20);
}

#[test]
fn shutdown_waits_for_in_flight_eval() {
    let bridge = started(OfflineRuntime::connected().with_call_delay(Duration::from_millis(50)));

    std::thread::scope(|s| {
        let eval = s.spawn(|| bridge.eval(&json!({"method": "terminal_info"})));
        std::thread::sleep(Duration::from_millis(10));
        bridge.shutdown();
        // The eval either finished before teardown or never started.
        match eval.join().unwrap() {
            Ok(info) => assert_eq!(info["connected"], true),
            Err(err) => assert!(matches!(err, BridgeError::NotInitialized)),
        }
    });

    assert!(!bridge.runtime().is_up());
}

#[test]
fn failed_bring_up_can_be_retried() {
    let bridge = Bridge::new(OfflineRuntime::new().with_bring_up_failure("no encodings module"));
    for _ in 0..3 {
        let err = bridge.initialize(&BridgeConfig::default()).unwrap_err();
        assert_eq!(err.kind().code(), -1);
    }
    assert!(!bridge.is_initialized());
    assert_eq!(bridge.runtime().stats().bring_ups, 0);
}

#[test]
fn failed_handshake_leaves_nothing_running() {
    let bridge = Bridge::new(OfflineRuntime::new().with_fault("initialize", "terminal not found"));

    let err = bridge.initialize(&BridgeConfig::default()).unwrap_err();
    assert_eq!(err.kind().code(), -2);
    assert_eq!(bridge.last_error().as_deref(), Some("terminal not found"));

    let stats = bridge.runtime().stats();
    assert_eq!(stats.bring_ups, 1);
    assert_eq!(stats.tear_downs, 1);
    assert_eq!(stats.live_objects, 0);
    assert!(!bridge.runtime().is_up());

    // The gate was handed back; a later session does not deadlock.
    let err = bridge.eval(&json!({"method": "version"})).unwrap_err();
    assert!(matches!(err, BridgeError::NotInitialized));
}

#[test]
fn bridge_can_be_restarted_after_shutdown() {
    let bridge = started(OfflineRuntime::connected());
    bridge.shutdown();
    bridge.initialize(&BridgeConfig::default()).unwrap();

    let version = bridge.eval(&json!({"method": "version"})).unwrap();
    assert_eq!(version[0], 500);

    let stats = bridge.runtime().stats();
    assert_eq!(stats.bring_ups, 2);
    assert_eq!(stats.tear_downs, 1);
}
