//! End-to-end engine behavior: evaluation, slots, and error reporting.

use scriptbox::{Engine, EngineConfig, Error, EvalMode, Value};

fn engine() -> Engine {
    Engine::new(EngineConfig::default()).expect("default engine")
}

#[test]
fn eval_returns_the_last_top_level_expression() {
    let mut engine = engine();
    assert_eq!(engine.eval("e.rb", "42").unwrap(), Value::Integer(42));
    assert_eq!(engine.eval("e.rb", "nil").unwrap(), Value::Nil);
    assert_eq!(engine.eval("e.rb", "1 < 2").unwrap(), Value::Bool(true));
    assert_eq!(
        engine.eval("e.rb", "\"a\" + \"b\"").unwrap(),
        Value::String("ab".to_string())
    );
    assert_eq!(
        engine.eval("e.rb", ":checkout").unwrap(),
        Value::symbol("checkout")
    );
}

#[test]
fn structured_results_cross_the_bridge() {
    let mut engine = engine();
    let value = engine
        .eval(
            "cart.rb",
            "{:items => [1, 2, 3], \"total\" => 6, :empty => nil}",
        )
        .unwrap();
    assert_eq!(
        value,
        Value::Map(vec![
            (
                Value::symbol("items"),
                Value::Array(vec![
                    Value::Integer(1),
                    Value::Integer(2),
                    Value::Integer(3)
                ])
            ),
            (Value::String("total".to_string()), Value::Integer(6)),
            (Value::symbol("empty"), Value::Nil),
        ])
    );
}

#[test]
fn slots_survive_between_evaluations() {
    let mut engine = engine();
    engine.inject("@rate", &Value::Integer(7)).unwrap();
    engine.eval("step1.rb", "@base = 6").unwrap();
    engine.eval("step2.rb", "@total = @base * @rate").unwrap();
    assert_eq!(engine.extract("@total").unwrap(), Value::Integer(42));
}

#[test]
fn deep_values_cross_up_to_the_limit() {
    fn nested(depth: usize) -> Value {
        let mut value = Value::Integer(1);
        for _ in 0..depth {
            value = Value::Array(vec![value]);
        }
        value
    }
    let mut engine = engine();
    engine.inject("@deep", &nested(31)).unwrap();
    assert_eq!(engine.extract("@deep").unwrap(), nested(31));
    assert_eq!(
        engine.inject("@too_deep", &nested(33)).unwrap_err(),
        Error::TooDeep
    );
}

#[test]
fn guest_exceptions_carry_class_message_and_backtrace() {
    let mut engine = engine();
    let src = "def charge(amount)\n  if amount < 0\n    raise \"negative amount\"\n  end\n  amount\nend\ncharge(-1)";
    let err = engine.eval("charge.rb", src).unwrap_err();
    match err {
        Error::Runtime {
            guest_type,
            message,
            backtrace,
        } => {
            assert_eq!(guest_type, "RuntimeError");
            assert_eq!(message, "negative amount");
            assert_eq!(
                backtrace,
                vec![
                    "charge.rb:3:in `charge'".to_string(),
                    "charge.rb:7".to_string()
                ]
            );
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn syntax_errors_report_path_and_position() {
    let mut engine = engine();
    match engine.eval("broken.rb", "x = (1 +").unwrap_err() {
        Error::Syntax { path, line, .. } => {
            assert_eq!(path, "broken.rb");
            assert_eq!(line, 1);
        }
        other => panic!("unexpected {other:?}"),
    }
    // The engine is still usable afterwards.
    assert_eq!(engine.eval("fine.rb", "1").unwrap(), Value::Integer(1));
}

#[test]
fn type_errors_surface_as_guest_exceptions() {
    let mut engine = engine();
    let err = engine.eval("types.rb", "1 + \"one\"").unwrap_err();
    assert!(matches!(err, Error::Runtime { ref guest_type, .. } if guest_type == "TypeError"));

    let err = engine.eval("zero.rb", "10 / 0").unwrap_err();
    assert!(
        matches!(err, Error::Runtime { ref guest_type, ref message, .. }
        if guest_type == "ZeroDivisionError" && message == "divided by 0")
    );
}

#[test]
fn unmonitored_engine_evaluates_on_the_caller_thread() {
    let mut engine = Engine::new(EngineConfig {
        mode: EvalMode::Unmonitored,
        ..EngineConfig::default()
    })
    .unwrap();
    assert_eq!(
        engine.eval("calc.rb", "6 * 7").unwrap(),
        Value::Integer(42)
    );
}

#[test]
fn capacity_bounds_are_enforced_at_construction() {
    let too_small = EngineConfig {
        memory_capacity: 1,
        ..EngineConfig::default()
    };
    assert!(matches!(
        Engine::new(too_small),
        Err(Error::InvalidCapacity { .. })
    ));

    let too_large = EngineConfig {
        memory_capacity: 1 << 40,
        ..EngineConfig::default()
    };
    assert!(matches!(
        Engine::new(too_large),
        Err(Error::InvalidCapacity { .. })
    ));
}

#[test]
fn stat_serializes_for_reporting() {
    let mut engine = engine();
    engine.eval("one.rb", "1").unwrap();
    let json = serde_json::to_value(engine.stat()).unwrap();
    assert!(json["instructions"].as_u64().unwrap() > 0);
    assert!(json["memory_capacity"].as_u64().unwrap() > 0);
    assert!(json["memory_peak"].as_u64().is_some());
}
