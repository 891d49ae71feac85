//! Precompiled instruction sequences: determinism, identity, and loading.

use scriptbox::{Engine, EngineConfig, Error, InstructionSequence, Source, Value};

fn engine() -> Engine {
    Engine::new(EngineConfig::default()).expect("engine")
}

#[test]
fn load_matches_eval() {
    let src = "def total(a, b)\n  a + b\nend\n@out = total(40, 2)";

    let mut direct = engine();
    direct.eval("total.rb", src).unwrap();

    let iseq = InstructionSequence::compile(&[Source::new("total.rb", src)]).unwrap();
    let mut loaded = engine();
    loaded.load(&iseq).unwrap();

    assert_eq!(direct.extract("@out").unwrap(), Value::Integer(42));
    assert_eq!(loaded.extract("@out").unwrap(), Value::Integer(42));
}

#[test]
fn one_sequence_loads_into_many_engines() {
    let iseq = InstructionSequence::compile(&[Source::new("id.rb", "@n = @n + 1")]).unwrap();
    for seed in 0..3 {
        let mut engine = engine();
        engine.inject("@n", &Value::Integer(seed)).unwrap();
        engine.load(&iseq).unwrap();
        assert_eq!(engine.extract("@n").unwrap(), Value::Integer(seed + 1));
    }
}

#[test]
fn sources_concatenate_in_order() {
    let iseq = InstructionSequence::compile(&[
        Source::new("lib.rb", "def double(n)\n  n * 2\nend"),
        Source::new("main.rb", "@out = double(21)"),
    ])
    .unwrap();
    let mut engine = engine();
    engine.load(&iseq).unwrap();
    assert_eq!(engine.extract("@out").unwrap(), Value::Integer(42));
}

#[test]
fn content_hash_is_stable_across_compilations() {
    let sources = [Source::new("a.rb", "@x = [1, 2, 3]")];
    let a = InstructionSequence::compile(&sources).unwrap();
    let b = InstructionSequence::compile(&sources).unwrap();
    assert_eq!(a.content_hash(), b.content_hash());
    assert_eq!(a.as_bytes(), b.as_bytes());
    assert_eq!(a.size(), b.size());
    assert_ne!(
        a.content_hash(),
        InstructionSequence::compile(&[Source::new("a.rb", "@x = [1, 2, 4]")])
            .unwrap()
            .content_hash()
    );
}

#[test]
fn serialized_form_round_trips() {
    let iseq =
        InstructionSequence::compile(&[Source::new("r.rb", "@out = \"a\" * 3")]).unwrap();
    let reloaded = InstructionSequence::from_bytes(iseq.as_bytes().to_vec()).unwrap();
    assert_eq!(reloaded.content_hash(), iseq.content_hash());

    let mut engine = engine();
    engine.load(&reloaded).unwrap();
    assert_eq!(
        engine.extract("@out").unwrap(),
        Value::String("aaa".to_string())
    );
}

#[test]
fn corrupt_bytes_are_rejected() {
    let iseq = InstructionSequence::compile(&[Source::new("c.rb", "1")]).unwrap();
    let mut bytes = iseq.as_bytes().to_vec();
    bytes.truncate(bytes.len() / 2);
    assert!(matches!(
        InstructionSequence::from_bytes(bytes),
        Err(Error::Config(_))
    ));
    assert!(matches!(
        InstructionSequence::from_bytes(b"junk".to_vec()),
        Err(Error::Config(_))
    ));
}

#[test]
fn compile_errors_name_the_failing_source() {
    let err = InstructionSequence::compile(&[
        Source::new("good.rb", "1"),
        Source::new("bad.rb", "while"),
    ])
    .unwrap_err();
    match err {
        Error::Syntax { path, .. } => assert_eq!(path, "bad.rb"),
        other => panic!("unexpected {other:?}"),
    }
}
