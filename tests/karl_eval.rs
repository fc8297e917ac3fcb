use std::sync::Arc;

use karl::{
    CompileErrorKind, ContextGuard, EvalSettings, KarlError, KnowledgeBase, KnowledgeRecord, KnowledgeUpdateSettings,
    ScriptCallback, Value,
};

fn eval(kb: &KnowledgeBase, source: &str) -> KnowledgeRecord {
    kb.evaluate_str(source, &EvalSettings::default()).unwrap()
}

#[test]
fn arithmetic_assignment_scenario() {
    let kb = KnowledgeBase::default();
    eval(&kb, "x = 3 + 4; y = x * 2");
    assert_eq!(kb.get("x").to_integer(), 7);
    assert_eq!(kb.get("y").to_integer(), 14);
    // Two global writes, one clock tick each.
    assert_eq!(kb.context().clock(), 2);
}

#[test]
fn compiled_expression_reevaluates_against_current_state() {
    let kb = KnowledgeBase::default();
    let tick = kb.compile("count += 1; total = total + count").unwrap();
    for _ in 0..4 {
        kb.evaluate(&tick, &EvalSettings::default()).unwrap();
    }
    assert_eq!(kb.get("count").to_integer(), 4);
    assert_eq!(kb.get("total").to_integer(), 10);
}

#[test]
fn mixed_types_coerce() {
    let kb = KnowledgeBase::default();
    assert_eq!(eval(&kb, "1 + 2.5").to_double(), 3.5);
    assert_eq!(eval(&kb, "'n=' + 4").to_string(), "n=4");
    assert_eq!(eval(&kb, "'6' * 2").to_integer(), 12);
    assert_eq!(eval(&kb, "7 / 0").to_integer(), 0);
    assert_eq!(eval(&kb, "[1, 2] + 1").value, Value::IntegerArray(vec![2, 3]));
    assert!(eval(&kb, "missing == 0").is_true());
}

#[test]
fn locals_stay_out_of_the_clock() {
    let kb = KnowledgeBase::default();
    eval(&kb, ".tmp = 5; .tmp2 = .tmp * 2");
    assert_eq!(kb.get(".tmp2").to_integer(), 10);
    assert_eq!(kb.context().clock(), 0);
    assert!(kb.context().lock().modifieds().is_empty());
}

#[test]
fn loop_builds_array() {
    let kb = KnowledgeBase::default();
    let iterations = eval(&kb, "i[0 -> 4)(squares[i] = i * i)");
    assert_eq!(iterations.to_integer(), 4);
    assert_eq!(kb.get("squares").value, Value::IntegerArray(vec![0, 1, 4, 9]));
}

#[test]
fn rules_fire_through_implication() {
    let kb = KnowledgeBase::default();
    let rules = kb
        .compile("temperature > 30 => (alarm = 1; fan.speed = 3) ;> !(temperature > 30) => alarm = 0")
        .unwrap();
    let _ = kb.set("temperature", 35i64);
    kb.evaluate(&rules, &EvalSettings::default()).unwrap();
    assert_eq!(kb.get("alarm").to_integer(), 1);
    assert_eq!(kb.get("fan.speed").to_integer(), 3);

    let _ = kb.set("temperature", 20i64);
    kb.evaluate(&rules, &EvalSettings::default()).unwrap();
    assert_eq!(kb.get("alarm").to_integer(), 0);
}

#[test]
fn native_functions_see_the_locked_context() {
    let kb = KnowledgeBase::default();
    kb.define_function("bump", |args, guard| {
        let by = args.first().map_or(1, KnowledgeRecord::to_integer);
        let next = guard.get("counter").to_integer() + by;
        let _ = guard.set("counter", next, &KnowledgeUpdateSettings::default());
        KnowledgeRecord::from(next)
    });
    assert_eq!(eval(&kb, "bump(); bump(5)").to_integer(), 6);
    assert_eq!(kb.get("counter").to_integer(), 6);
}

struct Upper;

impl ScriptCallback for Upper {
    fn runtime(&self) -> &str {
        "test"
    }

    fn call(&self, args: &[KnowledgeRecord], _context: &mut ContextGuard<'_>) -> Result<KnowledgeRecord, String> {
        Ok(KnowledgeRecord::from(args.iter().map(|a| a.to_string().to_uppercase()).collect::<String>()))
    }
}

#[test]
fn script_callbacks_are_invoked() {
    let kb = KnowledgeBase::default();
    kb.context().define_script_function("upper", Arc::new(Upper));
    assert_eq!(eval(&kb, "upper('ab', 'c')").to_string(), "ABC");
}

#[test]
fn compile_errors_are_structured() {
    let kb = KnowledgeBase::default();
    let err = kb.compile("x = 1;\ny = ").unwrap_err();
    assert!(err.is_compile());
    let KarlError::Compile(diag) = err else {
        panic!("expected compile error");
    };
    assert_eq!(diag.line, 2);
    assert_eq!(diag.kind, CompileErrorKind::MissingOperand { operator: "=" });

    assert!(matches!(
        kb.compile("#no_such_call()"),
        Err(KarlError::Compile(ref e)) if matches!(e.kind, CompileErrorKind::UnknownSystemCall { .. })
    ));
    assert!(matches!(
        kb.compile("#pow(2)"),
        Err(KarlError::Compile(ref e)) if matches!(e.kind, CompileErrorKind::SystemCallArity { .. })
    ));
}

#[test]
fn evaluate_call_surfaces_runtime_compile_error() {
    let kb = KnowledgeBase::default();
    let err = kb.evaluate_str("#evaluate('x = ')", &EvalSettings::default()).unwrap_err();
    assert!(err.is_compile());
    assert!(err.is_eval());
}

#[test]
fn pruned_and_unpruned_agree() {
    let kb = KnowledgeBase::default();
    let source = "a = 2 * 3 + 1; b = (1 ? a : 0) + #pow(2, 2); c = 0 && (d = 1)";
    let pruned = kb.compile(source).unwrap();
    let raw = karl::compile_unpruned(&kb.context(), source).unwrap();
    let first = kb.evaluate(&pruned, &EvalSettings::default()).unwrap();
    let snapshot = kb.context().to_map();
    let second = kb.evaluate(&raw, &EvalSettings::default()).unwrap();
    assert_eq!(first.value, second.value);
    for (key, record) in snapshot {
        assert_eq!(kb.get(&key).value, record.value, "{key}");
    }
    assert!(!kb.context().exists("d"));
}

#[test]
fn print_knowledge_and_json_dump() {
    let kb = KnowledgeBase::default();
    eval(&kb, "name = 'agent'; pos = [1.5, 2.0]");
    kb.print_knowledge();
    let json = kb.context().to_json().unwrap();
    assert_eq!(json["name"]["value"], "agent");
    assert_eq!(json["pos"]["type"], "double_array");
}

#[test]
fn hostile_programs_fail_cleanly() {
    let kb = KnowledgeBase::default();
    let err = kb.compile(&vec!["x"; 50_000].join(" + ")).unwrap_err();
    assert!(matches!(err, KarlError::Compile(ref e) if matches!(e.kind, CompileErrorKind::NestingTooDeep { .. })));
    let err = kb.compile(&"(".repeat(50_000)).unwrap_err();
    assert!(matches!(err, KarlError::Compile(ref e) if matches!(e.kind, CompileErrorKind::NestingTooDeep { .. })));

    eval(&kb, "big = 2e18; arr[big] = 1; #sleep(1e300)");
    assert!(!kb.context().exists("arr"));
}
