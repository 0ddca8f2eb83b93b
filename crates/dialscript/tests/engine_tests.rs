//! End-to-end behavior: source text in, observable state out.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use pretty_assertions::assert_eq;

use dialscript::{Engine, ExecStatus, Host, NullHost, RecordingHost, Value};

fn run(source: &str) -> Engine {
    let mut engine = Engine::from_source(source, Box::new(NullHost)).unwrap();
    let status = engine.run_to_completion(100_000);
    assert_eq!(
        status,
        ExecStatus::Finished,
        "fault: {:?}",
        engine.fault_report()
    );
    engine
}

/// Host with externally visible console and a settable clock.
#[derive(Clone, Default)]
struct TestHost {
    console: Rc<RefCell<Vec<String>>>,
    clock_ms: Rc<Cell<u32>>,
}

impl Host for TestHost {
    fn console_print(&mut self, text: &str) {
        self.console.borrow_mut().push(text.to_string());
    }

    fn console_println(&mut self, text: &str) {
        self.console.borrow_mut().push(format!("{text}\n"));
    }

    fn system_get_time(&mut self) -> u32 {
        self.clock_ms.get()
    }

    fn display_get_width(&mut self) -> i32 {
        240
    }

    fn display_get_height(&mut self) -> i32 {
        240
    }
}

// ---------------------------------------------------------------------------
// Language basics
// ---------------------------------------------------------------------------

#[test]
fn arithmetic_precedence() {
    let engine = run("var x: 1 + 2 * 3;");
    assert_eq!(engine.get_global("x"), Some(Value::Int(7)));
}

#[test]
fn function_call_returns_value() {
    let engine = run("function add(a: int, b: int): int { return a + b; } var r: add(40, 2);");
    assert_eq!(engine.get_global("r"), Some(Value::Int(42)));
}

#[test]
fn class_constructor_and_methods() {
    let engine = run(
        "class Counter { value: int; \
         constructor(v: int) { assign this.value v; } \
         inc(): void { assign this.value this.value + 1; } } \
         var c: Counter(10); c.inc(); c.inc();",
    );
    let Some(Value::Object(counter)) = engine.get_global("c") else {
        panic!("expected object");
    };
    assert_eq!(counter.borrow().fields.get("value"), Some(&Value::Int(12)));
}

#[test]
fn template_literal_interpolation() {
    let engine = run("var s: `hi ${1 + 2}`;");
    assert_eq!(engine.get_global("s"), Some(Value::string("hi 3")));
}

#[test]
fn template_without_interpolation_is_plain_string() {
    let engine = run("var s: `plain text`;");
    assert_eq!(engine.get_global("s"), Some(Value::string("plain text")));
}

#[test]
fn template_starting_with_interpolation() {
    let engine = run("var s: `${40 + 2} is the answer`;");
    assert_eq!(engine.get_global("s"), Some(Value::string("42 is the answer")));
}

#[test]
fn equals_sign_is_equality() {
    let engine = run("var x: 5; var same: x = 5; var diff: x = 6;");
    assert_eq!(engine.get_global("same"), Some(Value::Bool(true)));
    assert_eq!(engine.get_global("diff"), Some(Value::Bool(false)));
}

#[test]
fn and_or_evaluate_both_operands() {
    // AND/OR are plain boolean opcodes: both sides run, side effects and
    // all. Guarded evaluation needs `if` or the ternary.
    let engine = run(
        "var calls: 0; \
         function yes(): bool { assign calls calls + 1; return true; } \
         var r: yes() or yes();",
    );
    assert_eq!(engine.get_global("r"), Some(Value::Bool(true)));
    assert_eq!(engine.get_global("calls"), Some(Value::Int(2)));
}

#[test]
fn ternary_and_comparisons() {
    let engine = run("var age: 20; var label: age >= 18 ? \"adult\" : \"minor\";");
    assert_eq!(engine.get_global("label"), Some(Value::string("adult")));
}

#[test]
fn while_and_for_loops() {
    let engine = run(
        "var squares: 0; for (var i: 1; i <= 4; assign i i + 1) { \
         assign squares squares + i * i; } \
         var countdown: 3; while (countdown > 0) { assign countdown countdown - 1; }",
    );
    assert_eq!(engine.get_global("squares"), Some(Value::Int(30)));
    assert_eq!(engine.get_global("countdown"), Some(Value::Int(0)));
}

#[test]
fn arrays_and_string_indexing() {
    let engine = run(
        "var a: [10, 20, 30]; assign a[2] 99; var last: a[2]; \
         var word: \"dial\"; var letter: word[1];",
    );
    assert_eq!(engine.get_global("last"), Some(Value::Int(99)));
    assert_eq!(engine.get_global("letter"), Some(Value::string("i")));
}

#[test]
fn string_concatenation_converts_display_forms() {
    let engine = run("var s: \"v=\" + 1.5 + \" ok=\" + true + \" n=\" + null;");
    assert_eq!(
        engine.get_global("s"),
        Some(Value::string("v=1.5 ok=true n=null"))
    );
}

#[test]
fn nested_calls_balance_the_stack() {
    let engine = run(
        "function twice(n: int): int { return n * 2; } \
         var r: 1 + twice(twice(10)) + 4;",
    );
    assert_eq!(engine.get_global("r"), Some(Value::Int(45)));
}

#[test]
fn object_graph_with_cycle_runs() {
    // An object holding an array that holds the object back: the engine
    // only guarantees accounting, not collection.
    let engine = run(
        "class Node { items: any; } \
         var n: Node(); assign n.items [1]; assign n.items[0] n; var ok: true;",
    );
    assert_eq!(engine.get_global("ok"), Some(Value::Bool(true)));
}

#[test]
fn missing_field_reads_null() {
    let engine = run("class Box { } var b: Box(); var empty: b.nothing;");
    assert_eq!(engine.get_global("empty"), Some(Value::Null));
}

// ---------------------------------------------------------------------------
// Errors and faults
// ---------------------------------------------------------------------------

#[test]
fn syntax_errors_report_line_and_column() {
    let err = Engine::from_source("var x 1;", Box::new(NullHost)).unwrap_err();
    let dialscript::Error::Syntax(message) = err else {
        panic!("expected syntax error");
    };
    assert!(message.contains("Line 1:7 -"), "{message}");
}

#[test]
fn compile_errors_are_collected() {
    let err = Engine::from_source("var x: missing(); var y: also_missing();", Box::new(NullHost))
        .unwrap_err();
    let dialscript::Error::Compile(message) = err else {
        panic!("expected compile error");
    };
    // Both unknown calls are reported in one pass.
    assert!(message.contains("missing"));
    assert!(message.contains("also_missing"));
}

#[test]
fn try_catch_recovers_and_finally_runs() {
    let engine = run(
        "var log: \"\"; \
         try { assign log log + \"t\"; var x: 1 / 0; assign log log + \"?\"; } \
         catch (e) { assign log log + \"c\"; } \
         finally { assign log log + \"f\"; }",
    );
    assert_eq!(engine.get_global("log"), Some(Value::string("tcf")));
}

#[test]
fn fault_report_shows_source_window() {
    let mut engine = Engine::from_source(
        "var a: 1;\nvar b: 2;\nvar c: a / 0;\nvar d: 4;",
        Box::new(NullHost),
    )
    .unwrap();
    assert_eq!(engine.run_to_completion(10_000), ExecStatus::Error);
    let report = engine.fault_report().unwrap();
    assert!(report.contains("ArithmeticError"), "{report}");
    assert!(report.contains("3 | var c: a / 0;"), "{report}");
    assert!(report.contains("4 | var d: 4;"), "{report}");
}

#[test]
fn heap_exhaustion_is_out_of_memory() {
    let module = dialscript::compile_source(
        "var s: \"seed\"; while (true) { assign s s + s; }",
        dialscript::CompileOptions {
            metadata: dialscript::Metadata {
                heap_size: 2048,
                ..Default::default()
            },
            ..Default::default()
        },
    )
    .unwrap();
    let mut engine = Engine::from_module(module, Box::new(NullHost));
    assert_eq!(engine.run_to_completion(1_000_000), ExecStatus::OutOfMemory);
}

// ---------------------------------------------------------------------------
// Host interface, events, timers
// ---------------------------------------------------------------------------

#[test]
fn console_output_reaches_host() {
    let host = TestHost::default();
    let console = host.console.clone();
    let mut engine = Engine::from_source(
        "os.console.print(\"radius \" + 5);",
        Box::new(host),
    )
    .unwrap();
    assert_eq!(engine.run_to_completion(10_000), ExecStatus::Finished);
    assert_eq!(*console.borrow(), vec!["radius 5".to_string()]);
}

#[test]
fn display_queries_come_from_host() {
    let engine_src = "var w: os.display.getWidth(); var h: os.display.getHeight();";
    let mut engine = Engine::from_source(engine_src, Box::new(TestHost::default())).unwrap();
    assert_eq!(engine.run_to_completion(10_000), ExecStatus::Finished);
    assert_eq!(engine.get_global("w"), Some(Value::Int(240)));
    assert_eq!(engine.get_global("h"), Some(Value::Int(240)));
}

#[test]
fn storage_round_trips_through_host() {
    let mut engine = Engine::from_source(
        "os.storage.set(\"brightness\", \"128\"); \
         var v: os.storage.get(\"brightness\"); \
         var missing: os.storage.get(\"absent\");",
        Box::new(RecordingHost::new()),
    )
    .unwrap();
    assert_eq!(engine.run_to_completion(10_000), ExecStatus::Finished);
    assert_eq!(engine.get_global("v"), Some(Value::string("128")));
    assert_eq!(engine.get_global("missing"), Some(Value::Null));
}

#[test]
fn encoder_events_are_delivered_in_order() {
    let mut engine = Engine::from_source(
        "var history: \"\"; \
         function onTurn(delta: int): void { assign history history + delta + \";\"; } \
         os.encoder.onTurn(onTurn);",
        Box::new(NullHost),
    )
    .unwrap();
    assert_eq!(engine.run_to_completion(10_000), ExecStatus::Finished);

    engine.encoder_turn(1);
    engine.encoder_turn(-2);
    engine.encoder_turn(3);
    engine.run_frame(1000);
    assert_eq!(engine.get_global("history"), Some(Value::string("1;-2;3;")));
}

#[test]
fn touch_callbacks_receive_coordinates() {
    let mut engine = Engine::from_source(
        "var at: \"\"; \
         function onPress(x: int, y: int): void { assign at x + \",\" + y; } \
         os.touch.onPress(onPress);",
        Box::new(NullHost),
    )
    .unwrap();
    assert_eq!(engine.run_to_completion(10_000), ExecStatus::Finished);
    engine.touch_press(120, 80);
    engine.run_frame(1000);
    assert_eq!(engine.get_global("at"), Some(Value::string("120,80")));
}

#[test]
fn app_load_callback_fires_on_notify() {
    let mut engine = Engine::from_source(
        "var loaded: false; \
         function onLoad(): void { assign loaded true; } \
         os.app.onLoad(onLoad);",
        Box::new(NullHost),
    )
    .unwrap();
    assert_eq!(engine.run_to_completion(10_000), ExecStatus::Finished);
    engine.notify_load();
    assert_eq!(engine.get_global("loaded"), Some(Value::Bool(true)));
}

#[test]
fn interval_timer_fires_per_frame_clock() {
    let host = TestHost::default();
    let clock = host.clock_ms.clone();
    let mut engine = Engine::from_source(
        "var ticks: 0; \
         function tick(): void { assign ticks ticks + 1; } \
         os.timer.setInterval(tick, 100);",
        Box::new(host),
    )
    .unwrap();
    assert_eq!(engine.run_to_completion(10_000), ExecStatus::Finished);

    clock.set(99);
    engine.run_frame(100);
    assert_eq!(engine.get_global("ticks"), Some(Value::Int(0)));

    clock.set(100);
    engine.run_frame(100);
    assert_eq!(engine.get_global("ticks"), Some(Value::Int(1)));

    clock.set(250);
    engine.run_frame(100);
    assert_eq!(engine.get_global("ticks"), Some(Value::Int(2)));
}

#[test]
fn sleep_yields_and_resumes_on_clock() {
    let host = TestHost::default();
    let clock = host.clock_ms.clone();
    let mut engine = Engine::from_source(
        "var phase: 1; os.system.sleep(500); assign phase 2;",
        Box::new(host),
    )
    .unwrap();
    assert_eq!(engine.run_to_completion(10_000), ExecStatus::Yield);
    assert_eq!(engine.get_global("phase"), Some(Value::Int(1)));

    clock.set(499);
    assert_eq!(engine.run_frame(10_000), ExecStatus::Yield);

    clock.set(500);
    assert_eq!(engine.run_frame(10_000), ExecStatus::Finished);
    assert_eq!(engine.get_global("phase"), Some(Value::Int(2)));
}

#[test]
fn fault_in_callback_suppresses_following_events() {
    let mut engine = Engine::from_source(
        "var count: 0; \
         function bad(delta: int): void { assign count count + 1; var x: 1 / 0; } \
         os.encoder.onTurn(bad);",
        Box::new(NullHost),
    )
    .unwrap();
    assert_eq!(engine.run_to_completion(10_000), ExecStatus::Finished);
    engine.encoder_turn(1);
    engine.encoder_turn(1);
    engine.encoder_turn(1);
    assert_eq!(engine.run_frame(1000), ExecStatus::Error);
    // Only the first event ran.
    assert_eq!(engine.get_global("count"), Some(Value::Int(1)));
    assert!(engine.error().is_some());
}

#[test]
fn request_stop_wins_over_infinite_loop() {
    let mut engine = Engine::from_source(
        "var n: 0; while (true) { assign n n + 1; }",
        Box::new(NullHost),
    )
    .unwrap();
    assert_eq!(engine.run_frame(1000), ExecStatus::Ok);
    engine.request_stop();
    assert_eq!(engine.run_frame(1000), ExecStatus::Finished);
    assert!(engine.error().is_none());
}

#[test]
fn host_can_exchange_globals_between_frames() {
    let mut engine = Engine::from_source("var speed: 0; var doubled: 0;", Box::new(NullHost)).unwrap();
    assert_eq!(engine.run_to_completion(10_000), ExecStatus::Finished);
    assert!(engine.set_global("speed", Value::Int(21)));
    assert_eq!(engine.get_global("speed"), Some(Value::Int(21)));
    assert!(!engine.set_global("unknown", Value::Null));
}

// ---------------------------------------------------------------------------
// Disassembly (scenario: if/else jump shape)
// ---------------------------------------------------------------------------

#[test]
fn if_else_disassembles_to_one_conditional_and_one_jump() {
    let engine = Engine::from_source(
        "var x: 0; if (x = 0) { var a: 1; } else { var b: 2; }",
        Box::new(NullHost),
    )
    .unwrap();
    let listing = engine.disassemble();
    assert_eq!(listing.matches("JUMP_IF_NOT").count(), 1);
    assert_eq!(listing.matches("  JUMP ").count(), 1);
}
