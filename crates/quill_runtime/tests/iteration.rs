//! Iterator-close discipline in for-of: abrupt exits close exactly once,
//! continue to the same loop never closes, and a completed iterator is
//! never stepped again.

mod common;

use common::*;
use quill_ir::ast::*;
use quill_runtime::{Runtime, Value};

// Instrumented iterator backed by natives: `next` counts up on `this.i`
// until `this.limit`, `return` records a marker in the sink.
fn iterator_next(rt: &mut Runtime, this: Value, _args: &[Value]) -> Result<Value, Value> {
    let index = rt.get_property(this, "i")?.as_number();
    let limit = rt.get_property(this, "limit")?.as_number();
    rt.put_property(this, "i", Value::number(index + 1.0))?;
    let result = rt.new_object();
    if index >= limit {
        rt.put_property(result, "done", Value::TRUE)?;
        rt.put_property(result, "value", Value::UNDEFINED)?;
    } else {
        rt.put_property(result, "done", Value::FALSE)?;
        rt.put_property(result, "value", Value::number(index + 1.0))?;
    }
    Ok(result)
}

fn iterator_return(rt: &mut Runtime, _this: Value, _args: &[Value]) -> Result<Value, Value> {
    let marker = rt.alloc_string("closed");
    rt.sink.push(marker);
    let result = rt.new_object();
    rt.put_property(result, "done", Value::TRUE)?;
    Ok(result)
}

fn runtime_with_iterator(limit: f64) -> Runtime {
    let mut rt = runtime_with_sink();
    let object = rt.new_object();
    let next = rt.new_native_function("next", iterator_next);
    let ret = rt.new_native_function("return", iterator_return);
    rt.put_property(object, "i", Value::number(0.0)).unwrap();
    rt.put_property(object, "limit", Value::number(limit)).unwrap();
    rt.put_property(object, "next", next).unwrap();
    rt.put_property(object, "return", ret).unwrap();
    rt.define_global("it", object);
    rt
}

fn for_of_over_it(body: Vec<Stmt>) -> Program {
    program(
        vec![lexical("x")],
        vec![Stmt::ForOf(Box::new(ForOfStmt {
            target: ForTarget::Decl {
                kind: DeclKind::Let,
                target: BindingTarget::Ident(Box::new(Ident::local("x", 0))),
            },
            iterable: global("it"),
            body: body.into_boxed_slice(),
            is_await: false,
        }))],
    )
}

fn closed_count(rt: &mut Runtime) -> usize {
    sink_strings(rt).iter().filter(|s| s.as_str() == "closed").count()
}

#[test]
fn break_closes_the_iterator_exactly_once() {
    // for (let x of it) { sink(x); if (x === 2) break }
    let body = vec![
        expr_stmt(call(global("sink"), vec![local("x", 0)])),
        Stmt::If(Box::new(IfStmt {
            test: binary(BinaryOp::StrictlyEquals, local("x", 0), num(2.0)),
            consequent: Box::new([Stmt::Break(None)]),
            alternate: None,
        })),
    ];
    let mut rt = runtime_with_iterator(10.0);
    run_ok(&mut rt, &for_of_over_it(body));
    assert_eq!(closed_count(&mut rt), 1);
    let numbers: Vec<String> = sink_strings(&mut rt);
    assert_eq!(numbers, vec!["1", "2", "closed"]);
}

#[test]
fn continue_to_the_same_loop_never_closes() {
    // for (let x of it) { continue }
    let mut rt = runtime_with_iterator(3.0);
    run_ok(&mut rt, &for_of_over_it(vec![Stmt::Continue(None)]));
    assert_eq!(closed_count(&mut rt), 0, "continue keeps driving the iterator");
}

#[test]
fn normal_exhaustion_does_not_close() {
    let mut rt = runtime_with_iterator(2.0);
    run_ok(&mut rt, &for_of_over_it(vec![expr_stmt(call(global("sink"), vec![local("x", 0)]))]));
    assert_eq!(closed_count(&mut rt), 0, "a done iterator needs no close");
}

#[test]
fn a_thrown_body_closes_then_the_exception_wins() {
    // for (let x of it) { throw 42 }
    let mut rt = runtime_with_iterator(5.0);
    let error = run(&mut rt, &for_of_over_it(vec![Stmt::Throw(num(42.0))])).unwrap_err();
    assert_eq!(error, Value::from_i64(42));
    assert_eq!(closed_count(&mut rt), 1);
}

#[test]
fn return_out_of_the_loop_closes_before_returning() {
    // function f() { for (let x of it) { return x } }  sink(f())
    let loop_stmt = Stmt::ForOf(Box::new(ForOfStmt {
        target: ForTarget::Decl {
            kind: DeclKind::Let,
            target: BindingTarget::Ident(Box::new(Ident::local("x", 0))),
        },
        iterable: global("it"),
        body: Box::new([Stmt::Return(Some(local("x", 0)))]),
        is_await: false,
    }));
    let f = function(
        "f",
        quill_ir::FunctionKind::Normal,
        vec![],
        vec![lexical("x")],
        vec![loop_stmt],
    );
    let p = program(
        vec![],
        vec![
            Stmt::FunctionDecl(Box::new(f)),
            expr_stmt(call(global("sink"), vec![call(global("f"), vec![])])),
        ],
    );
    let mut rt = runtime_with_iterator(5.0);
    run_ok(&mut rt, &p);
    let recorded = sink_strings(&mut rt);
    assert_eq!(recorded, vec!["closed", "1"], "close happens before the return value is observed");
}

#[test]
fn labelled_continue_to_an_outer_loop_closes_the_inner_iterator() {
    // outer: for (let y of [1, 2]) { for (let x of it) { continue outer } }
    let inner = Stmt::ForOf(Box::new(ForOfStmt {
        target: ForTarget::Decl {
            kind: DeclKind::Let,
            target: BindingTarget::Ident(Box::new(Ident::local("x", 0))),
        },
        iterable: global("it"),
        body: Box::new([Stmt::Continue(Some("outer".to_string()))]),
        is_await: false,
    }));
    let outer = Stmt::Labelled(Box::new(LabelledStmt {
        label: "outer".to_string(),
        body: Stmt::ForOf(Box::new(ForOfStmt {
            target: ForTarget::Decl {
                kind: DeclKind::Let,
                target: BindingTarget::Ident(Box::new(Ident::local("y", 1))),
            },
            iterable: array(vec![num(1.0), num(2.0)]),
            body: Box::new([inner]),
            is_await: false,
        })),
    }));
    let p = program(vec![lexical("x"), lexical("y")], vec![outer]);
    let mut rt = runtime_with_iterator(10.0);
    run_ok(&mut rt, &p);
    // The inner loop starts twice (once per outer element) and is closed on
    // each labelled continue.
    assert_eq!(closed_count(&mut rt), 2);
}

#[test]
fn destructuring_a_short_iterable_stops_stepping_after_done() {
    // let [a, b, c] = it(limit 1): the underlying next must be called at
    // most twice (one value, one completion).
    let pattern = Pattern::Array(Box::new([
        ArrayPatternElement {
            target: Some(BindingTarget::Ident(Box::new(Ident::local("a", 0)))),
            default: None,
            rest: false,
        },
        ArrayPatternElement {
            target: Some(BindingTarget::Ident(Box::new(Ident::local("b", 1)))),
            default: None,
            rest: false,
        },
        ArrayPatternElement {
            target: Some(BindingTarget::Ident(Box::new(Ident::local("c", 2)))),
            default: None,
            rest: false,
        },
    ]));
    let p = program(
        vec![lexical("a"), lexical("b"), lexical("c")],
        vec![
            let_pattern(pattern, global("it")),
            expr_stmt(call(
                global("sink"),
                vec![local("a", 0), local("b", 1), local("c", 2), member(global("it"), "i")],
            )),
        ],
    );
    let mut rt = runtime_with_iterator(1.0);
    run_ok(&mut rt, &p);
    let values = rt.sink.clone();
    assert_eq!(values[0], Value::from_i64(1));
    assert!(values[1].is_undefined());
    assert!(values[2].is_undefined());
    // Two calls: the first yields 1, the second reports done.
    assert_eq!(values[3], Value::from_i64(2));
}
