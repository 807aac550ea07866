//! End-to-end program execution: compile a resolved tree, run it, observe
//! completion values, thrown values, and the host sink.

mod common;

use common::*;
use quill_ir::ast::*;
use quill_runtime::{Runtime, Value};

#[test]
fn folded_logical_chain_completes_with_the_constant() {
    // 0 || (1 && 2)
    let expr = logical(
        LogicalOp::Or,
        num(0.0),
        logical(LogicalOp::And, num(1.0), num(2.0)),
    );
    let mut rt = Runtime::new();
    let result = run_ok(&mut rt, &program(vec![], vec![expr_stmt(expr)]));
    assert_eq!(result, Value::from_i64(2));
}

#[test]
fn arithmetic_with_locals_and_coercion() {
    // let x = 6 * 7; x + "!"
    let p = program(
        vec![lexical("x")],
        vec![
            let_ident("x", 0, binary(BinaryOp::Mul, num(6.0), num(7.0))),
            expr_stmt(binary(BinaryOp::Add, local("x", 0), text("!"))),
        ],
    );
    let mut rt = Runtime::new();
    let result = run_ok(&mut rt, &p);
    assert_eq!(rt.to_string_value(result).unwrap(), "42!");
}

#[test]
fn array_destructuring_with_elision_default_and_rest() {
    // let [a, , b = 9, ...c] = [1, 2]; sink(a, b, c.length)
    let pattern = Pattern::Array(Box::new([
        ArrayPatternElement {
            target: Some(BindingTarget::Ident(Box::new(Ident::local("a", 0)))),
            default: None,
            rest: false,
        },
        ArrayPatternElement { target: None, default: None, rest: false },
        ArrayPatternElement {
            target: Some(BindingTarget::Ident(Box::new(Ident::local("b", 1)))),
            default: Some(num(9.0)),
            rest: false,
        },
        ArrayPatternElement {
            target: Some(BindingTarget::Ident(Box::new(Ident::local("c", 2)))),
            default: None,
            rest: true,
        },
    ]));
    let p = program(
        vec![lexical("a"), lexical("b"), lexical("c")],
        vec![
            let_pattern(pattern, array(vec![num(1.0), num(2.0)])),
            expr_stmt(call(
                global("sink"),
                vec![local("a", 0), local("b", 1), member(local("c", 2), "length")],
            )),
        ],
    );
    let mut rt = runtime_with_sink();
    run_ok(&mut rt, &p);
    assert_eq!(sink_numbers(&rt), vec![1.0, 9.0, 0.0]);
}

#[test]
fn object_destructuring_binds_properties_and_defaults() {
    // let { x, missing = 5 } = { x: 2 }; sink(x, missing)
    let pattern = Pattern::Object(Box::new([
        ObjectPatternProperty {
            key: "x".to_string(),
            target: BindingTarget::Ident(Box::new(Ident::local("x", 0))),
            default: None,
        },
        ObjectPatternProperty {
            key: "missing".to_string(),
            target: BindingTarget::Ident(Box::new(Ident::local("missing", 1))),
            default: Some(num(5.0)),
        },
    ]));
    let object = Expr::Object(Box::new([ObjectProperty {
        key: "x".to_string(),
        kind: ObjectPropertyKind::Value,
        value: num(2.0),
    }]));
    let p = program(
        vec![lexical("x"), lexical("missing")],
        vec![
            let_pattern(pattern, object),
            expr_stmt(call(global("sink"), vec![local("x", 0), local("missing", 1)])),
        ],
    );
    let mut rt = runtime_with_sink();
    run_ok(&mut rt, &p);
    assert_eq!(sink_numbers(&rt), vec![2.0, 5.0]);
}

#[test]
fn try_catch_finally_runs_finally_once_and_swallows() {
    // try { throw 1 } catch (e) { sink(e) } finally { sink(100) }
    let stmt = Stmt::Try(Box::new(TryStmt {
        block: Box::new([Stmt::Throw(num(1.0))]),
        handler: Some(CatchClause {
            parameter: Some(BindingTarget::Ident(Box::new(Ident::local("e", 0)))),
            body: Box::new([expr_stmt(call(global("sink"), vec![local("e", 0)]))]),
        }),
        finalizer: Some(Box::new([expr_stmt(call(global("sink"), vec![num(100.0)]))])),
    }));
    let p = program(vec![lexical("e")], vec![stmt]);
    let mut rt = runtime_with_sink();
    run_ok(&mut rt, &p);
    assert_eq!(sink_numbers(&rt), vec![1.0, 100.0]);
}

#[test]
fn finally_runs_on_throw_path_and_exception_propagates() {
    // try { throw 7 } finally { sink(1) }
    let stmt = Stmt::Try(Box::new(TryStmt {
        block: Box::new([Stmt::Throw(num(7.0))]),
        handler: None,
        finalizer: Some(Box::new([expr_stmt(call(global("sink"), vec![num(1.0)]))])),
    }));
    let p = program(vec![], vec![stmt]);
    let mut rt = runtime_with_sink();
    let error = run(&mut rt, &p).unwrap_err();
    assert_eq!(error, Value::from_i64(7));
    assert_eq!(sink_numbers(&rt), vec![1.0]);
}

#[test]
fn finally_runs_on_break_and_loop_exits() {
    // while (true) { try { break } finally { sink(1) } } ; sink(2)
    let try_stmt = Stmt::Try(Box::new(TryStmt {
        block: Box::new([Stmt::Break(None)]),
        handler: None,
        finalizer: Some(Box::new([expr_stmt(call(global("sink"), vec![num(1.0)]))])),
    }));
    let p = program(
        vec![],
        vec![
            Stmt::While(Box::new(WhileStmt { test: boolean(true), body: Box::new([try_stmt]) })),
            expr_stmt(call(global("sink"), vec![num(2.0)])),
        ],
    );
    let mut rt = runtime_with_sink();
    run_ok(&mut rt, &p);
    assert_eq!(sink_numbers(&rt), vec![1.0, 2.0]);
}

#[test]
fn finally_overrides_outcome_with_its_own_abrupt_completion() {
    // function f() { try { return 1 } finally { return 2 } } sink(f())
    let body = vec![Stmt::Try(Box::new(TryStmt {
        block: Box::new([Stmt::Return(Some(num(1.0)))]),
        handler: None,
        finalizer: Some(Box::new([Stmt::Return(Some(num(2.0)))])),
    }))];
    let f = function("f", quill_ir::FunctionKind::Normal, vec![], vec![], body);
    let p = program(
        vec![],
        vec![
            Stmt::FunctionDecl(Box::new(f)),
            expr_stmt(call(global("sink"), vec![call(global("f"), vec![])])),
        ],
    );
    let mut rt = runtime_with_sink();
    run_ok(&mut rt, &p);
    assert_eq!(sink_numbers(&rt), vec![2.0]);
}

#[test]
fn nested_finally_blocks_chain_on_return() {
    // function f() { try { try { return 1 } finally { sink(1) } } finally { sink(2) } }
    let inner = Stmt::Try(Box::new(TryStmt {
        block: Box::new([Stmt::Return(Some(num(1.0)))]),
        handler: None,
        finalizer: Some(Box::new([expr_stmt(call(global("sink"), vec![num(1.0)]))])),
    }));
    let outer = Stmt::Try(Box::new(TryStmt {
        block: Box::new([inner]),
        handler: None,
        finalizer: Some(Box::new([expr_stmt(call(global("sink"), vec![num(2.0)]))])),
    }));
    let f = function("f", quill_ir::FunctionKind::Normal, vec![], vec![], vec![outer]);
    let p = program(
        vec![],
        vec![
            Stmt::FunctionDecl(Box::new(f)),
            expr_stmt(call(global("sink"), vec![call(global("f"), vec![])])),
        ],
    );
    let mut rt = runtime_with_sink();
    run_ok(&mut rt, &p);
    assert_eq!(sink_numbers(&rt), vec![1.0, 2.0, 1.0]);
}

#[test]
fn switch_matches_strictly_and_falls_through() {
    // switch (2) { case 1: sink(1) case 2: sink(2) case 3: sink(3); break; default: sink(99) }
    let switch = Stmt::Switch(Box::new(SwitchStmt {
        discriminant: num(2.0),
        cases: Box::new([
            SwitchCase {
                test: Some(num(1.0)),
                body: Box::new([expr_stmt(call(global("sink"), vec![num(1.0)]))]),
            },
            SwitchCase {
                test: Some(num(2.0)),
                body: Box::new([expr_stmt(call(global("sink"), vec![num(2.0)]))]),
            },
            SwitchCase {
                test: Some(num(3.0)),
                body: Box::new([
                    expr_stmt(call(global("sink"), vec![num(3.0)])),
                    Stmt::Break(None),
                ]),
            },
            SwitchCase {
                test: None,
                body: Box::new([expr_stmt(call(global("sink"), vec![num(99.0)]))]),
            },
        ]),
    }));
    let mut rt = runtime_with_sink();
    run_ok(&mut rt, &program(vec![], vec![switch]));
    assert_eq!(sink_numbers(&rt), vec![2.0, 3.0]);
}

#[test]
fn labelled_break_exits_the_outer_loop() {
    // outer: while (true) { while (true) { break outer } } sink(1)
    let inner = Stmt::While(Box::new(WhileStmt {
        test: boolean(true),
        body: Box::new([Stmt::Break(Some("outer".to_string()))]),
    }));
    let outer = Stmt::Labelled(Box::new(LabelledStmt {
        label: "outer".to_string(),
        body: Stmt::While(Box::new(WhileStmt { test: boolean(true), body: Box::new([inner]) })),
    }));
    let p = program(
        vec![],
        vec![outer, expr_stmt(call(global("sink"), vec![num(1.0)]))],
    );
    let mut rt = runtime_with_sink();
    run_ok(&mut rt, &p);
    assert_eq!(sink_numbers(&rt), vec![1.0]);
}

#[test]
fn reading_a_lexical_local_before_initialization_faults() {
    // x; let x = 1;
    let p = program(
        vec![lexical("x")],
        vec![expr_stmt(local("x", 0)), let_ident("x", 0, num(1.0))],
    );
    let mut rt = Runtime::new();
    let error = run(&mut rt, &p).unwrap_err();
    let message = rt.to_string_value(error).unwrap();
    assert!(message.contains("before initialization"), "got: {message}");
}

#[test]
fn call_stack_exhaustion_is_a_catchable_exception() {
    // function f() { return f() } try { f() } catch (e) { sink(e) }
    let f = function(
        "f",
        quill_ir::FunctionKind::Normal,
        vec![],
        vec![],
        vec![Stmt::Return(Some(call(global("f"), vec![])))],
    );
    let try_stmt = Stmt::Try(Box::new(TryStmt {
        block: Box::new([expr_stmt(call(global("f"), vec![]))]),
        handler: Some(CatchClause {
            parameter: Some(BindingTarget::Ident(Box::new(Ident::local("e", 0)))),
            body: Box::new([expr_stmt(call(global("sink"), vec![local("e", 0)]))]),
        }),
        finalizer: None,
    }));
    let p = program(vec![lexical("e")], vec![Stmt::FunctionDecl(Box::new(f)), try_stmt]);
    let mut rt = runtime_with_sink();
    run_ok(&mut rt, &p);
    let messages = sink_strings(&mut rt);
    assert_eq!(messages.len(), 1);
    assert!(messages[0].contains("call stack"), "got: {}", messages[0]);
}

#[test]
fn for_in_visits_own_keys_in_insertion_order() {
    // let o = { a: 1, b: 2 }; o[0] = 9; for (k in o) sink(k)
    let object = Expr::Object(Box::new([
        ObjectProperty { key: "a".into(), kind: ObjectPropertyKind::Value, value: num(1.0) },
        ObjectProperty { key: "b".into(), kind: ObjectPropertyKind::Value, value: num(2.0) },
    ]));
    let p = program(
        vec![lexical("o"), lexical("k")],
        vec![
            let_ident("o", 0, object),
            expr_stmt(assign(index(local("o", 0), num(0.0)), num(9.0))),
            Stmt::ForIn(Box::new(ForInStmt {
                target: ForTarget::Decl {
                    kind: DeclKind::Let,
                    target: BindingTarget::Ident(Box::new(Ident::local("k", 1))),
                },
                object: local("o", 0),
                body: Box::new([expr_stmt(call(global("sink"), vec![local("k", 1)]))]),
            })),
        ],
    );
    let mut rt = runtime_with_sink();
    run_ok(&mut rt, &p);
    assert_eq!(sink_strings(&mut rt), vec!["0", "a", "b"]);
}

#[test]
fn closures_capture_environment_bindings() {
    // function counter() { n = 0; return function () { n = n + 1; return n } }
    // (n is environment-resident: no frame slot)
    let inner = FunctionNode {
        name: None,
        kind: quill_ir::FunctionKind::Normal,
        params: Box::new([]),
        body: Box::new([
            expr_stmt(assign(global("n"), binary(BinaryOp::Add, global("n"), num(1.0)))),
            Stmt::Return(Some(global("n"))),
        ]),
        locals: Box::new([]),
    };
    let counter = function(
        "counter",
        quill_ir::FunctionKind::Normal,
        vec![],
        vec![],
        vec![
            Stmt::Decl(Box::new(VarDecl {
                kind: DeclKind::Let,
                declarators: Box::new([Declarator {
                    target: BindingTarget::Ident(Box::new(Ident::new("n"))),
                    init: Some(num(0.0)),
                }]),
            })),
            Stmt::Return(Some(Expr::Function(Box::new(inner)))),
        ],
    );
    // let c = counter(); sink(c(), c(), c())
    let p = program(
        vec![lexical("c")],
        vec![
            Stmt::FunctionDecl(Box::new(counter)),
            let_ident("c", 0, call(global("counter"), vec![])),
            expr_stmt(call(
                global("sink"),
                vec![
                    call(local("c", 0), vec![]),
                    call(local("c", 0), vec![]),
                    call(local("c", 0), vec![]),
                ],
            )),
        ],
    );
    let mut rt = runtime_with_sink();
    run_ok(&mut rt, &p);
    assert_eq!(sink_numbers(&rt), vec![1.0, 2.0, 3.0]);
}

#[test]
fn classes_instantiate_with_fields_methods_and_getters() {
    // class Point { x = 1; constructor(y) { this.y = y } sum() { return this.x + this.y }
    //               get double() { return this.sum() * 2 } }
    let constructor = FunctionNode {
        name: Some("constructor".to_string()),
        kind: quill_ir::FunctionKind::Normal,
        params: Box::new([Param { name: "y".to_string(), default: None }]),
        body: Box::new([expr_stmt(assign(member(Expr::This, "y"), argument("y", 0)))]),
        locals: Box::new([]),
    };
    let sum = FunctionNode {
        name: Some("sum".to_string()),
        kind: quill_ir::FunctionKind::Normal,
        params: Box::new([]),
        body: Box::new([Stmt::Return(Some(binary(
            BinaryOp::Add,
            member(Expr::This, "x"),
            member(Expr::This, "y"),
        )))]),
        locals: Box::new([]),
    };
    let double = FunctionNode {
        name: Some("double".to_string()),
        kind: quill_ir::FunctionKind::Normal,
        params: Box::new([]),
        body: Box::new([Stmt::Return(Some(binary(
            BinaryOp::Mul,
            call(member(Expr::This, "sum"), vec![]),
            num(2.0),
        )))]),
        locals: Box::new([]),
    };
    let class = ClassNode {
        name: Some("Point".to_string()),
        superclass: None,
        members: Box::new([
            ClassMember {
                kind: ClassMemberKind::Field,
                key: "x".to_string(),
                function: None,
                field_init: Some(num(1.0)),
                is_static: false,
                is_private: false,
            },
            ClassMember {
                kind: ClassMemberKind::Method,
                key: "constructor".to_string(),
                function: Some(constructor),
                field_init: None,
                is_static: false,
                is_private: false,
            },
            ClassMember {
                kind: ClassMemberKind::Method,
                key: "sum".to_string(),
                function: Some(sum),
                field_init: None,
                is_static: false,
                is_private: false,
            },
            ClassMember {
                kind: ClassMemberKind::Getter,
                key: "double".to_string(),
                function: Some(double),
                field_init: None,
                is_static: false,
                is_private: false,
            },
        ]),
    };
    // let p = new Point(2); sink(p.sum(), p.double)
    let p = program(
        vec![lexical("p")],
        vec![
            Stmt::ClassDecl(Box::new(class)),
            let_ident(
                "p",
                0,
                Expr::New(Box::new(NewExpr { callee: global("Point"), args: Box::new([num(2.0)]) })),
            ),
            expr_stmt(call(
                global("sink"),
                vec![
                    call(member(local("p", 0), "sum"), vec![]),
                    member(local("p", 0), "double"),
                ],
            )),
        ],
    );
    let mut rt = runtime_with_sink();
    run_ok(&mut rt, &p);
    assert_eq!(sink_numbers(&rt), vec![3.0, 6.0]);
}

#[test]
fn compound_assignment_evaluates_the_base_once() {
    // let o = { n: 1 }; o.n += 2; sink(o.n)
    let object = Expr::Object(Box::new([ObjectProperty {
        key: "n".into(),
        kind: ObjectPropertyKind::Value,
        value: num(1.0),
    }]));
    let p = program(
        vec![lexical("o")],
        vec![
            let_ident("o", 0, object),
            expr_stmt(Expr::Assign {
                op: AssignOp::Add,
                target: Box::new(member(local("o", 0), "n")),
                value: Box::new(num(2.0)),
            }),
            expr_stmt(call(global("sink"), vec![member(local("o", 0), "n")])),
        ],
    );
    let mut rt = runtime_with_sink();
    run_ok(&mut rt, &p);
    assert_eq!(sink_numbers(&rt), vec![3.0]);
}

#[test]
fn optional_chaining_short_circuits_on_nullish() {
    // let o = null; sink(o?.x)
    let optional = Expr::Member(Box::new(MemberExpr {
        object: local("o", 0),
        key: MemberKey::Prop("x".to_string()),
        optional: true,
    }));
    let p = program(
        vec![lexical("o")],
        vec![
            let_ident("o", 0, Expr::Null),
            expr_stmt(call(global("sink"), vec![optional])),
        ],
    );
    let mut rt = runtime_with_sink();
    run_ok(&mut rt, &p);
    assert_eq!(rt.sink, vec![Value::UNDEFINED]);
}
