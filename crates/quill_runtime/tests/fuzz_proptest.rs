//! Property suites over the compiler: folded and unfolded arithmetic agree
//! bit-for-bit, `x | 0` truncates with exact 32-bit wraparound, and
//! compilation is deterministic over arbitrary literal trees.

use proptest::prelude::*;
use proptest::test_runner::Config as ProptestConfig;

use quill_ir::ast::*;
use quill_ir::{compile_program, to_int32, Instruction};
use quill_runtime::{Runtime, Value};

fn numeric_op() -> impl Strategy<Value = BinaryOp> {
    prop_oneof![
        Just(BinaryOp::Add),
        Just(BinaryOp::Sub),
        Just(BinaryOp::Mul),
        Just(BinaryOp::Div),
        Just(BinaryOp::Mod),
        Just(BinaryOp::BitwiseAnd),
        Just(BinaryOp::BitwiseOr),
        Just(BinaryOp::BitwiseXor),
        Just(BinaryOp::LeftShift),
        Just(BinaryOp::RightShift),
        Just(BinaryOp::UnsignedRightShift),
        Just(BinaryOp::LessThan),
        Just(BinaryOp::LessThanEquals),
        Just(BinaryOp::GreaterThan),
        Just(BinaryOp::GreaterThanEquals),
        Just(BinaryOp::StrictlyEquals),
        Just(BinaryOp::StrictlyInequals),
    ]
}

fn logical_op() -> impl Strategy<Value = LogicalOp> {
    prop_oneof![
        Just(LogicalOp::And),
        Just(LogicalOp::Or),
        Just(LogicalOp::NullishCoalescing),
    ]
}

fn literal_leaf() -> impl Strategy<Value = Expr> {
    prop_oneof![
        any::<f64>().prop_map(Expr::Number),
        "[a-z]{0,6}".prop_map(Expr::Str),
        any::<bool>().prop_map(Expr::Bool),
        Just(Expr::Null),
        Just(Expr::Undefined),
    ]
}

fn literal_tree() -> impl Strategy<Value = Expr> {
    literal_leaf().prop_recursive(4, 24, 3, |inner| {
        prop_oneof![
            (numeric_op(), inner.clone(), inner.clone()).prop_map(|(op, lhs, rhs)| Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            }),
            (logical_op(), inner.clone(), inner.clone()).prop_map(|(op, lhs, rhs)| Expr::Logical {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            }),
            (inner.clone(), inner.clone(), inner.clone()).prop_map(|(test, consequent, alternate)| {
                Expr::Conditional {
                    test: Box::new(test),
                    consequent: Box::new(consequent),
                    alternate: Box::new(alternate),
                }
            }),
            inner.prop_map(|operand| Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            }),
        ]
    })
}

fn expr_program(expr: Expr) -> Program {
    Program { body: Box::new([Stmt::Expr(expr)]), locals: Box::new([]) }
}

/// The same operation with its operands routed through frame slots, which
/// identifier loads never fold through.
fn unfolded_program(op: BinaryOp, lhs: f64, rhs: f64) -> Program {
    let decl = |name: &str, slot: u32, value: f64| {
        Stmt::Decl(Box::new(VarDecl {
            kind: DeclKind::Let,
            declarators: Box::new([Declarator {
                target: BindingTarget::Ident(Box::new(Ident::local(name, slot))),
                init: Some(Expr::Number(value)),
            }]),
        }))
    };
    Program {
        body: Box::new([
            decl("a", 0, lhs),
            decl("b", 1, rhs),
            Stmt::Expr(Expr::Binary {
                op,
                lhs: Box::new(Expr::Ident(Box::new(Ident::local("a", 0)))),
                rhs: Box::new(Expr::Ident(Box::new(Ident::local("b", 1)))),
            }),
        ]),
        locals: Box::new([
            LocalDecl { name: "a".into(), lexical: true },
            LocalDecl { name: "b".into(), lexical: true },
        ]),
    }
}

fn is_computational(instruction: &Instruction) -> bool {
    matches!(
        instruction,
        Instruction::Add { .. }
            | Instruction::Sub { .. }
            | Instruction::Mul { .. }
            | Instruction::Div { .. }
            | Instruction::Mod { .. }
            | Instruction::BitwiseAnd { .. }
            | Instruction::BitwiseOr { .. }
            | Instruction::BitwiseXor { .. }
            | Instruction::LeftShift { .. }
            | Instruction::RightShift { .. }
            | Instruction::UnsignedRightShift { .. }
            | Instruction::LessThan { .. }
            | Instruction::LessThanEquals { .. }
            | Instruction::GreaterThan { .. }
            | Instruction::GreaterThanEquals { .. }
            | Instruction::LooselyEquals { .. }
            | Instruction::LooselyInequals { .. }
            | Instruction::StrictlyEquals { .. }
            | Instruction::StrictlyInequals { .. }
    )
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64, max_shrink_iters: 400, .. ProptestConfig::default()
    })]

    #[test]
    fn folded_numeric_ops_match_the_runtime_path(
        lhs in any::<f64>(),
        rhs in any::<f64>(),
        op in numeric_op(),
    ) {
        let folded = compile_program(&expr_program(Expr::Binary {
            op,
            lhs: Box::new(Expr::Number(lhs)),
            rhs: Box::new(Expr::Number(rhs)),
        }));
        prop_assert!(
            !folded.instructions.iter().any(is_computational),
            "literal operands must fold away the instruction"
        );

        let mut rt = Runtime::new();
        let folded_result = rt.run_program(&folded).unwrap();

        let unfolded = compile_program(&unfolded_program(op, lhs, rhs));
        let unfolded_result = rt.run_program(&unfolded).unwrap();

        // Value equality is bit equality, so NaN payloads and zero signs
        // must agree too.
        prop_assert_eq!(folded_result, unfolded_result);
    }

    #[test]
    fn bitwise_or_zero_is_exact_int32_truncation(x in any::<f64>()) {
        let program = expr_program(Expr::Binary {
            op: BinaryOp::BitwiseOr,
            lhs: Box::new(Expr::Number(x)),
            rhs: Box::new(Expr::Number(0.0)),
        });
        let executable = compile_program(&program);
        let mut rt = Runtime::new();
        let result = rt.run_program(&executable).unwrap();
        prop_assert_eq!(result, Value::number(to_int32(x) as f64));
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 32, max_shrink_iters: 200, .. ProptestConfig::default()
    })]

    #[test]
    fn compilation_is_deterministic(expr in literal_tree()) {
        let program = expr_program(expr);
        let first = compile_program(&program);
        let second = compile_program(&program);
        prop_assert_eq!(&first.instructions, &second.instructions);
        prop_assert_eq!(&first.constants, &second.constants);
        prop_assert_eq!(&first.strings, &second.strings);
        prop_assert_eq!(first.register_count, second.register_count);
    }

    #[test]
    fn literal_trees_run_without_panicking(expr in literal_tree()) {
        let executable = compile_program(&expr_program(expr));
        let mut rt = Runtime::new();
        // Literal trees have no throwing operators; the completion value is
        // whatever the tree folds or computes to.
        prop_assert!(rt.run_program(&executable).is_ok());
    }
}
