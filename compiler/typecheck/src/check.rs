use std::collections::{HashMap, HashSet};

use ast::*;

use crate::TypeError;

type CheckResult<T> = Result<T, TypeError>;

pub struct TypeChecker {
    callables: HashMap<String, (Vec<Type>, Option<Type>)>,
    globals: HashMap<String, Type>,
    scopes: Vec<HashMap<String, Type>>,
    /// All local names seen in the current callable. Locals share one
    /// namespace per callable; shadowing is rejected.
    locals_seen: HashSet<String>,
    return_ty: Option<Type>,
    current_callable: String,
}

/// Type-check the program, writing the computed type into every expression.
pub fn check(program: &mut Program) -> CheckResult<()> {
    TypeChecker::new().check_program(program)
}

impl TypeChecker {
    pub fn new() -> Self {
        Self {
            callables: HashMap::new(),
            globals: HashMap::new(),
            scopes: vec![],
            locals_seen: HashSet::new(),
            return_ty: None,
            current_callable: String::new(),
        }
    }

    pub fn check_program(&mut self, program: &mut Program) -> CheckResult<()> {
        self.collect_signatures(program)?;

        for global in &mut program.globals {
            if !global.ty.is_scalar() {
                return Err(TypeError::NonScalarGlobal(global.name.clone()));
            }
            let expected = global.ty.clone();
            self.check_expr(&mut global.init, Some(&expected))?;
        }

        for callable in &mut program.callables {
            self.check_callable(callable)?;
        }

        match self.callables.get("main") {
            None => Err(TypeError::MissingMain),
            Some((params, return_ty)) => {
                if !params.is_empty() || return_ty.is_some() {
                    Err(TypeError::BadMainSignature)
                } else {
                    Ok(())
                }
            }
        }
    }

    fn collect_signatures(&mut self, program: &Program) -> CheckResult<()> {
        for global in &program.globals {
            if self
                .globals
                .insert(global.name.clone(), global.ty.clone())
                .is_some()
            {
                return Err(TypeError::Duplicate(global.name.clone()));
            }
        }

        for callable in &program.callables {
            let sig = (
                callable.params.iter().map(|(_, ty)| ty.clone()).collect(),
                callable.return_ty.clone(),
            );
            if self.callables.insert(callable.name.clone(), sig).is_some() {
                return Err(TypeError::Duplicate(callable.name.clone()));
            }
        }

        Ok(())
    }

    fn check_callable(&mut self, callable: &mut Callable) -> CheckResult<()> {
        self.current_callable = callable.name.clone();
        self.return_ty = callable.return_ty.clone();
        self.locals_seen.clear();
        self.scopes.clear();

        // the calling convention passes scalars only
        if let Some(return_ty) = &callable.return_ty {
            if !return_ty.is_scalar() {
                return Err(TypeError::NonScalarReturn(callable.name.clone()));
            }
        }

        let mut params = HashMap::new();
        for (name, ty) in &callable.params {
            if !ty.is_scalar() {
                return Err(TypeError::NonScalarParam(name.clone()));
            }
            if !self.locals_seen.insert(name.clone()) {
                return Err(TypeError::Duplicate(name.clone()));
            }
            params.insert(name.clone(), ty.clone());
        }
        self.scopes.push(params);

        self.check_block(&mut callable.body)?;

        self.scopes.pop();

        Ok(())
    }

    fn check_block(&mut self, block: &mut Block) -> CheckResult<()> {
        self.scopes.push(HashMap::new());

        for stmt in &mut block.stmts {
            self.check_stmt(stmt)?;
        }

        self.scopes.pop();

        Ok(())
    }

    fn check_stmt(&mut self, stmt: &mut Stmt) -> CheckResult<()> {
        match stmt {
            Stmt::Declare { name, ty, init } => {
                match ty {
                    // Lists are zero-initialized; the declaration carries a
                    // literal 0 placeholder in initializer position.
                    Type::List(..) => match init.kind {
                        ExprKind::IntConstant(0) => {
                            init.ty = Type::Int64;
                        }
                        _ => {
                            return Err(TypeError::Mismatch {
                                expected: ty.to_string(),
                                found: "a non-zero list initializer".to_string(),
                            })
                        }
                    },
                    _ => {
                        let expected = ty.clone();
                        self.check_expr(init, Some(&expected))?;
                    }
                }

                if !self.locals_seen.insert(name.clone()) {
                    return Err(TypeError::Duplicate(name.clone()));
                }
                self.scopes
                    .last_mut()
                    .expect("scope stack is never empty inside a callable")
                    .insert(name.clone(), ty.clone());

                Ok(())
            }
            Stmt::Assign { target, value } => {
                let target_ty = self.check_expr(target, None)?;
                if !is_lvalue(target) {
                    return Err(TypeError::BadLValue);
                }
                self.check_expr(value, Some(&target_ty))?;
                Ok(())
            }
            Stmt::Eval(expr) => {
                // A call to a procedure is only legal in statement position
                match &mut expr.kind {
                    ExprKind::Call { .. } => {
                        self.check_call(expr, true)?;
                    }
                    _ => {
                        self.check_expr(expr, None)?;
                    }
                }
                Ok(())
            }
            Stmt::Print(expr) => {
                let ty = self.check_expr(expr, None)?;
                match ty {
                    Type::Int64 | Type::Bool => Ok(()),
                    found => Err(TypeError::Mismatch {
                        expected: "int64 or bool".to_string(),
                        found: found.to_string(),
                    }),
                }
            }
            Stmt::Block(block) => self.check_block(block),
            Stmt::IfElse {
                condition,
                true_branch,
                false_branch,
            } => {
                self.check_expr(condition, Some(&Type::Bool))?;
                self.check_stmt(true_branch)?;
                if let Some(false_branch) = false_branch {
                    self.check_stmt(false_branch)?;
                }
                Ok(())
            }
            Stmt::While { condition, body } => {
                self.check_expr(condition, Some(&Type::Bool))?;
                self.check_stmt(body)
            }
            Stmt::Return(None) => {
                if self.return_ty.is_some() {
                    Err(TypeError::MissingReturnValue(self.current_callable.clone()))
                } else {
                    Ok(())
                }
            }
            Stmt::Return(Some(expr)) => match self.return_ty.clone() {
                Some(expected) => {
                    self.check_expr(expr, Some(&expected))?;
                    Ok(())
                }
                None => Err(TypeError::ReturnValueInProc(self.current_callable.clone())),
            },
        }
    }

    fn check_expr(&mut self, expr: &mut Expr, expected: Option<&Type>) -> CheckResult<Type> {
        let ty = match &mut expr.kind {
            ExprKind::IntConstant(_) => Type::Int64,
            ExprKind::BoolConstant(_) => Type::Bool,
            ExprKind::Null => match expected {
                Some(ty @ Type::Pointer(_)) => ty.clone(),
                _ => return Err(TypeError::UntypedNull),
            },
            ExprKind::Var(name) => self.lookup_var(name)?,
            ExprKind::Unary { op, arg } => match op {
                UnaryOp::Negate | UnaryOp::BitNot => {
                    self.check_expr(arg, Some(&Type::Int64))?;
                    Type::Int64
                }
                UnaryOp::LogNot => {
                    self.check_expr(arg, Some(&Type::Bool))?;
                    Type::Bool
                }
            },
            ExprKind::Binary { op, left, right } => match op {
                BinaryOp::Add
                | BinaryOp::Subtract
                | BinaryOp::Multiply
                | BinaryOp::Divide
                | BinaryOp::Modulo
                | BinaryOp::BitAnd
                | BinaryOp::BitOr
                | BinaryOp::BitXor
                | BinaryOp::Lshift
                | BinaryOp::Rshift => {
                    self.check_expr(left, Some(&Type::Int64))?;
                    self.check_expr(right, Some(&Type::Int64))?;
                    Type::Int64
                }
                BinaryOp::Less | BinaryOp::LessEq | BinaryOp::Greater | BinaryOp::GreaterEq => {
                    self.check_expr(left, Some(&Type::Int64))?;
                    self.check_expr(right, Some(&Type::Int64))?;
                    Type::Bool
                }
                BinaryOp::Eq | BinaryOp::NotEq => {
                    // `null` picks up its type from the other side
                    let (first, second) = if matches!(left.kind, ExprKind::Null) {
                        (right, left)
                    } else {
                        (left, right)
                    };

                    let first_ty = self.check_expr(first, None)?;
                    self.check_expr(second, Some(&first_ty))?;

                    if !first_ty.is_scalar() {
                        return Err(TypeError::Mismatch {
                            expected: "a scalar type".to_string(),
                            found: first_ty.to_string(),
                        });
                    }

                    Type::Bool
                }
                BinaryOp::LogAnd | BinaryOp::LogOr => {
                    self.check_expr(left, Some(&Type::Bool))?;
                    self.check_expr(right, Some(&Type::Bool))?;
                    Type::Bool
                }
            },
            ExprKind::Call { .. } => return self.check_call_expected(expr, expected),
            ExprKind::Alloc { elem_ty, len } => {
                let elem_ty = elem_ty.clone();
                self.check_expr(len, Some(&Type::Int64))?;
                Type::pointer(elem_ty)
            }
            ExprKind::AddressOf(arg) => {
                let arg_ty = self.check_expr(arg, None)?;
                if !is_lvalue(arg) {
                    return Err(TypeError::BadLValue);
                }
                Type::pointer(arg_ty)
            }
            ExprKind::Deref(arg) => match self.check_expr(arg, None)? {
                Type::Pointer(to) => *to,
                found => {
                    return Err(TypeError::Mismatch {
                        expected: "a pointer type".to_string(),
                        found: found.to_string(),
                    })
                }
            },
            ExprKind::ListElem { list, index } => {
                let base_ty = self.check_expr(list, None)?;
                self.check_expr(index, Some(&Type::Int64))?;

                match base_ty {
                    Type::List(elem, _) => *elem,
                    Type::Pointer(to) => *to,
                    found => {
                        return Err(TypeError::Mismatch {
                            expected: "a list or pointer type".to_string(),
                            found: found.to_string(),
                        })
                    }
                }
            }
        };

        self.finish(expr, ty, expected)
    }

    fn check_call_expected(
        &mut self,
        expr: &mut Expr,
        expected: Option<&Type>,
    ) -> CheckResult<Type> {
        let ty = self.check_call(expr, false)?;
        self.finish(expr, ty, expected)
    }

    /// Check a call expression. `statement_position` permits calls to
    /// procedures, whose "result" cannot be used as a value.
    fn check_call(&mut self, expr: &mut Expr, statement_position: bool) -> CheckResult<Type> {
        let ExprKind::Call { func, args } = &mut expr.kind else {
            unreachable!("check_call on a non-call expression");
        };

        let (param_tys, return_ty) = self
            .callables
            .get(func.as_str())
            .cloned()
            .ok_or_else(|| TypeError::UndefinedCallable(func.clone()))?;

        if args.len() != param_tys.len() {
            return Err(TypeError::ArityMismatch {
                func: func.clone(),
                expected: param_tys.len(),
                found: args.len(),
            });
        }

        let func = func.clone();
        for (arg, param_ty) in args.iter_mut().zip(&param_tys) {
            self.check_expr(arg, Some(param_ty))?;
        }

        match return_ty {
            Some(ty) => {
                expr.ty = ty.clone();
                Ok(ty)
            }
            None if statement_position => {
                expr.ty = Type::Unknown;
                Ok(Type::Unknown)
            }
            None => Err(TypeError::ProcAsValue(func)),
        }
    }

    fn finish(&self, expr: &mut Expr, ty: Type, expected: Option<&Type>) -> CheckResult<Type> {
        if let Some(expected) = expected {
            if *expected != ty {
                return Err(TypeError::Mismatch {
                    expected: expected.to_string(),
                    found: ty.to_string(),
                });
            }
        }

        expr.ty = ty.clone();
        Ok(ty)
    }

    fn lookup_var(&self, name: &str) -> CheckResult<Type> {
        for scope in self.scopes.iter().rev() {
            if let Some(ty) = scope.get(name) {
                return Ok(ty.clone());
            }
        }

        self.globals
            .get(name)
            .cloned()
            .ok_or_else(|| TypeError::UndeclaredVariable(name.to_string()))
    }
}

fn is_lvalue(expr: &Expr) -> bool {
    matches!(
        expr.kind,
        ExprKind::Var(_) | ExprKind::ListElem { .. } | ExprKind::Deref(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use lexer::Lexer;
    use parser::Parser;

    fn check_src(src: &str) -> CheckResult<Program> {
        let tokens = Lexer::new(src).tokenize();
        let mut program = Parser::new(tokens).parse().unwrap();
        check(&mut program)?;
        Ok(program)
    }

    #[test]
    fn accepts_simple_program() {
        assert!(check_src("proc main() { print 1 + 2 * 3; }").is_ok());
    }

    #[test]
    fn missing_main_is_rejected() {
        assert_eq!(
            check_src("proc start() { print 1; }"),
            Err(TypeError::MissingMain)
        );
    }

    #[test]
    fn main_with_params_is_rejected() {
        assert_eq!(
            check_src("proc main(x : int64) { print x; }"),
            Err(TypeError::BadMainSignature)
        );
    }

    #[test]
    fn condition_must_be_bool() {
        assert!(matches!(
            check_src("proc main() { if (1) print 1; }"),
            Err(TypeError::Mismatch { .. })
        ));
    }

    #[test]
    fn assignment_to_non_lvalue_is_rejected() {
        assert_eq!(
            check_src("proc main() { 1 + 2 = 3; }"),
            Err(TypeError::BadLValue)
        );
    }

    #[test]
    fn address_of_rvalue_is_rejected() {
        assert_eq!(
            check_src("proc main() { var p = &(1 + 2) : int64*; print 0; }"),
            Err(TypeError::BadLValue)
        );
    }

    #[test]
    fn null_needs_pointer_context() {
        assert_eq!(
            check_src("proc main() { var x = null : int64; print x; }"),
            Err(TypeError::UntypedNull)
        );
        assert!(check_src("proc main() { var p = null : int64*; print 0; }").is_ok());
    }

    #[test]
    fn proc_call_is_statement_only() {
        let src = "proc helper() { print 1; } proc main() { var x = helper() : int64; print x; }";
        assert_eq!(
            check_src(src),
            Err(TypeError::ProcAsValue("helper".to_string()))
        );

        assert!(check_src("proc helper() { print 1; } proc main() { helper(); }").is_ok());
    }

    #[test]
    fn pointer_expressions_typecheck() {
        let src = "proc main() {
            var x = 3 : int64;
            var p = &x : int64*;
            *p = *p + 4;
            print x;
        }";
        let program = check_src(src).unwrap();

        // the deref on the right-hand side got its type filled in
        match &program.callables[0].body.stmts[2] {
            Stmt::Assign { value, .. } => assert_eq!(value.ty, Type::Int64),
            stmt => panic!("expected assignment, got {:?}", stmt),
        }
    }

    #[test]
    fn list_indexing_on_pointers_and_lists() {
        let src = "proc main() {
            var a = alloc int64[3] : int64*;
            var l = 0 : int64[2];
            a[0] = 1;
            l[1] = a[0];
            print l[1];
        }";
        assert!(check_src(src).is_ok());
    }

    #[test]
    fn shadowing_is_rejected() {
        let src = "proc main() { var x = 1 : int64; { var x = 2 : int64; print x; } }";
        assert_eq!(check_src(src), Err(TypeError::Duplicate("x".to_string())));
    }

    #[test]
    fn arity_is_checked() {
        let src = "fun f(x : int64) : int64 { return x; } proc main() { print f(1, 2); }";
        assert!(matches!(
            check_src(src),
            Err(TypeError::ArityMismatch { .. })
        ));
    }

    #[test]
    fn globals_are_visible_and_scalar_only() {
        assert!(check_src("var g = 7 : int64; proc main() { print g; }").is_ok());
        assert_eq!(
            check_src("var g = 0 : int64[3]; proc main() { print 0; }"),
            Err(TypeError::NonScalarGlobal("g".to_string()))
        );
    }
}
