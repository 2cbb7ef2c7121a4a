//! Pre-order traversal over a parsed Python module.
//!
//! Every statement and expression that Python evaluates is visited:
//! decorators, argument defaults and annotations, class bases and keywords,
//! comprehension clauses, f-string parts, match guards, exception handler
//! types and with-items. Match patterns are skipped; they cannot contain calls.

use rustpython_parser::ast::{self, Expr, Stmt};

pub trait Visitor<'a> {
    fn visit_stmt(&mut self, _stmt: &'a Stmt) {}
    fn visit_expr(&mut self, _expr: &'a Expr) {}
}

pub fn walk_body<'a, V: Visitor<'a>>(visitor: &mut V, body: &'a [Stmt]) {
    for stmt in body {
        walk_stmt(visitor, stmt);
    }
}

pub fn walk_stmt<'a, V: Visitor<'a>>(visitor: &mut V, stmt: &'a Stmt) {
    visitor.visit_stmt(stmt);

    match stmt {
        Stmt::FunctionDef(ast::StmtFunctionDef {
            args,
            body,
            decorator_list,
            returns,
            ..
        }) => {
            walk_exprs(visitor, decorator_list);
            walk_arguments(visitor, args);
            walk_opt_expr(visitor, returns.as_deref());
            walk_body(visitor, body);
        }
        Stmt::AsyncFunctionDef(ast::StmtAsyncFunctionDef {
            args,
            body,
            decorator_list,
            returns,
            ..
        }) => {
            walk_exprs(visitor, decorator_list);
            walk_arguments(visitor, args);
            walk_opt_expr(visitor, returns.as_deref());
            walk_body(visitor, body);
        }
        Stmt::ClassDef(ast::StmtClassDef {
            bases,
            keywords,
            body,
            decorator_list,
            ..
        }) => {
            walk_exprs(visitor, decorator_list);
            walk_exprs(visitor, bases);
            walk_keywords(visitor, keywords);
            walk_body(visitor, body);
        }
        Stmt::Return(ast::StmtReturn { value, .. }) => {
            walk_opt_expr(visitor, value.as_deref());
        }
        Stmt::Delete(ast::StmtDelete { targets, .. }) => walk_exprs(visitor, targets),
        Stmt::Assign(ast::StmtAssign { targets, value, .. }) => {
            walk_exprs(visitor, targets);
            walk_expr(visitor, value);
        }
        Stmt::AugAssign(ast::StmtAugAssign { target, value, .. }) => {
            walk_expr(visitor, target);
            walk_expr(visitor, value);
        }
        Stmt::AnnAssign(ast::StmtAnnAssign {
            target,
            annotation,
            value,
            ..
        }) => {
            walk_expr(visitor, target);
            walk_expr(visitor, annotation);
            walk_opt_expr(visitor, value.as_deref());
        }
        Stmt::For(ast::StmtFor {
            target,
            iter,
            body,
            orelse,
            ..
        }) => {
            walk_expr(visitor, target);
            walk_expr(visitor, iter);
            walk_body(visitor, body);
            walk_body(visitor, orelse);
        }
        Stmt::AsyncFor(ast::StmtAsyncFor {
            target,
            iter,
            body,
            orelse,
            ..
        }) => {
            walk_expr(visitor, target);
            walk_expr(visitor, iter);
            walk_body(visitor, body);
            walk_body(visitor, orelse);
        }
        Stmt::While(ast::StmtWhile {
            test, body, orelse, ..
        }) => {
            walk_expr(visitor, test);
            walk_body(visitor, body);
            walk_body(visitor, orelse);
        }
        Stmt::If(ast::StmtIf {
            test, body, orelse, ..
        }) => {
            walk_expr(visitor, test);
            walk_body(visitor, body);
            walk_body(visitor, orelse);
        }
        Stmt::With(ast::StmtWith { items, body, .. }) => {
            walk_with_items(visitor, items);
            walk_body(visitor, body);
        }
        Stmt::AsyncWith(ast::StmtAsyncWith { items, body, .. }) => {
            walk_with_items(visitor, items);
            walk_body(visitor, body);
        }
        Stmt::Match(ast::StmtMatch { subject, cases, .. }) => {
            walk_expr(visitor, subject);
            for case in cases {
                walk_opt_expr(visitor, case.guard.as_deref());
                walk_body(visitor, &case.body);
            }
        }
        Stmt::Raise(ast::StmtRaise { exc, cause, .. }) => {
            walk_opt_expr(visitor, exc.as_deref());
            walk_opt_expr(visitor, cause.as_deref());
        }
        Stmt::Try(ast::StmtTry {
            body,
            handlers,
            orelse,
            finalbody,
            ..
        }) => {
            walk_body(visitor, body);
            walk_handlers(visitor, handlers);
            walk_body(visitor, orelse);
            walk_body(visitor, finalbody);
        }
        Stmt::TryStar(ast::StmtTryStar {
            body,
            handlers,
            orelse,
            finalbody,
            ..
        }) => {
            walk_body(visitor, body);
            walk_handlers(visitor, handlers);
            walk_body(visitor, orelse);
            walk_body(visitor, finalbody);
        }
        Stmt::Assert(ast::StmtAssert { test, msg, .. }) => {
            walk_expr(visitor, test);
            walk_opt_expr(visitor, msg.as_deref());
        }
        Stmt::Expr(ast::StmtExpr { value, .. }) => walk_expr(visitor, value),
        _ => {}
    }
}

pub fn walk_expr<'a, V: Visitor<'a>>(visitor: &mut V, expr: &'a Expr) {
    visitor.visit_expr(expr);

    match expr {
        Expr::Call(ast::ExprCall {
            func,
            args,
            keywords,
            ..
        }) => {
            walk_expr(visitor, func);
            walk_exprs(visitor, args);
            walk_keywords(visitor, keywords);
        }
        Expr::BoolOp(ast::ExprBoolOp { values, .. }) => walk_exprs(visitor, values),
        Expr::NamedExpr(ast::ExprNamedExpr { target, value, .. }) => {
            walk_expr(visitor, target);
            walk_expr(visitor, value);
        }
        Expr::BinOp(ast::ExprBinOp { left, right, .. }) => {
            walk_expr(visitor, left);
            walk_expr(visitor, right);
        }
        Expr::UnaryOp(ast::ExprUnaryOp { operand, .. }) => walk_expr(visitor, operand),
        Expr::Lambda(ast::ExprLambda { args, body, .. }) => {
            walk_arguments(visitor, args);
            walk_expr(visitor, body);
        }
        Expr::IfExp(ast::ExprIfExp {
            test, body, orelse, ..
        }) => {
            walk_expr(visitor, test);
            walk_expr(visitor, body);
            walk_expr(visitor, orelse);
        }
        Expr::Dict(ast::ExprDict { keys, values, .. }) => {
            for key in keys.iter().flatten() {
                walk_expr(visitor, key);
            }
            walk_exprs(visitor, values);
        }
        Expr::Set(ast::ExprSet { elts, .. }) => walk_exprs(visitor, elts),
        Expr::List(ast::ExprList { elts, .. }) => walk_exprs(visitor, elts),
        Expr::Tuple(ast::ExprTuple { elts, .. }) => walk_exprs(visitor, elts),
        Expr::ListComp(ast::ExprListComp {
            elt, generators, ..
        }) => {
            walk_expr(visitor, elt);
            walk_comprehensions(visitor, generators);
        }
        Expr::SetComp(ast::ExprSetComp {
            elt, generators, ..
        }) => {
            walk_expr(visitor, elt);
            walk_comprehensions(visitor, generators);
        }
        Expr::GeneratorExp(ast::ExprGeneratorExp {
            elt, generators, ..
        }) => {
            walk_expr(visitor, elt);
            walk_comprehensions(visitor, generators);
        }
        Expr::DictComp(ast::ExprDictComp {
            key,
            value,
            generators,
            ..
        }) => {
            walk_expr(visitor, key);
            walk_expr(visitor, value);
            walk_comprehensions(visitor, generators);
        }
        Expr::Await(ast::ExprAwait { value, .. }) => walk_expr(visitor, value),
        Expr::Yield(ast::ExprYield { value, .. }) => walk_opt_expr(visitor, value.as_deref()),
        Expr::YieldFrom(ast::ExprYieldFrom { value, .. }) => walk_expr(visitor, value),
        Expr::Compare(ast::ExprCompare {
            left, comparators, ..
        }) => {
            walk_expr(visitor, left);
            walk_exprs(visitor, comparators);
        }
        Expr::FormattedValue(ast::ExprFormattedValue {
            value, format_spec, ..
        }) => {
            walk_expr(visitor, value);
            walk_opt_expr(visitor, format_spec.as_deref());
        }
        Expr::JoinedStr(ast::ExprJoinedStr { values, .. }) => walk_exprs(visitor, values),
        Expr::Attribute(ast::ExprAttribute { value, .. }) => walk_expr(visitor, value),
        Expr::Subscript(ast::ExprSubscript { value, slice, .. }) => {
            walk_expr(visitor, value);
            walk_expr(visitor, slice);
        }
        Expr::Starred(ast::ExprStarred { value, .. }) => walk_expr(visitor, value),
        Expr::Slice(ast::ExprSlice {
            lower, upper, step, ..
        }) => {
            walk_opt_expr(visitor, lower.as_deref());
            walk_opt_expr(visitor, upper.as_deref());
            walk_opt_expr(visitor, step.as_deref());
        }
        _ => {}
    }
}

fn walk_exprs<'a, V: Visitor<'a>>(visitor: &mut V, exprs: &'a [Expr]) {
    for expr in exprs {
        walk_expr(visitor, expr);
    }
}

fn walk_opt_expr<'a, V: Visitor<'a>>(visitor: &mut V, expr: Option<&'a Expr>) {
    if let Some(expr) = expr {
        walk_expr(visitor, expr);
    }
}

fn walk_keywords<'a, V: Visitor<'a>>(visitor: &mut V, keywords: &'a [ast::Keyword]) {
    for keyword in keywords {
        walk_expr(visitor, &keyword.value);
    }
}

fn walk_arguments<'a, V: Visitor<'a>>(visitor: &mut V, arguments: &'a ast::Arguments) {
    let with_defaults = arguments
        .posonlyargs
        .iter()
        .chain(&arguments.args)
        .chain(&arguments.kwonlyargs);
    for arg in with_defaults {
        walk_opt_expr(visitor, arg.def.annotation.as_deref());
        walk_opt_expr(visitor, arg.default.as_deref());
    }
    for arg in arguments.vararg.iter().chain(&arguments.kwarg) {
        walk_opt_expr(visitor, arg.annotation.as_deref());
    }
}

fn walk_comprehensions<'a, V: Visitor<'a>>(visitor: &mut V, generators: &'a [ast::Comprehension]) {
    for generator in generators {
        walk_expr(visitor, &generator.target);
        walk_expr(visitor, &generator.iter);
        walk_exprs(visitor, &generator.ifs);
    }
}

fn walk_with_items<'a, V: Visitor<'a>>(visitor: &mut V, items: &'a [ast::WithItem]) {
    for item in items {
        walk_expr(visitor, &item.context_expr);
        walk_opt_expr(visitor, item.optional_vars.as_deref());
    }
}

fn walk_handlers<'a, V: Visitor<'a>>(visitor: &mut V, handlers: &'a [ast::ExceptHandler]) {
    for handler in handlers {
        let ast::ExceptHandler::ExceptHandler(handler) = handler;
        walk_opt_expr(visitor, handler.type_.as_deref());
        walk_body(visitor, &handler.body);
    }
}
