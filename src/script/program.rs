//! Compilation of the benchmark-script subset to a flat step list.
//!
//! An async function body (or a module's top-level statements in CLI
//! mode) becomes a sequence of steps executed in order by the fetch
//! loop. `await` is a step-level suspension point: it may appear only
//! as the outermost operator of a step's expression, which is exactly
//! the shape benchmark scripts take (`const r = await fetch(...)`,
//! `const t = await r.text()`, `return r.status`).
//!
//! Anything outside the subset is rejected at load time with an
//! `Unsupported` error naming the construct.

use crate::script::ScriptError;
use swc_ecma_ast as ast;

#[derive(Debug, Clone)]
pub struct Program {
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone)]
pub enum Step {
    /// Evaluate `expr`; if `awaited`, suspend until the promise
    /// settles; bind the result to `dst` when present.
    Eval {
        dst: Option<String>,
        expr: Expr,
        awaited: bool,
    },
    /// Finish the run with `expr` (default `undefined`).
    Return {
        expr: Option<Expr>,
        awaited: bool,
    },
}

#[derive(Debug, Clone)]
pub enum Expr {
    Lit(Literal),
    Ident(String),
    Member {
        obj: Box<Expr>,
        prop: String,
    },
    /// `fetch(url, init?)`
    Fetch {
        url: Box<Expr>,
        init: Option<Box<FetchInit>>,
    },
    /// `console.log` / `console.error` / `console.warn`
    Console {
        args: Vec<Expr>,
    },
    /// Method call on a runtime value: `r.text()`, `r.json()`,
    /// `r.headers.get(name)`, ...
    MethodCall {
        obj: Box<Expr>,
        method: String,
        args: Vec<Expr>,
    },
    Template(Vec<TplPart>),
    Add(Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone)]
pub enum Literal {
    Str(String),
    Num(f64),
    Bool(bool),
    Null,
}

#[derive(Debug, Clone)]
pub enum TplPart {
    Text(String),
    Expr(Expr),
}

fn unsupported(what: &str) -> ScriptError {
    ScriptError::Unsupported(what.to_string())
}

pub fn tpl_text(el: &ast::TplElement) -> String {
    el.cooked
        .as_ref()
        .map(|c| c.to_string_lossy().to_string())
        .unwrap_or_else(|| el.raw.to_string())
}

/// Compile a function default export (async function or arrow).
pub fn compile_function(expr: &ast::Expr) -> Result<Program, ScriptError> {
    match expr {
        ast::Expr::Arrow(arrow) => match &*arrow.body {
            ast::BlockStmtOrExpr::BlockStmt(block) => compile_block(&block.stmts),
            ast::BlockStmtOrExpr::Expr(e) => {
                // `async () => fetch(url)`, a single implicit return.
                let (expr, awaited) = strip_await(e)?;
                Ok(Program {
                    steps: vec![Step::Return {
                        expr: Some(expr),
                        awaited,
                    }],
                })
            }
        },
        ast::Expr::Fn(f) => match &f.function.body {
            Some(block) => compile_block(&block.stmts),
            None => Ok(Program { steps: Vec::new() }),
        },
        _ => Err(unsupported("default export function shape")),
    }
}

/// Compile a module's top-level statements (CLI mode). Export items
/// have already been peeled off by the module front-end.
pub fn compile_top_level(stmts: &[ast::Stmt]) -> Result<Program, ScriptError> {
    compile_block(stmts)
}

fn compile_block(stmts: &[ast::Stmt]) -> Result<Program, ScriptError> {
    let mut steps = Vec::with_capacity(stmts.len());
    for stmt in stmts {
        compile_stmt(stmt, &mut steps)?;
    }
    Ok(Program { steps })
}

fn compile_stmt(stmt: &ast::Stmt, steps: &mut Vec<Step>) -> Result<(), ScriptError> {
    match stmt {
        ast::Stmt::Decl(ast::Decl::Var(var)) => {
            for decl in &var.decls {
                let ast::Pat::Ident(name) = &decl.name else {
                    return Err(unsupported("destructuring declaration"));
                };
                let Some(init) = &decl.init else {
                    steps.push(Step::Eval {
                        dst: Some(name.id.sym.to_string()),
                        expr: Expr::Lit(Literal::Null),
                        awaited: false,
                    });
                    continue;
                };
                let (expr, awaited) = strip_await(init)?;
                steps.push(Step::Eval {
                    dst: Some(name.id.sym.to_string()),
                    expr,
                    awaited,
                });
            }
            Ok(())
        }
        ast::Stmt::Expr(es) => {
            let (expr, awaited) = strip_await(&es.expr)?;
            steps.push(Step::Eval {
                dst: None,
                expr,
                awaited,
            });
            Ok(())
        }
        ast::Stmt::Return(ret) => {
            let (expr, awaited) = match &ret.arg {
                Some(arg) => {
                    let (e, a) = strip_await(arg)?;
                    (Some(e), a)
                }
                None => (None, false),
            };
            steps.push(Step::Return { expr, awaited });
            Ok(())
        }
        ast::Stmt::Empty(_) => Ok(()),
        _ => Err(unsupported("statement kind (only const/let, expression statements and return are recognized)")),
    }
}

/// Peel a top-level `await`; nested awaits are not expressible as a
/// single suspension point and are rejected.
fn strip_await(expr: &ast::Expr) -> Result<(Expr, bool), ScriptError> {
    match expr {
        ast::Expr::Await(aw) => Ok((compile_expr(&aw.arg)?, true)),
        ast::Expr::Paren(p) => strip_await(&p.expr),
        other => Ok((compile_expr(other)?, false)),
    }
}

fn compile_expr(expr: &ast::Expr) -> Result<Expr, ScriptError> {
    match expr {
        ast::Expr::Lit(lit) => Ok(Expr::Lit(compile_lit(lit)?)),
        ast::Expr::Ident(id) => Ok(Expr::Ident(id.sym.to_string())),
        ast::Expr::Paren(p) => compile_expr(&p.expr),
        ast::Expr::Tpl(tpl) => {
            let mut parts = Vec::new();
            let mut exprs = tpl.exprs.iter();
            for (i, quasi) in tpl.quasis.iter().enumerate() {
                let text = tpl_text(quasi);
                if !text.is_empty() {
                    parts.push(TplPart::Text(text));
                }
                if i < tpl.quasis.len() - 1 {
                    if let Some(e) = exprs.next() {
                        parts.push(TplPart::Expr(compile_expr(e)?));
                    }
                }
            }
            Ok(Expr::Template(parts))
        }
        ast::Expr::Bin(bin) if bin.op == ast::BinaryOp::Add => Ok(Expr::Add(
            Box::new(compile_expr(&bin.left)?),
            Box::new(compile_expr(&bin.right)?),
        )),
        ast::Expr::Member(member) => {
            let ast::MemberProp::Ident(prop) = &member.prop else {
                return Err(unsupported("computed member access"));
            };
            Ok(Expr::Member {
                obj: Box::new(compile_expr(&member.obj)?),
                prop: prop.sym.to_string(),
            })
        }
        ast::Expr::Await(_) => Err(unsupported("nested await (await only at statement level)")),
        ast::Expr::Call(call) => compile_call(call),
        _ => Err(unsupported("expression kind")),
    }
}

fn compile_call(call: &ast::CallExpr) -> Result<Expr, ScriptError> {
    let ast::Callee::Expr(callee) = &call.callee else {
        return Err(unsupported("call target"));
    };

    let args: Vec<&ast::Expr> = call.args.iter().map(|a| a.expr.as_ref()).collect();
    if call.args.iter().any(|a| a.spread.is_some()) {
        return Err(unsupported("spread argument"));
    }

    match callee.as_ref() {
        ast::Expr::Ident(id) if &*id.sym == "fetch" => {
            if args.is_empty() {
                return Err(unsupported("fetch() without a url"));
            }
            let url = Box::new(compile_expr(args[0])?);
            let init = match args.get(1) {
                Some(ast::Expr::Object(obj)) => Some(Box::new(compile_fetch_init(obj)?)),
                Some(_) => return Err(unsupported("fetch init (must be an object literal)")),
                None => None,
            };
            Ok(Expr::Fetch { url, init })
        }
        ast::Expr::Member(member) => {
            if let (ast::Expr::Ident(obj), ast::MemberProp::Ident(prop)) =
                (member.obj.as_ref(), &member.prop)
            {
                if &*obj.sym == "console" && matches!(&*prop.sym, "log" | "error" | "warn") {
                    let args = args
                        .iter()
                        .map(|a| compile_expr(a))
                        .collect::<Result<Vec<_>, _>>()?;
                    return Ok(Expr::Console { args });
                }
            }
            let ast::MemberProp::Ident(prop) = &member.prop else {
                return Err(unsupported("computed method call"));
            };
            Ok(Expr::MethodCall {
                obj: Box::new(compile_expr(&member.obj)?),
                method: prop.sym.to_string(),
                args: args
                    .iter()
                    .map(|a| compile_expr(a))
                    .collect::<Result<Vec<_>, _>>()?,
            })
        }
        _ => Err(unsupported("call target")),
    }
}

/// `fetch` init objects are destructured at compile time; field values
/// stay as expressions so they can reference earlier bindings.
#[derive(Debug, Clone, Default)]
pub struct FetchInit {
    pub method: Option<Expr>,
    pub headers: Vec<(String, Expr)>,
    pub body: Option<Expr>,
}

fn prop_name(key: &ast::PropName) -> Result<String, ScriptError> {
    match key {
        ast::PropName::Ident(id) => Ok(id.sym.to_string()),
        ast::PropName::Str(s) => Ok(s.value.to_string_lossy().to_string()),
        _ => Err(unsupported("property key kind")),
    }
}

fn compile_fetch_init(obj: &ast::ObjectLit) -> Result<FetchInit, ScriptError> {
    let mut init = FetchInit::default();
    for prop in &obj.props {
        let ast::PropOrSpread::Prop(prop) = prop else {
            return Err(unsupported("spread in fetch init"));
        };
        let ast::Prop::KeyValue(kv) = prop.as_ref() else {
            return Err(unsupported("fetch init property shape"));
        };
        match prop_name(&kv.key)?.as_str() {
            "method" => init.method = Some(compile_expr(&kv.value)?),
            "body" => init.body = Some(compile_expr(&kv.value)?),
            "headers" => {
                let ast::Expr::Object(headers) = kv.value.as_ref() else {
                    return Err(unsupported("fetch headers (must be an object literal)"));
                };
                for hp in &headers.props {
                    let ast::PropOrSpread::Prop(hp) = hp else {
                        return Err(unsupported("spread in fetch headers"));
                    };
                    let ast::Prop::KeyValue(kv) = hp.as_ref() else {
                        return Err(unsupported("fetch header property shape"));
                    };
                    init.headers
                        .push((prop_name(&kv.key)?, compile_expr(&kv.value)?));
                }
            }
            other => {
                return Err(unsupported(&format!("fetch init key '{other}'")));
            }
        }
    }
    Ok(init)
}

fn compile_lit(lit: &ast::Lit) -> Result<Literal, ScriptError> {
    match lit {
        ast::Lit::Str(s) => Ok(Literal::Str(s.value.to_string_lossy().to_string())),
        ast::Lit::Num(n) => Ok(Literal::Num(n.value)),
        ast::Lit::Bool(b) => Ok(Literal::Bool(b.value)),
        ast::Lit::Null(_) => Ok(Literal::Null),
        _ => Err(unsupported("literal kind")),
    }
}
