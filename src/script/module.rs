//! Script module front-end.
//!
//! Parses the user's script as an ES module and extracts the workload
//! (`export default`) and configuration (`export const bench`). The
//! extractor evaluates the literal subset statically: string/number/
//! boolean literals, template literals, `+` concatenation, object and
//! array literals, and references to top-level `const` bindings with
//! such initializers.

use crate::config::{BenchConfig, Mode, parse_duration};
use crate::error::Error;
use crate::request::RequestSpec;
use crate::script::program::{self, Program};
use crate::script::ScriptError;
use crate::url::Url;
use std::collections::HashMap;
use swc_common::{FileName, SourceMap, sync::Lrc};
use swc_ecma_ast as ast;
use swc_ecma_parser::{Parser, StringInput, Syntax, lexer::Lexer};

/// Statically folded constant.
#[derive(Debug, Clone)]
enum Folded {
    Str(String),
    Num(f64),
    Bool(bool),
    Null,
    Obj(Vec<(String, Folded)>),
    Arr(Vec<Folded>),
}

/// One workload entry as written in the script, all fields owned.
#[derive(Debug, Clone)]
pub struct RequestDesc {
    pub url: String,
    pub method: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

#[derive(Debug)]
pub enum DefaultExport {
    None,
    Url(String),
    Request(RequestDesc),
    List(Vec<RequestDesc>),
    AsyncFn(Program),
}

impl DefaultExport {
    pub fn mode(&self) -> Mode {
        match self {
            DefaultExport::None => Mode::Cli,
            DefaultExport::Url(_) => Mode::BenchString,
            DefaultExport::Request(_) => Mode::BenchObject,
            DefaultExport::List(_) => Mode::BenchArray,
            DefaultExport::AsyncFn(_) => Mode::BenchAsync,
        }
    }
}

/// Recognized keys of the `bench` export.
#[derive(Debug, Default)]
pub struct BenchOverrides {
    pub connections: Option<usize>,
    pub threads: Option<usize>,
    pub duration: Option<String>,
    pub target: Option<String>,
    pub host: Option<String>,
}

impl BenchOverrides {
    pub fn apply(&self) -> BenchConfig {
        let mut cfg = BenchConfig::default();
        if let Some(n) = self.connections {
            cfg.connections = n;
        }
        if let Some(n) = self.threads {
            cfg.threads = n;
        }
        if let Some(d) = &self.duration {
            cfg.duration = parse_duration(d);
        }
        cfg.target = self.target.clone();
        cfg.host = self.host.clone();
        cfg
    }
}

pub struct ScriptModule {
    pub default_export: DefaultExport,
    pub bench: BenchOverrides,
    /// Top-level statements, compiled lazily for CLI mode.
    top_level: Vec<ast::Stmt>,
}

impl ScriptModule {
    pub fn parse(filename: &str, source: &str) -> Result<ScriptModule, ScriptError> {
        let cm: Lrc<SourceMap> = Default::default();
        let fm = cm.new_source_file(
            FileName::Custom(filename.to_string()).into(),
            source.to_string(),
        );
        let lexer = Lexer::new(
            Syntax::Es(Default::default()),
            Default::default(),
            StringInput::from(&*fm),
            None,
        );
        let mut parser = Parser::new_from(lexer);
        let module = parser
            .parse_module()
            .map_err(|e| ScriptError::Parse(format!("{e:?}")))?;

        // First pass: collect const bindings (exported or not) so the
        // exports can reference them regardless of declaration order.
        let mut consts: HashMap<String, Folded> = HashMap::new();
        for item in &module.body {
            let var = match item {
                ast::ModuleItem::Stmt(ast::Stmt::Decl(ast::Decl::Var(var))) => var,
                ast::ModuleItem::ModuleDecl(ast::ModuleDecl::ExportDecl(export)) => {
                    match &export.decl {
                        ast::Decl::Var(var) => var,
                        _ => continue,
                    }
                }
                _ => continue,
            };
            if var.kind != ast::VarDeclKind::Const {
                continue;
            }
            for decl in &var.decls {
                if let (ast::Pat::Ident(name), Some(init)) = (&decl.name, &decl.init) {
                    if &*name.id.sym == "bench" {
                        continue;
                    }
                    if let Some(v) = fold(init, &consts) {
                        consts.insert(name.id.sym.to_string(), v);
                    }
                }
            }
        }

        // Second pass: peel off the exports, keep plain statements for
        // CLI mode.
        let mut default_expr: Option<Box<ast::Expr>> = None;
        let mut default_fn: Option<ast::FnExpr> = None;
        let mut bench_expr: Option<Box<ast::Expr>> = None;
        let mut top_level: Vec<ast::Stmt> = Vec::new();

        for item in module.body {
            match item {
                ast::ModuleItem::ModuleDecl(ast::ModuleDecl::ExportDefaultExpr(e)) => {
                    default_expr = Some(e.expr);
                }
                ast::ModuleItem::ModuleDecl(ast::ModuleDecl::ExportDefaultDecl(d)) => {
                    if let ast::DefaultDecl::Fn(f) = d.decl {
                        default_fn = Some(f);
                    }
                }
                ast::ModuleItem::ModuleDecl(ast::ModuleDecl::ExportDecl(export)) => {
                    if let ast::Decl::Var(var) = export.decl {
                        for decl in &var.decls {
                            let ast::Pat::Ident(name) = &decl.name else {
                                continue;
                            };
                            if &*name.id.sym == "bench" {
                                bench_expr = decl.init.clone();
                            }
                        }
                    }
                }
                ast::ModuleItem::ModuleDecl(_) => {
                    // Imports etc. have nothing to resolve against.
                }
                ast::ModuleItem::Stmt(stmt) => {
                    top_level.push(stmt);
                }
            }
        }

        let bench = match bench_expr {
            Some(expr) => extract_bench(&expr, &consts),
            None => BenchOverrides::default(),
        };

        let default_export = if let Some(f) = default_fn {
            let expr = ast::Expr::Fn(f);
            DefaultExport::AsyncFn(program::compile_function(&expr)?)
        } else if let Some(expr) = default_expr {
            extract_default(&expr, &consts)?
        } else {
            DefaultExport::None
        };

        Ok(ScriptModule {
            default_export,
            bench,
            top_level,
        })
    }

    /// Compile the module's top-level statements for CLI-mode
    /// execution.
    pub fn compile_top_level(&self) -> Result<Program, ScriptError> {
        program::compile_top_level(&self.top_level)
    }
}

fn extract_default(
    expr: &ast::Expr,
    consts: &HashMap<String, Folded>,
) -> Result<DefaultExport, ScriptError> {
    // Functions first: they never fold.
    match expr {
        ast::Expr::Arrow(_) | ast::Expr::Fn(_) => {
            return Ok(DefaultExport::AsyncFn(program::compile_function(expr)?));
        }
        ast::Expr::Ident(id) if !consts.contains_key(&*id.sym) => {
            return Err(ScriptError::Unsupported(format!(
                "default export references unknown binding '{}'",
                id.sym
            )));
        }
        _ => {}
    }

    let Some(folded) = fold(expr, consts) else {
        return Err(ScriptError::Unsupported(
            "default export must be a string, object, array or function".to_string(),
        ));
    };

    match folded {
        Folded::Str(url) => Ok(DefaultExport::Url(url)),
        Folded::Obj(fields) => Ok(DefaultExport::Request(desc_from_fields(fields)?)),
        Folded::Arr(items) => {
            let mut descs = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Folded::Str(url) => descs.push(RequestDesc {
                        url,
                        method: None,
                        headers: Vec::new(),
                        body: None,
                    }),
                    Folded::Obj(fields) => descs.push(desc_from_fields(fields)?),
                    _ => {
                        return Err(ScriptError::Unsupported(
                            "workload array entries must be strings or request objects"
                                .to_string(),
                        ));
                    }
                }
            }
            Ok(DefaultExport::List(descs))
        }
        _ => Err(ScriptError::Unsupported(
            "default export must be a string, object, array or function".to_string(),
        )),
    }
}

fn desc_from_fields(fields: Vec<(String, Folded)>) -> Result<RequestDesc, ScriptError> {
    let mut desc = RequestDesc {
        url: String::new(),
        method: None,
        headers: Vec::new(),
        body: None,
    };
    let mut have_url = false;
    for (key, value) in fields {
        match (key.as_str(), value) {
            ("url", Folded::Str(s)) => {
                desc.url = s;
                have_url = true;
            }
            ("method", Folded::Str(s)) => desc.method = Some(s),
            ("body", Folded::Str(s)) => desc.body = Some(s),
            ("headers", Folded::Obj(hs)) => {
                for (name, v) in hs {
                    if let Folded::Str(s) = v {
                        desc.headers.push((name, s));
                    }
                }
            }
            _ => {}
        }
    }
    if !have_url {
        return Err(ScriptError::MissingUrl);
    }
    Ok(desc)
}

fn extract_bench(expr: &ast::Expr, consts: &HashMap<String, Folded>) -> BenchOverrides {
    let mut overrides = BenchOverrides::default();
    let Some(Folded::Obj(fields)) = fold(expr, consts) else {
        return overrides;
    };
    for (key, value) in fields {
        match (key.as_str(), value) {
            ("connections", Folded::Num(n)) if n > 0.0 => {
                overrides.connections = Some(n as usize);
            }
            ("threads", Folded::Num(n)) if n > 0.0 => overrides.threads = Some(n as usize),
            ("duration", Folded::Str(s)) => overrides.duration = Some(s),
            ("target", Folded::Str(s)) => overrides.target = Some(s),
            ("host", Folded::Str(s)) => overrides.host = Some(s),
            _ => {}
        }
    }
    overrides
}

fn prop_name(key: &ast::PropName) -> Option<String> {
    match key {
        ast::PropName::Ident(id) => Some(id.sym.to_string()),
        ast::PropName::Str(s) => Some(s.value.to_string_lossy().to_string()),
        _ => None,
    }
}

fn fold(expr: &ast::Expr, consts: &HashMap<String, Folded>) -> Option<Folded> {
    match expr {
        ast::Expr::Lit(ast::Lit::Str(s)) => Some(Folded::Str(s.value.to_string_lossy().to_string())),
        ast::Expr::Lit(ast::Lit::Num(n)) => Some(Folded::Num(n.value)),
        ast::Expr::Lit(ast::Lit::Bool(b)) => Some(Folded::Bool(b.value)),
        ast::Expr::Lit(ast::Lit::Null(_)) => Some(Folded::Null),
        ast::Expr::Paren(p) => fold(&p.expr, consts),
        ast::Expr::Ident(id) => consts.get(&*id.sym).cloned(),
        ast::Expr::Unary(u) if u.op == ast::UnaryOp::Minus => match fold(&u.arg, consts)? {
            Folded::Num(n) => Some(Folded::Num(-n)),
            _ => None,
        },
        ast::Expr::Tpl(tpl) => {
            let mut out = String::new();
            let mut exprs = tpl.exprs.iter();
            for (i, quasi) in tpl.quasis.iter().enumerate() {
                out.push_str(&program::tpl_text(quasi));
                if i < tpl.quasis.len() - 1 {
                    match fold(exprs.next()?, consts)? {
                        Folded::Str(s) => out.push_str(&s),
                        Folded::Num(n) => out.push_str(&crate::script::value::Value::Num(n).to_string()),
                        _ => return None,
                    }
                }
            }
            Some(Folded::Str(out))
        }
        ast::Expr::Bin(bin) if bin.op == ast::BinaryOp::Add => {
            match (fold(&bin.left, consts)?, fold(&bin.right, consts)?) {
                (Folded::Str(a), Folded::Str(b)) => Some(Folded::Str(a + b.as_str())),
                (Folded::Num(a), Folded::Num(b)) => Some(Folded::Num(a + b)),
                (Folded::Str(a), Folded::Num(b)) => {
                    Some(Folded::Str(a + crate::script::value::Value::Num(b).to_string().as_str()))
                }
                _ => None,
            }
        }
        ast::Expr::Object(obj) => {
            let mut fields = Vec::with_capacity(obj.props.len());
            for prop in &obj.props {
                let ast::PropOrSpread::Prop(prop) = prop else {
                    return None;
                };
                let ast::Prop::KeyValue(kv) = prop.as_ref() else {
                    return None;
                };
                fields.push((prop_name(&kv.key)?, fold(&kv.value, consts)?));
            }
            Some(Folded::Obj(fields))
        }
        ast::Expr::Array(arr) => {
            let mut items = Vec::with_capacity(arr.elems.len());
            for elem in arr.elems.iter().flatten() {
                if elem.spread.is_some() {
                    return None;
                }
                items.push(fold(&elem.expr, consts)?);
            }
            Some(Folded::Arr(items))
        }
        _ => None,
    }
}

/// Build request specs from workload descriptors, applying the target
/// rules: path-only entries join against the target base; absolute
/// entries have scheme/host/port rewritten when a target is set.
pub fn build_request_specs(
    descs: &[RequestDesc],
    target: Option<&Url>,
) -> Result<Vec<RequestSpec>, Error> {
    let mut specs = Vec::with_capacity(descs.len());
    for desc in descs {
        let url = if desc.url.starts_with('/') {
            match target {
                Some(base) => base.with_path(&desc.url),
                None => return Err(Error::InvalidUrl(desc.url.clone())),
            }
        } else {
            let parsed = Url::parse(&desc.url)?;
            match target {
                Some(base) => parsed.rebased_on(base),
                None => parsed,
            }
        };
        specs.push(RequestSpec {
            url,
            method: desc.method.clone().unwrap_or_else(|| "GET".to_string()),
            headers: desc.headers.clone(),
            body: desc.body.clone().map(String::into_bytes).unwrap_or_default(),
        });
    }
    Ok(specs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str) -> ScriptModule {
        ScriptModule::parse("test.js", source).expect("module parse failed")
    }

    #[test]
    fn string_export() {
        let m = parse("export default \"http://example.com/x\";");
        assert_eq!(m.default_export.mode(), Mode::BenchString);
        let DefaultExport::Url(url) = &m.default_export else {
            panic!();
        };
        assert_eq!(url, "http://example.com/x");
    }

    #[test]
    fn object_export_with_headers_and_body() {
        let m = parse(
            r#"export default {
                url: "http://h/echo",
                method: "POST",
                headers: { "X-T": "1" },
                body: "{\"k\":\"v\"}"
            };"#,
        );
        let DefaultExport::Request(desc) = &m.default_export else {
            panic!();
        };
        assert_eq!(desc.method.as_deref(), Some("POST"));
        assert_eq!(desc.headers, vec![("X-T".to_string(), "1".to_string())]);
        assert_eq!(desc.body.as_deref(), Some("{\"k\":\"v\"}"));
    }

    #[test]
    fn array_export_mixes_strings_and_objects() {
        let m = parse(
            r#"export default ["http://h/a", { url: "http://h/b", method: "HEAD" }];"#,
        );
        let DefaultExport::List(descs) = &m.default_export else {
            panic!();
        };
        assert_eq!(descs.len(), 2);
        assert_eq!(descs[0].url, "http://h/a");
        assert_eq!(descs[1].method.as_deref(), Some("HEAD"));
        assert_eq!(m.default_export.mode(), Mode::BenchArray);
    }

    #[test]
    fn async_function_export() {
        let m = parse(
            "export default async function() { const r = await fetch(\"http://h/\"); return r.status; }",
        );
        assert_eq!(m.default_export.mode(), Mode::BenchAsync);
    }

    #[test]
    fn async_arrow_export() {
        let m = parse("export default async () => { await fetch(\"http://h/\"); };");
        assert_eq!(m.default_export.mode(), Mode::BenchAsync);
    }

    #[test]
    fn missing_default_is_cli() {
        let m = parse("console.log(\"hi\");");
        assert_eq!(m.default_export.mode(), Mode::Cli);
        assert!(m.compile_top_level().is_ok());
    }

    #[test]
    fn bench_overrides_extracted() {
        let m = parse(
            r#"export default "/health";
               export const bench = {
                   connections: 8,
                   threads: 2,
                   duration: "5s",
                   target: "http://127.0.0.1:9000",
                   host: "override.example"
               };"#,
        );
        assert_eq!(m.bench.connections, Some(8));
        assert_eq!(m.bench.threads, Some(2));
        assert_eq!(m.bench.duration.as_deref(), Some("5s"));
        assert_eq!(m.bench.target.as_deref(), Some("http://127.0.0.1:9000"));
        assert_eq!(m.bench.host.as_deref(), Some("override.example"));
        let cfg = m.bench.apply();
        assert_eq!(cfg.connections, 8);
        assert_eq!(cfg.duration, std::time::Duration::from_secs(5));
    }

    #[test]
    fn const_references_fold() {
        let m = parse(
            r#"const base = "http://h";
               const path = "/x";
               export default base + path;"#,
        );
        let DefaultExport::Url(url) = &m.default_export else {
            panic!();
        };
        assert_eq!(url, "http://h/x");
    }

    #[test]
    fn template_folding() {
        let m = parse(
            r#"const host = "h";
               const port = 8080;
               export default `http://${host}:${port}/x`;"#,
        );
        let DefaultExport::Url(url) = &m.default_export else {
            panic!();
        };
        assert_eq!(url, "http://h:8080/x");
    }

    #[test]
    fn descriptor_without_url_is_error() {
        let err = ScriptModule::parse("t.js", "export default { method: \"GET\" };");
        assert!(matches!(err, Err(ScriptError::MissingUrl)));
    }

    #[test]
    fn path_entries_require_target() {
        let descs = vec![RequestDesc {
            url: "/health".to_string(),
            method: None,
            headers: Vec::new(),
            body: None,
        }];
        assert!(build_request_specs(&descs, None).is_err());

        let base = Url::parse("http://127.0.0.1:9000").unwrap();
        let specs = build_request_specs(&descs, Some(&base)).unwrap();
        assert_eq!(specs[0].url.host, "127.0.0.1");
        assert_eq!(specs[0].url.port, 9000);
        assert_eq!(specs[0].url.path, "/health");
    }

    #[test]
    fn absolute_entries_rebased_on_target() {
        let descs = vec![RequestDesc {
            url: "http://elsewhere.example:1234/a".to_string(),
            method: None,
            headers: Vec::new(),
            body: None,
        }];
        let base = Url::parse("http://127.0.0.1:9000").unwrap();
        let specs = build_request_specs(&descs, Some(&base)).unwrap();
        assert_eq!(specs[0].url.host, "127.0.0.1");
        assert_eq!(specs[0].url.port, 9000);
        assert_eq!(specs[0].url.path, "/a");
    }
}
