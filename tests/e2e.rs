//! End-to-end scenarios against the bundled test server.

mod support;

use std::sync::Arc;
use std::time::Duration;
use support::TestServer;
use volley::bench;
use volley::config::Mode;
use volley::request;
use volley::script::{DefaultExport, FetchLoop, ScriptModule, driver, module};
use volley::script::value::Value;
use volley::url::Url;

/// Run the full request-path pipeline the way `main` does: parse the
/// script, build the specs, serialize, benchmark.
fn run_script_source(source: &str) -> bench::Summary {
    let script = ScriptModule::parse("bench.js", source).expect("script parse");
    let cfg = script.bench.apply();
    let target = cfg.target.as_deref().map(|t| Url::parse(t).unwrap());

    let (descs, mode) = match &script.default_export {
        DefaultExport::Url(url) => (
            vec![module::RequestDesc {
                url: url.clone(),
                method: None,
                headers: Vec::new(),
                body: None,
            }],
            Mode::BenchString,
        ),
        DefaultExport::Request(desc) => (vec![desc.clone()], Mode::BenchObject),
        DefaultExport::List(descs) => (descs.clone(), Mode::BenchArray),
        other => panic!("unexpected export: {:?}", other.mode()),
    };

    let specs = module::build_request_specs(&descs, target.as_ref()).expect("specs");
    let requests: Vec<_> = specs
        .iter()
        .map(|spec| request::serialize(spec, cfg.host.as_deref()))
        .collect();
    bench::run_requests(requests, &cfg.normalized(), mode).expect("bench run")
}

#[test]
fn health_benchmark_counts_only_2xx() {
    let server = TestServer::spawn();
    let source = format!(
        r#"export default "{}";
           export const bench = {{ connections: 4, threads: 2, duration: "1s" }};"#,
        server.url("/health")
    );
    let summary = run_script_source(&source);

    assert!(summary.stats.requests > 0, "no requests completed");
    assert_eq!(summary.stats.errors, 0);
    assert_eq!(summary.stats.status_2xx, summary.stats.requests);
    let h = &summary.stats.latency;
    assert!(h.min() <= h.mean() && h.mean() <= h.max());
}

#[test]
fn status_500_increments_only_5xx() {
    let server = TestServer::spawn();
    let source = format!(
        r#"export default "{}";
           export const bench = {{ connections: 1, threads: 1, duration: "300ms" }};"#,
        server.url("/status/500")
    );
    let summary = run_script_source(&source);

    assert!(summary.stats.requests > 0);
    assert_eq!(summary.stats.errors, 0);
    assert_eq!(summary.stats.status_5xx, summary.stats.requests);
    assert_eq!(summary.stats.status_2xx, 0);
    assert_eq!(summary.stats.status_3xx, 0);
    assert_eq!(summary.stats.status_4xx, 0);
}

#[test]
fn echo_post_with_body_and_header() {
    let server = TestServer::spawn();
    let source = format!(
        r#"export default {{
               url: "{}",
               method: "POST",
               headers: {{ "X-T": "1" }},
               body: "{{\"k\":\"v\"}}"
           }};
           export const bench = {{ connections: 1, threads: 1, duration: "300ms" }};"#,
        server.url("/echo")
    );
    let summary = run_script_source(&source);
    assert!(summary.stats.requests > 0);
    assert_eq!(summary.stats.status_2xx, summary.stats.requests);
    assert_eq!(summary.stats.errors, 0);
}

#[test]
fn array_workload_alternates_per_connection() {
    let server = TestServer::spawn();
    let source = format!(
        r#"export default ["/a", "/b"];
           export const bench = {{
               connections: 2,
               threads: 1,
               duration: "500ms",
               target: "{}"
           }};"#,
        server.base_url()
    );
    let summary = run_script_source(&source);
    assert!(summary.stats.requests > 2);
    assert_eq!(summary.stats.errors, 0);

    // Per connection the two paths must strictly alternate.
    let log = server.request_log();
    let conn_ids: std::collections::BTreeSet<u64> = log.iter().map(|(id, _)| *id).collect();
    assert_eq!(conn_ids.len(), 2, "expected two keep-alive connections");
    for id in conn_ids {
        let paths: Vec<&str> = log
            .iter()
            .filter(|(cid, _)| *cid == id)
            .map(|(_, p)| p.as_str())
            .collect();
        assert!(paths.len() > 1);
        for pair in paths.windows(2) {
            assert_ne!(pair[0], pair[1], "connection {id} repeated {}", pair[0]);
        }
    }
}

fn compile_async_default(source: &str) -> Arc<volley::script::Program> {
    let script = ScriptModule::parse("bench.js", source).expect("parse");
    match script.default_export {
        DefaultExport::AsyncFn(p) => Arc::new(p),
        _ => panic!("expected async function export"),
    }
}

#[test]
fn scripted_fetch_recovers_chunked_body() {
    let server = TestServer::spawn();
    let source = format!(
        r#"export default async function() {{
               const r = await fetch("{}");
               const t = await r.text();
               return t;
           }}"#,
        server.url("/chunked")
    );
    let program = compile_async_default(&source);
    let mut fetch_loop = FetchLoop::new(None).unwrap();
    let root = fetch_loop.call(program);
    let outcome = fetch_loop.run(root);
    assert!(outcome.ok);
    let Value::Str(body) = outcome.result else {
        panic!("expected string result");
    };
    assert_eq!(&*body, "Hello, chunked world!");
}

#[test]
fn scripted_fetch_echoes_body_and_parses_json() {
    let server = TestServer::spawn();
    let source = format!(
        r#"export default async function() {{
               const r = await fetch("{}", {{
                   method: "POST",
                   headers: {{ "X-T": "1" }},
                   body: "{{\"k\":\"v\"}}"
               }});
               const j = await r.json();
               return j.k;
           }}"#,
        server.url("/echo")
    );
    let program = compile_async_default(&source);
    let mut fetch_loop = FetchLoop::new(None).unwrap();
    let root = fetch_loop.call(program);
    let outcome = fetch_loop.run(root);
    assert!(outcome.ok);
    let Value::Str(k) = outcome.result else {
        panic!("expected string result");
    };
    assert_eq!(&*k, "v");
}

#[test]
fn scripted_response_surface() {
    let server = TestServer::spawn();
    let source = format!(
        r#"export default async function() {{
               const r = await fetch("{}");
               const ct = r.headers.get("content-type");
               return `${{r.status}} ${{r.statusText}} ${{r.ok}} ${{ct}}`;
           }}"#,
        server.url("/health")
    );
    let program = compile_async_default(&source);
    let mut fetch_loop = FetchLoop::new(None).unwrap();
    let root = fetch_loop.call(program);
    let outcome = fetch_loop.run(root);
    assert!(outcome.ok);
    let Value::Str(s) = outcome.result else {
        panic!("expected string result");
    };
    assert_eq!(&*s, "200 OK true text/plain");
}

#[test]
fn async_mode_benchmark_produces_requests() {
    let server = TestServer::spawn();
    let source = format!(
        r#"export default async function() {{
               const r = await fetch("{}");
               return r.status;
           }}
           export const bench = {{ threads: 1, connections: 1, duration: "1s" }};"#,
        server.url("/health")
    );
    let script = ScriptModule::parse("bench.js", &source).expect("parse");
    let DefaultExport::AsyncFn(program) = script.default_export else {
        panic!("expected async export");
    };
    let cfg = script.bench.apply().normalized();
    assert_eq!(cfg.duration, Duration::from_secs(1));

    let summary = bench::run_script(Arc::new(program), &cfg).expect("run");
    assert!(summary.stats.requests > 0);
    assert_eq!(summary.stats.errors, 0, "unexpected rejections");
    assert_eq!(summary.stats.status_2xx, summary.stats.requests);
}

#[test]
fn scripted_connection_failure_counts_errors() {
    // Grab a free port, then close it so connects are refused.
    let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = closed.local_addr().unwrap();
    drop(closed);

    let source = format!(
        r#"export default async function() {{
               const r = await fetch("http://{addr}/");
               return r.status;
           }}"#
    );
    let program = compile_async_default(&source);
    let stats = driver::run_bench_worker(0, program, None, Duration::from_millis(120));
    assert!(stats.requests > 0);
    assert_eq!(stats.errors, stats.requests);
    assert_eq!(stats.status_2xx, 0);
}

#[test]
fn cli_mode_runs_once_and_drains() {
    let server = TestServer::spawn();
    let source = format!(
        r#"const r = await fetch("{}");
           const t = await r.text();
           console.log("body:", t);"#,
        server.url("/health")
    );
    let script = ScriptModule::parse("cli.js", &source).expect("parse");
    assert!(matches!(script.default_export, DefaultExport::None));
    let program = Arc::new(script.compile_top_level().expect("compile"));
    let ok = driver::run_cli(program, None).expect("loop");
    assert!(ok);
    // Exactly one request reached the server.
    assert_eq!(server.request_log().len(), 1);
}

#[test]
fn host_override_reaches_the_wire() {
    let server = TestServer::spawn();
    // The server answers the generic route with the path; we only care
    // that the run succeeds while the Host header is overridden.
    let source = format!(
        r#"export default "{}";
           export const bench = {{
               connections: 1,
               threads: 1,
               duration: "200ms",
               host: "override.example"
           }};"#,
        server.url("/whatever")
    );
    let summary = run_script_source(&source);
    assert!(summary.stats.requests > 0);
    assert_eq!(summary.stats.errors, 0);
}
