use std::env;
use std::fs;
use std::process::ExitCode;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;
use volley::bench;
use volley::error::Error;
use volley::script::{DefaultExport, ScriptModule, driver, module};
use volley::url::Url;

fn usage(prog: &str) {
    eprintln!("Usage: {prog} <script.js>");
    eprintln!();
    eprintln!("  Benchmark mode: script has 'export default' (URL/object/array/function)");
    eprintln!("  CLI mode:       script has no default export (runs as plain script)");
    eprintln!();
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut args = env::args();
    let prog = args.next().unwrap_or_else(|| "volley".to_string());
    let Some(script_path) = args.next() else {
        usage(&prog);
        return ExitCode::FAILURE;
    };

    match run(&script_path) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(script_path: &str) -> Result<bool, Error> {
    let source = fs::read_to_string(script_path).map_err(|e| Error::ReadScript {
        path: script_path.to_string(),
        source: e,
    })?;

    let script = ScriptModule::parse(script_path, &source)?;
    let cfg = script.bench.apply();
    let target = match cfg.target.as_deref() {
        Some(t) => Some(Url::parse(t)?),
        None => None,
    };

    match &script.default_export {
        DefaultExport::None => {
            // CLI mode: run the script once, pending jobs drained.
            let program = Arc::new(script.compile_top_level()?);
            Ok(driver::run_cli(program, target)?)
        }
        DefaultExport::AsyncFn(program) => {
            let cfg = cfg.normalized();
            bench::run_script(Arc::new(program.clone()), &cfg)?;
            Ok(true)
        }
        export => {
            let descs: Vec<module::RequestDesc> = match export {
                DefaultExport::Url(url) => vec![module::RequestDesc {
                    url: url.clone(),
                    method: None,
                    headers: Vec::new(),
                    body: None,
                }],
                DefaultExport::Request(desc) => vec![desc.clone()],
                DefaultExport::List(descs) => descs.clone(),
                _ => unreachable!(),
            };
            let mode = export.mode();

            let specs = module::build_request_specs(&descs, target.as_ref())?;
            let requests: Vec<_> = specs
                .iter()
                .map(|spec| volley::request::serialize(spec, cfg.host.as_deref()))
                .collect();

            let cfg = cfg.normalized();
            bench::run_requests(requests, &cfg, mode)?;
            Ok(true)
        }
    }
}
