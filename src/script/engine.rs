//! The fetch loop: per-worker runtime that re-enters compiled script
//! programs and services their pending fetches on one reactor.
//!
//! Three tables drive everything, all slab-keyed so handles stay
//! stable: runs (suspended program invocations), promises, and pending
//! fetches (reactor token = slab key). A FIFO job queue carries run
//! resumptions; the loop alternates between draining jobs and polling
//! the reactor, and returns once the queue is empty and nothing is in
//! flight. Every in-flight fetch is settled before that point, by
//! completion, error, or its 30 s timeout.

use crate::client::{ConnState, TlsConfig};
use crate::reactor::{Event, Interest, Poller, Timers};
use crate::script::ScriptError;
use crate::script::fetch::{self, FETCH_TIMEOUT_MS, FetchArgs, PendingFetch};
use crate::script::program::{Expr, FetchInit, Literal, Program, Step, TplPart};
use crate::script::value::{PromiseId, ResponseValue, Value, from_json};
use crate::url::Url;
use slab::Slab;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

enum Job {
    Resume(usize),
}

enum LoopTimer {
    FetchTimeout { token: usize, promise: PromiseId },
}

pub enum Promise {
    Pending { waiters: Vec<usize> },
    Fulfilled(Value),
    Rejected { reason: Value, handled: bool },
}

/// Result of one `run` to quiescence.
pub struct RunOutcome {
    pub ok: bool,
    /// The root promise's fulfillment value (`Undefined` on failure).
    pub result: Value,
    /// Fetches rejected by their 30 s deadline during this run.
    pub timeouts: u64,
}

enum PromiseView {
    Pending,
    Fulfilled(Value),
    Rejected(Value),
}

enum Resume {
    Bind(Option<String>),
    Return,
}

struct ScriptRun {
    program: Arc<Program>,
    pc: usize,
    env: HashMap<String, Value>,
    waiting: Option<(PromiseId, Resume)>,
    root: PromiseId,
}

pub struct FetchLoop {
    poller: Poller,
    timers: Timers<LoopTimer>,
    pending: Slab<PendingFetch>,
    promises: Slab<Promise>,
    jobs: VecDeque<Job>,
    runs: Slab<Option<ScriptRun>>,
    epoch: Instant,
    base: Option<Url>,
    tls: Option<TlsConfig>,
    rejection_printed: bool,
    failed: bool,
    timeouts: u64,
}

impl FetchLoop {
    pub fn new(base: Option<Url>) -> io::Result<FetchLoop> {
        Ok(FetchLoop {
            poller: Poller::new()?,
            timers: Timers::new(),
            pending: Slab::new(),
            promises: Slab::new(),
            jobs: VecDeque::new(),
            runs: Slab::new(),
            epoch: Instant::now(),
            base,
            tls: None,
            rejection_printed: false,
            failed: false,
            timeouts: 0,
        })
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Invoke the callable: instantiate a run of `program` and return
    /// the root promise it will settle.
    pub fn call(&mut self, program: Arc<Program>) -> PromiseId {
        let root = self.promises.insert(Promise::Pending {
            waiters: Vec::new(),
        });
        let run_id = self.runs.insert(Some(ScriptRun {
            program,
            pc: 0,
            env: HashMap::new(),
            waiting: None,
            root,
        }));
        self.jobs.push_back(Job::Resume(run_id));
        root
    }

    /// Drive until quiescent: the job queue is empty and no fetches
    /// are pending. Reports whether the invocation rooted at `root`
    /// completed without a script exception or unhandled rejection,
    /// along with the value it settled to.
    pub fn run(&mut self, root: PromiseId) -> RunOutcome {
        self.failed = false;
        self.timeouts = 0;
        let mut events: Vec<Event> = Vec::with_capacity(64);

        loop {
            while let Some(Job::Resume(run_id)) = self.jobs.pop_front() {
                self.exec_run(run_id);
            }
            if self.pending.is_empty() {
                break;
            }

            let now = self.now_ms();
            let timeout = match self.timers.next_deadline() {
                None => 100,
                Some(deadline) => deadline.saturating_sub(now).min(100) as i32,
            };
            if self.poller.poll(&mut events, timeout).is_err() {
                break;
            }

            for i in 0..events.len() {
                let ev = events[i];
                let state = {
                    let Some(p) = self.pending.get_mut(ev.token) else {
                        continue;
                    };
                    if ev.error {
                        p.conn.fail();
                    } else {
                        if ev.writable {
                            p.conn.drive_write();
                        }
                        if ev.readable {
                            p.conn.drive_read();
                        }
                    }
                    p.conn.state()
                };
                match state {
                    ConnState::Done => self.complete_fetch(ev.token),
                    ConnState::Error => self.fail_fetch(ev.token, "Connection error"),
                    _ => {
                        let p = &self.pending[ev.token];
                        let _ = self
                            .poller
                            .modify(p.conn.raw_fd(), ev.token, p.conn.interest());
                    }
                }
            }

            let now = self.now_ms();
            for timer in self.timers.expire(now) {
                let LoopTimer::FetchTimeout { token, promise } = timer;
                // Guard against token reuse by a newer fetch.
                if self
                    .pending
                    .get(token)
                    .is_some_and(|p| p.promise == promise)
                {
                    self.timeouts += 1;
                    self.fail_fetch(token, "Request timeout");
                }
            }
        }

        // Anything rejected that nobody consumed: print the first
        // reason once, fail the iteration.
        let mut unhandled: Option<String> = None;
        for (_, promise) in self.promises.iter_mut() {
            if let Promise::Rejected { reason, handled } = promise {
                if !*handled {
                    *handled = true;
                    unhandled.get_or_insert_with(|| reason.to_string());
                }
            }
        }
        if let Some(reason) = unhandled {
            self.failed = true;
            if !self.rejection_printed {
                eprintln!("Error: {reason}");
                self.rejection_printed = true;
            }
        }

        let (ok, result) = match self.promises.get(root) {
            Some(Promise::Fulfilled(v)) => (!self.failed, v.clone()),
            _ => (false, Value::Undefined),
        };

        // Abandoned fetches only remain after a reactor failure; drop
        // them with their timers.
        let stale: Vec<usize> = self.pending.iter().map(|(k, _)| k).collect();
        for token in stale {
            let p = self.pending.remove(token);
            let _ = self.poller.delete(p.conn.raw_fd());
            self.timers.cancel(p.timer);
        }
        self.promises.clear();
        self.runs.clear();
        self.jobs.clear();

        RunOutcome {
            ok,
            result,
            timeouts: self.timeouts,
        }
    }

    fn promise_view(&self, pid: PromiseId) -> PromiseView {
        match self.promises.get(pid) {
            Some(Promise::Pending { .. }) | None => PromiseView::Pending,
            Some(Promise::Fulfilled(v)) => PromiseView::Fulfilled(v.clone()),
            Some(Promise::Rejected { reason, .. }) => PromiseView::Rejected(reason.clone()),
        }
    }

    fn add_waiter(&mut self, pid: PromiseId, run_id: usize) {
        if let Some(Promise::Pending { waiters }) = self.promises.get_mut(pid) {
            waiters.push(run_id);
        }
    }

    fn mark_handled(&mut self, pid: PromiseId) {
        if let Some(Promise::Rejected { handled, .. }) = self.promises.get_mut(pid) {
            *handled = true;
        }
    }

    fn settle(&mut self, pid: PromiseId, outcome: Result<Value, Value>) {
        let Some(promise) = self.promises.get_mut(pid) else {
            return;
        };
        let Promise::Pending { waiters } = promise else {
            return;
        };
        let waiters = std::mem::take(waiters);
        *promise = match outcome {
            Ok(v) => Promise::Fulfilled(v),
            Err(reason) => Promise::Rejected {
                reason,
                handled: false,
            },
        };
        for run_id in waiters {
            self.jobs.push_back(Job::Resume(run_id));
        }
    }

    fn resolved(&mut self, v: Value) -> Value {
        Value::Promise(self.promises.insert(Promise::Fulfilled(v)))
    }

    fn rejected(&mut self, reason: &str) -> Value {
        Value::Promise(self.promises.insert(Promise::Rejected {
            reason: Value::Str(Rc::from(reason)),
            handled: false,
        }))
    }

    /// A thrown script exception: printed immediately (so it appears
    /// exactly once) and the run's root promise rejects pre-handled.
    fn finish_with_exception(&mut self, root: PromiseId, err: &ScriptError) {
        eprintln!("Error: {err}");
        self.failed = true;
        if let Some(promise) = self.promises.get_mut(root) {
            if matches!(promise, Promise::Pending { .. }) {
                *promise = Promise::Rejected {
                    reason: Value::Str(Rc::from(err.to_string().as_str())),
                    handled: true,
                };
            }
        }
    }

    fn exec_run(&mut self, run_id: usize) {
        let Some(slot) = self.runs.get_mut(run_id) else {
            return;
        };
        let Some(mut run) = slot.take() else {
            return;
        };

        loop {
            if let Some((pid, resume)) = run.waiting.take() {
                match self.promise_view(pid) {
                    PromiseView::Pending => {
                        run.waiting = Some((pid, resume));
                        break;
                    }
                    PromiseView::Fulfilled(v) => match resume {
                        Resume::Bind(dst) => {
                            if let Some(name) = dst {
                                run.env.insert(name, v);
                            }
                            run.pc += 1;
                        }
                        Resume::Return => {
                            let root = run.root;
                            self.runs.remove(run_id);
                            self.settle(root, Ok(v));
                            return;
                        }
                    },
                    PromiseView::Rejected(reason) => {
                        self.mark_handled(pid);
                        let root = run.root;
                        self.runs.remove(run_id);
                        self.settle(root, Err(reason));
                        return;
                    }
                }
                continue;
            }

            if run.pc >= run.program.steps.len() {
                let root = run.root;
                self.runs.remove(run_id);
                self.settle(root, Ok(Value::Undefined));
                return;
            }

            let step = run.program.steps[run.pc].clone();
            match step {
                Step::Eval { dst, expr, awaited } => {
                    let value = match self.eval(&run.env, &expr) {
                        Ok(v) => v,
                        Err(e) => {
                            let root = run.root;
                            self.runs.remove(run_id);
                            self.finish_with_exception(root, &e);
                            return;
                        }
                    };
                    if awaited {
                        if let Value::Promise(pid) = value {
                            self.add_waiter(pid, run_id);
                            run.waiting = Some((pid, Resume::Bind(dst)));
                            continue;
                        }
                    }
                    if let Some(name) = dst {
                        run.env.insert(name, value);
                    }
                    run.pc += 1;
                }
                Step::Return { expr, awaited } => {
                    let value = match expr {
                        Some(e) => match self.eval(&run.env, &e) {
                            Ok(v) => v,
                            Err(err) => {
                                let root = run.root;
                                self.runs.remove(run_id);
                                self.finish_with_exception(root, &err);
                                return;
                            }
                        },
                        None => Value::Undefined,
                    };
                    if awaited {
                        if let Value::Promise(pid) = value {
                            self.add_waiter(pid, run_id);
                            run.waiting = Some((pid, Resume::Return));
                            continue;
                        }
                    }
                    let root = run.root;
                    self.runs.remove(run_id);
                    self.settle(root, Ok(value));
                    return;
                }
            }
        }

        // Suspended on a pending promise: park the run again.
        if let Some(slot) = self.runs.get_mut(run_id) {
            *slot = Some(run);
        }
    }

    fn eval(&mut self, env: &HashMap<String, Value>, expr: &Expr) -> Result<Value, ScriptError> {
        match expr {
            Expr::Lit(lit) => Ok(match lit {
                Literal::Str(s) => Value::Str(Rc::from(s.as_str())),
                Literal::Num(n) => Value::Num(*n),
                Literal::Bool(b) => Value::Bool(*b),
                Literal::Null => Value::Null,
            }),
            Expr::Ident(name) => env
                .get(name)
                .cloned()
                .ok_or_else(|| ScriptError::Runtime(format!("{name} is not defined"))),
            Expr::Member { obj, prop } => {
                let obj = self.eval(env, obj)?;
                member_of(&obj, prop)
            }
            Expr::Template(parts) => {
                let mut out = String::new();
                for part in parts {
                    match part {
                        TplPart::Text(t) => out.push_str(t),
                        TplPart::Expr(e) => out.push_str(&self.eval(env, e)?.to_string()),
                    }
                }
                Ok(Value::Str(Rc::from(out.as_str())))
            }
            Expr::Add(l, r) => {
                let l = self.eval(env, l)?;
                let r = self.eval(env, r)?;
                match (&l, &r) {
                    (Value::Num(a), Value::Num(b)) => Ok(Value::Num(a + b)),
                    (Value::Str(_), _) | (_, Value::Str(_)) => {
                        Ok(Value::Str(Rc::from(format!("{l}{r}").as_str())))
                    }
                    _ => Err(ScriptError::Runtime(
                        "unsupported operands for +".to_string(),
                    )),
                }
            }
            Expr::Console { args } => {
                let rendered = args
                    .iter()
                    .map(|a| self.eval(env, a).map(|v| v.to_string()))
                    .collect::<Result<Vec<_>, _>>()?;
                println!("{}", rendered.join(" "));
                Ok(Value::Undefined)
            }
            Expr::MethodCall { obj, method, args } => {
                let obj = self.eval(env, obj)?;
                let args = args
                    .iter()
                    .map(|a| self.eval(env, a))
                    .collect::<Result<Vec<_>, _>>()?;
                self.call_method(&obj, method, &args)
            }
            Expr::Fetch { url, init } => {
                let url = match self.eval(env, url)? {
                    Value::Str(s) => s.to_string(),
                    other => {
                        return Err(ScriptError::Runtime(format!(
                            "fetch url must be a string, got {other}"
                        )));
                    }
                };
                let args = self.eval_fetch_init(env, init.as_deref())?;
                self.start_fetch(&url, args)
            }
        }
    }

    fn eval_fetch_init(
        &mut self,
        env: &HashMap<String, Value>,
        init: Option<&FetchInit>,
    ) -> Result<FetchArgs, ScriptError> {
        let mut args = FetchArgs::default();
        let Some(init) = init else {
            return Ok(args);
        };
        if let Some(m) = &init.method {
            args.method = Some(self.eval(env, m)?.to_string());
        }
        if let Some(b) = &init.body {
            args.body = Some(self.eval(env, b)?.to_string());
        }
        for (name, value) in &init.headers {
            args.headers
                .push((name.clone(), self.eval(env, value)?.to_string()));
        }
        Ok(args)
    }

    fn start_fetch(&mut self, url: &str, args: FetchArgs) -> Result<Value, ScriptError> {
        let conn = fetch::open(url, args, self.base.as_ref(), &mut self.tls)?;
        let deadline = self.now_ms() + FETCH_TIMEOUT_MS;

        let entry = self.pending.vacant_entry();
        let token = entry.key();
        self.poller
            .add(conn.raw_fd(), token, Interest::ReadWrite)
            .map_err(|e| ScriptError::Runtime(format!("reactor register failed: {e}")))?;

        let promise = self.promises.insert(Promise::Pending {
            waiters: Vec::new(),
        });
        let timer = self
            .timers
            .add(deadline, LoopTimer::FetchTimeout { token, promise });

        entry.insert(PendingFetch {
            conn,
            promise,
            timer,
        });
        debug!(url, token, "fetch started");
        Ok(Value::Promise(promise))
    }

    fn call_method(
        &mut self,
        obj: &Value,
        method: &str,
        args: &[Value],
    ) -> Result<Value, ScriptError> {
        match (obj, method) {
            (Value::Response(r), "text") => {
                let text = r.body_text();
                Ok(self.resolved(Value::Str(Rc::from(text.as_str()))))
            }
            (Value::Response(r), "json") => match serde_json::from_slice(&r.body) {
                Ok(node) => {
                    let v = from_json(&node);
                    Ok(self.resolved(v))
                }
                Err(e) => Ok(self.rejected(&format!("invalid JSON body: {e}"))),
            },
            (Value::Headers(headers), "get") => {
                let name = args
                    .first()
                    .map(|v| v.to_string())
                    .unwrap_or_default();
                Ok(headers
                    .iter()
                    .find(|(n, _)| n.eq_ignore_ascii_case(&name))
                    .map(|(_, v)| Value::Str(Rc::from(v.as_str())))
                    .unwrap_or(Value::Null))
            }
            (Value::Headers(headers), "has") => {
                let name = args
                    .first()
                    .map(|v| v.to_string())
                    .unwrap_or_default();
                Ok(Value::Bool(
                    headers.iter().any(|(n, _)| n.eq_ignore_ascii_case(&name)),
                ))
            }
            _ => Err(ScriptError::Runtime(format!(
                "unsupported method '{method}' on {obj}"
            ))),
        }
    }

    fn complete_fetch(&mut self, token: usize) {
        let p = self.pending.remove(token);
        let _ = self.poller.delete(p.conn.raw_fd());
        self.timers.cancel(p.timer);

        let parser = p.conn.parser();
        let headers: Rc<Vec<(String, String)>> = Rc::new(
            parser
                .headers()
                .iter()
                .map(|h| (h.name.clone(), h.value.clone()))
                .collect(),
        );
        let response = ResponseValue {
            status: parser.status_code(),
            status_text: parser.status_text().to_string(),
            headers,
            body: Rc::from(parser.body()),
        };
        debug!(token, status = response.status, "fetch complete");
        self.settle(p.promise, Ok(Value::Response(Rc::new(response))));
    }

    fn fail_fetch(&mut self, token: usize, message: &str) {
        let p = self.pending.remove(token);
        let _ = self.poller.delete(p.conn.raw_fd());
        self.timers.cancel(p.timer);
        debug!(token, message, "fetch failed");
        self.settle(p.promise, Err(Value::Str(Rc::from(message))));
    }
}

fn member_of(obj: &Value, prop: &str) -> Result<Value, ScriptError> {
    match (obj, prop) {
        (Value::Response(r), "status") => Ok(Value::Num(r.status as f64)),
        (Value::Response(r), "statusText") => Ok(Value::Str(Rc::from(r.status_text.as_str()))),
        (Value::Response(r), "ok") => Ok(Value::Bool(r.ok())),
        (Value::Response(r), "headers") => Ok(Value::Headers(Rc::clone(&r.headers))),
        (Value::Str(s), "length") => Ok(Value::Num(s.len() as f64)),
        (Value::Json(j), prop) => match j.as_ref() {
            serde_json::Value::Object(map) => {
                Ok(map.get(prop).map(from_json).unwrap_or(Value::Undefined))
            }
            serde_json::Value::Array(items) if prop == "length" => {
                Ok(Value::Num(items.len() as f64))
            }
            _ => Ok(Value::Undefined),
        },
        _ => Err(ScriptError::Runtime(format!(
            "cannot read property '{prop}' of {obj}"
        ))),
    }
}
