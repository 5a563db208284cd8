//! Tenant edge scripts
//!
//! Scripts are Rhai programs run in a fresh engine per invocation. The only
//! capabilities exposed are:
//!
//! - `request`: read-only map with `method`, `url`, `headers`, `ip`
//! - `response`: read-only map with `status`, `headers` (response phase only)
//! - `set_response_header(name, value)`
//! - `redirect(url)` / `redirect(url, code)`, which return `"STOP"`
//! - `log(message)` and `print`/`debug`, routed to tracing
//!
//! Returning `"STOP"` or assigning `STOP = true` ends request processing.
//! Execution is cut off at a wall-clock deadline. Any failure is logged and the
//! request continues as if the tenant had no script.

use dashmap::DashMap;
use parking_lot::Mutex;
use rhai::{Dynamic, Engine, Map, Scope, AST};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

use crate::domain::EdgeRule;
use crate::waf::RequestInfo;

pub const DEFAULT_SCRIPT_TIMEOUT: Duration = Duration::from_millis(100);

const STOP: &str = "STOP";

/// Response as seen by a response-phase script
#[derive(Debug, Clone, Default)]
pub struct ResponseView {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

/// What a script asked for
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptOutcome {
    pub stop: bool,
    pub redirect: Option<(String, u16)>,
    pub response_headers: Vec<(String, String)>,
}

impl ScriptOutcome {
    fn proceed() -> Self {
        Self::default()
    }
}

#[derive(Default)]
struct Effects {
    redirect: Option<(String, u16)>,
    headers: Vec<(String, String)>,
}

pub struct EdgeEngine {
    timeout: Duration,
    compiled: DashMap<String, Arc<AST>>,
}

impl EdgeEngine {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            compiled: DashMap::new(),
        }
    }

    /// Run `rule` against the request. Never fails.
    pub async fn execute(
        &self,
        hostname: &str,
        rule: &EdgeRule,
        request: &RequestInfo,
        response: Option<ResponseView>,
    ) -> ScriptOutcome {
        if rule.script.trim().is_empty() {
            return ScriptOutcome::proceed();
        }

        let cached = self.compiled.get(&rule.script).map(|ast| ast.clone());
        let script = rule.script.clone();
        let rule_id = rule.id.clone();
        let host = hostname.to_string();
        let request = request.clone();
        let timeout = self.timeout;

        let started = Instant::now();
        let joined = tokio::task::spawn_blocking(move || {
            run_script(&host, &rule_id, &script, cached, &request, response, timeout)
        })
        .await;

        match joined {
            Ok(Ok((outcome, ast))) => {
                if let Some(ast) = ast {
                    self.compiled.insert(rule.script.clone(), ast);
                }
                debug!(
                    hostname = %hostname,
                    rule_id = %rule.id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    stop = outcome.stop,
                    "Edge rule executed"
                );
                outcome
            }
            Ok(Err(message)) => {
                error!(hostname = %hostname, rule_id = %rule.id, error = %message, "Edge Rule Execution Failed");
                ScriptOutcome::proceed()
            }
            Err(e) => {
                error!(hostname = %hostname, rule_id = %rule.id, error = %e, "Edge rule task failed");
                ScriptOutcome::proceed()
            }
        }
    }
}

impl Default for EdgeEngine {
    fn default() -> Self {
        Self::new(DEFAULT_SCRIPT_TIMEOUT)
    }
}

/// Newly compiled ASTs are handed back so the caller can cache them
fn run_script(
    hostname: &str,
    rule_id: &str,
    script: &str,
    cached: Option<Arc<AST>>,
    request: &RequestInfo,
    response: Option<ResponseView>,
    timeout: Duration,
) -> Result<(ScriptOutcome, Option<Arc<AST>>), String> {
    let effects = Arc::new(Mutex::new(Effects::default()));
    let engine = sandboxed_engine(hostname, rule_id, effects.clone(), timeout);

    let (ast, fresh) = match cached {
        Some(ast) => (ast, None),
        None => {
            let ast = Arc::new(engine.compile(script).map_err(|e| e.to_string())?);
            (ast.clone(), Some(ast))
        }
    };

    let mut scope = Scope::new();
    scope.push_constant("request", request_map(request));
    if let Some(response) = response {
        scope.push_constant("response", response_map(&response));
    }
    scope.push("STOP", false);

    let result = engine
        .eval_ast_with_scope::<Dynamic>(&mut scope, &ast)
        .map_err(|e| e.to_string())?;

    let returned_stop = result
        .into_string()
        .map(|s| s == STOP)
        .unwrap_or(false);
    let flagged_stop = scope.get_value::<bool>("STOP").unwrap_or(false);

    let effects = std::mem::take(&mut *effects.lock());
    Ok((
        ScriptOutcome {
            stop: returned_stop || flagged_stop,
            redirect: effects.redirect,
            response_headers: effects.headers,
        },
        fresh,
    ))
}

fn sandboxed_engine(
    hostname: &str,
    rule_id: &str,
    effects: Arc<Mutex<Effects>>,
    timeout: Duration,
) -> Engine {
    let mut engine = Engine::new();

    engine.set_max_expr_depths(64, 32);
    engine.set_max_call_levels(32);
    engine.set_max_string_size(64 * 1024);
    engine.set_max_array_size(10_000);
    engine.set_max_map_size(10_000);
    engine.disable_symbol("eval");

    let deadline = Instant::now() + timeout;
    engine.on_progress(move |_| {
        if Instant::now() >= deadline {
            Some(Dynamic::from("edge script timed out"))
        } else {
            None
        }
    });

    let host = hostname.to_string();
    let rule = rule_id.to_string();
    engine.on_print(move |text| {
        info!(hostname = %host, rule_id = %rule, "Edge script log: {}", text);
    });
    let host = hostname.to_string();
    let rule = rule_id.to_string();
    engine.on_debug(move |text, _source, _pos| {
        debug!(hostname = %host, rule_id = %rule, "Edge script debug: {}", text);
    });

    let host = hostname.to_string();
    let rule = rule_id.to_string();
    engine.register_fn("log", move |message: &str| {
        info!(hostname = %host, rule_id = %rule, "Edge script log: {}", message);
    });

    let sink = effects.clone();
    engine.register_fn("set_response_header", move |name: &str, value: &str| {
        sink.lock().headers.push((name.to_string(), value.to_string()));
    });

    let sink = effects.clone();
    engine.register_fn("redirect", move |url: &str| -> String {
        sink.lock().redirect = Some((url.to_string(), 302));
        STOP.to_string()
    });

    let sink = effects;
    engine.register_fn("redirect", move |url: &str, code: i64| -> String {
        let code = if (300..400).contains(&code) { code as u16 } else { 302 };
        sink.lock().redirect = Some((url.to_string(), code));
        STOP.to_string()
    });

    engine
}

fn headers_map(headers: &[(String, String)]) -> Map {
    let mut map = Map::new();
    for (name, value) in headers {
        map.insert(name.to_lowercase().into(), Dynamic::from(value.clone()));
    }
    map
}

fn request_map(request: &RequestInfo) -> Map {
    let mut map = Map::new();
    map.insert("method".into(), Dynamic::from(request.method.clone()));
    map.insert("url".into(), Dynamic::from(request.target.clone()));
    map.insert("headers".into(), Dynamic::from(headers_map(&request.headers)));
    map.insert("ip".into(), Dynamic::from(request.client_ip.to_string()));
    map
}

fn response_map(response: &ResponseView) -> Map {
    let mut map = Map::new();
    map.insert("status".into(), Dynamic::from(response.status as i64));
    map.insert("headers".into(), Dynamic::from(headers_map(&response.headers)));
    map
}
