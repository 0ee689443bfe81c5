//! Script handler: user scripts in a resource-capped rhai sandbox.
//!
//! Limits come from the node's sandbox override or the engine default:
//! operation count, call depth, string/array sizes, and a wall-clock
//! budget enforced both inside the interpreter (progress hook) and
//! outside (task timeout). Memory pressure is bounded through the value
//! size caps. Imports resolve only against the built-in module set,
//! filtered by the allow/block lists.

use crate::context::EngineContext;
use crate::error::EngineError;
use crate::handler::{HandlerCore, HandlerResult, NodeHandler};
use async_trait::async_trait;
use escapement_flow::{NodeInstance, NodeKind, ProcessInstance, SandboxConfig, Variables};
use rhai::module_resolvers::StaticModuleResolver;
use rhai::serde::{from_dynamic, to_dynamic};
use rhai::{Dynamic, Engine as RhaiEngine, Module, Scope};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Runs user scripts and merges named outputs into process variables.
pub struct ScriptHandler {
    core: HandlerCore,
}

impl ScriptHandler {
    #[must_use]
    pub fn new() -> Self {
        Self {
            core: HandlerCore::new("script"),
        }
    }
}

impl Default for ScriptHandler {
    fn default() -> Self {
        Self::new()
    }
}

fn builtin_modules() -> Vec<(&'static str, Module)> {
    let mut math = Module::new();
    math.set_native_fn("clamp", |value: f64, lo: f64, hi: f64| {
        Ok(value.clamp(lo, hi))
    });
    math.set_native_fn("round_to", |value: f64, digits: i64| {
        let factor = 10f64.powi(digits as i32);
        Ok((value * factor).round() / factor)
    });

    let mut date = Module::new();
    date.set_native_fn("now_millis", || Ok(chrono::Utc::now().timestamp_millis()));
    date.set_native_fn("today", || {
        Ok(chrono::Utc::now().format("%Y-%m-%d").to_string())
    });

    let mut string = Module::new();
    string.set_native_fn("upper", |s: &str| Ok(s.to_uppercase()));
    string.set_native_fn("lower", |s: &str| Ok(s.to_lowercase()));
    string.set_native_fn("trimmed", |s: &str| Ok(s.trim().to_string()));

    vec![("math", math), ("date", date), ("string", string)]
}

fn module_allowed(name: &str, sandbox: &SandboxConfig) -> bool {
    if sandbox.blocked_modules.iter().any(|m| m == name) {
        return false;
    }
    sandbox.allowed_modules.is_empty() || sandbox.allowed_modules.iter().any(|m| m == name)
}

fn run_sandboxed(
    source: String,
    inputs: Vec<(String, JsonValue)>,
    outputs: Vec<String>,
    sandbox: SandboxConfig,
) -> Result<Variables, String> {
    let mut engine = RhaiEngine::new();
    engine.set_max_operations(sandbox.max_operations);
    engine.set_max_call_levels(sandbox.max_call_depth);
    engine.set_max_string_size(sandbox.max_string_size);
    engine.set_max_array_size(sandbox.max_array_size);

    let budget = Duration::from_millis(sandbox.timeout_ms);
    let started = Instant::now();
    engine.on_progress(move |_ops| {
        if started.elapsed() > budget {
            Some("wall-clock budget exceeded".into())
        } else {
            None
        }
    });

    let mut resolver = StaticModuleResolver::new();
    for (name, module) in builtin_modules() {
        if module_allowed(name, &sandbox) {
            resolver.insert(name, module);
        }
    }
    engine.set_module_resolver(resolver);

    if sandbox.expose_console {
        engine.register_fn("log", |message: &str| {
            info!(target: "escapement::script", "{message}");
        });
    }

    let mut scope = Scope::new();
    for (name, value) in inputs {
        let dynamic = to_dynamic(&value).map_err(|e| e.to_string())?;
        scope.push_dynamic(name, dynamic);
    }

    engine
        .run_with_scope(&mut scope, &source)
        .map_err(|e| e.to_string())?;

    let mut results = Variables::new();
    for name in outputs {
        if let Some(value) = scope.get(&name) {
            let json: JsonValue = from_dynamic(&value.clone()).map_err(|e| e.to_string())?;
            results.insert(name, json);
        }
    }
    Ok(results)
}

#[async_trait]
impl NodeHandler for ScriptHandler {
    fn kind(&self) -> &'static str {
        "script"
    }

    fn core(&self) -> &HandlerCore {
        &self.core
    }

    async fn execute(
        &self,
        ctx: &Arc<EngineContext>,
        process: &ProcessInstance,
        node: &NodeInstance,
    ) -> Result<HandlerResult, EngineError> {
        let NodeKind::Script(config) = node.kind() else {
            return Err(EngineError::System {
                message: format!("script handler given a {} node", node.kind().name()),
            });
        };

        let sandbox = config
            .sandbox
            .clone()
            .unwrap_or_else(|| ctx.settings.sandbox.clone());

        let inputs: Vec<(String, JsonValue)> = config
            .inputs
            .iter()
            .map(|(script_var, process_var)| {
                let value = process
                    .variable(process_var)
                    .cloned()
                    .unwrap_or(JsonValue::Null);
                (script_var.clone(), value)
            })
            .collect();

        let source = config.source.clone();
        let outputs = config.outputs.clone();
        let budget = Duration::from_millis(sandbox.timeout_ms);
        let node_key = node.node_key().to_string();

        let worker =
            tokio::task::spawn_blocking(move || run_sandboxed(source, inputs, outputs, sandbox));

        // Outer guard: a small grace over the in-interpreter budget.
        let joined = tokio::time::timeout(budget + Duration::from_millis(500), worker).await;

        let outcome = match joined {
            Err(_) => Err(EngineError::Timeout {
                what: format!("script on '{node_key}'"),
            }),
            Ok(Err(_join_error)) => Err(EngineError::Execution {
                message: format!("script on '{node_key}' panicked"),
            }),
            Ok(Ok(Err(message))) => Err(EngineError::Execution {
                message: format!("script on '{node_key}': {message}"),
            }),
            Ok(Ok(Ok(results))) => Ok(results),
        };

        match outcome {
            Ok(results) => {
                debug!(node_key = %node_key, outputs = results.len(), "script finished");
                self.core.record(&node_key, true);
                Ok(HandlerResult::completed().with_variables(results))
            }
            Err(error) => {
                self.core.record(&node_key, false);
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerOutcome;
    use crate::testutil::{test_context, test_process};
    use escapement_flow::{NodeDefinition, ScriptConfig};
    use serde_json::json;
    use std::collections::HashMap;

    fn script_node(source: &str, inputs: &[(&str, &str)], outputs: &[&str]) -> NodeInstance {
        let config = ScriptConfig {
            source: source.to_string(),
            inputs: inputs
                .iter()
                .map(|(a, b)| ((*a).to_string(), (*b).to_string()))
                .collect::<HashMap<_, _>>(),
            outputs: outputs.iter().map(ToString::to_string).collect(),
            sandbox: None,
        };
        NodeInstance::new(
            escapement_core::ProcessId::new(),
            NodeDefinition::new("calc", "Calc", NodeKind::Script(config)),
        )
    }

    #[tokio::test]
    async fn outputs_merge_into_variables() {
        let ctx = test_context().await;
        let handler = ScriptHandler::new();

        let mut process = test_process();
        process.set_variable("amount", json!(40));

        let node = script_node(
            "let total = amount * 2; let label = \"doubled\";",
            &[("amount", "amount")],
            &["total", "label"],
        );

        let result = handler.execute(&ctx, &process, &node).await.unwrap();
        assert_eq!(result.outcome, HandlerOutcome::Completed);
        assert_eq!(result.variables.get("total"), Some(&json!(80)));
        assert_eq!(result.variables.get("label"), Some(&json!("doubled")));
    }

    #[tokio::test]
    async fn runaway_script_is_stopped() {
        let ctx = test_context().await;
        let handler = ScriptHandler::new();
        let process = test_process();

        let mut node = script_node("let x = 0; loop { x += 1; }", &[], &[]);
        if let NodeKind::Script(config) = &mut node.definition.kind {
            config.sandbox = Some(SandboxConfig {
                max_operations: 10_000,
                timeout_ms: 500,
                ..SandboxConfig::default()
            });
        }

        let err = handler.execute(&ctx, &process, &node).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Execution { .. } | EngineError::Timeout { .. }
        ));
    }

    #[tokio::test]
    async fn script_errors_surface() {
        let ctx = test_context().await;
        let handler = ScriptHandler::new();
        let process = test_process();

        let node = script_node("this is not rhai;;;", &[], &[]);
        let err = handler.execute(&ctx, &process, &node).await.unwrap_err();
        assert!(matches!(err, EngineError::Execution { .. }));
    }

    #[tokio::test]
    async fn blocked_module_is_unresolvable() {
        let ctx = test_context().await;
        let handler = ScriptHandler::new();
        let process = test_process();

        let mut node = script_node(
            "import \"math\" as m; let y = m::clamp(5.0, 0.0, 1.0);",
            &[],
            &[],
        );
        if let NodeKind::Script(config) = &mut node.definition.kind {
            config.sandbox = Some(SandboxConfig {
                blocked_modules: vec!["math".to_string()],
                ..SandboxConfig::default()
            });
        }

        let err = handler.execute(&ctx, &process, &node).await.unwrap_err();
        assert!(matches!(err, EngineError::Execution { .. }));
    }

    #[tokio::test]
    async fn allowed_module_resolves() {
        let ctx = test_context().await;
        let handler = ScriptHandler::new();
        let process = test_process();

        let node = script_node(
            "import \"math\" as m; let y = m::clamp(5.0, 0.0, 1.0);",
            &[],
            &["y"],
        );
        let result = handler.execute(&ctx, &process, &node).await.unwrap();
        assert_eq!(result.variables.get("y"), Some(&json!(1.0)));
    }
}
