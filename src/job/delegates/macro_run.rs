//! Macro tasks: a sequence of registered commands run in order.

use crate::job::context::{JobContext, MACRO_FORM};
use crate::job::delegate::{JobDependencies, TaskJobDelegate};
use crate::job::error::JobError;
use crate::store::{MacroSpec, Task, TaskExec, TaskSpec};
use serde_json::{Map, Value};
use std::fmt::Write;
use std::sync::Arc;
use tracing::{info, warn};

pub const LOG_COMMAND: &str = "log";
pub const SET_CONF_PARAM_COMMAND: &str = "set_conf_param";

/// One step of a macro.
pub trait Command: Send + Sync {
    /// Rejects malformed arguments before anything runs.
    fn validate(&self, _args: &Value) -> Result<(), JobError> {
        Ok(())
    }

    fn run(&self, deps: &JobDependencies, ctx: &JobContext, args: &Value)
        -> Result<String, JobError>;
}

fn required_str<'a>(args: &'a Value, name: &str) -> Result<&'a str, JobError> {
    args.get(name)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| JobError::Validation(format!("argument '{}' is required", name)))
}

/// Writes a message to the log.
pub struct LogCommand;

impl Command for LogCommand {
    fn run(&self, _deps: &JobDependencies, ctx: &JobContext, args: &Value) -> Result<String, JobError> {
        let message = match args.get("message").and_then(Value::as_str) {
            Some(message) => message.to_string(),
            None => args.to_string(),
        };
        info!("[{}] {}", ctx.execution.key, message);
        Ok(message)
    }
}

/// Sets a domain configuration parameter.
pub struct SetConfParamCommand;

impl Command for SetConfParamCommand {
    fn validate(&self, args: &Value) -> Result<(), JobError> {
        required_str(args, "key")?;
        args.get("value")
            .and_then(Value::as_str)
            .ok_or_else(|| JobError::Validation("argument 'value' is required".to_string()))?;
        Ok(())
    }

    fn run(&self, deps: &JobDependencies, ctx: &JobContext, args: &Value) -> Result<String, JobError> {
        let key = required_str(args, "key")?;
        let value = args.get("value").and_then(Value::as_str).unwrap_or_default();
        if ctx.execution.dry_run {
            return Ok(format!("would set {}", key));
        }
        deps.store.set_conf_param(ctx.domain(), key, value)?;
        Ok(format!("set {}", key))
    }
}

pub struct MacroJobDelegate {
    deps: Arc<JobDependencies>,
}

impl MacroJobDelegate {
    pub fn new(deps: Arc<JobDependencies>) -> Self {
        Self { deps }
    }

    fn validate_form(spec: &MacroSpec, form: Option<&Map<String, Value>>) -> Result<(), JobError> {
        for property in spec.form.iter().filter(|p| p.required) {
            let provided = form
                .and_then(|form| form.get(&property.name))
                .is_some_and(|value| match value {
                    Value::Null => false,
                    Value::String(s) => !s.trim().is_empty(),
                    _ => true,
                });
            if !provided {
                return Err(JobError::Validation(format!(
                    "form property '{}' is required",
                    property.name
                )));
            }
        }
        Ok(())
    }
}

impl TaskJobDelegate for MacroJobDelegate {
    fn execute(&self, task: &mut Task, ctx: &JobContext) -> Result<String, JobError> {
        let TaskSpec::Macro(spec) = &task.spec else {
            return Err(JobError::Validation(format!("task {} is not a macro", task.key)));
        };

        let form = ctx.execution.data.get(MACRO_FORM).and_then(Value::as_object);
        Self::validate_form(spec, form)?;

        let mut output = String::new();
        for invocation in &spec.commands {
            ctx.check_cancelled()?;

            let command = self
                .deps
                .commands
                .get(&invocation.command)
                .ok_or_else(|| JobError::NotFound(format!("command {}", invocation.command)))?;

            let result = command
                .validate(&invocation.args)
                .and_then(|_| command.run(&self.deps, ctx, &invocation.args));
            match result {
                Ok(out) => {
                    let _ = writeln!(output, "{}: {}", invocation.command, out);
                }
                Err(e) if spec.continue_on_error => {
                    warn!("Command {} failed, continuing: {}", invocation.command, e);
                    let _ = writeln!(output, "{}: {}", invocation.command, e);
                }
                Err(e) => {
                    return Err(JobError::ExecutionFailed(format!(
                        "while running {}: {}",
                        invocation.command, e
                    )))
                }
            }
        }
        Ok(output)
    }

    fn has_to_be_registered(&self, _task: &Task, _exec: &TaskExec) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::context::JobExecutionContext;
    use crate::job::key::JobKey;
    use crate::job::testing::TestHarness;
    use crate::store::{CommandInvocation, FormProperty};
    use serde_json::json;

    fn macro_task(commands: Vec<CommandInvocation>, continue_on_error: bool) -> Task {
        Task::new(
            "m1",
            "macro",
            TaskSpec::Macro(MacroSpec {
                commands,
                continue_on_error,
                form: vec![FormProperty {
                    name: "ticket".to_string(),
                    required: true,
                }],
            }),
        )
    }

    fn invocation(command: &str, args: Value) -> CommandInvocation {
        CommandInvocation {
            command: command.to_string(),
            args,
        }
    }

    fn context(form: Value) -> JobContext {
        JobContext::detached(
            JobExecutionContext::new(JobKey::for_task("Master", "m1"), "admin")
                .with_data(MACRO_FORM, form),
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_runs_commands_in_order() {
        let harness = TestHarness::new();
        let delegate = MacroJobDelegate::new(harness.deps());
        let mut task = macro_task(
            vec![
                invocation("log", json!({"message": "starting"})),
                invocation("set_conf_param", json!({"key": "a.b", "value": "1"})),
            ],
            false,
        );

        let output = delegate.execute(&mut task, &context(json!({"ticket": "T-1"}))).unwrap();
        assert_eq!(output, "log: starting\nset_conf_param: set a.b\n");
        assert_eq!(
            harness.store().get_conf_param("Master", "a.b").unwrap().as_deref(),
            Some("1")
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_missing_required_form_property() {
        let harness = TestHarness::new();
        let delegate = MacroJobDelegate::new(harness.deps());
        let mut task = macro_task(vec![invocation("log", json!({"message": "x"}))], false);

        let result = delegate.execute(&mut task, &context(json!({"ticket": "  "})));
        assert!(matches!(result, Err(JobError::Validation(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_validation_failure_aborts_or_continues() {
        let harness = TestHarness::new();
        let delegate = MacroJobDelegate::new(harness.deps());
        let commands = vec![
            invocation("set_conf_param", json!({"value": "1"})),
            invocation("log", json!({"message": "after"})),
        ];

        let mut strict = macro_task(commands.clone(), false);
        let err = delegate
            .execute(&mut strict, &context(json!({"ticket": "T-1"})))
            .unwrap_err();
        assert!(err.to_string().contains("argument 'key' is required"));

        let mut lenient = macro_task(commands, true);
        let output = delegate
            .execute(&mut lenient, &context(json!({"ticket": "T-1"})))
            .unwrap();
        assert!(output.contains("set_conf_param: Validation failed: argument 'key' is required"));
        assert!(output.ends_with("log: after\n"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unknown_command() {
        let harness = TestHarness::new();
        let delegate = MacroJobDelegate::new(harness.deps());
        let mut task = macro_task(vec![invocation("reboot", Value::Null)], true);
        assert!(matches!(
            delegate.execute(&mut task, &context(json!({"ticket": "T-1"}))),
            Err(JobError::NotFound(_))
        ));
    }
}
