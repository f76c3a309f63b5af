//! Built-in commands.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use super::{Command, CommandContext, CommandHandler, CommandRouter, TypedHandler};
use crate::domain::{CommandResult, Payload, TaskEvent};
use crate::error::HandlerError;

pub(crate) fn install(router: &mut CommandRouter) {
    router.replace("ping", Ping);
    router.replace("resume", SyncAck);
    router.replace("sync", SyncAck);
    router.replace(ActuateCommand::NAME, super::typed::Typed::<ActuateCommand, _>::new(Actuate));
    router.replace("notify", Notify);
    router.replace("approve", TaskControl::Approve);
    router.replace("deny", TaskControl::Deny);
    router.replace("unblock", TaskControl::Unblock);
    router.replace("reset", TaskControl::Reset);
}

/// Echoes the payload back.
pub struct Ping;

#[async_trait]
impl CommandHandler for Ping {
    async fn handle(
        &self,
        ctx: &CommandContext,
        payload: Payload,
    ) -> Result<CommandResult, HandlerError> {
        debug!(from = %ctx.from, "ping");
        let mut data = payload;
        data.insert("pong".into(), Value::Bool(true));
        Ok(CommandResult::ok().with_data(data))
    }

    fn drives_step(&self) -> bool {
        false
    }
}

/// State-sync acknowledgment (`resume`, `sync`).
pub struct SyncAck;

#[async_trait]
impl CommandHandler for SyncAck {
    async fn handle(
        &self,
        ctx: &CommandContext,
        _payload: Payload,
    ) -> Result<CommandResult, HandlerError> {
        info!(command = %ctx.command, from = %ctx.from, to = %ctx.to, "state sync acknowledged");
        let mut data = Payload::new();
        data.insert("acknowledged".into(), Value::String(ctx.command.clone()));
        Ok(CommandResult::ok().with_data(data))
    }

    fn drives_step(&self) -> bool {
        false
    }
}

/// Drive the actuator once.
///
/// `target` defaults to the envelope recipient. Every other field of the
/// payload is handed to the actuator untouched.
#[derive(Debug, Clone, Deserialize)]
pub struct ActuateCommand {
    #[serde(default)]
    pub target: Option<String>,
    pub action: String,
    #[serde(flatten)]
    pub args: Payload,
}

impl Command for ActuateCommand {
    const NAME: &'static str = "actuate";
}

pub struct Actuate;

#[async_trait]
impl TypedHandler<ActuateCommand> for Actuate {
    async fn handle(
        &self,
        ctx: &CommandContext,
        command: ActuateCommand,
    ) -> Result<CommandResult, HandlerError> {
        let target = command.target.unwrap_or_else(|| ctx.to.clone());
        let mut payload = command.args;
        payload.insert("action".into(), Value::String(command.action.clone()));

        let actuator = ctx.actuator.clone();
        let call_target = target.clone();
        tokio::task::spawn_blocking(move || actuator.perform(&call_target, &payload))
            .await
            .map_err(|e| HandlerError::Failed(format!("actuator thread: {e}")))??;

        let envelope = ctx
            .envelope_id
            .as_ref()
            .map(|id| id.as_str())
            .unwrap_or("-");
        info!(actuator_target = %target, action = %command.action, "actuated");
        Ok(CommandResult::ok().with_evidence(format!(
            "actuator:{target}:{}:{envelope}",
            command.action
        )))
    }
}

/// Receipt for observer notifications.
pub struct Notify;

#[async_trait]
impl CommandHandler for Notify {
    async fn handle(
        &self,
        ctx: &CommandContext,
        payload: Payload,
    ) -> Result<CommandResult, HandlerError> {
        let field = |key: &str| payload.get(key).and_then(Value::as_str).unwrap_or("-").to_string();
        info!(
            to = %ctx.to,
            task_id = %field("task_id"),
            state = %field("state"),
            "task notification received"
        );
        Ok(CommandResult::ok())
    }

    fn drives_step(&self) -> bool {
        false
    }
}

/// Commands that steer a task instead of executing a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskControl {
    Approve,
    Deny,
    Unblock,
    Reset,
}

#[async_trait]
impl CommandHandler for TaskControl {
    async fn handle(
        &self,
        ctx: &CommandContext,
        payload: Payload,
    ) -> Result<CommandResult, HandlerError> {
        if ctx.task_id.is_none() {
            return Err(HandlerError::InvalidPayload(format!(
                "{} requires a task_id",
                ctx.command
            )));
        }
        let event = match self {
            TaskControl::Approve => TaskEvent::ApprovalGranted,
            TaskControl::Deny => TaskEvent::ApprovalDenied {
                reason: payload.get("reason").and_then(Value::as_str).map(str::to_string),
            },
            TaskControl::Unblock => TaskEvent::DependencyReady,
            TaskControl::Reset => TaskEvent::ResetRequested,
        };
        Ok(CommandResult::ok().with_task_event(event))
    }

    fn drives_step(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EnvelopeId, TaskId};
    use crate::impls::RecordingActuator;
    use serde_json::json;
    use std::sync::Arc;

    fn ctx(command: &str, actuator: Arc<RecordingActuator>) -> CommandContext {
        CommandContext {
            command: command.into(),
            envelope_id: Some(EnvelopeId::parse("t1").unwrap()),
            from: "agent-1".into(),
            to: "agent-2".into(),
            tag: "task".into(),
            task_id: Some(TaskId::parse("build").unwrap()),
            actuator,
        }
    }

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn ping_echoes() {
        let router = CommandRouter::with_builtins();
        let actuator = Arc::new(RecordingActuator::new());
        let result = router
            .route(&ctx("ping", actuator), payload(json!({"n": 1})))
            .await
            .unwrap();
        assert_eq!(Value::Object(result.data.unwrap()), json!({"n": 1, "pong": true}));
    }

    #[tokio::test]
    async fn actuate_drives_the_recipient_and_returns_evidence() {
        let router = CommandRouter::with_builtins();
        let actuator = Arc::new(RecordingActuator::new());
        let result = router
            .route(
                &ctx("actuate", actuator.clone()),
                payload(json!({"action": "click", "x": 10})),
            )
            .await
            .unwrap();

        assert_eq!(result.evidence, vec!["actuator:agent-2:click:t1"]);
        let calls = actuator.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "agent-2");
        assert_eq!(calls[0].1["x"], 10);
        assert_eq!(calls[0].1["action"], "click");
    }

    #[tokio::test]
    async fn actuator_failure_is_a_handler_error() {
        let router = CommandRouter::with_builtins();
        let actuator = Arc::new(RecordingActuator::failing("device busy"));
        let err = router
            .route(&ctx("actuate", actuator), payload(json!({"action": "click"})))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::RouterError::Handler(HandlerError::Actuator(_))
        ));
    }

    #[tokio::test]
    async fn control_commands_emit_task_events() {
        let router = CommandRouter::with_builtins();
        let actuator = Arc::new(RecordingActuator::new());
        let result = router
            .route(&ctx("deny", actuator.clone()), payload(json!({"reason": "wrong button"})))
            .await
            .unwrap();
        assert_eq!(
            result.task_event,
            Some(TaskEvent::ApprovalDenied {
                reason: Some("wrong button".into())
            })
        );
        assert!(!router.resolve("approve").unwrap().drives_step());

        let mut no_task = ctx("approve", actuator);
        no_task.task_id = None;
        assert!(router.route(&no_task, Payload::new()).await.is_err());
    }
}
