//! Command Router - command name to handler registry.
//!
//! Handlers are stored type-erased (`Arc<dyn CommandHandler>`) so the
//! dispatcher can clone one out and run it on its own task under a timeout.
//! Typed commands go through [`typed::Typed`], which decodes the payload
//! with serde before the handler sees it.

pub mod builtin;
pub mod typed;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{CommandResult, Envelope, EnvelopeId, Payload, TaskId};
use crate::error::{HandlerError, RouterError};
use crate::ports::Actuator;

pub use self::typed::{Command, TypedHandler};

/// What a handler knows about the envelope it runs for.
#[derive(Clone)]
pub struct CommandContext {
    pub command: String,
    pub envelope_id: Option<EnvelopeId>,
    pub from: String,
    pub to: String,
    pub tag: String,
    pub task_id: Option<TaskId>,
    pub actuator: Arc<dyn Actuator>,
}

impl CommandContext {
    pub fn for_envelope(envelope: &Envelope, actuator: Arc<dyn Actuator>) -> Self {
        Self {
            command: envelope.command_name().to_string(),
            envelope_id: Some(envelope.id.clone()),
            from: envelope.from.clone(),
            to: envelope.to.clone(),
            tag: envelope.tag.clone(),
            task_id: envelope.task_id.clone(),
            actuator,
        }
    }
}

impl fmt::Debug for CommandContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandContext")
            .field("command", &self.command)
            .field("envelope_id", &self.envelope_id)
            .field("from", &self.from)
            .field("to", &self.to)
            .field("tag", &self.tag)
            .field("task_id", &self.task_id)
            .finish_non_exhaustive()
    }
}

/// A command implementation. Runs on its own tokio task under the
/// dispatcher's timeout; a panic counts as a failed attempt.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(
        &self,
        ctx: &CommandContext,
        payload: Payload,
    ) -> Result<CommandResult, HandlerError>;

    /// Whether running this command is a step of the envelope's task.
    ///
    /// Step handlers move the task into `EXECUTING` before they run and feed
    /// `step_passed`/`step_failed` afterwards. Control commands (`approve`,
    /// `reset`, ...) return false and drive the task through
    /// [`CommandResult::task_event`] instead.
    fn drives_step(&self) -> bool {
        true
    }
}

/// Command name to handler registry. Cheap to clone.
#[derive(Clone, Default)]
pub struct CommandRouter {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
}

impl CommandRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Router preloaded with the built-in commands.
    pub fn with_builtins() -> Self {
        let mut router = Self::new();
        builtin::install(&mut router);
        router
    }

    /// Fails with [`RouterError::DuplicateHandler`] if `name` is taken; use
    /// [`replace`](Self::replace) to override.
    pub fn register<H>(&mut self, name: impl Into<String>, handler: H) -> Result<(), RouterError>
    where
        H: CommandHandler + 'static,
    {
        let name = name.into();
        if self.handlers.contains_key(&name) {
            return Err(RouterError::DuplicateHandler(name));
        }
        self.handlers.insert(name, Arc::new(handler));
        Ok(())
    }

    /// Register, overriding any handler already bound to `name`.
    pub fn replace<H>(&mut self, name: impl Into<String>, handler: H) -> Option<Arc<dyn CommandHandler>>
    where
        H: CommandHandler + 'static,
    {
        self.handlers.insert(name.into(), Arc::new(handler))
    }

    /// Register a typed handler under `C::NAME`.
    pub fn register_typed<C, H>(&mut self, handler: H) -> Result<(), RouterError>
    where
        C: Command,
        H: TypedHandler<C> + 'static,
    {
        self.register(C::NAME, typed::Typed::<C, H>::new(handler))
    }

    /// The handler for `command`, for callers that run it themselves.
    pub fn resolve(&self, command: &str) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.get(command).cloned()
    }

    /// Resolve and invoke in place, without a timeout.
    pub async fn route(
        &self,
        ctx: &CommandContext,
        payload: Payload,
    ) -> Result<CommandResult, RouterError> {
        let handler = self
            .resolve(&ctx.command)
            .ok_or_else(|| RouterError::UnknownCommand(ctx.command.clone()))?;
        Ok(handler.handle(ctx, payload).await?)
    }

    /// Registered command names, sorted.
    pub fn commands(&self) -> Vec<String> {
        let mut names: Vec<_> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn contains(&self, command: &str) -> bool {
        self.handlers.contains_key(command)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for CommandRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRouter")
            .field("commands", &self.commands())
            .finish()
    }
}
