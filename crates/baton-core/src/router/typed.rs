//! Typed commands.
//!
//! A [`Command`] names itself with a const and decodes from the payload;
//! a [`TypedHandler<C>`] only ever sees a well-formed `C`. The [`Typed`]
//! adapter erases both into a plain `CommandHandler` for the router.

use std::marker::PhantomData;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use super::{CommandContext, CommandHandler};
use crate::domain::{CommandResult, Payload};
use crate::error::HandlerError;

/// # Example
/// ```ignore
/// #[derive(Deserialize)]
/// struct Click { x: u32, y: u32 }
///
/// impl Command for Click {
///     const NAME: &'static str = "click";
/// }
/// ```
pub trait Command: DeserializeOwned + Send + Sync + 'static {
    const NAME: &'static str;
}

/// Handler for a typed command: receives the decoded payload.
#[async_trait]
pub trait TypedHandler<C: Command>: Send + Sync {
    async fn handle(&self, ctx: &CommandContext, command: C)
    -> Result<CommandResult, HandlerError>;

    fn drives_step(&self) -> bool {
        true
    }
}

/// Adapts a [`TypedHandler`] to [`CommandHandler`]. A payload that does not
/// decode is an [`HandlerError::InvalidPayload`].
pub struct Typed<C, H> {
    handler: H,
    _marker: PhantomData<fn() -> C>,
}

impl<C: Command, H: TypedHandler<C>> Typed<C, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<C: Command, H: TypedHandler<C>> CommandHandler for Typed<C, H> {
    async fn handle(
        &self,
        ctx: &CommandContext,
        payload: Payload,
    ) -> Result<CommandResult, HandlerError> {
        let command: C = serde_json::from_value(serde_json::Value::Object(payload))
            .map_err(|e| HandlerError::InvalidPayload(format!("{}: {e}", C::NAME)))?;
        self.handler.handle(ctx, command).await
    }

    fn drives_step(&self) -> bool {
        self.handler.drives_step()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::RecordingActuator;
    use crate::router::CommandRouter;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::Arc;

    #[derive(Debug, Deserialize)]
    struct Click {
        x: u32,
        y: u32,
    }

    impl Command for Click {
        const NAME: &'static str = "click";
    }

    struct ClickHandler;

    #[async_trait]
    impl TypedHandler<Click> for ClickHandler {
        async fn handle(
            &self,
            _ctx: &CommandContext,
            command: Click,
        ) -> Result<CommandResult, HandlerError> {
            Ok(CommandResult::ok().with_evidence(format!("click:{}:{}", command.x, command.y)))
        }
    }

    fn ctx() -> CommandContext {
        CommandContext {
            command: "click".into(),
            envelope_id: None,
            from: "a".into(),
            to: "b".into(),
            tag: "click".into(),
            task_id: None,
            actuator: Arc::new(RecordingActuator::new()),
        }
    }

    #[tokio::test]
    async fn typed_payload_is_decoded() {
        let mut router = CommandRouter::new();
        router.register_typed::<Click, _>(ClickHandler).unwrap();

        let payload = json!({"x": 3, "y": 4}).as_object().cloned().unwrap();
        let result = router.route(&ctx(), payload).await.unwrap();
        assert_eq!(result.evidence, vec!["click:3:4"]);
    }

    #[tokio::test]
    async fn malformed_payload_is_invalid() {
        let mut router = CommandRouter::new();
        router.register_typed::<Click, _>(ClickHandler).unwrap();

        let payload = json!({"x": "left"}).as_object().cloned().unwrap();
        let err = router.route(&ctx(), payload).await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::RouterError::Handler(HandlerError::InvalidPayload(_))
        ));
    }
}
