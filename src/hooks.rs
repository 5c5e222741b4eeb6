use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::{error, info, warn};

use crate::types::{HookOutcome, ToolReturnEvent, ToolReturnOutcome, TurnEvent};
use crate::{Engine, EngineBuilder};

/// Hook names and dispatch priorities the host registers us under.
pub const BEFORE_TURN: &str = "before-turn";
pub const AFTER_TURN: &str = "after-turn";
pub const TOOL_CALL_RETURN: &str = "tool-call-return";

pub const BEFORE_TURN_PRIORITY: i32 = 100;
pub const AFTER_TURN_PRIORITY: i32 = 50;
pub const TOOL_CALL_RETURN_PRIORITY: i32 = 100;

/// A named callback registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookRegistration {
    pub name: &'static str,
    pub priority: i32,
}

/// The three registrations this engine asks its host for.
pub fn registrations() -> Vec<HookRegistration> {
    vec![
        HookRegistration {
            name: BEFORE_TURN,
            priority: BEFORE_TURN_PRIORITY,
        },
        HookRegistration {
            name: AFTER_TURN,
            priority: AFTER_TURN_PRIORITY,
        },
        HookRegistration {
            name: TOOL_CALL_RETURN,
            priority: TOOL_CALL_RETURN_PRIORITY,
        },
    ]
}

/// The sole public surface the host talks to. Initialization is lazy on
/// the first hook invocation and serialized by the cell; a fatal init
/// failure parks the pipeline in passthrough mode permanently (logged
/// once). In the worst case every hook is an identity function.
pub struct Pipeline {
    builder: EngineBuilder,
    engine: OnceCell<Option<Arc<Engine>>>,
}

impl Pipeline {
    pub fn new(builder: EngineBuilder) -> Self {
        Self {
            builder,
            engine: OnceCell::new(),
        }
    }

    async fn engine(&self) -> Option<&Arc<Engine>> {
        self.engine
            .get_or_init(|| async {
                match self.builder.clone().build().await {
                    Ok(engine) => {
                        info!("context engine initialized");
                        Some(Arc::new(engine))
                    }
                    Err(e) => {
                        error!(error = %e, "engine initialization failed, hooks degrade to passthrough");
                        None
                    }
                }
            })
            .await
            .as_ref()
    }

    /// Direct engine access for hosts that call the memory or tool-result
    /// APIs outside the hook path.
    pub async fn engine_handle(&self) -> Result<Arc<Engine>, crate::EngineError> {
        self.engine()
            .await
            .cloned()
            .ok_or(crate::EngineError::Disabled)
    }

    /// Filter the transcript before a model turn. Passthrough on any
    /// engine failure; the host's transcript is never blocked.
    pub async fn before_turn(&self, event: TurnEvent) -> HookOutcome {
        let Some(engine) = self.engine().await else {
            return HookOutcome::Passthrough;
        };
        engine.before_turn(&event).await
    }

    /// Queue the completed turn for extraction. Runs in the background;
    /// errors are logged and never surface.
    pub async fn after_turn(&self, event: TurnEvent) {
        let Some(engine) = self.engine().await else {
            return;
        };
        let engine = engine.clone();
        tokio::spawn(async move {
            engine.after_turn(&event).await;
        });
    }

    /// Externalize an oversize tool result, or pass it through.
    pub async fn tool_call_return(&self, event: ToolReturnEvent) -> ToolReturnOutcome {
        let Some(engine) = self.engine().await else {
            return ToolReturnOutcome::Passthrough;
        };
        engine.tool_call_return(&event).await
    }

    /// Tear down the engine's background tasks, if it ever initialized.
    pub async fn shutdown(&self) {
        if let Some(Some(engine)) = self.engine.get() {
            engine.shutdown().await;
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if let Some(Some(engine)) = self.engine.get() {
            engine.cancel_background();
            warn!("pipeline dropped without shutdown, background tasks cancelled");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_names_and_priorities() {
        let regs = registrations();
        assert_eq!(regs.len(), 3);
        assert_eq!(regs[0].name, "before-turn");
        assert_eq!(regs[1].name, "after-turn");
        assert_eq!(regs[2].name, "tool-call-return");
    }
}
