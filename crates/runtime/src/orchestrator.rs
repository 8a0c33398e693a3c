//! The conversation loop: ask the model, resolve its tool calls, repeat.

use std::sync::Arc;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::conversation::{Conversation, TurnGuard};
use crate::error::TurnError;
use crate::model::{Message, ToolCallRequest, ToolResult};
use crate::providers::BackendAdapter;
use crate::tools::ToolRegistry;

/// Tool-resolution rounds allowed per turn unless configured otherwise.
pub const DEFAULT_MAX_ROUNDS: usize = 8;

/// The answer that ended a turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub text: String,
    /// Tool-resolution rounds the turn took.
    pub rounds: usize,
}

/// Callback told about each tool call before it is dispatched.
pub type ToolCallObserver = Box<dyn Fn(&ToolCallRequest) + Send + Sync>;

/// Drives turns against one backend and one tool registry.
pub struct Orchestrator<B> {
    backend: B,
    registry: Arc<ToolRegistry>,
    max_rounds: usize,
    on_tool_call: Option<ToolCallObserver>,
}

impl<B: BackendAdapter> Orchestrator<B> {
    pub fn new(backend: B, registry: Arc<ToolRegistry>) -> Self {
        Self {
            backend,
            registry,
            max_rounds: DEFAULT_MAX_ROUNDS,
            on_tool_call: None,
        }
    }

    pub fn max_rounds(mut self, max_rounds: usize) -> Self {
        self.max_rounds = max_rounds;
        self
    }

    /// Observe tool calls as they start, in request order.
    pub fn on_tool_call(mut self, observer: impl Fn(&ToolCallRequest) + Send + Sync + 'static) -> Self {
        self.on_tool_call = Some(Box::new(observer));
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Run one user turn to completion.
    ///
    /// On success, and on [`TurnError::ToolResolutionExhausted`], the
    /// messages of every completed round stay in `conversation`. On any
    /// other error, on cancellation, or if this future is dropped, the
    /// conversation is left exactly as it was.
    pub async fn run_turn(
        &self,
        conversation: &mut Conversation,
        input: impl Into<String>,
        cancel: &CancellationToken,
    ) -> Result<Reply, TurnError> {
        let mut turn = conversation.begin_turn();
        turn.push(Message::user(input));

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(TurnError::Cancelled),
            outcome = self.resolve(&mut turn) => outcome,
        };

        match outcome {
            Ok(reply) => {
                turn.commit();
                Ok(reply)
            }
            Err(e @ TurnError::ToolResolutionExhausted { .. }) => {
                turn.commit();
                Err(e)
            }
            Err(e) => {
                info!(error = %e, "turn abandoned; conversation restored");
                Err(e)
            }
        }
    }

    async fn resolve(&self, turn: &mut TurnGuard<'_>) -> Result<Reply, TurnError> {
        let catalog = self.registry.catalog();
        let mut rounds = 0;

        loop {
            debug!(
                provider = %self.backend.describe(),
                round = rounds + 1,
                messages = turn.conversation().len(),
                "requesting model reply"
            );
            let request = self.backend.encode_request(turn.conversation(), catalog);
            let response = self.backend.send(request).await?;
            let reply = self.backend.decode_response(response)?;

            if reply.tool_calls.is_empty() {
                let text = reply.text.unwrap_or_default();
                if text.trim().is_empty() {
                    // Backends reject blank assistant turns on replay.
                    warn!(rounds, "model returned an empty reply");
                } else {
                    turn.push(Message::assistant(text.clone()));
                }
                return Ok(Reply { text, rounds });
            }

            if rounds == self.max_rounds {
                warn!(
                    rounds,
                    pending = reply.tool_calls.len(),
                    "model still requesting tools; giving up on this turn"
                );
                return Err(TurnError::ToolResolutionExhausted { rounds });
            }
            rounds += 1;

            let results = self.dispatch_round(&reply.tool_calls, rounds).await;
            turn.push(Message::assistant_turn(reply.text, reply.tool_calls));
            for result in results {
                turn.push(Message::tool_result(result));
            }
        }
    }

    /// Run every call of one round concurrently. Results come back in
    /// request order.
    async fn dispatch_round(&self, calls: &[ToolCallRequest], round: usize) -> Vec<ToolResult> {
        if let Some(observe) = &self.on_tool_call {
            for call in calls {
                observe(call);
            }
        }
        let dispatches = calls.iter().map(|call| async move {
            debug!(tool = %call.tool_name, call_id = %call.id, round, "calling tool");
            match self.registry.dispatch(&call.tool_name, &call.arguments).await {
                Ok(output) => ToolResult::Success {
                    tool_call_id: call.id.clone(),
                    output: output.render(),
                },
                Err(error) => {
                    warn!(tool = %call.tool_name, call_id = %call.id, round, error = %error, "tool call failed");
                    ToolResult::Failure {
                        tool_call_id: call.id.clone(),
                        error,
                    }
                }
            }
        });
        join_all(dispatches).await
    }
}
