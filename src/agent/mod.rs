//! Agent control loop: observe -> render context -> LLM -> dispatch -> repeat.
//!
//! The loop is strictly sequential per session - one iteration and one LLM
//! call outstanding at a time, because every iteration depends on the page
//! state left by the previous one. Exits when the task completes, when a
//! manual intervention pauses it, or when the plan stack runs dry; `resume`
//! re-enters the same loop after a human hands control back.

pub mod actions;
pub mod dispatch;

use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};

use crate::browser::{BrowserAdapter, PageObservation};
use crate::llm::{ChatMessage, LlmClient};
use crate::plan::PlanStore;
use crate::session::SessionEvent;

use self::actions::{ActionParseError, AgentAction};
use self::dispatch::ToolDispatcher;

/// How many recent actions and notes the rendered context carries.
const CONTEXT_TAIL: usize = 5;

const SYSTEM_PROMPT: &str = "\
You are an autonomous web-browsing agent. Each turn you see the current page \
and the state of your plan, and you respond with tool calls.

## Rules
1. Act through tools - never just describe what you would do.
2. Reference page elements by their numbered element_id from the observation. \
Ids are only valid for the current observation; never reuse one from earlier.
3. For multi-step goals, lay out subgoals with branch() and advance them with \
complete_subgoal(). Prune steps that turn out to be unnecessary.
4. Record important findings with note() - the page will change under you.
5. If you hit a CAPTCHA, a login wall, or anything you cannot do, call \
manual_intervention() and a human will take over.
6. When the goal is satisfied, call stop() with the final answer.";

/// Per-loop termination/pause flags, shared with the dispatcher and session.
///
/// Completion and intervention are mutually exclusive in steady state; the
/// loop always checks completion first.
#[derive(Debug, Default)]
pub struct SignalState {
    complete: AtomicBool,
    paused: AtomicBool,
}

impl SignalState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn request_completion(&self) {
        self.complete.store(true, Ordering::SeqCst);
    }

    /// A fresh instruction starts fresh work; a completion left over from a
    /// previous `stop()` must not end the loop before it begins.
    pub fn clear_completion(&self) {
        self.complete.store(false, Ordering::SeqCst);
    }

    pub fn request_intervention(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn clear_intervention(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }
}

/// The per-session agent state machine.
pub struct ControlLoop {
    plan: Arc<Mutex<PlanStore>>,
    adapter: Arc<BrowserAdapter>,
    llm: Arc<dyn LlmClient>,
    model: String,
    signals: Arc<SignalState>,
    events: mpsc::UnboundedSender<SessionEvent>,
    dispatcher: ToolDispatcher,
}

impl ControlLoop {
    pub fn new(
        plan: Arc<Mutex<PlanStore>>,
        adapter: Arc<BrowserAdapter>,
        llm: Arc<dyn LlmClient>,
        model: String,
        signals: Arc<SignalState>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let dispatcher = ToolDispatcher::new(
            Arc::clone(&plan),
            Arc::clone(&adapter),
            Arc::clone(&signals),
            events.clone(),
        );
        Self {
            plan,
            adapter,
            llm,
            model,
            signals,
            events,
            dispatcher,
        }
    }

    /// Run iterations until the task completes, an intervention pauses the
    /// loop, or the plan stack is empty.
    pub async fn run(&self) {
        loop {
            // Completion is checked before intervention.
            if self.signals.is_complete() {
                tracing::debug!("Control loop exiting: task complete");
                break;
            }
            if self.signals.is_paused() {
                tracing::debug!("Control loop exiting: paused for manual intervention");
                break;
            }

            {
                let mut plan = self.plan.lock().await;
                if plan.is_empty() {
                    tracing::debug!("Control loop exiting: plan stack empty");
                    break;
                }
                // A finished goal falls away and reveals the next-older one
                // without spending an LLM call.
                if plan.pop_completed_goal() {
                    tracing::debug!(depth = plan.depth(), "Popped completed goal");
                    continue;
                }
            }

            let observation = match self.adapter.observe().await {
                Ok(observation) => observation,
                Err(e) => {
                    self.dispatcher
                        .record_failure("observe", &e.to_string())
                        .await;
                    self.pause_for_fault(format!("Page observation failed: {}", e))
                        .await;
                    continue;
                }
            };

            let context = {
                let plan = self.plan.lock().await;
                render_context(&plan, &observation)
            };
            let messages = vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(context)];

            let response = match self
                .llm
                .chat_completion(&self.model, &messages, Some(&actions::tool_definitions()))
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    self.dispatcher.record_failure("llm", &e.to_string()).await;
                    self.pause_for_fault(format!("LLM call failed: {}", e)).await;
                    continue;
                }
            };

            let tool_calls = response.tool_calls.unwrap_or_default();
            tracing::debug!(count = tool_calls.len(), "Dispatching tool calls");
            for call in &tool_calls {
                // Stop dispatching within this iteration once a call
                // completed or paused the task.
                if self.signals.is_complete() || self.signals.is_paused() {
                    break;
                }
                let args: Value = if call.function.arguments.trim().is_empty() {
                    Value::Null
                } else {
                    serde_json::from_str(&call.function.arguments).unwrap_or(Value::Null)
                };
                match AgentAction::parse(&call.function.name, &args) {
                    Ok(action) => {
                        self.dispatcher.dispatch(action, &observation.elements).await;
                    }
                    Err(ActionParseError::UnknownAction { name }) => {
                        tracing::warn!(action = %name, "Ignoring unknown action");
                    }
                    Err(err) => {
                        self.dispatcher
                            .record_failure(&call.function.name, &err.to_string())
                            .await;
                    }
                }
            }

            if let Some(content) = response.content {
                if !content.trim().is_empty() {
                    let (plan_depth, current_goal) = {
                        let plan = self.plan.lock().await;
                        (plan.depth(), plan.current_goal().map(|g| g.text))
                    };
                    let _ = self.events.send(SessionEvent::AgentResponse {
                        response: content,
                        plan_depth,
                        current_goal,
                    });
                }
            }
        }
    }

    /// Clear the pause flag, record the handover, and re-enter the loop if
    /// there is still work to do.
    pub async fn resume(&self) {
        self.signals.clear_intervention();
        {
            let mut plan = self.plan.lock().await;
            plan.log_action("manual intervention complete");
            plan.add_note("control returned after manual intervention");
        }
        tracing::info!("Resuming after manual intervention");

        let has_work = !self.plan.lock().await.is_empty();
        if !self.signals.is_complete() && has_work {
            self.run().await;
        }
    }

    /// Pause the loop after an internal fault, telling the observer why.
    /// The session stays alive and resumable; nothing here terminates it.
    async fn pause_for_fault(&self, reason: String) {
        self.signals.request_intervention();
        let current_url = self.adapter.current_url().await.unwrap_or_default();
        let _ = self.events.send(SessionEvent::ManualIntervention {
            reasoning: reason,
            suggestion: "Check the browser state, then resume the agent".to_string(),
            current_url,
            timestamp: Utc::now(),
        });
    }
}

/// Render the LLM context for one iteration: plan state, recent history,
/// advisory warnings, and the observed page with numbered elements.
pub(crate) fn render_context(plan: &PlanStore, observation: &PageObservation) -> String {
    let mut out = String::new();

    if plan.depth() > 1 {
        out.push_str("Instruction stack (oldest first):\n");
        for (i, goal) in plan.goals().iter().enumerate() {
            let _ = writeln!(out, "{}. {}", i + 1, goal.text);
        }
        out.push('\n');
    }

    if let Some(goal) = plan.current_goal() {
        let _ = writeln!(out, "Goal: {}", goal.text);
        let summary = plan.subgoal_summary();
        if summary.is_empty() {
            out.push_str(
                "No subgoals yet. Break the goal into steps with branch([...]), \
                 or call stop(answer) if the goal is already satisfied.\n",
            );
        } else {
            out.push_str("Subgoals:\n");
            for line in summary {
                let _ = writeln!(out, "  {}", line);
            }
        }
    }

    let actions = plan.recent_actions(CONTEXT_TAIL);
    if !actions.is_empty() {
        out.push_str("\nRecent actions:\n");
        for action in actions {
            let _ = writeln!(out, "  - {}", action);
        }
    }

    let notes = plan.recent_notes(CONTEXT_TAIL);
    if !notes.is_empty() {
        out.push_str("\nNotes:\n");
        for note in notes {
            let _ = writeln!(out, "  - {}", note);
        }
    }

    for warning in plan.check_timeouts() {
        let _ = writeln!(out, "\nWARNING: {}", warning);
    }

    let _ = writeln!(
        out,
        "\nCurrent page: {} ({})",
        if observation.title.is_empty() {
            "(untitled)"
        } else {
            observation.title.as_str()
        },
        observation.url
    );
    if observation.elements.is_empty() {
        out.push_str("No interactive elements detected.\n");
    } else {
        out.push_str(
            "Interactive elements (pass the number as element_id to click/type):\n",
        );
        for (id, element) in &observation.elements {
            let _ = writeln!(out, "[{}] {}", id, element.name);
        }
    }
    let _ = writeln!(out, "\nPage text:\n{}", observation.text);

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::{ElementDescriptor, ElementMap};
    use crate::config::PlanConfig;
    use crate::llm::{ChatResponse, LlmClient, ToolDefinition};
    use async_trait::async_trait;

    struct NoopLlm;

    #[async_trait]
    impl LlmClient for NoopLlm {
        async fn chat_completion(
            &self,
            _model: &str,
            _messages: &[ChatMessage],
            _tools: Option<&[ToolDefinition]>,
        ) -> anyhow::Result<ChatResponse> {
            Ok(ChatResponse {
                content: None,
                tool_calls: None,
                finish_reason: None,
                usage: None,
                model: None,
            })
        }
    }

    fn observation() -> PageObservation {
        let mut elements = ElementMap::new();
        elements.insert(
            4,
            ElementDescriptor {
                name: "Login".to_string(),
                selector: "[data-pilot-id=\"4\"]".to_string(),
            },
        );
        PageObservation {
            url: "https://example.com".to_string(),
            title: "Example".to_string(),
            text: "Welcome to Example".to_string(),
            elements,
        }
    }

    fn control_loop() -> (ControlLoop, Arc<Mutex<PlanStore>>, Arc<SignalState>, mpsc::UnboundedReceiver<SessionEvent>) {
        let plan = Arc::new(Mutex::new(PlanStore::new(&PlanConfig::default())));
        let signals = Arc::new(SignalState::new());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let control = ControlLoop::new(
            Arc::clone(&plan),
            Arc::new(BrowserAdapter::new()),
            Arc::new(NoopLlm),
            "test-model".to_string(),
            Arc::clone(&signals),
            events_tx,
        );
        (control, plan, signals, events_rx)
    }

    #[test]
    fn signals_reset_for_new_instruction() {
        let signals = SignalState::new();
        signals.request_completion();
        assert!(signals.is_complete());
        signals.clear_completion();
        assert!(!signals.is_complete());

        signals.request_intervention();
        assert!(signals.is_paused());
        signals.clear_intervention();
        assert!(!signals.is_paused());
    }

    #[test]
    fn context_nudges_branch_without_subgoals() {
        let mut plan = PlanStore::new(&PlanConfig::default());
        plan.push_goal("buy socks");
        let context = render_context(&plan, &observation());
        assert!(context.contains("Goal: buy socks"));
        assert!(context.contains("branch"));
        assert!(context.contains("[4] Login"));
        assert!(context.contains("Page text:"));
        assert!(!context.contains("Instruction stack"));
    }

    #[test]
    fn context_lists_instruction_stack_when_nested() {
        let mut plan = PlanStore::new(&PlanConfig::default());
        plan.push_goal("first instruction");
        plan.push_goal("second instruction");
        plan.update_subgoals(vec!["step one".into()]);
        plan.log_action("goto(https://example.com)");

        let context = render_context(&plan, &observation());
        assert!(context.contains("Instruction stack"));
        assert!(context.contains("1. first instruction"));
        assert!(context.contains("2. second instruction"));
        assert!(context.contains("[current] step one"));
        assert!(context.contains("goto(https://example.com)"));
    }

    #[tokio::test]
    async fn loop_exits_immediately_on_empty_stack() {
        let (control, _, signals, _rx) = control_loop();
        control.run().await;
        assert!(!signals.is_complete());
        assert!(!signals.is_paused());
    }

    #[tokio::test]
    async fn observe_failure_pauses_instead_of_crashing() {
        // The adapter is uninitialized, so the first observation fails; the
        // loop must record the fault, pause, and stay resumable.
        let (control, plan, signals, mut rx) = control_loop();
        plan.lock().await.push_goal("goal");

        control.run().await;

        assert!(signals.is_paused());
        assert!(!signals.is_complete());

        let mut saw_error = false;
        let mut saw_intervention = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                SessionEvent::AgentError { action, .. } => {
                    assert_eq!(action, "observe");
                    saw_error = true;
                }
                SessionEvent::ManualIntervention { .. } => saw_intervention = true,
                _ => {}
            }
        }
        assert!(saw_error);
        assert!(saw_intervention);
    }

    #[tokio::test]
    async fn resume_clears_pause_and_logs_handover() {
        let (control, plan, signals, _rx) = control_loop();
        signals.request_intervention();
        // Empty stack: resume records the handover without re-entering.
        control.resume().await;
        assert!(!signals.is_paused());

        // With work on the stack the loop re-enters and pauses again on the
        // failing observation.
        plan.lock().await.push_goal("goal");
        control.resume().await;
        assert!(signals.is_paused());
        let actions = plan.lock().await.recent_actions(10);
        assert!(actions
            .iter()
            .any(|a| a.contains("manual intervention complete")));
    }

    #[tokio::test]
    async fn completed_goal_pops_without_llm_call() {
        let (control, plan, signals, _rx) = control_loop();
        {
            let mut plan = plan.lock().await;
            plan.push_goal("goal");
            plan.update_subgoals(vec!["only step".into()]);
            plan.complete_subgoal();
        }
        control.run().await;
        // The finished goal fell away and the empty stack ended the loop.
        assert!(plan.lock().await.is_empty());
        assert!(!signals.is_paused());
    }
}
