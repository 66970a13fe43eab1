//! Action dispatch: one validated action in, a plan mutation and/or browser
//! call out.
//!
//! Every fault is caught here. A failed action becomes a truncated
//! `error(...)` entry in the action log plus an observer-facing error event;
//! nothing that happens during dispatch can take the control loop down.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};

use crate::agent::actions::{AgentAction, ScrollDirection};
use crate::agent::SignalState;
use crate::browser::{BrowserAdapter, ElementMap};
use crate::plan::{PlanStore, SubgoalCompletion};
use crate::session::{GoalSummary, SessionEvent};

/// Bound on error text recorded in logs and surfaced to the observer.
const MAX_ERROR_LEN: usize = 300;

/// Default scroll distance in pixels.
const DEFAULT_SCROLL_AMOUNT: f64 = 600.0;

fn truncate_error(error: &str) -> String {
    if error.len() <= MAX_ERROR_LEN {
        error.to_string()
    } else {
        let cut: String = error.chars().take(MAX_ERROR_LEN).collect();
        format!("{}...", cut)
    }
}

fn shorten(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        text.to_string()
    } else {
        let cut: String = text.chars().take(limit).collect();
        format!("{}...", cut)
    }
}

/// Resolve a click/type target: numbered id against the latest observation
/// first, raw selector as fallback. Returns `(label, selector)`.
fn resolve_target(
    elements: &ElementMap,
    element_id: Option<u32>,
    selector: Option<&str>,
) -> anyhow::Result<(String, String)> {
    if let Some(id) = element_id {
        if let Some(descriptor) = elements.get(&id) {
            return Ok((descriptor.name.clone(), descriptor.selector.clone()));
        }
        if selector.is_none() {
            anyhow::bail!(
                "element id {} is not in the current observation; ids reset on every observation",
                id
            );
        }
    }
    match selector {
        Some(sel) => Ok((sel.to_string(), sel.to_string())),
        None => anyhow::bail!("no usable target: provide element_id or selector"),
    }
}

/// Executes validated actions against the plan store and the browser.
pub struct ToolDispatcher {
    plan: Arc<Mutex<PlanStore>>,
    adapter: Arc<BrowserAdapter>,
    signals: Arc<SignalState>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl ToolDispatcher {
    pub fn new(
        plan: Arc<Mutex<PlanStore>>,
        adapter: Arc<BrowserAdapter>,
        signals: Arc<SignalState>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            plan,
            adapter,
            signals,
            events,
        }
    }

    /// Dispatch one action; faults are recorded, never propagated.
    pub async fn dispatch(&self, action: AgentAction, elements: &ElementMap) {
        let name = action.name();
        if let Err(err) = self.run(action, elements).await {
            self.record_failure(name, &err.to_string()).await;
        }
    }

    /// Record a failed action in the log and surface it to the observer.
    pub async fn record_failure(&self, action: &str, error: &str) {
        let truncated = truncate_error(error);
        tracing::warn!(action = action, error = %truncated, "Action failed");
        {
            let mut plan = self.plan.lock().await;
            plan.log_action(format!("error({}: {})", action, truncated));
        }
        let _ = self.events.send(SessionEvent::AgentError {
            action: action.to_string(),
            error: truncated,
        });
    }

    async fn run(&self, action: AgentAction, elements: &ElementMap) -> anyhow::Result<()> {
        match action {
            AgentAction::Branch { subgoals } => {
                let mut plan = self.plan.lock().await;
                let applied = plan.update_subgoals(subgoals.clone());
                if !applied {
                    tracing::warn!("branch ignored: empty list or plan at max depth");
                }
                plan.log_action(format!("branch([{}])", subgoals.join(", ")));
                Ok(())
            }
            AgentAction::Prune => {
                let mut plan = self.plan.lock().await;
                if !plan.prune_subgoal() {
                    tracing::warn!("prune ignored: no subgoals to remove");
                }
                plan.log_action("prune()");
                Ok(())
            }
            AgentAction::CompleteSubgoal => {
                let mut plan = self.plan.lock().await;
                match plan.complete_subgoal() {
                    SubgoalCompletion::NoCurrent => {
                        tracing::warn!("complete_subgoal ignored: no active subgoal");
                        plan.log_action("complete_subgoal() -> no active subgoal");
                    }
                    SubgoalCompletion::Advanced => {
                        plan.log_action("complete_subgoal() -> advanced");
                    }
                    SubgoalCompletion::GoalFinished => {
                        plan.log_action("complete_subgoal() -> goal complete");
                        tracing::info!("All subgoals done, goal marked complete");
                    }
                }
                Ok(())
            }
            AgentAction::Note { message } => {
                let mut plan = self.plan.lock().await;
                plan.add_note(message.clone());
                plan.log_action(format!("note({})", shorten(&message, 80)));
                Ok(())
            }
            AgentAction::ManualIntervention { reason, suggestion } => {
                self.signals.request_intervention();
                let current_url = self.adapter.current_url().await.unwrap_or_default();
                let _ = self.events.send(SessionEvent::ManualIntervention {
                    reasoning: reason.clone(),
                    suggestion,
                    current_url,
                    timestamp: Utc::now(),
                });
                let mut plan = self.plan.lock().await;
                plan.log_action(format!("manual_intervention({})", shorten(&reason, 80)));
                tracing::info!(reason = %reason, "Paused for manual intervention");
                Ok(())
            }
            AgentAction::Stop { answer } => {
                self.signals.request_completion();
                let mut plan = self.plan.lock().await;
                plan.log_action(format!("stop({})", shorten(&answer, 80)));
                let plan_summary: Vec<GoalSummary> =
                    plan.goals().iter().map(GoalSummary::from).collect();
                drop(plan);
                let _ = self.events.send(SessionEvent::AgentComplete {
                    answer,
                    plan_summary,
                });
                tracing::info!("Task complete");
                Ok(())
            }
            AgentAction::Click {
                element_id,
                selector,
            } => {
                let (label, target) = resolve_target(elements, element_id, selector.as_deref())?;
                let url_before = self.adapter.current_url().await.unwrap_or_default();
                self.adapter.click(&target).await?;
                let url_after = self.adapter.current_url().await.unwrap_or_default();

                let mut plan = self.plan.lock().await;
                if !url_after.is_empty() && url_after != url_before {
                    plan.log_action(format!(
                        "click({}) -> navigated to {}",
                        shorten(&label, 60),
                        url_after
                    ));
                } else {
                    plan.log_action(format!("click({}) -> success", shorten(&label, 60)));
                }
                Ok(())
            }
            AgentAction::TypeText {
                element_id,
                selector,
                text,
            } => {
                let (label, target) = resolve_target(elements, element_id, selector.as_deref())?;
                self.adapter.type_text(&target, &text).await?;
                let mut plan = self.plan.lock().await;
                plan.log_action(format!(
                    "type({}, \"{}\")",
                    shorten(&label, 60),
                    shorten(&text, 40)
                ));
                Ok(())
            }
            AgentAction::Goto { url } => {
                url::Url::parse(&url).map_err(|e| anyhow::anyhow!("invalid url '{}': {}", url, e))?;
                self.adapter.navigate(&url).await?;
                let mut plan = self.plan.lock().await;
                plan.log_action(format!("goto({})", url));
                Ok(())
            }
            AgentAction::GoBack => {
                self.adapter.go_back().await?;
                let mut plan = self.plan.lock().await;
                plan.log_action("go_back()");
                Ok(())
            }
            AgentAction::Enter => {
                self.adapter.press_enter().await?;
                let mut plan = self.plan.lock().await;
                plan.log_action("enter()");
                Ok(())
            }
            AgentAction::Scroll { direction, amount } => {
                let amount = amount.unwrap_or(DEFAULT_SCROLL_AMOUNT);
                let dy = match direction {
                    ScrollDirection::Down => amount,
                    ScrollDirection::Up => -amount,
                };
                self.adapter.scroll_by(0.0, dy).await?;
                let mut plan = self.plan.lock().await;
                plan.log_action(format!("scroll({:+.0})", dy));
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::ElementDescriptor;
    use crate::config::PlanConfig;

    fn harness() -> (
        ToolDispatcher,
        Arc<Mutex<PlanStore>>,
        Arc<SignalState>,
        mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        let plan = Arc::new(Mutex::new(PlanStore::new(&PlanConfig::default())));
        let signals = Arc::new(SignalState::new());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let dispatcher = ToolDispatcher::new(
            Arc::clone(&plan),
            Arc::new(BrowserAdapter::new()),
            Arc::clone(&signals),
            events_tx,
        );
        (dispatcher, plan, signals, events_rx)
    }

    fn elements_with(id: u32, name: &str) -> ElementMap {
        let mut map = ElementMap::new();
        map.insert(
            id,
            ElementDescriptor {
                name: name.to_string(),
                selector: format!("[data-pilot-id=\"{}\"]", id),
            },
        );
        map
    }

    #[tokio::test]
    async fn branch_updates_plan_and_logs() {
        let (dispatcher, plan, _, _rx) = harness();
        plan.lock().await.push_goal("compare prices");

        dispatcher
            .dispatch(
                AgentAction::Branch {
                    subgoals: vec!["find price".into(), "compare shipping".into()],
                },
                &ElementMap::new(),
            )
            .await;

        let goal = plan.lock().await.current_goal().unwrap();
        assert_eq!(goal.subgoals.len(), 2);
        assert!(goal.action_log[0].starts_with("branch("));
    }

    #[tokio::test]
    async fn stale_element_id_is_recorded_not_fatal() {
        let (dispatcher, plan, signals, mut rx) = harness();
        plan.lock().await.push_goal("goal");

        dispatcher
            .dispatch(
                AgentAction::Click {
                    element_id: Some(7),
                    selector: None,
                },
                &ElementMap::new(),
            )
            .await;

        let actions = plan.lock().await.recent_actions(5);
        assert!(actions[0].starts_with("error(click:"));
        assert!(!signals.is_complete());
        assert!(!signals.is_paused());

        match rx.try_recv().unwrap() {
            SessionEvent::AgentError { action, error } => {
                assert_eq!(action, "click");
                assert!(error.contains("7"));
            }
            other => panic!("expected agent_error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn click_resolves_numbered_element_before_selector() {
        let elements = elements_with(4, "Login");
        let (label, target) = resolve_target(&elements, Some(4), Some("#fallback")).unwrap();
        assert_eq!(label, "Login");
        assert_eq!(target, "[data-pilot-id=\"4\"]");

        // Missing id with a selector falls back to the raw selector.
        let (label, target) = resolve_target(&elements, Some(9), Some("#fallback")).unwrap();
        assert_eq!(label, "#fallback");
        assert_eq!(target, "#fallback");

        assert!(resolve_target(&elements, None, None).is_err());
    }

    #[tokio::test]
    async fn manual_intervention_pauses_and_emits_once() {
        let (dispatcher, plan, signals, mut rx) = harness();
        plan.lock().await.push_goal("goal");

        dispatcher
            .dispatch(
                AgentAction::ManualIntervention {
                    reason: "CAPTCHA".into(),
                    suggestion: "solve captcha manually".into(),
                },
                &ElementMap::new(),
            )
            .await;

        assert!(signals.is_paused());
        assert!(!signals.is_complete());

        match rx.try_recv().unwrap() {
            SessionEvent::ManualIntervention {
                reasoning,
                suggestion,
                ..
            } => {
                assert_eq!(reasoning, "CAPTCHA");
                assert_eq!(suggestion, "solve captcha manually");
            }
            other => panic!("expected manual_intervention, got {:?}", other),
        }
        assert!(rx.try_recv().is_err(), "exactly one event expected");
    }

    #[tokio::test]
    async fn stop_completes_and_summarizes_plan() {
        let (dispatcher, plan, signals, mut rx) = harness();
        {
            let mut plan = plan.lock().await;
            plan.push_goal("first instruction");
            plan.log_action("goto(https://example.com)");
        }

        dispatcher
            .dispatch(
                AgentAction::Stop {
                    answer: "all done".into(),
                },
                &ElementMap::new(),
            )
            .await;

        assert!(signals.is_complete());
        match rx.try_recv().unwrap() {
            SessionEvent::AgentComplete {
                answer,
                plan_summary,
            } => {
                assert_eq!(answer, "all done");
                assert_eq!(plan_summary.len(), 1);
                assert_eq!(plan_summary[0].goal, "first instruction");
                assert!(plan_summary[0]
                    .actions
                    .iter()
                    .any(|a| a.contains("example.com")));
            }
            other => panic!("expected agent_complete, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn planner_misuse_never_errors() {
        let (dispatcher, plan, _, mut rx) = harness();
        plan.lock().await.push_goal("goal");

        dispatcher
            .dispatch(AgentAction::Prune, &ElementMap::new())
            .await;
        dispatcher
            .dispatch(AgentAction::CompleteSubgoal, &ElementMap::new())
            .await;

        // Misuse is logged, not surfaced as an error event.
        assert!(rx.try_recv().is_err());
        let actions = plan.lock().await.recent_actions(5);
        assert_eq!(actions.len(), 2);
        assert!(!actions.iter().any(|a| a.starts_with("error(")));
    }

    #[tokio::test]
    async fn goto_rejects_invalid_urls_without_touching_browser() {
        let (dispatcher, plan, _, mut rx) = harness();
        plan.lock().await.push_goal("goal");

        dispatcher
            .dispatch(
                AgentAction::Goto {
                    url: "not a url".into(),
                },
                &ElementMap::new(),
            )
            .await;

        let actions = plan.lock().await.recent_actions(5);
        assert!(actions[0].starts_with("error(goto:"));
        assert!(matches!(
            rx.try_recv().unwrap(),
            SessionEvent::AgentError { .. }
        ));
    }

    #[test]
    fn error_text_is_bounded() {
        let long = "x".repeat(1000);
        let truncated = truncate_error(&long);
        assert!(truncated.len() <= MAX_ERROR_LEN + 3);
        assert!(truncated.ends_with("..."));
        assert_eq!(truncate_error("short"), "short");
    }
}
