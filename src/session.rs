//! One session per connected observer.
//!
//! Owns a browser adapter, an agent control loop, and a frame streamer, and
//! routes traffic between them and the WebSocket: inbound instructions and
//! manual input go to the right subsystem, outbound frames/responses/errors
//! go to the observer. Sessions share nothing; every piece of state here
//! dies with the connection.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::agent::{ControlLoop, SignalState};
use crate::browser::{BrowserAdapter, KeyboardAction, MouseAction};
use crate::config::Config;
use crate::llm::LlmClient;
use crate::plan::{Goal, PlanStore};
use crate::stream::{self, Frame, FrameMetadata, FrameStreamer};

/// Inbound message envelope from the observer.
#[derive(Debug, Deserialize)]
pub struct InboundEnvelope {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct InstructionPayload {
    #[serde(default)]
    id: Option<String>,
    text: String,
}

/// One goal's record in the final plan summary.
#[derive(Debug, Clone, Serialize)]
pub struct GoalSummary {
    pub goal: String,
    pub actions: Vec<String>,
}

impl From<&Goal> for GoalSummary {
    fn from(goal: &Goal) -> Self {
        Self {
            goal: goal.text.clone(),
            actions: goal.action_log.clone(),
        }
    }
}

/// Outbound events to the observer.
#[derive(Debug, Clone, Serialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum SessionEvent {
    Connection {
        status: String,
        session_id: String,
    },
    Frame {
        data: String,
        metadata: FrameMetadata,
    },
    AgentResponse {
        response: String,
        plan_depth: usize,
        current_goal: Option<String>,
    },
    AgentComplete {
        answer: String,
        plan_summary: Vec<GoalSummary>,
    },
    AgentError {
        action: String,
        error: String,
    },
    ManualIntervention {
        reasoning: String,
        suggestion: String,
        current_url: String,
        timestamp: DateTime<Utc>,
    },
    ManualInterventionAcknowledged,
}

/// Run one observer session to completion.
pub async fn run(socket: WebSocket, config: Arc<Config>, llm: Arc<dyn LlmClient>) {
    let session_id = Uuid::new_v4();
    tracing::info!(session = %session_id, "Session opened");

    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<SessionEvent>();
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Bring up the browser before anything else; without it there is no
    // session to speak of.
    let adapter = Arc::new(BrowserAdapter::new());
    if let Err(e) = adapter
        .initialize(
            config.cdp_url.as_deref(),
            config.stream.max_width,
            config.stream.max_height,
        )
        .await
    {
        tracing::error!(session = %session_id, "Browser init failed: {}", e);
        let event = SessionEvent::Connection {
            status: format!("error: {}", e),
            session_id: session_id.to_string(),
        };
        if let Ok(text) = serde_json::to_string(&event) {
            let _ = ws_sender.send(Message::Text(text)).await;
        }
        let _ = ws_sender.send(Message::Close(None)).await;
        return;
    }

    // Frames flow through their own channel and are wrapped into session
    // events here, so the streamer stays ignorant of the wire format.
    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<Frame>();
    let frame_forwarder = {
        let events_tx = events_tx.clone();
        tokio::spawn(async move {
            while let Some(frame) = frames_rx.recv().await {
                if events_tx
                    .send(SessionEvent::Frame {
                        data: frame.data,
                        metadata: frame.metadata,
                    })
                    .is_err()
                {
                    break;
                }
            }
        })
    };

    let streamer = stream::build(config.stream, Arc::clone(&adapter), frames_tx);
    if let Err(e) = streamer.start().await {
        tracing::warn!(session = %session_id, "Frame streamer failed to start: {}", e);
    } else {
        tracing::debug!(session = %session_id, info = ?streamer.info(), "Frame streamer running");
    }

    let plan = Arc::new(Mutex::new(PlanStore::new(&config.plan)));
    let signals = Arc::new(SignalState::new());
    let control = Arc::new(ControlLoop::new(
        Arc::clone(&plan),
        Arc::clone(&adapter),
        llm,
        config.model.clone(),
        Arc::clone(&signals),
        events_tx.clone(),
    ));
    let mut loop_task: Option<JoinHandle<()>> = None;

    let _ = events_tx.send(SessionEvent::Connection {
        status: "connected".to_string(),
        session_id: session_id.to_string(),
    });

    loop {
        tokio::select! {
            inbound = ws_receiver.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        handle_message(
                            &text,
                            &events_tx,
                            &plan,
                            &signals,
                            &adapter,
                            &control,
                            &mut loop_task,
                        )
                        .await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(session = %session_id, "WebSocket error: {}", e);
                        break;
                    }
                }
            }
            event = events_rx.recv() => {
                let Some(event) = event else { break };
                match serde_json::to_string(&event) {
                    Ok(text) => {
                        if ws_sender.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!("Failed to serialize event: {}", e),
                }
            }
        }
    }

    // Teardown order matters: stop producing frames first, then release the
    // browser with bounded timeouts, then drop the loop.
    tracing::info!(session = %session_id, "Session closing");
    streamer.stop().await;
    frame_forwarder.abort();
    if let Some(task) = loop_task.take() {
        task.abort();
    }
    adapter.close().await;
    tracing::info!(session = %session_id, "Session closed");
}

/// Whether the control loop currently has a live task.
fn loop_running(loop_task: &Option<JoinHandle<()>>) -> bool {
    loop_task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
}

#[allow(clippy::too_many_arguments)]
async fn handle_message(
    text: &str,
    events_tx: &mpsc::UnboundedSender<SessionEvent>,
    plan: &Arc<Mutex<PlanStore>>,
    signals: &Arc<SignalState>,
    adapter: &Arc<BrowserAdapter>,
    control: &Arc<ControlLoop>,
    loop_task: &mut Option<JoinHandle<()>>,
) {
    let envelope: InboundEnvelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!("Malformed inbound message: {}", e);
            let _ = events_tx.send(SessionEvent::AgentError {
                action: "message".to_string(),
                error: format!("malformed message: {}", e),
            });
            return;
        }
    };

    match envelope.message_type.as_str() {
        "instruction" => {
            let payload: InstructionPayload = match serde_json::from_value(envelope.payload) {
                Ok(payload) => payload,
                Err(e) => {
                    let _ = events_tx.send(SessionEvent::AgentError {
                        action: "instruction".to_string(),
                        error: format!("malformed payload: {}", e),
                    });
                    return;
                }
            };
            tracing::info!(id = ?payload.id, "Instruction received");
            // A new instruction stacks on top of unfinished work; it never
            // replaces the goal in flight.
            plan.lock().await.push_goal(payload.text);
            signals.clear_completion();
            // While paused for intervention the goal only queues up; the
            // loop re-enters on acknowledgment, not before.
            if !loop_running(loop_task) && !signals.is_paused() {
                let control = Arc::clone(control);
                *loop_task = Some(tokio::spawn(async move { control.run().await }));
            }
        }
        "manual_intervention_complete" => {
            if !signals.is_paused() {
                tracing::warn!("Intervention acknowledgment while not paused, ignoring");
                return;
            }
            let _ = events_tx.send(SessionEvent::ManualInterventionAcknowledged);
            if !loop_running(loop_task) {
                let control = Arc::clone(control);
                *loop_task = Some(tokio::spawn(async move { control.resume().await }));
            }
        }
        "mouse_action" => {
            let action: MouseAction = match serde_json::from_value(envelope.payload) {
                Ok(action) => action,
                Err(e) => {
                    let _ = events_tx.send(SessionEvent::AgentError {
                        action: "mouse_action".to_string(),
                        error: format!("malformed payload: {}", e),
                    });
                    return;
                }
            };
            if !manual_input_allowed(signals, loop_task) {
                let _ = events_tx.send(SessionEvent::AgentError {
                    action: "mouse_action".to_string(),
                    error: "manual input is only accepted while the agent is paused or idle"
                        .to_string(),
                });
                return;
            }
            if let Err(e) = adapter.mouse_action(&action).await {
                tracing::warn!("Mouse passthrough failed: {}", e);
                let _ = events_tx.send(SessionEvent::AgentError {
                    action: "mouse_action".to_string(),
                    error: e.to_string(),
                });
            }
        }
        "keyboard_action" => {
            let action: KeyboardAction = match serde_json::from_value(envelope.payload) {
                Ok(action) => action,
                Err(e) => {
                    let _ = events_tx.send(SessionEvent::AgentError {
                        action: "keyboard_action".to_string(),
                        error: format!("malformed payload: {}", e),
                    });
                    return;
                }
            };
            if !manual_input_allowed(signals, loop_task) {
                let _ = events_tx.send(SessionEvent::AgentError {
                    action: "keyboard_action".to_string(),
                    error: "manual input is only accepted while the agent is paused or idle"
                        .to_string(),
                });
                return;
            }
            if let Err(e) = adapter.keyboard_action(&action).await {
                tracing::warn!("Keyboard passthrough failed: {}", e);
                let _ = events_tx.send(SessionEvent::AgentError {
                    action: "keyboard_action".to_string(),
                    error: e.to_string(),
                });
            }
        }
        other => {
            tracing::warn!(message_type = %other, "Unknown inbound message type");
        }
    }
}

/// Manual input is for the human: accepted while the loop is paused for
/// intervention or has no task running, rejected mid-automation so the two
/// drivers do not fight over the page.
fn manual_input_allowed(signals: &SignalState, loop_task: &Option<JoinHandle<()>>) -> bool {
    signals.is_paused() || !loop_running(loop_task)
}
