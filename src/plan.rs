//! In-memory plan stack: goals, subgoals, and advisory timeout bookkeeping.
//!
//! The plan store is pure data - it performs no I/O and never forces a
//! transition on its own. Timeout checks return human-readable warnings that
//! the control loop surfaces to the LLM as context; every state change goes
//! through the explicit mutation operations below.
//!
//! # Invariants
//! - At most one subgoal per goal holds `Current` status.
//! - Done subgoals keep their position and never regain Pending/Current.
//! - Read accessors hand out copies; callers cannot alias internal state.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::config::PlanConfig;

/// Status of a single subgoal within a goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubgoalStatus {
    Pending,
    Current,
    Done,
}

/// A self-contained step within a goal.
#[derive(Debug, Clone, Serialize)]
pub struct Subgoal {
    pub description: String,
    pub status: SubgoalStatus,
    pub started_at: Option<DateTime<Utc>>,
}

impl Subgoal {
    fn pending(description: String) -> Self {
        Self {
            description,
            status: SubgoalStatus::Pending,
            started_at: None,
        }
    }

    fn promote(&mut self) {
        self.status = SubgoalStatus::Current;
        self.started_at = Some(Utc::now());
    }
}

/// One instruction's execution record: subgoal breakdown plus logs.
#[derive(Debug, Clone, Serialize)]
pub struct Goal {
    pub text: String,
    pub subgoals: Vec<Subgoal>,
    pub action_log: Vec<String>,
    pub notes: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Goal {
    fn new(text: String) -> Self {
        Self {
            text,
            subgoals: Vec::new(),
            action_log: Vec::new(),
            notes: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Index of the subgoal currently holding `Current`, if any.
    fn current_index(&self) -> Option<usize> {
        self.subgoals
            .iter()
            .position(|s| s.status == SubgoalStatus::Current)
    }
}

/// Outcome of [`PlanStore::complete_subgoal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubgoalCompletion {
    /// No subgoal was current; nothing changed.
    NoCurrent,
    /// The current subgoal finished and the next pending one took over.
    Advanced,
    /// Every subgoal is done; the goal's `completed_at` is now set.
    GoalFinished,
}

/// Stack of goals with bounded-depth subgoal expansion.
#[derive(Debug)]
pub struct PlanStore {
    stack: Vec<Goal>,
    max_depth: usize,
    goal_timeout: Duration,
    subgoal_timeout: Duration,
}

impl PlanStore {
    pub fn new(config: &PlanConfig) -> Self {
        Self {
            stack: Vec::new(),
            max_depth: config.max_depth,
            goal_timeout: Duration::seconds(config.goal_timeout_secs),
            subgoal_timeout: Duration::seconds(config.subgoal_timeout_secs),
        }
    }

    /// Push a new goal onto the stack. Always succeeds; a follow-up
    /// instruction stacks on top of unfinished work instead of replacing it.
    pub fn push_goal(&mut self, text: impl Into<String>) {
        self.stack.push(Goal::new(text.into()));
    }

    /// Replace the pending tail of the current goal's subgoal list.
    ///
    /// Keeps every subgoal up to and including the current one - or, when
    /// nothing is current, the finished prefix - appends the new entries as
    /// pending, and promotes the first new entry only when nothing was
    /// current before. Returns whether the list was applied; refuses on an
    /// empty stack, an empty (post-trim) list, or when the stack already
    /// sits at max depth.
    pub fn update_subgoals(&mut self, descriptions: Vec<String>) -> bool {
        if self.stack.len() >= self.max_depth {
            tracing::warn!(
                depth = self.stack.len(),
                "refusing subgoal update at max plan depth"
            );
            return false;
        }
        let trimmed: Vec<String> = descriptions
            .into_iter()
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty())
            .collect();
        if trimmed.is_empty() {
            return false;
        }
        let Some(goal) = self.stack.last_mut() else {
            return false;
        };

        let had_current = goal.current_index();
        let keep = match had_current {
            Some(i) => i + 1,
            // No current (e.g. after pruning it): the finished prefix is
            // history and must survive the update.
            None => goal
                .subgoals
                .iter()
                .take_while(|s| s.status == SubgoalStatus::Done)
                .count(),
        };
        goal.subgoals.truncate(keep);
        goal.subgoals
            .extend(trimmed.into_iter().map(Subgoal::pending));

        if had_current.is_none() {
            if let Some(first) = goal.subgoals.get_mut(keep) {
                first.promote();
            }
        }
        true
    }

    /// Mark the current subgoal done and advance to the next pending one.
    pub fn complete_subgoal(&mut self) -> SubgoalCompletion {
        let Some(goal) = self.stack.last_mut() else {
            return SubgoalCompletion::NoCurrent;
        };
        let Some(idx) = goal.current_index() else {
            return SubgoalCompletion::NoCurrent;
        };

        goal.subgoals[idx].status = SubgoalStatus::Done;
        if let Some(next) = goal
            .subgoals
            .iter_mut()
            .skip(idx + 1)
            .find(|s| s.status == SubgoalStatus::Pending)
        {
            next.promote();
            return SubgoalCompletion::Advanced;
        }

        if goal.subgoals.iter().all(|s| s.status == SubgoalStatus::Done) {
            goal.completed_at = Some(Utc::now());
            return SubgoalCompletion::GoalFinished;
        }
        SubgoalCompletion::Advanced
    }

    /// Drop the last subgoal. Returns whether anything was removed.
    ///
    /// If the removed entry held `Current`, the new last entry is re-elected
    /// only when it is still pending - a done subgoal never regains current
    /// status.
    pub fn prune_subgoal(&mut self) -> bool {
        let Some(goal) = self.stack.last_mut() else {
            return false;
        };
        let Some(removed) = goal.subgoals.pop() else {
            return false;
        };
        if removed.status == SubgoalStatus::Current {
            if let Some(last) = goal.subgoals.last_mut() {
                if last.status == SubgoalStatus::Pending {
                    last.promote();
                }
            }
        }
        true
    }

    /// Pop the top goal if - and only if - it has been completed.
    pub fn pop_completed_goal(&mut self) -> bool {
        if self
            .stack
            .last()
            .map(|g| g.completed_at.is_some())
            .unwrap_or(false)
        {
            self.stack.pop();
            true
        } else {
            false
        }
    }

    /// Advisory timeout warnings for the current goal and subgoal.
    ///
    /// Pure read: surfaced to the LLM so it can self-correct; nothing is
    /// mutated and nothing terminates.
    pub fn check_timeouts(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        let Some(goal) = self.stack.last() else {
            return warnings;
        };
        if goal.completed_at.is_none() {
            let elapsed = Utc::now() - goal.started_at;
            if elapsed > self.goal_timeout {
                warnings.push(format!(
                    "The goal has been running for {}s (limit {}s). Consider wrapping up or calling stop().",
                    elapsed.num_seconds(),
                    self.goal_timeout.num_seconds()
                ));
            }
        }
        if let Some(idx) = goal.current_index() {
            if let Some(started) = goal.subgoals[idx].started_at {
                let elapsed = Utc::now() - started;
                if elapsed > self.subgoal_timeout {
                    warnings.push(format!(
                        "Subgoal \"{}\" has been active for {}s (limit {}s). Complete it, prune it, or take another approach.",
                        goal.subgoals[idx].description,
                        elapsed.num_seconds(),
                        self.subgoal_timeout.num_seconds()
                    ));
                }
            }
        }
        warnings
    }

    /// Append an action-log entry to the current goal.
    pub fn log_action(&mut self, entry: impl Into<String>) {
        if let Some(goal) = self.stack.last_mut() {
            goal.action_log.push(entry.into());
        }
    }

    /// Append a note to the current goal.
    pub fn add_note(&mut self, note: impl Into<String>) {
        if let Some(goal) = self.stack.last_mut() {
            goal.notes.push(note.into());
        }
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    /// Copy of the current (top) goal.
    pub fn current_goal(&self) -> Option<Goal> {
        self.stack.last().cloned()
    }

    /// Copy of the full goal stack, oldest first.
    pub fn goals(&self) -> Vec<Goal> {
        self.stack.clone()
    }

    /// One status line per subgoal of the current goal.
    pub fn subgoal_summary(&self) -> Vec<String> {
        let Some(goal) = self.stack.last() else {
            return Vec::new();
        };
        goal.subgoals
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let marker = match s.status {
                    SubgoalStatus::Pending => "pending",
                    SubgoalStatus::Current => "current",
                    SubgoalStatus::Done => "done",
                };
                format!("{}. [{}] {}", i + 1, marker, s.description)
            })
            .collect()
    }

    /// Last `n` action-log entries of the current goal.
    pub fn recent_actions(&self, n: usize) -> Vec<String> {
        self.stack
            .last()
            .map(|g| {
                let skip = g.action_log.len().saturating_sub(n);
                g.action_log[skip..].to_vec()
            })
            .unwrap_or_default()
    }

    /// Last `n` notes of the current goal.
    pub fn recent_notes(&self, n: usize) -> Vec<String> {
        self.stack
            .last()
            .map(|g| {
                let skip = g.notes.len().saturating_sub(n);
                g.notes[skip..].to_vec()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> PlanStore {
        PlanStore::new(&PlanConfig::default())
    }

    fn current_count(store: &PlanStore) -> usize {
        store
            .current_goal()
            .map(|g| {
                g.subgoals
                    .iter()
                    .filter(|s| s.status == SubgoalStatus::Current)
                    .count()
            })
            .unwrap_or(0)
    }

    #[test]
    fn branch_on_fresh_goal_promotes_first_entry() {
        let mut plan = store();
        plan.push_goal("compare prices");
        assert!(plan.update_subgoals(vec![
            "find price".to_string(),
            "compare shipping".to_string()
        ]));

        let goal = plan.current_goal().unwrap();
        assert_eq!(goal.subgoals.len(), 2);
        assert_eq!(goal.subgoals[0].status, SubgoalStatus::Current);
        assert!(goal.subgoals[0].started_at.is_some());
        assert_eq!(goal.subgoals[1].status, SubgoalStatus::Pending);
    }

    #[test]
    fn at_most_one_current_across_mutations() {
        let mut plan = store();
        plan.push_goal("goal");
        plan.update_subgoals(vec!["a".into(), "b".into(), "c".into()]);
        assert_eq!(current_count(&plan), 1);

        plan.complete_subgoal();
        assert_eq!(current_count(&plan), 1);

        plan.update_subgoals(vec!["d".into(), "e".into()]);
        assert_eq!(current_count(&plan), 1);

        plan.prune_subgoal();
        assert!(current_count(&plan) <= 1);

        plan.complete_subgoal();
        assert!(current_count(&plan) <= 1);
    }

    #[test]
    fn update_preserves_done_prefix_and_current() {
        let mut plan = store();
        plan.push_goal("goal");
        plan.update_subgoals(vec!["a".into(), "b".into()]);
        plan.complete_subgoal(); // a done, b current

        plan.update_subgoals(vec!["c".into(), "d".into()]);
        let goal = plan.current_goal().unwrap();
        let descriptions: Vec<&str> = goal.subgoals.iter().map(|s| s.description.as_str()).collect();
        assert_eq!(descriptions, vec!["a", "b", "c", "d"]);
        assert_eq!(goal.subgoals[0].status, SubgoalStatus::Done);
        assert_eq!(goal.subgoals[1].status, SubgoalStatus::Current);
        assert_eq!(goal.subgoals[2].status, SubgoalStatus::Pending);

        // Repeating the update never loses the done or current entries.
        plan.update_subgoals(vec!["c".into(), "d".into()]);
        let goal = plan.current_goal().unwrap();
        assert_eq!(goal.subgoals[0].status, SubgoalStatus::Done);
        assert_eq!(goal.subgoals[1].status, SubgoalStatus::Current);
    }

    #[test]
    fn branch_after_pruning_current_keeps_done_prefix() {
        let mut plan = store();
        plan.push_goal("goal");
        plan.update_subgoals(vec!["a".into(), "b".into()]);
        plan.complete_subgoal(); // a done, b current
        plan.prune_subgoal(); // b removed; a stays done, nothing current

        assert!(plan.update_subgoals(vec!["c".into()]));
        let goal = plan.current_goal().unwrap();
        let descriptions: Vec<&str> =
            goal.subgoals.iter().map(|s| s.description.as_str()).collect();
        assert_eq!(descriptions, vec!["a", "c"]);
        assert_eq!(goal.subgoals[0].status, SubgoalStatus::Done);
        assert_eq!(goal.subgoals[1].status, SubgoalStatus::Current);
        assert!(goal.subgoals[1].started_at.is_some());
    }

    #[test]
    fn update_ignores_blank_entries() {
        let mut plan = store();
        plan.push_goal("goal");
        assert!(!plan.update_subgoals(vec!["  ".into(), "".into()]));
        assert!(plan.current_goal().unwrap().subgoals.is_empty());
    }

    #[test]
    fn update_without_goal_is_noop() {
        let mut plan = store();
        assert!(!plan.update_subgoals(vec!["a".into()]));
    }

    #[test]
    fn completing_all_subgoals_finishes_goal_and_pop_removes_it() {
        let mut plan = store();
        plan.push_goal("outer");
        plan.push_goal("inner");
        plan.update_subgoals(vec!["a".into(), "b".into()]);

        assert_eq!(plan.complete_subgoal(), SubgoalCompletion::Advanced);
        assert_eq!(plan.complete_subgoal(), SubgoalCompletion::GoalFinished);
        assert!(plan.current_goal().unwrap().completed_at.is_some());

        assert!(plan.pop_completed_goal());
        assert_eq!(plan.depth(), 1);
        assert_eq!(plan.current_goal().unwrap().text, "outer");
        // The remaining goal is not completed, so another pop is a no-op.
        assert!(!plan.pop_completed_goal());
        assert_eq!(plan.depth(), 1);
    }

    #[test]
    fn complete_without_current_reports_no_current() {
        let mut plan = store();
        plan.push_goal("goal");
        assert_eq!(plan.complete_subgoal(), SubgoalCompletion::NoCurrent);
    }

    #[test]
    fn done_subgoals_never_regain_status() {
        let mut plan = store();
        plan.push_goal("goal");
        plan.update_subgoals(vec!["a".into(), "b".into()]);
        plan.complete_subgoal(); // a done, b current

        // Prune removes b (current); a is done and must stay done.
        assert!(plan.prune_subgoal());
        let goal = plan.current_goal().unwrap();
        assert_eq!(goal.subgoals.len(), 1);
        assert_eq!(goal.subgoals[0].status, SubgoalStatus::Done);
    }

    #[test]
    fn prune_drops_tail_first_then_current() {
        let mut plan = store();
        plan.push_goal("goal");
        plan.update_subgoals(vec!["a".into()]);
        plan.update_subgoals(vec!["b".into()]);
        // a current, b pending
        let goal = plan.current_goal().unwrap();
        assert_eq!(goal.subgoals[0].status, SubgoalStatus::Current);

        // Remove the pending tail first: current stays put.
        assert!(plan.prune_subgoal());
        assert_eq!(current_count(&plan), 1);

        // Now removing the current one leaves an empty list.
        assert!(plan.prune_subgoal());
        assert!(plan.current_goal().unwrap().subgoals.is_empty());
    }

    #[test]
    fn repeated_prune_on_short_list_never_panics() {
        let mut plan = store();
        plan.push_goal("goal");
        plan.update_subgoals(vec!["a".into(), "b".into()]);
        for _ in 0..4 {
            plan.prune_subgoal();
        }
        assert!(plan.current_goal().unwrap().subgoals.is_empty());
        assert!(!plan.prune_subgoal());
    }

    #[test]
    fn subgoal_update_refused_at_max_depth() {
        let mut plan = store();
        for i in 0..5 {
            plan.push_goal(format!("goal {}", i));
        }
        assert_eq!(plan.depth(), 5);
        assert!(!plan.update_subgoals(vec!["too deep".into()]));
        assert!(plan.current_goal().unwrap().subgoals.is_empty());
    }

    #[test]
    fn accessors_return_defensive_copies() {
        let mut plan = store();
        plan.push_goal("goal");
        plan.update_subgoals(vec!["a".into()]);

        let mut copy = plan.goals();
        copy[0].subgoals.clear();
        copy[0].action_log.push("tampered".into());

        let goal = plan.current_goal().unwrap();
        assert_eq!(goal.subgoals.len(), 1);
        assert!(goal.action_log.is_empty());
    }

    #[test]
    fn timeout_warnings_are_advisory_and_empty_when_fresh() {
        let mut plan = store();
        plan.push_goal("goal");
        plan.update_subgoals(vec!["a".into()]);
        assert!(plan.check_timeouts().is_empty());

        // Warnings never mutate: state is identical after the check.
        let before = plan.goals();
        let _ = plan.check_timeouts();
        assert_eq!(before.len(), plan.goals().len());
    }

    #[test]
    fn action_log_and_notes_append_to_top_goal() {
        let mut plan = store();
        plan.log_action("ignored without goal");
        plan.push_goal("goal");
        plan.log_action("goto(https://example.com)");
        plan.add_note("landed on example.com");

        assert_eq!(plan.recent_actions(5), vec!["goto(https://example.com)"]);
        assert_eq!(plan.recent_notes(5), vec!["landed on example.com"]);
        assert_eq!(plan.recent_actions(0), Vec::<String>::new());
    }
}
