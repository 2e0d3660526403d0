//! Property-based tests over the invariants listed in spec §8.
//!
//! Random sequences of register/create/tick/complete/fail operations
//! are replayed against a real `Coordinator` backed by a temp
//! directory, and invariants 1, 2, and 5 are checked after every step.
//! Modeled on the teacher's `tests/property_based_agent_coordination.rs`
//! pattern: a sync `proptest::test_runner::TestRunner` driving an async
//! body via a fresh `tokio::runtime::Runtime`.

use fleet_coordinator::{Coordinator, CoordinatorConfig, NewTask, Priority, TaskStatus};
use proptest::prelude::*;
use proptest::test_runner::TestCaseError;
use proptest_derive::Arbitrary;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, Arbitrary)]
enum Op {
    RegisterAgent,
    CreateTask {
        #[proptest(strategy = "priority_strategy()")]
        priority: Priority,
        depend_on_prev: bool,
    },
    Tick,
    ResolvePending { succeed: bool },
}

fn priority_strategy() -> impl Strategy<Value = Priority> {
    prop_oneof![
        Just(Priority::Critical),
        Just(Priority::High),
        Just(Priority::Normal),
        Just(Priority::Low),
    ]
}

/// After every operation: invariant 1 (assigned/in_progress task has a
/// resolvable agent whose `current_task` agrees), invariant 2 (queue
/// membership iff pending), invariant 5 (`attempts <= max_attempts`).
async fn check_invariants(coordinator: &Coordinator) -> Result<(), String> {
    let state = coordinator.get_state().await.ok_or("no state")?;

    for task in state.tasks.values() {
        if matches!(task.status, TaskStatus::Assigned | TaskStatus::InProgress) {
            let agent_id = task
                .assigned_agent
                .as_ref()
                .ok_or_else(|| format!("task {} assigned/in_progress with no assignedAgent", task.id))?;
            let agent = state
                .agents
                .get(agent_id)
                .ok_or_else(|| format!("task {} assignedAgent {} does not exist", task.id, agent_id))?;
            if agent.current_task.as_deref() != Some(task.id.as_str()) {
                return Err(format!(
                    "agent {} current_task {:?} disagrees with task {}",
                    agent_id, agent.current_task, task.id
                ));
            }
        }

        let in_queue = state.task_queue.contains(&task.id);
        let is_pending = task.status == TaskStatus::Pending;
        if in_queue != is_pending {
            return Err(format!(
                "task {} status={:?} in_queue={} violates invariant 2",
                task.id, task.status, in_queue
            ));
        }

        if task.attempts > task.max_attempts {
            return Err(format!("task {} attempts {} exceeds max_attempts {}", task.id, task.attempts, task.max_attempts));
        }
        if task.status == TaskStatus::Failed && task.attempts != task.max_attempts {
            return Err(format!(
                "task {} terminal failed with attempts {} != max_attempts {}",
                task.id, task.attempts, task.max_attempts
            ));
        }
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 24, .. ProptestConfig::default() })]

    #[test]
    fn invariants_hold_after_every_operation(ops in prop::collection::vec(any::<Op>(), 1..30)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let config = CoordinatorConfig { heartbeat_interval_ms: 50, ..CoordinatorConfig::default() };
            let coordinator = Coordinator::new(dir.path(), config).unwrap();
            coordinator.initialize().await.unwrap();

            let mut last_task_id: Option<String> = None;
            let mut agent_counter = 0u32;

            for op in ops {
                match op {
                    Op::RegisterAgent => {
                        agent_counter += 1;
                        let _ = coordinator
                            .register_agent(format!("agent-{agent_counter}"), "/work".into(), BTreeSet::new())
                            .await;
                    }
                    Op::CreateTask { priority, depend_on_prev } => {
                        let depends_on = if depend_on_prev {
                            last_task_id.clone().into_iter().collect()
                        } else {
                            Vec::new()
                        };
                        if let Ok(task) = coordinator
                            .create_task(NewTask { title: "t".into(), priority, depends_on, ..Default::default() })
                            .await
                        {
                            last_task_id = Some(task.id);
                        }
                    }
                    Op::Tick => {
                        let _ = coordinator.tick().await;
                    }
                    Op::ResolvePending { succeed } => {
                        let tasks = coordinator.get_tasks().await;
                        if let Some(task) = tasks
                            .iter()
                            .find(|t| matches!(t.status, TaskStatus::Assigned | TaskStatus::InProgress))
                        {
                            let agent_id = task.assigned_agent.clone().unwrap();
                            if succeed {
                                let _ = coordinator.complete_task(&task.id, &agent_id, Default::default()).await;
                            } else {
                                let _ = coordinator.fail_task(&task.id, &agent_id, "induced failure".into()).await;
                            }
                        }
                    }
                }

                check_invariants(&coordinator).await.map_err(|e| TestCaseError::Fail(e.into()))?;
            }
            Ok::<(), TestCaseError>(())
        })?;
    }
}
