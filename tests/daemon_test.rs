//! Hub-level flow: registry + services + command surface, end to end.

use std::sync::Arc;

use factoryd::agent::mock::MockEngine;
use factoryd::agent::SessionStore;
use factoryd::config::Settings;
use factoryd::hub::IntegrationHub;
use factoryd::tasks::model::{valid_transition, Actor, Phase};
use factoryd::tasks::store::{CreateTaskRequest, UpdateTaskRequest};
use factoryd::tasks::TaskScope;
use factoryd::workspace::WorkspaceRegistry;

async fn build_hub(dir: &std::path::Path) -> (Arc<IntegrationHub>, String) {
    let home = dir.join("home");
    let project = dir.join("proj");
    tokio::fs::create_dir_all(&project).await.unwrap();

    let registry = Arc::new(WorkspaceRegistry::open(&home).await.unwrap());
    let workspace = registry
        .create_workspace(&project, Some("proj".into()))
        .await
        .unwrap();

    let engine_dir = dir.join("engine-sessions");
    let hub = Arc::new(IntegrationHub::new(
        registry,
        Settings::for_data_home(&home),
        Box::new(move |_ws| Arc::new(MockEngine::new(&engine_dir)) as Arc<dyn SessionStore>),
    ));
    (hub, workspace.id)
}

#[tokio::test]
async fn full_lifecycle_through_the_command_surface() {
    let dir = tempfile::tempdir().unwrap();
    let (hub, workspace_id) = build_hub(dir.path()).await;
    let services = hub.services(&workspace_id).await.unwrap();

    // create -> update criteria -> ready -> executing -> complete
    let task = services
        .create_task(CreateTaskRequest {
            description: "cross every phase".into(),
            planning_skipped: Some(true),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(task.id(), "PROJ-1");
    assert_eq!(task.phase(), Phase::Backlog);

    services
        .update_task(
            task.id(),
            UpdateTaskRequest {
                acceptance_criteria: Some(vec![
                    factoryd::tasks::model::AcceptanceCriterion::new("a"),
                ]),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    services
        .move_task(task.id(), Phase::Ready, Actor::User, None)
        .await
        .unwrap();
    services
        .move_task(task.id(), Phase::Executing, Actor::User, None)
        .await
        .unwrap();
    let done = services
        .move_task(task.id(), Phase::Complete, Actor::User, None)
        .await
        .unwrap();

    assert_eq!(done.history.len(), 3);
    for entry in &done.history {
        assert!(valid_transition(entry.from, entry.to));
    }
    let cycle = done.frontmatter.cycle_time.unwrap();
    let lead = done.frontmatter.lead_time.unwrap();
    assert!(cycle >= 0);
    assert!(lead >= cycle);

    // Activity log observed every phase change, in order.
    let entries = services.core.activity.replay(50, None).await.unwrap();
    let phase_changes: Vec<String> = entries
        .iter()
        .filter_map(|e| match e {
            factoryd::activity::ActivityEntry::SystemEvent(s)
                if s.event == factoryd::activity::SystemEventKind::PhaseChange =>
            {
                Some(s.message.clone())
            }
            _ => None,
        })
        .collect();
    assert_eq!(phase_changes.len(), 4); // created + three moves
    assert!(phase_changes[1].contains("backlog -> ready"));
    assert!(phase_changes[3].contains("executing -> complete"));

    hub.shutdown().await;
}

#[tokio::test]
async fn services_are_reused_per_workspace() {
    let dir = tempfile::tempdir().unwrap();
    let (hub, workspace_id) = build_hub(dir.path()).await;

    let first = hub.services(&workspace_id).await.unwrap();
    let second = hub.services(&workspace_id).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    let err = hub.services("missing").await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn delete_task_removes_directory_and_kicks() {
    let dir = tempfile::tempdir().unwrap();
    let (hub, workspace_id) = build_hub(dir.path()).await;
    let services = hub.services(&workspace_id).await.unwrap();

    let task = services
        .create_task(CreateTaskRequest {
            description: "short lived".into(),
            planning_skipped: Some(true),
            ..Default::default()
        })
        .await
        .unwrap();
    let task_dir = task.dir().to_path_buf();
    assert!(task_dir.exists());

    services.delete_task(task.id()).await.unwrap();
    assert!(!task_dir.exists());
    assert!(services.list_tasks(TaskScope::All).await.unwrap().is_empty());

    // Ids are never reused even after deletion.
    let next = services
        .create_task(CreateTaskRequest {
            description: "successor".into(),
            planning_skipped: Some(true),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(next.id(), "PROJ-2");
}

#[tokio::test]
async fn evicting_a_workspace_stops_its_services() {
    let dir = tempfile::tempdir().unwrap();
    let (hub, workspace_id) = build_hub(dir.path()).await;
    let _ = hub.services(&workspace_id).await.unwrap();
    assert_eq!(hub.started_workspaces().await.len(), 1);

    hub.evict(&workspace_id).await;
    assert!(hub.started_workspaces().await.is_empty());
}
