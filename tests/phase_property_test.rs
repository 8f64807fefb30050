//! Property: no sequence of move attempts can produce a history entry
//! outside the transition table, break timestamp ordering, or corrupt the
//! time accounting.

use proptest::prelude::*;

use factoryd::tasks::model::{valid_transition, Actor, Phase};
use factoryd::tasks::store::CreateTaskRequest;
use factoryd::tasks::TaskStore;

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 16,
        .. ProptestConfig::default()
    })]

    #[test]
    fn history_respects_the_transition_table(targets in prop::collection::vec(0usize..5, 1..12)) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async move {
            let dir = tempfile::tempdir().unwrap();
            let ws = dir.path().join("demo");
            let root = dir.path().join("artifacts");
            let store = TaskStore::new(&ws, &root, &root.join("tasks"));

            let mut task = store
                .create_task(CreateTaskRequest {
                    description: "property run".into(),
                    acceptance_criteria: vec!["holds".into()],
                    ..Default::default()
                })
                .await
                .unwrap();

            for index in targets {
                let target = Phase::all()[index];
                match store
                    .move_task_to_phase(&task, target, Actor::User, None, None)
                    .await
                {
                    Ok(moved) => task = moved,
                    Err(e) => assert!(
                        e.is_invalid_transition(),
                        "only transition errors expected, got {e}"
                    ),
                }
            }

            let reloaded = store.get_task(task.id()).await.unwrap();

            for entry in &reloaded.history {
                assert!(
                    valid_transition(entry.from, entry.to),
                    "history contains {} -> {}",
                    entry.from,
                    entry.to
                );
            }
            for pair in reloaded.history.windows(2) {
                assert!(pair[0].timestamp <= pair[1].timestamp);
            }

            let fm = &reloaded.frontmatter;
            if let (Some(completed), Some(started)) = (fm.completed, fm.started) {
                let cycle = fm.cycle_time.expect("cycle time set with both stamps");
                assert_eq!(cycle, (completed - started).num_seconds().max(0));
                assert!(cycle >= 0);
            }
            if let Some(lead) = fm.lead_time {
                assert!(lead >= 0);
                if let Some(cycle) = fm.cycle_time {
                    assert!(lead >= cycle);
                }
            }
        });
    }
}
