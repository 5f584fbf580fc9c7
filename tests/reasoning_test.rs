mod helpers;

use memoria::graph::types::{entity_id, EntityType, RelationType};
use memoria::memory::types::{NewMemory, Source};

use helpers::{test_engine, IDLE};

#[tokio::test]
async fn habits_explain_their_effects() {
    let engine = test_engine();
    for text in [
        "Evening walk improves sleep",
        "Evening walk improves my sleep.",
        "Evening walk prevents stress",
        "Evening walk in the park",
    ] {
        engine
            .ingest(NewMemory::new(text, Source::Habit).with_metadata("habit", "evening walk"))
            .await
            .unwrap();
    }
    engine
        .ingest(NewMemory::new("Poor sleep causes headaches", Source::Voice))
        .await
        .unwrap();
    assert!(engine.wait_idle(IDLE).await);

    let walk = entity_id(EntityType::Habit, "evening walk");
    let reasoning = engine.reason(&walk).await.unwrap();

    let sleep = reasoning
        .relationships
        .iter()
        .find(|e| e.target.label == "sleep")
        .unwrap();
    assert_eq!(sleep.relation, RelationType::Improves);
    assert_eq!(sleep.evidence_count, 2);
    assert!(reasoning
        .relationships
        .iter()
        .any(|e| e.relation == RelationType::OccursAt && e.target.label == "park"));
    assert!(!reasoning.suggested_actions.is_empty());
    assert!(reasoning.impacts.iter().all(|i| i.depth <= 3));

    // A full rebuild over the same records adds no evidence.
    let report = engine.build_graph().await.unwrap();
    assert_eq!(report.new_evidence, 0);
    let again = engine.reason(&walk).await.unwrap();
    let sleep_again = again
        .relationships
        .iter()
        .find(|e| e.target.label == "sleep")
        .unwrap();
    assert_eq!(sleep_again.evidence_count, 2);
    engine.shutdown().await;
}
