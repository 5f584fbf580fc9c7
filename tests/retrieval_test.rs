mod helpers;

use memoria::memory::types::{NewMemory, Source};
use memoria::retrieval::RetrieveRequest;

use helpers::{engine_with, test_config, test_conn, test_engine, IDLE};

/// `tokens * 4` characters, i.e. exactly `tokens` estimated tokens.
fn text_of(tokens: usize, word: &str) -> String {
    let mut s = String::new();
    while s.len() < tokens * 4 {
        s.push_str(word);
        s.push(' ');
    }
    s.truncate(tokens * 4);
    s
}

#[tokio::test]
async fn budget_packs_best_first_and_stops_at_overflow() {
    let mut config = test_config();
    config.retrieval.similarity_weight = 0.0;
    config.retrieval.recency_weight = 0.0;
    config.retrieval.importance_weight = 1.0;
    let engine = engine_with(config, test_conn());
    engine.start_workers();

    let a = engine
        .ingest(NewMemory::new(text_of(40, "alpha"), Source::Chat).with_importance(0.9))
        .await
        .unwrap();
    let b = engine
        .ingest(NewMemory::new(text_of(40, "bravo"), Source::Chat).with_importance(0.6))
        .await
        .unwrap();
    engine
        .ingest(NewMemory::new(text_of(40, "charlie"), Source::Chat).with_importance(0.3))
        .await
        .unwrap();
    assert!(engine.wait_idle(IDLE).await);

    let resp = engine
        .retrieve(RetrieveRequest {
            k: Some(10),
            token_budget: Some(100),
            ..RetrieveRequest::new("alpha bravo charlie")
        })
        .await
        .unwrap();
    let ids: Vec<&str> = resp.results.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, [a.id.as_str(), b.id.as_str()]);
    assert_eq!(resp.token_estimate, 80);
    assert_eq!(resp.total_candidates, 3);
    assert!(!resp.degraded);
    engine.shutdown().await;
}

#[tokio::test]
async fn retrieval_is_deterministic() {
    let engine = test_engine();
    for (text, source) in [
        ("Took 10mg lisinopril with breakfast", Source::Medication),
        ("Morning run around the lake", Source::Habit),
        ("Lisinopril refill picked up at the pharmacy", Source::Medication),
        ("Paid rent for October", Source::Finance),
        ("Dinner with Ana at the harbour", Source::Chat),
    ] {
        engine.ingest(NewMemory::new(text, source)).await.unwrap();
    }
    assert!(engine.wait_idle(IDLE).await);

    let mut runs = Vec::new();
    for _ in 0..2 {
        let resp = engine.retrieve(RetrieveRequest::new("lisinopril")).await.unwrap();
        runs.push(
            resp.results
                .into_iter()
                .map(|r| r.id)
                .collect::<Vec<_>>(),
        );
    }
    let (first, second) = (&runs[0], &runs[1]);
    assert!(!first.is_empty());
    assert_eq!(first, second);
    engine.shutdown().await;
}

#[tokio::test]
async fn results_never_exceed_budget_or_k() {
    let engine = test_engine();
    for i in 0..12 {
        engine
            .ingest(NewMemory::new(format!("walked the dog in the park, day {i}"), Source::Habit))
            .await
            .unwrap();
    }
    assert!(engine.wait_idle(IDLE).await);

    for (k, budget) in [(3, 1000), (10, 25), (12, 0)] {
        let resp = engine
            .retrieve(RetrieveRequest {
                k: Some(k),
                token_budget: Some(budget),
                ..RetrieveRequest::new("dog park walk")
            })
            .await
            .unwrap();
        assert!(resp.results.len() <= k);
        assert!(resp.token_estimate <= budget);
        let sum: usize = resp.results.iter().map(|r| r.tokens).sum();
        assert_eq!(sum, resp.token_estimate);
    }
    engine.shutdown().await;
}

#[tokio::test]
async fn filters_by_source_and_user() {
    let engine = test_engine();
    engine
        .ingest(NewMemory::new("coffee at the corner cafe", Source::Finance).with_user("sam"))
        .await
        .unwrap();
    let mine = engine
        .ingest(NewMemory::new("coffee with Ana", Source::Chat).with_user("sam"))
        .await
        .unwrap();
    engine
        .ingest(NewMemory::new("coffee with Ana", Source::Chat).with_user("lee"))
        .await
        .unwrap();
    assert!(engine.wait_idle(IDLE).await);

    let resp = engine
        .retrieve(RetrieveRequest {
            user: Some("sam".into()),
            sources: vec![Source::Chat],
            ..RetrieveRequest::new("coffee")
        })
        .await
        .unwrap();
    let ids: Vec<&str> = resp.results.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, [mine.id.as_str()]);
    engine.shutdown().await;
}
