mod helpers;

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use memoria::config::IndexConfig;
use memoria::index::PartitionedIndex;
use memoria::memory::partition::{PartitionKey, TimeBucket};
use memoria::memory::store::{MemoryStore, StoreOptions};
use memoria::memory::types::{MemoryFilter, NewMemory, Source};

use helpers::{seeded_vector, test_conn, MODEL};

fn graph_config() -> IndexConfig {
    IndexConfig {
        exact_search_below: 0,
        ef_search: 128,
        ..IndexConfig::default()
    }
}

#[test]
fn own_vector_top1_matches_brute_force() {
    let store = MemoryStore::new(test_conn(), StoreOptions::default());
    let index = PartitionedIndex::new(store.clone(), &graph_config(), None);

    let mut records = Vec::new();
    for i in 0..120u64 {
        let record = store
            .create(
                NewMemory::new(format!("note {i}"), Source::Chat)
                    .with_embedding(seeded_vector(i), MODEL),
            )
            .unwrap();
        let vector = record.embedding.clone().unwrap();
        index.insert(&record.partition_key, &record.id, vector).unwrap();
        records.push(record);
    }
    let partition = records[0].partition_key.clone();
    assert_eq!(index.apply_pending(&partition), 120);

    let filter = MemoryFilter::default();
    for record in records.iter().step_by(7) {
        let query = record.embedding.as_ref().unwrap();
        let ann = index.search(query, 1, &filter, None);
        let exact = store.brute_force_search(query, 1, &filter, None).unwrap();
        assert!(!ann.degraded);
        assert_eq!(ann.hits[0].0, exact[0].0);
        assert_eq!(ann.hits[0].0, record.id);
    }
}

#[test]
fn deleted_records_leave_search() {
    let store = MemoryStore::new(test_conn(), StoreOptions::default());
    let index = Arc::new(PartitionedIndex::new(store.clone(), &IndexConfig::default(), None));

    let keep = store
        .create(NewMemory::new("keep", Source::Habit).with_embedding(seeded_vector(1), MODEL))
        .unwrap();
    let gone = store
        .create(NewMemory::new("gone", Source::Habit).with_embedding(seeded_vector(2), MODEL))
        .unwrap();
    for r in [&keep, &gone] {
        index
            .insert(&r.partition_key, &r.id, r.embedding.clone().unwrap())
            .unwrap();
    }
    index.apply_pending(&keep.partition_key);

    store.soft_delete(&gone.id).unwrap();
    index.remove(&gone.partition_key, &gone.id);

    let hits = index
        .search(gone.embedding.as_ref().unwrap(), 5, &MemoryFilter::default(), None)
        .hits;
    assert!(hits.iter().all(|(id, _)| id != &gone.id));
    assert!(hits.iter().any(|(id, _)| id == &keep.id));
}

#[test]
fn partitioning_is_deterministic() {
    let at = Utc.with_ymd_and_hms(2026, 10, 16, 8, 30, 0).unwrap();
    let a = PartitionKey::derive("sam", Source::Medication, at, TimeBucket::Week);
    let b = PartitionKey::derive("sam", Source::Medication, at, TimeBucket::Week);
    assert_eq!(a, b);
    assert_eq!(a.as_str(), "sam/medication/2026-W42");
    assert_eq!(
        PartitionKey::derive("sam", Source::Medication, at, TimeBucket::Day).as_str(),
        "sam/medication/2026-10-16"
    );
    assert_eq!(
        PartitionKey::derive("sam", Source::Medication, at, TimeBucket::Month).as_str(),
        "sam/medication/2026-10"
    );

    // The store assigns the same key from the record's own fields.
    let store = MemoryStore::new(test_conn(), StoreOptions::default());
    let record = store
        .create(
            NewMemory::new("Took lisinopril", Source::Medication)
                .with_user("sam")
                .created_at(at),
        )
        .unwrap();
    assert_eq!(record.partition_key, a);
}

#[test]
fn partitions_are_searched_in_isolation_by_filter() {
    let store = MemoryStore::new(test_conn(), StoreOptions::default());
    let index = PartitionedIndex::new(store.clone(), &IndexConfig::default(), None);

    let v = seeded_vector(9);
    let med = store
        .create(NewMemory::new("med", Source::Medication).with_embedding(v.clone(), MODEL))
        .unwrap();
    let fin = store
        .create(NewMemory::new("fin", Source::Finance).with_embedding(v.clone(), MODEL))
        .unwrap();
    for r in [&med, &fin] {
        index
            .insert(&r.partition_key, &r.id, r.embedding.clone().unwrap())
            .unwrap();
    }
    assert_ne!(med.partition_key, fin.partition_key);
    assert_eq!(index.health().shard_count, 2);

    let filter = MemoryFilter {
        sources: vec![Source::Finance],
        ..MemoryFilter::default()
    };
    let hits = index.search(&v, 5, &filter, None).hits;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].0, fin.id);
}
