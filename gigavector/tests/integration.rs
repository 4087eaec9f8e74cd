//! End-to-end scenarios exercising the `Database` façade, its WAL recovery
//! path, and the MVCC conditional API together.

use gigavector::db::ConditionalItem;
use gigavector::{Database, DistanceMetric, HnswConfig, IndexKind, IvfPqConfig, Metadata, MutationCondition, MutationOutcome};
use std::sync::{Arc, Mutex};
use std::thread;
use tempfile::tempdir;

fn open(path: &std::path::Path, dim: usize) -> Database {
    Database::open(path, dim, DistanceMetric::Euclidean, IndexKind::Hnsw(HnswConfig::fast())).unwrap()
}

fn grid_samples(dim: usize, n: usize) -> Vec<Vec<f32>> {
    (0..n)
        .map(|i| (0..dim).map(|d| ((i * 7 + d * 3) % 97) as f32 / 97.0).collect())
        .collect()
}

#[test]
fn wal_recovery_matches_replaying_the_same_writes_onto_a_fresh_instance() {
    let dir = tempdir().unwrap();
    let snapshot_path = dir.path().join("a.gv");

    {
        let db = open(&snapshot_path, 2);
        db.add(vec![1.0, 1.0]).unwrap();
        db.add(vec![2.0, 2.0]).unwrap();
        db.save().unwrap();

        // Writes after the checkpoint only live in the WAL.
        db.add(vec![3.0, 3.0]).unwrap();
        let mut meta = Metadata::new();
        meta.set("k", "v");
        db.update_metadata(0, meta).unwrap();
        db.delete_by_id(1).unwrap();
    }

    let recovered = open(&snapshot_path, 2);
    assert_eq!(recovered.len(), 3);
    assert!(recovered.is_deleted(1).unwrap());
    assert_eq!(recovered.get_metadata(0).unwrap().get("k"), Some("v"));
    assert_eq!(recovered.get_vector(2).unwrap(), vec![3.0, 3.0]);
}

#[test]
fn insert_ids_are_strictly_increasing_starting_at_zero() {
    let db = Database::create_in_memory(4, DistanceMetric::Cosine, IndexKind::Hnsw(HnswConfig::fast())).unwrap();
    let ids: Vec<_> = (0..20).map(|i| db.add(vec![i as f32; 4]).unwrap()).collect();
    assert_eq!(ids, (0..20).collect::<Vec<_>>());
}

#[test]
fn successful_conditional_mutations_strictly_increase_the_version_and_never_decrease() {
    let db = Database::create_in_memory(2, DistanceMetric::Euclidean, IndexKind::Hnsw(HnswConfig::fast())).unwrap();
    let id = db.add(vec![0.0, 0.0]).unwrap();
    assert_eq!(db.get_version(id), Some(0));

    for expected in 0..4u64 {
        let outcome = db
            .conditional_update_vector(id, vec![expected as f32, 0.0], &[MutationCondition::VersionEq(expected)])
            .unwrap();
        assert_eq!(outcome, MutationOutcome::Ok);
        assert_eq!(db.get_version(id), Some(expected + 1));
    }

    // A stale version must not move the counter at all.
    let before = db.get_version(id);
    let outcome = db
        .conditional_update_vector(id, vec![99.0, 99.0], &[MutationCondition::VersionEq(1)])
        .unwrap();
    assert_eq!(outcome, MutationOutcome::Conflict);
    assert_eq!(db.get_version(id), before);
}

#[test]
fn soft_deleted_ids_never_reappear_in_search_and_reject_not_deleted_condition() {
    let db = Database::create_in_memory(2, DistanceMetric::Euclidean, IndexKind::Hnsw(HnswConfig::fast())).unwrap();
    let a = db.add(vec![0.0, 0.0]).unwrap();
    db.add(vec![5.0, 5.0]).unwrap();

    db.delete_by_id(a).unwrap();
    for _ in 0..5 {
        let results = db.search(&[0.0, 0.0], 10, None).unwrap();
        assert!(!results.iter().any(|r| r.id == a));
    }

    let outcome = db
        .conditional_delete(a, &[MutationCondition::NotDeleted])
        .unwrap();
    assert_eq!(outcome, MutationOutcome::Failed);
}

#[test]
fn filtered_search_only_returns_vectors_carrying_the_exact_pair() {
    let db = Database::create_in_memory(2, DistanceMetric::Euclidean, IndexKind::Hnsw(HnswConfig::fast())).unwrap();
    let mut eu = Metadata::new();
    eu.set("region", "eu");
    let mut us = Metadata::new();
    us.set("region", "us");

    db.add_with_metadata(vec![0.0, 0.0], eu.clone()).unwrap();
    db.add_with_metadata(vec![1.0, 0.0], us).unwrap();
    db.add_with_metadata(vec![2.0, 0.0], eu).unwrap();

    let filter = gigavector::vector::MetadataFilter::Equals {
        key: "region".into(),
        value: "eu".into(),
    };
    let results = db.search(&[0.0, 0.0], 10, Some(&filter)).unwrap();
    assert_eq!(results.len(), 2);
    for r in &results {
        assert_eq!(r.metadata.as_ref().unwrap().get("region"), Some("eu"));
    }
}

#[test]
fn batch_update_outcomes_are_independent_per_item_under_one_lock() {
    let db = Database::create_in_memory(2, DistanceMetric::Euclidean, IndexKind::Hnsw(HnswConfig::fast())).unwrap();
    let a = db.add(vec![1.0, 1.0]).unwrap();
    let b = db.add(vec![2.0, 2.0]).unwrap();
    let c = db.add(vec![3.0, 3.0]).unwrap();

    let mut meta = Metadata::new();
    meta.set("status", "archived");

    let outcomes = db
        .batch_update(vec![
            ConditionalItem::UpdateVector {
                id: a,
                vector: vec![9.0, 9.0],
                conditions: vec![MutationCondition::VersionEq(0)],
            },
            ConditionalItem::UpdateMetadata {
                id: b,
                metadata: meta,
                conditions: vec![MutationCondition::VersionEq(0)],
            },
            ConditionalItem::Delete {
                id: c,
                conditions: vec![MutationCondition::VersionEq(7)],
            },
        ])
        .unwrap();

    assert_eq!(outcomes, vec![MutationOutcome::Ok, MutationOutcome::Ok, MutationOutcome::Conflict]);
    assert_eq!(db.get_vector(a).unwrap(), vec![9.0, 9.0]);
    assert_eq!(db.get_metadata(b).unwrap().get("status"), Some("archived"));
    assert!(!db.is_deleted(c).unwrap());
}

#[test]
fn gv_wal_dir_env_var_redirects_the_wal_to_a_separate_directory() {
    let snapshot_dir = tempdir().unwrap();
    let wal_dir = tempdir().unwrap();
    let snapshot_path = snapshot_dir.path().join("db.gv");

    // SAFETY: test-only; no other thread in this process reads/writes this
    // variable concurrently with this test.
    unsafe { std::env::set_var("GV_WAL_DIR", wal_dir.path()) };
    {
        let db = open(&snapshot_path, 2);
        db.add(vec![1.0, 2.0]).unwrap();
    }
    unsafe { std::env::remove_var("GV_WAL_DIR") };

    let entries: Vec<_> = std::fs::read_dir(wal_dir.path()).unwrap().collect();
    assert_eq!(entries.len(), 1);
    assert!(!snapshot_dir.path().join("db.gv.wal").exists());
}

#[test]
fn concurrent_readers_observe_a_consistent_snapshot_while_a_writer_is_serialized() {
    let db = Arc::new(
        Database::create_in_memory(2, DistanceMetric::Euclidean, IndexKind::Hnsw(HnswConfig::fast())).unwrap(),
    );
    for i in 0..50 {
        db.add(vec![i as f32, 0.0]).unwrap();
    }

    let errors = Arc::new(Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    for _ in 0..4 {
        let db = Arc::clone(&db);
        let errors = Arc::clone(&errors);
        handles.push(thread::spawn(move || {
            for _ in 0..100 {
                if let Err(e) = db.search(&[0.0, 0.0], 5, None) {
                    errors.lock().unwrap().push(e.to_string());
                }
            }
        }));
    }
    {
        let db = Arc::clone(&db);
        handles.push(thread::spawn(move || {
            for i in 50..100 {
                db.add(vec![i as f32, 0.0]).unwrap();
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    assert!(errors.lock().unwrap().is_empty());
    assert_eq!(db.len(), 100);
}

#[test]
fn ivfpq_backed_database_trains_inserts_updates_and_survives_a_reopen() {
    let dim = 8;
    let dir = tempdir().unwrap();
    let path = dir.path().join("ivfpq.gv");
    let config = IvfPqConfig {
        nlist: 4,
        m: 2,
        nbits: 4,
        nprobe: 4,
        train_iters: 5,
        default_rerank: 32,
        use_cosine: false,
        oversampling_factor: 2,
    };
    let samples = grid_samples(dim, 64);

    {
        let db = Database::open(&path, dim, DistanceMetric::Euclidean, IndexKind::IvfPq(config.clone())).unwrap();
        db.train(&samples).unwrap();
        for s in &samples {
            db.add(s.clone()).unwrap();
        }

        let results = db.search(&samples[0], 5, None).unwrap();
        assert!(results.iter().any(|r| r.id == 0));

        // Exercise the conditional-update path through the facade, which is
        // what drives IvfPqIndex::update() in production.
        let replacement: Vec<f32> = (0..dim).map(|d| (d as f32) / 8.0).collect();
        let outcome = db
            .conditional_update_vector(0, replacement.clone(), &[MutationCondition::VersionEq(0)])
            .unwrap();
        assert_eq!(outcome, MutationOutcome::Ok);
        assert_eq!(db.get_vector(0).unwrap(), replacement);

        db.delete_by_id(1).unwrap();
        db.save().unwrap();
    }

    let reopened = Database::open(&path, dim, DistanceMetric::Euclidean, IndexKind::IvfPq(config)).unwrap();
    assert_eq!(reopened.len(), samples.len());
    assert!(reopened.is_deleted(1).unwrap());
    let expected: Vec<f32> = (0..dim).map(|d| (d as f32) / 8.0).collect();
    assert_eq!(reopened.get_vector(0).unwrap(), expected);
}
