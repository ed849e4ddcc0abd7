//! Engine-level search scenarios over fixture database files.

mod util;

use std::path::PathBuf;

use fpsim::config::ServerConfig;
use fpsim::engine::Engine;
use fpsim::error::SimError;
use util::{FixtureRow, rows64, write_database_file};

fn cpu_config() -> ServerConfig {
    ServerConfig {
        cpu_only: true,
        ..ServerConfig::default()
    }
}

fn small_rows() -> Vec<FixtureRow> {
    rows64(&[
        (0x1, "sA", "A"),
        (0x3, "sB", "B"),
        (0x7, "sC", "C"),
        (0xF, "sD", "D"),
        (0x1F, "sE", "E"),
    ])
}

fn sel(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(a, b)| (a.to_string(), b.to_string()))
        .collect()
}

fn write_small(dir: &std::path::Path, name: &str) -> PathBuf {
    let path = dir.join(format!("{name}.fsim"));
    write_database_file(&path, "pass", 64, &small_rows(), 100);
    path
}

#[test]
fn self_match_ranks_exact_hit_first() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path = write_small(tmp.path(), "small");
    let engine = Engine::start(&[path], &cpu_config()).unwrap();

    let results = engine
        .query(&sel(&[("small", "pass")]), 1, 3, 0.0, &[0xF, 0])
        .unwrap();
    assert_eq!(results.scores, vec![1.0, 0.8, 0.75]);
    assert_eq!(results.smiles, vec!["sD", "sE", "sC"]);
    assert_eq!(results.ids, vec!["D", "E", "C"]);
    assert_eq!(results.approximate_total, 5);
}

#[test]
fn equal_scores_order_by_smiles_then_id() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path = tmp.path().join("ties.fsim");
    // Identical fingerprints, so every row ties; ordering must come from the
    // lexicographic (smiles, id) rule.
    let rows = rows64(&[
        (0x7, "sE", "E"),
        (0x7, "sC", "C"),
        (0x7, "sC", "A"),
        (0x7, "sD", "D"),
    ]);
    write_database_file(&path, "pass", 64, &rows, 100);
    let engine = Engine::start(&[path], &cpu_config()).unwrap();

    let results = engine
        .query(&sel(&[("ties", "pass")]), 2, 4, 0.0, &[0x7, 0])
        .unwrap();
    assert_eq!(results.smiles, vec!["sC", "sD", "sE"]);
    assert_eq!(results.ids, vec!["A;:;C", "D", "E"]);
    assert_eq!(results.scores, vec![1.0, 1.0, 1.0]);
}

#[test]
fn cutoff_filters_results_and_reports_exact_total() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path = tmp.path().join("hundred.fsim");
    let mut entries: Vec<(u64, String, String)> = vec![
        (0xFFFF_FFFF, "match0".into(), "M0".into()), // score 1.0
        (0x00FF_FFFF, "match1".into(), "M1".into()), // score 0.75
        (0x0000_FFFF, "match2".into(), "M2".into()), // score 0.5
    ];
    for i in 0..97u64 {
        // One overlapping bit plus one outside the query: score ~0.03.
        entries.push((0x1 | (1 << 63), format!("miss{i}"), format!("X{i}")));
    }
    let rows: Vec<FixtureRow> = entries
        .iter()
        .map(|(bits, smiles, id)| {
            FixtureRow::new(
                vec![(*bits & 0xFFFF_FFFF) as u32, (*bits >> 32) as u32],
                smiles,
                id,
            )
        })
        .collect();
    assert_eq!(rows.len(), 100);
    write_database_file(&path, "pass", 64, &rows, 32);
    let engine = Engine::start(&[path], &cpu_config()).unwrap();

    let results = engine
        .query(&sel(&[("hundred", "pass")]), 3, 10, 0.3, &[0xFFFF_FFFF, 0])
        .unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results.approximate_total, 3);
    assert_eq!(results.smiles, vec!["match0", "match1", "match2"]);
    assert_eq!(results.scores, vec![1.0, 0.75, 0.5]);
}

#[test]
fn identical_databases_join_duplicate_ids() {
    let tmp = tempfile::TempDir::new().unwrap();
    let a = write_small(tmp.path(), "copy_a");
    let b = write_small(tmp.path(), "copy_b");
    let engine = Engine::start(&[a, b], &cpu_config()).unwrap();

    let results = engine
        .query(
            &sel(&[("copy_a", "pass"), ("copy_b", "pass")]),
            4,
            10,
            0.0,
            &[0xF, 0],
        )
        .unwrap();
    assert_eq!(results.len(), 5);
    for (id, smiles) in results.ids.iter().zip(&results.smiles) {
        let bare = &smiles[1..]; // sA -> A
        assert_eq!(id, &format!("{bare};:;{bare}"));
    }
    assert_eq!(results.approximate_total, 10);
}

#[test]
fn wrong_key_on_second_database_contributes_nothing() {
    let tmp = tempfile::TempDir::new().unwrap();
    let a = write_small(tmp.path(), "good");
    let b = write_small(tmp.path(), "locked");
    let engine = Engine::start(&[a, b], &cpu_config()).unwrap();

    let results = engine
        .query(
            &sel(&[("good", "pass"), ("locked", "wrong")]),
            5,
            10,
            0.0,
            &[0xF, 0],
        )
        .unwrap();
    assert_eq!(results.len(), 5);
    assert_eq!(results.approximate_total, 5);
    for id in &results.ids {
        assert!(!id.contains(";:;"));
    }
}

#[test]
fn fingerprint_accessor_round_trips_through_engine() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path = write_small(tmp.path(), "small");
    let engine = Engine::start(&[path], &cpu_config()).unwrap();

    let fp = engine.fingerprint_at("small", 3).unwrap();
    assert_eq!(fp, vec![0xF, 0]);
    let results = engine
        .query(&sel(&[("small", "pass")]), 6, 1, 0.0, &fp)
        .unwrap();
    assert_eq!(results.scores, vec![1.0]);
    assert_eq!(results.smiles, vec!["sD"]);
}

#[test]
fn forced_device_width_folds_and_still_self_matches() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path = write_small(tmp.path(), "small");
    let config = ServerConfig {
        device_count: 2,
        device_memory_bytes: 1 << 20,
        gpu_bitcount: 32,
        ..ServerConfig::default()
    };
    let engine = Engine::start(&[path], &config).unwrap();
    assert_eq!(engine.fold_factor(), 2);

    let results = engine
        .query(&sel(&[("small", "pass")]), 7, 1, 0.0, &[0xF, 0])
        .unwrap();
    assert_eq!(results.scores, vec![1.0]);
    assert_eq!(results.smiles, vec!["sD"]);
}

#[test]
fn fold_cache_file_is_written_then_reused() {
    let tmp = tempfile::TempDir::new().unwrap();
    let cache_dir = tmp.path().join("cache");
    let path = write_small(tmp.path(), "small");
    let config = ServerConfig {
        device_count: 1,
        device_memory_bytes: 1 << 20,
        gpu_bitcount: 32,
        cache_dir: Some(cache_dir.clone()),
        ..ServerConfig::default()
    };

    let first = Engine::start(&[path.clone()], &config).unwrap();
    let cached: Vec<_> = std::fs::read_dir(&cache_dir).unwrap().collect();
    assert_eq!(cached.len(), 1);
    let blob_name = cached[0].as_ref().unwrap().file_name();
    assert!(blob_name.to_string_lossy().starts_with("2-"));

    // A fresh engine over the same file reads the blob back and must score
    // identically.
    let second = Engine::start(&[path], &config).unwrap();
    let selections = sel(&[("small", "pass")]);
    let a = first.query(&selections, 8, 5, 0.0, &[0x1F, 0]).unwrap();
    let b = second.query(&selections, 8, 5, 0.0, &[0x1F, 0]).unwrap();
    assert_eq!(a, b);
}

#[test]
fn device_out_of_memory_at_upload_fails_startup() {
    let tmp = tempfile::TempDir::new().unwrap();
    let a = write_small(tmp.path(), "one");
    let b = write_small(tmp.path(), "two");
    // 80 bytes of data fold down to 40 at the one-word floor, which still
    // overflows a 30-byte device.
    let config = ServerConfig {
        device_count: 1,
        device_memory_bytes: 30,
        ..ServerConfig::default()
    };
    let err = Engine::start(&[a, b], &config).unwrap_err();
    assert!(matches!(err, SimError::Config(_)));
}

#[test]
fn no_usable_device_memory_fails_startup() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path = write_small(tmp.path(), "small");
    let config = ServerConfig {
        device_count: 1,
        // The index-vector reserve eats the whole budget.
        device_memory_bytes: 16,
        ..ServerConfig::default()
    };
    let err = Engine::start(&[path], &config).unwrap_err();
    assert!(matches!(err, SimError::Config(_)));
}

#[test]
fn repeated_queries_return_identical_results() {
    let tmp = tempfile::TempDir::new().unwrap();
    let a = write_small(tmp.path(), "one");
    let b = write_small(tmp.path(), "two");
    let engine = Engine::start(&[a, b], &cpu_config()).unwrap();
    let selections = sel(&[("one", "pass"), ("two", "pass")]);

    let first = engine.query(&selections, 9, 4, 0.1, &[0x7, 0]).unwrap();
    for _ in 0..5 {
        let again = engine.query(&selections, 9, 4, 0.1, &[0x7, 0]).unwrap();
        assert_eq!(first, again);
    }
}
