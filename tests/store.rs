use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;
use std::thread;

use ember_voiceprint::voice::{
    BiometricsConfig, Calibration, EnrollError, LivenessVerdict, NormRangeLiveness,
    SnapshotStore, SpeakerBiometrics, VerifyReason,
};
use tempfile::TempDir;

fn config() -> BiometricsConfig {
    BiometricsConfig {
        dimension: 3,
        verify_threshold: 0.65,
        calibration: Calibration::default(),
    }
}

fn open(dir: &TempDir) -> SpeakerBiometrics {
    let store = SnapshotStore::open(dir.path()).unwrap();
    SpeakerBiometrics::open(config(), Box::new(store)).unwrap()
}

fn genuine(_: &[f32]) -> LivenessVerdict {
    LivenessVerdict::genuine(0.9)
}

#[test]
fn enroll_and_verify_three_dimensional_voiceprint() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);

    engine
        .enroll("alice", &[1.0, 0.0, 0.0], &genuine, BTreeMap::new())
        .unwrap();

    let same = engine.verify("alice", &[1.0, 0.0, 0.0], &genuine).unwrap();
    assert!(same.verified);
    assert_eq!(same.reason, VerifyReason::Success);
    assert!(same.score > 0.99);

    let other = engine.verify("alice", &[0.0, 1.0, 0.0], &genuine).unwrap();
    assert!(!other.verified);
    assert_eq!(other.reason, VerifyReason::BelowThreshold);
    assert!((other.score - Calibration::default().apply(0.0)).abs() < 1e-12);
}

#[test]
fn store_survives_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let engine = open(&dir);
        let metrics = BTreeMap::from([("duration".to_string(), 4.2)]);
        engine
            .enroll("alice", &[0.2, 0.9, -0.1], &genuine, metrics)
            .unwrap();
        engine
            .enroll("bob", &[-0.7, 0.1, 0.6], &genuine, BTreeMap::new())
            .unwrap();
    }

    let engine = open(&dir);
    assert_eq!(engine.list_profiles(), vec!["alice", "bob"]);

    let alice = engine.lookup("alice").unwrap();
    assert_eq!(alice.quality_metrics["duration"], 4.2);

    let stats = engine.stats();
    assert_eq!(stats.enrolled, 2);
    assert_eq!(stats.slots, 2);
    assert_eq!(stats.generation, 2);

    assert!(engine
        .verify("bob", &[-0.7, 0.1, 0.6], &genuine)
        .unwrap()
        .verified);
}

#[test]
fn concurrent_enrollment_of_one_user_has_single_winner() {
    let dir = TempDir::new().unwrap();
    let engine = Arc::new(open(&dir));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                let embedding = [1.0, i as f32 * 0.1, 0.0];
                engine.enroll("carol", &embedding, &genuine, BTreeMap::new())
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let winners = results.iter().filter(|r| r.is_ok()).count();
    let duplicates = results
        .iter()
        .filter(|r| matches!(r, Err(EnrollError::AlreadyEnrolled(_))))
        .count();

    assert_eq!(winners, 1);
    assert_eq!(duplicates, 7);
    assert_eq!(engine.stats().slots, 1);
}

#[test]
fn concurrent_enrollment_of_distinct_users() {
    let dir = TempDir::new().unwrap();
    let engine = Arc::new(open(&dir));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                let embedding = [1.0, i as f32, -(i as f32)];
                engine
                    .enroll(&format!("user{}", i), &embedding, &genuine, BTreeMap::new())
                    .unwrap()
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    drop(engine);
    let engine = open(&dir);
    assert_eq!(engine.stats().enrolled, 8);
    for i in 0..8 {
        let embedding = [1.0, i as f32, -(i as f32)];
        let outcome = engine
            .verify(&format!("user{}", i), &embedding, &genuine)
            .unwrap();
        assert!(outcome.verified);
    }
}

#[test]
fn spoofed_sample_is_never_verified() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);
    engine
        .enroll("alice", &[0.5, 0.5, 0.5], &genuine, BTreeMap::new())
        .unwrap();

    let spoof = |_: &[f32]| LivenessVerdict::spoofed(0.1, "replayed audio");
    let outcome = engine.verify("alice", &[0.5, 0.5, 0.5], &spoof).unwrap();
    assert!(!outcome.verified);
    assert_eq!(outcome.reason, VerifyReason::SpoofSuspected);
    assert_eq!(outcome.score, 0.1);

    // degenerate embedding rejected by the norm heuristic
    let outcome = engine
        .verify("alice", &[0.0, 0.0, 0.0], &NormRangeLiveness::default())
        .unwrap();
    assert_eq!(outcome.reason, VerifyReason::SpoofSuspected);
}

#[test]
fn unknown_user_scores_zero() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);

    let outcome = engine.verify("ghost", &[1.0, 0.0, 0.0], &genuine).unwrap();
    assert!(!outcome.verified);
    assert_eq!(outcome.score, 0.0);
    assert_eq!(outcome.reason, VerifyReason::NotFound);
}

#[cfg(unix)]
#[test]
fn failed_save_rolls_back_enrollment() {
    use std::os::unix::fs::PermissionsExt;

    let dir = TempDir::new().unwrap();
    let engine = open(&dir);
    engine
        .enroll("alice", &[1.0, 0.0, 0.0], &genuine, BTreeMap::new())
        .unwrap();

    // Read-only store directory: staging the next snapshot fails
    fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o500)).unwrap();
    let probe = dir.path().join("probe");
    let writable = fs::write(&probe, b"x").is_ok();
    if writable {
        // running as root, permissions are not enforced
        fs::remove_file(&probe).unwrap();
        fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o700)).unwrap();
        return;
    }

    let result = engine.enroll("bob", &[0.0, 1.0, 0.0], &genuine, BTreeMap::new());
    fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o700)).unwrap();

    assert!(matches!(result, Err(EnrollError::PersistenceFailure(_))));
    assert!(engine.lookup("bob").is_none());
    assert_eq!(engine.stats().tombstoned, 1);

    let retry = engine
        .enroll("bob", &[0.0, 1.0, 0.0], &genuine, BTreeMap::new())
        .unwrap();
    assert_eq!(retry.slot.0, 2);

    drop(engine);
    let engine = open(&dir);
    assert_eq!(engine.list_profiles(), vec!["alice", "bob"]);
    assert_eq!(engine.lookup("bob").unwrap().slot.0, 2);
}
