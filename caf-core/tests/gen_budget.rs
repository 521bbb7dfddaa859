use std::collections::HashSet;
use std::path::Path;

use caf_core::address::digest;
use caf_core::manifest::{Manifest, MANIFEST_FILE};
use caf_core::{CafError, CollisionPolicy, GenerationEngine, GenerationRequest, SizeSpec};

fn request(dir: &Path, spec: SizeSpec) -> GenerationRequest {
    let mut req = GenerationRequest::new(dir);
    req.size_spec = spec;
    req.concurrency = 4;
    req.seed = Some(7);
    req
}

fn data_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| !n.starts_with(".caf-"))
        .collect();
    names.sort();
    names
}

#[test]
fn file_count_limit_is_exact() {
    let td = tempfile::tempdir().unwrap();
    let mut req = request(td.path(), SizeSpec::Fixed(1000));
    req.max_files = Some(37);
    let report = GenerationEngine::run(&req).unwrap();
    assert_eq!(report.files_created, 37);
    assert_eq!(report.bytes_written, 37_000);
    assert_eq!(data_files(td.path()).len(), 37);

    // Every file on disk is recorded with its true size and digest.
    let manifest = Manifest::load(td.path()).unwrap();
    assert_eq!(manifest.len(), 37);
    for rec in manifest.records() {
        let bytes = std::fs::read(td.path().join(&rec.name)).unwrap();
        assert_eq!(bytes.len() as u64, rec.size);
        assert_eq!(digest(&bytes), rec.digest);
        assert_eq!(rec.name, rec.digest);
    }
}

#[test]
fn disk_usage_limit_exact_multiple() {
    let td = tempfile::tempdir().unwrap();
    let mut req = request(td.path(), SizeSpec::Fixed(1024));
    req.max_disk_usage = Some(10 * 1024);
    let report = GenerationEngine::run(&req).unwrap();
    assert_eq!(report.files_created, 10);
    assert_eq!(report.bytes_written, 10 * 1024);
}

#[test]
fn disk_usage_limit_never_exceeded() {
    let td = tempfile::tempdir().unwrap();
    let mut req = request(td.path(), SizeSpec::Fixed(1000));
    req.max_disk_usage = Some(10_500);
    let report = GenerationEngine::run(&req).unwrap();
    assert_eq!(report.files_created, 10);
    assert!(report.bytes_written <= 10_500);
}

#[test]
fn tighter_of_two_limits_wins() {
    let td = tempfile::tempdir().unwrap();
    let mut req = request(td.path(), SizeSpec::Fixed(100));
    req.max_files = Some(3);
    req.max_disk_usage = Some(1 << 20);
    assert_eq!(GenerationEngine::run(&req).unwrap().files_created, 3);
}

#[test]
fn range_sizes_stay_in_bounds() {
    let td = tempfile::tempdir().unwrap();
    let mut req = request(td.path(), SizeSpec::Range { min: 100, max: 200 });
    req.max_files = Some(60);
    let report = GenerationEngine::run(&req).unwrap();
    assert_eq!(report.files_created, 60);
    let sizes: HashSet<u64> = report.manifest.records().iter().map(|r| r.size).collect();
    assert!(sizes.iter().all(|s| (100..=200).contains(s)));
    assert!(sizes.len() > 1, "range produced a single size");
}

#[test]
fn narrow_range_files_reach_both_bounds() {
    let td = tempfile::tempdir().unwrap();
    let mut req = request(td.path(), SizeSpec::Range { min: 10, max: 13 });
    req.max_files = Some(200);
    let report = GenerationEngine::run(&req).unwrap();
    let sizes: HashSet<u64> = report.manifest.records().iter().map(|r| r.size).collect();
    assert!(sizes.contains(&10), "min never drawn: {sizes:?}");
    assert!(sizes.contains(&13), "max never drawn: {sizes:?}");
}

#[test]
fn empty_files_get_suffixed_names() {
    let td = tempfile::tempdir().unwrap();
    let mut req = request(td.path(), SizeSpec::Fixed(0));
    req.max_files = Some(5);
    let report = GenerationEngine::run(&req).unwrap();
    assert_eq!(report.files_created, 5);
    assert_eq!(report.collisions, 4);
    let names = data_files(td.path());
    assert_eq!(names.len(), 5);
    let empty = digest(b"");
    assert!(names.contains(&empty));
    for rec in report.manifest.records() {
        assert_eq!(rec.digest, empty);
    }
}

#[test]
fn fail_policy_drops_duplicates() {
    let td = tempfile::tempdir().unwrap();
    let mut req = request(td.path(), SizeSpec::Fixed(0));
    req.max_files = Some(5);
    req.on_collision = CollisionPolicy::Fail;
    let report = GenerationEngine::run(&req).unwrap();
    assert_eq!(report.files_created, 1);
    assert_eq!(report.failed_writes, 4);
    assert_eq!(data_files(td.path()), vec![digest(b"")]);
}

#[test]
fn second_run_needs_append() {
    let td = tempfile::tempdir().unwrap();
    let mut req = request(td.path(), SizeSpec::Fixed(64));
    req.max_files = Some(3);
    GenerationEngine::run(&req).unwrap();

    req.seed = Some(8);
    assert!(matches!(GenerationEngine::run(&req), Err(CafError::ManifestExists(_))));

    req.append = true;
    req.max_files = Some(2);
    let report = GenerationEngine::run(&req).unwrap();
    assert_eq!(report.files_created, 2);
    assert_eq!(Manifest::load(td.path()).unwrap().len(), 5);
    assert_eq!(data_files(td.path()).len(), 5);
}

#[test]
fn same_seed_same_content() {
    let (a, b) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
    for dir in [a.path(), b.path()] {
        let mut req = request(dir, SizeSpec::Range { min: 1, max: 4096 });
        req.concurrency = 1;
        req.max_files = Some(8);
        GenerationEngine::run(&req).unwrap();
    }
    assert_eq!(data_files(a.path()), data_files(b.path()));
    assert!(a.path().join(MANIFEST_FILE).exists());
}
