//! End-to-end scan scenarios: queue → worker → clone → scheduler →
//! artifacts, with progress observed through the hub.

use std::time::Duration;

use zero_core::diff::DiffEngine;
use zero_core::freshness::AgeLevel;
use zero_core::types::{RepoId, Severity};
use zero_test::{
    Behavior, FakeUnit, Stack, TestRepo, job_spec, job_topic, sample_finding, ScanStatus,
    UnitState,
};

fn quick_units() -> Vec<zero_core::registry::UnitSpec> {
    let (sbom, _) = FakeUnit::spec("sbom", &[], &["quick"], Behavior::Succeed(vec![]));
    let (secrets, _) = FakeUnit::spec(
        "secrets",
        &[],
        &["quick"],
        Behavior::Succeed(vec![sample_finding(
            "s1",
            "src/main.rs",
            3,
            "AKIA-TEST",
            Severity::High,
        )]),
    );
    vec![sbom, secrets]
}

#[tokio::test]
async fn fresh_single_repo_scan() {
    let stack = Stack::new(quick_units(), vec![]);
    let repo: RepoId = "acme/widget".parse().unwrap();
    let fixture = TestRepo::minimal();
    fixture.publish(&stack.git_root, &repo);

    let pool = stack.start_workers(1);
    let job = stack.queue.enqueue(job_spec("acme/widget", false, "quick")).unwrap();
    let snapshot = stack.wait_terminal(job.id(), Duration::from_secs(30)).await;

    assert_eq!(snapshot.status, ScanStatus::Complete);
    assert_eq!(snapshot.project_ids, vec!["acme/widget".to_string()]);

    // Artifacts landed under the canonical layout
    let envelope = stack.store.read_envelope(&repo, "secrets").unwrap();
    assert_eq!(envelope.repository, "acme/widget");
    assert_eq!(envelope.findings.len(), 1);
    assert!(stack.store.exists(&repo, "sbom"));

    // Freshness is stamped fresh for every unit in the profile
    let report = stack.freshness.check(&repo, None).unwrap();
    assert_eq!(report.level, AgeLevel::Fresh);
    for unit in ["sbom", "secrets"] {
        assert_eq!(report.units[unit].level, AgeLevel::Fresh);
        assert!(report.units[unit].success);
    }

    // The scan record matches the working tree's commit
    let scans = stack.store.list_scans(&repo).unwrap();
    assert_eq!(scans.len(), 1);
    assert_eq!(scans[0].commit_sha.as_deref(), Some(fixture.head().as_str()));

    pool.stop().await;
}

#[tokio::test]
async fn second_scan_skips_fresh_units() {
    let stack = Stack::new(quick_units(), vec![]);
    let repo: RepoId = "acme/widget".parse().unwrap();
    TestRepo::minimal().publish(&stack.git_root, &repo);

    let pool = stack.start_workers(1);
    let first = stack.queue.enqueue(job_spec("acme/widget", false, "quick")).unwrap();
    stack.wait_terminal(first.id(), Duration::from_secs(30)).await;

    let second = stack.queue.enqueue(job_spec("acme/widget", false, "quick")).unwrap();
    let snapshot = stack.wait_terminal(second.id(), Duration::from_secs(30)).await;

    assert_eq!(snapshot.status, ScanStatus::Complete);
    let scans = stack.store.list_scans(&repo).unwrap();
    assert_eq!(scans.len(), 2);
    for unit in ["sbom", "secrets"] {
        let report = &scans[1].units[unit];
        assert_eq!(report.state, UnitState::Skipped);
        assert_eq!(report.skip_reason.as_deref(), Some("fresh"));
    }
    pool.stop().await;
}

#[tokio::test]
async fn commit_change_defeats_freshness() {
    let stack = Stack::new(quick_units(), vec![]);
    let repo: RepoId = "acme/widget".parse().unwrap();
    let fixture = TestRepo::minimal();
    fixture.publish(&stack.git_root, &repo);

    let pool = stack.start_workers(1);
    let first = stack.queue.enqueue(job_spec("acme/widget", false, "quick")).unwrap();
    stack.wait_terminal(first.id(), Duration::from_secs(30)).await;

    fixture.commit_file("src/lib.rs", "pub fn two() -> i32 { 2 }\n", "Add lib");
    fixture.republish(&stack.git_root, &repo);

    let second = stack.queue.enqueue(job_spec("acme/widget", false, "quick")).unwrap();
    stack.wait_terminal(second.id(), Duration::from_secs(30)).await;

    let scans = stack.store.list_scans(&repo).unwrap();
    assert_eq!(scans[1].units["sbom"].state, UnitState::Complete);
    assert_eq!(scans[1].commit_sha.as_deref(), Some(fixture.head().as_str()));
    assert_ne!(scans[0].commit_sha, scans[1].commit_sha);
    pool.stop().await;
}

#[tokio::test]
async fn dependency_cascade_on_failure() {
    let (b, _) = FakeUnit::spec("b", &[], &["quick"], Behavior::Fail("scripted".into()));
    let (a, _) = FakeUnit::spec("a", &["b"], &["quick"], Behavior::Succeed(vec![]));
    let (c, _) = FakeUnit::spec("c", &[], &["quick"], Behavior::Succeed(vec![]));
    let stack = Stack::new(vec![a, b, c], vec![]);
    let repo: RepoId = "acme/widget".parse().unwrap();
    TestRepo::minimal().publish(&stack.git_root, &repo);

    let pool = stack.start_workers(1);
    let job = stack.queue.enqueue(job_spec("acme/widget", false, "quick")).unwrap();
    let snapshot = stack.wait_terminal(job.id(), Duration::from_secs(30)).await;

    // One unit completed, so the scan is complete, not failed
    assert_eq!(snapshot.status, ScanStatus::Complete);
    let scans = stack.store.list_scans(&repo).unwrap();
    let units = &scans[0].units;
    assert_eq!(units["b"].state, UnitState::Failed);
    assert_eq!(units["a"].state, UnitState::Skipped);
    assert_eq!(units["a"].skip_reason.as_deref(), Some("dependency-failed"));
    assert_eq!(units["c"].state, UnitState::Complete);

    // The failed unit never produced an artifact, so it is re-targeted
    let (run, reason) = stack
        .freshness
        .should_scan(&repo, "b", zero_core::freshness::SkipQuery::default())
        .unwrap();
    assert!(run);
    assert_eq!(reason, "no-artifact");
    pool.stop().await;
}

#[tokio::test]
async fn cancel_mid_scan_is_observed_in_order() {
    let (slow, _) = FakeUnit::spec("slow", &[], &["quick"], Behavior::Hang);
    let stack = Stack::new(vec![slow], vec![]);
    let repo: RepoId = "acme/widget".parse().unwrap();
    TestRepo::minimal().publish(&stack.git_root, &repo);

    let pool = stack.start_workers(1);
    let job = stack.queue.enqueue(job_spec("acme/widget", false, "quick")).unwrap();
    let mut subscription = stack.hub.subscribe(&job_topic(job.id()));

    // Let the scan get under way, then cancel
    tokio::time::sleep(Duration::from_millis(300)).await;
    stack.queue.cancel(job.id()).unwrap();
    let snapshot = stack.wait_terminal(job.id(), Duration::from_secs(10)).await;
    assert_eq!(snapshot.status, ScanStatus::Canceled);

    // The worker's terminal job_status is the last thing on the topic
    let mut kinds = Vec::new();
    let mut last_status = None;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while last_status.as_deref() != Some("canceled") {
        let message = tokio::time::timeout_at(deadline, subscription.rx.recv())
            .await
            .expect("terminal event arrives before the deadline")
            .expect("subscription stays live");
        let event: serde_json::Value = serde_json::from_str(&message).unwrap();
        let kind = event["type"].as_str().unwrap().to_string();
        if kind == "job_status" {
            last_status = Some(event["payload"]["status"].as_str().unwrap().to_string());
        }
        kinds.push(kind);
    }
    assert!(kinds.contains(&"unit_started".to_string()), "saw {kinds:?}");
    assert_eq!(last_status.as_deref(), Some("canceled"));

    let scans = stack.store.list_scans(&repo).unwrap();
    assert_eq!(scans[0].status, ScanStatus::Canceled);
    assert_eq!(scans[0].units["slow"].state, UnitState::Failed);
    assert_eq!(scans[0].units["slow"].error.as_deref(), Some("canceled"));
    pool.stop().await;
}

#[tokio::test]
async fn org_fan_out_scans_every_repo() {
    let org_repos: Vec<RepoId> = ["acme/a", "acme/b", "acme/c"]
        .iter()
        .map(|s| s.parse().unwrap())
        .collect();
    let stack = Stack::new(quick_units(), org_repos.clone());
    for repo in &org_repos {
        TestRepo::minimal().publish(&stack.git_root, repo);
    }

    let pool = stack.start_workers(1);
    let job = stack.queue.enqueue(job_spec("acme", true, "quick")).unwrap();
    let snapshot = stack.wait_terminal(job.id(), Duration::from_secs(60)).await;

    assert_eq!(snapshot.status, ScanStatus::Complete);
    assert_eq!(snapshot.progress.repos_total, 3);
    assert_eq!(snapshot.progress.repos_complete, 3);
    assert_eq!(snapshot.project_ids.len(), 3);
    for repo in &org_repos {
        assert!(stack.store.exists(repo, "sbom"), "missing artifacts for {repo}");
    }
    pool.stop().await;
}

#[tokio::test]
async fn diff_across_two_scans_classifies_changes() {
    let moved = sample_finding("m", "src/old.rs", 10, "AKIA-MOVED", Severity::High);
    let gone = sample_finding("g", "src/gone.rs", 20, "AKIA-GONE", Severity::Critical);
    let same = sample_finding("s", "src/same.rs", 5, "AKIA-SAME", Severity::Low);
    let (secrets, handle) = FakeUnit::spec(
        "secrets",
        &[],
        &["quick"],
        Behavior::Succeed(vec![moved, gone, same.clone()]),
    );
    let stack = Stack::new(vec![secrets], vec![]);
    let repo: RepoId = "acme/widget".parse().unwrap();
    let fixture = TestRepo::minimal();
    fixture.publish(&stack.git_root, &repo);

    let pool = stack.start_workers(1);
    let first = stack.queue.enqueue(job_spec("acme/widget", false, "quick")).unwrap();
    stack.wait_terminal(first.id(), Duration::from_secs(30)).await;

    // Second scan: one finding moved files, one disappeared
    *handle.lock().unwrap() = Behavior::Succeed(vec![
        sample_finding("m", "src/new.rs", 88, "AKIA-MOVED", Severity::High),
        same,
    ]);
    let mut spec = job_spec("acme/widget", false, "quick");
    spec.options.force = true;
    let second = stack.queue.enqueue(spec).unwrap();
    stack.wait_terminal(second.id(), Duration::from_secs(30)).await;

    let engine = DiffEngine::new(stack.store.clone(), 5, true);
    let delta = engine.diff(&repo, 1, 2).unwrap();
    assert_eq!(delta.summary.new_count, 0);
    assert_eq!(delta.summary.fixed_count, 1);
    assert_eq!(delta.summary.moved_count, 1);
    assert_eq!(delta.summary.unchanged_count, 1);
    assert_eq!(
        delta.summary.risk_trend,
        zero_core::diff::RiskTrend::Improving
    );
    pool.stop().await;
}

#[tokio::test]
async fn canceling_one_job_leaves_others_untouched() {
    let (slow, _) = FakeUnit::spec("slow", &[], &["hangs"], Behavior::Hang);
    let (sbom, _) = FakeUnit::spec("sbom", &[], &["quick"], Behavior::Succeed(vec![]));
    let stack = Stack::new(vec![slow, sbom], vec![]);
    let victim_repo: RepoId = "acme/victim".parse().unwrap();
    let bystander_repo: RepoId = "acme/bystander".parse().unwrap();
    TestRepo::minimal().publish(&stack.git_root, &victim_repo);
    TestRepo::minimal().publish(&stack.git_root, &bystander_repo);

    let pool = stack.start_workers(2);
    let victim = stack.queue.enqueue(job_spec("acme/victim", false, "hangs")).unwrap();
    let bystander = stack.queue.enqueue(job_spec("acme/bystander", false, "quick")).unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    stack.queue.cancel(victim.id()).unwrap();

    let victim_snapshot = stack.wait_terminal(victim.id(), Duration::from_secs(10)).await;
    let bystander_snapshot = stack
        .wait_terminal(bystander.id(), Duration::from_secs(30))
        .await;

    assert_eq!(victim_snapshot.status, ScanStatus::Canceled);
    assert_eq!(bystander_snapshot.status, ScanStatus::Complete);
    assert!(stack.store.exists(&bystander_repo, "sbom"));
    assert!(!stack.store.exists(&victim_repo, "slow"));
    pool.stop().await;
}

#[tokio::test]
async fn org_listing_failure_fails_the_job() {
    let stack = Stack::new(quick_units(), vec![]);
    let pool = stack.start_workers(1);
    let job = stack.queue.enqueue(job_spec("ghost-org", true, "quick")).unwrap();
    let snapshot = stack.wait_terminal(job.id(), Duration::from_secs(30)).await;
    assert_eq!(snapshot.status, ScanStatus::Failed);
    assert!(snapshot.error.unwrap().contains("unknown organization"));
    pool.stop().await;
}

#[tokio::test]
async fn clone_failure_fails_the_scan() {
    let stack = Stack::new(quick_units(), vec![]);
    // No published fixture: the remote does not exist
    let pool = stack.start_workers(1);
    let job = stack.queue.enqueue(job_spec("acme/missing", false, "quick")).unwrap();
    let snapshot = stack.wait_terminal(job.id(), Duration::from_secs(30)).await;
    assert_eq!(snapshot.status, ScanStatus::Failed);
    assert!(snapshot.error.unwrap().contains("Clone failed"));
    pool.stop().await;
}
