//! Tests for record lifecycle and the policy queries.

use std::path::Path;

use super::*;

fn image_print(bytes: &[u8]) -> Fingerprint<fingerprint::Image> {
    fingerprint::image(bytes)
}

fn submission_print(
    bytes: &[u8],
    filename: &str,
    password: Option<&str>,
) -> Fingerprint<fingerprint::Submission> {
    fingerprint::submission(bytes, filename, password, false)
}

#[test]
fn upsert_image_counts_uploads() {
    let registry = Registry::in_memory().expect("must open");
    let print = image_print(b"blob");

    let first = registry
        .upsert_image(&print, Path::new("/results/blob.png"), 4, 100)
        .expect("must upsert");
    assert_eq!(*first.upload_count(), 1);
    assert_eq!(*first.first_seen(), 100);
    assert_eq!(*first.last_seen(), 100);

    let second = registry
        .upsert_image(&print, Path::new("/results/blob.png"), 4, 250)
        .expect("must upsert");
    assert_eq!(*second.upload_count(), 2);
    assert_eq!(*second.first_seen(), 100, "first_seen never moves");
    assert_eq!(*second.last_seen(), 250);

    assert_eq!(registry.images().expect("must list").len(), 1);
}

#[test]
fn duplicate_submission_is_one_record() {
    let registry = Registry::in_memory().expect("must open");
    let image = image_print(b"blob");
    let print = submission_print(b"blob", "a.png", None);

    registry
        .upsert_submission(&print, &image, "a.png", None, false, 10)
        .expect("must upsert");
    registry
        .upsert_submission(&print, &image, "a.png", None, false, 20)
        .expect("must upsert");

    let all = registry.submissions().expect("must list");
    assert_eq!(all.len(), 1);
    assert_eq!(*all[0].created(), 10, "created keeps the first value");
}

#[test]
fn reupload_resets_status_to_pending() {
    let registry = Registry::in_memory().expect("must open");
    let image = image_print(b"blob");
    let print = submission_print(b"blob", "a.png", None);

    registry
        .upsert_submission(&print, &image, "a.png", None, false, 10)
        .expect("must upsert");
    registry
        .set_status(&print, Status::Completed)
        .expect("must update");

    registry
        .upsert_submission(&print, &image, "a.png", None, false, 20)
        .expect("must upsert");
    let record = registry
        .submission(&print)
        .expect("must query")
        .expect("must exist");
    assert_eq!(*record.status(), Status::Pending);
}

#[test]
fn status_lifecycle_round_trips() {
    let registry = Registry::in_memory().expect("must open");
    let image = image_print(b"blob");
    let print = submission_print(b"blob", "a.png", None);
    registry
        .upsert_submission(&print, &image, "a.png", None, false, 10)
        .expect("must upsert");

    for status in [Status::Running, Status::Completed, Status::Error] {
        registry.set_status(&print, status).expect("must update");
        let record = registry
            .submission(&print)
            .expect("must query")
            .expect("must exist");
        assert_eq!(*record.status(), status);
    }
}

#[test]
fn in_flight_covers_pending_and_running() {
    assert!(Status::Pending.in_flight());
    assert!(Status::Running.in_flight());
    assert!(!Status::Completed.in_flight());
    assert!(!Status::Error.in_flight());
}

#[test]
fn password_can_be_cleared() {
    let registry = Registry::in_memory().expect("must open");
    let image = image_print(b"blob");
    let print = submission_print(b"blob", "a.png", Some("hunter2"));
    registry
        .upsert_submission(&print, &image, "a.png", Some("hunter2"), false, 10)
        .expect("must upsert");

    registry.set_password(&print, None).expect("must clear");
    let record = registry
        .submission(&print)
        .expect("must query")
        .expect("must exist");
    assert_eq!(*record.password(), None);
}

#[test]
fn submissions_of_partitions_by_image() {
    let registry = Registry::in_memory().expect("must open");
    let cat = image_print(b"cat");
    let dog = image_print(b"dog");

    for (bytes, image, name) in [
        (&b"cat"[..], &cat, "one.png"),
        (b"cat", &cat, "two.png"),
        (b"dog", &dog, "three.png"),
    ] {
        let print = submission_print(bytes, name, None);
        registry
            .upsert_submission(&print, image, name, None, false, 10)
            .expect("must upsert");
    }

    assert_eq!(registry.submissions_of(&cat).expect("must list").len(), 2);
    assert_eq!(registry.submissions_of(&dog).expect("must list").len(), 1);
}

#[test]
fn upload_log_is_append_only_and_distinct_ips_query_works() {
    let registry = Registry::in_memory().expect("must open");
    let image = image_print(b"blob");
    let print = submission_print(b"blob", "a.png", None);

    for (ip, n) in [("10.0.0.1", 1), ("10.0.0.1", 2), ("10.0.0.2", 3)] {
        registry
            .log_upload(ip, Some("curl/8"), &image, Some(&print), Some("a.png"), n)
            .expect("must log");
    }

    assert_eq!(registry.upload_count().expect("must count"), 3);
    let ips = registry
        .uploader_ips_for_image(&image)
        .expect("must query");
    assert_eq!(ips.len(), 2);
    assert!(ips.contains("10.0.0.1") && ips.contains("10.0.0.2"));

    let by_submission = registry
        .uploader_ips_for_submission(&print)
        .expect("must query");
    assert_eq!(by_submission.len(), 2);
}

#[test]
fn clear_keeps_the_upload_log() {
    let registry = Registry::in_memory().expect("must open");
    let image = image_print(b"blob");
    let print = submission_print(b"blob", "a.png", None);

    registry
        .upsert_image(&image, Path::new("/results/blob.png"), 4, 10)
        .expect("must upsert");
    registry
        .upsert_submission(&print, &image, "a.png", None, false, 10)
        .expect("must upsert");
    registry
        .log_upload("10.0.0.1", None, &image, Some(&print), Some("a.png"), 10)
        .expect("must log");

    registry.clear().expect("must clear");
    assert!(registry.images().expect("must list").is_empty());
    assert!(registry.submissions().expect("must list").is_empty());
    assert_eq!(registry.upload_count().expect("must count"), 1);
}

#[test]
fn records_survive_reopen() {
    let dir = tempfile::tempdir().expect("must create tempdir");
    let path = dir.path().join("registry.db");
    let image = image_print(b"blob");

    {
        let registry = Registry::open(&path).expect("must open");
        registry
            .upsert_image(&image, Path::new("/results/blob.png"), 4, 10)
            .expect("must upsert");
    }

    let registry = Registry::open(&path).expect("must reopen");
    let record = registry
        .image(&image)
        .expect("must query")
        .expect("must exist");
    assert_eq!(*record.size(), 4);
}
