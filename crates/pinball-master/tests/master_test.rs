//! Integration tests for the token master: the five operations, their
//! preconditions, lease semantics, atomicity and recovery.

use std::sync::Arc;

use futures::TryStreamExt;

use pinball_core::{ManualClock, MasterError, Token, TokenMaster, TokenQuery};
use pinball_master::{InMemoryTokenStore, Master, MasterConfig, MasterHandle, TokenStore};

async fn spawn_master(store: Arc<InMemoryTokenStore>, clock: Arc<ManualClock>) -> MasterHandle {
    let master = Master::recover(store, clock)
        .await
        .expect("recovery failed");
    let (handle, _actor) = master.spawn(MasterConfig::default());
    handle
}

async fn fresh_master() -> (MasterHandle, Arc<InMemoryTokenStore>, Arc<ManualClock>) {
    let store = Arc::new(InMemoryTokenStore::new());
    let clock = ManualClock::new(1_000);
    let handle = spawn_master(store.clone(), clock.clone()).await;
    (handle, store, clock)
}

fn insert(name: &str, data: &str) -> Token {
    Token::new(name, data.as_bytes().to_vec())
}

#[tokio::test]
async fn test_insert_and_query() {
    let (master, _store, _clock) = fresh_master().await;

    let written = master
        .modify(
            vec![insert("/a/1", "x"), insert("/a/2", "x"), insert("/b/1", "x")],
            vec![],
        )
        .await
        .unwrap();
    assert_eq!(written.len(), 3);
    assert!(written.iter().all(|t| t.version.unwrap() > 0));

    let results = master
        .query(vec![TokenQuery::new("/a/", 100)])
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    let names: Vec<_> = results[0].iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["/a/1", "/a/2"]);
    assert!(results[0].iter().all(|t| t.data == b"x"));
}

#[tokio::test]
async fn test_query_respects_max_tokens_and_order() {
    let (master, _store, _clock) = fresh_master().await;

    master
        .modify(
            vec![insert("/q/10", ""), insert("/q/2", ""), insert("/q/1", "")],
            vec![],
        )
        .await
        .unwrap();

    let results = master
        .query(vec![
            TokenQuery::new("/q/", 2),
            TokenQuery::new("/none/", 10),
        ])
        .await
        .unwrap();
    let names: Vec<_> = results[0].iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["/q/1", "/q/10"]);
    assert!(results[1].is_empty());
}

#[tokio::test]
async fn test_optimistic_conflict() {
    let (master, _store, _clock) = fresh_master().await;

    let v1 = master
        .modify(vec![insert("/k", "a")], vec![])
        .await
        .unwrap()
        .remove(0);

    // Client B updates first.
    let mut update_b = v1.clone();
    update_b.data = b"b".to_vec();
    master.modify(vec![update_b], vec![]).await.unwrap();

    // Client A still holds v1 and must lose.
    let mut update_a = v1;
    update_a.data = b"c".to_vec();
    let err = master.modify(vec![update_a], vec![]).await.unwrap_err();
    assert!(matches!(err, MasterError::VersionConflict(_)));
}

#[tokio::test]
async fn test_insert_collision_is_a_conflict() {
    let (master, _store, _clock) = fresh_master().await;

    master.modify(vec![insert("/k", "a")], vec![]).await.unwrap();
    let err = master
        .modify(vec![insert("/k", "b")], vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, MasterError::VersionConflict(_)));

    // An update naming a version of a token that does not exist is also a
    // conflict, not NOT_FOUND.
    let mut ghost = insert("/ghost", "x");
    ghost.version = Some(42);
    let err = master.modify(vec![ghost], vec![]).await.unwrap_err();
    assert!(matches!(err, MasterError::VersionConflict(_)));
}

#[tokio::test]
async fn test_delete_preconditions() {
    let (master, _store, _clock) = fresh_master().await;

    let token = master
        .modify(vec![insert("/d", "x")], vec![])
        .await
        .unwrap()
        .remove(0);

    // Delete without a version is malformed.
    let err = master
        .modify(vec![], vec![insert("/d", "x")])
        .await
        .unwrap_err();
    assert!(matches!(err, MasterError::Input(_)));

    // Delete of a missing name is NOT_FOUND.
    let mut missing = insert("/missing", "");
    missing.version = Some(1);
    let err = master.modify(vec![], vec![missing]).await.unwrap_err();
    assert!(matches!(err, MasterError::NotFound(_)));

    // Delete with a stale version is a conflict.
    let mut stale = token.clone();
    stale.version = Some(token.version.unwrap() + 1);
    let err = master.modify(vec![], vec![stale]).await.unwrap_err();
    assert!(matches!(err, MasterError::VersionConflict(_)));

    // Delete with the exact version succeeds.
    master.modify(vec![], vec![token]).await.unwrap();
    let results = master.query(vec![TokenQuery::new("/d", 1)]).await.unwrap();
    assert!(results[0].is_empty());
}

#[tokio::test]
async fn test_batch_is_all_or_nothing() {
    let (master, _store, _clock) = fresh_master().await;

    master.modify(vec![insert("/exists", "")], vec![]).await.unwrap();

    // A valid insert rides in the same batch as a colliding one; neither
    // applies.
    let err = master
        .modify(vec![insert("/new", ""), insert("/exists", "")], vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, MasterError::VersionConflict(_)));

    let results = master.query(vec![TokenQuery::new("/new", 1)]).await.unwrap();
    assert!(results[0].is_empty());
}

#[tokio::test]
async fn test_duplicate_name_in_batch_is_input_error() {
    let (master, _store, _clock) = fresh_master().await;
    let err = master
        .modify(vec![insert("/dup", "a"), insert("/dup", "b")], vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, MasterError::Input(_)));
}

#[tokio::test]
async fn test_versions_are_unique_and_increasing() {
    let (master, _store, _clock) = fresh_master().await;

    let mut token = master
        .modify(vec![insert("/v", "")], vec![])
        .await
        .unwrap()
        .remove(0);
    let mut last = token.version.unwrap();

    for _ in 0..5 {
        token = master
            .modify(vec![token], vec![])
            .await
            .unwrap()
            .remove(0);
        let version = token.version.unwrap();
        assert!(version > last);
        last = version;
    }

    master
        .modify(vec![insert("/v2", ""), insert("/v3", "")], vec![])
        .await
        .unwrap();
    let all = master.query(vec![TokenQuery::new("/", 100)]).await.unwrap();
    let mut versions: Vec<i64> = all[0].iter().map(|t| t.version.unwrap()).collect();
    versions.sort_unstable();
    versions.dedup();
    assert_eq!(versions.len(), all[0].len(), "live versions must be unique");
}

#[tokio::test]
async fn test_claim_with_lease_and_priority() {
    let (master, _store, clock) = fresh_master().await;

    master
        .modify(
            vec![
                insert("/job/runnable/J", "").with_priority(5.0),
                insert("/job/runnable/K", "").with_priority(1.0),
            ],
            vec![],
        )
        .await
        .unwrap();

    let now = 1_000;
    let claimed = master
        .query_and_own("w1", now + 60, TokenQuery::new("/job/runnable/", 1))
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].name, "/job/runnable/J");
    assert_eq!(claimed[0].owner.as_deref(), Some("w1"));
    assert_eq!(claimed[0].expiration_time, Some(now + 60));

    // J is leased; a second worker immediately gets K.
    let claimed = master
        .query_and_own("w2", now + 60, TokenQuery::new("/job/runnable/", 1))
        .await
        .unwrap();
    assert_eq!(claimed[0].name, "/job/runnable/K");

    // Everything is leased now.
    let claimed = master
        .query_and_own("w3", now + 60, TokenQuery::new("/job/runnable/", 1))
        .await
        .unwrap();
    assert!(claimed.is_empty());

    // After the leases lapse, J is claimable again and still wins on
    // priority.
    clock.advance(120);
    let claimed = master
        .query_and_own("w3", now + 240, TokenQuery::new("/job/runnable/", 1))
        .await
        .unwrap();
    assert_eq!(claimed[0].name, "/job/runnable/J");
    assert_eq!(claimed[0].owner.as_deref(), Some("w3"));
}

#[tokio::test]
async fn test_claim_ties_break_by_name() {
    let (master, _store, _clock) = fresh_master().await;

    master
        .modify(
            vec![
                insert("/t/b", "").with_priority(1.0),
                insert("/t/a", "").with_priority(1.0),
                insert("/t/c", "").with_priority(1.0),
            ],
            vec![],
        )
        .await
        .unwrap();

    let claimed = master
        .query_and_own("w", 2_000, TokenQuery::new("/t/", 2))
        .await
        .unwrap();
    let names: Vec<_> = claimed.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["/t/a", "/t/b"]);
}

#[tokio::test]
async fn test_claim_skips_parked_tokens() {
    let (master, _store, _clock) = fresh_master().await;

    master
        .modify(
            vec![
                Token::parked("/p/parked", vec![]).with_priority(100.0),
                insert("/p/free", ""),
            ],
            vec![],
        )
        .await
        .unwrap();

    let claimed = master
        .query_and_own("w", 2_000, TokenQuery::new("/p/", 10))
        .await
        .unwrap();
    let names: Vec<_> = claimed.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["/p/free"]);
}

#[tokio::test]
async fn test_claim_input_validation() {
    let (master, _store, _clock) = fresh_master().await;

    let err = master
        .query_and_own("", 2_000, TokenQuery::new("/", 1))
        .await
        .unwrap_err();
    assert!(matches!(err, MasterError::Input(_)));

    // The clock reads 1_000; a lease ending in the past is malformed.
    let err = master
        .query_and_own("w", 999, TokenQuery::new("/", 1))
        .await
        .unwrap_err();
    assert!(matches!(err, MasterError::Input(_)));
}

#[tokio::test]
async fn test_archive_moves_atomically() {
    let (master, store, _clock) = fresh_master().await;

    let name = "/workflow/W/I/job/runnable/J";
    let token = master
        .modify(vec![insert(name, "payload")], vec![])
        .await
        .unwrap()
        .remove(0);
    master
        .modify(vec![insert("/workflow/W/I/job/waiting/K", "")], vec![])
        .await
        .unwrap();

    master.archive(vec![token]).await.unwrap();

    // Gone from the current namespace...
    let results = master.query(vec![TokenQuery::new(name, 1)]).await.unwrap();
    assert!(results[0].is_empty());
    // ...and present archive-side with its name retained under the prefix.
    let archived: Vec<Token> = store
        .read_archive("/__ARCHIVE__/workflow/W/I/")
        .try_collect()
        .await
        .unwrap();
    assert_eq!(archived.len(), 1);
    assert_eq!(archived[0].name, "/__ARCHIVE__/workflow/W/I/job/runnable/J");
    assert_eq!(archived[0].data, b"payload");

    // The sibling stayed live.
    let results = master
        .query(vec![TokenQuery::new("/workflow/W/I/", 10)])
        .await
        .unwrap();
    assert_eq!(results[0].len(), 1);
}

#[tokio::test]
async fn test_archive_precondition_failure_moves_nothing() {
    let (master, store, _clock) = fresh_master().await;

    let a = master
        .modify(vec![insert("/arch/a", "")], vec![])
        .await
        .unwrap()
        .remove(0);
    let mut b = master
        .modify(vec![insert("/arch/b", "")], vec![])
        .await
        .unwrap()
        .remove(0);
    b.version = Some(b.version.unwrap() + 10);

    let err = master.archive(vec![a, b]).await.unwrap_err();
    assert!(matches!(err, MasterError::VersionConflict(_)));

    let results = master
        .query(vec![TokenQuery::new("/arch/", 10)])
        .await
        .unwrap();
    assert_eq!(results[0].len(), 2);
    assert_eq!(store.archived_count(), 0);
}

#[tokio::test]
async fn test_group_counts() {
    let (master, _store, _clock) = fresh_master().await;

    master
        .modify(
            vec![
                insert("/dir1/sub1/a", ""),
                insert("/dir1/sub1/b", ""),
                insert("/dir1/sub2/c", ""),
                insert("/dir2/x", ""),
            ],
            vec![],
        )
        .await
        .unwrap();

    let counts = master.group("/dir1/", "/").await.unwrap();
    assert_eq!(counts.len(), 2);
    assert_eq!(counts["sub1/"], 2);
    assert_eq!(counts["sub2/"], 1);

    // Without a suffix the whole remainder is the group.
    let counts = master.group("/dir1/sub1/", "").await.unwrap();
    assert_eq!(counts["a"], 1);
    assert_eq!(counts["b"], 1);
}

#[tokio::test]
async fn test_restart_recovers_acknowledged_writes() {
    let store = Arc::new(InMemoryTokenStore::new());
    let clock = ManualClock::new(1_000);

    let master = spawn_master(store.clone(), clock.clone()).await;
    let token = master
        .modify(vec![insert("/durable", "kept")], vec![])
        .await
        .unwrap()
        .remove(0);
    let first_version = token.version.unwrap();
    drop(master);

    // A new master over the same store sees the acknowledged write and keeps
    // assigning versions above everything it ever handed out.
    let master = spawn_master(store, clock).await;
    let results = master
        .query(vec![TokenQuery::new("/durable", 1)])
        .await
        .unwrap();
    assert_eq!(results[0][0].data, b"kept");
    assert_eq!(results[0][0].version, Some(first_version));

    let fresh = master
        .modify(vec![insert("/after-restart", "")], vec![])
        .await
        .unwrap()
        .remove(0);
    assert!(fresh.version.unwrap() > first_version);
}

#[tokio::test]
async fn test_lease_extension_through_modify() {
    let (master, _store, clock) = fresh_master().await;

    master.modify(vec![insert("/lease/j", "")], vec![]).await.unwrap();
    let mut claimed = master
        .query_and_own("w1", 1_060, TokenQuery::new("/lease/", 1))
        .await
        .unwrap()
        .remove(0);

    // Extend the lease before it lapses, as a running worker would.
    claimed.expiration_time = Some(1_200);
    master.modify(vec![claimed], vec![]).await.unwrap();

    clock.set(1_100);
    let reclaimed = master
        .query_and_own("w2", 1_300, TokenQuery::new("/lease/", 1))
        .await
        .unwrap();
    assert!(reclaimed.is_empty(), "extended lease must hold");

    clock.set(1_250);
    let reclaimed = master
        .query_and_own("w2", 1_400, TokenQuery::new("/lease/", 1))
        .await
        .unwrap();
    assert_eq!(reclaimed.len(), 1);
}
