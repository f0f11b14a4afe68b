#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::{Account, BackendUnderTest, Profile, Session, doc};
use serde_json::json;
use strata_storage::{ListOptions, Query, StorageError};

#[tokio::test]
async fn conformance_memory() {
    run_conformance(&common::bring_up_memory()).await;
}

#[tokio::test]
async fn conformance_embedded() {
    run_conformance(&common::bring_up_embedded()).await;
}

#[tokio::test]
async fn conformance_sqlite() {
    run_conformance(&common::bring_up_sqlite()).await;
}

#[cfg(feature = "integration")]
#[tokio::test]
async fn conformance_postgres() -> anyhow::Result<()> {
    run_conformance(&common::bring_up_postgres().await?).await;
    Ok(())
}

#[cfg(feature = "integration")]
#[tokio::test]
async fn conformance_mongo() -> anyhow::Result<()> {
    run_conformance(&common::bring_up_mongo().await?).await;
    Ok(())
}

/// Runs the same assertions for any backend.
async fn run_conformance(but: &BackendUnderTest) {
    but.storage.init().await.unwrap();
    // init is idempotent
    but.storage.init().await.unwrap();

    round_trip(but).await;
    identity_uniqueness(but).await;
    not_found(but).await;
    delete_idempotence(but).await;
    account_scenario(but).await;
    underscore_kinds(but).await;
    concurrent_writes(but).await;
    invalid_input(but).await;
    disposed(but).await;
}

async fn round_trip(but: &BackendUnderTest) {
    let storage = &but.storage;
    let account = Account {
        id: "rt-1".to_owned(),
        email: "ann@example.com".to_owned(),
        active: true,
        profile: Profile {
            name: "Ann".to_owned(),
            age: Some(34),
        },
        tags: vec!["admin".to_owned(), "beta".to_owned()],
    };
    storage.save(&account).await.unwrap();
    assert_eq!(
        storage.get::<Account>("rt-1").await.unwrap(),
        account,
        "{}",
        but.name
    );

    let session = Session {
        id: "s-1".to_owned(),
        account_id: "rt-1".to_owned(),
        expires_at: 1_767_225_600,
        scopes: vec!["read".to_owned()],
    };
    storage.save(&session).await.unwrap();
    assert_eq!(
        storage.get_with(Session::default(), "s-1").await.unwrap(),
        session,
        "{}",
        but.name
    );

    // kinds are separate namespaces
    let err = storage.get::<Session>("rt-1").await.unwrap_err();
    assert!(err.is_not_found(), "{}: {err}", but.name);

    storage.delete(&account).await.unwrap();
    storage.delete(&session).await.unwrap();
}

async fn identity_uniqueness(but: &BackendUnderTest) {
    let storage = &but.storage;
    let mut account = Account::new("dup", "first@example.com", true);
    storage.save(&account).await.unwrap();
    account.email = "second@example.com".to_owned();
    storage.save(&account).await.unwrap();

    let stored = storage.get::<Account>("dup").await.unwrap();
    assert_eq!(stored.email, "second@example.com", "{}", but.name);
    let dup = Query::eq("id", "dup");
    assert_eq!(
        storage.count::<Account>(Some(&dup)).await.unwrap(),
        1,
        "{}",
        but.name
    );
    let listed = storage
        .list::<Account>(&ListOptions::new().with_query(dup))
        .await
        .unwrap();
    assert_eq!(listed, [account.clone()], "{}", but.name);

    storage.delete(&account).await.unwrap();
}

async fn not_found(but: &BackendUnderTest) {
    let storage = &but.storage;
    let err = storage.get::<Account>("never-saved").await.unwrap_err();
    let StorageError::NotFound { kind, id } = &err else {
        panic!("{}: {err}", but.name);
    };
    assert_eq!(
        (kind.as_str(), id.as_str()),
        ("account", "never-saved"),
        "{}",
        but.name
    );

    let account = Account::new("gone", "gone@example.com", false);
    storage.save(&account).await.unwrap();
    storage.delete(&account).await.unwrap();
    let err = storage
        .get_with(Account::default(), "gone")
        .await
        .unwrap_err();
    assert!(err.is_not_found(), "{}: {err}", but.name);
    assert!(
        storage
            .backend()
            .get_raw("account", "gone")
            .await
            .unwrap()
            .is_none(),
        "{}",
        but.name
    );
}

async fn delete_idempotence(but: &BackendUnderTest) {
    let storage = &but.storage;
    storage.delete_by_id("account", "no-such-id").await.unwrap();

    let account = Account::new("twice", "twice@example.com", true);
    storage.save(&account).await.unwrap();
    storage.delete(&account).await.unwrap();
    storage.delete(&account).await.unwrap();
    assert_eq!(
        storage.count::<Account>(Some(&Query::eq("id", "twice"))).await.unwrap(),
        0,
        "{}",
        but.name
    );
}

async fn account_scenario(but: &BackendUnderTest) {
    let storage = &but.storage;
    let active = ListOptions::new().with_query(Query::eq("active", true));
    let inactive = ListOptions::new().with_query(Query::eq("active", false));

    storage
        .save(&Account::new("a1", "x@example.com", true))
        .await
        .unwrap();
    assert_eq!(
        common::list_ids(&but.storage, "account", &active).await,
        ["a1"],
        "{}",
        but.name
    );

    storage
        .save(&Account::new("a1", "x@example.com", false))
        .await
        .unwrap();
    assert!(
        common::list_ids(&but.storage, "account", &active)
            .await
            .is_empty(),
        "{}",
        but.name
    );
    assert_eq!(
        common::list_ids(&but.storage, "account", &inactive).await,
        ["a1"],
        "{}",
        but.name
    );

    storage.delete_by_id("account", "a1").await.unwrap();
}

async fn underscore_kinds(but: &BackendUnderTest) {
    let backend = but.storage.backend();
    let long_kind = doc(json!({"who": "change_log/x"}));
    let short_kind = doc(json!({"who": "change/log_x"}));
    backend
        .save_raw("change_log", "x", &long_kind)
        .await
        .unwrap();
    backend
        .save_raw("change", "log_x", &short_kind)
        .await
        .unwrap();

    assert_eq!(
        backend.get_raw("change_log", "x").await.unwrap(),
        Some(long_kind),
        "{}",
        but.name
    );
    assert_eq!(
        backend.get_raw("change", "log_x").await.unwrap(),
        Some(short_kind),
        "{}",
        but.name
    );
    assert_eq!(
        backend.count("change_log", None).await.unwrap(),
        1,
        "{}",
        but.name
    );
    assert_eq!(
        common::list_ids(&but.storage, "change", &ListOptions::new()).await,
        ["log_x"],
        "{}",
        but.name
    );

    backend.delete_raw("change_log", "x").await.unwrap();
    assert!(
        backend.get_raw("change", "log_x").await.unwrap().is_some(),
        "{}",
        but.name
    );
    backend.delete_raw("change", "log_x").await.unwrap();
}

async fn concurrent_writes(but: &BackendUnderTest) {
    // first use of a kind from many tasks at once, distinct ids
    let mut handles = vec![];
    for i in 0..24 {
        let storage = but.storage.clone();
        handles.push(tokio::spawn(async move {
            storage
                .backend()
                .save_raw("burst", &format!("b{i:02}"), &doc(json!({"n": i})))
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    assert_eq!(
        but.storage.count_kind("burst", None).await.unwrap(),
        24,
        "{}",
        but.name
    );
    let late = Query::gte("n", 20);
    assert_eq!(
        common::list_ids(&but.storage, "burst", &ListOptions::new().with_query(late)).await,
        ["b20", "b21", "b22", "b23"],
        "{}",
        but.name
    );

    // one id from many tasks: a single record, written whole by one of them
    let mut handles = vec![];
    for writer in 0..16 {
        let storage = but.storage.clone();
        handles.push(tokio::spawn(async move {
            let raw = doc(json!({"writer": writer, "tag": format!("w{writer}")}));
            storage.backend().save_raw("burst", "contended", &raw).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    let winner = but
        .storage
        .backend()
        .get_raw("burst", "contended")
        .await
        .unwrap()
        .unwrap();
    let writer = winner["writer"].as_i64().unwrap();
    assert!((0..16).contains(&writer), "{}", but.name);
    assert_eq!(winner["tag"], json!(format!("w{writer}")), "{}", but.name);
    assert_eq!(
        but.storage.count_kind("burst", None).await.unwrap(),
        25,
        "{}",
        but.name
    );
}

async fn invalid_input(but: &BackendUnderTest) {
    let backend = but.storage.backend();
    for kind in ["bad-kind", "1account", ""] {
        let err = backend.get_raw(kind, "x").await.unwrap_err();
        assert!(
            matches!(err, StorageError::InvalidKind(_)),
            "{}: {err}",
            but.name
        );
    }
    let err = backend
        .list_raw("account; drop table account", &ListOptions::new())
        .await
        .unwrap_err();
    assert!(
        matches!(err, StorageError::InvalidKind(_)),
        "{}: {err}",
        but.name
    );

    let err = backend
        .save_raw("account", "", &doc(json!({})))
        .await
        .unwrap_err();
    assert!(
        matches!(err, StorageError::InvalidId(_)),
        "{}: {err}",
        but.name
    );

    let malformed = ListOptions::new().with_query(Query::eq("profile..age", 3));
    let err = backend.list_raw("account", &malformed).await.unwrap_err();
    assert!(
        matches!(err, StorageError::InvalidQuery(_)),
        "{}: {err}",
        but.name
    );
    let err = backend
        .count("account", Some(&Query::gt("", 1)))
        .await
        .unwrap_err();
    assert!(
        matches!(err, StorageError::InvalidQuery(_)),
        "{}: {err}",
        but.name
    );
}

async fn disposed(but: &BackendUnderTest) {
    let storage = &but.storage;
    storage.dispose().await.unwrap();
    storage.dispose().await.unwrap();

    let err = storage.get::<Account>("a1").await.unwrap_err();
    assert!(matches!(err, StorageError::Disposed), "{}: {err}", but.name);
    let err = storage
        .save(&Account::new("late", "late@example.com", true))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::Disposed), "{}: {err}", but.name);
}
