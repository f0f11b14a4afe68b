#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::collections::HashSet;

use common::{BackendUnderTest, doc};
use serde_json::json;
use strata_storage::{ListOptions, Query, SortDir};

const KIND: &str = "ticket";
const RECORDS: usize = 37;

async fn seed(but: &BackendUnderTest) {
    for i in 0..RECORDS {
        // few distinct priorities so most pages cut through ties
        let value = match i % 6 {
            0 => json!({"title": format!("t{i}")}),
            1 => json!({"title": format!("t{i}"), "priority": null}),
            n => json!({"title": format!("t{i}"), "priority": n % 3, "open": i % 2 == 0}),
        };
        but.storage
            .backend()
            .save_raw(KIND, &format!("tk-{i:03}"), &doc(value))
            .await
            .unwrap();
    }
}

async fn paged(but: &BackendUnderTest, base: &ListOptions, page: usize) -> Vec<String> {
    let mut ids = Vec::new();
    let mut offset = 0;
    loop {
        let options = base.clone().with_offset(offset).with_limit(page);
        let chunk = common::list_ids(&but.storage, KIND, &options).await;
        assert!(chunk.len() <= page, "{}", but.name);
        let done = chunk.len() < page;
        ids.extend(chunk);
        if done {
            return ids;
        }
        offset += page;
    }
}

async fn assert_pages_partition(but: &BackendUnderTest) {
    seed(but).await;
    let orders = [
        ListOptions::new().with_order_by("priority", SortDir::Asc),
        ListOptions::new().with_order_by("priority", SortDir::Desc),
        ListOptions::new().with_order_by("title", SortDir::Asc),
        ListOptions::new()
            .with_query(Query::eq("open", true))
            .with_order_by("priority", SortDir::Desc),
        ListOptions::new(),
    ];
    for base in &orders {
        let full = common::list_ids(&but.storage, KIND, base).await;
        for page in [1, 5, 7, RECORDS] {
            let pages = paged(but, base, page).await;
            assert_eq!(pages, full, "{} page={page} {base:?}", but.name);
            let unique: HashSet<_> = pages.iter().collect();
            assert_eq!(unique.len(), pages.len(), "{} duplicates", but.name);
        }
    }

    let all = ListOptions::new().with_order_by("priority", SortDir::Asc);
    let past_end = all.clone().with_offset(RECORDS + 3);
    assert!(
        common::list_ids(&but.storage, KIND, &past_end)
            .await
            .is_empty(),
        "{}",
        but.name
    );
    let zero = all.clone().with_limit(0);
    assert!(
        common::list_ids(&but.storage, KIND, &zero).await.is_empty(),
        "{}",
        but.name
    );
    let tail = all.with_offset(RECORDS - 2);
    assert_eq!(
        common::list_ids(&but.storage, KIND, &tail).await.len(),
        2,
        "{}",
        but.name
    );

    // count agrees with an unwindowed list
    let open = Query::eq("open", true);
    let count = but.storage.count_kind(KIND, Some(&open)).await.unwrap();
    let unwindowed = ListOptions::new().with_query(open);
    assert_eq!(
        count,
        common::list_ids(&but.storage, KIND, &unwindowed).await.len() as u64,
        "{}",
        but.name
    );
}

#[tokio::test]
async fn memory_pages_partition_the_ordered_result() {
    assert_pages_partition(&common::bring_up_memory()).await;
}

#[tokio::test]
async fn embedded_pages_partition_the_ordered_result() {
    assert_pages_partition(&common::bring_up_embedded()).await;
}

#[tokio::test]
async fn sqlite_pages_partition_the_ordered_result() {
    assert_pages_partition(&common::bring_up_sqlite()).await;
}

#[cfg(feature = "integration")]
#[tokio::test]
async fn postgres_pages_partition_the_ordered_result() -> anyhow::Result<()> {
    assert_pages_partition(&common::bring_up_postgres().await?).await;
    Ok(())
}

#[cfg(feature = "integration")]
#[tokio::test]
async fn mongo_pages_partition_the_ordered_result() -> anyhow::Result<()> {
    assert_pages_partition(&common::bring_up_mongo().await?).await;
    Ok(())
}
