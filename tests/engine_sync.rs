//! Live engine integration: the coalescing trigger drives a spawned view
//! engine against the in-memory backend, and the display model consumes
//! the resulting event stream.

mod common;

use std::time::Duration;

use common::{
    entries_rig, entry_id, flat_rig_capped, grow_storage, seeded_client, storages_rig,
    storages_rig_with, PAGE, SETTLE,
};
use porthole::client::fragment_count;
use porthole::filter::{EntryFilter, EntryTypeFilter, StorageFilter};
use porthole::trigger::{TriggerPort, TriggerTuning};
use porthole::types::EntryType;
use tokio::time::sleep;

#[tokio::test]
async fn burst_of_requests_coalesces_into_one_pass() {
    let mut rig = storages_rig(seeded_client(), false);
    rig.trigger
        .request_full_refresh(StorageFilter::default(), true);
    rig.trigger.request_page_refresh(0);
    rig.trigger.request_page_refresh(5);
    let labels = rig.drain().await;

    assert_eq!(rig.client.commands_matching("INDEX_STORAGE_COUNT").len(), 1);
    // Offset 5 rounds down to its page; the full pass serves pages 0 and 4.
    assert_eq!(rig.client.commands_matching("INDEX_STORAGE_LIST").len(), 2);
    assert!(labels.contains(&"count:7".to_string()));
    assert_eq!(rig.model.total(), 7);
    assert_eq!(rig.model.rows_in(0..7).len(), 7);
    rig.shutdown().await;
}

#[tokio::test]
async fn new_filter_supersedes_the_running_pass() {
    let mut rig = storages_rig(seeded_client(), false);
    rig.client.set_row_delay(Duration::from_millis(20));
    rig.trigger
        .request_full_refresh(StorageFilter::default(), true);
    sleep(Duration::from_millis(70)).await;
    let narrowed = StorageFilter {
        pattern: "beta".to_string(),
        ..StorageFilter::default()
    };
    rig.trigger.request_full_refresh(narrowed, false);
    let labels = rig.drain_quiet(Duration::from_millis(250)).await;

    assert!(rig.client.aborted_count() >= 1);
    assert_eq!(rig.model.total(), 2);
    let last_count = labels
        .iter()
        .filter(|l| l.starts_with("count:"))
        .last()
        .unwrap();
    assert_eq!(last_count, "count:2");
    let names: Vec<&str> = rig.model.rows_in(0..2).iter().map(|r| r.name()).collect();
    assert_eq!(names, vec!["beta-001.bar", "beta-002.bar"]);
    rig.shutdown().await;
}

#[tokio::test]
async fn filter_changes_requery_and_short_patterns_query_empty() {
    let mut rig = storages_rig(seeded_client(), false);
    rig.trigger
        .request_full_refresh(StorageFilter::default(), true);
    rig.drain().await;
    assert_eq!(rig.model.total(), 7);

    let narrowed = StorageFilter {
        pattern: "alpha".to_string(),
        ..StorageFilter::default()
    };
    rig.trigger.request_full_refresh(narrowed, false);
    rig.drain().await;
    assert_eq!(rig.model.total(), 4);
    assert!(rig
        .model
        .rows_in(0..4)
        .iter()
        .all(|r| r.name().contains("alpha")));

    // Below the minimum pattern length the backend sees an empty pattern.
    let short = StorageFilter {
        pattern: "al".to_string(),
        ..StorageFilter::default()
    };
    rig.trigger.request_full_refresh(short, false);
    rig.drain().await;
    assert_eq!(rig.model.total(), 7);
    let counts = rig.client.commands_matching("INDEX_STORAGE_COUNT");
    assert!(counts.last().unwrap().contains("pattern=''"));
    rig.shutdown().await;
}

#[tokio::test]
async fn count_failure_degrades_to_an_empty_view_until_recovery() {
    let mut rig = storages_rig(seeded_client(), false);
    rig.client.fail_once("INDEX_STORAGE_COUNT", 1);
    rig.trigger
        .request_full_refresh(StorageFilter::default(), true);
    let labels = rig.drain().await;

    assert!(labels.contains(&"count:0".to_string()));
    assert_eq!(rig.model.total(), 0);
    assert_eq!(labels.first().unwrap(), "busy:true");
    assert_eq!(labels.last().unwrap(), "busy:false");

    rig.trigger.request_immediate_refresh();
    rig.drain().await;
    assert_eq!(rig.model.total(), 7);
    rig.shutdown().await;
}

#[tokio::test]
async fn background_poll_is_silent_and_picks_up_remote_growth() {
    let mut rig = storages_rig_with(
        seeded_client(),
        false,
        TriggerTuning {
            settle: SETTLE,
            poll: Duration::from_millis(400),
            page_size: PAGE,
        },
    );
    rig.trigger
        .request_full_refresh(StorageFilter::default(), true);
    let labels = rig.drain().await;
    assert!(labels.contains(&"busy:true".to_string()));
    assert_eq!(rig.model.total(), 7);

    // A storage appears behind the view's back; the next poll must find it.
    grow_storage(&rig.client, "alpha-900.bar", 900, 1_700_400_000, 8_000);

    let labels = rig.drain_quiet(Duration::from_millis(300)).await;
    assert!(!labels.contains(&"busy:true".to_string()));
    assert!(labels.contains(&"count:8".to_string()));
    assert_eq!(rig.model.total(), 8);
    rig.shutdown().await;
}

#[tokio::test]
async fn row_overrun_abandons_the_pass_without_killing_the_loop() {
    let mut rig = storages_rig(seeded_client(), false);
    rig.client.force_overrun("INDEX_STORAGE_LIST");
    rig.trigger
        .request_full_refresh(StorageFilter::default(), true);
    let labels = rig.drain().await;

    // The count landed but the offending page was discarded.
    assert!(labels.contains(&"count:7".to_string()));
    assert!(!labels.iter().any(|l| l.starts_with("page:")));
    if cfg!(debug_assertions) {
        assert_eq!(rig.client.reset_count(), 1);
    }

    rig.trigger.request_immediate_refresh();
    rig.drain().await;
    assert_eq!(rig.client.commands_matching("INDEX_STORAGE_COUNT").len(), 2);
    if cfg!(debug_assertions) {
        assert_eq!(rig.client.reset_count(), 2);
    }
    rig.shutdown().await;
}

#[tokio::test]
async fn missing_pages_are_fetched_on_demand() {
    let mut rig = storages_rig(seeded_client(), false);
    rig.trigger
        .request_full_refresh(StorageFilter::default(), true);
    rig.drain().await;
    // Only page zero is materialized by the first pass; asking for the rest
    // queues the missing page.
    assert_eq!(rig.model.rows_in(0..7).len(), 4);

    let labels = rig.drain().await;
    assert!(labels.contains(&"page:4+3".to_string()));
    assert_eq!(rig.model.rows_in(0..7).len(), 7);
    assert_eq!(rig.model.row_at(6).unwrap().name(), "stray-001.bar");
    rig.shutdown().await;
}

#[tokio::test]
async fn display_cap_clamps_materialized_rows() {
    let mut rig = flat_rig_capped(seeded_client(), 6);
    rig.trigger
        .request_full_refresh(StorageFilter::default(), true);
    rig.drain().await;
    assert_eq!(rig.model.total(), 7);
    assert_eq!(rig.model.display_len(), 6);

    let _ = rig.model.rows_in(0..7);
    rig.drain().await;
    // The second page is clipped to the rows below the cap.
    assert_eq!(rig.model.rows_in(0..7).len(), 6);
    rig.shutdown().await;
}

#[tokio::test]
async fn entries_view_counts_and_dedupes_newest_versions() {
    let mut rig = entries_rig(seeded_client());
    rig.trigger
        .request_full_refresh(EntryFilter::default(), true);
    rig.drain().await;
    assert_eq!(rig.model.total(), 9);

    let newest = EntryFilter {
        newest_only: true,
        ..EntryFilter::default()
    };
    rig.trigger.request_full_refresh(newest, false);
    rig.drain().await;
    assert_eq!(rig.model.total(), 8);

    let _ = rig.model.rows_in(0..8);
    rig.drain().await;
    let rows = rig.model.rows_in(0..8);
    let fstabs: Vec<_> = rows.iter().filter(|r| r.name() == "/etc/fstab").collect();
    assert_eq!(fstabs.len(), 1);
    // The surviving version is the one from the newer storage.
    assert_eq!(fstabs[0].total_size(), 220);
    rig.shutdown().await;
}

#[tokio::test]
async fn entry_type_filter_narrows_the_flat_view() {
    let mut rig = entries_rig(seeded_client());
    let images = EntryFilter {
        entry_types: EntryTypeFilter::Only(vec![EntryType::Image]),
        ..EntryFilter::default()
    };
    rig.trigger.request_full_refresh(images, true);
    rig.drain().await;
    assert_eq!(rig.model.total(), 2);
    let names: Vec<&str> = rig.model.rows_in(0..2).iter().map(|r| r.name()).collect();
    assert_eq!(names, vec!["/disk0.raw", "/srv/disk.img"]);
    rig.shutdown().await;
}

#[tokio::test]
async fn fragment_counts_are_fetched_per_entry() {
    let client = seeded_client();
    let entry = entry_id(&client, "/var/log/syslog");
    let count = fragment_count(client.as_ref(), entry).await.unwrap();
    assert_eq!(count, 4);
}
