//! End-to-end merge passes against an in-memory SQLite database.

mod common;

use common::*;

use identity_resolution::domain::{AlternateIdType, RawEvent, WatermarkSource};
use identity_resolution::{EventSource, IdentityError, IdentityStore};

#[tokio::test]
async fn test_first_pass_creates_identities_and_alternates() {
    let db = create_test_db().await;
    db.load(&[fb_event(6, "D1", H1, "F1"), email_event(6, "D2", H1)])
        .await;

    let report = db.engine().merge_at(None, ts(6)).await.unwrap();
    assert_eq!(report.watermark.source, WatermarkSource::EpochFloor);
    assert_eq!(report.events_scanned, 2);
    assert_eq!(report.identities_inserted, 2);
    assert_eq!(report.alternates_inserted, 1);
    assert_eq!(report.latest_event_date, Some(date(6)));

    let mut devices: Vec<String> = db.identities(H1).await.into_iter().map(|r| r.ga_id).collect();
    devices.sort();
    assert_eq!(devices, vec!["D1", "D2"]);

    let alternates = db.store.all_alternates().await.unwrap();
    assert_eq!(alternates.len(), 1);
    assert_eq!(alternates[0].hashed_email, H1);
    assert_eq!(alternates[0].alternate_id_type, AlternateIdType::Facebook);
    assert_eq!(alternates[0].alternate_id, vec!["F1"]);
    assert_eq!(alternates[0].updated_date, vec![ts(6)]);

    let d1 = db.identity(H1, "D1").await;
    assert_eq!(d1.created_date, ts(6));
    assert_eq!(d1.updated_date, vec![ts(6)]);
    assert_eq!(d1.last_event_date, Some(date(6)));
}

#[tokio::test]
async fn test_second_pass_appends_alternate_and_history() {
    let db = create_test_db().await;
    db.load(&[fb_event(6, "D1", H1, "F1"), email_event(6, "D2", H1)])
        .await;
    db.engine().merge_at(None, ts(6)).await.unwrap();
    let first_id = db.identity(H1, "D1").await.id;

    db.load(&[fb_event(7, "D1", H1, "F2")]).await;
    let report = db.engine().merge_at(None, ts(7)).await.unwrap();

    assert_eq!(report.watermark.source, WatermarkSource::Derived);
    assert_eq!(report.watermark.date, date(6));
    assert_eq!(report.events_scanned, 1);
    assert_eq!(report.identities_inserted, 0);
    assert_eq!(report.identities_updated, 1);
    assert_eq!(report.alternates_updated, 1);
    assert_eq!(report.alternate_ids_added, 1);

    assert_eq!(db.store.identity_count().await.unwrap(), 2);

    let d1 = db.identity(H1, "D1").await;
    assert_eq!(d1.id, first_id);
    assert_eq!(d1.created_date, ts(6));
    assert_eq!(d1.updated_date, vec![ts(6), ts(7)]);
    assert_eq!(d1.last_event_date, Some(date(7)));

    let d2 = db.identity(H1, "D2").await;
    assert_eq!(d2.updated_date, vec![ts(6)]);

    let alternates = db.store.all_alternates().await.unwrap();
    assert_eq!(alternates.len(), 1);
    assert_eq!(alternates[0].alternate_id, vec!["F1", "F2"]);
    assert_eq!(alternates[0].updated_date, vec![ts(6), ts(7)]);
}

#[tokio::test]
async fn test_alternate_ids_without_email_are_discarded() {
    let db = create_test_db().await;
    db.load(&[identity_resolution::domain::EventRecord::new(date(6), "D9")
        .with_alternate_id(AlternateIdType::TikTok, "T1")])
        .await;

    let report = db.engine().merge_at(None, ts(6)).await.unwrap();
    assert_eq!(report.orphaned_alternate_ids, 1);
    assert!(report.is_noop());
    assert_eq!(db.store.identity_count().await.unwrap(), 0);
    assert_eq!(db.store.alternate_count().await.unwrap(), 0);

    // A later event for the same device does not resurrect the dropped id
    db.load(&[email_event(7, "D9", H2)]).await;
    db.engine().merge_at(None, ts(7)).await.unwrap();
    assert_eq!(db.identities(H2).await.len(), 1);
    assert_eq!(db.store.alternate_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_rerun_with_explicit_watermark_is_idempotent() {
    let db = create_test_db().await;
    db.load(&[fb_event(6, "D1", H1, "F1"), email_event(6, "D2", H1)])
        .await;
    db.engine().merge_at(None, ts(6)).await.unwrap();
    let before = db.identities(H1).await;
    let alternates_before = db.store.all_alternates().await.unwrap();

    let report = db.engine().merge_at(Some(date(5)), ts(8)).await.unwrap();
    assert_eq!(report.watermark.source, WatermarkSource::Explicit);
    assert_eq!(report.events_scanned, 2);
    assert_eq!(report.replayed_identities, 2);
    assert!(report.is_noop());

    let mut after = db.identities(H1).await;
    let mut before = before;
    before.sort_by(|a, b| a.ga_id.cmp(&b.ga_id));
    after.sort_by(|a, b| a.ga_id.cmp(&b.ga_id));
    assert_eq!(after, before);
    assert_eq!(db.store.all_alternates().await.unwrap(), alternates_before);
}

#[tokio::test]
async fn test_late_event_in_merged_partition_is_stamped() {
    let db = create_test_db().await;
    db.load(&[fb_event(6, "D1", H1, "F1"), email_event(6, "D2", H1)])
        .await;
    db.engine().merge_at(None, ts(6)).await.unwrap();

    // Exported late into the partition that was already merged
    db.load(&[fb_event(6, "D1", H1, "F2")]).await;
    let report = db.engine().merge_at(Some(date(5)), ts(8)).await.unwrap();

    assert_eq!(report.identities_updated, 1);
    assert_eq!(report.replayed_identities, 1);
    assert_eq!(report.alternates_updated, 1);

    assert_eq!(db.identity(H1, "D1").await.updated_date, vec![ts(6), ts(8)]);
    assert_eq!(db.identity(H1, "D2").await.updated_date, vec![ts(6)]);

    let alternates = db.store.all_alternates().await.unwrap();
    assert_eq!(alternates[0].alternate_id, vec!["F1", "F2"]);
    assert_eq!(alternates[0].updated_date, vec![ts(6), ts(8)]);
}

#[tokio::test]
async fn test_rerun_with_derived_watermark_scans_nothing() {
    let db = create_test_db().await;
    db.load(&[fb_event(6, "D1", H1, "F1")]).await;
    db.engine().merge_at(None, ts(6)).await.unwrap();

    let report = db.engine().merge_at(None, ts(6)).await.unwrap();
    assert_eq!(report.watermark.date, date(6));
    assert_eq!(report.events_scanned, 0);
    assert!(report.is_noop());
    assert_eq!(db.identity(H1, "D1").await.updated_date.len(), 1);
}

#[tokio::test]
async fn test_malformed_events_are_skipped() {
    let db = create_test_db().await;
    db.load(&[email_event(6, "D1", H1)]).await;
    db.events
        .append_raw(&[
            RawEvent {
                event_date: "20250606".to_string(),
                device_id: Some("D2".to_string()),
                event_params: "{not json".to_string(),
            },
            RawEvent {
                event_date: "20250606".to_string(),
                device_id: None,
                event_params: r#"[{"key":"guid_email","value":{"string_value":"H1"}}]"#
                    .to_string(),
            },
        ])
        .await
        .unwrap();

    let report = db.engine().merge_at(None, ts(6)).await.unwrap();
    assert_eq!(report.events_scanned, 3);
    assert_eq!(report.events_skipped, 2);
    assert_eq!(report.identities_inserted, 1);
    assert_eq!(db.identities(H1).await.len(), 1);
}

#[tokio::test]
async fn test_failed_write_leaves_tables_untouched() {
    let db = create_test_db().await;
    db.load(&[fb_event(6, "D1", H1, "F1"), email_event(6, "D2", H1)])
        .await;

    sqlx::query(
        r#"
        CREATE TRIGGER reject_alternates BEFORE INSERT ON alternate_identity_match
        BEGIN
            SELECT RAISE(ABORT, 'alternate writes disabled');
        END
        "#,
    )
    .execute(db.store.pool())
    .await
    .unwrap();

    let err = db.engine().merge_at(None, ts(6)).await.unwrap_err();
    match err {
        IdentityError::MergeFailed {
            watermark,
            events_scanned,
            ..
        } => {
            assert_eq!(watermark, date(3));
            assert_eq!(events_scanned, 2);
        }
        other => panic!("expected MergeFailed, got {other:?}"),
    }

    assert_eq!(db.store.identity_count().await.unwrap(), 0);
    assert_eq!(db.store.alternate_count().await.unwrap(), 0);

    sqlx::query("DROP TRIGGER reject_alternates")
        .execute(db.store.pool())
        .await
        .unwrap();

    let report = db.engine().merge_at(None, ts(6)).await.unwrap();
    assert_eq!(report.identities_inserted, 2);
    assert_eq!(report.alternates_inserted, 1);
}

#[tokio::test]
async fn test_cross_device_summary() {
    let db = create_test_db().await;
    db.load(&[
        email_event(6, "D1", H1),
        email_event(6, "D2", H1),
        email_event(6, "D3", H1),
        email_event(6, "D4", H2),
    ])
    .await;
    db.engine().merge_at(None, ts(6)).await.unwrap();

    let summary = db.store.cross_device_summary(2).await.unwrap();
    assert_eq!(summary.len(), 1);
    assert_eq!(summary[0].hashed_email, H1);
    assert_eq!(summary[0].device_count, 3);
    assert!(summary[0].is_cross_device());

    let everyone = db.store.cross_device_summary(1).await.unwrap();
    assert_eq!(everyone.len(), 2);
}

#[tokio::test]
async fn test_update_history_never_goes_backwards() {
    let db = create_test_db().await;
    db.load(&[email_event(6, "D1", H1)]).await;
    db.engine().merge_at(None, ts(6)).await.unwrap();

    db.load(&[email_event(7, "D1", H1)]).await;
    db.engine().merge_at(None, ts(7)).await.unwrap();

    // Clock behind the last stamp
    db.load(&[email_event(8, "D1", H1)]).await;
    db.engine().merge_at(None, ts(5)).await.unwrap();

    let d1 = db.identity(H1, "D1").await;
    assert_eq!(d1.updated_date, vec![ts(6), ts(7), ts(7)]);
    assert!(d1.updated_date.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(d1.last_event_date, Some(date(8)));
    assert_eq!(db.store.latest_update().await.unwrap(), Some(ts(7)));
}

#[tokio::test]
async fn test_partitions_and_window_scan() {
    let db = create_test_db().await;
    db.load(&[
        email_event(7, "D1", H1),
        email_event(5, "D2", H1),
        email_event(7, "D3", H2),
    ])
    .await;

    assert_eq!(db.events.partitions().await.unwrap(), vec![date(5), date(7)]);

    let window = db.events.scan_after(Some(date(5))).await.unwrap();
    assert_eq!(window.len(), 2);
    assert!(window.iter().all(|e| e.event_date == "20250607"));

    assert_eq!(db.events.scan_after(None).await.unwrap().len(), 3);
}
