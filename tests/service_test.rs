//! End-to-end tests for assignment, tracking and reporting
//!
//! Every test builds a fresh service; nothing is shared between cases.

use std::sync::Arc;

use trueno_ab::events::EventKind;
use trueno_ab::experiment::{Experiment, Variant};
use trueno_ab::kv::{KvStore, MemoryKvStore};
use trueno_ab::{ExperimentService, ServiceConfig};

fn checkout() -> Experiment {
    Experiment::builder("checkout-cta", "Checkout CTA")
        .variant(Variant::new("A", "Buy now", 0.5))
        .variant(Variant::new("B", "Complete purchase", 0.5))
        .build()
        .unwrap()
}

/// Service whose identity is pinned to `identity` before first use.
async fn service_for(identity: &str, baseline: Vec<Experiment>) -> ExperimentService {
    let store = Arc::new(MemoryKvStore::new());
    store
        .set("ab.identity", identity.as_bytes().to_vec())
        .await
        .unwrap();
    let service = ExperimentService::builder()
        .baseline(baseline)
        .shared_store(store)
        .build()
        .unwrap();
    service.init().await;
    service
}

#[tokio::test]
async fn test_known_identity_gets_known_variant() {
    let service = service_for("user-42", vec![checkout()]).await;

    // hash("user-42:checkout-cta") = 520590979 → r = 0.0979 → first variant
    for _ in 0..10 {
        assert_eq!(service.get_variant("checkout-cta").await.as_deref(), Some("A"));
    }
    assert!(service.is_variant("checkout-cta", "A").await);
    assert!(!service.is_variant("checkout-cta", "B").await);
}

#[tokio::test]
async fn test_single_assignment_event_for_repeated_reads() {
    let service = service_for("user-42", vec![checkout()]).await;
    for _ in 0..5 {
        service.get_variant("checkout-cta").await;
    }

    let assignments: Vec<_> = service
        .events()
        .await
        .into_iter()
        .filter(|e| e.kind() == EventKind::Assignment)
        .collect();
    assert_eq!(assignments.len(), 1);
    assert_eq!(assignments[0].variant_id(), "A");
}

#[tokio::test]
async fn test_conversion_before_assignment_is_noop() {
    let service = service_for("user-42", vec![checkout()]).await;

    assert!(service.record_conversion("checkout-cta", None).await.is_none());
    assert!(service.record_view("checkout-cta").await.is_none());
    assert!(service.events().await.is_empty());
}

#[tokio::test]
async fn test_view_conversion_report() {
    let service = service_for("user-42", vec![checkout()]).await;
    assert_eq!(service.get_variant("checkout-cta").await.as_deref(), Some("A"));
    let before = service.events().await;
    assert_eq!(before.len(), 1);
    assert_eq!(before[0].kind(), EventKind::Assignment);

    let view = service.record_view("checkout-cta").await.unwrap();
    let conversion = service
        .record_conversion("checkout-cta", Some(serde_json::json!({"value": 49.99})))
        .await
        .unwrap();
    assert_eq!(view.variant_id(), "A");
    assert_eq!(conversion.metadata().unwrap()["value"], 49.99);

    // Exactly two events appended, both tagged with the assigned variant.
    let events = service.events().await;
    assert_eq!(events.len(), before.len() + 2);
    let appended = &events[before.len()..];
    assert_eq!(appended[0].kind(), EventKind::View);
    assert_eq!(appended[1].kind(), EventKind::Conversion);
    assert!(appended.iter().all(|e| e.variant_id() == "A"));

    let reports = service.report().await;
    assert_eq!(reports.len(), 1);
    let a = reports[0].variant("A").unwrap();
    assert_eq!((a.views, a.conversions), (1, 1));
    assert!((a.conversion_rate - 1.0).abs() < f64::EPSILON);
    let b = reports[0].variant("B").unwrap();
    assert_eq!((b.views, b.conversions), (0, 0));
    assert_eq!(b.conversion_rate, 0.0);
}

#[tokio::test]
async fn test_repeated_views_are_counted() {
    let service = service_for("user-42", vec![checkout()]).await;
    service.get_variant("checkout-cta").await;
    for _ in 0..3 {
        service.record_view("checkout-cta").await;
    }
    let report = &service.report().await[0];
    assert_eq!(report.total_views(), 3);
}

#[tokio::test]
async fn test_unknown_or_inactive_test_is_noop() {
    let paused = Experiment::builder("paused", "Paused")
        .enabled(false)
        .variant(Variant::new("A", "A", 1.0))
        .build()
        .unwrap();
    let service = service_for("user-42", vec![checkout(), paused]).await;

    assert!(service.get_variant("paused").await.is_none());
    assert!(service.get_variant("ghost").await.is_none());
    assert!(service.record_conversion("ghost", None).await.is_none());
    assert!(service.record_view("paused").await.is_none());

    assert!(service
        .events()
        .await
        .iter()
        .all(|e| e.kind() == EventKind::Assignment));
}

#[tokio::test]
async fn test_assignments_cover_exactly_active_experiments() {
    let expired = Experiment::builder("old", "Old")
        .variant(Variant::new("A", "A", 1.0))
        .starts_at(chrono::Utc::now() - chrono::Duration::days(30))
        .ends_at(chrono::Utc::now() - chrono::Duration::days(1))
        .build()
        .unwrap();
    let service = service_for("user-42", vec![checkout(), expired]).await;

    let assignments = service.assignments().await;
    assert_eq!(assignments.keys().collect::<Vec<_>>(), vec!["checkout-cta"]);
}

#[tokio::test]
async fn test_reset_all_is_idempotent() {
    let service = service_for("user-42", vec![checkout()]).await;
    let before = service.assignments().await;

    let first = service.reset_all().await.unwrap();
    let second = service.reset_all().await.unwrap();

    assert_eq!(first, before, "same identity, same buckets");
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_clear_events_empties_report() {
    let service = service_for("user-42", vec![checkout()]).await;
    service.get_variant("checkout-cta").await;
    service.record_view("checkout-cta").await;
    service.clear_events().await.unwrap();

    assert!(service.events().await.is_empty());
    assert_eq!(service.report().await[0].total_views(), 0);
}

#[tokio::test]
async fn test_event_log_capacity_drops_oldest() {
    let store = Arc::new(MemoryKvStore::new());
    store.set("ab.identity", b"user-42".to_vec()).await.unwrap();
    let service = ExperimentService::builder()
        .config(ServiceConfig::default().with_event_log_capacity(3))
        .baseline(vec![checkout()])
        .shared_store(store)
        .build()
        .unwrap();
    service.init().await;
    service.get_variant("checkout-cta").await;

    for _ in 0..5 {
        service.record_view("checkout-cta").await;
    }
    let events = service.events().await;
    assert_eq!(events.len(), 3);
    assert!(events.iter().all(|e| e.kind() == EventKind::View));
}

#[tokio::test]
async fn test_corrupt_local_state_is_recovered() {
    let store = Arc::new(MemoryKvStore::new());
    store.set("ab.identity", b"user-42".to_vec()).await.unwrap();
    store.set("ab.assignments", b"{{{".to_vec()).await.unwrap();
    store.set("ab.events", b"[oops".to_vec()).await.unwrap();
    let service = ExperimentService::builder()
        .baseline(vec![checkout()])
        .shared_store(store)
        .build()
        .unwrap();
    service.init().await;

    assert_eq!(service.get_variant("checkout-cta").await.as_deref(), Some("A"));
    assert_eq!(service.events().await.len(), 1, "fresh log with the assignment");
}

#[tokio::test]
async fn test_custom_key_prefix() {
    let store = Arc::new(MemoryKvStore::new());
    let service = ExperimentService::builder()
        .config(ServiceConfig::default().with_key_prefix("shop"))
        .baseline(vec![checkout()])
        .shared_store(Arc::clone(&store))
        .build()
        .unwrap();
    service.init().await;
    service.get_variant("checkout-cta").await;

    assert!(store.exists("shop.identity").await.unwrap());
    assert!(store.exists("shop.assignments").await.unwrap());
    assert!(!store.exists("ab.identity").await.unwrap());
}
