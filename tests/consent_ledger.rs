mod common;

use std::sync::Arc;

use chrono::Duration;
use uuid::Uuid;

use trustgate::{
    AppError,
    clock::Clock,
    identity::StaticIdentityProvider,
    models::{
        consent::{ApplicationType, ConsentRequest, ConsentStatus, ConsentType},
        security_event::{MetadataKey, SecurityEventType},
    },
};

fn harness() -> common::Harness {
    common::harness(&[], Arc::new(StaticIdentityProvider::new()))
}

#[tokio::test]
async fn regranting_updates_the_live_row() {
    let h = harness();
    let subject = Uuid::new_v4();
    let ledger = &h.state.consents;

    let first = ledger
        .grant(subject, ConsentRequest::new(ConsentType::Analytics))
        .await
        .unwrap();
    h.clock.advance(Duration::minutes(5));
    let second = ledger
        .grant(
            subject,
            ConsentRequest::new(ConsentType::Analytics).with_purpose("Usage statistics", "Art. 6.1.a GDPR"),
        )
        .await
        .unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(second.purpose, "Usage statistics");
    assert!(second.granted_at > first.granted_at);

    let rows = ledger.user_consents(subject).await.unwrap();
    assert_eq!(rows.len(), 1);
}

#[tokio::test]
async fn grants_per_context_are_separate_rows() {
    let h = harness();
    let subject = Uuid::new_v4();
    let ledger = &h.state.consents;

    let kita = ledger
        .grant(
            subject,
            ConsentRequest::new(ConsentType::FinancialData).in_context(ApplicationType::Kita),
        )
        .await
        .unwrap();
    let elterngeld = ledger
        .grant(
            subject,
            ConsentRequest::new(ConsentType::FinancialData).in_context(ApplicationType::Elterngeld),
        )
        .await
        .unwrap();

    assert_ne!(kita.id, elterngeld.id);
    assert_eq!(kita.purpose, "Berechnung des Elternbeitrags");
    assert_eq!(elterngeld.purpose, "Berechnung der Elterngeld-Höhe");

    // A kita-scoped grant does not answer an elterngeld check on its own.
    let other = Uuid::new_v4();
    ledger
        .grant(
            other,
            ConsentRequest::new(ConsentType::FinancialData).in_context(ApplicationType::Kita),
        )
        .await
        .unwrap();
    assert!(
        !ledger
            .check(other, ConsentType::FinancialData, Some("elterngeld"))
            .await
            .unwrap()
            .has_consent
    );
    assert!(
        ledger
            .check(other, ConsentType::FinancialData, Some("kita"))
            .await
            .unwrap()
            .has_consent
    );
}

#[tokio::test]
async fn required_consents_gate_reports_missing_in_order() {
    let h = harness();
    let subject = Uuid::new_v4();
    let ledger = &h.state.consents;

    let gate = ledger
        .check_required_consents(subject, ApplicationType::Kita)
        .await
        .unwrap();
    assert!(!gate.has_all_required);
    assert_eq!(gate.missing, ConsentType::REQUIRED.to_vec());

    ledger
        .grant_many(
            subject,
            [
                ConsentRequest::new(ConsentType::DataProcessing),
                ConsentRequest::new(ConsentType::FinancialData).in_context(ApplicationType::Kita),
            ],
        )
        .await
        .unwrap();

    let gate = ledger
        .check_required_consents(subject, ApplicationType::Kita)
        .await
        .unwrap();
    assert_eq!(gate.missing, vec![ConsentType::ChildData]);

    ledger
        .grant(subject, ConsentRequest::new(ConsentType::ChildData))
        .await
        .unwrap();
    let gate = ledger
        .check_required_consents(subject, ApplicationType::Kita)
        .await
        .unwrap();
    assert!(gate.has_all_required);
    assert!(gate.missing.is_empty());

    // The kita-scoped financial consent does not carry over to elterngeld.
    let gate = ledger
        .check_required_consents(subject, ApplicationType::Elterngeld)
        .await
        .unwrap();
    assert_eq!(gate.missing, vec![ConsentType::FinancialData]);
}

#[tokio::test]
async fn withdrawal_is_idempotent_and_logged() {
    let h = harness();
    let subject = Uuid::new_v4();
    let ledger = &h.state.consents;

    ledger
        .grant(subject, ConsentRequest::new(ConsentType::EmailNotifications))
        .await
        .unwrap();

    assert!(
        ledger
            .withdraw(subject, ConsentType::EmailNotifications, Some("too many mails"))
            .await
            .unwrap()
    );
    assert!(
        !ledger
            .withdraw(subject, ConsentType::EmailNotifications, None)
            .await
            .unwrap()
    );

    let rows = ledger.user_consents(subject).await.unwrap();
    assert_eq!(rows[0].status, ConsentStatus::Withdrawn);
    assert_eq!(rows[0].withdrawal_reason.as_deref(), Some("too many mails"));
    assert!(rows[0].withdrawn_at.is_some());

    let withdrawals: Vec<_> = h
        .store
        .security_events()
        .await
        .into_iter()
        .filter(|e| e.event_type == SecurityEventType::ConsentWithdrawn)
        .collect();
    assert_eq!(withdrawals.len(), 1);
    assert_eq!(withdrawals[0].metadata.text(MetadataKey::Reason), Some("too many mails"));

    // A fresh grant after withdrawal is a new row; the withdrawn one stays.
    ledger
        .grant(subject, ConsentRequest::new(ConsentType::EmailNotifications))
        .await
        .unwrap();
    assert_eq!(ledger.user_consents(subject).await.unwrap().len(), 2);
}

#[tokio::test]
async fn expired_consent_no_longer_counts() {
    let h = harness();
    let subject = Uuid::new_v4();
    let ledger = &h.state.consents;
    let expires = h.clock.now() + Duration::days(30);

    ledger
        .grant(subject, ConsentRequest::new(ConsentType::DocumentVault).expiring_at(expires))
        .await
        .unwrap();
    assert!(
        ledger
            .check(subject, ConsentType::DocumentVault, None)
            .await
            .unwrap()
            .has_consent
    );

    h.clock.advance(Duration::days(31));

    let summary = ledger.consent_summary(subject).await.unwrap();
    assert_eq!(summary.active_consents, 0);
    assert_eq!(summary.expired_consents, 1);

    assert!(
        !ledger
            .check(subject, ConsentType::DocumentVault, None)
            .await
            .unwrap()
            .has_consent
    );
    let rows = h.store.consents().await;
    assert_eq!(rows[0].status, ConsentStatus::Expired);
}

#[tokio::test]
async fn overdue_consents_are_expired_in_bulk() {
    let h = harness();
    let ledger = &h.state.consents;
    let soon = h.clock.now() + Duration::hours(1);

    for _ in 0..3 {
        ledger
            .grant(Uuid::new_v4(), ConsentRequest::new(ConsentType::Analytics).expiring_at(soon))
            .await
            .unwrap();
    }
    ledger
        .grant(Uuid::new_v4(), ConsentRequest::new(ConsentType::Analytics))
        .await
        .unwrap();

    assert_eq!(ledger.expire_overdue().await.unwrap(), 0);
    h.clock.advance(Duration::hours(2));
    assert_eq!(ledger.expire_overdue().await.unwrap(), 3);
    assert_eq!(ledger.expire_overdue().await.unwrap(), 0);
}

#[tokio::test]
async fn invalid_request_is_rejected_before_the_store() {
    let h = harness();
    let mut request = ConsentRequest::new(ConsentType::Analytics);
    request.application_context = Some(String::new());

    let result = h.state.consents.grant(Uuid::new_v4(), request).await;
    assert!(matches!(result, Err(AppError::Validation(_))));
    assert!(h.store.consents().await.is_empty());
}

#[tokio::test]
async fn store_outage_surfaces_as_an_error() {
    let h = harness();
    h.store.set_offline(true);

    let result = h
        .state
        .consents
        .check(Uuid::new_v4(), ConsentType::DataProcessing, None)
        .await;
    assert!(matches!(result, Err(AppError::StoreUnavailable(_))));
}
