//! Mutation scenarios: donate, update and delete against the scripted chain.

use chrono::Utc;
use ethers::types::H256;
use serde_json::Value;

use crate::aggregator::ListingState;

use crate::campaigns::CampaignView;
use crate::errors::CampaignError;
use crate::orchestrator::{ActionKind, ActionOutcome, ActionState, Feedback, ImageUpload, UpdateForm};
use crate::test_support::{campaign, days_from_now, ether, harness, Harness};

const OLD_IMAGE: &str = "https://gateway.pinata.cloud/ipfs/QmOldImage";

async fn listed(h: &Harness, id: u64) -> CampaignView {
    h.feed
        .refresh()
        .await
        .unwrap()
        .into_iter()
        .find(|v| v.id == id)
        .expect("campaign listed")
}

fn future_date(days: i64) -> String {
    (Utc::now() + chrono::Duration::days(days))
        .date_naive()
        .format("%Y-%m-%d")
        .to_string()
}

fn uploaded_json(h: &Harness, index: usize) -> Value {
    serde_json::from_slice(&h.store.blobs()[index].bytes).unwrap()
}

#[tokio::test]
async fn donation_updates_chain_and_listing() {
    let h = harness(vec![campaign(0, ether(10), ether(2), days_from_now(10))]);
    h.feed.refresh().await.unwrap();

    let outcome = h.orchestrator.donate(0, "3").await.unwrap();
    assert!(matches!(outcome, ActionOutcome::Confirmed { .. }));

    assert_eq!(h.chain.campaign(0).amount_collected, ether(5));
    let view = h.feed.find(0).unwrap();
    assert_eq!(view.amount_collected, "5.0");
    assert_eq!(view.progress_percent(), 50.0);

    let sent = h.chain.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].value, Some(ether(3)));

    let slot = h.orchestrator.slot(0, ActionKind::Donate);
    assert_eq!(slot.state, ActionState::Idle);
    assert!(matches!(slot.feedback, Some(Feedback::Succeeded { .. })));
}

#[tokio::test]
async fn non_positive_donations_never_reach_the_chain() {
    let h = harness(vec![campaign(0, ether(10), ether(2), days_from_now(10))]);
    h.feed.refresh().await.unwrap();

    for amount in ["0", "-1", "", "abc", "0.0"] {
        let err = h.orchestrator.donate(0, amount).await.unwrap_err();
        assert!(matches!(err, CampaignError::Validation(_)), "{amount}: {err}");
    }

    assert!(h.chain.sent().is_empty());
    let slot = h.orchestrator.slot(0, ActionKind::Donate);
    assert_eq!(slot.state, ActionState::Idle);
    assert!(matches!(
        slot.feedback,
        Some(Feedback::Failed {
            retryable: false,
            ..
        })
    ));
}

#[tokio::test]
async fn donation_past_deadline_is_refused_locally() {
    let h = harness(vec![campaign(0, ether(10), ether(2), days_from_now(-2))]);
    h.feed.refresh().await.unwrap();

    let err = h.orchestrator.donate(0, "1").await.unwrap_err();
    assert!(err.to_string().contains("deadline passed"), "{err}");
    assert!(h.chain.sent().is_empty());
}

#[tokio::test]
async fn replayed_transaction_is_counted_once() {
    let h = harness(vec![campaign(0, ether(10), ether(2), days_from_now(10))]);
    h.feed.refresh().await.unwrap();
    h.chain.always_return_hash(H256::from_low_u64_be(0xabc));

    h.orchestrator.donate(0, "1").await.unwrap();
    let err = h.orchestrator.donate(0, "1").await.unwrap_err();
    assert!(matches!(err, CampaignError::ChainWrite(_)), "{err}");

    assert_eq!(h.chain.campaign(0).amount_collected, ether(3));
    assert_eq!(h.feed.find(0).unwrap().amount_collected, "3.0");
}

#[tokio::test]
async fn receipt_lookup_failures_do_not_double_count() {
    let h = harness(vec![campaign(0, ether(10), ether(2), days_from_now(10))]);
    h.feed.refresh().await.unwrap();
    h.chain.fail_receipt_lookups(2);

    let outcome = h.orchestrator.donate(0, "3").await.unwrap();
    assert!(matches!(outcome, ActionOutcome::Confirmed { .. }));

    assert_eq!(h.chain.sent().len(), 1);
    assert_eq!(h.chain.campaign(0).amount_collected, ether(5));
    assert_eq!(h.feed.find(0).unwrap().amount_collected, "5.0");
    assert!(matches!(
        h.orchestrator.slot(0, ActionKind::Donate).feedback,
        Some(Feedback::Succeeded { .. })
    ));
}

#[tokio::test]
async fn dropped_transaction_is_unconfirmed_and_refreshes() {
    let h = harness(vec![campaign(0, ether(10), ether(2), days_from_now(10))]);
    h.feed.refresh().await.unwrap();
    h.chain.drop_next();

    let err = h.orchestrator.donate(0, "1").await.unwrap_err();
    assert!(matches!(err, CampaignError::Unconfirmed(_)), "{err}");
    assert!(!err.is_retryable());

    let slot = h.orchestrator.slot(0, ActionKind::Donate);
    assert_eq!(slot.state, ActionState::Idle);
    assert!(matches!(
        slot.feedback,
        Some(Feedback::Failed {
            retryable: false,
            ..
        })
    ));
    assert_eq!(h.chain.sent().len(), 1);
    assert_eq!(h.chain.campaign(0).amount_collected, ether(2));

    // The listing was re-read after the lost submission.
    match h.feed.current() {
        ListingState::Ready { generation, .. } => assert_eq!(generation, 2),
        other => panic!("expected ready listing, got {other:?}"),
    }
}

#[tokio::test]
async fn invalid_trigger_on_busy_slot_keeps_its_feedback() {
    let h = harness(vec![campaign(0, ether(10), ether(2), days_from_now(10))]);
    h.feed.refresh().await.unwrap();
    h.chain.hold();

    let first = tokio::spawn({
        let orchestrator = h.orchestrator.clone();
        async move { orchestrator.donate(0, "1").await }
    });
    h.chain.wait_for_sent(1).await;

    let err = h.orchestrator.donate(0, "0").await.unwrap_err();
    assert!(matches!(err, CampaignError::Validation(_)));
    let slot = h.orchestrator.slot(0, ActionKind::Donate);
    assert_eq!(slot.state, ActionState::InFlight);
    assert_eq!(slot.feedback, None);

    h.chain.release();
    assert!(matches!(first.await.unwrap(), Ok(ActionOutcome::Confirmed { .. })));
    assert!(matches!(
        h.orchestrator.slot(0, ActionKind::Donate).feedback,
        Some(Feedback::Succeeded { .. })
    ));
}

#[tokio::test]
async fn second_delete_while_pending_is_a_no_op() {
    let h = harness(vec![
        campaign(0, ether(10), ether(2), days_from_now(10)),
        campaign(1, ether(10), ether(2), days_from_now(10)),
    ]);
    h.feed.refresh().await.unwrap();
    h.chain.hold();

    let first = tokio::spawn({
        let orchestrator = h.orchestrator.clone();
        async move { orchestrator.delete(0).await }
    });
    h.chain.wait_for_sent(1).await;

    assert_eq!(h.orchestrator.slot(0, ActionKind::Delete).state, ActionState::InFlight);
    let second = h.orchestrator.delete(0).await.unwrap();
    assert_eq!(second, ActionOutcome::AlreadyInFlight);

    h.chain.release();
    let outcome = first.await.unwrap().unwrap();
    assert!(matches!(outcome, ActionOutcome::Confirmed { .. }));

    assert_eq!(h.chain.sent().len(), 1);
    assert_eq!(h.orchestrator.slot(0, ActionKind::Delete).state, ActionState::Idle);
    assert!(h.feed.find(0).is_none());
    assert!(h.feed.find(1).is_some());
}

#[tokio::test]
async fn actions_on_different_campaigns_run_side_by_side() {
    let h = harness(vec![
        campaign(0, ether(10), ether(2), days_from_now(10)),
        campaign(1, ether(10), ether(2), days_from_now(10)),
    ]);
    h.feed.refresh().await.unwrap();
    h.chain.hold();

    let delete = tokio::spawn({
        let orchestrator = h.orchestrator.clone();
        async move { orchestrator.delete(0).await }
    });
    let donate = tokio::spawn({
        let orchestrator = h.orchestrator.clone();
        async move { orchestrator.donate(1, "0.5").await }
    });
    h.chain.wait_for_sent(2).await;
    h.chain.release();

    assert!(matches!(delete.await.unwrap(), Ok(ActionOutcome::Confirmed { .. })));
    assert!(matches!(donate.await.unwrap(), Ok(ActionOutcome::Confirmed { .. })));
    assert_eq!(h.feed.find(1).unwrap().amount_collected, "2.5");
}

#[tokio::test]
async fn rejected_signature_leaves_state_untouched() {
    let h = harness(vec![campaign(0, ether(10), ether(2), days_from_now(10))]);
    h.feed.refresh().await.unwrap();
    h.chain.reject_next();

    let err = h.orchestrator.delete(0).await.unwrap_err();
    assert!(matches!(err, CampaignError::TransactionRejected(_)));
    assert!(h.chain.campaign(0).is_active);

    let slot = h.orchestrator.slot(0, ActionKind::Delete);
    assert_eq!(slot.state, ActionState::Idle);
    assert!(matches!(
        slot.feedback,
        Some(Feedback::Failed {
            retryable: false,
            ..
        })
    ));

    // The slot accepts the retry.
    h.orchestrator.delete(0).await.unwrap();
    assert!(!h.chain.campaign(0).is_active);
}

#[tokio::test]
async fn reverted_transaction_is_a_write_failure() {
    let h = harness(vec![campaign(0, ether(10), ether(2), days_from_now(10))]);
    h.feed.refresh().await.unwrap();
    h.chain.revert_next();

    let err = h.orchestrator.donate(0, "1").await.unwrap_err();
    assert!(matches!(err, CampaignError::ChainWrite(_)), "{err}");
    assert_eq!(h.chain.campaign(0).amount_collected, ether(2));
    assert_eq!(h.orchestrator.slot(0, ActionKind::Donate).state, ActionState::Idle);
}

#[tokio::test]
async fn missing_signer_is_a_connection_error() {
    let h = harness(vec![campaign(0, ether(10), ether(2), days_from_now(10))]);
    h.chain.set_accounts(Vec::new());

    let err = h.orchestrator.delete(0).await.unwrap_err();
    assert!(matches!(err, CampaignError::Connection(_)));
    assert!(h.chain.sent().is_empty());
}

#[tokio::test]
async fn update_without_upload_keeps_current_image() {
    let h = harness(vec![campaign(0, ether(10), ether(2), days_from_now(10))]);
    h.resolver.insert("ipfs://meta-0", "Clean water", OLD_IMAGE);
    let view = listed(&h, 0).await;

    let mut form = UpdateForm::from_view(&view);
    assert_eq!(form.image, OLD_IMAGE);
    form.title = "Clean water for Kisumu".to_string();
    form.target = "20".to_string();
    form.deadline = future_date(30);

    let outcome = h.orchestrator.update(0, form).await.unwrap();
    assert!(matches!(outcome, ActionOutcome::Confirmed { .. }));

    let blobs = h.store.blobs();
    assert_eq!(blobs.len(), 1);
    assert_eq!(blobs[0].content_type, "application/json");
    let json = uploaded_json(&h, 0);
    assert_eq!(json["title"], "Clean water for Kisumu");
    assert_eq!(json["description"], "About Clean water");
    assert_eq!(json["image"], OLD_IMAGE);

    let record = h.chain.campaign(0);
    assert_eq!(record.metadata_uri, "ipfs://blob-1");
    assert_eq!(record.target, ether(20));
    assert_eq!(record.deadline % 86_400, 0);
}

#[tokio::test]
async fn update_with_upload_points_metadata_at_new_image() {
    let h = harness(vec![campaign(0, ether(10), ether(2), days_from_now(10))]);
    h.resolver.insert("ipfs://meta-0", "Clean water", OLD_IMAGE);
    let view = listed(&h, 0).await;

    let mut form = UpdateForm::from_view(&view);
    form.image_upload = Some(ImageUpload {
        file_name: "well.png".to_string(),
        content_type: "image/png".to_string(),
        bytes: vec![0x89, b'P', b'N', b'G'],
    });

    h.orchestrator.update(0, form).await.unwrap();

    let blobs = h.store.blobs();
    assert_eq!(blobs.len(), 2);
    assert_eq!(blobs[0].content_type, "image/png");
    assert_eq!(blobs[0].file_name.as_deref(), Some("well.png"));
    assert_eq!(uploaded_json(&h, 1)["image"], "ipfs://blob-1");
    assert_eq!(h.chain.campaign(0).metadata_uri, "ipfs://blob-2");
}

#[tokio::test]
async fn upload_failure_aborts_before_the_contract_call() {
    let h = harness(vec![campaign(0, ether(10), ether(2), days_from_now(10))]);
    h.resolver.insert("ipfs://meta-0", "Clean water", OLD_IMAGE);
    let view = listed(&h, 0).await;
    h.store.fail_next();

    let err = h.orchestrator.update(0, UpdateForm::from_view(&view)).await.unwrap_err();
    assert!(matches!(err, CampaignError::Upload(_)));
    assert!(h.chain.sent().is_empty());
    assert_eq!(h.chain.campaign(0).metadata_uri, "ipfs://meta-0");

    let slot = h.orchestrator.slot(0, ActionKind::Update);
    assert_eq!(slot.state, ActionState::Idle);
    assert!(matches!(
        slot.feedback,
        Some(Feedback::Failed { retryable: true, .. })
    ));
}

#[tokio::test]
async fn invalid_update_never_uploads() {
    let h = harness(vec![campaign(0, ether(10), ether(2), days_from_now(10))]);
    let form = UpdateForm {
        title: "Wells".to_string(),
        description: "Boreholes".to_string(),
        target: "0".to_string(),
        deadline: future_date(5),
        image: OLD_IMAGE.to_string(),
        image_upload: None,
    };

    let err = h.orchestrator.update(0, form).await.unwrap_err();
    assert!(matches!(err, CampaignError::Validation(_)));
    assert!(h.store.blobs().is_empty());
    assert!(h.chain.sent().is_empty());
    assert_eq!(h.chain.campaign(0).target, ether(10));
}
