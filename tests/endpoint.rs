mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{grant_for, granted, link, open_pool, test_config, write_file};
use common::{RecordingDeliverer, RecordingNotifier};
use wings::db::{self, ShareCounts};
use wings::model::{
    Destination, FailureKind, LinkEvent, LinkGrant, LinkState, ShareState, SOCIAL_PAGE,
    SOCIAL_PROFILE,
};
use wings::{
    DeliveryOutcome, EndpointKind, LinkError, LinkProgress, LinkStep, StepResult, Wings,
    WingsError,
};

async fn build(
    dir: &std::path::Path,
    kind: EndpointKind,
    deliverer: &RecordingDeliverer,
    notifier: &RecordingNotifier,
) -> Wings {
    Wings::builder(test_config(dir))
        .endpoint(kind, Arc::new(deliverer.clone()))
        .notifier(Arc::new(notifier.clone()))
        .build()
        .await
        .unwrap()
}

/// Queue through the link guard without waking the background worker, so
/// `flush` sees every row.
async fn enqueue(pool: &db::Pool, file: &str, destination: Destination) -> i64 {
    db::create_linked_share_request(pool, file, destination)
        .await
        .unwrap()
        .expect("endpoint should be linked")
}

fn event(endpoint_id: i32, is_linked: bool) -> LinkEvent {
    LinkEvent {
        endpoint_id,
        is_linked,
    }
}

#[tokio::test]
async fn two_deliveries_and_one_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let deliverer = RecordingDeliverer::default();
    let notifier = RecordingNotifier::default();
    let wings = build(dir.path(), EndpointKind::CloudFolder, &deliverer, &notifier).await;
    link(&wings, EndpointKind::CloudFolder).await;

    let a = write_file(dir.path(), "a.jpg");
    let missing = dir.path().join("gone.jpg").to_string_lossy().to_string();
    let b = write_file(dir.path(), "b.jpg");
    let pool = open_pool(dir.path()).await;
    let dest = Destination::new(1, 0);
    for file in [&a, &missing, &b] {
        enqueue(&pool, file, dest).await;
    }

    let notifications = wings.flush().await;
    wings.shutdown().await;

    let calls = deliverer.calls();
    assert_eq!(calls.len(), 2, "missing file must not reach the deliverer");
    assert_eq!(calls[0].file.to_string_lossy(), a);
    assert_eq!(calls[1].file.to_string_lossy(), b);
    assert!(calls.iter().all(|c| c.token == "token-1"));

    assert_eq!(notifications.len(), 1);
    let n = &notifications[0];
    assert_eq!(n.id, dest.hash());
    assert_eq!(n.success_count, 2);
    assert_eq!(n.message, "2 files shared to Apps/wings");
    assert_eq!(n.launch_target.as_deref(), Some("https://cloud.example.com/s/abc"));
    assert_eq!(notifier.shares(), notifications);

    let rows = db::list_share_requests(&pool, dest).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].file_path, missing);
    assert_eq!(rows[0].state, ShareState::Failed(FailureKind::Permanent));
}

#[tokio::test]
async fn denied_first_step_unlinks() {
    let dir = tempfile::tempdir().unwrap();
    let deliverer = RecordingDeliverer::default();
    let notifier = RecordingNotifier::default();
    let wings = build(dir.path(), EndpointKind::SocialAlbum, &deliverer, &notifier).await;
    let endpoint = wings.endpoint(EndpointKind::SocialAlbum).unwrap();
    let mut sub = wings.subscribe().await;

    assert_eq!(endpoint.start_link_request().await.unwrap(), LinkStep::Login);
    assert_eq!(endpoint.link_state().await.unwrap(), LinkState::LinkInProgress(0));

    let progress = endpoint
        .complete_link_request(LinkStep::Login, StepResult::Denied("user cancelled".into()))
        .await
        .unwrap();
    assert_eq!(
        progress,
        LinkProgress::Failed(LinkError::Denied("user cancelled".into()))
    );
    assert_eq!(endpoint.link_state().await.unwrap(), LinkState::Unlinked);
    assert_eq!(
        sub.drain(),
        vec![event(0, false), event(0, false), event(0, false)]
    );

    let failures = notifier.link_failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, EndpointKind::SocialAlbum);
    wings.shutdown().await;
}

#[tokio::test]
async fn denial_after_a_completed_step_discards_the_draft() {
    let dir = tempfile::tempdir().unwrap();
    let deliverer = RecordingDeliverer::default();
    let notifier = RecordingNotifier::default();
    let wings = build(dir.path(), EndpointKind::SocialAlbum, &deliverer, &notifier).await;
    let endpoint = wings.endpoint(EndpointKind::SocialAlbum).unwrap();
    let pool = open_pool(dir.path()).await;

    endpoint.start_link_request().await.unwrap();
    let progress = endpoint
        .complete_link_request(LinkStep::Login, granted(grant_for(LinkStep::Login)))
        .await
        .unwrap();
    assert_eq!(progress, LinkProgress::Next(LinkStep::OpenSession));
    let record = db::load_link_record(&pool, 0).await.unwrap();
    assert_eq!(record.link_state().unwrap(), LinkState::LinkInProgress(1));
    assert_eq!(record.draft().unwrap().credential.as_deref(), Some("token-1"));

    let mut sub = wings.subscribe().await;
    let progress = endpoint
        .complete_link_request(
            LinkStep::OpenSession,
            StepResult::Denied("session refused".into()),
        )
        .await
        .unwrap();
    assert_eq!(
        progress,
        LinkProgress::Failed(LinkError::Denied("session refused".into()))
    );

    assert!(!endpoint.is_linked().await.unwrap());
    let record = db::load_link_record(&pool, 0).await.unwrap();
    assert_eq!(record.link_state().unwrap(), LinkState::Unlinked);
    assert!(record.link_draft.is_none());
    assert!(record.link_step.is_none());

    let failures = notifier.link_failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(
        failures[0],
        (
            EndpointKind::SocialAlbum,
            LinkError::Denied("session refused".into())
        )
    );
    let events = sub.drain();
    assert_eq!(events, vec![event(0, false), event(0, false)]);
    assert!(events.iter().all(|e| !e.is_linked));
    wings.shutdown().await;
}

#[tokio::test]
async fn mismatched_or_unexpected_steps_fail_the_flow() {
    let dir = tempfile::tempdir().unwrap();
    let deliverer = RecordingDeliverer::default();
    let notifier = RecordingNotifier::default();
    let wings = build(dir.path(), EndpointKind::SocialAlbum, &deliverer, &notifier).await;
    let endpoint = wings.endpoint(EndpointKind::SocialAlbum).unwrap();

    let progress = endpoint
        .complete_link_request(LinkStep::Login, granted(grant_for(LinkStep::Login)))
        .await
        .unwrap();
    assert_eq!(progress, LinkProgress::Failed(LinkError::NoLinkInProgress));

    endpoint.start_link_request().await.unwrap();
    let progress = endpoint
        .complete_link_request(LinkStep::SelectAlbum, granted(LinkGrant::default()))
        .await
        .unwrap();
    assert_eq!(
        progress,
        LinkProgress::Failed(LinkError::StepMismatch {
            expected: LinkStep::Login,
            got: LinkStep::SelectAlbum,
        })
    );
    assert!(!endpoint.is_linked().await.unwrap());
    assert_eq!(notifier.link_failures().len(), 2);
    wings.shutdown().await;
}

#[tokio::test]
async fn four_step_link_reaches_linked() {
    let dir = tempfile::tempdir().unwrap();
    let deliverer = RecordingDeliverer::default();
    let notifier = RecordingNotifier::default();
    let wings = build(dir.path(), EndpointKind::SocialAlbum, &deliverer, &notifier).await;
    let endpoint = wings.endpoint(EndpointKind::SocialAlbum).unwrap();
    let mut sub = wings.subscribe().await;

    let mut step = endpoint.start_link_request().await.unwrap();
    let mut visited = vec![step];
    let info = loop {
        let grant = match step {
            LinkStep::SelectAlbum => LinkGrant {
                destination_id: Some(SOCIAL_PAGE),
                destination_description: Some("Band page".into()),
                ..Default::default()
            },
            other => grant_for(other),
        };
        match endpoint.complete_link_request(step, granted(grant)).await.unwrap() {
            LinkProgress::Next(next) => {
                visited.push(next);
                step = next;
            }
            LinkProgress::Linked(info) => break info,
            LinkProgress::Failed(err) => panic!("unexpected failure: {err}"),
        }
    };

    assert_eq!(visited, EndpointKind::SocialAlbum.link_steps());
    assert_eq!(info.account_name, "alice");
    assert_eq!(info.destination, Destination::new(0, SOCIAL_PAGE));
    assert_eq!(info.destination_description, "Band page");
    assert_eq!(
        sub.drain(),
        vec![event(0, false), event(0, false), event(0, true)]
    );

    match endpoint.link_state().await.unwrap() {
        LinkState::Linked(account) => {
            assert_eq!(account.credential.token, "token-1");
            assert_eq!(
                account.credential.settings.get("privacy").map(String::as_str),
                Some("friends")
            );
        }
        other => panic!("expected linked, got {other:?}"),
    }
    wings.shutdown().await;
}

#[tokio::test]
async fn link_flow_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let deliverer = RecordingDeliverer::default();
    let notifier = RecordingNotifier::default();

    let wings = build(dir.path(), EndpointKind::CloudFolder, &deliverer, &notifier).await;
    let endpoint = wings.endpoint(EndpointKind::CloudFolder).unwrap();
    assert_eq!(endpoint.start_link_request().await.unwrap(), LinkStep::Authorize);
    let progress = endpoint
        .complete_link_request(LinkStep::Authorize, granted(grant_for(LinkStep::Authorize)))
        .await
        .unwrap();
    assert_eq!(progress, LinkProgress::Next(LinkStep::FetchAccount));
    wings.shutdown().await;

    let wings = build(dir.path(), EndpointKind::CloudFolder, &deliverer, &notifier).await;
    let endpoint = wings.endpoint(EndpointKind::CloudFolder).unwrap();
    let progress = endpoint
        .complete_link_request(
            LinkStep::FetchAccount,
            granted(grant_for(LinkStep::FetchAccount)),
        )
        .await
        .unwrap();
    match progress {
        LinkProgress::Linked(info) => assert_eq!(info.destination, Destination::new(1, 0)),
        other => panic!("expected linked, got {other:?}"),
    }
    wings.shutdown().await;
}

#[tokio::test]
async fn incomplete_final_grant_is_a_link_error() {
    let dir = tempfile::tempdir().unwrap();
    let deliverer = RecordingDeliverer::default();
    let notifier = RecordingNotifier::default();
    let wings = build(dir.path(), EndpointKind::PrintQueue, &deliverer, &notifier).await;
    let endpoint = wings.endpoint(EndpointKind::PrintQueue).unwrap();

    endpoint.start_link_request().await.unwrap();
    let progress = endpoint
        .complete_link_request(
            LinkStep::SelectPrinter,
            granted(LinkGrant {
                credential: Some("printer-token".into()),
                ..Default::default()
            }),
        )
        .await
        .unwrap();
    assert_eq!(
        progress,
        LinkProgress::Failed(LinkError::Incomplete("an account name"))
    );

    endpoint.start_link_request().await.unwrap();
    let progress = endpoint
        .complete_link_request(
            LinkStep::SelectPrinter,
            granted(LinkGrant {
                destination_id: Some(7),
                ..grant_for(LinkStep::SelectPrinter)
            }),
        )
        .await
        .unwrap();
    assert_eq!(progress, LinkProgress::Failed(LinkError::UnknownDestination(7)));
    assert!(!endpoint.is_linked().await.unwrap());
    wings.shutdown().await;
}

#[tokio::test]
async fn starting_a_link_while_linked_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let deliverer = RecordingDeliverer::default();
    let notifier = RecordingNotifier::default();
    let wings = build(dir.path(), EndpointKind::PrintQueue, &deliverer, &notifier).await;
    link(&wings, EndpointKind::PrintQueue).await;

    let endpoint = wings.endpoint(EndpointKind::PrintQueue).unwrap();
    let err = endpoint.start_link_request().await.unwrap_err();
    assert!(matches!(err, WingsError::AlreadyLinked(_)));
    assert!(endpoint.is_linked().await.unwrap());
    wings.shutdown().await;
}

#[tokio::test]
async fn auth_failure_purges_every_destination_and_unlinks_once() {
    let dir = tempfile::tempdir().unwrap();
    let deliverer = RecordingDeliverer::with_outcomes(vec![DeliveryOutcome::AuthFailure(
        "token revoked".into(),
    )]);
    let notifier = RecordingNotifier::default();
    let wings = build(dir.path(), EndpointKind::SocialAlbum, &deliverer, &notifier).await;
    link(&wings, EndpointKind::SocialAlbum).await;
    let mut sub = wings.subscribe().await;

    let profile = Destination::new(0, SOCIAL_PROFILE);
    let page = Destination::new(0, SOCIAL_PAGE);
    let pool = open_pool(dir.path()).await;
    for name in ["1.jpg", "2.jpg", "3.jpg"] {
        let file = write_file(dir.path(), name);
        db::create_share_request(&pool, &file, profile).await.unwrap();
    }
    let file = write_file(dir.path(), "4.jpg");
    db::create_share_request(&pool, &file, page).await.unwrap();

    let notifications = wings.flush().await;
    assert!(notifications.is_empty());
    assert_eq!(deliverer.calls().len(), 1);

    let endpoint = wings.endpoint(EndpointKind::SocialAlbum).unwrap();
    assert!(!endpoint.is_linked().await.unwrap());
    for dest in [profile, page] {
        assert_eq!(
            db::count_share_requests(&pool, dest).await.unwrap(),
            ShareCounts::default()
        );
    }
    assert_eq!(sub.drain(), vec![event(0, true), event(0, false)]);
    wings.shutdown().await;
}

#[tokio::test]
async fn unlink_is_idempotent_and_always_emits() {
    let dir = tempfile::tempdir().unwrap();
    let deliverer = RecordingDeliverer::default();
    let notifier = RecordingNotifier::default();
    let wings = build(dir.path(), EndpointKind::CloudFolder, &deliverer, &notifier).await;
    link(&wings, EndpointKind::CloudFolder).await;
    let file = write_file(dir.path(), "a.jpg");
    assert!(wings.share(&file, EndpointKind::CloudFolder).await);
    let mut sub = wings.subscribe().await;

    let endpoint = wings.endpoint(EndpointKind::CloudFolder).unwrap();
    endpoint.unlink().await.unwrap();
    endpoint.unlink().await.unwrap();

    assert_eq!(endpoint.link_state().await.unwrap(), LinkState::Unlinked);
    assert_eq!(
        sub.drain(),
        vec![event(1, true), event(1, false), event(1, false)]
    );
    let counts = endpoint.share_counts().await.unwrap();
    assert!(counts.iter().all(|(_, c)| c.total() == 0));
    assert!(!wings.share(&file, EndpointKind::CloudFolder).await);
    wings.shutdown().await;
}

#[tokio::test]
async fn transient_failures_wait_for_an_explicit_retry() {
    let dir = tempfile::tempdir().unwrap();
    let deliverer = RecordingDeliverer::with_outcomes(vec![DeliveryOutcome::TransientFailure(
        "503".into(),
    )]);
    let notifier = RecordingNotifier::default();
    let wings = build(dir.path(), EndpointKind::PrintQueue, &deliverer, &notifier).await;
    link(&wings, EndpointKind::PrintQueue).await;
    let file = write_file(dir.path(), "doc.pdf");
    let pool = open_pool(dir.path()).await;
    enqueue(&pool, &file, Destination::new(2, 0)).await;
    let endpoint = wings.endpoint(EndpointKind::PrintQueue).unwrap();

    assert!(wings.flush().await.is_empty());
    assert!(wings.flush().await.is_empty());
    assert_eq!(deliverer.calls().len(), 1, "failed rows are not reclaimed");

    assert_eq!(endpoint.retry_failed().await.unwrap(), 1);
    let notifications = wings.flush().await;
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].launch_target, None);
    assert_eq!(notifications[0].message, "1 file shared to Office printer");
    assert_eq!(deliverer.calls().len(), 2);
    wings.shutdown().await;
}

#[tokio::test]
async fn permanent_failures_are_not_retried() {
    let dir = tempfile::tempdir().unwrap();
    let deliverer = RecordingDeliverer::with_outcomes(vec![DeliveryOutcome::PermanentFailure(
        "unsupported format".into(),
    )]);
    let notifier = RecordingNotifier::default();
    let wings = build(dir.path(), EndpointKind::PrintQueue, &deliverer, &notifier).await;
    link(&wings, EndpointKind::PrintQueue).await;
    let file = write_file(dir.path(), "doc.xyz");
    let pool = open_pool(dir.path()).await;
    enqueue(&pool, &file, Destination::new(2, 0)).await;

    wings.flush().await;
    let endpoint = wings.endpoint(EndpointKind::PrintQueue).unwrap();
    assert_eq!(endpoint.retry_failed().await.unwrap(), 0);
    let counts = endpoint.share_counts().await.unwrap();
    assert_eq!(counts[0].1.failed, 1);
    wings.shutdown().await;
}

#[tokio::test]
async fn slow_delivery_times_out_as_transient() {
    let dir = tempfile::tempdir().unwrap();
    let deliverer = RecordingDeliverer::slow(Duration::from_secs(5));
    let notifier = RecordingNotifier::default();
    let mut config = test_config(dir.path());
    config.app.delivery_timeout_seconds = 1;
    let wings = Wings::builder(config)
        .endpoint(EndpointKind::CloudFolder, Arc::new(deliverer.clone()))
        .notifier(Arc::new(notifier.clone()))
        .build()
        .await
        .unwrap();
    link(&wings, EndpointKind::CloudFolder).await;
    let file = write_file(dir.path(), "big.mov");
    let pool = open_pool(dir.path()).await;
    enqueue(&pool, &file, Destination::new(1, 0)).await;

    assert!(wings.flush().await.is_empty());
    let rows = db::list_share_requests(&pool, Destination::new(1, 0)).await.unwrap();
    assert_eq!(rows[0].state, ShareState::Failed(FailureKind::Transient));
    wings.shutdown().await;
}
