//! Request/response round trips over a loopback pair.

mod common;

use std::sync::{Arc, Mutex};

use blipwire::{BlipError, MessageBuilder, ProgressState, ReplyFailure};
use common::{Behavior, PeerEvent, echo_harness, harness};
use tokio::{
    sync::mpsc,
    time::{Duration, timeout},
};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn small_request_gets_its_echo() {
    let mut fixture = echo_harness();
    let reply = timeout(
        WAIT,
        fixture
            .client
            .send_request(MessageBuilder::new().profile("echo").body(b"hi"))
            .expect("connection open"),
    )
    .await
    .expect("reply in time")
    .expect("reply delivered");

    assert!(!reply.is_error());
    assert!(reply.is_complete());
    assert_eq!(&reply.body()[..], b"hi");
    assert_eq!(reply.profile().as_deref(), Some("echo"));

    let event = timeout(WAIT, fixture.server_events.recv())
        .await
        .expect("request observed")
        .expect("server alive");
    match event {
        PeerEvent::Request(request) => {
            assert_eq!(request.profile().as_deref(), Some("echo"));
            assert_eq!(&request.body()[..], b"hi");
        }
        PeerEvent::Close(status) => panic!("unexpected close: {status}"),
    }
}

#[tokio::test]
async fn properties_and_body_round_trip_byte_identical() {
    let fixture = echo_harness();
    let reply = timeout(
        WAIT,
        fixture
            .client
            .send_request(
                MessageBuilder::new()
                    .profile("lookup")
                    .property("Content-Type", "application/json")
                    .property("x-custom", "value with spaces")
                    .body(br#"{"key": [1, 2, 3]}"#),
            )
            .expect("connection open"),
    )
    .await
    .expect("reply in time")
    .expect("reply delivered");

    assert_eq!(reply.property("Profile").as_deref(), Some("lookup"));
    assert_eq!(
        reply.property("Content-Type").as_deref(),
        Some("application/json")
    );
    assert_eq!(
        reply.property("x-custom").as_deref(),
        Some("value with spaces")
    );
    assert_eq!(&reply.body()[..], br#"{"key": [1, 2, 3]}"#);
}

#[tokio::test]
async fn rejected_request_resolves_with_error_reply() {
    let fixture = harness(
        Behavior::Reject,
        Default::default(),
        Default::default(),
    );
    let reply = timeout(
        WAIT,
        fixture
            .client
            .send_request(MessageBuilder::new().profile("unknown"))
            .expect("connection open"),
    )
    .await
    .expect("reply in time")
    .expect("error reply still resolves Ok");

    assert!(reply.is_error());
    let error = reply.get_error().expect("structured error");
    assert_eq!(error.domain, "BLIP");
    assert_eq!(error.code, 404);
    assert_eq!(error.message, "Not Handled");
}

#[tokio::test]
async fn noreply_request_completes_without_response() {
    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
    let mut fixture = harness(Behavior::Silent, Default::default(), Default::default());

    let pending = fixture
        .client
        .send_request(
            MessageBuilder::new()
                .profile("log")
                .body(b"fire and forget")
                .no_reply(true)
                .on_progress(move |progress| {
                    let _ = progress_tx.send(progress.state);
                }),
        )
        .expect("connection open");

    let resolution = timeout(WAIT, pending).await.expect("resolves");
    assert!(matches!(resolution, Err(ReplyFailure::NoReply)));

    let mut states = Vec::new();
    while let Ok(Some(state)) = timeout(Duration::from_millis(200), progress_rx.recv()).await {
        states.push(state);
        if state == ProgressState::Complete {
            break;
        }
    }
    assert_eq!(states.first(), Some(&ProgressState::Queued));
    assert_eq!(states.last(), Some(&ProgressState::Complete));
    assert!(!states.contains(&ProgressState::AwaitingReply));

    // The server still receives the message; its respond() is a no-op.
    let event = timeout(WAIT, fixture.server_events.recv())
        .await
        .expect("request observed")
        .expect("server alive");
    if let PeerEvent::Request(request) = event {
        assert!(request.no_reply());
        assert!(request.respond_default().is_ok());
    }
}

#[tokio::test]
async fn progress_reaches_awaiting_then_complete_for_replied_requests() {
    let states = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&states);
    let fixture = echo_harness();

    let reply = timeout(
        WAIT,
        fixture
            .client
            .send_request(
                MessageBuilder::new()
                    .profile("echo")
                    .body(b"with progress")
                    .on_progress(move |progress| {
                        recorded.lock().unwrap().push(progress.state);
                    }),
            )
            .expect("connection open"),
    )
    .await
    .expect("reply in time")
    .expect("reply delivered");
    assert_eq!(&reply.body()[..], b"with progress");

    let states = states.lock().unwrap();
    assert_eq!(states.first(), Some(&ProgressState::Queued));
    assert!(states.contains(&ProgressState::AwaitingReply));
    assert_eq!(states.last(), Some(&ProgressState::Complete));
}

#[tokio::test]
async fn double_response_is_rejected() {
    let mut fixture = harness(Behavior::Silent, Default::default(), Default::default());
    let pending = fixture
        .client
        .send_request(MessageBuilder::new().profile("once"))
        .expect("connection open");

    let event = timeout(WAIT, fixture.server_events.recv())
        .await
        .expect("request observed")
        .expect("server alive");
    let PeerEvent::Request(request) = event else {
        panic!("expected a request");
    };
    request.respond_default().expect("first response accepted");
    assert!(matches!(
        request.respond_default(),
        Err(BlipError::AlreadyResponded)
    ));

    let reply = timeout(WAIT, pending)
        .await
        .expect("resolves")
        .expect("single response delivered");
    assert!(!reply.is_error());
    assert!(reply.body().is_empty());
}
