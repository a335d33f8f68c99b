//! Timeout, link-failure, and server-notice paths, driven with a paused
//! clock so timers fire deterministically.

mod common;

use common::{party, settle, Party, SignalRouter};
use peercall_core::{
    CallEvent, CallId, CallNotice, CallState, DisconnectStatus, EndReason, IceLinkState,
    PresenceStatus, SignalMessage, UserId,
};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::advance;

fn drain(rx: &mut broadcast::Receiver<CallEvent<UserId>>) -> Vec<CallEvent<UserId>> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

async fn connect(caller: &Party, callee: &Party, callee_name: &str) -> CallId {
    let call_id = caller
        .service
        .start_call(UserId::new(callee_name), false)
        .await
        .unwrap();
    settle().await;
    callee.service.accept_call().await.unwrap();
    settle().await;
    caller.transport().emit_ice(IceLinkState::Connected);
    callee.transport().emit_ice(IceLinkState::Connected);
    settle().await;
    call_id
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn unanswered_call_times_out_on_both_sides() {
    let router = SignalRouter::new();
    let alice = party(&router, "alice");
    let bob = party(&router, "bob");
    let mut bob_events = bob.service.subscribe_events();

    alice
        .service
        .start_call(UserId::new("bob"), false)
        .await
        .unwrap();
    settle().await;
    assert_eq!(bob.service.snapshot().state, CallState::Ringing);
    drain(&mut bob_events);

    advance(Duration::from_secs(45)).await;
    settle().await;

    // Each side's own timer fired: the caller reported the timeout once,
    // the callee turned the ring away and kept a missed-call record.
    assert_eq!(router.count_kind("call_timeout"), 1);
    assert_eq!(router.count_kind("call_decline"), 1);
    let alice_snapshot = alice.service.snapshot();
    assert_eq!(alice_snapshot.state, CallState::Idle);
    assert_eq!(alice_snapshot.error.as_deref(), Some("No answer"));
    assert_eq!(bob.service.snapshot().state, CallState::Idle);
    let events = drain(&mut bob_events);
    assert!(events.iter().any(|e| matches!(
        e,
        CallEvent::MissedCall { from, .. } if *from == UserId::new("alice")
    )));
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn answer_just_before_the_deadline_cancels_the_timers() {
    let router = SignalRouter::new();
    let alice = party(&router, "alice");
    let bob = party(&router, "bob");

    alice
        .service
        .start_call(UserId::new("bob"), false)
        .await
        .unwrap();
    settle().await;

    advance(Duration::from_secs(44)).await;
    settle().await;
    bob.service.accept_call().await.unwrap();
    settle().await;

    // Crossing the old deadline must not tear the session down.
    advance(Duration::from_secs(10)).await;
    settle().await;
    assert_eq!(router.count_kind("call_timeout"), 0);
    assert_eq!(alice.service.snapshot().state, CallState::Connecting);
    assert_eq!(bob.service.snapshot().state, CallState::Connecting);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn hard_link_failure_tears_down_both_sides() {
    let router = SignalRouter::new();
    let alice = party(&router, "alice");
    let bob = party(&router, "bob");
    let mut alice_events = alice.service.subscribe_events();
    let mut bob_events = bob.service.subscribe_events();
    connect(&alice, &bob, "bob").await;
    drain(&mut alice_events);
    drain(&mut bob_events);

    alice.transport().emit_ice(IceLinkState::Failed);
    settle().await;

    let alice_snapshot = alice.service.snapshot();
    assert_eq!(alice_snapshot.state, CallState::Idle);
    assert_eq!(alice_snapshot.error.as_deref(), Some("Connection lost"));
    let events = drain(&mut alice_events);
    assert!(events.iter().any(|e| matches!(
        e,
        CallEvent::Ended { reason: EndReason::Failed, .. }
    )));

    // The failure report reached bob and ended his side with the reason.
    assert_eq!(router.count_kind("call_disconnected"), 1);
    assert_eq!(router.count_kind("call_end"), 0);
    let bob_snapshot = bob.service.snapshot();
    assert_eq!(bob_snapshot.state, CallState::Idle);
    assert_eq!(bob_snapshot.error.as_deref(), Some("Connection lost"));
    let events = drain(&mut bob_events);
    assert!(events.iter().any(|e| matches!(
        e,
        CallEvent::Notice(CallNotice::PeerDisconnected { failed: true, .. })
    )));
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn degraded_link_restarts_ice_and_recovers() {
    let router = SignalRouter::new();
    let alice = party(&router, "alice");
    let bob = party(&router, "bob");
    connect(&alice, &bob, "bob").await;

    alice.transport().emit_ice(IceLinkState::Disconnected);
    settle().await;
    // A wobble is a transport concern; the session stays connected.
    assert_eq!(alice.service.snapshot().state, CallState::Connected);
    assert_eq!(alice.transport().restart_count(), 0);

    advance(Duration::from_secs(2)).await;
    settle().await;
    assert_eq!(alice.transport().restart_count(), 1);

    alice.transport().emit_ice(IceLinkState::Connected);
    settle().await;
    assert_eq!(alice.service.snapshot().state, CallState::Connected);

    // Recovery cleared the retry cycle.
    advance(Duration::from_secs(4)).await;
    settle().await;
    assert_eq!(alice.transport().restart_count(), 1);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn reconnect_attempts_are_bounded() {
    let router = SignalRouter::new();
    let alice = party(&router, "alice");
    let bob = party(&router, "bob");
    connect(&alice, &bob, "bob").await;

    alice.transport().emit_ice(IceLinkState::Disconnected);
    settle().await;
    for _ in 0..6 {
        advance(Duration::from_secs(2)).await;
        settle().await;
    }

    // Five restarts, then the transport gave up and the call failed over
    // the wire to the peer.
    assert_eq!(alice.transport().restart_count(), 5);
    assert_eq!(alice.service.snapshot().state, CallState::Idle);
    assert_eq!(
        alice.service.snapshot().error.as_deref(),
        Some("Connection lost")
    );
    assert_eq!(router.count_kind("call_disconnected"), 1);
    assert_eq!(bob.service.snapshot().state, CallState::Idle);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn callee_media_denial_fails_the_call_and_notifies_the_caller() {
    let router = SignalRouter::new();
    let alice = party(&router, "alice");
    let bob = party(&router, "bob");
    let mut alice_events = alice.service.subscribe_events();

    alice
        .service
        .start_call(UserId::new("bob"), true)
        .await
        .unwrap();
    settle().await;
    drain(&mut alice_events);

    bob.media.deny_access();
    bob.service.accept_call().await.unwrap();
    settle().await;

    let bob_snapshot = bob.service.snapshot();
    assert_eq!(bob_snapshot.state, CallState::Idle);
    assert_eq!(
        bob_snapshot.error.as_deref(),
        Some("Permission to access capture devices was denied")
    );

    // The caller learned of the failure and ended too.
    assert_eq!(router.count_kind("call_disconnected"), 1);
    let alice_snapshot = alice.service.snapshot();
    assert_eq!(alice_snapshot.state, CallState::Idle);
    assert!(alice_snapshot.error.is_some());
    let events = drain(&mut alice_events);
    assert!(events.iter().any(|e| matches!(
        e,
        CallEvent::Notice(CallNotice::PeerDisconnected { failed: true, .. })
    )));
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn presence_notice_surfaces_only_while_dialing() {
    let router = SignalRouter::new();
    let alice = party(&router, "alice");
    let _bob = party(&router, "bob");
    let mut alice_events = alice.service.subscribe_events();

    alice
        .service
        .start_call(UserId::new("bob"), false)
        .await
        .unwrap();
    settle().await;
    drain(&mut alice_events);

    router.push_to(
        "alice",
        "server",
        SignalMessage::CallWaiting {
            message: "bob is offline".into(),
            status: PresenceStatus::Offline,
        },
    );
    settle().await;

    let events = drain(&mut alice_events);
    assert!(events.iter().any(|e| matches!(
        e,
        CallEvent::Notice(CallNotice::PeerPresence { online: false, .. })
    )));
    assert_eq!(alice.service.snapshot().state, CallState::Calling);

    // The same notice after hanging up is stale noise.
    alice.service.end_call().await.unwrap();
    settle().await;
    drain(&mut alice_events);
    router.push_to(
        "alice",
        "server",
        SignalMessage::CallWaiting {
            message: "bob is offline".into(),
            status: PresenceStatus::Offline,
        },
    );
    settle().await;
    assert!(drain(&mut alice_events).is_empty());
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn server_disconnect_report_ends_the_session() {
    let router = SignalRouter::new();
    let alice = party(&router, "alice");
    let bob = party(&router, "bob");
    let call_id = connect(&alice, &bob, "bob").await;

    router.push_to(
        "bob",
        "server",
        SignalMessage::CallDisconnected {
            from: UserId::new("alice"),
            call_id,
            reason: "peer lost connection".into(),
            status: DisconnectStatus::Failed,
            duration: Some(0),
        },
    );
    settle().await;

    let bob_snapshot = bob.service.snapshot();
    assert_eq!(bob_snapshot.state, CallState::Idle);
    assert_eq!(bob_snapshot.error.as_deref(), Some("peer lost connection"));
    assert!(bob.transport().is_closed());
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn disconnect_report_with_normal_status_is_a_quiet_hangup() {
    let router = SignalRouter::new();
    let alice = party(&router, "alice");
    let bob = party(&router, "bob");
    let mut bob_events = bob.service.subscribe_events();
    let call_id = connect(&alice, &bob, "bob").await;
    drain(&mut bob_events);

    router.push_to(
        "bob",
        "server",
        SignalMessage::CallDisconnected {
            from: UserId::new("alice"),
            call_id,
            reason: "session closed".into(),
            status: DisconnectStatus::Ended,
            duration: Some(0),
        },
    );
    settle().await;

    let bob_snapshot = bob.service.snapshot();
    assert_eq!(bob_snapshot.state, CallState::Idle);
    assert_eq!(bob_snapshot.error, None);
    let events = drain(&mut bob_events);
    assert!(events.iter().any(|e| matches!(
        e,
        CallEvent::Ended { reason: EndReason::RemoteHangup, .. }
    )));
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn stale_session_messages_on_the_wire_are_ignored() {
    let router = SignalRouter::new();
    let alice = party(&router, "alice");
    let bob = party(&router, "bob");
    connect(&alice, &bob, "bob").await;

    router.push_to(
        "alice",
        "bob",
        SignalMessage::CallEnd {
            to: UserId::new("alice"),
            call_id: CallId::new(),
        },
    );
    settle().await;

    // A hangup for some other session does not touch the live call.
    assert_eq!(alice.service.snapshot().state, CallState::Connected);
}
