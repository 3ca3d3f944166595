//! End-to-end session tests over the in-process hub.
//!
//! Every test runs real sessions (apply loop, batching, resync, awareness)
//! against `MemoryHub`, using `LinkSwitch` to simulate network loss.

use std::time::Duration;

use tandem_collab::{
    open_session, AwarenessEvent, ChannelId, ControlFrame, CursorColor, EditEvent, Frame,
    FollowState, MemoryHub, MemorySurface, MemoryTransport, RemovalReason, Selection, Session,
    SessionConfig, SyncMessage, Transport, TransportEvent, TransportStatus,
};
use tandem_core::{Replica, SiteId, TextDocument, UpdateFrame};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(5);
const POLL: Duration = Duration::from_millis(10);

fn channel() -> ChannelId {
    ChannelId::new("project", "main.rs")
}

fn fast_config(name: &str) -> SessionConfig {
    SessionConfig {
        display_name: name.to_string(),
        batch_interval: Duration::from_millis(5),
        tick_interval: Duration::from_millis(5),
        resync_timeout: Duration::from_millis(100),
        resync_retries: 3,
        ..SessionConfig::default()
    }
}

fn open(hub: &MemoryHub, name: &str) -> Session {
    open_session(channel(), Replica::new(), Box::new(hub.transport()), fast_config(name), None)
}

async fn wait_for_text(session: &Session, expected: &str) {
    let reached = timeout(WAIT, async {
        while session.visible_text().await.unwrap() != expected {
            sleep(POLL).await;
        }
    })
    .await;
    if reached.is_err() {
        panic!(
            "expected {expected:?}, session has {:?}",
            session.visible_text().await.unwrap()
        );
    }
}

async fn wait_for_status(session: &Session, wanted: TransportStatus) {
    timeout(WAIT, async {
        while session.status().await.unwrap() != wanted {
            sleep(POLL).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("session never became {wanted:?}"));
}

async fn wait_for_event(
    rx: &mut mpsc::UnboundedReceiver<AwarenessEvent>,
    mut matches: impl FnMut(&AwarenessEvent) -> bool,
) -> AwarenessEvent {
    timeout(WAIT, async {
        loop {
            let event = rx.recv().await.expect("awareness stream closed");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("awareness event not received in time")
}

async fn next_message(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> SyncMessage {
    timeout(WAIT, async {
        loop {
            if let Some(TransportEvent::Frame(bytes)) = rx.recv().await {
                if let Ok(msg) = SyncMessage::decode(&bytes) {
                    return msg;
                }
            }
        }
    })
    .await
    .expect("no frame received in time")
}

/// A bare transport on the channel, for injecting hand-made frames.
async fn connect_raw(hub: &MemoryHub) -> (MemoryTransport, mpsc::UnboundedReceiver<TransportEvent>) {
    let mut raw = hub.transport();
    let mut events = raw.connect(&channel());
    timeout(WAIT, async {
        while events.recv().await != Some(TransportEvent::Status(TransportStatus::Connected)) {}
    })
    .await
    .expect("raw transport never connected");
    (raw, events)
}

// ── Convergence ──────────────────────────────────────────────────

#[tokio::test]
async fn test_concurrent_inserts_at_same_gap_converge() {
    let hub = MemoryHub::new();
    let transport_a = hub.transport();
    let transport_b = hub.transport();
    let switch_a = transport_a.link_switch();
    let switch_b = transport_b.link_switch();
    switch_a.go_offline();
    switch_b.go_offline();

    let a = open_session(channel(), Replica::new(), Box::new(transport_a), fast_config("A"), None);
    let b = open_session(channel(), Replica::new(), Box::new(transport_b), fast_config("B"), None);

    a.local_edit(EditEvent::insert(0, "hello")).unwrap();
    b.local_edit(EditEvent::insert(0, "world")).unwrap();
    assert_eq!(a.visible_text().await.unwrap(), "hello");
    assert_eq!(b.visible_text().await.unwrap(), "world");

    switch_a.go_online();
    switch_b.go_online();

    let converged = timeout(WAIT, async {
        loop {
            let text_a = a.visible_text().await.unwrap();
            let text_b = b.visible_text().await.unwrap();
            if text_a == text_b && text_a.len() == 10 {
                return text_a;
            }
            sleep(POLL).await;
        }
    })
    .await
    .expect("replicas did not converge");

    assert!(
        converged == "helloworld" || converged == "worldhello",
        "unexpected merge {converged:?}"
    );
    assert_eq!(a.state_vector().await.unwrap(), b.state_vector().await.unwrap());
}

#[tokio::test]
async fn test_offline_edits_resync_on_reconnect() {
    let hub = MemoryHub::new();
    let transport_a = hub.transport();
    let switch_a = transport_a.link_switch();
    let a = open_session(channel(), Replica::new(), Box::new(transport_a), fast_config("A"), None);
    let b = open(&hub, "B");
    wait_for_status(&a, TransportStatus::Connected).await;
    wait_for_status(&b, TransportStatus::Connected).await;

    a.local_edit(EditEvent::insert(0, "hello world")).unwrap();
    wait_for_text(&b, "hello world").await;

    switch_a.go_offline();
    wait_for_status(&a, TransportStatus::Disconnected).await;

    a.local_edit(EditEvent::insert(11, "!!!")).unwrap();
    b.local_edit(EditEvent::insert(0, "X")).unwrap();
    sleep(Duration::from_millis(50)).await;
    assert_eq!(a.visible_text().await.unwrap(), "hello world!!!");
    assert_eq!(b.visible_text().await.unwrap(), "Xhello world");

    switch_a.go_online();
    wait_for_text(&a, "Xhello world!!!").await;
    wait_for_text(&b, "Xhello world!!!").await;
}

#[tokio::test]
async fn test_late_joiner_catches_up() {
    let hub = MemoryHub::new();
    let a = open(&hub, "A");
    wait_for_status(&a, TransportStatus::Connected).await;
    a.local_edit(EditEvent::insert(0, "fn main() {}")).unwrap();
    a.local_edit(EditEvent::delete(3, 4)).unwrap();
    assert_eq!(a.visible_text().await.unwrap(), "fn () {}");

    let late = open(&hub, "Late");
    wait_for_text(&late, "fn () {}").await;
}

#[tokio::test]
async fn test_channels_do_not_mix() {
    let hub = MemoryHub::new();
    let a = open_session(
        ChannelId::new("project", "a.rs"),
        Replica::new(),
        Box::new(hub.transport()),
        fast_config("A"),
        None,
    );
    let b = open_session(
        ChannelId::new("project", "b.rs"),
        Replica::new(),
        Box::new(hub.transport()),
        fast_config("B"),
        None,
    );
    wait_for_status(&a, TransportStatus::Connected).await;
    wait_for_status(&b, TransportStatus::Connected).await;

    a.local_edit(EditEvent::insert(0, "only in a")).unwrap();
    sleep(Duration::from_millis(200)).await;
    assert_eq!(b.visible_text().await.unwrap(), "");
}

// ── Frame handling ───────────────────────────────────────────────

#[tokio::test]
async fn test_malformed_duplicate_and_out_of_order_frames() {
    let hub = MemoryHub::new();
    let (raw, _raw_events) = connect_raw(&hub).await;
    let raw_id = Uuid::new_v4();

    let a = open(&hub, "A");
    wait_for_status(&a, TransportStatus::Connected).await;

    raw.send(vec![0xde, 0xad, 0xbe, 0xef]).unwrap();

    let mut author = TextDocument::new(Replica::with_ids(raw_id, SiteId(77)));
    let ops = author.local_insert(0, "ok").unwrap();
    let frame = |ops| SyncMessage::update(raw_id, channel(), UpdateFrame::new(ops, Default::default()));

    // Second character first: buffered until its origin arrives.
    raw.send(frame(vec![ops[1].clone()]).encode().unwrap()).unwrap();
    raw.send(frame(vec![ops[0].clone()]).encode().unwrap()).unwrap();
    raw.send(frame(ops.clone()).encode().unwrap()).unwrap();

    let elsewhere = SyncMessage::update(
        raw_id,
        ChannelId::new("project", "other.rs"),
        UpdateFrame::new(
            TextDocument::new(Replica::with_ids(raw_id, SiteId(78)))
                .local_insert(0, "zz")
                .unwrap(),
            Default::default(),
        ),
    );
    raw.send(elsewhere.encode().unwrap()).unwrap();

    wait_for_text(&a, "ok").await;
    sleep(Duration::from_millis(50)).await;
    assert_eq!(a.visible_text().await.unwrap(), "ok");
    assert_eq!(raw.status(), TransportStatus::Connected);
}

#[tokio::test]
async fn test_checksum_mismatch_rebuilds_from_snapshot() {
    let hub = MemoryHub::new();
    let (raw, mut raw_events) = connect_raw(&hub).await;
    let raw_id = Uuid::new_v4();

    let a = open(&hub, "A");
    wait_for_status(&a, TransportStatus::Connected).await;
    a.local_edit(EditEvent::insert(0, "abc")).unwrap();
    let state_vector = a.state_vector().await.unwrap();

    let checksum = SyncMessage::control(
        raw_id,
        channel(),
        ControlFrame::Checksum { state_vector, digest: 0 },
    );
    raw.send(checksum.encode().unwrap()).unwrap();

    loop {
        let msg = next_message(&mut raw_events).await;
        if msg.sender == a.client_id() && msg.frame == Frame::Control(ControlFrame::SnapshotRequest) {
            break;
        }
    }

    let mut canonical = TextDocument::new(Replica::with_ids(raw_id, SiteId(9)));
    canonical.local_insert(0, "xyz").unwrap();
    let response = SyncMessage::control(
        raw_id,
        channel(),
        ControlFrame::SnapshotResponse { to: a.client_id(), snapshot: canonical.snapshot() },
    );
    raw.send(response.encode().unwrap()).unwrap();

    wait_for_text(&a, "xyz").await;

    // The rebuilt replica keeps editing under a fresh site.
    a.local_edit(EditEvent::insert(3, "!")).unwrap();
    assert_eq!(a.visible_text().await.unwrap(), "xyz!");
    let state_vector = a.state_vector().await.unwrap();
    assert_eq!(state_vector.get(SiteId(9)), 3);
    assert_eq!(state_vector.len(), 2);
}

// ── Editor binding ───────────────────────────────────────────────

#[tokio::test]
async fn test_bound_editor_patched_and_caret_shifted() {
    let hub = MemoryHub::new();
    let a = open(&hub, "A");
    let b = open(&hub, "B");
    wait_for_status(&a, TransportStatus::Connected).await;
    wait_for_status(&b, TransportStatus::Connected).await;

    a.local_edit(EditEvent::insert(0, "hello world")).unwrap();
    wait_for_text(&b, "hello world").await;

    let surface = MemorySurface::new("");
    b.bind(Box::new(surface.clone())).unwrap();
    b.visible_text().await.unwrap();
    assert_eq!(surface.contents(), "hello world");

    surface.place_caret(Selection::caret(5));
    b.local_selection(Selection::caret(5)).unwrap();

    a.local_edit(EditEvent::insert(0, "XX")).unwrap();
    wait_for_text(&b, "XXhello world").await;
    assert_eq!(surface.contents(), "XXhello world");
    assert_eq!(surface.caret(), Selection::caret(7));
}

#[tokio::test]
async fn test_typing_in_bound_editor_reaches_peer() {
    let hub = MemoryHub::new();
    let a = open(&hub, "A");
    let b = open(&hub, "B");
    wait_for_status(&a, TransportStatus::Connected).await;
    wait_for_status(&b, TransportStatus::Connected).await;

    let surface = MemorySurface::new("stale");
    a.bind(Box::new(surface.clone())).unwrap();
    a.visible_text().await.unwrap();
    assert_eq!(surface.contents(), "");

    let edit = surface.type_edit(EditEvent::insert(0, "typed"));
    a.local_edit(edit).unwrap();
    wait_for_text(&b, "typed").await;

    a.unbind().unwrap();
    b.local_edit(EditEvent::insert(5, "!")).unwrap();
    wait_for_text(&a, "typed!").await;
    assert_eq!(surface.contents(), "typed");
}

// ── Awareness & follow ───────────────────────────────────────────

#[tokio::test]
async fn test_awareness_reaches_peer_with_stable_color() {
    let hub = MemoryHub::new();
    let a = open(&hub, "Ada");
    let b = open(&hub, "Bob");
    let mut events = b.on_awareness_change().unwrap();
    wait_for_status(&a, TransportStatus::Connected).await;

    a.local_edit(EditEvent::insert(0, "some text")).unwrap();
    a.local_selection(Selection::new(2, 4)).unwrap();

    let a_id = a.client_id();
    let event = wait_for_event(&mut events, |event| {
        matches!(event, AwarenessEvent::Updated(state)
            if state.client_id == a_id && state.selection == Some(Selection::new(2, 4)))
    })
    .await;

    let AwarenessEvent::Updated(state) = event else { unreachable!() };
    assert_eq!(state.cursor, 4);
    assert_eq!(state.display_name, "Ada");
    assert_eq!(state.color, CursorColor::for_client(&a_id));

    let peers = b.awareness_peers().await.unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].client_id, a_id);
}

#[tokio::test]
async fn test_silent_peer_times_out() {
    let hub = MemoryHub::new();
    let transport_a = hub.transport();
    let switch_a = transport_a.link_switch();

    let mut config_a = fast_config("A");
    config_a.awareness.heartbeat_interval = Duration::from_millis(50);
    let mut config_b = fast_config("B");
    config_b.awareness.timeout = Duration::from_millis(300);

    let a = open_session(channel(), Replica::new(), Box::new(transport_a), config_a, None);
    let b = open_session(channel(), Replica::new(), Box::new(hub.transport()), config_b, None);
    let mut events = b.on_awareness_change().unwrap();
    let a_id = a.client_id();

    wait_for_event(&mut events, |e| matches!(e, AwarenessEvent::Updated(s) if s.client_id == a_id)).await;

    // Heartbeats keep A alive well past the timeout.
    sleep(Duration::from_millis(500)).await;
    assert_eq!(b.awareness_peers().await.unwrap().len(), 1);

    switch_a.go_offline();
    let removed = wait_for_event(&mut events, |e| matches!(e, AwarenessEvent::Removed { .. })).await;
    assert_eq!(
        removed,
        AwarenessEvent::Removed { client_id: a_id, reason: RemovalReason::TimedOut }
    );
    assert!(b.awareness_peers().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_follow_centers_viewport_and_breaks_on_leave() {
    let hub = MemoryHub::new();
    let a = open(&hub, "A");
    let b = open(&hub, "B");
    let mut events = b.on_awareness_change().unwrap();
    let a_id = a.client_id();
    wait_for_event(&mut events, |e| matches!(e, AwarenessEvent::Updated(s) if s.client_id == a_id)).await;

    let surface = MemorySurface::new("");
    b.bind(Box::new(surface.clone())).unwrap();
    b.follow(a_id).unwrap();
    assert_eq!(b.follow_state().await.unwrap(), FollowState::Following(a_id));
    assert!(surface.decoration(&a_id).is_some());

    a.local_edit(EditEvent::insert(0, "a longer line of text")).unwrap();
    a.local_selection(Selection::caret(6)).unwrap();
    timeout(WAIT, async {
        while surface.centered_on() != Some(6) {
            sleep(POLL).await;
        }
    })
    .await
    .expect("viewport never followed the target");

    // Local edits do not break follow mode.
    b.local_edit(EditEvent::insert(0, "> ")).unwrap();
    assert_eq!(b.follow_state().await.unwrap(), FollowState::Following(a_id));

    a.dispose();
    wait_for_event(&mut events, |e| matches!(e, AwarenessEvent::Removed { client_id, .. } if *client_id == a_id))
        .await;
    assert_eq!(b.follow_state().await.unwrap(), FollowState::Idle);
    assert!(surface.decoration(&a_id).is_none());
}

#[tokio::test]
async fn test_dispose_notifies_peers_and_subscribers() {
    let hub = MemoryHub::new();
    let a = open(&hub, "A");
    let b = open(&hub, "B");
    let mut a_events = a.on_awareness_change().unwrap();
    let mut b_events = b.on_awareness_change().unwrap();
    let a_id = a.client_id();
    let b_id = b.client_id();

    wait_for_event(&mut a_events, |e| e.client_id() == b_id).await;
    wait_for_event(&mut b_events, |e| e.client_id() == a_id).await;

    a.dispose();

    let left = wait_for_event(&mut b_events, |e| matches!(e, AwarenessEvent::Removed { .. })).await;
    assert_eq!(left, AwarenessEvent::Removed { client_id: a_id, reason: RemovalReason::Left });

    let local = wait_for_event(&mut a_events, |e| matches!(e, AwarenessEvent::Removed { .. })).await;
    assert_eq!(local, AwarenessEvent::Removed { client_id: b_id, reason: RemovalReason::Left });
    assert!(timeout(WAIT, a_events.recv()).await.unwrap().is_none());

    timeout(WAIT, async {
        while hub.room_count().await != 1 {
            sleep(POLL).await;
        }
    })
    .await
    .expect("disposed session stayed in the room");
}

#[tokio::test]
async fn test_dispose_flushes_batched_edits() {
    let hub = MemoryHub::new();
    let a = open_session(
        channel(),
        Replica::new(),
        Box::new(hub.transport()),
        SessionConfig {
            batch_interval: Duration::from_secs(60),
            ..fast_config("A")
        },
        None,
    );
    let b = open(&hub, "B");
    let mut b_events = b.on_awareness_change().unwrap();
    let a_id = a.client_id();
    wait_for_event(&mut b_events, |e| e.client_id() == a_id).await;

    a.local_edit(EditEvent::insert(0, "last words")).unwrap();
    a.dispose();

    wait_for_text(&b, "last words").await;
    let left = wait_for_event(&mut b_events, |e| matches!(e, AwarenessEvent::Removed { .. })).await;
    assert_eq!(left, AwarenessEvent::Removed { client_id: a_id, reason: RemovalReason::Left });
}
