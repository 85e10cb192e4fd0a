//! Two peers on loopback: negotiation through the relay, actions over the
//! data channel and over the fallback path.

use std::sync::mpsc::Receiver;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::json;

use duel_rtc::channel::Route;
use duel_rtc::client::RelayClient;
use duel_rtc::config::{ClientConfig, LinkConfig, RelayConfig};
use duel_rtc::game::{GameAction, GameStateAdapter, TurnState};
use duel_rtc::model::payload::{ActionEnvelope, ActionKind};
use duel_rtc::negotiator::{NegotiationState, Transition};
use duel_rtc::peer::{Peer, PeerEvent, StatusUpdate};
use duel_rtc::server::{start_relay, RelayHandle};

#[derive(Default)]
struct Recorder(Vec<ActionEnvelope>);

impl GameStateAdapter for Recorder {
    fn apply_remote_action(&mut self, envelope: &ActionEnvelope) {
        self.0.push(envelope.clone());
    }
}

fn relay() -> RelayHandle {
    start_relay(RelayConfig {
        bind: "127.0.0.1:0".into(),
        poll_wait: Duration::from_millis(200),
        ..Default::default()
    })
    .unwrap()
}

fn peer<G: GameStateAdapter>(handle: &RelayHandle, game: G) -> Peer<RelayClient, G> {
    let mut config = ClientConfig::new(handle.url());
    config.poll_wait = Duration::from_millis(200);
    let relay = RelayClient::connect(config).unwrap();
    Peer::new(relay, game, LinkConfig::loopback())
}

/// Tick both peers until `done` holds or the deadline passes.
fn drive<A, B>(
    a: &mut Peer<RelayClient, A>,
    b: &mut Peer<RelayClient, B>,
    timeout: Duration,
    done: impl Fn(&Peer<RelayClient, A>, &Peer<RelayClient, B>) -> bool,
) -> bool
where
    A: GameStateAdapter,
    B: GameStateAdapter,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        a.tick();
        b.tick();
        if done(a, b) {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

fn both_established<A: GameStateAdapter, B: GameStateAdapter>(
    a: &Peer<RelayClient, A>,
    b: &Peer<RelayClient, B>,
) -> bool {
    a.negotiation_state() == NegotiationState::Established
        && b.negotiation_state() == NegotiationState::Established
}

fn saw(status: &Receiver<StatusUpdate>, wanted: fn(&StatusUpdate) -> bool) -> bool {
    status.try_iter().any(|u| wanted(&u))
}

#[test]
fn host_and_guest_reach_a_direct_channel() {
    let handle = relay();
    let mut host = peer(&handle, Recorder::default());
    let mut guest = peer(&handle, Recorder::default());
    let host_status = host.subscribe();

    let id = host.host(None).unwrap();
    let link = host.share_link("http://localhost:3000/").unwrap();
    assert_eq!(guest.join(&link).unwrap(), id);

    assert!(drive(&mut host, &mut guest, Duration::from_secs(15), both_established));
    assert!(host.is_direct() && guest.is_direct());
    assert!(saw(&host_status, |u| matches!(
        u,
        StatusUpdate::Established { .. }
    )));

    let route = host
        .broadcast_local_action(ActionKind::ChatMessage, json!({ "text": "hi" }))
        .unwrap();
    assert_eq!(route, Route::Direct);

    assert!(drive(&mut host, &mut guest, Duration::from_secs(5), |_, g| {
        !g.game().0.is_empty()
    }));
    // Give a duplicate a chance to show up.
    drive(&mut host, &mut guest, Duration::from_millis(200), |_, _| false);

    let received = &guest.game().0;
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].action, ActionKind::ChatMessage);
    assert_eq!(received[0].payload, json!({ "text": "hi" }));

    host.leave();
    guest.leave();
    handle.stop();
}

#[test]
fn actions_fall_back_to_the_relay_after_the_peer_link_goes() {
    let handle = relay();
    let mut host = peer(&handle, TurnState::new());
    let mut guest = peer(&handle, TurnState::new());

    host.host(Some("castle")).unwrap();
    guest.join(host.session().unwrap().id.as_str()).unwrap();
    assert!(drive(&mut host, &mut guest, Duration::from_secs(15), both_established));

    let end = host.game_mut().end_turn();
    assert_eq!(host.broadcast(&end).unwrap(), Route::Direct);
    assert!(drive(&mut host, &mut guest, Duration::from_secs(5), |_, g| {
        g.game().turn == 2
    }));
    assert_eq!(guest.game().current_player, 2);

    // The host's link drops; the guest keeps polling the relay.
    host.handle(PeerEvent::Link(Transition::Closed));
    assert_eq!(host.negotiation_state(), NegotiationState::Closed);
    assert!(!host.is_direct());

    let chat = GameAction::chat("still there?");
    assert_eq!(host.broadcast(&chat).unwrap(), Route::Relayed);
    assert!(drive(&mut host, &mut guest, Duration::from_secs(5), |_, g| {
        g.game().messages.iter().any(|m| m == "Opponent: still there?")
    }));

    host.leave();
    guest.leave();
    handle.stop();
}

#[test]
fn opponent_leaving_an_established_game_moves_sends_to_the_relay() {
    let handle = relay();
    let mut host = peer(&handle, TurnState::new());
    let mut guest = peer(&handle, TurnState::new());
    let host_status = host.subscribe();

    host.host(None).unwrap();
    guest.join(host.session().unwrap().id.as_str()).unwrap();
    assert!(drive(&mut host, &mut guest, Duration::from_secs(15), both_established));

    guest.leave();

    let deadline = Instant::now() + Duration::from_secs(5);
    while host.negotiation_state() != NegotiationState::Closed && Instant::now() < deadline {
        host.tick();
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(host.negotiation_state(), NegotiationState::Closed);
    assert!(saw(&host_status, |u| *u == StatusUpdate::PeerLeft));

    let end = host.game_mut().end_turn();
    assert_eq!(host.broadcast(&end).unwrap(), Route::Relayed);
    assert!(host.session().is_some());

    host.leave();
    handle.stop();
}

#[test]
fn unanswered_offer_routes_end_turn_through_the_relay() {
    let handle = relay();
    let mut host = peer(&handle, TurnState::new());
    // The guest does not tick until the host has sent, so the offer is unanswered.
    let mut guest = peer(&handle, Recorder::default());

    host.host(None).unwrap();
    guest.join(host.session().unwrap().id.as_str()).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while host.negotiation_state() != NegotiationState::Negotiating && Instant::now() < deadline {
        host.tick();
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(host.negotiation_state(), NegotiationState::Negotiating);

    let end = host.game_mut().end_turn();
    assert_eq!(host.broadcast(&end).unwrap(), Route::Relayed);

    // The guest's adapter sees it once it polls the relay.
    let deadline = Instant::now() + Duration::from_secs(5);
    while guest.game().0.is_empty() && Instant::now() < deadline {
        guest.tick();
        thread::sleep(Duration::from_millis(5));
    }
    let received = &guest.game().0;
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].action, ActionKind::EndTurn);
    assert_eq!(received[0].payload, json!({ "player": 2, "turn": 2 }));

    host.leave();
    guest.leave();
    handle.stop();
}
