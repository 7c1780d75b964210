//! Peer coordination integration tests
//!
//! Discovery and the mute channel over loopback sockets

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use wakenode::Dispatcher;
use wakenode::peers::{
    Announcer, DiscoveryListener, MuteAction, MutePublisher, PeerRequest, Subscriptions,
    spawn_subscription,
};
use wakenode::router::{CommandChannel, RouterDirective};
use wakenode::voice::{
    ActivationSource, FeedbackSounds, ListenerController, ListenerEvent, MuteState, PlaybackEvent,
    PlaybackQueue,
};

mod common;
use common::fast_retry;

const LOOPBACK: Ipv4Addr = Ipv4Addr::LOCALHOST;

async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out")
        .expect("channel closed")
}

async fn wait_for_subscribers(publisher: &MutePublisher, n: usize) {
    for _ in 0..500 {
        if publisher.subscriber_count() == n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {n} subscribers, have {}", publisher.subscriber_count());
}

async fn send_datagram(to: SocketAddr, data: &[u8]) {
    let socket = UdpSocket::bind((LOOPBACK, 0)).await.unwrap();
    socket.send_to(data, to).await.unwrap();
}

#[tokio::test]
async fn discovery_reports_each_new_peer_once() {
    let cancel = CancellationToken::new();
    let listener = DiscoveryListener::bind(SocketAddr::from((LOOPBACK, 0)), Ipv4Addr::new(10, 0, 0, 3))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, mut peers) = mpsc::unbounded_channel();
    let task = tokio::spawn(listener.run(tx, cancel.clone()));

    send_datagram(addr, b"hello;10.0.0.2").await;
    assert_eq!(recv(&mut peers).await, Ipv4Addr::new(10, 0, 0, 2));

    // Own address, a repeat and noise are all ignored
    send_datagram(addr, b"hello;10.0.0.3").await;
    send_datagram(addr, b"hello;10.0.0.2").await;
    send_datagram(addr, b"goodbye").await;
    send_datagram(addr, b"hello;10.0.0.4").await;
    assert_eq!(recv(&mut peers).await, Ipv4Addr::new(10, 0, 0, 4));

    cancel.cancel();
    assert!(task.await.unwrap().is_ok());
}

#[tokio::test]
async fn announcer_repeats_hello() {
    let cancel = CancellationToken::new();
    let receiver = UdpSocket::bind((LOOPBACK, 0)).await.unwrap();
    let announcer = Announcer::bind(
        Ipv4Addr::new(10, 0, 0, 9),
        receiver.local_addr().unwrap(),
        Duration::from_millis(20),
    )
    .await
    .unwrap();
    tokio::spawn(announcer.run(cancel.clone()));

    let mut buf = [0u8; 64];
    for _ in 0..2 {
        let (len, _) = tokio::time::timeout(Duration::from_secs(5), receiver.recv_from(&mut buf))
            .await
            .expect("no announcement")
            .unwrap();
        assert_eq!(&buf[..len], b"hello;10.0.0.9");
    }
    cancel.cancel();
}

#[tokio::test]
async fn discovered_peer_receives_mute_requests() {
    let cancel = CancellationToken::new();

    // The "kitchen" node publishes
    let (publisher, _publish_task) = MutePublisher::bind(
        SocketAddr::from((LOOPBACK, 0)),
        "kitchen".to_string(),
        cancel.clone(),
    )
    .await
    .unwrap();

    // The "den" node hears kitchen's hello and subscribes
    let listener = DiscoveryListener::bind(SocketAddr::from((LOOPBACK, 0)), Ipv4Addr::new(10, 0, 0, 3))
        .await
        .unwrap();
    let discovery_addr = listener.local_addr().unwrap();
    let (peer_tx, mut new_peers) = mpsc::unbounded_channel();
    tokio::spawn(listener.run(peer_tx, cancel.clone()));

    let (request_tx, mut requests) = mpsc::unbounded_channel();
    let mut subscriptions = Subscriptions::new(
        publisher.local_addr().port(),
        request_tx,
        fast_retry(),
        cancel.clone(),
    );

    send_datagram(discovery_addr, b"hello;127.0.0.1").await;
    let peer = recv(&mut new_peers).await;
    assert!(subscriptions.subscribe(peer));
    assert!(!subscriptions.subscribe(peer));
    wait_for_subscribers(&publisher, 1).await;

    // Kitchen activates and finishes an utterance
    let (commands, _sent) = CommandChannel::detached();
    let (controller, _control) = ListenerController::channel();
    let kitchen = Dispatcher::new(commands, controller, Arc::new(MuteState::new()), None)
        .with_publisher(publisher.clone());
    kitchen
        .on_listener_event(ListenerEvent::Activated {
            source: ActivationSource::Keyword,
        })
        .unwrap();

    let request = recv(&mut requests).await;
    assert_eq!(
        request,
        PeerRequest {
            action: MuteAction::Mute,
            peer: "kitchen".to_string()
        }
    );

    // Den applies it
    let den_mute = Arc::new(MuteState::new());
    let (commands, _sent) = CommandChannel::detached();
    let (controller, _control) = ListenerController::channel();
    let den = Dispatcher::new(
        commands,
        controller,
        Arc::clone(&den_mute),
        Some(Duration::from_secs(15)),
    );
    den.on_peer_request(&request);
    assert!(den_mute.is_muted());

    kitchen
        .on_listener_event(ListenerEvent::Finished {
            speech_detected: false,
            utterance: None,
        })
        .unwrap();
    let request = recv(&mut requests).await;
    assert_eq!(request.action, MuteAction::Unmute);
    den.on_peer_request(&request);
    assert!(!den_mute.is_muted());

    cancel.cancel();
}

#[tokio::test]
async fn speech_playback_mutes_peers_until_drained() {
    let cancel = CancellationToken::new();
    let (publisher, _task) = MutePublisher::bind(
        SocketAddr::from((LOOPBACK, 0)),
        "kitchen".to_string(),
        cancel.clone(),
    )
    .await
    .unwrap();

    let (tx, mut requests) = mpsc::unbounded_channel();
    let _subscription = spawn_subscription(publisher.local_addr(), tx, fast_retry(), cancel.clone());
    wait_for_subscribers(&publisher, 1).await;

    let mute = Arc::new(MuteState::new());
    let (playback, mut playback_events) = PlaybackQueue::spawn(Arc::clone(&mute), false).unwrap();
    let (commands, _sent) = CommandChannel::detached();
    let (controller, _control) = ListenerController::channel();
    let kitchen = Dispatcher::new(commands, controller, mute, None)
        .with_publisher(publisher.clone())
        .with_playback(playback, FeedbackSounds::default());

    // The utterance closes before the router answers with speech
    kitchen
        .on_listener_event(ListenerEvent::Activated {
            source: ActivationSource::Remote,
        })
        .unwrap();
    kitchen
        .on_listener_event(ListenerEvent::Finished {
            speech_detected: true,
            utterance: Some(vec![0; 4]),
        })
        .unwrap();
    assert_eq!(recv(&mut requests).await.action, MuteAction::Mute);
    assert_eq!(recv(&mut requests).await.action, MuteAction::Unmute);

    kitchen
        .on_directive(RouterDirective::Speak { audio: vec![0; 320] })
        .unwrap();
    assert_eq!(
        recv(&mut requests).await,
        PeerRequest {
            action: MuteAction::Mute,
            peer: "kitchen".to_string()
        }
    );

    let event = recv(&mut playback_events).await;
    assert_eq!(event, PlaybackEvent::SpeechDrained);
    kitchen.on_playback_event(event);
    assert_eq!(recv(&mut requests).await.action, MuteAction::Unmute);

    cancel.cancel();
}

#[tokio::test]
async fn subscription_waits_for_a_late_publisher() {
    let cancel = CancellationToken::new();
    let port = {
        let probe = std::net::TcpListener::bind((LOOPBACK, 0)).unwrap();
        probe.local_addr().unwrap().port()
    };

    let (tx, mut requests) = mpsc::unbounded_channel();
    let _subscription = spawn_subscription(SocketAddr::from((LOOPBACK, port)), tx, fast_retry(), cancel.clone());
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (publisher, _task) = MutePublisher::bind(
        SocketAddr::from((LOOPBACK, port)),
        "hall".to_string(),
        cancel.clone(),
    )
    .await
    .unwrap();
    wait_for_subscribers(&publisher, 1).await;

    publisher.publish(MuteAction::Unmute);
    assert_eq!(
        recv(&mut requests).await,
        PeerRequest {
            action: MuteAction::Unmute,
            peer: "hall".to_string()
        }
    );
    cancel.cancel();
}

#[tokio::test]
async fn subscriber_count_drops_on_disconnect() {
    let cancel = CancellationToken::new();
    let (publisher, _task) = MutePublisher::bind(
        SocketAddr::from((LOOPBACK, 0)),
        "hall".to_string(),
        cancel.clone(),
    )
    .await
    .unwrap();

    let (tx, _requests) = mpsc::unbounded_channel();
    let sub_cancel = CancellationToken::new();
    let _subscription = spawn_subscription(publisher.local_addr(), tx, fast_retry(), sub_cancel.clone());
    wait_for_subscribers(&publisher, 1).await;

    sub_cancel.cancel();
    // The publisher notices on its next write
    for _ in 0..50 {
        publisher.publish(MuteAction::Mute);
        if publisher.subscriber_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(publisher.subscriber_count(), 0);
    cancel.cancel();
}
