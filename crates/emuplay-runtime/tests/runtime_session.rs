use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use emuplay_core::{
    FrameFlags, MachineError, PortMasks, ResetKind, SnapshotError, StateHash, demo::DemoMachine,
};
use emuplay_netplay::{ConnectionData, NetplayConfig};
use emuplay_runtime::{
    EmulationContext, EmulationFlags, EmulationState, Movie, NotificationEvent, Pacing, Runtime,
    RuntimeConfig, RuntimeError, RuntimeHandle,
};

fn manual_config() -> RuntimeConfig {
    RuntimeConfig {
        pacing: Pacing::Manual,
        netplay: NetplayConfig {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            handshake_timeout: Duration::from_secs(3),
            peer_timeout: Duration::from_secs(3),
            keepalive_interval: Duration::from_millis(200),
            ..NetplayConfig::default()
        },
        ..RuntimeConfig::default()
    }
}

fn start(ctx: EmulationContext) -> (Runtime, RuntimeHandle) {
    let runtime = Runtime::initialize(manual_config(), ctx).unwrap();
    let handle = runtime.handle();
    handle.run().unwrap();
    (runtime, handle)
}

fn scratch_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("emuplay-rt-{name}-{}.epm", std::process::id()))
}

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

fn expect_event(rx: &Receiver<NotificationEvent>, wanted: NotificationEvent) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(left) {
            Ok(ev) if ev == wanted => return,
            Ok(_) => {}
            Err(_) => panic!("never saw {}", wanted.name()),
        }
    }
}

/// Step a client until it has applied every host frame below `frame`.
fn follow_until(client: &RuntimeHandle, frame: u64) {
    wait_until("client to catch up", || {
        if client.frame() < frame {
            client.step_frames(1).unwrap();
        }
        client.frame() >= frame
    });
}

/// Host on an ephemeral port with one client joined at the host's frame.
fn hosted_pair() -> ((Runtime, RuntimeHandle), (Runtime, RuntimeHandle), SocketAddr) {
    let host = start(EmulationContext::new(DemoMachine::new()));
    let addr = host.1.start_server(0).unwrap();

    let client = start(EmulationContext::new(DemoMachine::new()));
    client
        .1
        .connect(ConnectionData::new("127.0.0.1", addr.port(), "P2"))
        .unwrap();
    let host_handle = host.1.clone();
    wait_until("host to see the peer", || host_handle.is_connected());
    (host, client, addr)
}

#[test]
fn client_matches_host_state_frame_for_frame() {
    let ((_host_rt, host), (_client_rt, client), _) = hosted_pair();
    assert!(client.is_connected());
    assert_eq!(client.frame(), host.frame());

    host.step_frames(10).unwrap();
    follow_until(&client, host.frame());

    assert_eq!(client.frame(), 10);
    assert_eq!(host.state_hash().unwrap(), client.state_hash().unwrap());

    let peers = host.peers().unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].name, "P2");
    assert_eq!(peers[0].port, 1);
}

#[test]
fn host_reset_reaches_the_client() {
    let ((_host_rt, host), (_client_rt, client), _) = hosted_pair();
    let (_, client_events) = client.subscribe_channel(64);

    host.step_frames(3).unwrap();
    host.reset(ResetKind::Soft).unwrap();
    host.step_frames(3).unwrap();
    follow_until(&client, host.frame());

    expect_event(&client_events, NotificationEvent::GameReset);
    assert_eq!(host.state_hash().unwrap(), client.state_hash().unwrap());
}

#[test]
fn client_reset_request_runs_on_both_sides() {
    let ((_host_rt, host), (_client_rt, client), _) = hosted_pair();
    let (_, host_events) = host.subscribe_channel(64);

    client.reset(ResetKind::PowerOn).unwrap();
    wait_until("host to apply the reset", || {
        host.step_frames(1).unwrap();
        host_events.try_iter().any(|ev| ev == NotificationEvent::GameReset)
    });
    follow_until(&client, host.frame());

    assert_eq!(host.state_hash().unwrap(), client.state_hash().unwrap());
}

#[test]
fn pause_is_refused_while_a_peer_is_connected() {
    let ((_host_rt, host), (_client_rt, client), _) = hosted_pair();
    let (_, host_events) = host.subscribe_channel(64);

    host.pause().unwrap();
    expect_event(&host_events, NotificationEvent::PauseRejected);
    assert_eq!(host.state(), EmulationState::Running);
    assert!(!host.check_flag(EmulationFlags::PAUSED));

    client.disconnect().unwrap();
    assert!(!client.is_connected());
    wait_until("host to see the peer leave", || !host.is_connected());

    host.pause().unwrap();
    assert_eq!(host.state(), EmulationState::Paused);
    assert_eq!(host.step_frames(4).unwrap(), 0);
}

#[test]
fn paused_or_stopped_client_runs_once_joined() {
    let (_host_rt, host) = start(EmulationContext::new(DemoMachine::new()));
    let addr = host.start_server(0).unwrap();

    let (_paused_rt, paused) = start(EmulationContext::new(DemoMachine::new()));
    paused.pause().unwrap();
    assert_eq!(paused.state(), EmulationState::Paused);
    paused
        .connect(ConnectionData::new("127.0.0.1", addr.port(), "P2"))
        .unwrap();
    assert_eq!(paused.state(), EmulationState::Running);

    let stopped_rt =
        Runtime::initialize(manual_config(), EmulationContext::new(DemoMachine::new())).unwrap();
    let stopped = stopped_rt.handle();
    assert_eq!(stopped.state(), EmulationState::Stopped);
    stopped
        .connect(ConnectionData::new("127.0.0.1", addr.port(), "P3"))
        .unwrap();
    assert_eq!(stopped.state(), EmulationState::Running);

    wait_until("host to see both peers", || {
        host.peers().is_ok_and(|peers| peers.len() == 2)
    });
    host.step_frames(5).unwrap();
    follow_until(&paused, host.frame());
    follow_until(&stopped, host.frame());

    let hash = host.state_hash().unwrap();
    assert_eq!(paused.state_hash().unwrap(), hash);
    assert_eq!(stopped.state_hash().unwrap(), hash);
}

#[test]
fn reset_on_a_host_without_peers_applies_immediately() {
    let (_rt, handle) = start(EmulationContext::new(DemoMachine::new()));
    handle.step_frames(5).unwrap();
    handle.start_server(0).unwrap();
    handle.pause().unwrap();
    assert_eq!(handle.state(), EmulationState::Paused);

    let power_on = StateHash::of_machine(&DemoMachine::new()).unwrap();
    assert_ne!(handle.state_hash().unwrap(), power_on);
    handle.reset(ResetKind::PowerOn).unwrap();
    assert_eq!(handle.state_hash().unwrap(), power_on);
}

#[test]
fn movie_recorded_by_a_host_replays_the_merged_stream() {
    let host_pads = |frame: u64| -> PortMasks { [(frame % 5) as u8, 0, 0, 0] };
    let (_host_rt, host) = start(EmulationContext::new(DemoMachine::new()).with_input(host_pads));
    let addr = host.start_server(0).unwrap();
    let client_pads = |_: u64| -> PortMasks { [0x40, 0, 0, 0] };
    let (_client_rt, client) =
        start(EmulationContext::new(DemoMachine::new()).with_input(client_pads));
    client
        .connect(ConnectionData::new("127.0.0.1", addr.port(), "P2"))
        .unwrap();
    wait_until("host to see the peer", || host.is_connected());

    let path = scratch_path("hosted");
    host.movie_record(&path, false).unwrap();
    for step in 0..30 {
        if step == 10 {
            client.reset(ResetKind::Soft).unwrap();
        }
        host.step_frames(1).unwrap();
        follow_until(&client, host.frame());
        // Let the client's pad reach the host before its target frame.
        thread::sleep(Duration::from_millis(5));
    }
    host.movie_stop().unwrap();
    let recorded = host.state_hash().unwrap();
    assert_eq!(client.state_hash().unwrap(), recorded);

    let movie = Movie::load(&path).unwrap();
    assert_eq!(movie.frames.len(), 30);
    assert!(movie.frames.iter().any(|f| f.ports[1] == 0x40));
    assert!(
        movie
            .frames
            .iter()
            .any(|f| f.commands.contains(FrameFlags::RESET))
    );

    client.disconnect().unwrap();
    host.stop_server().unwrap();
    host.movie_play(&path).unwrap();
    assert_eq!(host.step_frames(30).unwrap(), 30);
    assert!(!host.movie_playing());
    assert_eq!(host.state_hash().unwrap(), recorded);

    let _ = std::fs::remove_file(&path);
}

#[test]
fn client_cannot_record_or_load_slots() {
    let ((_host_rt, _host), (_client_rt, client), _) = hosted_pair();
    let path = scratch_path("client-record");

    assert!(matches!(
        client.movie_record(&path, false),
        Err(RuntimeError::RecordWhileClient)
    ));
    assert!(!client.movie_recording());
    assert!(matches!(client.load_state(0), Err(RuntimeError::NetplayActive)));
}

#[test]
fn connect_to_closed_port_leaves_runtime_disconnected() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let (_rt, handle) = start(EmulationContext::new(DemoMachine::new()));

    let err = handle
        .connect(ConnectionData::new("127.0.0.1", port, "P2"))
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Netplay(_)));
    assert!(!handle.is_connected());
    assert_eq!(handle.step_frames(2).unwrap(), 2);
}

#[test]
fn slot_round_trip_restores_state() {
    let (_rt, handle) = start(EmulationContext::new(DemoMachine::new()));
    let (_, events) = handle.subscribe_channel(64);

    handle.step_frames(5).unwrap();
    let saved = handle.save_state(3).unwrap();
    assert_eq!(saved.frame, 5);
    assert_eq!(handle.state_info(3).unwrap().frame, 5);
    let hash = handle.state_hash().unwrap();

    handle.step_frames(5).unwrap();
    handle.reset(ResetKind::PowerOn).unwrap();
    assert_ne!(handle.state_hash().unwrap(), hash);

    handle.load_state(3).unwrap();
    assert_eq!(handle.state_hash().unwrap(), hash);
    // The frame counter never runs backwards.
    assert_eq!(handle.frame(), 10);

    expect_event(&events, NotificationEvent::StateSaved);
    expect_event(&events, NotificationEvent::StateLoaded);

    assert!(matches!(
        handle.state_info(4),
        Err(RuntimeError::Snapshot(SnapshotError::SlotEmpty(4)))
    ));
    assert!(matches!(
        handle.save_state(99),
        Err(RuntimeError::Snapshot(SnapshotError::InvalidSlot { slot: 99, .. }))
    ));
}

#[test]
fn mid_instruction_save_fails_without_touching_slot() {
    let mut machine = DemoMachine::new();
    machine.set_mid_instruction(true);
    let (_rt, handle) = start(EmulationContext::new(machine));

    let err = handle.save_state(0).unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Snapshot(SnapshotError::SerializationFailed(MachineError::MidInstruction))
    ));
    assert!(matches!(
        handle.state_info(0),
        Err(RuntimeError::Snapshot(SnapshotError::SlotEmpty(0)))
    ));
}

#[test]
fn recorded_movie_replays_to_the_same_state() {
    let pads = |frame: u64| -> PortMasks { [(frame % 7) as u8, (frame % 3) as u8, 0, 0] };
    let (_rt, handle) = start(EmulationContext::new(DemoMachine::new()).with_input(pads));
    let path = scratch_path("replay");

    handle.step_frames(4).unwrap();
    handle.movie_record(&path, true).unwrap();
    assert!(handle.movie_recording());
    assert!(matches!(
        handle.movie_play(&path),
        Err(RuntimeError::MovieActive)
    ));
    handle.step_frames(20).unwrap();
    handle.reset(ResetKind::Soft).unwrap();
    handle.step_frames(5).unwrap();
    handle.movie_stop().unwrap();
    assert!(!handle.movie_recording());
    let recorded = handle.state_hash().unwrap();

    let (_, events) = handle.subscribe_channel(256);
    handle.movie_play(&path).unwrap();
    assert!(handle.movie_playing());
    assert!(!handle.movie_recording());
    assert_eq!(handle.step_frames(25).unwrap(), 25);

    expect_event(&events, NotificationEvent::PlaybackFinished);
    assert!(!handle.movie_playing());
    assert_eq!(handle.state_hash().unwrap(), recorded);

    let _ = std::fs::remove_file(&path);
}

#[test]
fn stepping_requires_a_started_game() {
    let runtime = Runtime::initialize(manual_config(), EmulationContext::new(DemoMachine::new()))
        .unwrap();
    let handle = runtime.handle();
    assert_eq!(handle.state(), EmulationState::Stopped);
    assert!(matches!(handle.step_frames(1), Err(RuntimeError::NotRunning)));

    handle.run().unwrap();
    assert_eq!(handle.step_frames(3).unwrap(), 3);
    handle.stop().unwrap();
    handle.stop().unwrap();
    assert_eq!(handle.state(), EmulationState::Stopped);
}

#[test]
fn screenshot_needs_a_rom() {
    let (_rt, handle) = start(EmulationContext::new(DemoMachine::new()));
    assert!(matches!(handle.take_screenshot(), Err(RuntimeError::NoRom)));
}

#[test]
fn unknown_listener_handle_is_ignored() {
    let (_rt, handle) = start(EmulationContext::new(DemoMachine::new()));
    let (registered, _rx) = handle.subscribe_channel(4);
    assert!(handle.unsubscribe(registered));
    assert!(!handle.unsubscribe(registered));
    assert_eq!(handle.bus().listener_count(), 0);
}

#[test]
fn release_hands_back_the_context() {
    let (runtime, handle) = start(EmulationContext::new(DemoMachine::new()));
    let (_, events) = handle.subscribe_channel(16);
    handle.step_frames(2).unwrap();

    let ctx = runtime.release();
    assert!(ctx.is_some());
    expect_event(&events, NotificationEvent::GameStopped);
    assert!(matches!(
        handle.run(),
        Err(RuntimeError::ControlChannelDisconnected)
    ));
}
