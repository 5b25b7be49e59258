//! Loopback integration tests: two contexts over localhost, progressed
//! from a single thread.

use std::net::TcpListener;
use std::time::Duration;

use tagio::{Config, Context, Event, IoRegion, Status};

// Completion tokens are plain labels in these tests.
type Ctx = Context<u32>;

fn config() -> Config {
    Config {
        iomsg_size: 64,
        connect_timeout: Some(Duration::from_secs(5)),
        rndv_thresh: None,
    }
}

fn region_of(buf: &mut Box<[u8]>) -> IoRegion {
    // Safety: every test keeps the box alive until the operation
    // completes.
    unsafe { IoRegion::new(buf.as_mut_ptr(), buf.len()) }
}

/// Progress both contexts until `done` says so, with a bounded number of
/// passes so a broken test fails instead of hanging.
fn pump_until(
    a: &mut Ctx,
    b: &mut Ctx,
    events: &mut Vec<Event<u32>>,
    mut done: impl FnMut(&[Event<u32>]) -> bool,
) {
    for _ in 0..100_000 {
        a.progress();
        b.progress();
        while let Some(ev) = a.poll_event() {
            events.push(ev);
        }
        while let Some(ev) = b.poll_event() {
            events.push(ev);
        }
        if done(events) {
            return;
        }
        std::thread::sleep(Duration::from_micros(50));
    }
    panic!("pump_until did not converge; events: {:?}", events);
}

fn established_pair() -> (Ctx, Ctx, tagio::ConnId, tagio::ConnId) {
    let mut server = Ctx::new(config());
    server.listen("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = server.local_addr().unwrap();

    let mut client = Ctx::new(config());
    let client_conn = client.connect(addr).unwrap();

    let mut events = Vec::new();
    pump_until(&mut client, &mut server, &mut events, |evs| {
        evs.iter().any(|e| matches!(e, Event::Accepted { .. }))
            && evs.iter().any(
                |e| matches!(e, Event::ConnectResult { status, .. } if status.is_ok()),
            )
    });

    let server_conn = events
        .iter()
        .find_map(|e| match e {
            Event::Accepted { conn } => Some(*conn),
            _ => None,
        })
        .unwrap();

    assert!(client.conn(client_conn).unwrap().is_established());
    assert!(server.conn(server_conn).unwrap().is_established());
    (client, server, client_conn, server_conn)
}

#[test]
fn test_connect_accept() {
    let (client, server, client_conn, server_conn) = established_pair();
    assert_eq!(client.num_connections(), 1);
    assert_eq!(server.num_connections(), 1);
    assert!(!client.conn(client_conn).unwrap().is_disconnecting());
    assert!(server.conn(server_conn).unwrap().peer_name().contains("127.0.0.1"));
}

#[test]
fn test_control_message_roundtrip() {
    let (mut client, mut server, client_conn, _server_conn) = established_pair();

    let mut msg: Box<[u8]> = (0..64u8).collect();
    let region = region_of(&mut msg);
    assert!(client.send_io_message(client_conn, region, 7, 1));

    let mut events = Vec::new();
    pump_until(&mut client, &mut server, &mut events, |evs| {
        evs.iter().any(|e| matches!(e, Event::Control { .. }))
            && evs
                .iter()
                .any(|e| matches!(e, Event::OpComplete { token: 1, status } if status.is_ok()))
    });

    let data = events
        .iter()
        .find_map(|e| match e {
            Event::Control { data, .. } => Some(data.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(&data[..], &msg[..]);
}

#[test]
fn test_data_posted_receive() {
    let (mut client, mut server, client_conn, server_conn) = established_pair();

    let mut rx: Box<[u8]> = vec![0u8; 4096].into_boxed_slice();
    let rx_region = region_of(&mut rx);
    assert!(server.recv_data(server_conn, rx_region, 42, 10));

    let mut tx: Box<[u8]> = (0..4096usize).map(|i| i as u8).collect();
    let tx_region = region_of(&mut tx);
    assert!(client.send_data(client_conn, tx_region, 42, 11));

    let mut events = Vec::new();
    pump_until(&mut client, &mut server, &mut events, |evs| {
        evs.iter()
            .filter(|e| matches!(e, Event::OpComplete { status, .. } if status.is_ok()))
            .count()
            == 2
    });
    assert_eq!(&rx[..], &tx[..]);

    // Nothing fell off the zero-copy path.
    assert_eq!(server.pin_stats().evictions, 0);
    assert_eq!(server.pin_stats().regions, 0);
}

#[test]
fn test_data_unexpected_then_posted() {
    let (mut client, mut server, client_conn, server_conn) = established_pair();

    // Send before the receive is posted: the frame must stage.
    let mut tx: Box<[u8]> = (0..1000usize).map(|i| (i * 3) as u8).collect();
    let tx_region = region_of(&mut tx);
    assert!(client.send_data(client_conn, tx_region, 9, 20));

    let mut events = Vec::new();
    pump_until(&mut client, &mut server, &mut events, |evs| {
        evs.iter()
            .any(|e| matches!(e, Event::OpComplete { token: 20, status } if status.is_ok()))
    });
    // Wait for the frame to arrive and stage.
    for _ in 0..100_000 {
        server.progress();
        if server.pin_stats().evictions > 0 {
            break;
        }
        std::thread::sleep(Duration::from_micros(50));
    }
    assert_eq!(server.pin_stats().evictions, 1);

    let mut rx: Box<[u8]> = vec![0u8; 1000].into_boxed_slice();
    let rx_region = region_of(&mut rx);
    assert!(server.recv_data(server_conn, rx_region, 9, 21));

    pump_until(&mut client, &mut server, &mut events, |evs| {
        evs.iter()
            .any(|e| matches!(e, Event::OpComplete { token: 21, status } if status.is_ok()))
    });
    assert_eq!(&rx[..], &tx[..]);
}

#[test]
fn test_disconnect_cancels_outstanding() {
    let (mut client, mut server, client_conn, _server_conn) = established_pair();

    let mut rx: Box<[u8]> = vec![0u8; 128].into_boxed_slice();
    let rx_region = region_of(&mut rx);
    assert!(client.recv_data(client_conn, rx_region, 5, 30));

    client.disconnect(client_conn);
    assert!(client.conn(client_conn).unwrap().is_disconnecting());

    // Posts after a disconnect fail synchronously.
    let mut late: Box<[u8]> = vec![0u8; 16].into_boxed_slice();
    let late_region = region_of(&mut late);
    assert!(!client.send_data(client_conn, late_region, 6, 31));

    let mut events = Vec::new();
    pump_until(&mut client, &mut server, &mut events, |evs| {
        evs.iter().any(|e| matches!(e, Event::Closed { .. }))
    });

    // The canceled receive completed before Closed.
    let cancel_pos = events
        .iter()
        .position(|e| {
            matches!(e, Event::OpComplete { token: 30, status: Status::Canceled })
        })
        .expect("canceled receive completion");
    let closed_pos = events
        .iter()
        .position(|e| matches!(e, Event::Closed { .. }))
        .unwrap();
    assert!(cancel_pos < closed_pos);
    assert_eq!(client.num_connections(), 0);
}

#[test]
fn test_peer_drop_latches_error() {
    let (client, mut server, _client_conn, server_conn) = established_pair();

    let mut rx: Box<[u8]> = vec![0u8; 64].into_boxed_slice();
    let rx_region = region_of(&mut rx);
    assert!(server.recv_data(server_conn, rx_region, 1, 40));

    // Dropping the whole client context closes its sockets.
    drop(client);

    let mut saw_error = false;
    let mut saw_completion = false;
    for _ in 0..100_000 {
        server.progress();
        while let Some(ev) = server.poll_event() {
            match ev {
                Event::ConnError { conn, status } => {
                    assert_eq!(conn, server_conn);
                    assert!(!status.is_ok());
                    saw_error = true;
                }
                Event::OpComplete { token: 40, status } => {
                    assert!(!status.is_ok());
                    saw_completion = true;
                }
                _ => {}
            }
        }
        if saw_error && saw_completion {
            break;
        }
        std::thread::sleep(Duration::from_micros(50));
    }
    assert!(saw_error && saw_completion);

    let conn = server.conn(server_conn).unwrap();
    assert!(!conn.status().is_ok());

    // Late posts fail synchronously with the latched status.
    let mut late: Box<[u8]> = vec![0u8; 16].into_boxed_slice();
    let late_region = region_of(&mut late);
    assert!(!server.send_data(server_conn, late_region, 2, 41));
}

#[test]
fn test_handshake_timeout() {
    // A raw listener that never runs a context: the kernel accepts the
    // stream but no hello ever comes back.
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let mut client: Ctx = Context::new(Config {
        iomsg_size: 64,
        connect_timeout: Some(Duration::from_millis(100)),
        rndv_thresh: None,
    });
    let conn = client.connect(addr).unwrap();

    let mut status = None;
    for _ in 0..100_000 {
        client.progress();
        while let Some(ev) = client.poll_event() {
            if let Event::ConnectResult { conn: c, status: st } = ev {
                assert_eq!(c, conn);
                status = Some(st);
            }
        }
        if status.is_some() {
            break;
        }
        std::thread::sleep(Duration::from_micros(200));
    }
    assert_eq!(status, Some(Status::TimedOut));
}
