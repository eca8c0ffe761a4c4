//! Drives a real [`HostForwarder`] against a scripted device peer on
//! loopback sockets.

use std::time::Duration;

use tether_forward::wire::{self, Frame};
use tether_forward::{Forward, HostForwarder};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

async fn read_exact_timed(stream: &mut TcpStream, buf: &mut [u8]) {
    timeout(TEST_TIMEOUT, stream.read_exact(buf))
        .await
        .expect("read timed out")
        .expect("read failed");
}

/// Grab a loopback port that nothing is listening on.
async fn refused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn completes_announced_tunnels_and_spools_bytes() {
    let target_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target_port = target_listener.local_addr().unwrap().port();

    // Stands in for the transport-published rendezvous port on the host.
    let rendezvous_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let device_port = rendezvous_listener.local_addr().unwrap().port();

    let command_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let command_addr = command_listener.local_addr().unwrap();

    let host = HostForwarder::start_at(
        command_addr,
        vec![Forward::new("127.0.0.1", target_port, device_port)],
    )
    .await
    .unwrap();

    // Both accepts race into one channel so the arrival order is
    // observable: the target leg must be dialed before the rendezvous leg.
    let (accept_tx, mut accept_rx) = mpsc::channel(2);
    let target_accept = accept_tx.clone();
    tokio::spawn(async move {
        let (stream, _) = target_listener.accept().await.unwrap();
        target_accept.send(("target", stream)).await.unwrap();
    });
    tokio::spawn(async move {
        let (stream, _) = rendezvous_listener.accept().await.unwrap();
        accept_tx.send(("rendezvous", stream)).await.unwrap();
    });

    let (mut command, _) = timeout(TEST_TIMEOUT, command_listener.accept())
        .await
        .unwrap()
        .unwrap();
    command.write_all(&Frame::Hello.encode()).await.unwrap();
    command
        .write_all(
            &Frame::OpenChannel {
                source_port: device_port,
                tunnel_id: 9,
            }
            .encode(),
        )
        .await
        .unwrap();

    let (first, mut target) = timeout(TEST_TIMEOUT, accept_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first, "target");
    let (second, mut rendezvous) = timeout(TEST_TIMEOUT, accept_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second, "rendezvous");

    // The ack preamble is the first thing on the rendezvous leg, and it
    // names the announced tunnel.
    let mut preamble = [0u8; wire::ACK_LEN];
    read_exact_timed(&mut rendezvous, &mut preamble).await;
    assert_eq!(preamble, wire::encode_ack(9));

    // Device-to-target direction.
    rendezvous.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
    let mut request = [0u8; 18];
    read_exact_timed(&mut target, &mut request).await;
    assert_eq!(&request, b"GET / HTTP/1.0\r\n\r\n");

    // Target-to-device direction; the preamble must not leak into it.
    target.write_all(b"HTTP/1.0 200 OK\r\n\r\n").await.unwrap();
    let mut response = [0u8; 19];
    read_exact_timed(&mut rendezvous, &mut response).await;
    assert_eq!(&response, b"HTTP/1.0 200 OK\r\n\r\n");

    // Dropping one leg ends the tunnel on the other.
    drop(rendezvous);
    let mut buf = [0u8; 1];
    let n = timeout(TEST_TIMEOUT, target.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);

    host.dispose().await.unwrap();
}

#[tokio::test]
async fn reports_failed_opens_and_keeps_serving() {
    let dead_port = refused_port().await;
    let command_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let command_addr = command_listener.local_addr().unwrap();

    let host = HostForwarder::start_at(
        command_addr,
        vec![Forward::new("127.0.0.1", dead_port, 15037)],
    )
    .await
    .unwrap();

    let (mut command, _) = timeout(TEST_TIMEOUT, command_listener.accept())
        .await
        .unwrap()
        .unwrap();

    // The target refuses the connection, so the open must fail.
    command
        .write_all(
            &Frame::OpenChannel {
                source_port: 15037,
                tunnel_id: 5,
            }
            .encode(),
        )
        .await
        .unwrap();
    let mut reply = [0u8; 5];
    read_exact_timed(&mut command, &mut reply).await;
    assert_eq!(reply, Frame::OpenChannelFail { tunnel_id: 5 }.encode()[..]);

    // A device port nobody registered fails the same way.
    command
        .write_all(
            &Frame::OpenChannel {
                source_port: 1,
                tunnel_id: 6,
            }
            .encode(),
        )
        .await
        .unwrap();
    read_exact_timed(&mut command, &mut reply).await;
    assert_eq!(reply, Frame::OpenChannelFail { tunnel_id: 6 }.encode()[..]);

    // So does a port field that does not fit in 16 bits; the malformed
    // frame must not cost the command connection.
    command
        .write_all(
            &Frame::OpenChannelInvalid {
                source_port: 0x0001_0000,
                tunnel_id: 7,
            }
            .encode(),
        )
        .await
        .unwrap();
    read_exact_timed(&mut command, &mut reply).await;
    assert_eq!(reply, Frame::OpenChannelFail { tunnel_id: 7 }.encode()[..]);

    // The forwarder survived all three failures.
    command
        .write_all(&Frame::Unrecognized { opcode: 0x66 }.encode())
        .await
        .unwrap();
    let mut unknown = [0u8; 2];
    read_exact_timed(&mut command, &mut unknown).await;
    assert_eq!(unknown, [wire::CMD_UNKNOWN, 0x66]);

    host.dispose().await.unwrap();
}

#[tokio::test]
async fn rejects_duplicate_device_ports_up_front() {
    let result = HostForwarder::start_at(
        "127.0.0.1:1".parse().unwrap(),
        vec![
            Forward::new("127.0.0.1", 80, 15037),
            Forward::new("127.0.0.1", 81, 15037),
        ],
    )
    .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn dispose_surfaces_a_lost_command_connection() {
    let command_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let command_addr = command_listener.local_addr().unwrap();

    let host = HostForwarder::start_at(command_addr, Vec::new()).await.unwrap();
    let (command, _) = timeout(TEST_TIMEOUT, command_listener.accept())
        .await
        .unwrap()
        .unwrap();
    drop(command);

    // Give the reactor a moment to observe the EOF.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(matches!(
        host.dispose().await,
        Err(tether_forward::ForwardError::CommandConnectionClosed)
    ));
}
