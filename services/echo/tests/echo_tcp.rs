//! The echo server over real sockets.

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::sync::atomic::Ordering;
use std::time::Duration;

use mtnet_dispatch::{HostSupervisor, SupervisorConfig};
use mtnet_echo::EchoFactory;
use mtnet_transport::{TcpNetwork, TcpNetworkConfig};

fn config() -> SupervisorConfig {
    SupervisorConfig {
        poll_timeout: Duration::from_millis(5),
        ..SupervisorConfig::default()
    }
}

fn read_line(reader: &mut BufReader<TcpStream>) -> String {
    let mut line = String::new();
    reader.read_line(&mut line).unwrap();
    line
}

#[test]
fn test_two_clients_get_their_own_echoes() {
    let net = TcpNetwork::bind(TcpNetworkConfig::listen("127.0.0.1:0".parse().unwrap())).unwrap();
    let addr = net.local_addr().unwrap();
    let factory = EchoFactory::new();
    let stats = factory.stats();

    let mut supervisor = HostSupervisor::new(net, factory, config());
    supervisor.launch().unwrap();

    let mut clients: Vec<_> = (0..2)
        .map(|_| {
            let stream = TcpStream::connect(addr).unwrap();
            stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            stream
        })
        .collect();

    for (i, client) in clients.iter_mut().enumerate() {
        writeln!(client, "hello from {i}").unwrap();
        writeln!(client, "bye from {i}").unwrap();
    }

    for (i, client) in clients.into_iter().enumerate() {
        let mut reader = BufReader::new(client);
        assert_eq!(read_line(&mut reader), format!("hello from {i}\n"));
        assert_eq!(read_line(&mut reader), format!("bye from {i}\n"));
    }

    supervisor.shutdown().unwrap();
    assert_eq!(stats.connections.load(Ordering::Relaxed), 2);
    assert_eq!(stats.packets_echoed.load(Ordering::Relaxed), 4);
}

#[test]
fn test_client_disconnect_joins_its_actor() {
    let net = TcpNetwork::bind(TcpNetworkConfig::listen("127.0.0.1:0".parse().unwrap())).unwrap();
    let addr = net.local_addr().unwrap();
    let mut supervisor = HostSupervisor::new(net, EchoFactory::new(), config());
    supervisor.launch().unwrap();

    let client = TcpStream::connect(addr).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut writer = client.try_clone().unwrap();
    writer.write_all(b"ping\n").unwrap();

    let mut reader = BufReader::new(client);
    assert_eq!(read_line(&mut reader), "ping\n");
    drop(writer);
    drop(reader);

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while supervisor.connection_count() > 0 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(supervisor.connection_count(), 0);
    assert_eq!(supervisor.stats().connections_closed.load(Ordering::Relaxed), 1);

    supervisor.shutdown().unwrap();
}
