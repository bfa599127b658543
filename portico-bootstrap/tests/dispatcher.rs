use std::io::{ErrorKind, Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};
use rstest::rstest;
use serde_json::{json, Value};

use portico_bootstrap::{
    ComponentRegistry, Dispatcher, ListenerDefinition, ManualTopology, ServerConfig,
    TopologyHandle,
};
use portico_core::{Context, Handler, Packet, Result};

const DEADLINE: Duration = Duration::from_secs(5);

struct EchoHandler;

impl Handler for EchoHandler {
    fn name(&self) -> &str {
        "EchoHandler"
    }

    fn handle_read(&mut self, ctx: &Context, packet: &Packet) -> Result<()> {
        ctx.write(packet.clone());
        Ok(())
    }
}

struct WhoAmIHandler;

impl Handler for WhoAmIHandler {
    fn name(&self) -> &str {
        "WhoAmIHandler"
    }

    fn handle_read(&mut self, ctx: &Context, packet: &Packet) -> Result<()> {
        ctx.write(packet.with_payload(ctx.connection_id()));
        Ok(())
    }
}

fn registry() -> ComponentRegistry {
    let mut registry = ComponentRegistry::new();
    registry
        .register_handler("echo", |_: Value, _: &Context| {
            Ok(Box::new(EchoHandler) as Box<dyn Handler>)
        })
        .register_handler("whoami", |_: Value, _: &Context| {
            Ok(Box::new(WhoAmIHandler) as Box<dyn Handler>)
        });
    registry
}

fn echo_listener(id: &str) -> ListenerDefinition {
    ListenerDefinition::new(id, 0).with_handler("echo", Value::Null)
}

fn definition(value: Value) -> ListenerDefinition {
    serde_json::from_value(value).unwrap()
}

struct Server {
    dispatcher: Dispatcher,
    topology: TopologyHandle,
}

impl Server {
    fn start(definitions: Vec<ListenerDefinition>) -> Self {
        Self::start_with(ServerConfig::new(), definitions)
    }

    fn start_with(config: ServerConfig, definitions: Vec<ListenerDefinition>) -> Self {
        let (source, topology) = ManualTopology::new();
        for definition in definitions {
            assert!(topology.add(definition));
        }
        let config = config
            .bind_host(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .poll_timeout(Duration::from_millis(5));
        let mut dispatcher = Dispatcher::new(config, registry(), source).unwrap();
        dispatcher.run_once().unwrap();
        Self {
            dispatcher,
            topology,
        }
    }

    fn addr(&self, id: &str) -> SocketAddr {
        self.dispatcher.local_addr(id).unwrap()
    }

    fn connect(&mut self, id: &str) -> Client {
        let stream = TcpStream::connect(self.addr(id)).unwrap();
        stream.set_nonblocking(true).unwrap();
        let accepted = self.dispatcher.connection_count() + 1;
        let deadline = Instant::now() + DEADLINE;
        while self.dispatcher.connection_count() < accepted {
            assert!(Instant::now() < deadline, "connection was never accepted");
            self.dispatcher.run_once().unwrap();
        }
        Client {
            stream,
            received: Vec::new(),
            eof: false,
        }
    }

    fn pump(&mut self, client: &mut Client, done: impl Fn(&Client) -> bool) {
        let deadline = Instant::now() + DEADLINE;
        while !done(client) {
            assert!(
                Instant::now() < deadline,
                "gave up waiting, received {:?}",
                String::from_utf8_lossy(&client.received)
            );
            self.dispatcher.run_once().unwrap();
            client.poll();
        }
    }

    fn pump_text(&mut self, client: &mut Client, expected: &str) {
        self.pump(client, |c| c.received.len() >= expected.len());
        assert_eq!(client.text(), expected);
    }
}

struct Client {
    stream: TcpStream,
    received: Vec<u8>,
    eof: bool,
}

impl Client {
    fn send(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).unwrap();
    }

    fn poll(&mut self) {
        let mut buf = [0u8; 4096];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => {
                    self.eof = true;
                    return;
                }
                Ok(n) => self.received.extend_from_slice(&buf[..n]),
                Err(err) if err.kind() == ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == ErrorKind::ConnectionReset => {
                    self.eof = true;
                    return;
                }
                Err(err) => panic!("client read failed: {}", err),
            }
        }
    }

    fn text(&self) -> String {
        String::from_utf8_lossy(&self.received).into_owned()
    }
}

#[test]
fn echoes_lines_across_chunks() {
    let mut server = Server::start(vec![echo_listener("echo")]);
    let mut client = server.connect("echo");

    client.send(b"hello\nwor");
    server.pump_text(&mut client, "hello\n");

    client.send(b"ld\n");
    server.pump_text(&mut client, "hello\nworld\n");
    assert_eq!(server.dispatcher.connection_count(), 1);
}

#[test]
fn token_auth_renames_connection() {
    let mut server = Server::start(vec![definition(json!({
        "id": "auth",
        "port": 0,
        "inspector": {"type": "token_auth", "secret": "s3cret"},
        "handlers": [{"type": "whoami"}]
    }))]);
    let mut client = server.connect("auth");
    let peer = client.stream.local_addr().unwrap();

    client.send(b"alice:s3cret\nping\n");
    server.pump_text(&mut client, &format!("alice@{}\n", peer));
}

#[rstest]
#[case::wrong_secret(b"mallory:guess\nping\n".as_slice())]
#[case::missing_user(b":s3cret\nping\n".as_slice())]
fn token_auth_failure_closes_silently(#[case] greeting: &[u8]) {
    let mut server = Server::start(vec![definition(json!({
        "id": "auth",
        "port": 0,
        "inspector": {"type": "token_auth", "secret": "s3cret"},
        "handlers": [{"type": "echo"}]
    }))]);
    let mut client = server.connect("auth");

    client.send(greeting);
    server.pump(&mut client, |c| c.eof);
    assert!(client.received.is_empty());
    assert_eq!(server.dispatcher.connection_count(), 0);
}

#[test]
fn json_records_survive_malformed_neighbours() {
    let mut server = Server::start(vec![definition(json!({
        "id": "json",
        "port": 0,
        "codec": {"type": "json"},
        "handlers": [{"type": "echo"}]
    }))]);
    let mut client = server.connect("json");

    client.send(b"{\"a\":1}\nnot json\n\n{\"b\":[true]}\n");
    server.pump_text(&mut client, "{\"a\":1}\n{\"b\":[true]}\n");
}

fn deflate(bytes: &[u8]) -> Vec<u8> {
    let mut compress = Compress::new(Compression::default(), false);
    let mut out = Vec::with_capacity(bytes.len() + 64);
    compress
        .compress_vec(bytes, &mut out, FlushCompress::Sync)
        .unwrap();
    out
}

fn inflate(bytes: &[u8]) -> Vec<u8> {
    let mut decompress = Decompress::new(false);
    let mut out = Vec::with_capacity(4096);
    decompress
        .decompress_vec(bytes, &mut out, FlushDecompress::Sync)
        .unwrap();
    out
}

#[test]
fn deflate_round_trip_over_the_wire() {
    let mut server = Server::start(vec![definition(json!({
        "id": "zip",
        "port": 0,
        "codec": {"type": "deflate", "inner": {"type": "line"}},
        "handlers": [{"type": "echo"}]
    }))]);
    let mut client = server.connect("zip");

    client.send(&deflate(b"compressed hello\n"));
    server.pump(&mut client, |c| c.received.ends_with(&[0x00, 0x00, 0xff, 0xff]));
    assert_eq!(inflate(&client.received), b"compressed hello\n");
}

#[test]
fn delayed_replies_keep_order_and_wait() {
    let mut server = Server::start(vec![definition(json!({
        "id": "slow",
        "port": 0,
        "codec": {"type": "delay", "delay_ms": 50, "inner": {"type": "line"}},
        "handlers": [{"type": "echo"}]
    }))]);
    let mut client = server.connect("slow");

    let sent = Instant::now();
    client.send(b"a\nb\nc\n");
    server.pump_text(&mut client, "a\nb\nc\n");
    assert!(sent.elapsed() >= Duration::from_millis(50));
}

#[test]
fn idle_connections_are_swept() {
    let config = ServerConfig::new().sweep_interval(Duration::from_millis(10));
    let mut server = Server::start_with(
        config,
        vec![definition(json!({
            "id": "idle",
            "port": 0,
            "inspector": {"type": "idle_timeout", "timeout_ms": 50},
            "handlers": [{"type": "echo"}]
        }))],
    );
    let mut client = server.connect("idle");

    client.send(b"still here\n");
    server.pump_text(&mut client, "still here\n");

    server.pump(&mut client, |c| c.eof);
    assert_eq!(server.dispatcher.connection_count(), 0);
}

#[test]
fn failing_handler_does_not_block_the_others() {
    let mut server = Server::start(vec![ListenerDefinition::new("mixed", 0)
        .with_handler("missing", Value::Null)
        .with_handler("echo", Value::Null)]);
    let mut client = server.connect("mixed");

    client.send(b"ok\n");
    server.pump_text(&mut client, "ok\n");
}

#[test]
fn removed_listener_keeps_live_connections() {
    let mut server = Server::start(vec![echo_listener("echo")]);
    let addr = server.addr("echo");
    let mut client = server.connect("echo");
    client.send(b"before\n");
    server.pump_text(&mut client, "before\n");

    assert!(server.topology.remove("echo"));
    server.dispatcher.run_once().unwrap();
    assert!(server.dispatcher.local_addr("echo").is_none());
    assert_eq!(server.dispatcher.listener_count(), 0);
    assert!(TcpStream::connect(addr).is_err());

    client.send(b"after\n");
    server.pump_text(&mut client, "before\nafter\n");
}

#[test]
fn updates_replace_definition_but_not_binding() {
    let original = echo_listener("svc");
    let mut server = Server::start(vec![original.clone()]);
    let addr = server.addr("svc");

    server.topology.update(original.clone().with_name("renamed"));
    server.dispatcher.run_once().unwrap();
    assert_eq!(server.addr("svc"), addr);
    assert_eq!(server.dispatcher.listener_definition("svc").unwrap().name, "renamed");

    server.topology.update(ListenerDefinition::new("svc", 1).with_name("moved"));
    server.dispatcher.run_once().unwrap();
    let live = server.dispatcher.listener_definition("svc").unwrap();
    assert_eq!(live.name, "renamed");
    assert_eq!(live.port, 0);
    assert_eq!(server.addr("svc"), addr);

    server.topology.add(original.clone().with_name("again"));
    server.dispatcher.run_once().unwrap();
    assert_eq!(server.dispatcher.listener_count(), 1);
    assert_eq!(server.dispatcher.listener_definition("svc").unwrap().name, "again");

    server.topology.update(ListenerDefinition::new("ghost", 0));
    server.dispatcher.run_once().unwrap();
    assert!(server.dispatcher.local_addr("ghost").is_none());
}

#[test]
fn updated_handlers_apply_to_new_connections_only() {
    let mut server = Server::start(vec![echo_listener("svc")]);
    let mut old = server.connect("svc");

    server
        .topology
        .update(ListenerDefinition::new("svc", 0).with_handler("whoami", Value::Null));
    server.dispatcher.run_once().unwrap();
    let mut new = server.connect("svc");
    let new_peer = new.stream.local_addr().unwrap();

    old.send(b"x\n");
    server.pump_text(&mut old, "x\n");
    new.send(b"x\n");
    server.pump_text(&mut new, &format!("{}\n", new_peer));
}

#[test]
fn shutdown_closes_everything() {
    let mut server = Server::start(vec![echo_listener("echo")]);
    let mut client = server.connect("echo");
    client.send(b"hi\n");
    server.pump_text(&mut client, "hi\n");

    server.dispatcher.shutdown();
    assert_eq!(server.dispatcher.connection_count(), 0);
    assert_eq!(server.dispatcher.listener_count(), 0);

    let deadline = Instant::now() + DEADLINE;
    while !client.eof {
        assert!(Instant::now() < deadline);
        client.poll();
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn run_returns_once_stopped() {
    let (source, _topology) = ManualTopology::new();
    let config = ServerConfig::new().poll_timeout(Duration::from_millis(5));
    let mut dispatcher = Dispatcher::new(config, registry(), source).unwrap();

    let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
    stop_tx.send(()).unwrap();
    dispatcher.run(&stop_rx).unwrap();
    assert_eq!(dispatcher.listener_count(), 0);
}
