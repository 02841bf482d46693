//! End-to-end tests against a real TCP listener

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

use teltonika_gateway::codec::command::encode_codec12_command;
use teltonika_gateway::codec::frame::build_frame;
use teltonika_gateway::codec::protocol::{CodecId, MESSAGE_TYPE_RESPONSE};
use teltonika_gateway::config::{Config, Protocol};
use teltonika_gateway::events::GatewayEvent;
use teltonika_gateway::{Gateway, GatewayError, Imei};

const IMEI: &str = "356307042441013";
const IO_TIMEOUT: Duration = Duration::from_secs(5);

async fn start_gateway() -> (Gateway, std::net::SocketAddr) {
    let mut config = Config::default();
    config.server.protocol = Protocol::Tcp;
    config.server.host = "127.0.0.1".to_string();
    config.server.port = 0;
    config.devices.names.insert(IMEI.to_string(), "Truck 7".to_string());

    let gateway = Gateway::from_config(config);
    let listener = gateway.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = gateway.clone();
    tokio::spawn(async move { server.serve(listener).await });

    (gateway, addr)
}

async fn read_exact(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    timeout(IO_TIMEOUT, stream.read_exact(&mut buf)).await.unwrap().unwrap();
    buf
}

async fn connect(addr: std::net::SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let imei = Imei::parse(IMEI).unwrap();
    stream.write_all(&imei.to_handshake()).await.unwrap();
    assert_eq!(read_exact(&mut stream, 1).await, vec![0x01]);
    stream
}

async fn wait_online(gateway: &Gateway, online: bool) {
    let imei = Imei::parse(IMEI).unwrap();
    let wait = async {
        loop {
            let current = gateway.registry().get(&imei).map_or(false, |d| d.online);
            if current == online {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
    };
    timeout(IO_TIMEOUT, wait).await.unwrap();
}

fn avl_frame(records: u8) -> Vec<u8> {
    let mut payload = vec![CodecId::Codec8.id(), records];
    for i in 0..records {
        payload.extend_from_slice(&(1_700_000_000_000u64 + i as u64 * 1000).to_be_bytes());
        payload.push(0);
        payload.extend_from_slice(&250_000_000i32.to_be_bytes());
        payload.extend_from_slice(&549_000_000i32.to_be_bytes());
        payload.extend_from_slice(&[0, 120, 0, 45, 9, 0, 60]);
        // event id, total, then one 1-byte element and empty 2/4/8-byte groups
        payload.extend_from_slice(&[0, 1, 1, 0xEF, 1, 0, 0, 0]);
    }
    payload.push(records);
    build_frame(&payload)
}

fn command_response(text: &str) -> Vec<u8> {
    let mut payload = vec![CodecId::Codec12.id(), 1, MESSAGE_TYPE_RESPONSE];
    payload.extend_from_slice(&(text.len() as u32).to_be_bytes());
    payload.extend_from_slice(text.as_bytes());
    payload.push(1);
    build_frame(&payload)
}

#[tokio::test]
async fn test_device_session_over_tcp() {
    let (gateway, addr) = start_gateway().await;
    let mut events = gateway.events().subscribe();
    let imei = Imei::parse(IMEI).unwrap();

    let mut device = connect(addr).await;
    wait_online(&gateway, true).await;

    let devices = gateway.devices();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].name.as_deref(), Some("Truck 7"));

    // Telemetry is acknowledged with the record count
    device.write_all(&avl_frame(3)).await.unwrap();
    assert_eq!(read_exact(&mut device, 4).await, vec![0, 0, 0, 3]);

    let packet = timeout(IO_TIMEOUT, async {
        loop {
            if let Ok(GatewayEvent::Packet { packet, .. }) = events.recv().await {
                return packet;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(packet.record_count(), Some(3));

    // Command round trip
    let operator = gateway.clone();
    let pending = tokio::spawn(async move { operator.send_command(&imei, "getinfo").await });

    let expected = encode_codec12_command("getinfo");
    assert_eq!(read_exact(&mut device, expected.len()).await, expected);
    device.write_all(&command_response("RTC:2024/1/1 0:00")).await.unwrap();

    let response = timeout(IO_TIMEOUT, pending).await.unwrap().unwrap().unwrap();
    assert_eq!(response.text, "RTC:2024/1/1 0:00");

    // Kick closes the socket from the gateway side
    gateway.kick(&imei).unwrap();
    let mut buf = [0u8; 1];
    let read = timeout(IO_TIMEOUT, device.read(&mut buf)).await.unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));
    wait_online(&gateway, false).await;

    assert!(matches!(
        gateway.send_command(&imei, "getinfo").await,
        Err(GatewayError::DeviceNotConnected(_))
    ));
}

#[tokio::test]
async fn test_split_writes_are_reassembled() {
    let (_gateway, addr) = start_gateway().await;
    let mut device = connect(addr).await;

    let frame = avl_frame(1);
    let (head, tail) = frame.split_at(7);
    device.write_all(head).await.unwrap();
    device.flush().await.unwrap();
    sleep(Duration::from_millis(20)).await;
    device.write_all(tail).await.unwrap();

    assert_eq!(read_exact(&mut device, 4).await, vec![0, 0, 0, 1]);
}

#[tokio::test]
async fn test_rejected_handshake_closes_connection() {
    let (gateway, addr) = start_gateway().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let mut bad = vec![0x00, 0x0F];
    bad.extend_from_slice(b"35630704244101X");
    stream.write_all(&bad).await.unwrap();

    assert_eq!(read_exact(&mut stream, 1).await, vec![0x00]);
    let mut buf = [0u8; 1];
    let read = timeout(IO_TIMEOUT, stream.read(&mut buf)).await.unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));
    assert!(gateway.devices().is_empty());
}
