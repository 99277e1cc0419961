//! End-to-end scenarios driven over a real loopback `TcpListener`, exercising
//! login gating, GPS validation/dedup, CRC resync, and downlink correlation
//! the way an actual GT06 terminal would.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use gt06_ingest::codec::{crc16, FrameCodec, OP_LOGIN};
use gt06_ingest::config::Settings;
use gt06_ingest::contracts::{
    Contracts, CountingBroadcaster, InMemoryPersistence, NoopNotifier, StaticDeviceRegistry,
    SystemClock,
};
use gt06_ingest::downlink::{Command, DownlinkController};
use gt06_ingest::metrics::Metrics;
use gt06_ingest::pipeline::IngestPipeline;
use gt06_ingest::registry::ConnectionRegistry;
use gt06_ingest::session;

const IMEI: &str = "0351091334802439";

fn bcd(n: u8) -> u8 {
    ((n / 10) << 4) | (n % 10)
}

fn login_frame(serial: u16) -> Vec<u8> {
    let payload = [0x03, 0x51, 0x09, 0x13, 0x34, 0x80, 0x24, 0x39];
    build_frame(OP_LOGIN, &payload, serial)
}

fn build_frame(opcode: u8, payload: &[u8], serial: u16) -> Vec<u8> {
    let length = (1 + payload.len() + 2 + 2) as u8;
    let mut body = vec![length, opcode];
    body.extend_from_slice(payload);
    body.extend_from_slice(&serial.to_be_bytes());
    let crc = crc16(&body);
    let mut frame = vec![0x78, 0x78];
    frame.extend_from_slice(&body);
    frame.extend_from_slice(&crc.to_be_bytes());
    frame.extend_from_slice(&[0x0D, 0x0A]);
    frame
}

fn gps_lbs_status_frame(serial: u16, lat: f64, lng: f64, speed: u8, satellites: u8) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&[bcd(24), bcd(1), bcd(15), bcd(10), bcd(30), bcd(0)]);
    payload.push(0x07 & 0x0F | (satellites << 4)); // nibble-packed length/satellites, low bits = sat count
    payload[6] = satellites; // keep satellites directly readable by the decoder's low-nibble mask
    payload.extend_from_slice(&((lat * 1_800_000.0) as u32).to_be_bytes());
    payload.extend_from_slice(&((lng * 1_800_000.0) as u32).to_be_bytes());
    payload.push(speed);
    payload.extend_from_slice(&(0x1000u16 | 90).to_be_bytes()); // real-time + positioned bits set, course=90
    payload.extend_from_slice(&[0x02, 0x58]); // mcc
    payload.push(1); // mnc
    payload.extend_from_slice(&[0x00, 0x2A]); // lac
    payload.extend_from_slice(&[0x00, 0x00, 0x99]); // cell id
    payload.extend_from_slice(&[0b0000_0010, 4, 3, 0, 0]); // status tail: ignition on
    build_frame(0x16, &payload, serial)
}

struct Harness {
    addr: std::net::SocketAddr,
    pipeline: Arc<IngestPipeline>,
    contracts: Contracts,
    _shutdown_tx: watch::Sender<bool>,
}

async fn spawn_server() -> Harness {
    let registry = Arc::new(ConnectionRegistry::new());
    let metrics = Arc::new(Metrics::new());
    let device_registry = Arc::new(StaticDeviceRegistry::new([IMEI.to_string()]));
    let contracts = Contracts {
        registry: device_registry,
        persistence: Arc::new(InMemoryPersistence::new()),
        broadcaster: Arc::new(CountingBroadcaster::default()),
        notifier: Arc::new(NoopNotifier::default()),
        clock: Arc::new(SystemClock),
    };
    let settings = Settings {
        region_validation_enabled: true,
        region_lat_min: 25.0,
        region_lat_max: 31.5,
        region_lng_min: 79.0,
        region_lng_max: 89.5,
        read_timeout: Duration::from_secs(5),
        ..Settings::default()
    };
    let pipeline = Arc::new(IngestPipeline::new(contracts.clone(), metrics.clone(), settings.clone()));
    let settings = Arc::new(settings);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (shutdown_tx, _shutdown_rx) = watch::channel(false);

    let accept_registry = registry.clone();
    let accept_contracts = contracts.clone();
    let accept_pipeline = pipeline.clone();
    let accept_metrics = metrics.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, remote)) = listener.accept().await else { return };
            let registry = accept_registry.clone();
            let contracts = accept_contracts.clone();
            let pipeline = accept_pipeline.clone();
            let settings = settings.clone();
            let metrics = accept_metrics.clone();
            tokio::spawn(async move {
                session::handle_connection(stream, remote, registry, contracts, pipeline, settings, metrics).await;
            });
        }
    });

    Harness { addr, pipeline, contracts, _shutdown_tx: shutdown_tx }
}

async fn read_reply(stream: &mut TcpStream) -> Vec<u8> {
    let mut buf = vec![0u8; 256];
    let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
        .await
        .expect("reply timed out")
        .expect("read failed");
    buf.truncate(n);
    buf
}

#[tokio::test]
async fn s1_login_accept_authorizes_session() {
    let harness = spawn_server().await;
    let mut stream = TcpStream::connect(harness.addr).await.unwrap();
    stream.write_all(&login_frame(1)).await.unwrap();

    let reply = read_reply(&mut stream).await;
    let (serial, opcode) = FrameCodec::parse_response(&reply).unwrap();
    assert_eq!(serial, 1);
    assert_eq!(opcode, OP_LOGIN);
}

#[tokio::test]
async fn s2_login_reject_closes_without_reply() {
    let registry = Arc::new(ConnectionRegistry::new());
    let metrics = Arc::new(Metrics::new());
    // Empty allow-list: the terminal id from login_frame() is never registered.
    let device_registry = Arc::new(StaticDeviceRegistry::new(Vec::<String>::new()));
    let contracts = Contracts {
        registry: device_registry,
        persistence: Arc::new(InMemoryPersistence::new()),
        broadcaster: Arc::new(CountingBroadcaster::default()),
        notifier: Arc::new(NoopNotifier::default()),
        clock: Arc::new(SystemClock),
    };
    let settings = Arc::new(Settings::default());
    let pipeline = Arc::new(IngestPipeline::new(contracts.clone(), metrics.clone(), (*settings).clone()));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, remote) = listener.accept().await.unwrap();
        session::handle_connection(stream, remote, registry, contracts, pipeline, settings, metrics).await;
    });

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(&login_frame(1)).await.unwrap();

    let mut buf = [0u8; 16];
    let result = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf)).await;
    match result {
        Ok(Ok(0)) => {} // connection closed, as expected
        Ok(Ok(n)) => panic!("expected no reply, got {n} bytes"),
        Ok(Err(_)) => {} // reset also acceptable
        Err(_) => panic!("server never closed the unauthorized session"),
    }
}

#[tokio::test]
async fn s3_gps_happy_path_persists_and_broadcasts() {
    let harness = spawn_server().await;
    let mut stream = TcpStream::connect(harness.addr).await.unwrap();
    stream.write_all(&login_frame(1)).await.unwrap();
    read_reply(&mut stream).await;

    stream
        .write_all(&gps_lbs_status_frame(2, 27.7172, 85.3240, 25, 7))
        .await
        .unwrap();
    let reply = read_reply(&mut stream).await;
    let (serial, _) = FrameCodec::parse_response(&reply).unwrap();
    assert_eq!(serial, 2);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let record = harness.contracts.persistence.latest_for(IMEI).await.unwrap();
    assert!(record.is_some(), "gps record should have persisted");
}

#[tokio::test]
async fn s4_duplicate_within_radius_is_dropped() {
    let harness = spawn_server().await;
    let mut stream = TcpStream::connect(harness.addr).await.unwrap();
    stream.write_all(&login_frame(1)).await.unwrap();
    read_reply(&mut stream).await;

    stream.write_all(&gps_lbs_status_frame(2, 27.7172, 85.3240, 25, 7)).await.unwrap();
    read_reply(&mut stream).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let first = harness.contracts.persistence.latest_for(IMEI).await.unwrap().unwrap();

    // Same coordinates again: duplicate-radius filter should drop this one.
    stream.write_all(&gps_lbs_status_frame(3, 27.7172, 85.3240, 25, 7)).await.unwrap();
    read_reply(&mut stream).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = harness.contracts.persistence.latest_for(IMEI).await.unwrap().unwrap();

    assert_eq!(first.sequence, second.sequence, "duplicate should not advance the sequence");
}

#[tokio::test]
async fn s5_out_of_region_coordinates_are_rejected() {
    let harness = spawn_server().await;
    let mut stream = TcpStream::connect(harness.addr).await.unwrap();
    stream.write_all(&login_frame(1)).await.unwrap();
    read_reply(&mut stream).await;

    // 0,0 falls well outside the configured geo-fence.
    stream.write_all(&gps_lbs_status_frame(2, 0.0, 0.0, 10, 7)).await.unwrap();
    read_reply(&mut stream).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let record = harness.contracts.persistence.latest_for(IMEI).await.unwrap();
    assert!(record.is_none(), "out-of-region gps must not persist");
}

#[tokio::test]
async fn s6_crc_corruption_does_not_wedge_the_stream() {
    let harness = spawn_server().await;
    let mut stream = TcpStream::connect(harness.addr).await.unwrap();
    stream.write_all(&login_frame(1)).await.unwrap();
    read_reply(&mut stream).await;

    let mut corrupt = gps_lbs_status_frame(2, 27.7172, 85.3240, 25, 7);
    let flip_idx = corrupt.len() / 2;
    corrupt[flip_idx] ^= 0xFF;

    let mut good = corrupt.clone();
    good.copy_from_slice(&gps_lbs_status_frame(3, 27.8, 85.4, 30, 7));

    let mut combined = corrupt;
    combined.extend_from_slice(&good);
    stream.write_all(&combined).await.unwrap();

    // Only the well-formed frame should produce a reply.
    let reply = read_reply(&mut stream).await;
    let (serial, _) = FrameCodec::parse_response(&reply).unwrap();
    assert_eq!(serial, 3);
}

#[tokio::test]
async fn s7_downlink_command_correlates_while_status_flows() {
    let registry = Arc::new(ConnectionRegistry::new());
    let metrics = Arc::new(Metrics::new());
    let device_registry = Arc::new(StaticDeviceRegistry::new([IMEI.to_string()]));
    let contracts = Contracts {
        registry: device_registry,
        persistence: Arc::new(InMemoryPersistence::new()),
        broadcaster: Arc::new(CountingBroadcaster::default()),
        notifier: Arc::new(NoopNotifier::default()),
        clock: Arc::new(SystemClock),
    };
    let settings = Settings { downlink_timeout: Duration::from_secs(2), ..Settings::default() };
    let pipeline = Arc::new(IngestPipeline::new(contracts.clone(), metrics.clone(), settings.clone()));
    let settings = Arc::new(settings);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accept_registry = registry.clone();
    tokio::spawn(async move {
        let (stream, remote) = listener.accept().await.unwrap();
        session::handle_connection(stream, remote, accept_registry, contracts, pipeline, settings, metrics.clone())
            .await;
    });

    let mut device = TcpStream::connect(addr).await.unwrap();
    device.write_all(&login_frame(1)).await.unwrap();
    read_reply(&mut device).await;

    // Give the session a moment to register the IMEI before the controller looks it up.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let downlink_metrics = Arc::new(Metrics::new());
    let controller = DownlinkController::new(registry.clone(), downlink_metrics, Duration::from_secs(2));

    let device_side = tokio::spawn(async move {
        // Act like the terminal: read the command frame and answer it.
        let mut buf = vec![0u8; 256];
        let n = device.read(&mut buf).await.unwrap();
        let (serial, opcode, _payload) = FrameCodec::parse_frame(&buf[..n]).unwrap();
        let reply = FrameCodec::build_frame(serial, opcode, b"OK:cut");
        device.write_all(&reply).await.unwrap();

        // Status traffic on the same socket should still flow independently.
        device.write_all(&gps_lbs_status_frame(10, 27.7172, 85.3240, 0, 7)).await.unwrap();
        let mut ack = vec![0u8; 256];
        let n = device.read(&mut ack).await.unwrap();
        assert!(n > 0);
    });

    let reply = controller.send(IMEI, Command::CutOil).await.unwrap();
    assert!(reply.success);
    assert_eq!(reply.message, "cut");

    device_side.await.unwrap();
}
