use super::{
    Client, ClientConfig, ClientError, Connect, ExceptionCode, ObjectCollection, ObjectKind,
    Range, Transport, TransportError, WriteMode, WriteModeLatch,
};
use async_trait::async_trait;
use ferrobus_core::CodecError;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

enum Script {
    Reply(Vec<u8>),
    Error(TransportError),
    Hang,
}

#[derive(Default)]
struct MockState {
    script: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<Vec<u8>>>,
    connects: AtomicUsize,
}

#[derive(Clone, Default)]
struct MockConnector {
    state: Arc<MockState>,
}

struct MockTransport {
    state: Arc<MockState>,
}

impl MockConnector {
    fn scripted(script: Vec<Script>) -> Self {
        Self {
            state: Arc::new(MockState {
                script: Mutex::new(script.into()),
                requests: Mutex::new(Vec::new()),
                connects: AtomicUsize::new(0),
            }),
        }
    }

    /// Recorded requests, each as unit id followed by the PDU.
    fn requests(&self) -> Vec<Vec<u8>> {
        self.state.requests.lock().unwrap().clone()
    }

    fn connects(&self) -> usize {
        self.state.connects.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Connect for MockConnector {
    type Transport = MockTransport;

    async fn connect(&self) -> Result<MockTransport, TransportError> {
        self.state.connects.fetch_add(1, Ordering::Relaxed);
        Ok(MockTransport {
            state: Arc::clone(&self.state),
        })
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn exchange(
        &mut self,
        unit_id: u8,
        request_pdu: &[u8],
        response_pdu: &mut [u8],
    ) -> Result<usize, TransportError> {
        let mut recorded = vec![unit_id];
        recorded.extend_from_slice(request_pdu);
        self.state.requests.lock().unwrap().push(recorded);

        let next = self.state.script.lock().unwrap().pop_front();
        match next {
            Some(Script::Reply(bytes)) => {
                response_pdu[..bytes.len()].copy_from_slice(&bytes);
                Ok(bytes.len())
            }
            Some(Script::Error(err)) => Err(err),
            Some(Script::Hang) | None => {
                std::future::pending::<Result<usize, TransportError>>().await
            }
        }
    }
}

fn range(start: u16, end: u16) -> Range {
    Range::new(start, end).unwrap()
}

fn coils(values: &[(u16, bool)]) -> ObjectCollection {
    let mut objects = ObjectCollection::new(ObjectKind::Coil);
    for (address, value) in values {
        objects.set_bit(*address, *value).unwrap();
    }
    objects
}

fn registers(values: &[(u16, u16)]) -> ObjectCollection {
    let mut objects = ObjectCollection::new(ObjectKind::HoldingRegister);
    for (address, value) in values {
        objects.set_u16(*address, *value).unwrap();
    }
    objects
}

fn device_id_reply(
    category: u8,
    conformity: u8,
    more_follows: bool,
    next_object: u8,
    objects: &[(u8, &str)],
) -> Vec<u8> {
    let mut pdu = vec![
        0x2B,
        0x0E,
        category,
        conformity,
        u8::from(more_follows),
        next_object,
        objects.len() as u8,
    ];
    for (object_id, value) in objects {
        pdu.push(*object_id);
        pdu.push(value.len() as u8);
        pdu.extend_from_slice(value.as_bytes());
    }
    pdu
}

#[test]
fn config_defaults_match_documentation() {
    let config = ClientConfig::default();
    assert_eq!(config.response_timeout, Some(Duration::from_secs(2)));
    assert_eq!(config.exception_retry_delay, Duration::from_millis(500));
    assert_eq!(config.busy_retry_delay, Duration::from_secs(1));
    assert_eq!(config.retry_count, 4);
    assert_eq!(config.idle_timeout, Some(Duration::from_secs(7)));
    assert_eq!(config.max_request_length, 0);
    assert_eq!(config.allowed_request_waste, 0);
}

#[test]
fn write_mode_latch_is_one_shot() {
    let latch = WriteModeLatch::default();
    assert_eq!(latch.mode(), WriteMode::Unknown);
    assert!(latch.try_latch(WriteMode::AlwaysSingle));
    assert_eq!(latch.mode(), WriteMode::AlwaysSingle);
    assert!(!latch.try_latch(WriteMode::AlwaysMultiple));
    assert_eq!(latch.mode(), WriteMode::AlwaysSingle);
}

#[tokio::test]
async fn read_holding_registers_collects_values() {
    let connector = MockConnector::scripted(vec![Script::Reply(vec![
        0x03, 0x06, 0x00, 0x0A, 0x00, 0x14, 0x00, 0x1E,
    ])]);
    let client = Client::new(connector.clone());

    let objects = client
        .read(ObjectKind::HoldingRegister, 1, &[range(100, 102)])
        .await
        .unwrap();

    assert_eq!(
        connector.requests(),
        vec![vec![0x01, 0x03, 0x00, 0x64, 0x00, 0x03]]
    );
    assert_eq!(objects.u16(100), Ok(10));
    assert_eq!(objects.u16(101), Ok(20));
    assert_eq!(objects.u16(102), Ok(30));
}

#[tokio::test]
async fn read_coils_unpacks_bits() {
    let connector =
        MockConnector::scripted(vec![Script::Reply(vec![0x01, 0x02, 0xCD, 0x01])]);
    let client = Client::new(connector.clone());

    let objects = client.read(ObjectKind::Coil, 1, &[range(0, 9)]).await.unwrap();

    let expected = [true, false, true, true, false, false, true, true, true, false];
    for (address, value) in expected.iter().enumerate() {
        assert_eq!(objects.bit(address as u16), Ok(*value));
    }
}

#[tokio::test]
async fn ranges_are_split_to_the_request_limit() {
    let connector = MockConnector::scripted(vec![
        Script::Reply(vec![0x03, 0x04, 0x00, 0x01, 0x00, 0x02]),
        Script::Reply(vec![0x03, 0x04, 0x00, 0x03, 0x00, 0x04]),
    ]);
    let config = ClientConfig::default().with_max_request_length(2);
    let client = Client::with_config(connector.clone(), config);

    let objects = client
        .read(ObjectKind::HoldingRegister, 1, &[range(0, 3)])
        .await
        .unwrap();

    assert_eq!(
        connector.requests(),
        vec![
            vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x02],
            vec![0x01, 0x03, 0x00, 0x02, 0x00, 0x02],
        ]
    );
    assert_eq!(objects.u16(3), Ok(4));
}

#[tokio::test]
async fn short_response_is_completed_with_followup_requests() {
    let connector = MockConnector::scripted(vec![
        Script::Reply(vec![0x03, 0x04, 0x00, 0x01, 0x00, 0x02]),
        Script::Reply(vec![0x03, 0x04, 0x00, 0x03, 0x00, 0x04]),
    ]);
    let client = Client::new(connector.clone());

    let objects = client
        .read(ObjectKind::HoldingRegister, 1, &[range(0, 3)])
        .await
        .unwrap();

    assert_eq!(
        connector.requests(),
        vec![
            vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x04],
            vec![0x01, 0x03, 0x00, 0x02, 0x00, 0x02],
        ]
    );
    assert_eq!(objects.len(), 4);
    assert_eq!(objects.u16(0), Ok(1));
    assert_eq!(objects.u16(3), Ok(4));
}

#[tokio::test(start_paused = true)]
async fn busy_responses_are_retried_after_the_delay() {
    let connector = MockConnector::scripted(vec![
        Script::Reply(vec![0x83, 0x06]),
        Script::Reply(vec![0x83, 0x06]),
        Script::Reply(vec![0x03, 0x02, 0x00, 0x2A]),
    ]);
    let config = ClientConfig::default().with_busy_retry_delay(Duration::from_millis(100));
    let client = Client::with_config(connector.clone(), config);

    let started = Instant::now();
    let objects = client
        .read(ObjectKind::HoldingRegister, 1, &[range(0, 0)])
        .await
        .unwrap();

    assert_eq!(objects.u16(0), Ok(42));
    assert_eq!(connector.requests().len(), 3);
    assert!(started.elapsed() >= Duration::from_millis(200));
}

#[tokio::test]
async fn busy_responses_exhaust_the_retry_budget() {
    let connector = MockConnector::scripted(vec![
        Script::Reply(vec![0x83, 0x06]),
        Script::Reply(vec![0x83, 0x06]),
    ]);
    let config = ClientConfig::default()
        .with_retry_count(1)
        .with_busy_retry_delay(Duration::from_millis(1));
    let client = Client::with_config(connector.clone(), config);

    let err = client
        .read(ObjectKind::HoldingRegister, 1, &[range(0, 0)])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ClientError::Exception(ExceptionCode::ServerDeviceBusy)
    ));
    assert_eq!(connector.requests().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn transport_errors_reconnect_and_retry() {
    let connector = MockConnector::scripted(vec![
        Script::Error(TransportError::ConnectionClosed),
        Script::Reply(vec![0x03, 0x02, 0x00, 0x2A]),
    ]);
    let config = ClientConfig::default().with_retry_count(1);
    let client = Client::with_config(connector.clone(), config);

    let objects = client
        .read(ObjectKind::HoldingRegister, 1, &[range(0, 0)])
        .await
        .unwrap();
    assert_eq!(objects.u16(0), Ok(42));
    assert_eq!(connector.connects(), 2);
}

#[tokio::test]
async fn non_busy_exceptions_propagate_without_retry() {
    let connector = MockConnector::scripted(vec![Script::Reply(vec![0x83, 0x02])]);
    let client = Client::new(connector.clone());

    let err = client
        .read(ObjectKind::HoldingRegister, 1, &[range(0, 0)])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ClientError::Exception(ExceptionCode::IllegalDataAddress)
    ));
    assert_eq!(connector.requests().len(), 1);
}

#[tokio::test]
async fn write_single_coil_mismatch_is_surfaced() {
    let connector =
        MockConnector::scripted(vec![Script::Reply(vec![0x05, 0x00, 0x05, 0x00, 0x00])]);
    let client = Client::new(connector.clone());

    let err = client.write(1, &coils(&[(5, true)])).await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::Protocol(CodecError::WriteMismatch)
    ));
    assert_eq!(
        connector.requests(),
        vec![vec![0x01, 0x05, 0x00, 0x05, 0xFF, 0x00]]
    );
}

#[tokio::test]
async fn rejected_single_write_switches_to_multiple() {
    let connector = MockConnector::scripted(vec![
        Script::Reply(vec![0x85, 0x01]),
        Script::Reply(vec![0x0F, 0x00, 0x05, 0x00, 0x01]),
        Script::Reply(vec![0x0F, 0x00, 0x06, 0x00, 0x01]),
    ]);
    let client = Client::new(connector.clone());

    client.write(1, &coils(&[(5, true)])).await.unwrap();
    assert_eq!(client.write_mode(), WriteMode::AlwaysMultiple);

    // The switch is remembered: later single-object writes go multiple.
    client.write(1, &coils(&[(6, false)])).await.unwrap();

    let requests = connector.requests();
    assert_eq!(requests[0], vec![0x01, 0x05, 0x00, 0x05, 0xFF, 0x00]);
    assert_eq!(
        requests[1],
        vec![0x01, 0x0F, 0x00, 0x05, 0x00, 0x01, 0x01, 0x01]
    );
    assert_eq!(
        requests[2],
        vec![0x01, 0x0F, 0x00, 0x06, 0x00, 0x01, 0x01, 0x00]
    );
}

#[tokio::test(start_paused = true)]
async fn timed_out_multiple_write_switches_to_single() {
    let connector = MockConnector::scripted(vec![
        Script::Hang,
        Script::Reply(vec![0x06, 0x00, 0x0A, 0x00, 0x2A]),
        Script::Reply(vec![0x06, 0x00, 0x0B, 0x00, 0x2B]),
    ]);
    let config = ClientConfig::default()
        .with_response_timeout(Some(Duration::from_millis(50)));
    let client = Client::with_config(connector.clone(), config);

    client
        .write(1, &registers(&[(10, 0x2A), (11, 0x2B)]))
        .await
        .unwrap();
    assert_eq!(client.write_mode(), WriteMode::AlwaysSingle);

    let requests = connector.requests();
    assert_eq!(requests.len(), 3);
    assert_eq!(requests[0][1], 0x10);
    assert_eq!(requests[1], vec![0x01, 0x06, 0x00, 0x0A, 0x00, 0x2A]);
    assert_eq!(requests[2], vec![0x01, 0x06, 0x00, 0x0B, 0x00, 0x2B]);
    // The timed-out connection was replaced.
    assert_eq!(connector.connects(), 2);
}

#[tokio::test]
async fn the_mode_switch_happens_only_once() {
    let connector = MockConnector::scripted(vec![
        Script::Reply(vec![0x85, 0x01]),
        Script::Reply(vec![0x8F, 0x01]),
    ]);
    let client = Client::new(connector.clone());

    let err = client.write(1, &coils(&[(5, true)])).await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::Exception(ExceptionCode::IllegalFunction)
    ));
    assert_eq!(client.write_mode(), WriteMode::AlwaysMultiple);
    assert_eq!(connector.requests().len(), 2);
}

#[tokio::test]
async fn partial_write_confirmation_writes_the_remainder() {
    let connector = MockConnector::scripted(vec![
        Script::Reply(vec![0x10, 0x00, 0x00, 0x00, 0x02]),
        Script::Reply(vec![0x06, 0x00, 0x02, 0x00, 0x03]),
    ]);
    let client = Client::new(connector.clone());

    client
        .write(1, &registers(&[(0, 1), (1, 2), (2, 3)]))
        .await
        .unwrap();

    let requests = connector.requests();
    assert_eq!(
        requests[0],
        vec![0x01, 0x10, 0x00, 0x00, 0x00, 0x03, 0x06, 0x00, 0x01, 0x00, 0x02, 0x00, 0x03]
    );
    assert_eq!(requests[1], vec![0x01, 0x06, 0x00, 0x02, 0x00, 0x03]);
}

#[tokio::test]
async fn unconfirmed_write_fails() {
    let connector =
        MockConnector::scripted(vec![Script::Reply(vec![0x10, 0x00, 0x00, 0x00, 0x00])]);
    let client = Client::new(connector.clone());

    let err = client
        .write(1, &registers(&[(0, 1), (1, 2)]))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ClientError::Protocol(CodecError::WriteMismatch)
    ));
}

#[tokio::test]
async fn writes_to_read_only_kinds_are_rejected() {
    let connector = MockConnector::scripted(vec![]);
    let client = Client::new(connector.clone());

    let mut objects = ObjectCollection::new(ObjectKind::InputRegister);
    objects.set_u16(0, 1).unwrap();
    let err = client.write(1, &objects).await.unwrap_err();
    assert!(matches!(err, ClientError::ReadOnlyKind(ObjectKind::InputRegister)));
    assert!(connector.requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn idle_timeout_closes_the_connection() {
    let connector = MockConnector::scripted(vec![
        Script::Reply(vec![0x03, 0x02, 0x00, 0x01]),
        Script::Reply(vec![0x03, 0x02, 0x00, 0x02]),
    ]);
    let config = ClientConfig::default().with_idle_timeout(Some(Duration::from_secs(1)));
    let client = Client::with_config(connector.clone(), config);

    client
        .read(ObjectKind::HoldingRegister, 1, &[range(0, 0)])
        .await
        .unwrap();
    assert_eq!(connector.connects(), 1);

    tokio::time::sleep(Duration::from_secs(3)).await;

    client
        .read(ObjectKind::HoldingRegister, 1, &[range(0, 0)])
        .await
        .unwrap();
    assert_eq!(connector.connects(), 2);
}

#[tokio::test]
async fn zero_idle_timeout_closes_immediately() {
    let connector = MockConnector::scripted(vec![
        Script::Reply(vec![0x03, 0x02, 0x00, 0x01]),
        Script::Reply(vec![0x03, 0x02, 0x00, 0x02]),
    ]);
    let config = ClientConfig::default().with_idle_timeout(Some(Duration::ZERO));
    let client = Client::with_config(connector.clone(), config);

    client
        .read(ObjectKind::HoldingRegister, 1, &[range(0, 0)])
        .await
        .unwrap();
    client
        .read(ObjectKind::HoldingRegister, 1, &[range(0, 0)])
        .await
        .unwrap();
    assert_eq!(connector.connects(), 2);
}

#[tokio::test(start_paused = true)]
async fn infinite_idle_timeout_keeps_the_connection() {
    let connector = MockConnector::scripted(vec![
        Script::Reply(vec![0x03, 0x02, 0x00, 0x01]),
        Script::Reply(vec![0x03, 0x02, 0x00, 0x02]),
    ]);
    let config = ClientConfig::default().with_idle_timeout(None);
    let client = Client::with_config(connector.clone(), config);

    client
        .read(ObjectKind::HoldingRegister, 1, &[range(0, 0)])
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;
    client
        .read(ObjectKind::HoldingRegister, 1, &[range(0, 0)])
        .await
        .unwrap();
    assert_eq!(connector.connects(), 1);
}

#[tokio::test]
async fn device_identification_reads_one_category() {
    let connector = MockConnector::scripted(vec![Script::Reply(device_id_reply(
        1,
        0x81,
        false,
        0,
        &[(0, "Acme"), (1, "P-42"), (2, "1.0")],
    ))]);
    let client = Client::new(connector.clone());

    let values = client.read_device_identification(1).await.unwrap();
    assert_eq!(connector.requests(), vec![vec![0x01, 0x2B, 0x0E, 0x01, 0x00]]);
    assert_eq!(values.len(), 3);
    assert_eq!(values.get(&0).map(String::as_str), Some("Acme"));
    assert_eq!(values.get(&2).map(String::as_str), Some("1.0"));
}

#[tokio::test]
async fn device_identification_walks_advertised_categories() {
    let connector = MockConnector::scripted(vec![
        Script::Reply(device_id_reply(1, 0x02, false, 0, &[(0, "Acme")])),
        Script::Reply(device_id_reply(2, 0x02, false, 0, &[(4, "Controller")])),
    ]);
    let client = Client::new(connector.clone());

    let values = client.read_device_identification(1).await.unwrap();
    assert_eq!(
        connector.requests(),
        vec![
            vec![0x01, 0x2B, 0x0E, 0x01, 0x00],
            vec![0x01, 0x2B, 0x0E, 0x02, 0x00],
        ]
    );
    assert_eq!(values.get(&4).map(String::as_str), Some("Controller"));
}

#[tokio::test]
async fn device_identification_follows_continuations() {
    let connector = MockConnector::scripted(vec![
        Script::Reply(device_id_reply(1, 0x01, true, 2, &[(0, "Acme"), (1, "P-42")])),
        Script::Reply(device_id_reply(1, 0x01, false, 0, &[(2, "1.0")])),
    ]);
    let client = Client::new(connector.clone());

    let values = client.read_device_identification(1).await.unwrap();
    assert_eq!(
        connector.requests(),
        vec![
            vec![0x01, 0x2B, 0x0E, 0x01, 0x00],
            vec![0x01, 0x2B, 0x0E, 0x01, 0x02],
        ]
    );
    assert_eq!(values.len(), 3);
}

#[tokio::test]
async fn device_identification_falls_back_on_rejected_category_start() {
    let connector = MockConnector::scripted(vec![
        Script::Reply(device_id_reply(1, 0x02, false, 0, &[(0, "Acme")])),
        Script::Reply(vec![0xAB, 0x02]),
        Script::Reply(device_id_reply(2, 0x02, false, 0, &[(3, "https://acme.example")])),
    ]);
    let client = Client::new(connector.clone());

    let values = client.read_device_identification(1).await.unwrap();
    assert_eq!(
        connector.requests(),
        vec![
            vec![0x01, 0x2B, 0x0E, 0x01, 0x00],
            vec![0x01, 0x2B, 0x0E, 0x02, 0x00],
            vec![0x01, 0x2B, 0x0E, 0x02, 0x03],
        ]
    );
    assert_eq!(
        values.get(&3).map(String::as_str),
        Some("https://acme.example")
    );
}

#[tokio::test]
async fn device_identification_detects_loops() {
    let connector = MockConnector::scripted(vec![Script::Reply(device_id_reply(
        1,
        0x01,
        true,
        0,
        &[(0, "Acme")],
    ))]);
    let client = Client::new(connector.clone());

    let err = client.read_device_identification(1).await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::Protocol(CodecError::DeviceIdentificationLoop)
    ));
}
