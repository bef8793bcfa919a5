//! High-level Modbus client.
//!
//! [`Client`] owns a lazily opened connection behind a fair lock, plans
//! requested address ranges into protocol-legal requests, and runs each
//! exchange through a timeout-and-retry pipeline that adapts to the
//! protocol deviations common in field devices: busy devices are waited
//! out, devices that ignore one family of write function codes are
//! switched to the other once and for all, and short responses are
//! completed with follow-up requests. Cancellation is dropping the
//! operation future; the in-flight attempt aborts without retry.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use ferrobus_core::codec;
use ferrobus_core::encoding::Writer;
use ferrobus_core::objects::ObjectError;
use ferrobus_core::pdu::{category, object_id};
use ferrobus_core::range;
use ferrobus_core::CodecError;
use ferrobus_datalink::TcpTransport;
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

pub use ferrobus_core::objects::{ObjectCollection, ObjectKind, ObjectValue};
pub use ferrobus_core::pdu::ExceptionCode;
pub use ferrobus_core::range::Range;
pub use ferrobus_datalink::{Transport, TransportError};

#[cfg(feature = "rtu")]
pub use ferrobus_datalink::{RtuTransport, SerialSettings};

/// Client tuning knobs. `None` durations mean "infinite".
#[derive(Debug, Clone, Copy)]
pub struct ClientConfig {
    /// Per-attempt response deadline.
    pub response_timeout: Option<Duration>,
    /// Delay before retrying after a transport error or timeout.
    pub exception_retry_delay: Duration,
    /// Delay before retrying after a `ServerDeviceBusy` response.
    pub busy_retry_delay: Duration,
    /// Retries per request on top of the first attempt.
    pub retry_count: u8,
    /// How long an unused connection stays open. `Some(0)` closes right
    /// after each request, `None` keeps the connection forever.
    pub idle_timeout: Option<Duration>,
    /// Per-request object count cap; 0 applies the protocol limit.
    pub max_request_length: u16,
    /// Gap tolerance when merging requested ranges.
    pub allowed_request_waste: u16,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            response_timeout: Some(Duration::from_secs(2)),
            exception_retry_delay: Duration::from_millis(500),
            busy_retry_delay: Duration::from_secs(1),
            retry_count: 4,
            idle_timeout: Some(Duration::from_secs(7)),
            max_request_length: 0,
            allowed_request_waste: 0,
        }
    }
}

impl ClientConfig {
    pub fn with_response_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_exception_retry_delay(mut self, delay: Duration) -> Self {
        self.exception_retry_delay = delay;
        self
    }

    pub fn with_busy_retry_delay(mut self, delay: Duration) -> Self {
        self.busy_retry_delay = delay;
        self
    }

    pub fn with_retry_count(mut self, retry_count: u8) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_max_request_length(mut self, max_request_length: u16) -> Self {
        self.max_request_length = max_request_length;
        self
    }

    pub fn with_allowed_request_waste(mut self, allowed_request_waste: u16) -> Self {
        self.allowed_request_waste = allowed_request_waste;
        self
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("encode error: {0}")]
    Encode(#[from] ferrobus_core::EncodeError),
    #[error(transparent)]
    Object(#[from] ObjectError),
    #[error("device exception: {0:?}")]
    Exception(ExceptionCode),
    #[error("protocol error: {0}")]
    Protocol(CodecError),
    #[error("request timed out")]
    Timeout,
    #[error("{0:?} objects are read-only")]
    ReadOnlyKind(ObjectKind),
}

impl From<CodecError> for ClientError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Exception(code) => Self::Exception(code),
            other => Self::Protocol(other),
        }
    }
}

impl ClientError {
    /// Numeric code for interop logging: exception codes keep their wire
    /// values 1..8, internal kinds are numbered from 256 up.
    pub fn code(&self) -> Option<u16> {
        match self {
            Self::Exception(code) => Some(u16::from(code.as_u8())),
            Self::Protocol(err) => Some(err.code()),
            Self::Transport(TransportError::CrcMismatch) => Some(256),
            Self::Timeout => Some(261),
            _ => None,
        }
    }
}

/// The write-function adaptation state: which family of write function
/// codes this device has been observed to accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Unknown,
    AlwaysSingle,
    AlwaysMultiple,
}

/// Latched write mode; the only transition is out of `Unknown`, once.
#[derive(Debug, Default)]
struct WriteModeLatch(AtomicU8);

impl WriteModeLatch {
    fn mode(&self) -> WriteMode {
        match self.0.load(Ordering::Acquire) {
            1 => WriteMode::AlwaysSingle,
            2 => WriteMode::AlwaysMultiple,
            _ => WriteMode::Unknown,
        }
    }

    fn try_latch(&self, mode: WriteMode) -> bool {
        let value = match mode {
            WriteMode::AlwaysSingle => 1,
            WriteMode::AlwaysMultiple => 2,
            WriteMode::Unknown => return false,
        };
        self.0
            .compare_exchange(0, value, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Factory for the client's connection; invoked whenever a request finds
/// no open connection.
#[async_trait]
pub trait Connect: Send + Sync + 'static {
    type Transport: Transport + 'static;

    async fn connect(&self) -> Result<Self::Transport, TransportError>;
}

/// Reconnects over TCP to a fixed address.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl Connect for TcpConnector {
    type Transport = TcpTransport;

    async fn connect(&self) -> Result<TcpTransport, TransportError> {
        TcpTransport::connect(self.addr.as_str()).await
    }
}

/// Reopens a fixed serial port.
#[cfg(feature = "rtu")]
#[derive(Debug, Clone)]
pub struct SerialConnector {
    path: String,
    settings: SerialSettings,
}

#[cfg(feature = "rtu")]
impl SerialConnector {
    pub fn new(path: impl Into<String>, settings: SerialSettings) -> Self {
        Self {
            path: path.into(),
            settings,
        }
    }
}

#[cfg(feature = "rtu")]
#[async_trait]
impl Connect for SerialConnector {
    type Transport = RtuTransport;

    async fn connect(&self) -> Result<RtuTransport, TransportError> {
        RtuTransport::open(&self.path, self.settings.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestClass {
    Read,
    Write,
}

struct ClientShared<C: Connect> {
    connector: C,
    config: ClientConfig,
    connection: Mutex<Option<C::Transport>>,
    write_mode: WriteModeLatch,
    /// Bumped on every activity; an idle-close timer only fires if its
    /// epoch is still current, so new requests supersede pending timers.
    idle_epoch: AtomicU64,
    next_correlation_id: AtomicU64,
}

/// An asynchronous Modbus client over a reconnecting transport.
pub struct Client<C: Connect> {
    shared: Arc<ClientShared<C>>,
}

impl<C: Connect> Client<C> {
    pub fn new(connector: C) -> Self {
        Self::with_config(connector, ClientConfig::default())
    }

    pub fn with_config(connector: C, config: ClientConfig) -> Self {
        Self {
            shared: Arc::new(ClientShared {
                connector,
                config,
                connection: Mutex::new(None),
                write_mode: WriteModeLatch::default(),
                idle_epoch: AtomicU64::new(0),
                next_correlation_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> ClientConfig {
        self.shared.config
    }

    pub fn write_mode(&self) -> WriteMode {
        self.shared.write_mode.mode()
    }

    /// Close the connection, if open. The next request reconnects.
    pub async fn close(&self) {
        self.shared.idle_epoch.fetch_add(1, Ordering::AcqRel);
        self.shared.connection.lock().await.take();
    }

    /// Read objects of one kind covering every address of `ranges`.
    ///
    /// The ranges are planned into protocol-legal requests first; short
    /// responses are completed with follow-up requests, so the result
    /// either covers everything or the call fails.
    pub async fn read(
        &self,
        kind: ObjectKind,
        unit_id: u8,
        ranges: &[Range],
    ) -> Result<ObjectCollection, ClientError> {
        let config = self.shared.config;
        let max_length = effective_length(config.max_request_length, kind.max_read_length());
        let planned = range::plan(ranges, max_length, config.allowed_request_waste);

        let mut objects = ObjectCollection::new(kind);
        for planned_range in planned {
            let mut remaining = planned_range;
            loop {
                let mut pdu = [0u8; 8];
                let mut w = Writer::new(&mut pdu);
                codec::build_read_request(kind, remaining, &mut w)?;
                let response = self
                    .send_request(unit_id, w.as_written(), RequestClass::Read)
                    .await?;
                let delivered = codec::decode_read_response(remaining, &response, &mut objects)?;
                match remaining.advance(delivered) {
                    None => break,
                    Some(rest) => {
                        debug!(
                            unit_id,
                            delivered,
                            remaining = rest.len(),
                            "short response; requesting remainder"
                        );
                        remaining = rest;
                    }
                }
            }
        }
        Ok(objects)
    }

    /// Write every object in `objects` to the device. Confirmation covers
    /// the full collection or the call fails.
    pub async fn write(&self, unit_id: u8, objects: &ObjectCollection) -> Result<(), ClientError> {
        let kind = objects.kind();
        if !kind.is_writable() {
            return Err(ClientError::ReadOnlyKind(kind));
        }
        let config = self.shared.config;
        let max_length = effective_length(config.max_request_length, kind.max_write_length());

        // Bridging gaps would fabricate values for unrequested addresses,
        // so writes never use the waste allowance.
        for planned_range in objects.ranges(max_length, 0) {
            self.write_range(unit_id, objects, planned_range).await?;
        }
        Ok(())
    }

    async fn write_range(
        &self,
        unit_id: u8,
        objects: &ObjectCollection,
        planned_range: Range,
    ) -> Result<(), ClientError> {
        let mut remaining = planned_range;
        loop {
            let mode = self.shared.write_mode.mode();
            if mode == WriteMode::AlwaysSingle {
                for address in remaining.iter() {
                    self.write_single(unit_id, objects, address).await?;
                }
                return Ok(());
            }

            if remaining.len() == 1 && mode == WriteMode::Unknown {
                match self.write_single(unit_id, objects, remaining.start()).await {
                    Ok(()) => return Ok(()),
                    Err(err) if self.try_switch(&err, WriteMode::AlwaysMultiple) => {
                        debug!(unit_id, "single write rejected; switching to multiple writes");
                        continue;
                    }
                    Err(err) => return Err(err),
                }
            }

            match self.write_multiple(unit_id, objects, remaining).await {
                Ok(confirmed) => match remaining.advance(confirmed) {
                    None => return Ok(()),
                    Some(rest) => {
                        debug!(
                            unit_id,
                            confirmed,
                            remaining = rest.len(),
                            "partial write confirmation; writing remainder"
                        );
                        remaining = rest;
                    }
                },
                Err(err) if self.try_switch(&err, WriteMode::AlwaysSingle) => {
                    debug!(unit_id, "multiple write rejected; switching to single writes");
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// A rejected or silently ignored write function family triggers the
    /// one-shot switch to the other family.
    fn try_switch(&self, err: &ClientError, to: WriteMode) -> bool {
        let eligible = matches!(
            err,
            ClientError::Timeout | ClientError::Exception(ExceptionCode::IllegalFunction)
        );
        eligible && self.shared.write_mode.try_latch(to)
    }

    async fn write_single(
        &self,
        unit_id: u8,
        objects: &ObjectCollection,
        address: u16,
    ) -> Result<(), ClientError> {
        let kind = objects.kind();
        let word = objects.word(address)?;
        let mut pdu = [0u8; 8];
        let mut w = Writer::new(&mut pdu);
        codec::build_write_single(kind, address, word, &mut w)?;
        let response = self
            .send_request(unit_id, w.as_written(), RequestClass::Write)
            .await?;
        codec::decode_write_single_response(kind, address, word, &response)?;
        Ok(())
    }

    async fn write_multiple(
        &self,
        unit_id: u8,
        objects: &ObjectCollection,
        planned_range: Range,
    ) -> Result<u16, ClientError> {
        let kind = objects.kind();
        let words: Vec<u16> = planned_range
            .iter()
            .map(|address| objects.word(address))
            .collect::<Result<_, _>>()?;
        let mut pdu = [0u8; 260];
        let mut w = Writer::new(&mut pdu);
        codec::build_write_multiple(kind, planned_range.start(), &words, &mut w)?;
        let response = self
            .send_request(unit_id, w.as_written(), RequestClass::Write)
            .await?;
        let requested = planned_range.len() as u16;
        Ok(codec::decode_write_multiple_response(
            kind,
            planned_range.start(),
            requested,
            &response,
        )?)
    }

    /// Read the device identification objects of every category the
    /// device's conformity level advertises.
    pub async fn read_device_identification(
        &self,
        unit_id: u8,
    ) -> Result<BTreeMap<u8, String>, ClientError> {
        let mut values = BTreeMap::new();
        let mut max_category = category::BASIC;
        let mut current = category::BASIC;
        let mut first_response = true;

        while current <= max_category {
            let mut next_object = object_id::VENDOR_NAME;
            let mut first_read_of_category = true;
            loop {
                let mut pdu = [0u8; 8];
                let mut w = Writer::new(&mut pdu);
                codec::build_read_device_id(current, next_object, &mut w)?;

                let outcome = match self
                    .send_request(unit_id, w.as_written(), RequestClass::Read)
                    .await
                {
                    Ok(response) => {
                        codec::decode_read_device_id(&response, next_object).map_err(Into::into)
                    }
                    Err(err) => Err(err),
                };
                let decoded = match outcome {
                    Ok(decoded) => decoded,
                    // Gateways that reject the canonical starting object of
                    // the higher categories accept these fallbacks.
                    Err(ClientError::Exception(ExceptionCode::IllegalDataAddress))
                        if first_read_of_category && current != category::BASIC =>
                    {
                        next_object = if current == category::REGULAR {
                            object_id::VENDOR_URL
                        } else {
                            object_id::FIRST_PRIVATE_OBJECT
                        };
                        first_read_of_category = false;
                        debug!(
                            unit_id,
                            category = current,
                            next_object,
                            "category start rejected; retrying from fallback object"
                        );
                        continue;
                    }
                    Err(err) => return Err(err),
                };

                if first_response {
                    max_category = (decoded.conformity_level & 0x7F)
                        .clamp(category::BASIC, category::EXTENDED);
                    first_response = false;
                }
                for object in decoded.objects {
                    values.insert(
                        object.object_id,
                        String::from_utf8_lossy(&object.value).into_owned(),
                    );
                }
                if !decoded.more_follows {
                    break;
                }
                next_object = decoded.next_object_id;
                first_read_of_category = false;
            }
            current += 1;
        }
        Ok(values)
    }

    /// Run one PDU through the retry pipeline and return the response PDU.
    async fn send_request(
        &self,
        unit_id: u8,
        request_pdu: &[u8],
        class: RequestClass,
    ) -> Result<Vec<u8>, ClientError> {
        let config = self.shared.config;
        let correlation_id = self
            .shared
            .next_correlation_id
            .fetch_add(1, Ordering::Relaxed);
        let retries = u32::from(config.retry_count);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            debug!(
                correlation_id,
                unit_id,
                attempt,
                pdu_len = request_pdu.len(),
                "dispatching modbus request"
            );
            match self.attempt(correlation_id, unit_id, request_pdu).await {
                Ok(response) => {
                    if response.len() >= 2 && response[0] & 0x80 != 0 {
                        let code = ExceptionCode::from_u8(response[1]);
                        if code == ExceptionCode::ServerDeviceBusy && attempt <= retries {
                            let delay = config.busy_retry_delay + retry_jitter();
                            warn!(
                                correlation_id,
                                unit_id, attempt, "device busy; retrying in {:?}", delay
                            );
                            sleep(delay).await;
                            continue;
                        }
                        return Err(ClientError::Exception(code));
                    }
                    return Ok(response);
                }
                Err(err) => {
                    // A timed-out write may mean the device silently
                    // ignores this write function family; surface it so
                    // the caller can switch families before burning the
                    // retry budget.
                    if matches!(err, ClientError::Timeout)
                        && class == RequestClass::Write
                        && self.shared.write_mode.mode() == WriteMode::Unknown
                    {
                        return Err(err);
                    }
                    let retryable =
                        matches!(err, ClientError::Transport(_) | ClientError::Timeout);
                    if !retryable || attempt > retries {
                        return Err(err);
                    }
                    let delay = config.exception_retry_delay + retry_jitter();
                    warn!(
                        correlation_id,
                        unit_id, attempt, error = %err, "request failed; retrying in {:?}", delay
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    /// One attempt: take the connection lock, connect if needed, exchange
    /// under the per-attempt deadline, then hand the lock back and arm the
    /// idle-close timer.
    async fn attempt(
        &self,
        correlation_id: u64,
        unit_id: u8,
        request_pdu: &[u8],
    ) -> Result<Vec<u8>, ClientError> {
        let mut guard = self.shared.connection.lock().await;
        self.shared.idle_epoch.fetch_add(1, Ordering::AcqRel);

        let taken = guard.take();
        let connector = &self.shared.connector;
        let io = async move {
            let mut transport = match taken {
                Some(transport) => transport,
                None => {
                    debug!(correlation_id, "opening connection");
                    connector.connect().await?
                }
            };
            let mut response = [0u8; 253];
            let len = transport.exchange(unit_id, request_pdu, &mut response).await?;
            Ok::<_, ClientError>((transport, response[..len].to_vec()))
        };

        let outcome = match self.shared.config.response_timeout {
            Some(limit) => match timeout(limit, io).await {
                Ok(result) => result,
                // The aborted exchange poisons the stream; the connection
                // is dropped along with the cancelled future.
                Err(_) => Err(ClientError::Timeout),
            },
            None => io.await,
        };

        let result = match outcome {
            Ok((transport, response)) => {
                *guard = Some(transport);
                Ok(response)
            }
            Err(err) => Err(err),
        };

        match self.shared.config.idle_timeout {
            Some(limit) if limit.is_zero() => {
                guard.take();
            }
            Some(limit) => self.arm_idle_timer(limit),
            None => {}
        }
        result
    }

    fn arm_idle_timer(&self, after: Duration) {
        let epoch = self.shared.idle_epoch.fetch_add(1, Ordering::AcqRel) + 1;
        let shared = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            sleep(after).await;
            let Some(shared) = shared.upgrade() else {
                return;
            };
            if shared.idle_epoch.load(Ordering::Acquire) != epoch {
                return;
            }
            let mut guard = shared.connection.lock().await;
            if shared.idle_epoch.load(Ordering::Acquire) != epoch {
                return;
            }
            if guard.take().is_some() {
                debug!("closing idle connection");
            }
        });
    }
}

fn effective_length(user_limit: u16, protocol_cap: u16) -> u16 {
    if user_limit == 0 {
        protocol_cap
    } else {
        user_limit.min(protocol_cap)
    }
}

fn retry_jitter() -> Duration {
    let millis = rand::thread_rng().gen_range(0..50);
    Duration::from_millis(millis)
}

#[cfg(test)]
mod tests;
