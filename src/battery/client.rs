use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tokio_modbus::client::{tcp, Context, Reader, Writer};
use tokio_modbus::slave::{Slave, SlaveContext};
use tracing::{debug, info, warn};

use crate::battery::{codec, failure, ModbusError, RegisterItem, MAX_READ_COUNT};

/// Connect attempts made by `ensure_connection` before giving up.
pub const CONNECT_ATTEMPTS: u32 = 3;
pub const FORCE_RECONNECT_FAILURES: u32 = 10;
pub const FORCE_RECONNECT_IDLE_SECS: i64 = 300;
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// One open session to a device.
#[async_trait]
pub trait RegisterLink: Send {
    async fn read_holding(
        &mut self,
        slave: u8,
        addr: u16,
        count: u16,
    ) -> Result<Vec<u16>, ModbusError>;

    async fn write_multiple(
        &mut self,
        slave: u8,
        addr: u16,
        words: &[u16],
    ) -> Result<(), ModbusError>;
}

/// Opens sessions, so the manager can be driven without a real device.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, host: &str, port: u16) -> Result<Box<dyn RegisterLink>, ModbusError>;
}

/// Modbus TCP through tokio-modbus.
pub struct TcpConnector {
    io_timeout: Duration,
}

impl TcpConnector {
    pub fn new(io_timeout: Duration) -> Self {
        Self { io_timeout }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, host: &str, port: u16) -> Result<Box<dyn RegisterLink>, ModbusError> {
        let addr = tokio::net::lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "host did not resolve"))?;
        let ctx = timeout(self.io_timeout, tcp::connect(addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
        Ok(Box::new(TcpLink {
            ctx,
            io_timeout: self.io_timeout,
        }))
    }
}

struct TcpLink {
    ctx: Context,
    io_timeout: Duration,
}

fn flatten<T, X: std::fmt::Display>(
    res: Result<Result<T, X>, tokio_modbus::Error>,
) -> Result<T, ModbusError> {
    match res {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(exception)) => Err(ModbusError::Protocol(exception.to_string())),
        Err(tokio_modbus::Error::Transport(e)) => Err(ModbusError::Transport(e)),
        Err(e) => Err(ModbusError::Protocol(e.to_string())),
    }
}

fn timed_out(op: &str) -> ModbusError {
    ModbusError::Transport(io::Error::new(
        io::ErrorKind::TimedOut,
        format!("{} timed out", op),
    ))
}

#[async_trait]
impl RegisterLink for TcpLink {
    async fn read_holding(
        &mut self,
        slave: u8,
        addr: u16,
        count: u16,
    ) -> Result<Vec<u16>, ModbusError> {
        self.ctx.set_slave(Slave(slave));
        let res = timeout(self.io_timeout, self.ctx.read_holding_registers(addr, count))
            .await
            .map_err(|_| timed_out("read"))?;
        flatten(res)
    }

    async fn write_multiple(
        &mut self,
        slave: u8,
        addr: u16,
        words: &[u16],
    ) -> Result<(), ModbusError> {
        self.ctx.set_slave(Slave(slave));
        let res = timeout(self.io_timeout, self.ctx.write_multiple_registers(addr, words))
            .await
            .map_err(|_| timed_out("write"))?;
        flatten(res)
    }
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Attempts per read or write
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// Reconnect delay per recorded failure, capped at [`MAX_RECONNECT_DELAY`]
    pub reconnect_base_delay: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(100),
            reconnect_base_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Serialize, Debug, Copy, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Good,
    Degraded,
    Poor,
}

#[derive(Debug, Clone, Default)]
pub struct ConnectionHealth {
    pub consecutive_failures: u32,
    pub last_successful_connection: Option<DateTime<Utc>>,
}

impl ConnectionHealth {
    fn record_success(&mut self, now: DateTime<Utc>) {
        self.consecutive_failures = 0;
        self.last_successful_connection = Some(now);
    }

    fn record_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }

    pub fn status(&self) -> HealthStatus {
        match self.consecutive_failures {
            0..=2 => HealthStatus::Good,
            3..=5 => HealthStatus::Degraded,
            _ => HealthStatus::Poor,
        }
    }

    /// A device that has never connected is not considered idle.
    pub fn should_force_reconnect_at(&self, now: DateTime<Utc>) -> bool {
        if self.consecutive_failures > FORCE_RECONNECT_FAILURES {
            return true;
        }
        match self.last_successful_connection {
            Some(last) => (now - last).num_seconds() > FORCE_RECONNECT_IDLE_SECS,
            None => false,
        }
    }
}

#[derive(Serialize, Debug, Clone)]
pub struct HealthReport {
    pub device: String,
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    pub last_successful_connection: Option<DateTime<Utc>>,
    pub should_force_reconnect: bool,
}

#[derive(Debug, Clone)]
struct Endpoint {
    host: Option<String>,
    port: u16,
}

/// Owns the session to one device. All I/O on the session is serialised.
pub struct ConnectionManager {
    device: String,
    endpoint: Mutex<Endpoint>,
    connector: Arc<dyn Connector>,
    options: ClientOptions,
    connect_lock: Mutex<()>,
    link: Mutex<Option<Box<dyn RegisterLink>>>,
    health: Mutex<ConnectionHealth>,
}

impl ConnectionManager {
    pub fn new(
        device: impl Into<String>,
        host: Option<String>,
        port: u16,
        connector: Arc<dyn Connector>,
        options: ClientOptions,
    ) -> Self {
        Self {
            device: device.into(),
            endpoint: Mutex::new(Endpoint { host, port }),
            connector,
            options,
            connect_lock: Mutex::new(()),
            link: Mutex::new(None),
            health: Mutex::new(ConnectionHealth::default()),
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub async fn is_connected(&self) -> bool {
        self.link.lock().await.is_some()
    }

    /// Point the manager at a new endpoint. The current session is dropped.
    pub async fn set_endpoint(&self, host: Option<String>, port: u16) {
        let _guard = self.connect_lock.lock().await;
        *self.endpoint.lock().await = Endpoint { host, port };
        self.close().await;
        info!(device = %self.device, "endpoint updated");
    }

    pub async fn close(&self) {
        if self.link.lock().await.take().is_some() {
            debug!(device = %self.device, "session closed");
        }
    }

    pub async fn connect(&self) -> bool {
        let _guard = self.connect_lock.lock().await;
        self.connect_locked().await
    }

    /// Caller must hold `connect_lock`.
    async fn connect_locked(&self) -> bool {
        let Endpoint { host, port } = self.endpoint.lock().await.clone();
        let Some(host) = host else {
            warn!(device = %self.device, "no host configured");
            return false;
        };

        match self.connector.connect(&host, port).await {
            Ok(link) => {
                *self.link.lock().await = Some(link);
                self.health.lock().await.record_success(Utc::now());
                info!(device = %self.device, %host, port, "connected");
                true
            }
            Err(e) => {
                let failures = {
                    let mut health = self.health.lock().await;
                    health.record_failure();
                    health.consecutive_failures
                };
                warn!(
                    device = %self.device,
                    %host,
                    port,
                    failures,
                    error = %e,
                    "connect failed"
                );
                false
            }
        }
    }

    async fn has_host(&self) -> bool {
        self.endpoint.lock().await.host.is_some()
    }

    pub async fn ensure_connection(&self) -> bool {
        if self.is_connected().await {
            return true;
        }
        let _guard = self.connect_lock.lock().await;
        for attempt in 1..=CONNECT_ATTEMPTS {
            // someone else may have connected while we waited for the lock
            if self.is_connected().await {
                return true;
            }
            if !self.has_host().await {
                warn!(device = %self.device, "no host configured");
                return false;
            }
            if self.connect_locked().await {
                return true;
            }
            if attempt < CONNECT_ATTEMPTS {
                sleep(self.options.retry_delay).await;
            }
        }
        false
    }

    pub async fn read(&self, item: &RegisterItem) -> Option<f64> {
        self.read_count(item.data_type.word_count(), item).await
    }

    /// Read `count` registers starting at the item address and decode them.
    /// Never fails: exhausted retries give `None`.
    pub async fn read_count(&self, count: u16, item: &RegisterItem) -> Option<f64> {
        if !item.access.readable() {
            debug!(device = %self.device, item = %item.name, "write-only item, not read");
            return None;
        }
        if !(1..=MAX_READ_COUNT).contains(&count) {
            let error = ModbusError::RegisterCount(count);
            warn!(device = %self.device, item = %item.name, %error, "read rejected");
            return None;
        }

        let attempts = self.options.max_retries.max(1);
        for attempt in 1..=attempts {
            match self.read_once(item, count).await {
                Ok(words) => {
                    return match codec::decode(&words, item) {
                        Ok(v) => Some(v),
                        Err(e) => {
                            warn!(
                                device = %self.device,
                                item = %item.name,
                                error = %e,
                                "decode failed"
                            );
                            None
                        }
                    };
                }
                Err(ModbusError::NoHost) => return None,
                Err(e) => {
                    warn!(
                        device = %self.device,
                        item = %item.name,
                        attempt,
                        error = %e,
                        "read failed"
                    );
                    if matches!(e, ModbusError::Transport(_)) && failure::is_disconnect(&e) {
                        self.reconnect_on_error().await;
                    }
                }
            }
            if attempt < attempts {
                sleep(self.options.retry_delay).await;
            }
        }
        warn!(device = %self.device, item = %item.name, attempts, "read retries exhausted");
        None
    }

    async fn read_once(&self, item: &RegisterItem, count: u16) -> Result<Vec<u16>, ModbusError> {
        if !self.ensure_connection().await {
            return Err(self.unavailable().await);
        }
        let mut link = self.link.lock().await;
        let session = link.as_mut().ok_or(ModbusError::NotConnected)?;
        let res = session.read_holding(item.slave, item.address, count).await;
        if let Err(e) = &res {
            if failure::is_disconnect(e) {
                *link = None;
            }
        }
        res
    }

    /// Encode and write one item. Read-only items and values that do not
    /// fit the register are rejected without touching the wire.
    pub async fn write(&self, value: f64, item: &RegisterItem) -> bool {
        if !item.access.writable() {
            warn!(device = %self.device, item = %item.name, "read-only item, write refused");
            return false;
        }
        let words = match codec::encode(value, item) {
            Ok(words) => words,
            Err(e) => {
                warn!(
                    device = %self.device,
                    item = %item.name,
                    value,
                    error = %e,
                    "write rejected"
                );
                return false;
            }
        };
        self.write_block(item.slave, item.address, &words).await
    }

    /// Write already encoded words in one write multiple registers request.
    /// Transport errors are retried like reads; a peer error response is
    /// classified once and never retried.
    pub async fn write_block(&self, slave: u8, address: u16, words: &[u16]) -> bool {
        let attempts = self.options.max_retries.max(1);
        for attempt in 1..=attempts {
            match self.write_once(slave, address, words).await {
                Ok(()) => {
                    debug!(device = %self.device, slave, address, ?words, "write ok");
                    return true;
                }
                Err(ModbusError::NoHost) => {
                    warn!(device = %self.device, address, "write skipped, no host");
                    return false;
                }
                Err(e @ ModbusError::Protocol(_)) => {
                    if failure::is_real_write_failure(&e) {
                        warn!(device = %self.device, slave, address, error = %e, "write failed");
                        return false;
                    }
                    debug!(
                        device = %self.device,
                        slave,
                        address,
                        error = %e,
                        "peer error response accepted as success"
                    );
                    return true;
                }
                Err(e) => {
                    warn!(
                        device = %self.device,
                        slave,
                        address,
                        attempt,
                        error = %e,
                        "write failed"
                    );
                    if matches!(e, ModbusError::Transport(_)) && failure::is_disconnect(&e) {
                        self.reconnect_on_error().await;
                    }
                }
            }
            if attempt < attempts {
                sleep(self.options.retry_delay).await;
            }
        }
        warn!(device = %self.device, slave, address, attempts, "write retries exhausted");
        false
    }

    async fn write_once(&self, slave: u8, address: u16, words: &[u16]) -> Result<(), ModbusError> {
        if !self.ensure_connection().await {
            return Err(self.unavailable().await);
        }
        let mut link = self.link.lock().await;
        let session = link.as_mut().ok_or(ModbusError::NotConnected)?;
        let res = session.write_multiple(slave, address, words).await;
        if let Err(e) = &res {
            if failure::is_disconnect(e) {
                *link = None;
            }
        }
        res
    }

    /// Why there is no session after `ensure_connection` gave up.
    async fn unavailable(&self) -> ModbusError {
        if self.has_host().await {
            ModbusError::NotConnected
        } else {
            ModbusError::NoHost
        }
    }

    pub async fn health(&self) -> ConnectionHealth {
        self.health.lock().await.clone()
    }

    pub async fn should_force_reconnect(&self) -> bool {
        self.health.lock().await.should_force_reconnect_at(Utc::now())
    }

    pub async fn connection_health(&self) -> HealthReport {
        let health = self.health().await;
        HealthReport {
            device: self.device.clone(),
            status: health.status(),
            consecutive_failures: health.consecutive_failures,
            last_successful_connection: health.last_successful_connection,
            should_force_reconnect: health.should_force_reconnect_at(Utc::now()),
        }
    }

    fn initial_reconnect_delay(&self, failures: u32) -> Duration {
        self.options
            .reconnect_base_delay
            .saturating_mul(failures.saturating_add(1))
            .min(MAX_RECONNECT_DELAY)
    }

    /// Drop the session and try to open a new one. Fewer attempts are made
    /// the more failures have already been recorded.
    pub async fn reconnect_on_error(&self) -> bool {
        let _guard = self.connect_lock.lock().await;
        let failures = self.health.lock().await.consecutive_failures;
        let attempts = 4u32.saturating_sub(failures).max(1);
        let mut delay = self.initial_reconnect_delay(failures);

        self.close().await;
        for attempt in 1..=attempts {
            sleep(delay).await;
            if self.connect_locked().await {
                info!(device = %self.device, attempt, "reconnected");
                return true;
            }
            delay = delay.saturating_mul(2).min(MAX_RECONNECT_DELAY);
        }
        warn!(device = %self.device, attempts, "reconnect failed");
        false
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::MutexGuard;

    #[derive(Debug, Clone, PartialEq)]
    pub enum Call {
        Read { slave: u8, address: u16, count: u16 },
        Write { slave: u8, address: u16, words: Vec<u16> },
    }

    #[derive(Default)]
    pub struct MockState {
        pub registers: HashMap<(u8, u16), u16>,
        pub calls: Vec<Call>,
        pub connects: usize,
        /// Refuse this many upcoming connects
        pub refuse_connects: usize,
        pub refuse_all: bool,
        pub read_errors: HashMap<(u8, u16), io::ErrorKind>,
        /// Peer error text returned for every write
        pub write_reply: Option<String>,
        /// Transport errors returned by the next writes, one per write
        pub write_errors: VecDeque<io::ErrorKind>,
    }

    /// Scripted device; clones share state.
    #[derive(Clone, Default)]
    pub struct MockDevice(pub Arc<std::sync::Mutex<MockState>>);

    impl MockDevice {
        pub fn state(&self) -> MutexGuard<'_, MockState> {
            self.0.lock().unwrap()
        }

        pub fn set(&self, slave: u8, address: u16, value: u16) {
            self.state().registers.insert((slave, address), value);
        }

        pub fn calls(&self) -> Vec<Call> {
            self.state().calls.clone()
        }

        pub fn writes(&self) -> Vec<Call> {
            self.calls()
                .into_iter()
                .filter(|c| matches!(c, Call::Write { .. }))
                .collect()
        }

        pub fn manager(&self, device: &str) -> ConnectionManager {
            ConnectionManager::new(
                device,
                Some("127.0.0.1".to_owned()),
                502,
                Arc::new(self.clone()),
                ClientOptions {
                    max_retries: 3,
                    retry_delay: Duration::ZERO,
                    reconnect_base_delay: Duration::ZERO,
                },
            )
        }
    }

    #[async_trait]
    impl Connector for MockDevice {
        async fn connect(
            &self,
            _host: &str,
            _port: u16,
        ) -> Result<Box<dyn RegisterLink>, ModbusError> {
            let mut s = self.state();
            s.connects += 1;
            if s.refuse_all || s.refuse_connects > 0 {
                s.refuse_connects = s.refuse_connects.saturating_sub(1);
                return Err(io::Error::from(io::ErrorKind::ConnectionRefused).into());
            }
            Ok(Box::new(MockLink(self.clone())))
        }
    }

    struct MockLink(MockDevice);

    #[async_trait]
    impl RegisterLink for MockLink {
        async fn read_holding(
            &mut self,
            slave: u8,
            address: u16,
            count: u16,
        ) -> Result<Vec<u16>, ModbusError> {
            let mut s = self.0.state();
            s.calls.push(Call::Read { slave, address, count });
            if let Some(kind) = s.read_errors.get(&(slave, address)) {
                return Err(io::Error::from(*kind).into());
            }
            Ok((0..count)
                .map(|i| *s.registers.get(&(slave, address + i)).unwrap_or(&0))
                .collect())
        }

        async fn write_multiple(
            &mut self,
            slave: u8,
            address: u16,
            words: &[u16],
        ) -> Result<(), ModbusError> {
            let mut s = self.0.state();
            s.calls.push(Call::Write {
                slave,
                address,
                words: words.to_vec(),
            });
            if let Some(kind) = s.write_errors.pop_front() {
                return Err(io::Error::from(kind).into());
            }
            if let Some(reply) = &s.write_reply {
                return Err(ModbusError::Protocol(reply.clone()));
            }
            for (i, w) in words.iter().enumerate() {
                s.registers.insert((slave, address + i as u16), *w);
            }
            Ok(())
        }
    }
}
