
use crate::protocol::{Announcement, PROTOCOL_VERSION};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    io::ErrorKind,
    net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket},
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Failed to listen for announcements on udp port {0}")]
    Bind(u16, #[source] std::io::Error),
    #[error("Failed to receive announcements")]
    Receive(#[from] std::io::Error),
    #[error("No daemon for code '{code}' announced itself within {window:?}")]
    NotFound { code: String, window: Duration },
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DiscoveryConfig {
    /// udp port daemons announce themselves on
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
    /// how long announcements are collected, should span several broadcast intervals
    #[serde(default = "default_window")]
    pub window_ms: u64,
    /// entries not refreshed for this long are dropped
    #[serde(default = "default_staleness")]
    pub staleness_ms: u64,
    /// interval between status polls of submitted jobs
    #[serde(default = "default_poll")]
    pub poll_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
            window_ms: default_window(),
            staleness_ms: default_staleness(),
            poll_ms: default_poll(),
        }
    }
}

impl DiscoveryConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn staleness(&self) -> Duration {
        Duration::from_millis(self.staleness_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_ms)
    }
}

fn default_port() -> u16 {
    19001
}

fn default_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_window() -> u64 {
    3000
}

fn default_staleness() -> u64 {
    30_000
}

fn default_poll() -> u64 {
    500
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveredDaemon {
    pub address: IpAddr,
    pub tcp_port: u16,
    pub protocol_version: String,
    pub codes: BTreeSet<String>,
    pub hostname: Option<String>,
    pub last_seen: Instant,
}

impl DiscoveredDaemon {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.tcp_port)
    }
}

/// Daemons seen so far, deduplicated by (address, tcp port)
#[derive(Debug, Default, Clone)]
pub struct DiscoveryTable {
    daemons: BTreeMap<(IpAddr, u16), DiscoveredDaemon>,
}

impl DiscoveryTable {
    /// Add or refresh the daemon behind `announcement`, returns true for new daemons
    pub fn record(&mut self, from: IpAddr, announcement: Announcement, now: Instant) -> bool {
        if announcement.version != PROTOCOL_VERSION {
            warn!(
                from = %from,
                version = %announcement.version,
                "Ignoring announcement with unsupported protocol version"
            );
            return false;
        }

        let key = (from, announcement.tcp_port);
        let codes = announcement.codes.into_iter().collect();

        match self.daemons.get_mut(&key) {
            Some(daemon) => {
                daemon.last_seen = now;
                daemon.codes = codes;
                daemon.hostname = announcement.hostname;

                false
            }
            None => {
                info!(address = %from, port = key.1, codes = ?codes, "Discovered daemon");
                self.daemons.insert(
                    key,
                    DiscoveredDaemon {
                        address: from,
                        tcp_port: key.1,
                        protocol_version: announcement.version,
                        codes,
                        hostname: announcement.hostname,
                        last_seen: now,
                    },
                );

                true
            }
        }
    }

    /// drop daemons not heard of within `staleness`
    pub fn prune(&mut self, staleness: Duration, now: Instant) {
        self.daemons
            .retain(|_, daemon| now.saturating_duration_since(daemon.last_seen) <= staleness);
    }

    /// every daemon supporting `code`, ordered by address and port
    pub fn matching(&self, code: &str) -> Vec<&DiscoveredDaemon> {
        self.daemons
            .values()
            .filter(|daemon| daemon.codes.contains(code))
            .collect()
    }

    pub fn remove(&mut self, address: SocketAddr) -> Option<DiscoveredDaemon> {
        self.daemons.remove(&(address.ip(), address.port()))
    }

    pub fn daemons(&self) -> impl Iterator<Item = &DiscoveredDaemon> {
        self.daemons.values()
    }

    pub fn len(&self) -> usize {
        self.daemons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.daemons.is_empty()
    }
}

/// Resolves daemon calculators by listening for their announcements during a bounded window.
/// Nothing listens in between requests, results are kept until they turn stale.
#[derive(Debug)]
pub struct DiscoveryService {
    config: DiscoveryConfig,
    tables: Mutex<BTreeMap<u16, DiscoveryTable>>,
}

impl DiscoveryService {
    pub fn new(config: DiscoveryConfig) -> Self {
        Self {
            config,
            tables: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Listen for one window on `udp_port` (the configured port if `None`) and return every
    /// daemon known afterwards
    pub fn discover(&self, udp_port: Option<u16>) -> Result<Vec<DiscoveredDaemon>, DiscoveryError> {
        let port = udp_port.unwrap_or(self.config.port);
        let mut tables = self.tables.lock();
        let table = tables.entry(port).or_default();

        self.listen(port, table)?;

        Ok(table.daemons().cloned().collect())
    }

    /// Addresses of all daemons supporting `code`, listening for a window only if no fresh
    /// entry is known. Never empty on success.
    pub fn resolve(
        &self,
        udp_port: Option<u16>,
        code: &str,
    ) -> Result<Vec<SocketAddr>, DiscoveryError> {
        let port = udp_port.unwrap_or(self.config.port);
        // held while listening, concurrent resolvers reuse the result instead of competing
        // for the port
        let mut tables = self.tables.lock();
        let table = tables.entry(port).or_default();

        table.prune(self.config.staleness(), Instant::now());

        let known = addresses(table, code);
        if !known.is_empty() {
            trace!(code = code, daemons = known.len(), "Reusing discovered daemons");
            return Ok(known);
        }

        self.listen(port, table)?;

        let found = addresses(table, code);
        if found.is_empty() {
            return Err(DiscoveryError::NotFound {
                code: code.to_string(),
                window: self.config.window(),
            });
        }

        Ok(found)
    }

    /// drop a daemon that could not be reached, the next resolve listens again once no other
    /// daemon is left
    pub fn forget(&self, udp_port: Option<u16>, address: SocketAddr) {
        let port = udp_port.unwrap_or(self.config.port);

        if let Some(table) = self.tables.lock().get_mut(&port) {
            if table.remove(address).is_some() {
                debug!(address = %address, "Forgot unreachable daemon");
            }
        }
    }

    fn listen(&self, port: u16, table: &mut DiscoveryTable) -> Result<(), DiscoveryError> {
        let socket = UdpSocket::bind(SocketAddr::new(self.config.bind, port))
            .map_err(|error| DiscoveryError::Bind(port, error))?;
        let deadline = Instant::now() + self.config.window();
        let mut buffer = [0u8; 65_536];
        let mut received = 0usize;

        debug!(port = port, window = ?self.config.window(), "Listening for announcements");

        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }

            socket.set_read_timeout(Some(deadline - now))?;

            match socket.recv_from(&mut buffer) {
                Ok((length, from)) => match Announcement::decode(&buffer[..length]) {
                    Ok(announcement) => {
                        received += 1;
                        table.record(from.ip(), announcement, Instant::now());
                    }
                    Err(error) => {
                        debug!(from = %from, error = %error, "Ignoring malformed announcement")
                    }
                },
                Err(error)
                    if matches!(error.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                Err(error) if error.kind() == ErrorKind::Interrupted => {}
                Err(error) => return Err(DiscoveryError::Receive(error)),
            }
        }

        table.prune(self.config.staleness(), Instant::now());
        debug!(
            announcements = received,
            daemons = table.len(),
            "Discovery window elapsed"
        );

        Ok(())
    }
}

fn addresses(table: &DiscoveryTable, code: &str) -> Vec<SocketAddr> {
    table
        .matching(code)
        .into_iter()
        .map(DiscoveredDaemon::socket_addr)
        .collect()
}
