//! Helpers shared by the unit tests.

use crate::{
    calculators::{remote::SharedFilesystem, CalculatorDescriptor, CalculatorSettings, Calculators},
    case::{Case, Value, Variables},
    discovery::{DiscoveryConfig, DiscoveryService},
    resolve::{SearchPath, ToolResolver},
};
use std::{
    fs,
    net::{IpAddr, Ipv4Addr, UdpSocket},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

/// stands in for ssh: drops all options, fails like ssh for host `unreachable` and runs the
/// remote command locally otherwise
const FAKE_SSH: &str = r#"#!/bin/sh
while [ $# -gt 2 ]; do shift; done
if [ "$1" = "unreachable" ]; then
    echo "ssh: connect to host $1: Connection refused" >&2
    exit 255
fi
exec sh -c "$2"
"#;

pub fn shell() -> PathBuf {
    SearchPath::default().resolve("sh").unwrap()
}

/// Resolver that finds nothing
#[derive(Debug)]
pub struct NoTools;

impl ToolResolver for NoTools {
    fn resolve(&self, _program: &str) -> Option<PathBuf> {
        None
    }
}

/// install the fake `ssh` into `dir` and return a resolver preferring it
pub fn fake_ssh(dir: &Path) -> Arc<dyn ToolResolver> {
    let path = dir.join("ssh");
    fs::write(&path, FAKE_SSH).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();

    Arc::new(SearchPath::with_dirs(vec![dir.to_path_buf()]))
}

/// a udp port nobody listens on right now
pub fn free_udp_port() -> u16 {
    UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

pub fn loopback_discovery(port: u16, window: Duration) -> DiscoveryConfig {
    DiscoveryConfig {
        port,
        bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
        window_ms: window.as_millis() as u64,
        poll_ms: 20,
        ..DiscoveryConfig::default()
    }
}

pub fn settings_with(
    resolver: Arc<dyn ToolResolver>,
    discovery: DiscoveryConfig,
) -> CalculatorSettings {
    CalculatorSettings {
        resolver,
        poll_interval: discovery.poll_interval(),
        discovery: Arc::new(DiscoveryService::new(discovery)),
        staging: Arc::new(SharedFilesystem),
        connect_timeout: Duration::from_secs(2),
    }
}

pub fn settings() -> CalculatorSettings {
    settings_with(
        Arc::new(SearchPath::default()),
        loopback_discovery(free_udp_port(), Duration::from_millis(200)),
    )
}

pub fn calculator(uri: &str, concurrency: usize, settings: &CalculatorSettings) -> Calculators {
    Calculators::load(CalculatorDescriptor::parse(uri, concurrency).unwrap(), settings).unwrap()
}

pub fn variables(pairs: &[(&str, f64)]) -> Variables {
    pairs
        .iter()
        .map(|(name, value)| (name.to_string(), Value::from(*value)))
        .collect()
}

pub fn case(index: usize, pairs: &[(&str, f64)]) -> Case {
    Case::new(index, variables(pairs), format!("{index:016x}"))
}
