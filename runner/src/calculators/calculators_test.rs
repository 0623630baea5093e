use super::{
    remote::{SharedFilesystem, SshSession, Staging},
    CalculatorDescriptor, Calculators, DaemonTarget, Endpoint, ExecutionRequest, Failure, Outcome,
    Scheme,
};
use crate::{
    case::{Case, CaseStatus, Value},
    config::ConfigErrors,
    daemon::{Daemon, DaemonConfig},
    store::{CaseNaming, ResultStore},
    testing,
};
use indexmap::IndexMap;
use std::{
    fs,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tempfile::TempDir;

fn endpoint(uri: &str) -> Endpoint {
    CalculatorDescriptor::parse(uri, 1).unwrap().endpoint
}

fn invalid(uri: &str) -> bool {
    matches!(
        CalculatorDescriptor::parse(uri, 1),
        Err(ConfigErrors::InvalidEndpoint { .. })
    )
}

#[test]
fn parses_endpoints() {
    assert_eq!(
        endpoint("sh://bash calc.sh"),
        Endpoint::Local {
            command: String::from("bash calc.sh")
        }
    );
    assert_eq!(
        endpoint("ssh://user@cluster/bash calc.sh"),
        Endpoint::Remote {
            host: String::from("user@cluster"),
            command: String::from("bash calc.sh")
        }
    );
    assert_eq!(
        endpoint("cache://results/*"),
        Endpoint::Cache {
            pattern: String::from("results/*")
        }
    );
    assert_eq!(
        endpoint("funz://node1:5555/bash"),
        Endpoint::Daemon {
            target: DaemonTarget::Direct(String::from("node1:5555")),
            code: String::from("bash")
        }
    );
    assert_eq!(
        endpoint("funz://:19002/bash"),
        Endpoint::Daemon {
            target: DaemonTarget::Discover {
                udp_port: Some(19002)
            },
            code: String::from("bash")
        }
    );
    assert_eq!(
        endpoint("funz:///bash"),
        Endpoint::Daemon {
            target: DaemonTarget::Discover { udp_port: None },
            code: String::from("bash")
        }
    );
    assert_eq!(
        endpoint("funz://:0/bash"),
        Endpoint::Daemon {
            target: DaemonTarget::Discover { udp_port: None },
            code: String::from("bash")
        }
    );
}

#[test]
fn rejects_malformed_endpoints() {
    assert!(invalid("bash calc.sh"));
    assert!(invalid("ftp://host/file"));
    assert!(invalid("sh://"));
    assert!(invalid("ssh://host"));
    assert!(invalid("ssh:///cmd"));
    assert!(invalid("cache://"));
    assert!(invalid("funz://host/bash"));
    assert!(invalid("funz://host:0/bash"));
    assert!(invalid("funz://:port/bash"));
    assert!(invalid("funz:///"));
    assert!(matches!(
        CalculatorDescriptor::parse("sh://true", 0),
        Err(ConfigErrors::InvalidEndpoint { .. })
    ));
}

#[test]
fn descriptor_scheme() {
    let cache = CalculatorDescriptor::parse("cache://x/*", 1).unwrap();
    let daemon = CalculatorDescriptor::parse("funz:///bash", 3).unwrap();

    assert_eq!(cache.scheme(), Scheme::Cache);
    assert!(cache.is_cache());
    assert_eq!(daemon.scheme(), Scheme::Daemon);
    assert_eq!(daemon.max_concurrency, 3);
    assert_eq!(daemon.to_string(), "funz:///bash");
}

#[test]
fn render_failures_are_terminal() {
    assert!(!Failure::Render(String::from("x")).is_retryable());
    assert!(Failure::Transport(String::from("x")).is_retryable());
    assert!(Failure::Execution {
        status: Some(1),
        message: String::from("x")
    }
    .is_retryable());
}

#[test]
fn remote_runs_through_ssh() {
    let tools = TempDir::new().unwrap();
    let dir = TempDir::new().unwrap();
    let settings = testing::settings_with(
        testing::fake_ssh(tools.path()),
        testing::loopback_discovery(testing::free_udp_port(), Duration::from_millis(10)),
    );
    fs::write(dir.path().join("input.txt"), "3").unwrap();
    let case = testing::case(0, &[]);
    let request = ExecutionRequest {
        case: &case,
        dir: dir.path(),
        timeout: Some(Duration::from_secs(10)),
    };

    let ok = testing::calculator(
        "ssh://user@cluster:2222/echo $(( $(cat input.txt) + 1 )) > result.txt",
        1,
        &settings,
    );
    assert!(ok.execute(&request).is_success());
    assert_eq!(
        fs::read_to_string(dir.path().join("result.txt")).unwrap().trim(),
        "4"
    );

    let failing = testing::calculator("ssh://cluster/exit 7", 1, &settings);
    assert!(matches!(
        failing.execute(&request),
        Outcome::Failure(Failure::Execution {
            status: Some(7),
            ..
        })
    ));

    let unreachable = testing::calculator("ssh://unreachable/true", 1, &settings);
    assert!(matches!(
        unreachable.execute(&request),
        Outcome::Failure(Failure::Transport(_))
    ));
}

#[test]
fn remote_requires_ssh() {
    let settings = testing::settings_with(
        Arc::new(testing::NoTools),
        testing::loopback_discovery(testing::free_udp_port(), Duration::from_millis(10)),
    );
    let descriptor = CalculatorDescriptor::parse("ssh://cluster/true", 1).unwrap();

    assert!(matches!(
        Calculators::load(descriptor, &settings),
        Err(ConfigErrors::MissingTool(_))
    ));
}

/// shared file system that counts how often artifacts were staged out
#[derive(Debug, Default)]
struct CountingStaging {
    staged_out: AtomicUsize,
}

impl Staging for CountingStaging {
    fn remote_dir(&self, local: &Path) -> String {
        SharedFilesystem.remote_dir(local)
    }

    fn stage_in(&self, _session: &SshSession, _local: &Path) -> Result<(), Failure> {
        Ok(())
    }

    fn stage_out(&self, _session: &SshSession, _local: &Path) -> Result<(), Failure> {
        self.staged_out.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn remote_timeout_still_stages_out() {
    let tools = TempDir::new().unwrap();
    let dir = TempDir::new().unwrap();
    let staging = Arc::new(CountingStaging::default());
    let mut settings = testing::settings_with(
        testing::fake_ssh(tools.path()),
        testing::loopback_discovery(testing::free_udp_port(), Duration::from_millis(10)),
    );
    settings.staging = staging.clone();

    let calculator = testing::calculator("ssh://cluster/sleep 5", 1, &settings);
    let case = testing::case(0, &[]);
    let started = Instant::now();
    let outcome = calculator.execute(&ExecutionRequest {
        case: &case,
        dir: dir.path(),
        timeout: Some(Duration::from_millis(200)),
    });

    assert!(started.elapsed() < Duration::from_secs(4));
    assert!(matches!(
        outcome,
        Outcome::Failure(Failure::Execution { status: None, .. })
    ));
    assert_eq!(staging.staged_out.load(Ordering::SeqCst), 1);
}

#[test]
fn cache_hits_and_misses() {
    let root = TempDir::new().unwrap();
    let store = ResultStore::open(root.path(), CaseNaming::Index).unwrap();

    let mut done = testing::case(0, &[("x", 1.0)]);
    done.status = CaseStatus::Succeeded;
    done.outputs
        .insert(String::from("y"), Some(Value::from(2.0)));
    store.persist(&done, None, None).unwrap();

    let mut failed = testing::case(1, &[("x", 2.0)]);
    failed.status = CaseStatus::Failed;
    failed.null_outputs([String::from("y")].iter());
    store.persist(&failed, None, None).unwrap();

    let cache = testing::calculator(
        &format!("cache://{}/*", root.path().display()),
        1,
        &testing::settings(),
    );
    let request = |case: &Case| {
        cache.execute(&ExecutionRequest {
            case,
            dir: root.path(),
            timeout: None,
        })
    };

    match request(&done) {
        Outcome::Success(success) => {
            assert_eq!(success.artifacts_dir, root.path().join("0"));
            assert_eq!(
                success.outputs.unwrap()["y"],
                Some(Value::from(2.0))
            );
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(request(&failed), Outcome::CacheMiss);
    assert_eq!(request(&testing::case(2, &[])), Outcome::CacheMiss);
}

#[test]
fn invalid_cache_glob_is_config_error() {
    let descriptor = CalculatorDescriptor::parse("cache://results/[", 1).unwrap();

    assert!(matches!(
        Calculators::load(descriptor, &testing::settings()),
        Err(ConfigErrors::InvalidEndpoint { .. })
    ));
}

fn start_daemon(work: &TempDir, udp_port: u16, command: &str) -> Daemon {
    let codes = IndexMap::from([(String::from("bash"), command.to_string())]);
    let mut config = DaemonConfig::new(codes, testing::shell(), work.path().to_path_buf());
    config.tcp_bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
    config.udp_port = udp_port;
    config.announce_to = IpAddr::V4(Ipv4Addr::LOCALHOST);
    config.interval = Duration::from_millis(50);

    Daemon::start(config).unwrap()
}

#[test]
fn daemon_by_address() {
    let work = TempDir::new().unwrap();
    let dir = TempDir::new().unwrap();
    let daemon = start_daemon(
        &work,
        testing::free_udp_port(),
        "echo $(( $(cat input.txt) * 3 )) > result.txt",
    );
    fs::write(dir.path().join("input.txt"), "5").unwrap();

    let calculator = testing::calculator(
        &format!("funz://127.0.0.1:{}/bash", daemon.address().port()),
        1,
        &testing::settings(),
    );
    let case = testing::case(0, &[]);
    let outcome = calculator.execute(&ExecutionRequest {
        case: &case,
        dir: dir.path(),
        timeout: Some(Duration::from_secs(10)),
    });

    assert!(outcome.is_success(), "{outcome}");
    assert_eq!(
        fs::read_to_string(dir.path().join("result.txt")).unwrap().trim(),
        "15"
    );
    assert!(dir.path().join("out.txt").is_file());

    daemon.shutdown();
}

#[test]
fn daemon_by_discovery() {
    let work = TempDir::new().unwrap();
    let dir = TempDir::new().unwrap();
    let udp_port = testing::free_udp_port();
    let daemon = start_daemon(&work, udp_port, "exit 4");

    let settings = testing::settings_with(
        Arc::new(crate::resolve::SearchPath::default()),
        testing::loopback_discovery(udp_port, Duration::from_millis(500)),
    );
    let case = testing::case(0, &[]);
    let request = ExecutionRequest {
        case: &case,
        dir: dir.path(),
        timeout: Some(Duration::from_secs(10)),
    };

    let calculator = testing::calculator("funz:///bash", 1, &settings);
    assert!(matches!(
        calculator.execute(&request),
        Outcome::Failure(Failure::Execution {
            status: Some(4),
            ..
        })
    ));

    let unknown = testing::calculator("funz:///python", 1, &settings);
    assert!(matches!(
        unknown.execute(&request),
        Outcome::Failure(Failure::Transport(_))
    ));

    daemon.shutdown();
}

#[test]
fn unreachable_daemon_is_transport_failure() {
    let dir = TempDir::new().unwrap();
    let port = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .unwrap()
        .local_addr()
        .unwrap()
        .port();

    let calculator = testing::calculator(
        &format!("funz://127.0.0.1:{port}/bash"),
        1,
        &testing::settings(),
    );
    let case = testing::case(0, &[]);

    assert!(matches!(
        calculator.execute(&ExecutionRequest {
            case: &case,
            dir: dir.path(),
            timeout: None,
        }),
        Outcome::Failure(Failure::Transport(_))
    ));
}

#[test]
fn busy_daemon_is_waited_for() {
    let work = TempDir::new().unwrap();
    let daemon = start_daemon(
        &work,
        testing::free_udp_port(),
        "sleep 0.3; echo done > result.txt",
    );
    let calculator = testing::calculator(
        &format!("funz://127.0.0.1:{}/bash", daemon.address().port()),
        2,
        &testing::settings(),
    );
    let dirs = [TempDir::new().unwrap(), TempDir::new().unwrap()];

    // capacity one: the second submission is rejected as busy until the first job is done
    let outcomes: Vec<Outcome> = std::thread::scope(|scope| {
        let handles: Vec<_> = dirs
            .iter()
            .enumerate()
            .map(|(index, dir)| {
                let calculator = &calculator;
                scope.spawn(move || {
                    let case = testing::case(index, &[]);
                    calculator.execute(&ExecutionRequest {
                        case: &case,
                        dir: dir.path(),
                        timeout: Some(Duration::from_secs(10)),
                    })
                })
            })
            .collect();

        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect()
    });

    assert!(outcomes.iter().all(Outcome::is_success), "{outcomes:?}");
    for dir in &dirs {
        assert!(dir.path().join("result.txt").is_file());
    }

    daemon.shutdown();
}
