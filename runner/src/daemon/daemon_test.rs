use super::*;
use crate::testing;
use tempfile::TempDir;

struct Client {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl Client {
    fn connect(address: SocketAddr) -> Self {
        let stream = TcpStream::connect(address).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();

        Self {
            writer: stream.try_clone().unwrap(),
            reader: BufReader::new(stream),
        }
    }

    fn call(&mut self, request: &Request) -> Response {
        protocol::send(&mut self.writer, request).unwrap();
        protocol::receive(&mut self.reader).unwrap()
    }

    fn submit(&mut self, code: &str, files: Vec<WireFile>) -> Response {
        self.call(&Request::Submit {
            code: code.to_string(),
            case: String::from("0"),
            files,
        })
    }

    fn wait(&mut self, job: u64) -> Response {
        let deadline = Instant::now() + Duration::from_secs(10);

        loop {
            match self.call(&Request::Poll { job }) {
                Response::Running if Instant::now() < deadline => {
                    thread::sleep(Duration::from_millis(20))
                }
                other => return other,
            }
        }
    }
}

fn start(work: &TempDir, udp_port: u16, capacity: usize) -> Daemon {
    let codes = IndexMap::from([
        (
            String::from("double"),
            String::from("echo $(( $(cat x) * 2 )) > y"),
        ),
        (String::from("slow"), String::from("sleep 1")),
    ]);
    let mut config = DaemonConfig::new(codes, testing::shell(), work.path().to_path_buf());
    config.tcp_bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
    config.udp_port = udp_port;
    config.announce_to = IpAddr::V4(Ipv4Addr::LOCALHOST);
    config.interval = Duration::from_millis(50);
    config.capacity = capacity;

    Daemon::start(config).unwrap()
}

fn file(name: &str, content: &str) -> WireFile {
    WireFile {
        name: name.to_string(),
        content: content.as_bytes().to_vec(),
    }
}

#[test]
fn runs_submitted_jobs() {
    let work = TempDir::new().unwrap();
    let daemon = start(&work, testing::free_udp_port(), 2);
    let mut client = Client::connect(daemon.address());

    let Response::Accepted { job } = client.submit("double", vec![file("x", "21")]) else {
        panic!("job was not accepted");
    };

    match client.wait(job) {
        Response::Finished { exit_status, files } => {
            assert_eq!(exit_status, Some(0));
            let names: Vec<&str> = files.iter().map(|file| file.name.as_str()).collect();
            assert!(names.contains(&"x"));
            assert!(names.contains(&"out.txt"));
            let y = files.iter().find(|file| file.name == "y").unwrap();
            assert_eq!(String::from_utf8_lossy(&y.content).trim(), "42");
        }
        other => panic!("unexpected response {other:?}"),
    }

    // results are handed out once, the job directory is gone
    assert_eq!(client.call(&Request::Poll { job }), Response::Unknown { job });
    assert!(!work.path().join(format!("job-{job}")).exists());

    daemon.shutdown();
}

#[test]
fn rejects_unknown_codes_and_unsafe_files() {
    let work = TempDir::new().unwrap();
    let daemon = start(&work, testing::free_udp_port(), 1);
    let mut client = Client::connect(daemon.address());

    assert!(matches!(
        client.submit("python", Vec::new()),
        Response::Rejected { .. }
    ));
    assert!(matches!(
        client.submit("double", vec![file("../escape", "1")]),
        Response::Rejected { .. }
    ));
    assert!(!work.path().join("escape").exists());

    // the rejected job did not take the only slot
    assert!(matches!(
        client.submit("double", vec![file("x", "1")]),
        Response::Accepted { .. }
    ));

    daemon.shutdown();
}

#[test]
fn rejects_submissions_beyond_capacity() {
    let work = TempDir::new().unwrap();
    let daemon = start(&work, testing::free_udp_port(), 1);
    let mut client = Client::connect(daemon.address());

    let Response::Accepted { job } = client.submit("slow", Vec::new()) else {
        panic!("job was not accepted");
    };
    assert_eq!(
        client.submit("slow", Vec::new()),
        Response::Rejected {
            reason: String::from(protocol::BUSY)
        }
    );

    assert!(matches!(
        client.wait(job),
        Response::Finished {
            exit_status: Some(0),
            ..
        }
    ));
    assert!(matches!(
        client.submit("double", vec![file("x", "1")]),
        Response::Accepted { .. }
    ));

    daemon.shutdown();
}

#[test]
fn announces_codes_and_port() {
    let work = TempDir::new().unwrap();
    let port = testing::free_udp_port();
    let listener = UdpSocket::bind((Ipv4Addr::LOCALHOST, port)).unwrap();
    listener
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let daemon = start(&work, port, 1);

    let mut buffer = [0u8; 4096];
    let (length, _) = listener.recv_from(&mut buffer).unwrap();
    let announcement = Announcement::decode(&buffer[..length]).unwrap();

    assert_eq!(announcement.version, protocol::PROTOCOL_VERSION);
    assert_eq!(announcement.tcp_port, daemon.address().port());
    assert_eq!(
        announcement.codes,
        vec![String::from("double"), String::from("slow")]
    );

    daemon.shutdown();
}

#[test]
fn needs_codes() {
    let work = TempDir::new().unwrap();
    let config = DaemonConfig::new(IndexMap::new(), testing::shell(), work.path().to_path_buf());

    assert!(matches!(Daemon::start(config), Err(DaemonError::NoCodes)));
}

#[test]
fn forgets_jobs_of_closed_connections() {
    let work = TempDir::new().unwrap();
    let daemon = start(&work, testing::free_udp_port(), 2);

    {
        let mut client = Client::connect(daemon.address());
        assert!(matches!(
            client.submit("double", vec![file("x", "1")]),
            Response::Accepted { .. }
        ));
        assert!(matches!(
            client.submit("slow", Vec::new()),
            Response::Accepted { .. }
        ));
        thread::sleep(Duration::from_millis(300));
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        {
            let table = daemon.jobs.lock();
            if table.jobs.is_empty() && table.abandoned.is_empty() {
                assert_eq!(table.running, 0);
                break;
            }
        }
        assert!(
            Instant::now() < deadline,
            "results of a closed connection are still held"
        );
        thread::sleep(Duration::from_millis(20));
    }

    // both slots are free again
    let mut client = Client::connect(daemon.address());
    assert!(matches!(
        client.submit("slow", Vec::new()),
        Response::Accepted { .. }
    ));
    assert!(matches!(
        client.submit("slow", Vec::new()),
        Response::Accepted { .. }
    ));

    daemon.shutdown();
}
