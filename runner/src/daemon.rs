//! Calculator daemon: announces its codes over UDP and runs submitted jobs.

#[cfg(test)]
mod daemon_test;

use crate::{
    calculators::local::run_shell,
    protocol::{self, Announcement, ProtocolError, Request, Response, WireFile},
};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::{
    collections::{HashMap, HashSet},
    fs,
    io::{BufReader, ErrorKind},
    net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream, UdpSocket},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

/// how often blocking loops check for shutdown
const STOP_CHECK: Duration = Duration::from_millis(20);

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Failed to bind {0}")]
    Bind(String, #[source] std::io::Error),
    #[error("Failed to prepare daemon")]
    Io(#[from] std::io::Error),
    #[error("Daemon has no codes to offer")]
    NoCodes,
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// code name -> shell command run inside the job directory
    pub codes: IndexMap<String, String>,
    pub shell: PathBuf,
    pub work_root: PathBuf,
    /// jobs running at the same time, further submissions are rejected
    pub capacity: usize,
    pub tcp_bind: SocketAddr,
    pub udp_port: u16,
    /// destination of announcements, the limited broadcast address by default
    pub announce_to: IpAddr,
    pub interval: Duration,
    pub job_timeout: Option<Duration>,
}

impl DaemonConfig {
    pub fn new(codes: IndexMap<String, String>, shell: PathBuf, work_root: PathBuf) -> Self {
        Self {
            codes,
            shell,
            work_root,
            capacity: 1,
            tcp_bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            udp_port: 19001,
            announce_to: IpAddr::V4(Ipv4Addr::BROADCAST),
            interval: Duration::from_secs(1),
            job_timeout: None,
        }
    }
}

#[derive(Debug, Clone)]
enum JobState {
    Running,
    Finished {
        exit_status: Option<i32>,
        files: Vec<WireFile>,
    },
}

#[derive(Debug, Default)]
struct JobTable {
    next: u64,
    running: usize,
    jobs: HashMap<u64, JobState>,
    /// still running, but the connection that submitted them is gone
    abandoned: HashSet<u64>,
}

impl JobTable {
    /// drop whatever `submitted` left behind, results nobody can poll anymore
    fn abandon(&mut self, submitted: &[u64]) {
        for job in submitted {
            match self.jobs.remove(job) {
                Some(JobState::Running) => {
                    self.abandoned.insert(*job);
                }
                Some(JobState::Finished { .. }) => debug!(job = *job, "Dropped unpolled result"),
                None => {}
            }
        }
    }
}

/// Running daemon, stopped when dropped
#[derive(Debug)]
pub struct Daemon {
    address: SocketAddr,
    stop: Arc<AtomicBool>,
    jobs: Arc<Mutex<JobTable>>,
    threads: Vec<JoinHandle<()>>,
}

impl Daemon {
    pub fn start(config: DaemonConfig) -> Result<Self, DaemonError> {
        if config.codes.is_empty() {
            return Err(DaemonError::NoCodes);
        }

        fs::create_dir_all(&config.work_root)?;

        let listener = TcpListener::bind(config.tcp_bind)
            .map_err(|error| DaemonError::Bind(config.tcp_bind.to_string(), error))?;
        listener.set_nonblocking(true)?;
        let address = listener.local_addr()?;

        let announcer = UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))
            .map_err(|error| DaemonError::Bind(String::from("udp announcer"), error))?;
        announcer.set_broadcast(true)?;

        let hostname = nix::unistd::gethostname()
            .ok()
            .and_then(|name| name.into_string().ok());
        let announcement = Announcement::new(
            address.port(),
            config.codes.keys().cloned().collect(),
            hostname,
        );

        info!(
            address = %address,
            codes = ?config.codes.keys().collect::<Vec<_>>(),
            udp_port = config.udp_port,
            "Starting daemon"
        );

        let stop = Arc::new(AtomicBool::new(false));
        let config = Arc::new(config);
        let jobs = Arc::new(Mutex::new(JobTable::default()));

        let threads = vec![
            {
                let stop = stop.clone();
                let config = config.clone();
                thread::spawn(move || announce(announcer, announcement, &config, &stop))
            },
            {
                let stop = stop.clone();
                let jobs = jobs.clone();
                thread::spawn(move || accept(listener, config, jobs, &stop))
            },
        ];

        Ok(Self {
            address,
            stop,
            jobs,
            threads,
        })
    }

    /// address of the job socket
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// block until the daemon stops
    pub fn wait(mut self) {
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                error!("Daemon thread panicked");
            }
        }
    }

    pub fn shutdown(self) {
        debug!(jobs = self.jobs.lock().jobs.len(), "Stopping daemon");
        self.stop.store(true, Ordering::SeqCst);
        self.wait();
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

fn announce(socket: UdpSocket, announcement: Announcement, config: &DaemonConfig, stop: &AtomicBool) {
    let datagram = match announcement.encode() {
        Ok(datagram) => datagram,
        Err(error) => {
            error!(error = %error, "Failed to encode announcement");
            return;
        }
    };
    let destination = SocketAddr::new(config.announce_to, config.udp_port);

    while !stop.load(Ordering::SeqCst) {
        match socket.send_to(&datagram, destination) {
            Ok(_) => trace!(destination = %destination, "Sent announcement"),
            Err(error) => warn!(destination = %destination, error = %error, "Failed to announce"),
        }

        let next = Instant::now() + config.interval;
        while Instant::now() < next && !stop.load(Ordering::SeqCst) {
            thread::sleep(STOP_CHECK.min(config.interval));
        }
    }
}

fn accept(
    listener: TcpListener,
    config: Arc<DaemonConfig>,
    jobs: Arc<Mutex<JobTable>>,
    stop: &AtomicBool,
) {
    while !stop.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!(peer = %peer, "Accepted connection");
                let config = config.clone();
                let jobs = jobs.clone();

                thread::spawn(move || {
                    if let Err(error) = serve(stream, &config, &jobs) {
                        warn!(peer = %peer, error = %error, "Connection failed");
                    }
                });
            }
            Err(error) if error.kind() == ErrorKind::WouldBlock => thread::sleep(STOP_CHECK),
            Err(error) => {
                warn!(error = %error, "Failed to accept connection");
                thread::sleep(STOP_CHECK);
            }
        }
    }
}

/// Jobs submitted over a connection live as long as it, their results are only ever polled there
fn serve(
    stream: TcpStream,
    config: &Arc<DaemonConfig>,
    jobs: &Arc<Mutex<JobTable>>,
) -> Result<(), ProtocolError> {
    let mut submitted = Vec::new();
    let served = exchange(stream, config, jobs, &mut submitted);
    jobs.lock().abandon(&submitted);

    served
}

fn exchange(
    stream: TcpStream,
    config: &Arc<DaemonConfig>,
    jobs: &Arc<Mutex<JobTable>>,
    submitted: &mut Vec<u64>,
) -> Result<(), ProtocolError> {
    stream.set_nonblocking(false)?;
    let mut writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream);

    loop {
        let request = match protocol::receive::<Request>(&mut reader) {
            Ok(request) => request,
            Err(ProtocolError::Closed) => return Ok(()),
            Err(error) => return Err(error),
        };

        let response = match request {
            Request::Submit { code, case, files } => {
                let response = submit(config, jobs, &code, &case, files);
                if let Response::Accepted { job } = &response {
                    submitted.push(*job);
                }
                response
            }
            Request::Poll { job } => poll(jobs, job),
        };

        protocol::send(&mut writer, &response)?;
    }
}

fn submit(
    config: &Arc<DaemonConfig>,
    jobs: &Arc<Mutex<JobTable>>,
    code: &str,
    case: &str,
    files: Vec<WireFile>,
) -> Response {
    let Some(command) = config.codes.get(code).cloned() else {
        return Response::Rejected {
            reason: format!("unknown code '{code}'"),
        };
    };

    let job = {
        let mut table = jobs.lock();

        if table.running >= config.capacity {
            return Response::Rejected {
                reason: String::from(protocol::BUSY),
            };
        }

        table.next += 1;
        table.running += 1;
        let job = table.next;
        table.jobs.insert(job, JobState::Running);

        job
    };

    let dir = config.work_root.join(format!("job-{job}"));
    let prepared = fs::create_dir_all(&dir)
        .map_err(ProtocolError::from)
        .and_then(|_| protocol::write_files(&dir, &files));

    if let Err(error) = prepared {
        if let Err(error) = fs::remove_dir_all(&dir) {
            debug!(job = job, error = %error, "Failed to remove rejected job directory");
        }

        let mut table = jobs.lock();
        table.running -= 1;
        table.jobs.remove(&job);

        return Response::Rejected {
            reason: format!("failed to prepare job: {error}"),
        };
    }

    info!(job = job, case = case, code = code, "Running job");

    let config = config.clone();
    let jobs = jobs.clone();
    thread::spawn(move || {
        let exit_status = match run_shell(&config.shell, &command, &dir, config.job_timeout) {
            Ok(status) => status.code(),
            Err(failure) => {
                warn!(job = job, failure = %failure, "Job failed to run");
                None
            }
        };
        let files = protocol::collect_files(&dir).unwrap_or_else(|error| {
            warn!(job = job, error = %error, "Failed to collect job files");
            Vec::new()
        });

        if let Err(error) = fs::remove_dir_all(&dir) {
            warn!(job = job, error = %error, "Failed to remove job directory");
        }

        let mut table = jobs.lock();
        table.running -= 1;
        if table.abandoned.remove(&job) {
            debug!(job = job, exit_status = ?exit_status, "Abandoned job finished");
        } else {
            table
                .jobs
                .insert(job, JobState::Finished { exit_status, files });
            debug!(job = job, exit_status = ?exit_status, "Job finished");
        }
    });

    Response::Accepted { job }
}

/// finished jobs are handed out once
fn poll(jobs: &Arc<Mutex<JobTable>>, job: u64) -> Response {
    let mut table = jobs.lock();

    match table.jobs.get(&job) {
        None => Response::Unknown { job },
        Some(JobState::Running) => Response::Running,
        Some(JobState::Finished { .. }) => match table.jobs.remove(&job) {
            Some(JobState::Finished { exit_status, files }) => {
                Response::Finished { exit_status, files }
            }
            _ => Response::Unknown { job },
        },
    }
}
