use super::{
    CalculatorDescriptor, CalculatorSettings, DaemonTarget, ExecutionRequest, Failure, Outcome,
    Success,
};
use crate::{
    discovery::DiscoveryService,
    protocol::{self, ProtocolError, Request, Response, WireFile},
};
use std::{
    io::BufReader,
    net::{SocketAddr, TcpStream, ToSocketAddrs},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, instrument, trace};

/// lower bound for reading a single response of a daemon
const MIN_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

impl From<ProtocolError> for Failure {
    fn from(error: ProtocolError) -> Self {
        match error {
            ProtocolError::Io(error) => Failure::Transport(format!("daemon connection: {error}")),
            other => Failure::Transport(other.to_string()),
        }
    }
}

/// A job accepted by a daemon, polled over the connection it was submitted on
struct Placement {
    address: SocketAddr,
    job: u64,
    writer: TcpStream,
    reader: BufReader<TcpStream>,
}

enum Offer {
    Accepted(Placement),
    Busy,
}

/// Calculator submitting cases to daemons, either a fixed one or every discovered daemon
/// offering the code
#[derive(Debug)]
pub struct DaemonCalculator {
    pub(super) descriptor: CalculatorDescriptor,
    target: DaemonTarget,
    code: String,
    discovery: Arc<DiscoveryService>,
    /// first candidate of the next submission, slots sharing the calculator start apart
    next: AtomicUsize,
    connect_timeout: Duration,
    poll_interval: Duration,
}

impl DaemonCalculator {
    pub fn load(
        descriptor: CalculatorDescriptor,
        target: DaemonTarget,
        code: String,
        settings: &CalculatorSettings,
    ) -> Self {
        Self {
            descriptor,
            target,
            code,
            discovery: settings.discovery.clone(),
            next: AtomicUsize::new(0),
            connect_timeout: settings.connect_timeout,
            poll_interval: settings.poll_interval,
        }
    }

    /// Daemons able to run the code, rotated by one on every call
    pub fn candidates(&self) -> Result<Vec<SocketAddr>, Failure> {
        let mut addresses: Vec<SocketAddr> = match &self.target {
            DaemonTarget::Direct(address) => address
                .to_socket_addrs()
                .map_err(|error| Failure::Transport(format!("cannot resolve {address}: {error}")))?
                .collect(),
            DaemonTarget::Discover { udp_port } => self
                .discovery
                .resolve(*udp_port, &self.code)
                .map_err(|error| Failure::Transport(error.to_string()))?,
        };

        if addresses.is_empty() {
            return Err(Failure::Transport(format!(
                "no daemon offers code '{}'",
                self.code
            )));
        }

        let first = self.next.fetch_add(1, Ordering::Relaxed) % addresses.len();
        addresses.rotate_left(first);

        Ok(addresses)
    }

    #[instrument(skip_all, fields(case = request.case.index, calculator = %self.descriptor), level = "debug")]
    pub fn execute(&self, request: &ExecutionRequest) -> Outcome {
        match self.submit(request) {
            Ok(outcome) => outcome,
            Err(failure) => Outcome::Failure(failure),
        }
    }

    fn submit(&self, request: &ExecutionRequest) -> Result<Outcome, Failure> {
        let files = protocol::collect_files(request.dir)?;
        let started = Instant::now();

        let Placement {
            address,
            job,
            mut writer,
            mut reader,
        } = self.place(request, &files, started)?;
        debug!(job = job, address = %address, "Submitted case");

        loop {
            expired(request.timeout, started)?;

            thread::sleep(self.poll_interval);
            protocol::send(&mut writer, &Request::Poll { job })?;

            match protocol::receive::<Response>(&mut reader)? {
                Response::Running => continue,
                Response::Finished { exit_status, files } => {
                    protocol::write_files(request.dir, &files)?;

                    return Ok(match exit_status {
                        Some(0) => Outcome::Success(Success {
                            artifacts_dir: request.dir.to_path_buf(),
                            exit_status,
                            outputs: None,
                        }),
                        status => Outcome::Failure(Failure::Execution {
                            status,
                            message: format!("code '{}' failed on {address}", self.code),
                        }),
                    });
                }
                Response::Unknown { job } => {
                    return Err(Failure::Transport(format!("{address} lost job {job}")))
                }
                other => {
                    return Err(Failure::Transport(format!(
                        "unexpected response to poll: {other:?}"
                    )))
                }
            }
        }
    }

    /// Offer the job to every candidate in turn. A busy daemon passes the job on, while all
    /// of them are busy the round repeats until one frees up or the timeout expires.
    fn place(
        &self,
        request: &ExecutionRequest,
        files: &[WireFile],
        started: Instant,
    ) -> Result<Placement, Failure> {
        loop {
            let mut busy = 0;
            let mut problems = Vec::new();

            for address in self.candidates()? {
                match self.offer(address, request, files) {
                    Ok(Offer::Accepted(placement)) => return Ok(placement),
                    Ok(Offer::Busy) => {
                        trace!(address = %address, "Daemon is busy");
                        busy += 1;
                    }
                    Err(failure) => {
                        debug!(address = %address, failure = %failure, "Daemon did not take the job");
                        problems.push(failure.to_string());
                    }
                }
            }

            if busy == 0 {
                return Err(Failure::Transport(problems.join("; ")));
            }

            expired(request.timeout, started)?;
            thread::sleep(self.poll_interval);
        }
    }

    fn offer(
        &self,
        address: SocketAddr,
        request: &ExecutionRequest,
        files: &[WireFile],
    ) -> Result<Offer, Failure> {
        let stream = TcpStream::connect_timeout(&address, self.connect_timeout).map_err(|error| {
            if let DaemonTarget::Discover { udp_port } = &self.target {
                self.discovery.forget(*udp_port, address);
            }
            Failure::Transport(format!("cannot connect to {address}: {error}"))
        })?;
        stream
            .set_read_timeout(Some(self.connect_timeout.max(MIN_RESPONSE_TIMEOUT)))
            .map_err(ProtocolError::from)?;

        let mut writer = stream.try_clone().map_err(ProtocolError::from)?;
        let mut reader = BufReader::new(stream);

        protocol::send(
            &mut writer,
            &Request::Submit {
                code: self.code.clone(),
                case: request.case.index.to_string(),
                files: files.to_vec(),
            },
        )?;

        match protocol::receive::<Response>(&mut reader)? {
            Response::Accepted { job } => Ok(Offer::Accepted(Placement {
                address,
                job,
                writer,
                reader,
            })),
            Response::Rejected { reason } if reason == protocol::BUSY => Ok(Offer::Busy),
            Response::Rejected { reason } => Err(Failure::Transport(format!(
                "{address} rejected job: {reason}"
            ))),
            other => Err(Failure::Transport(format!(
                "unexpected response to submit: {other:?}"
            ))),
        }
    }
}

fn expired(timeout: Option<Duration>, started: Instant) -> Result<(), Failure> {
    match timeout {
        Some(timeout) if started.elapsed() > timeout => Err(Failure::Execution {
            status: None,
            message: format!("timeout after {} s", timeout.as_secs_f64()),
        }),
        _ => Ok(()),
    }
}
