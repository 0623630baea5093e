//! Messages exchanged with calculator daemons.
//!
//! Daemons announce themselves with a single JSON datagram per interval. Jobs are submitted
//! over TCP, one JSON message per line.

use ignore::WalkBuilder;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    fs,
    io::{BufRead, Write},
    path::{Component, Path},
};
use thiserror::Error;

pub const PROTOCOL_VERSION: &str = "funz/1";

/// rejection reason of a daemon running at capacity, clients move on to another daemon
pub const BUSY: &str = "busy";

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Connection failed")]
    Io(#[from] std::io::Error),
    #[error("Malformed message")]
    Json(#[from] serde_json::Error),
    #[error("Connection closed by peer")]
    Closed,
    #[error("Refusing file name {0}")]
    UnsafeFileName(String),
    #[error("Failed to collect files")]
    Walk(#[from] ignore::Error),
}

/// Periodic UDP broadcast of a daemon
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct Announcement {
    pub version: String,
    pub tcp_port: u16,
    pub codes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

impl Announcement {
    pub fn new(tcp_port: u16, codes: Vec<String>, hostname: Option<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            tcp_port,
            codes,
            hostname,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(datagram: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(datagram)?)
    }
}

/// A file of a job directory, names are relative to that directory
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct WireFile {
    pub name: String,
    pub content: Vec<u8>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Submit {
        code: String,
        case: String,
        files: Vec<WireFile>,
    },
    Poll {
        job: u64,
    },
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Accepted {
        job: u64,
    },
    Rejected {
        reason: String,
    },
    Running,
    Finished {
        exit_status: Option<i32>,
        files: Vec<WireFile>,
    },
    Unknown {
        job: u64,
    },
}

pub fn send<T: Serialize>(writer: &mut impl Write, message: &T) -> Result<(), ProtocolError> {
    serde_json::to_writer(&mut *writer, message)?;
    writer.write_all(b"\n")?;
    writer.flush()?;

    Ok(())
}

pub fn receive<T: DeserializeOwned>(reader: &mut impl BufRead) -> Result<T, ProtocolError> {
    let mut line = String::new();

    if reader.read_line(&mut line)? == 0 {
        return Err(ProtocolError::Closed);
    }

    Ok(serde_json::from_str(line.trim_end())?)
}

/// read every regular file below `dir`
pub fn collect_files(dir: &Path) -> Result<Vec<WireFile>, ProtocolError> {
    let mut files = Vec::new();

    for entry in WalkBuilder::new(dir)
        .standard_filters(false)
        .sort_by_file_name(|a, b| a.cmp(b))
        .build()
    {
        let entry = entry?;

        if !entry.file_type().map_or(false, |kind| kind.is_file()) {
            continue;
        }

        if let Ok(relative) = entry.path().strip_prefix(dir) {
            files.push(WireFile {
                name: relative.to_string_lossy().into_owned(),
                content: fs::read(entry.path())?,
            });
        }
    }

    Ok(files)
}

/// write `files` below `dir`, names escaping `dir` are refused
pub fn write_files(dir: &Path, files: &[WireFile]) -> Result<(), ProtocolError> {
    for file in files {
        let relative = Path::new(&file.name);
        let safe = !file.name.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));

        if !safe {
            return Err(ProtocolError::UnsafeFileName(file.name.clone()));
        }

        let target = dir.join(relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(target, &file.content)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufReader, Cursor};

    #[test]
    fn messages_are_line_delimited() {
        let mut buffer = Vec::new();
        send(&mut buffer, &Request::Poll { job: 7 }).unwrap();
        send(&mut buffer, &Response::Running).unwrap();

        assert_eq!(buffer.iter().filter(|byte| **byte == b'\n').count(), 2);

        let mut reader = BufReader::new(Cursor::new(buffer));
        assert_eq!(
            receive::<Request>(&mut reader).unwrap(),
            Request::Poll { job: 7 }
        );
        assert_eq!(receive::<Response>(&mut reader).unwrap(), Response::Running);
        assert!(matches!(
            receive::<Response>(&mut reader),
            Err(ProtocolError::Closed)
        ));
    }

    #[test]
    fn announcement_wire_format() {
        let announcement = Announcement::new(4242, vec![String::from("bash")], None);
        let decoded = Announcement::decode(
            br#"{"version":"funz/1","tcp_port":4242,"codes":["bash"]}"#,
        )
        .unwrap();

        assert_eq!(decoded, announcement);
        assert!(Announcement::decode(b"hello").is_err());
    }

    #[test]
    fn refuses_escaping_file_names() {
        let dir = tempfile::tempdir().unwrap();

        for name in ["../evil", "/etc/passwd", "", "a/../../b"] {
            let files = [WireFile {
                name: name.to_string(),
                content: Vec::new(),
            }];

            assert!(
                matches!(
                    write_files(dir.path(), &files),
                    Err(ProtocolError::UnsafeFileName(_))
                ),
                "{name} was accepted"
            );
        }
    }

    #[test]
    fn files_survive_a_round_trip_through_directories() {
        let source = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();
        fs::create_dir(source.path().join("sub")).unwrap();
        fs::write(source.path().join("input.txt"), "x=1").unwrap();
        fs::write(source.path().join("sub/data.bin"), [0u8, 255, 7]).unwrap();

        let files = collect_files(source.path()).unwrap();
        write_files(target.path(), &files).unwrap();

        assert_eq!(files.len(), 2);
        assert_eq!(
            fs::read(target.path().join("sub/data.bin")).unwrap(),
            vec![0u8, 255, 7]
        );
    }
}
