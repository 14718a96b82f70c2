use std::sync::Arc;

use serde::Serialize;

use crate::error::{GearError, Result};
use crate::protocol::{Packet, PacketType};

/// Opaque job identifier issued by the server in JOB_CREATED.
///
/// Only unique within one connection; pair it with the server address when
/// more than one server is involved.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobHandle(Vec<u8>);

impl JobHandle {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl From<&str> for JobHandle {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl Serialize for JobHandle {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

/// Point-in-time job status from STATUS_RES or WORK_STATUS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Status {
    pub handle: JobHandle,
    pub known: bool,
    pub running: bool,
    pub numerator: u64,
    /// Zero when the total is unknown.
    pub denominator: u64,
}

impl Status {
    pub(crate) fn from_status_res(packet: &Packet) -> Result<Self> {
        Ok(Self {
            handle: JobHandle::new(packet.arg(0)),
            known: parse_flag(packet.arg(1))?,
            running: parse_flag(packet.arg(2))?,
            numerator: parse_number(packet.arg(3))?,
            denominator: parse_number(packet.arg(4))?,
        })
    }

    /// Fraction complete, if the total is known.
    pub fn progress(&self) -> Option<f64> {
        if self.denominator == 0 {
            None
        } else {
            Some(self.numerator as f64 / self.denominator as f64)
        }
    }
}

fn parse_flag(bytes: &[u8]) -> Result<bool> {
    match bytes {
        b"1" => Ok(true),
        b"0" | b"" => Ok(false),
        other => Err(GearError::Protocol(format!(
            "expected 0 or 1, got {:?}",
            String::from_utf8_lossy(other)
        ))),
    }
}

fn parse_number(bytes: &[u8]) -> Result<u64> {
    if bytes.is_empty() {
        return Ok(0);
    }
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .ok_or_else(|| {
            GearError::Protocol(format!(
                "expected a number, got {:?}",
                String::from_utf8_lossy(bytes)
            ))
        })
}

/// A work event delivered to a foreground job's handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub packet_type: PacketType,
    pub handle: JobHandle,
    pub data: Vec<u8>,
    /// Denominator for WORK_STATUS; `data` holds the numerator.
    denominator: Option<Vec<u8>>,
}

impl Response {
    pub(crate) fn from_work_packet(mut packet: Packet) -> Self {
        let handle = JobHandle::new(packet.take_arg(0));
        let (data, denominator) = match packet.packet_type {
            PacketType::WorkStatus => (packet.take_arg(1), Some(packet.take_arg(2))),
            PacketType::WorkFail => (Vec::new(), None),
            _ => (packet.take_arg(1), None),
        };
        Self {
            packet_type: packet.packet_type,
            handle,
            data,
            denominator,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.packet_type.is_terminal()
    }

    /// Progress carried by a WORK_STATUS event.
    pub fn status(&self) -> Result<Status> {
        let denominator = match (&self.packet_type, &self.denominator) {
            (PacketType::WorkStatus, Some(denominator)) => denominator,
            _ => {
                return Err(GearError::Protocol(format!(
                    "{} does not carry a status",
                    self.packet_type
                )))
            }
        };
        Ok(Status {
            handle: self.handle.clone(),
            known: true,
            running: true,
            numerator: parse_number(&self.data)?,
            denominator: parse_number(denominator)?,
        })
    }
}

/// Per-job callback. Receives each work event in arrival order, or the
/// connection failure that replaces a missing terminal event.
pub type ResponseHandler = Box<dyn FnMut(std::result::Result<&Response, &GearError>) + Send + 'static>;

/// Observer for connection-level errors.
pub type ErrorHandler = Arc<dyn Fn(&GearError) + Send + Sync + 'static>;

#[cfg(test)]
mod tests {
    use super::*;

    fn status_res(fields: [&str; 5]) -> Packet {
        Packet::response(
            PacketType::StatusRes,
            fields.iter().map(|f| f.as_bytes().to_vec()).collect(),
        )
        .unwrap()
    }

    #[test]
    fn status_res_parses_all_fields() {
        let status = Status::from_status_res(&status_res(["H:1", "1", "1", "3", "10"])).unwrap();
        assert_eq!(status.handle, JobHandle::from("H:1"));
        assert!(status.known);
        assert!(status.running);
        assert_eq!(status.numerator, 3);
        assert_eq!(status.denominator, 10);
        assert_eq!(status.progress(), Some(0.3));
    }

    #[test]
    fn zero_denominator_means_unknown_progress() {
        let status = Status::from_status_res(&status_res(["H:2", "0", "0", "0", "0"])).unwrap();
        assert!(!status.known);
        assert!(status.progress().is_none());
    }

    #[test]
    fn bad_flag_is_protocol_error() {
        let result = Status::from_status_res(&status_res(["H:3", "yes", "0", "0", "0"]));
        assert!(matches!(result, Err(GearError::Protocol(_))));
    }

    #[test]
    fn work_status_response_exposes_progress() {
        let packet = Packet::response(
            PacketType::WorkStatus,
            vec![b"H:4".to_vec(), b"5".to_vec(), b"20".to_vec()],
        )
        .unwrap();
        let response = Response::from_work_packet(packet);
        let status = response.status().unwrap();
        assert_eq!(status.numerator, 5);
        assert_eq!(status.denominator, 20);
        assert!(!response.is_terminal());
    }

    #[test]
    fn complete_response_has_no_status() {
        let packet = Packet::response(
            PacketType::WorkComplete,
            vec![b"H:5".to_vec(), b"done".to_vec()],
        )
        .unwrap();
        let response = Response::from_work_packet(packet);
        assert_eq!(response.data, b"done");
        assert!(response.is_terminal());
        assert!(response.status().is_err());
    }
}
