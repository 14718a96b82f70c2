//! Packet model for the job-server wire protocol.
//!
//! Every frame carries a [`Magic`] marking its direction, a [`PacketType`],
//! and a fixed number of byte-string arguments for that type.

use crate::error::{GearError, Result};

/// Direction marker at the start of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Magic {
    /// `"\0REQ"`, client to server.
    Request,
    /// `"\0RES"`, server to client.
    Response,
}

impl Magic {
    pub const REQUEST_BYTES: [u8; 4] = *b"\0REQ";
    pub const RESPONSE_BYTES: [u8; 4] = *b"\0RES";

    pub fn as_bytes(self) -> [u8; 4] {
        match self {
            Magic::Request => Self::REQUEST_BYTES,
            Magic::Response => Self::RESPONSE_BYTES,
        }
    }

    pub fn from_bytes(bytes: [u8; 4]) -> Result<Self> {
        match bytes {
            Self::REQUEST_BYTES => Ok(Magic::Request),
            Self::RESPONSE_BYTES => Ok(Magic::Response),
            other => Err(GearError::Framing(format!("unrecognized magic {:02x?}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    SubmitJob,
    JobCreated,
    WorkStatus,
    WorkComplete,
    WorkFail,
    GetStatus,
    EchoReq,
    EchoRes,
    SubmitJobBg,
    Error,
    StatusRes,
    SubmitJobHigh,
    WorkException,
    WorkData,
    WorkWarning,
    SubmitJobHighBg,
    SubmitJobLow,
    SubmitJobLowBg,
    SubmitJobSched,
    SubmitJobEpoch,
}

impl PacketType {
    pub fn code(self) -> u32 {
        match self {
            PacketType::SubmitJob => 7,
            PacketType::JobCreated => 8,
            PacketType::WorkStatus => 12,
            PacketType::WorkComplete => 13,
            PacketType::WorkFail => 14,
            PacketType::GetStatus => 15,
            PacketType::EchoReq => 16,
            PacketType::EchoRes => 17,
            PacketType::SubmitJobBg => 18,
            PacketType::Error => 19,
            PacketType::StatusRes => 20,
            PacketType::SubmitJobHigh => 21,
            PacketType::WorkException => 25,
            PacketType::WorkData => 28,
            PacketType::WorkWarning => 29,
            PacketType::SubmitJobHighBg => 32,
            PacketType::SubmitJobLow => 33,
            PacketType::SubmitJobLowBg => 34,
            PacketType::SubmitJobSched => 35,
            PacketType::SubmitJobEpoch => 36,
        }
    }

    pub fn from_code(code: u32) -> Result<Self> {
        let packet_type = match code {
            7 => PacketType::SubmitJob,
            8 => PacketType::JobCreated,
            12 => PacketType::WorkStatus,
            13 => PacketType::WorkComplete,
            14 => PacketType::WorkFail,
            15 => PacketType::GetStatus,
            16 => PacketType::EchoReq,
            17 => PacketType::EchoRes,
            18 => PacketType::SubmitJobBg,
            19 => PacketType::Error,
            20 => PacketType::StatusRes,
            21 => PacketType::SubmitJobHigh,
            25 => PacketType::WorkException,
            28 => PacketType::WorkData,
            29 => PacketType::WorkWarning,
            32 => PacketType::SubmitJobHighBg,
            33 => PacketType::SubmitJobLow,
            34 => PacketType::SubmitJobLowBg,
            35 => PacketType::SubmitJobSched,
            36 => PacketType::SubmitJobEpoch,
            other => {
                return Err(GearError::Framing(format!("unknown packet type {}", other)));
            }
        };
        Ok(packet_type)
    }

    /// Number of NUL-separated arguments this packet type carries.
    pub fn arg_count(self) -> usize {
        match self {
            PacketType::SubmitJob
            | PacketType::SubmitJobBg
            | PacketType::SubmitJobHigh
            | PacketType::SubmitJobHighBg
            | PacketType::SubmitJobLow
            | PacketType::SubmitJobLowBg => 3,
            PacketType::SubmitJobSched => 8,
            PacketType::SubmitJobEpoch => 4,
            PacketType::JobCreated
            | PacketType::WorkFail
            | PacketType::GetStatus
            | PacketType::EchoReq
            | PacketType::EchoRes => 1,
            PacketType::WorkStatus => 3,
            PacketType::WorkComplete
            | PacketType::WorkException
            | PacketType::WorkData
            | PacketType::WorkWarning
            | PacketType::Error => 2,
            PacketType::StatusRes => 5,
        }
    }

    /// Work events routed to a job's handler by handle.
    pub fn is_work_event(self) -> bool {
        matches!(
            self,
            PacketType::WorkStatus
                | PacketType::WorkComplete
                | PacketType::WorkFail
                | PacketType::WorkException
                | PacketType::WorkData
                | PacketType::WorkWarning
        )
    }

    /// Work events after which no more packets arrive for the handle.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PacketType::WorkComplete | PacketType::WorkFail | PacketType::WorkException
        )
    }
}

impl std::fmt::Display for PacketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PacketType::SubmitJob => "SUBMIT_JOB",
            PacketType::JobCreated => "JOB_CREATED",
            PacketType::WorkStatus => "WORK_STATUS",
            PacketType::WorkComplete => "WORK_COMPLETE",
            PacketType::WorkFail => "WORK_FAIL",
            PacketType::GetStatus => "GET_STATUS",
            PacketType::EchoReq => "ECHO_REQ",
            PacketType::EchoRes => "ECHO_RES",
            PacketType::SubmitJobBg => "SUBMIT_JOB_BG",
            PacketType::Error => "ERROR",
            PacketType::StatusRes => "STATUS_RES",
            PacketType::SubmitJobHigh => "SUBMIT_JOB_HIGH",
            PacketType::WorkException => "WORK_EXCEPTION",
            PacketType::WorkData => "WORK_DATA",
            PacketType::WorkWarning => "WORK_WARNING",
            PacketType::SubmitJobHighBg => "SUBMIT_JOB_HIGH_BG",
            PacketType::SubmitJobLow => "SUBMIT_JOB_LOW",
            PacketType::SubmitJobLowBg => "SUBMIT_JOB_LOW_BG",
            PacketType::SubmitJobSched => "SUBMIT_JOB_SCHED",
            PacketType::SubmitJobEpoch => "SUBMIT_JOB_EPOCH",
        };
        f.pad(name)
    }
}

/// A decoded or to-be-encoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub magic: Magic,
    pub packet_type: PacketType,
    pub args: Vec<Vec<u8>>,
}

impl Packet {
    /// Build a request packet, checking the argument count for its type.
    pub fn request(packet_type: PacketType, args: Vec<Vec<u8>>) -> Result<Self> {
        Self::new(Magic::Request, packet_type, args)
    }

    pub fn response(packet_type: PacketType, args: Vec<Vec<u8>>) -> Result<Self> {
        Self::new(Magic::Response, packet_type, args)
    }

    pub fn new(magic: Magic, packet_type: PacketType, args: Vec<Vec<u8>>) -> Result<Self> {
        if args.len() != packet_type.arg_count() {
            return Err(GearError::Framing(format!(
                "{} expects {} arguments, got {}",
                packet_type,
                packet_type.arg_count(),
                args.len()
            )));
        }
        Ok(Self {
            magic,
            packet_type,
            args,
        })
    }

    pub fn arg(&self, index: usize) -> &[u8] {
        self.args.get(index).map(Vec::as_slice).unwrap_or_default()
    }

    /// Take ownership of one argument, leaving an empty slot behind.
    pub fn take_arg(&mut self, index: usize) -> Vec<u8> {
        self.args
            .get_mut(index)
            .map(std::mem::take)
            .unwrap_or_default()
    }
}

/// Priority for foreground and background submissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JobPriority {
    High,
    #[default]
    Normal,
    Low,
}

impl JobPriority {
    pub fn foreground_packet(self) -> PacketType {
        match self {
            JobPriority::High => PacketType::SubmitJobHigh,
            JobPriority::Normal => PacketType::SubmitJob,
            JobPriority::Low => PacketType::SubmitJobLow,
        }
    }

    pub fn background_packet(self) -> PacketType {
        match self {
            JobPriority::High => PacketType::SubmitJobHighBg,
            JobPriority::Normal => PacketType::SubmitJobBg,
            JobPriority::Low => PacketType::SubmitJobLowBg,
        }
    }
}

impl std::fmt::Display for JobPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobPriority::High => write!(f, "high"),
            JobPriority::Normal => write!(f, "normal"),
            JobPriority::Low => write!(f, "low"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [PacketType; 20] = [
        PacketType::SubmitJob,
        PacketType::JobCreated,
        PacketType::WorkStatus,
        PacketType::WorkComplete,
        PacketType::WorkFail,
        PacketType::GetStatus,
        PacketType::EchoReq,
        PacketType::EchoRes,
        PacketType::SubmitJobBg,
        PacketType::Error,
        PacketType::StatusRes,
        PacketType::SubmitJobHigh,
        PacketType::WorkException,
        PacketType::WorkData,
        PacketType::WorkWarning,
        PacketType::SubmitJobHighBg,
        PacketType::SubmitJobLow,
        PacketType::SubmitJobLowBg,
        PacketType::SubmitJobSched,
        PacketType::SubmitJobEpoch,
    ];

    #[test]
    fn codes_map_back_to_types() {
        for packet_type in ALL {
            assert_eq!(PacketType::from_code(packet_type.code()).unwrap(), packet_type);
        }
    }

    #[test]
    fn unknown_code_is_framing_error() {
        assert!(matches!(
            PacketType::from_code(99),
            Err(GearError::Framing(_))
        ));
    }

    #[test]
    fn magic_rejects_garbage() {
        assert_eq!(Magic::from_bytes(*b"\0REQ").unwrap(), Magic::Request);
        assert_eq!(Magic::from_bytes(*b"\0RES").unwrap(), Magic::Response);
        assert!(Magic::from_bytes(*b"HTTP").is_err());
    }

    #[test]
    fn terminal_types_are_work_events() {
        for packet_type in ALL.iter().filter(|t| t.is_terminal()) {
            assert!(packet_type.is_work_event());
        }
        assert!(!PacketType::WorkData.is_terminal());
        assert!(!PacketType::JobCreated.is_work_event());
    }

    #[test]
    fn wrong_arg_count_is_rejected() {
        let result = Packet::request(PacketType::SubmitJob, vec![b"f".to_vec()]);
        assert!(matches!(result, Err(GearError::Framing(_))));
    }

    #[test]
    fn priority_selects_packet_subtype() {
        assert_eq!(JobPriority::High.foreground_packet(), PacketType::SubmitJobHigh);
        assert_eq!(JobPriority::Normal.foreground_packet(), PacketType::SubmitJob);
        assert_eq!(JobPriority::Low.background_packet(), PacketType::SubmitJobLowBg);
        assert_eq!(JobPriority::default(), JobPriority::Normal);
    }
}
