//! Wire-level types for the smart protocol: service names, capabilities,
//! ref commands, and the protocol error surface.

use std::fmt;
use std::str::FromStr;

use crate::hash::ZERO_ID;

/// Protocol error types
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Invalid service: {0}")]
    InvalidService(String),

    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Pack error: {0}")]
    Pack(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl ProtocolError {
    pub fn invalid_request(msg: &str) -> Self {
        ProtocolError::InvalidRequest(msg.to_string())
    }

    pub fn storage_error(msg: String) -> Self {
        ProtocolError::Storage(msg)
    }
}

impl From<crate::errors::GitError> for ProtocolError {
    fn from(err: crate::errors::GitError) -> Self {
        match err {
            crate::errors::GitError::ObjectNotFound(o) => ProtocolError::ObjectNotFound(o),
            crate::errors::GitError::InvalidPackHeader(m)
            | crate::errors::GitError::InvalidPackFile(m) => ProtocolError::Pack(m),
            other => ProtocolError::Storage(other.to_string()),
        }
    }
}

/// Git service types for the smart protocol.
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum ServiceType {
    UploadPack,
    ReceivePack,
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ServiceType::UploadPack => write!(f, "git-upload-pack"),
            ServiceType::ReceivePack => write!(f, "git-receive-pack"),
        }
    }
}

impl FromStr for ServiceType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "git-upload-pack" => Ok(ServiceType::UploadPack),
            "git-receive-pack" => Ok(ServiceType::ReceivePack),
            _ => Err(ProtocolError::InvalidService(s.to_string())),
        }
    }
}

/// The subset of protocol capabilities this server understands. Anything else
/// is preserved as `Unknown` for forward compatibility.
#[derive(Debug, Clone, PartialEq)]
pub enum Capability {
    ReportStatus,
    DeleteRefs,
    Atomic,
    OfsDelta,
    SideBand64k,
    NoThin,
    Agent(String),
    Unknown(String),
}

impl FromStr for Capability {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix("agent=") {
            return Ok(Capability::Agent(rest.to_string()));
        }
        match s {
            "report-status" => Ok(Capability::ReportStatus),
            "delete-refs" => Ok(Capability::DeleteRefs),
            "atomic" => Ok(Capability::Atomic),
            "ofs-delta" => Ok(Capability::OfsDelta),
            "side-band-64k" => Ok(Capability::SideBand64k),
            "no-thin" => Ok(Capability::NoThin),
            _ => Ok(Capability::Unknown(s.to_string())),
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::ReportStatus => write!(f, "report-status"),
            Capability::DeleteRefs => write!(f, "delete-refs"),
            Capability::Atomic => write!(f, "atomic"),
            Capability::OfsDelta => write!(f, "ofs-delta"),
            Capability::SideBand64k => write!(f, "side-band-64k"),
            Capability::NoThin => write!(f, "no-thin"),
            Capability::Agent(agent) => write!(f, "agent={agent}"),
            Capability::Unknown(s) => write!(f, "{s}"),
        }
    }
}

/// Reference command for push operations, parsed from `<old> <new> <ref>`.
#[derive(Debug, Clone)]
pub struct RefCommand {
    pub old_hash: String,
    pub new_hash: String,
    pub ref_name: String,
    pub status: CommandStatus,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandStatus {
    Pending,
    Success,
    Failed,
}

impl RefCommand {
    pub fn new(old_hash: String, new_hash: String, ref_name: String) -> Self {
        Self {
            old_hash,
            new_hash,
            ref_name,
            status: CommandStatus::Pending,
            error_message: None,
        }
    }

    pub fn is_delete(&self) -> bool {
        self.new_hash == ZERO_ID
    }

    pub fn failed(&mut self, error: String) {
        self.status = CommandStatus::Failed;
        self.error_message = Some(error);
    }

    pub fn success(&mut self) {
        self.status = CommandStatus::Success;
        self.error_message = None;
    }

    /// The per-ref line of the report-status stream.
    pub fn get_status(&self) -> String {
        match &self.status {
            CommandStatus::Failed => {
                let error = self.error_message.as_deref().unwrap_or("unknown error");
                format!("ng {} {}", self.ref_name, error)
            }
            _ => format!("ok {}", self.ref_name),
        }
    }
}

/// Protocol constants
pub const LF: char = '\n';
pub const SP: char = ' ';
pub const NUL: char = '\0';
pub const PKT_LINE_END_MARKER: &[u8; 4] = b"0000";

// Capability lists advertised per service.
pub const RECEIVE_CAP_LIST: &str = "report-status delete-refs atomic no-thin ";
pub const UPLOAD_CAP_LIST: &str = "multi_ack_detailed no-done include-tag ";
pub const COMMON_CAP_LIST: &str = "ofs-delta agent=git-stratum/0.1.0";

#[cfg(test)]
mod tests {
    use super::*;

    /// Service names round-trip.
    #[test]
    fn test_service_type() {
        assert_eq!(
            "git-upload-pack".parse::<ServiceType>().unwrap(),
            ServiceType::UploadPack
        );
        assert_eq!(ServiceType::ReceivePack.to_string(), "git-receive-pack");
        assert!("git-frobnicate".parse::<ServiceType>().is_err());
    }

    /// Known capabilities parse to variants, the rest stay Unknown.
    #[test]
    fn test_capability_parse() {
        assert_eq!(
            "report-status".parse::<Capability>().unwrap(),
            Capability::ReportStatus
        );
        assert_eq!(
            "agent=git/2.39".parse::<Capability>().unwrap(),
            Capability::Agent("git/2.39".to_string())
        );
        assert_eq!(
            "push-cert=abc".parse::<Capability>().unwrap(),
            Capability::Unknown("push-cert=abc".to_string())
        );
    }

    /// Status lines render ok / ng per Git's report-status format.
    #[test]
    fn test_ref_command_status() {
        let mut cmd = RefCommand::new(
            ZERO_ID.to_string(),
            "1".repeat(40),
            "refs/heads/main".to_string(),
        );
        assert!(!cmd.is_delete());
        cmd.success();
        assert_eq!(cmd.get_status(), "ok refs/heads/main");
        cmd.failed("lock failed: ref has been updated".to_string());
        assert_eq!(
            cmd.get_status(),
            "ng refs/heads/main lock failed: ref has been updated"
        );
    }
}
