//! Author/committer/tagger identity lines: `"Name <email> <sec> <±HHMM>"`.

use std::fmt::Display;

use bstr::ByteSlice;
use serde::{Deserialize, Serialize};

use crate::errors::GitError;

/// Which header line the signature came from.
#[derive(PartialEq, Eq, Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureType {
    Author,
    Committer,
    Tagger,
}

impl Display for SignatureType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            SignatureType::Author => write!(f, "author"),
            SignatureType::Committer => write!(f, "committer"),
            SignatureType::Tagger => write!(f, "tagger"),
        }
    }
}

impl SignatureType {
    pub fn from_data(data: &[u8]) -> Result<SignatureType, GitError> {
        match data {
            b"author" => Ok(SignatureType::Author),
            b"committer" => Ok(SignatureType::Committer),
            b"tagger" => Ok(SignatureType::Tagger),
            _ => Err(GitError::InvalidSignature(
                String::from_utf8_lossy(data).to_string(),
            )),
        }
    }
}

/// Identity with timestamp: who, when, and in which timezone.
#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct Signature {
    pub signature_type: SignatureType,
    pub name: String,
    pub email: String,
    /// Seconds since the Unix epoch.
    pub timestamp: i64,
    /// Offset rendered as `±HHMM`; kept verbatim so re-encoding is byte-exact.
    pub timezone: String,
}

impl Display for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{} <{}> {} {}",
            self.name, self.email, self.timestamp, self.timezone
        )
    }
}

impl Signature {
    /// Build a signature stamped with the current time in UTC.
    pub fn new(signature_type: SignatureType, name: String, email: String) -> Self {
        Self {
            signature_type,
            name,
            email,
            timestamp: chrono::Utc::now().timestamp(),
            timezone: "+0000".to_string(),
        }
    }

    /// Parse a full signature line, e.g.
    /// `author Jane Doe <jane@example.com> 1712000000 +0200`.
    ///
    /// The timezone falls back to `+0000` when absent.
    pub fn from_data(data: Vec<u8>) -> Result<Signature, GitError> {
        let err = |d: &[u8]| GitError::InvalidSignature(String::from_utf8_lossy(d).to_string());

        let type_end = data.find_byte(b' ').ok_or_else(|| err(&data))?;
        let signature_type = SignatureType::from_data(&data[..type_end])?;
        let rest = &data[type_end + 1..];

        // The email is the only reliably delimited field; split around it.
        let email_start = rest.find_byte(b'<').ok_or_else(|| err(&data))?;
        let email_end = rest.find_byte(b'>').ok_or_else(|| err(&data))?;
        if email_end < email_start {
            return Err(err(&data));
        }
        let name = String::from_utf8_lossy(rest[..email_start].trim_end())
            .trim_end()
            .to_string();
        let email = String::from_utf8_lossy(&rest[email_start + 1..email_end]).to_string();

        let tail = rest[email_end + 1..].trim();
        let mut parts = tail.split_str(b" ").filter(|p| !p.is_empty());
        let timestamp = match parts.next() {
            Some(sec) => std::str::from_utf8(sec)
                .map_err(|_| err(&data))?
                .parse::<i64>()
                .map_err(|_| err(&data))?,
            None => 0,
        };
        let timezone = match parts.next() {
            Some(tz) => String::from_utf8_lossy(tz).to_string(),
            None => "+0000".to_string(),
        };

        Ok(Signature {
            signature_type,
            name,
            email,
            timestamp,
            timezone,
        })
    }

    /// Serialize back to the canonical header line.
    pub fn to_data(&self) -> Result<Vec<u8>, GitError> {
        let mut out = Vec::new();
        out.extend(self.signature_type.to_string().as_bytes());
        out.extend(b" ");
        out.extend(self.name.as_bytes());
        out.extend(b" <");
        out.extend(self.email.as_bytes());
        out.extend(b"> ");
        out.extend(self.timestamp.to_string().as_bytes());
        out.extend(b" ");
        out.extend(self.timezone.as_bytes());
        Ok(out)
    }
}
