//! Raw dispatch wire format pushed by the drop server to every end-user
//! socket: `"{dropID}:{eventDropID}:{ticket}"`, one notice per line.

use crate::protocol::DropId;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchNotice {
    pub drop_id: DropId,
    pub event_drop_id: u32,
    pub ticket: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NoticeParseError {
    #[error("expected 3 fields, got {0}")]
    FieldCount(usize),
    #[error("invalid {field}: {value:?}")]
    InvalidField { field: &'static str, value: String },
}

impl DispatchNotice {
    /// Line as written to the socket, including the terminating newline.
    pub fn to_line(&self) -> String {
        format!("{}\n", self)
    }
}

impl fmt::Display for DispatchNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.drop_id, self.event_drop_id, self.ticket)
    }
}

impl FromStr for DispatchNotice {
    type Err = NoticeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.trim_end_matches(['\r', '\n']).split(':').collect();
        if fields.len() != 3 {
            return Err(NoticeParseError::FieldCount(fields.len()));
        }

        let invalid = |field: &'static str, value: &str| NoticeParseError::InvalidField {
            field,
            value: value.to_string(),
        };

        Ok(DispatchNotice {
            drop_id: fields[0].parse().map_err(|_| invalid("drop id", fields[0]))?,
            event_drop_id: fields[1]
                .parse()
                .map_err(|_| invalid("event drop id", fields[1]))?,
            ticket: fields[2].parse().map_err(|_| invalid("ticket", fields[2]))?,
        })
    }
}
