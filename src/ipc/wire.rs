//! Wire protocol shared by every process on the bus.
//!
//! Each message names a channel (event kind + phase) and carries an
//! `{idx, round, data}` envelope. `idx` correlates an acknowledgment with the
//! slot it answers in the initiator's correlation table; `round` identifies the
//! broadcast that slot belongs to.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Channel names
// ---------------------------------------------------------------------------

pub const DISPATCH_EVENT: &str = "dispatchertron-dispatch-event";
pub const CLEAR_EVENT: &str = "dispatchertron-clear-event";
pub const GET_NUM_LISTENERS_EVENT: &str = "dispatchertron-getnumlisteners-event";

pub const EVENT_SUFFIX_SUCCESS: &str = "-success";
pub const EVENT_SUFFIX_FAILURE: &str = "-failure";

/// The three logical event kinds that can be in flight concurrently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Dispatch,
    Clear,
    CountQuery,
}

impl EventKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Dispatch => DISPATCH_EVENT,
            Self::Clear => CLEAR_EVENT,
            Self::CountQuery => GET_NUM_LISTENERS_EVENT,
        }
    }

    pub const fn all() -> &'static [EventKind] {
        &[EventKind::Dispatch, EventKind::Clear, EventKind::CountQuery]
    }

    /// Position of this kind's correlation slot.
    pub(crate) const fn slot(&self) -> usize {
        match self {
            Self::Dispatch => 0,
            Self::Clear => 1,
            Self::CountQuery => 2,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Request, or one of the two acknowledgment flavours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Request,
    Success,
    Failure,
}

impl Phase {
    const fn suffix(&self) -> &'static str {
        match self {
            Self::Request => "",
            Self::Success => EVENT_SUFFIX_SUCCESS,
            Self::Failure => EVENT_SUFFIX_FAILURE,
        }
    }
}

/// A channel name on the wire, e.g. `dispatchertron-clear-event-success`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Channel {
    pub kind: EventKind,
    pub phase: Phase,
}

impl Channel {
    pub const fn request(kind: EventKind) -> Self {
        Self {
            kind,
            phase: Phase::Request,
        }
    }

    pub const fn success(kind: EventKind) -> Self {
        Self {
            kind,
            phase: Phase::Success,
        }
    }

    pub const fn failure(kind: EventKind) -> Self {
        Self {
            kind,
            phase: Phase::Failure,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.kind.as_str(), self.phase.suffix())
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        for kind in EventKind::all() {
            let Some(rest) = value.strip_prefix(kind.as_str()) else {
                continue;
            };
            let phase = match rest {
                "" => Phase::Request,
                EVENT_SUFFIX_SUCCESS => Phase::Success,
                EVENT_SUFFIX_FAILURE => Phase::Failure,
                _ => continue,
            };
            return Ok(Self { kind: *kind, phase });
        }
        Err(format!("unknown channel: {value}"))
    }
}

impl TryFrom<String> for Channel {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Channel> for String {
    fn from(channel: Channel) -> Self {
        channel.to_string()
    }
}

/// Correlation envelope carried by every message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub idx: usize,
    pub round: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Envelope {
    pub fn new(idx: usize, round: u64) -> Self {
        Self {
            idx,
            round,
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub channel: Channel,
    pub args: Envelope,
}

impl WireMessage {
    pub fn new(channel: Channel, args: Envelope) -> Self {
        Self { channel, args }
    }

    /// Build the acknowledgment that answers `request`.
    pub fn reply_to(request: &WireMessage, phase: Phase, data: Option<serde_json::Value>) -> Self {
        Self {
            channel: Channel {
                kind: request.channel.kind,
                phase,
            },
            args: Envelope {
                idx: request.args.idx,
                round: request.args.round,
                data,
            },
        }
    }
}
