//! Control messages exchanged between the application and its agent.
//!
//! A control message is a list of frames. The first frame is the UTF-8
//! command name, the rest are opaque arguments.

use std::fmt;

/// Application → agent: stop the agent.
pub const SYSTEM_EXIT: &str = "SYSTEM.EXIT";
/// Agent → application: the agent has shut down.
pub const AGENT_EXIT: &str = "AGENT.EXIT";
/// Application → agent: `AGENT.HEADER key value` publishes a local header.
pub const AGENT_HEADER: &str = "AGENT.HEADER";
/// Matches every command name.
pub const WILDCARD: &str = "*";

#[derive(Clone, PartialEq, Eq)]
pub struct ControlMessage {
    frames: Vec<Vec<u8>>,
}

impl ControlMessage {
    pub fn new(name: &str) -> Self {
        Self {
            frames: vec![name.as_bytes().to_vec()],
        }
    }

    /// Build from raw frames (e.g. received from another process).
    pub fn from_frames(frames: Vec<Vec<u8>>) -> Self {
        Self { frames }
    }

    /// Append an argument frame.
    pub fn push(mut self, arg: impl Into<Vec<u8>>) -> Self {
        self.frames.push(arg.into());
        self
    }

    /// Append a string argument frame.
    pub fn push_str(self, arg: &str) -> Self {
        self.push(arg.as_bytes().to_vec())
    }

    /// Command name, if the first frame is valid UTF-8.
    pub fn name(&self) -> Option<&str> {
        self.frames
            .first()
            .and_then(|f| std::str::from_utf8(f).ok())
    }

    pub fn args(&self) -> &[Vec<u8>] {
        self.frames.get(1..).unwrap_or(&[])
    }

    /// Argument `index` as UTF-8.
    pub fn arg_str(&self, index: usize) -> Option<&str> {
        self.args()
            .get(index)
            .and_then(|a| std::str::from_utf8(a).ok())
    }
}

impl fmt::Debug for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .frames
            .iter()
            .map(|frame| String::from_utf8_lossy(frame).into_owned())
            .collect();
        write!(f, "ControlMessage{:?}", parts)
    }
}
