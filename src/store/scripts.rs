//! Server-side scripts and their call/reply shapes.
//!
//! A [`ScriptCall`] names a script and carries its `KEYS` and `ARGV` in the
//! positions documented at the top of each `scripts/*.lua` file. Both store
//! implementations honour the same positions.

use std::fmt;

/// Named precondition failures returned by scripts.
pub mod reason {
    pub const QUEUE_NOT_FOUND: &str = "QUEUE_NOT_FOUND";
    pub const MESSAGE_PRIORITY_REQUIRED: &str = "MESSAGE_PRIORITY_REQUIRED";
    pub const PRIORITY_QUEUING_NOT_ENABLED: &str = "PRIORITY_QUEUING_NOT_ENABLED";
    pub const CONSUMER_GROUP_REQUIRED: &str = "CONSUMER_GROUP_REQUIRED";
    pub const CONSUMER_GROUP_NOT_FOUND: &str = "CONSUMER_GROUP_NOT_FOUND";
    pub const MESSAGE_NOT_PROCESSING: &str = "MESSAGE_NOT_PROCESSING";
}

/// Spacing between priority levels in a priority set score. The remainder
/// is a per-queue sequence number, so equal priorities pop in insertion order.
pub const PRIORITY_SCORE_STEP: f64 = 1_099_511_627_776.0;

/// Highest accepted message priority.
pub const MAX_PRIORITY: u8 = 7;

/// Score of a priority set entry; lower scores pop first.
pub fn priority_score(priority: u8, sequence: u64) -> f64 {
    f64::from(MAX_PRIORITY.saturating_sub(priority)) * PRIORITY_SCORE_STEP + sequence as f64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptName {
    Publish,
    Schedule,
    PopPriority,
    Requeue,
    Delay,
    Settle,
    Activate,
    ExtendLock,
    ReleaseLock,
    RateLimit,
}

impl ScriptName {
    pub const ALL: [ScriptName; 10] = [
        ScriptName::Publish,
        ScriptName::Schedule,
        ScriptName::PopPriority,
        ScriptName::Requeue,
        ScriptName::Delay,
        ScriptName::Settle,
        ScriptName::Activate,
        ScriptName::ExtendLock,
        ScriptName::ReleaseLock,
        ScriptName::RateLimit,
    ];

    pub fn source(&self) -> &'static str {
        match self {
            ScriptName::Publish => include_str!("scripts/publish.lua"),
            ScriptName::Schedule => include_str!("scripts/schedule.lua"),
            ScriptName::PopPriority => include_str!("scripts/pop_priority.lua"),
            ScriptName::Requeue => include_str!("scripts/requeue.lua"),
            ScriptName::Delay => include_str!("scripts/delay.lua"),
            ScriptName::Settle => include_str!("scripts/settle.lua"),
            ScriptName::Activate => include_str!("scripts/activate.lua"),
            ScriptName::ExtendLock => include_str!("scripts/extend_lock.lua"),
            ScriptName::ReleaseLock => include_str!("scripts/release_lock.lua"),
            ScriptName::RateLimit => include_str!("scripts/rate_limit.lua"),
        }
    }
}

impl fmt::Display for ScriptName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScriptName::Publish => "publish",
            ScriptName::Schedule => "schedule",
            ScriptName::PopPriority => "pop_priority",
            ScriptName::Requeue => "requeue",
            ScriptName::Delay => "delay",
            ScriptName::Settle => "settle",
            ScriptName::Activate => "activate",
            ScriptName::ExtendLock => "extend_lock",
            ScriptName::ReleaseLock => "release_lock",
            ScriptName::RateLimit => "rate_limit",
        };
        f.write_str(name)
    }
}

/// A script invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptCall {
    pub name: ScriptName,
    pub keys: Vec<String>,
    pub args: Vec<String>,
}

impl ScriptCall {
    pub fn new(name: ScriptName) -> Self {
        Self {
            name,
            keys: Vec::new(),
            args: Vec::new(),
        }
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.keys.push(key.into());
        self
    }

    pub fn arg(mut self, arg: impl ToString) -> Self {
        self.args.push(arg.to_string());
        self
    }

    /// Key at `index`, empty when the caller left it out.
    pub fn key_at(&self, index: usize) -> &str {
        self.keys.get(index).map(String::as_str).unwrap_or("")
    }

    /// Argument at `index`, empty when the caller left it out.
    pub fn arg_at(&self, index: usize) -> &str {
        self.args.get(index).map(String::as_str).unwrap_or("")
    }
}

/// Script outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptReply {
    /// Committed.
    Ok,
    /// Nothing to do, e.g. an empty pop.
    Nil,
    Int(i64),
    /// A value such as a popped id, or a named precondition failure.
    Text(String),
}

impl ScriptReply {
    /// Interpret a transition reply: `Ok(true)` when committed, `Ok(false)`
    /// on nil, `Err(reason)` on a named precondition failure.
    pub fn into_transition(self) -> Result<bool, String> {
        match self {
            ScriptReply::Ok => Ok(true),
            ScriptReply::Nil => Ok(false),
            ScriptReply::Text(reason) => Err(reason),
            ScriptReply::Int(n) => Err(n.to_string()),
        }
    }

    /// True for a non-zero integer reply.
    pub fn is_truthy(&self) -> bool {
        matches!(self, ScriptReply::Int(n) if *n != 0)
    }
}
