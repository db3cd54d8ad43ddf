//! In-memory executor that replays canned responses for deterministic tests.

#![allow(missing_docs)]

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use crate::core::errors::{DipError, Result};
use crate::remote::{CommandResult, RemoteExecutor, RemoteTarget};

/// One scripted reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ran(CommandResult),
    TransportFailure(String),
}

impl From<CommandResult> for Reply {
    fn from(value: CommandResult) -> Self {
        Self::Ran(value)
    }
}

/// Replies for one command. The last reply repeats once the queue drains.
#[derive(Debug, Clone)]
struct ReplyQueue {
    pending: VecDeque<Reply>,
}

impl ReplyQueue {
    fn next(&mut self) -> Option<Reply> {
        if self.pending.len() > 1 {
            self.pending.pop_front()
        } else {
            self.pending.front().cloned()
        }
    }
}

/// Executor whose responses are scripted up front.
///
/// Lookup order: exact command, then the longest registered prefix, then the
/// fallback (a successful empty result unless overridden). Every command is
/// recorded in issue order.
#[derive(Debug)]
pub struct ScriptedExecutor {
    target: RemoteTarget,
    exact: Mutex<HashMap<String, ReplyQueue>>,
    prefixes: Mutex<Vec<(String, ReplyQueue)>>,
    fallback: Reply,
    issued: Mutex<Vec<String>>,
}

impl Default for ScriptedExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedExecutor {
    #[must_use]
    pub fn new() -> Self {
        Self {
            target: RemoteTarget::new("scripted", 22, "tester"),
            exact: Mutex::new(HashMap::new()),
            prefixes: Mutex::new(Vec::new()),
            fallback: Reply::Ran(CommandResult::ok("")),
            issued: Mutex::new(Vec::new()),
        }
    }

    /// Reply to `command` with a successful result carrying `stdout`.
    #[must_use]
    pub fn respond(self, command: &str, stdout: &str) -> Self {
        self.reply(command, CommandResult::ok(stdout))
    }

    /// Reply to `command` with an arbitrary result or transport failure.
    #[must_use]
    pub fn reply(self, command: &str, reply: impl Into<Reply>) -> Self {
        self.sequence(command, vec![reply.into()])
    }

    /// Reply to successive invocations of `command` in order.
    #[must_use]
    pub fn sequence(self, command: &str, replies: Vec<Reply>) -> Self {
        self.exact.lock().insert(
            command.to_string(),
            ReplyQueue {
                pending: replies.into(),
            },
        );
        self
    }

    /// Reply to any command starting with `prefix`.
    #[must_use]
    pub fn reply_prefix(self, prefix: &str, reply: impl Into<Reply>) -> Self {
        self.prefixes.lock().push((
            prefix.to_string(),
            ReplyQueue {
                pending: VecDeque::from([reply.into()]),
            },
        ));
        self
    }

    /// Reply to `command` with a transport failure.
    #[must_use]
    pub fn unreachable(self, command: &str, details: &str) -> Self {
        self.reply(command, Reply::TransportFailure(details.to_string()))
    }

    #[must_use]
    pub fn with_fallback(mut self, reply: impl Into<Reply>) -> Self {
        self.fallback = reply.into();
        self
    }

    /// Commands issued so far, in order.
    #[must_use]
    pub fn issued(&self) -> Vec<String> {
        self.issued.lock().clone()
    }

    /// How many times `command` was issued verbatim.
    #[must_use]
    pub fn count(&self, command: &str) -> usize {
        self.issued.lock().iter().filter(|c| *c == command).count()
    }

    fn lookup(&self, command: &str) -> Reply {
        if let Some(queue) = self.exact.lock().get_mut(command)
            && let Some(reply) = queue.next()
        {
            return reply;
        }
        let mut prefixes = self.prefixes.lock();
        let best = prefixes
            .iter_mut()
            .filter(|(prefix, _)| command.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len());
        if let Some((_, queue)) = best
            && let Some(reply) = queue.next()
        {
            return reply;
        }
        self.fallback.clone()
    }
}

impl RemoteExecutor for ScriptedExecutor {
    fn target(&self) -> &RemoteTarget {
        &self.target
    }

    fn run(&self, command: &str) -> Result<CommandResult> {
        self.issued.lock().push(command.to_string());
        match self.lookup(command) {
            Reply::Ran(result) => Ok(result),
            Reply::TransportFailure(details) => Err(DipError::Transport {
                target: self.target.to_string(),
                details,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_commands_use_fallback() {
        let exec = ScriptedExecutor::new();
        let result = exec.run("docker pull ubuntu").unwrap();
        assert!(result.succeeded);
        assert!(result.stdout.is_empty());
        assert_eq!(exec.issued(), vec!["docker pull ubuntu".to_string()]);
    }

    #[test]
    fn sequence_replays_in_order_then_repeats_last() {
        let exec = ScriptedExecutor::new().sequence(
            "mount | sort",
            vec![
                CommandResult::ok("a\n").into(),
                CommandResult::ok("b\n").into(),
            ],
        );
        let outputs: Vec<String> = (0..4)
            .map(|_| exec.run("mount | sort").unwrap().stdout)
            .collect();
        assert_eq!(outputs, ["a\n", "b\n", "b\n", "b\n"]);
        assert_eq!(exec.count("mount | sort"), 4);
    }

    #[test]
    fn longest_prefix_wins() {
        let exec = ScriptedExecutor::new()
            .reply_prefix("docker run", CommandResult::ok("generic"))
            .reply_prefix("docker run --rm -i --gpus", CommandResult::ok("gpus"));
        assert_eq!(
            exec.run("docker run --rm -i --gpus all ubuntu").unwrap().stdout,
            "gpus"
        );
        assert_eq!(exec.run("docker run --rm ubuntu").unwrap().stdout, "generic");
    }

    #[test]
    fn exact_match_beats_prefix() {
        let exec = ScriptedExecutor::new()
            .reply_prefix("nvidia-smi", CommandResult::failed(9, "prefix"))
            .respond("nvidia-smi -L", "GPU 0");
        assert_eq!(exec.run("nvidia-smi -L").unwrap().stdout, "GPU 0");
    }

    #[test]
    fn unreachable_reports_transport_failure() {
        let exec = ScriptedExecutor::new().unreachable("true", "connection refused");
        let err = exec.run("true").unwrap_err();
        assert!(err.is_transport());
        assert!(err.to_string().contains("connection refused"));
    }
}
