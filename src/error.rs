/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::fmt;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("channel {0} is closed")]
    ChannelClosed(String),
    #[error("session shutdown in progress")]
    SessionShutdown,
    #[error("illegal state: {0}")]
    IllegalState(String),
    #[error("blocked call interrupted by cancellation")]
    Interrupted,
    #[error("wait timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    TaskFailure(TaskFailure),
    #[error("port not found: {0}")]
    PortNotFound(String),
    #[error("invalid filter expression: {0}")]
    FilterInvalid(String),
    #[error("config: {0}")]
    Config(String),
}

impl Error {
    /// Shutdown-family conditions end a processing loop cleanly and are
    /// never escalated as task failures.
    pub fn is_shutdown(&self) -> bool {
        matches!(
            self,
            Error::ChannelClosed(_) | Error::SessionShutdown | Error::Interrupted
        )
    }
}

/// Terminal failure of one supervised task, as surfaced by
/// `TaskExecutor::await_completion`. The first unrecovered failure carries
/// any later ones in `secondary`.
#[derive(Debug, Clone)]
pub struct TaskFailure {
    pub task: String,
    pub channel: String,
    pub restarts: u32,
    pub reason: String,
    pub secondary: Vec<TaskFailure>,
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "task {} on channel {} failed after {} restarts: {}",
            self.task, self.channel, self.restarts, self.reason
        )?;
        if !self.secondary.is_empty() {
            write!(f, " ({} more task failures suppressed)", self.secondary.len())?;
        }
        Ok(())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_family() {
        assert!(Error::ChannelClosed("c".to_owned()).is_shutdown());
        assert!(Error::SessionShutdown.is_shutdown());
        assert!(Error::Interrupted.is_shutdown());
        assert!(!Error::IllegalState("x".to_owned()).is_shutdown());
        assert!(!Error::Timeout(Duration::from_secs(1)).is_shutdown());
    }

    #[test]
    fn task_failure_display_mentions_suppressed() {
        let inner = TaskFailure {
            task: "t-1".to_owned(),
            channel: "c".to_owned(),
            restarts: 0,
            reason: "boom".to_owned(),
            secondary: vec![],
        };
        let mut outer = inner.clone();
        outer.secondary.push(inner);
        let msg = outer.to_string();
        assert!(msg.contains("after 0 restarts"));
        assert!(msg.contains("1 more task failures suppressed"));
    }
}
