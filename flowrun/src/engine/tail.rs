//! Log tailing and export on top of the sequenced log stream.

use futures::stream::{self, Stream};
use std::collections::VecDeque;
use std::time::Duration;
use uuid::Uuid;

use super::coordinator::ExecutionCoordinator;
use crate::core::LogEntry;
use crate::errors::EngineError;

struct TailState<'a> {
    coordinator: &'a ExecutionCoordinator,
    run_id: Uuid,
    cursor: u64,
    buffer: VecDeque<LogEntry>,
    interval: Duration,
    grace_used: bool,
    done: bool,
}

impl ExecutionCoordinator {
    /// Streams a run's log entries after `from_sequence`, polling every `interval`.
    ///
    /// The stream ends once the run is terminal and no further entries
    /// appear within one more interval, or after the first error.
    pub fn follow_logs(
        &self,
        run_id: Uuid,
        from_sequence: u64,
        interval: Duration,
    ) -> impl Stream<Item = Result<LogEntry, EngineError>> + '_ {
        let state = TailState {
            coordinator: self,
            run_id,
            cursor: from_sequence,
            buffer: VecDeque::new(),
            interval,
            grace_used: false,
            done: false,
        };

        stream::unfold(state, |mut state| async move {
            loop {
                if let Some(entry) = state.buffer.pop_front() {
                    return Some((Ok(entry), state));
                }
                if state.done {
                    return None;
                }

                let terminal = match state.coordinator.get_run(state.run_id).await {
                    Ok(run) => run.status.is_terminal(),
                    Err(e) => {
                        state.done = true;
                        return Some((Err(e), state));
                    }
                };

                match state.coordinator.get_log_stream(state.run_id, state.cursor).await {
                    Ok(entries) if !entries.is_empty() => {
                        if let Some(last) = entries.last() {
                            state.cursor = last.sequence_number;
                        }
                        state.buffer.extend(entries);
                        state.grace_used = false;
                    }
                    Ok(_) if terminal && state.grace_used => return None,
                    Ok(_) => {
                        // Terminal transitions are logged just after they commit.
                        state.grace_used = terminal;
                        tokio::time::sleep(state.interval).await;
                    }
                    Err(e) => {
                        state.done = true;
                        return Some((Err(e), state));
                    }
                }
            }
        })
    }

    /// Renders a run's full log as newline-delimited JSON.
    pub async fn export_logs(&self, run_id: Uuid) -> Result<String, EngineError> {
        let entries = self.get_log_stream(run_id, 0).await?;
        let mut out = String::new();
        for entry in &entries {
            out.push_str(&serde_json::to_string(entry)?);
            out.push('\n');
        }
        Ok(out)
    }
}
