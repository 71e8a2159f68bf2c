// Copyright 2025 Lablup Inc. and Jeongkyu Shin
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Shutdown bookkeeping for one proxied channel pair.
//!
//! The coordinator feeds every completion signal from the workers into
//! [`ShutdownState::apply`] and performs the returned [`ShutdownActions`].
//! The state is owned by the coordinator alone and never shared.

/// Completion signal reported by a pipe worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeSignal {
    /// The local frame stream ended (or a write to the remote failed).
    LocalDataEof,
    /// The remote frame stream ended (or a write to the local failed).
    RemoteDataEof,
    /// The local request stream ended.
    LocalRequestsDrained,
    /// The remote request stream ended.
    RemoteRequestsDrained,
}

/// What the coordinator must do after a signal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownActions {
    pub close_write_local: bool,
    pub close_write_remote: bool,
    pub close_local: bool,
    pub close_remote: bool,
    /// Every stream has ended; the pipe may return.
    pub finished: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ShutdownState {
    local_data_eof: bool,
    remote_data_eof: bool,
    local_requests_drained: bool,
    remote_requests_drained: bool,
    // Latches so each side is force-closed at most once.
    local_closed: bool,
    remote_closed: bool,
}

impl ShutdownState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a signal and return the actions it triggers.
    ///
    /// A side whose data and requests have both finished forces the other
    /// side closed while that side still has requests outstanding; the
    /// other side's request stream then ends as a consequence of the close.
    pub fn apply(&mut self, signal: PipeSignal) -> ShutdownActions {
        let mut actions = ShutdownActions::default();

        match signal {
            PipeSignal::LocalDataEof => {
                self.local_data_eof = true;
                actions.close_write_remote = true;
            }
            PipeSignal::RemoteDataEof => {
                self.remote_data_eof = true;
                actions.close_write_local = true;
            }
            PipeSignal::LocalRequestsDrained => self.local_requests_drained = true,
            PipeSignal::RemoteRequestsDrained => self.remote_requests_drained = true,
        }

        if self.local_data_eof
            && self.local_requests_drained
            && !self.remote_requests_drained
            && !self.remote_closed
        {
            self.remote_closed = true;
            actions.close_remote = true;
        }
        if self.remote_data_eof
            && self.remote_requests_drained
            && !self.local_requests_drained
            && !self.local_closed
        {
            self.local_closed = true;
            actions.close_local = true;
        }

        actions.finished = self.is_finished();
        actions
    }

    /// Whether the local side was already force-closed.
    pub fn local_closed(&self) -> bool {
        self.local_closed
    }

    pub fn remote_closed(&self) -> bool {
        self.remote_closed
    }

    pub fn is_finished(&self) -> bool {
        self.local_data_eof
            && self.remote_data_eof
            && self.local_requests_drained
            && self.remote_requests_drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use PipeSignal::*;

    fn run(signals: &[PipeSignal]) -> (ShutdownState, Vec<ShutdownActions>) {
        let mut state = ShutdownState::new();
        let actions = signals.iter().map(|s| state.apply(*s)).collect();
        (state, actions)
    }

    #[test]
    fn test_data_eof_half_closes_the_other_side() {
        let (_, actions) = run(&[LocalDataEof, RemoteDataEof]);
        assert!(actions[0].close_write_remote);
        assert!(!actions[0].close_write_local);
        assert!(actions[1].close_write_local);
        assert!(!actions[1].close_write_remote);
    }

    #[test]
    fn test_local_done_force_closes_remote_once() {
        let (state, actions) = run(&[
            LocalDataEof,
            LocalRequestsDrained,
            RemoteDataEof,
            RemoteRequestsDrained,
        ]);

        let remote_closes = actions.iter().filter(|a| a.close_remote).count();
        assert_eq!(remote_closes, 1);
        assert!(actions[1].close_remote);
        assert!(actions.iter().all(|a| !a.close_local));

        // Termination waits for the remote request stream.
        assert!(!actions[2].finished);
        assert!(actions[3].finished);
        assert!(state.is_finished());
        assert!(state.remote_closed());
        assert!(!state.local_closed());
    }

    #[test]
    fn test_remote_done_force_closes_local() {
        let (_, actions) = run(&[RemoteRequestsDrained, RemoteDataEof]);
        assert!(!actions[0].close_local);
        assert!(actions[1].close_local);
        assert!(actions[1].close_write_local);
        assert!(!actions[1].finished);
    }

    #[test]
    fn test_no_force_close_when_other_side_already_drained() {
        let (_, actions) = run(&[
            RemoteRequestsDrained,
            LocalRequestsDrained,
            LocalDataEof,
            RemoteDataEof,
        ]);
        assert!(actions.iter().all(|a| !a.close_remote && !a.close_local));
        assert!(actions[3].finished);
    }

    #[test]
    fn test_requests_alone_do_not_finish() {
        let (state, actions) = run(&[LocalRequestsDrained, RemoteRequestsDrained]);
        assert!(actions.iter().all(|a| !a.finished));
        assert!(!state.is_finished());
    }

    #[test]
    fn test_repeated_signals_do_not_reclose() {
        let (_, actions) = run(&[
            LocalDataEof,
            LocalRequestsDrained,
            LocalRequestsDrained,
            LocalDataEof,
        ]);
        assert_eq!(actions.iter().filter(|a| a.close_remote).count(), 1);
    }
}
