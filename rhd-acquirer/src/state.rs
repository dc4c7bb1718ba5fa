use crate::{AcquireError, AcquireResult};

/// Состояние цикла сбора.
///
/// ```text
/// Init → Calibrating → Streaming → Draining → Stopped
/// ```
///
/// Из любого нетерминального состояния можно сразу уйти в `Stopped`
/// (фатальная ошибка). `Stopped` — терминальное.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum RunState {
    Init,
    Calibrating,
    Streaming,
    Draining,
    Stopped,
}

impl RunState {
    pub fn can_transition_to(
        &self,
        to: RunState,
    ) -> bool {
        use RunState::*;

        matches!(
            (self, to),
            (Init, Calibrating)
                | (Calibrating, Streaming)
                | (Streaming, Draining)
                | (Draining, Stopped)
                | (Init | Calibrating | Streaming, Stopped)
        )
    }

    pub fn is_terminal(&self) -> bool {
        *self == RunState::Stopped
    }
}

impl std::fmt::Display for RunState {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        let s = match self {
            RunState::Init => "INIT",
            RunState::Calibrating => "CALIBRATING",
            RunState::Streaming => "STREAMING",
            RunState::Draining => "DRAINING",
            RunState::Stopped => "STOPPED",
        };
        f.write_str(s)
    }
}

/// Текущее состояние плюс история переходов (для логов и тестов).
#[derive(Debug, Clone)]
pub struct RunStateMachine {
    current: RunState,
    history: Vec<RunState>,
}

impl RunStateMachine {
    pub fn new() -> Self {
        Self {
            current: RunState::Init,
            history: vec![RunState::Init],
        }
    }

    pub fn current(&self) -> RunState {
        self.current
    }

    /// Все состояния, через которые прошла сессия, по порядку.
    pub fn history(&self) -> &[RunState] {
        &self.history
    }

    pub fn transition(
        &mut self,
        to: RunState,
    ) -> AcquireResult<()> {
        if !self.current.can_transition_to(to) {
            return Err(AcquireError::InvalidTransition {
                from: self.current,
                to,
            });
        }

        log::debug!("Run state: {} -> {}", self.current, to);
        self.current = to;
        self.history.push(to);

        Ok(())
    }
}

impl Default for RunStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
