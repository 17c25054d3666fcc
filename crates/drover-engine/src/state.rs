use anyhow::{Result, bail};

/// Externally observable lifecycle of one pipeline step.
///
/// Only `Leased -> Ready` (the readiness probe) and `Staged -> Running`
/// (the remote exec) may block on the network; every other transition
/// is local bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepPhase {
    Unleased,
    Leased,
    Ready,
    Staged,
    Running,
    Done,
    Cancelled,
    Failed,
    Released,
}

impl std::fmt::Display for StepPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unleased => write!(f, "unleased"),
            Self::Leased => write!(f, "leased"),
            Self::Ready => write!(f, "ready"),
            Self::Staged => write!(f, "staged"),
            Self::Running => write!(f, "running"),
            Self::Done => write!(f, "done"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Failed => write!(f, "failed"),
            Self::Released => write!(f, "released"),
        }
    }
}

/// Validate that a phase transition is allowed.
pub fn validate_transition(from: StepPhase, to: StepPhase) -> Result<()> {
    let valid = matches!(
        (from, to),
        (StepPhase::Unleased, StepPhase::Leased)
            | (StepPhase::Leased, StepPhase::Ready)
            | (StepPhase::Ready, StepPhase::Staged)
            | (StepPhase::Staged, StepPhase::Running)
            | (StepPhase::Running, StepPhase::Done)
            | (StepPhase::Running, StepPhase::Cancelled)
            | (StepPhase::Running, StepPhase::Failed)
            | (StepPhase::Done, StepPhase::Released)
            | (StepPhase::Cancelled, StepPhase::Released)
            | (StepPhase::Failed, StepPhase::Released)
    );

    if valid {
        Ok(())
    } else {
        bail!("invalid step phase transition: {} -> {}", from, to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let phases = [
            StepPhase::Unleased,
            StepPhase::Leased,
            StepPhase::Ready,
            StepPhase::Staged,
            StepPhase::Running,
            StepPhase::Done,
            StepPhase::Released,
        ];
        for pair in phases.windows(2) {
            assert!(
                validate_transition(pair[0], pair[1]).is_ok(),
                "{} -> {} should be valid",
                pair[0],
                pair[1],
            );
        }
    }

    #[test]
    fn test_terminal_outcomes_release() {
        for outcome in [StepPhase::Done, StepPhase::Cancelled, StepPhase::Failed] {
            assert!(validate_transition(StepPhase::Running, outcome).is_ok());
            assert!(validate_transition(outcome, StepPhase::Released).is_ok());
        }
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(validate_transition(StepPhase::Unleased, StepPhase::Running).is_err());
        assert!(validate_transition(StepPhase::Ready, StepPhase::Running).is_err());
        assert!(validate_transition(StepPhase::Released, StepPhase::Leased).is_err());
        assert!(validate_transition(StepPhase::Done, StepPhase::Running).is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(StepPhase::Staged.to_string(), "staged");
        assert_eq!(StepPhase::Released.to_string(), "released");
    }
}
