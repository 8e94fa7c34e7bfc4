/// Failure taxonomy shared by every public operation of the engine.
///
/// Success is expressed through `Ok`; operations that act on several targets
/// at once report partial success through [`Outcome`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Operation invalid or impossible right now.
    #[error("operation failed")]
    Fail,
    /// Valid request in the wrong lifecycle phase; retry later.
    #[error("too early for this operation, retry later")]
    TooEarly,
    /// Valid request but the phase has permanently passed.
    #[error("too late for this operation")]
    TooLate,
    /// The name belongs to another live object.
    #[error("name already in use")]
    InUse,
    #[error("invalid id")]
    BadId,
    #[error("invalid name")]
    BadName,
    #[error("invalid data")]
    BadData,
    /// Called from a scheduling context that forbids it (an engine task).
    #[error("operation not allowed from this context")]
    BadContext,
    #[error("out of memory")]
    NoMem,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Result of an operation that may only partially succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Complete,
    Partial,
}

impl Outcome {
    /// Folds per-target results the way every multi-target operation does:
    /// all ok is `Complete`, none ok (with at least one attempted) is `Fail`,
    /// anything in between is `Partial`. Zero attempts is `Complete`.
    pub fn from_counts(attempted: usize, succeeded: usize) -> Result<Outcome> {
        if succeeded == attempted {
            Ok(Outcome::Complete)
        } else if succeeded == 0 {
            Err(Error::Fail)
        } else {
            Ok(Outcome::Partial)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folding_counts() {
        assert_eq!(Outcome::from_counts(0, 0), Ok(Outcome::Complete));
        assert_eq!(Outcome::from_counts(3, 3), Ok(Outcome::Complete));
        assert_eq!(Outcome::from_counts(3, 1), Ok(Outcome::Partial));
        assert_eq!(Outcome::from_counts(3, 0), Err(Error::Fail));
    }
}
