use thiserror::Error;

pub type PutResult<T> = std::result::Result<(), PutError<T>>;
pub type TakeResult<T> = std::result::Result<T, TakeError>;

/// `PutError` reports why a value could not be handed over. Every
/// variant carries the rejected value so the caller never loses it.
#[derive(Clone, PartialEq, Eq)]
pub enum PutError<T> {
    /// The wait was interrupted before the slot vacated.
    Cancelled(T),

    /// The slot stayed occupied past the deadline.
    TimedOut(T),

    /// The consumer side of the handoff is gone.
    Disconnected(T),

    /// The slot is currently occupied.
    WouldBlock(T),
}

impl<T> PutError<T> {
    /// `into_value` returns the value the failed put was carrying.
    pub fn into_value(self) -> T {
        match self {
            PutError::Cancelled(value)
            | PutError::TimedOut(value)
            | PutError::Disconnected(value)
            | PutError::WouldBlock(value) => value,
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PutError::Cancelled(_))
    }

    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, PutError::TimedOut(_))
    }

    #[must_use]
    pub fn is_disconnected(&self) -> bool {
        matches!(self, PutError::Disconnected(_))
    }

    #[must_use]
    pub fn is_would_block(&self) -> bool {
        matches!(self, PutError::WouldBlock(_))
    }
}

impl<T> core::fmt::Debug for PutError<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            PutError::Cancelled(_) => write!(f, "PutError::Cancelled(..)"),
            PutError::TimedOut(_) => write!(f, "PutError::TimedOut(..)"),
            PutError::Disconnected(_) => write!(f, "PutError::Disconnected(..)"),
            PutError::WouldBlock(_) => write!(f, "PutError::WouldBlock(..)"),
        }
    }
}

impl<T> core::fmt::Display for PutError<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            PutError::Cancelled(_) => write!(f, "put wait was interrupted before the slot vacated"),
            PutError::TimedOut(_) => write!(f, "slot stayed occupied past the put deadline"),
            PutError::Disconnected(_) => write!(f, "consumer side of the handoff is gone"),
            PutError::WouldBlock(_) => write!(f, "slot is currently occupied"),
        }
    }
}

impl<T> core::error::Error for PutError<T> {}

/// `TakeError` reports why no value could be received.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TakeError {
    #[error("take wait was interrupted before the slot filled")]
    Cancelled,

    #[error("slot stayed empty past the take deadline")]
    TimedOut,

    #[error("producer side of the handoff is gone")]
    Disconnected,

    #[error("slot is currently empty")]
    WouldBlock,
}

impl TakeError {
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TakeError::Cancelled)
    }

    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, TakeError::TimedOut)
    }

    #[must_use]
    pub fn is_disconnected(&self) -> bool {
        matches!(self, TakeError::Disconnected)
    }

    #[must_use]
    pub fn is_would_block(&self) -> bool {
        matches!(self, TakeError::WouldBlock)
    }
}

#[cfg(test)]
mod test_errors {
    use super::{PutError, TakeError};

    #[test]
    fn put_error_hands_the_value_back() {
        let err = PutError::TimedOut(42);
        assert!(err.is_timeout());
        assert_eq!(err.into_value(), 42);
    }

    #[test]
    fn put_error_debug_elides_the_value() {
        struct Opaque;

        let err = PutError::Cancelled(Opaque);
        assert_eq!(format!("{err:?}"), "PutError::Cancelled(..)");
    }

    #[test]
    fn take_error_predicates_match_variants() {
        assert!(TakeError::TimedOut.is_timeout());
        assert!(TakeError::Cancelled.is_cancelled());
        assert!(!TakeError::Disconnected.is_would_block());
    }
}
