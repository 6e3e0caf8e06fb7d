//! Kernel Return Codes
//!
//! Every kernel entry point returns a [`KernResult`]. Caller input errors are
//! always recoverable and reported through [`KernError`]; violations of the
//! kernel's own invariants are not errors, they halt the system.
//!
//! When a result has to cross the supervisor-call boundary it is encoded in
//! the thread's saved return register: zero or a positive value for success,
//! the negated [`KernError::code`] for failure.

use core::fmt;

/// Kernel error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum KernError {
    /// Bad size, null pointer, misalignment or out-of-range value
    InvalidArgument = 22,
    /// Capability check failed
    PermissionDenied = 1,
    /// Name or handle lookup missed
    NotFound = 2,
    /// Name already registered
    AlreadyExists = 17,
    /// Address translation or copy failed
    Fault = 14,
    /// Blocking call aborted by an exception
    Interrupted = 4,
    /// Operation on an entity in the wrong state
    InvalidState = 77,
    /// Page, slot or segment allocation failed
    ResourceExhausted = 12,
    /// The object was destroyed while the caller waited on it
    ObjectDeleted = 43,
    /// The IPC peer died mid-transaction; the call may be retried
    Again = 11,
    /// A previous transaction is still outstanding
    Busy = 16,
    /// The caller would wait on itself
    Deadlock = 35,
}

/// Result type for kernel operations
pub type KernResult<T> = Result<T, KernError>;

impl KernError {
    /// errno-style code of this error
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Decode a code produced by [`KernError::code`]
    pub fn from_code(code: i32) -> Option<Self> {
        let err = match code {
            22 => Self::InvalidArgument,
            1 => Self::PermissionDenied,
            2 => Self::NotFound,
            17 => Self::AlreadyExists,
            14 => Self::Fault,
            4 => Self::Interrupted,
            77 => Self::InvalidState,
            12 => Self::ResourceExhausted,
            43 => Self::ObjectDeleted,
            11 => Self::Again,
            16 => Self::Busy,
            35 => Self::Deadlock,
            _ => return None,
        };
        Some(err)
    }

    /// Short name for diagnostics
    pub fn name(self) -> &'static str {
        match self {
            Self::InvalidArgument => "invalid argument",
            Self::PermissionDenied => "permission denied",
            Self::NotFound => "not found",
            Self::AlreadyExists => "already exists",
            Self::Fault => "bad address",
            Self::Interrupted => "interrupted",
            Self::InvalidState => "invalid state",
            Self::ResourceExhausted => "out of resources",
            Self::ObjectDeleted => "object deleted",
            Self::Again => "peer gone, try again",
            Self::Busy => "busy",
            Self::Deadlock => "deadlock",
        }
    }
}

impl fmt::Display for KernError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Encode a result for a thread's return register
pub fn encode_result(result: KernResult<usize>) -> isize {
    match result {
        Ok(value) => value as isize,
        Err(err) => -(err.code() as isize),
    }
}

/// Decode a return register value produced by [`encode_result`]
pub fn decode_result(raw: isize) -> KernResult<usize> {
    if raw >= 0 {
        return Ok(raw as usize);
    }
    // An unknown negative code can only come from a corrupted context.
    match KernError::from_code(-raw as i32) {
        Some(err) => Err(err),
        None => panic!("corrupted return register: {}", raw),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_distinct_and_decodable() {
        let all = [
            KernError::InvalidArgument,
            KernError::PermissionDenied,
            KernError::NotFound,
            KernError::AlreadyExists,
            KernError::Fault,
            KernError::Interrupted,
            KernError::InvalidState,
            KernError::ResourceExhausted,
            KernError::ObjectDeleted,
            KernError::Again,
            KernError::Busy,
            KernError::Deadlock,
        ];
        for err in all {
            assert_eq!(KernError::from_code(err.code()), Some(err));
            assert_eq!(all.iter().filter(|e| e.code() == err.code()).count(), 1);
        }
    }

    #[test]
    fn test_return_register_encoding() {
        assert_eq!(decode_result(encode_result(Ok(5))), Ok(5));
        assert_eq!(
            decode_result(encode_result(Err(KernError::Interrupted))),
            Err(KernError::Interrupted)
        );
        assert_eq!(encode_result(Err(KernError::PermissionDenied)), -1);
    }
}
