// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::libc::{
    c_int,
    EINVAL,
    EIO,
};
use ::std::{
    error,
    fmt,
    io,
};
use ::yaml_rust::ScanError;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Failure of a control or teardown operation. Data path errors are counted, not returned.
#[derive(Clone, PartialEq, Eq)]
pub struct Fail {
    /// Error code.
    pub errno: c_int,
    /// Cause.
    pub cause: String,
}

/// Keeps the first failure of a sequence of steps that must all run.
#[derive(Debug, Default)]
pub struct FirstFail(Option<Fail>);

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl Fail {
    pub fn new(errno: i32, cause: &str) -> Self {
        Self {
            errno,
            cause: cause.to_string(),
        }
    }
}

impl FirstFail {
    /// Records `result` unless a failure was already recorded. Returns whether `result` was a failure.
    pub fn record(&mut self, result: Result<(), Fail>) -> bool {
        match result {
            Ok(()) => false,
            Err(e) => {
                self.0.get_or_insert(e);
                true
            },
        }
    }

    pub fn into_result(self) -> Result<(), Fail> {
        match self.0 {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl fmt::Display for Fail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error {:?}: {:?}", self.errno, self.cause)
    }
}

impl fmt::Debug for Fail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error {:?}: {:?}", self.errno, self.cause)
    }
}

impl error::Error for Fail {}

impl From<io::Error> for Fail {
    fn from(e: io::Error) -> Self {
        Self {
            errno: e.raw_os_error().unwrap_or(EIO),
            cause: format!("I/O error: {}", e),
        }
    }
}

impl From<ScanError> for Fail {
    fn from(e: ScanError) -> Self {
        Self {
            errno: EINVAL,
            cause: format!("malformed configuration ({})", e),
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
