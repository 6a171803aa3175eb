//! Secret wrapper for client credentials and refresh secrets

use std::fmt;
use std::path::Path;

use zeroize::Zeroize;

use crate::error::{Error, Result};

/// Sensitive value, redacted in Debug/Display/logs and zeroed on drop.
pub struct Secret<T: Zeroize>(T);

impl<T: Zeroize> Secret<T> {
    pub fn new(value: T) -> Self {
        Self(value)
    }

    /// Expose the inner value (use sparingly)
    pub fn expose(&self) -> &T {
        &self.0
    }
}

impl Secret<String> {
    /// Read a secret from a file, trimming surrounding whitespace.
    ///
    /// Mounted secrets usually carry a trailing newline. An empty file is an
    /// error rather than an empty credential.
    pub fn from_file(path: &Path) -> Result<Self> {
        let mut raw = std::fs::read_to_string(path)?;
        let value = raw.trim().to_owned();
        raw.zeroize();
        if value.is_empty() {
            return Err(Error::EmptySecret {
                path: path.display().to_string(),
            });
        }
        Ok(Self(value))
    }
}

impl<T: Zeroize> fmt::Debug for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> fmt::Display for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> Drop for Secret<T> {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl<T: Zeroize + Clone> Clone for Secret<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}
