//! Simple cross-platform memory mappings.
//!
//! A [`Mapping`] owns one mapped region: a file, anonymous memory, or a named shared memory
//! object. Creating a mapping only fails outright when the process can't allocate the handle's
//! own state. Operating system failures produce a handle that reports `is_valid() == false` and
//! carries the reason in [`Mapping::error`].



mod access;
mod map;

pub use map::*;



use std::collections::TryReserveError;



pub type Result<T> = std::result::Result<T, Error>;

/// The longest diagnostic message a failed handle retains, in bytes.
pub const MAX_ERROR_LEN: usize = 511;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Memory for the mapping's own bookkeeping could not be reserved.
    #[error("failed to allocate mapping state: {0}")]
    Alloc(#[from] TryReserveError),
    /// An operating system call failed.
    #[error("{op}: {source}")]
    Os {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },
    /// Attempted to create a map that was of length zero.
    #[error("cannot map a region of length zero")]
    MapSizeZero,
    /// The backing object is larger than the address space.
    #[error("region of {0} bytes does not fit in the address space")]
    MapTooLarge(u64),
    /// Shared memory names can't contain NUL bytes.
    #[error("invalid shared memory name {0:?}")]
    InvalidName(String),
    /// A failed mapping was converted with [`Mapping::ok`].
    #[error("mapping failed: {0}")]
    Failed(String),
}

impl Error {
    pub(crate) fn os(op: &'static str, source: impl Into<std::io::Error>) -> Self {
        Self::Os { op, source: source.into() }
    }

    /// Returns `true` for errors that leave no handle behind.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Alloc(_))
    }

    /// Renders this error into an owned message of at most [`MAX_ERROR_LEN`] bytes.
    pub(crate) fn capture(&self) -> Result<String> {
        let text = self.to_string();
        let mut end = text.len().min(MAX_ERROR_LEN);
        while !text.is_char_boundary(end) {
            end -= 1;
        }

        let mut message = String::new();
        message.try_reserve_exact(end)?;
        message.push_str(&text[..end]);

        Ok(message)
    }
}

/// Copies `s` into a new `String`, reporting allocation failure instead of aborting.
pub(crate) fn try_to_owned(s: &str) -> Result<String> {
    let mut owned = String::new();
    owned.try_reserve_exact(s.len())?;
    owned.push_str(s);
    Ok(owned)
}



#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_keeps_short_messages() {
        let err = Error::os("open", std::io::Error::from(std::io::ErrorKind::NotFound));
        let message = err.capture().unwrap();
        assert!(message.starts_with("open: "));
        assert_eq!(message, err.to_string());
    }

    #[test]
    fn capture_truncates_on_char_boundary() {
        // Each 'é' is two bytes, so the limit falls in the middle of one.
        let err = Error::InvalidName("é".repeat(400));
        let message = err.capture().unwrap();
        assert!(message.len() <= MAX_ERROR_LEN);
        assert!(message.len() >= MAX_ERROR_LEN - 1);
        assert!(err.to_string().starts_with(&message));
    }

    #[test]
    fn fallible_copy_matches_source() {
        assert_eq!(try_to_owned("Local\\block").unwrap(), "Local\\block");
        assert_eq!(try_to_owned("").unwrap(), "");
    }

    #[test]
    fn only_alloc_is_fatal() {
        let mut v: Vec<u8> = Vec::new();
        let alloc = Error::from(v.try_reserve(usize::MAX).unwrap_err());
        assert!(alloc.is_fatal());
        assert!(!Error::MapSizeZero.is_fatal());
        assert!(!Error::Failed(String::new()).is_fatal());
    }
}
