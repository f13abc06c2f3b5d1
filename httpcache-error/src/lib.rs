// Copyright 2024 Cloudflare, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![warn(clippy::all)]
//! Errors of the HTTP cache transaction engine.
//!
//! An [Error] is always passed around boxed. Its [ErrorType] is what callers branch on: the
//! engine retries or falls back to the network for some cache types, and hands everything else
//! to the consumer of the transaction. The optional context and cause are for logs only.

pub use std::error::Error as ErrorTrait;
use std::borrow::Cow;
use std::fmt;

/// The boxed [Error]
pub type BError = Box<Error>;
/// `std::result::Result` over [BError] unless told otherwise
pub type Result<T, E = BError> = std::result::Result<T, E>;

/// Explanation attached to an [Error]
pub type Context = Cow<'static, str>;

type Cause = Box<dyn ErrorTrait + Send + Sync>;

#[derive(Debug)]
pub struct Error {
    pub etype: ErrorType,
    pub context: Option<Context>,
    pub cause: Option<Cause>,
}

/// What went wrong
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ErrorType {
    /// Nothing usable is stored and the request may not go to the network
    CacheMiss,
    /// The entry changed hands while waiting for it; try again
    CacheRace,
    /// Waited too long for the writer of an entry
    CacheLockTimeout,
    CacheReadFailure,
    CacheWriteFailure,
    CacheOpenFailure,
    CacheCreateFailure,
    /// Auth was needed after part of the cached body was already handed out
    CacheAuthFailureAfterRead,
    CacheEntryNotSuitable,
    /// A stored response came from a private address space the request may not reach
    CachedIpAddressSpaceBlocked,
    /// A validation response came from another address space than the stored one
    InconsistentIpAddressSpace,
    ConnectionClosed,
    ReadError,
    InvalidHTTPHeader,
    InvalidRange,
    InternalError,
    /// An error type defined outside of this crate
    Custom(&'static str),
}

impl ErrorType {
    /// Define an error type of your own. The name should be unique.
    pub const fn new(name: &'static str) -> Self {
        ErrorType::Custom(name)
    }

    pub fn as_str(&self) -> &'static str {
        use ErrorType::*;
        match self {
            CacheMiss => "CacheMiss",
            CacheRace => "CacheRace",
            CacheLockTimeout => "CacheLockTimeout",
            CacheReadFailure => "CacheReadFailure",
            CacheWriteFailure => "CacheWriteFailure",
            CacheOpenFailure => "CacheOpenFailure",
            CacheCreateFailure => "CacheCreateFailure",
            CacheAuthFailureAfterRead => "CacheAuthFailureAfterRead",
            CacheEntryNotSuitable => "CacheEntryNotSuitable",
            CachedIpAddressSpaceBlocked => "CachedIpAddressSpaceBlocked",
            InconsistentIpAddressSpace => "InconsistentIpAddressSpace",
            ConnectionClosed => "ConnectionClosed",
            ReadError => "ReadError",
            InvalidHTTPHeader => "InvalidHTTPHeader",
            InvalidRange => "InvalidRange",
            InternalError => "InternalError",
            Custom(name) => *name,
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    fn boxed(etype: ErrorType, context: Option<Context>, cause: Option<Cause>) -> BError {
        Box::new(Error {
            etype,
            context,
            cause,
        })
    }

    /// An error of `etype` and nothing else
    pub fn new(etype: ErrorType) -> BError {
        Self::boxed(etype, None, None)
    }

    /// An error of `etype` explained by `context`
    pub fn explain<S: Into<Context>>(etype: ErrorType, context: S) -> BError {
        Self::boxed(etype, Some(context.into()), None)
    }

    /// `Err` of [Error::explain]
    pub fn e_explain<T, S: Into<Context>>(etype: ErrorType, context: S) -> Result<T> {
        Err(Self::explain(etype, context))
    }

    /// An error of `etype` caused by another error.
    ///
    /// Only worth it when `context` says something the cause doesn't; otherwise surface the
    /// cause as is.
    /// ```
    /// use httpcache_error::{Error, ErrorType, Result};
    ///
    /// fn parse_size(v: &str) -> Result<u64> {
    ///     v.parse()
    ///         .map_err(|e| Error::because(ErrorType::InvalidHTTPHeader, "bad content-length", e))
    /// }
    /// assert!(parse_size("12").is_ok());
    /// ```
    pub fn because<S: Into<Context>, E: Into<Cause>>(
        etype: ErrorType,
        context: S,
        cause: E,
    ) -> BError {
        Self::boxed(etype, Some(context.into()), Some(cause.into()))
    }

    pub fn etype(&self) -> &ErrorType {
        &self.etype
    }

    /// The [ErrorType] at the bottom of a chain of [Error]s
    pub fn root_etype(&self) -> &ErrorType {
        match self.cause.as_ref().and_then(|c| c.downcast_ref::<BError>()) {
            Some(inner) => inner.root_etype(),
            None => &self.etype,
        }
    }

    // an inner Error repeating the type of its parent only shows its context
    fn fmt_chain(&self, parent: Option<&ErrorType>, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if parent != Some(&self.etype) {
            write!(f, "{}", self.etype)?;
        }
        if let Some(context) = &self.context {
            write!(f, " context: {context}")?;
        }
        let Some(cause) = &self.cause else {
            return Ok(());
        };
        write!(f, " cause: ")?;
        match cause.downcast_ref::<BError>() {
            Some(inner) => inner.fmt_chain(Some(&self.etype), f),
            None => write!(f, "{cause}"),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_chain(None, f)
    }
}

impl ErrorTrait for Error {}

/// Turn the error of a foreign [Result] into an [Error]
pub trait OrErr<T, E> {
    /// Wrap the error as the cause of a new one of `etype`
    fn or_err(self, etype: ErrorType, context: &'static str) -> Result<T>
    where
        E: Into<Cause>;

    /// [OrErr::or_err] with a context built only on failure
    fn or_err_with<C: Into<Context>, F: FnOnce() -> C>(
        self,
        etype: ErrorType,
        context: F,
    ) -> Result<T>
    where
        E: Into<Cause>;

    /// Replace the error with a new one whose context is derived from it. For errors that can't
    /// be kept as a cause.
    fn explain_err<C: Into<Context>, F: FnOnce(E) -> C>(
        self,
        etype: ErrorType,
        context: F,
    ) -> Result<T>;
}

impl<T, E> OrErr<T, E> for Result<T, E> {
    fn or_err(self, etype: ErrorType, context: &'static str) -> Result<T>
    where
        E: Into<Cause>,
    {
        self.map_err(|e| Error::because(etype, context, e))
    }

    fn or_err_with<C: Into<Context>, F: FnOnce() -> C>(
        self,
        etype: ErrorType,
        context: F,
    ) -> Result<T>
    where
        E: Into<Cause>,
    {
        self.map_err(|e| Error::because(etype, context(), e))
    }

    fn explain_err<C: Into<Context>, F: FnOnce(E) -> C>(
        self,
        etype: ErrorType,
        context: F,
    ) -> Result<T> {
        self.map_err(|e| Error::explain(etype, context(e)))
    }
}

/// Turn a `None` into an [Error]
pub trait OkOrErr<T> {
    fn or_err(self, etype: ErrorType, context: &'static str) -> Result<T>;

    fn or_err_with<C: Into<Context>, F: FnOnce() -> C>(
        self,
        etype: ErrorType,
        context: F,
    ) -> Result<T>;
}

impl<T> OkOrErr<T> for Option<T> {
    fn or_err(self, etype: ErrorType, context: &'static str) -> Result<T> {
        self.ok_or_else(|| Error::explain(etype, context))
    }

    fn or_err_with<C: Into<Context>, F: FnOnce() -> C>(
        self,
        etype: ErrorType,
        context: F,
    ) -> Result<T> {
        self.ok_or_else(|| Error::explain(etype, context()))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_display_chain() {
        let read = Error::explain(ErrorType::CacheReadFailure, "stream 0 is gone");
        let e = Error::because(ErrorType::CacheReadFailure, "reading headers", read);
        assert_eq!(
            e.to_string(),
            "CacheReadFailure context: reading headers cause:  context: stream 0 is gone"
        );

        let e = Error::because(ErrorType::InternalError, "restart", e);
        assert_eq!(e.root_etype(), &ErrorType::CacheReadFailure);
    }

    #[test]
    fn test_foreign_cause() {
        let e = "x".parse::<u64>().or_err(ErrorType::InvalidHTTPHeader, "bad age");
        let e = e.unwrap_err();
        assert_eq!(e.etype(), &ErrorType::InvalidHTTPHeader);
        assert!(e.to_string().starts_with("InvalidHTTPHeader context: bad age cause: "));
        // a foreign cause ends the chain
        assert_eq!(e.root_etype(), &ErrorType::InvalidHTTPHeader);

        let e = "x"
            .parse::<u64>()
            .explain_err(ErrorType::InvalidRange, |e| format!("range: {e}"))
            .unwrap_err();
        assert!(e.cause.is_none());
        assert_eq!(e.to_string(), "InvalidRange context: range: invalid digit found in string");
    }

    #[test]
    fn test_option() {
        assert_eq!(Some(3).or_err(ErrorType::CacheMiss, "unused").unwrap(), 3);

        let none: Option<u8> = None;
        let e = none.or_err(ErrorType::CacheMiss, "only from cache").unwrap_err();
        assert_eq!(e.to_string(), "CacheMiss context: only from cache");
        let e = none
            .or_err_with(ErrorType::CacheEntryNotSuitable, || format!("{} bytes", 0))
            .unwrap_err();
        assert_eq!(e.to_string(), "CacheEntryNotSuitable context: 0 bytes");
    }

    #[test]
    fn test_custom_type() {
        const MINE: ErrorType = ErrorType::new("Mine");
        assert_eq!(Error::new(MINE).to_string(), "Mine");
        assert_eq!(ErrorType::CacheLockTimeout.as_str(), "CacheLockTimeout");
    }
}
