//! Errors produced by the resolver driver.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use std::{error, fmt};

use crate::stub::{StubCode, StubError};

//------------ Error ---------------------------------------------------------

/// An error produced while driving a resolution request.
///
/// The variants mirror the small set of outcomes the driver
/// distinguishes. Everything the stub reports other than cancellation and
/// a definitive "no such record" is carried verbatim in [`Error::Stub`],
/// annotated with the query type and name it belongs to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// The caller handed us something unusable.
    InvalidArgument(String),

    /// The stub failed the query.
    Stub {
        /// The query type the failure belongs to.
        qtype: &'static str,

        /// The name that was being resolved.
        name: String,

        /// The failure the stub reported.
        error: StubError,
    },

    /// The stub definitively reported that no matching record exists.
    NotFound {
        /// The query type the lookup ran with.
        qtype: &'static str,

        /// The name that was being resolved.
        name: String,
    },

    /// The stub channel could not be created or configured.
    ChannelSetup(StubError),

    /// The overall resolution timer fired before the request completed.
    DeadlineExceeded,

    /// The request was cancelled.
    ///
    /// Never surfaces through a completion callback: cancellation is
    /// silent. The variant exists for polled-fd shutdown statuses and
    /// internal bookkeeping.
    Cancelled,

    /// Several sub-queries failed; all their errors, in query order.
    Multi(Vec<Error>),
}

impl Error {
    /// Translates a stub failure into a driver error.
    ///
    /// A definitive "no such record" becomes [`Error::NotFound`];
    /// everything else is wrapped verbatim. Cancellation is not special
    /// here: whether a completion may reach the user is decided from
    /// request state, not from the error.
    pub fn from_stub(
        qtype: &'static str,
        name: &str,
        err: StubError,
    ) -> Self {
        match err.code() {
            StubCode::NotFound => Error::NotFound {
                qtype,
                name: name.into(),
            },
            _ => Error::Stub {
                qtype,
                name: name.into(),
                error: err,
            },
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgument(msg) => {
                write!(f, "invalid argument: {}", msg)
            }
            Error::Stub { qtype, name, error } => {
                write!(
                    f,
                    "stub status is not ok qtype={} name={}: {}",
                    qtype, name, error
                )
            }
            Error::NotFound { qtype, name } => {
                write!(f, "record not found qtype={} name={}", qtype, name)
            }
            Error::ChannelSetup(error) => {
                write!(f, "stub channel setup failed: {}", error)
            }
            Error::DeadlineExceeded => write!(f, "deadline exceeded"),
            Error::Cancelled => write!(f, "resolution cancelled"),
            Error::Multi(errors) => {
                let mut first = true;
                for err in errors {
                    if !first {
                        write!(f, "; ")?;
                    }
                    first = false;
                    write!(f, "{}", err)?;
                }
                Ok(())
            }
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::InvalidArgument(_) => None,
            Error::Stub { error, .. } => Some(error),
            Error::NotFound { .. } => None,
            Error::ChannelSetup(error) => Some(error),
            Error::DeadlineExceeded => None,
            Error::Cancelled => None,
            Error::Multi(errors) => errors
                .first()
                .map(|err| err as &(dyn error::Error + 'static)),
        }
    }
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_error_is_annotated() {
        let err = Error::from_stub(
            "A",
            "example.test",
            StubError::new(StubCode::ServerFailure, "SERVFAIL"),
        );
        let msg = err.to_string();
        assert!(msg.contains("qtype=A"));
        assert!(msg.contains("name=example.test"));
        assert!(msg.contains("SERVFAIL"));
    }

    #[test]
    fn not_found_maps_to_its_own_kind() {
        assert_eq!(
            Error::from_stub(
                "SRV",
                "_ldap._tcp.example.test",
                StubError::new(StubCode::NotFound, "no such record"),
            ),
            Error::NotFound {
                qtype: "SRV",
                name: "_ldap._tcp.example.test".into()
            }
        );
    }

    #[test]
    fn wrapped_errors_expose_their_source() {
        use std::error::Error as _;

        let stub_err = StubError::new(StubCode::Refused, "REFUSED");
        let err = Error::from_stub("A", "example.test", stub_err.clone());
        let source = err.source().expect("stub failure has a source");
        assert_eq!(source.to_string(), stub_err.to_string());

        let err = Error::ChannelSetup(stub_err.clone());
        let source = err.source().expect("setup failure has a source");
        assert_eq!(source.to_string(), stub_err.to_string());

        assert!(Error::DeadlineExceeded.source().is_none());
        assert!(Error::Cancelled.source().is_none());
    }

    #[test]
    fn multi_renders_all_children() {
        let err = Error::Multi(vec![
            Error::Stub {
                qtype: "AAAA",
                name: "example.test".into(),
                error: StubError::new(StubCode::ServerFailure, "SERVFAIL"),
            },
            Error::Stub {
                qtype: "A",
                name: "example.test".into(),
                error: StubError::new(StubCode::ServerFailure, "SERVFAIL"),
            },
        ]);
        let msg = err.to_string();
        assert!(msg.contains("qtype=AAAA"));
        assert!(msg.contains("qtype=A"));
    }
}
