//! DICOM message service element (DIMSE) module
//!
//! This module builds message exchange on top of an established association:
//! command sets are encoded and decoded as implicit VR little endian
//! data sets of group `0000` elements,
//! while data sets travel as opaque payloads
//! in the transfer syntax agreed for their presentation context.
//!
//! - The [`command`] module holds the [`CommandSet`] value object
//!   and its codec.
//! - The [`exchange`] module drives outbound service invocations,
//!   keeping track of pending exchanges by message ID.
//! - The [`dispatch`] module routes inbound requests
//!   to registered service handlers.
pub mod command;
pub mod dispatch;
pub mod exchange;

use bytes::Bytes;
use snafu::{Backtrace, Snafu};

pub use command::CommandSet;
pub use dispatch::{
    Dispatcher, HandlerOutcome, ResponseProducer, ServiceException, ServiceHandler,
    ServiceRegistry,
};
pub use exchange::{Requestor, ResponseHandle};

/// Status code reported on successful completion.
pub const STATUS_SUCCESS: u16 = 0x0000;
/// Status code of an intermediate response with all keys matched.
pub const STATUS_PENDING: u16 = 0xFF00;
/// Status code of an intermediate response with optional keys unmatched.
pub const STATUS_PENDING_WARNING: u16 = 0xFF01;
/// Status code reported when an operation was canceled by the peer.
pub const STATUS_CANCELED: u16 = 0xFE00;
/// Status code reported on completion with warnings.
pub const STATUS_WARNING: u16 = 0xB000;
/// Failure status: no such SOP class.
pub const STATUS_NO_SUCH_SOP_CLASS: u16 = 0x0118;
/// Failure status: unrecognized operation.
pub const STATUS_UNRECOGNIZED_OPERATION: u16 = 0x0211;

/// Whether the given status code is an intermediate (pending) one.
pub fn is_pending(status: u16) -> bool {
    status == STATUS_PENDING || status == STATUS_PENDING_WARNING
}

/// One whole DIMSE message:
/// a command set and, when the command announces one,
/// an opaque data set in the transfer syntax
/// negotiated for the presentation context.
#[derive(Debug, Clone, PartialEq)]
pub struct DimseMessage {
    /// the presentation context this message travels on
    pub presentation_context_id: u8,
    /// the command set
    pub command: CommandSet,
    /// the accompanying data set, if any
    pub data: Option<Bytes>,
}

impl DimseMessage {
    /// Create a message with no data set.
    pub fn command_only(presentation_context_id: u8, command: CommandSet) -> Self {
        DimseMessage {
            presentation_context_id,
            command,
            data: None,
        }
    }

    /// Create a message carrying a data set.
    pub fn with_data(
        presentation_context_id: u8,
        command: CommandSet,
        data: impl Into<Bytes>,
    ) -> Self {
        DimseMessage {
            presentation_context_id,
            command,
            data: Some(data.into()),
        }
    }
}

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// association level failure
    #[non_exhaustive]
    Association {
        #[snafu(backtrace)]
        source: crate::association::Error,
    },

    /// message IDs exhausted for this association
    MessageIdsExhausted { backtrace: Backtrace },

    /// the exchange was closed before a terminal response arrived
    ExchangeClosed { backtrace: Backtrace },

    /// failed to share the transport between reader and writer
    SplitStream {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// failed to fragment outgoing message
    #[non_exhaustive]
    Fragment {
        #[snafu(backtrace)]
        source: crate::association::pdata::Error,
    },

    /// failed to encode outgoing PDU
    #[non_exhaustive]
    EncodePdu {
        #[snafu(backtrace)]
        source: crate::pdu::writer::Error,
    },

    /// failed to send PDU message on wire
    WireSend {
        source: std::io::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::is_pending;

    #[test]
    fn pending_statuses() {
        assert!(is_pending(0xFF00));
        assert!(is_pending(0xFF01));
        assert!(!is_pending(0x0000));
        assert!(!is_pending(0xFE00));
    }
}
