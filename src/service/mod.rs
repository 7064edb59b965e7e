//! The user-facing service layer: association setup and the
//! C-ECHO, C-STORE, C-FIND, C-GET and C-MOVE operations,
//! on both the service class user and provider sides.

pub mod scp;
pub mod scu;

pub use scp::{ServiceProviderHandler, ServiceProviderOptions};
pub use scu::{CFindResults, CMoveProgress, ServiceUser, ServiceUserOptions, SubOperationSummary};

use std::time::Duration;

use dicom_core::value::ConvertValueError;
use dicom_core::{DataElement, PrimitiveValue, Tag, VR};
use dicom_dictionary_std::tags;
use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};

use crate::machine;
use crate::pdu::{AbortRQSource, AssociationRJResult, AssociationRJSource};

/// The application context name of the DICOM application context.
pub const APPLICATION_CONTEXT_NAME: &str = "1.2.840.10008.3.1.1.1";

/// The default per-operation deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

pub(crate) const IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";
pub(crate) const EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// missing abstract syntax to begin negotiation
    MissingAbstractSyntax { backtrace: Backtrace },

    /// could not connect to peer
    Connect {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// could not bind the listening socket
    Listen {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// could not start the association tasks
    Machine {
        #[snafu(backtrace)]
        source: machine::Error,
    },

    #[snafu(display("association rejected ({:?}, {:?})", result, source))]
    Rejected {
        result: AssociationRJResult,
        #[snafu(source(false))]
        source: AssociationRJSource,
    },

    #[snafu(display("association aborted ({:?})", source))]
    Aborted {
        #[snafu(source(false))]
        source: AbortRQSource,
    },

    /// no presentation contexts accepted by the peer
    NoAcceptedPresentationContexts { backtrace: Backtrace },

    #[snafu(display("no accepted presentation context for {}", abstract_syntax))]
    NoMatchingContext {
        abstract_syntax: String,
        backtrace: Backtrace,
    },

    /// operation timed out
    Timeout { backtrace: Backtrace },

    #[snafu(display("operation failed with status {:#06x}", code))]
    Status {
        code: u16,
        comment: Option<String>,
        backtrace: Backtrace,
    },

    #[snafu(display("unexpected response to message {}", message_id))]
    UnexpectedResponse {
        message_id: u16,
        backtrace: Backtrace,
    },

    #[snafu(display("transfer syntax {} is not supported", uid))]
    UnsupportedTransferSyntax { uid: String, backtrace: Backtrace },

    #[snafu(display("could not read data set: {}", source))]
    ReadDataSet {
        #[snafu(source(from(dicom_object::ReadError, Box::new)))]
        source: Box<dicom_object::ReadError>,
    },

    #[snafu(display("could not write data set: {}", source))]
    WriteDataSet {
        #[snafu(source(from(dicom_object::WriteError, Box::new)))]
        source: Box<dicom_object::WriteError>,
    },

    #[snafu(display("data set has no {} attribute", tag))]
    MissingAttribute { tag: Tag, backtrace: Backtrace },

    #[snafu(display("invalid value in {} attribute: {}", tag, source))]
    InvalidAttribute {
        tag: Tag,
        source: ConvertValueError,
        backtrace: Backtrace,
    },

    /// the association tasks have ended
    Closed { backtrace: Backtrace },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The hierarchy level of a query/retrieve operation,
/// carried as _QueryRetrieveLevel_ (0008,0052).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryRetrieveLevel {
    Patient,
    Study,
    Series,
    Image,
}

impl QueryRetrieveLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            QueryRetrieveLevel::Patient => "PATIENT",
            QueryRetrieveLevel::Study => "STUDY",
            QueryRetrieveLevel::Series => "SERIES",
            QueryRetrieveLevel::Image => "IMAGE",
        }
    }
}

impl std::fmt::Display for QueryRetrieveLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Insert the query/retrieve level element when the query
/// does not define one itself.
pub(crate) fn apply_query_level(query: &mut InMemDicomObject, level: QueryRetrieveLevel) {
    if query.get(tags::QUERY_RETRIEVE_LEVEL).is_none() {
        query.put(DataElement::new(
            tags::QUERY_RETRIEVE_LEVEL,
            VR::CS,
            PrimitiveValue::from(level.as_str()),
        ));
    }
}

/// Serialize a data set with the given transfer syntax.
pub(crate) fn serialize_dataset(object: &InMemDicomObject, transfer_syntax: &str) -> Result<Vec<u8>> {
    let ts = TransferSyntaxRegistry
        .get(transfer_syntax)
        .context(UnsupportedTransferSyntaxSnafu {
            uid: transfer_syntax,
        })?;
    let mut bytes = Vec::new();
    object
        .write_dataset_with_ts(&mut bytes, ts)
        .context(WriteDataSetSnafu)?;
    Ok(bytes)
}

/// Parse a data set encoded with the given transfer syntax.
pub(crate) fn parse_dataset(bytes: &[u8], transfer_syntax: &str) -> Result<InMemDicomObject> {
    let ts = TransferSyntaxRegistry
        .get(transfer_syntax)
        .context(UnsupportedTransferSyntaxSnafu {
            uid: transfer_syntax,
        })?;
    InMemDicomObject::read_dataset_with_ts(bytes, ts).context(ReadDataSetSnafu)
}

/// Fetch a trimmed string attribute from a data set.
pub(crate) fn element_str(object: &InMemDicomObject, tag: Tag) -> Result<String> {
    let element = object.get(tag).context(MissingAttributeSnafu { tag })?;
    let value = element.to_str().context(InvalidAttributeSnafu { tag })?;
    Ok(value
        .trim_matches(|c: char| c == ' ' || c == '\0')
        .to_string())
}
