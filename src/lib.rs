//! This crate implements the DICOM upper layer protocol:
//! association negotiation over TCP, the DIMSE C-services
//! (C-ECHO, C-STORE, C-FIND, C-GET, C-MOVE)
//! and the transport of data sets through P-DATA-TF PDUs.
//!
//! - The [`pdu`] module holds the protocol data unit types
//!   and their wire codec.
//! - The [`dimse`] module holds the DIMSE command set messages,
//!   their codec, and the reassembly of fragmented messages.
//! - The [`context`] module negotiates and indexes
//!   presentation contexts.
//! - The [`machine`] module drives the upper layer state machine,
//!   one reader/driver/writer task triple per association.
//! - The [`service`] module is the user-facing surface:
//!   [`ServiceUserOptions`] requests associations and issues
//!   operations, [`ServiceProviderOptions`] accepts associations
//!   and dispatches requests to application handlers.
//!
//! ## Example
//!
//! ```no_run
//! use dicom_dul::service::ServiceUserOptions;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut scu = ServiceUserOptions::new()
//!     .calling_ae_title("ECHO-SCU")
//!     .with_abstract_syntax("1.2.840.10008.1.1")
//!     .connect("127.0.0.1:11112")?;
//! scu.c_echo()?;
//! scu.release()?;
//! # Ok(())
//! # }
//! ```

pub mod context;
pub mod dimse;
pub mod io;
pub mod machine;
pub mod pdu;
pub mod service;

/// The implementation class UID of this library,
/// emitted in the user information item of every association.
pub const IMPLEMENTATION_CLASS_UID: &str = "1.2.826.0.1.3680043.10.786.1.1.1";

/// The implementation version name of this library.
///
/// This name may change between versions.
pub const IMPLEMENTATION_VERSION_NAME: &str = "DICOM-DUL 0.1";

// re-exports

pub use context::{ContextManager, PresentationContext, Role};
pub use dimse::{CommandAssembler, DimseMessage, Message};
pub use pdu::{read_pdu, write_pdu, Pdu};
pub use service::{
    QueryRetrieveLevel, ServiceProviderHandler, ServiceProviderOptions, ServiceUser,
    ServiceUserOptions,
};
