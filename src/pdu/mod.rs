//! Protocol data unit (PDU) definitions for the DICOM upper layer,
//! as per the standard, part 8, section 9.3.
//!
//! All seven PDU types are represented by the [`Pdu`] enum.
//! [`read_pdu`] and [`write_pdu`] convert between PDUs and their
//! big-endian wire form.

pub mod reader;
pub mod writer;

#[cfg(test)]
mod test;

pub use reader::read_pdu;
pub use writer::write_pdu;

/// The default maximum PDU size, in bytes.
pub const DEFAULT_MAX_PDU: u32 = 16_384;

/// The smallest maximum PDU size accepted by this implementation.
pub const MINIMUM_PDU_SIZE: u32 = 4_096;

/// The largest maximum PDU size accepted by this implementation.
pub const MAXIMUM_PDU_SIZE: u32 = 131_072;

/// The length of the common PDU header: type, reserved byte,
/// and the 4-byte payload length.
pub const PDU_HEADER_SIZE: u32 = 6;

/// A DICOM upper layer protocol data unit.
#[derive(Debug, Clone, PartialEq)]
pub enum Pdu {
    /// A-ASSOCIATE-RQ
    AssociationRQ {
        protocol_version: u16,
        calling_ae_title: String,
        called_ae_title: String,
        application_context_name: String,
        presentation_contexts: Vec<PresentationContextProposed>,
        user_variables: Vec<UserVariableItem>,
    },
    /// A-ASSOCIATE-AC
    AssociationAC {
        protocol_version: u16,
        calling_ae_title: String,
        called_ae_title: String,
        application_context_name: String,
        presentation_contexts: Vec<PresentationContextResult>,
        user_variables: Vec<UserVariableItem>,
    },
    /// A-ASSOCIATE-RJ
    AssociationRJ {
        result: AssociationRJResult,
        source: AssociationRJSource,
    },
    /// P-DATA-TF
    PData { data: Vec<PDataValue> },
    /// A-RELEASE-RQ
    ReleaseRQ,
    /// A-RELEASE-RP
    ReleaseRP,
    /// A-ABORT
    AbortRQ { source: AbortRQSource },
}

impl Pdu {
    /// A single-line description of the PDU, suitable for logging.
    pub fn short_description(&self) -> String {
        match self {
            Pdu::AssociationRQ {
                calling_ae_title,
                called_ae_title,
                presentation_contexts,
                ..
            } => format!(
                "A-ASSOCIATE-RQ {} -> {} ({} presentation contexts)",
                calling_ae_title,
                called_ae_title,
                presentation_contexts.len()
            ),
            Pdu::AssociationAC {
                presentation_contexts,
                ..
            } => format!(
                "A-ASSOCIATE-AC ({} presentation contexts)",
                presentation_contexts.len()
            ),
            Pdu::AssociationRJ { result, source } => {
                format!("A-ASSOCIATE-RJ ({:?}, {:?})", result, source)
            }
            Pdu::PData { data } => {
                let total: usize = data.iter().map(|pdv| pdv.data.len()).sum();
                format!("P-DATA-TF ({} values, {} bytes)", data.len(), total)
            }
            Pdu::ReleaseRQ => "A-RELEASE-RQ".to_string(),
            Pdu::ReleaseRP => "A-RELEASE-RP".to_string(),
            Pdu::AbortRQ { source } => format!("A-ABORT ({:?})", source),
        }
    }
}

/// A presentation context as proposed in an A-ASSOCIATE-RQ:
/// one abstract syntax and the transfer syntaxes offered for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentationContextProposed {
    /// the presentation context identifier, an odd integer
    pub id: u8,
    pub abstract_syntax: String,
    pub transfer_syntaxes: Vec<String>,
}

/// The outcome of one presentation context negotiation,
/// as carried in an A-ASSOCIATE-AC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentationContextResult {
    /// the presentation context identifier, an odd integer
    pub id: u8,
    pub reason: PresentationContextResultReason,
    /// the accepted transfer syntax;
    /// not significant unless `reason` is `Acceptance`
    pub transfer_syntax: String,
}

/// The result/reason field of a presentation context response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentationContextResultReason {
    Acceptance = 0,
    UserRejection = 1,
    NoReason = 2,
    AbstractSyntaxNotSupported = 3,
    TransferSyntaxesNotSupported = 4,
}

impl PresentationContextResultReason {
    pub fn from(reason: u8) -> Option<Self> {
        match reason {
            0 => Some(PresentationContextResultReason::Acceptance),
            1 => Some(PresentationContextResultReason::UserRejection),
            2 => Some(PresentationContextResultReason::NoReason),
            3 => Some(PresentationContextResultReason::AbstractSyntaxNotSupported),
            4 => Some(PresentationContextResultReason::TransferSyntaxesNotSupported),
            _ => None,
        }
    }
}

/// The result field of an A-ASSOCIATE-RJ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationRJResult {
    Permanent,
    Transient,
}

impl AssociationRJResult {
    pub fn from(code: u8) -> Option<Self> {
        match code {
            1 => Some(AssociationRJResult::Permanent),
            2 => Some(AssociationRJResult::Transient),
            _ => None,
        }
    }

    pub(crate) fn code(self) -> u8 {
        match self {
            AssociationRJResult::Permanent => 1,
            AssociationRJResult::Transient => 2,
        }
    }
}

/// The source and reason of an A-ASSOCIATE-RJ,
/// per the code tables of part 8, section 9.3.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationRJSource {
    ServiceUser(AssociationRJServiceUserReason),
    ServiceProviderAcse(AssociationRJServiceProviderAcseReason),
    ServiceProviderPresentation(AssociationRJServiceProviderPresentationReason),
}

impl AssociationRJSource {
    pub fn from(source: u8, reason: u8) -> Option<Self> {
        match source {
            1 => {
                let reason = match reason {
                    1 => AssociationRJServiceUserReason::NoReasonGiven,
                    2 => AssociationRJServiceUserReason::ApplicationContextNameNotSupported,
                    3 => AssociationRJServiceUserReason::CallingAETitleNotRecognized,
                    7 => AssociationRJServiceUserReason::CalledAETitleNotRecognized,
                    code => AssociationRJServiceUserReason::Reserved(code),
                };
                Some(AssociationRJSource::ServiceUser(reason))
            }
            2 => {
                let reason = match reason {
                    1 => AssociationRJServiceProviderAcseReason::NoReasonGiven,
                    2 => AssociationRJServiceProviderAcseReason::ProtocolVersionNotSupported,
                    _ => return None,
                };
                Some(AssociationRJSource::ServiceProviderAcse(reason))
            }
            3 => {
                let reason = match reason {
                    1 => AssociationRJServiceProviderPresentationReason::TemporaryCongestion,
                    2 => AssociationRJServiceProviderPresentationReason::LocalLimitExceeded,
                    code => AssociationRJServiceProviderPresentationReason::Reserved(code),
                };
                Some(AssociationRJSource::ServiceProviderPresentation(reason))
            }
            _ => None,
        }
    }

    pub(crate) fn codes(self) -> (u8, u8) {
        match self {
            AssociationRJSource::ServiceUser(reason) => {
                let reason = match reason {
                    AssociationRJServiceUserReason::NoReasonGiven => 1,
                    AssociationRJServiceUserReason::ApplicationContextNameNotSupported => 2,
                    AssociationRJServiceUserReason::CallingAETitleNotRecognized => 3,
                    AssociationRJServiceUserReason::CalledAETitleNotRecognized => 7,
                    AssociationRJServiceUserReason::Reserved(code) => code,
                };
                (1, reason)
            }
            AssociationRJSource::ServiceProviderAcse(reason) => {
                let reason = match reason {
                    AssociationRJServiceProviderAcseReason::NoReasonGiven => 1,
                    AssociationRJServiceProviderAcseReason::ProtocolVersionNotSupported => 2,
                };
                (2, reason)
            }
            AssociationRJSource::ServiceProviderPresentation(reason) => {
                let reason = match reason {
                    AssociationRJServiceProviderPresentationReason::TemporaryCongestion => 1,
                    AssociationRJServiceProviderPresentationReason::LocalLimitExceeded => 2,
                    AssociationRJServiceProviderPresentationReason::Reserved(code) => code,
                };
                (3, reason)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationRJServiceUserReason {
    NoReasonGiven,
    ApplicationContextNameNotSupported,
    CallingAETitleNotRecognized,
    CalledAETitleNotRecognized,
    Reserved(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationRJServiceProviderAcseReason {
    NoReasonGiven,
    ProtocolVersionNotSupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationRJServiceProviderPresentationReason {
    TemporaryCongestion,
    LocalLimitExceeded,
    Reserved(u8),
}

/// The source and reason of an A-ABORT,
/// per the code table of part 8, section 9.3.8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortRQSource {
    ServiceUser,
    Reserved,
    ServiceProvider(AbortRQServiceProviderReason),
}

impl AbortRQSource {
    pub fn from(source: u8, reason: u8) -> Option<Self> {
        match source {
            0 => Some(AbortRQSource::ServiceUser),
            1 => Some(AbortRQSource::Reserved),
            2 => {
                let reason = match reason {
                    0 => AbortRQServiceProviderReason::ReasonNotSpecified,
                    1 => AbortRQServiceProviderReason::UnrecognizedPdu,
                    2 => AbortRQServiceProviderReason::UnexpectedPdu,
                    3 => AbortRQServiceProviderReason::Reserved,
                    4 => AbortRQServiceProviderReason::UnrecognizedPduParameter,
                    5 => AbortRQServiceProviderReason::UnexpectedPduParameter,
                    6 => AbortRQServiceProviderReason::InvalidPduParameter,
                    _ => return None,
                };
                Some(AbortRQSource::ServiceProvider(reason))
            }
            _ => None,
        }
    }

    pub(crate) fn codes(self) -> (u8, u8) {
        match self {
            AbortRQSource::ServiceUser => (0, 0),
            AbortRQSource::Reserved => (1, 0),
            AbortRQSource::ServiceProvider(reason) => {
                let reason = match reason {
                    AbortRQServiceProviderReason::ReasonNotSpecified => 0,
                    AbortRQServiceProviderReason::UnrecognizedPdu => 1,
                    AbortRQServiceProviderReason::UnexpectedPdu => 2,
                    AbortRQServiceProviderReason::Reserved => 3,
                    AbortRQServiceProviderReason::UnrecognizedPduParameter => 4,
                    AbortRQServiceProviderReason::UnexpectedPduParameter => 5,
                    AbortRQServiceProviderReason::InvalidPduParameter => 6,
                };
                (2, reason)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortRQServiceProviderReason {
    ReasonNotSpecified,
    UnrecognizedPdu,
    UnexpectedPdu,
    Reserved,
    UnrecognizedPduParameter,
    UnexpectedPduParameter,
    InvalidPduParameter,
}

/// A single presentation data value item of a P-DATA-TF PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PDataValue {
    pub presentation_context_id: u8,
    pub value_type: PDataValueType,
    /// whether this is the final fragment of its message stream
    pub is_last: bool,
    pub data: Vec<u8>,
}

/// Whether a presentation data value fragment carries
/// command set bytes or data set bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PDataValueType {
    Command,
    Data,
}

/// A variable item of an A-ASSOCIATE-RQ/AC PDU.
#[derive(Debug, Clone, PartialEq)]
pub enum PduVariableItem {
    Unknown(u8),
    ApplicationContext(String),
    PresentationContextProposed(PresentationContextProposed),
    PresentationContextResult(PresentationContextResult),
    UserVariables(Vec<UserVariableItem>),
}

/// A sub-item of the user information item.
///
/// Items this implementation does not interpret are preserved
/// opaquely so that a decoded PDU re-encodes without loss.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserVariableItem {
    /// Maximum length admitted for received P-DATA-TF PDUs (type 51H)
    MaxLength(u32),
    /// Implementation class UID (type 52H)
    ImplementationClassUID(String),
    /// Implementation version name (type 55H)
    ImplementationVersionName(String),
    /// Asynchronous operations window (type 53H)
    AsyncOperationsWindow {
        max_operations_invoked: u16,
        max_operations_performed: u16,
    },
    /// SCP/SCU role selection (type 54H)
    RoleSelection(RoleSelection),
    /// Any other sub-item, kept as raw bytes
    Unknown(u8, Vec<u8>),
}

/// An SCP/SCU role selection sub-item,
/// declaring the roles an application entity proposes (or grants)
/// for one SOP class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleSelection {
    pub sop_class_uid: String,
    pub scu_role: bool,
    pub scp_role: bool,
}
