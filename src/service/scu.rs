//! Service class user: requests an association and issues
//! C-ECHO, C-STORE, C-FIND, C-GET and C-MOVE operations over it.

use std::borrow::Cow;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::mpsc::RecvTimeoutError;
use std::time::Duration;

use bytes::Bytes;
use dicom_dictionary_std::{tags, uids};
use dicom_object::InMemDicomObject;
use snafu::{ensure, OptionExt, ResultExt};
use tracing::{debug, warn};

use crate::context::{ContextManager, PresentationContext};
use crate::dimse::{
    priority, CEchoRq, CFindRq, CGetRq, CMoveRq, CStoreRq, CStoreRsp, DimseMessage, Message,
    MessageId, Status, COMMAND_DATA_SET_TYPE_NON_NULL, COMMAND_DATA_SET_TYPE_NULL,
};
use crate::machine::{self, Downcall, DulHandle, Event, RequestorConfig, Upcall};
use crate::pdu::{PresentationContextProposed, RoleSelection, DEFAULT_MAX_PDU};
use crate::service::{
    apply_query_level, element_str, parse_dataset, serialize_dataset, AbortedSnafu, ClosedSnafu,
    ConnectSnafu, MachineSnafu, MissingAbstractSyntaxSnafu, NoAcceptedPresentationContextsSnafu,
    NoMatchingContextSnafu, QueryRetrieveLevel, RejectedSnafu, Result, StatusSnafu, TimeoutSnafu,
    UnexpectedResponseSnafu, APPLICATION_CONTEXT_NAME, DEFAULT_TIMEOUT, EXPLICIT_VR_LE,
    IMPLICIT_VR_LE,
};

/// A builder for the client end of an association.
///
/// At least one presentation context must be proposed.
/// The default transfer syntaxes offered with
/// [`with_abstract_syntax`](Self::with_abstract_syntax)
/// are implicit VR little endian and explicit VR little endian.
///
/// # Example
///
/// ```no_run
/// # use dicom_dul::service::ServiceUserOptions;
/// # fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let mut scu = ServiceUserOptions::new()
///     .calling_ae_title("ECHO-SCU")
///     .called_ae_title("MAIN-STORAGE")
///     .with_abstract_syntax("1.2.840.10008.1.1")
///     .connect("192.168.0.5:104")?;
/// scu.c_echo()?;
/// scu.release()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ServiceUserOptions {
    calling_ae_title: Cow<'static, str>,
    called_ae_title: Cow<'static, str>,
    presentation_contexts: Vec<(Cow<'static, str>, Vec<Cow<'static, str>>)>,
    role_selections: Vec<RoleSelection>,
    max_pdu_length: u32,
    timeout: Duration,
}

impl Default for ServiceUserOptions {
    fn default() -> Self {
        ServiceUserOptions {
            calling_ae_title: "THIS-SCU".into(),
            called_ae_title: "ANY-SCP".into(),
            presentation_contexts: Vec::new(),
            role_selections: Vec::new(),
            max_pdu_length: DEFAULT_MAX_PDU,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl ServiceUserOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define the application entity title of this node.
    ///
    /// The default is `THIS-SCU`.
    pub fn calling_ae_title<T>(mut self, calling_ae_title: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.calling_ae_title = calling_ae_title.into();
        self
    }

    /// Define the application entity title of the target node.
    ///
    /// The default is `ANY-SCP`.
    pub fn called_ae_title<T>(mut self, called_ae_title: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.called_ae_title = called_ae_title.into();
        self
    }

    /// Propose a presentation context with the given abstract syntax
    /// and transfer syntaxes.
    pub fn with_presentation_context<T>(
        mut self,
        abstract_syntax_uid: T,
        transfer_syntax_uids: Vec<T>,
    ) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.presentation_contexts.push((
            abstract_syntax_uid.into(),
            transfer_syntax_uids.into_iter().map(Into::into).collect(),
        ));
        self
    }

    /// Propose a presentation context with the given abstract syntax
    /// and the default transfer syntaxes.
    pub fn with_abstract_syntax<T>(self, abstract_syntax_uid: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        let default_transfer_syntaxes: Vec<Cow<'static, str>> =
            vec![IMPLICIT_VR_LE.into(), EXPLICIT_VR_LE.into()];
        self.with_presentation_context(abstract_syntax_uid.into(), default_transfer_syntaxes)
    }

    /// Request the given SCU/SCP roles for one SOP class.
    ///
    /// A C-GET requester must claim the SCP role for every storage
    /// class it is willing to receive through sub-operations.
    pub fn with_role_selection<T>(mut self, sop_class_uid: T, scu_role: bool, scp_role: bool) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.role_selections.push(RoleSelection {
            sop_class_uid: sop_class_uid.into().into_owned(),
            scu_role,
            scp_role,
        });
        self
    }

    /// Override the maximum PDU payload length admitted
    /// for received PDUs.
    pub fn max_pdu_length(mut self, value: u32) -> Self {
        self.max_pdu_length = value;
        self
    }

    /// Override the per-operation deadline.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Open a TCP connection to the given address and negotiate
    /// an association over it.
    pub fn connect<A>(self, address: A) -> Result<ServiceUser>
    where
        A: ToSocketAddrs,
    {
        ensure!(
            !self.presentation_contexts.is_empty(),
            MissingAbstractSyntaxSnafu
        );

        let presentation_contexts: Vec<_> = self
            .presentation_contexts
            .iter()
            .enumerate()
            .map(|(i, (abstract_syntax, transfer_syntaxes))| PresentationContextProposed {
                id: (2 * i + 1) as u8,
                abstract_syntax: abstract_syntax.to_string(),
                transfer_syntaxes: transfer_syntaxes.iter().map(|uid| uid.to_string()).collect(),
            })
            .collect();

        let config = RequestorConfig {
            calling_ae_title: self.calling_ae_title.to_string(),
            called_ae_title: self.called_ae_title.to_string(),
            application_context_name: APPLICATION_CONTEXT_NAME.to_string(),
            presentation_contexts,
            role_selections: self.role_selections.clone(),
            max_pdu_length: self.max_pdu_length,
            protocol_version: 1,
        };

        let socket = TcpStream::connect(address).context(ConnectSnafu)?;
        let handle = machine::start_requestor(config, socket, self.timeout).context(MachineSnafu)?;

        if handle
            .events
            .send(Event::User(Downcall::AssociateRequest))
            .is_err()
            || handle.events.send(Event::TransportConnected).is_err()
        {
            return ClosedSnafu.fail();
        }

        let info = match handle.upcalls.recv_timeout(self.timeout) {
            Ok(Upcall::Established(info)) => info,
            Ok(Upcall::Rejected { result, source }) => {
                return RejectedSnafu { result, source }.fail()
            }
            Ok(Upcall::Aborted { source }) => return AbortedSnafu { source }.fail(),
            Ok(_) | Err(RecvTimeoutError::Disconnected) => return ClosedSnafu.fail(),
            Err(RecvTimeoutError::Timeout) => {
                let _ = handle.events.send(Event::User(Downcall::AbortRequest));
                return TimeoutSnafu.fail();
            }
        };

        if !info.contexts.has_usable() {
            let _ = handle.events.send(Event::User(Downcall::AbortRequest));
            return NoAcceptedPresentationContextsSnafu.fail();
        }

        debug!(
            "association established with {} ({} presentation contexts)",
            info.called_ae_title,
            info.contexts.contexts().len()
        );

        Ok(ServiceUser {
            handle,
            contexts: info.contexts,
            peer_ae_title: info.called_ae_title,
            timeout: self.timeout,
            next_message_id: 1,
            open: true,
        })
    }
}

/// The client end of an established association.
///
/// When the value falls out of scope, the association is
/// gracefully released.
pub struct ServiceUser {
    handle: DulHandle,
    contexts: ContextManager,
    peer_ae_title: String,
    timeout: Duration,
    next_message_id: MessageId,
    open: bool,
}

impl ServiceUser {
    /// The negotiated presentation contexts of this association.
    pub fn presentation_contexts(&self) -> &[PresentationContext] {
        self.contexts.contexts()
    }

    /// The application entity title of the peer node.
    pub fn peer_ae_title(&self) -> &str {
        &self.peer_ae_title
    }

    fn next_id(&mut self) -> MessageId {
        let id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1).max(1);
        id
    }

    fn send_message(
        &mut self,
        presentation_context_id: u8,
        command: Message,
        data: Bytes,
    ) -> Result<()> {
        if self
            .handle
            .events
            .send(Event::User(Downcall::PDataRequest {
                presentation_context_id,
                command,
                data,
            }))
            .is_err()
        {
            self.open = false;
            return ClosedSnafu.fail();
        }
        Ok(())
    }

    fn receive_message(&mut self) -> Result<DimseMessage> {
        match self.handle.upcalls.recv_timeout(self.timeout) {
            Ok(Upcall::Data(message)) => Ok(message),
            Ok(Upcall::Aborted { source }) => {
                self.open = false;
                AbortedSnafu { source }.fail()
            }
            Ok(Upcall::Released) | Err(RecvTimeoutError::Disconnected) => {
                self.open = false;
                ClosedSnafu.fail()
            }
            Ok(_) => ClosedSnafu.fail(),
            Err(RecvTimeoutError::Timeout) => {
                self.abort_quietly();
                TimeoutSnafu.fail()
            }
        }
    }

    fn check_status(status: Status) -> Result<()> {
        if status.is_success() {
            Ok(())
        } else {
            StatusSnafu {
                code: status.code,
                comment: status.error_comment,
            }
            .fail()
        }
    }

    /// Verify the association with a C-ECHO exchange.
    pub fn c_echo(&mut self) -> Result<()> {
        let context = self
            .contexts
            .lookup_for_scu(uids::VERIFICATION)
            .context(NoMatchingContextSnafu {
                abstract_syntax: uids::VERIFICATION,
            })?;
        let presentation_context_id = context.id;

        let message_id = self.next_id();
        self.send_message(
            presentation_context_id,
            Message::CEchoRq(CEchoRq {
                message_id,
                command_data_set_type: COMMAND_DATA_SET_TYPE_NULL,
                extra: InMemDicomObject::new_empty(),
            }),
            Bytes::new(),
        )?;

        let reply = self.receive_message()?;
        match reply.command {
            Message::CEchoRsp(rsp) if rsp.message_id_being_responded_to == message_id => {
                Self::check_status(rsp.status)
            }
            _ => {
                self.abort_quietly();
                UnexpectedResponseSnafu { message_id }.fail()
            }
        }
    }

    /// Store one data set on the peer node.
    ///
    /// The data set must carry _SOPClassUID_ and _SOPInstanceUID_;
    /// the presentation context is selected by the SOP class.
    pub fn c_store(&mut self, object: &InMemDicomObject) -> Result<()> {
        let sop_class_uid = element_str(object, tags::SOP_CLASS_UID)?;
        let sop_instance_uid = element_str(object, tags::SOP_INSTANCE_UID)?;

        let context = self.contexts.lookup_for_scu(&sop_class_uid).context(
            NoMatchingContextSnafu {
                abstract_syntax: sop_class_uid.clone(),
            },
        )?;
        let presentation_context_id = context.id;
        let transfer_syntax = context.transfer_syntax.clone();

        let data = serialize_dataset(object, &transfer_syntax)?;
        let message_id = self.next_id();
        self.send_message(
            presentation_context_id,
            Message::CStoreRq(CStoreRq {
                affected_sop_class_uid: sop_class_uid,
                message_id,
                priority: priority::MEDIUM,
                command_data_set_type: COMMAND_DATA_SET_TYPE_NON_NULL,
                affected_sop_instance_uid: sop_instance_uid,
                move_originator_ae_title: None,
                move_originator_message_id: None,
                extra: InMemDicomObject::new_empty(),
            }),
            Bytes::from(data),
        )?;

        let reply = self.receive_message()?;
        match reply.command {
            Message::CStoreRsp(rsp) if rsp.message_id_being_responded_to == message_id => {
                Self::check_status(rsp.status)
            }
            _ => {
                self.abort_quietly();
                UnexpectedResponseSnafu { message_id }.fail()
            }
        }
    }

    /// Query the peer node, yielding matching data sets lazily.
    pub fn c_find(
        &mut self,
        level: QueryRetrieveLevel,
        query: InMemDicomObject,
    ) -> Result<CFindResults<'_>> {
        let (presentation_context_id, sop_class_uid, transfer_syntax) = self.retrieve_context(
            level,
            uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND,
            uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND,
        )?;

        let mut query = query;
        apply_query_level(&mut query, level);
        let data = serialize_dataset(&query, &transfer_syntax)?;

        let message_id = self.next_id();
        self.send_message(
            presentation_context_id,
            Message::CFindRq(CFindRq {
                affected_sop_class_uid: sop_class_uid,
                message_id,
                priority: priority::MEDIUM,
                command_data_set_type: COMMAND_DATA_SET_TYPE_NON_NULL,
                extra: InMemDicomObject::new_empty(),
            }),
            Bytes::from(data),
        )?;

        Ok(CFindResults {
            user: self,
            message_id,
            transfer_syntax,
            finished: false,
        })
    }

    /// Retrieve matching instances onto this node.
    ///
    /// The peer issues C-STORE sub-operations on this association;
    /// each received instance is handed to `on_store` as
    /// `(transfer_syntax, sop_class_uid, sop_instance_uid, bytes)`,
    /// which returns the C-STORE response status code.
    ///
    /// Requires storage presentation contexts negotiated with the
    /// SCP role (see [`ServiceUserOptions::with_role_selection`]).
    pub fn c_get<F>(
        &mut self,
        level: QueryRetrieveLevel,
        query: InMemDicomObject,
        mut on_store: F,
    ) -> Result<SubOperationSummary>
    where
        F: FnMut(&str, &str, &str, &[u8]) -> u16,
    {
        let (presentation_context_id, sop_class_uid, transfer_syntax) = self.retrieve_context(
            level,
            uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_GET,
            uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_GET,
        )?;

        let mut query = query;
        apply_query_level(&mut query, level);
        let data = serialize_dataset(&query, &transfer_syntax)?;

        let message_id = self.next_id();
        self.send_message(
            presentation_context_id,
            Message::CGetRq(CGetRq {
                affected_sop_class_uid: sop_class_uid,
                message_id,
                priority: priority::MEDIUM,
                command_data_set_type: COMMAND_DATA_SET_TYPE_NON_NULL,
                extra: InMemDicomObject::new_empty(),
            }),
            Bytes::from(data),
        )?;

        loop {
            let reply = self.receive_message()?;
            match reply.command {
                Message::CStoreRq(rq) => {
                    let store_ts = self
                        .contexts
                        .lookup_by_id(reply.presentation_context_id)
                        .map(|pc| pc.transfer_syntax.clone())
                        .unwrap_or_else(|| IMPLICIT_VR_LE.to_string());
                    let code = on_store(
                        &store_ts,
                        &rq.affected_sop_class_uid,
                        &rq.affected_sop_instance_uid,
                        &reply.data,
                    );
                    self.send_message(
                        reply.presentation_context_id,
                        Message::CStoreRsp(CStoreRsp {
                            affected_sop_class_uid: rq.affected_sop_class_uid,
                            message_id_being_responded_to: rq.message_id,
                            command_data_set_type: COMMAND_DATA_SET_TYPE_NULL,
                            affected_sop_instance_uid: rq.affected_sop_instance_uid,
                            status: Status::from_code(code),
                            extra: InMemDicomObject::new_empty(),
                        }),
                        Bytes::new(),
                    )?;
                }
                Message::CGetRsp(rsp) if rsp.message_id_being_responded_to == message_id => {
                    if rsp.status.is_pending() {
                        continue;
                    }
                    let summary = SubOperationSummary {
                        remaining: rsp.remaining_sub_operations,
                        completed: rsp.completed_sub_operations,
                        failed: rsp.failed_sub_operations,
                        warning: rsp.warning_sub_operations,
                    };
                    Self::check_status(rsp.status)?;
                    return Ok(summary);
                }
                _ => {
                    self.abort_quietly();
                    return UnexpectedResponseSnafu { message_id }.fail();
                }
            }
        }
    }

    /// Ask the peer node to send matching instances to another
    /// application entity, yielding sub-operation progress lazily.
    pub fn c_move(
        &mut self,
        level: QueryRetrieveLevel,
        query: InMemDicomObject,
        destination_ae_title: &str,
    ) -> Result<CMoveProgress<'_>> {
        let (presentation_context_id, sop_class_uid, transfer_syntax) = self.retrieve_context(
            level,
            uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE,
            uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE,
        )?;

        let mut query = query;
        apply_query_level(&mut query, level);
        let data = serialize_dataset(&query, &transfer_syntax)?;

        let message_id = self.next_id();
        self.send_message(
            presentation_context_id,
            Message::CMoveRq(CMoveRq {
                affected_sop_class_uid: sop_class_uid,
                message_id,
                priority: priority::MEDIUM,
                move_destination: destination_ae_title.to_string(),
                command_data_set_type: COMMAND_DATA_SET_TYPE_NON_NULL,
                extra: InMemDicomObject::new_empty(),
            }),
            Bytes::from(data),
        )?;

        Ok(CMoveProgress {
            user: self,
            message_id,
            finished: false,
        })
    }

    /// Gracefully release the association.
    pub fn release(mut self) -> Result<()> {
        self.release_impl()
    }

    /// Abort the association immediately.
    pub fn abort(mut self) {
        self.abort_quietly();
    }

    /// Select a negotiated context for a query/retrieve operation,
    /// preferring the patient root information model for
    /// patient-level queries and the study root model otherwise.
    fn retrieve_context(
        &mut self,
        level: QueryRetrieveLevel,
        study_root_model: &'static str,
        patient_root_model: &'static str,
    ) -> Result<(u8, String, String)> {
        let information_models = match level {
            QueryRetrieveLevel::Patient => [patient_root_model, study_root_model],
            _ => [study_root_model, patient_root_model],
        };
        let context = information_models
            .iter()
            .find_map(|uid| self.contexts.lookup_for_scu(uid))
            .context(NoMatchingContextSnafu {
                abstract_syntax: information_models[0],
            })?;
        Ok((
            context.id,
            context.abstract_syntax.clone(),
            context.transfer_syntax.clone(),
        ))
    }

    fn release_impl(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        if self
            .handle
            .events
            .send(Event::User(Downcall::ReleaseRequest))
            .is_err()
        {
            return ClosedSnafu.fail();
        }
        loop {
            match self.handle.upcalls.recv_timeout(self.timeout) {
                Ok(Upcall::Released) => return Ok(()),
                // late messages from before the release are dropped
                Ok(Upcall::Data(message)) => {
                    debug!("discarding late message {:?}", message.command);
                }
                Ok(Upcall::Aborted { source }) => return AbortedSnafu { source }.fail(),
                Ok(_) | Err(RecvTimeoutError::Disconnected) => return ClosedSnafu.fail(),
                Err(RecvTimeoutError::Timeout) => {
                    let _ = self.handle.events.send(Event::User(Downcall::AbortRequest));
                    return TimeoutSnafu.fail();
                }
            }
        }
    }

    fn abort_quietly(&mut self) {
        if self.open {
            self.open = false;
            if self
                .handle
                .events
                .send(Event::User(Downcall::AbortRequest))
                .is_err()
            {
                warn!("association tasks already gone");
            }
        }
    }
}

/// Gracefully release the association when the handle is dropped.
impl Drop for ServiceUser {
    fn drop(&mut self) {
        let _ = self.release_impl();
    }
}

/// Sub-operation counters of a retrieve operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubOperationSummary {
    pub remaining: u16,
    pub completed: u16,
    pub failed: u16,
    pub warning: u16,
}

/// Lazily yields the data sets matched by a C-FIND operation.
///
/// Iteration ends when the final (success) response arrives;
/// a non-pending failure status surfaces as an error item.
#[must_use]
pub struct CFindResults<'a> {
    user: &'a mut ServiceUser,
    message_id: MessageId,
    transfer_syntax: String,
    finished: bool,
}

impl Iterator for CFindResults<'_> {
    type Item = Result<InMemDicomObject>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let reply = match self.user.receive_message() {
            Ok(reply) => reply,
            Err(e) => {
                self.finished = true;
                return Some(Err(e));
            }
        };
        match reply.command {
            Message::CFindRsp(rsp) if rsp.message_id_being_responded_to == self.message_id => {
                if rsp.status.is_pending() {
                    Some(parse_dataset(&reply.data, &self.transfer_syntax))
                } else if rsp.status.is_success() {
                    self.finished = true;
                    None
                } else {
                    self.finished = true;
                    Some(
                        StatusSnafu {
                            code: rsp.status.code,
                            comment: rsp.status.error_comment,
                        }
                        .fail(),
                    )
                }
            }
            _ => {
                self.finished = true;
                self.user.abort_quietly();
                Some(
                    UnexpectedResponseSnafu {
                        message_id: self.message_id,
                    }
                    .fail(),
                )
            }
        }
    }
}

/// Lazily yields the sub-operation progress of a C-MOVE operation,
/// including the counters of the final response.
#[must_use]
pub struct CMoveProgress<'a> {
    user: &'a mut ServiceUser,
    message_id: MessageId,
    finished: bool,
}

impl Iterator for CMoveProgress<'_> {
    type Item = Result<SubOperationSummary>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let reply = match self.user.receive_message() {
            Ok(reply) => reply,
            Err(e) => {
                self.finished = true;
                return Some(Err(e));
            }
        };
        match reply.command {
            Message::CMoveRsp(rsp) if rsp.message_id_being_responded_to == self.message_id => {
                let summary = SubOperationSummary {
                    remaining: rsp.remaining_sub_operations,
                    completed: rsp.completed_sub_operations,
                    failed: rsp.failed_sub_operations,
                    warning: rsp.warning_sub_operations,
                };
                if rsp.status.is_pending() {
                    Some(Ok(summary))
                } else if rsp.status.is_success() {
                    self.finished = true;
                    Some(Ok(summary))
                } else {
                    self.finished = true;
                    Some(
                        StatusSnafu {
                            code: rsp.status.code,
                            comment: rsp.status.error_comment,
                        }
                        .fail(),
                    )
                }
            }
            _ => {
                self.finished = true;
                self.user.abort_quietly();
                Some(
                    UnexpectedResponseSnafu {
                        message_id: self.message_id,
                    }
                    .fail(),
                )
            }
        }
    }
}
