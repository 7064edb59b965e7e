//! Service class provider: accepts associations and dispatches
//! incoming C-service requests to application handlers.

use std::borrow::Cow;
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use snafu::{ensure, ResultExt};
use tracing::{debug, warn};

use crate::context::PresentationContext;
use crate::dimse::{
    priority, status, CEchoRsp, CFindRq, CFindRsp, CGetRq, CGetRsp, CMoveRq, CMoveRsp, CStoreRq,
    CStoreRsp, DimseMessage, Message, MessageId, Status, COMMAND_DATA_SET_TYPE_NON_NULL,
    COMMAND_DATA_SET_TYPE_NULL,
};
use crate::machine::{
    self, AcceptAny, AcceptCalledAeTitle, AccessControl, AcceptorConfig, AssociationInfo,
    Downcall, DulHandle, Event, Upcall,
};
use crate::pdu::DEFAULT_MAX_PDU;
use crate::service::{
    element_str, parse_dataset, serialize_dataset, AbortedSnafu, ClosedSnafu, ListenSnafu,
    MachineSnafu, MissingAbstractSyntaxSnafu, RejectedSnafu, Result, ServiceUserOptions,
    APPLICATION_CONTEXT_NAME, DEFAULT_TIMEOUT, EXPLICIT_VR_LE, IMPLICIT_VR_LE,
};

/// Application callbacks for the services a provider offers.
///
/// Every method has a refusing default, so a handler implements
/// only the services it supports. One handler value serves one
/// association; [`ServiceProviderOptions::listen`] clones the
/// handler per accepted connection.
pub trait ServiceProviderHandler: Send {
    /// Handle a C-ECHO request, returning the response status code.
    fn c_echo(&mut self) -> u16 {
        status::SUCCESS
    }

    /// Handle an incoming C-STORE request,
    /// returning the response status code.
    fn c_store(
        &mut self,
        _context: &PresentationContext,
        _request: &CStoreRq,
        _data: &[u8],
    ) -> u16 {
        status::SOP_CLASS_NOT_SUPPORTED
    }

    /// Handle a C-FIND request, returning the matching data sets.
    fn c_find(
        &mut self,
        _context: &PresentationContext,
        _query: &InMemDicomObject,
    ) -> Vec<InMemDicomObject> {
        Vec::new()
    }

    /// Handle a C-GET request, returning the data sets to send back
    /// through C-STORE sub-operations on the same association.
    fn c_get(
        &mut self,
        _context: &PresentationContext,
        _query: &InMemDicomObject,
    ) -> Vec<InMemDicomObject> {
        Vec::new()
    }

    /// Handle a C-MOVE request, returning the data sets to send to
    /// the move destination.
    fn c_move(
        &mut self,
        _context: &PresentationContext,
        _query: &InMemDicomObject,
        _destination_ae_title: &str,
    ) -> Vec<InMemDicomObject> {
        Vec::new()
    }

    /// Resolve a C-MOVE destination AE title to a socket address.
    ///
    /// Returning `None` fails the move with
    /// _move destination unknown_.
    fn resolve_move_destination(&self, _ae_title: &str) -> Option<String> {
        None
    }
}

/// A builder for the accepting end of associations.
///
/// A value of this type can be reused for multiple connections.
///
/// # Example
///
/// ```no_run
/// # use dicom_dul::service::{ServiceProviderHandler, ServiceProviderOptions};
/// #[derive(Clone)]
/// struct EchoOnly;
/// impl ServiceProviderHandler for EchoOnly {}
///
/// # fn run() -> Result<(), Box<dyn std::error::Error>> {
/// ServiceProviderOptions::new()
///     .ae_title("ECHO-SCP")
///     .with_abstract_syntax("1.2.840.10008.1.1")
///     .listen("0.0.0.0:11112", EchoOnly)?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ServiceProviderOptions {
    ae_title: Cow<'static, str>,
    abstract_syntaxes: Vec<Cow<'static, str>>,
    transfer_syntaxes: Vec<Cow<'static, str>>,
    access_control: Arc<dyn AccessControl>,
    max_pdu_length: u32,
    timeout: Duration,
}

impl Default for ServiceProviderOptions {
    fn default() -> Self {
        ServiceProviderOptions {
            ae_title: "THIS-SCP".into(),
            abstract_syntaxes: Vec::new(),
            transfer_syntaxes: vec![IMPLICIT_VR_LE.into(), EXPLICIT_VR_LE.into()],
            access_control: Arc::new(AcceptAny),
            max_pdu_length: DEFAULT_MAX_PDU,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl ServiceProviderOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define the application entity title of this node.
    ///
    /// The default is `THIS-SCP`.
    pub fn ae_title<T>(mut self, ae_title: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.ae_title = ae_title.into();
        self
    }

    /// Accept this abstract syntax in presentation context negotiation.
    pub fn with_abstract_syntax<T>(mut self, abstract_syntax_uid: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.abstract_syntaxes.push(abstract_syntax_uid.into());
        self
    }

    /// Accept this transfer syntax in presentation context negotiation,
    /// replacing the defaults on first use.
    pub fn with_transfer_syntax<T>(mut self, transfer_syntax_uid: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        static DEFAULTS: [&str; 2] = [IMPLICIT_VR_LE, EXPLICIT_VR_LE];
        if self.transfer_syntaxes.iter().map(|ts| &**ts).eq(DEFAULTS) {
            self.transfer_syntaxes.clear();
        }
        self.transfer_syntaxes.push(transfer_syntax_uid.into());
        self
    }

    /// Accept association requests from any node.
    /// This is the default policy.
    pub fn accept_any(self) -> Self {
        self.access_control(AcceptAny)
    }

    /// Accept association requests only when the called AE title
    /// matches this node's AE title.
    pub fn accept_called_ae_title(self) -> Self {
        self.access_control(AcceptCalledAeTitle)
    }

    /// Install a custom association acceptance policy.
    pub fn access_control<A>(mut self, access_control: A) -> Self
    where
        A: AccessControl + 'static,
    {
        self.access_control = Arc::new(access_control);
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

    /// Listen on the given address, serving each accepted
    /// connection on its own thread with a clone of `handler`.
    pub fn listen<A, H>(self, address: A, handler: H) -> Result<()>
    where
        A: ToSocketAddrs,
        H: ServiceProviderHandler + Clone + 'static,
    {
        let listener = TcpListener::bind(address).context(ListenSnafu)?;
        debug!("listening on {:?}", listener.local_addr());

        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let options = self.clone();
                    let handler = handler.clone();
                    std::thread::spawn(move || {
                        if let Err(e) = options.serve(stream, handler) {
                            warn!("association ended with error: {}", e);
                        }
                    });
                }
                Err(e) => warn!("failed to accept connection: {}", e),
            }
        }
        Ok(())
    }

    /// Negotiate and serve one association over an accepted stream,
    /// blocking until the association ends.
    pub fn serve<H>(&self, stream: TcpStream, mut handler: H) -> Result<()>
    where
        H: ServiceProviderHandler,
    {
        ensure!(!self.abstract_syntaxes.is_empty(), MissingAbstractSyntaxSnafu);

        let config = AcceptorConfig {
            ae_title: self.ae_title.to_string(),
            application_context_name: APPLICATION_CONTEXT_NAME.to_string(),
            abstract_syntaxes: self
                .abstract_syntaxes
                .iter()
                .map(|uid| uid.to_string())
                .collect(),
            transfer_syntaxes: self
                .transfer_syntaxes
                .iter()
                .map(|uid| uid.to_string())
                .collect(),
            access_control: Arc::clone(&self.access_control),
            max_pdu_length: self.max_pdu_length,
            protocol_version: 1,
        };
        let handle = machine::start_acceptor(config, stream, self.timeout).context(MachineSnafu)?;

        let info = match handle.upcalls.recv_timeout(self.timeout) {
            Ok(Upcall::Established(info)) => info,
            Ok(Upcall::Rejected { result, source }) => {
                return RejectedSnafu { result, source }.fail()
            }
            Ok(Upcall::Aborted { source }) => return AbortedSnafu { source }.fail(),
            Ok(_) | Err(_) => return ClosedSnafu.fail(),
        };
        debug!("serving association from {}", info.calling_ae_title);

        let mut association = ProviderAssociation {
            handle,
            info,
            timeout: self.timeout,
            next_sub_message_id: 1,
            local_ae_title: self.ae_title.to_string(),
        };

        loop {
            match association.handle.upcalls.recv() {
                Ok(Upcall::Data(message)) => association.dispatch(&mut handler, message)?,
                Ok(Upcall::Released) => return Ok(()),
                Ok(Upcall::Aborted { source }) => return AbortedSnafu { source }.fail(),
                Ok(_) => continue,
                Err(_) => return Ok(()),
            }
        }
    }
}

/// Per-association dispatch state on the provider side.
struct ProviderAssociation {
    handle: DulHandle,
    info: AssociationInfo,
    timeout: Duration,
    next_sub_message_id: MessageId,
    local_ae_title: String,
}

impl ProviderAssociation {
    fn send_message(
        &self,
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
            return ClosedSnafu.fail();
        }
        Ok(())
    }

    fn dispatch<H>(&mut self, handler: &mut H, message: DimseMessage) -> Result<()>
    where
        H: ServiceProviderHandler,
    {
        let presentation_context_id = message.presentation_context_id;
        match message.command {
            Message::CEchoRq(rq) => {
                let code = handler.c_echo();
                self.send_message(
                    presentation_context_id,
                    Message::CEchoRsp(CEchoRsp {
                        message_id_being_responded_to: rq.message_id,
                        command_data_set_type: COMMAND_DATA_SET_TYPE_NULL,
                        status: Status::from_code(code),
                        extra: InMemDicomObject::new_empty(),
                    }),
                    Bytes::new(),
                )
            }
            Message::CStoreRq(rq) => {
                let code = match self.info.contexts.lookup_by_id(presentation_context_id) {
                    Some(context) => handler.c_store(context, &rq, &message.data),
                    None => status::UNABLE_TO_PROCESS,
                };
                self.send_message(
                    presentation_context_id,
                    Message::CStoreRsp(CStoreRsp {
                        affected_sop_class_uid: rq.affected_sop_class_uid,
                        message_id_being_responded_to: rq.message_id,
                        command_data_set_type: COMMAND_DATA_SET_TYPE_NULL,
                        affected_sop_instance_uid: rq.affected_sop_instance_uid,
                        status: Status::from_code(code),
                        extra: InMemDicomObject::new_empty(),
                    }),
                    Bytes::new(),
                )
            }
            Message::CFindRq(rq) => self.handle_find(handler, presentation_context_id, rq, &message.data),
            Message::CGetRq(rq) => self.handle_get(handler, presentation_context_id, rq, &message.data),
            Message::CMoveRq(rq) => self.handle_move(handler, presentation_context_id, rq, &message.data),
            other => {
                warn!("discarding unexpected message {:?}", other);
                Ok(())
            }
        }
    }

    fn handle_find<H>(
        &mut self,
        handler: &mut H,
        presentation_context_id: u8,
        rq: CFindRq,
        query_bytes: &[u8],
    ) -> Result<()>
    where
        H: ServiceProviderHandler,
    {
        let find_rsp = |status: Status, has_data: bool| {
            Message::CFindRsp(CFindRsp {
                affected_sop_class_uid: rq.affected_sop_class_uid.clone(),
                message_id_being_responded_to: rq.message_id,
                command_data_set_type: if has_data {
                    COMMAND_DATA_SET_TYPE_NON_NULL
                } else {
                    COMMAND_DATA_SET_TYPE_NULL
                },
                status,
                extra: InMemDicomObject::new_empty(),
            })
        };

        let context = match self.info.contexts.lookup_by_id(presentation_context_id) {
            Some(context) => context.clone(),
            None => {
                return self.send_message(
                    presentation_context_id,
                    find_rsp(Status::from_code(status::UNABLE_TO_PROCESS), false),
                    Bytes::new(),
                )
            }
        };

        let query = match parse_dataset(query_bytes, &context.transfer_syntax) {
            Ok(query) => query,
            Err(e) => {
                warn!("unreadable C-FIND query: {}", e);
                return self.send_message(
                    presentation_context_id,
                    find_rsp(Status::from_code(status::UNABLE_TO_PROCESS), false),
                    Bytes::new(),
                );
            }
        };

        for matching in handler.c_find(&context, &query) {
            let data = serialize_dataset(&matching, &context.transfer_syntax)?;
            self.send_message(
                presentation_context_id,
                find_rsp(Status::from_code(status::PENDING), true),
                Bytes::from(data),
            )?;
        }
        self.send_message(presentation_context_id, find_rsp(Status::success(), false), Bytes::new())
    }

    fn handle_get<H>(
        &mut self,
        handler: &mut H,
        presentation_context_id: u8,
        rq: CGetRq,
        query_bytes: &[u8],
    ) -> Result<()>
    where
        H: ServiceProviderHandler,
    {
        let get_rsp = |status: Status, counters: SubOpCounters| {
            Message::CGetRsp(CGetRsp {
                affected_sop_class_uid: rq.affected_sop_class_uid.clone(),
                message_id_being_responded_to: rq.message_id,
                command_data_set_type: COMMAND_DATA_SET_TYPE_NULL,
                remaining_sub_operations: counters.remaining,
                completed_sub_operations: counters.completed,
                failed_sub_operations: counters.failed,
                warning_sub_operations: counters.warning,
                status,
                extra: InMemDicomObject::new_empty(),
            })
        };

        let context = match self.info.contexts.lookup_by_id(presentation_context_id) {
            Some(context) => context.clone(),
            None => {
                return self.send_message(
                    presentation_context_id,
                    get_rsp(
                        Status::from_code(status::UNABLE_TO_PROCESS),
                        SubOpCounters::default(),
                    ),
                    Bytes::new(),
                )
            }
        };

        let query = match parse_dataset(query_bytes, &context.transfer_syntax) {
            Ok(query) => query,
            Err(e) => {
                warn!("unreadable C-GET query: {}", e);
                return self.send_message(
                    presentation_context_id,
                    get_rsp(
                        Status::from_code(status::UNABLE_TO_PROCESS),
                        SubOpCounters::default(),
                    ),
                    Bytes::new(),
                );
            }
        };

        let datasets = handler.c_get(&context, &query);
        let total = datasets.len() as u16;
        let mut counters = SubOpCounters {
            remaining: total,
            ..SubOpCounters::default()
        };

        for dataset in datasets {
            match self.store_on_association(&dataset) {
                Ok(true) => counters.completed += 1,
                Ok(false) => counters.failed += 1,
                Err(e) => return Err(e),
            }
            counters.remaining -= 1;
            if counters.remaining > 0 {
                self.send_message(
                    presentation_context_id,
                    get_rsp(Status::from_code(status::PENDING), counters),
                    Bytes::new(),
                )?;
            }
        }

        let final_status = if counters.failed == 0 {
            Status::success()
        } else {
            Status::from_code(status::SUB_OPERATIONS_COMPLETE_WITH_FAILURES)
        };
        self.send_message(presentation_context_id, get_rsp(final_status, counters), Bytes::new())
    }

    /// Issue one C-STORE sub-operation on this association,
    /// as permitted by the negotiated role selection.
    ///
    /// Returns whether the peer stored the instance successfully;
    /// instances with no suitable presentation context count as failed.
    fn store_on_association(&mut self, dataset: &InMemDicomObject) -> Result<bool> {
        let sop_class_uid = match element_str(dataset, tags::SOP_CLASS_UID) {
            Ok(uid) => uid,
            Err(_) => return Ok(false),
        };
        let sop_instance_uid = match element_str(dataset, tags::SOP_INSTANCE_UID) {
            Ok(uid) => uid,
            Err(_) => return Ok(false),
        };
        let context = match self.info.contexts.lookup_for_scu(&sop_class_uid) {
            Some(context) => context.clone(),
            None => {
                warn!("no SCU-capable presentation context for {}", sop_class_uid);
                return Ok(false);
            }
        };
        let data = match serialize_dataset(dataset, &context.transfer_syntax) {
            Ok(data) => data,
            Err(e) => {
                warn!("could not serialize instance {}: {}", sop_instance_uid, e);
                return Ok(false);
            }
        };

        let message_id = self.next_sub_message_id;
        self.next_sub_message_id = self.next_sub_message_id.wrapping_add(1).max(1);

        self.send_message(
            context.id,
            Message::CStoreRq(CStoreRq {
                affected_sop_class_uid: sop_class_uid,
                message_id,
                priority: priority::MEDIUM,
                command_data_set_type: COMMAND_DATA_SET_TYPE_NON_NULL,
                affected_sop_instance_uid: sop_instance_uid,
                move_originator_ae_title: Some(self.local_ae_title.clone()),
                move_originator_message_id: None,
                extra: InMemDicomObject::new_empty(),
            }),
            Bytes::from(data),
        )?;

        // await the C-STORE response before the next sub-operation
        loop {
            match self.handle.upcalls.recv_timeout(self.timeout) {
                Ok(Upcall::Data(reply)) => match reply.command {
                    Message::CStoreRsp(rsp) if rsp.message_id_being_responded_to == message_id => {
                        return Ok(rsp.status.is_success());
                    }
                    other => {
                        warn!("discarding {:?} while awaiting store response", other);
                    }
                },
                Ok(Upcall::Aborted { source }) => return AbortedSnafu { source }.fail(),
                Ok(_) | Err(RecvTimeoutError::Disconnected) => return ClosedSnafu.fail(),
                Err(RecvTimeoutError::Timeout) => {
                    let _ = self.handle.events.send(Event::User(Downcall::AbortRequest));
                    return crate::service::TimeoutSnafu.fail();
                }
            }
        }
    }

    fn handle_move<H>(
        &mut self,
        handler: &mut H,
        presentation_context_id: u8,
        rq: CMoveRq,
        query_bytes: &[u8],
    ) -> Result<()>
    where
        H: ServiceProviderHandler,
    {
        let move_rsp = |status: Status, counters: SubOpCounters| {
            Message::CMoveRsp(CMoveRsp {
                affected_sop_class_uid: rq.affected_sop_class_uid.clone(),
                message_id_being_responded_to: rq.message_id,
                command_data_set_type: COMMAND_DATA_SET_TYPE_NULL,
                remaining_sub_operations: counters.remaining,
                completed_sub_operations: counters.completed,
                failed_sub_operations: counters.failed,
                warning_sub_operations: counters.warning,
                status,
                extra: InMemDicomObject::new_empty(),
            })
        };

        let context = match self.info.contexts.lookup_by_id(presentation_context_id) {
            Some(context) => context.clone(),
            None => {
                return self.send_message(
                    presentation_context_id,
                    move_rsp(
                        Status::from_code(status::UNABLE_TO_PROCESS),
                        SubOpCounters::default(),
                    ),
                    Bytes::new(),
                )
            }
        };

        let destination = match handler.resolve_move_destination(&rq.move_destination) {
            Some(address) => address,
            None => {
                warn!("unknown move destination {}", rq.move_destination);
                return self.send_message(
                    presentation_context_id,
                    move_rsp(
                        Status::from_code(status::MOVE_DESTINATION_UNKNOWN),
                        SubOpCounters::default(),
                    ),
                    Bytes::new(),
                );
            }
        };

        let query = match parse_dataset(query_bytes, &context.transfer_syntax) {
            Ok(query) => query,
            Err(e) => {
                warn!("unreadable C-MOVE query: {}", e);
                return self.send_message(
                    presentation_context_id,
                    move_rsp(
                        Status::from_code(status::UNABLE_TO_PROCESS),
                        SubOpCounters::default(),
                    ),
                    Bytes::new(),
                );
            }
        };

        let datasets = handler.c_move(&context, &query, &rq.move_destination);
        let total = datasets.len() as u16;
        let mut counters = SubOpCounters {
            remaining: total,
            ..SubOpCounters::default()
        };

        // the sub-operations run over a dedicated association
        // with the move destination
        let mut sub_options = ServiceUserOptions::new()
            .calling_ae_title(self.local_ae_title.clone())
            .called_ae_title(rq.move_destination.clone())
            .timeout(self.timeout);
        let mut sop_classes: Vec<String> = datasets
            .iter()
            .filter_map(|dataset| element_str(dataset, tags::SOP_CLASS_UID).ok())
            .collect();
        sop_classes.sort();
        sop_classes.dedup();
        for sop_class in sop_classes {
            sub_options = sub_options.with_abstract_syntax(sop_class);
        }

        let mut sub_association = match sub_options.connect(&*destination) {
            Ok(scu) => scu,
            Err(e) => {
                warn!("could not reach move destination {}: {}", destination, e);
                counters.failed = total;
                counters.remaining = 0;
                return self.send_message(
                    presentation_context_id,
                    move_rsp(
                        Status::from_code(status::RETRIEVE_OUT_OF_RESOURCES_SUB_OPERATIONS),
                        counters,
                    ),
                    Bytes::new(),
                );
            }
        };

        for dataset in datasets {
            match sub_association.c_store(&dataset) {
                Ok(()) => counters.completed += 1,
                Err(e) => {
                    warn!("sub-operation failed: {}", e);
                    counters.failed += 1;
                }
            }
            counters.remaining -= 1;
            if counters.remaining > 0 {
                self.send_message(
                    presentation_context_id,
                    move_rsp(Status::from_code(status::PENDING), counters),
                    Bytes::new(),
                )?;
            }
        }
        let _ = sub_association.release();

        let final_status = if counters.failed == 0 {
            Status::success()
        } else {
            Status::from_code(status::SUB_OPERATIONS_COMPLETE_WITH_FAILURES)
        };
        self.send_message(presentation_context_id, move_rsp(final_status, counters), Bytes::new())
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct SubOpCounters {
    remaining: u16,
    completed: u16,
    failed: u16,
    warning: u16,
}
