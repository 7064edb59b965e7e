//! The upper layer state machine, as per the standard,
//! part 8, section 9.2.
//!
//! Each association is driven by three cooperating tasks:
//! a network reader blocking on [`read_pdu`], the driver owning all
//! mutable association state, and a network writer consuming
//! serialized PDUs from a bounded queue. The driver selects over a
//! single merged event queue fed by the reader and by the service
//! layer, with its receive timeout acting as the ARTIM timer.

use std::io::{BufReader, Write};
use std::net::{Shutdown, TcpStream};
use std::ops::ControlFlow;
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use snafu::{Backtrace, ResultExt, Snafu};
use tracing::{debug, warn};

use crate::context::{ContextManager, Role};
use crate::dimse::{self, CommandAssembler, DimseMessage, Message};
use crate::pdu::{
    read_pdu, reader, write_pdu, AbortRQServiceProviderReason, AbortRQSource, AssociationRJResult,
    AssociationRJServiceUserReason, AssociationRJSource, PDataValue, PDataValueType, Pdu,
    PresentationContextProposed, RoleSelection, UserVariableItem, DEFAULT_MAX_PDU,
    MINIMUM_PDU_SIZE,
};
use crate::{IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME};

/// Bytes of overhead per presentation data value:
/// item length, context identifier and message control header.
const PDV_HEADER_SIZE: u32 = 6;

const EVENT_QUEUE_DEPTH: usize = 16;
const WIRE_QUEUE_DEPTH: usize = 8;
const UPCALL_QUEUE_DEPTH: usize = 16;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("could not clone TCP stream: {}", source))]
    CloneSocket {
        source: std::io::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The thirteen states of the upper layer automaton.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// idle, no association and no transport connection
    Sta1,
    /// transport open, awaiting A-ASSOCIATE-RQ
    Sta2,
    /// awaiting local association response
    Sta3,
    /// awaiting transport connection to open
    Sta4,
    /// awaiting A-ASSOCIATE-AC or -RJ
    Sta5,
    /// association established, ready for data transfer
    Sta6,
    /// awaiting A-RELEASE-RP
    Sta7,
    /// awaiting local release response
    Sta8,
    /// release collision, requestor side, awaiting local response
    Sta9,
    /// release collision, acceptor side, awaiting A-RELEASE-RP
    Sta10,
    /// release collision, requestor side, awaiting A-RELEASE-RP
    Sta11,
    /// release collision, acceptor side, awaiting local response
    Sta12,
    /// awaiting transport close after sending a reject, release or abort
    Sta13,
}

/// Requests from the service layer to the state machine.
#[derive(Debug)]
pub enum Downcall {
    /// request association establishment (requestor side)
    AssociateRequest,
    /// send one DIMSE message, fragmented as needed
    PDataRequest {
        presentation_context_id: u8,
        command: Message,
        data: Bytes,
    },
    /// request a graceful release
    ReleaseRequest,
    /// abort the association immediately
    AbortRequest,
}

/// Notifications from the state machine to the service layer.
#[derive(Debug)]
pub enum Upcall {
    /// the association is established and ready for data transfer
    Established(AssociationInfo),
    /// a complete DIMSE message arrived
    Data(DimseMessage),
    /// the association ended gracefully
    Released,
    /// the peer rejected the association request
    Rejected {
        result: AssociationRJResult,
        source: AssociationRJSource,
    },
    /// the association ended abruptly
    Aborted { source: AbortRQSource },
}

/// The negotiated parameters of an established association.
#[derive(Debug, Clone)]
pub struct AssociationInfo {
    pub contexts: ContextManager,
    /// maximum PDU payload length admitted by the peer
    pub peer_max_pdu_length: u32,
    pub calling_ae_title: String,
    pub called_ae_title: String,
}

/// Everything the driver reacts to.
#[derive(Debug)]
pub enum Event {
    User(Downcall),
    /// the transport connection was opened (requestor side)
    TransportConnected,
    /// a PDU arrived from the peer
    Pdu(Pdu),
    /// the peer closed the transport connection
    TransportClosed,
    /// an unreadable PDU arrived from the peer
    ReadFailed,
    /// the ARTIM timer expired
    TimerExpired,
}

/// Association acceptance policy, checked against the AE titles
/// of an incoming A-ASSOCIATE-RQ.
pub trait AccessControl: Send + Sync {
    /// Decide whether the requesting node should be given clearance;
    /// on refusal, the concrete service-user reject reason to send.
    fn check_access(
        &self,
        this_ae_title: &str,
        calling_ae_title: &str,
        called_ae_title: &str,
    ) -> std::result::Result<(), AssociationRJServiceUserReason>;
}

/// Accept any incoming association request.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct AcceptAny;

impl AccessControl for AcceptAny {
    fn check_access(
        &self,
        _this_ae_title: &str,
        _calling_ae_title: &str,
        _called_ae_title: &str,
    ) -> std::result::Result<(), AssociationRJServiceUserReason> {
        Ok(())
    }
}

/// Accept an association request only when the called AE title
/// matches this node's AE title.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct AcceptCalledAeTitle;

impl AccessControl for AcceptCalledAeTitle {
    fn check_access(
        &self,
        this_ae_title: &str,
        _calling_ae_title: &str,
        called_ae_title: &str,
    ) -> std::result::Result<(), AssociationRJServiceUserReason> {
        if this_ae_title == called_ae_title {
            Ok(())
        } else {
            Err(AssociationRJServiceUserReason::CalledAETitleNotRecognized)
        }
    }
}

/// Association parameters of a requestor-side machine.
#[derive(Debug, Clone)]
pub struct RequestorConfig {
    pub calling_ae_title: String,
    pub called_ae_title: String,
    pub application_context_name: String,
    pub presentation_contexts: Vec<PresentationContextProposed>,
    pub role_selections: Vec<RoleSelection>,
    pub max_pdu_length: u32,
    pub protocol_version: u16,
}

/// Association parameters of an acceptor-side machine.
#[derive(Clone)]
pub struct AcceptorConfig {
    pub ae_title: String,
    pub application_context_name: String,
    pub abstract_syntaxes: Vec<String>,
    pub transfer_syntaxes: Vec<String>,
    pub access_control: Arc<dyn AccessControl>,
    pub max_pdu_length: u32,
    pub protocol_version: u16,
}

enum Side {
    Requestor(RequestorConfig),
    Acceptor(AcceptorConfig),
}

/// The two queue endpoints the service layer holds
/// for one association.
pub struct DulHandle {
    pub events: SyncSender<Event>,
    pub upcalls: Receiver<Upcall>,
}

/// Spawn the three association tasks for the requestor side
/// of the given connected stream.
///
/// The machine starts in Sta1; the caller posts
/// [`Downcall::AssociateRequest`] and [`Event::TransportConnected`]
/// to start negotiation.
pub fn start_requestor(
    config: RequestorConfig,
    socket: TcpStream,
    timeout: Duration,
) -> Result<DulHandle> {
    start(Side::Requestor(config), State::Sta1, socket, timeout)
}

/// Spawn the three association tasks for the acceptor side
/// of an accepted stream. The machine starts in Sta2 and
/// negotiates as soon as the association request arrives.
pub fn start_acceptor(
    config: AcceptorConfig,
    socket: TcpStream,
    timeout: Duration,
) -> Result<DulHandle> {
    start(Side::Acceptor(config), State::Sta2, socket, timeout)
}

fn start(side: Side, state: State, socket: TcpStream, timeout: Duration) -> Result<DulHandle> {
    let (event_tx, event_rx) = sync_channel(EVENT_QUEUE_DEPTH);
    let (wire_tx, wire_rx) = sync_channel(WIRE_QUEUE_DEPTH);
    let (upcall_tx, upcall_rx) = sync_channel(UPCALL_QUEUE_DEPTH);

    let max_pdu_length = match &side {
        Side::Requestor(config) => config.max_pdu_length,
        Side::Acceptor(config) => config.max_pdu_length,
    };

    let reader_socket = socket.try_clone().context(CloneSocketSnafu)?;
    let writer_socket = socket.try_clone().context(CloneSocketSnafu)?;

    let reader_events = event_tx.clone();
    std::thread::spawn(move || read_loop(reader_socket, reader_events, max_pdu_length));
    std::thread::spawn(move || write_loop(writer_socket, wire_rx));

    let machine = StateMachine {
        state,
        side,
        assembler: CommandAssembler::new(),
        contexts: ContextManager::default(),
        peer_max_pdu_length: DEFAULT_MAX_PDU,
        upcalls: upcall_tx,
        wire: wire_tx,
    };
    std::thread::spawn(move || machine.run(event_rx, timeout));

    Ok(DulHandle {
        events: event_tx,
        upcalls: upcall_rx,
    })
}

/// Block on the stream, handing decoded PDUs to the driver
/// until the stream ends or a PDU cannot be decoded.
fn read_loop(socket: TcpStream, events: SyncSender<Event>, max_pdu_length: u32) {
    let mut reader = BufReader::new(socket);
    loop {
        match read_pdu(&mut reader, max_pdu_length) {
            Ok(pdu) => {
                if events.send(Event::Pdu(pdu)).is_err() {
                    break;
                }
            }
            Err(reader::Error::NoPduAvailable { .. }) => {
                let _ = events.send(Event::TransportClosed);
                break;
            }
            Err(e) => {
                warn!("failed to read PDU: {}", e);
                let _ = events.send(Event::ReadFailed);
                break;
            }
        }
    }
}

/// Drain serialized PDUs onto the wire,
/// closing the connection once the driver is done.
fn write_loop(mut socket: TcpStream, wire: Receiver<Vec<u8>>) {
    for buffer in wire {
        if let Err(e) = socket.write_all(&buffer) {
            warn!("failed to write PDU: {}", e);
            break;
        }
    }
    let _ = socket.shutdown(Shutdown::Both);
}

struct StateMachine {
    state: State,
    side: Side,
    assembler: CommandAssembler,
    contexts: ContextManager,
    peer_max_pdu_length: u32,
    upcalls: SyncSender<Upcall>,
    wire: SyncSender<Vec<u8>>,
}

impl StateMachine {
    fn run(mut self, events: Receiver<Event>, timeout: Duration) {
        loop {
            // the ARTIM timer runs in every transient state
            let event = if self.state == State::Sta6 || self.state == State::Sta1 {
                match events.recv() {
                    Ok(event) => event,
                    Err(_) => break,
                }
            } else {
                match events.recv_timeout(timeout) {
                    Ok(event) => event,
                    Err(RecvTimeoutError::Timeout) => Event::TimerExpired,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            };

            if self.handle(event).is_break() {
                break;
            }
        }
        // dropping the wire sender lets the writer drain its queue
        // and shut the connection down
    }

    fn handle(&mut self, event: Event) -> ControlFlow<()> {
        match event {
            // association teardown events are state independent
            Event::User(Downcall::AbortRequest) => {
                self.abort(AbortRQSource::ServiceUser)
            }
            Event::Pdu(Pdu::AbortRQ { source }) => {
                debug!("association aborted by peer: {:?}", source);
                let _ = self.upcalls.send(Upcall::Aborted { source });
                self.state = State::Sta1;
                ControlFlow::Break(())
            }
            Event::TransportClosed => {
                match self.state {
                    // an ordinary end of association
                    State::Sta1 | State::Sta13 => {}
                    state => {
                        warn!("transport closed in {:?}", state);
                        let _ = self.upcalls.send(Upcall::Aborted {
                            source: AbortRQSource::ServiceProvider(
                                AbortRQServiceProviderReason::ReasonNotSpecified,
                            ),
                        });
                    }
                }
                self.state = State::Sta1;
                ControlFlow::Break(())
            }
            Event::ReadFailed => {
                let source =
                    AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::UnexpectedPdu);
                self.send_pdu(&Pdu::AbortRQ { source });
                let _ = self.upcalls.send(Upcall::Aborted { source });
                self.state = State::Sta1;
                ControlFlow::Break(())
            }
            Event::TimerExpired => match self.state {
                State::Sta1 | State::Sta6 => ControlFlow::Continue(()),
                State::Sta13 => {
                    self.state = State::Sta1;
                    ControlFlow::Break(())
                }
                state => {
                    debug!("ARTIM timer expired in {:?}", state);
                    self.abort(AbortRQSource::ServiceProvider(
                        AbortRQServiceProviderReason::ReasonNotSpecified,
                    ))
                }
            },
            event => self.handle_in_state(event),
        }
    }

    fn handle_in_state(&mut self, event: Event) -> ControlFlow<()> {
        match (self.state, event) {
            // requestor establishment path
            (State::Sta1, Event::User(Downcall::AssociateRequest)) => {
                self.state = State::Sta4;
                ControlFlow::Continue(())
            }
            (State::Sta4, Event::TransportConnected) => self.send_associate_rq(),
            (State::Sta5, Event::Pdu(pdu @ Pdu::AssociationAC { .. })) => {
                self.on_association_ac(pdu)
            }
            (State::Sta5, Event::Pdu(Pdu::AssociationRJ { result, source })) => {
                let _ = self.upcalls.send(Upcall::Rejected { result, source });
                self.state = State::Sta1;
                ControlFlow::Break(())
            }

            // acceptor establishment path
            (State::Sta2, Event::Pdu(pdu @ Pdu::AssociationRQ { .. })) => {
                self.on_association_rq(pdu)
            }

            // data transfer; P-DATA may still arrive while a release
            // initiated by this side is pending
            (State::Sta6, Event::User(Downcall::PDataRequest { presentation_context_id, command, data })) => {
                self.send_p_data(presentation_context_id, &command, &data)
            }
            (State::Sta6, Event::Pdu(Pdu::PData { data }))
            | (State::Sta7, Event::Pdu(Pdu::PData { data })) => self.on_p_data(data),

            // graceful release
            (State::Sta6, Event::User(Downcall::ReleaseRequest)) => {
                self.send_pdu(&Pdu::ReleaseRQ);
                self.state = State::Sta7;
                ControlFlow::Continue(())
            }
            (State::Sta6, Event::Pdu(Pdu::ReleaseRQ)) => {
                // the local release response is issued right away
                self.state = State::Sta8;
                let _ = self.upcalls.send(Upcall::Released);
                self.send_pdu(&Pdu::ReleaseRP);
                self.state = State::Sta13;
                ControlFlow::Continue(())
            }
            (State::Sta7, Event::Pdu(Pdu::ReleaseRP)) => {
                let _ = self.upcalls.send(Upcall::Released);
                self.state = State::Sta1;
                ControlFlow::Break(())
            }
            (State::Sta7, Event::Pdu(Pdu::ReleaseRQ)) => {
                // release collision
                if matches!(self.side, Side::Requestor(_)) {
                    self.state = State::Sta9;
                    self.send_pdu(&Pdu::ReleaseRP);
                    self.state = State::Sta11;
                } else {
                    self.state = State::Sta10;
                }
                ControlFlow::Continue(())
            }
            (State::Sta11, Event::Pdu(Pdu::ReleaseRP)) => {
                let _ = self.upcalls.send(Upcall::Released);
                self.state = State::Sta1;
                ControlFlow::Break(())
            }
            (State::Sta10, Event::Pdu(Pdu::ReleaseRP)) => {
                self.state = State::Sta12;
                self.send_pdu(&Pdu::ReleaseRP);
                let _ = self.upcalls.send(Upcall::Released);
                self.state = State::Sta13;
                ControlFlow::Continue(())
            }

            // local requests that make no sense in the current state
            // are dropped; their operations fail upstream
            (state, Event::User(downcall)) => {
                warn!("discarding {:?} in {:?}", downcall, state);
                ControlFlow::Continue(())
            }
            (State::Sta13, Event::Pdu(pdu)) => {
                debug!("ignoring {} while closing", pdu.short_description());
                ControlFlow::Continue(())
            }
            (state, Event::Pdu(pdu)) => {
                warn!("unexpected {} in {:?}", pdu.short_description(), state);
                self.abort(AbortRQSource::ServiceProvider(
                    AbortRQServiceProviderReason::UnexpectedPdu,
                ))
            }
            (state, event) => {
                warn!("discarding {:?} in {:?}", event, state);
                ControlFlow::Continue(())
            }
        }
    }

    fn send_associate_rq(&mut self) -> ControlFlow<()> {
        let config = match &self.side {
            Side::Requestor(config) => config.clone(),
            Side::Acceptor(_) => {
                return self.abort(AbortRQSource::ServiceProvider(
                    AbortRQServiceProviderReason::ReasonNotSpecified,
                ))
            }
        };

        let mut user_variables = vec![
            UserVariableItem::MaxLength(config.max_pdu_length),
            UserVariableItem::ImplementationClassUID(IMPLEMENTATION_CLASS_UID.to_string()),
            UserVariableItem::ImplementationVersionName(IMPLEMENTATION_VERSION_NAME.to_string()),
        ];
        user_variables.extend(
            config
                .role_selections
                .iter()
                .cloned()
                .map(UserVariableItem::RoleSelection),
        );

        let pdu = Pdu::AssociationRQ {
            protocol_version: config.protocol_version,
            calling_ae_title: config.calling_ae_title.clone(),
            called_ae_title: config.called_ae_title.clone(),
            application_context_name: config.application_context_name.clone(),
            presentation_contexts: config.presentation_contexts.clone(),
            user_variables,
        };
        self.send_pdu(&pdu);
        self.state = State::Sta5;
        ControlFlow::Continue(())
    }

    fn on_association_ac(&mut self, pdu: Pdu) -> ControlFlow<()> {
        let (protocol_version, calling_ae_title, called_ae_title, presentation_contexts, user_variables) =
            match pdu {
                Pdu::AssociationAC {
                    protocol_version,
                    calling_ae_title,
                    called_ae_title,
                    presentation_contexts,
                    user_variables,
                    ..
                } => (
                    protocol_version,
                    calling_ae_title,
                    called_ae_title,
                    presentation_contexts,
                    user_variables,
                ),
                _ => return ControlFlow::Continue(()),
            };

        let config = match &self.side {
            Side::Requestor(config) => config.clone(),
            Side::Acceptor(_) => {
                return self.abort(AbortRQSource::ServiceProvider(
                    AbortRQServiceProviderReason::UnexpectedPdu,
                ))
            }
        };

        if protocol_version != config.protocol_version {
            warn!(
                "protocol version mismatch: expected {}, got {}",
                config.protocol_version, protocol_version
            );
            return self.abort(AbortRQSource::ServiceUser);
        }

        let granted_roles: Vec<RoleSelection> = user_variables
            .iter()
            .filter_map(|item| match item {
                UserVariableItem::RoleSelection(rs) => Some(rs.clone()),
                _ => None,
            })
            .collect();

        self.peer_max_pdu_length = peer_max_pdu_length(&user_variables);
        self.contexts = ContextManager::from_acceptance(
            &config.presentation_contexts,
            &presentation_contexts,
            &granted_roles,
            Role::Scu,
        );

        let info = AssociationInfo {
            contexts: self.contexts.clone(),
            peer_max_pdu_length: self.peer_max_pdu_length,
            calling_ae_title,
            called_ae_title,
        };
        debug!("association established ({} contexts)", info.contexts.contexts().len());
        let _ = self.upcalls.send(Upcall::Established(info));
        self.state = State::Sta6;
        ControlFlow::Continue(())
    }

    fn on_association_rq(&mut self, pdu: Pdu) -> ControlFlow<()> {
        let (protocol_version, calling_ae_title, called_ae_title, application_context_name, presentation_contexts, user_variables) =
            match pdu {
                Pdu::AssociationRQ {
                    protocol_version,
                    calling_ae_title,
                    called_ae_title,
                    application_context_name,
                    presentation_contexts,
                    user_variables,
                } => (
                    protocol_version,
                    calling_ae_title,
                    called_ae_title,
                    application_context_name,
                    presentation_contexts,
                    user_variables,
                ),
                _ => return ControlFlow::Continue(()),
            };

        let config = match &self.side {
            Side::Acceptor(config) => config.clone(),
            Side::Requestor(_) => {
                return self.abort(AbortRQSource::ServiceProvider(
                    AbortRQServiceProviderReason::UnexpectedPdu,
                ))
            }
        };

        // awaiting the local association response;
        // the acceptance policy decides on the spot
        self.state = State::Sta3;

        if protocol_version != config.protocol_version {
            return self.reject(AssociationRJServiceUserReason::NoReasonGiven);
        }
        if application_context_name != config.application_context_name {
            return self.reject(AssociationRJServiceUserReason::ApplicationContextNameNotSupported);
        }
        if let Err(reason) = config.access_control.check_access(
            &config.ae_title,
            &calling_ae_title,
            &called_ae_title,
        ) {
            return self.reject(reason);
        }

        let requested_roles: Vec<RoleSelection> = user_variables
            .iter()
            .filter_map(|item| match item {
                UserVariableItem::RoleSelection(rs) => Some(rs.clone()),
                _ => None,
            })
            .collect();

        let (contexts, results, granted_roles) = ContextManager::negotiate(
            &presentation_contexts,
            &config.abstract_syntaxes,
            &config.transfer_syntaxes,
            &requested_roles,
        );
        if !contexts.has_usable() {
            return self.reject(AssociationRJServiceUserReason::ApplicationContextNameNotSupported);
        }

        self.peer_max_pdu_length = peer_max_pdu_length(&user_variables);
        self.contexts = contexts;

        let mut ac_user_variables = vec![
            UserVariableItem::MaxLength(config.max_pdu_length),
            UserVariableItem::ImplementationClassUID(IMPLEMENTATION_CLASS_UID.to_string()),
            UserVariableItem::ImplementationVersionName(IMPLEMENTATION_VERSION_NAME.to_string()),
        ];
        ac_user_variables.extend(
            granted_roles
                .into_iter()
                .map(UserVariableItem::RoleSelection),
        );

        self.send_pdu(&Pdu::AssociationAC {
            protocol_version: config.protocol_version,
            calling_ae_title: calling_ae_title.clone(),
            called_ae_title: called_ae_title.clone(),
            application_context_name,
            presentation_contexts: results,
            user_variables: ac_user_variables,
        });

        let info = AssociationInfo {
            contexts: self.contexts.clone(),
            peer_max_pdu_length: self.peer_max_pdu_length,
            calling_ae_title,
            called_ae_title,
        };
        debug!(
            "association accepted from {} ({} contexts)",
            info.calling_ae_title,
            info.contexts.contexts().len()
        );
        let _ = self.upcalls.send(Upcall::Established(info));
        self.state = State::Sta6;
        ControlFlow::Continue(())
    }

    fn reject(&mut self, reason: AssociationRJServiceUserReason) -> ControlFlow<()> {
        let result = AssociationRJResult::Permanent;
        let source = AssociationRJSource::ServiceUser(reason);
        self.send_pdu(&Pdu::AssociationRJ { result, source });
        let _ = self.upcalls.send(Upcall::Rejected { result, source });
        self.state = State::Sta13;
        ControlFlow::Continue(())
    }

    fn send_p_data(
        &mut self,
        presentation_context_id: u8,
        command: &Message,
        data: &Bytes,
    ) -> ControlFlow<()> {
        if self.contexts.lookup_by_id(presentation_context_id).is_none() {
            warn!(
                "no presentation context with ID {}, dropping request",
                presentation_context_id
            );
            return ControlFlow::Continue(());
        }

        let pdus = match fragment(
            presentation_context_id,
            command,
            data,
            self.peer_max_pdu_length,
        ) {
            Ok(pdus) => pdus,
            Err(e) => {
                warn!("could not encode DIMSE command: {}", e);
                return self.abort(AbortRQSource::ServiceUser);
            }
        };
        for pdu in pdus {
            self.send_pdu(&pdu);
        }
        ControlFlow::Continue(())
    }

    fn on_p_data(&mut self, data: Vec<PDataValue>) -> ControlFlow<()> {
        if let Some(pdv) = data
            .iter()
            .find(|pdv| self.contexts.lookup_by_id(pdv.presentation_context_id).is_none())
        {
            warn!(
                "P-DATA on unknown presentation context {}",
                pdv.presentation_context_id
            );
        }
        match self.assembler.add_pdata(data) {
            Ok(messages) => {
                for message in messages {
                    let _ = self.upcalls.send(Upcall::Data(message));
                }
                ControlFlow::Continue(())
            }
            Err(e) => {
                warn!("invalid P-DATA stream: {}", e);
                self.abort(AbortRQSource::ServiceProvider(
                    AbortRQServiceProviderReason::InvalidPduParameter,
                ))
            }
        }
    }

    fn abort(&mut self, source: AbortRQSource) -> ControlFlow<()> {
        self.send_pdu(&Pdu::AbortRQ { source });
        let _ = self.upcalls.send(Upcall::Aborted { source });
        self.state = State::Sta1;
        ControlFlow::Break(())
    }

    fn send_pdu(&mut self, pdu: &Pdu) {
        let mut buffer = Vec::new();
        match write_pdu(&mut buffer, pdu) {
            Ok(()) => {
                debug!("sending {}", pdu.short_description());
                let _ = self.wire.send(buffer);
            }
            Err(e) => warn!("could not encode {}: {}", pdu.short_description(), e),
        }
    }
}

fn peer_max_pdu_length(user_variables: &[UserVariableItem]) -> u32 {
    let declared = user_variables
        .iter()
        .find_map(|item| match item {
            UserVariableItem::MaxLength(length) => Some(*length),
            _ => None,
        })
        .unwrap_or(DEFAULT_MAX_PDU);
    // zero means unlimited; tiny values would not fit a single PDV
    if declared == 0 {
        u32::MAX
    } else {
        declared.max(MINIMUM_PDU_SIZE)
    }
}

/// Split one DIMSE message into P-DATA-TF PDUs, each within the
/// peer's maximum PDU length. Command fragments precede data
/// fragments and both may share a PDU, but never interleave;
/// the last fragment of each stream carries the last flag.
fn fragment(
    presentation_context_id: u8,
    command: &Message,
    data: &Bytes,
    max_pdu_length: u32,
) -> dimse::Result<Vec<Pdu>> {
    let command_bytes = dimse::write_message(command)?;
    let value_cap = (max_pdu_length - PDV_HEADER_SIZE) as usize;

    let mut values = Vec::new();
    push_fragments(
        &mut values,
        presentation_context_id,
        PDataValueType::Command,
        &command_bytes,
        value_cap,
    );
    if command.has_data() {
        push_fragments(
            &mut values,
            presentation_context_id,
            PDataValueType::Data,
            data,
            value_cap,
        );
    }

    // pack the fragments greedily without splitting any of them
    let mut pdus = Vec::new();
    let mut current = Vec::new();
    let mut current_len = 0usize;
    for value in values {
        let value_len = value.data.len() + PDV_HEADER_SIZE as usize;
        if !current.is_empty() && current_len + value_len > max_pdu_length as usize {
            pdus.push(Pdu::PData {
                data: std::mem::take(&mut current),
            });
            current_len = 0;
        }
        current_len += value_len;
        current.push(value);
    }
    if !current.is_empty() {
        pdus.push(Pdu::PData { data: current });
    }
    Ok(pdus)
}

fn push_fragments(
    values: &mut Vec<PDataValue>,
    presentation_context_id: u8,
    value_type: PDataValueType,
    bytes: &[u8],
    value_cap: usize,
) {
    if bytes.is_empty() {
        values.push(PDataValue {
            presentation_context_id,
            value_type,
            is_last: true,
            data: Vec::new(),
        });
        return;
    }
    let mut offset = 0;
    while offset < bytes.len() {
        let end = (offset + value_cap).min(bytes.len());
        values.push(PDataValue {
            presentation_context_id,
            value_type,
            is_last: end == bytes.len(),
            data: bytes[offset..end].to_vec(),
        });
        offset = end;
    }
}
