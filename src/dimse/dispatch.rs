//! Inbound DIMSE request dispatch.
//!
//! A [`Dispatcher`] drives an accepted association:
//! each incoming request is routed by its SOP class UID
//! to a [`ServiceHandler`] registered in a [`ServiceRegistry`],
//! and the handler's outcome is turned into one or more responses.
//! Service failures are reported to the peer as response statuses,
//! never as errors of the dispatch loop itself.
use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use snafu::ResultExt;
use tracing::{debug, info, warn};

use crate::association::{self, ServerAssociation};
use crate::dimse::command::{
    self, CommandSet, C_CANCEL_RQ, C_ECHO_RQ, C_FIND_RQ, C_GET_RQ, C_MOVE_RQ, C_STORE_RQ,
    N_ACTION_RQ, N_CREATE_RQ, N_DELETE_RQ, N_EVENT_REPORT_RQ, N_GET_RQ, N_SET_RQ, RSP_BIT,
};
use crate::dimse::{
    AssociationSnafu, DimseMessage, Result, STATUS_CANCELED, STATUS_NO_SUCH_SOP_CLASS,
    STATUS_PENDING, STATUS_SUCCESS, STATUS_UNRECOGNIZED_OPERATION,
};

/// How long to wait for a C-CANCEL between intermediate responses.
const CANCEL_PROBE_TIMEOUT: Duration = Duration::from_millis(10);

/// A service failure to be reported to the peer
/// as the status of the final response.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceException {
    /// the status code of the final response
    pub status: u16,
    /// a free text comment on the failure
    pub error_comment: Option<String>,
    /// the error ID of the failure
    pub error_id: Option<u16>,
    /// the event type the failure refers to
    pub event_type_id: Option<u16>,
    /// the action type the failure refers to
    pub action_type_id: Option<u16>,
}

impl ServiceException {
    /// Create an exception with the given status and no further detail.
    pub fn new(status: u16) -> Self {
        ServiceException {
            status,
            error_comment: None,
            error_id: None,
            event_type_id: None,
            action_type_id: None,
        }
    }

    /// Attach a free text comment.
    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.error_comment = Some(comment.into());
        self
    }

    /// Attach an error ID.
    pub fn with_error_id(mut self, error_id: u16) -> Self {
        self.error_id = Some(error_id);
        self
    }

    /// Attach an event type ID.
    pub fn with_event_type_id(mut self, event_type_id: u16) -> Self {
        self.event_type_id = Some(event_type_id);
        self
    }

    /// Attach an action type ID.
    pub fn with_action_type_id(mut self, action_type_id: u16) -> Self {
        self.action_type_id = Some(action_type_id);
        self
    }
}

/// A source of intermediate response data sets,
/// such as the successive identifiers of a query.
pub trait ResponseProducer: std::fmt::Debug + Send {
    /// Produce the next data set,
    /// `None` once the operation has completed,
    /// or a [`ServiceException`] on failure.
    fn next(&mut self) -> Result<Option<Bytes>, ServiceException>;

    /// Release any resources held by the producer.
    ///
    /// Called exactly once,
    /// on completion, failure and cancellation alike.
    fn release(&mut self) {}
}

/// What a service handler decided to answer.
#[derive(Debug)]
pub enum HandlerOutcome {
    /// a single response with the given status
    Single {
        /// the status of the response
        status: u16,
        /// the data set accompanying the response, if any
        data: Option<Bytes>,
    },
    /// a stream of pending responses followed by a final one,
    /// driven by the given producer
    Multiple(Box<dyn ResponseProducer>),
}

/// An application service bound to one or more SOP classes.
pub trait ServiceHandler: std::fmt::Debug + Send + Sync {
    /// Handle one request message.
    ///
    /// A returned exception becomes the status of the response;
    /// it does not end the association.
    fn handle(&self, request: &DimseMessage) -> Result<HandlerOutcome, ServiceException>;
}

/// A built-in verification service:
/// answers every C-ECHO request with a success status.
#[derive(Debug, Default, Copy, Clone)]
pub struct EchoHandler;

impl ServiceHandler for EchoHandler {
    fn handle(&self, _request: &DimseMessage) -> Result<HandlerOutcome, ServiceException> {
        Ok(HandlerOutcome::Single {
            status: STATUS_SUCCESS,
            data: None,
        })
    }
}

/// The table of service handlers of an application entity,
/// keyed by SOP class UID.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    handlers: HashMap<String, Box<dyn ServiceHandler>>,
}

impl ServiceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a handler to the given SOP class UID,
    /// replacing any previous binding.
    pub fn with_handler(
        mut self,
        sop_class_uid: impl Into<String>,
        handler: impl ServiceHandler + 'static,
    ) -> Self {
        self.handlers.insert(sop_class_uid.into(), Box::new(handler));
        self
    }

    /// Bind the built-in [`EchoHandler`] to the verification SOP class.
    pub fn with_verification(self) -> Self {
        self.with_handler(command::VERIFICATION_SOP_CLASS, EchoHandler)
    }

    /// Look up the handler for the given SOP class UID.
    pub fn get(&self, sop_class_uid: &str) -> Option<&dyn ServiceHandler> {
        self.handlers.get(sop_class_uid).map(|h| h.as_ref())
    }
}

/// The dispatch loop of a service class provider.
///
/// [`run`](Self::run) reads requests from the association
/// until the peer releases or aborts it,
/// answering each one through the registered handlers.
#[derive(Debug)]
pub struct Dispatcher {
    registry: ServiceRegistry,
}

impl Dispatcher {
    /// Create a dispatcher around the given registry.
    pub fn new(registry: ServiceRegistry) -> Self {
        Dispatcher { registry }
    }

    /// Serve the given association until it ends.
    ///
    /// A graceful release or an abort from the peer
    /// ends the loop with success.
    pub fn run(&self, association: &mut ServerAssociation) -> Result<()> {
        loop {
            let msg = match association.read_message() {
                Ok(msg) => msg,
                Err(association::Error::AssociationClosed { .. }) => {
                    info!("association with {} ended", association.peer_ae_title());
                    return Ok(());
                }
                Err(e) => return Err(e).context(AssociationSnafu),
            };
            self.handle_message(association, msg)?;
        }
    }

    fn handle_message(
        &self,
        association: &mut ServerAssociation,
        msg: DimseMessage,
    ) -> Result<()> {
        let command_field = match msg.command.command_field() {
            Some(field) => field,
            None => {
                warn!("request without a command field");
                let rsp = response_command(&msg.command, STATUS_UNRECOGNIZED_OPERATION, None);
                return write_response(association, msg.presentation_context_id, rsp, None);
            }
        };
        if command_field & RSP_BIT != 0 {
            warn!("discarding stray response message");
            return Ok(());
        }
        if command_field == C_CANCEL_RQ {
            // no operation in progress, nothing to cancel
            debug!("discarding C-CANCEL with no matching operation");
            return Ok(());
        }
        if !matches!(
            command_field,
            C_ECHO_RQ
                | C_STORE_RQ
                | C_FIND_RQ
                | C_GET_RQ
                | C_MOVE_RQ
                | N_EVENT_REPORT_RQ
                | N_GET_RQ
                | N_SET_RQ
                | N_ACTION_RQ
                | N_CREATE_RQ
                | N_DELETE_RQ
        ) {
            warn!("unrecognized command field {:#06x}", command_field);
            let rsp = response_command(&msg.command, STATUS_UNRECOGNIZED_OPERATION, None);
            return write_response(association, msg.presentation_context_id, rsp, None);
        }

        // N-GET, N-SET, N-ACTION and N-DELETE address the SOP class
        // through the requested UID instead of the affected one
        let sop_class_uid = msg
            .command
            .affected_sop_class_uid()
            .or_else(|| msg.command.requested_sop_class_uid());
        let handler = sop_class_uid.and_then(|uid| self.registry.get(uid));
        let handler = match handler {
            Some(handler) => handler,
            None => {
                warn!("no service registered for SOP class {:?}", sop_class_uid);
                let rsp = response_command(&msg.command, STATUS_NO_SUCH_SOP_CLASS, None);
                return write_response(association, msg.presentation_context_id, rsp, None);
            }
        };

        match handler.handle(&msg) {
            Ok(HandlerOutcome::Single { status, data }) => {
                let rsp = response_command(&msg.command, status, None);
                write_response(association, msg.presentation_context_id, rsp, data)
            }
            Ok(HandlerOutcome::Multiple(producer)) => {
                self.drain_producer(association, &msg, producer)
            }
            Err(exception) => {
                let rsp = response_command(&msg.command, exception.status, Some(&exception));
                write_response(association, msg.presentation_context_id, rsp, None)
            }
        }
    }

    /// Emit one pending response per produced data set,
    /// watching for a C-CANCEL from the peer in between,
    /// then close the operation with a terminal response.
    fn drain_producer(
        &self,
        association: &mut ServerAssociation,
        request: &DimseMessage,
        mut producer: Box<dyn ResponseProducer>,
    ) -> Result<()> {
        let message_id = request.command.message_id();
        loop {
            match self.check_cancel(association, message_id) {
                Ok(false) => {}
                Ok(true) => {
                    producer.release();
                    debug!("operation canceled by the peer");
                    let rsp = response_command(&request.command, STATUS_CANCELED, None);
                    return write_response(
                        association,
                        request.presentation_context_id,
                        rsp,
                        None,
                    );
                }
                Err(e) => {
                    producer.release();
                    return Err(e);
                }
            }
            match producer.next() {
                Ok(Some(data)) => {
                    let rsp = response_command(&request.command, STATUS_PENDING, None);
                    write_response(
                        association,
                        request.presentation_context_id,
                        rsp,
                        Some(data),
                    )?;
                }
                Ok(None) => {
                    producer.release();
                    let rsp = response_command(&request.command, STATUS_SUCCESS, None);
                    return write_response(
                        association,
                        request.presentation_context_id,
                        rsp,
                        None,
                    );
                }
                Err(exception) => {
                    producer.release();
                    let rsp = response_command(
                        &request.command,
                        exception.status,
                        Some(&exception),
                    );
                    return write_response(
                        association,
                        request.presentation_context_id,
                        rsp,
                        None,
                    );
                }
            }
        }
    }

    /// Probe the transport for an inbound C-CANCEL
    /// referencing the operation in progress.
    ///
    /// Messages which are not a matching C-CANCEL are discarded.
    fn check_cancel(
        &self,
        association: &mut ServerAssociation,
        message_id: Option<u16>,
    ) -> Result<bool> {
        let stream = association.inner_stream();
        if stream.set_read_timeout(Some(CANCEL_PROBE_TIMEOUT)).is_err() {
            return Ok(false);
        }
        let mut probe = [0u8; 1];
        match stream.peek(&mut probe) {
            Ok(n) if n > 0 => {}
            // no data within the probe window, or the peer went away:
            // carry on and let the next write or read report it
            _ => return Ok(false),
        }
        let msg = association.read_message().context(AssociationSnafu)?;
        let is_cancel = msg.command.command_field() == Some(C_CANCEL_RQ)
            && msg.command.message_id_being_responded_to() == message_id;
        if !is_cancel {
            warn!("discarding message received mid-operation");
        }
        Ok(is_cancel)
    }
}

/// Build the response command set for the given request:
/// the response bit is set on the echoed command field,
/// the message ID and SOP class are carried over
/// and any exception detail is attached.
fn response_command(
    request: &CommandSet,
    status: u16,
    exception: Option<&ServiceException>,
) -> CommandSet {
    let mut rsp = CommandSet::new();
    rsp.put_uint(
        command::COMMAND_FIELD,
        request.command_field().unwrap_or(0) | RSP_BIT,
    );
    rsp.put_uint(
        command::MESSAGE_ID_BEING_RESPONDED_TO,
        request.message_id().unwrap_or(0),
    );
    if let Some(uid) = request
        .affected_sop_class_uid()
        .or_else(|| request.requested_sop_class_uid())
    {
        rsp.put_str(command::AFFECTED_SOP_CLASS_UID, uid);
    }
    if let Some(uid) = request
        .affected_sop_instance_uid()
        .or_else(|| request.requested_sop_instance_uid())
    {
        rsp.put_str(command::AFFECTED_SOP_INSTANCE_UID, uid);
    }
    rsp.put_uint(command::STATUS, status);
    if let Some(exception) = exception {
        if let Some(comment) = &exception.error_comment {
            rsp.put_str(command::ERROR_COMMENT, comment.clone());
        }
        if let Some(error_id) = exception.error_id {
            rsp.put_uint(command::ERROR_ID, error_id);
        }
        if let Some(event_type_id) = exception.event_type_id {
            rsp.put_uint(command::EVENT_TYPE_ID, event_type_id);
        }
        if let Some(action_type_id) = exception.action_type_id {
            rsp.put_uint(command::ACTION_TYPE_ID, action_type_id);
        }
    }
    rsp
}

fn write_response(
    association: &mut ServerAssociation,
    presentation_context_id: u8,
    mut command: CommandSet,
    data: Option<Bytes>,
) -> Result<()> {
    let data_set_type = if data.is_some() {
        command::DATA_SET_PRESENT
    } else {
        command::NO_DATA_SET
    };
    command.put_uint(command::COMMAND_DATA_SET_TYPE, data_set_type);
    let msg = DimseMessage {
        presentation_context_id,
        command,
        data,
    };
    association.write_message(&msg).context(AssociationSnafu)
}
