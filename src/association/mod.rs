//! DICOM association module
//!
//! This module contains utilities for establishing associations
//! between DICOM nodes via TCP/IP.
//!
//! As an association requester, often as a service class user (SCU),
//! a new association can be started
//! via the [`ClientAssociationOptions`][1] type.
//! The minimum required properties are the proposed presentation contexts
//! and the TCP socket address to the target node.
//!
//! As an association acceptor,
//! usually taking the role of a service class provider (SCP),
//! a newly created [TCP stream][2] can be passed to
//! a previously prepared [`ServerAssociationOptions`][3],
//! which negotiates presentation contexts
//! according to an [`AcceptorPolicy`][4].
//!
//! [1]: crate::association::client::ClientAssociationOptions
//! [2]: std::net::TcpStream
//! [3]: crate::association::server::ServerAssociationOptions
//! [4]: crate::association::negotiation::AcceptorPolicy
pub mod client;
pub mod negotiation;
pub mod pdata;
pub mod server;

pub(crate) mod uid;

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use snafu::{Backtrace, ResultExt, Snafu};
use tracing::{debug, warn};

use crate::dimse::command::CommandSet;
use crate::dimse::DimseMessage;
use crate::pdu::{
    read_pdu, write_pdu, AbortRQServiceProviderReason, AbortRQSource, PDataValueType, Pdu,
    PresentationContextResult, MINIMUM_PDU_SIZE,
};

pub use client::{ClientAssociation, ClientAssociationOptions, ConnectOutcome};
pub use negotiation::{AcceptorPolicy, AePolicy, AeSelector, NegotiationOutcome};
pub use pdata::{fragment_message, MessageReassembler, ReassembledStream};
pub use server::{AcceptOutcome, ServerAssociation, ServerAssociationOptions};

/// The role this application entity took
/// when the association was established.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AssociationRole {
    /// this node requested the association
    Requestor,
    /// this node accepted the association
    Acceptor,
}

/// The lifecycle state of an association.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AssociationState {
    /// no connection activity yet
    Idle,
    /// acceptor waiting for the peer's association request
    AwaitingReadAssocRq,
    /// requestor about to write the association request
    AwaitingWriteAssocRq,
    /// requestor waiting for the association response
    AwaitingReadAssocRp,
    /// acceptor about to write the association response
    AwaitingWriteAssocRp,
    /// data transfer may proceed in both directions
    Established,
    /// local release requested, waiting for the peer's reply
    AwaitingReadReleaseRp,
    /// peer release requested, reply pending
    AwaitingWriteReleaseRp,
    /// release collision, requestor side waiting for the peer's reply
    ReleaseCollisionRequestorAwaitingRead,
    /// release collision, requestor side about to send its own reply
    ReleaseCollisionRequestorAwaitingWrite,
    /// release collision, acceptor side about to send its own reply
    ReleaseCollisionAcceptorAwaitingWrite,
    /// release collision, acceptor side waiting for the peer's reply
    ReleaseCollisionAcceptorAwaitingRead,
    /// the association is finished, no further activity is possible
    Terminating,
}

/// The protocol phase in which a timeout elapsed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TimeoutPhase {
    /// waiting for an association request
    AssociationRq,
    /// waiting for an association response
    AssociationAc,
    /// waiting for a DIMSE message
    Dimse,
    /// waiting for a release reply
    Release,
}

impl std::fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            TimeoutPhase::AssociationRq => "association request",
            TimeoutPhase::AssociationAc => "association response",
            TimeoutPhase::Dimse => "DIMSE message",
            TimeoutPhase::Release => "release reply",
        };
        f.write_str(msg)
    }
}

/// Timeouts applied to the blocking operations of an association.
///
/// `None` means waiting forever.
/// An elapsed timeout aborts the association,
/// it is never retried.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeoutOptions {
    /// maximum time an acceptor waits for the association request
    pub rq_timeout: Option<Duration>,
    /// maximum time a requestor waits for the association response
    pub ac_timeout: Option<Duration>,
    /// maximum time to wait for a DIMSE message
    pub dimse_timeout: Option<Duration>,
    /// maximum time to wait for the release reply
    pub release_timeout: Option<Duration>,
    /// how long to linger after sending an abort
    /// before shutting the transport down
    pub so_close_delay: Duration,
}

impl Default for TimeoutOptions {
    fn default() -> Self {
        TimeoutOptions {
            rq_timeout: Some(Duration::from_secs(30)),
            ac_timeout: Some(Duration::from_secs(30)),
            dimse_timeout: None,
            release_timeout: Some(Duration::from_secs(10)),
            so_close_delay: Duration::from_millis(100),
        }
    }
}

impl TimeoutOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rq_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.rq_timeout = timeout;
        self
    }

    pub fn ac_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.ac_timeout = timeout;
        self
    }

    pub fn dimse_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.dimse_timeout = timeout;
        self
    }

    pub fn release_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.release_timeout = timeout;
        self
    }

    pub fn so_close_delay(mut self, delay: Duration) -> Self {
        self.so_close_delay = delay;
        self
    }
}

/// The transport over which an association runs.
///
/// [`TcpStream`] implements this trait directly.
/// A secure transport can participate in associations
/// by implementing it as well.
pub trait AssociationStream: Read + Write {
    /// Apply a read timeout to the transport,
    /// `None` meaning blocking reads.
    fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()>;

    /// Shut the transport down in both directions.
    fn shutdown(&self) -> std::io::Result<()>;

    /// Obtain an independent handle to the same transport,
    /// so that reading and writing can proceed from separate threads.
    fn try_clone(&self) -> std::io::Result<Self>
    where
        Self: Sized;
}

impl AssociationStream for TcpStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }

    fn shutdown(&self) -> std::io::Result<()> {
        TcpStream::shutdown(self, std::net::Shutdown::Both)
    }

    fn try_clone(&self) -> std::io::Result<Self> {
        TcpStream::try_clone(self)
    }
}

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// failed to decode an incoming PDU
    #[non_exhaustive]
    MalformedPdu {
        #[snafu(backtrace)]
        source: crate::pdu::reader::Error,
    },

    /// failed to encode an outgoing PDU
    #[non_exhaustive]
    InvalidField {
        #[snafu(backtrace)]
        source: crate::pdu::writer::Error,
    },

    /// failed to send PDU message on wire
    #[non_exhaustive]
    WireSend {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("timed out waiting for {}", phase))]
    Timeout {
        phase: TimeoutPhase,
        backtrace: Backtrace,
    },

    /// the association is released, aborted or otherwise closed
    AssociationClosed { backtrace: Backtrace },

    #[snafu(display("unexpected PDU `{}`", pdu.short_description()))]
    #[non_exhaustive]
    UnexpectedPdu {
        /// the PDU obtained from the peer
        pdu: Box<Pdu>,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "received data for presentation context {}, which was not accepted",
        id
    ))]
    UnknownPresentationContext { id: u8, backtrace: Backtrace },

    /// invalid fragment sequence in incoming data
    #[non_exhaustive]
    Fragmentation {
        #[snafu(backtrace)]
        source: pdata::Error,
    },

    /// failed to decode an incoming command set
    #[non_exhaustive]
    InvalidCommand {
        #[snafu(backtrace)]
        source: crate::dimse::command::Error,
    },

    #[snafu(display(
        "PDU is too large ({} bytes) to be sent to the remote application entity",
        length
    ))]
    #[non_exhaustive]
    SendTooLongPdu { length: usize, backtrace: Backtrace },

    /// no presentation contexts accepted by the peer
    NoAcceptedPresentationContexts { backtrace: Backtrace },

    /// missing abstract syntax to begin negotiation
    MissingAbstractSyntax { backtrace: Backtrace },

    /// too many presentation contexts proposed
    TooManyPresentationContexts { count: usize, backtrace: Backtrace },

    /// could not connect to peer
    Connect {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("protocol version mismatch: expected {}, got {}", expected, got))]
    ProtocolVersionMismatch {
        expected: u16,
        got: u16,
        backtrace: Backtrace,
    },

    /// could not set a timeout on the transport
    SetTimeout {
        source: std::io::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

fn is_io_timeout(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

fn reader_error_is_timeout(e: &crate::pdu::reader::Error) -> bool {
    use crate::pdu::reader::Error as E;
    match e {
        E::ReadPdu { source, .. }
        | E::ReadPduItem { source, .. }
        | E::ReadPduField { source, .. }
        | E::ReadReserved { source, .. } => is_io_timeout(source),
        _ => false,
    }
}

/// An established DICOM upper layer association,
/// generic over the transport.
///
/// This is the common core behind
/// [`ClientAssociation`] and [`ServerAssociation`]:
/// it sends and receives whole DIMSE messages,
/// fragmenting and reassembling them into P-DATA-TF PDUs,
/// and drives the orderly release and abort procedures.
///
/// When the value falls out of scope while still established,
/// the program will automatically try to gracefully release the association,
/// then shut the transport down.
#[derive(Debug)]
pub struct Association<S: AssociationStream> {
    /// The transport to the other DICOM node
    socket: S,
    /// Which side of the association this node is
    role: AssociationRole,
    /// The current lifecycle state
    state: AssociationState,
    /// The negotiated presentation contexts, accepted ones only
    presentation_contexts: Vec<PresentationContextResult>,
    /// The maximum PDU length that the peer accepts
    peer_max_pdu_length: u32,
    /// The maximum PDU length that this node is expecting to receive
    max_pdu_length: u32,
    /// The timeouts applied to blocking operations
    timeouts: TimeoutOptions,
    /// whether to receive PDUs in strict mode
    strict: bool,
    /// whether multiple PDVs may share one outgoing PDU
    pack_pdvs: bool,
    /// Buffer to assemble PDUs before sending them on the wire
    buffer: Vec<u8>,
    /// Accumulator for incoming message fragments
    reassembler: MessageReassembler,
}

impl<S> Association<S>
where
    S: AssociationStream,
{
    pub(crate) fn new(
        socket: S,
        role: AssociationRole,
        presentation_contexts: Vec<PresentationContextResult>,
        peer_max_pdu_length: u32,
        max_pdu_length: u32,
        timeouts: TimeoutOptions,
        strict: bool,
        pack_pdvs: bool,
    ) -> Self {
        Association {
            socket,
            role,
            state: AssociationState::Established,
            presentation_contexts,
            peer_max_pdu_length,
            max_pdu_length,
            timeouts,
            strict,
            pack_pdvs,
            buffer: Vec::with_capacity(max_pdu_length as usize),
            reassembler: MessageReassembler::new(),
        }
    }

    /// Retrieve the role this node took in the association.
    pub fn role(&self) -> AssociationRole {
        self.role
    }

    /// Retrieve the current lifecycle state.
    pub fn state(&self) -> AssociationState {
        self.state
    }

    /// Retrieve the list of accepted presentation contexts.
    pub fn presentation_contexts(&self) -> &[PresentationContextResult] {
        &self.presentation_contexts
    }

    /// Retrieve the maximum PDU length admitted by the peer.
    pub fn peer_max_pdu_length(&self) -> u32 {
        self.peer_max_pdu_length
    }

    /// Retrieve the maximum PDU length
    /// that this application entity is expecting to receive.
    pub fn max_pdu_length(&self) -> u32 {
        self.max_pdu_length
    }

    /// Whether outgoing PDVs may share one PDU.
    pub(crate) fn pack_pdvs(&self) -> bool {
        self.pack_pdvs
    }

    fn ensure_established(&self) -> Result<()> {
        if self.state != AssociationState::Established {
            return AssociationClosedSnafu.fail();
        }
        Ok(())
    }

    /// Send a PDU message to the peer.
    pub fn send(&mut self, msg: &Pdu) -> Result<()> {
        self.ensure_established()?;
        self.send_impl(msg)
    }

    fn send_impl(&mut self, msg: &Pdu) -> Result<()> {
        self.buffer.clear();
        write_pdu(&mut self.buffer, msg).context(InvalidFieldSnafu)?;
        if self.buffer.len() > self.peer_max_pdu_length as usize + 6 {
            return SendTooLongPduSnafu {
                length: self.buffer.len(),
            }
            .fail();
        }
        self.socket.write_all(&self.buffer).context(WireSendSnafu)
    }

    /// Read a PDU message from the peer,
    /// waiting at most `timeout` and reporting `phase` when it elapses.
    fn receive_impl(
        &mut self,
        timeout: Option<Duration>,
        phase: TimeoutPhase,
    ) -> Result<Pdu> {
        self.socket
            .set_read_timeout(timeout)
            .context(SetTimeoutSnafu)?;
        // the announced maximum may be below the reader's floor
        // when a small PDU length was negotiated
        let read_max = self.max_pdu_length.max(MINIMUM_PDU_SIZE);
        match read_pdu(&mut self.socket, read_max, self.strict) {
            Ok(pdu) => {
                debug!("received {}", pdu.short_description());
                Ok(pdu)
            }
            Err(e) if reader_error_is_timeout(&e) => {
                self.abort_impl(AbortRQSource::ServiceProvider(
                    AbortRQServiceProviderReason::ReasonNotSpecified,
                ));
                TimeoutSnafu { phase }.fail()
            }
            Err(crate::pdu::reader::Error::NoPduAvailable { .. }) => {
                self.state = AssociationState::Terminating;
                AssociationClosedSnafu.fail()
            }
            Err(e) => {
                self.abort_impl(AbortRQSource::ServiceProvider(
                    AbortRQServiceProviderReason::InvalidPduParameter,
                ));
                Err(e).context(MalformedPduSnafu)
            }
        }
    }

    /// Receive a PDU message during data transfer.
    pub fn receive(&mut self) -> Result<Pdu> {
        self.ensure_established()?;
        self.receive_impl(self.timeouts.dimse_timeout, TimeoutPhase::Dimse)
    }

    /// Send one whole DIMSE message,
    /// splitting it into as many P-DATA-TF PDUs as needed.
    pub fn write_message(&mut self, msg: &DimseMessage) -> Result<()> {
        self.ensure_established()?;
        let command_bytes = msg.command.to_bytes();
        let pdus = fragment_message(
            msg.presentation_context_id,
            &command_bytes,
            msg.data.as_deref(),
            self.peer_max_pdu_length,
            self.pack_pdvs,
        )
        .context(FragmentationSnafu)?;
        for pdu in &pdus {
            self.send_impl(pdu)?;
        }
        Ok(())
    }

    /// Block until one whole DIMSE message has been received.
    ///
    /// A peer release request received here is acknowledged,
    /// after which the association is closed;
    /// a peer abort closes it immediately.
    /// Both surface as [`Error::AssociationClosed`].
    pub fn read_message(&mut self) -> Result<DimseMessage> {
        self.ensure_established()?;
        let mut command: Option<CommandSet> = None;
        let mut command_pcid = 0;
        loop {
            let pdu = self.receive_impl(self.timeouts.dimse_timeout, TimeoutPhase::Dimse)?;
            match pdu {
                Pdu::PData { data } => {
                    for pdv in data {
                        if !self
                            .presentation_contexts
                            .iter()
                            .any(|pc| pc.id == pdv.presentation_context_id)
                        {
                            let id = pdv.presentation_context_id;
                            self.abort_impl(AbortRQSource::ServiceProvider(
                                AbortRQServiceProviderReason::UnrecognizedPduParameter,
                            ));
                            return UnknownPresentationContextSnafu { id }.fail();
                        }
                        // a data stream may only follow a command
                        // of the same presentation context
                        if pdv.value_type == PDataValueType::Data
                            && !self.reassembler.is_in_progress()
                        {
                            match &command {
                                Some(_) if command_pcid == pdv.presentation_context_id => {}
                                _ => {
                                    let id = pdv.presentation_context_id;
                                    self.abort_impl(AbortRQSource::ServiceProvider(
                                        AbortRQServiceProviderReason::UnexpectedPduParameter,
                                    ));
                                    return UnknownPresentationContextSnafu { id }.fail();
                                }
                            }
                        }
                        let stream = match self.reassembler.push(pdv) {
                            Ok(stream) => stream,
                            Err(e) => {
                                self.abort_impl(AbortRQSource::ServiceProvider(
                                    AbortRQServiceProviderReason::UnexpectedPduParameter,
                                ));
                                return Err(e).context(FragmentationSnafu);
                            }
                        };
                        match stream {
                            None => {}
                            Some(ReassembledStream::Command {
                                presentation_context_id,
                                data,
                            }) => {
                                let cmd = match CommandSet::from_bytes(&data) {
                                    Ok(cmd) => cmd,
                                    Err(e) => {
                                        self.abort_impl(AbortRQSource::ServiceProvider(
                                            AbortRQServiceProviderReason::InvalidPduParameter,
                                        ));
                                        return Err(e).context(InvalidCommandSnafu);
                                    }
                                };
                                if !cmd.has_data_set() {
                                    return Ok(DimseMessage {
                                        presentation_context_id,
                                        command: cmd,
                                        data: None,
                                    });
                                }
                                command = Some(cmd);
                                command_pcid = presentation_context_id;
                            }
                            Some(ReassembledStream::Data {
                                presentation_context_id,
                                data,
                            }) => {
                                // presence of a preceding command
                                // was checked before pushing the fragment
                                if let Some(cmd) = command.take() {
                                    return Ok(DimseMessage {
                                        presentation_context_id,
                                        command: cmd,
                                        data: Some(data.into()),
                                    });
                                }
                            }
                        }
                    }
                }
                Pdu::ReleaseRQ => {
                    self.state = AssociationState::AwaitingWriteReleaseRp;
                    let _ = self.send_impl(&Pdu::ReleaseRP);
                    self.state = AssociationState::Terminating;
                    let _ = self.socket.shutdown();
                    return AssociationClosedSnafu.fail();
                }
                Pdu::AbortRQ { source } => {
                    warn!("association aborted by peer: {:?}", source);
                    self.state = AssociationState::Terminating;
                    let _ = self.socket.shutdown();
                    return AssociationClosedSnafu.fail();
                }
                pdu @ Pdu::Unknown { .. } => {
                    self.abort_impl(AbortRQSource::ServiceProvider(
                        AbortRQServiceProviderReason::UnrecognizedPdu,
                    ));
                    return UnexpectedPduSnafu { pdu }.fail();
                }
                pdu => {
                    self.abort_impl(AbortRQSource::ServiceProvider(
                        AbortRQServiceProviderReason::UnexpectedPdu,
                    ));
                    return UnexpectedPduSnafu { pdu }.fail();
                }
            }
        }
    }

    /// Gracefully terminate the association
    /// by exchanging release messages,
    /// then shut the transport down.
    pub fn release(mut self) -> Result<()> {
        let out = self.release_impl();
        let _ = self.socket.shutdown();
        out
    }

    /// Send an abort message,
    /// linger for the configured close delay,
    /// and shut the transport down.
    pub fn abort(mut self) -> Result<()> {
        if self.state == AssociationState::Terminating {
            return AssociationClosedSnafu.fail();
        }
        self.abort_impl(AbortRQSource::ServiceUser);
        Ok(())
    }

    fn abort_impl(&mut self, source: AbortRQSource) {
        if self.state == AssociationState::Terminating {
            return;
        }
        let _ = self.send_impl(&Pdu::AbortRQ { source });
        self.state = AssociationState::Terminating;
        std::thread::sleep(self.timeouts.so_close_delay);
        let _ = self.socket.shutdown();
    }

    fn release_impl(&mut self) -> Result<()> {
        self.ensure_established()?;
        self.send_impl(&Pdu::ReleaseRQ)?;
        self.state = AssociationState::AwaitingReadReleaseRp;
        loop {
            let pdu = self.receive_impl(self.timeouts.release_timeout, TimeoutPhase::Release)?;
            match (pdu, self.state) {
                (Pdu::ReleaseRP, AssociationState::AwaitingReadReleaseRp) => {
                    self.state = AssociationState::Terminating;
                    return Ok(());
                }
                (Pdu::ReleaseRQ, AssociationState::AwaitingReadReleaseRp) => {
                    // release collision:
                    // the association requestor holds its reply
                    // until the peer's reply has arrived,
                    // the acceptor replies right away
                    match self.role {
                        AssociationRole::Requestor => {
                            self.state =
                                AssociationState::ReleaseCollisionRequestorAwaitingRead;
                        }
                        AssociationRole::Acceptor => {
                            self.state =
                                AssociationState::ReleaseCollisionAcceptorAwaitingWrite;
                            self.send_impl(&Pdu::ReleaseRP)?;
                            self.state =
                                AssociationState::ReleaseCollisionAcceptorAwaitingRead;
                        }
                    }
                }
                (
                    Pdu::ReleaseRP,
                    AssociationState::ReleaseCollisionRequestorAwaitingRead,
                ) => {
                    self.state = AssociationState::ReleaseCollisionRequestorAwaitingWrite;
                    self.send_impl(&Pdu::ReleaseRP)?;
                    self.state = AssociationState::Terminating;
                    return Ok(());
                }
                (
                    Pdu::ReleaseRP,
                    AssociationState::ReleaseCollisionAcceptorAwaitingRead,
                ) => {
                    self.state = AssociationState::Terminating;
                    return Ok(());
                }
                (Pdu::PData { .. }, _) => {
                    // data arriving after the release request is discarded
                    warn!("discarding P-Data received during association release");
                }
                (Pdu::AbortRQ { source }, _) => {
                    warn!("association aborted by peer during release: {:?}", source);
                    self.state = AssociationState::Terminating;
                    return AssociationClosedSnafu.fail();
                }
                (pdu, _) => {
                    self.abort_impl(AbortRQSource::ServiceProvider(
                        AbortRQServiceProviderReason::UnexpectedPdu,
                    ));
                    return UnexpectedPduSnafu { pdu }.fail();
                }
            }
        }
    }

    /// Obtain access to the inner transport.
    ///
    /// Reading and writing should be done with care
    /// to avoid inconsistencies in the association state:
    /// do not use it outside of a PDU boundary.
    pub fn inner_stream(&mut self) -> &mut S {
        &mut self.socket
    }
}

/// Automatically release the association and shut down the transport.
impl<S: AssociationStream> Drop for Association<S> {
    fn drop(&mut self) {
        if self.state == AssociationState::Established {
            let _ = self.release_impl();
        }
        let _ = self.socket.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::{AssociationState, TimeoutOptions};
    use std::time::Duration;

    #[test]
    fn timeout_options_builder() {
        let opts = TimeoutOptions::new()
            .dimse_timeout(Some(Duration::from_secs(5)))
            .ac_timeout(None)
            .so_close_delay(Duration::from_millis(10));
        assert_eq!(opts.dimse_timeout, Some(Duration::from_secs(5)));
        assert_eq!(opts.ac_timeout, None);
        assert_eq!(opts.so_close_delay, Duration::from_millis(10));
        // untouched fields keep their defaults
        assert_eq!(opts.rq_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn states_are_comparable() {
        assert_ne!(
            AssociationState::Established,
            AssociationState::Terminating
        );
    }
}
