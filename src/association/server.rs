//! Association acceptor module
//!
//! The module provides an abstraction for a DICOM association
//! in which this application entity listens to incoming association requests.
//! See [`ServerAssociationOptions`]
//! for details and examples on how to accept an association.
use std::io::Write;
use std::net::TcpStream;

use snafu::ResultExt;
use tracing::info;

use crate::association::negotiation::{negotiate, AcceptorPolicy, NegotiationOutcome};
use crate::pdu::{
    read_pdu, write_pdu, AbortRQServiceProviderReason, AbortRQSource, AssociationRJ, Pdu,
    PresentationContextResult, UserVariableItem, MAXIMUM_PDU_SIZE,
};

use super::{
    reader_error_is_timeout, Association, AssociationRole, AssociationStream,
    InvalidFieldSnafu, MalformedPduSnafu, Result, SetTimeoutSnafu, TimeoutOptions, TimeoutPhase,
    TimeoutSnafu, UnexpectedPduSnafu, WireSendSnafu,
};

/// The outcome of answering an association request.
///
/// A rejection sent to the requestor is a normal protocol outcome,
/// not an error:
/// the rejection parameters are carried in the `Rejected` variant
/// after the rejection message has already been sent.
#[derive(Debug)]
pub enum AcceptOutcome {
    /// the association was accepted and is ready for data transfer
    Established(ServerAssociation),
    /// the association request was rejected,
    /// and the rejection was sent to the requestor
    Rejected(AssociationRJ),
}

impl AcceptOutcome {
    /// Unwrap the established association,
    /// turning a rejection into
    /// [`Error::AssociationClosed`](super::Error).
    pub fn established(self) -> Result<ServerAssociation> {
        match self {
            AcceptOutcome::Established(association) => Ok(association),
            AcceptOutcome::Rejected(_) => super::AssociationClosedSnafu.fail(),
        }
    }
}

/// A DICOM association builder for an acceptor node,
/// often taking the role of a service class provider (SCP).
///
/// This is the standard way of negotiating and establishing
/// an association with a requesting node.
/// The outcome is an [`AcceptOutcome`],
/// carrying a [`ServerAssociation`] on acceptance.
/// A value of this type can be reused for multiple connections.
///
/// All negotiation decisions are driven by an [`AcceptorPolicy`]:
/// an ordered rule list matching on AE titles,
/// where the first matching rule decides
/// the abstract syntaxes, transfer syntax preference,
/// roles and identity validation applied to the request.
///
/// # Example
///
/// ```no_run
/// # use std::net::TcpListener;
/// # use dicom_ulp::association::server::ServerAssociationOptions;
/// # use dicom_ulp::association::negotiation::{AcceptorPolicy, AePolicy, AeSelector};
/// # fn run() -> Result<(), Box<dyn std::error::Error>> {
/// # let tcp_listener: TcpListener = unimplemented!();
/// let policy = AcceptorPolicy::new().with_rule(
///     AeSelector::Any,
///     AePolicy::new()
///         .with_abstract_syntax("1.2.840.10008.1.1", vec!["1.2.840.10008.1.2.1"]),
/// );
/// let scp_options = ServerAssociationOptions::new(policy);
///
/// let (stream, _address) = tcp_listener.accept()?;
/// scp_options.accept(stream)?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ServerAssociationOptions {
    /// the negotiation rule list
    policy: AcceptorPolicy,
    /// whether to receive PDUs in strict mode
    strict: bool,
    /// whether multiple PDVs may share one outgoing PDU
    pack_pdvs: bool,
    /// the timeouts applied to blocking operations
    timeouts: TimeoutOptions,
}

impl ServerAssociationOptions {
    /// Create a new set of options
    /// around the given negotiation policy.
    pub fn new(policy: AcceptorPolicy) -> Self {
        ServerAssociationOptions {
            policy,
            strict: true,
            pack_pdvs: false,
            timeouts: TimeoutOptions::default(),
        }
    }

    /// Override strict mode:
    /// whether receiving PDUs must not
    /// surpass the negotiated maximum PDU length.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Allow outgoing presentation data values
    /// to share the trailing space of a PDU.
    pub fn pack_pdvs(mut self, pack_pdvs: bool) -> Self {
        self.pack_pdvs = pack_pdvs;
        self
    }

    /// Override the timeouts applied to the blocking operations
    /// of the association.
    pub fn timeouts(mut self, timeouts: TimeoutOptions) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Negotiate an association with the given TCP stream.
    pub fn accept(&self, mut socket: TcpStream) -> Result<AcceptOutcome> {
        // await the association request
        AssociationStream::set_read_timeout(&socket, self.timeouts.rq_timeout)
            .context(SetTimeoutSnafu)?;
        let msg = match read_pdu(&mut socket, MAXIMUM_PDU_SIZE, self.strict) {
            Ok(pdu) => pdu,
            Err(e) if reader_error_is_timeout(&e) => {
                abort_and_close(&mut socket, AbortRQServiceProviderReason::ReasonNotSpecified);
                return TimeoutSnafu {
                    phase: TimeoutPhase::AssociationRq,
                }
                .fail();
            }
            Err(e) => {
                abort_and_close(&mut socket, AbortRQServiceProviderReason::InvalidPduParameter);
                return Err(e).context(MalformedPduSnafu);
            }
        };

        let rq = match msg {
            Pdu::AssociationRQ(rq) => rq,
            Pdu::ReleaseRQ => {
                let mut buffer = Vec::with_capacity(16);
                if write_pdu(&mut buffer, &Pdu::ReleaseRP).is_ok() {
                    let _ = socket.write_all(&buffer);
                }
                let _ = AssociationStream::shutdown(&socket);
                return super::AssociationClosedSnafu.fail();
            }
            pdu @ Pdu::Unknown { .. } => {
                abort_and_close(&mut socket, AbortRQServiceProviderReason::UnrecognizedPdu);
                return UnexpectedPduSnafu { pdu }.fail();
            }
            pdu => {
                abort_and_close(&mut socket, AbortRQServiceProviderReason::UnexpectedPdu);
                return UnexpectedPduSnafu { pdu }.fail();
            }
        };

        let mut buffer: Vec<u8> = Vec::with_capacity(4096);
        match negotiate(&rq, &self.policy) {
            NegotiationOutcome::Accepted { ac, negotiated } => {
                write_pdu(&mut buffer, &Pdu::AssociationAC(ac)).context(InvalidFieldSnafu)?;
                socket.write_all(&buffer).context(WireSendSnafu)?;
                info!(
                    "association with {} established with {} presentation contexts",
                    negotiated.peer_ae_title,
                    negotiated.presentation_contexts.len()
                );
                let inner = Association::new(
                    socket,
                    AssociationRole::Acceptor,
                    negotiated.presentation_contexts,
                    negotiated.peer_max_pdu_length,
                    negotiated.max_pdu_length,
                    self.timeouts.clone(),
                    self.strict,
                    self.pack_pdvs,
                );
                Ok(AcceptOutcome::Established(ServerAssociation {
                    inner,
                    peer_ae_title: negotiated.peer_ae_title,
                    peer_user_variables: negotiated.peer_user_variables,
                }))
            }
            NegotiationOutcome::Rejected(rj) => {
                write_pdu(&mut buffer, &Pdu::AssociationRJ(rj.clone()))
                    .context(InvalidFieldSnafu)?;
                socket.write_all(&buffer).context(WireSendSnafu)?;
                let _ = AssociationStream::shutdown(&socket);
                info!("association request rejected: {}", rj.source);
                Ok(AcceptOutcome::Rejected(rj))
            }
        }
    }
}

fn abort_and_close(socket: &mut TcpStream, reason: AbortRQServiceProviderReason) {
    let mut buffer = Vec::with_capacity(16);
    if write_pdu(
        &mut buffer,
        &Pdu::AbortRQ {
            source: AbortRQSource::ServiceProvider(reason),
        },
    )
    .is_ok()
    {
        let _ = socket.write_all(&buffer);
    }
    let _ = AssociationStream::shutdown(socket);
}

/// A DICOM upper layer association from the perspective
/// of an accepting application entity.
///
/// The most common operations of an established association are
/// [`read_message`](Self::read_message)
/// and [`write_message`](Self::write_message),
/// which exchange whole DIMSE messages.
///
/// When the value falls out of scope,
/// the program will automatically try to gracefully release the association,
/// then shut down the underlying TCP connection.
#[derive(Debug)]
pub struct ServerAssociation {
    /// the common association core
    inner: Association<TcpStream>,
    /// the application entity title of the requestor
    peer_ae_title: String,
    /// the user variables received from the requestor
    peer_user_variables: Vec<UserVariableItem>,
}

impl ServerAssociation {
    /// Obtain a view of the negotiated presentation contexts.
    pub fn presentation_contexts(&self) -> &[PresentationContextResult] {
        self.inner.presentation_contexts()
    }

    /// Retrieve the maximum PDU length admitted by the requestor.
    pub fn peer_max_pdu_length(&self) -> u32 {
        self.inner.peer_max_pdu_length()
    }

    /// Obtain the remote DICOM node's application entity title.
    pub fn peer_ae_title(&self) -> &str {
        &self.peer_ae_title
    }

    /// Obtain a view of the user variables
    /// received in the association request.
    pub fn peer_user_variables(&self) -> &[UserVariableItem] {
        &self.peer_user_variables
    }

    /// Send a PDU message to the requestor.
    pub fn send(&mut self, msg: &Pdu) -> Result<()> {
        self.inner.send(msg)
    }

    /// Read a PDU message from the requestor.
    pub fn receive(&mut self) -> Result<Pdu> {
        self.inner.receive()
    }

    /// Send one whole DIMSE message.
    pub fn write_message(&mut self, msg: &crate::dimse::DimseMessage) -> Result<()> {
        self.inner.write_message(msg)
    }

    /// Block until one whole DIMSE message has been received.
    pub fn read_message(&mut self) -> Result<crate::dimse::DimseMessage> {
        self.inner.read_message()
    }

    /// Gracefully terminate the association
    /// by exchanging release messages,
    /// then shut down the TCP connection.
    pub fn release(self) -> Result<()> {
        self.inner.release()
    }

    /// Send an abort message and shut down the TCP connection,
    /// terminating the association.
    pub fn abort(self) -> Result<()> {
        self.inner.abort()
    }

    /// Obtain access to the inner TCP stream
    /// for reading and writing outside of a PDU boundary.
    pub fn inner_stream(&mut self) -> &mut TcpStream {
        self.inner.inner_stream()
    }

    /// Decompose the wrapper into the common association core.
    ///
    /// The core keeps the release-on-drop duty.
    pub fn into_inner(self) -> Association<TcpStream> {
        self.inner
    }
}
