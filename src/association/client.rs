//! Association requester module
//!
//! The module provides an abstraction for a DICOM association
//! in which this application entity is the one requesting the association.
//! See [`ClientAssociationOptions`](self::ClientAssociationOptions)
//! for details and examples on how to create an association.
use std::{
    borrow::Cow,
    convert::TryInto,
    io::Write,
    net::{TcpStream, ToSocketAddrs},
};

use snafu::{ensure, ResultExt};
use tracing::{info, warn};

use crate::{
    pdu::{
        read_pdu, write_pdu, AbortRQServiceProviderReason, AbortRQSource, AssociationAC,
        AssociationRJ, AssociationRQ, Pdu, PresentationContextProposed,
        PresentationContextResult, PresentationContextResultReason, RoleSelection, UserIdentity,
        UserVariableItem, DEFAULT_MAX_PDU, MAXIMUM_PDU_SIZE,
    },
    AeAddr, IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME,
};

use super::{
    reader_error_is_timeout, uid::trim_uid, Association, AssociationRole, AssociationStream,
    ConnectSnafu, InvalidFieldSnafu, MalformedPduSnafu, MissingAbstractSyntaxSnafu,
    NoAcceptedPresentationContextsSnafu, ProtocolVersionMismatchSnafu, Result, SetTimeoutSnafu,
    TimeoutOptions, TimeoutPhase, TimeoutSnafu, TooManyPresentationContextsSnafu,
    UnexpectedPduSnafu, WireSendSnafu,
};

/// The outcome of requesting an association.
///
/// A rejection by the acceptor is a normal protocol outcome,
/// not an error:
/// the rejection parameters are carried in the `Rejected` variant.
#[derive(Debug)]
pub enum ConnectOutcome {
    /// the association was accepted and is ready for data transfer
    Established(ClientAssociation),
    /// the association was rejected by the acceptor
    Rejected(AssociationRJ),
}

impl ConnectOutcome {
    /// Unwrap the established association,
    /// turning a rejection into
    /// [`Error::AssociationClosed`](super::Error).
    pub fn established(self) -> Result<ClientAssociation> {
        match self {
            ConnectOutcome::Established(association) => Ok(association),
            ConnectOutcome::Rejected(rj) => {
                warn!("association rejected: {}", rj.source);
                super::AssociationClosedSnafu.fail()
            }
        }
    }
}

/// A DICOM association builder for a requestor node.
/// The final outcome is a [`ConnectOutcome`],
/// carrying a [`ClientAssociation`] on acceptance.
///
/// This is the standard way of requesting and establishing
/// an association with another DICOM node,
/// that one usually taking the role of a service class provider (SCP).
///
/// # Example
///
/// ```no_run
/// # use dicom_ulp::association::client::ClientAssociationOptions;
/// # fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let association = ClientAssociationOptions::new()
///    .with_presentation_context("1.2.840.10008.1.1", vec!["1.2.840.10008.1.2.1", "1.2.840.10008.1.2"])
///    .connect("129.168.0.5:104")?
///    .established()?;
/// # Ok(())
/// # }
/// ```
///
/// At least one presentation context must be specified,
/// using the method [`with_presentation_context`](Self::with_presentation_context)
/// and supplying both an abstract syntax and list of transfer syntaxes.
///
/// A helper method [`with_abstract_syntax`](Self::with_abstract_syntax) will
/// include by default the transfer syntaxes
/// _Implicit VR Little Endian_ and _Explicit VR Little Endian_
/// in the resulting presentation context.
#[derive(Debug, Clone)]
pub struct ClientAssociationOptions<'a> {
    /// the calling AE title
    calling_ae_title: Cow<'a, str>,
    /// the called AE title
    called_ae_title: Option<Cow<'a, str>>,
    /// the requested application context name
    application_context_name: Cow<'a, str>,
    /// the list of requested presentation contexts
    presentation_contexts: Vec<(Cow<'a, str>, Vec<Cow<'a, str>>)>,
    /// the user identity to negotiate with
    user_identity: Option<UserIdentity>,
    /// role selections to propose, per SOP class
    role_selections: Vec<RoleSelection>,
    /// the expected protocol version
    protocol_version: u16,
    /// the maximum PDU length requested for receiving PDUs
    max_pdu_length: u32,
    /// whether to receive PDUs in strict mode
    strict: bool,
    /// whether multiple PDVs may share one outgoing PDU
    pack_pdvs: bool,
    /// the timeouts applied to blocking operations
    timeouts: TimeoutOptions,
}

impl Default for ClientAssociationOptions<'_> {
    fn default() -> Self {
        ClientAssociationOptions {
            calling_ae_title: "THIS-SCU".into(),
            called_ae_title: None,
            application_context_name: "1.2.840.10008.3.1.1.1".into(),
            presentation_contexts: Vec::new(),
            user_identity: None,
            role_selections: Vec::new(),
            protocol_version: 1,
            max_pdu_length: DEFAULT_MAX_PDU,
            strict: true,
            pack_pdvs: false,
            timeouts: TimeoutOptions::default(),
        }
    }
}

impl<'a> ClientAssociationOptions<'a> {
    /// Create a new set of options for establishing an association.
    pub fn new() -> Self {
        Self::default()
    }

    /// Define the calling application entity title for the association,
    /// which refers to this DICOM node.
    ///
    /// The default is `THIS-SCU`.
    pub fn calling_ae_title<T>(mut self, calling_ae_title: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.calling_ae_title = calling_ae_title.into();
        self
    }

    /// Define the called application entity title for the association,
    /// which refers to the target DICOM node.
    ///
    /// The default is `ANY-SCP`.
    /// Passing an empty string resets the AE title to the default
    /// (or to the one passed via [`connect_with`](Self::connect_with)).
    pub fn called_ae_title<T>(mut self, called_ae_title: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        let cae = called_ae_title.into();
        if cae.is_empty() {
            self.called_ae_title = None;
        } else {
            self.called_ae_title = Some(cae);
        }
        self
    }

    /// Include this presentation context
    /// in the list of proposed presentation contexts.
    pub fn with_presentation_context<T>(
        mut self,
        abstract_syntax_uid: T,
        transfer_syntax_uids: Vec<T>,
    ) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        let transfer_syntaxes: Vec<Cow<'a, str>> = transfer_syntax_uids
            .into_iter()
            .map(|t| trim_uid(t.into()))
            .collect();
        self.presentation_contexts
            .push((trim_uid(abstract_syntax_uid.into()), transfer_syntaxes));
        self
    }

    /// Helper to add this abstract syntax
    /// with the default transfer syntaxes
    /// to the list of proposed presentation contexts.
    pub fn with_abstract_syntax<T>(self, abstract_syntax_uid: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        let default_transfer_syntaxes: Vec<Cow<'a, str>> =
            vec!["1.2.840.10008.1.2.1".into(), "1.2.840.10008.1.2".into()];
        self.with_presentation_context(abstract_syntax_uid.into(), default_transfer_syntaxes)
    }

    /// Negotiate a user identity with the acceptor.
    pub fn with_user_identity(mut self, identity: UserIdentity) -> Self {
        self.user_identity = Some(identity);
        self
    }

    /// Propose a role selection for a SOP class.
    /// Proposing the same SOP class again replaces the previous roles.
    pub fn with_role_selection(mut self, role: RoleSelection) -> Self {
        let uid = role.sop_class_uid.clone();
        self.role_selections.retain(|r| r.sop_class_uid != uid);
        self.role_selections.push(role);
        self
    }

    /// Override the maximum PDU length
    /// that this application entity will admit.
    pub fn max_pdu_length(mut self, value: u32) -> Self {
        self.max_pdu_length = value;
        self
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

    /// Initiate the TCP connection to the given address
    /// and request a new DICOM association,
    /// negotiating the presentation contexts in the process.
    pub fn connect<A: ToSocketAddrs>(self, address: A) -> Result<ConnectOutcome> {
        self.connect_impl(AeAddr::new_socket_addr(address))
    }

    /// Initiate the TCP connection to the given address
    /// and request a new DICOM association,
    /// negotiating the presentation contexts in the process.
    ///
    /// This method allows you to specify the called AE title
    /// alongside with the socket address.
    /// See [AeAddr](`crate::AeAddr`) for more details.
    /// However, the AE title in this parameter
    /// is overridden by any `called_ae_title` option
    /// previously received.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # use dicom_ulp::association::client::ClientAssociationOptions;
    /// # fn run() -> Result<(), Box<dyn std::error::Error>> {
    /// let association = ClientAssociationOptions::new()
    ///     .with_abstract_syntax("1.2.840.10008.1.1")
    ///     // called AE title in address
    ///     .connect_with("MY-STORAGE@10.0.0.100:104")?
    ///     .established()?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn connect_with(self, ae_address: &str) -> Result<ConnectOutcome> {
        match ae_address.try_into() {
            Ok(ae_address) => self.connect_impl(ae_address),
            Err(_) => self.connect_impl(AeAddr::new_socket_addr(ae_address)),
        }
    }

    fn connect_impl<T>(self, ae_address: AeAddr<T>) -> Result<ConnectOutcome>
    where
        T: ToSocketAddrs,
    {
        let ClientAssociationOptions {
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            user_identity,
            role_selections,
            protocol_version,
            max_pdu_length,
            strict,
            pack_pdvs,
            timeouts,
        } = self;

        // presentation contexts represent intent,
        // they must not be omitted by the user
        ensure!(
            !presentation_contexts.is_empty(),
            MissingAbstractSyntaxSnafu
        );
        // context identifiers are odd 8-bit values,
        // which only fit 128 proposals
        ensure!(
            presentation_contexts.len() <= 128,
            TooManyPresentationContextsSnafu {
                count: presentation_contexts.len(),
            }
        );

        // the explicit option takes precedence over the AE title
        // embedded in the address
        let called_ae_title: &str = match (&called_ae_title, ae_address.ae_title()) {
            (Some(aec), Some(_)) => {
                warn!("called AE title overridden by option to `{}`", aec);
                aec
            }
            (Some(aec), None) => aec,
            (None, Some(aec)) => aec,
            (None, None) => "ANY-SCP",
        };

        let presentation_contexts: Vec<_> = presentation_contexts
            .into_iter()
            .enumerate()
            .map(|(i, presentation_context)| PresentationContextProposed {
                // sequential odd identifiers
                id: (i * 2 + 1) as u8,
                abstract_syntax: presentation_context.0.to_string(),
                transfer_syntaxes: presentation_context
                    .1
                    .iter()
                    .map(|uid| uid.to_string())
                    .collect(),
            })
            .collect();

        let mut user_variables = vec![
            UserVariableItem::MaxLength(max_pdu_length),
            UserVariableItem::ImplementationClassUID(IMPLEMENTATION_CLASS_UID.to_string()),
            UserVariableItem::ImplementationVersionName(IMPLEMENTATION_VERSION_NAME.to_string()),
        ];
        for role in role_selections {
            user_variables.push(UserVariableItem::RoleSelection(role));
        }
        if let Some(identity) = user_identity {
            user_variables.push(UserVariableItem::UserIdentityItem(identity));
        }

        let msg = Pdu::AssociationRQ(AssociationRQ {
            protocol_version,
            calling_ae_title: calling_ae_title.to_string(),
            called_ae_title: called_ae_title.to_string(),
            application_context_name: application_context_name.to_string(),
            presentation_contexts,
            user_variables,
        });

        let mut socket = TcpStream::connect(ae_address).context(ConnectSnafu)?;
        let mut buffer: Vec<u8> = Vec::with_capacity(max_pdu_length as usize);
        write_pdu(&mut buffer, &msg).context(InvalidFieldSnafu)?;
        socket.write_all(&buffer).context(WireSendSnafu)?;
        buffer.clear();

        // receive response within the association response timeout
        AssociationStream::set_read_timeout(&socket, timeouts.ac_timeout)
            .context(SetTimeoutSnafu)?;
        let msg = match read_pdu(&mut socket, MAXIMUM_PDU_SIZE, strict) {
            Ok(pdu) => pdu,
            Err(e) if reader_error_is_timeout(&e) => {
                abort_and_close(&mut socket, AbortRQServiceProviderReason::ReasonNotSpecified);
                return TimeoutSnafu {
                    phase: TimeoutPhase::AssociationAc,
                }
                .fail();
            }
            Err(e) => {
                abort_and_close(&mut socket, AbortRQServiceProviderReason::InvalidPduParameter);
                return Err(e).context(MalformedPduSnafu);
            }
        };

        match msg {
            Pdu::AssociationAC(AssociationAC {
                protocol_version: protocol_version_scp,
                application_context_name: _,
                presentation_contexts: presentation_contexts_scp,
                calling_ae_title: _,
                called_ae_title: _,
                user_variables,
            }) => {
                if protocol_version != protocol_version_scp {
                    abort_and_close(
                        &mut socket,
                        AbortRQServiceProviderReason::UnexpectedPduParameter,
                    );
                    return ProtocolVersionMismatchSnafu {
                        expected: protocol_version,
                        got: protocol_version_scp,
                    }
                    .fail();
                }

                let acceptor_max_pdu_length = user_variables
                    .iter()
                    .find_map(|item| match item {
                        UserVariableItem::MaxLength(len) => Some(*len),
                        _ => None,
                    })
                    .unwrap_or(DEFAULT_MAX_PDU);
                // a declared maximum of 0 means no maximum stated
                let acceptor_max_pdu_length = if acceptor_max_pdu_length == 0 {
                    MAXIMUM_PDU_SIZE
                } else {
                    acceptor_max_pdu_length
                };

                let accepted: Vec<PresentationContextResult> = presentation_contexts_scp
                    .into_iter()
                    .filter(|c| c.reason == PresentationContextResultReason::Acceptance)
                    .collect();
                // an acknowledgement with nothing accepted
                // leaves nothing to talk about
                if accepted.is_empty() {
                    abort_and_close(
                        &mut socket,
                        AbortRQServiceProviderReason::ReasonNotSpecified,
                    );
                    return NoAcceptedPresentationContextsSnafu.fail();
                }

                info!(
                    "association established with {} presentation contexts",
                    accepted.len()
                );
                let inner = Association::new(
                    socket,
                    AssociationRole::Requestor,
                    accepted,
                    acceptor_max_pdu_length,
                    max_pdu_length,
                    timeouts,
                    strict,
                    pack_pdvs,
                );
                Ok(ConnectOutcome::Established(ClientAssociation {
                    inner,
                    peer_user_variables: user_variables,
                }))
            }
            Pdu::AssociationRJ(rj) => {
                let _ = AssociationStream::shutdown(&socket);
                Ok(ConnectOutcome::Rejected(rj))
            }
            pdu @ Pdu::Unknown { .. } => {
                abort_and_close(&mut socket, AbortRQServiceProviderReason::UnrecognizedPdu);
                UnexpectedPduSnafu { pdu }.fail()
            }
            pdu => {
                abort_and_close(&mut socket, AbortRQServiceProviderReason::UnexpectedPdu);
                UnexpectedPduSnafu { pdu }.fail()
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
/// of a requesting application entity.
///
/// The most common operations of an established association are
/// [`write_message`](Self::write_message)
/// and [`read_message`](Self::read_message),
/// which exchange whole DIMSE messages.
///
/// When the value falls out of scope,
/// the program will automatically try to gracefully release the association
/// through a standard C-RELEASE message exchange,
/// then shut down the underlying TCP connection.
#[derive(Debug)]
pub struct ClientAssociation {
    /// the common association core
    inner: Association<TcpStream>,
    /// the user variables received in the acknowledgement
    peer_user_variables: Vec<UserVariableItem>,
}

impl ClientAssociation {
    /// Obtain a view of the negotiated presentation contexts.
    pub fn presentation_contexts(&self) -> &[PresentationContextResult] {
        self.inner.presentation_contexts()
    }

    /// Retrieve the maximum PDU length admitted by the acceptor.
    pub fn peer_max_pdu_length(&self) -> u32 {
        self.inner.peer_max_pdu_length()
    }

    /// Obtain a view of the user variables
    /// received in the association acknowledgement.
    pub fn peer_user_variables(&self) -> &[UserVariableItem] {
        &self.peer_user_variables
    }

    /// Send a PDU message to the acceptor.
    pub fn send(&mut self, msg: &Pdu) -> Result<()> {
        self.inner.send(msg)
    }

    /// Read a PDU message from the acceptor.
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

#[cfg(test)]
mod tests {
    use super::ClientAssociationOptions;
    use crate::association::Error;
    use matches::assert_matches;

    #[test]
    fn connect_without_presentation_contexts_is_an_error() {
        let res = ClientAssociationOptions::new().connect("127.0.0.1:11111");
        assert_matches!(res, Err(Error::MissingAbstractSyntax { .. }));
    }

    #[test]
    fn more_contexts_than_odd_identifiers_is_an_error() {
        // odd 8-bit identifiers only accommodate 128 proposals
        let mut options = ClientAssociationOptions::new();
        for i in 0..129 {
            options = options.with_abstract_syntax(format!("1.2.840.10008.5.1.4.1.1.{}", i));
        }
        let res = options.connect("127.0.0.1:11111");
        assert_matches!(
            res,
            Err(Error::TooManyPresentationContexts { count: 129, .. })
        );
    }

    #[test]
    fn proposed_context_ids_are_sequential_odd_numbers() {
        // the id assignment is an establishment detail,
        // checked indirectly through the builder state
        let options = ClientAssociationOptions::new()
            .with_abstract_syntax("1.2.840.10008.1.1")
            .with_abstract_syntax("1.2.840.10008.5.1.4.1.1.7");
        assert_eq!(options.presentation_contexts.len(), 2);
    }
}
