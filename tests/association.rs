use std::io::Write;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread::{spawn, JoinHandle};
use std::time::Duration;

use dicom_ulp::association::negotiation::{AcceptorPolicy, AePolicy, AeSelector};
use dicom_ulp::association::server::ServerAssociationOptions;
use dicom_ulp::association::{client::ClientAssociationOptions, ConnectOutcome, TimeoutOptions};
use dicom_ulp::pdu::{
    read_pdu, write_pdu, Pdu, PresentationContextResult, PresentationContextResultReason,
    MAXIMUM_PDU_SIZE,
};

type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync + 'static>>;

static SCU_AE_TITLE: &str = "ECHO-SCU";
static SCP_AE_TITLE: &str = "ECHO-SCP";

static IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";
static EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";
static JPEG_BASELINE: &str = "1.2.840.10008.1.2.4.50";
static VERIFICATION_SOP_CLASS: &str = "1.2.840.10008.1.1";
static DIGITAL_MG_STORAGE_SOP_CLASS: &str = "1.2.840.10008.5.1.4.1.1.1.2";

fn verification_policy() -> AcceptorPolicy {
    AcceptorPolicy::new().with_rule(
        AeSelector::Called(SCP_AE_TITLE.to_string()),
        AePolicy::new().with_abstract_syntax(
            VERIFICATION_SOP_CLASS,
            vec![IMPLICIT_VR_LE, EXPLICIT_VR_LE],
        ),
    )
}

fn spawn_scp() -> Result<(JoinHandle<Result<()>>, SocketAddr)> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    let scp = ServerAssociationOptions::new(verification_policy());

    let h = spawn(move || -> Result<()> {
        let (stream, _addr) = listener.accept()?;
        let mut association = scp.accept(stream)?.established()?;

        assert_eq!(
            association.presentation_contexts(),
            &[PresentationContextResult {
                id: 1,
                reason: PresentationContextResultReason::Acceptance,
                transfer_syntax: IMPLICIT_VR_LE.to_string(),
            }],
        );
        assert_eq!(association.peer_ae_title(), SCU_AE_TITLE);

        // handle one release request
        let pdu = association.receive()?;
        assert_eq!(pdu, Pdu::ReleaseRQ);
        association.send(&Pdu::ReleaseRP)?;

        Ok(())
    });
    Ok((h, addr))
}

/// Run an SCP and an SCU concurrently,
/// negotiate an association and release it.
#[test]
fn scu_scp_association_and_release() {
    let (scp_handle, scp_addr) = spawn_scp().unwrap();

    let association = ClientAssociationOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .called_ae_title(SCP_AE_TITLE)
        .with_presentation_context(
            VERIFICATION_SOP_CLASS,
            vec![IMPLICIT_VR_LE, EXPLICIT_VR_LE],
        )
        .connect(scp_addr)
        .unwrap()
        .established()
        .unwrap();

    association
        .release()
        .expect("did not have a peaceful release");

    scp_handle
        .join()
        .expect("SCP panicked")
        .expect("Error at the SCP");
}

/// An unknown abstract syntax is refused per presentation context,
/// leaving the rest of the association intact.
#[test]
fn unsupported_abstract_syntax_is_refused_per_context() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let scp = ServerAssociationOptions::new(verification_policy());

    let scp_handle = spawn(move || -> Result<()> {
        let (stream, _addr) = listener.accept()?;
        let mut association = scp.accept(stream)?.established()?;
        // only the verification context was accepted
        assert_eq!(association.presentation_contexts().len(), 1);
        assert_eq!(association.presentation_contexts()[0].id, 1);
        let pdu = association.receive()?;
        assert_eq!(pdu, Pdu::ReleaseRQ);
        association.send(&Pdu::ReleaseRP)?;
        Ok(())
    });

    let association = ClientAssociationOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .called_ae_title(SCP_AE_TITLE)
        .with_presentation_context(
            VERIFICATION_SOP_CLASS,
            vec![IMPLICIT_VR_LE, EXPLICIT_VR_LE],
        )
        .with_presentation_context(
            DIGITAL_MG_STORAGE_SOP_CLASS,
            vec![IMPLICIT_VR_LE, EXPLICIT_VR_LE, JPEG_BASELINE],
        )
        .connect(addr)
        .unwrap()
        .established()
        .unwrap();

    assert_eq!(association.presentation_contexts().len(), 1);

    association.release().unwrap();
    scp_handle.join().unwrap().unwrap();
}

/// A called AE title matching no policy rule
/// gets the association request rejected, not aborted.
#[test]
fn unknown_called_ae_title_is_rejected() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let scp = ServerAssociationOptions::new(verification_policy());

    let scp_handle = spawn(move || -> Result<()> {
        let (stream, _addr) = listener.accept()?;
        let outcome = scp.accept(stream)?;
        assert!(matches!(
            outcome,
            dicom_ulp::AcceptOutcome::Rejected(_)
        ));
        Ok(())
    });

    let outcome = ClientAssociationOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .called_ae_title("NOT-THIS-SCP")
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .connect(addr)
        .unwrap();

    assert!(matches!(outcome, ConnectOutcome::Rejected(_)));
    scp_handle.join().unwrap().unwrap();
}

/// Both peers requesting release at once still terminate in order:
/// the requestor holds its reply until the peer's reply has arrived.
#[test]
fn release_collision_terminates_cleanly() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    // a hand-driven peer forcing the collision
    let scp_handle = spawn(move || -> Result<()> {
        let (mut stream, _addr) = listener.accept()?;
        let rq = read_pdu(&mut stream, MAXIMUM_PDU_SIZE, true)?;
        let rq = match rq {
            Pdu::AssociationRQ(rq) => rq,
            other => panic!("unexpected PDU {:?}", other),
        };
        let mut buffer = Vec::new();
        write_pdu(
            &mut buffer,
            &Pdu::AssociationAC(dicom_ulp::pdu::AssociationAC {
                protocol_version: 1,
                calling_ae_title: rq.calling_ae_title,
                called_ae_title: rq.called_ae_title,
                application_context_name: rq.application_context_name,
                presentation_contexts: vec![PresentationContextResult {
                    id: 1,
                    reason: PresentationContextResultReason::Acceptance,
                    transfer_syntax: IMPLICIT_VR_LE.to_string(),
                }],
                user_variables: vec![],
            }),
        )?;
        stream.write_all(&buffer)?;

        // wait for the peer's release request,
        // then cross it with our own before replying
        assert_eq!(read_pdu(&mut stream, MAXIMUM_PDU_SIZE, true)?, Pdu::ReleaseRQ);
        buffer.clear();
        write_pdu(&mut buffer, &Pdu::ReleaseRQ)?;
        stream.write_all(&buffer)?;
        buffer.clear();
        write_pdu(&mut buffer, &Pdu::ReleaseRP)?;
        stream.write_all(&buffer)?;

        // the requestor sends its reply last
        assert_eq!(read_pdu(&mut stream, MAXIMUM_PDU_SIZE, true)?, Pdu::ReleaseRP);
        Ok(())
    });

    let association = ClientAssociationOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .connect(addr)
        .unwrap()
        .established()
        .unwrap();

    association.release().expect("release collision failed");
    scp_handle.join().unwrap().unwrap();
}

/// An acceptor which never replies to the association request
/// makes the requestor time out instead of hanging.
#[test]
fn association_response_timeout() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let scp_handle = spawn(move || -> Result<()> {
        let (stream, _addr) = listener.accept()?;
        // hold the connection open without answering
        std::thread::sleep(Duration::from_millis(500));
        drop(stream);
        Ok(())
    });

    let res = ClientAssociationOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .timeouts(TimeoutOptions::new().ac_timeout(Some(Duration::from_millis(100))))
        .connect(addr);

    assert!(matches!(
        res,
        Err(dicom_ulp::association::Error::Timeout { .. })
    ));
    scp_handle.join().unwrap().unwrap();
}

/// A malformed PDU after establishment
/// is answered with an abort before closing.
#[test]
fn malformed_pdu_is_aborted() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let scp = ServerAssociationOptions::new(verification_policy());

    let scp_handle = spawn(move || -> Result<()> {
        let (stream, _addr) = listener.accept()?;
        let mut association = scp.accept(stream)?.established()?;
        let res = association.read_message();
        assert!(res.is_err());
        Ok(())
    });

    let mut association = ClientAssociationOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .called_ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .connect(addr)
        .unwrap()
        .established()
        .unwrap();

    // an unassigned PDU type, straight onto the wire
    association
        .inner_stream()
        .write_all(&[0xFE, 0x00, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00])
        .unwrap();

    // the peer answers with an abort, which closes the association
    let res = association.read_message();
    assert!(matches!(
        res,
        Err(dicom_ulp::association::Error::AssociationClosed { .. })
    ));

    scp_handle.join().unwrap().unwrap();
}
