use std::net::{SocketAddr, TcpListener};
use std::thread::{spawn, JoinHandle};

use dicom_ulp::association::client::ClientAssociationOptions;
use dicom_ulp::association::negotiation::{AcceptorPolicy, AePolicy, AeSelector};
use dicom_ulp::association::server::ServerAssociationOptions;
use dicom_ulp::dimse::command::{CommandSet, C_ECHO_RQ, RSP_BIT};
use dicom_ulp::dimse::{Dispatcher, Requestor, ServiceRegistry, STATUS_SUCCESS};

type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync + 'static>>;

static SCU_AE_TITLE: &str = "ECHO-SCU";
static SCP_AE_TITLE: &str = "ECHO-SCP";

static IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";
static EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";
static VERIFICATION_SOP_CLASS: &str = "1.2.840.10008.1.1";

fn spawn_echo_scp() -> Result<(JoinHandle<Result<()>>, SocketAddr)> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    let policy = AcceptorPolicy::new().with_rule(
        AeSelector::Called(SCP_AE_TITLE.to_string()),
        AePolicy::new().with_abstract_syntax(
            VERIFICATION_SOP_CLASS,
            vec![IMPLICIT_VR_LE, EXPLICIT_VR_LE],
        ),
    );
    let scp = ServerAssociationOptions::new(policy);

    let h = spawn(move || -> Result<()> {
        let (stream, _addr) = listener.accept()?;
        let mut association = scp.accept(stream)?.established()?;
        let dispatcher = Dispatcher::new(ServiceRegistry::new().with_verification());
        dispatcher.run(&mut association)?;
        Ok(())
    });
    Ok((h, addr))
}

/// Verify a full C-ECHO round trip
/// between a requestor and a dispatching provider.
#[test]
fn scu_scp_echo() {
    let (scp_handle, scp_addr) = spawn_echo_scp().unwrap();

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

    let pc_id = association.presentation_contexts()[0].id;
    let mut requestor = Requestor::new(association).unwrap();

    let mut handle = requestor
        .invoke(pc_id, CommandSet::echo_rq(0), None)
        .unwrap();
    let response = handle.get().unwrap();

    assert_eq!(response.command.command_field(), Some(C_ECHO_RQ | RSP_BIT));
    assert_eq!(
        response.command.message_id_being_responded_to(),
        Some(handle.message_id())
    );
    assert_eq!(response.command.status(), Some(STATUS_SUCCESS));
    assert!(response.data.is_none());
    assert!(handle.list_pending().is_empty());

    // dropping the requestor closes the connection,
    // which ends the provider's dispatch loop
    drop(requestor);
    scp_handle
        .join()
        .expect("SCP panicked")
        .expect("Error at the SCP");
}

/// Several echo operations may be in flight at once,
/// each routed back to its own handle.
#[test]
fn multiple_echo_operations_in_flight() {
    let (scp_handle, scp_addr) = spawn_echo_scp().unwrap();

    let association = ClientAssociationOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .called_ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .connect(scp_addr)
        .unwrap()
        .established()
        .unwrap();

    let pc_id = association.presentation_contexts()[0].id;
    let mut requestor = Requestor::new(association).unwrap();

    let mut handles: Vec<_> = (0..3)
        .map(|_| {
            requestor
                .invoke(pc_id, CommandSet::echo_rq(0), None)
                .unwrap()
        })
        .collect();

    // message IDs are distinct and monotonic
    assert_eq!(handles[0].message_id(), 1);
    assert_eq!(handles[1].message_id(), 2);
    assert_eq!(handles[2].message_id(), 3);

    for handle in &mut handles {
        let response = handle.get().unwrap();
        assert_eq!(response.command.status(), Some(STATUS_SUCCESS));
        assert_eq!(
            response.command.message_id_being_responded_to(),
            Some(handle.message_id())
        );
    }

    drop(handles);
    drop(requestor);
    scp_handle.join().unwrap().unwrap();
}
