use std::net::{SocketAddr, TcpListener};
use std::thread::{spawn, JoinHandle};

use bytes::Bytes;

use dicom_ulp::association::client::ClientAssociationOptions;
use dicom_ulp::association::negotiation::{AcceptorPolicy, AePolicy, AeSelector};
use dicom_ulp::association::server::ServerAssociationOptions;
use dicom_ulp::dimse::command::{CommandSet, C_STORE_RQ, RSP_BIT};
use dicom_ulp::dimse::{
    DimseMessage, Dispatcher, HandlerOutcome, Requestor, ServiceException, ServiceHandler,
    ServiceRegistry, STATUS_SUCCESS,
};

type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync + 'static>>;

static SCU_AE_TITLE: &str = "STORE-SCU";
static SCP_AE_TITLE: &str = "STORE-SCP";

static IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";
static SC_STORAGE_SOP_CLASS: &str = "1.2.840.10008.5.1.4.1.1.7";

fn data_set(len: usize) -> Vec<u8> {
    (0..len).map(|x| (x % 251) as u8).collect()
}

/// Succeeds only when the stored data set
/// arrives byte for byte as one logical message.
#[derive(Debug)]
struct StoreHandler {
    expected: Vec<u8>,
}

impl ServiceHandler for StoreHandler {
    fn handle(
        &self,
        request: &DimseMessage,
    ) -> std::result::Result<HandlerOutcome, ServiceException> {
        if request.data.as_deref() == Some(&self.expected[..]) {
            Ok(HandlerOutcome::Single {
                status: STATUS_SUCCESS,
                data: None,
            })
        } else {
            Err(ServiceException::new(0xC001).with_comment("data set mismatch"))
        }
    }
}

fn spawn_store_scp(
    max_pdu_length: u32,
    expected: Vec<u8>,
) -> Result<(JoinHandle<Result<()>>, SocketAddr)> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    let policy = AcceptorPolicy::new().with_rule(
        AeSelector::Called(SCP_AE_TITLE.to_string()),
        AePolicy::new()
            .with_abstract_syntax(SC_STORAGE_SOP_CLASS, vec![IMPLICIT_VR_LE])
            .max_pdu_length(max_pdu_length),
    );
    let scp = ServerAssociationOptions::new(policy);

    let h = spawn(move || -> Result<()> {
        let (stream, _addr) = listener.accept()?;
        let mut association = scp.accept(stream)?.established()?;
        let dispatcher = Dispatcher::new(
            ServiceRegistry::new().with_handler(SC_STORAGE_SOP_CLASS, StoreHandler { expected }),
        );
        dispatcher.run(&mut association)?;
        Ok(())
    });
    Ok((h, addr))
}

/// A 1000-byte data set crosses an association
/// whose acceptor announced a maximum PDU length of 100:
/// the requestor splits it into eleven 94-byte fragments
/// and the provider reads it back as one message.
#[test]
fn store_data_set_through_tiny_max_pdu() {
    let payload = data_set(1000);
    let (scp_handle, scp_addr) = spawn_store_scp(100, payload.clone()).unwrap();

    let association = ClientAssociationOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .called_ae_title(SCP_AE_TITLE)
        .with_presentation_context(SC_STORAGE_SOP_CLASS, vec![IMPLICIT_VR_LE])
        .connect(scp_addr)
        .unwrap()
        .established()
        .unwrap();
    assert_eq!(association.peer_max_pdu_length(), 100);

    let pc_id = association.presentation_contexts()[0].id;
    let mut requestor = Requestor::new(association).unwrap();

    let command = CommandSet::store_rq(0, SC_STORAGE_SOP_CLASS, "2.25.915000100", 0);
    let mut handle = requestor
        .invoke(pc_id, command, Some(Bytes::from(payload)))
        .unwrap();
    let response = handle.get().unwrap();

    assert_eq!(response.command.command_field(), Some(C_STORE_RQ | RSP_BIT));
    assert_eq!(response.command.status(), Some(STATUS_SUCCESS));
    assert_eq!(response.command.error_comment(), None);

    drop(handle);
    drop(requestor);
    scp_handle.join().unwrap().unwrap();
}
