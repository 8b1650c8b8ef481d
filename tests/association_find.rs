use std::net::{SocketAddr, TcpListener};
use std::thread::{spawn, JoinHandle};

use bytes::Bytes;

use dicom_ulp::association::client::ClientAssociationOptions;
use dicom_ulp::association::negotiation::{AcceptorPolicy, AePolicy, AeSelector};
use dicom_ulp::association::server::ServerAssociationOptions;
use dicom_ulp::dimse::command::CommandSet;
use dicom_ulp::dimse::{
    Dispatcher, HandlerOutcome, Requestor, ResponseProducer, ServiceException, ServiceHandler,
    ServiceRegistry, DimseMessage, STATUS_CANCELED, STATUS_NO_SUCH_SOP_CLASS, STATUS_PENDING,
    STATUS_SUCCESS,
};

type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync + 'static>>;

static SCU_AE_TITLE: &str = "FIND-SCU";
static SCP_AE_TITLE: &str = "FIND-SCP";

static IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";
static STUDY_ROOT_FIND_SOP_CLASS: &str = "1.2.840.10008.5.1.4.1.2.2.1";
static MODALITY_WORKLIST_SOP_CLASS: &str = "1.2.840.10008.5.1.4.31";

/// Yields a fixed number of canned identifiers.
#[derive(Debug)]
struct CannedMatches {
    left: u32,
}

impl ResponseProducer for CannedMatches {
    fn next(&mut self) -> std::result::Result<Option<Bytes>, ServiceException> {
        if self.left == 0 {
            return Ok(None);
        }
        self.left -= 1;
        Ok(Some(Bytes::from_static(b"identifier data set\0")))
    }
}

/// Yields identifiers forever, only a cancellation can stop it.
#[derive(Debug)]
struct EndlessMatches;

impl ResponseProducer for EndlessMatches {
    fn next(&mut self) -> std::result::Result<Option<Bytes>, ServiceException> {
        Ok(Some(Bytes::from_static(b"identifier data set\0")))
    }
}

#[derive(Debug)]
struct FindHandler {
    matches: u32,
    endless: bool,
}

impl ServiceHandler for FindHandler {
    fn handle(
        &self,
        request: &DimseMessage,
    ) -> std::result::Result<HandlerOutcome, ServiceException> {
        // a C-FIND request must carry an identifier data set
        assert!(request.data.is_some());
        if self.endless {
            Ok(HandlerOutcome::Multiple(Box::new(EndlessMatches)))
        } else {
            Ok(HandlerOutcome::Multiple(Box::new(CannedMatches {
                left: self.matches,
            })))
        }
    }
}

fn spawn_find_scp(handler: FindHandler) -> Result<(JoinHandle<Result<()>>, SocketAddr)> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    let policy = AcceptorPolicy::new().with_rule(
        AeSelector::Called(SCP_AE_TITLE.to_string()),
        AePolicy::new()
            .with_abstract_syntax(STUDY_ROOT_FIND_SOP_CLASS, vec![IMPLICIT_VR_LE])
            .with_abstract_syntax(MODALITY_WORKLIST_SOP_CLASS, vec![IMPLICIT_VR_LE]),
    );
    let scp = ServerAssociationOptions::new(policy);

    let h = spawn(move || -> Result<()> {
        let (stream, _addr) = listener.accept()?;
        let mut association = scp.accept(stream)?.established()?;
        let dispatcher = Dispatcher::new(
            ServiceRegistry::new().with_handler(STUDY_ROOT_FIND_SOP_CLASS, handler),
        );
        dispatcher.run(&mut association)?;
        Ok(())
    });
    Ok((h, addr))
}

fn connect_find_scu(addr: SocketAddr) -> dicom_ulp::ClientAssociation {
    ClientAssociationOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .called_ae_title(SCP_AE_TITLE)
        .with_presentation_context(STUDY_ROOT_FIND_SOP_CLASS, vec![IMPLICIT_VR_LE])
        .with_presentation_context(MODALITY_WORKLIST_SOP_CLASS, vec![IMPLICIT_VR_LE])
        .connect(addr)
        .unwrap()
        .established()
        .unwrap()
}

/// A C-FIND with three matches produces three pending responses
/// followed by a successful final one.
#[test]
fn find_with_pending_responses() {
    let (scp_handle, scp_addr) = spawn_find_scp(FindHandler {
        matches: 3,
        endless: false,
    })
    .unwrap();

    let association = connect_find_scu(scp_addr);
    let pc_id = association
        .presentation_contexts()
        .iter()
        .find(|pc| pc.id == 1)
        .unwrap()
        .id;
    let mut requestor = Requestor::new(association).unwrap();

    let command = CommandSet::find_rq(0, STUDY_ROOT_FIND_SOP_CLASS, 0);
    let mut handle = requestor
        .invoke(pc_id, command, Some(Bytes::from_static(b"query keys\0\0")))
        .unwrap();

    let response = handle.get().unwrap();
    assert_eq!(response.command.status(), Some(STATUS_SUCCESS));
    assert!(response.data.is_none());

    let pending = handle.list_pending();
    assert_eq!(pending.len(), 3);
    for msg in pending {
        assert_eq!(msg.command.status(), Some(STATUS_PENDING));
        assert_eq!(
            msg.data.as_deref(),
            Some(&b"identifier data set\0"[..])
        );
    }

    drop(handle);
    drop(requestor);
    scp_handle.join().unwrap().unwrap();
}

/// A C-CANCEL stops an operation in progress,
/// and the provider acknowledges with a canceled status.
#[test]
fn find_cancel_stops_the_operation() {
    let (scp_handle, scp_addr) = spawn_find_scp(FindHandler {
        matches: 0,
        endless: true,
    })
    .unwrap();

    let association = connect_find_scu(scp_addr);
    let mut requestor = Requestor::new(association).unwrap();

    let command = CommandSet::find_rq(0, STUDY_ROOT_FIND_SOP_CLASS, 0);
    let mut handle = requestor
        .invoke(1, command, Some(Bytes::from_static(b"query keys\0\0")))
        .unwrap();

    handle.cancel().unwrap();

    let response = handle.get().unwrap();
    assert_eq!(response.command.status(), Some(STATUS_CANCELED));

    drop(handle);
    drop(requestor);
    scp_handle.join().unwrap().unwrap();
}

/// A request for a SOP class with no registered service
/// is answered with a no-such-SOP-class failure.
#[test]
fn unregistered_sop_class_fails_with_status() {
    let (scp_handle, scp_addr) = spawn_find_scp(FindHandler {
        matches: 1,
        endless: false,
    })
    .unwrap();

    let association = connect_find_scu(scp_addr);
    let mut requestor = Requestor::new(association).unwrap();

    // the worklist context was negotiated, but no service is bound to it
    let command = CommandSet::find_rq(0, MODALITY_WORKLIST_SOP_CLASS, 0);
    let mut handle = requestor
        .invoke(3, command, Some(Bytes::from_static(b"query keys\0\0")))
        .unwrap();

    let response = handle.get().unwrap();
    assert_eq!(response.command.status(), Some(STATUS_NO_SUCH_SOP_CLASS));

    drop(handle);
    drop(requestor);
    scp_handle.join().unwrap().unwrap();
}
