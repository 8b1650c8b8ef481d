//! Outbound DIMSE invocation.
//!
//! A [`Requestor`] takes over an established client association,
//! moving its reading half into a background thread.
//! Each call to [`invoke`](Requestor::invoke)
//! assigns a fresh message ID,
//! registers a pending exchange
//! and returns a [`ResponseHandle`]
//! through which the responses for that message ID are collected,
//! so that several service operations can be in flight at once.
use std::collections::HashMap;
use std::io::Write;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use bytes::Bytes;
use snafu::{OptionExt, ResultExt};
use tracing::{debug, warn};

use crate::association::pdata::fragment_message;
use crate::association::{Association, AssociationStream, ClientAssociation};
use crate::dimse::command::{self, CommandSet};
use crate::dimse::{
    is_pending, DimseMessage, EncodePduSnafu, ExchangeClosedSnafu, FragmentSnafu,
    MessageIdsExhaustedSnafu, Result, SplitStreamSnafu, WireSendSnafu,
};
use crate::pdu::write_pdu;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// The writing half of a split association.
///
/// Writers of one association serialize through a mutex around this value.
#[derive(Debug)]
struct MessageWriter {
    stream: TcpStream,
    peer_max_pdu_length: u32,
    pack_pdvs: bool,
    buffer: Vec<u8>,
}

impl MessageWriter {
    fn write(&mut self, msg: &DimseMessage) -> Result<()> {
        let command_bytes = msg.command.to_bytes();
        let pdus = fragment_message(
            msg.presentation_context_id,
            &command_bytes,
            msg.data.as_deref(),
            self.peer_max_pdu_length,
            self.pack_pdvs,
        )
        .context(FragmentSnafu)?;
        for pdu in &pdus {
            self.buffer.clear();
            write_pdu(&mut self.buffer, pdu).context(EncodePduSnafu)?;
            self.stream.write_all(&self.buffer).context(WireSendSnafu)?;
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Shared {
    writer: Mutex<MessageWriter>,
    pending: Mutex<HashMap<u16, Sender<DimseMessage>>>,
    closed: AtomicBool,
}

/// A service class user invoking operations
/// over an established association.
///
/// Message IDs are assigned monotonically and never reused;
/// running out of them fails the invocation.
/// Dropping the requestor shuts the connection down.
#[derive(Debug)]
pub struct Requestor {
    shared: Arc<Shared>,
    next_message_id: u16,
    reader: Option<JoinHandle<()>>,
}

impl Requestor {
    /// Take over the given association,
    /// spawning the background thread
    /// which routes inbound responses to their pending exchanges.
    pub fn new(association: ClientAssociation) -> Result<Self> {
        let mut core = association.into_inner();
        let stream =
            AssociationStream::try_clone(core.inner_stream()).context(SplitStreamSnafu)?;
        let shared = Arc::new(Shared {
            writer: Mutex::new(MessageWriter {
                stream,
                peer_max_pdu_length: core.peer_max_pdu_length(),
                pack_pdvs: core.pack_pdvs(),
                buffer: Vec::new(),
            }),
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });
        let reader_shared = Arc::clone(&shared);
        let reader = std::thread::spawn(move || run_reader(core, reader_shared));
        Ok(Requestor {
            shared,
            next_message_id: 1,
            reader: Some(reader),
        })
    }

    /// Whether the underlying association has closed.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Invoke a service operation:
    /// assign a message ID to the command,
    /// send the message
    /// and return the handle for its responses.
    pub fn invoke(
        &mut self,
        presentation_context_id: u8,
        mut command: CommandSet,
        data: Option<Bytes>,
    ) -> Result<ResponseHandle> {
        if self.is_closed() {
            return ExchangeClosedSnafu.fail();
        }
        let message_id = self.allocate_message_id()?;
        command.put_uint(command::MESSAGE_ID, message_id);

        let (sender, receiver) = channel();
        lock(&self.shared.pending).insert(message_id, sender);

        let msg = DimseMessage {
            presentation_context_id,
            command,
            data,
        };
        if let Err(e) = lock(&self.shared.writer).write(&msg) {
            lock(&self.shared.pending).remove(&message_id);
            return Err(e);
        }
        debug!("invoked operation with message id {}", message_id);
        Ok(ResponseHandle {
            shared: Arc::clone(&self.shared),
            presentation_context_id,
            message_id,
            receiver,
            pending_responses: Vec::new(),
        })
    }

    /// message IDs are never reused within one association
    fn allocate_message_id(&mut self) -> Result<u16> {
        let id = self.next_message_id;
        self.next_message_id = id.checked_add(1).context(MessageIdsExhaustedSnafu)?;
        Ok(id)
    }
}

impl Drop for Requestor {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        let _ = lock(&self.shared.writer)
            .stream
            .shutdown(std::net::Shutdown::Both);
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
    }
}

fn run_reader(mut core: Association<TcpStream>, shared: Arc<Shared>) {
    loop {
        let msg = match core.read_message() {
            Ok(msg) => msg,
            Err(e) => {
                debug!("response reader ending: {}", e);
                break;
            }
        };
        let message_id = match msg.command.message_id_being_responded_to() {
            Some(id) => id,
            None => {
                warn!("discarding response without a message id reference");
                continue;
            }
        };
        // a response without a status, or with a non-pending one,
        // concludes the exchange
        let terminal = msg
            .command
            .status()
            .map(|s| !is_pending(s))
            .unwrap_or(true);
        let mut pending = lock(&shared.pending);
        match pending.get(&message_id) {
            Some(sender) => {
                if sender.send(msg).is_err() || terminal {
                    pending.remove(&message_id);
                }
            }
            None => {
                warn!("discarding response for unknown message id {}", message_id);
            }
        }
    }
    shared.closed.store(true, Ordering::SeqCst);
    // dropping the senders unblocks every waiting handle
    lock(&shared.pending).clear();
}

/// The receiving end of one pending exchange.
///
/// Pending (intermediate) responses are collected as they arrive;
/// [`get`](Self::get) blocks until the terminal response.
#[derive(Debug)]
pub struct ResponseHandle {
    shared: Arc<Shared>,
    presentation_context_id: u8,
    message_id: u16,
    receiver: Receiver<DimseMessage>,
    pending_responses: Vec<DimseMessage>,
}

impl ResponseHandle {
    /// The message ID assigned to the invoked operation.
    pub fn message_id(&self) -> u16 {
        self.message_id
    }

    /// Block until the terminal response for this exchange arrives.
    ///
    /// Intermediate responses received in the meantime
    /// are queued and can be inspected through
    /// [`list_pending`](Self::list_pending).
    pub fn get(&mut self) -> Result<DimseMessage> {
        loop {
            match self.receiver.recv() {
                Ok(msg) => {
                    let pending = msg.command.status().map(is_pending).unwrap_or(false);
                    if pending {
                        self.pending_responses.push(msg);
                    } else {
                        return Ok(msg);
                    }
                }
                Err(_) => return ExchangeClosedSnafu.fail(),
            }
        }
    }

    /// The intermediate responses received so far, in arrival order.
    pub fn list_pending(&self) -> &[DimseMessage] {
        &self.pending_responses
    }

    /// Request the cancellation of this operation
    /// by sending a C-CANCEL referencing its message ID.
    ///
    /// The operation still runs until the peer
    /// acknowledges the cancellation with a terminal response.
    pub fn cancel(&self) -> Result<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return ExchangeClosedSnafu.fail();
        }
        let command = CommandSet::cancel_rq(self.message_id);
        lock(&self.shared.writer).write(&DimseMessage::command_only(
            self.presentation_context_id,
            command,
        ))
    }
}
