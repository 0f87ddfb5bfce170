//! Direct-message channel between a client and a server endpoint.
//!
//! Two rendezvous channels (capacity 0) carry `FFA_MSG_SEND_DIRECT_REQ`
//! one way and `FFA_MSG_SEND_DIRECT_RESP` the other. A send completes only
//! when the peer receives, so the two endpoints strictly alternate: the
//! client blocks from request until response, the server blocks from
//! response until the next request.

use std::sync::mpsc::{sync_channel, Receiver, SyncSender};

use log::debug;
use thiserror::Error;

use super::*;

/// w3..w7 of a direct message.
pub type DirectPayload = [u64; 5];

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    #[error("peer endpoint disconnected")]
    Disconnected,
    #[error("expected {}, got {}", fid_name(*.expected), fid_name(*.got))]
    Protocol { expected: u64, got: u64 },
    #[error("direct message routed as {0:#x}")]
    Misrouted(u64),
    #[error("direct response with no request pending")]
    NoPendingRequest,
    #[error("waiting for a request while one is still pending")]
    OutOfTurn,
}

fn to_args(fid: u64, from: EndpointId, to: EndpointId, data: DirectPayload) -> FfaArgs {
    FfaArgs {
        fid,
        arg1: pack_endpoints(from, to),
        arg2: 0,
        arg3: data[0],
        arg4: data[1],
        arg5: data[2],
        arg6: data[3],
        arg7: data[4],
    }
}

fn payload(args: &FfaArgs) -> DirectPayload {
    [args.arg3, args.arg4, args.arg5, args.arg6, args.arg7]
}

/// Create the two ends of a channel between `client` and `server`.
pub fn direct_channel(client: EndpointId, server: EndpointId) -> (ClientPort, ServerPort) {
    let (req_tx, req_rx) = sync_channel(0);
    let (resp_tx, resp_rx) = sync_channel(0);
    (
        ClientPort {
            id: client,
            peer: server,
            requests: req_tx,
            responses: resp_rx,
        },
        ServerPort {
            id: server,
            peer: client,
            requests: req_rx,
            responses: resp_tx,
            pending: false,
        },
    )
}

pub struct ClientPort {
    id: EndpointId,
    peer: EndpointId,
    requests: SyncSender<FfaArgs>,
    responses: Receiver<FfaArgs>,
}

impl ClientPort {
    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn peer(&self) -> EndpointId {
        self.peer
    }

    /// Send a direct request and block until the server responds.
    pub fn send_direct_req(&self, data: DirectPayload) -> Result<DirectPayload, ChannelError> {
        let req = to_args(FFA_MSG_SEND_DIRECT_REQ_32, self.id, self.peer, data);
        debug!("[{:#06x}] direct req -> {:#06x} {:x?}", self.id, self.peer, data);
        self.requests
            .send(req)
            .map_err(|_| ChannelError::Disconnected)?;
        let resp = self
            .responses
            .recv()
            .map_err(|_| ChannelError::Disconnected)?;

        if resp.fid != FFA_MSG_SEND_DIRECT_RESP_32 {
            return Err(ChannelError::Protocol {
                expected: FFA_MSG_SEND_DIRECT_RESP_32,
                got: resp.fid,
            });
        }
        if resp.arg1 != pack_endpoints(self.peer, self.id) {
            return Err(ChannelError::Misrouted(resp.arg1));
        }
        Ok(payload(&resp))
    }
}

pub struct ServerPort {
    id: EndpointId,
    peer: EndpointId,
    requests: Receiver<FfaArgs>,
    responses: SyncSender<FfaArgs>,
    pending: bool,
}

impl ServerPort {
    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn peer(&self) -> EndpointId {
        self.peer
    }

    /// A request has been received and not answered yet.
    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// Block until the client sends a direct request.
    pub fn wait_direct_req(&mut self) -> Result<DirectPayload, ChannelError> {
        if self.pending {
            return Err(ChannelError::OutOfTurn);
        }
        let req = self
            .requests
            .recv()
            .map_err(|_| ChannelError::Disconnected)?;

        if req.fid != FFA_MSG_SEND_DIRECT_REQ_32 {
            return Err(ChannelError::Protocol {
                expected: FFA_MSG_SEND_DIRECT_REQ_32,
                got: req.fid,
            });
        }
        if req.arg1 != pack_endpoints(self.peer, self.id) {
            return Err(ChannelError::Misrouted(req.arg1));
        }
        self.pending = true;
        Ok(payload(&req))
    }

    /// Answer the pending request, unblocking the client.
    pub fn send_direct_resp(&mut self, data: DirectPayload) -> Result<(), ChannelError> {
        self.respond_raw(to_args(FFA_MSG_SEND_DIRECT_RESP_32, self.id, self.peer, data))
    }

    /// Answer the pending request and wait for the next one.
    pub fn respond_and_wait(&mut self, data: DirectPayload) -> Result<DirectPayload, ChannelError> {
        self.send_direct_resp(data)?;
        self.wait_direct_req()
    }

    /// Answer the pending request with an arbitrary payload.
    pub fn respond_raw(&mut self, args: FfaArgs) -> Result<(), ChannelError> {
        if !self.pending {
            return Err(ChannelError::NoPendingRequest);
        }
        debug!("[{:#06x}] direct resp -> {:#06x} {}", self.id, self.peer, fid_name(args.fid));
        self.pending = false;
        self.responses
            .send(args)
            .map_err(|_| ChannelError::Disconnected)
    }
}

/// Handle handoff carried in a direct message: the handle, the tag it was
/// issued under and the ABI the peer should use for its next call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handoff {
    pub handle: Handle,
    pub tag: u64,
    pub fid: u64,
}

impl Handoff {
    pub fn new(handle: Handle, tag: u64, fid: u64) -> Self {
        Self { handle, tag, fid }
    }

    pub fn to_payload(self) -> DirectPayload {
        [self.handle.0, self.tag, self.fid, 0, 0]
    }

    pub fn from_payload(data: DirectPayload) -> Self {
        Self {
            handle: Handle(data[0]),
            tag: data[1],
            fid: data[2],
        }
    }
}
