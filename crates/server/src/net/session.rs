//! Per-connection URB session
//!
//! Created after a successful import, a session owns the device claim
//! and the socket for the rest of the connection's life. The receive
//! loop decodes `CMD_SUBMIT`/`CMD_UNLINK`; each submitted URB runs as
//! its own completion task so transfers overlap and may complete out of
//! order, while all replies go through one shared writer.
//!
//! The pending map (seqnum → cancel handle) is the session's source of
//! truth: a URB is in it exactly from registration until its completion
//! task or an unlink removes it, and whoever removes it owns the right
//! to answer for it. That makes the reply for each sequence number
//! exactly-once by construction and resolves the submit/unlink race
//! deterministically: an unlink that finds the seqnum gone reports
//! failure, never double-replies.

use crate::usb::claims::ClaimSlot;
use crate::usb::backend::DeviceClaim;
use anyhow::{Context, Result};
use common::usb_types::{CancelHandle, TransferError, TransferRequest};
use protocol::{CmdSubmit, CmdUnlink, ProtocolError, RetSubmit, RetUnlink, UrbRequest};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

type SharedWriter<W> = Arc<Mutex<W>>;

/// One importing client attached to one claimed device
pub struct Session<C: DeviceClaim> {
    claim: C,
    /// Reservation in the process-wide claim table; held until the
    /// session is gone
    slot: ClaimSlot,
    pending: Arc<Mutex<HashMap<u32, CancelHandle>>>,
}

impl<C: DeviceClaim> Session<C> {
    pub fn new(claim: C, slot: ClaimSlot) -> Self {
        Self {
            claim,
            slot,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run the URB loop until the client disconnects or misbehaves
    ///
    /// On every exit path all still-pending transfers are cancelled
    /// before the device claim is released.
    pub async fn run<R, W>(self, mut reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        info!("Session started for {}", self.slot.bus_id());

        let writer = Arc::new(Mutex::new(writer));
        let result = self.serve(&mut reader, &writer).await;
        self.shutdown().await;
        result
    }

    async fn serve<R, W>(&self, reader: &mut R, writer: &SharedWriter<W>) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        loop {
            let request = match protocol::read_urb_request(reader).await {
                Ok(request) => request,
                Err(ProtocolError::Io(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    debug!("Client closed the connection");
                    return Ok(());
                }
                Err(e) => {
                    return Err(e).context("Failed to read URB request");
                }
            };

            match request {
                UrbRequest::Submit(cmd) => self.handle_submit(cmd, writer).await?,
                UrbRequest::Unlink(cmd) => self.handle_unlink(cmd, writer).await?,
            }
        }
    }

    async fn handle_submit<W>(&self, cmd: CmdSubmit, writer: &SharedWriter<W>) -> Result<()>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let snapshot = self.claim.snapshot();

        // A URB for an endpoint the device does not have is answered,
        // not fatal; the client may probe
        let Some(endpoint) = snapshot.endpoint(cmd.ep as u8, cmd.direction) else {
            debug!(
                "Rejecting seqnum {}: no endpoint {} {}",
                cmd.seqnum, cmd.ep, cmd.direction
            );
            let reply = RetSubmit::error(&cmd, TransferError::NotFound.errno());
            return send(writer, &reply.to_bytes()?).await;
        };

        {
            let pending = self.pending.lock().await;
            if pending.contains_key(&cmd.seqnum) {
                warn!("Rejecting reused live seqnum {}", cmd.seqnum);
                drop(pending);
                let reply = RetSubmit::error(&cmd, TransferError::InvalidParam.errno());
                return send(writer, &reply.to_bytes()?).await;
            }
        }

        let request = TransferRequest {
            endpoint: cmd.ep as u8,
            direction: cmd.direction,
            kind: endpoint.kind,
            length: cmd.transfer_buffer_length as usize,
            setup: cmd.setup,
            payload: cmd.payload.clone(),
        };

        let inflight = self.claim.submit(request);
        self.pending
            .lock()
            .await
            .insert(cmd.seqnum, inflight.cancel_handle());

        let pending = self.pending.clone();
        let writer = writer.clone();
        tokio::spawn(async move {
            let result = inflight.complete().await;

            // Whoever removes the seqnum answers for it; if an unlink
            // got there first this completion is answered already
            if pending.lock().await.remove(&cmd.seqnum).is_none() {
                debug!("Dropping completion of unlinked seqnum {}", cmd.seqnum);
                return;
            }

            let reply = match result {
                Ok(outcome) => {
                    debug!(
                        "seqnum {} completed: {} bytes",
                        cmd.seqnum, outcome.actual_length
                    );
                    RetSubmit::success(&cmd, outcome.actual_length, outcome.data)
                }
                Err(error) => {
                    debug!("seqnum {} failed: {}", cmd.seqnum, error);
                    RetSubmit::error(&cmd, error.errno())
                }
            };

            match reply.to_bytes() {
                Ok(bytes) => {
                    if let Err(e) = send(&writer, &bytes).await {
                        debug!("Could not deliver reply for seqnum {}: {:#}", cmd.seqnum, e);
                    }
                }
                Err(e) => warn!("Failed to encode reply for seqnum {}: {}", cmd.seqnum, e),
            }
        });

        Ok(())
    }

    async fn handle_unlink<W>(&self, cmd: CmdUnlink, writer: &SharedWriter<W>) -> Result<()>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let removed = self.pending.lock().await.remove(&cmd.unlink_seqnum);

        let status = match removed {
            Some(handle) => {
                // Whether or not the device layer still sees the
                // transfer, the unlink owned the seqnum and succeeds
                handle.cancel();
                debug!("Unlinked seqnum {}", cmd.unlink_seqnum);
                0
            }
            None => {
                debug!(
                    "Unlink target {} not pending (completed or never submitted)",
                    cmd.unlink_seqnum
                );
                TransferError::NotFound.errno()
            }
        };

        let reply = RetUnlink::new(&cmd, status);
        send(writer, &reply.to_bytes()?).await
    }

    /// Cancel everything still in flight; the claim itself is released
    /// when the session is dropped right after
    async fn shutdown(&self) {
        let drained: Vec<(u32, CancelHandle)> =
            self.pending.lock().await.drain().collect();

        if !drained.is_empty() {
            info!(
                "Cancelling {} pending transfer(s) for {}",
                drained.len(),
                self.slot.bus_id()
            );
        }
        for (seqnum, handle) in drained {
            handle.cancel();
            debug!("Cancelled pending seqnum {}", seqnum);
        }

        info!("Session ended for {}", self.slot.bus_id());
    }
}

async fn send<W>(writer: &SharedWriter<W>, bytes: &[u8]) -> Result<()>
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    let mut writer = writer.lock().await;
    writer
        .write_all(bytes)
        .await
        .context("Failed to write reply")?;
    Ok(())
}
