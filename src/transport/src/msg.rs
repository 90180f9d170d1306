//! Request/response messaging on top of an endpoint.
//!
//! Peers alternate strictly: one side calls [`Messaging::send_message`] while the other calls
//! [`Messaging::receive_message`]. Every call posts the receive for the next incoming message
//! before anything can trigger it, so one receive stays pre-posted between round trips.
//!
//! Every request posted here is signaled and waited for before the call returns, so the buffers
//! are free again once a call has succeeded. The raw posting calls of [`Endpoint`] leave that to
//! the caller and are `unsafe`.
use rdma::fabric::WcOpcode;

use crate::cm::{Client, Server};
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::region::RemoteRegion;

pub trait Messaging {
    fn transport(&mut self) -> &mut Endpoint;

    /// Sends the first `request_size` bytes of the send buffer and returns the response.
    fn send_message(&mut self, request_size: usize) -> Result<&[u8]> {
        let ep = self.transport();
        // both requests are reaped by the tally below
        unsafe {
            ep.post_receive()?;
            ep.post_send(request_size, true)?;
        }
        let response_size = ep.wait_for_one_send_and_one_receive()?;
        Ok(&ep.recv_buf()[..response_size])
    }

    /// Waits for a request and answers it. `handler` gets the request and the send buffer, and
    /// returns the size of the response it wrote. Returns the size of the request.
    fn receive_message<F>(&mut self, handler: F) -> Result<usize>
    where
        F: FnOnce(&[u8], &mut [u8]) -> usize,
    {
        let ep = self.transport();
        unsafe { ep.post_receive()? };
        let request_size = ep.wait_for_receive()?;
        let (recv_buf, send_buf) = ep.buffers_mut();
        let response_size = handler(&recv_buf[..request_size], send_buf);
        unsafe { ep.post_send(response_size, true)? };
        ep.wait_for_send()?;
        Ok(request_size)
    }

    /// Sends the first `size` bytes of the send buffer without expecting an answer.
    fn send_oneway(&mut self, size: usize) -> Result<()> {
        let ep = self.transport();
        unsafe { ep.post_send(size, true)? };
        ep.wait_for_send()
    }

    /// Waits for a message sent with [`send_oneway`](Self::send_oneway) and returns its size.
    fn receive_oneway(&mut self) -> Result<usize> {
        let ep = self.transport();
        unsafe { ep.post_receive()? };
        ep.wait_for_receive()
    }

    /// Writes the first `len` bytes of the send buffer into `remote` and tags the write with
    /// `payload`. Blocks until the write has completed locally.
    fn write_with_payload(&mut self, len: usize, remote: &RemoteRegion, payload: u32) -> Result<()> {
        if len > remote.len as usize {
            return Err(Error::SizeOverflow {
                size: len,
                capacity: remote.len as usize,
            });
        }
        let ep = self.transport();
        unsafe { ep.post_write_bytes(len, remote.remote_key(), Some(payload), true)? };
        let wc = ep.wait_completion()?;
        if wc.opcode != WcOpcode::RdmaWrite {
            return Err(Error::UnexpectedCompletion {
                expected: "an RDMA write",
                opcode: wc.opcode,
                wr_id: wc.wr_id,
            });
        }
        Ok(())
    }

    /// Waits for a write made with [`write_with_payload`](Self::write_with_payload). Returns
    /// the number of bytes written into the receive buffer and the payload.
    fn wait_for_write(&mut self) -> Result<(usize, u32)> {
        let ep = self.transport();
        unsafe { ep.post_receive()? };
        ep.wait_for_receive_with_payload()
    }
}

impl Messaging for Endpoint {
    #[inline]
    fn transport(&mut self) -> &mut Endpoint {
        self
    }
}

impl Messaging for Client {
    #[inline]
    fn transport(&mut self) -> &mut Endpoint {
        self.endpoint_mut()
    }
}

impl Messaging for Server {
    #[inline]
    fn transport(&mut self) -> &mut Endpoint {
        self.endpoint_mut()
    }
}
