//! # File Transfer Engine
//!
//! Stop-and-wait upload: one Codec 34 payload in flight, advanced only by a
//! Codec 36 acknowledgment that matches it. The job is a pure state machine;
//! the session writes the frames it returns and reports ack timeouts.

use crate::codec::crc::crc16;
use crate::codec::protocol::{TransferAck, TransferMode, TransferStage};
use crate::codec::transfer::{encode_chunk, encode_end_marker};
use crate::error::GatewayError;

/// Job status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Idle,
    InProgress,
    Completed,
    Failed,
}

/// What the session must do next
#[derive(Debug)]
pub enum TransferStep {
    /// Write this frame and wait for its acknowledgment
    Send(Vec<u8>),
    /// Nothing to send; keep waiting for the in-flight acknowledgment
    Wait,
    Completed,
    Failed(GatewayError),
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    stage: TransferStage,
    sequence: u32,
    offset: usize,
    len: usize,
}

/// Upload of one image to one device
#[derive(Debug)]
pub struct FileTransferJob {
    source: Vec<u8>,
    chunk_size: usize,
    mode: TransferMode,
    max_retries: u32,
    bytes_acked: usize,
    status: TransferStatus,
    retries: u32,
    in_flight: Option<InFlight>,
}

impl FileTransferJob {
    /// # Arguments
    ///
    /// * `source` - Image bytes
    /// * `chunk_size` - Bytes per Codec 34 chunk (non-zero)
    /// * `mode` - Full image or delta
    /// * `max_retries` - Resends allowed per payload after the first attempt
    pub fn new(source: Vec<u8>, chunk_size: usize, mode: TransferMode, max_retries: u32) -> Self {
        Self {
            source,
            chunk_size: chunk_size.max(1),
            mode,
            max_retries,
            bytes_acked: 0,
            status: TransferStatus::Idle,
            retries: 0,
            in_flight: None,
        }
    }

    pub fn status(&self) -> TransferStatus {
        self.status
    }

    /// Bytes of the source confirmed by the device
    pub fn bytes_acked(&self) -> usize {
        self.bytes_acked
    }

    pub fn total_len(&self) -> usize {
        self.source.len()
    }

    pub fn mode(&self) -> TransferMode {
        self.mode
    }

    /// Resends of the payload currently in flight
    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn chunk_count(&self) -> usize {
        self.source.len().div_ceil(self.chunk_size)
    }

    /// Emit the first payload
    pub fn start(&mut self) -> TransferStep {
        self.status = TransferStatus::InProgress;
        self.send_next()
    }

    /// Feed a Codec 36 acknowledgment
    pub fn on_ack(&mut self, ack: &TransferAck) -> TransferStep {
        let Some(in_flight) = self.in_flight else {
            return self.finished_step();
        };

        // Duplicate of an ack already consumed, e.g. after a timeout resend
        if ack.stage == TransferStage::Chunk && ack.sequence < in_flight.sequence {
            return TransferStep::Wait;
        }

        let matches = ack.stage == in_flight.stage && ack.sequence == in_flight.sequence && ack.is_ok();
        if !matches {
            return self.retry();
        }

        self.retries = 0;
        match in_flight.stage {
            TransferStage::Chunk => {
                self.bytes_acked = in_flight.offset + in_flight.len;
                self.send_next()
            }
            TransferStage::End => {
                self.in_flight = None;
                self.status = TransferStatus::Completed;
                TransferStep::Completed
            }
        }
    }

    /// The acknowledgment for the in-flight payload did not arrive in time
    pub fn on_timeout(&mut self) -> TransferStep {
        if self.in_flight.is_none() {
            return self.finished_step();
        }
        self.retry()
    }

    /// Abort the job
    pub fn fail(&mut self) {
        self.in_flight = None;
        self.status = TransferStatus::Failed;
    }

    fn finished_step(&self) -> TransferStep {
        match self.status {
            TransferStatus::Completed => TransferStep::Completed,
            _ => TransferStep::Failed(GatewayError::SessionClosed),
        }
    }

    fn retry(&mut self) -> TransferStep {
        let Some(in_flight) = self.in_flight else {
            return self.finished_step();
        };

        if self.retries >= self.max_retries {
            self.fail();
            return TransferStep::Failed(GatewayError::FileTransferRetryExhausted {
                offset: in_flight.offset,
                attempts: self.retries + 1,
            });
        }

        self.retries += 1;
        TransferStep::Send(self.encode(in_flight))
    }

    /// Next chunk after the acknowledged prefix, or the end marker
    fn send_next(&mut self) -> TransferStep {
        let offset = self.bytes_acked;
        let sequence = (offset / self.chunk_size) as u32;

        let in_flight = if offset < self.source.len() {
            InFlight {
                stage: TransferStage::Chunk,
                sequence,
                offset,
                len: self.chunk_size.min(self.source.len() - offset),
            }
        } else {
            InFlight {
                stage: TransferStage::End,
                sequence: self.chunk_count() as u32,
                offset,
                len: 0,
            }
        };

        self.in_flight = Some(in_flight);
        TransferStep::Send(self.encode(in_flight))
    }

    fn encode(&self, in_flight: InFlight) -> Vec<u8> {
        match in_flight.stage {
            TransferStage::Chunk => encode_chunk(
                self.mode,
                in_flight.sequence,
                in_flight.offset as u32,
                &self.source[in_flight.offset..in_flight.offset + in_flight.len],
            ),
            TransferStage::End => encode_end_marker(
                self.mode,
                in_flight.sequence,
                self.source.len() as u32,
                crc16(&self.source),
                self.chunk_count() as u32,
            ),
        }
    }
}
