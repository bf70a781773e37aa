//! Baseband Buffers and Gateways
//!
//! A baseband buffer holds one block of complex samples per channel. The
//! gateway traits move such blocks between the lower PHY and a radio; every
//! block carries the sample-count timestamp of its first sample.

use crate::InterfaceError;
use num_complex::Complex32;
use std::sync::{Arc, Mutex};

/// Timestamp in samples since the radio stream started
pub type BasebandTimestamp = u64;

/// Multichannel block of complex baseband samples
#[derive(Debug, Clone, PartialEq)]
pub struct BasebandBuffer {
    channels: Vec<Vec<Complex32>>,
}

impl BasebandBuffer {
    /// Create a zeroed buffer
    pub fn new(nof_channels: usize, nof_samples: usize) -> Self {
        Self {
            channels: vec![vec![Complex32::new(0.0, 0.0); nof_samples]; nof_channels],
        }
    }

    pub fn nof_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn nof_samples(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    pub fn channel(&self, index: usize) -> &[Complex32] {
        &self.channels[index]
    }

    pub fn channel_mut(&mut self, index: usize) -> &mut [Complex32] {
        &mut self.channels[index]
    }

    /// Change the number of samples of every channel
    pub fn resize(&mut self, nof_samples: usize) {
        for channel in &mut self.channels {
            channel.resize(nof_samples, Complex32::new(0.0, 0.0));
        }
    }

    pub fn fill_zero(&mut self) {
        for channel in &mut self.channels {
            channel.fill(Complex32::new(0.0, 0.0));
        }
    }
}

/// Receive metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RxMetadata {
    /// Timestamp of the first received sample
    pub ts: BasebandTimestamp,
}

/// Transmit metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxMetadata {
    /// Timestamp at which the first sample must go on air
    pub ts: BasebandTimestamp,
}

/// Sends baseband blocks to the radio
pub trait BasebandGatewayTransmitter: Send + Sync {
    /// Queue a block for transmission at `metadata.ts`.
    ///
    /// Blocks must be given in increasing timestamp order. A block whose
    /// timestamp is behind what the radio already holds is late: the driver
    /// reports it through its notifier and drops the late part.
    fn transmit(&self, buffer: &BasebandBuffer, metadata: TxMetadata) -> Result<(), InterfaceError>;
}

/// Receives baseband blocks from the radio
pub trait BasebandGatewayReceiver: Send + Sync {
    /// Fill the whole buffer with the next samples of the stream
    fn receive(&self, buffer: &mut BasebandBuffer) -> Result<RxMetadata, InterfaceError>;
}

/// Transmitter/receiver pair of one sector
pub trait BasebandGateway: Send + Sync {
    fn transmitter(&self) -> Arc<dyn BasebandGatewayTransmitter>;

    fn receiver(&self) -> Arc<dyn BasebandGatewayReceiver>;

    /// Preferred block size in samples, when the radio has one
    fn optimal_buffer_size(&self) -> Option<usize> {
        None
    }
}

/// Fixed set of preallocated baseband buffers
pub struct BasebandBufferPool {
    buffers: Mutex<Vec<BasebandBuffer>>,
    nof_channels: usize,
    nof_samples: usize,
}

impl BasebandBufferPool {
    pub fn new(capacity: usize, nof_channels: usize, nof_samples: usize) -> Self {
        let buffers = (0..capacity)
            .map(|_| BasebandBuffer::new(nof_channels, nof_samples))
            .collect();
        Self {
            buffers: Mutex::new(buffers),
            nof_channels,
            nof_samples,
        }
    }

    /// Take a buffer, or `None` when every buffer is in flight
    pub fn take(&self) -> Option<BasebandBuffer> {
        self.buffers.lock().ok()?.pop()
    }

    /// Give a buffer back to the pool
    pub fn give_back(&self, mut buffer: BasebandBuffer) {
        if buffer.nof_channels() != self.nof_channels {
            return;
        }
        buffer.resize(self.nof_samples);
        if let Ok(mut buffers) = self.buffers.lock() {
            buffers.push(buffer);
        }
    }

    pub fn available(&self) -> usize {
        self.buffers.lock().map_or(0, |buffers| buffers.len())
    }
}

/// Encode complex samples as raw little-endian `cf32`
pub fn samples_to_bytes(samples: &[Complex32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 8);
    for sample in samples {
        bytes.extend_from_slice(&sample.re.to_le_bytes());
        bytes.extend_from_slice(&sample.im.to_le_bytes());
    }
    bytes
}

/// Decode raw little-endian `cf32` samples
pub fn bytes_to_samples(bytes: &[u8]) -> Result<Vec<Complex32>, InterfaceError> {
    if bytes.len() % 8 != 0 {
        return Err(InterfaceError::InvalidMessage);
    }
    Ok(bytes
        .chunks_exact(8)
        .map(|chunk| {
            let re = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            let im = f32::from_le_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]);
            Complex32::new(re, im)
        })
        .collect())
}
