//! Reference-counted factory minting channels and raw queue pairs against
//! one opened device. Several logs are typically parameterized by the same
//! factory: every channel and log holds a clone of the handle, and the
//! shared state is destroyed on last release.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::{
    backend::{IoEngine, IoQueue},
    core::{Channel, DeviceInfo, Result, ZnsDevice, ZnsError},
};

/// How a channel should be minted.
#[derive(Debug, Clone, Copy)]
pub struct ChannelOptions {
    /// First zone of the channel window; defaults to the device window.
    pub min_zone: Option<u64>,
    /// One past the last zone of the channel window; defaults to the
    /// device window.
    pub max_zone: Option<u64>,
    /// Keep async staging buffers across syncs.
    pub preserve_async_buffer: bool,
    /// Number of pipelined append slots.
    pub queue_depth: u32,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        ChannelOptions {
            min_zone: None,
            max_zone: None,
            preserve_async_buffer: false,
            queue_depth: 1,
        }
    }
}

struct FactoryShared {
    engine: Arc<dyn IoEngine>,
    info: DeviceInfo,
    max_channels: usize,
    channels: Mutex<usize>,
}

/// Cloneable handle to the factory; the last clone to drop releases it.
#[derive(Clone)]
pub struct ChannelFactory {
    shared: Arc<FactoryShared>,
}

impl std::fmt::Debug for ChannelFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelFactory").finish_non_exhaustive()
    }
}

impl ChannelFactory {
    /// Build a factory for an opened device, bounded at `max_channels`
    /// channels and raw queue pairs combined.
    pub fn new(device: &ZnsDevice, max_channels: usize) -> Result<Self> {
        Ok(ChannelFactory {
            shared: Arc::new(FactoryShared {
                engine: device.engine()?,
                info: device.info()?,
                max_channels,
                channels: Mutex::new(0),
            }),
        })
    }

    pub fn device_info(&self) -> DeviceInfo {
        self.shared.info
    }

    pub(crate) fn engine(&self) -> Arc<dyn IoEngine> {
        self.shared.engine.clone()
    }

    pub fn channel_count(&self) -> usize {
        *self.shared.channels.lock()
    }

    fn claim_slot(&self) -> Result<()> {
        let mut count = self.shared.channels.lock();
        if *count >= self.shared.max_channels {
            return Err(ZnsError::invalid("channel capacity reached"));
        }
        *count += 1;
        Ok(())
    }

    pub(crate) fn release_slot(&self) {
        let mut count = self.shared.channels.lock();
        debug_assert!(*count > 0);
        *count = count.saturating_sub(1);
    }

    /// Mint a channel over the requested zone window (clamped to the
    /// device window).
    pub fn register_channel(&self, options: ChannelOptions) -> Result<Channel> {
        self.claim_slot()?;
        let info = self.shared.info;
        let min_zone = options
            .min_zone
            .unwrap_or_else(|| info.min_zone())
            .max(info.min_zone());
        let max_zone = options
            .max_zone
            .unwrap_or_else(|| info.max_zone())
            .min(info.max_zone());
        let qpair = match self.shared.engine.create_qpair() {
            Ok(qpair) => qpair,
            Err(e) => {
                self.release_slot();
                return Err(e.into());
            }
        };
        match Channel::new(
            self.clone(),
            qpair,
            info,
            min_zone,
            max_zone,
            options.queue_depth,
            options.preserve_async_buffer,
        ) {
            Ok(channel) => {
                debug!(min_zone, max_zone, "registered channel");
                Ok(channel)
            }
            Err(e) => {
                self.release_slot();
                Err(e)
            }
        }
    }

    /// Retire a channel. Equivalent to dropping it; provided for symmetry.
    pub fn unregister_channel(&self, channel: Channel) {
        drop(channel);
    }

    /// Mint a bare queue pair, counted against the same capacity.
    pub fn register_raw_qpair(&self) -> Result<RawQpair> {
        self.claim_slot()?;
        match self.shared.engine.create_qpair() {
            Ok(qpair) => Ok(RawQpair {
                qpair,
                factory: self.clone(),
            }),
            Err(e) => {
                self.release_slot();
                Err(e.into())
            }
        }
    }

    /// Retire a raw queue pair. Equivalent to dropping it.
    pub fn unregister_raw_qpair(&self, qpair: RawQpair) {
        drop(qpair);
    }
}

/// A bare queue pair leased from the factory, for callers that want to
/// speak the engine contract directly.
pub struct RawQpair {
    qpair: Box<dyn IoQueue>,
    factory: ChannelFactory,
}

impl RawQpair {
    pub fn queue(&mut self) -> &mut dyn IoQueue {
        self.qpair.as_mut()
    }
}

impl Drop for RawQpair {
    fn drop(&mut self) {
        self.factory.release_slot();
    }
}
