use std::collections::HashMap;

use paumiot_core::error::{ErrorKind, Result};
use tracing::{debug, info, warn};

use super::{Adapter, CoapAdapter, MqttAdapter};
use crate::{message::InternalMessage, protocol::Protocol};

/// Traffic counters of one registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PalStats {
    /// Packets decoded successfully
    pub messages_received: u64,
    /// Messages encoded successfully
    pub messages_sent: u64,
    /// Bytes consumed by successful decodes
    pub bytes_received: u64,
    /// Bytes produced by successful encodes
    pub bytes_sent: u64,
    /// Failed decodes and encodes
    pub errors: u64,
}

/// Registry holding at most one adapter per protocol.
#[derive(Debug, Default)]
pub struct PalRegistry {
    adapters: HashMap<Protocol, Box<dyn Adapter>>,
    stats: PalStats,
}

impl PalRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the MQTT and CoAP adapters installed.
    pub fn with_default_adapters() -> Self {
        let mut registry = Self::new();
        // Both slots are empty, so neither registration can conflict.
        let _ = registry.register(Box::new(MqttAdapter::default()));
        let _ = registry.register(Box::new(CoapAdapter::new()));
        registry
    }

    /// Installs `adapter`; fails with `AlreadyInitialized` if its protocol is taken.
    pub fn register(&mut self, adapter: Box<dyn Adapter>) -> Result<()> {
        let protocol = adapter.protocol();
        if self.adapters.contains_key(&protocol) {
            warn!("[PAL] adapter for {} already registered", protocol);
            return Err(ErrorKind::AlreadyInitialized);
        }
        info!("[PAL] registered {} v{} for {}", adapter.name(), adapter.version(), protocol);
        self.adapters.insert(protocol, adapter);
        Ok(())
    }

    /// Removes and returns the adapter for `protocol`.
    pub fn unregister(&mut self, protocol: Protocol) -> Option<Box<dyn Adapter>> {
        let adapter = self.adapters.remove(&protocol);
        if adapter.is_some() {
            info!("[PAL] unregistered adapter for {}", protocol);
        }
        adapter
    }

    /// Adapter registered for `protocol`.
    pub fn adapter(&self, protocol: Protocol) -> Option<&dyn Adapter> {
        self.adapters.get(&protocol).map(|adapter| adapter.as_ref())
    }

    /// Mutable access, e.g. for control commands.
    pub fn adapter_mut(&mut self, protocol: Protocol) -> Option<&mut (dyn Adapter + 'static)> {
        self.adapters.get_mut(&protocol).map(|adapter| adapter.as_mut())
    }

    /// Decodes `bytes` with the adapter for `protocol`.
    pub fn decode_packet(&mut self, protocol: Protocol, bytes: &[u8]) -> Result<InternalMessage> {
        let adapter = self.adapters.get(&protocol).ok_or(ErrorKind::NotSupported("no PAL adapter"))?;
        match adapter.decode(bytes) {
            Ok(message) => {
                self.stats.messages_received += 1;
                self.stats.bytes_received += bytes.len() as u64;
                debug!("[PAL] decoded {} bytes of {}", bytes.len(), protocol);
                Ok(message)
            }
            Err(err) => {
                self.stats.errors += 1;
                debug!("[PAL] {} decode failed: {}", protocol, err);
                Err(err)
            }
        }
    }

    /// Encodes `message` with the adapter for `protocol` into `out`.
    pub fn encode_message(
        &mut self,
        protocol: Protocol,
        message: &InternalMessage,
        out: &mut [u8],
    ) -> Result<usize> {
        let adapter =
            self.adapters.get_mut(&protocol).ok_or(ErrorKind::NotSupported("no PAL adapter"))?;
        match adapter.encode(message, out) {
            Ok(written) => {
                self.stats.messages_sent += 1;
                self.stats.bytes_sent += written as u64;
                Ok(written)
            }
            Err(err) => {
                self.stats.errors += 1;
                debug!("[PAL] {} encode failed: {}", protocol, err);
                Err(err)
            }
        }
    }

    /// Traffic counters.
    pub fn stats(&self) -> PalStats {
        self.stats
    }

    /// Number of registered adapters.
    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    /// Returns true if no adapter is registered.
    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}
