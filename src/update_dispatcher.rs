use std::{
    collections::HashSet,
    fmt,
    sync::{Arc, RwLock, RwLockWriteGuard},
};

use log::{debug, trace};

use crate::{
    device_spec::SpecSlot,
    error::{Error, Result},
    frame_decoder::Packet,
    value::Value,
};

/// Receives the named values extracted from packets (the host's event bus).
pub trait EventPublisher: Send + Sync {
    /// Publish a new state for `item_name`.
    fn post_update(&self, item_name: &str, value: Value);
}

/// Exposes the host's item configuration: which item is bound to which field.
pub trait BindingProvider: Send + Sync {
    /// All item names this provider knows about.
    fn item_names(&self) -> Vec<String>;

    /// The field name `item_name` is bound to.
    fn field_name(&self, item_name: &str) -> Option<String>;
}

/// Consumes decoded packets, e.g. to dispatch their values.
pub trait PacketListener: Send + Sync {
    /// Called once for every decoded packet.
    fn on_packet(&self, packet: &Packet);
}

impl<F> PacketListener for F
where
    F: Fn(&Packet) + Send + Sync,
{
    fn on_packet(&self, packet: &Packet) {
        self(packet)
    }
}

/// The shared, replaceable list of binding providers.
#[derive(Clone, Default)]
pub struct Providers {
    inner: Arc<RwLock<Vec<Arc<dyn BindingProvider>>>>,
}

impl Providers {
    /// Create an empty list.
    pub fn new() -> Providers {
        Providers::default()
    }

    /// Add a provider.
    pub fn add(&self, provider: Arc<dyn BindingProvider>) {
        self.write().push(provider);
    }

    /// Remove a provider previously added.
    pub fn remove(&self, provider: &Arc<dyn BindingProvider>) {
        self.write()
            .retain(|other| !Arc::ptr_eq(other, provider));
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Arc<dyn BindingProvider>>> {
        match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn snapshot(&self) -> Vec<Arc<dyn BindingProvider>> {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Number of registered providers.
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    /// Whether no provider is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for Providers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Providers").field("len", &self.len()).finish()
    }
}

/// Outcome of dispatching one packet.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchReport {
    /// Number of `post_update` calls made.
    pub published: usize,

    /// Field names that were bound to an item but not found in the packet spec.
    pub unresolved_fields: Vec<String>,
}

/// Maps decoded packets onto bound items and publishes their values.
pub struct UpdateDispatcher {
    spec: SpecSlot,
    providers: Providers,
    publisher: Arc<dyn EventPublisher>,
}

impl UpdateDispatcher {
    /// Create a dispatcher reading the spec from `spec` and bindings from `providers`.
    pub fn new(
        spec: SpecSlot,
        providers: Providers,
        publisher: Arc<dyn EventPublisher>,
    ) -> UpdateDispatcher {
        UpdateDispatcher {
            spec,
            providers,
            publisher,
        }
    }

    /// Extract and publish all bound values contained in `packet`.
    ///
    /// Fails with `Error::NoMatchingPacketSpec` if no spec is loaded or none
    /// describes the packet's addresses. Unknown field names do not fail the
    /// dispatch; they are reported in the returned `DispatchReport`.
    pub fn dispatch(&self, packet: &Packet) -> Result<DispatchReport> {
        let no_match = || Error::NoMatchingPacketSpec {
            source_address: packet.source_address,
            destination_address: packet.destination_address,
        };

        if !packet.checksum_valid {
            return Err(no_match());
        }

        // Hold on to one spec for the whole dispatch even if it is swapped meanwhile.
        let spec = self.spec.load().ok_or_else(no_match)?;
        let packet_spec = spec.packet_spec(packet).ok_or_else(no_match)?;

        let mut report = DispatchReport::default();
        let mut seen = HashSet::new();

        for provider in self.providers.snapshot() {
            for item_name in provider.item_names() {
                if seen.contains(&item_name) {
                    continue;
                }

                let field_name = match provider.field_name(&item_name) {
                    Some(field_name) => field_name,
                    None => continue,
                };

                trace!("Trying to update item {} bound to {}", item_name, field_name);

                let field = match packet_spec.field(&field_name) {
                    Some(field) => field,
                    None => {
                        debug!("{}", Error::UnknownField(field_name.clone()));
                        report.unresolved_fields.push(field_name);
                        continue;
                    }
                };

                let value = match field.value(&packet.payload) {
                    Some(value) => value,
                    None => {
                        debug!(
                            "Packet {} too short for field {}",
                            packet.id_string(),
                            field_name
                        );
                        continue;
                    }
                };

                self.publisher.post_update(&item_name, value);
                seen.insert(item_name);
                report.published += 1;
            }
        }

        Ok(report)
    }
}

impl PacketListener for UpdateDispatcher {
    fn on_packet(&self, packet: &Packet) {
        match self.dispatch(packet) {
            Ok(report) => trace!(
                "Dispatched packet {}: {} updates",
                packet.id_string(),
                report.published
            ),
            Err(err) => debug!("Skipping packet {}: {}", packet.id_string(), err),
        }
    }
}

impl fmt::Debug for UpdateDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateDispatcher")
            .field("spec", &self.spec)
            .field("providers", &self.providers)
            .finish()
    }
}
