// This is part of vbus-bridge.
// Copyright (c) 2020, Daniel Wippermann.
// See README.md and LICENSE.txt for details.

//! # vbus-bridge
//!
//! A Rust library that receives RESOL VBus telemetry from solar / heating
//! controllers and maps the packet fields onto named values.
//!
//!
//! ## Features
//!
//! - Receive VBus data over VBus-over-TCP (DL2, DL3, VBus/LAN) or a serial line
//! - Decode the VBus wire format, resynchronizing after corrupted frames
//! - Load device definitions describing the fields of each packet
//! - Publish the values of bound items, either continuously or in periodic cycles
//!
//!
//! ## Examples
//!
//! ```no_run
//! use std::{collections::HashMap, sync::Arc};
//!
//! use vbus_bridge::{BindingProvider, EventPublisher, Providers, Result, VBusBinding, Value};
//!
//! struct Printer;
//!
//! impl EventPublisher for Printer {
//!     fn post_update(&self, item_name: &str, value: Value) {
//!         println!("{} = {}", item_name, value);
//!     }
//! }
//!
//! struct Bindings;
//!
//! impl BindingProvider for Bindings {
//!     fn item_names(&self) -> Vec<String> {
//!         vec!["collector".into()]
//!     }
//!
//!     fn field_name(&self, _item_name: &str) -> Option<String> {
//!         Some("Temperature1".into())
//!     }
//! }
//!
//! fn main() -> Result<()> {
//!     async_std::task::block_on(async {
//!         let providers = Providers::new();
//!         providers.add(Arc::new(Bindings));
//!
//!         let binding = VBusBinding::new("resources", providers, Arc::new(Printer));
//!
//!         let mut properties = HashMap::new();
//!         properties.insert("host".to_string(), "192.168.13.45".to_string());
//!         properties.insert("deviceid".to_string(), "7E11".to_string());
//!         binding.activate(&properties).await?;
//!
//!         loop {
//!             async_std::task::sleep(binding.refresh_interval()).await;
//!             if let Err(err) = binding.execute().await {
//!                 eprintln!("{}", err);
//!             }
//!         }
//!     })
//! }
//! ```

#![warn(missing_docs)]
#![deny(missing_debug_implementations)]
#![deny(future_incompatible)]
#![deny(nonstandard_style)]
#![deny(rust_2018_compatibility)]
#![deny(rust_2018_idioms)]
#![allow(clippy::if_same_then_else)]
#![allow(clippy::large_enum_variant)]
#![allow(clippy::needless_bool)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::trivially_copy_pass_by_ref)]
#![allow(clippy::write_with_newline)]

mod error;
pub use error::{Error, Result};

mod value;
pub use value::Value;

mod frame_decoder;
pub use frame_decoder::{
    decode_all, encode_packet, DecodeError, FrameDecoder, Packet, MAX_FRAME_LEN, MAX_PAYLOAD_LEN,
    SYNC_BYTE,
};

mod device_definition;
pub use device_definition::{DeviceDefinition, DeviceElement, FieldElement, FieldTag, PacketElement};

mod device_spec;
pub use device_spec::{DeviceSpec, FieldFormat, FieldSpec, PacketSpec, SpecSlot};

mod config_catalog;
pub use config_catalog::{parse_mapping, ConfigCatalog, MAPPING_FILE_NAME};

mod transport;
pub use transport::{DisconnectHandle, Transport, TransportKind};

mod tcp_client_handshake;
pub use tcp_client_handshake::TcpClientHandshake;

mod lan_transport;
pub use lan_transport::LanTransport;

mod serial_transport;
pub use serial_transport::SerialTransport;

mod update_dispatcher;
pub use update_dispatcher::{
    BindingProvider, DispatchReport, EventPublisher, PacketListener, Providers, UpdateDispatcher,
};

mod receiver;
pub use receiver::{Receiver, ReceiverHandle, ReceiverOptions};

mod scheduler;
pub use scheduler::{schedule, RunMode, Schedule, CONTINUOUS_THRESHOLD};

mod config;
pub use config::{BindingConfig, RawOptions, TransportConfig};

mod binding;
pub use binding::{BindingState, VBusBinding, BINDING_NAME};

#[cfg(test)]
mod test_utils;
