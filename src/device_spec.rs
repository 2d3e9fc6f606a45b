use std::{
    collections::HashSet,
    sync::{Arc, RwLock},
};

use crate::{
    device_definition::{parse_number, DeviceDefinition, FieldElement, PacketElement},
    error::{Error, Result},
    frame_decoder::{Packet, MAX_PAYLOAD_LEN},
    value::Value,
};

/// How a field's scaled value is to be interpreted.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldFormat {
    /// Minutes since midnight, published as a timestamp.
    TimeOfDay,

    /// Any other tag, published as a plain decimal.
    Other(String),
}

impl FieldFormat {
    fn parse(tag: &str) -> FieldFormat {
        if tag.trim().eq_ignore_ascii_case("t") {
            FieldFormat::TimeOfDay
        } else {
            FieldFormat::Other(tag.to_string())
        }
    }
}

/// Describes where a single value lives inside a packet payload and how to scale it.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    /// Field name, unique within its packet.
    pub name: String,

    /// Byte offset into the payload.
    pub offset: usize,

    /// Number of significant bits (1 to 32), little-endian on the wire.
    pub bit_size: u8,

    /// Optional mask applied to the raw value.
    pub mask: Option<u32>,

    /// Whether the raw value is sign-extended from `bit_size`.
    pub signed: bool,

    /// Scale factor applied to the raw value.
    pub factor: f64,

    /// Unit text, informational only.
    pub unit: Option<String>,

    /// Optional format tag.
    pub format: Option<FieldFormat>,
}

impl FieldSpec {
    /// Create an unsigned, unscaled field.
    pub fn new(name: &str, offset: usize, bit_size: u8) -> FieldSpec {
        FieldSpec {
            name: name.to_string(),
            offset,
            bit_size,
            mask: None,
            signed: false,
            factor: 1.0,
            unit: None,
            format: None,
        }
    }

    /// Number of payload bytes the field occupies.
    pub fn width(&self) -> usize {
        (usize::from(self.bit_size) + 7) / 8
    }

    fn value_bits(&self) -> u32 {
        if self.bit_size >= 32 {
            u32::MAX
        } else {
            (1_u32 << self.bit_size) - 1
        }
    }

    /// Whether the field is a time-of-day field.
    pub fn is_time_of_day(&self) -> bool {
        matches!(self.format, Some(FieldFormat::TimeOfDay))
    }

    fn payload_range(&self) -> Option<std::ops::Range<usize>> {
        if self.bit_size == 0 || self.bit_size > 32 {
            return None;
        }
        Some(self.offset..self.offset.checked_add(self.width())?)
    }

    /// Check the field's own invariants: a bit size of 1 to 32 that fits,
    /// together with the offset, inside the maximum payload.
    pub fn validate(&self) -> Result<()> {
        if self.bit_size == 0 || self.bit_size > 32 {
            return Err(Error::ConfigLoad(format!(
                "field {:?} has invalid bitSize {}",
                self.name, self.bit_size
            )));
        }

        match self.payload_range() {
            Some(range) if range.end <= MAX_PAYLOAD_LEN => Ok(()),
            _ => Err(Error::ConfigLoad(format!(
                "field {:?} exceeds the maximum payload length",
                self.name
            ))),
        }
    }

    /// Read the masked raw integer from `payload`, or `None` if the payload is
    /// too short or the field is invalid.
    pub fn raw_value(&self, payload: &[u8]) -> Option<i64> {
        let bytes = payload.get(self.payload_range()?)?;

        let raw = bytes
            .iter()
            .rev()
            .fold(0_u32, |acc, b| (acc << 8) | u32::from(*b));

        let mut raw = raw & self.value_bits();
        if let Some(mask) = self.mask {
            raw &= mask;
        }

        let value = if self.signed && self.bit_size < 32 {
            let shift = 32 - u32::from(self.bit_size);
            i64::from(((raw << shift) as i32) >> shift)
        } else if self.signed {
            i64::from(raw as i32)
        } else {
            i64::from(raw)
        };

        Some(value)
    }

    /// Read and scale the field's value from `payload`.
    ///
    /// The result is rounded to the number of decimal places of the factor,
    /// so a raw `245` with factor `0.1` yields exactly `24.5`.
    pub fn decode(&self, payload: &[u8]) -> Option<f64> {
        let raw = self.raw_value(payload)?;
        Some(round_to_factor(raw as f64 * self.factor, self.factor))
    }

    /// Read the field and convert it into a publishable `Value`.
    pub fn value(&self, payload: &[u8]) -> Option<Value> {
        let value = self.decode(payload)?;
        if self.is_time_of_day() {
            Some(Value::from_minutes(value))
        } else {
            Some(Value::Decimal(value))
        }
    }

    /// Write `value` into `payload` (the inverse of `decode`). Bits outside the
    /// field's mask are preserved. Returns `false` if the payload is too short.
    pub fn encode(&self, value: f64, payload: &mut [u8]) -> bool {
        let bytes = match self.payload_range().and_then(|range| payload.get_mut(range)) {
            Some(bytes) => bytes,
            None => return false,
        };

        let raw = if self.factor != 0.0 {
            (value / self.factor).round() as i64
        } else {
            0
        };

        let mask = self.value_bits() & self.mask.unwrap_or(u32::MAX);
        let existing = bytes
            .iter()
            .rev()
            .fold(0_u32, |acc, b| (acc << 8) | u32::from(*b));
        let combined = (existing & !mask) | ((raw as u32) & mask);

        for (idx, b) in bytes.iter_mut().enumerate() {
            *b = (combined >> (idx * 8)) as u8;
        }

        true
    }

    fn from_element(element: &FieldElement) -> Result<FieldSpec> {
        let mask = match element.mask {
            Some(ref mask) => Some(parse_number(mask).ok_or_else(|| {
                Error::ConfigLoad(format!("field {:?} has invalid mask {:?}", element.name, mask))
            })?),
            None => None,
        };

        Ok(FieldSpec {
            name: element.name.clone(),
            offset: element.offset,
            bit_size: element.bit_size,
            mask,
            signed: element.signed.unwrap_or(false),
            factor: element.factor.unwrap_or(1.0),
            unit: element.unit.clone(),
            format: element.format.as_deref().map(FieldFormat::parse),
        })
    }
}

fn decimal_places(factor: f64) -> i32 {
    let text = format!("{}", factor.abs());
    match text.find('.') {
        Some(idx) => ((text.len() - idx - 1) as i32).min(9),
        None => 0,
    }
}

fn round_to_factor(value: f64, factor: f64) -> f64 {
    let scale = 10_f64.powi(decimal_places(factor));
    (value * scale).round() / scale
}

/// Describes all fields of the packet identified by a (source, destination) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct PacketSpec {
    /// Source address.
    pub source_address: u16,

    /// Destination address.
    pub destination_address: u16,

    /// If set, only packets with this command match.
    pub command: Option<u16>,

    /// The packet's fields in document order.
    pub fields: Vec<FieldSpec>,
}

impl PacketSpec {
    /// Create an empty packet spec.
    pub fn new(source_address: u16, destination_address: u16) -> PacketSpec {
        PacketSpec {
            source_address,
            destination_address,
            command: None,
            fields: Vec::new(),
        }
    }

    /// Look up a field by name.
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|field| field.name == name)
    }

    /// Whether this spec describes `packet`.
    pub fn matches(&self, packet: &Packet) -> bool {
        self.source_address == packet.source_address
            && self.destination_address == packet.destination_address
            && self.command.map_or(true, |command| command == packet.command)
    }

    /// Check every field and that field names are unique within the packet.
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for field in &self.fields {
            field.validate()?;
            if !names.insert(field.name.as_str()) {
                return Err(Error::ConfigLoad(format!(
                    "duplicate field {:?} in packet 0x{:04X} -> 0x{:04X}",
                    field.name, self.source_address, self.destination_address
                )));
            }
        }
        Ok(())
    }

    fn from_element(element: &PacketElement) -> Result<PacketSpec> {
        let address = |text: &str, what: &str| {
            parse_number(text)
                .filter(|value| *value <= u32::from(u16::MAX))
                .map(|value| value as u16)
                .ok_or_else(|| Error::ConfigLoad(format!("invalid {} address {:?}", what, text)))
        };

        let mut spec = PacketSpec::new(
            address(&element.source, "source")?,
            address(&element.destination, "destination")?,
        );

        if let Some(ref command) = element.command {
            spec.command = Some(address(command, "command")?);
        }

        spec.fields = element
            .fields
            .iter()
            .map(|tag| FieldSpec::from_element(tag.element()))
            .collect::<Result<Vec<_>>>()?;

        Ok(spec)
    }
}

/// The complete, validated decoding specification for one controller model.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSpec {
    /// Device identifier.
    pub id: String,

    /// Human readable device name.
    pub name: Option<String>,

    /// The packets of this device.
    pub packets: Vec<PacketSpec>,
}

impl DeviceSpec {
    /// Build a device spec, validating every packet and checking that each
    /// (source, destination) pair is unique.
    pub fn new(id: &str, packets: Vec<PacketSpec>) -> Result<DeviceSpec> {
        let mut pairs = HashSet::new();
        for packet in &packets {
            packet.validate()?;
            if !pairs.insert((packet.source_address, packet.destination_address)) {
                return Err(Error::ConfigLoad(format!(
                    "duplicate packet 0x{:04X} -> 0x{:04X}",
                    packet.source_address, packet.destination_address
                )));
            }
        }

        Ok(DeviceSpec {
            id: id.to_string(),
            name: None,
            packets,
        })
    }

    /// Validate a parsed device definition document.
    pub fn from_definition(definition: &DeviceDefinition) -> Result<DeviceSpec> {
        let packets = definition
            .device
            .packets
            .iter()
            .map(PacketSpec::from_element)
            .collect::<Result<Vec<_>>>()?;

        let mut spec = DeviceSpec::new(&definition.device.id, packets)?;
        spec.name = definition.device.name.clone();
        Ok(spec)
    }

    /// Parse and validate a device definition document.
    pub fn from_xml(xml: &str) -> Result<DeviceSpec> {
        DeviceSpec::from_definition(&DeviceDefinition::from_xml(xml)?)
    }

    /// Find the packet spec describing `packet`.
    pub fn packet_spec(&self, packet: &Packet) -> Option<&PacketSpec> {
        self.packets.iter().find(|spec| spec.matches(packet))
    }
}

/// Holds the currently active `DeviceSpec`.
///
/// Reconfiguration replaces the whole spec at once; readers get an `Arc` to
/// either the old or the new spec, never a mixture.
#[derive(Debug, Clone, Default)]
pub struct SpecSlot {
    inner: Arc<RwLock<Option<Arc<DeviceSpec>>>>,
}

impl SpecSlot {
    /// Create an empty slot.
    pub fn new() -> SpecSlot {
        SpecSlot::default()
    }

    /// Return the active spec, if any.
    pub fn load(&self) -> Option<Arc<DeviceSpec>> {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replace the active spec.
    pub fn store(&self, spec: Option<DeviceSpec>) {
        let spec = spec.map(Arc::new);
        match self.inner.write() {
            Ok(mut guard) => *guard = spec,
            Err(poisoned) => *poisoned.into_inner() = spec,
        }
    }
}
