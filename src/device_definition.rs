use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The XML document describing how to decode the packets of one controller model.
///
/// This is the document model only: attributes are kept the way they were
/// written (e.g. `0x7E11` vs. `32273`) so that a file survives a
/// parse / serialize cycle unchanged. Use `DeviceSpec::from_definition` to
/// obtain the validated, typed form.
///
/// ```xml
/// <vbusSpecification>
///   <device id="7E11" name="DeltaSol MX">
///     <packet source="0x7E11" destination="0x0010" command="0x0100">
///       <field name="Temperature1" offset="0" bitSize="16" signed="true" factor="0.1" unit="°C"/>
///       <field name="SystemTime" offset="4" bitSize="16" format="t"/>
///       <value name="Pump1" offset="8" bitSize="8" unit="%"/>
///     </packet>
///   </device>
/// </vbusSpecification>
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename = "vbusSpecification")]
pub struct DeviceDefinition {
    /// The single device described by this document.
    pub device: DeviceElement,
}

/// The `<device>` element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceElement {
    /// Device identifier.
    #[serde(rename = "@id")]
    pub id: String,

    /// Human readable device name.
    #[serde(rename = "@name", default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// The packets this device sends.
    #[serde(rename = "packet", default)]
    pub packets: Vec<PacketElement>,
}

/// The `<packet>` element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketElement {
    /// Source address, decimal or `0x` hex.
    #[serde(rename = "@source")]
    pub source: String,

    /// Destination address, decimal or `0x` hex.
    #[serde(rename = "@destination")]
    pub destination: String,

    /// Optional command the packet must carry.
    #[serde(rename = "@command", default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// The fields inside the packet payload, in document order.
    #[serde(rename = "$value", default)]
    pub fields: Vec<FieldTag>,
}

/// A field child of `<packet>`. Both element names describe the same thing;
/// the one used is kept so that serializing writes it back unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldTag {
    /// A `<field>` element.
    #[serde(rename = "field")]
    Field(FieldElement),

    /// A `<value>` element.
    #[serde(rename = "value")]
    Value(FieldElement),
}

impl FieldTag {
    /// The field description regardless of the element name.
    pub fn element(&self) -> &FieldElement {
        match self {
            FieldTag::Field(element) | FieldTag::Value(element) => element,
        }
    }
}

/// The attributes of a `<field>` or `<value>` element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldElement {
    /// Field name, referenced by item bindings.
    #[serde(rename = "@name")]
    pub name: String,

    /// Byte offset into the payload.
    #[serde(rename = "@offset")]
    pub offset: usize,

    /// Number of significant bits.
    #[serde(rename = "@bitSize")]
    pub bit_size: u8,

    /// Optional bit mask applied to the raw value, decimal or `0x` hex.
    #[serde(rename = "@mask", default, skip_serializing_if = "Option::is_none")]
    pub mask: Option<String>,

    /// Whether the raw value is two's complement.
    #[serde(rename = "@signed", default, skip_serializing_if = "Option::is_none")]
    pub signed: Option<bool>,

    /// Scale factor, defaults to `1`.
    #[serde(rename = "@factor", default, skip_serializing_if = "Option::is_none")]
    pub factor: Option<f64>,

    /// Unit text, informational only.
    #[serde(rename = "@unit", default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,

    /// Format tag, `t` marks a time-of-day in minutes.
    #[serde(rename = "@format", default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

impl DeviceDefinition {
    /// Parse a device definition document.
    pub fn from_xml(xml: &str) -> Result<DeviceDefinition> {
        Ok(quick_xml::de::from_str(xml)?)
    }

    /// Serialize the device definition back into a document.
    pub fn to_xml(&self) -> Result<String> {
        quick_xml::se::to_string(self).map_err(|err| Error::ConfigLoad(err.to_string()))
    }
}

/// Parse a number written in decimal or with a `0x` prefix in hex.
pub(crate) fn parse_number(text: &str) -> Option<u32> {
    let text = text.trim();
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else {
        text.parse().ok()
    }
}
