//! Content elements carried by outbound messages.

use crate::error::{ProtocolError, ProtocolResult};
use crate::value::{map, text, uint, Fields};
use ciborium::value::Value;

/// Kind of content element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementKind {
    /// Device registration with a server.
    Registration,
    /// Periodic liveness ping.
    Ping,
    /// Device online/offline state change notice.
    OnlineNotice,
    /// Queued application data (alarms, events, telemetry).
    Data,
    /// Ping sent while a device is in maintenance mode.
    MaintenancePing,
    /// Descriptor batch for the devices managed by the master device.
    ManagedDevices,
    /// Acknowledgement of a ping-rate change.
    PingRateAck,
}

impl ElementKind {
    /// Converts to a numeric code for CBOR encoding.
    pub fn to_code(&self) -> u8 {
        match self {
            ElementKind::Registration => 1,
            ElementKind::Ping => 2,
            ElementKind::OnlineNotice => 3,
            ElementKind::Data => 4,
            ElementKind::MaintenancePing => 5,
            ElementKind::ManagedDevices => 6,
            ElementKind::PingRateAck => 7,
        }
    }

    /// Converts from a numeric code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(ElementKind::Registration),
            2 => Some(ElementKind::Ping),
            3 => Some(ElementKind::OnlineNotice),
            4 => Some(ElementKind::Data),
            5 => Some(ElementKind::MaintenancePing),
            6 => Some(ElementKind::ManagedDevices),
            7 => Some(ElementKind::PingRateAck),
            _ => None,
        }
    }

    /// Returns true for elements generated by the agent itself rather than
    /// drawn from the outbound queue.
    pub fn is_control(&self) -> bool {
        !matches!(self, ElementKind::Data)
    }
}

/// Identity of a managed device as the server knows it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceIdentity {
    /// Model number.
    pub model: String,
    /// Serial number.
    pub serial: String,
}

impl std::fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.model, self.serial)
    }
}

impl DeviceIdentity {
    /// Creates a device identity.
    pub fn new(model: impl Into<String>, serial: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            serial: serial.into(),
        }
    }

    pub(crate) fn to_value(&self) -> Value {
        map(vec![
            ("model", text(self.model.as_str())),
            ("serial", text(self.serial.as_str())),
        ])
    }

    pub(crate) fn from_value(value: &Value) -> ProtocolResult<Self> {
        let fields = Fields::of(value, "device")?;
        Ok(Self::new(fields.text("model")?, fields.text("serial")?))
    }
}

/// Kind-specific payload of a content element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElementBody {
    /// Registration request.
    Registration {
        /// Owner (account) of the registering device.
        owner: String,
        /// Owner of the master device.
        master_owner: String,
        /// Ping interval the agent intends to use, in seconds.
        ping_rate_secs: u64,
    },
    /// Liveness ping.
    Ping,
    /// Online state notice.
    OnlineNotice {
        /// Whether the device is currently online.
        online: bool,
    },
    /// Opaque application data, already serialized by the producer.
    Data(Vec<u8>),
    /// Maintenance-mode ping.
    MaintenancePing,
    /// Devices currently managed by the master device.
    ManagedDevices(Vec<DeviceIdentity>),
    /// Acknowledges the ping rate now in effect.
    PingRateAck {
        /// Ping interval now in effect, in seconds.
        ping_rate_secs: u64,
    },
}

impl ElementBody {
    /// Returns the element kind of this body.
    pub fn kind(&self) -> ElementKind {
        match self {
            ElementBody::Registration { .. } => ElementKind::Registration,
            ElementBody::Ping => ElementKind::Ping,
            ElementBody::OnlineNotice { .. } => ElementKind::OnlineNotice,
            ElementBody::Data(_) => ElementKind::Data,
            ElementBody::MaintenancePing => ElementKind::MaintenancePing,
            ElementBody::ManagedDevices(_) => ElementKind::ManagedDevices,
            ElementBody::PingRateAck { .. } => ElementKind::PingRateAck,
        }
    }
}

/// A typed piece of an outbound message, tagged with the device it speaks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentElement {
    /// Device this element belongs to.
    pub device: DeviceIdentity,
    /// Element payload.
    pub body: ElementBody,
}

/// Fixed per-element framing allowance used by [`ContentElement::size_hint`].
const ELEMENT_FRAMING: usize = 32;

impl ContentElement {
    /// Creates a content element.
    pub fn new(device: DeviceIdentity, body: ElementBody) -> Self {
        Self { device, body }
    }

    /// Returns the element kind.
    pub fn kind(&self) -> ElementKind {
        self.body.kind()
    }

    /// Upper-bound estimate of the encoded size, used for message capacity checks.
    pub fn size_hint(&self) -> usize {
        let identity = self.device.model.len() + self.device.serial.len();
        let body = match &self.body {
            ElementBody::Registration {
                owner,
                master_owner,
                ..
            } => owner.len() + master_owner.len() + 16,
            ElementBody::Data(bytes) => bytes.len() + 8,
            ElementBody::ManagedDevices(devices) => devices
                .iter()
                .map(|d| d.model.len() + d.serial.len() + 16)
                .sum(),
            ElementBody::Ping
            | ElementBody::OnlineNotice { .. }
            | ElementBody::MaintenancePing
            | ElementBody::PingRateAck { .. } => 8,
        };
        ELEMENT_FRAMING + identity + body
    }

    pub(crate) fn to_value(&self) -> Value {
        let mut pairs = vec![
            ("kind", uint(u64::from(self.kind().to_code()))),
            ("device", self.device.to_value()),
        ];
        match &self.body {
            ElementBody::Registration {
                owner,
                master_owner,
                ping_rate_secs,
            } => {
                pairs.push(("owner", text(owner.as_str())));
                pairs.push(("master_owner", text(master_owner.as_str())));
                pairs.push(("ping_rate", uint(*ping_rate_secs)));
            }
            ElementBody::OnlineNotice { online } => pairs.push(("online", Value::Bool(*online))),
            ElementBody::Data(bytes) => pairs.push(("data", Value::Bytes(bytes.clone()))),
            ElementBody::ManagedDevices(devices) => pairs.push((
                "devices",
                Value::Array(devices.iter().map(DeviceIdentity::to_value).collect()),
            )),
            ElementBody::PingRateAck { ping_rate_secs } => {
                pairs.push(("ping_rate", uint(*ping_rate_secs)))
            }
            ElementBody::Ping | ElementBody::MaintenancePing => {}
        }
        map(pairs)
    }

    pub(crate) fn from_value(value: &Value) -> ProtocolResult<Self> {
        let fields = Fields::of(value, "element")?;
        let code = fields.uint("kind")?;
        let kind = u8::try_from(code)
            .ok()
            .and_then(ElementKind::from_code)
            .ok_or_else(|| ProtocolError::unknown_code("element kind", code))?;
        let device = DeviceIdentity::from_value(fields.require("device")?)?;

        let body = match kind {
            ElementKind::Registration => ElementBody::Registration {
                owner: fields.text("owner")?.to_owned(),
                master_owner: fields.text("master_owner")?.to_owned(),
                ping_rate_secs: fields.uint("ping_rate")?,
            },
            ElementKind::Ping => ElementBody::Ping,
            ElementKind::OnlineNotice => ElementBody::OnlineNotice {
                online: fields.bool("online")?,
            },
            ElementKind::Data => ElementBody::Data(fields.bytes("data")?.to_vec()),
            ElementKind::MaintenancePing => ElementBody::MaintenancePing,
            ElementKind::ManagedDevices => ElementBody::ManagedDevices(
                fields
                    .array("devices")?
                    .iter()
                    .map(DeviceIdentity::from_value)
                    .collect::<ProtocolResult<Vec<_>>>()?,
            ),
            ElementKind::PingRateAck => ElementBody::PingRateAck {
                ping_rate_secs: fields.uint("ping_rate")?,
            },
        };

        Ok(Self { device, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_codes_are_stable() {
        for kind in [
            ElementKind::Registration,
            ElementKind::Ping,
            ElementKind::OnlineNotice,
            ElementKind::Data,
            ElementKind::MaintenancePing,
            ElementKind::ManagedDevices,
            ElementKind::PingRateAck,
        ] {
            assert_eq!(ElementKind::from_code(kind.to_code()), Some(kind));
        }
        assert_eq!(ElementKind::from_code(0), None);
        assert_eq!(ElementKind::from_code(99), None);
    }

    #[test]
    fn only_data_is_not_control() {
        assert!(!ElementKind::Data.is_control());
        assert!(ElementKind::Registration.is_control());
        assert!(ElementKind::ManagedDevices.is_control());
    }

    #[test]
    fn size_hint_grows_with_payload() {
        let device = DeviceIdentity::new("pump", "0001");
        let small = ContentElement::new(device.clone(), ElementBody::Data(vec![0; 10]));
        let large = ContentElement::new(device, ElementBody::Data(vec![0; 1000]));
        assert!(large.size_hint() >= small.size_hint() + 990);
    }

    #[test]
    fn registration_value_carries_both_owners() {
        let element = ContentElement::new(
            DeviceIdentity::new("pump", "0001"),
            ElementBody::Registration {
                owner: "acme".into(),
                master_owner: "acme-gw".into(),
                ping_rate_secs: 60,
            },
        );
        let decoded = ContentElement::from_value(&element.to_value()).unwrap();
        assert_eq!(decoded, element);
    }

    #[test]
    fn unknown_kind_rejected() {
        let value = map(vec![
            ("kind", uint(200)),
            ("device", DeviceIdentity::new("m", "s").to_value()),
        ]);
        assert!(matches!(
            ContentElement::from_value(&value),
            Err(ProtocolError::UnknownCode { .. })
        ));
    }
}
