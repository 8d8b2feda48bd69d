//! Protocol messages exchanged with management servers.

use crate::element::{ContentElement, DeviceIdentity};
use crate::error::{ProtocolError, ProtocolResult};
use crate::value::{from_bytes, map, opt_text, text, to_bytes, uint, Fields};
use ciborium::value::Value;

/// The content tree of one outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Message ID, echoed by the server and used to reconcile the queue.
    pub message_id: u64,
    /// Protocol version.
    pub protocol_version: u16,
    /// Content elements, in the order they were added.
    pub elements: Vec<ContentElement>,
}

impl Envelope {
    /// Creates an empty envelope.
    pub fn new(message_id: u64, protocol_version: u16) -> Self {
        Self {
            message_id,
            protocol_version,
            elements: Vec::new(),
        }
    }

    pub(crate) fn to_value(&self) -> Value {
        map(vec![
            ("message_id", uint(self.message_id)),
            ("protocol_version", uint(u64::from(self.protocol_version))),
            (
                "elements",
                Value::Array(self.elements.iter().map(ContentElement::to_value).collect()),
            ),
        ])
    }

    pub(crate) fn from_value(value: &Value) -> ProtocolResult<Self> {
        let fields = Fields::of(value, "envelope")?;
        let protocol_version = u16::try_from(fields.opt_uint("protocol_version").unwrap_or(1))
            .map_err(|_| ProtocolError::invalid_structure("protocol_version out of range"))?;
        let elements = fields
            .array("elements")?
            .iter()
            .map(ContentElement::from_value)
            .collect::<ProtocolResult<Vec<_>>>()?;

        Ok(Self {
            message_id: fields.uint("message_id")?,
            protocol_version,
            elements,
        })
    }
}

/// Which devices a status record applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusScope {
    /// Applies to every device bound to the location that answered.
    Global,
    /// Applies to one device.
    Device(DeviceIdentity),
}

/// Outcome of a server-issued command, filled in by the host application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandStatus {
    /// Command executed.
    Success,
    /// Command accepted, will complete later.
    Deferred,
    /// Command or its parameters are invalid.
    Invalid,
    /// Command not supported by this agent.
    #[default]
    NotImplemented,
}

impl CommandStatus {
    /// Converts to a numeric code for CBOR encoding.
    pub fn to_code(&self) -> u8 {
        match self {
            CommandStatus::Success => 0,
            CommandStatus::Deferred => 1,
            CommandStatus::Invalid => 2,
            CommandStatus::NotImplemented => 3,
        }
    }

    /// Converts from a numeric code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(CommandStatus::Success),
            1 => Some(CommandStatus::Deferred),
            2 => Some(CommandStatus::Invalid),
            3 => Some(CommandStatus::NotImplemented),
            _ => None,
        }
    }
}

/// A command issued by the server inside a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerCommand {
    /// Change the ping interval, optionally only for a limited time.
    SetPingRate {
        /// New ping interval, in seconds.
        rate_secs: u64,
        /// How long the new rate applies before reverting, in seconds.
        duration_secs: Option<u64>,
    },
    /// Restart the device.
    Restart {
        /// Whether a hard (power-cycle) restart is requested.
        hard: bool,
    },
    /// Application-defined command dispatched to the host.
    Custom {
        /// Server-side command identifier, echoed back with the status.
        command_id: String,
        /// Command name.
        name: String,
        /// Named parameters.
        parameters: Vec<(String, String)>,
    },
}

/// State code of a status record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusCode {
    /// The request was accepted.
    Success,
    /// The device is not registered with this server.
    NotRegistered,
    /// Switch to maintenance mode.
    EnterMaintenanceMode {
        /// Maintenance endpoint; missing parts default to the current endpoint.
        url: Option<String>,
        /// Maintenance ping interval, in seconds.
        ping_rate_secs: u64,
    },
    /// Remain in maintenance mode.
    StayInMaintenanceMode,
    /// Leave maintenance mode.
    ExitMaintenanceMode {
        /// Normal-mode endpoint; missing parts default to the current endpoint.
        url: Option<String>,
        /// New owner to adopt, if any.
        owner: Option<String>,
    },
    /// A server-issued command.
    Command(ServerCommand),
}

impl StatusCode {
    fn code(&self) -> &'static str {
        match self {
            StatusCode::Success => "success",
            StatusCode::NotRegistered => "not_registered",
            StatusCode::EnterMaintenanceMode { .. } => "enter_maintenance",
            StatusCode::StayInMaintenanceMode => "stay_maintenance",
            StatusCode::ExitMaintenanceMode { .. } => "exit_maintenance",
            StatusCode::Command(ServerCommand::SetPingRate { .. }) => "set_ping_rate",
            StatusCode::Command(ServerCommand::Restart { .. }) => "restart",
            StatusCode::Command(ServerCommand::Custom { .. }) => "command",
        }
    }
}

/// One parsed outcome from a response document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRecord {
    /// Devices the record applies to.
    pub scope: StatusScope,
    /// What happened.
    pub code: StatusCode,
}

impl StatusRecord {
    /// Creates a global status record.
    pub fn global(code: StatusCode) -> Self {
        Self {
            scope: StatusScope::Global,
            code,
        }
    }

    /// Creates a device-scoped status record.
    pub fn device(device: DeviceIdentity, code: StatusCode) -> Self {
        Self {
            scope: StatusScope::Device(device),
            code,
        }
    }

    pub(crate) fn to_value(&self) -> Value {
        let mut pairs = vec![("code", text(self.code.code()))];
        if let StatusScope::Device(device) = &self.scope {
            pairs.push(("device", device.to_value()));
        }
        match &self.code {
            StatusCode::EnterMaintenanceMode {
                url,
                ping_rate_secs,
            } => {
                pairs.push(("url", opt_text(url.as_deref())));
                pairs.push(("ping_rate", uint(*ping_rate_secs)));
            }
            StatusCode::ExitMaintenanceMode { url, owner } => {
                pairs.push(("url", opt_text(url.as_deref())));
                pairs.push(("owner", opt_text(owner.as_deref())));
            }
            StatusCode::Command(ServerCommand::SetPingRate {
                rate_secs,
                duration_secs,
            }) => {
                pairs.push(("ping_rate", uint(*rate_secs)));
                pairs.push(("duration", duration_secs.map_or(Value::Null, uint)));
            }
            StatusCode::Command(ServerCommand::Restart { hard }) => {
                pairs.push(("hard", Value::Bool(*hard)));
            }
            StatusCode::Command(ServerCommand::Custom {
                command_id,
                name,
                parameters,
            }) => {
                pairs.push(("command_id", text(command_id.as_str())));
                pairs.push(("name", text(name.as_str())));
                pairs.push((
                    "parameters",
                    Value::Map(
                        parameters
                            .iter()
                            .map(|(k, v)| (text(k.as_str()), text(v.as_str())))
                            .collect(),
                    ),
                ));
            }
            StatusCode::Success | StatusCode::NotRegistered | StatusCode::StayInMaintenanceMode => {
            }
        }
        map(pairs)
    }

    pub(crate) fn from_value(value: &Value) -> ProtocolResult<Self> {
        let fields = Fields::of(value, "status")?;
        let scope = match fields.get("device") {
            Some(device) => StatusScope::Device(DeviceIdentity::from_value(device)?),
            None => StatusScope::Global,
        };

        let code = match fields.text("code")? {
            "success" => StatusCode::Success,
            "not_registered" => StatusCode::NotRegistered,
            "enter_maintenance" => StatusCode::EnterMaintenanceMode {
                url: fields.opt_text("url"),
                ping_rate_secs: fields.uint("ping_rate")?,
            },
            "stay_maintenance" => StatusCode::StayInMaintenanceMode,
            "exit_maintenance" => StatusCode::ExitMaintenanceMode {
                url: fields.opt_text("url"),
                owner: fields.opt_text("owner"),
            },
            "set_ping_rate" => StatusCode::Command(ServerCommand::SetPingRate {
                rate_secs: fields.uint("ping_rate")?,
                duration_secs: fields.opt_uint("duration"),
            }),
            "restart" => StatusCode::Command(ServerCommand::Restart {
                hard: fields.get("hard").and_then(Value::as_bool).unwrap_or(false),
            }),
            "command" => {
                let parameters = match fields.get("parameters") {
                    Some(params) => params
                        .as_map()
                        .ok_or_else(|| ProtocolError::invalid_structure("parameters: expected map"))?
                        .iter()
                        .map(|(k, v)| match (k.as_text(), v.as_text()) {
                            (Some(k), Some(v)) => Ok((k.to_owned(), v.to_owned())),
                            _ => Err(ProtocolError::invalid_structure(
                                "parameters: expected text pairs",
                            )),
                        })
                        .collect::<ProtocolResult<Vec<_>>>()?,
                    None => Vec::new(),
                };
                StatusCode::Command(ServerCommand::Custom {
                    command_id: fields.text("command_id")?.to_owned(),
                    name: fields.text("name")?.to_owned(),
                    parameters,
                })
            }
            other => return Err(ProtocolError::unknown_code("status", other)),
        };

        Ok(Self { scope, code })
    }
}

/// Status of a server command, posted back to the server as queued data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandStatusEcho {
    /// Server-side command identifier.
    pub command_id: String,
    /// Outcome reported by the host.
    pub status: CommandStatus,
}

impl CommandStatusEcho {
    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        to_bytes(&map(vec![
            ("command_id", text(self.command_id.as_str())),
            ("status", uint(u64::from(self.status.to_code()))),
        ]))
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        let value = from_bytes(bytes)?;
        let fields = Fields::of(&value, "command status")?;
        let code = fields.uint("status")?;
        let status = u8::try_from(code)
            .ok()
            .and_then(CommandStatus::from_code)
            .ok_or_else(|| ProtocolError::unknown_code("command status", code))?;

        Ok(Self {
            command_id: fields.text("command_id")?.to_owned(),
            status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::ElementBody;

    #[test]
    fn envelope_value_round_trip() {
        let mut envelope = Envelope::new(7, 1);
        envelope.elements.push(ContentElement::new(
            DeviceIdentity::new("gw", "1"),
            ElementBody::Ping,
        ));
        envelope.elements.push(ContentElement::new(
            DeviceIdentity::new("gw", "1"),
            ElementBody::Data(vec![1, 2, 3]),
        ));

        let decoded = Envelope::from_value(&envelope.to_value()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn status_without_device_is_global() {
        let value = map(vec![("code", text("success"))]);
        let record = StatusRecord::from_value(&value).unwrap();
        assert_eq!(record.scope, StatusScope::Global);
        assert_eq!(record.code, StatusCode::Success);
    }

    #[test]
    fn enter_maintenance_without_url() {
        let record = StatusRecord::device(
            DeviceIdentity::new("pump", "7"),
            StatusCode::EnterMaintenanceMode {
                url: None,
                ping_rate_secs: 300,
            },
        );
        let decoded = StatusRecord::from_value(&record.to_value()).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn custom_command_parameters() {
        let record = StatusRecord::global(StatusCode::Command(ServerCommand::Custom {
            command_id: "c-1".into(),
            name: "set_valve".into(),
            parameters: vec![("position".into(), "open".into())],
        }));
        let decoded = StatusRecord::from_value(&record.to_value()).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn unknown_status_code_rejected() {
        let value = map(vec![("code", text("explode"))]);
        assert!(matches!(
            StatusRecord::from_value(&value),
            Err(ProtocolError::UnknownCode { .. })
        ));
    }

    #[test]
    fn command_status_echo_encoding() {
        let echo = CommandStatusEcho {
            command_id: "c-9".into(),
            status: CommandStatus::Deferred,
        };
        let decoded = CommandStatusEcho::decode(&echo.encode().unwrap()).unwrap();
        assert_eq!(decoded, echo);
    }

    #[test]
    fn command_status_defaults_to_not_implemented() {
        assert_eq!(CommandStatus::default(), CommandStatus::NotImplemented);
    }
}
