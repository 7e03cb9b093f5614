//! Wire envelope for client commands and server notifications.
//!
//! Every frame is a JSON object `{"type": <integer>, "data": <payload>}`.
//! Decoding reads the `type` discriminant first and then decodes `data`
//! with the schema that discriminant selects. An unknown discriminant is a
//! decode failure; the server treats any decode failure as fatal to the
//! connection.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ProtocolError;
use crate::state::{
    AudioState, JoypadState, MemoryWrite, ProcessorState, RunHalted, VideoState,
};

/// Inbound message discriminants.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandType {
    /// Implicit connection hello; carries no data.
    Connect,
    /// Execute one instruction.
    Step,
    /// Start continuous execution.
    Run,
    /// Reset the machine.
    Reset,
    /// Stop continuous execution.
    Stop,
    /// Load a ROM by identifier or raw bytes.
    LoadRom,
    /// Save machine state to a slot.
    SaveState,
    /// Restore machine state from a slot.
    LoadState,
    /// Submit button state.
    JoypadInput,
    /// Add a breakpoint.
    AddBreakpoint,
    /// Remove a breakpoint.
    RemoveBreakpoint,
    /// Enable a breakpoint.
    EnableBreakpoint,
    /// Disable a breakpoint.
    DisableBreakpoint,
    /// Enable every breakpoint.
    EnableAllBreakpoints,
    /// Disable every breakpoint.
    DisableAllBreakpoints,
}

impl CommandType {
    /// Every command type, in wire-code order.
    pub const ALL: [Self; 15] = [
        Self::Connect,
        Self::Step,
        Self::Run,
        Self::Reset,
        Self::Stop,
        Self::LoadRom,
        Self::SaveState,
        Self::LoadState,
        Self::JoypadInput,
        Self::AddBreakpoint,
        Self::RemoveBreakpoint,
        Self::EnableBreakpoint,
        Self::DisableBreakpoint,
        Self::EnableAllBreakpoints,
        Self::DisableAllBreakpoints,
    ];

    /// Wire discriminant.
    pub fn code(self) -> u64 {
        match self {
            Self::Connect => 0,
            Self::Step => 10,
            Self::Run => 11,
            Self::Reset => 12,
            Self::Stop => 13,
            Self::LoadRom => 20,
            Self::SaveState => 21,
            Self::LoadState => 22,
            Self::JoypadInput => 30,
            Self::AddBreakpoint => 40,
            Self::RemoveBreakpoint => 41,
            Self::EnableBreakpoint => 42,
            Self::DisableBreakpoint => 43,
            Self::EnableAllBreakpoints => 44,
            Self::DisableAllBreakpoints => 45,
        }
    }

    /// Look up a discriminant.
    pub fn from_code(code: u64) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.code() == code)
    }

    /// Kebab-case name used in logs and metric labels.
    pub fn name(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Step => "step",
            Self::Run => "run",
            Self::Reset => "reset",
            Self::Stop => "stop",
            Self::LoadRom => "load-rom",
            Self::SaveState => "save-state",
            Self::LoadState => "load-state",
            Self::JoypadInput => "joypad-input",
            Self::AddBreakpoint => "add-breakpoint",
            Self::RemoveBreakpoint => "remove-breakpoint",
            Self::EnableBreakpoint => "enable-breakpoint",
            Self::DisableBreakpoint => "disable-breakpoint",
            Self::EnableAllBreakpoints => "enable-all-breakpoints",
            Self::DisableAllBreakpoints => "disable-all-breakpoints",
        }
    }
}

/// Where a ROM image comes from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RomSource {
    /// A file name resolved by the emulator factory (e.g. `"tetris.gb"`).
    Named(String),
    /// The raw image.
    Bytes(Vec<u8>),
}

/// A decoded client command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Connection hello.
    Connect,
    /// Execute one instruction.
    Step,
    /// Start continuous execution.
    Run,
    /// Reset the machine.
    Reset,
    /// Stop continuous execution.
    Stop,
    /// Load a ROM.
    LoadRom(RomSource),
    /// Save state into a slot.
    SaveState {
        /// Target slot.
        slot: u8,
    },
    /// Restore state from a slot.
    LoadState {
        /// Source slot.
        slot: u8,
    },
    /// Submit button state.
    JoypadInput(JoypadState),
    /// Add a breakpoint at an address.
    AddBreakpoint(u16),
    /// Remove the breakpoint at an address.
    RemoveBreakpoint(u16),
    /// Enable the breakpoint at an address.
    EnableBreakpoint(u16),
    /// Disable the breakpoint at an address.
    DisableBreakpoint(u16),
    /// Enable every breakpoint.
    EnableAllBreakpoints,
    /// Disable every breakpoint.
    DisableAllBreakpoints,
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: u64,
    #[serde(default)]
    data: Value,
}

#[derive(Serialize)]
struct Envelope<'a, T: Serialize + ?Sized> {
    #[serde(rename = "type")]
    kind: u64,
    data: Option<&'a T>,
}

fn encode_envelope<T: Serialize + ?Sized>(
    code: u64,
    kind: &'static str,
    data: Option<&T>,
) -> Result<String, ProtocolError> {
    serde_json::to_string(&Envelope { kind: code, data })
        .map_err(|source| ProtocolError::Encode { kind, source })
}

fn data_as<T: DeserializeOwned>(kind: &'static str, data: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(data).map_err(|source| ProtocolError::InvalidData { kind, source })
}

impl Command {
    /// Discriminant of this command.
    pub fn command_type(&self) -> CommandType {
        match self {
            Self::Connect => CommandType::Connect,
            Self::Step => CommandType::Step,
            Self::Run => CommandType::Run,
            Self::Reset => CommandType::Reset,
            Self::Stop => CommandType::Stop,
            Self::LoadRom(_) => CommandType::LoadRom,
            Self::SaveState { .. } => CommandType::SaveState,
            Self::LoadState { .. } => CommandType::LoadState,
            Self::JoypadInput(_) => CommandType::JoypadInput,
            Self::AddBreakpoint(_) => CommandType::AddBreakpoint,
            Self::RemoveBreakpoint(_) => CommandType::RemoveBreakpoint,
            Self::EnableBreakpoint(_) => CommandType::EnableBreakpoint,
            Self::DisableBreakpoint(_) => CommandType::DisableBreakpoint,
            Self::EnableAllBreakpoints => CommandType::EnableAllBreakpoints,
            Self::DisableAllBreakpoints => CommandType::DisableAllBreakpoints,
        }
    }

    /// Decode a raw inbound frame.
    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        let raw: RawEnvelope = serde_json::from_str(frame).map_err(ProtocolError::Envelope)?;
        let kind = CommandType::from_code(raw.kind).ok_or(ProtocolError::UnknownType(raw.kind))?;
        let name = kind.name();
        let data = raw.data;

        let command = match kind {
            CommandType::Connect => Self::Connect,
            CommandType::Step => Self::Step,
            CommandType::Run => Self::Run,
            CommandType::Reset => Self::Reset,
            CommandType::Stop => Self::Stop,
            CommandType::LoadRom => Self::LoadRom(data_as(name, data)?),
            CommandType::SaveState => Self::SaveState {
                slot: data_as::<Option<u8>>(name, data)?.unwrap_or_default(),
            },
            CommandType::LoadState => Self::LoadState {
                slot: data_as::<Option<u8>>(name, data)?.unwrap_or_default(),
            },
            CommandType::JoypadInput => Self::JoypadInput(data_as(name, data)?),
            CommandType::AddBreakpoint => Self::AddBreakpoint(data_as(name, data)?),
            CommandType::RemoveBreakpoint => Self::RemoveBreakpoint(data_as(name, data)?),
            CommandType::EnableBreakpoint => Self::EnableBreakpoint(data_as(name, data)?),
            CommandType::DisableBreakpoint => Self::DisableBreakpoint(data_as(name, data)?),
            CommandType::EnableAllBreakpoints => Self::EnableAllBreakpoints,
            CommandType::DisableAllBreakpoints => Self::DisableAllBreakpoints,
        };
        Ok(command)
    }

    /// Encode as a wire frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let kind = self.command_type();
        let (code, name) = (kind.code(), kind.name());
        match self {
            Self::LoadRom(rom) => encode_envelope(code, name, Some(rom)),
            Self::SaveState { slot } | Self::LoadState { slot } => {
                encode_envelope(code, name, Some(slot))
            }
            Self::JoypadInput(pad) => encode_envelope(code, name, Some(pad)),
            Self::AddBreakpoint(addr)
            | Self::RemoveBreakpoint(addr)
            | Self::EnableBreakpoint(addr)
            | Self::DisableBreakpoint(addr) => encode_envelope(code, name, Some(addr)),
            _ => encode_envelope::<Value>(code, name, None),
        }
    }
}

/// Outbound message discriminants.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NotificationType {
    /// Named memory-region dumps sent once after connecting.
    InitialMemoryMaps,
    /// Processor registers.
    ProcessorState,
    /// Memory write deltas.
    MemoryWriteSet,
    /// Video registers.
    VideoState,
    /// Audio registers.
    AudioState,
    /// Acknowledged joypad state.
    JoypadState,
    /// A run loop ended on its own.
    RunHalted,
    /// Session-level failure message.
    Error,
}

impl NotificationType {
    /// Every notification type.
    pub const ALL: [Self; 8] = [
        Self::InitialMemoryMaps,
        Self::ProcessorState,
        Self::MemoryWriteSet,
        Self::VideoState,
        Self::AudioState,
        Self::JoypadState,
        Self::RunHalted,
        Self::Error,
    ];

    /// Wire discriminant.
    pub fn code(self) -> u64 {
        match self {
            Self::InitialMemoryMaps => 50,
            Self::ProcessorState => 71,
            Self::MemoryWriteSet => 72,
            Self::VideoState => 73,
            Self::AudioState => 74,
            Self::JoypadState => 75,
            Self::RunHalted => 76,
            Self::Error => 90,
        }
    }

    /// Look up a discriminant.
    pub fn from_code(code: u64) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.code() == code)
    }

    /// Kebab-case name used in logs and metric labels.
    pub fn name(self) -> &'static str {
        match self {
            Self::InitialMemoryMaps => "initial-memory-maps",
            Self::ProcessorState => "processor-state",
            Self::MemoryWriteSet => "memory-write-set",
            Self::VideoState => "video-state",
            Self::AudioState => "audio-state",
            Self::JoypadState => "joypad-state",
            Self::RunHalted => "run-halted",
            Self::Error => "error",
        }
    }
}

/// A server notification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notification {
    /// Named memory-region dumps.
    InitialMemoryMaps(Vec<MemoryWrite>),
    /// Processor registers.
    ProcessorState(ProcessorState),
    /// Memory write deltas.
    MemoryWriteSet(Vec<MemoryWrite>),
    /// Video registers.
    VideoState(VideoState),
    /// Audio registers.
    AudioState(AudioState),
    /// Acknowledged joypad state.
    JoypadState(JoypadState),
    /// A run loop ended on its own.
    RunHalted(RunHalted),
    /// Session-level failure.
    Error(String),
}

impl Notification {
    /// Discriminant of this notification.
    pub fn notification_type(&self) -> NotificationType {
        match self {
            Self::InitialMemoryMaps(_) => NotificationType::InitialMemoryMaps,
            Self::ProcessorState(_) => NotificationType::ProcessorState,
            Self::MemoryWriteSet(_) => NotificationType::MemoryWriteSet,
            Self::VideoState(_) => NotificationType::VideoState,
            Self::AudioState(_) => NotificationType::AudioState,
            Self::JoypadState(_) => NotificationType::JoypadState,
            Self::RunHalted(_) => NotificationType::RunHalted,
            Self::Error(_) => NotificationType::Error,
        }
    }

    /// Build an error notification from anything displayable.
    pub fn error(message: impl std::fmt::Display) -> Self {
        Self::Error(message.to_string())
    }

    /// Encode as a wire frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let kind = self.notification_type();
        let (code, name) = (kind.code(), kind.name());
        match self {
            Self::InitialMemoryMaps(regions) | Self::MemoryWriteSet(regions) => {
                encode_envelope(code, name, Some(regions))
            }
            Self::ProcessorState(state) => encode_envelope(code, name, Some(state)),
            Self::VideoState(state) => encode_envelope(code, name, Some(state)),
            Self::AudioState(state) => encode_envelope(code, name, Some(state)),
            Self::JoypadState(state) => encode_envelope(code, name, Some(state)),
            Self::RunHalted(halted) => encode_envelope(code, name, Some(halted)),
            Self::Error(message) => encode_envelope(code, name, Some(message)),
        }
    }

    /// Decode a notification frame (client side).
    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        let raw: RawEnvelope = serde_json::from_str(frame).map_err(ProtocolError::Envelope)?;
        let kind =
            NotificationType::from_code(raw.kind).ok_or(ProtocolError::UnknownType(raw.kind))?;
        let name = kind.name();
        let data = raw.data;

        Ok(match kind {
            NotificationType::InitialMemoryMaps => Self::InitialMemoryMaps(data_as(name, data)?),
            NotificationType::ProcessorState => Self::ProcessorState(data_as(name, data)?),
            NotificationType::MemoryWriteSet => Self::MemoryWriteSet(data_as(name, data)?),
            NotificationType::VideoState => Self::VideoState(data_as(name, data)?),
            NotificationType::AudioState => Self::AudioState(data_as(name, data)?),
            NotificationType::JoypadState => Self::JoypadState(data_as(name, data)?),
            NotificationType::RunHalted => Self::RunHalted(data_as(name, data)?),
            NotificationType::Error => Self::Error(data_as(name, data)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::HaltReason;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn decode_value(value: &Value) -> Result<Command, ProtocolError> {
        Command::decode(&value.to_string())
    }

    #[test]
    fn decodes_breakpoint_address() {
        let cmd = decode_value(&json!({"type": 40, "data": 0x0150})).unwrap();
        assert_eq!(cmd, Command::AddBreakpoint(0x0150));
    }

    #[test]
    fn decodes_dataless_commands_without_data_field() {
        assert_eq!(Command::decode(r#"{"type":10}"#).unwrap(), Command::Step);
        assert_eq!(
            Command::decode(r#"{"type":11,"data":null}"#).unwrap(),
            Command::Run
        );
        assert_eq!(
            Command::decode(r#"{"type":45}"#).unwrap(),
            Command::DisableAllBreakpoints
        );
    }

    #[test]
    fn unknown_type_is_rejected() {
        let err = Command::decode(r#"{"type":999,"data":null}"#).unwrap_err();
        assert_matches!(err, ProtocolError::UnknownType(999));
    }

    #[test]
    fn out_of_range_address_is_invalid_data() {
        let err = decode_value(&json!({"type": 41, "data": 70000})).unwrap_err();
        assert_matches!(
            err,
            ProtocolError::InvalidData {
                kind: "remove-breakpoint",
                ..
            }
        );
    }

    #[test]
    fn negative_address_is_invalid_data() {
        let err = decode_value(&json!({"type": 42, "data": -1})).unwrap_err();
        assert_matches!(err, ProtocolError::InvalidData { .. });
    }

    #[test]
    fn missing_address_is_invalid_data() {
        let err = Command::decode(r#"{"type":40}"#).unwrap_err();
        assert_matches!(err, ProtocolError::InvalidData { .. });
    }

    #[test]
    fn non_json_is_envelope_error() {
        assert_matches!(
            Command::decode("step please"),
            Err(ProtocolError::Envelope(_))
        );
        assert_matches!(
            Command::decode(r#"{"type":"step"}"#),
            Err(ProtocolError::Envelope(_))
        );
        assert_matches!(Command::decode("42"), Err(ProtocolError::Envelope(_)));
    }

    #[test]
    fn load_rom_accepts_name_or_bytes() {
        let named = decode_value(&json!({"type": 20, "data": "tetris.gb"})).unwrap();
        assert_eq!(named, Command::LoadRom(RomSource::Named("tetris.gb".into())));

        let bytes = decode_value(&json!({"type": 20, "data": [0, 195, 80, 1]})).unwrap();
        assert_eq!(bytes, Command::LoadRom(RomSource::Bytes(vec![0, 0xC3, 0x50, 0x01])));
    }

    #[test]
    fn save_slot_defaults_to_zero() {
        let cmd = Command::decode(r#"{"type":21}"#).unwrap();
        assert_eq!(cmd, Command::SaveState { slot: 0 });
        let cmd = Command::decode(r#"{"type":22,"data":3}"#).unwrap();
        assert_eq!(cmd, Command::LoadState { slot: 3 });
    }

    #[test]
    fn joypad_decodes_button_record() {
        let cmd = decode_value(&json!({"type": 30, "data": {"right": true, "a": true}})).unwrap();
        assert_matches!(cmd, Command::JoypadInput(pad) if pad.right && pad.a && !pad.left);
    }

    #[test]
    fn every_command_round_trips() {
        let commands = [
            Command::Connect,
            Command::Step,
            Command::Run,
            Command::Reset,
            Command::Stop,
            Command::LoadRom(RomSource::Named("tetris.gb".into())),
            Command::LoadRom(RomSource::Bytes(vec![0x00, 0xFF])),
            Command::SaveState { slot: 2 },
            Command::LoadState { slot: 2 },
            Command::JoypadInput(JoypadState {
                down: true,
                b: true,
                ..JoypadState::default()
            }),
            Command::AddBreakpoint(0x0150),
            Command::RemoveBreakpoint(0x0150),
            Command::EnableBreakpoint(0xFFFF),
            Command::DisableBreakpoint(0),
            Command::EnableAllBreakpoints,
            Command::DisableAllBreakpoints,
        ];
        for cmd in commands {
            let frame = cmd.encode().unwrap();
            let back = Command::decode(&frame).unwrap();
            assert_eq!(back, cmd, "frame: {frame}");
        }
    }

    #[test]
    fn command_codes_are_unique() {
        for (i, a) in CommandType::ALL.iter().enumerate() {
            for b in &CommandType::ALL[i + 1..] {
                assert_ne!(a.code(), b.code());
            }
            assert_eq!(CommandType::from_code(a.code()), Some(*a));
        }
    }

    #[test]
    fn notification_codes_do_not_collide_with_commands() {
        for n in NotificationType::ALL {
            assert!(CommandType::from_code(n.code()).is_none(), "{}", n.name());
            assert_eq!(NotificationType::from_code(n.code()), Some(n));
        }
    }

    #[test]
    fn error_notification_shape() {
        let frame = Notification::error("boom").encode().unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value, json!({"type": 90, "data": "boom"}));
    }

    #[test]
    fn memory_write_set_shape() {
        let frame = Notification::MemoryWriteSet(vec![MemoryWrite {
            name: "WRAM".into(),
            address: 0xC000,
            data: vec![1, 2],
        }])
        .encode()
        .unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], 72);
        assert_eq!(value["data"][0]["address"], 0xC000);
        assert_eq!(value["data"][0]["data"], json!([1, 2]));
    }

    #[test]
    fn notifications_round_trip() {
        let notifications = [
            Notification::ProcessorState(ProcessorState {
                pc: 0x0101,
                ..ProcessorState::default()
            }),
            Notification::VideoState(VideoState::default()),
            Notification::AudioState(AudioState::default()),
            Notification::RunHalted(RunHalted {
                reason: HaltReason::Stopped,
                pc: 7,
            }),
            Notification::error("x"),
        ];
        for n in notifications {
            let back = Notification::decode(&n.encode().unwrap()).unwrap();
            assert_eq!(back, n);
        }
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn breakpoint_addresses_round_trip(addr in any::<u16>()) {
                for cmd in [
                    Command::AddBreakpoint(addr),
                    Command::RemoveBreakpoint(addr),
                    Command::EnableBreakpoint(addr),
                    Command::DisableBreakpoint(addr),
                ] {
                    let back = Command::decode(&cmd.encode().unwrap()).unwrap();
                    prop_assert_eq!(back, cmd);
                }
            }

            #[test]
            fn addresses_above_u16_are_rejected(addr in 65_536u64..1_000_000) {
                let frame = format!(r#"{{"type":40,"data":{addr}}}"#);
                prop_assert!(Command::decode(&frame).is_err());
            }
        }
    }
}
