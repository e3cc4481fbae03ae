//! Control-channel command codes.
//!
//! The dispatcher converts the wire byte with `Command::try_from(u8)` and
//! matches exhaustively; a code missing from this table is an unknown
//! command and is answered with result `0x90`.

use num_enum::{IntoPrimitive, TryFromPrimitive};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Command {
    Status = 0x01,
    DeviceNumber = 0x02,
    Time = 0x03,
    BeepLed = 0x04,
    CodeSwitch = 0x05,
    KeyReport = 0x06,
    Random = 0x07,
    DoorSensor = 0x09,
    SerialNumber = 0x0a,
    Uuid = 0x0b,
    ChipId = 0x0c,
    /// Sub-controller user data ("open door" with payload).
    SubControllerData = 0x0f,
    Mac = 0x10,
    DecoderTypes = 0x21,
    ScanMode = 0x22,
    ScanInterval = 0x23,
    Backlight = 0x24,
    BeepOnRead = 0x25,
    Gpio0 = 0x26,
    Gpio1 = 0x27,
    GpioLevel = 0x28,
    PlayAudio = 0x29,
    Relay = 0x2a,
    Heartbeat = 0x2b,
    PollResult = 0x30,
    ReportMode = 0x31,
    KeyValue = 0x32,
    PollTaggedResult = 0x33,
    Version = 0x37,
    RelayDuration = 0x45,
    CardReadBlock = 0x51,
    CardWriteBlock = 0x52,
    CardReport = 0x53,
    UpgradeStart = 0x54,
    UpgradeStop = 0x56,
    UpgradeInstall = 0x57,
    UpgradeChunk = 0x58,
    UpgradeVerify = 0x5a,
    SubControllerReply = 0x60,
    Ack = 0x61,
    Display = 0x62,
    ShowImage = 0x63,
    Window = 0x64,
    Popup = 0x65,
    ResourceStart = 0x81,
    ResourceChunk = 0x82,
    ResourceFinish = 0x83,
    ResourceDelete = 0x8a,
    CardReadSector = 0xa0,
    CardWriteSector = 0xa1,
    Apdu = 0xa6,
    DeviceConfig = 0xb0,
}

impl Command {
    /// Commands that stay available outside full protocol mode
    /// (configuration tool, upgrades, secure-module replies).
    pub fn is_service_command(self) -> bool {
        matches!(
            self,
            Self::Version
                | Self::DeviceConfig
                | Self::UpgradeStart
                | Self::UpgradeChunk
                | Self::UpgradeStop
                | Self::UpgradeVerify
                | Self::UpgradeInstall
                | Self::ResourceStart
                | Self::ResourceChunk
                | Self::ResourceFinish
                | Self::Random
                | Self::DecoderTypes
                | Self::RelayDuration
                | Self::Uuid
        )
    }

    /// Chunk commands are hot paths and not logged per packet.
    pub fn is_bulk(self) -> bool {
        matches!(self, Self::UpgradeChunk | Self::ResourceChunk)
    }

    /// Only meaningful on the sub-controller link.
    pub fn is_subcontroller_only(self) -> bool {
        matches!(self, Self::SubControllerReply | Self::SubControllerData)
    }
}
