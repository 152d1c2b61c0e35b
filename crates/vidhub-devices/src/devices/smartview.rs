/*!
 * SmartView and SmartScope monitor model.
 *
 * These units carry one to a few monitors, each with its own `MONITOR x:`
 * section. SmartScope units add scope modes and audio channel selection
 * on top of the picture settings.
 */
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use vidhub_core::connection::{ConnectionManager, ConnectionState};
use vidhub_core::event::EventReceiver;

use crate::device::{Device, DeviceError, DeviceInfo, DeviceKind, Result};
use crate::protocol::{
    encode_block, parse_bool, parse_number, split_key_value, ProtocolViolation, TelnetProtocol,
    PROTOCOL_PREAMBLE,
};
use crate::telnet::{ClientOptions, TelnetClient};
use crate::transport::Connector;

/// Device identity section
pub const SMARTVIEW_DEVICE: &str = "SMARTVIEW DEVICE:";
/// Network settings section, not tracked
pub const NETWORK: &str = "NETWORK:";

const MONITOR_PREFIX: &str = "MONITOR ";

/// Largest monitor count; headers only address `A` to `Z`
pub const MAX_MONITORS: usize = 26;

/// Index of the monitor a `MONITOR x:` header addresses
pub fn monitor_index(section: &str) -> Option<usize> {
    let name = section.strip_prefix(MONITOR_PREFIX)?.strip_suffix(':')?;
    let mut chars = name.chars();
    match (chars.next(), chars.next()) {
        (Some(c @ 'A'..='Z'), None) => Some(c as usize - 'A' as usize),
        _ => None,
    }
}

/// Letter naming monitor `index`
pub fn monitor_name(index: usize) -> char {
    (b'A' + (index % 26) as u8) as char
}

fn monitor_header(index: usize) -> String {
    format!("{}{}:", MONITOR_PREFIX, monitor_name(index))
}

/// Colored border around the picture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Border {
    /// No border
    #[default]
    None,
    /// Red border
    Red,
    /// Green border
    Green,
    /// Blue border
    Blue,
    /// White border
    White,
}

impl Border {
    /// Convert to the protocol value
    pub fn as_str(&self) -> &'static str {
        match self {
            Border::None => "None",
            Border::Red => "Red",
            Border::Green => "Green",
            Border::Blue => "Blue",
            Border::White => "White",
        }
    }

    /// Parse a protocol value
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "none" => Some(Border::None),
            "red" => Some(Border::Red),
            "green" => Some(Border::Green),
            "blue" => Some(Border::Blue),
            "white" => Some(Border::White),
            _ => None,
        }
    }
}

/// Handling of SD widescreen material
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum WidescreenSd {
    /// Follow the signal
    #[default]
    Auto,
    /// Always anamorphic
    On,
    /// Never anamorphic
    Off,
}

impl WidescreenSd {
    /// Convert to the protocol value
    pub fn as_str(&self) -> &'static str {
        match self {
            WidescreenSd::Auto => "auto",
            WidescreenSd::On => "on",
            WidescreenSd::Off => "off",
        }
    }

    /// Parse a protocol value
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "auto" => Some(WidescreenSd::Auto),
            "on" => Some(WidescreenSd::On),
            "off" => Some(WidescreenSd::Off),
            _ => None,
        }
    }
}

/// SmartScope display modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScopeMode {
    /// Plain picture
    Picture,
    /// Audio meters in dBFS
    AudioDbfs,
    /// Audio meters in dBVU
    AudioDbvu,
    /// Histogram
    Histogram,
    /// RGB parade
    ParadeRgb,
    /// YUV parade
    ParadeYuv,
    /// Vectorscope at 100%
    Vector100,
    /// Vectorscope at 75%
    Vector75,
    /// Luma waveform
    WaveformLuma,
}

impl ScopeMode {
    /// Every mode, in protocol order
    pub const ALL: [ScopeMode; 9] = [
        ScopeMode::Picture,
        ScopeMode::AudioDbfs,
        ScopeMode::AudioDbvu,
        ScopeMode::Histogram,
        ScopeMode::ParadeRgb,
        ScopeMode::ParadeYuv,
        ScopeMode::Vector100,
        ScopeMode::Vector75,
        ScopeMode::WaveformLuma,
    ];

    /// Convert to the protocol value
    pub fn as_str(&self) -> &'static str {
        match self {
            ScopeMode::Picture => "Picture",
            ScopeMode::AudioDbfs => "AudioDbfs",
            ScopeMode::AudioDbvu => "AudioDbvu",
            ScopeMode::Histogram => "Histogram",
            ScopeMode::ParadeRgb => "ParadeRGB",
            ScopeMode::ParadeYuv => "ParadeYUV",
            ScopeMode::Vector100 => "Vector100",
            ScopeMode::Vector75 => "Vector75",
            ScopeMode::WaveformLuma => "WaveformLuma",
        }
    }

    /// Parse a protocol value
    pub fn from_str(s: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|mode| mode.as_str().eq_ignore_ascii_case(s))
    }
}

/// Settings of one monitor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorSettings {
    /// Backlight brightness
    pub brightness: u8,
    /// Contrast
    pub contrast: u8,
    /// Saturation
    pub saturation: u8,
    /// Identify overlay shown
    pub identify: bool,
    /// Border color
    pub border: Border,
    /// SD widescreen handling
    pub widescreen_sd: WidescreenSd,
    /// Scope mode (SmartScope only)
    pub scope_mode: Option<ScopeMode>,
    /// Audio channel pair shown by audio scopes (SmartScope only)
    pub audio_channel: Option<u8>,
}

/// One settable monitor field with its value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonitorProperty {
    /// Backlight brightness
    Brightness(u8),
    /// Contrast
    Contrast(u8),
    /// Saturation
    Saturation(u8),
    /// Identify overlay
    Identify(bool),
    /// Border color
    Border(Border),
    /// SD widescreen handling
    WidescreenSd(WidescreenSd),
    /// Scope mode
    ScopeMode(ScopeMode),
    /// Audio channel pair
    AudioChannel(u8),
}

fn parse_u8(field: &str, value: &str) -> std::result::Result<u8, ProtocolViolation> {
    let number = parse_number(field, value)?;
    u8::try_from(number).map_err(|_| ProtocolViolation::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
    })
}

fn replace<T: PartialEq>(slot: &mut T, value: T) -> Option<T> {
    if *slot == value {
        None
    } else {
        Some(std::mem::replace(slot, value))
    }
}

impl MonitorProperty {
    /// Protocol key
    pub fn key(&self) -> &'static str {
        match self {
            MonitorProperty::Brightness(_) => "Brightness",
            MonitorProperty::Contrast(_) => "Contrast",
            MonitorProperty::Saturation(_) => "Saturation",
            MonitorProperty::Identify(_) => "Identify",
            MonitorProperty::Border(_) => "Border",
            MonitorProperty::WidescreenSd(_) => "WidescreenSD",
            MonitorProperty::ScopeMode(_) => "ScopeMode",
            MonitorProperty::AudioChannel(_) => "AudioChannel",
        }
    }

    /// Protocol value
    pub fn value(&self) -> String {
        match self {
            MonitorProperty::Brightness(v)
            | MonitorProperty::Contrast(v)
            | MonitorProperty::Saturation(v)
            | MonitorProperty::AudioChannel(v) => v.to_string(),
            MonitorProperty::Identify(v) => v.to_string(),
            MonitorProperty::Border(v) => v.as_str().to_string(),
            MonitorProperty::WidescreenSd(v) => v.as_str().to_string(),
            MonitorProperty::ScopeMode(v) => v.as_str().to_string(),
        }
    }

    /// Whether only SmartScope units accept this property
    pub fn requires_scope(&self) -> bool {
        matches!(
            self,
            MonitorProperty::ScopeMode(_) | MonitorProperty::AudioChannel(_)
        )
    }

    /// Parse a `key: value` pair; unknown keys yield `None`
    pub fn parse(key: &str, value: &str) -> std::result::Result<Option<Self>, ProtocolViolation> {
        let invalid = || ProtocolViolation::InvalidValue {
            field: key.to_string(),
            value: value.to_string(),
        };
        let property = match key {
            "Brightness" => MonitorProperty::Brightness(parse_u8(key, value)?),
            "Contrast" => MonitorProperty::Contrast(parse_u8(key, value)?),
            "Saturation" => MonitorProperty::Saturation(parse_u8(key, value)?),
            "Identify" => MonitorProperty::Identify(parse_bool(key, value)?),
            "Border" => MonitorProperty::Border(Border::from_str(value).ok_or_else(invalid)?),
            "WidescreenSD" => {
                MonitorProperty::WidescreenSd(WidescreenSd::from_str(value).ok_or_else(invalid)?)
            }
            "ScopeMode" => MonitorProperty::ScopeMode(ScopeMode::from_str(value).ok_or_else(invalid)?),
            "AudioChannel" => MonitorProperty::AudioChannel(parse_u8(key, value)?),
            _ => return Ok(None),
        };
        Ok(Some(property))
    }

    /// Store the value in `monitor`, returning the previous value if it changed
    pub fn apply(self, monitor: &mut MonitorSettings) -> Option<Option<MonitorProperty>> {
        match self {
            MonitorProperty::Brightness(v) => {
                replace(&mut monitor.brightness, v).map(|old| Some(MonitorProperty::Brightness(old)))
            }
            MonitorProperty::Contrast(v) => {
                replace(&mut monitor.contrast, v).map(|old| Some(MonitorProperty::Contrast(old)))
            }
            MonitorProperty::Saturation(v) => {
                replace(&mut monitor.saturation, v).map(|old| Some(MonitorProperty::Saturation(old)))
            }
            MonitorProperty::Identify(v) => {
                replace(&mut monitor.identify, v).map(|old| Some(MonitorProperty::Identify(old)))
            }
            MonitorProperty::Border(v) => {
                replace(&mut monitor.border, v).map(|old| Some(MonitorProperty::Border(old)))
            }
            MonitorProperty::WidescreenSd(v) => replace(&mut monitor.widescreen_sd, v)
                .map(|old| Some(MonitorProperty::WidescreenSd(old))),
            MonitorProperty::ScopeMode(v) => replace(&mut monitor.scope_mode, Some(v))
                .map(|old| old.map(MonitorProperty::ScopeMode)),
            MonitorProperty::AudioChannel(v) => replace(&mut monitor.audio_channel, Some(v))
                .map(|old| old.map(MonitorProperty::AudioChannel)),
        }
    }
}

/// Identity fields other than the unique id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SmartViewField {
    /// Preamble protocol version
    ProtocolVersion,
    /// Model name
    Model,
    /// User-assigned name
    Name,
}

/// Change notifications from a SmartView or SmartScope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmartViewEvent {
    /// The unique id was first reported or changed
    DeviceIdChanged {
        /// Previous id
        old: Option<String>,
        /// New id
        new: Option<String>,
    },
    /// An identity field changed
    InfoChanged {
        /// Which field
        field: SmartViewField,
        /// Previous value
        old: Option<String>,
        /// New value
        new: Option<String>,
    },
    /// The picture inversion flag changed
    InvertedChanged(bool),
    /// The number of monitors changed
    MonitorCountChanged {
        /// Previous count
        old: usize,
        /// New count
        new: usize,
    },
    /// A monitor setting changed
    MonitorChanged {
        /// Monitor index
        monitor: usize,
        /// Previous value, if one was known
        old: Option<MonitorProperty>,
        /// New value
        new: MonitorProperty,
    },
}

/// Everything a SmartView or SmartScope has reported
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmartViewState {
    /// Preamble protocol version
    pub protocol_version: Option<String>,
    /// Unique id
    pub device_id: Option<String>,
    /// Model name
    pub model: Option<String>,
    /// User-assigned name
    pub name: Option<String>,
    /// Picture rotated for upside-down mounting
    pub inverted: bool,
    /// One entry per monitor
    pub monitors: Vec<MonitorSettings>,
}

impl SmartViewState {
    /// Device family, judged from the model name
    pub fn kind(&self) -> DeviceKind {
        match &self.model {
            Some(model) if model.contains("SmartScope") => DeviceKind::SmartScope,
            _ => DeviceKind::SmartView,
        }
    }

    /// Number of monitors
    pub fn num_monitors(&self) -> usize {
        self.monitors.len()
    }

    /// Apply `property` to monitor `index`
    pub fn set_monitor_property(
        &mut self,
        index: usize,
        property: MonitorProperty,
        events: &mut Vec<SmartViewEvent>,
    ) {
        if let Some(monitor) = self.monitors.get_mut(index) {
            if let Some(old) = property.apply(monitor) {
                events.push(SmartViewEvent::MonitorChanged {
                    monitor: index,
                    old,
                    new: property,
                });
            }
        }
    }

    fn set_info(
        &mut self,
        field: Option<SmartViewField>,
        value: &str,
        events: &mut Vec<SmartViewEvent>,
    ) {
        let slot = match field {
            Some(SmartViewField::ProtocolVersion) => &mut self.protocol_version,
            Some(SmartViewField::Model) => &mut self.model,
            Some(SmartViewField::Name) => &mut self.name,
            None => &mut self.device_id,
        };
        let new = Some(value.to_string());
        if *slot == new {
            return;
        }
        let old = std::mem::replace(slot, new.clone());
        events.push(match field {
            Some(field) => SmartViewEvent::InfoChanged { field, old, new },
            None => SmartViewEvent::DeviceIdChanged { old, new },
        });
    }

    fn parse_device_line(
        &mut self,
        key: &str,
        value: &str,
        events: &mut Vec<SmartViewEvent>,
    ) -> std::result::Result<(), ProtocolViolation> {
        match key {
            "Model" => self.set_info(Some(SmartViewField::Model), value, events),
            "Name" => self.set_info(Some(SmartViewField::Name), value, events),
            "Unique ID" => self.set_info(None, value, events),
            "Inverted" => {
                let inverted = parse_bool(key, value)?;
                if replace(&mut self.inverted, inverted).is_some() {
                    events.push(SmartViewEvent::InvertedChanged(inverted));
                }
            }
            "Monitors" => {
                let count = parse_number(SMARTVIEW_DEVICE, value)?;
                if count > MAX_MONITORS {
                    return Err(ProtocolViolation::InvalidValue {
                        field: key.to_string(),
                        value: value.to_string(),
                    });
                }
                let old = self.monitors.len();
                if count != old {
                    self.monitors.resize(count, MonitorSettings::default());
                    events.push(SmartViewEvent::MonitorCountChanged { old, new: count });
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Section vocabulary of SmartView and SmartScope monitors
#[derive(Debug, Clone, Copy, Default)]
pub struct SmartViewProtocol;

impl TelnetProtocol for SmartViewProtocol {
    type State = SmartViewState;
    type Event = SmartViewEvent;
    const NAME: &'static str = "smartview";

    fn is_section_header(line: &str) -> bool {
        matches!(line, PROTOCOL_PREAMBLE | SMARTVIEW_DEVICE | NETWORK) || monitor_index(line).is_some()
    }

    fn parse_line(
        state: &mut SmartViewState,
        section: &str,
        line: &str,
        events: &mut Vec<SmartViewEvent>,
    ) -> std::result::Result<(), ProtocolViolation> {
        let Some((key, value)) = split_key_value(line) else {
            return Ok(());
        };
        if let Some(index) = monitor_index(section) {
            let Some(property) = MonitorProperty::parse(key, value)? else {
                return Ok(());
            };
            if index >= state.monitors.len() {
                return Err(ProtocolViolation::IndexOutOfRange {
                    section: section.to_string(),
                    index,
                    len: state.monitors.len(),
                });
            }
            state.set_monitor_property(index, property, events);
            return Ok(());
        }
        match section {
            PROTOCOL_PREAMBLE if key == "Version" => {
                state.set_info(Some(SmartViewField::ProtocolVersion), value, events);
                Ok(())
            }
            SMARTVIEW_DEVICE => state.parse_device_line(key, value, events),
            _ => Ok(()),
        }
    }

    fn ends_prelude(state: &SmartViewState, section: &str) -> bool {
        match monitor_index(section) {
            Some(index) => index + 1 >= state.monitors.len(),
            None => section == SMARTVIEW_DEVICE && state.monitors.is_empty(),
        }
    }

    fn device_id(state: &SmartViewState) -> Option<&str> {
        state.device_id.as_deref()
    }
}

/// A SmartView or SmartScope monitor unit
#[derive(Debug)]
pub struct SmartViewDevice {
    client: TelnetClient<SmartViewProtocol>,
}

impl SmartViewDevice {
    /// Create a device using `connector`
    pub fn new(
        hostaddr: impl Into<String>,
        hostport: u16,
        connector: Arc<dyn Connector>,
        options: ClientOptions,
    ) -> Self {
        Self {
            client: TelnetClient::new(hostaddr, hostport, connector, options),
        }
    }

    /// Create a TCP device with default options
    pub fn with_tcp(hostaddr: impl Into<String>, hostport: u16) -> Self {
        Self {
            client: TelnetClient::with_tcp(hostaddr, hostport),
        }
    }

    /// Underlying protocol client
    pub fn client(&self) -> &TelnetClient<SmartViewProtocol> {
        &self.client
    }

    /// Subscribe to change events
    pub fn subscribe(&self) -> EventReceiver<SmartViewEvent> {
        self.client.subscribe()
    }

    /// Copy of everything the device has reported
    pub fn snapshot(&self) -> SmartViewState {
        self.client.snapshot()
    }

    /// Device family
    pub fn kind(&self) -> DeviceKind {
        self.client.read(SmartViewState::kind)
    }

    /// Unique id, once reported
    pub fn device_id(&self) -> Option<String> {
        self.client.read(|s| s.device_id.clone())
    }

    /// Number of monitors
    pub fn num_monitors(&self) -> usize {
        self.client.read(SmartViewState::num_monitors)
    }

    /// Settings of monitor `index`
    pub fn monitor(&self, index: usize) -> Option<MonitorSettings> {
        self.client.read(|s| s.monitors.get(index).cloned())
    }

    /// Change one setting of monitor `index`
    pub async fn set_monitor_property(&self, index: usize, property: MonitorProperty) -> Result<bool> {
        let (len, kind) = self.client.read(|s| (s.num_monitors(), s.kind()));
        if index >= len {
            return Err(DeviceError::out_of_range("monitors", index, len));
        }
        if property.requires_scope() && kind != DeviceKind::SmartScope {
            return Err(DeviceError::invalid_value(format!(
                "{} is only supported by SmartScope units",
                property.key()
            )));
        }

        let block = encode_block(
            &monitor_header(index),
            [format!("{}: {}", property.key(), property.value())],
        );
        let lock = format!("monitor_{}", monitor_name(index).to_ascii_lowercase());
        self.client
            .send_command(&lock, block, move |state, events| {
                state.set_monitor_property(index, property, events);
            })
            .await
    }
}

#[async_trait]
impl Device for SmartViewDevice {
    fn info(&self) -> DeviceInfo {
        let state = self.client.snapshot();
        DeviceInfo {
            kind: state.kind(),
            hostaddr: self.client.hostaddr(),
            hostport: self.client.hostport(),
            device_id: state.device_id,
            model: state.model,
            name: state.name,
            protocol_version: state.protocol_version,
        }
    }

    fn connection_manager(&self) -> &Arc<ConnectionManager> {
        self.client.connection_manager()
    }

    fn prelude_parsed(&self) -> bool {
        self.client.prelude_parsed()
    }

    async fn connect(&self) -> ConnectionState {
        self.client.connect().await
    }

    async fn disconnect(&self) -> ConnectionState {
        self.client.disconnect().await
    }

    async fn reset_hostaddr(&self, hostaddr: &str, hostport: u16) -> ConnectionState {
        self.client.reset_hostaddr(hostaddr, hostport).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::protocol::SectionParser;
    use crate::transport::mock::MockConnector;

    const DUO_PRELUDE: &str = "PROTOCOL PREAMBLE:\nVersion: 1.3\n\n\
        SMARTVIEW DEVICE:\nModel: SmartView Duo\nHostname: duo\nName: Rack Duo\n\
        Unique ID: 7c2e0d0a1b2c\nMonitors: 2\nInverted: false\n\n\
        NETWORK:\nDynamic IP: true\nStatic address: 192.168.1.10\n\n\
        MONITOR A:\nBrightness: 255\nContrast: 127\nSaturation: 127\nIdentify: false\n\
        Border: None\nWidescreenSD: auto\n\n\
        MONITOR B:\nBrightness: 200\nContrast: 127\nSaturation: 127\nIdentify: false\n\
        Border: Red\nWidescreenSD: on\n\n";

    const SCOPE_PRELUDE: &str = "PROTOCOL PREAMBLE:\nVersion: 1.3\n\n\
        SMARTVIEW DEVICE:\nModel: SmartScope Duo 4K\nName: Scope\nMonitors: 1\nInverted: true\n\n\
        MONITOR A:\nBrightness: 255\nScopeMode: WaveformLuma\nAudioChannel: 0\n\n";

    fn options() -> ClientOptions {
        ClientOptions {
            prelude_timeout: Duration::from_secs(2),
            ack_timeout: Duration::from_secs(2),
        }
    }

    #[test]
    fn test_monitor_headers() {
        assert_eq!(monitor_index("MONITOR A:"), Some(0));
        assert_eq!(monitor_index("MONITOR C:"), Some(2));
        assert_eq!(monitor_index("MONITOR AB:"), None);
        assert_eq!(monitor_index("MONITOR a:"), None);
        assert_eq!(monitor_header(1), "MONITOR B:");
    }

    #[test]
    fn test_prelude_ends_with_last_monitor() {
        let mut parser = SectionParser::<SmartViewProtocol>::new();
        let mut state = SmartViewState::default();

        let (first, second) = DUO_PRELUDE.split_at(DUO_PRELUDE.find("MONITOR B:").unwrap());
        assert!(!parser.feed(first.as_bytes(), &mut state).prelude_completed);
        assert!(parser.feed(second.as_bytes(), &mut state).prelude_completed);

        assert_eq!(state.kind(), DeviceKind::SmartView);
        assert_eq!(state.num_monitors(), 2);
        assert_eq!(state.monitors[0].brightness, 255);
        assert_eq!(state.monitors[1].border, Border::Red);
        assert_eq!(state.monitors[1].widescreen_sd, WidescreenSd::On);
        assert_eq!(state.device_id.as_deref(), Some("7c2e0d0a1b2c"));
    }

    #[test]
    fn test_scope_prelude() {
        let mut parser = SectionParser::<SmartViewProtocol>::new();
        let mut state = SmartViewState::default();
        assert!(parser.feed(SCOPE_PRELUDE.as_bytes(), &mut state).prelude_completed);

        assert_eq!(state.kind(), DeviceKind::SmartScope);
        assert!(state.inverted);
        assert_eq!(state.monitors[0].scope_mode, Some(ScopeMode::WaveformLuma));
        assert_eq!(state.monitors[0].audio_channel, Some(0));
    }

    #[test]
    fn test_invalid_values_are_skipped() {
        let mut parser = SectionParser::<SmartViewProtocol>::new();
        let mut state = SmartViewState::default();
        parser.feed(DUO_PRELUDE.as_bytes(), &mut state);

        let out = parser.feed(
            b"MONITOR A:\nBrightness: 300\nBorder: Purple\nContrast: 10\n\nMONITOR D:\nBrightness: 1\n\n",
            &mut state,
        );
        assert_eq!(state.monitors[0].brightness, 255);
        assert_eq!(state.monitors[0].border, Border::None);
        assert_eq!(
            out.events,
            vec![SmartViewEvent::MonitorChanged {
                monitor: 0,
                old: Some(MonitorProperty::Contrast(127)),
                new: MonitorProperty::Contrast(10),
            }]
        );
    }

    #[test]
    fn test_oversized_monitor_count_is_rejected() {
        let mut parser = SectionParser::<SmartViewProtocol>::new();
        let mut state = SmartViewState::default();
        let out = parser.feed(
            b"SMARTVIEW DEVICE:\nMonitors: 18446744073709551615\nMonitors: 27\nMonitors: 2\n\n",
            &mut state,
        );
        assert_eq!(state.num_monitors(), 2);
        assert_eq!(
            out.events,
            vec![SmartViewEvent::MonitorCountChanged { old: 0, new: 2 }]
        );
    }

    #[test]
    fn test_property_round_trip() {
        let props = [
            MonitorProperty::Border(Border::Blue),
            MonitorProperty::WidescreenSd(WidescreenSd::Off),
            MonitorProperty::ScopeMode(ScopeMode::ParadeYuv),
            MonitorProperty::Identify(true),
        ];
        for prop in props {
            assert_eq!(MonitorProperty::parse(prop.key(), &prop.value()), Ok(Some(prop)));
        }
        assert_eq!(MonitorProperty::parse("LUT", "none"), Ok(None));
    }

    #[tokio::test]
    async fn test_set_monitor_property() {
        let (connector, mut sessions) = MockConnector::new();
        let device = Arc::new(SmartViewDevice::new("10.0.0.20", 9990, connector, options()));
        let (state, session) = tokio::join!(device.connect(), async {
            let session = sessions.recv().await.unwrap();
            session.send(DUO_PRELUDE);
            session
        });
        assert_eq!(state, ConnectionState::CONNECTED);
        let mut session = session;
        let mut events = device.subscribe();

        let setting = {
            let device = device.clone();
            tokio::spawn(async move {
                device
                    .set_monitor_property(1, MonitorProperty::Brightness(128))
                    .await
            })
        };
        assert_eq!(session.next_write().await, "MONITOR B:\nBrightness: 128\n\n");
        session.send("ACK\n\n");
        assert!(setting.await.unwrap().unwrap());
        assert_eq!(device.monitor(1).unwrap().brightness, 128);
        assert_eq!(
            events.recv().await.unwrap(),
            SmartViewEvent::MonitorChanged {
                monitor: 1,
                old: Some(MonitorProperty::Brightness(200)),
                new: MonitorProperty::Brightness(128),
            }
        );
    }

    #[tokio::test]
    async fn test_scope_only_properties_rejected() {
        let (connector, mut sessions) = MockConnector::new();
        let device = SmartViewDevice::new("h", 9990, connector, options());
        let (_, _session) = tokio::join!(device.connect(), async {
            let session = sessions.recv().await.unwrap();
            session.send(DUO_PRELUDE);
            session
        });

        assert!(matches!(
            device
                .set_monitor_property(0, MonitorProperty::ScopeMode(ScopeMode::Histogram))
                .await,
            Err(DeviceError::InvalidValue(_))
        ));
        assert!(matches!(
            device
                .set_monitor_property(2, MonitorProperty::Identify(true))
                .await,
            Err(DeviceError::IndexOutOfRange { index: 2, len: 2, .. })
        ));
        assert_eq!(device.info().name.as_deref(), Some("Rack Duo"));
    }
}
