/*!
 * Videohub router model.
 *
 * A Videohub routes any of its inputs to each output. The prelude reports
 * the device identity, the input and output counts, labels, output locks
 * and the current routing table; later sections carry updates made from
 * other control panels.
 */
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use vidhub_core::connection::{ConnectionManager, ConnectionState};
use vidhub_core::event::EventReceiver;

use crate::device::{Device, DeviceError, DeviceInfo, DeviceKind, Result};
use crate::protocol::{
    encode_block, parse_index, parse_number, split_index, split_key_value, ProtocolViolation,
    TelnetProtocol, PROTOCOL_PREAMBLE,
};
use crate::telnet::{ClientOptions, TelnetClient};
use crate::transport::Connector;

/// Device identity section
pub const VIDEOHUB_DEVICE: &str = "VIDEOHUB DEVICE:";
/// Input label section
pub const INPUT_LABELS: &str = "INPUT LABELS:";
/// Output label section
pub const OUTPUT_LABELS: &str = "OUTPUT LABELS:";
/// Output lock section
pub const VIDEO_OUTPUT_LOCKS: &str = "VIDEO OUTPUT LOCKS:";
/// Routing section
pub const VIDEO_OUTPUT_ROUTING: &str = "VIDEO OUTPUT ROUTING:";
/// Marks the end of the prelude
pub const END_PRELUDE: &str = "END PRELUDE:";

/// Largest input or output count accepted from a device
pub const MAX_PORTS: usize = 1024;

const SECTIONS: &[&str] = &[
    PROTOCOL_PREAMBLE,
    VIDEOHUB_DEVICE,
    INPUT_LABELS,
    OUTPUT_LABELS,
    VIDEO_OUTPUT_LOCKS,
    VIDEO_OUTPUT_ROUTING,
    END_PRELUDE,
];

/// Lock status of an output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum LockState {
    /// Anyone may route the output
    #[default]
    Unlocked,
    /// Locked by this client
    Owned,
    /// Locked by another client
    Locked,
}

impl LockState {
    /// Get the protocol letter
    pub fn as_str(&self) -> &'static str {
        match self {
            LockState::Unlocked => "U",
            LockState::Owned => "O",
            LockState::Locked => "L",
        }
    }

    /// Parse a protocol letter
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "U" => Some(LockState::Unlocked),
            "O" => Some(LockState::Owned),
            "L" => Some(LockState::Locked),
            _ => None,
        }
    }
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lock change a client may request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockRequest {
    /// Take the lock
    Lock,
    /// Release our lock
    Unlock,
    /// Release a lock held by anyone
    ForceUnlock,
}

impl LockRequest {
    fn as_str(&self) -> &'static str {
        match self {
            LockRequest::Lock => "O",
            LockRequest::Unlock => "U",
            LockRequest::ForceUnlock => "F",
        }
    }

    fn resulting_state(&self) -> LockState {
        match self {
            LockRequest::Lock => LockState::Owned,
            LockRequest::Unlock | LockRequest::ForceUnlock => LockState::Unlocked,
        }
    }
}

/// Identity fields other than the unique id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InfoField {
    /// Preamble protocol version
    ProtocolVersion,
    /// Model name
    ModelName,
    /// User-assigned name
    FriendlyName,
}

/// Router side of a port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortKind {
    /// Inputs
    Input,
    /// Outputs
    Output,
}

/// Change notifications from a Videohub
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideohubEvent {
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
        field: InfoField,
        /// Previous value
        old: Option<String>,
        /// New value
        new: Option<String>,
    },
    /// The number of inputs or outputs changed
    CountChanged {
        /// Inputs or outputs
        kind: PortKind,
        /// Previous count
        old: usize,
        /// New count
        new: usize,
    },
    /// An input label changed
    InputLabelChanged {
        /// Input index
        index: usize,
        /// Previous label
        old: String,
        /// New label
        new: String,
    },
    /// An output label changed
    OutputLabelChanged {
        /// Output index
        index: usize,
        /// Previous label
        old: String,
        /// New label
        new: String,
    },
    /// An output was routed to another input
    RouteChanged {
        /// Output index
        output: usize,
        /// Previously routed input
        old: usize,
        /// Newly routed input
        new: usize,
    },
    /// An output lock changed
    LockChanged {
        /// Output index
        output: usize,
        /// Previous status
        old: LockState,
        /// New status
        new: LockState,
    },
}

/// Everything a Videohub has reported
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideohubState {
    /// Preamble protocol version
    pub protocol_version: Option<String>,
    /// Whether the device reports itself present
    pub device_present: bool,
    /// Unique id
    pub device_id: Option<String>,
    /// Model name
    pub model_name: Option<String>,
    /// User-assigned name
    pub friendly_name: Option<String>,
    /// Input labels, one per input
    pub input_labels: Vec<String>,
    /// Output labels, one per output
    pub output_labels: Vec<String>,
    /// Lock status, one per output
    pub output_locks: Vec<LockState>,
    /// Routed input, one per output
    pub output_routing: Vec<usize>,
}

fn default_label(kind: PortKind, index: usize) -> String {
    match kind {
        PortKind::Input => format!("Input {}", index + 1),
        PortKind::Output => format!("Output {}", index + 1),
    }
}

fn update_info(
    slot: &mut Option<String>,
    value: &str,
    events: &mut Vec<VideohubEvent>,
    make: impl FnOnce(Option<String>, Option<String>) -> VideohubEvent,
) {
    let new = Some(value.to_string());
    if *slot != new {
        let old = std::mem::replace(slot, new.clone());
        events.push(make(old, new));
    }
}

impl VideohubState {
    /// Number of inputs
    pub fn num_inputs(&self) -> usize {
        self.input_labels.len()
    }

    /// Number of outputs
    pub fn num_outputs(&self) -> usize {
        self.output_routing.len()
    }

    /// Resize for a declared input count, capped at [`MAX_PORTS`]
    pub fn set_num_inputs(&mut self, count: usize, events: &mut Vec<VideohubEvent>) {
        let count = count.min(MAX_PORTS);
        let old = self.num_inputs();
        if old == count {
            return;
        }
        self.input_labels.truncate(count);
        for index in old..count {
            self.input_labels.push(default_label(PortKind::Input, index));
        }
        events.push(VideohubEvent::CountChanged {
            kind: PortKind::Input,
            old,
            new: count,
        });
    }

    /// Resize for a declared output count, capped at [`MAX_PORTS`]
    pub fn set_num_outputs(&mut self, count: usize, events: &mut Vec<VideohubEvent>) {
        let count = count.min(MAX_PORTS);
        let old = self.num_outputs();
        if old == count {
            return;
        }
        self.output_labels.truncate(count);
        for index in old..count {
            self.output_labels.push(default_label(PortKind::Output, index));
        }
        self.output_locks.resize(count, LockState::Unlocked);
        self.output_routing.resize(count, 0);
        events.push(VideohubEvent::CountChanged {
            kind: PortKind::Output,
            old,
            new: count,
        });
    }

    /// Set an input label
    pub fn set_input_label(&mut self, index: usize, label: &str, events: &mut Vec<VideohubEvent>) {
        if let Some(slot) = self.input_labels.get_mut(index) {
            if slot != label {
                let old = std::mem::replace(slot, label.to_string());
                events.push(VideohubEvent::InputLabelChanged {
                    index,
                    old,
                    new: label.to_string(),
                });
            }
        }
    }

    /// Set an output label
    pub fn set_output_label(&mut self, index: usize, label: &str, events: &mut Vec<VideohubEvent>) {
        if let Some(slot) = self.output_labels.get_mut(index) {
            if slot != label {
                let old = std::mem::replace(slot, label.to_string());
                events.push(VideohubEvent::OutputLabelChanged {
                    index,
                    old,
                    new: label.to_string(),
                });
            }
        }
    }

    /// Route `input` to `output`
    pub fn set_route(&mut self, output: usize, input: usize, events: &mut Vec<VideohubEvent>) {
        if let Some(slot) = self.output_routing.get_mut(output) {
            if *slot != input {
                let old = std::mem::replace(slot, input);
                events.push(VideohubEvent::RouteChanged {
                    output,
                    old,
                    new: input,
                });
            }
        }
    }

    /// Set the lock status of `output`
    pub fn set_lock(&mut self, output: usize, lock: LockState, events: &mut Vec<VideohubEvent>) {
        if let Some(slot) = self.output_locks.get_mut(output) {
            if *slot != lock {
                let old = std::mem::replace(slot, lock);
                events.push(VideohubEvent::LockChanged {
                    output,
                    old,
                    new: lock,
                });
            }
        }
    }

    fn parse_device_line(
        &mut self,
        line: &str,
        events: &mut Vec<VideohubEvent>,
    ) -> std::result::Result<(), ProtocolViolation> {
        let Some((key, value)) = split_key_value(line) else {
            return Ok(());
        };
        match key {
            "Device present" => self.device_present = value.eq_ignore_ascii_case("true"),
            "Model name" => update_info(&mut self.model_name, value, events, |old, new| {
                VideohubEvent::InfoChanged {
                    field: InfoField::ModelName,
                    old,
                    new,
                }
            }),
            "Friendly name" => update_info(&mut self.friendly_name, value, events, |old, new| {
                VideohubEvent::InfoChanged {
                    field: InfoField::FriendlyName,
                    old,
                    new,
                }
            }),
            "Unique ID" => update_info(&mut self.device_id, value, events, |old, new| {
                VideohubEvent::DeviceIdChanged { old, new }
            }),
            "Video inputs" => {
                let count = parse_port_count(key, value)?;
                self.set_num_inputs(count, events);
            }
            "Video outputs" => {
                let count = parse_port_count(key, value)?;
                self.set_num_outputs(count, events);
            }
            _ => {}
        }
        Ok(())
    }
}

fn parse_port_count(field: &str, value: &str) -> std::result::Result<usize, ProtocolViolation> {
    let count = parse_number(VIDEOHUB_DEVICE, value)?;
    if count > MAX_PORTS {
        return Err(ProtocolViolation::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
        });
    }
    Ok(count)
}

fn malformed(section: &str, line: &str) -> ProtocolViolation {
    ProtocolViolation::Malformed {
        section: section.to_string(),
        line: line.to_string(),
    }
}

/// Section vocabulary of Videohub routers
#[derive(Debug, Clone, Copy, Default)]
pub struct VideohubProtocol;

impl TelnetProtocol for VideohubProtocol {
    type State = VideohubState;
    type Event = VideohubEvent;
    const NAME: &'static str = "videohub";

    fn is_section_header(line: &str) -> bool {
        SECTIONS.contains(&line)
    }

    fn parse_line(
        state: &mut VideohubState,
        section: &str,
        line: &str,
        events: &mut Vec<VideohubEvent>,
    ) -> std::result::Result<(), ProtocolViolation> {
        match section {
            PROTOCOL_PREAMBLE => {
                if let Some(("Version", value)) = split_key_value(line) {
                    update_info(&mut state.protocol_version, value, events, |old, new| {
                        VideohubEvent::InfoChanged {
                            field: InfoField::ProtocolVersion,
                            old,
                            new,
                        }
                    });
                }
                Ok(())
            }
            VIDEOHUB_DEVICE => state.parse_device_line(line, events),
            INPUT_LABELS => {
                let (index, label) = split_index(line).ok_or_else(|| malformed(section, line))?;
                let index = parse_index(section, index, state.num_inputs())?;
                state.set_input_label(index, label, events);
                Ok(())
            }
            OUTPUT_LABELS => {
                let (index, label) = split_index(line).ok_or_else(|| malformed(section, line))?;
                let index = parse_index(section, index, state.num_outputs())?;
                state.set_output_label(index, label, events);
                Ok(())
            }
            VIDEO_OUTPUT_LOCKS => {
                let (index, lock) = split_index(line).ok_or_else(|| malformed(section, line))?;
                let index = parse_index(section, index, state.num_outputs())?;
                let lock = LockState::from_str(lock.trim()).ok_or_else(|| {
                    ProtocolViolation::InvalidValue {
                        field: "output lock".to_string(),
                        value: lock.to_string(),
                    }
                })?;
                state.set_lock(index, lock, events);
                Ok(())
            }
            VIDEO_OUTPUT_ROUTING => {
                let (output, input) = split_index(line).ok_or_else(|| malformed(section, line))?;
                let output = parse_index(section, output, state.num_outputs())?;
                let input = parse_index(section, input, state.num_inputs())?;
                state.set_route(output, input, events);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn ends_prelude(_state: &VideohubState, section: &str) -> bool {
        section == END_PRELUDE
    }

    fn device_id(state: &VideohubState) -> Option<&str> {
        state.device_id.as_deref()
    }
}

const INPUT_LABELS_PROPERTY: &str = "input_labels";
const OUTPUT_LABELS_PROPERTY: &str = "output_labels";
const OUTPUT_LOCKS_PROPERTY: &str = "output_locks";
const OUTPUT_ROUTING_PROPERTY: &str = "output_routing";

fn check_label(label: &str) -> Result<()> {
    if label.contains(['\n', '\r']) {
        return Err(DeviceError::invalid_value(format!(
            "label '{}' contains a line break",
            label.escape_debug()
        )));
    }
    Ok(())
}

fn check_index(property: &str, index: usize, len: usize) -> Result<()> {
    if index >= len {
        return Err(DeviceError::out_of_range(property, index, len));
    }
    Ok(())
}

/// A Videohub router
#[derive(Debug)]
pub struct VideohubDevice {
    client: TelnetClient<VideohubProtocol>,
}

impl VideohubDevice {
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
    pub fn client(&self) -> &TelnetClient<VideohubProtocol> {
        &self.client
    }

    /// Subscribe to change events
    pub fn subscribe(&self) -> EventReceiver<VideohubEvent> {
        self.client.subscribe()
    }

    /// Copy of everything the device has reported
    pub fn snapshot(&self) -> VideohubState {
        self.client.snapshot()
    }

    /// Unique id, once reported
    pub fn device_id(&self) -> Option<String> {
        self.client.read(|s| s.device_id.clone())
    }

    /// Model name
    pub fn model_name(&self) -> Option<String> {
        self.client.read(|s| s.model_name.clone())
    }

    /// User-assigned name
    pub fn friendly_name(&self) -> Option<String> {
        self.client.read(|s| s.friendly_name.clone())
    }

    /// Number of inputs
    pub fn num_inputs(&self) -> usize {
        self.client.read(VideohubState::num_inputs)
    }

    /// Number of outputs
    pub fn num_outputs(&self) -> usize {
        self.client.read(VideohubState::num_outputs)
    }

    /// Input labels
    pub fn input_labels(&self) -> Vec<String> {
        self.client.read(|s| s.input_labels.clone())
    }

    /// Output labels
    pub fn output_labels(&self) -> Vec<String> {
        self.client.read(|s| s.output_labels.clone())
    }

    /// Routed input of every output
    pub fn output_routing(&self) -> Vec<usize> {
        self.client.read(|s| s.output_routing.clone())
    }

    /// Lock status of every output
    pub fn output_locks(&self) -> Vec<LockState> {
        self.client.read(|s| s.output_locks.clone())
    }

    /// Set one input label
    pub async fn set_input_label(&self, index: usize, label: &str) -> Result<bool> {
        self.set_input_labels(&[(index, label.to_string())]).await
    }

    /// Set several input labels in one command
    pub async fn set_input_labels(&self, labels: &[(usize, String)]) -> Result<bool> {
        self.set_labels(PortKind::Input, labels).await
    }

    /// Set one output label
    pub async fn set_output_label(&self, index: usize, label: &str) -> Result<bool> {
        self.set_output_labels(&[(index, label.to_string())]).await
    }

    /// Set several output labels in one command
    pub async fn set_output_labels(&self, labels: &[(usize, String)]) -> Result<bool> {
        self.set_labels(PortKind::Output, labels).await
    }

    async fn set_labels(&self, kind: PortKind, labels: &[(usize, String)]) -> Result<bool> {
        if labels.is_empty() {
            return Ok(true);
        }
        let (property, header, len) = match kind {
            PortKind::Input => (INPUT_LABELS_PROPERTY, INPUT_LABELS, self.num_inputs()),
            PortKind::Output => (OUTPUT_LABELS_PROPERTY, OUTPUT_LABELS, self.num_outputs()),
        };
        for (index, label) in labels {
            check_index(property, *index, len)?;
            check_label(label)?;
        }

        let block = encode_block(
            header,
            labels.iter().map(|(index, label)| format!("{} {}", index, label)),
        );
        let labels = labels.to_vec();
        self.client
            .send_command(property, block, move |state, events| {
                for (index, label) in &labels {
                    match kind {
                        PortKind::Input => state.set_input_label(*index, label, events),
                        PortKind::Output => state.set_output_label(*index, label, events),
                    }
                }
            })
            .await
    }

    /// Route `input` to `output`
    pub async fn set_route(&self, output: usize, input: usize) -> Result<bool> {
        self.set_routes(&[(output, input)]).await
    }

    /// Apply several `(output, input)` crosspoints in one command
    pub async fn set_routes(&self, routes: &[(usize, usize)]) -> Result<bool> {
        if routes.is_empty() {
            return Ok(true);
        }
        let (num_inputs, num_outputs) =
            self.client.read(|s| (s.num_inputs(), s.num_outputs()));
        for (output, input) in routes {
            check_index(OUTPUT_ROUTING_PROPERTY, *output, num_outputs)?;
            check_index("inputs", *input, num_inputs)?;
        }

        let block = encode_block(
            VIDEO_OUTPUT_ROUTING,
            routes.iter().map(|(output, input)| format!("{} {}", output, input)),
        );
        let routes = routes.to_vec();
        self.client
            .send_command(OUTPUT_ROUTING_PROPERTY, block, move |state, events| {
                for (output, input) in routes {
                    state.set_route(output, input, events);
                }
            })
            .await
    }

    /// Lock or unlock `output`
    pub async fn set_output_lock(&self, output: usize, request: LockRequest) -> Result<bool> {
        check_index(OUTPUT_LOCKS_PROPERTY, output, self.num_outputs())?;
        let block = encode_block(
            VIDEO_OUTPUT_LOCKS,
            [format!("{} {}", output, request.as_str())],
        );
        self.client
            .send_command(OUTPUT_LOCKS_PROPERTY, block, move |state, events| {
                state.set_lock(output, request.resulting_state(), events);
            })
            .await
    }
}

#[async_trait]
impl Device for VideohubDevice {
    fn info(&self) -> DeviceInfo {
        let (device_id, model, name, protocol_version) = self.client.read(|s| {
            (
                s.device_id.clone(),
                s.model_name.clone(),
                s.friendly_name.clone(),
                s.protocol_version.clone(),
            )
        });
        DeviceInfo {
            kind: DeviceKind::Videohub,
            hostaddr: self.client.hostaddr(),
            hostport: self.client.hostport(),
            device_id,
            model,
            name,
            protocol_version,
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
