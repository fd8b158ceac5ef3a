//! In-memory BGAPI dictionary built from XML API description files.
//!
//! A description file declares one device API: its numeric `device_id`, a
//! table of named datatypes, and a set of classes, each holding enum groups,
//! define groups, commands and events. The model is built once at load time
//! and is immutable afterwards; the codec and the I/O engine only ever read
//! from it.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use roxmltree::{Document, Node};

use crate::error::BgError;
use crate::value::parse_number;

/// Wire format of a single parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Int8,
    Uint8,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Uint8Array,
    Uint16Array,
    BdAddr,
    HwAddr,
    Ipv4,
    Uuid128,
    AesKey128,
    Uuid64,
    Uuid16,
    ByteArray,
}

impl ParamType {
    pub fn from_name(name: &str) -> Option<Self> {
        let format = match name {
            "int8" => ParamType::Int8,
            "uint8" => ParamType::Uint8,
            "int16" => ParamType::Int16,
            "uint16" => ParamType::Uint16,
            "int32" => ParamType::Int32,
            "uint32" => ParamType::Uint32,
            "int64" => ParamType::Int64,
            "uint64" => ParamType::Uint64,
            "uint8array" => ParamType::Uint8Array,
            "uint16array" => ParamType::Uint16Array,
            "bd_addr" => ParamType::BdAddr,
            "hw_addr" => ParamType::HwAddr,
            "ipv4" => ParamType::Ipv4,
            "uuid_128" => ParamType::Uuid128,
            "aes_key_128" => ParamType::AesKey128,
            "sl_bt_uuid_64_t" => ParamType::Uuid64,
            "sl_bt_uuid_16_t" => ParamType::Uuid16,
            "byte_array" => ParamType::ByteArray,
            _ => return None,
        };
        Some(format)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ParamType::Int8 => "int8",
            ParamType::Uint8 => "uint8",
            ParamType::Int16 => "int16",
            ParamType::Uint16 => "uint16",
            ParamType::Int32 => "int32",
            ParamType::Uint32 => "uint32",
            ParamType::Int64 => "int64",
            ParamType::Uint64 => "uint64",
            ParamType::Uint8Array => "uint8array",
            ParamType::Uint16Array => "uint16array",
            ParamType::BdAddr => "bd_addr",
            ParamType::HwAddr => "hw_addr",
            ParamType::Ipv4 => "ipv4",
            ParamType::Uuid128 => "uuid_128",
            ParamType::AesKey128 => "aes_key_128",
            ParamType::Uuid64 => "sl_bt_uuid_64_t",
            ParamType::Uuid16 => "sl_bt_uuid_16_t",
            ParamType::ByteArray => "byte_array",
        }
    }

    /// Wire size of fixed-length formats. `None` for the length-prefixed
    /// arrays and for `byte_array`, whose length comes from its datatype.
    pub(crate) fn fixed_size(&self) -> Option<usize> {
        match self {
            ParamType::Int8 | ParamType::Uint8 => Some(1),
            ParamType::Int16 | ParamType::Uint16 | ParamType::Uuid16 => Some(2),
            ParamType::Int32 | ParamType::Uint32 | ParamType::Ipv4 => Some(4),
            ParamType::Int64 | ParamType::Uint64 | ParamType::Uuid64 => Some(8),
            ParamType::BdAddr | ParamType::HwAddr => Some(6),
            ParamType::Uuid128 | ParamType::AesKey128 => Some(16),
            ParamType::Uint8Array | ParamType::Uint16Array | ParamType::ByteArray => None,
        }
    }
}

/// A named datatype from the `datatypes` table. Only the `length` matters
/// operationally, and only for `byte_array` parameters.
#[derive(Debug, Clone)]
pub struct Datatype {
    pub name: String,
    pub base: String,
    pub length: usize,
}

#[derive(Debug, Clone)]
pub struct SymbolMember {
    pub name: String,
    pub value: i64,
    pub description: String,
}

/// An enum or define group: named members with numeric values, addressable
/// by name (serialization) and by value (decode-side rendering).
#[derive(Debug, Clone)]
pub struct SymbolGroup {
    pub name: String,
    pub description: String,
    members: Vec<SymbolMember>,
    by_name: HashMap<String, usize>,
    by_value: HashMap<i64, usize>,
}

impl SymbolGroup {
    pub fn members(&self) -> &[SymbolMember] {
        &self.members
    }

    pub fn member(&self, name: &str) -> Option<&SymbolMember> {
        self.by_name.get(name).map(|&i| &self.members[i])
    }

    pub fn member_by_value(&self, value: i64) -> Option<&SymbolMember> {
        self.by_value.get(&value).map(|&i| &self.members[i])
    }

    fn parse(node: Node, entry_tag: &str) -> Result<Self, BgError> {
        let name = required_attr(node, "name")?.to_owned();
        let description = child_text(node, "description");
        let mut members = Vec::new();
        let mut by_name = HashMap::new();
        let mut by_value = HashMap::new();
        for entry in node.descendants().filter(|n| n.has_tag_name(entry_tag)) {
            let member = SymbolMember {
                name: required_attr(entry, "name")?.to_owned(),
                value: int_attr(entry, "value")? as i64,
                description: child_text(entry, "description"),
            };
            by_name.insert(member.name.clone(), members.len());
            by_value.insert(member.value, members.len());
            members.push(member);
        }
        Ok(SymbolGroup {
            name,
            description,
            members,
            by_name,
            by_value,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidatorKind {
    Enum,
    Define,
}

/// Reference from a parameter to an enum/define group of its class.
#[derive(Debug, Clone)]
pub struct Validator {
    pub kind: ValidatorKind,
    pub group: String,
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub index: usize,
    pub format: ParamType,
    pub datatype: Option<Datatype>,
    pub validator: Option<Validator>,
    pub description: String,
}

impl Param {
    fn parse(node: Node, index: usize, datatypes: &HashMap<String, Datatype>) -> Result<Self, BgError> {
        let name = required_attr(node, "name")?.to_owned();
        let type_name = required_attr(node, "type")?;
        let format = ParamType::from_name(type_name).ok_or_else(|| {
            BgError::ApiDescription(format!("parameter '{}' has unrecognized type '{}'", name, type_name))
        })?;
        let datatype = node.attribute("datatype").and_then(|n| datatypes.get(n)).cloned();
        let validator = match (node.attribute("validator_type"), node.attribute("validator_id")) {
            (Some(kind), Some(group)) => {
                let kind = match kind {
                    "enum" => ValidatorKind::Enum,
                    "define" => ValidatorKind::Define,
                    other => {
                        return Err(BgError::ApiDescription(format!(
                            "parameter '{}' has unrecognized validator_type '{}'",
                            name, other
                        )));
                    }
                };
                Some(Validator {
                    kind,
                    group: group.to_owned(),
                })
            }
            (None, None) => None,
            _ => {
                return Err(BgError::ApiDescription(format!(
                    "parameter '{}' must carry validator_type and validator_id together",
                    name
                )));
            }
        };
        if format == ParamType::ByteArray && datatype.as_ref().map_or(0, |d| d.length) == 0 {
            return Err(BgError::ApiDescription(format!(
                "byte_array parameter '{}' needs a datatype with a concrete length",
                name
            )));
        }
        Ok(Param {
            name,
            index,
            format,
            datatype,
            validator,
            description: child_text(node, "description"),
        })
    }
}

fn parse_param_list(
    parent: Node,
    list_tag: &str,
    datatypes: &HashMap<String, Datatype>,
) -> Result<Vec<Param>, BgError> {
    let mut params = Vec::new();
    if let Some(list) = parent.children().find(|n| n.has_tag_name(list_tag)) {
        for node in list.descendants().filter(|n| n.has_tag_name("param")) {
            params.push(Param::parse(node, params.len(), datatypes)?);
        }
    }
    Ok(params)
}

#[derive(Debug, Clone)]
pub struct Command {
    pub index: u8,
    pub name: String,
    pub description: String,
    pub params: Vec<Param>,
    pub returns: Vec<Param>,
    pub no_return: bool,
    pub internal: bool,
}

impl Command {
    fn parse(node: Node, datatypes: &HashMap<String, Datatype>) -> Result<Self, BgError> {
        Ok(Command {
            index: u8_attr(node, "index")?,
            name: required_attr(node, "name")?.to_owned(),
            description: child_text(node, "description"),
            params: parse_param_list(node, "params", datatypes)?,
            returns: parse_param_list(node, "returns", datatypes)?,
            no_return: bool_attr(node, "no_return"),
            internal: bool_attr(node, "internal"),
        })
    }
}

#[derive(Debug, Clone)]
pub struct Event {
    pub index: u8,
    pub name: String,
    pub description: String,
    pub params: Vec<Param>,
    pub internal: bool,
}

impl Event {
    fn parse(node: Node, datatypes: &HashMap<String, Datatype>) -> Result<Self, BgError> {
        Ok(Event {
            index: u8_attr(node, "index")?,
            name: required_attr(node, "name")?.to_owned(),
            description: child_text(node, "description"),
            params: parse_param_list(node, "params", datatypes)?,
            internal: bool_attr(node, "internal"),
        })
    }
}

/// One class of a device API: commands, events, enum and define groups,
/// addressed on the wire by an 8-bit class index.
#[derive(Debug)]
pub struct ApiClass {
    pub index: u8,
    pub name: String,
    pub description: String,
    enums: Vec<SymbolGroup>,
    enum_by_name: HashMap<String, usize>,
    defines: Vec<SymbolGroup>,
    define_by_name: HashMap<String, usize>,
    commands: Vec<Command>,
    command_by_name: HashMap<String, usize>,
    command_by_index: HashMap<u8, usize>,
    events: Vec<Event>,
    event_by_name: HashMap<String, usize>,
    event_by_index: HashMap<u8, usize>,
    constants: HashMap<String, i64>,
}

impl ApiClass {
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn command(&self, name: &str) -> Option<&Command> {
        self.command_by_name.get(name).map(|&i| &self.commands[i])
    }

    pub fn command_by_index(&self, index: u8) -> Option<&Command> {
        self.command_by_index.get(&index).map(|&i| &self.commands[i])
    }

    pub fn event(&self, name: &str) -> Option<&Event> {
        self.event_by_name.get(name).map(|&i| &self.events[i])
    }

    pub fn event_by_index(&self, index: u8) -> Option<&Event> {
        self.event_by_index.get(&index).map(|&i| &self.events[i])
    }

    pub fn enum_group(&self, name: &str) -> Option<&SymbolGroup> {
        self.enum_by_name.get(name).map(|&i| &self.enums[i])
    }

    pub fn define_group(&self, name: &str) -> Option<&SymbolGroup> {
        self.define_by_name.get(name).map(|&i| &self.defines[i])
    }

    pub fn enum_groups(&self) -> &[SymbolGroup] {
        &self.enums
    }

    pub fn define_groups(&self) -> &[SymbolGroup] {
        &self.defines
    }

    /// Look up a folded symbolic constant, keyed `GROUPNAME_MEMBERNAME`
    /// (upper-cased). Both enum and define members are included.
    pub fn constant(&self, key: &str) -> Option<i64> {
        self.constants.get(key).copied()
    }

    pub(crate) fn command_position(&self, index: u8) -> Option<usize> {
        self.command_by_index.get(&index).copied()
    }

    pub(crate) fn command_position_by_name(&self, name: &str) -> Option<usize> {
        self.command_by_name.get(name).copied()
    }

    pub(crate) fn event_position(&self, index: u8) -> Option<usize> {
        self.event_by_index.get(&index).copied()
    }

    pub(crate) fn event_position_by_name(&self, name: &str) -> Option<usize> {
        self.event_by_name.get(name).copied()
    }

    fn parse(node: Node, datatypes: &HashMap<String, Datatype>) -> Result<Self, BgError> {
        let index = u8_attr(node, "index")?;
        let name = required_attr(node, "name")?.to_owned();

        let mut enums = Vec::new();
        let mut enum_by_name = HashMap::new();
        for group_node in node.descendants().filter(|n| n.has_tag_name("enums")) {
            let group = SymbolGroup::parse(group_node, "enum")?;
            enum_by_name.insert(group.name.clone(), enums.len());
            enums.push(group);
        }

        let mut defines = Vec::new();
        let mut define_by_name = HashMap::new();
        for group_node in node.descendants().filter(|n| n.has_tag_name("defines")) {
            let group = SymbolGroup::parse(group_node, "define")?;
            define_by_name.insert(group.name.clone(), defines.len());
            defines.push(group);
        }

        let mut commands = Vec::new();
        let mut command_by_name = HashMap::new();
        let mut command_by_index = HashMap::new();
        for cmd_node in node.descendants().filter(|n| n.has_tag_name("command")) {
            let command = Command::parse(cmd_node, datatypes)?;
            if command_by_index.insert(command.index, commands.len()).is_some() {
                return Err(BgError::ApiDescription(format!(
                    "duplicate command index {} in class '{}'",
                    command.index, name
                )));
            }
            command_by_name.insert(command.name.clone(), commands.len());
            commands.push(command);
        }

        let mut events = Vec::new();
        let mut event_by_name = HashMap::new();
        let mut event_by_index = HashMap::new();
        for evt_node in node.descendants().filter(|n| n.has_tag_name("event")) {
            let event = Event::parse(evt_node, datatypes)?;
            if event_by_index.insert(event.index, events.len()).is_some() {
                return Err(BgError::ApiDescription(format!(
                    "duplicate event index {} in class '{}'",
                    event.index, name
                )));
            }
            event_by_name.insert(event.name.clone(), events.len());
            events.push(event);
        }

        let mut constants = HashMap::new();
        for group in enums.iter().chain(defines.iter()) {
            for member in group.members() {
                constants.insert(
                    format!("{}_{}", group.name.to_uppercase(), member.name.to_uppercase()),
                    member.value,
                );
            }
        }

        let class = ApiClass {
            index,
            name,
            description: child_text(node, "description"),
            enums,
            enum_by_name,
            defines,
            define_by_name,
            commands,
            command_by_name,
            command_by_index,
            events,
            event_by_name,
            event_by_index,
            constants,
        };
        class.check_validators()?;
        Ok(class)
    }

    /// Every validator reference must resolve within this class.
    fn check_validators(&self) -> Result<(), BgError> {
        let command_params = self.commands.iter().flat_map(|c| c.params.iter().chain(c.returns.iter()));
        let event_params = self.events.iter().flat_map(|e| e.params.iter());
        for param in command_params.chain(event_params) {
            if let Some(validator) = &param.validator {
                let resolved = match validator.kind {
                    ValidatorKind::Enum => self.enum_group(&validator.group).is_some(),
                    ValidatorKind::Define => self.define_group(&validator.group).is_some(),
                };
                if !resolved {
                    return Err(BgError::ApiDescription(format!(
                        "validator '{}' referenced by parameter '{}' does not exist in class '{}'",
                        validator.group, param.name, self.name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// A complete device API: the classes of one `device_id`, plus the named
/// datatype table shared by all of them.
#[derive(Debug)]
pub struct DeviceApi {
    pub device_id: u8,
    pub device_name: String,
    pub version: Option<String>,
    pub description: String,
    datatypes: HashMap<String, Datatype>,
    classes: Vec<ApiClass>,
    class_by_name: HashMap<String, usize>,
    class_by_index: HashMap<u8, usize>,
}

impl DeviceApi {
    /// Build a device API from one XML description document.
    pub fn from_xml(xml: &str) -> Result<Self, BgError> {
        let doc = Document::parse(xml)?;
        let root = doc.root_element();

        let device_id = int_attr(root, "device_id")?;
        if !(0..16).contains(&device_id) {
            return Err(BgError::ApiDescription(format!(
                "device_id {} does not fit the 4-bit header field",
                device_id
            )));
        }
        let device_name = required_attr(root, "device_name")?.to_owned();

        let mut datatypes = HashMap::new();
        for node in root.descendants().filter(|n| n.has_tag_name("datatype")) {
            let datatype = Datatype {
                name: required_attr(node, "name")?.to_owned(),
                base: node.attribute("base").unwrap_or_default().to_owned(),
                length: match node.attribute("length") {
                    Some(text) => parse_number(text).and_then(|v| usize::try_from(v).ok()).ok_or_else(|| {
                        BgError::ApiDescription(format!("datatype has invalid length '{}'", text))
                    })?,
                    None => 0,
                },
            };
            datatypes.insert(datatype.name.clone(), datatype);
        }

        let mut classes = Vec::new();
        let mut class_by_name = HashMap::new();
        let mut class_by_index = HashMap::new();
        for class_node in root.descendants().filter(|n| n.has_tag_name("class")) {
            let class = ApiClass::parse(class_node, &datatypes)?;
            if class_by_index.insert(class.index, classes.len()).is_some() {
                return Err(BgError::ApiDescription(format!(
                    "duplicate class index {} in device '{}'",
                    class.index, device_name
                )));
            }
            if class_by_name.insert(class.name.clone(), classes.len()).is_some() {
                return Err(BgError::ApiDescription(format!(
                    "duplicate class name '{}' in device '{}'",
                    class.name, device_name
                )));
            }
            classes.push(class);
        }

        Ok(DeviceApi {
            device_id: device_id as u8,
            device_name,
            version: root.attribute("version").map(str::to_owned),
            description: child_text(root, "description"),
            datatypes,
            classes,
            class_by_name,
            class_by_index,
        })
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, BgError> {
        let xml = fs::read_to_string(path)?;
        Self::from_xml(&xml)
    }

    pub fn classes(&self) -> &[ApiClass] {
        &self.classes
    }

    pub fn class(&self, name: &str) -> Option<&ApiClass> {
        self.class_by_name.get(name).map(|&i| &self.classes[i])
    }

    pub fn class_by_index(&self, index: u8) -> Option<&ApiClass> {
        self.class_by_index.get(&index).map(|&i| &self.classes[i])
    }

    pub fn datatype(&self, name: &str) -> Option<&Datatype> {
        self.datatypes.get(name)
    }

    pub(crate) fn class_position(&self, index: u8) -> Option<usize> {
        self.class_by_index.get(&index).copied()
    }

    pub(crate) fn class_position_by_name(&self, name: &str) -> Option<usize> {
        self.class_by_name.get(name).copied()
    }
}

/// The device APIs loaded into one host, keyed by id and by name.
/// `device_id` disambiguates inbound frames when several APIs are loaded.
#[derive(Debug, Clone, Default)]
pub struct ApiRegistry {
    apis: Vec<Arc<DeviceApi>>,
    by_id: HashMap<u8, usize>,
    by_name: HashMap<String, usize>,
}

impl ApiRegistry {
    pub fn new(apis: impl IntoIterator<Item = DeviceApi>) -> Result<Self, BgError> {
        let mut registry = ApiRegistry::default();
        for api in apis {
            if registry.by_id.contains_key(&api.device_id) {
                return Err(BgError::ApiDescription(format!(
                    "duplicate device id {} ('{}')",
                    api.device_id, api.device_name
                )));
            }
            if registry.by_name.contains_key(&api.device_name) {
                return Err(BgError::ApiDescription(format!(
                    "duplicate device name '{}'",
                    api.device_name
                )));
            }
            registry.by_id.insert(api.device_id, registry.apis.len());
            registry.by_name.insert(api.device_name.clone(), registry.apis.len());
            registry.apis.push(Arc::new(api));
        }
        Ok(registry)
    }

    /// Load and register every description file in order.
    pub fn from_files<P: AsRef<Path>>(paths: impl IntoIterator<Item = P>) -> Result<Self, BgError> {
        let apis = paths
            .into_iter()
            .map(DeviceApi::from_file)
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(apis)
    }

    pub fn by_id(&self, device_id: u8) -> Option<&Arc<DeviceApi>> {
        self.by_id.get(&device_id).map(|&i| &self.apis[i])
    }

    pub fn by_name(&self, device_name: &str) -> Option<&Arc<DeviceApi>> {
        self.by_name.get(device_name).map(|&i| &self.apis[i])
    }

    pub fn contains_id(&self, device_id: u8) -> bool {
        self.by_id.contains_key(&device_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<DeviceApi>> {
        self.apis.iter()
    }
}

fn required_attr<'a>(node: Node<'a, '_>, name: &str) -> Result<&'a str, BgError> {
    node.attribute(name).ok_or_else(|| {
        BgError::ApiDescription(format!(
            "<{}> is missing required attribute '{}'",
            node.tag_name().name(),
            name
        ))
    })
}

fn int_attr(node: Node, name: &str) -> Result<i128, BgError> {
    let text = required_attr(node, name)?;
    parse_number(text).ok_or_else(|| {
        BgError::ApiDescription(format!(
            "<{}> attribute '{}' is not a valid integer: '{}'",
            node.tag_name().name(),
            name,
            text
        ))
    })
}

fn u8_attr(node: Node, name: &str) -> Result<u8, BgError> {
    let value = int_attr(node, name)?;
    u8::try_from(value).map_err(|_| {
        BgError::ApiDescription(format!(
            "<{}> attribute '{}' is out of range: {}",
            node.tag_name().name(),
            name,
            value
        ))
    })
}

/// Boolean attributes are true only for "1" or "true"; absence is false.
fn bool_attr(node: Node, name: &str) -> bool {
    matches!(node.attribute(name), Some("1") | Some("true"))
}

fn child_text(node: Node, tag: &str) -> String {
    node.children()
        .find(|n| n.has_tag_name(tag))
        .and_then(|n| n.text())
        .unwrap_or_default()
        .trim()
        .to_owned()
}
