//! Machine configuration.
//!
//! The configuration file is TOML with kebab-case keys: `[machine]`,
//! `[memory]`, `[cpu]`, `[bootloader]` plus numbered `[binary-N]` and
//! `[device-N]` sections. `--set section:key=value` overrides are applied to
//! the raw table before deserialization.

use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use toml::{Table, Value};

use crate::trap::VmError;

fn config_err(err: impl std::fmt::Display) -> VmError {
    VmError::Configuration(err.to_string())
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct MachineSection {
    pub cpus: u32,
    pub cores: u32,
    pub hdt_address: u32,
    /// 0 means unlimited.
    pub max_instructions: u64,
    /// 0 means unlimited.
    pub max_seconds: u64,
}

impl Default for MachineSection {
    fn default() -> Self {
        MachineSection {
            cpus: 1,
            cores: 1,
            hdt_address: 0x100,
            max_instructions: 0,
            max_seconds: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct MemorySection {
    pub size: u32,
    pub force_aligned_access: bool,
}

impl Default for MemorySection {
    fn default() -> Self {
        MemorySection {
            size: 0x10000,
            force_aligned_access: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct CpuSection {
    /// Instruction-cache entries, 0 disables the cache.
    pub instr_cache: usize,
    /// Translation-cache entries, 0 disables the cache.
    pub tlb: usize,
    pub math_coprocessor: bool,
    pub check_frames: bool,
}

impl Default for CpuSection {
    fn default() -> Self {
        CpuSection {
            instr_cache: 256,
            tlb: 64,
            math_coprocessor: true,
            check_frames: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct BootloaderSection {
    pub file: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct BinarySection {
    pub file: PathBuf,
    /// Entry symbol resolved through the binary's symbol table. Defaults to
    /// the base of the first TEXT section.
    #[serde(default)]
    pub entry: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DeviceSection {
    /// Instance name, the `[device-N]` section key. Filled in after parse.
    #[serde(skip)]
    pub name: String,
    pub klass: String,
    pub driver: String,
    #[serde(default)]
    pub mmio_base: Option<u32>,
    #[serde(default)]
    pub irq: Option<u32>,
    /// Driver-specific keys.
    #[serde(flatten)]
    pub extra: Table,
}

impl DeviceSection {
    pub fn str_key(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(Value::as_str)
    }

    pub fn int_key(&self, key: &str) -> Option<i64> {
        self.extra.get(key).and_then(Value::as_integer)
    }
}

/// The parsed machine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub machine: MachineSection,
    pub memory: MemorySection,
    pub cpu: CpuSection,
    pub bootloader: Option<BootloaderSection>,
    pub binaries: Vec<BinarySection>,
    pub devices: Vec<DeviceSection>,
}

impl Config {
    pub fn parse(text: &str) -> Result<Config, VmError> {
        let table: Table = text.parse().map_err(config_err)?;
        Config::from_table(&table)
    }

    /// Parse with `section:key=value` overrides applied first.
    pub fn parse_with_overrides(text: &str, overrides: &[String]) -> Result<Config, VmError> {
        let mut table: Table = text.parse().map_err(config_err)?;
        for spec in overrides {
            apply_override(&mut table, spec)?;
        }
        Config::from_table(&table)
    }

    pub fn from_table(table: &Table) -> Result<Config, VmError> {
        let machine: MachineSection = section_or_default(table, "machine")?;
        let memory: MemorySection = section_or_default(table, "memory")?;
        let cpu: CpuSection = section_or_default(table, "cpu")?;
        let bootloader = match table.get("bootloader") {
            Some(value) => Some(deserialize_section("bootloader", value)?),
            None => None,
        };

        let mut binaries = Vec::new();
        for (name, value) in numbered_sections(table, "binary-")? {
            let binary: BinarySection = deserialize_section(&name, value)?;
            binaries.push(binary);
        }

        let mut devices = Vec::new();
        for (name, value) in numbered_sections(table, "device-")? {
            let mut device: DeviceSection = deserialize_section(&name, value)?;
            device.name = name;
            devices.push(device);
        }

        let config = Config {
            machine,
            memory,
            cpu,
            bootloader,
            binaries,
            devices,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), VmError> {
        if self.machine.cpus == 0 || self.machine.cores == 0 {
            return Err(VmError::Configuration(
                "machine needs at least one cpu and one core".into(),
            ));
        }
        if self.memory.size < crate::mem::PAGE_SIZE * 4 {
            return Err(VmError::Configuration(format!(
                "memory size {:#x} is too small",
                self.memory.size
            )));
        }
        for device in &self.devices {
            if device.klass.is_empty() || device.driver.is_empty() {
                return Err(VmError::Configuration(format!(
                    "device {} needs klass and driver",
                    device.name
                )));
            }
        }
        Ok(())
    }

    pub fn core_count(&self) -> usize {
        (self.machine.cpus * self.machine.cores) as usize
    }
}

fn section_or_default<T>(table: &Table, name: &str) -> Result<T, VmError>
where
    T: DeserializeOwned + Default,
{
    match table.get(name) {
        Some(value) => deserialize_section(name, value),
        None => Ok(T::default()),
    }
}

fn deserialize_section<T: DeserializeOwned>(name: &str, value: &Value) -> Result<T, VmError> {
    value
        .clone()
        .try_into()
        .map_err(|e| VmError::Configuration(format!("section [{name}]: {e}")))
}

/// Collect `prefix-N` sections in numeric order.
fn numbered_sections<'a>(
    table: &'a Table,
    prefix: &str,
) -> Result<Vec<(String, &'a Value)>, VmError> {
    let mut sections = Vec::new();
    for (key, value) in table {
        if let Some(suffix) = key.strip_prefix(prefix) {
            let index: u32 = suffix.parse().map_err(|_| {
                VmError::Configuration(format!("section [{key}]: bad index {suffix:?}"))
            })?;
            sections.push((index, key.clone(), value));
        }
    }
    sections.sort_by_key(|(index, _, _)| *index);
    Ok(sections
        .into_iter()
        .map(|(_, name, value)| (name, value))
        .collect())
}

/// Apply one `section:key=value` override to a raw configuration table.
pub fn apply_override(table: &mut Table, spec: &str) -> Result<(), VmError> {
    let (section, rest) = spec
        .split_once(':')
        .ok_or_else(|| VmError::Configuration(format!("bad override {spec:?}")))?;
    let (key, raw) = rest
        .split_once('=')
        .ok_or_else(|| VmError::Configuration(format!("bad override {spec:?}")))?;

    let value = parse_value(raw);
    let entry = table
        .entry(section.to_string())
        .or_insert_with(|| Value::Table(Table::new()));
    match entry {
        Value::Table(section_table) => {
            section_table.insert(key.to_string(), value);
            Ok(())
        }
        _ => Err(VmError::Configuration(format!(
            "override target [{section}] is not a section"
        ))),
    }
}

fn parse_value(raw: &str) -> Value {
    if let Some(hex) = raw.strip_prefix("0x") {
        if let Ok(number) = i64::from_str_radix(hex, 16) {
            return Value::Integer(number);
        }
    }
    if let Ok(number) = raw.parse::<i64>() {
        return Value::Integer(number);
    }
    match raw {
        "true" | "yes" => Value::Boolean(true),
        "false" | "no" => Value::Boolean(false),
        _ => Value::String(raw.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[machine]
cpus = 1
cores = 2
hdt-address = 0x100

[memory]
size = 65536

[cpu]
math-coprocessor = true

[binary-0]
file = "kernel.bin"
entry = "main"

[device-0]
klass = "rtc"
driver = "rtc"
mmio-base = 0x9000
irq = 8
frequency = 100

[device-1]
klass = "keyboard"
driver = "keyboard"
mmio-base = 0x9100
irq = 9
"#;

    #[test]
    fn parses_sections() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(config.core_count(), 2);
        assert_eq!(config.machine.hdt_address, 0x100);
        assert_eq!(config.memory.size, 65536);
        assert!(config.memory.force_aligned_access);
        assert_eq!(config.binaries.len(), 1);
        assert_eq!(config.binaries[0].entry.as_deref(), Some("main"));
        assert_eq!(config.devices.len(), 2);
        assert_eq!(config.devices[0].name, "device-0");
        assert_eq!(config.devices[0].int_key("frequency"), Some(100));
        assert_eq!(config.devices[1].mmio_base, Some(0x9100));
    }

    #[test]
    fn devices_come_in_numeric_order() {
        let text = r#"
[device-10]
klass = "tty"
driver = "tty"
mmio-base = 0x9200

[device-2]
klass = "rtc"
driver = "rtc"
mmio-base = 0x9000
"#;
        let config = Config::parse(text).unwrap();
        assert_eq!(config.devices[0].name, "device-2");
        assert_eq!(config.devices[1].name, "device-10");
    }

    #[test]
    fn override_changes_value() {
        let mut table: Table = SAMPLE.parse().unwrap();
        apply_override(&mut table, "memory:size=131072").unwrap();
        apply_override(&mut table, "machine:max-instructions=0x100").unwrap();
        let config = Config::from_table(&table).unwrap();
        assert_eq!(config.memory.size, 131072);
        assert_eq!(config.machine.max_instructions, 0x100);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let text = "[machine]\nfrobs = 3\n";
        assert!(Config::parse(text).is_err());
    }

    #[test]
    fn zero_cores_rejected() {
        let text = "[machine]\ncores = 0\n";
        assert!(matches!(
            Config::parse(text),
            Err(VmError::Configuration(_))
        ));
    }
}
