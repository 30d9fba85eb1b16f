//! Platform description
//!
//! A TOML file listing CPUs, targets, the interconnect and the parameters to
//! apply at elaboration or later in simulated time. Times are written as
//! strings with a unit (`"10 ns"`); addresses as integers.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::addr::AddrSpace;
use crate::devices::MemoryConfig;
use crate::error::{Result, VpError};
use crate::gic::GicConfig;
use crate::interconnect::noc::{NocConfig, RouterId};
use crate::interconnect::ExclusiveConfig;
use crate::param::Parameter;
use crate::target::LatencyModel;
use crate::time::SimTime;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    /// Global quantum shared by every CPU.
    pub quantum: SimTime,
    pub stop_on_any_core: bool,
    pub cpus: Vec<CpuEntry>,
    pub memories: Vec<MemoryConfig>,
    pub peripherals: Vec<PeripheralEntry>,
    pub interconnect: InterconnectConfig,
    pub gic: Option<GicConfig>,
    pub exclusive: ExclusiveConfig,
    /// Applied once the platform is assembled.
    pub parameters: Vec<ParamEntry>,
    pub appointments: Vec<AppointmentEntry>,
    pub generators: Vec<GeneratorEntry>,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        PlatformConfig {
            quantum: SimTime::from_us(1),
            stop_on_any_core: false,
            cpus: Vec::new(),
            memories: Vec::new(),
            peripherals: Vec::new(),
            interconnect: InterconnectConfig::default(),
            gic: None,
            exclusive: ExclusiveConfig::default(),
            parameters: Vec::new(),
            appointments: Vec::new(),
            generators: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuEntry {
    pub name: String,
    pub cpu_period: SimTime,
    pub timer_period: SimTime,
    pub instr_quantum: u64,
    /// Native ISS library. Without one, a backend must be attached by hand
    /// before the platform starts.
    pub backend: Option<NativeSpec>,
    pub elf: Option<PathBuf>,
    /// Memories advertised to the backend as DMI regions before start.
    pub premap: Vec<String>,
}

impl Default for CpuEntry {
    fn default() -> Self {
        CpuEntry {
            name: "cpu0".into(),
            cpu_period: SimTime::from_ns(1),
            timer_period: SimTime::from_ns(1),
            instr_quantum: 1000,
            backend: None,
            elf: None,
            premap: Vec::new(),
        }
    }
}

/// Where and how to load an ISS library.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NativeSpec {
    /// `base:sub1,sub2,...` directory search spec.
    pub search: String,
    pub prefix: String,
    pub arch: String,
    pub suffix: String,
    pub model: String,
    pub gdb: bool,
    pub init_pc: u64,
}

impl Default for NativeSpec {
    fn default() -> Self {
        NativeSpec {
            search: ".".into(),
            prefix: "vpsim".into(),
            arch: "arm64".into(),
            suffix: ".so".into(),
            model: "cortex-a53".into(),
            gdb: false,
            init_pc: 0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeripheralEntry {
    pub name: String,
    pub base: u64,
    pub size: u64,
    /// Shared interrupt id driven on the GIC.
    #[serde(default)]
    pub irq: Option<u32>,
    #[serde(default)]
    pub latency: LatencyModel,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InterconnectConfig {
    Bus {
        #[serde(default)]
        latency: SimTime,
    },
    Noc {
        #[serde(default)]
        noc: NocConfig,
        /// Router of every component, by name. The GIC windows go under the
        /// GIC's name.
        #[serde(default)]
        placement: BTreeMap<String, RouterId>,
    },
}

impl Default for InterconnectConfig {
    fn default() -> Self {
        InterconnectConfig::Bus { latency: SimTime::ZERO }
    }
}

/// A parameter set on a module. Without `base` and `size` it covers the
/// module's own space.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParamEntry {
    pub module: String,
    #[serde(default)]
    pub base: Option<u64>,
    #[serde(default)]
    pub size: Option<u64>,
    pub value: Parameter,
}

impl ParamEntry {
    pub fn space(&self) -> Result<Option<AddrSpace>> {
        window(&self.module, self.base, self.size)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppointmentEntry {
    pub module: String,
    pub date: SimTime,
    #[serde(default)]
    pub base: Option<u64>,
    #[serde(default)]
    pub size: Option<u64>,
    pub value: Parameter,
}

impl AppointmentEntry {
    pub fn space(&self) -> Result<Option<AddrSpace>> {
        window(&self.module, self.base, self.size)
    }
}

fn window(module: &str, base: Option<u64>, size: Option<u64>) -> Result<Option<AddrSpace>> {
    match (base, size) {
        (None, None) => Ok(None),
        (Some(b), Some(s)) => AddrSpace::from_size(b, s).map(Some),
        _ => Err(VpError::config(format!("{}: parameter window needs both base and size", module))),
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorEntry {
    pub name: String,
    pub requests: u64,
    pub access_bytes: usize,
    pub gap: SimTime,
    pub seed: u64,
    /// Target names to pick from; every memory when empty.
    pub targets: Vec<String>,
}

impl Default for GeneratorEntry {
    fn default() -> Self {
        GeneratorEntry {
            name: "gen0".into(),
            requests: 1000,
            access_bytes: 8,
            gap: SimTime::from_ns(10),
            seed: 0,
            targets: Vec::new(),
        }
    }
}

impl PlatformConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let cfg: PlatformConfig = text.parse()?;
        tracing::info!("platform description loaded from {}", path.display());
        Ok(cfg)
    }

    /// Consistency checks that do not need the platform built.
    pub fn validate(&self) -> Result<()> {
        if self.quantum.is_zero() {
            return Err(VpError::config("quantum must be non-zero"));
        }
        let mut names: BTreeMap<&str, &str> = BTreeMap::new();
        let all = self
            .cpus
            .iter()
            .map(|c| (c.name.as_str(), "cpu"))
            .chain(self.memories.iter().map(|m| (m.name.as_str(), "memory")))
            .chain(self.peripherals.iter().map(|p| (p.name.as_str(), "peripheral")))
            .chain(self.generators.iter().map(|g| (g.name.as_str(), "generator")));
        for (name, what) in all {
            if let Some(prev) = names.insert(name, what) {
                return Err(VpError::config(format!("name '{}' used by a {} and a {}", name, prev, what)));
            }
        }
        if let Some(gic) = &self.gic {
            if self.cpus.len() > gic.num_cpus {
                return Err(VpError::config(format!(
                    "{} CPUs but the GIC serves {}",
                    self.cpus.len(),
                    gic.num_cpus
                )));
            }
        } else if let Some(p) = self.peripherals.iter().find(|p| p.irq.is_some()) {
            return Err(VpError::config(format!("{} raises an interrupt but there is no GIC", p.name)));
        }
        for c in &self.cpus {
            if c.backend.is_none() && (c.elf.is_some() || !c.premap.is_empty()) {
                return Err(VpError::config(format!("{}: ELF or premap given without a backend", c.name)));
            }
        }
        for p in &self.parameters {
            p.value.validate()?;
            p.space()?;
        }
        for a in &self.appointments {
            a.value.validate()?;
            a.space()?;
        }
        Ok(())
    }
}

impl FromStr for PlatformConfig {
    type Err = VpError;

    fn from_str(s: &str) -> Result<Self> {
        let cfg: PlatformConfig = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interconnect::noc::{TimingMode, TopologySpec};
    use crate::param::BlockingTlm;

    const SOC: &str = r#"
quantum = "10 us"

[[cpus]]
name = "cpu0"
cpu_period = "2 ns"

[[memories]]
name = "ram"
base = 0x8000_0000
size = 0x10_0000

[[peripherals]]
name = "uart"
base = 0x1000_0000
size = 0x100
irq = 33

[gic]
num_cpus = 1

[interconnect]
kind = "noc"
placement = { cpu0 = 0, ram = 3, uart = 1, gic = 2 }

[interconnect.noc]
topology = { kind = "mesh", x = 2, y = 2 }
timing = "cycle_accurate"
link_bytes = 16

[[parameters]]
module = "ram"
value = { blocking_tlm_enabled = "disabled" }

[[appointments]]
module = "ram"
date = "1 ms"
base = 0x8000_0000
size = 0x1000
value = { approximate_delay = "50 ns" }
"#;

    #[test]
    fn test_parse_full_description() {
        let cfg: PlatformConfig = SOC.parse().unwrap();
        assert_eq!(cfg.quantum, SimTime::from_us(10));
        assert_eq!(cfg.cpus[0].cpu_period, SimTime::from_ns(2));
        assert_eq!(cfg.cpus[0].timer_period, SimTime::from_ns(1));
        assert_eq!(cfg.memories[0].base, 0x8000_0000);
        assert!(cfg.memories[0].dmi);
        assert_eq!(cfg.peripherals[0].irq, Some(33));
        assert_eq!(cfg.gic.unwrap().dist_base, GicConfig::default().dist_base);

        let InterconnectConfig::Noc { noc, placement } = &cfg.interconnect else {
            panic!("expected a NoC");
        };
        assert_eq!(noc.topology, TopologySpec::Mesh { x: 2, y: 2 });
        assert_eq!(noc.timing, TimingMode::CycleAccurate);
        assert_eq!(noc.link_bytes, 16);
        assert_eq!(noc.fifo_depth, NocConfig::default().fifo_depth);
        assert_eq!(placement["ram"], 3);

        assert_eq!(cfg.parameters[0].value, Parameter::BlockingTlmEnabled(BlockingTlm::Disabled));
        assert_eq!(cfg.parameters[0].space().unwrap(), None);
        let a = &cfg.appointments[0];
        assert_eq!(a.date, SimTime::from_ms(1));
        assert_eq!(a.value, Parameter::delay(SimTime::from_ns(50)));
        assert_eq!(a.space().unwrap(), Some(AddrSpace::from_size(0x8000_0000, 0x1000).unwrap()));
    }

    #[test]
    fn test_defaults_to_a_bus() {
        let cfg: PlatformConfig = "".parse().unwrap();
        assert!(matches!(cfg.interconnect, InterconnectConfig::Bus { latency } if latency.is_zero()));
        assert_eq!(cfg.exclusive, ExclusiveConfig::default());
    }

    #[test]
    fn test_rejects_inconsistent_descriptions() {
        let dup = "[[cpus]]\nname = \"x\"\n[[memories]]\nname = \"x\"\n";
        assert!(matches!(dup.parse::<PlatformConfig>(), Err(VpError::Configuration(_))));

        let no_gic = "[[peripherals]]\nname = \"uart\"\nbase = 0\nsize = 16\nirq = 40\n";
        assert!(matches!(no_gic.parse::<PlatformConfig>(), Err(VpError::Configuration(_))));

        let half = "[[parameters]]\nmodule = \"ram\"\nbase = 0\nvalue = { approximate_delay = \"1 ns\" }\n";
        assert!(matches!(half.parse::<PlatformConfig>(), Err(VpError::Configuration(_))));

        let rate = "[[parameters]]\nmodule = \"ram\"\nvalue = { approximate_traversal_rate = 1.5 }\n";
        assert!(matches!(rate.parse::<PlatformConfig>(), Err(VpError::InvalidArgument(_))));

        assert!(matches!("quantum = 3".parse::<PlatformConfig>(), Err(VpError::Toml(_))));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("soc.toml");
        fs::write(&path, SOC).unwrap();
        let cfg = PlatformConfig::from_file(&path).unwrap();
        assert_eq!(cfg.cpus.len(), 1);
        assert!(PlatformConfig::from_file(&dir.path().join("missing.toml")).is_err());
    }
}
