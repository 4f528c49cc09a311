//! Process plugins: per-packet hooks that enrich flows with extensions.
//!
//! A [`ProcessPlugin`] is invoked by the flow cache at fixed points of the
//! flow lifecycle (`pre_create`, `post_create`, `pre_update`,
//! `post_update`, `pre_export`). Hooks return [`HookFlags`] which the
//! cache OR-combines across plugins; the two bits it interprets request a
//! flush of the current record, optionally recreating it from the same
//! packet.
//!
//! Plugins are registered by name into a [`PluginRegistry`] built
//! explicitly at startup; registration order fixes both the dispatch
//! order and the extension id of each plugin. Every storage instance
//! works on its own clones, so plugin state never crosses threads.

pub mod pstats;

use crate::config::PluginParams;
use crate::error::ProbeError;
use crate::flow::{ExtId, Flow};
use crate::packet::Packet;
use std::ops::{BitOr, BitOrAssign};

/// Upper bound on distinct extension ids; the exporter keys templates by
/// a 64-bit extension set.
pub const MAX_EXTENSIONS: usize = 64;

/// Control bits returned by plugin hooks and OR-combined by the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HookFlags(u8);

impl HookFlags {
    pub const NONE: HookFlags = HookFlags(0);
    /// Export the current record immediately.
    pub const FLUSH: HookFlags = HookFlags(0x01);
    /// Export the current record and recreate it from the same packet.
    pub const FLUSH_WITH_REINSERT: HookFlags = HookFlags(0x02 | 0x01);

    #[inline]
    pub fn contains(self, other: HookFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for HookFlags {
    type Output = HookFlags;

    fn bitor(self, rhs: HookFlags) -> HookFlags {
        HookFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for HookFlags {
    fn bitor_assign(&mut self, rhs: HookFlags) {
        self.0 |= rhs.0;
    }
}

/// A flow-processing plugin.
///
/// Hook default implementations do nothing, so a plugin only overrides
/// the lifecycle points it cares about.
pub trait ProcessPlugin: Send {
    fn name(&self) -> &'static str;

    /// Extension id assigned at registration.
    fn ext_id(&self) -> ExtId;

    /// Apply plugin parameters. Called once before the pipeline starts.
    fn init(&mut self, _params: &PluginParams) -> Result<(), ProbeError> {
        Ok(())
    }

    /// Clone this plugin for another storage instance.
    fn clone_plugin(&self) -> Box<dyn ProcessPlugin>;

    /// Template field names for flows carrying this plugin's extension,
    /// in the order the extension's `fill_ipfix` writes them.
    fn ext_template(&self) -> &'static [&'static str] {
        &[]
    }

    /// Called for every packet before the cache lookup.
    fn pre_create(&mut self, _pkt: &mut Packet) -> HookFlags {
        HookFlags::NONE
    }

    /// Called right after a flow record is created from a packet.
    fn post_create(&mut self, _flow: &mut Flow, _pkt: &Packet) -> HookFlags {
        HookFlags::NONE
    }

    /// Called before a packet is merged into an existing flow.
    fn pre_update(&mut self, _flow: &mut Flow, _pkt: &Packet) -> HookFlags {
        HookFlags::NONE
    }

    /// Called after a packet has been merged into a flow.
    fn post_update(&mut self, _flow: &mut Flow, _pkt: &Packet) -> HookFlags {
        HookFlags::NONE
    }

    /// Called before a flow is exported on a timeout or eviction path.
    fn pre_export(&mut self, _flow: &mut Flow) {}

    /// Called once when the pipeline shuts down.
    fn finish(&mut self, _print_stats: bool) {}
}

type PluginFactory = fn(ExtId) -> Box<dyn ProcessPlugin>;

struct RegistryEntry {
    name: &'static str,
    ext_id: ExtId,
    factory: PluginFactory,
}

/// Directory of process plugins, built deterministically at startup.
pub struct PluginRegistry {
    entries: Vec<RegistryEntry>,
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Registry preloaded with the built-in plugins.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry
            .register("pstats", |id| Box::new(pstats::PstatsPlugin::new(id)))
            .expect("builtin registration cannot collide");
        registry
    }

    /// Register a plugin factory. The next free extension id is assigned
    /// to the name; duplicate names and exhausted id space are errors.
    pub fn register(
        &mut self,
        name: &'static str,
        factory: PluginFactory,
    ) -> Result<ExtId, ProbeError> {
        if self.entries.iter().any(|e| e.name == name) {
            return Err(ProbeError::Config(format!(
                "process plugin `{name}` registered twice"
            )));
        }
        let ext_id = self.entries.len();
        if ext_id >= MAX_EXTENSIONS {
            return Err(ProbeError::Config(format!(
                "more than {MAX_EXTENSIONS} process plugins registered"
            )));
        }
        self.entries.push(RegistryEntry {
            name,
            ext_id,
            factory,
        });
        Ok(ext_id)
    }

    /// Instantiate and initialise the plugin named by `params`.
    pub fn create(&self, params: &PluginParams) -> Result<Box<dyn ProcessPlugin>, ProbeError> {
        let entry = self
            .entries
            .iter()
            .find(|e| e.name == params.name())
            .ok_or_else(|| {
                ProbeError::Config(format!("unknown process plugin `{}`", params.name()))
            })?;
        let mut plugin = (entry.factory)(entry.ext_id);
        plugin.init(params)?;
        Ok(plugin)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.iter().map(|e| e.name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_combine_with_or() {
        let mut flags = HookFlags::NONE;
        assert!(flags.is_empty());
        flags |= HookFlags::FLUSH;
        assert!(flags.contains(HookFlags::FLUSH));
        assert!(!flags.contains(HookFlags::FLUSH_WITH_REINSERT));
        flags |= HookFlags::FLUSH_WITH_REINSERT;
        assert!(flags.contains(HookFlags::FLUSH_WITH_REINSERT));
    }

    #[test]
    fn registry_assigns_ids_in_registration_order() {
        let registry = PluginRegistry::with_builtins();
        let plugin = registry
            .create(&PluginParams::named("pstats"))
            .expect("builtin plugin instantiates");
        assert_eq!(plugin.ext_id(), 0);
        assert_eq!(plugin.name(), "pstats");
    }

    #[test]
    fn unknown_plugin_is_a_config_error() {
        let registry = PluginRegistry::with_builtins();
        assert!(registry.create(&PluginParams::named("nosuch")).is_err());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = PluginRegistry::with_builtins();
        let result = registry.register("pstats", |id| {
            Box::new(pstats::PstatsPlugin::new(id))
        });
        assert!(result.is_err());
    }
}
