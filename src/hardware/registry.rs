//! Channel registry: maps `(terminal, parameter)` to instrument channels.
//!
//! The registry is the only link between the parameter model and the
//! hardware. It is keyed by [`ParameterKey`], so updating the model never
//! invalidates a mapping.
//!
//! ```rust,ignore
//! let mut registry = ChannelRegistry::new();
//! registry.register_rampable(ParameterKey::new("gate", "voltage"), Arc::new(dac));
//! registry.register_readable(ParameterKey::new("ohmic", "current"), Arc::new(dmm));
//!
//! for (key, capability) in registry.list() {
//!     println!("{key}: {capability}");
//! }
//! ```

use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::hardware::capabilities::{RampSpeed, Rampable, Readable, Settable};
use crate::parameter::{ParameterKey, Value};

/// Highest capability of a registered channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
    /// Read only
    Readable,
    /// Read and set
    Settable,
    /// Read, set and hardware ramp
    Rampable,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Readable => write!(f, "readable"),
            Capability::Settable => write!(f, "settable"),
            Capability::Rampable => write!(f, "rampable"),
        }
    }
}

/// A registered channel with its capability.
#[derive(Clone)]
pub enum Channel {
    /// Read-only channel
    Readable(Arc<dyn Readable>),
    /// Settable channel without ramp
    Settable(Arc<dyn Settable>),
    /// Settable channel with hardware ramp
    Rampable(Arc<dyn Rampable>),
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Channel({})", self.capability())
    }
}

impl Channel {
    /// Capability of the channel.
    pub fn capability(&self) -> Capability {
        match self {
            Channel::Readable(_) => Capability::Readable,
            Channel::Settable(_) => Capability::Settable,
            Channel::Rampable(_) => Capability::Rampable,
        }
    }

    /// True if the channel accepts `set`.
    pub fn can_set(&self) -> bool {
        self.capability() >= Capability::Settable
    }

    /// True if the channel has a hardware ramp.
    pub fn can_ramp(&self) -> bool {
        self.capability() == Capability::Rampable
    }

    /// Read the channel.
    pub async fn get(&self) -> Result<Value> {
        match self {
            Channel::Readable(c) => c.get().await,
            Channel::Settable(c) => c.get().await,
            Channel::Rampable(c) => c.get().await,
        }
    }

    /// Set the channel.
    pub async fn set(&self, value: Value) -> Result<()> {
        match self {
            Channel::Readable(_) => Err(anyhow!("channel is read-only")),
            Channel::Settable(c) => c.set(value).await,
            Channel::Rampable(c) => c.set(value).await,
        }
    }

    /// Hardware ramp to `target`.
    pub async fn ramp(&self, target: f64, speed: RampSpeed) -> Result<()> {
        match self {
            Channel::Rampable(c) => c.ramp(target, speed).await,
            _ => Err(anyhow!("channel has no hardware ramp")),
        }
    }
}

/// Central map from parameter keys to channels.
#[derive(Debug, Clone, Default)]
pub struct ChannelRegistry {
    channels: HashMap<ParameterKey, Channel>,
}

impl ChannelRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a channel.
    pub fn register(&mut self, key: ParameterKey, channel: Channel) -> Option<Channel> {
        tracing::debug!(%key, capability = %channel.capability(), "Registered channel");
        self.channels.insert(key, channel)
    }

    /// Register a read-only channel.
    pub fn register_readable(&mut self, key: ParameterKey, channel: Arc<dyn Readable>) {
        self.register(key, Channel::Readable(channel));
    }

    /// Register a settable channel without hardware ramp.
    pub fn register_settable(&mut self, key: ParameterKey, channel: Arc<dyn Settable>) {
        self.register(key, Channel::Settable(channel));
    }

    /// Register a channel with hardware ramp.
    pub fn register_rampable(&mut self, key: ParameterKey, channel: Arc<dyn Rampable>) {
        self.register(key, Channel::Rampable(channel));
    }

    /// Remove a mapping.
    pub fn unregister(&mut self, key: &ParameterKey) -> Option<Channel> {
        self.channels.remove(key)
    }

    /// Look up a channel.
    pub fn get(&self, key: &ParameterKey) -> Option<&Channel> {
        self.channels.get(key)
    }

    /// True if `key` is mapped.
    pub fn contains(&self, key: &ParameterKey) -> bool {
        self.channels.contains_key(key)
    }

    /// Number of mapped channels.
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// True if nothing is mapped.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Mapped keys with their capability, sorted by key.
    pub fn list(&self) -> Vec<(ParameterKey, Capability)> {
        let mut entries = self
            .channels
            .iter()
            .map(|(k, c)| (k.clone(), c.capability()))
            .collect::<Vec<_>>();
        entries.sort();
        entries
    }

    /// Clone the channels of `keys` that are mapped.
    pub fn snapshot<'a>(&self, keys: impl IntoIterator<Item = &'a ParameterKey>) -> Vec<(ParameterKey, Channel)> {
        keys.into_iter()
            .filter_map(|k| self.channels.get(k).map(|c| (k.clone(), c.clone())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockDac, MockDmm, MockSource};
    use crate::parameter::ParameterModel;

    #[tokio::test]
    async fn capabilities_follow_registration() {
        let mut registry = ChannelRegistry::new();
        registry.register_rampable(ParameterKey::new("gate", "voltage"), Arc::new(MockDac::new(0.0)));
        registry.register_settable(ParameterKey::new("lockin", "frequency"), Arc::new(MockSource::new(17.0)));
        registry.register_readable(ParameterKey::new("ohmic", "current"), Arc::new(MockDmm::constant(0.5)));

        let gate = registry.get(&ParameterKey::new("gate", "voltage")).unwrap();
        assert!(gate.can_ramp());
        let lockin = registry.get(&ParameterKey::new("lockin", "frequency")).unwrap();
        assert!(lockin.can_set() && !lockin.can_ramp());
        let dmm = registry.get(&ParameterKey::new("ohmic", "current")).unwrap();
        assert!(!dmm.can_set());
        assert!(dmm.set(Value::Float(1.0)).await.is_err());
        assert!(lockin.ramp(1.0, RampSpeed::Rate(1.0)).await.is_err());
        assert_eq!(dmm.get().await.unwrap(), Value::Float(0.5));
    }

    #[test]
    fn mappings_survive_model_updates() {
        let model = ParameterModel::from_yaml_str("gate:\n  voltage: { type: static, value: 0.0 }\n").unwrap();
        let mut registry = ChannelRegistry::new();
        for spec in model.specs() {
            registry.register_rampable(spec.key().clone(), Arc::new(MockDac::new(0.0)));
        }

        let updated = model
            .update(&serde_yaml::from_str("gate:\n  voltage: { type: dynamic, setpoints: [0, 1] }\nohmic:\n  current: { type: gettable }\n").unwrap())
            .unwrap();
        assert!(registry.contains(updated.dynamic()[0].key()));
        assert!(!registry.contains(updated.gettables()[0].key()));
        assert_eq!(registry.list().len(), 1);
    }
}
