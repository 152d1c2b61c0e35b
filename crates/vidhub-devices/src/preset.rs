/*!
 * Routing presets.
 *
 * A preset is a named set of crosspoints (output to input) captured from a
 * router. Recalling it sends all crosspoints as one routing command. The
 * store is plain data and serializes to JSON for persistence.
 */
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::device::{DeviceError, Result};
use crate::devices::videohub::VideohubDevice;

/// A named set of crosspoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preset {
    /// Position in the store
    pub index: usize,
    /// Display name
    pub name: String,
    /// Routed input per output
    pub crosspoints: BTreeMap<usize, usize>,
}

impl Preset {
    /// Whether every crosspoint matches `routing`
    ///
    /// An empty preset is never active.
    pub fn is_active(&self, routing: &[usize]) -> bool {
        !self.crosspoints.is_empty()
            && self
                .crosspoints
                .iter()
                .all(|(output, input)| routing.get(*output) == Some(input))
    }

    /// Crosspoints as `(output, input)` pairs
    pub fn routes(&self) -> Vec<(usize, usize)> {
        self.crosspoints.iter().map(|(o, i)| (*o, *i)).collect()
    }
}

/// Presets of one router
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresetStore {
    presets: Vec<Preset>,
}

impl PresetStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of presets
    pub fn len(&self) -> usize {
        self.presets.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.presets.is_empty()
    }

    /// Preset at `index`
    pub fn get(&self, index: usize) -> Option<&Preset> {
        self.presets.get(index)
    }

    /// All presets in index order
    pub fn iter(&self) -> impl Iterator<Item = &Preset> {
        self.presets.iter()
    }

    /// Capture crosspoints from `routing` into a new preset
    ///
    /// With `outputs`, only those outputs are captured; otherwise every
    /// output is.
    pub fn store(
        &mut self,
        name: Option<&str>,
        routing: &[usize],
        outputs: Option<&[usize]>,
    ) -> Result<&Preset> {
        let crosspoints = capture(routing, outputs)?;
        let index = self.presets.len();
        let name = match name {
            Some(name) => name.to_string(),
            None => format!("Preset {}", index + 1),
        };
        info!(index, name = %name, crosspoints = crosspoints.len(), "Storing preset");
        self.presets.push(Preset {
            index,
            name,
            crosspoints,
        });
        Ok(&self.presets[index])
    }

    /// Capture the current routing of `device` into a new preset
    pub fn store_from(
        &mut self,
        device: &VideohubDevice,
        name: Option<&str>,
        outputs: Option<&[usize]>,
    ) -> Result<&Preset> {
        let routing = device.output_routing();
        self.store(name, &routing, outputs)
    }

    /// Replace the crosspoints of preset `index`
    pub fn update(&mut self, index: usize, routing: &[usize], outputs: Option<&[usize]>) -> Result<()> {
        let crosspoints = capture(routing, outputs)?;
        let len = self.presets.len();
        let preset = self
            .presets
            .get_mut(index)
            .ok_or_else(|| DeviceError::out_of_range("presets", index, len))?;
        preset.crosspoints = crosspoints;
        Ok(())
    }

    /// Rename preset `index`
    pub fn rename(&mut self, index: usize, name: &str) -> Result<()> {
        let len = self.presets.len();
        let preset = self
            .presets
            .get_mut(index)
            .ok_or_else(|| DeviceError::out_of_range("presets", index, len))?;
        preset.name = name.to_string();
        Ok(())
    }

    /// Remove preset `index`; later presets move down one position
    pub fn remove(&mut self, index: usize) -> Result<Preset> {
        if index >= self.presets.len() {
            return Err(DeviceError::out_of_range("presets", index, self.presets.len()));
        }
        let removed = self.presets.remove(index);
        for (i, preset) in self.presets.iter_mut().enumerate().skip(index) {
            preset.index = i;
        }
        Ok(removed)
    }

    /// Presets whose crosspoints all match `routing`
    pub fn active_presets(&self, routing: &[usize]) -> Vec<&Preset> {
        self.presets.iter().filter(|p| p.is_active(routing)).collect()
    }

    /// Send preset `index` to `device`
    ///
    /// Returns the device's answer as [`VideohubDevice::set_routes`] does.
    pub async fn recall(&self, index: usize, device: &VideohubDevice) -> Result<bool> {
        let preset = self
            .get(index)
            .ok_or_else(|| DeviceError::out_of_range("presets", index, self.len()))?;
        debug!(index, name = %preset.name, "Recalling preset");
        device.set_routes(&preset.routes()).await
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Load from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

fn capture(routing: &[usize], outputs: Option<&[usize]>) -> Result<BTreeMap<usize, usize>> {
    match outputs {
        None => Ok(routing.iter().copied().enumerate().collect()),
        Some(outputs) => outputs
            .iter()
            .map(|&output| {
                routing
                    .get(output)
                    .map(|&input| (output, input))
                    .ok_or_else(|| DeviceError::out_of_range("output_routing", output, routing.len()))
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::device::Device;
    use crate::telnet::ClientOptions;
    use crate::transport::mock::MockConnector;

    #[test]
    fn test_store_and_match() {
        let mut store = PresetStore::new();
        let routing = vec![3, 4, 0, 0];

        let preset = store.store(None, &routing, Some(&[0, 1][..])).unwrap();
        assert_eq!(preset.name, "Preset 1");
        assert_eq!(preset.routes(), vec![(0, 3), (1, 4)]);

        store.store(Some("All"), &routing, None).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.active_presets(&routing).len(), 2);

        let changed = vec![3, 4, 1, 0];
        let active = store.active_presets(&changed);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].index, 0);
    }

    #[test]
    fn test_invalid_indices() {
        let mut store = PresetStore::new();
        assert!(matches!(
            store.store(None, &[0, 0], Some(&[2][..])),
            Err(DeviceError::IndexOutOfRange { index: 2, len: 2, .. })
        ));
        assert!(store.rename(0, "x").is_err());
        assert!(store.remove(0).is_err());
        assert!(store.is_empty());
    }

    #[test]
    fn test_remove_reindexes() {
        let mut store = PresetStore::new();
        store.store(Some("a"), &[0], None).unwrap();
        store.store(Some("b"), &[1], None).unwrap();
        store.store(Some("c"), &[2], None).unwrap();

        let removed = store.remove(0).unwrap();
        assert_eq!(removed.name, "a");
        let names: Vec<_> = store.iter().map(|p| (p.index, p.name.as_str())).collect();
        assert_eq!(names, vec![(0, "b"), (1, "c")]);

        store.rename(1, "camera c").unwrap();
        store.update(1, &[5], None).unwrap();
        assert_eq!(store.get(1).unwrap().routes(), vec![(0, 5)]);
    }

    #[test]
    fn test_json_persistence() {
        let mut store = PresetStore::new();
        store.store(Some("Show"), &[1, 2, 3], None).unwrap();

        let json = store.to_json().unwrap();
        let loaded = PresetStore::from_json(&json).unwrap();
        assert_eq!(loaded, store);
        assert!(PresetStore::from_json("{not json").is_err());
    }

    #[tokio::test]
    async fn test_recall_sends_one_routing_block() {
        let (connector, mut sessions) = MockConnector::new();
        let options = ClientOptions {
            prelude_timeout: Duration::from_secs(2),
            ack_timeout: Duration::from_secs(2),
        };
        let device = Arc::new(VideohubDevice::new("h", 9990, connector, options));
        let (_, session) = tokio::join!(device.connect(), async {
            let session = sessions.recv().await.unwrap();
            session.send(
                "VIDEOHUB DEVICE:\nVideo inputs: 4\nVideo outputs: 4\n\n\
                 VIDEO OUTPUT ROUTING:\n0 0\n1 0\n2 0\n3 0\n\nEND PRELUDE:\n\n",
            );
            session
        });
        let mut session = session;

        let mut store = PresetStore::new();
        store.store(Some("Show"), &[1, 2, 0, 0], Some(&[0, 1][..])).unwrap();
        assert!(store.active_presets(&device.output_routing()).is_empty());

        let recall = {
            let device = device.clone();
            let store = store.clone();
            tokio::spawn(async move { store.recall(0, &device).await })
        };
        assert_eq!(session.next_write().await, "VIDEO OUTPUT ROUTING:\n0 1\n1 2\n\n");
        session.send("ACK\n\n");
        assert!(recall.await.unwrap().unwrap());
        assert_eq!(store.active_presets(&device.output_routing()).len(), 1);
    }
}
