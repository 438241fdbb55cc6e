//! Renderer-side state attached to materials, keyed by material id.

use fxhash::FxHashMap;
use uuid::Uuid;

use super::clipping::{ClippingCache, ClippingCounts};
use super::device::ProgramId;

/// Inputs whose change makes a material look up its program again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramTrigger {
    pub version: u64,
    pub fog: Option<&'static str>,
    pub lights_hash: u64,
    pub clipping: ClippingCounts,
    /// Hash of everything else that reaches the fingerprint: the drawable's
    /// vertex inputs and features, bound maps, shadow units and settings.
    pub inputs: u64,
}

#[derive(Default)]
pub struct MaterialProperties {
    programs: FxHashMap<String, ProgramId>,
    current: Option<ProgramId>,
    trigger: Option<ProgramTrigger>,
    pub clipping: ClippingCache,
}

impl MaterialProperties {
    /// The program to draw with when nothing relevant changed since the last
    /// draw with this material.
    pub fn current_for(&self, trigger: &ProgramTrigger) -> Option<ProgramId> {
        match self.trigger {
            Some(last) if last == *trigger => self.current,
            _ => None,
        }
    }

    pub fn current_program(&self) -> Option<ProgramId> {
        self.current
    }

    /// Whether the material, the fog, the light counts or the clipping
    /// counts changed since the programs were acquired, in which case they
    /// must be released before acquiring again. A change in `inputs` alone
    /// keeps them, so one material can draw both skinned and plain meshes.
    pub fn is_stale(&self, trigger: &ProgramTrigger) -> bool {
        self.trigger.is_some_and(|last| {
            last.version != trigger.version
                || last.fog != trigger.fog
                || last.lights_hash != trigger.lights_hash
                || last.clipping != trigger.clipping
        })
    }

    pub fn program(&self, fingerprint: &str) -> Option<ProgramId> {
        self.programs.get(fingerprint).copied()
    }

    pub fn set_current(
        &mut self,
        trigger: ProgramTrigger,
        fingerprint: String,
        program: ProgramId,
    ) {
        self.programs.insert(fingerprint, program);
        self.current = Some(program);
        self.trigger = Some(trigger);
    }

    /// Hands back every acquired program so the caller can release them.
    pub fn take_programs(&mut self) -> Vec<ProgramId> {
        self.current = None;
        self.trigger = None;
        self.programs.drain().map(|(_, program)| program).collect()
    }

    pub fn program_count(&self) -> usize {
        self.programs.len()
    }
}

#[derive(Default)]
pub struct PropertiesStore {
    materials: FxHashMap<Uuid, MaterialProperties>,
}

impl PropertiesStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, material: &Uuid) -> Option<&MaterialProperties> {
        self.materials.get(material)
    }

    pub fn get_mut(&mut self, material: Uuid) -> &mut MaterialProperties {
        self.materials.entry(material).or_default()
    }

    pub fn remove(&mut self, material: &Uuid) -> Option<MaterialProperties> {
        self.materials.remove(material)
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.materials.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.materials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.materials.is_empty()
    }

    pub fn reset(&mut self) {
        self.materials.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trigger(version: u64) -> ProgramTrigger {
        ProgramTrigger {
            version,
            fog: None,
            lights_hash: 1,
            clipping: ClippingCounts::default(),
            inputs: 2,
        }
    }

    #[test]
    fn current_program_survives_identical_trigger_only() {
        let mut properties = MaterialProperties::default();
        assert_eq!(properties.current_for(&trigger(0)), None);

        properties.set_current(trigger(0), "basic".into(), ProgramId(4));
        assert_eq!(properties.current_for(&trigger(0)), Some(ProgramId(4)));

        let fogged = ProgramTrigger {
            fog: Some("fog_exp2"),
            ..trigger(0)
        };
        assert_eq!(properties.current_for(&fogged), None);
        assert!(properties.is_stale(&fogged));
        assert!(properties.is_stale(&trigger(1)));
    }

    #[test]
    fn only_a_change_of_inputs_keeps_programs() {
        let mut properties = MaterialProperties::default();
        properties.set_current(trigger(0), "basic".into(), ProgramId(4));

        let skinned = ProgramTrigger {
            inputs: 9,
            ..trigger(0)
        };
        assert_eq!(properties.current_for(&skinned), None);
        assert!(!properties.is_stale(&skinned));

        let lit = ProgramTrigger {
            lights_hash: 7,
            ..trigger(0)
        };
        assert!(properties.is_stale(&lit));

        let clipped = ProgramTrigger {
            clipping: ClippingCounts {
                num_planes: 1,
                ..ClippingCounts::default()
            },
            ..trigger(0)
        };
        assert!(properties.is_stale(&clipped));
    }

    #[test]
    fn take_programs_empties_the_entry() {
        let mut properties = MaterialProperties::default();
        properties.set_current(trigger(0), "a".into(), ProgramId(1));
        properties.set_current(trigger(0), "b".into(), ProgramId(2));

        let mut taken = properties.take_programs();
        taken.sort();
        assert_eq!(taken, vec![ProgramId(1), ProgramId(2)]);
        assert_eq!(properties.program_count(), 0);
        assert_eq!(properties.current_program(), None);
    }
}
