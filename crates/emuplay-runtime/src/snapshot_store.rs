//! Numbered save slots, optionally mirrored to disk.

use std::fs;
use std::path::PathBuf;

use emuplay_core::{Machine, RomInfo, Snapshot, SnapshotError, SnapshotMeta};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::bus::{NotificationBus, NotificationEvent};

pub const DEFAULT_SLOT_COUNT: usize = 10;
const STATE_FILE_EXT: &str = "est";

#[derive(Debug, Clone)]
pub struct SnapshotStoreConfig {
    pub slot_count: usize,
    /// When set, slots are written to `<dir>/<rom-name>.<slot>.est` and read
    /// back lazily.
    pub state_dir: Option<PathBuf>,
}

impl Default for SnapshotStoreConfig {
    fn default() -> Self {
        Self {
            slot_count: DEFAULT_SLOT_COUNT,
            state_dir: None,
        }
    }
}

struct StoreInner {
    slots: Vec<Option<Snapshot>>,
    rom: Option<RomInfo>,
}

/// Every mutation holds the single store lock for its whole duration.
pub struct SnapshotStore {
    config: SnapshotStoreConfig,
    inner: Mutex<StoreInner>,
    bus: NotificationBus,
}

impl SnapshotStore {
    pub fn new(config: SnapshotStoreConfig, bus: NotificationBus) -> Self {
        let slots = vec![None; config.slot_count];
        Self {
            config,
            inner: Mutex::new(StoreInner { slots, rom: None }),
            bus,
        }
    }

    pub fn slot_count(&self) -> usize {
        self.config.slot_count
    }

    /// Switch to another game. In-memory slots belong to the previous one and
    /// are dropped.
    pub fn set_rom(&self, rom: Option<RomInfo>) {
        let mut inner = self.inner.lock();
        inner.slots.iter_mut().for_each(|s| *s = None);
        inner.rom = rom;
    }

    pub fn rom(&self) -> Option<RomInfo> {
        self.inner.lock().rom.clone()
    }

    pub fn save(
        &self,
        slot: usize,
        machine: &dyn Machine,
        frame: u64,
    ) -> Result<SnapshotMeta, SnapshotError> {
        self.check_slot(slot)?;
        let meta = {
            let mut inner = self.inner.lock();
            let rom_hash = inner.rom.as_ref().map(|r| r.hash);
            let snapshot = Snapshot::capture(machine, frame, rom_hash)?;
            if let Some(path) = self.slot_path(inner.rom.as_ref(), slot) {
                if let Some(dir) = path.parent() {
                    fs::create_dir_all(dir)?;
                }
                fs::write(&path, snapshot.encode()?)?;
                debug!(slot, path = %path.display(), "slot written");
            }
            let meta = snapshot.meta.clone();
            inner.slots[slot] = Some(snapshot);
            meta
        };
        info!(slot, frame, "state saved");
        self.bus.publish(NotificationEvent::StateSaved);
        Ok(meta)
    }

    /// Restore `slot` into `machine`. On error the machine is untouched.
    pub fn load(&self, slot: usize, machine: &mut dyn Machine) -> Result<SnapshotMeta, SnapshotError> {
        self.check_slot(slot)?;
        let meta = {
            let mut inner = self.inner.lock();
            self.fill_from_disk(&mut inner, slot)?;
            let rom_hash = inner.rom.as_ref().map(|r| r.hash);
            let snapshot = inner.slots[slot]
                .as_ref()
                .ok_or(SnapshotError::SlotEmpty(slot))?;
            snapshot.apply_to(machine, rom_hash)?;
            snapshot.meta.clone()
        };
        info!(slot, frame = meta.frame, "state loaded");
        self.bus.publish(NotificationEvent::StateLoaded);
        Ok(meta)
    }

    pub fn describe(&self, slot: usize) -> Result<SnapshotMeta, SnapshotError> {
        self.check_slot(slot)?;
        let mut inner = self.inner.lock();
        self.fill_from_disk(&mut inner, slot)?;
        inner.slots[slot]
            .as_ref()
            .map(|s| s.meta.clone())
            .ok_or(SnapshotError::SlotEmpty(slot))
    }

    /// Slotless snapshot in container form, for a joining peer or a movie.
    pub fn capture(&self, machine: &dyn Machine, frame: u64) -> Result<Vec<u8>, SnapshotError> {
        let inner = self.inner.lock();
        let rom_hash = inner.rom.as_ref().map(|r| r.hash);
        Snapshot::capture(machine, frame, rom_hash)?.encode()
    }

    pub fn load_from_bytes(
        &self,
        bytes: &[u8],
        machine: &mut dyn Machine,
    ) -> Result<SnapshotMeta, SnapshotError> {
        let inner = self.inner.lock();
        let snapshot = Snapshot::decode(bytes)?;
        snapshot.apply_to(machine, inner.rom.as_ref().map(|r| r.hash))?;
        Ok(snapshot.meta)
    }

    fn check_slot(&self, slot: usize) -> Result<(), SnapshotError> {
        if slot >= self.config.slot_count {
            return Err(SnapshotError::InvalidSlot {
                slot,
                count: self.config.slot_count,
            });
        }
        Ok(())
    }

    fn slot_path(&self, rom: Option<&RomInfo>, slot: usize) -> Option<PathBuf> {
        let dir = self.config.state_dir.as_ref()?;
        let name = rom.map(|r| r.name.as_str()).unwrap_or("untitled");
        Some(dir.join(format!("{name}.{slot}.{STATE_FILE_EXT}")))
    }

    fn fill_from_disk(&self, inner: &mut StoreInner, slot: usize) -> Result<(), SnapshotError> {
        if inner.slots[slot].is_some() {
            return Ok(());
        }
        let Some(path) = self.slot_path(inner.rom.as_ref(), slot) else {
            return Ok(());
        };
        match fs::read(&path) {
            Ok(bytes) => {
                inner.slots[slot] = Some(Snapshot::decode(&bytes)?);
                debug!(slot, path = %path.display(), "slot read from disk");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use emuplay_core::{ResetKind, demo::DemoMachine};

    use super::*;

    fn store(config: SnapshotStoreConfig) -> (SnapshotStore, NotificationBus) {
        let bus = NotificationBus::new();
        (SnapshotStore::new(config, bus.clone()), bus)
    }

    fn advanced(frames: u8) -> DemoMachine {
        let mut m = DemoMachine::new();
        for i in 0..frames {
            m.run_frame(&[i, 0, 0, 0]).unwrap();
        }
        m
    }

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("emuplay-{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn save_then_load_restores_exact_bytes() {
        let (store, bus) = store(SnapshotStoreConfig::default());
        let saved = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&saved);
        bus.subscribe(move |ev: NotificationEvent| {
            if ev == NotificationEvent::StateSaved {
                counter.fetch_add(1, Ordering::Relaxed);
            }
        });

        let mut m = advanced(5);
        let before = m.save_state().unwrap();
        let meta = store.save(3, &m, 5).unwrap();
        assert_eq!(meta.frame, 5);
        assert_eq!(store.describe(3).unwrap(), meta);

        m.reset(ResetKind::PowerOn);
        m.run_frame(&[9, 9, 9, 9]).unwrap();
        assert_ne!(m.save_state().unwrap(), before);

        store.load(3, &mut m).unwrap();
        assert_eq!(m.save_state().unwrap(), before);
        assert_eq!(saved.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn slot_errors_are_distinct() {
        let (store, _) = store(SnapshotStoreConfig::default());
        let mut m = DemoMachine::new();
        assert!(matches!(
            store.save(10, &m, 0),
            Err(SnapshotError::InvalidSlot { slot: 10, count: 10 })
        ));
        assert!(matches!(store.describe(2), Err(SnapshotError::SlotEmpty(2))));
        assert!(matches!(store.load(2, &mut m), Err(SnapshotError::SlotEmpty(2))));
    }

    #[test]
    fn mid_instruction_save_fails_and_keeps_slot() {
        let (store, _) = store(SnapshotStoreConfig::default());
        let mut m = advanced(1);
        store.save(0, &m, 1).unwrap();
        m.set_mid_instruction(true);
        assert!(matches!(
            store.save(0, &m, 2),
            Err(SnapshotError::SerializationFailed(_))
        ));
        assert_eq!(store.describe(0).unwrap().frame, 1);
    }

    #[test]
    fn version_mismatch_leaves_machine_untouched() {
        let (store, _) = store(SnapshotStoreConfig::default());
        store.save(1, &advanced(3), 3).unwrap();

        let mut newer = DemoMachine::with_format_version(DemoMachine::FORMAT_VERSION + 1);
        let before = newer.save_state().unwrap();
        assert!(matches!(
            store.load(1, &mut newer),
            Err(SnapshotError::VersionMismatch { .. })
        ));
        assert_eq!(newer.save_state().unwrap(), before);
    }

    #[test]
    fn snapshot_from_another_rom_is_refused() {
        let (store, _) = store(SnapshotStoreConfig::default());
        store.set_rom(Some(RomInfo::from_image("a.nes", b"a")));
        let bytes = store.capture(&advanced(2), 2).unwrap();

        store.set_rom(Some(RomInfo::from_image("b.nes", b"b")));
        let mut m = DemoMachine::new();
        assert!(matches!(
            store.load_from_bytes(&bytes, &mut m),
            Err(SnapshotError::RomMismatch)
        ));
    }

    #[test]
    fn slots_persist_under_state_dir() {
        let dir = scratch_dir("slots");
        let rom = RomInfo::from_image("/roms/Demo Game.nes", b"rom");
        let config = SnapshotStoreConfig {
            state_dir: Some(dir.clone()),
            ..SnapshotStoreConfig::default()
        };

        let m = advanced(4);
        {
            let (first, _) = store(config.clone());
            first.set_rom(Some(rom.clone()));
            first.save(7, &m, 4).unwrap();
        }
        assert!(dir.join("Demo Game.7.est").is_file());

        let (second, _) = store(config);
        second.set_rom(Some(rom));
        assert_eq!(second.describe(7).unwrap().frame, 4);
        let mut restored = DemoMachine::new();
        second.load(7, &mut restored).unwrap();
        assert_eq!(restored.save_state().unwrap(), m.save_state().unwrap());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn corrupt_file_is_reported() {
        let dir = scratch_dir("corrupt");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("untitled.0.est"), b"EPSS\x01\x00garbage").unwrap();
        let (store, _) = store(SnapshotStoreConfig {
            state_dir: Some(dir.clone()),
            ..SnapshotStoreConfig::default()
        });
        assert!(matches!(store.describe(0), Err(SnapshotError::Corrupt(_))));
        let _ = fs::remove_dir_all(&dir);
    }
}
