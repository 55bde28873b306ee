use serde::{Deserialize, Serialize};

use crate::{
    boot::{slot_name, BootConfig, SlotEntry, MAX_SLOTS},
    error::BootError,
    partition::{PartitionInfo, DEFAULT_SECTOR_SIZE},
    transport::RequestTemplate,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FlashLayout {
    pub image_size: u32,
    pub sector_size: u32,
    pub boot_config_offset: u32,
    pub slots: Vec<SlotEntry>,
    #[serde(default)]
    pub data_partitions: Vec<PartitionInfo>,
}

impl Default for FlashLayout {
    fn default() -> Self {
        Self {
            image_size: 0x400000,
            sector_size: DEFAULT_SECTOR_SIZE,
            boot_config_offset: 0x1000,
            slots: vec![
                SlotEntry {
                    address: 0x2000,
                    size: 0xF8000,
                },
                SlotEntry {
                    address: 0x202000,
                    size: 0xF8000,
                },
            ],
            data_partitions: vec![
                PartitionInfo::new("spiffs0", 0x100000, 0x100000),
                PartitionInfo::new("spiffs1", 0x300000, 0x100000),
            ],
        }
    }
}

impl FlashLayout {
    pub fn boot_config(&self) -> PartitionInfo {
        PartitionInfo::new("bootconfig", self.boot_config_offset, self.sector_size)
    }

    pub fn default_boot_config(&self) -> Result<BootConfig, BootError> {
        BootConfig::new(self.slots.clone())
    }

    pub fn slot_partitions(&self) -> Vec<PartitionInfo> {
        self.slots
            .iter()
            .enumerate()
            .map(|(slot, entry)| PartitionInfo::new(slot_name(slot as u8), entry.address, entry.size))
            .collect()
    }

    /// Every named region: boot config sector, ROM slots, data partitions.
    pub fn partitions(&self) -> Vec<PartitionInfo> {
        let mut all = vec![self.boot_config()];
        all.extend(self.slot_partitions());
        all.extend(self.data_partitions.iter().cloned());
        all
    }

    /// Looks up a slot (`rom0`, `rom1`, ...) or a data partition by name.
    pub fn resolve(&self, name: &str) -> Option<PartitionInfo> {
        let name = name.trim();
        self.slot_partitions()
            .into_iter()
            .chain(self.data_partitions.iter().cloned())
            .find(|partition| partition.name == name)
    }

    pub fn sanitize(&mut self) {
        // The boot record lives in a single sector.
        if self.sector_size < DEFAULT_SECTOR_SIZE || !self.sector_size.is_power_of_two() {
            self.sector_size = DEFAULT_SECTOR_SIZE;
        }

        let defaults = Self::default();
        if self.image_size == 0 || self.image_size % self.sector_size != 0 {
            self.image_size = defaults.image_size;
        }
        if self.boot_config_offset % self.sector_size != 0
            || self.boot_config_offset as u64 + self.sector_size as u64 > self.image_size as u64
        {
            self.boot_config_offset = defaults.boot_config_offset;
        }

        let image_size = self.image_size as u64;
        self.slots
            .retain(|slot| slot.size > 0 && slot.address as u64 + slot.size as u64 <= image_size);
        self.slots.truncate(MAX_SLOTS);
        if self.slots.is_empty() {
            self.slots = defaults.slots;
        }

        self.data_partitions
            .retain(|partition| partition.size > 0 && partition.end() <= image_size);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdaterConfig {
    pub flash: FlashLayout,
    #[serde(default)]
    pub request: RequestTemplate,
    pub reboot_after_apply: bool,
    pub restart_delay_ms: u64,
    pub max_items: usize,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            flash: FlashLayout::default(),
            request: RequestTemplate::default(),
            reboot_after_apply: true,
            restart_delay_ms: 1_000,
            max_items: 8,
        }
    }
}

impl UpdaterConfig {
    pub fn sanitize(&mut self) {
        self.flash.sanitize();
        self.restart_delay_ms = self.restart_delay_ms.min(60_000);
        self.max_items = self.max_items.clamp(1, 16);
        self.request.timeout_ms = self.request.timeout_ms.clamp(1_000, 600_000);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn default_layout_has_two_roms_and_two_data_partitions() {
        let layout = FlashLayout::default();
        let names: Vec<_> = layout
            .partitions()
            .into_iter()
            .map(|partition| partition.name)
            .collect();

        assert_eq!(names, vec!["bootconfig", "rom0", "rom1", "spiffs0", "spiffs1"]);
        assert_eq!(
            layout.resolve("rom1"),
            Some(PartitionInfo::new("rom1", 0x202000, 0xF8000))
        );
        assert_eq!(
            layout.resolve(" spiffs0 "),
            Some(PartitionInfo::new("spiffs0", 0x100000, 0x100000))
        );
        assert_eq!(layout.resolve("rom7"), None);
    }

    #[test]
    fn default_regions_do_not_overlap() {
        let all = FlashLayout::default().partitions();
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert!(!a.overlaps(b), "{a} overlaps {b}");
            }
        }
    }

    #[test]
    fn sanitize_repairs_out_of_range_values() {
        let mut config = UpdaterConfig::default();
        config.flash.sector_size = 3000;
        config.flash.slots = vec![SlotEntry {
            address: 0x3F0000,
            size: 0x100000,
        }];
        config.flash.data_partitions.push(PartitionInfo::new("huge", 0, 0x800000));
        config.max_items = 0;
        config.restart_delay_ms = 600_000;
        config.request.timeout_ms = 1;

        config.sanitize();

        assert_eq!(config.flash.sector_size, DEFAULT_SECTOR_SIZE);
        assert_eq!(config.flash.slots, FlashLayout::default().slots);
        assert_eq!(config.flash.data_partitions.len(), 2);
        assert_eq!(config.max_items, 1);
        assert_eq!(config.restart_delay_ms, 60_000);
        assert_eq!(config.request.timeout_ms, 1_000);
    }

    #[test]
    fn sanitize_keeps_sector_large_enough_for_boot_record() {
        let mut layout = FlashLayout {
            sector_size: 16,
            ..FlashLayout::default()
        };
        layout.sanitize();
        assert_eq!(layout.sector_size, DEFAULT_SECTOR_SIZE);

        let mut layout = FlashLayout {
            sector_size: 0x10000,
            image_size: 0x400000,
            boot_config_offset: 0x10000,
            ..FlashLayout::default()
        };
        layout.sanitize();
        assert_eq!(layout.sector_size, 0x10000);

        let boot = layout.default_boot_config().unwrap();
        assert!(boot.record_len() <= layout.boot_config().size as usize);
    }

    #[test]
    fn request_template_is_optional_in_json() {
        let mut value = serde_json::to_value(UpdaterConfig::default()).unwrap();
        value.as_object_mut().unwrap().remove("request");

        let config: UpdaterConfig = serde_json::from_value(value).unwrap();
        assert_eq!(config.request, RequestTemplate::default());
    }
}
