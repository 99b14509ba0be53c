// tests/common/mod.rs

//! Shared fixtures: a mounter that simulates block devices with
//! prepared directory trees, plus quiet network/hardware stand-ins.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use instsrc::context::NetConfig;
use instsrc::hwdetect::{DeviceCandidate, HardwareClass, HardwareList};
use instsrc::mount::{MountError, Mounter, PathType};
use instsrc::net::NetworkOps;
use instsrc::Result;

/// Marker content for files the mock treats as mountable images.
pub const IMAGE_MAGIC: &[u8] = b"IMG";

pub fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Simulated mounter. "Mounting" a registered device copies its
/// prepared tree into the mountpoint; mounting an image file (content
/// starting with [`IMAGE_MAGIC`]) drops an `IMAGE_OK` marker.
pub struct MockMounter {
    devices: HashMap<String, PathBuf>,
    pub active: RefCell<HashSet<PathBuf>>,
}

impl MockMounter {
    pub fn new() -> Self {
        MockMounter {
            devices: HashMap::new(),
            active: RefCell::new(HashSet::new()),
        }
    }

    pub fn with_device(mut self, device: &str, tree: &Path) -> Self {
        self.devices.insert(device.to_string(), tree.to_path_buf());
        self
    }

    pub fn active_count(&self) -> usize {
        self.active.borrow().len()
    }
}

impl Mounter for MockMounter {
    fn mount_ro(&self, what: &Path, dir: &Path) -> std::result::Result<(), MountError> {
        let name = what.to_string_lossy().to_string();
        if let Some(tree) = self.devices.get(&name) {
            copy_tree(tree, dir).map_err(|e| MountError::Failed(e.to_string()))?;
            self.active.borrow_mut().insert(dir.to_path_buf());
            return Ok(());
        }
        match std::fs::metadata(what) {
            Ok(m) if m.is_dir() => {
                copy_tree(what, dir).map_err(|e| MountError::Failed(e.to_string()))?;
            }
            Ok(m) if m.is_file() => {
                let content = std::fs::read(what).map_err(|e| MountError::Failed(e.to_string()))?;
                if !content.starts_with(IMAGE_MAGIC) {
                    return Err(MountError::Failed("not an image".into()));
                }
                std::fs::create_dir_all(dir).map_err(|e| MountError::Failed(e.to_string()))?;
                std::fs::write(dir.join("IMAGE_OK"), &content)
                    .map_err(|e| MountError::Failed(e.to_string()))?;
            }
            Ok(_) => return Err(MountError::Failed("unmountable".into())),
            Err(_) => return Err(MountError::NotFound),
        }
        self.active.borrow_mut().insert(dir.to_path_buf());
        Ok(())
    }

    fn umount(&self, dir: &Path) -> bool {
        self.active.borrow_mut().remove(dir)
    }

    fn mount_nfs(
        &self,
        _server: &str,
        _export: &str,
        _dir: &Path,
    ) -> std::result::Result<(), MountError> {
        Err(MountError::Failed("no nfs in tests".into()))
    }

    fn mount_smb(
        &self,
        _server: &str,
        _share: &str,
        _user: Option<&str>,
        _password: Option<&str>,
        _domain: Option<&str>,
        _dir: &Path,
    ) -> std::result::Result<(), MountError> {
        Err(MountError::Failed("no smb in tests".into()))
    }

    fn path_type(&self, path: &Path) -> PathType {
        if self.devices.contains_key(&path.to_string_lossy().to_string()) {
            return PathType::BlockDev;
        }
        match std::fs::metadata(path) {
            Ok(m) if m.is_dir() => PathType::Dir,
            Ok(m) if m.is_file() => PathType::File,
            Ok(_) => PathType::Other,
            Err(_) => PathType::Missing,
        }
    }

    fn is_mountable(&self, path: &Path) -> bool {
        match self.path_type(path) {
            PathType::Dir | PathType::BlockDev => true,
            PathType::File => std::fs::read(path)
                .map(|c| c.starts_with(IMAGE_MAGIC))
                .unwrap_or(false),
            _ => false,
        }
    }

    fn fstype(&self, device: &Path) -> Option<String> {
        self.devices
            .contains_key(&device.to_string_lossy().to_string())
            .then(|| "ext4".to_string())
    }
}

/// Always-succeeding network stack.
pub struct NullNet;

impl NetworkOps for NullNet {
    fn stop(&self, _net: &mut NetConfig) {}
    fn static_config_complete(&self) -> bool {
        true
    }
    fn configure_static(&self, _net: &mut NetConfig) -> Result<()> {
        Ok(())
    }
    fn dhcp(&self, _net: &mut NetConfig) -> Result<()> {
        Ok(())
    }
    fn bootp(&self, _net: &mut NetConfig) -> Result<()> {
        Ok(())
    }
    fn answer_complete(&self) -> bool {
        true
    }
    fn activate(&self, _net: &NetConfig) -> Result<()> {
        Ok(())
    }
    fn wlan_setup(&self, _net: &NetConfig) -> Result<()> {
        Ok(())
    }
    fn resolve(&self, server: &str) -> Result<String> {
        Ok(server.to_string())
    }
}

pub struct FixedHardware(pub Vec<DeviceCandidate>);

impl HardwareList for FixedHardware {
    fn list(&self, class: HardwareClass) -> Vec<DeviceCandidate> {
        self.0
            .iter()
            .filter(|c| c.is_class(class))
            .cloned()
            .collect()
    }
}

pub fn block_device(device: &str) -> DeviceCandidate {
    DeviceCandidate {
        device: Some(device.to_string()),
        classes: vec![HardwareClass::Block],
        ..Default::default()
    }
}
