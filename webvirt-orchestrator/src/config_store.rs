//! Access to the hypervisor's on-disk VM configuration directory.
//!
//! Every VM owns one `{vmid}.conf` file. A VM whose console is reachable over
//! VNC carries an `args: -vnc 0.0.0.0:{display}` line in that file.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Substring that marks a VNC line in a configuration file.
pub const VNC_MARKER: &str = "vnc";

/// Offset between a VNC display number and the TCP port it listens on.
pub const VNC_BASE_PORT: u32 = 5900;

pub fn vnc_line(display: u16) -> String {
    format!("args: -vnc 0.0.0.0:{display}")
}

/// Leading run of digits in a config file name, e.g. `104` for `104.conf`.
pub fn leading_vmid(file_name: &str) -> Option<u32> {
    let digits: String = file_name
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Display number of a VNC line: the integer after the last `:`.
pub fn vnc_display(line: &str) -> Option<u16> {
    if !line.contains(VNC_MARKER) {
        return None;
    }
    let (_, tail) = line.rsplit_once(':')?;
    tail.trim().parse().ok()
}

#[derive(Debug, Clone)]
pub struct ConfigStore {
    dir: PathBuf,
}

impl ConfigStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config_path(&self, vmid: u32) -> PathBuf {
        self.dir.join(format!("{vmid}.conf"))
    }

    pub fn has_config(&self, vmid: u32) -> bool {
        self.config_path(vmid).is_file()
    }

    /// Config files in the store, sorted by file name.
    pub fn config_files(&self) -> io::Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "conf") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Identifiers of every VM in the store, ascending and deduplicated.
    pub fn vm_ids(&self) -> io::Result<Vec<u32>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if let Some(id) = entry.file_name().to_str().and_then(leading_vmid) {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    /// Every VNC display number referenced by any config file.
    pub fn vnc_displays(&self) -> io::Result<Vec<u16>> {
        let mut displays = Vec::new();
        for path in self.config_files()? {
            let contents = fs::read_to_string(&path)?;
            displays.extend(contents.lines().filter_map(vnc_display));
        }
        Ok(displays)
    }

    pub fn has_vnc(path: &Path) -> io::Result<bool> {
        let contents = fs::read_to_string(path)?;
        Ok(contents.lines().any(|line| line.contains(VNC_MARKER)))
    }

    /// Append the VNC line for `display` to an existing config file.
    pub fn append_vnc(&self, vmid: u32, display: u16) -> io::Result<()> {
        Self::append_vnc_to(&self.config_path(vmid), display)
    }

    pub fn append_vnc_to(path: &Path, display: u16) -> io::Result<()> {
        // Refuses to create the file: a missing config means the VM does not exist yet.
        let contents = fs::read_to_string(path)?;
        let mut file = OpenOptions::new().append(true).open(path)?;
        if !contents.is_empty() && !contents.ends_with('\n') {
            writeln!(file)?;
        }
        writeln!(file, "{}", vnc_line(display))
    }
}
