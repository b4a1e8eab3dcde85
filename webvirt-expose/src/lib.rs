//! Bulk VNC exposure for the hypervisor's configuration directory.
//!
//! Walks every `.conf` file in name order and gives each one without a VNC
//! line the next display number, starting from a caller-chosen display. Files
//! that already carry a VNC line keep it but still use up their number, so a
//! rerun over the same directory assigns the same numbers.

use anyhow::{bail, Context, Result};
use std::fmt;
use std::path::PathBuf;
use tracing::{debug, info};
use webvirt_orchestrator::config_store::VNC_BASE_PORT;
use webvirt_orchestrator::ConfigStore;

/// Config files left alone unless the caller says otherwise; 100 is the
/// management VM.
pub const DEFAULT_IGNORED: [&str; 3] = ["100.conf", "800.conf", "900.conf"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mapping {
    /// The file already has a VNC line.
    Exists,
    Assign(u16),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanEntry {
    pub file_name: String,
    pub path: PathBuf,
    pub mapping: Mapping,
}

impl fmt::Display for PlanEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mapping {
            Mapping::Exists => write!(f, "{}\t\tMapping exists", self.file_name),
            Mapping::Assign(display) => write!(
                f,
                "{}\t\t{} + {} (port {})",
                self.file_name,
                VNC_BASE_PORT,
                display,
                VNC_BASE_PORT + u32::from(display)
            ),
        }
    }
}

/// Works out which display each config file gets without touching any file.
pub fn plan(store: &ConfigStore, start_display: u16, ignored: &[String]) -> Result<Vec<PlanEntry>> {
    let files = store
        .config_files()
        .with_context(|| format!("Cannot read config directory {}", store.dir().display()))?;

    let candidates = files.into_iter().filter_map(|path| {
        let file_name = path.file_name()?.to_str()?.to_string();
        if ignored.iter().any(|i| i == &file_name) {
            debug!(file = %file_name, "Skipping ignored config");
            return None;
        }
        Some((file_name, path))
    });

    let mut entries = Vec::new();
    for (offset, (file_name, path)) in candidates.enumerate() {
        let has_vnc = ConfigStore::has_vnc(&path)
            .with_context(|| format!("Cannot read {}", path.display()))?;
        let mapping = if has_vnc {
            Mapping::Exists
        } else {
            let display = u16::try_from(offset)
                .ok()
                .and_then(|offset| start_display.checked_add(offset));
            match display {
                Some(display) => Mapping::Assign(display),
                None => bail!("Display numbers starting at {start_display} run out at {file_name}"),
            }
        };
        entries.push(PlanEntry {
            file_name,
            path,
            mapping,
        });
    }

    Ok(entries)
}

/// Appends the planned VNC lines. Returns how many files were changed.
pub fn apply(entries: &[PlanEntry]) -> Result<usize> {
    let mut written = 0;
    for entry in entries {
        if let Mapping::Assign(vnc_display) = entry.mapping {
            ConfigStore::append_vnc_to(&entry.path, vnc_display).with_context(|| {
                format!(
                    "Failed writing {}; files before it were already changed",
                    entry.file_name
                )
            })?;
            info!(file = %entry.file_name, vnc_display, "Exposed VNC");
            written += 1;
        }
    }
    Ok(written)
}
