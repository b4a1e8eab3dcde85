use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use webvirt_expose::{apply, plan, Mapping, DEFAULT_IGNORED};
use webvirt_logging::{init_subscriber, LogOptions};
use webvirt_orchestrator::ConfigStore;

#[derive(Parser)]
#[command(name = "webvirt-expose")]
#[command(about = "Expose hypervisor VM consoles over VNC in bulk")]
#[command(version)]
pub struct Args {
    /// Display number given to the first config file
    #[arg(long)]
    pub start_port: u16,

    /// Print the mapping without changing any file
    #[arg(long)]
    pub dry_run: bool,

    /// Directory holding the `{vmid}.conf` files
    #[arg(long, env = "CONFIG_DIR", default_value = ".")]
    pub config_dir: PathBuf,

    /// Config files to leave alone (comma separated)
    #[arg(long, value_delimiter = ',', default_values = DEFAULT_IGNORED)]
    pub ignore: Vec<String>,
}

fn main() -> Result<()> {
    let _log_guard = init_subscriber(&LogOptions::from_env());
    let args = Args::parse();

    let store = ConfigStore::new(&args.config_dir);
    let entries = plan(&store, args.start_port, &args.ignore)?;

    println!("Config File\t\tPort Mapping");
    for entry in &entries {
        match entry.mapping {
            Mapping::Assign(_) if args.dry_run => println!("{entry} [Dry Run]"),
            _ => println!("{entry}"),
        }
    }

    if args.dry_run {
        return Ok(());
    }

    let written = apply(&entries)?;
    println!("✅ Exposed {written} VM console(s)");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_defaults() {
        let args = Args::try_parse_from(["webvirt-expose", "--start-port", "5"]).unwrap();
        assert_eq!(args.start_port, 5);
        assert!(!args.dry_run);
        assert_eq!(args.ignore, vec!["100.conf", "800.conf", "900.conf"]);
    }

    #[test]
    fn parses_ignore_list_and_dry_run() {
        let args = Args::try_parse_from([
            "webvirt-expose",
            "--start-port",
            "1",
            "--dry-run",
            "--ignore",
            "101.conf,102.conf",
            "--config-dir",
            "/etc/pve/qemu-server",
        ])
        .unwrap();
        assert!(args.dry_run);
        assert_eq!(args.ignore, vec!["101.conf", "102.conf"]);
        assert_eq!(args.config_dir, PathBuf::from("/etc/pve/qemu-server"));
    }

    #[test]
    fn start_port_is_required() {
        assert!(Args::try_parse_from(["webvirt-expose"]).is_err());
    }
}
