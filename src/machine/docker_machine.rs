//! `docker-machine` CLI provisioner

use super::{MachineInfo, MachineProvisioner, MachineState, StartOutcome};
use crate::command::{self, args};
use crate::error::{ArmadaError, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::task::JoinSet;
use url::Url;

/// Default provisioner binary
pub const DEFAULT_MACHINE_BIN: &str = "docker-machine";

/// Provisioner backed by the `docker-machine` CLI
#[derive(Debug, Clone)]
pub struct DockerMachine {
    bin: String,
}

impl Default for DockerMachine {
    fn default() -> Self {
        Self::new(DEFAULT_MACHINE_BIN)
    }
}

impl DockerMachine {
    /// Create a provisioner invoking `bin`
    pub fn new(bin: &str) -> Self {
        Self { bin: bin.to_string() }
    }

    /// Directory holding one sub-directory per machine
    pub fn store_dir() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("MACHINE_STORAGE_PATH") {
            return Some(PathBuf::from(path).join("machines"));
        }
        dirs::home_dir().map(|h| h.join(".docker").join("machine").join("machines"))
    }

    async fn run(&self, args: Vec<String>) -> Result<String> {
        command::run(&self.bin, &args).await
    }
}

/// Parse the output of `docker-machine ls`.
///
/// Lines before the `NAME` header are skipped. Columns are name, an
/// optional `*` for the active machine (`-` or blank otherwise), driver and state; the last column is
/// the swarm master, optionally followed by `(master)`, and the column
/// before it is the engine URL when one is reported.
pub fn parse_ls(output: &str) -> Vec<MachineInfo> {
    let mut machines = Vec::new();
    let mut header_seen = false;

    for line in output.lines() {
        if !header_seen {
            header_seen = line.starts_with("NAME");
            continue;
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.is_empty() {
            continue;
        }

        let mut idx = 0;
        let name = fields[idx].to_string();
        idx += 1;

        let active = fields.get(idx) == Some(&"*");
        if active || fields.get(idx) == Some(&"-") {
            idx += 1;
        }
        let driver = fields.get(idx).map(|s| s.to_string()).unwrap_or_default();
        idx += 1;
        let state_field = fields.get(idx).copied().unwrap_or_default();
        let first_free = idx + 1;

        let mut last = fields.len();
        let mut master = String::new();
        let mut url = String::new();

        if last > first_free {
            last -= 1;
            if fields[last] == "(master)" && last > first_free {
                last -= 1;
            }
            if fields[last] != "(master)" {
                if fields[last].contains("://") {
                    url = fields[last].to_string();
                } else {
                    master = fields[last].to_string();
                    if last > first_free && fields[last - 1].contains("://") {
                        url = fields[last - 1].to_string();
                    }
                }
            }
        }

        let ip = ip_from_url(&url).unwrap_or_default();

        machines.push(MachineInfo {
            name,
            driver,
            active,
            state: MachineState::parse(state_field),
            url,
            ip,
            master,
        });
    }

    machines
}

/// Host part of an engine URL such as `tcp://192.168.99.100:2376`
pub fn ip_from_url(url: &str) -> Option<String> {
    Url::parse(url).ok()?.host_str().map(str::to_string)
}

/// Pick the engine connection line out of `docker-machine config` output
pub fn parse_config(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .find(|l| l.starts_with("--tlsverify") && l.contains("--tlscacert"))
        .map(str::to_string)
}

#[async_trait]
impl MachineProvisioner for DockerMachine {
    async fn list(&self) -> Result<Vec<MachineInfo>> {
        let output = self.run(args(["ls"])).await?;
        Ok(parse_ls(&output))
    }

    async fn create(&self, name: &str, global_opts: &[String], create_opts: &[String]) -> Result<()> {
        let mut argv = global_opts.to_vec();
        argv.push("create".to_string());
        argv.extend(create_opts.iter().cloned());
        argv.push(name.to_string());

        tracing::info!("Creating machine {}", name);
        self.run(argv).await?;
        Ok(())
    }

    async fn start(&self, names: &[String]) -> StartOutcome {
        let mut set = JoinSet::new();
        for name in names {
            let this = self.clone();
            let name = name.clone();
            set.spawn(async move {
                let result = this.run(args(["start", name.as_str()])).await;
                (name, result)
            });
        }

        let mut outcome = StartOutcome::default();
        let mut errors = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((name, Ok(_))) => {
                    tracing::info!("Machine {} started", name);
                    outcome.succeeded.push(name);
                }
                Ok((name, Err(e))) => {
                    tracing::warn!("Machine {} failed to start: {}", name, e);
                    errors.push(e);
                }
                Err(e) => errors.push(ArmadaError::Machine(format!("Start task failed: {}", e))),
            }
        }

        outcome.error = ArmadaError::collect("start machines", errors).err();
        outcome
    }

    async fn destroy(&self, names: &[String]) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }
        let mut argv = args(["rm", "-y"]);
        argv.extend(names.iter().cloned());
        self.run(argv).await?;
        Ok(())
    }

    async fn exec(&self, machine: &str, command: &str) -> Result<()> {
        self.run(args(["ssh", machine, command])).await?;
        Ok(())
    }

    async fn ip(&self, machine: &str) -> Result<String> {
        let output = self.run(args(["ip", machine])).await?;
        let ip = output.trim();
        if ip.is_empty() {
            return Err(ArmadaError::Machine(format!("No IP reported for {}", machine)));
        }
        Ok(ip.to_string())
    }

    async fn engine_config(&self, machine: &str, swarm: bool) -> Result<String> {
        let mut argv = args(["config"]);
        if swarm {
            argv.push("--swarm".to_string());
        }
        argv.push(machine.to_string());

        let output = self.run(argv).await?;
        parse_config(&output).ok_or_else(|| {
            ArmadaError::Machine(format!("No engine configuration reported for {}", machine))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LS: &str = "\
some warning printed before the table
NAME       ACTIVE   DRIVER       STATE     URL                         SWARM
master-1   *        virtualbox   Running   tcp://192.168.99.100:2376   master-1 (master)
web-1               virtualbox   Running   tcp://192.168.99.101:2376   master-1
web-2               virtualbox   Stopped                               master-1
broken-1            amazonec2    Error
db-1       -        virtualbox   Running   tcp://192.168.99.102:2376   master-1
";

    #[test]
    fn test_parse_ls() {
        let machines = parse_ls(LS);
        assert_eq!(machines.len(), 5);

        let master = &machines[0];
        assert_eq!(master.name, "master-1");
        assert!(master.active);
        assert!(master.is_running());
        assert!(master.is_master());
        assert_eq!(master.ip, "192.168.99.100");
        assert_eq!(master.url, "tcp://192.168.99.100:2376");

        let web1 = &machines[1];
        assert!(!web1.active);
        assert_eq!(web1.driver, "virtualbox");
        assert_eq!(web1.master, "master-1");
        assert_eq!(web1.ip, "192.168.99.101");
        assert!(!web1.is_master());
        assert!(web1.in_group("web"));

        let web2 = &machines[2];
        assert_eq!(web2.state, MachineState::Stopped);
        assert_eq!(web2.url, "");
        assert_eq!(web2.master, "master-1");

        let broken = &machines[3];
        assert_eq!(broken.state, MachineState::Error);
        assert_eq!(broken.master, "");

        let db1 = &machines[4];
        assert!(!db1.active);
        assert_eq!(db1.driver, "virtualbox");
        assert!(db1.is_running());
        assert_eq!(db1.ip, "192.168.99.102");
        assert_eq!(db1.master, "master-1");
    }

    #[test]
    fn test_parse_ls_without_header() {
        assert!(parse_ls("web-1 virtualbox Running").is_empty());
    }

    #[test]
    fn test_parse_config() {
        let output = "Warning: something\n--tlsverify --tlscacert=\"/c/ca.pem\" --tlscert=\"/c/cert.pem\" --tlskey=\"/c/key.pem\" -H=tcp://10.0.0.1:3376\n";
        let line = parse_config(output).unwrap();
        assert!(line.ends_with("-H=tcp://10.0.0.1:3376"));
        assert!(parse_config("--tlsverify only").is_none());
    }

    #[test]
    fn test_ip_from_url() {
        assert_eq!(ip_from_url("tcp://10.1.2.3:2376").as_deref(), Some("10.1.2.3"));
        assert_eq!(ip_from_url("not a url"), None);
    }
}
