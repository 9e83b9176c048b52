//! In-memory host for driver tests.
//!
//! [`FakeHost`] records every host operation, keeps a table of tap links and
//! hands out simulated processes. Individual steps can be made to fail.

use crate::error::{DriverError, Result};
use crate::host::{HostOps, SwitchSpec};
use crate::process::{ProcessHandle, SimulatedExit};
use async_trait::async_trait;
use ipnet::IpNet;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostStep {
    CreateTap,
    SetLinkAddress,
    SetLinkUp,
    AddAddress,
    DeleteLink,
    LinkExists,
    SpawnSwitch,
    SpawnPlug,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCall {
    CreateTap(String),
    SetLinkAddress(String, String),
    SetLinkUp(String),
    AddAddress(String, IpNet),
    DeleteLink(String),
    SpawnSwitch(SwitchSpec),
    SpawnPlug(PathBuf, String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FakeLink {
    pub mac: Option<String>,
    pub up: bool,
    pub addresses: Vec<IpNet>,
}

#[derive(Default)]
struct FakeState {
    links: BTreeMap<String, FakeLink>,
    /// Links that exist but sit in another namespace.
    hidden: HashSet<String>,
    calls: Vec<HostCall>,
    deleted: Vec<String>,
    failures: HashSet<HostStep>,
    switch_dies_on_start: bool,
    switches: Vec<SimulatedExit>,
    plugs: Vec<(String, SimulatedExit)>,
    next_pid: u32,
}

pub struct FakeHost {
    state: Mutex<FakeState>,
}

impl Default for FakeHost {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeHost {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                next_pid: 1000,
                ..Default::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every future call of `step` fail.
    pub fn fail_step(&self, step: HostStep) {
        self.state().failures.insert(step);
    }

    pub fn clear_failures(&self) {
        self.state().failures.clear();
    }

    /// Spawned switches exit immediately with code 1.
    pub fn set_switch_dies_on_start(&self, dies: bool) {
        self.state().switch_dies_on_start = dies;
    }

    /// Crash every switch spawned so far.
    pub fn crash_switches(&self) {
        for exit in &self.state().switches {
            exit.exit(1);
        }
    }

    /// Crash the plug attached to `tap`.
    pub fn crash_plug(&self, tap: &str) {
        for (name, exit) in &self.state().plugs {
            if name == tap {
                exit.exit(1);
            }
        }
    }

    pub fn add_link(&self, name: &str) {
        self.state().links.insert(name.to_string(), FakeLink::default());
    }

    /// Move a link out of view, as a container namespace holding it would.
    pub fn hide_link(&self, name: &str) {
        self.state().hidden.insert(name.to_string());
    }

    /// Hand a hidden link back to the host namespace.
    pub fn release_link(&self, name: &str) {
        self.state().hidden.remove(name);
    }

    pub fn link(&self, name: &str) -> Option<FakeLink> {
        self.state().links.get(name).cloned()
    }

    /// Whether `name` exists anywhere, hidden or not.
    pub fn link_present(&self, name: &str) -> bool {
        self.state().links.contains_key(name)
    }

    pub fn links(&self) -> Vec<String> {
        self.state().links.keys().cloned().collect()
    }

    pub fn calls(&self) -> Vec<HostCall> {
        self.state().calls.clone()
    }

    pub fn deleted_links(&self) -> Vec<String> {
        self.state().deleted.clone()
    }

    pub fn spawned_switches(&self) -> Vec<SwitchSpec> {
        self.state()
            .calls
            .iter()
            .filter_map(|c| match c {
                HostCall::SpawnSwitch(spec) => Some(spec.clone()),
                _ => None,
            })
            .collect()
    }

    fn check(state: &FakeState, step: HostStep, what: &str) -> Result<()> {
        if state.failures.contains(&step) {
            return Err(DriverError::Command {
                cmd: what.to_string(),
                stderr: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    fn visible_link<'a>(state: &'a mut FakeState, name: &str, cmd: &str) -> Result<&'a mut FakeLink> {
        if state.hidden.contains(name) {
            return Err(no_device(cmd, name));
        }
        state
            .links
            .get_mut(name)
            .ok_or_else(|| no_device(cmd, name))
    }

    fn next_pid(state: &mut FakeState) -> u32 {
        state.next_pid += 1;
        state.next_pid
    }
}

fn no_device(cmd: &str, name: &str) -> DriverError {
    DriverError::Command {
        cmd: cmd.to_string(),
        stderr: format!("Cannot find device \"{}\"", name),
    }
}

#[async_trait]
impl HostOps for FakeHost {
    async fn create_tap(&self, name: &str) -> Result<()> {
        let mut state = self.state();
        state.calls.push(HostCall::CreateTap(name.to_string()));
        let cmd = format!("ip tuntap add dev {} mode tap", name);
        Self::check(&state, HostStep::CreateTap, &cmd)?;
        if state.links.contains_key(name) {
            return Err(DriverError::Command {
                cmd,
                stderr: "ioctl(TUNSETIFF): Device or resource busy".to_string(),
            });
        }
        state.links.insert(name.to_string(), FakeLink::default());
        Ok(())
    }

    async fn set_link_address(&self, name: &str, mac: &str) -> Result<()> {
        let mut state = self.state();
        state
            .calls
            .push(HostCall::SetLinkAddress(name.to_string(), mac.to_string()));
        let cmd = format!("ip link set dev {} address {}", name, mac);
        Self::check(&state, HostStep::SetLinkAddress, &cmd)?;
        Self::visible_link(&mut state, name, &cmd)?.mac = Some(mac.to_string());
        Ok(())
    }

    async fn set_link_up(&self, name: &str) -> Result<()> {
        let mut state = self.state();
        state.calls.push(HostCall::SetLinkUp(name.to_string()));
        let cmd = format!("ip link set dev {} up", name);
        Self::check(&state, HostStep::SetLinkUp, &cmd)?;
        Self::visible_link(&mut state, name, &cmd)?.up = true;
        Ok(())
    }

    async fn add_address(&self, name: &str, addr: IpNet) -> Result<()> {
        let mut state = self.state();
        state.calls.push(HostCall::AddAddress(name.to_string(), addr));
        let cmd = format!("ip address add {} dev {}", addr, name);
        Self::check(&state, HostStep::AddAddress, &cmd)?;
        Self::visible_link(&mut state, name, &cmd)?.addresses.push(addr);
        Ok(())
    }

    async fn delete_link(&self, name: &str) -> Result<()> {
        let mut state = self.state();
        state.calls.push(HostCall::DeleteLink(name.to_string()));
        let cmd = format!("ip link delete dev {}", name);
        Self::check(&state, HostStep::DeleteLink, &cmd)?;
        Self::visible_link(&mut state, name, &cmd)?;
        state.links.remove(name);
        state.deleted.push(name.to_string());
        Ok(())
    }

    async fn link_exists(&self, name: &str) -> Result<bool> {
        let state = self.state();
        Self::check(&state, HostStep::LinkExists, "if_nametoindex")?;
        Ok(state.links.contains_key(name) && !state.hidden.contains(name))
    }

    async fn spawn_switch(&self, spec: &SwitchSpec) -> Result<ProcessHandle> {
        let mut state = self.state();
        state.calls.push(HostCall::SpawnSwitch(spec.clone()));
        Self::check(&state, HostStep::SpawnSwitch, "vde_switch")?;

        let pid = Self::next_pid(&mut state);
        let (handle, exit) = ProcessHandle::simulated("vde_switch", pid);
        if state.switch_dies_on_start {
            exit.exit(1);
        }
        state.switches.push(exit);
        Ok(handle)
    }

    async fn spawn_plug(&self, socket_dir: &Path, tap: &str) -> Result<ProcessHandle> {
        let mut state = self.state();
        state
            .calls
            .push(HostCall::SpawnPlug(socket_dir.to_path_buf(), tap.to_string()));
        Self::check(&state, HostStep::SpawnPlug, "vde_plug2tap")?;

        let pid = Self::next_pid(&mut state);
        let (handle, exit) = ProcessHandle::simulated("vde_plug2tap", pid);
        state.plugs.push((tap.to_string(), exit));
        Ok(handle)
    }
}
