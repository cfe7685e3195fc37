//! Physical topology manager
//!
//! Handles:
//! - Building hosts, interfaces, bridges and applications from a description
//! - Computing the host start order (topological, ties by declaration order)
//! - Driving every host through lifecycle phases with a barrier per phase
//! - Persisting run state so a later process can tear the topology down
//! - Reaping every allocated OS object after a failed run

use crate::app::{AppType, ApplicationRegistry};
use crate::context::RunContext;
use crate::error::{Error, Result};
use crate::manifest::{self, HostDef, TopologyConfig};
use crate::net::naming::validate_ifname;
use crate::net::{Inventory, NetBackend, NetContext, RunScope};
use crate::topology::host::{HostInit, HostKind};
use crate::topology::{Bridge, Host, HostRegistry, HostState, Interface, InterfaceKind, PeerRef, Phase};

use crossbeam::channel;
use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Run state persisted between `startup` and `shutdown`
#[derive(Debug, Serialize, Deserialize)]
struct RunState {
    prefix: String,
    run_id: String,
    hosts: BTreeMap<String, HostState>,
    inventory: Inventory,
}

/// Manager for an emulated multi-host network
pub struct PhysicalTopologyManager {
    /// Hosts in start order
    hosts: Vec<Box<dyn Host>>,

    /// Dependency depth of each host, parallel to `hosts`
    levels: Vec<usize>,

    /// Host name -> position in `hosts`
    index: HashMap<String, usize>,

    run: RunContext,

    /// Concurrent host operations per phase
    workers: usize,

    state_file: Option<PathBuf>,
}

impl PhysicalTopologyManager {
    /// Load a description from disk and configure a manager for it
    pub fn from_file(path: &Path, backend: Arc<dyn NetBackend>) -> Result<Self> {
        let config = manifest::load(path)?;
        Self::configure(config, backend)
    }

    /// Configure a manager with the built-in host and application registries
    pub fn configure(config: TopologyConfig, backend: Arc<dyn NetBackend>) -> Result<Self> {
        Self::configure_with(
            config,
            backend,
            &HostRegistry::with_builtins(),
            &ApplicationRegistry::with_builtins(),
        )
    }

    /// Configure a manager with custom registries
    pub fn configure_with(
        mut config: TopologyConfig,
        backend: Arc<dyn NetBackend>,
        hosts: &HostRegistry,
        apps: &ApplicationRegistry,
    ) -> Result<Self> {
        config.normalize()?;
        config.validate()?;

        let scope = RunScope::new(config.config.prefix.clone(), config.config.run_id.clone())?;
        let mut run = RunContext::new(
            backend,
            scope,
            Duration::from_secs(config.config.command_timeout),
        );

        let mut kinds = HashMap::new();
        for def in &config.hosts {
            kinds.insert(def.name.as_str(), hosts.kind_of(&def.implementation)?);
        }
        check_host_kinds(&config, &kinds, run.scope())?;

        // Dependency graph: dep -> host, hypervisor -> vm
        let mut graph: DiGraph<usize, ()> = DiGraph::new();
        let nodes: HashMap<&str, NodeIndex> = config
            .hosts
            .iter()
            .enumerate()
            .map(|(i, def)| (def.name.as_str(), graph.add_node(i)))
            .collect();

        for def in &config.hosts {
            let to = nodes[def.name.as_str()];
            for dep in def.depends_on.iter().chain(&def.hypervisor) {
                let from = nodes.get(dep.as_str()).ok_or_else(|| Error::UnknownDependency {
                    host: def.name.clone(),
                    dependency: dep.clone(),
                })?;
                graph.update_edge(*from, to, ());
            }
        }

        toposort(&graph, None).map_err(|cycle| {
            Error::CyclicDependency(config.hosts[graph[cycle.node_id()]].name.clone())
        })?;
        let (order, depth) = start_order(&graph);

        // Instantiate hosts in declaration order
        let mut built: Vec<Option<Box<dyn Host>>> = Vec::with_capacity(config.hosts.len());
        for def in &config.hosts {
            let parent = def.hypervisor.as_ref().map(|hv| match kinds[hv.as_str()] {
                HostKind::Root => NetContext::Root,
                _ => NetContext::Namespace(run.scope().netns(hv)),
            });
            let init = HostInit {
                name: def.name.clone(),
                netns: run.scope().netns(&def.name),
                hypervisor: def.hypervisor.clone(),
                parent,
            };
            let mut host = hosts.build(&def.implementation, init)?;
            populate(host.as_mut(), def, &mut run, apps)?;
            built.push(Some(host));
        }

        register_guests(&config, &mut built)?;

        let mut ordered = Vec::with_capacity(built.len());
        let mut levels = Vec::with_capacity(built.len());
        let mut index = HashMap::new();
        for i in order {
            if let Some(host) = built[i].take() {
                index.insert(host.name().to_string(), ordered.len());
                ordered.push(host);
                levels.push(depth[i]);
            }
        }

        tracing::debug!(
            hosts = ordered.len(),
            run_id = run.scope().run_id(),
            workers = config.config.workers,
            "topology configured"
        );

        Ok(Self {
            hosts: ordered,
            levels,
            index,
            run,
            workers: config.config.workers,
            state_file: config.config.state_file,
        })
    }

    /// Override where run state is persisted
    pub fn set_state_file(&mut self, path: Option<PathBuf>) {
        self.state_file = path;
    }

    pub fn state_file(&self) -> Option<&Path> {
        self.state_file.as_deref()
    }

    pub fn run_context(&self) -> &RunContext {
        &self.run
    }

    /// Host names in start order
    pub fn host_by_start_order(&self) -> Vec<&str> {
        self.hosts.iter().map(|h| h.name()).collect()
    }

    /// Host names in stop order (reverse of start order)
    pub fn host_by_stop_order(&self) -> Vec<&str> {
        self.hosts.iter().rev().map(|h| h.name()).collect()
    }

    fn position(&self, name: &str) -> Result<usize> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| Error::HostNotFound(name.to_string()))
    }

    pub fn host(&self, name: &str) -> Result<&dyn Host> {
        let i = self.position(name)?;
        Ok(self.hosts[i].as_ref())
    }

    pub fn host_mut(&mut self, name: &str) -> Result<&mut dyn Host> {
        let i = self.position(name)?;
        let host: &mut dyn Host = self.hosts[i].as_mut();
        Ok(host)
    }

    pub fn hosts(&self) -> impl Iterator<Item = &(dyn Host + 'static)> {
        self.hosts.iter().map(|h| h.as_ref())
    }

    /// Peer two interfaces on different hosts
    ///
    /// Both hosts must still be before `net_up`.
    pub fn link_interfaces(
        &mut self,
        host_a: &str,
        iface_a: &str,
        host_b: &str,
        iface_b: &str,
    ) -> Result<()> {
        if host_a == host_b {
            return Err(Error::ArgumentMismatch(format!(
                "Cannot peer interfaces on the same host '{}'",
                host_a
            )));
        }
        let a = self.position(host_a)?;
        let b = self.position(host_b)?;

        // Check both sides before touching either
        for (i, local, remote) in [(a, iface_a, PeerRef::new(host_b, iface_b)), (b, iface_b, PeerRef::new(host_a, iface_a))] {
            let host = &self.hosts[i];
            let state = host.state();
            if !state.before_net_up() {
                return Err(Error::InvalidTransition {
                    host: host.name().to_string(),
                    event: "link_interface".to_string(),
                    state: state.to_string(),
                });
            }
            let iface = host.core().interfaces.get(local).ok_or_else(|| Error::InterfaceNotFound {
                host: host.name().to_string(),
                interface: local.to_string(),
            })?;
            if iface.kind == InterfaceKind::Tap {
                return Err(Error::ArgumentMismatch(format!(
                    "Tap interface '{}' on host '{}' cannot be peered",
                    local,
                    host.name()
                )));
            }
            if iface.peer.as_ref().is_some_and(|p| p != &remote) {
                return Err(Error::ArgumentMismatch(format!(
                    "Interface '{}/{}' is already peered",
                    host.name(),
                    local
                )));
            }
        }

        self.hosts[a].link_interface(iface_a, PeerRef::new(host_b, iface_b))?;
        self.hosts[b].link_interface(iface_b, PeerRef::new(host_a, iface_a))?;
        tracing::debug!(a = %PeerRef::new(host_a, iface_a), b = %PeerRef::new(host_b, iface_b), "interfaces linked");
        Ok(())
    }

    /// Bring the whole topology up: create, boot, net_up, net_finalize
    pub fn startup(&mut self) -> Result<()> {
        for phase in Phase::STARTUP {
            self.run_phase(phase)?;
        }
        tracing::info!(hosts = self.hosts.len(), "topology started");
        Ok(())
    }

    /// Tear the whole topology down: net_down, shutdown, remove
    pub fn shutdown(&mut self) -> Result<()> {
        for phase in Phase::SHUTDOWN {
            self.run_phase(phase)?;
        }
        self.clear_state()?;
        tracing::info!(hosts = self.hosts.len(), "topology shut down");
        Ok(())
    }

    /// Run one phase on every host, forward phases in start order and
    /// reverse phases in stop order
    ///
    /// Returns after every dispatched host finished; nothing after the first
    /// failure is dispatched.
    pub fn run_phase(&mut self, phase: Phase) -> Result<()> {
        tracing::info!(%phase, hosts = self.hosts.len(), workers = self.workers, "running phase");
        let result = execute_phase(&mut self.hosts, &self.levels, &self.run, phase, self.workers);
        self.persist(result)
    }

    /// Run one phase on a single host
    pub fn host_phase(&mut self, name: &str, phase: Phase) -> Result<()> {
        let i = self.position(name)?;
        let result = self.hosts[i].run_phase(&self.run, phase);
        self.persist(result)
    }

    fn persist(&self, result: Result<()>) -> Result<()> {
        if let Err(e) = self.save_state() {
            tracing::warn!(error = %e, "failed to persist run state");
            result?;
            return Err(e);
        }
        result
    }

    /// Delete every OS object recorded for this run
    ///
    /// Works regardless of how far startup got. Objects already gone are
    /// skipped, so reaping twice is harmless.
    pub fn reap(&mut self) -> Result<usize> {
        let result = self.run.inventory().reap(self.run.backend());
        let removed = match result {
            Ok(removed) => removed,
            Err(e) => {
                // Whatever could not be removed stays recorded for the next attempt
                if let Err(save) = self.save_state() {
                    tracing::warn!(error = %save, "failed to persist run state");
                }
                return Err(e);
            }
        };
        self.clear_state()?;
        tracing::info!(removed, "reaped run inventory");
        Ok(removed)
    }

    /// Restore host states and inventory from the state file
    ///
    /// Returns `false` when there is nothing to resume. No OS operation is
    /// performed.
    pub fn resume(&mut self) -> Result<bool> {
        let Some(path) = self.state_file.clone() else {
            return Ok(false);
        };
        if !path.exists() {
            return Ok(false);
        }

        let content = fs::read_to_string(&path).map_err(|e| Error::ConfigRead {
            path: path.clone(),
            source: e,
        })?;
        let saved: RunState = serde_json::from_str(&content)?;

        if saved.prefix != self.run.scope().prefix() {
            return Err(Error::ConfigValidation(format!(
                "State file '{}' belongs to prefix '{}', not '{}'",
                path.display(),
                saved.prefix,
                self.run.scope().prefix()
            )));
        }
        self.run
            .set_scope(RunScope::new(saved.prefix.clone(), Some(saved.run_id.clone()))?);

        for (name, state) in &saved.hosts {
            let i = self.position(name)?;
            self.hosts[i].core_mut().resume(*state)?;
        }
        self.run.replace_inventory(saved.inventory);

        tracing::info!(path = %path.display(), run_id = %saved.run_id, "resumed run state");
        Ok(true)
    }

    fn save_state(&self) -> Result<()> {
        let Some(path) = &self.state_file else {
            return Ok(());
        };
        let state = RunState {
            prefix: self.run.scope().prefix().to_string(),
            run_id: self.run.scope().run_id().to_string(),
            hosts: self
                .hosts
                .iter()
                .map(|h| (h.name().to_string(), h.state()))
                .collect(),
            inventory: self.run.inventory().clone(),
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, serde_json::to_string_pretty(&state)?)?;
        tracing::debug!(path = %path.display(), "run state saved");
        Ok(())
    }

    fn clear_state(&self) -> Result<()> {
        if let Some(path) = &self.state_file {
            if path.exists() {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }

    /// Print a validation summary to stdout
    pub fn check(&self) {
        // Configuration was already validated on configure
        println!("Configuration is valid.");

        println!("\nStart order:");
        for (i, host) in self.hosts.iter().enumerate() {
            println!("  {}. {} ({})", i + 1, host.name(), host.kind());
        }

        let interfaces: usize = self.hosts.iter().map(|h| h.core().interfaces.len()).sum();
        let bridges: usize = self.hosts.iter().map(|h| h.core().bridges.len()).sum();
        println!(
            "\nHosts: {}  Interfaces: {}  Bridges: {}  Workers: {}",
            self.hosts.len(),
            interfaces,
            bridges,
            self.workers
        );
    }

    /// Print the topology to stdout
    pub fn print_config(&self) {
        print!("{}", ConfigView(self));
    }

    /// Human readable view: Host -> Bridges / Interfaces / Applications
    pub fn render_config(&self) -> String {
        ConfigView(self).to_string()
    }

    /// Machine readable view of the topology
    pub fn config_json(&self) -> Result<String> {
        let hosts: Vec<HostView<'_>> = self.hosts.iter().map(|h| HostView::new(h.as_ref())).collect();
        let view = TopologyView {
            prefix: self.run.scope().prefix(),
            run_id: self.run.scope().run_id(),
            hosts,
        };
        Ok(serde_json::to_string_pretty(&view)?)
    }
}

#[derive(Serialize)]
struct TopologyView<'a> {
    prefix: &'a str,
    run_id: &'a str,
    hosts: Vec<HostView<'a>>,
}

#[derive(Serialize)]
struct HostView<'a> {
    name: &'a str,
    kind: String,
    state: HostState,
    depends_on: &'a [String],
    context: &'a NetContext,
    bridges: Vec<BridgeView<'a>>,
    interfaces: Vec<InterfaceView<'a>>,
    applications: Vec<ApplicationView<'a>>,
}

#[derive(Serialize)]
struct BridgeView<'a> {
    name: &'a str,
    members: Vec<&'a str>,
}

#[derive(Serialize)]
struct InterfaceView<'a> {
    name: &'a str,
    kind: InterfaceKind,
    addresses: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mac_address: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    linked_bridge: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    peer: Option<&'a PeerRef>,
    routes: &'a [crate::net::Route],
}

#[derive(Serialize)]
struct ApplicationView<'a> {
    name: &'a str,
    kind: &'static str,
    app_type: String,
    details: Vec<String>,
}

impl<'a> HostView<'a> {
    fn new(host: &'a dyn Host) -> Self {
        let core = host.core();
        Self {
            name: &core.name,
            kind: host.kind().to_string(),
            state: core.state(),
            depends_on: &core.depends_on,
            context: &core.net,
            bridges: core
                .bridges
                .values()
                .map(|b| BridgeView {
                    name: &b.name,
                    members: b.members.iter().map(String::as_str).collect(),
                })
                .collect(),
            interfaces: core
                .interfaces
                .values()
                .map(|i| InterfaceView {
                    name: &i.name,
                    kind: i.kind,
                    addresses: i.addresses.iter().map(|a| a.to_string()).collect(),
                    mac_address: i.mac_address.as_deref(),
                    linked_bridge: i.linked_bridge.as_deref(),
                    peer: i.peer.as_ref(),
                    routes: &i.routes,
                })
                .collect(),
            applications: core
                .applications
                .iter()
                .map(|a| ApplicationView {
                    name: a.name(),
                    kind: a.kind(),
                    app_type: a.app_type().to_string(),
                    details: a.describe(),
                })
                .collect(),
        }
    }
}

/// Checks that need the resolved host kinds
fn check_host_kinds(
    config: &TopologyConfig,
    kinds: &HashMap<&str, HostKind>,
    scope: &RunScope,
) -> Result<()> {
    let mut root_devices = HashSet::new();

    for def in &config.hosts {
        match (kinds[def.name.as_str()], &def.hypervisor) {
            (HostKind::Vm, None) => {
                return Err(Error::ConfigValidation(format!(
                    "VM host '{}' requires a hypervisor",
                    def.name
                )));
            }
            (HostKind::Vm, Some(_)) => {}
            (_, Some(hv)) => {
                return Err(Error::ConfigValidation(format!(
                    "Host '{}' is not a VM but names hypervisor '{}'",
                    def.name, hv
                )));
            }
            (_, None) => {}
        }

        // Root hosts share one link namespace, names carry the run prefix
        if kinds[def.name.as_str()] == HostKind::Root {
            let names = def
                .bridges
                .iter()
                .map(|b| &b.name)
                .chain(def.interfaces.iter().map(|i| &i.name));
            for name in names {
                let device = scope.root_name(name);
                validate_ifname(&device)?;
                if !root_devices.insert(device.clone()) {
                    return Err(Error::ConfigValidation(format!(
                        "Device '{}' is declared by more than one root host",
                        device
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Build interfaces, bridges and applications of one host
fn populate(
    host: &mut dyn Host,
    def: &HostDef,
    run: &mut RunContext,
    apps: &ApplicationRegistry,
) -> Result<()> {
    let core = host.core_mut();
    core.depends_on = def.depends_on.clone();

    for bridge in &def.bridges {
        core.bridges
            .insert(bridge.name.clone(), Bridge::new(bridge.name.clone()));
    }

    for idef in &def.interfaces {
        let serial = run.register_interface(&def.name, &idef.name);
        let mut iface = Interface::new(&idef.name, &def.name, idef.effective_kind(), serial);
        iface.addresses = idef.parsed_addresses()?;
        iface.routes = idef.routes.clone();
        iface.mac_address = idef.mac_address.clone();
        iface.linked_bridge = idef.linked_bridge.clone();
        iface.peer = idef.peer.clone();
        core.interfaces.insert(idef.name.clone(), iface);
    }

    let mut seen: HashSet<AppType> = HashSet::new();
    for adef in &def.applications {
        let app = apps.build(def, adef)?;
        let app_type = app.app_type();
        if app_type != AppType::Unknown && !app_type.multi_allowed() && !seen.insert(app_type) {
            return Err(Error::ConfigValidation(format!(
                "Host '{}' carries more than one {} application",
                def.name, app_type
            )));
        }
        core.applications.push(app);
    }
    Ok(())
}

/// Hand every VM host to its hypervisor's application
fn register_guests(config: &TopologyConfig, built: &mut [Option<Box<dyn Host>>]) -> Result<()> {
    let positions: HashMap<&str, usize> = config
        .hosts
        .iter()
        .enumerate()
        .map(|(i, h)| (h.name.as_str(), i))
        .collect();

    for def in &config.hosts {
        let Some(hv) = &def.hypervisor else {
            continue;
        };
        let host = built[positions[hv.as_str()]]
            .as_mut()
            .ok_or_else(|| Error::HostNotFound(hv.clone()))?;
        let app = host
            .core_mut()
            .applications
            .iter_mut()
            .find(|a| a.app_type() == AppType::Hypervisor)
            .ok_or_else(|| {
                Error::ConfigValidation(format!(
                    "Hypervisor host '{}' of VM '{}' carries no hypervisor application",
                    hv, def.name
                ))
            })?;
        app.register_guest(&def.name)?;
    }
    Ok(())
}

/// Topological order with ties broken by declaration order, plus the
/// dependency depth of every node
fn start_order(graph: &DiGraph<usize, ()>) -> (Vec<usize>, Vec<usize>) {
    let n = graph.node_count();
    let mut indegree: Vec<usize> = graph
        .node_indices()
        .map(|node| graph.neighbors_directed(node, Direction::Incoming).count())
        .collect();
    let mut ready: BinaryHeap<Reverse<usize>> = indegree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| Reverse(i))
        .collect();

    let mut order = Vec::with_capacity(n);
    let mut depth = vec![0; n];
    while let Some(Reverse(i)) = ready.pop() {
        let node = NodeIndex::new(i);
        depth[i] = graph
            .neighbors_directed(node, Direction::Incoming)
            .map(|dep| depth[dep.index()] + 1)
            .max()
            .unwrap_or(0);
        order.push(graph[node]);

        for next in graph.neighbors_directed(node, Direction::Outgoing) {
            let d = &mut indegree[next.index()];
            *d -= 1;
            if *d == 0 {
                ready.push(Reverse(next.index()));
            }
        }
    }
    (order, depth)
}

/// Phase barrier over all hosts
///
/// With one worker hosts run one at a time in start (or stop) order. With
/// more, hosts of equal dependency depth run concurrently and depths are
/// processed in order, so a host never runs a phase before its dependencies
/// (or, going down, after its dependents).
fn execute_phase(
    hosts: &mut [Box<dyn Host>],
    levels: &[usize],
    run: &RunContext,
    phase: Phase,
    workers: usize,
) -> Result<()> {
    let forward = phase.is_forward();

    if workers <= 1 {
        if forward {
            for host in hosts.iter_mut() {
                host.run_phase(run, phase)?;
            }
        } else {
            for host in hosts.iter_mut().rev() {
                host.run_phase(run, phase)?;
            }
        }
        return Ok(());
    }

    let depth = levels.iter().max().map_or(0, |d| d + 1);
    let waves: Vec<usize> = if forward {
        (0..depth).collect()
    } else {
        (0..depth).rev().collect()
    };

    for wave in waves {
        let mut batch: Vec<&mut Box<dyn Host>> = hosts
            .iter_mut()
            .zip(levels)
            .filter(|(_, level)| **level == wave)
            .map(|(host, _)| host)
            .collect();
        if !forward {
            batch.reverse();
        }
        run_batch(batch, run, phase, workers)?;
    }
    Ok(())
}

/// Run a phase on independent hosts with a bounded worker pool
fn run_batch(
    batch: Vec<&mut Box<dyn Host>>,
    run: &RunContext,
    phase: Phase,
    workers: usize,
) -> Result<()> {
    if batch.len() <= 1 {
        for host in batch {
            host.run_phase(run, phase)?;
        }
        return Ok(());
    }

    let abort = AtomicBool::new(false);
    let failure: Mutex<Option<Error>> = Mutex::new(None);
    let pool = workers.min(batch.len());
    let (tx, rx) = channel::bounded::<&mut Box<dyn Host>>(pool);

    let outcome = crossbeam::thread::scope(|s| {
        for _ in 0..pool {
            let rx = rx.clone();
            let abort = &abort;
            let failure = &failure;
            s.spawn(move |_| {
                for host in rx.iter() {
                    // Drain without running once something failed
                    if abort.load(Ordering::SeqCst) {
                        continue;
                    }
                    if let Err(e) = host.run_phase(run, phase) {
                        tracing::error!(host = %host.name(), %phase, error = %e, "phase failed");
                        abort.store(true, Ordering::SeqCst);
                        let mut slot = failure.lock().unwrap_or_else(PoisonError::into_inner);
                        if slot.is_none() {
                            *slot = Some(e);
                        }
                    }
                }
            });
        }
        drop(rx);

        for host in batch {
            if abort.load(Ordering::SeqCst) || tx.send(host).is_err() {
                break;
            }
        }
        drop(tx);
    });

    if let Err(panic) = outcome {
        std::panic::resume_unwind(panic);
    }

    match failure.into_inner().unwrap_or_else(PoisonError::into_inner) {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Text rendering of a configured topology
struct ConfigView<'a>(&'a PhysicalTopologyManager);

impl fmt::Display for ConfigView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scope = self.0.run.scope();
        writeln!(f, "Run: {} (prefix '{}')", scope.run_id(), scope.prefix())?;

        for host in &self.0.hosts {
            let core = host.core();
            writeln!(f, "Host: {} ({}) [{}]", core.name, host.kind(), core.state())?;
            for line in host.describe() {
                writeln!(f, "  {}", line)?;
            }
            if !core.depends_on.is_empty() {
                writeln!(f, "  Depends on: {}", core.depends_on.join(", "))?;
            }

            for bridge in core.bridges.values() {
                let members: Vec<&str> = bridge.members.iter().map(String::as_str).collect();
                writeln!(f, "  Bridge: {} members: [{}]", bridge.name, members.join(", "))?;
            }

            for iface in core.interfaces.values() {
                write!(f, "  Interface: {} ({})", iface.name, iface.kind)?;
                if !iface.addresses.is_empty() {
                    let addrs: Vec<String> = iface.addresses.iter().map(|a| a.to_string()).collect();
                    write!(f, " addresses: {}", addrs.join(", "))?;
                }
                if let Some(mac) = &iface.mac_address {
                    write!(f, " mac: {}", mac)?;
                }
                if let Some(bridge) = &iface.linked_bridge {
                    write!(f, " bridge: {}", bridge)?;
                }
                if let Some(peer) = &iface.peer {
                    write!(f, " peer: {}", peer)?;
                }
                writeln!(f)?;
                for route in &iface.routes {
                    match route.gateway {
                        Some(gw) => writeln!(f, "    Route: {} via {}", route.destination, gw)?,
                        None => writeln!(f, "    Route: {}", route.destination)?,
                    }
                }
            }

            for app in &core.applications {
                writeln!(f, "  Application: {} ({}, {})", app.name(), app.kind(), app.app_type())?;
                for line in app.describe() {
                    writeln!(f, "    {}", line)?;
                }
            }
        }
        Ok(())
    }
}
