//! Engine adapter that shells out to a `docker`-compatible binary.
//!
//! The adapter stays thin: argument assembly, JSON output parsing, and error
//! classification. All convergence decisions live above this seam.

use crate::engine::{
    ContainerEngine, ContainerRecord, ContainerStatus, CreateSpec, EngineEvent, EventAction,
    EventSubscription, LabelFilter, NetworkSpec, VolumeSpec,
};
use crate::EngineError;
use chrono::{DateTime, Utc};
use flotilla_schema::{Command as CommandLine, ContainerId};
use std::collections::BTreeMap;
use std::io::BufRead;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub struct DockerCliEngine {
    binary: String,
}

impl DockerCliEngine {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn run(&self, args: &[String]) -> Result<String, EngineError> {
        debug!("{} {}", self.binary, args.join(" "));
        let output = Command::new(&self.binary).args(args).output()?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
        } else {
            Err(classify_failure(&String::from_utf8_lossy(&output.stderr)))
        }
    }
}

fn classify_failure(stderr: &str) -> EngineError {
    let message = stderr.trim().to_owned();
    let lower = message.to_lowercase();
    if lower.contains("no such container") {
        EngineError::NoSuchContainer(message)
    } else if lower.contains("no such network")
        || (lower.contains("network") && lower.contains("not found"))
    {
        EngineError::NoSuchNetwork(message)
    } else if lower.contains("no such volume") {
        EngineError::NoSuchVolume(message)
    } else if lower.contains("no such image") {
        EngineError::NoSuchImage(message)
    } else if lower.contains("already in use") || lower.contains("conflict") {
        EngineError::NameConflict(message)
    } else {
        EngineError::Remote(message)
    }
}

fn owned(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| (*s).to_owned()).collect()
}

fn create_args(spec: &CreateSpec) -> Vec<String> {
    let mut args = vec!["create".to_owned(), "--name".to_owned(), spec.name.clone()];
    for (key, value) in &spec.labels {
        args.push("--label".to_owned());
        args.push(format!("{key}={value}"));
    }
    for (key, value) in &spec.env {
        args.push("--env".to_owned());
        args.push(format!("{key}={value}"));
    }
    for port in &spec.ports {
        let mut publish = String::new();
        if let Some(address) = &port.host_address {
            publish.push_str(address);
            publish.push(':');
        }
        if let Some(host_port) = port.host_port {
            publish.push_str(&host_port.to_string());
            publish.push(':');
        } else if port.host_address.is_some() {
            publish.push(':');
        }
        publish.push_str(&format!("{}/{}", port.container_port, port.protocol));
        args.push("--publish".to_owned());
        args.push(publish);
    }
    for mount in &spec.mounts {
        args.push("--volume".to_owned());
        let mut value = match &mount.source {
            Some(source) => format!("{source}:{}", mount.target),
            None => mount.target.clone(),
        };
        if mount.mode == flotilla_schema::MountMode::ReadOnly {
            value.push_str(":ro");
        }
        args.push(value);
    }
    for id in &spec.volumes_from {
        args.push("--volumes-from".to_owned());
        args.push(id.to_string());
    }
    for device in &spec.devices {
        args.push("--device".to_owned());
        args.push(device.clone());
    }
    if let Some(mode) = &spec.network_mode {
        args.push("--network".to_owned());
        args.push(mode.clone());
    } else if let Some((name, attachment)) = spec.networks.iter().next() {
        args.push("--network".to_owned());
        args.push(name.clone());
        for alias in &attachment.aliases {
            args.push("--network-alias".to_owned());
            args.push(alias.clone());
        }
        if let Some(ip) = &attachment.ipv4_address {
            args.push("--ip".to_owned());
            args.push(ip.clone());
        }
        if let Some(ip) = &attachment.ipv6_address {
            args.push("--ip6".to_owned());
            args.push(ip.clone());
        }
    }
    if let Some(restart) = &spec.restart {
        args.push("--restart".to_owned());
        args.push(restart.clone());
    }
    if let Some(signal) = &spec.stop_signal {
        args.push("--stop-signal".to_owned());
        args.push(signal.clone());
    }
    let mut trailing: Vec<String> = Vec::new();
    match &spec.entrypoint {
        None => {}
        Some(CommandLine::Shell(line)) => {
            args.push("--entrypoint".to_owned());
            args.push(line.clone());
        }
        Some(CommandLine::Exec(items)) if !items.is_empty() => {
            args.push("--entrypoint".to_owned());
            args.push(items[0].clone());
            trailing.extend(items[1..].iter().cloned());
        }
        Some(CommandLine::Exec(_)) => {}
    }
    args.push(spec.image.clone());
    args.extend(trailing);
    match &spec.command {
        None => {}
        Some(CommandLine::Shell(line)) => {
            args.push("/bin/sh".to_owned());
            args.push("-c".to_owned());
            args.push(line.clone());
        }
        Some(CommandLine::Exec(items)) => args.extend(items.iter().cloned()),
    }
    args
}

fn parse_record(value: &serde_json::Value) -> Result<ContainerRecord, EngineError> {
    let malformed = |what: &str| EngineError::Remote(format!("malformed inspect output: {what}"));
    let id = value
        .get("Id")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| malformed("Id"))?;
    let name = value
        .get("Name")
        .and_then(serde_json::Value::as_str)
        .map(|n| n.trim_start_matches('/').to_owned())
        .ok_or_else(|| malformed("Name"))?;
    let state = value.get("State").ok_or_else(|| malformed("State"))?;
    let status_str = state
        .get("Status")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| malformed("State.Status"))?;
    let status = match status_str {
        "created" => ContainerStatus::Created,
        "running" | "restarting" => ContainerStatus::Running,
        "paused" => ContainerStatus::Paused,
        "exited" | "removing" => ContainerStatus::Exited,
        _ => ContainerStatus::Dead,
    };
    let exit_code = if status == ContainerStatus::Exited {
        state.get("ExitCode").and_then(serde_json::Value::as_i64)
    } else {
        None
    };
    let config = value.get("Config").ok_or_else(|| malformed("Config"))?;
    let image = config
        .get("Image")
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default()
        .to_owned();
    let mut labels = BTreeMap::new();
    if let Some(map) = config.get("Labels").and_then(serde_json::Value::as_object) {
        for (key, val) in map {
            if let Some(val) = val.as_str() {
                labels.insert(key.clone(), val.to_owned());
            }
        }
    }
    let mut mounts = BTreeMap::new();
    if let Some(list) = value.get("Mounts").and_then(serde_json::Value::as_array) {
        for mount in list {
            let target = mount.get("Destination").and_then(serde_json::Value::as_str);
            let source = mount
                .get("Name")
                .and_then(serde_json::Value::as_str)
                .or_else(|| mount.get("Source").and_then(serde_json::Value::as_str));
            if let (Some(target), Some(source)) = (target, source) {
                mounts.insert(target.to_owned(), source.to_owned());
            }
        }
    }
    Ok(ContainerRecord {
        id: ContainerId::new(id),
        name,
        image,
        status,
        labels,
        mounts,
        exit_code,
    })
}

fn parse_event(line: &str) -> Option<EngineEvent> {
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    if value.get("Type").and_then(serde_json::Value::as_str) != Some("container") {
        return None;
    }
    let raw_action = value.get("Action").and_then(serde_json::Value::as_str)?;
    // Compound actions ("exec_create: ...") keep their prefix only.
    let action = EventAction::parse(raw_action.split(':').next().unwrap_or(raw_action).trim());
    let actor = value.get("Actor")?;
    let container_id = actor.get("ID").and_then(serde_json::Value::as_str)?;
    let attributes = actor
        .get("Attributes")
        .and_then(serde_json::Value::as_object);
    let mut labels = BTreeMap::new();
    let mut container_name = String::new();
    let mut image = String::new();
    if let Some(attributes) = attributes {
        for (key, val) in attributes {
            let Some(val) = val.as_str() else { continue };
            match key.as_str() {
                "name" => container_name = val.to_owned(),
                "image" => image = val.to_owned(),
                _ => {
                    labels.insert(key.clone(), val.to_owned());
                }
            }
        }
    }
    let seconds = value.get("time").and_then(serde_json::Value::as_i64)?;
    let timestamp = DateTime::<Utc>::from_timestamp(seconds, 0)?;
    Some(EngineEvent {
        timestamp,
        action,
        container_id: ContainerId::new(container_id),
        container_name,
        image,
        labels,
    })
}

impl ContainerEngine for DockerCliEngine {
    fn name(&self) -> &str {
        &self.binary
    }

    fn available(&self) -> bool {
        Command::new(&self.binary)
            .arg("version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    fn create_container(&self, spec: &CreateSpec) -> Result<ContainerId, EngineError> {
        let id = self.run(&create_args(spec))?;
        let id = ContainerId::new(id.lines().last().unwrap_or_default().trim());
        // Networks beyond the first attach after creation.
        if spec.network_mode.is_none() {
            for (network, attachment) in spec.networks.iter().skip(1) {
                let mut args = vec!["network".to_owned(), "connect".to_owned()];
                for alias in &attachment.aliases {
                    args.push("--alias".to_owned());
                    args.push(alias.clone());
                }
                if let Some(ip) = &attachment.ipv4_address {
                    args.push("--ip".to_owned());
                    args.push(ip.clone());
                }
                args.push(network.clone());
                args.push(id.to_string());
                self.run(&args)?;
            }
        }
        Ok(id)
    }

    fn start_container(&self, id: &ContainerId) -> Result<(), EngineError> {
        self.run(&owned(&["start", id.as_str()])).map(|_| ())
    }

    fn stop_container(
        &self,
        id: &ContainerId,
        stop_signal: Option<&str>,
    ) -> Result<(), EngineError> {
        let signal = stop_signal.unwrap_or("SIGTERM");
        self.run(&owned(&["kill", "--signal", signal, id.as_str()]))
            .map(|_| ())
    }

    fn kill_container(&self, id: &ContainerId) -> Result<(), EngineError> {
        self.run(&owned(&["kill", id.as_str()])).map(|_| ())
    }

    fn pause_container(&self, id: &ContainerId) -> Result<(), EngineError> {
        self.run(&owned(&["pause", id.as_str()])).map(|_| ())
    }

    fn unpause_container(&self, id: &ContainerId) -> Result<(), EngineError> {
        self.run(&owned(&["unpause", id.as_str()])).map(|_| ())
    }

    fn restart_container(&self, id: &ContainerId) -> Result<(), EngineError> {
        self.run(&owned(&["restart", id.as_str()])).map(|_| ())
    }

    fn rename_container(&self, id: &ContainerId, new_name: &str) -> Result<(), EngineError> {
        self.run(&owned(&["rename", id.as_str(), new_name]))
            .map(|_| ())
    }

    fn remove_container(&self, id: &ContainerId, remove_volumes: bool) -> Result<(), EngineError> {
        let mut args = vec!["rm".to_owned()];
        if remove_volumes {
            args.push("--volumes".to_owned());
        }
        args.push(id.to_string());
        self.run(&args).map(|_| ())
    }

    fn inspect_container(&self, id: &ContainerId) -> Result<ContainerRecord, EngineError> {
        let output = self.run(&owned(&["inspect", "--format", "{{json .}}", id.as_str()]))?;
        let value: serde_json::Value = serde_json::from_str(&output)?;
        parse_record(&value)
    }

    fn list_containers(
        &self,
        filter: &LabelFilter,
        all: bool,
    ) -> Result<Vec<ContainerRecord>, EngineError> {
        let mut args = vec!["ps".to_owned(), "--quiet".to_owned(), "--no-trunc".to_owned()];
        if all {
            args.push("--all".to_owned());
        }
        for (key, value) in filter.entries() {
            args.push("--filter".to_owned());
            args.push(format!("label={key}={value}"));
        }
        let output = self.run(&args)?;
        let mut records = Vec::new();
        for id in output.lines().filter(|line| !line.trim().is_empty()) {
            match self.inspect_container(&ContainerId::new(id.trim())) {
                Ok(record) => records.push(record),
                // Raced with removal between ps and inspect.
                Err(EngineError::NoSuchContainer(_)) => {}
                Err(other) => return Err(other),
            }
        }
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    fn wait_container(&self, id: &ContainerId, timeout: Duration) -> Result<bool, EngineError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.inspect_container(id) {
                Ok(record) if !record.status.is_running() => return Ok(true),
                // A container removed mid-wait has certainly exited.
                Err(EngineError::NoSuchContainer(_)) => return Ok(true),
                Err(other) => return Err(other),
                Ok(_) => {}
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(Duration::from_millis(200));
        }
    }

    fn create_network(&self, spec: &NetworkSpec) -> Result<(), EngineError> {
        let mut args = vec!["network".to_owned(), "create".to_owned()];
        if let Some(driver) = &spec.driver {
            args.push("--driver".to_owned());
            args.push(driver.clone());
        }
        for (key, value) in &spec.options {
            args.push("--opt".to_owned());
            args.push(format!("{key}={value}"));
        }
        for (key, value) in &spec.labels {
            args.push("--label".to_owned());
            args.push(format!("{key}={value}"));
        }
        for (subnet, gateway) in &spec.ipam_pools {
            if let Some(subnet) = subnet {
                args.push("--subnet".to_owned());
                args.push(subnet.clone());
            }
            if let Some(gateway) = gateway {
                args.push("--gateway".to_owned());
                args.push(gateway.clone());
            }
        }
        args.push(spec.name.clone());
        self.run(&args).map(|_| ())
    }

    fn remove_network(&self, name: &str) -> Result<(), EngineError> {
        self.run(&owned(&["network", "rm", name])).map(|_| ())
    }

    fn network_exists(&self, name: &str) -> Result<bool, EngineError> {
        match self.run(&owned(&["network", "inspect", name])) {
            Ok(_) => Ok(true),
            Err(EngineError::NoSuchNetwork(_)) => Ok(false),
            Err(EngineError::Remote(message)) if message.to_lowercase().contains("not found") => {
                Ok(false)
            }
            Err(other) => Err(other),
        }
    }

    fn create_volume(&self, spec: &VolumeSpec) -> Result<(), EngineError> {
        let mut args = vec!["volume".to_owned(), "create".to_owned()];
        if let Some(driver) = &spec.driver {
            args.push("--driver".to_owned());
            args.push(driver.clone());
        }
        for (key, value) in &spec.options {
            args.push("--opt".to_owned());
            args.push(format!("{key}={value}"));
        }
        for (key, value) in &spec.labels {
            args.push("--label".to_owned());
            args.push(format!("{key}={value}"));
        }
        args.push(spec.name.clone());
        self.run(&args).map(|_| ())
    }

    fn remove_volume(&self, name: &str) -> Result<(), EngineError> {
        self.run(&owned(&["volume", "rm", name])).map(|_| ())
    }

    fn volume_exists(&self, name: &str) -> Result<bool, EngineError> {
        match self.run(&owned(&["volume", "inspect", name])) {
            Ok(_) => Ok(true),
            Err(EngineError::NoSuchVolume(_)) => Ok(false),
            Err(EngineError::Remote(message)) if message.to_lowercase().contains("not found") => {
                Ok(false)
            }
            Err(other) => Err(other),
        }
    }

    fn remove_image(&self, reference: &str) -> Result<(), EngineError> {
        self.run(&owned(&["rmi", reference])).map(|_| ())
    }

    fn subscribe_events(&self, filter: &LabelFilter) -> Result<EventSubscription, EngineError> {
        let mut args = vec![
            "events".to_owned(),
            "--format".to_owned(),
            "{{json .}}".to_owned(),
        ];
        for (key, value) in filter.entries() {
            args.push("--filter".to_owned());
            args.push(format!("label={key}={value}"));
        }
        debug!("{} {}", self.binary, args.join(" "));
        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Remote("event feed has no stdout".to_owned()))?;

        let (sender, receiver) = mpsc::channel();
        std::thread::spawn(move || {
            let reader = std::io::BufReader::new(stdout);
            for line in reader.lines() {
                let Ok(line) = line else { break };
                match parse_event(&line) {
                    Some(event) => {
                        if sender.send(event).is_err() {
                            break;
                        }
                    }
                    None => warn!("unparseable engine event: {line}"),
                }
            }
        });
        Ok(EventSubscription::with_child(receiver, child))
    }
}
